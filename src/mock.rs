//! In-memory stand-in for the inference unit.
//!
//! Translations come from a fixed table keyed by (source, target, text); unknown text is echoed
//! back unchanged. Every allocation, model and batch goes through a shared [`Ledger`] so tests
//! can assert that nothing leaks.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{anyhow, bail};

use crate::protocol::{LanguageModelFiles, TranslationModelPayload};
use crate::unit::{
    BatchHandle, InferenceUnit, InferenceUnitLoader, MemoryHandle, ModelConstruction, ModelHandle,
    ResponseOptions,
};

/// A model-construction call as seen by the unit.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Construction {
    pub source_language: String,
    pub target_language: String,
    pub config: String,
    pub vocab_count: usize,
    pub vocab_contents: Vec<Vec<u8>>,
    pub has_quality_model: bool,
}

enum BatchData {
    Messages(Vec<String>),
    Options(Vec<ResponseOptions>),
    Responses(Vec<(String, String)>),
}

#[derive(Default)]
struct LedgerState {
    next_id: u64,
    memory: HashMap<MemoryHandle, Vec<u8>>,
    allocations: Vec<(usize, usize)>,
    models: HashMap<ModelHandle, (String, String)>,
    constructions: Vec<Construction>,
    batches: HashMap<BatchHandle, BatchData>,
    batches_created: usize,
    direct_calls: usize,
    pivot_calls: usize,
    translated: Vec<String>,
    last_options: Option<ResponseOptions>,
    loads: usize,
}

impl LedgerState {
    fn next(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }
}

/// Shared accounting of everything the mock unit hands out.
#[derive(Clone, Default)]
pub struct Ledger(Arc<Mutex<LedgerState>>);

impl Ledger {
    fn lock(&self) -> MutexGuard<'_, LedgerState> {
        self.0.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// `(byte_length, alignment)` of every allocation ever made.
    pub fn allocations(&self) -> Vec<(usize, usize)> {
        self.lock().allocations.clone()
    }

    pub fn memory_contents(&self, memory: MemoryHandle) -> Option<Vec<u8>> {
        self.lock().memory.get(&memory).cloned()
    }

    pub fn live_memory(&self) -> usize {
        self.lock().memory.len()
    }

    pub fn live_models(&self) -> usize {
        self.lock().models.len()
    }

    pub fn live_batches(&self) -> usize {
        self.lock().batches.len()
    }

    pub fn batches_created(&self) -> usize {
        self.lock().batches_created
    }

    pub fn constructions(&self) -> Vec<Construction> {
        self.lock().constructions.clone()
    }

    pub fn direct_calls(&self) -> usize {
        self.lock().direct_calls
    }

    pub fn pivot_calls(&self) -> usize {
        self.lock().pivot_calls
    }

    /// Source texts in the order the unit translated them.
    pub fn translated(&self) -> Vec<String> {
        self.lock().translated.clone()
    }

    pub fn last_options(&self) -> Option<ResponseOptions> {
        self.lock().last_options
    }

    /// Number of units instantiated by the loader.
    pub fn loads(&self) -> usize {
        self.lock().loads
    }
}

#[derive(Clone, Default)]
struct Behaviour {
    table: HashMap<(String, String), BTreeMap<String, String>>,
    fail_construction: bool,
    fail_translate_on: Option<String>,
    panic_translate_on: Option<String>,
}

/// Fake inference unit; see the module docs.
pub struct MockUnit {
    ledger: Ledger,
    behaviour: Behaviour,
}

impl MockUnit {
    fn lookup(&self, source: &str, target: &str, text: &str) -> String {
        self.behaviour
            .table
            .get(&(source.to_string(), target.to_string()))
            .and_then(|t| t.get(text))
            .cloned()
            .unwrap_or_else(|| text.to_string())
    }

    fn model_pair(&self, model: ModelHandle) -> anyhow::Result<(String, String)> {
        self.ledger
            .lock()
            .models
            .get(&model)
            .cloned()
            .ok_or_else(|| anyhow!("unknown model handle {model:?}"))
    }

    fn request(
        &self,
        messages: BatchHandle,
        options: BatchHandle,
    ) -> anyhow::Result<Vec<String>> {
        let mut state = self.ledger.lock();
        let texts = match state.batches.get(&messages) {
            Some(BatchData::Messages(t)) => t.clone(),
            _ => bail!("{messages:?} is not a message batch"),
        };
        let opts = match state.batches.get(&options) {
            Some(BatchData::Options(o)) => o.clone(),
            _ => bail!("{options:?} is not an options batch"),
        };
        if texts.len() != opts.len() {
            bail!("{} messages but {} options", texts.len(), opts.len());
        }
        if texts.is_empty() {
            bail!("empty batch");
        }
        state.last_options = opts.last().copied();
        state.translated.extend(texts.iter().cloned());
        drop(state);

        for text in &texts {
            if self.behaviour.panic_translate_on.as_deref() == Some(text.as_str()) {
                panic!("inference unit crashed on {text:?}");
            }
            if self.behaviour.fail_translate_on.as_deref() == Some(text.as_str()) {
                bail!("inference unit failed on {text:?}");
            }
        }
        Ok(texts)
    }

    fn store_responses(&self, responses: Vec<(String, String)>) -> BatchHandle {
        let mut state = self.ledger.lock();
        let handle = BatchHandle(state.next());
        state.batches.insert(handle, BatchData::Responses(responses));
        state.batches_created += 1;
        handle
    }

    fn response(&self, responses: BatchHandle, index: usize) -> anyhow::Result<(String, String)> {
        match self.ledger.lock().batches.get(&responses) {
            Some(BatchData::Responses(r)) => r
                .get(index)
                .cloned()
                .ok_or_else(|| anyhow!("response index {index} out of range")),
            _ => Err(anyhow!("{responses:?} is not a response batch")),
        }
    }
}

impl InferenceUnit for MockUnit {
    fn allocate(&self, byte_length: usize, alignment: usize) -> anyhow::Result<MemoryHandle> {
        if !alignment.is_power_of_two() {
            bail!("alignment {alignment} is not a power of two");
        }
        let mut state = self.ledger.lock();
        let handle = MemoryHandle(state.next());
        state.memory.insert(handle, vec![0u8; byte_length]);
        state.allocations.push((byte_length, alignment));
        Ok(handle)
    }

    fn write_memory(&self, memory: MemoryHandle, bytes: &[u8]) -> anyhow::Result<()> {
        let mut state = self.ledger.lock();
        let buf = state
            .memory
            .get_mut(&memory)
            .ok_or_else(|| anyhow!("unknown memory handle {memory:?}"))?;
        if bytes.len() > buf.len() {
            bail!("write of {} bytes into {} byte buffer", bytes.len(), buf.len());
        }
        buf[..bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    fn free_memory(&self, memory: MemoryHandle) {
        self.ledger.lock().memory.remove(&memory);
    }

    fn construct_model(&self, args: &ModelConstruction<'_>) -> anyhow::Result<ModelHandle> {
        if self.behaviour.fail_construction {
            bail!("model construction rejected");
        }
        let mut state = self.ledger.lock();
        for handle in [args.model, args.lex]
            .iter()
            .chain(args.vocabs.iter())
            .chain(args.quality_model.iter())
        {
            if !state.memory.contains_key(handle) {
                bail!("model construction with freed memory {handle:?}");
            }
        }
        let vocab_contents = args
            .vocabs
            .iter()
            .filter_map(|h| state.memory.get(h).cloned())
            .collect();
        state.constructions.push(Construction {
            source_language: args.source_language.to_string(),
            target_language: args.target_language.to_string(),
            config: args.config.to_string(),
            vocab_count: args.vocabs.len(),
            vocab_contents,
            has_quality_model: args.quality_model.is_some(),
        });
        let handle = ModelHandle(state.next());
        state.models.insert(
            handle,
            (args.source_language.to_string(), args.target_language.to_string()),
        );
        Ok(handle)
    }

    fn delete_model(&self, model: ModelHandle) {
        self.ledger.lock().models.remove(&model);
    }

    fn create_messages(&self, texts: &[&str]) -> anyhow::Result<BatchHandle> {
        let mut state = self.ledger.lock();
        let handle = BatchHandle(state.next());
        let texts = texts.iter().map(|t| t.to_string()).collect();
        state.batches.insert(handle, BatchData::Messages(texts));
        state.batches_created += 1;
        Ok(handle)
    }

    fn create_options(&self, options: &[ResponseOptions]) -> anyhow::Result<BatchHandle> {
        let mut state = self.ledger.lock();
        let handle = BatchHandle(state.next());
        state.batches.insert(handle, BatchData::Options(options.to_vec()));
        state.batches_created += 1;
        Ok(handle)
    }

    fn translate(
        &self,
        model: ModelHandle,
        messages: BatchHandle,
        options: BatchHandle,
    ) -> anyhow::Result<BatchHandle> {
        let (source, target) = self.model_pair(model)?;
        self.ledger.lock().direct_calls += 1;
        let texts = self.request(messages, options)?;
        let responses = texts
            .into_iter()
            .map(|t| (self.lookup(&source, &target, &t), t))
            .collect();
        Ok(self.store_responses(responses))
    }

    fn translate_via_pivot(
        &self,
        first: ModelHandle,
        second: ModelHandle,
        messages: BatchHandle,
        options: BatchHandle,
    ) -> anyhow::Result<BatchHandle> {
        let (source, pivot) = self.model_pair(first)?;
        let (second_source, target) = self.model_pair(second)?;
        if pivot != second_source {
            bail!("pivot mismatch: {source}->{pivot} then {second_source}->{target}");
        }
        self.ledger.lock().pivot_calls += 1;
        let texts = self.request(messages, options)?;
        let responses = texts
            .into_iter()
            .map(|t| {
                let intermediate = self.lookup(&source, &pivot, &t);
                (self.lookup(&pivot, &target, &intermediate), t)
            })
            .collect();
        Ok(self.store_responses(responses))
    }

    fn response_count(&self, responses: BatchHandle) -> anyhow::Result<usize> {
        match self.ledger.lock().batches.get(&responses) {
            Some(BatchData::Responses(r)) => Ok(r.len()),
            _ => Err(anyhow!("{responses:?} is not a response batch")),
        }
    }

    fn translated_text(&self, responses: BatchHandle, index: usize) -> anyhow::Result<String> {
        self.response(responses, index).map(|(translated, _)| translated)
    }

    fn original_text(&self, responses: BatchHandle, index: usize) -> anyhow::Result<String> {
        self.response(responses, index).map(|(_, original)| original)
    }

    fn delete_batch(&self, batch: BatchHandle) {
        self.ledger.lock().batches.remove(&batch);
    }
}

/// Loader producing [`MockUnit`]s that all report into one [`Ledger`].
#[derive(Clone, Default)]
pub struct MockLoader {
    ledger: Ledger,
    behaviour: Behaviour,
    reject_binary: bool,
    panic_on_load: bool,
}

impl MockLoader {
    pub fn with_translation(mut self, source: &str, target: &str, text: &str, translated: &str) -> Self {
        self.behaviour
            .table
            .entry((source.to_string(), target.to_string()))
            .or_default()
            .insert(text.to_string(), translated.to_string());
        self
    }

    pub fn fail_construction(mut self) -> Self {
        self.behaviour.fail_construction = true;
        self
    }

    /// Makes translate calls whose source text equals `text` return an error.
    pub fn fail_translate_on(mut self, text: &str) -> Self {
        self.behaviour.fail_translate_on = Some(text.to_string());
        self
    }

    /// Makes translate calls whose source text equals `text` panic, killing the worker.
    pub fn panic_translate_on(mut self, text: &str) -> Self {
        self.behaviour.panic_translate_on = Some(text.to_string());
        self
    }

    /// Makes every `load` fail as if the binary were not a valid module.
    pub fn reject_binary(mut self) -> Self {
        self.reject_binary = true;
        self
    }

    /// Makes every `load` panic, so the worker dies before it can answer `initialize`.
    pub fn panic_on_load(mut self) -> Self {
        self.panic_on_load = true;
        self
    }

    pub fn ledger(&self) -> Ledger {
        self.ledger.clone()
    }

    /// A unit sharing this loader's ledger, without going through `load`.
    pub fn unit(&self) -> Arc<dyn InferenceUnit> {
        Arc::new(MockUnit {
            ledger: self.ledger.clone(),
            behaviour: self.behaviour.clone(),
        })
    }
}

impl InferenceUnitLoader for MockLoader {
    fn load(&self, binary: &[u8]) -> anyhow::Result<Arc<dyn InferenceUnit>> {
        if self.panic_on_load {
            panic!("inference unit crashed while loading");
        }
        if self.reject_binary || !binary.starts_with(WASM_MAGIC) {
            bail!("Error loading Bergamot WASM module.");
        }
        self.ledger.lock().loads += 1;
        Ok(self.unit())
    }
}

pub const WASM_MAGIC: &[u8] = b"\0asm";

/// Minimal file set with a shared vocabulary.
pub fn model_files() -> LanguageModelFiles {
    LanguageModelFiles::new()
        .with("model", vec![0x4du8; 512])
        .with("lex", vec![0x4cu8; 96])
        .with("vocab", b"VOCAB".to_vec())
}

pub fn leg_payload(source: &str, target: &str) -> TranslationModelPayload {
    TranslationModelPayload {
        source_language: source.to_string(),
        target_language: target.to_string(),
        language_model_files: model_files(),
    }
}

/// A binary the mock loader accepts.
pub fn unit_binary() -> Vec<u8> {
    let mut bin = WASM_MAGIC.to_vec();
    bin.extend_from_slice(&[1, 0, 0, 0]);
    bin
}
