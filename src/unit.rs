//! Boundary to the sandboxed inference unit.
//!
//! The numerical engine itself is an external collaborator. Everything it owns (aligned memory,
//! constructed models, request/option/response batches) is referenced through opaque handles and
//! must be released explicitly; the guards in this module tie each release to a Rust scope.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

macro_rules! opaque_handle {
    ($name:ident) => {
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub u64);
    };
}

opaque_handle!(MemoryHandle);
opaque_handle!(ModelHandle);
opaque_handle!(BatchHandle);

/// Per-message response options understood by the inference unit.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseOptions {
    pub quality_scores: bool,
    pub alignment: bool,
    pub html: bool,
    pub sentence_mappings: bool,
}

impl ResponseOptions {
    pub fn for_request(is_html: bool) -> Self {
        Self {
            quality_scores: false,
            alignment: true,
            html: is_html,
            sentence_mappings: false,
        }
    }
}

/// Arguments of the model-construction entry point.
#[derive(Clone, Debug)]
pub struct ModelConstruction<'a> {
    pub source_language: &'a str,
    pub target_language: &'a str,
    pub config: &'a str,
    pub model: MemoryHandle,
    pub lex: MemoryHandle,
    pub vocabs: Vec<MemoryHandle>,
    pub quality_model: Option<MemoryHandle>,
}

/// The capability set consumed from the inference unit.
///
/// Methods take `&self`; implementations own whatever synchronisation they need. A unit is only
/// ever driven from the worker thread that instantiated it.
pub trait InferenceUnit: Send + Sync {
    fn allocate(&self, byte_length: usize, alignment: usize) -> anyhow::Result<MemoryHandle>;

    /// Copies `bytes` into the start of the allocation (the unit's byte view).
    fn write_memory(&self, memory: MemoryHandle, bytes: &[u8]) -> anyhow::Result<()>;

    fn free_memory(&self, memory: MemoryHandle);

    fn construct_model(&self, args: &ModelConstruction<'_>) -> anyhow::Result<ModelHandle>;

    fn delete_model(&self, model: ModelHandle);

    fn create_messages(&self, texts: &[&str]) -> anyhow::Result<BatchHandle>;

    fn create_options(&self, options: &[ResponseOptions]) -> anyhow::Result<BatchHandle>;

    fn translate(
        &self,
        model: ModelHandle,
        messages: BatchHandle,
        options: BatchHandle,
    ) -> anyhow::Result<BatchHandle>;

    /// Runs `first` then `second`, returning only the final-language responses.
    fn translate_via_pivot(
        &self,
        first: ModelHandle,
        second: ModelHandle,
        messages: BatchHandle,
        options: BatchHandle,
    ) -> anyhow::Result<BatchHandle>;

    fn response_count(&self, responses: BatchHandle) -> anyhow::Result<usize>;

    fn translated_text(&self, responses: BatchHandle, index: usize) -> anyhow::Result<String>;

    fn original_text(&self, responses: BatchHandle, index: usize) -> anyhow::Result<String>;

    fn delete_batch(&self, batch: BatchHandle);
}

/// Instantiates an inference unit from its binary. Runs inside the worker.
pub trait InferenceUnitLoader: Send + Sync {
    fn load(&self, binary: &[u8]) -> anyhow::Result<Arc<dyn InferenceUnit>>;
}

/// A buffer in the unit's address space; freed when dropped.
pub struct AlignedBuffer {
    unit: Arc<dyn InferenceUnit>,
    handle: MemoryHandle,
    len: usize,
    alignment: usize,
}

impl AlignedBuffer {
    pub fn allocate(
        unit: &Arc<dyn InferenceUnit>,
        byte_length: usize,
        alignment: usize,
    ) -> anyhow::Result<Self> {
        let handle = unit.allocate(byte_length, alignment)?;
        Ok(Self {
            unit: Arc::clone(unit),
            handle,
            len: byte_length,
            alignment,
        })
    }

    pub fn handle(&self) -> MemoryHandle {
        self.handle
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn alignment(&self) -> usize {
        self.alignment
    }

    pub fn copy_from(&mut self, bytes: &[u8]) -> anyhow::Result<()> {
        if bytes.len() != self.len {
            anyhow::bail!(
                "aligned buffer size mismatch: allocated={} source={}",
                self.len,
                bytes.len()
            );
        }
        self.unit.write_memory(self.handle, bytes)
    }
}

impl Drop for AlignedBuffer {
    fn drop(&mut self) {
        self.unit.free_memory(self.handle);
    }
}

impl std::fmt::Debug for AlignedBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AlignedBuffer")
            .field("handle", &self.handle)
            .field("len", &self.len)
            .field("alignment", &self.alignment)
            .finish()
    }
}

/// A request, options or response batch; deleted when dropped.
pub struct Batch {
    unit: Arc<dyn InferenceUnit>,
    handle: BatchHandle,
}

impl std::fmt::Debug for Batch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Batch").field("handle", &self.handle).finish()
    }
}

impl Batch {
    pub fn adopt(unit: &Arc<dyn InferenceUnit>, handle: BatchHandle) -> Self {
        Self {
            unit: Arc::clone(unit),
            handle,
        }
    }

    pub fn messages(unit: &Arc<dyn InferenceUnit>, texts: &[&str]) -> anyhow::Result<Self> {
        let handle = unit.create_messages(texts)?;
        Ok(Self::adopt(unit, handle))
    }

    pub fn options(
        unit: &Arc<dyn InferenceUnit>,
        options: &[ResponseOptions],
    ) -> anyhow::Result<Self> {
        let handle = unit.create_options(options)?;
        Ok(Self::adopt(unit, handle))
    }

    pub fn handle(&self) -> BatchHandle {
        self.handle
    }
}

impl Drop for Batch {
    fn drop(&mut self) {
        self.unit.delete_batch(self.handle);
    }
}
