use std::sync::Arc;

use tracing::{debug, info};

use crate::error::{EngineError, EngineResult};
use crate::memory::{stage, ModelFileKind, StagedFiles};
use crate::protocol::TranslationModelPayload;
use crate::router::LanguagePair;
use crate::unit::{InferenceUnit, MemoryHandle, ModelConstruction, ModelHandle};

/// Decoder options applied to every model, independent of the language pair.
pub const DECODER_OPTIONS: [(&str, &str); 13] = [
    ("beam-size", "1"),
    ("normalize", "1.0"),
    ("word-penalty", "0"),
    ("max-length-break", "128"),
    ("mini-batch-words", "1024"),
    ("workspace", "128"),
    ("max-length-factor", "2.0"),
    ("skip-cost", "true"),
    ("cpu-threads", "0"),
    ("quiet", "true"),
    ("quiet-translation", "true"),
    ("gemm-precision", "int8shiftAlphaAll"),
    ("alignment", "soft"),
];

const CONFIG_INDENT: &str = "            ";

/// Renders [`DECODER_OPTIONS`] as the YAML-ish text block the unit parses.
pub fn decoder_config() -> String {
    let mut out = String::from("\n");
    for (key, value) in DECODER_OPTIONS {
        out.push_str(CONFIG_INDENT);
        out.push_str(key);
        out.push_str(": ");
        out.push_str(value);
        out.push('\n');
    }
    out.push_str(CONFIG_INDENT);
    out
}

/// Vocabulary argument: a lone shared `vocab` wins; otherwise `srcvocab` then `trgvocab`.
pub fn vocab_list(staged: &StagedFiles) -> EngineResult<Vec<MemoryHandle>> {
    if let Some(vocab) = staged.get(ModelFileKind::Vocab) {
        return Ok(vec![vocab.handle()]);
    }
    match (
        staged.get(ModelFileKind::SrcVocab),
        staged.get(ModelFileKind::TrgVocab),
    ) {
        (Some(src), Some(trg)) => Ok(vec![src.handle(), trg.handle()]),
        _ => Err(EngineError::configuration("Vocabulary key is not found.")),
    }
}

fn required(staged: &StagedFiles, kind: ModelFileKind) -> EngineResult<MemoryHandle> {
    staged
        .get(kind)
        .map(|b| b.handle())
        .ok_or_else(|| EngineError::configuration(format!("missing model file: {kind}")))
}

/// One constructed translation direction together with the aligned memory backing it.
///
/// Dropping the leg deletes the model first and then frees its buffers.
pub struct ModelLeg {
    unit: Arc<dyn InferenceUnit>,
    pair: LanguagePair,
    handle: ModelHandle,
    files: StagedFiles,
}

impl ModelLeg {
    pub fn pair(&self) -> &LanguagePair {
        &self.pair
    }

    pub fn handle(&self) -> ModelHandle {
        self.handle
    }

    pub fn staged_bytes(&self) -> usize {
        self.files.total_bytes()
    }
}

impl Drop for ModelLeg {
    fn drop(&mut self) {
        self.unit.delete_model(self.handle);
        debug!(pair = %self.pair, "translation model released");
    }
}

impl std::fmt::Debug for ModelLeg {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelLeg")
            .field("pair", &self.pair)
            .field("handle", &self.handle)
            .field("files", &self.files)
            .finish()
    }
}

/// Stages the payload's files and constructs the model for that leg.
pub fn assemble(
    unit: &Arc<dyn InferenceUnit>,
    payload: &TranslationModelPayload,
) -> EngineResult<ModelLeg> {
    let pair = payload.pair();
    let files = stage(unit, &payload.language_model_files)?;
    let vocabs = vocab_list(&files)?;
    let model = required(&files, ModelFileKind::Model)?;
    let lex = required(&files, ModelFileKind::Lex)?;
    let config = decoder_config();

    let args = ModelConstruction {
        source_language: &pair.source,
        target_language: &pair.target,
        config: &config,
        model,
        lex,
        vocabs,
        quality_model: files.get(ModelFileKind::QualityModel).map(|b| b.handle()),
    };
    let handle = unit.construct_model(&args).map_err(|err| {
        EngineError::configuration(format!("construct translation model {pair}: {err:#}"))
    })?;
    info!(pair = %pair, bytes = files.total_bytes(), "translation model constructed");

    Ok(ModelLeg {
        unit: Arc::clone(unit),
        pair,
        handle,
        files,
    })
}

#[cfg(test)]
mod tests {
    use super::{assemble, decoder_config};
    use crate::error::EngineError;
    use crate::mock::{model_files, MockLoader};
    use crate::protocol::{LanguageModelFiles, TranslationModelPayload};

    fn payload(files: LanguageModelFiles) -> TranslationModelPayload {
        TranslationModelPayload {
            source_language: "es".into(),
            target_language: "en".into(),
            language_model_files: files,
        }
    }

    #[test]
    fn config_block_format() {
        let cfg = decoder_config();
        assert!(cfg.starts_with("\n            beam-size: 1\n"));
        assert!(cfg.contains("            gemm-precision: int8shiftAlphaAll\n"));
        assert!(cfg.contains("            cpu-threads: 0\n"));
        assert!(cfg.ends_with("alignment: soft\n            "));
        assert_eq!(cfg.lines().filter(|l| l.contains(": ")).count(), 13);
    }

    #[test]
    fn single_vocab_is_one_element_list() {
        let loader = MockLoader::default();
        let unit = loader.unit();
        let leg = assemble(&unit, &payload(model_files())).expect("assemble");

        let ledger = loader.ledger();
        let built = ledger.constructions();
        assert_eq!(built.len(), 1);
        assert_eq!(built[0].source_language, "es");
        assert_eq!(built[0].target_language, "en");
        assert_eq!(built[0].vocab_count, 1);
        assert!(!built[0].has_quality_model);
        assert_eq!(built[0].config, decoder_config());
        assert_eq!(leg.pair().key(), "esen");
    }

    #[test]
    fn split_vocab_is_source_then_target() {
        let loader = MockLoader::default();
        let unit = loader.unit();
        let files = LanguageModelFiles::new()
            .with("model", vec![1u8; 4])
            .with("lex", vec![2u8; 4])
            .with("srcvocab", b"SRC".to_vec())
            .with("trgvocab", b"TRG".to_vec())
            .with("qualityModel", vec![3u8; 4]);
        assemble(&unit, &payload(files)).expect("assemble");

        let built = loader.ledger().constructions();
        assert_eq!(built[0].vocab_contents, vec![b"SRC".to_vec(), b"TRG".to_vec()]);
        assert!(built[0].has_quality_model);
    }

    #[test]
    fn shared_vocab_wins_over_split_vocab() {
        let loader = MockLoader::default();
        let unit = loader.unit();
        let files = model_files()
            .with("srcvocab", b"SRC".to_vec())
            .with("trgvocab", b"TRG".to_vec());
        assemble(&unit, &payload(files)).expect("assemble");

        let built = loader.ledger().constructions();
        assert_eq!(built[0].vocab_count, 1);
        assert_eq!(built[0].vocab_contents, vec![b"VOCAB".to_vec()]);
    }

    #[test]
    fn missing_or_partial_vocab_is_rejected_without_leaks() {
        for files in [
            LanguageModelFiles::new()
                .with("model", vec![1u8; 4])
                .with("lex", vec![2u8; 4]),
            LanguageModelFiles::new()
                .with("model", vec![1u8; 4])
                .with("lex", vec![2u8; 4])
                .with("srcvocab", vec![3u8; 4]),
        ] {
            let loader = MockLoader::default();
            let unit = loader.unit();
            let err = assemble(&unit, &payload(files)).unwrap_err();
            assert_eq!(err, EngineError::configuration("Vocabulary key is not found."));
            assert_eq!(loader.ledger().live_memory(), 0);
            assert!(loader.ledger().constructions().is_empty());
        }
    }

    #[test]
    fn leg_drop_releases_model_and_buffers() {
        let loader = MockLoader::default();
        let unit = loader.unit();
        let leg = assemble(&unit, &payload(model_files())).expect("assemble");
        let ledger = loader.ledger();
        assert_eq!(ledger.live_models(), 1);
        assert_eq!(ledger.live_memory(), 3);
        drop(leg);
        assert_eq!(ledger.live_models(), 0);
        assert_eq!(ledger.live_memory(), 0);
    }

    #[test]
    fn construction_failure_releases_buffers() {
        let loader = MockLoader::default().fail_construction();
        let unit = loader.unit();
        let err = assemble(&unit, &payload(model_files())).unwrap_err();
        assert!(matches!(err, EngineError::Configuration(_)));
        assert_eq!(loader.ledger().live_memory(), 0);
    }
}
