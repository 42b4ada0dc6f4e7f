use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use tracing::debug;

use crate::error::{EngineError, EngineResult};
use crate::protocol::LanguageModelFiles;
use crate::unit::{AlignedBuffer, InferenceUnit};

/// Kinds of model file the inference unit knows how to consume.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ModelFileKind {
    Model,
    Lex,
    Vocab,
    SrcVocab,
    TrgVocab,
    QualityModel,
}

impl ModelFileKind {
    pub const ALL: [ModelFileKind; 6] = [
        Self::Model,
        Self::Lex,
        Self::Vocab,
        Self::SrcVocab,
        Self::TrgVocab,
        Self::QualityModel,
    ];

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.name() == name)
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Model => "model",
            Self::Lex => "lex",
            Self::Vocab => "vocab",
            Self::SrcVocab => "srcvocab",
            Self::TrgVocab => "trgvocab",
            Self::QualityModel => "qualityModel",
        }
    }

    /// Byte alignment the unit requires for this file's buffer.
    pub fn alignment(self) -> usize {
        match self {
            Self::Model => 256,
            _ => 64,
        }
    }
}

impl fmt::Display for ModelFileKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

pub fn alignment_for(file_type: &str) -> Option<usize> {
    ModelFileKind::from_name(file_type).map(ModelFileKind::alignment)
}

/// Checks a leg's file set without touching the unit: every file type must be known and a
/// vocabulary must be present, either shared or as a source/target pair.
pub fn check_file_set(files: &LanguageModelFiles) -> EngineResult<()> {
    for (file_type, _) in files.iter() {
        if ModelFileKind::from_name(file_type).is_none() {
            return Err(EngineError::configuration(format!("Unknown file type: \"{file_type}\"")));
        }
    }
    for kind in [ModelFileKind::Model, ModelFileKind::Lex] {
        if !files.contains(kind.name()) {
            return Err(EngineError::configuration(format!("missing model file: {kind}")));
        }
    }
    let split = files.contains("srcvocab") && files.contains("trgvocab");
    if !files.contains("vocab") && !split {
        return Err(EngineError::configuration("Vocabulary key is not found."));
    }
    Ok(())
}

/// Aligned copies of one leg's files. Buffers still held here are freed on drop.
#[derive(Debug, Default)]
pub struct StagedFiles {
    buffers: BTreeMap<ModelFileKind, AlignedBuffer>,
}

impl StagedFiles {
    pub fn get(&self, kind: ModelFileKind) -> Option<&AlignedBuffer> {
        self.buffers.get(&kind)
    }

    pub fn contains(&self, kind: ModelFileKind) -> bool {
        self.buffers.contains_key(&kind)
    }

    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    pub fn total_bytes(&self) -> usize {
        self.buffers.values().map(AlignedBuffer::len).sum()
    }
}

/// Copies every file of `files` verbatim into a fresh buffer at its file type's alignment.
///
/// On error, buffers allocated so far are released before returning.
pub fn stage(unit: &Arc<dyn InferenceUnit>, files: &LanguageModelFiles) -> EngineResult<StagedFiles> {
    let mut staged = StagedFiles::default();
    for (file_type, blob) in files.iter() {
        let kind = ModelFileKind::from_name(file_type).ok_or_else(|| {
            EngineError::configuration(format!("Unknown file type: \"{file_type}\""))
        })?;
        let mut buffer = AlignedBuffer::allocate(unit, blob.len(), kind.alignment())
            .map_err(|err| {
                EngineError::configuration(format!("allocate {kind} ({} bytes): {err:#}", blob.len()))
            })?;
        buffer.copy_from(blob.as_bytes()).map_err(|err| {
            EngineError::configuration(format!("copy {kind} into aligned memory: {err:#}"))
        })?;
        debug!(file = %kind, bytes = blob.len(), alignment = kind.alignment(), "staged model file");
        staged.buffers.insert(kind, buffer);
    }
    Ok(staged)
}

#[cfg(test)]
mod tests {
    use super::{alignment_for, check_file_set, stage, ModelFileKind};
    use crate::error::EngineError;
    use crate::mock::MockLoader;
    use crate::protocol::LanguageModelFiles;

    #[test]
    fn alignment_table() {
        assert_eq!(alignment_for("model"), Some(256));
        for name in ["lex", "vocab", "srcvocab", "trgvocab", "qualityModel"] {
            assert_eq!(alignment_for(name), Some(64), "{name}");
        }
        assert_eq!(alignment_for("weights"), None);
        assert_eq!(ModelFileKind::from_name("qualityModel"), Some(ModelFileKind::QualityModel));
    }

    #[test]
    fn stages_each_file_at_its_alignment() {
        let loader = MockLoader::default();
        let unit = loader.unit();
        let files = LanguageModelFiles::new()
            .with("model", vec![7u8; 1000])
            .with("lex", vec![1u8; 33])
            .with("vocab", vec![2u8; 17]);

        let staged = stage(&unit, &files).expect("stage");
        assert_eq!(staged.len(), 3);
        assert_eq!(staged.total_bytes(), 1050);

        let ledger = loader.ledger();
        let mut allocs = ledger.allocations();
        allocs.sort();
        assert_eq!(allocs, vec![(17, 64), (33, 64), (1000, 256)]);
        let model = staged.get(ModelFileKind::Model).expect("model buffer");
        assert_eq!(ledger.memory_contents(model.handle()), Some(vec![7u8; 1000]));
        assert_eq!(ledger.live_memory(), 3);

        drop(staged);
        assert_eq!(ledger.live_memory(), 0);
    }

    #[test]
    fn unknown_file_type_releases_partial_allocations() {
        let loader = MockLoader::default();
        let unit = loader.unit();
        // BTreeMap order: "lex" and "model" are staged before "zzz" is rejected.
        let files = LanguageModelFiles::new()
            .with("model", vec![0u8; 8])
            .with("lex", vec![0u8; 8])
            .with("zzz", vec![0u8; 8]);

        let err = stage(&unit, &files).unwrap_err();
        assert_eq!(err, EngineError::configuration("Unknown file type: \"zzz\""));
        let ledger = loader.ledger();
        assert_eq!(ledger.allocations().len(), 2);
        assert_eq!(ledger.live_memory(), 0);
    }

    #[test]
    fn each_staging_gets_its_own_copies() {
        let loader = MockLoader::default();
        let unit = loader.unit();
        let files = LanguageModelFiles::new().with("vocab", vec![9u8; 4]);
        let a = stage(&unit, &files).expect("stage a");
        let b = stage(&unit, &files).expect("stage b");
        let ha = a.get(ModelFileKind::Vocab).expect("a").handle();
        let hb = b.get(ModelFileKind::Vocab).expect("b").handle();
        assert_ne!(ha, hb);
        assert_eq!(loader.ledger().live_memory(), 2);
    }

    #[test]
    fn file_set_check_matches_staging_rules() {
        let shared = LanguageModelFiles::new()
            .with("model", vec![0u8; 4])
            .with("lex", vec![0u8; 4])
            .with("vocab", vec![0u8; 4]);
        assert!(check_file_set(&shared).is_ok());

        let split = LanguageModelFiles::new()
            .with("model", vec![0u8; 4])
            .with("lex", vec![0u8; 4])
            .with("srcvocab", vec![0u8; 4])
            .with("trgvocab", vec![0u8; 4]);
        assert!(check_file_set(&split).is_ok());

        let half = LanguageModelFiles::new()
            .with("model", vec![0u8; 4])
            .with("lex", vec![0u8; 4])
            .with("srcvocab", vec![0u8; 4]);
        assert_eq!(
            check_file_set(&half).unwrap_err(),
            EngineError::configuration("Vocabulary key is not found.")
        );

        let odd = shared.clone().with("weights", vec![0u8; 4]);
        assert_eq!(
            check_file_set(&odd).unwrap_err(),
            EngineError::configuration("Unknown file type: \"weights\"")
        );
    }
}
