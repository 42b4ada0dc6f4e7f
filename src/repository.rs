use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context};
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::protocol::{LanguageModelFiles, TranslationModelPayload};
use crate::router::{plan_legs, LanguagePair};

/// Reads model files laid out as `<root>/<src><trg>/...`.
#[derive(Clone, Debug)]
pub struct ModelRepository {
    root: PathBuf,
}

/// File names for one leg, e.g. for `esen`: `model.esen.intgemm.alphas.bin`.
#[derive(Clone, Debug)]
pub struct LegFileNames {
    pub dir: PathBuf,
    pub model: PathBuf,
    pub lex: PathBuf,
    pub vocab: PathBuf,
    pub srcvocab: PathBuf,
    pub trgvocab: PathBuf,
    pub quality_model: PathBuf,
}

impl ModelRepository {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn file_names(&self, pair: &LanguagePair) -> LegFileNames {
        let key = pair.key();
        let dir = self.root.join(&key);
        LegFileNames {
            model: dir.join(format!("model.{key}.intgemm.alphas.bin")),
            lex: dir.join(format!("lex.50.50.{key}.s2t.bin")),
            vocab: dir.join(format!("vocab.{key}.spm")),
            srcvocab: dir.join(format!("srcvocab.{key}.spm")),
            trgvocab: dir.join(format!("trgvocab.{key}.spm")),
            quality_model: dir.join(format!("qualityModel.{key}.bin")),
            dir,
        }
    }

    pub fn load_payload(&self, pair: &LanguagePair) -> anyhow::Result<TranslationModelPayload> {
        let names = self.file_names(pair);
        if !names.dir.is_dir() {
            return Err(anyhow!(
                "no models for {pair}: directory not found: {}",
                names.dir.display()
            ));
        }

        let mut files = LanguageModelFiles::new();
        files.insert("model", read_file(&names.model)?);
        files.insert("lex", read_file(&names.lex)?);
        if names.vocab.exists() {
            files.insert("vocab", read_file(&names.vocab)?);
        } else {
            files.insert("srcvocab", read_file(&names.srcvocab)?);
            files.insert("trgvocab", read_file(&names.trgvocab)?);
        }
        if names.quality_model.exists() {
            files.insert("qualityModel", read_file(&names.quality_model)?);
        }
        debug!(pair = %pair, files = files.len(), bytes = files.total_bytes(), "loaded model files");

        Ok(TranslationModelPayload {
            source_language: pair.source.clone(),
            target_language: pair.target.clone(),
            language_model_files: files,
        })
    }

    /// Payloads for every leg `pair` needs, in translation order.
    pub fn load_payloads(
        &self,
        pair: &LanguagePair,
        pivot: &str,
    ) -> anyhow::Result<Vec<TranslationModelPayload>> {
        plan_legs(pair, pivot)
            .iter()
            .map(|leg| self.load_payload(leg).with_context(|| format!("load models for {pair}")))
            .collect()
    }
}

fn read_file(path: &Path) -> anyhow::Result<Vec<u8>> {
    std::fs::read(path).with_context(|| format!("read model file: {}", path.display()))
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Reads the inference-unit binary. When `<path>.sha256` exists, its first token must equal the
/// binary's SHA-256.
pub fn load_inference_unit(path: &Path) -> anyhow::Result<Vec<u8>> {
    let binary = std::fs::read(path)
        .with_context(|| format!("read inference unit: {}", path.display()))?;

    let mut hash_path = path.as_os_str().to_owned();
    hash_path.push(".sha256");
    let hash_path = PathBuf::from(hash_path);
    if hash_path.exists() {
        let text = std::fs::read_to_string(&hash_path)
            .with_context(|| format!("read hash file: {}", hash_path.display()))?;
        let expected = text
            .split_whitespace()
            .next()
            .ok_or_else(|| anyhow!("unable to extract hash from {}", hash_path.display()))?
            .to_ascii_lowercase();
        let actual = sha256_hex(&binary);
        if actual != expected {
            return Err(anyhow!(
                "hash mismatch for {}: expected {expected}, received {actual}",
                path.display()
            ));
        }
        info!(path = %path.display(), "inference unit hash verified");
    }
    Ok(binary)
}
