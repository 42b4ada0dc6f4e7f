use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use tracing::info;

use crate::config::HostConfig;
use crate::protocol::EnginePayload;
use crate::repository::{load_inference_unit, ModelRepository};
use crate::router::LanguagePair;
use crate::session::Session;
use crate::unit::InferenceUnitLoader;

/// Creates translation sessions from on-disk models and an inference-unit binary.
///
/// Sessions share nothing with each other; each gets its own worker and its own copy of the
/// binary and model files.
pub struct TranslationsHost {
    repository: ModelRepository,
    inference_unit: PathBuf,
    pivot_language: String,
    loader: Arc<dyn InferenceUnitLoader>,
}

impl TranslationsHost {
    pub fn new(
        repository: ModelRepository,
        inference_unit: impl Into<PathBuf>,
        pivot_language: &str,
        loader: Arc<dyn InferenceUnitLoader>,
    ) -> Self {
        Self {
            repository,
            inference_unit: inference_unit.into(),
            pivot_language: pivot_language.to_string(),
            loader,
        }
    }

    pub fn from_config(cfg: &HostConfig, loader: Arc<dyn InferenceUnitLoader>) -> Self {
        Self::new(
            ModelRepository::new(&cfg.models_dir),
            &cfg.inference_unit,
            &cfg.pivot_language,
            loader,
        )
    }

    pub fn pivot_language(&self) -> &str {
        &self.pivot_language
    }

    /// Reads everything the worker needs and starts it. Readiness is reported through
    /// [`Session::ready`]; call inside a Tokio runtime.
    pub fn create_session(&self, source_language: &str, target_language: &str) -> anyhow::Result<Session> {
        let pair = LanguagePair::new(source_language, target_language);
        let binary = load_inference_unit(&self.inference_unit)?;
        let payloads = self
            .repository
            .load_payloads(&pair, &self.pivot_language)
            .with_context(|| format!("prepare session {pair}"))?;
        info!(pair = %pair, legs = payloads.len(), "creating translation session");

        Session::spawn(
            pair,
            Arc::clone(&self.loader),
            EnginePayload {
                inference_unit_binary: binary.into(),
                translation_model_payloads: payloads,
            },
        )
    }
}
