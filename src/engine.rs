use std::sync::Arc;

use anyhow::Context;
use tracing::{debug, info};

use crate::error::{EngineError, EngineResult};
use crate::model::{assemble, ModelLeg};
use crate::protocol::TranslationModelPayload;
use crate::router::{dispatch, validate_chain, LanguagePair};
use crate::textutil::normalize;
use crate::unit::{Batch, InferenceUnit, ResponseOptions};

/// Worker-side translation state for one logical language pair.
///
/// Owns one model leg (direct) or two (source to pivot, pivot to target). Dropping the engine
/// releases every model and its aligned memory.
pub struct Engine {
    unit: Arc<dyn InferenceUnit>,
    pair: LanguagePair,
    legs: Vec<ModelLeg>,
}

impl Engine {
    pub fn new(
        unit: Arc<dyn InferenceUnit>,
        payloads: &[TranslationModelPayload],
    ) -> EngineResult<Self> {
        let pairs = payloads.iter().map(|p| p.pair()).collect::<Vec<_>>();
        let pair = validate_chain(&pairs)?;

        let mut legs = Vec::with_capacity(payloads.len());
        for payload in payloads {
            legs.push(assemble(&unit, payload)?);
        }
        info!(pair = %pair, legs = legs.len(), "translation engine ready");
        Ok(Self { unit, pair, legs })
    }

    pub fn pair(&self) -> &LanguagePair {
        &self.pair
    }

    pub fn leg_pairs(&self) -> Vec<LanguagePair> {
        self.legs.iter().map(|l| l.pair().clone()).collect()
    }

    pub fn is_pivot(&self) -> bool {
        self.legs.len() == 2
    }

    /// Translates `source_text`, keeping its leading and trailing whitespace untouched.
    pub fn translate(&self, source_text: &str, is_html: bool) -> EngineResult<String> {
        let text = normalize(source_text)?;
        let body = self.translate_body(&text.body, is_html)?;
        Ok(text.rewrap(&body))
    }

    fn translate_body(&self, body: &str, is_html: bool) -> EngineResult<String> {
        // The unit misbehaves on empty batches, so it never sees one.
        if body.is_empty() {
            return Ok(String::new());
        }
        debug!(pair = %self.pair, chars = body.chars().count(), is_html, "translate");

        let messages = Batch::messages(&self.unit, &[body])
            .context("create request batch")
            .map_err(|err| EngineError::translation(&err))?;
        let options = Batch::options(&self.unit, &[ResponseOptions::for_request(is_html)])
            .context("create options batch")
            .map_err(|err| EngineError::translation(&err))?;
        let responses = dispatch(&self.unit, &self.legs, &messages, &options)?;

        let count = self
            .unit
            .response_count(responses.handle())
            .map_err(|err| EngineError::translation(&err))?;
        if count == 0 {
            return Err(EngineError::Translation {
                message: "inference unit returned no responses".to_string(),
                trace: String::new(),
            });
        }
        self.unit
            .translated_text(responses.handle(), 0)
            .context("read translated text")
            .map_err(|err| EngineError::translation(&err))
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("pair", &self.pair)
            .field("legs", &self.legs)
            .finish()
    }
}
