//! Messages exchanged between the controller and the worker that owns the inference unit.
//!
//! The in-process channel moves these values by ownership; the serde forms are the JSON wire shape
//! (`{"type": "...", ...}`, camelCase fields, binary blobs as base64 strings).

use std::collections::BTreeMap;
use std::fmt;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::de::{self, Deserializer, Visitor};
use serde::{Deserialize, Serialize, Serializer};

use crate::router::LanguagePair;

/// Raw file bytes. Serialized as base64 and debug-printed as a length.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Blob(Vec<u8>);

impl Blob {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.0
    }
}

impl From<Vec<u8>> for Blob {
    fn from(v: Vec<u8>) -> Self {
        Self(v)
    }
}

impl From<&[u8]> for Blob {
    fn from(v: &[u8]) -> Self {
        Self(v.to_vec())
    }
}

impl fmt::Debug for Blob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Blob({} bytes)", self.0.len())
    }
}

impl Serialize for Blob {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&BASE64.encode(&self.0))
    }
}

impl<'de> Deserialize<'de> for Blob {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct BlobVisitor;

        impl Visitor<'_> for BlobVisitor {
            type Value = Blob;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a base64 string")
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<Blob, E> {
                BASE64.decode(v).map(Blob).map_err(E::custom)
            }
        }

        deserializer.deserialize_str(BlobVisitor)
    }
}

/// Named binary files for one leg, keyed by file type (`model`, `lex`, `vocab`, ...).
///
/// Keys are not validated here; the stager rejects file types it has no alignment for.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LanguageModelFiles(BTreeMap<String, Blob>);

impl LanguageModelFiles {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, file_type: &str, bytes: impl Into<Blob>) -> Self {
        self.insert(file_type, bytes);
        self
    }

    pub fn insert(&mut self, file_type: &str, bytes: impl Into<Blob>) {
        self.0.insert(file_type.to_string(), bytes.into());
    }

    pub fn get(&self, file_type: &str) -> Option<&Blob> {
        self.0.get(file_type)
    }

    pub fn contains(&self, file_type: &str) -> bool {
        self.0.contains_key(file_type)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Blob)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn total_bytes(&self) -> usize {
        self.0.values().map(Blob::len).sum()
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TranslationModelPayload {
    pub source_language: String,
    pub target_language: String,
    pub language_model_files: LanguageModelFiles,
}

impl TranslationModelPayload {
    pub fn pair(&self) -> LanguagePair {
        LanguagePair::new(&self.source_language, &self.target_language)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnginePayload {
    pub inference_unit_binary: Blob,
    pub translation_model_payloads: Vec<TranslationModelPayload>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ControllerMessage {
    Initialize(EnginePayload),
    #[serde(rename_all = "camelCase")]
    TranslateRequest {
        source_text: String,
        #[serde(rename = "isHTML")]
        is_html: bool,
    },
}

impl ControllerMessage {
    pub fn tag(&self) -> &'static str {
        match self {
            Self::Initialize(_) => "initialize",
            Self::TranslateRequest { .. } => "translate-request",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum WorkerMessage {
    InitializationSuccess,
    InitializationError {
        message: String,
    },
    #[serde(rename_all = "camelCase")]
    TranslationResponse {
        target_text: String,
    },
    TranslationError {
        message: String,
        trace: String,
    },
    /// Any tag this controller does not know about.
    #[serde(other)]
    Unknown,
}

impl WorkerMessage {
    pub fn tag(&self) -> &'static str {
        match self {
            Self::InitializationSuccess => "initialization-success",
            Self::InitializationError { .. } => "initialization-error",
            Self::TranslationResponse { .. } => "translation-response",
            Self::TranslationError { .. } => "translation-error",
            Self::Unknown => "unknown",
        }
    }

    pub fn from_json(text: &str) -> serde_json::Result<Self> {
        serde_json::from_str(text)
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}
