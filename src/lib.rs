//! Host-side orchestration for a sandboxed neural machine translation unit.
//!
//! A [`Session`] talks to an isolated worker thread that owns the inference unit. The worker
//! stages model files into aligned memory, builds one model per leg (two when translating through
//! the pivot language), and answers translate requests one at a time.

pub mod config;
pub mod engine;
pub mod error;
pub mod host;
pub mod logging;
pub mod memory;
#[cfg(any(test, feature = "mock"))]
pub mod mock;
pub mod model;
pub mod protocol;
pub mod repository;
pub mod router;
pub mod session;
pub mod textutil;
pub mod unit;
pub mod worker;

pub use error::{EngineError, EngineResult};
pub use host::TranslationsHost;
pub use router::{LanguagePair, PIVOT_LANGUAGE};
pub use session::{Session, SessionState};
pub use unit::{InferenceUnit, InferenceUnitLoader};
