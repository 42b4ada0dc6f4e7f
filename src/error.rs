use thiserror::Error;

/// Errors surfaced by the translation host.
///
/// Configuration problems are fatal at construction time. A `Translation` error only fails the
/// call that produced it; the session stays usable. A `Transport` error means the worker is gone
/// and the session has to be recreated.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("translation error: {message}")]
    Translation { message: String, trace: String },

    #[error("normalization error: {0}")]
    Normalization(String),

    #[error("initialization error: {0}")]
    Initialization(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl EngineError {
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport(msg.into())
    }

    /// Wraps a failure raised by the inference unit during a translate call.
    pub fn translation(err: &anyhow::Error) -> Self {
        Self::Translation {
            message: format!("{err:#}"),
            trace: render_chain(err.chain()),
        }
    }

    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Transport(_))
    }

    /// One cause per line, outermost first.
    pub fn trace(&self) -> String {
        match self {
            Self::Translation { trace, .. } => trace.clone(),
            other => render_chain(std::iter::once(other as &(dyn std::error::Error + 'static))),
        }
    }
}

fn render_chain<'a>(chain: impl Iterator<Item = &'a (dyn std::error::Error + 'static)>) -> String {
    chain
        .map(|cause| cause.to_string())
        .collect::<Vec<_>>()
        .join("\n")
}

pub type EngineResult<T> = Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::EngineError;
    use anyhow::Context;

    #[test]
    fn translation_error_keeps_cause_chain() {
        let err = Err::<(), _>(anyhow::anyhow!("segfault in gemm"))
            .context("translate batch")
            .unwrap_err();
        let err = EngineError::translation(&err);
        match &err {
            EngineError::Translation { message, trace } => {
                assert_eq!(message, "translate batch: segfault in gemm");
                assert_eq!(trace, "translate batch\nsegfault in gemm");
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(!err.is_transport());
    }

    #[test]
    fn non_translation_trace_is_display() {
        let err = EngineError::configuration("Vocabulary key is not found.");
        assert_eq!(
            err.trace(),
            "configuration error: Vocabulary key is not found."
        );
    }
}
