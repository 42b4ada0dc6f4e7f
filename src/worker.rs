use std::sync::Arc;
use std::thread::JoinHandle;

use anyhow::Context;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::engine::Engine;
use crate::error::{EngineError, EngineResult};
use crate::protocol::{ControllerMessage, EnginePayload, WorkerMessage};
use crate::unit::InferenceUnitLoader;

/// Controller-side ends of a running worker.
pub struct WorkerChannel {
    pub inbox: mpsc::UnboundedSender<ControllerMessage>,
    pub outbox: mpsc::UnboundedReceiver<WorkerMessage>,
    pub thread: JoinHandle<()>,
}

/// Starts a worker on its own OS thread. The worker owns the inference unit and the engine; the
/// two sides only exchange messages.
pub fn spawn_worker(
    name: &str,
    loader: Arc<dyn InferenceUnitLoader>,
) -> anyhow::Result<WorkerChannel> {
    let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
    let (outbox_tx, outbox_rx) = mpsc::unbounded_channel();
    let thread = std::thread::Builder::new()
        .name(name.to_string())
        .spawn(move || Worker::new(loader, outbox_tx).run(inbox_rx))
        .with_context(|| format!("spawn worker thread {name}"))?;
    Ok(WorkerChannel {
        inbox: inbox_tx,
        outbox: outbox_rx,
        thread,
    })
}

struct Worker {
    loader: Arc<dyn InferenceUnitLoader>,
    outbox: mpsc::UnboundedSender<WorkerMessage>,
    engine: Option<Engine>,
    initialized: bool,
}

impl Worker {
    fn new(loader: Arc<dyn InferenceUnitLoader>, outbox: mpsc::UnboundedSender<WorkerMessage>) -> Self {
        Self {
            loader,
            outbox,
            engine: None,
            initialized: false,
        }
    }

    /// Handles messages one at a time until the controller hangs up.
    fn run(mut self, mut inbox: mpsc::UnboundedReceiver<ControllerMessage>) {
        while let Some(message) = inbox.blocking_recv() {
            debug!(message = message.tag(), "worker received message");
            let reply = match message {
                ControllerMessage::Initialize(payload) => self.initialize(payload),
                ControllerMessage::TranslateRequest {
                    source_text,
                    is_html,
                } => Some(self.translate(&source_text, is_html)),
            };
            if let Some(reply) = reply {
                if self.outbox.send(reply).is_err() {
                    warn!("controller dropped the reply channel; stopping worker");
                    break;
                }
            }
        }
        debug!("worker inbox closed");
    }

    fn initialize(&mut self, payload: EnginePayload) -> Option<WorkerMessage> {
        if self.initialized {
            warn!("ignoring repeated initialize message");
            return None;
        }
        self.initialized = true;
        match self.build_engine(payload) {
            Ok(engine) => {
                info!(pair = %engine.pair(), pivot = engine.is_pivot(), "worker initialized");
                self.engine = Some(engine);
                Some(WorkerMessage::InitializationSuccess)
            }
            Err(err) => {
                error!(error = %err, "worker initialization failed");
                let message = match err {
                    EngineError::Initialization(message) => message,
                    other => other.to_string(),
                };
                Some(WorkerMessage::InitializationError { message })
            }
        }
    }

    fn build_engine(&self, payload: EnginePayload) -> EngineResult<Engine> {
        let unit = self
            .loader
            .load(payload.inference_unit_binary.as_bytes())
            .map_err(|err| EngineError::Initialization(format!("{err:#}")))?;
        Engine::new(unit, &payload.translation_model_payloads)
    }

    fn translate(&self, source_text: &str, is_html: bool) -> WorkerMessage {
        let result = match self.engine.as_ref() {
            Some(engine) => engine.translate(source_text, is_html),
            None => Err(EngineError::Internal(
                "translation requested before the engine was initialized".to_string(),
            )),
        };
        match result {
            Ok(target_text) => WorkerMessage::TranslationResponse { target_text },
            Err(err) => {
                warn!(error = %err, "translation failed");
                let message = match &err {
                    EngineError::Translation { message, .. } => message.clone(),
                    other => other.to_string(),
                };
                WorkerMessage::TranslationError {
                    message,
                    trace: err.trace(),
                }
            }
        }
    }
}
