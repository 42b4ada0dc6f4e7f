//! Controller side of the worker protocol.
//!
//! A [`Session`] holds no inference state. It sends `initialize` once, then at most one
//! `translate-request` at a time, and resolves callers from the worker's replies. Every reply is
//! fed through [`ControllerState::handle_message`], one transition per message tag.

use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::{mpsc, oneshot, watch, OwnedMutexGuard};
use tracing::{debug, error, info, warn};

use crate::error::{EngineError, EngineResult};
use crate::protocol::{ControllerMessage, EnginePayload, WorkerMessage};
use crate::router::LanguagePair;
use crate::unit::InferenceUnitLoader;
use crate::worker::spawn_worker;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Starting,
    AwaitingReady,
    Ready,
    AwaitingResponse,
    Terminated,
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum Readiness {
    Pending,
    Ready,
    Failed(EngineError),
}

/// The one outstanding request. Holding `_turn` keeps later callers queued until this call
/// settles, even if its own caller stops waiting.
struct PendingCall {
    reply: oneshot::Sender<EngineResult<String>>,
    _turn: OwnedMutexGuard<()>,
}

pub(crate) struct ControllerState {
    phase: SessionState,
    inbox: Option<mpsc::UnboundedSender<ControllerMessage>>,
    readiness: watch::Sender<Readiness>,
    pending: Option<PendingCall>,
}

impl ControllerState {
    fn new(readiness: watch::Sender<Readiness>) -> Self {
        Self {
            phase: SessionState::Starting,
            inbox: None,
            readiness,
            pending: None,
        }
    }

    fn send(&mut self, message: ControllerMessage) -> EngineResult<()> {
        let inbox = self
            .inbox
            .as_ref()
            .ok_or_else(|| EngineError::transport("session terminated"))?;
        let tag = message.tag();
        inbox
            .send(message)
            .map_err(|_| EngineError::transport(format!("worker is gone; could not send {tag}")))
    }

    fn attach(&mut self, inbox: mpsc::UnboundedSender<ControllerMessage>, payload: EnginePayload) {
        self.inbox = Some(inbox);
        match self.send(ControllerMessage::Initialize(payload)) {
            Ok(()) => self.phase = SessionState::AwaitingReady,
            Err(err) => self.handle_transport_error(err),
        }
    }

    fn begin_call(
        &mut self,
        source_text: &str,
        is_html: bool,
        turn: OwnedMutexGuard<()>,
    ) -> EngineResult<oneshot::Receiver<EngineResult<String>>> {
        match self.phase {
            SessionState::Ready => {}
            SessionState::Terminated => return Err(EngineError::transport("session terminated")),
            other => {
                return Err(EngineError::Internal(format!(
                    "cannot start a translation while {other:?}"
                )))
            }
        }
        if self.pending.is_some() {
            return Err(EngineError::Internal(
                "a translation is already outstanding".to_string(),
            ));
        }
        self.send(ControllerMessage::TranslateRequest {
            source_text: source_text.to_string(),
            is_html,
        })?;
        let (tx, rx) = oneshot::channel();
        self.pending = Some(PendingCall { reply: tx, _turn: turn });
        self.phase = SessionState::AwaitingResponse;
        Ok(rx)
    }

    fn settle(&mut self, result: EngineResult<String>) {
        match self.pending.take() {
            Some(call) => {
                // The caller may have given up waiting; nothing else to do then.
                let _ = call.reply.send(result);
                if self.phase == SessionState::AwaitingResponse {
                    self.phase = SessionState::Ready;
                }
            }
            None if self.phase == SessionState::Terminated => {}
            None => warn!("translation reply without an outstanding request"),
        }
    }

    pub(crate) fn handle_message(&mut self, message: WorkerMessage) {
        debug!(message = message.tag(), phase = ?self.phase, "controller received message");
        match message {
            WorkerMessage::InitializationSuccess => {
                if self.phase == SessionState::AwaitingReady {
                    self.phase = SessionState::Ready;
                    self.readiness.send_replace(Readiness::Ready);
                }
            }
            WorkerMessage::InitializationError { message } => {
                error!(error = %message, "worker failed to initialize");
                if self.phase != SessionState::Terminated {
                    self.readiness
                        .send_replace(Readiness::Failed(EngineError::Initialization(message)));
                    // Closing the inbox lets the worker thread exit and drop its unit.
                    self.inbox = None;
                    self.phase = SessionState::Terminated;
                }
            }
            WorkerMessage::TranslationResponse { target_text } => self.settle(Ok(target_text)),
            WorkerMessage::TranslationError { message, trace } => {
                self.settle(Err(EngineError::Translation { message, trace }))
            }
            WorkerMessage::Unknown => warn!("ignoring worker message of unknown type"),
        }
    }

    /// The worker is unreachable: reject readiness if still pending and any outstanding call.
    pub(crate) fn handle_transport_error(&mut self, err: EngineError) {
        if self.phase != SessionState::Terminated {
            error!(error = %err, "worker channel failed");
        }
        self.readiness.send_if_modified(|r| {
            if *r == Readiness::Pending {
                *r = Readiness::Failed(err.clone());
                true
            } else {
                false
            }
        });
        if let Some(call) = self.pending.take() {
            let _ = call.reply.send(Err(err));
        }
        self.inbox = None;
        self.phase = SessionState::Terminated;
    }
}

struct Shared {
    state: Mutex<ControllerState>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, ControllerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// A translation session for one language pair, backed by an isolated worker.
///
/// Concurrent `translate` calls are queued in arrival order; only one request is ever in flight.
pub struct Session {
    pair: LanguagePair,
    shared: Arc<Shared>,
    ready: watch::Receiver<Readiness>,
    turn: Arc<tokio::sync::Mutex<()>>,
}

impl Session {
    /// Spawns the worker and sends `initialize`. Must be called inside a Tokio runtime.
    pub fn spawn(
        pair: LanguagePair,
        loader: Arc<dyn InferenceUnitLoader>,
        payload: EnginePayload,
    ) -> anyhow::Result<Self> {
        let (ready_tx, ready_rx) = watch::channel(Readiness::Pending);
        let shared = Arc::new(Shared {
            state: Mutex::new(ControllerState::new(ready_tx)),
        });

        let worker = spawn_worker(
            &format!("bergamot-worker-{}-{}", pair.source, pair.target),
            loader,
        )?;
        info!(
            pair = %pair,
            legs = payload.translation_model_payloads.len(),
            "starting translation session"
        );
        shared.lock().attach(worker.inbox, payload);

        let dispatcher = Arc::clone(&shared);
        let mut outbox = worker.outbox;
        tokio::spawn(async move {
            while let Some(message) = outbox.recv().await {
                dispatcher.lock().handle_message(message);
            }
            dispatcher
                .lock()
                .handle_transport_error(EngineError::transport("worker terminated unexpectedly"));
        });

        Ok(Self {
            pair,
            shared,
            ready: ready_rx,
            turn: Arc::new(tokio::sync::Mutex::new(())),
        })
    }

    pub fn pair(&self) -> &LanguagePair {
        &self.pair
    }

    pub fn state(&self) -> SessionState {
        self.shared.lock().phase
    }

    /// Resolves once the worker has built its engine.
    pub async fn ready(&self) -> EngineResult<()> {
        let mut ready = self.ready.clone();
        let outcome = ready
            .wait_for(|r| *r != Readiness::Pending)
            .await
            .map(|r| (*r).clone())
            .map_err(|_| EngineError::transport("session dropped before it was ready"))?;
        match outcome {
            Readiness::Ready => Ok(()),
            Readiness::Failed(err) => Err(err),
            Readiness::Pending => Err(EngineError::Internal("readiness still pending".to_string())),
        }
    }

    pub async fn translate(&self, source_text: &str, is_html: bool) -> EngineResult<String> {
        self.ready().await?;
        let turn = Arc::clone(&self.turn).lock_owned().await;
        let reply = self.shared.lock().begin_call(source_text, is_html, turn)?;
        reply
            .await
            .map_err(|_| EngineError::transport("worker dropped the pending translation"))?
    }

    /// Stops the worker. Any pending call is rejected; calling this again does nothing.
    pub fn terminate(&self) {
        let mut state = self.shared.lock();
        if state.phase == SessionState::Terminated {
            return;
        }
        info!(pair = %self.pair, "terminating translation session");
        state.handle_transport_error(EngineError::transport("session terminated"));
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.terminate();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tokio::sync::{mpsc, oneshot, watch, OwnedMutexGuard};

    use super::{ControllerState, PendingCall, Readiness, SessionState};
    use crate::error::EngineError;
    use crate::protocol::{ControllerMessage, WorkerMessage};

    fn turn() -> OwnedMutexGuard<()> {
        Arc::new(tokio::sync::Mutex::new(()))
            .try_lock_owned()
            .expect("fresh mutex")
    }

    fn ready_state() -> (ControllerState, watch::Receiver<Readiness>, mpsc::UnboundedReceiver<ControllerMessage>) {
        let (ready_tx, ready_rx) = watch::channel(Readiness::Pending);
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        let mut state = ControllerState::new(ready_tx);
        state.inbox = Some(inbox_tx);
        state.phase = SessionState::AwaitingReady;
        state.handle_message(WorkerMessage::InitializationSuccess);
        (state, ready_rx, inbox_rx)
    }

    #[test]
    fn success_marks_ready() {
        let (state, ready, _inbox) = ready_state();
        assert_eq!(state.phase, SessionState::Ready);
        assert_eq!(*ready.borrow(), Readiness::Ready);
    }

    #[test]
    fn unknown_messages_are_ignored() {
        let (mut state, _ready, _inbox) = ready_state();
        state.handle_message(WorkerMessage::Unknown);
        assert_eq!(state.phase, SessionState::Ready);
    }

    #[test]
    fn response_resolves_pending_call() {
        let (mut state, _ready, mut inbox) = ready_state();
        let mut rx = state.begin_call("Hola", false, turn()).expect("begin");
        assert_eq!(state.phase, SessionState::AwaitingResponse);
        assert!(matches!(
            inbox.try_recv(),
            Ok(ControllerMessage::TranslateRequest { .. })
        ));

        state.handle_message(WorkerMessage::TranslationResponse {
            target_text: "Hello".into(),
        });
        assert_eq!(state.phase, SessionState::Ready);
        assert_eq!(rx.try_recv().expect("resolved"), Ok("Hello".to_string()));
    }

    #[test]
    fn second_call_never_clobbers_first() {
        let (mut state, _ready, _inbox) = ready_state();
        let _first = state.begin_call("uno", false, turn()).expect("begin");
        // Simulate the slot being occupied while the phase says Ready.
        state.phase = SessionState::Ready;
        let err = state.begin_call("dos", false, turn()).unwrap_err();
        assert!(matches!(err, EngineError::Internal(_)));
    }

    #[test]
    fn initialization_error_terminates() {
        let (ready_tx, ready_rx) = watch::channel(Readiness::Pending);
        let (inbox_tx, mut inbox_rx) = mpsc::unbounded_channel();
        let mut state = ControllerState::new(ready_tx);
        state.inbox = Some(inbox_tx);
        state.phase = SessionState::AwaitingReady;

        state.handle_message(WorkerMessage::InitializationError {
            message: "bad binary".into(),
        });
        assert_eq!(state.phase, SessionState::Terminated);
        assert!(state.inbox.is_none());
        assert!(matches!(
            inbox_rx.try_recv(),
            Err(mpsc::error::TryRecvError::Disconnected)
        ));
        assert_eq!(
            *ready_rx.borrow(),
            Readiness::Failed(EngineError::Initialization("bad binary".into()))
        );

        // The worker hanging up afterwards must not replace the initialization error.
        state.handle_transport_error(EngineError::transport("worker terminated unexpectedly"));
        assert_eq!(
            *ready_rx.borrow(),
            Readiness::Failed(EngineError::Initialization("bad binary".into()))
        );
    }

    #[test]
    fn transport_error_rejects_everything() {
        let (ready_tx, ready_rx) = watch::channel(Readiness::Pending);
        let mut state = ControllerState::new(ready_tx);
        let (tx, mut rx) = oneshot::channel();
        state.pending = Some(PendingCall {
            reply: tx,
            _turn: turn(),
        });
        state.handle_transport_error(EngineError::transport("worker crashed"));

        assert_eq!(state.phase, SessionState::Terminated);
        assert_eq!(
            *ready_rx.borrow(),
            Readiness::Failed(EngineError::transport("worker crashed"))
        );
        assert_eq!(
            rx.try_recv().expect("rejected"),
            Err(EngineError::transport("worker crashed"))
        );
    }

    #[test]
    fn translation_error_keeps_session_ready() {
        let (mut state, _ready, _inbox) = ready_state();
        let mut rx = state.begin_call("x", false, turn()).expect("begin");
        state.handle_message(WorkerMessage::TranslationError {
            message: "bad".into(),
            trace: "bad".into(),
        });
        assert_eq!(state.phase, SessionState::Ready);
        assert!(matches!(
            rx.try_recv().expect("settled"),
            Err(EngineError::Translation { .. })
        ));
    }
}
