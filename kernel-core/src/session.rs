use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use tether_kernel_protocol::{CancelledEvent, Event, EventMsg, StartEvent};
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// The only path from a session to the client.
///
/// Every message goes through one lock so that a cancel racing with an
/// in-flight emit can never let a progress event slip out after `cancelled`.
#[derive(Debug)]
pub struct SessionEmitter {
    stream_id: String,
    sender_key: String,
    cancel: CancellationToken,
    event_tx: UnboundedSender<Event>,
    state: Mutex<EmitterState>,
}

#[derive(Debug, Default)]
struct EmitterState {
    terminated: bool,
    started: bool,
}

impl SessionEmitter {
    pub fn new(
        stream_id: impl Into<String>,
        sender_key: impl Into<String>,
        event_tx: UnboundedSender<Event>,
    ) -> Self {
        Self {
            stream_id: stream_id.into(),
            sender_key: sender_key.into(),
            cancel: CancellationToken::new(),
            event_tx,
            state: Mutex::new(EmitterState::default()),
        }
    }

    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    pub fn sender_key(&self) -> &str {
        &self.sender_key
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Token observed by the stream loop and, through child tokens, by side tasks.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn is_terminated(&self) -> bool {
        self.lock_state().terminated
    }

    /// Sends a progress message. Returns false once the session is cancelled or closed.
    pub fn emit(&self, msg: EventMsg) -> bool {
        if msg.is_terminal() {
            return self.finish(msg);
        }
        let state = self.lock_state();
        if state.terminated || self.cancel.is_cancelled() {
            return false;
        }
        self.send(msg)
    }

    /// Emits `start` the first time only; retried attempts reuse the opening event.
    pub fn emit_start(&self, id: &str, role: &str) -> bool {
        let mut state = self.lock_state();
        if state.started || state.terminated || self.cancel.is_cancelled() {
            return false;
        }
        state.started = true;
        self.send(EventMsg::Start(StartEvent {
            id: id.to_string(),
            role: role.to_string(),
        }))
    }

    /// Sends the single terminal message of the session.
    pub fn finish(&self, msg: EventMsg) -> bool {
        if matches!(msg, EventMsg::Cancelled(_)) {
            return self.cancel();
        }
        let mut state = self.lock_state();
        if state.terminated || self.cancel.is_cancelled() {
            debug!(stream_id = %self.stream_id, "dropping terminal event for closed session");
            return false;
        }
        state.terminated = true;
        self.send(msg)
    }

    /// Marks the session cancelled and delivers exactly one `cancelled` event.
    pub fn cancel(&self) -> bool {
        let mut state = self.lock_state();
        self.cancel.cancel();
        if state.terminated {
            return false;
        }
        state.terminated = true;
        self.send(EventMsg::Cancelled(CancelledEvent {
            stream_id: self.stream_id.clone(),
        }))
    }

    fn send(&self, msg: EventMsg) -> bool {
        self.event_tx
            .send(Event {
                stream_id: self.stream_id.clone(),
                sender_key: self.sender_key.clone(),
                msg,
            })
            .is_ok()
    }

    fn lock_state(&self) -> MutexGuard<'_, EmitterState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

pub struct StreamSession {
    emitter: Arc<SessionEmitter>,
    task: Option<JoinHandle<()>>,
}

impl StreamSession {
    pub fn new(emitter: Arc<SessionEmitter>, task: Option<JoinHandle<()>>) -> Self {
        Self { emitter, task }
    }

    pub fn id(&self) -> &str {
        self.emitter.stream_id()
    }

    pub fn sender_key(&self) -> &str {
        self.emitter.sender_key()
    }

    pub fn emitter(&self) -> &Arc<SessionEmitter> {
        &self.emitter
    }

    fn cancel(&self) -> bool {
        self.emitter.cancel()
    }

    fn abort(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// Active sessions by id, plus the single live session of each sender.
#[derive(Default)]
pub struct StreamRegistry {
    sessions: HashMap<String, StreamSession>,
    by_sender: HashMap<String, String>,
}

impl StreamRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn contains(&self, stream_id: &str) -> bool {
        self.sessions.contains_key(stream_id)
    }

    pub fn active_for(&self, sender_key: &str) -> Option<&str> {
        self.by_sender.get(sender_key).map(String::as_str)
    }

    /// Registers a session, cancelling whatever the same sender had running.
    /// Returns the ids of the superseded sessions.
    pub fn insert(&mut self, session: StreamSession) -> Vec<String> {
        let superseded = self.cancel_sender(session.sender_key());
        self.by_sender
            .insert(session.sender_key().to_string(), session.id().to_string());
        self.sessions.insert(session.id().to_string(), session);
        superseded
    }

    pub fn remove(&mut self, stream_id: &str) -> Option<StreamSession> {
        let session = self.sessions.remove(stream_id)?;
        if self
            .by_sender
            .get(session.sender_key())
            .is_some_and(|active| active == stream_id)
        {
            self.by_sender.remove(session.sender_key());
        }
        Some(session)
    }

    pub fn cancel(&mut self, stream_id: &str) -> bool {
        let Some(session) = self.remove(stream_id) else {
            return false;
        };
        debug!(stream_id, sender_key = session.sender_key(), "cancelling stream");
        session.cancel();
        true
    }

    /// Cancels only when the stream belongs to `sender_key`.
    pub fn cancel_owned(&mut self, sender_key: &str, stream_id: &str) -> bool {
        match self.sessions.get(stream_id) {
            Some(session) if session.sender_key() == sender_key => self.cancel(stream_id),
            Some(_) => {
                warn!(stream_id, sender_key, "ignoring stop for a stream owned by another sender");
                false
            }
            None => false,
        }
    }

    pub fn cancel_sender(&mut self, sender_key: &str) -> Vec<String> {
        let ids = self
            .sessions
            .values()
            .filter(|session| session.sender_key() == sender_key)
            .map(|session| session.id().to_string())
            .collect::<Vec<_>>();
        for id in &ids {
            self.cancel(id);
        }
        ids
    }

    /// Cancels everything and force-terminates the session tasks.
    pub fn cancel_all(&mut self) -> usize {
        let ids = self.sessions.keys().cloned().collect::<Vec<_>>();
        for id in &ids {
            if let Some(mut session) = self.remove(id) {
                session.cancel();
                session.abort();
            }
        }
        ids.len()
    }
}
