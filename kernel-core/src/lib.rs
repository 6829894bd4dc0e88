use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tether_kernel_protocol::{
    CompletionRecord, ErrorEvent, Event, EventMsg, Op, Submission, ToolDescriptor,
};
use thiserror::Error;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

mod session;

pub use session::{SessionEmitter, StreamRegistry, StreamSession};

#[derive(Debug, Clone)]
pub struct KernelConfig {
    pub channel_capacity: usize,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 128,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StreamRequest {
    pub messages: Vec<Value>,
    pub model: Option<String>,
    pub tools: Vec<ToolDescriptor>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StreamOutcome {
    Completed(CompletionRecord),
    Failed(String),
    Cancelled,
}

/// Runs one chat stream to its outcome, reporting progress through the emitter.
/// The terminal event is delivered by the runtime, not by the engine.
#[async_trait]
pub trait ChatEngine: Send + Sync {
    async fn run_stream(
        &self,
        request: &StreamRequest,
        emitter: Arc<SessionEmitter>,
    ) -> StreamOutcome;
}

#[derive(Debug, Error)]
pub enum KernelError {
    #[error("failed to send submission: runtime channel closed")]
    SubmissionChannelClosed,
    #[error("kernel join failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

pub struct KernelRuntime {
    submission_tx: mpsc::Sender<Submission>,
    event_rx: UnboundedReceiver<Event>,
    loop_handle: JoinHandle<()>,
}

impl KernelRuntime {
    pub fn spawn_with_engine(config: KernelConfig, chat_engine: Arc<dyn ChatEngine>) -> Self {
        let (submission_tx, submission_rx) = mpsc::channel(config.channel_capacity);
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let loop_handle = tokio::spawn(submission_loop(submission_rx, event_tx, chat_engine));

        Self {
            submission_tx,
            event_rx,
            loop_handle,
        }
    }

    pub async fn submit(&self, submission: Submission) -> Result<(), KernelError> {
        self.submission_tx
            .send(submission)
            .await
            .map_err(|_| KernelError::SubmissionChannelClosed)
    }

    pub fn submission_sender(&self) -> mpsc::Sender<Submission> {
        self.submission_tx.clone()
    }

    pub fn events_mut(&mut self) -> &mut UnboundedReceiver<Event> {
        &mut self.event_rx
    }

    pub async fn join(self) -> Result<(), KernelError> {
        self.loop_handle.await?;
        Ok(())
    }
}

async fn submission_loop(
    mut submission_rx: mpsc::Receiver<Submission>,
    event_tx: UnboundedSender<Event>,
    chat_engine: Arc<dyn ChatEngine>,
) {
    let mut registry = StreamRegistry::new();
    let (finished_tx, mut finished_rx) = mpsc::unbounded_channel::<String>();

    loop {
        tokio::select! {
            Some(stream_id) = finished_rx.recv() => {
                if registry.remove(&stream_id).is_some() {
                    debug!(stream_id = %stream_id, "stream session closed");
                }
            }
            submission = submission_rx.recv() => {
                let Some(submission) = submission else {
                    break;
                };
                match submission.op {
                    Op::StartStream {
                        sender_key,
                        messages,
                        model,
                        tools,
                    } => {
                        let stream_id = Uuid::new_v4().to_string();
                        let superseded = registry.cancel_sender(&sender_key);
                        if !superseded.is_empty() {
                            info!(sender_key = %sender_key, ?superseded, "superseding active stream");
                        }
                        let emitter = Arc::new(SessionEmitter::new(
                            stream_id.clone(),
                            sender_key,
                            event_tx.clone(),
                        ));
                        let task = spawn_session(
                            StreamRequest {
                                messages,
                                model,
                                tools,
                            },
                            Arc::clone(&emitter),
                            finished_tx.clone(),
                            Arc::clone(&chat_engine),
                        );
                        registry.insert(StreamSession::new(emitter, Some(task)));
                    }
                    Op::StopStream {
                        sender_key,
                        stream_id,
                    } => match stream_id {
                        Some(stream_id) => {
                            if !registry.cancel_owned(&sender_key, &stream_id) {
                                debug!(stream_id = %stream_id, "stop requested for inactive stream");
                            }
                        }
                        None => {
                            let stopped = registry.cancel_sender(&sender_key);
                            debug!(sender_key = %sender_key, count = stopped.len(), "stopped sender streams");
                        }
                    },
                    Op::Shutdown => {
                        let stopped = registry.cancel_all();
                        info!(count = stopped, "shutting down stream runtime");
                        let _ = event_tx.send(Event {
                            stream_id: submission.id,
                            sender_key: String::new(),
                            msg: EventMsg::ShutdownComplete,
                        });
                        break;
                    }
                }
            }
        }
    }

    registry.cancel_all();
}

fn spawn_session(
    request: StreamRequest,
    emitter: Arc<SessionEmitter>,
    finished_tx: UnboundedSender<String>,
    chat_engine: Arc<dyn ChatEngine>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let outcome = chat_engine.run_stream(&request, Arc::clone(&emitter)).await;
        match outcome {
            StreamOutcome::Completed(record) => {
                emitter.finish(EventMsg::Complete(record));
            }
            StreamOutcome::Failed(message) if !emitter.is_cancelled() => {
                warn!(stream_id = emitter.stream_id(), %message, "stream failed");
                emitter.finish(EventMsg::Error(ErrorEvent { message }));
            }
            StreamOutcome::Failed(_) | StreamOutcome::Cancelled => {
                emitter.cancel();
            }
        }
        let _ = finished_tx.send(emitter.stream_id().to_string());
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tether_kernel_protocol::{FinishReason, TextDeltaEvent};
    use tokio_util::sync::CancellationToken;

    struct EchoChatEngine;

    #[async_trait]
    impl ChatEngine for EchoChatEngine {
        async fn run_stream(
            &self,
            request: &StreamRequest,
            emitter: Arc<SessionEmitter>,
        ) -> StreamOutcome {
            let last = request
                .messages
                .iter()
                .rev()
                .find_map(|message| message.get("content").and_then(Value::as_str))
                .unwrap_or_default()
                .to_string();
            emitter.emit_start("echo-1", "assistant");
            emitter.emit(EventMsg::ContentDelta(TextDeltaEvent { text: last.clone() }));
            StreamOutcome::Completed(completion(&last))
        }
    }

    /// Streams one delta, then waits until cancelled.
    struct StallingEngine;

    #[async_trait]
    impl ChatEngine for StallingEngine {
        async fn run_stream(
            &self,
            _request: &StreamRequest,
            emitter: Arc<SessionEmitter>,
        ) -> StreamOutcome {
            let token: CancellationToken = emitter.cancellation_token();
            emitter.emit_start("stall-1", "assistant");
            emitter.emit(EventMsg::ContentDelta(TextDeltaEvent {
                text: "partial".to_string(),
            }));
            token.cancelled().await;
            emitter.emit(EventMsg::ContentDelta(TextDeltaEvent {
                text: "zombie".to_string(),
            }));
            StreamOutcome::Failed("transport dropped".to_string())
        }
    }

    struct FailingEngine;

    #[async_trait]
    impl ChatEngine for FailingEngine {
        async fn run_stream(
            &self,
            _request: &StreamRequest,
            _emitter: Arc<SessionEmitter>,
        ) -> StreamOutcome {
            StreamOutcome::Failed("provider unavailable".to_string())
        }
    }

    fn completion(content: &str) -> CompletionRecord {
        CompletionRecord {
            content: content.to_string(),
            tool_calls: Vec::new(),
            reasoning: None,
            executed_tools: Vec::new(),
            tool_results: Vec::new(),
            approval_requests: Vec::new(),
            finish_reason: FinishReason::Stop,
            usage: None,
        }
    }

    fn start_stream(id: &str, sender_key: &str, text: &str) -> Submission {
        Submission {
            id: id.to_string(),
            op: Op::StartStream {
                sender_key: sender_key.to_string(),
                messages: vec![serde_json::json!({"role": "user", "content": text})],
                model: None,
                tools: Vec::new(),
            },
        }
    }

    async fn recv_event(rx: &mut UnboundedReceiver<Event>) -> Event {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting event")
            .expect("event channel closed unexpectedly")
    }

    async fn shutdown(mut runtime: KernelRuntime) {
        runtime
            .submit(Submission {
                id: "shutdown".to_string(),
                op: Op::Shutdown,
            })
            .await
            .expect("submit shutdown");
        loop {
            let event = recv_event(runtime.events_mut()).await;
            if matches!(event.msg, EventMsg::ShutdownComplete) {
                break;
            }
        }
        runtime.join().await.expect("join runtime");
    }

    #[tokio::test]
    async fn start_stream_emits_start_delta_then_complete() {
        let mut runtime =
            KernelRuntime::spawn_with_engine(KernelConfig::default(), Arc::new(EchoChatEngine));
        runtime
            .submit(start_stream("sub-1", "window", "hello"))
            .await
            .expect("submit stream");

        let started = recv_event(runtime.events_mut()).await;
        assert!(matches!(started.msg, EventMsg::Start(_)));
        assert_eq!(started.sender_key, "window");

        let delta = recv_event(runtime.events_mut()).await;
        assert!(matches!(
            delta.msg,
            EventMsg::ContentDelta(TextDeltaEvent { ref text }) if text == "hello"
        ));

        let completed = recv_event(runtime.events_mut()).await;
        assert!(matches!(
            completed.msg,
            EventMsg::Complete(CompletionRecord { ref content, .. }) if content == "hello"
        ));
        assert_eq!(completed.stream_id, started.stream_id);

        shutdown(runtime).await;
    }

    #[tokio::test]
    async fn stop_stream_yields_single_cancelled_and_no_zombie_events() {
        let mut runtime =
            KernelRuntime::spawn_with_engine(KernelConfig::default(), Arc::new(StallingEngine));
        runtime
            .submit(start_stream("sub-1", "window", "long"))
            .await
            .expect("submit stream");
        let started = recv_event(runtime.events_mut()).await;
        let _partial = recv_event(runtime.events_mut()).await;

        runtime
            .submit(Submission {
                id: "stop".to_string(),
                op: Op::StopStream {
                    sender_key: "window".to_string(),
                    stream_id: None,
                },
            })
            .await
            .expect("submit stop");

        let cancelled = recv_event(runtime.events_mut()).await;
        assert!(matches!(cancelled.msg, EventMsg::Cancelled(_)));
        assert_eq!(cancelled.stream_id, started.stream_id);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(runtime.events_mut().try_recv().is_err());

        shutdown(runtime).await;
    }

    #[tokio::test]
    async fn new_stream_for_same_sender_cancels_previous() {
        let mut runtime =
            KernelRuntime::spawn_with_engine(KernelConfig::default(), Arc::new(StallingEngine));
        runtime
            .submit(start_stream("sub-1", "window", "first"))
            .await
            .expect("submit first");
        let first = recv_event(runtime.events_mut()).await;
        let _ = recv_event(runtime.events_mut()).await;

        runtime
            .submit(start_stream("sub-2", "window", "second"))
            .await
            .expect("submit second");

        let cancelled = recv_event(runtime.events_mut()).await;
        assert!(matches!(cancelled.msg, EventMsg::Cancelled(_)));
        assert_eq!(cancelled.stream_id, first.stream_id);

        let second = recv_event(runtime.events_mut()).await;
        assert!(matches!(second.msg, EventMsg::Start(_)));
        assert_ne!(second.stream_id, first.stream_id);

        shutdown(runtime).await;
    }

    #[tokio::test]
    async fn engine_failure_surfaces_single_error() {
        let mut runtime =
            KernelRuntime::spawn_with_engine(KernelConfig::default(), Arc::new(FailingEngine));
        runtime
            .submit(start_stream("sub-1", "window", "hi"))
            .await
            .expect("submit stream");

        let error = recv_event(runtime.events_mut()).await;
        assert!(matches!(
            error.msg,
            EventMsg::Error(ErrorEvent { ref message }) if message == "provider unavailable"
        ));

        shutdown(runtime).await;
    }
}
