use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tether_kernel_core::SessionEmitter;
use tether_kernel_protocol::{EventMsg, ReasoningSummaryEvent};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::protocol::non_empty_str;
use crate::protocol::transport::InferenceTransport;
use crate::ModelError;

pub const SUMMARY_CADENCE: Duration = Duration::from_secs(2);
pub const FALLBACK_SUMMARY: &str = "Thinking it through";
const EXCERPT_WORDS: usize = 300;
const MAX_LABEL_WORDS: usize = 5;
const SUMMARY_INSTRUCTIONS: &str = "Summarize what the assistant is currently working on \
in 3 to 5 words. Reply with the label only, no punctuation.";

/// Turns a reasoning excerpt into a short activity label.
#[async_trait]
pub trait ReasoningLabeler: Send + Sync {
    async fn label(&self, excerpt: &str) -> Result<String, ModelError>;
}

/// Labels with one non-streaming call to a small, fast model.
pub struct TransportLabeler {
    transport: Arc<dyn InferenceTransport>,
    model: String,
}

impl TransportLabeler {
    pub fn new(transport: Arc<dyn InferenceTransport>, model: impl Into<String>) -> Self {
        Self {
            transport,
            model: model.into(),
        }
    }
}

#[async_trait]
impl ReasoningLabeler for TransportLabeler {
    async fn label(&self, excerpt: &str) -> Result<String, ModelError> {
        let payload = json!({
            "model": self.model,
            "messages": [
                {"role": "system", "content": SUMMARY_INSTRUCTIONS},
                {"role": "user", "content": excerpt},
            ],
            "temperature": 0.2,
            "max_completion_tokens": 16,
            "stream": false,
        });
        let response = self.transport.complete(&payload).await?;
        let raw = non_empty_str(response.pointer("/choices/0/message/content")).ok_or_else(|| {
            ModelError::Provider {
                status: None,
                code: None,
                message: "summary model returned no text".to_string(),
            }
        })?;
        clean_label(raw).ok_or_else(|| ModelError::Provider {
            status: None,
            code: None,
            message: "summary model returned an empty label".to_string(),
        })
    }
}

fn clean_label(raw: &str) -> Option<String> {
    let words = raw
        .split_whitespace()
        .map(|word| word.trim_matches(|c: char| c == '"' || c == '\'' || c == '.' || c == '*'))
        .filter(|word| !word.is_empty())
        .take(MAX_LABEL_WORDS)
        .collect::<Vec<_>>();
    if words.is_empty() {
        return None;
    }
    Some(words.join(" "))
}

fn trailing_words(text: &str, count: usize) -> String {
    let words = text.split_whitespace().collect::<Vec<_>>();
    let start = words.len().saturating_sub(count);
    words[start..].join(" ")
}

struct SummaryTimer {
    token: CancellationToken,
    stopped: Arc<Mutex<bool>>,
    reasoning: watch::Sender<String>,
    handle: JoinHandle<()>,
}

/// Periodic reasoning labels for one session.
///
/// Armed by the first reasoning delta, permanently disarmed by the first
/// content delta or any terminal path. The timer task runs on a child of the
/// session's cancellation token and re-checks a stop gate under lock right
/// before each emit, so nothing is published once `stop` has returned.
pub struct ReasoningSummarizer {
    enabled: bool,
    emitter: Arc<SessionEmitter>,
    labeler: Arc<dyn ReasoningLabeler>,
    cadence: Duration,
    disarmed: bool,
    active: Option<SummaryTimer>,
}

impl ReasoningSummarizer {
    pub fn new(
        enabled: bool,
        emitter: Arc<SessionEmitter>,
        labeler: Arc<dyn ReasoningLabeler>,
        cadence: Duration,
    ) -> Self {
        Self {
            enabled,
            emitter,
            labeler,
            cadence,
            disarmed: false,
            active: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.is_some()
    }

    pub fn arm(&mut self) {
        if !self.enabled || self.disarmed || self.active.is_some() || self.emitter.is_cancelled() {
            return;
        }
        let token = self.emitter.cancellation_token().child_token();
        let stopped = Arc::new(Mutex::new(false));
        let (reasoning, reasoning_rx) = watch::channel(String::new());
        let handle = tokio::spawn(summary_loop(
            Arc::clone(&self.emitter),
            Arc::clone(&self.labeler),
            self.cadence,
            token.clone(),
            Arc::clone(&stopped),
            reasoning_rx,
        ));
        debug!(stream_id = self.emitter.stream_id(), "reasoning summarizer armed");
        self.active = Some(SummaryTimer {
            token,
            stopped,
            reasoning,
            handle,
        });
    }

    pub fn observe(&self, accumulated: &str) {
        if let Some(timer) = &self.active {
            timer.reasoning.send_replace(accumulated.to_string());
        }
    }

    /// Idempotent; after this returns no further summary is emitted.
    pub fn stop(&mut self) {
        self.disarmed = true;
        let Some(timer) = self.active.take() else {
            return;
        };
        *timer
            .stopped
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = true;
        timer.token.cancel();
        timer.handle.abort();
        debug!(stream_id = self.emitter.stream_id(), "reasoning summarizer stopped");
    }
}

impl Drop for ReasoningSummarizer {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn summary_loop(
    emitter: Arc<SessionEmitter>,
    labeler: Arc<dyn ReasoningLabeler>,
    cadence: Duration,
    token: CancellationToken,
    stopped: Arc<Mutex<bool>>,
    reasoning: watch::Receiver<String>,
) {
    let mut ticker = interval_at(Instant::now() + cadence, cadence);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut last_seen = String::new();
    let mut index = 0_u64;

    loop {
        tokio::select! {
            biased;
            _ = token.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let current = reasoning.borrow().clone();
        if current.trim().is_empty() || current == last_seen {
            continue;
        }
        let excerpt = trailing_words(&current, EXCERPT_WORDS);
        last_seen = current;

        let summary = tokio::select! {
            biased;
            _ = token.cancelled() => break,
            result = labeler.label(&excerpt) => result.unwrap_or_else(|error| {
                debug!(%error, "reasoning summary failed; using fallback label");
                FALLBACK_SUMMARY.to_string()
            }),
        };

        {
            let gate = stopped.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            if *gate || token.is_cancelled() {
                break;
            }
            emitter.emit(EventMsg::ReasoningSummary(ReasoningSummaryEvent {
                stream_id: emitter.stream_id().to_string(),
                index,
                summary,
            }));
        }
        index += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::transport::{ByteStream, ChunkStream};
    use serde_json::Value;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tether_kernel_protocol::Event;
    use tokio::sync::mpsc;

    struct StaticLabeler {
        calls: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl ReasoningLabeler for StaticLabeler {
        async fn label(&self, _excerpt: &str) -> Result<String, ModelError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(ModelError::StreamEndedUnexpectedly);
            }
            Ok("Adding small numbers".to_string())
        }
    }

    fn labeler(fail: bool) -> Arc<StaticLabeler> {
        Arc::new(StaticLabeler {
            calls: AtomicUsize::new(0),
            fail,
        })
    }

    fn summaries(rx: &mut mpsc::UnboundedReceiver<Event>) -> Vec<ReasoningSummaryEvent> {
        let mut out = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let EventMsg::ReasoningSummary(summary) = event.msg {
                out.push(summary);
            }
        }
        out
    }

    #[tokio::test(start_paused = true)]
    async fn emits_once_per_window_while_reasoning_grows() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let emitter = Arc::new(SessionEmitter::new("s-1", "window", tx));
        let labeler = labeler(false);
        let mut summarizer =
            ReasoningSummarizer::new(true, Arc::clone(&emitter), labeler.clone(), SUMMARY_CADENCE);

        summarizer.arm();
        summarizer.observe("First I add two");
        tokio::time::sleep(Duration::from_millis(2_100)).await;
        assert_eq!(summaries(&mut rx).len(), 1);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(summaries(&mut rx).is_empty());

        summarizer.observe("First I add two and two");
        tokio::time::sleep(Duration::from_secs(2)).await;
        let next = summaries(&mut rx);
        assert_eq!(next.len(), 1);
        assert_eq!(next[0].index, 1);
        assert_eq!(next[0].stream_id, "s-1");
        assert_eq!(labeler.calls.load(Ordering::SeqCst), 2);

        summarizer.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn nothing_is_emitted_after_stop() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let emitter = Arc::new(SessionEmitter::new("s-1", "window", tx));
        let mut summarizer =
            ReasoningSummarizer::new(true, Arc::clone(&emitter), labeler(false), SUMMARY_CADENCE);

        summarizer.arm();
        summarizer.observe("thinking");
        summarizer.stop();
        summarizer.stop();
        summarizer.arm();
        assert!(!summarizer.is_active());

        summarizer.observe("thinking harder");
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(summaries(&mut rx).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn failed_label_falls_back() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let emitter = Arc::new(SessionEmitter::new("s-1", "window", tx));
        let mut summarizer =
            ReasoningSummarizer::new(true, Arc::clone(&emitter), labeler(true), SUMMARY_CADENCE);

        summarizer.arm();
        summarizer.observe("considering options");
        tokio::time::sleep(Duration::from_millis(2_100)).await;
        let emitted = summaries(&mut rx);
        assert_eq!(emitted.len(), 1);
        assert_eq!(emitted[0].summary, FALLBACK_SUMMARY);
    }

    #[tokio::test(start_paused = true)]
    async fn session_cancel_stops_the_timer() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let emitter = Arc::new(SessionEmitter::new("s-1", "window", tx));
        let mut summarizer =
            ReasoningSummarizer::new(true, Arc::clone(&emitter), labeler(false), SUMMARY_CADENCE);

        summarizer.arm();
        summarizer.observe("thinking");
        emitter.cancel();
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(summaries(&mut rx).is_empty());
    }

    #[test]
    fn disabled_summarizer_never_arms() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let emitter = Arc::new(SessionEmitter::new("s-1", "window", tx));
        let mut summarizer =
            ReasoningSummarizer::new(false, emitter, labeler(false), SUMMARY_CADENCE);
        summarizer.arm();
        assert!(!summarizer.is_active());
    }

    #[test]
    fn excerpt_keeps_trailing_words() {
        let text = (0..400).map(|n| n.to_string()).collect::<Vec<_>>().join(" ");
        let excerpt = trailing_words(&text, EXCERPT_WORDS);
        assert!(excerpt.starts_with("100 "));
        assert!(excerpt.ends_with(" 399"));
        assert_eq!(clean_label("\"Checking the. weather data now please\"").as_deref(), Some("Checking the weather data now"));
    }

    struct CompletionTransport;

    #[async_trait]
    impl InferenceTransport for CompletionTransport {
        async fn open_chat_completions(&self, _payload: &Value) -> Result<ChunkStream, ModelError> {
            unreachable!("labeler uses non-streaming completions")
        }

        async fn open_responses(&self, _payload: &Value) -> Result<ByteStream, ModelError> {
            unreachable!("labeler uses non-streaming completions")
        }

        async fn complete(&self, payload: &Value) -> Result<Value, ModelError> {
            assert_eq!(payload["stream"], false);
            assert_eq!(payload["messages"][1]["content"], "two plus two");
            Ok(json!({"choices": [{"message": {"role": "assistant", "content": "Doing basic arithmetic."}}]}))
        }
    }

    #[tokio::test]
    async fn transport_labeler_reads_first_choice() {
        let labeler = TransportLabeler::new(Arc::new(CompletionTransport), "llama-3.1-8b-instant");
        let label = labeler.label("two plus two").await.expect("label");
        assert_eq!(label, "Doing basic arithmetic");
    }
}
