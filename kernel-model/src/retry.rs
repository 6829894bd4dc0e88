use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tether_kernel_core::SessionEmitter;
use tether_kernel_protocol::{CompletionRecord, EventMsg, RetryEvent};
use tracing::{info, warn};

use crate::protocol::request::ApiParams;
use crate::ModelError;

pub const MAX_RETRIES: u32 = 25;
pub const RETRY_BACKOFF: Duration = Duration::from_millis(500);
pub const TEMPERATURE_STEP: f64 = 0.05;

/// Attempt counter for one top-level request; survives adapter re-invocations.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryState {
    pub attempt: u32,
    pub base_temperature: f64,
}

impl RetryState {
    pub fn new(base_temperature: f64) -> Self {
        Self {
            attempt: 0,
            base_temperature,
        }
    }

    pub fn current_temperature(&self) -> f64 {
        self.base_temperature + f64::from(self.attempt) * TEMPERATURE_STEP
    }
}

/// One invocation of a protocol adapter.
#[async_trait]
pub trait StreamAttempt: Send {
    async fn attempt(&mut self, params: &ApiParams) -> Result<CompletionRecord, ModelError>;
}

#[derive(Debug, Clone, PartialEq)]
pub enum RetryOutcome {
    Completed(CompletionRecord),
    Failed(String),
    Cancelled,
}

#[derive(Debug, Clone, Copy)]
pub struct RetryController {
    max_retries: u32,
    backoff: Duration,
}

impl Default for RetryController {
    fn default() -> Self {
        Self::new(MAX_RETRIES, RETRY_BACKOFF)
    }
}

impl RetryController {
    pub fn new(max_retries: u32, backoff: Duration) -> Self {
        Self {
            max_retries: max_retries.min(MAX_RETRIES),
            backoff,
        }
    }

    /// Runs attempts until one completes, a non-retryable error occurs,
    /// retries run out, or the session is cancelled. Cancellation wins over
    /// every other outcome.
    pub async fn run(
        &self,
        params: &ApiParams,
        emitter: &SessionEmitter,
        stream: &mut dyn StreamAttempt,
    ) -> RetryOutcome {
        let cancel = emitter.cancellation_token();
        let mut state = RetryState::new(params.temperature);
        let mut current = params.clone();

        loop {
            if cancel.is_cancelled() {
                return RetryOutcome::Cancelled;
            }

            let error = match stream.attempt(&current).await {
                Ok(record) if !cancel.is_cancelled() => return RetryOutcome::Completed(record),
                Ok(_) | Err(ModelError::Cancelled) => return RetryOutcome::Cancelled,
                Err(_) if cancel.is_cancelled() => return RetryOutcome::Cancelled,
                Err(error) => error,
            };

            if !error.is_retryable() || self.max_retries == 0 {
                return RetryOutcome::Failed(error.to_string());
            }
            if state.attempt >= self.max_retries {
                warn!(
                    stream_id = emitter.stream_id(),
                    attempts = state.attempt,
                    %error,
                    "tool call retries exhausted"
                );
                return RetryOutcome::Failed(format!(
                    "Tool call failed after {} retry attempts: {error}",
                    state.attempt
                ));
            }

            state.attempt += 1;
            let temperature = state.current_temperature();
            current = params.clone();
            current.temperature = temperature;
            annotate_last_user_message(&mut current.messages, &retry_note(state.attempt, &error));

            info!(
                stream_id = emitter.stream_id(),
                attempt = state.attempt,
                temperature,
                %error,
                "retrying after tool call failure"
            );
            emitter.emit(EventMsg::Retry(RetryEvent {
                attempt: state.attempt,
                max_attempts: self.max_retries,
                error: error.to_string(),
                new_temperature: temperature,
            }));

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return RetryOutcome::Cancelled,
                _ = tokio::time::sleep(self.backoff) => {}
            }
        }
    }
}

fn retry_note(attempt: u32, error: &ModelError) -> String {
    format!(
        "[Retry {attempt}: the previous response failed with a tool call error ({error}). \
Call tools only with valid JSON arguments that match their schema.]"
    )
}

/// Appends `note` to the text of the last user message, adding a text part when there is none.
pub(crate) fn annotate_last_user_message(messages: &mut [Value], note: &str) {
    let Some(message) = messages
        .iter_mut()
        .rev()
        .find(|message| message.get("role").and_then(Value::as_str) == Some("user"))
    else {
        return;
    };

    if !matches!(
        message.get("content"),
        Some(Value::String(_)) | Some(Value::Array(_))
    ) {
        if let Some(object) = message.as_object_mut() {
            object.insert("content".to_string(), json!([]));
        }
    }

    match message.get_mut("content") {
        Some(Value::String(text)) => {
            text.push_str("\n\n");
            text.push_str(note);
        }
        Some(Value::Array(parts)) => {
            let last_text = parts.iter().rposition(|part| {
                part.get("type").and_then(Value::as_str) == Some("text")
                    && part.get("text").is_some_and(Value::is_string)
            });
            match last_text {
                Some(position) => {
                    if let Some(Value::String(text)) = parts[position].get_mut("text") {
                        text.push_str("\n\n");
                        text.push_str(note);
                    }
                }
                None => parts.push(json!({ "type": "text", "text": note })),
            }
        }
        _ => {}
    }
}
