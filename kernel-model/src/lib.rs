mod accumulator;
mod completion;
pub mod prepare;
pub mod protocol;
pub mod retry;
pub mod summarizer;
pub mod tools;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tether_kernel_config::{ChatSettings, ConfigError, SettingsProvider};
use tether_kernel_core::{ChatEngine, SessionEmitter, StreamOutcome, StreamRequest};
use tether_kernel_protocol::CompletionRecord;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::accumulator::StreamRelay;
use crate::completion::assemble;
use crate::prepare::{contains_image_parts, local_system_prompt, prepare_messages};
use crate::protocol::chat_completions::run_chat_completions;
use crate::protocol::request::{build_chat_completions_payload, build_responses_payload};
use crate::protocol::responses::run_responses;
use crate::protocol::transport::{HttpTransport, InferenceTransport, SettingsRequestBuilder};
use crate::retry::{RetryController, RetryOutcome, StreamAttempt, RETRY_BACKOFF};
use crate::summarizer::{ReasoningLabeler, ReasoningSummarizer, TransportLabeler, SUMMARY_CADENCE};
use crate::tools::{connector_tools, normalize_tools};

pub use crate::protocol::request::ApiParams;
pub use crate::protocol::ApiVariant;

const TOOL_FAILURE_PATTERNS: &[&str] = &[
    "tool call validation failed",
    "failed to call a function",
    "parse tool call arguments",
    "tool_use_failed",
    "invalid tool call",
];

#[derive(Debug, Error)]
pub enum ModelError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("model {model} does not accept image input; choose a vision-capable model")]
    Capability { model: String },
    #[error("http request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("provider returned non-success status: {status}; body: {body}")]
    HttpStatus { status: u16, body: String },
    #[error("{message}")]
    Provider {
        status: Option<u16>,
        code: Option<String>,
        message: String,
    },
    #[error("invalid provider payload: {0}")]
    ParsePayload(#[from] serde_json::Error),
    #[error("failed to read local image from {path}: {error}")]
    LocalImageRead { path: String, error: String },
    #[error("stream ended unexpectedly before a finish reason")]
    StreamEndedUnexpectedly,
    #[error("responses stream failed: {message}")]
    StreamFailed {
        code: Option<String>,
        message: String,
    },
    #[error("stream cancelled")]
    Cancelled,
}

impl ModelError {
    /// Tool-use and tool-call validation failures are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        match self {
            ModelError::Provider { code, message, .. }
            | ModelError::StreamFailed { code, message } => {
                code.as_deref() == Some("tool_use_failed") || matches_tool_failure(message)
            }
            ModelError::HttpStatus { body, .. } => matches_tool_failure(body),
            _ => false,
        }
    }
}

fn matches_tool_failure(text: &str) -> bool {
    let lowered = text.to_ascii_lowercase();
    TOOL_FAILURE_PATTERNS
        .iter()
        .any(|pattern| lowered.contains(pattern))
}

/// Streams chat completions from the configured provider and reports progress
/// through the session emitter.
pub struct StreamingChatEngine {
    settings: Arc<dyn SettingsProvider>,
    transport: Arc<dyn InferenceTransport>,
    labeler: Option<Arc<dyn ReasoningLabeler>>,
    retry_backoff: Duration,
    summary_cadence: Duration,
}

impl StreamingChatEngine {
    pub fn new(settings: Arc<dyn SettingsProvider>) -> Self {
        let builder = Arc::new(SettingsRequestBuilder::new(Arc::clone(&settings)));
        Self::with_transport(settings, Arc::new(HttpTransport::new(builder)))
    }

    pub fn with_transport(
        settings: Arc<dyn SettingsProvider>,
        transport: Arc<dyn InferenceTransport>,
    ) -> Self {
        Self {
            settings,
            transport,
            labeler: None,
            retry_backoff: RETRY_BACKOFF,
            summary_cadence: SUMMARY_CADENCE,
        }
    }

    pub fn with_labeler(mut self, labeler: Arc<dyn ReasoningLabeler>) -> Self {
        self.labeler = Some(labeler);
        self
    }

    pub fn with_retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }

    pub fn with_summary_cadence(mut self, cadence: Duration) -> Self {
        self.summary_cadence = cadence;
        self
    }

    /// Validates the request and builds the first attempt's parameters.
    /// Fails before any provider call on configuration or capability errors.
    pub fn build_params(
        &self,
        settings: &ChatSettings,
        request: &StreamRequest,
    ) -> Result<ApiParams, ModelError> {
        settings.validate_api_key()?;

        let model = request
            .model
            .as_deref()
            .map(str::trim)
            .filter(|model| !model.is_empty())
            .unwrap_or(&settings.model)
            .to_string();
        let messages = prepare_messages(&request.messages);
        if contains_image_parts(&messages) && !settings.supports_vision(&model) {
            return Err(ModelError::Capability { model });
        }

        let variant = ApiVariant::from_settings(settings.use_responses_api);
        let mut tools = normalize_tools(&request.tools, variant);
        if variant == ApiVariant::Responses {
            tools.extend(connector_tools(settings));
        }

        Ok(ApiParams {
            variant,
            model,
            system_prompt: local_system_prompt(settings.custom_system_prompt.as_deref()),
            messages,
            tools,
            temperature: settings.temperature,
            top_p: settings.top_p,
            max_tokens: settings.max_tokens,
        })
    }
}

#[async_trait]
impl ChatEngine for StreamingChatEngine {
    async fn run_stream(
        &self,
        request: &StreamRequest,
        emitter: Arc<SessionEmitter>,
    ) -> StreamOutcome {
        let settings = self.settings.settings();
        let params = match self.build_params(&settings, request) {
            Ok(params) => params,
            Err(error) => {
                warn!(stream_id = emitter.stream_id(), %error, "rejecting stream request");
                return StreamOutcome::Failed(error.to_string());
            }
        };
        info!(
            stream_id = emitter.stream_id(),
            model = %params.model,
            variant = ?params.variant,
            tools = params.tools.len(),
            "starting chat stream"
        );

        let labeler = self.labeler.clone().unwrap_or_else(|| {
            Arc::new(TransportLabeler::new(
                Arc::clone(&self.transport),
                settings.summary_model.clone(),
            ))
        });
        let mut attempt = AdapterAttempt {
            transport: Arc::clone(&self.transport),
            emitter: Arc::clone(&emitter),
            summarizer: ReasoningSummarizer::new(
                settings.reasoning_summary_enabled,
                Arc::clone(&emitter),
                labeler,
                self.summary_cadence,
            ),
            remote_labels: settings.remote_server_labels(),
        };

        let controller = RetryController::new(settings.effective_max_retries(), self.retry_backoff);
        let outcome = controller.run(&params, &emitter, &mut attempt).await;
        attempt.summarizer.stop();

        match outcome {
            RetryOutcome::Completed(record) => {
                debug!(
                    stream_id = emitter.stream_id(),
                    finish_reason = record.finish_reason.as_str(),
                    "chat stream completed"
                );
                StreamOutcome::Completed(record)
            }
            RetryOutcome::Failed(message) => StreamOutcome::Failed(message),
            RetryOutcome::Cancelled => StreamOutcome::Cancelled,
        }
    }
}

/// One adapter invocation; the summarizer lives across attempts of a session.
struct AdapterAttempt {
    transport: Arc<dyn InferenceTransport>,
    emitter: Arc<SessionEmitter>,
    summarizer: ReasoningSummarizer,
    remote_labels: Vec<String>,
}

#[async_trait]
impl StreamAttempt for AdapterAttempt {
    async fn attempt(&mut self, params: &ApiParams) -> Result<CompletionRecord, ModelError> {
        let cancel = self.emitter.cancellation_token();
        let mut relay = StreamRelay::new(&self.emitter, &mut self.summarizer);
        let api_status = match params.variant {
            ApiVariant::ChatCompletions => {
                let payload = build_chat_completions_payload(params);
                run_chat_completions(self.transport.as_ref(), &payload, &mut relay, &cancel)
                    .await?;
                None
            }
            ApiVariant::Responses => {
                let payload = build_responses_payload(params);
                run_responses(
                    self.transport.as_ref(),
                    &payload,
                    &mut relay,
                    self.remote_labels.clone(),
                    &cancel,
                )
                .await?
                .api_status
            }
        };
        Ok(assemble(relay.into_accumulator(), api_status.as_deref()))
    }
}
