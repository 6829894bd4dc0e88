use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, BoxStream};
use futures::StreamExt;
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use serde_json::Value;
use tether_kernel_config::SettingsProvider;
use tracing::debug;

use crate::protocol::non_empty_str;
use crate::protocol::sse::{parse_data_payload, SseLineDecoder};
use crate::ModelError;

pub type ChunkStream = BoxStream<'static, Result<Value, ModelError>>;
pub type ByteStream = BoxStream<'static, Result<Bytes, ModelError>>;

/// Raw access to the inference provider. Dropping a returned stream closes the connection.
#[async_trait]
pub trait InferenceTransport: Send + Sync {
    /// Chat-completions stream, already framed into JSON chunks.
    async fn open_chat_completions(&self, payload: &Value) -> Result<ChunkStream, ModelError>;

    /// Responses stream as raw SSE bytes.
    async fn open_responses(&self, payload: &Value) -> Result<ByteStream, ModelError>;

    /// Non-streaming chat-completions call.
    async fn complete(&self, payload: &Value) -> Result<Value, ModelError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiRoute {
    ChatCompletions,
    Responses,
}

impl ApiRoute {
    pub fn path(&self) -> &'static str {
        match self {
            ApiRoute::ChatCompletions => "/v1/chat/completions",
            ApiRoute::Responses => "/v1/responses",
        }
    }
}

/// Builds the outgoing HTTP request; swap it to target a different endpoint or auth scheme.
pub trait RequestBuilder: Send + Sync {
    fn build(
        &self,
        client: &reqwest::Client,
        route: ApiRoute,
        payload: &Value,
    ) -> reqwest::RequestBuilder;
}

#[derive(Debug, Clone)]
pub struct BearerRequestBuilder {
    pub base_url: String,
    pub api_key: String,
}

impl RequestBuilder for BearerRequestBuilder {
    fn build(
        &self,
        client: &reqwest::Client,
        route: ApiRoute,
        payload: &Value,
    ) -> reqwest::RequestBuilder {
        bearer_request(client, &self.base_url, &self.api_key, route, payload)
    }
}

/// Reads base URL and key from the settings provider on every request.
pub struct SettingsRequestBuilder {
    settings: Arc<dyn SettingsProvider>,
}

impl SettingsRequestBuilder {
    pub fn new(settings: Arc<dyn SettingsProvider>) -> Self {
        Self { settings }
    }
}

impl RequestBuilder for SettingsRequestBuilder {
    fn build(
        &self,
        client: &reqwest::Client,
        route: ApiRoute,
        payload: &Value,
    ) -> reqwest::RequestBuilder {
        let settings = self.settings.settings();
        bearer_request(client, &settings.base_url, &settings.api_key, route, payload)
    }
}

fn bearer_request(
    client: &reqwest::Client,
    base_url: &str,
    api_key: &str,
    route: ApiRoute,
    payload: &Value,
) -> reqwest::RequestBuilder {
    let endpoint = format!("{}{}", base_url.trim_end_matches('/'), route.path());
    client
        .post(endpoint)
        .header(CONTENT_TYPE, "application/json")
        .bearer_auth(api_key)
        .json(payload)
}

#[derive(Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    builder: Arc<dyn RequestBuilder>,
}

impl HttpTransport {
    pub fn new(builder: Arc<dyn RequestBuilder>) -> Self {
        Self {
            client: reqwest::Client::new(),
            builder,
        }
    }

    async fn send(
        &self,
        route: ApiRoute,
        payload: &Value,
        accept: &str,
    ) -> Result<reqwest::Response, ModelError> {
        let response = self
            .builder
            .build(&self.client, route, payload)
            .header(ACCEPT, accept)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.bytes().await?;
            return Err(provider_error_from_body(
                status.as_u16(),
                &String::from_utf8_lossy(&body),
            ));
        }
        debug!(route = route.path(), status = status.as_u16(), "provider accepted request");
        Ok(response)
    }
}

#[async_trait]
impl InferenceTransport for HttpTransport {
    async fn open_chat_completions(&self, payload: &Value) -> Result<ChunkStream, ModelError> {
        let response = self
            .send(ApiRoute::ChatCompletions, payload, "text/event-stream")
            .await?;
        let bytes = response
            .bytes_stream()
            .map(|item| item.map_err(ModelError::from))
            .boxed();
        Ok(frame_json_chunks(bytes))
    }

    async fn open_responses(&self, payload: &Value) -> Result<ByteStream, ModelError> {
        let response = self
            .send(ApiRoute::Responses, payload, "text/event-stream")
            .await?;
        Ok(response
            .bytes_stream()
            .map(|item| item.map_err(ModelError::from))
            .boxed())
    }

    async fn complete(&self, payload: &Value) -> Result<Value, ModelError> {
        let response = self
            .send(ApiRoute::ChatCompletions, payload, "application/json")
            .await?;
        let body = response.bytes().await?;
        serde_json::from_slice::<Value>(&body).map_err(ModelError::from)
    }
}

struct FramingState {
    bytes: ByteStream,
    decoder: SseLineDecoder,
    ready: VecDeque<Value>,
    exhausted: bool,
}

/// Turns an SSE byte stream into one JSON value per `data:` line.
pub(crate) fn frame_json_chunks(bytes: ByteStream) -> ChunkStream {
    let state = FramingState {
        bytes,
        decoder: SseLineDecoder::new(),
        ready: VecDeque::new(),
        exhausted: false,
    };
    stream::unfold(state, |mut state| async move {
        loop {
            if let Some(value) = state.ready.pop_front() {
                return Some((Ok(value), state));
            }
            if state.exhausted {
                return None;
            }
            match state.bytes.next().await {
                Some(Ok(chunk)) => {
                    state.ready.extend(
                        state
                            .decoder
                            .push(&chunk)
                            .iter()
                            .filter_map(|payload| parse_data_payload(payload)),
                    );
                }
                Some(Err(error)) => {
                    state.exhausted = true;
                    return Some((Err(error), state));
                }
                None => {
                    state.exhausted = true;
                    if let Some(payload) = state.decoder.finish() {
                        state.ready.extend(parse_data_payload(&payload));
                    }
                }
            }
        }
    })
    .boxed()
}

/// Maps an error response body (`{"error":{"message","code"}}`) to a provider error.
pub(crate) fn provider_error_from_body(status: u16, body: &str) -> ModelError {
    let parsed = serde_json::from_str::<Value>(body).ok();
    let error = parsed.as_ref().and_then(|value| value.get("error"));
    let message = error
        .and_then(|error| non_empty_str(error.get("message")))
        .or_else(|| error.and_then(|error| non_empty_str(Some(error))));
    match message {
        Some(message) => ModelError::Provider {
            status: Some(status),
            code: error.and_then(|error| non_empty_str(error.get("code"))).map(ToString::to_string),
            message: message.to_string(),
        },
        None => ModelError::HttpStatus {
            status,
            body: body.to_string(),
        },
    }
}
