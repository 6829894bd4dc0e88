pub(crate) mod chat_completions;
pub(crate) mod request;
pub(crate) mod responses;
pub(crate) mod sse;
pub mod transport;

use serde_json::Value;
use tether_kernel_protocol::Usage;

/// Wire protocol used for one request. Retries always stay on the same variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiVariant {
    ChatCompletions,
    Responses,
}

impl ApiVariant {
    pub fn from_settings(use_responses_api: bool) -> Self {
        if use_responses_api {
            ApiVariant::Responses
        } else {
            ApiVariant::ChatCompletions
        }
    }
}

pub(crate) fn non_empty_str<'a>(value: Option<&'a Value>) -> Option<&'a str> {
    value
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|value| !value.is_empty())
}

/// Reads chat-completions (`prompt_tokens`) or responses (`input_tokens`) usage.
pub(crate) fn parse_usage(raw: Option<&Value>) -> Option<Usage> {
    let object = raw?.as_object()?;
    let usage = Usage {
        prompt_tokens: parse_json_u64(object.get("prompt_tokens"))
            .or_else(|| parse_json_u64(object.get("input_tokens"))),
        completion_tokens: parse_json_u64(object.get("completion_tokens"))
            .or_else(|| parse_json_u64(object.get("output_tokens"))),
        total_tokens: parse_json_u64(object.get("total_tokens")),
        queue_time: object.get("queue_time").and_then(Value::as_f64),
        total_time: object.get("total_time").and_then(Value::as_f64),
    };
    if usage == Usage::default() {
        return None;
    }
    Some(usage)
}

fn parse_json_u64(value: Option<&Value>) -> Option<u64> {
    let value = value?;
    if let Some(raw) = value.as_u64() {
        return Some(raw);
    }
    value
        .as_str()
        .and_then(|raw| raw.trim().parse::<u64>().ok())
}
