use serde_json::{json, Map, Value};

use crate::protocol::ApiVariant;

/// Everything one provider invocation needs. Retries clone and mutate it.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiParams {
    pub variant: ApiVariant,
    pub model: String,
    pub system_prompt: String,
    /// Prepared history in the chat-completions shape.
    pub messages: Vec<Value>,
    /// Tools already normalized for `variant`.
    pub tools: Vec<Value>,
    pub temperature: f64,
    pub top_p: f64,
    pub max_tokens: Option<u32>,
}

pub(crate) fn build_chat_completions_payload(params: &ApiParams) -> Value {
    let mut messages = Vec::with_capacity(params.messages.len() + 1);
    messages.push(json!({
        "role": "system",
        "content": params.system_prompt,
    }));
    messages.extend(params.messages.iter().cloned());

    let mut payload = json!({
        "model": params.model,
        "messages": messages,
        "temperature": params.temperature,
        "top_p": params.top_p,
        "stream": true,
    });

    if let Some(max_tokens) = params.max_tokens {
        payload["max_completion_tokens"] = json!(max_tokens);
    }

    if !params.tools.is_empty() {
        payload["tools"] = Value::Array(params.tools.clone());
        payload["tool_choice"] = Value::String("auto".to_string());
    }

    payload
}

pub(crate) fn build_responses_payload(params: &ApiParams) -> Value {
    let mut payload = json!({
        "model": params.model,
        "input": to_responses_input(&params.messages),
        "temperature": params.temperature,
        "top_p": params.top_p,
        "stream": true,
    });

    let instructions = params.system_prompt.trim();
    if !instructions.is_empty() {
        payload["instructions"] = Value::String(instructions.to_string());
    }

    if let Some(max_tokens) = params.max_tokens {
        payload["max_output_tokens"] = json!(max_tokens);
    }

    if !params.tools.is_empty() {
        payload["tools"] = Value::Array(params.tools.clone());
        payload["tool_choice"] = Value::String("auto".to_string());
    }

    payload
}

/// Rewrites chat-shaped history into Responses input items.
pub(crate) fn to_responses_input(messages: &[Value]) -> Vec<Value> {
    let mut input = Vec::with_capacity(messages.len());
    for message in messages {
        match message.get("role").and_then(Value::as_str) {
            Some("user") => input.push(json!({
                "type": "message",
                "role": "user",
                "content": user_input_parts(message.get("content")),
            })),
            Some("assistant") => {
                let text = message
                    .get("content")
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                if !text.is_empty() {
                    input.push(json!({
                        "type": "message",
                        "role": "assistant",
                        "content": text,
                    }));
                }
                for call in message
                    .get("tool_calls")
                    .and_then(Value::as_array)
                    .into_iter()
                    .flatten()
                {
                    input.push(json!({
                        "type": "function_call",
                        "call_id": call.get("id").cloned().unwrap_or(Value::Null),
                        "name": call.pointer("/function/name").cloned().unwrap_or(Value::Null),
                        "arguments": call
                            .pointer("/function/arguments")
                            .and_then(Value::as_str)
                            .unwrap_or("{}"),
                    }));
                }
            }
            Some("tool") => input.push(json!({
                "type": "function_call_output",
                "call_id": message.get("tool_call_id").cloned().unwrap_or(Value::Null),
                "output": message
                    .get("content")
                    .and_then(Value::as_str)
                    .unwrap_or_default(),
            })),
            _ => {}
        }
    }
    input
}

fn user_input_parts(content: Option<&Value>) -> Vec<Value> {
    let Some(parts) = content.and_then(Value::as_array) else {
        let text = content.and_then(Value::as_str).unwrap_or_default();
        return vec![json!({ "type": "input_text", "text": text })];
    };

    parts
        .iter()
        .filter_map(|part| match part.get("type").and_then(Value::as_str) {
            Some("text") => Some(json!({
                "type": "input_text",
                "text": part.get("text").and_then(Value::as_str).unwrap_or_default(),
            })),
            Some("image_url") => {
                let url = part.pointer("/image_url/url").and_then(Value::as_str)?;
                let mut image = Map::new();
                image.insert("type".to_string(), Value::String("input_image".to_string()));
                image.insert("image_url".to_string(), Value::String(url.to_string()));
                image.insert("detail".to_string(), Value::String("auto".to_string()));
                Some(Value::Object(image))
            }
            _ => None,
        })
        .collect()
}
