use std::env;
use std::fs;
use std::path::Path;

use base64::Engine;
use serde_json::{json, Map, Value};
use time::macros::format_description;
use time::OffsetDateTime;
use tracing::{debug, warn};

use crate::ModelError;

const SYSTEM_PREAMBLE: &str = "You are a helpful assistant running inside a desktop chat client. \
Use the available tools when they help answer the request, and say so plainly when you are unsure.";
const UNSERIALIZABLE_CONTENT: &str = "[unserializable content]";
const TZ_ENV: &str = "TZ";
const ZONEINFO_DIR: &str = "/usr/share/zoneinfo/";

/// Rebuilds the conversation into the chat-completions shape.
///
/// Each message is reconstructed from the fields the provider accepts, so
/// client-only fields (streaming flags, live reasoning mirrors, ids) never
/// leave the process. System messages are dropped; the synthesized system
/// prompt replaces them.
pub fn prepare_messages(raw: &[Value]) -> Vec<Value> {
    raw.iter().filter_map(prepare_message).collect()
}

fn prepare_message(message: &Value) -> Option<Value> {
    let Some(role) = message.get("role").and_then(Value::as_str) else {
        warn!("dropping history entry without a role");
        return None;
    };
    let content = message.get("content");

    match role {
        "user" => Some(json!({
            "role": "user",
            "content": user_content_parts(content),
        })),
        "assistant" => {
            let mut prepared = Map::new();
            prepared.insert("role".to_string(), Value::String("assistant".to_string()));
            prepared.insert(
                "content".to_string(),
                Value::String(flatten_assistant_content(content)),
            );
            let tool_calls = sanitize_tool_calls(message.get("tool_calls"));
            if !tool_calls.is_empty() {
                prepared.insert("tool_calls".to_string(), Value::Array(tool_calls));
            }
            Some(Value::Object(prepared))
        }
        "tool" => {
            let mut prepared = Map::new();
            prepared.insert("role".to_string(), Value::String("tool".to_string()));
            prepared.insert(
                "tool_call_id".to_string(),
                message.get("tool_call_id").cloned().unwrap_or(Value::Null),
            );
            if let Some(name) = message.get("name").and_then(Value::as_str) {
                prepared.insert("name".to_string(), Value::String(name.to_string()));
            }
            prepared.insert(
                "content".to_string(),
                Value::String(stringify_content(content)),
            );
            Some(Value::Object(prepared))
        }
        "system" => None,
        other => {
            debug!(role = other, "dropping history entry with unsupported role");
            None
        }
    }
}

fn user_content_parts(content: Option<&Value>) -> Vec<Value> {
    match content {
        None | Some(Value::Null) => vec![text_part("")],
        Some(Value::String(text)) => vec![text_part(text)],
        Some(Value::Array(parts)) => parts.iter().filter_map(user_part).collect(),
        Some(other) => vec![text_part(&stringify_content(Some(other)))],
    }
}

fn user_part(part: &Value) -> Option<Value> {
    if let Some(text) = part.as_str() {
        return Some(text_part(text));
    }
    match part.get("type").and_then(Value::as_str) {
        Some("text") | Some("input_text") => Some(text_part(
            part.get("text").and_then(Value::as_str).unwrap_or_default(),
        )),
        Some("image_url") | Some("input_image") | Some("image") => {
            let url = part
                .pointer("/image_url/url")
                .or_else(|| part.get("image_url"))
                .or_else(|| part.get("url"))
                .and_then(Value::as_str)?;
            match resolve_image_url(url) {
                Ok(url) => Some(json!({
                    "type": "image_url",
                    "image_url": { "url": url },
                })),
                Err(error) => {
                    warn!(%error, "replacing unreadable image with a text note");
                    Some(text_part(&format!("[image unavailable: {url}]")))
                }
            }
        }
        other => {
            debug!(part_type = ?other, "dropping unsupported user content part");
            None
        }
    }
}

fn text_part(text: &str) -> Value {
    json!({ "type": "text", "text": text })
}

/// Local image paths are inlined as data URLs; remote and data URLs pass through.
fn resolve_image_url(url: &str) -> Result<String, ModelError> {
    let path = match url.strip_prefix("file://") {
        Some(path) => path,
        None if Path::new(url).is_absolute() => url,
        None => return Ok(url.to_string()),
    };
    let bytes = fs::read(path).map_err(|error| ModelError::LocalImageRead {
        path: path.to_string(),
        error: error.to_string(),
    })?;
    let encoded = base64::engine::general_purpose::STANDARD.encode(bytes);
    let mime = infer_image_mime_type(path);
    Ok(format!("data:{mime};base64,{encoded}"))
}

fn infer_image_mime_type(path: &str) -> &'static str {
    let ext = Path::new(path)
        .extension()
        .and_then(|value| value.to_str())
        .map(|value| value.to_ascii_lowercase());

    match ext.as_deref() {
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("webp") => "image/webp",
        _ => "application/octet-stream",
    }
}

fn flatten_assistant_content(content: Option<&Value>) -> String {
    match content {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(text)) => text.clone(),
        Some(Value::Array(parts)) => parts
            .iter()
            .filter_map(|part| {
                if let Some(text) = part.as_str() {
                    return Some(text);
                }
                match part.get("type").and_then(Value::as_str) {
                    Some("text") | Some("output_text") => part.get("text").and_then(Value::as_str),
                    _ => None,
                }
            })
            .collect(),
        Some(other) => stringify_content(Some(other)),
    }
}

fn stringify_content(content: Option<&Value>) -> String {
    match content {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(text)) => text.clone(),
        Some(other) => {
            serde_json::to_string(other).unwrap_or_else(|_| UNSERIALIZABLE_CONTENT.to_string())
        }
    }
}

fn sanitize_tool_calls(raw: Option<&Value>) -> Vec<Value> {
    raw.and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter_map(|call| {
            let id = call.get("id").and_then(Value::as_str)?;
            let function = call.get("function")?;
            let arguments = match function.get("arguments") {
                Some(Value::String(arguments)) => arguments.clone(),
                Some(Value::Null) | None => "{}".to_string(),
                Some(other) => stringify_content(Some(other)),
            };
            Some(json!({
                "id": id,
                "type": "function",
                "function": {
                    "name": function.get("name").and_then(Value::as_str).unwrap_or_default(),
                    "arguments": arguments,
                },
            }))
        })
        .collect()
}

pub fn contains_image_parts(messages: &[Value]) -> bool {
    messages.iter().any(|message| {
        message
            .get("content")
            .and_then(Value::as_array)
            .is_some_and(|parts| {
                parts
                    .iter()
                    .any(|part| part.get("type").and_then(Value::as_str) == Some("image_url"))
            })
    })
}

/// Preamble, then the local date and time with its zone name and UTC offset,
/// then custom instructions verbatim.
pub fn build_system_prompt(custom: Option<&str>, now: OffsetDateTime, zone: &str) -> String {
    let when = now
        .format(format_description!(
            "[weekday], [month repr:long] [day padding:none], [year] at [hour repr:12 padding:none]:[minute] [period]"
        ))
        .unwrap_or_else(|_| now.to_string());
    let offset = now
        .format(format_description!("[offset_hour sign:mandatory]:[offset_minute]"))
        .unwrap_or_else(|_| now.offset().to_string());
    let mut prompt = format!(
        "{SYSTEM_PREAMBLE}\n\nThe current date and time is {when} ({zone}, UTC{offset})."
    );
    if let Some(custom) = custom.filter(|custom| !custom.trim().is_empty()) {
        prompt.push_str("\n\n");
        prompt.push_str(custom);
    }
    prompt
}

pub fn local_system_prompt(custom: Option<&str>) -> String {
    let now = OffsetDateTime::now_local().unwrap_or_else(|_| OffsetDateTime::now_utc());
    let zone = zone_label(
        env::var(TZ_ENV).ok().as_deref(),
        iana_time_zone::get_timezone().ok(),
    );
    build_system_prompt(custom, now, &zone)
}

/// `TZ` drives the local offset, so it names the zone whenever it is set.
fn zone_label(tz: Option<&str>, system: Option<String>) -> String {
    let from_env = tz
        .map(|raw| raw.trim().trim_start_matches(':'))
        .map(|raw| raw.strip_prefix(ZONEINFO_DIR).unwrap_or(raw))
        .filter(|raw| !raw.is_empty());
    match from_env {
        Some(zone) => zone.to_string(),
        None => system
            .filter(|zone| !zone.trim().is_empty())
            .unwrap_or_else(|| "UTC".to_string()),
    }
}
