use futures::StreamExt;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::accumulator::{ExecutionUpdate, StreamRelay, ToolCallDelta};
use crate::protocol::transport::InferenceTransport;
use crate::protocol::{non_empty_str, parse_usage};
use crate::ModelError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChunkState {
    AwaitingFirst,
    Streaming,
    Done,
}

/// Drives one chat-completions stream until a chunk carries `finish_reason`.
pub(crate) async fn run_chat_completions(
    transport: &dyn InferenceTransport,
    payload: &Value,
    relay: &mut StreamRelay<'_>,
    cancel: &CancellationToken,
) -> Result<(), ModelError> {
    let mut chunks = tokio::select! {
        biased;
        _ = cancel.cancelled() => return Err(ModelError::Cancelled),
        opened = transport.open_chat_completions(payload) => opened?,
    };

    let mut state = ChunkState::AwaitingFirst;
    while state != ChunkState::Done {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ModelError::Cancelled),
            next = chunks.next() => next,
        };
        let Some(chunk) = next else {
            return Err(ModelError::StreamEndedUnexpectedly);
        };
        state = apply_chunk(&chunk?, state, relay)?;
    }
    Ok(())
}

fn apply_chunk(
    chunk: &Value,
    state: ChunkState,
    relay: &mut StreamRelay<'_>,
) -> Result<ChunkState, ModelError> {
    if let Some(error) = chunk_error(chunk) {
        return Err(error);
    }

    let x_groq = chunk.get("x_groq");
    if let Some(usage) = parse_usage(chunk.get("usage"))
        .or_else(|| parse_usage(x_groq.and_then(|value| value.get("usage"))))
    {
        relay.accumulator_mut().set_usage(usage);
    }

    let Some(choice) = chunk
        .get("choices")
        .and_then(Value::as_array)
        .and_then(|choices| choices.first())
    else {
        return Ok(state);
    };
    let delta = choice.get("delta");
    let mut state = state;

    if let Some(role) = non_empty_str(delta.and_then(|delta| delta.get("role"))) {
        if state == ChunkState::AwaitingFirst {
            let id = chunk.get("id").and_then(Value::as_str).unwrap_or_default();
            relay.start(id, role);
            state = ChunkState::Streaming;
        }
    }

    if let Some(delta) = delta {
        if let Some(text) = delta.get("content").and_then(Value::as_str) {
            relay.content(text);
        }
        if let Some(text) = delta
            .get("reasoning")
            .and_then(Value::as_str)
            .or_else(|| delta.get("reasoning_content").and_then(Value::as_str))
        {
            relay.reasoning(text);
        }
        for (position, item) in array_items(delta.get("executed_tools")) {
            apply_executed_tool(item, position, relay);
        }
        for (position, item) in array_items(delta.get("tool_calls")) {
            relay.tool_call(ToolCallDelta {
                index: item
                    .get("index")
                    .and_then(Value::as_u64)
                    .unwrap_or(position),
                id: item.get("id").and_then(Value::as_str).map(ToString::to_string),
                name: item
                    .pointer("/function/name")
                    .and_then(Value::as_str)
                    .map(ToString::to_string),
                arguments: item
                    .pointer("/function/arguments")
                    .and_then(Value::as_str)
                    .map(ToString::to_string),
            });
        }
    }

    if let Some(reason) = non_empty_str(choice.get("finish_reason")) {
        debug!(finish_reason = reason, "chat completions stream finished");
        state = ChunkState::Done;
    } else if state == ChunkState::AwaitingFirst && delta.is_some() {
        state = ChunkState::Streaming;
    }
    Ok(state)
}

fn array_items(value: Option<&Value>) -> impl Iterator<Item = (u64, &Value)> {
    value
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .enumerate()
        .map(|(position, item)| (position as u64, item))
}

/// First sighting starts the record; a sighting with `output` completes it.
fn apply_executed_tool(item: &Value, position: u64, relay: &mut StreamRelay<'_>) {
    let index = item
        .get("index")
        .and_then(Value::as_u64)
        .unwrap_or(position);
    let name = item.get("name").and_then(Value::as_str).map(ToString::to_string);
    let arguments = item.get("arguments").map(text_or_json);
    let output = item
        .get("output")
        .filter(|output| !output.is_null())
        .map(text_or_json);
    let search_results = item
        .get("search_results")
        .filter(|results| !results.is_null())
        .cloned();

    if !relay.accumulator().has_execution(index) {
        relay.execution(ExecutionUpdate::Started {
            index,
            kind: item
                .get("type")
                .and_then(Value::as_str)
                .unwrap_or("function")
                .to_string(),
            name: name.clone(),
            arguments: arguments.clone().unwrap_or_default(),
        });
    }
    relay.execution(ExecutionUpdate::Finished {
        index,
        name,
        arguments,
        output,
        search_results,
    });
}

fn text_or_json(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

/// Mid-stream error objects arrive either top-level or under `x_groq`.
fn chunk_error(chunk: &Value) -> Option<ModelError> {
    let error = chunk
        .get("error")
        .or_else(|| chunk.pointer("/x_groq/error"))
        .filter(|error| !error.is_null())?;
    let message = non_empty_str(error.get("message"))
        .or_else(|| non_empty_str(Some(error)))
        .unwrap_or("provider reported an error mid-stream");
    Some(ModelError::Provider {
        status: None,
        code: non_empty_str(error.get("code")).map(ToString::to_string),
        message: message.to_string(),
    })
}
