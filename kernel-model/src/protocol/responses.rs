use std::collections::{HashMap, HashSet};

use futures::StreamExt;
use serde_json::Value;
use tether_kernel_protocol::ApprovalRequest;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::accumulator::{ExecutionUpdate, StreamRelay, ToolCallDelta};
use crate::protocol::sse::{parse_data_payload, SseLineDecoder};
use crate::protocol::transport::InferenceTransport;
use crate::protocol::{non_empty_str, parse_usage};
use crate::ModelError;

const MCP_TOOL_KIND: &str = "mcp";

/// What the stream reported about itself once it ended.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct ResponsesOutcome {
    pub api_status: Option<String>,
}

/// Decoder state for one Responses stream.
#[derive(Debug, Default)]
pub(crate) struct ResponsesDecoder {
    remote_labels: Vec<String>,
    item_indices: HashMap<String, u64>,
    suppressed: HashSet<String>,
    next_index: u64,
    failure: Option<(Option<String>, String)>,
    api_status: Option<String>,
    completed: bool,
}

impl ResponsesDecoder {
    pub(crate) fn new(remote_labels: Vec<String>) -> Self {
        Self {
            remote_labels,
            ..Self::default()
        }
    }

    pub(crate) fn is_completed(&self) -> bool {
        self.completed
    }

    pub(crate) fn handle(&mut self, event: &Value, relay: &mut StreamRelay<'_>) {
        let Some(kind) = event.get("type").and_then(Value::as_str) else {
            debug!("ignoring responses event without a type");
            return;
        };

        match kind {
            "response.created" => {
                let id = event
                    .pointer("/response/id")
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                relay.start(id, "assistant");
            }
            "response.output_text.delta" => {
                if let Some(delta) = event.get("delta").and_then(Value::as_str) {
                    relay.content(delta);
                }
            }
            "response.reasoning_text.delta" => {
                if let Some(delta) = event.get("delta").and_then(Value::as_str) {
                    relay.reasoning(delta);
                }
            }
            "response.output_item.added" => {
                if let Some(item) = event.get("item") {
                    self.item_added(item, relay);
                }
            }
            "response.output_item.done" => {
                if let Some(item) = event.get("item") {
                    self.item_done(item, relay);
                }
            }
            "response.completed" | "response.done" | "response.incomplete" => {
                let response = event.get("response");
                self.api_status = non_empty_str(response.and_then(|value| value.get("status")))
                    .map(ToString::to_string)
                    .or_else(|| (kind == "response.incomplete").then(|| "incomplete".to_string()));
                if let Some(usage) = parse_usage(response.and_then(|value| value.get("usage"))) {
                    relay.accumulator_mut().set_usage(usage);
                }
                self.completed = true;
            }
            "error" => {
                let message = non_empty_str(event.get("message"))
                    .or_else(|| non_empty_str(event.pointer("/error/message")))
                    .unwrap_or("responses stream reported an error");
                let code = non_empty_str(event.get("code"))
                    .or_else(|| non_empty_str(event.pointer("/error/code")));
                self.record_failure(code, message);
            }
            "response.failed" => {
                let error = event.pointer("/response/error");
                let message = non_empty_str(error.and_then(|error| error.get("message")))
                    .unwrap_or("response failed");
                let code = non_empty_str(error.and_then(|error| error.get("code")));
                self.record_failure(code, message);
            }
            other if other.ends_with("_arguments.delta") => self.arguments_delta(event, relay),
            other => debug!(event_type = other, "ignoring responses event"),
        }
    }

    fn record_failure(&mut self, code: Option<&str>, message: &str) {
        warn!(code = ?code, message, "responses stream reported failure");
        if self.failure.is_none() {
            self.failure = Some((code.map(ToString::to_string), message.to_string()));
        }
    }

    /// A shadow call is the provider echoing a remote connector tool as a local function.
    fn is_shadow_call(&self, name: &str) -> bool {
        name.split_once("__")
            .is_some_and(|(prefix, _)| self.remote_labels.iter().any(|label| label == prefix))
    }

    fn index_for(&mut self, item_id: &str) -> u64 {
        if let Some(index) = self.item_indices.get(item_id) {
            return *index;
        }
        let index = self.next_index;
        self.next_index += 1;
        self.item_indices.insert(item_id.to_string(), index);
        index
    }

    fn item_added(&mut self, item: &Value, relay: &mut StreamRelay<'_>) {
        let item_id = item.get("id").and_then(Value::as_str).unwrap_or_default();
        match item.get("type").and_then(Value::as_str) {
            Some("function_call") => {
                let name = item.get("name").and_then(Value::as_str).unwrap_or_default();
                if self.is_shadow_call(name) {
                    debug!(item_id, name, "suppressing shadow call of a remote connector tool");
                    self.suppressed.insert(item_id.to_string());
                    return;
                }
                let call_id = non_empty_str(item.get("call_id")).unwrap_or(item_id).to_string();
                let index = self.index_for(item_id);
                relay.tool_call(ToolCallDelta {
                    index,
                    id: Some(call_id),
                    name: Some(name.to_string()),
                    arguments: item
                        .get("arguments")
                        .and_then(Value::as_str)
                        .map(ToString::to_string),
                });
            }
            Some("mcp_call") => {
                let index = self.index_for(item_id);
                let name = item.get("name").and_then(Value::as_str).map(ToString::to_string);
                let arguments = item
                    .get("arguments")
                    .and_then(Value::as_str)
                    .map(ToString::to_string);
                relay.tool_call(ToolCallDelta {
                    index,
                    id: Some(item_id.to_string()),
                    name: name.clone(),
                    arguments: arguments.clone(),
                });
                relay.execution(ExecutionUpdate::Started {
                    index,
                    kind: MCP_TOOL_KIND.to_string(),
                    name,
                    arguments: arguments.unwrap_or_default(),
                });
            }
            Some("mcp_approval_request") => relay.approval(approval_request(item)),
            _ => {}
        }
    }

    fn item_done(&mut self, item: &Value, relay: &mut StreamRelay<'_>) {
        let item_id = item.get("id").and_then(Value::as_str).unwrap_or_default();
        match item.get("type").and_then(Value::as_str) {
            Some("function_call") => {
                if self.suppressed.contains(item_id) {
                    return;
                }
                if !self.item_indices.contains_key(item_id) {
                    self.item_added(item, relay);
                    return;
                }
                self.fill_missing_arguments(item_id, item, relay);
            }
            Some("mcp_call") => {
                if !self.item_indices.contains_key(item_id) {
                    self.item_added(item, relay);
                } else {
                    self.fill_missing_arguments(item_id, item, relay);
                }
                let index = self.index_for(item_id);
                let name = item.get("name").and_then(Value::as_str).map(ToString::to_string);
                let arguments = item
                    .get("arguments")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                let output = non_empty_str(item.get("output"))
                    .map(ToString::to_string)
                    .or_else(|| {
                        non_empty_str(item.get("error"))
                            .or_else(|| non_empty_str(item.pointer("/error/message")))
                            .map(|error| format!("Error: {error}"))
                    });

                if let Some(output) = output {
                    relay
                        .accumulator_mut()
                        .record_tool_output(item_id, output.clone());
                    relay.execution(ExecutionUpdate::Finished {
                        index,
                        name,
                        arguments: Some(arguments),
                        output: Some(output),
                        search_results: None,
                    });
                }
            }
            Some("mcp_approval_request") => relay.approval(approval_request(item)),
            _ => {}
        }
    }

    /// Some providers skip argument deltas and only send the final item.
    fn fill_missing_arguments(&self, item_id: &str, item: &Value, relay: &mut StreamRelay<'_>) {
        let Some(index) = self.item_indices.get(item_id).copied() else {
            return;
        };
        let Some(arguments) = non_empty_str(item.get("arguments")) else {
            return;
        };
        let streamed = relay
            .accumulator()
            .tool_call(index)
            .is_some_and(|call| !call.arguments().is_empty());
        if !streamed {
            relay.tool_call(ToolCallDelta {
                index,
                arguments: Some(arguments.to_string()),
                ..ToolCallDelta::default()
            });
        }
    }

    fn arguments_delta(&mut self, event: &Value, relay: &mut StreamRelay<'_>) {
        let Some(item_id) = event.get("item_id").and_then(Value::as_str) else {
            return;
        };
        if self.suppressed.contains(item_id) {
            return;
        }
        let Some(index) = self.item_indices.get(item_id).copied() else {
            debug!(item_id, "argument delta for unknown item");
            return;
        };
        let Some(delta) = event.get("delta").and_then(Value::as_str) else {
            return;
        };
        relay.tool_call(ToolCallDelta {
            index,
            arguments: Some(delta.to_string()),
            ..ToolCallDelta::default()
        });
    }

    /// Failures are surfaced only now, after everything already emitted.
    pub(crate) fn finish(self) -> Result<ResponsesOutcome, ModelError> {
        if let Some((code, message)) = self.failure {
            return Err(ModelError::StreamFailed { code, message });
        }
        if !self.completed {
            debug!("responses stream ended without a completion event");
        }
        Ok(ResponsesOutcome {
            api_status: self.api_status,
        })
    }
}

fn approval_request(item: &Value) -> ApprovalRequest {
    let text = |key: &str| {
        item.get(key)
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string()
    };
    ApprovalRequest {
        id: text("id"),
        name: text("name"),
        server_label: text("server_label"),
        arguments: text("arguments"),
    }
}

pub(crate) async fn run_responses(
    transport: &dyn InferenceTransport,
    payload: &Value,
    relay: &mut StreamRelay<'_>,
    remote_labels: Vec<String>,
    cancel: &CancellationToken,
) -> Result<ResponsesOutcome, ModelError> {
    let mut bytes = tokio::select! {
        biased;
        _ = cancel.cancelled() => return Err(ModelError::Cancelled),
        opened = transport.open_responses(payload) => opened?,
    };
    let mut lines = SseLineDecoder::new();
    let mut decoder = ResponsesDecoder::new(remote_labels);

    while !decoder.is_completed() {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ModelError::Cancelled),
            next = bytes.next() => next,
        };
        let payloads = match next {
            Some(chunk) => lines.push(&chunk?),
            None => {
                if let Some(payload) = lines.finish() {
                    if let Some(event) = parse_data_payload(&payload) {
                        decoder.handle(&event, relay);
                    }
                }
                break;
            }
        };
        for payload in payloads {
            if cancel.is_cancelled() {
                return Err(ModelError::Cancelled);
            }
            if let Some(event) = parse_data_payload(&payload) {
                decoder.handle(&event, relay);
            }
        }
    }

    decoder.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::transport::{ByteStream, ChunkStream};
    use crate::summarizer::{ReasoningLabeler, ReasoningSummarizer};
    use async_trait::async_trait;
    use bytes::Bytes;
    use futures::stream;
    use serde_json::json;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;
    use tether_kernel_core::SessionEmitter;
    use tether_kernel_protocol::{Event, EventMsg, ExecutionPhase};
    use tokio::sync::mpsc;

    struct SseTransport {
        pieces: Mutex<Option<Vec<String>>>,
    }

    #[async_trait]
    impl InferenceTransport for SseTransport {
        async fn open_chat_completions(&self, _payload: &Value) -> Result<ChunkStream, ModelError> {
            unreachable!("responses adapter never opens a chat stream")
        }

        async fn open_responses(&self, _payload: &Value) -> Result<ByteStream, ModelError> {
            let pieces = self.pieces.lock().expect("pieces lock").take().unwrap_or_default();
            Ok(stream::iter(pieces.into_iter().map(|piece| Ok(Bytes::from(piece)))).boxed())
        }

        async fn complete(&self, _payload: &Value) -> Result<Value, ModelError> {
            unreachable!("summaries are disabled in these tests")
        }
    }

    struct NeverLabeler;

    #[async_trait]
    impl ReasoningLabeler for NeverLabeler {
        async fn label(&self, _excerpt: &str) -> Result<String, ModelError> {
            Ok("unused".to_string())
        }
    }

    fn sse(events: &[Value]) -> String {
        events
            .iter()
            .map(|event| format!("data: {event}\n\n"))
            .collect()
    }

    async fn run(
        pieces: Vec<String>,
        labels: &[&str],
    ) -> (
        Result<ResponsesOutcome, ModelError>,
        Vec<EventMsg>,
        crate::accumulator::ChunkAccumulator,
    ) {
        let (tx, mut rx) = mpsc::unbounded_channel::<Event>();
        let emitter = Arc::new(SessionEmitter::new("s-1", "window", tx));
        let mut summarizer = ReasoningSummarizer::new(
            false,
            Arc::clone(&emitter),
            Arc::new(NeverLabeler),
            Duration::from_secs(2),
        );
        let transport = SseTransport {
            pieces: Mutex::new(Some(pieces)),
        };
        let cancel = emitter.cancellation_token();
        let mut relay = StreamRelay::new(&emitter, &mut summarizer);
        let result = run_responses(
            &transport,
            &json!({}),
            &mut relay,
            labels.iter().map(ToString::to_string).collect(),
            &cancel,
        )
        .await;
        let acc = relay.into_accumulator();
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event.msg);
        }
        (result, events, acc)
    }

    #[tokio::test]
    async fn text_deltas_split_across_reads_are_reassembled() {
        let body = sse(&[
            json!({"type": "response.created", "response": {"id": "resp_1"}}),
            json!({"type": "response.output_text.delta", "delta": "Hel"}),
            json!({"type": "response.output_text.delta", "delta": "lo"}),
            json!({"type": "response.completed", "response": {"status": "completed",
                   "usage": {"input_tokens": 5, "output_tokens": 2, "total_tokens": 7}}}),
        ]);
        let (first, second) = body.split_at(body.len() / 2);
        let pieces = vec![
            "data: {not json}\n\n".to_string(),
            first.to_string(),
            second.to_string(),
            "data: [DONE]\n\n".to_string(),
        ];

        let (result, events, acc) = run(pieces, &[]).await;
        let outcome = result.expect("stream completes");
        assert_eq!(outcome.api_status.as_deref(), Some("completed"));
        assert!(matches!(&events[0], EventMsg::Start(start) if start.id == "resp_1"));
        let parts = acc.into_parts();
        assert_eq!(parts.content, "Hello");
        assert_eq!(parts.usage.and_then(|usage| usage.prompt_tokens), Some(5));
    }

    #[tokio::test]
    async fn shadow_function_call_of_remote_connector_is_suppressed() {
        let body = sse(&[
            json!({"type": "response.created", "response": {"id": "resp_1"}}),
            json!({"type": "response.output_item.added", "output_index": 0,
                   "item": {"type": "function_call", "id": "fc_1", "call_id": "call_1", "name": "gmail__search", "arguments": ""}}),
            json!({"type": "response.function_call_arguments.delta", "item_id": "fc_1", "delta": "{\"q\":\"invoices\"}"}),
            json!({"type": "response.output_item.done",
                   "item": {"type": "function_call", "id": "fc_1", "call_id": "call_1", "name": "gmail__search", "arguments": "{\"q\":\"invoices\"}"}}),
            json!({"type": "response.output_text.delta", "delta": "Searching."}),
            json!({"type": "response.completed", "response": {"status": "completed"}}),
        ]);

        let (result, events, acc) = run(vec![body], &["gmail"]).await;
        result.expect("stream completes");
        assert!(!events
            .iter()
            .any(|event| matches!(event, EventMsg::ToolCallsUpdate(_))));
        assert!(acc.tool_calls().is_empty());
    }

    #[tokio::test]
    async fn local_function_call_streams_arguments_by_item_id() {
        let body = sse(&[
            json!({"type": "response.output_item.added",
                   "item": {"type": "function_call", "id": "fc_1", "call_id": "call_1", "name": "read_file", "arguments": ""}}),
            json!({"type": "response.function_call_arguments.delta", "item_id": "fc_1", "delta": "{\"path\":"}),
            json!({"type": "response.function_call_arguments.delta", "item_id": "fc_1", "delta": "\"a.txt\"}"}),
            json!({"type": "response.output_item.done",
                   "item": {"type": "function_call", "id": "fc_1", "call_id": "call_1", "name": "read_file", "arguments": "{\"path\":\"a.txt\"}"}}),
            json!({"type": "response.completed", "response": {"status": "requires_action"}}),
        ]);

        let (result, events, acc) = run(vec![body], &["gmail"]).await;
        let outcome = result.expect("stream completes");
        assert_eq!(outcome.api_status.as_deref(), Some("requires_action"));
        let calls = acc.tool_calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].id, "call_1");
        assert_eq!(calls[0].arguments(), "{\"path\":\"a.txt\"}");
        let updates = events
            .iter()
            .filter(|event| matches!(event, EventMsg::ToolCallsUpdate(_)))
            .count();
        assert_eq!(updates, 3);
    }

    #[tokio::test]
    async fn mcp_call_records_output_and_execution() {
        let body = sse(&[
            json!({"type": "response.output_item.added",
                   "item": {"type": "mcp_call", "id": "mcp_1", "name": "search", "server_label": "gmail", "arguments": ""}}),
            json!({"type": "response.mcp_call_arguments.delta", "item_id": "mcp_1", "delta": "{\"q\":\"x\"}"}),
            json!({"type": "response.output_item.done",
                   "item": {"type": "mcp_call", "id": "mcp_1", "name": "search", "server_label": "gmail",
                            "arguments": "{\"q\":\"x\"}", "output": "2 emails"}}),
            json!({"type": "response.completed", "response": {"status": "completed"}}),
        ]);

        let (result, events, acc) = run(vec![body], &["gmail"]).await;
        result.expect("stream completes");
        let executions = events
            .iter()
            .filter(|event| matches!(event, EventMsg::ToolExecution(_)))
            .count();
        assert_eq!(executions, 2);
        let parts = acc.into_parts();
        assert_eq!(parts.tool_outputs.get("mcp_1").map(String::as_str), Some("2 emails"));
        assert_eq!(parts.tool_calls[0].arguments(), "{\"q\":\"x\"}");
    }

    #[tokio::test]
    async fn mcp_call_start_is_published_when_added() {
        let body = sse(&[
            json!({"type": "response.output_item.added",
                   "item": {"type": "mcp_call", "id": "mcp_1", "name": "search", "server_label": "gmail", "arguments": ""}}),
            json!({"type": "response.mcp_call_arguments.delta", "item_id": "mcp_1", "delta": "{\"q\":\"x\"}"}),
            json!({"type": "response.output_text.delta", "delta": "waiting"}),
            json!({"type": "response.output_item.done",
                   "item": {"type": "mcp_call", "id": "mcp_1", "name": "search", "server_label": "gmail",
                            "arguments": "{\"q\":\"x\"}", "output": "2 emails"}}),
            json!({"type": "response.completed", "response": {"status": "completed"}}),
        ]);

        let (result, events, acc) = run(vec![body], &["gmail"]).await;
        result.expect("stream completes");
        let position = |wanted: fn(&EventMsg) -> bool| {
            events
                .iter()
                .position(wanted)
                .expect("event present")
        };
        let started = position(|event| {
            matches!(event, EventMsg::ToolExecution(exec) if exec.phase == ExecutionPhase::Start)
        });
        let content = position(|event| matches!(event, EventMsg::ContentDelta(_)));
        let completed = position(|event| {
            matches!(event, EventMsg::ToolExecution(exec) if exec.phase == ExecutionPhase::Complete)
        });
        assert!(started < content);
        assert!(content < completed);

        match &events[completed] {
            EventMsg::ToolExecution(exec) => {
                assert_eq!(exec.tool.kind, "mcp");
                assert_eq!(exec.tool.arguments, "{\"q\":\"x\"}");
                assert_eq!(exec.tool.output.as_deref(), Some("2 emails"));
            }
            other => panic!("expected tool execution, got {other:?}"),
        }
        let starts = events
            .iter()
            .filter(|event| {
                matches!(event, EventMsg::ToolExecution(exec) if exec.phase == ExecutionPhase::Start)
            })
            .count();
        assert_eq!(starts, 1);
        assert_eq!(acc.into_parts().executed_tools.len(), 1);
    }

    #[tokio::test]
    async fn mcp_call_seen_only_when_done_still_starts_first() {
        let body = sse(&[
            json!({"type": "response.output_item.done",
                   "item": {"type": "mcp_call", "id": "mcp_9", "name": "search", "server_label": "gmail",
                            "arguments": "{}", "error": "upstream timeout"}}),
            json!({"type": "response.completed", "response": {"status": "completed"}}),
        ]);

        let (result, events, acc) = run(vec![body], &["gmail"]).await;
        result.expect("stream completes");
        let phases = events
            .iter()
            .filter_map(|event| match event {
                EventMsg::ToolExecution(exec) => Some(exec.phase),
                _ => None,
            })
            .collect::<Vec<_>>();
        assert_eq!(phases, vec![ExecutionPhase::Start, ExecutionPhase::Complete]);
        let parts = acc.into_parts();
        assert_eq!(
            parts.tool_outputs.get("mcp_9").map(String::as_str),
            Some("Error: upstream timeout")
        );
    }

    #[tokio::test]
    async fn approval_requests_are_deduplicated() {
        let item = json!({"type": "mcp_approval_request", "id": "mcpr_1", "name": "send_email",
                          "server_label": "gmail", "arguments": "{\"to\":\"a@b.c\"}"});
        let body = sse(&[
            json!({"type": "response.output_item.added", "item": item}),
            json!({"type": "response.output_item.done", "item": item}),
            json!({"type": "response.completed", "response": {"status": "completed"}}),
        ]);

        let (result, events, acc) = run(vec![body], &[]).await;
        result.expect("stream completes");
        let approvals = events
            .iter()
            .filter_map(|event| match event {
                EventMsg::ApprovalRequest(request) => Some(request.server_label.clone()),
                _ => None,
            })
            .collect::<Vec<_>>();
        assert_eq!(approvals, vec!["gmail".to_string()]);
        assert_eq!(acc.into_parts().approval_requests.len(), 1);
    }

    #[tokio::test]
    async fn failure_is_surfaced_after_buffered_content() {
        let body = sse(&[
            json!({"type": "response.output_text.delta", "delta": "partial answer"}),
            json!({"type": "response.failed", "response": {"error": {"code": "server_error", "message": "upstream exploded"}}}),
        ]);

        let (result, events, _acc) = run(vec![body], &[]).await;
        assert!(matches!(&events[0], EventMsg::ContentDelta(delta) if delta.text == "partial answer"));
        match result {
            Err(ModelError::StreamFailed { code, message }) => {
                assert_eq!(code.as_deref(), Some("server_error"));
                assert_eq!(message, "upstream exploded");
            }
            other => panic!("expected stream failure, got {other:?}"),
        }
    }
}
