use std::collections::HashMap;

use tether_kernel_protocol::{CompletionRecord, FinishReason, ToolCall, ToolResultMessage};

use crate::accumulator::ChunkAccumulator;

/// Picks the finish reason: provider status, then pending approvals, then tool outputs.
pub(crate) fn derive_finish_reason(
    api_status: Option<&str>,
    pending_approvals: usize,
    tool_calls: &[ToolCall],
    tool_outputs: &HashMap<String, String>,
) -> FinishReason {
    if matches!(api_status, Some("requires_action") | Some("incomplete")) {
        return FinishReason::ToolCalls;
    }
    if pending_approvals > 0 {
        return FinishReason::McpApprovalRequired;
    }
    let answered = tool_calls
        .iter()
        .filter(|call| tool_outputs.contains_key(&call.id))
        .count();
    if !tool_calls.is_empty() && answered < tool_calls.len() {
        return FinishReason::ToolCalls;
    }
    FinishReason::Stop
}

pub(crate) fn assemble(acc: ChunkAccumulator, api_status: Option<&str>) -> CompletionRecord {
    let stream = acc.into_parts();
    let finish_reason = derive_finish_reason(
        api_status,
        stream.approval_requests.len(),
        &stream.tool_calls,
        &stream.tool_outputs,
    );
    let tool_results = stream
        .tool_calls
        .iter()
        .filter_map(|call| {
            stream
                .tool_outputs
                .get(&call.id)
                .map(|output| ToolResultMessage::new(&call.id, call.name(), output))
        })
        .collect();

    CompletionRecord {
        content: stream.content,
        tool_calls: stream.tool_calls,
        reasoning: stream.reasoning,
        executed_tools: stream.executed_tools,
        tool_results,
        approval_requests: stream.approval_requests,
        finish_reason,
        usage: stream.usage,
    }
}
