use std::collections::{BTreeMap, HashMap, HashSet};

use serde_json::Value;
use tether_kernel_core::SessionEmitter;
use tether_kernel_protocol::{
    ApprovalRequest, EventMsg, ExecutedTool, ExecutionPhase, ReasoningDeltaEvent, TextDeltaEvent,
    ToolCall, ToolCallsUpdateEvent, ToolExecutionEvent, Usage,
};
use tracing::warn;

use crate::summarizer::ReasoningSummarizer;

/// One incremental fragment of a client-executed tool call.
#[derive(Debug, Clone, Default, PartialEq)]
pub(crate) struct ToolCallDelta {
    pub index: u64,
    pub id: Option<String>,
    pub name: Option<String>,
    pub arguments: Option<String>,
}

/// Two-phase lifecycle of a provider-executed tool.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum ExecutionUpdate {
    Started {
        index: u64,
        kind: String,
        name: Option<String>,
        arguments: String,
    },
    Finished {
        index: u64,
        name: Option<String>,
        arguments: Option<String>,
        output: Option<String>,
        search_results: Option<Value>,
    },
}

/// Per-attempt stream state. Never shared between sessions.
#[derive(Debug, Default)]
pub(crate) struct ChunkAccumulator {
    content: String,
    reasoning: Option<String>,
    tool_calls: BTreeMap<u64, ToolCall>,
    executed_tools: Vec<ExecutedTool>,
    completed_executions: HashSet<u64>,
    tool_outputs: HashMap<String, String>,
    approval_requests: Vec<ApprovalRequest>,
    usage: Option<Usage>,
}

impl ChunkAccumulator {
    pub(crate) fn push_content(&mut self, text: &str) {
        self.content.push_str(text);
    }

    /// Appends reasoning and returns the whole trace so far.
    pub(crate) fn push_reasoning(&mut self, text: &str) -> &str {
        let reasoning = self.reasoning.get_or_insert_with(String::new);
        reasoning.push_str(text);
        reasoning.as_str()
    }

    pub(crate) fn merge_tool_call(&mut self, delta: ToolCallDelta) {
        let call = self
            .tool_calls
            .entry(delta.index)
            .or_insert_with(|| ToolCall::function(String::new(), String::new()));
        if let Some(id) = delta.id.filter(|id| !id.is_empty()) {
            call.id = id;
        }
        if let Some(name) = delta.name.filter(|name| !name.is_empty()) {
            call.function.name = name;
        }
        if let Some(arguments) = delta.arguments {
            call.function.arguments.push_str(&arguments);
        }
    }

    pub(crate) fn tool_call(&self, index: u64) -> Option<&ToolCall> {
        self.tool_calls.get(&index)
    }

    pub(crate) fn tool_calls(&self) -> Vec<ToolCall> {
        self.tool_calls.values().cloned().collect()
    }

    pub(crate) fn has_execution(&self, index: u64) -> bool {
        self.executed_tools.iter().any(|tool| tool.index == index)
    }

    /// Applies one phase of an executed tool, returning the event to publish, if any.
    pub(crate) fn apply_execution(&mut self, update: ExecutionUpdate) -> Option<ToolExecutionEvent> {
        match update {
            ExecutionUpdate::Started {
                index,
                kind,
                name,
                arguments,
            } => {
                if self.has_execution(index) {
                    self.check_execution_anomaly(index, name.as_deref(), Some(&arguments));
                    return None;
                }
                let tool = ExecutedTool {
                    index,
                    kind,
                    name,
                    arguments,
                    output: None,
                    search_results: None,
                };
                self.executed_tools.push(tool.clone());
                Some(ToolExecutionEvent {
                    phase: ExecutionPhase::Start,
                    tool,
                })
            }
            ExecutionUpdate::Finished {
                index,
                name,
                arguments,
                output,
                search_results,
            } => {
                if !self.has_execution(index) {
                    warn!(index, "executed tool finished before it started");
                    self.executed_tools.push(ExecutedTool {
                        index,
                        kind: "function".to_string(),
                        name: name.clone(),
                        arguments: arguments.clone().unwrap_or_default(),
                        output: None,
                        search_results: None,
                    });
                } else {
                    self.check_execution_anomaly(index, name.as_deref(), arguments.as_deref());
                }

                let already_completed = self.completed_executions.contains(&index);
                let tool = self
                    .executed_tools
                    .iter_mut()
                    .find(|tool| tool.index == index)?;
                if tool.search_results.is_none() {
                    tool.search_results = search_results;
                }
                // Remote calls start before their arguments have streamed.
                if tool.arguments.is_empty() {
                    if let Some(arguments) = arguments.filter(|arguments| !arguments.is_empty()) {
                        tool.arguments = arguments;
                    }
                }
                let output = output?;
                if already_completed {
                    return None;
                }
                tool.output = Some(output);
                let tool = tool.clone();
                self.completed_executions.insert(index);
                Some(ToolExecutionEvent {
                    phase: ExecutionPhase::Complete,
                    tool,
                })
            }
        }
    }

    fn check_execution_anomaly(&self, index: u64, name: Option<&str>, arguments: Option<&str>) {
        let Some(original) = self.executed_tools.iter().find(|tool| tool.index == index) else {
            return;
        };
        if let Some(arguments) = arguments {
            if !arguments.is_empty()
                && !original.arguments.is_empty()
                && arguments != original.arguments
            {
                warn!(
                    index,
                    original = %original.arguments,
                    observed = %arguments,
                    "executed tool arguments changed after start; keeping original"
                );
            }
        }
        if let (Some(name), Some(original_name)) = (name, original.name.as_deref()) {
            if !name.is_empty() && name != original_name {
                warn!(index, original = original_name, observed = name, "executed tool renamed after start; keeping original");
            }
        }
    }

    pub(crate) fn record_tool_output(&mut self, tool_call_id: &str, output: String) {
        self.tool_outputs.insert(tool_call_id.to_string(), output);
    }

    /// Returns false for an approval request already seen.
    pub(crate) fn add_approval_request(&mut self, request: ApprovalRequest) -> bool {
        if self
            .approval_requests
            .iter()
            .any(|existing| existing.id == request.id)
        {
            return false;
        }
        self.approval_requests.push(request);
        true
    }

    /// Usage is taken from the first message that carries it.
    pub(crate) fn set_usage(&mut self, usage: Usage) {
        if self.usage.is_none() {
            self.usage = Some(usage);
        }
    }

    pub(crate) fn into_parts(self) -> AccumulatedStream {
        AccumulatedStream {
            content: self.content,
            reasoning: self.reasoning.filter(|reasoning| !reasoning.is_empty()),
            tool_calls: self.tool_calls.into_values().collect(),
            executed_tools: self.executed_tools,
            tool_outputs: self.tool_outputs,
            approval_requests: self.approval_requests,
            usage: self.usage,
        }
    }
}

#[derive(Debug, Default)]
pub(crate) struct AccumulatedStream {
    pub content: String,
    pub reasoning: Option<String>,
    pub tool_calls: Vec<ToolCall>,
    pub executed_tools: Vec<ExecutedTool>,
    pub tool_outputs: HashMap<String, String>,
    pub approval_requests: Vec<ApprovalRequest>,
    pub usage: Option<Usage>,
}

/// Feeds decoded deltas into the accumulator and publishes the matching events.
pub(crate) struct StreamRelay<'a> {
    acc: ChunkAccumulator,
    emitter: &'a SessionEmitter,
    summarizer: &'a mut ReasoningSummarizer,
}

impl<'a> StreamRelay<'a> {
    pub(crate) fn new(emitter: &'a SessionEmitter, summarizer: &'a mut ReasoningSummarizer) -> Self {
        Self {
            acc: ChunkAccumulator::default(),
            emitter,
            summarizer,
        }
    }

    pub(crate) fn accumulator(&self) -> &ChunkAccumulator {
        &self.acc
    }

    pub(crate) fn accumulator_mut(&mut self) -> &mut ChunkAccumulator {
        &mut self.acc
    }

    pub(crate) fn into_accumulator(self) -> ChunkAccumulator {
        self.acc
    }

    pub(crate) fn start(&self, id: &str, role: &str) {
        self.emitter.emit_start(id, role);
    }

    pub(crate) fn content(&mut self, text: &str) {
        if text.is_empty() {
            return;
        }
        self.summarizer.stop();
        self.acc.push_content(text);
        self.emitter.emit(EventMsg::ContentDelta(TextDeltaEvent {
            text: text.to_string(),
        }));
    }

    pub(crate) fn reasoning(&mut self, text: &str) {
        if text.is_empty() {
            return;
        }
        let first = self.acc.reasoning.is_none();
        let accumulated = self.acc.push_reasoning(text).to_string();
        if first {
            self.summarizer.arm();
        }
        self.summarizer.observe(&accumulated);
        self.emitter.emit(EventMsg::ReasoningDelta(ReasoningDeltaEvent {
            text: text.to_string(),
            accumulated,
        }));
    }

    /// Merges one fragment and publishes the full current list.
    pub(crate) fn tool_call(&mut self, delta: ToolCallDelta) {
        self.acc.merge_tool_call(delta);
        self.emitter
            .emit(EventMsg::ToolCallsUpdate(ToolCallsUpdateEvent {
                tool_calls: self.acc.tool_calls(),
            }));
    }

    pub(crate) fn execution(&mut self, update: ExecutionUpdate) {
        if let Some(event) = self.acc.apply_execution(update) {
            self.emitter.emit(EventMsg::ToolExecution(event));
        }
    }

    pub(crate) fn approval(&mut self, request: ApprovalRequest) {
        if self.acc.add_approval_request(request.clone()) {
            self.emitter.emit(EventMsg::ApprovalRequest(request));
        }
    }
}
