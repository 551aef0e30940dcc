//! The orchestration loop: streams model output, extracts tool-use
//! requests, gates them through the permission policy, schedules the
//! allowed subset onto the worker pool, feeds results back into the
//! conversation, and repeats until the model stops requesting tools,
//! the repetition guard trips, or the caller cancels.

use anyhow::Result;
use codewright_core::{
    AgentChunk, AppConfig, CancellationToken, ChatMessage, ChatRequest, ChunkSink, GuardConfig,
    PermissionReply, TaskResult, TokenUsage, Tool, ToolCall, ToolCallStatus, ToolOutput,
    ToolRegistry, ToolUseBlock, null_sink,
};
use codewright_llm::{ModelClient, ResponseAccumulator, StreamEvent};
use codewright_observe::Observer;
use codewright_policy::{PolicyEngine, RuleAction};
use std::sync::Arc;

use crate::compaction::Compactor;
use crate::gate::PermissionGate;
use crate::guard::RepetitionGuard;
use crate::pool::{PoolTask, WorkerPool};
use crate::scheduler::{CallProfile, group_by_conflicts};

/// Finish reason when the repetition guard stops a turn.
pub const FINISH_REASON_DOOM_LOOP: &str = "doom_loop";

/// Finish reason when the caller cancels; the stop is silent (no chunk).
pub const FINISH_REASON_CANCELLED: &str = "cancelled";

/// Model parameters for the loop's round-trips.
#[derive(Debug, Clone)]
pub struct LoopConfig {
    pub model: String,
    pub max_tokens: u32,
    pub temperature: Option<f32>,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            model: "deepseek-chat".to_string(),
            max_tokens: 8192,
            temperature: None,
        }
    }
}

impl LoopConfig {
    pub fn from_app_config(cfg: &AppConfig) -> Self {
        Self {
            model: cfg.llm.model.clone(),
            max_tokens: cfg.llm.max_tokens,
            temperature: None,
        }
    }
}

/// Result of running one turn to completion.
#[derive(Debug, Clone)]
pub struct TurnResult {
    /// Final assistant text.
    pub response: String,
    /// Why the turn stopped: the model's stop reason, `doom_loop`, or
    /// `cancelled`.
    pub finish_reason: String,
    /// Aggregated usage across every model round-trip in the turn.
    pub usage: TokenUsage,
    /// Number of model round-trips made.
    pub iterations: usize,
    /// Number of tool executions (including synthetic error results).
    pub tool_calls_made: usize,
    /// Full conversation, for continuing across turns.
    pub messages: Vec<ChatMessage>,
}

enum BatchOutcome {
    Cancelled,
    Completed {
        results: Vec<TaskResult>,
        calls_made: usize,
    },
}

/// The turn state machine. One instance drives one conversation; `run`
/// may be called repeatedly for follow-up user messages.
pub struct AgentLoop<'a> {
    model: &'a (dyn ModelClient + Send + Sync),
    registry: Arc<ToolRegistry>,
    policy: PolicyEngine,
    guard: RepetitionGuard,
    pool: WorkerPool,
    compactor: Option<Box<dyn Compactor>>,
    observer: Option<Arc<Observer>>,
    gate: Arc<PermissionGate>,
    cancel: CancellationToken,
    sink: ChunkSink,
    config: LoopConfig,
    messages: Vec<ChatMessage>,
}

impl<'a> AgentLoop<'a> {
    pub fn new(
        model: &'a (dyn ModelClient + Send + Sync),
        registry: Arc<ToolRegistry>,
        policy: PolicyEngine,
        config: LoopConfig,
        system_prompt: String,
    ) -> Self {
        Self {
            model,
            registry,
            policy,
            guard: RepetitionGuard::new(GuardConfig::default()),
            pool: WorkerPool::new(4),
            compactor: None,
            observer: None,
            gate: Arc::new(PermissionGate::new()),
            cancel: CancellationToken::new(),
            sink: null_sink(),
            config,
            messages: vec![ChatMessage::System {
                content: system_prompt,
            }],
        }
    }

    pub fn set_sink(&mut self, sink: ChunkSink) {
        self.sink = sink;
    }

    pub fn set_observer(&mut self, observer: Arc<Observer>) {
        self.observer = Some(observer);
    }

    pub fn set_compactor(&mut self, compactor: Box<dyn Compactor>) {
        self.compactor = Some(compactor);
    }

    pub fn with_guard_config(mut self, cfg: GuardConfig) -> Self {
        self.guard = RepetitionGuard::new(cfg);
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.pool = WorkerPool::new(workers);
        self
    }

    /// Seed the conversation with prior history (after the system
    /// prompt).
    pub fn with_history(mut self, history: Vec<ChatMessage>) -> Self {
        self.messages.extend(history);
        self
    }

    /// The inbox the caller answers permission requests through.
    pub fn gate(&self) -> Arc<PermissionGate> {
        Arc::clone(&self.gate)
    }

    /// The token that cancels the stream, the permission wait, and
    /// every dispatched tool.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Run one turn. The repetition guard is rearmed: each user message
    /// starts a fresh budget.
    pub fn run(&mut self, user_message: &str) -> Result<TurnResult> {
        self.guard.reset();
        self.messages.push(ChatMessage::User {
            content: user_message.to_string(),
        });
        self.execute_loop()
    }

    fn execute_loop(&mut self) -> Result<TurnResult> {
        let mut total_usage = TokenUsage::default();
        let mut tool_calls_made = 0usize;

        loop {
            // Caller cancellation stops silently — no error chunk.
            if self.cancel.is_cancelled() {
                return Ok(self.finished(String::new(), FINISH_REASON_CANCELLED, total_usage, tool_calls_made));
            }

            self.guard.record_iteration();
            let detection = self.guard.check();
            if detection.detected {
                return Ok(self.guard_tripped(&detection.reason, total_usage, tool_calls_made));
            }

            self.maybe_compact();

            let request = self.build_request();
            let mut accumulator = ResponseAccumulator::new();
            let sink = self.sink.clone();
            let stream_result = self.model.stream_turn(
                &request,
                &mut |event| {
                    if let StreamEvent::TextDelta { text, .. } = &event {
                        sink(AgentChunk::TextDelta(text.clone()));
                    }
                    accumulator.push(&event);
                },
                &self.cancel,
            );
            if self.cancel.is_cancelled() {
                return Ok(self.finished(String::new(), FINISH_REASON_CANCELLED, total_usage, tool_calls_made));
            }
            if let Err(err) = stream_result {
                let message = err.to_string();
                self.emit(AgentChunk::Error {
                    message: message.clone(),
                });
                self.observe_warn(&format!("model stream error: {message}"));
                return Err(err.into());
            }

            let response = accumulator.finish();
            total_usage.add(&response.usage);

            self.messages.push(ChatMessage::Assistant {
                content: (!response.text.is_empty()).then(|| response.text.clone()),
                tool_calls: response.tool_uses.clone(),
            });

            // No tool-use blocks: the model is done.
            if response.tool_uses.is_empty() {
                self.emit(AgentChunk::Done {
                    usage: total_usage,
                    reason: None,
                });
                return Ok(self.finished(
                    response.text,
                    &response.stop_reason,
                    total_usage,
                    tool_calls_made,
                ));
            }

            match self.run_tool_batch(&response.tool_uses)? {
                BatchOutcome::Cancelled => {
                    return Ok(self.finished(String::new(), FINISH_REASON_CANCELLED, total_usage, tool_calls_made));
                }
                BatchOutcome::Completed { results, calls_made } => {
                    tool_calls_made += calls_made;
                    // One batched conversation turn, in call order.
                    for result in &results {
                        self.messages.push(ChatMessage::Tool {
                            tool_call_id: result.id.clone(),
                            content: tool_message_content(result),
                        });
                    }
                }
            }

            // Re-check after the batch so a tripped guard never buys one
            // more model round-trip.
            let detection = self.guard.check();
            if detection.detected {
                return Ok(self.guard_tripped(&detection.reason, total_usage, tool_calls_made));
            }
        }
    }

    /// Normalize → permission-check → schedule → execute one batch of
    /// tool-use blocks. Permission checks run strictly sequentially, in
    /// call-submission order; execution runs group by group on the pool.
    fn run_tool_batch(&mut self, tool_uses: &[ToolUseBlock]) -> Result<BatchOutcome> {
        let mut slots: Vec<Option<TaskResult>> = (0..tool_uses.len()).map(|_| None).collect();
        let mut pending: Vec<(usize, Arc<dyn Tool>, ToolCallStatus)> = Vec::new();
        let mut calls_made = 0usize;

        for (index, block) in tool_uses.iter().enumerate() {
            let args: serde_json::Value = match serde_json::from_str(&block.arguments) {
                Ok(value) => value,
                Err(parse_err) => {
                    self.emit(AgentChunk::ToolCallStart {
                        id: block.id.clone(),
                        tool_name: block.name.clone(),
                        args_summary: truncate_summary(&block.arguments),
                    });
                    let message = format!("invalid tool arguments: {parse_err}");
                    let raw = serde_json::Value::String(block.arguments.clone());
                    self.guard.record_tool_call(&block.name, &raw, &message, true);
                    slots[index] = Some(self.resolve_error(block, &message));
                    calls_made += 1;
                    continue;
                }
            };
            let call = ToolCall {
                id: block.id.clone(),
                name: block.name.clone(),
                args,
            };
            self.emit(AgentChunk::ToolCallStart {
                id: call.id.clone(),
                tool_name: call.name.clone(),
                args_summary: summarize_args(&call.args),
            });

            // Unknown tools resolve to an error result before grouping —
            // they are never scheduled.
            let Some(tool) = self.registry.get(&call.name) else {
                let message = format!("unknown tool `{}`", call.name);
                self.guard.record_tool_call(&call.name, &call.args, &message, true);
                slots[index] = Some(self.resolve_error(block, &message));
                calls_made += 1;
                continue;
            };

            // Normalize once; the permission check and the execution
            // both see this exact value.
            let normalized = tool.normalize_args(call.args.clone());
            self.emit(AgentChunk::ToolCallInput {
                id: call.id.clone(),
                tool_name: call.name.clone(),
                normalized_args: normalized.clone(),
            });

            let allowed = match self.policy.check(&call.name, &normalized) {
                RuleAction::Allow => true,
                RuleAction::Deny => false,
                RuleAction::Ask => {
                    self.emit(AgentChunk::PermissionRequest {
                        id: call.id.clone(),
                        tool_name: call.name.clone(),
                        normalized_args: normalized.clone(),
                    });
                    match self.gate.wait(&self.cancel) {
                        None => return Ok(BatchOutcome::Cancelled),
                        Some(PermissionReply::Granted) => true,
                        Some(PermissionReply::GrantedAlways) => {
                            self.policy.allow_always(&call.name, &normalized);
                            true
                        }
                        Some(PermissionReply::Denied) => false,
                    }
                }
            };

            let status = ToolCallStatus {
                call,
                normalized_args: normalized,
                allowed,
            };
            if allowed {
                pending.push((index, tool, status));
            } else {
                let message = "permission denied".to_string();
                self.guard.record_tool_call(
                    &status.call.name,
                    &status.normalized_args,
                    &message,
                    true,
                );
                slots[index] = Some(self.resolve_error(block, &message));
                calls_made += 1;
            }
        }

        // Group the allowed subset and execute group by group; members
        // of a group run concurrently, groups run strictly in order.
        let profiles: Vec<CallProfile> = pending
            .iter()
            .map(|(_, tool, status)| CallProfile::for_tool(tool.as_ref(), &status.normalized_args))
            .collect();
        for group in group_by_conflicts(&profiles) {
            let tasks: Vec<PoolTask> = group
                .iter()
                .map(|&member| {
                    let (_, tool, status) = &pending[member];
                    PoolTask {
                        id: status.call.id.clone(),
                        name: status.call.name.clone(),
                        tool: Arc::clone(tool),
                        args: status.normalized_args.clone(),
                    }
                })
                .collect();
            let results = self.pool.execute_batch(&self.cancel, tasks, None);
            for (&member, result) in group.iter().zip(results) {
                let (index, _, status) = &pending[member];
                self.guard.record_tool_call(
                    &status.call.name,
                    &status.normalized_args,
                    &result.result.output,
                    result.result.is_error,
                );
                self.emit(AgentChunk::ToolResult {
                    id: result.id.clone(),
                    tool_name: result.name.clone(),
                    output: result.result.output.clone(),
                    is_error: result.result.is_error,
                });
                slots[*index] = Some(result);
                calls_made += 1;
            }
        }

        let results: Vec<TaskResult> = slots
            .into_iter()
            .enumerate()
            .map(|(index, slot)| {
                slot.unwrap_or_else(|| TaskResult {
                    id: tool_uses[index].id.clone(),
                    name: tool_uses[index].name.clone(),
                    result: ToolOutput::error("no result produced"),
                    err: Some("no result produced".to_string()),
                })
            })
            .collect();
        Ok(BatchOutcome::Completed {
            results,
            calls_made,
        })
    }

    /// Resolve a call to a synthetic error result locally and tell the
    /// caller about it.
    fn resolve_error(&self, block: &ToolUseBlock, message: &str) -> TaskResult {
        self.emit(AgentChunk::ToolResult {
            id: block.id.clone(),
            tool_name: block.name.clone(),
            output: message.to_string(),
            is_error: true,
        });
        TaskResult {
            id: block.id.clone(),
            name: block.name.clone(),
            result: ToolOutput::error(message),
            err: Some(message.to_string()),
        }
    }

    fn maybe_compact(&mut self) {
        let Some(compactor) = &self.compactor else {
            return;
        };
        if !compactor.needs_compaction(&self.messages) {
            return;
        }
        match compactor.compact(&self.messages) {
            Ok((compacted, stats)) => {
                self.messages = compacted;
                self.emit(AgentChunk::Compacted {
                    tokens_before: stats.tokens_before,
                    tokens_after: stats.tokens_after,
                });
                if let Some(observer) = &self.observer {
                    observer.record(&format!(
                        "compacted conversation: {} -> {} tokens",
                        stats.tokens_before, stats.tokens_after
                    ));
                }
            }
            // Compaction failure is non-fatal: proceed with the
            // uncompacted conversation and let the next model call
            // surface any context-limit error.
            Err(err) => self.observe_warn(&format!("compaction failed: {err}")),
        }
    }

    fn build_request(&self) -> ChatRequest {
        ChatRequest {
            model: self.config.model.clone(),
            messages: self.messages.clone(),
            tools: self.registry.definitions(),
            max_tokens: self.config.max_tokens,
            temperature: self.config.temperature,
        }
    }

    fn guard_tripped(
        &self,
        reason: &str,
        usage: TokenUsage,
        tool_calls_made: usize,
    ) -> TurnResult {
        self.emit(AgentChunk::Error {
            message: format!("stopping: {reason}"),
        });
        self.observe_warn(&format!("repetition guard tripped: {reason}"));
        self.finished(String::new(), FINISH_REASON_DOOM_LOOP, usage, tool_calls_made)
    }

    fn finished(
        &self,
        response: String,
        finish_reason: &str,
        usage: TokenUsage,
        tool_calls_made: usize,
    ) -> TurnResult {
        TurnResult {
            response,
            finish_reason: finish_reason.to_string(),
            usage,
            iterations: self.guard.iterations(),
            tool_calls_made,
            messages: self.messages.clone(),
        }
    }

    fn emit(&self, chunk: AgentChunk) {
        (self.sink)(chunk);
    }

    fn observe_warn(&self, msg: &str) {
        if let Some(observer) = &self.observer {
            observer.warn_log(msg);
        }
    }
}

/// What the model sees for a result: the output, error-prefixed when the
/// call failed so it can react.
fn tool_message_content(result: &TaskResult) -> String {
    if result.result.is_error {
        format!("ERROR: {}", result.result.output)
    } else {
        result.result.output.clone()
    }
}

/// Short human-readable argument summary for progress display.
fn summarize_args(args: &serde_json::Value) -> String {
    let summary = if let Some(cmd) = args.get("command").and_then(|v| v.as_str()) {
        cmd.to_string()
    } else if let Some(path) = args
        .get("path")
        .or_else(|| args.get("file_path"))
        .and_then(|v| v.as_str())
    {
        path.to_string()
    } else {
        args.to_string()
    };
    truncate_summary(&summary)
}

fn truncate_summary(text: &str) -> String {
    const MAX: usize = 80;
    if text.len() <= MAX {
        return text.to_string();
    }
    let mut end = MAX;
    while end > 0 && !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &text[..end])
}
