//! Deterministic test doubles for the orchestrator: a scripted model
//! client, configurable stub tools, and a chunk recorder.

use codewright_core::{
    AgentChunk, CancellationToken, ChatRequest, ChunkSink, TokenUsage, ToolOutput,
};
use codewright_llm::{BlockKind, ModelClient, StreamError, StreamEvent};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

// ── Scripted model client ──

/// Replays pre-built event scripts, one per model round-trip, in order.
/// Running out of scripts is a request error; tests that trip it have a
/// control-flow bug.
pub struct ScriptedModelClient {
    turns: Mutex<VecDeque<Vec<StreamEvent>>>,
}

impl ScriptedModelClient {
    pub fn new(turns: Vec<Vec<StreamEvent>>) -> Self {
        Self {
            turns: Mutex::new(VecDeque::from(turns)),
        }
    }

    /// How many scripted turns remain unconsumed.
    pub fn remaining(&self) -> usize {
        self.turns.lock().map(|t| t.len()).unwrap_or(0)
    }
}

impl ModelClient for ScriptedModelClient {
    fn stream_turn(
        &self,
        _req: &ChatRequest,
        on_event: &mut dyn FnMut(StreamEvent),
        cancel: &CancellationToken,
    ) -> Result<(), StreamError> {
        let turn = self
            .turns
            .lock()
            .ok()
            .and_then(|mut turns| turns.pop_front())
            .ok_or_else(|| StreamError::Request("no more scripted responses".to_string()))?;
        for event in turn {
            if cancel.is_cancelled() {
                return Ok(());
            }
            on_event(event);
        }
        Ok(())
    }
}

/// A model client that always fails, for exercising the terminal
/// stream-error path.
pub struct FailingModelClient;

impl ModelClient for FailingModelClient {
    fn stream_turn(
        &self,
        _req: &ChatRequest,
        _on_event: &mut dyn FnMut(StreamEvent),
        _cancel: &CancellationToken,
    ) -> Result<(), StreamError> {
        Err(StreamError::Request("connection refused".to_string()))
    }
}

fn usage_delta() -> StreamEvent {
    StreamEvent::MessageDelta {
        stop_reason: None,
        usage: TokenUsage {
            input_tokens: 100,
            output_tokens: 50,
        },
    }
}

/// Script for a text-only model turn.
pub fn text_turn(text: &str) -> Vec<StreamEvent> {
    vec![
        StreamEvent::BlockStart {
            index: 0,
            kind: BlockKind::Text,
        },
        StreamEvent::TextDelta {
            index: 0,
            text: text.to_string(),
        },
        StreamEvent::BlockStop { index: 0 },
        usage_delta(),
        StreamEvent::MessageDelta {
            stop_reason: Some("stop".to_string()),
            usage: TokenUsage::default(),
        },
        StreamEvent::MessageStop,
    ]
}

/// Script for a turn requesting the given tool calls, each given as
/// `(id, tool_name, arguments_json)`.
pub fn tool_turn(calls: &[(&str, &str, &str)]) -> Vec<StreamEvent> {
    let mut events = Vec::new();
    for (offset, (id, name, args)) in calls.iter().enumerate() {
        let index = offset + 1;
        events.push(StreamEvent::BlockStart {
            index,
            kind: BlockKind::ToolUse {
                id: (*id).to_string(),
                name: (*name).to_string(),
            },
        });
        events.push(StreamEvent::InputJsonDelta {
            index,
            partial_json: (*args).to_string(),
        });
        events.push(StreamEvent::BlockStop { index });
    }
    events.push(usage_delta());
    events.push(StreamEvent::MessageDelta {
        stop_reason: Some("tool_calls".to_string()),
        usage: TokenUsage::default(),
    });
    events.push(StreamEvent::MessageStop);
    events
}

// ── Stub tools ──

/// A configurable tool double. Records every executed input so tests can
/// assert the executed value equals the permission-checked value.
pub struct StubTool {
    name: String,
    output: String,
    is_error: bool,
    parallel_safe: bool,
    write: bool,
    delay: Duration,
    invocations: Mutex<Vec<serde_json::Value>>,
}

impl StubTool {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            output: "ok".to_string(),
            is_error: false,
            parallel_safe: false,
            write: false,
            delay: Duration::ZERO,
            invocations: Mutex::new(Vec::new()),
        }
    }

    pub fn output(mut self, output: impl Into<String>) -> Self {
        self.output = output.into();
        self
    }

    /// Make every execution report an error result.
    pub fn failing(mut self, output: impl Into<String>) -> Self {
        self.output = output.into();
        self.is_error = true;
        self
    }

    pub fn parallel_safe(mut self, yes: bool) -> Self {
        self.parallel_safe = yes;
        self
    }

    pub fn write_op(mut self, yes: bool) -> Self {
        self.write = yes;
        self
    }

    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Every input this tool was executed with, in execution order.
    pub fn invocations(&self) -> Vec<serde_json::Value> {
        self.invocations.lock().map(|i| i.clone()).unwrap_or_default()
    }
}

impl codewright_core::Tool for StubTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        "test stub"
    }

    fn input_schema(&self) -> serde_json::Value {
        serde_json::json!({"type": "object"})
    }

    fn execute(&self, _cancel: &CancellationToken, args: &serde_json::Value) -> ToolOutput {
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }
        if let Ok(mut invocations) = self.invocations.lock() {
            invocations.push(args.clone());
        }
        ToolOutput {
            output: self.output.clone(),
            is_error: self.is_error,
        }
    }

    fn is_parallel_safe(&self) -> bool {
        self.parallel_safe
    }

    fn is_write_operation(&self) -> bool {
        self.write
    }

    fn file_path(&self, args: &serde_json::Value) -> Option<String> {
        args.get("path")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
    }

    /// Strips a leading `./` from the path — idempotent by construction.
    fn normalize_args(&self, mut args: serde_json::Value) -> serde_json::Value {
        if let Some(path) = args.get("path").and_then(|v| v.as_str()) {
            let trimmed = path.strip_prefix("./").unwrap_or(path).to_string();
            args["path"] = serde_json::Value::String(trimmed);
        }
        args
    }
}

// ── Chunk recorder ──

/// Collects every emitted chunk for later assertions.
#[derive(Clone, Default)]
pub struct ChunkRecorder {
    chunks: Arc<Mutex<Vec<AgentChunk>>>,
}

impl ChunkRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sink(&self) -> ChunkSink {
        let chunks = Arc::clone(&self.chunks);
        Arc::new(move |chunk| {
            if let Ok(mut recorded) = chunks.lock() {
                recorded.push(chunk);
            }
        })
    }

    pub fn chunks(&self) -> Vec<AgentChunk> {
        self.chunks.lock().map(|c| c.clone()).unwrap_or_default()
    }

    pub fn text(&self) -> String {
        self.chunks()
            .iter()
            .filter_map(|c| match c {
                AgentChunk::TextDelta(text) => Some(text.as_str().to_string()),
                _ => None,
            })
            .collect()
    }
}

/// A scratch workspace directory that cleans up on drop.
pub fn temp_workspace() -> tempfile::TempDir {
    tempfile::tempdir().expect("create temp workspace")
}
