//! Shared vocabulary for the Codewright orchestrator.
//!
//! Everything that crosses a crate boundary lives here: tool calls and
//! their results, chat messages, the `Tool` trait and registry, stream
//! chunks emitted to the caller, cancellation, and configuration.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

// ── Tool calls and results ──

/// A tool invocation requested by the model. Immutable once parsed from
/// the response stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    /// Opaque id assigned by the model; echoed back in the tool result.
    pub id: String,
    pub name: String,
    pub args: serde_json::Value,
}

/// Outcome of permission evaluation for one call.
///
/// `normalized_args` is the exact value the permission check saw, and the
/// exact value handed to execution — the two must never diverge.
#[derive(Debug, Clone)]
pub struct ToolCallStatus {
    pub call: ToolCall,
    pub normalized_args: serde_json::Value,
    pub allowed: bool,
}

/// What a tool produced: an output string plus an error flag the model
/// can react to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolOutput {
    pub output: String,
    pub is_error: bool,
}

impl ToolOutput {
    pub fn ok(output: impl Into<String>) -> Self {
        Self {
            output: output.into(),
            is_error: false,
        }
    }

    pub fn error(output: impl Into<String>) -> Self {
        Self {
            output: output.into(),
            is_error: true,
        }
    }
}

/// One result per submitted `ToolCall`, returned in submission order.
/// `err` is set for failures the harness produced itself (unknown tool,
/// permission denied, cancellation) rather than the tool.
#[derive(Debug, Clone)]
pub struct TaskResult {
    pub id: String,
    pub name: String,
    pub result: ToolOutput,
    pub err: Option<String>,
}

/// A tool-use content block reconstructed from the model stream.
/// `arguments` is the raw JSON string as assembled from input deltas.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolUseBlock {
    pub id: String,
    pub name: String,
    pub arguments: String,
}

// ── Chat messages ──

/// A message in a multi-turn conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "role")]
pub enum ChatMessage {
    #[serde(rename = "system")]
    System { content: String },
    #[serde(rename = "user")]
    User { content: String },
    #[serde(rename = "assistant")]
    Assistant {
        #[serde(skip_serializing_if = "Option::is_none", default)]
        content: Option<String>,
        #[serde(skip_serializing_if = "Vec::is_empty", default)]
        tool_calls: Vec<ToolUseBlock>,
    },
    #[serde(rename = "tool")]
    Tool {
        tool_call_id: String,
        content: String,
    },
}

/// Rough token estimate: ~4 chars per token, conservative for English.
pub fn estimate_message_tokens(messages: &[ChatMessage]) -> u64 {
    let total_chars: u64 = messages
        .iter()
        .map(|m| match m {
            ChatMessage::System { content } | ChatMessage::User { content } => content.len() as u64,
            ChatMessage::Assistant {
                content,
                tool_calls,
            } => {
                content.as_deref().map_or(0, |c| c.len() as u64)
                    + tool_calls
                        .iter()
                        .map(|tc| (tc.name.len() + tc.arguments.len()) as u64)
                        .sum::<u64>()
            }
            ChatMessage::Tool { content, .. } => content.len() as u64,
        })
        .sum();
    total_chars / 4
}

// ── Model request/response shapes ──

/// Token usage aggregated across a turn.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
}

impl TokenUsage {
    /// Fold another usage report into this one.
    pub fn add(&mut self, other: &TokenUsage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
    }
}

/// A tool (function) definition sent to the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    #[serde(rename = "type")]
    pub tool_type: String,
    pub function: FunctionDefinition,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionDefinition {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

/// Request for one streaming model round-trip.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub tools: Vec<ToolDefinition>,
    pub max_tokens: u32,
    pub temperature: Option<f32>,
}

/// Fully assembled model response for one round-trip.
#[derive(Debug, Clone, Default)]
pub struct ModelResponse {
    pub text: String,
    pub tool_uses: Vec<ToolUseBlock>,
    pub stop_reason: String,
    pub usage: TokenUsage,
}

// ── Stream chunks exposed to the caller ──

/// Reply to a permission request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermissionReply {
    Granted,
    Denied,
    /// Grant and record a session override so the same call is not asked
    /// again for the rest of the process.
    GrantedAlways,
}

/// A typed chunk emitted by the agent loop as a turn progresses.
#[derive(Debug, Clone)]
pub enum AgentChunk {
    /// Incremental assistant text.
    TextDelta(String),
    /// A tool call was extracted from the model response.
    ToolCallStart {
        id: String,
        tool_name: String,
        args_summary: String,
    },
    /// The normalized input a call will be checked and executed with.
    ToolCallInput {
        id: String,
        tool_name: String,
        normalized_args: serde_json::Value,
    },
    /// One tool finished (or was resolved to a synthetic error).
    ToolResult {
        id: String,
        tool_name: String,
        output: String,
        is_error: bool,
    },
    /// The loop is blocked waiting for a permission answer.
    PermissionRequest {
        id: String,
        tool_name: String,
        normalized_args: serde_json::Value,
    },
    /// The conversation was compacted.
    Compacted {
        tokens_before: u64,
        tokens_after: u64,
    },
    /// Terminal: the model stopped requesting tools.
    Done {
        usage: TokenUsage,
        reason: Option<String>,
    },
    /// Terminal: stream failure or guard trip.
    Error { message: String },
}

/// Callback for receiving chunks. `Arc<dyn Fn>` so it can be cloned
/// across turns and threads; callers that want a channel bridge the sink
/// onto one.
pub type ChunkSink = Arc<dyn Fn(AgentChunk) + Send + Sync>;

/// A sink that drops every chunk.
pub fn null_sink() -> ChunkSink {
    Arc::new(|_| {})
}

// ── Tool trait and registry ──

/// A local tool the model may invoke.
///
/// The four capability methods have conservative defaults; a tool
/// overrides the ones it supports. The scheduler treats a tool that
/// overrides nothing as unsafe to run next to anything else.
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    fn input_schema(&self) -> serde_json::Value;

    /// Run the tool. Failures are reported in-band via
    /// `ToolOutput::is_error`; they never abort a batch.
    fn execute(&self, cancel: &CancellationToken, args: &serde_json::Value) -> ToolOutput;

    /// Whether this tool may run concurrently with other parallel-safe
    /// tools.
    fn is_parallel_safe(&self) -> bool {
        false
    }

    /// Whether this tool mutates state it targets.
    fn is_write_operation(&self) -> bool {
        false
    }

    /// The file path this call targets, if the tool is file-scoped.
    fn file_path(&self, _args: &serde_json::Value) -> Option<String> {
        None
    }

    /// Canonicalize the input before permission checking and execution.
    /// Must be idempotent: normalizing an already-normalized input is a
    /// no-op.
    fn normalize_args(&self, args: serde_json::Value) -> serde_json::Value {
        args
    }
}

/// Explicitly constructed tool registry, threaded through constructors;
/// never a process-global.
#[derive(Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
    order: Vec<String>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool. Re-registering a name replaces the previous tool.
    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        let name = tool.name().to_string();
        if self.tools.insert(name.clone(), tool).is_none() {
            self.order.push(name);
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Definitions for the model's tool catalog, in registration order.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.order
            .iter()
            .filter_map(|name| self.tools.get(name))
            .map(|tool| ToolDefinition {
                tool_type: "function".to_string(),
                function: FunctionDefinition {
                    name: tool.name().to_string(),
                    description: tool.description().to_string(),
                    parameters: tool.input_schema(),
                },
            })
            .collect()
    }
}

// ── Cancellation ──

/// A thread-safe cancellation token. Set by the caller (e.g. on Ctrl+C),
/// checked by the model stream, the permission wait, and the worker pool.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<std::sync::atomic::AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled
            .store(true, std::sync::atomic::Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(std::sync::atomic::Ordering::SeqCst)
    }

    /// Reset to "not cancelled" for reuse across turns.
    pub fn reset(&self) {
        self.cancelled
            .store(false, std::sync::atomic::Ordering::SeqCst);
    }
}

// ── Configuration ──

/// Directory for Codewright runtime state inside a workspace.
pub fn runtime_dir(workspace: &Path) -> PathBuf {
    workspace.join(".codewright")
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    pub base_url: String,
    /// Environment variable holding the API key.
    pub api_key_env: String,
    pub model: String,
    pub max_tokens: u32,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.deepseek.com".to_string(),
            api_key_env: "CODEWRIGHT_API_KEY".to_string(),
            model: "deepseek-chat".to_string(),
            max_tokens: 8192,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentLoopConfig {
    /// Context window budget used for the compaction trigger.
    pub context_window_tokens: u64,
    /// Fraction of the window at which compaction is attempted.
    pub compaction_threshold_pct: f64,
}

impl Default for AgentLoopConfig {
    fn default() -> Self {
        Self {
            context_window_tokens: 128_000,
            compaction_threshold_pct: 0.95,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GuardConfig {
    pub max_iterations: usize,
    pub max_repeated_calls: usize,
    pub max_consecutive_errors: usize,
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            max_iterations: 200,
            max_repeated_calls: 3,
            max_consecutive_errors: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub workers: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self { workers: 4 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyFileConfig {
    /// Default action when no rule matches: "allow", "deny" or "ask".
    pub default_action: String,
}

impl Default for PolicyFileConfig {
    fn default() -> Self {
        Self {
            default_action: "ask".to_string(),
        }
    }
}

/// Top-level configuration, loaded from `.codewright/config.toml`.
/// Every section falls back to defaults so a missing or partial file is
/// never an error.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub llm: LlmConfig,
    pub agent_loop: AgentLoopConfig,
    pub guard: GuardConfig,
    pub pool: PoolConfig,
    pub policy: PolicyFileConfig,
}

impl AppConfig {
    pub fn load(workspace: &Path) -> Result<Self> {
        let path = runtime_dir(workspace).join("config.toml");
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(&path)?;
        Ok(toml::from_str(&raw)?)
    }

    pub fn save(&self, workspace: &Path) -> Result<()> {
        let dir = runtime_dir(workspace);
        std::fs::create_dir_all(&dir)?;
        std::fs::write(dir.join("config.toml"), toml::to_string_pretty(self)?)?;
        Ok(())
    }
}
