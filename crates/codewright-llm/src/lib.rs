//! Model-stream interface: typed stream events, the accumulator that
//! reconstructs a full response from them, and a blocking SSE client for
//! OpenAI-compatible chat endpoints.
//!
//! The agent loop consumes `StreamEvent`s one at a time and never sees
//! wire framing; everything protocol-shaped stays in this crate.

use codewright_core::{
    CancellationToken, ChatMessage, ChatRequest, ModelResponse, TokenUsage, ToolUseBlock,
};
use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::io::BufRead;

#[derive(thiserror::Error, Debug)]
pub enum StreamError {
    #[error("model request failed: {0}")]
    Request(String),
    #[error("model stream read failed: {0}")]
    Read(String),
    #[error("unexpected stream payload: {0}")]
    Protocol(String),
}

// ── Stream events ──

/// What kind of content block a `BlockStart` opens.
#[derive(Debug, Clone, PartialEq)]
pub enum BlockKind {
    Text,
    ToolUse { id: String, name: String },
}

/// One typed event from the model stream.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    BlockStart { index: usize, kind: BlockKind },
    TextDelta { index: usize, text: String },
    /// A fragment of a tool-use block's input JSON.
    InputJsonDelta { index: usize, partial_json: String },
    BlockStop { index: usize },
    MessageDelta {
        stop_reason: Option<String>,
        usage: TokenUsage,
    },
    MessageStop,
}

// ── Response accumulator ──

#[derive(Debug)]
enum BlockAcc {
    Text(String),
    ToolUse {
        id: String,
        name: String,
        arguments: String,
    },
}

/// Rebuilds assistant text, tool-use blocks and a usage summary from a
/// stream of events. Order is kept by block index, not event arrival.
#[derive(Debug, Default)]
pub struct ResponseAccumulator {
    blocks: BTreeMap<usize, BlockAcc>,
    stop_reason: Option<String>,
    usage: TokenUsage,
}

impl ResponseAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, event: &StreamEvent) {
        match event {
            StreamEvent::BlockStart { index, kind } => {
                let acc = match kind {
                    BlockKind::Text => BlockAcc::Text(String::new()),
                    BlockKind::ToolUse { id, name } => BlockAcc::ToolUse {
                        id: id.clone(),
                        name: name.clone(),
                        arguments: String::new(),
                    },
                };
                self.blocks.entry(*index).or_insert(acc);
            }
            StreamEvent::TextDelta { index, text } => {
                if let Some(BlockAcc::Text(buf)) = self.blocks.get_mut(index) {
                    buf.push_str(text);
                }
            }
            StreamEvent::InputJsonDelta {
                index,
                partial_json,
            } => {
                if let Some(BlockAcc::ToolUse { arguments, .. }) = self.blocks.get_mut(index) {
                    arguments.push_str(partial_json);
                }
            }
            StreamEvent::BlockStop { .. } => {}
            StreamEvent::MessageDelta { stop_reason, usage } => {
                if stop_reason.is_some() {
                    self.stop_reason = stop_reason.clone();
                }
                self.usage.add(usage);
            }
            StreamEvent::MessageStop => {}
        }
    }

    pub fn finish(self) -> ModelResponse {
        let mut text = String::new();
        let mut tool_uses = Vec::new();
        for (_, block) in self.blocks {
            match block {
                BlockAcc::Text(buf) => text.push_str(&buf),
                BlockAcc::ToolUse {
                    id,
                    name,
                    arguments,
                } => {
                    let arguments = if arguments.trim().is_empty() {
                        "{}".to_string()
                    } else {
                        arguments
                    };
                    tool_uses.push(ToolUseBlock {
                        id,
                        name,
                        arguments,
                    });
                }
            }
        }
        let stop_reason = self.stop_reason.unwrap_or_else(|| {
            if tool_uses.is_empty() {
                "stop".to_string()
            } else {
                "tool_calls".to_string()
            }
        });
        ModelResponse {
            text,
            tool_uses,
            stop_reason,
            usage: self.usage,
        }
    }
}

// ── Client trait ──

/// A streaming model client. `on_event` is invoked for every event as it
/// arrives; the call returns when the stream ends, errors, or the token
/// is cancelled. Cancellation returns Ok; the caller inspects the token
/// to tell the cases apart.
pub trait ModelClient {
    fn stream_turn(
        &self,
        req: &ChatRequest,
        on_event: &mut dyn FnMut(StreamEvent),
        cancel: &CancellationToken,
    ) -> Result<(), StreamError>;
}

// ── HTTP client ──

/// Blocking SSE client for OpenAI-compatible `/chat/completions`
/// endpoints. Translates wire deltas into `StreamEvent`s; block index 0
/// is reserved for assistant text, tool calls start at 1 + wire index.
pub struct HttpModelClient {
    base_url: String,
    api_key: String,
    http: reqwest::blocking::Client,
}

impl HttpModelClient {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            api_key: api_key.into(),
            http: reqwest::blocking::Client::new(),
        }
    }

    /// Build a client from config, reading the API key from the
    /// configured environment variable.
    pub fn from_config(cfg: &codewright_core::LlmConfig) -> Result<Self, StreamError> {
        let api_key = std::env::var(&cfg.api_key_env).map_err(|_| {
            StreamError::Request(format!("API key not set (export {})", cfg.api_key_env))
        })?;
        Ok(Self::new(cfg.base_url.clone(), api_key))
    }

    fn build_payload(req: &ChatRequest) -> Value {
        let messages: Vec<Value> = req.messages.iter().map(message_to_wire).collect();
        let mut payload = json!({
            "model": req.model,
            "messages": messages,
            "max_tokens": req.max_tokens,
            "stream": true,
            "stream_options": {"include_usage": true},
        });
        if let Some(temperature) = req.temperature {
            payload["temperature"] = json!(temperature);
        }
        if !req.tools.is_empty() {
            payload["tools"] = serde_json::to_value(&req.tools).unwrap_or(Value::Null);
            payload["tool_choice"] = json!("auto");
        }
        payload
    }
}

impl ModelClient for HttpModelClient {
    fn stream_turn(
        &self,
        req: &ChatRequest,
        on_event: &mut dyn FnMut(StreamEvent),
        cancel: &CancellationToken,
    ) -> Result<(), StreamError> {
        let payload = Self::build_payload(req);
        let url = format!("{}/chat/completions", self.base_url.trim_end_matches('/'));
        let response = self
            .http
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&payload)
            .send()
            .map_err(|e| StreamError::Request(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            return Err(StreamError::Request(format!("HTTP {status}: {body}")));
        }

        let reader = std::io::BufReader::new(response);
        consume_sse(reader, on_event, cancel)
    }
}

fn message_to_wire(msg: &ChatMessage) -> Value {
    match msg {
        ChatMessage::System { content } => json!({"role": "system", "content": content}),
        ChatMessage::User { content } => json!({"role": "user", "content": content}),
        ChatMessage::Assistant {
            content,
            tool_calls,
        } => {
            let mut wire = json!({"role": "assistant"});
            wire["content"] = content.clone().map_or(Value::Null, Value::String);
            if !tool_calls.is_empty() {
                let calls: Vec<Value> = tool_calls
                    .iter()
                    .map(|tc| {
                        json!({
                            "id": tc.id,
                            "type": "function",
                            "function": {"name": tc.name, "arguments": tc.arguments},
                        })
                    })
                    .collect();
                wire["tool_calls"] = Value::Array(calls);
            }
            wire
        }
        ChatMessage::Tool {
            tool_call_id,
            content,
        } => json!({"role": "tool", "tool_call_id": tool_call_id, "content": content}),
    }
}

/// Consume an SSE body line by line, translating each `data:` payload
/// into stream events. Separated from the HTTP layer so it can be fed
/// from a canned buffer in tests.
pub fn consume_sse<R: BufRead>(
    reader: R,
    on_event: &mut dyn FnMut(StreamEvent),
    cancel: &CancellationToken,
) -> Result<(), StreamError> {
    let mut text_started = false;
    let mut started_tools: Vec<usize> = Vec::new();
    // Wire tool-call entries carry name/id only on their first delta;
    // remember them so later argument-only deltas resolve to a block.
    let mut pending_names: BTreeMap<usize, (String, String)> = BTreeMap::new();

    for line in reader.lines() {
        if cancel.is_cancelled() {
            return Ok(());
        }
        let line = line.map_err(|e| StreamError::Read(e.to_string()))?;
        let Some(data) = line.strip_prefix("data: ") else {
            continue;
        };
        if data.trim() == "[DONE]" {
            on_event(StreamEvent::MessageStop);
            return Ok(());
        }
        let chunk: Value = serde_json::from_str(data)
            .map_err(|e| StreamError::Protocol(format!("bad chunk: {e}")))?;

        if let Some(usage) = chunk.get("usage").filter(|u| !u.is_null()) {
            on_event(StreamEvent::MessageDelta {
                stop_reason: None,
                usage: wire_usage(usage),
            });
        }

        let Some(choice) = chunk
            .get("choices")
            .and_then(|c| c.as_array())
            .and_then(|c| c.first())
        else {
            continue;
        };

        if let Some(delta) = choice.get("delta") {
            if let Some(content) = delta.get("content").and_then(|v| v.as_str())
                && !content.is_empty()
            {
                if !text_started {
                    text_started = true;
                    on_event(StreamEvent::BlockStart {
                        index: 0,
                        kind: BlockKind::Text,
                    });
                }
                on_event(StreamEvent::TextDelta {
                    index: 0,
                    text: content.to_string(),
                });
            }

            if let Some(tool_calls) = delta.get("tool_calls").and_then(|v| v.as_array()) {
                for tc in tool_calls {
                    let wire_index = tc.get("index").and_then(|v| v.as_u64()).unwrap_or(0) as usize;
                    let index = wire_index + 1;

                    if let Some(function) = tc.get("function") {
                        if let Some(name) = function.get("name").and_then(|v| v.as_str()) {
                            let id = tc
                                .get("id")
                                .and_then(|v| v.as_str())
                                .unwrap_or_default()
                                .to_string();
                            pending_names.insert(index, (id, name.to_string()));
                        }
                        if !started_tools.contains(&index)
                            && let Some((id, name)) = pending_names.get(&index)
                        {
                            started_tools.push(index);
                            on_event(StreamEvent::BlockStart {
                                index,
                                kind: BlockKind::ToolUse {
                                    id: id.clone(),
                                    name: name.clone(),
                                },
                            });
                        }
                        if let Some(args) = function.get("arguments").and_then(|v| v.as_str())
                            && !args.is_empty()
                        {
                            on_event(StreamEvent::InputJsonDelta {
                                index,
                                partial_json: args.to_string(),
                            });
                        }
                    }
                }
            }
        }

        if let Some(reason) = choice.get("finish_reason").and_then(|v| v.as_str()) {
            if text_started {
                on_event(StreamEvent::BlockStop { index: 0 });
                text_started = false;
            }
            for index in started_tools.drain(..) {
                on_event(StreamEvent::BlockStop { index });
            }
            on_event(StreamEvent::MessageDelta {
                stop_reason: Some(reason.to_string()),
                usage: TokenUsage::default(),
            });
        }
    }
    Ok(())
}

fn wire_usage(usage: &Value) -> TokenUsage {
    TokenUsage {
        input_tokens: usage
            .get("prompt_tokens")
            .and_then(|v| v.as_u64())
            .unwrap_or(0),
        output_tokens: usage
            .get("completion_tokens")
            .and_then(|v| v.as_u64())
            .unwrap_or(0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn collect_events(body: &str) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        let cancel = CancellationToken::new();
        consume_sse(Cursor::new(body), &mut |e| events.push(e), &cancel).expect("consume");
        events
    }

    fn accumulate(events: &[StreamEvent]) -> ModelResponse {
        let mut acc = ResponseAccumulator::new();
        for event in events {
            acc.push(event);
        }
        acc.finish()
    }

    #[test]
    fn accumulator_joins_text_deltas_in_index_order() {
        let mut acc = ResponseAccumulator::new();
        acc.push(&StreamEvent::BlockStart {
            index: 0,
            kind: BlockKind::Text,
        });
        acc.push(&StreamEvent::TextDelta {
            index: 0,
            text: "Hello, ".to_string(),
        });
        acc.push(&StreamEvent::TextDelta {
            index: 0,
            text: "world".to_string(),
        });
        acc.push(&StreamEvent::BlockStop { index: 0 });
        let response = acc.finish();
        assert_eq!(response.text, "Hello, world");
        assert!(response.tool_uses.is_empty());
        assert_eq!(response.stop_reason, "stop");
    }

    #[test]
    fn accumulator_assembles_split_tool_input_json() {
        let mut acc = ResponseAccumulator::new();
        acc.push(&StreamEvent::BlockStart {
            index: 1,
            kind: BlockKind::ToolUse {
                id: "call_1".to_string(),
                name: "read_file".to_string(),
            },
        });
        acc.push(&StreamEvent::InputJsonDelta {
            index: 1,
            partial_json: r#"{"path":"#.to_string(),
        });
        acc.push(&StreamEvent::InputJsonDelta {
            index: 1,
            partial_json: r#""src/lib.rs"}"#.to_string(),
        });
        acc.push(&StreamEvent::BlockStop { index: 1 });
        let response = acc.finish();
        assert_eq!(response.tool_uses.len(), 1);
        assert_eq!(response.tool_uses[0].id, "call_1");
        assert_eq!(response.tool_uses[0].name, "read_file");
        assert_eq!(response.tool_uses[0].arguments, r#"{"path":"src/lib.rs"}"#);
        assert_eq!(response.stop_reason, "tool_calls");
    }

    #[test]
    fn accumulator_handles_interleaved_blocks() {
        let mut acc = ResponseAccumulator::new();
        acc.push(&StreamEvent::BlockStart {
            index: 2,
            kind: BlockKind::ToolUse {
                id: "b".to_string(),
                name: "grep".to_string(),
            },
        });
        acc.push(&StreamEvent::BlockStart {
            index: 1,
            kind: BlockKind::ToolUse {
                id: "a".to_string(),
                name: "read_file".to_string(),
            },
        });
        acc.push(&StreamEvent::InputJsonDelta {
            index: 2,
            partial_json: r#"{"pattern":"x"}"#.to_string(),
        });
        acc.push(&StreamEvent::InputJsonDelta {
            index: 1,
            partial_json: r#"{"path":"a"}"#.to_string(),
        });
        let response = acc.finish();
        // Output order follows block index, not event arrival.
        assert_eq!(response.tool_uses[0].id, "a");
        assert_eq!(response.tool_uses[1].id, "b");
    }

    #[test]
    fn accumulator_defaults_empty_arguments_to_empty_object() {
        let mut acc = ResponseAccumulator::new();
        acc.push(&StreamEvent::BlockStart {
            index: 1,
            kind: BlockKind::ToolUse {
                id: "call_1".to_string(),
                name: "list_dir".to_string(),
            },
        });
        let response = acc.finish();
        assert_eq!(response.tool_uses[0].arguments, "{}");
    }

    #[test]
    fn sse_text_stream_round_trips() {
        let body = concat!(
            "data: {\"choices\":[{\"delta\":{\"content\":\"Hel\"}}]}\n",
            "\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"lo\"}}]}\n",
            "data: {\"choices\":[{\"delta\":{},\"finish_reason\":\"stop\"}],\"usage\":{\"prompt_tokens\":12,\"completion_tokens\":3}}\n",
            "data: [DONE]\n",
        );
        let events = collect_events(body);
        let response = accumulate(&events);
        assert_eq!(response.text, "Hello");
        assert_eq!(response.stop_reason, "stop");
        assert_eq!(response.usage.input_tokens, 12);
        assert_eq!(response.usage.output_tokens, 3);
        assert!(matches!(events.last(), Some(StreamEvent::MessageStop)));
    }

    #[test]
    fn sse_tool_call_arguments_split_across_chunks() {
        let body = concat!(
            "data: {\"choices\":[{\"delta\":{\"tool_calls\":[{\"index\":0,\"id\":\"call_9\",\"function\":{\"name\":\"read_file\",\"arguments\":\"\"}}]}}]}\n",
            "data: {\"choices\":[{\"delta\":{\"tool_calls\":[{\"index\":0,\"function\":{\"arguments\":\"{\\\"path\\\":\"}}]}}]}\n",
            "data: {\"choices\":[{\"delta\":{\"tool_calls\":[{\"index\":0,\"function\":{\"arguments\":\"\\\"a.rs\\\"}\"}}]}}]}\n",
            "data: {\"choices\":[{\"delta\":{},\"finish_reason\":\"tool_calls\"}]}\n",
            "data: [DONE]\n",
        );
        let response = accumulate(&collect_events(body));
        assert_eq!(response.tool_uses.len(), 1);
        assert_eq!(response.tool_uses[0].name, "read_file");
        assert_eq!(response.tool_uses[0].arguments, r#"{"path":"a.rs"}"#);
        assert_eq!(response.stop_reason, "tool_calls");
    }

    #[test]
    fn sse_parallel_tool_calls_keep_their_indices() {
        let body = concat!(
            "data: {\"choices\":[{\"delta\":{\"tool_calls\":[{\"index\":0,\"id\":\"c0\",\"function\":{\"name\":\"read_file\",\"arguments\":\"{}\"}}]}}]}\n",
            "data: {\"choices\":[{\"delta\":{\"tool_calls\":[{\"index\":1,\"id\":\"c1\",\"function\":{\"name\":\"grep\",\"arguments\":\"{}\"}}]}}]}\n",
            "data: {\"choices\":[{\"delta\":{},\"finish_reason\":\"tool_calls\"}]}\n",
            "data: [DONE]\n",
        );
        let response = accumulate(&collect_events(body));
        assert_eq!(response.tool_uses.len(), 2);
        assert_eq!(response.tool_uses[0].id, "c0");
        assert_eq!(response.tool_uses[1].id, "c1");
    }

    #[test]
    fn cancelled_token_stops_consumption_without_error() {
        let body = "data: {\"choices\":[{\"delta\":{\"content\":\"never\"}}]}\n";
        let cancel = CancellationToken::new();
        cancel.cancel();
        let mut events = Vec::new();
        consume_sse(Cursor::new(body), &mut |e| events.push(e), &cancel).expect("ok on cancel");
        assert!(events.is_empty());
    }

    #[test]
    fn malformed_chunk_is_a_protocol_error() {
        let body = "data: {not json}\n";
        let cancel = CancellationToken::new();
        let err = consume_sse(Cursor::new(body), &mut |_| {}, &cancel).unwrap_err();
        assert!(matches!(err, StreamError::Protocol(_)));
    }

    #[test]
    fn assistant_message_wires_tool_calls_in_function_shape() {
        let wire = message_to_wire(&ChatMessage::Assistant {
            content: None,
            tool_calls: vec![ToolUseBlock {
                id: "call_1".to_string(),
                name: "read_file".to_string(),
                arguments: r#"{"path":"a.rs"}"#.to_string(),
            }],
        });
        assert_eq!(wire["tool_calls"][0]["type"], "function");
        assert_eq!(wire["tool_calls"][0]["function"]["name"], "read_file");
        assert!(wire["content"].is_null());
    }
}
