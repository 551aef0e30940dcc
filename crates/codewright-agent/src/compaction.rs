//! Conversation compaction collaborator.
//!
//! The loop only knows the `Compactor` trait; `SummaryCompactor` is the
//! default implementation, collapsing old turns into a structured
//! summary while keeping the system prompt and the freshest context.

use anyhow::{Result, anyhow};
use codewright_core::{ChatMessage, estimate_message_tokens};
use std::collections::BTreeMap;

/// Before/after accounting for one compaction pass.
#[derive(Debug, Clone, Copy)]
pub struct CompactionStats {
    pub tokens_before: u64,
    pub tokens_after: u64,
    pub messages_before: usize,
    pub messages_after: usize,
}

pub trait Compactor: Send {
    fn needs_compaction(&self, messages: &[ChatMessage]) -> bool;
    fn compact(&self, messages: &[ChatMessage]) -> Result<(Vec<ChatMessage>, CompactionStats)>;
}

/// Threshold-triggered compactor that replaces old turns with a
/// code-derived summary (files touched, errors hit, tool usage counts).
pub struct SummaryCompactor {
    pub context_window_tokens: u64,
    pub threshold_pct: f64,
    /// How many trailing messages survive verbatim.
    pub keep_recent: usize,
}

impl Default for SummaryCompactor {
    fn default() -> Self {
        Self {
            context_window_tokens: 128_000,
            threshold_pct: 0.95,
            keep_recent: 8,
        }
    }
}

impl Compactor for SummaryCompactor {
    fn needs_compaction(&self, messages: &[ChatMessage]) -> bool {
        let threshold = (self.context_window_tokens as f64 * self.threshold_pct) as u64;
        estimate_message_tokens(messages) > threshold
    }

    fn compact(&self, messages: &[ChatMessage]) -> Result<(Vec<ChatMessage>, CompactionStats)> {
        let tokens_before = estimate_message_tokens(messages);

        let head = usize::from(matches!(messages.first(), Some(ChatMessage::System { .. })));
        let mut tail_start = messages.len().saturating_sub(self.keep_recent);
        // Never orphan tool results from the assistant message that
        // requested them.
        while tail_start > head && matches!(messages.get(tail_start), Some(ChatMessage::Tool { .. }))
        {
            tail_start -= 1;
        }
        if tail_start <= head {
            return Err(anyhow!("nothing to compact"));
        }

        let summary = summarize_messages(&messages[head..tail_start]);
        let mut compacted: Vec<ChatMessage> = Vec::with_capacity(self.keep_recent + 2);
        compacted.extend_from_slice(&messages[..head]);
        compacted.push(ChatMessage::User {
            content: format!("[conversation summary]\n{summary}"),
        });
        compacted.extend_from_slice(&messages[tail_start..]);

        let stats = CompactionStats {
            tokens_before,
            tokens_after: estimate_message_tokens(&compacted),
            messages_before: messages.len(),
            messages_after: compacted.len(),
        };
        if stats.tokens_after >= stats.tokens_before {
            return Err(anyhow!("compaction did not shrink the conversation"));
        }
        Ok((compacted, stats))
    }
}

/// Extract the facts worth carrying across a compaction: paths touched,
/// errors encountered, and which tools ran how often.
fn summarize_messages(messages: &[ChatMessage]) -> String {
    let mut paths: Vec<String> = Vec::new();
    let mut errors: Vec<String> = Vec::new();
    let mut tool_counts: BTreeMap<String, usize> = BTreeMap::new();

    for msg in messages {
        match msg {
            ChatMessage::Assistant { tool_calls, .. } => {
                for tc in tool_calls {
                    *tool_counts.entry(tc.name.clone()).or_default() += 1;
                    if let Ok(args) = serde_json::from_str::<serde_json::Value>(&tc.arguments)
                        && let Some(path) = args
                            .get("path")
                            .or_else(|| args.get("file_path"))
                            .and_then(|v| v.as_str())
                    {
                        paths.push(path.to_string());
                    }
                }
            }
            ChatMessage::Tool { content, .. } => {
                let lower = content.to_ascii_lowercase();
                if lower.contains("error") || lower.contains("failed") {
                    errors.push(truncate_line(content, 100));
                }
            }
            _ => {}
        }
    }

    paths.sort();
    paths.dedup();

    let mut summary = String::new();
    if !paths.is_empty() {
        summary.push_str(&format!("Files touched: {}\n", paths.join(", ")));
    }
    if !errors.is_empty() {
        summary.push_str(&format!("Errors encountered: {}\n", errors.join("; ")));
    }
    if tool_counts.is_empty() {
        summary.push_str("Tools used: none\n");
    } else {
        let counts = tool_counts
            .iter()
            .map(|(name, count)| format!("{name}x{count}"))
            .collect::<Vec<_>>()
            .join(", ");
        summary.push_str(&format!("Tools used: {counts}\n"));
    }
    summary
}

/// First line of `text`, truncated to at most `max_len` bytes on a char
/// boundary.
fn truncate_line(text: &str, max_len: usize) -> String {
    let first_line = text.lines().next().unwrap_or(text);
    if first_line.len() <= max_len {
        return first_line.to_string();
    }
    let mut end = max_len;
    while end > 0 && !first_line.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &first_line[..end])
}

#[cfg(test)]
mod tests {
    use super::*;
    use codewright_core::ToolUseBlock;

    fn big_conversation() -> Vec<ChatMessage> {
        let mut messages = vec![ChatMessage::System {
            content: "You are a coding assistant.".to_string(),
        }];
        for i in 0..30 {
            messages.push(ChatMessage::Assistant {
                content: None,
                tool_calls: vec![ToolUseBlock {
                    id: format!("call_{i}"),
                    name: "read_file".to_string(),
                    arguments: format!(r#"{{"path":"src/file{i}.rs"}}"#),
                }],
            });
            messages.push(ChatMessage::Tool {
                tool_call_id: format!("call_{i}"),
                content: "x".repeat(2000),
            });
        }
        messages
    }

    fn compactor() -> SummaryCompactor {
        SummaryCompactor {
            context_window_tokens: 10_000,
            threshold_pct: 0.9,
            keep_recent: 6,
        }
    }

    #[test]
    fn small_conversations_do_not_need_compaction() {
        let messages = vec![
            ChatMessage::System {
                content: "sys".to_string(),
            },
            ChatMessage::User {
                content: "hi".to_string(),
            },
        ];
        assert!(!compactor().needs_compaction(&messages));
    }

    #[test]
    fn oversized_conversations_trigger_and_shrink() {
        let messages = big_conversation();
        let c = compactor();
        assert!(c.needs_compaction(&messages));

        let (compacted, stats) = c.compact(&messages).expect("compact");
        assert!(stats.tokens_after < stats.tokens_before);
        assert!(compacted.len() < messages.len());
        assert_eq!(stats.messages_after, compacted.len());
    }

    #[test]
    fn system_prompt_survives_compaction() {
        let (compacted, _) = compactor().compact(&big_conversation()).expect("compact");
        assert!(matches!(
            compacted.first(),
            Some(ChatMessage::System { content }) if content.contains("coding assistant")
        ));
    }

    #[test]
    fn summary_message_carries_touched_files_and_tool_counts() {
        let (compacted, _) = compactor().compact(&big_conversation()).expect("compact");
        let summary = compacted
            .iter()
            .find_map(|m| match m {
                ChatMessage::User { content } if content.starts_with("[conversation summary]") => {
                    Some(content.clone())
                }
                _ => None,
            })
            .expect("summary message present");
        assert!(summary.contains("src/file0.rs"));
        assert!(summary.contains("read_file"));
    }

    #[test]
    fn tool_results_are_not_orphaned_from_their_request() {
        let (compacted, _) = compactor().compact(&big_conversation()).expect("compact");
        // The first kept message after the summary must not be a bare
        // tool result.
        let after_summary = compacted
            .iter()
            .skip_while(|m| !matches!(m, ChatMessage::User { content } if content.starts_with("[conversation summary]")))
            .nth(1);
        assert!(!matches!(after_summary, Some(ChatMessage::Tool { .. })));
    }

    #[test]
    fn tiny_conversation_has_nothing_to_compact() {
        let messages = vec![ChatMessage::System {
            content: "sys".to_string(),
        }];
        assert!(compactor().compact(&messages).is_err());
    }

    #[test]
    fn truncate_line_respects_char_boundaries() {
        let text = "héllo wörld, this is a long line with ümlauts everywhere";
        let out = truncate_line(text, 10);
        assert!(out.len() <= 13); // 10 bytes + "..."
        assert!(out.ends_with("..."));
    }
}
