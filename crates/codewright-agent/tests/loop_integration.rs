//! End-to-end turns across the loop, scheduler, pool, gate and policy,
//! with a channel-bridged chunk sink the way a UI would consume it.

use codewright_agent::{AgentLoop, LoopConfig, SummaryCompactor};
use codewright_core::{
    AgentChunk, ChatMessage, PermissionReply, Tool, ToolRegistry,
};
use codewright_policy::{PolicyEngine, Rule, RuleAction};
use codewright_testkit::{ChunkRecorder, ScriptedModelClient, StubTool, text_turn, tool_turn};
use std::sync::{Arc, mpsc};
use std::time::Duration;

fn registry_with(tools: Vec<Arc<dyn Tool>>) -> Arc<ToolRegistry> {
    let mut registry = ToolRegistry::new();
    for tool in tools {
        registry.register(tool);
    }
    Arc::new(registry)
}

#[test]
fn mixed_batch_serializes_the_write_after_the_reads() {
    // read(fileA), write(fileA), read(fileB): the write must run after
    // both parallel-safe reads, alone in its group.
    let model = ScriptedModelClient::new(vec![
        tool_turn(&[
            ("c1", "read_file", r#"{"path":"fileA"}"#),
            ("c2", "write_file", r#"{"path":"fileA","content":"new"}"#),
            ("c3", "read_file", r#"{"path":"fileB"}"#),
        ]),
        text_turn("all done"),
    ]);
    let read = Arc::new(
        StubTool::new("read_file")
            .output("contents")
            .parallel_safe(true)
            .delay(Duration::from_millis(30)),
    );
    let write = Arc::new(StubTool::new("write_file").output("written").write_op(true));
    let order: Arc<std::sync::Mutex<Vec<&'static str>>> =
        Arc::new(std::sync::Mutex::new(Vec::new()));

    // Wrap the stubs to record execution order.
    struct Ordered {
        inner: Arc<StubTool>,
        label: &'static str,
        order: Arc<std::sync::Mutex<Vec<&'static str>>>,
    }
    impl Tool for Ordered {
        fn name(&self) -> &str {
            self.inner.name()
        }
        fn description(&self) -> &str {
            self.inner.description()
        }
        fn input_schema(&self) -> serde_json::Value {
            self.inner.input_schema()
        }
        fn execute(
            &self,
            cancel: &codewright_core::CancellationToken,
            args: &serde_json::Value,
        ) -> codewright_core::ToolOutput {
            let output = self.inner.execute(cancel, args);
            if let Ok(mut seen) = self.order.lock() {
                seen.push(self.label);
            }
            output
        }
        fn is_parallel_safe(&self) -> bool {
            self.inner.is_parallel_safe()
        }
        fn is_write_operation(&self) -> bool {
            self.inner.is_write_operation()
        }
        fn file_path(&self, args: &serde_json::Value) -> Option<String> {
            self.inner.file_path(args)
        }
    }

    let registry = registry_with(vec![
        Arc::new(Ordered {
            inner: read,
            label: "read",
            order: Arc::clone(&order),
        }),
        Arc::new(Ordered {
            inner: write,
            label: "write",
            order: Arc::clone(&order),
        }),
    ]);

    let mut agent = AgentLoop::new(
        &model,
        registry,
        PolicyEngine::new(RuleAction::Allow),
        LoopConfig::default(),
        "system".to_string(),
    );
    let result = agent.run("update fileA").expect("run");

    assert_eq!(result.response, "all done");
    let seen = order.lock().expect("order").clone();
    assert_eq!(seen.len(), 3);
    assert_eq!(seen[2], "write", "the write runs after both reads finish");

    // Results are appended in submission order regardless of execution
    // order.
    let tool_ids: Vec<String> = result
        .messages
        .iter()
        .filter_map(|m| match m {
            ChatMessage::Tool { tool_call_id, .. } => Some(tool_call_id.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(tool_ids, vec!["c1", "c2", "c3"]);
}

#[test]
fn chunks_can_be_bridged_onto_a_bounded_channel() {
    let model = ScriptedModelClient::new(vec![
        tool_turn(&[("c1", "read_file", r#"{"path":"a.rs"}"#)]),
        text_turn("bridged"),
    ]);
    let read = Arc::new(StubTool::new("read_file").parallel_safe(true));
    let mut agent = AgentLoop::new(
        &model,
        registry_with(vec![read]),
        PolicyEngine::new(RuleAction::Allow),
        LoopConfig::default(),
        "system".to_string(),
    );

    let (tx, rx) = mpsc::sync_channel::<AgentChunk>(64);
    agent.set_sink(Arc::new(move |chunk| {
        let _ = tx.try_send(chunk);
    }));

    let result = agent.run("read it").expect("run");
    assert_eq!(result.response, "bridged");

    let chunks: Vec<AgentChunk> = rx.try_iter().collect();
    assert!(chunks.iter().any(|c| matches!(c, AgentChunk::ToolCallStart { .. })));
    assert!(chunks.iter().any(|c| matches!(c, AgentChunk::ToolCallInput { .. })));
    assert!(chunks.iter().any(|c| matches!(c, AgentChunk::ToolResult { .. })));
    assert!(matches!(chunks.last(), Some(AgentChunk::Done { .. })));
}

#[test]
fn ask_rule_gates_only_the_matching_tool() {
    let model = ScriptedModelClient::new(vec![
        tool_turn(&[
            ("c1", "read_file", r#"{"path":"a.rs"}"#),
            ("c2", "bash", r#"{"command":"make deploy"}"#),
        ]),
        text_turn("finished"),
    ]);
    let read = Arc::new(StubTool::new("read_file").parallel_safe(true));
    let bash = Arc::new(StubTool::new("bash").output("deployed"));

    let mut policy = PolicyEngine::new(RuleAction::Ask);
    policy.add_rule(Rule::new("read_file", "*", RuleAction::Allow));

    let recorder = ChunkRecorder::new();
    let mut agent = AgentLoop::new(
        &model,
        registry_with(vec![read.clone(), bash.clone()]),
        policy,
        LoopConfig::default(),
        "system".to_string(),
    );
    agent.set_sink(recorder.sink());

    let gate = agent.gate();
    let answering = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(60));
        gate.answer(PermissionReply::Granted);
    });

    let result = agent.run("read then deploy").expect("run");
    answering.join().expect("join");

    assert_eq!(result.response, "finished");
    assert_eq!(read.invocations().len(), 1);
    assert_eq!(bash.invocations().len(), 1);

    let asks: Vec<String> = recorder
        .chunks()
        .into_iter()
        .filter_map(|c| match c {
            AgentChunk::PermissionRequest { tool_name, .. } => Some(tool_name),
            _ => None,
        })
        .collect();
    assert_eq!(asks, vec!["bash"], "only the unmatched tool is asked about");
}

#[test]
fn oversized_conversation_is_compacted_before_the_model_call() {
    let model = ScriptedModelClient::new(vec![text_turn("compact reply")]);
    let recorder = ChunkRecorder::new();
    let mut agent = AgentLoop::new(
        &model,
        registry_with(vec![]),
        PolicyEngine::new(RuleAction::Allow),
        LoopConfig::default(),
        "system prompt".to_string(),
    )
    .with_history(
        (0..40)
            .flat_map(|i| {
                vec![
                    ChatMessage::User {
                        content: format!("question {i}: {}", "x".repeat(400)),
                    },
                    ChatMessage::Assistant {
                        content: Some("y".repeat(400)),
                        tool_calls: vec![],
                    },
                ]
            })
            .collect(),
    );
    agent.set_sink(recorder.sink());
    agent.set_compactor(Box::new(SummaryCompactor {
        context_window_tokens: 5_000,
        threshold_pct: 0.5,
        keep_recent: 4,
    }));

    let result = agent.run("summarize please").expect("run");
    assert_eq!(result.response, "compact reply");

    let compaction = recorder.chunks().into_iter().find_map(|c| match c {
        AgentChunk::Compacted {
            tokens_before,
            tokens_after,
        } => Some((tokens_before, tokens_after)),
        _ => None,
    });
    let (before, after) = compaction.expect("compaction chunk emitted");
    assert!(after < before);
    // The system prompt survived.
    assert!(matches!(
        result.messages.first(),
        Some(ChatMessage::System { content }) if content == "system prompt"
    ));
}

#[test]
fn cancellation_during_permission_wait_is_silent() {
    let model = ScriptedModelClient::new(vec![tool_turn(&[(
        "c1",
        "deploy",
        r#"{"target":"prod"}"#,
    )])]);
    let deploy = Arc::new(StubTool::new("deploy"));
    let recorder = ChunkRecorder::new();
    let mut agent = AgentLoop::new(
        &model,
        registry_with(vec![deploy.clone()]),
        PolicyEngine::new(RuleAction::Ask),
        LoopConfig::default(),
        "system".to_string(),
    );
    agent.set_sink(recorder.sink());

    let cancel = agent.cancel_token();
    let cancelling = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(60));
        cancel.cancel();
    });

    let result = agent.run("ship it").expect("run");
    cancelling.join().expect("join");

    assert_eq!(result.finish_reason, "cancelled");
    assert!(deploy.invocations().is_empty());
    // The permission request went out, but no error or done chunk
    // follows a cancellation.
    let chunks = recorder.chunks();
    assert!(matches!(
        chunks.last(),
        Some(AgentChunk::PermissionRequest { .. })
    ));
}
