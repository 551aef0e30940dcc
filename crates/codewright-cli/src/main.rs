//! Headless CLI over the orchestrator: permission-rule management and a
//! single-turn `run` against a configured model endpoint.
//!
//! Tools are supplied by integrators; `run` here wires an empty registry
//! and is chiefly useful for chat-style turns and for exercising the
//! pipeline end to end.

use anyhow::Result;
use clap::{Parser, Subcommand};
use codewright_agent::{AgentLoop, LoopConfig, SummaryCompactor};
use codewright_core::{AgentChunk, AppConfig, PermissionReply, ToolRegistry, runtime_dir};
use codewright_llm::HttpModelClient;
use codewright_observe::Observer;
use codewright_policy::{PolicyEngine, Rule, RuleAction};
use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "codewright", about = "Autonomous coding-assistant orchestrator")]
struct Cli {
    /// Workspace root (defaults to the current directory).
    #[arg(long)]
    workspace: Option<PathBuf>,

    /// Verbose logging to stderr.
    #[arg(long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run one turn against the configured model endpoint.
    Run {
        /// The user message.
        prompt: String,
    },
    /// Manage the project's permission rules.
    Rules {
        #[command(subcommand)]
        action: RulesAction,
    },
    /// Print the effective configuration.
    Config,
}

#[derive(Subcommand)]
enum RulesAction {
    /// List rules in the project rules file.
    List,
    /// Add (or replace) a rule.
    Add {
        tool: String,
        pattern: String,
        /// allow, deny or ask
        action: String,
    },
    /// Remove a rule by its `tool:pattern` key.
    Remove { key: String },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let workspace = match cli.workspace {
        Some(path) => path,
        None => std::env::current_dir()?,
    };

    match cli.command {
        Command::Run { prompt } => run_turn(&workspace, &prompt, cli.verbose),
        Command::Rules { action } => manage_rules(&workspace, action),
        Command::Config => {
            let cfg = AppConfig::load(&workspace)?;
            println!("{}", serde_json::to_string_pretty(&cfg)?);
            Ok(())
        }
    }
}

fn rules_path(workspace: &Path) -> PathBuf {
    runtime_dir(workspace).join("rules.toml")
}

fn user_rules_path() -> Option<PathBuf> {
    std::env::var_os("HOME").map(|home| PathBuf::from(home).join(".codewright").join("rules.toml"))
}

fn build_policy(workspace: &Path, cfg: &AppConfig) -> Result<PolicyEngine> {
    let mut policy = PolicyEngine::from_app_config(cfg)?;
    // User rules first, project rules second: project wins ties.
    if let Some(user) = user_rules_path() {
        policy.load_rules(&user)?;
    }
    policy.load_rules(&rules_path(workspace))?;
    Ok(policy)
}

fn run_turn(workspace: &Path, prompt: &str, verbose: bool) -> Result<()> {
    let cfg = AppConfig::load(workspace)?;
    let policy = build_policy(workspace, &cfg)?;
    let mut observer = Observer::new(workspace)?;
    observer.set_verbose(verbose);
    let observer = Arc::new(observer);
    let model = HttpModelClient::from_config(&cfg.llm)?;

    // Integrators register their tools here; the stock binary runs a
    // plain chat turn.
    let registry = Arc::new(ToolRegistry::new());

    let mut agent = AgentLoop::new(
        &model,
        registry,
        policy,
        LoopConfig::from_app_config(&cfg),
        "You are a pragmatic coding assistant.".to_string(),
    )
    .with_workers(cfg.pool.workers);
    agent = agent.with_guard_config(cfg.guard.clone());
    agent.set_observer(Arc::clone(&observer));
    agent.set_compactor(Box::new(SummaryCompactor {
        context_window_tokens: cfg.agent_loop.context_window_tokens,
        threshold_pct: cfg.agent_loop.compaction_threshold_pct,
        keep_recent: 8,
    }));

    let gate = agent.gate();
    agent.set_sink(Arc::new(move |chunk| match chunk {
        AgentChunk::TextDelta(text) => {
            print!("{text}");
            let _ = io::stdout().flush();
        }
        AgentChunk::ToolCallStart {
            tool_name,
            args_summary,
            ..
        } => eprintln!("* {tool_name}({args_summary})"),
        AgentChunk::ToolResult {
            tool_name,
            is_error,
            ..
        } => {
            if is_error {
                eprintln!("* {tool_name} failed");
            }
        }
        AgentChunk::PermissionRequest {
            tool_name,
            normalized_args,
            ..
        } => {
            eprintln!("permission needed: {tool_name} {normalized_args}");
            eprint!("[y]es / [n]o / [a]lways> ");
            gate.answer(read_permission_reply());
        }
        AgentChunk::Compacted {
            tokens_before,
            tokens_after,
        } => eprintln!("* compacted conversation ({tokens_before} -> {tokens_after} tokens)"),
        AgentChunk::Done { usage, .. } => {
            eprintln!();
            eprintln!(
                "[{} tokens in, {} tokens out]",
                usage.input_tokens, usage.output_tokens
            );
        }
        AgentChunk::Error { message } => eprintln!("error: {message}"),
        AgentChunk::ToolCallInput { .. } => {}
    }));

    let result = agent.run(prompt)?;
    observer.record(&format!(
        "turn finished: reason={} iterations={} tools={}",
        result.finish_reason, result.iterations, result.tool_calls_made
    ));
    Ok(())
}

fn read_permission_reply() -> PermissionReply {
    let mut line = String::new();
    match io::stdin().lock().read_line(&mut line) {
        Ok(_) => match line.trim() {
            "y" | "yes" => PermissionReply::Granted,
            "a" | "always" => PermissionReply::GrantedAlways,
            _ => PermissionReply::Denied,
        },
        Err(_) => PermissionReply::Denied,
    }
}

fn manage_rules(workspace: &Path, action: RulesAction) -> Result<()> {
    let path = rules_path(workspace);
    let mut engine = PolicyEngine::new(RuleAction::Ask);
    engine.load_rules(&path)?;

    match action {
        RulesAction::List => {
            if engine.rules().is_empty() {
                println!("no rules in {}", path.display());
            }
            for rule in engine.rules() {
                println!("{:40} {}", rule.key(), rule.action.as_str());
            }
        }
        RulesAction::Add {
            tool,
            pattern,
            action,
        } => {
            let action = RuleAction::parse(&action)?;
            engine.add_rule(Rule::new(tool, pattern, action));
            engine.save_rules(&path)?;
            println!("saved {}", path.display());
        }
        RulesAction::Remove { key } => {
            if engine.remove_rule(&key) {
                engine.save_rules(&path)?;
                println!("removed {key}");
            } else {
                println!("no rule with key {key}");
            }
        }
    }
    Ok(())
}
