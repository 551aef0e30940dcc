//! Permission policy: decides whether a tool call may run.
//!
//! `PolicyEngine::check` is a pure read: session overrides first, then
//! the highest-specificity matching rule, then the configured default.
//! Rule mutation and persistence are separate operations on the engine.

use anyhow::Result;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;

/// The action a rule (or the default) prescribes for a matching call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleAction {
    Allow,
    Deny,
    Ask,
}

impl RuleAction {
    pub fn parse(s: &str) -> Result<Self, PolicyError> {
        match s {
            "allow" => Ok(Self::Allow),
            "deny" => Ok(Self::Deny),
            "ask" => Ok(Self::Ask),
            other => Err(PolicyError::InvalidAction(other.to_string())),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Allow => "allow",
            Self::Deny => "deny",
            Self::Ask => "ask",
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum PolicyError {
    #[error("invalid rule action `{0}` (expected allow, deny or ask)")]
    InvalidAction(String),
}

/// A permission rule. `tool` may be `*` (any tool); `pattern` is a glob
/// matched against the call's comparison string.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rule {
    pub tool: String,
    pub pattern: String,
    pub action: RuleAction,
}

impl Rule {
    pub fn new(tool: impl Into<String>, pattern: impl Into<String>, action: RuleAction) -> Self {
        Self {
            tool: tool.into(),
            pattern: pattern.into(),
            action,
        }
    }

    /// Identity of a rule for add/remove: one rule per `tool:pattern`.
    pub fn key(&self) -> String {
        format!("{}:{}", self.tool, self.pattern)
    }

    /// Ranking used to pick among multiple matching rules. A rule scoped
    /// to one tool beats a wildcard-tool rule; longer patterns beat
    /// shorter ones.
    pub fn specificity(&self) -> usize {
        let mut score = 0;
        if self.tool != "*" {
            score += 100;
        }
        if self.pattern != "*" {
            score += 50 + self.pattern.len();
        }
        score
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct RulesFile {
    #[serde(default)]
    rules: Vec<Rule>,
}

/// The permission engine: built-in defaults plus loaded rules, session
/// overrides, and a fallback action for calls nothing matches.
#[derive(Debug, Clone)]
pub struct PolicyEngine {
    rules: Vec<Rule>,
    session_overrides: HashSet<String>,
    default_action: RuleAction,
    secret_regex: Regex,
}

impl PolicyEngine {
    /// An engine with no rules at all. Most callers want
    /// [`PolicyEngine::with_default_rules`].
    pub fn new(default_action: RuleAction) -> Self {
        Self {
            rules: Vec::new(),
            session_overrides: HashSet::new(),
            default_action,
            secret_regex: Regex::new(r"(?i)(api[_-]?key|secret|token|password)\s*[:=]\s*[^\s]+")
                .expect("valid regex"),
        }
    }

    /// An engine seeded with the built-in rule set.
    pub fn with_default_rules(default_action: RuleAction) -> Self {
        let mut engine = Self::new(default_action);
        for rule in default_rules() {
            engine.add_rule(rule);
        }
        engine
    }

    /// Build an engine from app config: the built-in rule set plus the
    /// configured fallback action.
    pub fn from_app_config(cfg: &codewright_core::AppConfig) -> Result<Self, PolicyError> {
        let action = RuleAction::parse(&cfg.policy.default_action)?;
        Ok(Self::with_default_rules(action))
    }

    /// Evaluate a call. Pure: no side effects, deterministic for a given
    /// engine state.
    pub fn check(&self, tool_name: &str, args: &serde_json::Value) -> RuleAction {
        let comparison = comparison_string(tool_name, args);
        let is_path = is_path_input(args);
        self.check_comparison(tool_name, &comparison, is_path)
    }

    fn check_comparison(&self, tool_name: &str, comparison: &str, is_path: bool) -> RuleAction {
        if self
            .session_overrides
            .contains(&override_key(tool_name, comparison))
            || self.session_overrides.contains(tool_name)
        {
            return RuleAction::Allow;
        }

        let mut best: Option<&Rule> = None;
        for rule in &self.rules {
            if !rule_matches(rule, tool_name, comparison, is_path) {
                continue;
            }
            // `>=` so the last-registered rule wins specificity ties,
            // which is also what gives project rules precedence over
            // user rules loaded before them.
            if best.is_none_or(|b| rule.specificity() >= b.specificity()) {
                best = Some(rule);
            }
        }
        best.map_or(self.default_action, |rule| rule.action)
    }

    /// Add a rule. One rule per `tool:pattern` key: re-adding replaces
    /// the action.
    pub fn add_rule(&mut self, rule: Rule) {
        if let Some(existing) = self.rules.iter_mut().find(|r| r.key() == rule.key()) {
            existing.action = rule.action;
        } else {
            self.rules.push(rule);
        }
    }

    /// Remove the rule with the given `tool:pattern` key.
    pub fn remove_rule(&mut self, key: &str) -> bool {
        let before = self.rules.len();
        self.rules.retain(|r| r.key() != key);
        self.rules.len() != before
    }

    /// Record an in-memory "always allow" for this exact call. Not
    /// persisted; cleared on process restart.
    pub fn allow_always(&mut self, tool_name: &str, args: &serde_json::Value) {
        let comparison = comparison_string(tool_name, args);
        self.session_overrides
            .insert(override_key(tool_name, &comparison));
    }

    /// Record an "always allow" for every input of a tool.
    pub fn allow_always_tool(&mut self, tool_name: &str) {
        self.session_overrides.insert(tool_name.to_string());
    }

    pub fn set_default_action(&mut self, action: RuleAction) {
        self.default_action = action;
    }

    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    /// Load rules from a TOML file and append them to the engine.
    /// Call with the user-global file first and the project file second so
    /// project rules win specificity ties.
    pub fn load_rules(&mut self, path: &Path) -> Result<usize> {
        if !path.exists() {
            return Ok(0);
        }
        let raw = std::fs::read_to_string(path)?;
        let file: RulesFile = toml::from_str(&raw)?;
        let count = file.rules.len();
        for rule in file.rules {
            self.add_rule(rule);
        }
        Ok(count)
    }

    /// Persist the current rule list as TOML.
    pub fn save_rules(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = RulesFile {
            rules: self.rules.clone(),
        };
        std::fs::write(path, toml::to_string_pretty(&file)?)?;
        Ok(())
    }

    /// Mask common secret assignments in text destined for logs or
    /// summaries.
    pub fn redact(&self, text: &str) -> String {
        self.secret_regex
            .replace_all(text, "$1=REDACTED")
            .to_string()
    }
}

fn override_key(tool_name: &str, comparison: &str) -> String {
    format!("{tool_name}:{comparison}")
}

/// The string a rule pattern is matched against, chosen per tool input
/// shape: shell commands match on the command, file tools on the path,
/// anything else on the compact JSON of the whole input.
pub fn comparison_string(_tool_name: &str, args: &serde_json::Value) -> String {
    if let Some(cmd) = args.get("command").and_then(|v| v.as_str()) {
        return cmd.to_string();
    }
    if let Some(path) = args
        .get("path")
        .or_else(|| args.get("file_path"))
        .and_then(|v| v.as_str())
    {
        return path.to_string();
    }
    serde_json::to_string(args).unwrap_or_default()
}

fn is_path_input(args: &serde_json::Value) -> bool {
    args.get("command").and_then(|v| v.as_str()).is_none()
        && args
            .get("path")
            .or_else(|| args.get("file_path"))
            .and_then(|v| v.as_str())
            .is_some()
}

fn rule_matches(rule: &Rule, tool_name: &str, comparison: &str, is_path: bool) -> bool {
    if rule.tool != "*" && rule.tool != tool_name {
        return false;
    }
    if pattern_matches(&rule.pattern, comparison) {
        return true;
    }
    // Path inputs also match on the base filename, so a rule like
    // `Cargo.lock` covers the file anywhere in the tree.
    if is_path
        && let Some(base) = comparison.rsplit('/').next()
        && base != comparison
    {
        return pattern_matches(&rule.pattern, base);
    }
    false
}

fn pattern_matches(pattern: &str, comparison: &str) -> bool {
    match glob::Pattern::new(pattern) {
        Ok(compiled) => compiled.matches(comparison),
        // Invalid globs are never fatal: a trailing-`*` pattern degrades
        // to a prefix match.
        Err(_) => pattern
            .strip_suffix('*')
            .is_some_and(|prefix| comparison.starts_with(prefix)),
    }
}

/// Built-in rules: deny destructive shell commands and secret-bearing
/// paths, allow the common read-only commands. Deliberately no broad
/// per-tool allows — a `tool:*` rule would outrank the wildcard-tool
/// secret-path denials.
pub fn default_rules() -> Vec<Rule> {
    vec![
        Rule::new("bash", "rm -rf*", RuleAction::Deny),
        Rule::new("bash", "sudo *", RuleAction::Deny),
        Rule::new("bash", "git status*", RuleAction::Allow),
        Rule::new("bash", "git diff*", RuleAction::Allow),
        Rule::new("bash", "git show*", RuleAction::Allow),
        Rule::new("bash", "git log*", RuleAction::Allow),
        Rule::new("bash", "rg *", RuleAction::Allow),
        Rule::new("bash", "cargo test*", RuleAction::Allow),
        Rule::new("bash", "cargo clippy*", RuleAction::Allow),
        Rule::new("bash", "cargo fmt --check*", RuleAction::Allow),
        Rule::new("*", "*/.ssh/*", RuleAction::Deny),
        Rule::new("*", "*/.aws/*", RuleAction::Deny),
        Rule::new("*", "*/.gnupg/*", RuleAction::Deny),
    ]
}
