//! Repetition guard: bounds a turn's lifetime against runaway iteration,
//! repeated identical calls, and consecutive identical errors.

use codewright_core::GuardConfig;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};

/// Result of a guard check. `reason` is human-readable and names the
/// configured limit that was hit.
#[derive(Debug, Clone, Default)]
pub struct Detection {
    pub detected: bool,
    pub reason: String,
}

/// Per-turn bookkeeping. Mutated only from the loop thread; `check` is a
/// pure read over the counters.
///
/// Calls are tracked as a hash of `(tool, input)` rather than the full
/// strings, which keeps history compact for long turns.
#[derive(Debug)]
pub struct RepetitionGuard {
    cfg: GuardConfig,
    iterations: usize,
    /// hash(tool, input) → (tool name for the reason string, count)
    call_counts: HashMap<u64, (String, usize)>,
    error_streak: usize,
    last_error_hash: Option<u64>,
}

impl RepetitionGuard {
    pub fn new(cfg: GuardConfig) -> Self {
        Self {
            cfg,
            iterations: 0,
            call_counts: HashMap::new(),
            error_streak: 0,
            last_error_hash: None,
        }
    }

    /// Rearm for a new user-initiated turn.
    pub fn reset(&mut self) {
        self.iterations = 0;
        self.call_counts.clear();
        self.error_streak = 0;
        self.last_error_hash = None;
    }

    pub fn record_iteration(&mut self) {
        self.iterations += 1;
    }

    /// Record one tool call outcome. A non-error call breaks the error
    /// streak; an error that differs from the previous error restarts
    /// the streak at 1.
    pub fn record_tool_call(
        &mut self,
        name: &str,
        args: &serde_json::Value,
        output: &str,
        is_error: bool,
    ) {
        let call_hash = hash_pair(name, &args.to_string());
        let entry = self
            .call_counts
            .entry(call_hash)
            .or_insert_with(|| (name.to_string(), 0));
        entry.1 += 1;

        if is_error {
            let error_hash = hash_pair(name, output);
            if self.last_error_hash == Some(error_hash) {
                self.error_streak += 1;
            } else {
                self.last_error_hash = Some(error_hash);
                self.error_streak = 1;
            }
        } else {
            self.error_streak = 0;
            self.last_error_hash = None;
        }
    }

    /// Evaluate the counters against the configured thresholds. The
    /// first satisfied condition wins: iterations, then repeated calls,
    /// then consecutive errors.
    pub fn check(&self) -> Detection {
        if self.iterations >= self.cfg.max_iterations {
            return Detection {
                detected: true,
                reason: format!(
                    "iteration limit reached ({} iterations)",
                    self.cfg.max_iterations
                ),
            };
        }
        if let Some((name, count)) = self
            .call_counts
            .values()
            .find(|(_, count)| *count >= self.cfg.max_repeated_calls)
        {
            return Detection {
                detected: true,
                reason: format!(
                    "tool `{name}` called {count} times with identical input (limit {})",
                    self.cfg.max_repeated_calls
                ),
            };
        }
        if self.error_streak >= self.cfg.max_consecutive_errors {
            return Detection {
                detected: true,
                reason: format!(
                    "{} consecutive identical tool errors (limit {})",
                    self.error_streak, self.cfg.max_consecutive_errors
                ),
            };
        }
        Detection::default()
    }

    pub fn iterations(&self) -> usize {
        self.iterations
    }
}

fn hash_pair(name: &str, payload: &str) -> u64 {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    name.hash(&mut hasher);
    payload.hash(&mut hasher);
    hasher.finish()
}
