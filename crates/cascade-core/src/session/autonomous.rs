//! Autonomous-loop policy: iteration limits, completion detection, and the
//! no-progress circuit breaker. The orchestrator owns the loop itself; this
//! module owns the decisions made between iterations.

use std::collections::HashSet;
use std::time::Duration;

/// Configuration for an autonomous-loop session.
#[derive(Debug, Clone)]
pub struct LoopConfig {
    /// Task prompt fed to the process on the first iteration.
    pub task: String,
    /// Prompt fed on every subsequent iteration.
    pub continue_prompt: String,
    /// Substring whose appearance in output means the task is done.
    pub completion_promise: String,
    pub max_iterations: u32,
    /// Consecutive no-progress iterations tolerated before the breaker trips.
    pub no_progress_threshold: u32,
    /// Deadline for one iteration's process.
    pub iteration_timeout: Duration,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            task: String::new(),
            continue_prompt: "continue".to_string(),
            completion_promise: "TASK COMPLETE".to_string(),
            max_iterations: 10,
            no_progress_threshold: 3,
            iteration_timeout: Duration::from_secs(600),
        }
    }
}

/// Detects iterations that produce nothing new.
///
/// Each iteration's output is normalized (lines trimmed, blanks dropped) to
/// a set; the iteration made progress iff at least one line was absent from
/// the previous iteration's set. Deterministic, no timing involved.
#[derive(Debug, Default)]
pub struct ProgressTracker {
    previous: HashSet<String>,
    consecutive_no_progress: u32,
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one iteration's output. Returns true if it made progress.
    pub fn observe(&mut self, output: &[String]) -> bool {
        let current: HashSet<String> = output
            .iter()
            .map(|l| l.trim().to_string())
            .filter(|l| !l.is_empty())
            .collect();

        let progressed = current.iter().any(|l| !self.previous.contains(l));
        if progressed {
            self.consecutive_no_progress = 0;
        } else {
            self.consecutive_no_progress += 1;
        }
        self.previous = current;
        progressed
    }

    pub fn consecutive_no_progress(&self) -> u32 {
        self.consecutive_no_progress
    }

    pub fn breaker_tripped(&self, threshold: u32) -> bool {
        self.consecutive_no_progress >= threshold
    }
}

/// Check an iteration's output for the completion promise.
pub fn promise_seen(output: &[String], promise: &str) -> bool {
    !promise.is_empty() && output.iter().any(|l| l.contains(promise))
}
