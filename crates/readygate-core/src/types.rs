//! Result types produced by a readiness run.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// One probe of one check. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttemptResult {
    pub check_name: String,
    /// 0-based position within the check's attempts.
    pub attempt_index: u32,
    pub success: bool,
    pub latency_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_detail: Option<String>,
    /// The attempt hit its per-attempt timeout.
    #[serde(default)]
    pub timed_out: bool,
}

/// Terminal state of a check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckState {
    Ready,
    TimedOut,
    Failed,
}

impl CheckState {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Ready => "ready",
            Self::TimedOut => "timed out",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for CheckState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Final record for one check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckOutcome {
    pub check_name: String,
    pub state: CheckState,
    pub attempts: Vec<AttemptResult>,
    pub total_elapsed_ms: u64,
}

impl CheckOutcome {
    pub fn is_ready(&self) -> bool {
        self.state == CheckState::Ready
    }

    /// Error from the most recent failed attempt, if any.
    pub fn last_error(&self) -> Option<&str> {
        self.attempts
            .iter()
            .rev()
            .find_map(|a| a.error_detail.as_deref())
    }
}

/// Aggregate result of a readiness run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OverallResult {
    pub outcomes: BTreeMap<String, CheckOutcome>,
    pub all_ready: bool,
    pub total_elapsed_ms: u64,
    /// The overall timeout fired before every check finished.
    #[serde(default)]
    pub deadline_exceeded: bool,
    /// The run was cancelled from outside (e.g. Ctrl-C).
    #[serde(default)]
    pub interrupted: bool,
}

impl OverallResult {
    /// Build from terminal outcomes. `all_ready` is derived, never set.
    pub fn from_outcomes(
        outcomes: impl IntoIterator<Item = CheckOutcome>,
        total_elapsed_ms: u64,
        deadline_exceeded: bool,
        interrupted: bool,
    ) -> Self {
        let outcomes: BTreeMap<_, _> = outcomes
            .into_iter()
            .map(|o| (o.check_name.clone(), o))
            .collect();
        let all_ready = outcomes.values().all(CheckOutcome::is_ready);
        Self {
            outcomes,
            all_ready,
            total_elapsed_ms,
            deadline_exceeded,
            interrupted,
        }
    }

    pub fn ready_count(&self) -> usize {
        self.outcomes.values().filter(|o| o.is_ready()).count()
    }
}
