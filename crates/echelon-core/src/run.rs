use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Run lifecycle. Terminal states absorb: once a run is completed,
/// failed, or cancelled, no further transition is valid.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    pub fn can_transition_to(&self, next: RunStatus) -> bool {
        match (self, next) {
            (Self::Pending, Self::Running) => true,
            (Self::Pending, s) if s.is_terminal() => true,
            (Self::Running, s) if s.is_terminal() => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for RunStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(format!("unknown run status: {other}")),
        }
    }
}

/// Per-run knobs supplied at start time. Duplicate suppression is not
/// here: it is a per-team flag on the hierarchy itself.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RunOptions {
    /// Maximum decision-loop iterations per supervisor.
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
    /// Whether a retried upstream call consumes a decision iteration.
    #[serde(default)]
    pub retry_counts_toward_cap: bool,
    /// Concurrent team limit in parallel mode.
    #[serde(default = "default_parallel_limit")]
    pub parallel_limit: usize,
    /// Run-level timeout in seconds; the run is auto-cancelled when it fires.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_max_iterations() -> u32 {
    10
}

fn default_parallel_limit() -> usize {
    4
}

fn default_timeout_secs() -> u64 {
    600
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            max_iterations: default_max_iterations(),
            retry_counts_toward_cap: false,
            parallel_limit: default_parallel_limit(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl RunOptions {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Summary recorded on a finished run. A call is one team dispatch
/// that actually executed; served-from-cache repeats do not count.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct RunStatistics {
    pub total_calls: u32,
    /// Executed-call tally per team name.
    #[serde(default)]
    pub team_calls: HashMap<String, u32>,
    pub completed_calls: u32,
    pub teams_total: u32,
    pub teams_completed: u32,
    pub teams_failed: u32,
    pub workers_invoked: u32,
    pub events_published: u64,
    pub duration_ms: u64,
}
