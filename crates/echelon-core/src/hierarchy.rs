use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::ids::HierarchyId;

/// How teams are scheduled within a run.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    Sequential,
    Parallel,
}

impl std::fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Sequential => write!(f, "sequential"),
            Self::Parallel => write!(f, "parallel"),
        }
    }
}

impl std::str::FromStr for ExecutionMode {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sequential" => Ok(Self::Sequential),
            "parallel" => Ok(Self::Parallel),
            other => Err(format!("unknown execution mode: {other}")),
        }
    }
}

/// Sampling parameters passed through to the upstream model.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ModelParams {
    #[serde(default = "default_temperature")]
    pub temperature: f64,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
}

fn default_temperature() -> f64 {
    0.7
}

fn default_max_tokens() -> u32 {
    2048
}

impl Default for ModelParams {
    fn default() -> Self {
        Self {
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WorkerSpec {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub prompt: String,
    #[serde(default)]
    pub params: ModelParams,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TeamSpec {
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// System prompt for the team supervisor.
    pub supervisor_prompt: String,
    /// Suppress repeat dispatches of this team and its workers within
    /// a run. Disable for intentionally re-invokable teams.
    #[serde(default = "default_true")]
    pub prevent_duplicate: bool,
    /// Receive prior teams' results in the task text. Effective only
    /// when the hierarchy also enables context sharing.
    #[serde(default)]
    pub share_context: bool,
    #[serde(default)]
    pub params: ModelParams,
    pub workers: Vec<WorkerSpec>,
}

fn default_true() -> bool {
    true
}

/// A persisted coordinator -> teams -> workers topology.
/// Immutable for the duration of a run; runs record a snapshot at start.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HierarchySpec {
    #[serde(default)]
    pub id: HierarchyId,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub execution_mode: ExecutionMode,
    /// Whether completed-team results flow into later team prompts.
    #[serde(default)]
    pub context_sharing: bool,
    /// System prompt for the coordinator.
    pub coordinator_prompt: String,
    #[serde(default)]
    pub params: ModelParams,
    pub teams: Vec<TeamSpec>,
}

impl HierarchySpec {
    /// Structural validation applied when a hierarchy is loaded.
    pub fn validate(&self) -> Result<(), String> {
        if self.name.trim().is_empty() {
            return Err("hierarchy name must not be empty".into());
        }
        if self.teams.is_empty() {
            return Err("hierarchy must define at least one team".into());
        }

        let mut team_names = HashSet::new();
        for team in &self.teams {
            if team.name.trim().is_empty() {
                return Err("team name must not be empty".into());
            }
            if !team_names.insert(team.name.as_str()) {
                return Err(format!("duplicate team name: {}", team.name));
            }

            let mut worker_names = HashSet::new();
            for worker in &team.workers {
                if worker.name.trim().is_empty() {
                    return Err(format!("empty worker name in team {}", team.name));
                }
                if !worker_names.insert(worker.name.as_str()) {
                    return Err(format!(
                        "duplicate worker name {} in team {}",
                        worker.name, team.name
                    ));
                }
            }
        }
        Ok(())
    }

    pub fn team(&self, name: &str) -> Option<&TeamSpec> {
        self.teams.iter().find(|t| t.name == name)
    }
}

impl TeamSpec {
    pub fn worker(&self, name: &str) -> Option<&WorkerSpec> {
        self.workers.iter().find(|w| w.name == name)
    }
}
