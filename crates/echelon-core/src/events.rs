use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{AgentId, EventId, RunId};

/// Which layer of the hierarchy produced an event.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentType {
    Coordinator,
    TeamSupervisor,
    Worker,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventCategory {
    Lifecycle,
    Llm,
    Dispatch,
    System,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventAction {
    Started,
    Completed,
    Failed,
    Cancelled,
    Dispatch,
    Result,
    Error,
}

/// Identifies the agent an event originated from.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EventSource {
    pub agent_type: AgentType,
    pub agent_id: AgentId,
    pub agent_name: String,
    /// Set for team supervisors and workers; None for the coordinator.
    pub team_name: Option<String>,
}

impl EventSource {
    pub fn coordinator(agent_id: AgentId) -> Self {
        Self {
            agent_type: AgentType::Coordinator,
            agent_id,
            agent_name: "coordinator".into(),
            team_name: None,
        }
    }

    pub fn team_supervisor(agent_id: AgentId, team: impl Into<String>) -> Self {
        let team = team.into();
        Self {
            agent_type: AgentType::TeamSupervisor,
            agent_id,
            agent_name: format!("{team}_supervisor"),
            team_name: Some(team),
        }
    }

    pub fn worker(agent_id: AgentId, team: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            agent_type: AgentType::Worker,
            agent_id,
            agent_name: name.into(),
            team_name: Some(team.into()),
        }
    }
}

/// A single observable event within a run.
/// Sequences are per-run, monotonic from 0, with no gaps.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RunEvent {
    pub id: EventId,
    pub run_id: RunId,
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    pub source: EventSource,
    pub category: EventCategory,
    pub action: EventAction,
    #[serde(default)]
    pub data: serde_json::Value,
}

impl RunEvent {
    /// True for the run-level lifecycle event that ends a live stream.
    pub fn is_run_terminal(&self) -> bool {
        self.category == EventCategory::Lifecycle
            && self.source.agent_type == AgentType::Coordinator
            && matches!(
                self.action,
                EventAction::Completed | EventAction::Failed | EventAction::Cancelled
            )
    }

    /// Short classification string for logging.
    pub fn kind(&self) -> String {
        format!("{}.{}", category_str(self.category), action_str(self.action))
    }
}

fn category_str(c: EventCategory) -> &'static str {
    match c {
        EventCategory::Lifecycle => "lifecycle",
        EventCategory::Llm => "llm",
        EventCategory::Dispatch => "dispatch",
        EventCategory::System => "system",
    }
}

fn action_str(a: EventAction) -> &'static str {
    match a {
        EventAction::Started => "started",
        EventAction::Completed => "completed",
        EventAction::Failed => "failed",
        EventAction::Cancelled => "cancelled",
        EventAction::Dispatch => "dispatch",
        EventAction::Result => "result",
        EventAction::Error => "error",
    }
}
