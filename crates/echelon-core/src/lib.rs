pub mod errors;
pub mod events;
pub mod hierarchy;
pub mod ids;
pub mod provider;
pub mod run;

pub use errors::InvokeError;
pub use events::{AgentType, EventAction, EventCategory, EventSource, RunEvent};
pub use hierarchy::{ExecutionMode, HierarchySpec, ModelParams, TeamSpec, WorkerSpec};
pub use ids::{AgentId, EventId, HierarchyId, RunId};
pub use provider::{Decision, DecisionProvider, DecisionRequest, TargetInfo};
pub use run::{RunOptions, RunStatistics, RunStatus};
