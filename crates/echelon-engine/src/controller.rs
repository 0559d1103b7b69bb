use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use serde_json::json;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

use echelon_core::errors::InvokeError;
use echelon_core::events::{EventAction, EventCategory, EventSource, RunEvent};
use echelon_core::hierarchy::HierarchySpec;
use echelon_core::ids::{AgentId, HierarchyId, RunId};
use echelon_core::provider::DecisionProvider;
use echelon_core::run::{RunOptions, RunStatistics, RunStatus};
use echelon_store::hierarchies::{HierarchyRepo, HierarchyRow};
use echelon_store::runs::{RunRepo, RunRow};
use echelon_store::{Database, StoreError};

use crate::bus::EventBus;
use crate::dispatch::{Dispatcher, RunContext};
use crate::error::EngineError;
use crate::invoker::Invoker;
use crate::tracker::ExecutionTracker;

struct ActiveRun {
    cancel: CancellationToken,
}

/// Owns run lifecycles: starts runs, drives them to a terminal state
/// on background tasks, and mediates cancellation and queries.
pub struct RunController {
    runs: RunRepo,
    hierarchies: HierarchyRepo,
    bus: Arc<EventBus>,
    dispatcher: Dispatcher,
    active: DashMap<RunId, ActiveRun>,
}

impl RunController {
    pub fn new(db: Database, provider: Arc<dyn DecisionProvider>) -> Arc<Self> {
        let bus = Arc::new(EventBus::new(db.clone()));
        let invoker = Arc::new(Invoker::new(provider, bus.clone()));
        let dispatcher = Dispatcher::new(invoker, bus.clone());
        Arc::new(Self {
            runs: RunRepo::new(db.clone()),
            hierarchies: HierarchyRepo::new(db),
            bus,
            dispatcher,
            active: DashMap::new(),
        })
    }

    pub fn bus(&self) -> Arc<EventBus> {
        self.bus.clone()
    }

    pub fn create_hierarchy(&self, spec: HierarchySpec) -> Result<HierarchyRow, EngineError> {
        spec.validate().map_err(EngineError::InvalidHierarchy)?;
        Ok(self.hierarchies.create(spec)?)
    }

    pub fn get_hierarchy(&self, id: &HierarchyId) -> Result<HierarchyRow, EngineError> {
        self.hierarchies.get(id).map_err(|e| match e {
            StoreError::NotFound(_) => EngineError::HierarchyNotFound(id.to_string()),
            other => other.into(),
        })
    }

    pub fn list_hierarchies(&self, limit: u32, offset: u32) -> Result<Vec<HierarchyRow>, EngineError> {
        Ok(self.hierarchies.list(limit, offset)?)
    }

    /// Create a pending run and start driving it on a background task.
    /// The returned row is the pending snapshot; progress flows through
    /// the event stream.
    #[instrument(skip(self, options), fields(hierarchy_id = %hierarchy_id))]
    pub fn start_run(
        self: &Arc<Self>,
        hierarchy_id: &HierarchyId,
        task: &str,
        options: RunOptions,
    ) -> Result<RunRow, EngineError> {
        let hierarchy = self.get_hierarchy(hierarchy_id)?;
        hierarchy.spec.validate().map_err(EngineError::InvalidHierarchy)?;

        let row = self.runs.create(hierarchy_id, task, &hierarchy.spec)?;
        let cancel = CancellationToken::new();
        self.active.insert(row.id.clone(), ActiveRun { cancel: cancel.clone() });

        let ctx = Arc::new(RunContext {
            run_id: row.id.clone(),
            snapshot: hierarchy.spec,
            options,
            cancel,
            coordinator: EventSource::coordinator(AgentId::new()),
        });
        let controller = self.clone();
        let task = task.to_string();
        tokio::spawn(async move {
            controller.drive_run(ctx, task).await;
        });

        info!(run_id = %row.id, "run started");
        Ok(row)
    }

    /// The background body of one run. Always leaves the run in a
    /// terminal state and always publishes the terminal event last.
    async fn drive_run(&self, ctx: Arc<RunContext>, task: String) {
        let run_id = ctx.run_id.clone();
        let started = Instant::now();
        let tracker = Arc::new(ExecutionTracker::new());

        match self.runs.mark_running(&run_id) {
            Ok(true) => {}
            Ok(false) => {
                // Cancelled before the task got scheduled.
                self.active.remove(&run_id);
                return;
            }
            Err(e) => {
                error!(run_id = %run_id, error = %e, "failed to mark run running");
                self.active.remove(&run_id);
                return;
            }
        }

        self.bus.publish(
            &run_id,
            ctx.coordinator.clone(),
            EventCategory::Lifecycle,
            EventAction::Started,
            json!({ "task": task }),
        );

        // The timer owns the timeout: it only requests cancellation,
        // and the dispatcher observes it at the next dispatch boundary.
        // The dispatcher future itself is never dropped mid-call, so an
        // in-flight agent call always finishes.
        let timeout = ctx.options.timeout();
        let timer = {
            let cancel = ctx.cancel.clone();
            let run_id = run_id.clone();
            tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                warn!(run_id = %run_id, ?timeout, "run timed out");
                cancel.cancel();
            })
        };
        let outcome = self.dispatcher.execute(ctx.clone(), tracker.clone(), &task).await;
        timer.abort();

        let (status, result, error_text, action) = match outcome {
            Ok(text) => (RunStatus::Completed, Some(text), None, EventAction::Completed),
            Err(InvokeError::Cancelled) => {
                let reason = if started.elapsed() >= timeout {
                    format!("run timed out after {}s", ctx.options.timeout_secs)
                } else {
                    "run cancelled".to_string()
                };
                (RunStatus::Cancelled, None, Some(reason), EventAction::Cancelled)
            }
            Err(e) => (RunStatus::Failed, None, Some(e.to_string()), EventAction::Failed),
        };

        let (teams_completed, teams_failed, workers_invoked) = tracker.counts();
        let (total_calls, team_calls) = tracker.call_stats();
        let statistics = RunStatistics {
            total_calls,
            team_calls,
            completed_calls: teams_completed,
            teams_total: ctx.snapshot.teams.len() as u32,
            teams_completed,
            teams_failed,
            workers_invoked,
            // The terminal event published below is part of the run.
            events_published: self.bus.published_count(&run_id) + 1,
            duration_ms: started.elapsed().as_millis() as u64,
        };

        match self.runs.finish(
            &run_id,
            status,
            result.as_deref(),
            error_text.as_deref(),
            &statistics,
        ) {
            Ok(true) => {}
            Ok(false) => warn!(run_id = %run_id, "run was already terminal"),
            Err(e) => error!(run_id = %run_id, error = %e, "failed to record run outcome"),
        }

        self.bus.publish(
            &run_id,
            ctx.coordinator.clone(),
            EventCategory::Lifecycle,
            action,
            json!({
                "status": status.to_string(),
                "duration_ms": statistics.duration_ms,
                "error": error_text,
            }),
        );

        self.bus.close_run(&run_id);
        self.active.remove(&run_id);
        info!(run_id = %run_id, %status, "run finished");
    }

    pub fn get_run(&self, id: &RunId) -> Result<RunRow, EngineError> {
        self.runs.get(id).map_err(|e| match e {
            StoreError::NotFound(_) => EngineError::RunNotFound(id.to_string()),
            other => other.into(),
        })
    }

    pub fn list_runs(
        &self,
        limit: u32,
        offset: u32,
        status: Option<RunStatus>,
    ) -> Result<Vec<RunRow>, EngineError> {
        Ok(self.runs.list(limit, offset, status)?)
    }

    /// Request cancellation. Valid only while the run is pending or
    /// running; the transition lands at the next dispatch boundary.
    #[instrument(skip(self), fields(run_id = %id))]
    pub fn cancel_run(&self, id: &RunId) -> Result<RunRow, EngineError> {
        let row = self.get_run(id)?;
        if row.status.is_terminal() {
            return Err(EngineError::InvalidState { status: row.status });
        }

        if let Some(active) = self.active.get(id) {
            active.cancel.cancel();
            info!(run_id = %id, "cancellation requested");
        } else {
            // No task owns this run (process restart); settle it here.
            let statistics = RunStatistics::default();
            self.runs
                .finish(id, RunStatus::Cancelled, None, Some("run cancelled"), &statistics)?;
            self.bus.publish(
                id,
                EventSource::coordinator(AgentId::new()),
                EventCategory::Lifecycle,
                EventAction::Cancelled,
                json!({ "status": "cancelled" }),
            );
            self.bus.close_run(id);
        }

        self.get_run(id)
    }

    /// Event stream for a run from the given sequence. Replays
    /// persisted events, then follows live publishes until the
    /// terminal event.
    pub fn subscribe_events(
        &self,
        id: &RunId,
        from: u64,
    ) -> Result<ReceiverStream<RunEvent>, EngineError> {
        self.get_run(id)?;
        Ok(self.bus.subscribe(id, from))
    }

    /// Cancel every active run. Used on shutdown.
    pub fn cancel_all(&self) {
        for entry in self.active.iter() {
            entry.value().cancel.cancel();
        }
    }
}
