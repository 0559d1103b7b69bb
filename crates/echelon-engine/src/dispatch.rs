use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use echelon_core::errors::InvokeError;
use echelon_core::events::{EventAction, EventCategory, EventSource};
use echelon_core::hierarchy::{ExecutionMode, HierarchySpec, TeamSpec};
use echelon_core::ids::{AgentId, RunId};
use echelon_core::run::RunOptions;

use crate::bus::EventBus;
use crate::invoker::{DispatchSink, Invoker, SupervisorCall};
use crate::prompt;
use crate::tracker::{ExecutionTracker, Reservation};

/// Everything fixed for the duration of one run: the frozen topology,
/// the options, and the cancellation token checked at every dispatch
/// boundary.
pub struct RunContext {
    pub run_id: RunId,
    pub snapshot: HierarchySpec,
    pub options: RunOptions,
    pub cancel: CancellationToken,
    pub coordinator: EventSource,
}

/// Schedules teams and workers for a run.
///
/// Failure flows one level up and no further: a failed worker fails
/// its team, a failed team becomes a result message for the
/// coordinator. Only coordinator failure or cancellation ends the run.
#[derive(Clone)]
pub struct Dispatcher {
    invoker: Arc<Invoker>,
    bus: Arc<EventBus>,
}

impl Dispatcher {
    pub fn new(invoker: Arc<Invoker>, bus: Arc<EventBus>) -> Self {
        Self { invoker, bus }
    }

    /// Drive one run to a final answer.
    #[instrument(skip_all, fields(run_id = %ctx.run_id, mode = %ctx.snapshot.execution_mode))]
    pub async fn execute(
        &self,
        ctx: Arc<RunContext>,
        tracker: Arc<ExecutionTracker>,
        task: &str,
    ) -> Result<String, InvokeError> {
        match ctx.snapshot.execution_mode {
            ExecutionMode::Sequential => self.execute_sequential(ctx, tracker, task).await,
            ExecutionMode::Parallel => self.execute_parallel(ctx, tracker, task).await,
        }
    }

    /// Sequential mode: the coordinator decides team by team, seeing
    /// each result before the next dispatch.
    async fn execute_sequential(
        &self,
        ctx: Arc<RunContext>,
        tracker: Arc<ExecutionTracker>,
        task: &str,
    ) -> Result<String, InvokeError> {
        let sink = TeamSink {
            dispatcher: self.clone(),
            ctx: ctx.clone(),
            tracker,
        };
        let call = SupervisorCall {
            run_id: &ctx.run_id,
            source: ctx.coordinator.clone(),
            system_prompt: &ctx.snapshot.coordinator_prompt,
            task: prompt::coordinator_task(task, &ctx.snapshot.teams),
            targets: prompt::team_targets(&ctx.snapshot.teams),
            params: ctx.snapshot.params.clone(),
            options: &ctx.options,
            cancel: &ctx.cancel,
        };
        self.invoker.run_loop(call, &sink).await
    }

    /// Parallel mode: every team gets the run task at once, bounded by
    /// the parallel limit, then the coordinator synthesizes.
    async fn execute_parallel(
        &self,
        ctx: Arc<RunContext>,
        tracker: Arc<ExecutionTracker>,
        task: &str,
    ) -> Result<String, InvokeError> {
        let limit = ctx.options.parallel_limit.max(1);
        let semaphore = Arc::new(Semaphore::new(limit));
        let mut set = JoinSet::new();

        for team in &ctx.snapshot.teams {
            if ctx.cancel.is_cancelled() {
                return Err(InvokeError::Cancelled);
            }
            let dispatcher = self.clone();
            let ctx = ctx.clone();
            let tracker = tracker.clone();
            let semaphore = semaphore.clone();
            let team_name = team.name.clone();
            let task = task.to_string();

            set.spawn(async move {
                // Closed on cancellation only, never by the holder.
                let Ok(_permit) = semaphore.acquire().await else {
                    return Err(InvokeError::Cancelled);
                };
                dispatcher
                    .dispatch_team(&ctx, &tracker, &team_name, &task)
                    .await
            });
        }

        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(Ok(_)) => {}
                Ok(Err(InvokeError::Cancelled)) => return Err(InvokeError::Cancelled),
                Ok(Err(e)) => return Err(e),
                Err(e) => {
                    // The team simply produces no result; synthesis
                    // proceeds with whatever finished.
                    warn!(error = %e, "team task aborted");
                }
            }
        }

        if ctx.cancel.is_cancelled() {
            return Err(InvokeError::Cancelled);
        }

        let results = tracker.completed_team_results();
        let failed: Vec<String> = tracker
            .executed_teams()
            .into_iter()
            .filter_map(|(name, ok)| (!ok).then_some(name))
            .collect();

        self.invoker
            .complete(
                &ctx.run_id,
                ctx.coordinator.clone(),
                &ctx.snapshot.coordinator_prompt,
                &prompt::synthesis_task(task, &results, &failed),
                ctx.snapshot.params.clone(),
                &ctx.cancel,
            )
            .await
    }

    /// Execute one team dispatch end to end. Team failure is absorbed
    /// into the returned text; only cancellation escapes as an error.
    #[instrument(skip_all, fields(run_id = %ctx.run_id, team = team_name))]
    async fn dispatch_team(
        &self,
        ctx: &RunContext,
        tracker: &ExecutionTracker,
        team_name: &str,
        task: &str,
    ) -> Result<String, InvokeError> {
        if ctx.cancel.is_cancelled() {
            return Err(InvokeError::Cancelled);
        }

        let Some(team) = ctx.snapshot.team(team_name) else {
            return Err(InvokeError::UnknownDispatchTarget { name: team_name.to_string() });
        };

        if team.prevent_duplicate {
            match tracker.reserve_team(team_name) {
                Reservation::Reserved => {}
                Reservation::Pending => {
                    self.publish_duplicate(ctx, &ctx.coordinator, team_name);
                    return Ok(format!(
                        "Team {team_name} is already executing; its result is not yet available."
                    ));
                }
                Reservation::Done(outcome) => {
                    self.publish_cached(ctx, &ctx.coordinator, team_name, outcome.ok);
                    let status = prompt::execution_status(&tracker.executed_teams())
                        .unwrap_or_default();
                    return Ok(if outcome.ok {
                        format!(
                            "Team {team_name} already executed. Previous result:\n{}\n\n{status}",
                            outcome.output
                        )
                    } else {
                        format!(
                            "Team {team_name} already executed and failed: {}\n\n{status}",
                            outcome.output
                        )
                    });
                }
            }
        } else {
            let _ = tracker.reserve_team(team_name);
        }

        // Context snapshot is taken now, not when the team actually
        // starts working. Both the hierarchy switch and the team's own
        // flag must be set.
        let team_task = if ctx.snapshot.context_sharing && team.share_context {
            prompt::with_shared_context(task, &tracker.completed_team_results())
        } else {
            task.to_string()
        };

        let supervisor = EventSource::team_supervisor(AgentId::new(), team_name);
        self.bus.publish(
            &ctx.run_id,
            ctx.coordinator.clone(),
            EventCategory::Dispatch,
            EventAction::Dispatch,
            json!({ "target": team_name, "task": task }),
        );
        self.bus.publish(
            &ctx.run_id,
            supervisor.clone(),
            EventCategory::Lifecycle,
            EventAction::Started,
            json!({ "team": team_name }),
        );

        let sink = WorkerSink {
            dispatcher: self.clone(),
            ctx,
            tracker,
            team,
            supervisor: supervisor.clone(),
        };
        let call = SupervisorCall {
            run_id: &ctx.run_id,
            source: supervisor.clone(),
            system_prompt: &team.supervisor_prompt,
            task: prompt::supervisor_task(&team_task, team),
            targets: prompt::worker_targets(team),
            params: team.params.clone(),
            options: &ctx.options,
            cancel: &ctx.cancel,
        };

        match self.invoker.run_loop(call, &sink).await {
            Ok(summary) => {
                tracker.complete_team(team_name, true, summary.clone());
                self.bus.publish(
                    &ctx.run_id,
                    supervisor,
                    EventCategory::Lifecycle,
                    EventAction::Completed,
                    json!({ "team": team_name }),
                );
                self.publish_result(ctx, team_name, true);
                info!(team = team_name, "team completed");
                Ok(summary)
            }
            Err(InvokeError::Cancelled) => Err(InvokeError::Cancelled),
            Err(e) => {
                let detail = e.to_string();
                tracker.complete_team(team_name, false, detail.clone());
                self.bus.publish(
                    &ctx.run_id,
                    supervisor,
                    EventCategory::Lifecycle,
                    EventAction::Failed,
                    json!({ "team": team_name, "error": e.error_kind() }),
                );
                self.publish_result(ctx, team_name, false);
                warn!(team = team_name, error = %e, "team failed");
                Ok(format!("Team {team_name} failed: {detail}"))
            }
        }
    }

    /// Execute one worker call. Worker failure propagates so the team
    /// fails with it.
    #[instrument(skip_all, fields(run_id = %ctx.run_id, team = %team.name, worker = worker_name))]
    async fn dispatch_worker(
        &self,
        ctx: &RunContext,
        tracker: &ExecutionTracker,
        team: &TeamSpec,
        supervisor: &EventSource,
        worker_name: &str,
        task: &str,
    ) -> Result<String, InvokeError> {
        if ctx.cancel.is_cancelled() {
            return Err(InvokeError::Cancelled);
        }

        let Some(worker) = team.worker(worker_name) else {
            return Err(InvokeError::UnknownDispatchTarget { name: worker_name.to_string() });
        };

        let key = ExecutionTracker::worker_key(&team.name, worker_name, task);
        if team.prevent_duplicate {
            match tracker.reserve_worker(&key) {
                Reservation::Reserved => {}
                Reservation::Pending => {
                    self.publish_duplicate(ctx, supervisor, worker_name);
                    return Ok(format!("Worker {worker_name} is already executing this task."));
                }
                Reservation::Done(outcome) => {
                    self.publish_cached(ctx, supervisor, worker_name, outcome.ok);
                    return if outcome.ok {
                        Ok(format!(
                            "Worker {worker_name} already handled this task. Previous result:\n{}",
                            outcome.output
                        ))
                    } else {
                        Ok(format!(
                            "Worker {worker_name} already failed this task: {}",
                            outcome.output
                        ))
                    };
                }
            }
        } else {
            let _ = tracker.reserve_worker(&key);
        }

        let source = EventSource::worker(AgentId::new(), &team.name, worker_name);
        self.bus.publish(
            &ctx.run_id,
            supervisor.clone(),
            EventCategory::Dispatch,
            EventAction::Dispatch,
            json!({ "target": worker_name, "task": task }),
        );
        self.bus.publish(
            &ctx.run_id,
            source.clone(),
            EventCategory::Lifecycle,
            EventAction::Started,
            json!({ "worker": worker_name }),
        );

        match self
            .invoker
            .complete(&ctx.run_id, source.clone(), &worker.prompt, task, worker.params.clone(), &ctx.cancel)
            .await
        {
            Ok(output) => {
                tracker.complete_worker(&key, true, output.clone());
                self.bus.publish(
                    &ctx.run_id,
                    source,
                    EventCategory::Lifecycle,
                    EventAction::Completed,
                    json!({ "worker": worker_name }),
                );
                Ok(output)
            }
            Err(e) => {
                tracker.complete_worker(&key, false, e.to_string());
                self.bus.publish(
                    &ctx.run_id,
                    source,
                    EventCategory::Lifecycle,
                    EventAction::Failed,
                    json!({ "worker": worker_name, "error": e.error_kind() }),
                );
                Err(e)
            }
        }
    }

    fn publish_duplicate(&self, ctx: &RunContext, source: &EventSource, target: &str) {
        self.bus.publish(
            &ctx.run_id,
            source.clone(),
            EventCategory::System,
            EventAction::Error,
            json!({ "error": "duplicate_dispatch_rejected", "target": target }),
        );
    }

    fn publish_cached(&self, ctx: &RunContext, source: &EventSource, target: &str, ok: bool) {
        self.bus.publish(
            &ctx.run_id,
            source.clone(),
            EventCategory::Dispatch,
            EventAction::Result,
            json!({ "target": target, "cached": true, "ok": ok }),
        );
    }

    fn publish_result(&self, ctx: &RunContext, target: &str, ok: bool) {
        self.bus.publish(
            &ctx.run_id,
            ctx.coordinator.clone(),
            EventCategory::Dispatch,
            EventAction::Result,
            json!({ "target": target, "cached": false, "ok": ok }),
        );
    }
}

/// The coordinator's dispatch surface: targets are teams.
struct TeamSink {
    dispatcher: Dispatcher,
    ctx: Arc<RunContext>,
    tracker: Arc<ExecutionTracker>,
}

#[async_trait]
impl DispatchSink for TeamSink {
    async fn execute(&self, target: &str, task: &str) -> Result<String, InvokeError> {
        self.dispatcher
            .dispatch_team(&self.ctx, &self.tracker, target, task)
            .await
    }
}

/// A team supervisor's dispatch surface: targets are its workers.
struct WorkerSink<'a> {
    dispatcher: Dispatcher,
    ctx: &'a RunContext,
    tracker: &'a ExecutionTracker,
    team: &'a TeamSpec,
    supervisor: EventSource,
}

#[async_trait]
impl DispatchSink for WorkerSink<'_> {
    async fn execute(&self, target: &str, task: &str) -> Result<String, InvokeError> {
        self.dispatcher
            .dispatch_worker(self.ctx, self.tracker, self.team, &self.supervisor, target, task)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use echelon_core::events::AgentType;
    use echelon_core::hierarchy::{ModelParams, WorkerSpec};
    use echelon_model::{MockDecision, MockProvider};
    use echelon_store::hierarchies::HierarchyRepo;
    use echelon_store::runs::RunRepo;
    use echelon_store::Database;
    use tokio_stream::StreamExt;

    fn worker(name: &str) -> WorkerSpec {
        WorkerSpec {
            name: name.into(),
            description: String::new(),
            prompt: format!("You are {name}."),
            params: ModelParams::default(),
        }
    }

    fn team(name: &str, workers: Vec<WorkerSpec>) -> TeamSpec {
        TeamSpec {
            name: name.into(),
            description: String::new(),
            supervisor_prompt: format!("You supervise {name}."),
            prevent_duplicate: true,
            share_context: false,
            params: ModelParams::default(),
            workers,
        }
    }

    fn hierarchy(mode: ExecutionMode, context_sharing: bool, teams: Vec<TeamSpec>) -> HierarchySpec {
        HierarchySpec {
            id: echelon_core::ids::HierarchyId::new(),
            name: "research".into(),
            description: String::new(),
            execution_mode: mode,
            context_sharing,
            coordinator_prompt: "You coordinate teams.".into(),
            params: ModelParams::default(),
            teams,
        }
    }

    struct Harness {
        provider: Arc<MockProvider>,
        dispatcher: Dispatcher,
        bus: Arc<EventBus>,
        ctx: Arc<RunContext>,
        tracker: Arc<ExecutionTracker>,
    }

    fn harness(spec: HierarchySpec, responses: Vec<MockDecision>, options: RunOptions) -> Harness {
        let db = Database::in_memory().unwrap();
        let row = HierarchyRepo::new(db.clone()).create(spec).unwrap();
        let run = RunRepo::new(db.clone())
            .create(&row.id, "investigate the outage", &row.spec)
            .unwrap();
        let bus = Arc::new(EventBus::new(db));
        let provider = Arc::new(MockProvider::new(responses));
        let invoker = Arc::new(Invoker::new(provider.clone(), bus.clone()));
        let dispatcher = Dispatcher::new(invoker, bus.clone());
        let ctx = Arc::new(RunContext {
            run_id: run.id,
            snapshot: row.spec,
            options,
            cancel: CancellationToken::new(),
            coordinator: EventSource::coordinator(AgentId::new()),
        });
        Harness {
            provider,
            dispatcher,
            bus,
            ctx,
            tracker: Arc::new(ExecutionTracker::new()),
        }
    }

    async fn collect_events(h: &Harness) -> Vec<echelon_core::events::RunEvent> {
        h.bus.close_run(&h.ctx.run_id);
        h.bus.subscribe(&h.ctx.run_id, 0).collect().await
    }

    #[tokio::test]
    async fn sequential_run_with_two_teams_and_workers() {
        let spec = hierarchy(
            ExecutionMode::Sequential,
            false,
            vec![
                team("analysis", vec![worker("reader")]),
                team("review", vec![]),
            ],
        );
        // Call order is fully deterministic in sequential mode.
        let responses = vec![
            MockDecision::dispatch("analysis", "find the root cause"),
            MockDecision::dispatch("reader", "read the logs"),
            MockDecision::finish("logs show a connection reset"),
            MockDecision::finish("root cause: connection reset"),
            MockDecision::dispatch("review", "verify the analysis"),
            MockDecision::finish("analysis verified"),
            MockDecision::finish("outage caused by a connection reset, verified"),
        ];
        let h = harness(spec, responses, RunOptions::default());

        let result = h
            .dispatcher
            .execute(h.ctx.clone(), h.tracker.clone(), "investigate the outage")
            .await
            .unwrap();
        assert_eq!(result, "outage caused by a connection reset, verified");
        assert_eq!(h.provider.call_count(), 7);
        assert_eq!(h.tracker.counts(), (2, 0, 1));

        let events = collect_events(&h).await;
        let supervisor_starts = events
            .iter()
            .filter(|e| {
                e.source.agent_type == AgentType::TeamSupervisor
                    && e.category == EventCategory::Lifecycle
                    && e.action == EventAction::Started
            })
            .count();
        assert_eq!(supervisor_starts, 2);

        // Sequences are contiguous from zero.
        for (i, event) in events.iter().enumerate() {
            assert_eq!(event.sequence, i as u64);
        }
    }

    #[tokio::test]
    async fn duplicate_team_dispatch_returns_cached_result() {
        let spec = hierarchy(
            ExecutionMode::Sequential,
            false,
            vec![team("analysis", vec![])],
        );
        let responses = vec![
            MockDecision::dispatch("analysis", "first pass"),
            MockDecision::finish("analysis result"),
            MockDecision::dispatch("analysis", "second pass"),
            MockDecision::finish("final"),
        ];
        let h = harness(spec, responses, RunOptions::default());

        let result = h
            .dispatcher
            .execute(h.ctx.clone(), h.tracker.clone(), "investigate")
            .await
            .unwrap();
        assert_eq!(result, "final");

        // The supervisor ran once; the repeat dispatch was served from
        // the tracker.
        assert_eq!(h.provider.call_count(), 4);
        assert_eq!(h.tracker.counts(), (1, 0, 0));

        let events = collect_events(&h).await;
        let supervisor_starts = events
            .iter()
            .filter(|e| {
                e.source.agent_type == AgentType::TeamSupervisor
                    && e.action == EventAction::Started
                    && e.category == EventCategory::Lifecycle
            })
            .count();
        assert_eq!(supervisor_starts, 1);
        assert!(events.iter().any(|e| e.data["cached"] == true));

        // The coordinator saw the earlier result text.
        let last_request = h.provider.requests().last().unwrap().clone();
        let last = last_request.messages.last().unwrap();
        assert!(last.content.contains("analysis result"));
    }

    #[tokio::test]
    async fn duplicate_worker_task_served_from_tracker() {
        let spec = hierarchy(
            ExecutionMode::Sequential,
            false,
            vec![team("analysis", vec![worker("reader")])],
        );
        let responses = vec![
            MockDecision::dispatch("analysis", "read everything"),
            MockDecision::dispatch("reader", "read chapter 1"),
            MockDecision::finish("chapter 1 summary"),
            MockDecision::dispatch("reader", "read chapter 1"),
            MockDecision::finish("team summary"),
            MockDecision::finish("final"),
        ];
        let h = harness(spec, responses, RunOptions::default());

        let result = h
            .dispatcher
            .execute(h.ctx.clone(), h.tracker.clone(), "investigate")
            .await
            .unwrap();
        assert_eq!(result, "final");
        assert_eq!(h.provider.call_count(), 6);
        assert_eq!(h.tracker.counts(), (1, 0, 1));

        let events = collect_events(&h).await;
        let worker_starts = events
            .iter()
            .filter(|e| {
                e.source.agent_type == AgentType::Worker
                    && e.category == EventCategory::Lifecycle
                    && e.action == EventAction::Started
            })
            .count();
        assert_eq!(worker_starts, 1);
    }

    #[tokio::test]
    async fn same_worker_different_task_runs_again() {
        let spec = hierarchy(
            ExecutionMode::Sequential,
            false,
            vec![team("analysis", vec![worker("reader")])],
        );
        let responses = vec![
            MockDecision::dispatch("analysis", "read everything"),
            MockDecision::dispatch("reader", "read chapter 1"),
            MockDecision::finish("summary 1"),
            MockDecision::dispatch("reader", "read chapter 2"),
            MockDecision::finish("summary 2"),
            MockDecision::finish("team summary"),
            MockDecision::finish("final"),
        ];
        let h = harness(spec, responses, RunOptions::default());

        h.dispatcher
            .execute(h.ctx.clone(), h.tracker.clone(), "investigate")
            .await
            .unwrap();
        assert_eq!(h.tracker.counts(), (1, 0, 2));
    }

    #[tokio::test]
    async fn context_sharing_feeds_earlier_results_to_later_teams() {
        let spec = hierarchy(
            ExecutionMode::Sequential,
            true,
            vec![
                team("analysis", vec![]),
                TeamSpec { share_context: true, ..team("review", vec![]) },
            ],
        );
        let responses = vec![
            MockDecision::dispatch("analysis", "analyze it"),
            MockDecision::finish("the bug is in the retry path"),
            MockDecision::dispatch("review", "review the analysis"),
            MockDecision::finish("confirmed"),
            MockDecision::finish("final"),
        ];
        let h = harness(spec, responses, RunOptions::default());

        h.dispatcher
            .execute(h.ctx.clone(), h.tracker.clone(), "investigate")
            .await
            .unwrap();

        // Call order: coordinator, analysis supervisor, coordinator,
        // review supervisor, coordinator. The review supervisor's
        // opening task carries the analysis team's result.
        let requests = h.provider.requests();
        let review_request = &requests[3];
        let opening = &review_request.messages[1];
        assert!(opening.content.contains("the bug is in the retry path"));
        assert!(opening.content.contains("[analysis]"));
    }

    #[tokio::test]
    async fn without_context_sharing_results_do_not_leak() {
        let spec = hierarchy(
            ExecutionMode::Sequential,
            false,
            vec![
                team("analysis", vec![]),
                TeamSpec { share_context: true, ..team("review", vec![]) },
            ],
        );
        let responses = vec![
            MockDecision::dispatch("analysis", "analyze it"),
            MockDecision::finish("secret analysis result"),
            MockDecision::dispatch("review", "review it"),
            MockDecision::finish("reviewed"),
            MockDecision::finish("final"),
        ];
        let h = harness(spec, responses, RunOptions::default());

        h.dispatcher
            .execute(h.ctx.clone(), h.tracker.clone(), "investigate")
            .await
            .unwrap();

        // The hierarchy switch is off, so the team flag alone grants
        // nothing.
        let requests = h.provider.requests();
        let opening = &requests[3].messages[1];
        assert!(!opening.content.contains("secret analysis result"));
    }

    #[tokio::test]
    async fn team_without_share_context_stays_isolated() {
        let spec = hierarchy(
            ExecutionMode::Sequential,
            true,
            vec![team("analysis", vec![]), team("review", vec![])],
        );
        let responses = vec![
            MockDecision::dispatch("analysis", "analyze it"),
            MockDecision::finish("secret analysis result"),
            MockDecision::dispatch("review", "review it"),
            MockDecision::finish("reviewed"),
            MockDecision::finish("final"),
        ];
        let h = harness(spec, responses, RunOptions::default());

        h.dispatcher
            .execute(h.ctx.clone(), h.tracker.clone(), "investigate")
            .await
            .unwrap();

        // Sharing is enabled hierarchy-wide, but the review team did
        // not opt in.
        let requests = h.provider.requests();
        let opening = &requests[3].messages[1];
        assert!(!opening.content.contains("secret analysis result"));
    }

    #[tokio::test]
    async fn worker_failure_fails_team_but_run_completes() {
        let spec = hierarchy(
            ExecutionMode::Sequential,
            false,
            vec![team("analysis", vec![worker("reader")])],
        );
        let responses = vec![
            MockDecision::dispatch("analysis", "read everything"),
            MockDecision::dispatch("reader", "read chapter 1"),
            MockDecision::Error(InvokeError::UpstreamRejected {
                status: 400,
                detail: "context too large".into(),
            }),
            MockDecision::finish("final answer despite the failure"),
        ];
        let h = harness(spec, responses, RunOptions::default());

        let result = h
            .dispatcher
            .execute(h.ctx.clone(), h.tracker.clone(), "investigate")
            .await
            .unwrap();
        assert_eq!(result, "final answer despite the failure");
        assert_eq!(h.tracker.counts(), (0, 1, 1));

        let events = collect_events(&h).await;
        assert!(events.iter().any(|e| {
            e.source.agent_type == AgentType::Worker && e.action == EventAction::Failed
        }));
        assert!(events.iter().any(|e| {
            e.source.agent_type == AgentType::TeamSupervisor && e.action == EventAction::Failed
        }));

        // The coordinator was told about the failure.
        let last_request = h.provider.requests().last().unwrap().clone();
        let last = last_request.messages.last().unwrap();
        assert!(last.content.contains("failed"));
    }

    #[tokio::test]
    async fn parallel_mode_runs_all_teams_then_synthesizes() {
        let spec = hierarchy(
            ExecutionMode::Parallel,
            false,
            vec![team("analysis", vec![]), team("review", vec![])],
        );
        // Both supervisors finish with the same text so scheduling
        // order cannot change the outcome; the synthesis call is last.
        let responses = vec![
            MockDecision::finish("team result"),
            MockDecision::finish("team result"),
            MockDecision::finish("synthesized answer"),
        ];
        let h = harness(spec, responses, RunOptions::default());

        let result = h
            .dispatcher
            .execute(h.ctx.clone(), h.tracker.clone(), "investigate")
            .await
            .unwrap();
        assert_eq!(result, "synthesized answer");
        assert_eq!(h.tracker.counts(), (2, 0, 0));
        assert_eq!(h.provider.call_count(), 3);
    }

    #[tokio::test]
    async fn parallel_mode_synthesis_names_failed_teams() {
        let spec = hierarchy(
            ExecutionMode::Parallel,
            false,
            vec![team("analysis", vec![])],
        );
        let responses = vec![
            MockDecision::Error(InvokeError::UpstreamRejected {
                status: 400,
                detail: "rejected".into(),
            }),
            MockDecision::finish("partial answer"),
        ];
        let h = harness(spec, responses, RunOptions::default());

        let result = h
            .dispatcher
            .execute(h.ctx.clone(), h.tracker.clone(), "investigate")
            .await
            .unwrap();
        assert_eq!(result, "partial answer");
        assert_eq!(h.tracker.counts(), (0, 1, 0));

        let synthesis = h.provider.requests().last().unwrap().clone();
        assert!(synthesis.messages[1].content.contains("Teams that failed: analysis"));
    }

    #[tokio::test]
    async fn cancelled_run_stops_at_dispatch_boundary() {
        let spec = hierarchy(
            ExecutionMode::Sequential,
            false,
            vec![team("analysis", vec![])],
        );
        let h = harness(spec, vec![MockDecision::finish("unused")], RunOptions::default());
        h.ctx.cancel.cancel();

        let err = h
            .dispatcher
            .execute(h.ctx.clone(), h.tracker.clone(), "investigate")
            .await
            .unwrap_err();
        assert!(matches!(err, InvokeError::Cancelled));
    }

    #[tokio::test]
    async fn re_invokable_team_runs_on_every_dispatch() {
        let spec = hierarchy(
            ExecutionMode::Sequential,
            false,
            vec![TeamSpec { prevent_duplicate: false, ..team("analysis", vec![]) }],
        );
        let responses = vec![
            MockDecision::dispatch("analysis", "first"),
            MockDecision::finish("result one"),
            MockDecision::dispatch("analysis", "second"),
            MockDecision::finish("result two"),
            MockDecision::finish("final"),
        ];
        let h = harness(spec, responses, RunOptions::default());

        let result = h
            .dispatcher
            .execute(h.ctx.clone(), h.tracker.clone(), "investigate")
            .await
            .unwrap();
        assert_eq!(result, "final");
        // Both dispatches actually ran the supervisor.
        assert_eq!(h.provider.call_count(), 5);
        let (total, per_team) = h.tracker.call_stats();
        assert_eq!(total, 2);
        assert_eq!(per_team.get("analysis"), Some(&2));
    }

    #[tokio::test]
    async fn dedup_is_per_team_not_per_run() {
        let spec = hierarchy(
            ExecutionMode::Sequential,
            false,
            vec![
                TeamSpec { prevent_duplicate: false, ..team("poller", vec![]) },
                team("analysis", vec![]),
            ],
        );
        let responses = vec![
            MockDecision::dispatch("poller", "poll once"),
            MockDecision::finish("poll result one"),
            MockDecision::dispatch("poller", "poll again"),
            MockDecision::finish("poll result two"),
            MockDecision::dispatch("analysis", "first pass"),
            MockDecision::finish("analysis result"),
            MockDecision::dispatch("analysis", "second pass"),
            MockDecision::finish("final"),
        ];
        let h = harness(spec, responses, RunOptions::default());

        let result = h
            .dispatcher
            .execute(h.ctx.clone(), h.tracker.clone(), "investigate")
            .await
            .unwrap();
        assert_eq!(result, "final");

        // The poller ran twice; the analysis repeat was served from
        // the tracker, so no second supervisor call happened for it.
        assert_eq!(h.provider.call_count(), 8);
        let (total, per_team) = h.tracker.call_stats();
        assert_eq!(total, 3);
        assert_eq!(per_team.get("poller"), Some(&2));
        assert_eq!(per_team.get("analysis"), Some(&1));
    }
}
