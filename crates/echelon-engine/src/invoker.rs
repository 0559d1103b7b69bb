use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use echelon_core::errors::InvokeError;
use echelon_core::events::{EventAction, EventCategory, EventSource};
use echelon_core::hierarchy::ModelParams;
use echelon_core::ids::RunId;
use echelon_core::provider::{ChatMessage, Decision, DecisionProvider, DecisionRequest, TargetInfo};
use echelon_core::run::RunOptions;

use crate::bus::EventBus;
use crate::prompt;

/// Transport retries per decision when the loop itself must retry.
/// Providers are normally wrapped in retry middleware already, so this
/// bounds pathological cases rather than doing the heavy lifting.
const MAX_LOOP_RETRIES: u32 = 2;

/// Executes one dispatch decision on behalf of a decision loop.
/// Implementations absorb downstream failures into the returned text;
/// only cancellation propagates as an error.
#[async_trait]
pub trait DispatchSink: Send + Sync {
    async fn execute(&self, target: &str, task: &str) -> Result<String, InvokeError>;
}

/// Everything a single supervisor decision loop needs.
pub struct SupervisorCall<'a> {
    pub run_id: &'a RunId,
    pub source: EventSource,
    pub system_prompt: &'a str,
    pub task: String,
    pub targets: Vec<TargetInfo>,
    pub params: ModelParams,
    pub options: &'a RunOptions,
    pub cancel: &'a CancellationToken,
}

/// Drives supervisor decision loops and plain worker completions
/// against the upstream model, publishing per-call events.
pub struct Invoker {
    provider: Arc<dyn DecisionProvider>,
    bus: Arc<EventBus>,
}

impl Invoker {
    pub fn new(provider: Arc<dyn DecisionProvider>, bus: Arc<EventBus>) -> Self {
        Self { provider, bus }
    }

    /// Run a supervisor decision loop until the model finishes, the
    /// iteration cap is hit, or the run is cancelled.
    ///
    /// Unknown dispatch targets consume an iteration, surface as an
    /// error event, and feed a corrective message back to the model.
    /// The loop itself continues.
    #[instrument(skip_all, fields(run_id = %call.run_id, agent = %call.source.agent_name))]
    pub async fn run_loop(
        &self,
        call: SupervisorCall<'_>,
        sink: &dyn DispatchSink,
    ) -> Result<String, InvokeError> {
        let cap = call.options.max_iterations;
        let mut iterations = 0u32;
        let mut retries = 0u32;
        let mut messages = vec![
            ChatMessage::system(call.system_prompt),
            ChatMessage::user(&call.task),
        ];

        loop {
            if call.cancel.is_cancelled() {
                return Err(InvokeError::Cancelled);
            }

            self.bus.publish(
                call.run_id,
                call.source.clone(),
                EventCategory::Llm,
                EventAction::Started,
                json!({ "iteration": iterations }),
            );

            let request = DecisionRequest {
                messages: messages.clone(),
                targets: call.targets.clone(),
                params: call.params.clone(),
            };

            match self.provider.decide(&request).await {
                Ok(Decision::Finish { text }) => {
                    self.bus.publish(
                        call.run_id,
                        call.source.clone(),
                        EventCategory::Llm,
                        EventAction::Completed,
                        json!({ "decision": "finish" }),
                    );
                    return Ok(text);
                }
                Ok(Decision::Dispatch { target, task }) => {
                    // The cap bounds dispatch decisions; a finish call
                    // is always allowed.
                    iterations += 1;
                    retries = 0;
                    self.bus.publish(
                        call.run_id,
                        call.source.clone(),
                        EventCategory::Llm,
                        EventAction::Completed,
                        json!({ "decision": "dispatch", "target": target }),
                    );
                    if iterations > cap {
                        self.publish_error(&call, &InvokeError::IterationCapExceeded { cap });
                        return Err(InvokeError::IterationCapExceeded { cap });
                    }

                    if !call.targets.iter().any(|t| t.name == target) {
                        warn!(target, "dispatch target outside the offered set");
                        self.bus.publish(
                            call.run_id,
                            call.source.clone(),
                            EventCategory::System,
                            EventAction::Error,
                            json!({
                                "error": "unknown_dispatch_target",
                                "target": target,
                            }),
                        );
                        messages.push(ChatMessage::assistant(format!(
                            "Dispatching to {target}: {task}"
                        )));
                        messages.push(ChatMessage::user(prompt::unknown_target(
                            &target,
                            &call.targets,
                        )));
                        continue;
                    }

                    let result = sink.execute(&target, &task).await?;
                    messages.push(ChatMessage::assistant(format!(
                        "Dispatching to {target}: {task}"
                    )));
                    messages.push(ChatMessage::user(prompt::dispatch_result(&target, &result)));
                }
                Err(e) if e.is_retryable() && retries < MAX_LOOP_RETRIES => {
                    retries += 1;
                    if call.options.retry_counts_toward_cap {
                        iterations += 1;
                        if iterations > cap {
                            self.publish_error(&call, &e);
                            self.publish_error(&call, &InvokeError::IterationCapExceeded { cap });
                            return Err(InvokeError::IterationCapExceeded { cap });
                        }
                    }
                    debug!(error = %e, retries, "retrying supervisor decision");
                    self.publish_error(&call, &e);
                }
                Err(e) => {
                    self.publish_error(&call, &e);
                    return Err(e);
                }
            }
        }
    }

    /// One plain completion with no dispatch targets. Used for worker
    /// calls and coordinator synthesis.
    #[instrument(skip_all, fields(run_id = %run_id, agent = %source.agent_name))]
    pub async fn complete(
        &self,
        run_id: &RunId,
        source: EventSource,
        system_prompt: &str,
        task: &str,
        params: ModelParams,
        cancel: &CancellationToken,
    ) -> Result<String, InvokeError> {
        if cancel.is_cancelled() {
            return Err(InvokeError::Cancelled);
        }

        self.bus.publish(
            run_id,
            source.clone(),
            EventCategory::Llm,
            EventAction::Started,
            json!({}),
        );

        let request = DecisionRequest::completion(
            vec![ChatMessage::system(system_prompt), ChatMessage::user(task)],
            params,
        );

        match self.provider.decide(&request).await {
            Ok(Decision::Finish { text }) => {
                self.bus.publish(
                    run_id,
                    source,
                    EventCategory::Llm,
                    EventAction::Completed,
                    json!({ "decision": "finish" }),
                );
                Ok(text)
            }
            Ok(Decision::Dispatch { target, .. }) => {
                // No targets were offered, so any tool call is invalid.
                let e = InvokeError::UnknownDispatchTarget { name: target };
                self.bus.publish(
                    run_id,
                    source,
                    EventCategory::Llm,
                    EventAction::Error,
                    json!({ "error": e.error_kind() }),
                );
                Err(e)
            }
            Err(e) => {
                self.bus.publish(
                    run_id,
                    source,
                    EventCategory::Llm,
                    EventAction::Error,
                    json!({ "error": e.error_kind(), "detail": e.to_string() }),
                );
                Err(e)
            }
        }
    }

    fn publish_error(&self, call: &SupervisorCall<'_>, e: &InvokeError) {
        self.bus.publish(
            call.run_id,
            call.source.clone(),
            EventCategory::Llm,
            EventAction::Error,
            json!({
                "error": e.error_kind(),
                "detail": e.to_string(),
                "retryable": e.is_retryable(),
            }),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use echelon_core::hierarchy::{ExecutionMode, HierarchySpec, TeamSpec};
    use echelon_core::ids::AgentId;
    use echelon_model::{MockDecision, MockProvider};
    use echelon_store::hierarchies::HierarchyRepo;
    use echelon_store::runs::RunRepo;
    use echelon_store::Database;
    use parking_lot::Mutex;

    struct RecordingSink {
        calls: Mutex<Vec<(String, String)>>,
        reply: String,
    }

    impl RecordingSink {
        fn new(reply: &str) -> Self {
            Self { calls: Mutex::new(Vec::new()), reply: reply.into() }
        }

        fn calls(&self) -> Vec<(String, String)> {
            self.calls.lock().clone()
        }
    }

    #[async_trait]
    impl DispatchSink for RecordingSink {
        async fn execute(&self, target: &str, task: &str) -> Result<String, InvokeError> {
            self.calls.lock().push((target.to_string(), task.to_string()));
            Ok(self.reply.clone())
        }
    }

    fn spec() -> HierarchySpec {
        HierarchySpec {
            id: echelon_core::ids::HierarchyId::new(),
            name: "research".into(),
            description: String::new(),
            execution_mode: ExecutionMode::Sequential,
            context_sharing: false,
            coordinator_prompt: "coordinate".into(),
            params: ModelParams::default(),
            teams: vec![TeamSpec {
                name: "analysis".into(),
                description: String::new(),
                supervisor_prompt: "supervise".into(),
                prevent_duplicate: true,
                share_context: false,
                params: ModelParams::default(),
                workers: vec![],
            }],
        }
    }

    fn setup(responses: Vec<MockDecision>) -> (Arc<MockProvider>, Invoker, RunId, Arc<EventBus>) {
        let db = Database::in_memory().unwrap();
        let hierarchy = HierarchyRepo::new(db.clone()).create(spec()).unwrap();
        let run = RunRepo::new(db.clone())
            .create(&hierarchy.id, "investigate", &hierarchy.spec)
            .unwrap();
        let bus = Arc::new(EventBus::new(db));
        let provider = Arc::new(MockProvider::new(responses));
        let invoker = Invoker::new(provider.clone(), bus.clone());
        (provider, invoker, run.id, bus)
    }

    fn targets() -> Vec<TargetInfo> {
        vec![TargetInfo { name: "analysis".into(), description: "the analysis team".into() }]
    }

    fn call<'a>(
        run_id: &'a RunId,
        options: &'a RunOptions,
        cancel: &'a CancellationToken,
    ) -> SupervisorCall<'a> {
        SupervisorCall {
            run_id,
            source: EventSource::coordinator(AgentId::new()),
            system_prompt: "coordinate teams",
            task: "investigate".into(),
            targets: targets(),
            params: ModelParams::default(),
            options,
            cancel,
        }
    }

    #[tokio::test]
    async fn finish_returns_text() {
        let (_, invoker, run_id, _) = setup(vec![MockDecision::finish("all done")]);
        let options = RunOptions::default();
        let cancel = CancellationToken::new();
        let sink = RecordingSink::new("ignored");

        let text = invoker
            .run_loop(call(&run_id, &options, &cancel), &sink)
            .await
            .unwrap();
        assert_eq!(text, "all done");
        assert!(sink.calls().is_empty());
    }

    #[tokio::test]
    async fn dispatch_feeds_result_back_into_conversation() {
        let (provider, invoker, run_id, _) = setup(vec![
            MockDecision::dispatch("analysis", "dig into the logs"),
            MockDecision::finish("summary"),
        ]);
        let options = RunOptions::default();
        let cancel = CancellationToken::new();
        let sink = RecordingSink::new("logs show a timeout");

        let text = invoker
            .run_loop(call(&run_id, &options, &cancel), &sink)
            .await
            .unwrap();
        assert_eq!(text, "summary");
        assert_eq!(sink.calls(), vec![("analysis".to_string(), "dig into the logs".to_string())]);

        // The second request carries the dispatch result.
        let requests = provider.requests();
        assert_eq!(requests.len(), 2);
        let last = requests[1].messages.last().unwrap();
        assert!(last.content.contains("logs show a timeout"));
    }

    #[tokio::test]
    async fn unknown_target_continues_loop_with_correction() {
        let (provider, invoker, run_id, bus) = setup(vec![
            MockDecision::dispatch("marketing", "promote it"),
            MockDecision::finish("done without marketing"),
        ]);
        let options = RunOptions::default();
        let cancel = CancellationToken::new();
        let sink = RecordingSink::new("ignored");

        let text = invoker
            .run_loop(call(&run_id, &options, &cancel), &sink)
            .await
            .unwrap();
        assert_eq!(text, "done without marketing");
        assert!(sink.calls().is_empty());

        // Corrective message names the valid set.
        let last = provider.requests()[1].messages.last().unwrap().clone();
        assert!(last.content.contains("marketing"));
        assert!(last.content.contains("analysis"));

        // An error event was published.
        bus.close_run(&run_id);
        let events: Vec<_> = tokio_stream::StreamExt::collect::<Vec<_>>(bus.subscribe(&run_id, 0)).await;
        assert!(events.iter().any(|e| {
            e.action == EventAction::Error && e.data["error"] == "unknown_dispatch_target"
        }));
    }

    #[tokio::test]
    async fn iteration_cap_exceeded_after_repeated_dispatches() {
        let responses = (0..5)
            .map(|i| MockDecision::dispatch("analysis", &format!("task {i}")))
            .collect();
        let (_, invoker, run_id, _) = setup(responses);
        let options = RunOptions { max_iterations: 3, ..Default::default() };
        let cancel = CancellationToken::new();
        let sink = RecordingSink::new("partial");

        let err = invoker
            .run_loop(call(&run_id, &options, &cancel), &sink)
            .await
            .unwrap_err();
        assert!(matches!(err, InvokeError::IterationCapExceeded { cap: 3 }));
        assert_eq!(sink.calls().len(), 3);
    }

    #[tokio::test]
    async fn cancelled_token_stops_the_loop() {
        let (_, invoker, run_id, _) = setup(vec![MockDecision::finish("never reached")]);
        let options = RunOptions::default();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let sink = RecordingSink::new("ignored");

        let err = invoker
            .run_loop(call(&run_id, &options, &cancel), &sink)
            .await
            .unwrap_err();
        assert!(matches!(err, InvokeError::Cancelled));
    }

    #[tokio::test]
    async fn transient_error_does_not_consume_iterations_by_default() {
        let (_, invoker, run_id, _) = setup(vec![
            MockDecision::Error(InvokeError::UpstreamUnavailable { detail: "blip".into() }),
            MockDecision::dispatch("analysis", "go"),
            MockDecision::finish("done"),
        ]);
        let options = RunOptions { max_iterations: 1, ..Default::default() };
        let cancel = CancellationToken::new();
        let sink = RecordingSink::new("result");

        let text = invoker
            .run_loop(call(&run_id, &options, &cancel), &sink)
            .await
            .unwrap();
        assert_eq!(text, "done");
    }

    #[tokio::test]
    async fn retry_counts_toward_cap_when_enabled() {
        let (_, invoker, run_id, _) = setup(vec![
            MockDecision::Error(InvokeError::UpstreamUnavailable { detail: "blip".into() }),
            MockDecision::dispatch("analysis", "go"),
        ]);
        let options = RunOptions {
            max_iterations: 1,
            retry_counts_toward_cap: true,
            ..Default::default()
        };
        let cancel = CancellationToken::new();
        let sink = RecordingSink::new("result");

        let err = invoker
            .run_loop(call(&run_id, &options, &cancel), &sink)
            .await
            .unwrap_err();
        assert!(matches!(err, InvokeError::IterationCapExceeded { cap: 1 }));
        assert!(sink.calls().is_empty());
    }

    #[tokio::test]
    async fn fatal_error_ends_the_loop() {
        let (_, invoker, run_id, _) = setup(vec![MockDecision::Error(
            InvokeError::UpstreamRejected { status: 401, detail: "bad key".into() },
        )]);
        let options = RunOptions::default();
        let cancel = CancellationToken::new();
        let sink = RecordingSink::new("ignored");

        let err = invoker
            .run_loop(call(&run_id, &options, &cancel), &sink)
            .await
            .unwrap_err();
        assert!(matches!(err, InvokeError::UpstreamRejected { status: 401, .. }));
    }

    #[tokio::test]
    async fn complete_returns_plain_text() {
        let (_, invoker, run_id, _) = setup(vec![MockDecision::finish("worker output")]);
        let cancel = CancellationToken::new();

        let text = invoker
            .complete(
                &run_id,
                EventSource::worker(AgentId::new(), "analysis", "reader"),
                "you read things",
                "read chapter 1",
                ModelParams::default(),
                &cancel,
            )
            .await
            .unwrap();
        assert_eq!(text, "worker output");
    }

    #[tokio::test]
    async fn complete_rejects_tool_calls() {
        let (_, invoker, run_id, _) = setup(vec![MockDecision::dispatch("anything", "x")]);
        let cancel = CancellationToken::new();

        let err = invoker
            .complete(
                &run_id,
                EventSource::worker(AgentId::new(), "analysis", "reader"),
                "you read things",
                "read chapter 1",
                ModelParams::default(),
                &cancel,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, InvokeError::UnknownDispatchTarget { .. }));
    }
}
