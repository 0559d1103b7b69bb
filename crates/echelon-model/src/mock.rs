use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use echelon_core::errors::InvokeError;
use echelon_core::provider::{Decision, DecisionProvider, DecisionRequest};

/// Pre-programmed responses for deterministic testing without API calls.
pub enum MockDecision {
    /// Return a decision.
    Reply(Decision),
    /// Return an error from the decide() call itself.
    Error(InvokeError),
    /// Wait a duration, then yield the inner response.
    Delay(Duration, Box<MockDecision>),
}

impl MockDecision {
    /// Convenience: a dispatch decision.
    pub fn dispatch(target: &str, task: &str) -> Self {
        Self::Reply(Decision::Dispatch {
            target: target.into(),
            task: task.into(),
        })
    }

    /// Convenience: a finish decision.
    pub fn finish(text: &str) -> Self {
        Self::Reply(Decision::Finish { text: text.into() })
    }

    /// Convenience: wrap any response with a delay.
    pub fn delayed(delay: Duration, inner: MockDecision) -> Self {
        Self::Delay(delay, Box::new(inner))
    }
}

/// Mock provider that returns pre-programmed responses in sequence.
/// Records every request so tests can assert on prompt contents.
pub struct MockProvider {
    responses: Mutex<Vec<MockDecision>>,
    requests: Mutex<Vec<DecisionRequest>>,
    call_count: AtomicUsize,
}

impl MockProvider {
    pub fn new(responses: Vec<MockDecision>) -> Self {
        Self {
            responses: Mutex::new(responses),
            requests: Mutex::new(Vec::new()),
            call_count: AtomicUsize::new(0),
        }
    }

    pub fn call_count(&self) -> usize {
        self.call_count.load(Ordering::Relaxed)
    }

    /// Requests seen so far, in call order.
    pub fn requests(&self) -> Vec<DecisionRequest> {
        self.requests.lock().clone()
    }
}

#[async_trait]
impl DecisionProvider for MockProvider {
    fn name(&self) -> &str {
        "mock"
    }

    fn model(&self) -> &str {
        "mock-model"
    }

    async fn decide(&self, request: &DecisionRequest) -> Result<Decision, InvokeError> {
        let idx = self.call_count.fetch_add(1, Ordering::Relaxed);
        self.requests.lock().push(request.clone());

        // Take ownership of the scripted response; each index is used once.
        let response = {
            let mut responses = self.responses.lock();
            if idx >= responses.len() {
                return Err(InvokeError::UpstreamRejected {
                    status: 400,
                    detail: format!("MockProvider: no response configured for call {idx}"),
                });
            }
            std::mem::replace(
                &mut responses[idx],
                MockDecision::Error(InvokeError::Cancelled),
            )
        };

        resolve_response(response).await
    }
}

/// Resolve a MockDecision, handling Delay by sleeping first.
/// Unrolls nested delays iteratively to avoid recursive async.
async fn resolve_response(response: MockDecision) -> Result<Decision, InvokeError> {
    let mut current = response;
    loop {
        match current {
            MockDecision::Reply(decision) => return Ok(decision),
            MockDecision::Error(e) => return Err(e),
            MockDecision::Delay(duration, inner) => {
                tokio::time::sleep(duration).await;
                current = *inner;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use echelon_core::hierarchy::ModelParams;
    use echelon_core::provider::ChatMessage;

    fn request(text: &str) -> DecisionRequest {
        DecisionRequest::completion(vec![ChatMessage::user(text)], ModelParams::default())
    }

    #[tokio::test]
    async fn finish_response() {
        let mock = MockProvider::new(vec![MockDecision::finish("hello world")]);
        let decision = mock.decide(&request("hi")).await.unwrap();
        assert_eq!(decision, Decision::Finish { text: "hello world".into() });
    }

    #[tokio::test]
    async fn dispatch_response() {
        let mock = MockProvider::new(vec![MockDecision::dispatch("analysis", "go")]);
        let decision = mock.decide(&request("hi")).await.unwrap();
        assert_eq!(
            decision,
            Decision::Dispatch { target: "analysis".into(), task: "go".into() }
        );
    }

    #[tokio::test]
    async fn error_response() {
        let mock = MockProvider::new(vec![MockDecision::Error(
            InvokeError::UpstreamUnavailable { detail: "down".into() },
        )]);
        let result = mock.decide(&request("hi")).await;
        assert!(matches!(result, Err(InvokeError::UpstreamUnavailable { .. })));
    }

    #[tokio::test]
    async fn sequential_responses() {
        let mock = MockProvider::new(vec![
            MockDecision::finish("first"),
            MockDecision::finish("second"),
        ]);

        let first = mock.decide(&request("a")).await.unwrap();
        assert_eq!(first, Decision::Finish { text: "first".into() });
        assert_eq!(mock.call_count(), 1);

        let second = mock.decide(&request("b")).await.unwrap();
        assert_eq!(second, Decision::Finish { text: "second".into() });
        assert_eq!(mock.call_count(), 2);
    }

    #[tokio::test]
    async fn exhausted_responses() {
        let mock = MockProvider::new(vec![MockDecision::finish("only one")]);

        let _ = mock.decide(&request("a")).await;
        let result = mock.decide(&request("b")).await;
        assert!(matches!(result, Err(InvokeError::UpstreamRejected { .. })));
    }

    #[tokio::test]
    async fn records_requests() {
        let mock = MockProvider::new(vec![MockDecision::finish("ok")]);
        let _ = mock.decide(&request("remember me")).await;

        let seen = mock.requests();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].messages[0].content, "remember me");
    }

    #[tokio::test]
    async fn delayed_response() {
        let mock = MockProvider::new(vec![MockDecision::delayed(
            Duration::from_millis(50),
            MockDecision::finish("after delay"),
        )]);

        let start = std::time::Instant::now();
        let decision = mock.decide(&request("hi")).await.unwrap();
        let elapsed = start.elapsed();

        assert!(
            elapsed >= Duration::from_millis(40),
            "Delay should have waited ~50ms, got {:?}",
            elapsed
        );
        assert_eq!(decision, Decision::Finish { text: "after delay".into() });
    }

    #[test]
    fn provider_properties() {
        let mock = MockProvider::new(vec![]);
        assert_eq!(mock.name(), "mock");
        assert_eq!(mock.model(), "mock-model");
    }
}
