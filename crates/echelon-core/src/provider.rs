use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::errors::InvokeError;
use crate::hierarchy::ModelParams;

/// A dispatchable target offered to a supervisor, presented to the
/// upstream model as a callable tool.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TargetInfo {
    pub name: String,
    pub description: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self { role: Role::System, content: content.into() }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self { role: Role::User, content: content.into() }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self { role: Role::Assistant, content: content.into() }
    }
}

/// One upstream generation request. `targets` is empty for plain
/// completions (worker calls, synthesis).
#[derive(Clone, Debug)]
pub struct DecisionRequest {
    pub messages: Vec<ChatMessage>,
    pub targets: Vec<TargetInfo>,
    pub params: ModelParams,
}

impl DecisionRequest {
    pub fn completion(messages: Vec<ChatMessage>, params: ModelParams) -> Self {
        Self { messages, targets: Vec::new(), params }
    }
}

/// The upstream model's answer: either dispatch one target with a task,
/// or finish with final text.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Decision {
    Dispatch { target: String, task: String },
    Finish { text: String },
}

/// Boundary to the upstream model. Implementations map transport and
/// protocol failures onto `InvokeError`.
#[async_trait]
pub trait DecisionProvider: Send + Sync {
    fn name(&self) -> &str;
    fn model(&self) -> &str;

    async fn decide(&self, request: &DecisionRequest) -> Result<Decision, InvokeError>;
}
