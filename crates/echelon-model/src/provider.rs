use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::json;
use tracing::instrument;

use echelon_core::errors::InvokeError;
use echelon_core::provider::{Decision, DecisionProvider, DecisionRequest, Role};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Configuration for the HTTP decision provider.
#[derive(Clone, Debug)]
pub struct HttpProviderConfig {
    /// Chat-completions endpoint URL.
    pub api_url: String,
    pub api_key: SecretString,
    pub model: String,
}

/// Decision provider over an OpenAI-compatible chat-completions API.
/// Dispatch targets are offered as function tools; a tool call in the
/// response becomes a dispatch decision, plain text a finish.
pub struct HttpProvider {
    client: Client,
    config: HttpProviderConfig,
}

impl HttpProvider {
    pub fn new(config: HttpProviderConfig) -> Result<Self, InvokeError> {
        let client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| InvokeError::UpstreamUnavailable {
                detail: format!("failed to build HTTP client: {e}"),
            })?;
        Ok(Self { client, config })
    }

    fn build_body(&self, request: &DecisionRequest) -> serde_json::Value {
        let messages: Vec<serde_json::Value> = request
            .messages
            .iter()
            .map(|m| {
                json!({
                    "role": match m.role {
                        Role::System => "system",
                        Role::User => "user",
                        Role::Assistant => "assistant",
                    },
                    "content": m.content,
                })
            })
            .collect();

        let mut body = json!({
            "model": self.config.model,
            "messages": messages,
            "temperature": request.params.temperature,
            "max_tokens": request.params.max_tokens,
        });

        if !request.targets.is_empty() {
            let tools: Vec<serde_json::Value> = request
                .targets
                .iter()
                .map(|t| {
                    json!({
                        "type": "function",
                        "function": {
                            "name": t.name,
                            "description": t.description,
                            "parameters": {
                                "type": "object",
                                "properties": {
                                    "task": {
                                        "type": "string",
                                        "description": "The task to hand to this target"
                                    }
                                },
                                "required": ["task"]
                            }
                        }
                    })
                })
                .collect();
            body["tools"] = json!(tools);
            body["tool_choice"] = json!("auto");
        }

        body
    }
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<ToolCall>,
}

#[derive(Deserialize)]
struct ToolCall {
    function: FunctionCall,
}

#[derive(Deserialize)]
struct FunctionCall {
    name: String,
    arguments: String,
}

fn map_transport_error(e: reqwest::Error) -> InvokeError {
    if e.is_timeout() {
        InvokeError::Timeout(CONNECT_TIMEOUT)
    } else {
        InvokeError::UpstreamUnavailable {
            detail: e.to_string(),
        }
    }
}

fn parse_decision(response: ChatResponse) -> Result<Decision, InvokeError> {
    let message = response
        .choices
        .into_iter()
        .next()
        .map(|c| c.message)
        .ok_or_else(|| InvokeError::UpstreamUnavailable {
            detail: "response contained no choices".into(),
        })?;

    if let Some(call) = message.tool_calls.into_iter().next() {
        let task = serde_json::from_str::<serde_json::Value>(&call.function.arguments)
            .ok()
            .and_then(|args| args.get("task").and_then(|t| t.as_str()).map(String::from))
            .unwrap_or_default();
        return Ok(Decision::Dispatch {
            target: call.function.name,
            task,
        });
    }

    Ok(Decision::Finish {
        text: message.content.unwrap_or_default(),
    })
}

#[async_trait]
impl DecisionProvider for HttpProvider {
    fn name(&self) -> &str {
        "http"
    }

    fn model(&self) -> &str {
        &self.config.model
    }

    #[instrument(skip(self, request), fields(model = %self.config.model, targets = request.targets.len()))]
    async fn decide(&self, request: &DecisionRequest) -> Result<Decision, InvokeError> {
        let body = self.build_body(request);

        let response = self
            .client
            .post(&self.config.api_url)
            .bearer_auth(self.config.api_key.expose_secret())
            .json(&body)
            .send()
            .await
            .map_err(map_transport_error)?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(InvokeError::from_status(status.as_u16(), detail));
        }

        let parsed: ChatResponse =
            response
                .json()
                .await
                .map_err(|e| InvokeError::UpstreamUnavailable {
                    detail: format!("malformed response body: {e}"),
                })?;

        parse_decision(parsed)
    }
}
