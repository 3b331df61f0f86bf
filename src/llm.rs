//! Model Client
//!
//! OpenAI-compatible chat completions with tool calling. The agent loop
//! only sees the `ModelClient` trait: one opaque call mapping a message
//! sequence plus a tool catalog to either final text or a batch of
//! requested tool invocations. Transient failures are retried with
//! increasing backoff before the turn gives up.

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

/// Attempts per model call before surfacing a terminal error
const MAX_ATTEMPTS: u32 = 3;
/// Base backoff between attempts, multiplied by the attempt number
const BACKOFF_BASE: Duration = Duration::from_millis(500);

/// One message on the completion wire
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
}

impl ChatMessage {
    pub fn system(content: &str) -> Self {
        Self {
            role: "system".to_string(),
            content: Some(content.to_string()),
            tool_call_id: None,
            tool_calls: None,
        }
    }

    pub fn user(content: &str) -> Self {
        Self {
            role: "user".to_string(),
            content: Some(content.to_string()),
            tool_call_id: None,
            tool_calls: None,
        }
    }

    pub fn assistant(content: &str) -> Self {
        Self {
            role: "assistant".to_string(),
            content: Some(content.to_string()),
            tool_call_id: None,
            tool_calls: None,
        }
    }

    /// Assistant message that requests tool calls. Empty text is omitted
    /// entirely - some providers reject null, others reject "".
    pub fn assistant_tool_calls(content: Option<String>, calls: Vec<ToolCall>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.filter(|c| !c.is_empty()),
            tool_call_id: None,
            tool_calls: Some(calls),
        }
    }

    pub fn tool_result(tool_call_id: &str, content: &str) -> Self {
        Self {
            role: "tool".to_string(),
            content: Some(content.to_string()),
            tool_call_id: Some(tool_call_id.to_string()),
            tool_calls: None,
        }
    }
}

/// A requested tool invocation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    #[serde(rename = "type", default = "function_type")]
    pub call_type: String,
    pub function: FunctionCall,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionCall {
    pub name: String,
    /// JSON-encoded argument object, exactly as the provider sends it
    pub arguments: String,
}

fn function_type() -> String {
    "function".to_string()
}

/// One catalog entry as exposed to the model
#[derive(Debug, Clone, Serialize)]
pub struct ToolSchema {
    #[serde(rename = "type")]
    pub kind: String,
    pub function: FunctionSchema,
}

#[derive(Debug, Clone, Serialize)]
pub struct FunctionSchema {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

impl ToolSchema {
    pub fn function(name: &str, description: &str, parameters: serde_json::Value) -> Self {
        Self {
            kind: "function".to_string(),
            function: FunctionSchema {
                name: name.to_string(),
                description: description.to_string(),
                parameters,
            },
        }
    }
}

/// The model's branching decision for one call
#[derive(Debug, Clone)]
pub enum ModelReply {
    /// Final text reply - the turn is done
    Final(String),
    /// One or more requested tool calls, optionally with interim text
    ToolCalls {
        content: Option<String>,
        calls: Vec<ToolCall>,
    },
}

/// Opaque model invocation. Implementations must be idempotent-safe to
/// retry; tests substitute a scripted fake.
#[async_trait]
pub trait ModelClient: Send + Sync {
    async fn chat(&self, messages: &[ChatMessage], tools: &[ToolSchema]) -> Result<ModelReply>;
}

/// OpenAI-compatible HTTP client (works against Anthropic's compatibility
/// endpoint, Ollama, LM Studio, and friends)
pub struct OpenAiCompatClient {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
}

impl OpenAiCompatClient {
    pub fn new(base_url: &str, api_key: &str, model: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            model: model.to_string(),
        }
    }

    pub fn from_config(config: &crate::config::Config) -> Self {
        Self::new(&config.base_url(), &config.api_key(), &config.llm_model)
    }

    pub fn model_name(&self) -> &str {
        &self.model
    }

    async fn attempt(&self, body: &serde_json::Value) -> Result<ModelReply> {
        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(body)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            anyhow::bail!("model API error {status}: {text}");
        }

        let parsed: CompletionResponse = response.json().await?;
        let message = parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.message)
            .ok_or_else(|| anyhow::anyhow!("model returned no choices"))?;

        match message.tool_calls {
            Some(calls) if !calls.is_empty() => Ok(ModelReply::ToolCalls {
                content: message.content,
                calls,
            }),
            _ => Ok(ModelReply::Final(message.content.unwrap_or_default())),
        }
    }
}

#[async_trait]
impl ModelClient for OpenAiCompatClient {
    async fn chat(&self, messages: &[ChatMessage], tools: &[ToolSchema]) -> Result<ModelReply> {
        let mut body = serde_json::json!({
            "model": self.model,
            "messages": messages,
        });
        if !tools.is_empty() {
            body["tools"] = serde_json::to_value(tools)?;
        }

        let mut last_error = None;
        for attempt in 1..=MAX_ATTEMPTS {
            if attempt > 1 {
                tokio::time::sleep(BACKOFF_BASE * (attempt - 1)).await;
            }
            match self.attempt(&body).await {
                Ok(reply) => {
                    debug!("Model call succeeded on attempt {}", attempt);
                    return Ok(reply);
                }
                Err(e) => {
                    warn!("Model call attempt {}/{} failed: {}", attempt, MAX_ATTEMPTS, e);
                    last_error = Some(e);
                }
            }
        }
        Err(last_error.unwrap_or_else(|| anyhow::anyhow!("model call failed")))
    }
}

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<ToolCall>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_assistant_tool_calls_omits_empty_content() {
        let msg = ChatMessage::assistant_tool_calls(
            Some(String::new()),
            vec![ToolCall {
                id: "c1".to_string(),
                call_type: "function".to_string(),
                function: FunctionCall {
                    name: "double".to_string(),
                    arguments: "{\"n\":21}".to_string(),
                },
            }],
        );
        let wire = serde_json::to_value(&msg).unwrap();
        assert!(wire.get("content").is_none());
        assert_eq!(wire["tool_calls"][0]["function"]["name"], "double");
    }

    #[test]
    fn test_tool_schema_wire_shape() {
        let schema = ToolSchema::function(
            "execute_sql",
            "Run SQL",
            serde_json::json!({"type": "object"}),
        );
        let wire = serde_json::to_value(&schema).unwrap();
        assert_eq!(wire["type"], "function");
        assert_eq!(wire["function"]["name"], "execute_sql");
        assert_eq!(wire["function"]["parameters"]["type"], "object");
    }

    #[test]
    fn test_parse_tool_call_response() {
        let raw = r#"{
            "choices": [{
                "message": {
                    "content": null,
                    "tool_calls": [{
                        "id": "call_1",
                        "function": {"name": "double", "arguments": "{\"n\": 21}"}
                    }]
                }
            }]
        }"#;
        let parsed: CompletionResponse = serde_json::from_str(raw).unwrap();
        let message = &parsed.choices[0].message;
        let calls = message.tool_calls.as_ref().unwrap();
        assert_eq!(calls[0].id, "call_1");
        assert_eq!(calls[0].call_type, "function");
        assert_eq!(calls[0].function.name, "double");
    }

    #[test]
    fn test_parse_final_text_response() {
        let raw = r#"{"choices": [{"message": {"content": "done"}}]}"#;
        let parsed: CompletionResponse = serde_json::from_str(raw).unwrap();
        assert_eq!(parsed.choices[0].message.content.as_deref(), Some("done"));
        assert!(parsed.choices[0].message.tool_calls.is_none());
    }
}
