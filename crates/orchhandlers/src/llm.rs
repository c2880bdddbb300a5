use crate::flow::Flow;
use async_trait::async_trait;
use orchcore::{HandlerContext, HandlerError, TaskHandler, TaskType, Value};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Connection and sampling settings for the chat-completion endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    pub model_url: Option<String>,
    pub api_key: Option<String>,
    pub model: String,
    pub temperature: f64,
    pub top_p: f64,
    pub frequency_penalty: f64,
    pub presence_penalty: f64,
    pub max_tokens: u32,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            model_url: None,
            api_key: None,
            model: "gpt4o".to_string(),
            temperature: 0.7,
            top_p: 0.9,
            frequency_penalty: 1.0,
            presence_penalty: 0.5,
            max_tokens: 3000,
        }
    }
}

impl LlmConfig {
    /// Defaults with `MODEL_URL` and `API_KEY` taken from the environment
    pub fn from_env() -> Self {
        Self {
            model_url: std::env::var("MODEL_URL").ok(),
            api_key: std::env::var("API_KEY").ok(),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self::with_role("system", content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::with_role("user", content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::with_role("assistant", content)
    }

    fn with_role(role: &str, content: impl Into<String>) -> Self {
        Self {
            role: role.to_string(),
            content: content.into(),
        }
    }
}

/// IA_MODULE handler backed by an OpenAI-style chat-completion endpoint.
///
/// Parameters:
/// - `message` (required): the user message
/// - `system_prompt`: optional system prompt for a single completion
/// - `steps`: list of flow steps; when present the message runs through the
///   whole flow and the result is `{flow_name, steps, final_response}`
/// - `flow_name`: label for the flow result, defaults to `"flow"`
pub struct ChatCompletionHandler {
    client: reqwest::Client,
    config: LlmConfig,
}

impl ChatCompletionHandler {
    pub fn new(config: LlmConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
        }
    }

    pub fn config(&self) -> &LlmConfig {
        &self.config
    }

    /// Send one chat-completion request and return the assistant message
    pub async fn complete(&self, messages: &[ChatMessage]) -> Result<String, HandlerError> {
        let url = self
            .config
            .model_url
            .as_deref()
            .ok_or_else(|| HandlerError::Configuration("model URL is not set".to_string()))?;

        let payload = serde_json::json!({
            "messages": messages,
            "temperature": self.config.temperature,
            "top_p": self.config.top_p,
            "frequency_penalty": self.config.frequency_penalty,
            "presence_penalty": self.config.presence_penalty,
            "max_tokens": self.config.max_tokens,
            "model": self.config.model,
            "stream": false,
        });

        let mut request = self.client.post(url).json(&payload);
        if let Some(api_key) = &self.config.api_key {
            request = request.header("api-key", api_key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| HandlerError::ExecutionFailed(format!("Model request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(HandlerError::ExecutionFailed(format!(
                "Model call returned {}: {}",
                status.as_u16(),
                body
            )));
        }

        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| HandlerError::ExecutionFailed(format!("Invalid model response: {}", e)))?;

        Ok(body["choices"][0]["message"]["content"]
            .as_str()
            .unwrap_or_default()
            .to_string())
    }

    /// Run the user message through every step of `flow`.
    ///
    /// Each step sees its own system prompt followed by the conversation so
    /// far, and its answer is appended to that conversation.
    pub async fn run_flow(
        &self,
        flow: &Flow,
        user_message: &str,
        ctx: &HandlerContext,
    ) -> Result<Value, HandlerError> {
        flow.validate()?;

        let steps = flow.ordered_steps();
        let total = steps.len();
        let mut conversation = vec![ChatMessage::user(user_message)];
        let mut answers = BTreeMap::new();

        for (index, step) in steps.into_iter().enumerate() {
            let mut messages = Vec::with_capacity(conversation.len() + 1);
            messages.push(ChatMessage::system(step.system_prompt.as_str()));
            messages.extend(conversation.iter().cloned());

            let answer = self.complete(&messages).await?;
            ctx.events.progress(
                (index + 1) as f64 * 100.0 / total as f64,
                Some(format!("Step '{}' answered", step.step_name)),
            );

            answers.insert(step.step_name.clone(), Value::from(answer.as_str()));
            conversation.push(ChatMessage::assistant(answer));
        }

        let final_response = conversation
            .last()
            .map(|m| Value::from(m.content.as_str()))
            .unwrap_or_default();

        let mut result = BTreeMap::new();
        result.insert("flow_name".to_string(), Value::from(flow.name.as_str()));
        result.insert("steps".to_string(), Value::Object(answers));
        result.insert("final_response".to_string(), final_response);
        Ok(Value::Object(result))
    }

    async fn respond(&self, ctx: &HandlerContext) -> Result<Value, HandlerError> {
        let message = ctx.require_str("message")?;

        if let Some(steps) = ctx.parameters.get("steps") {
            let name = ctx.get_param_or("flow_name", Value::from("flow"));
            let flow = Flow::from_value(name.to_text(), steps)?;
            ctx.events.info(format!("Running flow '{}' with {} steps", flow.name, flow.steps.len()));
            return self.run_flow(&flow, message, ctx).await;
        }

        let mut messages = Vec::with_capacity(2);
        if let Some(system_prompt) = ctx.parameters.get("system_prompt").and_then(Value::as_str) {
            messages.push(ChatMessage::system(system_prompt));
        }
        messages.push(ChatMessage::user(message));

        let answer = self.complete(&messages).await?;
        Ok(Value::from(answer))
    }
}

#[async_trait]
impl TaskHandler for ChatCompletionHandler {
    fn task_type(&self) -> TaskType {
        TaskType::IaModule
    }

    async fn invoke(&self, ctx: HandlerContext) -> Result<Value, HandlerError> {
        tokio::select! {
            _ = ctx.cancellation.cancelled() => Err(HandlerError::Cancelled),
            result = self.respond(&ctx) => result,
        }
    }

    fn description(&self) -> &str {
        "Chat completion against the configured model, optionally through a multi-step flow"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_sampling_settings() {
        let config = LlmConfig::default();
        assert_eq!(config.model, "gpt4o");
        assert_eq!(config.max_tokens, 3000);
        assert_eq!(config.temperature, 0.7);
        assert!(config.model_url.is_none());
    }

    #[test]
    fn test_chat_message_roles() {
        let json = serde_json::to_value(ChatMessage::system("be brief")).unwrap();
        assert_eq!(json, serde_json::json!({"role": "system", "content": "be brief"}));
        assert_eq!(ChatMessage::assistant("ok").role, "assistant");
    }
}
