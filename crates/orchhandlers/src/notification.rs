use async_trait::async_trait;
use orchcore::{HandlerContext, HandlerError, TaskHandler, TaskType, Value};
use std::collections::BTreeMap;

/// NOTIFICATION handler.
///
/// Logs `message` and forwards it to the task's event stream. With a
/// `webhook_url` parameter the message is also POSTed as
/// `{message, task_id, workflow_id}`. `level` may be `info` (default) or
/// `warning`.
pub struct NotificationHandler {
    client: reqwest::Client,
}

impl NotificationHandler {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }

    async fn deliver(&self, url: &str, message: &str, ctx: &HandlerContext) -> Result<u16, HandlerError> {
        let payload = serde_json::json!({
            "message": message,
            "task_id": ctx.task_id,
            "workflow_id": ctx.workflow_id,
        });

        let response = self
            .client
            .post(url)
            .json(&payload)
            .send()
            .await
            .map_err(|e| HandlerError::ExecutionFailed(format!("Webhook request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(HandlerError::ExecutionFailed(format!(
                "Webhook returned {}",
                status.as_u16()
            )));
        }
        Ok(status.as_u16())
    }

    async fn notify(&self, ctx: &HandlerContext) -> Result<Value, HandlerError> {
        let message = ctx.require_str("message")?;
        let level = ctx.get_param_or("level", Value::from("info"));

        match level.as_str() {
            Some("warning") => {
                tracing::warn!(workflow_id = %ctx.workflow_id, task_id = %ctx.task_id, "{}", message);
                ctx.events.warn(message);
            }
            _ => {
                tracing::info!(workflow_id = %ctx.workflow_id, task_id = %ctx.task_id, "{}", message);
                ctx.events.info(message);
            }
        }

        let mut output = BTreeMap::new();
        output.insert("message".to_string(), Value::from(message));

        match ctx.parameters.get("webhook_url").and_then(Value::as_str) {
            Some(url) => {
                let status = self.deliver(url, message, ctx).await?;
                output.insert("delivered".to_string(), Value::from(true));
                output.insert("status".to_string(), Value::from(status as i64));
            }
            None => {
                output.insert("delivered".to_string(), Value::from(false));
            }
        }
        Ok(Value::Object(output))
    }
}

impl Default for NotificationHandler {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TaskHandler for NotificationHandler {
    fn task_type(&self) -> TaskType {
        TaskType::Notification
    }

    async fn invoke(&self, ctx: HandlerContext) -> Result<Value, HandlerError> {
        tokio::select! {
            _ = ctx.cancellation.cancelled() => Err(HandlerError::Cancelled),
            result = self.notify(&ctx) => result,
        }
    }

    fn description(&self) -> &str {
        "Logs a message and optionally posts it to a webhook"
    }
}
