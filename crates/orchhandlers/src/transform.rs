use async_trait::async_trait;
use orchcore::{HandlerContext, HandlerError, TaskHandler, TaskType, Value};

/// DATA_PROCESSING handler.
///
/// The `operation` parameter picks the transformation:
/// - `json_parse`: parse the `input` string as JSON
/// - `json_stringify`: serialize `input` to a JSON string (`pretty` for indentation)
/// - `template`: replace `{{key}}` in `template` with entries of `values`
/// - `passthrough` (default): return `input` unchanged
pub struct DataProcessingHandler;

impl DataProcessingHandler {
    fn json_parse(ctx: &HandlerContext) -> Result<Value, HandlerError> {
        let input = ctx.require_str("input")?;
        let parsed: serde_json::Value = serde_json::from_str(input)
            .map_err(|e| HandlerError::ExecutionFailed(format!("JSON parse error: {}", e)))?;
        Ok(Value::from(parsed))
    }

    fn json_stringify(ctx: &HandlerContext) -> Result<Value, HandlerError> {
        let value = serde_json::Value::from(ctx.require_param("input")?.clone());
        let pretty = ctx
            .parameters
            .get("pretty")
            .and_then(Value::as_bool)
            .unwrap_or(false);

        let text = if pretty {
            serde_json::to_string_pretty(&value)
        } else {
            serde_json::to_string(&value)
        }
        .map_err(|e| HandlerError::ExecutionFailed(format!("JSON stringify error: {}", e)))?;
        Ok(Value::from(text))
    }

    fn template(ctx: &HandlerContext) -> Result<Value, HandlerError> {
        let template = ctx.require_str("template")?;
        let values = ctx.get_param_or("values", Value::Null);
        let (rendered, missing) = render_template(template, &values);

        for key in missing {
            ctx.events.warn(format!("No value for placeholder '{}'", key));
        }
        Ok(Value::from(rendered))
    }
}

/// Substitute `{{key}}` placeholders. Unknown keys are left in place and
/// returned alongside the rendered text.
fn render_template(template: &str, values: &Value) -> (String, Vec<String>) {
    let mut output = String::with_capacity(template.len());
    let mut missing = Vec::new();
    let mut rest = template;

    while let Some(start) = rest.find("{{") {
        let Some(len) = rest[start + 2..].find("}}") else {
            break;
        };
        output.push_str(&rest[..start]);

        let placeholder = &rest[start..start + len + 4];
        let key = rest[start + 2..start + 2 + len].trim();
        match values.get(key) {
            Some(value) => output.push_str(&value.to_text()),
            None => {
                output.push_str(placeholder);
                missing.push(key.to_string());
            }
        }
        rest = &rest[start + len + 4..];
    }
    output.push_str(rest);

    (output, missing)
}

#[async_trait]
impl TaskHandler for DataProcessingHandler {
    fn task_type(&self) -> TaskType {
        TaskType::DataProcessing
    }

    async fn invoke(&self, ctx: HandlerContext) -> Result<Value, HandlerError> {
        let operation = ctx.get_param_or("operation", Value::from("passthrough"));
        let operation = operation.as_str().ok_or_else(|| HandlerError::InvalidParameter {
            field: "operation".to_string(),
            expected: "string".to_string(),
        })?;
        tracing::debug!(task_id = %ctx.task_id, operation, "Processing data");

        match operation {
            "json_parse" => Self::json_parse(&ctx),
            "json_stringify" => Self::json_stringify(&ctx),
            "template" => Self::template(&ctx),
            "passthrough" => Ok(ctx.get_param_or("input", Value::Null)),
            other => Err(HandlerError::Configuration(format!(
                "Unsupported operation: {}",
                other
            ))),
        }
    }

    fn description(&self) -> &str {
        "JSON parsing, serialization, templating and passthrough"
    }
}
