use orchcore::{HandlerError, Value};
use serde::{Deserialize, Serialize};

/// One prompt in a multi-step chat flow
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowStep {
    pub system_prompt: String,
    pub step_name: String,
    pub step_order: u32,
}

impl FlowStep {
    pub fn new(step_name: impl Into<String>, step_order: u32, system_prompt: impl Into<String>) -> Self {
        Self {
            system_prompt: system_prompt.into(),
            step_name: step_name.into(),
            step_order,
        }
    }
}

/// Ordered chain of system prompts applied to one conversation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Flow {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub steps: Vec<FlowStep>,
}

impl Flow {
    pub fn new(name: impl Into<String>, steps: Vec<FlowStep>) -> Self {
        Self {
            name: name.into(),
            description: None,
            steps,
        }
    }

    /// Build a flow from a task's `steps` parameter
    pub fn from_value(name: impl Into<String>, steps: &Value) -> Result<Self, HandlerError> {
        let steps: Vec<FlowStep> = serde_json::from_value(serde_json::Value::from(steps.clone()))
            .map_err(|e| HandlerError::InvalidParameter {
                field: "steps".to_string(),
                expected: format!("list of flow steps ({})", e),
            })?;
        Ok(Self::new(name, steps))
    }

    /// Check names and step ordering.
    ///
    /// Names may only hold ASCII letters, digits, whitespace, `_` and `-`.
    /// Step orders must be unique and run from 1 without gaps.
    pub fn validate(&self) -> Result<(), HandlerError> {
        if !is_valid_name(&self.name) {
            return Err(invalid("name", "non-empty name of letters, digits, spaces, '_' or '-'"));
        }
        if self.steps.is_empty() {
            return Err(invalid("steps", "at least one step"));
        }

        for step in &self.steps {
            if step.system_prompt.is_empty() {
                return Err(invalid("system_prompt", "non-empty prompt"));
            }
            if !is_valid_name(&step.step_name) {
                return Err(invalid(
                    "step_name",
                    "non-empty name of letters, digits, spaces, '_' or '-'",
                ));
            }
        }

        let mut orders: Vec<u32> = self.steps.iter().map(|s| s.step_order).collect();
        orders.sort_unstable();
        if orders.windows(2).any(|w| w[0] == w[1]) {
            return Err(invalid("step_order", "unique step orders"));
        }
        if orders.iter().zip(1u32..).any(|(order, expected)| *order != expected) {
            return Err(invalid("step_order", "sequential step orders starting at 1"));
        }
        Ok(())
    }

    /// Steps sorted by `step_order`
    pub fn ordered_steps(&self) -> Vec<&FlowStep> {
        let mut steps: Vec<&FlowStep> = self.steps.iter().collect();
        steps.sort_by_key(|s| s.step_order);
        steps
    }
}

fn is_valid_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c.is_whitespace() || c == '_' || c == '-')
}

fn invalid(field: &str, expected: &str) -> HandlerError {
    HandlerError::InvalidParameter {
        field: field.to_string(),
        expected: expected.to_string(),
    }
}
