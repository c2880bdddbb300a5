use crate::{events::EventEmitter, HandlerError, OwnerId, TaskId, TaskType, Value, WorkflowId};
use async_trait::async_trait;
use std::collections::HashMap;
use tokio_util::sync::CancellationToken;

/// Contract every task handler implements
#[async_trait]
pub trait TaskHandler: Send + Sync {
    /// Task type this handler serves
    fn task_type(&self) -> TaskType;

    /// Perform the task. An `Err` marks the attempt as failed.
    ///
    /// Long-running handlers should watch `ctx.cancellation` and return
    /// `HandlerError::Cancelled` once it fires.
    async fn invoke(&self, ctx: HandlerContext) -> Result<Value, HandlerError>;

    fn description(&self) -> &str {
        ""
    }
}

/// Execution context passed to each handler invocation
#[derive(Clone)]
pub struct HandlerContext {
    pub workflow_id: WorkflowId,
    pub task_id: TaskId,
    pub owner: OwnerId,

    /// Task parameters, opaque to the engine
    pub parameters: HashMap<String, Value>,

    /// Event emitter for real-time updates
    pub events: EventEmitter,

    /// Fires when the task is cancelled
    pub cancellation: CancellationToken,
}

impl HandlerContext {
    /// Get required parameter or return error
    pub fn require_param(&self, name: &str) -> Result<&Value, HandlerError> {
        self.parameters
            .get(name)
            .ok_or_else(|| HandlerError::MissingParameter(name.to_string()))
    }

    /// Get a required string parameter
    pub fn require_str(&self, name: &str) -> Result<&str, HandlerError> {
        self.require_param(name)?
            .as_str()
            .ok_or_else(|| HandlerError::InvalidParameter {
                field: name.to_string(),
                expected: "string".to_string(),
            })
    }

    /// Get parameter with default
    pub fn get_param_or(&self, name: &str, default: Value) -> Value {
        self.parameters.get(name).cloned().unwrap_or(default)
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }
}
