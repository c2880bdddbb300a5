use crate::{TaskId, WorkflowId};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum OrchestrationError {
    #[error("Workflow not found: {0}")]
    UnknownWorkflow(WorkflowId),

    #[error("Task {task_id} not found in workflow {workflow_id}")]
    UnknownTask {
        workflow_id: WorkflowId,
        task_id: TaskId,
    },

    #[error("Workflow already registered: {0}")]
    DuplicateWorkflow(WorkflowId),

    #[error("Task id appears more than once: {0}")]
    DuplicateTask(TaskId),

    #[error("Invalid dependency graph: {0}")]
    CyclicGraph(String),

    #[error("Task {0} is not running")]
    NotRunning(TaskId),

    #[error("Workflow {0} is executing and cannot be modified")]
    WorkflowActive(WorkflowId),

    #[error("Handler failure: {0}")]
    HandlerFailure(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl OrchestrationError {
    /// Stable tag for the error kind, independent of the message
    pub fn kind(&self) -> &'static str {
        match self {
            OrchestrationError::UnknownWorkflow(_) => "unknown_workflow",
            OrchestrationError::UnknownTask { .. } => "unknown_task",
            OrchestrationError::DuplicateWorkflow(_) => "duplicate_workflow",
            OrchestrationError::DuplicateTask(_) => "duplicate_task",
            OrchestrationError::CyclicGraph(_) => "cyclic_graph",
            OrchestrationError::NotRunning(_) => "not_running",
            OrchestrationError::WorkflowActive(_) => "workflow_active",
            OrchestrationError::HandlerFailure(_) => "handler_failure",
            OrchestrationError::Io(_) => "io",
            OrchestrationError::Serialization(_) => "serialization",
        }
    }
}

/// Failure reported by a task handler
#[derive(Error, Debug, Clone, PartialEq)]
pub enum HandlerError {
    #[error("Missing required parameter: {0}")]
    MissingParameter(String),

    #[error("Invalid parameter '{field}': expected {expected}")]
    InvalidParameter { field: String, expected: String },

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("{0}")]
    ExecutionFailed(String),

    #[error("Timeout after {millis}ms")]
    Timeout { millis: u64 },

    #[error("Cancelled")]
    Cancelled,

    #[error("No handler registered for task type '{0}'")]
    NoHandler(String),
}
