//! Core abstractions for the orchestration engine
//!
//! Task and workflow data model, the error taxonomy, the task handler
//! contract and the execution event bus. Everything else builds on these.

mod error;
pub mod events;
mod handler;
mod task;
mod value;

pub use error::{HandlerError, OrchestrationError};
pub use events::*;
pub use handler::{HandlerContext, TaskHandler};
pub use task::{
    ExecutionRecord, OwnerId, StatusCounts, Task, TaskId, TaskResult, TaskStatus, TaskType,
    Workflow, WorkflowDraft, WorkflowId, WorkflowStatus,
};
pub use value::Value;

/// Result type for orchestration operations
pub type Result<T> = std::result::Result<T, OrchestrationError>;
