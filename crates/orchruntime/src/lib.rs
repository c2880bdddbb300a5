//! Workflow orchestration runtime
//!
//! This crate provides the DAG store, the task executor that runs workflow
//! levels in parallel with retries and cancellation, the handler registry,
//! and the orchestration service that ties them together.

mod dag;
mod executor;
mod loader;
mod registry;
mod service;

pub use dag::{execution_levels, validate_tasks, DagStore, ExecutionLease};
pub use executor::{DependencyFailurePolicy, ExecutorConfig, TaskExecutor};
pub use loader::{load_workflow_file, save_workflow_file};
pub use registry::{FnHandler, HandlerRegistry};
pub use service::{OrchestrationService, RuntimeConfig};
