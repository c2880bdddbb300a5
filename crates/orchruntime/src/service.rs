use crate::dag::{validate_tasks, DagStore};
use crate::executor::{ExecutorConfig, TaskExecutor};
use crate::registry::HandlerRegistry;
use chrono::Utc;
use orchcore::{
    EventBus, ExecutionEvent, ExecutionRecord, OwnerId, Result, StatusCounts, Task, TaskId,
    TaskResult, TaskStatus, Workflow, WorkflowDraft, WorkflowId, WorkflowStatus,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use uuid::Uuid;

/// Workflow-level facade over the DAG store and the task executor
pub struct OrchestrationService {
    store: Arc<DagStore>,
    executor: Arc<TaskExecutor>,
    event_bus: Arc<EventBus>,
}

impl OrchestrationService {
    /// Create a service with default settings
    pub fn new(registry: HandlerRegistry) -> Self {
        Self::with_registry(Arc::new(registry), RuntimeConfig::default())
    }

    /// Create a service with a pre-configured registry
    pub fn with_registry(registry: Arc<HandlerRegistry>, config: RuntimeConfig) -> Self {
        let store = Arc::new(DagStore::new());
        let event_bus = Arc::new(EventBus::new(config.event_buffer_size));
        let executor = Arc::new(TaskExecutor::new(
            config.executor,
            store.clone(),
            registry,
            event_bus.clone(),
        ));

        Self {
            store,
            executor,
            event_bus,
        }
    }

    pub fn store(&self) -> &Arc<DagStore> {
        &self.store
    }

    pub fn executor(&self) -> &Arc<TaskExecutor> {
        &self.executor
    }

    pub fn subscribe_events(&self) -> tokio::sync::broadcast::Receiver<ExecutionEvent> {
        self.event_bus.subscribe()
    }

    /// Register a new DRAFT workflow owned by `owner`
    pub async fn create_workflow(
        &self,
        draft: WorkflowDraft,
        owner: impl Into<OwnerId>,
    ) -> Result<WorkflowId> {
        let workflow = Workflow::from_draft(Uuid::new_v4(), draft, owner);
        validate_tasks(&workflow.tasks)?;

        let id = workflow.id;
        let task_count = workflow.tasks.len();
        self.store.register(workflow).await?;
        tracing::info!(workflow_id = %id, tasks = task_count, "Created workflow");
        Ok(id)
    }

    pub async fn get_workflow(&self, workflow_id: WorkflowId) -> Result<Workflow> {
        self.store.get_workflow(workflow_id).await
    }

    pub async fn get_workflow_tasks(&self, workflow_id: WorkflowId) -> Result<Vec<Task>> {
        self.store.get_tasks(workflow_id).await
    }

    /// Replace the task list of a workflow that is not executing
    pub async fn update_workflow(&self, workflow_id: WorkflowId, tasks: Vec<Task>) -> Result<()> {
        validate_tasks(&tasks)?;
        self.store.replace_tasks(workflow_id, tasks).await?;
        tracing::info!(workflow_id = %workflow_id, "Updated workflow");
        Ok(())
    }

    pub async fn add_task(&self, workflow_id: WorkflowId, task: Task) -> Result<TaskId> {
        let id = task.id;
        self.store.add_task(workflow_id, task).await?;
        Ok(id)
    }

    pub async fn remove_task(&self, workflow_id: WorkflowId, task_id: TaskId) -> Result<()> {
        self.store.remove_task(workflow_id, task_id).await
    }

    /// Remove a workflow and release its execution state. Unknown ids are ignored.
    pub async fn delete_workflow(&self, workflow_id: WorkflowId) -> Result<()> {
        self.cleanup_workflow_execution(workflow_id).await?;
        if self.store.remove(workflow_id).await {
            tracing::info!(workflow_id = %workflow_id, "Deleted workflow");
        }
        Ok(())
    }

    pub async fn execution_order(&self, workflow_id: WorkflowId) -> Result<Vec<Vec<TaskId>>> {
        self.store.execution_order(workflow_id).await
    }

    /// Execute all tasks and return the per-task results.
    ///
    /// The workflow ends COMPLETED only if every task completed; any failed
    /// task, or an error escaping execution, leaves it FAILED.
    pub async fn execute_workflow(&self, workflow_id: WorkflowId) -> Result<HashMap<TaskId, TaskResult>> {
        // dropping this future releases the lease, which lets the store recover the run
        let (workflow, _lease) = self.store.begin_execution(workflow_id).await?;
        let start = Instant::now();

        tracing::info!("Starting workflow execution: {}", workflow_id);
        self.event_bus.emit(ExecutionEvent::WorkflowStarted {
            workflow_id,
            task_count: workflow.tasks.len(),
            timestamp: Utc::now(),
        });

        let outcome = self.executor.execute_workflow(workflow_id).await;

        let (status, error) = match &outcome {
            Ok(_) => match self.store.get_workflow(workflow_id).await {
                Ok(current) => {
                    let counts = current.status_counts();
                    if counts.completed == current.tasks.len() {
                        (WorkflowStatus::Completed, None)
                    } else {
                        let message = format!(
                            "{} of {} tasks did not complete",
                            current.tasks.len() - counts.completed,
                            current.tasks.len()
                        );
                        (WorkflowStatus::Failed, Some(message))
                    }
                }
                Err(e) => (WorkflowStatus::Failed, Some(e.to_string())),
            },
            Err(e) => (WorkflowStatus::Failed, Some(e.to_string())),
        };

        if let Err(e) = self
            .store
            .set_workflow_status(workflow_id, status, error)
            .await
        {
            tracing::warn!("Could not record final status of workflow {}: {}", workflow_id, e);
        }

        let duration_ms = start.elapsed().as_millis() as u64;
        tracing::info!("Workflow {} finished as {} in {}ms", workflow_id, status, duration_ms);
        self.event_bus.emit(ExecutionEvent::WorkflowFinished {
            workflow_id,
            status,
            duration_ms,
            timestamp: Utc::now(),
        });

        outcome
    }

    pub async fn workflow_status(&self, workflow_id: WorkflowId) -> Result<StatusCounts> {
        Ok(self.store.get_workflow(workflow_id).await?.status_counts())
    }

    pub async fn execution_history(&self, workflow_id: WorkflowId) -> Result<Vec<ExecutionRecord>> {
        Ok(self.store.get_workflow(workflow_id).await?.history())
    }

    pub async fn task_status(&self, workflow_id: WorkflowId, task_id: TaskId) -> Result<TaskStatus> {
        self.executor.task_status(workflow_id, task_id).await
    }

    pub async fn cancel_task(&self, workflow_id: WorkflowId, task_id: TaskId) -> Result<()> {
        self.executor.cancel_task(workflow_id, task_id).await
    }

    /// Cancel every in-flight task of a workflow, and fail a run whose
    /// `execute_workflow` call was dropped before it finished
    pub async fn cleanup_workflow_execution(&self, workflow_id: WorkflowId) -> Result<()> {
        if !self.store.contains(workflow_id).await {
            return Ok(());
        }

        for task_id in self.executor.running_tasks(workflow_id).await {
            match self.executor.cancel_task(workflow_id, task_id).await {
                // settled on its own between listing and cancelling
                Err(orchcore::OrchestrationError::NotRunning(_)) => {}
                other => other?,
            }
        }

        match self.store.recover_abandoned(workflow_id).await {
            // deleted concurrently
            Err(orchcore::OrchestrationError::UnknownWorkflow(_)) => Ok(()),
            other => other.map(|_| ()),
        }
    }

    /// DOT rendering of the workflow's dependency graph
    pub async fn visualize_workflow(&self, workflow_id: WorkflowId) -> Result<String> {
        self.store.to_dot(workflow_id).await
    }
}

/// Configuration for the orchestration service
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub executor: ExecutorConfig,
    pub event_buffer_size: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            executor: ExecutorConfig::default(),
            event_buffer_size: 1000,
        }
    }
}
