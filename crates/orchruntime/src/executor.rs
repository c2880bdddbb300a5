use crate::dag::DagStore;
use crate::registry::HandlerRegistry;
use chrono::Utc;
use futures::future::join_all;
use orchcore::{
    EventBus, ExecutionEvent, HandlerContext, HandlerError, OrchestrationError, Result, Task,
    TaskId, TaskResult, TaskStatus, Value, WorkflowId,
};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;
use tokio::sync::{oneshot, Semaphore};
use tokio::time::{sleep, timeout, Duration};
use tokio_util::sync::CancellationToken;

/// What to do with a task whose dependency failed in an earlier level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DependencyFailurePolicy {
    /// Attempt the task anyway
    #[default]
    RunRegardless,
    /// Mark the task FAILED without invoking its handler
    SkipDependents,
}

/// Configuration for the task executor
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Attempts per task, including the first one
    pub max_retries: u32,
    /// Fixed delay between attempts
    pub retry_delay: Duration,
    /// Global cap on concurrently running handler invocations
    pub max_parallel_tasks: usize,
    /// Per-invocation limit; `None` lets a handler run indefinitely
    pub task_timeout: Option<Duration>,
    pub on_dependency_failure: DependencyFailurePolicy,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay: Duration::from_secs(5),
            max_parallel_tasks: 10,
            task_timeout: None,
            on_dependency_failure: DependencyFailurePolicy::RunRegardless,
        }
    }
}

/// Handle on an in-flight attempt
struct RunningTask {
    token: CancellationToken,
    settled: oneshot::Receiver<()>,
}

type RunningMap = HashMap<(WorkflowId, TaskId), RunningTask>;

/// Drops the in-flight handle when an attempt ends, including when the
/// attempt future itself is dropped.
struct RunningGuard<'a> {
    running: &'a Mutex<RunningMap>,
    key: (WorkflowId, TaskId),
}

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        lock(self.running).remove(&self.key);
    }
}

fn lock(running: &Mutex<RunningMap>) -> MutexGuard<'_, RunningMap> {
    running.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Executes tasks level by level with bounded parallelism and retries
pub struct TaskExecutor {
    config: ExecutorConfig,
    store: Arc<DagStore>,
    registry: Arc<HandlerRegistry>,
    event_bus: Arc<EventBus>,
    semaphore: Arc<Semaphore>,
    running: Mutex<RunningMap>,
}

impl TaskExecutor {
    pub fn new(
        config: ExecutorConfig,
        store: Arc<DagStore>,
        registry: Arc<HandlerRegistry>,
        event_bus: Arc<EventBus>,
    ) -> Self {
        let semaphore = Arc::new(Semaphore::new(config.max_parallel_tasks.max(1)));
        Self {
            config,
            store,
            registry,
            event_bus,
            semaphore,
            running: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// Run every task of a registered workflow with its own parameters
    pub async fn execute_workflow(&self, workflow_id: WorkflowId) -> Result<HashMap<TaskId, TaskResult>> {
        let tasks = self.store.get_tasks(workflow_id).await?;
        let parameters = tasks
            .iter()
            .map(|t| (t.id, t.parameters.clone()))
            .collect();
        self.execute_tasks(workflow_id, &tasks, &parameters).await
    }

    /// Run one task once. Handler failures come back as an unsuccessful
    /// `TaskResult`; only structural errors are returned as `Err`.
    pub async fn execute_task(
        &self,
        workflow_id: WorkflowId,
        task: &Task,
        parameters: HashMap<String, Value>,
    ) -> Result<TaskResult> {
        let (result, _cancelled) = self.run_attempt(workflow_id, task, parameters, 1).await?;
        Ok(result)
    }

    /// Run tasks in dependency order. Each level runs concurrently and the
    /// next level starts once every task of the current one has settled.
    pub async fn execute_tasks(
        &self,
        workflow_id: WorkflowId,
        tasks: &[Task],
        parameters: &HashMap<TaskId, HashMap<String, Value>>,
    ) -> Result<HashMap<TaskId, TaskResult>> {
        let order = self.store.execution_order(workflow_id).await?;
        let by_id: HashMap<TaskId, &Task> = tasks.iter().map(|t| (t.id, t)).collect();
        let mut results = HashMap::new();
        let mut failed: HashSet<TaskId> = HashSet::new();

        for (level_index, level) in order.iter().enumerate() {
            let tasks_in_level: Vec<&Task> = level.iter().filter_map(|id| by_id.get(id).copied()).collect();
            if tasks_in_level.is_empty() {
                continue;
            }

            tracing::debug!(
                workflow_id = %workflow_id,
                level = level_index,
                tasks = tasks_in_level.len(),
                "Starting level"
            );
            self.event_bus.emit(ExecutionEvent::LevelStarted {
                workflow_id,
                level: level_index,
                task_count: tasks_in_level.len(),
                timestamp: Utc::now(),
            });

            let runs = tasks_in_level
                .into_iter()
                .map(|task| self.run_in_level(workflow_id, task, parameters, &failed));
            let level_results = join_all(runs).await;

            for outcome in level_results {
                let (task_id, result) = outcome?;
                if !result.success {
                    failed.insert(task_id);
                }
                results.insert(task_id, result);
            }
        }

        Ok(results)
    }

    /// Request cancellation of an in-flight task and wait for it to settle
    pub async fn cancel_task(&self, workflow_id: WorkflowId, task_id: TaskId) -> Result<()> {
        let handle = lock(&self.running)
            .remove(&(workflow_id, task_id))
            .ok_or(OrchestrationError::NotRunning(task_id))?;

        handle.token.cancel();
        // a dropped sender also means the attempt has settled
        let _ = handle.settled.await;

        self.store
            .mark_task_failed(workflow_id, task_id, HandlerError::Cancelled.to_string())
            .await?;
        tracing::info!(workflow_id = %workflow_id, task_id = %task_id, "Task cancelled");
        self.event_bus.emit(ExecutionEvent::TaskCancelled {
            workflow_id,
            task_id,
            timestamp: Utc::now(),
        });
        Ok(())
    }

    pub async fn task_status(&self, workflow_id: WorkflowId, task_id: TaskId) -> Result<TaskStatus> {
        self.store.task_status(workflow_id, task_id).await
    }

    /// Tasks of a workflow with an attempt currently in flight
    pub async fn running_tasks(&self, workflow_id: WorkflowId) -> Vec<TaskId> {
        lock(&self.running)
            .keys()
            .filter(|(w, _)| *w == workflow_id)
            .map(|(_, t)| *t)
            .collect()
    }

    async fn run_in_level(
        &self,
        workflow_id: WorkflowId,
        task: &Task,
        parameters: &HashMap<TaskId, HashMap<String, Value>>,
        failed: &HashSet<TaskId>,
    ) -> Result<(TaskId, TaskResult)> {
        if self.config.on_dependency_failure == DependencyFailurePolicy::SkipDependents {
            if let Some(dep) = task.dependencies.iter().find(|d| failed.contains(*d)) {
                let result = self.skip_task(workflow_id, task.id, *dep).await?;
                return Ok((task.id, result));
            }
        }

        let params = parameters.get(&task.id).cloned().unwrap_or_default();
        let result = self.execute_with_retry(workflow_id, task, params).await?;
        Ok((task.id, result))
    }

    async fn execute_with_retry(
        &self,
        workflow_id: WorkflowId,
        task: &Task,
        parameters: HashMap<String, Value>,
    ) -> Result<TaskResult> {
        let max_attempts = self.config.max_retries.max(1);
        let mut attempt = 1;

        loop {
            let (mut result, cancelled) = {
                let Ok(_permit) = self.semaphore.acquire().await else {
                    return Ok(TaskResult::failed("executor is shut down", 0));
                };
                self.run_attempt(workflow_id, task, parameters.clone(), attempt)
                    .await?
            };
            result.attempts = attempt;

            if result.success || cancelled || attempt >= max_attempts {
                return Ok(result);
            }

            tracing::warn!(
                "Attempt {} failed for task {}: {}",
                attempt,
                task.id,
                result.error.as_deref().unwrap_or_default()
            );
            self.event_bus.emit(ExecutionEvent::TaskRetrying {
                workflow_id,
                task_id: task.id,
                attempt: attempt + 1,
                max_attempts,
                timestamp: Utc::now(),
            });
            sleep(self.config.retry_delay).await;
            attempt += 1;
        }
    }

    /// One handler invocation with status bookkeeping. The flag reports
    /// whether the attempt ended through cancellation.
    async fn run_attempt(
        &self,
        workflow_id: WorkflowId,
        task: &Task,
        parameters: HashMap<String, Value>,
        attempt: u32,
    ) -> Result<(TaskResult, bool)> {
        let key = (workflow_id, task.id);

        // the handle goes in first so a task reported RUNNING is always cancellable
        let token = CancellationToken::new();
        let (settled_tx, settled_rx) = oneshot::channel();
        lock(&self.running).insert(
            key,
            RunningTask {
                token: token.clone(),
                settled: settled_rx,
            },
        );
        let guard = RunningGuard {
            running: &self.running,
            key,
        };

        self.store.mark_task_running(workflow_id, task.id).await?;
        tracing::info!("Starting task {} ({}), attempt {}", task.id, task.task_type, attempt);
        self.event_bus.emit(ExecutionEvent::TaskStarted {
            workflow_id,
            task_id: task.id,
            task_type: task.task_type,
            attempt,
            timestamp: Utc::now(),
        });

        let start = Instant::now();
        let outcome = match self.registry.get(task.task_type) {
            Some(handler) => {
                let ctx = HandlerContext {
                    workflow_id,
                    task_id: task.id,
                    owner: task.owner.clone(),
                    parameters,
                    events: self.event_bus.create_emitter(workflow_id, task.id),
                    cancellation: token.clone(),
                };
                let invocation = async {
                    match self.config.task_timeout {
                        Some(limit) => timeout(limit, handler.invoke(ctx))
                            .await
                            .unwrap_or(Err(HandlerError::Timeout {
                                millis: limit.as_millis() as u64,
                            })),
                        None => handler.invoke(ctx).await,
                    }
                };
                tokio::select! {
                    biased;
                    _ = token.cancelled() => Err(HandlerError::Cancelled),
                    outcome = invocation => outcome,
                }
            }
            None => Err(HandlerError::NoHandler(task.task_type.to_string())),
        };
        let duration_ms = start.elapsed().as_millis() as u64;

        drop(guard);
        let cancelled = token.is_cancelled();
        let outcome = if cancelled {
            Err(HandlerError::Cancelled)
        } else {
            outcome
        };

        let result = match outcome {
            Ok(output) => {
                self.store.mark_task_completed(workflow_id, task.id).await?;
                tracing::info!("Task {} completed in {}ms", task.id, duration_ms);
                self.event_bus.emit(ExecutionEvent::TaskCompleted {
                    workflow_id,
                    task_id: task.id,
                    duration_ms,
                    timestamp: Utc::now(),
                });
                TaskResult::succeeded(output, duration_ms)
            }
            Err(e) => {
                let message = e.to_string();
                self.store
                    .mark_task_failed(workflow_id, task.id, message.clone())
                    .await?;
                tracing::error!("Task {} failed: {}", task.id, message);
                self.event_bus.emit(ExecutionEvent::TaskFailed {
                    workflow_id,
                    task_id: task.id,
                    error: message.clone(),
                    timestamp: Utc::now(),
                });
                TaskResult::failed(message, duration_ms)
            }
        };

        let _ = settled_tx.send(());
        Ok((result, cancelled))
    }

    async fn skip_task(
        &self,
        workflow_id: WorkflowId,
        task_id: TaskId,
        failed_dependency: TaskId,
    ) -> Result<TaskResult> {
        let message = format!("Skipped: dependency {} failed", failed_dependency);
        self.store
            .mark_task_failed(workflow_id, task_id, message.clone())
            .await?;
        tracing::warn!("Task {} skipped, dependency {} failed", task_id, failed_dependency);
        self.event_bus.emit(ExecutionEvent::TaskSkipped {
            workflow_id,
            task_id,
            failed_dependency,
            timestamp: Utc::now(),
        });

        let mut result = TaskResult::failed(message, 0);
        result.attempts = 0;
        Ok(result)
    }
}
