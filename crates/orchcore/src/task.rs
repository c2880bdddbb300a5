use crate::{OrchestrationError, Value};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use uuid::Uuid;

pub type WorkflowId = Uuid;
pub type TaskId = Uuid;

/// Identifier of the requesting principal. Opaque to the engine.
pub type OwnerId = String;

/// Selects which handler executes a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    IaModule,
    DataProcessing,
    Notification,
}

impl TaskType {
    pub const ALL: [TaskType; 3] = [
        TaskType::IaModule,
        TaskType::DataProcessing,
        TaskType::Notification,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskType::IaModule => "ia_module",
            TaskType::DataProcessing => "data_processing",
            TaskType::Notification => "notification",
        }
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum WorkflowStatus {
    #[default]
    Draft,
    Active,
    Completed,
    Failed,
}

impl fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            WorkflowStatus::Draft => "draft",
            WorkflowStatus::Active => "active",
            WorkflowStatus::Completed => "completed",
            WorkflowStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Atomic unit of work inside a workflow
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    #[serde(default = "Uuid::new_v4")]
    pub id: TaskId,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(rename = "type")]
    pub task_type: TaskType,
    #[serde(default)]
    pub status: TaskStatus,
    #[serde(default)]
    pub parameters: HashMap<String, Value>,
    #[serde(default)]
    pub dependencies: Vec<TaskId>,
    #[serde(default)]
    pub owner: OwnerId,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

impl Task {
    pub fn new(name: impl Into<String>, task_type: TaskType) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            description: None,
            task_type,
            status: TaskStatus::Pending,
            parameters: HashMap::new(),
            dependencies: Vec::new(),
            owner: OwnerId::new(),
            error_message: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_parameter(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.parameters.insert(key.into(), value.into());
        self
    }

    /// Add a dependency edge; repeated ids collapse into one
    pub fn depends_on(mut self, task_id: TaskId) -> Self {
        if !self.dependencies.contains(&task_id) {
            self.dependencies.push(task_id);
        }
        self
    }

    /// Back to a fresh PENDING state, keeping definition fields
    pub fn reset(&mut self) {
        self.status = TaskStatus::Pending;
        self.error_message = None;
        self.started_at = None;
        self.completed_at = None;
    }
}

/// Input for creating a workflow, also the on-disk workflow file format
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkflowDraft {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub tasks: Vec<Task>,
}

impl WorkflowDraft {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn from_tasks(tasks: Vec<Task>) -> Self {
        Self {
            tasks,
            ..Self::default()
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn add_task(&mut self, task: Task) -> TaskId {
        let id = task.id;
        self.tasks.push(task);
        id
    }
}

/// A registered workflow; exclusively owns its tasks
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    pub id: WorkflowId,
    pub name: String,
    pub description: Option<String>,
    pub status: WorkflowStatus,
    pub tasks: Vec<Task>,
    pub owner: OwnerId,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Workflow {
    /// Build a DRAFT workflow from a draft, stamping `owner` onto every task
    pub fn from_draft(id: WorkflowId, draft: WorkflowDraft, owner: impl Into<OwnerId>) -> Self {
        let owner = owner.into();
        let now = Utc::now();
        let tasks = draft
            .tasks
            .into_iter()
            .map(|mut task| {
                task.owner = owner.clone();
                task
            })
            .collect();

        Self {
            id,
            name: draft.name,
            description: draft.description,
            status: WorkflowStatus::Draft,
            tasks,
            owner,
            error_message: None,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
        }
    }

    pub fn find_task(&self, id: TaskId) -> Option<&Task> {
        self.tasks.iter().find(|t| t.id == id)
    }

    pub fn find_task_mut(&mut self, id: TaskId) -> Option<&mut Task> {
        self.tasks.iter_mut().find(|t| t.id == id)
    }

    pub fn status_counts(&self) -> StatusCounts {
        let mut counts = StatusCounts::default();
        for task in &self.tasks {
            match task.status {
                TaskStatus::Completed => counts.completed += 1,
                TaskStatus::Failed => counts.failed += 1,
                TaskStatus::Running => counts.running += 1,
                TaskStatus::Pending => counts.pending += 1,
            }
        }
        counts
    }

    pub fn history(&self) -> Vec<ExecutionRecord> {
        self.tasks
            .iter()
            .map(|task| ExecutionRecord {
                task_id: task.id,
                status: task.status,
                started_at: task.started_at,
                completed_at: task.completed_at,
            })
            .collect()
    }
}

/// Outcome of running one task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    pub success: bool,
    pub output: Option<Value>,
    pub error: Option<String>,
    pub attempts: u32,
    pub execution_time_ms: u64,
}

impl TaskResult {
    pub fn succeeded(output: Value, execution_time_ms: u64) -> Self {
        Self {
            success: true,
            output: Some(output),
            error: None,
            attempts: 1,
            execution_time_ms,
        }
    }

    pub fn failed(error: impl Into<String>, execution_time_ms: u64) -> Self {
        Self {
            success: false,
            output: None,
            error: Some(error.into()),
            attempts: 1,
            execution_time_ms,
        }
    }

    pub fn into_result(self) -> Result<Value, OrchestrationError> {
        if self.success {
            Ok(self.output.unwrap_or_default())
        } else {
            Err(OrchestrationError::HandlerFailure(
                self.error.unwrap_or_else(|| "unknown failure".to_string()),
            ))
        }
    }
}

/// Per-status task counts of one workflow
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCounts {
    pub completed: usize,
    pub failed: usize,
    pub running: usize,
    pub pending: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub task_id: TaskId,
    pub status: TaskStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}
