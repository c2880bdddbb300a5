use crate::{TaskId, TaskType, WorkflowId, WorkflowStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Events emitted while workflows execute
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ExecutionEvent {
    WorkflowStarted {
        workflow_id: WorkflowId,
        task_count: usize,
        timestamp: DateTime<Utc>,
    },
    WorkflowFinished {
        workflow_id: WorkflowId,
        status: WorkflowStatus,
        duration_ms: u64,
        timestamp: DateTime<Utc>,
    },
    LevelStarted {
        workflow_id: WorkflowId,
        level: usize,
        task_count: usize,
        timestamp: DateTime<Utc>,
    },
    TaskStarted {
        workflow_id: WorkflowId,
        task_id: TaskId,
        task_type: TaskType,
        attempt: u32,
        timestamp: DateTime<Utc>,
    },
    TaskCompleted {
        workflow_id: WorkflowId,
        task_id: TaskId,
        duration_ms: u64,
        timestamp: DateTime<Utc>,
    },
    TaskFailed {
        workflow_id: WorkflowId,
        task_id: TaskId,
        error: String,
        timestamp: DateTime<Utc>,
    },
    TaskRetrying {
        workflow_id: WorkflowId,
        task_id: TaskId,
        attempt: u32,
        max_attempts: u32,
        timestamp: DateTime<Utc>,
    },
    TaskCancelled {
        workflow_id: WorkflowId,
        task_id: TaskId,
        timestamp: DateTime<Utc>,
    },
    TaskSkipped {
        workflow_id: WorkflowId,
        task_id: TaskId,
        failed_dependency: TaskId,
        timestamp: DateTime<Utc>,
    },
    TaskEvent {
        workflow_id: WorkflowId,
        task_id: TaskId,
        event: TaskEvent,
        timestamp: DateTime<Utc>,
    },
}

/// Events a handler reports about its own progress
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event_type")]
pub enum TaskEvent {
    Info { message: String },
    Warning { message: String },
    Progress { percent: f64, message: Option<String> },
}

/// Event emitter handed to a handler for real-time updates
#[derive(Clone)]
pub struct EventEmitter {
    workflow_id: WorkflowId,
    task_id: TaskId,
    sender: broadcast::Sender<ExecutionEvent>,
}

impl EventEmitter {
    pub fn new(
        workflow_id: WorkflowId,
        task_id: TaskId,
        sender: broadcast::Sender<ExecutionEvent>,
    ) -> Self {
        Self {
            workflow_id,
            task_id,
            sender,
        }
    }

    pub fn emit(&self, event: TaskEvent) {
        let _ = self.sender.send(ExecutionEvent::TaskEvent {
            workflow_id: self.workflow_id,
            task_id: self.task_id,
            event,
            timestamp: Utc::now(),
        });
    }

    pub fn info(&self, message: impl Into<String>) {
        self.emit(TaskEvent::Info {
            message: message.into(),
        });
    }

    pub fn warn(&self, message: impl Into<String>) {
        self.emit(TaskEvent::Warning {
            message: message.into(),
        });
    }

    pub fn progress(&self, percent: f64, message: Option<String>) {
        self.emit(TaskEvent::Progress { percent, message });
    }
}

/// Process-wide event bus; sends never block and are dropped without subscribers
pub struct EventBus {
    sender: broadcast::Sender<ExecutionEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ExecutionEvent> {
        self.sender.subscribe()
    }

    pub fn emit(&self, event: ExecutionEvent) {
        if self.sender.send(event).is_err() {
            tracing::trace!("No subscribers for execution event");
        }
    }

    pub fn create_emitter(&self, workflow_id: WorkflowId, task_id: TaskId) -> EventEmitter {
        EventEmitter::new(workflow_id, task_id, self.sender.clone())
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1000)
    }
}
