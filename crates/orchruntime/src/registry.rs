use async_trait::async_trait;
use orchcore::{HandlerContext, HandlerError, TaskHandler, TaskType, Value};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

/// Handler built from an async closure
pub struct FnHandler<F> {
    task_type: TaskType,
    func: F,
}

impl<F> FnHandler<F> {
    pub fn new(task_type: TaskType, func: F) -> Self {
        Self { task_type, func }
    }
}

#[async_trait]
impl<F, Fut> TaskHandler for FnHandler<F>
where
    F: Fn(HandlerContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, HandlerError>> + Send + 'static,
{
    fn task_type(&self) -> TaskType {
        self.task_type
    }

    async fn invoke(&self, ctx: HandlerContext) -> Result<Value, HandlerError> {
        (self.func)(ctx).await
    }
}

/// Maps each task type to the handler that executes it
pub struct HandlerRegistry {
    handlers: HashMap<TaskType, Arc<dyn TaskHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Build a registry from a lookup function over every known task type
    pub fn from_lookup<L>(lookup: L) -> Self
    where
        L: Fn(TaskType) -> Option<Arc<dyn TaskHandler>>,
    {
        let mut registry = Self::new();
        for task_type in TaskType::ALL {
            if let Some(handler) = lookup(task_type) {
                registry.handlers.insert(task_type, handler);
            }
        }
        registry
    }

    /// Register a handler, replacing any previous one for its task type
    pub fn register(&mut self, handler: Arc<dyn TaskHandler>) {
        let task_type = handler.task_type();
        tracing::info!("Registering handler for task type: {}", task_type);
        self.handlers.insert(task_type, handler);
    }

    /// Register an async closure as the handler for `task_type`
    pub fn register_fn<F, Fut>(&mut self, task_type: TaskType, func: F)
    where
        F: Fn(HandlerContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, HandlerError>> + Send + 'static,
    {
        self.register(Arc::new(FnHandler::new(task_type, func)));
    }

    pub fn get(&self, task_type: TaskType) -> Option<Arc<dyn TaskHandler>> {
        self.handlers.get(&task_type).cloned()
    }

    pub fn list_task_types(&self) -> Vec<TaskType> {
        TaskType::ALL
            .into_iter()
            .filter(|t| self.handlers.contains_key(t))
            .collect()
    }

    pub fn description(&self, task_type: TaskType) -> Option<String> {
        self.handlers
            .get(&task_type)
            .map(|h| h.description().to_string())
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}
