//! Built-in task handlers
//!
//! One handler per task type: chat-completion calls (with multi-step flows),
//! data processing, and notifications.

mod flow;
mod llm;
mod notification;
mod transform;

pub use flow::{Flow, FlowStep};
pub use llm::{ChatCompletionHandler, ChatMessage, LlmConfig};
pub use notification::NotificationHandler;
pub use transform::DataProcessingHandler;
use orchruntime::HandlerRegistry;

use std::sync::Arc;

/// Register all built-in handlers with a registry
pub fn register_all(registry: &mut HandlerRegistry, llm: LlmConfig) {
    registry.register(Arc::new(ChatCompletionHandler::new(llm)));
    registry.register(Arc::new(DataProcessingHandler));
    registry.register(Arc::new(NotificationHandler::new()));
}
