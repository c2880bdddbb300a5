// crates/orchhandlers/tests/handlers_test.rs

use orchcore::{
    EventBus, ExecutionEvent, HandlerContext, HandlerError, TaskEvent, TaskHandler, TaskType, Value,
};
use orchhandlers::{
    register_all, ChatCompletionHandler, DataProcessingHandler, LlmConfig, NotificationHandler,
};
use orchruntime::HandlerRegistry;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

// Helper function to create a test context
fn create_test_context(bus: &EventBus, parameters: serde_json::Value) -> HandlerContext {
    let (workflow_id, task_id) = (uuid::Uuid::new_v4(), uuid::Uuid::new_v4());
    let parameters: HashMap<String, Value> = match parameters {
        serde_json::Value::Object(map) => map.into_iter().map(|(k, v)| (k, Value::from(v))).collect(),
        _ => HashMap::new(),
    };

    HandlerContext {
        workflow_id,
        task_id,
        owner: "tester".to_string(),
        parameters,
        events: bus.create_emitter(workflow_id, task_id),
        cancellation: CancellationToken::new(),
    }
}

fn completion(content: &str) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_json(json!({
        "choices": [{"message": {"role": "assistant", "content": content}}]
    }))
}

fn llm_config(server: &MockServer) -> LlmConfig {
    LlmConfig {
        model_url: Some(format!("{}/chat", server.uri())),
        api_key: Some("sk-test".to_string()),
        ..LlmConfig::default()
    }
}

#[tokio::test]
async fn test_chat_completion_single_message() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat"))
        .and(header("api-key", "sk-test"))
        .and(body_partial_json(json!({
            "model": "gpt4o",
            "max_tokens": 3000,
            "messages": [
                {"role": "system", "content": "Be brief"},
                {"role": "user", "content": "What is ESG?"}
            ]
        })))
        .respond_with(completion("Environmental, social, governance"))
        .expect(1)
        .mount(&server)
        .await;

    let handler = ChatCompletionHandler::new(llm_config(&server));
    let bus = EventBus::new(16);
    let ctx = create_test_context(&bus, json!({"message": "What is ESG?", "system_prompt": "Be brief"}));

    let output = handler.invoke(ctx).await.unwrap();

    assert_eq!(output.as_str(), Some("Environmental, social, governance"));
}

#[tokio::test]
async fn test_chat_flow_chains_answers() {
    let server = MockServer::start().await;
    // second step sees the first answer in its conversation
    Mock::given(method("POST"))
        .and(body_partial_json(json!({
            "messages": [
                {"role": "system", "content": "Review"},
                {"role": "user", "content": "Question"},
                {"role": "assistant", "content": "first answer"}
            ]
        })))
        .respond_with(completion("second answer"))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(body_partial_json(json!({
            "messages": [
                {"role": "system", "content": "Analyse"},
                {"role": "user", "content": "Question"}
            ]
        })))
        .respond_with(completion("first answer"))
        .expect(1)
        .mount(&server)
        .await;

    let handler = ChatCompletionHandler::new(llm_config(&server));
    let bus = EventBus::new(16);
    let mut events = bus.subscribe();
    let ctx = create_test_context(
        &bus,
        json!({
            "message": "Question",
            "flow_name": "market review",
            "steps": [
                {"system_prompt": "Review", "step_name": "review", "step_order": 2},
                {"system_prompt": "Analyse", "step_name": "analysis", "step_order": 1}
            ]
        }),
    );

    let output = handler.invoke(ctx).await.unwrap();

    assert_eq!(output.get("flow_name").and_then(Value::as_str), Some("market review"));
    assert_eq!(output.get("final_response").and_then(Value::as_str), Some("second answer"));
    let steps = output.get("steps").unwrap();
    assert_eq!(steps.get("analysis").and_then(Value::as_str), Some("first answer"));
    assert_eq!(steps.get("review").and_then(Value::as_str), Some("second answer"));

    let mut progress = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let ExecutionEvent::TaskEvent {
            event: TaskEvent::Progress { percent, .. },
            ..
        } = event
        {
            progress.push(percent);
        }
    }
    assert_eq!(progress, vec![50.0, 100.0]);
}

#[tokio::test]
async fn test_chat_flow_rejects_bad_step_order() {
    let handler = ChatCompletionHandler::new(LlmConfig {
        model_url: Some("http://127.0.0.1:9/unused".to_string()),
        ..LlmConfig::default()
    });
    let bus = EventBus::new(16);
    let ctx = create_test_context(
        &bus,
        json!({
            "message": "Question",
            "steps": [
                {"system_prompt": "A", "step_name": "a", "step_order": 1},
                {"system_prompt": "B", "step_name": "b", "step_order": 3}
            ]
        }),
    );

    let err = handler.invoke(ctx).await.unwrap_err();

    assert!(matches!(err, HandlerError::InvalidParameter { ref field, .. } if field == "step_order"));
}

#[tokio::test]
async fn test_chat_completion_reports_http_errors() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500).set_body_string("overloaded"))
        .mount(&server)
        .await;

    let handler = ChatCompletionHandler::new(llm_config(&server));
    let bus = EventBus::new(16);
    let err = handler
        .invoke(create_test_context(&bus, json!({"message": "hi"})))
        .await
        .unwrap_err();

    assert_eq!(err.to_string(), "Model call returned 500: overloaded");
}

#[tokio::test]
async fn test_chat_completion_requires_url() {
    let handler = ChatCompletionHandler::new(LlmConfig::default());
    let bus = EventBus::new(16);

    let err = handler
        .invoke(create_test_context(&bus, json!({"message": "hi"})))
        .await
        .unwrap_err();

    assert!(matches!(err, HandlerError::Configuration(_)));
}

#[tokio::test]
async fn test_chat_completion_observes_cancellation() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(completion("late").set_delay(Duration::from_secs(30)))
        .mount(&server)
        .await;

    let handler = ChatCompletionHandler::new(llm_config(&server));
    let bus = EventBus::new(16);
    let ctx = create_test_context(&bus, json!({"message": "hi"}));
    let token = ctx.cancellation.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        token.cancel();
    });

    let err = handler.invoke(ctx).await.unwrap_err();

    assert_eq!(err, HandlerError::Cancelled);
}

#[tokio::test]
async fn test_data_processing_operations() {
    let handler = DataProcessingHandler;
    let bus = EventBus::new(16);

    let parsed = handler
        .invoke(create_test_context(
            &bus,
            json!({"operation": "json_parse", "input": "{\"ticker\": \"PETR4\", \"price\": 38.5}"}),
        ))
        .await
        .unwrap();
    assert_eq!(parsed.get("ticker").and_then(Value::as_str), Some("PETR4"));
    assert_eq!(parsed.get("price").and_then(Value::as_f64), Some(38.5));

    let text = handler
        .invoke(create_test_context(
            &bus,
            json!({"operation": "json_stringify", "input": {"ok": true}}),
        ))
        .await
        .unwrap();
    assert_eq!(text.as_str(), Some("{\"ok\":true}"));

    let rendered = handler
        .invoke(create_test_context(
            &bus,
            json!({"operation": "template", "template": "{{ticker}} closed at {{price}}", "values": {"ticker": "VALE3", "price": 61}}),
        ))
        .await
        .unwrap();
    assert_eq!(rendered.as_str(), Some("VALE3 closed at 61"));

    let same = handler
        .invoke(create_test_context(&bus, json!({"input": [1, 2]})))
        .await
        .unwrap();
    assert_eq!(same.as_array().map(|a| a.len()), Some(2));
}

#[tokio::test]
async fn test_data_processing_errors() {
    let handler = DataProcessingHandler;
    let bus = EventBus::new(16);

    let unknown = handler
        .invoke(create_test_context(&bus, json!({"operation": "compress"})))
        .await
        .unwrap_err();
    assert!(matches!(unknown, HandlerError::Configuration(_)));

    let broken = handler
        .invoke(create_test_context(&bus, json!({"operation": "json_parse", "input": "{"})))
        .await
        .unwrap_err();
    assert!(broken.to_string().starts_with("JSON parse error"));

    let missing = handler
        .invoke(create_test_context(&bus, json!({"operation": "template"})))
        .await
        .unwrap_err();
    assert_eq!(missing, HandlerError::MissingParameter("template".to_string()));
}

#[tokio::test]
async fn test_notification_without_webhook() {
    let handler = NotificationHandler::new();
    let bus = EventBus::new(16);
    let mut events = bus.subscribe();

    let output = handler
        .invoke(create_test_context(&bus, json!({"message": "report ready"})))
        .await
        .unwrap();

    assert_eq!(output.get("delivered").and_then(Value::as_bool), Some(false));
    match events.try_recv().unwrap() {
        ExecutionEvent::TaskEvent {
            event: TaskEvent::Info { message },
            ..
        } => assert_eq!(message, "report ready"),
        other => panic!("unexpected event: {:?}", other),
    }
}

#[tokio::test]
async fn test_notification_posts_to_webhook() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/hook"))
        .and(body_partial_json(json!({"message": "done"})))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;

    let handler = NotificationHandler::new();
    let bus = EventBus::new(16);
    let ctx = create_test_context(
        &bus,
        json!({"message": "done", "webhook_url": format!("{}/hook", server.uri())}),
    );
    let task_id = ctx.task_id;

    let output = handler.invoke(ctx).await.unwrap();

    assert_eq!(output.get("delivered").and_then(Value::as_bool), Some(true));
    assert_eq!(output.get("status").and_then(Value::as_f64), Some(204.0));

    let requests = server.received_requests().await.unwrap();
    let body: serde_json::Value = serde_json::from_slice(&requests[0].body).unwrap();
    assert_eq!(body["task_id"], json!(task_id.to_string()));
}

#[tokio::test]
async fn test_notification_webhook_failure() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let handler = NotificationHandler::new();
    let bus = EventBus::new(16);
    let err = handler
        .invoke(create_test_context(
            &bus,
            json!({"message": "done", "webhook_url": server.uri()}),
        ))
        .await
        .unwrap_err();

    assert_eq!(err.to_string(), "Webhook returned 503");
}

#[test]
fn test_register_all_covers_every_task_type() {
    let mut registry = HandlerRegistry::new();
    register_all(&mut registry, LlmConfig::default());

    assert_eq!(registry.list_task_types(), TaskType::ALL.to_vec());
    let handler: Arc<dyn TaskHandler> = registry.get(TaskType::IaModule).unwrap();
    assert!(!handler.description().is_empty());
}
