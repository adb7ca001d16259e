use super::*;
use crate::mock_runtime::RuntimeState;
use crate::test_helpers::{call_json, call_raw, echo_state, spawn_runtime, SlowEngine};
use std::sync::Arc;

async fn app_with(runtime: RuntimeState) -> (Router, ProxyState) {
    let addr = spawn_runtime(runtime).await;
    let config = BridgeConfig::default()
        .with_runtime_port(addr.port())
        .with_poll_interval(Duration::from_millis(10));
    let state = ProxyState::new(config).expect("test");
    (create_router(state.clone()), state)
}

async fn echo_app() -> Router {
    app_with(echo_state()).await.0
}

fn unreachable_app() -> Router {
    let config = BridgeConfig::default().with_runtime_port(9);
    create_router(ProxyState::new(config).expect("test"))
}

fn ndjson(bytes: &[u8]) -> Vec<serde_json::Value> {
    std::str::from_utf8(bytes)
        .expect("test")
        .lines()
        .map(|l| serde_json::from_str(l).expect("test"))
        .collect()
}

// ============================================================================
// Native endpoints
// ============================================================================

#[tokio::test]
async fn test_generate_returns_runtime_text() {
    let app = echo_app().await;
    let (status, body) = call_json(&app, "POST", "/generate", Some(r#"{"prompt":"hello"}"#)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["text"], "Echo: hello");
    assert_eq!(body["timed_out"], false);
    assert_eq!(body["request_id"].as_str().expect("test").len(), 36);
}

#[tokio::test]
async fn test_generate_clears_system_prompt() {
    let runtime = echo_state();
    let (app, _) = app_with(runtime.clone()).await;
    let _ = call_json(
        &app,
        "POST",
        "/api/generate",
        Some(r#"{"prompt":"x","system":"sys","stream":false}"#),
    )
    .await;
    assert_eq!(runtime.system_prompt(), "sys");
    let _ = call_json(&app, "POST", "/generate", Some(r#"{"prompt":"y"}"#)).await;
    assert_eq!(runtime.system_prompt(), "");
}

#[tokio::test]
async fn test_generate_reports_reset_failure() {
    let app = unreachable_app();
    let (status, body) = call_json(&app, "POST", "/generate", Some(r#"{"prompt":"x"}"#)).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert!(body["error"]
        .as_str()
        .expect("test")
        .starts_with("Failed to reset runtime:"));
}

#[tokio::test]
async fn test_concurrent_generates_are_serialised() {
    let (app, state) = app_with(RuntimeState::new(Arc::new(SlowEngine::new(30)))).await;
    let a = call_json(&app, "POST", "/generate", Some(r#"{"prompt":"a1 a2 a3"}"#));
    let b = call_json(&app, "POST", "/generate", Some(r#"{"prompt":"b1 b2 b3"}"#));
    let ((sa, ba), (sb, bb)) = tokio::join!(a, b);
    assert_eq!(sa, StatusCode::OK);
    assert_eq!(sb, StatusCode::OK);
    assert_eq!(ba["text"], "a1 a2 a3");
    assert_eq!(bb["text"], "b1 b2 b3");
    assert_eq!(state.metrics().snapshot().successes, 2);
}

#[tokio::test]
async fn test_generation_deadline_returns_partial_text() {
    let addr = spawn_runtime(RuntimeState::new(Arc::new(SlowEngine::new(200)))).await;
    let config = BridgeConfig::default()
        .with_runtime_port(addr.port())
        .with_poll_interval(Duration::from_millis(10))
        .with_generation_deadline(Duration::from_millis(50));
    let app = create_router(ProxyState::new(config).expect("test"));
    let (status, body) = call_json(
        &app,
        "POST",
        "/generate",
        Some(r#"{"prompt":"w1 w2 w3 w4 w5"}"#),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["timed_out"], true);
}

#[tokio::test]
async fn test_deadline_survives_failed_stop() {
    use crate::runtime_api::{
        ProviderResponse, StatusResponse, PATH_GENERATE, PATH_PROVIDER, PATH_RESET, PATH_STOP,
    };
    use axum::routing::{get, post};

    // never finishes and refuses to stop
    let runtime = Router::new()
        .route(PATH_RESET, post(|| async { Json(StatusResponse::ok()) }))
        .route(PATH_GENERATE, post(|| async { Json(StatusResponse::ok()) }))
        .route(
            PATH_PROVIDER,
            get(|| async {
                Json(ProviderResponse {
                    response: "w ".to_string(),
                    done: false,
                })
            }),
        )
        .route(
            PATH_STOP,
            get(|| async { (StatusCode::INTERNAL_SERVER_ERROR, "stop failed") }),
        );
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("test");
    let addr = listener.local_addr().expect("test");
    tokio::spawn(async move {
        let _ = axum::serve(listener, runtime).await;
    });

    let config = BridgeConfig::default()
        .with_runtime_port(addr.port())
        .with_poll_interval(Duration::from_millis(10))
        .with_generation_deadline(Duration::from_millis(50));
    let app = create_router(ProxyState::new(config).expect("test"));
    let (status, body) = call_json(&app, "POST", "/generate", Some(r#"{"prompt":"hi"}"#)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["timed_out"], true);
    assert!(body["text"].as_str().expect("test").contains('w'));
}

#[tokio::test]
async fn test_health_reports_runtime_state() {
    let app = echo_app().await;
    let (status, body) = call_json(&app, "GET", "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["runtime_up"], true);
    assert_eq!(body["mode"], "proxy");

    let (_, body) = call_json(&unreachable_app(), "GET", "/health", None).await;
    assert_eq!(body["runtime_up"], false);
}

#[tokio::test]
async fn test_load_without_path_reports_current_model() {
    let config = BridgeConfig::default()
        .with_runtime_port(9)
        .with_model_path("/models/qwen3");
    let app = create_router(ProxyState::new(config).expect("test"));
    let (status, body) = call_json(&app, "POST", "/load", Some("{}")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["model"], "/models/qwen3");
}

#[tokio::test]
async fn test_load_without_supervisor_fails() {
    let app = unreachable_app();
    let (status, body) = call_json(&app, "POST", "/load", Some(r#"{"model_path":"/m"}"#)).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body["status"], "error");
    assert_eq!(body["message"], "Failed to start runtime");
}

#[cfg(unix)]
#[tokio::test]
async fn test_load_restarts_supervised_runtime() {
    let addr = spawn_runtime(echo_state()).await;
    let config = BridgeConfig::default()
        .with_runtime_port(addr.port())
        .with_runtime_command(vec![
            "sh".to_string(),
            "-c".to_string(),
            "exec sleep 30".to_string(),
        ])
        .with_startup(5, Duration::from_millis(50));
    let state = ProxyState::with_supervisor(config).expect("test");
    let app = create_router(state.clone());

    let (status, body) = call_json(&app, "POST", "/load", Some(r#"{"model_path":"/models/a"}"#)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "loaded");
    assert_eq!(body["model"], "/models/a");
    assert_eq!(state.current_model().as_deref(), Some("/models/a"));
    assert_eq!(state.metrics().snapshot().runtime_starts, 1);
    state.shutdown().await;
}

#[tokio::test]
async fn test_metrics_endpoint_counts_requests() {
    let app = echo_app().await;
    let _ = call_json(&app, "POST", "/generate", Some(r#"{"prompt":"one two"}"#)).await;
    let (status, bytes) = call_raw(&app, "GET", "/metrics", None).await;
    assert_eq!(status, StatusCode::OK);
    let text = String::from_utf8(bytes).expect("test");
    assert!(text.contains("axbridge_requests_successful 1"));
    assert!(text.contains("axbridge_generated_tokens 3"));
}

// ============================================================================
// Ollama endpoints
// ============================================================================

#[tokio::test]
async fn test_tags_lists_single_model() {
    let app = echo_app().await;
    let (status, body) = call_json(&app, "GET", "/api/tags", None).await;
    assert_eq!(status, StatusCode::OK);
    let models = body["models"].as_array().expect("test");
    assert_eq!(models.len(), 1);
    assert_eq!(models[0]["name"], "qwen3-ax650");
    assert_eq!(models[0]["details"]["parameter_size"], "4B");
    assert_eq!(models[0]["details"]["family"], "qwen3");
    assert_eq!(models[0]["details"]["format"], "axmodel");
}

#[tokio::test]
async fn test_version_endpoint() {
    let app = echo_app().await;
    let (status, body) = call_json(&app, "GET", "/api/version", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["version"], OLLAMA_COMPAT_VERSION);
}

#[tokio::test]
async fn test_ollama_generate_non_streaming() {
    let app = echo_app().await;
    let (status, body) = call_json(
        &app,
        "POST",
        "/api/generate",
        Some(r#"{"model":"qwen3-ax650","prompt":"What is AI?","stream":false,"options":{"num_predict":80,"temperature":0.7}}"#),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["model"], "qwen3-ax650");
    assert_eq!(body["response"], "Echo: What is AI?");
    assert_eq!(body["done"], true);
    assert_eq!(body["done_reason"], "stop");
    assert_eq!(body["eval_count"], 4);
    assert_eq!(body["prompt_eval_count"], 3);
}

#[tokio::test]
async fn test_ollama_generate_streams_by_default() {
    let app = echo_app().await;
    let (status, bytes) = call_raw(&app, "POST", "/api/generate", Some(r#"{"prompt":"hi"}"#)).await;
    assert_eq!(status, StatusCode::OK);
    let lines = ndjson(&bytes);
    assert!(lines.len() >= 2);
    let last = lines.last().expect("test");
    assert_eq!(last["done"], true);
    assert!(last.get("eval_count").is_some());
    let text: String = lines[..lines.len() - 1]
        .iter()
        .map(|l| l["response"].as_str().expect("test").to_string())
        .collect();
    assert_eq!(text, "Echo: hi");
    assert!(lines[..lines.len() - 1].iter().all(|l| l["done"] == false));
}

#[tokio::test]
async fn test_ollama_stream_reports_errors_inline() {
    let app = unreachable_app();
    let (status, bytes) = call_raw(&app, "POST", "/api/generate", Some(r#"{"prompt":"hi"}"#)).await;
    assert_eq!(status, StatusCode::OK);
    let lines = ndjson(&bytes);
    assert_eq!(lines.len(), 1);
    assert!(lines[0]["error"]
        .as_str()
        .expect("test")
        .contains("Failed to reset runtime"));
}

#[tokio::test]
async fn test_ollama_chat_non_streaming_uses_chatml() {
    let runtime = echo_state();
    let (app, _) = app_with(runtime.clone()).await;
    let (status, body) = call_json(
        &app,
        "POST",
        "/api/chat",
        Some(r#"{"messages":[{"role":"system","content":"be kind"},{"role":"user","content":"Hello!"}],"stream":false}"#),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["message"]["role"], "assistant");
    assert_eq!(
        body["message"]["content"],
        "Echo: be kind\n<|im_start|>user\nHello!<|im_end|>\n<|im_start|>assistant\n"
    );
    assert_eq!(runtime.system_prompt(), "be kind");
}

#[tokio::test]
async fn test_ollama_chat_streaming() {
    let app = echo_app().await;
    let (status, bytes) = call_raw(
        &app,
        "POST",
        "/api/chat",
        Some(r#"{"messages":[{"role":"user","content":"Hi"}]}"#),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let lines = ndjson(&bytes);
    let last = lines.last().expect("test");
    assert_eq!(last["done"], true);
    assert_eq!(last["message"]["content"], "");
    assert!(lines[0]["message"]["content"]
        .as_str()
        .expect("test")
        .starts_with("Echo: "));
}

#[tokio::test]
async fn test_ollama_chat_rejects_empty_messages() {
    let app = echo_app().await;
    let (status, body) = call_json(&app, "POST", "/api/chat", Some(r#"{"messages":[]}"#)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "messages cannot be empty");
}
