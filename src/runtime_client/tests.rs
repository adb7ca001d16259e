use super::*;
use crate::mock_runtime::RuntimeState;
use crate::test_helpers::{echo_state, spawn_runtime, SlowEngine};
use std::sync::Arc;

fn client_for(addr: std::net::SocketAddr) -> RuntimeClient {
    RuntimeClient::new(format!("http://{addr}/"), Duration::from_secs(5)).expect("test")
}

#[test]
fn test_base_url_trailing_slash_trimmed() {
    let client = RuntimeClient::new("http://127.0.0.1:8000///", Duration::from_secs(1)).expect("test");
    assert_eq!(client.base_url(), "http://127.0.0.1:8000");
}

#[tokio::test]
async fn test_ping_unreachable_runtime() {
    // port 9 (discard) is closed on test machines
    let client = RuntimeClient::new("http://127.0.0.1:9", Duration::from_millis(300)).expect("test");
    assert!(!client.ping().await);
    let err = client.reset("").await.unwrap_err();
    assert!(matches!(err, BridgeError::ConnectionError(_)));
}

#[tokio::test]
async fn test_reset_generate_collect_roundtrip() {
    let addr = spawn_runtime(echo_state()).await;
    let client = client_for(addr);
    assert!(client.ping().await);

    client.reset("").await.expect("test");
    client
        .start_generation(&RuntimeGenerateRequest::new("ping", 4))
        .await
        .expect("test");
    let mut chunks = Vec::new();
    let outcome = client
        .collect(Duration::from_millis(10), Duration::from_secs(5), |c| {
            chunks.push(c.to_string());
        })
        .await
        .expect("test");
    assert!(outcome.done);
    assert!(!outcome.timed_out);
    assert_eq!(outcome.text, "Echo: ping");
    assert_eq!(chunks.concat(), "Echo: ping");
}

#[tokio::test]
async fn test_busy_runtime_maps_to_runtime_error() {
    let addr = spawn_runtime(RuntimeState::new(Arc::new(SlowEngine::new(200)))).await;
    let client = client_for(addr);
    client
        .start_generation(&RuntimeGenerateRequest::new("a b c", 4))
        .await
        .expect("test");
    let err = client
        .start_generation(&RuntimeGenerateRequest::new("again", 4))
        .await
        .unwrap_err();
    match err {
        BridgeError::RuntimeError { status, message } => {
            assert_eq!(status, 400);
            assert_eq!(message, "llm is running");
        },
        other => panic!("unexpected error: {other}"),
    }
    client.stop().await.expect("test");
}

#[tokio::test]
async fn test_collect_deadline_sets_timed_out() {
    let addr = spawn_runtime(RuntimeState::new(Arc::new(SlowEngine::new(300)))).await;
    let client = client_for(addr);
    client
        .start_generation(&RuntimeGenerateRequest::new("w1 w2 w3 w4 w5 w6", 8))
        .await
        .expect("test");
    let outcome = client
        .collect(Duration::from_millis(20), Duration::from_millis(100), |_| {})
        .await
        .expect("test");
    assert!(outcome.timed_out);
    assert!(!outcome.done);
    client.stop().await.expect("test");
}

#[tokio::test]
async fn test_chat_roundtrip() {
    let addr = spawn_runtime(echo_state()).await;
    let client = client_for(addr);
    let reply = client
        .chat(vec![ChatMessage::new("user", "hey")])
        .await
        .expect("test");
    assert_eq!(reply, "Echo: hey");
}
