//! Shared fixtures for unit tests
//!
//! Spawns the mock runtime on an ephemeral port and provides engines with
//! controllable timing.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use tower::ServiceExt;

use crate::engine::{
    EngineKind, GenerationOutput, GenerationRequest, GenerationTimings, InferenceEngine,
    LoadReport, StopReason,
};
use crate::config::BridgeConfig;
use crate::error::Result;
use crate::mock_runtime::{self, RuntimeState};
use crate::proxy::{self, ProxyState};

/// Serve `state` on `127.0.0.1:0` and return the bound address
pub async fn spawn_runtime(state: RuntimeState) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("test");
    let addr = listener.local_addr().expect("test");
    let app = mock_runtime::create_router(state);
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    addr
}

/// Serve a proxy in front of `runtime` and return the proxy's base URL
pub async fn spawn_proxy(runtime: RuntimeState) -> String {
    let runtime_addr = spawn_runtime(runtime).await;
    let config = BridgeConfig::default()
        .with_runtime_port(runtime_addr.port())
        .with_poll_interval(Duration::from_millis(10));
    let app = proxy::create_router(ProxyState::new(config).expect("test"));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("test");
    let addr = listener.local_addr().expect("test");
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    format!("http://{addr}")
}

/// Send one request through `app` and decode the JSON reply
pub async fn call_json(
    app: &Router,
    method: &str,
    uri: &str,
    body: Option<&str>,
) -> (StatusCode, serde_json::Value) {
    let (status, bytes) = call_raw(app, method, uri, body).await;
    let value = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
    (status, value)
}

/// Send one request through `app` and return the raw body
pub async fn call_raw(app: &Router, method: &str, uri: &str, body: Option<&str>) -> (StatusCode, Vec<u8>) {
    let builder = Request::builder().method(method).uri(uri);
    let request = match body {
        Some(json) => builder
            .header("content-type", "application/json")
            .body(Body::from(json.to_string())),
        None => builder.body(Body::empty()),
    }
    .expect("test");
    let response = app.clone().oneshot(request).await.expect("test");
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("test");
    (status, bytes.to_vec())
}

/// Emits the prompt word by word with a delay, honouring cancellation
#[derive(Debug)]
pub struct SlowEngine {
    /// Delay between words
    pub delay: Duration,
}

impl SlowEngine {
    /// Engine pausing `millis` between words
    pub fn new(millis: u64) -> Self {
        Self {
            delay: Duration::from_millis(millis),
        }
    }
}

impl InferenceEngine for SlowEngine {
    fn kind(&self) -> EngineKind {
        EngineKind::Dummy
    }

    fn is_loaded(&self) -> bool {
        true
    }

    fn load(&self, path: &Path) -> Result<LoadReport> {
        Ok(LoadReport {
            status: "loaded (dummy)".to_string(),
            model: path.display().to_string(),
            kind: EngineKind::Dummy,
            layers: 0,
        })
    }

    fn reset(&self) -> Result<()> {
        Ok(())
    }

    fn generate(
        &self,
        request: &GenerationRequest,
        cancel: &AtomicBool,
        sink: &mut dyn FnMut(&str),
    ) -> Result<GenerationOutput> {
        let start = Instant::now();
        let mut text = String::new();
        let mut stop = StopReason::MaxTokens;
        for (i, word) in request.prompt.split_whitespace().enumerate() {
            if cancel.load(Ordering::Relaxed) {
                stop = StopReason::Cancelled;
                break;
            }
            std::thread::sleep(self.delay);
            let piece = if i == 0 { word.to_string() } else { format!(" {word}") };
            sink(&piece);
            text.push_str(&piece);
        }
        Ok(GenerationOutput {
            generated_tokens: text.split_whitespace().count(),
            text,
            prompt_tokens: 0,
            stop_reason: stop,
            timings: GenerationTimings {
                total: start.elapsed().as_secs_f64(),
                ..GenerationTimings::default()
            },
        })
    }
}

/// Runtime state over an [`crate::engine::EchoEngine`]
pub fn echo_state() -> RuntimeState {
    RuntimeState::new(Arc::new(crate::engine::EchoEngine::new()))
}
