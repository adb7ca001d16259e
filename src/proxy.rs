//! Ollama-facing HTTP proxy
//!
//! Clients see a stateless API: every generation resets the runtime, starts
//! a generation and polls until done. The runtime itself is stateful and
//! single-slot, so generations are serialised behind one lock.
//!
//! ## Endpoints
//!
//! - `POST /generate`, `POST /load`, `GET /health`, `GET /metrics`
//! - Ollama: `GET /api/tags`, `GET /api/version`, `POST /api/generate`,
//!   `POST /api/chat` (NDJSON streaming by default)

use std::convert::Infallible;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use axum::{
    body::{Body, Bytes},
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex};
use tracing::{error, info, warn};

use crate::config::BridgeConfig;
use crate::error::{BridgeError, Result};
use crate::metrics::MetricsCollector;
use crate::runtime_api::{ChatMessage, RuntimeGenerateRequest, DEFAULT_MAX_TOKENS};
use crate::runtime_client::RuntimeClient;
use crate::sampling::SamplingParams;
use crate::supervisor::Supervisor;

pub mod ollama;

use ollama::{
    estimate_tokens, render_chatml, system_prompt, ModelTag, OllamaChatRequest,
    OllamaChatResponse, OllamaGenerateRequest, OllamaGenerateResponse, OllamaStats, TagsResponse,
    VersionResponse, OLLAMA_COMPAT_VERSION,
};

// ============================================================================
// Request/response types
// ============================================================================

fn default_max_tokens() -> usize {
    DEFAULT_MAX_TOKENS
}

fn default_temperature() -> f32 {
    SamplingParams::default().temperature
}

fn default_top_p() -> f32 {
    SamplingParams::default().top_p
}

fn default_top_k() -> usize {
    SamplingParams::default().top_k
}

/// `POST /generate` body
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerateRequest {
    /// Prompt text
    #[serde(default)]
    pub prompt: String,
    /// Maximum new tokens
    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,
    /// Sampling temperature
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    /// Nucleus threshold
    #[serde(default = "default_top_p")]
    pub top_p: f32,
    /// Top-k cutoff
    #[serde(default = "default_top_k")]
    pub top_k: usize,
}

/// `POST /generate` reply
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerateResponse {
    /// Accumulated text
    pub text: String,
    /// Correlation id that also appears in runtime step logs
    #[serde(default)]
    pub request_id: String,
    /// The generation deadline cut the reply short
    #[serde(default)]
    pub timed_out: bool,
}

/// `POST /load` body
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoadRequest {
    /// Model directory to restart the runtime with
    #[serde(default)]
    pub model_path: Option<String>,
}

/// `POST /load` reply
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadResponse {
    /// `loaded`, `ok` or `error`
    pub status: String,
    /// Current model path
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Failure description
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// `GET /health` reply
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    /// Always `ok` while the proxy answers
    pub status: String,
    /// Whether the runtime answered its ping
    pub runtime_up: bool,
    /// Current model path
    pub model: Option<String>,
    /// Always `proxy`
    pub mode: String,
}

/// Error body
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Error message
    pub error: String,
}

type ProxyError = (StatusCode, Json<ErrorResponse>);

fn internal(message: String) -> ProxyError {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ErrorResponse { error: message }),
    )
}

// ============================================================================
// State
// ============================================================================

/// Shared proxy state
#[derive(Clone)]
pub struct ProxyState {
    config: Arc<BridgeConfig>,
    client: RuntimeClient,
    supervisor: Option<Arc<Mutex<Supervisor>>>,
    model: Arc<RwLock<Option<String>>>,
    generate_lock: Arc<Mutex<()>>,
    metrics: MetricsCollector,
}

impl std::fmt::Debug for ProxyState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyState")
            .field("runtime", &self.client.base_url())
            .field("supervised", &self.supervisor.is_some())
            .field("model", &self.current_model())
            .finish_non_exhaustive()
    }
}

impl ProxyState {
    /// State talking to an externally managed runtime
    ///
    /// # Errors
    ///
    /// Returns `ConnectionError` if the HTTP client cannot be built.
    pub fn new(config: BridgeConfig) -> Result<Self> {
        let client = RuntimeClient::from_config(&config)?;
        let model = config.model_path.as_ref().map(|p| p.display().to_string());
        Ok(Self {
            config: Arc::new(config),
            client,
            supervisor: None,
            model: Arc::new(RwLock::new(model)),
            generate_lock: Arc::new(Mutex::new(())),
            metrics: MetricsCollector::new(),
        })
    }

    /// State owning the runtime process through a [`Supervisor`]
    ///
    /// # Errors
    ///
    /// Returns `ConnectionError` if the HTTP client cannot be built.
    pub fn with_supervisor(config: BridgeConfig) -> Result<Self> {
        let supervisor = Supervisor::new(config.clone())?;
        let mut state = Self::new(config)?;
        state.supervisor = Some(Arc::new(Mutex::new(supervisor)));
        Ok(state)
    }

    /// Metrics collector
    #[must_use]
    pub fn metrics(&self) -> &MetricsCollector {
        &self.metrics
    }

    /// Configuration in use
    #[must_use]
    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    /// Model path the runtime was started with
    #[must_use]
    pub fn current_model(&self) -> Option<String> {
        self.model.read().ok().and_then(|m| m.clone())
    }

    fn set_model(&self, model: Option<String>) {
        if let Ok(mut slot) = self.model.write() {
            *slot = model;
        }
    }

    /// (Re)start the supervised runtime
    ///
    /// Waits for any in-flight generation first.
    ///
    /// # Errors
    ///
    /// Returns `RuntimeUnavailable` when no supervisor is attached, or the
    /// supervisor's startup error.
    pub async fn start_runtime(&self, model_path: Option<PathBuf>) -> Result<()> {
        let Some(supervisor) = &self.supervisor else {
            return Err(BridgeError::RuntimeUnavailable(
                "runtime is not supervised by this proxy".to_string(),
            ));
        };
        let _generation = self.generate_lock.lock().await;
        let mut supervisor = supervisor.lock().await;
        let result = supervisor.start(model_path).await;
        self.metrics.record_runtime_start(result.is_ok());
        if result.is_ok() {
            self.set_model(supervisor.current_model().map(|p| p.display().to_string()));
        }
        result
    }

    /// Stop the supervised runtime, if any
    pub async fn shutdown(&self) {
        if let Some(supervisor) = &self.supervisor {
            supervisor.lock().await.stop().await;
        }
    }
}

// ============================================================================
// Router and server
// ============================================================================

/// Create the proxy router
pub fn create_router(state: ProxyState) -> Router {
    Router::new()
        .route("/generate", post(generate_handler))
        .route("/load", post(load_handler))
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        // Ollama-compatible API
        .route("/api/tags", get(tags_handler))
        .route("/api/version", get(version_handler))
        .route("/api/generate", post(ollama_generate_handler))
        .route("/api/chat", post(ollama_chat_handler))
        .with_state(state)
}

/// Launch the runtime, serve the proxy until Ctrl-C/SIGTERM, then stop the runtime
///
/// # Errors
///
/// Returns `IoError` if the listen address cannot be bound.
pub async fn serve(config: BridgeConfig) -> Result<()> {
    info!("{}", "=".repeat(60));
    info!("AX650 Hybrid Proxy Starting");
    info!("{}", "=".repeat(60));

    let addr = format!("{}:{}", config.proxy_host, config.proxy_port);
    let state = ProxyState::with_supervisor(config)?;
    if let Err(e) = state.start_runtime(None).await {
        warn!("Initial runtime launch failed, will retry on /load: {e}");
    }

    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(e) => {
            state.shutdown().await;
            return Err(BridgeError::IoError {
                message: format!("Failed to bind proxy to {addr}: {e}"),
            });
        },
    };
    info!("Proxy listening on http://{addr}");

    let result = axum::serve(listener, create_router(state.clone()))
        .with_graceful_shutdown(shutdown_signal())
        .await;
    state.shutdown().await;
    result.map_err(|e| BridgeError::IoError {
        message: format!("Proxy server error: {e}"),
    })
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            },
            Err(_) => std::future::pending::<()>().await,
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
    info!("Shutdown signal received");
}

// ============================================================================
// Generation core
// ============================================================================

/// A finished runtime generation
#[derive(Debug, Clone)]
struct Completed {
    text: String,
    request_id: String,
    timed_out: bool,
    duration: Duration,
}

/// Reset, start and poll one generation while holding the generate lock
async fn run_generation<F>(
    state: &ProxyState,
    system: &str,
    mut request: RuntimeGenerateRequest,
    on_chunk: F,
) -> std::result::Result<Completed, ProxyError>
where
    F: FnMut(&str) + Send,
{
    let _generation = state.generate_lock.lock().await;
    let start = Instant::now();
    let request_id = request
        .request_id
        .get_or_insert_with(|| uuid::Uuid::new_v4().to_string())
        .clone();
    info!(
        "REQ {request_id}: proxy generate, prompt_len={}, max_tokens={}",
        request.prompt.len(),
        request.max_tokens
    );

    if let Err(e) = state.client.reset(system).await {
        error!("Failed to reset runtime: {e}");
        state.metrics.record_failure();
        return Err(internal(format!("Failed to reset runtime: {e}")));
    }
    if let Err(e) = state.client.start_generation(&request).await {
        error!("Failed to start generation: {e}");
        state.metrics.record_failure();
        return Err(internal(format!("Failed to start generation: {e}")));
    }
    let outcome = match state
        .client
        .collect(state.config.poll_interval, state.config.generation_deadline, on_chunk)
        .await
    {
        Ok(outcome) => outcome,
        Err(e) => {
            error!("Error polling generation: {e}");
            state.metrics.record_failure();
            return Err(internal(format!("Error polling generation: {e}")));
        },
    };
    if outcome.timed_out {
        // free the runtime slot for the next request
        if let Err(e) = state.client.stop().await {
            warn!("Failed to stop runtime after deadline: {e}");
        }
    }

    let duration = start.elapsed();
    state.metrics.record_success(
        outcome.text.chars().count(),
        estimate_tokens(&outcome.text),
        duration,
        outcome.timed_out,
    );
    info!(
        "REQ {request_id}: proxy done, {} chars in {:.3}s",
        outcome.text.len(),
        duration.as_secs_f64()
    );
    Ok(Completed {
        text: outcome.text,
        request_id,
        timed_out: outcome.timed_out,
        duration,
    })
}

enum StreamEvent {
    Chunk(String),
    Done(Completed),
    Failed(String),
}

fn ndjson_line<T: Serialize>(value: &T) -> Bytes {
    let mut line = serde_json::to_vec(value)
        .unwrap_or_else(|_| br#"{"error":"serialization failed"}"#.to_vec());
    line.push(b'\n');
    Bytes::from(line)
}

/// Run a generation in the background and stream it as NDJSON lines
fn stream_ndjson<C, D>(
    state: ProxyState,
    system: String,
    request: RuntimeGenerateRequest,
    chunk_line: C,
    done_line: D,
) -> Response
where
    C: Fn(&str) -> Bytes + Send + 'static,
    D: FnOnce(&Completed) -> Bytes + Send + 'static,
{
    let (tx, mut rx) = mpsc::unbounded_channel::<StreamEvent>();
    tokio::spawn(async move {
        let chunk_tx = tx.clone();
        let result = run_generation(&state, &system, request, move |chunk| {
            let _ = chunk_tx.send(StreamEvent::Chunk(chunk.to_string()));
        })
        .await;
        let _ = tx.send(match result {
            Ok(completed) => StreamEvent::Done(completed),
            Err((_, Json(body))) => StreamEvent::Failed(body.error),
        });
    });

    let stream = async_stream::stream! {
        let mut done_line = Some(done_line);
        while let Some(event) = rx.recv().await {
            match event {
                StreamEvent::Chunk(text) => yield Ok::<_, Infallible>(chunk_line(&text)),
                StreamEvent::Done(completed) => {
                    if let Some(render) = done_line.take() {
                        yield Ok(render(&completed));
                    }
                    break;
                },
                StreamEvent::Failed(error) => {
                    yield Ok(ndjson_line(&ErrorResponse { error }));
                    break;
                },
            }
        }
    };

    (
        [(header::CONTENT_TYPE, "application/x-ndjson")],
        Body::from_stream(stream),
    )
        .into_response()
}

fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339()
}

#[allow(clippy::cast_possible_truncation)]
fn final_stats(prompt: &str, completed: &Completed) -> OllamaStats {
    let nanos = completed.duration.as_nanos() as u64;
    OllamaStats {
        done_reason: Some(if completed.timed_out { "length" } else { "stop" }.to_string()),
        total_duration: Some(nanos),
        load_duration: Some(0),
        prompt_eval_count: Some(estimate_tokens(prompt)),
        eval_count: Some(estimate_tokens(&completed.text)),
        eval_duration: Some(nanos),
    }
}

// ============================================================================
// Handlers
// ============================================================================

async fn generate_handler(
    State(state): State<ProxyState>,
    Json(request): Json<GenerateRequest>,
) -> std::result::Result<Json<GenerateResponse>, ProxyError> {
    let runtime_request = RuntimeGenerateRequest::new(request.prompt, request.max_tokens)
        .with_sampling(request.temperature, request.top_p, request.top_k);
    let completed = run_generation(&state, "", runtime_request, |_| {}).await?;
    Ok(Json(GenerateResponse {
        text: completed.text,
        request_id: completed.request_id,
        timed_out: completed.timed_out,
    }))
}

async fn load_handler(
    State(state): State<ProxyState>,
    body: Bytes,
) -> (StatusCode, Json<LoadResponse>) {
    let request: LoadRequest = serde_json::from_slice(&body).unwrap_or_default();
    let Some(path) = request.model_path.filter(|p| !p.is_empty()) else {
        return (
            StatusCode::OK,
            Json(LoadResponse {
                status: "ok".to_string(),
                model: state.current_model(),
                message: None,
            }),
        );
    };

    info!("Reloading model: {path}");
    match state.start_runtime(Some(PathBuf::from(&path))).await {
        Ok(()) => (
            StatusCode::OK,
            Json(LoadResponse {
                status: "loaded".to_string(),
                model: Some(path),
                message: None,
            }),
        ),
        Err(e) => {
            error!("Runtime restart for {path} failed: {e}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(LoadResponse {
                    status: "error".to_string(),
                    model: None,
                    message: Some("Failed to start runtime".to_string()),
                }),
            )
        },
    }
}

async fn health_handler(State(state): State<ProxyState>) -> Json<HealthResponse> {
    // The ping hits /api/stop, which would cancel a running generation, so
    // a held generate lock counts as proof of life.
    let runtime_up = match state.generate_lock.try_lock() {
        Ok(_idle) => state.client.ping().await,
        Err(_) => true,
    };
    Json(HealthResponse {
        status: "ok".to_string(),
        runtime_up,
        model: state.current_model(),
        mode: "proxy".to_string(),
    })
}

async fn metrics_handler(State(state): State<ProxyState>) -> String {
    state.metrics.to_prometheus()
}

async fn tags_handler(State(state): State<ProxyState>) -> Json<TagsResponse> {
    Json(TagsResponse {
        models: vec![ModelTag::qwen3(&state.config.model_name, now_rfc3339())],
    })
}

async fn version_handler() -> Json<VersionResponse> {
    Json(VersionResponse {
        version: OLLAMA_COMPAT_VERSION.to_string(),
    })
}

async fn ollama_generate_handler(
    State(state): State<ProxyState>,
    Json(request): Json<OllamaGenerateRequest>,
) -> Response {
    let model = request
        .model
        .clone()
        .unwrap_or_else(|| state.config.model_name.clone());
    let system = request.system.clone().unwrap_or_default();
    let prompt = request.prompt.clone();
    let runtime_request = request.options.to_runtime_request(request.prompt);

    if request.stream.unwrap_or(true) {
        let chunk_model = model.clone();
        return stream_ndjson(
            state,
            system,
            runtime_request,
            move |text| {
                ndjson_line(&OllamaGenerateResponse {
                    model: chunk_model.clone(),
                    created_at: now_rfc3339(),
                    response: text.to_string(),
                    done: false,
                    stats: OllamaStats::default(),
                })
            },
            move |completed| {
                ndjson_line(&OllamaGenerateResponse {
                    model,
                    created_at: now_rfc3339(),
                    response: String::new(),
                    done: true,
                    stats: final_stats(&prompt, completed),
                })
            },
        );
    }

    match run_generation(&state, &system, runtime_request, |_| {}).await {
        Ok(completed) => Json(OllamaGenerateResponse {
            model,
            created_at: now_rfc3339(),
            stats: final_stats(&prompt, &completed),
            response: completed.text,
            done: true,
        })
        .into_response(),
        Err(err) => err.into_response(),
    }
}

async fn ollama_chat_handler(
    State(state): State<ProxyState>,
    Json(request): Json<OllamaChatRequest>,
) -> Response {
    if request.messages.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(ErrorResponse {
                error: "messages cannot be empty".to_string(),
            }),
        )
            .into_response();
    }
    let model = request
        .model
        .clone()
        .unwrap_or_else(|| state.config.model_name.clone());
    let system = system_prompt(&request.messages);
    let prompt = render_chatml(&request.messages);
    let runtime_request = request.options.to_runtime_request(prompt.clone());

    if request.stream.unwrap_or(true) {
        let chunk_model = model.clone();
        return stream_ndjson(
            state,
            system,
            runtime_request,
            move |text| {
                ndjson_line(&OllamaChatResponse {
                    model: chunk_model.clone(),
                    created_at: now_rfc3339(),
                    message: ChatMessage::new("assistant", text),
                    done: false,
                    stats: OllamaStats::default(),
                })
            },
            move |completed| {
                ndjson_line(&OllamaChatResponse {
                    model,
                    created_at: now_rfc3339(),
                    message: ChatMessage::new("assistant", ""),
                    done: true,
                    stats: final_stats(&prompt, completed),
                })
            },
        );
    }

    match run_generation(&state, &system, runtime_request, |_| {}).await {
        Ok(completed) => Json(OllamaChatResponse {
            model,
            created_at: now_rfc3339(),
            stats: final_stats(&prompt, &completed),
            message: ChatMessage::new("assistant", completed.text),
            done: true,
        })
        .into_response(),
        Err(err) => err.into_response(),
    }
}

#[cfg(test)]
mod tests;
