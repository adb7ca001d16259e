//! Stand-in for `main_api_ax650`
//!
//! Serves the runtime API on top of an [`InferenceEngine`] so the proxy can
//! be developed and tested without the vendor binary. There is one
//! generation slot: `/api/generate` starts a blocking worker that streams
//! text into a queue, `/api/generate_provider` drains it.
//!
//! Each generation gets a number; a worker only writes into the slot while
//! the slot still carries its number, so a cancelled worker that is slow to
//! notice cannot leak text into the next generation.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use axum::{
    body::Bytes,
    extract::State,
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use tracing::{error, info, warn};

use crate::engine::{GenerationRequest, InferenceEngine};
use crate::error::{BridgeError, Result};
use crate::runtime_api::{
    ProviderResponse, ResetRequest, RuntimeChatRequest, RuntimeChatResponse, RuntimeErrorBody,
    RuntimeGenerateRequest, StatusResponse, DEFAULT_MAX_TOKENS, PATH_CHAT, PATH_GENERATE,
    PATH_PROVIDER, PATH_RESET, PATH_STOP,
};

type ApiError = (StatusCode, Json<RuntimeErrorBody>);

fn api_error(status: StatusCode, message: impl Into<String>) -> ApiError {
    (
        status,
        Json(RuntimeErrorBody {
            error: message.into(),
        }),
    )
}

#[derive(Debug, Default)]
struct Slot {
    queue: VecDeque<String>,
    running: bool,
    generation: u64,
    cancel: Arc<AtomicBool>,
}

/// Shared state of the mock runtime server
#[derive(Clone)]
pub struct RuntimeState {
    engine: Arc<dyn InferenceEngine>,
    slot: Arc<Mutex<Slot>>,
    system_prompt: Arc<Mutex<String>>,
    autoload: Option<PathBuf>,
}

impl std::fmt::Debug for RuntimeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuntimeState")
            .field("engine", &self.engine.kind())
            .field("autoload", &self.autoload)
            .finish_non_exhaustive()
    }
}

impl RuntimeState {
    /// State serving `engine`
    #[must_use]
    pub fn new(engine: Arc<dyn InferenceEngine>) -> Self {
        Self {
            engine,
            slot: Arc::new(Mutex::new(Slot::default())),
            system_prompt: Arc::new(Mutex::new(String::new())),
            autoload: None,
        }
    }

    /// Model directory loaded lazily when a generate arrives unloaded
    #[must_use]
    pub fn with_autoload(mut self, path: Option<PathBuf>) -> Self {
        self.autoload = path;
        self
    }

    /// Engine behind this server
    #[must_use]
    pub fn engine(&self) -> &Arc<dyn InferenceEngine> {
        &self.engine
    }

    /// Whether a generation is marked running
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.slot.lock().map(|s| s.running).unwrap_or(false)
    }

    /// System prompt stored by the last reset
    #[must_use]
    pub fn system_prompt(&self) -> String {
        self.system_prompt
            .lock()
            .map(|s| s.clone())
            .unwrap_or_default()
    }

    fn slot(&self) -> std::result::Result<MutexGuard<'_, Slot>, ApiError> {
        self.slot
            .lock()
            .map_err(|_| api_error(StatusCode::INTERNAL_SERVER_ERROR, "slot lock poisoned"))
    }

    fn compose_prompt(&self, prompt: &str) -> String {
        let system = self.system_prompt();
        if system.is_empty() {
            prompt.to_string()
        } else {
            format!("{system}\n{prompt}")
        }
    }

    /// Load the autoload model into the engine, off the async runtime
    async fn ensure_loaded(&self) -> std::result::Result<(), ApiError> {
        if self.engine.is_loaded() {
            return Ok(());
        }
        let Some(path) = self.autoload.clone() else {
            return Err(api_error(
                StatusCode::BAD_REQUEST,
                BridgeError::ModelNotLoaded.to_string(),
            ));
        };
        info!("Auto-loading model: {}", path.display());
        let engine = Arc::clone(&self.engine);
        let loaded = tokio::task::spawn_blocking(move || engine.load(&path))
            .await
            .map_err(|e| api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
        loaded
            .map(|_| ())
            .map_err(|e| api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))
    }
}

/// Router exposing the runtime API
pub fn create_router(state: RuntimeState) -> Router {
    Router::new()
        .route(PATH_RESET, post(reset_handler))
        .route(PATH_GENERATE, post(generate_handler))
        .route(PATH_PROVIDER, get(provider_handler))
        .route(PATH_STOP, get(stop_handler))
        .route(PATH_CHAT, post(chat_handler))
        .with_state(state)
}

/// Load the autoload model (if any) and serve until the task is dropped
///
/// # Errors
///
/// Returns `IoError` when the address cannot be bound.
pub async fn serve(state: RuntimeState, addr: SocketAddr) -> Result<()> {
    if let Some(path) = state.autoload.clone() {
        info!("Auto-loading model: {}", path.display());
        let engine = Arc::clone(state.engine());
        match tokio::task::spawn_blocking(move || engine.load(&path)).await {
            Ok(Ok(report)) => info!("Model ready: {} ({})", report.model, report.status),
            Ok(Err(e)) => warn!("Model load failed, will retry on first generate: {e}"),
            Err(e) => warn!("Model load task failed: {e}"),
        }
    } else {
        info!("No AX650_MODEL_PATH set, engine starts without a model");
    }

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| BridgeError::IoError {
            message: format!("Failed to bind runtime to {addr}: {e}"),
        })?;
    info!("Mock runtime listening on {addr}");
    axum::serve(listener, create_router(state))
        .await
        .map_err(|e| BridgeError::IoError {
            message: format!("Runtime server error: {e}"),
        })
}

async fn reset_handler(
    State(state): State<RuntimeState>,
    body: Bytes,
) -> std::result::Result<Json<StatusResponse>, ApiError> {
    if state.slot()?.running {
        return Err(api_error(StatusCode::BAD_REQUEST, BridgeError::Busy.to_string()));
    }
    let request: ResetRequest = serde_json::from_slice(&body).unwrap_or_default();
    info!(
        "Resetting with system_prompt len={}",
        request.system_prompt.len()
    );
    if let Ok(mut system) = state.system_prompt.lock() {
        *system = request.system_prompt;
    }
    state
        .engine
        .reset()
        .map_err(|e| api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    Ok(Json(StatusResponse::ok()))
}

async fn generate_handler(
    State(state): State<RuntimeState>,
    body: Bytes,
) -> std::result::Result<Json<StatusResponse>, ApiError> {
    state.ensure_loaded().await?;

    let (generation, request, cancel) = {
        let mut slot = state.slot()?;
        if slot.running {
            return Err(api_error(StatusCode::BAD_REQUEST, BridgeError::Busy.to_string()));
        }
        let request: RuntimeGenerateRequest = serde_json::from_slice(&body)
            .map_err(|_| api_error(StatusCode::BAD_REQUEST, "Invalid request format"))?;

        slot.queue.clear();
        slot.running = true;
        slot.generation += 1;
        slot.cancel = Arc::new(AtomicBool::new(false));
        (slot.generation, request, Arc::clone(&slot.cancel))
    };
    let mut gen_request =
        GenerationRequest::new(state.compose_prompt(&request.prompt), request.max_tokens)
            .with_sampling(request.sampling());
    if let Some(id) = request.request_id {
        gen_request = gen_request.with_request_id(id);
    }
    let request = gen_request;

    info!(
        "REQ {}: starting generation #{generation}, max_tokens={}",
        request.request_id, request.max_tokens
    );
    let engine = Arc::clone(&state.engine);
    let slot = Arc::clone(&state.slot);
    tokio::task::spawn_blocking(move || run_worker(&*engine, &slot, generation, &request, &cancel));

    Ok(Json(StatusResponse::ok()))
}

fn run_worker(
    engine: &dyn InferenceEngine,
    slot: &Mutex<Slot>,
    generation: u64,
    request: &GenerationRequest,
    cancel: &AtomicBool,
) {
    let push = |text: String| {
        if let Ok(mut s) = slot.lock() {
            if s.generation == generation {
                s.queue.push_back(text);
            }
        }
    };

    match engine.generate(request, cancel, &mut |chunk| push(chunk.to_string())) {
        Ok(output) => info!(
            "REQ {}: generation complete, {} chars, stop={:?}",
            request.request_id,
            output.text.len(),
            output.stop_reason
        ),
        Err(e) => {
            error!("REQ {}: generation failed: {e}", request.request_id);
            push(format!("Error: {e}"));
        },
    }

    if let Ok(mut s) = slot.lock() {
        if s.generation == generation {
            s.running = false;
        }
    }
}

async fn provider_handler(
    State(state): State<RuntimeState>,
) -> std::result::Result<Json<ProviderResponse>, ApiError> {
    let mut slot = state.slot()?;
    let response: String = slot.queue.drain(..).collect();
    Ok(Json(ProviderResponse {
        response,
        done: !slot.running,
    }))
}

async fn stop_handler(
    State(state): State<RuntimeState>,
) -> std::result::Result<Json<StatusResponse>, ApiError> {
    let mut slot = state.slot()?;
    if slot.running {
        info!("Stopping generation #{}", slot.generation);
        slot.cancel.store(true, Ordering::Relaxed);
        slot.running = false;
    }
    Ok(Json(StatusResponse::ok()))
}

async fn chat_handler(
    State(state): State<RuntimeState>,
    body: Bytes,
) -> std::result::Result<Json<RuntimeChatResponse>, ApiError> {
    let request: RuntimeChatRequest = serde_json::from_slice(&body)
        .map_err(|_| api_error(StatusCode::BAD_REQUEST, "Invalid request format"))?;
    let Some(last) = request.messages.last() else {
        return Err(api_error(StatusCode::BAD_REQUEST, "Invalid message format"));
    };
    state.ensure_loaded().await?;
    if state.slot()?.running {
        return Err(api_error(StatusCode::BAD_REQUEST, BridgeError::Busy.to_string()));
    }

    let gen_request = GenerationRequest::new(state.compose_prompt(&last.content), DEFAULT_MAX_TOKENS);
    let engine = Arc::clone(&state.engine);
    let output = tokio::task::spawn_blocking(move || {
        let cancel = AtomicBool::new(false);
        engine.generate(&gen_request, &cancel, &mut |_| {})
    })
    .await
    .map_err(|e| api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?
    .map_err(|e| api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;

    Ok(Json(RuntimeChatResponse {
        message: output.text,
        done: true,
    }))
}
