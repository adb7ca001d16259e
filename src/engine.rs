//! Inference engines behind the runtime API
//!
//! The mock runtime serves generation requests through the
//! [`InferenceEngine`] trait. Two engines exist:
//!
//! - [`EchoEngine`]: dummy mode without NPU access; answers `Echo: <prompt>`.
//! - [`DecodeEngine`]: the Qwen3-4B single-token decode loop over per-layer
//!   NPU sessions. Sessions come from a [`SessionFactory`], which is where
//!   vendor bindings plug in.

use std::path::Path;
use std::sync::atomic::AtomicBool;
use std::sync::Mutex;

use half::bf16;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{BridgeError, Result};
use crate::sampling::SamplingParams;

mod decode;

pub use decode::{DecodeConfig, DecodeEngine, DecodeModel};

/// One generation request as seen by an engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationRequest {
    /// Prompt text
    pub prompt: String,
    /// Maximum new tokens
    pub max_tokens: usize,
    /// Sampling parameters
    pub sampling: SamplingParams,
    /// Correlation id used in step logs
    pub request_id: String,
}

impl GenerationRequest {
    /// Request with default sampling and a fresh request id
    #[must_use]
    pub fn new(prompt: impl Into<String>, max_tokens: usize) -> Self {
        Self {
            prompt: prompt.into(),
            max_tokens,
            sampling: SamplingParams::default(),
            request_id: uuid::Uuid::new_v4().to_string(),
        }
    }

    /// Replace the sampling parameters
    #[must_use]
    pub fn with_sampling(mut self, sampling: SamplingParams) -> Self {
        self.sampling = sampling;
        self
    }

    /// Replace the request id
    #[must_use]
    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = request_id.into();
        self
    }
}

/// Why a generation ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// The model produced an end-of-sequence token
    Eos,
    /// `max_tokens` new tokens were produced
    MaxTokens,
    /// The KV cache window filled up
    ContextLimit,
    /// The caller asked to stop
    Cancelled,
    /// Dummy engine echoed the prompt
    Echo,
}

/// Wall-clock breakdown of one generation, in seconds
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GenerationTimings {
    /// Whole generation
    pub total: f64,
    /// Prompt encoding
    pub tokenize: f64,
    /// Embedding lookups
    pub embedding: f64,
    /// Per-layer session calls
    pub layer_runs: f64,
    /// Post head calls
    pub post: f64,
    /// Token sampling
    pub sampling: f64,
    /// Incremental and final detokenisation
    pub detokenize: f64,
    /// Session invocations (layers + post)
    pub npu_calls: usize,
    /// Forward steps (prompt + generated)
    pub steps: usize,
}

/// Result of a finished generation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationOutput {
    /// Generated text, special tokens removed
    pub text: String,
    /// Prompt length in tokens
    pub prompt_tokens: usize,
    /// New tokens emitted
    pub generated_tokens: usize,
    /// Why generation stopped
    pub stop_reason: StopReason,
    /// Timing breakdown
    pub timings: GenerationTimings,
}

/// Engine family
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineKind {
    /// No hardware; echoes prompts
    Dummy,
    /// Layered decode loop over NPU sessions
    Layered,
}

/// Outcome of loading a model directory
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoadReport {
    /// `loaded` or `loaded (dummy)`
    pub status: String,
    /// Model path as given
    pub model: String,
    /// Engine family that loaded it
    pub kind: EngineKind,
    /// Layer sessions opened
    pub layers: usize,
}

/// A text generation backend
pub trait InferenceEngine: Send + Sync {
    /// Engine family
    fn kind(&self) -> EngineKind;

    /// Whether a model is ready to serve
    fn is_loaded(&self) -> bool;

    /// Load the model at `path`
    ///
    /// # Errors
    ///
    /// Returns an error when the directory or any artifact cannot be opened.
    fn load(&self, path: &Path) -> Result<LoadReport>;

    /// Clear per-conversation state
    ///
    /// # Errors
    ///
    /// Returns an error when the device reset fails.
    fn reset(&self) -> Result<()>;

    /// Generate text, calling `sink` with each new piece of text
    ///
    /// `cancel` is checked between steps.
    ///
    /// # Errors
    ///
    /// Returns an error when no model is loaded or a session call fails.
    fn generate(
        &self,
        request: &GenerationRequest,
        cancel: &AtomicBool,
        sink: &mut dyn FnMut(&str),
    ) -> Result<GenerationOutput>;
}

/// Inputs to one transformer layer session
#[derive(Debug, Clone, Copy)]
pub struct LayerInputs<'a> {
    /// Hidden state `[hidden]`
    pub input: &'a [bf16],
    /// K cache window `[window, kv_dim]`
    pub k_cache: &'a [bf16],
    /// V cache window `[window, kv_dim]`
    pub v_cache: &'a [bf16],
    /// Current position
    pub index: u32,
    /// Attention mask `[max_seq_len]`
    pub mask: &'a [bf16],
}

/// Outputs of one transformer layer session
#[derive(Debug, Clone, PartialEq)]
pub struct LayerOutputs {
    /// New K row `[kv_dim]`
    pub k_out: Vec<bf16>,
    /// New V row `[kv_dim]`
    pub v_out: Vec<bf16>,
    /// Next hidden state `[hidden]`
    pub output: Vec<bf16>,
}

/// One compiled transformer layer on the NPU
pub trait LayerSession: Send {
    /// Run the layer for a single token
    ///
    /// # Errors
    ///
    /// Returns an error when the device call fails.
    fn run(&mut self, inputs: &LayerInputs<'_>) -> Result<LayerOutputs>;
}

/// The compiled head mapping a hidden state to vocabulary logits
pub trait PostSession: Send {
    /// Produce logits `[vocab]`
    ///
    /// # Errors
    ///
    /// Returns an error when the device call fails.
    fn run(&mut self, hidden: &[bf16]) -> Result<Vec<f32>>;
}

/// Opens NPU sessions for compiled model files
pub trait SessionFactory: Send + Sync {
    /// Open a per-layer model
    ///
    /// # Errors
    ///
    /// Returns an error when the model cannot be loaded onto the device.
    fn open_layer(&self, path: &Path) -> Result<Box<dyn LayerSession>>;

    /// Open the post head
    ///
    /// # Errors
    ///
    /// Returns an error when the model cannot be loaded onto the device.
    fn open_post(&self, path: &Path) -> Result<Box<dyn PostSession>>;

    /// Reset the accelerator before loading a new model
    ///
    /// # Errors
    ///
    /// Returns an error when the device refuses the reset.
    fn reset_device(&self, _device_id: u32) -> Result<()> {
        Ok(())
    }
}

/// Dummy engine used when no NPU session backend is available
#[derive(Debug, Default)]
pub struct EchoEngine {
    model: Mutex<Option<String>>,
}

impl EchoEngine {
    /// Create an engine with no recorded model
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Model path recorded by the last `load`
    #[must_use]
    pub fn model(&self) -> Option<String> {
        self.model.lock().ok().and_then(|m| m.clone())
    }
}

impl InferenceEngine for EchoEngine {
    fn kind(&self) -> EngineKind {
        EngineKind::Dummy
    }

    fn is_loaded(&self) -> bool {
        true
    }

    fn load(&self, path: &Path) -> Result<LoadReport> {
        let model = path.display().to_string();
        info!("DUMMY mode: recorded model path {model}");
        let mut slot = self
            .model
            .lock()
            .map_err(|_| BridgeError::InferenceError("echo engine lock poisoned".to_string()))?;
        *slot = Some(model.clone());
        Ok(LoadReport {
            status: "loaded (dummy)".to_string(),
            model,
            kind: EngineKind::Dummy,
            layers: 0,
        })
    }

    fn reset(&self) -> Result<()> {
        info!("DUMMY: Resetting device 0");
        Ok(())
    }

    fn generate(
        &self,
        request: &GenerationRequest,
        _cancel: &AtomicBool,
        sink: &mut dyn FnMut(&str),
    ) -> Result<GenerationOutput> {
        info!("REQ {}: DUMMY backend echoing prompt", request.request_id);
        let text = format!("Echo: {}", request.prompt);
        sink(&text);
        Ok(GenerationOutput {
            text,
            prompt_tokens: 0,
            generated_tokens: 0,
            stop_reason: StopReason::Echo,
            timings: GenerationTimings::default(),
        })
    }
}
