//! # axbridge
//!
//! Ollama-compatible HTTP bridge for AX650/LLM8850 NPU text generation.
//!
//! The NPU runtime (`main_api_ax650`) speaks a stateful protocol: reset the
//! conversation, start a generation, then poll for text. axbridge puts a
//! stateless, Ollama-shaped API in front of it, supervises the runtime
//! process, and ships a mock runtime speaking the same protocol for
//! development without hardware.
//!
//! ## Features
//!
//! - **Proxy**: `/generate`, `/load`, `/health`, `/metrics` plus the Ollama
//!   `/api/tags`, `/api/version`, `/api/generate` and `/api/chat` endpoints
//! - **Supervisor**: starts the vendor binary or the mock runtime, probes
//!   readiness, terminates gracefully
//! - **Decode loop**: Qwen3 per-layer KV cache decoding against abstract
//!   layer sessions, with temperature/top-k/top-p sampling
//! - **Profiling**: `axcl-smi` utilisation traces, generation timing
//!   capture and trace/log alignment
//!
//! ## Example
//!
//! ```rust
//! use axbridge::sampling::{Sampler, SamplingParams};
//!
//! let mut sampler = Sampler::new(SamplingParams::greedy()).unwrap();
//! assert_eq!(sampler.sample(&[0.1, 2.0, -1.0]).unwrap(), 1);
//! ```
//!
//! ## Architecture
//!
//! ```text
//! Ollama client ──► proxy ──► runtime_client ──► main_api_ax650 | mock_runtime
//!                    │                                              │
//!                supervisor                                 InferenceEngine
//!                                                         (EchoEngine | DecodeEngine)
//! ```

#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
// Clippy allows (MUST come after deny/warn to override them)
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_precision_loss)] // usize -> f64 for averages is acceptable
#![allow(clippy::cast_possible_truncation)] // u128 -> u64 for durations is safe
#![allow(clippy::must_use_candidate)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::missing_panics_doc)]

/// Blocking client for the proxy's `/generate` endpoint
pub mod adapter;
/// Step log and NPU trace alignment
pub mod analyze;
/// Runtime and proxy configuration
pub mod config;
/// Token embedding table
pub mod embedding;
/// Inference engines and the decode loop
pub mod engine;
/// Error types
pub mod error;
/// KV cache and attention mask
pub mod kv_cache;
/// Request counters
pub mod metrics;
/// Mock runtime server
pub mod mock_runtime;
/// Model directory detection
pub mod model_layout;
/// NPU utilisation profiling
pub mod profile;
/// Ollama-facing proxy
pub mod proxy;
/// Runtime HTTP protocol types
pub mod runtime_api;
/// Runtime HTTP client
pub mod runtime_client;
/// Token sampling
pub mod sampling;
/// Runtime process supervision
pub mod supervisor;
/// Tokenizers
pub mod tokenizer;

#[cfg(test)]
mod test_helpers;

pub use config::BridgeConfig;
pub use engine::{EchoEngine, GenerationRequest, InferenceEngine};
pub use error::{BridgeError, Result};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(VERSION.starts_with("0."));
        assert!(VERSION.contains('.'));
    }
}
