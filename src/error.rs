//! Error types for axbridge
//!
//! A single error enum covers the proxy, the runtime protocol, process
//! supervision, the decode loop and the profiling tools.

use thiserror::Error;

/// Result type alias for axbridge operations
pub type Result<T> = std::result::Result<T, BridgeError>;

/// Error type for all axbridge operations
#[derive(Debug, Error)]
pub enum BridgeError {
    /// Configuration value could not be parsed or is out of range
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// HTTP transport failure talking to the runtime or backend
    #[error("Connection error: {0}")]
    ConnectionError(String),

    /// The runtime answered with an error payload
    #[error("Runtime error ({status}): {message}")]
    RuntimeError {
        /// HTTP status returned by the runtime
        status: u16,
        /// Error message from the runtime body
        message: String,
    },

    /// No runtime process is available to serve the request
    #[error("Runtime unavailable: {0}")]
    RuntimeUnavailable(String),

    /// The runtime process exited before it became ready
    #[error("Runtime exited early with code {code:?}: {stderr}")]
    RuntimeExited {
        /// Exit code, if the process exited normally
        code: Option<i32>,
        /// Tail of the process stderr
        stderr: String,
    },

    /// The runtime never answered its liveness ping
    #[error("Runtime failed to start after {attempts} attempts")]
    StartupTimeout {
        /// Number of liveness probes attempted
        attempts: u32,
    },

    /// A generation is already in progress
    #[error("llm is running")]
    Busy,

    /// No model has been loaded into the engine
    #[error("Model not init")]
    ModelNotLoaded,

    /// Model directory or file does not exist
    #[error("Model path not found: {0}")]
    ModelNotFound(String),

    /// Malformed file or payload
    #[error("Format error: {reason}")]
    FormatError {
        /// Description of the malformed input
        reason: String,
    },

    /// Tensor dimensions did not match what the model expects
    #[error("Invalid shape: {reason}")]
    InvalidShape {
        /// Description of the mismatch
        reason: String,
    },

    /// Position exceeded the KV cache window
    #[error("Context limit exceeded: position {position} >= window {window}")]
    ContextLimitExceeded {
        /// Requested cache position
        position: usize,
        /// Usable cache window
        window: usize,
    },

    /// Failure inside the decode loop or a layer session
    #[error("Inference error: {0}")]
    InferenceError(String),

    /// Tokenizer could not be loaded or failed to encode/decode
    #[error("Tokenizer error: {0}")]
    TokenizerError(String),

    /// Filesystem or process I/O failure
    #[error("I/O error: {message}")]
    IoError {
        /// Description including the failing path or operation
        message: String,
    },
}

impl From<std::io::Error> for BridgeError {
    fn from(err: std::io::Error) -> Self {
        Self::IoError {
            message: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for BridgeError {
    fn from(err: serde_json::Error) -> Self {
        Self::FormatError {
            reason: err.to_string(),
        }
    }
}

impl From<csv::Error> for BridgeError {
    fn from(err: csv::Error) -> Self {
        Self::FormatError {
            reason: format!("CSV: {err}"),
        }
    }
}
