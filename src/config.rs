//! Bridge configuration
//!
//! Values are layered: compiled defaults, then `AX650_*` environment
//! variables, then CLI flags applied through the `with_*` builders.

use std::path::PathBuf;
use std::time::Duration;

use crate::error::{BridgeError, Result};

/// Environment variable selecting the listen port
pub const ENV_PORT: &str = "AX650_PORT";
/// Environment variable naming the model directory
pub const ENV_MODEL_PATH: &str = "AX650_MODEL_PATH";
/// Environment variable naming the proxy URL used by the adapter
pub const ENV_BACKEND_URL: &str = "AX650_BACKEND_URL";

/// Default proxy listen port
pub const DEFAULT_PROXY_PORT: u16 = 5002;
/// Default runtime listen port (matches `main_api_ax650`)
pub const DEFAULT_RUNTIME_PORT: u16 = 8000;
/// Model name advertised to Ollama clients
pub const DEFAULT_MODEL_NAME: &str = "qwen3-ax650";

/// Configuration shared by the proxy, the supervisor and the runtime client
#[derive(Debug, Clone, PartialEq)]
pub struct BridgeConfig {
    /// Address the proxy binds to
    pub proxy_host: String,
    /// Port the proxy binds to
    pub proxy_port: u16,
    /// Host the runtime listens on
    pub runtime_host: String,
    /// Port the runtime listens on
    pub runtime_port: u16,
    /// Directory searched for the `main_api_ax650` binary
    pub runtime_dir: PathBuf,
    /// Explicit runtime command line, bypassing binary detection
    pub runtime_command: Option<Vec<String>>,
    /// Model directory handed to the runtime
    pub model_path: Option<PathBuf>,
    /// Name of the model in the Ollama API
    pub model_name: String,
    /// Delay between provider polls
    pub poll_interval: Duration,
    /// Upper bound on one generation
    pub generation_deadline: Duration,
    /// Timeout for reset/generate/poll requests
    pub request_timeout: Duration,
    /// Timeout for the liveness ping
    pub ping_timeout: Duration,
    /// Liveness probes before giving up on a starting runtime
    pub startup_attempts: u32,
    /// Delay between liveness probes
    pub startup_interval: Duration,
    /// Time allowed for SIGTERM before the runtime is killed
    pub stop_grace: Duration,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            proxy_host: "0.0.0.0".to_string(),
            proxy_port: DEFAULT_PROXY_PORT,
            runtime_host: "127.0.0.1".to_string(),
            runtime_port: DEFAULT_RUNTIME_PORT,
            runtime_dir: PathBuf::from("."),
            runtime_command: None,
            model_path: None,
            model_name: DEFAULT_MODEL_NAME.to_string(),
            poll_interval: Duration::from_millis(50),
            generation_deadline: Duration::from_secs(120),
            request_timeout: Duration::from_secs(5),
            ping_timeout: Duration::from_millis(500),
            startup_attempts: 20,
            startup_interval: Duration::from_millis(500),
            stop_grace: Duration::from_secs(5),
        }
    }
}

impl BridgeConfig {
    /// Build a configuration from defaults plus `AX650_*` environment variables
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfiguration` if `AX650_PORT` is not a valid port.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        if let Some(port) = env_port()? {
            config.proxy_port = port;
        }
        if let Some(path) = env_non_empty(ENV_MODEL_PATH) {
            config.model_path = Some(PathBuf::from(path));
        }
        Ok(config)
    }

    /// Base URL of the runtime HTTP API
    #[must_use]
    pub fn runtime_url(&self) -> String {
        format!("http://{}:{}", self.runtime_host, self.runtime_port)
    }

    /// Override the proxy port
    #[must_use]
    pub fn with_proxy_port(mut self, port: u16) -> Self {
        self.proxy_port = port;
        self
    }

    /// Override the proxy bind address
    #[must_use]
    pub fn with_proxy_host(mut self, host: impl Into<String>) -> Self {
        self.proxy_host = host.into();
        self
    }

    /// Override the runtime port
    #[must_use]
    pub fn with_runtime_port(mut self, port: u16) -> Self {
        self.runtime_port = port;
        self
    }

    /// Override the runtime binary directory
    #[must_use]
    pub fn with_runtime_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.runtime_dir = dir.into();
        self
    }

    /// Set an explicit runtime command line
    #[must_use]
    pub fn with_runtime_command(mut self, command: Vec<String>) -> Self {
        self.runtime_command = if command.is_empty() {
            None
        } else {
            Some(command)
        };
        self
    }

    /// Set the model directory
    #[must_use]
    pub fn with_model_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.model_path = Some(path.into());
        self
    }

    /// Override the advertised model name
    #[must_use]
    pub fn with_model_name(mut self, name: impl Into<String>) -> Self {
        self.model_name = name.into();
        self
    }

    /// Override the provider poll interval
    #[must_use]
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Override the generation deadline
    #[must_use]
    pub fn with_generation_deadline(mut self, deadline: Duration) -> Self {
        self.generation_deadline = deadline;
        self
    }

    /// Override the startup probe schedule
    #[must_use]
    pub fn with_startup(mut self, attempts: u32, interval: Duration) -> Self {
        self.startup_attempts = attempts;
        self.startup_interval = interval;
        self
    }
}

/// Read `AX650_PORT`, if set
///
/// # Errors
///
/// Returns `InvalidConfiguration` when the value is not a `u16`.
pub fn env_port() -> Result<Option<u16>> {
    match env_non_empty(ENV_PORT) {
        None => Ok(None),
        Some(raw) => raw.trim().parse::<u16>().map(Some).map_err(|e| {
            BridgeError::InvalidConfiguration(format!("{ENV_PORT}={raw:?} is not a port: {e}"))
        }),
    }
}

/// Read `AX650_BACKEND_URL`, falling back to the local proxy
#[must_use]
pub fn backend_url_from_env() -> String {
    env_non_empty(ENV_BACKEND_URL)
        .unwrap_or_else(|| format!("http://localhost:{DEFAULT_PROXY_PORT}"))
}

fn env_non_empty(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}
