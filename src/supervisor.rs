//! Runtime child-process supervision
//!
//! The proxy owns one runtime process. It prefers the vendor
//! `main_api_ax650` binary and falls back to this executable's own
//! `runtime` subcommand (the mock runtime) when the binary is missing or is
//! only a Git LFS pointer.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex};

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tracing::{error, info, warn};

use crate::config::{BridgeConfig, ENV_MODEL_PATH, ENV_PORT};
use crate::error::{BridgeError, Result};
use crate::runtime_client::RuntimeClient;

/// File name of the vendor runtime
pub const VENDOR_BINARY: &str = "main_api_ax650";

/// Files at or below this size are treated as LFS pointers, not binaries
pub const LFS_POINTER_MAX_BYTES: u64 = 2000;

const STDERR_TAIL_LINES: usize = 20;

/// How the runtime process is launched
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LaunchPlan {
    /// The vendor binary
    Vendor(PathBuf),
    /// This executable's `runtime` subcommand
    Mock {
        /// Path of the running executable
        program: PathBuf,
        /// Arguments after the program
        args: Vec<String>,
    },
    /// Explicit command line from configuration
    Custom(Vec<String>),
}

impl LaunchPlan {
    /// Pick a launch plan for `config`
    ///
    /// # Errors
    ///
    /// Returns `IoError` when the mock runtime is needed and the current
    /// executable path cannot be determined.
    pub fn detect(config: &BridgeConfig) -> Result<Self> {
        if let Some(command) = &config.runtime_command {
            return Ok(Self::Custom(command.clone()));
        }
        let vendor = config.runtime_dir.join(VENDOR_BINARY);
        if is_real_binary(&vendor) {
            return Ok(Self::Vendor(vendor));
        }
        let program = std::env::current_exe().map_err(|e| BridgeError::IoError {
            message: format!("Cannot locate current executable: {e}"),
        })?;
        Ok(Self::Mock {
            program,
            args: vec![
                "runtime".to_string(),
                "--host".to_string(),
                config.runtime_host.clone(),
                "--port".to_string(),
                config.runtime_port.to_string(),
            ],
        })
    }

    /// Human-readable label for logs
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Self::Vendor(_) => "REAL",
            Self::Mock { .. } => "MOCK",
            Self::Custom(_) => "CUSTOM",
        }
    }

    fn program_and_args(&self) -> Result<(PathBuf, Vec<String>)> {
        match self {
            Self::Vendor(path) => Ok((path.clone(), Vec::new())),
            Self::Mock { program, args } => Ok((program.clone(), args.clone())),
            Self::Custom(command) => {
                let (program, args) = command.split_first().ok_or_else(|| {
                    BridgeError::InvalidConfiguration("runtime command is empty".to_string())
                })?;
                Ok((PathBuf::from(program), args.to_vec()))
            },
        }
    }
}

/// Whether `path` is an executable larger than an LFS pointer
#[must_use]
pub fn is_real_binary(path: &Path) -> bool {
    let Ok(meta) = std::fs::metadata(path) else {
        return false;
    };
    meta.is_file() && is_executable(&meta) && meta.len() > LFS_POINTER_MAX_BYTES
}

#[cfg(unix)]
fn is_executable(meta: &std::fs::Metadata) -> bool {
    use std::os::unix::fs::PermissionsExt;
    meta.permissions().mode() & 0o111 != 0
}

#[cfg(not(unix))]
fn is_executable(_meta: &std::fs::Metadata) -> bool {
    true
}

/// Owner of the runtime child process
#[derive(Debug)]
pub struct Supervisor {
    config: BridgeConfig,
    client: RuntimeClient,
    child: Option<Child>,
    model_path: Option<PathBuf>,
    stderr_tail: Arc<Mutex<VecDeque<String>>>,
}

impl Supervisor {
    /// Supervisor with no child yet; the model path starts from `config`
    ///
    /// # Errors
    ///
    /// Returns `ConnectionError` if the runtime HTTP client cannot be built.
    pub fn new(config: BridgeConfig) -> Result<Self> {
        let client = RuntimeClient::from_config(&config)?;
        Ok(Self {
            model_path: config.model_path.clone(),
            config,
            client,
            child: None,
            stderr_tail: Arc::new(Mutex::new(VecDeque::new())),
        })
    }

    /// Model path handed to the runtime
    #[must_use]
    pub fn current_model(&self) -> Option<&Path> {
        self.model_path.as_deref()
    }

    /// Whether the child process is still alive
    pub fn is_running(&mut self) -> bool {
        match self.child.as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }

    /// (Re)start the runtime, optionally switching model
    ///
    /// Waits until the runtime answers its liveness ping.
    ///
    /// # Errors
    ///
    /// Returns `IoError` if the process cannot be spawned, `RuntimeExited`
    /// if it dies during startup, or `StartupTimeout` if it never answers.
    pub async fn start(&mut self, model_path: Option<PathBuf>) -> Result<()> {
        if self.child.is_some() {
            self.stop().await;
        }
        if model_path.is_some() {
            self.model_path = model_path;
        }

        let plan = LaunchPlan::detect(&self.config)?;
        let (program, args) = plan.program_and_args()?;
        info!("Launching {} runtime: {}", plan.label(), program.display());

        let mut command = Command::new(&program);
        command
            .args(&args)
            .env(ENV_PORT, self.config.runtime_port.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if self.config.runtime_dir.is_dir() {
            command.current_dir(&self.config.runtime_dir);
        }
        match &self.model_path {
            Some(path) => command.env(ENV_MODEL_PATH, path),
            None => command.env_remove(ENV_MODEL_PATH),
        };

        let mut child = command.spawn().map_err(|e| BridgeError::IoError {
            message: format!("Failed to launch runtime {}: {e}", program.display()),
        })?;
        if let Ok(mut tail) = self.stderr_tail.lock() {
            tail.clear();
        }
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_lines(stdout, None));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_lines(stderr, Some(Arc::clone(&self.stderr_tail))));
        }
        self.child = Some(child);

        info!("Waiting for runtime to initialize...");
        for _ in 0..self.config.startup_attempts {
            if let Some(child) = self.child.as_mut() {
                if let Some(status) = child.try_wait()? {
                    // let the stderr reader catch up before reporting
                    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
                    self.child = None;
                    let stderr = self.stderr_tail();
                    error!("Runtime exited early with code {:?}", status.code());
                    return Err(BridgeError::RuntimeExited {
                        code: status.code(),
                        stderr,
                    });
                }
            }
            if self.client.ping().await {
                info!("Runtime is up and responding!");
                return Ok(());
            }
            tokio::time::sleep(self.config.startup_interval).await;
        }

        error!("Runtime failed to start (timeout)");
        self.stop().await;
        Err(BridgeError::StartupTimeout {
            attempts: self.config.startup_attempts,
        })
    }

    /// Terminate the child: SIGTERM, then kill after the grace period
    pub async fn stop(&mut self) {
        let Some(mut child) = self.child.take() else {
            return;
        };
        info!("Stopping runtime...");
        terminate(&mut child);
        match tokio::time::timeout(self.config.stop_grace, child.wait()).await {
            Ok(Ok(status)) => info!("Runtime exited with {status}"),
            Ok(Err(e)) => warn!("Waiting for runtime failed: {e}"),
            Err(_) => {
                warn!("Runtime did not exit gracefully, killing...");
                if let Err(e) = child.kill().await {
                    error!("Failed to kill runtime: {e}");
                }
            },
        }
    }

    /// Last lines the runtime wrote to stderr
    #[must_use]
    pub fn stderr_tail(&self) -> String {
        self.stderr_tail
            .lock()
            .map(|t| t.iter().cloned().collect::<Vec<_>>().join("\n"))
            .unwrap_or_default()
    }
}

#[cfg(unix)]
fn terminate(child: &mut Child) {
    match child.id().and_then(|pid| libc::pid_t::try_from(pid).ok()) {
        Some(pid) => {
            // SAFETY: kill(2) has no memory-safety preconditions; pid is our own child
            let rc = unsafe { libc::kill(pid, libc::SIGTERM) };
            if rc != 0 {
                warn!("SIGTERM to runtime pid {pid} failed");
            }
        },
        None => {
            let _ = child.start_kill();
        },
    }
}

#[cfg(not(unix))]
fn terminate(child: &mut Child) {
    let _ = child.start_kill();
}

async fn forward_lines<R>(stream: R, tail: Option<Arc<Mutex<VecDeque<String>>>>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let mut lines = BufReader::new(stream).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        match &tail {
            Some(tail) => {
                info!(target: "axbridge::runtime", "{line}");
                if let Ok(mut tail) = tail.lock() {
                    if tail.len() == STDERR_TAIL_LINES {
                        tail.pop_front();
                    }
                    tail.push_back(line);
                }
            },
            None => info!(target: "axbridge::runtime", "{line}"),
        }
    }
}
