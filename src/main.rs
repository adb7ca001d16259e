//! axbridge CLI - Ollama-compatible bridge for AX650 NPU runtimes
//!
//! # Commands
//!
//! - `serve` - Start the proxy and supervise the runtime
//! - `runtime` - Run the mock runtime server
//! - `generate` - Send one prompt to a running proxy
//! - `profile` - Trace NPU usage while running prompts
//! - `analyze` - Align step logs with an NPU trace
//! - `verify-npu` - Check that an inference drives the NPU
//! - `info` - Show version info

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axbridge::{
    adapter::BackendAdapter,
    analyze,
    config::{self, BridgeConfig, DEFAULT_RUNTIME_PORT},
    engine::EchoEngine,
    error::{BridgeError, Result},
    mock_runtime::{self, RuntimeState},
    profile::{self, ProfileConfig, SmiProbe},
    proxy,
};
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// axbridge - Ollama-compatible bridge for AX650/LLM8850 NPU runtimes
#[derive(Parser)]
#[command(name = "axbridge")]
#[command(version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the Ollama-facing proxy and launch the runtime
    ///
    /// Uses `main_api_ax650` from the runtime directory when present, the
    /// built-in mock runtime otherwise.
    Serve {
        /// Host to bind to
        #[arg(short = 'H', long, default_value = "0.0.0.0")]
        host: String,

        /// Port to bind to (default: AX650_PORT or 5002)
        #[arg(short, long)]
        port: Option<u16>,

        /// Model directory handed to the runtime (default: AX650_MODEL_PATH)
        #[arg(short, long)]
        model: Option<PathBuf>,

        /// Directory holding main_api_ax650
        #[arg(long)]
        runtime_dir: Option<PathBuf>,

        /// Runtime port
        #[arg(long, default_value_t = DEFAULT_RUNTIME_PORT)]
        runtime_port: u16,

        /// Explicit runtime command line, split on whitespace
        #[arg(long)]
        runtime_command: Option<String>,

        /// Model name reported on /api/tags
        #[arg(long)]
        model_name: Option<String>,

        /// Provider poll interval in milliseconds
        #[arg(long, default_value = "50")]
        poll_ms: u64,

        /// Generation deadline in seconds
        #[arg(long, default_value = "120")]
        deadline_secs: u64,
    },
    /// Run the mock runtime server
    Runtime {
        /// Host to bind to
        #[arg(short = 'H', long, default_value = "0.0.0.0")]
        host: String,

        /// Port to bind to
        #[arg(short, long, env = "AX650_PORT", default_value_t = DEFAULT_RUNTIME_PORT)]
        port: u16,

        /// Model directory loaded at startup
        #[arg(short, long, env = "AX650_MODEL_PATH")]
        model: Option<PathBuf>,
    },
    /// Send one prompt to a running proxy and print the reply
    Generate {
        /// Prompt text
        #[arg(value_name = "PROMPT")]
        prompt: String,

        /// Maximum tokens to generate
        #[arg(short = 'n', long, default_value = "256")]
        max_tokens: usize,

        /// Proxy URL (default: AX650_BACKEND_URL or http://localhost:5002)
        #[arg(long)]
        backend_url: Option<String>,
    },
    /// Trace NPU utilisation while sending prompts to the proxy
    Profile {
        /// File with one prompt per line
        #[arg(long)]
        prompts_file: PathBuf,

        /// Proxy URL (default: AX650_BACKEND_URL or http://localhost:5002)
        #[arg(long)]
        backend_url: Option<String>,

        /// Parent directory for the timestamped results
        #[arg(long, default_value = "performance_evaluation/results/npu_profile")]
        out_dir: PathBuf,

        /// Sampling interval in seconds
        #[arg(long, default_value = "0.1")]
        interval: f64,

        /// Maximum trace length in seconds
        #[arg(long, default_value = "20")]
        duration: f64,
    },
    /// Align decode step logs with an NPU trace
    Analyze {
        /// Profile result directory
        #[arg(value_name = "RESULT_DIR")]
        result_dir: PathBuf,

        /// Runtime log (default: backend_logs_filtered.txt, then /tmp/backend.log)
        #[arg(long)]
        log: Option<PathBuf>,
    },
    /// Run one inference and report whether the NPU became active
    VerifyNpu {
        /// Proxy URL (default: AX650_BACKEND_URL or http://localhost:5002)
        #[arg(long)]
        backend_url: Option<String>,

        /// Monitoring window in seconds
        #[arg(long, default_value = "15")]
        window: f64,
    },
    /// Show version and configuration info
    Info,
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn seconds(value: f64, flag: &str) -> Result<Duration> {
    Duration::try_from_secs_f64(value)
        .map_err(|e| BridgeError::InvalidConfiguration(format!("--{flag} {value}: {e}")))
}

fn adapter(backend_url: Option<String>, timeout: Duration) -> Result<BackendAdapter> {
    BackendAdapter::new(
        backend_url.unwrap_or_else(config::backend_url_from_env),
        timeout,
    )
}

/// Run blocking HTTP work off the async runtime
async fn blocking<T: Send + 'static>(f: impl FnOnce() -> Result<T> + Send + 'static) -> Result<T> {
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| BridgeError::IoError {
            message: format!("blocking task failed: {e}"),
        })?
}

fn print_json(value: &impl serde::Serialize) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing();

    match cli.command {
        Commands::Serve {
            host,
            port,
            model,
            runtime_dir,
            runtime_port,
            runtime_command,
            model_name,
            poll_ms,
            deadline_secs,
        } => {
            let mut config = BridgeConfig::from_env()?
                .with_proxy_host(host)
                .with_runtime_port(runtime_port)
                .with_poll_interval(Duration::from_millis(poll_ms))
                .with_generation_deadline(Duration::from_secs(deadline_secs));
            if let Some(port) = port {
                config = config.with_proxy_port(port);
            }
            if let Some(model) = model {
                config = config.with_model_path(model);
            }
            if let Some(dir) = runtime_dir {
                config = config.with_runtime_dir(dir);
            }
            if let Some(command) = runtime_command {
                config = config.with_runtime_command(
                    command.split_whitespace().map(str::to_string).collect(),
                );
            }
            if let Some(name) = model_name {
                config = config.with_model_name(name);
            }
            proxy::serve(config).await?;
        },
        Commands::Runtime { host, port, model } => {
            let addr: SocketAddr = format!("{host}:{port}").parse().map_err(|e| {
                BridgeError::InvalidConfiguration(format!("listen address {host}:{port}: {e}"))
            })?;
            if model.is_some() {
                warn!("No NPU session backend linked; serving the echo engine");
            }
            let state = RuntimeState::new(Arc::new(EchoEngine::new())).with_autoload(model);
            mock_runtime::serve(state, addr).await?;
        },
        Commands::Generate {
            prompt,
            max_tokens,
            backend_url,
        } => {
            let text = blocking(move || {
                adapter(backend_url, axbridge::adapter::DEFAULT_TIMEOUT)?.generate(&prompt, max_tokens)
            })
            .await?;
            println!("{text}");
        },
        Commands::Profile {
            prompts_file,
            backend_url,
            out_dir,
            interval,
            duration,
        } => {
            let prompts = profile::read_prompts(&prompts_file)?;
            let config = ProfileConfig {
                backend_url: backend_url.unwrap_or_else(config::backend_url_from_env),
                out_dir,
                interval: seconds(interval, "interval")?,
                duration: seconds(duration, "duration")?,
                prompts_file: Some(prompts_file),
                ..ProfileConfig::default()
            };
            info!("Profiling {} prompts against {}", prompts.len(), config.backend_url);
            let summary =
                blocking(move || profile::run_profile(&config, &prompts, SmiProbe::new())).await?;
            print_json(&summary)?;
        },
        Commands::Analyze { result_dir, log } => {
            let summary = analyze::analyze_dir(&result_dir, log.as_deref())?;
            println!("--- Analysis Summary ---");
            println!("Avg NPU Utilization: {:.2}%", summary.avg_npu_pct);
            println!("Avg Step Duration: {:.4}s", summary.avg_step_duration);
            println!("Avg Layer Time: {:.4}s", summary.avg_layer_time);
            println!("Avg Overhead: {:.4}s", summary.avg_overhead);
            println!("Total NPU Calls: {}", summary.total_npu_calls);
        },
        Commands::VerifyNpu {
            backend_url,
            window,
        } => {
            let window = seconds(window, "window")?;
            let activity = blocking(move || {
                let adapter = adapter(backend_url, Duration::from_secs(60))?;
                profile::verify_npu_activity(
                    &adapter,
                    SmiProbe::new(),
                    window,
                    Duration::from_millis(100),
                    Duration::from_secs(1),
                )
            })
            .await?;
            println!("Peak NPU Usage: {}%", activity.peak_pct);
            println!(
                "Samples with activity: {}/{}",
                activity.active_samples, activity.samples
            );
            if activity.detected() {
                println!("SUCCESS: NPU activity detected!");
            } else {
                println!("WARNING: No NPU activity detected (or sampling missed it).");
            }
        },
        Commands::Info => print_info(),
    }

    Ok(())
}

fn print_info() {
    println!("axbridge v{}", axbridge::VERSION);
    println!("Ollama-compatible bridge for AX650/LLM8850 NPU runtimes");
    println!();
    println!("Environment:");
    for key in [config::ENV_PORT, config::ENV_MODEL_PATH, config::ENV_BACKEND_URL] {
        let value = std::env::var(key).unwrap_or_else(|_| "(unset)".to_string());
        println!("  {key} = {value}");
    }
    println!();
    println!("Runtime protocol: /api/reset, /api/generate, /api/generate_provider, /api/stop, /api/chat");
    println!("Ollama endpoints: /api/tags, /api/version, /api/generate, /api/chat");
}
