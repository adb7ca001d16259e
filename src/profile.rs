//! NPU utilisation tracing and generation timing capture
//!
//! A profile run samples `axcl-smi` on a background thread while prompts
//! are sent to the proxy one at a time. Everything lands in a timestamped
//! directory:
//!
//! - `npu_trace.csv`: `timestamp,elapsed_s,npu_pct` (empty pct when the
//!   tool is unavailable)
//! - `generations.jsonl`: one record per prompt
//! - `summary.json`: what was run and where the files are

use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use chrono::{SecondsFormat, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::adapter::BackendAdapter;
use crate::error::{BridgeError, Result};

/// Device monitoring tool shipped with the AX650 SDK
pub const SMI_COMMAND: &str = "axcl-smi";

/// Token budget per profiled prompt
pub const PROFILE_MAX_TOKENS: usize = 64;

/// Samples above this percentage count as NPU activity
pub const ACTIVE_THRESHOLD_PCT: u32 = 5;

/// Trace file name inside a profile directory
pub const TRACE_FILE: &str = "npu_trace.csv";
/// Generation records file name inside a profile directory
pub const GENERATIONS_FILE: &str = "generations.jsonl";
/// Summary file name inside a profile directory
pub const SUMMARY_FILE: &str = "summary.json";

/// Prompt used by [`verify_npu_activity`]
pub const VERIFY_PROMPT: &str = "Write a short poem about a robot.";

// ============================================================================
// Sampling
// ============================================================================

fn usage_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"\|\s+\d+%\s+(\d+)%\s+\|").ok())
        .as_ref()
}

/// Extract the NPU percentage from `axcl-smi` output
///
/// The device row looks like `| 2%        27% |`; the second figure is the
/// NPU.
#[must_use]
pub fn parse_npu_usage(text: &str) -> Option<u32> {
    usage_pattern()?
        .captures(text)?
        .get(1)?
        .as_str()
        .parse()
        .ok()
}

/// Source of NPU utilisation samples
pub trait UsageProbe: Send + 'static {
    /// Current NPU percentage, `None` when it cannot be read
    fn sample(&mut self) -> Option<u32>;
}

impl<F> UsageProbe for F
where
    F: FnMut() -> Option<u32> + Send + 'static,
{
    fn sample(&mut self) -> Option<u32> {
        self()
    }
}

/// Probe that runs `axcl-smi` and parses its table
#[derive(Debug, Clone)]
pub struct SmiProbe {
    command: String,
}

impl SmiProbe {
    /// Probe running [`SMI_COMMAND`]
    #[must_use]
    pub fn new() -> Self {
        Self::with_command(SMI_COMMAND)
    }

    /// Probe running another executable with the same output format
    #[must_use]
    pub fn with_command(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
        }
    }
}

impl Default for SmiProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl UsageProbe for SmiProbe {
    fn sample(&mut self) -> Option<u32> {
        let output = Command::new(&self.command).output().ok()?;
        parse_npu_usage(&String::from_utf8_lossy(&output.stdout))
    }
}

// ============================================================================
// Tracer
// ============================================================================

/// Background thread writing NPU samples to CSV
///
/// Sampling ends after `duration` or when [`NpuTracer::stop`] is called,
/// whichever comes first.
#[derive(Debug)]
pub struct NpuTracer {
    stop: Arc<AtomicBool>,
    handle: JoinHandle<Result<usize>>,
}

impl NpuTracer {
    /// Start sampling `probe` every `interval` into `path`
    ///
    /// # Errors
    ///
    /// Returns `IoError` if the CSV file cannot be created.
    pub fn start(
        path: impl AsRef<Path>,
        mut probe: impl UsageProbe,
        interval: Duration,
        duration: Duration,
    ) -> Result<Self> {
        let mut writer = csv::Writer::from_path(path.as_ref())?;
        writer.write_record(["timestamp", "elapsed_s", "npu_pct"])?;
        writer.flush()?;

        let stop = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&stop);
        let handle = std::thread::spawn(move || -> Result<usize> {
            let start = Instant::now();
            let mut samples = 0;
            while !flag.load(Ordering::Relaxed) && start.elapsed() < duration {
                let elapsed = start.elapsed().as_secs_f64();
                let usage = probe.sample();
                writer.write_record([
                    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true),
                    format!("{elapsed:.6}"),
                    usage.map(|u| u.to_string()).unwrap_or_default(),
                ])?;
                writer.flush()?;
                samples += 1;
                std::thread::sleep(interval);
            }
            Ok(samples)
        });
        Ok(Self { stop, handle })
    }

    /// Stop sampling and return the number of rows written
    ///
    /// # Errors
    ///
    /// Returns the sampling thread's write error, or `IoError` if it
    /// panicked.
    pub fn stop(self) -> Result<usize> {
        self.stop.store(true, Ordering::Relaxed);
        self.handle.join().map_err(|_| BridgeError::IoError {
            message: "NPU tracer thread panicked".to_string(),
        })?
    }
}

// ============================================================================
// Generation capture
// ============================================================================

/// One line of `generations.jsonl`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationRecord {
    /// Prompt sent
    pub prompt: String,
    /// HTTP status, `null` on transport failure
    pub status_code: Option<u16>,
    /// Wall time of the request in seconds
    pub elapsed_s: f64,
    /// Generated text on success
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    /// Correlation id reported by the proxy
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    /// Failure description
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl GenerationRecord {
    fn from_result(prompt: &str, elapsed_s: f64, result: Result<crate::proxy::GenerateResponse>) -> Self {
        let mut record = Self {
            prompt: prompt.to_string(),
            status_code: None,
            elapsed_s,
            text: None,
            request_id: None,
            error: None,
        };
        match result {
            Ok(reply) => {
                record.status_code = Some(200);
                record.text = Some(reply.text);
                record.request_id = Some(reply.request_id).filter(|id| !id.is_empty());
            },
            Err(BridgeError::RuntimeError { status, message }) => {
                record.status_code = Some(status);
                record.error = Some(message);
            },
            Err(e) => record.error = Some(e.to_string()),
        }
        record
    }
}

/// Send each prompt through `adapter`, appending one record per line to `out`
///
/// Request failures are recorded, not returned.
///
/// # Errors
///
/// Returns `IoError` if `out` cannot be written.
pub fn run_generations(
    adapter: &BackendAdapter,
    prompts: &[String],
    out: &Path,
) -> Result<Vec<GenerationRecord>> {
    let mut file = BufWriter::new(File::create(out)?);
    let mut records = Vec::with_capacity(prompts.len());
    for prompt in prompts {
        let start = Instant::now();
        let result = adapter.generate_detailed(prompt, PROFILE_MAX_TOKENS);
        let record = GenerationRecord::from_result(prompt, start.elapsed().as_secs_f64(), result);
        info!(
            "prompt {}: status={:?} elapsed={:.3}s",
            records.len(),
            record.status_code,
            record.elapsed_s
        );
        serde_json::to_writer(&mut file, &record)?;
        file.write_all(b"\n")?;
        file.flush()?;
        records.push(record);
    }
    Ok(records)
}

/// Non-empty trimmed lines of a prompts file
///
/// # Errors
///
/// Returns `IoError` if the file cannot be read.
pub fn read_prompts(path: &Path) -> Result<Vec<String>> {
    let file = File::open(path).map_err(|e| BridgeError::IoError {
        message: format!("{}: {e}", path.display()),
    })?;
    let mut prompts = Vec::new();
    for line in BufReader::new(file).lines() {
        let line = line?;
        let trimmed = line.trim();
        if !trimmed.is_empty() {
            prompts.push(trimmed.to_string());
        }
    }
    Ok(prompts)
}

// ============================================================================
// Profile run
// ============================================================================

/// Settings for [`run_profile`]
#[derive(Debug, Clone)]
pub struct ProfileConfig {
    /// Proxy base URL
    pub backend_url: String,
    /// Parent of the timestamped result directory
    pub out_dir: PathBuf,
    /// Trace sampling interval
    pub interval: Duration,
    /// Maximum trace length
    pub duration: Duration,
    /// Pause between tracer start and the first prompt, and after the last
    pub settle: Duration,
    /// Per-request timeout
    pub request_timeout: Duration,
    /// Prompts file, recorded in the summary
    pub prompts_file: Option<PathBuf>,
}

impl Default for ProfileConfig {
    fn default() -> Self {
        Self {
            backend_url: crate::config::backend_url_from_env(),
            out_dir: PathBuf::from("performance_evaluation/results/npu_profile"),
            interval: Duration::from_millis(100),
            duration: Duration::from_secs(20),
            settle: Duration::from_millis(500),
            request_timeout: Duration::from_secs(120),
            prompts_file: None,
        }
    }
}

/// Contents of `summary.json`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProfileSummary {
    /// UTC run timestamp, also the directory name
    pub timestamp: String,
    /// Proxy base URL
    pub backend_url: String,
    /// Number of prompts sent
    pub num_prompts: usize,
    /// Prompts answered with HTTP 200
    pub succeeded: usize,
    /// Rows written to the trace
    pub trace_samples: usize,
    /// Path of `generations.jsonl`
    pub results_file: PathBuf,
    /// Path of `npu_trace.csv`
    pub trace_file: PathBuf,
    /// Prompts file, if one was used
    pub prompts_file: Option<PathBuf>,
}

/// Trace the NPU while running `prompts`, writing a result directory
///
/// Returns the summary; the directory is its `trace_file`'s parent.
///
/// # Errors
///
/// Returns `IoError` if the output directory or files cannot be written,
/// or `ConnectionError` if the HTTP client cannot be built.
pub fn run_profile(
    config: &ProfileConfig,
    prompts: &[String],
    probe: impl UsageProbe,
) -> Result<ProfileSummary> {
    let timestamp = Utc::now().format("%Y%m%dT%H%M%SZ").to_string();
    let dir = config.out_dir.join(&timestamp);
    fs::create_dir_all(&dir)?;
    let trace_file = dir.join(TRACE_FILE);
    let results_file = dir.join(GENERATIONS_FILE);

    let adapter = BackendAdapter::new(config.backend_url.clone(), config.request_timeout)?;
    let tracer = NpuTracer::start(&trace_file, probe, config.interval, config.duration)?;
    std::thread::sleep(config.settle);

    let generations = run_generations(&adapter, prompts, &results_file);

    std::thread::sleep(config.settle);
    let trace_samples = tracer.stop()?;
    let records = generations?;

    let summary = ProfileSummary {
        timestamp,
        backend_url: config.backend_url.clone(),
        num_prompts: prompts.len(),
        succeeded: records.iter().filter(|r| r.status_code == Some(200)).count(),
        trace_samples,
        results_file,
        trace_file,
        prompts_file: config.prompts_file.clone(),
    };
    let summary_path = dir.join(SUMMARY_FILE);
    fs::write(&summary_path, serde_json::to_vec_pretty(&summary)?)?;
    info!("Wrote profile results to {}", dir.display());
    Ok(summary)
}

// ============================================================================
// Activity check
// ============================================================================

/// Result of [`verify_npu_activity`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NpuActivity {
    /// Highest NPU percentage seen
    pub peak_pct: u32,
    /// Samples taken
    pub samples: usize,
    /// Samples with non-zero usage
    pub active_samples: usize,
    /// Length of the generated reply
    pub response_chars: Option<usize>,
    /// Inference failure, if any
    pub error: Option<String>,
}

impl NpuActivity {
    /// Whether any NPU activity was observed
    #[must_use]
    pub fn detected(&self) -> bool {
        self.peak_pct > 0
    }
}

/// Sample the NPU for `window` while one inference runs
///
/// The inference starts `lead` after monitoring begins. Unreadable samples
/// count as zero.
///
/// # Errors
///
/// Returns `IoError` if the monitor thread panicked.
pub fn verify_npu_activity(
    adapter: &BackendAdapter,
    mut probe: impl UsageProbe,
    window: Duration,
    interval: Duration,
    lead: Duration,
) -> Result<NpuActivity> {
    let monitor = std::thread::spawn(move || {
        let start = Instant::now();
        let (mut peak, mut samples, mut active) = (0u32, 0usize, 0usize);
        while start.elapsed() < window {
            let usage = probe.sample().unwrap_or(0);
            peak = peak.max(usage);
            samples += 1;
            if usage > 0 {
                active += 1;
            }
            std::thread::sleep(interval);
        }
        (peak, samples, active)
    });

    std::thread::sleep(lead);
    info!("Starting inference request...");
    let (response_chars, error) = match adapter.generate(VERIFY_PROMPT, PROFILE_MAX_TOKENS) {
        Ok(text) => (Some(text.chars().count()), None),
        Err(e) => {
            warn!("Inference failed: {e}");
            (None, Some(e.to_string()))
        },
    };

    let (peak_pct, samples, active_samples) = monitor.join().map_err(|_| BridgeError::IoError {
        message: "NPU monitor thread panicked".to_string(),
    })?;
    Ok(NpuActivity {
        peak_pct,
        samples,
        active_samples,
        response_chars,
        error,
    })
}

#[cfg(test)]
mod tests;
