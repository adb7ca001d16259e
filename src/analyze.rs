//! Align decode step logs with an NPU utilisation trace
//!
//! The runtime logs one line per decode step:
//!
//! ```text
//! REQ <id>: step=<n> elapsed=<secs>s step_layer_time=<secs>s npu_calls=<n>
//! ```
//!
//! Step times are relative to the start of the generation while the trace
//! is relative to the start of sampling. The two clocks are aligned by
//! assuming the last active trace sample coincides with the last step.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{BridgeError, Result};
use crate::profile::{ACTIVE_THRESHOLD_PCT, GENERATIONS_FILE, TRACE_FILE};

/// Report file written next to the inputs
pub const REPORT_FILE: &str = "analysis_report.csv";

/// Filtered log looked up inside a result directory
pub const FILTERED_LOG_FILE: &str = "backend_logs_filtered.txt";

/// Log used when the result directory has no filtered copy
pub const FALLBACK_LOG_FILE: &str = "/tmp/backend.log";

/// One decode step parsed from the runtime log
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    /// Step index
    pub step: u64,
    /// Seconds since generation start
    pub elapsed_backend: f64,
    /// Seconds spent in layer sessions during this step
    pub layer_time: f64,
    /// Cumulative NPU session calls
    pub npu_calls: u64,
}

/// One row of `npu_trace.csv`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceSample {
    /// Wall clock timestamp
    pub timestamp: String,
    /// Seconds since tracing started
    pub elapsed_s: f64,
    /// NPU percentage, empty when unavailable
    pub npu_pct: Option<f64>,
}

/// Request picked from `generations.jsonl`
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct TracedRequest {
    /// Correlation id
    pub request_id: String,
    /// Client-side wall time in seconds
    pub elapsed_s: f64,
}

/// One row of `analysis_report.csv`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StepReport {
    /// Step index
    pub step: u64,
    /// Seconds since generation start
    pub elapsed_backend: f64,
    /// Layer time of this step
    pub layer_time: f64,
    /// Cumulative NPU calls
    pub npu_calls: u64,
    /// Step end on the trace clock
    pub estimated_trace_time: f64,
    /// Mean NPU percentage between the previous and this step end
    pub npu_avg_pct: f64,
    /// Wall time of this step
    pub step_duration: f64,
    /// Step time not spent in layer sessions
    pub overhead: f64,
}

/// Aggregate figures of an analysis
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnalysisSummary {
    /// Analysed request
    pub request_id: String,
    /// Client-side wall time of the request
    pub request_elapsed_s: f64,
    /// Steps found in the log
    pub steps: usize,
    /// Trace clock minus generation clock
    pub offset_s: f64,
    /// Mean of per-step NPU averages
    pub avg_npu_pct: f64,
    /// Mean step duration
    pub avg_step_duration: f64,
    /// Mean layer time
    pub avg_layer_time: f64,
    /// Mean overhead
    pub avg_overhead: f64,
    /// NPU calls at the last step
    pub total_npu_calls: u64,
    /// Path of the written report
    pub report_file: PathBuf,
}

fn open(path: &Path) -> Result<File> {
    File::open(path).map_err(|e| BridgeError::IoError {
        message: format!("{}: {e}", path.display()),
    })
}

/// Step lines for `request_id` from a log stream
///
/// # Errors
///
/// Returns `IoError` if reading fails.
pub fn parse_step_lines(reader: impl BufRead, request_id: &str) -> Result<Vec<StepRecord>> {
    let pattern = Regex::new(&format!(
        r"REQ {}: step=(\d+) elapsed=([\d.]+)s step_layer_time=([\d.]+)s npu_calls=(\d+)",
        regex::escape(request_id)
    ))
    .map_err(|e| BridgeError::FormatError {
        reason: format!("step pattern: {e}"),
    })?;

    let mut steps = Vec::new();
    for line in reader.lines() {
        let line = line?;
        let Some(caps) = pattern.captures(&line) else {
            continue;
        };
        let field = |i: usize| caps.get(i).map_or("", |m| m.as_str());
        let parsed = (
            field(1).parse(),
            field(2).parse(),
            field(3).parse(),
            field(4).parse(),
        );
        if let (Ok(step), Ok(elapsed_backend), Ok(layer_time), Ok(npu_calls)) = parsed {
            steps.push(StepRecord {
                step,
                elapsed_backend,
                layer_time,
                npu_calls,
            });
        }
    }
    Ok(steps)
}

/// Step lines for `request_id` from a log file
///
/// # Errors
///
/// Returns `IoError` if the file cannot be read.
pub fn parse_backend_log(path: &Path, request_id: &str) -> Result<Vec<StepRecord>> {
    parse_step_lines(BufReader::new(open(path)?), request_id)
}

/// All rows of an NPU trace
///
/// # Errors
///
/// Returns `IoError` if the file cannot be opened, or `FormatError` on a
/// malformed row.
pub fn read_trace(path: &Path) -> Result<Vec<TraceSample>> {
    let mut reader = csv::Reader::from_reader(open(path)?);
    reader
        .deserialize()
        .map(|row| row.map_err(BridgeError::from))
        .collect()
}

/// First record in a generations file that carries a request id
///
/// # Errors
///
/// Returns `IoError` if the file cannot be read.
pub fn first_traced_request(path: &Path) -> Result<Option<TracedRequest>> {
    for line in BufReader::new(open(path)?).lines() {
        let line = line?;
        if let Ok(request) = serde_json::from_str::<TracedRequest>(&line) {
            return Ok(Some(request));
        }
    }
    Ok(None)
}

/// Trace clock minus generation clock
///
/// The last trace sample above [`ACTIVE_THRESHOLD_PCT`] is taken to be the
/// last step; zero when the trace shows no activity.
#[must_use]
pub fn alignment_offset(steps: &[StepRecord], trace: &[TraceSample]) -> f64 {
    let threshold = f64::from(ACTIVE_THRESHOLD_PCT);
    let last_active = trace
        .iter()
        .rev()
        .find(|s| s.npu_pct.is_some_and(|pct| pct > threshold));
    match (last_active, steps.last()) {
        (Some(sample), Some(step)) => sample.elapsed_s - step.elapsed_backend,
        _ => 0.0,
    }
}

fn mean(values: impl Iterator<Item = f64>) -> f64 {
    let (sum, n) = values.fold((0.0, 0usize), |(s, n), v| (s + v, n + 1));
    if n == 0 {
        0.0
    } else {
        sum / n as f64
    }
}

/// Per-step report rows given a clock offset
///
/// Each step's NPU average covers trace samples in
/// `[previous step end, this step end]`, starting from `offset`.
#[must_use]
pub fn align_steps(steps: &[StepRecord], trace: &[TraceSample], offset: f64) -> Vec<StepReport> {
    let mut rows = Vec::with_capacity(steps.len());
    let mut window_start = offset;
    let mut prev_elapsed = None;
    for step in steps {
        let window_end = step.elapsed_backend + offset;
        let npu_avg_pct = mean(
            trace
                .iter()
                .filter(|s| s.elapsed_s >= window_start && s.elapsed_s <= window_end)
                .filter_map(|s| s.npu_pct),
        );
        let step_duration = match prev_elapsed {
            Some(prev) => step.elapsed_backend - prev,
            None => step.elapsed_backend,
        };
        rows.push(StepReport {
            step: step.step,
            elapsed_backend: step.elapsed_backend,
            layer_time: step.layer_time,
            npu_calls: step.npu_calls,
            estimated_trace_time: window_end,
            npu_avg_pct,
            step_duration,
            overhead: step_duration - step.layer_time,
        });
        window_start = window_end;
        prev_elapsed = Some(step.elapsed_backend);
    }
    rows
}

/// Analyse one profile run and write [`REPORT_FILE`] into `out_dir`
///
/// # Errors
///
/// Returns `FormatError` when no traced request or no step lines are
/// found, and `IoError` on unreadable inputs.
pub fn analyze(
    trace_csv: &Path,
    log_file: &Path,
    generations_jsonl: &Path,
    out_dir: &Path,
) -> Result<AnalysisSummary> {
    let request = first_traced_request(generations_jsonl)?.ok_or_else(|| BridgeError::FormatError {
        reason: format!("No request_id found in {}", generations_jsonl.display()),
    })?;
    info!("Analyzing Request ID: {}", request.request_id);

    let steps = parse_backend_log(log_file, &request.request_id)?;
    if steps.is_empty() {
        return Err(BridgeError::FormatError {
            reason: format!("No step logs found for request {}", request.request_id),
        });
    }

    let trace = read_trace(trace_csv)?;
    let offset = alignment_offset(&steps, &trace);
    if offset == 0.0 {
        warn!("No NPU activity found in trace; assuming zero offset");
    } else {
        info!("Estimated offset (trace end - backend end): {offset:.4}s");
    }

    let rows = align_steps(&steps, &trace, offset);
    let report_file = out_dir.join(REPORT_FILE);
    let mut writer = csv::Writer::from_path(&report_file)?;
    for row in &rows {
        writer.serialize(row)?;
    }
    writer.flush()?;
    info!("Report saved to {}", report_file.display());

    Ok(AnalysisSummary {
        request_id: request.request_id,
        request_elapsed_s: request.elapsed_s,
        steps: rows.len(),
        offset_s: offset,
        avg_npu_pct: mean(rows.iter().map(|r| r.npu_avg_pct)),
        avg_step_duration: mean(rows.iter().map(|r| r.step_duration)),
        avg_layer_time: mean(rows.iter().map(|r| r.layer_time)),
        avg_overhead: mean(rows.iter().map(|r| r.overhead)),
        total_npu_calls: rows.last().map_or(0, |r| r.npu_calls),
        report_file,
    })
}

/// Analyse a profile result directory
///
/// Without an explicit log the directory's [`FILTERED_LOG_FILE`] is used,
/// then [`FALLBACK_LOG_FILE`].
///
/// # Errors
///
/// See [`analyze`].
pub fn analyze_dir(result_dir: &Path, log_file: Option<&Path>) -> Result<AnalysisSummary> {
    let log = match log_file {
        Some(path) => path.to_path_buf(),
        None => {
            let filtered = result_dir.join(FILTERED_LOG_FILE);
            if filtered.exists() {
                filtered
            } else {
                PathBuf::from(FALLBACK_LOG_FILE)
            }
        },
    };
    analyze(
        &result_dir.join(TRACE_FILE),
        &log,
        &result_dir.join(GENERATIONS_FILE),
        result_dir,
    )
}

#[cfg(test)]
mod tests;
