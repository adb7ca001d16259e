//! Proxy metrics in Prometheus text format
//!
//! Counters are plain atomics shared between handlers; `/metrics` renders a
//! snapshot.

use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Shared counters for the proxy
#[derive(Debug, Clone)]
pub struct MetricsCollector {
    inner: Arc<Counters>,
    start_time: Instant,
}

#[derive(Debug, Default)]
struct Counters {
    requests: AtomicUsize,
    successes: AtomicUsize,
    failures: AtomicUsize,
    timeouts: AtomicUsize,
    generated_chars: AtomicUsize,
    generated_tokens: AtomicUsize,
    generation_time_us: AtomicU64,
    runtime_starts: AtomicUsize,
    runtime_start_failures: AtomicUsize,
}

impl MetricsCollector {
    /// Fresh collector
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Counters::default()),
            start_time: Instant::now(),
        }
    }

    /// A generation finished; `tokens` is the estimated token count
    #[allow(clippy::cast_possible_truncation)]
    pub fn record_success(&self, chars: usize, tokens: usize, duration: Duration, timed_out: bool) {
        let c = &self.inner;
        c.requests.fetch_add(1, Ordering::Relaxed);
        c.successes.fetch_add(1, Ordering::Relaxed);
        if timed_out {
            c.timeouts.fetch_add(1, Ordering::Relaxed);
        }
        c.generated_chars.fetch_add(chars, Ordering::Relaxed);
        c.generated_tokens.fetch_add(tokens, Ordering::Relaxed);
        c.generation_time_us
            .fetch_add(duration.as_micros() as u64, Ordering::Relaxed);
    }

    /// A generation failed before producing a reply
    pub fn record_failure(&self) {
        self.inner.requests.fetch_add(1, Ordering::Relaxed);
        self.inner.failures.fetch_add(1, Ordering::Relaxed);
    }

    /// A runtime (re)start was attempted
    pub fn record_runtime_start(&self, ok: bool) {
        self.inner.runtime_starts.fetch_add(1, Ordering::Relaxed);
        if !ok {
            self.inner.runtime_start_failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Point-in-time copy of the counters
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn snapshot(&self) -> MetricsSnapshot {
        let c = &self.inner;
        let successes = c.successes.load(Ordering::Relaxed);
        let generation_time_us = c.generation_time_us.load(Ordering::Relaxed);
        MetricsSnapshot {
            requests: c.requests.load(Ordering::Relaxed),
            successes,
            failures: c.failures.load(Ordering::Relaxed),
            timeouts: c.timeouts.load(Ordering::Relaxed),
            generated_chars: c.generated_chars.load(Ordering::Relaxed),
            generated_tokens: c.generated_tokens.load(Ordering::Relaxed),
            generation_seconds: generation_time_us as f64 / 1_000_000.0,
            avg_latency_ms: if successes > 0 {
                generation_time_us as f64 / 1000.0 / successes as f64
            } else {
                0.0
            },
            runtime_starts: c.runtime_starts.load(Ordering::Relaxed),
            runtime_start_failures: c.runtime_start_failures.load(Ordering::Relaxed),
            uptime_secs: self.start_time.elapsed().as_secs(),
        }
    }

    /// Render every metric in Prometheus exposition format
    #[must_use]
    pub fn to_prometheus(&self) -> String {
        let s = self.snapshot();
        let mut out = String::new();
        let counters: [(&str, &str, String); 9] = [
            ("requests_total", "Generation requests received", s.requests.to_string()),
            ("requests_successful", "Generations that returned text", s.successes.to_string()),
            ("requests_failed", "Generations that failed", s.failures.to_string()),
            ("generation_timeouts", "Generations cut off by the deadline", s.timeouts.to_string()),
            ("generated_chars", "Characters returned to clients", s.generated_chars.to_string()),
            ("generated_tokens", "Estimated tokens returned to clients", s.generated_tokens.to_string()),
            ("generation_seconds", "Wall time spent generating", format!("{:.6}", s.generation_seconds)),
            ("runtime_starts", "Runtime launch attempts", s.runtime_starts.to_string()),
            ("runtime_start_failures", "Runtime launches that failed", s.runtime_start_failures.to_string()),
        ];
        for (name, help, value) in counters {
            let _ = writeln!(out, "# HELP axbridge_{name} {help}");
            let _ = writeln!(out, "# TYPE axbridge_{name} counter");
            let _ = writeln!(out, "axbridge_{name} {value}");
        }
        let _ = writeln!(out, "# HELP axbridge_avg_latency_ms Mean generation latency");
        let _ = writeln!(out, "# TYPE axbridge_avg_latency_ms gauge");
        let _ = writeln!(out, "axbridge_avg_latency_ms {:.2}", s.avg_latency_ms);
        let _ = writeln!(out, "# HELP axbridge_uptime_seconds Proxy uptime");
        let _ = writeln!(out, "# TYPE axbridge_uptime_seconds counter");
        let _ = writeln!(out, "axbridge_uptime_seconds {}", s.uptime_secs);
        out
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

/// Counter values at one instant
#[derive(Debug, Clone, PartialEq)]
pub struct MetricsSnapshot {
    /// Generation requests
    pub requests: usize,
    /// Successful generations
    pub successes: usize,
    /// Failed generations
    pub failures: usize,
    /// Successful generations that hit the deadline
    pub timeouts: usize,
    /// Characters returned
    pub generated_chars: usize,
    /// Estimated tokens returned
    pub generated_tokens: usize,
    /// Total generation wall time
    pub generation_seconds: f64,
    /// Mean latency of successful generations
    pub avg_latency_ms: f64,
    /// Runtime launch attempts
    pub runtime_starts: usize,
    /// Failed runtime launches
    pub runtime_start_failures: usize,
    /// Seconds since the collector was created
    pub uptime_secs: u64,
}
