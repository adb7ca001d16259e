//! Token sampling over a logits vector
//!
//! The pipeline is temperature, then top-k, then top-p (nucleus), then a
//! multinomial draw from the softmax of whatever survived. A non-positive
//! temperature short-circuits to greedy argmax.
//!
//! ```rust
//! use axbridge::sampling::{Sampler, SamplingParams};
//!
//! let params = SamplingParams::default().with_seed(7);
//! let mut sampler = Sampler::new(params).unwrap();
//! let token = sampler.sample(&[0.1, 3.0, -1.0]).unwrap();
//! assert!(token < 3);
//! ```

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::error::{BridgeError, Result};

/// Sampling parameters for one generation
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SamplingParams {
    /// Logit divisor; `<= 0` selects greedy decoding
    pub temperature: f32,
    /// Keep only the `k` highest logits; `0` disables
    pub top_k: usize,
    /// Nucleus mass threshold in `(0, 1]`; `1.0` disables
    pub top_p: f32,
    /// Seed for reproducible draws
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            temperature: 0.8,
            top_k: 40,
            top_p: 0.9,
            seed: None,
        }
    }
}

impl SamplingParams {
    /// Greedy parameters (always the argmax)
    #[must_use]
    pub fn greedy() -> Self {
        Self {
            temperature: 0.0,
            top_k: 1,
            top_p: 1.0,
            seed: None,
        }
    }

    /// Set the temperature
    #[must_use]
    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    /// Set top-k
    #[must_use]
    pub fn with_top_k(mut self, top_k: usize) -> Self {
        self.top_k = top_k;
        self
    }

    /// Set top-p
    #[must_use]
    pub fn with_top_p(mut self, top_p: f32) -> Self {
        self.top_p = top_p;
        self
    }

    /// Set the RNG seed
    #[must_use]
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Whether these parameters reduce to argmax
    ///
    /// A temperature <= 0 picks the argmax rather than sampling the
    /// unscaled distribution. A `top_p` <= 0 keeps only the top token.
    #[must_use]
    pub fn is_greedy(&self) -> bool {
        self.temperature <= 0.0 || self.top_k == 1 || self.top_p <= 0.0
    }

    /// Check parameter ranges
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfiguration` for a non-finite temperature or a NaN
    /// `top_p`. Out-of-range `top_p` values are accepted: <= 0 keeps the top
    /// token and >= 1 disables nucleus filtering.
    pub fn validate(&self) -> Result<()> {
        if !self.temperature.is_finite() {
            return Err(BridgeError::InvalidConfiguration(format!(
                "temperature must be finite, got {}",
                self.temperature
            )));
        }
        if self.top_p.is_nan() {
            return Err(BridgeError::InvalidConfiguration(
                "top_p must be a number, got NaN".to_string(),
            ));
        }
        Ok(())
    }
}

/// Index of the largest logit; NaN never wins
#[must_use]
pub fn argmax(logits: &[f32]) -> Option<usize> {
    logits
        .iter()
        .enumerate()
        .filter(|(_, v)| !v.is_nan())
        .max_by(|(_, a), (_, b)| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal))
        .map(|(idx, _)| idx)
}

/// Numerically stable softmax; `-inf` entries get probability zero
#[must_use]
pub fn softmax(logits: &[f32]) -> Vec<f32> {
    let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    if !max.is_finite() {
        return vec![0.0; logits.len()];
    }
    let exps: Vec<f32> = logits.iter().map(|&x| (x - max).exp()).collect();
    let sum: f32 = exps.iter().sum();
    exps.into_iter().map(|e| e / sum).collect()
}

/// Divide logits by `temperature` in place; no-op for `temperature <= 0`
pub fn apply_temperature(logits: &mut [f32], temperature: f32) {
    if temperature > 0.0 && (temperature - 1.0).abs() > f32::EPSILON {
        for x in logits.iter_mut() {
            *x /= temperature;
        }
    }
}

/// Mask every logit strictly below the k-th largest to `-inf`
///
/// Ties at the threshold survive, so more than `k` entries can remain.
pub fn apply_top_k(logits: &mut [f32], k: usize) {
    if k == 0 || k >= logits.len() {
        return;
    }
    let mut sorted: Vec<f32> = logits
        .iter()
        .map(|&x| if x.is_nan() { f32::NEG_INFINITY } else { x })
        .collect();
    sorted.sort_unstable_by(|a, b| b.partial_cmp(a).unwrap_or(std::cmp::Ordering::Equal));
    let threshold = sorted[k - 1];
    for x in logits.iter_mut() {
        if x.is_nan() || *x < threshold {
            *x = f32::NEG_INFINITY;
        }
    }
}

/// Nucleus filter: keep the smallest prefix of the descending
/// distribution whose mass reaches `p`
///
/// A token is removed only when the cumulative probability of the tokens
/// ranked above it already exceeds `p`, so the token that crosses the
/// threshold survives, and so does the top token.
pub fn apply_top_p(logits: &mut [f32], p: f32) {
    if p >= 1.0 || logits.is_empty() {
        return;
    }
    let mut order: Vec<usize> = (0..logits.len()).collect();
    order.sort_by(|&a, &b| {
        logits[b]
            .partial_cmp(&logits[a])
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    let sorted: Vec<f32> = order.iter().map(|&i| logits[i]).collect();
    let probs = softmax(&sorted);

    let mut cumulative = 0.0_f32;
    for (rank, &idx) in order.iter().enumerate() {
        if rank > 0 && cumulative > p {
            logits[idx] = f32::NEG_INFINITY;
        }
        cumulative += probs[rank];
    }
}

/// Draw an index from a probability vector given a uniform `r` in `[0, 1)`
///
/// Returns `None` when the vector carries no mass.
#[must_use]
pub fn sample_from_probs(probs: &[f32], r: f32) -> Option<usize> {
    let total: f32 = probs.iter().sum();
    if !(total.is_finite() && total > 0.0) {
        return None;
    }
    let target = r * total;
    let mut cumulative = 0.0;
    let mut last_nonzero = None;
    for (idx, &p) in probs.iter().enumerate() {
        if p <= 0.0 {
            continue;
        }
        cumulative += p;
        last_nonzero = Some(idx);
        if cumulative > target {
            return Some(idx);
        }
    }
    last_nonzero
}

/// Stateful sampler owning its RNG
#[derive(Debug, Clone)]
pub struct Sampler {
    params: SamplingParams,
    rng: StdRng,
}

impl Sampler {
    /// Create a sampler, seeding the RNG from `params.seed` when present
    ///
    /// # Errors
    ///
    /// Returns an error when the parameters are out of range.
    pub fn new(params: SamplingParams) -> Result<Self> {
        params.validate()?;
        let rng = match params.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Ok(Self { params, rng })
    }

    /// Parameters in use
    #[must_use]
    pub fn params(&self) -> &SamplingParams {
        &self.params
    }

    /// Pick the next token id
    ///
    /// # Errors
    ///
    /// Returns `InvalidShape` when `logits` is empty or contains only NaN.
    pub fn sample(&mut self, logits: &[f32]) -> Result<u32> {
        let fallback = argmax(logits).ok_or_else(|| BridgeError::InvalidShape {
            reason: "Logits cannot be empty".to_string(),
        })?;

        if self.params.is_greedy() {
            return Ok(fallback as u32);
        }

        let mut work: Vec<f32> = logits
            .iter()
            .map(|&x| if x.is_nan() { f32::NEG_INFINITY } else { x })
            .collect();
        apply_temperature(&mut work, self.params.temperature);
        apply_top_k(&mut work, self.params.top_k);
        apply_top_p(&mut work, self.params.top_p);

        let probs = softmax(&work);
        let r: f32 = self.rng.gen();
        Ok(sample_from_probs(&probs, r).unwrap_or(fallback) as u32)
    }
}
