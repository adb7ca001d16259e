//! Per-layer key/value cache for the single-token decode loop
//!
//! Each layer owns a `[max_seq_len, kv_dim]` bf16 buffer for K and one for V.
//! Layer sessions read the first `max_seq_len - 1` rows (the attention
//! window) and return one new K/V row which is written back at the
//! current position.

use half::bf16;

use crate::error::{BridgeError, Result};

/// Cache geometry of the Qwen3-4B axmodel layers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KvCacheConfig {
    /// Number of transformer layers
    pub num_layers: usize,
    /// Width of one K or V row
    pub kv_dim: usize,
    /// Rows per buffer, including the slot past the window
    pub max_seq_len: usize,
}

impl Default for KvCacheConfig {
    fn default() -> Self {
        Self {
            num_layers: 36,
            kv_dim: 1024,
            max_seq_len: 1024,
        }
    }
}

impl KvCacheConfig {
    /// Rows visible to a layer session (`max_seq_len - 1`)
    #[must_use]
    pub fn window(&self) -> usize {
        self.max_seq_len.saturating_sub(1)
    }
}

/// K and V buffers for every layer
#[derive(Debug, Clone)]
pub struct KvCache {
    config: KvCacheConfig,
    k: Vec<Vec<bf16>>,
    v: Vec<Vec<bf16>>,
}

impl KvCache {
    /// Allocate zeroed buffers
    #[must_use]
    pub fn new(config: KvCacheConfig) -> Self {
        let len = config.max_seq_len * config.kv_dim;
        Self {
            config,
            k: vec![vec![bf16::ZERO; len]; config.num_layers],
            v: vec![vec![bf16::ZERO; len]; config.num_layers],
        }
    }

    /// Geometry of this cache
    #[must_use]
    pub fn config(&self) -> &KvCacheConfig {
        &self.config
    }

    /// Zero every buffer
    pub fn clear(&mut self) {
        for buf in self.k.iter_mut().chain(self.v.iter_mut()) {
            buf.fill(bf16::ZERO);
        }
    }

    /// K rows `0..window` of `layer`, flattened
    #[must_use]
    pub fn k_window(&self, layer: usize) -> &[bf16] {
        &self.k[layer][..self.config.window() * self.config.kv_dim]
    }

    /// V rows `0..window` of `layer`, flattened
    #[must_use]
    pub fn v_window(&self, layer: usize) -> &[bf16] {
        &self.v[layer][..self.config.window() * self.config.kv_dim]
    }

    /// Store the K/V rows produced by `layer` at `pos`
    ///
    /// # Errors
    ///
    /// Returns `ContextLimitExceeded` when `pos` is outside the window,
    /// or `InvalidShape` for a wrong row width or layer index.
    pub fn write(&mut self, layer: usize, pos: usize, k_row: &[bf16], v_row: &[bf16]) -> Result<()> {
        let dim = self.config.kv_dim;
        if layer >= self.config.num_layers {
            return Err(BridgeError::InvalidShape {
                reason: format!("layer {layer} out of range ({})", self.config.num_layers),
            });
        }
        if k_row.len() != dim || v_row.len() != dim {
            return Err(BridgeError::InvalidShape {
                reason: format!(
                    "KV row width {}/{} does not match kv_dim {dim}",
                    k_row.len(),
                    v_row.len()
                ),
            });
        }
        if pos >= self.config.window() {
            return Err(BridgeError::ContextLimitExceeded {
                position: pos,
                window: self.config.window(),
            });
        }
        let start = pos * dim;
        self.k[layer][start..start + dim].copy_from_slice(k_row);
        self.v[layer][start..start + dim].copy_from_slice(v_row);
        Ok(())
    }

    /// K row at `pos` of `layer`
    #[must_use]
    pub fn k_row(&self, layer: usize, pos: usize) -> &[bf16] {
        let dim = self.config.kv_dim;
        &self.k[layer][pos * dim..(pos + 1) * dim]
    }

    /// V row at `pos` of `layer`
    #[must_use]
    pub fn v_row(&self, layer: usize, pos: usize) -> &[bf16] {
        let dim = self.config.kv_dim;
        &self.v[layer][pos * dim..(pos + 1) * dim]
    }
}

/// Attention mask over `max_seq_len` slots: 1.0 for `0..=pos`, 0.0 after
#[must_use]
pub fn attention_mask(max_seq_len: usize, pos: usize) -> Vec<bf16> {
    let valid = (pos + 1).min(max_seq_len);
    let mut mask = vec![bf16::ZERO; max_seq_len];
    mask[..valid].fill(bf16::ONE);
    mask
}
