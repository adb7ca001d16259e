//! bf16 token embedding table
//!
//! The table is stored as raw little-endian bf16, `vocab x hidden`
//! (151936 x 2560 for Qwen3-4B).

use std::path::Path;

use half::bf16;

use crate::error::{BridgeError, Result};

/// Hidden size of Qwen3-4B
pub const QWEN3_HIDDEN: usize = 2560;
/// Vocabulary size of Qwen3-4B
pub const QWEN3_VOCAB: usize = 151_936;

/// Row-major embedding matrix
#[derive(Debug, Clone)]
pub struct EmbeddingTable {
    data: Vec<bf16>,
    hidden: usize,
}

impl EmbeddingTable {
    /// Build from raw little-endian bf16 bytes
    ///
    /// # Errors
    ///
    /// Returns `FormatError` if the byte length is not a whole number of
    /// `hidden`-wide rows.
    pub fn from_le_bytes(bytes: &[u8], hidden: usize) -> Result<Self> {
        let row_bytes = hidden * 2;
        if hidden == 0 || bytes.is_empty() || bytes.len() % row_bytes != 0 {
            return Err(BridgeError::FormatError {
                reason: format!(
                    "embedding table of {} bytes is not a multiple of {row_bytes}-byte rows",
                    bytes.len()
                ),
            });
        }
        let data = bytes
            .chunks_exact(2)
            .map(|pair| bf16::from_bits(u16::from_le_bytes([pair[0], pair[1]])))
            .collect();
        Ok(Self { data, hidden })
    }

    /// Read an embedding table file
    ///
    /// # Errors
    ///
    /// Returns `IoError` if the file cannot be read, or `FormatError` on a
    /// size mismatch.
    pub fn load(path: &Path, hidden: usize) -> Result<Self> {
        let bytes = std::fs::read(path).map_err(|e| BridgeError::IoError {
            message: format!("Failed to read embeddings {}: {e}", path.display()),
        })?;
        Self::from_le_bytes(&bytes, hidden)
    }

    /// Build from rows already in bf16
    ///
    /// # Errors
    ///
    /// Returns `InvalidShape` if `data.len()` is not a multiple of `hidden`.
    pub fn from_rows(data: Vec<bf16>, hidden: usize) -> Result<Self> {
        if hidden == 0 || data.len() % hidden != 0 {
            return Err(BridgeError::InvalidShape {
                reason: format!("{} values do not form rows of {hidden}", data.len()),
            });
        }
        Ok(Self { data, hidden })
    }

    /// Number of rows
    #[must_use]
    pub fn vocab_size(&self) -> usize {
        self.data.len() / self.hidden
    }

    /// Row width
    #[must_use]
    pub fn hidden(&self) -> usize {
        self.hidden
    }

    /// Embedding row for `token`
    ///
    /// # Errors
    ///
    /// Returns `InvalidShape` for an out-of-vocabulary id.
    pub fn lookup(&self, token: u32) -> Result<&[bf16]> {
        let idx = token as usize;
        if idx >= self.vocab_size() {
            return Err(BridgeError::InvalidShape {
                reason: format!("token {token} outside vocabulary of {}", self.vocab_size()),
            });
        }
        Ok(&self.data[idx * self.hidden..(idx + 1) * self.hidden])
    }
}
