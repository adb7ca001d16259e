//! On-disk layout detection for AX650 model directories
//!
//! Two layouts are recognised:
//!
//! - **Layered** (Qwen3-4B): one `*_l{i}_together.axmodel` per transformer
//!   layer, a `*_post.axmodel` head and a bf16 embedding table.
//! - **PrefillDecode**: `model_prefill.axmodel` + `model_decode.axmodel`,
//!   or a single `model.axmodel`.

use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::{info, warn};

use crate::error::{BridgeError, Result};

/// Default layer count probed for layered models
pub const DEFAULT_NUM_LAYERS: usize = 36;

const POST_NAMES: [&str; 2] = ["qwen3_post.axmodel", "llama_post.axmodel"];
const EMBED_BF16: &str = "model.embed_tokens.weight.bfloat16.bin";

/// Which artifact family a directory holds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelKind {
    /// Per-layer axmodels with a post head (Qwen3-4B)
    Layered,
    /// Prefill/decode pair or a single axmodel
    PrefillDecode,
}

/// Files found in a model directory
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelLayout {
    /// Model directory
    pub root: PathBuf,
    /// Detected artifact family
    pub kind: ModelKind,
    /// Per-layer axmodels in layer order (layered only)
    pub layers: Vec<PathBuf>,
    /// Layer indices probed but not found
    pub missing_layers: Vec<usize>,
    /// Post head (layered only)
    pub post: Option<PathBuf>,
    /// bf16 embedding table
    pub embeddings: Option<PathBuf>,
    /// `tokenizer.json`, in the root or `tokenizer/`
    pub tokenizer: Option<PathBuf>,
    /// Prefill model (prefill/decode only)
    pub prefill: Option<PathBuf>,
    /// Decode model (prefill/decode only)
    pub decode: Option<PathBuf>,
}

impl ModelLayout {
    /// Inspect `root` and classify its contents
    ///
    /// # Errors
    ///
    /// Returns `ModelNotFound` when `root` is not a directory, and
    /// `FormatError` when no known axmodel layout is present.
    pub fn detect(root: &Path, num_layers: usize) -> Result<Self> {
        if !root.is_dir() {
            return Err(BridgeError::ModelNotFound(root.display().to_string()));
        }

        let embeddings = existing(root.join(EMBED_BF16));
        let tokenizer = existing(root.join("tokenizer.json"))
            .or_else(|| existing(root.join("tokenizer").join("tokenizer.json")));

        if let Some(post) = POST_NAMES.iter().find_map(|name| existing(root.join(name))) {
            let mut layers = Vec::with_capacity(num_layers);
            let mut missing_layers = Vec::new();
            for i in 0..num_layers {
                match layer_file(root, i) {
                    Some(path) => layers.push(path),
                    None => {
                        warn!("Layer {i} model not found in {}", root.display());
                        missing_layers.push(i);
                    },
                }
            }
            info!(
                "Detected layered model at {}: {} layers, post={}",
                root.display(),
                layers.len(),
                post.display()
            );
            return Ok(Self {
                root: root.to_path_buf(),
                kind: ModelKind::Layered,
                layers,
                missing_layers,
                post: Some(post),
                embeddings,
                tokenizer,
                prefill: None,
                decode: None,
            });
        }

        let prefill = existing(root.join("model_prefill.axmodel"));
        let decode = existing(root.join("model_decode.axmodel"));
        let single = existing(root.join("model.axmodel"));
        if prefill.is_some() || single.is_some() {
            return Ok(Self {
                root: root.to_path_buf(),
                kind: ModelKind::PrefillDecode,
                layers: Vec::new(),
                missing_layers: Vec::new(),
                post: None,
                embeddings,
                tokenizer,
                prefill: prefill.or(single),
                decode,
            });
        }

        Err(BridgeError::FormatError {
            reason: format!("No axmodel layout recognised in {}", root.display()),
        })
    }

    /// Whether every probed layer is present along with post and embeddings
    #[must_use]
    pub fn is_complete(&self) -> bool {
        match self.kind {
            ModelKind::Layered => {
                self.missing_layers.is_empty() && self.post.is_some() && self.embeddings.is_some()
            },
            ModelKind::PrefillDecode => self.prefill.is_some(),
        }
    }
}

fn layer_file(root: &Path, index: usize) -> Option<PathBuf> {
    existing(root.join(format!("qwen3_p128_l{index}_together.axmodel")))
        .or_else(|| existing(root.join(format!("llama_p320_l{index}_together.axmodel"))))
}

fn existing(path: PathBuf) -> Option<PathBuf> {
    path.is_file().then_some(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn touch(dir: &Path, name: &str) {
        fs::write(dir.join(name), b"axmodel").expect("test");
    }

    #[test]
    fn test_detect_missing_directory() {
        let err = ModelLayout::detect(Path::new("/definitely/not/here"), 2).unwrap_err();
        assert!(matches!(err, BridgeError::ModelNotFound(_)));
    }

    #[test]
    fn test_detect_layered_qwen3() {
        let dir = tempfile::tempdir().expect("test");
        touch(dir.path(), "qwen3_post.axmodel");
        touch(dir.path(), "qwen3_p128_l0_together.axmodel");
        touch(dir.path(), "qwen3_p128_l1_together.axmodel");
        touch(dir.path(), EMBED_BF16);
        fs::create_dir(dir.path().join("tokenizer")).expect("test");
        touch(&dir.path().join("tokenizer"), "tokenizer.json");

        let layout = ModelLayout::detect(dir.path(), 2).expect("test");
        assert_eq!(layout.kind, ModelKind::Layered);
        assert_eq!(layout.layers.len(), 2);
        assert!(layout.missing_layers.is_empty());
        assert!(layout.tokenizer.is_some());
        assert!(layout.is_complete());
    }

    #[test]
    fn test_detect_llama_naming_with_gap() {
        let dir = tempfile::tempdir().expect("test");
        touch(dir.path(), "llama_post.axmodel");
        touch(dir.path(), "llama_p320_l0_together.axmodel");
        touch(dir.path(), "llama_p320_l2_together.axmodel");

        let layout = ModelLayout::detect(dir.path(), 3).expect("test");
        assert_eq!(layout.layers.len(), 2);
        assert_eq!(layout.missing_layers, vec![1]);
        assert!(!layout.is_complete());
    }

    #[test]
    fn test_detect_prefill_decode() {
        let dir = tempfile::tempdir().expect("test");
        touch(dir.path(), "model_prefill.axmodel");
        touch(dir.path(), "model_decode.axmodel");
        let layout = ModelLayout::detect(dir.path(), 36).expect("test");
        assert_eq!(layout.kind, ModelKind::PrefillDecode);
        assert!(layout.decode.is_some());
        assert!(layout.is_complete());
    }

    #[test]
    fn test_detect_single_model_file() {
        let dir = tempfile::tempdir().expect("test");
        touch(dir.path(), "model.axmodel");
        let layout = ModelLayout::detect(dir.path(), 36).expect("test");
        assert_eq!(layout.kind, ModelKind::PrefillDecode);
        assert_eq!(layout.prefill, Some(dir.path().join("model.axmodel")));
    }

    #[test]
    fn test_detect_unrecognised() {
        let dir = tempfile::tempdir().expect("test");
        touch(dir.path(), "README.md");
        let err = ModelLayout::detect(dir.path(), 36).unwrap_err();
        assert!(matches!(err, BridgeError::FormatError { .. }));
    }
}
