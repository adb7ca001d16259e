//! Tokenizer seam for the decode loop
//!
//! The engine only needs encode/decode and the end-of-sequence ids, so it
//! talks to a small trait. `HfTokenizer` loads a HuggingFace
//! `tokenizer.json` through the `tokenizers` crate.

use std::path::Path;

use tokenizers::Tokenizer;

use crate::error::{BridgeError, Result};

/// Qwen `<|endoftext|>`
pub const QWEN_ENDOFTEXT: u32 = 151_643;
/// Qwen `<|im_end|>`
pub const QWEN_IM_END: u32 = 151_645;

/// Text <-> token id conversion
pub trait TextTokenizer: Send + Sync {
    /// Encode text without adding special tokens
    ///
    /// # Errors
    ///
    /// Returns `TokenizerError` when encoding fails.
    fn encode(&self, text: &str) -> Result<Vec<u32>>;

    /// Decode ids to text
    ///
    /// # Errors
    ///
    /// Returns `TokenizerError` when decoding fails.
    fn decode(&self, ids: &[u32], skip_special_tokens: bool) -> Result<String>;

    /// The tokenizer's own end-of-sequence id, if it declares one
    fn eos_token_id(&self) -> Option<u32>;

    /// Whether `token` ends generation
    fn is_eos(&self, token: u32) -> bool {
        token == QWEN_ENDOFTEXT || token == QWEN_IM_END || self.eos_token_id() == Some(token)
    }
}

/// HuggingFace `tokenizer.json` tokenizer
pub struct HfTokenizer {
    inner: Tokenizer,
    eos: Option<u32>,
}

impl std::fmt::Debug for HfTokenizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HfTokenizer")
            .field("eos", &self.eos)
            .finish_non_exhaustive()
    }
}

impl HfTokenizer {
    /// Load from a `tokenizer.json` file
    ///
    /// # Errors
    ///
    /// Returns `TokenizerError` when the file is missing or malformed.
    pub fn from_file(path: &Path) -> Result<Self> {
        let inner = Tokenizer::from_file(path).map_err(|e| {
            BridgeError::TokenizerError(format!(
                "Failed to load tokenizer from {}: {e}",
                path.display()
            ))
        })?;
        let eos = ["<|im_end|>", "<|endoftext|>", "</s>"]
            .iter()
            .find_map(|tok| inner.token_to_id(tok));
        Ok(Self { inner, eos })
    }
}

impl TextTokenizer for HfTokenizer {
    fn encode(&self, text: &str) -> Result<Vec<u32>> {
        let encoding = self
            .inner
            .encode(text, false)
            .map_err(|e| BridgeError::TokenizerError(format!("Tokenization failed: {e}")))?;
        Ok(encoding.get_ids().to_vec())
    }

    fn decode(&self, ids: &[u32], skip_special_tokens: bool) -> Result<String> {
        self.inner
            .decode(ids, skip_special_tokens)
            .map_err(|e| BridgeError::TokenizerError(format!("Detokenization failed: {e}")))
    }

    fn eos_token_id(&self) -> Option<u32> {
        self.eos
    }
}

/// Incremental detokeniser producing text deltas
///
/// Decodes the whole id list on every push and emits only the new suffix,
/// holding back output while the tail is an incomplete UTF-8 sequence
/// (rendered as U+FFFD by byte-level tokenizers).
#[derive(Debug, Default)]
pub struct DeltaDecoder {
    ids: Vec<u32>,
    emitted: usize,
}

impl DeltaDecoder {
    /// Empty decoder
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `token` and return the newly completed text, if any
    ///
    /// # Errors
    ///
    /// Propagates tokenizer decode failures.
    pub fn push(&mut self, tokenizer: &dyn TextTokenizer, token: u32) -> Result<Option<String>> {
        self.ids.push(token);
        let text = tokenizer.decode(&self.ids, true)?;
        if text.ends_with('\u{FFFD}') || text.len() <= self.emitted {
            return Ok(None);
        }
        let delta = match text.get(self.emitted..) {
            Some(delta) => delta.to_string(),
            None => return Ok(None),
        };
        self.emitted = text.len();
        Ok(Some(delta))
    }

    /// Ids pushed so far
    #[must_use]
    pub fn ids(&self) -> &[u32] {
        &self.ids
    }

    /// Final decode of everything pushed
    ///
    /// # Errors
    ///
    /// Propagates tokenizer decode failures.
    pub fn finish(&self, tokenizer: &dyn TextTokenizer) -> Result<String> {
        tokenizer.decode(&self.ids, true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// One character per id: id = char code
    struct CharTokenizer;

    impl TextTokenizer for CharTokenizer {
        fn encode(&self, text: &str) -> Result<Vec<u32>> {
            Ok(text.chars().map(|c| c as u32).collect())
        }

        fn decode(&self, ids: &[u32], _skip: bool) -> Result<String> {
            Ok(ids.iter().filter_map(|&i| char::from_u32(i)).collect())
        }

        fn eos_token_id(&self) -> Option<u32> {
            Some(0)
        }
    }

    #[test]
    fn test_is_eos_covers_qwen_ids() {
        let tok = CharTokenizer;
        assert!(tok.is_eos(QWEN_ENDOFTEXT));
        assert!(tok.is_eos(QWEN_IM_END));
        assert!(tok.is_eos(0));
        assert!(!tok.is_eos('a' as u32));
    }

    #[test]
    fn test_delta_decoder_emits_suffixes() {
        let tok = CharTokenizer;
        let mut dec = DeltaDecoder::new();
        assert_eq!(dec.push(&tok, 'h' as u32).expect("test").as_deref(), Some("h"));
        assert_eq!(dec.push(&tok, 'i' as u32).expect("test").as_deref(), Some("i"));
        assert_eq!(dec.finish(&tok).expect("test"), "hi");
        assert_eq!(dec.ids().len(), 2);
    }

    #[test]
    fn test_delta_decoder_holds_back_replacement_char() {
        let tok = CharTokenizer;
        let mut dec = DeltaDecoder::new();
        assert!(dec.push(&tok, 0xFFFD).expect("test").is_none());
        assert_eq!(dec.push(&tok, 'x' as u32).expect("test").as_deref(), Some("\u{FFFD}x"));
    }

    #[test]
    fn test_missing_tokenizer_file() {
        let err = HfTokenizer::from_file(Path::new("/nope/tokenizer.json")).unwrap_err();
        assert!(matches!(err, BridgeError::TokenizerError(_)));
    }
}
