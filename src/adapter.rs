//! Blocking client for the proxy's `/generate` endpoint
//!
//! This is the shim Ollama-side glue calls instead of a local model: one
//! prompt in, the generated text out.

use std::time::Duration;

use reqwest::blocking::Client;
use serde::Serialize;

use crate::config::backend_url_from_env;
use crate::error::{BridgeError, Result};
use crate::proxy::GenerateResponse;

/// Request timeout used by [`BackendAdapter::from_env`]
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Token budget used when the caller does not choose one
pub const DEFAULT_MAX_TOKENS: usize = 256;

#[derive(Serialize)]
struct AdapterRequest<'a> {
    prompt: &'a str,
    max_tokens: usize,
}

/// Client bound to one backend URL
#[derive(Debug, Clone)]
pub struct BackendAdapter {
    client: Client,
    base_url: String,
}

impl BackendAdapter {
    /// Adapter for `base_url` with a request timeout
    ///
    /// # Errors
    ///
    /// Returns `ConnectionError` if the HTTP client cannot be built.
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| BridgeError::ConnectionError(format!("Failed to create HTTP client: {e}")))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    /// Adapter for `AX650_BACKEND_URL` (default `http://localhost:5002`)
    ///
    /// # Errors
    ///
    /// Returns `ConnectionError` if the HTTP client cannot be built.
    pub fn from_env() -> Result<Self> {
        Self::new(backend_url_from_env(), DEFAULT_TIMEOUT)
    }

    /// Backend URL without trailing slash
    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Generate and return only the text
    ///
    /// # Errors
    ///
    /// See [`BackendAdapter::generate_detailed`].
    pub fn generate(&self, prompt: &str, max_tokens: usize) -> Result<String> {
        self.generate_detailed(prompt, max_tokens).map(|r| r.text)
    }

    /// Generate and return the full proxy reply
    ///
    /// # Errors
    ///
    /// Returns `ConnectionError` on transport failure, `RuntimeError` with
    /// the HTTP status on an error reply, or `FormatError` on a malformed
    /// body.
    pub fn generate_detailed(&self, prompt: &str, max_tokens: usize) -> Result<GenerateResponse> {
        let url = format!("{}/generate", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(&AdapterRequest { prompt, max_tokens })
            .send()
            .map_err(|e| BridgeError::ConnectionError(format!("HTTP request failed: {e}")))?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let message = response.text().unwrap_or_default();
            return Err(BridgeError::RuntimeError { status, message });
        }
        response.json().map_err(|e| BridgeError::FormatError {
            reason: format!("Failed to parse generate response: {e}"),
        })
    }
}
