//! Async client for the runtime HTTP API
//!
//! Wraps the reset/generate/poll protocol. [`RuntimeClient::collect`] turns
//! the polling provider into either an accumulated string or a stream of
//! chunks handed to a callback.

use std::time::{Duration, Instant};

use reqwest::{Client, Response};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, error, warn};

use crate::config::BridgeConfig;
use crate::error::{BridgeError, Result};
use crate::runtime_api::{
    ChatMessage, ProviderResponse, ResetRequest, RuntimeChatRequest, RuntimeChatResponse,
    RuntimeErrorBody, RuntimeGenerateRequest, StatusResponse, PATH_CHAT, PATH_GENERATE,
    PATH_PROVIDER, PATH_RESET, PATH_STOP,
};

/// Result of polling the provider until it finishes
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CollectOutcome {
    /// All text gathered
    pub text: String,
    /// The provider reported `done`
    pub done: bool,
    /// The deadline passed before `done`
    pub timed_out: bool,
    /// Provider polls issued
    pub polls: usize,
}

/// HTTP client bound to one runtime base URL
#[derive(Debug, Clone)]
pub struct RuntimeClient {
    client: Client,
    base_url: String,
    ping_timeout: Duration,
}

impl RuntimeClient {
    /// Client for `base_url` with a per-request timeout
    ///
    /// # Errors
    ///
    /// Returns `ConnectionError` if the HTTP client cannot be built.
    pub fn new(base_url: impl Into<String>, request_timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| BridgeError::ConnectionError(format!("Failed to create HTTP client: {e}")))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            ping_timeout: Duration::from_millis(500),
        })
    }

    /// Client for the runtime described by `config`
    ///
    /// # Errors
    ///
    /// Returns `ConnectionError` if the HTTP client cannot be built.
    pub fn from_config(config: &BridgeConfig) -> Result<Self> {
        let mut client = Self::new(config.runtime_url(), config.request_timeout)?;
        client.ping_timeout = config.ping_timeout;
        Ok(client)
    }

    /// Base URL without trailing slash
    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    async fn post_json<B: Serialize, T: DeserializeOwned>(&self, path: &str, body: &B) -> Result<T> {
        let response = self
            .client
            .post(self.url(path))
            .json(body)
            .send()
            .await
            .map_err(|e| BridgeError::ConnectionError(format!("HTTP request failed: {e}")))?;
        decode(path, response).await
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let response = self
            .client
            .get(self.url(path))
            .send()
            .await
            .map_err(|e| BridgeError::ConnectionError(format!("HTTP request failed: {e}")))?;
        decode(path, response).await
    }

    /// Clear the conversation and set a system prompt
    ///
    /// # Errors
    ///
    /// Returns `ConnectionError` on transport failure and `RuntimeError`
    /// when the runtime refuses (for instance while a generation runs).
    pub async fn reset(&self, system_prompt: &str) -> Result<()> {
        let body = ResetRequest {
            system_prompt: system_prompt.to_string(),
        };
        let _: StatusResponse = self.post_json(PATH_RESET, &body).await?;
        Ok(())
    }

    /// Start an asynchronous generation
    ///
    /// # Errors
    ///
    /// Returns `ConnectionError` on transport failure and `RuntimeError`
    /// when the runtime is busy, has no model, or rejects the body.
    pub async fn start_generation(&self, request: &RuntimeGenerateRequest) -> Result<()> {
        let _: StatusResponse = self.post_json(PATH_GENERATE, request).await?;
        Ok(())
    }

    /// Fetch text produced since the last poll
    ///
    /// # Errors
    ///
    /// Returns `ConnectionError` on transport failure, `RuntimeError` on a
    /// non-success status, or `FormatError` on a malformed body.
    pub async fn poll(&self) -> Result<ProviderResponse> {
        self.get_json(PATH_PROVIDER).await
    }

    /// Ask the runtime to stop the current generation
    ///
    /// # Errors
    ///
    /// Returns `ConnectionError` when the runtime is unreachable.
    pub async fn stop(&self) -> Result<()> {
        let _: StatusResponse = self.get_json(PATH_STOP).await?;
        Ok(())
    }

    /// Liveness probe: any HTTP answer to `GET /api/stop` counts
    pub async fn ping(&self) -> bool {
        self.client
            .get(self.url(PATH_STOP))
            .timeout(self.ping_timeout)
            .send()
            .await
            .is_ok()
    }

    /// Synchronous chat call
    ///
    /// # Errors
    ///
    /// Returns `ConnectionError` on transport failure and `RuntimeError` on
    /// an error status.
    pub async fn chat(&self, messages: Vec<ChatMessage>) -> Result<String> {
        let body = RuntimeChatRequest { messages };
        let reply: RuntimeChatResponse = self.post_json(PATH_CHAT, &body).await?;
        Ok(reply.message)
    }

    /// Poll the provider until `done` or `deadline`, handing each non-empty
    /// chunk to `on_chunk`
    ///
    /// A provider answering with an error status ends collection with the
    /// text gathered so far; transport failures are returned as errors.
    ///
    /// # Errors
    ///
    /// Returns `ConnectionError` or `FormatError` when a poll fails outright.
    pub async fn collect<F>(
        &self,
        interval: Duration,
        deadline: Duration,
        mut on_chunk: F,
    ) -> Result<CollectOutcome>
    where
        F: FnMut(&str) + Send,
    {
        let start = Instant::now();
        let mut outcome = CollectOutcome::default();
        loop {
            outcome.polls += 1;
            let reply = match self.poll().await {
                Ok(reply) => reply,
                Err(BridgeError::RuntimeError { status, message }) => {
                    error!("Provider returned status {status}: {message}");
                    break;
                },
                Err(e) => return Err(e),
            };
            if !reply.response.is_empty() {
                on_chunk(&reply.response);
                outcome.text.push_str(&reply.response);
            }
            if reply.done {
                outcome.done = true;
                break;
            }
            if start.elapsed() > deadline {
                error!("Generation timed out after {:.1}s", start.elapsed().as_secs_f64());
                outcome.timed_out = true;
                break;
            }
            tokio::time::sleep(interval).await;
        }
        debug!(
            "Collected {} chars in {} polls (done={}, timed_out={})",
            outcome.text.len(),
            outcome.polls,
            outcome.done,
            outcome.timed_out
        );
        Ok(outcome)
    }
}

async fn decode<T: DeserializeOwned>(path: &str, response: Response) -> Result<T> {
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        let message = serde_json::from_str::<RuntimeErrorBody>(&body)
            .map(|b| b.error)
            .unwrap_or(body);
        warn!("Runtime {path} answered {status}: {message}");
        return Err(BridgeError::RuntimeError {
            status: status.as_u16(),
            message,
        });
    }
    response.json().await.map_err(|e| BridgeError::FormatError {
        reason: format!("Failed to parse {path} response: {e}"),
    })
}

#[cfg(test)]
mod tests;
