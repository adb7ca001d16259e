//! Wire types of the runtime HTTP API
//!
//! The vendor `main_api_ax650` server and the built-in mock runtime both
//! speak this protocol. It is stateful: a client resets the conversation,
//! starts a generation, then polls the provider endpoint for text until
//! it reports `done`.
//!
//! Note the hyphenated `top-p` / `top-k` keys on the generate body.

use serde::{Deserialize, Serialize};

use crate::sampling::SamplingParams;

/// `POST /api/reset`
pub const PATH_RESET: &str = "/api/reset";
/// `POST /api/generate`
pub const PATH_GENERATE: &str = "/api/generate";
/// `GET /api/generate_provider`
pub const PATH_PROVIDER: &str = "/api/generate_provider";
/// `GET /api/stop`, also the liveness ping
pub const PATH_STOP: &str = "/api/stop";
/// `POST /api/chat`
pub const PATH_CHAT: &str = "/api/chat";

/// Default new-token budget on the generate endpoint
pub const DEFAULT_MAX_TOKENS: usize = 128;

fn default_max_tokens() -> usize {
    DEFAULT_MAX_TOKENS
}

fn default_temperature() -> f32 {
    SamplingParams::default().temperature
}

fn default_top_p() -> f32 {
    SamplingParams::default().top_p
}

fn default_top_k() -> usize {
    SamplingParams::default().top_k
}

/// Body of `POST /api/reset`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResetRequest {
    /// System prompt for the next conversation
    #[serde(default)]
    pub system_prompt: String,
}

/// Body of `POST /api/generate`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuntimeGenerateRequest {
    /// Prompt text
    pub prompt: String,
    /// Maximum new tokens
    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,
    /// Sampling temperature
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    /// Nucleus threshold
    #[serde(rename = "top-p", default = "default_top_p")]
    pub top_p: f32,
    /// Top-k cutoff
    #[serde(rename = "top-k", default = "default_top_k")]
    pub top_k: usize,
    /// Correlation id for step logs; unknown to the vendor runtime
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

impl RuntimeGenerateRequest {
    /// Request with default sampling
    #[must_use]
    pub fn new(prompt: impl Into<String>, max_tokens: usize) -> Self {
        let defaults = SamplingParams::default();
        Self {
            prompt: prompt.into(),
            max_tokens,
            temperature: defaults.temperature,
            top_p: defaults.top_p,
            top_k: defaults.top_k,
            request_id: None,
        }
    }

    /// Attach a correlation id
    #[must_use]
    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    /// Override sampling fields
    #[must_use]
    pub fn with_sampling(mut self, temperature: f32, top_p: f32, top_k: usize) -> Self {
        self.temperature = temperature;
        self.top_p = top_p;
        self.top_k = top_k;
        self
    }

    /// Sampling parameters carried by this request
    #[must_use]
    pub fn sampling(&self) -> SamplingParams {
        SamplingParams {
            temperature: self.temperature,
            top_k: self.top_k,
            top_p: self.top_p,
            seed: None,
        }
    }
}

/// `{"status": "ok"}` acknowledgement
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusResponse {
    /// Always `ok` on success
    pub status: String,
}

impl StatusResponse {
    /// The `ok` acknowledgement
    #[must_use]
    pub fn ok() -> Self {
        Self {
            status: "ok".to_string(),
        }
    }
}

/// `{"error": "..."}` body used by the runtime for 4xx answers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeErrorBody {
    /// Error message (`llm is running`, `Model not init`, ...)
    pub error: String,
}

/// Body of `GET /api/generate_provider`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderResponse {
    /// Text produced since the previous poll
    #[serde(default)]
    pub response: String,
    /// Whether generation has finished
    #[serde(default)]
    pub done: bool,
}

/// One chat message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// `system`, `user` or `assistant`
    #[serde(default = "default_role")]
    pub role: String,
    /// Message text
    pub content: String,
}

fn default_role() -> String {
    "user".to_string()
}

impl ChatMessage {
    /// Build a message
    #[must_use]
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
        }
    }
}

/// Body of `POST /api/chat`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeChatRequest {
    /// Conversation so far
    pub messages: Vec<ChatMessage>,
}

/// Reply of `POST /api/chat`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeChatResponse {
    /// Generated reply
    pub message: String,
    /// Always true; the chat endpoint is synchronous
    pub done: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_request_uses_hyphenated_keys() {
        let req = RuntimeGenerateRequest::new("hi", 16).with_sampling(0.5, 0.7, 10);
        let json = serde_json::to_value(&req).expect("test");
        assert_eq!(json["top-p"], serde_json::json!(0.7f32));
        assert_eq!(json["top-k"], 10);
        assert!(json.get("top_p").is_none());
        assert!(json.get("request_id").is_none());
    }

    #[test]
    fn test_generate_request_defaults() {
        let req: RuntimeGenerateRequest =
            serde_json::from_str(r#"{"prompt":"hello"}"#).expect("test");
        assert_eq!(req.max_tokens, 128);
        assert_eq!(req.top_k, 40);
        assert!((req.temperature - 0.8).abs() < f32::EPSILON);
        assert!((req.sampling().top_p - 0.9).abs() < f32::EPSILON);
    }

    #[test]
    fn test_generate_request_requires_prompt() {
        assert!(serde_json::from_str::<RuntimeGenerateRequest>(r#"{"max_tokens":4}"#).is_err());
    }

    #[test]
    fn test_provider_response_tolerates_missing_fields() {
        let resp: ProviderResponse = serde_json::from_str("{}").expect("test");
        assert_eq!(resp, ProviderResponse::default());
    }

    #[test]
    fn test_chat_message_role_defaults_to_user() {
        let msg: ChatMessage = serde_json::from_str(r#"{"content":"x"}"#).expect("test");
        assert_eq!(msg.role, "user");
    }
}
