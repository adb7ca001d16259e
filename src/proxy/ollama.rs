//! Ollama API request/response types and the Qwen ChatML template

use serde::{Deserialize, Serialize};

use crate::runtime_api::{ChatMessage, RuntimeGenerateRequest, DEFAULT_MAX_TOKENS};
use crate::sampling::SamplingParams;

/// Version reported on `GET /api/version`
pub const OLLAMA_COMPAT_VERSION: &str = "0.5.0";

/// `options` object shared by generate and chat
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OllamaOptions {
    /// New-token budget; zero or negative means the default
    #[serde(default)]
    pub num_predict: Option<i64>,
    /// Sampling temperature
    #[serde(default)]
    pub temperature: Option<f32>,
    /// Nucleus threshold
    #[serde(default)]
    pub top_p: Option<f32>,
    /// Top-k cutoff
    #[serde(default)]
    pub top_k: Option<usize>,
}

impl OllamaOptions {
    /// Runtime generate body for `prompt` with these options applied
    #[must_use]
    pub fn to_runtime_request(&self, prompt: impl Into<String>) -> RuntimeGenerateRequest {
        let defaults = SamplingParams::default();
        let max_tokens = self
            .num_predict
            .and_then(|n| usize::try_from(n).ok())
            .filter(|&n| n > 0)
            .unwrap_or(DEFAULT_MAX_TOKENS);
        RuntimeGenerateRequest::new(prompt, max_tokens).with_sampling(
            self.temperature.unwrap_or(defaults.temperature),
            self.top_p.unwrap_or(defaults.top_p),
            self.top_k.unwrap_or(defaults.top_k),
        )
    }
}

/// `POST /api/generate` body
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OllamaGenerateRequest {
    /// Requested model name (informational; one model is served)
    #[serde(default)]
    pub model: Option<String>,
    /// Prompt text
    #[serde(default)]
    pub prompt: String,
    /// System prompt, sent to the runtime on reset
    #[serde(default)]
    pub system: Option<String>,
    /// Stream NDJSON chunks; Ollama defaults to true
    #[serde(default)]
    pub stream: Option<bool>,
    /// Generation options
    #[serde(default)]
    pub options: OllamaOptions,
}

/// `POST /api/chat` body
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OllamaChatRequest {
    /// Requested model name
    #[serde(default)]
    pub model: Option<String>,
    /// Conversation
    #[serde(default)]
    pub messages: Vec<ChatMessage>,
    /// Stream NDJSON chunks; Ollama defaults to true
    #[serde(default)]
    pub stream: Option<bool>,
    /// Generation options
    #[serde(default)]
    pub options: OllamaOptions,
}

/// Timing and count fields on the final Ollama reply
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OllamaStats {
    /// Why generation ended (`stop` or `length`)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub done_reason: Option<String>,
    /// Whole request, nanoseconds
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_duration: Option<u64>,
    /// Model load time, nanoseconds
    #[serde(skip_serializing_if = "Option::is_none")]
    pub load_duration: Option<u64>,
    /// Estimated prompt tokens
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompt_eval_count: Option<usize>,
    /// Estimated generated tokens
    #[serde(skip_serializing_if = "Option::is_none")]
    pub eval_count: Option<usize>,
    /// Generation time, nanoseconds
    #[serde(skip_serializing_if = "Option::is_none")]
    pub eval_duration: Option<u64>,
}

/// One `/api/generate` reply line
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OllamaGenerateResponse {
    /// Model name
    pub model: String,
    /// RFC 3339 timestamp
    pub created_at: String,
    /// Text of this chunk (or the whole reply)
    pub response: String,
    /// Last line of the reply
    pub done: bool,
    /// Final statistics
    #[serde(flatten)]
    pub stats: OllamaStats,
}

/// One `/api/chat` reply line
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OllamaChatResponse {
    /// Model name
    pub model: String,
    /// RFC 3339 timestamp
    pub created_at: String,
    /// Assistant message (chunk or whole reply)
    pub message: ChatMessage,
    /// Last line of the reply
    pub done: bool,
    /// Final statistics
    #[serde(flatten)]
    pub stats: OllamaStats,
}

/// Model details in `/api/tags`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelDetails {
    /// Artifact format
    pub format: String,
    /// Model family
    pub family: String,
    /// Families list
    pub families: Vec<String>,
    /// Parameter count label
    pub parameter_size: String,
    /// Quantization label
    pub quantization_level: String,
}

/// One entry of `/api/tags`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelTag {
    /// Display name
    pub name: String,
    /// Model identifier
    pub model: String,
    /// RFC 3339 timestamp
    pub modified_at: String,
    /// Size on disk in bytes (unknown: 0)
    pub size: u64,
    /// Content digest (unknown: empty)
    pub digest: String,
    /// Details block
    pub details: ModelDetails,
}

impl ModelTag {
    /// The Qwen3-4B AX650 model entry
    #[must_use]
    pub fn qwen3(name: &str, modified_at: String) -> Self {
        Self {
            name: name.to_string(),
            model: name.to_string(),
            modified_at,
            size: 0,
            digest: String::new(),
            details: ModelDetails {
                format: "axmodel".to_string(),
                family: "qwen3".to_string(),
                families: vec!["qwen3".to_string()],
                parameter_size: "4B".to_string(),
                quantization_level: "w8a16".to_string(),
            },
        }
    }
}

/// `GET /api/tags` reply
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagsResponse {
    /// Served models
    pub models: Vec<ModelTag>,
}

/// `GET /api/version` reply
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionResponse {
    /// Compatible Ollama version
    pub version: String,
}

/// Render a conversation with the Qwen ChatML template
///
/// System messages are skipped; the proxy hands them to the runtime as its
/// system prompt. The result ends with an open assistant turn.
#[must_use]
pub fn render_chatml(messages: &[ChatMessage]) -> String {
    let mut out = String::new();
    for msg in messages.iter().filter(|m| m.role != "system") {
        out.push_str("<|im_start|>");
        out.push_str(&msg.role);
        out.push('\n');
        out.push_str(&msg.content);
        out.push_str("<|im_end|>\n");
    }
    out.push_str("<|im_start|>assistant\n");
    out
}

/// Concatenated content of all system messages
#[must_use]
pub fn system_prompt(messages: &[ChatMessage]) -> String {
    messages
        .iter()
        .filter(|m| m.role == "system")
        .map(|m| m.content.as_str())
        .collect::<Vec<_>>()
        .join("\n")
}

/// Whitespace word count, used where the runtime reports no token counts
#[must_use]
pub fn estimate_tokens(text: &str) -> usize {
    text.split_whitespace().count()
}
