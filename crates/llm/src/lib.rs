//! Model capability contract: an ordered chat context plus optional tool
//! definitions in, a stream of text and tool-call chunks out.

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

mod ollama;
mod scripted;

pub use ollama::{NdjsonDecoder, OllamaModel};
pub use scripted::{ScriptedModel, ScriptedTurn};

// ── Chat messages ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
    Tool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallFunction {
    pub name: String,
    #[serde(default)]
    pub arguments: Value,
}

/// A tool invocation requested by the assistant, as replayed in context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub function: ToolCallFunction,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    #[serde(default)]
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl ChatMessage {
    fn plain(role: ChatRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::plain(ChatRole::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::plain(ChatRole::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::plain(ChatRole::Assistant, content)
    }

    /// Assistant turn that requested tools, with any text streamed before
    /// the request.
    pub fn assistant_tool_calls(content: impl Into<String>, calls: Vec<ToolCall>) -> Self {
        Self {
            tool_calls: calls,
            ..Self::plain(ChatRole::Assistant, content)
        }
    }

    pub fn tool_result(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            tool_call_id: Some(tool_call_id.into()),
            ..Self::plain(ChatRole::Tool, content)
        }
    }
}

// ── Requests and chunks ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ModelRequest {
    pub messages: Vec<ChatMessage>,
    /// OpenAI-style `tools` array; `None` forbids tool calls.
    pub tools: Option<Value>,
}

/// Token counts reported by the provider for one response.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub request_tokens: u64,
    pub response_tokens: u64,
}

impl TokenUsage {
    pub fn new(request_tokens: u64, response_tokens: u64) -> Self {
        Self {
            request_tokens,
            response_tokens,
        }
    }

    pub fn total_tokens(&self) -> u64 {
        self.request_tokens + self.response_tokens
    }

    pub fn is_empty(&self) -> bool {
        self.total_tokens() == 0
    }
}

impl std::ops::AddAssign for TokenUsage {
    fn add_assign(&mut self, other: Self) {
        self.request_tokens += other.request_tokens;
        self.response_tokens += other.response_tokens;
    }
}

/// One increment of model output.
///
/// A `ToolCall` opens a call; the `ToolCallArgs` fragments that follow,
/// concatenated, form its JSON arguments.  `Usage` may arrive at any point,
/// usually last.
#[derive(Debug, Clone, PartialEq)]
pub enum ModelChunk {
    Text(String),
    ToolCall { id: Option<String>, name: String },
    ToolCallArgs(String),
    Usage(TokenUsage),
}

pub type ModelStream = BoxStream<'static, Result<ModelChunk, ModelError>>;

// ── Errors ───────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("model provider unavailable at {base_url}: {reason}")]
    Unavailable { base_url: String, reason: String },
    #[error("model provider returned HTTP {status}: {body}")]
    Http { status: u16, body: String },
    #[error("model provider error: {0}")]
    Provider(String),
    #[error("malformed model response: {0}")]
    Protocol(String),
    #[error("model request failed: {0}")]
    Request(#[from] reqwest::Error),
}

impl ModelError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Unavailable { .. } => "model_unavailable",
            Self::Http { .. } => "model_http_error",
            Self::Provider(_) => "model_error",
            Self::Protocol(_) => "model_protocol_error",
            Self::Request(err) if err.is_timeout() => "model_timeout",
            Self::Request(_) => "model_request_failed",
        }
    }
}

// ── Capability ───────────────────────────────────────────────────────────────

#[async_trait]
pub trait Model: Send + Sync {
    /// Short identifier for logs.
    fn name(&self) -> &str;

    async fn generate(&self, request: ModelRequest) -> Result<ModelStream, ModelError>;
}
