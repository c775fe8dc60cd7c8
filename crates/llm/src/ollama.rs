//! Ollama `/api/chat` provider with NDJSON streaming.

use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::debug;

use crate::{Model, ModelChunk, ModelError, ModelRequest, ModelStream, TokenUsage};

#[derive(Debug, Clone)]
pub struct OllamaModel {
    client: reqwest::Client,
    base_url: String,
    model: String,
}

impl OllamaModel {
    pub fn new(
        base_url: impl Into<String>,
        model: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, ModelError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            model: model.into(),
        })
    }

    fn payload(&self, request: &ModelRequest) -> Value {
        let mut payload = json!({
            "model": self.model,
            "messages": request.messages,
            "stream": true,
        });
        if let Some(tools) = &request.tools {
            payload["tools"] = tools.clone();
        }
        payload
    }
}

#[async_trait]
impl Model for OllamaModel {
    fn name(&self) -> &str {
        &self.model
    }

    async fn generate(&self, request: ModelRequest) -> Result<ModelStream, ModelError> {
        let endpoint = format!("{}/api/chat", self.base_url);
        debug!(
            model = %self.model,
            messages = request.messages.len(),
            tools = request.tools.is_some(),
            "sending chat request"
        );

        let response = self
            .client
            .post(&endpoint)
            .json(&self.payload(&request))
            .send()
            .await
            .map_err(|err| {
                if err.is_connect() {
                    ModelError::Unavailable {
                        base_url: self.base_url.clone(),
                        reason: err.to_string(),
                    }
                } else {
                    ModelError::Request(err)
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ModelError::Http {
                status: status.as_u16(),
                body,
            });
        }

        let state = StreamState {
            response,
            decoder: NdjsonDecoder::default(),
            pending: VecDeque::new(),
            finished: false,
        };
        let stream = futures::stream::try_unfold(state, next_chunk);
        Ok(stream.boxed())
    }
}

struct StreamState {
    response: reqwest::Response,
    decoder: NdjsonDecoder,
    pending: VecDeque<ModelChunk>,
    finished: bool,
}

async fn next_chunk(
    mut state: StreamState,
) -> Result<Option<(ModelChunk, StreamState)>, ModelError> {
    loop {
        if let Some(chunk) = state.pending.pop_front() {
            return Ok(Some((chunk, state)));
        }
        if state.finished {
            return Ok(None);
        }
        match state.response.chunk().await? {
            Some(bytes) => {
                let chunks = state.decoder.push(&bytes)?;
                state.pending.extend(chunks);
            }
            None => {
                let chunks = state.decoder.finish()?;
                state.pending.extend(chunks);
                state.finished = true;
            }
        }
    }
}

// ── NDJSON decoding ──────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct ChatChunk {
    #[serde(default)]
    message: Option<ChunkMessage>,
    #[serde(default)]
    error: Option<String>,
    /// Present on the final (`done`) chunk.
    #[serde(default)]
    prompt_eval_count: Option<u64>,
    #[serde(default)]
    eval_count: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct ChunkMessage {
    #[serde(default)]
    content: String,
    #[serde(default)]
    tool_calls: Vec<ChunkToolCall>,
}

#[derive(Debug, Deserialize)]
struct ChunkToolCall {
    #[serde(default)]
    id: Option<String>,
    function: ChunkFunction,
}

#[derive(Debug, Deserialize)]
struct ChunkFunction {
    name: String,
    #[serde(default)]
    arguments: Value,
}

/// Splits a byte stream into newline-delimited JSON objects.  Lines may
/// straddle network chunks.
#[derive(Debug, Default)]
pub struct NdjsonDecoder {
    buffer: Vec<u8>,
}

impl NdjsonDecoder {
    pub fn push(&mut self, bytes: &[u8]) -> Result<Vec<ModelChunk>, ModelError> {
        self.buffer.extend_from_slice(bytes);
        let mut out = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            out.extend(parse_line(&line)?);
        }
        Ok(out)
    }

    /// Flush a trailing line that had no newline.
    pub fn finish(&mut self) -> Result<Vec<ModelChunk>, ModelError> {
        let rest = std::mem::take(&mut self.buffer);
        parse_line(&rest)
    }
}

fn parse_line(line: &[u8]) -> Result<Vec<ModelChunk>, ModelError> {
    let text = String::from_utf8_lossy(line);
    let text = text.trim();
    if text.is_empty() {
        return Ok(Vec::new());
    }

    let chunk: ChatChunk =
        serde_json::from_str(text).map_err(|err| ModelError::Protocol(err.to_string()))?;
    if let Some(error) = chunk.error {
        return Err(ModelError::Provider(error));
    }

    let mut out = Vec::new();
    if let Some(message) = chunk.message {
        if !message.content.is_empty() {
            out.push(ModelChunk::Text(message.content));
        }
        for call in message.tool_calls {
            out.push(ModelChunk::ToolCall {
                id: call.id,
                name: call.function.name,
            });
            let args = match call.function.arguments {
                Value::Null => String::new(),
                Value::String(raw) => raw,
                other => other.to_string(),
            };
            if !args.is_empty() {
                out.push(ModelChunk::ToolCallArgs(args));
            }
        }
    }
    if chunk.prompt_eval_count.is_some() || chunk.eval_count.is_some() {
        out.push(ModelChunk::Usage(TokenUsage::new(
            chunk.prompt_eval_count.unwrap_or(0),
            chunk.eval_count.unwrap_or(0),
        )));
    }
    Ok(out)
}
