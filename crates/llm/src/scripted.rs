//! Deterministic model that replays pre-recorded turns.

use std::collections::VecDeque;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::Mutex;

use crate::{Model, ModelChunk, ModelError, ModelRequest, ModelStream, TokenUsage};

/// One scripted model response.
#[derive(Debug)]
pub enum ScriptedTurn {
    /// Stream these items in order; an `Err` ends the stream with an error.
    Chunks(Vec<Result<ModelChunk, ModelError>>),
    /// Fail before any chunk is produced.
    Fail(ModelError),
}

impl ScriptedTurn {
    /// Text reply split into word-sized chunks.
    pub fn text(reply: &str) -> Self {
        let mut chunks = Vec::new();
        let mut current = String::new();
        for ch in reply.chars() {
            current.push(ch);
            if ch == ' ' {
                chunks.push(Ok(ModelChunk::Text(std::mem::take(&mut current))));
            }
        }
        if !current.is_empty() {
            chunks.push(Ok(ModelChunk::Text(current)));
        }
        Self::Chunks(chunks)
    }

    /// A single tool request with its arguments in one fragment.
    pub fn tool_call(name: &str, arguments: &str) -> Self {
        Self::Chunks(vec![
            Ok(ModelChunk::ToolCall {
                id: None,
                name: name.to_string(),
            }),
            Ok(ModelChunk::ToolCallArgs(arguments.to_string())),
        ])
    }

    /// Append a usage report to a streaming turn.
    pub fn with_usage(self, request_tokens: u64, response_tokens: u64) -> Self {
        match self {
            Self::Chunks(mut chunks) => {
                chunks.push(Ok(ModelChunk::Usage(TokenUsage::new(request_tokens, response_tokens))));
                Self::Chunks(chunks)
            }
            fail @ Self::Fail(_) => fail,
        }
    }
}

/// Pops one [`ScriptedTurn`] per `generate` call and records every request.
#[derive(Default)]
pub struct ScriptedModel {
    turns: Mutex<VecDeque<ScriptedTurn>>,
    requests: Mutex<Vec<ModelRequest>>,
}

impl ScriptedModel {
    pub fn new(turns: impl IntoIterator<Item = ScriptedTurn>) -> Self {
        Self {
            turns: Mutex::new(turns.into_iter().collect()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub async fn push(&self, turn: ScriptedTurn) {
        self.turns.lock().await.push_back(turn);
    }

    pub async fn requests(&self) -> Vec<ModelRequest> {
        self.requests.lock().await.clone()
    }

    pub async fn remaining(&self) -> usize {
        self.turns.lock().await.len()
    }
}

#[async_trait]
impl Model for ScriptedModel {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn generate(&self, request: ModelRequest) -> Result<ModelStream, ModelError> {
        self.requests.lock().await.push(request);
        match self.turns.lock().await.pop_front() {
            Some(ScriptedTurn::Chunks(items)) => Ok(futures::stream::iter(items).boxed()),
            Some(ScriptedTurn::Fail(err)) => Err(err),
            None => Err(ModelError::Protocol("scripted model has no turns left".into())),
        }
    }
}
