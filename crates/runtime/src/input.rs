use chrono::Utc;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum InputError {
    #[error("invalid input message: {0}")]
    Json(#[from] serde_json::Error),
    #[error("input message has an empty prompt")]
    EmptyPrompt,
}

/// One ingress line.  `prompt`, `source` and `datetime` are required.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputMessage {
    pub prompt: String,
    pub source: String,
    pub datetime: String,
    /// Run against this thread instead of the most recent one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<Uuid>,
    /// Start a fresh thread.  Ignored when `thread_id` is set.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub new_thread: bool,
    /// Producer-chosen tag echoed on this input's RUN_START.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

impl InputMessage {
    pub fn new(prompt: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            source: source.into(),
            datetime: Utc::now().format("%Y-%m-%dT%H:%M:%S").to_string(),
            thread_id: None,
            new_thread: false,
            request_id: None,
        }
    }

    pub fn in_thread(mut self, thread_id: Uuid) -> Self {
        self.thread_id = Some(thread_id);
        self
    }

    pub fn in_new_thread(mut self) -> Self {
        self.new_thread = true;
        self
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    pub fn parse(line: &str) -> Result<Self, InputError> {
        let message: Self = serde_json::from_str(line.trim())?;
        if message.prompt.trim().is_empty() {
            return Err(InputError::EmptyPrompt);
        }
        Ok(message)
    }

    pub fn to_line(&self) -> Result<String, serde_json::Error> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }
}
