use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    Tool,
}

impl Role {
    pub fn label(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::Tool => "tool",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

impl Message {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            created_at: Utc::now(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }
}

/// Human-readable error carried on the wire and stored in failed steps.
///
/// `kind` is a stable snake_case slug (`not_found`, `invalid_arguments`,
/// `execution_failed`, `model_error`, ...); `message` is free text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub kind: String,
    pub message: String,
}

impl ErrorPayload {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ErrorPayload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

/// Outcome of one tool invocation.  Serializes as `{"result": ...}` or
/// `{"error": {"kind": ..., "message": ...}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepResult {
    Result(Value),
    Error(ErrorPayload),
}

impl StepResult {
    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error(_))
    }

    /// Text fed back to the model as the tool-role message.
    pub fn to_model_text(&self) -> String {
        match self {
            Self::Result(Value::String(text)) => text.clone(),
            Self::Result(value) => value.to_string(),
            Self::Error(err) => format!("error ({}): {}", err.kind, err.message),
        }
    }
}

/// One tool invocation within an interaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    /// Id used for this call on the event stream.
    pub tool_call_id: String,
    pub tool_name: String,
    pub arguments: Value,
    pub result: StepResult,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    /// Assistant text streamed in the same model turn, ahead of the request.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assistant_message: Option<Message>,
}

/// One full conversational turn: the user's message, every step taken to
/// answer it, and the final assistant reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Interaction {
    pub id: Uuid,
    pub user_message: Message,
    #[serde(default)]
    pub steps: Vec<Step>,
    pub final_message: Message,
}

impl Interaction {
    pub fn new(user_message: Message, steps: Vec<Step>, final_message: Message) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_message,
            steps,
            final_message,
        }
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.user_message.created_at
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Thread {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub interactions: Vec<Interaction>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThreadSummary {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub interaction_count: usize,
}
