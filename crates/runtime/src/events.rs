use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;
use uuid::Uuid;

use shellbot_history::{ErrorPayload, StepResult};

/// Egress channel capacity.  Lagging subscribers lose the oldest events.
pub const EVENT_BUS_CAPACITY: usize = 1024;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventKind {
    RunStart {
        thread_id: Uuid,
        /// Copied from the input that started the run.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
    },
    TextMessageStart {
        message_id: String,
    },
    TextMessageContent {
        message_id: String,
        delta: String,
    },
    TextMessageEnd {
        message_id: String,
    },
    ToolCallStart {
        tool_call_id: String,
        tool_name: String,
    },
    ToolCallArgs {
        tool_call_id: String,
        delta: String,
    },
    ToolCallEnd {
        tool_call_id: String,
    },
    /// Exactly one of `result` / `error` is present.
    ToolCallResult {
        tool_call_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<ErrorPayload>,
    },
    RunFinished {
        thread_id: Uuid,
    },
    RunError {
        error: ErrorPayload,
    },
}

impl EventKind {
    pub fn tool_call_result(tool_call_id: impl Into<String>, outcome: &StepResult) -> Self {
        let (result, error) = match outcome {
            StepResult::Result(value) => (Some(value.clone()), None),
            StepResult::Error(err) => (None, Some(err.clone())),
        };
        Self::ToolCallResult {
            tool_call_id: tool_call_id.into(),
            result,
            error,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::RunStart { .. } => "RUN_START",
            Self::TextMessageStart { .. } => "TEXT_MESSAGE_START",
            Self::TextMessageContent { .. } => "TEXT_MESSAGE_CONTENT",
            Self::TextMessageEnd { .. } => "TEXT_MESSAGE_END",
            Self::ToolCallStart { .. } => "TOOL_CALL_START",
            Self::ToolCallArgs { .. } => "TOOL_CALL_ARGS",
            Self::ToolCallEnd { .. } => "TOOL_CALL_END",
            Self::ToolCallResult { .. } => "TOOL_CALL_RESULT",
            Self::RunFinished { .. } => "RUN_FINISHED",
            Self::RunError { .. } => "RUN_ERROR",
        }
    }
}

/// One egress event.  `seq` starts at 0 with RUN_START and has no gaps
/// within a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub seq: u64,
    pub run_id: Uuid,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: EventKind,
}

impl Event {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.kind,
            EventKind::RunFinished { .. } | EventKind::RunError { .. }
        )
    }
}

// ── Broadcast bus ────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<Event>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(EVENT_BUS_CAPACITY)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    /// Fire-and-forget; having no subscribers is not an error.
    pub fn publish(&self, event: Event) {
        let _ = self.tx.send(event);
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

/// Stamps events for a single run with its id and the next sequence number.
pub struct RunEmitter {
    bus: EventBus,
    run_id: Uuid,
    next_seq: u64,
}

impl RunEmitter {
    pub fn new(bus: EventBus, run_id: Uuid) -> Self {
        Self {
            bus,
            run_id,
            next_seq: 0,
        }
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn emitted(&self) -> u64 {
        self.next_seq
    }

    pub fn emit(&mut self, kind: EventKind) {
        let event = Event {
            seq: self.next_seq,
            run_id: self.run_id,
            timestamp: Utc::now(),
            kind,
        };
        self.next_seq += 1;
        tracing::trace!(run_id = %self.run_id, seq = event.seq, kind = event.kind.name(), "event");
        self.bus.publish(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn event_wire_shape_is_flat() {
        let run_id = Uuid::new_v4();
        let event = Event {
            seq: 3,
            run_id,
            timestamp: Utc::now(),
            kind: EventKind::TextMessageContent {
                message_id: "m1".into(),
                delta: "hi".into(),
            },
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "TEXT_MESSAGE_CONTENT");
        assert_eq!(value["seq"], 3);
        assert_eq!(value["run_id"], run_id.to_string());
        assert_eq!(value["delta"], "hi");

        let back: Event = serde_json::from_value(value).unwrap();
        assert_eq!(back, event);
    }

    #[test]
    fn tool_result_carries_result_or_error() {
        let ok = EventKind::tool_call_result("c1", &StepResult::Result(json!({"n": 1})));
        let value = serde_json::to_value(&ok).unwrap();
        assert_eq!(value, json!({"type": "TOOL_CALL_RESULT", "tool_call_id": "c1", "result": {"n": 1}}));

        let err = EventKind::tool_call_result(
            "c2",
            &StepResult::Error(ErrorPayload::new("not_found", "no tool named `x`")),
        );
        let value = serde_json::to_value(&err).unwrap();
        assert!(value.get("result").is_none());
        assert_eq!(value["error"]["kind"], "not_found");
    }

    #[tokio::test]
    async fn emitter_numbers_events_from_zero() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();
        let mut emitter = RunEmitter::new(bus, Uuid::new_v4());
        let thread_id = Uuid::new_v4();
        emitter.emit(EventKind::RunStart {
            thread_id,
            request_id: None,
        });
        emitter.emit(EventKind::RunFinished { thread_id });

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert_eq!((first.seq, second.seq), (0, 1));
        assert!(!first.is_terminal());
        assert!(second.is_terminal());
        assert_eq!(emitter.emitted(), 2);
    }

    #[test]
    fn publish_without_subscribers_is_fine() {
        let bus = EventBus::default();
        bus.publish(Event {
            seq: 0,
            run_id: Uuid::new_v4(),
            timestamp: Utc::now(),
            kind: EventKind::RunError {
                error: ErrorPayload::new("model_error", "down"),
            },
        });
        assert_eq!(bus.subscriber_count(), 0);
    }
}
