//! Durable, append-only conversation history.
//!
//! Threads are ordered sequences of [`Interaction`]s.  Every change is one
//! JSONL record in the log; the in-memory index is rebuilt from the log on
//! open, so history survives restarts.

pub mod event_log;
pub mod schema;
pub mod search;
pub mod store;
pub mod usage;

pub use event_log::{HistoryEntry, HistoryLog, HistoryRecord};
pub use schema::{ErrorPayload, Interaction, Message, Role, Step, StepResult, Thread, ThreadSummary};
pub use search::SearchHit;
pub use store::{HistoryError, HistoryStore};
pub use usage::{UsageLog, UsageRecord, UsageReport, UsageTotals};
