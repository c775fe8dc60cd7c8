pub mod compaction;
pub mod context;
pub mod daemon;
pub mod events;
mod client;
mod input;
mod run;
mod tools;

pub use client::{DaemonClient, EventStream};
pub use compaction::{CompactionReport, Compacted, Compactor, interaction_length};
pub use context::ContextBuilder;
pub use daemon::Daemon;
pub use daemon::transport::{Endpoint, EndpointError};
pub use events::{EVENT_BUS_CAPACITY, Event, EventBus, EventKind, RunEmitter};
pub use input::{InputError, InputMessage};
pub use run::{RunEngine, RunError, RunSettings, RunSummary};
pub use tools::{ConversationSearchTool, build_registry};
