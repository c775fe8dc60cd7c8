//! Agent run engine.
//!
//! One run answers one [`InputMessage`]:
//!
//! ```text
//! START ──► THINKING ──► TOOL_CALLING ──► THINKING ... ──► FINISHED
//!                │
//!                └────────────── model failure ───────────► ERROR
//! ```
//!
//! Tool failures are results, not run failures.  Only a completed run is
//! written to the history store.

use std::sync::Arc;

use chrono::Utc;
use futures::StreamExt;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use shellbot_config::{AppConfig, CompactionConfig};
use shellbot_history::{
    ErrorPayload, HistoryError, HistoryStore, Interaction, Message, Step, StepResult, UsageLog,
    UsageRecord,
};
use shellbot_llm::{Model, ModelChunk, ModelError, ModelRequest, TokenUsage};
use shellbot_tools::ToolRegistry;

use crate::compaction::Compactor;
use crate::context::{ContextBuilder, push_step};
use crate::events::{EventBus, EventKind, RunEmitter};
use crate::input::InputMessage;

#[derive(Debug, Error)]
pub enum RunError {
    #[error(transparent)]
    Model(#[from] ModelError),
    #[error("history store failed: {0}")]
    History(#[from] HistoryError),
    #[error("model requested tool `{0}` after the last tool round")]
    ToolRoundsExhausted(String),
}

impl RunError {
    pub fn payload(&self) -> ErrorPayload {
        let kind = match self {
            Self::Model(err) => err.kind(),
            Self::History(_) => "history_error",
            Self::ToolRoundsExhausted(_) => "tool_rounds_exhausted",
        };
        ErrorPayload::new(kind, self.to_string())
    }
}

#[derive(Debug, Clone)]
pub struct RunSettings {
    pub instructions: String,
    pub compaction: CompactionConfig,
    pub recent_messages_limit: usize,
    pub max_tool_rounds: usize,
}

impl Default for RunSettings {
    fn default() -> Self {
        Self {
            instructions: String::new(),
            compaction: CompactionConfig::default(),
            recent_messages_limit: 5,
            max_tool_rounds: 10,
        }
    }
}

impl RunSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            instructions: config.agent.instructions.clone(),
            compaction: config.compaction.clone(),
            recent_messages_limit: config.history.recent_messages_limit,
            max_tool_rounds: config.run.max_tool_rounds,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub thread_id: Uuid,
    pub interaction: Interaction,
    pub events: u64,
    /// Summed over every model pass of the run.
    pub usage: TokenUsage,
}

/// A tool request as it was streamed.
#[derive(Debug)]
struct PendingCall {
    id: String,
    name: String,
    raw_args: String,
}

/// What one THINKING pass produced.
#[derive(Debug, Default)]
struct ModelTurn {
    text: String,
    calls: Vec<PendingCall>,
    usage: TokenUsage,
}

pub struct RunEngine {
    model: Arc<dyn Model>,
    tools: Arc<ToolRegistry>,
    history: Arc<HistoryStore>,
    bus: EventBus,
    usage_log: Option<Arc<UsageLog>>,
    compactor: Compactor,
    context: ContextBuilder,
    recent_messages_limit: usize,
    max_tool_rounds: usize,
}

impl RunEngine {
    pub fn new(
        model: Arc<dyn Model>,
        tools: Arc<ToolRegistry>,
        history: Arc<HistoryStore>,
        bus: EventBus,
        settings: RunSettings,
    ) -> Self {
        Self {
            model,
            tools,
            history,
            bus,
            usage_log: None,
            compactor: Compactor::new(settings.compaction),
            context: ContextBuilder::new(settings.instructions),
            recent_messages_limit: settings.recent_messages_limit,
            max_tool_rounds: settings.max_tool_rounds.max(1),
        }
    }

    /// Record token usage of every finished run to `log`.
    pub fn with_usage_log(mut self, log: Arc<UsageLog>) -> Self {
        self.usage_log = Some(log);
        self
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn history(&self) -> &Arc<HistoryStore> {
        &self.history
    }

    /// Execute one run against `thread_id`.  Always emits RUN_START and
    /// exactly one of RUN_FINISHED / RUN_ERROR.
    pub async fn run(&self, thread_id: Uuid, input: &InputMessage) -> Result<RunSummary, RunError> {
        let run_id = Uuid::new_v4();
        let mut emitter = RunEmitter::new(self.bus.clone(), run_id);
        info!(%run_id, %thread_id, source = %input.source, "run started");

        let history = self
            .history
            .recent(thread_id, self.recent_messages_limit)
            .await
            .map(|interactions| self.compactor.compact(&interactions).interactions);
        emitter.emit(EventKind::RunStart {
            thread_id,
            request_id: input.request_id.clone(),
        });

        let mut usage = TokenUsage::default();
        let outcome = match history {
            Ok(history) => {
                self.drive(thread_id, &history, input, &mut emitter, &mut usage)
                    .await
            }
            Err(err) => Err(RunError::from(err)),
        };

        match outcome {
            Ok(interaction) => {
                emitter.emit(EventKind::RunFinished { thread_id });
                info!(
                    %run_id,
                    %thread_id,
                    steps = interaction.steps.len(),
                    events = emitter.emitted(),
                    request_tokens = usage.request_tokens,
                    response_tokens = usage.response_tokens,
                    "run finished"
                );
                self.record_usage(run_id, thread_id, usage).await;
                Ok(RunSummary {
                    run_id,
                    thread_id,
                    interaction,
                    events: emitter.emitted(),
                    usage,
                })
            }
            Err(err) => {
                warn!(%run_id, %thread_id, error = %err, "run failed");
                emitter.emit(EventKind::RunError {
                    error: err.payload(),
                });
                Err(err)
            }
        }
    }

    async fn record_usage(&self, run_id: Uuid, thread_id: Uuid, usage: TokenUsage) {
        let Some(log) = &self.usage_log else { return };
        if usage.is_empty() {
            return;
        }
        let record = UsageRecord::new(
            run_id,
            thread_id,
            self.model.name(),
            usage.request_tokens,
            usage.response_tokens,
        );
        if let Err(err) = log.record(&record).await {
            warn!(%run_id, error = %err, path = %log.path().display(), "failed to record token usage");
        }
    }

    async fn drive(
        &self,
        thread_id: Uuid,
        history: &[Interaction],
        input: &InputMessage,
        emitter: &mut RunEmitter,
        usage: &mut TokenUsage,
    ) -> Result<Interaction, RunError> {
        let user_message = Message::user(input.prompt.clone());
        let mut messages = self.context.build(history, &input.prompt);
        let tools = self.tools.to_openai_tools();
        let mut steps: Vec<Step> = Vec::new();

        for round in 0..self.max_tool_rounds {
            let last_round = round + 1 == self.max_tool_rounds;
            let request = ModelRequest {
                messages: messages.clone(),
                tools: if last_round { None } else { tools.clone() },
            };
            debug!(run_id = %emitter.run_id(), round, messages = request.messages.len(), "thinking");

            let turn = self.think(request, emitter).await?;
            *usage += turn.usage;
            if turn.calls.is_empty() {
                let interaction = Interaction::new(user_message, steps, Message::assistant(turn.text));
                self.history
                    .append_interaction(thread_id, interaction.clone())
                    .await?;
                return Ok(interaction);
            }
            if last_round {
                return Err(RunError::ToolRoundsExhausted(turn.calls[0].name.clone()));
            }

            let mut preamble = (!turn.text.is_empty()).then(|| Message::assistant(turn.text));
            for call in turn.calls {
                let step = self.call_tool(call, preamble.take(), emitter).await;
                push_step(&mut messages, &step);
                steps.push(step);
            }
        }

        // The loop always returns on its last round.
        Err(RunError::ToolRoundsExhausted(String::new()))
    }

    /// Stream one model response, emitting text and tool-call events.
    async fn think(&self, request: ModelRequest, emitter: &mut RunEmitter) -> Result<ModelTurn, RunError> {
        let mut stream = self.model.generate(request).await?;
        let mut turn = ModelTurn::default();
        let mut open_message: Option<String> = None;
        let mut call_open = false;

        while let Some(chunk) = stream.next().await {
            match chunk? {
                ModelChunk::Text(delta) => {
                    if delta.is_empty() {
                        continue;
                    }
                    if call_open {
                        close_call(&turn, emitter);
                        call_open = false;
                    }
                    let message_id = open_message.get_or_insert_with(|| {
                        let id = format!("msg_{}", Uuid::new_v4().simple());
                        emitter.emit(EventKind::TextMessageStart {
                            message_id: id.clone(),
                        });
                        id
                    });
                    emitter.emit(EventKind::TextMessageContent {
                        message_id: message_id.clone(),
                        delta: delta.clone(),
                    });
                    turn.text.push_str(&delta);
                }
                ModelChunk::ToolCall { id, name } => {
                    if let Some(message_id) = open_message.take() {
                        emitter.emit(EventKind::TextMessageEnd { message_id });
                    }
                    if call_open {
                        close_call(&turn, emitter);
                    }
                    let id = id
                        .filter(|id| !id.is_empty())
                        .unwrap_or_else(|| format!("call_{}", Uuid::new_v4().simple()));
                    emitter.emit(EventKind::ToolCallStart {
                        tool_call_id: id.clone(),
                        tool_name: name.clone(),
                    });
                    turn.calls.push(PendingCall {
                        id,
                        name,
                        raw_args: String::new(),
                    });
                    call_open = true;
                }
                ModelChunk::ToolCallArgs(delta) => {
                    let Some(call) = turn.calls.last_mut().filter(|_| call_open) else {
                        return Err(ModelError::Protocol(
                            "tool call arguments without an open tool call".into(),
                        )
                        .into());
                    };
                    emitter.emit(EventKind::ToolCallArgs {
                        tool_call_id: call.id.clone(),
                        delta: delta.clone(),
                    });
                    call.raw_args.push_str(&delta);
                }
                ModelChunk::Usage(usage) => turn.usage += usage,
            }
        }

        if let Some(message_id) = open_message.take() {
            emitter.emit(EventKind::TextMessageEnd { message_id });
        }
        if call_open {
            close_call(&turn, emitter);
        }
        Ok(turn)
    }

    async fn call_tool(
        &self,
        call: PendingCall,
        assistant_message: Option<Message>,
        emitter: &mut RunEmitter,
    ) -> Step {
        let started_at = Utc::now();
        let (arguments, result) = match parse_arguments(&call.raw_args) {
            Ok(arguments) => {
                let result = match self.tools.invoke(&call.name, &arguments).await {
                    Ok(value) => StepResult::Result(value),
                    Err(err) => {
                        warn!(tool = %call.name, kind = err.kind(), error = %err, "tool call failed");
                        StepResult::Error(ErrorPayload::new(err.kind(), err.to_string()))
                    }
                };
                (arguments, result)
            }
            Err(err) => {
                warn!(tool = %call.name, error = %err, "unparsable tool arguments");
                (
                    Value::String(call.raw_args.clone()),
                    StepResult::Error(ErrorPayload::new(
                        "invalid_arguments",
                        format!("arguments are not valid JSON: {err}"),
                    )),
                )
            }
        };
        debug!(tool = %call.name, tool_call_id = %call.id, error = result.is_error(), "tool call complete");
        emitter.emit(EventKind::tool_call_result(call.id.clone(), &result));

        Step {
            tool_call_id: call.id,
            tool_name: call.name,
            arguments,
            result,
            started_at,
            ended_at: Utc::now(),
            assistant_message,
        }
    }
}

fn close_call(turn: &ModelTurn, emitter: &mut RunEmitter) {
    if let Some(call) = turn.calls.last() {
        emitter.emit(EventKind::ToolCallEnd {
            tool_call_id: call.id.clone(),
        });
    }
}

fn parse_arguments(raw: &str) -> Result<Value, serde_json::Error> {
    if raw.trim().is_empty() {
        return Ok(Value::Object(serde_json::Map::new()));
    }
    serde_json::from_str(raw)
}
