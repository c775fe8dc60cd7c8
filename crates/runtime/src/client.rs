use std::time::Duration;

use anyhow::{Result, bail};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tracing::{debug, warn};
use uuid::Uuid;

use shellbot_config::DaemonConfig;

use crate::daemon::transport::{BoxedReader, BoxedWriter, Endpoint};
use crate::events::{Event, EventKind};
use crate::input::InputMessage;

#[derive(Debug, Clone)]
pub struct DaemonClient {
    input: Endpoint,
    output: Endpoint,
}

impl DaemonClient {
    pub fn new(input: Endpoint, output: Endpoint) -> Self {
        Self { input, output }
    }

    pub fn from_config(config: &DaemonConfig) -> Result<Self> {
        Ok(Self::new(
            Endpoint::parse(&config.input_address)?,
            Endpoint::parse(&config.output_address)?,
        ))
    }

    pub async fn connect_with_backoff(&self, max_attempts: usize) -> Result<()> {
        let mut delay = Duration::from_millis(100);
        for attempt in 0..max_attempts.max(1) {
            match self.output.connect().await {
                Ok(_) => return Ok(()),
                Err(err) => {
                    if attempt + 1 == max_attempts.max(1) {
                        return Err(err.into());
                    }
                    warn!(attempt, ?err, "daemon connect failed; retrying");
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(Duration::from_secs(2));
                }
            }
        }
        Ok(())
    }

    /// Submit one input line and hang up.
    pub async fn send(&self, message: &InputMessage) -> Result<()> {
        let (_, mut writer) = self.input.connect().await?;
        writer.write_all(message.to_line()?.as_bytes()).await?;
        writer.flush().await?;
        writer.shutdown().await?;
        debug!(endpoint = %self.input, "input sent");
        Ok(())
    }

    pub async fn subscribe(&self) -> Result<EventStream> {
        let (reader, writer) = self.output.connect().await?;
        Ok(EventStream {
            lines: BufReader::new(reader).lines(),
            _writer: writer,
        })
    }

    /// Send `message` and follow the run it starts, handing each of its
    /// events to `on_event`.  Returns the terminal event.  The run is found by
    /// the `request_id` echoed on RUN_START; one is generated when the message
    /// has none.
    pub async fn ask(&self, message: &InputMessage, on_event: impl FnMut(&Event)) -> Result<Event> {
        let mut events = self.subscribe().await?;
        self.ask_via(&mut events, message, on_event).await
    }

    /// [`ask`](Self::ask) over an existing subscription.
    pub async fn ask_via(
        &self,
        events: &mut EventStream,
        message: &InputMessage,
        mut on_event: impl FnMut(&Event),
    ) -> Result<Event> {
        let mut message = message.clone();
        let request_id = message
            .request_id
            .get_or_insert_with(|| format!("req_{}", Uuid::new_v4().simple()))
            .clone();
        self.send(&message).await?;

        let mut run_id: Option<Uuid> = None;
        while let Some(event) = events.next_event().await? {
            match (&event.kind, run_id) {
                (EventKind::RunStart { request_id: Some(tag), .. }, None) if *tag == request_id => {
                    run_id = Some(event.run_id);
                }
                (_, Some(id)) if id == event.run_id => {}
                _ => continue,
            }
            on_event(&event);
            if event.is_terminal() {
                return Ok(event);
            }
        }
        bail!("daemon closed the event stream before the run finished")
    }
}

/// Decoded egress lines.
pub struct EventStream {
    lines: Lines<BufReader<BoxedReader>>,
    // Held open for the life of the subscription.
    _writer: BoxedWriter,
}

impl EventStream {
    /// Next event, skipping lines that do not decode.  `None` once the
    /// daemon hangs up.
    pub async fn next_event(&mut self) -> Result<Option<Event>> {
        while let Some(line) = self.lines.next_line().await? {
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            match serde_json::from_str::<Event>(trimmed) {
                Ok(event) => return Ok(Some(event)),
                Err(err) => warn!("event stream: bad json: {err}"),
            }
        }
        Ok(None)
    }
}
