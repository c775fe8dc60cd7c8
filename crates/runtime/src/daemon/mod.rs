//! The persistent daemon: ingress socket → run queue → run engine → event bus
//! → egress socket.
//!
//! Input lines may arrive on any number of connections, but the single run
//! loop takes them one at a time, so the events of two runs never interleave.

mod egress;
mod ingress;
pub mod transport;

use std::io;

use anyhow::{Context, Result};
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};
use uuid::Uuid;

use shellbot_config::DaemonConfig;

use crate::input::InputMessage;
use crate::run::RunEngine;

use transport::{Endpoint, Listener};

pub struct Daemon {
    engine: RunEngine,
    input: Listener,
    output: Listener,
    queue_capacity: usize,
    max_line_bytes: usize,
}

impl Daemon {
    /// Bind both endpoints.  Fails before any input is accepted when either
    /// address is unusable.
    pub async fn bind(config: &DaemonConfig, engine: RunEngine) -> Result<Self> {
        let input_endpoint = Endpoint::parse(&config.input_address)?;
        let output_endpoint = Endpoint::parse(&config.output_address)?;
        let input = Listener::bind(&input_endpoint)
            .await
            .with_context(|| format!("failed to bind ingress {input_endpoint}"))?;
        let output = Listener::bind(&output_endpoint)
            .await
            .with_context(|| format!("failed to bind egress {output_endpoint}"))?;
        Ok(Self {
            engine,
            input,
            output,
            queue_capacity: config.queue_capacity.max(1),
            max_line_bytes: config.max_line_bytes.max(1),
        })
    }

    pub fn input_endpoint(&self) -> io::Result<Endpoint> {
        self.input.local_endpoint()
    }

    pub fn output_endpoint(&self) -> io::Result<Endpoint> {
        self.output.local_endpoint()
    }

    /// Serve until `shutdown_rx` flips to `true`.  A run in progress is
    /// allowed to finish; inputs still queued are dropped.
    pub async fn serve(self, shutdown_rx: watch::Receiver<bool>) -> Result<()> {
        let Self {
            engine,
            input,
            output,
            queue_capacity,
            max_line_bytes,
        } = self;
        info!(
            input = %input.local_endpoint()?,
            output = %output.local_endpoint()?,
            queue_capacity,
            "daemon listening"
        );

        let (queue_tx, queue_rx) = mpsc::channel::<InputMessage>(queue_capacity);
        let ingress = tokio::spawn(ingress::accept_loop(
            input,
            queue_tx,
            max_line_bytes,
            shutdown_rx.clone(),
        ));
        let egress = tokio::spawn(egress::accept_loop(
            output,
            engine.bus().clone(),
            shutdown_rx.clone(),
        ));

        run_loop(&engine, queue_rx, shutdown_rx).await;

        if let Err(err) = ingress.await {
            error!(error = %err, "ingress task failed");
        }
        if let Err(err) = egress.await {
            error!(error = %err, "egress task failed");
        }
        info!("daemon stopped");
        Ok(())
    }
}

async fn run_loop(
    engine: &RunEngine,
    mut queue_rx: mpsc::Receiver<InputMessage>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    break;
                }
            }
            next = queue_rx.recv() => {
                let Some(message) = next else { break };
                let Some(thread_id) = select_thread(engine, &message).await else {
                    continue;
                };
                // Failures are already reported as RUN_ERROR on the bus.
                let _ = engine.run(thread_id, &message).await;
            }
        }
    }
    let dropped = queue_rx.len();
    if dropped > 0 {
        warn!(dropped, "discarding queued inputs at shutdown");
    }
}

/// Explicit `thread_id` first, then `new_thread`, else the most recently
/// active thread.  An unknown explicit id rejects the input.
async fn select_thread(engine: &RunEngine, message: &InputMessage) -> Option<Uuid> {
    let history = engine.history();
    if let Some(thread_id) = message.thread_id {
        if history.contains(thread_id).await {
            return Some(thread_id);
        }
        warn!(%thread_id, source = %message.source, "rejecting input for unknown thread");
        return None;
    }

    let selected = if message.new_thread {
        history.create_thread().await
    } else {
        history.resume_latest().await
    };
    match selected {
        Ok(thread_id) => Some(thread_id),
        Err(err) => {
            error!(error = %err, "cannot select a thread; dropping input");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use shellbot_history::HistoryStore;
    use shellbot_llm::{ScriptedModel, ScriptedTurn};
    use shellbot_tools::{ShellTool, ToolRegistry};
    use tempfile::TempDir;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

    use crate::events::{Event, EventBus, EventKind};
    use crate::run::RunSettings;

    struct Running {
        input: Endpoint,
        events: tokio::io::Lines<BufReader<transport::BoxedReader>>,
        bus: EventBus,
        model: Arc<ScriptedModel>,
        history: Arc<HistoryStore>,
        shutdown_tx: watch::Sender<bool>,
        handle: tokio::task::JoinHandle<Result<()>>,
    }

    async fn start(config: DaemonConfig, turns: Vec<ScriptedTurn>) -> Running {
        start_with_tools(config, turns, ToolRegistry::default()).await
    }

    async fn start_with_tools(
        config: DaemonConfig,
        turns: Vec<ScriptedTurn>,
        tools: ToolRegistry,
    ) -> Running {
        let model = Arc::new(ScriptedModel::new(turns));
        let history = Arc::new(HistoryStore::in_memory());
        let bus = EventBus::new(256);
        let engine = RunEngine::new(
            model.clone(),
            Arc::new(tools),
            history.clone(),
            bus.clone(),
            RunSettings::default(),
        );
        let daemon = Daemon::bind(&config, engine).await.unwrap();
        let input = daemon.input_endpoint().unwrap();
        let output = daemon.output_endpoint().unwrap();

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(daemon.serve(shutdown_rx));

        let (reader, _writer) = output.connect().await.unwrap();
        for _ in 0..200 {
            if bus.subscriber_count() > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(bus.subscriber_count(), 1);

        Running {
            input,
            events: BufReader::new(reader).lines(),
            bus,
            model,
            history,
            shutdown_tx,
            handle,
        }
    }

    fn tcp_config() -> DaemonConfig {
        DaemonConfig {
            input_address: "tcp://127.0.0.1:0".into(),
            output_address: "tcp://127.0.0.1:0".into(),
            queue_capacity: 8,
            ..DaemonConfig::default()
        }
    }

    impl Running {
        async fn send_raw(&self, payload: &str) {
            self.send_bytes(payload.as_bytes()).await;
        }

        async fn send_bytes(&self, payload: &[u8]) {
            let (_, mut writer) = self.input.connect().await.unwrap();
            writer.write_all(payload).await.unwrap();
            writer.flush().await.unwrap();
            writer.shutdown().await.unwrap();
        }

        /// One connection, one line at a time.
        async fn send_lines(&self, lines: &[String]) {
            let (_, mut writer) = self.input.connect().await.unwrap();
            for line in lines {
                writer.write_all(line.as_bytes()).await.unwrap();
                writer.flush().await.unwrap();
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            writer.shutdown().await.unwrap();
        }

        async fn next_event(&mut self) -> Event {
            let line = tokio::time::timeout(Duration::from_secs(5), self.events.next_line())
                .await
                .expect("timed out waiting for an event")
                .unwrap()
                .expect("egress closed");
            serde_json::from_str(&line).unwrap()
        }

        /// Events of one run, RUN_START through the terminal event.
        async fn next_run(&mut self) -> Vec<Event> {
            let mut events = vec![self.next_event().await];
            assert_eq!(events[0].kind.name(), "RUN_START");
            while !events.last().is_some_and(Event::is_terminal) {
                events.push(self.next_event().await);
            }
            events
        }

        async fn stop(self) {
            self.shutdown_tx.send(true).unwrap();
            tokio::time::timeout(Duration::from_secs(5), self.handle)
                .await
                .unwrap()
                .unwrap()
                .unwrap();
        }
    }

    fn line(message: &InputMessage) -> String {
        message.to_line().unwrap()
    }

    fn assert_single_run(events: &[Event]) {
        let run_id = events[0].run_id;
        for (i, event) in events.iter().enumerate() {
            assert_eq!(event.run_id, run_id);
            assert_eq!(event.seq, i as u64);
        }
    }

    #[tokio::test]
    async fn back_to_back_inputs_run_sequentially() {
        let mut daemon = start(
            tcp_config(),
            vec![ScriptedTurn::text("first reply here"), ScriptedTurn::text("second reply")],
        )
        .await;

        let batch = format!(
            "{}{}",
            line(&InputMessage::new("one", "test")),
            line(&InputMessage::new("two", "test"))
        );
        daemon.send_raw(&batch).await;

        let first = daemon.next_run().await;
        let second = daemon.next_run().await;
        assert_single_run(&first);
        assert_single_run(&second);
        assert_ne!(first[0].run_id, second[0].run_id);
        assert_eq!(first.last().unwrap().kind.name(), "RUN_FINISHED");
        assert_eq!(second.last().unwrap().kind.name(), "RUN_FINISHED");

        let thread_id = daemon.history.latest_thread().await.unwrap();
        let stored = daemon.history.recent(thread_id, 10).await.unwrap();
        assert_eq!(stored.len(), 2);
        assert_eq!(stored[0].user_message.content, "one");
        assert_eq!(stored[1].user_message.content, "two");

        daemon.stop().await;
    }

    #[tokio::test]
    async fn malformed_and_unknown_thread_inputs_are_skipped() {
        let mut daemon = start(tcp_config(), vec![ScriptedTurn::text("ok")]).await;

        let batch = format!(
            "not json at all\n{{\"prompt\":\"missing fields\"}}\n{}{}",
            line(&InputMessage::new("stray", "test").in_thread(Uuid::new_v4())),
            line(&InputMessage::new("valid", "test")),
        );
        daemon.send_raw(&batch).await;

        let run = daemon.next_run().await;
        assert_single_run(&run);
        assert_eq!(run.last().unwrap().kind.name(), "RUN_FINISHED");
        assert_eq!(daemon.model.requests().await.len(), 1);
        let last_user = daemon.model.requests().await[0].messages.last().unwrap().content.clone();
        assert_eq!(last_user, "valid");

        daemon.stop().await;
    }

    #[tokio::test]
    async fn non_utf8_line_does_not_drop_the_rest_of_the_connection() {
        let mut daemon = start(tcp_config(), vec![ScriptedTurn::text("ok")]).await;

        let mut payload = b"{\"prompt\":\"bad \xff\",\"source\":\"t\",\"datetime\":\"x\"}\n".to_vec();
        payload.extend(line(&InputMessage::new("valid", "test")).into_bytes());
        daemon.send_bytes(&payload).await;

        let run = daemon.next_run().await;
        assert_eq!(run.last().unwrap().kind.name(), "RUN_FINISHED");
        let requests = daemon.model.requests().await;
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].messages.last().unwrap().content, "valid");

        daemon.stop().await;
    }

    #[tokio::test]
    async fn concurrent_producers_share_one_fifo_queue() {
        const PRODUCERS: usize = 3;
        const PER_PRODUCER: usize = 3;
        let turns = (0..PRODUCERS * PER_PRODUCER)
            .map(|_| ScriptedTurn::text("noted"))
            .collect();
        let mut daemon = start(tcp_config(), turns).await;

        let batches: Vec<Vec<String>> = (0..PRODUCERS)
            .map(|producer| {
                (0..PER_PRODUCER)
                    .map(|i| line(&InputMessage::new(format!("p{producer}-{i}"), "test")))
                    .collect()
            })
            .collect();
        futures::future::join_all(batches.iter().map(|batch| daemon.send_lines(batch))).await;

        let mut run_ids = Vec::new();
        for _ in 0..PRODUCERS * PER_PRODUCER {
            let run = daemon.next_run().await;
            assert_single_run(&run);
            assert_eq!(run.last().unwrap().kind.name(), "RUN_FINISHED");
            run_ids.push(run[0].run_id);
        }
        run_ids.sort();
        run_ids.dedup();
        assert_eq!(run_ids.len(), PRODUCERS * PER_PRODUCER);

        let thread_id = daemon.history.latest_thread().await.unwrap();
        let prompts: Vec<String> = daemon
            .history
            .recent(thread_id, 100)
            .await
            .unwrap()
            .into_iter()
            .map(|interaction| interaction.user_message.content)
            .collect();
        assert_eq!(prompts.len(), PRODUCERS * PER_PRODUCER);
        for producer in 0..PRODUCERS {
            let prefix = format!("p{producer}-");
            let own: Vec<&String> = prompts.iter().filter(|p| p.starts_with(&prefix)).collect();
            let expected: Vec<String> = (0..PER_PRODUCER).map(|i| format!("{prefix}{i}")).collect();
            assert_eq!(own, expected.iter().collect::<Vec<_>>());
        }

        daemon.stop().await;
    }

    #[tokio::test]
    async fn list_files_over_the_sockets() {
        let workspace = TempDir::new().unwrap();
        std::fs::write(workspace.path().join("README.md"), "# demo").unwrap();
        let mut tools = ToolRegistry::default();
        tools.register(Box::new(ShellTool::new(workspace.path())));
        let mut daemon = start_with_tools(
            tcp_config(),
            vec![
                ScriptedTurn::tool_call("shell", r#"{"command":"ls"}"#),
                ScriptedTurn::text("There is one file: README.md"),
            ],
            tools,
        )
        .await;

        daemon
            .send_raw("{\"prompt\":\"list files\",\"source\":\"cli\",\"datetime\":\"2026-01-24T12:00:00\"}\n")
            .await;
        let run = daemon.next_run().await;
        assert_single_run(&run);

        let names: Vec<&str> = run.iter().map(|event| event.kind.name()).collect();
        assert_eq!(
            &names[..6],
            &[
                "RUN_START",
                "TOOL_CALL_START",
                "TOOL_CALL_ARGS",
                "TOOL_CALL_END",
                "TOOL_CALL_RESULT",
                "TEXT_MESSAGE_START",
            ]
        );
        let tail = &names[6..];
        assert_eq!(&tail[tail.len() - 2..], &["TEXT_MESSAGE_END", "RUN_FINISHED"]);
        let contents = &tail[..tail.len() - 2];
        assert!(!contents.is_empty());
        assert!(contents.iter().all(|name| *name == "TEXT_MESSAGE_CONTENT"));

        match &run[1].kind {
            EventKind::ToolCallStart { tool_name, .. } => assert_eq!(tool_name, "shell"),
            other => panic!("unexpected {other:?}"),
        }
        match &run[4].kind {
            EventKind::ToolCallResult { result: Some(result), error: None, .. } => {
                assert!(result["stdout"].as_str().unwrap().contains("README.md"));
            }
            other => panic!("unexpected {other:?}"),
        }

        let thread_id = match &run[0].kind {
            EventKind::RunStart { thread_id, .. } => *thread_id,
            other => panic!("unexpected {other:?}"),
        };
        let stored = daemon.history.recent(thread_id, 10).await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].steps.len(), 1);
        assert_eq!(stored[0].steps[0].tool_name, "shell");

        daemon.stop().await;
    }

    #[tokio::test]
    async fn thread_selection_follows_input_fields() {
        let mut daemon = start(
            tcp_config(),
            vec![
                ScriptedTurn::text("a"),
                ScriptedTurn::text("b"),
                ScriptedTurn::text("c"),
                ScriptedTurn::text("d"),
            ],
        )
        .await;

        fn thread_of(events: &[Event]) -> Uuid {
            match &events[0].kind {
                EventKind::RunStart { thread_id, .. } => *thread_id,
                other => panic!("unexpected {other:?}"),
            }
        }

        daemon.send_raw(&line(&InputMessage::new("first", "test"))).await;
        let first = thread_of(&daemon.next_run().await);

        daemon.send_raw(&line(&InputMessage::new("fresh", "test").in_new_thread())).await;
        let fresh = thread_of(&daemon.next_run().await);
        assert_ne!(first, fresh);

        // Latest activity is now the fresh thread.
        daemon.send_raw(&line(&InputMessage::new("again", "test"))).await;
        assert_eq!(thread_of(&daemon.next_run().await), fresh);

        daemon.send_raw(&line(&InputMessage::new("back", "test").in_thread(first))).await;
        assert_eq!(thread_of(&daemon.next_run().await), first);

        daemon.stop().await;
    }

    #[tokio::test]
    async fn model_failure_reaches_subscribers_and_daemon_keeps_serving() {
        let mut daemon = start(
            tcp_config(),
            vec![
                ScriptedTurn::Fail(shellbot_llm::ModelError::Provider("overloaded".into())),
                ScriptedTurn::text("recovered"),
            ],
        )
        .await;

        daemon.send_raw(&line(&InputMessage::new("one", "test"))).await;
        let failed = daemon.next_run().await;
        match &failed.last().unwrap().kind {
            EventKind::RunError { error } => assert_eq!(error.kind, "model_error"),
            other => panic!("unexpected {other:?}"),
        }

        daemon.send_raw(&line(&InputMessage::new("two", "test"))).await;
        assert_eq!(daemon.next_run().await.last().unwrap().kind.name(), "RUN_FINISHED");
        assert_eq!(daemon.bus.subscriber_count(), 1);

        daemon.stop().await;
    }

    #[tokio::test]
    async fn serves_over_unix_sockets() {
        let dir = TempDir::new().unwrap();
        let config = DaemonConfig {
            input_address: format!("ipc://{}", dir.path().join("in.sock").display()),
            output_address: format!("ipc://{}", dir.path().join("out.sock").display()),
            queue_capacity: 4,
            ..DaemonConfig::default()
        };
        let mut daemon = start(config, vec![ScriptedTurn::text("hi there")]).await;
        daemon.send_raw(&line(&InputMessage::new("hello", "test"))).await;
        let run = daemon.next_run().await;
        assert_eq!(run.last().unwrap().kind.name(), "RUN_FINISHED");
        daemon.stop().await;
        assert!(!dir.path().join("in.sock").exists());
    }

    #[tokio::test]
    async fn bind_rejects_bad_address() {
        let engine = RunEngine::new(
            Arc::new(ScriptedModel::default()),
            Arc::new(ToolRegistry::default()),
            Arc::new(HistoryStore::in_memory()),
            EventBus::default(),
            RunSettings::default(),
        );
        let config = DaemonConfig {
            input_address: "http://nope".into(),
            ..tcp_config()
        };
        assert!(Daemon::bind(&config, engine).await.is_err());
    }
}
