//! `ask` and `watch`: rendering the daemon's event stream in a terminal.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use fs2::FileExt;
use tracing::{debug, info};
use uuid::Uuid;

use shellbot_config::AppConfig;
use shellbot_runtime::{DaemonClient, Event, EventKind, InputMessage};

// ── Presence marker ──────────────────────────────────────────────────────────

/// Held while an `ask` session is streaming so `watch` can stay quiet.
/// The file is locked for the guard's lifetime and removed on drop.
pub(crate) struct PresenceGuard {
    path: PathBuf,
    _file: File,
}

impl PresenceGuard {
    pub(crate) fn acquire(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .truncate(true)
            .write(true)
            .open(path)
            .with_context(|| format!("failed to create presence marker {}", path.display()))?;
        file.try_lock_exclusive()
            .with_context(|| format!("another ask session holds {}", path.display()))?;
        write!(file, "{}", std::process::id())?;
        Ok(Self {
            path: path.to_path_buf(),
            _file: file,
        })
    }
}

impl Drop for PresenceGuard {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

/// True when a live `ask` session holds the marker.  A leftover file from a
/// crashed session is not locked and does not count.
pub(crate) fn presence_active(path: &Path) -> bool {
    let Ok(file) = File::open(path) else {
        return false;
    };
    match file.try_lock_shared() {
        Ok(()) => {
            let _ = FileExt::unlock(&file);
            false
        }
        Err(_) => true,
    }
}

// ── Rendering ────────────────────────────────────────────────────────────────

pub(crate) struct Renderer<W: Write> {
    out: W,
    mid_line: bool,
}

impl<W: Write> Renderer<W> {
    pub(crate) fn new(out: W) -> Self {
        Self {
            out,
            mid_line: false,
        }
    }

    fn end_line(&mut self) -> io::Result<()> {
        if self.mid_line {
            writeln!(self.out)?;
            self.mid_line = false;
        }
        Ok(())
    }

    pub(crate) fn render(&mut self, event: &Event) -> io::Result<()> {
        match &event.kind {
            EventKind::TextMessageContent { delta, .. } => {
                write!(self.out, "{delta}")?;
                self.mid_line = !delta.ends_with('\n');
            }
            EventKind::TextMessageEnd { .. } => self.end_line()?,
            EventKind::ToolCallStart { tool_name, .. } => {
                self.end_line()?;
                writeln!(self.out, "→ {tool_name}")?;
            }
            EventKind::ToolCallResult { error: Some(err), .. } => {
                writeln!(self.out, "  ✗ {err}")?;
            }
            EventKind::RunError { error } => {
                self.end_line()?;
                writeln!(self.out, "error: {error}")?;
            }
            EventKind::RunFinished { .. } => self.end_line()?,
            _ => {}
        }
        self.out.flush()
    }
}

// ── Commands ─────────────────────────────────────────────────────────────────

async fn reachable_client(config: &AppConfig) -> Result<DaemonClient> {
    let client = DaemonClient::from_config(&config.daemon)?;
    client.connect_with_backoff(3).await.with_context(|| {
        format!(
            "daemon is not reachable at {}; start it with `shellbot daemon`",
            config.daemon.output_address
        )
    })?;
    Ok(client)
}

pub(crate) async fn run_ask(
    config: &AppConfig,
    prompt: String,
    new_thread: bool,
    thread: Option<Uuid>,
) -> Result<()> {
    let client = reachable_client(config).await?;
    let _presence = PresenceGuard::acquire(&config.presence_marker_path())?;

    let mut message = InputMessage::new(prompt, "cli");
    if let Some(thread_id) = thread {
        message = message.in_thread(thread_id);
    } else if new_thread {
        message = message.in_new_thread();
    }

    let mut renderer = Renderer::new(io::stdout().lock());
    let mut render_error: Option<io::Error> = None;
    let terminal = client
        .ask(&message, |event| {
            if render_error.is_none() {
                render_error = renderer.render(event).err();
            }
        })
        .await?;
    if let Some(err) = render_error {
        return Err(err.into());
    }

    debug!(run_id = %terminal.run_id, events = terminal.seq + 1, "ask finished");
    if let EventKind::RunError { error } = &terminal.kind {
        bail!("run failed ({})", error.kind);
    }
    Ok(())
}

pub(crate) async fn run_watch(config: &AppConfig) -> Result<()> {
    let client = reachable_client(config).await?;
    let presence_path = config.presence_marker_path();
    let mut events = client.subscribe().await?;
    let mut renderer = Renderer::new(io::stdout().lock());
    let mut muted: Option<Uuid> = None;
    info!(endpoint = %config.daemon.output_address, "watching daemon output");

    while let Some(event) = events.next_event().await? {
        if matches!(event.kind, EventKind::RunStart { .. }) {
            muted = presence_active(&presence_path).then_some(event.run_id);
        }
        if muted == Some(event.run_id) {
            continue;
        }
        renderer.render(&event)?;
    }
    println!("daemon closed the event stream");
    Ok(())
}
