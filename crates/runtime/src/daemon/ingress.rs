//! Ingress socket: newline-delimited input messages onto the run queue.

use std::io;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::input::InputMessage;

use super::transport::Listener;

pub(super) async fn accept_loop(
    listener: Listener,
    queue: mpsc::Sender<InputMessage>,
    max_line_bytes: usize,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    break;
                }
            }
            accept = listener.accept() => {
                match accept {
                    Ok((reader, _writer, peer)) => {
                        debug!(%peer, "ingress connection");
                        let queue = queue.clone();
                        tokio::spawn(async move {
                            if let Err(err) = read_inputs(reader, queue, max_line_bytes).await {
                                warn!(%peer, error = %err, "ingress connection closed with error");
                            }
                        });
                    }
                    Err(err) => error!(error = %err, "ingress accept failed"),
                }
            }
        }
    }
    info!("ingress stopped");
}

/// Forward every valid line until the peer hangs up.  Malformed, non-UTF-8
/// and oversized lines are logged and dropped; the connection stays open.
pub(super) async fn read_inputs<R>(
    reader: R,
    queue: mpsc::Sender<InputMessage>,
    max_line_bytes: usize,
) -> io::Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut raw = Vec::new();
    loop {
        raw.clear();
        let limit = max_line_bytes as u64 + 1;
        if (&mut reader).take(limit).read_until(b'\n', &mut raw).await? == 0 {
            break;
        }
        if raw.last() == Some(&b'\n') {
            raw.pop();
        } else if raw.len() > max_line_bytes {
            warn!(max_line_bytes, "dropping oversized input line");
            discard_line(&mut reader).await?;
            continue;
        }

        let line = match std::str::from_utf8(&raw) {
            Ok(line) => line,
            Err(err) => {
                warn!(error = %err, "dropping input line that is not UTF-8");
                continue;
            }
        };
        if line.trim().is_empty() {
            continue;
        }
        match InputMessage::parse(line) {
            Ok(message) => {
                debug!(source = %message.source, "input accepted");
                if queue.send(message).await.is_err() {
                    // Run loop has stopped.
                    break;
                }
            }
            Err(err) => warn!(error = %err, "dropping malformed input line"),
        }
    }
    Ok(())
}

/// Skip to just past the next newline without buffering what is skipped.
async fn discard_line<R: AsyncRead + Unpin>(reader: &mut BufReader<R>) -> io::Result<()> {
    loop {
        let chunk = reader.fill_buf().await?;
        if chunk.is_empty() {
            return Ok(());
        }
        match chunk.iter().position(|b| *b == b'\n') {
            Some(pos) => {
                reader.consume(pos + 1);
                return Ok(());
            }
            None => {
                let len = chunk.len();
                reader.consume(len);
            }
        }
    }
}
