//! Egress socket: every subscriber receives every event as a JSON line.

use anyhow::Result;
use tokio::io::AsyncWriteExt;
use tokio::sync::{broadcast, watch};
use tracing::{debug, error, info, warn};

use crate::events::{Event, EventBus};

use super::transport::{BoxedWriter, Listener};

pub(super) async fn accept_loop(
    listener: Listener,
    bus: EventBus,
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
                    Ok((_reader, writer, peer)) => {
                        // Subscribe before spawning so nothing published
                        // after accept is missed.
                        let rx = bus.subscribe();
                        debug!(%peer, subscribers = bus.subscriber_count(), "egress subscriber connected");
                        let shutdown_rx = shutdown_rx.clone();
                        tokio::spawn(async move {
                            forward_events(writer, rx, shutdown_rx).await;
                            debug!(%peer, "egress subscriber gone");
                        });
                    }
                    Err(err) => error!(error = %err, "egress accept failed"),
                }
            }
        }
    }
    info!("egress stopped");
}

async fn forward_events(
    mut writer: BoxedWriter,
    mut rx: broadcast::Receiver<Event>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    break;
                }
            }
            received = rx.recv() => match received {
                Ok(event) => {
                    if send_event(&mut writer, &event).await.is_err() {
                        break; // subscriber disconnected
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(n, "egress subscriber lagged; {n} events dropped");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }
    let _ = writer.shutdown().await;
}

async fn send_event(writer: &mut BoxedWriter, event: &Event) -> Result<()> {
    let encoded = serde_json::to_string(event)?;
    writer.write_all(encoded.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await?;
    Ok(())
}
