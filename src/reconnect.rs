//! Connection supervisor
//!
//! One task per client owns the transport. It connects, pumps frames in both
//! directions, and on an unexpected drop snapshots the session, installs the
//! replacement session and retries with exponential backoff until it
//! reconnects or the client is closed.

use crate::client::ClientInner;
use crate::codec::FrameDecoder;
use crate::error::{EsbError, Result};
use crate::message::Message;
use crate::session::{ClientEvent, SessionState};
use crate::transport::BoxedStream;

use rand::Rng;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Run until the client is closed or reconnection is given up
pub(crate) async fn supervise(inner: Arc<ClientInner>) {
    let mut attempt: u32 = 0;
    let mut restoring = false;

    while !inner.is_closing() {
        inner.set_state(SessionState::Connecting);

        let connected = tokio::select! {
            result = inner.connector.connect() => result,
            _ = inner.shutdown.notified() => break,
        };

        let stream = match connected {
            Ok(stream) => stream,
            Err(e) => {
                warn!(addr = %inner.config.addr, error = %e, "Connect failed");
                inner.emit(ClientEvent::TransportError(e.to_string()));
                inner.set_state(SessionState::Disconnected);
                if !inner.config.auto_reconnect {
                    error!("Connect failed and reconnection is disabled");
                    break;
                }
                attempt += 1;
                if !pause(&inner, attempt).await {
                    break;
                }
                continue;
            }
        };

        attempt = 0;
        let (tx, rx) = mpsc::channel(inner.config.outbound_buffer.max(1));
        *inner.outbound.lock() = Some(tx);
        inner.epoch.fetch_add(1, Ordering::SeqCst);

        info!(addr = %inner.config.addr, "Connected");
        inner.emit(ClientEvent::Connected);
        if restoring {
            info!("Reconnected, restoring session");
            inner.emit(ClientEvent::Reconnected);
            restoring = false;
        }
        // Writers are released by this transition, after the notifications
        inner.set_state(SessionState::Unauthenticated);

        let result = pump(&inner, stream, rx).await;
        *inner.outbound.lock() = None;

        let Err(e) = result else {
            break;
        };
        if inner.is_closing() {
            break;
        }

        warn!(error = %e, "Connection lost");
        inner.emit(ClientEvent::TransportError(e.to_string()));
        inner.emit(ClientEvent::Disconnected);

        let snapshot = inner.session.take_snapshot();
        inner.set_state(SessionState::Disconnected);
        if !inner.config.auto_reconnect {
            error!("Connection lost and reconnection is disabled");
            break;
        }

        debug!(name = ?snapshot.name, groups = ?snapshot.groups, "Session snapshot taken");
        restoring = snapshot.name.is_some();
        inner.replay(&snapshot);

        attempt = 1;
        if !pause(&inner, attempt).await {
            break;
        }
    }

    *inner.outbound.lock() = None;
    inner.set_state(SessionState::Closed);
    debug!("Connection supervisor stopped");
}

/// Backoff before attempt `attempt`; returns false if the client closed meanwhile
async fn pause(inner: &ClientInner, attempt: u32) -> bool {
    let delay = jittered(inner.config.backoff(attempt.saturating_sub(1)));
    info!(attempt, ?delay, "Reconnecting");
    inner.emit(ClientEvent::Reconnecting { attempt });

    tokio::select! {
        _ = tokio::time::sleep(delay) => !inner.is_closing(),
        _ = inner.shutdown.notified() => false,
    }
}

/// Stretch `delay` by up to a quarter so clients dropped together spread out
fn jittered(delay: Duration) -> Duration {
    let factor: f64 = rand::rng().random_range(0.0..0.25);
    delay + delay.mul_f64(factor)
}

/// Move frames until the stream fails (`Err`) or the client closes (`Ok`)
async fn pump(
    inner: &Arc<ClientInner>,
    stream: BoxedStream,
    mut outbound: mpsc::Receiver<String>,
) -> Result<()> {
    let (mut reader, mut writer) = tokio::io::split(stream);

    // Separate task so a slow peer never stalls inbound decoding
    let mut writer_task = tokio::spawn(async move {
        while let Some(frame) = outbound.recv().await {
            writer.write_all(frame.as_bytes()).await?;
            writer.flush().await?;
        }
        writer.shutdown().await
    });

    let mut decoder = FrameDecoder::with_max_frame(inner.config.max_frame_size);
    let mut buf = vec![0u8; inner.config.read_buffer_size.max(1)];

    let result = loop {
        tokio::select! {
            read = reader.read(&mut buf) => match read {
                Ok(0) => break Err(EsbError::Transport("connection closed by peer".to_string())),
                Ok(n) => {
                    for decoded in decoder.decode(&buf[..n]) {
                        match decoded {
                            Ok(msg) => route(inner, msg),
                            Err(e) => {
                                warn!(error = %e, "Dropping undecodable frame");
                                inner.emit(ClientEvent::ProtocolError(e.to_string()));
                            }
                        }
                    }
                }
                Err(e) => break Err(EsbError::Transport(e.to_string())),
            },
            written = &mut writer_task => break match written {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(EsbError::Transport(e.to_string())),
                Err(e) => Err(EsbError::Transport(e.to_string())),
            },
            _ = inner.shutdown.notified() => break Ok(()),
        }
    };

    writer_task.abort();
    result
}

/// Correlation first, then listeners
fn route(inner: &ClientInner, msg: Message) {
    debug!(id = %msg.id(), kind = ?msg.kind(), "Inbound message");
    inner.pending.resolve(&msg);
    inner.dispatcher.dispatch(&msg);
}
