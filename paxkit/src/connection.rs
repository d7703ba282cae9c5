//! Framed command connections.
//!
//! Every connection — dialed or accepted — is driven by one task that owns
//! the framed TCP stream. Inbound commands are forwarded to the owning actor
//! as [`NetEvent::Frame`]s; outbound commands funnel through the
//! connection's queue and are written in order, so concurrent writers
//! (heartbeat and round targeting the same peer) never interleave frames.
//! Dropping every [`CommandLink`] to a connection closes it.

use std::time::Duration;

use futures::{SinkExt, StreamExt};
use paxkit_core::{Command, CommandCodec, Endpoint};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::trace;

/// How a connection is known to its owning actor.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub(crate) enum ConnKey {
    /// Pooled outbound connection to a configured peer.
    Peer(Endpoint),
    /// Accepted inbound connection: a peer's dial, or a client.
    Inbound(u64),
}

/// Events delivered to the owning actor.
#[derive(Debug)]
pub(crate) enum NetEvent {
    /// The connection is up and writable through `link`.
    Opened { key: ConnKey, link: CommandLink },
    /// An outbound dial failed before the connection opened.
    DialFailed { peer: Endpoint },
    /// A command arrived.
    Frame { key: ConnKey, command: Command },
    /// The connection is gone: EOF, I/O or framing error, or every link to
    /// it was dropped.
    Closed { key: ConnKey },
}

/// Outbound queue depth per connection.
const LINK_QUEUE: usize = 64;

/// Write handle for one connection.
#[derive(Clone, Debug)]
pub(crate) struct CommandLink {
    tx: mpsc::Sender<Command>,
}

impl CommandLink {
    /// Queue a command for writing. Returns `false` when the connection is
    /// gone or its queue is saturated; callers treat both as a transport
    /// failure of the peer.
    pub(crate) fn send(&self, command: Command) -> bool {
        self.tx.try_send(command).is_ok()
    }
}

/// Dial a peer and, on success, run the connection under `ConnKey::Peer`.
/// Emits `Opened` then frames, or `DialFailed`.
pub(crate) fn spawn_dial(
    peer: Endpoint,
    max_frame: usize,
    connect_timeout: Duration,
    events: mpsc::Sender<NetEvent>,
    cancel: CancellationToken,
) {
    tokio::spawn(async move {
        let connect = tokio::time::timeout(connect_timeout, TcpStream::connect(peer.addr()));
        let stream = tokio::select! {
            () = cancel.cancelled() => return,
            result = connect => match result {
                Ok(Ok(stream)) => stream,
                Ok(Err(e)) => {
                    trace!(%peer, error = %e, "dial failed");
                    let _ = events.send(NetEvent::DialFailed { peer }).await;
                    return;
                }
                Err(_) => {
                    trace!(%peer, "dial timed out");
                    let _ = events.send(NetEvent::DialFailed { peer }).await;
                    return;
                }
            },
        };
        run_connection(ConnKey::Peer(peer), stream, max_frame, events, cancel).await;
    });
}

/// Run an accepted connection under `ConnKey::Inbound(id)`.
pub(crate) fn spawn_accepted(
    id: u64,
    stream: TcpStream,
    max_frame: usize,
    events: mpsc::Sender<NetEvent>,
    cancel: CancellationToken,
) {
    tokio::spawn(run_connection(
        ConnKey::Inbound(id),
        stream,
        max_frame,
        events,
        cancel,
    ));
}

async fn run_connection(
    key: ConnKey,
    stream: TcpStream,
    max_frame: usize,
    events: mpsc::Sender<NetEvent>,
    cancel: CancellationToken,
) {
    let _ = stream.set_nodelay(true);
    let mut io = Framed::new(stream, CommandCodec::new(max_frame));
    let (tx, mut rx) = mpsc::channel(LINK_QUEUE);

    if events
        .send(NetEvent::Opened {
            key,
            link: CommandLink { tx },
        })
        .await
        .is_err()
    {
        return;
    }

    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            queued = rx.recv() => match queued {
                Some(command) => {
                    trace!(?key, kind = command.kind(), "writing command");
                    if io.send(command).await.is_err() {
                        break;
                    }
                }
                // The owner dropped every link to this connection.
                None => break,
            },
            frame = io.next() => match frame {
                Some(Ok(command)) => {
                    trace!(?key, kind = command.kind(), "read command");
                    if events.send(NetEvent::Frame { key, command }).await.is_err() {
                        break;
                    }
                }
                Some(Err(e)) => {
                    trace!(?key, error = %e, "connection failed");
                    break;
                }
                None => break,
            },
        }
    }

    let _ = events.send(NetEvent::Closed { key }).await;
}
