//! Per-connection endpoint: one read loop and one write loop sharing nothing
//! but the bounded send queue and the underlying socket.
//!
//! The read loop enforces the inbound frame limit and the pong deadline and
//! hands every text frame to the hub. The write loop drains the send queue,
//! batching queued frames newline-separated into a single outbound frame,
//! and keeps the peer alive with periodic pings.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, timeout, Instant};

use crate::auth::Principal;
use super::Hub;

/// Outbound queue capacity per connection. A full queue marks the peer as
/// too slow to keep.
pub const SEND_QUEUE_CAPACITY: usize = 256;

/// Maximum inbound frame size: 512 KiB.
pub const MAX_FRAME_SIZE: usize = 512 * 1024;

/// Read deadline; reset by every transport pong.
const PONG_WAIT: Duration = Duration::from_secs(60);

/// Ping cadence, kept under the read deadline (pongWait * 9/10).
const PING_PERIOD: Duration = Duration::from_secs(54);

/// Per-frame write deadline.
const WRITE_WAIT: Duration = Duration::from_secs(10);

/// One client connection: identity plus the write side of its send queue.
/// The connection id is unique per upgrade and never reused.
pub struct Connection {
    pub id: String,
    pub principal: Principal,
    send: mpsc::Sender<Message>,
    rooms: Mutex<HashSet<String>>,
    shutdown: watch::Sender<bool>,
}

impl Connection {
    /// Create a connection and hand back the receive side of its send queue
    /// and the shutdown signal for the write loop.
    pub fn new(
        id: String,
        principal: Principal,
    ) -> (Arc<Self>, mpsc::Receiver<Message>, watch::Receiver<bool>) {
        let (send, recv) = mpsc::channel(SEND_QUEUE_CAPACITY);
        let (shutdown, shutdown_rx) = watch::channel(false);
        let conn = Arc::new(Self {
            id,
            principal,
            send,
            rooms: Mutex::new(HashSet::new()),
            shutdown,
        });
        (conn, recv, shutdown_rx)
    }

    pub fn user_id(&self) -> &str {
        &self.principal.user_id
    }

    /// Non-blocking enqueue onto the send queue.
    pub fn try_send(&self, frame: Message) -> Result<(), mpsc::error::TrySendError<Message>> {
        self.send.try_send(frame)
    }

    /// Signal the write loop to emit a close frame and exit. Safe to call
    /// more than once.
    pub fn close(&self) {
        let _ = self.shutdown.send(true);
    }

    pub fn join_room(&self, room_id: &str) {
        self.rooms
            .lock()
            .expect("connection rooms lock poisoned")
            .insert(room_id.to_string());
    }

    pub fn leave_room(&self, room_id: &str) {
        self.rooms
            .lock()
            .expect("connection rooms lock poisoned")
            .remove(room_id);
    }

    pub fn rooms_snapshot(&self) -> Vec<String> {
        self.rooms
            .lock()
            .expect("connection rooms lock poisoned")
            .iter()
            .cloned()
            .collect()
    }
}

/// Drive a registered connection until either loop observes a fatal
/// condition, then hand the connection back to the hub for teardown.
pub async fn run(
    hub: Arc<Hub>,
    conn: Arc<Connection>,
    socket: WebSocket,
    queue: mpsc::Receiver<Message>,
    shutdown: watch::Receiver<bool>,
) {
    let (sink, stream) = socket.split();
    let writer = tokio::spawn(write_loop(sink, queue, shutdown));

    read_loop(&hub, &conn, stream).await;

    // Resolves only after the hub's serial task applied the removal, so
    // callers of run() observe post-unregister index state. It also fires
    // the shutdown signal, ending the write loop if the reader died first.
    hub.unregister_and_wait(&conn).await;
    let _ = writer.await;

    tracing::debug!(client_id = %conn.id, user_id = %conn.user_id(), "connection endpoint stopped");
}

async fn read_loop(hub: &Hub, conn: &Arc<Connection>, mut stream: SplitStream<WebSocket>) {
    let mut deadline = Instant::now() + PONG_WAIT;

    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        let frame = match timeout(remaining, stream.next()).await {
            Err(_) => {
                tracing::debug!(client_id = %conn.id, "read deadline expired waiting for pong");
                break;
            }
            Ok(None) => break,
            Ok(Some(Err(e))) => {
                tracing::warn!(client_id = %conn.id, error = %e, "websocket read error");
                break;
            }
            Ok(Some(Ok(frame))) => frame,
        };

        match frame {
            Message::Text(text) => hub.dispatch_inbound(conn, text.as_bytes()),
            Message::Binary(data) => hub.dispatch_inbound(conn, &data),
            Message::Pong(_) => {
                deadline = Instant::now() + PONG_WAIT;
            }
            Message::Ping(data) => {
                let _ = conn.try_send(Message::Pong(data));
            }
            Message::Close(frame) => {
                tracing::debug!(client_id = %conn.id, reason = ?frame, "client initiated close");
                break;
            }
        }
    }
}

async fn write_loop(
    mut sink: SplitSink<WebSocket, Message>,
    mut queue: mpsc::Receiver<Message>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = interval(PING_PERIOD);
    // Skip the immediate first tick.
    ticker.tick().await;

    loop {
        tokio::select! {
            frame = queue.recv() => {
                let Some(frame) = frame else {
                    let _ = send_with_deadline(&mut sink, Message::Close(None)).await;
                    break;
                };
                if write_batched(&mut sink, &mut queue, frame).await.is_err() {
                    break;
                }
            }
            _ = shutdown.changed() => {
                let _ = send_with_deadline(&mut sink, Message::Close(None)).await;
                break;
            }
            _ = ticker.tick() => {
                if send_with_deadline(&mut sink, Message::Ping(Vec::new().into())).await.is_err() {
                    break;
                }
            }
        }
    }

    // Completes the close handshake so the read loop unblocks promptly.
    let _ = sink.close().await;
}

/// Write one frame; text frames opportunistically absorb everything else
/// queued behind them, newline-separated.
async fn write_batched(
    sink: &mut SplitSink<WebSocket, Message>,
    queue: &mut mpsc::Receiver<Message>,
    frame: Message,
) -> Result<(), axum::Error> {
    let Message::Text(first) = frame else {
        return send_with_deadline(sink, frame).await;
    };

    let mut batch = first.to_string();
    let mut trailing = None;
    while let Ok(next) = queue.try_recv() {
        match next {
            Message::Text(text) => {
                batch.push('\n');
                batch.push_str(text.as_str());
            }
            other => {
                trailing = Some(other);
                break;
            }
        }
    }

    send_with_deadline(sink, Message::Text(batch.into())).await?;
    if let Some(other) = trailing {
        send_with_deadline(sink, other).await?;
    }
    Ok(())
}

async fn send_with_deadline(
    sink: &mut SplitSink<WebSocket, Message>,
    frame: Message,
) -> Result<(), axum::Error> {
    match timeout(WRITE_WAIT, sink.send(frame)).await {
        Ok(result) => result,
        Err(elapsed) => Err(axum::Error::new(elapsed)),
    }
}
