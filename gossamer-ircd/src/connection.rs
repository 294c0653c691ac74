//! Per-connection actor.
//!
//! Each connection runs three tasks:
//! - a read loop that reconstructs bounded lines, parses and interprets
//!   them, and hands the results to the control loop;
//! - a control loop that merges those events with send-queue failures into
//!   the shared event channel consumed by the dispatch loop;
//! - the send-queue writer (see [`crate::sendq`]).
//!
//! Events from one connection reach the dispatch loop in the order they
//! were produced. The read side emits exactly one terminal error.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::io::AsyncRead;
use tokio::sync::{mpsc, watch};

use crate::directory::Transport;
use crate::error::ConnectionError;
use crate::irc::{self, ClientMessage};
use crate::line::LineReader;
use crate::reply::{ServerInfo, ServerMessage};
use crate::sendq::SendQueue;

/// Identity of a live connection. Never reused within a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnId(u64);

impl ConnId {
    fn next() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Why a connection raised an event.
#[derive(Debug)]
pub enum ConnectionEventKind {
    Message(ClientMessage),
    Error(ConnectionError),
}

/// The unit of communication from a connection to the dispatch loop.
#[derive(Debug)]
pub struct ConnectionEvent {
    pub conn: ConnId,
    pub kind: ConnectionEventKind,
}

impl ConnectionEvent {
    fn message(conn: ConnId, message: ClientMessage) -> Self {
        Self {
            conn,
            kind: ConnectionEventKind::Message(message),
        }
    }

    fn error(conn: ConnId, err: ConnectionError) -> Self {
        Self {
            conn,
            kind: ConnectionEventKind::Error(err),
        }
    }
}

/// Per-connection bounds.
#[derive(Debug, Clone, Copy)]
pub struct ConnectionOptions {
    pub max_line_len: usize,
    pub sendq_len: usize,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            max_line_len: 512,
            sendq_len: 2048,
        }
    }
}

/// Handle to a running connection actor. Dropping it shuts the actor down.
pub struct IrcConnection {
    id: ConnId,
    host: String,
    info: Arc<ServerInfo>,
    sendq: SendQueue,
    shutdown: watch::Sender<bool>,
}

impl IrcConnection {
    pub fn spawn<T>(
        transport: T,
        host: String,
        info: Arc<ServerInfo>,
        options: ConnectionOptions,
        events: mpsc::Sender<ConnectionEvent>,
    ) -> Self
    where
        T: Transport,
    {
        let id = ConnId::next();
        let (reader, writer) = tokio::io::split(transport);
        let (sendq, sendq_errors) = SendQueue::spawn(writer, options.sendq_len);
        let (shutdown, shutdown_rx) = watch::channel(false);
        let (trans_tx, trans_rx) = mpsc::channel(1);

        tokio::spawn(read_loop(
            id,
            LineReader::new(reader, options.max_line_len),
            trans_tx,
            shutdown_rx.clone(),
        ));
        tokio::spawn(control_loop(
            id,
            trans_rx,
            sendq_errors,
            events,
            shutdown_rx,
        ));

        tracing::debug!(conn = %id, %host, "Connection actor started");
        Self {
            id,
            host,
            info,
            sendq,
            shutdown,
        }
    }

    pub fn id(&self) -> ConnId {
        self.id
    }

    /// Remote host as seen at accept time.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Format and enqueue a message. Never waits on the socket.
    pub fn send(&self, msg: &ServerMessage) {
        let line = msg.to_irc(&self.info);
        tracing::trace!(conn = %self.id, "-> {}", line.trim_end());
        self.sendq.write(line);
    }

    /// Stop forwarding events. The read loop exits without blocking.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }
}

impl Drop for IrcConnection {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl fmt::Debug for IrcConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IrcConnection")
            .field("id", &self.id)
            .field("host", &self.host)
            .finish_non_exhaustive()
    }
}

async fn read_loop<R>(
    id: ConnId,
    mut reader: LineReader<R>,
    trans: mpsc::Sender<ConnectionEvent>,
    mut shutdown: watch::Receiver<bool>,
) where
    R: AsyncRead + Unpin,
{
    loop {
        if *shutdown.borrow() {
            return;
        }
        let read = tokio::select! {
            _ = shutdown.changed() => return,
            read = reader.read_line() => read,
        };
        let data = match read {
            Ok(data) => data,
            Err(e) => {
                let _ = trans.send(ConnectionEvent::error(id, e.into())).await;
                return;
            }
        };

        // A bare CR ends a line too; it must never reach another client.
        for part in data.split(|&b| b == b'\r').filter(|part| !part.is_empty()) {
            let line = String::from_utf8_lossy(part);
            tracing::trace!(conn = %id, "<- {line}");
            let Some(generic) = irc::parse_line(&line) else {
                tracing::debug!(conn = %id, "Ignoring line without a command");
                continue;
            };
            if trans
                .send(ConnectionEvent::message(id, irc::interpret(generic)))
                .await
                .is_err()
            {
                return;
            }
        }
    }
}

async fn control_loop(
    id: ConnId,
    mut trans: mpsc::Receiver<ConnectionEvent>,
    mut sendq_errors: mpsc::Receiver<ConnectionError>,
    events: mpsc::Sender<ConnectionEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut sendq_open = true;
    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                // Let the read loop finish any pending hand-off.
                while trans.recv().await.is_some() {}
                tracing::debug!(conn = %id, "Connection actor stopped");
                return;
            }
            event = trans.recv() => match event {
                Some(event) => {
                    if events.send(event).await.is_err() {
                        return;
                    }
                }
                None => return,
            },
            err = sendq_errors.recv(), if sendq_open => match err {
                Some(err) => {
                    let _ = events.send(ConnectionEvent::error(id, err)).await;
                }
                None => sendq_open = false,
            },
        }
    }
}
