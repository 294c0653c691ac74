//! Bounded asynchronous send queue.
//!
//! [`SendQueue::write`] never waits on the socket. Lines are handed to a
//! writer task through a bounded channel; overflow or a write failure is
//! reported once, on a separate error channel, and the queue then drops
//! everything written to it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;

use crate::error::ConnectionError;

#[derive(Debug)]
pub struct SendQueue {
    tx: mpsc::Sender<String>,
    capacity: usize,
    failure: Failure,
}

#[derive(Debug, Clone)]
struct Failure {
    reported: Arc<AtomicBool>,
    errors: mpsc::Sender<ConnectionError>,
}

impl Failure {
    fn report(&self, err: ConnectionError) {
        if !self.reported.swap(true, Ordering::SeqCst) {
            let _ = self.errors.try_send(err);
        }
    }

    fn is_set(&self) -> bool {
        self.reported.load(Ordering::SeqCst)
    }
}

impl SendQueue {
    /// Start the writer task. The returned receiver yields at most one error.
    pub fn spawn<W>(writer: W, capacity: usize) -> (Self, mpsc::Receiver<ConnectionError>)
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let capacity = capacity.max(1);
        let (tx, rx) = mpsc::channel(capacity);
        let (errors, error_rx) = mpsc::channel(1);
        let failure = Failure {
            reported: Arc::new(AtomicBool::new(false)),
            errors,
        };
        tokio::spawn(write_loop(writer, rx, failure.clone()));
        (
            Self {
                tx,
                capacity,
                failure,
            },
            error_rx,
        )
    }

    /// Enqueue one already-terminated line.
    pub fn write(&self, line: String) {
        if self.failure.is_set() {
            return;
        }
        match self.tx.try_send(line) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.failure
                    .report(ConnectionError::SendQueueFull(self.capacity));
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.failure.report(ConnectionError::Closed);
            }
        }
    }

    pub fn has_failed(&self) -> bool {
        self.failure.is_set()
    }
}

async fn write_loop<W>(mut writer: W, mut rx: mpsc::Receiver<String>, failure: Failure)
where
    W: AsyncWrite + Send + Unpin,
{
    while let Some(line) = rx.recv().await {
        if failure.is_set() {
            break;
        }
        let result = async {
            writer.write_all(line.as_bytes()).await?;
            writer.flush().await
        }
        .await;
        if let Err(e) = result {
            tracing::warn!("Write error: {e}");
            failure.report(ConnectionError::Io(e));
            break;
        }
    }
    let _ = writer.shutdown().await;
}
