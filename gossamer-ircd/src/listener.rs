//! Client listeners.
//!
//! Each listener accepts TCP connections, performs the TLS handshake on a
//! per-connection task when the listen is TLS-flagged, and hands the
//! resulting transport to the dispatch loop.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;

use crate::config::ListenSpec;
use crate::directory::Transport;

/// Pause after a failed accept, so a persistent error such as EMFILE
/// does not spin the loop.
pub(crate) const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Retry `accept` until it succeeds, logging and backing off on errors.
pub(crate) async fn accept_with_backoff<T, F, Fut>(mut accept: F) -> T
where
    F: FnMut() -> Fut,
    Fut: Future<Output = io::Result<T>>,
{
    loop {
        match accept().await {
            Ok(accepted) => return accepted,
            Err(e) => {
                tracing::error!("Accept error: {e}");
                tokio::time::sleep(ACCEPT_BACKOFF).await;
            }
        }
    }
}

/// A freshly accepted client transport.
pub struct Incoming {
    pub transport: Box<dyn Transport>,
    /// Remote address, used as the client's host.
    pub host: String,
}

/// A running accept loop. Dropping it stops accepting.
pub struct ClientListener {
    local_addr: SocketAddr,
    task: JoinHandle<()>,
}

impl ClientListener {
    pub async fn bind(
        spec: &ListenSpec,
        acceptor: Option<TlsAcceptor>,
        incoming: mpsc::Sender<Incoming>,
    ) -> Result<Self> {
        let acceptor = match (spec.tls, acceptor) {
            (true, Some(acceptor)) => Some(acceptor),
            (true, None) => anyhow::bail!("TLS listen {spec} requires TLS material"),
            (false, _) => None,
        };
        let listener = TcpListener::bind(spec.addr())
            .await
            .with_context(|| format!("Failed to bind client listener {spec}"))?;
        let local_addr = listener.local_addr()?;
        let kind = if acceptor.is_some() { "TLS " } else { "" };
        tracing::info!("Listening for {kind}client connections on {local_addr}");

        let task = tokio::spawn(accept_loop(listener, acceptor, incoming));
        Ok(Self { local_addr, task })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

impl Drop for ClientListener {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn accept_loop(
    listener: TcpListener,
    acceptor: Option<TlsAcceptor>,
    incoming: mpsc::Sender<Incoming>,
) {
    loop {
        let (stream, addr) = accept_with_backoff(|| listener.accept()).await;
        let host = addr.ip().to_string();
        tracing::debug!(%addr, "Accepted client connection");

        let Some(acceptor) = acceptor.clone() else {
            let accepted = Incoming {
                transport: Box::new(stream),
                host,
            };
            if incoming.send(accepted).await.is_err() {
                return;
            }
            continue;
        };

        let incoming = incoming.clone();
        tokio::spawn(async move {
            match acceptor.accept(stream).await {
                Ok(tls) => {
                    let _ = incoming
                        .send(Incoming {
                            transport: Box::new(tls),
                            host,
                        })
                        .await;
                }
                Err(e) => tracing::warn!(%addr, "TLS handshake failed: {e}"),
            }
        });
    }
}
