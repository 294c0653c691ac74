//! Server-to-server links.
//!
//! Links are always mutually authenticated TLS. An accepted link asserts
//! its server name through the common name of its client certificate; a
//! dialed link is named after the target its certificate was verified
//! against. Trust is rooted entirely in the network CA.

use std::fmt;
use std::net::SocketAddr;

use anyhow::{Context, Result};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_rustls::{TlsAcceptor, TlsConnector};

use crate::config::ListenSpec;
use crate::directory::Transport;
use crate::listener::accept_with_backoff;
use crate::tls;

/// Where a link came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkOrigin {
    /// Accepted by the link listener bound to this address.
    Listener(SocketAddr),
    /// Dialed in response to CONNECT.
    Dialed,
}

impl fmt::Display for LinkOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Listener(addr) => write!(f, "listener {addr}"),
            Self::Dialed => f.write_str("outbound dial"),
        }
    }
}

/// A verified server link, ready for the directory engine.
pub struct LinkEvent {
    pub origin: LinkOrigin,
    pub transport: Box<dyn Transport>,
    pub server: String,
}

impl fmt::Debug for LinkEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LinkEvent")
            .field("origin", &self.origin)
            .field("server", &self.server)
            .finish_non_exhaustive()
    }
}

pub struct LinkListener {
    local_addr: SocketAddr,
    task: JoinHandle<()>,
}

impl LinkListener {
    pub async fn bind(
        spec: &ListenSpec,
        acceptor: TlsAcceptor,
        events: mpsc::Sender<LinkEvent>,
    ) -> Result<Self> {
        let listener = TcpListener::bind(spec.addr())
            .await
            .with_context(|| format!("Failed to bind link listener {spec}"))?;
        let local_addr = listener.local_addr()?;
        tracing::info!("Listening for server connections on {local_addr}");

        let task = tokio::spawn(run(listener, local_addr, acceptor, events));
        Ok(Self { local_addr, task })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

impl Drop for LinkListener {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn run(
    listener: TcpListener,
    local_addr: SocketAddr,
    acceptor: TlsAcceptor,
    events: mpsc::Sender<LinkEvent>,
) {
    loop {
        let (stream, addr) = accept_with_backoff(|| listener.accept()).await;

        // TODO: handshake on a spawned task so a slow peer cannot stall
        // other incoming links.
        let secured = match acceptor.accept(stream).await {
            Ok(secured) => secured,
            Err(e) => {
                tracing::warn!(%addr, "Aborted link due to incomplete handshake: {e}");
                continue;
            }
        };
        let Some(server) = tls::peer_common_name(secured.get_ref().1.peer_certificates()) else {
            tracing::warn!(%addr, "Aborted link without a peer certificate name");
            continue;
        };

        tracing::info!(%addr, %server, "Link connection");
        let event = LinkEvent {
            origin: LinkOrigin::Listener(local_addr),
            transport: Box::new(secured),
            server,
        };
        if events.send(event).await.is_err() {
            return;
        }
    }
}

/// Dial `host:port` and verify the peer as `target`.
pub async fn dial(connector: TlsConnector, target: &str, host: &str, port: u16) -> Result<LinkEvent> {
    let name = tls::server_name(target)?;
    let stream = TcpStream::connect((host, port))
        .await
        .with_context(|| format!("Failed to connect to {host}:{port}"))?;
    let secured = connector
        .connect(name, stream)
        .await
        .with_context(|| format!("TLS handshake with {target} at {host}:{port} failed"))?;
    tracing::info!(server = %target, "Linked to {host}:{port}");
    Ok(LinkEvent {
        origin: LinkOrigin::Dialed,
        transport: Box::new(secured),
        server: target.to_string(),
    })
}
