use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use anyhow::bail;
use clap::Parser;

use crate::connection::ConnectionOptions;

/// Connection-facing server of a gossamer IRC network.
#[derive(Parser, Debug, Clone)]
#[command(name = "gossamer-ircd", version, about)]
pub struct ServerConfig {
    /// Name of the IRC network to which this server belongs.
    #[arg(long, default_value = "")]
    pub network: String,

    /// Name of this server.
    #[arg(long, default_value = "")]
    pub server: String,

    /// Description of this server.
    #[arg(long, default_value = "")]
    pub server_desc: String,

    /// Name of the default subnet for this server.
    #[arg(long, default_value = "")]
    pub default_subnet: String,

    /// Comma separated host:port listens for client connections; host:*port for TLS.
    #[arg(long, value_delimiter = ',')]
    pub client_listens: Vec<ListenSpec>,

    /// Comma separated host:port listens for server connections (always TLS).
    #[arg(long, value_delimiter = ',')]
    pub server_listens: Vec<ListenSpec>,

    /// Path to the CA certificate bundle for the network.
    #[arg(long)]
    pub tls_network_ca: Option<PathBuf>,

    /// Path to the TLS certificate for this server.
    #[arg(long)]
    pub tls_certificate: Option<PathBuf>,

    /// Path to the private key for the TLS certificate.
    #[arg(long)]
    pub tls_private_key: Option<PathBuf>,

    /// Longest line read from a connection, in bytes. Longer lines are cut.
    #[arg(long, default_value = "512")]
    pub max_line_len: usize,

    /// Outgoing messages buffered per connection before it is dropped.
    #[arg(long, default_value = "2048")]
    pub sendq_len: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        let options = ConnectionOptions::default();
        Self {
            network: String::new(),
            server: String::new(),
            server_desc: String::new(),
            default_subnet: String::new(),
            client_listens: Vec::new(),
            server_listens: Vec::new(),
            tls_network_ca: None,
            tls_certificate: None,
            tls_private_key: None,
            max_line_len: options.max_line_len,
            sendq_len: options.sendq_len,
        }
    }
}

impl ServerConfig {
    /// Check required settings, reporting every missing one at once.
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut missing = Vec::new();
        if self.network.is_empty() {
            missing.push("--network");
        }
        if self.server.is_empty() {
            missing.push("--server");
        }
        if self.default_subnet.is_empty() {
            missing.push("--default-subnet");
        }
        if self.tls_network_ca.is_none() {
            missing.push("--tls-network-ca");
        }
        if self.tls_certificate.is_none() {
            missing.push("--tls-certificate");
        }
        if self.tls_private_key.is_none() {
            missing.push("--tls-private-key");
        }
        if !missing.is_empty() {
            bail!("Must specify {}", missing.join(", "));
        }

        if let Some(listen) = self.server_listens.iter().find(|l| l.tls) {
            bail!("Server listens are always TLS, drop the '*' from {listen}");
        }
        if self.server_desc.is_empty() {
            tracing::warn!("--server-desc not specified, description will be empty");
        }
        Ok(())
    }

    pub fn connection_options(&self) -> ConnectionOptions {
        ConnectionOptions {
            max_line_len: self.max_line_len,
            sendq_len: self.sendq_len,
        }
    }
}

/// One listening endpoint: `host:port`, or `host:*port` for TLS.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenSpec {
    pub host: String,
    pub port: u16,
    pub tls: bool,
}

impl ListenSpec {
    /// Address suitable for binding.
    pub fn addr(&self) -> String {
        if self.host.contains(':') && !self.host.starts_with('[') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

impl FromStr for ListenSpec {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let Some((host, port)) = s.rsplit_once(':') else {
            return Err(format!("Invalid listen specification: {s}"));
        };
        let (port, tls) = match port.strip_prefix('*') {
            Some(port) => (port, true),
            None => (port, false),
        };
        let port = port
            .parse::<u16>()
            .map_err(|e| format!("Invalid listen specification: {s} ({e})"))?;
        Ok(Self {
            host: host.to_string(),
            port,
            tls,
        })
    }
}

impl fmt::Display for ListenSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let star = if self.tls { "*" } else { "" };
        write!(f, "{}:{star}{}", self.host, self.port)
    }
}
