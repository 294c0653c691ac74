use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use gossamer_ircd::config::ServerConfig;
use gossamer_ircd::ircd::Ircd;
use gossamer_ircd::link::LinkListener;
use gossamer_ircd::listener::ClientListener;
use gossamer_ircd::tls::TlsMaterial;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("gossamer_ircd=info".parse()?))
        .init();

    let config = ServerConfig::parse();
    config.validate()?;

    let (Some(ca), Some(cert), Some(key)) = (
        &config.tls_network_ca,
        &config.tls_certificate,
        &config.tls_private_key,
    ) else {
        anyhow::bail!("TLS material is required");
    };
    let tls = TlsMaterial::load(ca, cert, key).context("Failed to load TLS material")?;

    let ircd = Ircd::new(&config, Some(&tls))?;
    let handle = ircd.handle();

    let client_acceptor = tls.client_acceptor()?;
    let mut client_listeners = Vec::new();
    for spec in &config.client_listens {
        let acceptor = spec.tls.then(|| client_acceptor.clone());
        client_listeners.push(ClientListener::bind(spec, acceptor, handle.incoming.clone()).await?);
    }

    let link_acceptor = tls.link_acceptor()?;
    let mut link_listeners = Vec::new();
    for spec in &config.server_listens {
        link_listeners.push(LinkListener::bind(spec, link_acceptor.clone(), handle.links.clone()).await?);
    }

    if client_listeners.is_empty() && link_listeners.is_empty() {
        tracing::warn!("No listeners configured");
    }

    ircd.run().await;
    Ok(())
}
