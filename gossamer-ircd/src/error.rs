//! Typed errors for the places callers branch on the failure kind.

use std::io;

/// The terminal error of a connection. The first one ends the connection.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
    #[error("send queue full ({0} messages)")]
    SendQueueFull(usize),
    #[error("connection closed")]
    Closed,
}

/// Failures reported by the directory engine.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DirectoryError {
    #[error("nickname {0} is already in use")]
    NickInUse(String),
    #[error("no such subnet: {0}")]
    NoSuchSubnet(String),
    #[error("no such client")]
    NoSuchClient,
    #[error("no such channel")]
    NoSuchChannel,
    #[error("not on channel")]
    NotOnChannel,
    #[error("not a channel operator")]
    NotChannelOperator,
    #[error("server {0} is already linked")]
    AlreadyLinked(String),
    #[error("link refused: {0}")]
    LinkRefused(String),
}
