//! Connection-facing half of a gossamer IRC server.
//!
//! Terminates client and server-to-server connections, speaks the IRC line
//! protocol, and serializes everything against a directory engine from a
//! single dispatch loop.

pub mod config;
pub mod connection;
pub mod directory;
pub mod error;
pub mod irc;
pub mod ircd;
pub mod line;
pub mod link;
pub mod listener;
pub mod local;
pub mod modes;
pub mod pending;
pub mod reply;
pub mod sendq;
pub mod tls;
