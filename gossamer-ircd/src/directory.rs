//! Boundary to the directory engine.
//!
//! The directory owns clients, channels, memberships and replication. The
//! dispatch loop is its only caller. Operations that change shared state
//! report their outcome back as [`DirectoryEvent`]s on the channel handed
//! to the engine at construction; the dispatch loop renders those events
//! to locally connected clients.

use std::collections::BTreeMap;
use std::fmt;

use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::DirectoryError;
use crate::modes::{ChannelModeDelta, ChannelModes, MemberMode, MemberModeDelta};

/// A bidirectional byte stream: plain TCP, TLS, or an in-memory pipe.
pub trait Transport: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> Transport for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SubnetId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ClientId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ChannelId(pub u64);

/// One established link. A server that relinks gets a new id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LinkId(pub u64);

/// A named partition of the network namespace.
#[derive(Debug, Clone)]
pub struct Subnet {
    pub name: String,
}

/// A registered client as the directory knows it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Client {
    pub nick: String,
    pub ident: String,
    pub host: String,
    pub gecos: String,
    pub subnet: SubnetId,
}

/// Ranks one member holds on a channel.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Membership {
    pub is_owner: bool,
    pub is_admin: bool,
    pub is_op: bool,
    pub is_halfop: bool,
    pub is_voice: bool,
}

impl Membership {
    pub fn set(&mut self, mode: MemberMode, value: bool) {
        match mode {
            MemberMode::Owner => self.is_owner = value,
            MemberMode::Admin => self.is_admin = value,
            MemberMode::Op => self.is_op = value,
            MemberMode::HalfOp => self.is_halfop = value,
            MemberMode::Voice => self.is_voice = value,
        }
    }

    /// The highest rank held, if any.
    pub fn highest(&self) -> Option<MemberMode> {
        if self.is_owner {
            Some(MemberMode::Owner)
        } else if self.is_admin {
            Some(MemberMode::Admin)
        } else if self.is_op {
            Some(MemberMode::Op)
        } else if self.is_halfop {
            Some(MemberMode::HalfOp)
        } else if self.is_voice {
            Some(MemberMode::Voice)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone)]
pub struct Channel {
    pub name: String,
    pub subnet: SubnetId,
    pub topic: String,
    pub topic_by: String,
    /// Unix seconds.
    pub topic_ts: u64,
    pub modes: ChannelModes,
    /// Every member, network-wide.
    pub members: BTreeMap<ClientId, Membership>,
}

/// Callbacks from the directory engine, delivered to the dispatch loop.
#[derive(Debug)]
pub enum DirectoryEvent {
    ServerLink {
        server: String,
        hub: Option<String>,
    },
    /// A link's transport closed or failed.
    ServerSplit {
        server: String,
        link: LinkId,
        reason: String,
    },
    PrivateMessage {
        from: ClientId,
        to: ClientId,
        text: String,
    },
    ChannelJoin {
        channel: ChannelId,
        client: ClientId,
    },
    ChannelPart {
        channel: ChannelId,
        client: ClientId,
        reason: String,
    },
    ChannelMessage {
        from: ClientId,
        channel: ChannelId,
        text: String,
    },
    ChannelModeChange {
        channel: ChannelId,
        by: Option<ClientId>,
        delta: ChannelModeDelta,
        members: Vec<MemberModeDelta>,
    },
}

/// Operations the dispatch loop calls on the directory engine.
///
/// Lookups by name are case-insensitive.
pub trait Directory: Send {
    fn network_name(&self) -> &str;
    fn server_name(&self) -> &str;
    fn default_subnet(&self) -> SubnetId;

    fn subnet_by_name(&self, name: &str) -> Option<SubnetId>;
    fn subnet(&self, id: SubnetId) -> Option<&Subnet>;
    fn client_by_nick(&self, subnet: SubnetId, nick: &str) -> Option<ClientId>;
    fn client(&self, id: ClientId) -> Option<&Client>;
    fn channel_by_name(&self, subnet: SubnetId, name: &str) -> Option<ChannelId>;
    fn channel(&self, id: ChannelId) -> Option<&Channel>;

    fn attach_client(&mut self, candidate: Client) -> Result<ClientId, DirectoryError>;
    fn detach_client(&mut self, client: ClientId, reason: &str);

    fn private_message(
        &mut self,
        from: ClientId,
        to: ClientId,
        text: &str,
    ) -> Result<(), DirectoryError>;
    fn channel_message(
        &mut self,
        from: ClientId,
        channel: ChannelId,
        text: &str,
    ) -> Result<(), DirectoryError>;
    fn change_channel_mode(
        &mut self,
        by: ClientId,
        channel: ChannelId,
        delta: ChannelModeDelta,
        members: Vec<MemberModeDelta>,
    ) -> Result<(), DirectoryError>;
    fn join_or_create_channel(
        &mut self,
        client: ClientId,
        subnet: SubnetId,
        name: &str,
    ) -> Result<ChannelId, DirectoryError>;

    /// Hand a verified server-to-server transport to the engine.
    fn begin_link(
        &mut self,
        transport: Box<dyn Transport>,
        server: &str,
    ) -> Result<(), DirectoryError>;

    /// Forget a link reported by [`DirectoryEvent::ServerSplit`]. A stale
    /// `link` (the server has since relinked) is ignored.
    fn end_link(&mut self, server: &str, link: LinkId);
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "client-{}", self.0)
    }
}

impl fmt::Display for LinkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "link-{}", self.0)
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "channel-{}", self.0)
    }
}
