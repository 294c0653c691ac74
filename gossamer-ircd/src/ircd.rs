//! The dispatch loop.
//!
//! [`Ircd`] owns every cross-connection map and is the only caller of the
//! directory engine. It serializes new connections, connection events,
//! verified server links and directory callbacks through one
//! `tokio::select!` loop, so none of its state needs a lock.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use tokio::sync::mpsc;
use tokio_rustls::TlsConnector;

use crate::config::ServerConfig;
use crate::connection::{
    ConnId, ConnectionEvent, ConnectionEventKind, ConnectionOptions, IrcConnection,
};
use crate::directory::{
    Channel, ChannelId, ClientId, Directory, DirectoryEvent, LinkId, Membership, SubnetId,
};
use crate::error::{ConnectionError, DirectoryError};
use crate::irc::{ClientMessage, GenericMessage};
use crate::link::{self, LinkEvent};
use crate::listener::Incoming;
use crate::local::LocalDirectory;
use crate::modes::{self, ChannelModeDelta, MemberModeDelta};
use crate::pending::{PendingClient, Transition};
use crate::reply::{self, NameEntry, Nih, ServerInfo, ServerMessage};
use crate::tls::TlsMaterial;

const EVENT_QUEUE_LEN: usize = 1024;

/// Senders through which listeners feed the dispatch loop.
#[derive(Clone)]
pub struct IrcdHandle {
    pub incoming: mpsc::Sender<Incoming>,
    pub links: mpsc::Sender<LinkEvent>,
}

/// A channel reference with the leading `#` removed, resolved against the
/// referring client's subnet when unqualified.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelRef {
    pub name: String,
    pub subnet: Option<SubnetId>,
    pub qualified: bool,
}

pub struct Ircd {
    directory: Box<dyn Directory>,
    directory_events: mpsc::UnboundedReceiver<DirectoryEvent>,
    info: Arc<ServerInfo>,
    options: ConnectionOptions,
    connector: Option<TlsConnector>,

    connections: HashMap<ConnId, IrcConnection>,
    pending: HashMap<ConnId, PendingClient>,
    client_by_conn: HashMap<ConnId, ClientId>,
    conn_by_client: HashMap<ClientId, ConnId>,

    conn_tx: mpsc::Sender<ConnectionEvent>,
    conn_rx: mpsc::Receiver<ConnectionEvent>,
    incoming_tx: mpsc::Sender<Incoming>,
    incoming_rx: mpsc::Receiver<Incoming>,
    link_tx: mpsc::Sender<LinkEvent>,
    link_rx: mpsc::Receiver<LinkEvent>,
}

impl Ircd {
    /// Build a server backed by the in-memory directory.
    pub fn new(config: &ServerConfig, tls: Option<&TlsMaterial>) -> Result<Self> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let directory = LocalDirectory::new(
            &config.network,
            &config.server,
            &config.default_subnet,
            events_tx,
        );
        let connector = tls.map(TlsMaterial::connector).transpose()?;
        if !config.server_desc.is_empty() {
            tracing::info!(server = %config.server, "{}", config.server_desc);
        }
        Ok(Self::with_directory(
            Box::new(directory),
            events_rx,
            config.connection_options(),
            connector,
        ))
    }

    pub fn with_directory(
        directory: Box<dyn Directory>,
        directory_events: mpsc::UnboundedReceiver<DirectoryEvent>,
        options: ConnectionOptions,
        connector: Option<TlsConnector>,
    ) -> Self {
        let info = Arc::new(ServerInfo {
            server_name: directory.server_name().to_string(),
            network_name: directory.network_name().to_string(),
            created: Utc::now(),
        });
        let (conn_tx, conn_rx) = mpsc::channel(EVENT_QUEUE_LEN);
        let (incoming_tx, incoming_rx) = mpsc::channel(EVENT_QUEUE_LEN);
        let (link_tx, link_rx) = mpsc::channel(16);
        Self {
            directory,
            directory_events,
            info,
            options,
            connector,
            connections: HashMap::new(),
            pending: HashMap::new(),
            client_by_conn: HashMap::new(),
            conn_by_client: HashMap::new(),
            conn_tx,
            conn_rx,
            incoming_tx,
            incoming_rx,
            link_tx,
            link_rx,
        }
    }

    pub fn handle(&self) -> IrcdHandle {
        IrcdHandle {
            incoming: self.incoming_tx.clone(),
            links: self.link_tx.clone(),
        }
    }

    /// Run the dispatch loop forever.
    pub async fn run(mut self) {
        tracing::info!(
            server = %self.info.server_name,
            network = %self.info.network_name,
            "Starting ircd"
        );
        loop {
            tokio::select! {
                // Render engine callbacks before consuming more input.
                biased;
                Some(event) = self.directory_events.recv() => self.on_directory_event(event),
                Some(incoming) = self.incoming_rx.recv() => self.accept(incoming),
                Some(event) = self.conn_rx.recv() => self.on_connection_event(event),
                Some(link) = self.link_rx.recv() => self.on_link(link),
                else => break,
            }
        }
    }

    fn accept(&mut self, incoming: Incoming) {
        let conn = IrcConnection::spawn(
            incoming.transport,
            incoming.host.clone(),
            self.info.clone(),
            self.options,
            self.conn_tx.clone(),
        );
        let id = conn.id();
        tracing::info!(conn = %id, host = %incoming.host, "New client connection");
        self.pending.insert(
            id,
            PendingClient::new(id, self.directory.default_subnet(), incoming.host),
        );
        self.connections.insert(id, conn);
    }

    fn on_connection_event(&mut self, event: ConnectionEvent) {
        let id = event.conn;
        let Some(conn) = self.connections.get(&id) else {
            tracing::trace!(conn = %id, "Event for a closed connection");
            return;
        };
        let msg = match event.kind {
            ConnectionEventKind::Error(err) => {
                self.drop_connection(id, &err);
                return;
            }
            ConnectionEventKind::Message(msg) => msg,
        };

        if let Some(pending) = self.pending.get_mut(&id) {
            match pending.handle(msg, self.directory.as_mut(), conn) {
                Transition::Pending => {}
                Transition::Registered(client) => {
                    self.pending.remove(&id);
                    self.client_by_conn.insert(id, client);
                    self.conn_by_client.insert(client, id);
                }
                Transition::Quit(reason) => {
                    tracing::info!(conn = %id, "Unregistered client quit: {reason}");
                    self.close(id, &reason);
                }
            }
            return;
        }
        if let Some(&client) = self.client_by_conn.get(&id) {
            self.dispatch(id, client, msg);
        }
    }

    fn drop_connection(&mut self, id: ConnId, err: &ConnectionError) {
        tracing::warn!(conn = %id, "Connection error: {err}");
        self.close(id, &err.to_string());
    }

    fn close(&mut self, id: ConnId, reason: &str) {
        if let Some(conn) = self.connections.remove(&id) {
            conn.shutdown();
        }
        self.pending.remove(&id);
        if let Some(client) = self.client_by_conn.remove(&id) {
            self.conn_by_client.remove(&client);
            self.directory.detach_client(client, reason);
        }
    }

    fn on_link(&mut self, link: LinkEvent) {
        tracing::info!(server = %link.server, origin = %link.origin, "Connection from server");
        if let Err(e) = self.directory.begin_link(link.transport, &link.server) {
            tracing::error!(server = %link.server, "Link failed: {e}");
        }
    }

    /// Route one message from a registered client.
    fn dispatch(&mut self, id: ConnId, client: ClientId, msg: ClientMessage) {
        let nick = self.nick_of(client);
        match msg {
            ClientMessage::PrivateMessage { to, message } => {
                let Some(target) = self.find_client_by_ref(client, &to) else {
                    tracing::debug!(conn = %id, "No such nick {to}");
                    self.send(id, ServerMessage::NoSuchNick { to: nick, target: to });
                    return;
                };
                if let Err(e) = self.directory.private_message(client, target, &message) {
                    tracing::debug!(conn = %id, "Private message to {to} failed: {e}");
                    self.send(id, ServerMessage::NoSuchNick { to: nick, target: to });
                }
            }
            ClientMessage::ChannelMessage { to, message } => {
                let Some(channel) = self.resolve_channel(client, &to) else {
                    tracing::debug!(conn = %id, "Channel not found [{to}]");
                    self.send(id, ServerMessage::NoSuchChannel { to: nick, channel: to });
                    return;
                };
                match self.directory.channel_message(client, channel, &message) {
                    Ok(()) => {}
                    Err(DirectoryError::NotOnChannel) => {
                        self.send(id, ServerMessage::CannotSendToChannel { to: nick, channel: to });
                    }
                    Err(e) => {
                        tracing::debug!(conn = %id, "Channel message to {to} failed: {e}");
                        self.send(id, ServerMessage::NoSuchChannel { to: nick, channel: to });
                    }
                }
            }
            ClientMessage::ChannelModeChange { target, mode, args } => {
                let Some(channel) = self.resolve_channel(client, &target) else {
                    tracing::debug!(conn = %id, "Channel not found [{target}]");
                    self.send(id, ServerMessage::NoSuchChannel { to: nick, channel: target });
                    return;
                };
                let (delta, members) = modes::parse_channel_mode_string(&mode, &args, |name| {
                    self.find_client_by_ref(client, name)
                });
                match self
                    .directory
                    .change_channel_mode(client, channel, delta, members)
                {
                    Ok(()) => {}
                    Err(DirectoryError::NotChannelOperator | DirectoryError::NotOnChannel) => {
                        self.send(id, ServerMessage::ChanOpPrivsNeeded { to: nick, channel: target });
                    }
                    Err(e) => {
                        tracing::debug!(conn = %id, "Mode change on {target} failed: {e}");
                        self.send(id, ServerMessage::NoSuchChannel { to: nick, channel: target });
                    }
                }
            }
            ClientMessage::Connect { target, host, port } => {
                self.initiate_connection(id, &nick, target, host, port);
            }
            ClientMessage::Join { targets, .. } => self.client_join(id, client, &targets),
            ClientMessage::Invalid { command, error, .. } => match error {
                Some(text) => self.send(id, ServerMessage::Notice { to: nick, text }),
                None => self.send(id, ServerMessage::NeedMoreParams { to: nick, command }),
            },
            ClientMessage::Nick { .. } => self.send(
                id,
                ServerMessage::Notice {
                    to: nick,
                    text: "Nickname changes are not supported".to_string(),
                },
            ),
            ClientMessage::User { .. } => self.send(
                id,
                ServerMessage::Notice {
                    to: nick,
                    text: "You are already registered".to_string(),
                },
            ),
            ClientMessage::Generic(generic) => self.dispatch_generic(id, client, nick, generic),
        }
    }

    fn dispatch_generic(&mut self, id: ConnId, client: ClientId, nick: String, msg: GenericMessage) {
        let GenericMessage { command, args } = msg;
        let first = args.into_iter().next();
        match (command.as_str(), first) {
            ("PING", token) => {
                self.send(id, ServerMessage::Pong { token: token.unwrap_or_default() });
            }
            ("PONG", _) => {}
            ("QUIT", reason) => {
                let reason = reason.unwrap_or_default();
                tracing::info!(conn = %id, %nick, "Client quit: {reason}");
                self.close(id, &reason);
            }
            ("VERSION", _) => {
                let features = self.supported_features();
                self.send(id, ServerMessage::WelcomeSupportedFeatures { nick, features });
            }
            ("MODE", Some(target)) => self.mode_query(id, client, nick, target),
            _ => {
                tracing::debug!(conn = %id, "Unknown command {command}");
                self.send(
                    id,
                    ServerMessage::UnknownCommand {
                        to: nick,
                        command: command.clone(),
                    },
                );
            }
        }
    }

    fn mode_query(&self, id: ConnId, client: ClientId, nick: String, target: String) {
        if target.starts_with('#') {
            let modes = self
                .resolve_channel(client, &target)
                .and_then(|channel| self.directory.channel(channel))
                .map(|channel| channel.modes.to_mode_string());
            match modes {
                Some(modes) => self.send(
                    id,
                    ServerMessage::ChannelModeIs {
                        to: nick,
                        channel: target,
                        modes,
                    },
                ),
                None => self.send(id, ServerMessage::NoSuchChannel { to: nick, channel: target }),
            }
            return;
        }
        match self.find_client_by_ref(client, &target) {
            Some(found) if found == client => self.send(id, ServerMessage::UserModeIs { to: nick }),
            Some(_) => tracing::debug!(conn = %id, "Ignoring mode query for {target}"),
            None => self.send(id, ServerMessage::NoSuchNick { to: nick, target }),
        }
    }

    fn supported_features(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            ("casemapping".to_string(), "ascii".to_string()),
            ("chanmodes".to_string(), format!(",,,{}", modes::CHANNEL_FLAGS)),
            ("chantypes".to_string(), "#".to_string()),
            ("network".to_string(), self.info.network_name.clone()),
            ("prefix".to_string(), "(qaohv)~&@%+".to_string()),
        ])
    }

    fn initiate_connection(&self, id: ConnId, nick: &str, target: String, host: String, port: u16) {
        let Some(connector) = self.connector.clone() else {
            self.send(
                id,
                ServerMessage::Notice {
                    to: nick.to_string(),
                    text: format!("Cannot link to {target}: TLS is not configured"),
                },
            );
            return;
        };
        tracing::info!(conn = %id, %target, "Linking to {host}:{port}");
        let links = self.link_tx.clone();
        tokio::spawn(async move {
            match link::dial(connector, &target, &host, port).await {
                Ok(event) => {
                    let _ = links.send(event).await;
                }
                Err(e) => tracing::warn!(%target, "Error linking to {host}:{port}: {e:#}"),
            }
        });
    }

    /// Process every target of a JOIN.
    fn client_join(&mut self, id: ConnId, client: ClientId, targets: &[String]) {
        let nick = self.nick_of(client);
        for target in targets {
            let Some(bare) = target.strip_prefix('#') else {
                self.send(id, ServerMessage::BadChannelMask { to: nick.clone(), channel: target.clone() });
                continue;
            };
            let channel_ref = self.expand_channel_ref(client, bare);
            if channel_ref.name.is_empty() {
                self.send(id, ServerMessage::BadChannelMask { to: nick.clone(), channel: target.clone() });
                continue;
            }
            let Some(subnet) = channel_ref.subnet else {
                self.send(id, ServerMessage::NoSuchChannel { to: nick.clone(), channel: target.clone() });
                continue;
            };
            if !channel_ref.qualified {
                if let Some(from) = self.mask_of(client) {
                    let subnet_name = self.subnet_name(subnet);
                    self.send(
                        id,
                        ServerMessage::Part {
                            from,
                            channel: target.clone(),
                            message: format!("Joining you to #{subnet_name}:{bare} instead."),
                        },
                    );
                }
            }
            if let Err(e) = self
                .directory
                .join_or_create_channel(client, subnet, &channel_ref.name)
            {
                tracing::debug!(conn = %id, "Join of {target} failed: {e}");
                self.send(id, ServerMessage::NoSuchChannel { to: nick.clone(), channel: target.clone() });
            }
        }
    }

    /// Resolve `nick` or `subnet:nick` relative to `context`'s subnet.
    pub fn find_client_by_ref(&self, context: ClientId, reference: &str) -> Option<ClientId> {
        let subnet = self.directory.client(context)?.subnet;
        match reference.split_once(':') {
            Some((subnet, nick)) => {
                let subnet = self.directory.subnet_by_name(subnet)?;
                self.directory.client_by_nick(subnet, nick)
            }
            None => self.directory.client_by_nick(subnet, reference),
        }
    }

    /// Split `subnet:name` (without the `#`); a bare name belongs to the
    /// context client's subnet.
    pub fn expand_channel_ref(&self, context: ClientId, reference: &str) -> ChannelRef {
        match reference.split_once(':') {
            Some((subnet, name)) => ChannelRef {
                name: name.to_string(),
                subnet: self.directory.subnet_by_name(subnet),
                qualified: true,
            },
            None => ChannelRef {
                name: reference.to_string(),
                subnet: self.directory.client(context).map(|c| c.subnet),
                qualified: false,
            },
        }
    }

    /// Look up a channel target for routing. Only fully qualified
    /// references (`#subnet:name`) resolve.
    fn resolve_channel(&self, context: ClientId, target: &str) -> Option<ChannelId> {
        let channel_ref = self.expand_channel_ref(context, target.strip_prefix('#')?);
        if !channel_ref.qualified {
            return None;
        }
        self.directory
            .channel_by_name(channel_ref.subnet?, &channel_ref.name)
    }

    /// How `client` appears to `viewer`: bare nick within the same subnet,
    /// `subnet:nick` across subnets.
    pub fn client_as_seen_by(&self, client: ClientId, viewer: ClientId) -> Option<Nih> {
        let seen = self.directory.client(client)?;
        let same_subnet = self
            .directory
            .client(viewer)
            .is_some_and(|v| v.subnet == seen.subnet);
        let nick = if same_subnet {
            seen.nick.clone()
        } else {
            format!("{}:{}", self.subnet_name(seen.subnet), seen.nick)
        };
        Some(Nih {
            nick,
            ident: seen.ident.clone(),
            host: seen.host.clone(),
        })
    }

    fn mask_of(&self, client: ClientId) -> Option<Nih> {
        self.client_as_seen_by(client, client)
    }

    fn nick_of(&self, client: ClientId) -> String {
        self.directory
            .client(client)
            .map(|c| c.nick.clone())
            .unwrap_or_else(|| "*".to_string())
    }

    fn subnet_name(&self, subnet: SubnetId) -> String {
        self.directory
            .subnet(subnet)
            .map(|s| s.name.clone())
            .unwrap_or_default()
    }

    fn channel_display_name(&self, channel: &Channel) -> String {
        format!("#{}:{}", self.subnet_name(channel.subnet), channel.name)
    }

    fn send(&self, id: ConnId, msg: ServerMessage) {
        if let Some(conn) = self.connections.get(&id) {
            conn.send(&msg);
        }
    }

    fn for_each_local_member<F>(&self, channel: &Channel, mut f: F)
    where
        F: FnMut(&IrcConnection, ClientId, &Membership),
    {
        for (&member, membership) in &channel.members {
            let Some(conn) = self
                .conn_by_client
                .get(&member)
                .and_then(|id| self.connections.get(id))
            else {
                continue;
            };
            f(conn, member, membership);
        }
    }

    fn send_topic(&self, conn: &IrcConnection, viewer: ClientId, channel: &Channel) {
        let to = self.nick_of(viewer);
        let name = self.channel_display_name(channel);
        conn.send(&ServerMessage::Topic {
            to: to.clone(),
            channel: name.clone(),
            topic: channel.topic.clone(),
        });
        conn.send(&ServerMessage::TopicOrigin {
            to,
            channel: name,
            author: channel.topic_by.clone(),
            ts: channel.topic_ts,
        });
    }

    fn send_names(&self, conn: &IrcConnection, viewer: ClientId, channel: &Channel) {
        let to = self.nick_of(viewer);
        let name = self.channel_display_name(channel);
        let entries = channel.members.iter().filter_map(|(&member, membership)| {
            Some(NameEntry {
                prefix: reply::rank_prefix(membership),
                nick: self.client_as_seen_by(member, viewer)?.nick,
            })
        });
        for msg in reply::names_replies(&to, &name, entries) {
            conn.send(&msg);
        }
        conn.send(&ServerMessage::EndOfNames { to, channel: name });
    }

    fn on_directory_event(&mut self, event: DirectoryEvent) {
        match event {
            DirectoryEvent::ServerLink { server, hub } => self.on_server_link(&server, hub.as_deref()),
            DirectoryEvent::ServerSplit {
                server,
                link,
                reason,
            } => self.on_server_split(&server, link, &reason),
            DirectoryEvent::PrivateMessage { from, to, text } => self.on_private_message(from, to, &text),
            DirectoryEvent::ChannelJoin { channel, client } => self.on_channel_join(channel, client),
            DirectoryEvent::ChannelPart {
                channel,
                client,
                reason,
            } => {
                if let Err(e) = self.on_channel_part(channel, client, &reason) {
                    tracing::error!(%channel, %client, "{e}");
                }
            }
            DirectoryEvent::ChannelMessage {
                from,
                channel,
                text,
            } => self.on_channel_message(from, channel, &text),
            DirectoryEvent::ChannelModeChange {
                channel,
                by,
                delta,
                members,
            } => self.on_channel_mode_change(channel, by, &delta, &members),
        }
    }

    fn on_server_link(&self, server: &str, hub: Option<&str>) {
        match hub {
            Some(hub) => tracing::info!(%server, %hub, "Server linked"),
            None => tracing::info!(%server, "Server linked"),
        }
    }

    fn on_server_split(&mut self, server: &str, link: LinkId, reason: &str) {
        tracing::info!(%server, %link, "Server split: {reason}");
        self.directory.end_link(server, link);
    }

    fn on_private_message(&self, from: ClientId, to: ClientId, text: &str) {
        let Some(conn) = self
            .conn_by_client
            .get(&to)
            .and_then(|id| self.connections.get(id))
        else {
            return;
        };
        let Some(sender) = self.client_as_seen_by(from, to) else {
            return;
        };
        conn.send(&ServerMessage::PrivateMessage {
            from: sender,
            to: self.nick_of(to),
            message: text.to_string(),
        });
    }

    fn on_channel_join(&self, channel: ChannelId, client: ClientId) {
        let Some(state) = self.directory.channel(channel) else {
            return;
        };
        let name = self.channel_display_name(state);
        self.for_each_local_member(state, |conn, member, _| {
            let Some(from) = self.client_as_seen_by(client, member) else {
                return;
            };
            conn.send(&ServerMessage::Join {
                from,
                channel: name.clone(),
            });
            if member == client {
                self.send_topic(conn, client, state);
                self.send_names(conn, client, state);
            }
        });
    }

    fn on_channel_part(&self, channel: ChannelId, client: ClientId, reason: &str) -> Result<()> {
        anyhow::bail!("OnChannelPart is unimplemented ({client} leaving {channel}: {reason})")
    }

    fn on_channel_message(&self, from: ClientId, channel: ChannelId, text: &str) {
        let Some(state) = self.directory.channel(channel) else {
            return;
        };
        let name = self.channel_display_name(state);
        self.for_each_local_member(state, |conn, member, _| {
            if member == from {
                return;
            }
            let Some(sender) = self.client_as_seen_by(from, member) else {
                return;
            };
            conn.send(&ServerMessage::ChannelMessage {
                from: sender,
                channel: name.clone(),
                message: text.to_string(),
            });
        });
    }

    fn on_channel_mode_change(
        &self,
        channel: ChannelId,
        by: Option<ClientId>,
        delta: &ChannelModeDelta,
        members: &[MemberModeDelta],
    ) {
        let Some(state) = self.directory.channel(channel) else {
            return;
        };
        let name = self.channel_display_name(state);
        self.for_each_local_member(state, |conn, member, _| {
            let from = by
                .and_then(|by| self.client_as_seen_by(by, member))
                .map(|nih| nih.to_string())
                .unwrap_or_else(|| self.info.server_name.clone());
            let mode = modes::stringify_channel_modes(delta, members, |target| {
                self.client_as_seen_by(target, member)
                    .map(|nih| nih.nick)
                    .unwrap_or_default()
            });
            conn.send(&ServerMessage::ChannelMode {
                from,
                channel: name.clone(),
                mode,
            });
        });
    }
}
