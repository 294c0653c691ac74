//! In-memory, single-server directory engine.
//!
//! Holds subnets, clients, channels and linked transports for one process.
//! Nothing is replicated: each linked transport is watched by a task that
//! discards what it reads and reports a [`DirectoryEvent::ServerSplit`]
//! once the peer goes away.

use std::collections::{BTreeMap, HashMap};

use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::directory::{
    Channel, ChannelId, Client, ClientId, Directory, DirectoryEvent, LinkId, Membership, Subnet,
    SubnetId, Transport,
};
use crate::error::DirectoryError;
use crate::modes::{ChannelModeDelta, ChannelModes, MemberMode, MemberModeDelta};

struct Link {
    id: LinkId,
    watcher: JoinHandle<()>,
}

pub struct LocalDirectory {
    network: String,
    server: String,
    default_subnet: SubnetId,
    subnets: HashMap<SubnetId, Subnet>,
    subnet_names: HashMap<String, SubnetId>,
    clients: HashMap<ClientId, Client>,
    nicks: HashMap<(SubnetId, String), ClientId>,
    channels: HashMap<ChannelId, Channel>,
    channel_names: HashMap<(SubnetId, String), ChannelId>,
    links: HashMap<String, Link>,
    next_id: u64,
    events: mpsc::UnboundedSender<DirectoryEvent>,
}

impl LocalDirectory {
    pub fn new(
        network: &str,
        server: &str,
        default_subnet: &str,
        events: mpsc::UnboundedSender<DirectoryEvent>,
    ) -> Self {
        let mut directory = Self {
            network: network.to_string(),
            server: server.to_string(),
            default_subnet: SubnetId(0),
            subnets: HashMap::new(),
            subnet_names: HashMap::new(),
            clients: HashMap::new(),
            nicks: HashMap::new(),
            channels: HashMap::new(),
            channel_names: HashMap::new(),
            links: HashMap::new(),
            next_id: 1,
            events,
        };
        directory.default_subnet = directory.add_subnet(default_subnet);
        directory
    }

    /// Register a subnet, returning the existing id if the name is taken.
    pub fn add_subnet(&mut self, name: &str) -> SubnetId {
        let key = name.to_lowercase();
        if let Some(&id) = self.subnet_names.get(&key) {
            return id;
        }
        let id = SubnetId(self.allocate());
        self.subnets.insert(
            id,
            Subnet {
                name: name.to_string(),
            },
        );
        self.subnet_names.insert(key, id);
        id
    }

    /// Names of the servers currently linked, sorted.
    pub fn linked_servers(&self) -> Vec<String> {
        let mut names: Vec<String> = self.links.keys().cloned().collect();
        names.sort();
        names
    }

    fn allocate(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn emit(&self, event: DirectoryEvent) {
        if self.events.send(event).is_err() {
            tracing::debug!("Directory event dropped, dispatch loop gone");
        }
    }

    fn watch_link(&mut self, mut transport: Box<dyn Transport>, server: &str) -> Link {
        let id = LinkId(self.allocate());
        let server = server.to_string();
        let events = self.events.clone();
        let watcher = tokio::spawn(async move {
            let mut buf = vec![0u8; 4096];
            let reason = loop {
                match transport.read(&mut buf).await {
                    Ok(0) => break "Connection closed".to_string(),
                    Ok(n) => tracing::trace!(%server, link = %id, "Discarding {n} bytes"),
                    Err(e) => break e.to_string(),
                }
            };
            let _ = events.send(DirectoryEvent::ServerSplit {
                server,
                link: id,
                reason,
            });
        });
        Link { id, watcher }
    }

    fn membership(&self, channel: ChannelId, client: ClientId) -> Result<&Membership, DirectoryError> {
        let channel = self
            .channels
            .get(&channel)
            .ok_or(DirectoryError::NoSuchChannel)?;
        channel
            .members
            .get(&client)
            .ok_or(DirectoryError::NotOnChannel)
    }
}

impl Directory for LocalDirectory {
    fn network_name(&self) -> &str {
        &self.network
    }

    fn server_name(&self) -> &str {
        &self.server
    }

    fn default_subnet(&self) -> SubnetId {
        self.default_subnet
    }

    fn subnet_by_name(&self, name: &str) -> Option<SubnetId> {
        self.subnet_names.get(&name.to_lowercase()).copied()
    }

    fn subnet(&self, id: SubnetId) -> Option<&Subnet> {
        self.subnets.get(&id)
    }

    fn client_by_nick(&self, subnet: SubnetId, nick: &str) -> Option<ClientId> {
        self.nicks.get(&(subnet, nick.to_lowercase())).copied()
    }

    fn client(&self, id: ClientId) -> Option<&Client> {
        self.clients.get(&id)
    }

    fn channel_by_name(&self, subnet: SubnetId, name: &str) -> Option<ChannelId> {
        self.channel_names.get(&(subnet, name.to_lowercase())).copied()
    }

    fn channel(&self, id: ChannelId) -> Option<&Channel> {
        self.channels.get(&id)
    }

    fn attach_client(&mut self, candidate: Client) -> Result<ClientId, DirectoryError> {
        if !self.subnets.contains_key(&candidate.subnet) {
            return Err(DirectoryError::NoSuchSubnet(format!("{:?}", candidate.subnet)));
        }
        let key = (candidate.subnet, candidate.nick.to_lowercase());
        if self.nicks.contains_key(&key) {
            return Err(DirectoryError::NickInUse(candidate.nick));
        }
        let id = ClientId(self.allocate());
        self.nicks.insert(key, id);
        self.clients.insert(id, candidate);
        Ok(id)
    }

    fn detach_client(&mut self, client: ClientId, reason: &str) {
        let Some(removed) = self.clients.remove(&client) else {
            return;
        };
        self.nicks
            .remove(&(removed.subnet, removed.nick.to_lowercase()));
        // TODO: announce the departure to remaining members once quits are
        // part of the callback set.
        for channel in self.channels.values_mut() {
            channel.members.remove(&client);
        }
        tracing::debug!(nick = %removed.nick, %reason, "Client detached");
    }

    fn private_message(
        &mut self,
        from: ClientId,
        to: ClientId,
        text: &str,
    ) -> Result<(), DirectoryError> {
        if !self.clients.contains_key(&from) || !self.clients.contains_key(&to) {
            return Err(DirectoryError::NoSuchClient);
        }
        self.emit(DirectoryEvent::PrivateMessage {
            from,
            to,
            text: text.to_string(),
        });
        Ok(())
    }

    fn channel_message(
        &mut self,
        from: ClientId,
        channel: ChannelId,
        text: &str,
    ) -> Result<(), DirectoryError> {
        self.membership(channel, from)?;
        self.emit(DirectoryEvent::ChannelMessage {
            from,
            channel,
            text: text.to_string(),
        });
        Ok(())
    }

    fn change_channel_mode(
        &mut self,
        by: ClientId,
        channel: ChannelId,
        delta: ChannelModeDelta,
        members: Vec<MemberModeDelta>,
    ) -> Result<(), DirectoryError> {
        if self.membership(channel, by)?.highest() < Some(MemberMode::Op) {
            return Err(DirectoryError::NotChannelOperator);
        }
        let state = self
            .channels
            .get_mut(&channel)
            .ok_or(DirectoryError::NoSuchChannel)?;

        let applied = state.modes.apply(&delta);
        let mut applied_members = Vec::new();
        for change in members {
            let Some(membership) = state.members.get_mut(&change.target) else {
                continue;
            };
            let current = match change.mode {
                MemberMode::Owner => membership.is_owner,
                MemberMode::Admin => membership.is_admin,
                MemberMode::Op => membership.is_op,
                MemberMode::HalfOp => membership.is_halfop,
                MemberMode::Voice => membership.is_voice,
            };
            if current != change.setting {
                membership.set(change.mode, change.setting);
                applied_members.push(change);
            }
        }

        if applied.is_empty() && applied_members.is_empty() {
            return Ok(());
        }
        self.emit(DirectoryEvent::ChannelModeChange {
            channel,
            by: Some(by),
            delta: applied,
            members: applied_members,
        });
        Ok(())
    }

    fn join_or_create_channel(
        &mut self,
        client: ClientId,
        subnet: SubnetId,
        name: &str,
    ) -> Result<ChannelId, DirectoryError> {
        if !self.clients.contains_key(&client) {
            return Err(DirectoryError::NoSuchClient);
        }
        if !self.subnets.contains_key(&subnet) {
            return Err(DirectoryError::NoSuchSubnet(format!("{subnet:?}")));
        }

        let key = (subnet, name.to_lowercase());
        let id = match self.channel_names.get(&key) {
            Some(&id) => id,
            None => {
                let id = ChannelId(self.allocate());
                self.channels.insert(
                    id,
                    Channel {
                        name: name.to_string(),
                        subnet,
                        topic: String::new(),
                        topic_by: self.server.clone(),
                        topic_ts: chrono::Utc::now().timestamp().max(0) as u64,
                        modes: ChannelModes::default(),
                        members: BTreeMap::new(),
                    },
                );
                self.channel_names.insert(key, id);
                tracing::debug!(channel = %name, "Channel created");
                id
            }
        };

        let channel = self
            .channels
            .get_mut(&id)
            .ok_or(DirectoryError::NoSuchChannel)?;
        if channel.members.contains_key(&client) {
            return Ok(id);
        }
        let membership = Membership {
            is_op: channel.members.is_empty(),
            ..Membership::default()
        };
        channel.members.insert(client, membership);
        self.emit(DirectoryEvent::ChannelJoin {
            channel: id,
            client,
        });
        Ok(id)
    }

    fn begin_link(
        &mut self,
        transport: Box<dyn Transport>,
        server: &str,
    ) -> Result<(), DirectoryError> {
        let key = server.to_lowercase();
        if key == self.server.to_lowercase() {
            return Err(DirectoryError::LinkRefused(format!(
                "{server} is this server"
            )));
        }
        if self.links.contains_key(&key) {
            return Err(DirectoryError::AlreadyLinked(server.to_string()));
        }
        let link = self.watch_link(transport, server);
        self.links.insert(key, link);
        self.emit(DirectoryEvent::ServerLink {
            server: server.to_string(),
            hub: None,
        });
        Ok(())
    }

    fn end_link(&mut self, server: &str, link: LinkId) {
        let key = server.to_lowercase();
        if self.links.get(&key).is_some_and(|current| current.id == link) {
            self.links.remove(&key);
            tracing::debug!(%server, %link, "Link removed");
        }
    }
}

impl Drop for LocalDirectory {
    fn drop(&mut self) {
        for link in self.links.values() {
            link.watcher.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::io::AsyncWriteExt;
    use tokio::time::timeout;

    use super::*;

    fn directory() -> (LocalDirectory, mpsc::UnboundedReceiver<DirectoryEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (LocalDirectory::new("TestNet", "irc.test", "main", tx), rx)
    }

    fn attach(directory: &mut LocalDirectory, nick: &str) -> ClientId {
        let subnet = directory.default_subnet();
        directory
            .attach_client(Client {
                nick: nick.into(),
                ident: nick.into(),
                host: "127.0.0.1".into(),
                gecos: nick.into(),
                subnet,
            })
            .unwrap()
    }

    #[test]
    fn nicknames_are_unique_per_subnet_ignoring_case() {
        let (mut dir, _rx) = directory();
        let alice = attach(&mut dir, "Alice");
        let main = dir.default_subnet();
        assert_eq!(dir.client_by_nick(main, "alice"), Some(alice));

        let err = dir
            .attach_client(Client {
                nick: "ALICE".into(),
                ident: "x".into(),
                host: "h".into(),
                gecos: "x".into(),
                subnet: main,
            })
            .unwrap_err();
        assert_eq!(err, DirectoryError::NickInUse("ALICE".into()));

        let other = dir.add_subnet("other");
        assert!(dir
            .attach_client(Client {
                nick: "alice".into(),
                ident: "x".into(),
                host: "h".into(),
                gecos: "x".into(),
                subnet: other,
            })
            .is_ok());
    }

    #[test]
    fn detach_releases_nickname_and_memberships() {
        let (mut dir, _rx) = directory();
        let alice = attach(&mut dir, "alice");
        let main = dir.default_subnet();
        let lobby = dir.join_or_create_channel(alice, main, "lobby").unwrap();

        dir.detach_client(alice, "gone");
        assert_eq!(dir.client_by_nick(main, "alice"), None);
        assert!(dir.channel(lobby).unwrap().members.is_empty());
        attach(&mut dir, "alice");
    }

    #[test]
    fn creator_is_op_and_joins_emit_events() {
        let (mut dir, mut rx) = directory();
        let alice = attach(&mut dir, "alice");
        let bob = attach(&mut dir, "bob");
        let main = dir.default_subnet();

        let lobby = dir.join_or_create_channel(alice, main, "Lobby").unwrap();
        assert_eq!(dir.channel_by_name(main, "lobby"), Some(lobby));
        assert_eq!(dir.join_or_create_channel(bob, main, "LOBBY").unwrap(), lobby);

        let channel = dir.channel(lobby).unwrap();
        assert_eq!(channel.name, "Lobby");
        assert!(channel.members[&alice].is_op);
        assert!(!channel.members[&bob].is_op);

        assert!(matches!(
            rx.try_recv().unwrap(),
            DirectoryEvent::ChannelJoin { client, .. } if client == alice
        ));
        assert!(matches!(
            rx.try_recv().unwrap(),
            DirectoryEvent::ChannelJoin { client, .. } if client == bob
        ));

        // Joining again is a no-op.
        dir.join_or_create_channel(bob, main, "lobby").unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn channel_messages_require_membership() {
        let (mut dir, mut rx) = directory();
        let alice = attach(&mut dir, "alice");
        let bob = attach(&mut dir, "bob");
        let main = dir.default_subnet();
        let lobby = dir.join_or_create_channel(alice, main, "lobby").unwrap();
        let _ = rx.try_recv();

        assert_eq!(
            dir.channel_message(bob, lobby, "hi"),
            Err(DirectoryError::NotOnChannel)
        );
        dir.channel_message(alice, lobby, "hi").unwrap();
        assert!(matches!(
            rx.try_recv().unwrap(),
            DirectoryEvent::ChannelMessage { from, ref text, .. } if from == alice && text == "hi"
        ));
    }

    #[test]
    fn mode_changes_require_op_and_report_only_applied_changes() {
        let (mut dir, mut rx) = directory();
        let alice = attach(&mut dir, "alice");
        let bob = attach(&mut dir, "bob");
        let main = dir.default_subnet();
        let lobby = dir.join_or_create_channel(alice, main, "lobby").unwrap();
        dir.join_or_create_channel(bob, main, "lobby").unwrap();
        while rx.try_recv().is_ok() {}

        let plus_n = ChannelModeDelta {
            added: vec!['n'],
            removed: vec![],
        };
        assert_eq!(
            dir.change_channel_mode(bob, lobby, plus_n.clone(), vec![]),
            Err(DirectoryError::NotChannelOperator)
        );

        let op_bob = MemberModeDelta {
            target: bob,
            mode: MemberMode::Op,
            setting: true,
        };
        dir.change_channel_mode(alice, lobby, plus_n.clone(), vec![op_bob.clone()])
            .unwrap();
        match rx.try_recv().unwrap() {
            DirectoryEvent::ChannelModeChange {
                by, delta, members, ..
            } => {
                assert_eq!(by, Some(alice));
                assert_eq!(delta.added, vec!['n']);
                assert_eq!(members, vec![op_bob.clone()]);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(dir.channel(lobby).unwrap().modes.has('n'));

        // Repeating the same change alters nothing and emits nothing.
        dir.change_channel_mode(bob, lobby, plus_n, vec![op_bob]).unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn private_messages_need_both_ends() {
        let (mut dir, mut rx) = directory();
        let alice = attach(&mut dir, "alice");
        assert_eq!(
            dir.private_message(alice, ClientId(999), "hi"),
            Err(DirectoryError::NoSuchClient)
        );
        let bob = attach(&mut dir, "bob");
        dir.private_message(alice, bob, "hi").unwrap();
        assert!(matches!(
            rx.try_recv().unwrap(),
            DirectoryEvent::PrivateMessage { to, .. } if to == bob
        ));
    }

    #[tokio::test]
    async fn links_are_unique_and_never_to_self() {
        let (mut dir, mut rx) = directory();
        let (a, _a) = tokio::io::duplex(64);
        let (b, _b) = tokio::io::duplex(64);
        let (c, _c) = tokio::io::duplex(64);

        dir.begin_link(Box::new(a), "hub.test").unwrap();
        assert!(matches!(
            rx.try_recv().unwrap(),
            DirectoryEvent::ServerLink { ref server, hub: None } if server == "hub.test"
        ));
        assert_eq!(
            dir.begin_link(Box::new(b), "HUB.test"),
            Err(DirectoryError::AlreadyLinked("HUB.test".into()))
        );
        assert!(matches!(
            dir.begin_link(Box::new(c), "irc.test"),
            Err(DirectoryError::LinkRefused(_))
        ));
        assert_eq!(dir.linked_servers(), vec!["hub.test".to_string()]);
    }

    #[tokio::test]
    async fn split_links_can_relink() {
        let (mut dir, mut rx) = directory();
        let (a, peer) = tokio::io::duplex(64);
        dir.begin_link(Box::new(a), "hub.test").unwrap();
        assert!(matches!(rx.try_recv().unwrap(), DirectoryEvent::ServerLink { .. }));

        drop(peer);
        let split = timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        let DirectoryEvent::ServerSplit { server, link, .. } = split else {
            panic!("expected a split, got {split:?}");
        };
        assert_eq!(server, "hub.test");

        // Still registered until the split is acknowledged.
        let (b, _b) = tokio::io::duplex(64);
        assert_eq!(
            dir.begin_link(Box::new(b), "hub.test"),
            Err(DirectoryError::AlreadyLinked("hub.test".into()))
        );
        dir.end_link(&server, link);
        assert!(dir.linked_servers().is_empty());

        let (c, _c) = tokio::io::duplex(64);
        dir.begin_link(Box::new(c), "hub.test").unwrap();
        // A split for the old link must not drop the new one.
        dir.end_link("hub.test", link);
        assert_eq!(dir.linked_servers(), vec!["hub.test".to_string()]);
    }

    #[tokio::test]
    async fn link_traffic_is_discarded_without_splitting() {
        let (mut dir, mut rx) = directory();
        let (a, mut peer) = tokio::io::duplex(64);
        dir.begin_link(Box::new(a), "hub.test").unwrap();
        let _ = rx.try_recv();

        peer.write_all(&[b'x'; 1000]).await.unwrap();
        let more = timeout(Duration::from_millis(100), rx.recv()).await;
        assert!(more.is_err(), "unexpected event {more:?}");
        assert_eq!(dir.linked_servers(), vec!["hub.test".to_string()]);
    }
}
