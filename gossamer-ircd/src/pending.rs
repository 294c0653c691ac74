//! Registration state machine for connections that have not yet attached a
//! client.

use crate::connection::{ConnId, IrcConnection};
use crate::directory::{Client, ClientId, Directory, SubnetId};
use crate::irc::{self, ClientMessage, GenericMessage};
use crate::reply::ServerMessage;

/// Outcome of feeding one message to a [`PendingClient`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    Pending,
    Registered(ClientId),
    /// The client sent QUIT before registering.
    Quit(String),
}

#[derive(Debug)]
pub struct PendingClient {
    conn: ConnId,
    subnet: SubnetId,
    nick: String,
    ident: String,
    gecos: String,
    host: String,
}

impl PendingClient {
    pub fn new(conn: ConnId, subnet: SubnetId, host: String) -> Self {
        Self {
            conn,
            subnet,
            nick: String::new(),
            ident: String::new(),
            gecos: String::new(),
            host,
        }
    }

    pub fn nick(&self) -> &str {
        &self.nick
    }

    fn nick_taken(&self, directory: &dyn Directory, nick: &str) -> bool {
        directory.client_by_nick(self.subnet, nick).is_some()
    }

    pub fn handle(
        &mut self,
        msg: ClientMessage,
        directory: &mut dyn Directory,
        conn: &IrcConnection,
    ) -> Transition {
        match msg {
            ClientMessage::Nick { nick } => {
                if !irc::is_valid_nick(&nick) {
                    tracing::debug!(conn = %self.conn, "Rejected nickname {nick:?}");
                    conn.send(&ServerMessage::ErroneousNickname { nick });
                    return Transition::Pending;
                }
                if self.nick_taken(directory, &nick) {
                    conn.send(&ServerMessage::NickInUse { nick });
                    return Transition::Pending;
                }
                self.nick = nick;
                self.check_ready(directory, conn)
            }
            ClientMessage::User { ident, gecos } => {
                self.ident = ident;
                self.gecos = gecos;
                self.check_ready(directory, conn)
            }
            ClientMessage::Invalid { command, .. } => {
                conn.send(&ServerMessage::NeedMoreParams {
                    to: "*".to_string(),
                    command,
                });
                Transition::Pending
            }
            ClientMessage::Generic(GenericMessage { command, args }) if command == "PING" => {
                conn.send(&ServerMessage::Pong {
                    token: args.into_iter().next().unwrap_or_default(),
                });
                Transition::Pending
            }
            ClientMessage::Generic(GenericMessage { command, args }) if command == "QUIT" => {
                Transition::Quit(args.into_iter().next().unwrap_or_default())
            }
            other => {
                tracing::debug!(conn = %self.conn, "Unregistered client sent {other}");
                conn.send(&ServerMessage::NotRegistered);
                Transition::Pending
            }
        }
    }

    fn check_ready(&mut self, directory: &mut dyn Directory, conn: &IrcConnection) -> Transition {
        if self.nick.is_empty() || self.ident.is_empty() || self.gecos.is_empty() {
            return Transition::Pending;
        }
        // Another registration may have claimed the nick since it was accepted.
        if self.nick_taken(directory, &self.nick) {
            conn.send(&ServerMessage::NickInUse {
                nick: std::mem::take(&mut self.nick),
            });
            return Transition::Pending;
        }

        let candidate = Client {
            nick: self.nick.clone(),
            ident: self.ident.clone(),
            host: self.host.clone(),
            gecos: self.gecos.clone(),
            subnet: self.subnet,
        };
        let client = match directory.attach_client(candidate) {
            Ok(client) => client,
            Err(e) => {
                tracing::error!(conn = %self.conn, nick = %self.nick, "Error during attach: {e}");
                return Transition::Pending;
            }
        };

        tracing::info!(conn = %self.conn, nick = %self.nick, host = %self.host, "Client registered");
        for msg in [
            ServerMessage::WelcomeBanner {
                nick: self.nick.clone(),
                ident: self.ident.clone(),
                host: self.host.clone(),
            },
            ServerMessage::WelcomeHost {
                nick: self.nick.clone(),
            },
            ServerMessage::WelcomeCreated {
                nick: self.nick.clone(),
            },
            ServerMessage::WelcomeSupportedModes {
                nick: self.nick.clone(),
            },
        ] {
            conn.send(&msg);
        }
        Transition::Registered(client)
    }
}
