//! Outgoing IRC lines.
//!
//! Every line the server emits is a [`ServerMessage`] variant, rendered by
//! [`ServerMessage::to_irc`] into exactly one CRLF-terminated line. Rendering
//! depends only on the message and the [`ServerInfo`] passed in.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};

use crate::directory::Membership;
use crate::irc;
use crate::modes::MemberMode;

/// Version string advertised in the registration burst.
pub const VERSION: &str = "gossamer-dev";

/// Names replies are flushed once their nicknames exceed this many bytes.
pub const NAMES_CHUNK_THRESHOLD: usize = 300;

/// Server identity fields used when rendering.
#[derive(Debug, Clone)]
pub struct ServerInfo {
    pub server_name: String,
    pub network_name: String,
    pub created: DateTime<Utc>,
}

/// A client's full `nick!ident@host` mask.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Nih {
    pub nick: String,
    pub ident: String,
    pub host: String,
}

impl fmt::Display for Nih {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}!{}@{}", self.nick, self.ident, self.host)
    }
}

/// One entry of a names reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NameEntry {
    pub prefix: &'static str,
    pub nick: String,
}

/// The single-character rank prefix shown before a member's nickname.
pub fn rank_prefix(membership: &Membership) -> &'static str {
    match membership.highest() {
        Some(MemberMode::Owner) => "~",
        Some(MemberMode::Admin) => "&",
        Some(MemberMode::Op) => "@",
        Some(MemberMode::HalfOp) => "%",
        Some(MemberMode::Voice) => "+",
        None => "",
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerMessage {
    WelcomeBanner {
        nick: String,
        ident: String,
        host: String,
    },
    WelcomeHost {
        nick: String,
    },
    WelcomeCreated {
        nick: String,
    },
    WelcomeSupportedModes {
        nick: String,
    },
    WelcomeSupportedFeatures {
        nick: String,
        features: BTreeMap<String, String>,
    },
    PrivateMessage {
        from: Nih,
        to: String,
        message: String,
    },
    NickInUse {
        nick: String,
    },
    ErroneousNickname {
        nick: String,
    },
    Join {
        from: Nih,
        channel: String,
    },
    Topic {
        to: String,
        channel: String,
        topic: String,
    },
    TopicOrigin {
        to: String,
        channel: String,
        author: String,
        ts: u64,
    },
    NamesReply {
        to: String,
        channel: String,
        names: Vec<NameEntry>,
    },
    EndOfNames {
        to: String,
        channel: String,
    },
    ChannelMessage {
        from: Nih,
        channel: String,
        message: String,
    },
    Part {
        from: Nih,
        channel: String,
        message: String,
    },
    /// `from` is a full client mask or the server name.
    ChannelMode {
        from: String,
        channel: String,
        mode: String,
    },
    ChannelModeIs {
        to: String,
        channel: String,
        modes: String,
    },
    UserModeIs {
        to: String,
    },
    Pong {
        token: String,
    },
    Notice {
        to: String,
        text: String,
    },
    NoSuchNick {
        to: String,
        target: String,
    },
    NoSuchChannel {
        to: String,
        channel: String,
    },
    CannotSendToChannel {
        to: String,
        channel: String,
    },
    UnknownCommand {
        to: String,
        command: String,
    },
    NotRegistered,
    NeedMoreParams {
        to: String,
        command: String,
    },
    BadChannelMask {
        to: String,
        channel: String,
    },
    ChanOpPrivsNeeded {
        to: String,
        channel: String,
    },
}

impl ServerMessage {
    /// Render as one wire line, including the trailing CRLF.
    pub fn to_irc(&self, info: &ServerInfo) -> String {
        let server = &info.server_name;
        let mut line = match self {
            Self::WelcomeBanner { nick, ident, host } => format!(
                ":{server} {} {nick} :Welcome to the {} Internet Relay Chat network {nick}!{ident}@{host}",
                irc::RPL_WELCOME,
                info.network_name,
            ),
            Self::WelcomeHost { nick } => format!(
                ":{server} {} {nick} :Your host is {server}, running version {VERSION}",
                irc::RPL_YOURHOST,
            ),
            Self::WelcomeCreated { nick } => format!(
                ":{server} {} {nick} :This server was created {}",
                irc::RPL_CREATED,
                info.created.format("%a, %d %b %Y %H:%M:%S UTC"),
            ),
            Self::WelcomeSupportedModes { nick } => format!(
                ":{server} {} {nick} {server} {VERSION} CDFGNRSUWXabcdfgijklnopqrsuwxyz BIMNORSabcehiklmnopqstvz Iabehkloqv",
                irc::RPL_MYINFO,
            ),
            Self::WelcomeSupportedFeatures { nick, features } => {
                let list: Vec<String> = features
                    .iter()
                    .map(|(key, value)| {
                        if value.is_empty() {
                            key.to_ascii_uppercase()
                        } else {
                            format!("{}={value}", key.to_ascii_uppercase())
                        }
                    })
                    .collect();
                format!(
                    ":{server} {} {nick} {} :are supported by this server",
                    irc::RPL_ISUPPORT,
                    list.join(" "),
                )
            }
            Self::PrivateMessage { from, to, message } => {
                format!(":{from} PRIVMSG {to} :{message}")
            }
            Self::NickInUse { nick } => format!(
                ":{server} {} {nick} :Nickname is already in use",
                irc::ERR_NICKNAMEINUSE,
            ),
            Self::ErroneousNickname { nick } => format!(
                ":{server} {} * {nick} :Erroneous nickname",
                irc::ERR_ERRONEUSNICKNAME,
            ),
            Self::Join { from, channel } => format!(":{from} JOIN {channel}"),
            Self::Topic { to, channel, topic } => {
                format!(":{server} {} {to} {channel} :{topic}", irc::RPL_TOPIC)
            }
            Self::TopicOrigin {
                to,
                channel,
                author,
                ts,
            } => format!(
                ":{server} {} {to} {channel} {author} {ts}",
                irc::RPL_TOPICWHOTIME,
            ),
            Self::NamesReply { to, channel, names } => {
                let names: Vec<String> = names
                    .iter()
                    .map(|entry| format!("{}{}", entry.prefix, entry.nick))
                    .collect();
                format!(
                    ":{server} {} {to} = {channel} :{}",
                    irc::RPL_NAMREPLY,
                    names.join(" "),
                )
            }
            Self::EndOfNames { to, channel } => format!(
                ":{server} {} {to} {channel} :End of /NAMES list",
                irc::RPL_ENDOFNAMES,
            ),
            Self::ChannelMessage {
                from,
                channel,
                message,
            } => format!(":{from} PRIVMSG {channel} :{message}"),
            Self::Part {
                from,
                channel,
                message,
            } => format!(":{from} PART {channel} :{message}"),
            Self::ChannelMode {
                from,
                channel,
                mode,
            } => format!(":{from} MODE {channel} {mode}"),
            Self::ChannelModeIs { to, channel, modes } => format!(
                ":{server} {} {to} {channel} {modes}",
                irc::RPL_CHANNELMODEIS,
            ),
            Self::UserModeIs { to } => format!(":{server} {} {to} +", irc::RPL_UMODEIS),
            Self::Pong { token } => format!(":{server} PONG {server} :{token}"),
            Self::Notice { to, text } => format!(":{server} NOTICE {to} :{text}"),
            Self::NoSuchNick { to, target } => format!(
                ":{server} {} {to} {target} :No such nick/channel",
                irc::ERR_NOSUCHNICK,
            ),
            Self::NoSuchChannel { to, channel } => format!(
                ":{server} {} {to} {channel} :No such channel",
                irc::ERR_NOSUCHCHANNEL,
            ),
            Self::CannotSendToChannel { to, channel } => format!(
                ":{server} {} {to} {channel} :Cannot send to channel",
                irc::ERR_CANNOTSENDTOCHAN,
            ),
            Self::UnknownCommand { to, command } => format!(
                ":{server} {} {to} {command} :Unknown command",
                irc::ERR_UNKNOWNCOMMAND,
            ),
            Self::NotRegistered => format!(
                ":{server} {} * :You have not registered",
                irc::ERR_NOTREGISTERED,
            ),
            Self::NeedMoreParams { to, command } => format!(
                ":{server} {} {to} {command} :Not enough parameters",
                irc::ERR_NEEDMOREPARAMS,
            ),
            Self::BadChannelMask { to, channel } => format!(
                ":{server} {} {to} {channel} :Bad Channel Mask",
                irc::ERR_BADCHANMASK,
            ),
            Self::ChanOpPrivsNeeded { to, channel } => format!(
                ":{server} {} {to} {channel} :You're not channel operator",
                irc::ERR_CHANOPRIVSNEEDED,
            ),
        };
        line.push_str("\r\n");
        line
    }
}

/// Split a membership list into as many names replies as needed.
///
/// Entries accumulate into the current reply; once the nicknames gathered
/// so far exceed [`NAMES_CHUNK_THRESHOLD`] bytes the reply is flushed and a
/// new one started.
pub fn names_replies<I>(to: &str, channel: &str, entries: I) -> Vec<ServerMessage>
where
    I: IntoIterator<Item = NameEntry>,
{
    let mut replies = Vec::new();
    let mut names = Vec::new();
    let mut total = 0;

    for entry in entries {
        total += entry.nick.len();
        names.push(entry);
        if total > NAMES_CHUNK_THRESHOLD {
            total = 0;
            replies.push(ServerMessage::NamesReply {
                to: to.to_string(),
                channel: channel.to_string(),
                names: std::mem::take(&mut names),
            });
        }
    }
    if !names.is_empty() {
        replies.push(ServerMessage::NamesReply {
            to: to.to_string(),
            channel: channel.to_string(),
            names,
        });
    }
    replies
}
