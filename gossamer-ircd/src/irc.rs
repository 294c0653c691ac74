//! IRC line parsing and client-intent interpretation.
//!
//! Parsing happens in two stages. [`parse_line`] splits a raw line into a
//! [`GenericMessage`] (command + positional arguments, honoring the trailing
//! parameter convention). [`interpret`] then turns that into a typed
//! [`ClientMessage`], enforcing per-command minimum argument counts.

use std::fmt;

/// A command and its ordered arguments, as received on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenericMessage {
    /// The uppercased command (e.g. "NICK", "PRIVMSG").
    pub command: String,
    /// Positional arguments; the last one may be a trailing parameter.
    pub args: Vec<String>,
}

/// Everything a client can ask of the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientMessage {
    Nick {
        nick: String,
    },
    User {
        ident: String,
        gecos: String,
    },
    PrivateMessage {
        to: String,
        message: String,
    },
    ChannelMessage {
        to: String,
        message: String,
    },
    Connect {
        target: String,
        host: String,
        port: u16,
    },
    /// `keys` is split from the *target* field when a second argument is
    /// present, not from the second argument itself.
    Join {
        targets: Vec<String>,
        keys: Vec<String>,
    },
    ChannelModeChange {
        target: String,
        mode: String,
        args: Vec<String>,
    },
    /// A known command that failed validation.
    Invalid {
        command: String,
        min_args: usize,
        error: Option<String>,
    },
    /// Anything not interpreted above, passed through untouched.
    Generic(GenericMessage),
}

/// Parse a raw IRC line (without its line terminator).
///
/// Returns `None` when the line carries no command.
pub fn parse_line(line: &str) -> Option<GenericMessage> {
    let line = line.trim_end_matches(['\r', '\n']);
    let (command, mut rest) = match line.split_once(' ') {
        Some((command, rest)) => (command, rest),
        None => (line, ""),
    };
    if command.is_empty() {
        return None;
    }

    let mut args = Vec::new();
    while !rest.is_empty() {
        if let Some(trailing) = rest.strip_prefix(':') {
            args.push(trailing.to_string());
            break;
        }
        let (token, remainder) = rest.split_once(' ').unwrap_or((rest, ""));
        if !token.is_empty() {
            args.push(token.to_string());
        }
        rest = remainder;
    }

    Some(GenericMessage {
        command: command.to_ascii_uppercase(),
        args,
    })
}

fn require(msg: &GenericMessage, min_args: usize) -> Result<(), ClientMessage> {
    if msg.args.len() < min_args {
        return Err(ClientMessage::Invalid {
            command: msg.command.clone(),
            min_args,
            error: None,
        });
    }
    Ok(())
}

fn split_list(field: &str) -> Vec<String> {
    field.split(',').map(str::to_string).collect()
}

/// Map a generic message onto the typed client-intent it represents.
pub fn interpret(msg: GenericMessage) -> ClientMessage {
    match interpret_known(&msg) {
        Ok(Some(typed)) => typed,
        Ok(None) => ClientMessage::Generic(msg),
        Err(invalid) => invalid,
    }
}

fn interpret_known(msg: &GenericMessage) -> Result<Option<ClientMessage>, ClientMessage> {
    let args = &msg.args;
    let typed = match msg.command.as_str() {
        "NICK" => {
            require(msg, 1)?;
            ClientMessage::Nick {
                nick: args[0].clone(),
            }
        }
        "USER" => {
            require(msg, 4)?;
            ClientMessage::User {
                ident: args[0].clone(),
                gecos: args[3].clone(),
            }
        }
        "PRIVMSG" => {
            require(msg, 2)?;
            let (to, message) = (args[0].clone(), args[1].clone());
            if to.starts_with('#') {
                ClientMessage::ChannelMessage { to, message }
            } else {
                ClientMessage::PrivateMessage { to, message }
            }
        }
        "CONNECT" => {
            require(msg, 3)?;
            let port = args[2].parse::<u16>().map_err(|_| ClientMessage::Invalid {
                command: msg.command.clone(),
                min_args: 3,
                error: Some(format!("Bad port: {}", args[2])),
            })?;
            ClientMessage::Connect {
                target: args[0].clone(),
                host: args[1].clone(),
                port,
            }
        }
        "JOIN" => {
            require(msg, 1)?;
            let keys = if args.len() > 1 {
                split_list(&args[0])
            } else {
                Vec::new()
            };
            ClientMessage::Join {
                targets: split_list(&args[0]),
                keys,
            }
        }
        "MODE" => {
            require(msg, 1)?;
            if !args[0].starts_with('#') || args.len() == 1 {
                return Ok(None);
            }
            ClientMessage::ChannelModeChange {
                target: args[0].clone(),
                mode: args[1].clone(),
                args: args[2..].to_vec(),
            }
        }
        _ => return Ok(None),
    };
    Ok(Some(typed))
}

impl fmt::Display for GenericMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "irc({}, [{}])", self.command, self.args.join(", "))
    }
}

impl fmt::Display for ClientMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Nick { nick } => write!(f, "nick({nick})"),
            Self::User { ident, gecos } => write!(f, "user({ident}, {gecos})"),
            Self::PrivateMessage { to, message } => write!(f, "pm({to}, {message})"),
            Self::ChannelMessage { to, message } => write!(f, "chanmsg({to}, {message})"),
            Self::Connect { target, host, port } => write!(f, "connect({target}, {host}:{port})"),
            Self::Join { targets, keys } => {
                write!(f, "join([{}], [{}])", targets.join(", "), keys.join(", "))
            }
            Self::ChannelModeChange { target, mode, args } => {
                write!(f, "chmode({target}, {mode}, [{}])", args.join(", "))
            }
            Self::Invalid {
                command, min_args, ..
            } => write!(f, "invalid({command}, {min_args})"),
            Self::Generic(generic) => generic.fmt(f),
        }
    }
}

/// Longest nickname accepted at registration.
pub const MAX_NICK_LEN: usize = 30;

/// Whether `nick` can appear in a `nick!ident@host` mask and in a
/// `subnet:nick` reference without breaking either.
pub fn is_valid_nick(nick: &str) -> bool {
    let Some(first) = nick.chars().next() else {
        return false;
    };
    nick.len() <= MAX_NICK_LEN
        && !first.is_ascii_digit()
        && first != '-'
        && nick
            .chars()
            .all(|c| !c.is_whitespace() && !c.is_control() && !",:!@#*?&~%+".contains(c))
}

// Registration burst
pub const RPL_WELCOME: &str = "001";
pub const RPL_YOURHOST: &str = "002";
pub const RPL_CREATED: &str = "003";
pub const RPL_MYINFO: &str = "004";
pub const RPL_ISUPPORT: &str = "005";

pub const RPL_UMODEIS: &str = "221";
pub const RPL_CHANNELMODEIS: &str = "324";

// Join burst
pub const RPL_TOPIC: &str = "332";
pub const RPL_TOPICWHOTIME: &str = "333";
pub const RPL_NAMREPLY: &str = "353";
pub const RPL_ENDOFNAMES: &str = "366";

// Errors
pub const ERR_NOSUCHNICK: &str = "401";
pub const ERR_NOSUCHCHANNEL: &str = "403";
pub const ERR_CANNOTSENDTOCHAN: &str = "404";
pub const ERR_UNKNOWNCOMMAND: &str = "421";
pub const ERR_ERRONEUSNICKNAME: &str = "432";
pub const ERR_NICKNAMEINUSE: &str = "433";
pub const ERR_NOTREGISTERED: &str = "451";
pub const ERR_NEEDMOREPARAMS: &str = "461";
pub const ERR_BADCHANMASK: &str = "476";
pub const ERR_CHANOPRIVSNEEDED: &str = "482";
