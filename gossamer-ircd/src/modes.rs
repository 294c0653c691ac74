//! Channel mode strings: parsing client requests into deltas and rendering
//! applied deltas back into wire form.

use crate::directory::ClientId;

/// Flag modes a channel can carry (type D, never take a parameter).
pub const CHANNEL_FLAGS: &str = "imnpst";

/// Per-channel flag modes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChannelModes {
    flags: Vec<char>,
}

impl ChannelModes {
    pub fn has(&self, flag: char) -> bool {
        self.flags.contains(&flag)
    }

    /// Apply a delta, returning the part of it that actually changed state.
    pub fn apply(&mut self, delta: &ChannelModeDelta) -> ChannelModeDelta {
        let mut applied = ChannelModeDelta::default();
        for &flag in &delta.added {
            if !self.has(flag) {
                self.flags.push(flag);
                applied.added.push(flag);
            }
        }
        for &flag in &delta.removed {
            if self.has(flag) {
                self.flags.retain(|f| *f != flag);
                applied.removed.push(flag);
            }
        }
        self.flags.sort_unstable();
        applied
    }

    /// Render as "+nt", or "+" when no flag is set.
    pub fn to_mode_string(&self) -> String {
        let mut out = String::from("+");
        out.extend(self.flags.iter());
        out
    }
}

/// Flag changes requested or applied on a channel.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChannelModeDelta {
    pub added: Vec<char>,
    pub removed: Vec<char>,
}

impl ChannelModeDelta {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

/// Membership ranks, lowest to highest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum MemberMode {
    Voice,
    HalfOp,
    Op,
    Admin,
    Owner,
}

impl MemberMode {
    pub fn from_char(c: char) -> Option<Self> {
        match c {
            'v' => Some(Self::Voice),
            'h' => Some(Self::HalfOp),
            'o' => Some(Self::Op),
            'a' => Some(Self::Admin),
            'q' => Some(Self::Owner),
            _ => None,
        }
    }

    pub fn mode_char(self) -> char {
        match self {
            Self::Voice => 'v',
            Self::HalfOp => 'h',
            Self::Op => 'o',
            Self::Admin => 'a',
            Self::Owner => 'q',
        }
    }
}

/// A rank granted to or taken from one member.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberModeDelta {
    pub target: ClientId,
    pub mode: MemberMode,
    pub setting: bool,
}

/// Parse a channel mode string such as `+nt-i` or `+ov alice bob`.
///
/// Member modes consume one argument each, resolved through `resolve`.
/// Unknown characters, unresolvable members and member modes lacking an
/// argument are skipped.
pub fn parse_channel_mode_string<F>(
    mode: &str,
    args: &[String],
    mut resolve: F,
) -> (ChannelModeDelta, Vec<MemberModeDelta>)
where
    F: FnMut(&str) -> Option<ClientId>,
{
    let mut delta = ChannelModeDelta::default();
    let mut members = Vec::new();
    let mut setting = true;
    let mut args = args.iter();

    for c in mode.chars() {
        match c {
            '+' => setting = true,
            '-' => setting = false,
            c if CHANNEL_FLAGS.contains(c) => {
                let (set, other) = if setting {
                    (&mut delta.added, &mut delta.removed)
                } else {
                    (&mut delta.removed, &mut delta.added)
                };
                other.retain(|f| *f != c);
                if !set.contains(&c) {
                    set.push(c);
                }
            }
            c => {
                let Some(member_mode) = MemberMode::from_char(c) else {
                    continue;
                };
                let Some(name) = args.next() else {
                    continue;
                };
                if let Some(target) = resolve(name) {
                    members.push(MemberModeDelta {
                        target,
                        mode: member_mode,
                        setting,
                    });
                }
            }
        }
    }

    (delta, members)
}

/// Render an applied change as a single mode string with its arguments,
/// e.g. `+nt-i+o alice`.
pub fn stringify_channel_modes<F>(
    delta: &ChannelModeDelta,
    members: &[MemberModeDelta],
    mut name_of: F,
) -> String
where
    F: FnMut(ClientId) -> String,
{
    let mut modes = String::new();
    let mut args = Vec::new();
    let mut current: Option<bool> = None;

    let mut push = |setting: bool, c: char, modes: &mut String| {
        if current != Some(setting) {
            modes.push(if setting { '+' } else { '-' });
            current = Some(setting);
        }
        modes.push(c);
    };

    for &flag in &delta.added {
        push(true, flag, &mut modes);
    }
    for &flag in &delta.removed {
        push(false, flag, &mut modes);
    }
    for member in members {
        push(member.setting, member.mode.mode_char(), &mut modes);
        args.push(name_of(member.target));
    }

    if args.is_empty() {
        modes
    } else {
        format!("{modes} {}", args.join(" "))
    }
}
