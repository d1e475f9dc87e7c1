use std::{borrow::Cow, fmt, str::FromStr};

use serde::Serialize;

use crate::errors::Error;

/// Caller handle as reported by the chat transport (e.g. `@alice:matrix.org`).
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct Identity(pub String);

impl Identity {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Room / channel id.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct RoomId(pub String);

impl RoomId {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Permission tag. `all` grants every other permission.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct Permission(Cow<'static, str>);

impl Permission {
    pub const ALL: Permission = Permission(Cow::Borrowed("all"));
    pub const READ: Permission = Permission(Cow::Borrowed("read"));
    pub const WRITE: Permission = Permission(Cow::Borrowed("write"));
    pub const SEARCH: Permission = Permission(Cow::Borrowed("search"));
    pub const HELP: Permission = Permission(Cow::Borrowed("help"));

    /// Parse a tag from configuration. Tags are lowercase ascii letters and `_`.
    pub fn parse(raw: &str) -> Option<Self> {
        let tag = raw.trim().to_ascii_lowercase();
        if tag.is_empty() || !tag.chars().all(|c| c.is_ascii_lowercase() || c == '_') {
            return None;
        }
        Some(Self(Cow::Owned(tag)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_all(&self) -> bool {
        self.as_str() == "all"
    }
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Fixed role set, ordered from most to least privileged.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Admin,
    Moderator,
    User,
    Guest,
}

impl Role {
    pub const ALL: [Role; 4] = [Role::Admin, Role::Moderator, Role::User, Role::Guest];

    pub fn as_str(self) -> &'static str {
        match self {
            Role::Admin => "admin",
            Role::Moderator => "moderator",
            Role::User => "user",
            Role::Guest => "guest",
        }
    }

    pub fn permissions(self) -> &'static [Permission] {
        const ADMIN: &[Permission] = &[Permission::ALL];
        const MODERATOR: &[Permission] = &[
            Permission::READ,
            Permission::WRITE,
            Permission::SEARCH,
            Permission::HELP,
        ];
        const USER: &[Permission] = &[Permission::READ, Permission::HELP];
        const GUEST: &[Permission] = &[Permission::HELP];

        match self {
            Role::Admin => ADMIN,
            Role::Moderator => MODERATOR,
            Role::User => USER,
            Role::Guest => GUEST,
        }
    }

    pub fn grants(self, permission: &Permission) -> bool {
        self.permissions()
            .iter()
            .any(|p| p.is_all() || p == permission)
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "admin" => Ok(Role::Admin),
            "moderator" => Ok(Role::Moderator),
            "user" => Ok(Role::User),
            "guest" => Ok(Role::Guest),
            other => Err(Error::Config(format!("unknown role: {other}"))),
        }
    }
}

/// Inbound command record produced by the transport layer.
#[derive(Clone, Debug)]
pub struct IncomingCommand {
    pub identity: Identity,
    pub room_id: RoomId,
    pub action: String,
    pub args: Vec<String>,
    pub raw_text: Option<String>,
}

impl IncomingCommand {
    /// Build a command from a raw chat line, if it starts with `prefix`.
    pub fn from_text(identity: Identity, room_id: RoomId, text: &str, prefix: &str) -> Option<Self> {
        let (action, args) = parse_command(text, prefix)?;
        Some(Self {
            identity,
            room_id,
            action,
            args,
            raw_text: Some(text.to_string()),
        })
    }
}

/// Split `!ask what is rust` into (`ask`, [`what`, `is`, `rust`]).
///
/// Returns `None` when the text does not carry the prefix or names no action.
pub fn parse_command(text: &str, prefix: &str) -> Option<(String, Vec<String>)> {
    let rest = text.trim_start().strip_prefix(prefix)?;
    let mut words = rest.split_whitespace();
    let action = words.next()?.to_lowercase();
    let args = words.map(str::to_string).collect();
    Some((action, args))
}
