//! Wire-level protocol message model
//!
//! Field names follow the JSON encoding used by the service (`camelCase`, absent fields
//! omitted). Payload bodies are carried as opaque JSON values; interpreting them is left to the
//! application.

use std::{collections::BTreeMap, fmt, ops};

use serde::{Deserialize, Serialize};

use crate::error::ErrorInfo;

/// Protocol message action codes
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
#[repr(u8)]
pub enum Action {
    #[default]
    Heartbeat = 0,
    Ack = 1,
    Nack = 2,
    Connect = 3,
    Connected = 4,
    Disconnect = 5,
    Disconnected = 6,
    Close = 7,
    Closed = 8,
    Error = 9,
    Attach = 10,
    Attached = 11,
    Detach = 12,
    Detached = 13,
    Presence = 14,
    Message = 15,
    Sync = 16,
    Auth = 17,
}

impl TryFrom<u8> for Action {
    type Error = UnknownAction;

    fn try_from(x: u8) -> Result<Self, UnknownAction> {
        use Action::*;
        Ok(match x {
            0 => Heartbeat,
            1 => Ack,
            2 => Nack,
            3 => Connect,
            4 => Connected,
            5 => Disconnect,
            6 => Disconnected,
            7 => Close,
            8 => Closed,
            9 => Error,
            10 => Attach,
            11 => Attached,
            12 => Detach,
            13 => Detached,
            14 => Presence,
            15 => Message,
            16 => Sync,
            17 => Auth,
            _ => return Err(UnknownAction(x)),
        })
    }
}

impl From<Action> for u8 {
    fn from(x: Action) -> Self {
        x as Self
    }
}

/// An action code outside the known range
#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
#[error("unknown protocol action {0}")]
pub struct UnknownAction(pub u8);

/// Bitset carried in `ProtocolMessage::flags`
#[derive(Copy, Clone, Eq, PartialEq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Flags(pub u32);

impl Flags {
    /// The channel has presence members; a SYNC follows
    pub const HAS_PRESENCE: Self = Self(1 << 0);
    /// The attach has backlog messages pending
    pub const HAS_BACKLOG: Self = Self(1 << 1);
    /// The connection or channel continuity was preserved
    pub const RESUMED: Self = Self(1 << 2);
    /// The attach requests continuity from the held channel serial
    pub const ATTACH_RESUME: Self = Self(1 << 5);
    /// Mode: may enter presence
    pub const PRESENCE: Self = Self(1 << 16);
    /// Mode: may publish
    pub const PUBLISH: Self = Self(1 << 17);
    /// Mode: receives messages
    pub const SUBSCRIBE: Self = Self(1 << 18);
    /// Mode: receives presence events
    pub const PRESENCE_SUBSCRIBE: Self = Self(1 << 19);

    /// Mask of the mode bits
    pub const MODES: Self = Self(
        Self::PRESENCE.0 | Self::PUBLISH.0 | Self::SUBSCRIBE.0 | Self::PRESENCE_SUBSCRIBE.0,
    );

    /// The empty set
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Whether every bit of `other` is set
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Whether no bit is set
    pub const fn is_empty(&self) -> bool {
        self.0 == 0
    }

    /// Set every bit of `other`
    pub fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }

    /// Clear every bit of `other`
    pub fn remove(&mut self, other: Self) {
        self.0 &= !other.0;
    }
}

impl ops::BitOr for Flags {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl ops::BitAnd for Flags {
    type Output = Self;
    fn bitand(self, rhs: Self) -> Self {
        Self(self.0 & rhs.0)
    }
}

impl fmt::Debug for Flags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Flags({:#x})", self.0)
    }
}

/// Unit of exchange between client and server
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ProtocolMessage {
    pub action: Action,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel_serial: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connection_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connection_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connection_serial: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub msg_serial: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub count: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
    #[serde(skip_serializing_if = "Flags::is_empty")]
    pub flags: Flags,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connection_details: Option<ConnectionDetails>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub messages: Vec<Message>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub presence: Vec<PresenceMessage>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub params: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth: Option<AuthDetails>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<u64>,
}

impl ProtocolMessage {
    /// A bare message carrying only `action`
    pub fn new(action: Action) -> Self {
        Self {
            action,
            ..Self::default()
        }
    }

    /// A bare message addressed to `channel`
    pub fn for_channel(action: Action, channel: &str) -> Self {
        Self {
            action,
            channel: Some(channel.to_owned()),
            ..Self::default()
        }
    }

    /// Whether the message carries `flag`
    pub fn has_flag(&self, flag: Flags) -> bool {
        self.flags.contains(flag)
    }

    /// Whether the server must acknowledge the message by serial
    pub(crate) fn ack_required(&self) -> bool {
        matches!(self.action, Action::Message | Action::Presence)
    }
}

/// Connection parameters announced by the server on CONNECTED
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ConnectionDetails {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connection_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_message_size: Option<usize>,
    /// Milliseconds
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connection_state_ttl: Option<u64>,
    /// Milliseconds
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_idle_interval: Option<u64>,
}

/// Credential carried by an AUTH message
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthDetails {
    pub access_token: String,
}

/// A published or received application message
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Message {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connection_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub encoding: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extras: Option<serde_json::Value>,
}

impl Message {
    /// A message with a name and a payload
    pub fn new(name: impl Into<String>, data: impl Into<serde_json::Value>) -> Self {
        Self {
            name: Some(name.into()),
            data: Some(data.into()),
            ..Self::default()
        }
    }

    /// Bytes counted against the connection's maximum message size
    pub fn size(&self) -> usize {
        let data = match &self.data {
            None => 0,
            Some(serde_json::Value::String(s)) => s.len(),
            Some(value) => value.to_string().len(),
        };
        let extras = self.extras.as_ref().map_or(0, |x| x.to_string().len());
        data + extras
            + self.name.as_ref().map_or(0, String::len)
            + self.client_id.as_ref().map_or(0, String::len)
    }
}

/// Presence message actions
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
#[repr(u8)]
pub enum PresenceAction {
    /// Member removed during a sync; never exposed
    #[default]
    Absent = 0,
    Present = 1,
    Enter = 2,
    Leave = 3,
    Update = 4,
}

impl TryFrom<u8> for PresenceAction {
    type Error = UnknownAction;

    fn try_from(x: u8) -> Result<Self, UnknownAction> {
        use PresenceAction::*;
        Ok(match x {
            0 => Absent,
            1 => Present,
            2 => Enter,
            3 => Leave,
            4 => Update,
            _ => return Err(UnknownAction(x)),
        })
    }
}

impl From<PresenceAction> for u8 {
    fn from(x: PresenceAction) -> Self {
        x as Self
    }
}

/// A presence event for one member of a channel
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PresenceMessage {
    pub action: PresenceAction,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub client_id: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub connection_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub encoding: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<u64>,
}

impl PresenceMessage {
    /// Identity of the member this message refers to
    pub fn member_key(&self) -> String {
        format!("{}:{}", self.connection_id, self.client_id)
    }

    /// `(msg_serial, index)` parsed from an id of the form `connId:msgSerial:index`
    pub(crate) fn serial_parts(&self) -> Option<(u64, u64)> {
        let id = self.id.as_deref()?;
        let mut parts = id.rsplitn(3, ':');
        let index = parts.next()?.parse().ok()?;
        let serial = parts.next()?.parse().ok()?;
        let conn = parts.next()?;
        (conn == self.connection_id).then_some((serial, index))
    }

    /// Whether this message supersedes `existing` for the same member
    pub(crate) fn is_newer_than(&self, existing: &Self) -> bool {
        if let (Some(a), Some(b)) = (self.serial_parts(), existing.serial_parts()) {
            return a > b;
        }
        match (self.timestamp, existing.timestamp) {
            (Some(a), Some(b)) => a >= b,
            _ => true,
        }
    }
}
