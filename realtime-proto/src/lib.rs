//! Sans-I/O protocol logic for a realtime publish/subscribe client
//!
//! realtime-proto contains a fully deterministic implementation of the client side of a realtime
//! messaging protocol: connection and channel lifecycles, the acknowledged message queue, reconnect
//! and fallback-host policy, and presence synchronization. It contains no networking code and
//! never reads the clock; every entry point takes the current `Instant`. Most users will want the
//! tokio-based `realtime` crate instead.
//!
//! The central type is [`Connection`]. Its owner feeds it transport events, credentials and timer
//! expirations, and drains [`Transmit`]s (I/O to perform) and [`Event`]s (state changes, received
//! messages and operation outcomes) from it. Operations such as [`Connection::publish`] return an
//! [`OpId`] that is later reported exactly once in an [`Event::Completed`].

#![cfg_attr(test, allow(dead_code))]

mod auth;
pub use crate::auth::{AuthFailure, Credential};

mod channel;
pub use crate::channel::{ChannelState, ChannelStateChange};

mod codec;
pub use crate::codec::{Codec, CodecError, JsonCodec};

mod config;
pub use crate::config::{ChannelOptions, ClientConfig, ConfigError};

mod connection;
pub use crate::connection::{
    ConnectRequest, Connection, ConnectionState, ConnectionStateChange, Event, Transmit,
};

pub mod error;
pub use crate::error::{Error, ErrorInfo};

mod presence;

pub mod protocol;
pub use crate::protocol::{
    Action, Flags, Message, PresenceAction, PresenceMessage, ProtocolMessage,
};

mod queue;

mod recovery;
pub use crate::recovery::RecoveryKey;

mod retry;

#[cfg(test)]
mod tests;

/// Identifies an operation whose outcome is reported through [`Event::Completed`]
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct OpId(pub u64);

/// Identifies one transport opened on behalf of a [`Connection`]
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct TransportId(pub u64);

#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub(crate) struct ChannelId(pub(crate) u64);
