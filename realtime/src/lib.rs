//! Realtime publish/subscribe client
//!
//! This crate drives the protocol logic of realtime-proto on tokio. It owns the background task
//! that opens transports, answers credential requests, fires timers and delivers events, leaving
//! the application with cheap handles: [`Realtime`] for the connection, [`Channels`] and
//! [`Channel`] for named channels and [`Presence`] for a channel's member set.
//!
//! The entry point of this crate is [`Realtime::new`].
//!
//! # Connections and channels
//!
//! A client keeps at most one connection to the service. The connection survives transport loss:
//! it reconnects on its own, first to the primary host and then to fallback hosts, and resumes
//! the previous session where the server allows it. Messages published while disconnected are
//! queued and sent once connected; every publish resolves exactly once, when the server
//! acknowledges or rejects it, or when the connection can no longer deliver it.
//!
//! Channels are attached on demand and re-attached after a reconnect. Listeners registered on a
//! handle run through a [`Dispatch`] context, never while the client state is locked, so they may
//! call back into the client.
//!
//! # Transports
//!
//! No networking is built in. A [`Connector`] opens [`AsyncTransport`]s that carry whole frames,
//! for example over a websocket; frames hold JSON-encoded protocol messages. A
//! [`CredentialProvider`] supplies tokens for connecting and for renewal.
#![warn(missing_docs)]
#![warn(unreachable_pub)]
#![warn(clippy::use_self)]

mod channel;
mod connection;
mod emitter;
mod mutex;
mod runtime;

pub use proto::{
    error::codes, AuthFailure, ChannelOptions, ChannelState, ChannelStateChange, ClientConfig,
    ConfigError, ConnectRequest, ConnectionState, ConnectionStateChange, Credential, Error,
    ErrorInfo, Flags, Message, OpId, PresenceAction, PresenceMessage, TransportId,
};

pub use crate::channel::{Channel, Channels, Presence};
pub use crate::connection::{Completion, Realtime};
pub use crate::emitter::{Dispatch, Inline, Job, ListenerId, TokioDispatcher};
pub use crate::runtime::{AsyncTransport, BoxFuture, Connector, CredentialProvider, StaticToken};
