use std::{fmt, time::Duration};

use crate::error::ErrorInfo;

/// Lifecycle state of the connection
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Default)]
pub enum ConnectionState {
    /// `connect` has not been called yet
    #[default]
    Initialized,
    /// A transport attempt is in progress
    Connecting,
    /// The server accepted the connection
    Connected,
    /// The transport was lost; another attempt follows shortly
    Disconnected,
    /// The retry budget ran out or server state expired; attempts continue at a lower rate
    Suspended,
    /// `close` was called and the server has not confirmed yet
    Closing,
    /// Closed on request; `connect` starts over
    Closed,
    /// A non-recoverable error occurred; `connect` starts over
    Failed,
}

impl ConnectionState {
    /// Whether the connection will not make progress without an explicit `connect`
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Closed | Self::Failed)
    }

    /// Whether operations submitted now can eventually be sent without further user action
    pub(crate) fn accepts_work(self) -> bool {
        !matches!(self, Self::Closing | Self::Closed | Self::Failed)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// A transition of the connection state
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionStateChange {
    pub previous: ConnectionState,
    pub current: ConnectionState,
    /// Error that caused the transition, if any
    pub reason: Option<ErrorInfo>,
    /// Delay until the next automatic attempt, for Disconnected and Suspended
    pub retry_in: Option<Duration>,
}
