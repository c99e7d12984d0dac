use std::fmt;

use crate::error::ErrorInfo;

/// Lifecycle state of a channel
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Default)]
pub enum ChannelState {
    #[default]
    Initialized,
    Attaching,
    Attached,
    Detaching,
    Detached,
    /// Attachment lost; re-attached automatically
    Suspended,
    Failed,
}

impl ChannelState {
    /// Whether the channel holds or is acquiring a server-side attachment
    pub(crate) fn is_active(self) -> bool {
        matches!(
            self,
            Self::Attaching | Self::Attached | Self::Detaching | Self::Suspended
        )
    }
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// A transition of a channel's state
///
/// `previous == current` marks an update without a transition, e.g. an ATTACHED that lost
/// continuity while already attached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelStateChange {
    pub previous: ChannelState,
    pub current: ChannelState,
    pub reason: Option<ErrorInfo>,
    /// Whether message continuity was preserved across the last attachment
    pub resumed: bool,
}
