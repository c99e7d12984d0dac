use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::auth::AuthFailure;

/// Error details as carried on the wire and attached to every terminal failure
#[derive(Debug, Error, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[error("{message} (code {code}, status {status_code})")]
pub struct ErrorInfo {
    /// Upstream error code for programmatic matching
    pub code: u32,
    /// HTTP-like status; 0 when the server did not provide one
    #[serde(default)]
    pub status_code: u16,
    /// Human-readable description
    #[serde(default)]
    pub message: String,
}

impl ErrorInfo {
    /// Construct error details
    pub fn new(code: u32, status_code: u16, message: impl Into<String>) -> Self {
        Self {
            code,
            status_code,
            message: message.into(),
        }
    }

    /// Whether the server rejected the credential used for the request
    pub fn is_token_error(&self) -> bool {
        (codes::TOKEN_ERROR_MIN..=codes::TOKEN_ERROR_MAX).contains(&self.code)
    }

    /// Whether the failure is attributed to the client and will recur on retry
    pub fn is_client_fault(&self) -> bool {
        (400..500).contains(&self.status_code)
    }

    /// Whether the failure is attributed to the server and may clear on another host
    pub fn is_server_fault(&self) -> bool {
        self.status_code >= 500
    }
}

/// Error codes used by the client and the server
pub mod codes {
    /// Malformed request
    pub const BAD_REQUEST: u32 = 40000;
    /// Message exceeds the negotiated maximum size
    pub const MAX_MESSAGE_SIZE_EXCEEDED: u32 = 40009;
    /// Presence operation without a client id
    pub const CLIENT_ID_REQUIRED: u32 = 40012;
    /// Credential rejected
    pub const INVALID_CREDENTIAL: u32 = 40101;
    /// First code of the token error range
    pub const TOKEN_ERROR_MIN: u32 = 40140;
    /// Token expired
    pub const TOKEN_EXPIRED: u32 = 40142;
    /// Last code of the token error range
    pub const TOKEN_ERROR_MAX: u32 = 40149;
    /// Operation not permitted for this credential
    pub const PERMISSION_DENIED: u32 = 40160;
    /// Internal failure
    pub const INTERNAL: u32 = 50000;
    /// Request timed out
    pub const TIMEOUT: u32 = 50003;
    /// Connection attempt failed
    pub const CONNECTION_FAILED: u32 = 80000;
    /// Connection suspended
    pub const CONNECTION_SUSPENDED: u32 = 80002;
    /// Connection disconnected
    pub const DISCONNECTED: u32 = 80003;
    /// Connection could not be resumed
    pub const UNABLE_TO_RECOVER: u32 = 80008;
    /// Peer broke the protocol
    pub const PROTOCOL_ERROR: u32 = 80013;
    /// Connection timed out
    pub const CONNECTION_TIMED_OUT: u32 = 80014;
    /// Connection closed
    pub const CONNECTION_CLOSED: u32 = 80017;
    /// Credential provider failed
    pub const CLIENT_AUTH_FAILED: u32 = 80019;
    /// Generic channel operation failure
    pub const CHANNEL_OPERATION_FAILED: u32 = 90000;
    /// Channel is not in a state that permits the operation
    pub const CHANNEL_NOT_ACTIVE: u32 = 90001;
    /// Channel attach timed out
    pub const ATTACH_TIMEOUT: u32 = 90007;
    /// Channel detach timed out
    pub const DETACH_TIMEOUT: u32 = 90008;
}

/// Terminal outcome of a connection, channel or message operation
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    /// The transport failed or could not be opened
    #[error("transport failure: {0}")]
    Transport(ErrorInfo),
    /// The peer violated the message sequencing contract
    #[error("protocol violation: {0}")]
    ProtocolViolation(ErrorInfo),
    /// The credential was rejected or could not be obtained
    #[error("authentication failed: {0}")]
    Auth(ErrorInfo),
    /// The server refused the operation
    #[error("rejected by server: {0}")]
    Server(ErrorInfo),
    /// The operation was abandoned because its owner closed, detached or failed
    #[error("cancelled: {0}")]
    Cancelled(ErrorInfo),
    /// The message was sent on a connection that could not be resumed and must be re-published
    #[error("connection lost, not resumable: {0}")]
    NotResumable(ErrorInfo),
    /// The channel does not accept the operation in its current state
    #[error("channel not active: {0}")]
    ChannelInactive(ErrorInfo),
    /// The server refused a published message
    #[error("message rejected: {0}")]
    Nack(ErrorInfo),
    /// No response arrived in time
    #[error("timed out: {0}")]
    Timeout(ErrorInfo),
    /// The request was malformed before reaching the server
    #[error("invalid request: {0}")]
    Invalid(ErrorInfo),
}

impl Error {
    /// Details carried by this error
    pub fn info(&self) -> &ErrorInfo {
        use Error::*;
        match self {
            Transport(info) | ProtocolViolation(info) | Auth(info) | Server(info)
            | Cancelled(info) | NotResumable(info) | ChannelInactive(info) | Nack(info)
            | Timeout(info) | Invalid(info) => info,
        }
    }

    /// Upstream error code
    pub fn code(&self) -> u32 {
        self.info().code
    }

    /// Upstream status
    pub fn status_code(&self) -> u16 {
        self.info().status_code
    }

    /// Whether repeating the same operation later may succeed
    pub fn is_retryable(&self) -> bool {
        use Error::*;
        match self {
            Transport(_) | ProtocolViolation(_) | Timeout(_) | NotResumable(_)
            | ChannelInactive(_) => true,
            Server(info) | Nack(info) => !info.is_client_fault(),
            Auth(_) | Cancelled(_) | Invalid(_) => false,
        }
    }

    pub(crate) fn transport(message: impl Into<String>) -> Self {
        Self::Transport(ErrorInfo::new(codes::DISCONNECTED, 0, message))
    }

    pub(crate) fn protocol(message: impl Into<String>) -> Self {
        Self::ProtocolViolation(ErrorInfo::new(codes::PROTOCOL_ERROR, 0, message))
    }

    pub(crate) fn timeout(code: u32, message: impl Into<String>) -> Self {
        Self::Timeout(ErrorInfo::new(code, 408, message))
    }

    pub(crate) fn closed() -> Self {
        Self::Cancelled(ErrorInfo::new(
            codes::CONNECTION_CLOSED,
            0,
            "connection closed",
        ))
    }

    pub(crate) fn not_resumable() -> Self {
        Self::NotResumable(ErrorInfo::new(
            codes::UNABLE_TO_RECOVER,
            0,
            "connection lost before acknowledgement and could not be resumed",
        ))
    }

    pub(crate) fn channel_inactive(message: impl Into<String>) -> Self {
        Self::ChannelInactive(ErrorInfo::new(codes::CHANNEL_NOT_ACTIVE, 400, message))
    }

    /// Classify an error frame received from the server
    pub(crate) fn from_server(info: ErrorInfo) -> Self {
        if info.is_token_error() || info.code == codes::INVALID_CREDENTIAL {
            Self::Auth(info)
        } else {
            Self::Server(info)
        }
    }
}

impl From<AuthFailure> for Error {
    fn from(x: AuthFailure) -> Self {
        Self::Auth(ErrorInfo::new(
            codes::CLIENT_AUTH_FAILED,
            x.status_code.unwrap_or(401),
            x.message,
        ))
    }
}
