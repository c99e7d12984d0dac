use std::fmt;

use thiserror::Error;

/// A credential presented to the service when opening a transport
///
/// Issued by an external provider; the connection only requests a fresh one when the server
/// reports the current one as expired or invalid.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    /// Opaque token string
    pub token: String,
    /// Expiry in milliseconds since the epoch, if known
    pub expires: Option<u64>,
}

impl Credential {
    /// A credential without a known expiry
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            expires: None,
        }
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("token", &"<redacted>")
            .field("expires", &self.expires)
            .finish()
    }
}

/// A credential provider could not produce a valid credential
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("unable to obtain credential: {message}")]
pub struct AuthFailure {
    /// Human-readable description
    pub message: String,
    /// Status reported by the token issuer, if any
    pub status_code: Option<u16>,
}

impl AuthFailure {
    /// Construct a failure with no upstream status
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            status_code: None,
        }
    }
}
