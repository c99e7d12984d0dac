use std::{
    fmt::Debug,
    future::Future,
    pin::Pin,
    task::{Context, Poll},
};

use bytes::Bytes;
use proto::{AuthFailure, ConnectRequest, Credential, ErrorInfo};

/// A boxed future that can be driven from any task
pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send + 'static>>;

/// Opens transports to the service
///
/// A transport carries whole frames in both directions; framing and the underlying protocol
/// (websocket, in-memory channel, ...) are up to the implementation.
pub trait Connector: Send + Sync + Debug + 'static {
    /// Open a transport as described by `request`
    ///
    /// The returned future is dropped without completing if the attempt is abandoned.
    fn connect(&self, request: &ConnectRequest)
        -> BoxFuture<Result<Box<dyn AsyncTransport>, ErrorInfo>>;
}

/// An open, bidirectional frame transport
pub trait AsyncTransport: Send + Debug + 'static {
    /// Receive the next inbound frame
    ///
    /// `Ready(None)` reports that the peer closed the transport.
    fn poll_recv(&mut self, cx: &mut Context<'_>) -> Poll<Option<Result<Bytes, ErrorInfo>>>;

    /// Queue a frame for transmission without blocking
    fn send(&mut self, frame: Bytes) -> Result<(), ErrorInfo>;

    /// Close the transport; no further calls follow
    fn close(&mut self);
}

/// Source of credentials for connecting and renewing authentication
pub trait CredentialProvider: Send + Sync + Debug + 'static {
    /// Obtain a fresh credential
    fn obtain(&self) -> BoxFuture<Result<Credential, AuthFailure>>;
}

/// Hands out the same token on every request
#[derive(Debug, Clone)]
pub struct StaticToken(Credential);

impl StaticToken {
    /// Wrap `token`
    pub fn new(token: impl Into<String>) -> Self {
        Self(Credential::new(token))
    }
}

impl CredentialProvider for StaticToken {
    fn obtain(&self) -> BoxFuture<Result<Credential, AuthFailure>> {
        let credential = self.0.clone();
        Box::pin(async move { Ok::<_, AuthFailure>(credential) })
    }
}
