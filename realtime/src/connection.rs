use std::{
    fmt,
    future::Future,
    mem,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll, Waker},
    time::Instant,
};

use proto::{
    error::codes, AuthFailure, ClientConfig, Codec, ConfigError, ConnectionState,
    ConnectionStateChange, Credential, Error, ErrorInfo, Event, JsonCodec, OpId, ProtocolMessage,
    Transmit, TransportId,
};
use rustc_hash::FxHashMap;
use tokio::{
    sync::{oneshot, watch},
    time::{sleep_until, Instant as TokioInstant, Sleep},
};
use tracing::{debug, info_span, trace, warn};

use crate::{
    channel::{ChannelListeners, Channels},
    emitter::{Dispatch, EventEmitter, Job, ListenerId, TokioDispatcher},
    mutex::Mutex,
    runtime::{AsyncTransport, BoxFuture, Connector, CredentialProvider},
};

/// A client of the realtime service
///
/// Owns the connection and every channel obtained through it. Protocol work happens on a
/// background task spawned by [`Realtime::new`]; the methods here only lock the shared state,
/// hand it the request and wake that task.
///
/// If every handle (including [`Channel`](crate::Channel)s and pending [`Completion`]s) is dropped, the
/// connection is closed gracefully and the background task exits once the server confirms.
///
/// May be cloned to obtain another handle to the same client.
#[derive(Debug, Clone)]
pub struct Realtime(ConnectionRef);

impl Realtime {
    /// Construct a client that runs listener callbacks on a dedicated tokio task
    ///
    /// Does not connect until [`connect`](Self::connect) is called.
    ///
    /// # Panics
    ///
    /// If called outside of a tokio runtime.
    pub fn new(
        config: ClientConfig,
        connector: Arc<dyn Connector>,
        credentials: Arc<dyn CredentialProvider>,
    ) -> Result<Self, ConfigError> {
        Self::with_dispatcher(
            config,
            connector,
            credentials,
            Arc::new(TokioDispatcher::new()),
        )
    }

    /// Construct a client that runs listener callbacks through `dispatcher`
    ///
    /// # Panics
    ///
    /// If called outside of a tokio runtime.
    pub fn with_dispatcher(
        config: ClientConfig,
        connector: Arc<dyn Connector>,
        credentials: Arc<dyn CredentialProvider>,
        dispatcher: Arc<dyn Dispatch>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let inner = proto::Connection::new(Arc::new(config));
        let (states, _) = watch::channel(inner.state());
        let shared = Arc::new(Mutex::new(ConnectionInner {
            inner,
            driver: None,
            ref_count: 0,
            connector,
            credentials,
            codec: JsonCodec,
            dispatcher,
            authorizing: None,
            transports: FxHashMap::default(),
            timer: None,
            timer_deadline: None,
            completions: FxHashMap::default(),
            listeners: EventEmitter::new(),
            channels: FxHashMap::default(),
            states,
            jobs: Vec::new(),
        }));
        let conn = ConnectionRef::new(shared.clone());
        tokio::spawn(ConnectionDriver(shared));
        Ok(Self(conn))
    }

    /// Start connecting, unless already connecting or connected
    pub fn connect(&self) {
        let mut state = self.0.lock("connect");
        state.inner.connect(Instant::now());
        state.wake();
    }

    /// Wait until the connection is established
    ///
    /// Resolves with the failure reason if the connection is closed or fails first. Waits
    /// through Disconnected and Suspended periods.
    pub async fn connected(&self) -> Result<(), ErrorInfo> {
        let mut states = self.0.lock("connected").states.subscribe();
        loop {
            let current = *states.borrow_and_update();
            match current {
                ConnectionState::Connected => return Ok(()),
                ConnectionState::Closed | ConnectionState::Failed => {
                    return Err(self.error_reason().unwrap_or_else(|| {
                        ErrorInfo::new(codes::CONNECTION_CLOSED, 0, "connection closed")
                    }));
                }
                _ => {}
            }
            if states.changed().await.is_err() {
                return Err(ErrorInfo::new(
                    codes::CONNECTION_CLOSED,
                    0,
                    "client dropped",
                ));
            }
        }
    }

    /// Close the connection, failing all queued work
    pub fn close(&self) {
        let mut state = self.0.lock("close");
        state.inner.close(Instant::now());
        state.wake();
    }

    /// Check that the server is responsive
    pub fn ping(&self) -> Completion {
        self.0.submit("ping", |conn, now| conn.ping(now))
    }

    /// Current connection state
    pub fn state(&self) -> ConnectionState {
        self.0.lock("state").inner.state()
    }

    /// Error behind the most recent failure-related transition
    pub fn error_reason(&self) -> Option<ErrorInfo> {
        self.0.lock("error_reason").inner.error_reason().cloned()
    }

    /// Server-assigned connection id
    pub fn id(&self) -> Option<String> {
        self.0.lock("id").inner.id().map(str::to_owned)
    }

    /// Key offered to resume this connection
    pub fn key(&self) -> Option<String> {
        self.0.lock("key").inner.key().map(str::to_owned)
    }

    /// Client id confirmed by the server, or the configured one before that
    pub fn client_id(&self) -> Option<String> {
        self.0.lock("client_id").inner.client_id().map(str::to_owned)
    }

    /// Token that lets a new client continue this connection via `ClientConfig::recover`
    pub fn recovery_key(&self) -> Option<String> {
        self.0.lock("recovery_key").inner.recovery_key()
    }

    /// Messages awaiting acknowledgement or transmission
    pub fn pending_messages(&self) -> usize {
        self.0.lock("pending_messages").inner.pending_messages()
    }

    /// Call `f` for connection state changes
    ///
    /// `state` restricts the listener to transitions into that state.
    pub fn on_state(
        &self,
        state: Option<ConnectionState>,
        f: impl Fn(&ConnectionStateChange) + Send + Sync + 'static,
    ) -> ListenerId {
        self.0.lock("on_state").listeners.on(state, Arc::new(f))
    }

    /// Like [`on_state`](Self::on_state), for the next matching change only
    pub fn once_state(
        &self,
        state: Option<ConnectionState>,
        f: impl Fn(&ConnectionStateChange) + Send + Sync + 'static,
    ) -> ListenerId {
        self.0.lock("once_state").listeners.once(state, Arc::new(f))
    }

    /// Remove a connection state listener
    pub fn off(&self, id: ListenerId) -> bool {
        let removed = self.0.lock("off").listeners.off(id);
        removed.is_some()
    }

    /// Remove every connection state listener
    pub fn off_all(&self) {
        let removed = self.0.lock("off_all").listeners.off_all();
        drop(removed);
    }

    /// Registry of the channels held by this client
    pub fn channels(&self) -> Channels {
        Channels::new(self.0.clone())
    }
}

/// Terminal outcome of an operation
///
/// Dropping a `Completion` does not withdraw the operation; use [`cancel`](Self::cancel).
#[must_use = "operations report failures only through their completion"]
#[derive(Debug)]
pub struct Completion {
    op: OpId,
    conn: ConnectionRef,
    rx: oneshot::Receiver<Result<(), Error>>,
}

impl Completion {
    /// Identifies the operation in logs
    pub fn op(&self) -> OpId {
        self.op
    }

    /// Withdraw the operation if it has not been sent yet
    ///
    /// The completion then resolves with [`Error::Cancelled`].
    pub fn cancel(&self) -> bool {
        let mut state = self.conn.lock("cancel");
        let cancelled = state.inner.cancel(self.op);
        state.wake();
        cancelled
    }
}

impl Future for Completion {
    type Output = Result<(), Error>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx).poll(cx).map(|result| {
            result.unwrap_or_else(|_| {
                Err(Error::Cancelled(ErrorInfo::new(
                    codes::CONNECTION_CLOSED,
                    0,
                    "client dropped",
                )))
            })
        })
    }
}

/// Drives the protocol state machine and its I/O
#[must_use = "connection drivers must be spawned for their connections to function"]
#[derive(Debug)]
struct ConnectionDriver(Arc<Mutex<ConnectionInner>>);

impl Future for ConnectionDriver {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        let mut conn = self.0.lock("poll");

        let span = info_span!("drive", id = conn.inner.id());
        let _guard = span.enter();

        loop {
            let mut keep_going = conn.drive_credential(cx);
            keep_going |= conn.drive_transports(cx);
            keep_going |= conn.drive_transmit();
            // An expired timer may produce transmits, and transmits may move the deadline; loop
            // until neither happens.
            keep_going |= conn.drive_timer(cx);
            conn.forward_app_events();
            if !keep_going {
                break;
            }
        }

        let jobs = mem::take(&mut conn.jobs);
        let dispatcher = conn.dispatcher.clone();
        let finished =
            conn.ref_count == 0 && conn.inner.state().is_terminal() && conn.transports.is_empty();
        if !finished {
            conn.driver = Some(cx.waker().clone());
        }
        drop(_guard);
        drop(conn);

        for job in jobs {
            dispatcher.dispatch(job);
        }
        match finished {
            true => {
                debug!("driver finished");
                Poll::Ready(())
            }
            false => Poll::Pending,
        }
    }
}

/// A counted handle to the shared client state
///
/// When the last handle is dropped the connection is closed.
pub(crate) struct ConnectionRef(Arc<Mutex<ConnectionInner>>);

impl ConnectionRef {
    fn new(shared: Arc<Mutex<ConnectionInner>>) -> Self {
        shared.lock("new").ref_count += 1;
        Self(shared)
    }

    /// Start an operation and register for its outcome
    pub(crate) fn submit(
        &self,
        purpose: &'static str,
        f: impl FnOnce(&mut proto::Connection, Instant) -> OpId,
    ) -> Completion {
        let (tx, rx) = oneshot::channel();
        let mut state = self.lock(purpose);
        let op = f(&mut state.inner, Instant::now());
        state.completions.insert(op, tx);
        state.wake();
        drop(state);
        Completion {
            op,
            conn: self.clone(),
            rx,
        }
    }
}

impl Clone for ConnectionRef {
    fn clone(&self) -> Self {
        Self::new(self.0.clone())
    }
}

impl Drop for ConnectionRef {
    fn drop(&mut self) {
        let state = &mut *self.0.lock("drop");
        if let Some(x) = state.ref_count.checked_sub(1) {
            state.ref_count = x;
            if x == 0 && !state.inner.state().is_terminal() {
                // Only the driver remains; let it shut down
                debug!("last handle dropped, closing");
                state.inner.close(Instant::now());
                state.wake();
            }
        }
    }
}

impl std::ops::Deref for ConnectionRef {
    type Target = Mutex<ConnectionInner>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl fmt::Debug for ConnectionRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ConnectionRef").finish()
    }
}

enum Transport {
    Opening(BoxFuture<Result<Box<dyn AsyncTransport>, ErrorInfo>>),
    Open(Box<dyn AsyncTransport>),
}

pub(crate) struct ConnectionInner {
    pub(crate) inner: proto::Connection,
    driver: Option<Waker>,
    ref_count: usize,

    connector: Arc<dyn Connector>,
    credentials: Arc<dyn CredentialProvider>,
    codec: JsonCodec,
    dispatcher: Arc<dyn Dispatch>,

    authorizing: Option<BoxFuture<Result<Credential, AuthFailure>>>,
    transports: FxHashMap<TransportId, Transport>,
    timer: Option<Pin<Box<Sleep>>>,
    timer_deadline: Option<TokioInstant>,

    completions: FxHashMap<OpId, oneshot::Sender<Result<(), Error>>>,
    pub(crate) listeners: EventEmitter<ConnectionState, ConnectionStateChange>,
    pub(crate) channels: FxHashMap<String, ChannelListeners>,
    states: watch::Sender<ConnectionState>,
    /// Listener invocations to dispatch once the lock is released
    jobs: Vec<Job>,
}

impl ConnectionInner {
    /// Have the driver process new work
    pub(crate) fn wake(&mut self) {
        if let Some(x) = self.driver.take() {
            x.wake();
        }
    }

    fn drive_credential(&mut self, cx: &mut Context<'_>) -> bool {
        let Some(pending) = &mut self.authorizing else {
            return false;
        };
        let Poll::Ready(result) = pending.as_mut().poll(cx) else {
            return false;
        };
        self.authorizing = None;
        if let Err(e) = &result {
            warn!(error = %e, "credential provider failed");
        }
        self.inner.handle_credential(Instant::now(), result);
        true
    }

    /// Poll transports for progress, returning whether any was made
    fn drive_transports(&mut self, cx: &mut Context<'_>) -> bool {
        let mut progress = false;
        let ids = self.transports.keys().copied().collect::<Vec<_>>();
        for id in ids {
            while let Some(transport) = self.transports.get_mut(&id) {
                let now = Instant::now();
                match transport {
                    Transport::Opening(opening) => match opening.as_mut().poll(cx) {
                        Poll::Pending => break,
                        Poll::Ready(Ok(open)) => {
                            trace!(?id, "transport open");
                            *transport = Transport::Open(open);
                            self.inner.on_transport_open(now, id);
                        }
                        Poll::Ready(Err(e)) => {
                            debug!(?id, error = %e, "transport failed to open");
                            self.transports.remove(&id);
                            self.inner.on_transport_error(now, id, e);
                        }
                    },
                    Transport::Open(open) => match open.poll_recv(cx) {
                        Poll::Pending => break,
                        Poll::Ready(Some(Ok(frame))) => match self.codec.decode(&frame) {
                            Ok(msg) => self.inner.on_transport_message(now, id, msg),
                            Err(e) => {
                                warn!(?id, error = %e, "undecodable frame");
                                if let Some(Transport::Open(mut open)) =
                                    self.transports.remove(&id)
                                {
                                    open.close();
                                }
                                let info = ErrorInfo::new(codes::PROTOCOL_ERROR, 0, e.to_string());
                                self.inner.on_transport_error(now, id, info);
                            }
                        },
                        Poll::Ready(Some(Err(e))) => {
                            debug!(?id, error = %e, "transport error");
                            self.transports.remove(&id);
                            self.inner.on_transport_error(now, id, e);
                        }
                        Poll::Ready(None) => {
                            debug!(?id, "transport closed by peer");
                            self.transports.remove(&id);
                            self.inner.on_transport_closed(now, id, None);
                        }
                    },
                }
                progress = true;
            }
        }
        progress
    }

    /// Perform requested I/O, returning whether new futures need polling
    fn drive_transmit(&mut self) -> bool {
        let mut started = false;
        while let Some(transmit) = self.inner.poll_transmit() {
            match transmit {
                Transmit::Authorize => {
                    debug!("requesting credential");
                    self.authorizing = Some(self.credentials.obtain());
                    started = true;
                }
                Transmit::Open(request) => {
                    debug!(host = %request.host, id = ?request.transport, "opening transport");
                    let opening = self.connector.connect(&request);
                    self.transports
                        .insert(request.transport, Transport::Opening(opening));
                    started = true;
                }
                Transmit::Send(msg) => self.send(msg),
                Transmit::Close(id) => {
                    trace!(?id, "closing transport");
                    if let Some(Transport::Open(mut open)) = self.transports.remove(&id) {
                        open.close();
                    }
                }
            }
        }
        started
    }

    fn send(&mut self, msg: ProtocolMessage) {
        let Some(id) = self.inner.transport() else {
            trace!(action = ?msg.action, "no transport, dropping");
            return;
        };
        let frame = match self.codec.encode(&msg) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, action = ?msg.action, "dropping unencodable message");
                return;
            }
        };
        let result = match self.transports.get_mut(&id) {
            Some(Transport::Open(open)) => open.send(frame),
            _ => {
                trace!(?id, action = ?msg.action, "transport not open, dropping");
                return;
            }
        };
        if let Err(e) = result {
            debug!(?id, error = %e, "send failed");
            if let Some(Transport::Open(mut open)) = self.transports.remove(&id) {
                open.close();
            }
            self.inner.on_transport_error(Instant::now(), id, e);
        }
    }

    fn drive_timer(&mut self, cx: &mut Context<'_>) -> bool {
        // A new or moved deadline must be polled once to register with the runtime
        match self.inner.poll_timeout().map(TokioInstant::from_std) {
            Some(deadline) => {
                match &mut self.timer {
                    Some(timer) if self.timer_deadline != Some(deadline) => {
                        timer.as_mut().reset(deadline)
                    }
                    Some(_) => {}
                    None => self.timer = Some(Box::pin(sleep_until(deadline))),
                }
                self.timer_deadline = Some(deadline);
            }
            None => {
                self.timer_deadline = None;
                return false;
            }
        }

        let Some(timer) = &mut self.timer else {
            return false;
        };
        if timer.as_mut().poll(cx).is_pending() {
            return false;
        }

        self.inner.handle_timeout(Instant::now());
        true
    }

    fn forward_app_events(&mut self) {
        while let Some(event) = self.inner.poll() {
            match event {
                Event::ConnectionStateChanged(change) => {
                    self.states.send_replace(change.current);
                    let current = change.current;
                    self.jobs.extend(self.listeners.emit(&current, change));
                }
                Event::ChannelStateChanged { channel, change } => {
                    if let Some(listeners) = self.channels.get_mut(&channel) {
                        let current = change.current;
                        self.jobs.extend(listeners.state.emit(&current, change));
                    }
                }
                Event::Message { channel, message } => {
                    if let Some(listeners) = self.channels.get_mut(&channel) {
                        let name = message.name.clone().unwrap_or_default();
                        self.jobs.extend(listeners.messages.emit(&name, message));
                    }
                }
                Event::Presence { channel, message } => {
                    if let Some(listeners) = self.channels.get_mut(&channel) {
                        let action = message.action;
                        self.jobs.extend(listeners.presence.emit(&action, message));
                    }
                }
                Event::Completed { op, result } => {
                    if let Some(tx) = self.completions.remove(&op) {
                        // The caller may have stopped waiting
                        let _ = tx.send(result);
                    }
                }
            }
        }
    }
}

impl fmt::Debug for ConnectionInner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionInner")
            .field("inner", &self.inner)
            .field("ref_count", &self.ref_count)
            .field("transports", &self.transports.len())
            .field("completions", &self.completions.len())
            .finish_non_exhaustive()
    }
}
