use std::{
    collections::{BTreeMap, VecDeque},
    sync::Arc,
    time::{Duration, Instant},
};

use rand::{distributions::Alphanumeric, rngs::StdRng, Rng, SeedableRng};
use rustc_hash::FxHashMap;
use tracing::{debug, trace, warn};

use crate::{
    auth::{AuthFailure, Credential},
    channel::{Channel, ChannelState, ChannelStateChange, Ctx},
    config::{ChannelOptions, ClientConfig},
    error::{codes, Error, ErrorInfo},
    protocol::{
        Action, AuthDetails, ConnectionDetails, Flags, Message, PresenceAction, PresenceMessage,
        ProtocolMessage,
    },
    queue::{Completion, MessageQueue},
    recovery::RecoveryKey,
    retry::{Reconnect, RetryDecision},
    ChannelId, OpId, TransportId,
};

mod state;
pub use state::{ConnectionState, ConnectionStateChange};

pub(crate) mod timer;
use timer::{ConnTimer, Timer, TimerTable};

/// Parameters for opening a transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectRequest {
    /// Identifies this attempt in subsequent `on_transport_*` calls
    pub transport: TransportId,
    pub host: String,
    /// Query parameters of the connection request
    pub params: BTreeMap<String, String>,
}

/// I/O the connection asks its driver to perform
#[derive(Debug, Clone, PartialEq)]
pub enum Transmit {
    /// Obtain a credential and report it through [`Connection::handle_credential`]
    Authorize,
    /// Open a transport and report its progress through the `on_transport_*` methods
    Open(ConnectRequest),
    /// Write a message to the current transport
    Send(ProtocolMessage),
    /// Close a transport; no further events are expected for it
    Close(TransportId),
}

/// Events of interest to the application
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// The connection changed state
    ConnectionStateChanged(ConnectionStateChange),
    /// A channel changed state
    ChannelStateChanged {
        channel: String,
        change: ChannelStateChange,
    },
    /// A message arrived on an attached channel
    Message { channel: String, message: Message },
    /// A presence member entered, updated or left
    Presence {
        channel: String,
        message: PresenceMessage,
    },
    /// An operation reached its terminal outcome
    Completed {
        op: OpId,
        result: Result<(), Error>,
    },
}

/// Output buffers shared by the connection and its channels
#[derive(Debug, Default)]
pub(crate) struct Outbox {
    pub(crate) transmits: VecDeque<Transmit>,
    pub(crate) events: VecDeque<Event>,
    pub(crate) timers: TimerTable,
    pub(crate) queue: MessageQueue,
}

impl Outbox {
    /// Send a message that is not acknowledged by serial
    pub(crate) fn send(&mut self, msg: ProtocolMessage) {
        trace!(action = ?msg.action, channel = ?msg.channel, "send");
        self.transmits.push_back(Transmit::Send(msg));
    }

    pub(crate) fn complete(&mut self, op: OpId, result: Result<(), Error>) {
        self.events.push_back(Event::Completed { op, result });
    }

    pub(crate) fn complete_all(&mut self, done: Vec<Completion>) {
        for (op, result) in done {
            self.complete(op, result);
        }
    }
}

/// How the current attempt tries to continue a previous connection
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum Continuity {
    Fresh,
    Resume,
    Recover,
}

/// Protocol state of a realtime connection and its channels
///
/// Contains no I/O and never reads the clock: inputs are transport events, credentials and
/// timer expirations, outputs are [`Transmit`]s from [`poll_transmit`](Self::poll_transmit),
/// [`Event`]s from [`poll`](Self::poll) and a deadline from
/// [`poll_timeout`](Self::poll_timeout). The owner must have exclusive access for every call;
/// the accessors here are therefore unsynchronized.
pub struct Connection {
    config: Arc<ClientConfig>,
    state: ConnectionState,
    error_reason: Option<ErrorInfo>,

    id: Option<String>,
    key: Option<String>,
    client_id: Option<String>,
    serial: Option<i64>,
    max_message_size: usize,
    connection_state_ttl: Duration,
    max_idle_interval: Duration,

    transport: Option<TransportId>,
    next_transport: u64,
    continuity: Continuity,
    reconnect: Reconnect,
    /// Set once the connection is Suspended, until it connects again
    suspended: bool,

    credential: Option<Credential>,
    authorizing: bool,
    token_renewals: u32,
    recover: Option<RecoveryKey>,
    recovered_serials: BTreeMap<String, String>,

    channels: BTreeMap<ChannelId, Channel>,
    channel_ids: FxHashMap<String, ChannelId>,
    next_channel: u64,

    pings: VecDeque<(String, OpId, Instant)>,
    next_op: u64,
    rng: StdRng,
    out: Outbox,
}

impl Connection {
    pub fn new(config: Arc<ClientConfig>) -> Self {
        let rng = match config.rng_seed {
            Some(seed) => StdRng::from_seed(seed),
            None => StdRng::from_entropy(),
        };
        let recover = config.recover.as_deref().and_then(RecoveryKey::decode);
        Self {
            state: ConnectionState::Initialized,
            error_reason: None,
            id: None,
            key: None,
            client_id: config.client_id.clone(),
            serial: None,
            max_message_size: config.max_message_size,
            connection_state_ttl: config.connection_state_ttl,
            max_idle_interval: config.max_idle_interval,
            transport: None,
            next_transport: 0,
            continuity: Continuity::Fresh,
            reconnect: Reconnect::new(&config),
            suspended: false,
            credential: None,
            authorizing: false,
            token_renewals: 0,
            recovered_serials: recover
                .as_ref()
                .map(|r| r.channel_serials.clone())
                .unwrap_or_default(),
            recover,
            channels: BTreeMap::new(),
            channel_ids: FxHashMap::default(),
            next_channel: 0,
            pings: VecDeque::new(),
            next_op: 0,
            rng,
            out: Outbox::default(),
            config,
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Error behind the most recent failure-related transition
    pub fn error_reason(&self) -> Option<&ErrorInfo> {
        self.error_reason.as_ref()
    }

    /// Server-assigned id, once connected
    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    /// Key offered to resume this connection
    pub fn key(&self) -> Option<&str> {
        self.key.as_deref()
    }

    /// Transport of the current attempt, once opening was requested
    pub fn transport(&self) -> Option<TransportId> {
        self.transport
    }

    /// Host of the current or most recent connection attempt
    pub fn host(&self) -> Option<&str> {
        self.reconnect.current()
    }

    pub fn serial(&self) -> Option<i64> {
        self.serial
    }

    /// Client id confirmed by the server, or the configured one before that
    pub fn client_id(&self) -> Option<&str> {
        self.client_id.as_deref()
    }

    pub fn max_message_size(&self) -> usize {
        self.max_message_size
    }

    pub fn connection_state_ttl(&self) -> Duration {
        self.connection_state_ttl
    }

    pub fn max_idle_interval(&self) -> Duration {
        self.max_idle_interval
    }

    /// Messages awaiting acknowledgement or transmission
    pub fn pending_messages(&self) -> usize {
        self.out.queue.len()
    }

    /// Token that lets another client continue this connection
    pub fn recovery_key(&self) -> Option<String> {
        let connection_key = self.key.clone()?;
        let channel_serials = self
            .channels
            .values()
            .filter_map(|c| Some((c.name().to_owned(), c.serial()?.to_owned())))
            .collect();
        Some(
            RecoveryKey {
                connection_key,
                msg_serial: self.out.queue.next_serial(),
                channel_serials,
            }
            .encode(),
        )
    }

    /// Start connecting, unless already connecting or connected
    pub fn connect(&mut self, now: Instant) {
        match self.state {
            ConnectionState::Connecting | ConnectionState::Connected => return,
            ConnectionState::Closing => {
                self.close_transport();
                self.out.timers.stop(Timer::Conn(ConnTimer::Close));
            }
            ConnectionState::Closed | ConnectionState::Failed => {
                self.error_reason = None;
                self.suspended = false;
                self.token_renewals = 0;
                self.reconnect.reset();
            }
            _ => {}
        }
        self.start_attempt(now);
    }

    /// Close the connection, failing all queued work
    pub fn close(&mut self, now: Instant) {
        if matches!(
            self.state,
            ConnectionState::Closing | ConnectionState::Closed
        ) {
            return;
        }
        self.out.timers.reset();
        self.fail_pings(&Error::closed());
        let graceful = self.state == ConnectionState::Connected && self.transport.is_some();
        self.set_state(now, ConnectionState::Closing, None, None);
        if graceful {
            self.out.send(ProtocolMessage::new(Action::Close));
            self.out.timers.set(
                Timer::Conn(ConnTimer::Close),
                now + self.config.realtime_request_timeout,
            );
        } else {
            self.finish_close(now);
        }
    }

    /// Send a heartbeat and complete when the server echoes it
    pub fn ping(&mut self, now: Instant) -> OpId {
        let op = self.next_op();
        if self.state != ConnectionState::Connected {
            let err = Error::transport(format!("cannot ping while {}", self.state));
            self.out.complete(op, Err(err));
            return op;
        }
        let id = self.random_id();
        let mut msg = ProtocolMessage::new(Action::Heartbeat);
        msg.id = Some(id.clone());
        self.out.send(msg);
        self.pings
            .push_back((id, op, now + self.config.realtime_request_timeout));
        self.arm_ping_timer();
        op
    }

    /// Report the outcome of a [`Transmit::Authorize`] request
    pub fn handle_credential(&mut self, now: Instant, result: Result<Credential, AuthFailure>) {
        if !self.authorizing {
            trace!("unsolicited credential ignored");
            return;
        }
        self.authorizing = false;
        match result {
            Ok(credential) => {
                self.credential = Some(credential);
                match self.state {
                    ConnectionState::Connecting if self.transport.is_none() => {
                        self.open_transport(now)
                    }
                    ConnectionState::Connected => {
                        if let Some(credential) = &self.credential {
                            let mut msg = ProtocolMessage::new(Action::Auth);
                            msg.auth = Some(AuthDetails {
                                access_token: credential.token.clone(),
                            });
                            self.out.send(msg);
                        }
                    }
                    _ => {}
                }
            }
            Err(failure) => {
                if matches!(
                    self.state,
                    ConnectionState::Connecting | ConnectionState::Connected
                ) {
                    warn!(%failure, "credential provider failed");
                    self.fail(now, failure.into());
                }
            }
        }
    }

    /// The transport requested by [`Transmit::Open`] is established
    pub fn on_transport_open(&mut self, now: Instant, transport: TransportId) {
        if self.transport != Some(transport) {
            trace!(transport = transport.0, "stale transport open ignored");
            return;
        }
        debug!(transport = transport.0, "transport open");
        if self.state == ConnectionState::Connecting {
            self.out.timers.set(
                Timer::Conn(ConnTimer::Connect),
                now + self.config.realtime_request_timeout,
            );
        }
    }

    /// A message arrived on `transport`
    pub fn on_transport_message(
        &mut self,
        now: Instant,
        transport: TransportId,
        msg: ProtocolMessage,
    ) {
        if self.transport != Some(transport) {
            trace!(transport = transport.0, "message from stale transport ignored");
            return;
        }
        trace!(action = ?msg.action, channel = ?msg.channel, "recv");
        if self.state == ConnectionState::Connected {
            self.arm_idle_timer(now);
        }
        match msg.action {
            Action::Heartbeat => self.on_heartbeat(msg),
            Action::Connected => self.on_connected(now, msg),
            Action::Disconnected => {
                let info = msg.error.unwrap_or_else(|| {
                    ErrorInfo::new(codes::DISCONNECTED, 0, "disconnected by server")
                });
                if info.is_token_error() {
                    self.renew_credential(now, info);
                } else {
                    let host_failure = info.is_server_fault();
                    self.transport_lost(now, Error::Server(info), host_failure);
                }
            }
            Action::Closed => {
                self.close_transport();
                self.finish_close(now);
            }
            Action::Error if msg.channel.is_some() => self.route(now, msg),
            Action::Error => {
                let info = msg.error.unwrap_or_else(|| {
                    ErrorInfo::new(codes::INTERNAL, 500, "unspecified server error")
                });
                if info.is_token_error() {
                    self.renew_credential(now, info);
                } else if self.state == ConnectionState::Connecting && info.is_server_fault() {
                    self.transport_lost(now, Error::Server(info), true);
                } else {
                    self.fail(now, Error::from_server(info));
                }
            }
            Action::Ack => self.on_ack(now, &msg, Ok(())),
            Action::Nack => {
                let info = msg.error.clone().unwrap_or_else(|| {
                    ErrorInfo::new(codes::INTERNAL, 500, "message rejected by server")
                });
                self.on_ack(now, &msg, Err(Error::Nack(info)));
            }
            Action::Auth => {
                debug!("server requested re-authentication");
                self.request_credential();
            }
            Action::Attached
            | Action::Detached
            | Action::Message
            | Action::Presence
            | Action::Sync => self.route(now, msg),
            action => warn!(?action, "unexpected action from server"),
        }
    }

    /// The transport closed without an error
    pub fn on_transport_closed(
        &mut self,
        now: Instant,
        transport: TransportId,
        reason: Option<ErrorInfo>,
    ) {
        if self.transport != Some(transport) {
            return;
        }
        self.transport = None;
        let info =
            reason.unwrap_or_else(|| ErrorInfo::new(codes::DISCONNECTED, 0, "transport closed"));
        self.transport_lost(now, Error::Transport(info), true);
    }

    /// The transport failed to open or broke
    pub fn on_transport_error(&mut self, now: Instant, transport: TransportId, error: ErrorInfo) {
        if self.transport != Some(transport) {
            return;
        }
        self.transport = None;
        self.transport_lost(now, Error::Transport(error), true);
    }

    /// Process timer expirations up to `now`
    pub fn handle_timeout(&mut self, now: Instant) {
        while let Some((timer, _)) = self.out.timers.expire_before(now) {
            trace!(?timer, "timeout");
            match timer {
                Timer::Conn(ConnTimer::Retry) => {
                    if matches!(
                        self.state,
                        ConnectionState::Disconnected | ConnectionState::Suspended
                    ) {
                        self.start_attempt(now);
                    }
                }
                Timer::Conn(ConnTimer::Connect) => {
                    if self.state == ConnectionState::Connecting && self.transport.is_some() {
                        debug!("connection attempt timed out");
                        let err = Error::timeout(
                            codes::CONNECTION_TIMED_OUT,
                            "no response to connection request",
                        );
                        self.transport_lost(now, err, true);
                    }
                }
                Timer::Conn(ConnTimer::Idle) => {
                    if self.state == ConnectionState::Connected {
                        debug!("no activity from server");
                        let err = Error::timeout(codes::DISCONNECTED, "no activity from server");
                        self.transport_lost(now, err, true);
                    }
                }
                Timer::Conn(ConnTimer::StateTtl) => self.on_state_expired(now),
                Timer::Conn(ConnTimer::Close) => {
                    if self.state == ConnectionState::Closing {
                        debug!("no CLOSED from server");
                        self.finish_close(now);
                    }
                }
                Timer::Conn(ConnTimer::Ping) => self.expire_pings(now),
                Timer::Channel(id, timer) => {
                    self.with_channel_id(now, id, |channel, ctx| {
                        channel.handle_timeout(ctx, timer)
                    });
                }
            }
        }
    }

    /// Earliest instant at which [`handle_timeout`](Self::handle_timeout) should be called
    pub fn poll_timeout(&self) -> Option<Instant> {
        self.out.timers.peek()
    }

    /// Next I/O to perform
    ///
    /// Queued messages are assigned their serial here, at the moment they are handed to the
    /// transport.
    pub fn poll_transmit(&mut self) -> Option<Transmit> {
        if let Some(transmit) = self.out.transmits.pop_front() {
            return Some(transmit);
        }
        if self.state != ConnectionState::Connected || self.transport.is_none() {
            return None;
        }
        let msg = self.out.queue.next_transmit()?;
        trace!(serial = ?msg.msg_serial, channel = ?msg.channel, "send");
        Some(Transmit::Send(msg))
    }

    /// Next application event
    pub fn poll(&mut self) -> Option<Event> {
        self.out.events.pop_front()
    }

    /// Create the channel if it does not exist yet
    pub fn channel(&mut self, now: Instant, name: &str) -> ChannelState {
        self.with_channel(now, name, |channel, _| channel.state())
    }

    /// Create the channel or update the options of the existing one
    pub fn channel_with_options(&mut self, now: Instant, name: &str, options: ChannelOptions) {
        self.with_channel(now, name, |channel, ctx| channel.set_options(ctx, options));
    }

    pub fn channel_exists(&self, name: &str) -> bool {
        self.channel_ids.contains_key(name)
    }

    /// Names of all live channels
    pub fn channel_names(&self) -> impl Iterator<Item = &str> {
        self.channels.values().map(Channel::name)
    }

    pub fn channel_state(&self, name: &str) -> Option<ChannelState> {
        self.get_channel(name).map(Channel::state)
    }

    pub fn channel_error_reason(&self, name: &str) -> Option<&ErrorInfo> {
        self.get_channel(name)?.error_reason()
    }

    /// Modes granted by the server on the last attachment
    pub fn channel_modes(&self, name: &str) -> Option<Flags> {
        self.get_channel(name).map(Channel::granted_modes)
    }

    /// Presence members as of the last completed sync
    pub fn presence_members(&self, name: &str) -> Vec<PresenceMessage> {
        self.get_channel(name)
            .map(|c| c.presence().members().cloned().collect())
            .unwrap_or_default()
    }

    pub fn presence_sync_complete(&self, name: &str) -> bool {
        self.get_channel(name)
            .is_some_and(|c| c.presence().sync_complete())
    }

    /// Detach if needed and forget the channel
    pub fn release(&mut self, now: Instant, name: &str) {
        if self.channel_exists(name) {
            self.with_channel(now, name, |channel, ctx| channel.release(ctx));
        }
    }

    pub fn attach(&mut self, now: Instant, channel: &str) -> OpId {
        let op = self.next_op();
        self.with_channel(now, channel, |channel, ctx| channel.attach(ctx, Some(op)));
        op
    }

    pub fn detach(&mut self, now: Instant, channel: &str) -> OpId {
        let op = self.next_op();
        self.with_channel(now, channel, |channel, ctx| channel.detach(ctx, Some(op)));
        op
    }

    /// Publish messages as one unit; completes when the server acknowledges them
    pub fn publish(&mut self, now: Instant, channel: &str, mut messages: Vec<Message>) -> OpId {
        let op = self.next_op();
        if self.config.idempotent_publishing && messages.iter().all(|m| m.id.is_none()) {
            let base = self.random_id();
            for (i, message) in messages.iter_mut().enumerate() {
                message.id = Some(format!("{base}:{i}"));
            }
        }
        self.with_channel(now, channel, |channel, ctx| {
            channel.publish(ctx, messages, op)
        });
        op
    }

    /// Enter, update or leave presence on a channel
    ///
    /// `client_id` defaults to the connection's client id.
    pub fn presence(
        &mut self,
        now: Instant,
        channel: &str,
        action: PresenceAction,
        client_id: Option<String>,
        data: Option<serde_json::Value>,
    ) -> OpId {
        let op = self.next_op();
        if !matches!(
            action,
            PresenceAction::Enter | PresenceAction::Update | PresenceAction::Leave
        ) {
            let err = Error::Invalid(ErrorInfo::new(
                codes::BAD_REQUEST,
                400,
                format!("{action:?} is not a client presence action"),
            ));
            self.out.complete(op, Err(err));
            return op;
        }
        let client_id = client_id
            .or_else(|| self.client_id.clone())
            .filter(|id| id != "*");
        let Some(client_id) = client_id else {
            let err = Error::Invalid(ErrorInfo::new(
                codes::CLIENT_ID_REQUIRED,
                400,
                "presence requires a client id",
            ));
            self.out.complete(op, Err(err));
            return op;
        };
        let msg = PresenceMessage {
            action,
            client_id,
            data,
            ..PresenceMessage::default()
        };
        self.with_channel(now, channel, |channel, ctx| {
            channel.presence_update(ctx, msg, op)
        });
        op
    }

    /// Withdraw an operation that has not been assigned a serial yet
    ///
    /// Returns whether the operation was withdrawn; it then completes with a cancellation error.
    pub fn cancel(&mut self, op: OpId) -> bool {
        let found = self.out.queue.cancel(op)
            || self.channels.values_mut().any(|channel| channel.cancel(op));
        if found {
            let err = Error::Cancelled(ErrorInfo::new(
                codes::CHANNEL_OPERATION_FAILED,
                0,
                "cancelled before sending",
            ));
            self.out.complete(op, Err(err));
        }
        found
    }

    fn next_op(&mut self) -> OpId {
        let op = OpId(self.next_op);
        self.next_op += 1;
        op
    }

    fn random_id(&mut self) -> String {
        (&mut self.rng)
            .sample_iter(Alphanumeric)
            .take(12)
            .map(char::from)
            .collect()
    }

    fn get_channel(&self, name: &str) -> Option<&Channel> {
        self.channels.get(self.channel_ids.get(name)?)
    }

    /// Run `f` against the named channel, creating it if needed
    fn with_channel<R>(
        &mut self,
        now: Instant,
        name: &str,
        f: impl FnOnce(&mut Channel, &mut Ctx<'_>) -> R,
    ) -> R {
        let id = match self.channel_ids.get(name) {
            Some(&id) => id,
            None => {
                let id = ChannelId(self.next_channel);
                self.next_channel += 1;
                self.channel_ids.insert(name.to_owned(), id);
                id
            }
        };
        let recovered = &mut self.recovered_serials;
        let channel = self.channels.entry(id).or_insert_with(|| {
            trace!(channel = name, "created");
            let mut channel = Channel::new(id, name.to_owned(), ChannelOptions::default());
            if let Some(serial) = recovered.remove(name) {
                channel.set_serial(serial);
            }
            channel
        });
        let mut ctx = Ctx {
            now,
            config: &self.config,
            connection: self.state,
            max_message_size: self.max_message_size,
            out: &mut self.out,
        };
        let result = f(channel, &mut ctx);
        let attaching = channel.state() == ChannelState::Attaching;
        if channel.releasable() {
            self.remove_channel(id);
        }
        if attaching && self.state == ConnectionState::Initialized && self.config.auto_connect {
            debug!(channel = name, "connecting for attach");
            self.connect(now);
        }
        result
    }

    fn with_channel_id(
        &mut self,
        now: Instant,
        id: ChannelId,
        f: impl FnOnce(&mut Channel, &mut Ctx<'_>),
    ) {
        let Some(channel) = self.channels.get_mut(&id) else {
            return;
        };
        let mut ctx = Ctx {
            now,
            config: &self.config,
            connection: self.state,
            max_message_size: self.max_message_size,
            out: &mut self.out,
        };
        f(channel, &mut ctx);
        if channel.releasable() {
            self.remove_channel(id);
        }
    }

    fn remove_channel(&mut self, id: ChannelId) {
        if let Some(channel) = self.channels.remove(&id) {
            debug!(channel = channel.name(), "released");
            self.channel_ids.remove(channel.name());
            self.out.timers.stop_channel(id);
        }
    }

    /// Deliver a channel-addressed message
    fn route(&mut self, now: Instant, msg: ProtocolMessage) {
        let Some(&id) = msg.channel.as_ref().and_then(|name| self.channel_ids.get(name)) else {
            debug!(channel = ?msg.channel, action = ?msg.action, "message for unknown channel");
            return;
        };
        self.with_channel_id(now, id, |channel, ctx| channel.on_message(ctx, msg));
    }

    fn on_ack(&mut self, now: Instant, msg: &ProtocolMessage, outcome: Result<(), Error>) {
        let Some(base) = msg.msg_serial else {
            self.protocol_violation(now, Error::protocol("acknowledgement without serial"));
            return;
        };
        let mut done = Vec::new();
        match self
            .out
            .queue
            .resolve(base, msg.count.unwrap_or(1), outcome, &mut done)
        {
            Ok(()) => self.out.complete_all(done),
            Err(err) => self.protocol_violation(now, err),
        }
    }

    fn protocol_violation(&mut self, now: Instant, err: Error) {
        warn!(error = %err, "protocol violation");
        self.transport_lost(now, err, false);
    }

    fn on_heartbeat(&mut self, msg: ProtocolMessage) {
        let Some(id) = msg.id else {
            return;
        };
        if let Some(i) = self.pings.iter().position(|(x, _, _)| *x == id) {
            if let Some((_, op, _)) = self.pings.remove(i) {
                self.out.complete(op, Ok(()));
            }
            self.arm_ping_timer();
        }
    }

    fn on_connected(&mut self, now: Instant, msg: ProtocolMessage) {
        let details = msg.connection_details.clone().unwrap_or_default();
        match self.state {
            ConnectionState::Connecting => {}
            ConnectionState::Connected => {
                // Details refreshed after re-authentication
                self.apply_details(&details);
                return;
            }
            state => {
                trace!(%state, "CONNECTED ignored");
                return;
            }
        }

        self.out.timers.stop(Timer::Conn(ConnTimer::Connect));
        self.out.timers.stop(Timer::Conn(ConnTimer::StateTtl));
        self.out.timers.stop(Timer::Conn(ConnTimer::Retry));

        let new_key = details
            .connection_key
            .clone()
            .or_else(|| msg.connection_key.clone());
        let continuity = std::mem::replace(&mut self.continuity, Continuity::Fresh);
        let continued = msg.has_flag(Flags::RESUMED)
            || (msg.connection_id.is_some() && msg.connection_id == self.id)
            || (new_key.is_some() && new_key == self.key);

        match continuity {
            Continuity::Resume if continued => {
                let replay = self.out.queue.replay(msg.msg_serial);
                debug!(replayed = replay.len(), "connection resumed");
                for m in replay {
                    self.out.transmits.push_back(Transmit::Send(m));
                }
            }
            Continuity::Recover if msg.error.is_none() => {
                if let Some(recover) = &self.recover {
                    debug!(msg_serial = recover.msg_serial, "connection recovered");
                    let mut failed = Vec::new();
                    self.out
                        .queue
                        .fail_in_flight(&Error::not_resumable(), &mut failed);
                    self.out.complete_all(failed);
                    self.out.queue.set_next_serial(recover.msg_serial);
                }
            }
            _ => {
                let mut failed = Vec::new();
                self.out
                    .queue
                    .fail_in_flight(&Error::not_resumable(), &mut failed);
                if !failed.is_empty() {
                    debug!(failed = failed.len(), "connection not resumed");
                }
                self.out.complete_all(failed);
            }
        }
        self.recover = None;

        self.id = msg.connection_id.clone();
        self.key = new_key;
        self.serial = msg.connection_serial;
        self.apply_details(&details);
        self.reconnect.on_success(now);
        self.suspended = false;
        self.token_renewals = 0;
        self.arm_idle_timer(now);

        let reason = msg.error.map(Error::from_server);
        self.set_state(now, ConnectionState::Connected, reason, None);
    }

    fn apply_details(&mut self, details: &ConnectionDetails) {
        if let Some(client_id) = &details.client_id {
            self.client_id = Some(client_id.clone());
        }
        if let Some(size) = details.max_message_size {
            self.max_message_size = size;
        }
        if let Some(ttl) = details.connection_state_ttl {
            self.connection_state_ttl = Duration::from_millis(ttl);
        }
        if let Some(idle) = details.max_idle_interval {
            self.max_idle_interval = Duration::from_millis(idle);
        }
        if let Some(key) = &details.connection_key {
            self.key = Some(key.clone());
        }
    }

    fn arm_idle_timer(&mut self, now: Instant) {
        if self.max_idle_interval.is_zero() {
            self.out.timers.stop(Timer::Conn(ConnTimer::Idle));
            return;
        }
        self.out.timers.set(
            Timer::Conn(ConnTimer::Idle),
            now + self.max_idle_interval + self.config.realtime_request_timeout,
        );
    }

    fn start_attempt(&mut self, now: Instant) {
        self.out.timers.stop(Timer::Conn(ConnTimer::Retry));
        if self.state != ConnectionState::Connecting {
            self.set_state(now, ConnectionState::Connecting, None, None);
        }
        if self.credential.is_none() {
            self.request_credential();
            return;
        }
        self.open_transport(now);
    }

    fn request_credential(&mut self) {
        if !self.authorizing {
            self.authorizing = true;
            self.out.transmits.push_back(Transmit::Authorize);
        }
    }

    fn open_transport(&mut self, now: Instant) {
        let host = self.reconnect.next_host(now, &mut self.rng);
        let transport = TransportId(self.next_transport);
        self.next_transport += 1;
        self.transport = Some(transport);

        let mut params = BTreeMap::new();
        params.insert("v".to_owned(), "2".to_owned());
        params.insert("format".to_owned(), "json".to_owned());
        if !self.config.echo_messages {
            params.insert("echo".to_owned(), "false".to_owned());
        }
        if let Some(client_id) = &self.config.client_id {
            params.insert("clientId".to_owned(), client_id.clone());
        }
        if let Some(credential) = &self.credential {
            params.insert("accessToken".to_owned(), credential.token.clone());
        }
        self.continuity = match (&self.key, &self.recover) {
            (Some(key), _) => {
                params.insert("resume".to_owned(), key.clone());
                Continuity::Resume
            }
            (None, Some(recover)) => {
                params.insert("recover".to_owned(), recover.connection_key.clone());
                Continuity::Recover
            }
            (None, None) => Continuity::Fresh,
        };

        debug!(%host, transport = transport.0, continuity = ?self.continuity, "opening transport");
        self.out
            .transmits
            .push_back(Transmit::Open(ConnectRequest {
                transport,
                host,
                params,
            }));
        self.out.timers.set(
            Timer::Conn(ConnTimer::Connect),
            now + self.config.realtime_request_timeout,
        );
    }

    /// Discard the current credential and reconnect with a fresh one, once per success
    fn renew_credential(&mut self, now: Instant, info: ErrorInfo) {
        if self.token_renewals > 0 {
            self.fail(now, Error::Auth(info));
            return;
        }
        self.token_renewals += 1;
        debug!(error = %info, "credential rejected, renewing");
        self.credential = None;
        self.close_transport();
        self.out.timers.stop(Timer::Conn(ConnTimer::Connect));
        match self.state {
            ConnectionState::Connected => {
                self.out.timers.stop(Timer::Conn(ConnTimer::Idle));
                self.fail_pings(&Error::Auth(info.clone()));
                self.enter_disconnected(now, Error::Auth(info), Duration::ZERO);
            }
            ConnectionState::Connecting => self.start_attempt(now),
            _ => {}
        }
    }

    /// Close the current transport, if any
    fn close_transport(&mut self) {
        if let Some(transport) = self.transport.take() {
            self.out
                .transmits
                .retain(|t| !matches!(t, Transmit::Send(_)));
            self.out.transmits.push_back(Transmit::Close(transport));
        }
    }

    /// The current transport is gone or unusable
    fn transport_lost(&mut self, now: Instant, err: Error, host_failure: bool) {
        self.close_transport();
        self.out.timers.stop(Timer::Conn(ConnTimer::Connect));
        self.out.timers.stop(Timer::Conn(ConnTimer::Idle));
        self.fail_pings(&err);
        match self.state {
            ConnectionState::Connected => {
                debug!(error = %err, "connection lost");
                // First retry is immediate
                self.enter_disconnected(now, err, Duration::ZERO);
            }
            ConnectionState::Connecting => {
                let decision = self.reconnect.on_failure(now, host_failure);
                match decision {
                    _ if self.suspended => {
                        let delay = self.config.suspended_retry_timeout;
                        self.enter_suspended(now, err, delay);
                    }
                    RetryDecision::Disconnected(delay) => self.enter_disconnected(now, err, delay),
                    RetryDecision::Suspended(delay) => self.enter_suspended(now, err, delay),
                }
            }
            ConnectionState::Closing => self.finish_close(now),
            _ => {}
        }
    }

    fn enter_disconnected(&mut self, now: Instant, err: Error, delay: Duration) {
        let ttl = Timer::Conn(ConnTimer::StateTtl);
        if !self.out.timers.is_set(ttl) {
            self.out.timers.set(ttl, now + self.connection_state_ttl);
        }
        self.out.timers.set(Timer::Conn(ConnTimer::Retry), now + delay);
        self.set_state(now, ConnectionState::Disconnected, Some(err), Some(delay));
    }

    fn enter_suspended(&mut self, now: Instant, err: Error, delay: Duration) {
        self.suspended = true;
        self.out.timers.stop(Timer::Conn(ConnTimer::StateTtl));
        self.out.timers.set(Timer::Conn(ConnTimer::Retry), now + delay);
        self.set_state(now, ConnectionState::Suspended, Some(err), Some(delay));
    }

    /// The server no longer holds state for this connection
    fn on_state_expired(&mut self, now: Instant) {
        if !matches!(
            self.state,
            ConnectionState::Disconnected | ConnectionState::Connecting
        ) {
            return;
        }
        debug!("connection state expired");
        self.key = None;
        self.id = None;
        self.close_transport();
        self.out.timers.stop(Timer::Conn(ConnTimer::Connect));
        let err = Error::Transport(ErrorInfo::new(
            codes::CONNECTION_SUSPENDED,
            0,
            "connection state expired",
        ));
        let delay = self.config.suspended_retry_timeout;
        self.enter_suspended(now, err, delay);
    }

    fn finish_close(&mut self, now: Instant) {
        self.close_transport();
        self.out.timers.reset();
        self.key = None;
        self.id = None;
        self.suspended = false;
        self.token_renewals = 0;
        self.reconnect.reset();
        let err = Error::closed();
        self.fail_pings(&err);
        let mut failed = Vec::new();
        self.out.queue.fail_all(&err, &mut failed);
        self.out.complete_all(failed);
        self.set_state(now, ConnectionState::Closed, None, None);
    }

    fn fail(&mut self, now: Instant, err: Error) {
        warn!(error = %err, "connection failed");
        self.close_transport();
        self.out.timers.reset();
        self.key = None;
        self.id = None;
        self.suspended = false;
        self.reconnect.reset();
        self.fail_pings(&err);
        let mut failed = Vec::new();
        self.out.queue.fail_all(&err, &mut failed);
        self.out.complete_all(failed);
        self.set_state(now, ConnectionState::Failed, Some(err), None);
    }

    fn arm_ping_timer(&mut self) {
        match self.pings.front() {
            Some(&(_, _, deadline)) => self.out.timers.set(Timer::Conn(ConnTimer::Ping), deadline),
            None => self.out.timers.stop(Timer::Conn(ConnTimer::Ping)),
        }
    }

    fn expire_pings(&mut self, now: Instant) {
        while self.pings.front().is_some_and(|&(_, _, d)| d <= now) {
            if let Some((_, op, _)) = self.pings.pop_front() {
                let err = Error::timeout(codes::TIMEOUT, "heartbeat timed out");
                self.out.complete(op, Err(err));
            }
        }
        self.arm_ping_timer();
    }

    fn fail_pings(&mut self, err: &Error) {
        for (_, op, _) in self.pings.drain(..) {
            self.out.complete(op, Err(err.clone()));
        }
        self.out.timers.stop(Timer::Conn(ConnTimer::Ping));
    }

    fn set_state(
        &mut self,
        now: Instant,
        state: ConnectionState,
        err: Option<Error>,
        retry_in: Option<Duration>,
    ) {
        let previous = self.state;
        self.state = state;
        let reason = err.as_ref().map(|e| e.info().clone());
        match &reason {
            Some(reason) => self.error_reason = Some(reason.clone()),
            None if state == ConnectionState::Connected => self.error_reason = None,
            None => {}
        }
        debug!(from = %previous, to = %state, reason = ?reason.as_ref().map(|r| r.code), "connection state");
        self.out
            .events
            .push_back(Event::ConnectionStateChanged(ConnectionStateChange {
                previous,
                current: state,
                reason,
                retry_in,
            }));
        if previous == state {
            return;
        }

        let mut ctx = Ctx {
            now,
            config: &self.config,
            connection: state,
            max_message_size: self.max_message_size,
            out: &mut self.out,
        };
        let mut released = Vec::new();
        for (&id, channel) in self.channels.iter_mut() {
            channel.on_connection_state(&mut ctx, err.as_ref());
            if channel.releasable() {
                released.push(id);
            }
        }
        for id in released {
            self.remove_channel(id);
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("state", &self.state)
            .field("id", &self.id)
            .field("transport", &self.transport)
            .field("channels", &self.channels.len())
            .field("pending", &self.out.queue.len())
            .finish_non_exhaustive()
    }
}
