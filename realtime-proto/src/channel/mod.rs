use std::{collections::VecDeque, time::Instant};

use tracing::{debug, trace};

use crate::{
    config::{ChannelOptions, ClientConfig},
    connection::{
        timer::{ChannelTimer, Timer},
        ConnectionState, Event, Outbox,
    },
    error::{codes, Error, ErrorInfo},
    presence::PresenceMap,
    protocol::{Action, Flags, Message, PresenceMessage, ProtocolMessage},
    ChannelId, OpId,
};

mod state;
pub use state::{ChannelState, ChannelStateChange};

/// Connection-owned context a channel needs to act
pub(crate) struct Ctx<'a> {
    pub(crate) now: Instant,
    pub(crate) config: &'a ClientConfig,
    pub(crate) connection: ConnectionState,
    pub(crate) max_message_size: usize,
    pub(crate) out: &'a mut Outbox,
}

/// Attach/detach lifecycle, queued work and presence of one named channel
#[derive(Debug)]
pub(crate) struct Channel {
    id: ChannelId,
    name: String,
    state: ChannelState,
    options: ChannelOptions,
    error_reason: Option<ErrorInfo>,
    /// Serial of the last attachment or message, offered when re-attaching
    serial: Option<String>,
    /// Whether a previous attachment exists whose continuity can be requested
    attach_resume: bool,
    resumed: bool,
    granted_modes: Flags,
    presence: PresenceMap,

    attach_waiters: Vec<OpId>,
    detach_waiters: Vec<OpId>,
    /// Publishes submitted before the channel was attached
    queued: VecDeque<(Vec<Message>, OpId)>,
    /// Presence updates submitted before attachment and sync completed
    pending_presence: VecDeque<(PresenceMessage, OpId)>,
    attach_after_detach: bool,
    release_on_detach: bool,
}

impl Channel {
    pub(crate) fn new(id: ChannelId, name: String, options: ChannelOptions) -> Self {
        Self {
            id,
            name,
            state: ChannelState::Initialized,
            options,
            error_reason: None,
            serial: None,
            attach_resume: false,
            resumed: false,
            granted_modes: Flags::empty(),
            presence: PresenceMap::default(),
            attach_waiters: Vec::new(),
            detach_waiters: Vec::new(),
            queued: VecDeque::new(),
            pending_presence: VecDeque::new(),
            attach_after_detach: false,
            release_on_detach: false,
        }
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn state(&self) -> ChannelState {
        self.state
    }

    pub(crate) fn error_reason(&self) -> Option<&ErrorInfo> {
        self.error_reason.as_ref()
    }

    pub(crate) fn serial(&self) -> Option<&str> {
        self.serial.as_deref()
    }

    pub(crate) fn set_serial(&mut self, serial: String) {
        self.serial = Some(serial);
        self.attach_resume = true;
    }

    pub(crate) fn granted_modes(&self) -> Flags {
        self.granted_modes
    }

    pub(crate) fn presence(&self) -> &PresenceMap {
        &self.presence
    }

    /// Whether the channel was released and may now be dropped
    pub(crate) fn releasable(&self) -> bool {
        self.release_on_detach
            && matches!(
                self.state,
                ChannelState::Initialized | ChannelState::Detached | ChannelState::Failed
            )
    }

    /// Replace the attach options, re-attaching if they changed while attached
    pub(crate) fn set_options(&mut self, ctx: &mut Ctx<'_>, options: ChannelOptions) {
        if options == self.options {
            return;
        }
        self.options = options;
        if matches!(self.state, ChannelState::Attached | ChannelState::Attaching)
            && ctx.connection == ConnectionState::Connected
        {
            debug!(channel = %self.name, "options changed, re-attaching");
            if self.state == ChannelState::Attached {
                self.set_state(ctx, ChannelState::Attaching, None);
            }
            self.send_attach(ctx);
        }
    }

    /// Request release; the channel is dropped once detached
    pub(crate) fn release(&mut self, ctx: &mut Ctx<'_>) {
        self.release_on_detach = true;
        self.attach_after_detach = false;
        if self.state.is_active() {
            self.detach(ctx, None);
        }
    }

    pub(crate) fn attach(&mut self, ctx: &mut Ctx<'_>, op: Option<OpId>) {
        use ChannelState::*;
        match self.state {
            Attached => {
                if let Some(op) = op {
                    ctx.out.complete(op, Ok(()));
                }
            }
            Attaching => self.attach_waiters.extend(op),
            Detaching => {
                self.attach_waiters.extend(op);
                self.attach_after_detach = true;
            }
            Initialized | Detached | Suspended | Failed => {
                if !ctx.connection.accepts_work() {
                    if let Some(op) = op {
                        let err = Error::channel_inactive(format!(
                            "cannot attach while connection is {}",
                            ctx.connection
                        ));
                        ctx.out.complete(op, Err(err));
                    }
                    return;
                }
                self.release_on_detach = false;
                self.attach_waiters.extend(op);
                ctx.out
                    .timers
                    .stop(Timer::Channel(self.id, ChannelTimer::Retry));
                self.set_state(ctx, Attaching, None);
                if ctx.connection == ConnectionState::Connected {
                    self.send_attach(ctx);
                }
            }
        }
    }

    pub(crate) fn detach(&mut self, ctx: &mut Ctx<'_>, op: Option<OpId>) {
        use ChannelState::*;
        match self.state {
            Initialized | Detached => {
                if let Some(op) = op {
                    ctx.out.complete(op, Ok(()));
                }
            }
            Failed => {
                if let Some(op) = op {
                    ctx.out.complete(op, Err(self.inactive_error()));
                }
            }
            Detaching => {
                self.detach_waiters.extend(op);
                self.attach_after_detach = false;
            }
            Attaching | Attached | Suspended => {
                self.attach_after_detach = false;
                let cancelled = Error::Cancelled(ErrorInfo::new(
                    codes::CHANNEL_OPERATION_FAILED,
                    0,
                    "detach requested",
                ));
                for op in self.attach_waiters.drain(..) {
                    ctx.out.complete(op, Err(cancelled.clone()));
                }
                self.detach_waiters.extend(op);
                if ctx.connection == ConnectionState::Connected && self.state != Suspended {
                    self.set_state(ctx, Detaching, None);
                    self.send_detach(ctx);
                } else {
                    // No server-side attachment to undo
                    self.enter_detached(ctx, None, &cancelled);
                }
            }
        }
    }

    pub(crate) fn publish(&mut self, ctx: &mut Ctx<'_>, messages: Vec<Message>, op: OpId) {
        use ChannelState::*;
        let size = messages.iter().map(Message::size).sum::<usize>();
        if size > ctx.max_message_size {
            let err = Error::Invalid(ErrorInfo::new(
                codes::MAX_MESSAGE_SIZE_EXCEEDED,
                400,
                format!(
                    "message size {size} exceeds maximum {}",
                    ctx.max_message_size
                ),
            ));
            ctx.out.complete(op, Err(err));
            return;
        }

        match self.state {
            Attached if ctx.connection == ConnectionState::Connected => {
                self.enqueue_publish(ctx, messages, op);
            }
            Failed => ctx.out.complete(op, Err(self.inactive_error())),
            _ if !ctx.connection.accepts_work() || !ctx.config.queue_messages => {
                let err = Error::channel_inactive(format!(
                    "cannot publish while channel is {} and connection is {}",
                    self.state, ctx.connection
                ));
                ctx.out.complete(op, Err(err));
            }
            state => {
                trace!(channel = %self.name, %state, "publish queued");
                self.queued.push_back((messages, op));
                match state {
                    Initialized | Detached => self.attach(ctx, None),
                    Detaching => self.attach_after_detach = true,
                    _ => {}
                }
            }
        }
    }

    pub(crate) fn presence_update(&mut self, ctx: &mut Ctx<'_>, msg: PresenceMessage, op: OpId) {
        use ChannelState::*;
        match self.state {
            Attached
                if self.presence.sync_complete()
                    && ctx.connection == ConnectionState::Connected =>
            {
                self.enqueue_presence(ctx, msg, op);
            }
            Failed => ctx.out.complete(op, Err(self.inactive_error())),
            state
                if !ctx.connection.accepts_work()
                    || (!ctx.config.queue_messages && state != Attached) =>
            {
                let err = Error::channel_inactive(format!(
                    "cannot update presence while channel is {} and connection is {}",
                    state, ctx.connection
                ));
                ctx.out.complete(op, Err(err));
            }
            state => {
                self.pending_presence.push_back((msg, op));
                match state {
                    Initialized | Detached => self.attach(ctx, None),
                    Detaching => self.attach_after_detach = true,
                    _ => {}
                }
            }
        }
    }

    /// Withdraw a publish or presence update that has not reached the connection queue
    pub(crate) fn cancel(&mut self, op: OpId) -> bool {
        if let Some(i) = self.queued.iter().position(|(_, x)| *x == op) {
            self.queued.remove(i);
            return true;
        }
        if let Some(i) = self.pending_presence.iter().position(|(_, x)| *x == op) {
            self.pending_presence.remove(i);
            return true;
        }
        false
    }

    /// Handle a message addressed to this channel
    pub(crate) fn on_message(&mut self, ctx: &mut Ctx<'_>, msg: ProtocolMessage) {
        match msg.action {
            Action::Attached => self.on_attached(ctx, msg),
            Action::Detached => self.on_detached(ctx, msg),
            Action::Error => {
                let info = msg.error.unwrap_or_else(|| {
                    ErrorInfo::new(codes::CHANNEL_OPERATION_FAILED, 500, "channel error")
                });
                debug!(channel = %self.name, error = %info, "channel error");
                self.enter_failed(ctx, &Error::from_server(info));
            }
            Action::Message => {
                if self.state != ChannelState::Attached {
                    debug!(channel = %self.name, state = %self.state, "message on inactive channel dropped");
                    return;
                }
                if let Some(serial) = &msg.channel_serial {
                    self.serial = Some(serial.clone());
                }
                for (i, mut message) in msg.messages.into_iter().enumerate() {
                    if message.id.is_none() {
                        message.id = msg.id.as_ref().map(|id| format!("{id}:{i}"));
                    }
                    if message.connection_id.is_none() {
                        message.connection_id = msg.connection_id.clone();
                    }
                    if message.timestamp.is_none() {
                        message.timestamp = msg.timestamp;
                    }
                    ctx.out.events.push_back(Event::Message {
                        channel: self.name.clone(),
                        message,
                    });
                }
            }
            Action::Presence => {
                if self.state != ChannelState::Attached {
                    debug!(channel = %self.name, state = %self.state, "presence on inactive channel dropped");
                    return;
                }
                for member in inherit(&msg) {
                    if self.presence.apply(&member) {
                        ctx.out.events.push_back(Event::Presence {
                            channel: self.name.clone(),
                            message: member,
                        });
                    }
                }
            }
            Action::Sync => {
                if self.state != ChannelState::Attached {
                    debug!(channel = %self.name, state = %self.state, "sync on inactive channel dropped");
                    return;
                }
                let page = inherit(&msg);
                if let Some(events) = self
                    .presence
                    .apply_sync_page(msg.channel_serial.as_deref(), &page)
                {
                    self.emit_presence(ctx, events);
                    self.flush(ctx);
                }
            }
            action => debug!(channel = %self.name, ?action, "unexpected channel action"),
        }
    }

    fn on_attached(&mut self, ctx: &mut Ctx<'_>, msg: ProtocolMessage) {
        use ChannelState::*;
        let resumed = msg.has_flag(Flags::RESUMED);
        match self.state {
            Attaching | Suspended => {
                ctx.out.timers.stop_channel(self.id);
                self.update_attachment(&msg);
                self.set_state(ctx, Attached, msg.error.clone());
                self.sync_presence(ctx, &msg);
                for op in self.attach_waiters.drain(..) {
                    ctx.out.complete(op, Ok(()));
                }
                self.flush(ctx);
            }
            Attached => {
                self.update_attachment(&msg);
                if !resumed || msg.error.is_some() {
                    // Continuity lost on an existing attachment
                    self.set_state(ctx, Attached, msg.error.clone());
                }
                self.sync_presence(ctx, &msg);
                self.flush(ctx);
            }
            state => trace!(channel = %self.name, %state, "ATTACHED ignored"),
        }
    }

    fn update_attachment(&mut self, msg: &ProtocolMessage) {
        if let Some(serial) = &msg.channel_serial {
            self.serial = Some(serial.clone());
        }
        self.resumed = msg.has_flag(Flags::RESUMED);
        self.attach_resume = true;
        self.granted_modes = msg.flags & Flags::MODES;
    }

    fn sync_presence(&mut self, ctx: &mut Ctx<'_>, msg: &ProtocolMessage) {
        if msg.has_flag(Flags::HAS_PRESENCE) {
            self.presence.start_sync();
        } else if self.resumed && self.presence.sync_complete() {
            self.presence.keep();
        } else {
            let events = self.presence.end_sync_empty();
            self.emit_presence(ctx, events);
        }
    }

    fn on_detached(&mut self, ctx: &mut Ctx<'_>, msg: ProtocolMessage) {
        use ChannelState::*;
        match self.state {
            Detaching => {
                let reattach = self.attach_after_detach;
                let err = self.detached_error();
                self.enter_detached(ctx, msg.error, &err);
                if reattach {
                    self.attach(ctx, None);
                }
            }
            Attached | Attaching => {
                let err = msg.error.map(Error::from_server).unwrap_or_else(|| {
                    Error::Server(ErrorInfo::new(
                        codes::CHANNEL_OPERATION_FAILED,
                        500,
                        "detached by server",
                    ))
                });
                if !err.is_retryable() {
                    self.enter_failed(ctx, &err);
                    return;
                }
                for op in self.attach_waiters.drain(..) {
                    ctx.out.complete(op, Err(err.clone()));
                }
                let retry = ctx.connection == ConnectionState::Connected;
                self.enter_suspended(ctx, Some(err.info().clone()), retry);
            }
            state => trace!(channel = %self.name, %state, "DETACHED ignored"),
        }
    }

    /// React to a connection state transition
    pub(crate) fn on_connection_state(&mut self, ctx: &mut Ctx<'_>, reason: Option<&Error>) {
        use ChannelState::*;
        let info = reason.map(|e| e.info().clone());
        match ctx.connection {
            ConnectionState::Connected => match self.state {
                Attaching => self.send_attach(ctx),
                Suspended => {
                    ctx.out
                        .timers
                        .stop(Timer::Channel(self.id, ChannelTimer::Retry));
                    self.set_state(ctx, Attaching, None);
                    self.send_attach(ctx);
                }
                Detaching => self.send_detach(ctx),
                _ => {}
            },
            ConnectionState::Disconnected => match self.state {
                Attached => self.set_state(ctx, Attaching, info),
                Attaching | Detaching => ctx
                    .out
                    .timers
                    .stop(Timer::Channel(self.id, ChannelTimer::Operation)),
                _ => {}
            },
            ConnectionState::Suspended => match self.state {
                Attached | Attaching => self.enter_suspended(ctx, info, false),
                Detaching => {
                    let err = self.detached_error();
                    self.enter_detached(ctx, info, &err);
                }
                _ => {}
            },
            ConnectionState::Failed if self.state.is_active() => {
                let err = reason.cloned().unwrap_or_else(|| {
                    Error::Server(ErrorInfo::new(codes::CONNECTION_FAILED, 0, "connection failed"))
                });
                self.enter_failed(ctx, &err);
            }
            ConnectionState::Closed if self.state.is_active() => {
                self.attach_after_detach = false;
                self.enter_detached(ctx, info, &Error::closed());
            }
            _ => {}
        }
    }

    pub(crate) fn handle_timeout(&mut self, ctx: &mut Ctx<'_>, timer: ChannelTimer) {
        use ChannelState::*;
        match (timer, self.state) {
            (ChannelTimer::Operation, Attaching) => {
                debug!(channel = %self.name, "attach timed out");
                let err = Error::timeout(codes::ATTACH_TIMEOUT, "attach timed out");
                for op in self.attach_waiters.drain(..) {
                    ctx.out.complete(op, Err(err.clone()));
                }
                self.enter_suspended(ctx, Some(err.info().clone()), true);
            }
            (ChannelTimer::Operation, Detaching) => {
                debug!(channel = %self.name, "detach timed out");
                let err = Error::timeout(codes::DETACH_TIMEOUT, "detach timed out");
                for op in self.detach_waiters.drain(..) {
                    ctx.out.complete(op, Err(err.clone()));
                }
                self.attach_after_detach = false;
                self.set_state(ctx, Attached, Some(err.info().clone()));
                for op in self.attach_waiters.drain(..) {
                    ctx.out.complete(op, Ok(()));
                }
                self.flush(ctx);
            }
            (ChannelTimer::Retry, Suspended) if ctx.connection == ConnectionState::Connected => {
                debug!(channel = %self.name, "retrying attach");
                self.set_state(ctx, Attaching, None);
                self.send_attach(ctx);
            }
            _ => {}
        }
    }

    fn send_attach(&mut self, ctx: &mut Ctx<'_>) {
        let mut msg = ProtocolMessage::for_channel(Action::Attach, &self.name);
        msg.flags = self.options.modes;
        if self.attach_resume {
            msg.flags.insert(Flags::ATTACH_RESUME);
        }
        msg.channel_serial = self.serial.clone();
        msg.params = self.options.params.clone();
        ctx.out.send(msg);
        ctx.out.timers.set(
            Timer::Channel(self.id, ChannelTimer::Operation),
            ctx.now + ctx.config.realtime_request_timeout,
        );
    }

    fn send_detach(&mut self, ctx: &mut Ctx<'_>) {
        ctx.out
            .send(ProtocolMessage::for_channel(Action::Detach, &self.name));
        ctx.out.timers.set(
            Timer::Channel(self.id, ChannelTimer::Operation),
            ctx.now + ctx.config.realtime_request_timeout,
        );
    }

    /// Move queued work to the connection once attached
    fn flush(&mut self, ctx: &mut Ctx<'_>) {
        if self.state != ChannelState::Attached || ctx.connection != ConnectionState::Connected {
            return;
        }
        while let Some((messages, op)) = self.queued.pop_front() {
            self.enqueue_publish(ctx, messages, op);
        }
        if self.presence.sync_complete() {
            while let Some((msg, op)) = self.pending_presence.pop_front() {
                self.enqueue_presence(ctx, msg, op);
            }
        }
    }

    fn enqueue_publish(&mut self, ctx: &mut Ctx<'_>, messages: Vec<Message>, op: OpId) {
        let mut msg = ProtocolMessage::for_channel(Action::Message, &self.name);
        msg.messages = messages;
        ctx.out.queue.push(msg, op, ctx.now);
    }

    fn enqueue_presence(&mut self, ctx: &mut Ctx<'_>, member: PresenceMessage, op: OpId) {
        let mut msg = ProtocolMessage::for_channel(Action::Presence, &self.name);
        msg.presence.push(member);
        ctx.out.queue.push(msg, op, ctx.now);
    }

    fn emit_presence(&mut self, ctx: &mut Ctx<'_>, events: Vec<PresenceMessage>) {
        for message in events {
            ctx.out.events.push_back(Event::Presence {
                channel: self.name.clone(),
                message,
            });
        }
    }

    fn enter_suspended(&mut self, ctx: &mut Ctx<'_>, reason: Option<ErrorInfo>, retry: bool) {
        ctx.out
            .timers
            .stop(Timer::Channel(self.id, ChannelTimer::Operation));
        self.set_state(ctx, ChannelState::Suspended, reason);
        if retry {
            ctx.out.timers.set(
                Timer::Channel(self.id, ChannelTimer::Retry),
                ctx.now + ctx.config.channel_retry_timeout,
            );
        }
    }

    /// Enter Detached, failing queued work with `err` unless a re-attach is pending
    fn enter_detached(&mut self, ctx: &mut Ctx<'_>, reason: Option<ErrorInfo>, err: &Error) {
        ctx.out.timers.stop_channel(self.id);
        self.attach_resume = false;
        self.serial = None;
        self.resumed = false;
        self.presence.clear();
        self.set_state(ctx, ChannelState::Detached, reason);
        for op in self.detach_waiters.drain(..) {
            ctx.out.complete(op, Ok(()));
        }
        if !self.attach_after_detach {
            self.fail_pending(ctx, err);
        }
    }

    pub(crate) fn enter_failed(&mut self, ctx: &mut Ctx<'_>, err: &Error) {
        ctx.out.timers.stop_channel(self.id);
        self.attach_after_detach = false;
        self.attach_resume = false;
        self.resumed = false;
        self.presence.clear();
        self.set_state(ctx, ChannelState::Failed, Some(err.info().clone()));
        for op in self.detach_waiters.drain(..) {
            ctx.out.complete(op, Err(err.clone()));
        }
        self.fail_pending(ctx, err);
    }

    /// Fail every operation waiting on this channel, oldest first within each kind
    pub(crate) fn fail_pending(&mut self, ctx: &mut Ctx<'_>, err: &Error) {
        for op in self.attach_waiters.drain(..) {
            ctx.out.complete(op, Err(err.clone()));
        }
        for (_, op) in self.queued.drain(..) {
            ctx.out.complete(op, Err(err.clone()));
        }
        for (_, op) in self.pending_presence.drain(..) {
            ctx.out.complete(op, Err(err.clone()));
        }
        let mut failed = Vec::new();
        ctx.out.queue.fail_unsent_for(&self.name, err, &mut failed);
        ctx.out.complete_all(failed);
    }

    fn set_state(&mut self, ctx: &mut Ctx<'_>, state: ChannelState, reason: Option<ErrorInfo>) {
        let previous = self.state;
        self.state = state;
        match &reason {
            Some(_) => self.error_reason = reason.clone(),
            None if state == ChannelState::Attached => self.error_reason = None,
            None => {}
        }
        debug!(channel = %self.name, from = %previous, to = %state, "channel state");
        ctx.out.events.push_back(Event::ChannelStateChanged {
            channel: self.name.clone(),
            change: ChannelStateChange {
                previous,
                current: state,
                reason,
                resumed: self.resumed,
            },
        });
    }

    fn inactive_error(&self) -> Error {
        Error::ChannelInactive(self.error_reason.clone().unwrap_or_else(|| {
            ErrorInfo::new(codes::CHANNEL_NOT_ACTIVE, 400, format!("channel is {}", self.state))
        }))
    }

    fn detached_error(&self) -> Error {
        Error::Cancelled(ErrorInfo::new(
            codes::CHANNEL_OPERATION_FAILED,
            0,
            format!("channel {} detached", self.name),
        ))
    }
}

/// Presence messages of `msg` with ids, connection ids and timestamps filled from the envelope
fn inherit(msg: &ProtocolMessage) -> Vec<PresenceMessage> {
    msg.presence
        .iter()
        .enumerate()
        .map(|(i, member)| {
            let mut member = member.clone();
            if member.connection_id.is_empty() {
                member.connection_id = msg.connection_id.clone().unwrap_or_default();
            }
            if member.id.is_none() {
                member.id = msg.id.as_ref().map(|id| format!("{id}:{i}"));
            }
            if member.timestamp.is_none() {
                member.timestamp = msg.timestamp;
            }
            member
        })
        .collect()
}
