use std::{fmt, sync::Arc, time::Instant};

use proto::{
    ChannelOptions, ChannelState, ChannelStateChange, ErrorInfo, Flags, Message, PresenceAction,
    PresenceMessage,
};

use crate::{
    connection::{Completion, ConnectionRef},
    emitter::{EventEmitter, ListenerId},
};

/// The channels held by a [`Realtime`](crate::Realtime) client
///
/// There is at most one channel per name; every [`Channel`] handle for a name refers to it.
#[derive(Debug, Clone)]
pub struct Channels {
    conn: ConnectionRef,
}

impl Channels {
    pub(crate) fn new(conn: ConnectionRef) -> Self {
        Self { conn }
    }

    /// Get or create the channel called `name`
    pub fn get(&self, name: &str) -> Channel {
        self.conn.lock("channel").inner.channel(Instant::now(), name);
        Channel::new(self.conn.clone(), name)
    }

    /// Get or create the channel called `name`, applying `options`
    ///
    /// Changed options on an attached channel trigger a re-attach.
    pub fn get_with_options(&self, name: &str, options: ChannelOptions) -> Channel {
        let mut state = self.conn.lock("channel_with_options");
        state
            .inner
            .channel_with_options(Instant::now(), name, options);
        state.wake();
        drop(state);
        Channel::new(self.conn.clone(), name)
    }

    /// Whether a channel called `name` is held
    pub fn exists(&self, name: &str) -> bool {
        self.conn.lock("channel_exists").inner.channel_exists(name)
    }

    /// Names of every channel currently held
    pub fn names(&self) -> Vec<String> {
        let state = self.conn.lock("channel_names");
        state.inner.channel_names().map(str::to_owned).collect()
    }

    /// Detach the channel if needed and forget it along with its listeners
    ///
    /// Existing handles recreate the channel when used again.
    pub fn release(&self, name: &str) {
        let mut state = self.conn.lock("release");
        state.inner.release(Instant::now(), name);
        let listeners = state.channels.remove(name);
        state.wake();
        drop(state);
        drop(listeners);
    }
}

/// A named channel of a [`Realtime`](crate::Realtime) client
///
/// Obtained from [`Channels::get`]. Handles are cheap to clone and
/// all refer to the same channel state; operations on a released channel recreate it.
#[derive(Clone)]
pub struct Channel {
    conn: ConnectionRef,
    name: Arc<str>,
}

impl Channel {
    pub(crate) fn new(conn: ConnectionRef, name: &str) -> Self {
        Self {
            conn,
            name: name.into(),
        }
    }

    /// Name the channel was obtained under
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current state; [`ChannelState::Initialized`] once released
    pub fn state(&self) -> ChannelState {
        let state = self.conn.lock("channel_state");
        state.inner.channel_state(&self.name).unwrap_or_default()
    }

    /// Error behind the most recent failure-related transition
    pub fn error_reason(&self) -> Option<ErrorInfo> {
        let state = self.conn.lock("channel_error_reason");
        state.inner.channel_error_reason(&self.name).cloned()
    }

    /// Capabilities granted by the server on the last attach
    pub fn modes(&self) -> Flags {
        let state = self.conn.lock("channel_modes");
        state.inner.channel_modes(&self.name).unwrap_or_default()
    }

    /// Replace the attach options, re-attaching if they changed while attached
    pub fn set_options(&self, options: ChannelOptions) {
        let mut state = self.conn.lock("set_options");
        state
            .inner
            .channel_with_options(Instant::now(), &self.name, options);
        state.wake();
    }

    /// Attach, connecting first if the client was never connected and `auto_connect` is set
    ///
    /// Resolves immediately if already attached.
    pub fn attach(&self) -> Completion {
        let name = &self.name;
        self.conn.submit("attach", |conn, now| conn.attach(now, name))
    }

    /// Detach; pending attaches fail
    pub fn detach(&self) -> Completion {
        let name = &self.name;
        self.conn.submit("detach", |conn, now| conn.detach(now, name))
    }

    /// Publish a single message
    ///
    /// Resolves once the server acknowledges it.
    pub fn publish(&self, name: &str, data: impl Into<serde_json::Value>) -> Completion {
        self.publish_batch(vec![Message::new(name, data)])
    }

    /// Publish messages as one unit, acknowledged together
    pub fn publish_batch(&self, messages: Vec<Message>) -> Completion {
        let name = &self.name;
        self.conn
            .submit("publish", |conn, now| conn.publish(now, name, messages))
    }

    /// Call `f` for state changes of this channel
    ///
    /// `state` restricts the listener to transitions into that state.
    pub fn on_state(
        &self,
        state: Option<ChannelState>,
        f: impl Fn(&ChannelStateChange) + Send + Sync + 'static,
    ) -> ListenerId {
        self.with_listeners("on_channel_state", |l| l.state.on(state, Arc::new(f)))
    }

    /// Like [`on_state`](Self::on_state), for the next matching change only
    pub fn once_state(
        &self,
        state: Option<ChannelState>,
        f: impl Fn(&ChannelStateChange) + Send + Sync + 'static,
    ) -> ListenerId {
        self.with_listeners("once_channel_state", |l| l.state.once(state, Arc::new(f)))
    }

    /// Call `f` for every message received, or only those called `name`
    ///
    /// Subscribing does not attach; call [`attach`](Self::attach) to start receiving.
    pub fn subscribe(
        &self,
        name: Option<&str>,
        f: impl Fn(&Message) + Send + Sync + 'static,
    ) -> ListenerId {
        let name = name.map(str::to_owned);
        self.with_listeners("subscribe", |l| l.messages.on(name, Arc::new(f)))
    }

    /// Remove a state, message or presence listener of this channel
    pub fn off(&self, id: ListenerId) -> bool {
        let mut state = self.conn.lock("channel_off");
        let Some(listeners) = state.channels.get_mut(&*self.name) else {
            return false;
        };
        let state_listener = listeners.state.off(id);
        let message_listener = listeners.messages.off(id);
        let presence_listener = listeners.presence.off(id);
        drop(state);
        state_listener.is_some() || message_listener.is_some() || presence_listener.is_some()
    }

    /// Presence set of this channel
    pub fn presence(&self) -> Presence {
        Presence {
            channel: self.clone(),
        }
    }

    fn with_listeners<R>(
        &self,
        purpose: &'static str,
        f: impl FnOnce(&mut ChannelListeners) -> R,
    ) -> R {
        let mut state = self.conn.lock(purpose);
        let listeners = state
            .channels
            .entry(self.name.to_string())
            .or_insert_with(ChannelListeners::new);
        f(listeners)
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel").field("name", &self.name).finish()
    }
}

/// Presence set of a [`Channel`]
#[derive(Debug, Clone)]
pub struct Presence {
    channel: Channel,
}

impl Presence {
    /// Enter as the connection's client id
    pub fn enter(&self, data: Option<serde_json::Value>) -> Completion {
        self.update_member(PresenceAction::Enter, None, data)
    }

    /// Update the data of the connection's client id
    pub fn update(&self, data: Option<serde_json::Value>) -> Completion {
        self.update_member(PresenceAction::Update, None, data)
    }

    /// Leave as the connection's client id
    pub fn leave(&self, data: Option<serde_json::Value>) -> Completion {
        self.update_member(PresenceAction::Leave, None, data)
    }

    /// Enter on behalf of `client_id`, as permitted by a wildcard credential
    pub fn enter_client(&self, client_id: &str, data: Option<serde_json::Value>) -> Completion {
        self.update_member(PresenceAction::Enter, Some(client_id), data)
    }

    /// Update on behalf of `client_id`
    pub fn update_client(&self, client_id: &str, data: Option<serde_json::Value>) -> Completion {
        self.update_member(PresenceAction::Update, Some(client_id), data)
    }

    /// Leave on behalf of `client_id`
    pub fn leave_client(&self, client_id: &str, data: Option<serde_json::Value>) -> Completion {
        self.update_member(PresenceAction::Leave, Some(client_id), data)
    }

    fn update_member(
        &self,
        action: PresenceAction,
        client_id: Option<&str>,
        data: Option<serde_json::Value>,
    ) -> Completion {
        let name = &self.channel.name;
        let client_id = client_id.map(str::to_owned);
        self.channel.conn.submit("presence", |conn, now| {
            conn.presence(now, name, action, client_id, data)
        })
    }

    /// Members currently present, as far as known
    pub fn members(&self) -> Vec<PresenceMessage> {
        let state = self.channel.conn.lock("presence_members");
        state.inner.presence_members(&self.channel.name)
    }

    /// Whether the member set reflects a completed server sync
    pub fn is_sync_complete(&self) -> bool {
        let state = self.channel.conn.lock("presence_sync_complete");
        state.inner.presence_sync_complete(&self.channel.name)
    }

    /// Call `f` for every presence event, or only those with `action`
    pub fn subscribe(
        &self,
        action: Option<PresenceAction>,
        f: impl Fn(&PresenceMessage) + Send + Sync + 'static,
    ) -> ListenerId {
        self.channel
            .with_listeners("presence_subscribe", |l| l.presence.on(action, Arc::new(f)))
    }
}

/// Listeners registered through the [`Channel`] handles of one name
#[derive(Debug)]
pub(crate) struct ChannelListeners {
    pub(crate) state: EventEmitter<ChannelState, ChannelStateChange>,
    pub(crate) messages: EventEmitter<String, Message>,
    pub(crate) presence: EventEmitter<PresenceAction, PresenceMessage>,
}

impl ChannelListeners {
    fn new() -> Self {
        Self {
            state: EventEmitter::new(),
            messages: EventEmitter::new(),
            presence: EventEmitter::new(),
        }
    }
}
