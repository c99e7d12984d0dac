use std::{
    io::{self, Write},
    str,
    sync::Arc,
    time::{Duration, Instant},
};

use tracing_subscriber::EnvFilter;

use super::*;

/// A [`Connection`] wired to a scripted server
///
/// Transmits are drained eagerly: credentials are answered from `credential`, transports open
/// immediately and sent messages are recorded for inspection.
pub(super) struct Client {
    pub(super) conn: Connection,
    pub(super) time: Instant,
    /// Answer to hand out on `Authorize`; `None` leaves the request pending
    pub(super) credential: Option<Result<Credential, AuthFailure>>,
    pub(super) transport: Option<TransportId>,
    pub(super) opened: Vec<ConnectRequest>,
    pub(super) closed: Vec<TransportId>,
    pub(super) sent: Vec<ProtocolMessage>,
    pub(super) events: Vec<Event>,
    pub(super) auth_requests: usize,
}

impl Client {
    pub(super) fn new(mut config: ClientConfig) -> Self {
        config.rng_seed(Some([7; 32]));
        Self {
            conn: Connection::new(Arc::new(config)),
            time: Instant::now(),
            credential: Some(Ok(Credential::new("token"))),
            transport: None,
            opened: Vec::new(),
            closed: Vec::new(),
            sent: Vec::new(),
            events: Vec::new(),
            auth_requests: 0,
        }
    }

    /// Perform all pending I/O
    pub(super) fn drive(&mut self) {
        while let Some(transmit) = self.conn.poll_transmit() {
            match transmit {
                Transmit::Authorize => {
                    self.auth_requests += 1;
                    if let Some(answer) = self.credential.clone() {
                        self.conn.handle_credential(self.time, answer);
                    }
                }
                Transmit::Open(request) => {
                    trace!(host = %request.host, "open");
                    self.transport = Some(request.transport);
                    self.conn.on_transport_open(self.time, request.transport);
                    self.opened.push(request);
                }
                Transmit::Send(msg) => self.sent.push(msg),
                Transmit::Close(id) => {
                    self.closed.push(id);
                    if self.transport == Some(id) {
                        self.transport = None;
                    }
                }
            }
        }
        while let Some(event) = self.conn.poll() {
            self.events.push(event);
        }
    }

    pub(super) fn connect(&mut self) {
        self.conn.connect(self.time);
        self.drive();
    }

    /// Connect and complete the handshake as `conn-1`
    pub(super) fn connected(&mut self) -> &mut Self {
        self.connect();
        self.server(connected("conn-1", "key-1"));
        assert_eq!(self.conn.state(), ConnectionState::Connected);
        self
    }

    /// Deliver `msg` on the current transport
    pub(super) fn server(&mut self, msg: ProtocolMessage) {
        let transport = self.transport.expect("no open transport");
        self.conn.on_transport_message(self.time, transport, msg);
        self.drive();
    }

    pub(super) fn advance(&mut self, by: Duration) {
        self.time += by;
        self.conn.handle_timeout(self.time);
        self.drive();
    }

    /// Advance to the next deadline and process it
    pub(super) fn step(&mut self) -> bool {
        let Some(deadline) = self.conn.poll_timeout() else {
            return false;
        };
        self.time = self.time.max(deadline);
        self.conn.handle_timeout(self.time);
        self.drive();
        true
    }

    /// The transport closes under the connection
    pub(super) fn drop_transport(&mut self) {
        let transport = self.transport.take().expect("no open transport");
        self.conn.on_transport_closed(self.time, transport, None);
        self.drive();
    }

    /// The transport fails to open or breaks
    pub(super) fn fail_transport(&mut self) {
        let transport = self.transport.take().expect("no open transport");
        let error = ErrorInfo::new(80000, 0, "connection refused");
        self.conn.on_transport_error(self.time, transport, error);
        self.drive();
    }

    pub(super) fn attach(&mut self, channel: &str) -> OpId {
        let op = self.conn.attach(self.time, channel);
        self.drive();
        op
    }

    pub(super) fn publish(&mut self, channel: &str, name: &str) -> OpId {
        let message = Message::new(name, serde_json::json!({ "n": name }));
        let op = self.conn.publish(self.time, channel, vec![message]);
        self.drive();
        op
    }

    /// Attach `channel` and let the server confirm it
    pub(super) fn attached(&mut self, channel: &str, flags: Flags) -> OpId {
        let op = self.attach(channel);
        self.server(attached(channel, flags));
        assert_eq!(self.outcome(op), Some(Ok(())));
        op
    }

    pub(super) fn ack(&mut self, serial: u64, count: u64) {
        self.server(ack(Action::Ack, serial, count));
    }

    pub(super) fn take_sent(&mut self) -> Vec<ProtocolMessage> {
        std::mem::take(&mut self.sent)
    }

    pub(super) fn sent_actions(&self) -> Vec<Action> {
        self.sent.iter().map(|m| m.action).collect()
    }

    /// Outcome reported for `op`, asserting it was reported at most once
    pub(super) fn outcome(&self, op: OpId) -> Option<Result<(), Error>> {
        let mut results = self.events.iter().filter_map(|e| match e {
            Event::Completed { op: x, result } if *x == op => Some(result.clone()),
            _ => None,
        });
        let first = results.next();
        assert!(results.next().is_none(), "{op:?} completed twice");
        first
    }

    /// Operations in the order they completed
    pub(super) fn completed(&self) -> Vec<OpId> {
        self.events
            .iter()
            .filter_map(|e| match e {
                Event::Completed { op, .. } => Some(*op),
                _ => None,
            })
            .collect()
    }

    pub(super) fn connection_states(&self) -> Vec<ConnectionState> {
        self.events
            .iter()
            .filter_map(|e| match e {
                Event::ConnectionStateChanged(change) => Some(change.current),
                _ => None,
            })
            .collect()
    }

    pub(super) fn channel_states(&self, name: &str) -> Vec<ChannelState> {
        self.events
            .iter()
            .filter_map(|e| match e {
                Event::ChannelStateChanged { channel, change } if channel == name => {
                    Some(change.current)
                }
                _ => None,
            })
            .collect()
    }

    pub(super) fn presence_events(&self, name: &str) -> Vec<(PresenceAction, String)> {
        self.events
            .iter()
            .filter_map(|e| match e {
                Event::Presence { channel, message } if channel == name => {
                    Some((message.action, message.client_id.clone()))
                }
                _ => None,
            })
            .collect()
    }
}

pub(super) fn connected(id: &str, key: &str) -> ProtocolMessage {
    let mut msg = ProtocolMessage::new(Action::Connected);
    msg.connection_id = Some(id.into());
    msg.connection_details = Some(ConnectionDetails {
        connection_key: Some(key.into()),
        max_idle_interval: Some(15_000),
        connection_state_ttl: Some(120_000),
        ..ConnectionDetails::default()
    });
    msg
}

pub(super) fn attached(channel: &str, flags: Flags) -> ProtocolMessage {
    let mut msg = ProtocolMessage::for_channel(Action::Attached, channel);
    msg.flags = flags;
    msg.channel_serial = Some(format!("{channel}-serial"));
    msg
}

pub(super) fn ack(action: Action, serial: u64, count: u64) -> ProtocolMessage {
    let mut msg = ProtocolMessage::new(action);
    msg.msg_serial = Some(serial);
    msg.count = Some(count);
    msg
}

pub(super) fn member(client: &str, serial: u64) -> PresenceMessage {
    PresenceMessage {
        action: PresenceAction::Present,
        id: Some(format!("conn-2:{serial}:0")),
        client_id: client.into(),
        connection_id: "conn-2".into(),
        data: Some(serde_json::json!(serial)),
        ..PresenceMessage::default()
    }
}

pub(super) fn sync(channel: &str, cursor: &str, members: Vec<PresenceMessage>) -> ProtocolMessage {
    let mut msg = ProtocolMessage::for_channel(Action::Sync, channel);
    msg.channel_serial = Some(format!("1:{cursor}"));
    msg.presence = members;
    msg
}

pub(super) fn subscribe() -> tracing::subscriber::DefaultGuard {
    let sub = tracing_subscriber::FmtSubscriber::builder()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(|| TestWriter)
        .finish();
    tracing::subscriber::set_default(sub)
}

struct TestWriter;

impl Write for TestWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        print!(
            "{}",
            str::from_utf8(buf).expect("tried to log invalid UTF-8")
        );
        Ok(buf.len())
    }
    fn flush(&mut self) -> io::Result<()> {
        io::stdout().flush()
    }
}
