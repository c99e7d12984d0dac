use std::time::Duration;

use tracing::trace;

use crate::{
    error::codes,
    protocol::ConnectionDetails,
    Action, AuthFailure, ChannelState, ClientConfig, ConnectRequest, Connection, ConnectionState,
    Credential, Error, ErrorInfo, Event, Flags, Message, OpId, PresenceAction, PresenceMessage,
    ProtocolMessage, Transmit, TransportId,
};

mod util;
use util::*;

fn messages(sent: &[ProtocolMessage]) -> Vec<u64> {
    sent.iter()
        .filter(|m| m.action == Action::Message)
        .filter_map(|m| m.msg_serial)
        .collect()
}

#[test]
fn publish_acknowledged() {
    let _guard = subscribe();
    let mut client = Client::new(ClientConfig::default());
    client.connected();
    assert_eq!(client.opened[0].host, "realtime.ably.io");
    assert_eq!(
        client.opened[0].params.get("accessToken").map(String::as_str),
        Some("token")
    );
    assert_eq!(client.conn.id(), Some("conn-1"));
    assert_eq!(client.conn.key(), Some("key-1"));
    assert_eq!(
        client.connection_states(),
        [ConnectionState::Connecting, ConnectionState::Connected]
    );

    client.attached("room", Flags::empty());
    let op = client.publish("room", "greeting");
    let sent = client.take_sent();
    assert_eq!(
        sent.iter().map(|m| m.action).collect::<Vec<_>>(),
        [Action::Attach, Action::Message]
    );
    assert_eq!(sent[1].msg_serial, Some(0));
    assert_eq!(client.outcome(op), None);

    client.ack(0, 1);
    assert_eq!(client.outcome(op), Some(Ok(())));
    assert_eq!(client.conn.pending_messages(), 0);
}

#[test]
fn acks_resolve_in_serial_order() {
    let _guard = subscribe();
    let mut client = Client::new(ClientConfig::default());
    client.connected();
    let attach = client.attached("room", Flags::empty());
    let ops = (0..4)
        .map(|i| client.publish("room", &format!("m{i}")))
        .collect::<Vec<_>>();
    assert_eq!(messages(&client.take_sent()), [0, 1, 2, 3]);

    client.ack(0, 2);
    client.server(ack(Action::Nack, 2, 2));

    let mut expected = vec![attach];
    expected.extend(&ops);
    assert_eq!(client.completed(), expected);
    assert_eq!(client.outcome(ops[1]), Some(Ok(())));
    assert!(matches!(client.outcome(ops[2]), Some(Err(Error::Nack(_)))));
    assert!(matches!(client.outcome(ops[3]), Some(Err(Error::Nack(_)))));
}

#[test]
fn duplicate_ack_is_noop() {
    let _guard = subscribe();
    let mut client = Client::new(ClientConfig::default());
    client.connected();
    client.attached("room", Flags::empty());
    let op = client.publish("room", "once");
    client.ack(0, 1);
    client.ack(0, 1);
    // `outcome` asserts a single completion
    assert_eq!(client.outcome(op), Some(Ok(())));
    assert_eq!(client.conn.state(), ConnectionState::Connected);
}

#[test]
fn ack_for_unassigned_serial_disconnects() {
    let _guard = subscribe();
    let mut client = Client::new(ClientConfig::default());
    client.connected();
    client.attached("room", Flags::empty());
    let op = client.publish("room", "m");
    client.ack(0, 3);
    assert_eq!(client.conn.state(), ConnectionState::Disconnected);
    assert_eq!(
        client.conn.error_reason().map(|e| e.code),
        Some(codes::PROTOCOL_ERROR)
    );
    assert_eq!(client.outcome(op), None);
    assert_eq!(client.conn.pending_messages(), 1);
    assert_eq!(client.closed, [TransportId(0)]);
}

#[test]
fn attach_while_disconnected_fires_once() {
    let _guard = subscribe();
    let mut client = Client::new(ClientConfig::default());
    client.connected();
    client.drop_transport();
    assert_eq!(client.conn.state(), ConnectionState::Disconnected);

    let op = client.attach("room");
    assert_eq!(client.conn.channel_state("room"), Some(ChannelState::Attaching));
    assert!(client.sent.is_empty());

    // First retry after losing a connection is immediate
    client.advance(Duration::ZERO);
    assert_eq!(client.opened.len(), 2);
    assert_eq!(
        client.opened[1].params.get("resume").map(String::as_str),
        Some("key-1")
    );
    client.server(connected("conn-1", "key-1"));
    assert_eq!(client.sent_actions(), [Action::Attach]);

    client.server(attached("room", Flags::empty()));
    assert_eq!(client.outcome(op), Some(Ok(())));
    assert_eq!(client.sent_actions(), [Action::Attach]);
}

#[test]
fn attach_connects_initialized_connection() {
    let _guard = subscribe();
    let mut client = Client::new(ClientConfig::default());
    let op = client.attach("room");
    assert_eq!(client.conn.state(), ConnectionState::Connecting);
    assert_eq!(client.opened.len(), 1);
    assert_eq!(client.outcome(op), None);

    client.server(connected("conn-1", "key-1"));
    assert_eq!(client.sent_actions(), [Action::Attach]);
    client.server(attached("room", Flags::empty()));
    assert_eq!(client.outcome(op), Some(Ok(())));
}

#[test]
fn attach_without_auto_connect_waits_for_connect() {
    let _guard = subscribe();
    let mut config = ClientConfig::default();
    config.auto_connect(false);
    let mut client = Client::new(config);
    let op = client.attach("room");
    assert_eq!(client.conn.state(), ConnectionState::Initialized);
    assert!(client.opened.is_empty());

    client.connected();
    assert_eq!(client.sent_actions(), [Action::Attach]);
    client.server(attached("room", Flags::empty()));
    assert_eq!(client.outcome(op), Some(Ok(())));
}

#[test]
fn resume_replays_unconfirmed() {
    let _guard = subscribe();
    let mut client = Client::new(ClientConfig::default());
    client.connected();
    client.attached("room", Flags::empty());
    let ops = ["a", "b", "c"].map(|name| client.publish("room", name));
    client.ack(0, 1);
    client.take_sent();

    client.drop_transport();
    client.advance(Duration::ZERO);
    let mut resumed = connected("conn-1", "key-1");
    resumed.flags = Flags::RESUMED;
    resumed.msg_serial = Some(1);
    client.server(resumed);

    // Serial 1 reached the server; only serial 2 is sent again
    assert_eq!(messages(&client.take_sent()), [2]);
    assert_eq!(client.outcome(ops[1]), None);

    client.ack(1, 2);
    assert_eq!(client.completed()[1..], ops);
    assert!(ops.iter().all(|&op| client.outcome(op) == Some(Ok(()))));
}

#[test]
fn unresumable_reconnect_fails_unacknowledged() {
    let _guard = subscribe();
    let mut client = Client::new(ClientConfig::default());
    client.connected();
    client.attached("room", Flags::empty());
    let ops = ["m1", "m2", "m3"].map(|name| client.publish("room", name));
    client.ack(0, 2);
    client.drop_transport();
    client.advance(Duration::ZERO);

    // New connection id, no RESUMED flag: the server lost our state
    client.server(connected("conn-2", "key-2"));
    assert_eq!(client.outcome(ops[0]), Some(Ok(())));
    assert_eq!(client.outcome(ops[1]), Some(Ok(())));
    let Some(Err(err)) = client.outcome(ops[2]) else {
        panic!("m3 not failed");
    };
    assert!(matches!(err, Error::NotResumable(_)));
    assert!(err.is_retryable());
    assert_eq!(client.conn.pending_messages(), 0);

    // Re-published message starts the new connection's serial sequence
    client.take_sent();
    let again = client.publish("room", "m3");
    client.server(attached("room", Flags::empty()));
    assert_eq!(messages(&client.take_sent()), [0]);
    client.ack(0, 1);
    assert_eq!(client.outcome(again), Some(Ok(())));
}

#[test]
fn retry_count_suspends_and_attach_completes_after_reconnect() {
    let _guard = subscribe();
    let mut config = ClientConfig::default();
    config.http_max_retry_duration(Duration::from_secs(3600));
    let mut client = Client::new(config);
    client.connect();
    for _ in 0..2 {
        client.fail_transport();
        assert_eq!(client.conn.state(), ConnectionState::Disconnected);
        client.advance(Duration::from_secs(15));
        assert_eq!(client.conn.state(), ConnectionState::Connecting);
    }
    client.fail_transport();
    assert_eq!(client.conn.state(), ConnectionState::Suspended);
    let suspended = client.events.iter().rev().find_map(|e| match e {
        Event::ConnectionStateChanged(change) => Some(change.clone()),
        _ => None,
    });
    assert_eq!(
        suspended.and_then(|c| c.retry_in),
        Some(Duration::from_secs(30))
    );

    // Primary first, then distinct fallbacks
    let hosts = client
        .opened
        .iter()
        .map(|r| r.host.as_str())
        .collect::<Vec<_>>();
    assert_eq!(hosts[0], "realtime.ably.io");
    assert!(hosts[1..].iter().all(|h| h.ends_with(".ably-realtime.com")));
    assert_ne!(hosts[1], hosts[2]);

    let op = client.attach("room");
    assert_eq!(client.conn.channel_state("room"), Some(ChannelState::Attaching));
    client.advance(Duration::from_secs(30));
    assert_eq!(client.conn.state(), ConnectionState::Connecting);
    client.server(connected("conn-1", "key-1"));
    assert_eq!(client.sent_actions(), [Action::Attach]);
    client.server(attached("room", Flags::empty()));
    assert_eq!(client.outcome(op), Some(Ok(())));
    assert_eq!(
        client.channel_states("room"),
        [ChannelState::Attaching, ChannelState::Attached]
    );
}

#[test]
fn retry_duration_suspends_independently_of_count() {
    let _guard = subscribe();
    let mut config = ClientConfig::default();
    config
        .http_max_retry_count(100)
        .http_max_retry_duration(Duration::from_secs(20));
    let mut client = Client::new(config);
    client.connect();
    client.fail_transport();
    assert_eq!(client.conn.state(), ConnectionState::Disconnected);
    client.advance(Duration::from_secs(15));
    client.fail_transport();
    assert_eq!(client.conn.state(), ConnectionState::Disconnected);
    client.advance(Duration::from_secs(15));
    client.fail_transport();
    assert_eq!(client.conn.state(), ConnectionState::Suspended);
}

#[test]
fn connect_timeout() {
    let _guard = subscribe();
    let mut client = Client::new(ClientConfig::default());
    client.connect();
    client.advance(Duration::from_secs(10));
    assert_eq!(client.conn.state(), ConnectionState::Disconnected);
    assert_eq!(
        client.conn.error_reason().map(|e| e.code),
        Some(codes::CONNECTION_TIMED_OUT)
    );
    assert_eq!(client.closed, [TransportId(0)]);
}

#[test]
fn idle_transport_disconnects() {
    let _guard = subscribe();
    let mut client = Client::new(ClientConfig::default());
    client.connected();
    client.advance(Duration::from_secs(20));
    client.server(ProtocolMessage::new(Action::Heartbeat));
    client.advance(Duration::from_secs(20));
    assert_eq!(client.conn.state(), ConnectionState::Connected);
    client.advance(Duration::from_secs(5));
    assert_eq!(client.conn.state(), ConnectionState::Disconnected);
}

#[test]
fn state_ttl_discards_connection_key() {
    let _guard = subscribe();
    let mut config = ClientConfig::default();
    config
        .http_max_retry_count(100)
        .http_max_retry_duration(Duration::from_secs(3600));
    let mut client = Client::new(config);
    client.connected();
    client.drop_transport();
    while client.conn.state() != ConnectionState::Suspended {
        assert!(client.step());
        if client.transport.is_some() {
            client.fail_transport();
        }
    }
    assert_eq!(client.conn.key(), None);
    assert_eq!(
        client.conn.error_reason().map(|e| e.code),
        Some(codes::CONNECTION_SUSPENDED)
    );

    assert!(client.step());
    let last = client.opened.last().unwrap();
    assert!(!last.params.contains_key("resume"));
}

#[test]
fn close_fails_outstanding_work() {
    let _guard = subscribe();
    let mut client = Client::new(ClientConfig::default());
    client.connected();
    client.attached("room", Flags::empty());
    let op = client.publish("room", "unacked");
    client.conn.close(client.time);
    client.drive();
    assert_eq!(client.conn.state(), ConnectionState::Closing);
    assert_eq!(client.sent.last().map(|m| m.action), Some(Action::Close));

    client.server(ProtocolMessage::new(Action::Closed));
    assert_eq!(client.conn.state(), ConnectionState::Closed);
    assert!(matches!(client.outcome(op), Some(Err(Error::Cancelled(_)))));
    assert_eq!(client.conn.channel_state("room"), Some(ChannelState::Detached));
    assert_eq!(client.conn.poll_timeout(), None);
    assert_eq!(client.conn.key(), None);
}

#[test]
fn close_without_server_response() {
    let _guard = subscribe();
    let mut client = Client::new(ClientConfig::default());
    client.connected();
    client.conn.close(client.time);
    client.drive();
    client.advance(Duration::from_secs(10));
    assert_eq!(client.conn.state(), ConnectionState::Closed);
    assert_eq!(client.closed, [TransportId(0)]);
}

#[test]
fn close_while_disconnected_is_immediate() {
    let _guard = subscribe();
    let mut client = Client::new(ClientConfig::default());
    client.connect();
    client.fail_transport();
    let op = client.attach("room");
    client.conn.close(client.time);
    client.drive();
    assert_eq!(
        client.connection_states()[2..],
        [ConnectionState::Closing, ConnectionState::Closed]
    );
    assert!(matches!(client.outcome(op), Some(Err(Error::Cancelled(_)))));
    assert_eq!(client.conn.poll_timeout(), None);

    // A closed connection can be reopened
    client.connect();
    assert_eq!(client.conn.state(), ConnectionState::Connecting);
}

#[test]
fn credential_failure_fails_connection() {
    let _guard = subscribe();
    let mut client = Client::new(ClientConfig::default());
    client.credential = Some(Err(AuthFailure::new("no token for you")));
    client.connect();
    assert_eq!(client.conn.state(), ConnectionState::Failed);
    assert!(client.opened.is_empty());
    assert_eq!(
        client.conn.error_reason().map(|e| e.code),
        Some(codes::CLIENT_AUTH_FAILED)
    );

    let op = client.publish("room", "late");
    assert!(matches!(
        client.outcome(op),
        Some(Err(Error::ChannelInactive(_)))
    ));
}

#[test]
fn token_error_renews_credential_once() {
    let _guard = subscribe();
    let mut client = Client::new(ClientConfig::default());
    client.connect();
    assert_eq!(client.auth_requests, 1);

    let mut rejected = ProtocolMessage::new(Action::Error);
    rejected.error = Some(ErrorInfo::new(codes::TOKEN_EXPIRED, 401, "token expired"));
    client.server(rejected.clone());
    assert_eq!(client.conn.state(), ConnectionState::Connecting);
    assert_eq!(client.auth_requests, 2);
    assert_eq!(client.opened.len(), 2);

    client.server(rejected);
    assert_eq!(client.conn.state(), ConnectionState::Failed);
    assert_eq!(
        client.conn.error_reason().map(|e| e.code),
        Some(codes::TOKEN_EXPIRED)
    );
}

#[test]
fn pending_credential_delays_transport() {
    let _guard = subscribe();
    let mut client = Client::new(ClientConfig::default());
    client.credential = None;
    client.connect();
    assert_eq!(client.auth_requests, 1);
    assert!(client.opened.is_empty());

    client
        .conn
        .handle_credential(client.time, Ok(Credential::new("late")));
    client.drive();
    assert_eq!(
        client.opened[0].params.get("accessToken").map(String::as_str),
        Some("late")
    );
}

#[test]
fn ping_round_trip_and_timeout() {
    let _guard = subscribe();
    let mut client = Client::new(ClientConfig::default());
    client.connected();
    let op = client.conn.ping(client.time);
    client.drive();
    let heartbeat = client.take_sent().pop().unwrap();
    assert_eq!(heartbeat.action, Action::Heartbeat);
    let mut echo = ProtocolMessage::new(Action::Heartbeat);
    echo.id = heartbeat.id;
    client.server(echo);
    assert_eq!(client.outcome(op), Some(Ok(())));

    let lost = client.conn.ping(client.time);
    client.drive();
    client.advance(Duration::from_secs(10));
    assert!(matches!(client.outcome(lost), Some(Err(Error::Timeout(_)))));
}

#[test]
fn two_page_presence_sync() {
    let _guard = subscribe();
    let mut client = Client::new(ClientConfig::default());
    client.connected();
    client.attached("room", Flags::HAS_PRESENCE);
    assert!(!client.conn.presence_sync_complete("room"));

    client.server(sync("room", "page2", vec![member("A", 1), member("B", 2)]));
    assert!(!client.conn.presence_sync_complete("room"));
    assert!(client.conn.presence_members("room").is_empty());

    client.server(sync("room", "", vec![member("B", 3), member("C", 4)]));
    assert!(client.conn.presence_sync_complete("room"));
    let members = client.conn.presence_members("room");
    assert_eq!(
        members.iter().map(|m| m.client_id.as_str()).collect::<Vec<_>>(),
        ["A", "B", "C"]
    );
    assert_eq!(members[1].data, Some(serde_json::json!(3)));
    assert_eq!(client.presence_events("room").len(), 3);
}

#[test]
fn leave_during_resync_reported_once() {
    let _guard = subscribe();
    let mut client = Client::new(ClientConfig::default());
    client.connected();
    client.attached("room", Flags::HAS_PRESENCE);
    client.server(sync("room", "", vec![member("A", 1)]));

    client.server(attached("room", Flags::HAS_PRESENCE));
    let mut leave = ProtocolMessage::for_channel(Action::Presence, "room");
    leave.presence = vec![PresenceMessage {
        action: PresenceAction::Leave,
        ..member("A", 2)
    }];
    client.server(leave);
    assert_eq!(client.presence_events("room").len(), 1);

    client.server(sync("room", "", vec![]));
    assert_eq!(
        client.presence_events("room"),
        [
            (PresenceAction::Present, "A".to_owned()),
            (PresenceAction::Leave, "A".to_owned()),
        ]
    );
    assert!(client.conn.presence_members("room").is_empty());
}

#[test]
fn enter_during_sync_reported_once() {
    let _guard = subscribe();
    let mut client = Client::new(ClientConfig::default());
    client.connected();
    client.attached("room", Flags::HAS_PRESENCE);

    let mut enter = ProtocolMessage::for_channel(Action::Presence, "room");
    enter.presence = vec![PresenceMessage {
        action: PresenceAction::Enter,
        ..member("B", 1)
    }];
    client.server(enter);
    assert!(client.presence_events("room").is_empty());

    client.server(sync("room", "", vec![]));
    assert_eq!(
        client.presence_events("room"),
        [(PresenceAction::Enter, "B".to_owned())]
    );
    assert_eq!(client.conn.presence_members("room").len(), 1);
}

#[test]
fn presence_enter_waits_for_sync() {
    let _guard = subscribe();
    let mut config = ClientConfig::default();
    config.client_id(Some("me".into()));
    let mut client = Client::new(config);
    client.connected();
    client.attached("room", Flags::HAS_PRESENCE);
    client.take_sent();

    let op = client
        .conn
        .presence(client.time, "room", PresenceAction::Enter, None, None);
    client.drive();
    assert!(client.sent.is_empty());

    client.server(sync("room", "", vec![member("A", 1)]));
    let sent = client.take_sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].action, Action::Presence);
    assert_eq!(sent[0].presence[0].client_id, "me");
    assert_eq!(sent[0].msg_serial, Some(0));
    client.ack(0, 1);
    assert_eq!(client.outcome(op), Some(Ok(())));
}

#[test]
fn presence_requires_client_id() {
    let _guard = subscribe();
    let mut client = Client::new(ClientConfig::default());
    client.connected();
    let op = client
        .conn
        .presence(client.time, "room", PresenceAction::Enter, None, None);
    client.drive();
    let Some(Err(Error::Invalid(info))) = client.outcome(op) else {
        panic!("presence without client id accepted");
    };
    assert_eq!(info.code, codes::CLIENT_ID_REQUIRED);
}

#[test]
fn channel_error_fails_channel_and_queued_work() {
    let _guard = subscribe();
    let mut client = Client::new(ClientConfig::default());
    client.connected();
    let queued = client.publish("room", "early");
    assert_eq!(client.conn.channel_state("room"), Some(ChannelState::Attaching));

    let mut denied = ProtocolMessage::for_channel(Action::Error, "room");
    denied.error = Some(ErrorInfo::new(
        codes::PERMISSION_DENIED,
        401,
        "permission denied",
    ));
    client.server(denied);
    assert_eq!(client.conn.channel_state("room"), Some(ChannelState::Failed));
    let Some(Err(err)) = client.outcome(queued) else {
        panic!("queued publish not failed");
    };
    assert!(!err.is_retryable());

    let late = client.publish("room", "late");
    let Some(Err(Error::ChannelInactive(info))) = client.outcome(late) else {
        panic!("publish on failed channel accepted");
    };
    assert_eq!(info.code, codes::PERMISSION_DENIED);
    // The connection is unaffected
    assert_eq!(client.conn.state(), ConnectionState::Connected);
}

#[test]
fn server_detach_suspends_and_retries() {
    let _guard = subscribe();
    let mut client = Client::new(ClientConfig::default());
    client.connected();
    client.attached("room", Flags::empty());
    client.take_sent();

    let mut detached = ProtocolMessage::for_channel(Action::Detached, "room");
    detached.error = Some(ErrorInfo::new(codes::CHANNEL_OPERATION_FAILED, 500, "moved"));
    client.server(detached);
    assert_eq!(client.conn.channel_state("room"), Some(ChannelState::Suspended));
    assert!(client.sent.is_empty());

    client.advance(Duration::from_secs(15));
    assert_eq!(client.conn.channel_state("room"), Some(ChannelState::Attaching));
    let attach = client.take_sent().pop().unwrap();
    assert_eq!(attach.action, Action::Attach);
    assert!(attach.flags.contains(Flags::ATTACH_RESUME));
    assert_eq!(attach.channel_serial.as_deref(), Some("room-serial"));
}

#[test]
fn attach_timeout_suspends_channel() {
    let _guard = subscribe();
    let mut client = Client::new(ClientConfig::default());
    client.connected();
    let op = client.attach("room");
    client.advance(Duration::from_secs(10));
    assert!(matches!(client.outcome(op), Some(Err(Error::Timeout(_)))));
    assert_eq!(client.conn.channel_state("room"), Some(ChannelState::Suspended));
}

#[test]
fn release_detaches_and_forgets() {
    let _guard = subscribe();
    let mut client = Client::new(ClientConfig::default());
    client.connected();
    client.attached("room", Flags::empty());
    client.take_sent();

    client.conn.release(client.time, "room");
    client.drive();
    assert_eq!(client.sent_actions(), [Action::Detach]);
    assert!(client.conn.channel_exists("room"));

    client.server(ProtocolMessage::for_channel(Action::Detached, "room"));
    assert!(!client.conn.channel_exists("room"));
    assert_eq!(client.conn.channel_names().count(), 0);
}

#[test]
fn same_name_same_channel() {
    let mut client = Client::new(ClientConfig::default());
    client.conn.channel(client.time, "room");
    client.conn.channel(client.time, "room");
    client.conn.channel(client.time, "other");
    let mut names = client.conn.channel_names().collect::<Vec<_>>();
    names.sort_unstable();
    assert_eq!(names, ["other", "room"]);
}

#[test]
fn cancel_before_serial_assignment() {
    let _guard = subscribe();
    let mut client = Client::new(ClientConfig::default());
    client.connected();
    let op = client.publish("room", "maybe");
    assert!(client.conn.cancel(op));
    client.drive();
    assert!(matches!(client.outcome(op), Some(Err(Error::Cancelled(_)))));
    assert!(!client.conn.cancel(op));

    // Assigned serials cannot be withdrawn
    client.server(attached("room", Flags::empty()));
    let sent = client.publish("room", "definitely");
    assert!(!client.conn.cancel(sent));
}

#[test]
fn queueing_disabled_fails_fast() {
    let _guard = subscribe();
    let mut config = ClientConfig::default();
    config.queue_messages(false);
    let mut client = Client::new(config);
    client.connected();
    let op = client.publish("room", "m");
    assert!(matches!(
        client.outcome(op),
        Some(Err(Error::ChannelInactive(_)))
    ));
}

#[test]
fn oversized_publish_rejected() {
    let _guard = subscribe();
    let mut config = ClientConfig::default();
    config.max_message_size(8);
    let mut client = Client::new(config);
    client.connected();
    let op = client.publish("room", "far too long for the limit");
    let Some(Err(Error::Invalid(info))) = client.outcome(op) else {
        panic!("oversized message accepted");
    };
    assert_eq!(info.code, codes::MAX_MESSAGE_SIZE_EXCEEDED);
}

#[test]
fn idempotent_ids_share_a_base() {
    let mut client = Client::new(ClientConfig::default());
    client.connected();
    client.attached("room", Flags::empty());
    client.take_sent();
    let batch = vec![Message::new("a", 1), Message::new("b", 2)];
    client.conn.publish(client.time, "room", batch);
    client.drive();
    let sent = client.take_sent();
    let ids = sent[0]
        .messages
        .iter()
        .map(|m| m.id.clone().unwrap())
        .collect::<Vec<_>>();
    let (base, index) = ids[0].split_once(':').unwrap();
    assert_eq!(index, "0");
    assert_eq!(ids[1], format!("{base}:1"));
}

#[test]
fn received_messages_inherit_envelope() {
    let mut client = Client::new(ClientConfig::default());
    client.connected();
    client.attached("room", Flags::empty());
    let mut msg = ProtocolMessage::for_channel(Action::Message, "room");
    msg.id = Some("conn-9:4".into());
    msg.connection_id = Some("conn-9".into());
    msg.timestamp = Some(1234);
    msg.messages = vec![Message::new("x", "y")];
    client.server(msg);
    let received = client.events.iter().find_map(|e| match e {
        Event::Message { channel, message } if channel == "room" => Some(message.clone()),
        _ => None,
    });
    let received = received.unwrap();
    assert_eq!(received.id.as_deref(), Some("conn-9:4:0"));
    assert_eq!(received.connection_id.as_deref(), Some("conn-9"));
    assert_eq!(received.timestamp, Some(1234));
}

#[test]
fn recovery_key_continues_connection() {
    let _guard = subscribe();
    let mut client = Client::new(ClientConfig::default());
    client.connected();
    client.attached("room", Flags::empty());
    client.publish("room", "m");
    client.ack(0, 1);
    let key = client.conn.recovery_key().unwrap();

    let mut config = ClientConfig::default();
    config.recover(Some(key));
    assert_eq!(config.validate(), Ok(()));
    let mut recovered = Client::new(config);
    recovered.connect();
    assert_eq!(
        recovered.opened[0].params.get("recover").map(String::as_str),
        Some("key-1")
    );
    recovered.server(connected("conn-1", "key-3"));
    assert_eq!(recovered.conn.key(), Some("key-3"));

    recovered.attach("room");
    let attach = recovered.take_sent().pop().unwrap();
    assert_eq!(attach.channel_serial.as_deref(), Some("room-serial"));
    assert!(attach.flags.contains(Flags::ATTACH_RESUME));
    recovered.server(attached("room", Flags::RESUMED));
    recovered.publish("room", "next");
    assert_eq!(messages(&recovered.take_sent()), [1]);
}

#[test]
fn connection_details_applied() {
    let mut client = Client::new(ClientConfig::default());
    client.connect();
    let mut msg = connected("conn-1", "key-1");
    if let Some(details) = msg.connection_details.as_mut() {
        details.client_id = Some("assigned".into());
        details.max_message_size = Some(1024);
        details.max_idle_interval = Some(5_000);
    }
    client.server(msg);
    assert_eq!(client.conn.client_id(), Some("assigned"));
    assert_eq!(client.conn.max_message_size(), 1024);
    assert_eq!(client.conn.max_idle_interval(), Duration::from_secs(5));
}

#[test]
fn stale_transport_ignored() {
    let mut client = Client::new(ClientConfig::default());
    client.connect();
    client.fail_transport();
    client.conn.on_transport_message(
        client.time,
        TransportId(0),
        connected("conn-1", "key-1"),
    );
    client.drive();
    assert_eq!(client.conn.state(), ConnectionState::Disconnected);
}
