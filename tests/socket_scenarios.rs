//! End-to-end scenarios over loopback sockets.
//!
//! Every test binds to port 0 and reads the real address back, but they still
//! run serially so timing-sensitive assertions do not compete for the CPU.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::net::{SocketAddr, TcpListener, UdpSocket};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use msgwire::config::NetworkConfig;
use msgwire::protocol::Dispatcher;
use msgwire::transport::{
    CloseReason, ConnectionHandle, ConnectionListener, MessageListener, Reactor, Status,
};
use msgwire::utils::logging::init_test_logging;
use msgwire::{wire_fields, Capabilities, Envelope, MessageType, ProtocolError, TypeRegistry};
use serial_test::serial;

const WAIT: Duration = Duration::from_secs(5);

#[derive(Debug, Default, Clone, PartialEq)]
struct Chat {
    from: String,
    text: String,
}
wire_fields!(Chat { from, text });

impl MessageType for Chat {
    const NAME: &'static str = "scenarios.Chat";
}

#[derive(Debug, Default, Clone, PartialEq)]
struct Receipt {
    order: u32,
}
wire_fields!(Receipt { order });

impl MessageType for Receipt {
    const NAME: &'static str = "scenarios.Receipt";
    const CAPABILITIES: Capabilities = Capabilities::CERTIFIED;
}

#[derive(Debug, Default, Clone, PartialEq)]
struct Tick {
    n: u32,
}
wire_fields!(Tick { n });

impl MessageType for Tick {
    const NAME: &'static str = "scenarios.Tick";
    const CAPABILITIES: Capabilities = Capabilities::ORDERED;
}

/// Records everything the reactor reports
#[derive(Default)]
struct Recorder {
    negotiated: Mutex<Vec<u32>>,
    disconnected: Mutex<Vec<CloseReason>>,
    kicked: Mutex<Vec<String>>,
    received: Mutex<Vec<Envelope>>,
    certified: Mutex<Vec<u32>>,
}

impl ConnectionListener for Recorder {
    fn on_negotiated(&self, connection: &ConnectionHandle) {
        self.negotiated.lock().unwrap().push(connection.id());
    }

    fn on_disconnected(&self, _connection: &ConnectionHandle, reason: CloseReason) {
        self.disconnected.lock().unwrap().push(reason);
    }

    fn on_kicked(&self, _connection: &ConnectionHandle, reason: &str) {
        self.kicked.lock().unwrap().push(reason.to_string());
    }
}

impl MessageListener for Recorder {
    fn on_received(&self, _connection: &ConnectionHandle, envelope: &Envelope) {
        self.received.lock().unwrap().push(envelope.clone());
    }

    fn on_certified(&self, _connection: &ConnectionHandle, envelope: &Envelope) {
        self.certified.lock().unwrap().push(envelope.unique_id);
    }
}

impl Recorder {
    fn received<T: MessageType>(&self) -> Vec<T> {
        self.received
            .lock()
            .unwrap()
            .iter()
            .filter_map(|envelope| envelope.payload.downcast_ref::<T>().cloned())
            .collect()
    }
}

fn test_config() -> NetworkConfig {
    NetworkConfig::default_with_overrides(|config| {
        config.transport.timeout = Duration::from_secs(3);
        config.transport.poll_interval = Duration::from_millis(2);
    })
}

/// Registers the scenario types; the order varies so local ids differ per side
fn registry(reversed: bool) -> Arc<TypeRegistry> {
    let registry = TypeRegistry::new();
    if reversed {
        registry.register::<Tick>().unwrap();
        registry.register::<Receipt>().unwrap();
        registry.register::<Chat>().unwrap();
    } else {
        registry.register::<Chat>().unwrap();
        registry.register::<Receipt>().unwrap();
        registry.register::<Tick>().unwrap();
    }
    Arc::new(registry)
}

fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + WAIT;
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        thread::sleep(Duration::from_millis(5));
    }
}

fn loopback() -> SocketAddr {
    "127.0.0.1:0".parse().unwrap()
}

struct Pair {
    server: Reactor,
    server_events: Arc<Recorder>,
    client: Reactor,
    client_events: Arc<Recorder>,
    connection: ConnectionHandle,
}

fn stream_pair() -> Pair {
    init_test_logging();
    let server_events = Arc::new(Recorder::default());
    let server = Reactor::builder(registry(false), test_config())
        .connection_listener(server_events.clone())
        .message_listener(server_events.clone())
        .bind_stream(loopback())
        .unwrap();

    let client_events = Arc::new(Recorder::default());
    let client = Reactor::builder(registry(true), test_config())
        .connection_listener(client_events.clone())
        .message_listener(client_events.clone())
        .client_stream()
        .unwrap();

    let connection = client
        .connect_and_wait(server.local_addr().unwrap(), WAIT)
        .unwrap();
    wait_until("server negotiation", || {
        !server_events.negotiated.lock().unwrap().is_empty()
    });

    Pair {
        server,
        server_events,
        client,
        client_events,
        connection,
    }
}

#[test]
#[serial]
fn test_negotiated_types_map_across_different_local_ids() {
    let pair = stream_pair();
    assert_eq!(pair.connection.status(), Status::Connected);
    wait_until("client negotiation event", || {
        pair.client_events.negotiated.lock().unwrap().len() == 1
    });

    pair.connection
        .send(Chat {
            from: "client".into(),
            text: "hello".into(),
        })
        .unwrap();

    wait_until("chat delivery", || !pair.server_events.received::<Chat>().is_empty());
    let chats = pair.server_events.received::<Chat>();
    assert_eq!(chats.len(), 1);
    assert_eq!(chats[0].text, "hello");

    let server_side = pair.server.connections();
    assert_eq!(server_side.len(), 1);
    assert_eq!(
        server_side[0].info().remote_session_id,
        Some(pair.client.session_id())
    );

    pair.client.shutdown();
    pair.server.shutdown();
}

#[test]
#[serial]
fn test_certified_message_delivered_once_and_acknowledged() {
    let pair = stream_pair();

    let unique_id = pair.connection.send(Receipt { order: 42 }).unwrap();
    assert_ne!(unique_id, 0);

    wait_until("acknowledgement", || {
        pair.client_events.certified.lock().unwrap().contains(&unique_id)
    });
    assert_eq!(pair.server_events.received::<Receipt>(), vec![Receipt { order: 42 }]);
    assert_eq!(pair.client.metrics().snapshot().messages_certified, 1);
    assert_eq!(pair.client.metrics().snapshot().messages_failed, 0);

    pair.client.shutdown();
    pair.server.shutdown();
}

#[test]
#[serial]
fn test_ordered_messages_arrive_in_send_order() {
    let pair = stream_pair();

    for n in 0..50 {
        pair.connection.send(Tick { n }).unwrap();
    }

    wait_until("all ticks", || pair.server_events.received::<Tick>().len() == 50);
    let order: Vec<u32> = pair
        .server_events
        .received::<Tick>()
        .into_iter()
        .map(|tick| tick.n)
        .collect();
    assert_eq!(order, (0..50).collect::<Vec<_>>());

    pair.client.shutdown();
    pair.server.shutdown();
}

#[test]
#[serial]
fn test_burst_larger_than_read_budget_is_fully_delivered() {
    init_test_logging();
    let small_reads = || {
        NetworkConfig::default_with_overrides(|config| {
            config.transport.timeout = Duration::from_secs(3);
            config.transport.poll_interval = Duration::from_millis(2);
            config.buffers.scratch_buffer_size = 1024;
            config.buffers.receive_buffer_size = 64;
        })
    };
    let server_events = Arc::new(Recorder::default());
    let server = Reactor::builder(registry(false), small_reads())
        .connection_listener(server_events.clone())
        .message_listener(server_events.clone())
        .bind_stream(loopback())
        .unwrap();
    let client = Reactor::builder(registry(true), small_reads())
        .client_stream()
        .unwrap();
    let connection = client
        .connect_and_wait(server.local_addr().unwrap(), WAIT)
        .unwrap();

    // Roughly forty times what one pass may read
    let text = "x".repeat(64);
    for n in 0..600 {
        connection
            .send(Chat { from: n.to_string(), text: text.clone() })
            .unwrap();
    }

    wait_until("whole burst", || server_events.received::<Chat>().len() == 600);
    let senders: Vec<String> = server_events
        .received::<Chat>()
        .into_iter()
        .map(|chat| chat.from)
        .collect();
    assert_eq!(senders, (0..600).map(|n| n.to_string()).collect::<Vec<_>>());

    client.shutdown();
    server.shutdown();
}

#[test]
#[serial]
fn test_graceful_disconnect_reports_both_sides() {
    let pair = stream_pair();

    let reason = pair.connection.disconnect_and_wait(WAIT).unwrap();
    assert_eq!(reason, CloseReason::ClosedByUser);
    assert_eq!(pair.connection.status(), Status::Disconnected);

    wait_until("server disconnect", || {
        !pair.server_events.disconnected.lock().unwrap().is_empty()
    });
    assert_eq!(
        *pair.server_events.disconnected.lock().unwrap(),
        vec![CloseReason::ClosedByRemote]
    );
    wait_until("client disconnect event", || {
        !pair.client_events.disconnected.lock().unwrap().is_empty()
    });
    assert_eq!(
        *pair.client_events.disconnected.lock().unwrap(),
        vec![CloseReason::ClosedByUser]
    );

    pair.client.shutdown();
    pair.server.shutdown();
}

#[test]
#[serial]
fn test_send_after_disconnect_is_rejected() {
    let pair = stream_pair();

    assert!(pair.connection.disconnect());
    let result = pair.connection.send(Chat::default());
    assert!(matches!(result, Err(ProtocolError::ConnectionClosed)));
    assert!(!pair.connection.disconnect());

    pair.client.shutdown();
    pair.server.shutdown();
}

#[test]
#[serial]
fn test_kick_delivers_reason_to_peer() {
    let pair = stream_pair();

    let server_side = pair.server.connections();
    assert_eq!(server_side.len(), 1);
    pair.server.kick(server_side[0].id(), "maintenance").unwrap();

    wait_until("kick notice", || !pair.client_events.kicked.lock().unwrap().is_empty());
    assert_eq!(*pair.client_events.kicked.lock().unwrap(), vec!["maintenance".to_string()]);
    wait_until("client close", || pair.connection.status() == Status::Disconnected);
    assert_eq!(pair.connection.kick_reason().as_deref(), Some("maintenance"));
    assert_eq!(pair.connection.info().close_reason, Some(CloseReason::Kicked));

    wait_until("server close", || {
        !pair.server_events.disconnected.lock().unwrap().is_empty()
    });
    assert_eq!(
        *pair.server_events.disconnected.lock().unwrap(),
        vec![CloseReason::ClosedByServer]
    );

    assert!(matches!(
        pair.server.kick(999, "nobody"),
        Err(ProtocolError::UnknownConnection(999))
    ));

    pair.client.shutdown();
    pair.server.shutdown();
}

#[test]
#[serial]
fn test_time_sync_on_one_host_is_near_zero() {
    let pair = stream_pair();

    let offset = pair.connection.synchronize_time_and_wait(WAIT).unwrap();
    assert!(offset.abs() < 1_000, "offset {offset}ms between two clocks of one host");
    assert_eq!(pair.connection.clock_offset(), Some(offset));

    pair.client.shutdown();
    pair.server.shutdown();
}

#[test]
#[serial]
fn test_dispatcher_routes_received_messages() {
    init_test_logging();
    let dispatcher = Arc::new(Dispatcher::<ConnectionHandle>::new());
    let texts = Arc::new(Mutex::new(Vec::new()));
    let sink = texts.clone();
    dispatcher
        .register::<Chat, _>(move |_connection, chat| {
            sink.lock().unwrap().push(chat.text.clone());
            Ok(())
        })
        .unwrap();

    let server = Reactor::builder(registry(false), test_config())
        .message_listener(dispatcher)
        .bind_stream(loopback())
        .unwrap();
    let client = Reactor::client_stream(registry(false), test_config()).unwrap();
    let connection = client
        .connect_and_wait(server.local_addr().unwrap(), WAIT)
        .unwrap();

    connection
        .send(Chat {
            from: "a".into(),
            text: "routed".into(),
        })
        .unwrap();
    wait_until("dispatch", || !texts.lock().unwrap().is_empty());
    assert_eq!(*texts.lock().unwrap(), vec!["routed".to_string()]);

    client.shutdown();
    server.shutdown();
}

#[test]
#[serial]
fn test_connect_to_closed_port_fails() {
    init_test_logging();
    let address = {
        let spare = TcpListener::bind(loopback()).unwrap();
        spare.local_addr().unwrap()
    };

    let events = Arc::new(Recorder::default());
    let client = Reactor::builder(registry(false), test_config())
        .connection_listener(events.clone())
        .client_stream()
        .unwrap();

    let result = client.connect_and_wait(address, WAIT);
    assert!(result.is_err());
    wait_until("connect failure", || !events.disconnected.lock().unwrap().is_empty());
    assert_eq!(
        *events.disconnected.lock().unwrap(),
        vec![CloseReason::ChannelConnectError]
    );

    client.shutdown();
}

#[test]
#[serial]
fn test_datagram_peers_negotiate_and_exchange() {
    init_test_logging();
    let server_events = Arc::new(Recorder::default());
    let server = Reactor::builder(registry(false), test_config())
        .connection_listener(server_events.clone())
        .message_listener(server_events.clone())
        .bind_datagram(loopback())
        .unwrap();
    let client = Reactor::bind_datagram(loopback(), registry(true), test_config()).unwrap();

    let connection = client
        .connect_and_wait(server.local_addr().unwrap(), WAIT)
        .unwrap();
    connection
        .send(Chat {
            from: "udp".into(),
            text: "over datagrams".into(),
        })
        .unwrap();
    let unique_id = connection.send(Receipt { order: 7 }).unwrap();

    wait_until("datagram delivery", || {
        !server_events.received::<Chat>().is_empty() && !server_events.received::<Receipt>().is_empty()
    });
    assert_eq!(server_events.received::<Chat>()[0].text, "over datagrams");
    assert_eq!(server_events.received::<Receipt>(), vec![Receipt { order: 7 }]);
    assert_ne!(unique_id, 0);

    let reason = connection.disconnect_and_wait(WAIT).unwrap();
    assert_eq!(reason, CloseReason::ClosedByUser);
    wait_until("server close", || {
        !server_events.disconnected.lock().unwrap().is_empty()
    });
    assert_eq!(
        *server_events.disconnected.lock().unwrap(),
        vec![CloseReason::ClosedByRemote]
    );

    client.shutdown();
    server.shutdown();
}

#[test]
#[serial]
fn test_malformed_datagrams_are_counted() {
    init_test_logging();
    let server = Reactor::bind_datagram(loopback(), registry(false), test_config()).unwrap();
    let target = server.local_addr().unwrap();
    let socket = UdpSocket::bind(loopback()).unwrap();

    // An unknown class id, then a frame cut short
    socket.send_to(&[0, 0, 0, 2, 0x7f, 0x7f], target).unwrap();
    socket.send_to(&[0, 0, 0, 3, 1], target).unwrap();

    wait_until("protocol errors", || {
        server.metrics().snapshot().protocol_errors >= 2
    });
    server.shutdown();
}
