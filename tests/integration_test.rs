//! Integration tests for the full session flow over the simulated radio.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use pairit::bluetooth::sim::{SimAdapter, SimRadio};
use pairit::bluetooth::{DeviceAddress, DeviceDescriptor, ManagerHandle, SessionManager};
use pairit::config::Config;
use pairit::events::{Event, EventBus, SessionEndCause};
use pairit::state::ConnectionState;
use pairit::BtError;

const ALPHA: &str = "00:00:00:00:00:01";
const BRAVO: &str = "00:00:00:00:00:02";

fn addr(s: &str) -> DeviceAddress {
    s.parse().unwrap()
}

fn config(name: &str) -> Config {
    let mut config = Config::default().with_device_name(name);
    config.bluetooth.auto_scan = false;
    config.session.race_settle_ms = 300;
    config.session.handshake_timeout_secs = 2;
    config
}

struct Peer {
    adapter: Arc<SimAdapter>,
    handle: ManagerHandle,
    events: mpsc::UnboundedReceiver<Event>,
}

impl Peer {
    async fn spawn(adapter: Arc<SimAdapter>, name: &str) -> Self {
        let bus = EventBus::new();
        let events = bus.subscribe();
        let handle = SessionManager::spawn(adapter.clone(), &config(name), bus)
            .await
            .unwrap();
        Self {
            adapter,
            handle,
            events,
        }
    }

    /// Spawn a powered peer and wait until it is listening.
    async fn ready(radio: &SimRadio, address: &str, name: &str) -> Self {
        let mut peer = Self::spawn(radio.adapter(addr(address), name), name).await;
        peer.wait_state(ConnectionState::Disconnected).await;
        peer
    }

    async fn next(&mut self) -> Event {
        tokio::time::timeout(Duration::from_secs(5), self.events.recv())
            .await
            .expect("timed out waiting for event")
            .expect("bus closed")
    }

    /// Skip events until `pred` matches; returns everything seen.
    async fn wait_for(&mut self, pred: impl Fn(&Event) -> bool) -> Vec<Event> {
        let mut seen = Vec::new();
        loop {
            let event = self.next().await;
            let done = pred(&event);
            seen.push(event);
            if done {
                return seen;
            }
        }
    }

    async fn wait_state(&mut self, state: ConnectionState) -> Vec<Event> {
        self.wait_for(|e| e.state() == Some(state)).await
    }

    /// Everything published within `window`, after the manager has drained
    /// its queue.
    async fn drain(&mut self, window: Duration) -> Vec<Event> {
        tokio::time::sleep(window).await;
        let _ = self.handle.state().await;
        let mut events = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            events.push(event);
        }
        events
    }
}

fn count_state(events: &[Event], state: ConnectionState) -> usize {
    events.iter().filter(|e| e.state() == Some(state)).count()
}

fn received(events: &[Event]) -> Vec<Vec<u8>> {
    events
        .iter()
        .filter_map(|e| match e {
            Event::MessageReceived { message, .. } => Some(message.bytes.clone()),
            _ => None,
        })
        .collect()
}

async fn wait_open_links(radio: &SimRadio, expected: usize) {
    for _ in 0..100 {
        if radio.open_link_ends() == expected {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(radio.open_link_ends(), expected);
}

/// `alpha` dials `bravo`; both end up connected.
async fn connected_pair(radio: &SimRadio) -> (Peer, Peer) {
    let mut alpha = Peer::ready(radio, ALPHA, "alpha").await;
    let mut bravo = Peer::ready(radio, BRAVO, "bravo").await;

    alpha.handle.connect(addr(BRAVO), Some(false)).unwrap();
    alpha.wait_state(ConnectionState::Connected).await;
    bravo.wait_state(ConnectionState::Connected).await;
    (alpha, bravo)
}

#[tokio::test]
async fn test_scan_with_adapter_off() {
    let radio = SimRadio::new();
    let adapter = radio.adapter(addr(ALPHA), "alpha");
    adapter.set_scan_results(vec![DeviceDescriptor::new(addr(BRAVO), "bravo", false)]);
    adapter.set_powered(false);
    let mut alpha = Peer::spawn(adapter, "alpha").await;

    alpha.handle.scan_start().unwrap();
    let events = alpha.drain(Duration::from_millis(100)).await;

    assert!(!events
        .iter()
        .any(|e| matches!(e, Event::DeviceDiscovered(_))));
    assert!(events.contains(&Event::Toast(BtError::AdapterUnavailable.toast_text())));
    assert!(!alpha.adapter.is_discovering());
    assert_eq!(
        alpha.handle.state().await.unwrap(),
        ConnectionState::Inactive
    );
}

/// Both sides dial each other at once; they must bind the same link.
async fn assert_simultaneous_connect_converges(alpha_latency: u64, bravo_latency: u64) {
    let radio = SimRadio::new();
    let mut alpha = Peer::ready(&radio, ALPHA, "alpha").await;
    let mut bravo = Peer::ready(&radio, BRAVO, "bravo").await;
    alpha
        .adapter
        .set_dial_latency(Duration::from_millis(alpha_latency));
    bravo
        .adapter
        .set_dial_latency(Duration::from_millis(bravo_latency));

    alpha.handle.connect(addr(BRAVO), Some(false)).unwrap();
    bravo.handle.connect(addr(ALPHA), Some(false)).unwrap();

    let mut alpha_events = alpha.wait_state(ConnectionState::Connected).await;
    let mut bravo_events = bravo.wait_state(ConnectionState::Connected).await;

    // Messages cross on the one surviving link.
    alpha.handle.send("from alpha").unwrap();
    bravo.handle.send("from bravo").unwrap();
    bravo_events.extend(
        bravo
            .wait_for(|e| matches!(e, Event::MessageReceived { .. }))
            .await,
    );
    alpha_events.extend(
        alpha
            .wait_for(|e| matches!(e, Event::MessageReceived { .. }))
            .await,
    );

    alpha_events.extend(alpha.drain(Duration::from_millis(500)).await);
    bravo_events.extend(bravo.drain(Duration::from_millis(500)).await);

    for events in [&alpha_events, &bravo_events] {
        assert_eq!(
            count_state(events, ConnectionState::Connected),
            1,
            "latencies {}/{}",
            alpha_latency,
            bravo_latency
        );
        assert_eq!(count_state(events, ConnectionState::Disconnected), 0);
        assert!(!events.iter().any(|e| matches!(e, Event::SessionEnded(_))));
    }
    assert_eq!(received(&alpha_events), vec![b"from bravo".to_vec()]);
    assert_eq!(received(&bravo_events), vec![b"from alpha".to_vec()]);

    // One link survives; every losing socket is closed.
    wait_open_links(&radio, 2).await;
    assert!(!alpha.adapter.is_listening());
    assert!(!bravo.adapter.is_listening());
}

#[tokio::test]
async fn test_simultaneous_connect_converges() {
    for (alpha_latency, bravo_latency) in [(0, 0), (0, 30), (30, 0), (10, 10), (5, 25)] {
        assert_simultaneous_connect_converges(alpha_latency, bravo_latency).await;
    }
}

/// The higher address dials about as long as it holds the parked link.
#[tokio::test]
async fn test_simultaneous_connect_converges_near_race_settle() {
    let race_settle = config("alpha").session.race_settle_ms;
    for bravo_latency in (race_settle - 20..=race_settle + 20).step_by(5) {
        assert_simultaneous_connect_converges(0, bravo_latency).await;
    }
}

#[tokio::test]
async fn test_write_failure_ends_session() {
    let radio = SimRadio::new();
    let (mut alpha, mut bravo) = connected_pair(&radio).await;
    alpha.wait_for(|e| matches!(e, Event::Toast(_))).await;

    alpha.adapter.fail_writes(true);
    alpha.handle.send(vec![0x41, 0x42]).unwrap();

    match alpha.next().await {
        Event::Toast(text) => assert!(text.starts_with("Message could not be sent")),
        other => panic!("unexpected {:?}", other),
    }
    assert!(matches!(
        alpha.next().await,
        Event::SessionEnded(SessionEndCause::WriteFailed(_))
    ));
    assert_eq!(
        alpha.next().await,
        Event::StateChanged(ConnectionState::Disconnected)
    );

    // The peer sees the link close.
    let events = bravo.wait_state(ConnectionState::Disconnected).await;
    assert!(events.contains(&Event::SessionEnded(SessionEndCause::PeerClosed)));
    assert!(received(&events).is_empty());
}

#[tokio::test]
async fn test_send_while_disconnected() {
    let radio = SimRadio::new();
    let mut alpha = Peer::ready(&radio, ALPHA, "alpha").await;

    alpha.handle.send(vec![0x41, 0x42]).unwrap();
    let events = alpha.drain(Duration::from_millis(50)).await;
    assert_eq!(
        events,
        vec![Event::Toast("Connect before sending a message".into())]
    );
}

#[tokio::test]
async fn test_disconnect_twice_is_one_transition() {
    let radio = SimRadio::new();
    let (mut alpha, _bravo) = connected_pair(&radio).await;

    alpha.handle.disconnect().unwrap();
    alpha.handle.disconnect().unwrap();
    let events = alpha.drain(Duration::from_millis(100)).await;

    assert_eq!(count_state(&events, ConnectionState::Disconnected), 1);
    let ended: Vec<_> = events
        .iter()
        .filter(|e| matches!(e, Event::SessionEnded(_)))
        .collect();
    assert_eq!(
        ended,
        vec![&Event::SessionEnded(SessionEndCause::LocalDisconnect)]
    );

    // Back to listening: the peer can dial in again.
    assert!(alpha.adapter.is_listening());
}

#[tokio::test]
async fn test_peer_close_reports_lost_connection() {
    let radio = SimRadio::new();
    let (mut alpha, bravo) = connected_pair(&radio).await;

    bravo.handle.disconnect().unwrap();
    let events = alpha.wait_state(ConnectionState::Disconnected).await;
    let tail = &events[events.len() - 3..];
    assert_eq!(
        tail,
        &[
            Event::Toast("Device connection was lost".into()),
            Event::SessionEnded(SessionEndCause::PeerClosed),
            Event::StateChanged(ConnectionState::Disconnected),
        ]
    );
}

#[tokio::test]
async fn test_one_send_one_message() {
    let radio = SimRadio::new();
    let (alpha, mut bravo) = connected_pair(&radio).await;

    let messages: Vec<Vec<u8>> = vec![
        b"first".to_vec(),
        vec![0u8; 5000],
        b"third".to_vec(),
        "\u{00e9}t\u{00e9}".as_bytes().to_vec(),
    ];
    for message in &messages {
        alpha.handle.send(message.clone()).unwrap();
    }

    let mut got = Vec::new();
    while got.len() < messages.len() {
        let event = bravo.next().await;
        got.extend(received(&[event]));
    }
    assert_eq!(got, messages);
}

#[tokio::test]
async fn test_inbound_connect_names_peer() {
    let radio = SimRadio::new();
    let (_alpha, mut bravo) = connected_pair(&radio).await;

    let events = bravo
        .wait_for(|e| matches!(e, Event::Toast(_)))
        .await;
    assert_eq!(
        events.last(),
        Some(&Event::Toast("Connected to alpha".into()))
    );
    // No Connecting on the accepting side.
    assert_eq!(count_state(&events, ConnectionState::Connecting), 0);
}

#[tokio::test]
async fn test_reconnect_after_disconnect() {
    let radio = SimRadio::new();
    let (mut alpha, mut bravo) = connected_pair(&radio).await;

    alpha.handle.disconnect().unwrap();
    alpha.wait_state(ConnectionState::Disconnected).await;
    bravo.wait_state(ConnectionState::Disconnected).await;

    bravo.handle.connect(addr(ALPHA), None).unwrap();
    alpha.wait_state(ConnectionState::Connected).await;
    bravo.wait_state(ConnectionState::Connected).await;

    bravo.handle.send("again").unwrap();
    let events = alpha
        .wait_for(|e| matches!(e, Event::MessageReceived { .. }))
        .await;
    assert_eq!(received(&events), vec![b"again".to_vec()]);
    assert!(matches!(
        events.last(),
        Some(Event::MessageReceived { name, .. }) if name == "bravo"
    ));
    wait_open_links(&radio, 2).await;
}

#[tokio::test]
async fn test_connect_while_connected_rejected() {
    let radio = SimRadio::new();
    let (mut alpha, _bravo) = connected_pair(&radio).await;
    alpha.drain(Duration::from_millis(20)).await;

    alpha.handle.connect(addr(BRAVO), None).unwrap();
    let events = alpha.drain(Duration::from_millis(50)).await;
    assert_eq!(
        events,
        vec![Event::Toast(BtError::AlreadyConnected.toast_text())]
    );
}

#[tokio::test]
async fn test_scan_dedups_and_connect_stops_scan() {
    let radio = SimRadio::new();
    let adapter = radio.adapter(addr(ALPHA), "alpha");
    adapter.set_bonded(vec![DeviceDescriptor::new(addr(BRAVO), "bravo", true)]);
    adapter.set_scan_results(vec![
        DeviceDescriptor::new(addr(BRAVO), "bravo", true),
        DeviceDescriptor::new(addr("00:00:00:00:00:0C"), "00:00:00:00:00:0C", false),
        DeviceDescriptor::new(addr("00:00:00:00:00:0C"), "charlie", false),
    ]);
    adapter.set_scan_duration(Duration::from_secs(30));
    let mut alpha = Peer::spawn(adapter, "alpha").await;
    alpha.wait_state(ConnectionState::Disconnected).await;

    alpha.handle.scan_start().unwrap();
    alpha.wait_state(ConnectionState::Pairing).await;
    let events = alpha.drain(Duration::from_millis(100)).await;

    let discovered: Vec<String> = events
        .iter()
        .filter_map(|e| match e {
            Event::DeviceDiscovered(d) => Some(d.name.clone()),
            _ => None,
        })
        .collect();
    // The bonded device comes first and is not re-announced by the scan.
    assert_eq!(discovered, vec!["bravo", "00:00:00:00:00:0C", "charlie"]);

    let devices = alpha.handle.devices().await.unwrap();
    assert_eq!(devices.len(), 2);
    assert_eq!(devices[1].name, "charlie");
    assert!(alpha.adapter.is_discovering());

    alpha.handle.connect(addr("00:00:00:00:00:0C"), None).unwrap();
    alpha.wait_state(ConnectionState::Connecting).await;
    assert!(!alpha.adapter.is_discovering());
}

#[tokio::test]
async fn test_adapter_off_while_connected() {
    let radio = SimRadio::new();
    let (mut alpha, mut bravo) = connected_pair(&radio).await;

    alpha.adapter.set_powered(false);
    let events = alpha.wait_state(ConnectionState::Inactive).await;
    assert!(events.contains(&Event::Toast(
        "Bluetooth turning off - disconnecting".into()
    )));
    assert!(events.contains(&Event::SessionEnded(SessionEndCause::LocalDisconnect)));
    assert_eq!(count_state(&events, ConnectionState::Disconnected), 1);

    let events = bravo.wait_state(ConnectionState::Disconnected).await;
    assert!(events.contains(&Event::SessionEnded(SessionEndCause::PeerClosed)));

    alpha.handle.send("nobody").unwrap();
    let events = alpha.drain(Duration::from_millis(50)).await;
    assert_eq!(
        events,
        vec![Event::Toast("Connect before sending a message".into())]
    );
}

#[tokio::test]
async fn test_shutdown_releases_everything() {
    let radio = SimRadio::new();
    let (alpha, bravo) = connected_pair(&radio).await;

    alpha.handle.shutdown().await.unwrap();
    bravo.handle.shutdown().await.unwrap();
    wait_open_links(&radio, 0).await;
    assert!(!alpha.adapter.is_listening());
    assert!(!bravo.adapter.is_listening());
    assert!(alpha.handle.state().await.is_err());
}
