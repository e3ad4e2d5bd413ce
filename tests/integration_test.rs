//! Integration tests for the full gateway pipeline over fake transports.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

use ble2mqtt::bluetooth::pool::{ConnectionPool, PoolSettings, SessionState};
use ble2mqtt::bluetooth::scanner::Scanner;
use ble2mqtt::bluetooth::transport::{LinkEvent, LinkTransport, SubChannel};
use ble2mqtt::bluetooth::LinkFacade;
use ble2mqtt::bridge::DataBridge;
use ble2mqtt::cloud::PublishTransport;
use ble2mqtt::config::MetricsConfig;
use ble2mqtt::error::GatewayError;
use ble2mqtt::events::{EventProcessor, GatewayEvent};
use ble2mqtt::metrics::MetricsAggregator;
use ble2mqtt::state::GatewayState;

/// Link fake that completes opens with an immediate link-up and closes
/// with an immediate link-down, like a well-behaved peripheral.
struct FakeLink {
    events: mpsc::UnboundedSender<GatewayEvent>,
    channels: Vec<SubChannel>,
    fail_discovery: AtomicBool,
    discovery_delay_ms: AtomicU64,
}

impl FakeLink {
    fn new(events: mpsc::UnboundedSender<GatewayEvent>, channels: Vec<SubChannel>) -> Arc<Self> {
        Arc::new(Self {
            events,
            channels,
            fail_discovery: AtomicBool::new(false),
            discovery_delay_ms: AtomicU64::new(0),
        })
    }

    fn notify(&self, identity: &str, payload: &[u8]) {
        let _ = self.events.send(GatewayEvent::Link(LinkEvent::Notification {
            identity: identity.to_string(),
            channel: self.channels[0].clone(),
            payload: payload.to_vec(),
        }));
    }

    fn drop_link(&self, identity: &str) {
        let _ = self.events.send(GatewayEvent::Link(LinkEvent::LinkDown {
            identity: identity.to_string(),
        }));
    }
}

#[async_trait]
impl LinkTransport for FakeLink {
    async fn open(&self, identity: &str) -> Result<(), GatewayError> {
        let _ = self.events.send(GatewayEvent::Link(LinkEvent::LinkUp {
            identity: identity.to_string(),
            name: Some("FakeSensor".to_string()),
        }));
        Ok(())
    }

    async fn close(&self, identity: &str) {
        self.drop_link(identity);
    }

    async fn discover(&self, identity: &str) -> Result<Vec<SubChannel>, GatewayError> {
        let delay = self.discovery_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if self.fail_discovery.load(Ordering::SeqCst) {
            return Err(GatewayError::CapabilityDiscoveryFailed {
                identity: identity.to_string(),
                reason: "fake discovery failure".to_string(),
            });
        }
        Ok(self.channels.clone())
    }

    async fn set_notify(&self, _: &str, _: &SubChannel, _: bool) -> bool {
        true
    }

    async fn write(&self, _: &str, _: &SubChannel, _: &[u8]) -> bool {
        true
    }

    async fn scan_start(&self) -> Result<(), GatewayError> {
        Ok(())
    }

    async fn scan_stop(&self) {}
}

struct FakePublisher {
    accept: AtomicBool,
    published: Mutex<Vec<(String, serde_json::Value)>>,
}

#[async_trait]
impl PublishTransport for FakePublisher {
    async fn publish(&self, topic: &str, payload: &[u8]) -> bool {
        if !self.accept.load(Ordering::SeqCst) {
            return false;
        }
        let value = serde_json::from_slice(payload).expect("outbound payload must be JSON");
        self.published.lock().push((topic.to_string(), value));
        true
    }

    fn is_connected(&self) -> bool {
        self.accept.load(Ordering::SeqCst)
    }
}

struct Harness {
    tx: mpsc::UnboundedSender<GatewayEvent>,
    rx: mpsc::UnboundedReceiver<GatewayEvent>,
    link: Arc<FakeLink>,
    publisher: Arc<FakePublisher>,
    pool: Arc<ConnectionPool>,
    scanner: Arc<Scanner>,
    metrics: Arc<MetricsAggregator>,
    state: Arc<GatewayState>,
    processor: EventProcessor,
}

fn sensor_channels() -> Vec<SubChannel> {
    vec![SubChannel {
        service: "0000181a-0000-1000-8000-00805f9b34fb".to_string(),
        id: "00002a6e-0000-1000-8000-00805f9b34fb".to_string(),
        notify: true,
        write: true,
        write_without_response: false,
    }]
}

fn harness(auto_connect: Vec<String>) -> Harness {
    let (tx, rx) = mpsc::unbounded_channel();
    let link = FakeLink::new(tx.clone(), sensor_channels());
    let publisher = Arc::new(FakePublisher {
        accept: AtomicBool::new(true),
        published: Mutex::new(Vec::new()),
    });

    let metrics = Arc::new(MetricsAggregator::new(MetricsConfig::default()));
    let state = Arc::new(GatewayState::new());
    let pool = Arc::new(ConnectionPool::new(
        link.clone(),
        tx.clone(),
        PoolSettings {
            max_sessions: 5,
            reconnect_base_delay: Duration::from_millis(5),
            max_reconnect_attempts: 3,
        },
    ));
    let facade = Arc::new(LinkFacade::new(link.clone()));
    let scanner = Arc::new(Scanner::new(
        link.clone(),
        tx.clone(),
        Duration::from_millis(500),
    ));
    let bridge = Arc::new(DataBridge::new(
        publisher.clone(),
        metrics.clone(),
        state.clone(),
    ));
    let processor = EventProcessor::new(
        tx.clone(),
        pool.clone(),
        facade,
        scanner.clone(),
        bridge,
        metrics.clone(),
        state.clone(),
        auto_connect,
    );

    Harness {
        tx,
        rx,
        link,
        publisher,
        pool,
        scanner,
        metrics,
        state,
        processor,
    }
}

impl Harness {
    /// Process queued events until the channel is drained, yielding between
    /// rounds so worker tasks spawned by the handlers can post follow-ups.
    async fn pump(&mut self) {
        loop {
            let mut handled = false;
            while let Ok(event) = self.rx.try_recv() {
                self.processor.handle_event(event).await;
                handled = true;
            }
            if !handled {
                break;
            }
            tokio::task::yield_now().await;
        }
    }

    /// Drain the channel, waiting between rounds for timer-posted events.
    async fn pump_with_timers(&mut self, rounds: usize) {
        for _ in 0..rounds {
            self.pump().await;
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        self.pump().await;
    }
}

const DEVICE: &str = "AA:BB:CC:DD:EE:FF";

#[tokio::test]
async fn test_notification_flows_to_broker() {
    let mut h = harness(vec![]);

    h.pool.connect(DEVICE, 1).await.unwrap();
    h.pump().await;

    let status = h.state.device(DEVICE).unwrap();
    assert_eq!(status.state, "Ready");
    assert_eq!(status.display_name.as_deref(), Some("FakeSensor"));

    h.link.notify(DEVICE, b"T7:21.5C");
    h.pump().await;

    let published = h.publisher.published.lock();
    assert_eq!(published.len(), 1);
    let (topic, json) = &published[0];
    assert_eq!(topic, "devices/AABBCCDDEEFF/data");
    assert_eq!(json["type"], "temperature");
    assert_eq!(json["sampleNumber"], 7);
    assert_eq!(json["temperature"], 21.5);
    assert_eq!(json["deviceName"], "FakeSensor");
    assert_eq!(json["rawData"], "T7:21.5C");
    drop(published);

    let totals = h.metrics.totals();
    assert_eq!(totals.received, 1);
    assert_eq!(totals.published, 1);
    assert_eq!(h.state.snapshot().publishes_succeeded, 1);
}

#[tokio::test]
async fn test_classified_topics() {
    let mut h = harness(vec![]);
    h.pool.connect(DEVICE, 1).await.unwrap();
    h.pump().await;

    h.link.notify(DEVICE, b"connected");
    h.link.notify(DEVICE, b"OK stored");
    h.link.notify(DEVICE, b"mystery");
    h.pump().await;

    let published = h.publisher.published.lock();
    let topics: Vec<&str> = published.iter().map(|(t, _)| t.as_str()).collect();
    assert_eq!(
        topics,
        vec![
            "devices/AABBCCDDEEFF/status",
            "devices/AABBCCDDEEFF/response",
            "devices/AABBCCDDEEFF/data",
        ]
    );
}

#[tokio::test]
async fn test_scan_auto_connect() {
    let mut h = harness(vec![DEVICE.to_string()]);

    h.scanner.start().await.unwrap();
    h.pump().await;
    assert!(h.state.snapshot().scanning);

    h.tx.send(GatewayEvent::Link(LinkEvent::DeviceDiscovered {
        identity: DEVICE.to_string(),
        name: Some("FakeSensor".to_string()),
        rssi: Some(-55),
    }))
    .unwrap();
    // Other devices are sighted but not auto-connected.
    h.tx.send(GatewayEvent::Link(LinkEvent::DeviceDiscovered {
        identity: "11:22:33:44:55:66".to_string(),
        name: None,
        rssi: Some(-80),
    }))
    .unwrap();
    h.pump().await;

    assert_eq!(h.pool.active_count(), 1);
    assert_eq!(h.state.device(DEVICE).unwrap().state, "Ready");
    assert!(h.state.device("11:22:33:44:55:66").is_none());
}

#[tokio::test]
async fn test_link_drop_recovers_through_reconnect() {
    let mut h = harness(vec![]);
    h.pool.connect(DEVICE, 1).await.unwrap();
    h.pump().await;

    h.link.drop_link(DEVICE);
    h.pump().await;
    assert_eq!(h.state.device(DEVICE).unwrap().state, "Reconnecting");

    // The retry timer fires, the fake link comes straight back up and
    // capability discovery promotes the session to Ready again.
    h.pump_with_timers(3).await;
    assert_eq!(h.state.device(DEVICE).unwrap().state, "Ready");
    assert_eq!(h.pool.session(DEVICE).unwrap().reconnect_attempts, 0);
}

#[tokio::test]
async fn test_discovery_failure_exhausts_budget() {
    let mut h = harness(vec![]);
    h.link.fail_discovery.store(true, Ordering::SeqCst);

    h.pool.connect(DEVICE, 1).await.unwrap();
    // Each cycle: link-up, failed discovery, close, link-down, retry.
    h.pump_with_timers(10).await;

    assert!(h.pool.session(DEVICE).is_none());
    let status = h.state.device(DEVICE).unwrap();
    assert_eq!(status.state, "Disconnected");
    assert!(status.last_error.is_some());
}

#[tokio::test]
async fn test_explicit_disconnect_is_terminal() {
    let mut h = harness(vec![]);
    h.pool.connect(DEVICE, 1).await.unwrap();
    h.pump().await;

    h.pool.disconnect(DEVICE).await;
    h.pump_with_timers(3).await;

    assert!(h.pool.session(DEVICE).is_none());
    assert_eq!(h.state.device(DEVICE).unwrap().state, "Disconnected");
    assert_eq!(h.pool.active_count(), 0);
}

#[tokio::test]
async fn test_slow_discovery_does_not_stall_dispatch() {
    let mut h = harness(vec![]);
    h.pool.connect(DEVICE, 1).await.unwrap();
    h.pump().await;
    assert_eq!(h.state.device(DEVICE).unwrap().state, "Ready");

    // A second device with a sluggish GATT table connects; traffic from
    // the ready device must keep flowing while discovery runs.
    h.link.discovery_delay_ms.store(200, Ordering::SeqCst);
    h.pool.connect("11:22:33:44:55:66", 1).await.unwrap();
    let start = Instant::now();
    h.pump().await;

    h.link.notify(DEVICE, b"T1:20.0C");
    h.pump().await;

    assert!(
        start.elapsed() < Duration::from_millis(100),
        "dispatch stalled for {:?}",
        start.elapsed()
    );
    assert_eq!(h.publisher.published.lock().len(), 1);
    assert_eq!(
        h.pool.session("11:22:33:44:55:66").unwrap().state,
        SessionState::DiscoveringCapabilities
    );

    // Once discovery completes the second device comes up as well.
    h.pump_with_timers(25).await;
    assert_eq!(h.state.device("11:22:33:44:55:66").unwrap().state, "Ready");
}

#[tokio::test]
async fn test_write_acks_counted() {
    let mut h = harness(vec![]);
    h.pool.connect(DEVICE, 1).await.unwrap();
    h.pump().await;

    h.tx.send(GatewayEvent::Link(LinkEvent::WriteAck {
        identity: DEVICE.to_string(),
        success: true,
    }))
    .unwrap();
    h.tx.send(GatewayEvent::Link(LinkEvent::WriteAck {
        identity: DEVICE.to_string(),
        success: false,
    }))
    .unwrap();
    h.pump().await;

    let snapshot = h.state.snapshot();
    assert_eq!(snapshot.writes_acked, 1);
    assert_eq!(snapshot.writes_failed, 1);
}

#[tokio::test]
async fn test_broker_failure_drops_messages() {
    let mut h = harness(vec![]);
    h.pool.connect(DEVICE, 1).await.unwrap();
    h.pump().await;

    h.publisher.accept.store(false, Ordering::SeqCst);
    h.link.notify(DEVICE, b"T1:23.5C");
    h.pump().await;

    let snapshot = h.state.snapshot();
    assert_eq!(snapshot.publishes_failed, 1);
    assert_eq!(snapshot.publishes_succeeded, 0);
    // The session is unaffected by forwarding failures.
    assert_eq!(h.state.device(DEVICE).unwrap().state, "Ready");
    assert_eq!(h.metrics.totals().failed, 1);
}

#[tokio::test]
async fn test_occupancy_tracked_in_state() {
    let mut h = harness(vec![]);
    h.pool.connect(DEVICE, 1).await.unwrap();
    h.pool.connect("11:22:33:44:55:66", 1).await.unwrap();
    h.pump().await;

    let snapshot = h.state.snapshot();
    assert_eq!(snapshot.pool_active, 2);
    assert_eq!(snapshot.pool_max, 5);
}
