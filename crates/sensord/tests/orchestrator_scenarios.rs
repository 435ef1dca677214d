//! End-to-end orchestrator scenarios against in-memory sensor links.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use sensor_core::{BufferStatus, BufferStore, ParamValue, SensorPacket, SensorUid, SubscriptionResponse};
use sensord::application::command::CommandClient;
use sensord::application::orchestrator::{DeviceOrchestrator, OrchestratorConfig};
use sensord::application::retry::RetryPolicy;
use sensord::application::session::{SessionConfig, SessionState};
use sensord::application::status::{PublishError, StatusEvent, StatusPublisher};
use sensord::infrastructure::hotplug::{HotplugAction, HotplugEvent};
use sensord::infrastructure::link::mock::{sensor_responder, MockLinkFactory};
use tokio::sync::{mpsc, oneshot};
use tracing::Span;

const PORT_A: &str = "/dev/ttyACM0";
const PORT_B: &str = "/dev/ttyACM1";

// ── Fixtures ──────────────────────────────────────────────────────────────────

/// Keeps every published snapshot.
#[derive(Default)]
struct RecordingPublisher {
    published: Mutex<Vec<Vec<BufferStatus>>>,
}

impl RecordingPublisher {
    fn latest(&self) -> Option<Vec<BufferStatus>> {
        self.published.lock().unwrap().last().cloned()
    }
}

#[async_trait]
impl StatusPublisher for RecordingPublisher {
    async fn publish(&self, event: StatusEvent, params: Vec<BufferStatus>) -> Result<(), PublishError> {
        assert_eq!(event, StatusEvent::Update);
        self.published.lock().unwrap().push(params);
        Ok(())
    }
}

fn config() -> OrchestratorConfig {
    OrchestratorConfig {
        broadcast_interval: Duration::from_millis(50),
        session: SessionConfig {
            write_interval: Duration::from_millis(10),
            terminate_timeout: Duration::from_millis(200),
            ping_timeout: Duration::from_millis(200),
            ping_policy: RetryPolicy::constant(5, Duration::from_millis(100)),
            disable_policy: RetryPolicy::constant(3, Duration::from_millis(10)),
            cycle_period: 50,
        },
    }
}

fn line_follower() -> SensorUid {
    SensorUid {
        device_type: 0x02,
        year: 0x15,
        id: 1234,
    }
}

fn add(ports: &[&str]) -> HotplugEvent {
    HotplugEvent::new(
        HotplugAction::Add,
        PathBuf::from("/sys/bus/usb/devices/1-1.2:1.0"),
        ports.iter().map(|p| p.to_string()).collect(),
    )
}

fn floats(values: &[f32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

async fn eventually(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(30), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition never held");
}

// ── Scenarios ─────────────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn test_two_ports_then_ping_all_with_one_silent_sensor() {
    // Arrange: A answers like a line follower, B never says anything
    let factory = Arc::new(MockLinkFactory::new());
    factory.set_responder(|port| (port == PORT_A).then(|| sensor_responder(line_follower(), 0b111, 20)));
    let publisher = Arc::new(RecordingPublisher::default());
    let orchestrator = DeviceOrchestrator::new(
        Arc::clone(&factory) as _,
        Arc::new(BufferStore::new()),
        Arc::clone(&publisher) as _,
        config(),
        Span::none(),
    );
    let (hotplug_tx, hotplug_rx) = mpsc::channel(8);
    let (client, command_rx) = CommandClient::channel(8);
    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let task = tokio::spawn(orchestrator.run(hotplug_rx, command_rx, async {
        let _ = stop_rx.await;
    }));

    // Act
    hotplug_tx.send(add(&[PORT_A, PORT_B])).await.unwrap();
    eventually(|| factory.opened().len() == 2).await;
    let outcome = tokio::time::timeout(Duration::from_secs(10), client.call("ping-all")).await;

    // Assert: the command came back within the retry budget
    assert_eq!(outcome.expect("ping-all hung"), Ok(()));
    assert_eq!(factory.opened(), vec![PORT_A.to_string(), PORT_B.to_string()]);
    let a = factory.handle(PORT_A).unwrap();
    assert!(a.count_sent(|p| *p == SensorPacket::Ping) >= 2);

    // Only the responsive sensor shows up in status broadcasts.
    eventually(|| publisher.latest().is_some_and(|s| s.len() == 1)).await;
    let latest = publisher.latest().unwrap();
    assert_eq!(latest[0].device, "LineFollower");
    assert_eq!(latest[0].uid, line_follower());

    stop_tx.send(()).unwrap();
    task.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_resubscription_changes_accepted_payload_size() {
    // Arrange: no responder; the test plays the sensor
    let factory = Arc::new(MockLinkFactory::new());
    let store = Arc::new(BufferStore::new());
    let mut orchestrator = DeviceOrchestrator::new(
        Arc::clone(&factory) as _,
        Arc::clone(&store),
        Arc::new(RecordingPublisher::default()),
        config(),
        Span::none(),
    );
    orchestrator.handle_hotplug_event(add(&[PORT_A]));
    let session = orchestrator.session(PORT_A).unwrap();
    let sensor = factory.handle(PORT_A).unwrap();
    let subscribe = |params| {
        SensorPacket::SubscriptionResponse(SubscriptionResponse {
            params,
            delay: 20,
            uid: line_follower(),
        })
    };

    // Act: subscribe to `left` only (B1), then to all three (B2)
    sensor.push(subscribe(0b001));
    eventually(|| session.state() == SessionState::ReadySubscribed).await;
    sensor.push(subscribe(0b111));
    sensor.push(SensorPacket::DeviceData {
        params: 0b111,
        data: floats(&[0.25, 0.5, 0.75]),
    });

    // Assert: B2-sized data lands in all three slots
    let buffer = session.buffer().unwrap();
    eventually(|| buffer.current("right") == Ok(ParamValue::F32(0.75))).await;
    assert_eq!(buffer.current("left"), Ok(ParamValue::F32(0.25)));
    assert_eq!(buffer.current("center"), Ok(ParamValue::F32(0.5)));
    assert_eq!(buffer.subscription(), 0b111);

    // Act: B1-sized data is now a protocol violation
    sensor.push(SensorPacket::DeviceData {
        params: 0b001,
        data: floats(&[9.0]),
    });
    let exited = tokio::time::timeout(Duration::from_secs(10), orchestrator.next_exit()).await;

    // Assert
    assert_eq!(exited.unwrap().as_deref(), Some(PORT_A));
    assert_eq!(session.state(), SessionState::Terminated);
    assert_eq!(orchestrator.session_count(), 0);
    assert!(store.attach(&line_follower().buffer_key()).is_none());
}

#[tokio::test(start_paused = true)]
async fn test_broadcast_with_no_sensors_publishes_empty_snapshot() {
    // Arrange
    let publisher = Arc::new(RecordingPublisher::default());
    let orchestrator = DeviceOrchestrator::new(
        Arc::new(MockLinkFactory::new()),
        Arc::new(BufferStore::new()),
        Arc::clone(&publisher) as _,
        config(),
        Span::none(),
    );

    // Act
    orchestrator.broadcast_status().await;

    // Assert
    assert_eq!(publisher.latest(), Some(Vec::new()));
}

#[tokio::test(start_paused = true)]
async fn test_replugged_port_gets_a_fresh_session() {
    // Arrange
    let factory = Arc::new(MockLinkFactory::new());
    factory.set_responder(|_| Some(sensor_responder(line_follower(), 0b001, 20)));
    let mut orchestrator = DeviceOrchestrator::new(
        Arc::clone(&factory) as _,
        Arc::new(BufferStore::new()),
        Arc::new(RecordingPublisher::default()),
        config(),
        Span::none(),
    );
    orchestrator.handle_hotplug_event(add(&[PORT_A]));
    let first = orchestrator.session(PORT_A).unwrap();
    eventually(|| first.is_ready()).await;

    // Act: unplug, then plug back in
    factory.handle(PORT_A).unwrap().disconnect();
    orchestrator.next_exit().await;
    orchestrator.handle_hotplug_event(add(&[PORT_A]));

    // Assert
    let second = orchestrator.session(PORT_A).unwrap();
    assert!(!Arc::ptr_eq(&first, &second));
    eventually(|| second.is_ready()).await;
    assert_eq!(orchestrator.session_count(), 1);
}
