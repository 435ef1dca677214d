//! SensorSession: the protocol state machine for one attached sensor.
//!
//! A session owns one [`PacketLink`] and, once the sensor has identified
//! itself, one [`SensorBuffer`].  Its [`run`](SensorSession::run) task
//! drives three activities together:
//!
//! - **ping** – asks the sensor to identify itself, retrying on a fixed
//!   schedule until a subscription response arrives.
//! - **read loop** – dispatches every inbound packet: heartbeats are echoed,
//!   subscription responses (re)configure the buffer, device data is split
//!   into parameter slots.
//! - **write loop** – once the session is ready, periodically drains pending
//!   writes and one-off reads from the buffer onto the wire.
//!
//! # State machine
//!
//! ```text
//! Disconnected ─► Pinging ─► ReadyUnbuffered ⇄ ReadySubscribed
//!        │            │              │                │
//!        └────────────┴──────────────┴────────────────┴─► Terminated
//! ```
//!
//! `ReadyUnbuffered` means the sensor answered with an empty subscription;
//! `ReadySubscribed` means it streams at least one parameter.  Any failure
//! ends all three activities together and the buffer is released within the
//! teardown grace period.  Failures never escape `run`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use sensor_core::protocol::messages::ROUND_TRIP_ID;
use sensor_core::{
    BufferError, BufferStatus, BufferStore, MessageId, SensorBuffer, SensorPacket,
    SubscriptionResponse,
};
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, error, info, warn, Instrument, Span};

use super::retry::{retry, RetryPolicy};
use crate::infrastructure::link::{LinkError, PacketLink};

/// How often the teardown path checks whether buffer readers have detached.
const READER_POLL_INTERVAL: Duration = Duration::from_millis(10);

// ── Configuration ─────────────────────────────────────────────────────────────

/// Timing parameters of a session.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SessionConfig {
    /// Period of the write loop.
    pub write_interval: Duration,
    /// Grace period for buffer readers to detach during teardown.
    pub terminate_timeout: Duration,
    /// How long one ping attempt waits for a subscription response.
    pub ping_timeout: Duration,
    pub ping_policy: RetryPolicy,
    pub disable_policy: RetryPolicy,
    /// Write-loop iterations per throughput sample.
    pub cycle_period: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            write_interval: Duration::from_millis(50),
            terminate_timeout: Duration::from_secs(2),
            ping_timeout: Duration::from_secs(1),
            ping_policy: RetryPolicy::constant(10, Duration::from_secs(1)),
            disable_policy: RetryPolicy::constant(10, Duration::from_millis(100)),
            cycle_period: 1000,
        }
    }
}

// ── State and errors ──────────────────────────────────────────────────────────

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Pinging,
    ReadyUnbuffered,
    ReadySubscribed,
    Terminated,
}

impl SessionState {
    pub fn is_ready(self) -> bool {
        matches!(self, SessionState::ReadyUnbuffered | SessionState::ReadySubscribed)
    }
}

/// Reasons a session ends.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("no subscription response after {attempts} ping attempts")]
    PingTimeout { attempts: u32 },

    #[error(transparent)]
    Link(#[from] LinkError),

    #[error("protocol violation: unexpected {0:?} packet from sensor")]
    UnexpectedPacket(MessageId),

    #[error("protocol violation: {0}")]
    Buffer(#[from] BufferError),
}

// ── Session ───────────────────────────────────────────────────────────────────

/// One sensor's session.  Shared as `Arc<SensorSession>` between its run task
/// and the orchestrator's command fan-out.
pub struct SensorSession {
    link: Arc<dyn PacketLink>,
    store: Arc<BufferStore>,
    config: SessionConfig,
    state: watch::Sender<SessionState>,
    /// Bumped on every subscription response; pings wait for it to move.
    subscriptions: watch::Sender<u64>,
    /// Set when the round-trip heartbeat's echo arrives.
    round_trip: watch::Sender<bool>,
    /// Set to end `run` from outside.
    stop: watch::Sender<bool>,
    buffer: Mutex<Option<Arc<SensorBuffer>>>,
    /// Write-loop iterations per second, as `f64` bits.
    write_rate: AtomicU64,
    span: Span,
}

impl SensorSession {
    /// Creates a session over `link`.  Nothing is sent until [`run`](Self::run).
    pub fn new(
        link: Arc<dyn PacketLink>,
        store: Arc<BufferStore>,
        config: SessionConfig,
        span: Span,
    ) -> Self {
        Self {
            link,
            store,
            config,
            state: watch::Sender::new(SessionState::Disconnected),
            subscriptions: watch::Sender::new(0),
            round_trip: watch::Sender::new(false),
            stop: watch::Sender::new(false),
            buffer: Mutex::new(None),
            write_rate: AtomicU64::new(0f64.to_bits()),
            span,
        }
    }

    /// Port path; the session's identity.
    pub fn port(&self) -> &str {
        self.link.port()
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    pub fn is_ready(&self) -> bool {
        self.state().is_ready()
    }

    /// True once teardown has begun.
    pub fn is_closing(&self) -> bool {
        self.state() == SessionState::Terminated
            || self.buffer().is_some_and(|b| b.is_closing())
    }

    /// Latest write-loop throughput estimate in iterations per second.
    pub fn write_rate(&self) -> f64 {
        f64::from_bits(self.write_rate.load(Ordering::Relaxed))
    }

    fn lock_buffer(&self) -> MutexGuard<'_, Option<Arc<SensorBuffer>>> {
        self.buffer.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The buffer, once the sensor has identified itself.
    pub fn buffer(&self) -> Option<Arc<SensorBuffer>> {
        self.lock_buffer().clone()
    }

    /// Buffer status for broadcasts; `None` unless ready and not closing.
    pub fn snapshot(&self) -> Option<BufferStatus> {
        if !self.is_ready() {
            return None;
        }
        self.buffer().filter(|b| !b.is_closing()).map(|b| b.status())
    }

    // ── Ping ─────────────────────────────────────────────────────────────────

    /// Pings until the sensor sends a subscription response, retrying on the
    /// configured schedule.
    pub async fn ping(&self, timeout: Duration) -> Result<(), SessionError> {
        self.ping_inner(timeout).instrument(self.span.clone()).await
    }

    async fn ping_inner(&self, timeout: Duration) -> Result<(), SessionError> {
        self.state.send_if_modified(|state| {
            let pinging = *state == SessionState::Disconnected;
            if pinging {
                *state = SessionState::Pinging;
            }
            pinging
        });

        let policy = self.config.ping_policy;
        let result = retry(
            policy,
            |e: &SessionError| matches!(e, SessionError::PingTimeout { .. }),
            || self.ping_once(timeout),
        )
        .await;

        match result {
            Err(SessionError::PingTimeout { .. }) => {
                warn!(attempts = policy.max_tries, "sensor never answered ping");
                Err(SessionError::PingTimeout {
                    attempts: policy.max_tries,
                })
            }
            other => other,
        }
    }

    async fn ping_once(&self, timeout: Duration) -> Result<(), SessionError> {
        let mut responses = self.subscriptions.subscribe();
        self.link.send(&SensorPacket::ping()).await?;
        match tokio::time::timeout(timeout, responses.changed()).await {
            Ok(_) => Ok(()),
            Err(_) => Err(SessionError::PingTimeout { attempts: 1 }),
        }
    }

    // ── Read loop ────────────────────────────────────────────────────────────

    /// Receives and dispatches packets until the link fails or the sensor
    /// violates the protocol.  Undecodable frames are skipped.
    pub async fn read_loop(&self) -> Result<(), SessionError> {
        loop {
            let packet = match self.link.recv().await {
                Ok(packet) => packet,
                Err(e) if e.is_recoverable() => {
                    warn!("skipping undecodable frame: {e}");
                    continue;
                }
                Err(e) => return Err(e.into()),
            };
            self.handle_packet(packet).await?;
        }
    }

    async fn handle_packet(&self, packet: SensorPacket) -> Result<(), SessionError> {
        match packet {
            SensorPacket::HeartbeatRequest { id } => {
                self.link.send(&SensorPacket::heartbeat_response(id)).await?;
            }
            SensorPacket::HeartbeatResponse { id } => {
                if id == ROUND_TRIP_ID {
                    self.round_trip.send_replace(true);
                } else {
                    debug!(id, "ignoring heartbeat response");
                }
            }
            SensorPacket::DeviceData { params, data } => {
                let buffer = match (self.is_ready(), self.buffer()) {
                    (true, Some(buffer)) => buffer,
                    _ => {
                        debug!(params, "device data before subscription response; dropped");
                        return Ok(());
                    }
                };
                buffer.apply_device_data(&data)?;
            }
            SensorPacket::SubscriptionResponse(response) => self.handle_subscription(response)?,
            SensorPacket::Error { code } => {
                warn!(code, "sensor reported an error");
            }
            other @ (SensorPacket::Ping
            | SensorPacket::SubscriptionRequest { .. }
            | SensorPacket::DeviceRead { .. }
            | SensorPacket::DeviceWrite { .. }
            | SensorPacket::DeviceDisable) => {
                return Err(SessionError::UnexpectedPacket(other.message_id()));
            }
        }
        Ok(())
    }

    fn handle_subscription(&self, response: SubscriptionResponse) -> Result<(), SessionError> {
        let key = response.uid.buffer_key();
        let buffer = {
            let mut slot = self.lock_buffer();
            match slot.clone() {
                Some(existing) if existing.key() == key => {
                    if existing.is_closing() {
                        debug!(key = existing.key(), "buffer owned by another session; not reclaiming");
                    }
                    existing
                }
                Some(existing) => {
                    let opened = self.store.open(response.uid)?;
                    info!(
                        old = existing.key(),
                        new = opened.key(),
                        device = opened.device().name,
                        "sensor identity changed; buffer re-keyed"
                    );
                    *slot = Some(Arc::clone(&opened));
                    existing.mark_closing();
                    self.store.remove(&existing);
                    opened
                }
                None => {
                    let opened = self.store.open(response.uid)?;
                    info!(
                        device = opened.device().name,
                        key = opened.key(),
                        "sensor identified"
                    );
                    *slot = Some(Arc::clone(&opened));
                    opened
                }
            }
        };

        let applied = buffer.update_subscription(response.params, response.delay, response.uid);
        let next = if applied == 0 {
            SessionState::ReadyUnbuffered
        } else {
            SessionState::ReadySubscribed
        };
        self.state.send_if_modified(|state| {
            let changed = *state != next && *state != SessionState::Terminated;
            if changed {
                debug!(from = ?*state, to = ?next, "session state changed");
                *state = next;
            }
            changed
        });
        self.subscriptions.send_modify(|n| *n += 1);
        Ok(())
    }

    // ── Write loop ───────────────────────────────────────────────────────────

    /// Waits for the session to become ready, then every write interval sends
    /// whatever writes and reads the buffer has due.
    ///
    /// Every `cycle_period` iterations the achieved loop rate is sampled.
    pub async fn write_loop(&self, cycle_period: u32) -> Result<(), SessionError> {
        let mut state = self.state.subscribe();
        let reached = state
            .wait_for(|s| s.is_ready() || *s == SessionState::Terminated)
            .await
            .map(|s| *s);
        match reached {
            Ok(s) if s.is_ready() => {}
            _ => return Ok(()),
        }

        let cycle_period = cycle_period.max(1);
        let mut ticker = tokio::time::interval(self.config.write_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut iterations = 0u32;
        let mut window_start = Instant::now();

        loop {
            ticker.tick().await;
            let buffer = match self.buffer() {
                Some(buffer) if !buffer.is_closing() => buffer,
                _ => {
                    debug!("buffer released; write loop exiting");
                    return Ok(());
                }
            };

            if let Some(write) = buffer.make_write() {
                self.link.send(&write).await?;
            }
            if let Some(read) = buffer.make_read() {
                self.link.send(&read).await?;
            }

            iterations += 1;
            if iterations >= cycle_period {
                let elapsed = window_start.elapsed().as_secs_f64();
                if elapsed > 0.0 {
                    let rate = f64::from(iterations) / elapsed;
                    self.write_rate.store(rate.to_bits(), Ordering::Relaxed);
                    debug!(rate, "write loop throughput");
                }
                iterations = 0;
                window_start = Instant::now();
            }
        }
    }

    // ── Round trip ───────────────────────────────────────────────────────────

    /// Measures the heartbeat round-trip time.
    ///
    /// Never fails: if the echo does not arrive within `timeout` the elapsed
    /// wait is returned and the session carries on.
    pub async fn round_trip_time(&self, timeout: Duration) -> Duration {
        async {
            self.round_trip.send_replace(false);
            let mut echoed = self.round_trip.subscribe();
            let start = Instant::now();

            if let Err(e) = self
                .link
                .send(&SensorPacket::heartbeat_request(ROUND_TRIP_ID))
                .await
            {
                warn!("round-trip heartbeat could not be sent: {e}");
                return start.elapsed();
            }

            let echo = tokio::time::timeout(timeout, echoed.wait_for(|done| *done))
                .await
                .map(|waited| waited.map(|_| ()));
            match echo {
                Ok(Ok(())) => {
                    let rtt = start.elapsed();
                    debug!(rtt_ms = rtt.as_secs_f64() * 1000.0, "round trip complete");
                    rtt
                }
                _ => {
                    warn!(?timeout, "round-trip heartbeat timed out");
                    start.elapsed()
                }
            }
        }
        .instrument(self.span.clone())
        .await
    }

    // ── Disable ──────────────────────────────────────────────────────────────

    /// Commands the sensor into its safe state and resets the buffer.
    pub async fn disable(&self) -> Result<(), SessionError> {
        self.disable_inner().instrument(self.span.clone()).await
    }

    async fn disable_inner(&self) -> Result<(), SessionError> {
        retry(
            self.config.disable_policy,
            |_: &SessionError| true,
            || async {
                self.link
                    .send(&SensorPacket::disable())
                    .await
                    .map_err(SessionError::from)
            },
        )
        .await?;
        if let Some(buffer) = self.buffer() {
            buffer.reset();
        }
        info!("sensor disabled");
        Ok(())
    }

    // ── Lifecycle ────────────────────────────────────────────────────────────

    /// Runs ping, read loop and write loop until one of them fails, then
    /// tears the session down.  Returns once the buffer has been released.
    pub async fn run(&self) {
        async {
            info!("session started");
            let mut stop = self.stop.subscribe();
            let outcome = tokio::select! {
                joined = async {
                    tokio::try_join!(
                        self.ping(self.config.ping_timeout),
                        self.read_loop(),
                        self.write_loop(self.config.cycle_period),
                    )
                } => joined.map(|_| ()),
                _ = stop.wait_for(|stopped| *stopped) => {
                    info!("session stop requested");
                    Ok(())
                }
            };

            match outcome {
                Ok(()) => info!("session finished"),
                Err(SessionError::Link(e)) => info!("sensor link ended: {e}"),
                Err(e) => error!("session failed: {e}"),
            }

            self.state.send_replace(SessionState::Terminated);
            self.release_buffer().await;
            info!("session terminated");
        }
        .instrument(self.span.clone())
        .await
    }

    /// Asks a running (or not yet started) session to end.
    pub fn stop(&self) {
        self.stop.send_replace(true);
    }

    /// Marks the buffer closing, waits up to the grace period for readers to
    /// detach, and removes it from the store.
    async fn release_buffer(&self) {
        let Some(buffer) = self.lock_buffer().take() else {
            return;
        };
        buffer.mark_closing();

        let drained = async {
            while buffer.reader_count() > 0 {
                tokio::time::sleep(READER_POLL_INTERVAL).await;
            }
        };
        if tokio::time::timeout(self.config.terminate_timeout, drained)
            .await
            .is_err()
        {
            warn!(
                readers = buffer.reader_count(),
                "buffer readers still attached after grace period; removing anyway"
            );
        }
        self.store.remove(&buffer);
        debug!(key = buffer.key(), "buffer released");
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::link::mock::{sensor_responder, MockLink, MockLinkHandle};
    use sensor_core::{ParamValue, ProtocolError, SensorUid};

    const PORT: &str = "/dev/ttyACM0";

    fn line_follower() -> SensorUid {
        SensorUid {
            device_type: 0x02,
            year: 0x15,
            id: 77,
        }
    }

    fn subscription(params: u16) -> SensorPacket {
        SensorPacket::SubscriptionResponse(SubscriptionResponse {
            params,
            delay: 40,
            uid: line_follower(),
        })
    }

    fn floats(values: &[f32]) -> Vec<u8> {
        values.iter().flat_map(|v| v.to_le_bytes()).collect()
    }

    fn fast_config() -> SessionConfig {
        SessionConfig {
            write_interval: Duration::from_millis(5),
            terminate_timeout: Duration::from_millis(200),
            ping_timeout: Duration::from_millis(100),
            ping_policy: RetryPolicy::constant(3, Duration::from_millis(50)),
            disable_policy: RetryPolicy::constant(3, Duration::from_millis(10)),
            cycle_period: 10,
        }
    }

    fn session() -> (Arc<SensorSession>, MockLinkHandle, Arc<BufferStore>) {
        let (link, handle) = MockLink::pair(PORT);
        let store = Arc::new(BufferStore::new());
        let session = SensorSession::new(
            Arc::new(link),
            Arc::clone(&store),
            fast_config(),
            Span::none(),
        );
        (Arc::new(session), handle, store)
    }

    fn session_on(port: &str, store: &Arc<BufferStore>) -> (Arc<SensorSession>, MockLinkHandle) {
        let (link, handle) = MockLink::pair(port);
        let session = SensorSession::new(Arc::new(link), Arc::clone(store), fast_config(), Span::none());
        (Arc::new(session), handle)
    }

    fn spawn_run(session: &Arc<SensorSession>) -> tokio::task::JoinHandle<()> {
        let session = Arc::clone(session);
        tokio::spawn(async move { session.run().await })
    }

    fn spawn_read_loop(session: &Arc<SensorSession>) -> tokio::task::JoinHandle<Result<(), SessionError>> {
        let session = Arc::clone(session);
        tokio::spawn(async move { session.read_loop().await })
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_heartbeat_request_is_echoed_before_ready() {
        // Arrange
        let (session, handle, _store) = session();
        let reader = spawn_read_loop(&session);

        // Act
        handle.push(SensorPacket::heartbeat_request(42));
        let reply = handle
            .wait_for_sent(|p| matches!(p, SensorPacket::HeartbeatResponse { .. }))
            .await;

        // Assert
        assert_eq!(reply, SensorPacket::heartbeat_response(42));
        assert_eq!(session.state(), SessionState::Disconnected);
        reader.abort();
    }

    #[tokio::test]
    async fn test_each_heartbeat_request_gets_exactly_one_response() {
        let (session, handle, _store) = session();
        let reader = spawn_read_loop(&session);

        handle.push(SensorPacket::heartbeat_request(1));
        handle.push(subscription(0b001));
        handle.push(SensorPacket::heartbeat_request(2));
        handle
            .wait_for_sent(|p| *p == SensorPacket::heartbeat_response(2))
            .await;

        assert_eq!(
            handle.count_sent(|p| matches!(p, SensorPacket::HeartbeatResponse { .. })),
            2
        );
        reader.abort();
    }

    #[tokio::test]
    async fn test_device_data_before_subscription_is_dropped() {
        // Arrange
        let (session, handle, store) = session();
        let reader = spawn_read_loop(&session);

        // Act: data first, then the identity
        handle.push(SensorPacket::DeviceData {
            params: 0b111,
            data: floats(&[1.0, 2.0, 3.0]),
        });
        handle.push(subscription(0b111));
        handle.push(SensorPacket::heartbeat_request(0));
        handle.wait_for_sent(|p| matches!(p, SensorPacket::HeartbeatResponse { .. })).await;

        // Assert
        assert!(session.is_ready());
        let buffer = store.attach(&line_follower().buffer_key()).expect("buffer opened");
        assert_eq!(buffer.current("left"), Ok(ParamValue::F32(0.0)));
        reader.abort();
    }

    #[tokio::test]
    async fn test_subscription_response_opens_buffer_and_marks_ready() {
        let (session, handle, store) = session();
        let reader = spawn_read_loop(&session);

        handle.push(subscription(0b011));
        handle.push(SensorPacket::DeviceData {
            params: 0b011,
            data: floats(&[0.5, 0.25]),
        });
        handle.push(SensorPacket::heartbeat_request(0));
        handle.wait_for_sent(|p| matches!(p, SensorPacket::HeartbeatResponse { .. })).await;

        assert_eq!(session.state(), SessionState::ReadySubscribed);
        assert_eq!(store.len(), 1);
        let status = session.snapshot().expect("ready session has a snapshot");
        assert_eq!(status.subscription, vec!["left", "center"]);
        assert_eq!(status.values.get("center"), Some(&ParamValue::F32(0.25)));
        reader.abort();
    }

    #[tokio::test]
    async fn test_empty_subscription_is_ready_unbuffered() {
        let (session, handle, _store) = session();
        let reader = spawn_read_loop(&session);

        handle.push(subscription(0));
        handle.push(SensorPacket::heartbeat_request(0));
        handle.wait_for_sent(|p| matches!(p, SensorPacket::HeartbeatResponse { .. })).await;

        assert_eq!(session.state(), SessionState::ReadyUnbuffered);
        assert!(session.snapshot().is_some());
        reader.abort();
    }

    #[tokio::test]
    async fn test_device_data_length_mismatch_fails_session() {
        // Arrange
        let (session, handle, _store) = session();
        let reader = spawn_read_loop(&session);

        // Act: three fields subscribed, two sent
        handle.push(subscription(0b111));
        handle.push(SensorPacket::DeviceData {
            params: 0b111,
            data: floats(&[1.0, 2.0]),
        });

        // Assert
        let result = reader.await.unwrap();
        assert!(matches!(
            result,
            Err(SessionError::Buffer(BufferError::LengthMismatch {
                expected: 12,
                actual: 8
            }))
        ));
    }

    #[tokio::test]
    async fn test_resubscription_switches_expected_layout() {
        // Arrange: B1 = all three fields, B2 = right only
        let (session, handle, _store) = session();
        let reader = spawn_read_loop(&session);
        handle.push(subscription(0b111));
        handle.push(subscription(0b100));

        // Act: data sized for B2 is accepted
        handle.push(SensorPacket::DeviceData {
            params: 0b100,
            data: floats(&[7.0]),
        });
        handle.push(SensorPacket::heartbeat_request(0));
        handle.wait_for_sent(|p| matches!(p, SensorPacket::HeartbeatResponse { .. })).await;

        // Assert
        let buffer = session.buffer().unwrap();
        assert_eq!(buffer.subscription(), 0b100);
        assert_eq!(buffer.current("right"), Ok(ParamValue::F32(7.0)));

        // Act: data sized for B1 is rejected
        handle.push(SensorPacket::DeviceData {
            params: 0b111,
            data: floats(&[1.0, 2.0, 3.0]),
        });
        assert!(matches!(reader.await.unwrap(), Err(SessionError::Buffer(_))));
    }

    #[tokio::test]
    async fn test_identity_change_rekeys_buffer_and_stays_ready() {
        // Arrange
        let (session, handle, store) = session();
        let reader = spawn_read_loop(&session);
        let replacement = SensorUid {
            id: 78,
            ..line_follower()
        };
        handle.push(subscription(0b111));

        // Act: the same port now reports a different board
        handle.push(SensorPacket::SubscriptionResponse(SubscriptionResponse {
            params: 0b001,
            delay: 40,
            uid: replacement,
        }));
        handle.push(SensorPacket::DeviceData {
            params: 0b001,
            data: floats(&[4.0]),
        });
        handle.push(SensorPacket::heartbeat_request(0));
        handle.wait_for_sent(|p| matches!(p, SensorPacket::HeartbeatResponse { .. })).await;

        // Assert
        assert_eq!(session.state(), SessionState::ReadySubscribed);
        assert_eq!(store.keys(), vec![replacement.buffer_key()]);
        assert!(store.attach(&line_follower().buffer_key()).is_none());
        let buffer = session.buffer().unwrap();
        assert_eq!(buffer.key(), replacement.buffer_key());
        assert_eq!(buffer.current("left"), Ok(ParamValue::F32(4.0)));
        assert!(!reader.is_finished());
        reader.abort();
    }

    #[tokio::test]
    async fn test_subscription_bits_past_the_layout_are_masked() {
        // Arrange
        let (session, handle, _store) = session();
        let reader = spawn_read_loop(&session);

        // Act: bit 7 does not exist on a line follower
        handle.push(subscription(0b1000_0001));
        handle.push(SensorPacket::DeviceData {
            params: 0b1000_0001,
            data: floats(&[2.0]),
        });
        handle.push(SensorPacket::heartbeat_request(0));
        handle.wait_for_sent(|p| matches!(p, SensorPacket::HeartbeatResponse { .. })).await;

        // Assert
        assert_eq!(session.state(), SessionState::ReadySubscribed);
        let buffer = session.buffer().unwrap();
        assert_eq!(buffer.subscription(), 0b001);
        assert_eq!(buffer.current("left"), Ok(ParamValue::F32(2.0)));
        reader.abort();
    }

    #[tokio::test]
    async fn test_subscription_of_only_unknown_bits_is_ready_unbuffered() {
        let (session, handle, _store) = session();
        let reader = spawn_read_loop(&session);

        handle.push(subscription(0b1000));
        handle.push(SensorPacket::heartbeat_request(0));
        handle.wait_for_sent(|p| matches!(p, SensorPacket::HeartbeatResponse { .. })).await;

        assert_eq!(session.state(), SessionState::ReadyUnbuffered);
        assert_eq!(session.buffer().unwrap().subscription(), 0);
        reader.abort();
    }

    #[tokio::test]
    async fn test_unknown_device_type_fails_session() {
        let (session, handle, store) = session();
        let reader = spawn_read_loop(&session);

        handle.push(SensorPacket::SubscriptionResponse(SubscriptionResponse {
            params: 1,
            delay: 0,
            uid: SensorUid {
                device_type: 0x4242,
                year: 0,
                id: 1,
            },
        }));

        assert!(matches!(
            reader.await.unwrap(),
            Err(SessionError::Buffer(BufferError::UnknownDevice(0x4242)))
        ));
        assert!(store.is_empty());
        assert!(!session.is_ready());
    }

    #[tokio::test]
    async fn test_unexpected_packet_kind_fails_session() {
        let (session, handle, _store) = session();
        let reader = spawn_read_loop(&session);

        handle.push(SensorPacket::DeviceWrite {
            params: 1,
            data: vec![0],
        });

        assert!(matches!(
            reader.await.unwrap(),
            Err(SessionError::UnexpectedPacket(MessageId::DeviceWrite))
        ));
    }

    #[tokio::test]
    async fn test_error_packet_and_bad_frames_do_not_fail_session() {
        let (session, handle, _store) = session();
        let reader = spawn_read_loop(&session);

        handle.push(SensorPacket::Error { code: 3 });
        handle.push_error(LinkError::Codec(ProtocolError::ChecksumMismatch {
            expected: 1,
            actual: 2,
        }));
        handle.push(SensorPacket::heartbeat_request(5));
        handle.wait_for_sent(|p| *p == SensorPacket::heartbeat_response(5)).await;

        assert!(!reader.is_finished());
        reader.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn test_ping_succeeds_when_sensor_answers() {
        let (session, handle, _store) = session();
        handle.set_responder(sensor_responder(line_follower(), 0b001, 40));
        let reader = spawn_read_loop(&session);

        session.ping(Duration::from_millis(100)).await.unwrap();

        assert!(session.is_ready());
        assert_eq!(handle.count_sent(|p| *p == SensorPacket::Ping), 1);
        reader.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn test_ping_gives_up_after_retry_budget() {
        // Arrange: nobody answers
        let (session, handle, _store) = session();
        let reader = spawn_read_loop(&session);
        let start = Instant::now();

        // Act
        let result = session.ping(Duration::from_millis(100)).await;

        // Assert
        assert!(matches!(result, Err(SessionError::PingTimeout { attempts: 3 })));
        assert_eq!(handle.count_sent(|p| *p == SensorPacket::Ping), 3);
        // 3 x 100 ms timeouts + 2 x 50 ms pauses
        assert!(start.elapsed() >= Duration::from_millis(400));
        assert_eq!(session.state(), SessionState::Pinging);
        reader.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn test_round_trip_time_returns_elapsed_on_timeout() {
        // Arrange: sensor never echoes
        let (session, handle, _store) = session();
        let reader = spawn_read_loop(&session);

        // Act
        let rtt = session.round_trip_time(Duration::from_secs(5)).await;

        // Assert
        assert!(rtt >= Duration::from_secs(5));
        assert!(!reader.is_finished(), "session must stay alive");
        assert_eq!(
            handle.sent(),
            vec![SensorPacket::heartbeat_request(ROUND_TRIP_ID)]
        );
        reader.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn test_round_trip_time_completes_on_echo() {
        let (session, handle, _store) = session();
        handle.set_responder(sensor_responder(line_follower(), 0, 0));
        let reader = spawn_read_loop(&session);

        let rtt = session.round_trip_time(Duration::from_secs(5)).await;

        assert!(rtt < Duration::from_secs(5));
        reader.abort();
    }

    #[tokio::test]
    async fn test_round_trip_time_survives_dead_link() {
        let (session, handle, _store) = session();
        handle.disconnect();

        let rtt = session.round_trip_time(Duration::from_secs(1)).await;

        assert!(rtt < Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_loop_sends_pending_writes_once_ready() {
        // Arrange: a servo controller with a queued write
        let (session, handle, _store) = session();
        let servo = SensorUid {
            device_type: 0x06,
            year: 0x15,
            id: 3,
        };
        let reader = spawn_read_loop(&session);
        let writer = {
            let session = Arc::clone(&session);
            tokio::spawn(async move { session.write_loop(10).await })
        };
        handle.push(SensorPacket::SubscriptionResponse(SubscriptionResponse {
            params: 0b11,
            delay: 20,
            uid: servo,
        }));
        handle.push(SensorPacket::heartbeat_request(0));
        handle.wait_for_sent(|p| matches!(p, SensorPacket::HeartbeatResponse { .. })).await;

        // Act
        session
            .buffer()
            .unwrap()
            .set_desired("servo0", ParamValue::F32(0.75))
            .unwrap();
        let write = handle
            .wait_for_sent(|p| matches!(p, SensorPacket::DeviceWrite { .. }))
            .await;

        // Assert
        assert_eq!(
            write,
            SensorPacket::DeviceWrite {
                params: 0b01,
                data: floats(&[0.75]),
            }
        );
        writer.abort();
        reader.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_loop_samples_throughput_every_cycle_period() {
        let (session, handle, _store) = session();
        let reader = spawn_read_loop(&session);
        let writer = {
            let session = Arc::clone(&session);
            tokio::spawn(async move { session.write_loop(10).await })
        };
        handle.push(subscription(0b001));

        tokio::time::sleep(Duration::from_millis(200)).await;

        // 5 ms interval: about 200 iterations per second.
        let rate = session.write_rate();
        assert!(rate > 150.0 && rate < 250.0, "rate was {rate}");
        writer.abort();
        reader.abort();
    }

    #[tokio::test]
    async fn test_write_loop_exits_when_terminated_before_ready() {
        let (session, _handle, _store) = session();
        session.state.send_replace(SessionState::Terminated);

        assert!(session.write_loop(10).await.is_ok());
    }

    #[tokio::test]
    async fn test_disable_sends_disable_and_resets_buffer() {
        // Arrange
        let (session, handle, _store) = session();
        let reader = spawn_read_loop(&session);
        handle.push(subscription(0b001));
        handle.push(SensorPacket::DeviceData {
            params: 0b001,
            data: floats(&[9.0]),
        });
        handle.push(SensorPacket::heartbeat_request(0));
        handle.wait_for_sent(|p| matches!(p, SensorPacket::HeartbeatResponse { .. })).await;

        // Act
        session.disable().await.unwrap();

        // Assert
        assert_eq!(handle.count_sent(|p| *p == SensorPacket::DeviceDisable), 1);
        assert_eq!(
            session.buffer().unwrap().current("left"),
            Ok(ParamValue::F32(0.0))
        );
        reader.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn test_disable_retries_then_fails_on_dead_link() {
        let (session, handle, _store) = session();
        handle.disconnect();

        let result = session.disable().await;

        assert!(matches!(result, Err(SessionError::Link(LinkError::Transport(_)))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_releases_buffer_after_disconnect() {
        // Arrange
        let (session, handle, store) = session();
        handle.set_responder(sensor_responder(line_follower(), 0b111, 40));
        let runner = {
            let session = Arc::clone(&session);
            tokio::spawn(async move { session.run().await })
        };
        handle.wait_for_sent(|p| *p == SensorPacket::Ping).await;
        settle().await;
        assert_eq!(store.len(), 1);

        // Act
        handle.disconnect();
        runner.await.unwrap();

        // Assert
        assert_eq!(session.state(), SessionState::Terminated);
        assert!(session.buffer().is_none());
        assert!(store.is_empty());
        assert!(session.snapshot().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_session_with_same_uid_survives_first_disconnect() {
        // Arrange: two ports report the same sensor identity
        let store = Arc::new(BufferStore::new());
        let (first, first_handle) = session_on("/dev/ttyACM0", &store);
        let (second, second_handle) = session_on("/dev/ttyACM1", &store);
        first_handle.set_responder(sensor_responder(line_follower(), 0b111, 40));
        second_handle.set_responder(sensor_responder(line_follower(), 0b111, 40));
        let first_run = spawn_run(&first);
        first_handle.wait_for_sent(|p| *p == SensorPacket::Ping).await;
        settle().await;
        let second_run = spawn_run(&second);
        second_handle.wait_for_sent(|p| *p == SensorPacket::Ping).await;
        settle().await;
        assert!(first.is_closing(), "older session hands the key over");

        // Act
        first_handle.disconnect();
        first_run.await.unwrap();

        // Assert
        assert!(second.is_ready());
        assert!(!second.is_closing());
        assert!(second.snapshot().is_some());
        assert_eq!(store.len(), 1);
        let reader = store.attach(&line_follower().buffer_key()).unwrap();
        second.buffer().unwrap().set_current("center", ParamValue::F32(3.5)).unwrap();
        assert_eq!(reader.current("center"), Ok(ParamValue::F32(3.5)));
        drop(reader);
        second.stop();
        second_run.await.unwrap();
        assert!(store.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_waits_grace_period_for_attached_reader() {
        // Arrange: a reader holds the buffer through teardown
        let (session, handle, store) = session();
        handle.set_responder(sensor_responder(line_follower(), 0b001, 40));
        let runner = {
            let session = Arc::clone(&session);
            tokio::spawn(async move { session.run().await })
        };
        handle.wait_for_sent(|p| *p == SensorPacket::Ping).await;
        settle().await;
        let reader = store.attach(&line_follower().buffer_key()).unwrap();
        let start = Instant::now();

        // Act
        handle.disconnect();
        runner.await.unwrap();

        // Assert: teardown is bounded by the grace period
        assert!(start.elapsed() >= Duration::from_millis(200));
        assert!(reader.is_closing());
        assert!(store.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_ends_run_and_releases_buffer() {
        // Arrange
        let (session, handle, store) = session();
        handle.set_responder(sensor_responder(line_follower(), 0b001, 40));
        let runner = {
            let session = Arc::clone(&session);
            tokio::spawn(async move { session.run().await })
        };
        handle.wait_for_sent(|p| *p == SensorPacket::Ping).await;
        settle().await;

        // Act
        session.stop();
        runner.await.unwrap();

        // Assert
        assert_eq!(session.state(), SessionState::Terminated);
        assert!(store.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_ends_when_sensor_never_answers() {
        let (session, handle, _store) = session();
        let runner = {
            let session = Arc::clone(&session);
            tokio::spawn(async move { session.run().await })
        };

        runner.await.unwrap();

        assert_eq!(session.state(), SessionState::Terminated);
        assert_eq!(handle.count_sent(|p| *p == SensorPacket::Ping), 3);
    }
}
