//! In-memory packet links for testing.
//!
//! A [`MockLink`] is driven from the other end through its [`MockLinkHandle`]:
//! tests push inbound packets, inspect what the session sent, and pull the
//! plug.  An optional responder closure answers outbound packets the way
//! sensor firmware would, which keeps multi-step protocol tests short.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use sensor_core::{SensorPacket, SensorUid, SubscriptionResponse};
use tokio::sync::{mpsc, Notify};

use super::{LinkError, LinkFactory, PacketLink};

/// Produces the sensor's replies to one outbound packet.
pub type Responder = Arc<dyn Fn(&SensorPacket) -> Vec<SensorPacket> + Send + Sync>;

type Inbound = Result<SensorPacket, LinkError>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// State shared between a [`MockLink`] and its [`MockLinkHandle`].
struct Shared {
    inbound_tx: Mutex<Option<mpsc::UnboundedSender<Inbound>>>,
    sent: Mutex<Vec<SensorPacket>>,
    sent_notify: Notify,
    responder: Mutex<Option<Responder>>,
}

impl Shared {
    fn push(&self, item: Inbound) -> bool {
        match lock(&self.inbound_tx).as_ref() {
            Some(tx) => tx.send(item).is_ok(),
            None => false,
        }
    }
}

/// A [`PacketLink`] backed by in-memory queues.
pub struct MockLink {
    port: String,
    shared: Arc<Shared>,
    inbound_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Inbound>>,
}

/// The sensor's side of a [`MockLink`].
#[derive(Clone)]
pub struct MockLinkHandle {
    shared: Arc<Shared>,
}

impl MockLink {
    /// Creates a connected link/handle pair.
    pub fn pair(port: &str) -> (Self, MockLinkHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            inbound_tx: Mutex::new(Some(tx)),
            sent: Mutex::new(Vec::new()),
            sent_notify: Notify::new(),
            responder: Mutex::new(None),
        });
        let link = Self {
            port: port.to_string(),
            shared: Arc::clone(&shared),
            inbound_rx: tokio::sync::Mutex::new(rx),
        };
        (link, MockLinkHandle { shared })
    }
}

#[async_trait]
impl PacketLink for MockLink {
    fn port(&self) -> &str {
        &self.port
    }

    async fn send(&self, packet: &SensorPacket) -> Result<(), LinkError> {
        if lock(&self.shared.inbound_tx).is_none() {
            return Err(LinkError::Transport("device disconnected".to_string()));
        }
        lock(&self.shared.sent).push(packet.clone());
        self.shared.sent_notify.notify_waiters();

        let responder = lock(&self.shared.responder).clone();
        if let Some(responder) = responder {
            for reply in responder(packet) {
                self.shared.push(Ok(reply));
            }
        }
        Ok(())
    }

    async fn recv(&self) -> Result<SensorPacket, LinkError> {
        let mut rx = self.inbound_rx.lock().await;
        rx.recv().await.unwrap_or(Err(LinkError::Closed))
    }
}

impl MockLinkHandle {
    /// Delivers a packet as if the sensor had sent it.
    pub fn push(&self, packet: SensorPacket) {
        self.shared.push(Ok(packet));
    }

    /// Delivers a receive error (e.g. an undecodable frame).
    pub fn push_error(&self, error: LinkError) {
        self.shared.push(Err(error));
    }

    /// Installs a firmware stand-in that answers outbound packets.
    pub fn set_responder(&self, responder: Responder) {
        *lock(&self.shared.responder) = Some(responder);
    }

    /// Unplugs the sensor: pending reads see [`LinkError::Closed`] and sends fail.
    pub fn disconnect(&self) {
        lock(&self.shared.inbound_tx).take();
    }

    /// Every packet sent so far.
    pub fn sent(&self) -> Vec<SensorPacket> {
        lock(&self.shared.sent).clone()
    }

    /// Number of sent packets matching `predicate`.
    pub fn count_sent(&self, predicate: impl Fn(&SensorPacket) -> bool) -> usize {
        lock(&self.shared.sent).iter().filter(|p| predicate(p)).count()
    }

    /// Waits until a sent packet matches `predicate` and returns it.
    pub async fn wait_for_sent(&self, predicate: impl Fn(&SensorPacket) -> bool) -> SensorPacket {
        loop {
            let notified = self.shared.sent_notify.notified();
            if let Some(found) = lock(&self.shared.sent).iter().find(|p| predicate(p)) {
                return found.clone();
            }
            notified.await;
        }
    }
}

/// A responder that behaves like healthy sensor firmware: pings are answered
/// with a subscription response for `uid`, heartbeats are echoed.
pub fn sensor_responder(uid: SensorUid, params: u16, delay: u16) -> Responder {
    Arc::new(move |packet: &SensorPacket| match packet {
        SensorPacket::Ping => vec![SensorPacket::SubscriptionResponse(SubscriptionResponse {
            params,
            delay,
            uid,
        })],
        SensorPacket::HeartbeatRequest { id } => vec![SensorPacket::heartbeat_response(*id)],
        _ => Vec::new(),
    })
}

// ── Factory ───────────────────────────────────────────────────────────────────

/// A [`LinkFactory`] that hands out [`MockLink`]s and keeps their handles.
#[derive(Default)]
pub struct MockLinkFactory {
    handles: Mutex<HashMap<String, MockLinkHandle>>,
    failing: Mutex<HashSet<String>>,
    responder: Mutex<Option<Arc<dyn Fn(&str) -> Option<Responder> + Send + Sync>>>,
    opened: Mutex<Vec<String>>,
}

impl MockLinkFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every later `open(port)` fail.
    pub fn fail_port(&self, port: &str) {
        lock(&self.failing).insert(port.to_string());
    }

    /// Chooses a responder for each newly opened port.
    pub fn set_responder(&self, per_port: impl Fn(&str) -> Option<Responder> + Send + Sync + 'static) {
        *lock(&self.responder) = Some(Arc::new(per_port));
    }

    /// Handle of the most recent link opened for `port`.
    pub fn handle(&self, port: &str) -> Option<MockLinkHandle> {
        lock(&self.handles).get(port).cloned()
    }

    /// Ports opened so far, in order, including reopenings.
    pub fn opened(&self) -> Vec<String> {
        lock(&self.opened).clone()
    }
}

impl LinkFactory for MockLinkFactory {
    fn open(&self, port: &str) -> Result<Arc<dyn PacketLink>, LinkError> {
        if lock(&self.failing).contains(port) {
            return Err(LinkError::Open {
                port: port.to_string(),
                reason: "simulated open failure".to_string(),
            });
        }
        let (link, handle) = MockLink::pair(port);
        let chooser = lock(&self.responder).clone();
        if let Some(responder) = chooser.and_then(|choose| choose(port)) {
            handle.set_responder(responder);
        }
        lock(&self.handles).insert(port.to_string(), handle);
        lock(&self.opened).push(port.to_string());
        Ok(Arc::new(link))
    }
}
