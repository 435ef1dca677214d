//! Status socket: fans status notifications out to every connected subscriber.
//!
//! [`StatusBroadcaster`] is the production [`StatusPublisher`].  It encodes
//! each notification once and pushes the line into a tokio broadcast channel;
//! one task per subscriber copies lines from the channel to its socket.  A
//! subscriber that falls behind loses the oldest lines instead of slowing the
//! orchestrator down.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::Duration;

use async_trait::async_trait;
use sensor_core::BufferStatus;
use tokio::io::AsyncWriteExt;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::broadcast;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::StatusNotification;
use crate::application::status::{PublishError, StatusEvent, StatusPublisher};

const ACCEPT_POLL: Duration = Duration::from_millis(200);

/// Lines buffered per subscriber before it starts losing them.
pub const SUBSCRIBER_BACKLOG: usize = 64;

/// Publishes status notifications to status socket subscribers.
#[derive(Debug, Clone)]
pub struct StatusBroadcaster {
    tx: broadcast::Sender<Arc<str>>,
}

impl StatusBroadcaster {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(SUBSCRIBER_BACKLOG);
        Self { tx }
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    fn subscribe(&self) -> broadcast::Receiver<Arc<str>> {
        self.tx.subscribe()
    }
}

impl Default for StatusBroadcaster {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StatusPublisher for StatusBroadcaster {
    async fn publish(&self, event: StatusEvent, params: Vec<BufferStatus>) -> Result<(), PublishError> {
        let notification = StatusNotification {
            event,
            params: &params,
        };
        let mut line =
            serde_json::to_string(&notification).map_err(|e| PublishError::Serialize(e.to_string()))?;
        line.push('\n');
        // An error here only means nobody is listening.
        let _ = self.tx.send(Arc::from(line));
        Ok(())
    }
}

/// Accepts status subscribers until `running` is cleared.
pub async fn run_status_server(listener: UnixListener, broadcaster: StatusBroadcaster, running: Arc<AtomicBool>) {
    info!("status socket ready");
    while running.load(Ordering::Relaxed) {
        match timeout(ACCEPT_POLL, listener.accept()).await {
            Ok(Ok((stream, _addr))) => {
                let rx = broadcaster.subscribe();
                let running = Arc::clone(&running);
                tokio::spawn(serve_subscriber(stream, rx, running));
            }
            Ok(Err(e)) => error!("status socket accept error: {e}"),
            Err(_) => {}
        }
    }
    info!("status socket closed");
}

async fn serve_subscriber(mut stream: UnixStream, mut rx: broadcast::Receiver<Arc<str>>, running: Arc<AtomicBool>) {
    let id = Uuid::new_v4();
    debug!(subscriber = %id, "status subscriber connected");
    while running.load(Ordering::Relaxed) {
        match rx.recv().await {
            Ok(line) => {
                if let Err(e) = stream.write_all(line.as_bytes()).await {
                    debug!(subscriber = %id, "status subscriber went away: {e}");
                    return;
                }
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(subscriber = %id, skipped, "status subscriber is falling behind");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
    debug!(subscriber = %id, "status subscriber closed");
}
