//! DeviceOrchestrator: owns the set of live sensor sessions.
//!
//! The orchestrator is the single owner of the session set.  Everything that
//! changes it arrives as a message on one of its queues and is handled on the
//! orchestrator's own task:
//!
//! ```text
//!  hotplug thread ──► HotplugEvent ──┐
//!  command socket ──► CommandRequest ├──► DeviceOrchestrator::run ──► sessions
//!  session tasks  ──► exit notice ───┘              │
//!                                                   └──► StatusPublisher ("UPDATE")
//! ```
//!
//! A session is added when its port is launched and removed only when its
//! run task reports that it has exited, so the set always reflects the
//! sessions that are actually running.

use std::collections::{BTreeMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use sensor_core::{BufferStatus, BufferStore};
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, info_span, warn, Instrument, Span};

use super::command::{CommandRequest, SensorCommand};
use super::session::{SensorSession, SessionConfig};
use super::status::{StatusEvent, StatusPublisher};
use crate::infrastructure::hotplug::{HotplugAction, HotplugEvent};
use crate::infrastructure::link::LinkFactory;

/// Orchestrator timing.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OrchestratorConfig {
    /// Period of the status broadcast.
    pub broadcast_interval: Duration,
    pub session: SessionConfig,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            broadcast_interval: Duration::from_millis(200),
            session: SessionConfig::default(),
        }
    }
}

/// Reports a session's exit when its run task ends, however it ends.
struct ExitNotice {
    session: Arc<SensorSession>,
    tx: mpsc::UnboundedSender<Arc<SensorSession>>,
}

impl Drop for ExitNotice {
    fn drop(&mut self) {
        // The orchestrator may already be gone during shutdown.
        let _ = self.tx.send(Arc::clone(&self.session));
    }
}

pub struct DeviceOrchestrator {
    factory: Arc<dyn LinkFactory>,
    store: Arc<BufferStore>,
    publisher: Arc<dyn StatusPublisher>,
    config: OrchestratorConfig,
    /// Live sessions keyed by port path.
    sessions: BTreeMap<String, Arc<SensorSession>>,
    /// Ports re-added while their previous session was still live.
    deferred: HashSet<String>,
    exit_tx: mpsc::UnboundedSender<Arc<SensorSession>>,
    exit_rx: mpsc::UnboundedReceiver<Arc<SensorSession>>,
    span: Span,
}

impl DeviceOrchestrator {
    pub fn new(
        factory: Arc<dyn LinkFactory>,
        store: Arc<BufferStore>,
        publisher: Arc<dyn StatusPublisher>,
        config: OrchestratorConfig,
        span: Span,
    ) -> Self {
        let (exit_tx, exit_rx) = mpsc::unbounded_channel();
        Self {
            factory,
            store,
            publisher,
            config,
            sessions: BTreeMap::new(),
            deferred: HashSet::new(),
            exit_tx,
            exit_rx,
            span,
        }
    }

    /// Ports with a live session, sorted.
    pub fn ports(&self) -> Vec<String> {
        self.sessions.keys().cloned().collect()
    }

    pub fn session(&self, port: &str) -> Option<Arc<SensorSession>> {
        self.sessions.get(port).cloned()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    // ── Hotplug ──────────────────────────────────────────────────────────────

    /// Launches one session per port of an `Add`; other actions are only logged.
    pub fn handle_hotplug_event(&mut self, event: HotplugEvent) {
        let span = self.span.clone();
        let _entered = span.enter();
        match event.action {
            HotplugAction::Add => {
                if event.ports.is_empty() {
                    debug!(path = %event.device_path.display(), "sensor added without serial ports");
                }
                for port in &event.ports {
                    self.launch(port);
                }
            }
            action => debug!(?action, path = %event.device_path.display(), "hotplug event"),
        }
    }

    fn launch(&mut self, port: &str) {
        if self.sessions.contains_key(port) {
            info!(port, "previous session still live; deferring launch");
            self.deferred.insert(port.to_string());
            return;
        }

        let link = match self.factory.open(port) {
            Ok(link) => link,
            Err(e) => {
                warn!(port, "skipping sensor port: {e}");
                return;
            }
        };

        let span = info_span!(parent: &self.span, "sensor", port = %port);
        let session = Arc::new(SensorSession::new(
            link,
            Arc::clone(&self.store),
            self.config.session,
            span,
        ));
        self.sessions.insert(port.to_string(), Arc::clone(&session));

        let notice = ExitNotice {
            session: Arc::clone(&session),
            tx: self.exit_tx.clone(),
        };
        tokio::spawn(async move {
            let _notice = notice;
            session.run().await;
        });
        info!(port, sessions = self.sessions.len(), "sensor session launched");
    }

    /// Removes an exited session and launches any deferred successor.
    /// Notices for sessions no longer in the set are ignored.
    pub fn handle_session_exit(&mut self, session: Arc<SensorSession>) {
        let span = self.span.clone();
        let _entered = span.enter();
        let port = session.port().to_string();
        match self.sessions.get(&port) {
            Some(live) if Arc::ptr_eq(live, &session) => {
                self.sessions.remove(&port);
                info!(port = %port, sessions = self.sessions.len(), "sensor session removed");
            }
            _ => {
                debug!(port = %port, "exit notice for untracked session");
                return;
            }
        }
        if self.deferred.remove(&port) {
            self.launch(&port);
        }
    }

    /// Waits for the next session to exit and handles it.  Returns its port.
    pub async fn next_exit(&mut self) -> Option<String> {
        let session = self.exit_rx.recv().await?;
        let port = session.port().to_string();
        self.handle_session_exit(session);
        Some(port)
    }

    // ── Status ───────────────────────────────────────────────────────────────

    /// Buffer status of every ready session that is not tearing down.
    pub fn snapshot(&self) -> Vec<BufferStatus> {
        self.sessions
            .values()
            .filter(|s| !s.is_closing())
            .filter_map(|s| s.snapshot())
            .collect()
    }

    /// Publishes the current snapshot.  Failures are logged only.
    pub async fn broadcast_status(&self) {
        let snapshot = self.snapshot();
        let ready = snapshot.len();
        if let Err(e) = self.publisher.publish(StatusEvent::Update, snapshot).await {
            warn!(parent: &self.span, ready, "status broadcast failed: {e}");
        }
    }

    // ── Commands ─────────────────────────────────────────────────────────────

    /// Answers `request`.  Unknown methods are rejected immediately; known ones
    /// run on their own task so the main loop keeps going.
    pub fn handle_command(&self, request: CommandRequest) {
        let CommandRequest { method, reply } = request;
        let command = match method.parse::<SensorCommand>() {
            Ok(command) => command,
            Err(e) => {
                warn!(parent: &self.span, "rejected command: {e}");
                let _ = reply.send(Err(e));
                return;
            }
        };

        let sessions: Vec<Arc<SensorSession>> = self.sessions.values().cloned().collect();
        let ping_timeout = self.config.session.ping_timeout;
        tokio::spawn(
            async move {
                execute(command, &sessions, ping_timeout).await;
                if reply.send(Ok(())).is_err() {
                    debug!(%command, "caller went away before the reply");
                }
            }
            .instrument(self.span.clone()),
        );
    }

    // ── Main loop ────────────────────────────────────────────────────────────

    /// Runs until `shutdown` resolves, then stops every session and waits
    /// (bounded) for them to exit.
    pub async fn run(
        mut self,
        mut hotplug: mpsc::Receiver<HotplugEvent>,
        mut commands: mpsc::Receiver<CommandRequest>,
        shutdown: impl Future<Output = ()>,
    ) {
        info!(parent: &self.span, interval = ?self.config.broadcast_interval, "orchestrator started");
        let mut ticker = tokio::time::interval(self.config.broadcast_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(shutdown);

        let mut hotplug_open = true;
        let mut commands_open = true;
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                event = hotplug.recv(), if hotplug_open => match event {
                    Some(event) => self.handle_hotplug_event(event),
                    None => {
                        warn!(parent: &self.span, "hotplug monitor stopped; no new sensors will be detected");
                        hotplug_open = false;
                    }
                },
                request = commands.recv(), if commands_open => match request {
                    Some(request) => self.handle_command(request),
                    None => {
                        debug!(parent: &self.span, "command channel closed");
                        commands_open = false;
                    }
                },
                Some(session) = self.exit_rx.recv() => self.handle_session_exit(session),
                _ = ticker.tick() => self.broadcast_status().await,
            }
        }

        self.shutdown().await;
    }

    async fn shutdown(&mut self) {
        info!(parent: &self.span, sessions = self.sessions.len(), "stopping sensor sessions");
        self.deferred.clear();
        for session in self.sessions.values() {
            session.stop();
        }

        let deadline = Instant::now() + self.config.session.terminate_timeout * 2;
        while !self.sessions.is_empty() {
            match tokio::time::timeout_at(deadline, self.exit_rx.recv()).await {
                Ok(Some(session)) => self.handle_session_exit(session),
                Ok(None) => break,
                Err(_) => {
                    warn!(parent: &self.span, remaining = ?self.ports(), "sessions did not exit in time");
                    break;
                }
            }
        }
        info!(parent: &self.span, "orchestrator stopped");
    }
}

/// Runs `command` against every session concurrently and waits for all of them.
pub async fn execute(command: SensorCommand, sessions: &[Arc<SensorSession>], ping_timeout: Duration) {
    match command {
        SensorCommand::PingAll => {
            let results = join_all(sessions.iter().map(|s| s.ping(ping_timeout))).await;
            let unanswered = results.iter().filter(|r| r.is_err()).count();
            debug!(sessions = sessions.len(), unanswered, "ping-all complete");
        }
        SensorCommand::DisableAll => {
            let results = join_all(sessions.iter().map(|s| s.disable())).await;
            for (session, result) in sessions.iter().zip(results) {
                if let Err(e) = result {
                    warn!(port = session.port(), "disable failed: {e}");
                }
            }
            info!(sessions = sessions.len(), "disable-all complete");
        }
        reserved => debug!(command = %reserved, "reserved command ignored"),
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
