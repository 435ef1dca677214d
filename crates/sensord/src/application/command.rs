//! Named commands accepted by the device service.
//!
//! Commands arrive from other processes as a method name and nothing else.
//! They are parsed into a [`SensorCommand`] and carried to the orchestrator
//! as a [`CommandRequest`] together with a one-shot reply channel, so the
//! transport that received the call can wait for the outcome without ever
//! touching the session set itself.

use std::fmt;
use std::str::FromStr;

use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

// ── Commands ──────────────────────────────────────────────────────────────────

/// A command the orchestrator fans out across its sessions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SensorCommand {
    /// Re-ping every session; sensors that never answer are ignored.
    PingAll,
    /// Put every sensor into its safe state.
    DisableAll,
    /// Reserved; accepted and ignored.
    RequestSubscription,
    /// Reserved; accepted and ignored.
    RequestHeartbeat,
    /// Reserved; accepted and ignored.
    RoundTripTime,
}

impl SensorCommand {
    /// Canonical method name.
    pub fn name(self) -> &'static str {
        match self {
            SensorCommand::PingAll => "ping-all",
            SensorCommand::DisableAll => "disable-all",
            SensorCommand::RequestSubscription => "req-sub",
            SensorCommand::RequestHeartbeat => "req-heart",
            SensorCommand::RoundTripTime => "rtt",
        }
    }

    /// Whether the command is recognized but has no effect.
    pub fn is_reserved(self) -> bool {
        !matches!(self, SensorCommand::PingAll | SensorCommand::DisableAll)
    }
}

impl fmt::Display for SensorCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for SensorCommand {
    type Err = CommandError;

    /// Accepts `-` or `_` as the word separator, in any case.
    fn from_str(method: &str) -> Result<Self, Self::Err> {
        let normalized = method.trim().to_ascii_lowercase().replace('_', "-");
        match normalized.as_str() {
            "ping-all" => Ok(SensorCommand::PingAll),
            "disable-all" => Ok(SensorCommand::DisableAll),
            "req-sub" => Ok(SensorCommand::RequestSubscription),
            "req-heart" => Ok(SensorCommand::RequestHeartbeat),
            "rtt" => Ok(SensorCommand::RoundTripTime),
            _ => Err(CommandError::Unknown(method.to_string())),
        }
    }
}

/// Errors reported back to the caller of a command.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CommandError {
    #[error("unknown command: {0:?}")]
    Unknown(String),

    /// The orchestrator is gone (shutting down or never started).
    #[error("device service is not accepting commands")]
    Unavailable,
}

// ── Requests ──────────────────────────────────────────────────────────────────

/// One call waiting for the orchestrator.
#[derive(Debug)]
pub struct CommandRequest {
    pub method: String,
    pub reply: oneshot::Sender<Result<(), CommandError>>,
}

/// Cloneable handle for submitting commands to the orchestrator.
#[derive(Debug, Clone)]
pub struct CommandClient {
    tx: mpsc::Sender<CommandRequest>,
}

impl CommandClient {
    /// Creates a client and the receiver the orchestrator drains.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<CommandRequest>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }

    /// Submits `method` and waits until the command has run on every session.
    pub async fn call(&self, method: &str) -> Result<(), CommandError> {
        let (reply, outcome) = oneshot::channel();
        self.tx
            .send(CommandRequest {
                method: method.to_string(),
                reply,
            })
            .await
            .map_err(|_| CommandError::Unavailable)?;
        outcome.await.map_err(|_| CommandError::Unavailable)?
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
