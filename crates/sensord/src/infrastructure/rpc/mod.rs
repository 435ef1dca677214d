//! Local command and status transport over Unix domain sockets.
//!
//! Both sockets speak newline-delimited JSON.
//!
//! # Command socket
//!
//! One request per line, one response per request:
//!
//! ```text
//! → {"method": "ping-all", "params": []}
//! ← {"ok": true}
//! → {"method": "reboot"}
//! ← {"ok": false, "error": "unknown command: \"reboot\""}
//! ```
//!
//! # Status socket
//!
//! Subscribers connect and only read.  Every broadcast is one line:
//!
//! ```text
//! ← {"event": "UPDATE", "params": [{"device": "LimitSwitch", ...}]}
//! ```

use std::path::{Path, PathBuf};

use sensor_core::BufferStatus;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::net::UnixListener;

use crate::application::status::StatusEvent;

pub mod command_server;
pub mod status_server;

/// Error type for socket setup.
#[derive(Debug, Error)]
pub enum RpcError {
    #[error("failed to bind {path}: {source}")]
    Bind {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Binds a listener at `path`, replacing a stale socket file left by an
/// earlier run.
pub fn bind_unix(path: &Path) -> Result<UnixListener, RpcError> {
    let bind_err = |source| RpcError::Bind {
        path: path.to_path_buf(),
        source,
    };
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir).map_err(bind_err)?;
    }
    match std::fs::remove_file(path) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(bind_err(e)),
    }
    UnixListener::bind(path).map_err(bind_err)
}

// ── Wire types ────────────────────────────────────────────────────────────────

/// One line read from the command socket.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct RpcRequest {
    pub method: String,
    /// Commands take no arguments; anything here is ignored.
    #[serde(default)]
    pub params: Vec<serde_json::Value>,
}

/// The reply to one [`RpcRequest`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RpcResponse {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RpcResponse {
    pub fn ok() -> Self {
        Self { ok: true, error: None }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            error: Some(message.into()),
        }
    }
}

/// One line written to status subscribers.
#[derive(Debug, Serialize)]
pub struct StatusNotification<'a> {
    pub event: StatusEvent,
    pub params: &'a [BufferStatus],
}
