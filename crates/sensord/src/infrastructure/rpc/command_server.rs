//! Command socket: accept loop and per-connection request handling.
//!
//! Each connection runs in its own task and may send any number of
//! requests.  A malformed line gets an error response; the connection stays
//! open.  A line longer than [`MAX_REQUEST_LINE`] gets an error response and
//! the connection is closed.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use super::{RpcRequest, RpcResponse};
use crate::application::command::CommandClient;

/// How often the accept loop checks the shutdown flag.
const ACCEPT_POLL: Duration = Duration::from_millis(200);

/// Longest request line accepted, newline excluded.
pub const MAX_REQUEST_LINE: usize = 64 * 1024;

/// Serves command requests until `running` is cleared.
pub async fn run_command_server(listener: UnixListener, client: CommandClient, running: Arc<AtomicBool>) {
    info!("command socket ready");
    while running.load(Ordering::Relaxed) {
        match timeout(ACCEPT_POLL, listener.accept()).await {
            Ok(Ok((stream, _addr))) => {
                let client = client.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(stream, client).await {
                        debug!("command connection ended with error: {e}");
                    }
                });
            }
            Ok(Err(e)) => error!("command socket accept error: {e}"),
            Err(_) => {}
        }
    }
    info!("command socket closed");
}

/// Answers requests on one connection until the peer hangs up.
pub async fn handle_connection(stream: UnixStream, client: CommandClient) -> std::io::Result<()> {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    let mut raw = Vec::new();

    loop {
        raw.clear();
        let limit = MAX_REQUEST_LINE as u64 + 1;
        if (&mut reader).take(limit).read_until(b'\n', &mut raw).await? == 0 {
            return Ok(());
        }
        if raw.last() == Some(&b'\n') {
            raw.pop();
        } else if raw.len() > MAX_REQUEST_LINE {
            warn!(limit = MAX_REQUEST_LINE, "command request too long; closing connection");
            let response = RpcResponse::error(format!("request longer than {MAX_REQUEST_LINE} bytes"));
            write_response(&mut write_half, &response).await?;
            return Ok(());
        }

        let line = String::from_utf8_lossy(&raw);
        if line.trim().is_empty() {
            continue;
        }
        let response = answer(&line, &client).await;
        write_response(&mut write_half, &response).await?;
    }
}

async fn write_response(
    writer: &mut tokio::net::unix::OwnedWriteHalf,
    response: &RpcResponse,
) -> std::io::Result<()> {
    let mut encoded = serde_json::to_string(response).map_err(std::io::Error::other)?;
    encoded.push('\n');
    writer.write_all(encoded.as_bytes()).await
}

async fn answer(line: &str, client: &CommandClient) -> RpcResponse {
    let request: RpcRequest = match serde_json::from_str(line) {
        Ok(request) => request,
        Err(e) => {
            warn!("invalid command request: {e}");
            return RpcResponse::error(format!("invalid request: {e}"));
        }
    };
    if !request.params.is_empty() {
        debug!(method = %request.method, "ignoring command params");
    }

    match client.call(&request.method).await {
        Ok(()) => {
            debug!(method = %request.method, "command complete");
            RpcResponse::ok()
        }
        Err(e) => RpcResponse::error(e.to_string()),
    }
}
