use std::path::Path;
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;

use tracing::{debug, info, warn};

use tablebridge_core::ipc;
use tablebridge_core::protocol::{ClientRequest, DaemonEvent, ErrorKind, SessionId};

use crate::error::BridgeError;
use crate::registry::Registry;

/// Per-client event queue depth. A client that falls this far behind is
/// disconnected.
const EVENT_QUEUE: usize = 1024;

/// Channels from connection handlers to the main loop.
#[derive(Clone)]
pub struct ServerLinks {
    pub register_tx: mpsc::UnboundedSender<(SessionId, mpsc::Sender<DaemonEvent>)>,
    pub unregister_tx: mpsc::UnboundedSender<SessionId>,
    pub shutdown_tx: mpsc::UnboundedSender<()>,
}

/// Read a length-delimited frame asynchronously.
async fn read_frame_async(
    reader: &mut (impl AsyncReadExt + Unpin),
) -> Result<Vec<u8>, ipc::FrameError> {
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await?;
    let len = ipc::frame_len(len_buf)?;
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    Ok(payload)
}

/// Write a length-delimited frame asynchronously.
async fn write_frame_async(
    writer: &mut (impl AsyncWriteExt + Unpin),
    payload: &[u8],
) -> Result<(), std::io::Error> {
    writer.write_all(&ipc::encode_frame(payload)).await?;
    writer.flush().await
}

/// Accept clients forever. Every connection is one bridge session.
pub async fn run_server(
    listener: UnixListener,
    registry: Arc<Registry>,
    links: ServerLinks,
) -> std::io::Result<()> {
    loop {
        let (stream, _addr) = listener.accept().await?;
        let registry = registry.clone();
        let links = links.clone();
        tokio::spawn(async move {
            handle_client(stream, registry, links).await;
        });
    }
}

pub fn bind(socket_path: &Path) -> std::io::Result<UnixListener> {
    let listener = UnixListener::bind(socket_path)?;
    info!(socket = %socket_path.display(), "IPC server listening");
    Ok(listener)
}

async fn handle_client(stream: UnixStream, registry: Arc<Registry>, links: ServerLinks) {
    let session_id = SessionId::new();
    let (mut reader, mut writer) = tokio::io::split(stream);
    let (event_tx, mut event_rx) = mpsc::channel::<DaemonEvent>(EVENT_QUEUE);

    if event_tx
        .send(DaemonEvent::Welcome { session_id })
        .await
        .is_err()
    {
        return;
    }
    // The main loop holds the only strong sender, so dropping it there ends
    // the write loop below.
    let reply_tx = event_tx.downgrade();
    if links.register_tx.send((session_id, event_tx)).is_err() {
        return;
    }
    info!(session_id = %session_id, "client connected");

    let write_loop = async {
        while let Some(event) = event_rx.recv().await {
            let json = match serde_json::to_vec(&event) {
                Ok(j) => j,
                Err(e) => {
                    warn!(session_id = %session_id, error = %e, "failed to serialize event");
                    continue;
                }
            };
            if write_frame_async(&mut writer, &json).await.is_err() {
                break;
            }
        }
    };

    let read_loop = async {
        // On spawn failure the client still gets the error, and any later
        // request answers UnknownSession.
        if let Err(e) = registry.get_or_create(session_id).await {
            if !reply(&reply_tx, error_event(&e)).await {
                return;
            }
        }

        loop {
            let payload = match read_frame_async(&mut reader).await {
                Ok(p) => p,
                Err(e) => {
                    debug!(session_id = %session_id, error = %e, "client read ended");
                    break;
                }
            };

            let request: ClientRequest = match serde_json::from_slice(&payload) {
                Ok(r) => r,
                Err(e) => {
                    warn!(session_id = %session_id, error = %e, "invalid request from client");
                    let event = DaemonEvent::Error {
                        kind: ErrorKind::InvalidQuery,
                        message: format!("malformed request: {e}"),
                    };
                    if !reply(&reply_tx, event).await {
                        break;
                    }
                    continue;
                }
            };

            if matches!(request, ClientRequest::Shutdown) {
                let _ = links.shutdown_tx.send(());
                break;
            }

            let event = handle_request(&registry, session_id, request).await;
            if !reply(&reply_tx, event).await {
                break;
            }
        }
    };

    // Run both loops concurrently; when either finishes, clean up
    tokio::select! {
        _ = write_loop => {},
        _ = read_loop => {},
    }

    info!(session_id = %session_id, "client disconnected");
    let _ = links.unregister_tx.send(session_id);
}

async fn reply(tx: &mpsc::WeakSender<DaemonEvent>, event: DaemonEvent) -> bool {
    match tx.upgrade() {
        Some(tx) => tx.send(event).await.is_ok(),
        None => false,
    }
}

async fn handle_request(
    registry: &Arc<Registry>,
    session_id: SessionId,
    request: ClientRequest,
) -> DaemonEvent {
    match request {
        ClientRequest::Query { text } => match registry.submit_query(session_id, &text) {
            Ok(_) => DaemonEvent::QueryAccepted { session_id },
            Err(e) => error_event(&e),
        },
        ClientRequest::ToolResult { text } => match registry.submit_tool_result(session_id, &text) {
            Ok(_) => DaemonEvent::ToolResultAccepted { session_id },
            Err(e) => error_event(&e),
        },
        ClientRequest::Probe => match registry.probe(session_id).await {
            Ok(rtt) => DaemonEvent::ProbeResult {
                session_id,
                alive: true,
                latency_ms: Some(rtt.as_millis() as u64),
            },
            Err(BridgeError::ChannelTimeout(..)) => DaemonEvent::ProbeResult {
                session_id,
                alive: false,
                latency_ms: None,
            },
            Err(e) => error_event(&e),
        },
        ClientRequest::Restart => match registry.restart(session_id).await {
            Ok(info) => DaemonEvent::Session(info),
            Err(e) => error_event(&e),
        },
        ClientRequest::GetSession => match registry.session(session_id) {
            Ok(info) => DaemonEvent::Session(info),
            Err(e) => error_event(&e),
        },
        ClientRequest::Ping => DaemonEvent::Pong,
        // Handled by the read loop.
        ClientRequest::Shutdown => DaemonEvent::Pong,
    }
}

fn error_event(e: &BridgeError) -> DaemonEvent {
    DaemonEvent::Error {
        kind: e.kind(),
        message: e.to_string(),
    }
}
