//! Async IPC client for CLI commands.
//!
//! Every connection is its own bridge session: the daemon greets it with
//! `Welcome`, spawns a worker, and tears both down when the connection drops.

use std::path::Path;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;

use tablebridge_core::ipc;
use tablebridge_core::protocol::{ClientRequest, DaemonEvent, SessionId, SessionState};

const CONNECT_ERROR: &str = "Failed to connect to daemon. Is it running? Start with: tablebridged";

pub struct Connection {
    stream: UnixStream,
    session_id: Option<SessionId>,
}

impl Connection {
    pub async fn connect() -> Result<Self, String> {
        Self::connect_to(&ipc::daemon_socket_path()).await
    }

    pub async fn connect_to(socket_path: &Path) -> Result<Self, String> {
        let stream = UnixStream::connect(socket_path)
            .await
            .map_err(|_| CONNECT_ERROR.to_string())?;
        Ok(Self {
            stream,
            session_id: None,
        })
    }

    pub fn session_id(&self) -> Option<SessionId> {
        self.session_id
    }

    pub async fn send(&mut self, req: &ClientRequest) -> Result<(), String> {
        let json = serde_json::to_vec(req).map_err(|e| format!("Serialize error: {e}"))?;
        self.stream
            .write_all(&ipc::encode_frame(&json))
            .await
            .map_err(|e| format!("Write error: {e}"))?;
        self.stream
            .flush()
            .await
            .map_err(|e| format!("Flush error: {e}"))
    }

    /// Next event, or `None` once the daemon closes the connection.
    pub async fn next_event(&mut self) -> Result<Option<DaemonEvent>, String> {
        let mut len_buf = [0u8; 4];
        if self.stream.read_exact(&mut len_buf).await.is_err() {
            return Ok(None);
        }
        let len = ipc::frame_len(len_buf).map_err(|e| e.to_string())?;
        let mut payload = vec![0u8; len];
        self.stream
            .read_exact(&mut payload)
            .await
            .map_err(|e| format!("Read error: {e}"))?;
        let event: DaemonEvent =
            serde_json::from_slice(&payload).map_err(|e| format!("Deserialize error: {e}"))?;
        if let DaemonEvent::Welcome { session_id } = &event {
            self.session_id = Some(*session_id);
        }
        Ok(Some(event))
    }

    /// Block until the session's worker is `Ready`.
    pub async fn wait_ready(&mut self) -> Result<(), String> {
        loop {
            match self.next_event().await? {
                Some(DaemonEvent::StateChanged {
                    state: SessionState::Ready,
                    ..
                }) => return Ok(()),
                Some(DaemonEvent::StateChanged {
                    state: SessionState::AwaitingTool,
                    ..
                }) => return Err(TOOL_CALL_HINT.to_string()),
                Some(DaemonEvent::Error { message, .. }) => return Err(message),
                Some(DaemonEvent::SessionEnded { reason, .. }) => return Err(reason),
                Some(_) => {}
                None => return Err("Daemon closed the connection.".to_string()),
            }
        }
    }
}

pub const TOOL_CALL_HINT: &str =
    "Worker is waiting for a tool result. Use `tablebridge chat` to answer it.";

/// True for events that answer a request, as opposed to session traffic.
pub fn is_reply(event: &DaemonEvent) -> bool {
    matches!(
        event,
        DaemonEvent::QueryAccepted { .. }
            | DaemonEvent::ToolResultAccepted { .. }
            | DaemonEvent::ProbeResult { .. }
            | DaemonEvent::Session(_)
            | DaemonEvent::Pong
            | DaemonEvent::Error { .. }
    )
}

/// Connect, send one request, and wait for its reply.
pub async fn request(req: ClientRequest) -> Result<DaemonEvent, String> {
    let mut conn = Connection::connect().await?;
    conn.send(&req).await?;
    loop {
        match conn.next_event().await? {
            Some(event) if is_reply(&event) => return Ok(event),
            Some(_) => {}
            None => return Err("Daemon closed the connection.".to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tablebridge_core::protocol::ErrorKind;

    #[test]
    fn replies_are_distinguished_from_session_traffic() {
        let id = SessionId::new();
        assert!(is_reply(&DaemonEvent::Pong));
        assert!(is_reply(&DaemonEvent::ToolResultAccepted { session_id: id }));
        assert!(is_reply(&DaemonEvent::Error {
            kind: ErrorKind::SessionBusy,
            message: "busy".into(),
        }));
        assert!(!is_reply(&DaemonEvent::Welcome { session_id: id }));
        assert!(!is_reply(&DaemonEvent::StateChanged {
            session_id: id,
            state: SessionState::Ready,
        }));
    }

    #[tokio::test]
    async fn wait_ready_stops_at_tool_call() {
        use tokio::net::UnixListener;

        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("d.sock");
        let listener = UnixListener::bind(&socket).unwrap();
        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let id = SessionId::new();
            for event in [
                DaemonEvent::Welcome { session_id: id },
                DaemonEvent::StateChanged {
                    session_id: id,
                    state: SessionState::AwaitingTool,
                },
            ] {
                let json = serde_json::to_vec(&event).unwrap();
                stream.write_all(&ipc::encode_frame(&json)).await.unwrap();
            }
            stream
        });

        let mut conn = Connection::connect_to(&socket).await.unwrap();
        let err = conn.wait_ready().await.unwrap_err();
        assert_eq!(err, TOOL_CALL_HINT);
        assert!(conn.session_id().is_some());
        drop(server.await.unwrap());
    }

    #[tokio::test]
    async fn connect_to_missing_socket_fails_with_hint() {
        let dir = tempfile::tempdir().unwrap();
        let err = Connection::connect_to(&dir.path().join("none.sock"))
            .await
            .err()
            .unwrap();
        assert!(err.contains("tablebridged"));
    }
}
