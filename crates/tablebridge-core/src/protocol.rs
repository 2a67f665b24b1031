//! IPC protocol message types for daemon <-> client communication, plus the
//! session and chunk types both sides share.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Opaque session token. Generated once per client connection, never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    /// Compact form used in channel file names.
    pub fn simple(&self) -> String {
        self.0.simple().to_string()
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    Starting,
    Ready,
    Busy,
    /// The worker is blocked until the client supplies a tool result.
    AwaitingTool,
    Unresponsive,
    Terminated,
}

impl SessionState {
    pub fn label(&self) -> &'static str {
        match self {
            SessionState::Starting => "starting",
            SessionState::Ready => "ready",
            SessionState::Busy => "busy",
            SessionState::AwaitingTool => "awaiting_tool",
            SessionState::Unresponsive => "unresponsive",
            SessionState::Terminated => "terminated",
        }
    }
}

/// Why a chunk was flushed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FlushTrigger {
    SizeThreshold,
    TimeThreshold,
    PromptDetected,
    EndOfStream,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputChunk {
    pub session_id: SessionId,
    pub text: String,
    pub produced_at: DateTime<Utc>,
    pub trigger: FlushTrigger,
}

/// Snapshot of a worker session as reported to clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionInfo {
    pub id: SessionId,
    pub state: SessionState,
    pub pid: Option<u32>,
    pub last_activity: DateTime<Utc>,
    pub pending_query: Option<String>,
    pub restarts: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    SpawnError,
    ChannelTimeout,
    CorruptChannelState,
    SessionBusy,
    BrokenWrite,
    UnknownSession,
    NotReady,
    InvalidQuery,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientRequest {
    Query { text: String },
    /// Answer to the tool call the worker is blocked on.
    ToolResult { text: String },
    Probe,
    Restart,
    GetSession,
    Ping,
    Shutdown,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum DaemonEvent {
    Welcome {
        session_id: SessionId,
    },
    StateChanged {
        session_id: SessionId,
        state: SessionState,
    },
    Chunk(OutputChunk),
    QueryAccepted {
        session_id: SessionId,
    },
    ToolResultAccepted {
        session_id: SessionId,
    },
    ProbeResult {
        session_id: SessionId,
        alive: bool,
        latency_ms: Option<u64>,
    },
    Restarted {
        session_id: SessionId,
        attempt: u32,
        reason: String,
        dropped_query: Option<String>,
    },
    SessionEnded {
        session_id: SessionId,
        reason: String,
    },
    Session(SessionInfo),
    Pong,
    Error {
        kind: ErrorKind,
        message: String,
    },
}
