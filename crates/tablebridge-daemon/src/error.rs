use std::io;

use thiserror::Error;

use tablebridge_core::protocol::{ErrorKind, SessionId};

/// Failures of the request/response files themselves.
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("channel file missing or malformed: {0}")]
    Corrupt(String),
    #[error("write to worker request file failed: {0}")]
    BrokenWrite(#[source] io::Error),
    #[error("a command is still waiting to be consumed")]
    CommandPending,
    #[error("channel io: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("failed to spawn worker `{program}`: {source}")]
    Spawn {
        program: String,
        source: io::Error,
    },
    #[error("failed to prepare channel files: {0}")]
    Channel(#[source] io::Error),
    #[error("worker io: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("session {0}: {1}")]
    Spawn(SessionId, #[source] WorkerError),
    #[error("session {0}: worker did not respond within {1:?}")]
    ChannelTimeout(SessionId, std::time::Duration),
    #[error("session {0}: {1}")]
    CorruptChannelState(SessionId, String),
    #[error("session {0} is busy with another query")]
    SessionBusy(SessionId),
    #[error("session {0}: {1}")]
    BrokenWrite(SessionId, #[source] ChannelError),
    #[error("unknown session {0}")]
    UnknownSession(SessionId),
    #[error("session {0} is not ready (state: {1})")]
    NotReady(SessionId, &'static str),
    #[error("invalid query: {0}")]
    InvalidQuery(String),
}

impl BridgeError {
    /// Classify a failed channel write for `id`.
    pub fn from_channel(id: SessionId, err: ChannelError) -> Self {
        match err {
            ChannelError::CommandPending => BridgeError::SessionBusy(id),
            ChannelError::Corrupt(msg) => BridgeError::CorruptChannelState(id, msg),
            other => BridgeError::BrokenWrite(id, other),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            BridgeError::Spawn(..) => ErrorKind::SpawnError,
            BridgeError::ChannelTimeout(..) => ErrorKind::ChannelTimeout,
            BridgeError::CorruptChannelState(..) => ErrorKind::CorruptChannelState,
            BridgeError::SessionBusy(_) => ErrorKind::SessionBusy,
            BridgeError::BrokenWrite(..) => ErrorKind::BrokenWrite,
            BridgeError::UnknownSession(_) => ErrorKind::UnknownSession,
            BridgeError::NotReady(..) => ErrorKind::NotReady,
            BridgeError::InvalidQuery(_) => ErrorKind::InvalidQuery,
        }
    }

    /// Faults the registry recovers from by restarting the worker.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            BridgeError::ChannelTimeout(..)
                | BridgeError::BrokenWrite(..)
                | BridgeError::CorruptChannelState(..)
        )
    }
}
