//! Per-session channel file layout and the reserved sentinel values.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::protocol::SessionId;

/// Keep-alive ping. Discarded by both ends.
pub const HEARTBEAT: &str = "__HEARTBEAT__";
/// Prefix of a probe request: `__PROBE__:<token>`.
pub const PROBE: &str = "__PROBE__";
/// Prefix of a probe acknowledgement: `__PROBE_ACK__:<token>`.
pub const PROBE_ACK: &str = "__PROBE_ACK__";
/// Shutdown command, and the worker's reply to its own idle timeout.
pub const EXIT_COMMAND: &str = "/exit";

pub fn probe_command(token: &str) -> String {
    format!("{PROBE}:{token}")
}

pub fn probe_ack_line(token: &str) -> String {
    format!("{PROBE_ACK}:{token}")
}

/// Token of a `__PROBE__:<token>` command.
pub fn parse_probe(command: &str) -> Option<&str> {
    command.strip_prefix(PROBE)?.strip_prefix(':')
}

/// Token of a `__PROBE_ACK__:<token>` response line.
pub fn parse_probe_ack(line: &str) -> Option<&str> {
    line.strip_prefix(PROBE_ACK)?.strip_prefix(':')
}

/// True for text that must never travel as a user command.
pub fn is_reserved(command: &str) -> bool {
    let command = command.trim();
    command == HEARTBEAT || command.starts_with(PROBE)
}

/// Files shared by one session and its worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelPaths {
    pub request: PathBuf,
    pub response: PathBuf,
    pub request_flag: PathBuf,
    /// Present while the worker is blocked on a tool result.
    pub tool_flag: PathBuf,
}

impl ChannelPaths {
    /// `input_<id>.txt`, `output_<id>.txt` and the two `input_<id>.txt.*` flags
    /// under `dir`.
    pub fn for_session(dir: &Path, id: &SessionId) -> Self {
        let simple = id.simple();
        Self::from_request_response(
            dir.join(format!("input_{simple}.txt")),
            dir.join(format!("output_{simple}.txt")),
        )
    }

    /// Layout as seen by a worker started with two positional paths.
    pub fn from_request_response(request: PathBuf, response: PathBuf) -> Self {
        let flag = |suffix: &str| {
            let mut name = request.clone().into_os_string();
            name.push(suffix);
            PathBuf::from(name)
        };
        Self {
            request_flag: flag(".waiting"),
            tool_flag: flag(".waiting_tool"),
            request,
            response,
        }
    }

    /// Create or truncate both channel files and drop any stale flags.
    pub fn reset(&self) -> io::Result<()> {
        for path in [&self.request, &self.response] {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::File::create(path)?;
        }
        remove_if_exists(&self.request_flag)?;
        remove_if_exists(&self.tool_flag)
    }

    /// Remove every channel file. Missing files are fine.
    pub fn remove(&self) -> io::Result<()> {
        remove_if_exists(&self.request)?;
        remove_if_exists(&self.response)?;
        remove_if_exists(&self.request_flag)?;
        remove_if_exists(&self.tool_flag)
    }
}

fn remove_if_exists(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}
