//! Daemon side of the file channel: the request writer and the cursor-based
//! response reader.

use std::fs::{self, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::sync::Mutex;

use tracing::{debug, info};

use tablebridge_core::layout::{self, ChannelPaths, HEARTBEAT};

use crate::error::ChannelError;

/// Request side of one session's channel.
///
/// Every write to the request file goes through `write_lock`, so the
/// "is a command pending?" check and the overwrite are atomic with respect to
/// the heartbeat timer and query submission.
pub struct FileChannel {
    paths: ChannelPaths,
    write_lock: Mutex<()>,
}

impl FileChannel {
    pub fn new(paths: ChannelPaths) -> Self {
        Self {
            paths,
            write_lock: Mutex::new(()),
        }
    }

    pub fn paths(&self) -> &ChannelPaths {
        &self.paths
    }

    /// The unconsumed command in the request file, if any. Heartbeats and an
    /// empty file both mean "nothing pending".
    pub fn pending_command(&self) -> Result<Option<String>, ChannelError> {
        let content = match fs::read_to_string(&self.paths.request) {
            Ok(c) => c,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(ChannelError::Corrupt(format!(
                    "request file {} missing",
                    self.paths.request.display()
                )))
            }
            Err(e) => return Err(e.into()),
        };
        let trimmed = content.trim();
        if trimmed.is_empty() || trimmed == HEARTBEAT {
            Ok(None)
        } else {
            Ok(Some(trimmed.to_string()))
        }
    }

    pub fn has_pending_command(&self) -> Result<bool, ChannelError> {
        Ok(self.pending_command()?.is_some())
    }

    /// True while the worker's `.waiting` flag file exists.
    pub fn is_worker_waiting(&self) -> bool {
        self.paths.request_flag.exists()
    }

    /// True while the worker's `.waiting_tool` flag file exists.
    pub fn is_awaiting_tool(&self) -> bool {
        self.paths.tool_flag.exists()
    }

    /// Compact the response file through `reader`, holding the request lock
    /// so no command can wake the worker meanwhile. Skipped unless the worker
    /// is parked at its prompt with nothing pending.
    pub fn compact_response(
        &self,
        reader: &mut ResponseReader,
        threshold: u64,
    ) -> Result<bool, ChannelError> {
        let _guard = self.lock();
        if !self.is_worker_waiting() || self.has_pending_command()? {
            return Ok(false);
        }
        reader.compact(threshold)
    }

    /// Overwrite the request file with `text` and exactly one newline,
    /// durably. Refuses to clobber a command the worker has not consumed yet.
    pub fn write_command(&self, text: &str) -> Result<(), ChannelError> {
        let _guard = self.lock();
        if self.has_pending_command()? {
            return Err(ChannelError::CommandPending);
        }
        self.overwrite_request(text)
    }

    /// Write a heartbeat unless a real command is pending. Returns whether
    /// the heartbeat was written.
    pub fn write_heartbeat(&self) -> Result<bool, ChannelError> {
        let _guard = self.lock();
        if self.has_pending_command()? {
            return Ok(false);
        }
        self.overwrite_request(HEARTBEAT)?;
        Ok(true)
    }

    pub fn write_probe(&self, token: &str) -> Result<(), ChannelError> {
        self.write_command(&layout::probe_command(token))
    }

    /// Shutdown path: overwrite whatever is pending with `/exit`.
    pub fn write_exit(&self) -> Result<(), ChannelError> {
        let _guard = self.lock();
        self.overwrite_request(layout::EXIT_COMMAND)
    }

    fn overwrite_request(&self, text: &str) -> Result<(), ChannelError> {
        let text = text.trim_end_matches(['\r', '\n']);
        let mut file = match OpenOptions::new()
            .write(true)
            .truncate(true)
            .open(&self.paths.request)
        {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(ChannelError::Corrupt(format!(
                    "request file {} missing",
                    self.paths.request.display()
                )))
            }
            Err(e) => return Err(ChannelError::BrokenWrite(e)),
        };
        file.write_all(text.as_bytes())
            .and_then(|()| file.write_all(b"\n"))
            .and_then(|()| file.flush())
            .and_then(|()| file.sync_all())
            .map_err(ChannelError::BrokenWrite)?;
        debug!(path = %self.paths.request.display(), bytes = text.len() + 1, "request written");
        Ok(())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ()> {
        self.write_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Incremental reader over the append-only response file.
pub struct ResponseReader {
    path: PathBuf,
    cursor: u64,
    partial: Vec<u8>,
}

impl ResponseReader {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            cursor: 0,
            partial: Vec::new(),
        }
    }

    #[cfg(test)]
    pub fn cursor(&self) -> u64 {
        self.cursor
    }

    /// Text appended since the previous read. A file shorter than the cursor
    /// was rotated by the writer: start over from byte 0.
    pub fn read_new(&mut self) -> Result<String, ChannelError> {
        let len = match fs::metadata(&self.path) {
            Ok(meta) => meta.len(),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(ChannelError::Corrupt(format!(
                    "response file {} missing",
                    self.path.display()
                )))
            }
            Err(e) => return Err(e.into()),
        };
        if len < self.cursor {
            info!(path = %self.path.display(), cursor = self.cursor, len, "response file rotated");
            self.cursor = 0;
            self.partial.clear();
        }
        if len == self.cursor {
            return Ok(String::new());
        }

        let mut file = fs::File::open(&self.path)?;
        file.seek(SeekFrom::Start(self.cursor))?;
        let mut bytes = Vec::new();
        let n = file.read_to_end(&mut bytes)?;
        self.cursor += n as u64;

        self.partial.extend_from_slice(&bytes);
        Ok(decode_utf8_prefix(&mut self.partial))
    }

    /// Truncate the file once everything in it has been consumed and it has
    /// grown past `threshold`. Only call while the worker is parked on input;
    /// see [`FileChannel::compact_response`].
    pub(crate) fn compact(&mut self, threshold: u64) -> Result<bool, ChannelError> {
        if self.cursor < threshold || !self.partial.is_empty() {
            return Ok(false);
        }
        let file = OpenOptions::new().write(true).open(&self.path)?;
        if file.metadata()?.len() != self.cursor {
            return Ok(false);
        }
        file.set_len(0)?;
        debug!(path = %self.path.display(), reclaimed = self.cursor, "response file compacted");
        self.cursor = 0;
        Ok(true)
    }
}

/// Decode as much of `buf` as forms complete UTF-8, leaving an incomplete
/// trailing sequence in place. Invalid bytes become U+FFFD.
fn decode_utf8_prefix(buf: &mut Vec<u8>) -> String {
    let mut out = String::new();
    loop {
        match std::str::from_utf8(buf) {
            Ok(s) => {
                out.push_str(s);
                buf.clear();
                return out;
            }
            Err(e) => {
                let valid = e.valid_up_to();
                out.push_str(&String::from_utf8_lossy(&buf[..valid]));
                match e.error_len() {
                    None => {
                        buf.drain(..valid);
                        return out;
                    }
                    Some(bad) => {
                        out.push(char::REPLACEMENT_CHARACTER);
                        buf.drain(..valid + bad);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tablebridge_core::protocol::SessionId;

    fn setup() -> (tempfile::TempDir, FileChannel) {
        let dir = tempfile::tempdir().unwrap();
        let paths = ChannelPaths::for_session(dir.path(), &SessionId::new());
        paths.reset().unwrap();
        (dir, FileChannel::new(paths))
    }

    fn append(path: &std::path::Path, bytes: &[u8]) {
        let mut f = OpenOptions::new().append(true).open(path).unwrap();
        f.write_all(bytes).unwrap();
    }

    #[test]
    fn command_overwrites_with_single_newline() {
        let (_dir, chan) = setup();
        chan.write_command("SELECT 1").unwrap();
        assert_eq!(fs::read_to_string(&chan.paths().request).unwrap(), "SELECT 1\n");
        assert_eq!(chan.pending_command().unwrap().as_deref(), Some("SELECT 1"));
    }

    #[test]
    fn trailing_newlines_are_not_doubled() {
        let (_dir, chan) = setup();
        chan.write_command("SELECT 1\r\n\n").unwrap();
        assert_eq!(fs::read_to_string(&chan.paths().request).unwrap(), "SELECT 1\n");

        // Inner line breaks belong to the payload.
        fs::write(&chan.paths().request, "").unwrap();
        chan.write_command("[{\"name\": \"orders\"},\n {\"name\": \"items\"}]\n").unwrap();
        assert_eq!(
            fs::read_to_string(&chan.paths().request).unwrap(),
            "[{\"name\": \"orders\"},\n {\"name\": \"items\"}]\n"
        );
    }

    #[test]
    fn second_command_is_refused_while_first_pending() {
        let (_dir, chan) = setup();
        chan.write_command("SELECT 1").unwrap();
        assert!(matches!(
            chan.write_command("SELECT 2"),
            Err(ChannelError::CommandPending)
        ));
        assert_eq!(fs::read_to_string(&chan.paths().request).unwrap(), "SELECT 1\n");

        // Worker consumed it.
        fs::write(&chan.paths().request, "").unwrap();
        chan.write_command("SELECT 2").unwrap();
        assert_eq!(fs::read_to_string(&chan.paths().request).unwrap(), "SELECT 2\n");
    }

    #[test]
    fn heartbeat_never_clobbers_pending_command() {
        let (_dir, chan) = setup();
        assert!(chan.write_heartbeat().unwrap());
        assert_eq!(
            fs::read_to_string(&chan.paths().request).unwrap(),
            "__HEARTBEAT__\n"
        );
        assert!(!chan.has_pending_command().unwrap());

        // A heartbeat left in the file does not block a real command.
        chan.write_command("SELECT 1").unwrap();
        assert!(!chan.write_heartbeat().unwrap());
        assert_eq!(fs::read_to_string(&chan.paths().request).unwrap(), "SELECT 1\n");
    }

    #[test]
    fn exit_overrides_pending_command() {
        let (_dir, chan) = setup();
        chan.write_command("SELECT 1").unwrap();
        chan.write_exit().unwrap();
        assert_eq!(fs::read_to_string(&chan.paths().request).unwrap(), "/exit\n");
    }

    #[test]
    fn missing_request_file_is_corrupt() {
        let (_dir, chan) = setup();
        fs::remove_file(&chan.paths().request).unwrap();
        assert!(matches!(chan.pending_command(), Err(ChannelError::Corrupt(_))));
        assert!(matches!(chan.write_command("x"), Err(ChannelError::Corrupt(_))));
    }

    #[test]
    fn waiting_flag_presence() {
        let (_dir, chan) = setup();
        assert!(!chan.is_worker_waiting());
        fs::write(&chan.paths().request_flag, "waiting for input").unwrap();
        assert!(chan.is_worker_waiting());

        assert!(!chan.is_awaiting_tool());
        fs::write(&chan.paths().tool_flag, "waiting for tool result: query_table").unwrap();
        assert!(chan.is_awaiting_tool());
    }

    #[test]
    fn reader_returns_only_new_bytes() {
        let (_dir, chan) = setup();
        let mut reader = ResponseReader::new(chan.paths().response.clone());
        assert_eq!(reader.read_new().unwrap(), "");
        append(&chan.paths().response, b"line one\n");
        assert_eq!(reader.read_new().unwrap(), "line one\n");
        append(&chan.paths().response, b"line two\npart");
        assert_eq!(reader.read_new().unwrap(), "line two\npart");
        assert_eq!(reader.read_new().unwrap(), "");
        assert_eq!(reader.cursor(), 22);
    }

    #[test]
    fn reader_survives_rotation() {
        let (_dir, chan) = setup();
        let mut reader = ResponseReader::new(chan.paths().response.clone());
        append(&chan.paths().response, b"0123456789\n");
        assert_eq!(reader.read_new().unwrap(), "0123456789\n");

        fs::write(&chan.paths().response, b"new\n").unwrap();
        assert_eq!(reader.read_new().unwrap(), "new\n");
        assert_eq!(reader.cursor(), 4);
    }

    #[test]
    fn reader_reports_missing_file_as_corrupt() {
        let (_dir, chan) = setup();
        let mut reader = ResponseReader::new(chan.paths().response.clone());
        fs::remove_file(&chan.paths().response).unwrap();
        assert!(matches!(reader.read_new(), Err(ChannelError::Corrupt(_))));
    }

    #[test]
    fn split_utf8_sequence_is_held_back() {
        let (_dir, chan) = setup();
        let mut reader = ResponseReader::new(chan.paths().response.clone());
        let snowman = "☃".as_bytes();
        append(&chan.paths().response, &[b'a', snowman[0], snowman[1]]);
        assert_eq!(reader.read_new().unwrap(), "a");
        append(&chan.paths().response, &[snowman[2], b'\n']);
        assert_eq!(reader.read_new().unwrap(), "☃\n");
    }

    #[test]
    fn invalid_bytes_are_replaced_and_control_chars_kept() {
        let mut buf = vec![b'x', 0xff, b'\x07', b'\r', b'\n'];
        assert_eq!(decode_utf8_prefix(&mut buf), "x\u{FFFD}\x07\r\n");
        assert!(buf.is_empty());
    }

    #[test]
    fn compact_only_when_fully_consumed() {
        let (_dir, chan) = setup();
        let mut reader = ResponseReader::new(chan.paths().response.clone());
        append(&chan.paths().response, b"0123456789");
        assert!(!reader.compact(4).unwrap());
        reader.read_new().unwrap();
        assert!(!reader.compact(100).unwrap());
        assert!(reader.compact(4).unwrap());
        assert_eq!(reader.cursor(), 0);
        assert_eq!(fs::metadata(&chan.paths().response).unwrap().len(), 0);

        append(&chan.paths().response, b"after\n");
        assert_eq!(reader.read_new().unwrap(), "after\n");
    }

    #[test]
    fn channel_compacts_only_while_worker_is_parked() {
        let (_dir, chan) = setup();
        let mut reader = ResponseReader::new(chan.paths().response.clone());
        append(&chan.paths().response, b"0123456789\n");
        reader.read_new().unwrap();

        // Worker not at its prompt.
        assert!(!chan.compact_response(&mut reader, 4).unwrap());

        fs::write(&chan.paths().request_flag, "waiting for input").unwrap();
        chan.write_command("SELECT 1").unwrap();
        // A command is about to wake it.
        assert!(!chan.compact_response(&mut reader, 4).unwrap());
        assert_eq!(fs::metadata(&chan.paths().response).unwrap().len(), 11);

        fs::write(&chan.paths().request, "").unwrap();
        assert!(chan.compact_response(&mut reader, 4).unwrap());
        assert_eq!(fs::metadata(&chan.paths().response).unwrap().len(), 0);
    }
}
