//! Worker half of the file channel.
//!
//! A worker started as `<program> <request-file> <response-file>` uses
//! [`WorkerEndpoint`] to park on a prompt until the daemon writes a command,
//! and to append its output to the response file. Heartbeats are ignored and
//! probes are acknowledged without ever reaching the caller.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::PathBuf;
use std::thread;
use std::time::{Duration, Instant};

use crate::layout::{self, ChannelPaths, EXIT_COMMAND, HEARTBEAT};

pub struct WorkerEndpoint {
    paths: ChannelPaths,
    poll_interval: Duration,
    idle_timeout: Duration,
}

impl WorkerEndpoint {
    /// Open the channel, creating either file if absent. Existing content is
    /// left alone: the daemon owns truncation.
    pub fn open(request: PathBuf, response: PathBuf) -> io::Result<Self> {
        let paths = ChannelPaths::from_request_response(request, response);
        for path in [&paths.request, &paths.response] {
            OpenOptions::new().create(true).append(true).open(path)?;
        }
        Ok(Self {
            paths,
            poll_interval: Duration::from_millis(500),
            idle_timeout: Duration::from_secs(300),
        })
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    pub fn paths(&self) -> &ChannelPaths {
        &self.paths
    }

    /// Append text to the response file as-is.
    pub fn write_output(&self, text: &str) -> io::Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.paths.response)?;
        file.write_all(text.as_bytes())?;
        file.flush()
    }

    /// Print `prompt`, raise the waiting flag, and block until a real command
    /// arrives. Returns `/exit` once the idle timeout elapses.
    pub fn read_command(&self, prompt: &str) -> io::Result<String> {
        self.write_output(&format!("{prompt}\n"))?;
        fs::write(&self.paths.request_flag, "waiting for input")?;

        let deadline = Instant::now() + self.idle_timeout;
        loop {
            if let Some(command) = self.take_command()? {
                self.clear_flag()?;
                return Ok(command);
            }
            if Instant::now() >= deadline {
                self.clear_flag()?;
                return Ok(EXIT_COMMAND.to_string());
            }
            thread::sleep(self.poll_interval);
        }
    }

    /// One poll of the request file. Probes are answered here and swallowed.
    fn take_command(&self) -> io::Result<Option<String>> {
        let content = match fs::read_to_string(&self.paths.request) {
            Ok(c) => c,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e),
        };
        let command = content.trim();
        // Heartbeats stay in the file; the daemon overwrites them.
        if command.is_empty() || command == HEARTBEAT {
            return Ok(None);
        }
        let command = command.to_string();
        fs::write(&self.paths.request, "")?;

        if let Some(token) = layout::parse_probe(&command) {
            self.write_output(&format!("{}\n", layout::probe_ack_line(token)))?;
            return Ok(None);
        }
        Ok(Some(command))
    }

    fn clear_flag(&self) -> io::Result<()> {
        match fs::remove_file(&self.paths.request_flag) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint(dir: &std::path::Path) -> WorkerEndpoint {
        WorkerEndpoint::open(dir.join("input_x.txt"), dir.join("output_x.txt"))
            .unwrap()
            .with_poll_interval(Duration::from_millis(10))
            .with_idle_timeout(Duration::from_secs(5))
    }

    #[test]
    fn open_creates_missing_files_without_truncating() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("output_x.txt"), "earlier\n").unwrap();
        let ep = endpoint(dir.path());
        assert!(ep.paths().request.exists());
        assert_eq!(
            fs::read_to_string(&ep.paths().response).unwrap(),
            "earlier\n"
        );
    }

    #[test]
    fn command_already_present_is_taken_and_cleared() {
        let dir = tempfile::tempdir().unwrap();
        let ep = endpoint(dir.path());
        fs::write(&ep.paths().request, "SELECT 1\n").unwrap();

        let command = ep.read_command("Enter your Query:").unwrap();
        assert_eq!(command, "SELECT 1");
        assert_eq!(fs::read_to_string(&ep.paths().request).unwrap(), "");
        assert!(!ep.paths().request_flag.exists());
        assert_eq!(
            fs::read_to_string(&ep.paths().response).unwrap(),
            "Enter your Query:\n"
        );
    }

    #[test]
    fn heartbeat_is_ignored_and_probe_is_acknowledged() {
        let dir = tempfile::tempdir().unwrap();
        let ep = endpoint(dir.path());
        let request = ep.paths().request.clone();
        let flag = ep.paths().request_flag.clone();

        let writer = thread::spawn(move || {
            while !flag.exists() {
                thread::sleep(Duration::from_millis(5));
            }
            fs::write(&request, "__HEARTBEAT__\n").unwrap();
            thread::sleep(Duration::from_millis(50));
            fs::write(&request, "__PROBE__:t42\n").unwrap();
            while !fs::read_to_string(&request).unwrap().is_empty() {
                thread::sleep(Duration::from_millis(5));
            }
            fs::write(&request, "SELECT 2\n").unwrap();
        });

        let command = ep.read_command("prompt>").unwrap();
        writer.join().unwrap();
        assert_eq!(command, "SELECT 2");
        let output = fs::read_to_string(&ep.paths().response).unwrap();
        assert_eq!(output, "prompt>\n__PROBE_ACK__:t42\n");
    }

    #[test]
    fn idle_timeout_returns_exit() {
        let dir = tempfile::tempdir().unwrap();
        let ep = endpoint(dir.path()).with_idle_timeout(Duration::from_millis(30));
        assert_eq!(ep.read_command("prompt>").unwrap(), "/exit");
        assert!(!ep.paths().request_flag.exists());
    }
}
