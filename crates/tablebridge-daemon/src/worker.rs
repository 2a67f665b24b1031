use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use tablebridge_core::config::WorkerConfig;
use tablebridge_core::protocol::SessionId;

use crate::channel::FileChannel;
use crate::error::{ChannelError, WorkerError};

/// One spawned worker process. Protocol data never touches its stdio: stdout
/// and stderr are drained into the diagnostic log.
pub struct WorkerHandle {
    session_id: SessionId,
    child: Child,
    pid: Option<u32>,
    exit_status: Option<ExitStatus>,
    input: WorkerInput,
}

/// Write side of a worker. Cheap to clone, so callers can write without
/// holding on to the handle itself.
#[derive(Clone)]
pub struct WorkerInput {
    channel: Arc<FileChannel>,
}

impl WorkerInput {
    /// Send one command line through the file channel.
    pub fn write_line(&self, text: &str) -> Result<(), ChannelError> {
        self.channel.write_command(text)
    }
}

impl WorkerHandle {
    /// Truncate the channel files, then launch
    /// `<program> [args..] <request-file> <response-file>`.
    pub fn start(
        session_id: SessionId,
        config: &WorkerConfig,
        channel: Arc<FileChannel>,
    ) -> Result<Self, WorkerError> {
        channel.paths().reset().map_err(WorkerError::Channel)?;

        let mut cmd = Command::new(&config.program);
        cmd.args(&config.args)
            .arg(&channel.paths().request)
            .arg(&channel.paths().response)
            .envs(&config.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|source| WorkerError::Spawn {
            program: config.program.clone(),
            source,
        })?;
        let pid = child.id();

        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(log_lines(session_id, "stdout", stdout));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(log_lines(session_id, "stderr", stderr));
        }

        info!(session_id = %session_id, ?pid, program = %config.program, "worker started");
        Ok(Self {
            session_id,
            child,
            pid,
            exit_status: None,
            input: WorkerInput { channel },
        })
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn exit_status(&self) -> Option<ExitStatus> {
        self.exit_status
    }

    /// Non-blocking exit poll.
    pub fn is_alive(&mut self) -> bool {
        if self.exit_status.is_some() {
            return false;
        }
        match self.child.try_wait() {
            Ok(Some(status)) => {
                debug!(session_id = %self.session_id, pid = ?self.pid, %status, "worker exited");
                self.exit_status = Some(status);
                false
            }
            Ok(None) => true,
            Err(e) => {
                warn!(session_id = %self.session_id, error = %e, "worker status poll failed");
                false
            }
        }
    }

    pub fn input(&self) -> WorkerInput {
        self.input.clone()
    }

    /// SIGTERM, then SIGKILL once `grace` runs out. Terminating a dead worker
    /// is a no-op.
    pub async fn terminate(&mut self, grace: Duration) -> Result<(), WorkerError> {
        if !self.is_alive() {
            return Ok(());
        }

        if let Some(pid) = self.pid {
            send_sigterm(pid);
        }

        let deadline = tokio::time::Instant::now() + grace;
        loop {
            if let Some(status) = self.child.try_wait()? {
                self.exit_status = Some(status);
                info!(session_id = %self.session_id, pid = ?self.pid, "worker terminated");
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        warn!(session_id = %self.session_id, pid = ?self.pid, "worker ignored SIGTERM, killing");
        if let Err(e) = self.child.start_kill() {
            // Raced with a natural exit.
            debug!(session_id = %self.session_id, error = %e, "kill after grace failed");
        }
        let status = self.child.wait().await?;
        self.exit_status = Some(status);
        Ok(())
    }
}

fn send_sigterm(pid: u32) {
    let result = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
    if result != 0 {
        let err = std::io::Error::last_os_error();
        debug!(pid, error = %err, "SIGTERM failed");
    }
}

async fn log_lines(session_id: SessionId, stream: &'static str, reader: impl AsyncRead + Unpin) {
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        debug!(target: "worker", session_id = %session_id, stream, "{line}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tablebridge_core::layout::ChannelPaths;

    fn sh_worker(script: &str) -> WorkerConfig {
        WorkerConfig {
            program: "/bin/sh".into(),
            args: vec!["-c".into(), script.into(), "worker".into()],
            env: Default::default(),
        }
    }

    fn channel(dir: &std::path::Path) -> (SessionId, Arc<FileChannel>) {
        let id = SessionId::new();
        let paths = ChannelPaths::for_session(dir, &id);
        (id, Arc::new(FileChannel::new(paths)))
    }

    #[tokio::test]
    async fn start_truncates_files_and_passes_paths() {
        let dir = tempfile::tempdir().unwrap();
        let (id, chan) = channel(dir.path());
        fs::write(&chan.paths().request, "leftover\n").unwrap();
        fs::write(&chan.paths().response, "leftover\n").unwrap();

        // $1 and $2 are the request and response files.
        let config = sh_worker(r#"printf '%s|%s\n' "$1" "$2" >> "$2"; sleep 5"#);
        let mut handle = WorkerHandle::start(id, &config, chan.clone()).unwrap();
        assert!(handle.pid().is_some());

        let expected = format!(
            "{}|{}\n",
            chan.paths().request.display(),
            chan.paths().response.display()
        );
        let mut seen = String::new();
        for _ in 0..100 {
            seen = fs::read_to_string(&chan.paths().response).unwrap();
            if !seen.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(seen, expected);
        assert_eq!(fs::read_to_string(&chan.paths().request).unwrap(), "");
        assert!(handle.is_alive());
        handle.terminate(Duration::from_secs(2)).await.unwrap();
        assert!(!handle.is_alive());
    }

    #[tokio::test]
    async fn missing_program_is_spawn_error() {
        let dir = tempfile::tempdir().unwrap();
        let (id, chan) = channel(dir.path());
        let config = WorkerConfig {
            program: dir.path().join("no-such-worker").display().to_string(),
            args: vec![],
            env: Default::default(),
        };
        let result = WorkerHandle::start(id, &config, chan);
        assert!(matches!(result, Err(WorkerError::Spawn { .. })));
    }

    #[tokio::test]
    async fn terminate_kills_after_grace_when_sigterm_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let (id, chan) = channel(dir.path());
        let config = sh_worker("trap '' TERM; while true; do sleep 0.1; done");
        let mut handle = WorkerHandle::start(id, &config, chan).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let started = std::time::Instant::now();
        handle.terminate(Duration::from_millis(300)).await.unwrap();
        assert!(started.elapsed() >= Duration::from_millis(300));
        assert!(!handle.is_alive());
    }

    #[tokio::test]
    async fn terminate_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let (id, chan) = channel(dir.path());
        let mut handle = WorkerHandle::start(id, &sh_worker("exit 0"), chan).unwrap();
        for _ in 0..100 {
            if !handle.is_alive() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(!handle.is_alive());
        handle.terminate(Duration::from_secs(2)).await.unwrap();
        handle.terminate(Duration::from_secs(2)).await.unwrap();
        assert!(handle.exit_status().is_some_and(|s| s.success()));
    }

    #[tokio::test]
    async fn write_line_goes_to_request_file() {
        let dir = tempfile::tempdir().unwrap();
        let (id, chan) = channel(dir.path());
        let mut handle = WorkerHandle::start(id, &sh_worker("sleep 5"), chan.clone()).unwrap();
        handle.input().write_line("SELECT 1").unwrap();
        assert_eq!(
            fs::read_to_string(&chan.paths().request).unwrap(),
            "SELECT 1\n"
        );
        handle.terminate(Duration::from_secs(2)).await.unwrap();
    }
}
