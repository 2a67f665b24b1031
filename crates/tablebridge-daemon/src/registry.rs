//! Session registry: one worker, channel and set of loops per client session.
//!
//! All per-session state lives in a single map behind one mutex. The lock is
//! held for field updates only; file I/O, process signalling and sleeps all
//! happen with it released.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use tablebridge_core::config::BridgeConfig;
use tablebridge_core::layout::{self, ChannelPaths};
use tablebridge_core::protocol::{
    DaemonEvent, OutputChunk, SessionId, SessionInfo, SessionState,
};

use crate::channel::FileChannel;
use crate::error::{BridgeError, ChannelError};
use crate::supervisor;
use crate::worker::WorkerHandle;

pub type EventSender = mpsc::UnboundedSender<(SessionId, DaemonEvent)>;

/// Returned by a successful `submit_query`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Accepted {
    pub session_id: SessionId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CommandKind {
    Query,
    ToolResult,
    Probe,
}

/// The command that currently owns the request file. Reserved under the
/// lock before the write so only one writer is ever in flight.
#[derive(Debug, Clone, Copy, PartialEq)]
struct PendingCommand {
    since: Instant,
    kind: CommandKind,
    written: bool,
}

impl PendingCommand {
    fn reserve(kind: CommandKind) -> Self {
        Self {
            since: Instant::now(),
            kind,
            written: false,
        }
    }
}

/// What the supervisor should do after one look at a session.
#[derive(Debug, PartialEq)]
pub(crate) enum Verdict {
    Healthy,
    Stale,
    Fail(String),
}

struct SessionEntry {
    state: SessionState,
    generation: u64,
    channel: Arc<FileChannel>,
    worker: Option<WorkerHandle>,
    pid: Option<u32>,
    started_at: Instant,
    last_activity: Instant,
    last_activity_at: DateTime<Utc>,
    pending_query: Option<String>,
    pending_command: Option<PendingCommand>,
    // State to go back to once a tool wait is over.
    resume_state: SessionState,
    tool_flag_seen: bool,
    // Ignore the tool flag until it has been seen gone once.
    tool_flag_stale: bool,
    restarts: u32,
    restarting: bool,
    expected_exit: bool,
    probe_acks: HashSet<String>,
    tasks: Vec<JoinHandle<()>>,
}

impl SessionEntry {
    fn new(channel: Arc<FileChannel>) -> Self {
        let now = Instant::now();
        Self {
            state: SessionState::Starting,
            generation: 0,
            channel,
            worker: None,
            pid: None,
            started_at: now,
            last_activity: now,
            last_activity_at: Utc::now(),
            pending_query: None,
            pending_command: None,
            resume_state: SessionState::Starting,
            tool_flag_seen: false,
            tool_flag_stale: false,
            restarts: 0,
            restarting: false,
            expected_exit: false,
            probe_acks: HashSet::new(),
            tasks: Vec::new(),
        }
    }

    fn info(&self, id: SessionId) -> SessionInfo {
        SessionInfo {
            id,
            state: self.state,
            pid: self.pid,
            last_activity: self.last_activity_at,
            pending_query: self.pending_query.clone(),
            restarts: self.restarts,
        }
    }

    fn touch(&mut self) {
        self.last_activity = Instant::now();
        self.last_activity_at = Utc::now();
    }

    /// Mark our reservation as on disk, if it is still ours.
    fn mark_written(&mut self, kind: CommandKind) {
        if let Some(pending) = self.pending_command.as_mut() {
            if pending.kind == kind {
                pending.written = true;
            }
        }
    }

    fn release(&mut self, kind: CommandKind) {
        if self.pending_command.is_some_and(|p| p.kind == kind && !p.written) {
            self.pending_command = None;
        }
    }
}

/// Trimmed command text, or why it cannot be sent.
fn validate_command(text: &str) -> Result<&str, BridgeError> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Err(BridgeError::InvalidQuery("empty query".into()));
    }
    if layout::is_reserved(trimmed) {
        return Err(BridgeError::InvalidQuery(format!(
            "`{trimmed}` is a reserved channel value"
        )));
    }
    Ok(trimmed)
}

pub struct Registry {
    config: BridgeConfig,
    events: EventSender,
    sessions: Mutex<HashMap<SessionId, SessionEntry>>,
}

impl Registry {
    pub fn new(config: BridgeConfig, events: EventSender) -> Arc<Self> {
        Arc::new(Self {
            config,
            events,
            sessions: Mutex::new(HashMap::new()),
        })
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<SessionId, SessionEntry>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, id: SessionId, event: DaemonEvent) {
        // Receiver gone means the daemon is shutting down.
        let _ = self.events.send((id, event));
    }

    fn set_state(&self, id: SessionId, entry: &mut SessionEntry, state: SessionState) {
        if entry.state == state {
            return;
        }
        debug!(session_id = %id, from = entry.state.label(), to = state.label(), "state change");
        entry.state = state;
        self.emit(id, DaemonEvent::StateChanged { session_id: id, state });
    }

    // ── Public lifecycle ──

    /// Return the live session for `id`, spawning its worker on first use.
    /// Concurrent callers for the same id share one worker.
    pub async fn get_or_create(self: &Arc<Self>, id: SessionId) -> Result<SessionInfo, BridgeError> {
        let channel = {
            let mut sessions = self.lock();
            if let Some(entry) = sessions.get(&id) {
                return Ok(entry.info(id));
            }
            let paths = ChannelPaths::for_session(&self.config.channel.dir(), &id);
            let channel = Arc::new(FileChannel::new(paths));
            let mut entry = SessionEntry::new(channel.clone());
            // Reserve the slot so a concurrent caller does not spawn too.
            entry.restarting = true;
            sessions.insert(id, entry);
            channel
        };
        info!(session_id = %id, "creating session");

        match WorkerHandle::start(id, &self.config.worker, channel) {
            Ok(handle) => {
                self.install(id, handle).await;
                self.session(id)
            }
            Err(e) => {
                warn!(session_id = %id, error = %e, "worker spawn failed");
                self.lock().remove(&id);
                Err(BridgeError::Spawn(id, e))
            }
        }
    }

    /// Write `text` to a `Ready` session's worker and mark it `Busy`.
    pub fn submit_query(self: &Arc<Self>, id: SessionId, text: &str) -> Result<Accepted, BridgeError> {
        let trimmed = validate_command(text)?;
        let text = text.trim_end_matches(['\r', '\n']);

        let (input, generation) = {
            let mut sessions = self.lock();
            let entry = sessions
                .get_mut(&id)
                .ok_or(BridgeError::UnknownSession(id))?;
            let input = match (entry.state, entry.worker.as_ref()) {
                (SessionState::Ready, Some(worker)) if !entry.restarting => worker.input(),
                (SessionState::Busy, _) => return Err(BridgeError::SessionBusy(id)),
                (other, _) => return Err(BridgeError::NotReady(id, other.label())),
            };
            // An unanswered probe still owns the request file.
            if entry.pending_command.is_some() {
                return Err(BridgeError::SessionBusy(id));
            }
            entry.pending_command = Some(PendingCommand::reserve(CommandKind::Query));
            entry.pending_query = Some(text.to_string());
            entry.expected_exit = trimmed.eq_ignore_ascii_case(layout::EXIT_COMMAND);
            self.set_state(id, entry, SessionState::Busy);
            (input, entry.generation)
        };

        match input.write_line(text) {
            Ok(()) => {
                self.with_current(id, generation, |entry| entry.mark_written(CommandKind::Query));
                info!(session_id = %id, bytes = text.len(), "query submitted");
                Ok(Accepted { session_id: id })
            }
            Err(e) => {
                let err = BridgeError::from_channel(id, e);
                if err.is_transient() {
                    self.fail(id, generation, err.to_string());
                    return Err(err);
                }
                // Nothing was written.
                self.with_current(id, generation, |entry| {
                    if entry.state == SessionState::Busy {
                        entry.release(CommandKind::Query);
                        entry.pending_query = None;
                        entry.expected_exit = false;
                        self.set_state(id, entry, SessionState::Ready);
                    }
                });
                Err(err)
            }
        }
    }

    /// Hand the worker the result of the tool call it is blocked on. The
    /// session goes back to whatever it was doing before the call.
    pub fn submit_tool_result(
        self: &Arc<Self>,
        id: SessionId,
        text: &str,
    ) -> Result<Accepted, BridgeError> {
        validate_command(text)?;

        let (input, generation) = {
            let mut sessions = self.lock();
            let entry = sessions
                .get_mut(&id)
                .ok_or(BridgeError::UnknownSession(id))?;
            let input = match (entry.state, entry.worker.as_ref()) {
                (SessionState::AwaitingTool, Some(worker)) if !entry.restarting => worker.input(),
                (other, _) => return Err(BridgeError::NotReady(id, other.label())),
            };
            if entry.pending_command.is_some() {
                return Err(BridgeError::SessionBusy(id));
            }
            entry.pending_command = Some(PendingCommand::reserve(CommandKind::ToolResult));
            (input, entry.generation)
        };

        match input.write_line(text) {
            Ok(()) => {
                self.with_current(id, generation, |entry| {
                    entry.mark_written(CommandKind::ToolResult);
                    if entry.state == SessionState::AwaitingTool {
                        entry.tool_flag_stale = true;
                        self.resume_after_tool(id, entry);
                    }
                });
                info!(session_id = %id, bytes = text.len(), "tool result submitted");
                Ok(Accepted { session_id: id })
            }
            Err(e) => {
                let err = BridgeError::from_channel(id, e);
                if err.is_transient() {
                    self.fail(id, generation, err.to_string());
                } else {
                    self.with_current(id, generation, |entry| {
                        entry.release(CommandKind::ToolResult)
                    });
                }
                Err(err)
            }
        }
    }

    /// Ask the worker to acknowledge a probe token. Returns the round trip.
    pub async fn probe(self: &Arc<Self>, id: SessionId) -> Result<Duration, BridgeError> {
        let token = uuid::Uuid::now_v7().simple().to_string();
        let (channel, generation) = {
            let mut sessions = self.lock();
            let entry = sessions
                .get_mut(&id)
                .ok_or(BridgeError::UnknownSession(id))?;
            // A busy worker would read the probe as part of its current job.
            if entry.restarting || entry.state != SessionState::Ready {
                return Err(BridgeError::NotReady(id, entry.state.label()));
            }
            if entry.pending_command.is_some() {
                return Err(BridgeError::SessionBusy(id));
            }
            entry.pending_command = Some(PendingCommand::reserve(CommandKind::Probe));
            (entry.channel.clone(), entry.generation)
        };

        if let Err(e) = channel.write_probe(&token) {
            let err = BridgeError::from_channel(id, e);
            if err.is_transient() {
                self.fail(id, generation, err.to_string());
            } else {
                self.with_current(id, generation, |entry| entry.release(CommandKind::Probe));
            }
            return Err(err);
        }
        let sent = Instant::now();
        self.with_current(id, generation, |entry| entry.mark_written(CommandKind::Probe));

        let timeout = self.config.channel.connectivity_timeout();
        loop {
            tokio::time::sleep(self.config.channel.poll_interval()).await;
            {
                let mut sessions = self.lock();
                let Some(entry) = sessions.get_mut(&id) else {
                    return Err(BridgeError::UnknownSession(id));
                };
                if entry.generation != generation {
                    return Err(BridgeError::ChannelTimeout(id, sent.elapsed()));
                }
                if entry.probe_acks.remove(&token) {
                    return Ok(sent.elapsed());
                }
            }
            if sent.elapsed() >= timeout {
                self.fail(id, generation, format!("probe not acknowledged within {timeout:?}"));
                return Err(BridgeError::ChannelTimeout(id, timeout));
            }
        }
    }

    /// Replace the worker with a fresh one on freshly truncated files.
    pub async fn restart(self: &Arc<Self>, id: SessionId) -> Result<SessionInfo, BridgeError> {
        let attempt = {
            let sessions = self.lock();
            let entry = sessions.get(&id).ok_or(BridgeError::UnknownSession(id))?;
            entry.restarts
        };
        self.restart_with(id, None, attempt, "restart requested".into())
            .await?;
        self.session(id)
    }

    /// Terminate the worker, remove its files and forget the session.
    pub async fn destroy(&self, id: SessionId) -> Result<(), BridgeError> {
        self.destroy_with_reason(id, "client disconnected").await
    }

    pub async fn destroy_with_reason(&self, id: SessionId, reason: &str) -> Result<(), BridgeError> {
        let Some(mut entry) = self.lock().remove(&id) else {
            return Err(BridgeError::UnknownSession(id));
        };
        info!(session_id = %id, reason, "destroying session");
        for task in entry.tasks.drain(..) {
            task.abort();
        }
        if let Some(mut worker) = entry.worker.take() {
            if worker.is_alive() {
                if let Err(e) = entry.channel.write_exit() {
                    debug!(session_id = %id, error = %e, "could not send /exit");
                }
            }
            if let Err(e) = worker.terminate(self.config.channel.terminate_grace()).await {
                warn!(session_id = %id, error = %e, "worker terminate failed");
            }
        }
        if let Err(e) = entry.channel.paths().remove() {
            warn!(session_id = %id, error = %e, "failed to remove channel files");
        }
        self.emit(
            id,
            DaemonEvent::StateChanged {
                session_id: id,
                state: SessionState::Terminated,
            },
        );
        self.emit(
            id,
            DaemonEvent::SessionEnded {
                session_id: id,
                reason: reason.to_string(),
            },
        );
        Ok(())
    }

    pub async fn shutdown(&self) {
        let ids: Vec<SessionId> = self.lock().keys().copied().collect();
        for id in ids {
            let _ = self.destroy_with_reason(id, "daemon shutting down").await;
        }
    }

    pub fn session(&self, id: SessionId) -> Result<SessionInfo, BridgeError> {
        self.lock()
            .get(&id)
            .map(|entry| entry.info(id))
            .ok_or(BridgeError::UnknownSession(id))
    }

    pub fn sessions(&self) -> Vec<SessionInfo> {
        self.lock()
            .iter()
            .map(|(id, entry)| entry.info(*id))
            .collect()
    }

    #[cfg(test)]
    pub fn channel_paths(&self, id: SessionId) -> Option<ChannelPaths> {
        self.lock().get(&id).map(|e| e.channel.paths().clone())
    }

    // ── Spawning and recovery ──

    /// Put a freshly started worker into its slot and start its loops.
    async fn install(self: &Arc<Self>, id: SessionId, handle: WorkerHandle) {
        let orphan = {
            let mut sessions = self.lock();
            match sessions.get_mut(&id) {
                Some(entry) => {
                    entry.generation += 1;
                    entry.pid = handle.pid();
                    entry.started_at = Instant::now();
                    entry.touch();
                    entry.pending_query = None;
                    entry.pending_command = None;
                    entry.resume_state = SessionState::Starting;
                    entry.tool_flag_seen = false;
                    entry.tool_flag_stale = false;
                    entry.expected_exit = false;
                    entry.probe_acks.clear();
                    entry.restarting = false;
                    entry.worker = Some(handle);
                    entry.tasks =
                        supervisor::spawn_loops(self, id, entry.generation, entry.channel.clone());
                    entry.state = SessionState::Starting;
                    self.emit(
                        id,
                        DaemonEvent::StateChanged {
                            session_id: id,
                            state: SessionState::Starting,
                        },
                    );
                    None
                }
                None => Some(handle),
            }
        };
        if let Some(mut handle) = orphan {
            // Destroyed while we were spawning; the spawn recreated the files.
            let _ = handle.terminate(self.config.channel.terminate_grace()).await;
            let paths = ChannelPaths::for_session(&self.config.channel.dir(), &id);
            if let Err(e) = paths.remove() {
                warn!(session_id = %id, error = %e, "failed to remove channel files");
            }
        }
    }

    /// Tear down the current worker and start a new one.
    async fn restart_with(
        self: &Arc<Self>,
        id: SessionId,
        expected_generation: Option<u64>,
        attempt: u32,
        reason: String,
    ) -> Result<(), BridgeError> {
        let (old_worker, tasks, dropped_query, channel) = {
            let mut sessions = self.lock();
            let entry = sessions
                .get_mut(&id)
                .ok_or(BridgeError::UnknownSession(id))?;
            if entry.restarting {
                return Ok(());
            }
            if expected_generation.is_some_and(|g| g != entry.generation) {
                return Ok(());
            }
            entry.restarting = true;
            // Old loops see a stale generation from here on.
            entry.generation += 1;
            entry.pending_command = None;
            (
                entry.worker.take(),
                std::mem::take(&mut entry.tasks),
                entry.pending_query.take(),
                entry.channel.clone(),
            )
        };

        warn!(session_id = %id, attempt, %reason, "restarting worker");
        for task in tasks {
            task.abort();
        }
        if let Some(mut worker) = old_worker {
            if let Err(e) = worker.terminate(self.config.channel.terminate_grace()).await {
                warn!(session_id = %id, error = %e, "old worker terminate failed");
            }
        }

        match WorkerHandle::start(id, &self.config.worker, channel) {
            Ok(handle) => {
                self.emit(
                    id,
                    DaemonEvent::Restarted {
                        session_id: id,
                        attempt,
                        reason,
                        dropped_query,
                    },
                );
                self.install(id, handle).await;
                Ok(())
            }
            Err(e) => {
                let message = format!("worker could not be restarted: {e}");
                let _ = self.destroy_with_reason(id, &message).await;
                Err(BridgeError::Spawn(id, e))
            }
        }
    }

    /// Automatic recovery after a transient fault, bounded by `max_restarts`.
    async fn recover(self: Arc<Self>, id: SessionId, generation: u64, reason: String) {
        let attempt = {
            let mut sessions = self.lock();
            let Some(entry) = sessions.get_mut(&id) else {
                return;
            };
            if entry.generation != generation || entry.restarting {
                return;
            }
            entry.restarts += 1;
            entry.restarts
        };

        let max = self.config.channel.max_restarts;
        if attempt > max {
            warn!(session_id = %id, attempts = attempt - 1, %reason, "giving up on worker");
            let message = format!("worker failed after {max} restarts: {reason}");
            let _ = self.destroy_with_reason(id, &message).await;
            return;
        }
        if let Err(e) = self.restart_with(id, Some(generation), attempt, reason).await {
            warn!(session_id = %id, error = %e, "recovery failed");
        }
    }

    /// Mark the session `Unresponsive` and hand recovery to its own task, so
    /// the caller (often one of the loops being replaced) is not aborted
    /// halfway through.
    pub(crate) fn fail(self: &Arc<Self>, id: SessionId, generation: u64, reason: String) {
        {
            let mut sessions = self.lock();
            let Some(entry) = sessions.get_mut(&id) else {
                return;
            };
            if entry.generation != generation
                || entry.restarting
                || entry.state == SessionState::Unresponsive
            {
                return;
            }
            warn!(session_id = %id, %reason, "session unresponsive");
            self.set_state(id, entry, SessionState::Unresponsive);
        }
        let registry = self.clone();
        tokio::spawn(registry.recover(id, generation, reason));
    }

    // ── Hooks for the per-session loops ──

    fn with_current<T>(
        &self,
        id: SessionId,
        generation: u64,
        f: impl FnOnce(&mut SessionEntry) -> T,
    ) -> Option<T> {
        let mut sessions = self.lock();
        let entry = sessions.get_mut(&id)?;
        if entry.generation != generation || entry.restarting {
            return None;
        }
        Some(f(entry))
    }

    /// Non-blocking exit poll. `None` once the generation is stale.
    pub(crate) fn poll_worker(&self, id: SessionId, generation: u64) -> Option<bool> {
        self.with_current(id, generation, |entry| {
            entry.worker.as_mut().is_some_and(|w| w.is_alive())
        })
    }

    pub(crate) fn record_output(
        &self,
        id: SessionId,
        generation: u64,
        had_output: bool,
        probe_acks: Vec<String>,
    ) -> Option<()> {
        self.with_current(id, generation, |entry| {
            if had_output || !probe_acks.is_empty() {
                entry.touch();
            }
            entry.probe_acks.extend(probe_acks);
        })
    }

    pub(crate) fn deliver(&self, id: SessionId, generation: u64, chunk: OutputChunk) -> Option<()> {
        self.with_current(id, generation, |_| {
            self.emit(id, DaemonEvent::Chunk(chunk));
        })
    }

    /// A prompt marker was flushed. `consumed` is whether the request file
    /// was empty at that moment.
    pub(crate) fn on_prompt(&self, id: SessionId, generation: u64, consumed: bool) -> Option<()> {
        self.with_current(id, generation, |entry| match entry.state {
            SessionState::Starting => {
                // Only a startup tool result can be pending here.
                if consumed {
                    entry.pending_command = None;
                }
                self.set_state(id, entry, SessionState::Ready);
            }
            SessionState::Busy | SessionState::AwaitingTool if consumed => {
                entry.pending_command = None;
                entry.pending_query = None;
                entry.tool_flag_seen = false;
                entry.restarts = 0;
                self.set_state(id, entry, SessionState::Ready);
            }
            _ => {}
        })
    }

    /// One look at the worker's tool-wait signals: `flag` is whether the
    /// `.waiting_tool` file exists, `marker` whether a flushed chunk ended in
    /// a tool-wait marker.
    pub(crate) fn on_tool_wait(
        &self,
        id: SessionId,
        generation: u64,
        flag: bool,
        marker: bool,
    ) -> Option<()> {
        self.with_current(id, generation, |entry| {
            if !flag {
                entry.tool_flag_stale = false;
            }
            match entry.state {
                SessionState::AwaitingTool => {
                    if flag {
                        entry.tool_flag_seen = true;
                    } else if entry.tool_flag_seen {
                        // The worker gave up waiting and carried on.
                        debug!(session_id = %id, "tool wait ended without a result");
                        self.resume_after_tool(id, entry);
                    }
                }
                SessionState::Starting | SessionState::Ready | SessionState::Busy
                    if marker || (flag && !entry.tool_flag_stale) =>
                {
                    info!(session_id = %id, "worker waiting for a tool result");
                    entry.resume_state = entry.state;
                    // The worker read the query before asking for a tool.
                    entry.pending_command = None;
                    entry.tool_flag_seen = flag;
                    entry.tool_flag_stale = false;
                    entry.touch();
                    self.set_state(id, entry, SessionState::AwaitingTool);
                }
                _ => {}
            }
        })
    }

    fn resume_after_tool(&self, id: SessionId, entry: &mut SessionEntry) {
        entry.tool_flag_seen = false;
        entry.touch();
        if entry.resume_state == SessionState::Starting {
            // The startup clock covers the worker, not the client's tool.
            entry.started_at = Instant::now();
        }
        let resume = entry.resume_state;
        self.set_state(id, entry, resume);
    }

    /// Parked at its prompt with nothing in flight.
    pub(crate) fn is_idle(&self, id: SessionId, generation: u64) -> Option<bool> {
        self.with_current(id, generation, |entry| {
            entry.state == SessionState::Ready && entry.pending_command.is_none()
        })
    }

    /// The worker raised its waiting flag or printed enough lines.
    pub(crate) fn on_startup_signal(&self, id: SessionId, generation: u64, why: &str) -> Option<()> {
        self.with_current(id, generation, |entry| {
            if entry.state == SessionState::Starting {
                debug!(session_id = %id, why, "worker ready without prompt");
                self.set_state(id, entry, SessionState::Ready);
            }
        })
    }

    /// Heartbeat written while the worker sat waiting for input.
    pub(crate) fn on_heartbeat(&self, id: SessionId, generation: u64) -> Option<()> {
        self.with_current(id, generation, |entry| entry.touch())
    }

    pub(crate) fn current_channel(&self, id: SessionId, generation: u64) -> Option<Arc<FileChannel>> {
        self.with_current(id, generation, |entry| entry.channel.clone())
    }

    /// The worker process is gone and its output has been flushed.
    pub(crate) fn on_worker_exit(self: &Arc<Self>, id: SessionId, generation: u64) {
        let Some((expected, status)) = self.with_current(id, generation, |entry| {
            let status = entry
                .worker
                .as_ref()
                .and_then(|w| w.exit_status())
                .map(|s| s.to_string())
                .unwrap_or_else(|| "unknown status".into());
            (entry.expected_exit, status)
        }) else {
            return;
        };

        if expected {
            info!(session_id = %id, %status, "worker exited on request");
            let registry = self.clone();
            tokio::spawn(async move {
                let _ = registry
                    .destroy_with_reason(id, &format!("worker exited ({status})"))
                    .await;
            });
        } else {
            self.fail(id, generation, format!("worker exited unexpectedly ({status})"));
        }
    }

    /// One supervisor look at the session: pending-command timeouts, the
    /// startup timeout and the liveness window.
    pub(crate) fn check_health(&self, id: SessionId, generation: u64) -> Verdict {
        let Some((state, pending, started_at, last_activity, channel)) =
            self.with_current(id, generation, |entry| {
                (
                    entry.state,
                    entry.pending_command,
                    entry.started_at,
                    entry.last_activity,
                    entry.channel.clone(),
                )
            })
        else {
            return Verdict::Stale;
        };
        let now = Instant::now();
        let cfg = &self.config.channel;

        if let Some(pending) = pending.filter(|p| p.written) {
            match channel.has_pending_command() {
                Ok(true) => {
                    let window = match pending.kind {
                        CommandKind::Query | CommandKind::ToolResult => cfg.command_timeout(),
                        CommandKind::Probe => cfg.connectivity_timeout(),
                    };
                    if now.duration_since(pending.since) >= window {
                        return Verdict::Fail(format!(
                            "command not consumed within {window:?}"
                        ));
                    }
                    return Verdict::Healthy;
                }
                Ok(false) => {
                    self.with_current(id, generation, |entry| {
                        if entry.pending_command == Some(pending) {
                            entry.pending_command = None;
                            entry.touch();
                        }
                    });
                    return Verdict::Healthy;
                }
                Err(ChannelError::Corrupt(msg)) => return Verdict::Fail(msg),
                Err(e) => {
                    warn!(session_id = %id, error = %e, "request file check failed");
                    return Verdict::Healthy;
                }
            }
        }

        match state {
            SessionState::Starting => {
                if now.duration_since(started_at) >= cfg.startup_timeout() {
                    return Verdict::Fail(format!(
                        "worker not ready within {:?}",
                        cfg.startup_timeout()
                    ));
                }
            }
            SessionState::Ready | SessionState::Busy | SessionState::AwaitingTool => {
                if now.duration_since(last_activity) >= cfg.liveness_window() {
                    return Verdict::Fail(format!(
                        "no output for {:?}",
                        cfg.liveness_window()
                    ));
                }
            }
            SessionState::Unresponsive | SessionState::Terminated => {}
        }
        Verdict::Healthy
    }
}
