//! The three per-session loops: supervisor, heartbeat and aggregator.
//!
//! Each loop is tied to one worker generation. When the registry restarts or
//! destroys the session the generation moves on, the hooks start returning
//! `None`, and the loop exits (if it was not aborted first).

use std::sync::Arc;
use std::time::Instant;

use tokio::task::JoinHandle;
use tracing::{debug, warn};

use tablebridge_core::protocol::{FlushTrigger, SessionId};

use crate::aggregator::{OutputAggregator, SentinelFilter};
use crate::channel::{FileChannel, ResponseReader};
use crate::error::ChannelError;
use crate::registry::{Registry, Verdict};

pub(crate) fn spawn_loops(
    registry: &Arc<Registry>,
    id: SessionId,
    generation: u64,
    channel: Arc<FileChannel>,
) -> Vec<JoinHandle<()>> {
    vec![
        tokio::spawn(supervisor_loop(registry.clone(), id, generation)),
        tokio::spawn(heartbeat_loop(registry.clone(), id, generation)),
        tokio::spawn(aggregator_loop(registry.clone(), id, generation, channel)),
    ]
}

async fn supervisor_loop(registry: Arc<Registry>, id: SessionId, generation: u64) {
    let poll = registry.config().channel.poll_interval();
    loop {
        tokio::time::sleep(poll).await;
        match registry.check_health(id, generation) {
            Verdict::Healthy => {}
            Verdict::Stale => return,
            Verdict::Fail(reason) => {
                registry.fail(id, generation, reason);
                return;
            }
        }
    }
}

async fn heartbeat_loop(registry: Arc<Registry>, id: SessionId, generation: u64) {
    let interval = registry.config().channel.heartbeat_interval();
    loop {
        tokio::time::sleep(interval).await;
        let Some(channel) = registry.current_channel(id, generation) else {
            return;
        };
        match channel.write_heartbeat() {
            Ok(true) => {
                // Only a worker parked on input proves it is alive.
                if channel.is_worker_waiting() || channel.is_awaiting_tool() {
                    registry.on_heartbeat(id, generation);
                }
            }
            Ok(false) => debug!(session_id = %id, "command pending, heartbeat skipped"),
            Err(e) => {
                registry.fail(id, generation, format!("heartbeat failed: {e}"));
                return;
            }
        }
    }
}

async fn aggregator_loop(
    registry: Arc<Registry>,
    id: SessionId,
    generation: u64,
    channel: Arc<FileChannel>,
) {
    let config = registry.config().clone();
    let poll = config.channel.poll_interval();
    let line_threshold = config.aggregator.ready_line_threshold;
    let mut reader = ResponseReader::new(channel.paths().response.clone());
    let mut filter = SentinelFilter::default();
    let mut aggregator = OutputAggregator::new(id, config.aggregator.clone(), Instant::now());
    let mut lines = 0usize;

    loop {
        tokio::time::sleep(poll).await;

        // Exit is sampled before reading so the last read after exit sees
        // everything the worker wrote.
        let Some(alive) = registry.poll_worker(id, generation) else {
            return;
        };

        match reader.read_new() {
            Ok(text) if !text.is_empty() => {
                let filtered = filter.feed(&text);
                if filtered.heartbeats > 0 {
                    debug!(session_id = %id, count = filtered.heartbeats, "worker echoed heartbeats");
                }
                lines += filtered.text.matches('\n').count();
                aggregator.push(&filtered.text);
                let had_output = !filtered.text.is_empty();
                if registry
                    .record_output(id, generation, had_output, filtered.probe_acks)
                    .is_none()
                {
                    return;
                }
            }
            Ok(_) => {}
            Err(ChannelError::Corrupt(msg)) => {
                registry.fail(id, generation, msg);
                return;
            }
            Err(e) => warn!(session_id = %id, error = %e, "response read failed"),
        }

        let now = Instant::now();
        let mut prompt = false;
        while let Some(chunk) = aggregator.poll(now) {
            prompt |= chunk.trigger == FlushTrigger::PromptDetected;
            if registry.deliver(id, generation, chunk).is_none() {
                return;
            }
        }

        if !alive {
            aggregator.push(&filter.drain());
            if let Some(chunk) = aggregator.finish(now) {
                registry.deliver(id, generation, chunk);
            }
            registry.on_worker_exit(id, generation);
            return;
        }

        // A tool-wait marker ends its chunk like a prompt but is not one.
        let tool_marker = aggregator.take_tool_wait();
        if prompt && !tool_marker {
            let consumed = !matches!(channel.has_pending_command(), Ok(true));
            registry.on_prompt(id, generation, consumed);
        }

        if registry
            .on_tool_wait(id, generation, channel.is_awaiting_tool(), tool_marker)
            .is_none()
        {
            return;
        }

        let waiting = channel.is_worker_waiting();
        if waiting {
            registry.on_startup_signal(id, generation, "waiting flag");
        } else if line_threshold > 0 && lines >= line_threshold {
            registry.on_startup_signal(id, generation, "line threshold");
        }

        // The worker only appends, and never while parked at its prompt.
        if waiting
            && aggregator.buffered().is_empty()
            && registry.is_idle(id, generation) == Some(true)
        {
            match channel.compact_response(&mut reader, config.channel.compact_threshold_bytes) {
                Ok(true) => debug!(session_id = %id, "response file compacted"),
                Ok(false) => {}
                Err(e) => warn!(session_id = %id, error = %e, "response compaction failed"),
            }
        }
    }
}
