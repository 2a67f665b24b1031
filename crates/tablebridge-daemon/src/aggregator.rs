//! Turns the worker's response text into ordered `OutputChunk`s.

use std::time::Instant;

use chrono::Utc;

use tablebridge_core::config::AggregatorConfig;
use tablebridge_core::layout::{self, HEARTBEAT};
use tablebridge_core::protocol::{FlushTrigger, OutputChunk, SessionId};

const PROBE_ACK_PREFIX: &str = "__PROBE_ACK__:";

/// Output of one pass through the [`SentinelFilter`].
#[derive(Debug, Default, PartialEq)]
pub struct Filtered {
    pub text: String,
    pub probe_acks: Vec<String>,
    pub heartbeats: usize,
}

/// Strips sentinel lines out of the response stream.
///
/// A partial line is held back only while it could still turn out to be a
/// sentinel; anything else passes straight through so prompts without a
/// trailing newline are not delayed.
#[derive(Debug)]
pub struct SentinelFilter {
    held: String,
    at_line_start: bool,
}

impl Default for SentinelFilter {
    fn default() -> Self {
        Self {
            held: String::new(),
            at_line_start: true,
        }
    }
}

impl SentinelFilter {
    pub fn feed(&mut self, input: &str) -> Filtered {
        let mut out = Filtered::default();
        let data = std::mem::take(&mut self.held) + input;
        let mut rest = data.as_str();
        let mut at_start = self.at_line_start;

        while !rest.is_empty() {
            let newline = rest.find('\n');
            if !at_start {
                match newline {
                    Some(i) => {
                        out.text.push_str(&rest[..=i]);
                        rest = &rest[i + 1..];
                        at_start = true;
                    }
                    None => {
                        out.text.push_str(rest);
                        rest = "";
                    }
                }
                continue;
            }

            match newline {
                Some(i) => {
                    let line = rest[..i].trim_end_matches('\r');
                    if line == HEARTBEAT {
                        out.heartbeats += 1;
                    } else if let Some(token) = layout::parse_probe_ack(line) {
                        out.probe_acks.push(token.to_string());
                    } else {
                        out.text.push_str(&rest[..=i]);
                    }
                    rest = &rest[i + 1..];
                }
                None => {
                    if could_be_sentinel(rest) {
                        self.held = rest.to_string();
                    } else {
                        out.text.push_str(rest);
                        at_start = false;
                    }
                    rest = "";
                }
            }
        }

        self.at_line_start = at_start;
        out
    }

    /// Release a held partial line. Used once the stream has ended.
    pub fn drain(&mut self) -> String {
        std::mem::take(&mut self.held)
    }
}

fn could_be_sentinel(partial: &str) -> bool {
    let partial = partial.trim_end_matches('\r');
    HEARTBEAT.starts_with(partial)
        || PROBE_ACK_PREFIX.starts_with(partial)
        || partial.starts_with(PROBE_ACK_PREFIX)
}

/// Buffers filtered text and decides when to hand a chunk to the consumer.
///
/// Triggers are checked in priority order on every [`poll`](Self::poll):
/// prompt marker, size, elapsed time. [`finish`](Self::finish) flushes the
/// remainder when the worker has exited. A tool-wait marker flushes like a
/// prompt and is remembered until [`take_tool_wait`](Self::take_tool_wait).
pub struct OutputAggregator {
    session_id: SessionId,
    config: AggregatorConfig,
    buffer: String,
    tool_wait: bool,
    // Tail of already-flushed text, so a marker split by a size flush is
    // still recognised.
    carry: String,
    carry_len: usize,
    last_flush: Instant,
}

impl OutputAggregator {
    pub fn new(session_id: SessionId, config: AggregatorConfig, now: Instant) -> Self {
        let carry_len = config
            .prompt_markers
            .iter()
            .chain(&config.tool_markers)
            .map(|m| m.len())
            .max()
            .unwrap_or(0)
            .saturating_sub(1);
        Self {
            session_id,
            config,
            buffer: String::new(),
            tool_wait: false,
            carry: String::new(),
            carry_len,
            last_flush: now,
        }
    }

    pub fn push(&mut self, text: &str) {
        self.buffer.push_str(text);
    }

    pub fn buffered(&self) -> &str {
        &self.buffer
    }

    pub fn poll(&mut self, now: Instant) -> Option<OutputChunk> {
        if self.buffer.is_empty() {
            return None;
        }
        let tool_wait = self.marker_detected(&self.config.tool_markers);
        let trigger = if tool_wait || self.marker_detected(&self.config.prompt_markers) {
            self.tool_wait |= tool_wait;
            FlushTrigger::PromptDetected
        } else if self.buffer.len() >= self.config.flush_bytes {
            FlushTrigger::SizeThreshold
        } else if now.duration_since(self.last_flush) >= self.config.flush_interval() {
            FlushTrigger::TimeThreshold
        } else {
            return None;
        };
        Some(self.take(trigger, now))
    }

    pub fn finish(&mut self, now: Instant) -> Option<OutputChunk> {
        if self.buffer.is_empty() {
            return None;
        }
        Some(self.take(FlushTrigger::EndOfStream, now))
    }

    /// True once if a flushed chunk ended with the worker asking for a tool
    /// result.
    pub fn take_tool_wait(&mut self) -> bool {
        std::mem::take(&mut self.tool_wait)
    }

    fn marker_detected(&self, markers: &[String]) -> bool {
        let haystack = format!("{}{}", self.carry, self.buffer);
        let boundary = self.carry.len();
        markers.iter().any(|marker| {
            !marker.is_empty()
                && haystack
                    .match_indices(marker.as_str())
                    .any(|(start, m)| start + m.len() > boundary)
        })
    }

    fn take(&mut self, trigger: FlushTrigger, now: Instant) -> OutputChunk {
        let text = std::mem::take(&mut self.buffer);
        self.carry.push_str(&text);
        if self.carry.len() > self.carry_len {
            let mut cut = self.carry.len() - self.carry_len;
            while !self.carry.is_char_boundary(cut) {
                cut += 1;
            }
            self.carry.drain(..cut);
        }
        self.last_flush = now;
        OutputChunk {
            session_id: self.session_id,
            text,
            produced_at: Utc::now(),
            trigger,
        }
    }
}
