use std::io::Write;

use tablebridge_core::protocol::{ClientRequest, DaemonEvent, SessionState};

use crate::daemon_client::{Connection, TOOL_CALL_HINT};

/// How an answer stream stopped.
#[derive(Debug, PartialEq)]
pub enum AnswerEnd {
    /// The worker is back at its prompt.
    Ready,
    /// The worker is blocked until the client sends a tool result.
    ToolCall,
    /// The session is gone (worker exited, daemon stopped, ...).
    Ended(String),
}

pub fn cmd_query(args: &[String]) -> i32 {
    let text = args.join(" ");
    if text.trim().is_empty() {
        eprintln!("Usage: tablebridge query <text>");
        return 1;
    }

    let rt = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("Runtime error: {e}");
            return 1;
        }
    };

    match rt.block_on(run_query(text)) {
        Ok(AnswerEnd::Ready) => 0,
        Ok(AnswerEnd::ToolCall) => {
            eprintln!("{TOOL_CALL_HINT}");
            1
        }
        Ok(AnswerEnd::Ended(reason)) => {
            eprintln!("Session ended: {reason}");
            1
        }
        Err(e) => {
            eprintln!("{e}");
            1
        }
    }
}

async fn run_query(text: String) -> Result<AnswerEnd, String> {
    let mut conn = Connection::connect().await?;
    conn.wait_ready().await?;
    conn.send(&ClientRequest::Query { text }).await?;
    stream_answer(&mut conn, &mut std::io::stdout()).await
}

/// Print output chunks for the query just sent until the worker prompts
/// again or the session ends.
pub async fn stream_answer(
    conn: &mut Connection,
    out: &mut impl Write,
) -> Result<AnswerEnd, String> {
    let mut started = false;
    loop {
        let Some(event) = conn.next_event().await? else {
            return Ok(AnswerEnd::Ended("connection closed".to_string()));
        };
        match event {
            DaemonEvent::QueryAccepted { .. }
            | DaemonEvent::StateChanged {
                state: SessionState::Busy,
                ..
            } => started = true,
            DaemonEvent::Chunk(chunk) => {
                write!(out, "{}", chunk.text).map_err(|e| format!("Write error: {e}"))?;
                out.flush().map_err(|e| format!("Write error: {e}"))?;
            }
            DaemonEvent::StateChanged {
                state: SessionState::Ready,
                ..
            } if started => return Ok(AnswerEnd::Ready),
            DaemonEvent::StateChanged {
                state: SessionState::AwaitingTool,
                ..
            } => return Ok(AnswerEnd::ToolCall),
            DaemonEvent::Restarted { reason, .. } => {
                return Err(format!("Worker restarted ({reason}); query dropped."));
            }
            DaemonEvent::SessionEnded { reason, .. } => return Ok(AnswerEnd::Ended(reason)),
            DaemonEvent::Error { message, .. } => return Err(message),
            _ => {}
        }
    }
}
