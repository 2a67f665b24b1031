use std::io::Write;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader, Lines};

use tablebridge_core::layout::EXIT_COMMAND;
use tablebridge_core::protocol::{ClientRequest, DaemonEvent, SessionState};

use super::query::{stream_answer, AnswerEnd};
use crate::daemon_client::Connection;

pub fn cmd_chat(args: &[String]) -> i32 {
    if !args.is_empty() {
        eprintln!("Usage: tablebridge chat");
        return 1;
    }

    let rt = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("Runtime error: {e}");
            return 1;
        }
    };

    match rt.block_on(run_chat()) {
        Ok(()) => 0,
        Err(e) => {
            eprintln!("{e}");
            1
        }
    }
}

/// Read the next non-empty line from the user and hand it to the worker as
/// the result of its pending tool call. `false` once stdin is exhausted.
async fn answer_tool_call<R: AsyncBufRead + Unpin>(
    conn: &mut Connection,
    lines: &mut Lines<R>,
) -> Result<bool, String> {
    eprintln!("Worker is waiting for a tool result. Enter it on one line:");
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => return Ok(false),
            Err(e) => return Err(format!("Read error: {e}")),
        };
        let text = line.trim();
        if text.is_empty() {
            continue;
        }
        conn.send(&ClientRequest::ToolResult {
            text: text.to_string(),
        })
        .await?;
        return Ok(true);
    }
}

async fn run_chat() -> Result<(), String> {
    let mut conn = Connection::connect().await?;
    let mut out = std::io::stdout();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    // Show the worker's banner while it starts.
    loop {
        match conn.next_event().await? {
            Some(DaemonEvent::Welcome { session_id }) => {
                eprintln!("Connected, session {session_id}. Waiting for worker...");
            }
            Some(DaemonEvent::Chunk(chunk)) => {
                write!(out, "{}", chunk.text).map_err(|e| format!("Write error: {e}"))?;
                out.flush().map_err(|e| format!("Write error: {e}"))?;
            }
            Some(DaemonEvent::StateChanged {
                state: SessionState::Ready,
                ..
            }) => break,
            Some(DaemonEvent::StateChanged {
                state: SessionState::AwaitingTool,
                ..
            }) => {
                if !answer_tool_call(&mut conn, &mut lines).await? {
                    return Ok(());
                }
            }
            Some(DaemonEvent::Error { message, .. }) => return Err(message),
            Some(DaemonEvent::SessionEnded { reason, .. }) => return Err(reason),
            Some(_) => {}
            None => return Err("Daemon closed the connection.".to_string()),
        }
    }

    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => return Err(format!("Read error: {e}")),
        };
        let text = line.trim();
        if text.is_empty() {
            continue;
        }

        conn.send(&ClientRequest::Query {
            text: text.to_string(),
        })
        .await?;
        loop {
            match stream_answer(&mut conn, &mut out).await {
                Ok(AnswerEnd::Ready) => break,
                Ok(AnswerEnd::ToolCall) => {
                    if !answer_tool_call(&mut conn, &mut lines).await? {
                        return Ok(());
                    }
                }
                Ok(AnswerEnd::Ended(reason)) => {
                    if !text.eq_ignore_ascii_case(EXIT_COMMAND) {
                        eprintln!("Session ended: {reason}");
                    }
                    return Ok(());
                }
                // Busy or restarted: report and keep the session.
                Err(e) => {
                    eprintln!("{e}");
                    break;
                }
            }
        }
    }

    if let Some(id) = conn.session_id() {
        eprintln!("Closing session {id}.");
    }
    Ok(())
}
