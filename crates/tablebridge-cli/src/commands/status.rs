use std::time::Duration;

use tablebridge_core::protocol::{ClientRequest, DaemonEvent};

use crate::daemon_client::{self, Connection};

fn runtime() -> Option<tokio::runtime::Runtime> {
    match tokio::runtime::Runtime::new() {
        Ok(rt) => Some(rt),
        Err(e) => {
            eprintln!("Runtime error: {e}");
            None
        }
    }
}

pub fn cmd_ping(args: &[String]) -> i32 {
    if !args.is_empty() {
        eprintln!("Usage: tablebridge ping");
        return 1;
    }
    let Some(rt) = runtime() else { return 1 };

    match rt.block_on(daemon_client::request(ClientRequest::Ping)) {
        Ok(DaemonEvent::Pong) => {
            println!("tablebridged is running.");
            0
        }
        Ok(DaemonEvent::Error { message, .. }) => {
            eprintln!("Error: {message}");
            1
        }
        Ok(_) => {
            eprintln!("Unexpected response from daemon.");
            1
        }
        Err(e) => {
            eprintln!("{e}");
            1
        }
    }
}

/// Open a session, wait for its worker, and time one acknowledged probe.
pub fn cmd_probe(args: &[String]) -> i32 {
    if !args.is_empty() {
        eprintln!("Usage: tablebridge probe");
        return 1;
    }
    let Some(rt) = runtime() else { return 1 };

    let result = rt.block_on(async {
        let mut conn = Connection::connect().await?;
        conn.wait_ready().await?;
        conn.send(&ClientRequest::Probe).await?;
        loop {
            match conn.next_event().await? {
                Some(DaemonEvent::ProbeResult {
                    alive, latency_ms, ..
                }) => return Ok((alive, latency_ms)),
                Some(DaemonEvent::Error { message, .. }) => return Err(message),
                Some(DaemonEvent::SessionEnded { reason, .. }) => return Err(reason),
                Some(_) => {}
                None => return Err("Daemon closed the connection.".to_string()),
            }
        }
    });

    match result {
        Ok((true, latency_ms)) => {
            println!("{}", describe_probe(latency_ms));
            0
        }
        Ok((false, _)) => {
            eprintln!("Worker did not acknowledge the probe.");
            1
        }
        Err(e) => {
            eprintln!("{e}");
            1
        }
    }
}

fn describe_probe(latency_ms: Option<u64>) -> String {
    match latency_ms {
        Some(ms) => format!("Worker acknowledged in {ms} ms."),
        None => "Worker acknowledged.".to_string(),
    }
}

pub fn cmd_shutdown(args: &[String]) -> i32 {
    if !args.is_empty() {
        eprintln!("Usage: tablebridge shutdown");
        return 1;
    }
    let Some(rt) = runtime() else { return 1 };

    let result = rt.block_on(async {
        let mut conn = Connection::connect().await?;
        conn.send(&ClientRequest::Shutdown).await?;
        // The daemon closes every connection on its way out.
        let drained = tokio::time::timeout(Duration::from_secs(10), async {
            while conn.next_event().await?.is_some() {}
            Ok::<(), String>(())
        })
        .await;
        match drained {
            Ok(r) => r,
            Err(_) => Err("Daemon did not stop within 10s.".to_string()),
        }
    });

    match result {
        Ok(()) => {
            println!("tablebridged is shutting down.");
            0
        }
        Err(e) => {
            eprintln!("{e}");
            1
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ping_with_args_returns_error() {
        assert_eq!(cmd_ping(&["extra".into()]), 1);
    }

    #[test]
    fn probe_with_args_returns_error() {
        assert_eq!(cmd_probe(&["now".into()]), 1);
    }

    #[test]
    fn probe_latency_is_reported() {
        assert_eq!(describe_probe(Some(12)), "Worker acknowledged in 12 ms.");
        assert_eq!(describe_probe(None), "Worker acknowledged.");
    }

    #[test]
    fn shutdown_with_args_returns_error() {
        assert_eq!(cmd_shutdown(&["now".into()]), 1);
    }
}
