mod aggregator;
mod channel;
mod error;
mod ipc_server;
mod registry;
mod session;
mod supervisor;
mod worker;

use std::fs;
use std::path::Path;
use std::process;

use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use tablebridge_core::config::BridgeConfig;
use tablebridge_core::ipc::{daemon_pid_path, daemon_socket_path};
use tablebridge_core::protocol::{DaemonEvent, SessionId};

use crate::ipc_server::ServerLinks;
use crate::registry::Registry;
use crate::session::SessionManager;

fn check_pid_file(pid_path: &Path, socket_path: &Path) -> Result<(), String> {
    if pid_path.exists() {
        let content = fs::read_to_string(pid_path).unwrap_or_default();
        if let Ok(pid) = content.trim().parse::<i32>() {
            // Signal 0 only checks that the process exists.
            if unsafe { libc::kill(pid, 0) } == 0 {
                return Err(format!("daemon already running (PID {pid})"));
            }
        }
        // Stale PID file
        let _ = fs::remove_file(pid_path);
        let _ = fs::remove_file(socket_path);
    }
    Ok(())
}

fn write_pid_file(pid_path: &Path) -> Result<(), String> {
    if let Some(parent) = pid_path.parent() {
        fs::create_dir_all(parent).map_err(|e| format!("failed to create dir: {e}"))?;
    }
    fs::write(pid_path, format!("{}", process::id()))
        .map_err(|e| format!("failed to write PID file: {e}"))
}

fn cleanup_files(pid_path: &Path, socket_path: &Path) {
    let _ = fs::remove_file(pid_path);
    let _ = fs::remove_file(socket_path);
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() {
    init_tracing();

    let config = match BridgeConfig::load() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("tablebridged: {e}");
            process::exit(1);
        }
    };

    let pid_path = daemon_pid_path();
    let socket_path = daemon_socket_path();

    // 1. PID file protocol
    if let Err(e) = check_pid_file(&pid_path, &socket_path) {
        eprintln!("tablebridged: {e}");
        process::exit(1);
    }
    if let Err(e) = write_pid_file(&pid_path) {
        eprintln!("tablebridged: {e}");
        process::exit(1);
    }
    let _ = fs::remove_file(&socket_path);

    let listener = match ipc_server::bind(&socket_path) {
        Ok(l) => l,
        Err(e) => {
            eprintln!("tablebridged: cannot bind {}: {e}", socket_path.display());
            cleanup_files(&pid_path, &socket_path);
            process::exit(1);
        }
    };

    // 2. Registry and the channels that feed the main loop
    let (events_tx, mut events_rx) = mpsc::unbounded_channel::<(SessionId, DaemonEvent)>();
    let registry = Registry::new(config, events_tx);

    let (register_tx, mut register_rx) = mpsc::unbounded_channel();
    let (unregister_tx, mut unregister_rx) = mpsc::unbounded_channel::<SessionId>();
    let (shutdown_tx, mut shutdown_rx) = mpsc::unbounded_channel::<()>();
    let links = ServerLinks {
        register_tx,
        unregister_tx,
        shutdown_tx,
    };

    // 3. IPC server task
    let server_registry = registry.clone();
    let server_handle = tokio::spawn(async move {
        if let Err(e) = ipc_server::run_server(listener, server_registry, links).await {
            error!(error = %e, "IPC server error");
        }
    });

    // 4. Signal handling
    let (mut sigterm, mut sigint) = match (
        signal(SignalKind::terminate()),
        signal(SignalKind::interrupt()),
    ) {
        (Ok(t), Ok(i)) => (t, i),
        (Err(e), _) | (_, Err(e)) => {
            eprintln!("tablebridged: failed to register signal handlers: {e}");
            cleanup_files(&pid_path, &socket_path);
            process::exit(1);
        }
    };

    info!(
        pid = process::id(),
        socket = %socket_path.display(),
        channels = %registry.config().channel.dir().display(),
        "tablebridged started"
    );

    // 5. Main loop: route registry events to their clients
    let mut sessions = SessionManager::new();
    loop {
        tokio::select! {
            biased;
            Some((session_id, event_tx)) = register_rx.recv() => {
                sessions.add_session(session_id, event_tx);
            }
            Some(session_id) = unregister_rx.recv() => {
                sessions.remove_session(session_id);
                let registry = registry.clone();
                tokio::spawn(async move {
                    // Already gone if the worker ended the session itself.
                    let _ = registry.destroy(session_id).await;
                });
            }
            Some((session_id, event)) = events_rx.recv() => {
                sessions.send_to(session_id, event);
            }
            // Also fires if the server task died and dropped its sender.
            _ = shutdown_rx.recv() => {
                info!("shutdown requested by client");
                break;
            }
            _ = sigterm.recv() => {
                info!("received SIGTERM, shutting down");
                break;
            }
            _ = sigint.recv() => {
                info!("received SIGINT, shutting down");
                break;
            }
        }
    }

    // 6. Graceful shutdown
    server_handle.abort();
    info!(sessions = registry.sessions().len(), "terminating workers");
    registry.shutdown().await;
    while let Ok((session_id, event)) = events_rx.try_recv() {
        sessions.send_to(session_id, event);
    }

    cleanup_files(&pid_path, &socket_path);
    info!("tablebridged stopped");
}
