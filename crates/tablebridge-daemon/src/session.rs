use std::collections::HashMap;

use tokio::sync::mpsc;
use tracing::warn;

use tablebridge_core::protocol::{DaemonEvent, SessionId};

/// Routes registry events to the connected client that owns each session.
pub struct SessionManager {
    clients: HashMap<SessionId, mpsc::Sender<DaemonEvent>>,
}

impl SessionManager {
    pub fn new() -> Self {
        Self {
            clients: HashMap::new(),
        }
    }

    pub fn add_session(&mut self, id: SessionId, event_tx: mpsc::Sender<DaemonEvent>) {
        self.clients.insert(id, event_tx);
    }

    pub fn remove_session(&mut self, id: SessionId) {
        self.clients.remove(&id);
    }

    /// Send an event to the client owning `id`.
    ///
    /// A client whose channel is full is disconnected rather than silently
    /// missing output: dropping its sender ends the connection's write loop.
    /// Returns false when the client is gone.
    pub fn send_to(&mut self, id: SessionId, event: DaemonEvent) -> bool {
        let Some(tx) = self.clients.get(&id) else {
            return false;
        };
        match tx.try_send(event) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(session_id = %id, "client not keeping up, disconnecting");
                self.clients.remove(&id);
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.clients.remove(&id);
                false
            }
        }
    }

    #[cfg(test)]
    pub fn session_count(&self) -> usize {
        self.clients.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn send_to_routes_by_session() {
        let mut sm = SessionManager::new();
        let (tx1, mut rx1) = mpsc::channel(16);
        let (tx2, mut rx2) = mpsc::channel(16);
        let a = SessionId::new();
        let b = SessionId::new();
        sm.add_session(a, tx1);
        sm.add_session(b, tx2);

        assert!(sm.send_to(a, DaemonEvent::Pong));
        assert!(rx1.try_recv().is_ok());
        assert!(rx2.try_recv().is_err());
    }

    #[test]
    fn send_to_unknown_session_returns_false() {
        let mut sm = SessionManager::new();
        assert!(!sm.send_to(SessionId::new(), DaemonEvent::Pong));
    }

    #[test]
    fn send_to_disconnected_removes_session() {
        let mut sm = SessionManager::new();
        let (tx, rx) = mpsc::channel(16);
        let id = SessionId::new();
        sm.add_session(id, tx);
        drop(rx);

        assert!(!sm.send_to(id, DaemonEvent::Pong));
        assert_eq!(sm.session_count(), 0);
    }

    #[test]
    fn full_channel_disconnects_client() {
        let mut sm = SessionManager::new();
        let (tx, mut rx) = mpsc::channel(1);
        let id = SessionId::new();
        sm.add_session(id, tx);

        assert!(sm.send_to(id, DaemonEvent::Pong));
        assert!(!sm.send_to(id, DaemonEvent::Pong));
        assert_eq!(sm.session_count(), 0);

        // The queued event is still delivered, then the stream ends.
        assert!(rx.try_recv().is_ok());
        assert!(matches!(
            rx.try_recv(),
            Err(mpsc::error::TryRecvError::Disconnected)
        ));
    }

    #[test]
    fn remove_session_drops_client() {
        let mut sm = SessionManager::new();
        let (tx, _rx) = mpsc::channel(16);
        let id = SessionId::new();
        sm.add_session(id, tx);
        sm.remove_session(id);
        assert_eq!(sm.session_count(), 0);
    }
}
