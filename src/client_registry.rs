//! The live set of client sessions: capacity, lookup, and the
//! graceful-shutdown quiescence protocol (§4.5).

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::client_session::ClientSession;
use crate::error::{Result, ServerError};
use crate::player::Player;

pub struct ClientRegistry {
    sessions: Mutex<HashMap<u64, Arc<ClientSession>>>,
    capacity: usize,
    shutdown: CancellationToken,
    count_tx: watch::Sender<usize>,
}

impl ClientRegistry {
    pub fn new(capacity: usize) -> Self {
        let (count_tx, _) = watch::channel(0);
        Self {
            sessions: Mutex::new(HashMap::new()),
            capacity,
            shutdown: CancellationToken::new(),
            count_tx,
        }
    }

    /// Insert `session`. Fails if the registry is at capacity or if a
    /// session with the same connection id is already live (§4.5).
    pub fn register(&self, session: Arc<ClientSession>) -> Result<()> {
        let mut sessions = self.sessions.lock().unwrap();
        if sessions.len() >= self.capacity {
            return Err(ServerError::Capacity);
        }
        if sessions.contains_key(&session.id()) {
            return Err(ServerError::Capacity);
        }
        sessions.insert(session.id(), session);
        let _ = self.count_tx.send(sessions.len());
        Ok(())
    }

    pub fn unregister(&self, session: &Arc<ClientSession>) {
        let mut sessions = self.sessions.lock().unwrap();
        sessions.remove(&session.id());
        let _ = self.count_tx.send(sessions.len());
    }

    /// The session currently logged in as `name`, if any.
    pub fn lookup(&self, name: &str) -> Option<Arc<ClientSession>> {
        let sessions = self.sessions.lock().unwrap();
        sessions
            .values()
            .find(|s| s.username().as_deref() == Some(name))
            .cloned()
    }

    /// Check-and-claim a username for `session` atomically (§4.7: "fails
    /// if ... any other live session is logged in as the same username").
    /// The registry's sessions lock is held across both the uniqueness
    /// scan and the call into `session.login`, per the lock-ordering
    /// table's "client registry > client session" (§5) — this is what
    /// closes the race where two concurrent LOGIN packets for the same
    /// name both pass a separate, unlocked uniqueness check before either
    /// claims it.
    pub fn login(&self, session: &Arc<ClientSession>, name: &str, player: Arc<Player>) -> Result<()> {
        let sessions = self.sessions.lock().unwrap();
        let taken = sessions
            .values()
            .any(|s| !Arc::ptr_eq(s, session) && s.username().as_deref() == Some(name));
        if taken {
            return Err(ServerError::NameInUse);
        }
        session.login(player)
    }

    /// Snapshot of every currently logged-in player.
    pub fn all_players(&self) -> Vec<Arc<Player>> {
        let sessions = self.sessions.lock().unwrap();
        sessions.values().filter_map(|s| s.player()).collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// A token every session loop selects on alongside its receive call.
    /// Cancelling it is the cooperative-scheduling equivalent of
    /// half-closing each socket's read side (DESIGN.md OQ-1): the receive
    /// select! arm loses and the loop winds down exactly as it would on
    /// EOF.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn shutdown_all(&self) {
        self.shutdown.cancel();
    }

    /// Block until the live-session count reaches zero, then release every
    /// waiter. Safe against the check/wait race: each waiter holds its own
    /// `watch` receiver, and `changed()` cannot miss a send that happens
    /// after the preceding `borrow()` (§4.5 implementation contract).
    pub async fn wait_for_empty(&self) {
        let mut rx = self.count_tx.subscribe();
        loop {
            if *rx.borrow() == 0 {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Clock;
    use tokio::net::{TcpListener, TcpStream};

    async fn make_session(id: u64) -> Arc<ClientSession> {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (accepted, connecting) =
            tokio::join!(listener.accept(), TcpStream::connect(addr));
        let _client_side = connecting.unwrap();
        let (_read, write) = accepted.unwrap().0.into_split();
        ClientSession::new(id, write, Arc::new(Clock::new()))
    }

    #[tokio::test]
    async fn capacity_is_enforced() {
        let registry = ClientRegistry::new(1);
        let a = make_session(1).await;
        let b = make_session(2).await;
        assert!(registry.register(a).is_ok());
        assert_eq!(registry.register(b).unwrap_err(), ServerError::Capacity);
    }

    #[tokio::test]
    async fn login_claims_a_username_exactly_once() {
        let registry = ClientRegistry::new(4);
        let a = make_session(1).await;
        let b = make_session(2).await;
        registry.register(a.clone()).unwrap();
        registry.register(b.clone()).unwrap();

        let alice = Arc::new(crate::player::Player::new("alice".into()));
        assert!(registry.login(&a, "alice", alice.clone()).is_ok());
        // A second session claiming the same name, even with its own
        // freshly-interned Player, must be rejected (§4.7, §8 invariant 1) —
        // this is the check the uniqueness race used to slip past when the
        // lookup and the claim were two separately-locked steps.
        assert_eq!(
            registry.login(&b, "alice", alice).unwrap_err(),
            ServerError::NameInUse
        );
        assert!(b.username().is_none());
    }

    #[tokio::test]
    async fn wait_for_empty_returns_immediately_when_already_empty() {
        let registry = ClientRegistry::new(4);
        registry.wait_for_empty().await;
    }

    #[tokio::test]
    async fn wait_for_empty_unblocks_after_last_unregister() {
        let registry = Arc::new(ClientRegistry::new(4));
        let session = make_session(1).await;
        registry.register(session.clone()).unwrap();

        let waiter = {
            let registry = registry.clone();
            tokio::spawn(async move {
                registry.wait_for_empty().await;
            })
        };

        tokio::task::yield_now().await;
        registry.unregister(&session);
        waiter.await.unwrap();
        assert_eq!(registry.len(), 0);
    }
}
