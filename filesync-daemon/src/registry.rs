//! Live server sessions and routing of outgoing sync events.

use std::collections::HashMap;
use std::net::SocketAddr;

use tokio::sync::RwLock;
use uuid::Uuid;

use filesync_core::codec::Message;
use filesync_core::{ErrorCode, UserId};
use filesync_engine::OutgoingEvent;

use crate::messenger::Messenger;

struct Entry {
    user: Option<UserId>,
    syncing: bool,
    messenger: Messenger,
}

/// Limits are counts; zero disables a limit.
pub struct ConnectionRegistry {
    sessions: RwLock<HashMap<Uuid, Entry>>,
    max_clients: usize,
    max_per_user: usize,
}

impl ConnectionRegistry {
    pub fn new(max_clients: usize, max_per_user: usize) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            max_clients,
            max_per_user,
        }
    }

    /// Admit a freshly accepted connection.
    pub async fn register(
        &self,
        peer: SocketAddr,
        messenger: Messenger,
    ) -> Result<Uuid, ErrorCode> {
        let mut sessions = self.sessions.write().await;
        if self.max_clients > 0 && sessions.len() >= self.max_clients {
            return Err(ErrorCode::TooManyClients);
        }
        let id = Uuid::new_v4();
        sessions.insert(
            id,
            Entry {
                user: None,
                syncing: false,
                messenger,
            },
        );
        tracing::debug!(%peer, session = %id, live = sessions.len(), "session registered");
        Ok(id)
    }

    /// Bind the session to `user`, unless that user is at the per-user limit.
    pub async fn authenticate(&self, id: Uuid, user: UserId) -> Result<(), ErrorCode> {
        let mut sessions = self.sessions.write().await;
        let live = sessions
            .iter()
            .filter(|(other, e)| **other != id && e.user == Some(user))
            .count();
        if self.max_per_user > 0 && live >= self.max_per_user {
            return Err(ErrorCode::TooManyConnections);
        }
        if let Some(entry) = sessions.get_mut(&id) {
            entry.user = Some(user);
        }
        Ok(())
    }

    pub async fn set_syncing(&self, id: Uuid, syncing: bool) {
        if let Some(entry) = self.sessions.write().await.get_mut(&id) {
            entry.syncing = syncing;
        }
    }

    pub async fn remove(&self, id: Uuid) {
        self.sessions.write().await.remove(&id);
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Messengers of the sync-active sessions owned by `owner`.
    pub async fn recipients(&self, owner: UserId) -> Vec<Messenger> {
        if owner.is_none() {
            return Vec::new();
        }
        self.sessions
            .read()
            .await
            .values()
            .filter(|e| e.syncing && e.user == Some(owner))
            .map(|e| e.messenger.clone())
            .collect()
    }

    /// Forward one reconciled change. Returns how many sessions took it.
    pub async fn publish(&self, outgoing: &OutgoingEvent) -> usize {
        let mut delivered = 0;
        for messenger in self.recipients(outgoing.owner).await {
            match messenger.send(Message::SyncEvent(outgoing.event.clone())).await {
                Ok(()) => delivered += 1,
                Err(err) => tracing::debug!(error = %err, "dropping event for closed session"),
            }
        }
        delivered
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use filesync_core::codec::decode;
    use filesync_core::protocol::SyncEvent;
    use filesync_core::{ObjectKind, SyncAction};
    use tokio::sync::mpsc;

    fn peer() -> SocketAddr {
        "127.0.0.1:40000".parse().expect("addr")
    }

    fn messenger() -> (Messenger, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(8);
        (Messenger::from_channel(tx), rx)
    }

    fn event(owner: u64) -> OutgoingEvent {
        OutgoingEvent {
            owner: UserId(owner),
            event: SyncEvent {
                action: SyncAction::Created,
                object_kind: ObjectKind::Folder,
                name: "docs".into(),
                path: "%ROOT_DIR%".into(),
                hash: String::new(),
                new_updated_at: Utc::now(),
            },
        }
    }

    #[tokio::test]
    async fn events_reach_only_syncing_sessions_of_the_owner() {
        let registry = ConnectionRegistry::new(0, 0);
        let (owner_syncing, mut rx_a) = messenger();
        let (owner_idle, mut rx_b) = messenger();
        let (stranger, mut rx_c) = messenger();

        let a = registry.register(peer(), owner_syncing).await.expect("a");
        let b = registry.register(peer(), owner_idle).await.expect("b");
        let c = registry.register(peer(), stranger).await.expect("c");
        registry.authenticate(a, UserId(7)).await.expect("auth a");
        registry.authenticate(b, UserId(7)).await.expect("auth b");
        registry.authenticate(c, UserId(8)).await.expect("auth c");
        registry.set_syncing(a, true).await;
        registry.set_syncing(c, true).await;

        assert_eq!(registry.publish(&event(7)).await, 1);
        let frame = decode(&rx_a.recv().await.expect("frame")).expect("decode");
        assert!(matches!(frame.message, Message::SyncEvent(_)));
        assert!(rx_b.try_recv().is_err());
        assert!(rx_c.try_recv().is_err());
    }

    #[tokio::test]
    async fn unowned_events_are_never_published() {
        let registry = ConnectionRegistry::new(0, 0);
        let (m, _rx) = messenger();
        let id = registry.register(peer(), m).await.expect("register");
        registry.set_syncing(id, true).await;
        assert_eq!(registry.publish(&event(0)).await, 0);
    }

    #[tokio::test]
    async fn client_limit_applies_at_registration() {
        let registry = ConnectionRegistry::new(1, 0);
        let (m1, _r1) = messenger();
        let (m2, _r2) = messenger();
        let first = registry.register(peer(), m1).await.expect("first");
        assert_eq!(
            registry.register(peer(), m2.clone()).await,
            Err(ErrorCode::TooManyClients)
        );
        registry.remove(first).await;
        assert!(registry.register(peer(), m2).await.is_ok());
    }

    #[tokio::test]
    async fn per_user_limit_applies_at_authentication() {
        let registry = ConnectionRegistry::new(0, 1);
        let (m1, _r1) = messenger();
        let (m2, _r2) = messenger();
        let a = registry.register(peer(), m1).await.expect("a");
        let b = registry.register(peer(), m2).await.expect("b");
        registry.authenticate(a, UserId(7)).await.expect("first login");
        assert_eq!(
            registry.authenticate(b, UserId(7)).await,
            Err(ErrorCode::TooManyConnections)
        );
        assert!(registry.authenticate(b, UserId(8)).await.is_ok());
    }
}
