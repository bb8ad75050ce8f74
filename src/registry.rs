//! Session registry.
//!
//! A map `agent_id -> Session` guarded by a read/write lock. Registering a
//! new session for an agent that already has one evicts the predecessor
//! (last-writer-wins, I4): the old SSH connection is closed before the new
//! entry is installed.
//!
//! The subtle race this module exists to resolve is an evicted session's
//! own teardown path removing the newer replacement that took its place.
//! [`unregister_conn`](Registry::unregister_conn) guards against it by
//! deleting only if the stored entry's connection identity still matches
//! the one being torn down.

use std::collections::HashMap;
use std::time::SystemTime;

use tokio::sync::RwLock;

/// Anything identifying one underlying SSH connection uniquely, so a
/// predecessor's teardown can never be mistaken for its successor's.
pub trait ConnectionId: PartialEq + Clone + Send + Sync {}
impl<T: PartialEq + Clone + Send + Sync> ConnectionId for T {}

pub struct Session<C: ConnectionId> {
    pub agent_id: String,
    pub connection: C,
    pub services: Vec<crate::adapters::Service>,
    pub connected_at: SystemTime,
}

impl<C: ConnectionId> Clone for Session<C> {
    fn clone(&self) -> Self {
        Self {
            agent_id: self.agent_id.clone(),
            connection: self.connection.clone(),
            services: self.services.clone(),
            connected_at: self.connected_at,
        }
    }
}

pub struct Registry<C: ConnectionId> {
    sessions: RwLock<HashMap<String, Session<C>>>,
}

impl<C: ConnectionId> Default for Registry<C> {
    fn default() -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
        }
    }
}

impl<C: ConnectionId> Registry<C> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install `session`, returning the evicted predecessor's connection
    /// (if any) so the caller can close it. The caller, not this method,
    /// performs the actual close (closing a connection is an I/O operation,
    /// and this registry's critical sections stay lock-only).
    pub async fn register(&self, session: Session<C>) -> Option<C> {
        let mut sessions = self.sessions.write().await;
        let evicted = sessions.insert(session.agent_id.clone(), session);
        evicted.map(|s| s.connection)
    }

    /// Remove `agent_id`'s entry only if its stored connection matches
    /// `conn`. A mismatch means a newer session has already replaced it;
    /// this call must then be a no-op.
    pub async fn unregister_conn(&self, agent_id: &str, conn: &C) {
        let mut sessions = self.sessions.write().await;
        if let std::collections::hash_map::Entry::Occupied(entry) = sessions.entry(agent_id.to_string()) {
            if &entry.get().connection == conn {
                entry.remove();
            }
        }
    }

    pub async fn get(&self, agent_id: &str) -> Option<Session<C>> {
        self.sessions.read().await.get(agent_id).cloned()
    }

    /// Look up the connection to close for `agent_id`, without mutating the
    /// map. The caller closes the connection; the session's own teardown
    /// path then calls [`unregister_conn`](Registry::unregister_conn) to
    /// remove the entry.
    pub async fn disconnect(&self, agent_id: &str) -> Option<C> {
        self.sessions
            .read()
            .await
            .get(agent_id)
            .map(|s| s.connection.clone())
    }

    /// A snapshot of every live session, safe to iterate without holding
    /// the lock.
    pub async fn all(&self) -> Vec<Session<C>> {
        self.sessions.read().await.values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::Service;

    fn session(agent_id: &str, connection: u32) -> Session<u32> {
        Session {
            agent_id: agent_id.to_string(),
            connection,
            services: vec![Service {
                name: "ssh".to_string(),
                local_port: 22,
                tunnel_port: 40000,
            }],
            connected_at: SystemTime::now(),
        }
    }

    #[tokio::test]
    async fn register_then_get_returns_the_new_session() {
        let registry: Registry<u32> = Registry::new();
        assert!(registry.register(session("a", 1)).await.is_none());
        let got = registry.get("a").await.unwrap();
        assert_eq!(got.connection, 1);
    }

    #[tokio::test]
    async fn registering_twice_evicts_the_predecessor_connection() {
        let registry: Registry<u32> = Registry::new();
        registry.register(session("a", 1)).await;
        let evicted = registry.register(session("a", 2)).await;
        assert_eq!(evicted, Some(1));
        assert_eq!(registry.get("a").await.unwrap().connection, 2);
    }

    #[tokio::test]
    async fn unregister_conn_is_noop_if_connection_was_replaced() {
        let registry: Registry<u32> = Registry::new();
        registry.register(session("a", 1)).await;
        registry.register(session("a", 2)).await;

        // The evicted predecessor's teardown path calls this with its own
        // (stale) connection id; it must not remove the newer entry.
        registry.unregister_conn("a", &1).await;
        assert_eq!(registry.get("a").await.unwrap().connection, 2);
    }

    #[tokio::test]
    async fn unregister_conn_removes_matching_entry() {
        let registry: Registry<u32> = Registry::new();
        registry.register(session("a", 1)).await;
        registry.unregister_conn("a", &1).await;
        assert!(registry.get("a").await.is_none());
    }

    #[tokio::test]
    async fn all_returns_a_consistent_snapshot() {
        let registry: Registry<u32> = Registry::new();
        registry.register(session("a", 1)).await;
        registry.register(session("b", 2)).await;
        let mut ids: Vec<String> = registry.all().await.into_iter().map(|s| s.agent_id).collect();
        ids.sort();
        assert_eq!(ids, vec!["a".to_string(), "b".to_string()]);
    }

    #[tokio::test]
    async fn concurrent_register_and_get_stays_consistent() {
        use std::sync::Arc;

        let registry = Arc::new(Registry::<u32>::new());
        let mut handles = Vec::new();
        for i in 0..50u32 {
            let registry = registry.clone();
            handles.push(tokio::spawn(async move {
                registry.register(session(&format!("agent-{i}"), i)).await;
                registry.get(&format!("agent-{i}")).await
            }));
        }
        for handle in handles {
            let got = handle.await.unwrap();
            assert!(got.is_some());
        }
        assert_eq!(registry.all().await.len(), 50);
    }
}
