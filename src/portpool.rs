//! Port pool.
//!
//! Owns the two in-memory indices that back a live agent's service set:
//! `byServer: agent_id -> services[]` and `byPort: tunnel_port -> agent_id`.
//! Both live behind one [`tokio::sync::Mutex`] whose critical sections never
//! block on anything but a single non-blocking `bind`-then-`close` port
//! probe (the pool's only ground truth for whether a stored port is still
//! free, since the OS may have handed it to another process across a
//! restart).

use std::collections::HashMap;
use std::net::TcpListener;
use std::ops::RangeInclusive;

use tokio::sync::Mutex;

use crate::adapters::{ConflictResolution, PortRecord, Service};

/// Owner string marking a port the OS already had bound at probe time.
/// Such ports are never reprobed for the lifetime of the process.
const SENTINEL_OWNER: &str = "__os__";

struct Indices {
    by_server: HashMap<String, Vec<Service>>,
    by_port: HashMap<u16, String>,
}

pub struct PortPool {
    range: RangeInclusive<u16>,
    default_services: Vec<(String, u16)>,
    inner: Mutex<Indices>,
}

impl PortPool {
    pub fn new(range: RangeInclusive<u16>, default_services: Vec<(String, u16)>) -> Self {
        Self {
            range,
            default_services,
            inner: Mutex::new(Indices {
                by_server: HashMap::new(),
                by_port: HashMap::new(),
            }),
        }
    }

    /// Seed the pool from persisted records before the listener opens.
    ///
    /// If two records claim the same `tunnel_port` the first one inserted
    /// wins; the conflicting agent is silently re-allocated on its next
    /// connect. This never errors; startup must always proceed.
    pub async fn load_existing(&self, records: Vec<PortRecord>) {
        let mut indices = self.inner.lock().await;
        for record in records {
            let mut kept = Vec::with_capacity(record.services.len());
            for service in record.services {
                if indices.by_port.contains_key(&service.tunnel_port) {
                    continue;
                }
                indices
                    .by_port
                    .insert(service.tunnel_port, record.agent_id.clone());
                kept.push(service);
            }
            if !kept.is_empty() {
                indices.by_server.insert(record.agent_id.clone(), kept);
            }
        }
    }

    /// Return the service list to advertise for `agent_id`, allocating ports
    /// as needed. Returns `None` if the range was exhausted on a fresh
    /// allocation (the caller must reject the connection).
    pub async fn acquire_or_reuse(
        &self,
        agent_id: &str,
    ) -> Option<(Vec<Service>, Vec<ConflictResolution>)> {
        let mut indices = self.inner.lock().await;

        if indices.by_server.contains_key(agent_id) {
            return Some(Self::reuse_known_agent(&mut indices, &self.range, agent_id));
        }

        Self::allocate_new_agent(&mut indices, &self.range, agent_id, &self.default_services)
    }

    fn reuse_known_agent(
        indices: &mut Indices,
        range: &RangeInclusive<u16>,
        agent_id: &str,
    ) -> (Vec<Service>, Vec<ConflictResolution>) {
        let stored = indices.by_server.get(agent_id).cloned().unwrap_or_default();
        let mut services = Vec::with_capacity(stored.len());
        let mut conflicts = Vec::new();

        for service in stored {
            if probe_port_free(service.tunnel_port) {
                services.push(service);
                continue;
            }

            match allocate_port(indices, range) {
                Some(new_port) => {
                    indices.by_port.remove(&service.tunnel_port);
                    indices.by_port.insert(new_port, agent_id.to_string());
                    conflicts.push(ConflictResolution {
                        service_name: service.name.clone(),
                        old_port: service.tunnel_port,
                        new_port,
                    });
                    services.push(Service {
                        name: service.name,
                        local_port: service.local_port,
                        tunnel_port: new_port,
                    });
                }
                None => {
                    // Range exhausted: leave the stale port in place and let
                    // the caller decide (in practice: reject the connection).
                    services.push(service);
                }
            }
        }

        indices.by_server.insert(agent_id.to_string(), services.clone());
        (services, conflicts)
    }

    fn allocate_new_agent(
        indices: &mut Indices,
        range: &RangeInclusive<u16>,
        agent_id: &str,
        default_services: &[(String, u16)],
    ) -> Option<(Vec<Service>, Vec<ConflictResolution>)> {
        let mut services = Vec::with_capacity(default_services.len());

        for (name, local_port) in default_services {
            match allocate_port(indices, range) {
                Some(tunnel_port) => {
                    indices.by_port.insert(tunnel_port, agent_id.to_string());
                    services.push(Service {
                        name: name.clone(),
                        local_port: *local_port,
                        tunnel_port,
                    });
                }
                None => {
                    // Roll back every partial allocation for this agent.
                    for service in &services {
                        indices.by_port.remove(&service.tunnel_port);
                    }
                    return None;
                }
            }
        }

        indices.by_server.insert(agent_id.to_string(), services.clone());
        Some((services, Vec::new()))
    }

    /// Remove `agent_id` from the pool, freeing its non-sentinel ports.
    /// No-op for an unknown agent.
    pub async fn release(&self, agent_id: &str) {
        let mut indices = self.inner.lock().await;
        if let Some(services) = indices.by_server.remove(agent_id) {
            for service in services {
                if indices.by_port.get(&service.tunnel_port).map(String::as_str)
                    != Some(SENTINEL_OWNER)
                {
                    indices.by_port.remove(&service.tunnel_port);
                }
            }
        }
    }
}

/// Linear scan from `start` to `end`, skipping ports already tracked.
/// OS-bound candidates are marked sentinel and skipped permanently.
fn allocate_port(indices: &mut Indices, range: &RangeInclusive<u16>) -> Option<u16> {
    for port in range.clone() {
        if indices.by_port.contains_key(&port) {
            continue;
        }
        if probe_port_free(port) {
            return Some(port);
        }
        indices.by_port.insert(port, SENTINEL_OWNER.to_string());
    }
    None
}

/// Non-blocking bind-then-close probe: the only portable ground truth for
/// whether the OS still considers a loopback port free.
fn probe_port_free(port: u16) -> bool {
    TcpListener::bind(("127.0.0.1", port)).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(range: RangeInclusive<u16>) -> PortPool {
        PortPool::new(range, crate::config::default_services())
    }

    #[tokio::test]
    async fn new_agent_gets_default_services_in_order() {
        let pool = pool(59100..=59199);
        let (services, conflicts) = pool.acquire_or_reuse("srv1").await.unwrap();
        assert!(conflicts.is_empty());
        assert_eq!(services.len(), 2);
        assert_eq!(services[0].name, "ssh");
        assert_eq!(services[1].name, "http");
        assert!(services[0].tunnel_port < services[1].tunnel_port);
    }

    #[tokio::test]
    async fn repeated_calls_are_stable_without_conflict() {
        let pool = pool(59100..=59199);
        let (first, _) = pool.acquire_or_reuse("srv1").await.unwrap();
        let (second, conflicts) = pool.acquire_or_reuse("srv1").await.unwrap();
        assert_eq!(first, second);
        assert!(conflicts.is_empty());
    }

    #[tokio::test]
    async fn single_port_range_boundary() {
        let single_service = vec![("only".to_string(), 22)];
        let pool = PortPool::new(59200..=59200, single_service);

        assert!(pool.acquire_or_reuse("a").await.is_some());
        assert!(pool.acquire_or_reuse("b").await.is_none());

        pool.release("a").await;
        let (services, _) = pool.acquire_or_reuse("c").await.unwrap();
        assert_eq!(services[0].tunnel_port, 59200);
    }

    #[tokio::test]
    async fn release_frees_the_port_for_reuse() {
        let pool = pool(59300..=59301);
        let (first, _) = pool.acquire_or_reuse("a").await.unwrap();
        pool.release("a").await;
        let (second, _) = pool.acquire_or_reuse("b").await.unwrap();
        let first_ports: Vec<u16> = first.iter().map(|s| s.tunnel_port).collect();
        let second_ports: Vec<u16> = second.iter().map(|s| s.tunnel_port).collect();
        assert_eq!(first_ports, second_ports);
    }

    #[tokio::test]
    async fn range_exhaustion_returns_none_and_touches_nothing() {
        let single_service = vec![("only".to_string(), 22)];
        let pool = PortPool::new(59400..=59400, single_service);
        assert!(pool.acquire_or_reuse("a").await.is_some());
        assert!(pool.acquire_or_reuse("b").await.is_none());
    }

    #[tokio::test]
    async fn load_existing_seeds_indices_and_first_record_wins_conflicts() {
        let pool = pool(59500..=59599);
        let records = vec![
            PortRecord {
                agent_id: "a".to_string(),
                services: vec![Service {
                    name: "ssh".to_string(),
                    local_port: 22,
                    tunnel_port: 59550,
                }],
            },
            PortRecord {
                agent_id: "b".to_string(),
                services: vec![Service {
                    name: "ssh".to_string(),
                    local_port: 22,
                    tunnel_port: 59550,
                }],
            },
        ];
        pool.load_existing(records).await;

        let (a_services, a_conflicts) = pool.acquire_or_reuse("a").await.unwrap();
        assert!(a_conflicts.is_empty());
        assert_eq!(a_services[0].tunnel_port, 59550);

        // "b" lost the race at load time; it gets freshly (re)allocated ports.
        let (b_services, _) = pool.acquire_or_reuse("b").await.unwrap();
        assert_ne!(b_services[0].tunnel_port, 59550);
    }

    #[tokio::test]
    async fn injectivity_holds_across_many_agents() {
        let pool = pool(59600..=59699);
        let mut seen = std::collections::HashSet::new();
        for i in 0..20 {
            let (services, _) = pool.acquire_or_reuse(&format!("agent-{i}")).await.unwrap();
            for service in services {
                assert!(seen.insert(service.tunnel_port), "port reused across agents");
                assert!(pool_range_contains(service.tunnel_port));
            }
        }

        fn pool_range_contains(port: u16) -> bool {
            (59600..=59699).contains(&port)
        }
    }
}
