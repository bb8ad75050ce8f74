//! External adapter contracts.
//!
//! The tunnel core talks to the rest of the system through three narrow
//! interfaces. No concrete implementation ships in this crate; these are
//! boundary types and traits the outer system is expected to implement.

use async_trait::async_trait;

/// A named forwarded port pair for one agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Service {
    pub name: String,
    pub local_port: u16,
    pub tunnel_port: u16,
}

/// Emitted when a stored `tunnel_port` is found occupied by another OS
/// process at reassignment time. Consumed once by the hook layer to persist
/// the replacement and emit audit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConflictResolution {
    pub service_name: String,
    pub old_port: u16,
    pub new_port: u16,
}

/// A persisted assignment loaded at startup, seeding the pool so agents that
/// had ports before a restart keep the same ones.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortRecord {
    pub agent_id: String,
    pub services: Vec<Service>,
}

/// Validates the bearer token presented as the SSH username. Must be safe to
/// call from the handshake task; returning `ok = false` causes immediate
/// close with no hook invoked.
#[async_trait]
pub trait TokenValidator: Send + Sync {
    async fn validate(&self, token: &str) -> (Option<String>, bool);
}

/// Lifecycle notifications for the outer system. `on_connect` fires once per
/// successful authentication, before forwarding begins; `on_disconnect`
/// fires exactly once per matching `on_connect`, after the session has been
/// removed from the registry.
#[async_trait]
pub trait SessionHooks: Send + Sync {
    async fn on_connect(
        &self,
        agent_id: &str,
        services: &[Service],
        conflicts: &[ConflictResolution],
    );

    async fn on_disconnect(&self, agent_id: &str);
}
