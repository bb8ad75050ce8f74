//! SshHandler struct, constructors and private helper methods. The
//! `russh::server::Handler` trait implementation itself (the connection
//! state machine) lives in `handler_impl.rs`.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use russh::server::Handle;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::adapters::{ConflictResolution, Service, SessionHooks, TokenValidator};
use crate::config::Config;
use crate::gate::HandshakeSlot;
use crate::portpool::PortPool;
use crate::registry::Registry;

/// Identifies one underlying SSH connection by the monotonic id the server
/// assigned it at accept time, while still carrying the live [`Handle`]
/// needed to force-close an evicted predecessor. Equality is by id only
/// (`Handle` itself carries no identity comparison).
#[derive(Clone)]
pub(super) struct ConnHandle {
    pub(super) id: u64,
    pub(super) handle: Handle,
}

impl PartialEq for ConnHandle {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

/// Per-connection state machine driver for one authenticated (or
/// in-progress) SSH session: accepted, handshaking under a deadline,
/// authenticated, serving, draining, closed.
pub struct SshHandler {
    pub(super) config: Arc<Config>,
    pub(super) port_pool: Arc<PortPool>,
    pub(super) registry: Arc<Registry<ConnHandle>>,
    pub(super) validator: Arc<dyn TokenValidator>,
    pub(super) hooks: Arc<dyn SessionHooks>,
    pub(super) peer_addr: Option<SocketAddr>,
    pub(super) conn_id: u64,

    /// `None` means this connection was refused by the gate before a
    /// handshake slot existed; every auth attempt must fail immediately.
    pub(super) handshake_slot: Option<HandshakeSlot>,

    /// When the TCP accept happened. `auth_none` compares against this to
    /// enforce the handshake deadline (kex isn't visible to `Handler`, so
    /// the deadline is enforced at the point each auth attempt arrives).
    pub(super) accepted_at: Instant,

    pub(super) session_handle: Option<Handle>,
    pub(super) agent_id: Option<String>,
    pub(super) services: Vec<Service>,
    pub(super) conflicts: Vec<ConflictResolution>,

    /// Signalled once to stop every per-service listener and the keepalive
    /// loop during teardown.
    pub(super) shutdown: Arc<Notify>,
    pub(super) forward_tasks: Vec<JoinHandle<()>>,
    pub(super) keepalive_task: Option<JoinHandle<()>>,

    /// Which `tcpip-forward` request index we're on (the *n*-th request
    /// binds the *n*-th service in order).
    pub(super) next_forward_index: usize,
}

impl SshHandler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Arc<Config>,
        port_pool: Arc<PortPool>,
        registry: Arc<Registry<ConnHandle>>,
        validator: Arc<dyn TokenValidator>,
        hooks: Arc<dyn SessionHooks>,
        peer_addr: Option<SocketAddr>,
        conn_id: u64,
        handshake_slot: HandshakeSlot,
    ) -> Self {
        Self {
            config,
            port_pool,
            registry,
            validator,
            hooks,
            peer_addr,
            conn_id,
            handshake_slot: Some(handshake_slot),
            accepted_at: Instant::now(),
            session_handle: None,
            agent_id: None,
            services: Vec::new(),
            conflicts: Vec::new(),
            shutdown: Arc::new(Notify::new()),
            forward_tasks: Vec::new(),
            keepalive_task: None,
            next_forward_index: 0,
        }
    }

    /// Build a handler for a connection the gate already rejected. It holds
    /// no handshake slot and fails every auth attempt without consulting
    /// the validator.
    pub fn gated_rejection(peer_addr: Option<SocketAddr>) -> Self {
        Self {
            config: Arc::new(rejection_config()),
            port_pool: Arc::new(PortPool::new(1..=1, Vec::new())),
            registry: Arc::new(Registry::new()),
            validator: Arc::new(AlwaysDenyValidator),
            hooks: Arc::new(NoopHooks),
            peer_addr,
            conn_id: u64::MAX,
            handshake_slot: None,
            accepted_at: Instant::now(),
            session_handle: None,
            agent_id: None,
            services: Vec::new(),
            conflicts: Vec::new(),
            shutdown: Arc::new(Notify::new()),
            forward_tasks: Vec::new(),
            keepalive_task: None,
            next_forward_index: 0,
        }
    }

    /// Stop every per-service listener and the keepalive loop. Idempotent.
    pub(super) fn stop_background_tasks(&mut self) {
        self.shutdown.notify_waiters();
        for task in self.forward_tasks.drain(..) {
            task.abort();
        }
        if let Some(task) = self.keepalive_task.take() {
            task.abort();
        }
    }
}

fn rejection_config() -> Config {
    Config {
        listen_addr: ":0".to_string(),
        data_dir: std::env::temp_dir(),
        port_range: 1..=1,
        rate_limit: 0,
        max_pending: 0,
        handshake_timeout: std::time::Duration::from_secs(1),
        keepalive_interval: std::time::Duration::from_secs(2),
        keepalive_timeout: std::time::Duration::from_millis(500),
        default_services: Vec::new(),
    }
}

struct AlwaysDenyValidator;

#[async_trait::async_trait]
impl TokenValidator for AlwaysDenyValidator {
    async fn validate(&self, _token: &str) -> (Option<String>, bool) {
        (None, false)
    }
}

struct NoopHooks;

#[async_trait::async_trait]
impl SessionHooks for NoopHooks {
    async fn on_connect(
        &self,
        _agent_id: &str,
        _services: &[Service],
        _conflicts: &[crate::adapters::ConflictResolution],
    ) {
    }

    async fn on_disconnect(&self, _agent_id: &str) {}
}
