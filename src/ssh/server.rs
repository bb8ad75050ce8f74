//! Top-level `russh::server::Server` bootstrap. Builds one
//! [`SshHandler`] per accepted TCP connection, wired to the shared pool,
//! registry, gate and adapters.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use log::{error, info};
use russh::server::{Handler, Server};

use crate::adapters::{SessionHooks, TokenValidator};
use crate::config::Config;
use crate::gate::Gate;
use crate::portpool::PortPool;
use crate::registry::Registry;

use super::handler::ConnHandle;
use super::SshHandler;

/// The main SSH server that creates a handler for each connection.
///
/// The session registry is keyed by [`ConnHandle`], a type private to this
/// module. Callers outside `ssh::` supply the port pool (seeded from
/// persisted records before the listener opens) and the adapters, but never
/// the registry itself, since nothing outside this module ever needs to
/// construct or inspect it directly.
#[derive(Clone)]
pub struct TunnelServer {
    config: Arc<Config>,
    port_pool: Arc<PortPool>,
    registry: Arc<Registry<ConnHandle>>,
    gate: Arc<Gate>,
    validator: Arc<dyn TokenValidator>,
    hooks: Arc<dyn SessionHooks>,
    next_conn_id: Arc<AtomicU64>,
}

impl TunnelServer {
    pub fn new(
        config: Arc<Config>,
        port_pool: Arc<PortPool>,
        validator: Arc<dyn TokenValidator>,
        hooks: Arc<dyn SessionHooks>,
    ) -> Self {
        let gate = Arc::new(Gate::new(config.rate_limit, config.max_pending));
        Self {
            config,
            port_pool,
            registry: Arc::new(Registry::new()),
            gate,
            validator,
            hooks,
            next_conn_id: Arc::new(AtomicU64::new(0)),
        }
    }
}

impl Server for TunnelServer {
    type Handler = SshHandler;

    fn new_client(&mut self, peer_addr: Option<SocketAddr>) -> Self::Handler {
        info!("new SSH connection from {:?}", peer_addr);
        let conn_id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);

        // The gate runs right here, at accept time, before any key
        // exchange cost is paid. A denied connection still gets a Handler
        // (the trait gives us no other way to refuse), but it carries no
        // handshake slot and is rejected at its first auth attempt instead.
        if !self.gate.check_rate() {
            debug_rate_limited(peer_addr);
            return SshHandler::gated_rejection(peer_addr);
        }

        let Some(slot) = self.gate.try_acquire_handshake_slot() else {
            debug_pending_exceeded(peer_addr);
            return SshHandler::gated_rejection(peer_addr);
        };

        SshHandler::new(
            self.config.clone(),
            self.port_pool.clone(),
            self.registry.clone(),
            self.validator.clone(),
            self.hooks.clone(),
            peer_addr,
            conn_id,
            slot,
        )
    }

    fn handle_session_error(&mut self, error: <Self::Handler as Handler>::Error) {
        error!("session error: {:?}", error);
    }
}

fn debug_rate_limited(peer_addr: Option<SocketAddr>) {
    log::debug!("connection from {:?} dropped: rate limit exceeded", peer_addr);
}

fn debug_pending_exceeded(peer_addr: Option<SocketAddr>) {
    log::debug!("connection from {:?} dropped: max_pending exceeded", peer_addr);
}
