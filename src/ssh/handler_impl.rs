//! `russh::server::Handler` trait implementation for [`SshHandler`] (the
//! connection state machine: accepted, handshaking under a deadline,
//! authenticated, serving, draining, closed).
//!
//! Two adaptations forced by how `russh`'s callback-per-message `Handler`
//! trait is shaped rather than a free-running loop we control (recorded in
//! DESIGN.md):
//!
//! - The handshake deadline can't be raced against key exchange directly.
//!   `auth_none` is the first callback that sees a connection at all, and it
//!   carries no `Session`/`Handle` to cancel with. The deadline is instead
//!   enforced by comparing elapsed time since accept against the configured
//!   timeout at the moment each auth attempt arrives.
//! - Port allocation is folded into the `auth_none` callback rather than
//!   deferred to `auth_succeeded`: once `Auth::Accept` is returned there is
//!   no take-back, so "range exhausted closes the connection with no hook
//!   fired" can only be implemented by deciding it before accepting.
//!
//! Teardown (unregister + `on_disconnect` + stopping background tasks) is
//! driven by `Drop`, since `russh` gives no single callback that fires once
//! per *connection* closing (only per-*channel* events), and a `-N -R`
//! session never opens a data channel toward us at all.

use async_trait::async_trait;
use log::{info, warn};
use russh::server::{Auth, Handler, Msg, Session};
use russh::{Channel, ChannelId, Disconnect};
use std::time::{Instant, SystemTime};

use crate::error::TunnelError;
use crate::registry::Session as RegistrySession;

use super::handler::{ConnHandle, SshHandler};
use super::{forward, keepalive};

#[async_trait]
impl Handler for SshHandler {
    type Error = TunnelError;

    /// Bearer-token auth: the SSH username *is* the token. Folds in port
    /// allocation (see module docs for why).
    async fn auth_none(&mut self, user: &str) -> Result<Auth, Self::Error> {
        if self.handshake_slot.is_none() {
            // Gated before a handshake slot existed; fail every attempt.
            return Ok(Auth::Reject { proceed_with_methods: None });
        }

        if Instant::now().duration_since(self.accepted_at) >= self.config.handshake_timeout {
            warn!(
                "handshake deadline exceeded for {:?}, rejecting token presented as user {:?}",
                self.peer_addr, user
            );
            return Ok(Auth::Reject { proceed_with_methods: None });
        }

        let (agent_id, ok) = self.validator.validate(user).await;
        let Some(agent_id) = agent_id.filter(|_| ok) else {
            warn!("unrecognised token from {:?}", self.peer_addr);
            return Ok(Auth::Reject { proceed_with_methods: None });
        };

        match self.port_pool.acquire_or_reuse(&agent_id).await {
            Some((services, conflicts)) => {
                self.agent_id = Some(agent_id);
                self.services = services;
                self.conflicts = conflicts;
                Ok(Auth::Accept)
            }
            None => {
                warn!("port range exhausted for agent '{}'; rejecting connection", agent_id);
                Ok(Auth::Reject { proceed_with_methods: None })
            }
        }
    }

    /// Handshake complete. Fires `on_connect`, then registers the session
    /// (evicting any predecessor), then launches the per-service listeners
    /// and the keepalive loop. The handshake deadline no longer applies past
    /// this point; liveness is the keepalive loop's job now.
    async fn auth_succeeded(&mut self, session: &mut Session) -> Result<(), Self::Error> {
        // The handshake is done (successfully, or we wouldn't be here): free
        // the pending-handshake slot now, not when the session eventually
        // ends. Holding it any longer would let `max_pending` long-lived
        // tunnels starve every future handshake attempt.
        let _ = self.handshake_slot.take();

        let agent_id = self
            .agent_id
            .clone()
            .expect("auth_succeeded only follows a successful auth_none, which always sets agent_id");

        let handle = session.handle();
        self.session_handle = Some(handle.clone());

        let conn = ConnHandle {
            id: self.conn_id,
            handle: handle.clone(),
        };

        let registered = RegistrySession {
            agent_id: agent_id.clone(),
            connection: conn,
            services: self.services.clone(),
            connected_at: SystemTime::now(),
        };

        // `on_connect` runs before `register` so the hook always sees the
        // agent before anything outside this module could observe it in the
        // registry. Running the hook after registration would let a
        // registry-watching caller race ahead of the hook that's supposed to
        // announce the connection.
        info!(
            "agent '{}' connected with {} service(s), {} conflict(s)",
            agent_id,
            self.services.len(),
            self.conflicts.len()
        );
        self.hooks
            .on_connect(&agent_id, &self.services, &self.conflicts)
            .await;

        if let Some(evicted) = self.registry.register(registered).await {
            info!("evicting previous connection for agent '{}'", agent_id);
            let _ = evicted
                .handle
                .disconnect(
                    Disconnect::ByApplication,
                    "replaced by a newer connection".to_string(),
                    "en".to_string(),
                )
                .await;
        }

        for service in self.services.clone() {
            self.forward_tasks.push(forward::spawn_listener(
                handle.clone(),
                service,
                self.shutdown.clone(),
            ));
        }

        let keepalive_handle = handle.clone();
        let shutdown = self.shutdown.clone();
        let timeout_agent_id = agent_id.clone();
        self.keepalive_task = Some(keepalive::spawn(
            keepalive_handle,
            self.config.keepalive_interval,
            self.config.keepalive_timeout,
            shutdown,
            move || {
                warn!("keepalive failed for agent '{}', disconnecting", timeout_agent_id);
                let handle = handle.clone();
                tokio::spawn(async move {
                    let _ = handle
                        .disconnect(Disconnect::ByApplication, "keepalive timeout".to_string(), "en".to_string())
                        .await;
                });
            },
        ));

        Ok(())
    }

    /// The *n*-th `tcpip-forward` request binds the *n*-th service in
    /// default-service order; requests beyond the service count are
    /// rejected. The reply's assigned port is communicated back to the
    /// client by mutating `port` in place (`russh` encodes the RFC 4254
    /// global-request-reply from this value itself).
    async fn tcpip_forward(
        &mut self,
        _address: &str,
        port: &mut u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        let Some(service) = self.services.get(self.next_forward_index) else {
            warn!(
                "agent '{:?}' sent more tcpip-forward requests than it has services",
                self.agent_id
            );
            return Ok(false);
        };

        *port = service.tunnel_port as u32;
        self.next_forward_index += 1;
        Ok(true)
    }

    /// No persistence-layer interaction happens here. Updates flow through
    /// `on_connect`'s conflicts, never a direct write-back. This just stops
    /// advertising the binding was requested.
    async fn cancel_tcpip_forward(
        &mut self,
        _address: &str,
        _port: u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        Ok(true)
    }

    /// The agent must never open a channel toward us, only the reverse
    /// direction via `forwarded-tcpip`. Every inbound channel-open request
    /// is refused.
    async fn channel_open_session(
        &mut self,
        _channel: Channel<Msg>,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        warn!("rejecting inbound session channel from agent {:?}: prohibited", self.agent_id);
        Ok(false)
    }

    async fn channel_open_direct_tcpip(
        &mut self,
        _host_to_connect: &str,
        _port_to_connect: u32,
        _originator_address: &str,
        _originator_port: u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        warn!("rejecting inbound direct-tcpip channel from agent {:?}: prohibited", self.agent_id);
        Ok(false)
    }

    async fn channel_eof(&mut self, _channel: ChannelId, _session: &mut Session) -> Result<(), Self::Error> {
        Ok(())
    }
}

impl Drop for SshHandler {
    /// Per-connection cleanup: stop every background task, then, if this
    /// connection ever authenticated, unregister it (only if it's still
    /// the registered entry; see `Registry::unregister_conn`'s identity
    /// check) and fire `on_disconnect` exactly once. A connection that
    /// never got past `auth_none` never acquired an `agent_id` and triggers
    /// neither.
    fn drop(&mut self) {
        self.stop_background_tasks();

        let (Some(agent_id), Some(handle)) = (self.agent_id.take(), self.session_handle.take()) else {
            return;
        };

        let conn = ConnHandle { id: self.conn_id, handle };
        let registry = self.registry.clone();
        let hooks = self.hooks.clone();

        if let Ok(rt) = tokio::runtime::Handle::try_current() {
            rt.spawn(async move {
                registry.unregister_conn(&agent_id, &conn).await;
                hooks.on_disconnect(&agent_id).await;
            });
        }
    }
}
