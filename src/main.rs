//! Reverse-SSH Tunnel Server
//!
//! Agents reach us with:
//! ```bash
//! ssh -N -R 0:localhost:22 -R 0:localhost:80 <token>@host -p 2222
//! ```
//! This binary wires the tunnel core to a pair of trivial in-memory
//! stand-ins for the external adapters (`TokenValidator`, `SessionHooks`,
//! the startup `PortRecord` list) so it runs standalone. Real deployments
//! replace those stand-ins with adapters backed by the record store and
//! audit log (this binary does not implement them).

use std::sync::Arc;

use async_trait::async_trait;
use log::info;
use russh::server::Server as _;
use tokio::sync::RwLock;

use tunnel_relay::adapters::{ConflictResolution, PortRecord, Service, SessionHooks, TokenValidator};
use tunnel_relay::config::Config;
use tunnel_relay::portpool::PortPool;
use tunnel_relay::{hostkey, TunnelServer};

/// Accepts any non-empty token as its own agent id. Good enough to drive
/// the binary manually; a real deployment validates against the external
/// token store instead.
struct DevTokenValidator;

#[async_trait]
impl TokenValidator for DevTokenValidator {
    async fn validate(&self, token: &str) -> (Option<String>, bool) {
        if token.is_empty() {
            (None, false)
        } else {
            (Some(token.to_string()), true)
        }
    }
}

/// Logs connect/disconnect events in place of the audit log and
/// persistence layer this binary doesn't implement.
struct LoggingHooks {
    conflicts_seen: RwLock<Vec<ConflictResolution>>,
}

impl LoggingHooks {
    fn new() -> Self {
        Self {
            conflicts_seen: RwLock::new(Vec::new()),
        }
    }
}

#[async_trait]
impl SessionHooks for LoggingHooks {
    async fn on_connect(&self, agent_id: &str, services: &[Service], conflicts: &[ConflictResolution]) {
        info!("agent '{}' connected: {:?}", agent_id, services);
        if !conflicts.is_empty() {
            self.conflicts_seen.write().await.extend_from_slice(conflicts);
            for conflict in conflicts {
                info!(
                    "conflict resolved for agent '{}': service '{}' moved {} -> {}",
                    agent_id, conflict.service_name, conflict.old_port, conflict.new_port
                );
            }
        }
    }

    async fn on_disconnect(&self, agent_id: &str) {
        info!("agent '{}' disconnected", agent_id);
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    info!("starting reverse-SSH tunnel server...");

    let config = Config::from_env();
    let host_key = hostkey::load_or_generate(&config.data_dir)?;
    info!("host key loaded from {}", config.data_dir.display());

    let port_pool = Arc::new(PortPool::new(config.port_range.clone(), config.default_services.clone()));
    // In a real deployment this is the persisted `PortRecord` list supplied
    // by the record store at startup.
    let existing_records: Vec<PortRecord> = Vec::new();
    port_pool.load_existing(existing_records).await;

    let validator: Arc<dyn TokenValidator> = Arc::new(DevTokenValidator);
    let hooks: Arc<dyn SessionHooks> = Arc::new(LoggingHooks::new());

    let server_config = russh::server::Config {
        methods: russh::MethodSet::NONE,
        server_id: russh::SshId::Standard("SSH-2.0-tunnel-relay-0.1.0".to_string()),
        keys: vec![host_key],
        auth_rejection_time: config.handshake_timeout,
        auth_rejection_time_initial: Some(std::time::Duration::from_secs(0)),
        ..Default::default()
    };
    let server_config = Arc::new(server_config);

    let listen_addr = normalize_listen_addr(&config.listen_addr);
    let mut server = TunnelServer::new(Arc::new(config), port_pool, validator, hooks);

    info!("listening on {}", listen_addr);
    server.run_on_address(server_config, listen_addr).await?;

    Ok(())
}

/// The default `listen_addr` is the Go-style `:2222` (all interfaces,
/// implicit host). `ToSocketAddrs` needs an explicit host, so a bare
/// `:<port>` is expanded to `0.0.0.0:<port>`.
fn normalize_listen_addr(listen_addr: &str) -> String {
    if let Some(port) = listen_addr.strip_prefix(':') {
        format!("0.0.0.0:{port}")
    } else {
        listen_addr.to_string()
    }
}
