//! SSH server module: bootstrap, connection handling, forwarding, keepalive.

mod forward;
mod handler;
mod handler_impl;
mod keepalive;
mod server;

pub use handler::SshHandler;
pub use server::TunnelServer;
