//! Reverse-SSH tunnel server core.
//!
//! Remote agents open an outbound SSH connection to this server; once
//! authenticated they're assigned a stable pair of loopback ports and every
//! byte accepted on those ports is relayed back to the agent over its SSH
//! channel.
//!
//! This crate only implements the tunnel subsystem itself. The record
//! store, audit log, HTTP/REST admin surface and the rest of the
//! surrounding platform are external collaborators reached through the
//! traits in [`adapters`].

pub mod adapters;
pub mod config;
pub mod error;
pub mod gate;
pub mod hostkey;
pub mod portpool;
pub mod registry;
pub mod ssh;
pub mod token;

pub use config::Config;
pub use error::TunnelError;
pub use ssh::{SshHandler, TunnelServer};
