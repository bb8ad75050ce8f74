//! Error types for the tunnel core.

/// Errors that can arise while serving a single SSH connection or while
/// performing the startup-only operations (host key, config validation).
#[derive(Debug, thiserror::Error)]
pub enum TunnelError {
    /// No more ports available in the configured range.
    #[error("port range exhausted")]
    PortRangeExhausted,

    /// The on-disk host key could not be read or written.
    #[error("host key I/O error: {0}")]
    HostKey(#[from] std::io::Error),

    /// The on-disk host key file did not contain a valid OpenSSH key.
    #[error("host key format error: {0}")]
    HostKeyFormat(russh_keys::Error),

    /// Underlying SSH protocol error.
    #[error("SSH protocol error: {0}")]
    Ssh(#[from] russh::Error),

    /// Key exchange plus authentication did not complete within the deadline.
    #[error("handshake timed out")]
    HandshakeTimeout,

    /// A keepalive probe was not answered within its deadline, or the
    /// transport failed while sending one.
    #[error("keepalive timed out")]
    KeepaliveTimeout,
}
