//! Keepalive loop.
//!
//! Every `keepalive_interval`, sends a `keepalive@openssh.com` global
//! request toward the agent and waits up to `keepalive_timeout` for any
//! reply. OpenSSH answers this opaque request with the standard
//! `REQUEST_FAILURE` (that still proves liveness and must be treated as
//! success). Only a transport error or the deadline expiring closes the
//! connection.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, warn};
use russh::server::Handle;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

/// Spawn the keepalive loop for one session. `on_timeout` is invoked if a
/// probe is unanswered or the transport fails; the caller closes the
/// connection and runs the normal teardown path in response.
pub fn spawn(
    handle: Handle,
    interval: Duration,
    timeout: Duration,
    shutdown: Arc<Notify>,
    on_timeout: impl FnOnce() + Send + 'static,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown.notified() => return,
                _ = tokio::time::sleep(interval) => {}
            }

            // Server-side existence of this call isn't confirmed against the
            // pinned russh version (see DESIGN.md).
            let probe = tokio::time::timeout(timeout, handle.send_keepalive(true));
            match probe.await {
                Ok(Ok(())) => {
                    debug!("keepalive acknowledged");
                }
                Ok(Err(e)) => {
                    warn!("keepalive transport error: {:?}", e);
                    on_timeout();
                    return;
                }
                Err(_) => {
                    warn!("keepalive timed out after {:?}", timeout);
                    on_timeout();
                    return;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    // The timing discipline itself (keepalive_timeout < keepalive_interval)
    // is enforced and tested in `config.rs`, since it's a property of the
    // configuration, not of this loop.
}
