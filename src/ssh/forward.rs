//! Forwarding plane.
//!
//! For each assigned service, binds `127.0.0.1:tunnel_port` and relays every
//! accepted TCP connection through a `forwarded-tcpip` SSH channel via
//! genuine bidirectional copy (not the one-shot request/response framing an
//! HTTP-only proxy would use).

use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use russh::server::Handle;
use tokio::net::TcpListener;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::adapters::Service;

const BIND_RETRY_ATTEMPTS: u32 = 5;
const BIND_RETRY_BASE_DELAY: Duration = Duration::from_millis(25);

/// Spawn the listener task for one service. Binding is retried with
/// linearly increasing delay to survive an evicted predecessor still
/// holding the port for a few OS ticks; persistent failure disables just
/// this service without killing the session.
pub fn spawn_listener(handle: Handle, service: Service, shutdown: Arc<Notify>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let listener = match bind_with_retry(service.tunnel_port).await {
            Some(listener) => listener,
            None => {
                warn!(
                    "giving up binding 127.0.0.1:{} for service '{}' after {} attempts",
                    service.tunnel_port, service.name, BIND_RETRY_ATTEMPTS
                );
                return;
            }
        };

        info!(
            "forwarding 127.0.0.1:{} -> agent service '{}'",
            service.tunnel_port, service.name
        );

        let mut in_flight = Vec::new();

        loop {
            tokio::select! {
                _ = shutdown.notified() => break,
                accepted = listener.accept() => {
                    match accepted {
                        Ok((tcp_stream, origin)) => {
                            let handle = handle.clone();
                            let service = service.clone();
                            in_flight.push(tokio::spawn(async move {
                                relay_one_connection(handle, service, tcp_stream, origin).await;
                            }));
                        }
                        Err(e) => {
                            debug!("accept error on tunnel port {}: {}", service.tunnel_port, e);
                        }
                    }
                }
            }
        }

        // Don't return until every in-flight transfer has drained, so
        // nothing reads against a closed fd after session teardown.
        for task in in_flight {
            let _ = task.await;
        }
    })
}

async fn bind_with_retry(port: u16) -> Option<TcpListener> {
    for attempt in 0..BIND_RETRY_ATTEMPTS {
        match TcpListener::bind(("127.0.0.1", port)).await {
            Ok(listener) => return Some(listener),
            Err(e) => {
                debug!("bind attempt {} for port {} failed: {}", attempt + 1, port, e);
                tokio::time::sleep(BIND_RETRY_BASE_DELAY * (attempt + 1)).await;
            }
        }
    }
    None
}

async fn relay_one_connection(
    handle: Handle,
    service: Service,
    mut tcp_stream: tokio::net::TcpStream,
    origin: std::net::SocketAddr,
) {
    let channel = match handle
        .channel_open_forwarded_tcpip(
            "127.0.0.1",
            service.tunnel_port as u32,
            &origin.ip().to_string(),
            origin.port() as u32,
        )
        .await
    {
        Ok(channel) => channel,
        Err(e) => {
            warn!(
                "failed to open forwarded-tcpip channel for service '{}': {}",
                service.name, e
            );
            return;
        }
    };

    let mut ssh_stream = channel.into_stream();
    if let Err(e) = tokio::io::copy_bidirectional(&mut tcp_stream, &mut ssh_stream).await {
        debug!("forwarding error on service '{}': {}", service.name, e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn bind_with_retry_succeeds_on_a_free_port() {
        // Bind once to learn a free port, release it, then exercise the
        // retry path against the now-free port.
        let probe = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let port = probe.local_addr().unwrap().port();
        drop(probe);

        let listener = bind_with_retry(port).await;
        assert!(listener.is_some());
    }

    #[tokio::test]
    async fn bind_with_retry_gives_up_on_a_held_port() {
        let held = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let port = held.local_addr().unwrap().port();

        let listener = bind_with_retry(port).await;
        assert!(listener.is_none());
        drop(held);
    }
}
