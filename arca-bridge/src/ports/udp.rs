//! Userspace UDP proxy.
//!
//! Datagram relay with a short-lived association table keyed by client
//! address, so replies from the container find their way back to the
//! right peer. Idle associations expire after 60 seconds.

use super::ProxyHandle;
use arca_shared::{ArcaError, ArcaResult};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;

const ASSOCIATION_TTL: Duration = Duration::from_secs(60);
const MAX_DATAGRAM: usize = 64 * 1024;

struct Association {
    upstream: Arc<UdpSocket>,
    last_used: Instant,
    reply_task: tokio::task::JoinHandle<()>,
}

pub async fn start_udp_proxy(
    listen_ip: &str,
    listen_port: u16,
    upstream_ip: &str,
    upstream_port: u16,
) -> ArcaResult<ProxyHandle> {
    let listen_addr = format!("{listen_ip}:{listen_port}");
    let socket = UdpSocket::bind(&listen_addr)
        .await
        .map_err(|e| ArcaError::Dependency(format!("bind {listen_addr} failed: {e}")))?;
    let socket = Arc::new(socket);
    let upstream_addr = format!("{upstream_ip}:{upstream_port}");

    let cancel = CancellationToken::new();
    let task = tokio::spawn(relay_loop(socket, upstream_addr, cancel.clone()));

    tracing::debug!(%listen_addr, upstream_port, "udp proxy listening");
    Ok(ProxyHandle::new(cancel, task))
}

async fn relay_loop(socket: Arc<UdpSocket>, upstream_addr: String, cancel: CancellationToken) {
    let mut associations: HashMap<SocketAddr, Association> = HashMap::new();
    let mut buf = vec![0u8; MAX_DATAGRAM];
    let mut sweep = tokio::time::interval(ASSOCIATION_TTL / 2);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = sweep.tick() => {
                associations.retain(|peer, assoc| {
                    let keep = assoc.last_used.elapsed() < ASSOCIATION_TTL;
                    if !keep {
                        tracing::trace!(%peer, "udp association expired");
                        assoc.reply_task.abort();
                    }
                    keep
                });
            }
            received = socket.recv_from(&mut buf) => {
                let (len, peer) = match received {
                    Ok(ok) => ok,
                    Err(e) => {
                        tracing::warn!(error = %e, "udp proxy receive failed");
                        continue;
                    }
                };

                if !associations.contains_key(&peer) {
                    match open_association(&socket, &upstream_addr, peer, &cancel).await {
                        Ok(assoc) => {
                            associations.insert(peer, assoc);
                        }
                        Err(e) => {
                            tracing::warn!(%peer, error = %e, "udp association failed");
                            continue;
                        }
                    }
                }

                let assoc = associations.get_mut(&peer).expect("association just ensured");
                assoc.last_used = Instant::now();
                if let Err(e) = assoc.upstream.send(&buf[..len]).await {
                    tracing::debug!(%peer, error = %e, "udp forward failed");
                }
            }
        }
    }

    for (_, assoc) in associations {
        assoc.reply_task.abort();
    }
}

/// Bind a per-peer upstream socket and start the reply pump that routes
/// answers back to the originating client address.
async fn open_association(
    listen_socket: &Arc<UdpSocket>,
    upstream_addr: &str,
    peer: SocketAddr,
    cancel: &CancellationToken,
) -> ArcaResult<Association> {
    let upstream = UdpSocket::bind("0.0.0.0:0")
        .await
        .map_err(|e| ArcaError::Dependency(format!("upstream bind failed: {e}")))?;
    upstream
        .connect(upstream_addr)
        .await
        .map_err(|e| ArcaError::Dependency(format!("connect {upstream_addr} failed: {e}")))?;
    let upstream = Arc::new(upstream);

    let reply_task = {
        let upstream = Arc::clone(&upstream);
        let listen_socket = Arc::clone(listen_socket);
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let mut buf = vec![0u8; MAX_DATAGRAM];
            loop {
                let received = tokio::select! {
                    _ = cancel.cancelled() => return,
                    received = upstream.recv(&mut buf) => received,
                };
                match received {
                    Ok(len) => {
                        if listen_socket.send_to(&buf[..len], peer).await.is_err() {
                            return;
                        }
                    }
                    Err(_) => return,
                }
            }
        })
    };

    tracing::trace!(%peer, "udp association opened");
    Ok(Association {
        upstream,
        last_used: Instant::now(),
        reply_task,
    })
}
