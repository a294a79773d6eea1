//! Userspace TCP proxy.
//!
//! Listens on the host binding and forwards every connection to the
//! container VM's vmnet address. Bytes that arrive while the upstream
//! connect is still in flight are buffered and flushed once it completes.

use super::{ProxyDiagnostics, ProxyHandle};
use arca_shared::{ArcaError, ArcaResult};
use std::net::SocketAddr;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio_util::sync::CancellationToken;

pub async fn start_tcp_proxy(
    listen_ip: &str,
    listen_port: u16,
    upstream_ip: &str,
    upstream_port: u16,
    diagnostics: ProxyDiagnostics,
) -> ArcaResult<ProxyHandle> {
    let listen_addr: SocketAddr = format!("{listen_ip}:{listen_port}")
        .parse()
        .map_err(|_| ArcaError::InvalidArgument(format!("invalid listen address {listen_ip}")))?;

    let socket = match listen_addr {
        SocketAddr::V4(_) => TcpSocket::new_v4(),
        SocketAddr::V6(_) => TcpSocket::new_v6(),
    }
    .map_err(|e| ArcaError::Dependency(format!("socket creation failed: {e}")))?;
    socket
        .set_reuseaddr(true)
        .map_err(|e| ArcaError::Dependency(format!("SO_REUSEADDR failed: {e}")))?;
    socket.bind(listen_addr).map_err(|e| {
        ArcaError::Dependency(format!("bind {listen_addr} failed: {e}"))
    })?;
    let listener = socket
        .listen(1024)
        .map_err(|e| ArcaError::Dependency(format!("listen on {listen_addr} failed: {e}")))?;

    let upstream = format!("{upstream_ip}:{upstream_port}");
    let cancel = CancellationToken::new();
    let task = tokio::spawn(accept_loop(
        listener,
        upstream,
        diagnostics,
        cancel.clone(),
    ));

    tracing::debug!(%listen_addr, upstream_port, "tcp proxy listening");
    Ok(ProxyHandle::new(cancel, task))
}

async fn accept_loop(
    listener: TcpListener,
    upstream: String,
    diagnostics: ProxyDiagnostics,
    cancel: CancellationToken,
) {
    loop {
        let accepted = tokio::select! {
            _ = cancel.cancelled() => return,
            accepted = listener.accept() => accepted,
        };
        match accepted {
            Ok((client, peer)) => {
                let upstream = upstream.clone();
                let diagnostics = diagnostics.clone();
                let cancel = cancel.clone();
                tokio::spawn(async move {
                    tokio::select! {
                        _ = cancel.cancelled() => {}
                        _ = relay_connection(client, peer, upstream, diagnostics) => {}
                    }
                });
            }
            Err(e) => {
                tracing::warn!(error = %e, "tcp proxy accept failed");
                tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            }
        }
    }
}

async fn relay_connection(
    mut client: TcpStream,
    peer: SocketAddr,
    upstream_addr: String,
    diagnostics: ProxyDiagnostics,
) {
    // Connect upstream while draining early client bytes into a buffer.
    let connect = TcpStream::connect(&upstream_addr);
    tokio::pin!(connect);

    let mut pending: Vec<u8> = Vec::new();
    let mut buf = vec![0u8; 16 * 1024];
    let mut client_closed = false;

    let mut upstream = loop {
        tokio::select! {
            connected = &mut connect => {
                match connected {
                    Ok(stream) => break stream,
                    Err(e) => {
                        diagnostics
                            .report(
                                &format!("connect {upstream_addr} for {peer}"),
                                &e.to_string(),
                            )
                            .await;
                        return;
                    }
                }
            }
            read = client.read(&mut buf), if !client_closed => {
                match read {
                    Ok(0) => client_closed = true,
                    Ok(n) => pending.extend_from_slice(&buf[..n]),
                    Err(_) => return,
                }
            }
        }
    };

    if !pending.is_empty() {
        use tokio::io::AsyncWriteExt;
        if upstream.write_all(&pending).await.is_err() {
            return;
        }
    }
    if client_closed {
        return;
    }

    // Either side closing tears both down.
    if let Err(e) = tokio::io::copy_bidirectional(&mut client, &mut upstream).await {
        tracing::debug!(peer = %peer, error = %e, "tcp proxy connection ended");
    }
}
