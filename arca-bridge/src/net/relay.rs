//! Per-attachment packet relay.
//!
//! Ethernet frames flow between the container's vsock (port P) and the
//! helper VM's vsock (port P + 10000) through two unidirectional
//! forwarders. Each forwarder owns its direction: read up to 64 KiB,
//! write exactly that many bytes, repeat. A short write means the
//! connection is gone. When either direction ends, the whole relay is
//! cancelled.

use crate::vmm::{VmHandle, VsockStream};
use arca_shared::constants::vsock;
use arca_shared::{ArcaError, ArcaResult};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const RELAY_BUF_LEN: usize = 64 * 1024;

/// A running relay. Dropping the handle does not stop the tasks; call
/// [`RelayHandle::stop`].
#[derive(Debug)]
pub struct RelayHandle {
    pub container_port: u32,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl RelayHandle {
    /// Cancel both forwarders and wait for them to close their ends.
    pub async fn stop(mut self) {
        self.cancel.cancel();
        for task in self.tasks.drain(..) {
            let _ = task.await;
        }
    }
}

/// Dial both ends and start the two forwarders.
///
/// The helper side listens at `container_port + 10000`.
pub async fn start_relay(
    container_vm: Arc<dyn VmHandle>,
    helper_vm: Arc<dyn VmHandle>,
    container_port: u32,
) -> ArcaResult<RelayHandle> {
    let helper_port = container_port + vsock::HELPER_PORT_OFFSET;

    let container_stream = crate::rpc::dial_with_backoff(&container_vm, container_port).await?;
    let helper_stream = crate::rpc::dial_with_backoff(&helper_vm, helper_port).await?;

    let (container_read, container_write) = tokio::io::split(container_stream);
    let (helper_read, helper_write) = tokio::io::split(helper_stream);

    let cancel = CancellationToken::new();
    let tasks = vec![
        spawn_forwarder(
            "container->helper",
            container_port,
            container_read,
            helper_write,
            cancel.clone(),
        ),
        spawn_forwarder(
            "helper->container",
            container_port,
            helper_read,
            container_write,
            cancel.clone(),
        ),
    ];

    tracing::debug!(container_port, helper_port, "relay started");
    Ok(RelayHandle {
        container_port,
        cancel,
        tasks,
    })
}

fn spawn_forwarder(
    direction: &'static str,
    port: u32,
    mut source: ReadHalf<Box<dyn VsockStream>>,
    mut dest: WriteHalf<Box<dyn VsockStream>>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let result = forward(&mut source, &mut dest, &cancel).await;
        match &result {
            Ok(()) => tracing::debug!(direction, port, "relay direction finished"),
            Err(e) => tracing::debug!(direction, port, error = %e, "relay direction failed"),
        }
        // One dead direction takes the other down with it.
        cancel.cancel();
        let _ = dest.shutdown().await;
    })
}

async fn forward(
    source: &mut ReadHalf<Box<dyn VsockStream>>,
    dest: &mut WriteHalf<Box<dyn VsockStream>>,
    cancel: &CancellationToken,
) -> ArcaResult<()> {
    let mut buf = vec![0u8; RELAY_BUF_LEN];
    loop {
        let n = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            read = source.read(&mut buf) => read
                .map_err(|e| ArcaError::Remote(format!("relay read failed: {e}")))?,
        };
        if n == 0 {
            return Ok(());
        }

        let mut written = 0;
        while written < n {
            let w = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                write = dest.write(&buf[written..n]) => write
                    .map_err(|e| ArcaError::Remote(format!("relay write failed: {e}")))?,
            };
            if w == 0 {
                // A zero-length write is a closed peer; the frame cannot be
                // delivered partially.
                return Err(ArcaError::Remote(
                    "relay destination closed mid-frame".into(),
                ));
            }
            written += w;
        }
    }
}
