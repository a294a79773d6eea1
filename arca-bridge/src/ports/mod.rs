//! Port publishing.
//!
//! Each host binding gets a DNAT rule on the helper-VM firewall and, by
//! default, a userspace proxy on the host so the port answers on loopback
//! as well. Allocation keys (`<hostIp>:<hostPort>/<proto>`) guard against
//! double publishes with the stable Docker conflict message.

mod tcp;
mod udp;

pub use tcp::start_tcp_proxy;
pub use udp::start_udp_proxy;

use crate::container::config::PortBindingHost;
use crate::ids::ContainerId;
use crate::layout::BridgeConfig;
use crate::rpc::FirewallClient;
use arca_shared::{ArcaError, ArcaResult};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Transport protocol of a published port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Tcp,
    Udp,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
        }
    }
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parse a `"<containerPort>/<proto>"` binding key.
pub fn parse_binding_key(key: &str) -> ArcaResult<(u16, Protocol)> {
    let (port, proto) = key
        .split_once('/')
        .ok_or_else(|| ArcaError::InvalidArgument(format!("invalid port key {key:?}")))?;
    let port: u16 = port
        .parse()
        .map_err(|_| ArcaError::InvalidArgument(format!("invalid port in {key:?}")))?;
    let proto = match proto {
        "tcp" => Protocol::Tcp,
        "udp" => Protocol::Udp,
        other => {
            return Err(ArcaError::InvalidArgument(format!(
                "unsupported protocol {other:?} in {key:?}"
            )));
        }
    };
    Ok((port, proto))
}

/// A running proxy task. Stop cancels the accept/receive loop and closes
/// its sockets.
pub struct ProxyHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl ProxyHandle {
    pub(crate) fn new(cancel: CancellationToken, task: JoinHandle<()>) -> Self {
        Self { cancel, task }
    }

    pub async fn stop(self) {
        self.cancel.cancel();
        let _ = self.task.await;
    }
}

/// Shared context for proxy failure diagnostics.
#[derive(Clone)]
pub struct ProxyDiagnostics {
    pub firewall: Option<Arc<FirewallClient>>,
    pub dump_firewall_state: bool,
}

impl ProxyDiagnostics {
    pub(crate) async fn report(&self, context: &str, error: &str) {
        if self.dump_firewall_state {
            if let Some(firewall) = &self.firewall {
                match firewall.dump_nftables().await {
                    Ok(ruleset) => {
                        tracing::warn!(context, error, %ruleset, "proxy failure (with firewall state)");
                        return;
                    }
                    Err(e) => {
                        tracing::warn!(context, error, dump_error = %e, "proxy failure; firewall dump failed");
                        return;
                    }
                }
            }
        }
        tracing::warn!(context, error, "proxy failure");
    }
}

struct PublishedBinding {
    container_id: String,
    proto: Protocol,
    host_port: u16,
    proxy: Option<ProxyHandle>,
}

/// Owns published-port state for every container.
pub struct PortMapManager {
    config: BridgeConfig,
    firewall: Option<Arc<FirewallClient>>,
    allocations: tokio::sync::Mutex<HashMap<String, PublishedBinding>>,
}

impl PortMapManager {
    pub fn new(config: BridgeConfig, firewall: Option<Arc<FirewallClient>>) -> Self {
        Self {
            config,
            firewall,
            allocations: tokio::sync::Mutex::new(HashMap::new()),
        }
    }

    fn diagnostics(&self) -> ProxyDiagnostics {
        ProxyDiagnostics {
            firewall: self.firewall.clone(),
            dump_firewall_state: self.config.debug_firewall_dump,
        }
    }

    /// Publish every binding of a container. All-or-nothing: a failure
    /// rolls back the bindings published so far and returns the error.
    ///
    /// Proxies forward `hostIp:hostPort` to `vmnetIp:hostPort`; the
    /// firewall DNAT sends helper-routed traffic to
    /// `overlayIp:containerPort`.
    pub async fn publish_ports(
        &self,
        container_id: &ContainerId,
        bindings: &HashMap<String, Vec<PortBindingHost>>,
        overlay_ip: &str,
        vmnet_ip: &str,
    ) -> ArcaResult<Vec<String>> {
        let mut published = Vec::new();

        // Deterministic order keeps conflict errors stable.
        let mut keys: Vec<_> = bindings.keys().collect();
        keys.sort();

        for key in keys {
            let (container_port, proto) = match parse_binding_key(key) {
                Ok(parsed) => parsed,
                Err(e) => {
                    self.unpublish_ports(&published).await;
                    return Err(e);
                }
            };

            for host in &bindings[key] {
                let result = self
                    .publish_one(container_id, proto, container_port, host, overlay_ip, vmnet_ip)
                    .await;
                match result {
                    Ok(alloc_key) => published.push(alloc_key),
                    Err(e) => {
                        self.unpublish_ports(&published).await;
                        return Err(e);
                    }
                }
            }
        }

        Ok(published)
    }

    async fn publish_one(
        &self,
        container_id: &ContainerId,
        proto: Protocol,
        container_port: u16,
        host: &PortBindingHost,
        overlay_ip: &str,
        vmnet_ip: &str,
    ) -> ArcaResult<String> {
        let host_ip = if host.host_ip.is_empty() {
            "0.0.0.0".to_string()
        } else {
            host.host_ip.clone()
        };
        let host_port: u16 = host.host_port.parse().map_err(|_| {
            ArcaError::InvalidArgument(format!("invalid host port {:?}", host.host_port))
        })?;

        let alloc_key = format!("{host_ip}:{host_port}/{proto}");
        {
            let allocations = self.allocations.lock().await;
            if allocations.contains_key(&alloc_key) {
                return Err(ArcaError::PortAlreadyAllocated {
                    host_ip,
                    host_port,
                });
            }
        }

        // Proxy spawn and firewall programming proceed in parallel.
        let proxy_fut = async {
            if self.config.use_port_proxies {
                let diagnostics = self.diagnostics();
                match proto {
                    Protocol::Tcp => {
                        start_tcp_proxy(&host_ip, host_port, vmnet_ip, host_port, diagnostics)
                            .await
                            .map(Some)
                    }
                    Protocol::Udp => {
                        start_udp_proxy(&host_ip, host_port, vmnet_ip, host_port)
                            .await
                            .map(Some)
                    }
                }
            } else {
                Ok(None)
            }
        };
        let firewall_fut = async {
            match &self.firewall {
                Some(firewall) => {
                    firewall
                        .publish_port(proto.as_str(), host_port, overlay_ip, container_port)
                        .await
                }
                None => Ok(()),
            }
        };

        let (proxy, firewall_result) = tokio::join!(proxy_fut, firewall_fut);

        let proxy = match proxy {
            Ok(proxy) => proxy,
            Err(e) => {
                // The DNAT may have landed; undo it.
                if firewall_result.is_ok() {
                    if let Some(firewall) = &self.firewall {
                        if let Err(undo) =
                            firewall.unpublish_port(proto.as_str(), host_port).await
                        {
                            tracing::warn!(error = %undo, "firewall rollback failed");
                        }
                    }
                }
                return Err(e);
            }
        };
        if let Err(e) = firewall_result {
            if let Some(proxy) = proxy {
                proxy.stop().await;
            }
            return Err(e);
        }

        self.allocations.lock().await.insert(
            alloc_key.clone(),
            PublishedBinding {
                container_id: container_id.as_str().to_string(),
                proto,
                host_port,
                proxy,
            },
        );

        tracing::info!(
            container = %container_id.short(),
            binding = %alloc_key,
            container_port,
            "published port"
        );
        Ok(alloc_key)
    }

    /// Unpublish by allocation key. Runs to completion even without a
    /// firewall client (daemon shutdown) and even when single steps fail.
    pub async fn unpublish_ports(&self, keys: &[String]) {
        for key in keys {
            let binding = self.allocations.lock().await.remove(key);
            let Some(binding) = binding else { continue };

            if let Some(proxy) = binding.proxy {
                proxy.stop().await;
            }
            if let Some(firewall) = &self.firewall {
                if let Err(e) = firewall
                    .unpublish_port(binding.proto.as_str(), binding.host_port)
                    .await
                {
                    tracing::warn!(binding = %key, error = %e, "firewall unpublish failed");
                }
            }
            tracing::info!(binding = %key, "unpublished port");
        }
    }

    /// Unpublish every binding of one container.
    pub async fn unpublish_container(&self, container_id: &ContainerId) {
        let keys: Vec<String> = {
            let allocations = self.allocations.lock().await;
            allocations
                .iter()
                .filter(|(_, b)| b.container_id == container_id.as_str())
                .map(|(k, _)| k.clone())
                .collect()
        };
        self.unpublish_ports(&keys).await;
    }

    /// Allocation keys currently held by a container.
    pub async fn bindings_of(&self, container_id: &ContainerId) -> Vec<String> {
        let allocations = self.allocations.lock().await;
        allocations
            .iter()
            .filter(|(_, b)| b.container_id == container_id.as_str())
            .map(|(k, _)| k.clone())
            .collect()
    }
}
