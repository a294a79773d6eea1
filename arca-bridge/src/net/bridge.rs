//! Bridge driver: TAP-over-vsock relays plus helper-VM logical switches.
//!
//! Each network is one logical switch on the helper VM. Attaching a
//! container allocates a relay vsock port and an address, bootstraps the
//! in-guest TAP forwarder, wires the switch port, and starts the host
//! relay. Detach tears all of that down tolerantly: remote failures are
//! logged, local allocations always come back.

use super::ipam::{self, IpAllocator};
use super::relay::{RelayHandle, start_relay};
use super::{AttachContext, AttachOutcome, NetworkDriver, VmRegistry};
use crate::alloc::PoolAllocator;
use crate::db::{AttachmentRecord, NetworkDriverKind, NetworkRecord, StateStore};
use crate::ids::{ContainerId, NetworkId};
use crate::rpc::{RouterClient, TapForwarderClient};
use crate::vmm::{ProcessSpec, VmHandle};
use arca_shared::constants::{guest, subnet as subnet_band};
use arca_shared::{ArcaError, ArcaResult};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::net::Ipv4Addr;
use std::sync::Arc;

/// In-memory topology guarded by one lock (never held across await).
#[derive(Default)]
struct BridgeState {
    ipam: HashMap<String, IpAllocator>,
    /// eth indexes in use, per container.
    devices: HashMap<String, HashSet<u32>>,
    /// (container, network) -> (device index, vsock port, ip).
    endpoints: HashMap<(String, String), Endpoint>,
}

#[derive(Debug, Clone)]
struct Endpoint {
    device_index: u32,
    vsock_port: u32,
    ip: Ipv4Addr,
}

pub struct BridgeDriver {
    store: Arc<StateStore>,
    helper: Arc<dyn VmHandle>,
    registry: Arc<dyn VmRegistry>,
    ports: Mutex<PoolAllocator>,
    state: Mutex<BridgeState>,
    relays: tokio::sync::Mutex<HashMap<(String, String), RelayHandle>>,
}

impl BridgeDriver {
    pub fn new(
        store: Arc<StateStore>,
        helper: Arc<dyn VmHandle>,
        registry: Arc<dyn VmRegistry>,
    ) -> Self {
        Self {
            store,
            helper,
            registry,
            ports: Mutex::new(PoolAllocator::vsock_ports()),
            state: Mutex::new(BridgeState::default()),
            relays: tokio::sync::Mutex::new(HashMap::new()),
        }
    }

    fn router(&self) -> RouterClient {
        RouterClient::new(Arc::clone(&self.helper))
    }

    fn ensure_ipam<'a>(
        state: &'a mut BridgeState,
        network: &NetworkRecord,
    ) -> ArcaResult<&'a mut IpAllocator> {
        if !state.ipam.contains_key(network.id.as_str()) {
            let gateway: Ipv4Addr = network.gateway.parse().map_err(|_| {
                ArcaError::InvalidArgument(format!(
                    "network {} has invalid gateway {:?}",
                    network.name, network.gateway
                ))
            })?;
            let allocator = IpAllocator::new(&network.subnet, gateway)?;
            state.ipam.insert(network.id.as_str().to_string(), allocator);
        }
        Ok(state
            .ipam
            .get_mut(network.id.as_str())
            .expect("just inserted"))
    }

    /// Lowest unused eth index for the container, starting at 1 (eth0 is
    /// the vmnet interface configured at boot).
    fn pick_device_index(state: &mut BridgeState, container: &ContainerId) -> u32 {
        let used = state
            .devices
            .entry(container.as_str().to_string())
            .or_default();
        let mut index = 1;
        while used.contains(&index) {
            index += 1;
        }
        used.insert(index);
        index
    }

    /// Push the network's name->IP map to every member with a live VM.
    async fn push_dns_mappings(&self, network_id: &NetworkId) {
        let attachments = match self.store.load_all_network_attachments() {
            Ok(rows) => rows,
            Err(e) => {
                tracing::warn!(error = %e, "dns push skipped; attachments unavailable");
                return;
            }
        };

        let members: Vec<_> = attachments
            .iter()
            .filter(|a| &a.network_id == network_id)
            .collect();

        let mut mappings = HashMap::new();
        for member in &members {
            for alias in &member.aliases {
                mappings.insert(alias.clone(), member.ip.clone());
            }
        }

        for member in &members {
            let Some(vm) = self.registry.vm_for(&member.container_id) else {
                continue;
            };
            let client = TapForwarderClient::new(vm);
            if let Err(e) = client.update_dns_mappings(mappings.clone()).await {
                tracing::warn!(
                    container = %member.container_id.short(),
                    error = %e,
                    "dns mapping push failed"
                );
            }
        }
    }

    async fn stop_relay(&self, key: &(String, String)) {
        if let Some(relay) = self.relays.lock().await.remove(key) {
            relay.stop().await;
        }
    }

    fn release_endpoint(&self, key: &(String, String)) -> Option<Endpoint> {
        let mut state = self.state.lock();
        let endpoint = state.endpoints.remove(key)?;
        if let Some(devices) = state.devices.get_mut(&key.0) {
            devices.remove(&endpoint.device_index);
        }
        if let Some(allocator) = state.ipam.get_mut(&key.1) {
            allocator.release(endpoint.ip);
        }
        self.ports.lock().release(endpoint.vsock_port);
        Some(endpoint)
    }
}

/// Docker-style MAC derived from the IPv4 address: `02:42` + 4 IP octets.
pub fn mac_for_ip(ip: Ipv4Addr) -> String {
    let o = ip.octets();
    format!("02:42:{:02x}:{:02x}:{:02x}:{:02x}", o[0], o[1], o[2], o[3])
}

#[async_trait]
impl NetworkDriver for BridgeDriver {
    fn kind(&self) -> NetworkDriverKind {
        NetworkDriverKind::Bridge
    }

    async fn provision_network(&self, record: &mut NetworkRecord) -> ArcaResult<()> {
        if record.subnet.is_empty() {
            let (subnet, gateway) = ipam::allocate_bridge_subnet(&self.store)?;
            record.subnet = subnet;
            record.gateway = gateway;
        } else if record.gateway.is_empty() {
            let (network, _) = ipam::parse_cidr(&record.subnet)?;
            let octets = network.octets();
            record.gateway =
                Ipv4Addr::new(octets[0], octets[1], octets[2], octets[3] + 1).to_string();
        }

        self.router()
            .create_switch(record.id.as_str(), &record.subnet, &record.gateway)
            .await
    }

    async fn unprovision_network(&self, record: &NetworkRecord) -> ArcaResult<()> {
        self.state.lock().ipam.remove(record.id.as_str());
        self.router().delete_switch(record.id.as_str()).await
    }

    async fn attach_container(&self, ctx: &AttachContext<'_>) -> ArcaResult<AttachOutcome> {
        let key = (
            ctx.container_id.as_str().to_string(),
            ctx.network.id.as_str().to_string(),
        );

        // Step 1: allocations under the topology lock.
        let endpoint = {
            let mut state = self.state.lock();
            let allocator = Self::ensure_ipam(&mut state, ctx.network)?;
            let ip = allocator.allocate(ctx.requested_ip)?;
            let vsock_port = match self.ports.lock().allocate() {
                Ok(port) => port,
                Err(e) => {
                    if let Some(allocator) = state.ipam.get_mut(ctx.network.id.as_str()) {
                        allocator.release(ip);
                    }
                    return Err(e);
                }
            };
            let device_index = Self::pick_device_index(&mut state, ctx.container_id);
            let endpoint = Endpoint {
                device_index,
                vsock_port,
                ip,
            };
            state.endpoints.insert(key.clone(), endpoint.clone());
            endpoint
        };

        let device = format!("eth{}", endpoint.device_index);
        let mac = mac_for_ip(endpoint.ip);
        let (_, prefix) = ipam::parse_cidr(&ctx.network.subnet)?;

        let result: ArcaResult<()> = async {
            let client = TapForwarderClient::new(Arc::clone(&ctx.vm));

            // Steps 2-3: bootstrap the forwarder daemon if it is not up
            // yet. The control dial itself retries with backoff.
            if !client.is_running().await {
                tracing::debug!(
                    container = %ctx.container_id.short(),
                    "launching in-guest tap forwarder"
                );
                let (process, _stdio) = ctx
                    .vm
                    .spawn(ProcessSpec {
                        argv: vec![guest::TAP_FORWARDER_BIN.to_string()],
                        daemon: true,
                        ..Default::default()
                    })
                    .await?;
                drop(process);
            }

            // Step 4: program the guest interface.
            client
                .attach_network(crate::rpc::TapAttachArgs {
                    device: device.clone(),
                    vsock_port: endpoint.vsock_port,
                    ip: endpoint.ip.to_string(),
                    gateway: ctx.network.gateway.clone(),
                    netmask: ipam::netmask(prefix).to_string(),
                    mac: mac.clone(),
                })
                .await?;

            // Step 5: wire the switch port; the helper echoes (or assigns)
            // the address.
            let effective_ip = self
                .router()
                .attach_container(
                    ctx.network.id.as_str(),
                    ctx.container_id.as_str(),
                    &endpoint.ip.to_string(),
                    &mac,
                )
                .await;
            if let Err(e) = effective_ip {
                // Roll the guest interface back before bailing.
                if let Err(undo) = client.detach_network(&device).await {
                    tracing::warn!(error = %undo, "tap rollback failed");
                }
                return Err(e);
            }

            // Step 6: start the host relay.
            let relay = start_relay(
                Arc::clone(&ctx.vm),
                Arc::clone(&self.helper),
                endpoint.vsock_port,
            )
            .await;
            match relay {
                Ok(handle) => {
                    self.relays.lock().await.insert(key.clone(), handle);
                    Ok(())
                }
                Err(e) => {
                    if let Err(undo) = client.detach_network(&device).await {
                        tracing::warn!(error = %undo, "tap rollback failed");
                    }
                    if let Err(undo) = self
                        .router()
                        .detach_container(ctx.network.id.as_str(), ctx.container_id.as_str())
                        .await
                    {
                        tracing::warn!(error = %undo, "switch rollback failed");
                    }
                    Err(e)
                }
            }
        }
        .await;

        if let Err(e) = result {
            self.release_endpoint(&key);
            return Err(e);
        }

        // DNS map refresh happens after the row is persisted by the
        // manager, but members present before this attach learn the new
        // name here as well on the next attach/detach. Push what we have.
        self.push_dns_mappings(&ctx.network.id).await;

        Ok(AttachOutcome {
            ip: endpoint.ip.to_string(),
            mac,
            gateway: ctx.network.gateway.clone(),
            subnet: ctx.network.subnet.clone(),
        })
    }

    async fn detach_container(
        &self,
        container_id: &ContainerId,
        network: &NetworkRecord,
    ) -> ArcaResult<()> {
        let key = (
            container_id.as_str().to_string(),
            network.id.as_str().to_string(),
        );

        let device = self
            .state
            .lock()
            .endpoints
            .get(&key)
            .map(|e| format!("eth{}", e.device_index));

        // Guest-side detach, when the VM is still reachable.
        if let (Some(device), Some(vm)) = (device, self.registry.vm_for(container_id)) {
            let client = TapForwarderClient::new(vm);
            if let Err(e) = client.detach_network(&device).await {
                tracing::warn!(
                    container = %container_id.short(),
                    error = %e,
                    "tap detach failed; continuing cleanup"
                );
            }
        }

        self.stop_relay(&key).await;

        if let Err(e) = self
            .router()
            .detach_container(network.id.as_str(), container_id.as_str())
            .await
        {
            tracing::warn!(
                container = %container_id.short(),
                error = %e,
                "switch detach failed; continuing cleanup"
            );
        }

        self.release_endpoint(&key);
        self.push_dns_mappings(&network.id).await;
        Ok(())
    }

    async fn reconcile(
        &self,
        networks: &[NetworkRecord],
        attachments: &[AttachmentRecord],
    ) -> ArcaResult<()> {
        // Re-create switches; the helper treats creation as idempotent.
        for network in networks {
            if let Err(e) = self
                .router()
                .create_switch(network.id.as_str(), &network.subnet, &network.gateway)
                .await
            {
                tracing::warn!(network = %network.name, error = %e, "switch re-create failed");
            }
        }

        // Rebuild IPAM and device maps from persisted rows.
        {
            let mut state = self.state.lock();
            for network in networks {
                if let Err(e) = Self::ensure_ipam(&mut state, network) {
                    tracing::warn!(network = %network.name, error = %e, "ipam rebuild failed");
                }
            }

            let mut per_container: HashMap<String, Vec<&AttachmentRecord>> = HashMap::new();
            for attachment in attachments {
                per_container
                    .entry(attachment.container_id.as_str().to_string())
                    .or_default()
                    .push(attachment);
            }

            for (container, mut rows) in per_container {
                rows.sort_by_key(|a| a.attached_at);
                for (i, row) in rows.iter().enumerate() {
                    let index = (i + 1) as u32;
                    if let Ok(ip) = row.ip.parse::<Ipv4Addr>() {
                        if let Some(allocator) = state.ipam.get_mut(row.network_id.as_str()) {
                            allocator.mark_used(ip);
                        }
                        state
                            .devices
                            .entry(container.clone())
                            .or_default()
                            .insert(index);
                        state.endpoints.insert(
                            (container.clone(), row.network_id.as_str().to_string()),
                            Endpoint {
                                device_index: index,
                                // Relay ports are allocated fresh when the
                                // container next starts.
                                vsock_port: 0,
                                ip,
                            },
                        );
                    }
                }
            }
        }

        // Advance the subnet cursor past every observed 172.X.0.0/16.
        let mut highest = None;
        for network in networks {
            if let Some(rest) = network.subnet.strip_prefix("172.") {
                if let Some((byte, _)) = rest.split_once('.') {
                    if let Ok(byte) = byte.parse::<u8>() {
                        if (subnet_band::FIRST_BYTE..=subnet_band::LAST_BYTE).contains(&byte) {
                            highest = Some(highest.map_or(byte, |h: u8| h.max(byte)));
                        }
                    }
                }
            }
        }
        if let Some(byte) = highest {
            let next = (byte + 1).min(subnet_band::LAST_BYTE);
            let current = self.store.next_subnet_byte()?;
            if next > current {
                self.store.set_next_subnet_byte(next)?;
            }
        }

        tracing::info!(
            networks = networks.len(),
            attachments = attachments.len(),
            "bridge driver reconciled"
        );
        Ok(())
    }
}
