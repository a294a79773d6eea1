//! VLAN driver.
//!
//! Each network owns a VLAN ID from [100, 4094]. The helper VM provides
//! the VLAN interface plus NAT and DHCP; each attached container gets a
//! matching `en0.<vlanID>` sub-interface through its network-config
//! service.

use super::ipam::{self, IpAllocator};
use super::{AttachContext, AttachOutcome, NetworkDriver, VmRegistry};
use crate::alloc::PoolAllocator;
use crate::db::{AttachmentRecord, NetworkDriverKind, NetworkRecord, StateStore};
use crate::ids::ContainerId;
use crate::net::bridge::mac_for_ip;
use crate::rpc::{NetworkConfigClient, RouterClient};
use crate::vmm::VmHandle;
use arca_shared::{ArcaError, ArcaResult};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Arc;

/// Options key carrying the persisted VLAN ID on the network record.
pub const VLAN_ID_OPTION: &str = "vlan_id";

const DEFAULT_MTU: u32 = 1500;
const PARENT_INTERFACE: &str = "en0";

pub struct VlanDriver {
    store: Arc<StateStore>,
    helper: Arc<dyn VmHandle>,
    registry: Arc<dyn VmRegistry>,
    vlan_ids: Mutex<PoolAllocator>,
    ipam: Mutex<HashMap<String, IpAllocator>>,
}

impl VlanDriver {
    pub fn new(
        store: Arc<StateStore>,
        helper: Arc<dyn VmHandle>,
        registry: Arc<dyn VmRegistry>,
    ) -> Self {
        Self {
            store,
            helper,
            registry,
            vlan_ids: Mutex::new(PoolAllocator::vlan_ids()),
            ipam: Mutex::new(HashMap::new()),
        }
    }

    fn router(&self) -> RouterClient {
        RouterClient::new(Arc::clone(&self.helper))
    }

    fn vlan_id_of(record: &NetworkRecord) -> ArcaResult<u16> {
        record
            .options
            .get(VLAN_ID_OPTION)
            .and_then(|v| v.parse().ok())
            .ok_or_else(|| {
                ArcaError::Internal(format!(
                    "vlan network {} carries no {VLAN_ID_OPTION} option",
                    record.name
                ))
            })
    }

    fn allocate_ip(
        &self,
        network: &NetworkRecord,
        requested: Option<Ipv4Addr>,
    ) -> ArcaResult<Ipv4Addr> {
        let mut ipam_map = self.ipam.lock();
        if !ipam_map.contains_key(network.id.as_str()) {
            let gateway: Ipv4Addr = network.gateway.parse().map_err(|_| {
                ArcaError::InvalidArgument(format!(
                    "network {} has invalid gateway {:?}",
                    network.name, network.gateway
                ))
            })?;
            ipam_map.insert(
                network.id.as_str().to_string(),
                IpAllocator::new(&network.subnet, gateway)?,
            );
        }
        ipam_map
            .get_mut(network.id.as_str())
            .expect("just inserted")
            .allocate(requested)
    }

    fn release_ip(&self, network: &NetworkRecord, ip: Ipv4Addr) {
        if let Some(allocator) = self.ipam.lock().get_mut(network.id.as_str()) {
            allocator.release(ip);
        }
    }
}

#[async_trait]
impl NetworkDriver for VlanDriver {
    fn kind(&self) -> NetworkDriverKind {
        NetworkDriverKind::Vlan
    }

    async fn provision_network(&self, record: &mut NetworkRecord) -> ArcaResult<()> {
        if record.subnet.is_empty() {
            let (subnet, gateway) = ipam::allocate_bridge_subnet(&self.store)?;
            record.subnet = subnet;
            record.gateway = gateway;
        }

        let vlan_id = self.vlan_ids.lock().allocate()? as u16;
        record
            .options
            .insert(VLAN_ID_OPTION.to_string(), vlan_id.to_string());

        if let Err(e) = self
            .router()
            .create_vlan_network(vlan_id, &record.subnet, &record.gateway)
            .await
        {
            self.vlan_ids.lock().release(vlan_id as u32);
            record.options.remove(VLAN_ID_OPTION);
            return Err(e);
        }

        tracing::info!(network = %record.name, vlan_id, "provisioned VLAN network");
        Ok(())
    }

    async fn unprovision_network(&self, record: &NetworkRecord) -> ArcaResult<()> {
        let vlan_id = Self::vlan_id_of(record)?;
        self.ipam.lock().remove(record.id.as_str());

        let result = self.router().delete_vlan_network(vlan_id).await;
        // The ID returns to the pool even if the helper call failed; the
        // network row is going away either way.
        self.vlan_ids.lock().release(vlan_id as u32);
        result
    }

    async fn attach_container(&self, ctx: &AttachContext<'_>) -> ArcaResult<AttachOutcome> {
        let vlan_id = Self::vlan_id_of(ctx.network)?;
        let ip = self.allocate_ip(ctx.network, ctx.requested_ip)?;
        let (_, prefix) = ipam::parse_cidr(&ctx.network.subnet)?;

        let client = NetworkConfigClient::new(Arc::clone(&ctx.vm));
        let interface = client
            .create_vlan(
                PARENT_INTERFACE,
                vlan_id,
                &format!("{ip}/{prefix}"),
                &ctx.network.gateway,
                DEFAULT_MTU,
            )
            .await;

        match interface {
            Ok(interface) => {
                tracing::debug!(
                    container = %ctx.container_id.short(),
                    interface,
                    vlan_id,
                    "created in-guest VLAN interface"
                );
                Ok(AttachOutcome {
                    ip: ip.to_string(),
                    mac: mac_for_ip(ip),
                    gateway: ctx.network.gateway.clone(),
                    subnet: ctx.network.subnet.clone(),
                })
            }
            Err(e) => {
                self.release_ip(ctx.network, ip);
                Err(e)
            }
        }
    }

    async fn detach_container(
        &self,
        container_id: &ContainerId,
        network: &NetworkRecord,
    ) -> ArcaResult<()> {
        let vlan_id = Self::vlan_id_of(network)?;

        if let Some(vm) = self.registry.vm_for(container_id) {
            let client = NetworkConfigClient::new(vm);
            let interface = format!("{PARENT_INTERFACE}.{vlan_id}");
            if let Err(e) = client.delete_vlan(&interface).await {
                tracing::warn!(
                    container = %container_id.short(),
                    interface,
                    error = %e,
                    "vlan interface delete failed; continuing cleanup"
                );
            }
        }

        // Release the persisted address back to the pool.
        if let Ok(rows) = self.store.load_network_attachments(container_id) {
            for row in rows.iter().filter(|r| r.network_id == network.id) {
                if let Ok(ip) = row.ip.parse() {
                    self.release_ip(network, ip);
                }
            }
        }
        Ok(())
    }

    async fn reconcile(
        &self,
        networks: &[NetworkRecord],
        attachments: &[AttachmentRecord],
    ) -> ArcaResult<()> {
        {
            let mut pool = self.vlan_ids.lock();
            for network in networks {
                if let Ok(vlan_id) = Self::vlan_id_of(network) {
                    pool.mark_used(vlan_id as u32);
                }
            }
        }

        for network in networks {
            let Ok(vlan_id) = Self::vlan_id_of(network) else {
                continue;
            };
            if let Err(e) = self
                .router()
                .create_vlan_network(vlan_id, &network.subnet, &network.gateway)
                .await
            {
                tracing::warn!(network = %network.name, error = %e, "vlan re-provision failed");
            }
        }

        let mut ipam_map = self.ipam.lock();
        for network in networks {
            let gateway: Ipv4Addr = match network.gateway.parse() {
                Ok(ip) => ip,
                Err(_) => continue,
            };
            let Ok(mut allocator) = IpAllocator::new(&network.subnet, gateway) else {
                continue;
            };
            for row in attachments.iter().filter(|a| a.network_id == network.id) {
                if let Ok(ip) = row.ip.parse() {
                    allocator.mark_used(ip);
                }
            }
            ipam_map.insert(network.id.as_str().to_string(), allocator);
        }

        tracing::info!(networks = networks.len(), "vlan driver reconciled");
        Ok(())
    }
}
