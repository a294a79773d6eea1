//! Helper-VM router client (vsock 50052).
//!
//! Control plane for the bridge driver's logical switches and the VLAN
//! driver's NAT/DHCP provisioning.

use super::{call, check_envelope};
use crate::vmm::VmHandle;
use arca_shared::constants::vsock;
use arca_shared::wire::{RouterRequest, RouterResponse};
use arca_shared::{ArcaError, ArcaResult};
use std::sync::Arc;

pub struct RouterClient {
    helper: Arc<dyn VmHandle>,
}

impl RouterClient {
    pub fn new(helper: Arc<dyn VmHandle>) -> Self {
        Self { helper }
    }

    /// Create the logical switch for a bridge network. Idempotent on the
    /// helper side, so reconciliation can replay it.
    pub async fn create_switch(
        &self,
        network_id: &str,
        subnet: &str,
        gateway: &str,
    ) -> ArcaResult<()> {
        let resp: RouterResponse = call(
            &self.helper,
            vsock::ROUTER_PORT,
            &RouterRequest::CreateSwitch {
                network_id: network_id.to_string(),
                subnet: subnet.to_string(),
                gateway: gateway.to_string(),
            },
        )
        .await?;
        check_envelope(resp.success, resp.error, "CreateSwitch")
    }

    pub async fn delete_switch(&self, network_id: &str) -> ArcaResult<()> {
        let resp: RouterResponse = call(
            &self.helper,
            vsock::ROUTER_PORT,
            &RouterRequest::DeleteSwitch {
                network_id: network_id.to_string(),
            },
        )
        .await?;
        check_envelope(resp.success, resp.error, "DeleteSwitch")
    }

    /// Attach a container port to a switch. An empty `ip` requests a
    /// helper-assigned address; the effective address is returned either
    /// way.
    pub async fn attach_container(
        &self,
        network_id: &str,
        container_id: &str,
        ip: &str,
        mac: &str,
    ) -> ArcaResult<String> {
        let resp: RouterResponse = call(
            &self.helper,
            vsock::ROUTER_PORT,
            &RouterRequest::AttachContainer {
                network_id: network_id.to_string(),
                container_id: container_id.to_string(),
                ip: ip.to_string(),
                mac: mac.to_string(),
            },
        )
        .await?;
        check_envelope(resp.success, resp.error.clone(), "AttachContainer")?;
        let effective = resp.ip.unwrap_or_else(|| ip.to_string());
        if effective.is_empty() {
            return Err(ArcaError::Remote(
                "AttachContainer returned no address".into(),
            ));
        }
        Ok(effective)
    }

    pub async fn detach_container(&self, network_id: &str, container_id: &str) -> ArcaResult<()> {
        let resp: RouterResponse = call(
            &self.helper,
            vsock::ROUTER_PORT,
            &RouterRequest::DetachContainer {
                network_id: network_id.to_string(),
                container_id: container_id.to_string(),
            },
        )
        .await?;
        check_envelope(resp.success, resp.error, "DetachContainer")
    }

    pub async fn create_vlan_network(
        &self,
        vlan_id: u16,
        subnet: &str,
        gateway: &str,
    ) -> ArcaResult<()> {
        let resp: RouterResponse = call(
            &self.helper,
            vsock::ROUTER_PORT,
            &RouterRequest::CreateVlanNetwork {
                vlan_id,
                subnet: subnet.to_string(),
                gateway: gateway.to_string(),
            },
        )
        .await?;
        check_envelope(resp.success, resp.error, "CreateVlanNetwork")
    }

    pub async fn delete_vlan_network(&self, vlan_id: u16) -> ArcaResult<()> {
        let resp: RouterResponse = call(
            &self.helper,
            vsock::ROUTER_PORT,
            &RouterRequest::DeleteVlanNetwork { vlan_id },
        )
        .await?;
        check_envelope(resp.success, resp.error, "DeleteVlanNetwork")
    }
}
