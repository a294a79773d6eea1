//! Network-config service client (vsock 50051, per container).
//!
//! Used by the VLAN driver to build `en0.<vlanID>` interfaces inside each
//! container.

use super::{call, check_envelope};
use crate::vmm::VmHandle;
use arca_shared::constants::vsock;
use arca_shared::wire::{NetConfigRequest, NetConfigResponse};
use arca_shared::{ArcaError, ArcaResult};
use std::sync::Arc;

pub struct NetworkConfigClient {
    vm: Arc<dyn VmHandle>,
}

impl NetworkConfigClient {
    pub fn new(vm: Arc<dyn VmHandle>) -> Self {
        Self { vm }
    }

    /// Create the VLAN sub-interface; returns its guest name.
    pub async fn create_vlan(
        &self,
        parent: &str,
        vlan_id: u16,
        ip: &str,
        gateway: &str,
        mtu: u32,
    ) -> ArcaResult<String> {
        let resp: NetConfigResponse = call(
            &self.vm,
            vsock::NETWORK_CONFIG_PORT,
            &NetConfigRequest::CreateVlan {
                parent: parent.to_string(),
                vlan_id,
                ip: ip.to_string(),
                gateway: gateway.to_string(),
                mtu,
            },
        )
        .await?;
        check_envelope(resp.success, resp.error.clone(), "CreateVLAN")?;
        resp.interface_name
            .ok_or_else(|| ArcaError::Remote("CreateVLAN returned no interface name".into()))
    }

    pub async fn delete_vlan(&self, interface: &str) -> ArcaResult<()> {
        let resp: NetConfigResponse = call(
            &self.vm,
            vsock::NETWORK_CONFIG_PORT,
            &NetConfigRequest::DeleteVlan {
                interface: interface.to_string(),
            },
        )
        .await?;
        check_envelope(resp.success, resp.error, "DeleteVLAN")
    }

    pub async fn configure_ip(&self, interface: &str, ip: &str) -> ArcaResult<()> {
        let resp: NetConfigResponse = call(
            &self.vm,
            vsock::NETWORK_CONFIG_PORT,
            &NetConfigRequest::ConfigureIp {
                interface: interface.to_string(),
                ip: ip.to_string(),
            },
        )
        .await?;
        check_envelope(resp.success, resp.error, "ConfigureIP")
    }

    pub async fn add_route(&self, destination: &str, gateway: &str) -> ArcaResult<()> {
        let resp: NetConfigResponse = call(
            &self.vm,
            vsock::NETWORK_CONFIG_PORT,
            &NetConfigRequest::AddRoute {
                destination: destination.to_string(),
                gateway: gateway.to_string(),
            },
        )
        .await?;
        check_envelope(resp.success, resp.error, "AddRoute")
    }

    pub async fn delete_route(&self, destination: &str) -> ArcaResult<()> {
        let resp: NetConfigResponse = call(
            &self.vm,
            vsock::NETWORK_CONFIG_PORT,
            &NetConfigRequest::DeleteRoute {
                destination: destination.to_string(),
            },
        )
        .await?;
        check_envelope(resp.success, resp.error, "DeleteRoute")
    }

    pub async fn list_interfaces(&self) -> ArcaResult<Vec<String>> {
        let resp: NetConfigResponse = call(
            &self.vm,
            vsock::NETWORK_CONFIG_PORT,
            &NetConfigRequest::ListInterfaces,
        )
        .await?;
        check_envelope(resp.success, resp.error.clone(), "ListInterfaces")?;
        Ok(resp.interfaces)
    }
}
