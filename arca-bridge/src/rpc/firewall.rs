//! Helper-VM firewall client (vsock 50053).
//!
//! Installs and removes the DNAT rules behind published ports.

use super::{call, check_envelope};
use crate::vmm::VmHandle;
use arca_shared::ArcaResult;
use arca_shared::constants::vsock;
use arca_shared::wire::{FirewallRequest, FirewallResponse};
use std::sync::Arc;

pub struct FirewallClient {
    helper: Arc<dyn VmHandle>,
}

impl FirewallClient {
    pub fn new(helper: Arc<dyn VmHandle>) -> Self {
        Self { helper }
    }

    pub async fn publish_port(
        &self,
        proto: &str,
        host_port: u16,
        container_ip: &str,
        container_port: u16,
    ) -> ArcaResult<()> {
        let resp: FirewallResponse = call(
            &self.helper,
            vsock::FIREWALL_PORT,
            &FirewallRequest::PublishPort {
                proto: proto.to_string(),
                host_port,
                container_ip: container_ip.to_string(),
                container_port,
            },
        )
        .await?;
        check_envelope(resp.success, resp.error, "PublishPort")
    }

    pub async fn unpublish_port(&self, proto: &str, host_port: u16) -> ArcaResult<()> {
        let resp: FirewallResponse = call(
            &self.helper,
            vsock::FIREWALL_PORT,
            &FirewallRequest::UnpublishPort {
                proto: proto.to_string(),
                host_port,
            },
        )
        .await?;
        check_envelope(resp.success, resp.error, "UnpublishPort")
    }

    /// Current nftables ruleset, for proxy failure diagnostics.
    pub async fn dump_nftables(&self) -> ArcaResult<String> {
        let resp: FirewallResponse = call(
            &self.helper,
            vsock::FIREWALL_PORT,
            &FirewallRequest::DumpNftables,
        )
        .await?;
        check_envelope(resp.success, resp.error.clone(), "DumpNftables")?;
        Ok(resp.ruleset.unwrap_or_default())
    }
}
