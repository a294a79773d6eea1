//! TAP-forwarder control client (vsock 5555, per container).

use super::{call, check_envelope};
use crate::vmm::VmHandle;
use arca_shared::constants::vsock;
use arca_shared::wire::{TapNetwork, TapRequest, TapResponse};
use arca_shared::{ArcaError, ArcaResult};
use std::collections::HashMap;
use std::sync::Arc;

/// Parameters of one `AttachNetwork` call.
#[derive(Debug, Clone)]
pub struct TapAttachArgs {
    pub device: String,
    pub vsock_port: u32,
    pub ip: String,
    pub gateway: String,
    pub netmask: String,
    pub mac: String,
}

pub struct TapForwarderClient {
    vm: Arc<dyn VmHandle>,
}

impl TapForwarderClient {
    pub fn new(vm: Arc<dyn VmHandle>) -> Self {
        Self { vm }
    }

    pub async fn attach_network(&self, args: TapAttachArgs) -> ArcaResult<()> {
        let resp: TapResponse = call(
            &self.vm,
            vsock::TAP_FORWARDER_PORT,
            &TapRequest::AttachNetwork {
                device: args.device,
                vsock_port: args.vsock_port,
                ip: args.ip,
                gateway: args.gateway,
                netmask: args.netmask,
                mac: args.mac,
            },
        )
        .await?;
        check_envelope(resp.success, resp.error, "AttachNetwork")
    }

    pub async fn detach_network(&self, device: &str) -> ArcaResult<()> {
        let resp: TapResponse = call(
            &self.vm,
            vsock::TAP_FORWARDER_PORT,
            &TapRequest::DetachNetwork {
                device: device.to_string(),
            },
        )
        .await?;
        check_envelope(resp.success, resp.error, "DetachNetwork")
    }

    pub async fn list_networks(&self) -> ArcaResult<Vec<TapNetwork>> {
        let resp: TapResponse =
            call(&self.vm, vsock::TAP_FORWARDER_PORT, &TapRequest::ListNetworks).await?;
        check_envelope(resp.success, resp.error.clone(), "ListNetworks")?;
        Ok(resp.networks)
    }

    /// Probe whether the forwarder daemon is up. One dial, no backoff: an
    /// unreachable port means "not running", not an error.
    pub async fn is_running(&self) -> bool {
        use arca_shared::codec;

        let Ok(mut stream) = self.vm.connect_vsock(vsock::TAP_FORWARDER_PORT).await else {
            return false;
        };
        if codec::write_frame(&mut stream, &TapRequest::GetStatus)
            .await
            .is_err()
        {
            return false;
        }
        matches!(
            codec::read_frame::<_, TapResponse>(&mut stream).await,
            Ok(resp) if resp.success && resp.running
        )
    }

    pub async fn get_status(&self) -> ArcaResult<bool> {
        let resp: TapResponse =
            call(&self.vm, vsock::TAP_FORWARDER_PORT, &TapRequest::GetStatus).await?;
        if !resp.success {
            return Err(ArcaError::Remote(format!(
                "GetStatus failed: {}",
                resp.error.unwrap_or_else(|| "unspecified guest error".into())
            )));
        }
        Ok(resp.running)
    }

    pub async fn update_dns_mappings(
        &self,
        mappings: HashMap<String, String>,
    ) -> ArcaResult<()> {
        let resp: TapResponse = call(
            &self.vm,
            vsock::TAP_FORWARDER_PORT,
            &TapRequest::UpdateDnsMappings { mappings },
        )
        .await?;
        check_envelope(resp.success, resp.error, "UpdateDNSMappings")
    }
}
