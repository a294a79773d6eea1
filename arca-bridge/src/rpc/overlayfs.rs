//! OverlayFS mount service client (vsock 51821, per container).

use super::{call, check_envelope};
use crate::vmm::VmHandle;
use arca_shared::ArcaResult;
use arca_shared::constants::vsock;
use arca_shared::wire::{OverlayRequest, OverlayResponse};
use std::sync::Arc;

pub struct OverlayFsClient {
    vm: Arc<dyn VmHandle>,
}

impl OverlayFsClient {
    pub fn new(vm: Arc<dyn VmHandle>) -> Self {
        Self { vm }
    }

    /// Mount the overlay union at `target` from the given lower block
    /// devices (bottom first) and the writable device's upper/work dirs.
    pub async fn mount_overlay(
        &self,
        lower_block_devices: Vec<String>,
        upper_dir: &str,
        work_dir: &str,
        target: &str,
    ) -> ArcaResult<()> {
        let resp: OverlayResponse = call(
            &self.vm,
            vsock::OVERLAYFS_PORT,
            &OverlayRequest::MountOverlay {
                lower_block_devices,
                upper_dir: upper_dir.to_string(),
                work_dir: work_dir.to_string(),
                target: target.to_string(),
            },
        )
        .await?;
        check_envelope(resp.success, resp.error, "MountOverlay")
    }

    pub async fn unmount_overlay(&self, target: &str) -> ArcaResult<()> {
        let resp: OverlayResponse = call(
            &self.vm,
            vsock::OVERLAYFS_PORT,
            &OverlayRequest::UnmountOverlay {
                target: target.to_string(),
            },
        )
        .await?;
        check_envelope(resp.success, resp.error, "UnmountOverlay")
    }
}
