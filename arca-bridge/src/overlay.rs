//! OverlayFS orchestration.
//!
//! Builds the per-container writable EXT4, lays out the VM mount array in
//! contract order, and drives the in-guest mount/unmount RPC once the VM
//! is up.
//!
//! Guest device layout: `/dev/vda` is the initfs (owned by the VM
//! manager), `/dev/vdb` the writable device, `/dev/vdc` onward the lower
//! layers in manifest order.

use crate::disk;
use crate::ids::ContainerId;
use crate::layout::FilesystemLayout;
use crate::rpc::OverlayFsClient;
use crate::vmm::{MountSpec, VmHandle};
use arca_shared::constants::guest;
use arca_shared::{ArcaError, ArcaResult};
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub struct OverlayOrchestrator {
    layout: FilesystemLayout,
}

impl OverlayOrchestrator {
    pub fn new(layout: FilesystemLayout) -> Self {
        Self { layout }
    }

    /// Create the container's writable image: 64 GiB thin EXT4 seeded with
    /// `upper/` and `work/`. Idempotent; an existing image is kept.
    pub fn prepare_writable(&self, id: &ContainerId) -> ArcaResult<PathBuf> {
        let path = self.layout.writable_image_path(id);
        if path.exists() {
            return Ok(path);
        }
        disk::create_thin_ext4(
            &path,
            disk::WRITABLE_IMAGE_BYTES,
            &[guest::UPPER_DIR, guest::WORK_DIR],
        )?;
        tracing::debug!(container = %id.short(), path = %path.display(), "created writable image");
        Ok(path)
    }

    /// Delete the container's working directory (writable image included).
    pub fn remove_assets(&self, id: &ContainerId) -> ArcaResult<()> {
        let dir = self.layout.container_dir(id);
        if dir.exists() {
            std::fs::remove_dir_all(&dir).map_err(|e| {
                ArcaError::Dependency(format!("failed to remove {}: {e}", dir.display()))
            })?;
        }
        Ok(())
    }

    /// The VM mount array, in the exact order the guest expects:
    ///
    /// 1. bind of `/` onto `/run/container/<id>/rootfs` (the in-guest
    ///    container runtime chroots into the first mount, and `/` is where
    ///    the overlay lands),
    /// 2. the writable block device (empty destination suppresses the
    ///    guest auto-mount),
    /// 3. one read-only block device per lower layer, manifest order,
    /// 4. the remaining kernel filesystems.
    pub fn mount_plan(
        &self,
        id: &ContainerId,
        writable_image: &Path,
        lower_images: &[PathBuf],
    ) -> Vec<MountSpec> {
        let mut mounts = Vec::with_capacity(lower_images.len() + 4);

        mounts.push(MountSpec::Bind {
            source: "/".to_string(),
            destination: format!("{}/{}/rootfs", guest::ROOTFS_RUN_DIR, id.as_str()),
            read_only: false,
        });

        mounts.push(MountSpec::BlockDevice {
            image: writable_image.to_path_buf(),
            destination: String::new(),
            format: "ext4".to_string(),
            read_only: false,
        });

        for image in lower_images {
            mounts.push(MountSpec::BlockDevice {
                image: image.clone(),
                destination: String::new(),
                format: "ext4".to_string(),
                read_only: true,
            });
        }

        mounts.push(MountSpec::Filesystem {
            fstype: "proc".to_string(),
            destination: "/proc".to_string(),
            options: vec![],
        });
        mounts.push(MountSpec::Filesystem {
            fstype: "sysfs".to_string(),
            destination: "/sys".to_string(),
            options: vec![],
        });

        mounts
    }

    /// Guest device paths of the lower layers, in manifest order.
    pub fn lower_devices(lower_count: usize) -> Vec<String> {
        // vda = initfs, vdb = writable; lowers start at vdc.
        (0..lower_count).map(|i| disk_device_name(i + 2)).collect()
    }

    /// Dial the in-guest overlayfs service and mount the union at `/`.
    pub async fn mount_overlay(
        &self,
        vm: Arc<dyn VmHandle>,
        lower_count: usize,
    ) -> ArcaResult<()> {
        let client = OverlayFsClient::new(vm);
        client
            .mount_overlay(
                Self::lower_devices(lower_count),
                guest::UPPER_DIR,
                guest::WORK_DIR,
                "/",
            )
            .await
            .map_err(|e| ArcaError::Remote(format!("overlay mount failed: {e}")))
    }

    /// Unmount the union during tear-down.
    pub async fn unmount_overlay(&self, vm: Arc<dyn VmHandle>) -> ArcaResult<()> {
        let client = OverlayFsClient::new(vm);
        client
            .unmount_overlay("/")
            .await
            .map_err(|e| ArcaError::Remote(format!("overlay unmount failed: {e}")))
    }
}

/// Virtio disk name for a zero-based index: 0 -> /dev/vda, 25 -> /dev/vdz,
/// 26 -> /dev/vdaa.
fn disk_device_name(index: usize) -> String {
    let mut suffix = Vec::new();
    let mut n = index;
    loop {
        suffix.push(b'a' + (n % 26) as u8);
        if n < 26 {
            break;
        }
        n = n / 26 - 1;
    }
    suffix.reverse();
    format!("/dev/vd{}", String::from_utf8(suffix).expect("ascii suffix"))
}
