//! Content-addressed layer cache.
//!
//! Each OCI tar layer is unpacked once and packed into an EXT4 block image
//! at `<layers>/<digest>/layer.ext4`, which the guest stacks read-only
//! under its overlay. Builds are atomic (write-then-rename) and concurrent
//! requests for the same digest coalesce into a single build.

use crate::disk;
use crate::layout::FilesystemLayout;
use arca_shared::{ArcaError, ArcaResult};
use flate2::read::GzDecoder;
use std::collections::HashMap;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;

/// Observability hook: every cache lookup reports hit or miss.
pub trait LayerCacheRecorder: Send + Sync {
    fn record(&self, digest: &str, hit: bool);
}

/// Recorder that drops everything.
pub struct NullRecorder;

impl LayerCacheRecorder for NullRecorder {
    fn record(&self, _digest: &str, _hit: bool) {}
}

pub struct LayerCache {
    layout: FilesystemLayout,
    recorder: Arc<dyn LayerCacheRecorder>,
    /// Per-digest build locks; holding one serializes unpacks of that
    /// digest.
    inflight: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl LayerCache {
    pub fn new(layout: FilesystemLayout, recorder: Arc<dyn LayerCacheRecorder>) -> Self {
        Self {
            layout,
            recorder,
            inflight: Mutex::new(HashMap::new()),
        }
    }

    /// Path the cached image for `digest` lives at (whether or not it
    /// exists yet).
    pub fn image_path(&self, digest: &str) -> PathBuf {
        self.layout.layer_image_path(digest)
    }

    /// Ensure the block image for one layer exists, building it from the
    /// tar blob if needed. Returns the image path.
    pub async fn ensure_layer(&self, digest: &str, tar_path: &Path) -> ArcaResult<PathBuf> {
        let build_lock = {
            let mut inflight = self.inflight.lock().await;
            Arc::clone(
                inflight
                    .entry(digest.to_string())
                    .or_insert_with(|| Arc::new(Mutex::new(()))),
            )
        };
        let _guard = build_lock.lock().await;

        let image_path = self.image_path(digest);
        if image_path.exists() {
            self.recorder.record(digest, true);
            tracing::debug!(digest, "layer cache hit");
            return Ok(image_path);
        }
        self.recorder.record(digest, false);

        if !tar_path.exists() {
            return Err(ArcaError::Dependency(format!(
                "layer blob missing for {digest}: {}",
                tar_path.display()
            )));
        }

        tracing::info!(digest, "building layer image");
        let staging = self
            .layout
            .tmp_dir()
            .join(format!("layer-{}", digest.replace(':', "_")));
        let tmp_image = staging.with_extension("ext4.tmp");
        let tar_path = tar_path.to_path_buf();
        let final_image = image_path.clone();

        tokio::task::spawn_blocking(move || {
            build_layer_image(&tar_path, &staging, &tmp_image, &final_image)
        })
        .await
        .map_err(|e| ArcaError::Internal(format!("layer build task panicked: {e}")))??;

        Ok(image_path)
    }

    /// Ensure a whole stack of layers, concurrently. Order of the result
    /// matches the input (manifest order).
    pub async fn ensure_layers(
        &self,
        layers: &[(String, PathBuf)],
    ) -> ArcaResult<Vec<PathBuf>> {
        futures::future::try_join_all(
            layers
                .iter()
                .map(|(digest, tar)| self.ensure_layer(digest, tar)),
        )
        .await
    }
}

/// Unpack the layer tar and pack it into an EXT4 image, atomically.
fn build_layer_image(
    tar_path: &Path,
    staging: &Path,
    tmp_image: &Path,
    final_image: &Path,
) -> ArcaResult<()> {
    let result = (|| {
        if staging.exists() {
            std::fs::remove_dir_all(staging).map_err(|e| {
                ArcaError::Dependency(format!("failed to clear {}: {e}", staging.display()))
            })?;
        }
        std::fs::create_dir_all(staging).map_err(|e| {
            ArcaError::Dependency(format!("failed to create {}: {e}", staging.display()))
        })?;

        unpack_layer_tar(tar_path, staging)?;
        disk::create_ext4_from_dir(staging, tmp_image)?;

        if let Some(parent) = final_image.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                ArcaError::Dependency(format!("failed to create {}: {e}", parent.display()))
            })?;
        }
        std::fs::rename(tmp_image, final_image).map_err(|e| {
            ArcaError::Dependency(format!(
                "failed to install {}: {e}",
                final_image.display()
            ))
        })
    })();

    let _ = std::fs::remove_dir_all(staging);
    let _ = std::fs::remove_file(tmp_image);
    result
}

/// Unpack a (possibly gzipped) OCI layer tar.
///
/// AUFS-style whiteout entries (`.wh.*`) are unpacked as the regular files
/// they are; the in-guest overlay service translates them at mount time.
pub(crate) fn unpack_layer_tar(tar_path: &Path, dest: &Path) -> ArcaResult<()> {
    use std::io::{Seek, SeekFrom};

    let mut file = std::fs::File::open(tar_path).map_err(|e| {
        ArcaError::Dependency(format!("failed to open {}: {e}", tar_path.display()))
    })?;

    let mut magic = [0u8; 2];
    let n = file.read(&mut magic).unwrap_or(0);
    file.seek(SeekFrom::Start(0))
        .map_err(|e| ArcaError::Dependency(format!("seek failed: {e}")))?;
    let gzipped = n == 2 && magic == [0x1f, 0x8b];

    let reader: Box<dyn Read> = if gzipped {
        Box::new(GzDecoder::new(file))
    } else {
        Box::new(file)
    };

    let mut archive = tar::Archive::new(reader);
    archive.set_preserve_permissions(true);
    archive.set_preserve_mtime(true);
    archive.set_unpack_xattrs(false);
    archive.unpack(dest).map_err(|e| {
        ArcaError::Dependency(format!("failed to unpack {}: {e}", tar_path.display()))
    })
}
