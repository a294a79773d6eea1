//! Named volume management.
//!
//! Volumes are EXT4 block images under `<volumes>/<name>/volume.img`,
//! attached to containers as additional block devices. Reference counting
//! goes through the `volume_mounts` table.

use crate::db::{StateStore, VolumeRecord};
use crate::disk;
use crate::layout::FilesystemLayout;
use arca_shared::{ArcaError, ArcaResult, ResourceKind};
use chrono::Utc;
use rand::RngCore;
use std::collections::HashMap;
use std::sync::Arc;

/// Options for `create_volume`. Everything is optional; a name is
/// generated when absent.
#[derive(Debug, Clone, Default)]
pub struct CreateVolumeOptions {
    pub name: Option<String>,
    pub driver: Option<String>,
    pub driver_opts: HashMap<String, String>,
    pub labels: HashMap<String, String>,
}

/// List/prune filters.
#[derive(Debug, Clone, Default)]
pub struct VolumeFilters {
    /// Substring match on the volume name.
    pub name: Option<String>,
    /// `key` or `key=value` label filters; all must match.
    pub labels: Vec<String>,
    /// Keep only volumes with (true) or without (false) zero mounts.
    pub dangling: Option<bool>,
}

pub struct VolumeManager {
    layout: FilesystemLayout,
    store: Arc<StateStore>,
}

impl VolumeManager {
    pub fn new(layout: FilesystemLayout, store: Arc<StateStore>) -> Self {
        Self { layout, store }
    }

    /// Create a named (or anonymous) volume backed by a thin EXT4 image.
    pub fn create_volume(&self, options: CreateVolumeOptions) -> ArcaResult<VolumeRecord> {
        let name = match options.name {
            Some(name) => {
                validate_volume_name(&name)?;
                name
            }
            None => generate_volume_name(),
        };

        let driver = options.driver.unwrap_or_else(|| "local".to_string());
        if driver != "local" {
            return Err(ArcaError::Unsupported(format!(
                "volume driver {driver:?} is not supported; only \"local\" is available"
            )));
        }

        if self
            .store
            .load_all_volumes()?
            .iter()
            .any(|v| v.name == name)
        {
            return Err(ArcaError::AlreadyExists {
                kind: ResourceKind::Volume,
                name,
            });
        }

        let size_bytes = match options.driver_opts.get("size") {
            Some(spec) => parse_size(spec)?,
            None => disk::VOLUME_IMAGE_BYTES,
        };

        let volume_dir = self.layout.volume_dir(&name);
        let image_path = self.layout.volume_image_path(&name);
        std::fs::create_dir_all(&volume_dir).map_err(|e| {
            ArcaError::Dependency(format!("failed to create {}: {e}", volume_dir.display()))
        })?;

        if let Err(e) = disk::create_thin_ext4(&image_path, size_bytes, &[]) {
            // Formatter failure leaves no half-made volume behind.
            let _ = std::fs::remove_dir_all(&volume_dir);
            return Err(e);
        }

        let record = VolumeRecord {
            name: name.clone(),
            driver,
            format: "ext4".to_string(),
            mountpoint: image_path,
            created_at: Utc::now(),
            labels: options.labels,
            options: options.driver_opts,
        };
        self.store.save_volume(&record)?;

        tracing::info!(volume = %name, size_bytes, "created volume");
        Ok(record)
    }

    pub fn get_volume(&self, name: &str) -> ArcaResult<VolumeRecord> {
        self.store
            .load_all_volumes()?
            .into_iter()
            .find(|v| v.name == name)
            .ok_or_else(|| ArcaError::not_found(ResourceKind::Volume, name))
    }

    /// Delete a volume; refuses with `VolumeInUse` while containers mount
    /// it unless `force`. Returns the bytes reclaimed on disk.
    pub fn delete_volume(&self, name: &str, force: bool) -> ArcaResult<u64> {
        let volume = self.get_volume(name)?;

        let users = self.store.get_volume_users(name)?;
        if !users.is_empty() && !force {
            return Err(ArcaError::VolumeInUse {
                name: name.to_string(),
                users,
            });
        }

        let reclaimed = allocated_bytes(&volume.mountpoint);
        let volume_dir = self.layout.volume_dir(name);
        if volume_dir.exists() {
            std::fs::remove_dir_all(&volume_dir).map_err(|e| {
                ArcaError::Dependency(format!(
                    "failed to remove {}: {e}",
                    volume_dir.display()
                ))
            })?;
        }
        self.store.delete_volume(name)?;

        tracing::info!(volume = %name, reclaimed, "deleted volume");
        Ok(reclaimed)
    }

    pub fn list_volumes(&self, filters: &VolumeFilters) -> ArcaResult<Vec<VolumeRecord>> {
        let mut volumes = self.store.load_all_volumes()?;

        if let Some(fragment) = &filters.name {
            volumes.retain(|v| v.name.contains(fragment.as_str()));
        }

        for label in &filters.labels {
            match label.split_once('=') {
                Some((key, value)) => {
                    volumes.retain(|v| v.labels.get(key).map(String::as_str) == Some(value));
                }
                None => volumes.retain(|v| v.labels.contains_key(label.as_str())),
            }
        }

        if let Some(dangling) = filters.dangling {
            let dangling_names = self.store.get_dangling_volumes()?;
            volumes.retain(|v| dangling_names.contains(&v.name) == dangling);
        }

        Ok(volumes)
    }

    /// Delete all dangling volumes matching the filters. Returns the
    /// deleted names and total bytes reclaimed.
    pub fn prune_volumes(&self, filters: &VolumeFilters) -> ArcaResult<(Vec<String>, u64)> {
        let mut filters = filters.clone();
        filters.dangling = Some(true);

        let mut deleted = Vec::new();
        let mut reclaimed = 0u64;
        for volume in self.list_volumes(&filters)? {
            match self.delete_volume(&volume.name, false) {
                Ok(bytes) => {
                    reclaimed += bytes;
                    deleted.push(volume.name);
                }
                // Raced with a new mount; not ours to delete anymore.
                Err(ArcaError::VolumeInUse { .. }) => continue,
                Err(e) => return Err(e),
            }
        }

        tracing::info!(count = deleted.len(), reclaimed, "pruned volumes");
        Ok((deleted, reclaimed))
    }
}

/// `<unix-ts>_<12-hex>` generated name for anonymous volumes.
fn generate_volume_name() -> String {
    let mut random = [0u8; 6];
    rand::rng().fill_bytes(&mut random);
    format!("{}_{}", Utc::now().timestamp(), hex::encode(random))
}

fn validate_volume_name(name: &str) -> ArcaResult<()> {
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'));
    if valid {
        Ok(())
    } else {
        Err(ArcaError::InvalidArgument(format!(
            "invalid volume name {name:?}"
        )))
    }
}

/// Parse `"<number><K|M|G|T>"` (or a raw byte count) into bytes.
fn parse_size(spec: &str) -> ArcaResult<u64> {
    let spec = spec.trim();
    let (digits, multiplier) = match spec.chars().last() {
        Some('K') | Some('k') => (&spec[..spec.len() - 1], 1024u64),
        Some('M') | Some('m') => (&spec[..spec.len() - 1], 1024u64.pow(2)),
        Some('G') | Some('g') => (&spec[..spec.len() - 1], 1024u64.pow(3)),
        Some('T') | Some('t') => (&spec[..spec.len() - 1], 1024u64.pow(4)),
        _ => (spec, 1),
    };

    let value: u64 = digits.trim().parse().map_err(|_| {
        ArcaError::InvalidArgument(format!(
            "invalid size {spec:?}; expected <number>[K|M|G|T]"
        ))
    })?;
    value
        .checked_mul(multiplier)
        .ok_or_else(|| ArcaError::InvalidArgument(format!("size {spec:?} overflows")))
}

/// Bytes actually allocated to a (possibly sparse) file.
fn allocated_bytes(path: &std::path::Path) -> u64 {
    use std::os::unix::fs::MetadataExt;
    std::fs::metadata(path).map(|m| m.blocks() * 512).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_size_suffixes() {
        assert_eq!(parse_size("512").unwrap(), 512);
        assert_eq!(parse_size("4K").unwrap(), 4096);
        assert_eq!(parse_size("2M").unwrap(), 2 * 1024 * 1024);
        assert_eq!(parse_size("10G").unwrap(), 10 * 1024 * 1024 * 1024);
        assert_eq!(parse_size("1T").unwrap(), 1024u64.pow(4));
        assert!(parse_size("10X").is_err());
        assert!(parse_size("").is_err());
        assert!(parse_size("G").is_err());
    }

    #[test]
    fn generated_names_have_expected_shape() {
        let name = generate_volume_name();
        let (ts, hex_part) = name.split_once('_').unwrap();
        assert!(ts.parse::<i64>().is_ok());
        assert_eq!(hex_part.len(), 12);
        assert!(hex_part.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn volume_name_validation() {
        assert!(validate_volume_name("data-1.db_backup").is_ok());
        assert!(validate_volume_name("").is_err());
        assert!(validate_volume_name("has/slash").is_err());
        assert!(validate_volume_name("has space").is_err());
    }

    #[test]
    fn unsupported_driver_is_rejected() {
        let tmp = tempfile::TempDir::new().unwrap();
        let layout = FilesystemLayout::new(tmp.path().to_path_buf());
        layout.prepare().unwrap();
        let store = Arc::new(StateStore::open_in_memory().unwrap());
        let manager = VolumeManager::new(layout, store);

        let err = manager
            .create_volume(CreateVolumeOptions {
                driver: Some("nfs".into()),
                ..Default::default()
            })
            .unwrap_err();
        assert!(matches!(err, ArcaError::Unsupported(_)));
    }
}
