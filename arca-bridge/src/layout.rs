//! Bridge configuration and on-disk layout.

use arca_shared::{ArcaError, ArcaResult};
use std::path::{Path, PathBuf};

use crate::ids::ContainerId;

/// Directory structure constants.
pub mod dirs {
    /// Base directory name for bridge data.
    pub const ARCA_DIR: &str = ".arca";

    /// SQLite database file name, inside the data root.
    pub const DB_FILE: &str = "arca.db";

    /// Subdirectory for the content-addressed layer cache.
    pub const LAYERS_DIR: &str = "layers";

    /// Subdirectory for per-container working state (writable images).
    pub const CONTAINERS_DIR: &str = "containers";

    /// Subdirectory for named volumes.
    pub const VOLUMES_DIR: &str = "volumes";

    /// Subdirectory for container log files.
    pub const LOGS_DIR: &str = "logs";

    /// Subdirectory for registry blobs and manifests.
    pub const IMAGES_DIR: &str = "images";

    /// Transient staging area (kept on the same filesystem so renames are
    /// atomic).
    pub const TMP_DIR: &str = "tmp";

    /// Environment variable overriding the data root.
    pub const ENV_DATA_ROOT: &str = "ARCA_DATA_ROOT";
}

/// Configuration options for the bridge.
#[derive(Clone, Debug)]
pub struct BridgeConfig {
    /// Root directory for all bridge state.
    pub data_root: PathBuf,

    /// Registries searched for unqualified image references, in order.
    pub registries: Vec<String>,

    /// Publish ports through userspace proxies so they answer on loopback.
    /// When false only the helper-VM DNAT rule is installed.
    pub use_port_proxies: bool,

    /// Attach the helper-VM nftables ruleset to proxy failure diagnostics.
    pub debug_firewall_dump: bool,

    /// Grace period for `stop` before escalating to a kill, in seconds.
    pub stop_grace_seconds: u64,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        let data_root = std::env::var(dirs::ENV_DATA_ROOT)
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                let mut path = ::dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
                path.push(dirs::ARCA_DIR);
                path
            });

        Self {
            data_root,
            registries: vec!["docker.io".to_string()],
            use_port_proxies: true,
            debug_firewall_dump: false,
            stop_grace_seconds: 10,
        }
    }
}

/// Derives every on-disk path from the data root.
#[derive(Clone, Debug)]
pub struct FilesystemLayout {
    data_root: PathBuf,
}

impl FilesystemLayout {
    pub fn new(data_root: PathBuf) -> Self {
        Self { data_root }
    }

    pub fn data_root(&self) -> &Path {
        &self.data_root
    }

    /// SQLite database path.
    pub fn db_path(&self) -> PathBuf {
        self.data_root.join(dirs::DB_FILE)
    }

    /// Content-addressed layer cache root.
    pub fn layers_dir(&self) -> PathBuf {
        self.data_root.join(dirs::LAYERS_DIR)
    }

    /// Cached EXT4 block image for one layer digest.
    pub fn layer_image_path(&self, digest: &str) -> PathBuf {
        // Digests contain a colon ("sha256:..."); keep the path flat and
        // filesystem-safe.
        let safe = digest.replace(':', "_");
        self.layers_dir().join(safe).join("layer.ext4")
    }

    /// Registry blob and manifest cache.
    pub fn images_dir(&self) -> PathBuf {
        self.data_root.join(dirs::IMAGES_DIR)
    }

    /// Per-container working directory.
    pub fn container_dir(&self, id: &ContainerId) -> PathBuf {
        self.data_root.join(dirs::CONTAINERS_DIR).join(id.as_str())
    }

    /// Per-container writable overlay image.
    pub fn writable_image_path(&self, id: &ContainerId) -> PathBuf {
        self.container_dir(id).join("writable.ext4")
    }

    /// Named volumes root.
    pub fn volumes_dir(&self) -> PathBuf {
        self.data_root.join(dirs::VOLUMES_DIR)
    }

    /// Directory of one named volume.
    pub fn volume_dir(&self, name: &str) -> PathBuf {
        self.volumes_dir().join(name)
    }

    /// Backing block image of one named volume.
    pub fn volume_image_path(&self, name: &str) -> PathBuf {
        self.volume_dir(name).join("volume.img")
    }

    /// Container logs root.
    pub fn logs_dir(&self) -> PathBuf {
        self.data_root.join(dirs::LOGS_DIR)
    }

    /// Log directory of one container.
    pub fn container_logs_dir(&self, id: &ContainerId) -> PathBuf {
        self.logs_dir().join(id.as_str())
    }

    /// Staging area for atomic write-then-rename operations.
    pub fn tmp_dir(&self) -> PathBuf {
        self.data_root.join(dirs::TMP_DIR)
    }

    /// Initialize the directory tree.
    pub fn prepare(&self) -> ArcaResult<()> {
        for dir in [
            self.data_root.clone(),
            self.layers_dir(),
            self.images_dir(),
            self.data_root.join(dirs::CONTAINERS_DIR),
            self.volumes_dir(),
            self.logs_dir(),
            self.tmp_dir(),
        ] {
            std::fs::create_dir_all(&dir).map_err(|e| {
                ArcaError::Dependency(format!("failed to create {}: {e}", dir.display()))
            })?;
        }
        Ok(())
    }
}
