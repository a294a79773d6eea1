//! Image manager: pulls, the reference index, tag/delete/inspect.

use crate::db::StateStore;
use crate::images::reference::{is_id_prefix, normalize_reference};
use crate::layout::FilesystemLayout;
use arca_shared::{ArcaError, ArcaResult, ResourceKind};
use chrono::{DateTime, Utc};
use oci_client::Reference;
use oci_client::manifest::OciDescriptor;
use oci_client::secrets::RegistryAuth;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::AsyncReadExt;

/// One layer of an image, in overlay stacking order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LayerInfo {
    pub digest: String,
    pub media_type: String,
    /// Compressed size from the manifest descriptor.
    pub size: i64,
}

/// A stored image: manifest digest plus its human references.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageRecord {
    /// Manifest digest, `sha256:<hex>`. Doubles as the Docker image ID.
    pub digest: String,
    /// Normalized references pointing at this digest.
    pub references: Vec<String>,
    pub config_digest: String,
    /// Manifest order is overlay stacking order.
    pub layers: Vec<LayerInfo>,
    pub os: String,
    pub architecture: String,
    pub created_at: DateTime<Utc>,
}

impl ImageRecord {
    /// Docker-compatible image ID (`sha256:` + 64 hex).
    pub fn docker_id(&self) -> &str {
        &self.digest
    }

    /// The digest hex without its `sha256:` prefix.
    pub fn id_hex(&self) -> &str {
        self.digest.strip_prefix("sha256:").unwrap_or(&self.digest)
    }

    /// Sum of compressed layer sizes. This intentionally under-reports
    /// relative to Docker's uncompressed figure; the API layer documents
    /// the difference.
    pub fn size(&self) -> i64 {
        self.layers.iter().map(|l| l.size).sum()
    }
}

/// Registry authentication.
#[derive(Debug, Clone, Default)]
pub enum RegistryCredentials {
    #[default]
    Anonymous,
    Basic {
        username: String,
        password: String,
    },
}

impl RegistryCredentials {
    fn to_auth(&self) -> RegistryAuth {
        match self {
            RegistryCredentials::Anonymous => RegistryAuth::Anonymous,
            RegistryCredentials::Basic { username, password } => {
                RegistryAuth::Basic(username.clone(), password.clone())
            }
        }
    }
}

/// Pull progress notifications, forwarded to the API layer's status
/// stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PullEvent {
    Resolving(String),
    LayerStart(String),
    LayerComplete(String),
    Complete(String),
}

/// Observer for [`ImageManager::pull_with_progress`].
pub type PullProgress = Arc<dyn Fn(PullEvent) + Send + Sync>;

#[derive(Debug, Default, Serialize, Deserialize)]
struct ImageIndex {
    images: Vec<ImageRecord>,
}

/// Pull, index, and hand out images.
pub struct ImageManager {
    layout: FilesystemLayout,
    store: Arc<StateStore>,
    client: oci_client::Client,
    index: RwLock<ImageIndex>,
}

impl std::fmt::Debug for ImageManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImageManager").finish()
    }
}

impl ImageManager {
    pub fn new(layout: FilesystemLayout, store: Arc<StateStore>) -> ArcaResult<Self> {
        let index = Self::load_index(&layout)?;
        Ok(Self {
            layout,
            store,
            client: oci_client::Client::new(Default::default()),
            index: RwLock::new(index),
        })
    }

    fn index_path(layout: &FilesystemLayout) -> PathBuf {
        layout.images_dir().join("index.json")
    }

    fn blobs_dir(&self) -> PathBuf {
        self.layout.images_dir().join("blobs")
    }

    /// Path of a cached blob (layer tar or config JSON).
    pub fn blob_path(&self, digest: &str) -> PathBuf {
        self.blobs_dir().join(digest.replace(':', "_"))
    }

    fn load_index(layout: &FilesystemLayout) -> ArcaResult<ImageIndex> {
        let path = Self::index_path(layout);
        if !path.exists() {
            return Ok(ImageIndex::default());
        }
        let data = std::fs::read_to_string(&path).map_err(|e| {
            ArcaError::Dependency(format!("failed to read {}: {e}", path.display()))
        })?;
        serde_json::from_str(&data)
            .map_err(|e| ArcaError::Dependency(format!("corrupt image index: {e}")))
    }

    /// Persist the index with write-then-rename.
    fn save_index(&self) -> ArcaResult<()> {
        let path = Self::index_path(&self.layout);
        let tmp = self.layout.tmp_dir().join("index.json.tmp");
        let data = {
            let index = self.index.read();
            serde_json::to_vec_pretty(&*index)
                .map_err(|e| ArcaError::Internal(format!("index encode failed: {e}")))?
        };
        std::fs::write(&tmp, data)
            .map_err(|e| ArcaError::Dependency(format!("failed to write {}: {e}", tmp.display())))?;
        std::fs::rename(&tmp, &path).map_err(|e| {
            ArcaError::Dependency(format!("failed to install {}: {e}", path.display()))
        })?;
        Ok(())
    }

    // ========================================================================
    // LOOKUP
    // ========================================================================

    /// All stored images, newest first.
    pub fn list(&self) -> Vec<ImageRecord> {
        let mut images = self.index.read().images.clone();
        images.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        images
    }

    /// Resolve a user string to a stored image.
    ///
    /// Precedence: exact reference, normalized reference, 12..64 hex short
    /// ID prefix, full long ID.
    pub fn get_image(&self, name_or_id: &str) -> Option<ImageRecord> {
        let index = self.index.read();

        if let Some(img) = index
            .images
            .iter()
            .find(|img| img.references.iter().any(|r| r == name_or_id))
        {
            return Some(img.clone());
        }

        let normalized = normalize_reference(name_or_id);
        if let Some(img) = index
            .images
            .iter()
            .find(|img| img.references.iter().any(|r| *r == normalized))
        {
            return Some(img.clone());
        }

        if is_id_prefix(name_or_id) {
            if let Some(img) = index
                .images
                .iter()
                .find(|img| img.id_hex().starts_with(name_or_id))
            {
                return Some(img.clone());
            }
        }

        index
            .images
            .iter()
            .find(|img| img.digest == name_or_id)
            .cloned()
    }

    pub fn inspect(&self, name_or_id: &str) -> ArcaResult<ImageRecord> {
        self.get_image(name_or_id)
            .ok_or_else(|| ArcaError::not_found(ResourceKind::Image, name_or_id))
    }

    /// Add `target` as another reference to the image `source` resolves to.
    pub fn tag(&self, source: &str, target: &str) -> ArcaResult<()> {
        let image = self.inspect(source)?;
        let normalized_target = normalize_reference(target);

        {
            let mut index = self.index.write();
            // A reference points at one digest; retag steals it.
            for img in index.images.iter_mut() {
                img.references.retain(|r| *r != normalized_target);
            }
            if let Some(img) = index.images.iter_mut().find(|i| i.digest == image.digest) {
                if !img.references.contains(&normalized_target) {
                    img.references.push(normalized_target.clone());
                }
            }
        }
        self.save_index()?;
        tracing::info!(source, target = %normalized_target, "tagged image");
        Ok(())
    }

    /// Remove an image (or one of its references).
    ///
    /// Without `force`, refuses while any container references the digest.
    /// Returns the untagged references and, when the record went away, the
    /// deleted digest.
    pub fn delete(&self, name_or_id: &str, force: bool) -> ArcaResult<Vec<String>> {
        let image = self.inspect(name_or_id)?;

        let users = self.store.get_image_users(&image.digest)?;
        if !users.is_empty() && !force {
            return Err(ArcaError::StateConflict(format!(
                "image {} is referenced by containers: {}",
                image.digest,
                users.join(", ")
            )));
        }

        let normalized = normalize_reference(name_or_id);
        let mut removed = Vec::new();
        let delete_record = {
            let mut index = self.index.write();
            let Some(img) = index.images.iter_mut().find(|i| i.digest == image.digest) else {
                return Err(ArcaError::not_found(ResourceKind::Image, name_or_id));
            };

            // Deleting by reference drops that tag first; by ID (or when a
            // single tag remains, or forced) the whole record goes.
            let by_reference = img.references.iter().any(|r| *r == normalized);
            if by_reference && img.references.len() > 1 && !force {
                img.references.retain(|r| *r != normalized);
                removed.push(normalized.clone());
                false
            } else {
                removed.extend(img.references.clone());
                removed.push(img.digest.clone());
                index.images.retain(|i| i.digest != image.digest);
                true
            }
        };
        self.save_index()?;

        if delete_record {
            // Blobs are content-addressed and may back other images; only
            // clean ones no other record references.
            self.remove_unreferenced_blobs(&image);
        }
        tracing::info!(image = %image.digest, delete_record, "deleted image");
        Ok(removed)
    }

    fn remove_unreferenced_blobs(&self, image: &ImageRecord) {
        let index = self.index.read();
        let still_used: std::collections::HashSet<&str> = index
            .images
            .iter()
            .flat_map(|img| {
                img.layers
                    .iter()
                    .map(|l| l.digest.as_str())
                    .chain(std::iter::once(img.config_digest.as_str()))
            })
            .collect();

        for digest in image
            .layers
            .iter()
            .map(|l| l.digest.as_str())
            .chain(std::iter::once(image.config_digest.as_str()))
        {
            if !still_used.contains(digest) {
                let path = self.blob_path(digest);
                if path.exists() {
                    if let Err(e) = std::fs::remove_file(&path) {
                        tracing::warn!(digest, error = %e, "failed to remove blob");
                    }
                }
            }
        }
    }

    // ========================================================================
    // PULL
    // ========================================================================

    /// Pull an image, returning the cached record when everything is
    /// already on disk.
    pub async fn pull(
        &self,
        reference: &str,
        credentials: &RegistryCredentials,
    ) -> ArcaResult<ImageRecord> {
        self.pull_with_progress(reference, credentials, None).await
    }

    /// Pull with per-layer progress notifications.
    pub async fn pull_with_progress(
        &self,
        reference: &str,
        credentials: &RegistryCredentials,
        progress: Option<PullProgress>,
    ) -> ArcaResult<ImageRecord> {
        let notify = |event: PullEvent| {
            if let Some(progress) = &progress {
                progress(event);
            }
        };
        let normalized = normalize_reference(reference);
        let parsed: Reference = normalized.parse().map_err(|e| {
            ArcaError::InvalidArgument(format!("invalid image reference {reference:?}: {e}"))
        })?;

        // Fast path: reference already indexed and blobs intact.
        if let Some(cached) = self.get_image(&normalized) {
            if self.blobs_complete(&cached) {
                tracing::info!(reference = %normalized, "using cached image");
                return Ok(cached);
            }
            tracing::warn!(reference = %normalized, "cached image incomplete, re-pulling");
        }

        tracing::info!(reference = %normalized, "pulling image");
        notify(PullEvent::Resolving(normalized.clone()));
        let auth = credentials.to_auth();

        let (manifest, digest, layers, config_digest) =
            self.resolve_remote_manifest(&parsed, &auth).await?;

        for layer in &layers {
            notify(PullEvent::LayerStart(layer.digest.clone()));
            self.download_blob(&parsed, &layer.digest, &layer.media_type, layer.size)
                .await?;
            notify(PullEvent::LayerComplete(layer.digest.clone()));
        }
        self.download_blob(
            &parsed,
            &config_digest,
            "application/vnd.oci.image.config.v1+json",
            0,
        )
        .await?;

        let (os, architecture) = host_platform();
        let record = ImageRecord {
            digest,
            references: vec![normalized.clone()],
            config_digest,
            layers,
            os: os.to_string(),
            architecture: architecture.to_string(),
            created_at: Utc::now(),
        };
        drop(manifest);

        {
            let mut index = self.index.write();
            // Steal the reference from any image that previously held it.
            for img in index.images.iter_mut() {
                img.references.retain(|r| *r != normalized);
            }
            match index.images.iter_mut().find(|i| i.digest == record.digest) {
                Some(existing) => {
                    if !existing.references.contains(&normalized) {
                        existing.references.push(normalized.clone());
                    }
                    existing.layers = record.layers.clone();
                    existing.config_digest = record.config_digest.clone();
                }
                None => index.images.push(record.clone()),
            }
            index.images.retain(|i| !i.references.is_empty() || i.digest == record.digest);
        }
        self.save_index()?;

        tracing::info!(
            reference = %normalized,
            digest = %record.digest,
            layers = record.layers.len(),
            "pulled image"
        );
        notify(PullEvent::Complete(record.digest.clone()));
        Ok(self
            .get_image(&normalized)
            .unwrap_or(record))
    }

    /// Parse the stored OCI image configuration for an image.
    ///
    /// Returns `None` when the blob is missing or unparsable; callers
    /// treat that as "no defaults to merge".
    pub fn image_config(
        &self,
        image: &ImageRecord,
    ) -> Option<oci_spec::image::ImageConfiguration> {
        let path = self.blob_path(&image.config_digest);
        let data = std::fs::read(&path).ok()?;
        match serde_json::from_slice(&data) {
            Ok(config) => Some(config),
            Err(e) => {
                tracing::warn!(
                    digest = %image.config_digest,
                    error = %e,
                    "image config blob unparsable"
                );
                None
            }
        }
    }

    /// Import an image whose blobs are already in the content store (the
    /// `load` path): register the record and its reference without
    /// touching a registry.
    pub fn import(
        &self,
        reference: &str,
        layers: Vec<LayerInfo>,
        config_digest: &str,
        manifest_digest: &str,
    ) -> ArcaResult<ImageRecord> {
        for layer in &layers {
            if !self.blob_path(&layer.digest).exists() {
                return Err(ArcaError::InvalidArgument(format!(
                    "layer blob {} is not in the store",
                    layer.digest
                )));
            }
        }

        let normalized = normalize_reference(reference);
        let (os, architecture) = host_platform();
        let record = ImageRecord {
            digest: manifest_digest.to_string(),
            references: vec![normalized.clone()],
            config_digest: config_digest.to_string(),
            layers,
            os: os.to_string(),
            architecture: architecture.to_string(),
            created_at: Utc::now(),
        };

        {
            let mut index = self.index.write();
            for img in index.images.iter_mut() {
                img.references.retain(|r| *r != normalized);
            }
            match index.images.iter_mut().find(|i| i.digest == record.digest) {
                Some(existing) => {
                    if !existing.references.contains(&normalized) {
                        existing.references.push(normalized.clone());
                    }
                }
                None => index.images.push(record.clone()),
            }
            index.images.retain(|i| !i.references.is_empty());
        }
        self.save_index()?;

        tracing::info!(reference = %normalized, digest = %record.digest, "imported image");
        Ok(self.get_image(&normalized).unwrap_or(record))
    }

    /// Resolve layer digests, compressed sizes, and the manifest digest for
    /// a reference, from the index when stored, from the registry
    /// otherwise.
    pub async fn resolve_manifest_layers(
        &self,
        reference: &str,
        credentials: &RegistryCredentials,
    ) -> ArcaResult<(Vec<String>, Vec<i64>, String)> {
        let normalized = normalize_reference(reference);
        if let Some(cached) = self.get_image(&normalized) {
            return Ok((
                cached.layers.iter().map(|l| l.digest.clone()).collect(),
                cached.layers.iter().map(|l| l.size).collect(),
                cached.digest,
            ));
        }

        let parsed: Reference = normalized.parse().map_err(|e| {
            ArcaError::InvalidArgument(format!("invalid image reference {reference:?}: {e}"))
        })?;
        let (_, digest, layers, _) = self
            .resolve_remote_manifest(&parsed, &credentials.to_auth())
            .await?;
        Ok((
            layers.iter().map(|l| l.digest.clone()).collect(),
            layers.iter().map(|l| l.size).collect(),
            digest,
        ))
    }

    fn blobs_complete(&self, image: &ImageRecord) -> bool {
        image
            .layers
            .iter()
            .map(|l| &l.digest)
            .chain(std::iter::once(&image.config_digest))
            .all(|digest| self.blob_path(digest).exists())
    }

    /// Fetch the root manifest, resolving a manifest index to the entry
    /// for the host platform.
    async fn resolve_remote_manifest(
        &self,
        reference: &Reference,
        auth: &RegistryAuth,
    ) -> ArcaResult<(
        oci_client::manifest::OciManifest,
        String,
        Vec<LayerInfo>,
        String,
    )> {
        let (manifest, digest) = self
            .client
            .pull_manifest(reference, auth)
            .await
            .map_err(|e| ArcaError::Dependency(format!("failed to pull manifest: {e}")))?;

        match manifest {
            oci_client::manifest::OciManifest::Image(ref img) => {
                let layers = layers_from_image(img);
                let config_digest = img.config.digest.clone();
                Ok((manifest, digest, layers, config_digest))
            }
            oci_client::manifest::OciManifest::ImageIndex(ref index) => {
                let (os, arch) = host_platform();
                let entry = index
                    .manifests
                    .iter()
                    .find(|m| {
                        m.platform
                            .as_ref()
                            .map(|p| p.os == os && p.architecture == arch)
                            .unwrap_or(false)
                    })
                    .ok_or_else(|| {
                        let available = index
                            .manifests
                            .iter()
                            .filter_map(|m| {
                                m.platform
                                    .as_ref()
                                    .map(|p| format!("{}/{}", p.os, p.architecture))
                            })
                            .collect::<Vec<_>>()
                            .join(", ");
                        ArcaError::Dependency(format!(
                            "no manifest for platform {os}/{arch}; available: {available}"
                        ))
                    })?;

                let platform_ref: Reference =
                    format!("{}@{}", reference.whole(), entry.digest)
                        .parse()
                        .map_err(|e| {
                            ArcaError::Dependency(format!("invalid platform reference: {e}"))
                        })?;

                let (platform_manifest, platform_digest) = self
                    .client
                    .pull_manifest(&platform_ref, auth)
                    .await
                    .map_err(|e| {
                        ArcaError::Dependency(format!("failed to pull platform manifest: {e}"))
                    })?;

                match platform_manifest {
                    oci_client::manifest::OciManifest::Image(ref img) => {
                        let layers = layers_from_image(img);
                        let config_digest = img.config.digest.clone();
                        Ok((platform_manifest, platform_digest, layers, config_digest))
                    }
                    _ => Err(ArcaError::Dependency(
                        "platform manifest is not an image manifest".into(),
                    )),
                }
            }
        }
    }

    /// Download a blob to the content-addressed store with
    /// write-then-rename and digest verification. Cached blobs are kept.
    async fn download_blob(
        &self,
        reference: &Reference,
        digest: &str,
        media_type: &str,
        size: i64,
    ) -> ArcaResult<()> {
        let final_path = self.blob_path(digest);
        if final_path.exists() {
            tracing::debug!(digest, "blob already cached");
            return Ok(());
        }

        std::fs::create_dir_all(self.blobs_dir()).map_err(|e| {
            ArcaError::Dependency(format!("failed to create blob directory: {e}"))
        })?;
        let tmp_path = self
            .layout
            .tmp_dir()
            .join(format!("blob-{}", digest.replace(':', "_")));

        let mut file = tokio::fs::File::create(&tmp_path).await.map_err(|e| {
            ArcaError::Dependency(format!("failed to create {}: {e}", tmp_path.display()))
        })?;

        let descriptor = OciDescriptor {
            digest: digest.to_string(),
            media_type: media_type.to_string(),
            size,
            urls: None,
            annotations: None,
        };

        if let Err(e) = self
            .client
            .pull_blob(reference, &descriptor, &mut file)
            .await
        {
            drop(file);
            let _ = tokio::fs::remove_file(&tmp_path).await;
            return Err(ArcaError::Dependency(format!(
                "failed to pull blob {digest}: {e}"
            )));
        }
        drop(file);

        if !verify_blob_digest(&tmp_path, digest).await? {
            let _ = tokio::fs::remove_file(&tmp_path).await;
            return Err(ArcaError::Dependency(format!(
                "blob {digest} failed digest verification"
            )));
        }

        tokio::fs::rename(&tmp_path, &final_path).await.map_err(|e| {
            ArcaError::Dependency(format!("failed to install blob {digest}: {e}"))
        })?;
        tracing::debug!(digest, "downloaded blob");
        Ok(())
    }
}

fn layers_from_image(image: &oci_client::manifest::OciImageManifest) -> Vec<LayerInfo> {
    image
        .layers
        .iter()
        .map(|layer| LayerInfo {
            digest: layer.digest.clone(),
            media_type: layer.media_type.clone(),
            size: layer.size,
        })
        .collect()
}

/// The platform the bridge runs containers for. Guests are always Linux;
/// the architecture follows the host.
fn host_platform() -> (&'static str, &'static str) {
    let arch = match std::env::consts::ARCH {
        "aarch64" => "arm64",
        "x86_64" => "amd64",
        "x86" => "386",
        other => other,
    };
    ("linux", arch)
}

/// Stream a file through SHA-256 and compare with the expected digest.
async fn verify_blob_digest(path: &PathBuf, expected: &str) -> ArcaResult<bool> {
    let Some(expected_hex) = expected.strip_prefix("sha256:") else {
        // Unknown algorithm; accept rather than guess.
        return Ok(true);
    };

    let mut file = tokio::fs::File::open(path)
        .await
        .map_err(|e| ArcaError::Dependency(format!("failed to open {}: {e}", path.display())))?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 1024 * 1024];
    loop {
        let n = file
            .read(&mut buf)
            .await
            .map_err(|e| ArcaError::Dependency(format!("failed to read {}: {e}", path.display())))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()) == expected_hex)
}
