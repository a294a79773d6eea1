//! Container manager: composes images, overlay storage, volumes,
//! networking, ports, exec, and logs into the container state machine,
//! and reconciles persisted state on startup.

use crate::container::config::{ContainerConfig, HostConfig};
use crate::container::state::ContainerStatus;
use crate::db::{ContainerRecord, StateStore, VolumeMountRecord};
use crate::exec::{ExecConfig, ExecManager};
use crate::ids::{ContainerId, ExecId, NetworkId};
use crate::images::{ImageManager, LayerCache, LayerCacheRecorder, NullRecorder};
use crate::layout::{BridgeConfig, FilesystemLayout};
use crate::logs::{ByteSink, ChannelReader, ContainerLogManager, FileLogWriter, RawWriter};
use crate::net::{
    AttachOptions, BridgeDriver, CreateNetworkOptions, NetworkManager, VlanDriver, VmRegistry,
    VmnetDriver,
};
use crate::overlay::OverlayOrchestrator;
use crate::ports::PortMapManager;
use crate::rpc::FirewallClient;
use crate::volumes::{CreateVolumeOptions, VolumeManager};
use crate::vmm::{MountSpec, ProcessSpec, VmHandle, VmRuntime, VmSpec};
use arca_shared::{ArcaError, ArcaResult, ResourceKind};
use chrono::Utc;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// Options for creating a container.
#[derive(Debug, Clone, Default)]
pub struct CreateContainerOptions {
    pub name: Option<String>,
    pub config: ContainerConfig,
    pub host_config: HostConfig,
}

/// Client-supplied attach endpoints for `start_attached`.
#[derive(Default)]
pub struct AttachStreams {
    pub stdin: Option<ChannelReader>,
    pub stdout: Option<RawWriter>,
    pub stderr: Option<RawWriter>,
}

/// Live (non-persisted) container state.
struct ContainerEntry {
    vm: Option<Arc<dyn VmHandle>>,
    published_ports: Vec<String>,
    /// Set by the exit watcher when the main process finishes.
    exit_rx: watch::Receiver<Option<i64>>,
    exit_tx: watch::Sender<Option<i64>>,
}

impl ContainerEntry {
    fn new() -> Self {
        let (exit_tx, exit_rx) = watch::channel(None);
        Self {
            vm: None,
            published_ports: Vec::new(),
            exit_rx,
            exit_tx,
        }
    }
}

/// Live VM handles, shared with the network drivers.
struct VmTable {
    vms: RwLock<HashMap<String, Arc<dyn VmHandle>>>,
}

impl VmTable {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            vms: RwLock::new(HashMap::new()),
        })
    }
}

impl VmRegistry for VmTable {
    fn vm_for(&self, container: &ContainerId) -> Option<Arc<dyn VmHandle>> {
        self.vms.read().get(container.as_str()).cloned()
    }
}

pub struct ContainerManager {
    config: BridgeConfig,
    layout: FilesystemLayout,
    store: Arc<StateStore>,
    images: Arc<ImageManager>,
    layer_cache: Arc<LayerCache>,
    overlay: OverlayOrchestrator,
    volumes: Arc<VolumeManager>,
    networks: Arc<NetworkManager>,
    ports: Arc<PortMapManager>,
    execs: Arc<ExecManager>,
    logs: Arc<ContainerLogManager>,
    runtime: Arc<dyn VmRuntime>,
    vm_table: Arc<VmTable>,
    entries: RwLock<HashMap<String, Arc<tokio::sync::Mutex<ContainerEntry>>>>,
}

impl ContainerManager {
    /// Build the manager and its subsystems. `helper` is the privileged
    /// helper VM (router, firewall, relay peer); `recorder` observes layer
    /// cache lookups.
    pub fn new(
        config: BridgeConfig,
        runtime: Arc<dyn VmRuntime>,
        helper: Arc<dyn VmHandle>,
        recorder: Option<Arc<dyn LayerCacheRecorder>>,
    ) -> ArcaResult<Arc<Self>> {
        let layout = FilesystemLayout::new(config.data_root.clone());
        layout.prepare()?;
        crate::logging::init_logging_for(&layout)?;

        let store = Arc::new(StateStore::open(&layout.db_path())?);
        let images = Arc::new(ImageManager::new(layout.clone(), Arc::clone(&store))?);
        let layer_cache = Arc::new(LayerCache::new(
            layout.clone(),
            recorder.unwrap_or_else(|| Arc::new(NullRecorder)),
        ));
        let volumes = Arc::new(VolumeManager::new(layout.clone(), Arc::clone(&store)));
        let logs = Arc::new(ContainerLogManager::new(layout.clone()));

        let vm_table = VmTable::new();
        let mut networks = NetworkManager::new(Arc::clone(&store));
        networks.register_driver(Arc::new(BridgeDriver::new(
            Arc::clone(&store),
            Arc::clone(&helper),
            vm_table.clone() as Arc<dyn VmRegistry>,
        )));
        networks.register_driver(Arc::new(VmnetDriver::new()));
        networks.register_driver(Arc::new(VlanDriver::new(
            Arc::clone(&store),
            Arc::clone(&helper),
            vm_table.clone() as Arc<dyn VmRegistry>,
        )));

        let firewall = Arc::new(FirewallClient::new(Arc::clone(&helper)));
        let ports = Arc::new(PortMapManager::new(config.clone(), Some(firewall)));

        Ok(Arc::new(Self {
            overlay: OverlayOrchestrator::new(layout.clone()),
            config,
            layout,
            store,
            images,
            layer_cache,
            volumes,
            networks: Arc::new(networks),
            ports,
            execs: Arc::new(ExecManager::new()),
            logs,
            runtime,
            vm_table,
            entries: RwLock::new(HashMap::new()),
        }))
    }

    // Subsystem accessors for the API layer.
    pub fn images(&self) -> &Arc<ImageManager> {
        &self.images
    }
    pub fn volumes(&self) -> &Arc<VolumeManager> {
        &self.volumes
    }
    pub fn networks(&self) -> &Arc<NetworkManager> {
        &self.networks
    }
    pub fn ports(&self) -> &Arc<PortMapManager> {
        &self.ports
    }
    pub fn logs(&self) -> &Arc<ContainerLogManager> {
        &self.logs
    }
    pub fn store(&self) -> &Arc<StateStore> {
        &self.store
    }
    pub fn layout(&self) -> &FilesystemLayout {
        &self.layout
    }

    fn entry(&self, id: &ContainerId) -> Arc<tokio::sync::Mutex<ContainerEntry>> {
        let mut entries = self.entries.write();
        Arc::clone(
            entries
                .entry(id.as_str().to_string())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(ContainerEntry::new()))),
        )
    }

    fn record(&self, id: &ContainerId) -> ArcaResult<ContainerRecord> {
        self.store
            .get_container(id)?
            .ok_or_else(|| ArcaError::not_found(ResourceKind::Container, id.short()))
    }

    /// Resolve a user string: exact name, full ID, then ID prefix.
    pub fn resolve(&self, name_or_id: &str) -> ArcaResult<ContainerRecord> {
        let all = self.store.load_all_containers()?;
        all.iter()
            .find(|c| c.name == name_or_id)
            .or_else(|| all.iter().find(|c| c.id.as_str() == name_or_id))
            .or_else(|| {
                let matches: Vec<_> = all
                    .iter()
                    .filter(|c| !name_or_id.is_empty() && c.id.starts_with(name_or_id))
                    .collect();
                (matches.len() == 1).then(|| matches[0])
            })
            .cloned()
            .ok_or_else(|| ArcaError::not_found(ResourceKind::Container, name_or_id))
    }

    pub fn list(&self) -> ArcaResult<Vec<ContainerRecord>> {
        self.store.load_all_containers()
    }

    pub fn list_by_status(&self, status: ContainerStatus) -> ArcaResult<Vec<ContainerRecord>> {
        Ok(self
            .list()?
            .into_iter()
            .filter(|c| c.status == status)
            .collect())
    }

    // ====================================================================
    // CREATE
    // ====================================================================

    /// Create a container: resolve the image, materialize its layers,
    /// build the writable image, set up volume mounts, persist. Any
    /// failure unwinds everything done so far.
    pub async fn create(&self, options: CreateContainerOptions) -> ArcaResult<ContainerId> {
        let image = self.images.inspect(&options.config.image)?;
        let id = ContainerId::new();
        let name = options.name.unwrap_or_else(|| id.short().to_string());

        let mut config = options.config;
        if let Some(image_config) = self.images.image_config(&image) {
            merge_image_defaults(&mut config, &image_config);
        }

        let record = ContainerRecord {
            id: id.clone(),
            name,
            image: config.image.clone(),
            image_id: image.digest.clone(),
            created_at: Utc::now(),
            status: ContainerStatus::Created,
            pid: None,
            exit_code: None,
            started_at: None,
            finished_at: None,
            stopped_by_user: false,
            config,
            host_config: options.host_config,
        };
        self.store.save_container(&record)?;

        // Everything after the row is rollback territory.
        let result = self.create_assets(&record).await;
        if let Err(e) = result {
            tracing::warn!(container = %id.short(), error = %e, "create failed; rolling back");
            self.rollback_create(&record).await;
            return Err(e);
        }

        self.entry(&id);
        tracing::info!(container = %id.short(), name = %record.name, "created container");
        Ok(id)
    }

    async fn create_assets(&self, record: &ContainerRecord) -> ArcaResult<()> {
        self.overlay.prepare_writable(&record.id)?;
        self.ensure_layer_images(record).await?;
        self.setup_volume_mounts(record)?;
        Ok(())
    }

    async fn rollback_create(&self, record: &ContainerRecord) {
        // Reverse order: volumes, writable image, row. Layer images are
        // shared cache entries and stay.
        let mounts = self.store.get_volume_mounts(&record.id).unwrap_or_default();
        if let Err(e) = self.store.delete_volume_mounts(&record.id) {
            tracing::warn!(error = %e, "rollback: mount rows");
        }
        for mount in mounts.iter().filter(|m| m.is_anonymous) {
            match self.store.get_volume_users(&mount.volume_name) {
                Ok(users) if users.is_empty() => {
                    if let Err(e) = self.volumes.delete_volume(&mount.volume_name, false) {
                        tracing::warn!(volume = %mount.volume_name, error = %e, "rollback: volume");
                    }
                }
                _ => {}
            }
        }
        if let Err(e) = self.overlay.remove_assets(&record.id) {
            tracing::warn!(error = %e, "rollback: overlay assets");
        }
        if let Err(e) = self.store.delete_container(&record.id) {
            tracing::warn!(error = %e, "rollback: container row");
        }
    }

    /// Materialize every layer of the container's image as a cached EXT4
    /// block image; returns the paths in manifest order.
    async fn ensure_layer_images(&self, record: &ContainerRecord) -> ArcaResult<Vec<PathBuf>> {
        let image = self.images.inspect(&record.image_id)?;
        let pairs: Vec<(String, PathBuf)> = image
            .layers
            .iter()
            .map(|l| (l.digest.clone(), self.images.blob_path(&l.digest)))
            .collect();
        self.layer_cache.ensure_layers(&pairs).await
    }

    /// Turn `binds` into volume mounts. Named volumes are created
    /// implicitly; a bare container path gets an anonymous volume. Host
    /// path binds are not part of the volume model.
    fn setup_volume_mounts(&self, record: &ContainerRecord) -> ArcaResult<()> {
        for bind in &record.host_config.binds {
            let (source, container_path) = match bind.split_once(':') {
                Some((source, rest)) => {
                    let container_path = rest.strip_suffix(":ro").unwrap_or(rest);
                    (Some(source), container_path)
                }
                None => (None, bind.as_str()),
            };

            let (volume_name, is_anonymous) = match source {
                Some(source) if source.starts_with('/') => {
                    return Err(ArcaError::Unsupported(format!(
                        "host path bind {source:?} is not supported; use a named volume"
                    )));
                }
                Some(source) => (source.to_string(), false),
                None => {
                    let volume = self.volumes.create_volume(CreateVolumeOptions::default())?;
                    (volume.name, true)
                }
            };

            if !is_anonymous && self.volumes.get_volume(&volume_name).is_err() {
                self.volumes.create_volume(CreateVolumeOptions {
                    name: Some(volume_name.clone()),
                    ..Default::default()
                })?;
            }

            self.store.save_volume_mount(&VolumeMountRecord {
                container_id: record.id.clone(),
                volume_name,
                container_path: container_path.to_string(),
                is_anonymous,
                mounted_at: Utc::now(),
            })?;
        }
        Ok(())
    }

    // ====================================================================
    // START
    // ====================================================================

    /// Start a container with only the JSON file log writers attached.
    pub async fn start(self: &Arc<Self>, id: &ContainerId) -> ArcaResult<()> {
        self.start_attached(id, AttachStreams::default()).await
    }

    /// Start a container with optional client attach streams.
    pub fn start_attached<'a>(
        self: &'a Arc<Self>,
        id: &'a ContainerId,
        streams: AttachStreams,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = ArcaResult<()>> + Send + 'a>> {
        Box::pin(async move {
            let entry = self.entry(id);
            let mut entry_guard = entry.lock().await;

            let record = self.record(id)?;
            if record.status.is_running() {
                return Err(ArcaError::AlreadyRunning(record.name.clone()));
            }
            if !record.status.can_start() {
                return Err(ArcaError::StateConflict(format!(
                    "container {} cannot start from status {}",
                    record.name, record.status
                )));
            }

            let result = self
                .start_locked(&mut entry_guard, &entry, &record, streams)
                .await;
            if let Err(e) = &result {
                tracing::warn!(container = %id.short(), error = %e, "start failed; rolling back");
            }
            result
        })
    }

    async fn start_locked(
        self: &Arc<Self>,
        entry_guard: &mut ContainerEntry,
        entry: &Arc<tokio::sync::Mutex<ContainerEntry>>,
        record: &ContainerRecord,
        streams: AttachStreams,
    ) -> ArcaResult<()> {
        let id = &record.id;

        // Storage: writable image plus cached lowers.
        let writable = self.overlay.prepare_writable(id)?;
        let lowers = self.ensure_layer_images(record).await?;

        // VM spec with the contract-ordered mount array; volume devices
        // slot in after the lowers, before the kernel filesystems.
        let mut mounts = self.overlay.mount_plan(id, &writable, &lowers);
        let volume_mounts = self.store.get_volume_mounts(id)?;
        let fs_start = mounts
            .iter()
            .position(|m| matches!(m, MountSpec::Filesystem { .. }))
            .unwrap_or(mounts.len());
        for (offset, mount) in volume_mounts.iter().enumerate() {
            let volume = self.volumes.get_volume(&mount.volume_name)?;
            mounts.insert(
                fs_start + offset,
                MountSpec::BlockDevice {
                    image: volume.mountpoint.clone(),
                    destination: mount.container_path.clone(),
                    format: "ext4".to_string(),
                    read_only: false,
                },
            );
        }

        let cpus = record
            .host_config
            .nano_cpus
            .map(|n| (n.div_ceil(1_000_000_000)).clamp(1, 64) as u8)
            .unwrap_or(2);
        let memory_mib = record
            .host_config
            .memory_bytes
            .map(|b| (b / (1024 * 1024)).clamp(64, u32::MAX as u64) as u32)
            .unwrap_or(512);

        let spec = VmSpec {
            id: id.as_str().to_string(),
            cpus,
            memory_mib,
            mounts,
            hostname: record
                .config
                .hostname
                .clone()
                .or_else(|| Some(record.id.short().to_string())),
        };

        let process_user =
            crate::exec::parse_user_spec(record.config.user.as_deref().unwrap_or(""))?;

        let vm = self.runtime.create_vm(spec).await?;
        vm.start().await?;

        let mut cleanup = StartCleanup::new(self, id, Arc::clone(&vm));

        // In-guest overlay mount.
        if let Err(e) = self.overlay.mount_overlay(Arc::clone(&vm), lowers.len()).await {
            cleanup.run().await;
            return Err(e);
        }

        self.vm_table
            .vms
            .write()
            .insert(id.as_str().to_string(), Arc::clone(&vm));
        cleanup.registered_vm = true;

        // Networking: the mode names a network, "none" skips, empty means
        // the default network (when one exists).
        let mut overlay_ip = String::new();
        let network_target = match record.host_config.network_mode.as_str() {
            "none" => None,
            "" => self.networks.default_network()?.map(|n| n.name),
            name => Some(name.to_string()),
        };
        if let Some(network) = network_target {
            let target = match self.networks.inspect(&network) {
                Ok(target) => target,
                Err(e) => {
                    cleanup.run().await;
                    return Err(e);
                }
            };
            if target.driver == crate::db::NetworkDriverKind::Vmnet {
                // The vmnet interface is part of the VM configuration, not
                // a dynamic attach; record the OS-assigned address.
                let ip = vm
                    .vmnet_ip()
                    .map(|ip| ip.to_string())
                    .unwrap_or_default();
                let row = crate::db::AttachmentRecord {
                    container_id: id.clone(),
                    network_id: target.id.clone(),
                    ip,
                    mac: String::new(),
                    aliases: vec![record.name.clone()],
                    attached_at: Utc::now(),
                };
                if let Err(e) = self.store.save_network_attachment(&row) {
                    cleanup.run().await;
                    return Err(e);
                }
                cleanup.vmnet_attachment = Some(target.id.clone());
            } else {
                let outcome = self
                    .networks
                    .connect(
                        id,
                        &record.name,
                        Arc::clone(&vm),
                        &network,
                        AttachOptions::default(),
                    )
                    .await;
                match outcome {
                    Ok(outcome) => {
                        cleanup.connected_network = Some(network);
                        overlay_ip = outcome.ip;
                    }
                    Err(e) => {
                        cleanup.run().await;
                        return Err(e);
                    }
                }
            }
        }

        // Port publishing. Proxies forward to the vmnet interface; DNAT
        // targets the overlay address.
        let published = if record.host_config.port_bindings.is_empty() {
            Vec::new()
        } else {
            let vmnet_ip = vm
                .vmnet_ip()
                .map(|ip| ip.to_string())
                .unwrap_or_else(|| overlay_ip.clone());
            match self
                .ports
                .publish_ports(id, &record.host_config.port_bindings, &overlay_ip, &vmnet_ip)
                .await
            {
                Ok(keys) => keys,
                Err(e) => {
                    cleanup.run().await;
                    return Err(e);
                }
            }
        };
        cleanup.published = published.clone();

        // Main process, log writers, exit watcher.
        let (stdout_log, stderr_log) = match self.logs.create_log_writers(id) {
            Ok(writers) => writers,
            Err(e) => {
                cleanup.run().await;
                return Err(e);
            }
        };

        let process_spec = ProcessSpec {
            argv: record.config.full_command(),
            env: record.config.env.clone(),
            working_dir: record.config.working_dir.clone(),
            user: process_user,
            tty: record.config.tty,
            attach_stdin: record.config.open_stdin,
            attach_stdout: true,
            attach_stderr: !record.config.tty,
            daemon: false,
        };
        let (process, stdio) = match vm.spawn(process_spec).await {
            Ok(spawned) => spawned,
            Err(e) => {
                cleanup.run().await;
                return Err(e);
            }
        };

        cleanup.disarm();

        // Output pumps: JSON log files always, client attach streams when
        // provided.
        if let Some(mut rx) = stdio.stdout {
            let mut sinks = sink_stack(stdout_log, streams.stdout);
            tokio::spawn(async move {
                while let Some(chunk) = rx.recv().await {
                    for sink in sinks.iter_mut() {
                        let _ = sink.write(&chunk);
                    }
                }
                for sink in sinks.iter_mut() {
                    let _ = sink.close();
                }
            });
        }
        if let Some(mut rx) = stdio.stderr {
            let mut sinks = sink_stack(stderr_log, streams.stderr);
            tokio::spawn(async move {
                while let Some(chunk) = rx.recv().await {
                    for sink in sinks.iter_mut() {
                        let _ = sink.write(&chunk);
                    }
                }
                for sink in sinks.iter_mut() {
                    let _ = sink.close();
                }
            });
        }
        if let (Some(mut reader), Some(tx)) = (streams.stdin, stdio.stdin) {
            tokio::spawn(async move {
                while let Some(chunk) = reader.next_chunk().await {
                    if tx.send(chunk).await.is_err() {
                        break;
                    }
                }
            });
        }

        let pid = vm.pid().unwrap_or(0);
        let started_at = Utc::now();
        self.store.mark_container_started(id, pid, started_at)?;

        entry_guard.vm = Some(Arc::clone(&vm));
        entry_guard.published_ports = published;
        let (exit_tx, exit_rx) = watch::channel(None);
        entry_guard.exit_tx = exit_tx;
        entry_guard.exit_rx = exit_rx;

        // Exit watcher: one per start, drives exited status and the
        // restart policy.
        {
            let manager = Arc::clone(self);
            let entry = Arc::clone(entry);
            let id = id.clone();
            tokio::spawn(async move {
                let code = process.wait().await.unwrap_or(-1);
                manager.handle_exit(&id, &entry, code).await;
            });
        }

        tracing::info!(container = %id.short(), pid, "started container");
        Ok(())
    }

    /// Record an exit, release runtime resources, and apply the restart
    /// policy.
    async fn handle_exit(
        self: Arc<Self>,
        id: &ContainerId,
        entry: &Arc<tokio::sync::Mutex<ContainerEntry>>,
        code: i64,
    ) {
        tracing::info!(container = %id.short(), code, "container exited");

        let (restart, vm) = {
            let mut entry_guard = entry.lock().await;
            let vm = entry_guard.vm.take();
            let _ = entry_guard.exit_tx.send(Some(code));
            let published = std::mem::take(&mut entry_guard.published_ports);
            drop(entry_guard);

            self.ports.unpublish_ports(&published).await;
            self.vm_table.vms.write().remove(id.as_str());

            let record = match self.store.get_container(id) {
                Ok(Some(record)) => record,
                _ => return,
            };
            if let Err(e) = self.store.update_container_status(
                id,
                ContainerStatus::Exited,
                Some(code),
                Some(Utc::now()),
            ) {
                tracing::warn!(container = %id.short(), error = %e, "exit status update failed");
            }

            // A user-initiated stop never triggers the policy, whatever
            // it says.
            let restart = !record.stopped_by_user
                && record
                    .host_config
                    .restart_policy
                    .should_restart(code, record.stopped_by_user);
            (restart, vm)
        };

        if let Some(vm) = vm {
            if let Err(e) = vm.shutdown().await {
                tracing::debug!(container = %id.short(), error = %e, "vm shutdown after exit");
            }
        }

        if restart {
            tracing::info!(container = %id.short(), "restart policy triggered");
            if let Err(e) = self
                .store
                .update_container_status(id, ContainerStatus::Restarting, None, None)
            {
                tracing::warn!(error = %e, "restarting status update failed");
            }
            if let Err(e) = self.start(id).await {
                tracing::warn!(container = %id.short(), error = %e, "policy restart failed");
                let _ = self
                    .store
                    .update_container_status(id, ContainerStatus::Exited, None, None);
            }
        }
    }

    // ====================================================================
    // STOP / KILL / PAUSE
    // ====================================================================

    /// Graceful stop: SIGTERM to init, SIGKILL after the grace period.
    /// Marks the container user-stopped for `unless-stopped`.
    pub async fn stop(&self, id: &ContainerId, timeout: Option<Duration>) -> ArcaResult<()> {
        let record = self.record(id)?;
        if !record.status.can_stop() {
            return Err(ArcaError::StateConflict(format!(
                "container {} is not running",
                record.name
            )));
        }

        self.store.set_stopped_by_user(id, true)?;

        let entry = self.entry(id);
        let (vm, mut exit_rx) = {
            let entry_guard = entry.lock().await;
            (entry_guard.vm.clone(), entry_guard.exit_rx.clone())
        };
        let Some(vm) = vm else {
            // No live VM: reconcile the record and be done.
            self.store.update_container_status(
                id,
                ContainerStatus::Exited,
                None,
                Some(Utc::now()),
            )?;
            return Ok(());
        };

        vm.signal_init(libc::SIGTERM).await?;

        let grace = timeout.unwrap_or(Duration::from_secs(self.config.stop_grace_seconds));
        let exited = tokio::time::timeout(grace, async {
            loop {
                if exit_rx.borrow().is_some() {
                    return;
                }
                if exit_rx.changed().await.is_err() {
                    return;
                }
            }
        })
        .await
        .is_ok();

        if !exited {
            tracing::info!(container = %id.short(), "grace period expired; killing");
            vm.kill().await?;
            // The exit watcher still runs; give it a moment, then force
            // the record if it never reports.
            let reported = tokio::time::timeout(Duration::from_secs(5), async {
                loop {
                    if exit_rx.borrow().is_some() {
                        return;
                    }
                    if exit_rx.changed().await.is_err() {
                        return;
                    }
                }
            })
            .await
            .is_ok();
            if !reported {
                self.store.update_container_status(
                    id,
                    ContainerStatus::Exited,
                    Some(137),
                    Some(Utc::now()),
                )?;
            }
        }

        tracing::info!(container = %id.short(), "stopped container");
        Ok(())
    }

    /// Signal passthrough to the container's init process.
    pub async fn kill(&self, id: &ContainerId, signal: i32) -> ArcaResult<()> {
        let record = self.record(id)?;
        if !record.status.is_active() {
            return Err(ArcaError::StateConflict(format!(
                "container {} is not running",
                record.name
            )));
        }
        let entry = self.entry(id);
        let vm = entry.lock().await.vm.clone();
        match vm {
            Some(vm) => vm.signal_init(signal).await,
            None => Err(ArcaError::StateConflict(format!(
                "container {} has no live VM",
                record.name
            ))),
        }
    }

    pub async fn pause(&self, id: &ContainerId) -> ArcaResult<()> {
        let record = self.record(id)?;
        if !record.status.can_transition_to(ContainerStatus::Paused) {
            return Err(ArcaError::StateConflict(format!(
                "container {} cannot pause from {}",
                record.name, record.status
            )));
        }
        self.kill(id, libc::SIGSTOP).await?;
        self.store
            .update_container_status(id, ContainerStatus::Paused, None, None)
    }

    pub async fn unpause(&self, id: &ContainerId) -> ArcaResult<()> {
        let record = self.record(id)?;
        if !record.status.is_paused() {
            return Err(ArcaError::StateConflict(format!(
                "container {} is not paused",
                record.name
            )));
        }
        let entry = self.entry(id);
        let vm = entry.lock().await.vm.clone();
        match vm {
            Some(vm) => vm.signal_init(libc::SIGCONT).await?,
            None => {
                return Err(ArcaError::StateConflict(format!(
                    "container {} has no live VM",
                    record.name
                )));
            }
        }
        self.store
            .update_container_status(id, ContainerStatus::Running, None, None)
    }

    pub async fn restart(
        self: &Arc<Self>,
        id: &ContainerId,
        timeout: Option<Duration>,
    ) -> ArcaResult<()> {
        let record = self.record(id)?;
        if record.status.can_stop() {
            self.stop(id, timeout).await?;
        }
        // An explicit restart clears the user-stopped flag.
        self.store.set_stopped_by_user(id, false)?;
        self.start(id).await
    }

    /// Atomic rename; UNIQUE on the name column is the arbiter.
    pub fn rename(&self, id: &ContainerId, new_name: &str) -> ArcaResult<()> {
        if new_name.is_empty() {
            return Err(ArcaError::InvalidArgument("container name is empty".into()));
        }
        self.store.update_container_name(id, new_name)
    }

    /// Wait for the running container to exit; returns the exit code.
    pub async fn wait(&self, id: &ContainerId) -> ArcaResult<i64> {
        let record = self.record(id)?;
        if let Some(code) = record.exit_code {
            if !record.status.is_active() {
                return Ok(code);
            }
        }
        let entry = self.entry(id);
        let mut exit_rx = entry.lock().await.exit_rx.clone();
        loop {
            if let Some(code) = *exit_rx.borrow() {
                return Ok(code);
            }
            exit_rx
                .changed()
                .await
                .map_err(|_| ArcaError::Internal("exit watcher vanished".into()))?;
        }
    }

    // ====================================================================
    // REMOVE
    // ====================================================================

    /// Remove a container. Running containers need `force`; with
    /// `remove_volumes`, anonymous volumes referenced only by this
    /// container go too.
    pub async fn remove(
        &self,
        id: &ContainerId,
        force: bool,
        remove_volumes: bool,
    ) -> ArcaResult<()> {
        let record = self.record(id)?;

        if record.status.is_active() {
            if !force {
                return Err(ArcaError::StateConflict(format!(
                    "cannot remove running container {}; stop it or use force",
                    record.name
                )));
            }
            let entry = self.entry(id);
            let vm = entry.lock().await.vm.clone();
            if let Some(vm) = vm {
                if let Err(e) = vm.kill().await {
                    tracing::warn!(container = %id.short(), error = %e, "kill during remove");
                }
            }
        }

        self.store
            .update_container_status(id, ContainerStatus::Removing, None, None)?;

        // Ports, networks, exec bookkeeping.
        self.ports.unpublish_container(id).await;
        if let Err(e) = self.networks.disconnect_all(id).await {
            tracing::warn!(container = %id.short(), error = %e, "network teardown during remove");
        }
        self.execs.drop_container_instances(id);
        self.vm_table.vms.write().remove(id.as_str());

        // Volume bookkeeping before the CASCADE wipes the mount rows.
        let mounts = self.store.get_volume_mounts(id)?;
        self.store.delete_container(id)?;

        if remove_volumes {
            for mount in mounts.iter().filter(|m| m.is_anonymous) {
                match self.store.get_volume_users(&mount.volume_name) {
                    Ok(users) if users.is_empty() => {
                        if let Err(e) = self.volumes.delete_volume(&mount.volume_name, false) {
                            tracing::warn!(volume = %mount.volume_name, error = %e, "anonymous volume removal");
                        }
                    }
                    _ => {}
                }
            }
        }

        if let Err(e) = self.overlay.remove_assets(id) {
            tracing::warn!(container = %id.short(), error = %e, "overlay asset removal");
        }
        if let Err(e) = self.logs.remove_logs(id) {
            tracing::warn!(container = %id.short(), error = %e, "log removal");
        }
        self.entries.write().remove(id.as_str());

        tracing::info!(container = %id.short(), "removed container");
        Ok(())
    }

    // ====================================================================
    // NETWORK ATTACH / DETACH
    // ====================================================================

    /// Connect a (running) container to a network. Drivers that cannot
    /// attach dynamically surface their typed error here.
    pub async fn connect_network(
        &self,
        container: &ContainerId,
        network: &str,
        options: AttachOptions,
    ) -> ArcaResult<crate::net::AttachOutcome> {
        let record = self.record(container)?;
        let vm = self.vm_table.vm_for(container).ok_or_else(|| {
            ArcaError::StateConflict(format!("container {} is not running", record.name))
        })?;
        self.networks
            .connect(container, &record.name, vm, network, options)
            .await
    }

    pub async fn disconnect_network(
        &self,
        container: &ContainerId,
        network: &str,
    ) -> ArcaResult<()> {
        self.networks.disconnect(container, network).await
    }

    // ====================================================================
    // EXEC
    // ====================================================================

    pub fn exec_create(&self, container: &ContainerId, config: ExecConfig) -> ArcaResult<ExecId> {
        let record = self.record(container)?;
        self.execs
            .create(container, record.status.is_running(), config)
    }

    pub async fn exec_start(
        &self,
        exec_id: &ExecId,
        detach: bool,
        stdin: Option<ChannelReader>,
        stdout: Option<Box<dyn ByteSink>>,
        stderr: Option<Box<dyn ByteSink>>,
    ) -> ArcaResult<()> {
        let info = self.execs.inspect(exec_id).await?;
        let vm = self
            .vm_table
            .vm_for(&info.container_id)
            .ok_or_else(|| {
                ArcaError::StateConflict(format!(
                    "container {} is not running",
                    info.container_id.short()
                ))
            })?;
        self.execs
            .start(exec_id, vm, detach, stdin, stdout, stderr)
            .await
    }

    pub fn execs(&self) -> &Arc<ExecManager> {
        &self.execs
    }

    // ====================================================================
    // NETWORK BOOTSTRAP + RECONCILIATION
    // ====================================================================

    /// Ensure the default bridge network exists.
    pub async fn ensure_default_network(&self, name: &str) -> ArcaResult<()> {
        if self.networks.default_network()?.is_some() {
            return Ok(());
        }
        let mut options = CreateNetworkOptions::bridge(name);
        options.is_default = true;
        self.networks.create_network(options).await.map(|_| ())
    }

    /// Startup reconciliation:
    /// 1. volumes are already durable rows; 2. network control planes and
    /// topology; 3. container records (log paths re-bound, stale running
    /// states cleared); 4. the restart-policy pass.
    pub async fn initialize(self: &Arc<Self>) -> ArcaResult<()> {
        self.networks.reconcile().await?;

        let containers = self.store.load_all_containers()?;
        for record in &containers {
            self.logs.register_existing_log_paths(&record.id);
            self.entry(&record.id);

            if record.status.is_active() {
                let alive = record
                    .pid
                    .map(crate::util::is_process_alive)
                    .unwrap_or(false);
                if !alive {
                    tracing::info!(
                        container = %record.id.short(),
                        recorded = %record.status,
                        "no live VM; marking exited"
                    );
                    self.store.update_container_status(
                        &record.id,
                        ContainerStatus::Exited,
                        None,
                        Some(Utc::now()),
                    )?;
                }
            }
        }

        // Restart pass, in creation order.
        for record in self.store.containers_to_restart()? {
            tracing::info!(container = %record.id.short(), "restart policy startup");
            if let Err(e) = self.start(&record.id).await {
                tracing::warn!(
                    container = %record.id.short(),
                    error = %e,
                    "startup restart failed"
                );
            }
        }

        tracing::info!(containers = containers.len(), "reconciliation complete");
        Ok(())
    }
}

/// Fill request gaps from the image configuration, the way Docker does:
/// an explicit request always wins, image values back-fill.
fn merge_image_defaults(
    config: &mut ContainerConfig,
    image_config: &oci_spec::image::ImageConfiguration,
) {
    let Some(defaults) = image_config.config() else {
        return;
    };

    if config.entrypoint.is_empty() {
        if let Some(entrypoint) = defaults.entrypoint() {
            config.entrypoint = entrypoint.clone();
        }
        // An explicit entrypoint discards the image cmd, so the image cmd
        // only applies when the entrypoint came from the image too.
        if config.cmd.is_empty() {
            if let Some(cmd) = defaults.cmd() {
                config.cmd = cmd.clone();
            }
        }
    }

    if let Some(env) = defaults.env() {
        let explicit_keys: Vec<&str> = config
            .env
            .iter()
            .filter_map(|e| e.split_once('=').map(|(k, _)| k))
            .collect();
        let mut merged: Vec<String> = env
            .iter()
            .filter(|e| {
                e.split_once('=')
                    .map(|(k, _)| !explicit_keys.contains(&k))
                    .unwrap_or(true)
            })
            .cloned()
            .collect();
        merged.extend(config.env.drain(..));
        config.env = merged;
    }

    if config.working_dir.is_none() {
        if let Some(dir) = defaults.working_dir() {
            if !dir.is_empty() {
                config.working_dir = Some(dir.clone());
            }
        }
    }
    if config.user.is_none() {
        if let Some(user) = defaults.user() {
            if !user.is_empty() {
                config.user = Some(user.clone());
            }
        }
    }
}

/// Stack of output sinks: the JSON file writer plus an optional client
/// attach stream.
fn sink_stack(file: FileLogWriter, raw: Option<RawWriter>) -> Vec<Box<dyn ByteSink>> {
    let mut sinks: Vec<Box<dyn ByteSink>> = vec![Box::new(file)];
    if let Some(raw) = raw {
        sinks.push(Box::new(raw));
    }
    sinks
}

/// Best-effort unwinding for a partially started container.
struct StartCleanup<'a> {
    manager: &'a ContainerManager,
    id: &'a ContainerId,
    vm: Arc<dyn VmHandle>,
    registered_vm: bool,
    connected_network: Option<String>,
    /// Vmnet attachments are plain rows, recorded without a driver
    /// attach, so rollback deletes the row directly.
    vmnet_attachment: Option<NetworkId>,
    published: Vec<String>,
    armed: bool,
}

impl<'a> StartCleanup<'a> {
    fn new(manager: &'a ContainerManager, id: &'a ContainerId, vm: Arc<dyn VmHandle>) -> Self {
        Self {
            manager,
            id,
            vm,
            registered_vm: false,
            connected_network: None,
            vmnet_attachment: None,
            published: Vec::new(),
            armed: true,
        }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }

    /// Unwind in reverse order of construction; every step logs and
    /// continues.
    async fn run(&mut self) {
        if !self.armed {
            return;
        }
        self.armed = false;

        if !self.published.is_empty() {
            self.manager.ports.unpublish_ports(&self.published).await;
        }
        if let Some(network) = self.connected_network.take() {
            if let Err(e) = self.manager.networks.disconnect(self.id, &network).await {
                tracing::warn!(error = %e, "start rollback: network");
            }
        }
        if let Some(network_id) = self.vmnet_attachment.take() {
            if let Err(e) = self
                .manager
                .store
                .delete_network_attachment(self.id, &network_id)
            {
                tracing::warn!(error = %e, "start rollback: vmnet attachment row");
            }
        }
        if self.registered_vm {
            self.manager.vm_table.vms.write().remove(self.id.as_str());
        }
        if let Err(e) = self.vm.kill().await {
            tracing::debug!(error = %e, "start rollback: vm kill");
        }
    }
}
