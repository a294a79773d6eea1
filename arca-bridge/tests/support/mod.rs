//! Shared fixtures: an in-memory VM runtime whose guest services answer
//! the vsock wire protocol over duplex pipes.

#![allow(dead_code)]

use arca_bridge::container::{ContainerConfig, ContainerManager, CreateContainerOptions, HostConfig};
use arca_bridge::ids::ContainerId;
use arca_bridge::images::{ImageRecord, LayerInfo};
use arca_bridge::layout::BridgeConfig;
use arca_bridge::vmm::{
    GuestProcess, ProcessSpec, ProcessStdio, VmHandle, VmRuntime, VmSpec, VsockStream,
};
use arca_shared::constants::{guest, vsock};
use arca_shared::wire::{
    FirewallRequest, FirewallResponse, NetConfigRequest, NetConfigResponse, OverlayRequest,
    OverlayResponse, RouterRequest, RouterResponse, TapRequest, TapResponse,
};
use arca_shared::{ArcaError, ArcaResult, codec};
use async_trait::async_trait;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use tokio::io::AsyncReadExt;
use tokio::sync::{mpsc, watch};

// ============================================================================
// EVENT LOG
// ============================================================================

/// Everything the guest services observed, for assertions.
#[derive(Default)]
pub struct EventLog {
    events: Mutex<Vec<String>>,
}

impl EventLog {
    pub fn push(&self, event: impl Into<String>) {
        self.events.lock().push(event.into());
    }

    pub fn snapshot(&self) -> Vec<String> {
        self.events.lock().clone()
    }

    pub fn contains(&self, needle: &str) -> bool {
        self.events.lock().iter().any(|e| e.contains(needle))
    }
}

// ============================================================================
// MOCK PROCESS
// ============================================================================

/// How the container's main process behaves.
#[derive(Clone)]
pub enum MainBehavior {
    /// Emit `stdout`, then exit with `exit_code`.
    Echo { stdout: Vec<u8>, exit_code: i64 },
    /// Stay alive until signalled; SIGTERM exits 0, anything else 128+n.
    RunUntilSignal,
}

impl Default for MainBehavior {
    fn default() -> Self {
        MainBehavior::Echo {
            stdout: b"hi\n".to_vec(),
            exit_code: 0,
        }
    }
}

pub struct MockProcess {
    pid: u32,
    behavior: MainBehavior,
    exit_tx: watch::Sender<Option<i64>>,
    exit_rx: watch::Receiver<Option<i64>>,
    /// Held open for RunUntilSignal so output pumps stay attached.
    stdout_tx: Mutex<Option<mpsc::Sender<Vec<u8>>>>,
}

impl MockProcess {
    fn finish(&self, code: i64) {
        let _ = self.exit_tx.send(Some(code));
        self.stdout_tx.lock().take();
    }
}

#[async_trait]
impl GuestProcess for MockProcess {
    fn pid(&self) -> u32 {
        self.pid
    }

    async fn wait(&self) -> ArcaResult<i64> {
        let mut rx = self.exit_rx.clone();
        loop {
            if let Some(code) = *rx.borrow() {
                return Ok(code);
            }
            rx.changed()
                .await
                .map_err(|_| ArcaError::Internal("mock process vanished".into()))?;
        }
    }

    async fn signal(&self, signal: i32) -> ArcaResult<()> {
        match self.behavior {
            MainBehavior::RunUntilSignal => {
                let code = if signal == libc::SIGTERM { 0 } else { 128 + signal as i64 };
                self.finish(code);
            }
            MainBehavior::Echo { .. } => {}
        }
        Ok(())
    }

    async fn resize(&self, _rows: u16, _cols: u16) -> ArcaResult<()> {
        Ok(())
    }

    async fn delete(&self) -> ArcaResult<()> {
        Ok(())
    }
}

// ============================================================================
// MOCK VM
// ============================================================================

#[derive(Clone, Copy, PartialEq, Eq)]
pub enum VmRole {
    Container,
    Helper,
}

pub struct MockVm {
    pub id: String,
    role: VmRole,
    pid: u32,
    events: Arc<EventLog>,
    behavior: MainBehavior,
    main: Mutex<Option<Arc<MockProcess>>>,
    next_pid: AtomicU32,
}

impl MockVm {
    pub fn helper(events: Arc<EventLog>) -> Arc<Self> {
        Arc::new(Self {
            id: "helper".to_string(),
            role: VmRole::Helper,
            pid: 2,
            events,
            behavior: MainBehavior::default(),
            main: Mutex::new(None),
            next_pid: AtomicU32::new(100),
        })
    }
}

#[async_trait]
impl VmHandle for MockVm {
    fn pid(&self) -> Option<u32> {
        Some(self.pid)
    }

    fn vmnet_ip(&self) -> Option<std::net::Ipv4Addr> {
        Some(std::net::Ipv4Addr::new(192, 168, 64, 9))
    }

    async fn start(&self) -> ArcaResult<()> {
        self.events.push(format!("vm.start {}", self.id));
        Ok(())
    }

    async fn shutdown(&self) -> ArcaResult<()> {
        self.events.push(format!("vm.shutdown {}", self.id));
        if let Some(main) = self.main.lock().take() {
            main.finish(137);
        }
        Ok(())
    }

    async fn kill(&self) -> ArcaResult<()> {
        self.events.push(format!("vm.kill {}", self.id));
        if let Some(main) = self.main.lock().take() {
            main.finish(137);
        }
        Ok(())
    }

    async fn signal_init(&self, signal: i32) -> ArcaResult<()> {
        self.events.push(format!("vm.signal {} {signal}", self.id));
        let main = self.main.lock().clone();
        match main {
            Some(main) => main.signal(signal).await,
            None => Err(ArcaError::StateConflict("no init process".into())),
        }
    }

    async fn wait(&self) -> ArcaResult<i64> {
        let main = self.main.lock().clone();
        match main {
            Some(main) => main.wait().await,
            None => Ok(0),
        }
    }

    async fn connect_vsock(&self, port: u32) -> ArcaResult<Box<dyn VsockStream>> {
        let (near, far) = tokio::io::duplex(256 * 1024);
        let events = Arc::clone(&self.events);
        let vm_id = self.id.clone();
        let role = self.role;
        tokio::spawn(async move {
            serve_port(vm_id, role, port, far, events).await;
        });
        Ok(Box::new(near))
    }

    async fn spawn(
        &self,
        spec: ProcessSpec,
    ) -> ArcaResult<(Box<dyn GuestProcess>, ProcessStdio)> {
        let pid = self.next_pid.fetch_add(1, Ordering::Relaxed);
        let daemon = spec.daemon || spec.argv.first().map(String::as_str)
            == Some(guest::TAP_FORWARDER_BIN);
        self.events
            .push(format!("vm.spawn {} {:?} daemon={daemon}", self.id, spec.argv));

        let (exit_tx, exit_rx) = watch::channel(None);

        if daemon {
            let process = MockProcess {
                pid,
                behavior: MainBehavior::RunUntilSignal,
                exit_tx,
                exit_rx,
                stdout_tx: Mutex::new(None),
            };
            return Ok((
                Box::new(process),
                ProcessStdio {
                    stdin: None,
                    stdout: None,
                    stderr: None,
                },
            ));
        }

        let (stdout_tx, stdout_rx) = mpsc::channel::<Vec<u8>>(16);
        let (stdin_tx, _stdin_rx) = mpsc::channel::<Vec<u8>>(16);

        let process = Arc::new(MockProcess {
            pid,
            behavior: self.behavior.clone(),
            exit_tx,
            exit_rx,
            stdout_tx: Mutex::new(Some(stdout_tx.clone())),
        });
        *self.main.lock() = Some(Arc::clone(&process));

        match &self.behavior {
            MainBehavior::Echo { stdout, exit_code } => {
                let stdout = stdout.clone();
                let exit_code = *exit_code;
                let process = Arc::clone(&process);
                tokio::spawn(async move {
                    if !stdout.is_empty() {
                        let _ = stdout_tx.send(stdout).await;
                    }
                    drop(stdout_tx);
                    process.finish(exit_code);
                });
            }
            MainBehavior::RunUntilSignal => {}
        }

        let stdio = ProcessStdio {
            stdin: spec.attach_stdin.then_some(stdin_tx),
            stdout: spec.attach_stdout.then_some(stdout_rx),
            stderr: None,
        };
        Ok((Box::new(ArcProcess(process)), stdio))
    }
}

/// Box-able wrapper so the VM can keep a handle to the same process.
pub struct ArcProcess(pub Arc<MockProcess>);

#[async_trait]
impl GuestProcess for ArcProcess {
    fn pid(&self) -> u32 {
        self.0.pid()
    }
    async fn wait(&self) -> ArcaResult<i64> {
        self.0.wait().await
    }
    async fn signal(&self, signal: i32) -> ArcaResult<()> {
        self.0.signal(signal).await
    }
    async fn resize(&self, rows: u16, cols: u16) -> ArcaResult<()> {
        self.0.resize(rows, cols).await
    }
    async fn delete(&self) -> ArcaResult<()> {
        self.0.delete().await
    }
}

// ============================================================================
// GUEST SERVICE DISPATCH
// ============================================================================

async fn serve_port(
    vm_id: String,
    role: VmRole,
    port: u32,
    mut stream: tokio::io::DuplexStream,
    events: Arc<EventLog>,
) {
    match (role, port) {
        (VmRole::Container, vsock::TAP_FORWARDER_PORT) => {
            while let Ok(req) = codec::read_frame::<_, TapRequest>(&mut stream).await {
                let resp = match &req {
                    TapRequest::AttachNetwork {
                        device, vsock_port, ip, ..
                    } => {
                        events.push(format!("tap.attach {vm_id} {device} {vsock_port} {ip}"));
                        TapResponse {
                            success: true,
                            ..Default::default()
                        }
                    }
                    TapRequest::DetachNetwork { device } => {
                        events.push(format!("tap.detach {vm_id} {device}"));
                        TapResponse {
                            success: true,
                            ..Default::default()
                        }
                    }
                    TapRequest::GetStatus => TapResponse {
                        success: true,
                        running: true,
                        ..Default::default()
                    },
                    TapRequest::ListNetworks => TapResponse {
                        success: true,
                        ..Default::default()
                    },
                    TapRequest::UpdateDnsMappings { mappings } => {
                        events.push(format!("tap.dns {vm_id} {} entries", mappings.len()));
                        TapResponse {
                            success: true,
                            ..Default::default()
                        }
                    }
                };
                if codec::write_frame(&mut stream, &resp).await.is_err() {
                    break;
                }
            }
        }
        (VmRole::Container, vsock::OVERLAYFS_PORT) => {
            while let Ok(req) = codec::read_frame::<_, OverlayRequest>(&mut stream).await {
                match &req {
                    OverlayRequest::MountOverlay {
                        lower_block_devices,
                        target,
                        ..
                    } => events.push(format!(
                        "overlay.mount {vm_id} lowers={} target={target}",
                        lower_block_devices.len()
                    )),
                    OverlayRequest::UnmountOverlay { target } => {
                        events.push(format!("overlay.unmount {vm_id} {target}"))
                    }
                }
                let resp = OverlayResponse {
                    success: true,
                    error: None,
                };
                if codec::write_frame(&mut stream, &resp).await.is_err() {
                    break;
                }
            }
        }
        (VmRole::Container, vsock::NETWORK_CONFIG_PORT) => {
            while let Ok(req) = codec::read_frame::<_, NetConfigRequest>(&mut stream).await {
                let mut resp = NetConfigResponse {
                    success: true,
                    ..Default::default()
                };
                if let NetConfigRequest::CreateVlan { parent, vlan_id, .. } = &req {
                    events.push(format!("netcfg.create_vlan {vm_id} {parent}.{vlan_id}"));
                    resp.interface_name = Some(format!("{parent}.{vlan_id}"));
                }
                if codec::write_frame(&mut stream, &resp).await.is_err() {
                    break;
                }
            }
        }
        (VmRole::Helper, vsock::ROUTER_PORT) => {
            while let Ok(req) = codec::read_frame::<_, RouterRequest>(&mut stream).await {
                let mut resp = RouterResponse {
                    success: true,
                    ..Default::default()
                };
                match &req {
                    RouterRequest::CreateSwitch { network_id, subnet, .. } => {
                        events.push(format!("router.create_switch {network_id} {subnet}"));
                    }
                    RouterRequest::DeleteSwitch { network_id } => {
                        events.push(format!("router.delete_switch {network_id}"));
                    }
                    RouterRequest::AttachContainer { container_id, ip, .. } => {
                        events.push(format!("router.attach {container_id} {ip}"));
                        resp.ip = Some(if ip.is_empty() {
                            "172.18.0.250".to_string()
                        } else {
                            ip.clone()
                        });
                    }
                    RouterRequest::DetachContainer { container_id, .. } => {
                        events.push(format!("router.detach {container_id}"));
                    }
                    RouterRequest::CreateVlanNetwork { vlan_id, .. } => {
                        events.push(format!("router.create_vlan {vlan_id}"));
                    }
                    RouterRequest::DeleteVlanNetwork { vlan_id } => {
                        events.push(format!("router.delete_vlan {vlan_id}"));
                    }
                }
                if codec::write_frame(&mut stream, &resp).await.is_err() {
                    break;
                }
            }
        }
        (VmRole::Helper, vsock::FIREWALL_PORT) => {
            while let Ok(req) = codec::read_frame::<_, FirewallRequest>(&mut stream).await {
                let mut resp = FirewallResponse {
                    success: true,
                    ..Default::default()
                };
                match &req {
                    FirewallRequest::PublishPort {
                        proto, host_port, container_ip, container_port,
                    } => events.push(format!(
                        "firewall.publish {proto} {host_port} -> {container_ip}:{container_port}"
                    )),
                    FirewallRequest::UnpublishPort { proto, host_port } => {
                        events.push(format!("firewall.unpublish {proto} {host_port}"))
                    }
                    FirewallRequest::DumpNftables => {
                        resp.ruleset = Some("table ip arca-nat {}".to_string());
                    }
                }
                if codec::write_frame(&mut stream, &resp).await.is_err() {
                    break;
                }
            }
        }
        // Relay data endpoints: swallow frames until the peer hangs up.
        _ => {
            let mut buf = vec![0u8; 64 * 1024];
            loop {
                match stream.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(_) => {}
                }
            }
        }
    }
}

// ============================================================================
// MOCK RUNTIME
// ============================================================================

pub struct MockRuntime {
    pub events: Arc<EventLog>,
    pub specs: Mutex<Vec<VmSpec>>,
    /// Per-container main-process behavior; default is echo-then-exit-0.
    pub behaviors: Mutex<HashMap<String, MainBehavior>>,
    next_pid: AtomicU32,
}

impl MockRuntime {
    pub fn new(events: Arc<EventLog>) -> Arc<Self> {
        Arc::new(Self {
            events,
            specs: Mutex::new(Vec::new()),
            behaviors: Mutex::new(HashMap::new()),
            // Above the kernel's pid_max, so liveness probes of "crashed"
            // mock VMs never collide with a real process.
            next_pid: AtomicU32::new(5_000_000),
        })
    }

    pub fn set_behavior(&self, container_id: &ContainerId, behavior: MainBehavior) {
        self.behaviors
            .lock()
            .insert(container_id.as_str().to_string(), behavior);
    }
}

#[async_trait]
impl VmRuntime for MockRuntime {
    async fn create_vm(&self, spec: VmSpec) -> ArcaResult<Arc<dyn VmHandle>> {
        let behavior = self
            .behaviors
            .lock()
            .get(&spec.id)
            .cloned()
            .unwrap_or_default();
        let vm = Arc::new(MockVm {
            id: spec.id.clone(),
            role: VmRole::Container,
            pid: self.next_pid.fetch_add(1, Ordering::Relaxed),
            events: Arc::clone(&self.events),
            behavior,
            main: Mutex::new(None),
            next_pid: AtomicU32::new(1),
        });
        self.specs.lock().push(spec);
        Ok(vm)
    }
}

// ============================================================================
// HARNESS
// ============================================================================

pub struct Harness {
    pub tmp: tempfile::TempDir,
    pub manager: Arc<ContainerManager>,
    pub runtime: Arc<MockRuntime>,
    pub helper: Arc<MockVm>,
    pub events: Arc<EventLog>,
}

impl Harness {
    pub fn new() -> Self {
        let tmp = tempfile::TempDir::new().expect("tempdir");
        Self::with_data_root(tmp)
    }

    pub fn with_data_root(tmp: tempfile::TempDir) -> Self {
        let events = Arc::new(EventLog::default());
        let runtime = MockRuntime::new(Arc::clone(&events));
        let helper = MockVm::helper(Arc::clone(&events));

        let config = BridgeConfig {
            data_root: tmp.path().join("arca"),
            use_port_proxies: false,
            stop_grace_seconds: 1,
            ..Default::default()
        };

        let manager = ContainerManager::new(
            config,
            runtime.clone() as Arc<dyn VmRuntime>,
            helper.clone() as Arc<dyn VmHandle>,
            None,
        )
        .expect("manager");

        Self {
            tmp,
            manager,
            runtime,
            helper,
            events,
        }
    }

    /// Restart the daemon over the same data root: a fresh manager with
    /// fresh in-memory state.
    pub fn reopen(self) -> Self {
        let Harness { tmp, manager, .. } = self;
        drop(manager);
        Self::with_data_root(tmp)
    }

    /// Register a one-layer image whose blob is a real gzipped tar, so the
    /// layer cache can build a genuine EXT4 from it.
    pub fn seed_image(&self, reference: &str) -> ImageRecord {
        use flate2::Compression;
        use flate2::write::GzEncoder;
        use std::io::Write;

        let mut tar_bytes = Vec::new();
        {
            let mut builder = tar::Builder::new(&mut tar_bytes);
            let mut header = tar::Header::new_gnu();
            header.set_size(20);
            header.set_mode(0o755);
            header.set_cksum();
            builder
                .append_data(&mut header, "bin/sh", &b"#!/bin/sh\nexec true\n"[..])
                .unwrap();
            builder.finish().unwrap();
        }
        let mut gz = GzEncoder::new(Vec::new(), Compression::fast());
        gz.write_all(&tar_bytes).unwrap();
        let blob = gz.finish().unwrap();

        let layer_digest = format!("sha256:{}", hex::encode(Sha256::digest(&blob)));
        let config_digest = format!(
            "sha256:{}",
            hex::encode(Sha256::digest(format!("config-{reference}")))
        );
        let manifest_digest = format!(
            "sha256:{}",
            hex::encode(Sha256::digest(format!("manifest-{reference}")))
        );

        let config_blob = serde_json::json!({
            "architecture": "amd64",
            "os": "linux",
            "rootfs": { "type": "layers", "diff_ids": [] },
            "config": {
                "Env": ["PATH=/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin"],
                "Cmd": ["/bin/sh"]
            }
        })
        .to_string();

        let images = self.manager.images();
        for (digest, bytes) in [
            (&layer_digest, blob.as_slice()),
            (&config_digest, config_blob.as_bytes()),
        ] {
            let path = images.blob_path(digest);
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            std::fs::write(path, bytes).unwrap();
        }

        images
            .import(
                reference,
                vec![LayerInfo {
                    digest: layer_digest,
                    media_type: "application/vnd.oci.image.layer.v1.tar+gzip".to_string(),
                    size: blob.len() as i64,
                }],
                &config_digest,
                &manifest_digest,
            )
            .unwrap()
    }

    pub async fn create_container(
        &self,
        name: &str,
        image: &str,
        cmd: &[&str],
    ) -> ContainerId {
        self.create_container_with(name, image, cmd, HostConfig::default())
            .await
            .unwrap()
    }

    pub async fn create_container_with(
        &self,
        name: &str,
        image: &str,
        cmd: &[&str],
        host_config: HostConfig,
    ) -> ArcaResult<ContainerId> {
        self.manager
            .create(CreateContainerOptions {
                name: Some(name.to_string()),
                config: ContainerConfig {
                    image: image.to_string(),
                    cmd: cmd.iter().map(|s| s.to_string()).collect(),
                    ..Default::default()
                },
                host_config,
            })
            .await
    }
}
