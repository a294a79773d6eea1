//! VM runtime seam.
//!
//! The bridge drives the platform virtualization library through these
//! traits: build a VM from a [`VmSpec`], start and signal it, dial guest
//! vsock ports, and spawn processes through the in-guest container
//! runtime. The production implementation wraps the platform library; the
//! test suite substitutes an in-memory runtime.

use arca_shared::ArcaResult;
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;

/// A raw byte stream to a guest vsock port.
pub trait VsockStream: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> VsockStream for T {}

impl std::fmt::Debug for dyn VsockStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("VsockStream")
    }
}

/// Guest mount entry, in the exact order the VM configuration expects.
///
/// The container-runtime layer inside the guest chroots into the first
/// mount, so ordering is a contract, not a convenience.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MountSpec {
    /// Bind mount of a guest path onto a guest path.
    Bind {
        source: String,
        destination: String,
        read_only: bool,
    },
    /// A host block image exposed as a virtio disk. An empty destination
    /// suppresses the guest's auto-mount.
    BlockDevice {
        image: PathBuf,
        destination: String,
        format: String,
        read_only: bool,
    },
    /// Kernel filesystems (proc, sysfs, tmpfs, ...).
    Filesystem {
        fstype: String,
        destination: String,
        options: Vec<String>,
    },
}

/// Everything needed to build one container VM.
#[derive(Debug, Clone)]
pub struct VmSpec {
    /// Container ID the VM hosts (names the vsock context on the host).
    pub id: String,
    pub cpus: u8,
    pub memory_mib: u32,
    /// Mounts in contract order; see [`MountSpec`].
    pub mounts: Vec<MountSpec>,
    pub hostname: Option<String>,
}

/// Command to run inside the guest.
#[derive(Debug, Clone, Default)]
pub struct ProcessSpec {
    pub argv: Vec<String>,
    pub env: Vec<String>,
    pub working_dir: Option<String>,
    pub user: ProcessUser,
    pub tty: bool,
    pub attach_stdin: bool,
    pub attach_stdout: bool,
    pub attach_stderr: bool,
    /// Run detached from the spawning call (daemons like the tap
    /// forwarder).
    pub daemon: bool,
}

/// Parsed user specification for an in-guest process.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessUser {
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub username: Option<String>,
}

/// Stdio endpoints of a spawned process. Channels carry raw byte chunks.
pub struct ProcessStdio {
    pub stdin: Option<mpsc::Sender<Vec<u8>>>,
    pub stdout: Option<mpsc::Receiver<Vec<u8>>>,
    pub stderr: Option<mpsc::Receiver<Vec<u8>>>,
}

/// The platform virtualization library.
#[async_trait]
pub trait VmRuntime: Send + Sync {
    /// Build a VM from the spec. The VM is not running yet.
    async fn create_vm(&self, spec: VmSpec) -> ArcaResult<Arc<dyn VmHandle>>;
}

/// One VM under bridge control.
#[async_trait]
pub trait VmHandle: Send + Sync {
    /// Host-visible PID of the VM process, if running.
    fn pid(&self) -> Option<u32>;

    /// Address of the VM's vmnet interface, once the OS assigned one.
    fn vmnet_ip(&self) -> Option<std::net::Ipv4Addr> {
        None
    }

    async fn start(&self) -> ArcaResult<()>;

    /// Graceful shutdown request (guest-side SIGTERM to init).
    async fn shutdown(&self) -> ArcaResult<()>;

    /// Hard kill of the VM process.
    async fn kill(&self) -> ArcaResult<()>;

    /// Deliver a signal to the container's init process.
    async fn signal_init(&self, signal: i32) -> ArcaResult<()>;

    /// Wait for the container's init process to exit; returns its code.
    async fn wait(&self) -> ArcaResult<i64>;

    /// Dial a guest vsock port.
    async fn connect_vsock(&self, port: u32) -> ArcaResult<Box<dyn VsockStream>>;

    /// Spawn a process inside the running container.
    async fn spawn(
        &self,
        spec: ProcessSpec,
    ) -> ArcaResult<(Box<dyn GuestProcess>, ProcessStdio)>;
}

/// A process running inside a guest.
#[async_trait]
pub trait GuestProcess: Send + Sync {
    fn pid(&self) -> u32;

    /// Wait for exit; returns the exit code. Safe to call once.
    async fn wait(&self) -> ArcaResult<i64>;

    async fn signal(&self, signal: i32) -> ArcaResult<()>;

    /// Resize the PTY. Only meaningful for TTY processes.
    async fn resize(&self, rows: u16, cols: u16) -> ArcaResult<()>;

    /// Best-effort removal of guest-side bookkeeping.
    async fn delete(&self) -> ArcaResult<()>;
}
