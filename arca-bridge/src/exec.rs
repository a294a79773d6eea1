//! Exec sessions: extra processes inside a running container.

use crate::ids::{ContainerId, ExecId};
use crate::logs::{ByteSink, ChannelReader};
use crate::vmm::{GuestProcess, ProcessSpec, ProcessUser, VmHandle};
use arca_shared::{ArcaError, ArcaResult, ResourceKind};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::watch;

/// Configuration snapshot of one exec instance.
#[derive(Debug, Clone, Default)]
pub struct ExecConfig {
    pub cmd: Vec<String>,
    pub env: Vec<String>,
    pub working_dir: Option<String>,
    pub user: Option<String>,
    pub tty: bool,
    pub attach_stdin: bool,
    pub attach_stdout: bool,
    pub attach_stderr: bool,
}

/// Inspect view of an exec instance.
#[derive(Debug, Clone)]
pub struct ExecInfo {
    pub id: ExecId,
    pub container_id: ContainerId,
    pub running: bool,
    pub pid: Option<u32>,
    pub exit_code: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub config: ExecConfig,
}

struct ExecInstance {
    id: ExecId,
    container_id: ContainerId,
    config: ExecConfig,
    user: ProcessUser,
    running: bool,
    pid: Option<u32>,
    exit_code: Option<i64>,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
    process: Option<Arc<dyn GuestProcess>>,
    exit_tx: watch::Sender<Option<i64>>,
    exit_rx: watch::Receiver<Option<i64>>,
}

impl ExecInstance {
    fn info(&self) -> ExecInfo {
        ExecInfo {
            id: self.id.clone(),
            container_id: self.container_id.clone(),
            running: self.running,
            pid: self.pid,
            exit_code: self.exit_code,
            created_at: self.created_at,
            started_at: self.started_at,
            finished_at: self.finished_at,
            config: self.config.clone(),
        }
    }
}

/// In-memory registry of exec instances. Nothing here is persisted;
/// daemon restarts drop all exec state together with the VMs.
pub struct ExecManager {
    instances: Mutex<HashMap<String, Arc<tokio::sync::Mutex<ExecInstance>>>>,
}

impl Default for ExecManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ExecManager {
    pub fn new() -> Self {
        Self {
            instances: Mutex::new(HashMap::new()),
        }
    }

    fn instance(&self, exec_id: &ExecId) -> ArcaResult<Arc<tokio::sync::Mutex<ExecInstance>>> {
        self.instances
            .lock()
            .get(exec_id.as_str())
            .cloned()
            .ok_or_else(|| ArcaError::not_found(ResourceKind::Exec, exec_id.short()))
    }

    /// Register a new exec instance.
    ///
    /// The caller vouches for `container_running`; exec against a stopped
    /// container is a state conflict.
    pub fn create(
        &self,
        container_id: &ContainerId,
        container_running: bool,
        config: ExecConfig,
    ) -> ArcaResult<ExecId> {
        if config.cmd.is_empty() {
            return Err(ArcaError::InvalidArgument("exec command is empty".into()));
        }
        if !container_running {
            return Err(ArcaError::StateConflict(format!(
                "container {} is not running",
                container_id.short()
            )));
        }

        let user = parse_user_spec(config.user.as_deref().unwrap_or(""))?;
        let id = ExecId::new();
        let (exit_tx, exit_rx) = watch::channel(None);
        let instance = ExecInstance {
            id: id.clone(),
            container_id: container_id.clone(),
            config,
            user,
            running: false,
            pid: None,
            exit_code: None,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            process: None,
            exit_tx,
            exit_rx,
        };
        self.instances
            .lock()
            .insert(id.as_str().to_string(), Arc::new(tokio::sync::Mutex::new(instance)));

        tracing::debug!(exec = %id.short(), container = %container_id.short(), "created exec");
        Ok(id)
    }

    /// Start the process. Attached writers/readers must be supplied here,
    /// before the spawn; in TTY mode stderr is merged into stdout and any
    /// stderr writer is ignored.
    pub async fn start(
        &self,
        exec_id: &ExecId,
        vm: Arc<dyn VmHandle>,
        detach: bool,
        stdin: Option<ChannelReader>,
        stdout: Option<Box<dyn ByteSink>>,
        stderr: Option<Box<dyn ByteSink>>,
    ) -> ArcaResult<()> {
        let entry = self.instance(exec_id)?;
        let mut instance = entry.lock().await;

        if instance.running {
            return Err(ArcaError::AlreadyRunning(exec_id.short().to_string()));
        }

        let tty = instance.config.tty;
        let spec = ProcessSpec {
            argv: instance.config.cmd.clone(),
            env: instance.config.env.clone(),
            working_dir: instance.config.working_dir.clone(),
            user: instance.user.clone(),
            tty,
            attach_stdin: !detach && instance.config.attach_stdin,
            attach_stdout: !detach && instance.config.attach_stdout,
            // TTY merges stderr into the stdout stream.
            attach_stderr: !detach && instance.config.attach_stderr && !tty,
            daemon: detach,
        };

        let (process, stdio) = vm.spawn(spec).await?;
        let process: Arc<dyn GuestProcess> = Arc::from(process);

        instance.running = true;
        instance.pid = Some(process.pid());
        instance.started_at = Some(Utc::now());
        instance.process = Some(Arc::clone(&process));

        if !detach {
            if let (Some(mut rx), Some(mut sink)) = (stdio.stdout, stdout) {
                tokio::spawn(async move {
                    while let Some(chunk) = rx.recv().await {
                        if sink.write(&chunk).is_err() {
                            break;
                        }
                    }
                    let _ = sink.close();
                });
            }
            if let (Some(mut rx), Some(mut sink)) = (stdio.stderr, stderr) {
                tokio::spawn(async move {
                    while let Some(chunk) = rx.recv().await {
                        if sink.write(&chunk).is_err() {
                            break;
                        }
                    }
                    let _ = sink.close();
                });
            }
            if let (Some(mut reader), Some(tx)) = (stdin, stdio.stdin) {
                tokio::spawn(async move {
                    while let Some(chunk) = reader.next_chunk().await {
                        if tx.send(chunk).await.is_err() {
                            break;
                        }
                    }
                    // Sender drop signals stdin EOF to the guest.
                });
            }
        }

        // Completion watcher: record the exit, drop the handle.
        {
            let entry = Arc::clone(&entry);
            let exec_short = exec_id.short().to_string();
            tokio::spawn(async move {
                let code = process.wait().await.unwrap_or(-1);
                let mut instance = entry.lock().await;
                instance.running = false;
                instance.exit_code = Some(code);
                instance.finished_at = Some(Utc::now());
                if let Some(process) = instance.process.take() {
                    if let Err(e) = process.delete().await {
                        tracing::debug!(exec = %exec_short, error = %e, "process delete failed");
                    }
                }
                let _ = instance.exit_tx.send(Some(code));
                tracing::debug!(exec = %exec_short, code, "exec finished");
            });
        }

        tracing::debug!(exec = %exec_id.short(), detach, "started exec");
        Ok(())
    }

    /// Wait for completion; returns the exit code.
    pub async fn wait(&self, exec_id: &ExecId) -> ArcaResult<i64> {
        let mut rx = {
            let entry = self.instance(exec_id)?;
            let instance = entry.lock().await;
            if let Some(code) = instance.exit_code {
                return Ok(code);
            }
            instance.exit_rx.clone()
        };

        loop {
            if let Some(code) = *rx.borrow() {
                return Ok(code);
            }
            rx.changed()
                .await
                .map_err(|_| ArcaError::Internal("exec completion watcher vanished".into()))?;
        }
    }

    /// Resize the PTY. No-op for non-TTY instances.
    pub async fn resize(&self, exec_id: &ExecId, rows: u16, cols: u16) -> ArcaResult<()> {
        let entry = self.instance(exec_id)?;
        let instance = entry.lock().await;
        if !instance.config.tty {
            return Ok(());
        }
        match &instance.process {
            Some(process) => process.resize(rows, cols).await,
            None => Err(ArcaError::StateConflict(format!(
                "exec {} is not running",
                exec_id.short()
            ))),
        }
    }

    /// Deliver a signal to the exec process.
    pub async fn kill(&self, exec_id: &ExecId, signal: i32) -> ArcaResult<()> {
        let entry = self.instance(exec_id)?;
        let instance = entry.lock().await;
        match &instance.process {
            Some(process) => process.signal(signal).await,
            None => Err(ArcaError::StateConflict(format!(
                "exec {} is not running",
                exec_id.short()
            ))),
        }
    }

    pub async fn inspect(&self, exec_id: &ExecId) -> ArcaResult<ExecInfo> {
        let entry = self.instance(exec_id)?;
        let instance = entry.lock().await;
        Ok(instance.info())
    }

    /// Drop the in-memory record; guest-side deletion is best-effort.
    pub async fn delete(&self, exec_id: &ExecId) -> ArcaResult<()> {
        let entry = {
            let mut instances = self.instances.lock();
            instances.remove(exec_id.as_str())
        };
        let Some(entry) = entry else {
            return Err(ArcaError::not_found(ResourceKind::Exec, exec_id.short()));
        };

        let process = entry.lock().await.process.take();
        if let Some(process) = process {
            if let Err(e) = process.delete().await {
                tracing::debug!(exec = %exec_id.short(), error = %e, "process delete failed");
            }
        }
        Ok(())
    }

    /// Drop every instance belonging to a container (container removal).
    pub fn drop_container_instances(&self, container_id: &ContainerId) {
        self.instances.lock().retain(|_, entry| {
            // try_lock never fails here in practice; a held lock means the
            // instance is mid-operation and will be dropped with the map
            // entry regardless.
            match entry.try_lock() {
                Ok(instance) => instance.container_id != *container_id,
                Err(_) => true,
            }
        });
    }
}

/// Parse a Docker user specification.
///
/// `""` means "whatever the image says"; `uid:gid` takes numeric IDs on
/// both sides (group names are not supported); anything else is a
/// username resolved inside the guest.
pub fn parse_user_spec(spec: &str) -> ArcaResult<ProcessUser> {
    if spec.is_empty() {
        return Ok(ProcessUser::default());
    }

    if let Some((uid, gid)) = spec.split_once(':') {
        let uid: u32 = uid.parse().map_err(|_| {
            ArcaError::InvalidArgument(format!("invalid uid in user spec {spec:?}"))
        })?;
        let gid: u32 = gid.parse().map_err(|_| {
            ArcaError::InvalidArgument(format!(
                "invalid gid in user spec {spec:?}: group names are not supported"
            ))
        })?;
        return Ok(ProcessUser {
            uid: Some(uid),
            gid: Some(gid),
            username: None,
        });
    }

    if spec.chars().all(|c| c.is_ascii_digit()) {
        let uid: u32 = spec
            .parse()
            .map_err(|_| ArcaError::InvalidArgument(format!("invalid uid {spec:?}")))?;
        return Ok(ProcessUser {
            uid: Some(uid),
            gid: None,
            username: None,
        });
    }

    Ok(ProcessUser {
        uid: None,
        gid: None,
        username: Some(spec.to_string()),
    })
}
