//! Container and host configuration types.
//!
//! These serialize into the `config_json` and `host_config_json` columns
//! and mirror the Docker Engine API shapes the HTTP layer accepts.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Static container configuration (the Docker `Config` block).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainerConfig {
    pub image: String,
    pub entrypoint: Vec<String>,
    pub cmd: Vec<String>,
    pub env: Vec<String>,
    pub working_dir: Option<String>,
    pub user: Option<String>,
    pub hostname: Option<String>,
    pub tty: bool,
    pub open_stdin: bool,
    pub attach_stdin: bool,
    pub attach_stdout: bool,
    pub attach_stderr: bool,
    pub labels: HashMap<String, String>,
}

impl ContainerConfig {
    /// Full command line: entrypoint followed by cmd.
    pub fn full_command(&self) -> Vec<String> {
        let mut argv = self.entrypoint.clone();
        argv.extend(self.cmd.iter().cloned());
        argv
    }
}

/// Host-side configuration (the Docker `HostConfig` block).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    /// `host_path:container_path[:ro]` bind specs and `volume:container_path`
    /// named-volume specs.
    pub binds: Vec<String>,
    /// Network to join at create time; empty means the default network.
    pub network_mode: String,
    /// `"<containerPort>/<proto>"` -> host-side bindings.
    pub port_bindings: HashMap<String, Vec<PortBindingHost>>,
    pub restart_policy: RestartPolicy,
    pub memory_bytes: Option<u64>,
    pub nano_cpus: Option<u64>,
    pub cap_add: Vec<String>,
    pub cap_drop: Vec<String>,
}

/// One host endpoint of a published port. Docker keeps both fields as
/// strings on the wire; validation happens at publish time.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortBindingHost {
    #[serde(default)]
    pub host_ip: String,
    pub host_port: String,
}

/// Restart policy, evaluated when a container exits and during startup
/// reconciliation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestartPolicy {
    #[serde(default)]
    pub name: RestartPolicyKind,
    /// Carried through for API parity; the bridge does not enforce it.
    #[serde(default)]
    pub maximum_retry_count: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RestartPolicyKind {
    #[default]
    No,
    Always,
    UnlessStopped,
    OnFailure,
}

impl RestartPolicy {
    /// Whether a container with this policy should be started again.
    ///
    /// `stopped_by_user` is the persisted flag set by an explicit `stop`;
    /// it only matters for `unless-stopped`.
    pub fn should_restart(&self, exit_code: i64, stopped_by_user: bool) -> bool {
        match self.name {
            RestartPolicyKind::Always => true,
            RestartPolicyKind::UnlessStopped => !stopped_by_user,
            RestartPolicyKind::OnFailure => exit_code != 0,
            RestartPolicyKind::No => false,
        }
    }
}
