//! Container lifecycle status and state machine.

use serde::{Deserialize, Serialize};

/// Lifecycle status of a container, Docker-compatible.
///
/// ```text
/// created ──start──▶ running ◀──unpause──▶ paused
///                      │  ▲
///                 exit │  │ restart policy
///                      ▼  │
///                   exited ──▶ removing
/// ```
///
/// `restarting` is a transient status between an exit and the policy-driven
/// start that follows it. `dead` marks containers whose teardown failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerStatus {
    Created,
    Running,
    Paused,
    Restarting,
    Exited,
    Removing,
    Dead,
}

impl ContainerStatus {
    pub fn is_running(&self) -> bool {
        matches!(self, ContainerStatus::Running)
    }

    pub fn is_paused(&self) -> bool {
        matches!(self, ContainerStatus::Paused)
    }

    pub fn is_restarting(&self) -> bool {
        matches!(self, ContainerStatus::Restarting)
    }

    /// True while the VM process should exist.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            ContainerStatus::Running | ContainerStatus::Paused | ContainerStatus::Restarting
        )
    }

    pub fn can_start(&self) -> bool {
        matches!(
            self,
            ContainerStatus::Created | ContainerStatus::Exited | ContainerStatus::Restarting
        )
    }

    pub fn can_stop(&self) -> bool {
        matches!(self, ContainerStatus::Running | ContainerStatus::Paused)
    }

    /// Removal requires `force` unless the container is inactive.
    pub fn can_remove(&self) -> bool {
        matches!(
            self,
            ContainerStatus::Created | ContainerStatus::Exited | ContainerStatus::Dead
        )
    }

    pub fn can_transition_to(&self, target: ContainerStatus) -> bool {
        use ContainerStatus::*;
        matches!(
            (self, target),
            (Created, Running)
                | (Created, Removing)
                | (Created, Dead)
                | (Running, Paused)
                | (Running, Exited)
                | (Running, Restarting)
                | (Running, Dead)
                | (Paused, Running)
                | (Paused, Exited)
                | (Restarting, Running)
                | (Restarting, Exited)
                | (Restarting, Dead)
                | (Exited, Running)
                | (Exited, Restarting)
                | (Exited, Removing)
                | (Exited, Dead)
                | (Removing, Dead)
                | (Dead, Removing)
        )
    }

    /// String form stored in the database and reported over the API.
    pub fn as_str(&self) -> &'static str {
        match self {
            ContainerStatus::Created => "created",
            ContainerStatus::Running => "running",
            ContainerStatus::Paused => "paused",
            ContainerStatus::Restarting => "restarting",
            ContainerStatus::Exited => "exited",
            ContainerStatus::Removing => "removing",
            ContainerStatus::Dead => "dead",
        }
    }
}

impl std::str::FromStr for ContainerStatus {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "created" => Ok(ContainerStatus::Created),
            "running" => Ok(ContainerStatus::Running),
            "paused" => Ok(ContainerStatus::Paused),
            "restarting" => Ok(ContainerStatus::Restarting),
            "exited" => Ok(ContainerStatus::Exited),
            "removing" => Ok(ContainerStatus::Removing),
            "dead" => Ok(ContainerStatus::Dead),
            _ => Err(()),
        }
    }
}

impl std::fmt::Display for ContainerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
