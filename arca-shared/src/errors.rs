//! Error taxonomy for the Arca bridge.
//!
//! A single closed enum shared by every subsystem. Callers match on the
//! variant; the API layer maps variants onto Docker Engine API status codes.

use thiserror::Error;

/// Result alias used throughout the bridge and guest agents.
pub type ArcaResult<T> = Result<T, ArcaError>;

/// The kind of resource an operation failed to find or create.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    Container,
    Image,
    Volume,
    Network,
    Exec,
    Attachment,
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ResourceKind::Container => "container",
            ResourceKind::Image => "image",
            ResourceKind::Volume => "volume",
            ResourceKind::Network => "network",
            ResourceKind::Exec => "exec instance",
            ResourceKind::Attachment => "network attachment",
        };
        f.write_str(s)
    }
}

/// All failure modes surfaced by the bridge.
#[derive(Debug, Error)]
pub enum ArcaError {
    #[error("no such {kind}: {name}")]
    NotFound { kind: ResourceKind, name: String },

    #[error("{kind} already exists: {name}")]
    AlreadyExists { kind: ResourceKind, name: String },

    #[error("the name {0:?} is already in use")]
    NameInUse(String),

    /// Message text is a stable Docker-compatible contract. Do not reword.
    #[error("Bind for {host_ip}:{host_port} failed: port is already allocated")]
    PortAlreadyAllocated { host_ip: String, host_port: u16 },

    #[error("container {container} is already connected to network {network}")]
    AlreadyConnected { container: String, network: String },

    #[error("container {0} is already running")]
    AlreadyRunning(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("{0}")]
    StateConflict(String),

    #[error("volume {name} is in use by containers: {}", users.join(", "))]
    VolumeInUse { name: String, users: Vec<String> },

    #[error(
        "network driver {driver} does not support connecting a running container; \
         connect the container to the {driver} network at create time"
    )]
    DynamicAttachUnsupported { driver: String },

    #[error("{0} pool exhausted")]
    Exhausted(&'static str),

    /// In-guest RPC returned `success = false`, or the dial failed after
    /// exhausting retries.
    #[error("remote call failed: {0}")]
    Remote(String),

    /// An external collaborator (EXT4 formatter, VM runtime, registry)
    /// failed.
    #[error("{0}")]
    Dependency(String),

    #[error("database error: {0}")]
    Database(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("{0}")]
    Unsupported(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl ArcaError {
    /// Shorthand for a NotFound with a displayable name.
    pub fn not_found(kind: ResourceKind, name: impl Into<String>) -> Self {
        ArcaError::NotFound {
            kind,
            name: name.into(),
        }
    }

    /// True if this error means the named resource does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(self, ArcaError::NotFound { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn port_conflict_message_is_stable() {
        let err = ArcaError::PortAlreadyAllocated {
            host_ip: "0.0.0.0".into(),
            host_port: 8080,
        };
        assert_eq!(
            err.to_string(),
            "Bind for 0.0.0.0:8080 failed: port is already allocated"
        );
    }

    #[test]
    fn volume_in_use_lists_users() {
        let err = ArcaError::VolumeInUse {
            name: "data".into(),
            users: vec!["aaa".into(), "bbb".into()],
        };
        assert_eq!(
            err.to_string(),
            "volume data is in use by containers: aaa, bbb"
        );
    }

    #[test]
    fn not_found_helper() {
        let err = ArcaError::not_found(ResourceKind::Network, "net1");
        assert!(err.is_not_found());
        assert_eq!(err.to_string(), "no such network: net1");
    }
}
