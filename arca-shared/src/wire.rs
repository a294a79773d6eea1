//! Vsock wire protocol for the in-guest services.
//!
//! Every service speaks length-prefixed JSON frames (see [`crate::codec`]):
//! one request frame in, one response frame out. Responses carry a
//! `success` flag and an optional `error` string; extra fields are
//! service-specific and default-skipped so the protocol can grow without
//! breaking older peers.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

// ============================================================================
// TAP FORWARDER (vsock 5555, per container)
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum TapRequest {
    AttachNetwork {
        device: String,
        vsock_port: u32,
        ip: String,
        gateway: String,
        netmask: String,
        mac: String,
    },
    DetachNetwork {
        device: String,
    },
    ListNetworks,
    GetStatus,
    UpdateDnsMappings {
        /// name or alias -> IPv4 address
        mappings: HashMap<String, String>,
    },
}

/// A network the forwarder currently serves, as reported by `ListNetworks`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TapNetwork {
    pub device: String,
    pub vsock_port: u32,
    pub ip: String,
    pub mac: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TapResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub networks: Vec<TapNetwork>,
    #[serde(default)]
    pub running: bool,
}

// ============================================================================
// OVERLAYFS SERVICE (vsock 51821, per container)
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum OverlayRequest {
    MountOverlay {
        /// Guest block device paths in overlay stacking order (bottom first).
        lower_block_devices: Vec<String>,
        upper_dir: String,
        work_dir: String,
        target: String,
    },
    UnmountOverlay {
        target: String,
    },
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OverlayResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

// ============================================================================
// FILESYSTEM SERVICE (vsock 51821, per container)
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum FsRequest {
    SyncFilesystem,
    EnumerateUpperdir,
    ReadArchive { path: String },
    WriteArchive { path: String, tar_data: Vec<u8> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FsEntryKind {
    File,
    Dir,
    Symlink,
    Whiteout,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FsEntry {
    pub path: String,
    pub kind: FsEntryKind,
    pub size: u64,
    /// Seconds since the Unix epoch.
    pub mtime: i64,
    pub mode: u32,
}

/// Stat block returned with `ReadArchive`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FsStat {
    pub name: String,
    pub size: u64,
    pub mode: u32,
    pub mtime: i64,
    pub link_target: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FsResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub entries: Vec<FsEntry>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tar_data: Vec<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stat: Option<FsStat>,
}

// ============================================================================
// NETWORK-CONFIG SERVICE (vsock 50051, per container; VLAN driver)
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum NetConfigRequest {
    CreateVlan {
        parent: String,
        vlan_id: u16,
        ip: String,
        gateway: String,
        mtu: u32,
    },
    DeleteVlan {
        interface: String,
    },
    ConfigureIp {
        interface: String,
        ip: String,
    },
    AddRoute {
        destination: String,
        gateway: String,
    },
    DeleteRoute {
        destination: String,
    },
    ListInterfaces,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NetConfigResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interface_name: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub interfaces: Vec<String>,
}

// ============================================================================
// HELPER-VM ROUTER (vsock 50052)
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum RouterRequest {
    /// Create (idempotently) the logical switch backing a bridge network.
    CreateSwitch {
        network_id: String,
        subnet: String,
        gateway: String,
    },
    DeleteSwitch {
        network_id: String,
    },
    /// Attach a container port to a switch. An empty `ip` asks the helper
    /// to assign one; the response carries the effective address.
    AttachContainer {
        network_id: String,
        container_id: String,
        ip: String,
        mac: String,
    },
    DetachContainer {
        network_id: String,
        container_id: String,
    },
    /// Provision a VLAN interface plus NAT and DHCP on the helper.
    CreateVlanNetwork {
        vlan_id: u16,
        subnet: String,
        gateway: String,
    },
    DeleteVlanNetwork {
        vlan_id: u16,
    },
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RouterResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Effective container IP for `AttachContainer`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
}

// ============================================================================
// HELPER-VM FIREWALL (vsock 50053)
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum FirewallRequest {
    PublishPort {
        proto: String,
        host_port: u16,
        container_ip: String,
        container_port: u16,
    },
    UnpublishPort {
        proto: String,
        host_port: u16,
    },
    DumpNftables,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FirewallResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ruleset: Option<String>,
}
