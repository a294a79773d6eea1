//! Arca bridge - the host-side core of the Arca container engine.
//!
//! Each container is a lightweight Linux VM; this crate owns container
//! lifecycle, image and layer storage, networking data and control planes,
//! volumes, port publishing, exec sessions, log plumbing, and the SQLite
//! state store that survives daemon restarts. The Docker-compatible HTTP
//! layer and the in-guest agents live elsewhere and talk to this crate
//! through its public types and the vsock wire contract in `arca-shared`.

pub mod alloc;
pub mod container;
pub mod db;
pub mod disk;
pub mod exec;
pub mod ids;
pub mod images;
pub mod layout;
pub mod logging;
pub mod logs;
pub mod net;
pub mod overlay;
pub mod ports;
pub mod rpc;
pub mod util;
pub mod vmm;
pub mod volumes;

pub use arca_shared::{ArcaError, ArcaResult, ResourceKind};
pub use container::ContainerManager;
pub use ids::{ContainerId, ExecId, NetworkId};
pub use layout::{BridgeConfig, FilesystemLayout};
