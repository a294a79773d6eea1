//! Shared constants between the host bridge and guest agents.
//!
//! These values are wire and layout contracts; they must be identical on
//! both sides of the host-guest boundary.

/// Vsock ports for the in-guest services.
pub mod vsock {
    /// TAP-forwarder control server inside each container VM.
    pub const TAP_FORWARDER_PORT: u32 = 5555;

    /// OverlayFS mount service inside each container VM.
    pub const OVERLAYFS_PORT: u32 = 51821;

    /// Filesystem service (sync, upperdir enumeration, archive I/O).
    /// Shares the overlayfs port number; the two never run on the same
    /// container at the same time.
    pub const FILESYSTEM_PORT: u32 = 51821;

    /// Network-config service used by the VLAN driver.
    pub const NETWORK_CONFIG_PORT: u32 = 50051;

    /// Helper-VM router (logical switches, VLAN NAT/DHCP).
    pub const ROUTER_PORT: u32 = 50052;

    /// Helper-VM firewall (port publishing DNAT rules).
    pub const FIREWALL_PORT: u32 = 50053;

    /// First container-side vsock port handed out for packet relays.
    pub const RELAY_PORT_BASE: u32 = 20_000;

    /// Size of the relay port window.
    pub const RELAY_PORT_SPAN: u32 = 10_000;

    /// The helper-VM side of a relay listens at container port + this.
    pub const HELPER_PORT_OFFSET: u32 = 10_000;
}

/// Automatic bridge-subnet provisioning.
pub mod subnet {
    /// Auto-allocated bridge networks use `172.<X>.0.0/16`; X starts here.
    pub const FIRST_BYTE: u8 = 18;

    /// Inclusive upper bound of the `172.<X>.0.0/16` band.
    pub const LAST_BYTE: u8 = 31;
}

/// VLAN driver ID range.
pub mod vlan {
    pub const MIN_ID: u16 = 100;
    pub const MAX_ID: u16 = 4094;
}

/// Paths and names inside the guest.
pub mod guest {
    /// In-guest TAP-forwarder daemon, launched once per container.
    pub const TAP_FORWARDER_BIN: &str = "/.arca/bin/arca-tap-forwarder";

    /// The container runtime layer chroots into the first mount; the rootfs
    /// bind lands under this directory, keyed by container ID.
    pub const ROOTFS_RUN_DIR: &str = "/run/container";

    /// Guest block device that carries the writable overlay EXT4.
    pub const WRITABLE_DEVICE: &str = "/dev/vdb";

    /// Lower layers appear as /dev/vdc, /dev/vdd, ... in manifest order.
    pub const FIRST_LOWER_DEVICE_LETTER: char = 'c';

    /// Overlay upper directory inside the writable device.
    pub const UPPER_DIR: &str = "upper";

    /// Overlay work directory inside the writable device.
    pub const WORK_DIR: &str = "work";
}
