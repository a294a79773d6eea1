//! Sizing constants for EXT4 image production.

/// Filesystem block size passed to mke2fs (`-b 4096`).
pub const BLOCK_SIZE: u64 = 4096;

/// Inode size used for per-entry overhead estimation.
pub const INODE_SIZE: u64 = 256;

/// Journal allowance added on top of content size.
pub const JOURNAL_OVERHEAD_BYTES: u64 = 64 * 1024 * 1024;

/// Floor for generated images; tiny layers still need superblocks and
/// block-group metadata.
pub const MIN_DISK_SIZE_BYTES: u64 = 256 * 1024 * 1024;

/// Fallback content size when the source tree cannot be walked.
pub const DEFAULT_DIR_SIZE_BYTES: u64 = 512 * 1024 * 1024;

/// 10% headroom over measured content size.
pub const SIZE_MULTIPLIER_NUM: u64 = 11;
pub const SIZE_MULTIPLIER_DEN: u64 = 10;

/// Default size of the per-container writable overlay image.
pub const WRITABLE_IMAGE_BYTES: u64 = 64 * 1024 * 1024 * 1024;

/// Default size of a named volume image.
pub const VOLUME_IMAGE_BYTES: u64 = 512 * 1024 * 1024 * 1024;
