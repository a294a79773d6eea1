//! EXT4 block-image production.
//!
//! Every filesystem handed to a guest is an EXT4 image built on the host
//! with `mke2fs -d`: cached image layers, per-container writable overlays,
//! and named volumes. Images are thin; mke2fs seeks rather than writes, so
//! a 64 GiB writable image costs a few megabytes until the guest fills it.

pub mod constants;

pub use constants::{VOLUME_IMAGE_BYTES, WRITABLE_IMAGE_BYTES};

use crate::util;
use arca_shared::{ArcaError, ArcaResult};
use std::path::{Path, PathBuf};
use std::process::Command;
use walkdir::WalkDir;

use constants::{
    BLOCK_SIZE, DEFAULT_DIR_SIZE_BYTES, INODE_SIZE, JOURNAL_OVERHEAD_BYTES, MIN_DISK_SIZE_BYTES,
    SIZE_MULTIPLIER_DEN, SIZE_MULTIPLIER_NUM,
};

fn mke2fs_path() -> ArcaResult<PathBuf> {
    util::find_binary("mke2fs")
}

fn debugfs_path() -> ArcaResult<PathBuf> {
    util::find_binary("debugfs")
}

/// Total bytes a directory tree needs on ext4: content rounded to 4 KiB
/// blocks plus inode overhead per entry.
fn calculate_dir_size(dir: &Path) -> ArcaResult<u64> {
    let mut total_blocks = 0u64;
    let mut entry_count = 0u64;

    for entry in WalkDir::new(dir).follow_links(false) {
        let entry = entry.map_err(|e| {
            ArcaError::Dependency(format!("failed to walk {}: {e}", dir.display()))
        })?;

        entry_count += 1;

        if let Ok(metadata) = entry.metadata() {
            if metadata.is_file() {
                total_blocks += metadata.len().div_ceil(BLOCK_SIZE).max(1);
            } else if metadata.is_dir() {
                total_blocks += 1;
            }
        }
    }

    Ok(total_blocks * BLOCK_SIZE + entry_count * INODE_SIZE)
}

/// Content size with ext4 metadata and journal headroom applied.
fn calculate_disk_size(source: &Path) -> u64 {
    let dir_size = calculate_dir_size(source).unwrap_or(DEFAULT_DIR_SIZE_BYTES);
    let size_with_overhead =
        dir_size * SIZE_MULTIPLIER_NUM / SIZE_MULTIPLIER_DEN + JOURNAL_OVERHEAD_BYTES;
    let final_size = size_with_overhead.max(MIN_DISK_SIZE_BYTES);

    tracing::debug!(
        dir_mb = dir_size / (1024 * 1024),
        final_mb = final_size / (1024 * 1024),
        "calculated ext4 image size"
    );

    final_size
}

/// Build an EXT4 image populated from `source`, sized automatically.
///
/// Used for cached image layers: the layer tar is unpacked to a staging
/// directory first, then packed into a block image here.
pub fn create_ext4_from_dir(source: &Path, output: &Path) -> ArcaResult<()> {
    let size_bytes = calculate_disk_size(source);
    run_mke2fs(Some(source), output, size_bytes)?;
    fix_ownership_with_debugfs(output, source)
}

/// Build a thin EXT4 image of exactly `size_bytes`, seeded with the given
/// top-level directories (for the writable overlay's `upper/` and `work/`).
pub fn create_thin_ext4(output: &Path, size_bytes: u64, seed_dirs: &[&str]) -> ArcaResult<()> {
    if seed_dirs.is_empty() {
        return run_mke2fs(None, output, size_bytes);
    }

    let staging = tempfile_dir_next_to(output)?;
    for dir in seed_dirs {
        std::fs::create_dir_all(staging.join(dir)).map_err(|e| {
            ArcaError::Dependency(format!("failed to seed {}: {e}", staging.display()))
        })?;
    }
    let result = run_mke2fs(Some(&staging), output, size_bytes);
    let _ = std::fs::remove_dir_all(&staging);
    result
}

fn tempfile_dir_next_to(output: &Path) -> ArcaResult<PathBuf> {
    let parent = output.parent().unwrap_or(Path::new("."));
    std::fs::create_dir_all(parent)
        .map_err(|e| ArcaError::Dependency(format!("failed to create {}: {e}", parent.display())))?;
    let staging = parent.join(".mkfs-seed");
    std::fs::create_dir_all(&staging).map_err(|e| {
        ArcaError::Dependency(format!("failed to create {}: {e}", staging.display()))
    })?;
    Ok(staging)
}

/// Drive mke2fs. `-m 0` drops the reserved-block percentage and
/// `root_owner=0:0` makes the root inode container-friendly.
fn run_mke2fs(source: Option<&Path>, output: &Path, size_bytes: u64) -> ArcaResult<()> {
    let size_blocks = size_bytes / BLOCK_SIZE;

    if let Some(parent) = output.parent() {
        std::fs::create_dir_all(parent).map_err(|e| {
            ArcaError::Dependency(format!("failed to create {}: {e}", parent.display()))
        })?;
    }

    let output_str = output
        .to_str()
        .ok_or_else(|| ArcaError::InvalidArgument(format!("invalid path: {}", output.display())))?;

    let mke2fs = mke2fs_path()?;
    let mut cmd = Command::new(&mke2fs);
    cmd.args(["-t", "ext4", "-b", "4096"]);
    if let Some(source) = source {
        let source_str = source.to_str().ok_or_else(|| {
            ArcaError::InvalidArgument(format!("invalid path: {}", source.display()))
        })?;
        cmd.args(["-d", source_str]);
    }
    cmd.args(["-m", "0", "-E", "root_owner=0:0", "-F", "-q", output_str]);
    cmd.arg(size_blocks.to_string());

    let result = cmd.output().map_err(|e| {
        ArcaError::Dependency(format!("failed to run mke2fs ({}): {e}", mke2fs.display()))
    })?;

    if !result.status.success() {
        let stderr = String::from_utf8_lossy(&result.stderr);
        return Err(ArcaError::Dependency(format!(
            "mke2fs failed with exit code {:?}: {stderr}",
            result.status.code()
        )));
    }

    Ok(())
}

/// Set uid/gid to 0:0 for every inode via debugfs.
///
/// `root_owner=0:0` only covers the root inode; files populated with `-d`
/// keep the invoking user's ownership.
fn fix_ownership_with_debugfs(image_path: &Path, source_dir: &Path) -> ArcaResult<()> {
    let current_uid = unsafe { libc::getuid() };
    let current_gid = unsafe { libc::getgid() };
    if current_uid == 0 && current_gid == 0 {
        tracing::debug!("running as root, skipping debugfs ownership fix");
        return Ok(());
    }

    let mut commands = String::new();
    let mut count = 0usize;
    for entry in WalkDir::new(source_dir).follow_links(false) {
        let entry = entry
            .map_err(|e| ArcaError::Dependency(format!("failed to walk directory: {e}")))?;

        let rel_path = entry.path().strip_prefix(source_dir).unwrap_or(entry.path());
        if rel_path.as_os_str().is_empty() {
            continue;
        }

        let ext4_path = format!("/{}", rel_path.display());
        commands.push_str(&format!("sif {ext4_path} uid 0\n"));
        commands.push_str(&format!("sif {ext4_path} gid 0\n"));
        count += 1;
    }

    if count == 0 {
        return Ok(());
    }

    let debugfs = debugfs_path()?;
    let mut child = Command::new(&debugfs)
        .args(["-w", "-f", "-"])
        .arg(image_path)
        .stdin(std::process::Stdio::piped())
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::piped())
        .spawn()
        .map_err(|e| ArcaError::Dependency(format!("failed to spawn debugfs: {e}")))?;

    use std::io::Write;
    if let Some(mut stdin) = child.stdin.take() {
        stdin
            .write_all(commands.as_bytes())
            .map_err(|e| ArcaError::Dependency(format!("failed to write debugfs commands: {e}")))?;
    }

    let result = child
        .wait_with_output()
        .map_err(|e| ArcaError::Dependency(format!("failed to wait for debugfs: {e}")))?;

    if !result.status.success() {
        let stderr = String::from_utf8_lossy(&result.stderr);
        tracing::warn!(files = count, "debugfs ownership fix had errors: {stderr}");
    } else {
        tracing::debug!(files = count, "fixed image ownership to 0:0");
    }

    Ok(())
}
