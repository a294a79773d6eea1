//! Small host-side helpers.

use arca_shared::{ArcaError, ArcaResult};
use std::path::PathBuf;

/// Locate an external binary on PATH or in the usual sbin locations.
pub fn find_binary(name: &str) -> ArcaResult<PathBuf> {
    if let Ok(path_var) = std::env::var("PATH") {
        for dir in std::env::split_paths(&path_var) {
            let candidate = dir.join(name);
            if candidate.is_file() {
                return Ok(candidate);
            }
        }
    }

    // mke2fs and friends often live outside the default user PATH.
    for dir in [
        "/usr/local/sbin",
        "/usr/sbin",
        "/sbin",
        "/opt/homebrew/sbin",
        "/opt/homebrew/opt/e2fsprogs/sbin",
        "/usr/local/opt/e2fsprogs/sbin",
    ] {
        let candidate = PathBuf::from(dir).join(name);
        if candidate.is_file() {
            return Ok(candidate);
        }
    }

    Err(ArcaError::Dependency(format!(
        "required binary {name:?} not found on PATH"
    )))
}

/// Check whether a process exists without signalling it.
pub fn is_process_alive(pid: u32) -> bool {
    unsafe { libc::kill(pid as i32, 0) == 0 }
}
