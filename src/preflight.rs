use crate::error::{RescueError, RescueResult};
use rustix::fs::Access;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Largest common optical medium (dual-layer DVD) rounded up to 8 GiB.
pub const DEFAULT_MIN_FREE_BYTES: u64 = 8 * 1024 * 1024 * 1024;

/// Directory the artifact will be written into.
pub fn target_dir(artifact: &Path) -> RescueResult<PathBuf> {
    if artifact.file_name().is_none() {
        return Err(RescueError::InvalidArtifact(artifact.to_path_buf()));
    }
    match artifact.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => Ok(parent.to_path_buf()),
        _ => Ok(PathBuf::from(".")),
    }
}

/// Create `dir` if needed and make sure we may write into it.
pub fn check_writable_directory(dir: &Path) -> RescueResult<()> {
    if !dir.is_dir() {
        std::fs::create_dir_all(dir).map_err(|e| {
            warn!("Failed to create {}: {}", dir.display(), e);
            RescueError::NotWritable(dir.to_path_buf())
        })?;
    }
    rustix::fs::access(dir, Access::WRITE_OK).map_err(|e| {
        debug!("access({}) failed: {}", dir.display(), e);
        RescueError::NotWritable(dir.to_path_buf())
    })
}

/// Bytes available to unprivileged writers on the volume holding `dir`.
pub fn available_space(dir: &Path) -> RescueResult<u64> {
    let stat = rustix::fs::statvfs(dir).map_err(std::io::Error::from)?;
    Ok(stat.f_bavail.saturating_mul(stat.f_frsize))
}

pub fn check_free_space(dir: &Path, required: u64) -> RescueResult<()> {
    let available = available_space(dir)?;
    debug!("{} bytes free in {}", available, dir.display());
    if available <= required {
        return Err(RescueError::InsufficientSpace {
            path: dir.to_path_buf(),
            available,
            required,
        });
    }
    Ok(())
}

/// An existing artifact may only be replaced with the caller's consent.
/// Continuing a partial rescue reuses the file and needs no consent.
pub fn check_overwrite(artifact: &Path, confirmed: bool, resuming: bool) -> RescueResult<()> {
    if artifact.exists() && !confirmed && !resuming {
        return Err(RescueError::OverwriteNotConfirmed(artifact.to_path_buf()));
    }
    Ok(())
}

/// All job-start preconditions, in order: overwrite consent, writable
/// target directory, free space.
pub fn check_job_preconditions(
    artifact: &Path,
    overwrite_confirmed: bool,
    resuming: bool,
    min_free_bytes: u64,
) -> RescueResult<()> {
    check_overwrite(artifact, overwrite_confirmed, resuming)?;
    let dir = target_dir(artifact)?;
    check_writable_directory(&dir)?;
    check_free_space(&dir, min_free_bytes)
}

/// Raw device access generally needs root.
pub fn running_as_root() -> bool {
    rustix::process::geteuid().is_root()
}
