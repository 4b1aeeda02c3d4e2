use crate::chain::{ArtifactKind, TRACK_PREFIX};
use crate::commands::ToolRunner;
use crate::dependencies::installation_hint;
use crate::error::{RescueError, RescueResult};
use crate::paths;
use serde::Serialize;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// Preferred recovery tool, then the fallback used when it is not installed.
pub const RECOVERY_TOOLS: [&str; 2] = ["dvdisaster", "iso-read"];

/// Whether a finished candidate left real data behind.
pub fn artifact_has_data(kind: ArtifactKind, path: &Path) -> bool {
    match kind {
        ArtifactKind::ImageFile => std::fs::metadata(path)
            .map(|m| m.is_file() && m.len() > 0)
            .unwrap_or(false),
        ArtifactKind::TrackDirectory => match std::fs::read_dir(path) {
            Ok(entries) => entries.flatten().any(|entry| {
                entry.file_name().to_string_lossy().starts_with(TRACK_PREFIX)
                    && entry
                        .metadata()
                        .map(|m| m.is_file() && m.len() > 0)
                        .unwrap_or(false)
            }),
            Err(_) => false,
        },
        ArtifactKind::BackupDirectory => WalkDir::new(path)
            .into_iter()
            .filter_map(|e| e.ok())
            .any(|e| {
                e.file_type().is_file() && e.metadata().map(|m| m.len() > 0).unwrap_or(false)
            }),
    }
}

/// Mount the image read-only at a private scratch directory and unmount it
/// again. Returns false when the mount is refused.
///
/// The scratch directory is removed when this returns, whatever the outcome.
pub fn verify(runner: &dyn ToolRunner, artifact: &Path) -> RescueResult<bool> {
    info!("Verifying image: {}", artifact.display());

    if !artifact.is_file() {
        return Err(RescueError::InvalidArtifact(artifact.to_path_buf()));
    }
    for tool in ["mount", "umount"] {
        if !runner.is_available(tool) {
            return Err(RescueError::ToolMissing {
                tool: tool.to_string(),
                hint: installation_hint(tool),
            });
        }
    }

    let scratch = TempDir::with_prefix("discrescue-mount-")?;
    let mountpoint = scratch.path().to_string_lossy().to_string();
    let image = artifact.to_string_lossy().to_string();

    let mount_args = vec![
        "-o".to_string(),
        "loop,ro".to_string(),
        image,
        mountpoint.clone(),
    ];
    let mounted = match runner.run("mount", &mount_args) {
        Ok(output) if output.success => true,
        Ok(output) => {
            warn!("mount refused {}: {}", artifact.display(), output.stderr.trim());
            false
        }
        Err(e) => {
            warn!("mount could not be run: {:#}", e);
            false
        }
    };

    if mounted {
        match runner.run("umount", &[mountpoint]) {
            Ok(output) if output.success => debug!("Scratch mount released"),
            Ok(output) => warn!("umount failed: {}", output.stderr.trim()),
            Err(e) => warn!("umount could not be run: {:#}", e),
        }
        info!("Image mounted successfully");
    }

    if let Err(e) = scratch.close() {
        warn!("Failed to remove scratch mount point: {}", e);
    }
    Ok(mounted)
}

/// Result of one best-effort recovery pass.
#[derive(Debug, Clone, Serialize)]
pub struct RecoveryAttempt {
    pub source: PathBuf,
    pub output: PathBuf,
    pub tool: String,
    pub succeeded: bool,
    pub message: String,
}

impl RecoveryAttempt {
    pub fn ensure_succeeded(self) -> RescueResult<Self> {
        if self.succeeded {
            Ok(self)
        } else {
            Err(RescueError::RecoveryFailed {
                tool: self.tool,
                message: self.message,
            })
        }
    }
}

/// Run a single recovery pass over `artifact`, writing `<stem>-recovered.<ext>`
/// next to it. Not retried.
pub fn recover(runner: &dyn ToolRunner, artifact: &Path) -> RescueResult<RecoveryAttempt> {
    if !artifact.is_file() {
        return Err(RescueError::InvalidArtifact(artifact.to_path_buf()));
    }
    let output = paths::recovered_path_for(artifact)
        .ok_or_else(|| RescueError::InvalidArtifact(artifact.to_path_buf()))?;

    let tool = RECOVERY_TOOLS
        .iter()
        .copied()
        .find(|tool| runner.is_available(tool))
        .ok_or_else(|| RescueError::ToolMissing {
            tool: RECOVERY_TOOLS[0].to_string(),
            hint: installation_hint(RECOVERY_TOOLS[0]),
        })?;
    if tool != RECOVERY_TOOLS[0] {
        warn!("{} not installed, falling back to {}", RECOVERY_TOOLS[0], tool);
    }

    let source = artifact.to_string_lossy().to_string();
    let target = output.to_string_lossy().to_string();
    let args = match tool {
        "dvdisaster" => vec!["-r".to_string(), "-i".to_string(), source, "-o".to_string(), target],
        _ => vec!["-i".to_string(), source, "-o".to_string(), target],
    };

    info!("Attempting recovery of {} with {}", artifact.display(), tool);
    let (succeeded, message) = match runner.run(tool, &args) {
        Ok(result) if result.success => (true, format!("Recovered image written to {}", output.display())),
        Ok(result) => (false, result.combined().trim().to_string()),
        Err(e) => (false, format!("{:#}", e)),
    };
    if succeeded {
        info!("Recovery with {} completed", tool);
    } else {
        warn!("Recovery with {} failed: {}", tool, message);
    }

    Ok(RecoveryAttempt {
        source: artifact.to_path_buf(),
        output,
        tool: tool.to_string(),
        succeeded,
        message,
    })
}
