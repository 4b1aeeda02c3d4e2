use crate::commands::ToolRunner;
use crate::error::{RescueError, RescueResult};
use serde::Serialize;
use std::fmt;
use std::path::Path;
use tracing::{debug, info, warn};

/// Candidate device nodes, highest priority first.
pub const DEFAULT_DEVICE_PATHS: &[&str] = &["/dev/sr0", "/dev/sr1", "/dev/cdrom", "/dev/dvd"];

/// Label of the sentinel entry returned when no drive exists.
pub const NO_DEVICE_LABEL: &str = "No optical drive found";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum Device {
    Drive { path: String, size_mb: Option<u64> },
    /// Placeholder so a list is never empty; never a real drive.
    NoDevice,
}

impl Device {
    pub fn path(&self) -> Option<&str> {
        match self {
            Device::Drive { path, .. } => Some(path.as_str()),
            Device::NoDevice => None,
        }
    }

    pub fn size_mb(&self) -> Option<u64> {
        match self {
            Device::Drive { size_mb, .. } => *size_mb,
            Device::NoDevice => None,
        }
    }

    pub fn is_absent(&self) -> bool {
        matches!(self, Device::NoDevice)
    }

    /// Resolve to a usable device path, rejecting the sentinel.
    pub fn require_path(&self) -> RescueResult<&str> {
        self.path().ok_or(RescueError::DeviceAbsent)
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Device::Drive {
                path,
                size_mb: Some(size),
            } => write!(f, "{} ({} MB)", path, size),
            Device::Drive { path, size_mb: None } => write!(f, "{}", path),
            Device::NoDevice => write!(f, "{}", NO_DEVICE_LABEL),
        }
    }
}

/// Enumerate the default candidate paths.
pub fn list_devices(runner: &dyn ToolRunner) -> Vec<Device> {
    list_devices_from(runner, DEFAULT_DEVICE_PATHS)
}

/// Enumerate `candidates` in order, keeping the ones that exist.
pub fn list_devices_from(runner: &dyn ToolRunner, candidates: &[&str]) -> Vec<Device> {
    let mut devices: Vec<Device> = candidates
        .iter()
        .filter(|path| Path::new(path).exists())
        .map(|path| Device::Drive {
            path: path.to_string(),
            size_mb: probe_size_mb(runner, path),
        })
        .collect();

    if devices.is_empty() {
        debug!("No optical drive among {:?}", candidates);
        devices.push(Device::NoDevice);
    }
    devices
}

/// Size of the medium in MB via `blockdev --getsize64`. Failures yield `None`.
pub fn probe_size_mb(runner: &dyn ToolRunner, device: &str) -> Option<u64> {
    probe_size_bytes(runner, device).map(|bytes| bytes / (1024 * 1024))
}

pub fn probe_size_bytes(runner: &dyn ToolRunner, device: &str) -> Option<u64> {
    let args = vec!["--getsize64".to_string(), device.to_string()];
    match runner.run("blockdev", &args) {
        Ok(output) if output.success => output.stdout.trim().parse::<u64>().ok(),
        Ok(output) => {
            debug!("blockdev failed for {}: {}", device, output.stderr.trim());
            None
        }
        Err(e) => {
            debug!("Could not probe size of {}: {}", device, e);
            None
        }
    }
}

/// Read one sector to make sure a disc is in the drive.
pub fn check_media_present(runner: &dyn ToolRunner, device: &str) -> RescueResult<()> {
    let args = vec![
        format!("if={}", device),
        "of=/dev/null".to_string(),
        "count=1".to_string(),
    ];
    match runner.run("dd", &args) {
        Ok(output) if output.success => Ok(()),
        Ok(output) => {
            warn!("No readable media in {}: {}", device, output.stderr.trim());
            Err(RescueError::MediaAbsent {
                device: device.to_string(),
            })
        }
        Err(e) => {
            warn!("Media check for {} could not run: {}", device, e);
            Err(RescueError::MediaAbsent {
                device: device.to_string(),
            })
        }
    }
}

/// Eject the tray. Best effort: failures are logged and ignored.
pub fn eject(runner: &dyn ToolRunner, device: &str) -> bool {
    match runner.run("eject", &[device.to_string()]) {
        Ok(output) if output.success => {
            info!("Ejected {}", device);
            true
        }
        Ok(output) => {
            warn!("eject {} failed: {}", device, output.stderr.trim());
            false
        }
        Err(e) => {
            warn!("eject {} could not run: {}", device, e);
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::stub::{failed, ok, ScriptedRunner};
    use tempfile::TempDir;

    #[test]
    fn test_sentinel_when_nothing_exists() {
        let runner = ScriptedRunner::new();
        let devices = list_devices_from(&runner, &["/nonexistent/sr0", "/nonexistent/sr1"]);
        assert_eq!(devices, vec![Device::NoDevice]);
        assert!(devices[0].is_absent());
        assert!(matches!(devices[0].require_path(), Err(RescueError::DeviceAbsent)));
        assert_eq!(devices[0].to_string(), NO_DEVICE_LABEL);
    }

    #[test]
    fn test_existing_paths_keep_priority_order() -> anyhow::Result<()> {
        let temp = TempDir::new()?;
        let first = temp.path().join("sr0");
        let second = temp.path().join("cdrom");
        std::fs::write(&first, b"")?;
        std::fs::write(&second, b"")?;
        let first = first.to_string_lossy().to_string();
        let second = second.to_string_lossy().to_string();

        let runner = ScriptedRunner::new();
        runner.push("blockdev", ok("4700372992\n", ""));
        runner.push("blockdev", failed(1, "No medium found"));

        let devices = list_devices_from(&runner, &[first.as_str(), "/nonexistent/sr1", second.as_str()]);
        assert_eq!(devices.len(), 2);
        assert_eq!(devices[0].path(), Some(first.as_str()));
        assert_eq!(devices[0].size_mb(), Some(4482));
        assert_eq!(devices[1].path(), Some(second.as_str()));
        assert_eq!(devices[1].size_mb(), None);
        assert!(devices[0].to_string().ends_with("(4482 MB)"));
        Ok(())
    }

    #[test]
    fn test_size_probe_ignores_garbage() {
        let runner = ScriptedRunner::new();
        runner.push("blockdev", ok("not a number", ""));
        assert_eq!(probe_size_mb(&runner, "/dev/sr0"), None);
        runner.push_error("blockdev", "spawn failed");
        assert_eq!(probe_size_mb(&runner, "/dev/sr0"), None);
    }

    #[test]
    fn test_media_present() {
        let runner = ScriptedRunner::new();
        runner.push("dd", ok("", "1+0 records in"));
        assert!(check_media_present(&runner, "/dev/sr0").is_ok());
        runner.push("dd", failed(1, "dd: failed to open '/dev/sr0': No medium found"));
        assert!(matches!(
            check_media_present(&runner, "/dev/sr0"),
            Err(RescueError::MediaAbsent { .. })
        ));
    }

    #[test]
    fn test_eject_is_best_effort() {
        let runner = ScriptedRunner::new();
        runner.push("eject", failed(1, "unable to eject"));
        assert!(!eject(&runner, "/dev/sr0"));
        assert!(eject(&runner, "/dev/sr0"));
    }
}
