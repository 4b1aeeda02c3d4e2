use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

/// Resolve the XDG data directory for the application.
/// Defaults to ~/.local/share/discrescue if XDG_DATA_HOME is not set.
pub fn data_dir() -> Result<PathBuf> {
    dirs::data_dir()
        .map(|d| d.join("discrescue"))
        .or_else(|| dirs::home_dir().map(|h| h.join(".local/share/discrescue")))
        .context("Could not determine data directory")
}

/// Resolve the XDG config directory for the application.
/// Defaults to ~/.config/discrescue if XDG_CONFIG_HOME is not set.
pub fn config_dir() -> Result<PathBuf> {
    dirs::config_dir()
        .map(|d| d.join("discrescue"))
        .or_else(|| dirs::home_dir().map(|h| h.join(".config/discrescue")))
        .context("Could not determine config directory")
}

/// Get the default logs directory.
pub fn logs_dir() -> Result<PathBuf> {
    Ok(data_dir()?.join("logs"))
}

/// Ensure a directory exists, creating it if necessary.
pub fn ensure_dir(path: &Path) -> Result<()> {
    std::fs::create_dir_all(path)
        .with_context(|| format!("Failed to create directory: {}", path.display()))
}

/// Ensure the data directory exists.
pub fn ensure_data_dir() -> Result<PathBuf> {
    let dir = data_dir()?;
    ensure_dir(&dir)?;
    ensure_dir(&logs_dir()?)?;
    Ok(dir)
}

/// Ensure the config directory exists.
pub fn ensure_config_dir() -> Result<PathBuf> {
    let dir = config_dir()?;
    ensure_dir(&dir)?;
    Ok(dir)
}

/// Expand user home directory in path (e.g., ~/path -> /home/user/path).
pub fn expand_tilde(path: &str) -> PathBuf {
    if path == "~" {
        if let Some(home) = dirs::home_dir() {
            return home;
        }
    }
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

/// The map file ddrescue keeps next to an image.
pub fn mapfile_for(artifact: &Path) -> PathBuf {
    sibling_with_suffix(artifact, ".map")
}

/// `disc.iso` -> `disc-recovered.iso`, `disc` -> `disc-recovered`.
pub fn recovered_path_for(artifact: &Path) -> Option<PathBuf> {
    let stem = artifact.file_stem()?.to_string_lossy();
    let name = match artifact.extension() {
        Some(ext) => format!("{}-recovered.{}", stem, ext.to_string_lossy()),
        None => format!("{}-recovered", stem),
    };
    Some(artifact.with_file_name(name))
}

/// Append a suffix to the full file name (`disc.iso` -> `disc.iso.map`).
pub fn sibling_with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(suffix);
    PathBuf::from(name)
}

/// Default image name: `YYYYMMDDHHMMSS_ddrescue.iso`.
pub fn generate_artifact_name() -> String {
    chrono::Local::now()
        .format("%Y%m%d%H%M%S_ddrescue.iso")
        .to_string()
}
