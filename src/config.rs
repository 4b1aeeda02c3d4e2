use crate::chain::{RescueMethod, RescueOptions, DEFAULT_COPY_BLOCK_SIZE};
use crate::devices::DEFAULT_DEVICE_PATHS;
use crate::paths;
use crate::preflight::DEFAULT_MIN_FREE_BYTES;
use crate::supervisor::SupervisorSettings;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Optical drive (first existing default path, else /dev/sr0)
    #[serde(default = "default_device")]
    pub device: String,

    /// Where rescued images and directories are written
    #[serde(default = "default_output_dir")]
    pub output_dir: String,

    /// Rescue method for data discs: "ddrescue" or "dd"
    #[serde(default = "default_method")]
    pub method: RescueMethod,

    /// ddrescue options
    #[serde(default)]
    pub options: RescueOptions,

    #[serde(default)]
    pub classifier: ClassifierConfig,

    #[serde(default)]
    pub supervisor: SupervisorConfig,

    #[serde(default)]
    pub preflight: PreflightConfig,

    /// Block size for the straight dd copy
    #[serde(default = "default_copy_block_size")]
    pub copy_block_size: String,

    /// Eject the disc after a successful rescue
    #[serde(default)]
    pub eject_after_success: bool,

    /// Write a JSON report next to each rescued artifact
    #[serde(default = "default_true")]
    pub write_report: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassifierConfig {
    /// Filesystem signature probe attempts
    #[serde(default = "default_attempts")]
    pub attempts: u32,

    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            attempts: default_attempts(),
            retry_delay_ms: default_retry_delay_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisorConfig {
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Seconds between SIGTERM and SIGKILL on cancellation
    #[serde(default = "default_termination_grace_secs")]
    pub termination_grace_secs: u64,

    #[serde(default = "default_reader_drain_secs")]
    pub reader_drain_secs: u64,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            termination_grace_secs: default_termination_grace_secs(),
            reader_drain_secs: default_reader_drain_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreflightConfig {
    /// Free bytes required on the target volume
    #[serde(default = "default_min_free_bytes")]
    pub min_free_bytes: u64,
}

impl Default for PreflightConfig {
    fn default() -> Self {
        Self {
            min_free_bytes: default_min_free_bytes(),
        }
    }
}

fn default_device() -> String {
    DEFAULT_DEVICE_PATHS
        .iter()
        .find(|path| Path::new(path).exists())
        .unwrap_or(&DEFAULT_DEVICE_PATHS[0])
        .to_string()
}

fn default_output_dir() -> String {
    "~".to_string()
}

fn default_method() -> RescueMethod {
    RescueMethod::Ddrescue
}

fn default_copy_block_size() -> String {
    DEFAULT_COPY_BLOCK_SIZE.to_string()
}

fn default_true() -> bool {
    true
}

fn default_attempts() -> u32 {
    3
}

fn default_retry_delay_ms() -> u64 {
    1000
}

fn default_poll_interval_ms() -> u64 {
    100
}

fn default_termination_grace_secs() -> u64 {
    10
}

fn default_reader_drain_secs() -> u64 {
    5
}

fn default_min_free_bytes() -> u64 {
    DEFAULT_MIN_FREE_BYTES
}

impl Default for Config {
    fn default() -> Self {
        Self {
            device: default_device(),
            output_dir: default_output_dir(),
            method: default_method(),
            options: RescueOptions::default(),
            classifier: ClassifierConfig::default(),
            supervisor: SupervisorConfig::default(),
            preflight: PreflightConfig::default(),
            copy_block_size: default_copy_block_size(),
            eject_after_success: false,
            write_report: default_true(),
        }
    }
}

impl Config {
    /// Load config from file, or return default if file doesn't exist.
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_file_path()?)
    }

    pub fn load_from(config_path: &Path) -> Result<Self> {
        if !config_path.exists() {
            return Ok(Self::default());
        }

        let contents = std::fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

        let config: Config = toml::from_str(&contents).context("Failed to parse config file")?;

        Ok(config)
    }

    /// Save config to file.
    pub fn save(&self) -> Result<()> {
        paths::ensure_config_dir()?;
        self.save_to(&Self::config_file_path()?)
    }

    pub fn save_to(&self, config_path: &Path) -> Result<()> {
        let contents = toml::to_string_pretty(self).context("Failed to serialize config")?;

        std::fs::write(config_path, contents)
            .with_context(|| format!("Failed to write config file: {}", config_path.display()))?;

        Ok(())
    }

    /// Get the config file path.
    pub fn config_file_path() -> Result<PathBuf> {
        Ok(paths::config_dir()?.join("config.toml"))
    }

    pub fn output_dir(&self) -> PathBuf {
        paths::expand_tilde(&self.output_dir)
    }

    /// Timestamped image path inside the output directory.
    pub fn default_artifact_path(&self) -> PathBuf {
        self.output_dir().join(paths::generate_artifact_name())
    }

    pub fn classifier_retry_delay(&self) -> Duration {
        Duration::from_millis(self.classifier.retry_delay_ms)
    }

    pub fn supervisor_settings(&self) -> SupervisorSettings {
        SupervisorSettings {
            poll_interval: Duration::from_millis(self.supervisor.poll_interval_ms),
            termination_grace: Duration::from_secs(self.supervisor.termination_grace_secs),
            reader_drain: Duration::from_secs(self.supervisor.reader_drain_secs),
            min_free_bytes: self.preflight.min_free_bytes,
        }
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.device.trim().is_empty() {
            anyhow::bail!("Device path must not be empty");
        }
        if self.classifier.attempts == 0 {
            anyhow::bail!("classifier.attempts must be at least 1");
        }
        if self.supervisor.poll_interval_ms == 0 {
            anyhow::bail!("supervisor.poll_interval_ms must be greater than 0");
        }
        if self.supervisor.termination_grace_secs == 0 {
            anyhow::bail!("supervisor.termination_grace_secs must be greater than 0");
        }
        if self.supervisor.reader_drain_secs == 0 {
            anyhow::bail!("supervisor.reader_drain_secs must be greater than 0");
        }
        if !is_valid_block_size(&self.copy_block_size) {
            anyhow::bail!(
                "Invalid copy_block_size '{}' (expected e.g. 2048, 64K or 1M)",
                self.copy_block_size
            );
        }
        Ok(())
    }
}

/// dd-style size: a positive number with an optional unit suffix.
fn is_valid_block_size(size: &str) -> bool {
    const SUFFIXES: &[&str] = &[
        "", "c", "w", "b", "k", "K", "kB", "KB", "KiB", "M", "MB", "MiB", "G", "GB", "GiB",
    ];
    let digits_end = size
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(size.len());
    let (number, suffix) = size.split_at(digits_end);
    matches!(number.parse::<u64>(), Ok(n) if n > 0) && SUFFIXES.contains(&suffix)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.device.starts_with("/dev/"));
        assert_eq!(config.method, RescueMethod::Ddrescue);
        assert_eq!(config.classifier.attempts, 3);
        assert_eq!(config.preflight.min_free_bytes, 8 * 1024 * 1024 * 1024);
        assert!(config.options.fixed_block_size_2048);
        assert!(config.options.direct_access_mode);
        assert!(config.write_report);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_deserialization() {
        let toml_str = r#"
device = "/dev/sr1"
method = "dd"
copy_block_size = "64K"

[options]
retry_bad_sectors_thrice = true
direct_access_mode = false

[supervisor]
termination_grace_secs = 3
"#;
        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.device, "/dev/sr1");
        assert_eq!(config.method, RescueMethod::Dd);
        assert!(config.options.retry_bad_sectors_thrice);
        assert!(config.options.fixed_block_size_2048);
        assert!(!config.options.direct_access_mode);
        assert_eq!(config.supervisor_settings().termination_grace, Duration::from_secs(3));
        assert_eq!(config.supervisor.poll_interval_ms, 100);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_save_and_load_round_trip() -> Result<()> {
        let temp = TempDir::new()?;
        let path = temp.path().join("config.toml");
        let mut config = Config::default();
        config.output_dir = "/srv/rescue".to_string();
        config.eject_after_success = true;
        config.save_to(&path)?;

        let loaded = Config::load_from(&path)?;
        assert_eq!(loaded.output_dir, "/srv/rescue");
        assert!(loaded.eject_after_success);
        Ok(())
    }

    #[test]
    fn test_missing_file_gives_defaults() -> Result<()> {
        let temp = TempDir::new()?;
        let config = Config::load_from(&temp.path().join("absent.toml"))?;
        assert_eq!(config.classifier.retry_delay_ms, 1000);
        Ok(())
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = Config::default();
        config.classifier.attempts = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.copy_block_size = "1X".to_string();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.supervisor.termination_grace_secs = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.supervisor.reader_drain_secs = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_block_size_strings() {
        for ok in ["1M", "2048", "64K", "4KiB", "1GB"] {
            assert!(is_valid_block_size(ok), "{}", ok);
        }
        for bad in ["", "M", "0", "1.5M", "-1M", "1X"] {
            assert!(!is_valid_block_size(bad), "{}", bad);
        }
    }

    #[test]
    fn test_default_artifact_path() {
        let mut config = Config::default();
        config.output_dir = "/srv/rescue".to_string();
        let path = config.default_artifact_path();
        assert!(path.starts_with("/srv/rescue"));
        assert!(path.to_string_lossy().ends_with("_ddrescue.iso"));
    }
}
