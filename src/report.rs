use crate::chain::ArtifactKind;
use crate::paths;
use crate::supervisor::JobOutcome;
use crate::verify::RecoveryAttempt;
use anyhow::{Context, Result};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use tracing::debug;
use walkdir::WalkDir;

#[derive(Debug, Clone, Serialize)]
pub struct RescueReport {
    pub job: JobOutcome,
    /// RFC 3339, local time
    pub finished_at: String,
    pub size_bytes: u64,
    /// Only computed for image files.
    pub sha256: Option<String>,
    pub verified: Option<bool>,
    pub recovery: Option<RecoveryAttempt>,
}

impl RescueReport {
    pub fn new(job: JobOutcome) -> Result<Self> {
        let size_bytes = artifact_size(job.kind, &job.artifact);
        let sha256 = match job.kind {
            ArtifactKind::ImageFile => Some(calculate_sha256(&job.artifact)?),
            _ => None,
        };
        Ok(Self {
            job,
            finished_at: chrono::Local::now().to_rfc3339(),
            size_bytes,
            sha256,
            verified: None,
            recovery: None,
        })
    }

    pub fn with_verification(mut self, verified: bool) -> Self {
        self.verified = Some(verified);
        self
    }

    pub fn with_recovery(mut self, attempt: RecoveryAttempt) -> Self {
        self.recovery = Some(attempt);
        self
    }

    /// Write the report beside the artifact and return its path.
    pub fn write(&self) -> Result<PathBuf> {
        let path = report_path_for(&self.job.artifact);
        let json = serde_json::to_string_pretty(self).context("Failed to serialize report")?;
        fs::write(&path, json)
            .with_context(|| format!("Failed to write report: {}", path.display()))?;
        debug!("Wrote rescue report: {}", path.display());
        Ok(path)
    }
}

/// `disc.iso` -> `disc.iso.report.json`
pub fn report_path_for(artifact: &Path) -> PathBuf {
    paths::sibling_with_suffix(artifact, ".report.json")
}

/// Total bytes of the artifact; directories are summed recursively.
pub fn artifact_size(kind: ArtifactKind, path: &Path) -> u64 {
    match kind {
        ArtifactKind::ImageFile => fs::metadata(path).map(|m| m.len()).unwrap_or(0),
        ArtifactKind::TrackDirectory | ArtifactKind::BackupDirectory => WalkDir::new(path)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .filter_map(|e| e.metadata().ok())
            .map(|m| m.len())
            .sum(),
    }
}

pub fn calculate_sha256(file_path: &Path) -> Result<String> {
    debug!("Calculating SHA256 for: {}", file_path.display());

    let mut file = fs::File::open(file_path)
        .with_context(|| format!("Failed to open file: {}", file_path.display()))?;

    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; 256 * 1024];

    loop {
        let n = file.read(&mut buffer)?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }

    Ok(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::MediaCategory;
    use std::time::{Duration, SystemTime};
    use tempfile::TempDir;

    fn outcome(artifact: &Path, kind: ArtifactKind) -> JobOutcome {
        JobOutcome {
            id: uuid::Uuid::new_v4(),
            device: "/dev/sr0".to_string(),
            artifact: artifact.to_path_buf(),
            category: MediaCategory::DataDisc,
            kind,
            candidate_index: 1,
            candidate_count: 3,
            description: "ddrescue (fast pass, no scraping, 1 retry)".to_string(),
            command_line: "ddrescue --force -n -r1 /dev/sr0 disc.iso disc.iso.map".to_string(),
            chain_advances: 1,
            stuck: false,
            started_at: SystemTime::now(),
            elapsed: Duration::from_secs(42),
        }
    }

    #[test]
    fn test_sha256_of_known_content() -> Result<()> {
        let temp = TempDir::new()?;
        let file = temp.path().join("hello.txt");
        fs::write(&file, b"hello")?;
        assert_eq!(
            calculate_sha256(&file)?,
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
        Ok(())
    }

    #[test]
    fn test_report_written_beside_image() -> Result<()> {
        let temp = TempDir::new()?;
        let artifact = temp.path().join("disc.iso");
        fs::write(&artifact, b"hello")?;

        let report = RescueReport::new(outcome(&artifact, ArtifactKind::ImageFile))?
            .with_verification(true);
        let path = report.write()?;

        assert_eq!(path, temp.path().join("disc.iso.report.json"));
        let value: serde_json::Value = serde_json::from_str(&fs::read_to_string(&path)?)?;
        assert_eq!(value["size_bytes"], 5);
        assert_eq!(value["verified"], true);
        assert_eq!(value["job"]["chain_advances"], 1);
        assert_eq!(value["job"]["category"], "data-disc");
        assert!(value["sha256"].as_str().is_some());
        Ok(())
    }

    #[test]
    fn test_directory_artifacts_are_summed_without_hash() -> Result<()> {
        let temp = TempDir::new()?;
        let tracks = temp.path().join("audio");
        fs::create_dir(&tracks)?;
        fs::write(tracks.join("track01.cdda.wav"), b"abc")?;
        fs::write(tracks.join("track02.cdda.wav"), b"defg")?;

        let report = RescueReport::new(outcome(&tracks, ArtifactKind::TrackDirectory))?;
        assert_eq!(report.size_bytes, 7);
        assert!(report.sha256.is_none());
        Ok(())
    }
}
