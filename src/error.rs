use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RescueError {
    /// A required external tool is not installed
    #[error("Required tool is not installed: {tool}{}", .hint.map(|h| format!(" ({})", h)).unwrap_or_default())]
    ToolMissing {
        tool: String,
        hint: Option<&'static str>,
    },

    /// The "no device" sentinel was selected
    #[error("No optical drive selected. Please check your hardware.")]
    DeviceAbsent,

    /// The drive did not return a single readable sector
    #[error("No media detected in {device}. Please insert a disc and try again.")]
    MediaAbsent { device: String },

    /// No command builder exists for the media category
    #[error("Unsupported media type: {0}")]
    UnsupportedMedia(String),

    #[error("Not enough free space in {}: {available} bytes available, {required} bytes required", .path.display())]
    InsufficientSpace {
        path: PathBuf,
        available: u64,
        required: u64,
    },

    #[error("Target directory is not writable: {}", .0.display())]
    NotWritable(PathBuf),

    /// The artifact already exists and the caller did not confirm overwriting it
    #[error("{} already exists; overwrite was not confirmed", .0.display())]
    OverwriteNotConfirmed(PathBuf),

    /// Another job already holds the job slot
    #[error("A rescue job is already running ({0})")]
    JobActive(String),

    /// The builder produced no candidates
    #[error("No command candidates for {0}")]
    EmptyChain(String),

    /// A single candidate exited with a failure status
    #[error("Candidate '{description}' failed (exit code: {exit_code:?})")]
    CandidateFailed {
        description: String,
        exit_code: Option<i32>,
    },

    /// A candidate exited cleanly but produced no data
    #[error("Candidate '{description}' produced an empty artifact: {}", .artifact.display())]
    ZeroByteArtifact {
        description: String,
        artifact: PathBuf,
    },

    #[error("All {attempted} candidates failed for {}", .artifact.display())]
    ChainExhausted { artifact: PathBuf, attempted: usize },

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Artifact could not be mounted: {}", .0.display())]
    VerificationFailed(PathBuf),

    #[error("Recovery with {tool} failed: {message}")]
    RecoveryFailed { tool: String, message: String },

    #[error("Invalid artifact path: {}", .0.display())]
    InvalidArtifact(PathBuf),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl RescueError {
    /// Per-candidate failures are recoverable by advancing the chain.
    pub fn is_candidate_failure(&self) -> bool {
        matches!(
            self,
            RescueError::CandidateFailed { .. } | RescueError::ZeroByteArtifact { .. }
        )
    }

    /// Errors raised before a job ever acquired the slot.
    pub fn is_precondition(&self) -> bool {
        matches!(
            self,
            RescueError::ToolMissing { .. }
                | RescueError::DeviceAbsent
                | RescueError::MediaAbsent { .. }
                | RescueError::UnsupportedMedia(_)
                | RescueError::InsufficientSpace { .. }
                | RescueError::NotWritable(_)
                | RescueError::OverwriteNotConfirmed(_)
                | RescueError::JobActive(_)
        )
    }
}

pub type RescueResult<T> = std::result::Result<T, RescueError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_candidate_failures_are_recoverable() {
        let failed = RescueError::CandidateFailed {
            description: "ddrescue".to_string(),
            exit_code: Some(1),
        };
        let empty = RescueError::ZeroByteArtifact {
            description: "ddrescue".to_string(),
            artifact: PathBuf::from("/tmp/disc.iso"),
        };
        assert!(failed.is_candidate_failure());
        assert!(empty.is_candidate_failure());
        assert!(!RescueError::Cancelled.is_candidate_failure());
    }

    #[test]
    fn test_precondition_classification() {
        assert!(RescueError::DeviceAbsent.is_precondition());
        assert!(RescueError::UnsupportedMedia("Unknown".into()).is_precondition());
        assert!(!RescueError::Cancelled.is_precondition());
        assert!(!RescueError::ChainExhausted {
            artifact: PathBuf::from("/tmp/x.iso"),
            attempted: 3
        }
        .is_precondition());
    }

    #[test]
    fn test_tool_missing_message_includes_hint() {
        let err = RescueError::ToolMissing {
            tool: "ddrescue".to_string(),
            hint: Some("sudo apt install gddrescue"),
        };
        let msg = err.to_string();
        assert!(msg.contains("ddrescue"));
        assert!(msg.contains("gddrescue"));
    }
}
