pub mod chain;
pub mod commands;
pub mod config;
pub mod dependencies;
pub mod devices;
pub mod engine;
pub mod error;
pub mod logging;
pub mod media;
pub mod paths;
pub mod preflight;
pub mod progress;
pub mod report;
pub mod supervisor;
pub mod verify;

pub use chain::{build_chain, CommandCandidate, FallbackChain, Preset, RescueMethod, RescueOptions};
pub use commands::{SystemRunner, ToolRunner};
pub use config::Config;
pub use devices::Device;
pub use engine::{RescueEngine, RescuePlan};
pub use error::{RescueError, RescueResult};
pub use media::{Classification, MediaCategory};
pub use progress::ProgressSample;
pub use supervisor::{JobHandle, JobOutcome, JobSinks, JobState, JobStatus, Supervisor};
pub use verify::RecoveryAttempt;
