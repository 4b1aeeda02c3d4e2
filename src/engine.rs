use crate::chain::{self, FallbackChain, RescueMethod, RescueOptions};
use crate::commands::{SystemRunner, ToolRunner};
use crate::config::Config;
use crate::dependencies;
use crate::devices::{self, Device};
use crate::error::{RescueError, RescueResult};
use crate::media::{Classification, Classifier, MediaCategory, SystemProbe};
use crate::report::RescueReport;
use crate::supervisor::{JobHandle, JobOutcome, JobSinks, JobState, JobStatus, Supervisor};
use crate::verify::{self, RecoveryAttempt};
use anyhow::Result;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

/// Everything decided before a job starts.
#[derive(Debug, Clone)]
pub struct RescuePlan {
    pub classification: Classification,
    pub chain: FallbackChain,
}

pub struct RescueEngine {
    config: Config,
    runner: Arc<dyn ToolRunner>,
    supervisor: Supervisor,
}

impl RescueEngine {
    pub fn new(config: Config) -> Self {
        Self::with_runner(config, Arc::new(SystemRunner))
    }

    pub fn with_runner(config: Config, runner: Arc<dyn ToolRunner>) -> Self {
        let supervisor = Supervisor::new(config.supervisor_settings());
        Self {
            config,
            runner,
            supervisor,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Shared handle to the job slot, e.g. for a signal handler.
    pub fn supervisor(&self) -> Supervisor {
        self.supervisor.clone()
    }

    pub fn list_devices(&self) -> Vec<Device> {
        devices::list_devices(self.runner.as_ref())
    }

    pub fn classify(&self, device: &str) -> Classification {
        let classifier = Classifier::new(
            SystemProbe::new(self.runner.as_ref()),
            self.config.classifier.attempts,
            self.config.classifier_retry_delay(),
        );
        classifier.classify(device)
    }

    pub fn ensure_tools(&self, category: MediaCategory, method: RescueMethod) -> RescueResult<()> {
        dependencies::require_tools_for(self.runner.as_ref(), category, method)
    }

    pub fn ensure_media_present(&self, device: &str) -> RescueResult<()> {
        devices::check_media_present(self.runner.as_ref(), device)
    }

    pub fn build_chain(
        &self,
        category: MediaCategory,
        method: RescueMethod,
        options: &RescueOptions,
        device: &str,
        artifact: &Path,
    ) -> RescueResult<FallbackChain> {
        chain::build_chain_with_block_size(
            category,
            method,
            options,
            device,
            artifact,
            &self.config.copy_block_size,
        )
    }

    /// Device check, media check, classification (unless `category` is
    /// given), tool check and chain construction, in that order. Nothing is
    /// started.
    pub fn plan(
        &self,
        device: &Device,
        category: Option<MediaCategory>,
        method: RescueMethod,
        options: &RescueOptions,
        artifact: &Path,
    ) -> RescueResult<RescuePlan> {
        let device = device.require_path()?;
        self.ensure_media_present(device)?;

        let classification = match category {
            Some(category) => Classification {
                category,
                signature: None,
                attempts: 0,
                degraded: false,
            },
            None => self.classify(device),
        };
        if classification.category == MediaCategory::Unknown {
            return Err(RescueError::UnsupportedMedia(classification.category.to_string()));
        }

        self.ensure_tools(classification.category, method)?;
        let artifact = artifact_for(classification.category, artifact);
        let chain = self.build_chain(classification.category, method, options, device, &artifact)?;
        Ok(RescuePlan {
            classification,
            chain,
        })
    }

    pub fn start_job(
        &self,
        chain: FallbackChain,
        sinks: JobSinks,
        overwrite_confirmed: bool,
    ) -> RescueResult<JobHandle> {
        self.supervisor
            .start_job(chain, sinks, overwrite_confirmed)
            .inspect_err(|e| {
                if e.is_precondition() {
                    warn!("Rescue not started: {}", e);
                }
            })
    }

    pub fn cancel_job(&self) -> bool {
        self.supervisor.cancel_job()
    }

    pub fn job_state(&self) -> JobState {
        self.supervisor.job_state()
    }

    pub fn job_status(&self) -> Option<JobStatus> {
        self.supervisor.status()
    }

    pub fn verify(&self, artifact: &Path) -> RescueResult<bool> {
        verify::verify(self.runner.as_ref(), artifact)
    }

    pub fn recover(&self, artifact: &Path) -> RescueResult<RecoveryAttempt> {
        verify::recover(self.runner.as_ref(), artifact)
    }

    pub fn eject(&self, device: &str) -> bool {
        devices::eject(self.runner.as_ref(), device)
    }

    /// Write the JSON report when enabled in the config.
    pub fn write_report(
        &self,
        outcome: &JobOutcome,
        verified: Option<bool>,
        recovery: Option<RecoveryAttempt>,
    ) -> Result<Option<PathBuf>> {
        if !self.config.write_report {
            return Ok(None);
        }
        let mut report = RescueReport::new(outcome.clone())?;
        if let Some(verified) = verified {
            report = report.with_verification(verified);
        }
        if let Some(attempt) = recovery {
            report = report.with_recovery(attempt);
        }
        let path = report.write()?;
        info!("Rescue report written to {}", path.display());
        Ok(Some(path))
    }

    /// Post-run handling from the config: eject when asked to.
    pub fn finish(&self, outcome: &JobOutcome) {
        if self.config.eject_after_success && !self.eject(&outcome.device) {
            warn!("Could not eject {}", outcome.device);
        }
    }
}

/// Audio and video rescues write a directory; drop an image extension the
/// caller may have supplied.
pub fn artifact_for(category: MediaCategory, requested: &Path) -> PathBuf {
    match category {
        MediaCategory::AudioDisc | MediaCategory::VideoDisc => {
            let is_image = requested
                .extension()
                .map(|ext| ext.eq_ignore_ascii_case("iso"))
                .unwrap_or(false);
            if is_image {
                requested.with_extension("")
            } else {
                requested.to_path_buf()
            }
        }
        _ => requested.to_path_buf(),
    }
}
