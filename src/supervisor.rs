//! Single-slot supervision of rescue jobs.
//!
//! A [`Supervisor`] owns one job slot. `start_job` checks the preconditions,
//! takes the slot and hands the chain to a coordinator thread, which runs
//! each candidate in its own process group while a reader thread forwards
//! the combined output to the caller's sinks. Whatever way the coordinator
//! ends, a drop guard puts the slot back.

use crate::chain::{ArtifactKind, CommandCandidate, FallbackChain};
use crate::error::{RescueError, RescueResult};
use crate::media::MediaCategory;
use crate::preflight::{self, DEFAULT_MIN_FREE_BYTES};
use crate::progress::{for_each_line, ProgressSample, ProgressTracker};
use crate::verify::artifact_has_data;
use rustix::process::{kill_process_group, test_kill_process_group, Pid, Signal};
use serde::Serialize;
use std::fmt;
use std::io::{self, BufReader, PipeReader};
use std::os::unix::process::CommandExt;
use std::path::PathBuf;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant, SystemTime};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobState {
    Idle,
    Starting,
    Running,
    Stopping,
    Stopped,
    Succeeded,
    /// The current candidate failed; the chain advances or is exhausted next.
    Failed,
    Exhausted,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Stopped | JobState::Succeeded | JobState::Exhausted)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            JobState::Idle => "idle",
            JobState::Starting => "starting",
            JobState::Running => "running",
            JobState::Stopping => "stopping",
            JobState::Stopped => "stopped",
            JobState::Succeeded => "succeeded",
            JobState::Failed => "failed",
            JobState::Exhausted => "exhausted",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    /// How often the coordinator checks for exit and cancellation.
    pub poll_interval: Duration,
    /// Time between SIGTERM and SIGKILL for the process group.
    pub termination_grace: Duration,
    /// How long to wait for the output reader after the process exits.
    pub reader_drain: Duration,
    pub min_free_bytes: u64,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(100),
            termination_grace: Duration::from_secs(10),
            reader_drain: Duration::from_secs(5),
            min_free_bytes: DEFAULT_MIN_FREE_BYTES,
        }
    }
}

type LogSink = Arc<dyn Fn(&str) + Send + Sync>;
type ProgressSink = Arc<dyn Fn(&ProgressSample) + Send + Sync>;

/// Caller-supplied callbacks. Both are invoked from engine threads.
#[derive(Clone)]
pub struct JobSinks {
    log: LogSink,
    progress: ProgressSink,
}

impl JobSinks {
    pub fn new<L, P>(log: L, progress: P) -> Self
    where
        L: Fn(&str) + Send + Sync + 'static,
        P: Fn(&ProgressSample) + Send + Sync + 'static,
    {
        Self {
            log: Arc::new(log),
            progress: Arc::new(progress),
        }
    }

    pub fn noop() -> Self {
        Self::new(|_| {}, |_| {})
    }

    fn log(&self, line: &str) {
        (self.log)(line)
    }

    fn progress(&self, sample: &ProgressSample) {
        (self.progress)(sample)
    }
}

impl Default for JobSinks {
    fn default() -> Self {
        Self::noop()
    }
}

impl fmt::Debug for JobSinks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobSinks").finish_non_exhaustive()
    }
}

/// Snapshot of the job in the slot.
#[derive(Debug, Clone, Serialize)]
pub struct JobStatus {
    pub id: Uuid,
    pub state: JobState,
    pub device: String,
    pub artifact: PathBuf,
    pub category: MediaCategory,
    pub candidate_index: usize,
    pub candidate_count: usize,
    pub description: String,
    pub progress: Option<ProgressSample>,
    pub chain_advances: usize,
    /// The output reader outlived its drain timeout at least once.
    pub stuck: bool,
    pub started_at: SystemTime,
}

impl JobStatus {
    fn new(chain: &FallbackChain) -> Self {
        Self {
            id: Uuid::new_v4(),
            state: JobState::Starting,
            device: chain.device().to_string(),
            artifact: chain.artifact().to_path_buf(),
            category: chain.category(),
            candidate_index: 0,
            candidate_count: chain.len(),
            description: String::new(),
            progress: None,
            chain_advances: 0,
            stuck: false,
            started_at: SystemTime::now(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed().unwrap_or_default()
    }
}

/// What a succeeded job produced.
#[derive(Debug, Clone, Serialize)]
pub struct JobOutcome {
    pub id: Uuid,
    pub device: String,
    pub artifact: PathBuf,
    pub category: MediaCategory,
    pub kind: ArtifactKind,
    pub candidate_index: usize,
    pub candidate_count: usize,
    pub description: String,
    pub command_line: String,
    pub chain_advances: usize,
    pub stuck: bool,
    pub started_at: SystemTime,
    pub elapsed: Duration,
}

#[derive(Debug)]
struct Shared {
    job: Mutex<Option<JobStatus>>,
    last: Mutex<Option<JobStatus>>,
    stop: AtomicBool,
}

impl Shared {
    fn lock_job(&self) -> MutexGuard<'_, Option<JobStatus>> {
        self.job.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn update<F: FnOnce(&mut JobStatus)>(&self, f: F) {
        if let Some(job) = self.lock_job().as_mut() {
            f(job);
        }
    }

    fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    /// Mark the next candidate as starting. Returns false, leaving the
    /// state alone, when a stop is already pending.
    fn begin_candidate(&self, index: usize, description: &str) -> bool {
        let mut slot = self.lock_job();
        if self.stop_requested() {
            return false;
        }
        if let Some(job) = slot.as_mut() {
            job.state = JobState::Starting;
            job.candidate_index = index;
            job.description = description.to_string();
            job.progress = None;
        }
        true
    }

    /// Move to a terminal state. A stop that raced in first wins.
    fn settle(&self, target: JobState) -> JobState {
        let mut slot = self.lock_job();
        let state = if self.stop_requested() {
            JobState::Stopped
        } else {
            target
        };
        if let Some(job) = slot.as_mut() {
            job.state = state;
        }
        state
    }

    fn snapshot(&self) -> Option<JobStatus> {
        self.lock_job().clone()
    }
}

/// Releases the job slot on every exit path of the coordinator.
struct SlotGuard<'a> {
    shared: &'a Shared,
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        let finished = self.shared.lock_job().take();
        if let Some(mut job) = finished {
            if !job.state.is_terminal() {
                error!("Rescue job {} ended abnormally in state {}", job.id, job.state);
            }
            job.progress = None;
            debug!("Releasing job slot for {}", job.id);
            *self.shared.last.lock().unwrap_or_else(PoisonError::into_inner) = Some(job);
        }
        self.shared.stop.store(false, Ordering::SeqCst);
    }
}

/// Handle to a running job's coordinator.
#[derive(Debug)]
pub struct JobHandle {
    id: Uuid,
    thread: JoinHandle<RescueResult<JobOutcome>>,
}

impl JobHandle {
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Block until the job reaches a terminal state. The slot is already free
    /// when this returns.
    pub fn wait(self) -> RescueResult<JobOutcome> {
        self.thread.join().unwrap_or_else(|_| {
            Err(RescueError::Internal(anyhow::anyhow!(
                "rescue job {} panicked",
                self.id
            )))
        })
    }
}

#[derive(Debug, Clone)]
pub struct Supervisor {
    shared: Arc<Shared>,
    settings: SupervisorSettings,
}

impl Default for Supervisor {
    fn default() -> Self {
        Self::new(SupervisorSettings::default())
    }
}

impl Supervisor {
    pub fn new(settings: SupervisorSettings) -> Self {
        Self {
            shared: Arc::new(Shared {
                job: Mutex::new(None),
                last: Mutex::new(None),
                stop: AtomicBool::new(false),
            }),
            settings,
        }
    }

    pub fn settings(&self) -> &SupervisorSettings {
        &self.settings
    }

    /// Take the job slot and start running `chain` in the background.
    ///
    /// Fails without side effects when another job holds the slot or a
    /// precondition does not hold. `overwrite_confirmed` is the caller's
    /// consent to replace an existing artifact.
    pub fn start_job(
        &self,
        chain: FallbackChain,
        sinks: JobSinks,
        overwrite_confirmed: bool,
    ) -> RescueResult<JobHandle> {
        let mut slot = self.shared.lock_job();
        if let Some(active) = slot.as_ref() {
            return Err(RescueError::JobActive(active.id.to_string()));
        }

        preflight::check_job_preconditions(
            chain.artifact(),
            overwrite_confirmed,
            chain.resumes_existing(),
            self.settings.min_free_bytes,
        )?;
        prepare_artifact(&chain)?;

        let status = JobStatus::new(&chain);
        let id = status.id;
        *slot = Some(status);
        self.shared.stop.store(false, Ordering::SeqCst);
        drop(slot);

        info!(
            "Starting rescue job {}: {} -> {} ({} candidates)",
            id,
            chain.device(),
            chain.artifact().display(),
            chain.len()
        );

        let shared = Arc::clone(&self.shared);
        let settings = self.settings.clone();
        let spawned = thread::Builder::new()
            .name(format!("rescue-{}", id))
            .spawn(move || {
                let guard = SlotGuard { shared: &shared };
                let coordinator = Coordinator {
                    shared: &shared,
                    settings: &settings,
                    sinks: &sinks,
                    chain: &chain,
                };
                let result = coordinator.run();
                drop(guard);
                result
            });

        match spawned {
            Ok(thread) => Ok(JobHandle { id, thread }),
            Err(e) => {
                drop(SlotGuard {
                    shared: &self.shared,
                });
                Err(e.into())
            }
        }
    }

    /// Ask the active job to stop. Returns false when there is nothing to
    /// cancel, including after the job already reached a terminal state.
    pub fn cancel_job(&self) -> bool {
        let mut slot = self.shared.lock_job();
        match slot.as_mut() {
            Some(job) if !job.state.is_terminal() => {
                info!("Cancellation requested for job {}", job.id);
                self.shared.stop.store(true, Ordering::SeqCst);
                job.state = JobState::Stopping;
                true
            }
            _ => false,
        }
    }

    pub fn job_state(&self) -> JobState {
        self.shared
            .lock_job()
            .as_ref()
            .map(|job| job.state)
            .unwrap_or(JobState::Idle)
    }

    pub fn status(&self) -> Option<JobStatus> {
        self.shared.snapshot()
    }

    /// Final snapshot of the most recently finished job.
    pub fn last_status(&self) -> Option<JobStatus> {
        self.shared
            .last
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// Leave the artifact location ready for the first candidate.
fn prepare_artifact(chain: &FallbackChain) -> RescueResult<()> {
    if let Some(map) = chain.mapfile() {
        if !chain.resumes_existing() && map.exists() {
            warn!("Removing stale map file {}", map.display());
            std::fs::remove_file(map)?;
        }
    }

    let artifact = chain.artifact();
    match chain.kind() {
        ArtifactKind::ImageFile => {
            // A leftover image would make an empty run look successful.
            if !chain.resumes_existing() && artifact.is_file() {
                debug!("Removing previous image {}", artifact.display());
                std::fs::remove_file(artifact)?;
            }
        }
        ArtifactKind::TrackDirectory | ArtifactKind::BackupDirectory => {
            std::fs::create_dir_all(artifact)?;
        }
    }
    Ok(())
}

/// Hint for well-known failure messages in tool output.
pub fn failure_hint(line: &str) -> Option<&'static str> {
    if line.contains("Input/output error") {
        Some("The disc may be damaged or dirty. Clean it and try again.")
    } else if line.contains("No medium found") {
        Some("No disc in the drive. Insert a disc and try again.")
    } else {
        None
    }
}

enum Completion {
    Exited {
        status: ExitStatus,
        hint: Option<&'static str>,
    },
    Cancelled,
}

struct Coordinator<'a> {
    shared: &'a Arc<Shared>,
    settings: &'a SupervisorSettings,
    sinks: &'a JobSinks,
    chain: &'a FallbackChain,
}

impl Coordinator<'_> {
    fn run(&self) -> RescueResult<JobOutcome> {
        let total = self.chain.len();
        let mut advances = 0;

        for (index, candidate) in self.chain.candidates().iter().enumerate() {
            if !self.shared.begin_candidate(index, &candidate.description) {
                return self.stopped();
            }
            info!("Candidate {}/{}: {}", index + 1, total, candidate.command_line());
            self.sinks.log(&format!(
                "[{}/{}] {}: {}",
                index + 1,
                total,
                candidate.description,
                candidate.command_line()
            ));

            let failure = match self.run_candidate(candidate) {
                Ok(Completion::Cancelled) => return self.stopped(),
                Ok(Completion::Exited { status, hint }) => {
                    if self.shared.stop_requested() {
                        return self.stopped();
                    }
                    match self.check_exit(candidate, status) {
                        Ok(()) => return self.succeeded(index, candidate, advances),
                        Err(e) => {
                            if let Some(hint) = hint {
                                self.sinks.log(hint);
                            }
                            e
                        }
                    }
                }
                Err(e) => e,
            };

            self.shared.update(|job| job.state = JobState::Failed);
            if failure.is_candidate_failure() {
                warn!("Candidate {}/{} failed: {}", index + 1, total, failure);
            } else {
                error!(
                    "Candidate '{}' could not be supervised: {:#}",
                    candidate.description, failure
                );
            }
            self.sinks.log(&failure.to_string());

            if let Some(next) = self.chain.candidates().get(index + 1) {
                advances += 1;
                self.shared.update(|job| job.chain_advances = advances);
                self.sinks.log(&format!(
                    "Advancing to candidate {}/{}: {}",
                    index + 2,
                    total,
                    next.description
                ));
            }
        }

        if self.shared.settle(JobState::Exhausted) == JobState::Stopped {
            return self.stopped();
        }
        self.sinks.log("All rescue attempts failed.");
        Err(RescueError::ChainExhausted {
            artifact: self.chain.artifact().to_path_buf(),
            attempted: total,
        })
    }

    fn check_exit(&self, candidate: &CommandCandidate, status: ExitStatus) -> RescueResult<()> {
        if !status.success() {
            return Err(RescueError::CandidateFailed {
                description: candidate.description.clone(),
                exit_code: status.code(),
            });
        }
        if !artifact_has_data(self.chain.kind(), self.chain.artifact()) {
            return Err(RescueError::ZeroByteArtifact {
                description: candidate.description.clone(),
                artifact: self.chain.artifact().to_path_buf(),
            });
        }
        Ok(())
    }

    fn stopped(&self) -> RescueResult<JobOutcome> {
        self.shared.settle(JobState::Stopped);
        info!("Rescue job stopped by request");
        self.sinks.log("Operation stopped.");
        Err(RescueError::Cancelled)
    }

    fn succeeded(
        &self,
        index: usize,
        candidate: &CommandCandidate,
        advances: usize,
    ) -> RescueResult<JobOutcome> {
        if self.shared.settle(JobState::Succeeded) == JobState::Stopped {
            return self.stopped();
        }
        let status = self
            .shared
            .snapshot()
            .ok_or_else(|| anyhow::anyhow!("job slot emptied while the job was running"))?;

        info!(
            "Rescue job {} succeeded with candidate {}/{}",
            status.id,
            index + 1,
            self.chain.len()
        );
        self.sinks.log(&format!(
            "Rescue completed: {}",
            self.chain.artifact().display()
        ));

        Ok(JobOutcome {
            id: status.id,
            device: status.device,
            artifact: status.artifact,
            category: status.category,
            kind: self.chain.kind(),
            candidate_index: index,
            candidate_count: self.chain.len(),
            description: candidate.description.clone(),
            command_line: candidate.command_line(),
            chain_advances: advances,
            stuck: status.stuck,
            elapsed: status.started_at.elapsed().unwrap_or_default(),
            started_at: status.started_at,
        })
    }

    fn run_candidate(&self, candidate: &CommandCandidate) -> RescueResult<Completion> {
        let (reader, writer) = io::pipe()?;
        let mut command = Command::new(&candidate.program);
        command
            .args(&candidate.args)
            .stdin(Stdio::null())
            .stdout(writer.try_clone()?)
            .stderr(writer)
            .process_group(0);
        let spawned = command.spawn();
        // Our copies of the write end live in `command`; the reader only
        // sees EOF once they are gone.
        drop(command);

        let mut child = spawned.map_err(|e| {
            warn!("Failed to start {}: {}", candidate.program, e);
            RescueError::CandidateFailed {
                description: candidate.description.clone(),
                exit_code: None,
            }
        })?;
        let pgid = Pid::from_child(&child);
        debug!(
            "Spawned {} as process group {}",
            candidate.program,
            pgid.as_raw_nonzero()
        );
        self.shared.update(|job| {
            if job.state == JobState::Starting {
                job.state = JobState::Running;
            }
        });

        let (done_tx, done_rx) = mpsc::channel();
        let live = Arc::new(AtomicBool::new(true));
        let reader_thread = self.spawn_reader(reader, done_tx, Arc::clone(&live));

        let waited = self.supervise(&mut child, pgid);
        let hint = self.drain_reader(done_rx, reader_thread, pgid, &live);

        match waited {
            Ok(Some(status)) => {
                debug!("{} exited with {}", candidate.program, status);
                Ok(Completion::Exited { status, hint })
            }
            Ok(None) => Ok(Completion::Cancelled),
            Err(e) => Err(e.into()),
        }
    }

    /// Poll for exit; the stop flag is checked on every iteration since the
    /// process may exit right after a stop was requested.
    fn supervise(&self, child: &mut Child, pgid: Pid) -> io::Result<Option<ExitStatus>> {
        loop {
            if self.shared.stop_requested() {
                self.terminate_group(child, pgid);
                return Ok(None);
            }
            match child.try_wait() {
                Ok(Some(status)) => return Ok(Some(status)),
                Ok(None) => thread::sleep(self.settings.poll_interval),
                Err(e) => {
                    error!("Failed to poll process group {}: {}", pgid.as_raw_nonzero(), e);
                    let _ = signal_group(pgid, Signal::KILL);
                    let _ = child.wait();
                    return Err(e);
                }
            }
        }
    }

    /// SIGTERM the whole group, escalating to SIGKILL after the grace period.
    fn terminate_group(&self, child: &mut Child, pgid: Pid) {
        self.shared.update(|job| job.state = JobState::Stopping);
        let group = pgid.as_raw_nonzero();
        info!("Sending SIGTERM to process group {}", group);
        if let Err(e) = signal_group(pgid, Signal::TERM) {
            debug!("SIGTERM to process group {} failed: {}", group, e);
        }

        let deadline = Instant::now() + self.settings.termination_grace;
        loop {
            let leader_exited = matches!(child.try_wait(), Ok(Some(_)));
            if leader_exited && !group_alive(pgid) {
                debug!("Process group {} exited", group);
                return;
            }
            if Instant::now() >= deadline {
                warn!(
                    "Process group {} still running after {:?}, sending SIGKILL",
                    group, self.settings.termination_grace
                );
                if let Err(e) = signal_group(pgid, Signal::KILL) {
                    debug!("SIGKILL to process group {} failed: {}", group, e);
                }
                let _ = child.wait();
                return;
            }
            thread::sleep(self.settings.poll_interval);
        }
    }

    fn spawn_reader(
        &self,
        reader: PipeReader,
        done: Sender<Option<&'static str>>,
        live: Arc<AtomicBool>,
    ) -> JoinHandle<()> {
        let shared = Arc::clone(self.shared);
        let sinks = self.sinks.clone();
        thread::spawn(move || {
            let mut reader = BufReader::new(reader);
            let mut tracker = ProgressTracker::new();
            let mut hint = None;
            let result = for_each_line(&mut reader, &shared.stop, |line| {
                // a reader cut loose from its candidate must not touch the next one
                if !live.load(Ordering::SeqCst) {
                    return;
                }
                debug!(target: "discrescue::tool", "{}", line);
                if hint.is_none() {
                    hint = failure_hint(line);
                }
                sinks.log(line);
                if let Some(sample) = tracker.observe(line) {
                    sinks.progress(&sample);
                    shared.update(|job| {
                        if live.load(Ordering::SeqCst) {
                            job.progress = Some(sample);
                        }
                    });
                }
            });
            if let Err(e) = result {
                warn!("Reading tool output failed: {}", e);
            }
            let _ = done.send(hint);
        })
    }

    /// Wait a bounded time for the reader. Output still open after the
    /// candidate exited belongs to leftover group members, so the group is
    /// killed and the reader gets a second bounded wait. A reader blocked on
    /// a pipe held outside the group is cut loose and the job marked stuck.
    fn drain_reader(
        &self,
        done: Receiver<Option<&'static str>>,
        reader_thread: JoinHandle<()>,
        pgid: Pid,
        live: &AtomicBool,
    ) -> Option<&'static str> {
        match done.recv_timeout(self.settings.reader_drain) {
            Ok(hint) => {
                let _ = reader_thread.join();
                return hint;
            }
            Err(RecvTimeoutError::Disconnected) => {
                let _ = reader_thread.join();
                return None;
            }
            Err(RecvTimeoutError::Timeout) => {}
        }

        warn!(
            "Output of process group {} still open after {:?}, sending SIGKILL",
            pgid.as_raw_nonzero(),
            self.settings.reader_drain
        );
        if let Err(e) = signal_group(pgid, Signal::KILL) {
            debug!("SIGKILL to process group {} failed: {}", pgid.as_raw_nonzero(), e);
        }

        match done.recv_timeout(self.settings.reader_drain) {
            Ok(hint) => {
                let _ = reader_thread.join();
                hint
            }
            Err(RecvTimeoutError::Disconnected) => {
                let _ = reader_thread.join();
                None
            }
            Err(RecvTimeoutError::Timeout) => {
                {
                    let _slot = self.shared.lock_job();
                    live.store(false, Ordering::SeqCst);
                }
                warn!("Output reader did not finish; leaving it behind");
                self.shared.update(|job| job.stuck = true);
                self.sinks.log("Warning: tool output is stuck; continuing without it.");
                None
            }
        }
    }
}

fn signal_group(pgid: Pid, signal: Signal) -> io::Result<()> {
    kill_process_group(pgid, signal).map_err(io::Error::from)
}

fn group_alive(pgid: Pid) -> bool {
    test_kill_process_group(pgid).is_ok()
}
