use crate::error::{RescueError, RescueResult};
use crate::media::MediaCategory;
use crate::paths;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::{debug, warn};

/// Block size handed to dd for a straight copy.
pub const DEFAULT_COPY_BLOCK_SIZE: &str = "1M";

/// Prefix of per-track files written by cdparanoia.
pub const TRACK_PREFIX: &str = "track";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RescueMethod {
    /// Error-tolerant block rescue with a degradation ladder.
    Ddrescue,
    /// Straight block copy; a failure is terminal.
    Dd,
}

impl fmt::Display for RescueMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RescueMethod::Ddrescue => write!(f, "ddrescue"),
            RescueMethod::Dd => write!(f, "dd"),
        }
    }
}

impl FromStr for RescueMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "ddrescue" | "rescue" => Ok(RescueMethod::Ddrescue),
            "dd" | "copy" | "simple" => Ok(RescueMethod::Dd),
            other => Err(format!(
                "Unknown method: {}. Supported: 'ddrescue', 'dd'",
                other
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RescueOptions {
    /// Skip the scraping/error-correction pass (`-n`)
    #[serde(default)]
    pub skip_error_correction: bool,

    /// Retry bad sectors three times (`-r3`)
    #[serde(default)]
    pub retry_bad_sectors_thrice: bool,

    /// Use 2048-byte sectors (`-b 2048`)
    #[serde(default = "default_true")]
    pub fixed_block_size_2048: bool,

    /// Direct disc access, bypassing the kernel cache (`-d`)
    #[serde(default = "default_true")]
    pub direct_access_mode: bool,

    /// Continue from an existing map file (`-C`)
    #[serde(default)]
    pub resume_from_partial_map: bool,
}

fn default_true() -> bool {
    true
}

impl Default for RescueOptions {
    fn default() -> Self {
        Self {
            skip_error_correction: false,
            retry_bad_sectors_thrice: false,
            fixed_block_size_2048: true,
            direct_access_mode: true,
            resume_from_partial_map: false,
        }
    }
}

/// Canned method/option combinations by disc condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Preset {
    Intact,
    Damaged,
    Irrecoverable,
}

impl Preset {
    pub fn settings(self) -> (RescueMethod, RescueOptions) {
        let (method, skip, retry) = match self {
            Preset::Intact => (RescueMethod::Dd, false, false),
            Preset::Damaged => (RescueMethod::Ddrescue, false, true),
            Preset::Irrecoverable => (RescueMethod::Ddrescue, true, true),
        };
        (
            method,
            RescueOptions {
                skip_error_correction: skip,
                retry_bad_sectors_thrice: retry,
                fixed_block_size_2048: true,
                direct_access_mode: true,
                resume_from_partial_map: false,
            },
        )
    }
}

impl FromStr for Preset {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "intact" => Ok(Preset::Intact),
            "damaged" => Ok(Preset::Damaged),
            "irrecoverable" => Ok(Preset::Irrecoverable),
            other => Err(format!(
                "Unknown preset: {}. Supported: intact, damaged, irrecoverable",
                other
            )),
        }
    }
}

/// One fully specified external invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommandCandidate {
    pub program: String,
    pub args: Vec<String>,
    pub description: String,
}

impl CommandCandidate {
    pub fn new<S: Into<String>>(program: S, args: Vec<String>, description: S) -> Self {
        Self {
            program: program.into(),
            args,
            description: description.into(),
        }
    }

    /// Printable form for logs; never executed through a shell.
    pub fn command_line(&self) -> String {
        let mut line = self.program.clone();
        for arg in &self.args {
            line.push(' ');
            line.push_str(arg);
        }
        line
    }
}

/// What a successful candidate leaves behind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ArtifactKind {
    /// A disc image file that must be non-empty.
    ImageFile,
    /// A directory with at least one non-empty `track*` file.
    TrackDirectory,
    /// A directory holding a non-empty backup tree.
    BackupDirectory,
}

/// Ordered candidates for one job, most aggressive first.
#[derive(Debug, Clone, Serialize)]
pub struct FallbackChain {
    device: String,
    artifact: PathBuf,
    category: MediaCategory,
    kind: ArtifactKind,
    candidates: Vec<CommandCandidate>,
    mapfile: Option<PathBuf>,
    resume: bool,
}

impl FallbackChain {
    /// Assemble a chain from explicit candidates. Empty chains are rejected.
    pub fn new(
        device: &str,
        artifact: &Path,
        category: MediaCategory,
        kind: ArtifactKind,
        candidates: Vec<CommandCandidate>,
    ) -> RescueResult<Self> {
        if candidates.is_empty() {
            return Err(RescueError::EmptyChain(category.to_string()));
        }
        Ok(Self {
            device: device.to_string(),
            artifact: artifact.to_path_buf(),
            category,
            kind,
            candidates,
            mapfile: None,
            resume: false,
        })
    }

    fn with_mapfile(mut self, mapfile: PathBuf, resume: bool) -> Self {
        self.mapfile = Some(mapfile);
        self.resume = resume;
        self
    }

    pub fn device(&self) -> &str {
        &self.device
    }

    pub fn artifact(&self) -> &Path {
        &self.artifact
    }

    pub fn category(&self) -> MediaCategory {
        self.category
    }

    pub fn kind(&self) -> ArtifactKind {
        self.kind
    }

    pub fn candidates(&self) -> &[CommandCandidate] {
        &self.candidates
    }

    pub fn len(&self) -> usize {
        self.candidates.len()
    }

    /// Always false for a constructed chain.
    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }

    /// ddrescue map file owned by this job, if the chain uses one.
    pub fn mapfile(&self) -> Option<&Path> {
        self.mapfile.as_deref()
    }

    /// The chain continues a previous partial rescue from its map.
    pub fn resumes_existing(&self) -> bool {
        self.resume
    }

    /// Programs the chain will invoke, deduplicated, in order.
    pub fn programs(&self) -> Vec<&str> {
        let mut programs: Vec<&str> = Vec::new();
        for candidate in &self.candidates {
            if !programs.contains(&candidate.program.as_str()) {
                programs.push(&candidate.program);
            }
        }
        programs
    }
}

/// Build the fallback chain for a media category.
///
/// `Unknown` has no builder and yields `UnsupportedMedia`.
pub fn build_chain(
    category: MediaCategory,
    method: RescueMethod,
    options: &RescueOptions,
    device: &str,
    artifact: &Path,
) -> RescueResult<FallbackChain> {
    build_chain_with_block_size(category, method, options, device, artifact, DEFAULT_COPY_BLOCK_SIZE)
}

/// `build_chain` with an explicit dd block size.
pub fn build_chain_with_block_size(
    category: MediaCategory,
    method: RescueMethod,
    options: &RescueOptions,
    device: &str,
    artifact: &Path,
    copy_block_size: &str,
) -> RescueResult<FallbackChain> {
    let chain = match category {
        MediaCategory::DataDisc => match method {
            RescueMethod::Ddrescue => ddrescue_chain(options, device, artifact)?,
            RescueMethod::Dd => dd_chain(device, artifact, copy_block_size)?,
        },
        MediaCategory::AudioDisc => audio_chain(device, artifact)?,
        MediaCategory::VideoDisc => video_chain(device, artifact)?,
        MediaCategory::Unknown => {
            return Err(RescueError::UnsupportedMedia(category.to_string()));
        }
    };
    debug!(
        "Built {} candidate(s) for {}: {:?}",
        chain.len(),
        category,
        chain.candidates().iter().map(|c| c.command_line()).collect::<Vec<_>>()
    );
    Ok(chain)
}

/// One rung of the ddrescue degradation ladder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Rung {
    skip_error_correction: bool,
    retries: Option<u8>,
    block_size_2048: bool,
    direct: bool,
    resume: bool,
}

impl Rung {
    fn args(&self, device: &str, artifact: &Path, mapfile: &Path) -> Vec<String> {
        let mut args = vec!["--force".to_string()];
        if self.skip_error_correction {
            args.push("-n".to_string());
        }
        if let Some(retries) = self.retries {
            args.push(format!("-r{}", retries));
        }
        if self.block_size_2048 {
            args.push("-b".to_string());
            args.push("2048".to_string());
        }
        if self.direct {
            args.push("-d".to_string());
        }
        if self.resume {
            args.push("-C".to_string());
        }
        args.push(device.to_string());
        args.push(artifact.to_string_lossy().to_string());
        args.push(mapfile.to_string_lossy().to_string());
        args
    }

    fn describe(&self) -> String {
        let pass = if self.skip_error_correction {
            "fast pass, no scraping"
        } else {
            "full pass with scraping"
        };
        match self.retries {
            Some(n) => format!("ddrescue ({}, {} retr{})", pass, n, if n == 1 { "y" } else { "ies" }),
            None => format!("ddrescue ({}, no retries)", pass),
        }
    }
}

fn ddrescue_chain(
    options: &RescueOptions,
    device: &str,
    artifact: &Path,
) -> RescueResult<FallbackChain> {
    let mapfile = paths::mapfile_for(artifact);
    let resume = if options.resume_from_partial_map && !mapfile.exists() {
        warn!(
            "Resume requested but no map file at {}; starting a fresh rescue",
            mapfile.display()
        );
        false
    } else {
        options.resume_from_partial_map
    };

    let full = Rung {
        skip_error_correction: options.skip_error_correction,
        retries: options.retry_bad_sectors_thrice.then_some(3),
        block_size_2048: options.fixed_block_size_2048,
        direct: options.direct_access_mode,
        resume,
    };
    let fewer_retries = Rung {
        retries: full.retries.map(|_| 1),
        ..full
    };
    let with_scraping = Rung {
        skip_error_correction: false,
        ..fewer_retries
    };

    let mut rungs: Vec<Rung> = Vec::with_capacity(3);
    for rung in [full, fewer_retries, with_scraping] {
        if rungs.last() != Some(&rung) {
            rungs.push(rung);
        }
    }

    let candidates = rungs
        .iter()
        .map(|rung| CommandCandidate::new("ddrescue".to_string(), rung.args(device, artifact, &mapfile), rung.describe()))
        .collect();

    Ok(FallbackChain::new(
        device,
        artifact,
        MediaCategory::DataDisc,
        ArtifactKind::ImageFile,
        candidates,
    )?
    .with_mapfile(mapfile, resume))
}

/// Straight dd copy. One candidate, no ladder.
fn dd_chain(device: &str, artifact: &Path, block_size: &str) -> RescueResult<FallbackChain> {
    let candidate = CommandCandidate::new(
        "dd".to_string(),
        vec![
            format!("if={}", device),
            format!("of={}", artifact.to_string_lossy()),
            format!("bs={}", block_size),
            "status=progress".to_string(),
        ],
        "dd (straight copy)".to_string(),
    );
    FallbackChain::new(
        device,
        artifact,
        MediaCategory::DataDisc,
        ArtifactKind::ImageFile,
        vec![candidate],
    )
}

fn audio_chain(device: &str, artifact: &Path) -> RescueResult<FallbackChain> {
    let prefix = artifact.join(TRACK_PREFIX);
    let candidate = CommandCandidate::new(
        "cdparanoia".to_string(),
        vec![
            "-B".to_string(),
            "-d".to_string(),
            device.to_string(),
            "-D".to_string(),
            "0".to_string(),
            "-Z".to_string(),
            prefix.to_string_lossy().to_string(),
        ],
        "cdparanoia (per-track rip)".to_string(),
    );
    FallbackChain::new(
        device,
        artifact,
        MediaCategory::AudioDisc,
        ArtifactKind::TrackDirectory,
        vec![candidate],
    )
}

fn video_chain(device: &str, artifact: &Path) -> RescueResult<FallbackChain> {
    let candidate = CommandCandidate::new(
        "dvdbackup".to_string(),
        vec![
            "-i".to_string(),
            device.to_string(),
            "-o".to_string(),
            artifact.to_string_lossy().to_string(),
            "-M".to_string(),
        ],
        "dvdbackup (mirror)".to_string(),
    );
    FallbackChain::new(
        device,
        artifact,
        MediaCategory::VideoDisc,
        ArtifactKind::BackupDirectory,
        vec![candidate],
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn all_options() -> RescueOptions {
        RescueOptions {
            skip_error_correction: true,
            retry_bad_sectors_thrice: true,
            fixed_block_size_2048: true,
            direct_access_mode: true,
            resume_from_partial_map: false,
        }
    }

    fn has_flag(candidate: &CommandCandidate, flag: &str) -> bool {
        candidate.args.iter().any(|a| a == flag)
    }

    fn retries(candidate: &CommandCandidate) -> u8 {
        candidate
            .args
            .iter()
            .find_map(|a| a.strip_prefix("-r").and_then(|n| n.parse().ok()))
            .unwrap_or(0)
    }

    #[test]
    fn test_all_options_degrade_in_three_steps() -> RescueResult<()> {
        let artifact = Path::new("/nonexistent/rescue/disc.iso");
        let chain = build_chain(
            MediaCategory::DataDisc,
            RescueMethod::Ddrescue,
            &all_options(),
            "/dev/sr0",
            artifact,
        )?;
        assert_eq!(chain.len(), 3);
        let c = chain.candidates();
        assert_eq!(
            c[0].args,
            vec![
                "--force", "-n", "-r3", "-b", "2048", "-d", "/dev/sr0",
                "/nonexistent/rescue/disc.iso", "/nonexistent/rescue/disc.iso.map"
            ]
        );
        assert!(has_flag(&c[1], "-r1") && !has_flag(&c[1], "-r3") && has_flag(&c[1], "-n"));
        assert!(has_flag(&c[2], "-r1") && !has_flag(&c[2], "-n"));
        assert!(c.iter().all(|c| c.program == "ddrescue" && has_flag(c, "--force")));
        assert_eq!(chain.kind(), ArtifactKind::ImageFile);
        assert_eq!(chain.mapfile(), Some(Path::new("/nonexistent/rescue/disc.iso.map")));
        Ok(())
    }

    #[test]
    fn test_ladder_never_readds_removed_options() -> RescueResult<()> {
        let artifact = Path::new("/nonexistent/rescue/disc.iso");
        for bits in 0u8..32 {
            let options = RescueOptions {
                skip_error_correction: bits & 1 != 0,
                retry_bad_sectors_thrice: bits & 2 != 0,
                fixed_block_size_2048: bits & 4 != 0,
                direct_access_mode: bits & 8 != 0,
                resume_from_partial_map: bits & 16 != 0,
            };
            let chain = build_chain(
                MediaCategory::DataDisc,
                RescueMethod::Ddrescue,
                &options,
                "/dev/sr0",
                artifact,
            )?;
            assert!(!chain.is_empty());
            assert!(chain.len() <= 3);
            for pair in chain.candidates().windows(2) {
                assert_ne!(pair[0], pair[1], "duplicate rung for {:?}", options);
                for flag in ["-n", "-r3", "-b", "-d", "-C"] {
                    if !has_flag(&pair[0], flag) {
                        assert!(!has_flag(&pair[1], flag), "{} re-added for {:?}", flag, options);
                    }
                }
                assert!(retries(&pair[1]) <= retries(&pair[0]));
            }
            // resume is dropped: no map exists under /nonexistent
            assert!(chain.candidates().iter().all(|c| !has_flag(c, "-C")));
        }
        Ok(())
    }

    #[test]
    fn test_minimal_options_single_candidate() -> RescueResult<()> {
        let options = RescueOptions {
            skip_error_correction: false,
            retry_bad_sectors_thrice: false,
            fixed_block_size_2048: false,
            direct_access_mode: false,
            resume_from_partial_map: false,
        };
        let chain = build_chain(
            MediaCategory::DataDisc,
            RescueMethod::Ddrescue,
            &options,
            "/dev/sr0",
            Path::new("/tmp/disc.iso"),
        )?;
        assert_eq!(chain.len(), 1);
        assert_eq!(chain.candidates()[0].args[0], "--force");
        Ok(())
    }

    #[test]
    fn test_resume_uses_existing_map() -> anyhow::Result<()> {
        let temp = TempDir::new()?;
        let artifact = temp.path().join("disc.iso");
        std::fs::write(paths::mapfile_for(&artifact), "# Mapfile")?;

        let options = RescueOptions {
            resume_from_partial_map: true,
            ..RescueOptions::default()
        };
        let chain = build_chain(
            MediaCategory::DataDisc,
            RescueMethod::Ddrescue,
            &options,
            "/dev/sr0",
            &artifact,
        )?;
        assert!(chain.resumes_existing());
        assert!(chain.candidates().iter().all(|c| has_flag(c, "-C")));
        Ok(())
    }

    #[test]
    fn test_resume_without_map_is_dropped() -> anyhow::Result<()> {
        let temp = TempDir::new()?;
        let artifact = temp.path().join("disc.iso");
        let options = RescueOptions {
            resume_from_partial_map: true,
            ..RescueOptions::default()
        };
        let chain = build_chain(
            MediaCategory::DataDisc,
            RescueMethod::Ddrescue,
            &options,
            "/dev/sr0",
            &artifact,
        )?;
        assert!(!chain.resumes_existing());
        assert!(!has_flag(&chain.candidates()[0], "-C"));
        Ok(())
    }

    #[test]
    fn test_dd_is_single_candidate() -> RescueResult<()> {
        let chain = build_chain(
            MediaCategory::DataDisc,
            RescueMethod::Dd,
            &all_options(),
            "/dev/sr1",
            Path::new("/srv/disc.iso"),
        )?;
        assert_eq!(chain.len(), 1);
        assert_eq!(chain.candidates()[0].program, "dd");
        assert_eq!(
            chain.candidates()[0].args,
            vec!["if=/dev/sr1", "of=/srv/disc.iso", "bs=1M", "status=progress"]
        );
        assert_eq!(chain.mapfile(), None);
        Ok(())
    }

    #[test]
    fn test_audio_chain() -> RescueResult<()> {
        let chain = build_chain(
            MediaCategory::AudioDisc,
            RescueMethod::Ddrescue,
            &all_options(),
            "/dev/sr0",
            Path::new("/srv/album"),
        )?;
        assert_eq!(chain.len(), 1);
        assert_eq!(chain.kind(), ArtifactKind::TrackDirectory);
        let c = &chain.candidates()[0];
        assert_eq!(c.program, "cdparanoia");
        assert_eq!(c.args.last().map(String::as_str), Some("/srv/album/track"));
        Ok(())
    }

    #[test]
    fn test_video_chain() -> RescueResult<()> {
        let chain = build_chain(
            MediaCategory::VideoDisc,
            RescueMethod::Dd,
            &RescueOptions::default(),
            "/dev/dvd",
            Path::new("/srv/movie"),
        )?;
        assert_eq!(chain.len(), 1);
        assert_eq!(chain.candidates()[0].command_line(), "dvdbackup -i /dev/dvd -o /srv/movie -M");
        assert_eq!(chain.programs(), vec!["dvdbackup"]);
        Ok(())
    }

    #[test]
    fn test_unknown_is_unsupported() {
        let result = build_chain(
            MediaCategory::Unknown,
            RescueMethod::Ddrescue,
            &RescueOptions::default(),
            "/dev/sr0",
            Path::new("/srv/x.iso"),
        );
        assert!(matches!(result, Err(RescueError::UnsupportedMedia(_))));
    }

    #[test]
    fn test_empty_chain_rejected() {
        let result = FallbackChain::new(
            "/dev/sr0",
            Path::new("/srv/x.iso"),
            MediaCategory::DataDisc,
            ArtifactKind::ImageFile,
            Vec::new(),
        );
        assert!(matches!(result, Err(RescueError::EmptyChain(_))));
    }

    #[test]
    fn test_presets() {
        let (method, options) = Preset::Intact.settings();
        assert_eq!(method, RescueMethod::Dd);
        assert!(!options.retry_bad_sectors_thrice);

        let (method, options) = Preset::Irrecoverable.settings();
        assert_eq!(method, RescueMethod::Ddrescue);
        assert!(options.skip_error_correction && options.retry_bad_sectors_thrice);

        assert_eq!("damaged".parse::<Preset>(), Ok(Preset::Damaged));
        assert_eq!("dd".parse::<RescueMethod>(), Ok(RescueMethod::Dd));
    }
}
