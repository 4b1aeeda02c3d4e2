use crate::commands::ToolRunner;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Byte offset of the first ISO 9660 volume descriptor (sector 16).
pub const VOLUME_DESCRIPTOR_OFFSET: u64 = 16 * 2048;

/// Standard identifier inside the volume descriptor, one byte after its start.
pub const ISO9660_MAGIC: &[u8; 5] = b"CD001";

/// Lexical marker in cdparanoia's `-Q` diagnostic output.
pub const AUDIO_TRACKS_MARKER: &str = "audio tracks";

/// Lexical marker in `dvdbackup --info` output.
pub const DVD_VIDEO_MARKER: &str = "DVD-Video information";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MediaCategory {
    DataDisc,
    AudioDisc,
    VideoDisc,
    Unknown,
}

impl fmt::Display for MediaCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            MediaCategory::DataDisc => "Data CD/DVD",
            MediaCategory::AudioDisc => "Audio CD",
            MediaCategory::VideoDisc => "Video DVD",
            MediaCategory::Unknown => "Unknown",
        };
        write!(f, "{}", label)
    }
}

impl FromStr for MediaCategory {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "data" | "data-disc" => Ok(MediaCategory::DataDisc),
            "audio" | "audio-disc" => Ok(MediaCategory::AudioDisc),
            "video" | "video-disc" => Ok(MediaCategory::VideoDisc),
            "unknown" => Ok(MediaCategory::Unknown),
            other => Err(format!(
                "Unknown media type '{}'. Supported: data, audio, video",
                other
            )),
        }
    }
}

/// The individual probes the classifier consults.
///
/// Every method swallows its own errors: `None` / `false` mean the probe was
/// inconclusive.
pub trait MediaProbe {
    /// Filesystem type string, e.g. `udf` or `iso9660`.
    fn filesystem_signature(&self, device: &str) -> Option<String>;

    /// Look for the ISO 9660 volume descriptor at its fixed offset.
    fn raw_sector_scan(&self, device: &str) -> bool;

    /// Diagnostic stream of the audio track probe.
    fn audio_probe(&self, device: &str) -> Option<String>;

    /// Output of the video structure probe.
    fn video_probe(&self, device: &str) -> Option<String>;
}

/// Probes backed by blkid, cdparanoia, dvdbackup and a direct device read.
pub struct SystemProbe<'a> {
    runner: &'a dyn ToolRunner,
}

impl<'a> SystemProbe<'a> {
    pub fn new(runner: &'a dyn ToolRunner) -> Self {
        Self { runner }
    }

    fn run(&self, program: &str, args: &[&str]) -> Option<crate::commands::CommandOutput> {
        let args: Vec<String> = args.iter().map(|a| a.to_string()).collect();
        match self.runner.run(program, &args) {
            Ok(output) => Some(output),
            Err(e) => {
                debug!("{} probe could not run: {}", program, e);
                None
            }
        }
    }
}

impl MediaProbe for SystemProbe<'_> {
    fn filesystem_signature(&self, device: &str) -> Option<String> {
        let output = self.run("blkid", &["-p", "-o", "value", "-s", "TYPE", device])?;
        if !output.success {
            return None;
        }
        Some(output.stdout.trim().to_string()).filter(|s| !s.is_empty())
    }

    fn raw_sector_scan(&self, device: &str) -> bool {
        match File::open(device).and_then(|mut f| has_iso9660_descriptor(&mut f)) {
            Ok(found) => found,
            Err(e) => {
                debug!("Raw sector scan of {} failed: {}", device, e);
                false
            }
        }
    }

    fn audio_probe(&self, device: &str) -> Option<String> {
        // cdparanoia reports the table of contents on stderr
        self.run("cdparanoia", &["-d", device, "-Q"]).map(|o| o.stderr)
    }

    fn video_probe(&self, device: &str) -> Option<String> {
        self.run("dvdbackup", &["--info", "-i", device]).map(|o| o.stdout)
    }
}

/// Check the volume descriptor at sector 16 for `CD001`.
pub fn has_iso9660_descriptor<R: Read + Seek>(reader: &mut R) -> std::io::Result<bool> {
    reader.seek(SeekFrom::Start(VOLUME_DESCRIPTOR_OFFSET))?;
    let mut header = [0u8; 6];
    match reader.read_exact(&mut header) {
        Ok(()) => Ok(&header[1..6] == ISO9660_MAGIC),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Classification {
    pub category: MediaCategory,
    /// Signature the decision was based on, if the probe ever answered.
    pub signature: Option<String>,
    /// Signature probe attempts used.
    pub attempts: u32,
    /// The retry budget ran out and the category is a default.
    pub degraded: bool,
}

pub struct Classifier<P: MediaProbe> {
    probe: P,
    attempts: u32,
    retry_delay: Duration,
}

impl<P: MediaProbe> Classifier<P> {
    pub fn new(probe: P, attempts: u32, retry_delay: Duration) -> Self {
        Self {
            probe,
            attempts,
            retry_delay,
        }
    }

    pub fn classify(&self, device: &str) -> Classification {
        info!("Classifying media in {}", device);

        let (signature, attempts) = self.probe_signature(device);
        let Some(signature) = signature else {
            warn!(
                "Filesystem signature of {} unavailable after {} attempts; assuming a data disc",
                device, attempts
            );
            return Classification {
                category: MediaCategory::DataDisc,
                signature: None,
                attempts,
                degraded: true,
            };
        };

        let category = self.classify_signature(device, &signature);
        info!("{} classified as {} (signature: {})", device, category, signature);
        Classification {
            category,
            signature: Some(signature),
            attempts,
            degraded: false,
        }
    }

    fn probe_signature(&self, device: &str) -> (Option<String>, u32) {
        let mut attempt = 0;
        while attempt < self.attempts {
            attempt += 1;
            match self.probe.filesystem_signature(device) {
                Some(sig) if !sig.trim().is_empty() => {
                    return (Some(sig.trim().to_lowercase()), attempt);
                }
                _ => {
                    debug!(
                        "Signature probe of {} inconclusive (attempt {}/{})",
                        device, attempt, self.attempts
                    );
                    if attempt < self.attempts && !self.retry_delay.is_zero() {
                        std::thread::sleep(self.retry_delay);
                    }
                }
            }
        }
        (None, attempt)
    }

    fn classify_signature(&self, device: &str, signature: &str) -> MediaCategory {
        let optical = match signature {
            "udf" | "iso9660" => true,
            other => {
                debug!("Ambiguous signature '{}', scanning raw sectors", other);
                self.probe.raw_sector_scan(device)
            }
        };
        if !optical {
            return MediaCategory::DataDisc;
        }

        let audio = self.probe.audio_probe(device).unwrap_or_default();
        if audio.contains(AUDIO_TRACKS_MARKER) {
            return MediaCategory::AudioDisc;
        }

        let video = self.probe.video_probe(device).unwrap_or_default();
        if video.contains(DVD_VIDEO_MARKER) {
            return MediaCategory::VideoDisc;
        }

        MediaCategory::DataDisc
    }
}

#[cfg(test)]
pub(crate) mod stub {
    use super::*;
    use std::cell::RefCell;
    use std::collections::VecDeque;

    /// Canned probe answers; signature answers are consumed in order.
    #[derive(Default)]
    pub struct StubProbe {
        pub signatures: RefCell<VecDeque<Option<String>>>,
        pub raw_hit: bool,
        pub audio: Option<String>,
        pub video: Option<String>,
        pub log: RefCell<Vec<&'static str>>,
    }

    impl StubProbe {
        pub fn with_signatures(signatures: &[Option<&str>]) -> Self {
            Self {
                signatures: RefCell::new(
                    signatures.iter().map(|s| s.map(str::to_string)).collect(),
                ),
                ..Self::default()
            }
        }
    }

    impl MediaProbe for StubProbe {
        fn filesystem_signature(&self, _device: &str) -> Option<String> {
            self.log.borrow_mut().push("signature");
            self.signatures.borrow_mut().pop_front().flatten()
        }

        fn raw_sector_scan(&self, _device: &str) -> bool {
            self.log.borrow_mut().push("raw");
            self.raw_hit
        }

        fn audio_probe(&self, _device: &str) -> Option<String> {
            self.log.borrow_mut().push("audio");
            self.audio.clone()
        }

        fn video_probe(&self, _device: &str) -> Option<String> {
            self.log.borrow_mut().push("video");
            self.video.clone()
        }
    }
}
