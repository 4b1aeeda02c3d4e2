use clap::{Args, Parser, Subcommand};
use discrescue::chain::{Preset, RescueMethod, RescueOptions};
use discrescue::media::MediaCategory;
use std::path::PathBuf;

/// DiscRescue - best-effort extraction of damaged CD/DVD media
#[derive(Parser, Debug)]
#[command(name = "discrescue")]
#[command(version)]
#[command(about = "Best-effort extraction of damaged CD/DVD media", long_about = None)]
pub struct Cli {
    /// Optical drive to use (overrides the config file)
    #[arg(short = 'd', long, global = true)]
    pub device: Option<String>,

    /// Alternative config file
    #[arg(long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Debug logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// List optical drives
    Devices,
    /// Report installed and missing tools
    Deps,
    /// Detect the type of the inserted disc
    Classify,
    /// Show the commands a rescue would run, without running them
    Plan(RescueArgs),
    /// Rescue the inserted disc
    Rescue(RescueArgs),
    /// Check that an image mounts
    Verify {
        #[arg(value_name = "IMAGE")]
        image: PathBuf,

        /// Run a recovery pass when the image does not mount
        #[arg(long)]
        recover: bool,
    },
    /// Run a recovery pass over an image
    Recover {
        #[arg(value_name = "IMAGE")]
        image: PathBuf,
    },
}

#[derive(Args, Debug, Clone)]
pub struct RescueArgs {
    /// Output image or directory (default: timestamped name in output_dir)
    #[arg(short, long, value_name = "PATH")]
    pub output: Option<PathBuf>,

    /// Skip detection: data, audio or video
    #[arg(long, value_name = "TYPE")]
    pub media: Option<MediaCategory>,

    /// ddrescue or dd
    #[arg(long)]
    pub method: Option<RescueMethod>,

    /// intact, damaged or irrecoverable
    #[arg(long, conflicts_with = "method")]
    pub preset: Option<Preset>,

    /// Skip the scraping phase (-n)
    #[arg(long)]
    pub skip_error_correction: bool,

    /// Retry bad sectors three times (-r3)
    #[arg(long)]
    pub retry_thrice: bool,

    /// Do not force 2048-byte sectors
    #[arg(long)]
    pub no_block_size: bool,

    /// Do not use direct disc access
    #[arg(long)]
    pub no_direct: bool,

    /// Continue from an existing map file (-C)
    #[arg(long)]
    pub resume: bool,

    /// Overwrite an existing output without asking
    #[arg(short, long)]
    pub yes: bool,

    /// Check that the image mounts afterwards
    #[arg(long)]
    pub verify: bool,

    /// Eject the disc after a successful rescue
    #[arg(long)]
    pub eject: bool,
}

impl RescueArgs {
    /// Method and options from the preset or config, with flags applied on top.
    pub fn resolve(
        &self,
        default_method: RescueMethod,
        default_options: &RescueOptions,
    ) -> (RescueMethod, RescueOptions) {
        let (method, mut options) = match self.preset {
            Some(preset) => preset.settings(),
            None => (self.method.unwrap_or(default_method), *default_options),
        };
        if self.skip_error_correction {
            options.skip_error_correction = true;
        }
        if self.retry_thrice {
            options.retry_bad_sectors_thrice = true;
        }
        if self.no_block_size {
            options.fixed_block_size_2048 = false;
        }
        if self.no_direct {
            options.direct_access_mode = false;
        }
        if self.resume {
            options.resume_from_partial_map = true;
        }
        (method, options)
    }
}
