mod cli;

use anyhow::{Context, Result};
use clap::Parser;
use cli::{Cli, Command, RescueArgs};
use discrescue::chain::ArtifactKind;
use discrescue::devices::Device;
use discrescue::progress::parse_percent;
use discrescue::supervisor::JobSinks;
use discrescue::*;
use indicatif::{ProgressBar, ProgressStyle};
use std::io::{self, BufRead, Write};
use std::path::Path;
use tracing::{info, warn};

fn main() -> Result<()> {
    let cli = Cli::parse();

    logging::init_logging(cli.verbose).context("Failed to initialize logging")?;
    info!("Starting DiscRescue {}", env!("CARGO_PKG_VERSION"));

    paths::ensure_data_dir()?;
    paths::ensure_config_dir()?;

    let mut config = match &cli.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };
    if let Some(device) = &cli.device {
        config.device = device.clone();
    }
    config.validate()?;

    let engine = RescueEngine::new(config);

    match cli.command {
        Command::Devices => list_devices(&engine),
        Command::Deps => {
            let status = dependencies::check_dependencies();
            status.print_summary();
            if !status.all_required_present() {
                anyhow::bail!("Missing required dependencies");
            }
            Ok(())
        }
        Command::Classify => classify(&engine),
        Command::Plan(args) => plan(&engine, &args).map(|_| ()),
        Command::Rescue(args) => rescue(&engine, &args),
        Command::Verify { image, recover } => verify(&engine, &image, recover),
        Command::Recover { image } => recover(&engine, &image),
    }
}

fn list_devices(engine: &RescueEngine) -> Result<()> {
    for device in engine.list_devices() {
        println!("{}", device);
    }
    Ok(())
}

/// The configured drive, as the inventory sees it.
fn selected_device(engine: &RescueEngine) -> Device {
    let wanted = &engine.config().device;
    let inventory = engine.list_devices();
    if let Some(device) = inventory.iter().find(|d| d.path() == Some(wanted.as_str())) {
        return device.clone();
    }
    if Path::new(wanted).exists() {
        return Device::Drive {
            path: wanted.clone(),
            size_mb: None,
        };
    }
    warn!("{} does not exist", wanted);
    inventory.into_iter().next().unwrap_or(Device::NoDevice)
}

fn classify(engine: &RescueEngine) -> Result<()> {
    let device = selected_device(engine);
    let path = device.require_path()?;
    engine.ensure_media_present(path)?;

    let classification = engine.classify(path);
    println!("Device:     {}", device);
    println!("Media type: {}", classification.category);
    println!(
        "Signature:  {}",
        classification.signature.as_deref().unwrap_or("(none)")
    );
    if classification.degraded {
        println!(
            "Warning: filesystem probe gave no answer after {} attempts; assuming a data disc",
            classification.attempts
        );
    }
    Ok(())
}

fn plan(engine: &RescueEngine, args: &RescueArgs) -> Result<engine::RescuePlan> {
    let device = selected_device(engine);
    let (method, options) = args.resolve(engine.config().method, &engine.config().options);
    let artifact = args
        .output
        .clone()
        .map(|p| paths::expand_tilde(&p.to_string_lossy()))
        .unwrap_or_else(|| engine.config().default_artifact_path());

    let plan = engine.plan(&device, args.media, method, &options, &artifact)?;

    println!("Device:   {}", device);
    println!("Media:    {}", plan.classification.category);
    println!("Output:   {}", plan.chain.artifact().display());
    if let Some(map) = plan.chain.mapfile() {
        let mode = if plan.chain.resumes_existing() {
            "resuming"
        } else {
            "new"
        };
        println!("Map file: {} ({})", map.display(), mode);
    }
    for (index, candidate) in plan.chain.candidates().iter().enumerate() {
        println!("  {}. {}", index + 1, candidate.description);
        println!("     {}", candidate.command_line());
    }
    Ok(plan)
}

fn rescue(engine: &RescueEngine, args: &RescueArgs) -> Result<()> {
    if !preflight::running_as_root() {
        warn!("Not running as root; reading the raw device may fail");
    }

    let plan = plan(engine, args)?;
    let artifact = plan.chain.artifact().to_path_buf();
    let kind = plan.chain.kind();

    let overwrite_confirmed = if artifact.exists() && !plan.chain.resumes_existing() {
        args.yes || confirm(&format!("{} already exists. Overwrite?", artifact.display()))?
    } else {
        false
    };

    let bar = ProgressBar::new(100);
    bar.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{wide_bar:.cyan/blue}] {pos}% {msg}")
            .context("Invalid progress bar template")?
            .progress_chars("#>-"),
    );

    let log_bar = bar.clone();
    let progress_bar = bar.clone();
    let sinks = JobSinks::new(
        move |line| {
            if parse_percent(line).is_none() {
                log_bar.println(line);
            }
        },
        move |sample| {
            progress_bar.set_position(sample.percent as u64);
            progress_bar.set_message(sample.line.trim().to_string());
        },
    );

    let supervisor = engine.supervisor();
    ctrlc::set_handler(move || {
        supervisor.cancel_job();
    })
    .context("Failed to install Ctrl-C handler")?;

    let handle = engine.start_job(plan.chain, sinks, overwrite_confirmed)?;
    let outcome = match handle.wait() {
        Ok(outcome) => {
            bar.finish_with_message("done");
            outcome
        }
        Err(e) => {
            bar.abandon_with_message(e.to_string());
            return Err(e.into());
        }
    };

    println!(
        "Rescued {} in {:.0?} using {}",
        outcome.artifact.display(),
        outcome.elapsed,
        outcome.description
    );
    if outcome.chain_advances > 0 {
        println!("({} fallback step(s) were needed)", outcome.chain_advances);
    }

    let mut verified = None;
    let mut recovery = None;
    if args.verify && kind == ArtifactKind::ImageFile {
        let mounted = engine.verify(&artifact)?;
        println!("Verification: {}", if mounted { "mounts" } else { "does not mount" });
        if !mounted {
            let attempt = engine.recover(&artifact)?;
            println!("Recovery with {}: {}", attempt.tool, attempt.message);
            recovery = Some(attempt);
        }
        verified = Some(mounted);
    }

    if let Some(report) = engine.write_report(&outcome, verified, recovery)? {
        println!("Report: {}", report.display());
    }

    if args.eject && !engine.config().eject_after_success {
        engine.eject(&outcome.device);
    }
    engine.finish(&outcome);
    Ok(())
}

fn verify(engine: &RescueEngine, image: &Path, recover_on_failure: bool) -> Result<()> {
    if engine.verify(image)? {
        println!("{} mounts correctly", image.display());
        return Ok(());
    }
    println!("{} could not be mounted", image.display());
    if recover_on_failure {
        return recover(engine, image);
    }
    Err(RescueError::VerificationFailed(image.to_path_buf()).into())
}

fn recover(engine: &RescueEngine, image: &Path) -> Result<()> {
    let attempt = engine.recover(image)?.ensure_succeeded()?;
    println!("Recovered image: {}", attempt.output.display());
    Ok(())
}

fn confirm(question: &str) -> Result<bool> {
    print!("{} [y/N] ", question);
    io::stdout().flush()?;
    let mut answer = String::new();
    io::stdin().lock().read_line(&mut answer)?;
    Ok(matches!(answer.trim(), "y" | "Y" | "yes" | "Yes"))
}
