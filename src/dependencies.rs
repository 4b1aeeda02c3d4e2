use crate::chain::RescueMethod;
use crate::commands::{check_command, ToolRunner};
use crate::error::{RescueError, RescueResult};
use crate::media::MediaCategory;
use std::path::PathBuf;
use tracing::{debug, info, warn};

/// Tools every run needs for device probing and verification.
pub const REQUIRED_COMMANDS: &[&str] = &["blkid", "blockdev", "mount", "umount"];

/// Tools needed only for a particular media type or step.
pub const OPTIONAL_COMMANDS: &[&str] = &[
    "ddrescue",
    "dd",
    "cdparanoia",
    "dvdbackup",
    "dvdisaster",
    "iso-read",
    "eject",
];

/// Check all dependencies and return what is missing.
pub fn check_dependencies() -> DependencyStatus {
    let mut missing_required = Vec::new();
    let mut missing_optional = Vec::new();
    let mut found_optional = Vec::new();

    for cmd in REQUIRED_COMMANDS {
        match check_command(cmd) {
            Some(path) => {
                debug!("Found required command: {} at {}", cmd, path.display());
            }
            None => {
                warn!("Missing required command: {}", cmd);
                missing_required.push(cmd.to_string());
            }
        }
    }

    for cmd in OPTIONAL_COMMANDS {
        match check_command(cmd) {
            Some(path) => {
                debug!("Found optional command: {} at {}", cmd, path.display());
                found_optional.push((cmd.to_string(), path));
            }
            None => {
                debug!("Missing optional command: {} (not critical)", cmd);
                missing_optional.push(cmd.to_string());
            }
        }
    }

    DependencyStatus {
        missing_required,
        missing_optional,
        found_optional,
    }
}

/// Tools a rescue of `category` with `method` will invoke.
pub fn tools_for(category: MediaCategory, method: RescueMethod) -> &'static [&'static str] {
    match (category, method) {
        (MediaCategory::DataDisc, RescueMethod::Ddrescue) => &["ddrescue"],
        (MediaCategory::DataDisc, RescueMethod::Dd) => &["dd"],
        (MediaCategory::AudioDisc, _) => &["cdparanoia"],
        (MediaCategory::VideoDisc, _) => &["dvdbackup"],
        (MediaCategory::Unknown, _) => &[],
    }
}

/// Fail with `ToolMissing` unless `tool` is installed.
pub fn require_tool(runner: &dyn ToolRunner, tool: &str) -> RescueResult<()> {
    if runner.is_available(tool) {
        return Ok(());
    }
    Err(RescueError::ToolMissing {
        tool: tool.to_string(),
        hint: installation_hint(tool),
    })
}

/// Guard run once before a chain is built.
pub fn require_tools_for(
    runner: &dyn ToolRunner,
    category: MediaCategory,
    method: RescueMethod,
) -> RescueResult<()> {
    for tool in tools_for(category, method) {
        require_tool(runner, tool)?;
    }
    info!("Tools available for {} ({})", category, method);
    Ok(())
}

/// Get installation hints for common Linux distributions.
pub fn installation_hint(command: &str) -> Option<&'static str> {
    match command {
        "ddrescue" => Some("sudo apt install gddrescue (Debian/Ubuntu) or sudo dnf install ddrescue (Fedora/RHEL)"),
        "cdparanoia" => Some("sudo apt install cdparanoia (Debian/Ubuntu) or sudo dnf install cdparanoia (Fedora/RHEL)"),
        "dvdbackup" => Some("sudo apt install dvdbackup (Debian/Ubuntu) or sudo dnf install dvdbackup (Fedora/RHEL)"),
        "dvdisaster" => Some("sudo apt install dvdisaster (Debian/Ubuntu)"),
        "iso-read" => Some("sudo apt install libcdio-utils (Debian/Ubuntu) or sudo dnf install libcdio (Fedora/RHEL)"),
        "eject" => Some("sudo apt install eject (Debian/Ubuntu) or sudo dnf install util-linux (Fedora/RHEL)"),
        "dd" => Some("Usually included in coreutils, try: sudo apt install coreutils"),
        "blkid" | "blockdev" | "mount" | "umount" => {
            Some("Usually included in util-linux, try: sudo apt install util-linux")
        }
        _ => None,
    }
}

#[derive(Debug, Clone)]
pub struct DependencyStatus {
    pub missing_required: Vec<String>,
    pub missing_optional: Vec<String>,
    pub found_optional: Vec<(String, PathBuf)>,
}

impl DependencyStatus {
    /// Check if all required dependencies are present.
    pub fn all_required_present(&self) -> bool {
        self.missing_required.is_empty()
    }

    /// Print a summary of dependency status.
    pub fn print_summary(&self) {
        if self.missing_required.is_empty() {
            println!("✓ All required dependencies are available");
        } else {
            println!("✗ Missing required dependencies:");
            for cmd in &self.missing_required {
                println!("  - {}", cmd);
                if let Some(hint) = installation_hint(cmd) {
                    println!("    Hint: {}", hint);
                }
            }
        }

        if !self.found_optional.is_empty() {
            println!("\nMedia tools found:");
            for (cmd, path) in &self.found_optional {
                println!("  ✓ {} at {}", cmd, path.display());
            }
        }

        if !self.missing_optional.is_empty() {
            println!("\nMedia tools not found (some media types will be unavailable):");
            for cmd in &self.missing_optional {
                match installation_hint(cmd) {
                    Some(hint) => println!("  - {} ({})", cmd, hint),
                    None => println!("  - {}", cmd),
                }
            }
        }
    }
}
