use anyhow::{Context, Result};
use std::ffi::OsStr;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use tracing::{debug, warn};

/// Execute a command without a shell and capture its output.
/// All arguments must be provided separately.
pub fn execute_command<S: AsRef<OsStr>>(program: S, args: &[S]) -> Result<CommandOutput> {
    let program_str = program.as_ref().to_string_lossy().to_string();
    let args_str: Vec<String> = args
        .iter()
        .map(|a| a.as_ref().to_string_lossy().to_string())
        .collect();

    debug!("Executing command: {} {}", program_str, args_str.join(" "));

    let output = Command::new(&program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .with_context(|| format!("Failed to execute command: {}", program_str))?;

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();

    let success = output.status.success();
    let exit_code = output.status.code();

    if !success {
        warn!(
            "Command failed: {} {} (exit code: {:?})",
            program_str,
            args_str.join(" "),
            exit_code
        );
        debug!("stderr: {}", stderr);
    } else {
        debug!("Command succeeded: {} {}", program_str, args_str.join(" "));
    }

    Ok(CommandOutput {
        success,
        stdout,
        stderr,
        exit_code,
    })
}

/// Check if a command is available in PATH.
pub fn check_command(command: &str) -> Option<PathBuf> {
    which::which(command).ok()
}

#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
}

impl CommandOutput {
    /// stdout followed by stderr, for tools that report on either stream.
    pub fn combined(&self) -> String {
        format!("{}\n{}", self.stdout, self.stderr)
    }
}

/// Short-lived tool invocations (probes, mount, recovery).
///
/// Long-running rescue candidates are not run through this; they belong to
/// the supervisor, which streams their output.
pub trait ToolRunner: Send + Sync {
    fn run(&self, program: &str, args: &[String]) -> Result<CommandOutput>;

    fn is_available(&self, program: &str) -> bool {
        check_command(program).is_some()
    }
}

/// Runs tools on the host.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemRunner;

impl ToolRunner for SystemRunner {
    fn run(&self, program: &str, args: &[String]) -> Result<CommandOutput> {
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        execute_command(program, args.as_slice())
    }
}

#[cfg(test)]
pub(crate) mod stub {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// Replays canned outputs per program and records every invocation.
    #[derive(Default)]
    pub struct ScriptedRunner {
        outputs: Mutex<HashMap<String, Vec<Result<CommandOutput, String>>>>,
        available: Vec<String>,
        pub calls: Mutex<Vec<(String, Vec<String>)>>,
    }

    impl ScriptedRunner {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn with_tools(mut self, tools: &[&str]) -> Self {
            self.available = tools.iter().map(|t| t.to_string()).collect();
            self
        }

        /// Queue an output for the next call of `program`.
        pub fn push(&self, program: &str, output: CommandOutput) {
            self.outputs
                .lock()
                .unwrap()
                .entry(program.to_string())
                .or_default()
                .push(Ok(output));
        }

        /// Queue a spawn failure for the next call of `program`.
        pub fn push_error(&self, program: &str, message: &str) {
            self.outputs
                .lock()
                .unwrap()
                .entry(program.to_string())
                .or_default()
                .push(Err(message.to_string()));
        }

        pub fn programs_called(&self) -> Vec<String> {
            self.calls.lock().unwrap().iter().map(|(p, _)| p.clone()).collect()
        }
    }

    pub fn ok(stdout: &str, stderr: &str) -> CommandOutput {
        CommandOutput {
            success: true,
            stdout: stdout.to_string(),
            stderr: stderr.to_string(),
            exit_code: Some(0),
        }
    }

    pub fn failed(code: i32, stderr: &str) -> CommandOutput {
        CommandOutput {
            success: false,
            stdout: String::new(),
            stderr: stderr.to_string(),
            exit_code: Some(code),
        }
    }

    impl ToolRunner for ScriptedRunner {
        fn run(&self, program: &str, args: &[String]) -> Result<CommandOutput> {
            self.calls
                .lock()
                .unwrap()
                .push((program.to_string(), args.to_vec()));
            let mut outputs = self.outputs.lock().unwrap();
            let queue = outputs.entry(program.to_string()).or_default();
            if queue.is_empty() {
                return Ok(ok("", ""));
            }
            match queue.remove(0) {
                Ok(output) => Ok(output),
                Err(message) => Err(anyhow::anyhow!(message)),
            }
        }

        fn is_available(&self, program: &str) -> bool {
            self.available.iter().any(|t| t == program)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_execute_command_real() {
        let output = execute_command("echo", &["test"]).unwrap();
        assert!(output.success);
        assert!(output.stdout.contains("test"));
    }

    #[test]
    fn test_execute_command_failure() {
        let output = execute_command("false", &[]).unwrap();
        assert!(!output.success);
        assert_eq!(output.exit_code, Some(1));
    }

    #[test]
    fn test_execute_command_missing_program() {
        assert!(execute_command("nonexistent_command_xyz123", &[]).is_err());
    }

    #[test]
    fn test_check_command() {
        assert!(check_command("sh").is_some());
        assert!(check_command("nonexistent_command_xyz123").is_none());
    }

    #[test]
    fn test_system_runner_runs_argv() -> Result<()> {
        let output = SystemRunner.run("sh", &["-c".to_string(), "echo $0 >&2".to_string(), "probe".to_string()])?;
        assert!(output.success);
        assert!(output.stderr.contains("probe"));
        assert!(output.combined().contains("probe"));
        Ok(())
    }
}
