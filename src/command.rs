//! Child process execution for stage bodies and notification clients.
//!
//! All external commands go through this module so that every child:
//!
//! - runs in its own process group with a parent-death signal
//! - is tracked in the global [`ChildRegistry`](crate::process_guard::ChildRegistry)
//!   while it runs
//! - has its exact command line logged

use std::process::{Command, ExitStatus, Stdio};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use nix::sys::signal::Signal;
use tracing::{debug, info, warn};

use crate::process_guard::{GuardedCommand, TrackedChild, signal_group};

/// Output from a finished command.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    /// Exit code (None if terminated by signal)
    pub exit_code: Option<i32>,
    pub success: bool,
}

impl CommandOutput {
    /// Check if the command succeeded and return an error if not.
    pub fn ensure_success(&self, context: &str) -> Result<()> {
        if self.success {
            Ok(())
        } else {
            let code = self.exit_code.unwrap_or(-1);
            anyhow::bail!("{} failed (exit code {}): {}", context, code, self.stderr.trim())
        }
    }
}

/// Run a command to completion, capturing stdout and stderr.
///
/// A non-zero exit is reported through [`CommandOutput::success`], not as an
/// error; `Err` means the command could not be spawned or waited on.
pub fn run_command(program: &str, args: &[&str], env: &[(&str, &str)]) -> Result<CommandOutput> {
    info!(program, ?args, "Running command");

    let mut cmd = Command::new(program);
    cmd.args(args)
        .envs(env.iter().copied())
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .guarded();

    let child = cmd
        .spawn()
        .with_context(|| format!("Failed to spawn {}", program))?;
    let tracked = TrackedChild::track(child.id(), program);
    let output = child.wait_with_output();
    drop(tracked);
    let output = output.with_context(|| format!("Failed waiting for {}", program))?;

    let result = CommandOutput {
        stdout: String::from_utf8_lossy(&output.stdout).to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        exit_code: output.status.code(),
        success: output.status.success(),
    };
    if result.success {
        debug!(program, "Command succeeded");
    } else {
        info!(program, code = ?result.exit_code, "Command failed");
    }
    Ok(result)
}

/// Run a command with output discarded, killing its whole process group if it
/// outlives `timeout`.
///
/// Returns `Ok(None)` on timeout.
pub fn run_with_deadline(
    program: &str,
    args: &[&str],
    timeout: Duration,
) -> Result<Option<ExitStatus>> {
    debug!(program, ?args, "Running command with deadline");

    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .guarded()
        .spawn()
        .with_context(|| format!("Failed to spawn {}", program))?;
    let _tracked = TrackedChild::track(child.id(), program);

    let start = Instant::now();
    let status = loop {
        match child.try_wait() {
            Ok(Some(status)) => break Some(status),
            Ok(None) if start.elapsed() >= timeout => {
                warn!(program, timeout_secs = timeout.as_secs(), "Command timed out, killing it");
                // Spawned as a group leader, so this also reaches anything it forked
                signal_group(child.id() as i32, Signal::SIGKILL);
                let _ = child.wait();
                break None;
            }
            Ok(None) => std::thread::sleep(Duration::from_millis(50)),
            Err(e) => {
                return Err(e).with_context(|| format!("Failed waiting for {}", program));
            }
        }
    };
    Ok(status)
}

/// Check if a binary is available in PATH
pub fn binary_exists(name: &str) -> bool {
    Command::new("which")
        .arg(name)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .guarded()
        .status()
        .map(|status| status.success())
        .unwrap_or(false)
}
