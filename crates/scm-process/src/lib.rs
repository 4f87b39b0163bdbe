//! Subprocess execution for shared-config-manager.
//!
//! The source engines shell out to `git`, `rsync`, `rclone`, `tar` and
//! `envsubst`. This crate wraps those invocations behind a small async API
//! with working-directory control, environment overrides and full
//! stdout/stderr capture, so the callers never block the scheduler on a
//! long-running subprocess.
//!
//! # Example
//!
//! ```ignore
//! use scm_process::run_command;
//!
//! let result = run_command("git", &["--version"]).await.expect("run");
//! assert!(result.success);
//! assert!(result.stdout.contains("git"));
//! ```

use std::path::Path;
use std::process::{Output, Stdio};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

/// Result of a command execution
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandResult {
    /// Whether the command succeeded (exit code 0)
    pub success: bool,
    /// Exit code (if available)
    pub exit_code: Option<i32>,
    /// Standard output
    pub stdout: String,
    /// Standard error
    pub stderr: String,
    /// Duration of execution
    pub duration_ms: u64,
}

impl CommandResult {
    /// Check if the command succeeded
    pub fn ok(&self) -> Result<&Self> {
        if self.success {
            Ok(self)
        } else {
            Err(anyhow::anyhow!(
                "command failed with exit code {:?}: {}",
                self.exit_code,
                self.stderr
            ))
        }
    }

    /// Create a result from a process output
    pub fn from_output(output: &Output, duration: Duration) -> Self {
        Self {
            success: output.status.success(),
            exit_code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            duration_ms: duration.as_millis() as u64,
        }
    }
}

/// Run a command and capture its output
pub async fn run_command(program: &str, args: &[&str]) -> Result<CommandResult> {
    let start = std::time::Instant::now();
    debug!("running: {} {}", program, args.join(" "));

    let output = Command::new(program)
        .args(args)
        .output()
        .await
        .with_context(|| format!("failed to run command: {} {:?}", program, args))?;

    Ok(CommandResult::from_output(&output, start.elapsed()))
}

/// Run a command in a specific directory
pub async fn run_command_in_dir(
    program: &str,
    args: &[&str],
    dir: &Path,
) -> Result<CommandResult> {
    let start = std::time::Instant::now();
    debug!("running: {} {} (in {})", program, args.join(" "), dir.display());

    let output = Command::new(program)
        .args(args)
        .current_dir(dir)
        .output()
        .await
        .with_context(|| {
            format!(
                "failed to run command: {} {:?} in {}",
                program,
                args,
                dir.display()
            )
        })?;

    Ok(CommandResult::from_output(&output, start.elapsed()))
}

/// Run a command with extra environment variables
pub async fn run_command_with_env(
    program: &str,
    args: &[&str],
    env: &[(String, String)],
) -> Result<CommandResult> {
    let start = std::time::Instant::now();

    let mut cmd = Command::new(program);
    cmd.args(args);

    for (key, value) in env {
        cmd.env(key, value);
    }

    let output = cmd
        .output()
        .await
        .with_context(|| format!("failed to run command: {} {:?}", program, args))?;

    Ok(CommandResult::from_output(&output, start.elapsed()))
}

/// Run a command as a filter: feed `input` on stdin, capture stdout.
///
/// The child sees exactly the environment given in `env` (the parent
/// environment is cleared), which is what template expansion wants.
pub async fn run_command_filter(
    program: &str,
    args: &[&str],
    env: &[(String, String)],
    input: &[u8],
) -> Result<CommandResult> {
    let start = std::time::Instant::now();

    // The child has no PATH to resolve against, so resolve here.
    let resolved = which::which(program)
        .with_context(|| format!("command not found: {}", program))?;

    let mut cmd = Command::new(resolved);
    cmd.args(args)
        .env_clear()
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    for (key, value) in env {
        cmd.env(key, value);
    }

    let mut child = cmd
        .spawn()
        .with_context(|| format!("failed to spawn command: {}", program))?;

    let mut stdin = child
        .stdin
        .take()
        .with_context(|| format!("no stdin handle for command: {}", program))?;
    stdin
        .write_all(input)
        .await
        .with_context(|| format!("failed to write stdin of command: {}", program))?;
    drop(stdin);

    let output = child
        .wait_with_output()
        .await
        .with_context(|| format!("failed to run command: {} {:?}", program, args))?;

    Ok(CommandResult::from_output(&output, start.elapsed()))
}

/// Check if a command exists in PATH
pub fn command_exists(program: &str) -> bool {
    which::which(program).is_ok()
}

/// Get the full path to a command
pub fn which(program: &str) -> Option<std::path::PathBuf> {
    which::which(program).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn run_command_version() {
        let result = run_command("sh", &["-c", "echo hello"]).await.expect("run");
        assert!(result.success);
        assert_eq!(result.stdout.trim(), "hello");
    }

    #[tokio::test]
    async fn run_command_failure() {
        let result = run_command("sh", &["-c", "exit 3"]).await.expect("run");
        assert!(!result.success);
        assert_eq!(result.exit_code, Some(3));
    }

    #[tokio::test]
    async fn run_command_in_dir_uses_cwd() {
        let td = tempfile::tempdir().expect("tempdir");
        let result = run_command_in_dir("pwd", &[], td.path()).await.expect("run");
        assert!(result.success);
        // Compare canonical forms, the tempdir may sit behind a symlink.
        let reported = std::fs::canonicalize(result.stdout.trim()).expect("canonicalize");
        let expected = std::fs::canonicalize(td.path()).expect("canonicalize");
        assert_eq!(reported, expected);
    }

    #[tokio::test]
    async fn run_command_with_env_passes_vars() {
        let result = run_command_with_env(
            "sh",
            &["-c", "echo $SCM_TEST_VALUE"],
            &[("SCM_TEST_VALUE".to_string(), "forty-two".to_string())],
        )
        .await
        .expect("run");
        assert_eq!(result.stdout.trim(), "forty-two");
    }

    #[tokio::test]
    async fn run_command_filter_feeds_stdin() {
        let result = run_command_filter("cat", &[], &[], b"line in, line out")
            .await
            .expect("run");
        assert!(result.success);
        assert_eq!(result.stdout, "line in, line out");
    }

    #[tokio::test]
    async fn run_command_filter_clears_environment() {
        let result = run_command_filter("env", &[], &[("ONLY".to_string(), "this".to_string())], b"")
            .await
            .expect("run");
        assert!(result.success);
        assert_eq!(result.stdout.trim(), "ONLY=this");
    }

    #[test]
    fn command_result_ok() {
        let result = CommandResult {
            success: true,
            exit_code: Some(0),
            stdout: "output".to_string(),
            stderr: "".to_string(),
            duration_ms: 100,
        };

        assert!(result.ok().is_ok());
    }

    #[test]
    fn command_result_err() {
        let result = CommandResult {
            success: false,
            exit_code: Some(1),
            stdout: "".to_string(),
            stderr: "error".to_string(),
            duration_ms: 100,
        };

        assert!(result.ok().is_err());
    }

    #[test]
    fn command_exists_sh() {
        assert!(command_exists("sh"));
    }

    #[test]
    fn command_exists_nonexistent() {
        assert!(!command_exists("this-command-does-not-exist-xyz123"));
    }

    #[test]
    fn command_result_serialization() {
        let result = CommandResult {
            success: true,
            exit_code: Some(0),
            stdout: "output".to_string(),
            stderr: "".to_string(),
            duration_ms: 150,
        };

        let json = serde_json::to_string(&result).expect("serialize");
        assert!(json.contains("\"success\":true"));
        assert!(json.contains("\"stdout\":\"output\""));
    }
}
