//! Shell-out seam for auxiliary layers
//!
//! Layers never spawn processes directly; they go through a
//! `CommandRunner` so the ordering and planning logic is testable without
//! touching the host.

use crate::error::{FocusError, Result};
use async_trait::async_trait;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;

/// Exit status and captured stderr of a finished command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub success: bool,
    pub code: Option<i32>,
    pub stderr: String,
}

impl CommandOutput {
    /// Convert a failed exit into an auxiliary-layer error
    pub fn check(self, layer: &str, program: &str) -> Result<Self> {
        if self.success {
            Ok(self)
        } else {
            Err(FocusError::AuxiliaryLayer {
                layer: layer.to_string(),
                reason: format!(
                    "{program} exited with {}: {}",
                    self.code
                        .map(|c| c.to_string())
                        .unwrap_or_else(|| "signal".into()),
                    self.stderr.trim()
                ),
            })
        }
    }
}

/// Runs external programs on behalf of layers
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run to completion and capture the outcome
    async fn run(&self, program: &str, args: &[&str]) -> Result<CommandOutput>;

    /// Start without waiting (used to relaunch GUI clients)
    async fn spawn(&self, program: &str, args: &[&str]) -> Result<()>;
}

/// Runs real processes with a per-command timeout
pub struct SystemRunner {
    timeout: Duration,
}

impl SystemRunner {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Default for SystemRunner {
    fn default() -> Self {
        Self::new(Duration::from_secs(10))
    }
}

#[async_trait]
impl CommandRunner for SystemRunner {
    async fn run(&self, program: &str, args: &[&str]) -> Result<CommandOutput> {
        let result = tokio::time::timeout(
            self.timeout,
            Command::new(program)
                .args(args)
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::piped())
                .kill_on_drop(true)
                .output(),
        )
        .await;

        match result {
            Ok(Ok(output)) => Ok(CommandOutput {
                success: output.status.success(),
                code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            }),
            Ok(Err(e)) => Err(FocusError::AuxiliaryLayer {
                layer: program.to_string(),
                reason: format!("failed to execute: {e}"),
            }),
            Err(_) => Err(FocusError::AuxiliaryLayer {
                layer: program.to_string(),
                reason: format!("timed out after {}ms", self.timeout.as_millis()),
            }),
        }
    }

    async fn spawn(&self, program: &str, args: &[&str]) -> Result<()> {
        Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map(|_| ())
            .map_err(|e| FocusError::AuxiliaryLayer {
                layer: program.to_string(),
                reason: format!("failed to launch: {e}"),
            })
    }
}

/// Host operating system family, decides which commands a layer plans
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    MacOs,
    Linux,
    Other,
}

impl Platform {
    pub fn current() -> Self {
        if cfg!(target_os = "macos") {
            Platform::MacOs
        } else if cfg!(target_os = "linux") {
            Platform::Linux
        } else {
            Platform::Other
        }
    }
}

/// Quote a string for embedding in an AppleScript string literal
pub fn applescript_quote(s: &str) -> String {
    format!("\"{}\"", s.replace('\\', "\\\\").replace('"', "\\\""))
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_failure_carries_stderr() {
        let out = CommandOutput {
            success: false,
            code: Some(1),
            stderr: "no permission\n".into(),
        };
        let err = out.check("dns-flush", "dscacheutil").unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("dns-flush"));
        assert!(msg.contains("exited with 1: no permission"));
    }

    #[test]
    fn test_applescript_quote() {
        assert_eq!(applescript_quote("Google Chrome"), "\"Google Chrome\"");
        assert_eq!(applescript_quote("a\"b\\c"), "\"a\\\"b\\\\c\"");
    }

    #[tokio::test]
    async fn test_system_runner_reports_exit_status() {
        let runner = SystemRunner::default();
        let ok = runner.run("true", &[]).await.unwrap();
        assert!(ok.success);
        let fail = runner.run("false", &[]).await.unwrap();
        assert!(!fail.success);
    }

    #[tokio::test]
    async fn test_system_runner_missing_program() {
        let runner = SystemRunner::default();
        let err = runner
            .run("focus-guard-definitely-missing-binary", &[])
            .await
            .unwrap_err();
        assert!(matches!(err, FocusError::AuxiliaryLayer { .. }));
    }
}
