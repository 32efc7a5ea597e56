//! Command executor
//!
//! Runs a key's command through `sh -c` under a hard wall-clock timeout and
//! hands back whatever the command wrote to stdout. Nothing here retries or
//! advances toggle state; that belongs to the dispatcher.

use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::process::Command;

/// Shell used to interpret command strings
const SHELL: &str = "sh";

/// Errors that can occur while running a key command
#[derive(Debug, Error)]
pub enum CommandError {
    #[error("key command is empty, nothing to run")]
    Empty,
    #[error("failed to start command: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("command timed out after {}s", .timeout.as_secs_f32())]
    Timeout { timeout: Duration },
    #[error("command exited with {status}: {stderr}")]
    Failed { status: ExitStatus, stderr: String },
}

/// Trait for running key commands.
/// Implementations must enforce the timeout themselves.
#[async_trait]
pub trait CommandRunner: Send + Sync + 'static {
    async fn run(&self, command: &str, timeout: Duration) -> Result<String, CommandError>;
}

/// Real runner backed by `sh -c`.
///
/// The child is killed if the timeout elapses first.
#[derive(Debug, Default, Clone, Copy)]
pub struct ShellRunner;

#[async_trait]
impl CommandRunner for ShellRunner {
    async fn run(&self, command: &str, timeout: Duration) -> Result<String, CommandError> {
        let child = Command::new(SHELL)
            .arg("-c")
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(CommandError::Spawn)?;

        // Dropping the output future on timeout drops the child, which kills it
        let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(result) => result.map_err(CommandError::Spawn)?,
            Err(_) => {
                log::warn!("Command timed out after {:?}: {}", timeout, command);
                return Err(CommandError::Timeout { timeout });
            }
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            log::warn!("Command failed ({}): {}", output.status, command);
            return Err(CommandError::Failed {
                status: output.status,
                stderr,
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const GENEROUS: Duration = Duration::from_secs(10);

    #[tokio::test]
    async fn test_captures_stdout_verbatim() {
        let out = ShellRunner.run("echo hello", GENEROUS).await.unwrap();
        assert_eq!(out, "hello\n");
    }

    #[tokio::test]
    async fn test_empty_output_is_success() {
        let out = ShellRunner.run("true", GENEROUS).await.unwrap();
        assert_eq!(out, "");
    }

    #[tokio::test]
    async fn test_shell_features_are_available() {
        let out = ShellRunner
            .run("printf '%s-%s' a b | tr a-z A-Z", GENEROUS)
            .await
            .unwrap();
        assert_eq!(out, "A-B");
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_an_error() {
        let err = ShellRunner
            .run("echo oops >&2; exit 3", GENEROUS)
            .await
            .unwrap_err();

        match err {
            CommandError::Failed { status, stderr } => {
                assert_eq!(status.code(), Some(3));
                assert_eq!(stderr, "oops");
            }
            other => panic!("expected Failed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_slow_command_times_out() {
        let started = std::time::Instant::now();
        let err = ShellRunner
            .run("sleep 5", Duration::from_millis(200))
            .await
            .unwrap_err();

        assert!(matches!(err, CommandError::Timeout { .. }));
        assert!(started.elapsed() < Duration::from_secs(4));
    }
}
