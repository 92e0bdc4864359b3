//! Execution of short-lived host commands.

use std::path::Path;
use std::process::{ExitStatus, Output};
use std::sync::Arc;

use anyhow::Result;
use tokio::process::Command;

/// A shared handle to an executor implementation.
pub type DynExecutor = Arc<dyn Executor>;

#[derive(Debug)]
pub struct CommandFailureInfo {
    pub command: String,
    pub status: ExitStatus,
    pub stdout: String,
    pub stderr: String,
}

impl std::fmt::Display for CommandFailureInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "command [{}] executed and failed with status: {}", self.command, self.status)?;
        write!(f, "  stdout: {}", self.stdout)?;
        write!(f, "  stderr: {}", self.stderr)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ExecutionError {
    #[error("failed to start execution of [{command}]: {err}")]
    ExecutionStart { command: String, err: std::io::Error },
    #[error("{0}")]
    CommandFailure(Box<CommandFailureInfo>),
}

/// Runs commands on the host.
///
/// Every interaction with block devices, filesystems and the cluster admin tool goes through
/// this trait so that it can be replaced in tests.
#[async_trait::async_trait]
pub trait Executor: Send + Sync {
    /// Run the given command to completion, returning its stdout. A non-zero exit status is an
    /// `ExecutionError::CommandFailure`.
    async fn execute(&self, program: &str, args: &[String]) -> Result<String>;

    /// Check if the given path exists on the host.
    async fn stat(&self, path: &Path) -> Result<bool>;
}

/// An executor which runs commands for real.
#[derive(Clone, Default)]
pub struct HostExecutor;

#[async_trait::async_trait]
impl Executor for HostExecutor {
    #[tracing::instrument(level = "trace", skip(self), err)]
    async fn execute(&self, program: &str, args: &[String]) -> Result<String> {
        let mut command = Command::new(program);
        command.args(args);
        let output = command.output().await.map_err(|err| ExecutionError::ExecutionStart {
            command: command_to_string(program, args),
            err,
        })?;
        if !output.status.success() {
            return Err(output_to_exec_error(program, args, &output).into());
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    async fn stat(&self, path: &Path) -> Result<bool> {
        match tokio::fs::metadata(path).await {
            Ok(_) => Ok(true),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err.into()),
        }
    }
}

pub fn command_to_string(program: &str, args: &[String]) -> String {
    std::iter::once(program).chain(args.iter().map(String::as_str)).collect::<Vec<_>>().join(" ")
}

fn output_to_exec_error(program: &str, args: &[String], output: &Output) -> ExecutionError {
    ExecutionError::CommandFailure(Box::new(CommandFailureInfo {
        command: command_to_string(program, args),
        status: output.status,
        stdout: String::from_utf8_lossy(&output.stdout).to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).to_string(),
    }))
}

/// Build an owned argument list from string slices.
pub fn args<I, S>(items: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    items.into_iter().map(Into::into).collect()
}
