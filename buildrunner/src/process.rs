//! Execution of individual shell commands.
//!
//! Jobs only decide which command strings to run and where their output goes. Running them is
//! delegated to a [`ProcessRunner`], which keeps the job lifecycle testable without spawning
//! processes (see [`crate::testing::RecordingRunner`]).
use std::{
    path::{Path, PathBuf},
    process::Stdio,
};

use async_trait::async_trait;
use thiserror::Error;
use tokio::process::Command;

/// Runs one shell command to completion.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ProcessRunner: Send + Sync {
    /// Runs `command` with `working_dir` as its current directory and returns its exit code.
    async fn execute(&self, command: &str, working_dir: &Path) -> Result<i32, ProcessError>;
}

/// Runs commands through `sh -c`.
#[derive(Debug, Clone)]
pub struct ShellRunner {
    shell: PathBuf,
}

impl Default for ShellRunner {
    fn default() -> Self {
        Self::new("sh")
    }
}

impl ShellRunner {
    pub fn new(shell: impl Into<PathBuf>) -> Self {
        Self {
            shell: shell.into(),
        }
    }
}

#[async_trait]
impl ProcessRunner for ShellRunner {
    async fn execute(&self, command: &str, working_dir: &Path) -> Result<i32, ProcessError> {
        let status = Command::new(&self.shell)
            .arg("-c")
            .arg(command)
            .current_dir(working_dir)
            .stdin(Stdio::null())
            .status()
            .await
            .map_err(|source| ProcessError::Spawn {
                command: command.to_owned(),
                source,
            })?;

        status.code().ok_or_else(|| ProcessError::Terminated {
            command: command.to_owned(),
        })
    }
}

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("Failed to start `{command}`")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },
    #[error("`{command}` was terminated by a signal")]
    Terminated { command: String },
}
