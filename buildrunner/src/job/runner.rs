use std::{fmt::Display, path::Path, time::Duration};

use tokio::time::Instant;
use tracing::instrument;

use crate::process::ProcessRunner;

use super::{Job, JobError, JobState};

const BUILD_TIME_MESSAGE: &str = "Total build time";

/// A wall clock duration split into whole hours, whole minutes and seconds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BuildTime {
    pub hours: u64,
    pub minutes: u64,
    pub seconds: f64,
}

impl From<Duration> for BuildTime {
    fn from(value: Duration) -> Self {
        let whole_minutes = value.as_secs() / 60;
        let seconds = value.as_secs_f64() - (whole_minutes * 60) as f64;
        Self {
            hours: whole_minutes / 60,
            minutes: whole_minutes % 60,
            seconds,
        }
    }
}

impl Display for BuildTime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}h {}m {:.2}s", self.hours, self.minutes, self.seconds)
    }
}

impl Job {
    /// Runs the queued commands in order until the queue is empty or a command fails.
    ///
    /// Every command runs with the workspace as its working directory. On failure the rest of
    /// the queue is discarded. Either way the total build time is appended to the job log
    /// afterwards.
    #[instrument(skip(self, runner), fields(job_id = %self.id))]
    pub async fn run<R>(&mut self, runner: &R) -> Result<(), JobError>
    where
        R: ProcessRunner + ?Sized,
    {
        if !matches!(self.state, JobState::Created | JobState::BuildStaged) {
            return Err(JobError::OutOfOrder {
                operation: "run",
                state: self.state,
            });
        }
        let log_folder = self.runner_config.log_folder().to_owned();
        super::create_dir_all(&log_folder).await?;

        self.state = JobState::Running;
        let start = Instant::now();
        let result = self.drain(runner).await;
        let elapsed = BuildTime::from(start.elapsed());

        let discarded = self.queue.clear();
        if discarded > 0 {
            tracing::debug!(job_id = %self.id, discarded, "Discarded remaining commands");
        }
        self.log_build_time(runner, &log_folder, elapsed).await;

        match &result {
            Ok(()) => {
                tracing::info!(job_id = %self.id, %elapsed, "Build job {} succeeded", self.id);
                self.state = JobState::Succeeded;
            }
            Err(error) => {
                tracing::error!(job_id = %self.id, %error, %elapsed, "Build job {} failed", self.id);
                self.state = JobState::Failed;
            }
        }
        result
    }

    async fn drain<R>(&mut self, runner: &R) -> Result<(), JobError>
    where
        R: ProcessRunner + ?Sized,
    {
        while let Some(command) = self.queue.pop_front() {
            tracing::debug!(job_id = %self.id, %command, "Running command");
            let exit_code = runner.execute(&command, &self.config.workspace).await?;
            if exit_code != 0 {
                tracing::warn!(job_id = %self.id, %command, exit_code, "Command failed");
                return Err(JobError::CommandFailed { command, exit_code });
            }
        }
        Ok(())
    }

    /// Appends the build time to the log. Failing to do so does not change the job's outcome.
    async fn log_build_time<R>(&self, runner: &R, log_folder: &Path, elapsed: BuildTime)
    where
        R: ProcessRunner + ?Sized,
    {
        let command = self
            .queue
            .appending(format!("echo '{BUILD_TIME_MESSAGE}: {elapsed}'"));
        tracing::debug!(job_id = %self.id, %command, "Writing build time");
        match runner.execute(&command, log_folder).await {
            Ok(0) => {}
            Ok(exit_code) => {
                tracing::warn!(job_id = %self.id, exit_code, "Failed to write build time")
            }
            Err(error) => tracing::error!(job_id = %self.id, %error, "Failed to write build time"),
        }
    }
}
