//! Helpers for testing.
//!
//! [`RecordingRunner`] is a [`ProcessRunner`] that never spawns anything. It records every
//! command it is asked to run and answers with scripted exit codes, which makes it possible to
//! test job lifecycles and worker pools without touching the shell.
//!
//! # Example
//!
//! ```
//! # tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(async {
//! use std::sync::Arc;
//! use buildrunner::prelude::*;
//! use buildrunner::testing::RecordingRunner;
//!
//! let dir = std::env::temp_dir().join("buildrunner-doc-example");
//! let runner_config = Arc::new(RunnerConfig::new(dir.join("logs")).unwrap());
//! let config = BuildConfig::new(dir.join("workspace"))
//!     .with_toolchain("/opt/tc")
//!     .with_build(vec!["make -j3"]);
//! let mut job = Job::new(1, config, runner_config);
//!
//! let runner = RecordingRunner::new().failing_on("make", 2);
//! assert!(job.start(&runner).await.is_err());
//! assert_eq!(job.status(), JobStatus::Failed);
//! assert!(runner.commands()[0].starts_with("ln -sf /opt/tc"));
//! # });
//! ```
use std::{
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex, PoisonError,
    },
    time::Duration,
};

use async_trait::async_trait;

use crate::process::{ProcessError, ProcessRunner};

/// A command received by a [`RecordingRunner`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedCommand {
    pub command: String,
    pub working_dir: PathBuf,
}

/// A scripted [`ProcessRunner`].
///
/// Clones share their recordings, so a clone can be handed to a [`crate::WorkerPool`] and the
/// recordings checked through another.
#[derive(Debug, Clone, Default)]
pub struct RecordingRunner {
    calls: Arc<Mutex<Vec<RecordedCommand>>>,
    failures: Vec<(String, i32)>,
    delay: Option<Duration>,
    in_flight: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

impl RecordingRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Commands containing `pattern` exit with `exit_code`. Everything else exits with 0.
    pub fn failing_on(mut self, pattern: impl Into<String>, exit_code: i32) -> Self {
        self.failures.push((pattern.into(), exit_code));
        self
    }

    /// Every command takes `delay` to run.
    pub fn with_delay(self, delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..self
        }
    }

    pub fn calls(&self) -> Vec<RecordedCommand> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn commands(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .map(|call| call.command)
            .collect()
    }

    /// The largest number of commands that were running at the same time.
    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    fn exit_code(&self, command: &str) -> i32 {
        self.failures
            .iter()
            .find(|(pattern, _)| command.contains(pattern.as_str()))
            .map(|(_, exit_code)| *exit_code)
            .unwrap_or(0)
    }
}

#[async_trait]
impl ProcessRunner for RecordingRunner {
    async fn execute(&self, command: &str, working_dir: &Path) -> Result<i32, ProcessError> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(RecordedCommand {
                command: command.to_owned(),
                working_dir: working_dir.to_owned(),
            });

        let running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(running, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        Ok(self.exit_code(command))
    }
}
