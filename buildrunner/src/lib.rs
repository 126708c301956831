//! Runs shell build jobs across a fixed pool of workers.
//!
//! A [`job::Job`] is a workspace plus an ordered list of shell commands staged from its
//! configuration. Each command carries the redirection of its output into the job's own log
//! file. A [`WorkerPool`] owns a fixed number of workers that take jobs off a shared queue and run
//! them one at a time, so different jobs build concurrently while the commands of one job always
//! run in order.
//!
//! # Example
//!
//! ```no_run
//! use buildrunner::prelude::*;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let pool = WorkerPool::new(RunnerConfig::from_current_dir()?, ShellRunner::default());
//!
//! let config = JobConfig::from_file("json/qemu.json")?.validate()?;
//! let id = pool.submit(pool.job(1, config))?;
//!
//! pool.wait_for_all_complete().await?;
//! println!("job {id} {}", pool.status(id).unwrap());
//!
//! pool.graceful_shutdown().await?;
//! # Ok(())
//! # }
//! ```
use std::sync::Arc;

use thiserror::Error;
use tokio::{
    sync::{mpsc, watch, Mutex},
    task::{JoinError, JoinHandle},
};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

pub mod config;
pub mod job;
pub mod prelude;
pub mod process;
pub mod registry;
pub mod testing;

use config::{BuildConfig, RunnerConfig};
use job::{Job, JobId, JobStatus};
use process::ProcessRunner;
use registry::{JobRecord, JobRegistry};

type JobReceiver = Arc<Mutex<mpsc::UnboundedReceiver<Job>>>;

/// A fixed set of workers draining a shared job queue.
///
/// Workers are spawned on the current tokio runtime when the pool is created. Each worker takes
/// one job at a time and runs its whole lifecycle before taking the next one.
#[derive(Debug)]
pub struct WorkerPool {
    sender: mpsc::UnboundedSender<Job>,
    workers: Vec<WorkerHandle>,
    outstanding: Arc<watch::Sender<usize>>,
    registry: JobRegistry,
    config: Arc<RunnerConfig>,
    cancellation_token: CancellationToken,
}

#[derive(Debug)]
struct WorkerHandle {
    worker: usize,
    handle: JoinHandle<()>,
}

impl WorkerHandle {
    async fn join(self) -> Result<(), WorkerPoolError> {
        let worker = self.worker;
        self.handle.await.map_err(|err| {
            tracing::error!(?err, worker, "Build worker {worker} failed to shut down");
            WorkerPoolError::ShutdownFailed
        })
    }
}

impl WorkerPool {
    /// Spawns `config.workers()` workers running commands through `runner`.
    pub fn new(config: RunnerConfig, runner: impl ProcessRunner + 'static) -> Self {
        let config = Arc::new(config);
        let runner: Arc<dyn ProcessRunner> = Arc::new(runner);
        let (sender, receiver) = mpsc::unbounded_channel();
        let receiver: JobReceiver = Arc::new(Mutex::new(receiver));
        let (outstanding, _) = watch::channel(0);
        let outstanding = Arc::new(outstanding);
        let registry = JobRegistry::new();
        let cancellation_token = CancellationToken::new();

        let workers = (0..config.workers())
            .map(|worker| {
                let handle = tokio::spawn(
                    Worker {
                        worker,
                        receiver: receiver.clone(),
                        runner: runner.clone(),
                        registry: registry.clone(),
                        outstanding: outstanding.clone(),
                        cancellation_token: cancellation_token.clone(),
                    }
                    .run(),
                );
                WorkerHandle { worker, handle }
            })
            .collect();

        tracing::debug!(workers = config.workers(), "Started build worker pool");
        Self {
            sender,
            workers,
            outstanding,
            registry,
            config,
            cancellation_token,
        }
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    /// Creates a job sharing this pool's runner configuration.
    pub fn job(&self, id: impl Into<JobId>, config: BuildConfig) -> Job {
        Job::new(id, config, self.config.clone())
    }

    /// Queues a job for the next free worker.
    ///
    /// Ids name log files, so a job is rejected while another job with the same id is still
    /// pending or running.
    pub fn submit(&self, job: Job) -> Result<JobId, WorkerPoolError> {
        let job_id = job.id();
        if !self.registry.register(&job) {
            return Err(WorkerPoolError::DuplicateJob(job_id));
        }
        self.outstanding.send_modify(|outstanding| *outstanding += 1);
        if self.sender.send(job).is_err() {
            self.outstanding
                .send_modify(|outstanding| *outstanding = outstanding.saturating_sub(1));
            self.registry.remove(job_id);
            return Err(WorkerPoolError::QueueClosed);
        }
        tracing::debug!(%job_id, "Queued build job {job_id}");
        Ok(job_id)
    }

    /// Waits until every submitted job has finished.
    pub async fn wait_for_all_complete(&self) -> Result<(), WorkerPoolError> {
        let mut outstanding = self.outstanding.subscribe();
        outstanding
            .wait_for(|outstanding| *outstanding == 0)
            .await
            .map(|_| ())
            .map_err(|_| WorkerPoolError::QueueClosed)
    }

    /// Number of submitted jobs that have not finished yet.
    pub fn outstanding(&self) -> usize {
        *self.outstanding.borrow()
    }

    pub fn status(&self, id: JobId) -> Option<JobStatus> {
        self.registry.status(id)
    }

    pub fn record(&self, id: JobId) -> Option<JobRecord> {
        self.registry.get(id)
    }

    /// Records of every submitted job, oldest first.
    pub fn records(&self) -> Vec<JobRecord> {
        self.registry.records()
    }

    /// Closes the queue, lets the workers run every job still queued and waits for them to exit.
    pub async fn graceful_shutdown(self) -> Result<(), WorkerPoolError> {
        tracing::debug!(outstanding = self.outstanding(), "Draining build worker pool");
        let Self {
            sender, workers, ..
        } = self;
        drop(sender);
        join_all(workers).await
    }

    /// Stops the workers once their current job is done. Jobs still queued are never run.
    pub async fn shutdown(self) -> Result<(), WorkerPoolError> {
        tracing::debug!(outstanding = self.outstanding(), "Shutting down build worker pool");
        self.cancellation_token.cancel();
        join_all(self.workers).await
    }
}

async fn join_all(workers: Vec<WorkerHandle>) -> Result<(), WorkerPoolError> {
    futures::future::join_all(workers.into_iter().map(WorkerHandle::join))
        .await
        .into_iter()
        .collect()
}

struct Worker {
    worker: usize,
    receiver: JobReceiver,
    runner: Arc<dyn ProcessRunner>,
    registry: JobRegistry,
    outstanding: Arc<watch::Sender<usize>>,
    cancellation_token: CancellationToken,
}

impl Worker {
    async fn run(self) {
        loop {
            let job = tokio::select! {
                biased;
                _ = self.cancellation_token.cancelled() => break,
                job = next_job(&self.receiver) => job,
            };
            let Some(job) = job else {
                break;
            };
            self.execute(job).await;
        }
        tracing::debug!(worker = self.worker, "Build worker {} stopped", self.worker);
    }

    async fn execute(&self, mut job: Job) {
        let job_id = job.id();
        self.registry.mark_running(job_id);

        let span = tracing::info_span!("build_job", %job_id, worker = self.worker);
        let runner = self.runner.clone();
        let result = tokio::spawn(
            async move {
                let result = job.start(runner.as_ref()).await;
                (job.status(), result)
            }
            .instrument(span),
        )
        .await;

        match result {
            Ok((status, Ok(()))) => self.registry.mark_finished(job_id, status, None),
            Ok((status, Err(error))) => {
                self.registry
                    .mark_finished(job_id, status, Some(error.to_string()))
            }
            Err(error) => {
                let message = panic_message(error);
                tracing::error!(%job_id, message, "Build job {job_id} panicked");
                self.registry
                    .mark_finished(job_id, JobStatus::Failed, Some(message))
            }
        }
        self.outstanding
            .send_modify(|outstanding| *outstanding = outstanding.saturating_sub(1));
    }
}

async fn next_job(receiver: &JobReceiver) -> Option<Job> {
    receiver.lock().await.recv().await
}

fn panic_message(error: JoinError) -> String {
    let msg = error.to_string();
    match error.try_into_panic() {
        Ok(panic) => panic
            .downcast_ref::<&str>()
            .map(ToString::to_string)
            .or_else(|| panic.downcast_ref::<String>().cloned())
            .unwrap_or(msg),
        Err(_) => msg,
    }
}

#[derive(Debug, Error)]
pub enum WorkerPoolError {
    #[error("A job with id {0} is already queued or running")]
    DuplicateJob(JobId),
    #[error("The job queue is closed")]
    QueueClosed,
    #[error("Failed to gracefully shut down")]
    ShutdownFailed,
}
