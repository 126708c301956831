//! Build jobs.
//!
//! A [`Job`] goes through a strictly linear lifecycle. Staging computes every command the job will
//! run, in order, without executing anything:
//!
//! 1. [`Job::stage_folders`] creates the workspace and log folder and queues the configured
//!    folders,
//! 2. [`Job::stage_clean`] queues the clean commands,
//! 3. [`Job::stage_toolchain`] queues exactly one toolchain command, and
//! 4. [`Job::stage_build`] queues the build commands.
//!
//! [`Job::run`] then drains the queue through a [`ProcessRunner`], stopping at the first command
//! that fails. [`Job::start`] performs the whole lifecycle.
use std::{
    fmt::Display,
    path::{Path, PathBuf},
    sync::Arc,
};

use thiserror::Error;

use crate::{
    config::{BuildConfig, ConfigError, JobConfig, RunnerConfig},
    process::{ProcessError, ProcessRunner},
};

pub mod command_queue;
pub(crate) mod runner;

pub use command_queue::{CommandQueue, Redirect};
pub use runner::BuildTime;

/// Directory whose presence marks an initialised repo checkout.
pub const REPO_MARKER: &str = ".repo";
const REPO_PATTERN: &str = "repo";
const REPO_INIT_PATTERN: &str = "repo init";
const TOOLCHAIN_FROM_SOURCE: &str = "cd build && make toolchains -j3";

#[derive(Debug, Eq, PartialEq, Clone, Copy, Hash, PartialOrd, Ord)]
pub struct JobId(u32);

impl From<u32> for JobId {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

impl From<JobId> for u32 {
    fn from(value: JobId) -> Self {
        value.0
    }
}

impl Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The externally visible status of a job.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum JobStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl JobStatus {
    /// Returns true once the job can no longer change.
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }
}

impl Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        })
    }
}

/// Where a job is in its lifecycle.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum JobState {
    Created,
    FoldersStaged,
    CleanStaged,
    ToolchainStaged,
    BuildStaged,
    Running,
    Succeeded,
    Failed,
}

impl JobState {
    pub const fn status(self) -> JobStatus {
        match self {
            Self::Created
            | Self::FoldersStaged
            | Self::CleanStaged
            | Self::ToolchainStaged
            | Self::BuildStaged => JobStatus::Pending,
            Self::Running => JobStatus::Running,
            Self::Succeeded => JobStatus::Succeeded,
            Self::Failed => JobStatus::Failed,
        }
    }
}

impl Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Created => "created",
            Self::FoldersStaged => "folders staged",
            Self::CleanStaged => "clean staged",
            Self::ToolchainStaged => "toolchain staged",
            Self::BuildStaged => "build staged",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        })
    }
}

/// One build: a workspace, its configuration and the commands staged for it.
#[derive(Debug)]
pub struct Job {
    id: JobId,
    config: BuildConfig,
    runner_config: Arc<RunnerConfig>,
    queue: CommandQueue,
    state: JobState,
}

impl Job {
    pub fn new(id: impl Into<JobId>, config: BuildConfig, runner_config: Arc<RunnerConfig>) -> Self {
        let id = id.into();
        let queue = CommandQueue::new(runner_config.log_file(id));
        Self {
            id,
            config,
            runner_config,
            queue,
            state: JobState::Created,
        }
    }

    /// Validates a raw job record and creates the job from it.
    pub fn from_config(
        id: impl Into<JobId>,
        config: JobConfig,
        runner_config: Arc<RunnerConfig>,
    ) -> Result<Self, ConfigError> {
        Ok(Self::new(id, config.validate()?, runner_config))
    }

    pub fn id(&self) -> JobId {
        self.id
    }

    pub fn config(&self) -> &BuildConfig {
        &self.config
    }

    pub fn state(&self) -> JobState {
        self.state
    }

    pub fn status(&self) -> JobStatus {
        self.state.status()
    }

    pub fn log_file(&self) -> &Path {
        self.queue.log_file()
    }

    /// The commands currently queued, in execution order.
    pub fn commands(&self) -> impl Iterator<Item = &str> {
        self.queue.iter()
    }

    /// Stages every command of the job, replacing anything staged before.
    pub async fn stage(&mut self) -> Result<(), JobError> {
        self.reset();
        self.stage_folders().await?;
        self.stage_clean().await?;
        self.stage_toolchain()?;
        self.stage_build()?;
        Ok(())
    }

    /// Stages and then runs the job.
    ///
    /// A staging failure marks the job as failed without running anything.
    pub async fn start<R>(&mut self, runner: &R) -> Result<(), JobError>
    where
        R: ProcessRunner + ?Sized,
    {
        tracing::info!(job_id = %self.id, job_type = ?self.config.job_type, "Starting build job {}", self.id);
        if let Err(error) = self.stage().await {
            tracing::error!(job_id = %self.id, %error, "Failed to stage build job {}", self.id);
            self.queue.clear();
            self.state = JobState::Failed;
            return Err(error);
        }
        self.run(runner).await
    }

    /// Creates the workspace and the log folder, then queues the configured folders.
    ///
    /// The workspace and log folder are created immediately since every queued command depends
    /// on them. The job's log file is truncated here as well.
    pub async fn stage_folders(&mut self) -> Result<(), JobError> {
        self.transition("stage folders", JobState::Created)?;
        let workspace = self.workspace()?.to_owned();

        create_dir_all(&workspace).await?;
        create_dir_all(self.runner_config.log_folder()).await?;
        tokio::fs::File::create(self.queue.log_file())
            .await
            .map_err(|source| JobError::Io {
                path: self.queue.log_file().to_owned(),
                source,
            })?;

        if self.config.folders.is_empty() {
            tracing::debug!(job_id = %self.id, "No folders to create");
        }
        for folder in &self.config.folders {
            let command = self.queue.append(format!("mkdir -p {folder}"));
            tracing::debug!(job_id = %self.id, command, "Queued folder creation");
        }

        self.state = JobState::FoldersStaged;
        Ok(())
    }

    /// Queues the clean commands.
    ///
    /// Commands touching the repo checkout are only queued when the workspace holds a
    /// [`REPO_MARKER`] directory.
    pub async fn stage_clean(&mut self) -> Result<(), JobError> {
        self.transition("stage clean commands", JobState::FoldersStaged)?;
        let marker = self.workspace()?.join(REPO_MARKER);
        let has_checkout = tokio::fs::metadata(&marker)
            .await
            .map(|metadata| metadata.is_dir())
            .unwrap_or(false);

        if self.config.clean_commands.is_empty() {
            tracing::debug!(job_id = %self.id, "No clean commands");
        }
        for command in &self.config.clean_commands {
            if command.contains(REPO_PATTERN) && !has_checkout {
                tracing::debug!(
                    job_id = %self.id,
                    %command,
                    marker = %marker.display(),
                    "Skipping repo clean without a checkout"
                );
                continue;
            }
            let command = self.queue.append(command);
            tracing::debug!(job_id = %self.id, command, "Queued clean command");
        }

        self.state = JobState::CleanStaged;
        Ok(())
    }

    /// Queues the toolchain command: a symlink to the configured toolchain, or a build of the
    /// toolchain from source when none is configured.
    pub fn stage_toolchain(&mut self) -> Result<(), JobError> {
        self.transition("stage toolchain", JobState::CleanStaged)?;
        let workspace = self.workspace()?;

        let command = match &self.config.toolchain {
            Some(toolchain) => format!(
                "ln -sf {} {}",
                toolchain.display(),
                workspace.join("toolchains").display()
            ),
            None => TOOLCHAIN_FROM_SOURCE.to_owned(),
        };
        let command = self.queue.append(command);
        tracing::debug!(job_id = %self.id, command, "Queued toolchain command");

        self.state = JobState::ToolchainStaged;
        Ok(())
    }

    /// Queues the build commands, pointing `repo init` at the reference mirror when one is
    /// configured.
    pub fn stage_build(&mut self) -> Result<(), JobError> {
        self.transition("stage build commands", JobState::ToolchainStaged)?;
        self.workspace()?;

        if self.config.build_commands.is_empty() {
            tracing::debug!(job_id = %self.id, "No build commands");
        }
        for command in &self.config.build_commands {
            let command = match &self.config.reference {
                Some(reference) if command.contains(REPO_INIT_PATTERN) => {
                    format!("{command} --reference {reference}")
                }
                _ => command.to_owned(),
            };
            let command = self.queue.append(command);
            tracing::debug!(job_id = %self.id, command, "Queued build command");
        }

        self.state = JobState::BuildStaged;
        Ok(())
    }

    fn reset(&mut self) {
        let discarded = self.queue.clear();
        if discarded > 0 {
            tracing::debug!(job_id = %self.id, discarded, "Discarded previously staged commands");
        }
        self.state = JobState::Created;
    }

    fn transition(&self, operation: &'static str, expected: JobState) -> Result<(), JobError> {
        if self.state == expected {
            Ok(())
        } else {
            Err(JobError::OutOfOrder {
                operation,
                state: self.state,
            })
        }
    }

    fn workspace(&self) -> Result<&Path, JobError> {
        if self.config.workspace.as_os_str().is_empty() {
            return Err(JobError::MissingWorkspace(self.id));
        }
        Ok(&self.config.workspace)
    }
}

async fn create_dir_all(path: &Path) -> Result<(), JobError> {
    tokio::fs::create_dir_all(path)
        .await
        .map_err(|source| JobError::Io {
            path: path.to_owned(),
            source,
        })
}

#[derive(Debug, Error)]
pub enum JobError {
    #[error("Job {0} has no workspace")]
    MissingWorkspace(JobId),
    #[error("Cannot {operation} while the job is {state}")]
    OutOfOrder {
        operation: &'static str,
        state: JobState,
    },
    #[error("Failed to prepare {}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("`{command}` exited with code {exit_code}")]
    CommandFailed { command: String, exit_code: i32 },
    #[error(transparent)]
    Process(#[from] ProcessError),
}

#[cfg(test)]
pub(crate) mod test {
    use assert_matches::assert_matches;
    use tempfile::TempDir;

    use super::*;

    pub(crate) struct Fixture {
        pub(crate) dir: TempDir,
        pub(crate) runner_config: Arc<RunnerConfig>,
    }

    impl Fixture {
        pub(crate) fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let runner_config = Arc::new(RunnerConfig::new(dir.path().join("logs")).unwrap());
            Self { dir, runner_config }
        }

        pub(crate) fn workspace(&self) -> PathBuf {
            self.dir.path().join("workspace")
        }

        pub(crate) fn config(&self) -> BuildConfig {
            BuildConfig::new(self.workspace())
        }

        pub(crate) fn job(&self, id: u32, config: BuildConfig) -> Job {
            Job::new(id, config, self.runner_config.clone())
        }

        pub(crate) fn log(&self, id: u32) -> String {
            self.runner_config.log_file(id.into()).display().to_string()
        }
    }

    #[tokio::test]
    async fn end_to_end_staging() {
        let fixture = Fixture::new();
        let workspace = fixture.workspace();
        let out = workspace.join("out");
        let config = fixture
            .config()
            .with_reference("/tmp/ref")
            .with_build(vec!["repo init -u URL -m default.xml"])
            .with_folders(vec![out.display().to_string()]);
        let mut job = fixture.job(1, config);

        job.stage().await.unwrap();

        let log = fixture.log(1);
        assert_eq!(job.state(), JobState::BuildStaged);
        assert_eq!(
            job.commands().collect::<Vec<_>>(),
            vec![
                format!("mkdir -p {} > {log} 2>&1", out.display()),
                format!("{TOOLCHAIN_FROM_SOURCE} >> {log} 2>&1"),
                format!("repo init -u URL -m default.xml --reference /tmp/ref >> {log} 2>&1"),
            ]
        );
    }

    #[tokio::test]
    async fn stage_folders_creates_workspace_and_log() {
        let fixture = Fixture::new();
        let mut job = fixture.job(2, fixture.config());

        job.stage_folders().await.unwrap();

        assert!(fixture.workspace().is_dir());
        assert!(fixture.runner_config.log_folder().is_dir());
        assert!(job.log_file().is_file());
        assert_eq!(job.commands().count(), 0);
        assert_eq!(job.state(), JobState::FoldersStaged);
    }

    #[tokio::test]
    async fn stage_folders_truncates_existing_log() {
        let fixture = Fixture::new();
        let mut job = fixture.job(3, fixture.config());
        std::fs::create_dir_all(fixture.runner_config.log_folder()).unwrap();
        std::fs::write(job.log_file(), "previous build output\n").unwrap();

        job.stage_folders().await.unwrap();

        assert_eq!(std::fs::read_to_string(job.log_file()).unwrap(), "");
    }

    #[tokio::test]
    async fn missing_workspace_stages_nothing() {
        let fixture = Fixture::new();
        let config = BuildConfig::new("").with_build(vec!["make"]);
        let mut job = fixture.job(4, config);

        assert_matches!(job.stage().await, Err(JobError::MissingWorkspace(id)) if id == JobId(4));
        assert_eq!(job.commands().count(), 0);
        assert!(!job.log_file().exists());
    }

    #[tokio::test]
    async fn stages_must_run_in_order() {
        let fixture = Fixture::new();
        let mut job = fixture.job(5, fixture.config());

        assert_matches!(
            job.stage_toolchain(),
            Err(JobError::OutOfOrder { state: JobState::Created, .. })
        );
        assert_matches!(
            job.stage_clean().await,
            Err(JobError::OutOfOrder { state: JobState::Created, .. })
        );

        job.stage_folders().await.unwrap();
        assert_matches!(
            job.stage_folders().await,
            Err(JobError::OutOfOrder { state: JobState::FoldersStaged, .. })
        );
    }

    #[tokio::test]
    async fn configured_toolchain_is_linked() {
        let fixture = Fixture::new();
        let mut job = fixture.job(6, fixture.config().with_toolchain("/opt/tc"));

        job.stage().await.unwrap();

        let commands = job.commands().collect::<Vec<_>>();
        assert_eq!(
            commands,
            vec![format!(
                "ln -sf /opt/tc {}/toolchains > {} 2>&1",
                fixture.workspace().display(),
                fixture.log(6)
            )]
        );
        assert!(!commands.iter().any(|c| c.contains("make toolchains")));
    }

    #[tokio::test]
    async fn missing_toolchain_is_built_from_source() {
        let fixture = Fixture::new();
        let mut job = fixture.job(7, fixture.config());

        job.stage().await.unwrap();

        let commands = job.commands().collect::<Vec<_>>();
        assert_eq!(commands.len(), 1);
        assert!(commands[0].starts_with(TOOLCHAIN_FROM_SOURCE));
        assert!(!commands.iter().any(|c| c.starts_with("ln -sf")));
    }

    #[tokio::test]
    async fn reference_is_added_to_repo_init_only() {
        let fixture = Fixture::new();
        let config = fixture
            .config()
            .with_toolchain("/opt/tc")
            .with_reference("/ref")
            .with_build(vec!["repo init -u URL", "repo sync -j3", "make -j3"]);
        let mut job = fixture.job(8, config);

        job.stage().await.unwrap();

        let commands = job.commands().skip(1).collect::<Vec<_>>();
        assert!(commands[0].starts_with("repo init -u URL --reference /ref >>"));
        assert_eq!(commands[0].matches("--reference").count(), 1);
        assert!(commands[1].starts_with("repo sync -j3 >>"));
        assert!(commands[2].starts_with("make -j3 >>"));
    }

    #[tokio::test]
    async fn repo_init_is_verbatim_without_reference() {
        let fixture = Fixture::new();
        let config = fixture
            .config()
            .with_toolchain("/opt/tc")
            .with_build(vec!["repo init -u URL"]);
        let mut job = fixture.job(9, config);

        job.stage().await.unwrap();

        let build = job.commands().nth(1).unwrap();
        assert_eq!(build, format!("repo init -u URL >> {} 2>&1", fixture.log(9)));
    }

    #[tokio::test]
    async fn repo_clean_requires_checkout() {
        let fixture = Fixture::new();
        let config = fixture
            .config()
            .with_toolchain("/opt/tc")
            .with_clean(vec!["repo forall -c 'git clean -xdf'", "rm -rf out"]);
        let mut job = fixture.job(10, config);

        job.stage().await.unwrap();

        let commands = job.commands().collect::<Vec<_>>();
        assert_eq!(commands.len(), 2);
        assert!(commands[0].starts_with("rm -rf out >"));
        assert!(!commands.iter().any(|c| c.contains("repo forall")));
    }

    #[tokio::test]
    async fn repo_clean_with_checkout() {
        let fixture = Fixture::new();
        std::fs::create_dir_all(fixture.workspace().join(REPO_MARKER)).unwrap();
        let config = fixture
            .config()
            .with_toolchain("/opt/tc")
            .with_clean(vec!["repo forall -c 'git clean -xdf'", "rm -rf out"]);
        let mut job = fixture.job(11, config);

        job.stage().await.unwrap();

        let commands = job.commands().collect::<Vec<_>>();
        assert_eq!(commands.len(), 3);
        assert!(commands[0].starts_with("repo forall -c 'git clean -xdf' >"));
        assert!(commands[1].starts_with("rm -rf out >>"));
    }

    #[tokio::test]
    async fn restaging_reflects_current_checkout() {
        let fixture = Fixture::new();
        let config = fixture
            .config()
            .with_toolchain("/opt/tc")
            .with_clean(vec!["repo forall -c 'git clean -xdf'"])
            .with_folders(vec!["out"])
            .with_build(vec!["make"]);
        let mut job = fixture.job(12, config);

        job.stage().await.unwrap();
        let first = job.commands().map(str::to_owned).collect::<Vec<_>>();
        assert_eq!(first.len(), 3);

        job.stage().await.unwrap();
        assert_eq!(job.commands().collect::<Vec<_>>(), first);

        std::fs::create_dir_all(fixture.workspace().join(REPO_MARKER)).unwrap();
        job.stage().await.unwrap();
        let commands = job.commands().collect::<Vec<_>>();
        assert_eq!(commands.len(), 4);
        assert!(commands[0].starts_with("mkdir -p out >"));
        assert!(commands[1].starts_with("repo forall"));
    }

    #[test]
    fn state_maps_to_status() {
        assert_eq!(JobState::Created.status(), JobStatus::Pending);
        assert_eq!(JobState::BuildStaged.status(), JobStatus::Pending);
        assert_eq!(JobState::Running.status(), JobStatus::Running);
        assert_eq!(JobState::Succeeded.status(), JobStatus::Succeeded);
        assert_eq!(JobState::Failed.status(), JobStatus::Failed);
        assert!(JobStatus::Failed.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
    }

    #[test]
    fn from_config_validates() {
        let fixture = Fixture::new();
        let config = JobConfig {
            workspace: Some("/tmp/w".to_owned()),
            ..Default::default()
        };

        assert_matches!(
            Job::from_config(1, config, fixture.runner_config.clone()),
            Err(ConfigError::MissingField("reference"))
        );
    }
}
