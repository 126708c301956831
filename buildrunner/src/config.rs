//! Job and runner configuration.
//!
//! A build job is described by a small JSON record ([`JobConfig`]). Before a job can be
//! constructed the record is validated into a [`BuildConfig`], which is what the job actually
//! stages its commands from.
//!
//! Settings shared by every job of a process, such as where the logs are written, live in
//! [`RunnerConfig`] and are handed to the [`crate::WorkerPool`] and each [`crate::job::Job`] when
//! they are created.
//!
//! # Example
//!
//! ```
//! use buildrunner::config::JobConfig;
//!
//! let config: JobConfig = r#"{
//!     "workspace": "/tmp/qemu",
//!     "reference": "/tmp/reference",
//!     "repo_xml": "default.xml",
//!     "build": ["repo init -u https://github.com/OP-TEE/manifest.git -m default.xml"]
//! }"#
//! .parse()
//! .unwrap();
//!
//! let config = config.validate().unwrap();
//! assert_eq!(config.reference.as_deref(), Some("/tmp/reference"));
//! ```
use std::{
    path::{Path, PathBuf},
    str::FromStr,
};

use serde::Deserialize;
use thiserror::Error;

use crate::job::JobId;

/// The manifest used when none is given to [`BuildConfig::new`].
pub const DEFAULT_MANIFEST: &str = "default.xml";
/// Number of workers in a pool unless configured otherwise.
pub const DEFAULT_WORKERS: usize = 3;
/// Folder, relative to the current directory, where job logs are written by default.
pub const DEFAULT_LOG_FOLDER: &str = "logs";

/// The raw job record as it appears in a JSON job file.
///
/// Every field is optional at this level; [`JobConfig::validate`] enforces the mandatory ones.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct JobConfig {
    pub workspace: Option<String>,
    pub reference: Option<String>,
    pub repo_xml: Option<String>,
    pub build: Option<Vec<String>>,
    pub clean: Option<Vec<String>>,
    pub folders: Option<Vec<String>>,
    pub toolchain: Option<String>,
    #[serde(rename = "override")]
    pub overrides: Option<serde_json::Value>,
    #[serde(rename = "type")]
    pub job_type: Option<String>,
}

impl JobConfig {
    /// Reads and parses a JSON job file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_owned(),
            source,
        })?;
        contents.parse()
    }

    /// Checks the mandatory fields and produces the record a job is built from.
    ///
    /// `workspace`, `reference` and `repo_xml` must all be present. An empty `reference` is
    /// accepted and means no reference mirror is used.
    pub fn validate(self) -> Result<BuildConfig, ConfigError> {
        let workspace = self
            .workspace
            .ok_or(ConfigError::MissingField("workspace"))?;
        let reference = self
            .reference
            .ok_or(ConfigError::MissingField("reference"))?;
        let manifest = self.repo_xml.ok_or(ConfigError::MissingField("repo_xml"))?;

        Ok(BuildConfig {
            workspace: workspace.into(),
            reference: Some(reference).filter(|reference| !reference.is_empty()),
            manifest,
            build_commands: self.build.unwrap_or_default(),
            clean_commands: self.clean.unwrap_or_default(),
            folders: self.folders.unwrap_or_default(),
            toolchain: self.toolchain.map(PathBuf::from),
            overrides: self.overrides,
            job_type: self.job_type,
        })
    }
}

impl FromStr for JobConfig {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(serde_json::from_str(s)?)
    }
}

/// A validated job configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct BuildConfig {
    /// Root working directory of every command the job runs.
    pub workspace: PathBuf,
    /// Reference mirror handed to `repo init`.
    pub reference: Option<String>,
    /// The repo manifest file name.
    pub manifest: String,
    pub build_commands: Vec<String>,
    pub clean_commands: Vec<String>,
    /// Folders created with `mkdir -p` before anything else runs.
    pub folders: Vec<String>,
    /// A prebuilt toolchain to link into the workspace. When absent the toolchain is built
    /// from source.
    pub toolchain: Option<PathBuf>,
    pub overrides: Option<serde_json::Value>,
    /// Free form tag, usually naming the build target.
    pub job_type: Option<String>,
}

impl BuildConfig {
    pub fn new(workspace: impl Into<PathBuf>) -> Self {
        Self {
            workspace: workspace.into(),
            reference: None,
            manifest: DEFAULT_MANIFEST.to_owned(),
            build_commands: Vec::new(),
            clean_commands: Vec::new(),
            folders: Vec::new(),
            toolchain: None,
            overrides: None,
            job_type: None,
        }
    }

    pub fn with_reference(self, reference: impl Into<String>) -> Self {
        Self {
            reference: Some(reference.into()),
            ..self
        }
    }

    pub fn with_manifest(self, manifest: impl Into<String>) -> Self {
        Self {
            manifest: manifest.into(),
            ..self
        }
    }

    pub fn with_build(self, commands: Vec<impl Into<String>>) -> Self {
        let build_commands = commands.into_iter().map(Into::into).collect();
        Self {
            build_commands,
            ..self
        }
    }

    pub fn with_clean(self, commands: Vec<impl Into<String>>) -> Self {
        let clean_commands = commands.into_iter().map(Into::into).collect();
        Self {
            clean_commands,
            ..self
        }
    }

    pub fn with_folders(self, folders: Vec<impl Into<String>>) -> Self {
        let folders = folders.into_iter().map(Into::into).collect();
        Self { folders, ..self }
    }

    pub fn with_toolchain(self, toolchain: impl Into<PathBuf>) -> Self {
        Self {
            toolchain: Some(toolchain.into()),
            ..self
        }
    }

    pub fn with_job_type(self, job_type: impl Into<String>) -> Self {
        Self {
            job_type: Some(job_type.into()),
            ..self
        }
    }
}

/// Settings shared by every job in a process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunnerConfig {
    log_folder: PathBuf,
    workers: usize,
}

impl RunnerConfig {
    /// Creates a config writing logs to `log_folder`.
    ///
    /// Commands run from inside each job's workspace, so a relative folder is resolved against
    /// the current directory here.
    pub fn new(log_folder: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let log_folder = log_folder.into();
        let log_folder = if log_folder.is_absolute() {
            log_folder
        } else {
            std::env::current_dir()
                .map_err(ConfigError::CurrentDir)?
                .join(log_folder)
        };
        Ok(Self {
            log_folder,
            workers: DEFAULT_WORKERS,
        })
    }

    /// A config logging to `./logs` with the default number of workers.
    pub fn from_current_dir() -> Result<Self, ConfigError> {
        Self::new(DEFAULT_LOG_FOLDER)
    }

    /// Sets the number of workers. A pool always has at least one.
    pub fn with_workers(self, workers: usize) -> Self {
        Self {
            workers: workers.max(1),
            ..self
        }
    }

    pub fn log_folder(&self) -> &Path {
        &self.log_folder
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// The log file of the job with the given id.
    pub fn log_file(&self, id: JobId) -> PathBuf {
        self.log_folder.join(format!("{id}.txt"))
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("'{0}' is mandatory in the job configuration")]
    MissingField(&'static str),
    #[error("Failed to read job configuration {}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to parse job configuration")]
    Parse(#[from] serde_json::Error),
    #[error("Failed to resolve the current directory")]
    CurrentDir(#[source] std::io::Error),
}
