//! Re-exports of the types most programs driving a [`crate::WorkerPool`] need.
//!
//! ```
//! # #![allow(unused_imports)]
//! use buildrunner::prelude::*;
//! ```
pub use crate::config::{BuildConfig, JobConfig, RunnerConfig};
pub use crate::job::{BuildTime, Job, JobId, JobState, JobStatus};
pub use crate::process::{ProcessRunner, ShellRunner};
pub use crate::registry::JobRecord;
pub use crate::WorkerPool;
