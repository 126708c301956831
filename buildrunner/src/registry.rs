//! Bookkeeping of submitted jobs so their status can be queried while they run.
use std::{
    collections::HashMap,
    sync::{Arc, PoisonError, RwLock},
};

use chrono::{DateTime, Utc};

use crate::job::{Job, JobId, JobStatus};

/// What is known about a submitted job.
#[derive(Debug, Clone, PartialEq)]
pub struct JobRecord {
    pub id: JobId,
    pub job_type: Option<String>,
    pub status: JobStatus,
    pub submitted_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

#[derive(Debug, Default)]
struct RegistryState {
    /// Job ids in submission order.
    order: Vec<JobId>,
    records: HashMap<JobId, JobRecord>,
}

/// Records shared between a pool and its workers.
#[derive(Debug, Clone, Default)]
pub struct JobRegistry {
    state: Arc<RwLock<RegistryState>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a pending job.
    ///
    /// Returns `false`, leaving the registry untouched, when a job with the same id has not
    /// finished yet.
    pub fn register(&self, job: &Job) -> bool {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        match state
            .records
            .get(&job.id())
            .map(|record| record.status.is_terminal())
        {
            Some(false) => return false,
            Some(true) => state.order.retain(|id| *id != job.id()),
            None => {}
        }
        state.order.push(job.id());
        state.records.insert(
            job.id(),
            JobRecord {
                id: job.id(),
                job_type: job.config().job_type.clone(),
                status: JobStatus::Pending,
                submitted_at: Utc::now(),
                started_at: None,
                finished_at: None,
                error: None,
            },
        );
        true
    }

    pub fn mark_running(&self, id: JobId) {
        self.update(id, |record| {
            record.status = JobStatus::Running;
            record.started_at = Some(Utc::now());
        });
    }

    pub fn mark_finished(&self, id: JobId, status: JobStatus, error: Option<String>) {
        self.update(id, |record| {
            record.status = status;
            record.finished_at = Some(Utc::now());
            record.error = error;
        });
    }

    pub fn remove(&self, id: JobId) -> Option<JobRecord> {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        state.order.retain(|existing| *existing != id);
        state.records.remove(&id)
    }

    pub fn get(&self, id: JobId) -> Option<JobRecord> {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .records
            .get(&id)
            .cloned()
    }

    pub fn status(&self, id: JobId) -> Option<JobStatus> {
        self.get(id).map(|record| record.status)
    }

    /// All records, oldest submission first.
    pub fn records(&self) -> Vec<JobRecord> {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        state
            .order
            .iter()
            .filter_map(|id| state.records.get(id))
            .cloned()
            .collect()
    }

    fn update(&self, id: JobId, f: impl FnOnce(&mut JobRecord)) {
        match self
            .state
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .records
            .get_mut(&id)
        {
            Some(record) => f(record),
            None => tracing::warn!(job_id = %id, "No record for job {id}"),
        }
    }
}
