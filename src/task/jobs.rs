//! Audit trail of submitted tasks.
//!
//! The task client writes one [`JobRecord`] per submission and updates it on
//! every state change. Storage is pluggable through [`JobStore`]; audit
//! failures are logged and never fail the task.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::TaskState;
use crate::error::{Result, TaskwireError};

/// Stored view of one task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: String,
    pub function: String,
    pub state: TaskState,
    pub attempts: u32,
    /// Endpoint of the runner used by the latest attempt.
    pub runner: Option<String>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl JobRecord {
    pub fn new(id: impl Into<String>, function: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            function: function.into(),
            state: TaskState::Submitted,
            attempts: 0,
            runner: None,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Storage for job records.
pub trait JobStore: Send + Sync + 'static {
    fn create_job(&self, record: JobRecord) -> Result<()>;

    /// Replace the stored record with the same id.
    fn update_job(&self, record: JobRecord) -> Result<()>;

    fn get_job(&self, id: &str) -> Option<JobRecord>;

    /// Remove records last updated more than `max_age` ago. Returns how many.
    fn delete_expired(&self, max_age: Duration) -> usize;
}

const DEFAULT_MAX_JOBS: usize = 10_000;

/// In-memory [`JobStore`] with a capacity limit.
#[derive(Debug)]
pub struct MemoryJobStore {
    jobs: Mutex<HashMap<String, JobRecord>>,
    max_jobs: usize,
}

impl Default for MemoryJobStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_MAX_JOBS)
    }

    pub fn with_capacity(max_jobs: usize) -> Self {
        Self {
            jobs: Mutex::new(HashMap::new()),
            max_jobs,
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, JobRecord>> {
        self.jobs.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl JobStore for MemoryJobStore {
    fn create_job(&self, record: JobRecord) -> Result<()> {
        let mut jobs = self.lock();
        if jobs.len() >= self.max_jobs {
            return Err(TaskwireError::Config(format!(
                "job store is at capacity ({})",
                self.max_jobs
            )));
        }
        jobs.insert(record.id.clone(), record);
        Ok(())
    }

    fn update_job(&self, mut record: JobRecord) -> Result<()> {
        let mut jobs = self.lock();
        match jobs.get_mut(&record.id) {
            Some(slot) => {
                record.updated_at = Utc::now();
                *slot = record;
                Ok(())
            }
            None => Err(TaskwireError::Config(format!("unknown job {}", record.id))),
        }
    }

    fn get_job(&self, id: &str) -> Option<JobRecord> {
        self.lock().get(id).cloned()
    }

    fn delete_expired(&self, max_age: Duration) -> usize {
        let Some(cutoff) = chrono::Duration::from_std(max_age)
            .ok()
            .and_then(|age| Utc::now().checked_sub_signed(age))
        else {
            return 0;
        };
        let mut jobs = self.lock();
        let before = jobs.len();
        jobs.retain(|_, job| job.updated_at >= cutoff);
        before - jobs.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_update_get() {
        let store = MemoryJobStore::new();
        let record = JobRecord::new("t-1", "add");
        store.create_job(record.clone()).unwrap();

        let mut updated = record.clone();
        updated.state = TaskState::Completed;
        updated.attempts = 2;
        store.update_job(updated).unwrap();

        let got = store.get_job("t-1").unwrap();
        assert_eq!(got.state, TaskState::Completed);
        assert_eq!(got.attempts, 2);
        assert!(got.updated_at >= got.created_at);
    }

    #[test]
    fn test_update_unknown_job_fails() {
        let store = MemoryJobStore::new();
        assert!(store.update_job(JobRecord::new("nope", "f")).is_err());
    }

    #[test]
    fn test_capacity_limit() {
        let store = MemoryJobStore::with_capacity(1);
        store.create_job(JobRecord::new("a", "f")).unwrap();
        assert!(store.create_job(JobRecord::new("b", "f")).is_err());
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_delete_expired() {
        let store = MemoryJobStore::new();
        let mut old = JobRecord::new("old", "f");
        old.updated_at = Utc::now() - chrono::Duration::hours(2);
        store.create_job(old).unwrap();
        store.create_job(JobRecord::new("fresh", "f")).unwrap();

        assert_eq!(store.delete_expired(Duration::from_secs(3600)), 1);
        assert!(store.get_job("old").is_none());
        assert!(store.get_job("fresh").is_some());
    }
}
