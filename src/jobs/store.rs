//! In-memory job store.
//!
//! Jobs live for the lifetime of the process. The map lock is only held to
//! find or insert an entry; each job has its own mutex so updates to one
//! job never wait on another, and a reader always sees a whole transition.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{Mutex, RwLock};

use crate::models::{Job, JobId, JobSnapshot};
use crate::work_queue::CancelFlag;

#[derive(Debug)]
struct JobEntry {
    job: Job,
    cancel: CancelFlag,
}

#[derive(Debug, Default)]
pub struct JobStore {
    jobs: RwLock<HashMap<JobId, Arc<Mutex<JobEntry>>>>,
}

impl JobStore {
    pub fn new() -> Self {
        Self::default()
    }

    async fn entry(&self, id: &JobId) -> Option<Arc<Mutex<JobEntry>>> {
        self.jobs.read().await.get(id).cloned()
    }

    /// Add a new job. An existing job with the same id is left untouched
    /// and `false` is returned.
    pub async fn insert(&self, job: Job, cancel: CancelFlag) -> bool {
        let mut jobs = self.jobs.write().await;
        if jobs.contains_key(&job.id) {
            return false;
        }
        jobs.insert(job.id, Arc::new(Mutex::new(JobEntry { job, cancel })));
        true
    }

    pub async fn snapshot(&self, id: &JobId) -> Option<JobSnapshot> {
        self.read(id, Job::snapshot).await
    }

    /// Read a job under its lock.
    pub async fn read<R>(&self, id: &JobId, f: impl FnOnce(&Job) -> R) -> Option<R> {
        let entry = self.entry(id).await?;
        let guard = entry.lock().await;
        Some(f(&guard.job))
    }

    /// Mutate a job under its lock.
    pub async fn update<R>(&self, id: &JobId, f: impl FnOnce(&mut Job) -> R) -> Option<R> {
        let entry = self.entry(id).await?;
        let mut guard = entry.lock().await;
        Some(f(&mut guard.job))
    }

    pub async fn cancel_flag(&self, id: &JobId) -> Option<CancelFlag> {
        let entry = self.entry(id).await?;
        let guard = entry.lock().await;
        Some(guard.cancel.clone())
    }

    pub async fn remove(&self, id: &JobId) -> Option<Job> {
        let entry = self.jobs.write().await.remove(id)?;
        let guard = entry.lock().await;
        Some(guard.job.clone())
    }

    /// Snapshots of every job, oldest first.
    pub async fn list(&self) -> Vec<JobSnapshot> {
        let entries: Vec<Arc<Mutex<JobEntry>>> = self.jobs.read().await.values().cloned().collect();
        let mut snapshots = Vec::with_capacity(entries.len());
        for entry in entries {
            snapshots.push(entry.lock().await.job.snapshot());
        }
        snapshots.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        snapshots
    }

    pub async fn len(&self) -> usize {
        self.jobs.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.jobs.read().await.is_empty()
    }

    /// Drop terminal jobs that finished more than `retention` ago.
    ///
    /// Returns the number of jobs removed.
    pub async fn sweep(&self, retention: Duration) -> usize {
        let now = Utc::now();
        let entries: Vec<(JobId, Arc<Mutex<JobEntry>>)> = self
            .jobs
            .read()
            .await
            .iter()
            .map(|(id, entry)| (*id, entry.clone()))
            .collect();

        let mut expired = Vec::new();
        for (id, entry) in entries {
            let guard = entry.lock().await;
            let old_enough = guard
                .job
                .finished_at()
                .and_then(|finished| (now - finished).to_std().ok())
                .is_some_and(|age| age >= retention);
            if guard.job.status().is_terminal() && old_enough {
                expired.push(id);
            }
        }

        if expired.is_empty() {
            return 0;
        }
        let mut jobs = self.jobs.write().await;
        let removed = expired.iter().filter(|id| jobs.remove(id).is_some()).count();
        tracing::debug!("Swept {} expired job(s)", removed);
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{FailureKind, JobError, JobStatus};

    #[tokio::test]
    async fn test_insert_never_overwrites() {
        let store = JobStore::new();
        let id = JobId::generate();
        assert!(store.insert(Job::new(id, "a.png"), CancelFlag::new()).await);
        store.update(&id, |job| job.start()).await.unwrap().unwrap();
        assert!(!store.insert(Job::new(id, "b.png"), CancelFlag::new()).await);

        let snapshot = store.snapshot(&id).await.unwrap();
        assert_eq!(snapshot.original_filename, "a.png");
        assert_eq!(snapshot.status, JobStatus::Processing);
    }

    #[tokio::test]
    async fn test_unknown_id() {
        let store = JobStore::new();
        let id = JobId::generate();
        assert!(store.snapshot(&id).await.is_none());
        assert!(store.update(&id, |job| job.start()).await.is_none());
        assert!(store.remove(&id).await.is_none());
    }

    #[tokio::test]
    async fn test_sweep_keeps_running_and_recent_jobs() {
        let store = JobStore::new();
        let running = JobId::generate();
        let failed = JobId::generate();
        store.insert(Job::new(running, "a.png"), CancelFlag::new()).await;
        store.insert(Job::new(failed, "b.png"), CancelFlag::new()).await;
        store.update(&running, |job| job.start()).await;
        store
            .update(&failed, |job| job.fail(JobError::new(FailureKind::InvalidInput, "bad")))
            .await;

        assert_eq!(store.sweep(Duration::from_secs(3600)).await, 0);
        assert_eq!(store.sweep(Duration::ZERO).await, 1);
        assert!(store.snapshot(&failed).await.is_none());
        assert!(store.snapshot(&running).await.is_some());
    }

    #[tokio::test]
    async fn test_list_and_cancel_flag() {
        let store = JobStore::new();
        let id = JobId::generate();
        let flag = CancelFlag::new();
        store.insert(Job::new(id, "a.png"), flag.clone()).await;
        store.cancel_flag(&id).await.unwrap().cancel();
        assert!(flag.is_cancelled());
        assert_eq!(store.list().await.len(), 1);
        assert_eq!(store.len().await, 1);
    }
}
