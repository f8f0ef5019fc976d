//! In-process job registry backing dedup and the status endpoint.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::Utc;

use super::types::{JobRecord, JobStatus};

/// Entries kept before terminal jobs start being pruned.
pub const DEFAULT_CAPACITY: usize = 10_000;

/// Job id → latest status.
///
/// The lock is never held across an await.
#[derive(Debug)]
pub struct JobRegistry {
    jobs: Mutex<HashMap<String, JobRecord>>,
    capacity: usize,
}

impl Default for JobRegistry {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }
}

impl JobRegistry {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            jobs: Mutex::new(HashMap::new()),
            capacity: capacity.max(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, JobRecord>> {
        self.jobs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record `job_id` as queued unless it is already known.
    ///
    /// Returns false when the job id was accepted before.
    pub fn admit(&self, job_id: &str) -> bool {
        let mut jobs = self.lock();
        if jobs.contains_key(job_id) {
            return false;
        }
        Self::prune(&mut jobs, self.capacity);
        jobs.insert(job_id.to_string(), record(JobStatus::Queued));
        true
    }

    /// Claim `job_id` for a new submission.
    ///
    /// With `dedupe` the claim fails for any id already known, whatever its
    /// state. Without it every submission claims the id and resets it to
    /// queued.
    pub fn reserve(&self, job_id: &str, dedupe: bool) -> bool {
        if dedupe {
            return self.admit(job_id);
        }
        self.set(job_id, JobStatus::Queued);
        true
    }

    pub fn set(&self, job_id: &str, status: JobStatus) {
        let mut jobs = self.lock();
        if !jobs.contains_key(job_id) {
            Self::prune(&mut jobs, self.capacity);
        }
        jobs.insert(job_id.to_string(), record(status));
    }

    pub fn get(&self, job_id: &str) -> Option<JobRecord> {
        self.lock().get(job_id).cloned()
    }

    /// Forget a job, e.g. after its submission failed.
    pub fn release(&self, job_id: &str) {
        self.lock().remove(job_id);
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Drop the oldest terminal entries until there is room for one more.
    fn prune(jobs: &mut HashMap<String, JobRecord>, capacity: usize) {
        if jobs.len() < capacity {
            return;
        }

        let mut terminal: Vec<(String, chrono::DateTime<Utc>)> = jobs
            .iter()
            .filter(|(_, r)| r.status.is_terminal())
            .map(|(id, r)| (id.clone(), r.updated_at))
            .collect();
        terminal.sort_by_key(|(_, at)| *at);

        let excess = jobs.len() + 1 - capacity;
        for (id, _) in terminal.into_iter().take(excess) {
            jobs.remove(&id);
        }
    }
}

fn record(status: JobStatus) -> JobRecord {
    JobRecord {
        status,
        updated_at: Utc::now(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_admit_once() {
        let registry = JobRegistry::default();
        assert!(registry.admit("bird:1"));
        assert!(!registry.admit("bird:1"));
        assert_eq!(registry.get("bird:1").unwrap().status, JobStatus::Queued);
    }

    #[test]
    fn test_reserve_with_dedupe_rejects_in_flight_and_finished_jobs() {
        let registry = JobRegistry::default();
        assert!(registry.reserve("bird:1", true));

        registry.set("bird:1", JobStatus::Active);
        assert!(!registry.reserve("bird:1", true));
        assert_eq!(registry.get("bird:1").unwrap().status, JobStatus::Active);

        registry.set("bird:1", JobStatus::Completed);
        assert!(!registry.reserve("bird:1", true));
    }

    #[test]
    fn test_reserve_without_dedupe_always_claims() {
        let registry = JobRegistry::default();
        assert!(registry.reserve("bird:1", false));
        registry.set("bird:1", JobStatus::Completed);

        assert!(registry.reserve("bird:1", false));
        assert_eq!(registry.get("bird:1").unwrap().status, JobStatus::Queued);
    }

    #[test]
    fn test_release_allows_readmission() {
        let registry = JobRegistry::default();
        assert!(registry.admit("bird:1"));
        registry.release("bird:1");
        assert!(registry.get("bird:1").is_none());
        assert!(registry.admit("bird:1"));
    }

    #[test]
    fn test_status_transitions() {
        let registry = JobRegistry::default();
        registry.admit("calendar:bk_1");
        registry.set("calendar:bk_1", JobStatus::Active);
        registry.set("calendar:bk_1", JobStatus::Retrying { attempt: 1 });
        assert_eq!(
            registry.get("calendar:bk_1").unwrap().status,
            JobStatus::Retrying { attempt: 1 }
        );
        registry.set("calendar:bk_1", JobStatus::Completed);
        assert!(registry.get("calendar:bk_1").unwrap().status.is_terminal());
    }

    #[test]
    fn test_prunes_terminal_entries_only() {
        let registry = JobRegistry::with_capacity(2);
        registry.admit("a");
        registry.set("a", JobStatus::Completed);
        registry.admit("b");

        // Full: "a" is terminal and gets pruned, "b" stays.
        assert!(registry.admit("c"));
        assert!(registry.get("a").is_none());
        assert!(registry.get("b").is_some());
        assert!(registry.get("c").is_some());

        // Nothing terminal left, so the map grows past capacity.
        assert!(registry.admit("d"));
        assert_eq!(registry.len(), 3);
    }
}
