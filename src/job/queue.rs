//! Job queue: live jobs, the pending FIFO, and the bounded dead ring.
//!
//! One lock guards all queue structures and is held only across in-memory
//! updates. Ids are monotonic and never reused for the life of the
//! process; a job is in exactly one of live or dead.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use tokio::sync::{Mutex, Notify};

use crate::error::{Error, Result};
use crate::metrics;

use super::{Job, JobSpec, JobStatus, JobView};

/// Result of [`JobQueue::add`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enqueued {
    /// A fresh job entered the queue under this id.
    New(u64),
    /// An identical live job already exists; this is its id.
    Duplicate(u64),
}

impl Enqueued {
    pub fn id(&self) -> u64 {
        match *self {
            Enqueued::New(id) | Enqueued::Duplicate(id) => id,
        }
    }
}

/// Counters for the info surface.
#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct QueueCounts {
    pub live: usize,
    pub pending: usize,
    pub dead: usize,
}

struct QueueState {
    next_id: u64,
    live: HashMap<u64, Arc<Job>>,
    dead: HashMap<u64, Arc<Job>>,
    dead_order: VecDeque<u64>,
    /// Ids of live jobs with no assigned VM, in dispatch order.
    pending: VecDeque<u64>,
    /// Fingerprint → live job id, for dedupe.
    fingerprints: HashMap<String, u64>,
}

pub struct JobQueue {
    state: Mutex<QueueState>,
    job_added: Notify,
    dead_capacity: usize,
}

impl JobQueue {
    pub fn new(dead_capacity: usize) -> Self {
        Self {
            state: Mutex::new(QueueState {
                next_id: 1,
                live: HashMap::new(),
                dead: HashMap::new(),
                dead_order: VecDeque::new(),
                pending: VecDeque::new(),
                fingerprints: HashMap::new(),
            }),
            job_added: Notify::new(),
            dead_capacity,
        }
    }

    /// Append a job to the live queue, or return the id of an identical
    /// live job when the fingerprint matches (dead jobs never dedupe).
    pub async fn add(&self, spec: JobSpec, fingerprint: Option<String>) -> Enqueued {
        let mut state = self.state.lock().await;
        if let Some(fp) = &fingerprint {
            if let Some(&existing) = state.fingerprints.get(fp) {
                if state.live.contains_key(&existing) {
                    return Enqueued::Duplicate(existing);
                }
            }
        }
        let id = state.next_id;
        state.next_id += 1;
        let job = Arc::new(Job::new(id, spec, fingerprint.clone()));
        job.trace("job added to queue");
        state.live.insert(id, Arc::clone(&job));
        state.pending.push_back(id);
        if let Some(fp) = fingerprint {
            state.fingerprints.insert(fp, id);
        }
        Self::sync_gauges(&state);
        metrics::JOBS_SUBMITTED_TOTAL.inc();
        drop(state);
        self.job_added.notify_one();
        Enqueued::New(id)
    }

    /// Insert a synchronously rejected job straight into the dead ring so
    /// the requester can still poll a result.
    pub async fn add_dead(&self, spec: JobSpec, reason: &str) -> u64 {
        let mut state = self.state.lock().await;
        let id = state.next_id;
        state.next_id += 1;
        let job = Arc::new(Job::new(id, spec, None));
        job.trace(reason);
        job.finish(JobStatus::Failed);
        Self::insert_dead(&mut state, job, self.dead_capacity);
        metrics::JOBS_COMPLETED_TOTAL
            .with_label_values(&["rejected"])
            .inc();
        id
    }

    /// Pop the next unassigned live job, in dispatch order. Stale entries
    /// (deleted or already-dead jobs) are skipped.
    pub async fn next_pending(&self) -> Option<Arc<Job>> {
        let mut state = self.state.lock().await;
        while let Some(id) = state.pending.pop_front() {
            match state.live.get(&id) {
                Some(job) if job.assigned_vm().is_none() => {
                    let job = Arc::clone(job);
                    Self::sync_gauges(&state);
                    return Some(job);
                }
                _ => continue,
            }
        }
        Self::sync_gauges(&state);
        None
    }

    /// Put a popped-but-undispatchable job back at the head of the FIFO.
    pub async fn requeue_front(&self, id: u64) {
        let mut state = self.state.lock().await;
        state.pending.push_front(id);
        Self::sync_gauges(&state);
    }

    /// Mark a live job as claimed by a worker on the given VM.
    pub async fn assign(&self, id: u64, vm_id: u32) -> Result<()> {
        let state = self.state.lock().await;
        let job = state.live.get(&id).ok_or(Error::NoSuchJob(id))?;
        job.set_assigned(Some(vm_id));
        job.set_status(JobStatus::Running);
        Ok(())
    }

    /// Detach a job from its dead worker and put it back at the **head**
    /// of the pending FIFO so it precedes anything submitted later.
    pub async fn unassign(&self, id: u64) {
        let mut state = self.state.lock().await;
        let Some(job) = state.live.get(&id).cloned() else {
            return;
        };
        job.set_assigned(None);
        job.set_status(JobStatus::Pending);
        state.pending.push_front(id);
        Self::sync_gauges(&state);
        drop(state);
        self.job_added.notify_one();
    }

    /// Move a live job to the dead ring. Idempotent: a second call (or a
    /// call for an unknown id) is a no-op returning false.
    pub async fn make_dead(&self, id: u64, reason: &str, status: JobStatus) -> bool {
        let mut state = self.state.lock().await;
        let Some(job) = state.live.remove(&id) else {
            return false;
        };
        if let Some(fp) = &job.fingerprint {
            if state.fingerprints.get(fp) == Some(&id) {
                state.fingerprints.remove(fp);
            }
        }
        job.trace(reason);
        job.finish(status);
        Self::insert_dead(&mut state, job, self.dead_capacity);
        metrics::JOBS_COMPLETED_TOTAL
            .with_label_values(&[status_label(status)])
            .inc();
        true
    }

    pub async fn get(&self, id: u64) -> Option<Arc<Job>> {
        let state = self.state.lock().await;
        state.live.get(&id).or_else(|| state.dead.get(&id)).cloned()
    }

    pub async fn is_live(&self, id: u64) -> bool {
        self.state.lock().await.live.contains_key(&id)
    }

    /// The id the next submission will receive.
    pub async fn next_id(&self) -> u64 {
        self.state.lock().await.next_id
    }

    /// Remove a job outright from the live queue or the dead ring.
    pub async fn del_job(&self, id: u64, dead: bool) -> bool {
        let mut state = self.state.lock().await;
        let removed = if dead {
            state.dead_order.retain(|&d| d != id);
            state.dead.remove(&id).is_some()
        } else {
            match state.live.remove(&id) {
                Some(job) => {
                    if let Some(fp) = &job.fingerprint {
                        if state.fingerprints.get(fp) == Some(&id) {
                            state.fingerprints.remove(fp);
                        }
                    }
                    state.pending.retain(|&p| p != id);
                    true
                }
                None => false,
            }
        };
        Self::sync_gauges(&state);
        removed
    }

    pub async fn counts(&self) -> QueueCounts {
        let state = self.state.lock().await;
        QueueCounts {
            live: state.live.len(),
            pending: state.pending.len(),
            dead: state.dead.len(),
        }
    }

    pub async fn live_views(&self) -> Vec<JobView> {
        let state = self.state.lock().await;
        let mut views: Vec<JobView> = state.live.values().map(|job| job.view()).collect();
        views.sort_by_key(|view| view.id);
        views
    }

    pub async fn dead_views(&self) -> Vec<JobView> {
        let state = self.state.lock().await;
        let mut views: Vec<JobView> = state.dead.values().map(|job| job.view()).collect();
        views.sort_by_key(|view| view.id);
        views
    }

    /// Latest job a requester submitted for the given output destination;
    /// live jobs win over dead ones.
    pub async fn find_by_output(&self, access_key: &str, dest: &str) -> Option<Arc<Job>> {
        let state = self.state.lock().await;
        let pick = |jobs: &HashMap<u64, Arc<Job>>| {
            jobs.values()
                .filter(|job| {
                    job.spec.access_key == access_key && job.spec.output_file.dest_path == dest
                })
                .max_by_key(|job| job.id)
                .cloned()
        };
        pick(&state.live).or_else(|| pick(&state.dead))
    }

    /// Resolve when a job is added or unassigned; used by the scheduler
    /// to cut dispatch latency on an empty queue.
    pub async fn wait_job_added(&self) {
        self.job_added.notified().await;
    }

    fn insert_dead(state: &mut QueueState, job: Arc<Job>, capacity: usize) {
        let id = job.id;
        state.dead_order.push_back(id);
        state.dead.insert(id, job);
        while state.dead_order.len() > capacity {
            if let Some(oldest) = state.dead_order.pop_front() {
                state.dead.remove(&oldest);
            }
        }
        Self::sync_gauges(state);
    }

    fn sync_gauges(state: &QueueState) {
        metrics::JOBS_LIVE.set(state.live.len() as i64);
        metrics::JOBS_PENDING.set(state.pending.len() as i64);
    }
}

fn status_label(status: JobStatus) -> &'static str {
    match status {
        JobStatus::Pending => "pending",
        JobStatus::Running => "running",
        JobStatus::Completed => "completed",
        JobStatus::Failed => "failed",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::test_spec;

    #[tokio::test]
    async fn ids_are_strictly_increasing_and_never_reused() {
        let queue = JobQueue::new(16);
        let a = queue.add(test_spec("alpine"), None).await.id();
        let b = queue.add(test_spec("alpine"), None).await.id();
        assert!(b > a);

        assert!(queue.make_dead(a, "done", JobStatus::Completed).await);
        let c = queue.add(test_spec("alpine"), None).await.id();
        assert!(c > b);
    }

    #[tokio::test]
    async fn dedupe_returns_the_live_id_once() {
        let queue = JobQueue::new(16);
        let first = queue
            .add(test_spec("alpine"), Some("fp-1".to_string()))
            .await;
        let second = queue
            .add(test_spec("alpine"), Some("fp-1".to_string()))
            .await;
        assert!(matches!(first, Enqueued::New(_)));
        assert_eq!(second, Enqueued::Duplicate(first.id()));

        // dead jobs do not dedupe
        queue
            .make_dead(first.id(), "done", JobStatus::Completed)
            .await;
        let third = queue
            .add(test_spec("alpine"), Some("fp-1".to_string()))
            .await;
        assert!(matches!(third, Enqueued::New(_)));
        assert_ne!(third.id(), first.id());
    }

    #[tokio::test]
    async fn make_dead_is_idempotent() {
        let queue = JobQueue::new(16);
        let id = queue.add(test_spec("alpine"), None).await.id();
        assert!(queue.make_dead(id, "done", JobStatus::Completed).await);
        assert!(!queue.make_dead(id, "done again", JobStatus::Failed).await);

        let job = queue.get(id).await.expect("still pollable");
        assert_eq!(job.status(), JobStatus::Completed);
    }

    #[tokio::test]
    async fn pending_is_fifo_with_head_reinsertion() {
        let queue = JobQueue::new(16);
        let a = queue.add(test_spec("alpine"), None).await.id();
        let b = queue.add(test_spec("alpine"), None).await.id();

        let first = queue.next_pending().await.expect("first");
        assert_eq!(first.id, a);
        queue.assign(a, 1).await.expect("assign");

        // worker died: job returns to the head, ahead of b
        queue.unassign(a).await;
        let again = queue.next_pending().await.expect("again");
        assert_eq!(again.id, a);
        let then = queue.next_pending().await.expect("then");
        assert_eq!(then.id, b);
    }

    #[tokio::test]
    async fn next_pending_skips_assigned_and_dead_entries() {
        let queue = JobQueue::new(16);
        let a = queue.add(test_spec("alpine"), None).await.id();
        let b = queue.add(test_spec("alpine"), None).await.id();
        queue.make_dead(a, "rejected later", JobStatus::Failed).await;

        let next = queue.next_pending().await.expect("next");
        assert_eq!(next.id, b);
        assert!(queue.next_pending().await.is_none());
    }

    #[tokio::test]
    async fn dead_ring_drops_the_oldest() {
        let queue = JobQueue::new(2);
        let a = queue.add_dead(test_spec("alpine"), "invalid image").await;
        let b = queue.add_dead(test_spec("alpine"), "invalid image").await;
        let c = queue.add_dead(test_spec("alpine"), "invalid image").await;

        assert!(queue.get(a).await.is_none());
        assert!(queue.get(b).await.is_some());
        assert!(queue.get(c).await.is_some());
    }

    #[tokio::test]
    async fn del_job_removes_from_either_side() {
        let queue = JobQueue::new(16);
        let live = queue.add(test_spec("alpine"), None).await.id();
        let dead = queue.add_dead(test_spec("alpine"), "nope").await;

        assert!(queue.del_job(live, false).await);
        assert!(queue.del_job(dead, true).await);
        assert!(!queue.del_job(live, false).await);
        assert!(queue.get(live).await.is_none());
        assert!(queue.next_pending().await.is_none());
    }

    #[tokio::test]
    async fn find_by_output_prefers_the_latest_live_job() {
        let queue = JobQueue::new(16);
        let old = queue.add(test_spec("alpine"), None).await.id();
        queue.make_dead(old, "done", JobStatus::Completed).await;
        let current = queue.add(test_spec("alpine"), None).await.id();

        let found = queue
            .find_by_output("tester", "out.log")
            .await
            .expect("found");
        assert_eq!(found.id, current);

        assert!(queue.find_by_output("stranger", "out.log").await.is_none());
    }
}
