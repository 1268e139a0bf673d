//! Job manager: the single scheduling loop.
//!
//! Each tick it reaps workers that died without finishing their job
//! (requeueing the job at the head of the pending FIFO and replacing the
//! untrusted VM), then pairs pending jobs with warm VMs in submission
//! order. Dispatch stops at the first image whose pool is empty: image
//! starvation is bounded by pool sizing, not by scheduler cleverness.
//! The loop also wakes on the queue's job-added signal so an idle broker
//! dispatches immediately.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::vm::{Preallocator, VmHandle};

use super::queue::JobQueue;
use super::worker::{Worker, WorkerContext};
use super::JobStatus;

pub struct JobManager {
    queue: Arc<JobQueue>,
    pool: Arc<Preallocator>,
    ctx: WorkerContext,
    tick: Duration,
    /// Worker deaths a single job survives before it is failed.
    max_job_retries: u32,
    workers: Mutex<HashMap<u64, JoinHandle<()>>>,
}

impl JobManager {
    pub fn new(
        queue: Arc<JobQueue>,
        pool: Arc<Preallocator>,
        ctx: WorkerContext,
        tick: Duration,
        max_job_retries: u32,
    ) -> Arc<Self> {
        Arc::new(Self {
            queue,
            pool,
            ctx,
            tick,
            max_job_retries,
            workers: Mutex::new(HashMap::new()),
        })
    }

    /// Run the scheduling loop until the process exits.
    pub fn start(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(self.tick) => {}
                    _ = self.queue.wait_job_added() => {}
                }
                self.reap().await;
                self.dispatch().await;
            }
        })
    }

    /// Workers currently tracked (running or not yet reaped).
    pub async fn worker_count(&self) -> usize {
        self.workers.lock().await.len()
    }

    /// Collect finished worker tasks. A finished task whose job is still
    /// live means the worker died mid-run: the VM is untrusted and gets
    /// force-destroyed, and the job goes back to the head of the queue.
    pub async fn reap(&self) {
        let finished: Vec<(u64, JoinHandle<()>)> = {
            let mut workers = self.workers.lock().await;
            let ids: Vec<u64> = workers
                .iter()
                .filter(|(_, handle)| handle.is_finished())
                .map(|(&id, _)| id)
                .collect();
            ids.into_iter()
                .filter_map(|id| workers.remove(&id).map(|handle| (id, handle)))
                .collect()
        };

        for (job_id, handle) in finished {
            // Surface the panic text, if any; the task is already gone.
            if let Err(e) = handle.await {
                tracing::warn!(job = job_id, error = %e, "worker task ended abnormally");
            }
            if !self.queue.is_live(job_id).await {
                continue; // worker completed its state machine
            }
            let Some(job) = self.queue.get(job_id).await else {
                continue;
            };
            if let Some(vm_id) = job.assigned_vm() {
                let vm = VmHandle::new(vm_id, job.spec.image.clone(), false);
                tracing::warn!(job = job_id, vm = %vm.name(), "worker died; destroying its VM");
                self.pool.discard_vm(vm).await;
            }
            let retries = job.bump_retries();
            if retries > self.max_job_retries {
                self.queue
                    .make_dead(job_id, "worker died repeatedly", JobStatus::Failed)
                    .await;
            } else {
                job.trace("worker died; job requeued");
                self.queue.unassign(job_id).await;
            }
        }
    }

    /// Pair pending jobs with warm VMs in FIFO order.
    pub async fn dispatch(&self) {
        while let Some(job) = self.queue.next_pending().await {
            match self.pool.alloc_vm(&job.spec.image).await {
                Some(vm) => {
                    if self.queue.assign(job.id, vm.id).await.is_err() {
                        // deleted between pop and assign
                        self.pool.free_vm(vm).await;
                        continue;
                    }
                    job.trace(format!("assigned VM {}", vm.name()));
                    let handle = Worker::spawn(self.ctx.clone(), Arc::clone(&job), vm);
                    self.workers.lock().await.insert(job.id, handle);
                }
                None => {
                    // Pool empty: stop the scan so submission order holds.
                    self.queue.requeue_front(job.id).await;
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::test_spec;
    use crate::storage::Storage;
    use crate::vm::PoolSettings;
    use crate::vmms::fake::FakeDriver;

    struct Fixture {
        _dir: tempfile::TempDir,
        driver: Arc<FakeDriver>,
        queue: Arc<JobQueue>,
        pool: Arc<Preallocator>,
        manager: Arc<JobManager>,
    }

    async fn fixture(target: usize) -> Fixture {
        let dir = tempfile::tempdir().expect("tempdir");
        let storage = Arc::new(Storage::new(dir.path().to_path_buf()));
        storage
            .upload("tester", "Makefile", b"all:\n\techo hi\n")
            .await
            .expect("upload");

        let driver = Arc::new(FakeDriver::new(vec!["alpine".to_string()]));
        let queue = Arc::new(JobQueue::new(64));
        let pool = Preallocator::new(
            driver.clone(),
            PoolSettings {
                hard_cap: 8,
                create_retries: 2,
                create_retry_delay: Duration::from_millis(5),
                safe_destroy_grace: Duration::from_millis(100),
            },
        );
        pool.define_image("alpine", true).await;
        pool.update("alpine", target).await.expect("update");

        let ctx = WorkerContext {
            driver: driver.clone(),
            queue: Arc::clone(&queue),
            pool: Arc::clone(&pool),
            storage,
            http: reqwest::Client::new(),
            ready_timeout: Duration::from_millis(100),
            retry_budget: 5,
        };
        let manager = JobManager::new(
            Arc::clone(&queue),
            Arc::clone(&pool),
            ctx,
            Duration::from_millis(10),
            5,
        );
        Fixture {
            _dir: dir,
            driver,
            queue,
            pool,
            manager,
        }
    }

    async fn wait_dead(queue: &JobQueue, id: u64) -> JobStatus {
        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                if !queue.is_live(id).await {
                    if let Some(job) = queue.get(id).await {
                        return job.status();
                    }
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("job never finished")
    }

    #[tokio::test]
    async fn dispatch_runs_a_pending_job_once_a_vm_exists() {
        let fx = fixture(0).await;
        let _loop = Arc::clone(&fx.manager).start();

        // submitted while every pool is empty: accepted, sits pending
        let id = fx.queue.add(test_spec("alpine"), None).await.id();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(fx.queue.is_live(id).await);

        // grow the pool; the job should start and finish on its own
        fx.pool.update("alpine", 1).await.expect("grow");
        let status = wait_dead(&fx.queue, id).await;
        assert_eq!(status, JobStatus::Completed);
    }

    #[tokio::test]
    async fn fifo_order_holds_within_an_image() {
        let fx = fixture(1).await;
        fx.driver
            .script_run_delay(Duration::from_millis(30));
        let _loop = Arc::clone(&fx.manager).start();

        let a = fx.queue.add(test_spec("alpine"), None).await.id();
        let b = fx.queue.add(test_spec("alpine"), None).await.id();

        assert_eq!(wait_dead(&fx.queue, a).await, JobStatus::Completed);
        assert_eq!(wait_dead(&fx.queue, b).await, JobStatus::Completed);

        let first = fx.queue.get(a).await.expect("a").view();
        let second = fx.queue.get(b).await.expect("b").view();
        let first_started = first.started_at.expect("a started");
        let second_started = second.started_at.expect("b started");
        assert!(first_started <= second_started);
    }

    #[tokio::test]
    async fn dead_worker_requeues_the_job_and_replaces_the_vm() {
        let fx = fixture(1).await;
        fx.driver.panic_on_run(1);
        let _loop = Arc::clone(&fx.manager).start();

        let id = fx.queue.add(test_spec("alpine"), None).await.id();
        let status = wait_dead(&fx.queue, id).await;

        // first worker panicked mid-RUN; the retry completed the job
        assert_eq!(status, JobStatus::Completed);
        let job = fx.queue.get(id).await.expect("job");
        assert_eq!(job.retries(), 1);
        assert!(fx.driver.destroyed_count() >= 1);
        assert!(fx.driver.created_count() >= 2);
    }

    #[tokio::test]
    async fn repeated_worker_deaths_fail_the_job() {
        let fx = fixture(1).await;
        fx.driver.panic_on_run(100);
        let _loop = Arc::clone(&fx.manager).start();

        let id = fx.queue.add(test_spec("alpine"), None).await.id();
        let status = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if !fx.queue.is_live(id).await {
                    if let Some(job) = fx.queue.get(id).await {
                        return job.status();
                    }
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("job never resolved");

        assert_eq!(status, JobStatus::Failed);
        let job = fx.queue.get(id).await.expect("job");
        assert!(job
            .view()
            .trace
            .iter()
            .any(|entry| entry.msg.contains("worker died repeatedly")));
    }
}
