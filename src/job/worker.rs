//! Worker: one task that owns a VM and drives a job through its run.
//!
//! ```text
//!   ASSIGNED → WAIT_READY → COPY_IN → RUN → COPY_OUT → NOTIFY → DONE
//!               │            │        │     │
//!               ▼            ▼        ▼     ▼
//!             FAILED (ready-timeout / copy-in / run / copy-out)
//! ```
//!
//! The worker holds the sole right to mutate its job's trace, timestamps
//! and final status, and owns the VM until release. On every path, the VM
//! is detached from the job before `make_dead`, and only then returned to
//! the preallocator (which honours the keep-alive flag).

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::error::Result;
use crate::metrics;
use crate::output::BoundedSink;
use crate::storage::Storage;
use crate::vm::{Preallocator, VmHandle};
use crate::vmms::{RunEnd, StagedFile, VmmsDriver};

use super::queue::JobQueue;
use super::{Job, JobStatus};

/// Everything a worker needs besides its job and VM. Cheap to clone; the
/// scheduler stamps one out per spawned worker.
#[derive(Clone)]
pub struct WorkerContext {
    pub driver: Arc<dyn VmmsDriver>,
    pub queue: Arc<JobQueue>,
    pub pool: Arc<Preallocator>,
    pub storage: Arc<Storage>,
    pub http: reqwest::Client,
    /// Per-attempt readiness deadline.
    pub ready_timeout: Duration,
    /// Bound on wait-ready attempts (each failure burns a VM).
    pub retry_budget: u32,
}

enum Verdict {
    Done,
    Failed(String),
}

pub struct Worker {
    ctx: WorkerContext,
    job: Arc<Job>,
}

impl Worker {
    /// Spawn the worker task for an assigned job.
    pub fn spawn(ctx: WorkerContext, job: Arc<Job>, vm: VmHandle) -> JoinHandle<()> {
        tokio::spawn(async move {
            Worker { ctx, job }.run(vm).await;
        })
    }

    async fn run(self, vm: VmHandle) {
        let job_id = self.job.id;
        let (vm, verdict) = self.execute(vm).await;
        let (status, reason) = match verdict {
            Verdict::Done => (JobStatus::Completed, "job completed".to_string()),
            Verdict::Failed(reason) => {
                tracing::warn!(job = job_id, %reason, "job failed");
                (JobStatus::Failed, format!("job failed: {}", reason))
            }
        };
        // Detach before release: a dead job never points at a pooled VM.
        self.job.set_assigned(None);
        self.ctx.queue.make_dead(job_id, &reason, status).await;
        if let Some(vm) = vm {
            self.ctx.pool.free_vm(vm).await;
        }
        tracing::info!(job = job_id, ?status, "job finished");
    }

    /// Drive the state machine. Returns the VM (unless it was lost to a
    /// failed replacement) and the verdict. Failure paths clear the
    /// keep-alive flag so release destroys the sandbox.
    async fn execute(&self, mut vm: VmHandle) -> (Option<VmHandle>, Verdict) {
        let spec = &self.job.spec;

        // ── WAIT_READY ───────────────────────────────────────────────────
        if self.job.is_cancelled() {
            vm.keep_alive = false;
            return (Some(vm), Verdict::Failed("cancelled".into()));
        }
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self.ctx.driver.wait_vm(&vm, self.ctx.ready_timeout).await {
                Ok(()) => {
                    self.job.trace(format!("VM {} ready", vm.name()));
                    break;
                }
                Err(e) => {
                    self.job
                        .trace(format!("VM {} not ready: {}", vm.name(), e));
                    if attempt >= self.ctx.retry_budget {
                        vm.keep_alive = false;
                        return (
                            Some(vm),
                            Verdict::Failed("ready-timeout: retry budget exhausted".into()),
                        );
                    }
                    // A VM that never came up is not trusted: destroy it
                    // and draw a fresh one.
                    match self.ctx.pool.replace_vm(vm).await {
                        Ok(fresh) => {
                            self.job.set_assigned(Some(fresh.id));
                            self.job.trace(format!("replaced with VM {}", fresh.name()));
                            vm = fresh;
                        }
                        Err(e) => {
                            self.job.trace(format!("replacement VM failed: {}", e));
                            return (
                                None,
                                Verdict::Failed("ready-timeout: no replacement VM".into()),
                            );
                        }
                    }
                }
            }
        }

        // ── COPY_IN ──────────────────────────────────────────────────────
        if self.job.is_cancelled() {
            vm.keep_alive = false;
            return (Some(vm), Verdict::Failed("cancelled".into()));
        }
        let staged = match self.stage_inputs() {
            Ok(staged) => staged,
            Err(e) => {
                vm.keep_alive = false;
                return (Some(vm), Verdict::Failed(format!("copy-in: {}", e)));
            }
        };
        if let Err(e) = self.ctx.driver.copy_in(&vm, &staged).await {
            vm.keep_alive = false;
            return (Some(vm), Verdict::Failed(format!("copy-in: {}", e)));
        }
        self.job
            .trace(format!("copied {} input file(s) in", staged.len()));

        // ── RUN ──────────────────────────────────────────────────────────
        if self.job.is_cancelled() {
            vm.keep_alive = false;
            return (Some(vm), Verdict::Failed("cancelled".into()));
        }
        self.job.mark_started();
        let dest = match self
            .ctx
            .storage
            .output_path(&spec.access_key, &spec.output_file.dest_path)
        {
            Ok(dest) => dest,
            Err(e) => {
                vm.keep_alive = false;
                return (Some(vm), Verdict::Failed(format!("run: {}", e)));
            }
        };
        let mut sink = match BoundedSink::create(&dest, spec.max_output_size).await {
            Ok(sink) => sink,
            Err(e) => {
                vm.keep_alive = false;
                return (Some(vm), Verdict::Failed(format!("run: {}", e)));
            }
        };
        let run_started = Instant::now();
        let outcome = self
            .ctx
            .driver
            .run_job(&vm, Duration::from_secs(spec.timeout), &mut sink)
            .await;
        metrics::JOB_RUN_DURATION.observe(run_started.elapsed().as_secs_f64());
        match outcome {
            Ok(outcome) => match outcome.end {
                RunEnd::Normal => {
                    let exit = outcome
                        .exit_status
                        .map_or_else(|| "unknown".to_string(), |code| code.to_string());
                    self.job.trace(format!("run finished (exit status {})", exit));
                }
                RunEnd::Timeout => {
                    // Partial output is still valuable, but the sandbox
                    // state is unknown: destroy it on release.
                    self.job.trace(format!(
                        "run timed out after {}s; keeping partial output",
                        spec.timeout
                    ));
                    vm.keep_alive = false;
                }
                RunEnd::Killed => {
                    vm.keep_alive = false;
                    return (Some(vm), Verdict::Failed("run: process killed".into()));
                }
            },
            Err(e) => {
                vm.keep_alive = false;
                return (Some(vm), Verdict::Failed(format!("run: {}", e)));
            }
        }
        if sink.truncated() {
            self.job
                .trace(format!("output truncated to {} bytes", sink.written()));
        }

        // ── COPY_OUT ─────────────────────────────────────────────────────
        if self.job.is_cancelled() {
            vm.keep_alive = false;
            return (Some(vm), Verdict::Failed("cancelled".into()));
        }
        if let Err(e) = self.ctx.driver.copy_out(&vm, &dest).await {
            vm.keep_alive = false;
            return (Some(vm), Verdict::Failed(format!("copy-out: {}", e)));
        }
        self.job.trace("output copied out");
        if let Some(url) = &spec.output_file.callback_url {
            self.spawn_callback(url.clone(), dest);
        }

        // ── NOTIFY ───────────────────────────────────────────────────────
        self.job.set_status(JobStatus::Completed);
        self.notify().await;

        (Some(vm), Verdict::Done)
    }

    fn stage_inputs(&self) -> Result<Vec<StagedFile>> {
        self.job
            .spec
            .input_files
            .iter()
            .map(|file| {
                let source = self
                    .ctx
                    .storage
                    .input_path(&self.job.spec.access_key, &file.local_file)?;
                Ok(StagedFile {
                    source,
                    dest: file.dest_file.clone(),
                })
            })
            .collect()
    }

    /// POST `{id, status, trace}` to the job's notify URL. Network
    /// failures are logged, never fatal.
    async fn notify(&self) {
        let Some(url) = &self.job.spec.notify_url else {
            return;
        };
        let view = self.job.view();
        let body = serde_json::json!({
            "id": view.id,
            "status": view.status,
            "trace": view.trace,
        });
        match self.ctx.http.post(url).json(&body).send().await {
            Ok(response) => self
                .job
                .trace(format!("notified {} ({})", url, response.status())),
            Err(e) => {
                tracing::warn!(job = self.job.id, %url, error = %e, "notify POST failed");
            }
        }
    }

    /// At-most-once asynchronous delivery of the output artefact.
    fn spawn_callback(&self, url: String, artefact: std::path::PathBuf) {
        let http = self.ctx.http.clone();
        let job_id = self.job.id;
        tokio::spawn(async move {
            let bytes = match tokio::fs::read(&artefact).await {
                Ok(bytes) => bytes,
                Err(e) => {
                    tracing::warn!(job = job_id, error = %e, "callback: artefact unreadable");
                    return;
                }
            };
            if let Err(e) = http.post(&url).body(bytes).send().await {
                tracing::warn!(job = job_id, %url, error = %e, "output callback failed");
            }
        });
    }
}
