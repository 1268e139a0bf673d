//! Jobs: the unit of work the broker schedules.
//!
//! A [`JobSpec`] is what a requester submits; a [`Job`] wraps it with the
//! broker-side bookkeeping (trace, timestamps, retry count, assigned VM).
//! Jobs are shared as `Arc<Job>` between the queue, the scheduler and the
//! owning worker; the interior state sits behind its own lock so trace
//! appends never contend with queue operations.

pub mod manager;
pub mod queue;
pub mod worker;

use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Output formats a requester can ask for when polling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    Raw,
    Base64,
}

/// One input file: where it lives in the requester's directory and what
/// it is called inside the sandbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InputFile {
    pub local_file: String,
    pub dest_file: String,
}

/// Where the captured output goes and how poll responses encode it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutputSpec {
    pub dest_path: String,
    pub format: OutputFormat,
    #[serde(default, rename = "callbackURL")]
    pub callback_url: Option<String>,
}

/// A job submission, as received by the facade.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobSpec {
    pub image: String,
    pub input_files: Vec<InputFile>,
    pub output_file: OutputSpec,
    #[serde(rename = "maxOutputFileSize")]
    pub max_output_size: u64,
    /// Maximum runtime in seconds.
    pub timeout: u64,
    #[serde(default, rename = "notifyURL")]
    pub notify_url: Option<String>,
    #[serde(default)]
    pub access_key: String,
}

/// Final disposition of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Live, waiting for a VM.
    Pending,
    /// Live, owned by a worker.
    Running,
    /// Dead; the run finished and output was copied out. Runs that hit
    /// their time limit still complete (with a timeout trace marker).
    Completed,
    /// Dead; rejected, cancelled, or failed at some stage.
    Failed,
}

/// One timestamped status line in a job's history.
#[derive(Debug, Clone, Serialize)]
pub struct TraceEntry {
    /// Seconds since the Unix epoch.
    pub at: u64,
    pub msg: String,
}

#[derive(Debug)]
struct JobState {
    status: JobStatus,
    assigned_vm: Option<u32>,
    trace: Vec<TraceEntry>,
    retries: u32,
    cancelled: bool,
    appended_at: u64,
    assigned_at: Option<u64>,
    started_at: Option<u64>,
    finished_at: Option<u64>,
}

/// A live or dead job. Identity and spec are immutable; everything else
/// lives behind the state lock.
#[derive(Debug)]
pub struct Job {
    pub id: u64,
    pub spec: JobSpec,
    /// Dedupe fingerprint, present for jobs that entered the live queue.
    pub fingerprint: Option<String>,
    state: Mutex<JobState>,
}

impl Job {
    pub fn new(id: u64, spec: JobSpec, fingerprint: Option<String>) -> Self {
        Self {
            id,
            spec,
            fingerprint,
            state: Mutex::new(JobState {
                status: JobStatus::Pending,
                assigned_vm: None,
                trace: Vec::new(),
                retries: 0,
                cancelled: false,
                appended_at: now_secs(),
                assigned_at: None,
                started_at: None,
                finished_at: None,
            }),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, JobState> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Append a timestamped line to the trace.
    pub fn trace(&self, msg: impl Into<String>) {
        self.state().trace.push(TraceEntry {
            at: now_secs(),
            msg: msg.into(),
        });
    }

    pub fn status(&self) -> JobStatus {
        self.state().status
    }

    pub fn set_status(&self, status: JobStatus) {
        self.state().status = status;
    }

    pub fn assigned_vm(&self) -> Option<u32> {
        self.state().assigned_vm
    }

    /// Attach or detach a VM. Attaching stamps the assigned timestamp.
    pub fn set_assigned(&self, vm: Option<u32>) {
        let mut state = self.state();
        if vm.is_some() && state.assigned_at.is_none() {
            state.assigned_at = Some(now_secs());
        }
        state.assigned_vm = vm;
    }

    /// Stamp the start of the run stage.
    pub fn mark_started(&self) {
        let mut state = self.state();
        if state.started_at.is_none() {
            state.started_at = Some(now_secs());
        }
    }

    /// Stamp completion. Idempotent; keeps the first finish time.
    pub fn finish(&self, status: JobStatus) {
        let mut state = self.state();
        state.status = status;
        if state.finished_at.is_none() {
            state.finished_at = Some(now_secs());
        }
    }

    pub fn cancel(&self) {
        self.state().cancelled = true;
    }

    pub fn is_cancelled(&self) -> bool {
        self.state().cancelled
    }

    pub fn retries(&self) -> u32 {
        self.state().retries
    }

    /// Increment and return the retry count.
    pub fn bump_retries(&self) -> u32 {
        let mut state = self.state();
        state.retries += 1;
        state.retries
    }

    /// Serializable view for the jobs/poll endpoints and notifications.
    pub fn view(&self) -> JobView {
        let state = self.state();
        JobView {
            id: self.id,
            image: self.spec.image.clone(),
            status: state.status,
            assigned_vm: state.assigned_vm,
            retries: state.retries,
            trace: state.trace.clone(),
            appended_at: state.appended_at,
            assigned_at: state.assigned_at,
            started_at: state.started_at,
            finished_at: state.finished_at,
        }
    }
}

/// Point-in-time serializable copy of a job's bookkeeping.
#[derive(Debug, Clone, Serialize)]
pub struct JobView {
    pub id: u64,
    pub image: String,
    pub status: JobStatus,
    pub assigned_vm: Option<u32>,
    pub retries: u32,
    pub trace: Vec<TraceEntry>,
    pub appended_at: u64,
    pub assigned_at: Option<u64>,
    pub started_at: Option<u64>,
    pub finished_at: Option<u64>,
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
pub(crate) fn test_spec(image: &str) -> JobSpec {
    JobSpec {
        image: image.to_string(),
        input_files: vec![InputFile {
            local_file: "Makefile".to_string(),
            dest_file: "Makefile".to_string(),
        }],
        output_file: OutputSpec {
            dest_path: "out.log".to_string(),
            format: OutputFormat::Raw,
            callback_url: None,
        },
        max_output_size: 4096,
        timeout: 10,
        notify_url: None,
        access_key: "tester".to_string(),
    }
}
