//! Scripted in-memory driver.
//!
//! Used by the test suite and for dry runs of the broker without any
//! execution engine installed. Failures are injected by arming counters
//! ("fail the next N waits"); the create/destroy history is recorded so
//! tests can assert on VM churn.

use std::collections::HashSet;
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::{Error, Result};
use crate::output::BoundedSink;
use crate::vm::VmHandle;

use super::{RunEnd, RunOutcome, StagedFile, VmmsDriver};

#[derive(Default)]
struct FakeState {
    existing: HashSet<String>,
    created: Vec<String>,
    destroyed: Vec<String>,
}

pub struct FakeDriver {
    images: Vec<String>,
    output: Mutex<Vec<u8>>,
    run_end: Mutex<RunEnd>,
    exit_status: Mutex<Option<i32>>,
    run_delay: Mutex<Duration>,
    destroy_delay: Mutex<Duration>,
    fail_create: AtomicU32,
    fail_wait: AtomicU32,
    fail_copy_in: AtomicU32,
    fail_copy_out: AtomicU32,
    panic_runs: AtomicU32,
    state: Mutex<FakeState>,
}

impl FakeDriver {
    pub fn new(mut images: Vec<String>) -> Self {
        images.sort();
        Self {
            images,
            output: Mutex::new(b"make: ok\n".to_vec()),
            run_end: Mutex::new(RunEnd::Normal),
            exit_status: Mutex::new(Some(0)),
            run_delay: Mutex::new(Duration::ZERO),
            destroy_delay: Mutex::new(Duration::ZERO),
            fail_create: AtomicU32::new(0),
            fail_wait: AtomicU32::new(0),
            fail_copy_in: AtomicU32::new(0),
            fail_copy_out: AtomicU32::new(0),
            panic_runs: AtomicU32::new(0),
            state: Mutex::new(FakeState::default()),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, FakeState> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn locked<T: Clone>(slot: &Mutex<T>) -> T {
        slot.lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    fn set<T>(slot: &Mutex<T>, value: T) {
        *slot
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = value;
    }

    /// Consume one failure token if any are armed.
    fn take_failure(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| v.checked_sub(1))
            .is_ok()
    }

    // ── scripting ────────────────────────────────────────────────────────

    /// Fail the next `n` `initialize_vm` calls.
    pub fn fail_create(&self, n: u32) {
        self.fail_create.store(n, Ordering::SeqCst);
    }

    /// Fail the next `n` `wait_vm` calls.
    pub fn fail_wait(&self, n: u32) {
        self.fail_wait.store(n, Ordering::SeqCst);
    }

    /// Fail the next `n` `copy_in` calls.
    pub fn fail_copy_in(&self, n: u32) {
        self.fail_copy_in.store(n, Ordering::SeqCst);
    }

    /// Fail the next `n` `copy_out` calls.
    pub fn fail_copy_out(&self, n: u32) {
        self.fail_copy_out.store(n, Ordering::SeqCst);
    }

    /// Panic inside the next `n` `run_job` calls (simulates a dying worker).
    pub fn panic_on_run(&self, n: u32) {
        self.panic_runs.store(n, Ordering::SeqCst);
    }

    /// Bytes every run writes into its sink.
    pub fn script_output(&self, bytes: &[u8]) {
        Self::set(&self.output, bytes.to_vec());
    }

    /// How subsequent runs end.
    pub fn script_run_end(&self, end: RunEnd) {
        Self::set(&self.run_end, end);
    }

    pub fn script_exit_status(&self, status: Option<i32>) {
        Self::set(&self.exit_status, status);
    }

    /// Wall-clock duration each run takes before completing.
    pub fn script_run_delay(&self, delay: Duration) {
        Self::set(&self.run_delay, delay);
    }

    /// Wall-clock duration each destroy takes before the VM disappears.
    pub fn script_destroy_delay(&self, delay: Duration) {
        Self::set(&self.destroy_delay, delay);
    }

    // ── history ──────────────────────────────────────────────────────────

    pub fn created(&self) -> Vec<String> {
        self.state().created.clone()
    }

    pub fn destroyed(&self) -> Vec<String> {
        self.state().destroyed.clone()
    }

    pub fn created_count(&self) -> usize {
        self.state().created.len()
    }

    pub fn destroyed_count(&self) -> usize {
        self.state().destroyed.len()
    }

    /// Pre-seed an existing VM, as if left over from a previous run.
    pub fn seed_vm(&self, name: &str) {
        self.state().existing.insert(name.to_string());
    }
}

#[async_trait]
impl VmmsDriver for FakeDriver {
    fn name(&self) -> &'static str {
        "fake"
    }

    async fn images(&self) -> Result<Vec<String>> {
        Ok(self.images.clone())
    }

    async fn initialize_vm(&self, vm: &VmHandle) -> Result<()> {
        if Self::take_failure(&self.fail_create) {
            return Err(Error::vm(&vm.name(), "scripted create failure"));
        }
        let mut state = self.state();
        state.existing.insert(vm.name());
        state.created.push(vm.name());
        Ok(())
    }

    async fn wait_vm(&self, vm: &VmHandle, deadline: Duration) -> Result<()> {
        if Self::take_failure(&self.fail_wait) {
            return Err(Error::Timeout(format!(
                "VM {} not ready after {:?}",
                vm.name(),
                deadline
            )));
        }
        if self.state().existing.contains(&vm.name()) {
            Ok(())
        } else {
            Err(Error::vm(&vm.name(), "no such VM"))
        }
    }

    async fn copy_in(&self, vm: &VmHandle, _files: &[StagedFile]) -> Result<()> {
        if Self::take_failure(&self.fail_copy_in) {
            return Err(Error::vm(&vm.name(), "scripted copy-in failure"));
        }
        Ok(())
    }

    async fn run_job(
        &self,
        vm: &VmHandle,
        _limit: Duration,
        sink: &mut BoundedSink,
    ) -> Result<RunOutcome> {
        if Self::take_failure(&self.panic_runs) {
            panic!("scripted panic in run_job for {}", vm.name());
        }
        let delay = Self::locked(&self.run_delay);
        if delay > Duration::ZERO {
            tokio::time::sleep(delay).await;
        }
        sink.write(&Self::locked(&self.output)).await?;
        sink.flush().await?;
        let end = Self::locked(&self.run_end);
        let exit_status = match end {
            RunEnd::Normal => Self::locked(&self.exit_status),
            RunEnd::Timeout | RunEnd::Killed => None,
        };
        Ok(RunOutcome { exit_status, end })
    }

    async fn copy_out(&self, vm: &VmHandle, _dest: &Path) -> Result<()> {
        if Self::take_failure(&self.fail_copy_out) {
            return Err(Error::vm(&vm.name(), "scripted copy-out failure"));
        }
        Ok(())
    }

    async fn destroy_vm(&self, vm: &VmHandle) -> Result<()> {
        let delay = Self::locked(&self.destroy_delay);
        if delay > Duration::ZERO {
            tokio::time::sleep(delay).await;
        }
        let mut state = self.state();
        state.existing.remove(&vm.name());
        state.destroyed.push(vm.name());
        Ok(())
    }

    async fn safe_destroy_vm(&self, vm: &VmHandle, _grace: Duration) -> Result<()> {
        self.destroy_vm(vm).await
    }

    async fn get_vms(&self) -> Result<Vec<String>> {
        let mut names: Vec<String> = self.state().existing.iter().cloned().collect();
        names.sort();
        Ok(names)
    }

    async fn exists_vm(&self, vm: &VmHandle) -> Result<bool> {
        Ok(self.state().existing.contains(&vm.name()))
    }
}
