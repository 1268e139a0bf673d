//! Process driver: sandboxes are scratch directories on the broker host.
//!
//! Each VM is a directory under the configured work root; `run_job`
//! executes `make` there in a local subprocess. There is no isolation
//! beyond the directory boundary, which makes this driver suitable for
//! trusted jobs, development, and exercising the broker end-to-end on a
//! bare host.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::time::Instant;

use crate::error::{Error, Result};
use crate::output::BoundedSink;
use crate::vm::VmHandle;

use super::{RunEnd, RunOutcome, StagedFile, VmmsDriver};

pub struct ProcessDriver {
    work_root: PathBuf,
    images: Vec<String>,
    /// VMs with a run in progress, for `safe_destroy_vm`.
    running: Mutex<HashSet<String>>,
}

impl ProcessDriver {
    pub fn new(work_root: PathBuf, images: Vec<String>) -> Self {
        Self {
            work_root,
            images,
            running: Mutex::new(HashSet::new()),
        }
    }

    fn vm_dir(&self, vm: &VmHandle) -> PathBuf {
        self.work_root.join(vm.name())
    }

    fn running(&self) -> std::sync::MutexGuard<'_, HashSet<String>> {
        self.running
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn is_running(&self, vm: &VmHandle) -> bool {
        self.running().contains(&vm.name())
    }
}

/// Clears the running mark even when `run_job` exits through `?`.
struct RunGuard<'a> {
    driver: &'a ProcessDriver,
    name: String,
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.driver.running().remove(&self.name);
    }
}

#[async_trait]
impl VmmsDriver for ProcessDriver {
    fn name(&self) -> &'static str {
        "process"
    }

    async fn images(&self) -> Result<Vec<String>> {
        Ok(self.images.clone())
    }

    async fn initialize_vm(&self, vm: &VmHandle) -> Result<()> {
        tokio::fs::create_dir_all(self.vm_dir(vm)).await?;
        Ok(())
    }

    async fn wait_vm(&self, vm: &VmHandle, _deadline: Duration) -> Result<()> {
        // A directory is ready the moment it exists.
        let dir = self.vm_dir(vm);
        if tokio::fs::metadata(&dir).await.is_ok() {
            Ok(())
        } else {
            Err(Error::vm(&vm.name(), "sandbox directory missing"))
        }
    }

    async fn copy_in(&self, vm: &VmHandle, files: &[StagedFile]) -> Result<()> {
        let dir = self.vm_dir(vm);
        for file in files {
            tokio::fs::copy(&file.source, dir.join(&file.dest)).await?;
        }
        Ok(())
    }

    async fn run_job(
        &self,
        vm: &VmHandle,
        limit: Duration,
        sink: &mut BoundedSink,
    ) -> Result<RunOutcome> {
        let dir = self.vm_dir(vm);
        self.running().insert(vm.name());
        let _guard = RunGuard {
            driver: self,
            name: vm.name(),
        };

        // The shell merges stderr into stdout so the sink sees one
        // combined stream in arrival order.
        let mut child = Command::new("/bin/sh")
            .arg("-c")
            .arg("exec make 2>&1")
            .current_dir(&dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()?;
        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::vm(&vm.name(), "stdout not captured"))?;

        let deadline = Instant::now() + limit;
        let mut buf = vec![0u8; 8192];
        loop {
            match tokio::time::timeout_at(deadline, stdout.read(&mut buf)).await {
                Err(_) => {
                    // Time limit expired mid-stream.
                    let _ = child.start_kill();
                    let _ = child.wait().await;
                    sink.flush().await?;
                    return Ok(RunOutcome {
                        exit_status: None,
                        end: RunEnd::Timeout,
                    });
                }
                Ok(Ok(0)) => break,
                Ok(Ok(n)) => sink.write(&buf[..n]).await?,
                Ok(Err(e)) => {
                    let _ = child.start_kill();
                    let _ = child.wait().await;
                    return Err(e.into());
                }
            }
        }

        let status = match tokio::time::timeout_at(deadline, child.wait()).await {
            Ok(status) => status?,
            Err(_) => {
                let _ = child.start_kill();
                let _ = child.wait().await;
                sink.flush().await?;
                return Ok(RunOutcome {
                    exit_status: None,
                    end: RunEnd::Timeout,
                });
            }
        };
        sink.flush().await?;

        Ok(match status.code() {
            Some(code) => RunOutcome {
                exit_status: Some(code),
                end: RunEnd::Normal,
            },
            None => RunOutcome {
                exit_status: None,
                end: RunEnd::Killed,
            },
        })
    }

    async fn copy_out(&self, _vm: &VmHandle, dest: &Path) -> Result<()> {
        // Output streams straight to the destination while the job runs;
        // all that is left is to confirm the artefact landed.
        tokio::fs::metadata(dest).await?;
        Ok(())
    }

    async fn destroy_vm(&self, vm: &VmHandle) -> Result<()> {
        match tokio::fs::remove_dir_all(self.vm_dir(vm)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn safe_destroy_vm(&self, vm: &VmHandle, grace: Duration) -> Result<()> {
        let deadline = Instant::now() + grace;
        while self.is_running(vm) && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        self.destroy_vm(vm).await
    }

    async fn get_vms(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        let mut entries = match tokio::fs::read_dir(&self.work_root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(names),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_dir() {
                names.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        names.sort();
        Ok(names)
    }

    async fn exists_vm(&self, vm: &VmHandle) -> Result<bool> {
        Ok(tokio::fs::metadata(self.vm_dir(vm)).await.is_ok())
    }
}
