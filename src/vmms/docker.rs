//! Docker driver: sandboxes are long-lived containers managed through the
//! docker CLI.
//!
//! A VM maps to `docker run -d … sleep infinity`; inputs arrive with
//! `docker cp`, the build runs under `docker exec`, and teardown is
//! `docker rm -f`. Container names carry the broker prefix plus the VM
//! name so startup reconciliation can find leftovers from a previous run.

use std::collections::HashSet;
use std::path::Path;
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

/// Label and name prefix marking containers as broker-owned.
const CONTAINER_PREFIX: &str = "makevisor-";
const OWNED_LABEL: &str = "makevisor=1";

pub struct DockerDriver {
    image_prefix: String,
    job_dir: String,
    running: Mutex<HashSet<String>>,
}

impl DockerDriver {
    pub fn new(image_prefix: String, job_dir: String) -> Self {
        Self {
            image_prefix,
            job_dir,
            running: Mutex::new(HashSet::new()),
        }
    }

    fn container(&self, vm: &VmHandle) -> String {
        format!("{}{}", CONTAINER_PREFIX, vm.name())
    }

    fn running(&self) -> std::sync::MutexGuard<'_, HashSet<String>> {
        self.running
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    async fn docker(&self, args: &[&str]) -> Result<std::process::Output> {
        let output = Command::new("docker").args(args).output().await?;
        Ok(output)
    }

    /// Run a docker command and fail with its stderr on a nonzero status.
    async fn docker_ok(&self, args: &[&str]) -> Result<String> {
        let output = self.docker(args).await?;
        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).into_owned())
        } else {
            Err(Error::Driver(format!(
                "docker {} failed: {}",
                args.first().copied().unwrap_or(""),
                String::from_utf8_lossy(&output.stderr).trim()
            )))
        }
    }
}

#[async_trait]
impl VmmsDriver for DockerDriver {
    fn name(&self) -> &'static str {
        "docker"
    }

    async fn images(&self) -> Result<Vec<String>> {
        let listed = self
            .docker_ok(&["images", "--format", "{{.Repository}}"])
            .await?;
        let mut images: Vec<String> = listed
            .lines()
            .filter(|line| !line.is_empty() && *line != "<none>")
            .filter_map(|line| line.strip_prefix(&self.image_prefix))
            .map(str::to_string)
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        images.sort();
        Ok(images)
    }

    async fn initialize_vm(&self, vm: &VmHandle) -> Result<()> {
        let container = self.container(vm);
        let image = format!("{}{}", self.image_prefix, vm.image);
        self.docker_ok(&[
            "run",
            "-d",
            "--name",
            container.as_str(),
            "--label",
            OWNED_LABEL,
            image.as_str(),
            "sleep",
            "infinity",
        ])
        .await?;
        self.docker_ok(&["exec", container.as_str(), "mkdir", "-p", &self.job_dir])
            .await?;
        Ok(())
    }

    async fn wait_vm(&self, vm: &VmHandle, deadline: Duration) -> Result<()> {
        let container = self.container(vm);
        let until = Instant::now() + deadline;
        loop {
            let output = self
                .docker(&["inspect", "-f", "{{.State.Running}}", container.as_str()])
                .await?;
            if output.status.success()
                && String::from_utf8_lossy(&output.stdout).trim() == "true"
            {
                return Ok(());
            }
            if Instant::now() >= until {
                return Err(Error::Timeout(format!(
                    "container {} not running after {:?}",
                    container, deadline
                )));
            }
            tokio::time::sleep(Duration::from_millis(250)).await;
        }
    }

    async fn copy_in(&self, vm: &VmHandle, files: &[StagedFile]) -> Result<()> {
        let container = self.container(vm);
        for file in files {
            let source = file.source.to_string_lossy().into_owned();
            let target = format!("{}:{}/{}", container, self.job_dir, file.dest);
            self.docker_ok(&["cp", source.as_str(), target.as_str()])
                .await?;
        }
        Ok(())
    }

    async fn run_job(
        &self,
        vm: &VmHandle,
        limit: Duration,
        sink: &mut BoundedSink,
    ) -> Result<RunOutcome> {
        let container = self.container(vm);
        self.running().insert(vm.name());
        let _guard = DockerRunGuard {
            driver: self,
            name: vm.name(),
        };

        let mut child = Command::new("docker")
            .args([
                "exec",
                "-w",
                self.job_dir.as_str(),
                container.as_str(),
                "/bin/sh",
                "-c",
                "exec make 2>&1",
            ])
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
                    // Killing the exec client leaves the container in an
                    // unknown state; the worker destroys it on release.
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
        // The exec stream already delivered the output to the sink.
        tokio::fs::metadata(dest).await?;
        Ok(())
    }

    async fn destroy_vm(&self, vm: &VmHandle) -> Result<()> {
        let container = self.container(vm);
        let output = self.docker(&["rm", "-f", container.as_str()]).await?;
        if output.status.success() {
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        if stderr.contains("No such container") {
            Ok(())
        } else {
            Err(Error::Driver(format!(
                "docker rm {} failed: {}",
                container,
                stderr.trim()
            )))
        }
    }

    async fn safe_destroy_vm(&self, vm: &VmHandle, grace: Duration) -> Result<()> {
        let deadline = Instant::now() + grace;
        while self.running().contains(&vm.name()) && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        self.destroy_vm(vm).await
    }

    async fn get_vms(&self) -> Result<Vec<String>> {
        let label_filter = format!("label={}", OWNED_LABEL);
        let listed = self
            .docker_ok(&[
                "ps",
                "-a",
                "--filter",
                label_filter.as_str(),
                "--format",
                "{{.Names}}",
            ])
            .await?;
        let mut names: Vec<String> = listed
            .lines()
            .filter_map(|line| line.strip_prefix(CONTAINER_PREFIX))
            .map(str::to_string)
            .collect();
        names.sort();
        Ok(names)
    }

    async fn exists_vm(&self, vm: &VmHandle) -> Result<bool> {
        let container = self.container(vm);
        let output = self.docker(&["inspect", container.as_str()]).await?;
        Ok(output.status.success())
    }
}

struct DockerRunGuard<'a> {
    driver: &'a DockerDriver,
    name: String,
}

impl Drop for DockerRunGuard<'_> {
    fn drop(&mut self) {
        self.driver.running().remove(&self.name);
    }
}
