//! VMMS driver abstraction.
//!
//! A driver knows how to create, supervise and destroy one kind of
//! execution environment (a scratch directory, a container, a microVM, a
//! cloud instance). The broker core only ever talks to [`VmmsDriver`];
//! concrete drivers are produced by a [`DriverRegistry`] keyed by name.

pub mod docker;
pub mod fake;
pub mod process;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::output::BoundedSink;
use crate::vm::VmHandle;

/// How a supervised run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunEnd {
    /// The build exited on its own within the limit.
    Normal,
    /// The time limit expired; the process was stopped by the driver.
    Timeout,
    /// The process died without an exit status (signal, engine kill).
    Killed,
}

/// Result of [`VmmsDriver::run_job`].
#[derive(Debug, Clone, Copy)]
pub struct RunOutcome {
    /// Exit status of `make`, when the run ended normally.
    pub exit_status: Option<i32>,
    pub end: RunEnd,
}

/// One input file resolved to a host path, ready to place in a sandbox.
#[derive(Debug, Clone)]
pub struct StagedFile {
    /// Absolute path on the broker host.
    pub source: PathBuf,
    /// File name inside the sandbox work directory.
    pub dest: String,
}

/// Capability set every execution-environment driver implements.
///
/// Drivers must be safe for concurrent calls on distinct VMs; calls on the
/// same VM are serialised by the owning worker.
#[async_trait]
pub trait VmmsDriver: Send + Sync {
    /// Registry name of this driver.
    fn name(&self) -> &'static str;

    /// Images this driver can instantiate.
    async fn images(&self) -> Result<Vec<String>>;

    /// Create the execution environment for `vm`. On success the VM is
    /// reachable but not necessarily ready for commands yet.
    async fn initialize_vm(&self, vm: &VmHandle) -> Result<()>;

    /// Poll until the VM accepts commands, or `deadline` passes.
    async fn wait_vm(&self, vm: &VmHandle, deadline: Duration) -> Result<()>;

    /// Upload input files into the sandbox work directory.
    async fn copy_in(&self, vm: &VmHandle, files: &[StagedFile]) -> Result<()>;

    /// Run `make` in the sandbox work directory, streaming combined
    /// stdout+stderr into `sink` and enforcing `limit`.
    async fn run_job(
        &self,
        vm: &VmHandle,
        limit: Duration,
        sink: &mut BoundedSink,
    ) -> Result<RunOutcome>;

    /// Finalise the output artefact at the requester-side path.
    async fn copy_out(&self, vm: &VmHandle, dest: &Path) -> Result<()>;

    /// Tear the VM down. Idempotent: destroying a VM that is already gone
    /// succeeds.
    async fn destroy_vm(&self, vm: &VmHandle) -> Result<()>;

    /// Destroy once the VM is idle, waiting up to `grace`, then force.
    async fn safe_destroy_vm(&self, vm: &VmHandle, grace: Duration) -> Result<()>;

    /// Names of VMs this driver currently knows about. Used by startup
    /// reconciliation.
    async fn get_vms(&self) -> Result<Vec<String>>;

    /// Whether the named VM still exists.
    async fn exists_vm(&self, vm: &VmHandle) -> Result<bool>;
}

type DriverFactory = Box<dyn Fn(&Config) -> Result<Arc<dyn VmmsDriver>> + Send + Sync>;

/// Name-keyed registry of driver factories.
pub struct DriverRegistry {
    factories: HashMap<String, DriverFactory>,
}

impl DriverRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Registry with the built-in drivers registered.
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        registry.register("process", |config| {
            // every configured pool's image is implicitly available
            let mut images = config.process.images.clone();
            for image in config.pools.keys() {
                if !images.contains(image) {
                    images.push(image.clone());
                }
            }
            images.sort();
            Ok(Arc::new(process::ProcessDriver::new(
                config.process.work_root.clone(),
                images,
            )) as Arc<dyn VmmsDriver>)
        });
        registry.register("docker", |config| {
            Ok(Arc::new(docker::DockerDriver::new(
                config.docker.image_prefix.clone(),
                config.docker.job_dir.clone(),
            )) as Arc<dyn VmmsDriver>)
        });
        registry.register("fake", |config| {
            Ok(Arc::new(fake::FakeDriver::new(
                config.pools.keys().cloned().collect(),
            )) as Arc<dyn VmmsDriver>)
        });
        registry
    }

    pub fn register<F>(&mut self, name: &str, factory: F)
    where
        F: Fn(&Config) -> Result<Arc<dyn VmmsDriver>> + Send + Sync + 'static,
    {
        self.factories.insert(name.to_string(), Box::new(factory));
    }

    /// Instantiate the named driver from configuration.
    pub fn create(&self, name: &str, config: &Config) -> Result<Arc<dyn VmmsDriver>> {
        let factory = self
            .factories
            .get(name)
            .ok_or_else(|| Error::UnknownDriver(name.to_string()))?;
        factory(config)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.factories.keys().cloned().collect();
        names.sort();
        names
    }
}
