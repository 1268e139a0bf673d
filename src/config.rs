//! Broker configuration.
//!
//! All knobs live in one [`Config`] struct, deserialized from a JSON file
//! named on the command line. Every field has a default so a bare
//! `makevisor` starts with the process driver and an empty pool set.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::{Error, Result};

/// Top-level configuration for one broker instance.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Registry name of the VMMS driver to instantiate.
    pub driver: String,
    /// Address the HTTP facade listens on.
    pub listen_addr: SocketAddr,
    /// Root directory for requester files (uploads and captured output).
    pub storage_root: PathBuf,
    /// Accepted requester keys. Empty means the broker is open.
    pub access_keys: Vec<String>,
    /// Per-image pool targets and flags.
    pub pools: HashMap<String, PoolTarget>,
    /// Upper bound on `|total|` for any single image.
    pub hard_cap: usize,
    /// Per-attempt readiness deadline for a freshly created VM.
    pub ready_timeout_secs: u64,
    /// Maximum runtime a job may request.
    pub run_timeout_ceiling_secs: u64,
    /// Bounded retry budget: VM replacements per job, create attempts per
    /// pool slot, and worker deaths per job all use this bound.
    pub retry_budget: u32,
    /// How many completed jobs the dead ring retains.
    pub dead_ring_capacity: usize,
    /// Scheduler tick period.
    pub tick_period_ms: u64,
    /// Ceiling on the `maxOutputFileSize` a job may request.
    pub max_output_bytes: u64,
    /// Whether the dedupe fingerprint includes the requester key.
    pub dedupe_by_key: bool,
    /// Grace period `safeDestroyVM` waits for a VM to go idle.
    pub safe_destroy_grace_secs: u64,
    /// Settings for the process driver.
    pub process: ProcessSettings,
    /// Settings for the docker driver.
    pub docker: DockerSettings,
}

/// Target size and release policy for one image's pool.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PoolTarget {
    /// Number of warm VMs to maintain.
    pub target: usize,
    /// Whether VMs of this image are reused after a clean run.
    pub keep_alive: bool,
}

impl Default for PoolTarget {
    fn default() -> Self {
        Self {
            target: 0,
            keep_alive: true,
        }
    }
}

/// Process-driver settings: sandboxes are scratch directories.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProcessSettings {
    /// Directory the driver creates sandbox directories under.
    pub work_root: PathBuf,
    /// Image names the driver reports. The process driver does not
    /// differentiate images; they exist so pools and validation line up.
    pub images: Vec<String>,
}

impl Default for ProcessSettings {
    fn default() -> Self {
        Self {
            work_root: PathBuf::from("./sandboxes"),
            images: vec!["default".to_string()],
        }
    }
}

/// Docker-driver settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DockerSettings {
    /// Prefix that marks a local docker image as usable by the broker.
    /// `getImages` strips it; VM creation prepends it back.
    pub image_prefix: String,
    /// Directory inside the container where inputs land and `make` runs.
    pub job_dir: String,
}

impl Default for DockerSettings {
    fn default() -> Self {
        Self {
            image_prefix: String::new(),
            job_dir: "/home/job".to_string(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            driver: "process".to_string(),
            listen_addr: ([0, 0, 0, 0], 3000).into(),
            storage_root: PathBuf::from("./requesters"),
            access_keys: Vec::new(),
            pools: HashMap::new(),
            hard_cap: 32,
            ready_timeout_secs: 30,
            run_timeout_ceiling_secs: 600,
            retry_budget: 5,
            dead_ring_capacity: 4096,
            tick_period_ms: 2000,
            max_output_bytes: 4 * 1024 * 1024,
            dedupe_by_key: true,
            safe_destroy_grace_secs: 30,
            process: ProcessSettings::default(),
            docker: DockerSettings::default(),
        }
    }
}

impl Config {
    /// Load configuration from a JSON file.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.run_timeout_ceiling_secs == 0 {
            return Err(Error::Config("run_timeout_ceiling_secs must be > 0".into()));
        }
        if self.retry_budget == 0 {
            return Err(Error::Config("retry_budget must be > 0".into()));
        }
        if self.hard_cap == 0 {
            return Err(Error::Config("hard_cap must be > 0".into()));
        }
        for (image, pool) in &self.pools {
            if pool.target > self.hard_cap {
                return Err(Error::Config(format!(
                    "pool target for '{}' exceeds hard_cap {}",
                    image, self.hard_cap
                )));
            }
        }
        Ok(())
    }

    pub fn ready_timeout(&self) -> Duration {
        Duration::from_secs(self.ready_timeout_secs)
    }

    pub fn tick_period(&self) -> Duration {
        Duration::from_millis(self.tick_period_ms)
    }

    pub fn safe_destroy_grace(&self) -> Duration {
        Duration::from_secs(self.safe_destroy_grace_secs)
    }
}
