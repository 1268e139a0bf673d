//! Preallocator: per-image pools of warm sandbox VMs.
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────────┐
//! │  pool("alpine")              pool("ubuntu")                    │
//! │  free:  [vm-3, vm-5]         free:  [vm-1]                     │
//! │  total: {3, 4, 5}            total: {1, 2}                     │
//! │              │                                                 │
//! │              ▼                                                 │
//! │   alloc_vm() ──► VM owned by a worker                          │
//! │              │                                                 │
//! │              ▼                                                 │
//! │   free_vm() ──► pooled again, or destroyed + replacement       │
//! └────────────────────────────────────────────────────────────────┘
//! ```
//!
//! `free` and `total` are guarded together by one lock held only across
//! in-memory updates; the slow driver calls (create/destroy) run on
//! background tasks and report back under the lock. Invariants: the free
//! list is a subset of total, total never exceeds the hard cap, and every
//! id in total is either free or held by exactly one live job.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::metrics;
use crate::vm::VmHandle;
use crate::vmms::VmmsDriver;

/// Knobs the preallocator reads from configuration.
#[derive(Debug, Clone)]
pub struct PoolSettings {
    /// Upper bound on `|total|` for any one image.
    pub hard_cap: usize,
    /// Attempts per scheduled create before it is abandoned.
    pub create_retries: u32,
    /// Pause between create attempts.
    pub create_retry_delay: Duration,
    /// How long `shutdown` waits for a busy VM before forcing teardown.
    pub safe_destroy_grace: Duration,
}

impl PoolSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            hard_cap: config.hard_cap,
            create_retries: config.retry_budget,
            create_retry_delay: Duration::from_millis(500),
            safe_destroy_grace: config.safe_destroy_grace(),
        }
    }
}

/// Point-in-time view of one image's pool.
#[derive(Debug, Clone, serde::Serialize)]
pub struct PoolSnapshot {
    pub image: String,
    pub free: usize,
    pub total: usize,
    pub target: usize,
}

struct ImagePool {
    free: VecDeque<VmHandle>,
    total: HashSet<u32>,
    target: usize,
    keep_alive: bool,
    /// Creates scheduled but not yet completed. Counted against the
    /// target and the hard cap, never part of `total`.
    pending_creates: usize,
    next_id: u32,
}

impl ImagePool {
    fn new(keep_alive: bool) -> Self {
        Self {
            free: VecDeque::new(),
            total: HashSet::new(),
            target: 0,
            keep_alive,
            pending_creates: 0,
            next_id: 1,
        }
    }

    fn take_id(&mut self) -> u32 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }
}

#[derive(Default)]
struct PoolMap {
    pools: HashMap<String, ImagePool>,
}

/// Per-image pools of warm execution environments.
pub struct Preallocator {
    driver: Arc<dyn VmmsDriver>,
    settings: PoolSettings,
    state: Mutex<PoolMap>,
}

impl Preallocator {
    pub fn new(driver: Arc<dyn VmmsDriver>, settings: PoolSettings) -> Arc<Self> {
        Arc::new(Self {
            driver,
            settings,
            state: Mutex::new(PoolMap::default()),
        })
    }

    /// Register an image's pool with its release policy. Idempotent.
    pub async fn define_image(&self, image: &str, keep_alive: bool) {
        let mut map = self.state.lock().await;
        map.pools
            .entry(image.to_string())
            .or_insert_with(|| ImagePool::new(keep_alive))
            .keep_alive = keep_alive;
    }

    /// Resize the pool for `image`. Growth schedules asynchronous creates;
    /// shrinkage destroys free VMs now and lets assigned VMs fall out as
    /// they are released.
    pub async fn update(self: &Arc<Self>, image: &str, target: usize) -> Result<()> {
        let target = if target > self.settings.hard_cap {
            tracing::warn!(
                image,
                target,
                hard_cap = self.settings.hard_cap,
                "pool target clamped to hard cap"
            );
            self.settings.hard_cap
        } else {
            target
        };

        let mut creates = Vec::new();
        let mut destroys = Vec::new();
        {
            let mut map = self.state.lock().await;
            let entry = map
                .pools
                .entry(image.to_string())
                .or_insert_with(|| ImagePool::new(true));
            entry.target = target;
            while entry.total.len() + entry.pending_creates < target {
                let id = entry.take_id();
                entry.pending_creates += 1;
                creates.push((id, entry.keep_alive));
            }
            while entry.total.len() + entry.pending_creates > target {
                let Some(vm) = entry.free.pop_front() else { break };
                entry.total.remove(&vm.id);
                destroys.push(vm);
            }
            Self::sync_gauges(image, entry);
        }

        tracing::info!(image, target, creating = creates.len(), destroying = destroys.len(), "pool resized");
        for (id, keep_alive) in creates {
            self.spawn_create(image.to_string(), id, keep_alive);
        }
        for vm in destroys {
            self.spawn_destroy(vm);
        }
        Ok(())
    }

    /// Pop the oldest warm VM for `image`, or `None` if the pool is empty.
    /// Atomic across concurrent callers.
    pub async fn alloc_vm(&self, image: &str) -> Option<VmHandle> {
        let mut map = self.state.lock().await;
        let entry = map.pools.get_mut(image)?;
        let vm = entry.free.pop_front()?;
        Self::sync_gauges(image, entry);
        Some(vm)
    }

    /// Return a worker-owned VM. Pooled again only when its keep-alive
    /// flag is set and the pool is under target; otherwise destroyed, with
    /// a replacement scheduled if that left the pool short.
    pub async fn free_vm(self: &Arc<Self>, vm: VmHandle) {
        let image = vm.image.clone();
        let mut replacement = None;
        let mut destroy = None;
        {
            let mut map = self.state.lock().await;
            let Some(entry) = map.pools.get_mut(&image) else {
                drop(map);
                self.spawn_destroy(vm);
                return;
            };
            let pool_it = vm.keep_alive
                && entry.free.len() < entry.target
                && entry.total.len() <= entry.target;
            if pool_it {
                entry.free.push_back(vm);
            } else {
                entry.total.remove(&vm.id);
                if entry.total.len() + entry.pending_creates < entry.target {
                    let id = entry.take_id();
                    entry.pending_creates += 1;
                    replacement = Some((id, entry.keep_alive));
                }
                destroy = Some(vm);
            }
            Self::sync_gauges(&image, entry);
        }
        if let Some(vm) = destroy {
            if let Some((id, keep_alive)) = replacement {
                self.spawn_create(image, id, keep_alive);
            }
            self.spawn_destroy(vm);
        }
    }

    /// Swap a worker's failed VM for a fresh one. The old VM leaves the
    /// accounting immediately and is destroyed in the background; the
    /// fresh VM is created synchronously because the worker is blocked on
    /// it. On create failure an asynchronous replacement is scheduled so
    /// the pool still recovers.
    pub async fn replace_vm(self: &Arc<Self>, vm: VmHandle) -> Result<VmHandle> {
        let image = vm.image.clone();
        let (id, keep_alive) = {
            let mut map = self.state.lock().await;
            let entry = map
                .pools
                .get_mut(&image)
                .ok_or_else(|| Error::UnknownImage(image.clone()))?;
            entry.total.remove(&vm.id);
            let id = entry.take_id();
            entry.pending_creates += 1;
            Self::sync_gauges(&image, entry);
            (id, entry.keep_alive)
        };
        self.spawn_destroy(vm);

        let fresh = VmHandle::new(id, image.clone(), keep_alive);
        let started = Instant::now();
        let created = self.driver.initialize_vm(&fresh).await;

        let mut map = self.state.lock().await;
        let entry = map
            .pools
            .get_mut(&image)
            .ok_or_else(|| Error::UnknownImage(image.clone()))?;
        entry.pending_creates = entry.pending_creates.saturating_sub(1);
        match created {
            Ok(()) => {
                metrics::VM_CREATES_TOTAL.inc();
                metrics::VM_CREATE_DURATION.observe(started.elapsed().as_secs_f64());
                // Owned by the calling worker, so total only.
                entry.total.insert(id);
                Self::sync_gauges(&image, entry);
                Ok(fresh)
            }
            Err(e) => {
                let retry = if entry.total.len() + entry.pending_creates < entry.target {
                    let id = entry.take_id();
                    entry.pending_creates += 1;
                    Some((id, entry.keep_alive))
                } else {
                    None
                };
                Self::sync_gauges(&image, entry);
                drop(map);
                if let Some((id, keep_alive)) = retry {
                    self.spawn_create(image.clone(), id, keep_alive);
                }
                Err(e)
            }
        }
    }

    /// Drop a worker-owned VM whose state is untrusted (worker died, job
    /// cancelled mid-flight): force destroy and schedule a replacement if
    /// the pool fell below target.
    pub async fn discard_vm(self: &Arc<Self>, vm: VmHandle) {
        let mut replacement = None;
        {
            let mut map = self.state.lock().await;
            if let Some(entry) = map.pools.get_mut(&vm.image) {
                entry.total.remove(&vm.id);
                if entry.total.len() + entry.pending_creates < entry.target {
                    let id = entry.take_id();
                    entry.pending_creates += 1;
                    replacement = Some((id, entry.keep_alive));
                }
                Self::sync_gauges(&vm.image, entry);
            }
        }
        if let Some((id, keep_alive)) = replacement {
            self.spawn_create(vm.image.clone(), id, keep_alive);
        }
        self.spawn_destroy(vm);
    }

    /// Administratively adopt an externally created VM into the free pool.
    pub async fn add_vm(&self, vm: VmHandle) -> Result<()> {
        let mut map = self.state.lock().await;
        let entry = map
            .pools
            .entry(vm.image.clone())
            .or_insert_with(|| ImagePool::new(true));
        if !entry.total.insert(vm.id) {
            return Err(Error::vm(&vm.name(), "already tracked"));
        }
        entry.next_id = entry.next_id.max(vm.id + 1);
        let image = vm.image.clone();
        entry.free.push_back(vm);
        Self::sync_gauges(&image, entry);
        Ok(())
    }

    /// Administratively destroy a free VM.
    pub async fn remove_vm(self: &Arc<Self>, image: &str, id: u32) -> Result<()> {
        let vm = {
            let mut map = self.state.lock().await;
            let entry = map
                .pools
                .get_mut(image)
                .ok_or_else(|| Error::UnknownImage(image.to_string()))?;
            let position = entry.free.iter().position(|vm| vm.id == id);
            match position {
                Some(index) => {
                    let vm = entry.free.remove(index);
                    entry.total.remove(&id);
                    Self::sync_gauges(image, entry);
                    vm
                }
                None if entry.total.contains(&id) => {
                    return Err(Error::vm(
                        &format!("{}-{}", image, id),
                        "assigned to a job; cannot remove",
                    ));
                }
                None => {
                    return Err(Error::vm(&format!("{}-{}", image, id), "not tracked"));
                }
            }
        };
        if let Some(vm) = vm {
            self.spawn_destroy(vm);
        }
        Ok(())
    }

    pub async fn get_pool(&self, image: &str) -> Option<PoolSnapshot> {
        let map = self.state.lock().await;
        map.pools.get(image).map(|entry| PoolSnapshot {
            image: image.to_string(),
            free: entry.free.len(),
            total: entry.total.len(),
            target: entry.target,
        })
    }

    pub async fn get_all_pools(&self) -> Vec<PoolSnapshot> {
        let map = self.state.lock().await;
        let mut snapshots: Vec<PoolSnapshot> = map
            .pools
            .iter()
            .map(|(image, entry)| PoolSnapshot {
                image: image.clone(),
                free: entry.free.len(),
                total: entry.total.len(),
                target: entry.target,
            })
            .collect();
        snapshots.sort_by(|a, b| a.image.cmp(&b.image));
        snapshots
    }

    /// Adopt or destroy VMs left over from a previous broker process.
    /// VMs whose image has a defined pool join its free list; everything
    /// else is torn down.
    pub async fn reconcile(self: &Arc<Self>) -> Result<()> {
        let names = self.driver.get_vms().await?;
        for name in names {
            let Some((image, id)) = VmHandle::parse_name(&name) else {
                tracing::warn!(vm = %name, "unparseable VM name; leaving it alone");
                continue;
            };
            let adopted = {
                let mut map = self.state.lock().await;
                match map.pools.get_mut(&image) {
                    Some(entry) if !entry.total.contains(&id) => {
                        entry.total.insert(id);
                        entry.next_id = entry.next_id.max(id + 1);
                        entry
                            .free
                            .push_back(VmHandle::new(id, image.clone(), entry.keep_alive));
                        Self::sync_gauges(&image, entry);
                        true
                    }
                    _ => false,
                }
            };
            if adopted {
                tracing::info!(vm = %name, "adopted leftover VM");
            } else {
                tracing::info!(vm = %name, "destroying leftover VM");
                let vm = VmHandle::new(id, image, false);
                if let Err(e) = self.driver.destroy_vm(&vm).await {
                    tracing::warn!(vm = %name, error = %e, "failed to destroy leftover VM");
                }
            }
        }
        Ok(())
    }

    /// Destroy every free VM. Assigned VMs are left to their workers.
    pub async fn shutdown(&self) {
        let vms: Vec<VmHandle> = {
            let mut map = self.state.lock().await;
            let mut drained = Vec::new();
            for (image, entry) in map.pools.iter_mut() {
                while let Some(vm) = entry.free.pop_front() {
                    entry.total.remove(&vm.id);
                    drained.push(vm);
                }
                Self::sync_gauges(image, entry);
            }
            drained
        };
        for vm in vms {
            if let Err(e) = self
                .driver
                .safe_destroy_vm(&vm, self.settings.safe_destroy_grace)
                .await
            {
                tracing::warn!(vm = %vm.name(), error = %e, "failed to destroy VM on shutdown");
            }
            metrics::VM_DESTROYS_TOTAL.inc();
        }
    }

    fn spawn_create(self: &Arc<Self>, image: String, id: u32, keep_alive: bool) {
        let pool = Arc::clone(self);
        tokio::spawn(async move {
            let vm = VmHandle::new(id, image.clone(), keep_alive);
            let started = Instant::now();
            let mut attempt = 0;
            let created = loop {
                attempt += 1;
                match pool.driver.initialize_vm(&vm).await {
                    Ok(()) => break true,
                    Err(e) if attempt < pool.settings.create_retries => {
                        tracing::warn!(vm = %vm.name(), attempt, error = %e, "VM create failed; retrying");
                        tokio::time::sleep(pool.settings.create_retry_delay).await;
                    }
                    Err(e) => {
                        tracing::error!(vm = %vm.name(), attempt, error = %e, "VM create abandoned");
                        break false;
                    }
                }
            };

            let mut excess = None;
            {
                let mut map = pool.state.lock().await;
                let Some(entry) = map.pools.get_mut(&image) else {
                    return;
                };
                entry.pending_creates = entry.pending_creates.saturating_sub(1);
                if created {
                    metrics::VM_CREATES_TOTAL.inc();
                    metrics::VM_CREATE_DURATION.observe(started.elapsed().as_secs_f64());
                    if entry.total.len() + entry.pending_creates < entry.target {
                        entry.total.insert(id);
                        entry.free.push_back(vm.clone());
                    } else {
                        // target shrank while this VM was booting
                        excess = Some(vm.clone());
                    }
                    Self::sync_gauges(&image, entry);
                }
            }
            if let Some(vm) = excess {
                pool.spawn_destroy(vm);
            }
        });
    }

    fn spawn_destroy(self: &Arc<Self>, vm: VmHandle) {
        let pool = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = pool.driver.destroy_vm(&vm).await {
                tracing::warn!(vm = %vm.name(), error = %e, "VM destroy failed");
            }
            metrics::VM_DESTROYS_TOTAL.inc();
        });
    }

    fn sync_gauges(image: &str, entry: &ImagePool) {
        metrics::POOL_FREE_VMS
            .with_label_values(&[image])
            .set(entry.free.len() as i64);
        metrics::POOL_TOTAL_VMS
            .with_label_values(&[image])
            .set(entry.total.len() as i64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vmms::fake::FakeDriver;

    fn settings() -> PoolSettings {
        PoolSettings {
            hard_cap: 8,
            create_retries: 2,
            create_retry_delay: Duration::from_millis(5),
            safe_destroy_grace: Duration::from_millis(100),
        }
    }

    fn fixture() -> (Arc<FakeDriver>, Arc<Preallocator>) {
        let driver = Arc::new(FakeDriver::new(vec!["alpine".to_string()]));
        let pool = Preallocator::new(driver.clone(), settings());
        (driver, pool)
    }

    /// Poll until the pool reaches the expected (free, total) counts.
    async fn settle(pool: &Arc<Preallocator>, image: &str, free: usize, total: usize) {
        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                if let Some(snapshot) = pool.get_pool(image).await {
                    if snapshot.free == free && snapshot.total == total {
                        return;
                    }
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("pool did not settle");
    }

    #[tokio::test]
    async fn update_grows_to_target() {
        let (driver, pool) = fixture();
        pool.define_image("alpine", true).await;
        pool.update("alpine", 3).await.expect("update");
        settle(&pool, "alpine", 3, 3).await;
        assert_eq!(driver.created_count(), 3);
    }

    #[tokio::test]
    async fn alloc_is_fifo_and_bottoms_out() {
        let (_driver, pool) = fixture();
        pool.define_image("alpine", true).await;
        pool.update("alpine", 2).await.expect("update");
        settle(&pool, "alpine", 2, 2).await;

        // atomic claim: the two callers get distinct VMs, then nothing
        let first = pool.alloc_vm("alpine").await.expect("first");
        let second = pool.alloc_vm("alpine").await.expect("second");
        assert_ne!(first.id, second.id);
        assert!(pool.alloc_vm("alpine").await.is_none());
        assert!(pool.alloc_vm("nonexistent").await.is_none());
    }

    #[tokio::test]
    async fn freed_vm_returns_to_the_tail() {
        let (_driver, pool) = fixture();
        pool.define_image("alpine", true).await;
        pool.update("alpine", 2).await.expect("update");
        settle(&pool, "alpine", 2, 2).await;

        let first = pool.alloc_vm("alpine").await.expect("alloc");
        let first_id = first.id;
        pool.free_vm(first).await;
        settle(&pool, "alpine", 2, 2).await;

        // FIFO rotation: the other VM comes out first now.
        let next = pool.alloc_vm("alpine").await.expect("alloc");
        assert_ne!(next.id, first_id);
    }

    #[tokio::test]
    async fn keep_alive_false_destroys_and_replaces() {
        let (driver, pool) = fixture();
        pool.define_image("alpine", true).await;
        pool.update("alpine", 1).await.expect("update");
        settle(&pool, "alpine", 1, 1).await;

        let mut vm = pool.alloc_vm("alpine").await.expect("alloc");
        let doomed = vm.name();
        vm.keep_alive = false;
        pool.free_vm(vm).await;

        settle(&pool, "alpine", 1, 1).await;
        assert!(driver.destroyed().contains(&doomed));
        assert_eq!(driver.created_count(), 2);
    }

    #[tokio::test]
    async fn update_down_destroys_free_vms() {
        let (driver, pool) = fixture();
        pool.define_image("alpine", true).await;
        pool.update("alpine", 3).await.expect("update");
        settle(&pool, "alpine", 3, 3).await;

        pool.update("alpine", 1).await.expect("shrink");
        settle(&pool, "alpine", 1, 1).await;
        assert_eq!(driver.destroyed_count(), 2);
    }

    #[tokio::test]
    async fn shrink_completes_as_assigned_vms_release() {
        let (_driver, pool) = fixture();
        pool.define_image("alpine", true).await;
        pool.update("alpine", 3).await.expect("update");
        settle(&pool, "alpine", 3, 3).await;

        // One VM out with a job while the pool shrinks under it.
        let vm = pool.alloc_vm("alpine").await.expect("alloc");
        pool.update("alpine", 1).await.expect("shrink");
        settle(&pool, "alpine", 0, 1).await;

        pool.free_vm(vm).await;
        settle(&pool, "alpine", 1, 1).await;
    }

    #[tokio::test]
    async fn hard_cap_bounds_total() {
        let (_driver, pool) = fixture();
        pool.define_image("alpine", true).await;
        pool.update("alpine", 100).await.expect("update");
        settle(&pool, "alpine", 8, 8).await;
        let snapshot = pool.get_pool("alpine").await.expect("snapshot");
        assert_eq!(snapshot.target, 8);
    }

    #[tokio::test]
    async fn abandoned_creates_leave_the_pool_short() {
        let (driver, pool) = fixture();
        driver.fail_create(100);
        pool.define_image("alpine", true).await;
        pool.update("alpine", 2).await.expect("update");

        // Every attempt fails; after the retry budget the pool stays short.
        tokio::time::sleep(Duration::from_millis(100)).await;
        let snapshot = pool.get_pool("alpine").await.expect("snapshot");
        assert_eq!(snapshot.total, 0);
        assert_eq!(snapshot.free, 0);
    }

    #[tokio::test]
    async fn replace_swaps_in_a_fresh_vm() {
        let (driver, pool) = fixture();
        pool.define_image("alpine", true).await;
        pool.update("alpine", 1).await.expect("update");
        settle(&pool, "alpine", 1, 1).await;

        let vm = pool.alloc_vm("alpine").await.expect("alloc");
        let old_name = vm.name();
        let fresh = pool.replace_vm(vm).await.expect("replace");
        assert_ne!(fresh.name(), old_name);

        settle(&pool, "alpine", 0, 1).await;
        assert!(driver.destroyed().contains(&old_name));

        pool.free_vm(fresh).await;
        settle(&pool, "alpine", 1, 1).await;
    }

    #[tokio::test]
    async fn reconcile_adopts_matching_and_destroys_the_rest() {
        let (driver, pool) = fixture();
        driver.seed_vm("alpine-7");
        driver.seed_vm("ghost-1");
        pool.define_image("alpine", true).await;

        pool.reconcile().await.expect("reconcile");
        let snapshot = pool.get_pool("alpine").await.expect("snapshot");
        assert_eq!(snapshot.free, 1);
        assert_eq!(snapshot.total, 1);
        assert!(driver.destroyed().contains(&"ghost-1".to_string()));

        // the adopted id is reserved for good
        pool.update("alpine", 2).await.expect("grow");
        settle(&pool, "alpine", 2, 2).await;
        let ids: Vec<String> = driver.created();
        assert!(ids.iter().all(|name| name != "alpine-7"));
    }

    #[tokio::test]
    async fn add_and_remove_are_administrative() {
        let (driver, pool) = fixture();
        pool.define_image("alpine", true).await;

        let vm = VmHandle::new(40, "alpine", true);
        driver.seed_vm("alpine-40");
        pool.add_vm(vm.clone()).await.expect("add");
        assert!(matches!(
            pool.add_vm(vm).await,
            Err(Error::Vm { .. })
        ));
        let snapshot = pool.get_pool("alpine").await.expect("snapshot");
        assert_eq!((snapshot.free, snapshot.total), (1, 1));

        pool.remove_vm("alpine", 40).await.expect("remove");
        settle(&pool, "alpine", 0, 0).await;
        assert!(driver.destroyed().contains(&"alpine-40".to_string()));
        assert!(pool.remove_vm("alpine", 40).await.is_err());
    }

    #[tokio::test]
    async fn shutdown_destroys_free_vms() {
        let (driver, pool) = fixture();
        pool.define_image("alpine", true).await;
        pool.update("alpine", 2).await.expect("update");
        settle(&pool, "alpine", 2, 2).await;

        pool.shutdown().await;
        let snapshot = pool.get_pool("alpine").await.expect("snapshot");
        assert_eq!(snapshot.free, 0);
        assert_eq!(snapshot.total, 0);
        assert_eq!(driver.destroyed_count(), 2);
    }
}
