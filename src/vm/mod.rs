//! Sandbox VM handles and the per-image preallocated pools.

pub mod pool;

pub use pool::{PoolSettings, PoolSnapshot, Preallocator};

/// Handle for one sandbox VM.
///
/// A handle is owned by exactly one of: the free pool for its image, the
/// worker of a running job, or an in-flight create/destroy task. Ownership
/// transfers happen under the pool lock; the driver only ever borrows it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmHandle {
    /// Unique within the image for the life of the process.
    pub id: u32,
    /// Image this VM was instantiated from.
    pub image: String,
    /// If false at release time, the VM is destroyed rather than pooled.
    pub keep_alive: bool,
}

impl VmHandle {
    pub fn new(id: u32, image: impl Into<String>, keep_alive: bool) -> Self {
        Self {
            id,
            image: image.into(),
            keep_alive,
        }
    }

    /// Driver-visible name, unique per driver instance.
    pub fn name(&self) -> String {
        format!("{}-{}", self.image, self.id)
    }

    /// Inverse of [`VmHandle::name`]: split a driver-side name back into
    /// (image, id). Image names may themselves contain dashes, so the id
    /// is taken from the last dash-separated segment.
    pub fn parse_name(name: &str) -> Option<(String, u32)> {
        let (image, id) = name.rsplit_once('-')?;
        if image.is_empty() {
            return None;
        }
        let id = id.parse().ok()?;
        Some((image.to_string(), id))
    }
}
