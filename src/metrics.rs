//! Prometheus metrics for the broker.
//!
//! Gauges mirror the pool and queue accounting; counters track job and VM
//! churn. Everything registers against the default registry and is served
//! by the facade's `/metrics` endpoint.

use lazy_static::lazy_static;
use prometheus::{
    register_histogram, register_int_counter, register_int_counter_vec, register_int_gauge,
    register_int_gauge_vec, Encoder, Histogram, IntCounter, IntCounterVec, IntGauge, IntGaugeVec,
    TextEncoder,
};

lazy_static! {
    /// Warm VMs per image (the free list).
    pub static ref POOL_FREE_VMS: IntGaugeVec = register_int_gauge_vec!(
        "makevisor_pool_free_vms",
        "Free VMs per image",
        &["image"]
    )
    .expect("register makevisor_pool_free_vms");

    /// All VMs per image, free and assigned.
    pub static ref POOL_TOTAL_VMS: IntGaugeVec = register_int_gauge_vec!(
        "makevisor_pool_total_vms",
        "Total VMs per image",
        &["image"]
    )
    .expect("register makevisor_pool_total_vms");

    pub static ref JOBS_LIVE: IntGauge = register_int_gauge!(
        "makevisor_jobs_live",
        "Jobs currently live (pending or running)"
    )
    .expect("register makevisor_jobs_live");

    pub static ref JOBS_PENDING: IntGauge = register_int_gauge!(
        "makevisor_jobs_pending",
        "Live jobs waiting for a VM"
    )
    .expect("register makevisor_jobs_pending");

    pub static ref JOBS_SUBMITTED_TOTAL: IntCounter = register_int_counter!(
        "makevisor_jobs_submitted_total",
        "Jobs accepted into the queue"
    )
    .expect("register makevisor_jobs_submitted_total");

    pub static ref JOBS_COMPLETED_TOTAL: IntCounterVec = register_int_counter_vec!(
        "makevisor_jobs_completed_total",
        "Jobs moved to the dead ring, by final status",
        &["status"]
    )
    .expect("register makevisor_jobs_completed_total");

    pub static ref VM_CREATES_TOTAL: IntCounter = register_int_counter!(
        "makevisor_vm_creates_total",
        "VMs created by the preallocator"
    )
    .expect("register makevisor_vm_creates_total");

    pub static ref VM_DESTROYS_TOTAL: IntCounter = register_int_counter!(
        "makevisor_vm_destroys_total",
        "VMs destroyed"
    )
    .expect("register makevisor_vm_destroys_total");

    pub static ref VM_CREATE_DURATION: Histogram = register_histogram!(
        "makevisor_vm_create_duration_seconds",
        "Time to create one VM"
    )
    .expect("register makevisor_vm_create_duration_seconds");

    pub static ref JOB_RUN_DURATION: Histogram = register_histogram!(
        "makevisor_job_run_duration_seconds",
        "Wall-clock duration of the run stage"
    )
    .expect("register makevisor_job_run_duration_seconds");
}

/// Render every registered metric in the Prometheus text format.
pub fn encode_metrics() -> String {
    let encoder = TextEncoder::new();
    let families = prometheus::gather();
    let mut out = Vec::new();
    if let Err(e) = encoder.encode(&families, &mut out) {
        tracing::warn!(error = %e, "failed to encode metrics");
        return String::new();
    }
    String::from_utf8_lossy(&out).into_owned()
}
