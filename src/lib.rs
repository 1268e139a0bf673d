//! makevisor - a job-execution broker over pooled sandboxes.
//!
//! Build-and-run jobs arrive over HTTP, get paired with a warm execution
//! environment drawn from a per-image pool, run `make` under a time
//! budget, and their captured output is returned to the requester.

pub mod config;
pub mod error;
pub mod job;
pub mod logging;
pub mod metrics;
pub mod output;
pub mod server;
pub mod storage;
pub mod vm;
pub mod vmms;
