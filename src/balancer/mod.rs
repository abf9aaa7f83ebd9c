//! Connection distribution between a primary and its workers
//!
//! This module provides:
//! - The per-binding round-robin distributor
//! - The primary's worker and binding registry, and its io_uring reactor
//! - The worker-side loop that joins a pool and serves handed-off connections

pub mod config;
pub mod distributor;
pub mod primary;
pub mod reactor;
mod uring_ops;
pub mod worker;
pub mod worker_handle;

// Re-export main types
pub use config::{ReactorConfig, WorkerConfig};
pub use distributor::{ConnectionDistributor, Phase};
pub use primary::Primary;
pub use reactor::run_primary;
pub use worker::run_worker;
pub use worker_handle::{ChildProcess, Process, WorkerHandle};
