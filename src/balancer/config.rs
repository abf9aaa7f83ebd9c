use std::time::Duration;

use crate::core::constants;
use crate::core::key::{BindSpec, WorkerId};

/// Tunables for the primary's io_uring loop.
#[derive(Debug, Clone)]
pub struct ReactorConfig {
    /// Size of the io_uring submission/completion queue
    pub ring_size: u32,
    /// How often exited workers are reaped
    pub reap_interval: Duration,
}

impl Default for ReactorConfig {
    fn default() -> Self {
        Self {
            ring_size: constants::RING_SIZE,
            reap_interval: Duration::from_millis(constants::REAP_INTERVAL_MS),
        }
    }
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub id: WorkerId,
    /// What to ask the primary to listen on
    pub spec: BindSpec,
    /// Capacity for HTTP request head buffers
    pub header_buffer_capacity: usize,
    /// Leave the binding after serving this many connections
    pub max_connections: Option<u64>,
}

impl WorkerConfig {
    pub fn new(id: WorkerId, spec: BindSpec) -> Self {
        Self {
            id,
            spec,
            header_buffer_capacity: constants::HEADER_BUFFER_CAPACITY,
            max_connections: None,
        }
    }
}
