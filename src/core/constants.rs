/// Marks a message as belonging to the handoff protocol. Anything else on
/// the same channel is ignored by the RPC layer.
pub const PROTOCOL_TAG: &str = "cluster-rpc";

pub const DEFAULT_BACKLOG: i32 = 511;

/// Descriptor number a spawned worker finds its channel on.
pub const WORKER_CHANNEL_FD: i32 = 3;
pub const WORKER_CHANNEL_ENV: &str = "FANOUT_CHANNEL_FD";

/// One envelope per packet; JSON envelopes are far below this.
pub const MAX_MESSAGE_SIZE: usize = 64 * 1024;

pub const RING_SIZE: u32 = 256;
pub const REAP_INTERVAL_MS: u64 = 100;
pub const HEADER_BUFFER_CAPACITY: usize = 8 * 1024;
