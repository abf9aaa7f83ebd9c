//! Round-robin sharing of listening sockets between worker processes.
//!
//! A primary process owns every listening socket. Workers ask it to listen
//! on their behalf; the primary accepts connections and hands each one to
//! an idle worker over a Unix channel, one outstanding handoff per worker.

pub mod balancer;
pub mod cli;
pub mod core;
pub mod error;
pub mod protocol;
pub mod util;

pub use error::{BindError, Error, Result};
