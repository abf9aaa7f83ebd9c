//! Wire formats: the worker channel envelope, its request/response layer,
//! and the bit of HTTP/1.1 the demo worker speaks.

pub mod http1;
pub mod message;
pub mod rpc;
pub mod unix_channel;

pub use message::{Envelope, Reply, Request};
pub use rpc::{Channel, PendingCall, RpcChannel};
pub use unix_channel::UnixChannel;
