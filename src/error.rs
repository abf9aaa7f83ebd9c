use std::io;

use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum Error {
    /// The peer end of a worker channel is gone; nothing was sent.
    #[error("channel is not connected")]
    ChannelClosed,

    #[error("invalid bind configuration: {0}")]
    InvalidBind(&'static str),

    #[error(transparent)]
    Bind(#[from] BindError),

    #[error("malformed message: {0}")]
    Codec(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// A listen failure, kept as a bare errno so it can be handed to every
/// worker that asked for the same binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BindError {
    pub errno: i32,
}

impl BindError {
    pub fn from_io(err: &io::Error) -> Self {
        Self {
            errno: err.raw_os_error().unwrap_or(libc::EINVAL),
        }
    }
}

impl std::fmt::Display for BindError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "bind failed: {}", io::Error::from_raw_os_error(self.errno))
    }
}

impl std::error::Error for BindError {}
