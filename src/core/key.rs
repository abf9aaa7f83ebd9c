use std::fmt;
use std::os::fd::RawFd;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::core::constants::DEFAULT_BACKLOG;
use crate::error::{Error, Result};

/// Identity of a worker process within the primary. Assigned by whoever
/// spawns the worker; unique while the worker is registered.
pub type WorkerId = u32;

/// Identity of one shared listening binding.
///
/// Keys are opaque to the distributor; they only need to compare equal for
/// two requests that want the same socket.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Key(String);

impl Key {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Listen options a worker asks for.
///
/// Mirrors the recognized bind options one to one. Exactly one of `port`,
/// `fd` and `path` selects the kind of binding; see [`BindSpec::target`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BindSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fd: Option<RawFd>,
    #[serde(default)]
    pub ipv6_only: bool,
    #[serde(default = "default_backlog")]
    pub backlog: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
    #[serde(default)]
    pub readable_all: bool,
    #[serde(default)]
    pub writable_all: bool,
}

fn default_backlog() -> i32 {
    DEFAULT_BACKLOG
}

impl Default for BindSpec {
    fn default() -> Self {
        Self {
            port: None,
            address: None,
            fd: None,
            ipv6_only: false,
            backlog: DEFAULT_BACKLOG,
            path: None,
            readable_all: false,
            writable_all: false,
        }
    }
}

/// The validated form of a [`BindSpec`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BindTarget {
    Port {
        address: Option<String>,
        port: u16,
        ipv6_only: bool,
    },
    Fd(RawFd),
    Path {
        path: PathBuf,
        readable_all: bool,
        writable_all: bool,
    },
}

impl BindSpec {
    pub fn tcp(address: Option<&str>, port: u16) -> Self {
        Self {
            port: Some(port),
            address: address.map(str::to_owned),
            ..Self::default()
        }
    }

    pub fn unix(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
            ..Self::default()
        }
    }

    pub fn inherited(fd: RawFd) -> Self {
        Self {
            fd: Some(fd),
            ..Self::default()
        }
    }

    pub fn target(&self) -> Result<BindTarget> {
        match (self.port, self.fd, &self.path) {
            (Some(port), None, None) => Ok(BindTarget::Port {
                address: self.address.clone(),
                port,
                ipv6_only: self.ipv6_only,
            }),
            (None, Some(fd), None) if fd >= 0 => Ok(BindTarget::Fd(fd)),
            (None, Some(_), None) => Err(Error::InvalidBind("fd must be non-negative")),
            (None, None, Some(path)) => Ok(BindTarget::Path {
                path: path.clone(),
                readable_all: self.readable_all,
                writable_all: self.writable_all,
            }),
            (None, None, None) => Err(Error::InvalidBind("one of port, fd or path is required")),
            _ => Err(Error::InvalidBind("port, fd and path are mutually exclusive")),
        }
    }

    /// Derive the sharing key. Two specs that would produce the same socket
    /// produce the same key; backlog and permission bits do not take part.
    pub fn key(&self) -> Result<Key> {
        let raw = match self.target()? {
            BindTarget::Port {
                address,
                port,
                ipv6_only,
            } => {
                let family = if ipv6_only { "tcp6only" } else { "tcp" };
                format!("{}:{port}:{family}", address.as_deref().unwrap_or("*"))
            }
            BindTarget::Fd(fd) => format!("fd:{fd}"),
            BindTarget::Path { path, .. } => format!("pipe:{}", path.display()),
        };
        Ok(Key(raw))
    }
}
