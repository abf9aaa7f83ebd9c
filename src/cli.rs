use std::os::fd::RawFd;
use std::path::PathBuf;

use clap::Parser;

use crate::core::constants::DEFAULT_BACKLOG;
use crate::core::key::{BindSpec, WorkerId};

/// Command-line configuration for the `fanout` binary.
///
/// The same arguments are handed to every worker, which derive their bind
/// request from them. Every option can also come from a `FANOUT_*`
/// environment variable.
#[derive(Parser, Debug, Clone)]
#[command(
    name = "fanout",
    version,
    about = "Share one listening socket between worker processes, round-robin"
)]
pub struct CliArgs {
    /// TCP port to listen on.
    ///
    /// Environment variable: `FANOUT_PORT`
    #[arg(long, env = "FANOUT_PORT", conflicts_with_all = ["path", "fd"])]
    pub port: Option<u16>,

    /// Address to bind; all interfaces when omitted.
    ///
    /// Environment variable: `FANOUT_ADDRESS`
    #[arg(long, env = "FANOUT_ADDRESS", requires = "port")]
    pub address: Option<String>,

    /// Unix socket path to listen on.
    ///
    /// Environment variable: `FANOUT_PATH`
    #[arg(long, env = "FANOUT_PATH", conflicts_with = "fd")]
    pub path: Option<PathBuf>,

    /// Listen on a descriptor inherited by the primary.
    ///
    /// Environment variable: `FANOUT_FD`
    #[arg(long, env = "FANOUT_FD")]
    pub fd: Option<RawFd>,

    /// Accept IPv6 connections only.
    #[arg(long, env = "FANOUT_IPV6_ONLY")]
    pub ipv6_only: bool,

    /// Listen backlog.
    #[arg(long, env = "FANOUT_BACKLOG", default_value_t = DEFAULT_BACKLOG)]
    pub backlog: i32,

    /// Make the Unix socket readable by all users.
    #[arg(long, env = "FANOUT_READABLE_ALL")]
    pub readable_all: bool,

    /// Make the Unix socket writable by all users.
    #[arg(long, env = "FANOUT_WRITABLE_ALL")]
    pub writable_all: bool,

    /// Number of worker processes; defaults to the available parallelism.
    ///
    /// Environment variable: `FANOUT_WORKERS`
    #[arg(long, env = "FANOUT_WORKERS")]
    pub workers: Option<usize>,

    /// Pin each worker to its own core.
    #[arg(long, env = "FANOUT_PIN")]
    pub pin: bool,

    /// Each worker leaves the pool after serving this many connections.
    #[arg(long, env = "FANOUT_MAX_CONNECTIONS")]
    pub max_connections: Option<u64>,

    /// Run as the worker with this id. Set by the primary.
    #[arg(long, hide = true)]
    pub worker_id: Option<WorkerId>,
}

impl CliArgs {
    /// The listen request every worker sends.
    pub fn bind_spec(&self) -> BindSpec {
        let base = match (self.port, &self.path, self.fd) {
            (_, Some(path), _) => BindSpec::unix(path.clone()),
            (_, None, Some(fd)) => BindSpec::inherited(fd),
            (port, None, None) => BindSpec::tcp(self.address.as_deref(), port.unwrap_or(0)),
        };
        BindSpec {
            ipv6_only: self.ipv6_only,
            backlog: self.backlog,
            readable_all: self.readable_all,
            writable_all: self.writable_all,
            ..base
        }
    }
}
