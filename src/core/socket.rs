use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::fs;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, Shutdown, SocketAddr, ToSocketAddrs};
use std::os::fd::{AsRawFd, FromRawFd, RawFd};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::core::key::{BindSpec, BindTarget};
use crate::error::{BindError, Error, Result};

/// Socket utility functions for the primary
///
/// This module owns the shared listening sockets:
/// - TCP listeners for address/port bindings
/// - adoption of inherited listening descriptors
/// - Unix-domain listeners for path bindings

/// A bound, listening socket as the distributor sees it.
pub trait Listener {
    /// Bound IP address, `None` for path bindings.
    fn local_addr(&self) -> Option<SocketAddr>;

    fn close(self);
}

/// Completion callback for [`Binder::listen`].
pub type BindDone<L> = Box<dyn FnOnce(std::result::Result<L, BindError>)>;

/// Starts a listen and reports the outcome exactly once.
pub trait Binder<L> {
    fn listen(&self, spec: &BindSpec, done: BindDone<L>);
}

/// Binds with real sockets. Completes before returning.
#[derive(Debug, Default, Clone, Copy)]
pub struct SocketBinder;

impl Binder<BoundListener> for SocketBinder {
    fn listen(&self, spec: &BindSpec, done: BindDone<BoundListener>) {
        let result = bind(spec).map_err(|e| {
            warn!(error = %e, "listen failed");
            match e {
                Error::Io(io) => BindError::from_io(&io),
                _ => BindError {
                    errno: libc::EINVAL,
                },
            }
        });
        done(result);
    }
}

#[derive(Debug)]
pub struct BoundListener {
    socket: Socket,
    path: Option<PathBuf>,
}

impl BoundListener {
    fn new(socket: Socket, path: Option<PathBuf>) -> Self {
        Self { socket, path }
    }
}

impl AsRawFd for BoundListener {
    fn as_raw_fd(&self) -> RawFd {
        self.socket.as_raw_fd()
    }
}

impl Listener for BoundListener {
    fn local_addr(&self) -> Option<SocketAddr> {
        self.socket.local_addr().ok().and_then(|a| a.as_socket())
    }

    fn close(self) {
        // Wakes any accept still queued against this socket.
        let _ = self.socket.shutdown(Shutdown::Read);
        if let Some(path) = &self.path
            && let Err(e) = fs::remove_file(path)
        {
            debug!(path = %path.display(), error = %e, "unlink failed");
        }
    }
}

/// Create the listening socket described by `spec`.
pub fn bind(spec: &BindSpec) -> Result<BoundListener> {
    let listener = match spec.target()? {
        BindTarget::Port {
            address,
            port,
            ipv6_only,
        } => bind_tcp(address.as_deref(), port, ipv6_only, spec.backlog)?,
        BindTarget::Fd(fd) => adopt(fd, spec.backlog)?,
        BindTarget::Path {
            path,
            readable_all,
            writable_all,
        } => bind_path(&path, readable_all, writable_all, spec.backlog)?,
    };
    Ok(listener)
}

fn bind_tcp(
    address: Option<&str>,
    port: u16,
    ipv6_only: bool,
    backlog: i32,
) -> io::Result<BoundListener> {
    let Some(host) = address else {
        // No address: dual-stack wildcard, falling back to IPv4 on hosts
        // without IPv6.
        let any6 = SocketAddr::from((Ipv6Addr::UNSPECIFIED, port));
        return match listen_tcp(any6, ipv6_only, backlog) {
            Err(e) if !ipv6_only && e.raw_os_error() == Some(libc::EAFNOSUPPORT) => {
                listen_tcp(SocketAddr::from((Ipv4Addr::UNSPECIFIED, port)), false, backlog)
            }
            other => other,
        };
    };
    listen_tcp(resolve(host, port)?, ipv6_only, backlog)
}

fn resolve(host: &str, port: u16) -> io::Result<SocketAddr> {
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(SocketAddr::new(ip, port));
    }
    (host, port).to_socket_addrs()?.next().ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::AddrNotAvailable,
            format!("{host} did not resolve"),
        )
    })
}

fn listen_tcp(addr: SocketAddr, ipv6_only: bool, backlog: i32) -> io::Result<BoundListener> {
    let sock = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    sock.set_reuse_address(true)?;
    if addr.is_ipv6() {
        sock.set_only_v6(ipv6_only)?;
    }
    sock.bind(&addr.into())?;
    sock.listen(backlog)?;
    Ok(BoundListener::new(sock, None))
}

fn adopt(fd: RawFd, backlog: i32) -> io::Result<BoundListener> {
    // SAFETY: the caller handed this descriptor over for us to own.
    let sock = unsafe { Socket::from_raw_fd(fd) };
    sock.listen(backlog)?;
    Ok(BoundListener::new(sock, None))
}

fn bind_path(
    path: &Path,
    readable_all: bool,
    writable_all: bool,
    backlog: i32,
) -> io::Result<BoundListener> {
    let sock = Socket::new(Domain::UNIX, Type::STREAM, None)?;
    sock.bind(&SockAddr::unix(path)?)?;
    sock.listen(backlog)?;

    let mut extra = 0;
    if readable_all {
        extra |= 0o444;
    }
    if writable_all {
        extra |= 0o222;
    }
    if extra != 0 {
        let mut perms = fs::metadata(path)?.permissions();
        perms.set_mode(perms.mode() | extra);
        fs::set_permissions(path, perms)?;
    }
    Ok(BoundListener::new(sock, Some(path.to_path_buf())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn tcp_bind_reports_sockname() {
        let listener = bind(&BindSpec::tcp(Some("127.0.0.1"), 0)).unwrap();
        let addr = listener.local_addr().unwrap();
        assert!(addr.ip().is_loopback());
        assert_ne!(addr.port(), 0);
        std::net::TcpStream::connect(addr).unwrap();
        listener.close();
    }

    #[test]
    fn path_bind_sets_mode_and_unlinks_on_close() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.sock");
        let spec = BindSpec {
            readable_all: true,
            writable_all: true,
            ..BindSpec::unix(&path)
        };
        let listener = bind(&spec).unwrap();
        assert!(listener.local_addr().is_none());

        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o666, 0o666);

        listener.close();
        assert!(!path.exists());
    }

    #[test]
    fn binder_reports_errno() {
        let taken = bind(&BindSpec::tcp(Some("127.0.0.1"), 0)).unwrap();
        let port = taken.local_addr().unwrap().port();

        let seen = Rc::new(RefCell::new(None));
        let sink = seen.clone();
        SocketBinder.listen(
            &BindSpec::tcp(Some("127.0.0.1"), port),
            Box::new(move |r| *sink.borrow_mut() = Some(r.map(|_| ()))),
        );
        let result = seen.borrow_mut().take().unwrap();
        assert_eq!(result, Err(BindError { errno: libc::EADDRINUSE }));
    }
}
