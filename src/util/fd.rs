use std::io;
use std::os::fd::{IntoRawFd, OwnedFd, RawFd};

use tracing::warn;

/// An accepted connection as the distributor sees it: something that can
/// be queued, offered, and closed exactly once.
pub trait ConnHandle {
    fn close(self);
}

impl ConnHandle for OwnedFd {
    fn close(self) {
        close_fd_quiet(self.into_raw_fd());
    }
}

pub fn close_fd_quiet(fd: RawFd) {
    // After this call, consider fd dead in all code paths.
    let ret = unsafe { libc::close(fd) };
    if ret != 0 {
        let err = io::Error::last_os_error();
        match err.raw_os_error() {
            Some(libc::EBADF) => {
                warn!(fd, "close -> EBADF (double close / invalid fd)");
            }
            Some(libc::EINTR) => {
                warn!(fd, "close interrupted by signal (EINTR); not retrying");
            }
            _ => {
                warn!(fd, error = %err, "close failed");
            }
        }
    }
}
