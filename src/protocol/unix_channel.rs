//! Worker channel over a `SOCK_SEQPACKET` Unix socket pair.
//!
//! One packet carries one JSON [`Envelope`] and, optionally, one descriptor
//! in an `SCM_RIGHTS` control message. Packet boundaries are preserved by
//! the socket type, so no framing is needed.

use std::cell::Cell;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::{io, mem, ptr};

use socket2::{Domain, Socket, Type};
use tracing::debug;

use crate::core::constants::MAX_MESSAGE_SIZE;
use crate::error::Result;
use crate::protocol::message::Envelope;
use crate::protocol::rpc::Channel;

pub struct UnixChannel {
    socket: Socket,
    connected: Cell<bool>,
}

impl UnixChannel {
    /// Both ends of a fresh channel; close-on-exec is set on both.
    pub fn pair() -> io::Result<(Self, Self)> {
        let (a, b) = Socket::pair(Domain::UNIX, Type::SEQPACKET, None)?;
        Ok((Self::from_socket(a), Self::from_socket(b)))
    }

    pub fn from_socket(socket: Socket) -> Self {
        Self {
            socket,
            connected: Cell::new(true),
        }
    }

    pub fn set_nonblocking(&self, nonblocking: bool) -> io::Result<()> {
        self.socket.set_nonblocking(nonblocking)
    }

    /// Receive one message.
    ///
    /// `Ok(None)` means the peer is gone; the channel is then marked
    /// disconnected. On a non-blocking channel with nothing queued this
    /// returns an `io::ErrorKind::WouldBlock` error.
    pub fn recv(&self) -> Result<Option<(Envelope, Option<OwnedFd>)>> {
        let mut buf = vec![0u8; MAX_MESSAGE_SIZE];
        let (n, handle) = match recv_with_fd(self.socket.as_raw_fd(), &mut buf) {
            Ok(got) => got,
            Err(e) if e.raw_os_error() == Some(libc::ECONNRESET) => (0, None),
            Err(e) => return Err(e.into()),
        };
        if n == 0 {
            self.connected.set(false);
            return Ok(None);
        }
        // A descriptor attached to a frame we cannot read is dropped (and
        // closed) along with it.
        let envelope = Envelope::decode(&buf[..n])?;
        Ok(Some((envelope, handle)))
    }
}

impl AsRawFd for UnixChannel {
    fn as_raw_fd(&self) -> RawFd {
        self.socket.as_raw_fd()
    }
}

impl From<UnixChannel> for OwnedFd {
    fn from(channel: UnixChannel) -> Self {
        channel.socket.into()
    }
}

impl Channel<OwnedFd> for UnixChannel {
    fn connected(&self) -> bool {
        self.connected.get()
    }

    fn send(&self, message: &Envelope, handle: Option<&OwnedFd>) -> io::Result<()> {
        let bytes = message.encode().map_err(io::Error::other)?;
        let fd = handle.map(AsRawFd::as_raw_fd);
        match send_with_fd(self.socket.as_raw_fd(), &bytes, fd) {
            Err(e) if matches!(e.raw_os_error(), Some(libc::EPIPE | libc::ECONNRESET)) => {
                debug!(error = %e, "peer closed channel");
                self.connected.set(false);
                Err(e)
            }
            other => other,
        }
    }

    fn disconnect(&self) {
        if self.connected.replace(false) {
            let _ = self.socket.shutdown(std::net::Shutdown::Both);
        }
    }
}

fn cmsg_space() -> usize {
    unsafe { libc::CMSG_SPACE(mem::size_of::<RawFd>() as u32) as usize }
}

/// `sendmsg` one packet with an optional `SCM_RIGHTS` descriptor.
pub fn send_with_fd(sock: RawFd, bytes: &[u8], fd: Option<RawFd>) -> io::Result<()> {
    let mut iov = libc::iovec {
        iov_base: bytes.as_ptr() as *mut libc::c_void,
        iov_len: bytes.len(),
    };
    // u64 backing keeps the control buffer aligned for cmsghdr.
    let mut control = vec![0u64; cmsg_space().div_ceil(mem::size_of::<u64>())];

    let mut msg: libc::msghdr = unsafe { mem::zeroed() };
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;

    if let Some(fd) = fd {
        msg.msg_control = control.as_mut_ptr() as *mut libc::c_void;
        msg.msg_controllen = cmsg_space() as _;
        unsafe {
            let cmsg = libc::CMSG_FIRSTHDR(&msg);
            (*cmsg).cmsg_level = libc::SOL_SOCKET;
            (*cmsg).cmsg_type = libc::SCM_RIGHTS;
            (*cmsg).cmsg_len = libc::CMSG_LEN(mem::size_of::<RawFd>() as u32) as _;
            ptr::write_unaligned(libc::CMSG_DATA(cmsg) as *mut RawFd, fd);
        }
    }

    let n = unsafe { libc::sendmsg(sock, &msg, libc::MSG_NOSIGNAL) };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }
    if n as usize != bytes.len() {
        return Err(io::Error::new(io::ErrorKind::WriteZero, "short packet write"));
    }
    Ok(())
}

/// `recvmsg` one packet. Received descriptors are close-on-exec; if a peer
/// sends more than one, the extras are closed.
pub fn recv_with_fd(sock: RawFd, buf: &mut [u8]) -> io::Result<(usize, Option<OwnedFd>)> {
    let mut iov = libc::iovec {
        iov_base: buf.as_mut_ptr() as *mut libc::c_void,
        iov_len: buf.len(),
    };
    let mut control = vec![0u64; (cmsg_space() * 4).div_ceil(mem::size_of::<u64>())];

    let mut msg: libc::msghdr = unsafe { mem::zeroed() };
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = control.as_mut_ptr() as *mut libc::c_void;
    msg.msg_controllen = (control.len() * mem::size_of::<u64>()) as _;

    let n = unsafe { libc::recvmsg(sock, &mut msg, libc::MSG_CMSG_CLOEXEC) };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }

    let mut handle = None;
    unsafe {
        let mut cmsg = libc::CMSG_FIRSTHDR(&msg);
        while !cmsg.is_null() {
            if (*cmsg).cmsg_level == libc::SOL_SOCKET && (*cmsg).cmsg_type == libc::SCM_RIGHTS {
                let data = libc::CMSG_DATA(cmsg) as *const RawFd;
                let header = libc::CMSG_LEN(0) as usize;
                let count = ((*cmsg).cmsg_len as usize - header) / mem::size_of::<RawFd>();
                for i in 0..count {
                    let fd = OwnedFd::from_raw_fd(ptr::read_unaligned(data.add(i)));
                    if handle.is_none() {
                        handle = Some(fd);
                    }
                }
            }
            cmsg = libc::CMSG_NXTHDR(&msg, cmsg);
        }
    }

    if msg.msg_flags & libc::MSG_TRUNC != 0 {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "packet truncated"));
    }
    Ok((n as usize, handle))
}
