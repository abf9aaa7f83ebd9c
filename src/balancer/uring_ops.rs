use std::os::fd::RawFd;
use std::{io, ptr};

use io_uring::{IoUring, opcode, squeue, types};

use crate::core::user_data::{Operation, pack_user_data};

/// io_uring SQE submission helpers for the primary reactor.
///
/// Each helper tags its SQE with the slot and operation it belongs to. A full
/// submission queue is flushed once before giving up.
fn push(ring: &mut IoUring, sqe: &squeue::Entry) -> io::Result<()> {
    // SAFETY: every buffer an SQE points at outlives its completion.
    if unsafe { ring.submission().push(sqe) }.is_ok() {
        return Ok(());
    }
    ring.submit()?;
    unsafe { ring.submission().push(sqe) }
        .map_err(|_| io::Error::other("io_uring submission queue full"))
}

/// Accept one connection on `listen_fd`. The accepted descriptor is
/// close-on-exec so it never leaks into spawned workers.
pub fn post_accept(ring: &mut IoUring, listen_fd: RawFd, slot: u64) -> io::Result<()> {
    let sqe = opcode::Accept::new(types::Fd(listen_fd), ptr::null_mut(), ptr::null_mut())
        .flags(libc::SOCK_CLOEXEC)
        .build()
        .user_data(pack_user_data(slot, Operation::Accept));
    push(ring, &sqe)
}

/// One-shot readiness poll on a worker channel.
pub fn post_poll(ring: &mut IoUring, fd: RawFd, worker: u64) -> io::Result<()> {
    let sqe = opcode::PollAdd::new(types::Fd(fd), libc::POLLIN as u32)
        .build()
        .user_data(pack_user_data(worker, Operation::Readable));
    push(ring, &sqe)
}

/// Wake the reactor after `ts` even when nothing else completes.
pub fn post_tick(ring: &mut IoUring, ts: &types::Timespec) -> io::Result<()> {
    let sqe = opcode::Timeout::new(ts)
        .build()
        .user_data(pack_user_data(0, Operation::Tick));
    push(ring, &sqe)
}
