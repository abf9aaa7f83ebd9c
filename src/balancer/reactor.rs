//! The primary's event loop.
//!
//! One io_uring drives everything the primary waits on: an `Accept` per
//! listening distributor, a one-shot `PollAdd` per worker channel, and a
//! periodic `Timeout` that reaps exited workers. Completions are turned into
//! calls on [`Primary`] and its distributors; nothing here holds state the
//! registry does not already know, beyond which SQEs are outstanding.

use std::collections::{HashMap, HashSet};
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

use io_uring::{IoUring, types};
use tracing::{debug, info, warn};

use crate::balancer::config::ReactorConfig;
use crate::balancer::primary::Primary;
use crate::balancer::uring_ops::{post_accept, post_poll, post_tick};
use crate::balancer::worker_handle::Process;
use crate::core::key::{Key, WorkerId};
use crate::core::user_data::{Operation, unpack_user_data};
use crate::error::Error;
use crate::util::fd::close_fd_quiet;

/// Outstanding accepts. A slot is live only while `by_key` points at it;
/// completions for any other slot belong to a listener that has since gone.
#[derive(Default)]
struct AcceptSlots {
    next: u64,
    by_slot: HashMap<u64, (Key, RawFd)>,
    by_key: HashMap<Key, u64>,
    /// Keys whose last accept failed; re-armed on the next tick.
    backoff: HashSet<Key>,
}

impl AcceptSlots {
    fn is_armed(&self, key: &Key, fd: RawFd) -> bool {
        self.by_key
            .get(key)
            .and_then(|slot| self.by_slot.get(slot))
            .is_some_and(|(_, armed)| *armed == fd)
    }

    /// Whether `key` needs a fresh accept on `fd`.
    fn wants(&self, key: &Key, fd: RawFd) -> bool {
        !self.is_armed(key, fd) && !self.backoff.contains(key)
    }

    /// Forget keys that no longer have a listener.
    fn retain_listeners(&mut self, listeners: &[(Key, RawFd)]) {
        self.by_key
            .retain(|key, _| listeners.iter().any(|(k, _)| k == key));
    }

    fn arm(&mut self, ring: &mut IoUring, key: Key, fd: RawFd) -> io::Result<()> {
        post_accept(ring, fd, self.next)?;
        self.track(key, fd);
        Ok(())
    }

    fn track(&mut self, key: Key, fd: RawFd) -> u64 {
        let slot = self.next;
        self.next += 1;
        self.by_key.insert(key.clone(), slot);
        self.by_slot.insert(slot, (key, fd));
        slot
    }

    /// Take a completed slot, returning its listener if it is still current.
    fn complete(&mut self, slot: u64) -> Option<(Key, RawFd)> {
        let (key, fd) = self.by_slot.remove(&slot)?;
        if self.by_key.get(&key) != Some(&slot) {
            return None;
        }
        self.by_key.remove(&key);
        Some((key, fd))
    }

    fn back_off(&mut self, key: Key) {
        self.backoff.insert(key);
    }

    fn on_tick(&mut self) {
        self.backoff.clear();
    }
}

struct Reactor {
    ring: IoUring,
    tick: types::Timespec,
    accepts: AcceptSlots,
    polled: HashSet<WorkerId>,
}

/// Run the primary until its last worker is gone.
pub fn run_primary<P: Process>(primary: &mut Primary<P>, config: &ReactorConfig) -> io::Result<()> {
    let interval = config.reap_interval;
    let mut reactor = Reactor {
        ring: IoUring::new(config.ring_size)?,
        tick: types::Timespec::new()
            .sec(interval.as_secs())
            .nsec(interval.subsec_nanos()),
        accepts: AcceptSlots::default(),
        polled: HashSet::new(),
    };
    post_tick(&mut reactor.ring, &reactor.tick)?;

    loop {
        primary.process_inbox();
        reactor.arm(primary)?;
        if !primary.has_workers() {
            info!("all workers gone");
            return Ok(());
        }

        match reactor.ring.submit_and_wait(1) {
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            other => other?,
        };

        let mut events = Vec::new();
        {
            let mut cq = reactor.ring.completion();
            while let Some(cqe) = cq.next() {
                events.push((cqe.user_data(), cqe.result()));
            }
        }

        for (tag, res) in events {
            match unpack_user_data(tag) {
                Some((slot, Operation::Accept)) => reactor.handle_accept(primary, slot, res),
                Some((worker, Operation::Readable)) => {
                    reactor.handle_readable(primary, worker as WorkerId, res)
                }
                Some((_, Operation::Tick)) => {
                    primary.reap();
                    reactor.accepts.on_tick();
                    post_tick(&mut reactor.ring, &reactor.tick)?;
                }
                None => debug!(tag, "completion with unknown tag"),
            }
        }
    }
}

impl Reactor {
    /// Post an accept for every new listener and a poll for every worker
    /// channel that has none outstanding.
    fn arm<P: Process>(&mut self, primary: &Primary<P>) -> io::Result<()> {
        let listeners = primary.listeners();
        self.accepts.retain_listeners(&listeners);
        for (key, fd) in listeners {
            if !self.accepts.wants(&key, fd) {
                continue;
            }
            debug!(%key, fd, "arming accept");
            self.accepts.arm(&mut self.ring, key, fd)?;
        }

        let channels = primary.worker_channels();
        self.polled.retain(|id| channels.iter().any(|(w, _)| w == id));
        for (worker, fd) in channels {
            if self.polled.insert(worker) {
                post_poll(&mut self.ring, fd, worker as u64)?;
            }
        }
        Ok(())
    }

    fn handle_accept<P: Process>(&mut self, primary: &Primary<P>, slot: u64, res: i32) {
        let current = self.accepts.complete(slot).filter(|(key, fd)| {
            primary
                .distributor(key)
                .and_then(|d| d.with_listener(|l| l.as_raw_fd()))
                == Some(*fd)
        });
        let Some((key, fd)) = current else {
            if res >= 0 {
                close_fd_quiet(res);
            }
            return;
        };
        let Some(distributor) = primary.distributor(&key) else {
            return;
        };

        if res < 0 {
            let err = io::Error::from_raw_os_error(-res);
            self.accepts.back_off(key);
            distributor.on_accept(Err(err));
            return;
        }

        // SAFETY: a successful accept completion hands us a fresh descriptor.
        let conn = unsafe { OwnedFd::from_raw_fd(res) };
        distributor.on_accept(Ok(conn));
        if let Err(e) = self.accepts.arm(&mut self.ring, key.clone(), fd) {
            warn!(%key, error = %e, "could not re-arm accept");
        }
    }

    fn handle_readable<P: Process>(&mut self, primary: &mut Primary<P>, worker: WorkerId, res: i32) {
        self.polled.remove(&worker);
        if res < 0 {
            debug!(worker, errno = -res, "channel poll failed");
            return;
        }
        loop {
            let received = match primary.worker(worker) {
                Some(w) => w.rpc().channel().recv(),
                None => return,
            };
            match received {
                Ok(Some((message, handle))) => primary.deliver(worker, message, handle),
                Ok(None) => {
                    info!(worker, "channel closed by worker");
                    primary.remove_worker(worker);
                    return;
                }
                Err(Error::Io(e)) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(Error::Codec(e)) => warn!(worker, error = %e, "dropping malformed message"),
                Err(e) => {
                    warn!(worker, error = %e, "channel failed");
                    primary.remove_worker(worker);
                    return;
                }
            }
        }
    }
}
