//! The primary process: one distributor per binding, one handle per worker.
//!
//! Workers ask to join a binding with `queryServer`; the first request for
//! a key creates its [`ConnectionDistributor`] and every request registers
//! the worker with it. A worker that leaves (by `close`, by exiting, or by
//! losing its channel) is removed from every distributor, and a distributor
//! that loses its last worker is dropped along with its socket.
//!
//! Worker requests arrive through each channel's generic message handler,
//! which only queues them; [`Primary::process_inbox`] acts on the queue
//! once dispatch has returned.

use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::ffi::OsString;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::process::CommandExt;
use std::path::Path;
use std::process::{Command, Stdio};
use std::rc::Rc;

use tracing::{debug, info, warn};

use crate::balancer::distributor::{ConnectionDistributor, Phase};
use crate::balancer::worker_handle::{
    ChildProcess, Process, ProcessFault, WorkerEvents, WorkerHandle,
};
use crate::core::constants::{WORKER_CHANNEL_ENV, WORKER_CHANNEL_FD};
use crate::core::key::{BindSpec, Key, WorkerId};
use crate::core::socket::{BoundListener, SocketBinder};
use crate::error::{BindError, Result};
use crate::protocol::message::{AddReply, Envelope, Reply, Request};
use crate::protocol::rpc::RpcChannel;
use crate::protocol::unix_channel::UnixChannel;

pub type Distributor = ConnectionDistributor<BoundListener, UnixChannel, OwnedFd>;
pub type Worker<P> = WorkerHandle<P, UnixChannel, OwnedFd>;
type Rpc = Rc<RpcChannel<UnixChannel, OwnedFd>>;

enum Inbound {
    Message(WorkerId, Envelope),
    Fault(WorkerId, ProcessFault),
}

pub struct Primary<P> {
    workers: BTreeMap<WorkerId, Worker<P>>,
    distributors: HashMap<Key, Distributor>,
    inbox: Rc<RefCell<VecDeque<Inbound>>>,
}

impl<P: Process> Default for Primary<P> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P: Process> Primary<P> {
    pub fn new() -> Self {
        Self {
            workers: BTreeMap::new(),
            distributors: HashMap::new(),
            inbox: Rc::default(),
        }
    }

    /// Take ownership of a worker and the primary's end of its channel.
    pub fn add_worker(&mut self, id: WorkerId, process: P, channel: UnixChannel) -> Result<()> {
        assert!(!self.workers.contains_key(&id), "worker {id} added twice");
        channel.set_nonblocking(true)?;

        let inbox = self.inbox.clone();
        let rpc: Rpc = Rc::new(RpcChannel::new(
            channel,
            Box::new(move |message: Envelope, handle: Option<OwnedFd>| {
                if handle.is_some() {
                    debug!(worker = id, "dropping descriptor sent by worker");
                }
                inbox.borrow_mut().push_back(Inbound::Message(id, message));
            }),
        ));

        let dispatch = rpc.clone();
        let faults = self.inbox.clone();
        let events = WorkerEvents {
            on_message: Box::new(move |message: Envelope, handle: Option<OwnedFd>| {
                dispatch.dispatch(message, handle);
            }),
            on_error: Box::new(move |fault: ProcessFault| {
                faults.borrow_mut().push_back(Inbound::Fault(id, fault));
            }),
        };

        info!(worker = id, pid = process.pid(), "worker online");
        self.workers
            .insert(id, WorkerHandle::new(id, process, rpc, events));
        Ok(())
    }

    /// Feed one decoded message from `worker`'s channel.
    pub fn deliver(&self, worker: WorkerId, message: Envelope, handle: Option<OwnedFd>) {
        match self.workers.get(&worker) {
            Some(w) => w.relay_message(message, handle),
            None => debug!(worker, "message from unknown worker"),
        }
    }

    pub fn fault(&self, worker: WorkerId, fault: ProcessFault) {
        if let Some(w) = self.workers.get(&worker) {
            w.relay_error(fault);
        }
    }

    /// Act on everything workers have sent since the last call.
    pub fn process_inbox(&mut self) {
        loop {
            let next = self.inbox.borrow_mut().pop_front();
            match next {
                Some(Inbound::Message(worker, message)) => self.handle_request(worker, message),
                Some(Inbound::Fault(worker, fault)) => {
                    warn!(worker, ?fault, "worker fault");
                    let dead = self.workers.get(&worker).is_none_or(|w| w.is_dead());
                    if dead {
                        self.remove_worker(worker);
                    }
                }
                None => break,
            }
        }
        self.drop_disconnected();
    }

    /// Remove workers whose channel has been given up on, e.g. after a
    /// handoff could not be written to it.
    fn drop_disconnected(&mut self) {
        let lost: Vec<WorkerId> = self
            .workers
            .iter()
            .filter(|(_, w)| !w.rpc().is_connected())
            .map(|(id, _)| *id)
            .collect();
        for id in lost {
            info!(worker = id, "channel lost");
            self.remove_worker(id);
        }
    }

    fn handle_request(&mut self, worker: WorkerId, message: Envelope) {
        let Some(seq) = message.seq else {
            debug!(worker, "request without a sequence number");
            return;
        };
        match message.request() {
            Some(Request::QueryServer { spec }) => self.query_server(worker, seq, spec.clone()),
            Some(Request::Close { key }) => self.close(worker, seq, key.clone()),
            Some(Request::NewConn { .. }) | None => {
                debug!(worker, seq, "ignoring unexpected message");
            }
        }
    }

    /// Register `worker` with the distributor for `spec`, creating it on
    /// first use. The answer goes back as a reply to `seq`.
    pub fn query_server(&mut self, worker: WorkerId, seq: u64, spec: BindSpec) {
        let Some(rpc) = self.workers.get(&worker).map(|w| w.rpc().clone()) else {
            return;
        };
        let reply: Box<dyn FnOnce(AddReply)> = Box::new(move |outcome: AddReply| {
            if let Err(e) = rpc.respond(seq, Reply::from(outcome), None) {
                debug!(worker, error = %e, "could not answer queryServer");
            }
        });

        let key = match spec.key() {
            Ok(key) => key,
            Err(e) => {
                warn!(worker, error = %e, "rejecting bind request");
                reply(Err(BindError {
                    errno: libc::EINVAL,
                }));
                return;
            }
        };

        // A failed or torn-down binding gets a fresh attempt.
        if self
            .distributors
            .get(&key)
            .is_some_and(|d| matches!(d.phase(), Phase::Closed | Phase::Failed(_)))
        {
            self.distributors.remove(&key);
        }
        let distributor = self
            .distributors
            .entry(key.clone())
            .or_insert_with(|| ConnectionDistributor::new(key.clone(), spec, &SocketBinder))
            .clone();

        if distributor.is_registered(worker) {
            warn!(worker, %key, "worker already serving this key");
            reply(Err(BindError {
                errno: libc::EALREADY,
            }));
            return;
        }
        let rpc = self.workers[&worker].rpc().clone();
        distributor.add(worker, rpc, reply);
    }

    /// `worker` stops serving `key`.
    pub fn close(&mut self, worker: WorkerId, seq: u64, key: Key) {
        self.leave(worker, &key);
        if let Some(w) = self.workers.get(&worker)
            && let Err(e) = w.rpc().respond(seq, Reply::default(), None)
        {
            debug!(worker, error = %e, "could not answer close");
        }
    }

    fn leave(&mut self, worker: WorkerId, key: &Key) {
        let torn_down = self
            .distributors
            .get(key)
            .is_some_and(|d| d.remove(worker));
        if torn_down {
            info!(%key, "binding closed");
            self.distributors.remove(key);
        }
    }

    /// Drop `worker` from every distributor and forget it.
    pub fn remove_worker(&mut self, worker: WorkerId) {
        let keys: Vec<Key> = self
            .distributors
            .iter()
            .filter(|(_, d)| d.is_registered(worker))
            .map(|(k, _)| k.clone())
            .collect();
        for key in keys {
            self.leave(worker, &key);
        }
        if let Some(w) = self.workers.remove(&worker) {
            w.rpc().disconnect();
            info!(
                worker,
                code = ?w.process().exit_code(),
                signal = ?w.process().signal_code(),
                "worker gone"
            );
        }
    }

    /// Collect exit statuses and remove workers that have exited.
    pub fn reap(&mut self) {
        let mut dead = Vec::new();
        for (id, w) in self.workers.iter_mut() {
            if let Err(e) = w.process_mut().refresh() {
                warn!(worker = id, error = %e, "wait failed");
                dead.push(*id);
                continue;
            }
            if w.is_dead() {
                dead.push(*id);
            }
        }
        for id in dead {
            self.remove_worker(id);
        }
    }

    /// Ask every live worker to terminate.
    pub fn kill_all(&mut self, signal: i32) {
        for (id, w) in self.workers.iter_mut() {
            if let Err(e) = w.kill(signal) {
                let fault = ProcessFault {
                    code: e.raw_os_error(),
                    signal: Some(signal),
                };
                debug!(worker = id, error = %e, "kill failed");
                w.relay_error(fault);
            }
        }
    }

    pub fn worker(&self, id: WorkerId) -> Option<&Worker<P>> {
        self.workers.get(&id)
    }

    /// Channel descriptors of every live worker.
    pub fn worker_channels(&self) -> Vec<(WorkerId, RawFd)> {
        self.workers
            .iter()
            .map(|(id, w)| (*id, w.rpc().channel().as_raw_fd()))
            .collect()
    }

    pub fn distributor(&self, key: &Key) -> Option<&Distributor> {
        self.distributors.get(key)
    }

    /// Listening descriptors of every distributor that is accepting.
    pub fn listeners(&self) -> Vec<(Key, RawFd)> {
        self.distributors
            .iter()
            .filter_map(|(k, d)| d.with_listener(|l| (k.clone(), l.as_raw_fd())))
            .collect()
    }

    pub fn has_workers(&self) -> bool {
        !self.workers.is_empty()
    }
}

/// Start `exe` as worker `id`, handing it the child end of a fresh channel
/// on descriptor [`WORKER_CHANNEL_FD`].
pub fn spawn_worker(
    exe: &Path,
    args: &[OsString],
    id: WorkerId,
) -> io::Result<(ChildProcess, UnixChannel)> {
    let (ours, theirs) = UnixChannel::pair()?;
    let theirs: OwnedFd = theirs.into();
    let child_fd = theirs.as_raw_fd();

    let mut command = Command::new(exe);
    command
        .args(args)
        .arg("--worker-id")
        .arg(id.to_string())
        .env(WORKER_CHANNEL_ENV, WORKER_CHANNEL_FD.to_string())
        .stdin(Stdio::null());

    // SAFETY: only async-signal-safe calls between fork and exec.
    unsafe {
        command.pre_exec(move || {
            if child_fd == WORKER_CHANNEL_FD {
                // dup2 onto itself keeps close-on-exec; clear it by hand.
                if libc::fcntl(child_fd, libc::F_SETFD, 0) == -1 {
                    return Err(io::Error::last_os_error());
                }
            } else if libc::dup2(child_fd, WORKER_CHANNEL_FD) == -1 {
                return Err(io::Error::last_os_error());
            }
            Ok(())
        });
    }

    let child = command.spawn()?;
    drop(theirs);
    Ok((ChildProcess::new(child), ours))
}

/// The worker side of [`spawn_worker`]: adopt the inherited channel.
///
/// # Safety
///
/// `fd` must be an open `SOCK_SEQPACKET` socket this process owns.
pub unsafe fn inherited_channel(fd: RawFd) -> UnixChannel {
    // SAFETY: upheld by the caller.
    UnixChannel::from_socket(unsafe { socket2::Socket::from_raw_fd(fd) })
}
