//! Connection distribution for one shared listening socket.
//!
//! A [`ConnectionDistributor`] owns the listener for one [`Key`], the set of
//! workers registered for it, the subset of those that are idle, and the
//! queue of accepted connections nobody has taken yet. Every mutation ends
//! in a pump pass, which pairs queued connections with
//! idle workers until one side runs dry.
//!
//! A pairing is a handoff: the connection goes to the worker in a `newconn`
//! request and the worker answers `accepted: true` (it owns the connection
//! now, we close our copy) or `accepted: false` (the connection goes back to
//! the head of the queue). Either way the worker is then due another
//! handoff, or goes back to the idle set if the queue is empty.
//!
//! State sits behind `Rc<RefCell<..>>` and is only touched from the thread
//! running the event loop. No borrow is held while a worker channel is
//! written or a reply callback runs.

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::io;
use std::net::SocketAddr;
use std::rc::{Rc, Weak};

use tracing::{debug, info, warn};

use crate::core::key::{BindSpec, Key, WorkerId};
use crate::core::socket::{Binder, Listener};
use crate::error::BindError;
use crate::protocol::message::{AddReply, Envelope, Request};
use crate::protocol::rpc::{Channel, RpcChannel};
use crate::util::fd::ConnHandle;

pub type ReplyFn = Box<dyn FnOnce(AddReply)>;

/// Lifecycle of the shared listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Binding,
    Listening,
    /// The listen failed; every `add` is answered with this error.
    Failed(BindError),
    Closed,
}

enum Listen<L> {
    Binding,
    Listening(L),
    Failed(BindError),
    Closed,
}

/// A handle offered to a worker and not yet answered.
struct InFlight<H> {
    seq: u64,
    handle: H,
}

struct State<L, C, H> {
    key: Key,
    listen: Listen<L>,
    all: HashMap<WorkerId, Rc<RpcChannel<C, H>>>,
    /// `add` calls made while binding, answered in order once it settles.
    waiting: Vec<(WorkerId, ReplyFn)>,
    /// Least recently freed first.
    free: VecDeque<WorkerId>,
    handles: VecDeque<H>,
    in_flight: HashMap<WorkerId, InFlight<H>>,
    /// Workers that just registered or just resolved a handoff.
    due: VecDeque<WorkerId>,
    /// Answers that arrived while their handoff was still being sent.
    early: HashMap<WorkerId, bool>,
}

enum Step<C, H> {
    Offer {
        worker: WorkerId,
        rpc: Rc<RpcChannel<C, H>>,
        handle: H,
    },
    Done,
}

impl<L, C: Channel<H>, H> State<L, C, H> {
    fn is_closed(&self) -> bool {
        matches!(self.listen, Listen::Closed)
    }

    fn local_addr(&self) -> Option<SocketAddr>
    where
        L: Listener,
    {
        match &self.listen {
            Listen::Listening(l) => l.local_addr(),
            _ => None,
        }
    }

    /// Pick the next pairing, or settle idle workers into the free set.
    fn next_step(&mut self) -> Step<C, H> {
        loop {
            if !self.handles.is_empty()
                && let Some(worker) = self.free.pop_front()
            {
                if let Some(step) = self.take_for(worker) {
                    return step;
                }
                continue;
            }

            let Some(worker) = self.due.pop_front() else {
                return Step::Done;
            };
            if !self.all.contains_key(&worker) || self.in_flight.contains_key(&worker) {
                continue;
            }
            if self.handles.is_empty() {
                if !self.free.contains(&worker) {
                    self.free.push_back(worker);
                }
                continue;
            }
            self.free.retain(|w| *w != worker);
            if let Some(step) = self.take_for(worker) {
                return step;
            }
        }
    }

    fn take_for(&mut self, worker: WorkerId) -> Option<Step<C, H>> {
        // A lost channel stays registered until its owner removes the worker.
        let rpc = self.all.get(&worker).filter(|rpc| rpc.is_connected())?.clone();
        let handle = self.handles.pop_front()?;
        Some(Step::Offer {
            worker,
            rpc,
            handle,
        })
    }

    /// Settle an answered handoff. Returns the handle when it is ours to
    /// close.
    fn finish(&mut self, worker: WorkerId, seq: u64, handle: H, accepted: bool) -> Option<H> {
        debug!(worker, seq, accepted, "handoff resolved");
        self.due.push_back(worker);
        if accepted || self.is_closed() {
            Some(handle)
        } else {
            self.handles.push_front(handle);
            None
        }
    }
}

pub struct ConnectionDistributor<L, C, H> {
    state: Rc<RefCell<State<L, C, H>>>,
    spec: BindSpec,
}

impl<L, C, H> Clone for ConnectionDistributor<L, C, H> {
    fn clone(&self) -> Self {
        Self {
            state: self.state.clone(),
            spec: self.spec.clone(),
        }
    }
}

impl<L, C, H> ConnectionDistributor<L, C, H>
where
    L: Listener + 'static,
    C: Channel<H> + 'static,
    H: ConnHandle + 'static,
{
    /// Start listening for `key`. The distributor is `Binding` until the
    /// binder reports back, which may happen before this returns.
    pub fn new(key: Key, spec: BindSpec, binder: &impl Binder<L>) -> Self {
        let state = Rc::new(RefCell::new(State {
            key,
            listen: Listen::Binding,
            all: HashMap::new(),
            waiting: Vec::new(),
            free: VecDeque::new(),
            handles: VecDeque::new(),
            in_flight: HashMap::new(),
            due: VecDeque::new(),
            early: HashMap::new(),
        }));

        let weak = Rc::downgrade(&state);
        binder.listen(
            &spec,
            Box::new(move |result: Result<L, BindError>| {
                if let Some(state) = weak.upgrade() {
                    Self::settle(&state, result);
                }
            }),
        );

        Self { state, spec }
    }

    pub fn key(&self) -> Key {
        self.state.borrow().key.clone()
    }

    pub fn spec(&self) -> &BindSpec {
        &self.spec
    }

    pub fn phase(&self) -> Phase {
        match &self.state.borrow().listen {
            Listen::Binding => Phase::Binding,
            Listen::Listening(_) => Phase::Listening,
            Listen::Failed(e) => Phase::Failed(*e),
            Listen::Closed => Phase::Closed,
        }
    }

    /// Run `f` against the listener while it is open.
    pub fn with_listener<R>(&self, f: impl FnOnce(&L) -> R) -> Option<R> {
        match &self.state.borrow().listen {
            Listen::Listening(l) => Some(f(l)),
            _ => None,
        }
    }

    fn settle(state: &Rc<RefCell<State<L, C, H>>>, result: Result<L, BindError>) {
        let (waiting, reply) = {
            let mut st = state.borrow_mut();
            match result {
                Ok(listener) if st.is_closed() => {
                    // Every worker left while we were binding.
                    listener.close();
                    return;
                }
                Ok(listener) => {
                    st.listen = Listen::Listening(listener);
                    info!(key = %st.key, addr = ?st.local_addr(), "listening");
                    (std::mem::take(&mut st.waiting), Ok(st.local_addr()))
                }
                Err(e) => {
                    warn!(key = %st.key, errno = e.errno, "bind failed");
                    if !st.is_closed() {
                        st.listen = Listen::Failed(e);
                    }
                    (std::mem::take(&mut st.waiting), Err(e))
                }
            }
        };

        for (worker, reply_fn) in waiting {
            reply_fn(reply);
            if reply.is_ok() {
                state.borrow_mut().due.push_back(worker);
            }
        }
        Self::pump(state);
    }

    /// Register `worker`, answering `reply` with the bound address once the
    /// listener is up (or with the bind error).
    ///
    /// # Panics
    ///
    /// If `worker` is already registered.
    pub fn add(&self, worker: WorkerId, rpc: Rc<RpcChannel<C, H>>, reply: ReplyFn) {
        let now = {
            let mut st = self.state.borrow_mut();
            assert!(
                !st.all.contains_key(&worker),
                "worker {worker} registered twice for {}",
                st.key
            );
            st.all.insert(worker, rpc);
            if matches!(st.listen, Listen::Binding) {
                st.waiting.push((worker, reply));
                return;
            }
            match &st.listen {
                Listen::Failed(e) => Err(*e),
                Listen::Closed => Err(BindError {
                    errno: libc::EBADF,
                }),
                _ => Ok(st.local_addr()),
            }
        };

        reply(now);
        if now.is_ok() {
            self.state.borrow_mut().due.push_back(worker);
            Self::pump(&self.state);
        }
    }

    /// Deregister `worker`. Returns `true` when it was the last one and the
    /// key has been torn down.
    pub fn remove(&self, worker: WorkerId) -> bool {
        let (queued, listener) = {
            let mut st = self.state.borrow_mut();
            if st.all.remove(&worker).is_none() {
                return false;
            }
            st.free.retain(|w| *w != worker);
            st.waiting.retain(|(w, _)| *w != worker);
            st.early.remove(&worker);
            if !st.all.is_empty() {
                return false;
            }

            info!(key = %st.key, "last worker gone, closing");
            let queued = std::mem::take(&mut st.handles);
            let listener = match std::mem::replace(&mut st.listen, Listen::Closed) {
                Listen::Listening(l) => Some(l),
                _ => None,
            };
            st.free.clear();
            st.due.clear();
            (queued, listener)
        };

        for handle in queued {
            handle.close();
        }
        if let Some(listener) = listener {
            listener.close();
        }
        true
    }

    /// One accept event from the transport.
    pub fn on_accept(&self, accepted: io::Result<H>) {
        let handle = match accepted {
            Ok(handle) => handle,
            Err(e) => {
                debug!(error = %e, "accept failed");
                return;
            }
        };
        {
            let mut st = self.state.borrow_mut();
            if !matches!(st.listen, Listen::Listening(_)) {
                drop(st);
                handle.close();
                return;
            }
            st.handles.push_back(handle);
        }
        Self::pump(&self.state);
    }

    /// Pair queued connections with idle workers until no progress is
    /// possible.
    fn pump(state: &Rc<RefCell<State<L, C, H>>>) {
        loop {
            let step = state.borrow_mut().next_step();
            let Step::Offer {
                worker,
                rpc,
                handle,
            } = step
            else {
                return;
            };
            Self::offer(state, worker, &rpc, handle);
        }
    }

    fn offer(
        state: &Rc<RefCell<State<L, C, H>>>,
        worker: WorkerId,
        rpc: &RpcChannel<C, H>,
        handle: H,
    ) {
        let key = state.borrow().key.clone();
        let weak = Rc::downgrade(state);
        let sent = rpc.send(
            Request::NewConn { key },
            Some(&handle),
            Some(Box::new(move |reply: Envelope, _: Option<H>| {
                Self::resolve(&weak, worker, &reply);
            })),
        );

        let release = {
            let mut st = state.borrow_mut();
            match sent {
                Ok(call) => {
                    debug!(worker, seq = call.seq(), "handoff sent");
                    match st.early.remove(&worker) {
                        Some(accepted) => st.finish(worker, call.seq(), handle, accepted),
                        None => {
                            st.in_flight.insert(
                                worker,
                                InFlight {
                                    seq: call.seq(),
                                    handle,
                                },
                            );
                            None
                        }
                    }
                }
                Err(e) => {
                    // Whatever the cause, this worker cannot be handed work
                    // any more; its owner removes it once it sees the channel
                    // closed.
                    warn!(worker, error = %e, "handoff not sent, dropping channel");
                    rpc.disconnect();
                    st.handles.push_front(handle);
                    None
                }
            }
        };

        if let Some(handle) = release {
            handle.close();
        }
    }

    fn resolve(weak: &Weak<RefCell<State<L, C, H>>>, worker: WorkerId, reply: &Envelope) {
        let Some(state) = weak.upgrade() else {
            return;
        };
        let accepted = reply.is_accepted();
        let release = {
            let mut st = state.borrow_mut();
            let Some(InFlight { seq, handle }) = st.in_flight.remove(&worker) else {
                // Answered before `offer` got to record the handoff; it
                // finishes the job once the send returns.
                debug!(worker, accepted, "reply arrived during send");
                st.early.insert(worker, accepted);
                return;
            };
            st.finish(worker, seq, handle, accepted)
        };

        if let Some(handle) = release {
            handle.close();
        }
        Self::pump(&state);
    }

    pub fn is_registered(&self, worker: WorkerId) -> bool {
        self.state.borrow().all.contains_key(&worker)
    }

    pub fn workers(&self) -> usize {
        self.state.borrow().all.len()
    }

    pub fn free_workers(&self) -> Vec<WorkerId> {
        self.state.borrow().free.iter().copied().collect()
    }

    pub fn queued(&self) -> usize {
        self.state.borrow().handles.len()
    }

    /// Sequence number of the handoff `worker` has not answered yet.
    pub fn in_flight(&self, worker: WorkerId) -> Option<u64> {
        self.state.borrow().in_flight.get(&worker).map(|f| f.seq)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::message::Reply;
    use crate::protocol::rpc::tests::{MockChannel, Tagged};
    use std::cell::Cell;

    type Closed = Rc<RefCell<Vec<u32>>>;

    struct Conn {
        id: u32,
        closed: Closed,
    }

    impl ConnHandle for Conn {
        fn close(self) {
            self.closed.borrow_mut().push(self.id);
        }
    }

    impl Tagged for Conn {
        fn tag(&self) -> u32 {
            self.id
        }
    }

    struct MockListener {
        closed: Rc<Cell<bool>>,
    }

    impl Listener for MockListener {
        fn local_addr(&self) -> Option<SocketAddr> {
            Some("127.0.0.1:8000".parse().unwrap())
        }

        fn close(self) {
            self.closed.set(true);
        }
    }

    /// Holds the bind callback until the test settles it.
    #[derive(Default)]
    struct ManualBinder {
        done: RefCell<Option<crate::core::socket::BindDone<MockListener>>>,
    }

    impl Binder<MockListener> for ManualBinder {
        fn listen(&self, _: &BindSpec, done: crate::core::socket::BindDone<MockListener>) {
            *self.done.borrow_mut() = Some(done);
        }
    }

    impl ManualBinder {
        fn succeed(&self, closed: &Rc<Cell<bool>>) {
            let done = self.done.borrow_mut().take().unwrap();
            done(Ok(MockListener {
                closed: closed.clone(),
            }));
        }

        fn fail(&self, errno: i32) {
            let done = self.done.borrow_mut().take().unwrap();
            done(Err(BindError { errno }));
        }
    }

    type Rpc = Rc<RpcChannel<MockChannel, Conn>>;
    type Dist = ConnectionDistributor<MockListener, MockChannel, Conn>;

    struct Harness {
        dist: Dist,
        binder: ManualBinder,
        listener_closed: Rc<Cell<bool>>,
        conns_closed: Closed,
        replies: Rc<RefCell<Vec<(WorkerId, AddReply)>>>,
        rpcs: HashMap<WorkerId, Rpc>,
    }

    impl Harness {
        fn binding() -> Self {
            let binder = ManualBinder::default();
            let dist = ConnectionDistributor::new(
                Key::new("127.0.0.1:8000:tcp"),
                BindSpec::tcp(Some("127.0.0.1"), 8000),
                &binder,
            );
            Self {
                dist,
                binder,
                listener_closed: Rc::default(),
                conns_closed: Rc::default(),
                replies: Rc::default(),
                rpcs: HashMap::new(),
            }
        }

        fn listening() -> Self {
            let h = Self::binding();
            h.binder.succeed(&h.listener_closed);
            h
        }

        fn add(&mut self, worker: WorkerId) {
            let rpc: Rpc = Rc::new(RpcChannel::new(
                MockChannel::open(),
                Box::new(|_: Envelope, _: Option<Conn>| {}),
            ));
            self.rpcs.insert(worker, rpc.clone());
            let replies = self.replies.clone();
            self.dist
                .add(worker, rpc, Box::new(move |r| replies.borrow_mut().push((worker, r))));
        }

        fn accept(&self, id: u32) {
            self.dist.on_accept(Ok(Conn {
                id,
                closed: self.conns_closed.clone(),
            }));
        }

        /// (seq, conn id) of every newconn sent to `worker`.
        fn offers(&self, worker: WorkerId) -> Vec<(u64, u32)> {
            self.rpcs[&worker]
                .channel()
                .sent
                .borrow()
                .iter()
                .map(|(m, h)| (m.seq.unwrap(), h.unwrap()))
                .collect()
        }

        fn answer(&self, worker: WorkerId, accepted: bool) {
            let seq = self.dist.in_flight(worker).expect("nothing in flight");
            self.rpcs[&worker].dispatch(
                Envelope::new(0, Some(seq), Reply::accepted(accepted).into()),
                None,
            );
        }

        fn closed(&self) -> Vec<u32> {
            self.conns_closed.borrow().clone()
        }
    }

    #[test]
    fn queued_connection_goes_to_first_worker() {
        let mut h = Harness::listening();
        h.accept(1);
        assert_eq!(h.dist.queued(), 1);

        h.add(10);
        assert_eq!(
            *h.replies.borrow(),
            vec![(10, Ok(Some("127.0.0.1:8000".parse().unwrap())))]
        );
        assert_eq!(h.offers(10), vec![(0, 1)]);
        assert_eq!(h.dist.queued(), 0);
        assert_eq!(h.dist.in_flight(10), Some(0));
    }

    #[test]
    fn busy_worker_leaves_second_connection_queued() {
        let mut h = Harness::listening();
        h.add(10);
        assert_eq!(h.dist.free_workers(), vec![10]);

        h.accept(1);
        h.accept(2);
        assert_eq!(h.offers(10), vec![(0, 1)]);
        assert_eq!(h.dist.queued(), 1);
        assert!(h.dist.free_workers().is_empty());

        h.answer(10, true);
        assert_eq!(h.closed(), vec![1]);
        assert_eq!(h.offers(10), vec![(0, 1), (1, 2)]);
        assert_eq!(h.dist.queued(), 0);

        h.answer(10, true);
        assert_eq!(h.closed(), vec![1, 2]);
        assert_eq!(h.dist.free_workers(), vec![10]);
    }

    #[test]
    fn one_connection_two_idle_workers() {
        let mut h = Harness::listening();
        h.add(10);
        h.add(20);
        h.accept(1);

        let got: Vec<WorkerId> = [10, 20]
            .into_iter()
            .filter(|w| !h.offers(*w).is_empty())
            .collect();
        assert_eq!(got.len(), 1);
        let other = if got[0] == 10 { 20 } else { 10 };
        assert_eq!(h.dist.free_workers(), vec![other]);
    }

    #[test]
    fn rejected_connection_is_offered_again() {
        let mut h = Harness::listening();
        h.add(10);
        h.accept(1);
        h.add(20);
        assert_eq!(h.offers(10), vec![(0, 1)]);

        h.answer(10, false);
        // Back in the queue and straight to the other idle worker.
        assert_eq!(h.offers(20), vec![(0, 1)]);
        assert!(h.closed().is_empty());
        assert_eq!(h.dist.free_workers(), vec![10]);

        h.answer(20, true);
        assert_eq!(h.closed(), vec![1]);
    }

    #[test]
    fn sole_worker_gets_its_rejection_back() {
        let mut h = Harness::listening();
        h.add(10);
        h.accept(1);
        h.answer(10, false);
        assert_eq!(h.offers(10), vec![(0, 1), (1, 1)]);
        assert_eq!(h.dist.queued(), 0);
        assert!(h.closed().is_empty());
    }

    #[test]
    fn rejection_keeps_oldest_first() {
        let mut h = Harness::listening();
        h.add(10);
        h.accept(1);
        h.accept(2);
        h.answer(10, false);
        assert_eq!(h.offers(10).last(), Some(&(1, 1)));
        assert_eq!(h.dist.queued(), 1);
    }

    #[test]
    fn removing_last_worker_tears_down() {
        let mut h = Harness::listening();
        h.add(10);
        h.accept(1);
        h.accept(2);
        h.accept(3);
        assert_eq!(h.dist.in_flight(10), Some(0));

        assert!(h.dist.remove(10));
        assert!(h.listener_closed.get());
        assert_eq!(h.closed(), vec![2, 3]);
        assert_eq!(h.dist.phase(), Phase::Closed);
        assert_eq!(h.dist.queued(), 0);

        // Late accepts after teardown are not kept.
        h.accept(4);
        assert_eq!(h.closed(), vec![2, 3, 4]);
    }

    #[test]
    fn late_reply_after_teardown_closes_handle() {
        let mut h = Harness::listening();
        h.add(10);
        h.accept(1);
        assert!(h.dist.remove(10));
        h.answer(10, false);
        assert_eq!(h.closed(), vec![1]);
        assert_eq!(h.offers(10).len(), 1);
    }

    #[test]
    fn removing_other_workers_leaves_socket_alone() {
        let mut h = Harness::listening();
        h.add(10);
        h.add(20);
        h.accept(1);
        h.accept(2);
        h.accept(3);

        assert!(!h.dist.remove(10));
        assert!(!h.dist.remove(10));
        assert!(!h.dist.remove(99));
        assert!(!h.listener_closed.get());
        assert!(h.closed().is_empty());
        assert_eq!(h.dist.phase(), Phase::Listening);
        assert!(h.dist.is_registered(20));
    }

    #[test]
    fn reply_from_removed_worker_requeues_for_others() {
        let mut h = Harness::listening();
        h.add(10);
        h.add(20);
        h.accept(1);
        h.accept(2);
        let first = if h.offers(10).first().map(|o| o.1) == Some(1) {
            10
        } else {
            20
        };
        let second = if first == 10 { 20 } else { 10 };

        assert!(!h.dist.remove(first));
        h.answer(first, false);
        assert_eq!(h.dist.queued(), 1);
        assert!(h.dist.free_workers().is_empty());

        h.answer(second, true);
        assert_eq!(h.offers(second).last().map(|o| o.1), Some(1));
    }

    #[test]
    #[should_panic(expected = "registered twice")]
    fn duplicate_add_panics() {
        let mut h = Harness::listening();
        h.add(10);
        h.add(10);
    }

    #[test]
    fn duplicate_add_changes_nothing() {
        let mut h = Harness::listening();
        h.add(10);
        let dist = h.dist.clone();
        let rpc = h.rpcs[&10].clone();
        let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            dist.add(10, rpc, Box::new(|_| panic!("must not reply")));
        }));
        assert!(outcome.is_err());
        assert_eq!(h.dist.workers(), 1);
        assert_eq!(h.dist.free_workers(), vec![10]);
        assert_eq!(h.replies.borrow().len(), 1);
    }

    #[test]
    fn adds_during_binding_are_answered_in_order() {
        let mut h = Harness::binding();
        h.add(30);
        h.add(10);
        h.add(20);
        assert!(h.replies.borrow().is_empty());
        assert_eq!(h.dist.phase(), Phase::Binding);

        h.binder.succeed(&h.listener_closed);
        let order: Vec<WorkerId> = h.replies.borrow().iter().map(|(w, _)| *w).collect();
        assert_eq!(order, vec![30, 10, 20]);
        assert_eq!(h.dist.free_workers(), vec![30, 10, 20]);
    }

    #[test]
    fn bind_failure_reaches_every_caller() {
        let mut h = Harness::binding();
        h.add(10);
        h.add(20);
        h.binder.fail(libc::EADDRINUSE);

        let err: AddReply = Err(BindError {
            errno: libc::EADDRINUSE,
        });
        assert_eq!(*h.replies.borrow(), vec![(10, err), (20, err)]);
        assert!(h.dist.free_workers().is_empty());

        h.add(30);
        assert_eq!(h.replies.borrow().last(), Some(&(30, err)));
        assert!(h.dist.free_workers().is_empty());
        assert!(matches!(h.dist.phase(), Phase::Failed(_)));
    }

    #[test]
    fn all_workers_gone_before_bind_completes() {
        let mut h = Harness::binding();
        h.add(10);
        assert!(h.dist.remove(10));
        h.binder.succeed(&h.listener_closed);
        assert!(h.listener_closed.get());
        assert!(h.replies.borrow().is_empty());
        assert_eq!(h.dist.phase(), Phase::Closed);
    }

    #[test]
    fn accept_errors_are_dropped() {
        let mut h = Harness::listening();
        h.add(10);
        h.dist.on_accept(Err(io::Error::from_raw_os_error(libc::EMFILE)));
        assert_eq!(h.dist.queued(), 0);
        assert!(h.offers(10).is_empty());
        assert_eq!(h.dist.free_workers(), vec![10]);
    }

    #[test]
    fn disconnected_worker_never_loses_a_connection() {
        let mut h = Harness::listening();
        h.add(10);
        h.rpcs[&10].channel().connected.set(false);
        h.accept(1);
        assert_eq!(h.dist.queued(), 1);
        assert!(h.dist.free_workers().is_empty());
        assert!(h.dist.in_flight(10).is_none());

        h.add(20);
        assert_eq!(h.offers(20), vec![(0, 1)]);
    }

    #[test]
    fn load_spreads_across_workers() {
        let mut h = Harness::listening();
        let workers = [1, 2, 3, 4];
        for w in workers {
            h.add(w);
        }
        for conn in 0..400 {
            h.accept(conn);
            // Answer whoever got work, keeping everyone busy in turn.
            for w in workers {
                if h.dist.in_flight(w).is_some() {
                    h.answer(w, true);
                }
            }
        }
        assert_eq!(h.closed().len(), 400);
        for w in workers {
            let n = h.offers(w).len();
            assert!(n >= 50, "worker {w} only got {n} of 400");
        }
    }

    #[test]
    fn every_handle_closed_exactly_once() {
        let mut h = Harness::listening();
        h.add(1);
        h.add(2);
        for conn in 0..20 {
            h.accept(conn);
        }
        for round in 0..20 {
            for w in [1, 2] {
                if h.dist.in_flight(w).is_some() {
                    h.answer(w, round % 3 != 0);
                }
            }
        }
        let mut closed = h.closed();
        closed.sort_unstable();
        closed.dedup();
        assert_eq!(closed.len(), h.closed().len());
        let in_flight = [1, 2]
            .iter()
            .filter(|w| h.dist.in_flight(**w).is_some())
            .count();
        let outstanding = h.dist.queued() + in_flight;
        assert_eq!(closed.len() + outstanding, 20);
    }

    #[test]
    fn unsendable_handoff_gives_up_on_the_worker() {
        let mut h = Harness::listening();
        h.add(10);
        h.add(20);
        h.rpcs[&10].channel().fail_next.set(true);

        h.accept(1);
        assert!(!h.rpcs[&10].is_connected());
        assert_eq!(h.rpcs[&10].pending_calls(), 0);
        assert_eq!(h.offers(20), vec![(0, 1)]);

        // Worker 10 is never picked again, even once 20 frees up.
        h.accept(2);
        assert_eq!(h.dist.queued(), 1);
        h.answer(20, true);
        assert_eq!(h.offers(20), vec![(0, 1), (1, 2)]);
        assert!(h.offers(10).is_empty());
        assert!(h.dist.in_flight(10).is_none());
    }

    #[test]
    fn unsendable_handoff_to_sole_worker_is_released_on_removal() {
        let mut h = Harness::listening();
        h.add(10);
        h.rpcs[&10].channel().fail_next.set(true);
        h.accept(1);
        h.accept(2);
        assert!(!h.rpcs[&10].is_connected());
        assert_eq!(h.dist.queued(), 2);
        assert!(h.dist.free_workers().is_empty());

        assert!(h.dist.remove(10));
        assert_eq!(h.closed(), vec![1, 2]);
        assert!(h.listener_closed.get());
    }

    /// Answers each `newconn` from inside `send`, popping the verdicts in
    /// order; stays silent once they run out.
    #[derive(Default)]
    struct EagerChannel {
        rpc: RefCell<Weak<RpcChannel<EagerChannel, Conn>>>,
        verdicts: RefCell<VecDeque<bool>>,
        sent: Cell<usize>,
    }

    impl Channel<Conn> for EagerChannel {
        fn connected(&self) -> bool {
            true
        }

        fn send(&self, message: &Envelope, _: Option<&Conn>) -> io::Result<()> {
            self.sent.set(self.sent.get() + 1);
            let verdict = self.verdicts.borrow_mut().pop_front();
            let rpc = self.rpc.borrow().upgrade();
            if let (Some(accepted), Some(rpc), Some(seq)) = (verdict, rpc, message.seq) {
                rpc.dispatch(
                    Envelope::new(0, Some(seq), Reply::accepted(accepted).into()),
                    None,
                );
            }
            Ok(())
        }

        fn disconnect(&self) {}
    }

    #[test]
    fn reply_during_send_is_not_lost() {
        let binder = ManualBinder::default();
        let dist: ConnectionDistributor<MockListener, EagerChannel, Conn> =
            ConnectionDistributor::new(
                Key::new("127.0.0.1:8000:tcp"),
                BindSpec::tcp(Some("127.0.0.1"), 8000),
                &binder,
            );
        binder.succeed(&Rc::default());

        let rpc = Rc::new(RpcChannel::new(
            EagerChannel::default(),
            Box::new(|_: Envelope, _: Option<Conn>| {}),
        ));
        *rpc.channel().rpc.borrow_mut() = Rc::downgrade(&rpc);
        rpc.channel().verdicts.borrow_mut().extend([false, true]);
        dist.add(10, rpc.clone(), Box::new(|_: AddReply| {}));

        let closed: Closed = Rc::default();
        dist.on_accept(Ok(Conn {
            id: 1,
            closed: closed.clone(),
        }));

        // Refused once, offered again, then taken.
        assert_eq!(rpc.channel().sent.get(), 2);
        assert_eq!(*closed.borrow(), vec![1]);
        assert_eq!(dist.queued(), 0);
        assert!(dist.in_flight(10).is_none());
        assert_eq!(dist.free_workers(), vec![10]);
        assert_eq!(rpc.pending_calls(), 0);
    }
}
