//! Sequence-numbered request/response over a worker channel.
//!
//! Every outgoing message gets the next sequence number of its channel. A
//! caller that wants an answer registers a callback under that number; the
//! peer echoes the number back as `ack`, and [`RpcChannel::dispatch`] routes
//! the reply to the callback. Everything else goes to the channel's generic
//! message handler.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::io;

use tracing::{debug, trace};

use crate::error::{Error, Result};
use crate::protocol::message::{Envelope, Payload};

/// The bidirectional process channel RPC rides on: one message plus at most
/// one transferable handle per send.
pub trait Channel<H> {
    fn connected(&self) -> bool;

    fn send(&self, message: &Envelope, handle: Option<&H>) -> io::Result<()>;

    /// Stop using the channel. Later sends fail with [`Error::ChannelClosed`]
    /// at the RPC layer.
    fn disconnect(&self);
}

pub type ResponseFn<H> = Box<dyn FnOnce(Envelope, Option<H>)>;
pub type MessageFn<H> = Box<dyn Fn(Envelope, Option<H>)>;

/// An outstanding request. Query it with [`RpcChannel::is_pending`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PendingCall {
    seq: u64,
}

impl PendingCall {
    pub fn seq(&self) -> u64 {
        self.seq
    }
}

pub struct RpcChannel<C, H> {
    channel: C,
    next_seq: Cell<u64>,
    pending: RefCell<HashMap<u64, ResponseFn<H>>>,
    on_message: MessageFn<H>,
}

impl<C: Channel<H>, H> RpcChannel<C, H> {
    pub fn new(channel: C, on_message: MessageFn<H>) -> Self {
        Self {
            channel,
            next_seq: Cell::new(0),
            pending: RefCell::new(HashMap::new()),
            on_message,
        }
    }

    pub fn channel(&self) -> &C {
        &self.channel
    }

    pub fn is_connected(&self) -> bool {
        self.channel.connected()
    }

    pub fn disconnect(&self) {
        self.channel.disconnect();
    }

    /// Send a request.
    ///
    /// # Errors
    ///
    /// [`Error::ChannelClosed`] when the channel is disconnected; nothing is
    /// registered or sent and the sequence counter does not move. A failed
    /// transmission withdraws the registration, so `on_response` never runs.
    pub fn send(
        &self,
        payload: impl Into<Payload>,
        handle: Option<&H>,
        on_response: Option<ResponseFn<H>>,
    ) -> Result<PendingCall> {
        self.transmit(None, payload.into(), handle, on_response)
    }

    /// Answer the request numbered `ack`.
    pub fn respond(&self, ack: u64, payload: impl Into<Payload>, handle: Option<&H>) -> Result<()> {
        self.transmit(Some(ack), payload.into(), handle, None)
            .map(drop)
    }

    fn transmit(
        &self,
        ack: Option<u64>,
        payload: Payload,
        handle: Option<&H>,
        on_response: Option<ResponseFn<H>>,
    ) -> Result<PendingCall> {
        if !self.channel.connected() {
            return Err(Error::ChannelClosed);
        }

        let seq = self.next_seq.get();
        self.next_seq.set(seq + 1);
        let message = Envelope::new(seq, ack, payload);

        // Registered before the bytes leave so that no reply can beat it.
        let registered = on_response.is_some();
        if let Some(cb) = on_response {
            self.pending.borrow_mut().insert(seq, cb);
        }

        if let Err(e) = self.channel.send(&message, handle) {
            if registered {
                self.pending.borrow_mut().remove(&seq);
            }
            return Err(e.into());
        }
        trace!(seq, ?ack, "sent");
        Ok(PendingCall { seq })
    }

    /// Route one inbound message.
    pub fn dispatch(&self, message: Envelope, handle: Option<H>) {
        if !message.is_cluster() {
            trace!("ignoring untagged message");
            return;
        }

        if let Some(ack) = message.ack {
            // The entry leaves the table before the callback runs, so a
            // duplicate reply cannot reach it.
            let callback = self.pending.borrow_mut().remove(&ack);
            if let Some(cb) = callback {
                cb(message, handle);
                return;
            }
            debug!(ack, "reply without a pending call");
        }

        (self.on_message)(message, handle);
    }

    pub fn is_pending(&self, call: &PendingCall) -> bool {
        self.pending.borrow().contains_key(&call.seq)
    }

    pub fn pending_calls(&self) -> usize {
        self.pending.borrow().len()
    }
}
