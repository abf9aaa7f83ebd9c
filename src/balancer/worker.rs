//! The worker process loop.
//!
//! A worker asks the primary to listen on its behalf, then serves every
//! connection the primary hands it. Connections are served one at a time on
//! the worker's only thread; the primary never has more than one handoff
//! outstanding per worker, so nothing queues up here.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::io::{self, Write};
use std::net::{Shutdown, SocketAddr};
use std::os::fd::OwnedFd;
use std::rc::Rc;
use std::time::Duration;

use socket2::Socket;
use tracing::{debug, info, warn};

use crate::balancer::config::WorkerConfig;
use crate::core::key::Key;
use crate::error::{Error, Result};
use crate::protocol::http1::{HeadBuf, parse_request_line, render_response};
use crate::protocol::message::{AddReply, Envelope, Reply, Request};
use crate::protocol::rpc::RpcChannel;
use crate::protocol::unix_channel::UnixChannel;

const READ_TIMEOUT: Duration = Duration::from_secs(5);

type Inbox = Rc<RefCell<VecDeque<(Envelope, Option<OwnedFd>)>>>;

pub struct Worker {
    config: WorkerConfig,
    rpc: RpcChannel<UnixChannel, OwnedFd>,
    inbox: Inbox,
    served: u64,
    /// Set once `close` has been sent; later handoffs are refused.
    draining: bool,
    /// Set when the primary has acknowledged `close`.
    left: Rc<Cell<bool>>,
}

/// Join the primary's pool for `config.spec` and serve until the primary
/// goes away or the connection limit is reached.
pub fn run_worker(channel: UnixChannel, config: WorkerConfig) -> Result<()> {
    Worker::new(channel, config)?.run()
}

impl Worker {
    pub fn new(channel: UnixChannel, config: WorkerConfig) -> Result<Self> {
        channel.set_nonblocking(false)?;
        let inbox: Inbox = Rc::default();
        let sink = inbox.clone();
        let rpc = RpcChannel::new(
            channel,
            Box::new(move |message: Envelope, handle: Option<OwnedFd>| {
                sink.borrow_mut().push_back((message, handle));
            }),
        );
        Ok(Self {
            config,
            rpc,
            inbox,
            served: 0,
            draining: false,
            left: Rc::new(Cell::new(false)),
        })
    }

    pub fn served(&self) -> u64 {
        self.served
    }

    pub fn run(mut self) -> Result<()> {
        let key = self.config.spec.key()?;
        let addr = self.join()?;
        info!(worker = self.config.id, %key, ?addr, "joined");

        loop {
            if self.left.get() {
                info!(worker = self.config.id, served = self.served, "left pool");
                return Ok(());
            }
            if !self.pump_one()? {
                info!(worker = self.config.id, "primary went away");
                return Ok(());
            }
            loop {
                let next = self.inbox.borrow_mut().pop_front();
                let Some((message, handle)) = next else {
                    break;
                };
                self.handle(&key, message, handle)?;
            }
        }
    }

    /// Send `queryServer` and wait for its answer.
    fn join(&self) -> Result<Option<SocketAddr>> {
        let outcome: Rc<RefCell<Option<AddReply>>> = Rc::default();
        let slot = outcome.clone();
        self.rpc.send(
            Request::QueryServer {
                spec: self.config.spec.clone(),
            },
            None,
            Some(Box::new(move |reply: Envelope, _: Option<OwnedFd>| {
                let reply = reply.reply().cloned().unwrap_or_default();
                *slot.borrow_mut() = Some(reply.into_add_reply());
            })),
        )?;

        loop {
            let answer = outcome.borrow_mut().take();
            if let Some(answer) = answer {
                return Ok(answer?);
            }
            if !self.pump_one()? {
                return Err(Error::ChannelClosed);
            }
        }
    }

    /// Block for one message and dispatch it. `false` once the primary is
    /// gone.
    fn pump_one(&self) -> Result<bool> {
        match self.rpc.channel().recv() {
            Ok(Some((message, handle))) => {
                self.rpc.dispatch(message, handle);
                Ok(true)
            }
            Ok(None) => Ok(false),
            Err(Error::Codec(e)) => {
                warn!(error = %e, "dropping malformed message");
                Ok(true)
            }
            Err(e) => Err(e),
        }
    }

    fn handle(&mut self, key: &Key, message: Envelope, handle: Option<OwnedFd>) -> Result<()> {
        let (Some(seq), Some(Request::NewConn { .. })) = (message.seq, message.request()) else {
            debug!(?message, "ignoring message");
            return Ok(());
        };
        let Some(conn) = handle.filter(|_| !self.draining) else {
            self.rpc.respond(seq, Reply::accepted(false), None)?;
            return Ok(());
        };

        self.rpc.respond(seq, Reply::accepted(true), None)?;
        self.served += 1;
        if let Err(e) = self.serve(conn) {
            debug!(error = %e, "connection failed");
        }

        if self
            .config
            .max_connections
            .is_some_and(|max| self.served >= max)
        {
            self.leave(key)?;
        }
        Ok(())
    }

    fn leave(&mut self, key: &Key) -> Result<()> {
        if self.draining {
            return Ok(());
        }
        self.draining = true;
        let left = self.left.clone();
        self.rpc.send(
            Request::Close { key: key.clone() },
            None,
            Some(Box::new(move |_: Envelope, _: Option<OwnedFd>| left.set(true))),
        )?;
        Ok(())
    }

    fn serve(&self, conn: OwnedFd) -> io::Result<()> {
        let mut socket = Socket::from(conn);
        socket.set_read_timeout(Some(READ_TIMEOUT))?;

        let mut head = HeadBuf::with_capacity(self.config.header_buffer_capacity);
        let response = match head.fill_from(&mut socket) {
            Ok(Some(end)) => match parse_request_line(&head.window()[..end]) {
                Ok(line) => {
                    let body = format!(
                        "worker {} (pid {}) {} {}\n",
                        self.config.id,
                        std::process::id(),
                        String::from_utf8_lossy(line.method),
                        String::from_utf8_lossy(line.path),
                    );
                    render_response(200, "OK", &body)
                }
                Err(e) => render_response(400, "Bad Request", &format!("{e}\n")),
            },
            Ok(None) => return Ok(()),
            Err(e) if e.kind() == io::ErrorKind::InvalidData => {
                render_response(431, "Request Header Fields Too Large", "")
            }
            Err(e) => return Err(e),
        };

        socket.write_all(&response)?;
        let _ = socket.shutdown(Shutdown::Write);
        Ok(())
    }
}
