use std::io;
use std::os::unix::process::ExitStatusExt;
use std::process::{Child, ExitStatus};
use std::rc::Rc;

use crate::core::key::WorkerId;
use crate::protocol::message::Envelope;
use crate::protocol::rpc::{Channel, MessageFn, RpcChannel};

/// The OS process behind a worker.
pub trait Process {
    fn pid(&self) -> u32;

    /// Exit code, once the process has exited normally.
    fn exit_code(&self) -> Option<i32>;

    /// Terminating signal, once the process has been killed by one.
    fn signal_code(&self) -> Option<i32>;

    /// Pick up a pending exit status without blocking.
    fn refresh(&mut self) -> io::Result<()>;

    fn kill(&mut self, signal: i32) -> io::Result<()>;
}

/// A spawned child process.
pub struct ChildProcess {
    child: Child,
    status: Option<ExitStatus>,
}

impl ChildProcess {
    pub fn new(child: Child) -> Self {
        Self {
            child,
            status: None,
        }
    }
}

impl Process for ChildProcess {
    fn pid(&self) -> u32 {
        self.child.id()
    }

    fn exit_code(&self) -> Option<i32> {
        self.status.and_then(|s| s.code())
    }

    fn signal_code(&self) -> Option<i32> {
        self.status.and_then(|s| s.signal())
    }

    fn refresh(&mut self) -> io::Result<()> {
        if self.status.is_none() {
            self.status = self.child.try_wait()?;
        }
        Ok(())
    }

    fn kill(&mut self, signal: i32) -> io::Result<()> {
        if self.status.is_some() {
            return Ok(());
        }
        let ret = unsafe { libc::kill(self.child.id() as libc::pid_t, signal) };
        if ret != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

/// A fault reported by the process layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessFault {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

pub type FaultFn = Box<dyn Fn(ProcessFault)>;

/// Where a worker's events go.
pub struct WorkerEvents<H> {
    pub on_error: FaultFn,
    pub on_message: MessageFn<H>,
}

/// One worker as the primary sees it: its process, its channel, and the
/// owner's event callbacks. Holds no state of its own beyond that.
pub struct WorkerHandle<P, C, H> {
    id: WorkerId,
    process: P,
    rpc: Rc<RpcChannel<C, H>>,
    events: WorkerEvents<H>,
}

impl<P: Process, C: Channel<H>, H> WorkerHandle<P, C, H> {
    pub fn new(
        id: WorkerId,
        process: P,
        rpc: Rc<RpcChannel<C, H>>,
        events: WorkerEvents<H>,
    ) -> Self {
        Self {
            id,
            process,
            rpc,
            events,
        }
    }

    pub fn id(&self) -> WorkerId {
        self.id
    }

    pub fn rpc(&self) -> &Rc<RpcChannel<C, H>> {
        &self.rpc
    }

    pub fn process(&self) -> &P {
        &self.process
    }

    pub fn process_mut(&mut self) -> &mut P {
        &mut self.process
    }

    pub fn is_dead(&self) -> bool {
        self.process.exit_code().is_some() || self.process.signal_code().is_some()
    }

    pub fn is_connected(&self) -> bool {
        self.rpc.channel().connected()
    }

    pub fn send(&self, message: &Envelope, handle: Option<&H>) -> io::Result<()> {
        self.rpc.channel().send(message, handle)
    }

    pub fn kill(&mut self, signal: i32) -> io::Result<()> {
        self.process.kill(signal)
    }

    pub fn relay_error(&self, fault: ProcessFault) {
        (self.events.on_error)(fault);
    }

    pub fn relay_message(&self, message: Envelope, handle: Option<H>) {
        (self.events.on_message)(message, handle);
    }
}
