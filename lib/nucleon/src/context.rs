use crate::handle::{self, Handle};
use crate::mailbox::Mailbox;
use crate::message::{
    Message, Payload, ProtocolId, Session, MAX_MESSAGE_SIZE, TAG_ALLOCSESSION,
};
use crate::module::{InitError, Service};
use crate::node::NodeShared;
use slog::{error, o, Logger};
use std::fs::File;
use std::io::Write;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

/// Synchronous send failure. The payload travels back inside the error so
/// the caller keeps ownership of what could not be delivered.
#[derive(Debug)]
pub struct SendError {
    pub kind: SendErrorKind,
    pub payload: Payload,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum SendErrorKind {
    /// Payload exceeds the 24 bit size field.
    TooLarge,
    /// No live service answers to the destination.
    InvalidDestination,
    /// The destination is on another node and no harbor hook is installed.
    NoHarbor,
}

/// One live service: its mailbox, session counter, module instance and the
/// runtime handles it needs to talk to the rest of the node. At most one
/// worker runs the instance at any time; everything else here is safe to
/// touch from any thread.
pub struct ServiceContext {
    node: Arc<NodeShared>,
    module: Box<str>,
    handle: Handle,
    mailbox: Arc<Mailbox>,
    session: AtomicI32,
    initialized: AtomicBool,
    endless: AtomicBool,
    reserved: AtomicBool,
    cpu_cost_micros: AtomicU64,
    message_count: AtomicU64,
    cell: Mutex<Box<dyn Service>>,
    pending_signal: Mutex<Option<i32>>,
    logfile: Mutex<Option<File>>,
    log: Logger,
}

impl ServiceContext {
    pub(crate) fn new(
        node: Arc<NodeShared>,
        module: &str,
        instance: Box<dyn Service>,
        handle: Handle,
    ) -> Arc<ServiceContext> {
        let log = node.log.new(o!(
            "service" => handle::to_hex(handle),
            "module" => module.to_string(),
        ));
        Arc::new(ServiceContext {
            node,
            module: module.into(),
            handle,
            mailbox: Mailbox::new(handle),
            session: AtomicI32::new(0),
            initialized: AtomicBool::new(false),
            endless: AtomicBool::new(false),
            reserved: AtomicBool::new(false),
            cpu_cost_micros: AtomicU64::new(0),
            message_count: AtomicU64::new(0),
            cell: Mutex::new(instance),
            pending_signal: Mutex::new(None),
            logfile: Mutex::new(None),
            log,
        })
    }

    #[inline]
    pub fn handle(&self) -> Handle {
        self.handle
    }

    #[inline]
    pub fn module_name(&self) -> &str {
        &self.module
    }

    #[inline]
    pub(crate) fn mailbox(&self) -> &Arc<Mailbox> {
        &self.mailbox
    }

    #[inline]
    pub(crate) fn node(&self) -> &Arc<NodeShared> {
        &self.node
    }

    #[inline]
    pub fn logger(&self) -> &Logger {
        &self.log
    }

    /// Queue length of this service's mailbox.
    #[inline]
    pub fn mailbox_len(&self) -> usize {
        self.mailbox.len()
    }

    /// Allocate the next session id. Always positive; wraps back to 1.
    pub fn new_session(&self) -> Session {
        let session = self.session.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
        if session <= 0 {
            self.session.store(1, Ordering::Relaxed);
            return 1;
        }
        session
    }

    /// Send a message. `source = 0` means "from self"; `destination = 0`
    /// discards the message but still allocates a session if asked for.
    /// `kind` is a protocol id optionally tagged with [`TAG_ALLOCSESSION`];
    /// the returned session is the caller's correlation id for the reply.
    pub fn send(
        &self,
        source: Handle,
        destination: Handle,
        kind: u32,
        session: Session,
        payload: Payload,
    ) -> Result<Session, SendError> {
        if payload.len() > MAX_MESSAGE_SIZE {
            error!(self.log, "message too large"; "destination" => handle::to_hex(destination));
            return Err(SendError {
                kind: SendErrorKind::TooLarge,
                payload,
            });
        }

        let session = if kind & TAG_ALLOCSESSION != 0 {
            debug_assert_eq!(session, 0);
            self.new_session()
        } else {
            session
        };
        let protocol = ProtocolId::from(kind);
        let source = if source == 0 { self.handle } else { source };

        if destination == 0 {
            return Ok(session);
        }

        if self.node.registry.is_remote(destination) {
            return self
                .node
                .harbor_forward(source, destination, protocol, session, payload)
                .map(|_| session);
        }

        let msg = Message::new(source, session, protocol, payload);
        match self.node.push_message(destination, msg) {
            Ok(()) => Ok(session),
            Err(msg) => Err(SendError {
                kind: SendErrorKind::InvalidDestination,
                payload: msg.payload,
            }),
        }
    }

    /// Send to an address string: `:hex` for a numeric handle, `.name` for a
    /// locally registered name, anything else is a remote name handed to the
    /// harbor hook.
    pub fn send_name(
        &self,
        source: Handle,
        addr: &str,
        kind: u32,
        session: Session,
        payload: Payload,
    ) -> Result<Session, SendError> {
        if let Some(destination) = handle::from_hex(addr) {
            return self.send(source, destination, kind, session, payload);
        }
        if let Some(name) = addr.strip_prefix('.') {
            return match self.node.registry.find_name(name) {
                Some(destination) => self.send(source, destination, kind, session, payload),
                None => Err(SendError {
                    kind: SendErrorKind::InvalidDestination,
                    payload,
                }),
            };
        }

        let session = if kind & TAG_ALLOCSESSION != 0 {
            debug_assert_eq!(session, 0);
            self.new_session()
        } else {
            session
        };
        let source = if source == 0 { self.handle } else { source };
        self.node
            .harbor_forward_name(source, addr, ProtocolId::from(kind), session, payload)
            .map(|_| session)
    }

    /// The built-in control plane; see [`crate::command`] for the verbs.
    pub fn command(self: &Arc<Self>, verb: &str, arg: &str) -> Option<String> {
        crate::command::command(self, verb, arg)
    }

    /// Register an expiry `ticks` (centiseconds) away, returning the fresh
    /// session the `RESPONSE` message will carry.
    pub fn timeout(&self, ticks: i32) -> Session {
        let session = self.new_session();
        self.node.timeout(self.handle, ticks, session);
        session
    }

    // -- runtime internals ---------------------------------------------------

    pub(crate) fn run_init(self: &Arc<Self>, args: &str) -> Result<(), InitError> {
        let mut cell = self.cell.lock().unwrap();
        cell.init(self, args)
    }

    pub(crate) fn set_initialized(&self) {
        self.initialized.store(true, Ordering::Release);
    }

    /// Dispatch one message to the module instance. The cell mutex is what
    /// makes per-context execution exclusive across workers.
    pub(crate) fn dispatch(self: &Arc<Self>, msg: Message) {
        assert!(
            self.initialized.load(Ordering::Acquire),
            "dispatch before init completed"
        );

        if let Some(file) = self.logfile.lock().unwrap().as_mut() {
            let _ = writeln!(
                file,
                "{} :{:08x} {} {} {}",
                self.node.timer.now(),
                msg.source,
                msg.protocol.0,
                msg.session,
                msg.payload.len()
            );
        }

        self.message_count.fetch_add(1, Ordering::Relaxed);
        let started = if self.node.profile {
            Some(Instant::now())
        } else {
            None
        };

        let source = msg.source;
        let session = msg.session;
        let mut cell = self.cell.lock().unwrap();
        if let Some(signal) = self.pending_signal.lock().unwrap().take() {
            cell.signal(signal);
        }
        if let Err(err) = cell.message(self, msg) {
            error!(self.log, "dispatch failed";
                   "source" => handle::to_hex(source),
                   "session" => session,
                   "error" => %err);
        }
        drop(cell);

        if let Some(started) = started {
            self.cpu_cost_micros
                .fetch_add(started.elapsed().as_micros() as u64, Ordering::Relaxed);
        }
    }

    /// Deliver an out-of-band signal. If the instance is busy the signal is
    /// parked and handed over right before its next message.
    pub(crate) fn deliver_signal(&self, signal: i32) {
        match self.cell.try_lock() {
            Ok(mut cell) => cell.signal(signal),
            Err(_) => *self.pending_signal.lock().unwrap() = Some(signal),
        }
    }

    pub(crate) fn set_endless(&self) {
        self.endless.store(true, Ordering::Relaxed);
    }

    /// Read-and-clear the endless flag (`ENDLESS` command).
    pub(crate) fn take_endless(&self) -> bool {
        self.endless.swap(false, Ordering::Relaxed)
    }

    /// Reserved services do not count towards the live total, so they never
    /// keep the node running on their own (the log service is one).
    pub(crate) fn set_reserved(&self) {
        self.reserved.store(true, Ordering::Relaxed)
    }

    pub(crate) fn is_reserved(&self) -> bool {
        self.reserved.load(Ordering::Relaxed)
    }

    /// Accumulated dispatch wall time, when the node runs with `profile`.
    pub fn cpu_cost_micros(&self) -> u64 {
        self.cpu_cost_micros.load(Ordering::Relaxed)
    }

    pub fn message_count(&self) -> u64 {
        self.message_count.load(Ordering::Relaxed)
    }

    /// Start appending a per-message log to `<logpath>/<handle>.log`.
    pub(crate) fn log_on(&self) -> bool {
        let mut logfile = self.logfile.lock().unwrap();
        if logfile.is_some() {
            return false;
        }
        let dir = self
            .node
            .env
            .get("logpath")
            .unwrap_or_else(|| ".".to_string());
        let path = format!("{}/{:08x}.log", dir, self.handle);
        match std::fs::OpenOptions::new().create(true).append(true).open(&path) {
            Ok(file) => {
                *logfile = Some(file);
                true
            }
            Err(err) => {
                error!(self.log, "cannot open message log"; "path" => path, "error" => %err);
                false
            }
        }
    }

    pub(crate) fn log_off(&self) -> bool {
        self.logfile.lock().unwrap().take().is_some()
    }

    #[cfg(test)]
    pub(crate) fn stub(node: &Arc<NodeShared>, handle: Handle) -> Arc<ServiceContext> {
        let ctx = ServiceContext::new(
            node.clone(),
            "stub",
            Box::new(crate::module::NullService),
            handle,
        );
        ctx.set_reserved();
        ctx.set_initialized();
        ctx
    }
}

impl Drop for ServiceContext {
    fn drop(&mut self) {
        // Both references are gone (registry slot cleared, last grab
        // released): flag the mailbox so queued messages reach the drop
        // handler, and stop counting this service as alive.
        if !self.is_reserved() {
            self.node.service_retired();
        }
        self.mailbox.mark_release(&self.node.global);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::NodeShared;

    #[test]
    fn test_session_wraps_to_one() {
        let node = NodeShared::for_test(0);
        let ctx = ServiceContext::stub(&node, 1);

        assert_eq!(ctx.new_session(), 1);
        assert_eq!(ctx.new_session(), 2);

        ctx.session.store(i32::MAX - 1, Ordering::Relaxed);
        assert_eq!(ctx.new_session(), i32::MAX);
        let wrapped = ctx.new_session();
        assert_eq!(wrapped, 1);
        assert!(ctx.new_session() > 0);
    }

    #[test]
    fn test_send_to_zero_discards_but_allocates() {
        let node = NodeShared::for_test(0);
        let ctx = ServiceContext::stub(&node, 1);

        let session = ctx
            .send(0, 0, ProtocolId::TEXT.alloc_session(), 0, Payload::Empty)
            .unwrap();
        assert_eq!(session, 1);
    }

    #[test]
    fn test_send_unknown_destination_returns_payload() {
        let node = NodeShared::for_test(0);
        let ctx = ServiceContext::stub(&node, 1);

        let err = ctx
            .send(0, 0xbeef, ProtocolId::TEXT.bits(), 0, Payload::text("keep me"))
            .unwrap_err();
        assert_eq!(err.kind, SendErrorKind::InvalidDestination);
        assert_eq!(err.payload.as_bytes(), b"keep me");
    }

    #[test]
    fn test_send_too_large_refused() {
        let node = NodeShared::for_test(0);
        let ctx = ServiceContext::stub(&node, 1);

        let big = Payload::from(vec![0u8; MAX_MESSAGE_SIZE + 1]);
        let err = ctx.send(0, 1, ProtocolId::TEXT.bits(), 0, big).unwrap_err();
        assert_eq!(err.kind, SendErrorKind::TooLarge);
        assert_eq!(err.payload.len(), MAX_MESSAGE_SIZE + 1);
    }

    #[test]
    fn test_remote_without_harbor_fails() {
        let node = NodeShared::for_test(1);
        let ctx = ServiceContext::stub(&node, 1 << 24 | 1);

        let remote = 5u32 << 24 | 99;
        let err = ctx
            .send(0, remote, ProtocolId::TEXT.bits(), 0, Payload::Empty)
            .unwrap_err();
        assert_eq!(err.kind, SendErrorKind::NoHarbor);
    }

    #[test]
    fn test_send_name_forms() {
        let node = NodeShared::for_test(0);
        let (handle, target) = node
            .registry
            .clone()
            .register_with(|h| ServiceContext::stub(&node, h));
        node.registry.bind_name(handle, "target");

        let sender = ServiceContext::stub(&node, 0xff);

        sender
            .send_name(0, &handle::to_hex(handle), ProtocolId::TEXT.bits(), 0, Payload::text("a"))
            .unwrap();
        sender
            .send_name(0, ".target", ProtocolId::TEXT.bits(), 0, Payload::text("b"))
            .unwrap();
        assert_eq!(target.mailbox_len(), 2);

        let err = sender
            .send_name(0, ".missing", ProtocolId::TEXT.bits(), 0, Payload::text("c"))
            .unwrap_err();
        assert_eq!(err.kind, SendErrorKind::InvalidDestination);
    }
}
