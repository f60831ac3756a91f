use crate::handle::Handle;
use crate::net::buffer::WriteBuffer;
use crate::net::slot::{Slot, SocketHolder, SocketState, MAX_SOCKET, WARNING_SIZE};
use crate::net::{SocketId, SocketMessage, UdpAddress};
use mio::net::{TcpListener, TcpStream, UdpSocket};
use mio::unix::{EventedFd, UnixReady};
use mio::{Events, Poll, PollOpt, Ready, Registration, SetReadiness, Token};
use nix::fcntl::{fcntl, FcntlArg, OFlag};
use slog::{debug, error, info, trace, warn, Logger};
use std::io;
use std::io::{Read, Write};
use std::net::{SocketAddr, ToSocketAddrs};
use std::os::unix::io::{AsRawFd, FromRawFd, RawFd};
use std::sync::atomic::{AtomicI32, AtomicUsize, Ordering};
use std::sync::mpsc::{channel, Receiver, Sender, TryRecvError};
use std::sync::{Arc, Mutex};

const CONTROL_TOKEN: Token = Token(MAX_SOCKET);
const MAX_UDP_PACKAGE: usize = 65535;

/// Dispatch sink: posts a translated event to the owning service.
pub type EventSink = Box<dyn Fn(Handle, SocketMessage) + Send>;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Priority {
    High,
    Low,
}

enum ControlRequest {
    Open {
        id: SocketId,
        owner: Handle,
        host: String,
        port: u16,
    },
    Listen {
        id: SocketId,
        owner: Handle,
        host: String,
        port: u16,
    },
    Bind {
        id: SocketId,
        owner: Handle,
        fd: RawFd,
    },
    Start {
        id: SocketId,
        owner: Handle,
    },
    Close {
        id: SocketId,
        owner: Handle,
    },
    Shutdown {
        id: SocketId,
        owner: Handle,
    },
    Send {
        id: SocketId,
        data: Box<[u8]>,
        priority: Priority,
        peer: Option<UdpAddress>,
    },
    Nodelay {
        id: SocketId,
    },
    UdpOpen {
        id: SocketId,
        owner: Handle,
        host: String,
        port: u16,
    },
    UdpConnect {
        id: SocketId,
        peer: UdpAddress,
    },
    WarnLimit {
        id: SocketId,
        bytes: usize,
    },
    TriggerWrite {
        id: SocketId,
    },
    Exit,
}

struct Shared {
    id_counter: AtomicI32,
    // Unsent-byte meters, indexed like the slot pool, read synchronously by
    // sending threads for backpressure decisions.
    meters: Vec<AtomicUsize>,
}

impl Shared {
    fn alloc_id(&self) -> SocketId {
        self.id_counter.fetch_add(1, Ordering::Relaxed) & 0x7fff_ffff
    }

    #[inline]
    fn meter(&self, id: SocketId) -> &AtomicUsize {
        &self.meters[Slot::index_of(id)]
    }

    /// Decrement a meter without wrapping; a send racing a close may try to
    /// subtract from an already reset meter.
    fn meter_sub(&self, id: SocketId, n: usize) {
        let meter = self.meter(id);
        let mut current = meter.load(Ordering::Relaxed);
        loop {
            let next = current.saturating_sub(n);
            match meter.compare_exchange_weak(current, next, Ordering::Relaxed, Ordering::Relaxed)
            {
                Ok(_) => return,
                Err(observed) => current = observed,
            }
        }
    }
}

/// Thread-safe front end of the reactor. Every operation enqueues a control
/// request and wakes the reactor; no socket state is touched from the
/// calling thread.
#[derive(Clone)]
pub struct SocketApi {
    tx: Arc<Mutex<Sender<ControlRequest>>>,
    readiness: SetReadiness,
    shared: Arc<Shared>,
}

impl SocketApi {
    fn push(&self, req: ControlRequest) {
        // A send can only fail after the reactor is gone, at which point the
        // request is moot anyway.
        let _ = self.tx.lock().unwrap().send(req);
        let _ = self.readiness.set_readiness(Ready::readable());
    }

    /// Open an outbound TCP connection. Completion (or failure) arrives as a
    /// message to `owner`.
    pub fn connect(&self, owner: Handle, host: &str, port: u16) -> SocketId {
        let id = self.shared.alloc_id();
        self.push(ControlRequest::Open {
            id,
            owner,
            host: host.to_string(),
            port,
        });
        id
    }

    /// Create a listening socket. It does not accept until started.
    pub fn listen(&self, owner: Handle, host: &str, port: u16) -> SocketId {
        let id = self.shared.alloc_id();
        self.push(ControlRequest::Listen {
            id,
            owner,
            host: host.to_string(),
            port,
        });
        id
    }

    /// Wrap an externally owned fd (stdin, a pipe end) for event delivery.
    /// The reactor takes ownership of the fd.
    pub fn bind(&self, owner: Handle, fd: RawFd) -> SocketId {
        let id = self.shared.alloc_id();
        self.push(ControlRequest::Bind { id, owner, fd });
        id
    }

    /// Begin accepting (listen sockets) or delivering (accepted sockets),
    /// assigning ownership of the socket to `owner`.
    pub fn start(&self, owner: Handle, id: SocketId) {
        self.push(ControlRequest::Start { id, owner });
    }

    /// Graceful close: pending writes drain first.
    pub fn close(&self, owner: Handle, id: SocketId) {
        self.push(ControlRequest::Close { id, owner });
    }

    /// Immediate close; pending writes are dropped.
    pub fn shutdown(&self, owner: Handle, id: SocketId) {
        self.push(ControlRequest::Shutdown { id, owner });
    }

    pub fn nodelay(&self, id: SocketId) {
        self.push(ControlRequest::Nodelay { id });
    }

    /// Queue bytes on the high-priority band. Returns the total number of
    /// unsent bytes now pending on the socket, so callers can apply
    /// backpressure when it keeps growing.
    pub fn send(&self, id: SocketId, data: Vec<u8>) -> usize {
        self.send_priority(id, data, Priority::High, None)
    }

    /// Queue bytes on the low-priority band, served only when the high band
    /// is empty.
    pub fn send_low(&self, id: SocketId, data: Vec<u8>) -> usize {
        self.send_priority(id, data, Priority::Low, None)
    }

    fn send_priority(
        &self,
        id: SocketId,
        data: Vec<u8>,
        priority: Priority,
        peer: Option<UdpAddress>,
    ) -> usize {
        let len = data.len();
        let pending = self.shared.meter(id).fetch_add(len, Ordering::Relaxed) + len;
        self.push(ControlRequest::Send {
            id,
            data: data.into_boxed_slice(),
            priority,
            peer,
        });
        pending
    }

    /// Create a UDP socket bound to `host:port`.
    pub fn udp_open(&self, owner: Handle, host: &str, port: u16) -> SocketId {
        let id = self.shared.alloc_id();
        self.push(ControlRequest::UdpOpen {
            id,
            owner,
            host: host.to_string(),
            port,
        });
        id
    }

    /// Set the default peer used by `udp_send` when none is given.
    pub fn udp_connect(&self, id: SocketId, peer: SocketAddr) {
        self.push(ControlRequest::UdpConnect {
            id,
            peer: UdpAddress(peer),
        });
    }

    /// Send one datagram. Without an explicit peer the socket's connected
    /// peer is used; a datagram with neither is dropped with an error event.
    pub fn udp_send(&self, id: SocketId, peer: Option<UdpAddress>, data: Vec<u8>) -> usize {
        self.send_priority(id, data, Priority::High, peer)
    }

    /// Move the backpressure warning boundary for one socket.
    pub fn warn_limit(&self, id: SocketId, bytes: usize) {
        self.push(ControlRequest::WarnLimit { id, bytes });
    }

    /// Ask the reactor to re-arm write interest (used after an explicit
    /// pause of the write side).
    pub fn trigger_write(&self, id: SocketId) {
        self.push(ControlRequest::TriggerWrite { id });
    }

    /// Unsent bytes currently pending on `id`.
    pub fn unsent(&self, id: SocketId) -> usize {
        self.shared.meter(id).load(Ordering::Relaxed)
    }

    /// Stop the reactor thread.
    pub fn exit(&self) {
        self.push(ControlRequest::Exit);
    }
}

/// The reactor: single thread, sole owner of every socket slot.
pub struct SocketServer {
    poll: Poll,
    events: Events,
    rx: Receiver<ControlRequest>,
    // Held so the control wakeup stays registered.
    _registration: Registration,
    control_ready: SetReadiness,
    slots: Vec<Slot>,
    shared: Arc<Shared>,
    sink: Option<EventSink>,
    log: Logger,
}

/// Build the control channel pair: the cloneable caller-side API and the
/// reactor to run on its own thread.
pub fn pair(log: Logger) -> io::Result<(SocketApi, SocketServer)> {
    let poll = Poll::new()?;
    let (registration, control_ready) = Registration::new2();
    poll.register(
        &registration,
        CONTROL_TOKEN,
        Ready::readable(),
        PollOpt::level(),
    )?;

    let (tx, rx) = channel();
    let shared = Arc::new(Shared {
        id_counter: AtomicI32::new(1),
        meters: (0..MAX_SOCKET).map(|_| AtomicUsize::new(0)).collect(),
    });

    let api = SocketApi {
        tx: Arc::new(Mutex::new(tx)),
        readiness: control_ready.clone(),
        shared: shared.clone(),
    };
    let server = SocketServer {
        poll,
        events: Events::with_capacity(1024),
        rx,
        _registration: registration,
        control_ready,
        slots: (0..MAX_SOCKET).map(|i| Slot::vacant(i as SocketId)).collect(),
        shared,
        sink: None,
        log,
    };
    Ok((api, server))
}

impl SocketServer {
    /// The reactor loop. Control requests drain ahead of every wait so no
    /// caller blocks behind kernel events.
    pub fn run(mut self, sink: EventSink) {
        self.sink = Some(sink);
        info!(self.log, "socket server started");

        loop {
            loop {
                match self.rx.try_recv() {
                    Ok(ControlRequest::Exit) => {
                        info!(self.log, "socket server exiting");
                        return;
                    }
                    Ok(req) => self.handle_request(req),
                    Err(TryRecvError::Empty) => break,
                    Err(TryRecvError::Disconnected) => return,
                }
            }

            if let Err(err) = self.poll.poll(&mut self.events, None) {
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                error!(self.log, "poll failed"; "error" => %err);
                return;
            }

            let events: Vec<(Token, Ready)> = self
                .events
                .iter()
                .map(|e| (e.token(), e.readiness()))
                .collect();
            for (token, ready) in events {
                if token == CONTROL_TOKEN {
                    // Clear before draining so a racing sender re-arms it.
                    let _ = self.control_ready.set_readiness(Ready::empty());
                    continue;
                }
                self.handle_event(token.0, ready);
            }
        }
    }

    #[inline]
    fn emit(&self, owner: Handle, msg: SocketMessage) {
        trace!(self.log, "socket event"; "owner" => owner, "msg" => ?msg);
        if let Some(sink) = &self.sink {
            sink(owner, msg);
        }
    }

    /// Claim the slot an id maps to. In-flight collisions (the pool wrapped
    /// around onto a live slot) are detected here and refused.
    fn claim(&mut self, id: SocketId, owner: Handle) -> Option<usize> {
        let index = Slot::index_of(id);
        if self.slots[index].state != SocketState::Invalid {
            warn!(self.log, "socket pool collision"; "id" => id);
            self.emit(
                owner,
                SocketMessage::Error {
                    id,
                    reason: "socket pool collision".to_string(),
                },
            );
            return None;
        }
        self.slots[index].reserve(id, owner);
        Some(index)
    }

    /// Look up a live slot by full id; stale ids miss.
    fn lookup(&self, id: SocketId) -> Option<usize> {
        let index = Slot::index_of(id);
        let slot = &self.slots[index];
        if slot.id == id && slot.state != SocketState::Invalid {
            Some(index)
        } else {
            None
        }
    }

    fn handle_request(&mut self, req: ControlRequest) {
        match req {
            ControlRequest::Open {
                id,
                owner,
                host,
                port,
            } => self.open_socket(id, owner, &host, port),
            ControlRequest::Listen {
                id,
                owner,
                host,
                port,
            } => self.listen_socket(id, owner, &host, port),
            ControlRequest::Bind { id, owner, fd } => self.bind_fd(id, owner, fd),
            ControlRequest::Start { id, owner } => self.start_socket(id, owner),
            ControlRequest::Close { id, owner } => self.close_socket(id, owner, false),
            ControlRequest::Shutdown { id, owner } => self.close_socket(id, owner, true),
            ControlRequest::Send {
                id,
                data,
                priority,
                peer,
            } => self.append_send(id, data, priority, peer),
            ControlRequest::Nodelay { id } => {
                if let Some(index) = self.lookup(id) {
                    if let Some(SocketHolder::Stream(stream)) = &self.slots[index].holder {
                        let _ = stream.set_nodelay(true);
                    }
                }
            }
            ControlRequest::UdpOpen {
                id,
                owner,
                host,
                port,
            } => self.udp_open(id, owner, &host, port),
            ControlRequest::UdpConnect { id, peer } => {
                if let Some(index) = self.lookup(id) {
                    self.slots[index].udp_peer = Some(peer);
                }
            }
            ControlRequest::WarnLimit { id, bytes } => {
                if let Some(index) = self.lookup(id) {
                    self.slots[index].warn_size = bytes;
                }
            }
            ControlRequest::TriggerWrite { id } => {
                if let Some(index) = self.lookup(id) {
                    if self.slots[index].has_pending_writes() {
                        self.slots[index].writing = true;
                        self.update_interest(index);
                    }
                }
            }
            ControlRequest::Exit => unreachable!("handled by the run loop"),
        }
    }

    fn open_socket(&mut self, id: SocketId, owner: Handle, host: &str, port: u16) {
        let index = match self.claim(id, owner) {
            Some(index) => index,
            None => return,
        };

        // Blocking resolution on the reactor thread; connects are rare
        // next to traffic.
        let addrs: Vec<SocketAddr> = match (host, port).to_socket_addrs() {
            Ok(addrs) => addrs.collect(),
            Err(err) => {
                self.slots[index].recycle();
                self.emit(
                    owner,
                    SocketMessage::Error {
                        id,
                        reason: format!("resolve {}: {}", host, err),
                    },
                );
                return;
            }
        };

        for addr in addrs {
            match TcpStream::connect(&addr) {
                Ok(stream) => {
                    let slot = &mut self.slots[index];
                    slot.holder = Some(SocketHolder::Stream(stream));
                    slot.state = SocketState::Connecting;
                    // Writable readiness resolves the handshake.
                    self.register(index, Ready::writable());
                    return;
                }
                Err(err) => {
                    debug!(self.log, "connect attempt failed";
                           "id" => id, "addr" => %addr, "error" => %err);
                }
            }
        }

        self.slots[index].recycle();
        self.emit(
            owner,
            SocketMessage::Error {
                id,
                reason: format!("connect {}:{} failed", host, port),
            },
        );
    }

    fn listen_socket(&mut self, id: SocketId, owner: Handle, host: &str, port: u16) {
        let index = match self.claim(id, owner) {
            Some(index) => index,
            None => return,
        };

        let bound = (host, port)
            .to_socket_addrs()
            .ok()
            .and_then(|mut addrs| addrs.next())
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "unresolvable address"))
            .and_then(|addr| TcpListener::bind(&addr));

        match bound {
            Ok(listener) => {
                let slot = &mut self.slots[index];
                slot.holder = Some(SocketHolder::Listener(listener));
                // Not accepting until the owner starts it.
                slot.state = SocketState::Plisten;
            }
            Err(err) => {
                self.slots[index].recycle();
                self.emit(
                    owner,
                    SocketMessage::Error {
                        id,
                        reason: format!("listen {}:{}: {}", host, port, err),
                    },
                );
            }
        }
    }

    fn bind_fd(&mut self, id: SocketId, owner: Handle, fd: RawFd) {
        let index = match self.claim(id, owner) {
            Some(index) => index,
            None => return,
        };

        if let Ok(flags) = fcntl(fd, FcntlArg::F_GETFL) {
            let mut oflags = OFlag::from_bits_truncate(flags);
            oflags.insert(OFlag::O_NONBLOCK);
            let _ = fcntl(fd, FcntlArg::F_SETFL(oflags));
        }

        let file = unsafe { std::fs::File::from_raw_fd(fd) };
        let slot = &mut self.slots[index];
        slot.holder = Some(SocketHolder::Raw(file));
        slot.state = SocketState::Bind;
        self.register(index, Ready::readable());
        self.emit(
            owner,
            SocketMessage::Connect {
                id,
                addr: "binding".to_string(),
            },
        );
    }

    fn udp_open(&mut self, id: SocketId, owner: Handle, host: &str, port: u16) {
        let index = match self.claim(id, owner) {
            Some(index) => index,
            None => return,
        };

        let bound = (host, port)
            .to_socket_addrs()
            .ok()
            .and_then(|mut addrs| addrs.next())
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "unresolvable address"))
            .and_then(|addr| UdpSocket::bind(&addr));

        match bound {
            Ok(socket) => {
                let addr = socket
                    .local_addr()
                    .map(|a| a.to_string())
                    .unwrap_or_default();
                let slot = &mut self.slots[index];
                slot.holder = Some(SocketHolder::Udp(socket));
                slot.state = SocketState::Connected;
                self.register(index, Ready::readable());
                self.emit(owner, SocketMessage::Connect { id, addr });
            }
            Err(err) => {
                self.slots[index].recycle();
                self.emit(
                    owner,
                    SocketMessage::Error {
                        id,
                        reason: format!("udp bind {}:{}: {}", host, port, err),
                    },
                );
            }
        }
    }

    fn start_socket(&mut self, id: SocketId, owner: Handle) {
        let index = match self.lookup(id) {
            Some(index) => index,
            None => {
                self.emit(
                    owner,
                    SocketMessage::Error {
                        id,
                        reason: "invalid socket".to_string(),
                    },
                );
                return;
            }
        };

        let state = self.slots[index].state;
        match state {
            SocketState::Plisten => {
                let slot = &mut self.slots[index];
                slot.owner = owner;
                slot.state = SocketState::Listen;
                let addr = match &slot.holder {
                    Some(SocketHolder::Listener(listener)) => listener
                        .local_addr()
                        .map(|a| a.to_string())
                        .unwrap_or_default(),
                    _ => String::new(),
                };
                self.register(index, Ready::readable());
                self.emit(owner, SocketMessage::Connect { id, addr });
            }
            SocketState::Paccept => {
                let slot = &mut self.slots[index];
                slot.owner = owner;
                slot.state = SocketState::Connected;
                self.register(index, Ready::readable());
                self.emit(
                    owner,
                    SocketMessage::Connect {
                        id,
                        addr: "start".to_string(),
                    },
                );
            }
            SocketState::Connected | SocketState::Listen => {
                // Transfer ownership of an already started socket.
                self.slots[index].owner = owner;
                self.emit(
                    owner,
                    SocketMessage::Connect {
                        id,
                        addr: "transfer".to_string(),
                    },
                );
            }
            _ => {
                self.emit(
                    owner,
                    SocketMessage::Error {
                        id,
                        reason: format!("cannot start socket in state {:?}", state),
                    },
                );
            }
        }
    }

    fn close_socket(&mut self, id: SocketId, owner: Handle, force: bool) {
        let index = match self.lookup(id) {
            Some(index) => index,
            None => {
                // Closing a dead socket succeeds trivially.
                self.emit(owner, SocketMessage::Close { id });
                return;
            }
        };

        if !force && self.slots[index].has_pending_writes() {
            // Drain what we can; if something is still pending the socket
            // lingers in half-close until the write side empties.
            self.flush_writes(index);
            if self.lookup(id).is_some() && self.slots[index].has_pending_writes() {
                let slot = &mut self.slots[index];
                slot.state = SocketState::Halfclose;
                slot.writing = true;
                self.update_interest(index);
                return;
            }
            if self.lookup(id).is_none() {
                // flush hit an error and already recycled the slot
                return;
            }
        }

        let owner_handle = self.slots[index].owner;
        self.force_close(index);
        self.emit(owner_handle, SocketMessage::Close { id });
    }

    fn append_send(
        &mut self,
        id: SocketId,
        data: Box<[u8]>,
        priority: Priority,
        peer: Option<UdpAddress>,
    ) {
        let len = data.len();
        let index = match self.lookup(id) {
            Some(index) => index,
            None => {
                // The socket died between the caller's send and now.
                self.shared.meter_sub(id, len);
                return;
            }
        };

        let state = self.slots[index].state;
        let is_listener = matches!(
            self.slots[index].holder,
            Some(SocketHolder::Listener(_)) | None
        );
        if state == SocketState::Halfclose || is_listener {
            self.shared.meter_sub(id, len);
            return;
        }

        let slot = &mut self.slots[index];
        let buffer = WriteBuffer::new(data, peer.or(slot.udp_peer));
        match priority {
            Priority::High => slot.high.push(buffer),
            Priority::Low => slot.low.push(buffer),
        }
        slot.wb_size += len;

        if slot.warn_size == 0 {
            slot.warn_size = WARNING_SIZE;
        }
        let mut warn = None;
        if slot.wb_size >= slot.warn_size {
            slot.warn_size *= 2;
            warn = Some((slot.owner, slot.wb_size / 1024));
        }

        // Sockets mid-handshake keep the queue; writable interest is already
        // armed and the flush happens on completion.
        if state == SocketState::Connected || state == SocketState::Bind {
            if !slot.writing {
                slot.writing = true;
                self.update_interest(index);
            }
        }

        if let Some((owner, pending_kb)) = warn {
            self.emit(owner, SocketMessage::Warning { id, pending_kb });
        }
    }

    fn handle_event(&mut self, index: usize, ready: Ready) {
        if index >= MAX_SOCKET {
            return;
        }
        let state = self.slots[index].state;
        if state == SocketState::Invalid || state == SocketState::Reserve {
            // Stale event for a recycled slot.
            return;
        }

        if UnixReady::from(ready).is_error() {
            let slot = &self.slots[index];
            let reason = match &slot.holder {
                Some(SocketHolder::Stream(stream)) => match stream.take_error() {
                    Ok(Some(err)) => err.to_string(),
                    _ => "socket error".to_string(),
                },
                _ => "socket error".to_string(),
            };
            let (id, owner) = (slot.id, slot.owner);
            self.force_close(index);
            self.emit(owner, SocketMessage::Error { id, reason });
            return;
        }

        if ready.is_readable() {
            match self.slots[index].state {
                SocketState::Listen => self.accept_ready(index),
                SocketState::Connected | SocketState::Bind => match self.slots[index].holder {
                    Some(SocketHolder::Udp(_)) => self.read_udp(index),
                    _ => self.read_stream(index),
                },
                // Half-closed sockets no longer deliver reads.
                _ => {}
            }
        }

        // The slot may have been recycled by the read path.
        if ready.is_writable() && self.slots[index].state != SocketState::Invalid {
            if self.slots[index].state == SocketState::Connecting {
                self.finish_connect(index);
            } else {
                self.flush_writes(index);
            }
        }
    }

    fn accept_ready(&mut self, index: usize) {
        let accepted = match &self.slots[index].holder {
            Some(SocketHolder::Listener(listener)) => listener.accept(),
            _ => return,
        };
        let (listen_id, listen_owner) = (self.slots[index].id, self.slots[index].owner);

        match accepted {
            Ok((stream, addr)) => {
                let peer = self.shared.alloc_id();
                let peer_index = match self.claim(peer, listen_owner) {
                    Some(peer_index) => peer_index,
                    None => return,
                };
                let slot = &mut self.slots[peer_index];
                slot.holder = Some(SocketHolder::Stream(stream));
                // Parked until the owner decides who reads it.
                slot.state = SocketState::Paccept;
                self.emit(
                    listen_owner,
                    SocketMessage::Accept {
                        id: listen_id,
                        peer,
                        addr: addr.to_string(),
                    },
                );
            }
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {}
            Err(err) => {
                // Transient accept failures (EMFILE and friends) do not kill
                // the listener.
                self.emit(
                    listen_owner,
                    SocketMessage::Error {
                        id: listen_id,
                        reason: format!("accept: {}", err),
                    },
                );
            }
        }
    }

    fn finish_connect(&mut self, index: usize) {
        let (id, owner) = (self.slots[index].id, self.slots[index].owner);
        let outcome = match &self.slots[index].holder {
            Some(SocketHolder::Stream(stream)) => match stream.take_error() {
                Ok(None) => Ok(stream
                    .peer_addr()
                    .map(|a| a.to_string())
                    .unwrap_or_default()),
                Ok(Some(err)) => Err(err),
                Err(err) => Err(err),
            },
            _ => return,
        };

        match outcome {
            Ok(addr) => {
                let slot = &mut self.slots[index];
                slot.state = SocketState::Connected;
                slot.writing = slot.has_pending_writes();
                self.update_interest(index);
                self.emit(owner, SocketMessage::Connect { id, addr });
            }
            Err(err) => {
                self.force_close(index);
                self.emit(
                    owner,
                    SocketMessage::Error {
                        id,
                        reason: format!("connect: {}", err),
                    },
                );
            }
        }
    }

    fn read_stream(&mut self, index: usize) {
        let hint = self.slots[index].read_hint.size();
        let mut buf = vec![0u8; hint];
        let result = match &mut self.slots[index].holder {
            Some(SocketHolder::Stream(stream)) => stream.read(&mut buf),
            Some(SocketHolder::Raw(file)) => file.read(&mut buf),
            _ => return,
        };
        let (id, owner) = (self.slots[index].id, self.slots[index].owner);

        match result {
            Ok(0) => {
                // Orderly shutdown by the peer.
                self.force_close(index);
                self.emit(owner, SocketMessage::Close { id });
            }
            Ok(n) => {
                self.slots[index].read_hint.adjust(n);
                buf.truncate(n);
                self.emit(
                    owner,
                    SocketMessage::Data {
                        id,
                        data: buf.into_boxed_slice(),
                    },
                );
            }
            Err(err)
                if err.kind() == io::ErrorKind::WouldBlock
                    || err.kind() == io::ErrorKind::Interrupted => {}
            Err(err) => {
                self.force_close(index);
                self.emit(
                    owner,
                    SocketMessage::Error {
                        id,
                        reason: format!("read: {}", err),
                    },
                );
            }
        }
    }

    fn read_udp(&mut self, index: usize) {
        let mut buf = vec![0u8; MAX_UDP_PACKAGE];
        let result = match &self.slots[index].holder {
            Some(SocketHolder::Udp(socket)) => socket.recv_from(&mut buf),
            _ => return,
        };
        let (id, owner) = (self.slots[index].id, self.slots[index].owner);

        match result {
            Ok((n, from)) => {
                buf.truncate(n);
                self.emit(
                    owner,
                    SocketMessage::Udp {
                        id,
                        data: buf.into_boxed_slice(),
                        from: UdpAddress(from),
                    },
                );
            }
            Err(err)
                if err.kind() == io::ErrorKind::WouldBlock
                    || err.kind() == io::ErrorKind::Interrupted => {}
            Err(err) => {
                warn!(self.log, "udp recv failed"; "id" => id, "error" => %err);
            }
        }
    }

    /// Write at most one chunk from the socket's queues, high band first.
    /// Leaving the remainder for the next loop iteration stops one busy
    /// socket from starving the rest.
    fn flush_writes(&mut self, index: usize) {
        let (id, owner) = (self.slots[index].id, self.slots[index].owner);

        let write_result = {
            let slot = &mut self.slots[index];
            let Slot {
                ref mut high,
                ref mut low,
                ref mut holder,
                ref mut wb_size,
                ..
            } = *slot;
            let list = if !high.is_empty() { high } else { low };
            match list.head() {
                Some(head) => {
                    let result = match holder {
                        Some(SocketHolder::Stream(stream)) => stream.write(head.remaining()),
                        Some(SocketHolder::Raw(file)) => file.write(head.remaining()),
                        Some(SocketHolder::Udp(socket)) => match head.udp_peer {
                            Some(peer) => socket.send_to(head.remaining(), &peer.0),
                            None => {
                                // Un-addressed datagram: drop it.
                                Ok(head.remaining().len())
                            }
                        },
                        _ => return,
                    };
                    match result {
                        Ok(n) => {
                            *wb_size -= n;
                            if head.advance(n) {
                                list.pop();
                            }
                            Ok(n)
                        }
                        Err(err) => Err(err),
                    }
                }
                None => Ok(0),
            }
        };

        match write_result {
            Ok(n) => {
                if n > 0 {
                    self.shared.meter_sub(id, n);
                }
                if !self.slots[index].has_pending_writes() {
                    if self.slots[index].state == SocketState::Halfclose {
                        self.force_close(index);
                        self.emit(owner, SocketMessage::Close { id });
                    } else {
                        self.slots[index].writing = false;
                        self.update_interest(index);
                    }
                }
            }
            Err(err)
                if err.kind() == io::ErrorKind::WouldBlock
                    || err.kind() == io::ErrorKind::Interrupted => {}
            Err(err) => {
                self.force_close(index);
                self.emit(
                    owner,
                    SocketMessage::Error {
                        id,
                        reason: format!("write: {}", err),
                    },
                );
            }
        }
    }

    fn register(&mut self, index: usize, ready: Ready) {
        let slot = &mut self.slots[index];
        let token = Token(index);
        let result = match &slot.holder {
            Some(SocketHolder::Stream(stream)) => {
                self.poll.register(stream, token, ready, PollOpt::level())
            }
            Some(SocketHolder::Listener(listener)) => {
                self.poll.register(listener, token, ready, PollOpt::level())
            }
            Some(SocketHolder::Udp(socket)) => {
                self.poll.register(socket, token, ready, PollOpt::level())
            }
            Some(SocketHolder::Raw(file)) => {
                let fd = file.as_raw_fd();
                self.poll
                    .register(&EventedFd(&fd), token, ready, PollOpt::level())
            }
            None => return,
        };
        match result {
            Ok(()) => slot.registered = true,
            Err(err) => error!(self.log, "register failed"; "id" => slot.id, "error" => %err),
        }
    }

    /// Re-register with the readiness set the slot's state calls for.
    fn update_interest(&mut self, index: usize) {
        let slot = &self.slots[index];
        if !slot.registered {
            return;
        }
        let mut ready = Ready::empty();
        if slot.state != SocketState::Halfclose {
            ready |= Ready::readable();
        }
        if slot.writing {
            ready |= Ready::writable();
        }
        let token = Token(index);
        let result = match &slot.holder {
            Some(SocketHolder::Stream(stream)) => {
                self.poll.reregister(stream, token, ready, PollOpt::level())
            }
            Some(SocketHolder::Listener(listener)) => {
                self.poll
                    .reregister(listener, token, ready, PollOpt::level())
            }
            Some(SocketHolder::Udp(socket)) => {
                self.poll.reregister(socket, token, ready, PollOpt::level())
            }
            Some(SocketHolder::Raw(file)) => {
                let fd = file.as_raw_fd();
                self.poll
                    .reregister(&EventedFd(&fd), token, ready, PollOpt::level())
            }
            None => return,
        };
        if let Err(err) = result {
            error!(self.log, "reregister failed"; "id" => slot.id, "error" => %err);
        }
    }

    /// Tear the socket down and recycle the slot. No message is emitted
    /// here; callers decide between `Close` and `Error`.
    fn force_close(&mut self, index: usize) {
        {
            let slot = &self.slots[index];
            if slot.registered {
                let _ = match &slot.holder {
                    Some(SocketHolder::Stream(stream)) => self.poll.deregister(stream),
                    Some(SocketHolder::Listener(listener)) => self.poll.deregister(listener),
                    Some(SocketHolder::Udp(socket)) => self.poll.deregister(socket),
                    Some(SocketHolder::Raw(file)) => {
                        let fd = file.as_raw_fd();
                        self.poll.deregister(&EventedFd(&fd))
                    }
                    None => Ok(()),
                };
            }
        }
        let id = self.slots[index].id;
        self.shared.meter(id).store(0, Ordering::Relaxed);
        self.slots[index].recycle();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use slog::o;
    use std::sync::mpsc;
    use std::time::Duration;

    struct Harness {
        api: SocketApi,
        rx: mpsc::Receiver<(Handle, SocketMessage)>,
        thread: Option<std::thread::JoinHandle<()>>,
    }

    impl Harness {
        fn new() -> Harness {
            let log = Logger::root(slog::Discard, o!());
            let (api, server) = pair(log).unwrap();
            let (tx, rx) = mpsc::channel();
            let thread = std::thread::spawn(move || {
                server.run(Box::new(move |owner, msg| {
                    let _ = tx.send((owner, msg));
                }));
            });
            Harness {
                api,
                rx,
                thread: Some(thread),
            }
        }

        /// Wait for the next event matching the predicate, skipping others.
        fn expect<F, T>(&self, what: &str, mut select: F) -> T
        where
            F: FnMut(Handle, &SocketMessage) -> Option<T>,
        {
            let deadline = std::time::Instant::now() + Duration::from_secs(5);
            loop {
                let remaining = deadline
                    .checked_duration_since(std::time::Instant::now())
                    .unwrap_or_else(|| panic!("timed out waiting for {}", what));
                let (owner, msg) = self
                    .rx
                    .recv_timeout(remaining)
                    .unwrap_or_else(|_| panic!("timed out waiting for {}", what));
                if let Some(out) = select(owner, &msg) {
                    return out;
                }
            }
        }
    }

    impl Drop for Harness {
        fn drop(&mut self) {
            self.api.exit();
            if let Some(thread) = self.thread.take() {
                let _ = thread.join();
            }
        }
    }

    fn port_of(addr: &str) -> u16 {
        addr.rsplit(':').next().unwrap().parse().unwrap()
    }

    #[test]
    fn test_tcp_end_to_end() {
        let h = Harness::new();

        // Listen, then start accepting.
        let lid = h.api.listen(1, "127.0.0.1", 0);
        h.api.start(1, lid);
        let listen_addr = h.expect("listen start", |owner, msg| match msg {
            SocketMessage::Connect { id, addr } if *id == lid && owner == 1 => {
                Some(addr.clone())
            }
            _ => None,
        });
        let port = port_of(&listen_addr);

        // Outbound connect completes against the listener.
        let cid = h.api.connect(2, "127.0.0.1", port);
        let accepted = h.expect("accept", |owner, msg| match msg {
            SocketMessage::Accept { id, peer, .. } if *id == lid && owner == 1 => Some(*peer),
            _ => None,
        });
        h.expect("connect", |owner, msg| match msg {
            SocketMessage::Connect { id, .. } if *id == cid && owner == 2 => Some(()),
            _ => None,
        });

        // Adopt the accepted socket under a different owner.
        h.api.start(3, accepted);
        h.expect("adopted", |owner, msg| match msg {
            SocketMessage::Connect { id, .. } if *id == accepted && owner == 3 => Some(()),
            _ => None,
        });

        // Data both ways.
        h.api.send(cid, b"ping".to_vec());
        let ping = h.expect("ping", |owner, msg| match msg {
            SocketMessage::Data { id, data } if *id == accepted && owner == 3 => {
                Some(data.to_vec())
            }
            _ => None,
        });
        assert_eq!(ping, b"ping");

        h.api.send(accepted, b"pong".to_vec());
        let pong = h.expect("pong", |owner, msg| match msg {
            SocketMessage::Data { id, data } if *id == cid && owner == 2 => Some(data.to_vec()),
            _ => None,
        });
        assert_eq!(pong, b"pong");

        // Close one side; the peer observes the shutdown.
        h.api.close(2, cid);
        h.expect("local close", |owner, msg| match msg {
            SocketMessage::Close { id } if *id == cid && owner == 2 => Some(()),
            _ => None,
        });
        h.expect("peer close", |owner, msg| match msg {
            SocketMessage::Close { id } if *id == accepted && owner == 3 => Some(()),
            _ => None,
        });
    }

    #[test]
    fn test_connect_refused_reports_error() {
        let h = Harness::new();

        // Grab a port that is definitely closed by binding and dropping it.
        let probe = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = probe.local_addr().unwrap().port();
        drop(probe);

        let cid = h.api.connect(4, "127.0.0.1", port);
        h.expect("refused", |owner, msg| match msg {
            SocketMessage::Error { id, .. } if *id == cid && owner == 4 => Some(()),
            _ => None,
        });
    }

    #[test]
    fn test_udp_exchange() {
        let h = Harness::new();

        let a = h.api.udp_open(10, "127.0.0.1", 0);
        let a_addr = h.expect("udp a", |owner, msg| match msg {
            SocketMessage::Connect { id, addr } if *id == a && owner == 10 => Some(addr.clone()),
            _ => None,
        });
        let b = h.api.udp_open(11, "127.0.0.1", 0);
        let b_addr = h.expect("udp b", |owner, msg| match msg {
            SocketMessage::Connect { id, addr } if *id == b && owner == 11 => Some(addr.clone()),
            _ => None,
        });

        let peer = UdpAddress(b_addr.parse().unwrap());
        h.api.udp_send(a, Some(peer), b"dgram".to_vec());
        let (data, from) = h.expect("datagram", |owner, msg| match msg {
            SocketMessage::Udp { id, data, from } if *id == b && owner == 11 => {
                Some((data.to_vec(), *from))
            }
            _ => None,
        });
        assert_eq!(data, b"dgram");
        assert_eq!(from.0.port(), port_of(&a_addr));

        // The connected-peer default works without an explicit address.
        h.api.udp_connect(b, a_addr.parse().unwrap());
        h.api.udp_send(b, None, b"back".to_vec());
        let back = h.expect("reply datagram", |owner, msg| match msg {
            SocketMessage::Udp { id, data, .. } if *id == a && owner == 10 => Some(data.to_vec()),
            _ => None,
        });
        assert_eq!(back, b"back");
    }

    #[test]
    fn test_unsent_meter_drains() {
        let h = Harness::new();

        let lid = h.api.listen(1, "127.0.0.1", 0);
        h.api.start(1, lid);
        let addr = h.expect("listen", |owner, msg| match msg {
            SocketMessage::Connect { id, addr } if *id == lid && owner == 1 => {
                Some(addr.clone())
            }
            _ => None,
        });
        let cid = h.api.connect(2, "127.0.0.1", port_of(&addr));
        h.expect("connect", |owner, msg| match msg {
            SocketMessage::Connect { id, .. } if *id == cid && owner == 2 => Some(()),
            _ => None,
        });

        let pending = h.api.send(cid, vec![7u8; 256]);
        assert!(pending >= 256);

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while h.api.unsent(cid) > 0 {
            assert!(std::time::Instant::now() < deadline, "write never drained");
            std::thread::sleep(Duration::from_millis(5));
        }
    }
}
