//! The session manager: every listener and connection in one place,
//! driven by reactor readiness and surfaced to the embedding as callbacks.
//!
//! All of this runs on the main thread. Callbacks receive `&mut
//! SessionManager` so they can queue sends or closes from inside a
//! dispatch; removals are deferred to the end of the current event so a
//! callback never pulls the socket out from under its own frame.

use crate::adapter::PlainIo;
use crate::options::{apply_stream_options, resolve};
use crate::socket::{ConnState, ConnType, OverflowPolicy, Socket, SocketStats};
use crate::{CloseReason, CodecKind, ConnId, NetError};
use engine_buffer::{DEFAULT_CHUNK_CAPACITY, DEFAULT_CHUNK_MAX};
use io_reactor::{BackendKind, Event, Interest, Reactor, TimerId};
use protocol_framing::FramerKind;
use socket2::{Domain, Protocol, SockRef, Type};
use std::collections::HashMap;
use std::io;
use std::net::{SocketAddr, TcpListener};
use std::os::unix::io::{AsRawFd, OwnedFd, RawFd};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Callbacks dispatched on the main thread, one at a time, never
/// concurrently. Each receives the manager so it can act on connections
/// mid-dispatch. Re-entering `poll_once` from a callback is not possible:
/// the handler itself is mutably borrowed for the duration.
pub trait EventHandler {
    fn on_accept(&mut self, net: &mut SessionManager, conn_id: ConnId, peer: SocketAddr) {
        let _ = (net, conn_id, peer);
    }

    fn on_connect(&mut self, net: &mut SessionManager, conn_id: ConnId, result: io::Result<()>) {
        let _ = (net, conn_id, result);
    }

    fn on_message(&mut self, net: &mut SessionManager, conn_id: ConnId, msg: &[u8]);

    fn on_close(&mut self, net: &mut SessionManager, conn_id: ConnId, reason: CloseReason) {
        let _ = (net, conn_id, reason);
    }
}

/// Knobs for the session layer, applied to new connections.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub backend: BackendKind,
    pub chunk_capacity: usize,
    pub send_chunk_max: usize,
    pub recv_chunk_max: usize,
    pub overflow: OverflowPolicy,
    pub framer: FramerKind,
    /// How long a flushing close may keep draining before the socket is
    /// terminated anyway.
    pub flush_grace: Duration,
    /// TCP_USER_TIMEOUT for every stream, when set.
    pub user_timeout: Option<Duration>,
    pub listen_backlog: i32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::default(),
            chunk_capacity: DEFAULT_CHUNK_CAPACITY,
            send_chunk_max: DEFAULT_CHUNK_MAX,
            recv_chunk_max: DEFAULT_CHUNK_MAX,
            overflow: OverflowPolicy::default(),
            framer: FramerKind::default(),
            flush_grace: Duration::from_secs(5),
            user_timeout: Some(Duration::from_secs(30)),
            listen_backlog: 1024,
        }
    }
}

struct ListenerState {
    listener: TcpListener,
    framer: FramerKind,
    conn_type: ConnType,
}

enum Endpoint {
    Listener(ListenerState),
    Conn(Socket),
}

impl Endpoint {
    fn raw_fd(&self) -> RawFd {
        match self {
            Endpoint::Listener(l) => l.listener.as_raw_fd(),
            Endpoint::Conn(s) => s.raw_fd(),
        }
    }
}

/// Owns the reactor and every endpoint; the embedding's window into the
/// networking core.
pub struct SessionManager {
    reactor: Reactor,
    cfg: SessionConfig,
    endpoints: HashMap<ConnId, Endpoint>,
    by_fd: HashMap<RawFd, ConnId>,
    /// Flush-grace timers for closing sockets, both directions.
    close_timers: HashMap<TimerId, ConnId>,
    timer_of: HashMap<ConnId, TimerId>,
    /// Endpoints marked dead during dispatch, removed at `reap`.
    doomed: Vec<(ConnId, CloseReason)>,
    next_conn_id: u64,
    events: Vec<Event>,
}

impl SessionManager {
    pub fn new(cfg: SessionConfig) -> io::Result<Self> {
        let reactor = Reactor::new(cfg.backend)?;
        info!(backend = reactor.backend_name(), "session manager started");
        Ok(Self {
            reactor,
            cfg,
            endpoints: HashMap::new(),
            by_fd: HashMap::new(),
            close_timers: HashMap::new(),
            timer_of: HashMap::new(),
            doomed: Vec::new(),
            next_conn_id: 0,
            events: Vec::new(),
        })
    }

    pub fn backend_name(&self) -> &'static str {
        self.reactor.backend_name()
    }

    /// Direct reactor access, for timers and worker wake slots.
    pub fn reactor_mut(&mut self) -> &mut Reactor {
        &mut self.reactor
    }

    fn next_id(&mut self) -> ConnId {
        self.next_conn_id += 1;
        ConnId(self.next_conn_id)
    }

    // ========================================================================
    // Embedding API
    // ========================================================================

    /// Bind a listener with the default framer, accepting client links.
    pub fn listen(&mut self, host: &str, port: u16) -> io::Result<ConnId> {
        self.listen_with(host, port, self.cfg.framer, ConnType::ClientServer)
    }

    pub fn listen_with(
        &mut self,
        host: &str,
        port: u16,
        framer: FramerKind,
        conn_type: ConnType,
    ) -> io::Result<ConnId> {
        let addrs = resolve(host, port)?;
        let mut last_err = io::Error::new(io::ErrorKind::NotFound, "no address bound");
        for addr in addrs {
            match Self::bind_listener(addr, self.cfg.listen_backlog) {
                Ok(listener) => {
                    let conn_id = self.next_id();
                    let fd = listener.as_raw_fd();
                    self.by_fd.insert(fd, conn_id);
                    self.endpoints.insert(
                        conn_id,
                        Endpoint::Listener(ListenerState {
                            listener,
                            framer,
                            conn_type,
                        }),
                    );
                    self.reactor.modify_interest(fd, Interest::READ)?;
                    info!(conn = %conn_id, %addr, "listening");
                    return Ok(conn_id);
                }
                Err(e) => last_err = e,
            }
        }
        Err(last_err)
    }

    fn bind_listener(addr: SocketAddr, backlog: i32) -> io::Result<TcpListener> {
        let socket = new_tcp_socket(addr)?;
        socket.set_reuse_address(true)?;
        if addr.is_ipv6() {
            // Dual-stack on `::` binds; not every stack allows flipping it.
            let _ = socket.set_only_v6(false);
        }
        socket.set_nonblocking(true)?;
        socket.bind(&addr.into())?;
        socket.listen(backlog)?;
        Ok(socket.into())
    }

    /// Open an outbound connection. Addresses are resolved synchronously
    /// and tried in order as each attempt fails; `on_connect` reports the
    /// final outcome.
    pub fn connect(&mut self, host: &str, port: u16) -> io::Result<ConnId> {
        self.connect_with(host, port, self.cfg.framer, ConnType::ServerServer)
    }

    pub fn connect_with(
        &mut self,
        host: &str,
        port: u16,
        framer: FramerKind,
        conn_type: ConnType,
    ) -> io::Result<ConnId> {
        let mut addrs = resolve(host, port)?;
        // Pop from the back on retry.
        addrs.reverse();

        let mut last_err = io::Error::new(io::ErrorKind::NotFound, "no address reachable");
        while let Some(addr) = addrs.pop() {
            match Self::start_connect(addr) {
                Ok(fd) => {
                    let conn_id = self.next_id();
                    let raw = fd.as_raw_fd();
                    let mut socket = Socket::new(
                        conn_id,
                        conn_type,
                        ConnState::Opening,
                        fd,
                        Some(addr),
                        Box::new(PlainIo),
                        framer,
                        self.cfg.chunk_capacity,
                        self.cfg.send_chunk_max,
                        self.cfg.recv_chunk_max,
                        self.cfg.overflow,
                    );
                    socket.pending_addrs = addrs;
                    self.by_fd.insert(raw, conn_id);
                    self.endpoints.insert(conn_id, Endpoint::Conn(socket));
                    self.reactor.modify_interest(raw, Interest::WRITE)?;
                    debug!(conn = %conn_id, %addr, "connecting");
                    return Ok(conn_id);
                }
                Err(e) => last_err = e,
            }
        }
        Err(last_err)
    }

    fn start_connect(addr: SocketAddr) -> io::Result<OwnedFd> {
        let socket = new_tcp_socket(addr)?;
        socket.set_nonblocking(true)?;
        match socket.connect(&addr.into()) {
            Ok(()) => {}
            Err(e) if e.raw_os_error() == Some(libc::EINPROGRESS) => {}
            Err(e) => return Err(e),
        }
        Ok(socket.into())
    }

    /// Frame and queue a message for sending. The bytes go out as the
    /// socket becomes writable.
    pub fn send(&mut self, conn_id: ConnId, msg: &[u8]) -> Result<(), NetError> {
        let socket = match self.endpoints.get_mut(&conn_id) {
            Some(Endpoint::Conn(s)) => s,
            _ => return Err(NetError::UnknownConn(conn_id)),
        };
        if !matches!(socket.state(), ConnState::Opening | ConnState::Open) {
            return Err(NetError::NotWritable(conn_id));
        }

        socket.queue(msg)?;
        if let Some(reason) = socket.check_tx_overflow() {
            self.doom(conn_id, reason);
            return Ok(());
        }
        self.sync_interest(conn_id).map_err(NetError::Io)
    }

    /// Close a connection. With `flush`, the send direction stays open
    /// until pending output drains or the grace period expires; without
    /// it, buffers are dropped and the fd closes now. Returns false for
    /// an unknown or already-closed id.
    pub fn close(&mut self, conn_id: ConnId, flush: bool) -> bool {
        enum Target {
            Listener,
            Conn(ConnState, bool),
        }
        let target = match self.endpoints.get(&conn_id) {
            None => return false,
            Some(Endpoint::Listener(_)) => Target::Listener,
            Some(Endpoint::Conn(s)) => Target::Conn(s.state(), s.has_pending_out()),
        };

        match target {
            Target::Listener => {
                self.doom(conn_id, CloseReason::Local);
                true
            }
            Target::Conn(ConnState::Closed, _) => false,
            Target::Conn(ConnState::Closing, _) => true,
            Target::Conn(ConnState::Opening, _) => {
                self.doom(conn_id, CloseReason::Local);
                true
            }
            Target::Conn(ConnState::Open, has_pending) => {
                if flush && has_pending {
                    if let Ok(socket) = self.socket_mut(conn_id) {
                        socket.set_state(ConnState::Closing);
                    }
                    let timer = self.reactor.add_timer(self.cfg.flush_grace, None);
                    self.close_timers.insert(timer, conn_id);
                    self.timer_of.insert(conn_id, timer);
                    let _ = self.sync_interest(conn_id);
                } else {
                    if !flush {
                        if let Ok(socket) = self.socket_mut(conn_id) {
                            socket.discard_buffers();
                        }
                    }
                    self.doom(conn_id, CloseReason::Local);
                }
                true
            }
        }
    }

    pub fn set_framer(&mut self, conn_id: ConnId, kind: FramerKind) -> Result<(), NetError> {
        self.socket_mut(conn_id)?.set_framer(kind);
        Ok(())
    }

    /// Swap a connection's I/O adapter, e.g. to a [`TlsIo`] session right
    /// after accept or connect.
    ///
    /// [`TlsIo`]: crate::TlsIo
    pub fn set_io(
        &mut self,
        conn_id: ConnId,
        adapter: Box<dyn crate::IoAdapter>,
    ) -> Result<(), NetError> {
        self.socket_mut(conn_id)?.set_adapter(adapter);
        Ok(())
    }

    pub fn set_codec(&mut self, conn_id: ConnId, codec: CodecKind) -> Result<(), NetError> {
        self.socket_mut(conn_id)?.set_codec(codec);
        Ok(())
    }

    pub fn codec(&self, conn_id: ConnId) -> Option<CodecKind> {
        self.socket_ref(conn_id).map(|s| s.codec())
    }

    pub fn set_buffer_params(
        &mut self,
        conn_id: ConnId,
        send_chunk_max: usize,
        recv_chunk_max: usize,
        overflow: OverflowPolicy,
    ) -> Result<(), NetError> {
        self.socket_mut(conn_id)?
            .set_buffer_params(send_chunk_max, recv_chunk_max, overflow);
        Ok(())
    }

    pub fn set_object_id(&mut self, conn_id: ConnId, object_id: i64) -> Result<(), NetError> {
        self.socket_mut(conn_id)?.set_object_id(object_id);
        Ok(())
    }

    pub fn object_id(&self, conn_id: ConnId) -> Option<i64> {
        self.socket_ref(conn_id).map(|s| s.object_id())
    }

    pub fn stats(&self, conn_id: ConnId) -> Option<SocketStats> {
        self.socket_ref(conn_id).map(|s| s.stats())
    }

    pub fn conn_state(&self, conn_id: ConnId) -> Option<ConnState> {
        self.socket_ref(conn_id).map(|s| s.state())
    }

    pub fn peer_addr(&self, conn_id: ConnId) -> Option<SocketAddr> {
        self.socket_ref(conn_id).and_then(|s| s.peer())
    }

    /// Local address of a listener or connection; the way tests learn a
    /// port-0 bind.
    pub fn local_addr(&self, conn_id: ConnId) -> Option<SocketAddr> {
        match self.endpoints.get(&conn_id)? {
            Endpoint::Listener(l) => l.listener.local_addr().ok(),
            Endpoint::Conn(s) => SockRef::from(s.fd_ref()).local_addr().ok()?.as_socket(),
        }
    }

    pub fn conn_count(&self) -> usize {
        self.endpoints
            .values()
            .filter(|e| matches!(e, Endpoint::Conn(_)))
            .count()
    }

    pub fn listener_count(&self) -> usize {
        self.endpoints
            .values()
            .filter(|e| matches!(e, Endpoint::Listener(_)))
            .count()
    }

    /// Ids of every bound listener, in id order.
    pub fn listener_ids(&self) -> Vec<ConnId> {
        let mut ids: Vec<ConnId> = self
            .endpoints
            .iter()
            .filter(|(_, e)| matches!(e, Endpoint::Listener(_)))
            .map(|(id, _)| *id)
            .collect();
        ids.sort();
        ids
    }

    pub fn request_stop(&mut self) {
        self.reactor.request_stop();
    }

    pub fn stop_requested(&self) -> bool {
        self.reactor.stop_requested()
    }

    // ========================================================================
    // Drive loop
    // ========================================================================

    /// One reactor tick. I/O events are handled internally and dispatched
    /// through `handler`; timer events not owned by the session layer and
    /// all wake events are appended to `out` for the embedding to route.
    pub fn poll_once(
        &mut self,
        handler: &mut dyn EventHandler,
        out: &mut Vec<Event>,
    ) -> io::Result<()> {
        let mut events = std::mem::take(&mut self.events);
        self.reactor.poll(&mut events)?;

        for ev in &events {
            match *ev {
                Event::Io { fd, ready } => self.dispatch_io(handler, fd, ready),
                Event::Timer { id } => {
                    if let Some(conn_id) = self.close_timers.remove(&id) {
                        self.timer_of.remove(&conn_id);
                        warn!(conn = %conn_id, "flush grace expired, terminating");
                        self.doom(conn_id, CloseReason::Local);
                    } else {
                        out.push(*ev);
                    }
                }
                Event::Wake { .. } => out.push(*ev),
            }
            self.reap(handler);
        }

        events.clear();
        self.events = events;
        Ok(())
    }

    /// Drive until stop is requested, then drain and close everything.
    /// For embeddings with workers, build the loop from `poll_once`
    /// instead so wake events reach them.
    pub fn run(&mut self, handler: &mut dyn EventHandler) -> io::Result<()> {
        let mut out = Vec::new();
        while !self.reactor.stop_requested() {
            out.clear();
            self.poll_once(handler, &mut out)?;
        }
        self.shutdown(handler)
    }

    /// Shutdown pass: flush-close every connection, drop listeners, and
    /// tick until the backend has no registrations or the grace period
    /// runs out, then terminate stragglers.
    pub fn shutdown(&mut self, handler: &mut dyn EventHandler) -> io::Result<()> {
        let ids: Vec<ConnId> = self.endpoints.keys().copied().collect();
        for conn_id in ids {
            self.close(conn_id, true);
        }
        self.reap(handler);

        let deadline = Instant::now() + self.cfg.flush_grace;
        let mut out = Vec::new();
        while self.reactor.watcher_count() > 0 && Instant::now() < deadline {
            out.clear();
            self.poll_once(handler, &mut out)?;
        }

        let stragglers: Vec<ConnId> = self.endpoints.keys().copied().collect();
        for conn_id in stragglers {
            self.close(conn_id, false);
        }
        self.reap(handler);
        debug_assert_eq!(self.reactor.watcher_count(), 0);
        Ok(())
    }

    // ========================================================================
    // Internals
    // ========================================================================

    fn socket_ref(&self, conn_id: ConnId) -> Option<&Socket> {
        match self.endpoints.get(&conn_id) {
            Some(Endpoint::Conn(s)) => Some(s),
            _ => None,
        }
    }

    fn socket_mut(&mut self, conn_id: ConnId) -> Result<&mut Socket, NetError> {
        match self.endpoints.get_mut(&conn_id) {
            Some(Endpoint::Conn(s)) => Ok(s),
            _ => Err(NetError::UnknownConn(conn_id)),
        }
    }

    fn dispatch_io(&mut self, handler: &mut dyn EventHandler, fd: RawFd, ready: Interest) {
        // Stale events for an fd we no longer track are dropped here.
        let Some(&conn_id) = self.by_fd.get(&fd) else {
            return;
        };
        match self.endpoints.get(&conn_id) {
            Some(Endpoint::Listener(_)) => self.accept_ready(handler, conn_id),
            Some(Endpoint::Conn(_)) => self.conn_ready(handler, conn_id, ready),
            None => {}
        }
    }

    fn accept_ready(&mut self, handler: &mut dyn EventHandler, listener_id: ConnId) {
        loop {
            let (stream, peer, framer, conn_type) = {
                let Some(Endpoint::Listener(l)) = self.endpoints.get(&listener_id) else {
                    return;
                };
                match l.listener.accept() {
                    Ok((stream, peer)) => (stream, peer, l.framer, l.conn_type),
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        warn!(listener = %listener_id, "accept failed: {e}");
                        return;
                    }
                }
            };

            if let Err(e) = apply_stream_options(&stream, self.cfg.user_timeout) {
                warn!(%peer, "dropping accept, options failed: {e}");
                continue;
            }

            let conn_id = self.next_id();
            let fd: OwnedFd = stream.into();
            let raw = fd.as_raw_fd();
            let socket = Socket::new(
                conn_id,
                conn_type,
                ConnState::Open,
                fd,
                Some(peer),
                Box::new(PlainIo),
                framer,
                self.cfg.chunk_capacity,
                self.cfg.send_chunk_max,
                self.cfg.recv_chunk_max,
                self.cfg.overflow,
            );
            self.by_fd.insert(raw, conn_id);
            self.endpoints.insert(conn_id, Endpoint::Conn(socket));
            if let Err(e) = self.reactor.modify_interest(raw, Interest::READ) {
                warn!(conn = %conn_id, "watch failed: {e}");
                self.doom(conn_id, CloseReason::IoError);
                continue;
            }

            debug!(conn = %conn_id, %peer, "accepted");
            handler.on_accept(self, conn_id, peer);
        }
    }

    fn conn_ready(&mut self, handler: &mut dyn EventHandler, conn_id: ConnId, ready: Interest) {
        let state = match self.socket_ref(conn_id) {
            Some(s) => s.state(),
            None => return,
        };

        if state == ConnState::Opening {
            // Writability (or an error flagged as both) decides the connect.
            self.finish_connect(handler, conn_id);
            return;
        }

        if ready.contains(Interest::READ) && state == ConnState::Open {
            let mut msgs = Vec::new();
            if let Some(Endpoint::Conn(socket)) = self.endpoints.get_mut(&conn_id) {
                if let Err(reason) = socket.on_readable(&mut msgs) {
                    self.doom(conn_id, reason);
                }
            }
            // Messages framed before a terminal condition still get
            // delivered; the close callback follows at reap.
            for msg in &msgs {
                if !self.endpoints.contains_key(&conn_id) {
                    break;
                }
                handler.on_message(self, conn_id, msg);
            }
        }

        if ready.contains(Interest::WRITE) {
            if let Some(Endpoint::Conn(socket)) = self.endpoints.get_mut(&conn_id) {
                if matches!(socket.state(), ConnState::Open | ConnState::Closing)
                    && socket.has_pending_out()
                {
                    if let Err(reason) = socket.on_writable() {
                        self.doom(conn_id, reason);
                    }
                }
            }
        }

        let _ = self.sync_interest(conn_id);
    }

    fn finish_connect(&mut self, handler: &mut dyn EventHandler, conn_id: ConnId) {
        enum Next {
            Opened(Option<SocketAddr>),
            Retry { old_raw: RawFd, new_fd: OwnedFd },
            GiveUp(io::Error),
        }

        let user_timeout = self.cfg.user_timeout;
        let next = {
            let Some(Endpoint::Conn(socket)) = self.endpoints.get_mut(&conn_id) else {
                return;
            };
            let pending_err = match SockRef::from(socket.fd_ref()).take_error() {
                Ok(None) => None,
                Ok(Some(e)) => Some(e),
                Err(e) => Some(e),
            };

            match pending_err {
                None => {
                    let _ = apply_stream_options(socket.fd_ref(), user_timeout);
                    socket.set_state(ConnState::Open);
                    Next::Opened(socket.peer())
                }
                Some(err) => {
                    // Walk the remaining resolved addresses until one
                    // starts an attempt.
                    let mut last_err = err;
                    let mut started = None;
                    while let Some(addr) = socket.pending_addrs.pop() {
                        match Self::start_connect(addr) {
                            Ok(new_fd) => {
                                started = Some((new_fd, addr));
                                break;
                            }
                            Err(e) => last_err = e,
                        }
                    }
                    match started {
                        Some((new_fd, addr)) => {
                            debug!(conn = %conn_id, "connect attempt failed ({last_err}), trying {addr}");
                            socket.set_peer(addr);
                            Next::Retry {
                                old_raw: socket.raw_fd(),
                                new_fd,
                            }
                        }
                        None => Next::GiveUp(last_err),
                    }
                }
            }
        };

        match next {
            Next::Opened(peer) => {
                let _ = self.sync_interest(conn_id);
                info!(conn = %conn_id, peer = ?peer, "connected");
                handler.on_connect(self, conn_id, Ok(()));
            }
            Next::Retry { old_raw, new_fd } => {
                let new_raw = new_fd.as_raw_fd();
                let _ = self.reactor.modify_interest(old_raw, Interest::empty());
                self.by_fd.remove(&old_raw);
                if let Ok(socket) = self.socket_mut(conn_id) {
                    let old_fd = socket.replace_fd(new_fd);
                    drop(old_fd);
                }
                self.by_fd.insert(new_raw, conn_id);
                let _ = self.reactor.modify_interest(new_raw, Interest::WRITE);
            }
            Next::GiveUp(err) => {
                warn!(conn = %conn_id, "connect failed: {err}");
                self.remove_unopened(conn_id);
                handler.on_connect(self, conn_id, Err(err));
            }
        }
    }

    /// Remove a socket that never reached open; no close callback fires.
    fn remove_unopened(&mut self, conn_id: ConnId) {
        if let Some(ep) = self.endpoints.remove(&conn_id) {
            let fd = ep.raw_fd();
            let _ = self.reactor.modify_interest(fd, Interest::empty());
            self.by_fd.remove(&fd);
        }
    }

    /// Mark an endpoint dead: interest dropped now, removal and the close
    /// callback deferred to `reap`.
    fn doom(&mut self, conn_id: ConnId, reason: CloseReason) {
        let fd = match self.endpoints.get(&conn_id) {
            None => return,
            Some(Endpoint::Conn(s)) if s.state() == ConnState::Closed => return,
            Some(ep) => ep.raw_fd(),
        };
        let _ = self.reactor.modify_interest(fd, Interest::empty());
        if let Some(Endpoint::Conn(s)) = self.endpoints.get_mut(&conn_id) {
            s.set_state(ConnState::Closed);
        }
        self.doomed.push((conn_id, reason));
    }

    fn reap(&mut self, handler: &mut dyn EventHandler) {
        while let Some((conn_id, reason)) = self.doomed.pop() {
            if let Some(timer) = self.timer_of.remove(&conn_id) {
                self.close_timers.remove(&timer);
                self.reactor.remove_timer(timer);
            }
            let Some(ep) = self.endpoints.remove(&conn_id) else {
                continue;
            };
            self.by_fd.remove(&ep.raw_fd());
            match ep {
                Endpoint::Listener(_) => {
                    debug!(conn = %conn_id, "listener closed");
                }
                Endpoint::Conn(socket) => {
                    debug!(conn = %conn_id, ?reason, "closed");
                    drop(socket);
                    handler.on_close(self, conn_id, reason);
                }
            }
        }
    }

    /// Recompute the interest mask from socket state, and finalize a
    /// closing socket once its output has drained.
    fn sync_interest(&mut self, conn_id: ConnId) -> io::Result<()> {
        let (fd, state, pending, want) = match self.endpoints.get(&conn_id) {
            Some(Endpoint::Conn(s)) => (
                s.raw_fd(),
                s.state(),
                s.has_pending_out(),
                s.desired_interest(),
            ),
            _ => return Ok(()),
        };
        if state == ConnState::Closing && !pending {
            self.doom(conn_id, CloseReason::Local);
            return Ok(());
        }
        self.reactor.modify_interest(fd, want)
    }
}

/// A TCP socket for the address's family.
fn new_tcp_socket(addr: SocketAddr) -> io::Result<socket2::Socket> {
    socket2::Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))
}
