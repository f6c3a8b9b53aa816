//! Per-connection state: buffers, adapter, framer, lifecycle.

use crate::adapter::{IoAdapter, IoStatus};
use crate::{CloseReason, CodecKind, ConnId};
use engine_buffer::Buffer;
use io_reactor::Interest;
use protocol_framing::{FrameError, Framer, FramerKind};
use std::net::SocketAddr;
use std::os::unix::io::{AsRawFd, OwnedFd, RawFd};
use tracing::{debug, warn};

/// Lifecycle of a connection. Transitions only move rightward; a closed
/// socket never comes back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// Connect in flight, waiting for writability to confirm.
    Opening,
    /// Established and exchanging traffic.
    Open,
    /// Draining the send buffer before the fd goes away.
    Closing,
    Closed,
}

/// Which sides of the deployment a connection joins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum ConnType {
    /// A remote client talking to this server.
    #[default]
    #[cfg_attr(feature = "serde", serde(alias = "client-server"))]
    ClientServer,
    /// This server talking to a remote client host.
    #[cfg_attr(feature = "serde", serde(alias = "server-client"))]
    ServerClient,
    /// Server-to-server link.
    #[cfg_attr(feature = "serde", serde(alias = "server-server"))]
    ServerServer,
}

/// What to do when a buffer exceeds its chunk cap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum OverflowPolicy {
    /// Drop the connection.
    #[default]
    Disconnect,
    /// Shed the oldest pending chunks and keep going.
    #[cfg_attr(feature = "serde", serde(alias = "drop-oldest"))]
    DropOldest,
    /// Shed the newest pending chunks and keep going.
    #[cfg_attr(feature = "serde", serde(alias = "drop-newest"))]
    DropNewest,
}

/// On-demand snapshot of a connection's buffer usage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SocketStats {
    /// Chunks allocated to the send buffer.
    pub send_chunks: usize,
    /// Chunks allocated to the receive buffer.
    pub recv_chunks: usize,
    /// Bytes of storage held by the send buffer.
    pub send_bytes: usize,
    /// Bytes of storage held by the receive buffer.
    pub recv_bytes: usize,
    /// Pending bytes not yet written to the fd.
    pub pending_out: usize,
    /// Received bytes not yet consumed by the framer.
    pub pending_in: usize,
}

/// One connection: an fd, its buffer pair, I/O adapter, and framer.
pub struct Socket {
    conn_id: ConnId,
    conn_type: ConnType,
    state: ConnState,
    fd: OwnedFd,
    peer: Option<SocketAddr>,
    object_id: i64,
    tx: Buffer,
    rx: Buffer,
    framer: Box<dyn Framer>,
    framer_kind: FramerKind,
    adapter: Box<dyn IoAdapter>,
    codec: CodecKind,
    overflow: OverflowPolicy,
    /// Contiguous-view scratch handed to the framer, reused across reads.
    scratch: Vec<u8>,
    /// Addresses not yet tried for an in-flight connect.
    pub(crate) pending_addrs: Vec<SocketAddr>,
}

impl Socket {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        conn_id: ConnId,
        conn_type: ConnType,
        state: ConnState,
        fd: OwnedFd,
        peer: Option<SocketAddr>,
        adapter: Box<dyn IoAdapter>,
        framer_kind: FramerKind,
        chunk_capacity: usize,
        send_chunk_max: usize,
        recv_chunk_max: usize,
        overflow: OverflowPolicy,
    ) -> Self {
        Self {
            conn_id,
            conn_type,
            state,
            fd,
            peer,
            object_id: 0,
            tx: Buffer::with_params(chunk_capacity, send_chunk_max),
            rx: Buffer::with_params(chunk_capacity, recv_chunk_max),
            framer: framer_kind.create(),
            framer_kind,
            adapter,
            codec: CodecKind::default(),
            overflow,
            scratch: Vec::new(),
            pending_addrs: Vec::new(),
        }
    }

    pub fn conn_id(&self) -> ConnId {
        self.conn_id
    }

    pub fn conn_type(&self) -> ConnType {
        self.conn_type
    }

    pub fn state(&self) -> ConnState {
        self.state
    }

    pub(crate) fn set_state(&mut self, state: ConnState) {
        debug_assert!(
            self.state != ConnState::Closed,
            "no transitions out of closed"
        );
        self.state = state;
    }

    pub fn raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    pub(crate) fn fd_ref(&self) -> &OwnedFd {
        &self.fd
    }

    pub(crate) fn replace_fd(&mut self, fd: OwnedFd) -> OwnedFd {
        std::mem::replace(&mut self.fd, fd)
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    pub(crate) fn set_peer(&mut self, peer: SocketAddr) {
        self.peer = Some(peer);
    }

    pub fn object_id(&self) -> i64 {
        self.object_id
    }

    pub fn set_object_id(&mut self, object_id: i64) {
        self.object_id = object_id;
    }

    pub fn codec(&self) -> CodecKind {
        self.codec
    }

    pub fn set_codec(&mut self, codec: CodecKind) {
        self.codec = codec;
    }

    pub fn framer_kind(&self) -> FramerKind {
        self.framer_kind
    }

    /// Swap the framer. Bytes already pending in the receive buffer are
    /// interpreted by the new framer.
    pub fn set_framer(&mut self, kind: FramerKind) {
        self.framer_kind = kind;
        self.framer = kind.create();
    }

    /// Swap the I/O adapter. Do this before traffic flows; bytes already
    /// buffered are not re-interpreted.
    pub(crate) fn set_adapter(&mut self, adapter: Box<dyn IoAdapter>) {
        self.adapter = adapter;
    }

    pub fn set_buffer_params(
        &mut self,
        send_chunk_max: usize,
        recv_chunk_max: usize,
        overflow: OverflowPolicy,
    ) {
        self.tx.set_chunk_max(send_chunk_max);
        self.rx.set_chunk_max(recv_chunk_max);
        self.overflow = overflow;
    }

    pub fn stats(&self) -> SocketStats {
        SocketStats {
            send_chunks: self.tx.chunk_count(),
            recv_chunks: self.rx.chunk_count(),
            send_bytes: self.tx.allocated_bytes(),
            recv_bytes: self.rx.allocated_bytes(),
            pending_out: self.tx.len(),
            pending_in: self.rx.len(),
        }
    }

    pub(crate) fn has_pending_out(&self) -> bool {
        !self.tx.is_empty() || self.adapter.has_pending_output()
    }

    /// The interest mask this socket wants right now. WRITE is asserted
    /// only while output is pending, so a writable-idle socket does not
    /// storm the loop.
    pub(crate) fn desired_interest(&self) -> Interest {
        match self.state {
            ConnState::Opening => Interest::WRITE,
            ConnState::Open => {
                let mut interest = Interest::READ;
                if self.has_pending_out() {
                    interest |= Interest::WRITE;
                }
                interest
            }
            ConnState::Closing => {
                if self.has_pending_out() {
                    Interest::WRITE
                } else {
                    Interest::empty()
                }
            }
            ConnState::Closed => Interest::empty(),
        }
    }

    /// Serialize an outbound message through the framer.
    pub(crate) fn queue(&mut self, msg: &[u8]) -> Result<(), FrameError> {
        self.framer.pack(msg, &mut self.tx)
    }

    /// Enforce the overflow policy on the send buffer after queueing.
    pub(crate) fn check_tx_overflow(&mut self) -> Option<CloseReason> {
        if !self.tx.is_overflowed() {
            return None;
        }
        match self.overflow {
            OverflowPolicy::Disconnect => Some(CloseReason::Overflow),
            OverflowPolicy::DropOldest => {
                let max = self.tx.chunk_max();
                let dropped = self.tx.trim_front_to(max);
                warn!(conn = %self.conn_id, dropped, "send overflow, shed oldest");
                self.tx.clear_overflow();
                None
            }
            OverflowPolicy::DropNewest => {
                let max = self.tx.chunk_max();
                let dropped = self.tx.trim_back_to(max);
                warn!(conn = %self.conn_id, dropped, "send overflow, shed newest");
                self.tx.clear_overflow();
                None
            }
        }
    }

    /// Handle one readable event: pull bytes through the adapter, then let
    /// the framer lift complete messages into `msgs`.
    pub(crate) fn on_readable(&mut self, msgs: &mut Vec<Vec<u8>>) -> Result<(), CloseReason> {
        match self.adapter.recv(self.fd.as_raw_fd(), &mut self.rx) {
            IoStatus::Done(_) => {}
            IoStatus::RetryRead | IoStatus::RetryWrite => return Ok(()),
            IoStatus::PeerClosed => return Err(CloseReason::PeerClosed),
            IoStatus::Failed(e) => {
                warn!(conn = %self.conn_id, "recv failed: {e}");
                return Err(CloseReason::IoError);
            }
        }

        if self.rx.is_overflowed() {
            match self.overflow {
                OverflowPolicy::Disconnect => return Err(CloseReason::Overflow),
                OverflowPolicy::DropOldest => {
                    let max = self.rx.chunk_max();
                    let dropped = self.rx.trim_front_to(max);
                    warn!(conn = %self.conn_id, dropped, "recv overflow, shed oldest");
                    self.rx.clear_overflow();
                }
                OverflowPolicy::DropNewest => {
                    let max = self.rx.chunk_max();
                    let dropped = self.rx.trim_back_to(max);
                    warn!(conn = %self.conn_id, dropped, "recv overflow, shed newest");
                    self.rx.clear_overflow();
                }
            }
        }

        let mut sink = |msg: &[u8]| msgs.push(msg.to_vec());
        match self
            .framer
            .on_readable(&mut self.rx, &mut self.scratch, &mut sink)
        {
            Ok(n) => {
                if n > 0 {
                    debug!(conn = %self.conn_id, messages = n, "dispatched");
                }
                Ok(())
            }
            Err(e) => {
                warn!(conn = %self.conn_id, "protocol violation: {e}");
                Err(CloseReason::Protocol)
            }
        }
    }

    /// Handle one writable event: drain pending output while the fd keeps
    /// accepting bytes.
    pub(crate) fn on_writable(&mut self) -> Result<(), CloseReason> {
        while self.has_pending_out() {
            match self.adapter.send(self.fd.as_raw_fd(), &mut self.tx) {
                IoStatus::Done(0) => break,
                IoStatus::Done(_) => {}
                IoStatus::RetryRead | IoStatus::RetryWrite => break,
                IoStatus::PeerClosed => return Err(CloseReason::PeerClosed),
                IoStatus::Failed(e) => {
                    warn!(conn = %self.conn_id, "send failed: {e}");
                    return Err(CloseReason::IoError);
                }
            }
        }
        Ok(())
    }

    /// Drop buffered data on a terminating close.
    pub(crate) fn discard_buffers(&mut self) {
        self.tx.clear();
        self.rx.clear();
    }
}
