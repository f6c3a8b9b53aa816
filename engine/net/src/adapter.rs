//! Per-socket read/write strategies.
//!
//! An adapter moves bytes between a file descriptor and the socket's
//! buffer pair and reports what happened as an [`IoStatus`]. The socket
//! decides terminal versus retry; the adapter never touches interest
//! masks or lifecycle.

use engine_buffer::Buffer;
use std::io;
use std::os::unix::io::RawFd;

/// Outcome of one adapter operation.
#[derive(Debug)]
pub enum IoStatus {
    /// `n` bytes crossed the syscall boundary. For sends this may be a
    /// partial drain; the caller checks the buffer.
    Done(usize),
    /// Nothing to do until the fd is readable again.
    RetryRead,
    /// Nothing to do until the fd is writable again. TLS may report this
    /// from the receive path while a handshake flight is pending.
    RetryWrite,
    /// Orderly shutdown by the peer. Terminal, not an error.
    PeerClosed,
    /// A terminal transport error.
    Failed(io::Error),
}

/// Read/write strategy for one socket.
pub trait IoAdapter: Send {
    /// Fill the receive buffer's tail space from the fd.
    fn recv(&mut self, fd: RawFd, rx: &mut Buffer) -> IoStatus;

    /// Drain the send buffer's head toward the fd.
    fn send(&mut self, fd: RawFd, tx: &mut Buffer) -> IoStatus;

    /// True while the adapter still holds bytes of its own to flush
    /// (TLS records buffered past the application stream).
    fn has_pending_output(&self) -> bool {
        false
    }
}

/// Plain TCP: straight syscalls against the buffer regions.
#[derive(Default)]
pub struct PlainIo;

pub(crate) fn syscall_recv(fd: RawFd, buf: &mut [u8]) -> IoStatus {
    let n = unsafe { libc::recv(fd, buf.as_mut_ptr().cast(), buf.len(), 0) };
    if n > 0 {
        return IoStatus::Done(n as usize);
    }
    if n == 0 {
        return IoStatus::PeerClosed;
    }
    let err = io::Error::last_os_error();
    match err.raw_os_error() {
        Some(libc::EAGAIN) | Some(libc::EINTR) => IoStatus::RetryRead,
        Some(libc::ECONNRESET) => IoStatus::PeerClosed,
        _ => IoStatus::Failed(err),
    }
}

pub(crate) fn syscall_send(fd: RawFd, buf: &[u8]) -> IoStatus {
    // MSG_NOSIGNAL: a dead peer must surface as EPIPE, not SIGPIPE.
    let n = unsafe { libc::send(fd, buf.as_ptr().cast(), buf.len(), libc::MSG_NOSIGNAL) };
    if n >= 0 {
        return IoStatus::Done(n as usize);
    }
    let err = io::Error::last_os_error();
    match err.raw_os_error() {
        Some(libc::EAGAIN) | Some(libc::EINTR) => IoStatus::RetryWrite,
        Some(libc::EPIPE) | Some(libc::ECONNRESET) => IoStatus::PeerClosed,
        _ => IoStatus::Failed(err),
    }
}

impl IoAdapter for PlainIo {
    fn recv(&mut self, fd: RawFd, rx: &mut Buffer) -> IoStatus {
        // Level-triggered readiness: one read per event is enough, the
        // backend fires again while data remains.
        rx.reserve(0);
        match syscall_recv(fd, rx.space_mut()) {
            IoStatus::Done(n) => {
                rx.commit(n);
                IoStatus::Done(n)
            }
            other => other,
        }
    }

    fn send(&mut self, fd: RawFd, tx: &mut Buffer) -> IoStatus {
        let head = tx.head_used();
        debug_assert!(!head.is_empty(), "send with empty buffer");
        match syscall_send(fd, head) {
            IoStatus::Done(n) => {
                tx.consume(n);
                IoStatus::Done(n)
            }
            other => other,
        }
    }
}
