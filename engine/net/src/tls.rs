//! TLS I/O adapter over rustls.
//!
//! Same contract as [`PlainIo`](crate::PlainIo): move bytes between the fd
//! and the buffer pair, report an [`IoStatus`]. The difference is the
//! record layer in the middle — the receive path may demand a write (a
//! handshake flight is pending) and the send path may demand a read,
//! which the adapter expresses through `RetryWrite`/`RetryRead`.

use crate::adapter::{IoAdapter, IoStatus};
use engine_buffer::Buffer;
use rustls::pki_types::ServerName;
use std::fs::File;
use std::io::{self, BufReader, Read, Write};
use std::os::unix::io::RawFd;
use std::path::Path;
use std::sync::Arc;

/// Raw-fd shim for rustls's `read_tls`/`write_tls`.
struct FdIo(RawFd);

impl Read for FdIo {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = unsafe { libc::recv(self.0, buf.as_mut_ptr().cast(), buf.len(), 0) };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(n as usize)
    }
}

impl Write for FdIo {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = unsafe { libc::send(self.0, buf.as_ptr().cast(), buf.len(), libc::MSG_NOSIGNAL) };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(n as usize)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

fn is_retry(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}

/// TLS adapter wrapping a rustls client or server session.
#[derive(Debug)]
pub struct TlsIo {
    session: rustls::Connection,
}

impl TlsIo {
    pub fn client(config: Arc<rustls::ClientConfig>, server_name: &str) -> io::Result<Self> {
        let name = ServerName::try_from(server_name.to_string())
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        let conn = rustls::ClientConnection::new(config, name).map_err(io::Error::other)?;
        Ok(Self {
            session: rustls::Connection::Client(conn),
        })
    }

    pub fn server(config: Arc<rustls::ServerConfig>) -> io::Result<Self> {
        let conn = rustls::ServerConnection::new(config).map_err(io::Error::other)?;
        Ok(Self {
            session: rustls::Connection::Server(conn),
        })
    }

    pub fn is_handshaking(&self) -> bool {
        self.session.is_handshaking()
    }

    /// Push buffered records toward the fd. `Ok(true)` means everything
    /// went out, `Ok(false)` means the fd pushed back.
    fn flush_records(&mut self, fd: RawFd) -> Result<bool, IoStatus> {
        while self.session.wants_write() {
            match self.session.write_tls(&mut FdIo(fd)) {
                Ok(0) => return Err(IoStatus::PeerClosed),
                Ok(_) => {}
                Err(e) if is_retry(&e) => return Ok(false),
                Err(e) if e.kind() == io::ErrorKind::BrokenPipe => {
                    return Err(IoStatus::PeerClosed)
                }
                Err(e) => return Err(IoStatus::Failed(e)),
            }
        }
        Ok(true)
    }
}

impl IoAdapter for TlsIo {
    fn recv(&mut self, fd: RawFd, rx: &mut Buffer) -> IoStatus {
        // Pull ciphertext and advance the session.
        match self.session.read_tls(&mut FdIo(fd)) {
            Ok(0) => return IoStatus::PeerClosed,
            Ok(_) => {
                if let Err(e) = self.session.process_new_packets() {
                    return IoStatus::Failed(io::Error::other(e));
                }
            }
            Err(e) if is_retry(&e) => {}
            Err(e) if e.kind() == io::ErrorKind::ConnectionReset => {
                return IoStatus::PeerClosed;
            }
            Err(e) => return IoStatus::Failed(e),
        }

        // Drain whatever plaintext the records yielded.
        let mut moved = 0;
        loop {
            rx.reserve(0);
            match self.session.reader().read(rx.space_mut()) {
                Ok(0) => {
                    // Clean close_notify from the peer.
                    if moved == 0 {
                        return IoStatus::PeerClosed;
                    }
                    break;
                }
                Ok(n) => {
                    rx.commit(n);
                    moved += n;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => return IoStatus::Failed(e),
            }
        }

        // A handshake flight may now be pending in the other direction.
        match self.flush_records(fd) {
            Ok(true) => {}
            Ok(false) => {
                if moved == 0 {
                    return IoStatus::RetryWrite;
                }
            }
            Err(status) => return status,
        }

        if moved > 0 {
            IoStatus::Done(moved)
        } else {
            IoStatus::RetryRead
        }
    }

    fn send(&mut self, fd: RawFd, tx: &mut Buffer) -> IoStatus {
        // Feed plaintext into the record layer up to its buffer limit.
        while !tx.is_empty() {
            let head = tx.head_used();
            match self.session.writer().write(head) {
                Ok(0) => break,
                Ok(n) => tx.consume(n),
                Err(e) => return IoStatus::Failed(e),
            }
        }

        match self.flush_records(fd) {
            Ok(true) => {
                if self.session.is_handshaking() {
                    // Our flight is out; the peer must speak next.
                    IoStatus::RetryRead
                } else {
                    IoStatus::Done(0)
                }
            }
            Ok(false) => IoStatus::RetryWrite,
            Err(status) => status,
        }
    }

    fn has_pending_output(&self) -> bool {
        self.session.wants_write()
    }
}

/// Build a server-side TLS config from PEM cert chain and key files.
pub fn load_server_config(cert: &Path, key: &Path) -> io::Result<Arc<rustls::ServerConfig>> {
    let certs = rustls_pemfile::certs(&mut BufReader::new(File::open(cert)?))
        .collect::<Result<Vec<_>, _>>()?;
    let key = rustls_pemfile::private_key(&mut BufReader::new(File::open(key)?))?
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "no private key in file"))?;

    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(io::Error::other)?;
    Ok(Arc::new(config))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_rejects_bad_server_name() {
        let roots = rustls::RootCertStore::empty();
        let config = Arc::new(
            rustls::ClientConfig::builder()
                .with_root_certificates(roots)
                .with_no_client_auth(),
        );
        let err = TlsIo::client(config, "not a hostname").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }

    #[test]
    fn test_fresh_client_session_is_handshaking() {
        let roots = rustls::RootCertStore::empty();
        let config = Arc::new(
            rustls::ClientConfig::builder()
                .with_root_certificates(roots)
                .with_no_client_auth(),
        );
        let tls = TlsIo::client(config, "example.com").unwrap();
        assert!(tls.is_handshaking());
        // The ClientHello is ready before any fd traffic.
        assert!(tls.has_pending_output());
    }
}
