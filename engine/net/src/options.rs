//! Socket option plumbing and hostname resolution.

use socket2::{SockRef, TcpKeepalive};
use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::os::unix::io::{AsFd, AsRawFd};
use std::time::Duration;

/// Keepalive probing starts after a minute of silence.
const KEEPALIVE_IDLE: Duration = Duration::from_secs(60);

/// Resolve `host:port` synchronously, returning every address. The caller
/// tries them in order; there is no happy-eyeballs racing.
pub fn resolve(host: &str, port: u16) -> io::Result<Vec<SocketAddr>> {
    let addrs: Vec<SocketAddr> = (host, port).to_socket_addrs()?.collect();
    if addrs.is_empty() {
        return Err(io::Error::new(
            io::ErrorKind::NotFound,
            format!("no addresses for {host}"),
        ));
    }
    Ok(addrs)
}

/// Options applied to every connection at accept/connect time.
pub(crate) fn apply_stream_options(
    fd: &impl AsFd,
    user_timeout: Option<Duration>,
) -> io::Result<()> {
    let sock = SockRef::from(fd);
    sock.set_nonblocking(true)?;
    sock.set_nodelay(true)?;
    sock.set_keepalive(true)?;
    sock.set_tcp_keepalive(&TcpKeepalive::new().with_time(KEEPALIVE_IDLE))?;
    if let Some(timeout) = user_timeout {
        set_user_timeout(fd.as_fd().as_raw_fd(), timeout)?;
    }
    Ok(())
}

/// `TCP_USER_TIMEOUT` caps how long sent data may stay unacknowledged
/// before the kernel declares the peer dead. socket2 has no wrapper.
fn set_user_timeout(fd: i32, timeout: Duration) -> io::Result<()> {
    let ms: libc::c_uint = timeout.as_millis().min(libc::c_uint::MAX as u128) as libc::c_uint;
    let rc = unsafe {
        libc::setsockopt(
            fd,
            libc::IPPROTO_TCP,
            libc::TCP_USER_TIMEOUT,
            (&ms as *const libc::c_uint).cast(),
            std::mem::size_of::<libc::c_uint>() as libc::socklen_t,
        )
    };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}
