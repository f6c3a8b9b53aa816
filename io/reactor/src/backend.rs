//! Readiness multiplexer backends.
//!
//! Both backends present the same two-call surface to the reactor:
//! `modify` keeps the kernel's registration in sync with an interest mask,
//! and `wait` blocks for readiness and dispatches decoded `(fd, ready)`
//! pairs inline. Error and hangup conditions are reported as both READ and
//! WRITE so the socket layer observes them on its next syscall.

use crate::Interest;
use std::io;
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::time::Duration;
use tracing::error;

/// A readiness multiplexer.
pub trait Backend: Send {
    /// Register, update, or remove interest for `fd`. `old` must be the
    /// mask passed on the previous call (empty on first registration);
    /// an empty `new` removes the registration.
    fn modify(&mut self, fd: RawFd, old: Interest, new: Interest) -> io::Result<()>;

    /// Block up to `timeout` for readiness, invoking `dispatch` once per
    /// ready fd. `EINTR` returns without dispatching; `ENOMEM` is logged
    /// and the tick is retried by the caller.
    fn wait(
        &mut self,
        timeout: Duration,
        dispatch: &mut dyn FnMut(RawFd, Interest),
    ) -> io::Result<()>;

    /// Number of fds currently registered.
    fn registered(&self) -> usize;

    fn name(&self) -> &'static str;
}

/// Which multiplexer implementation to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum BackendKind {
    /// Level-triggered epoll (Linux).
    #[default]
    Epoll,
    /// Classic poll(2) over a compact pollfd table.
    Poll,
}

impl BackendKind {
    pub fn create(self) -> io::Result<Box<dyn Backend>> {
        Ok(match self {
            BackendKind::Epoll => Box::new(EpollBackend::new()?),
            BackendKind::Poll => Box::new(PollBackend::new()),
        })
    }
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackendKind::Epoll => write!(f, "epoll"),
            BackendKind::Poll => write!(f, "poll"),
        }
    }
}

impl std::str::FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "epoll" => Ok(BackendKind::Epoll),
            "poll" => Ok(BackendKind::Poll),
            _ => Err(format!("unknown backend: {}", s)),
        }
    }
}

/// Clamp a timeout to the millisecond resolution of the wait syscalls,
/// rounding up so a timer due in under a millisecond does not busy-spin.
fn timeout_ms(timeout: Duration) -> i32 {
    let ms = timeout.as_millis();
    let ms = if Duration::from_millis(ms as u64) < timeout {
        ms + 1
    } else {
        ms
    };
    ms.min(i32::MAX as u128) as i32
}

// ============================================================================
// epoll
// ============================================================================

/// Level-triggered epoll backend.
pub struct EpollBackend {
    epfd: OwnedFd,
    events: Vec<libc::epoll_event>,
    registered: usize,
}

impl EpollBackend {
    pub fn new() -> io::Result<Self> {
        let fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self {
            epfd: unsafe { OwnedFd::from_raw_fd(fd) },
            events: vec![libc::epoll_event { events: 0, u64: 0 }; 1024],
            registered: 0,
        })
    }

    fn mask_to_epoll(mask: Interest) -> u32 {
        let mut ev = 0;
        if mask.contains(Interest::READ) {
            ev |= libc::EPOLLIN as u32;
        }
        if mask.contains(Interest::WRITE) {
            ev |= libc::EPOLLOUT as u32;
        }
        ev
    }
}

impl Backend for EpollBackend {
    fn modify(&mut self, fd: RawFd, old: Interest, new: Interest) -> io::Result<()> {
        if old == new {
            return Ok(());
        }

        let op = if old.is_empty() {
            libc::EPOLL_CTL_ADD
        } else if new.is_empty() {
            libc::EPOLL_CTL_DEL
        } else {
            libc::EPOLL_CTL_MOD
        };

        let mut ev = libc::epoll_event {
            events: Self::mask_to_epoll(new),
            u64: fd as u64,
        };
        let rc = unsafe { libc::epoll_ctl(self.epfd.as_raw_fd(), op, fd, &mut ev) };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }

        if old.is_empty() {
            self.registered += 1;
        } else if new.is_empty() {
            self.registered -= 1;
        }
        Ok(())
    }

    fn wait(
        &mut self,
        timeout: Duration,
        dispatch: &mut dyn FnMut(RawFd, Interest),
    ) -> io::Result<()> {
        let n = unsafe {
            libc::epoll_wait(
                self.epfd.as_raw_fd(),
                self.events.as_mut_ptr(),
                self.events.len() as i32,
                timeout_ms(timeout),
            )
        };
        if n < 0 {
            let err = io::Error::last_os_error();
            return match err.raw_os_error() {
                Some(libc::EINTR) => Ok(()),
                Some(libc::ENOMEM) => {
                    error!("epoll_wait ENOMEM, retrying next tick");
                    Ok(())
                }
                _ => Err(err),
            };
        }

        for ev in &self.events[..n as usize] {
            let bits = ev.events;
            let hangup = bits & (libc::EPOLLERR | libc::EPOLLHUP) as u32 != 0;
            let mut ready = Interest::empty();
            if hangup || bits & libc::EPOLLIN as u32 != 0 {
                ready |= Interest::READ;
            }
            if hangup || bits & libc::EPOLLOUT as u32 != 0 {
                ready |= Interest::WRITE;
            }
            if !ready.is_empty() {
                dispatch(ev.u64 as RawFd, ready);
            }
        }
        Ok(())
    }

    fn registered(&self) -> usize {
        self.registered
    }

    fn name(&self) -> &'static str {
        "epoll"
    }
}

// ============================================================================
// poll
// ============================================================================

/// poll(2) backend over a compact pollfd array.
///
/// A per-fd index maps into the array; removing a registration swaps the
/// last entry into the vacated slot so the array passed to the kernel
/// stays dense.
pub struct PollBackend {
    fd_index: Vec<i32>,
    poll_fds: Vec<libc::pollfd>,
}

impl PollBackend {
    pub fn new() -> Self {
        Self {
            fd_index: vec![-1; 1024],
            poll_fds: Vec::with_capacity(1024),
        }
    }

    fn mask_to_poll(mask: Interest) -> i16 {
        let mut ev = 0;
        if mask.contains(Interest::READ) {
            ev |= libc::POLLIN;
        }
        if mask.contains(Interest::WRITE) {
            ev |= libc::POLLOUT;
        }
        ev
    }
}

impl Default for PollBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl Backend for PollBackend {
    fn modify(&mut self, fd: RawFd, old: Interest, new: Interest) -> io::Result<()> {
        if old == new {
            return Ok(());
        }

        let fd_usize = fd as usize;
        if self.fd_index.len() <= fd_usize {
            self.fd_index.resize(fd_usize + 1, -1);
        }

        let mut slot = self.fd_index[fd_usize];
        if slot < 0 {
            slot = self.poll_fds.len() as i32;
            self.fd_index[fd_usize] = slot;
            self.poll_fds.push(libc::pollfd {
                fd,
                events: 0,
                revents: 0,
            });
        }
        debug_assert_eq!(self.poll_fds[slot as usize].fd, fd);

        if !new.is_empty() {
            self.poll_fds[slot as usize].events = Self::mask_to_poll(new);
        } else {
            self.fd_index[fd_usize] = -1;
            let last = self.poll_fds.len() - 1;
            let slot = slot as usize;
            if slot < last {
                self.poll_fds.swap(slot, last);
                self.fd_index[self.poll_fds[slot].fd as usize] = slot as i32;
            }
            self.poll_fds.pop();
        }
        Ok(())
    }

    fn wait(
        &mut self,
        timeout: Duration,
        dispatch: &mut dyn FnMut(RawFd, Interest),
    ) -> io::Result<()> {
        let n = unsafe {
            libc::poll(
                self.poll_fds.as_mut_ptr(),
                self.poll_fds.len() as libc::nfds_t,
                timeout_ms(timeout),
            )
        };
        if n < 0 {
            let err = io::Error::last_os_error();
            return match err.raw_os_error() {
                Some(libc::EINTR) => Ok(()),
                Some(libc::ENOMEM) => {
                    error!("poll ENOMEM, retrying next tick");
                    Ok(())
                }
                _ => Err(err),
            };
        }

        let mut remaining = n;
        for p in &self.poll_fds {
            if remaining == 0 {
                break;
            }
            if p.revents == 0 {
                continue;
            }
            remaining -= 1;

            if p.revents & libc::POLLNVAL != 0 {
                error!(fd = p.fd, "poll reported invalid fd");
                debug_assert!(false, "poll invalid fd {}", p.fd);
                continue;
            }

            let hangup = p.revents & (libc::POLLERR | libc::POLLHUP) != 0;
            let mut ready = Interest::empty();
            if hangup || p.revents & libc::POLLIN != 0 {
                ready |= Interest::READ;
            }
            if hangup || p.revents & libc::POLLOUT != 0 {
                ready |= Interest::WRITE;
            }
            if !ready.is_empty() {
                dispatch(p.fd, ready);
            }
        }
        Ok(())
    }

    fn registered(&self) -> usize {
        self.poll_fds.len()
    }

    fn name(&self) -> &'static str {
        "poll"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_backend_kind_from_str() {
        assert_eq!(BackendKind::from_str("epoll").unwrap(), BackendKind::Epoll);
        assert_eq!(BackendKind::from_str("POLL").unwrap(), BackendKind::Poll);
        assert!(BackendKind::from_str("kqueue").is_err());
    }

    #[test]
    fn test_timeout_rounds_up() {
        assert_eq!(timeout_ms(Duration::ZERO), 0);
        assert_eq!(timeout_ms(Duration::from_micros(300)), 1);
        assert_eq!(timeout_ms(Duration::from_millis(5)), 5);
    }

    #[test]
    fn test_poll_slot_compaction() {
        let mut backend = PollBackend::new();

        // Three pipes give six real fds to register.
        let mut fds = Vec::new();
        for _ in 0..3 {
            let mut pair = [0; 2];
            assert_eq!(unsafe { libc::pipe(pair.as_mut_ptr()) }, 0);
            fds.push(pair[0]);
            fds.push(pair[1]);
        }

        for &fd in &fds {
            backend.modify(fd, Interest::empty(), Interest::READ).unwrap();
        }
        assert_eq!(backend.registered(), 6);

        // Remove from the middle; the last entry should fill the hole.
        backend.modify(fds[2], Interest::READ, Interest::empty()).unwrap();
        assert_eq!(backend.registered(), 5);
        for (i, p) in backend.poll_fds.iter().enumerate() {
            assert_eq!(backend.fd_index[p.fd as usize], i as i32);
        }

        for &fd in &fds {
            unsafe { libc::close(fd) };
        }
    }

    #[test]
    fn test_both_backends_see_readable_pipe() {
        for kind in [BackendKind::Epoll, BackendKind::Poll] {
            let mut backend = kind.create().unwrap();

            let mut pair = [0; 2];
            assert_eq!(unsafe { libc::pipe(pair.as_mut_ptr()) }, 0);
            let (rd, wr) = (pair[0], pair[1]);

            backend.modify(rd, Interest::empty(), Interest::READ).unwrap();

            // Nothing written yet: no events.
            let mut hits = Vec::new();
            backend
                .wait(Duration::from_millis(10), &mut |fd, ready| {
                    hits.push((fd, ready))
                })
                .unwrap();
            assert!(hits.is_empty(), "{kind}: spurious event");

            assert_eq!(unsafe { libc::write(wr, b"x".as_ptr().cast(), 1) }, 1);

            backend
                .wait(Duration::from_millis(1000), &mut |fd, ready| {
                    hits.push((fd, ready))
                })
                .unwrap();
            assert_eq!(hits.len(), 1, "{kind}");
            assert_eq!(hits[0].0, rd);
            assert!(hits[0].1.contains(Interest::READ));

            backend.modify(rd, Interest::READ, Interest::empty()).unwrap();
            assert_eq!(backend.registered(), 0);

            unsafe {
                libc::close(rd);
                libc::close(wr);
            }
        }
    }
}
