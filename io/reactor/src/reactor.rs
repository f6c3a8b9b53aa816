//! The reactor: one tick = wait for readiness, then surface fd events,
//! due timers, and posted worker wakes, in that order.

use crate::backend::{Backend, BackendKind};
use crate::timer::{TimerId, Timers};
use crate::wake::{WakeChannel, WakeHandle};
use crate::Interest;
use std::collections::HashMap;
use std::io;
use std::os::unix::io::RawFd;
use std::time::{Duration, Instant, SystemTime};

/// Upper bound on a tick's sleep when no timer is due sooner.
const IDLE_TIMEOUT: Duration = Duration::from_millis(100);

/// One dispatchable occurrence from a reactor tick.
///
/// Within a tick, `Io` events come first in backend order, then `Timer`
/// events in deadline order, then `Wake` events in slot order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    /// `fd` is ready for the directions in `ready`.
    Io { fd: RawFd, ready: Interest },
    /// The timer `id` reached its deadline.
    Timer { id: TimerId },
    /// A thread posted `bits` on wake slot `slot`.
    Wake { slot: usize, bits: u32 },
}

/// Main-thread event loop core: watcher registrations, timers, and the
/// cross-thread wake channel, multiplexed over a swappable [`Backend`].
pub struct Reactor {
    backend: Box<dyn Backend>,
    interest: HashMap<RawFd, Interest>,
    timers: Timers,
    wake: WakeChannel,
    now: Instant,
    now_wall: SystemTime,
    stop: bool,
    timer_scratch: Vec<TimerId>,
    wake_scratch: Vec<(usize, u32)>,
}

impl Reactor {
    pub fn new(kind: BackendKind) -> io::Result<Self> {
        let mut backend = kind.create()?;
        let wake = WakeChannel::new()?;
        backend.modify(wake.fd(), Interest::empty(), Interest::READ)?;

        Ok(Self {
            backend,
            interest: HashMap::new(),
            timers: Timers::new(),
            wake,
            now: Instant::now(),
            now_wall: SystemTime::now(),
            stop: false,
            timer_scratch: Vec::new(),
            wake_scratch: Vec::new(),
        })
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    /// Monotonic clock sampled at the start of the current tick.
    pub fn now(&self) -> Instant {
        self.now
    }

    /// Wall clock sampled at the start of the current tick.
    pub fn now_wall(&self) -> SystemTime {
        self.now_wall
    }

    /// Set the interest mask for `fd`, registering on first non-empty mask
    /// and deregistering when the mask becomes empty.
    pub fn modify_interest(&mut self, fd: RawFd, new: Interest) -> io::Result<()> {
        let old = self.interest.get(&fd).copied().unwrap_or_default();
        if old == new {
            return Ok(());
        }
        self.backend.modify(fd, old, new)?;
        if new.is_empty() {
            self.interest.remove(&fd);
        } else {
            self.interest.insert(fd, new);
        }
        Ok(())
    }

    /// The interest mask currently registered for `fd`.
    pub fn interest(&self, fd: RawFd) -> Interest {
        self.interest.get(&fd).copied().unwrap_or_default()
    }

    /// Number of registered watchers (the internal wake fd not included).
    pub fn watcher_count(&self) -> usize {
        self.interest.len()
    }

    /// Schedule a timer `after` from now; a non-zero `period` repeats it.
    pub fn add_timer(&mut self, after: Duration, period: Option<Duration>) -> TimerId {
        self.timers.add(Instant::now(), after, period)
    }

    pub fn remove_timer(&mut self, id: TimerId) {
        self.timers.remove(id);
    }

    pub fn timer_count(&self) -> usize {
        self.timers.len()
    }

    /// Allocate a wake slot for a worker thread.
    pub fn wake_slot(&mut self) -> (usize, WakeHandle) {
        self.wake.add_slot()
    }

    /// Ask the drive loop to exit after the current tick drains.
    pub fn request_stop(&mut self) {
        self.stop = true;
    }

    pub fn stop_requested(&self) -> bool {
        self.stop
    }

    /// Run one tick: block until readiness or the next deadline, then fill
    /// `events` with this tick's fd, timer, and wake events in dispatch
    /// order.
    pub fn poll(&mut self, events: &mut Vec<Event>) -> io::Result<()> {
        events.clear();
        self.now = Instant::now();
        self.now_wall = SystemTime::now();

        let timeout = match self.timers.next_deadline() {
            Some(deadline) => deadline
                .saturating_duration_since(self.now)
                .min(IDLE_TIMEOUT),
            None => IDLE_TIMEOUT,
        };

        let wake_fd = self.wake.fd();
        let mut wake_ready = false;
        self.backend.wait(timeout, &mut |fd, ready| {
            if fd == wake_fd {
                wake_ready = true;
                return;
            }
            events.push(Event::Io { fd, ready });
        })?;
        if wake_ready {
            self.wake.drain();
        }

        // Timers observe the post-wait clock; the wait itself consumed time.
        self.now = Instant::now();
        self.timer_scratch.clear();
        self.timers.expired(self.now, &mut self.timer_scratch);
        for id in &self.timer_scratch {
            events.push(Event::Timer { id: *id });
        }

        // Posted bits are checked every tick, not only when the eventfd
        // fired, so a post racing the wait is picked up immediately.
        self.wake_scratch.clear();
        self.wake.take_pending(&mut self.wake_scratch);
        for &(slot, bits) in &self.wake_scratch {
            events.push(Event::Wake { slot, bits });
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timer_fires_through_poll() {
        let mut reactor = Reactor::new(BackendKind::Poll).unwrap();
        let id = reactor.add_timer(Duration::from_millis(20), None);

        let mut events = Vec::new();
        let deadline = Instant::now() + Duration::from_secs(2);
        loop {
            reactor.poll(&mut events).unwrap();
            if events.contains(&Event::Timer { id }) {
                break;
            }
            assert!(Instant::now() < deadline, "timer never fired");
        }
        assert_eq!(reactor.timer_count(), 0);
    }

    #[test]
    fn test_wake_interrupts_idle_poll() {
        let mut reactor = Reactor::new(BackendKind::Epoll).unwrap();
        let (slot, handle) = reactor.wake_slot();

        let poster = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(10));
            handle.post(0b11);
        });

        let mut events = Vec::new();
        let start = Instant::now();
        let deadline = start + Duration::from_secs(2);
        loop {
            reactor.poll(&mut events).unwrap();
            if events.contains(&Event::Wake { slot, bits: 0b11 }) {
                break;
            }
            assert!(Instant::now() < deadline, "wake never surfaced");
        }
        poster.join().unwrap();
    }

    #[test]
    fn test_tick_orders_io_before_timer_before_wake() {
        let mut reactor = Reactor::new(BackendKind::Poll).unwrap();

        let mut pair = [0; 2];
        assert_eq!(unsafe { libc::pipe(pair.as_mut_ptr()) }, 0);
        let (rd, wr) = (pair[0], pair[1]);
        reactor.modify_interest(rd, Interest::READ).unwrap();
        assert_eq!(unsafe { libc::write(wr, b"x".as_ptr().cast(), 1) }, 1);

        let id = reactor.add_timer(Duration::ZERO, None);
        let (slot, handle) = reactor.wake_slot();
        handle.post(1);

        let mut events = Vec::new();
        reactor.poll(&mut events).unwrap();

        let io_pos = events
            .iter()
            .position(|e| matches!(e, Event::Io { fd, .. } if *fd == rd));
        let timer_pos = events.iter().position(|e| *e == Event::Timer { id });
        let wake_pos = events.iter().position(|e| *e == Event::Wake { slot, bits: 1 });

        let (io_pos, timer_pos, wake_pos) = (
            io_pos.expect("io event"),
            timer_pos.expect("timer event"),
            wake_pos.expect("wake event"),
        );
        assert!(io_pos < timer_pos && timer_pos < wake_pos);

        reactor.modify_interest(rd, Interest::empty()).unwrap();
        assert_eq!(reactor.watcher_count(), 0);
        unsafe {
            libc::close(rd);
            libc::close(wr);
        }
    }

    #[test]
    fn test_interest_bookkeeping() {
        let mut reactor = Reactor::new(BackendKind::Poll).unwrap();

        let mut pair = [0; 2];
        assert_eq!(unsafe { libc::pipe(pair.as_mut_ptr()) }, 0);
        let rd = pair[0];

        assert_eq!(reactor.interest(rd), Interest::empty());
        reactor.modify_interest(rd, Interest::READ).unwrap();
        assert_eq!(reactor.interest(rd), Interest::READ);
        reactor
            .modify_interest(rd, Interest::READ | Interest::WRITE)
            .unwrap();
        assert_eq!(reactor.interest(rd), Interest::READ | Interest::WRITE);
        reactor.modify_interest(rd, Interest::empty()).unwrap();
        assert_eq!(reactor.watcher_count(), 0);

        unsafe {
            libc::close(pair[0]);
            libc::close(pair[1]);
        }
    }
}
