//! Cross-thread wake channel.
//!
//! Worker threads post signal bits and kick an eventfd; the reactor drains
//! the eventfd as one more fd in its backend and surfaces the accumulated
//! bits as a wake event for the owning slot. Bits are sticky until the
//! reactor swaps them out, so coalesced posts lose no information.

use std::io;
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tracing::warn;

pub(crate) struct WakeChannel {
    eventfd: Arc<OwnedFd>,
    slots: Vec<Arc<AtomicU32>>,
}

impl WakeChannel {
    pub(crate) fn new() -> io::Result<Self> {
        let fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self {
            eventfd: Arc::new(unsafe { OwnedFd::from_raw_fd(fd) }),
            slots: Vec::new(),
        })
    }

    pub(crate) fn fd(&self) -> RawFd {
        self.eventfd.as_raw_fd()
    }

    /// Allocate a slot and return its sender handle.
    pub(crate) fn add_slot(&mut self) -> (usize, WakeHandle) {
        let bits = Arc::new(AtomicU32::new(0));
        let slot = self.slots.len();
        self.slots.push(bits.clone());
        (
            slot,
            WakeHandle {
                bits,
                eventfd: self.eventfd.clone(),
            },
        )
    }

    /// Consume the eventfd counter.
    pub(crate) fn drain(&self) {
        let mut counter = 0u64;
        loop {
            let n = unsafe {
                libc::read(
                    self.eventfd.as_raw_fd(),
                    (&mut counter as *mut u64).cast(),
                    8,
                )
            };
            if n == 8 {
                continue;
            }
            break;
        }
    }

    /// Swap out pending bits per slot, yielding `(slot, bits)` for each
    /// slot with work posted.
    pub(crate) fn take_pending(&self, out: &mut Vec<(usize, u32)>) {
        for (slot, bits) in self.slots.iter().enumerate() {
            let pending = bits.swap(0, Ordering::Acquire);
            if pending != 0 {
                out.push((slot, pending));
            }
        }
    }
}

/// Thread-safe sender half of a wake slot.
#[derive(Clone)]
pub struct WakeHandle {
    bits: Arc<AtomicU32>,
    eventfd: Arc<OwnedFd>,
}

impl WakeHandle {
    /// Post signal bits and wake the reactor if it is blocked in `wait`.
    pub fn post(&self, bits: u32) {
        debug_assert!(bits != 0, "posting empty wake bits");
        self.bits.fetch_or(bits, Ordering::Release);

        let one: u64 = 1;
        let n = unsafe {
            libc::write(self.eventfd.as_raw_fd(), (&one as *const u64).cast(), 8)
        };
        if n != 8 {
            // EAGAIN means the counter is saturated, which still wakes the
            // reader; anything else is worth a log line.
            let err = io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::EAGAIN) {
                warn!("eventfd wake failed: {err}");
            }
        }
    }
}
