//! Readiness-multiplexing event loop core.
//!
//! The [`Reactor`] runs on a single main thread and multiplexes file
//! descriptors over a swappable [`Backend`] (level-triggered epoll, or
//! classic poll over a compact table). Each tick it waits for readiness,
//! then yields the tick's events in a fixed dispatch order: fd readiness
//! first, due timers in deadline order, then wake bits posted by worker
//! threads.
//!
//! The reactor owns registrations and timers but no sockets; the session
//! layer maps fd events back to its connections and drives their state
//! machines.

mod backend;
mod reactor;
mod timer;
mod wake;

pub use backend::{Backend, BackendKind, EpollBackend, PollBackend};
pub use reactor::{Event, Reactor};
pub use timer::TimerId;
pub use wake::WakeHandle;

bitflags::bitflags! {
    /// Readiness interest mask for a watcher.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct Interest: u32 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
    }
}
