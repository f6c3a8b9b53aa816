//! Deadline-ordered timers for the reactor.
//!
//! Cancellation is lazy: removed timers stay in the heap until their entry
//! surfaces, at which point the live table no longer vouches for it and the
//! entry is discarded. A periodic timer reschedules from its previous
//! deadline rather than from "now", which keeps long-run drift bounded.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::time::{Duration, Instant};

/// Identifier handed back by [`Timers::add`]; unique for the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId(pub(crate) u64);

struct TimerState {
    deadline: Instant,
    period: Option<Duration>,
}

#[derive(Default)]
pub(crate) struct Timers {
    heap: BinaryHeap<Reverse<(Instant, u64)>>,
    live: HashMap<u64, TimerState>,
    next_id: u64,
}

impl Timers {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Schedule a timer `after` from `now`. A non-zero `period` makes it
    /// periodic.
    pub(crate) fn add(&mut self, now: Instant, after: Duration, period: Option<Duration>) -> TimerId {
        let id = self.next_id;
        self.next_id += 1;

        let period = period.filter(|p| !p.is_zero());
        let deadline = now + after;
        self.live.insert(id, TimerState { deadline, period });
        self.heap.push(Reverse((deadline, id)));
        TimerId(id)
    }

    pub(crate) fn remove(&mut self, id: TimerId) {
        self.live.remove(&id.0);
    }

    pub(crate) fn len(&self) -> usize {
        self.live.len()
    }

    /// Earliest live deadline, discarding stale heap entries on the way.
    pub(crate) fn next_deadline(&mut self) -> Option<Instant> {
        while let Some(Reverse((deadline, id))) = self.heap.peek().copied() {
            match self.live.get(&id) {
                Some(state) if state.deadline == deadline => return Some(deadline),
                _ => {
                    self.heap.pop();
                }
            }
        }
        None
    }

    /// Pop every timer due at `now`, in deadline order. Periodic timers are
    /// rescheduled off their previous deadline; an overdue periodic timer
    /// fires once per missed deadline.
    pub(crate) fn expired(&mut self, now: Instant, out: &mut Vec<TimerId>) {
        while let Some(deadline) = self.next_deadline() {
            if deadline > now {
                break;
            }
            let Reverse((_, id)) = self.heap.pop().expect("validated by next_deadline");

            let state = self.live.get_mut(&id).expect("validated by next_deadline");
            match state.period {
                Some(period) => {
                    state.deadline = deadline + period;
                    self.heap.push(Reverse((state.deadline, id)));
                }
                None => {
                    self.live.remove(&id);
                }
            }
            out.push(TimerId(id));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(timers: &mut Timers, now: Instant) -> Vec<TimerId> {
        let mut out = Vec::new();
        timers.expired(now, &mut out);
        out
    }

    #[test]
    fn test_one_shot_fires_once() {
        let mut timers = Timers::new();
        let t0 = Instant::now();
        let id = timers.add(t0, Duration::from_millis(10), None);

        assert!(drain(&mut timers, t0).is_empty());
        assert_eq!(drain(&mut timers, t0 + Duration::from_millis(10)), vec![id]);
        assert!(drain(&mut timers, t0 + Duration::from_secs(1)).is_empty());
        assert_eq!(timers.len(), 0);
    }

    #[test]
    fn test_deadline_order() {
        let mut timers = Timers::new();
        let t0 = Instant::now();
        let late = timers.add(t0, Duration::from_millis(20), None);
        let early = timers.add(t0, Duration::from_millis(5), None);

        let fired = drain(&mut timers, t0 + Duration::from_millis(30));
        assert_eq!(fired, vec![early, late]);
    }

    #[test]
    fn test_removed_timer_does_not_fire() {
        let mut timers = Timers::new();
        let t0 = Instant::now();
        let id = timers.add(t0, Duration::from_millis(5), None);
        let keep = timers.add(t0, Duration::from_millis(6), None);
        timers.remove(id);

        let fired = drain(&mut timers, t0 + Duration::from_millis(10));
        assert_eq!(fired, vec![keep]);
    }

    #[test]
    fn test_periodic_reschedules_from_deadline() {
        let mut timers = Timers::new();
        let t0 = Instant::now();
        let period = Duration::from_millis(10);
        let id = timers.add(t0, period, Some(period));

        // Fires at t+10 even when observed late; the next deadline is
        // t+20, anchored to the schedule rather than the observation.
        let fired = drain(&mut timers, t0 + Duration::from_millis(13));
        assert_eq!(fired, vec![id]);
        assert_eq!(timers.next_deadline(), Some(t0 + Duration::from_millis(20)));
    }

    #[test]
    fn test_overdue_periodic_fires_per_missed_deadline() {
        let mut timers = Timers::new();
        let t0 = Instant::now();
        let period = Duration::from_millis(10);
        let id = timers.add(t0, period, Some(period));

        // 35ms late: catches up one deadline per call.
        let late = t0 + Duration::from_millis(35);
        assert_eq!(drain(&mut timers, late).len(), 3);
        assert_eq!(timers.next_deadline(), Some(t0 + Duration::from_millis(40)));
        let _ = id;
    }
}
