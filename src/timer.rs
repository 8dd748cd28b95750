use std::collections::BTreeMap;
use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::dev::DevId;
use crate::event::IoHandler;
use crate::registry::PumpId;

/// Identity of a registered [`Timer`]. Monotonic, shares the id space
/// discipline with [`crate::dev::DevId`] (starts at 100, never reused).
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TimerId(pub u64);

impl fmt::Display for TimerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Reserved `cmd_id` whose `para` is interpreted as a dev id to close,
/// used by the linger-close path (spec §4.4, `IOTCMD_IDLE` in the
/// original's `iotimer.h`).
pub const IOTCMD_IDLE: i64 = 1;

#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct Deadline {
    secs: u64,
    millis: u32,
}

impl Deadline {
    pub fn after(ms: u64) -> Deadline {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        let target = now + Duration::from_millis(ms);
        Deadline {
            secs: target.as_secs(),
            millis: target.subsec_millis(),
        }
    }

    pub fn now() -> Deadline {
        Deadline::after(0)
    }

    /// Milliseconds from now until this deadline, saturating at zero for
    /// deadlines already in the past.
    pub fn remaining_ms(&self) -> u64 {
        let now = Deadline::now();
        if *self <= now {
            return 0;
        }
        let secs_diff = self.secs.saturating_sub(now.secs);
        (secs_diff * 1000).saturating_add(self.millis as u64).saturating_sub(now.millis as u64)
    }
}

pub struct Timer {
    pub id: TimerId,
    pub cmd_id: i64,
    pub deadline: Deadline,
    pub owning_pump: Option<PumpId>,
    pub caller_thread: u64,
    pub dev_for_idle: Option<DevId>,
    pub handler: Option<IoHandler>,
}

/// Per-pump ordered index of live timers, keyed by `(deadline, id)` so
/// ties break by allocation order (spec §3's "Timer" invariant). A
/// `BTreeMap` stands in for the original's RB-tree: it gives both
/// ordered "pop the minimum" access for `check_timeout` and O(log n)
/// point removal by key for `iotimer_stop`, which a binary heap alone
/// cannot do without an auxiliary index.
#[derive(Default)]
pub struct TimerWheel {
    by_deadline: BTreeMap<(Deadline, TimerId), Timer>,
}

impl TimerWheel {
    pub fn new() -> TimerWheel {
        TimerWheel::default()
    }

    pub fn insert(&mut self, timer: Timer) {
        self.by_deadline.insert((timer.deadline, timer.id), timer);
    }

    pub fn remove(&mut self, id: TimerId, deadline: Deadline) -> Option<Timer> {
        self.by_deadline.remove(&(deadline, id))
    }

    /// Finds a live timer by id alone, for callers (`iotimer_stop`) that
    /// don't have the deadline handy. O(n) — acceptable since stop is far
    /// rarer than fire in this design; if that changes, add an id→deadline
    /// side index.
    pub fn find_deadline(&self, id: TimerId) -> Option<Deadline> {
        self.by_deadline
            .keys()
            .find(|(_, tid)| *tid == id)
            .map(|(d, _)| *d)
    }

    pub fn is_empty(&self) -> bool {
        self.by_deadline.is_empty()
    }

    pub fn len(&self) -> usize {
        self.by_deadline.len()
    }

    /// Pops every timer whose deadline has elapsed, in non-decreasing
    /// deadline order (spec §3, testable property 2).
    pub fn pop_expired(&mut self, now: Deadline) -> Vec<Timer> {
        let mut expired = Vec::new();
        loop {
            let Some((&key, _)) = self.by_deadline.iter().next() else {
                break;
            };
            if key.0 > now {
                break;
            }
            if let Some(timer) = self.by_deadline.remove(&key) {
                expired.push(timer);
            }
        }
        expired
    }

    /// Milliseconds until the next timer fires, or `None` if the wheel is
    /// empty (meaning the pump may block indefinitely on its next
    /// `poller.dispatch`, per spec §4.6 step `a`).
    pub fn next_timeout_ms(&self) -> Option<u64> {
        self.by_deadline
            .keys()
            .next()
            .map(|(deadline, _)| deadline.remaining_ms())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn timer(id: u64, deadline: Deadline) -> Timer {
        Timer {
            id: TimerId(id),
            cmd_id: 0,
            deadline,
            owning_pump: None,
            caller_thread: 0,
            dev_for_idle: None,
            handler: None,
        }
    }

    #[test]
    fn pops_in_non_decreasing_deadline_order() {
        let mut wheel = TimerWheel::new();
        let base = Deadline::after(0);
        for (id, ms) in [(1, 30), (2, 10), (3, 20)] {
            wheel.insert(timer(id, Deadline::after(ms)));
        }
        std::thread::sleep(Duration::from_millis(40));
        let expired = wheel.pop_expired(Deadline::now());
        let ids: Vec<u64> = expired.iter().map(|t| t.id.0).collect();
        assert_eq!(ids, vec![2, 3, 1]);
        let _ = base;
    }

    #[test]
    fn stop_after_start_prevents_firing() {
        let mut wheel = TimerWheel::new();
        let deadline = Deadline::after(5);
        wheel.insert(timer(1, deadline));
        let removed = wheel.remove(TimerId(1), deadline);
        assert!(removed.is_some());
        std::thread::sleep(Duration::from_millis(10));
        assert!(wheel.pop_expired(Deadline::now()).is_empty());
    }
}
