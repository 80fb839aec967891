// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Bounded waiting.
//!
//! Every busy-poll in the bring-up path goes through here, so that the
//! timeout is always explicit and tests can drive time with a fake `Clock`.

use crate::Clock;

/// A point in time after which a wait gives up.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Deadline {
    at: u64,
}

impl Deadline {
    pub fn after(clock: &impl Clock, ms: u64) -> Self {
        Self {
            at: clock.now().saturating_add(ms),
        }
    }

    pub const fn at(at: u64) -> Self {
        Self { at }
    }

    pub fn expired(&self, clock: &impl Clock) -> bool {
        clock.now() >= self.at
    }

    pub fn remaining(&self, clock: &impl Clock) -> u64 {
        self.at.saturating_sub(clock.now())
    }
}

/// Calls `f` until it produces a value or `timeout` milliseconds pass,
/// sleeping `interval` milliseconds between attempts. `f` is always tried at
/// least once, and once more right at the deadline.
pub fn poll_until<C: Clock, T>(
    clock: &C,
    timeout: u64,
    interval: u64,
    mut f: impl FnMut() -> Option<T>,
) -> Option<T> {
    let deadline = Deadline::after(clock, timeout);
    loop {
        if let Some(v) = f() {
            return Some(v);
        }
        if deadline.expired(clock) {
            return None;
        }
        clock.delay(interval.max(1).min(deadline.remaining(clock).max(1)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::cell::Cell;

    struct FakeClock(Cell<u64>);

    impl Clock for FakeClock {
        fn now(&self) -> u64 {
            self.0.get()
        }
        fn delay(&self, ms: u64) {
            self.0.set(self.0.get() + ms);
        }
    }

    #[test]
    fn gives_up_at_deadline() {
        let clock = FakeClock(Cell::new(100));
        let mut tries = 0;
        let r: Option<()> = poll_until(&clock, 50, 10, || {
            tries += 1;
            None
        });
        assert_eq!(r, None);
        assert_eq!(clock.now(), 150);
        // 100, 110, ..., 150
        assert_eq!(tries, 6);
    }

    #[test]
    fn returns_first_value() {
        let clock = FakeClock(Cell::new(0));
        let r = poll_until(&clock, 1000, 5, || {
            (clock.now() >= 20).then_some(clock.now())
        });
        assert_eq!(r, Some(20));
    }

    #[test]
    fn deadline_arithmetic() {
        let clock = FakeClock(Cell::new(u64::MAX - 1));
        let d = Deadline::after(&clock, 10);
        assert_eq!(d, Deadline::at(u64::MAX));
        assert!(!d.expired(&clock));
        assert_eq!(d.remaining(&clock), 1);
    }
}
