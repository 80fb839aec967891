// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! A timer multiplexer for event loops that own their notion of time.
//!
//! `Multitimer` tracks several independent deadlines, one per variant of an
//! enum deriving `enum_map::Enum`. It never reads a clock itself: the loop
//! that owns it reads its `Clock`, calls [`Multitimer::poll`] with the result,
//! and then drains [`Multitimer::iter_fired`]. This is what lets the
//! synchronization engines run unchanged against a virtual clock in tests.
//!
//! The expected usage model is:
//!
//! - Create an `enum` naming your timers and derive `Enum` for it.
//! - Arm timers with [`Multitimer::set_timer`].
//! - Each time around the loop, `poll(now)` and act on `iter_fired()`.
//! - Use [`Multitimer::next_deadline`] to decide how long the loop may idle.

#![cfg_attr(not(test), no_std)]

use enum_map::{EnumArray, EnumMap};

pub struct Multitimer<E: EnumArray<Timer>> {
    timers: EnumMap<E, Timer>,
}

impl<E: EnumArray<Timer> + Copy> Default for Multitimer<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: EnumArray<Timer> + Copy> Multitimer<E> {
    pub fn new() -> Self {
        Self {
            timers: EnumMap::default(),
        }
    }

    /// Arms `which` to fire at `deadline`, replacing any earlier setting. A
    /// firing that has not been observed yet survives the re-arm.
    pub fn set_timer(
        &mut self,
        which: E,
        deadline: u64,
        repeat: Option<Repeat>,
    ) {
        self.timers[which].deadline = Some((deadline, repeat));
    }

    pub fn get_timer(&self, which: E) -> Option<(u64, Option<Repeat>)> {
        self.timers[which].deadline
    }

    /// Disarms `which`, returning whether it was armed. Pending firings are
    /// discarded too.
    pub fn clear_timer(&mut self, which: E) -> bool {
        let t = &mut self.timers[which];
        t.fired_but_not_observed = false;
        t.deadline.take().is_some()
    }

    /// The earliest armed deadline, if any.
    pub fn next_deadline(&self) -> Option<u64> {
        self.timers
            .values()
            .filter_map(|t| t.deadline)
            .map(|(dl, _)| dl)
            .min()
    }

    /// Marks every timer whose deadline is at or before `now` as fired,
    /// re-arming repeating timers and disarming the rest.
    pub fn poll(&mut self, now: u64) {
        for timer in self.timers.values_mut() {
            let Some((dl, repeat)) = timer.deadline else {
                continue;
            };
            if dl > now {
                continue;
            }
            timer.deadline = repeat.map(|r| {
                let next = match r {
                    Repeat::AfterWake(period) => now.saturating_add(period),
                    Repeat::AfterDeadline(period) => dl.saturating_add(period),
                };
                (next, repeat)
            });
            timer.fired_but_not_observed = true;
        }
    }

    /// Returns (and forgets) every timer that has fired since it was last
    /// observed, in `Enum` declaration order. Several firings of one timer
    /// collapse into one. Timers not consumed before the iterator is dropped
    /// show up next time.
    pub fn iter_fired(&mut self) -> impl Iterator<Item = E> + '_ {
        self.timers.iter_mut().filter_map(|(e, timer)| {
            core::mem::replace(&mut timer.fired_but_not_observed, false)
                .then_some(e)
        })
    }

    /// Convenience for loops that only care about one timer: consumes and
    /// reports a pending firing of `which`.
    pub fn take_fired(&mut self, which: E) -> bool {
        core::mem::replace(&mut self.timers[which].fired_but_not_observed, false)
    }
}

#[derive(Copy, Clone, Default)]
pub struct Timer {
    deadline: Option<(u64, Option<Repeat>)>,
    fired_but_not_observed: bool,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Repeat {
    /// Next deadline is `period` after the poll that noticed the firing.
    AfterWake(u64),
    /// Next deadline is `period` after the previous deadline.
    AfterDeadline(u64),
}
