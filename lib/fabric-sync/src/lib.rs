// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Node synchronization for fabric bring-up.
//!
//! One node, the coordinator, walks every node through the same sequence of
//! bring-up commands by broadcast:
//!
//! ```text
//! Startup ──> TrainPhys ──> SetupRouting ──> LoadFabric ──> CheckFabric ──> Continue
//!                ^
//! ResetFabric ───┘        (any link/fabric-not-ready report leads back here)
//! WarmReset               (fabric check failed, or a restart was requested)
//! ```
//!
//! Every other node, a follower, executes each command it has not seen
//! before and reports the result under the command's transaction id. The
//! coordinator moves on once it holds the expected result from every
//! follower and from itself, all for the current transaction id.
//!
//! The transport is lossy, so both sides repeat their last message with
//! exponential backoff until it is superseded, and command handlers must be
//! safe to run again.
//!
//! The engines here do no I/O and read no clock. They are handed received
//! messages, handler results and the current time, and they return the
//! [`Action`]s the caller must carry out.

#![cfg_attr(not(test), no_std)]

use drv_fabric_api::{MacAddr, SciId, MAX_NODES};
use enum_map::Enum;
use fabric_msgs::{StateBcast, SyncState};

mod coordinator;
mod follower;

pub use coordinator::{Coordinator, Trace as CoordinatorTrace};
pub use follower::{Follower, Trace as FollowerTrace};

/// A node taking part in synchronization.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Member {
    pub sci: SciId,
    pub mac: MacAddr,
}

impl Member {
    /// Builds the broadcast this member sends for `state` under `tid`.
    pub fn bcast(&self, state: SyncState, tid: u32) -> StateBcast {
        StateBcast::new(state, self.mac.0, self.sci.raw(), tid)
    }

    /// Whether `msg` really comes from this member.
    pub fn sent(&self, msg: &StateBcast) -> bool {
        msg.sci == self.sci.raw() && msg.mac == self.mac.0
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct SyncParams {
    /// How many times the fabric may go back through `ResetFabric` before
    /// we give up.
    pub max_fabric_retries: u32,
    pub backoff_initial_ms: u64,
    pub backoff_max_ms: u64,
    /// How many times the coordinator repeats `WarmReset` before resetting
    /// itself.
    pub warm_reset_broadcasts: u32,
    /// How long a follower keeps answering after acknowledging `Continue`.
    pub linger_ms: u64,
}

impl Default for SyncParams {
    fn default() -> Self {
        Self {
            max_fabric_retries: 8,
            backoff_initial_ms: 10,
            backoff_max_ms: 640,
            warm_reset_broadcasts: 4,
            linger_ms: 2000,
        }
    }
}

/// Something the caller of an engine must do.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Action {
    /// Broadcast this message.
    Send(StateBcast),
    /// Run the handler for this command, and report its result back to the
    /// engine.
    Execute(SyncState),
    /// Synchronization is over; the fabric is up.
    Done,
    /// Reset the platform. Nothing else should be done afterwards.
    WarmReset,
}

pub type Actions = heapless::Vec<Action, 4>;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SyncError {
    /// The fabric failed to come up after this many resets.
    RetryLimit(u32),
    /// Our own handler reported something other than the expected answer
    /// or a failure.
    UnexpectedResult {
        command: SyncState,
        result: SyncState,
    },
    TooManyMembers,
    /// The same coordinate or station address appears twice.
    DuplicateMember(SciId),
}

/// Resend interval: starts small and doubles on every resend up to a cap.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Backoff {
    initial: u64,
    max: u64,
    current: u64,
}

impl Backoff {
    pub fn new(initial: u64, max: u64) -> Self {
        let initial = initial.max(1);
        Self {
            initial,
            max: max.max(initial),
            current: initial,
        }
    }

    /// Returns the delay to wait now, and doubles the next one.
    pub fn next_delay(&mut self) -> u64 {
        let d = self.current;
        self.current = self.current.saturating_mul(2).min(self.max);
        d
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Enum)]
enum Timer {
    Resend,
    Linger,
}

/// A coordinator or a follower, for callers that drive either.
pub enum Engine {
    Coordinator(Coordinator),
    Follower(Follower),
}

impl Engine {
    pub fn start(&mut self, now: u64) -> Actions {
        match self {
            Engine::Coordinator(c) => c.start(now),
            Engine::Follower(_) => Actions::new(),
        }
    }

    pub fn on_message(
        &mut self,
        msg: &StateBcast,
        now: u64,
    ) -> Result<Actions, SyncError> {
        match self {
            Engine::Coordinator(c) => c.on_message(msg, now),
            Engine::Follower(f) => Ok(f.on_message(msg, now)),
        }
    }

    /// Reports the result of the command last handed out by
    /// `Action::Execute`.
    pub fn completed(
        &mut self,
        result: SyncState,
        now: u64,
    ) -> Result<Actions, SyncError> {
        match self {
            Engine::Coordinator(c) => c.local_result(result, now),
            Engine::Follower(f) => Ok(f.complete(result, now)),
        }
    }

    /// Asks for the fabric to be brought up again. Only the coordinator can
    /// do that; a follower ignores the request.
    pub fn request_restart(&mut self, now: u64) -> Result<Actions, SyncError> {
        match self {
            Engine::Coordinator(c) => c.request_restart(now),
            Engine::Follower(_) => Ok(Actions::new()),
        }
    }

    pub fn poll(&mut self, now: u64) -> Actions {
        match self {
            Engine::Coordinator(c) => c.poll(now),
            Engine::Follower(f) => f.poll(now),
        }
    }

    pub fn next_deadline(&self) -> Option<u64> {
        match self {
            Engine::Coordinator(c) => c.next_deadline(),
            Engine::Follower(f) => f.next_deadline(),
        }
    }

    pub fn is_coordinator(&self) -> bool {
        matches!(self, Engine::Coordinator(_))
    }
}

// Capacity is sized so that no engine ever produces more actions at once.
fn push(actions: &mut Actions, a: Action) {
    let _ = actions.push(a);
}

fn check_members(me: &Member, members: &[Member]) -> Result<(), SyncError> {
    if members.len() >= MAX_NODES {
        return Err(SyncError::TooManyMembers);
    }
    for (i, m) in members.iter().enumerate() {
        let dup = |o: &Member| o.sci == m.sci || o.mac == m.mac;
        if dup(me) || members[..i].iter().any(dup) {
            return Err(SyncError::DuplicateMember(m.sci));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_to_cap() {
        let mut b = Backoff::new(10, 50);
        let got: std::vec::Vec<_> = (0..5).map(|_| b.next_delay()).collect();
        assert_eq!(got, [10, 20, 40, 50, 50]);
        b.reset();
        assert_eq!(b.next_delay(), 10);
    }

    #[test]
    fn only_the_coordinator_restarts() {
        let m = |n| Member {
            sci: SciId::new(n).unwrap(),
            mac: MacAddr([0, 0, 0, 0, 0, n as u8]),
        };
        let params = SyncParams::default();
        let mut f = Engine::Follower(Follower::new(m(1), m(0), params));
        assert_eq!(f.request_restart(0), Ok(Actions::new()));

        let mut c =
            Engine::Coordinator(Coordinator::new(m(0), &[m(1)], params).unwrap());
        c.start(0);
        let out = c.request_restart(0).unwrap();
        assert!(out.contains(&Action::Execute(SyncState::ResetFabric)));
    }

    #[test]
    fn members_must_be_distinct() {
        let m = |sci, mac| Member {
            sci: SciId::new(sci).unwrap(),
            mac: MacAddr([0, 0, 0, 0, 0, mac]),
        };
        assert!(check_members(&m(0, 0), &[m(1, 1), m(2, 2)]).is_ok());
        assert_eq!(
            check_members(&m(0, 0), &[m(1, 1), m(2, 1)]),
            Err(SyncError::DuplicateMember(SciId::new(2).unwrap()))
        );
        assert_eq!(
            check_members(&m(0, 0), &[m(0, 3)]),
            Err(SyncError::DuplicateMember(SciId::new(0).unwrap()))
        );
    }
}
