// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use drv_fabric_api::MAX_NODES;
use fabric_msgs::{StateBcast, SyncState};
use heapless::Vec;
use multitimer::Multitimer;
use ringbuf::{ringbuf_entry, Ringbuf};

use crate::{
    check_members, push, Action, Actions, Backoff, Member, SyncError,
    SyncParams, Timer,
};

#[derive(Copy, Clone, Debug, PartialEq)]
pub enum Trace {
    Issue { state: SyncState, tid: u32 },
    Resend { state: SyncState, tid: u32 },
    Ack { sci: u16, tid: u32 },
    Failure { sci: u16, state: SyncState },
    LocalResult(SyncState),
    Quorum { state: SyncState, tid: u32 },
    Retry(u32),
    RestartRequested(SyncState),
    Stale { sci: u16, tid: u32 },
    UnknownSender { sci: u16 },
    Unexpected { sci: u16, state: SyncState },
    WarmResetSent(u32),
    Done,
}

/// Drives every member through the bring-up sequence.
pub struct Coordinator {
    me: Member,
    members: Vec<Member, MAX_NODES>,
    params: SyncParams,
    state: SyncState,
    tid: u32,
    /// Bit `i` is set once `members[i]` has answered the current `tid`.
    seen: u32,
    local: Option<SyncState>,
    retries: u32,
    warm_resets_sent: u32,
    done: bool,
    backoff: Backoff,
    timers: Multitimer<Timer>,
    trace: Ringbuf<Trace, 32>,
}

impl Coordinator {
    /// `members` is everyone but us.
    pub fn new(
        me: Member,
        members: &[Member],
        params: SyncParams,
    ) -> Result<Self, SyncError> {
        check_members(&me, members)?;
        Ok(Self {
            me,
            members: Vec::from_slice(members)
                .map_err(|_| SyncError::TooManyMembers)?,
            params,
            state: SyncState::Startup,
            tid: 0,
            seen: 0,
            local: None,
            retries: 0,
            warm_resets_sent: 0,
            done: false,
            backoff: Backoff::new(
                params.backoff_initial_ms,
                params.backoff_max_ms,
            ),
            timers: Multitimer::new(),
            trace: Ringbuf::new(),
        })
    }

    /// Issues `Startup`.
    pub fn start(&mut self, now: u64) -> Actions {
        self.issue(SyncState::Startup, now)
    }

    pub fn state(&self) -> SyncState {
        self.state
    }

    pub fn tid(&self) -> u32 {
        self.tid
    }

    pub fn retries(&self) -> u32 {
        self.retries
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Whether `members[i]` has answered the current command.
    pub fn has_seen(&self, i: usize) -> bool {
        self.seen & (1 << i) != 0
    }

    pub fn trace(&self) -> &Ringbuf<Trace, 32> {
        &self.trace
    }

    pub fn next_deadline(&self) -> Option<u64> {
        self.timers.next_deadline()
    }

    pub fn on_message(
        &mut self,
        msg: &StateBcast,
        now: u64,
    ) -> Result<Actions, SyncError> {
        let Some(i) = self.members.iter().position(|m| m.sent(msg)) else {
            ringbuf_entry!(self.trace, Trace::UnknownSender { sci: msg.sci });
            return Ok(Actions::new());
        };
        if self.done || self.state == SyncState::WarmReset {
            return Ok(Actions::new());
        }
        if msg.tid != self.tid {
            ringbuf_entry!(
                self.trace,
                Trace::Stale {
                    sci: msg.sci,
                    tid: msg.tid
                }
            );
            return Ok(Actions::new());
        }

        if msg.state.requests_retry() || msg.state.requests_warm_reset() {
            ringbuf_entry!(
                self.trace,
                Trace::Failure {
                    sci: msg.sci,
                    state: msg.state
                }
            );
            return self.fail(msg.state, now);
        }
        if Some(msg.state) != self.state.expected_response() {
            ringbuf_entry!(
                self.trace,
                Trace::Unexpected {
                    sci: msg.sci,
                    state: msg.state
                }
            );
            return Ok(Actions::new());
        }

        ringbuf_entry!(
            self.trace,
            Trace::Ack {
                sci: msg.sci,
                tid: msg.tid
            }
        );
        self.seen |= 1 << i;
        self.advance(now)
    }

    /// Result of our own handler for the command we last asked to be
    /// executed.
    pub fn local_result(
        &mut self,
        result: SyncState,
        now: u64,
    ) -> Result<Actions, SyncError> {
        if self.done || self.state == SyncState::WarmReset {
            return Ok(Actions::new());
        }
        ringbuf_entry!(self.trace, Trace::LocalResult(result));
        if result.requests_retry() || result.requests_warm_reset() {
            return self.fail(result, now);
        }
        if Some(result) != self.state.expected_response() {
            return Err(SyncError::UnexpectedResult {
                command: self.state,
                result,
            });
        }
        self.local = Some(result);
        self.advance(now)
    }

    /// Asks for the fabric to be brought up again. While checking the
    /// fabric this can only be done with a platform reset; before that a
    /// fabric reset will do.
    pub fn request_restart(
        &mut self,
        now: u64,
    ) -> Result<Actions, SyncError> {
        if self.done || self.state == SyncState::WarmReset {
            return Ok(Actions::new());
        }
        ringbuf_entry!(self.trace, Trace::RestartRequested(self.state));
        if self.state == SyncState::CheckFabric {
            Ok(self.issue(SyncState::WarmReset, now))
        } else {
            self.retry(now)
        }
    }

    /// Repeats the current command if its resend timer has expired.
    pub fn poll(&mut self, now: u64) -> Actions {
        let mut out = Actions::new();
        self.timers.poll(now);
        if !self.timers.take_fired(Timer::Resend) || self.done {
            return out;
        }

        ringbuf_entry!(
            self.trace,
            Trace::Resend {
                state: self.state,
                tid: self.tid
            }
        );
        push(&mut out, Action::Send(self.me.bcast(self.state, self.tid)));

        if self.state == SyncState::WarmReset {
            self.warm_resets_sent += 1;
            ringbuf_entry!(self.trace, Trace::WarmResetSent(self.warm_resets_sent));
            if self.warm_resets_sent >= self.params.warm_reset_broadcasts {
                push(&mut out, Action::WarmReset);
                return out;
            }
            // Resets are repeated at a steady pace.
            self.timers.set_timer(
                Timer::Resend,
                now + self.params.backoff_initial_ms.max(1),
                None,
            );
        } else {
            let d = self.backoff.next_delay();
            self.timers.set_timer(Timer::Resend, now + d, None);
        }
        out
    }

    fn fail(
        &mut self,
        why: SyncState,
        now: u64,
    ) -> Result<Actions, SyncError> {
        if why.requests_warm_reset() {
            Ok(self.issue(SyncState::WarmReset, now))
        } else {
            self.retry(now)
        }
    }

    fn retry(&mut self, now: u64) -> Result<Actions, SyncError> {
        self.retries += 1;
        ringbuf_entry!(self.trace, Trace::Retry(self.retries));
        if self.retries > self.params.max_fabric_retries {
            return Err(SyncError::RetryLimit(self.retries - 1));
        }
        Ok(self.issue(SyncState::ResetFabric, now))
    }

    fn advance(&mut self, now: u64) -> Result<Actions, SyncError> {
        // `new` keeps the member count below 32.
        let all = (1u32 << self.members.len()) - 1;
        if self.seen != all || self.local.is_none() {
            return Ok(Actions::new());
        }
        ringbuf_entry!(
            self.trace,
            Trace::Quorum {
                state: self.state,
                tid: self.tid
            }
        );

        let next = match self.state {
            SyncState::Startup | SyncState::ResetFabric => SyncState::TrainPhys,
            SyncState::TrainPhys => SyncState::SetupRouting,
            SyncState::SetupRouting => SyncState::LoadFabric,
            SyncState::LoadFabric => SyncState::CheckFabric,
            SyncState::CheckFabric => SyncState::Continue,
            SyncState::Continue => {
                ringbuf_entry!(self.trace, Trace::Done);
                self.done = true;
                self.timers.clear_timer(Timer::Resend);
                let mut out = Actions::new();
                push(&mut out, Action::Done);
                return Ok(out);
            }
            // Only commands are ever issued, and `WarmReset` is never
            // acknowledged.
            _ => return Ok(Actions::new()),
        };
        Ok(self.issue(next, now))
    }

    /// Moves to `state` under a fresh transaction id and sends it at once.
    fn issue(&mut self, state: SyncState, now: u64) -> Actions {
        self.state = state;
        self.tid = self.tid.wrapping_add(1);
        self.seen = 0;
        self.local = None;
        self.backoff.reset();
        ringbuf_entry!(
            self.trace,
            Trace::Issue {
                state,
                tid: self.tid
            }
        );

        let mut out = Actions::new();
        push(&mut out, Action::Send(self.me.bcast(state, self.tid)));
        if state == SyncState::WarmReset {
            self.warm_resets_sent = 1;
            if self.warm_resets_sent >= self.params.warm_reset_broadcasts {
                push(&mut out, Action::WarmReset);
                return out;
            }
            self.timers.set_timer(
                Timer::Resend,
                now + self.params.backoff_initial_ms.max(1),
                None,
            );
        } else {
            let d = self.backoff.next_delay();
            self.timers.set_timer(Timer::Resend, now + d, None);
            push(&mut out, Action::Execute(state));
        }
        out
    }
}
