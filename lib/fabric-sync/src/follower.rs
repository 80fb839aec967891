// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use fabric_msgs::{StateBcast, SyncState};
use multitimer::Multitimer;
use ringbuf::{ringbuf_entry, Ringbuf};

use crate::{push, Action, Actions, Backoff, Member, SyncParams, Timer};

#[derive(Copy, Clone, Debug, PartialEq)]
pub enum Trace {
    Command { state: SyncState, tid: u32 },
    Duplicate(u32),
    Answer { state: SyncState, tid: u32 },
    Resend { state: SyncState, tid: u32 },
    NotCoordinator { sci: u16 },
    NotCommand(SyncState),
    Lingering,
    Done,
}

/// Executes whatever the coordinator asks for, once per transaction id, and
/// keeps reporting the result until the next command arrives.
pub struct Follower {
    me: Member,
    coordinator: Member,
    params: SyncParams,
    last_tid: Option<u32>,
    command: Option<SyncState>,
    answer: Option<SyncState>,
    done: bool,
    backoff: Backoff,
    timers: Multitimer<Timer>,
    trace: Ringbuf<Trace, 32>,
}

impl Follower {
    pub fn new(me: Member, coordinator: Member, params: SyncParams) -> Self {
        Self {
            me,
            coordinator,
            params,
            last_tid: None,
            command: None,
            answer: None,
            done: false,
            backoff: Backoff::new(
                params.backoff_initial_ms,
                params.backoff_max_ms,
            ),
            timers: Multitimer::new(),
            trace: Ringbuf::new(),
        }
    }

    /// The command being handled or last handled.
    pub fn command(&self) -> Option<SyncState> {
        self.command
    }

    pub fn last_tid(&self) -> Option<u32> {
        self.last_tid
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    pub fn trace(&self) -> &Ringbuf<Trace, 32> {
        &self.trace
    }

    pub fn next_deadline(&self) -> Option<u64> {
        self.timers.next_deadline()
    }

    pub fn on_message(&mut self, msg: &StateBcast, now: u64) -> Actions {
        let mut out = Actions::new();
        if !self.coordinator.sent(msg) {
            ringbuf_entry!(self.trace, Trace::NotCoordinator { sci: msg.sci });
            return out;
        }
        if !msg.state.is_command() {
            ringbuf_entry!(self.trace, Trace::NotCommand(msg.state));
            return out;
        }

        if self.last_tid == Some(msg.tid) {
            // The coordinator is still waiting on us. Answer straight away
            // if we can; otherwise the answer goes out when the handler
            // finishes.
            ringbuf_entry!(self.trace, Trace::Duplicate(msg.tid));
            if let Some(answer) = self.answer {
                push(&mut out, Action::Send(self.me.bcast(answer, msg.tid)));
                self.arm_resend(now);
            }
            return out;
        }

        ringbuf_entry!(
            self.trace,
            Trace::Command {
                state: msg.state,
                tid: msg.tid
            }
        );
        self.last_tid = Some(msg.tid);
        self.command = Some(msg.state);
        self.answer = None;
        self.done = false;
        self.timers.clear_timer(Timer::Resend);
        self.timers.clear_timer(Timer::Linger);

        if msg.state == SyncState::WarmReset {
            push(&mut out, Action::WarmReset);
        } else {
            push(&mut out, Action::Execute(msg.state));
        }
        out
    }

    /// Records the result of the command last handed out and starts
    /// reporting it.
    pub fn complete(&mut self, result: SyncState, now: u64) -> Actions {
        let mut out = Actions::new();
        let (Some(tid), Some(cmd)) = (self.last_tid, self.command) else {
            return out;
        };
        ringbuf_entry!(self.trace, Trace::Answer { state: result, tid });
        self.answer = Some(result);
        self.backoff.reset();
        push(&mut out, Action::Send(self.me.bcast(result, tid)));
        self.arm_resend(now);

        if cmd == SyncState::Continue {
            ringbuf_entry!(self.trace, Trace::Lingering);
            self.timers
                .set_timer(Timer::Linger, now + self.params.linger_ms, None);
        }
        out
    }

    pub fn poll(&mut self, now: u64) -> Actions {
        let mut out = Actions::new();
        self.timers.poll(now);

        if self.timers.take_fired(Timer::Linger) {
            ringbuf_entry!(self.trace, Trace::Done);
            self.done = true;
            self.timers.clear_timer(Timer::Resend);
            push(&mut out, Action::Done);
            return out;
        }

        if self.timers.take_fired(Timer::Resend) {
            if let (Some(answer), Some(tid)) = (self.answer, self.last_tid) {
                ringbuf_entry!(self.trace, Trace::Resend { state: answer, tid });
                push(&mut out, Action::Send(self.me.bcast(answer, tid)));
                self.arm_resend(now);
            }
        }
        out
    }

    fn arm_resend(&mut self, now: u64) {
        let d = self.backoff.next_delay();
        self.timers.set_timer(Timer::Resend, now + d, None);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use drv_fabric_api::{MacAddr, SciId};

    fn member(n: u8) -> Member {
        Member {
            sci: SciId::from_coords(n, 0, 0).unwrap(),
            mac: MacAddr([2, 0, 0, 0, 0, n]),
        }
    }

    fn follower() -> Follower {
        Follower::new(member(1), member(0), SyncParams::default())
    }

    fn cmd(state: SyncState, tid: u32) -> StateBcast {
        member(0).bcast(state, tid)
    }

    #[test]
    fn executes_each_tid_once() {
        let mut f = follower();
        let out = f.on_message(&cmd(SyncState::TrainPhys, 4), 0);
        assert_eq!(out.as_slice(), [Action::Execute(SyncState::TrainPhys)]);

        // Still training: the repeat is noted, and nothing goes out.
        assert!(f.on_message(&cmd(SyncState::TrainPhys, 4), 5).is_empty());

        let out = f.complete(SyncState::RspPhyTrained, 10);
        let answer = member(1).bcast(SyncState::RspPhyTrained, 4);
        assert_eq!(out.as_slice(), [Action::Send(answer)]);

        // Now a repeat gets the answer again, without re-executing.
        let out = f.on_message(&cmd(SyncState::TrainPhys, 4), 15);
        assert_eq!(out.as_slice(), [Action::Send(answer)]);
    }

    #[test]
    fn new_tid_supersedes() {
        let mut f = follower();
        f.on_message(&cmd(SyncState::TrainPhys, 4), 0);
        f.complete(SyncState::RspPhyNotTrained, 0);
        let out = f.on_message(&cmd(SyncState::ResetFabric, 5), 1);
        assert_eq!(out.as_slice(), [Action::Execute(SyncState::ResetFabric)]);
        assert_eq!(f.last_tid(), Some(5));
        // The old answer is no longer repeated.
        assert_eq!(f.next_deadline(), None);
        assert!(f.poll(10_000).is_empty());
    }

    #[test]
    fn answer_repeats_with_backoff() {
        let mut f = follower();
        f.on_message(&cmd(SyncState::Startup, 1), 0);
        f.complete(SyncState::RspAlive, 0);
        let mut sends = std::vec::Vec::new();
        for now in 1..=200 {
            if !f.poll(now).is_empty() {
                sends.push(now);
            }
        }
        assert_eq!(sends, [10, 30, 70, 150]);
    }

    #[test]
    fn only_the_coordinator_commands() {
        let mut f = follower();
        let rogue = member(2).bcast(SyncState::WarmReset, 9);
        assert!(f.on_message(&rogue, 0).is_empty());
        let answer = member(0).bcast(SyncState::RspAlive, 9);
        assert!(f.on_message(&answer, 0).is_empty());
        assert_eq!(f.last_tid(), None);
    }

    #[test]
    fn warm_reset_is_immediate() {
        let mut f = follower();
        let out = f.on_message(&cmd(SyncState::WarmReset, 7), 0);
        assert_eq!(out.as_slice(), [Action::WarmReset]);
    }

    #[test]
    fn lingers_after_continue() {
        let mut f = follower();
        f.on_message(&cmd(SyncState::Continue, 12), 0);
        f.complete(SyncState::RspContinuing, 100);
        assert!(!f.is_done());

        // Still answering while lingering.
        let out = f.on_message(&cmd(SyncState::Continue, 12), 500);
        assert_eq!(out.len(), 1);

        let linger = SyncParams::default().linger_ms;
        let mut now = 100;
        let done_at = loop {
            now += 1;
            if f.poll(now).contains(&Action::Done) {
                break now;
            }
        };
        assert_eq!(done_at, 100 + linger);
        assert!(f.is_done());
        assert_eq!(f.next_deadline(), None);
    }
}
