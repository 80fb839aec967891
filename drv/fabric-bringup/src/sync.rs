// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Runs a synchronization engine against the broadcast transport.
//!
//! The engines in `fabric-sync` only say what should happen; this loop does
//! it. Received datagrams are decoded and handed over, commands are run
//! through a [`CommandHandler`], and anything the engine wants sent is
//! broadcast. A send the interface refuses is dropped: the engine repeats
//! itself until it is answered, so a lost send is no different from a lost
//! datagram.

use drv_fabric_api::{Clock, Destination, MacAddr, Transport};
use fabric_msgs::{MsgError, SerializedSize, StateBcast, SyncState};
use fabric_sync::{Action, Actions, Engine};
use heapless::Deque;
use ringbuf::{ringbuf_entry, Ringbuf};

use crate::commands::CommandHandler;
use crate::Fatal;

/// How synchronization ended.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SyncOutcome {
    /// The fabric is up and every node has moved on.
    Done,
    /// The platform must be reset.
    WarmReset,
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub enum Trace {
    Start { coordinator: bool },
    Rx(SyncState, u32),
    BadMessage(MsgError),
    /// The frame's source address is not the one the message claims.
    Spoofed { from: MacAddr, claimed: MacAddr },
    Tx(SyncState, u32),
    TxDropped(SyncState),
    Execute(SyncState),
    Restart,
    Outcome(SyncOutcome),
}

// Room for a full frame of something other than a state broadcast, so that
// foreign traffic is read whole and discarded.
const RX_BUF: usize = 256;

pub struct SyncDriver<T: Transport> {
    engine: Engine,
    transport: T,
    trace: Ringbuf<Trace, 32>,
}

impl<T: Transport> SyncDriver<T> {
    pub fn new(engine: Engine, transport: T) -> Self {
        Self {
            engine,
            transport,
            trace: Ringbuf::new(),
        }
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    pub fn trace(&self) -> &Ringbuf<Trace, 32> {
        &self.trace
    }

    /// Gives the transport back once synchronization is over.
    pub fn into_transport(self) -> T {
        self.transport
    }

    /// Starts the engine. The coordinator issues its first command here.
    pub fn start(
        &mut self,
        handler: &mut impl CommandHandler,
        clock: &impl Clock,
    ) -> Result<Option<SyncOutcome>, Fatal> {
        ringbuf_entry!(
            self.trace,
            Trace::Start {
                coordinator: self.engine.is_coordinator()
            }
        );
        let actions = self.engine.start(clock.now());
        self.perform(actions, handler, clock)
    }

    /// Handles a restart the handler asks for, then everything that has
    /// arrived and every timer that has expired.
    pub fn step(
        &mut self,
        handler: &mut impl CommandHandler,
        clock: &impl Clock,
    ) -> Result<Option<SyncOutcome>, Fatal> {
        if self.engine.is_coordinator() && handler.restart_requested() {
            ringbuf_entry!(self.trace, Trace::Restart);
            let actions = self.engine.request_restart(clock.now())?;
            if let Some(done) = self.perform(actions, handler, clock)? {
                return Ok(Some(done));
            }
        }

        let mut buf = [0u8; RX_BUF];
        while let Some((len, from)) = self.transport.recv(&mut buf) {
            let msg = match StateBcast::decode(&buf[..len.min(RX_BUF)]) {
                Ok(msg) => msg,
                Err(e) => {
                    ringbuf_entry!(self.trace, Trace::BadMessage(e));
                    continue;
                }
            };
            if msg.mac != from.0 {
                ringbuf_entry!(
                    self.trace,
                    Trace::Spoofed {
                        from,
                        claimed: MacAddr(msg.mac)
                    }
                );
                continue;
            }
            ringbuf_entry!(self.trace, Trace::Rx(msg.state, msg.tid));
            let actions = self.engine.on_message(&msg, clock.now())?;
            if let Some(done) = self.perform(actions, handler, clock)? {
                return Ok(Some(done));
            }
        }

        let actions = self.engine.poll(clock.now());
        self.perform(actions, handler, clock)
    }

    /// Runs until the engine is finished, looking at the transport every
    /// `poll_ms` milliseconds.
    pub fn run(
        &mut self,
        handler: &mut impl CommandHandler,
        clock: &impl Clock,
        poll_ms: u64,
    ) -> Result<SyncOutcome, Fatal> {
        if let Some(done) = self.start(handler, clock)? {
            return Ok(done);
        }
        loop {
            if let Some(done) = self.step(handler, clock)? {
                return Ok(done);
            }
            clock.delay(poll_ms.max(1));
        }
    }

    fn perform(
        &mut self,
        actions: Actions,
        handler: &mut impl CommandHandler,
        clock: &impl Clock,
    ) -> Result<Option<SyncOutcome>, Fatal> {
        // Running a command produces more actions; they are done in order
        // after the ones already queued.
        let mut work: Deque<Action, 8> = Deque::new();
        for a in actions {
            push(&mut work, a)?;
        }

        while let Some(a) = work.pop_front() {
            match a {
                Action::Send(msg) => self.send(&msg)?,
                Action::Execute(cmd) => {
                    ringbuf_entry!(self.trace, Trace::Execute(cmd));
                    let rsp = handler.execute(cmd)?;
                    for a in self.engine.completed(rsp, clock.now())? {
                        push(&mut work, a)?;
                    }
                }
                Action::Done => return Ok(Some(self.finish(SyncOutcome::Done))),
                Action::WarmReset => {
                    return Ok(Some(self.finish(SyncOutcome::WarmReset)))
                }
            }
        }
        Ok(None)
    }

    fn send(&mut self, msg: &StateBcast) -> Result<(), Fatal> {
        let mut buf = [0u8; StateBcast::MAX_SIZE];
        let n = msg.encode(&mut buf)?;
        match self.transport.send(&buf[..n], Destination::Broadcast) {
            Ok(()) => ringbuf_entry!(self.trace, Trace::Tx(msg.state, msg.tid)),
            Err(_) => ringbuf_entry!(self.trace, Trace::TxDropped(msg.state)),
        }
        Ok(())
    }

    fn finish(&mut self, outcome: SyncOutcome) -> SyncOutcome {
        ringbuf_entry!(self.trace, Trace::Outcome(outcome));
        outcome
    }
}

fn push(work: &mut Deque<Action, 8>, a: Action) -> Result<(), Fatal> {
    work.push_back(a).map_err(|_| Fatal::ActionOverflow)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{mac, sci, VirtualClock};
    use drv_fabric_api::TransportError;
    use fabric_sync::{Coordinator, Follower, Member, SyncParams};
    use std::cell::RefCell;
    use std::collections::{BTreeMap, VecDeque};
    use std::rc::Rc;

    /// A broadcast segment that loses every `drop_every`th frame.
    #[derive(Default)]
    struct Bus {
        queues: BTreeMap<MacAddr, VecDeque<(std::vec::Vec<u8>, MacAddr)>>,
        drop_every: usize,
        sent: usize,
    }

    struct Station {
        me: MacAddr,
        bus: Rc<RefCell<Bus>>,
    }

    fn attach(bus: &Rc<RefCell<Bus>>, me: MacAddr) -> Station {
        bus.borrow_mut().queues.insert(me, VecDeque::new());
        Station {
            me,
            bus: bus.clone(),
        }
    }

    impl Transport for Station {
        fn send(
            &mut self,
            buf: &[u8],
            _: Destination,
        ) -> Result<(), TransportError> {
            let mut bus = self.bus.borrow_mut();
            bus.sent += 1;
            if bus.drop_every != 0 && bus.sent % bus.drop_every == 0 {
                return Ok(());
            }
            for (m, q) in bus.queues.iter_mut() {
                if *m != self.me {
                    q.push_back((buf.to_vec(), self.me));
                }
            }
            Ok(())
        }

        fn recv(&mut self, buf: &mut [u8]) -> Option<(usize, MacAddr)> {
            let (frame, from) =
                self.bus.borrow_mut().queues.get_mut(&self.me)?.pop_front()?;
            buf[..frame.len()].copy_from_slice(&frame);
            Some((frame.len(), from))
        }
    }

    /// Answers every command as expected, except that the first
    /// `bad_checks` checks fail. Asks once for a restart right after running
    /// `restart_after`.
    #[derive(Default)]
    struct Script {
        ran: std::vec::Vec<SyncState>,
        bad_checks: u32,
        restart_after: Option<SyncState>,
    }

    impl CommandHandler for Script {
        fn execute(&mut self, cmd: SyncState) -> Result<SyncState, Fatal> {
            self.ran.push(cmd);
            if cmd == SyncState::CheckFabric && self.bad_checks > 0 {
                self.bad_checks -= 1;
                return Ok(SyncState::RspFabricNotOk);
            }
            cmd.expected_response().ok_or(Fatal::UnexpectedCommand(cmd))
        }

        fn restart_requested(&mut self) -> bool {
            let due = self.restart_after.is_some()
                && self.ran.last() == self.restart_after.as_ref();
            if due {
                self.restart_after = None;
            }
            due
        }
    }

    fn member(n: u8) -> Member {
        Member {
            sci: sci(u16::from(n)),
            mac: mac(n),
        }
    }

    fn params() -> SyncParams {
        SyncParams {
            linger_ms: 50,
            ..SyncParams::default()
        }
    }

    /// Runs a coordinator and one follower side by side until both finish.
    fn pair(
        drop_every: usize,
        coordinator: &mut Script,
        follower: &mut Script,
    ) -> (SyncOutcome, SyncOutcome) {
        let bus = Rc::new(RefCell::new(Bus {
            drop_every,
            ..Default::default()
        }));
        let engine = Engine::Coordinator(
            Coordinator::new(member(0), &[member(1)], params()).unwrap(),
        );
        let mut c = SyncDriver::new(engine, attach(&bus, mac(0)));
        let engine =
            Engine::Follower(Follower::new(member(1), member(0), params()));
        let mut f = SyncDriver::new(engine, attach(&bus, mac(1)));
        let clock = VirtualClock::new();

        let mut c_out = c.start(coordinator, &clock).unwrap();
        let mut f_out = f.start(follower, &clock).unwrap();
        for _ in 0..10_000 {
            if c_out.is_none() {
                c_out = c.step(coordinator, &clock).unwrap();
            }
            if f_out.is_none() {
                f_out = f.step(follower, &clock).unwrap();
            }
            if let (Some(a), Some(b)) = (c_out, f_out) {
                return (a, b);
            }
            clock.delay(1);
        }
        panic!("never finished: {c_out:?} {f_out:?}");
    }

    #[test]
    fn pair_comes_up_over_a_lossy_segment() {
        let (mut a, mut b) = (Script::default(), Script::default());
        assert_eq!(
            pair(3, &mut a, &mut b),
            (SyncOutcome::Done, SyncOutcome::Done)
        );
        let sequence = [
            SyncState::Startup,
            SyncState::TrainPhys,
            SyncState::SetupRouting,
            SyncState::LoadFabric,
            SyncState::CheckFabric,
            SyncState::Continue,
        ];
        assert_eq!(a.ran, sequence);
        // Repeated commands are answered without being run again.
        assert_eq!(b.ran, sequence);
    }

    #[test]
    fn failed_check_resets_both_nodes() {
        let mut a = Script::default();
        let mut b = Script {
            bad_checks: 1,
            ..Default::default()
        };
        assert_eq!(
            pair(0, &mut a, &mut b),
            (SyncOutcome::WarmReset, SyncOutcome::WarmReset)
        );
        assert_eq!(a.ran.last(), Some(&SyncState::CheckFabric));
        assert!(!b.ran.contains(&SyncState::Continue));
    }

    #[test]
    fn restart_before_the_check_resets_the_fabric() {
        let mut a = Script {
            restart_after: Some(SyncState::TrainPhys),
            ..Default::default()
        };
        let mut b = Script::default();
        assert_eq!(
            pair(0, &mut a, &mut b),
            (SyncOutcome::Done, SyncOutcome::Done)
        );
        assert_eq!(
            a.ran,
            [
                SyncState::Startup,
                SyncState::TrainPhys,
                SyncState::ResetFabric,
                SyncState::TrainPhys,
                SyncState::SetupRouting,
                SyncState::LoadFabric,
                SyncState::CheckFabric,
                SyncState::Continue,
            ]
        );
        assert!(b.ran.contains(&SyncState::ResetFabric));
    }

    #[test]
    fn restart_while_checking_resets_both_nodes() {
        let mut a = Script {
            restart_after: Some(SyncState::CheckFabric),
            ..Default::default()
        };
        // A follower never asks; only the coordinator's request counts.
        let mut b = Script {
            restart_after: Some(SyncState::Startup),
            ..Default::default()
        };
        assert_eq!(
            pair(0, &mut a, &mut b),
            (SyncOutcome::WarmReset, SyncOutcome::WarmReset)
        );
        assert_eq!(a.ran.last(), Some(&SyncState::CheckFabric));
        assert!(!b.ran.contains(&SyncState::Continue));
        assert!(!b.ran.contains(&SyncState::ResetFabric));
    }

    #[test]
    fn foreign_and_forged_frames_are_ignored() {
        let bus = Rc::new(RefCell::new(Bus::default()));
        let mut intruder = attach(&bus, mac(7));
        let engine =
            Engine::Follower(Follower::new(member(1), member(0), params()));
        let mut f = SyncDriver::new(engine, attach(&bus, mac(1)));
        let clock = VirtualClock::new();
        let mut script = Script::default();

        intruder
            .send(b"not a state broadcast", Destination::Broadcast)
            .unwrap();
        // Claims to come from the coordinator.
        let forged = member(0).bcast(SyncState::Startup, 1);
        let mut buf = [0u8; StateBcast::MAX_SIZE];
        let n = forged.encode(&mut buf).unwrap();
        intruder.send(&buf[..n], Destination::Broadcast).unwrap();

        assert_eq!(f.step(&mut script, &clock), Ok(None));
        assert!(script.ran.is_empty());
        let trace: std::vec::Vec<Trace> = f.trace().payloads().collect();
        assert!(trace.iter().any(|t| matches!(t, Trace::BadMessage(_))));
        assert!(trace.contains(&Trace::Spoofed {
            from: mac(7),
            claimed: mac(0)
        }));
    }

    #[test]
    fn handler_errors_stop_the_loop() {
        struct Broken;
        impl CommandHandler for Broken {
            fn execute(&mut self, _: SyncState) -> Result<SyncState, Fatal> {
                Err(Fatal::NoRoutes)
            }
        }
        let bus = Rc::new(RefCell::new(Bus::default()));
        let engine = Engine::Coordinator(
            Coordinator::new(member(0), &[], params()).unwrap(),
        );
        let mut c = SyncDriver::new(engine, attach(&bus, mac(0)));
        let clock = VirtualClock::new();
        assert_eq!(c.run(&mut Broken, &clock, 1), Err(Fatal::NoRoutes));
    }
}
