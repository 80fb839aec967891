// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! What each synchronization command does to this node's fabric chip.
//!
//! Commands can arrive more than once (the coordinator repeats itself until
//! it hears back, and a follower that lost its answer will be asked again
//! under a new transaction id after a retry), so every handler leaves the
//! chip in the same state whether it runs once or twice in a row.

use drv_fabric_api::{poll_until, Clock, Csr};
use drv_fabric_chip::FabricChip;
use fabric_msgs::SyncState;
use fabric_route::plan;
use ringbuf::ringbuf_entry;

use crate::state::{FabricState, Trace};
use crate::Fatal;

/// Runs a bring-up command and reports the response to send back.
pub trait CommandHandler {
    fn execute(&mut self, cmd: SyncState) -> Result<SyncState, Fatal>;

    /// Asked by the coordinator between messages. Returning true brings the
    /// fabric up again: with a platform reset while the fabric is being
    /// checked, and with a fabric reset before that.
    fn restart_requested(&mut self) -> bool {
        false
    }
}

/// Runs commands against the fabric chip of the node `state` describes.
pub struct FabricCommands<'s, 'a, C: Csr, K: Clock> {
    state: &'s mut FabricState<'a>,
    csr: &'s C,
    clock: &'s K,
    /// Every wired link came up in the last training.
    trained: bool,
}

impl<'s, 'a, C: Csr, K: Clock> FabricCommands<'s, 'a, C, K> {
    pub fn new(state: &'s mut FabricState<'a>, csr: &'s C, clock: &'s K) -> Self {
        Self {
            state,
            csr,
            clock,
            trained: false,
        }
    }

    fn chip(&self) -> Result<FabricChip<'s, C>, Fatal> {
        self.state.chip(self.csr)
    }

    fn reset(&mut self) -> Result<SyncState, Fatal> {
        self.trained = false;
        self.chip()?.reset()?;
        Ok(SyncState::RspResetOk)
    }

    fn train(&mut self) -> Result<SyncState, Fatal> {
        let t = &self.state.config().tunables;
        let chip = self.chip()?;
        chip.set_node_id();
        let want = self.state.wired();
        let up = chip.train(want, self.clock, t.train_timeout_ms, t.train_poll_ms)?;
        ringbuf_entry!(self.state.trace, Trace::LinksUp { want, up });
        self.trained = up == want;
        Ok(if up == want {
            SyncState::RspPhyTrained
        } else {
            SyncState::RspPhyNotTrained
        })
    }

    fn route(&mut self) -> Result<SyncState, Fatal> {
        if self.state.plan.is_none() {
            let params = self
                .state
                .config()
                .tunables
                .planner_params(self.state.topology().len());
            let rp = plan(self.state.topology(), &params)?;
            ringbuf_entry!(self.state.trace, Trace::Planned);
            self.state.plan = Some(rp);
        }
        let chip = self.chip()?;
        let (me, scis) = (self.state.me(), self.state.scis());
        let rp = self.state.plan().ok_or(Fatal::NoRoutes)?;
        chip.load_routes(rp, me, scis)?;
        chip.verify_routes(rp, me, scis)?;
        Ok(SyncState::RspRoutingOk)
    }

    /// Every other chip must answer through the routes just loaded.
    fn load(&mut self) -> Result<SyncState, Fatal> {
        let timeout = self.state.config().tunables.ident_timeout_ms;
        let me = self.state.sci();
        for sci in self.state.config().scis() {
            if sci == me {
                continue;
            }
            let seen = poll_until(self.clock, timeout, 1, || {
                FabricChip::attach(self.csr, sci).ok().map(|_| ())
            });
            if seen.is_none() {
                ringbuf_entry!(self.state.trace, Trace::NotReady(sci));
                return Ok(SyncState::RspFabricNotReady);
            }
        }
        Ok(SyncState::RspFabricReady)
    }

    fn check(&mut self) -> Result<SyncState, Fatal> {
        let timeout = self.state.config().tunables.check_timeout_ms;
        if self.chip()?.check(self.clock, timeout)? {
            Ok(SyncState::RspFabricOk)
        } else {
            ringbuf_entry!(self.state.trace, Trace::CheckFailed);
            Ok(SyncState::RspFabricNotOk)
        }
    }
}

impl<C: Csr, K: Clock> CommandHandler for FabricCommands<'_, '_, C, K> {
    fn execute(&mut self, cmd: SyncState) -> Result<SyncState, Fatal> {
        ringbuf_entry!(self.state.trace, Trace::Command(cmd));
        let rsp = match cmd {
            SyncState::Startup => SyncState::RspAlive,
            SyncState::ResetFabric => self.reset()?,
            SyncState::TrainPhys => self.train()?,
            SyncState::SetupRouting => self.route()?,
            SyncState::LoadFabric => self.load()?,
            SyncState::CheckFabric => self.check()?,
            SyncState::Continue => SyncState::RspContinuing,
            other => return Err(Fatal::UnexpectedCommand(other)),
        };
        ringbuf_entry!(self.state.trace, Trace::Result(rsp));
        Ok(rsp)
    }

    /// A link that trained and has since gone down.
    fn restart_requested(&mut self) -> bool {
        if !self.trained {
            return false;
        }
        let want = self.state.wired();
        // An unreachable chip shows up in the next command instead.
        let Ok(Ok(up)) = self.chip().map(|c| c.links_up(want)) else {
            return false;
        };
        if up == want {
            return false;
        }
        ringbuf_entry!(self.state.trace, Trace::LinkLost { want, up });
        self.trained = false;
        true
    }
}
