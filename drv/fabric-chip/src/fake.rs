// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! A whole fabric's worth of chips in memory.
//!
//! Registers are plain storage except where the hardware does something on
//! access: link status follows the cabling and what both ends have
//! enabled, the indirect route and translation tables go through their
//! index registers, and the self-check and scrub engines finish as soon as
//! they are started. A coordinate with no chip reads as all-ones.
//!
//! The fabric is shared: every node of a multi-node test holds a reference
//! to the same `FakeFabric`, possibly from its own thread.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use drv_fabric_api::{Csr, Port, SciId, MAX_PORTS, MAX_SOCKETS};

use crate::regs::{self, *};
use crate::LinkController;

/// Socket resources reported by a fake chip.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct FakeSocket {
    pub dram: u64,
    pub cores: u32,
    pub apic_base: u32,
}

/// Everything a chip holds that bring-up can change. Two equal snapshots
/// mean the hardware was left in the same state.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Snapshot {
    pub regs: BTreeMap<u32, u64>,
    pub lc4_routes: BTreeMap<(u8, u16), u32>,
    pub att: BTreeMap<(bool, u16), u32>,
    pub enabled: u8,
}

struct Chip {
    lc: LinkController,
    alive: bool,
    state: Snapshot,
    route_index: RouteIndex,
    att_index: AttIndex,
    check_fails: bool,
    resets: u32,
    checks: u32,
    scrubs: [u32; MAX_SOCKETS],
}

struct Cable {
    ends: [(SciId, Port); 2],
    /// Fabric resets still needed before the cable trains.
    failures: u32,
}

#[derive(Default)]
struct State {
    chips: BTreeMap<u16, Chip>,
    cables: Vec<Cable>,
}

#[derive(Default)]
pub struct FakeFabric {
    state: Mutex<State>,
}

impl FakeFabric {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_chip(&self, sci: SciId, lc: LinkController) {
        let gen = match lc {
            LinkController::Lc4 => 4,
            LinkController::Lc5 => 5,
        };
        let mut chip = Chip {
            lc,
            alive: true,
            state: Snapshot::default(),
            route_index: RouteIndex(0),
            att_index: AttIndex(0),
            check_fails: false,
            resets: 0,
            checks: 0,
            scrubs: [0; MAX_SOCKETS],
        };
        chip.state
            .regs
            .insert(IDENT, u64::from(VENDOR << 16 | 1 << 8 | gen));
        self.lock().chips.insert(sci.raw(), chip);
    }

    /// Gives the chip at `sci` these sockets.
    pub fn set_sockets(&self, sci: SciId, sockets: &[FakeSocket]) {
        self.with_chip(sci, |c| {
            let r = &mut c.state.regs;
            r.insert(NODE_SOCKETS, sockets.len() as u64);
            for (s, k) in sockets.iter().enumerate() {
                let s = s as u8;
                r.insert(socket(s, SOCKET_DRAM_SIZE), k.dram);
                r.insert(socket(s, SOCKET_CORES), u64::from(k.cores));
                r.insert(socket(s, SOCKET_APIC_BASE), u64::from(k.apic_base));
            }
        });
    }

    /// Cables `port` of `a` to the opposite port of `b`.
    pub fn cable(&self, a: SciId, port: Port, b: SciId) {
        self.lock().cables.push(Cable {
            ends: [(a, port), (b, port.opposite())],
            failures: 0,
        });
    }

    /// Makes the cable on `port` of `a` refuse to train until `resets`
    /// fabric resets have been done at either end.
    pub fn flaky(&self, a: SciId, port: Port, resets: u32) {
        let mut st = self.lock();
        if let Some(c) = st.cables.iter_mut().find(|c| c.ends.contains(&(a, port)))
        {
            c.failures = resets;
        }
    }

    pub fn fail_check(&self, sci: SciId, fail: bool) {
        self.with_chip(sci, |c| c.check_fails = fail);
    }

    /// Stops the chip answering, as if it had been powered off.
    pub fn kill(&self, sci: SciId) {
        self.with_chip(sci, |c| c.alive = false);
    }

    pub fn revive(&self, sci: SciId) {
        self.with_chip(sci, |c| c.alive = true);
    }

    pub fn resets(&self, sci: SciId) -> u32 {
        self.with_chip(sci, |c| c.resets).unwrap_or(0)
    }

    pub fn checks(&self, sci: SciId) -> u32 {
        self.with_chip(sci, |c| c.checks).unwrap_or(0)
    }

    pub fn scrubs(&self, sci: SciId, s: u8) -> u32 {
        self.with_chip(sci, |c| c.scrubs[usize::from(s)]).unwrap_or(0)
    }

    pub fn snapshot(&self, sci: SciId) -> Option<Snapshot> {
        self.with_chip(sci, |c| c.state.clone())
    }

    pub fn peek(&self, sci: SciId, reg: u32) -> Option<u64> {
        self.with_chip(sci, |c| c.state.regs.get(&reg).copied())
            .flatten()
    }

    pub fn att_entry(&self, sci: SciId, mmio: bool, i: u16) -> Option<u32> {
        self.with_chip(sci, |c| c.state.att.get(&(mmio, i)).copied())
            .flatten()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        // A panicking test thread leaves the registers as they were.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn with_chip<T>(
        &self,
        sci: SciId,
        f: impl FnOnce(&mut Chip) -> T,
    ) -> Option<T> {
        self.lock().chips.get_mut(&sci.raw()).map(f)
    }
}

fn lc_reg(reg: u32) -> Option<(usize, u32)> {
    let top = LC_BASE + MAX_PORTS as u32 * LC_STRIDE;
    if (LC_BASE..top).contains(&reg) {
        let off = reg - LC_BASE;
        Some(((off / LC_STRIDE) as usize, off % LC_STRIDE))
    } else {
        None
    }
}

fn socket_reg(reg: u32) -> Option<(usize, u32)> {
    let top = SOCKET_BASE + MAX_SOCKETS as u32 * SOCKET_STRIDE;
    if (SOCKET_BASE..top).contains(&reg) {
        let off = reg - SOCKET_BASE;
        Some(((off / SOCKET_STRIDE) as usize, off % SOCKET_STRIDE))
    } else {
        None
    }
}

fn is_lc4_index(chip: &Chip, reg: u32) -> bool {
    chip.lc == LinkController::Lc4 && reg == lc(1, LC4_ROUTE_INDEX)
}

fn is_lc4_data(chip: &Chip, reg: u32) -> bool {
    chip.lc == LinkController::Lc4 && reg == lc(1, LC4_ROUTE_DATA)
}

impl State {
    fn link_up(&self, sci: SciId, port: usize) -> bool {
        let Some(port) = Port::from_index(port) else {
            return false;
        };
        let enabled = |s: SciId, p: Port| {
            self.chips
                .get(&s.raw())
                .is_some_and(|c| c.alive && c.state.enabled & (1 << p as u8) != 0)
        };
        self.cables.iter().any(|c| {
            let Some(i) = c.ends.iter().position(|&e| e == (sci, port)) else {
                return false;
            };
            let (peer, peer_port) = c.ends[1 - i];
            c.failures == 0 && enabled(sci, port) && enabled(peer, peer_port)
        })
    }

    fn reset(&mut self, sci: SciId, ctl: FabricReset) {
        if let Some(chip) = self.chips.get_mut(&sci.raw()) {
            chip.resets += 1;
            chip.state.enabled = 0;
            if ctl.routes() {
                chip.state.lc4_routes.clear();
                let lo = LC5_ROUTE_BASE;
                let hi = lc5_route(MAX_PORTS as u8, 0);
                chip.state.regs.retain(|r, _| !(lo..hi).contains(r));
            }
        }
        for c in &mut self.cables {
            if c.ends.iter().any(|&(s, _)| s == sci) {
                c.failures = c.failures.saturating_sub(1);
            }
        }
    }
}

impl Csr for FakeFabric {
    fn read32(&self, sci: SciId, reg: u32) -> u32 {
        let st = self.lock();
        let Some(chip) = st.chips.get(&sci.raw()).filter(|c| c.alive) else {
            return u32::MAX;
        };
        if is_lc4_data(chip, reg) {
            let ix = chip.route_index;
            return chip
                .state
                .lc4_routes
                .get(&(ix.ingress(), ix.dst()))
                .copied()
                .unwrap_or(0);
        }
        if reg == ATT_DATA {
            let ix = chip.att_index;
            return chip
                .state
                .att
                .get(&(ix.mmio(), ix.entry()))
                .copied()
                .unwrap_or(0);
        }
        if let Some((port, LC_STATUS)) = lc_reg(reg) {
            let up = st.link_up(sci, port);
            return match chip.lc {
                LinkController::Lc4 => {
                    let mut s = Lc4Status(0);
                    s.set_up(up);
                    s.0
                }
                LinkController::Lc5 => {
                    let mut s = Lc5Status(0);
                    s.set_up(up);
                    s.set_lanes(if up { 8 } else { 0 });
                    s.0
                }
            };
        }
        chip.state.regs.get(&reg).copied().unwrap_or(0) as u32
    }

    fn write32(&self, sci: SciId, reg: u32, val: u32) {
        let mut st = self.lock();
        if reg == FABRIC_RESET {
            let ctl = FabricReset(val);
            if ctl.assert() && st.chips.get(&sci.raw()).is_some_and(|c| c.alive)
            {
                st.reset(sci, ctl);
            }
            return;
        }
        let Some(chip) = st.chips.get_mut(&sci.raw()).filter(|c| c.alive) else {
            return;
        };

        if is_lc4_index(chip, reg) {
            chip.route_index = RouteIndex(val);
            return;
        }
        if is_lc4_data(chip, reg) {
            let ix = chip.route_index;
            chip.state.lc4_routes.insert((ix.ingress(), ix.dst()), val);
            return;
        }
        match reg {
            ATT_INDEX => {
                chip.att_index = AttIndex(val);
                return;
            }
            ATT_DATA => {
                let ix = chip.att_index;
                chip.state.att.insert((ix.mmio(), ix.entry()), val);
                return;
            }
            CHECK_CTRL => {
                if CheckCtrl(val).start() {
                    chip.checks += 1;
                    let mut s = CheckStatus(0);
                    s.set_done(true);
                    s.set_ok(!chip.check_fails);
                    s.set_errors(if chip.check_fails { 3 } else { 0 });
                    chip.state.regs.insert(CHECK_STATUS, u64::from(s.0));
                }
                return;
            }
            _ => {}
        }
        if let Some((port, LC_CONTROL)) = lc_reg(reg) {
            let ctl = LinkControl(val);
            if ctl.enable() {
                chip.state.enabled |= 1 << port;
            } else {
                chip.state.enabled &= !(1 << port);
            }
            if ctl.clear_errors() {
                chip.state.regs.remove(&lc(port as u8, LC_ERRORS));
            }
            return;
        }
        if let Some((s, SOCKET_SCRUB_CTRL)) = socket_reg(reg) {
            if ScrubCtrl(val).start() {
                chip.scrubs[s] += 1;
                let mut done = ScrubStatus(0);
                done.set_done(true);
                chip.state
                    .regs
                    .insert(socket(s as u8, SOCKET_SCRUB_STATUS), u64::from(done.0));
            }
            return;
        }
        chip.state.regs.insert(reg, u64::from(val));
    }

    fn read64(&self, sci: SciId, reg: u32) -> u64 {
        let st = self.lock();
        match st.chips.get(&sci.raw()).filter(|c| c.alive) {
            Some(chip) => chip.state.regs.get(&reg).copied().unwrap_or(0),
            None => u64::MAX,
        }
    }

    fn write64(&self, sci: SciId, reg: u32, val: u64) {
        let mut st = self.lock();
        if let Some(chip) = st.chips.get_mut(&sci.raw()).filter(|c| c.alive) {
            chip.state.regs.insert(reg, val);
        }
    }
}
