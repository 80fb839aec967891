// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Driver for the fabric chip: the bridge on each node that carries
//! coherent traffic between nodes.
//!
//! Everything goes through [`drv_fabric_api::Csr`] by coordinate, so the
//! same code programs the local chip and, once the fabric is routed, the
//! chips of other nodes. A read that comes back as all-ones means nothing
//! answered, and turns into [`ChipError::Unreachable`].
//!
//! Before any window or table entry is written it is checked against the
//! register's granularity, and a failed check writes nothing.

#![cfg_attr(not(any(test, feature = "fake")), no_std)]

use drv_fabric_api::{
    poll_until, Clock, Csr, NodeIndex, Port, SciId, MAX_SOCKETS,
};
use fabric_addr::{Att, Dest, Range, RangeTable};
use fabric_route::RoutePlan;

#[cfg(any(test, feature = "fake"))]
pub mod fake;
mod info;
mod link;
pub mod regs;

pub use info::{InfoState, NodeInfo, INFO_MAGIC};
pub use link::{LinkController, LinkStatus};

use regs::{
    AttEntry, AttIndex, CheckCtrl, CheckStatus, FabricReset, Ident, RangeCtl,
    ScrubCtrl, ScrubStatus,
};

/// Highest address the DRAM translation table can decode.
pub const DECODE_LIMIT: u64 =
    (fabric_addr::ATT_ENTRIES as u64) << fabric_addr::DRAM_ATT_SHIFT;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ChipError {
    /// A read of `reg` came back all-ones.
    Unreachable { sci: SciId, reg: u32 },
    /// The identity register does not name a chip we drive.
    BadIdent { sci: SciId, ident: u32 },
    /// A register held a value its codec cannot represent.
    BadRegister { sci: SciId, reg: u32 },
    /// The local port has no link controller.
    NoController,
    Timeout { sci: SciId, reg: u32 },
    /// A window or table entry is not aligned to what the register can hold.
    Misaligned { addr: u64, granularity: u64 },
    /// There are more windows than the register block has slots for.
    TooManyRanges { sci: SciId, count: usize },
    TooManySockets { sci: SciId, count: u32 },
    /// A route entry read back differently from what was planned.
    RouteMismatch {
        sci: SciId,
        ingress: Port,
        dst: SciId,
        found: Option<Port>,
    },
    /// The translation table names a node with no coordinate.
    UnknownNode(NodeIndex),
}

pub(crate) fn read32(
    csr: &impl Csr,
    sci: SciId,
    reg: u32,
) -> Result<u32, ChipError> {
    match csr.read32(sci, reg) {
        u32::MAX => Err(ChipError::Unreachable { sci, reg }),
        v => Ok(v),
    }
}

pub(crate) fn read64(
    csr: &impl Csr,
    sci: SciId,
    reg: u32,
) -> Result<u64, ChipError> {
    match csr.read64(sci, reg) {
        u64::MAX => Err(ChipError::Unreachable { sci, reg }),
        v => Ok(v),
    }
}

fn check_aligned(addr: u64, granularity: u64) -> Result<(), ChipError> {
    if addr % granularity == 0 {
        Ok(())
    } else {
        Err(ChipError::Misaligned { addr, granularity })
    }
}

/// What one socket behind a chip has.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct SocketInfo {
    pub dram: u64,
    pub cores: u32,
    pub apic_base: u32,
}

/// Which of a socket's decode tables to program.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DecodeTable {
    Dram,
    Mmio32,
    Mmio64,
}

impl DecodeTable {
    fn slots(self) -> (u32, core::ops::Range<usize>) {
        match self {
            DecodeTable::Dram => {
                (regs::SOCKET_DRAM_RANGE, 0..regs::SOCKET_DRAM_RANGES)
            }
            DecodeTable::Mmio32 => (regs::SOCKET_MMIO_RANGE, 0..3),
            DecodeTable::Mmio64 => {
                (regs::SOCKET_MMIO_RANGE, 3..regs::SOCKET_MMIO_RANGES)
            }
        }
    }
}

/// A fabric chip at a known coordinate.
pub struct FabricChip<'a, C: Csr> {
    csr: &'a C,
    sci: SciId,
    lc: LinkController,
}

impl<'a, C: Csr> FabricChip<'a, C> {
    /// Reads the identity register once.
    pub fn attach(csr: &'a C, sci: SciId) -> Result<Self, ChipError> {
        let raw = read32(csr, sci, regs::IDENT)?;
        let ident = Ident(raw);
        let lc = LinkController::from_ident(ident)
            .filter(|_| ident.vendor() == regs::VENDOR)
            .ok_or(ChipError::BadIdent { sci, ident: raw })?;
        Ok(Self { csr, sci, lc })
    }

    /// Polls the identity register until the chip answers, for at most
    /// `timeout` milliseconds.
    pub fn probe(
        csr: &'a C,
        sci: SciId,
        clock: &impl Clock,
        timeout: u64,
    ) -> Result<Self, ChipError> {
        let mut last = ChipError::Unreachable {
            sci,
            reg: regs::IDENT,
        };
        poll_until(clock, timeout, 1, || match Self::attach(csr, sci) {
            Ok(chip) => Some(chip),
            Err(e) => {
                last = e;
                None
            }
        })
        .ok_or(last)
    }

    pub fn sci(&self) -> SciId {
        self.sci
    }

    pub fn link_controller(&self) -> LinkController {
        self.lc
    }

    /// Whether the chip still answers with a sane identity.
    pub fn alive(&self) -> bool {
        Self::attach(self.csr, self.sci).is_ok()
    }

    /// Sets the coordinate the chip answers to. Done before training so the
    /// neighbours learn it.
    pub fn set_node_id(&self) {
        self.csr
            .write32(self.sci, regs::NODE_SCI, u32::from(self.sci.raw()));
    }

    /// Resets the link layer: every link goes down, error counters and route
    /// tables are cleared.
    pub fn reset(&self) -> Result<(), ChipError> {
        let mut r = FabricReset(0);
        r.set_assert(true);
        r.set_routes(true);
        self.csr.write32(self.sci, regs::FABRIC_RESET, r.0);
        for port in Port::LINKS {
            self.lc.clear(self.csr, self.sci, port)?;
        }
        Ok(())
    }

    pub fn link_status(&self, port: Port) -> Result<LinkStatus, ChipError> {
        self.lc.status(self.csr, self.sci, port)
    }

    pub fn link_errors(&self, port: Port) -> Result<u32, ChipError> {
        self.lc.errors(self.csr, self.sci, port)
    }

    /// Mask (see [`Port::mask_bit`]) of the ports in `wired` whose link is
    /// up.
    pub fn links_up(&self, wired: u8) -> Result<u8, ChipError> {
        let mut up = 0;
        for port in Port::LINKS {
            if wired & port.mask_bit() != 0
                && self.lc.is_up(self.csr, self.sci, port)?
            {
                up |= port.mask_bit();
            }
        }
        Ok(up)
    }

    /// Enables every port in `wired` and waits up to `timeout` for all of
    /// them to come up. Returns the mask of ports that did.
    ///
    /// Ports that are already up are left alone, so training again is
    /// harmless.
    pub fn train(
        &self,
        wired: u8,
        clock: &impl Clock,
        timeout: u64,
        interval: u64,
    ) -> Result<u8, ChipError> {
        let already = self.links_up(wired)?;
        for port in Port::LINKS {
            let bit = port.mask_bit();
            if wired & bit != 0 && already & bit == 0 {
                self.lc.enable(self.csr, self.sci, port)?;
            }
        }
        let mut up = already;
        let mut err = None;
        poll_until(clock, timeout, interval, || {
            match self.links_up(wired) {
                Ok(m) => {
                    up = m;
                    (m == wired).then_some(())
                }
                Err(e) => {
                    err = Some(e);
                    Some(())
                }
            }
        });
        match err {
            Some(e) => Err(e),
            None => Ok(up),
        }
    }

    /// Writes this node's forwarding entries from `plan`. `scis[i]` is the
    /// coordinate of node `i`.
    pub fn load_routes(
        &self,
        plan: &RoutePlan,
        me: NodeIndex,
        scis: &[SciId],
    ) -> Result<(), ChipError> {
        if let Some((_, dst, _)) = plan
            .entries(me)
            .find(|&(_, dst, _)| usize::from(dst) >= scis.len())
        {
            return Err(ChipError::UnknownNode(dst));
        }
        let routes = plan.entries(me).filter_map(|(ingress, dst, egress)| {
            Some((ingress, *scis.get(usize::from(dst))?, egress))
        });
        self.lc.commit_routes(self.csr, self.sci, routes)
    }

    /// Reads back every forwarding entry `plan` has for node `me`.
    pub fn verify_routes(
        &self,
        plan: &RoutePlan,
        me: NodeIndex,
        scis: &[SciId],
    ) -> Result<(), ChipError> {
        for (ingress, dst, egress) in plan.entries(me) {
            let d = *scis
                .get(usize::from(dst))
                .ok_or(ChipError::UnknownNode(dst))?;
            let found = self.lc.route(self.csr, self.sci, ingress, d)?;
            if found != Some(egress) {
                return Err(ChipError::RouteMismatch {
                    sci: self.sci,
                    ingress,
                    dst: d,
                    found,
                });
            }
        }
        Ok(())
    }

    /// Runs the chip's coherence self-check. Returns whether it passed.
    pub fn check(
        &self,
        clock: &impl Clock,
        timeout: u64,
    ) -> Result<bool, ChipError> {
        let mut go = CheckCtrl(0);
        go.set_start(true);
        self.csr.write32(self.sci, regs::CHECK_CTRL, go.0);

        let mut err = None;
        let st = poll_until(clock, timeout, 1, || {
            match read32(self.csr, self.sci, regs::CHECK_STATUS) {
                Ok(raw) => {
                    let s = CheckStatus(raw);
                    s.done().then_some(s)
                }
                Err(e) => {
                    err = Some(e);
                    Some(CheckStatus(0))
                }
            }
        });
        if let Some(e) = err {
            return Err(e);
        }
        let st = st.ok_or(ChipError::Timeout {
            sci: self.sci,
            reg: regs::CHECK_STATUS,
        })?;
        Ok(st.ok() && st.errors() == 0)
    }

    pub fn socket_count(&self) -> Result<u8, ChipError> {
        let n = read32(self.csr, self.sci, regs::NODE_SOCKETS)?;
        if n as usize > MAX_SOCKETS {
            return Err(ChipError::TooManySockets {
                sci: self.sci,
                count: n,
            });
        }
        Ok(n as u8)
    }

    pub fn socket(&self, s: u8) -> Result<SocketInfo, ChipError> {
        Ok(SocketInfo {
            dram: read64(self.csr, self.sci, regs::socket(s, regs::SOCKET_DRAM_SIZE))?,
            cores: read32(self.csr, self.sci, regs::socket(s, regs::SOCKET_CORES))?,
            apic_base: read32(
                self.csr,
                self.sci,
                regs::socket(s, regs::SOCKET_APIC_BASE),
            )?,
        })
    }

    /// Programs one of socket `s`'s decode tables from `table`, and disables
    /// the slots it does not use.
    pub fn program_windows<const N: usize>(
        &self,
        s: u8,
        which: DecodeTable,
        table: &RangeTable<N>,
    ) -> Result<(), ChipError> {
        let (block, slots) = which.slots();
        if table.len() > slots.len() {
            return Err(ChipError::TooManyRanges {
                sci: self.sci,
                count: table.len(),
            });
        }
        let gran = table.granularity().max(regs::RANGE_GRANULE);
        for r in table.iter() {
            check_aligned(r.base, gran)?;
            check_aligned(r.end(), gran)?;
        }

        let mut ranges = table.iter();
        for slot in slots {
            let reg = regs::range(s, block, slot);
            match ranges.next() {
                Some(r) => {
                    self.csr.write64(self.sci, reg, r.base);
                    self.csr.write64(self.sci, reg + 8, range_ctl(r).0);
                }
                None => {
                    self.csr.write64(self.sci, reg + 8, 0);
                    self.csr.write64(self.sci, reg, 0);
                }
            }
        }
        Ok(())
    }

    /// Reads back slot `slot` of one of socket `s`'s decode tables.
    pub fn window(
        &self,
        s: u8,
        which: DecodeTable,
        slot: usize,
    ) -> Result<Option<Range>, ChipError> {
        let (block, slots) = which.slots();
        let Some(slot) = slots.clone().nth(slot) else {
            return Ok(None);
        };
        let reg = regs::range(s, block, slot);
        let ctl = RangeCtl(read64(self.csr, self.sci, reg + 8)?);
        if !ctl.enable() {
            return Ok(None);
        }
        let base = read64(self.csr, self.sci, reg)?;
        let dest = match ctl.dest() {
            regs::DEST_SOCKET => Dest::Socket(ctl.socket()),
            regs::DEST_LOCAL => Dest::Local,
            regs::DEST_FABRIC => Dest::Fabric,
            _ => {
                return Err(ChipError::BadRegister {
                    sci: self.sci,
                    reg: reg + 8,
                })
            }
        };
        Ok(Some(Range {
            base,
            limit: (ctl.limit_hi() << 16) | (regs::RANGE_GRANULE - 1),
            dest,
        }))
    }

    /// The slice of DRAM this chip claims for its own node, `base..end`.
    pub fn set_local_dram(&self, base: u64, end: u64) -> Result<(), ChipError> {
        check_aligned(base, fabric_addr::DRAM_DECREMENT)?;
        check_aligned(end, fabric_addr::DRAM_DECREMENT)?;
        self.csr.write64(self.sci, regs::LOCAL_DRAM_BASE, base);
        self.csr
            .write64(self.sci, regs::LOCAL_DRAM_LIMIT, end.saturating_sub(1));
        Ok(())
    }

    /// Loads a translation table. `scis[i]` is the coordinate of node `i`.
    pub fn load_att(
        &self,
        mmio: bool,
        att: &Att,
        scis: &[SciId],
    ) -> Result<(), ChipError> {
        if let Some(&Some(n)) = att
            .entries()
            .iter()
            .find(|o| o.is_some_and(|n| usize::from(n) >= scis.len()))
        {
            return Err(ChipError::UnknownNode(n));
        }
        for (i, owner) in att.entries().iter().enumerate() {
            let mut e = AttEntry(0);
            if let Some(sci) = owner.and_then(|n| scis.get(usize::from(n))) {
                e.set_valid(true);
                e.set_sci(sci.raw());
            }
            let mut ix = AttIndex(0);
            ix.set_mmio(mmio);
            ix.set_entry(i as u16);
            self.csr.write32(self.sci, regs::ATT_INDEX, ix.0);
            self.csr.write32(self.sci, regs::ATT_DATA, e.0);
        }
        Ok(())
    }

    pub fn set_apic_offset(&self, offset: u32) {
        self.csr.write32(self.sci, regs::APIC_OFFSET, offset);
    }

    /// Clears socket `s`'s DRAM and waits for the engine to finish.
    pub fn scrub(
        &self,
        s: u8,
        clock: &impl Clock,
        timeout: u64,
    ) -> Result<(), ChipError> {
        let mut go = ScrubCtrl(0);
        go.set_start(true);
        self.csr
            .write32(self.sci, regs::socket(s, regs::SOCKET_SCRUB_CTRL), go.0);
        let reg = regs::socket(s, regs::SOCKET_SCRUB_STATUS);
        let mut err = None;
        poll_until(clock, timeout, 1, || match read32(self.csr, self.sci, reg) {
            Ok(raw) => ScrubStatus(raw).done().then_some(()),
            Err(e) => {
                err = Some(e);
                Some(())
            }
        })
        .ok_or(ChipError::Timeout { sci: self.sci, reg })?;
        err.map_or(Ok(()), Err)
    }

    pub fn read_info(&self) -> Result<NodeInfo, ChipError> {
        let mut words = [0u32; regs::INFO_WORDS];
        for (i, w) in words.iter_mut().enumerate() {
            // An all-ones word is legal here (a zeroed field is not), so the
            // raw accessor is used and only the magic is checked below.
            *w = self.csr.read32(self.sci, regs::INFO + i as u32 * 4);
        }
        if words.iter().all(|&w| w == u32::MAX) {
            return Err(ChipError::Unreachable {
                sci: self.sci,
                reg: regs::INFO,
            });
        }
        Ok(NodeInfo::from_words(words))
    }

    pub fn write_info(&self, info: &NodeInfo) {
        for (i, w) in info.to_words().into_iter().enumerate() {
            self.csr.write32(self.sci, regs::INFO + i as u32 * 4, w);
        }
    }
}

fn range_ctl(r: &Range) -> RangeCtl {
    let mut ctl = RangeCtl(0);
    ctl.set_enable(true);
    match r.dest {
        Dest::Socket(s) => {
            ctl.set_dest(regs::DEST_SOCKET);
            ctl.set_socket(s);
        }
        Dest::Local => ctl.set_dest(regs::DEST_LOCAL),
        Dest::Fabric => ctl.set_dest(regs::DEST_FABRIC),
    }
    ctl.set_limit_hi(r.limit >> 16);
    ctl
}
