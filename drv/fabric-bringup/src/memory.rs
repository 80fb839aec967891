// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The master's half of unification: taking the partition's other nodes
//! over and giving every node its share of the address space.
//!
//! The master writes to a slave's chip only after the slave has said, in its
//! info block, that it is parked waiting; until then the slave owns its
//! registers. Everything after the claim is computed from what the info
//! blocks say, laid out by [`allocate`], and only then written out by
//! [`program`], so a layout that cannot be built leaves the hardware alone.

use drv_fabric_api::{poll_until, Clock, Csr, NodeIndex, SciId, MAX_NODES};
use drv_fabric_chip::regs::{CSR_WINDOW_BASE, CSR_WINDOW_LEN};
use drv_fabric_chip::{DecodeTable, FabricChip, InfoState, NodeInfo, DECODE_LIMIT};
use fabric_addr::{
    apic_offsets, check_decode, layout, layout_windows, node_dram_map,
    node_mmio_map, trim_node, AddrError, Att, E820Kind, E820Map, NodeMem,
    Window, DRAM_ATT_SHIFT, MMIO32_ATT_SHIFT,
};
use heapless::Vec;
use ringbuf::ringbuf_entry;

use crate::config::Tunables;
use crate::state::{FabricState, Trace};
use crate::Fatal;

/// Entries in the memory map handed to the next stage.
pub const E820_ENTRIES: usize = 64;

/// Top of memory above 4 GiB, as the processors decode it.
pub const TOM2_MSR: u32 = 0xc001_001d;

const NODE_ALIGN: u64 = 1 << DRAM_ATT_SHIFT;
const MMIO32_GRAN: u64 = 1 << MMIO32_ATT_SHIFT;
const FOUR_GIB: u64 = 1 << 32;

/// A node of the master's partition, as its info block describes it.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct PartitionNode {
    /// Index in the cluster configuration.
    pub node: NodeIndex,
    pub sci: SciId,
    pub info: NodeInfo,
}

/// Where everything goes. Every table is indexed by position in
/// `members`, which starts with the master.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MemoryMap {
    pub members: Vec<PartitionNode, MAX_NODES>,
    pub dram: Vec<NodeMem, MAX_NODES>,
    pub dram_top: u64,
    pub mmio32: Vec<Window, MAX_NODES>,
    pub mmio32_window: Window,
    pub mmio64: Vec<Window, MAX_NODES>,
    pub mmio64_window: Window,
    pub apic: Vec<u32, MAX_NODES>,
}

impl MemoryMap {
    pub fn scis(&self) -> Vec<SciId, MAX_NODES> {
        self.members.iter().map(|m| m.sci).collect()
    }

    pub fn total_dram(&self) -> u64 {
        self.dram.iter().map(NodeMem::size).sum()
    }
}

/// Reads back the forwarding tables of every node in our partition.
pub fn verify_routes<C: Csr>(
    state: &mut FabricState<'_>,
    csr: &C,
) -> Result<(), Fatal> {
    let config = state.config();
    let part = config.partition_of(state.me()).ok_or(Fatal::NotMaster)?;
    let plan = state.plan().ok_or(Fatal::NoRoutes)?;
    let mut verified: Vec<SciId, MAX_NODES> = Vec::new();
    for node in config.members_of(&part.name) {
        let sci = state.scis()[usize::from(node)];
        FabricChip::attach(csr, sci)?.verify_routes(plan, node, state.scis())?;
        // Cannot overflow: there are no more members than nodes.
        let _ = verified.push(sci);
    }
    for sci in verified {
        ringbuf_entry!(state.trace, Trace::RoutesVerified(sci));
    }
    Ok(())
}

/// Takes over every other node of our partition once it is parked. The
/// result starts with ourselves.
pub fn claim<C: Csr>(
    state: &mut FabricState<'_>,
    csr: &C,
    clock: &impl Clock,
) -> Result<Vec<PartitionNode, MAX_NODES>, Fatal> {
    let config = state.config();
    let part = config.partition_of(state.me()).ok_or(Fatal::NotMaster)?;
    let timeout = config.tunables.claim_timeout_ms;
    let master = state.sci();

    let mut members = Vec::new();
    push(
        &mut members,
        PartitionNode {
            node: state.me(),
            sci: master,
            info: *state.info(),
        },
    )?;

    for node in config.members_of(&part.name) {
        if node == state.me() {
            continue;
        }
        let sci = config.scis()[usize::from(node)];
        let chip = FabricChip::attach(csr, sci)?;
        let info = poll_until(clock, timeout, 1, || {
            chip.read_info()
                .ok()
                .filter(|i| i.state() == Some(InfoState::Waiting))
        })
        .ok_or(Fatal::ClaimTimeout(sci))?;
        if info.sci != u32::from(sci.raw()) {
            return Err(Fatal::BadInfo(sci));
        }

        let mut claimed = info;
        claimed.set_state(InfoState::Claimed);
        claimed.master = u32::from(master.raw());
        chip.write_info(&claimed);
        ringbuf_entry!(state.trace, Trace::Claimed(sci));
        push(&mut members, PartitionNode { node, sci, info })?;
    }
    Ok(members)
}

fn push(
    members: &mut Vec<PartitionNode, MAX_NODES>,
    m: PartitionNode,
) -> Result<(), Fatal> {
    members.push(m).map_err(|_| Fatal::Addr(AddrError::TableFull))
}

/// Lays out DRAM, both MMIO windows and APIC ids for `members`.
pub fn allocate(
    members: &[PartitionNode],
    t: &Tunables,
) -> Result<MemoryMap, Fatal> {
    if members.is_empty() {
        return Err(AddrError::NoNodes.into());
    }
    let limit = t.mem_limit.unwrap_or(u64::MAX);
    let n = members.len();

    let mut dram: Vec<NodeMem, MAX_NODES> = Vec::new();
    for m in members {
        let mut node = NodeMem::default();
        for s in 0..m.info.sockets.min(node.sockets.capacity() as u32) {
            let _ = node.sockets.push(m.info.dram(s as usize));
        }
        trim_node(&mut node.sockets, limit, NODE_ALIGN)?;
        dram.push(node).map_err(|_| AddrError::TableFull)?;
    }
    let dram_top = layout(&mut dram, t.hole(), NODE_ALIGN)?;
    check_decode(dram_top, DECODE_LIMIT.min(CSR_WINDOW_BASE))?;

    let mmio32_window = Window {
        base: t.mmio32_base,
        end: t.mmio32_end,
    };
    let sizes: Vec<u64, MAX_NODES> = (0..n).map(|_| t.mmio32_per_node).collect();
    let mmio32 = layout_windows(&sizes, mmio32_window, MMIO32_GRAN)?;

    let per_node = t.mmio64_per_node;
    let sizes: Vec<u64, MAX_NODES> = (0..n).map(|_| per_node).collect();
    let len = per_node.saturating_mul(n as u64);
    let mut base = align_up(dram_top.max(FOUR_GIB), per_node)?;
    let forbidden = [
        (t.hole_base, t.hole_end),
        (CSR_WINDOW_BASE, CSR_WINDOW_BASE + CSR_WINDOW_LEN),
    ];
    // Stepping over one region can land in the other; `base` only grows.
    while let Some(&(_, hi)) = forbidden
        .iter()
        .find(|&&(lo, hi)| base < hi && base.saturating_add(len) > lo)
    {
        base = align_up(hi, per_node)?;
    }
    let mmio64 = layout_windows(
        &sizes,
        Window {
            base,
            end: t.phys_limit,
        },
        per_node,
    )?;
    let mmio64_window = Window {
        base,
        end: mmio64.last().map_or(base, |w| w.end),
    };

    let spans: Vec<u32, MAX_NODES> =
        members.iter().map(|m| m.info.apic_span).collect();
    let apic = apic_offsets(&spans, t.apic_max)?;

    Ok(MemoryMap {
        members: Vec::from_slice(members).map_err(|_| AddrError::TableFull)?,
        dram,
        dram_top,
        mmio32,
        mmio32_window,
        mmio64,
        mmio64_window,
        apic,
    })
}

fn align_up(v: u64, gran: u64) -> Result<u64, AddrError> {
    v.checked_next_multiple_of(gran)
        .ok_or(AddrError::DecodeLimit { top: v })
}

/// Writes `map` into the chip of every node it covers.
pub fn program<C: Csr>(
    state: &mut FabricState<'_>,
    csr: &C,
    map: &MemoryMap,
) -> Result<(), Fatal> {
    let scis = map.scis();
    let dram_att = Att::for_dram(DRAM_ATT_SHIFT, &map.dram, map.dram_top)?;
    let mut mmio_att = Att::new(MMIO32_ATT_SHIFT, map.mmio32_window.end)?;
    for (i, w) in map.mmio32.iter().enumerate() {
        mmio_att.assign(w.base, w.end, i as NodeIndex)?;
    }

    for (i, m) in map.members.iter().enumerate() {
        let chip = FabricChip::attach(csr, m.sci)?;
        let dram = node_dram_map(&map.dram, i, map.dram_top)?;
        let mmio32 =
            node_mmio_map(&map.mmio32, i, map.mmio32_window, MMIO32_GRAN)?;
        let mmio64 = node_mmio_map(
            &map.mmio64,
            i,
            map.mmio64_window,
            state.config().tunables.mmio64_per_node,
        )?;

        for s in 0..chip.socket_count()? {
            chip.program_windows(s, DecodeTable::Dram, &dram)?;
            chip.program_windows(s, DecodeTable::Mmio32, &mmio32)?;
            chip.program_windows(s, DecodeTable::Mmio64, &mmio64)?;
        }
        chip.set_local_dram(map.dram[i].base, map.dram[i].end)?;
        chip.load_att(false, &dram_att, &scis)?;
        chip.load_att(true, &mmio_att, &scis)?;
        chip.set_apic_offset(map.apic[i]);
        ringbuf_entry!(state.trace, Trace::Programmed(m.sci));
    }
    Ok(())
}

/// Adds what the partition has become to the platform memory map. The
/// master's own memory is left as the platform described it, reservations
/// included.
pub fn describe<const N: usize>(
    map: &MemoryMap,
    t: &Tunables,
    e820: &mut E820Map<N>,
) -> Result<(), Fatal> {
    for node in map.dram.iter().skip(1) {
        if node.end > node.base {
            e820.add(node.base, node.end - node.base, E820Kind::Ram)?;
        }
    }

    let w = map.mmio32_window;
    e820.add(w.base, w.len(), E820Kind::Reserved)?;
    if t.hole_base < map.dram_top {
        e820.add(t.hole_base, t.hole_end - t.hole_base, E820Kind::Reserved)?;
    }
    e820.add(CSR_WINDOW_BASE, CSR_WINDOW_LEN, E820Kind::Reserved)?;
    for r in t.reserved.iter().chain(&t.trace_buffer) {
        e820.add(r.base, r.len, E820Kind::Reserved)?;
    }
    Ok(())
}

/// Clears the DRAM of every socket in the partition, so nothing a node left
/// behind before unification is visible to the next stage.
pub fn scrub<C: Csr>(
    state: &mut FabricState<'_>,
    csr: &C,
    clock: &impl Clock,
    map: &MemoryMap,
) -> Result<(), Fatal> {
    let timeout = state.config().tunables.scrub_timeout_ms;
    for m in &map.members {
        let chip = FabricChip::attach(csr, m.sci)?;
        for socket in 0..chip.socket_count()? {
            chip.scrub(socket, clock, timeout)?;
            ringbuf_entry!(state.trace, Trace::Scrubbed { sci: m.sci, socket });
        }
    }
    Ok(())
}
