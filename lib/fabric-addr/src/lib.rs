// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Global address space allocation for a unified fabric.
//!
//! The steps run strictly in order, each consuming the output of the one
//! before:
//!
//! 1. [`trim_node`] shrinks each node's DRAM to the memory limit and the
//!    address-translation granularity.
//! 2. [`layout`] places the nodes' DRAM contiguously, stepping over the
//!    decode hole.
//! 3. [`node_dram_map`] builds one node's decode windows: its sockets, plus
//!    windows that send everything else to its fabric chip.
//! 4. [`Att`] partitions the address space by owning node for the fabric
//!    chip's translation tables.
//! 5. [`E820Map`] is the platform memory map handed to the next stage.
//!
//! Every table refuses a range that is empty, misaligned or overlapping when
//! it is inserted, rather than leaving that to be discovered by whoever
//! programs the hardware.

#![cfg_attr(not(test), no_std)]

use drv_fabric_api::NodeIndex;
use heapless::Vec;

mod att;
mod e820;
mod layout;
mod mmio;
mod trim;

pub use att::{Att, ATT_ENTRIES};
pub use e820::{E820Entry, E820Kind, E820Map};
pub use layout::{check_decode, layout, node_dram_map, Hole, NodeMem};
pub use mmio::{apic_offsets, layout_windows, node_mmio_map, Window};
pub use trim::trim_node;

/// Step by which DRAM is trimmed, and the granularity of socket windows.
pub const DRAM_DECREMENT: u64 = 1 << 24;

/// DRAM address-translation entries each cover `1 << DRAM_ATT_SHIFT` bytes.
pub const DRAM_ATT_SHIFT: u32 = 34;

/// MMIO32 address-translation entries each cover `1 << MMIO32_ATT_SHIFT`
/// bytes.
pub const MMIO32_ATT_SHIFT: u32 = 20;

/// Decode windows per node: one per socket, plus the remote windows below
/// and above.
pub const MAX_DRAM_RANGES: usize = drv_fabric_api::MAX_SOCKETS + 2;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum AddrError {
    /// `limit` is not above `base`.
    Empty { base: u64, limit: u64 },
    Misaligned { addr: u64, granularity: u64 },
    /// The range overlaps one already in the table.
    Overlap { base: u64, limit: u64 },
    /// A fixed-capacity table is full.
    TableFull,
    /// The map would reach past what the fabric can decode.
    DecodeLimit { top: u64 },
    /// The decode hole is empty or its bounds are not suitably aligned.
    BadHole,
    /// Trimming could not make a node compliant.
    TrimStuck { size: u64 },
    /// Windows do not fit in the space they are laid out in.
    WindowExhausted { need: u64, end: u64 },
    ApicExhausted,
    NoNodes,
}

/// Where a decode window sends matching addresses.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Dest {
    /// A memory controller behind this node's fabric chip.
    Socket(u8),
    /// This node's own I/O.
    Local,
    /// Out over the fabric chip.
    Fabric,
}

/// An enabled window covering `base..=limit`.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Range {
    pub base: u64,
    pub limit: u64,
    pub dest: Dest,
}

impl Range {
    /// The window covering `base..end`.
    pub fn span(base: u64, end: u64, dest: Dest) -> Result<Self, AddrError> {
        if end <= base {
            return Err(AddrError::Empty {
                base,
                limit: end.wrapping_sub(1),
            });
        }
        Ok(Self {
            base,
            limit: end - 1,
            dest,
        })
    }

    pub fn contains(&self, addr: u64) -> bool {
        self.base <= addr && addr <= self.limit
    }

    pub fn overlaps(&self, other: &Range) -> bool {
        !(self.limit < other.base || other.limit < self.base)
    }

    /// One past `limit`, saturating at the top of the address space.
    pub fn end(&self) -> u64 {
        self.limit.saturating_add(1)
    }
}

/// A set of non-overlapping, aligned windows, kept in address order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RangeTable<const N: usize> {
    granularity: u64,
    entries: Vec<Range, N>,
}

impl<const N: usize> RangeTable<N> {
    /// `granularity` must be a power of two.
    pub fn new(granularity: u64) -> Self {
        Self {
            granularity,
            entries: Vec::new(),
        }
    }

    pub fn insert(&mut self, r: Range) -> Result<(), AddrError> {
        if r.limit <= r.base {
            return Err(AddrError::Empty {
                base: r.base,
                limit: r.limit,
            });
        }
        let mask = self.granularity - 1;
        if r.base & mask != 0 {
            return Err(AddrError::Misaligned {
                addr: r.base,
                granularity: self.granularity,
            });
        }
        if r.limit & mask != mask {
            return Err(AddrError::Misaligned {
                addr: r.end(),
                granularity: self.granularity,
            });
        }
        if self.entries.iter().any(|e| e.overlaps(&r)) {
            return Err(AddrError::Overlap {
                base: r.base,
                limit: r.limit,
            });
        }
        let at = self
            .entries
            .iter()
            .position(|e| e.base > r.base)
            .unwrap_or(self.entries.len());
        self.entries
            .insert(at, r)
            .map_err(|_| AddrError::TableFull)
    }

    pub fn lookup(&self, addr: u64) -> Option<&Range> {
        self.entries.iter().find(|e| e.contains(addr))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Range> + '_ {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn granularity(&self) -> u64 {
        self.granularity
    }
}

pub(crate) const fn align_up(v: u64, gran: u64) -> u64 {
    (v + gran - 1) & !(gran - 1)
}

pub(crate) const fn is_aligned(v: u64, gran: u64) -> bool {
    v & (gran - 1) == 0
}

/// Node index for a position in a node slice. Slices are never longer than
/// `MAX_NODES`.
pub(crate) fn node_index(i: usize) -> NodeIndex {
    i as NodeIndex
}
