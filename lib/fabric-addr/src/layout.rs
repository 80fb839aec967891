// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use drv_fabric_api::MAX_SOCKETS;
use heapless::Vec;

use crate::{
    is_aligned, AddrError, Dest, Range, RangeTable, DRAM_DECREMENT,
    MAX_DRAM_RANGES,
};

/// Addresses the processors decode themselves and that must never be backed
/// by DRAM: `base..end`.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Hole {
    pub base: u64,
    pub end: u64,
}

impl Hole {
    pub const DEFAULT: Hole = Hole {
        base: 0xfd_0000_0000,
        end: 0x100_0000_0000,
    };

    /// The hole must start on a socket-window boundary and end on a node
    /// boundary (`align`).
    pub fn validate(&self, align: u64) -> Result<(), AddrError> {
        if self.base >= self.end
            || !is_aligned(self.base, DRAM_DECREMENT)
            || !is_aligned(self.end, align)
        {
            return Err(AddrError::BadHole);
        }
        Ok(())
    }

    pub fn contains(&self, addr: u64) -> bool {
        self.base <= addr && addr < self.end
    }
}

/// One node's DRAM: per-socket sizes, and the global span `base..end` that
/// [`layout`] gives it.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct NodeMem {
    pub sockets: Vec<u64, MAX_SOCKETS>,
    pub base: u64,
    pub end: u64,
}

impl NodeMem {
    pub fn size(&self) -> u64 {
        self.sockets.iter().sum()
    }
}

/// Lays node DRAM out contiguously in node order, starting at zero, and
/// returns the end of the last node.
///
/// A node that would start inside `hole` starts at its end instead. A node
/// that would straddle the start of `hole` is cut off there: the excess is
/// taken back from its sockets, last socket first, and the next node starts
/// at the end of the hole. Node sizes must already be multiples of `align`
/// (see [`crate::trim_node`]).
pub fn layout(
    nodes: &mut [NodeMem],
    hole: Hole,
    align: u64,
) -> Result<u64, AddrError> {
    if nodes.is_empty() {
        return Err(AddrError::NoNodes);
    }
    hole.validate(align)?;

    let mut cursor = 0u64;
    for n in nodes.iter_mut() {
        if hole.contains(cursor) {
            cursor = hole.end;
        }
        if !is_aligned(cursor, align) {
            return Err(AddrError::Misaligned {
                addr: cursor,
                granularity: align,
            });
        }
        let size = n.size();
        let end = cursor
            .checked_add(size)
            .ok_or(AddrError::DecodeLimit { top: u64::MAX })?;

        n.base = cursor;
        if cursor < hole.base && end > hole.base {
            drop_tail(&mut n.sockets, end - hole.base);
            n.end = hole.base;
            cursor = hole.end;
        } else {
            n.end = end;
            cursor = end;
        }
    }
    Ok(nodes[nodes.len() - 1].end)
}

fn drop_tail(sockets: &mut [u64], mut excess: u64) {
    for s in sockets.iter_mut().rev() {
        let take = excess.min(*s);
        *s -= take;
        excess -= take;
        if excess == 0 {
            break;
        }
    }
}

/// Fails if anything would be placed at or above `limit`.
pub fn check_decode(top: u64, limit: u64) -> Result<(), AddrError> {
    if top > limit {
        Err(AddrError::DecodeLimit { top })
    } else {
        Ok(())
    }
}

/// DRAM decode windows for node `me` once [`layout`] has run.
///
/// Each socket decodes its own slice. Everything below the node goes to the
/// fabric chip; so does everything from the end of the node up to `top`
/// unless this is the last node, so that a stray access is answered by the
/// fabric (and aborts) rather than left undecoded.
pub fn node_dram_map(
    nodes: &[NodeMem],
    me: usize,
    top: u64,
) -> Result<RangeTable<MAX_DRAM_RANGES>, AddrError> {
    let node = nodes.get(me).ok_or(AddrError::NoNodes)?;
    let mut t = RangeTable::new(DRAM_DECREMENT);

    let mut cursor = node.base;
    for (i, &size) in node.sockets.iter().enumerate() {
        if size == 0 {
            continue;
        }
        let end = cursor + size;
        t.insert(Range::span(cursor, end, Dest::Socket(i as u8))?)?;
        cursor = end;
    }

    if me > 0 && node.base > 0 {
        t.insert(Range::span(0, node.base, Dest::Fabric)?)?;
    }
    if me + 1 < nodes.len() && node.end < top {
        t.insert(Range::span(node.end, top, Dest::Fabric)?)?;
    }
    Ok(t)
}
