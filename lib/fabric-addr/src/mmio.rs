// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use drv_fabric_api::MAX_NODES;
use heapless::Vec;

use crate::{align_up, AddrError, Dest, Range, RangeTable};

/// A span of address space, `base..end`.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Window {
    pub base: u64,
    pub end: u64,
}

impl Window {
    pub fn len(&self) -> u64 {
        self.end - self.base
    }

    pub fn is_empty(&self) -> bool {
        self.end <= self.base
    }
}

/// Lays out one window per node, in node order, inside `within`. Each
/// window starts on a multiple of `gran` and is rounded up to one.
pub fn layout_windows(
    sizes: &[u64],
    within: Window,
    gran: u64,
) -> Result<Vec<Window, MAX_NODES>, AddrError> {
    let mut out = Vec::new();
    let mut cursor = align_up(within.base, gran);
    for &size in sizes {
        let end = cursor
            .checked_add(align_up(size, gran))
            .filter(|&e| e <= within.end)
            .ok_or(AddrError::WindowExhausted {
                need: size,
                end: within.end,
            })?;
        out.push(Window { base: cursor, end })
            .map_err(|_| AddrError::TableFull)?;
        cursor = end;
    }
    Ok(out)
}

/// Node `me`'s MMIO decode for `within`: its own slice is handled locally,
/// and the rest of the window goes to the fabric chip.
pub fn node_mmio_map(
    slices: &[Window],
    me: usize,
    within: Window,
    gran: u64,
) -> Result<RangeTable<3>, AddrError> {
    let own = slices.get(me).ok_or(AddrError::NoNodes)?;
    let mut t = RangeTable::new(gran);
    if own.base > within.base {
        t.insert(Range::span(within.base, own.base, Dest::Fabric)?)?;
    }
    if !own.is_empty() {
        t.insert(Range::span(own.base, own.end, Dest::Local)?)?;
    }
    if within.end > own.end {
        t.insert(Range::span(own.end, within.end, Dest::Fabric)?)?;
    }
    Ok(t)
}

/// APIC id offsets: node `i` gets the sum of the spans of the nodes before
/// it, each span rounded up to a multiple of 16. Everything must fit below
/// `max`.
pub fn apic_offsets(
    spans: &[u32],
    max: u32,
) -> Result<Vec<u32, MAX_NODES>, AddrError> {
    let mut out = Vec::new();
    let mut next = 0u32;
    for &span in spans {
        out.push(next).map_err(|_| AddrError::TableFull)?;
        next = span
            .checked_add(15)
            .map(|s| s & !15)
            .and_then(|s| next.checked_add(s))
            .filter(|&n| n <= max)
            .ok_or(AddrError::ApicExhausted)?;
    }
    Ok(out)
}
