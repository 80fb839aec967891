// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The platform memory map, in the form the next boot stage consumes.

use heapless::Vec;
use num_derive::FromPrimitive;

use crate::AddrError;

#[derive(Copy, Clone, Debug, PartialEq, Eq, FromPrimitive)]
#[repr(u32)]
pub enum E820Kind {
    Ram = 1,
    Reserved = 2,
    Acpi = 3,
    Nvs = 4,
    Unusable = 5,
}

impl E820Kind {
    pub fn from_raw(v: u32) -> Option<Self> {
        num_traits::FromPrimitive::from_u32(v)
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct E820Entry {
    pub base: u64,
    pub len: u64,
    pub kind: E820Kind,
}

impl E820Entry {
    pub fn end(&self) -> u64 {
        self.base + self.len
    }
}

/// Sorted, non-overlapping memory map entries.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct E820Map<const N: usize> {
    entries: Vec<E820Entry, N>,
}

impl<const N: usize> E820Map<N> {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Marks `base..base + len` as `kind`. Whatever the range overlaps is cut
    /// back to the range's edges (an entry covering the whole range is split
    /// in two), and neighbours of the same kind are merged. On error the map
    /// is unchanged.
    pub fn add(
        &mut self,
        base: u64,
        len: u64,
        kind: E820Kind,
    ) -> Result<(), AddrError> {
        if len == 0 {
            return Ok(());
        }
        let end = base.checked_add(len).ok_or(AddrError::Empty {
            base,
            limit: base.wrapping_add(len),
        })?;

        let mut next: Vec<E820Entry, N> = Vec::new();
        let mut push = |e: E820Entry| {
            if e.len == 0 {
                return Ok(());
            }
            if let Some(prev) = next.last_mut() {
                if prev.kind == e.kind && prev.end() == e.base {
                    prev.len += e.len;
                    return Ok(());
                }
            }
            next.push(e).map_err(|_| AddrError::TableFull)
        };

        let new = E820Entry { base, len, kind };
        let mut placed = false;
        for &e in &self.entries {
            if e.end() <= base || e.base >= end {
                if !placed && e.base >= end {
                    push(new)?;
                    placed = true;
                }
                push(e)?;
                continue;
            }
            // Overlapping: keep what sticks out on either side.
            if e.base < base {
                push(E820Entry {
                    base: e.base,
                    len: base - e.base,
                    kind: e.kind,
                })?;
            }
            if !placed {
                push(new)?;
                placed = true;
            }
            if e.end() > end {
                push(E820Entry {
                    base: end,
                    len: e.end() - end,
                    kind: e.kind,
                })?;
            }
        }
        if !placed {
            push(new)?;
        }

        self.entries = next;
        Ok(())
    }

    /// Index of the entry containing `addr`.
    pub fn position(&self, addr: u64) -> Option<usize> {
        self.entries
            .iter()
            .position(|e| e.base <= addr && addr < e.end())
    }

    pub fn get(&self, i: usize) -> Option<&E820Entry> {
        self.entries.get(i)
    }

    pub fn iter(&self) -> impl Iterator<Item = &E820Entry> + '_ {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Bytes of the map of the given kind.
    pub fn total(&self, kind: E820Kind) -> u64 {
        self.entries
            .iter()
            .filter(|e| e.kind == kind)
            .map(|e| e.len)
            .sum()
    }
}
