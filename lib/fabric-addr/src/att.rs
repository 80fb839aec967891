// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use drv_fabric_api::NodeIndex;
use heapless::Vec;

use crate::{align_up, is_aligned, node_index, AddrError, NodeMem};

/// Entries in a fabric chip address-translation table.
pub const ATT_ENTRIES: usize = 4096;

/// An address-translation table: the address space from zero up is cut into
/// `1 << shift` byte segments, and each segment names the node that owns
/// it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Att {
    shift: u32,
    entries: Vec<Option<NodeIndex>, ATT_ENTRIES>,
}

impl Att {
    /// A table with enough segments to cover `0..top`, all unowned.
    pub fn new(shift: u32, top: u64) -> Result<Self, AddrError> {
        let segs = align_up(top, 1 << shift) >> shift;
        if segs > ATT_ENTRIES as u64 {
            return Err(AddrError::DecodeLimit { top });
        }
        let mut entries = Vec::new();
        // Cannot fail: `segs` was checked against the capacity.
        let _ = entries.resize(segs as usize, None);
        Ok(Self { shift, entries })
    }

    /// Gives `base..end` to `node`. Both bounds must sit on segment
    /// boundaries and no segment may already be owned.
    pub fn assign(
        &mut self,
        base: u64,
        end: u64,
        node: NodeIndex,
    ) -> Result<(), AddrError> {
        let gran = self.granularity();
        for addr in [base, end] {
            if !is_aligned(addr, gran) {
                return Err(AddrError::Misaligned {
                    addr,
                    granularity: gran,
                });
            }
        }
        if end <= base {
            return Err(AddrError::Empty {
                base,
                limit: end.wrapping_sub(1),
            });
        }
        let (lo, hi) = ((base >> self.shift) as usize, (end >> self.shift) as usize);
        let slots = self
            .entries
            .get_mut(lo..hi)
            .ok_or(AddrError::DecodeLimit { top: end })?;
        if slots.iter().any(Option::is_some) {
            return Err(AddrError::Overlap {
                base,
                limit: end - 1,
            });
        }
        slots.fill(Some(node));
        Ok(())
    }

    /// Partitions DRAM: each node owns from its base up to the next node's
    /// base, and the last node up to its end rounded up to a segment. The
    /// table covers `0..top`.
    pub fn for_dram(
        shift: u32,
        nodes: &[NodeMem],
        top: u64,
    ) -> Result<Self, AddrError> {
        let mut att = Self::new(shift, top)?;
        let gran = att.granularity();
        for (i, n) in nodes.iter().enumerate() {
            let end = match nodes.get(i + 1) {
                Some(next) => next.base,
                None => align_up(n.end, gran),
            };
            if end > n.base {
                att.assign(n.base, end, node_index(i))?;
            }
        }
        Ok(att)
    }

    pub fn owner(&self, addr: u64) -> Option<NodeIndex> {
        let i = usize::try_from(addr >> self.shift).ok()?;
        *self.entries.get(i)?
    }

    pub fn entries(&self) -> &[Option<NodeIndex>] {
        &self.entries
    }

    pub fn shift(&self) -> u32 {
        self.shift
    }

    pub fn granularity(&self) -> u64 {
        1 << self.shift
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{layout, Hole, DRAM_ATT_SHIFT, MMIO32_ATT_SHIFT};

    const GIB: u64 = 1 << 30;

    #[test]
    fn dram_partition_skips_nothing() {
        let hole = Hole {
            base: 92 * GIB,
            end: 96 * GIB,
        };
        let mut nodes: [NodeMem; 4] = Default::default();
        for n in &mut nodes {
            n.sockets = Vec::from_slice(&[32 * GIB]).unwrap();
        }
        let top = layout(&mut nodes, hole, 16 * GIB).unwrap();
        let att = Att::for_dram(DRAM_ATT_SHIFT, &nodes, top).unwrap();

        assert_eq!(att.entries().len(), 8);
        assert_eq!(
            att.entries(),
            [0u8, 0, 1, 1, 2, 2, 3, 3].map(Some).as_slice()
        );
        // The hole belongs to the node that was cut short by it.
        assert_eq!(att.owner(93 * GIB), Some(2));
        assert_eq!(att.owner(128 * GIB), None);
    }

    #[test]
    fn mmio32_windows() {
        let mut att = Att::new(MMIO32_ATT_SHIFT, 1 << 32).unwrap();
        assert_eq!(att.entries().len(), ATT_ENTRIES);
        att.assign(0x8000_0000, 0x8400_0000, 0).unwrap();
        att.assign(0x8400_0000, 0x8800_0000, 1).unwrap();
        assert_eq!(att.owner(0x83ff_ffff), Some(0));
        assert_eq!(att.owner(0x8400_0000), Some(1));
        assert_eq!(att.owner(0x7fff_ffff), None);
        assert_eq!(
            att.assign(0x8300_0000, 0x8500_0000, 2),
            Err(AddrError::Overlap {
                base: 0x8300_0000,
                limit: 0x84ff_ffff
            })
        );
        assert!(matches!(
            att.assign(0x9000_0800, 0x9100_0000, 2),
            Err(AddrError::Misaligned { .. })
        ));
    }

    #[test]
    fn too_big_for_the_table() {
        assert_eq!(
            Att::new(MMIO32_ATT_SHIFT, (1 << 32) + 1),
            Err(AddrError::DecodeLimit { top: (1 << 32) + 1 })
        );
    }
}
