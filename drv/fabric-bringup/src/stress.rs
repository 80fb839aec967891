// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Fabric stress test: every core fills a chunk of memory with a pattern
//! derived from the address, then checks a chunk some other core filled,
//! on another node where there is one.

use drv_fabric_api::MAX_NODES;
use heapless::Vec;

use crate::cores::{Core, MAX_CORES};
use crate::memory::MemoryMap;

/// Physical memory as a core sees it.
pub trait Memory {
    fn read64(&self, addr: u64) -> u64;
    fn write64(&self, addr: u64, val: u64);
}

impl<T: Memory + ?Sized> Memory for &T {
    fn read64(&self, addr: u64) -> u64 {
        (**self).read64(addr)
    }
    fn write64(&self, addr: u64, val: u64) {
        (**self).write64(addr, val)
    }
}

/// `base..base + len`, filled from `seed`.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Chunk {
    pub base: u64,
    pub len: u64,
    pub seed: u64,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Mismatch {
    pub addr: u64,
    pub expected: u64,
    pub found: u64,
}

pub fn splitmix64(mut z: u64) -> u64 {
    z = z.wrapping_add(0x9e37_79b9_7f4a_7c15);
    z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
    z ^ (z >> 31)
}

/// The word expected at `addr`.
pub fn pattern(seed: u64, addr: u64) -> u64 {
    splitmix64(seed ^ addr)
}

fn words(c: &Chunk) -> impl Iterator<Item = u64> {
    let (base, end) = (c.base, c.base.saturating_add(c.len & !7));
    (base..end).step_by(8)
}

pub fn fill(mem: &impl Memory, c: &Chunk) {
    for addr in words(c) {
        mem.write64(addr, pattern(c.seed, addr));
    }
}

/// Checks `c`, stopping at the first bad word.
pub fn verify(mem: &impl Memory, c: &Chunk) -> Result<(), Mismatch> {
    for addr in words(c) {
        let expected = pattern(c.seed, addr);
        let found = mem.read64(addr);
        if found != expected {
            return Err(Mismatch {
                addr,
                expected,
                found,
            });
        }
    }
    Ok(())
}

/// One chunk per core, carved from the start of the core's own node's
/// DRAM. The master's chunks start at 4 GiB, clear of the firmware. A core
/// whose node has no room left gets an empty chunk.
pub fn plan(
    map: &MemoryMap,
    cores: &[Core],
    bytes_per_core: u64,
    seed: u64,
) -> Vec<Chunk, MAX_CORES> {
    let mut used: Vec<u64, MAX_NODES> = map.dram.iter().map(|_| 0).collect();
    let mut out = Vec::new();
    for core in cores {
        let i = usize::from(core.node);
        let (start, end) = map.dram.get(i).map_or((0, 0), |n| {
            let start = if i == 0 { n.base.max(1 << 32) } else { n.base };
            (start, n.end)
        });
        let base = start.saturating_add(used.get(i).copied().unwrap_or(0));
        let len = if base < end {
            bytes_per_core.min(end - base)
        } else {
            0
        };
        if let Some(u) = used.get_mut(i) {
            *u += len;
        }
        // Cannot overflow: there is one chunk per core.
        let _ = out.push(Chunk { base, len, seed });
    }
    out
}

/// Which chunk core `i` verifies: the chunk as many places along as the
/// first node has cores, which lands on another node whenever there is
/// one.
pub fn verifier_chunk(chunks: &[Chunk], cores: &[Core], i: usize) -> Option<Chunk> {
    let shift = cores.iter().filter(|c| c.node == 0).count();
    let n = chunks.len();
    if n == 0 {
        return None;
    }
    chunks.get((i + shift) % n).copied()
}
