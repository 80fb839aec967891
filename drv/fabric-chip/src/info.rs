// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The node info block: a small mailbox in each fabric chip through which a
//! node publishes what it found during probe, and through which the master
//! and its slaves hand the node over.

use drv_fabric_api::MAX_SOCKETS;
use num_derive::FromPrimitive;
use static_assertions::const_assert_eq;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::regs::INFO_WORDS;

/// Marks a block written by this firmware, as opposed to reset contents.
pub const INFO_MAGIC: u32 = 0x4e49_4e46;

#[derive(Copy, Clone, Debug, PartialEq, Eq, FromPrimitive)]
#[repr(u32)]
pub enum InfoState {
    Empty = 0,
    /// The owning node has filled in its resources.
    Probed = 1,
    /// The owning node is parked, waiting for its master.
    Waiting = 2,
    /// A master has taken the node over.
    Claimed = 3,
}

/// Contents of the info block, one field per 32-bit register.
#[derive(
    Copy,
    Clone,
    Debug,
    Default,
    PartialEq,
    Eq,
    FromBytes,
    IntoBytes,
    Immutable,
    KnownLayout,
)]
#[repr(C)]
pub struct NodeInfo {
    pub magic: u32,
    /// An [`InfoState`].
    pub state: u32,
    pub sci: u32,
    pub sockets: u32,
    /// Cores across all sockets.
    pub cores: u32,
    /// APIC ids the node needs, from zero to one past its highest id.
    pub apic_span: u32,
    /// DRAM per socket, in MiB.
    pub dram_mib: [u32; MAX_SOCKETS],
    /// Coordinate of the master that claimed the node.
    pub master: u32,
    pub reserved: u32,
}

const_assert_eq!(core::mem::size_of::<NodeInfo>(), INFO_WORDS * 4);

impl NodeInfo {
    pub fn state(&self) -> Option<InfoState> {
        if self.magic != INFO_MAGIC {
            return None;
        }
        num_traits::FromPrimitive::from_u32(self.state)
    }

    pub fn set_state(&mut self, state: InfoState) {
        self.magic = INFO_MAGIC;
        self.state = state as u32;
    }

    /// DRAM of socket `s`, in bytes.
    pub fn dram(&self, s: usize) -> u64 {
        self.dram_mib.get(s).map_or(0, |&m| u64::from(m) << 20)
    }

    pub fn to_words(self) -> [u32; INFO_WORDS] {
        zerocopy::transmute!(self)
    }

    pub fn from_words(words: [u32; INFO_WORDS]) -> Self {
        zerocopy::transmute!(words)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn words_follow_field_order() {
        let mut info = NodeInfo {
            sci: 0x012,
            sockets: 2,
            cores: 48,
            apic_span: 64,
            ..Default::default()
        };
        info.dram_mib[1] = 0x8000;
        info.set_state(InfoState::Waiting);

        let w = info.to_words();
        assert_eq!(w[0], INFO_MAGIC);
        assert_eq!(w[1], 2);
        assert_eq!(w[2], 0x012);
        assert_eq!(w[7], 0x8000);
        assert_eq!(NodeInfo::from_words(w), info);
        assert_eq!(info.dram(1), 32 << 30);
        assert_eq!(info.dram(9), 0);
    }

    #[test]
    fn state_needs_magic() {
        let mut info = NodeInfo {
            state: InfoState::Claimed as u32,
            ..Default::default()
        };
        assert_eq!(info.state(), None);
        info.magic = INFO_MAGIC;
        assert_eq!(info.state(), Some(InfoState::Claimed));
        info.state = 17;
        assert_eq!(info.state(), None);
    }
}
