// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use drv_fabric_api::{NodeIndex, Port, MAX_NODES, MAX_PORTS};

const CHANNELS: usize = MAX_NODES * MAX_PORTS;
const WORDS: usize = CHANNELS.div_ceil(32);

/// One direction of one link, named by its egress `(node, port)`.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Channel(u16);

impl Channel {
    pub const fn new(node: NodeIndex, port: Port) -> Self {
        Self(node as u16 * MAX_PORTS as u16 + port as u16)
    }

    pub const fn node(self) -> NodeIndex {
        (self.0 / MAX_PORTS as u16) as NodeIndex
    }

    pub fn port(self) -> Port {
        // The remainder is always a valid port index.
        Port::from_index(usize::from(self.0) % MAX_PORTS).unwrap_or(Port::Local)
    }

    fn index(self) -> usize {
        usize::from(self.0)
    }
}

/// Bit matrix of channel-to-channel dependencies: `depends(a, b)` is set once
/// a committed route has stepped from `a` straight into `b`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DepTable {
    bits: [[u32; WORDS]; CHANNELS],
}

impl Default for DepTable {
    fn default() -> Self {
        Self::new()
    }
}

impl DepTable {
    pub const fn new() -> Self {
        Self {
            bits: [[0; WORDS]; CHANNELS],
        }
    }

    pub fn depends(&self, from: Channel, to: Channel) -> bool {
        let (w, b) = (to.index() / 32, to.index() % 32);
        self.bits[from.index()][w] & (1 << b) != 0
    }

    pub fn record(&mut self, from: Channel, to: Channel) {
        let (w, b) = (to.index() / 32, to.index() % 32);
        self.bits[from.index()][w] |= 1 << b;
    }

    /// Every recorded `(from, to)` pair.
    pub fn iter(&self) -> impl Iterator<Item = (Channel, Channel)> + '_ {
        self.bits.iter().enumerate().flat_map(|(f, row)| {
            (0..CHANNELS).filter_map(move |t| {
                (row[t / 32] & (1 << (t % 32)) != 0)
                    .then(|| (Channel(f as u16), Channel(t as u16)))
            })
        })
    }

    /// Whether two recorded dependencies point at each other.
    pub fn has_mutual(&self) -> bool {
        self.iter().any(|(a, b)| self.depends(b, a))
    }
}
