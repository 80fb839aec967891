// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Contracts between the fabric bring-up core and the machine it runs on.
//!
//! Nothing in this crate touches hardware. Register access, broadcast
//! messaging, time and CPU-local primitives are all expressed as traits that
//! the boot environment implements (and that tests fake). The identifier
//! types shared by every other fabric crate live here as well.

#![cfg_attr(not(test), no_std)]

use core::fmt;
use num_derive::FromPrimitive;
use serde::{Deserialize, Serialize};

mod wait;
pub use wait::{poll_until, Deadline};

/// Largest fabric we will bring up.
pub const MAX_NODES: usize = 32;

/// Ports per fabric chip: the local port plus six link ports.
pub const MAX_PORTS: usize = 7;

/// Sockets behind a single fabric chip.
pub const MAX_SOCKETS: usize = 8;

pub const MAX_PARTITIONS: usize = 8;

/// Position of a node in the configured node list. Every node derives the same
/// ordering from the same configuration, so indices are fabric-wide.
pub type NodeIndex = u8;

/// A 12-bit fabric coordinate: `z` in bits 11:8, `y` in 7:4, `x` in 3:0.
#[derive(
    Copy,
    Clone,
    Debug,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
)]
#[serde(try_from = "u16", into = "u16")]
pub struct SciId(u16);

impl SciId {
    pub const MAX: u16 = 0xfff;

    pub const fn new(raw: u16) -> Option<Self> {
        if raw <= Self::MAX {
            Some(Self(raw))
        } else {
            None
        }
    }

    pub const fn from_coords(x: u8, y: u8, z: u8) -> Option<Self> {
        if x > 0xf || y > 0xf || z > 0xf {
            return None;
        }
        Some(Self(((z as u16) << 8) | ((y as u16) << 4) | x as u16))
    }

    pub const fn raw(self) -> u16 {
        self.0
    }

    pub const fn x(self) -> u8 {
        (self.0 & 0xf) as u8
    }

    pub const fn y(self) -> u8 {
        ((self.0 >> 4) & 0xf) as u8
    }

    pub const fn z(self) -> u8 {
        ((self.0 >> 8) & 0xf) as u8
    }

    pub const fn coord(self, dim: Dimension) -> u8 {
        match dim {
            Dimension::X => self.x(),
            Dimension::Y => self.y(),
            Dimension::Z => self.z(),
        }
    }

    /// Returns this coordinate with one dimension replaced. `v` is masked to
    /// four bits.
    pub const fn with_coord(self, dim: Dimension, v: u8) -> Self {
        let shift = dim.shift();
        let cleared = self.0 & !(0xf << shift);
        Self(cleared | (((v & 0xf) as u16) << shift))
    }
}

impl TryFrom<u16> for SciId {
    type Error = InvalidSciId;

    fn try_from(raw: u16) -> Result<Self, Self::Error> {
        Self::new(raw).ok_or(InvalidSciId(raw))
    }
}

impl From<SciId> for u16 {
    fn from(sci: SciId) -> u16 {
        sci.0
    }
}

impl fmt::Display for SciId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:03x}", self.0)
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct InvalidSciId(pub u16);

impl fmt::Display for InvalidSciId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fabric id {:#x} does not fit in 12 bits", self.0)
    }
}

/// Station address of a node on the broadcast transport.
#[derive(
    Copy,
    Clone,
    Debug,
    Default,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
)]
pub struct MacAddr(pub [u8; 6]);

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let m = &self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            m[0], m[1], m[2], m[3], m[4], m[5]
        )
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Dimension {
    X,
    Y,
    Z,
}

impl Dimension {
    const fn shift(self) -> u16 {
        match self {
            Dimension::X => 0,
            Dimension::Y => 4,
            Dimension::Z => 8,
        }
    }
}

/// A fabric chip port. `A` ports lead towards the next coordinate along their
/// dimension, `B` ports towards the previous one.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, FromPrimitive)]
#[repr(u8)]
pub enum Port {
    Local = 0,
    XA = 1,
    XB = 2,
    YA = 3,
    YB = 4,
    ZA = 5,
    ZB = 6,
}

impl Port {
    /// Link ports in the order every search expands them.
    pub const LINKS: [Port; 6] =
        [Port::XA, Port::XB, Port::YA, Port::YB, Port::ZA, Port::ZB];

    pub fn from_index(i: usize) -> Option<Self> {
        num_traits::FromPrimitive::from_usize(i)
    }

    pub const fn index(self) -> usize {
        self as usize
    }

    pub const fn dimension(self) -> Option<Dimension> {
        match self {
            Port::Local => None,
            Port::XA | Port::XB => Some(Dimension::X),
            Port::YA | Port::YB => Some(Dimension::Y),
            Port::ZA | Port::ZB => Some(Dimension::Z),
        }
    }

    /// The port a neighbour uses to reach us back over the same cable.
    pub const fn opposite(self) -> Port {
        match self {
            Port::Local => Port::Local,
            Port::XA => Port::XB,
            Port::XB => Port::XA,
            Port::YA => Port::YB,
            Port::YB => Port::YA,
            Port::ZA => Port::ZB,
            Port::ZB => Port::ZA,
        }
    }

    pub const fn is_forward(self) -> bool {
        matches!(self, Port::XA | Port::YA | Port::ZA)
    }

    /// Bit for this port in a wiring mask (bit 0 is `XA`). The local port has
    /// no bit.
    pub const fn mask_bit(self) -> u8 {
        match self {
            Port::Local => 0,
            p => 1 << (p as u8 - 1),
        }
    }
}

/// Extent of the fabric along each dimension.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FabricSize {
    pub x: u8,
    #[serde(default = "one")]
    pub y: u8,
    #[serde(default = "one")]
    pub z: u8,
}

fn one() -> u8 {
    1
}

impl FabricSize {
    pub const fn len(self, dim: Dimension) -> u8 {
        match dim {
            Dimension::X => self.x,
            Dimension::Y => self.y,
            Dimension::Z => self.z,
        }
    }

    pub const fn contains(self, sci: SciId) -> bool {
        sci.x() < self.x && sci.y() < self.y && sci.z() < self.z
    }

    /// The coordinate cabled to `port` of `sci` in a ring or torus of this
    /// size. Returns `None` for the local port or for a dimension of extent
    /// one.
    pub fn neighbor(self, sci: SciId, port: Port) -> Option<SciId> {
        let dim = port.dimension()?;
        let len = self.len(dim);
        if len < 2 {
            return None;
        }
        let c = sci.coord(dim);
        let next = if port.is_forward() {
            (c + 1) % len
        } else {
            (c + len - 1) % len
        };
        Some(sci.with_coord(dim, next))
    }
}

/// Register access by fabric coordinate and register offset.
///
/// A read that times out in hardware returns all-ones; callers treat that as
/// an unreachable node (see `drv-fabric-chip`). 8- and 16-bit accessors
/// default to operating on the containing 32-bit register.
pub trait Csr {
    fn read32(&self, sci: SciId, reg: u32) -> u32;
    fn write32(&self, sci: SciId, reg: u32, val: u32);
    fn read64(&self, sci: SciId, reg: u32) -> u64;
    fn write64(&self, sci: SciId, reg: u32, val: u64);

    fn read8(&self, sci: SciId, reg: u32) -> u8 {
        let shift = (reg & 3) * 8;
        (self.read32(sci, reg & !3) >> shift) as u8
    }

    fn read16(&self, sci: SciId, reg: u32) -> u16 {
        let shift = (reg & 2) * 8;
        (self.read32(sci, reg & !3) >> shift) as u16
    }

    fn write8(&self, sci: SciId, reg: u32, val: u8) {
        let shift = (reg & 3) * 8;
        let old = self.read32(sci, reg & !3) & !(0xff << shift);
        self.write32(sci, reg & !3, old | (u32::from(val) << shift));
    }

    fn write16(&self, sci: SciId, reg: u32, val: u16) {
        let shift = (reg & 2) * 8;
        let old = self.read32(sci, reg & !3) & !(0xffff << shift);
        self.write32(sci, reg & !3, old | (u32::from(val) << shift));
    }
}

/// CPU-local primitives of the bootstrap processor.
pub trait Cpu {
    fn rdmsr(&self, msr: u32) -> u64;
    fn wrmsr(&self, msr: u32, val: u64);
    fn inb(&self, port: u16) -> u8;
    fn outb(&self, port: u16, val: u8);
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Destination {
    Broadcast,
    Unicast(MacAddr),
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TransportError {
    /// The interface has no room for the frame right now.
    Busy,
    /// The frame exceeds what the interface can carry.
    TooLong,
}

/// Connectionless, best-effort datagram transport. Neither call blocks.
pub trait Transport {
    fn send(
        &mut self,
        buf: &[u8],
        dest: Destination,
    ) -> Result<(), TransportError>;

    /// Copies the next pending datagram into `buf`, returning its length and
    /// sender, or `None` if nothing is waiting.
    fn recv(&mut self, buf: &mut [u8]) -> Option<(usize, MacAddr)>;
}

/// Monotonic time in milliseconds.
pub trait Clock {
    fn now(&self) -> u64;
    fn delay(&self, ms: u64);
}

impl<T: Csr + ?Sized> Csr for &T {
    fn read32(&self, sci: SciId, reg: u32) -> u32 {
        (**self).read32(sci, reg)
    }
    fn write32(&self, sci: SciId, reg: u32, val: u32) {
        (**self).write32(sci, reg, val)
    }
    fn read64(&self, sci: SciId, reg: u32) -> u64 {
        (**self).read64(sci, reg)
    }
    fn write64(&self, sci: SciId, reg: u32, val: u64) {
        (**self).write64(sci, reg, val)
    }
}

impl<T: Cpu + ?Sized> Cpu for &T {
    fn rdmsr(&self, msr: u32) -> u64 {
        (**self).rdmsr(msr)
    }
    fn wrmsr(&self, msr: u32, val: u64) {
        (**self).wrmsr(msr, val)
    }
    fn inb(&self, port: u16) -> u8 {
        (**self).inb(port)
    }
    fn outb(&self, port: u16, val: u8) {
        (**self).outb(port, val)
    }
}

impl<T: Clock + ?Sized> Clock for &T {
    fn now(&self) -> u64 {
        (**self).now()
    }
    fn delay(&self, ms: u64) {
        (**self).delay(ms)
    }
}

impl<T: Transport + ?Sized> Transport for &mut T {
    fn send(
        &mut self,
        buf: &[u8],
        dest: Destination,
    ) -> Result<(), TransportError> {
        (**self).send(buf, dest)
    }
    fn recv(&mut self, buf: &mut [u8]) -> Option<(usize, MacAddr)> {
        (**self).recv(buf)
    }
}
