// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Fabric chip register map.
//!
//! Offsets are relative to the chip's configuration space, which every node
//! can reach by coordinate through [`drv_fabric_api::Csr`]. Multi-field
//! registers have a `bitfield!` codec below their offset.

#![allow(clippy::unusual_byte_groupings)]

use bitfield::bitfield;

/// Chip identity; see [`Ident`].
pub const IDENT: u32 = 0x0000;
/// The coordinate this chip answers to on the fabric.
pub const NODE_SCI: u32 = 0x0004;
/// See [`FabricReset`].
pub const FABRIC_RESET: u32 = 0x0008;
/// Added to every APIC id leaving this node.
pub const APIC_OFFSET: u32 = 0x000c;
/// See [`CheckCtrl`] and [`CheckStatus`].
pub const CHECK_CTRL: u32 = 0x0010;
pub const CHECK_STATUS: u32 = 0x0014;
/// Number of populated sockets behind the chip.
pub const NODE_SOCKETS: u32 = 0x0018;

/// Address-translation table access: write [`AttIndex`], then read or write
/// [`AttEntry`] through `ATT_DATA`.
pub const ATT_INDEX: u32 = 0x0020;
pub const ATT_DATA: u32 = 0x0024;

/// 64-bit: the slice of DRAM the chip itself claims for this node.
pub const LOCAL_DRAM_BASE: u32 = 0x0030;
pub const LOCAL_DRAM_LIMIT: u32 = 0x0038;

/// Start of the 16-word node info block (see [`crate::NodeInfo`]).
pub const INFO: u32 = 0x0100;
pub const INFO_WORDS: usize = 16;

/// Per-port link controller register blocks. Port 0 is the local port and
/// has no controller.
pub const LC_BASE: u32 = 0x2000;
pub const LC_STRIDE: u32 = 0x100;
pub const LC_STATUS: u32 = 0x00;
pub const LC_CONTROL: u32 = 0x04;
pub const LC_ERRORS: u32 = 0x08;
/// First-generation controllers reach their route table indirectly: write
/// [`RouteIndex`] to `LC4_ROUTE_INDEX`, then use `LC4_ROUTE_DATA`. The
/// registers live in the port-1 block and serve every ingress port.
pub const LC4_ROUTE_INDEX: u32 = 0x10;
pub const LC4_ROUTE_DATA: u32 = 0x14;

/// Second-generation controllers map their route tables directly: one
/// [`RouteEntry`] word per destination coordinate, one table per ingress
/// port.
pub const LC5_ROUTE_BASE: u32 = 0x10_0000;
pub const LC5_ROUTE_STRIDE: u32 = 0x4000;

/// Per-socket register blocks.
pub const SOCKET_BASE: u32 = 0x8_0000;
pub const SOCKET_STRIDE: u32 = 0x1000;
/// 64-bit, read-only: DRAM populated on this socket, in bytes.
pub const SOCKET_DRAM_SIZE: u32 = 0x00;
pub const SOCKET_CORES: u32 = 0x08;
/// Lowest APIC id of the socket's cores.
pub const SOCKET_APIC_BASE: u32 = 0x0c;
/// See [`ScrubCtrl`] and [`ScrubStatus`].
pub const SOCKET_SCRUB_CTRL: u32 = 0x10;
pub const SOCKET_SCRUB_STATUS: u32 = 0x14;
/// DRAM decode windows: pairs of 64-bit registers, the base and a
/// [`RangeCtl`].
pub const SOCKET_DRAM_RANGE: u32 = 0x40;
pub const SOCKET_DRAM_RANGES: usize = 12;
/// MMIO decode windows, laid out like the DRAM ones. The first three are
/// the 32-bit window, the rest the 64-bit one.
pub const SOCKET_MMIO_RANGE: u32 = 0x200;
pub const SOCKET_MMIO_RANGES: usize = 6;
pub const RANGE_STRIDE: u32 = 0x10;

/// Vendor code in [`Ident`].
pub const VENDOR: u32 = 0x1d5c;

/// Configuration space of every fabric chip as seen from the processors;
/// kept out of the platform memory map.
pub const CSR_WINDOW_BASE: u64 = 0x3fff_0000_0000;
pub const CSR_WINDOW_LEN: u64 = 1 << 32;

pub const fn lc(port: u8, reg: u32) -> u32 {
    LC_BASE + port as u32 * LC_STRIDE + reg
}

pub const fn lc5_route(ingress: u8, dst: u16) -> u32 {
    LC5_ROUTE_BASE + ingress as u32 * LC5_ROUTE_STRIDE + dst as u32 * 4
}

pub const fn socket(s: u8, reg: u32) -> u32 {
    SOCKET_BASE + s as u32 * SOCKET_STRIDE + reg
}

/// Base register of decode window `i` in the table starting at `table`; the
/// control register follows 8 bytes later.
pub const fn range(s: u8, table: u32, i: usize) -> u32 {
    socket(s, table) + i as u32 * RANGE_STRIDE
}

bitfield! {
    #[derive(Copy, Clone, PartialEq, Eq)]
    pub struct Ident(u32);
    impl Debug;
    pub vendor, _: 31, 16;
    pub revision, _: 15, 8;
    /// Link controller generation.
    pub lc_gen, _: 3, 0;
}

bitfield! {
    #[derive(Copy, Clone, PartialEq, Eq)]
    pub struct FabricReset(u32);
    impl Debug;
    pub assert, set_assert: 0;
    /// Also drop every route table entry.
    pub routes, set_routes: 1;
}

bitfield! {
    #[derive(Copy, Clone, PartialEq, Eq)]
    pub struct CheckCtrl(u32);
    impl Debug;
    pub start, set_start: 0;
}

bitfield! {
    #[derive(Copy, Clone, PartialEq, Eq)]
    pub struct CheckStatus(u32);
    impl Debug;
    pub done, set_done: 0;
    pub ok, set_ok: 1;
    pub u8, errors, set_errors: 15, 8;
}

bitfield! {
    /// First-generation link status.
    #[derive(Copy, Clone, PartialEq, Eq)]
    pub struct Lc4Status(u32);
    impl Debug;
    pub up, set_up: 0;
    pub crc_error, set_crc_error: 1;
}

bitfield! {
    /// Second-generation link status.
    #[derive(Copy, Clone, PartialEq, Eq)]
    pub struct Lc5Status(u32);
    impl Debug;
    pub u8, lanes, set_lanes: 3, 0;
    pub up, set_up: 4;
    pub degraded, set_degraded: 5;
    pub crc_error, set_crc_error: 8;
}

bitfield! {
    #[derive(Copy, Clone, PartialEq, Eq)]
    pub struct LinkControl(u32);
    impl Debug;
    pub enable, set_enable: 0;
    pub retrain, set_retrain: 1;
    pub clear_errors, set_clear_errors: 2;
}

bitfield! {
    #[derive(Copy, Clone, PartialEq, Eq)]
    pub struct RouteIndex(u32);
    impl Debug;
    pub u8, ingress, set_ingress: 18, 16;
    pub u16, dst, set_dst: 11, 0;
}

bitfield! {
    #[derive(Copy, Clone, PartialEq, Eq)]
    pub struct RouteEntry(u32);
    impl Debug;
    pub valid, set_valid: 31;
    pub u8, egress, set_egress: 2, 0;
}

bitfield! {
    #[derive(Copy, Clone, PartialEq, Eq)]
    pub struct AttIndex(u32);
    impl Debug;
    /// Select the MMIO32 table rather than the DRAM one.
    pub mmio, set_mmio: 31;
    pub u16, entry, set_entry: 11, 0;
}

bitfield! {
    #[derive(Copy, Clone, PartialEq, Eq)]
    pub struct AttEntry(u32);
    impl Debug;
    pub valid, set_valid: 31;
    pub u16, sci, set_sci: 11, 0;
}

bitfield! {
    /// Control half of a decode window. The limit is stored in 64 KiB
    /// units; the low 16 bits of the limit address are implicitly ones.
    #[derive(Copy, Clone, PartialEq, Eq)]
    pub struct RangeCtl(u64);
    impl Debug;
    pub enable, set_enable: 0;
    /// [`DEST_SOCKET`], [`DEST_LOCAL`] or [`DEST_FABRIC`].
    pub u8, dest, set_dest: 2, 1;
    pub u8, socket, set_socket: 6, 4;
    pub u64, limit_hi, set_limit_hi: 63, 16;
}

pub const DEST_SOCKET: u8 = 0;
pub const DEST_LOCAL: u8 = 1;
pub const DEST_FABRIC: u8 = 2;

/// Granularity of [`RangeCtl`] limits.
pub const RANGE_GRANULE: u64 = 1 << 16;

bitfield! {
    #[derive(Copy, Clone, PartialEq, Eq)]
    pub struct ScrubCtrl(u32);
    impl Debug;
    pub start, set_start: 0;
}

bitfield! {
    #[derive(Copy, Clone, PartialEq, Eq)]
    pub struct ScrubStatus(u32);
    impl Debug;
    pub done, set_done: 0;
    pub busy, set_busy: 1;
}
