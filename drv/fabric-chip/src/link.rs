// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The two generations of link controller.
//!
//! Both keep one route table per ingress port, indexed by destination
//! coordinate. They differ in their status register layout and in how the
//! route tables are reached.

use drv_fabric_api::{Csr, Port, SciId};

use crate::regs::{self, Lc4Status, Lc5Status, LinkControl, RouteEntry, RouteIndex};
use crate::{read32, ChipError};

/// Link state in a generation-independent form.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct LinkStatus {
    pub up: bool,
    pub crc_error: bool,
    /// Only reported by second-generation controllers.
    pub degraded: bool,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum LinkController {
    Lc4,
    Lc5,
}

impl LinkController {
    /// Picks the controller generation from the chip's identity.
    pub fn from_ident(id: regs::Ident) -> Option<Self> {
        match id.lc_gen() {
            4 => Some(Self::Lc4),
            5 => Some(Self::Lc5),
            _ => None,
        }
    }

    pub fn status(
        self,
        csr: &impl Csr,
        sci: SciId,
        port: Port,
    ) -> Result<LinkStatus, ChipError> {
        let raw = read32(csr, sci, regs::lc(link_port(port)?, regs::LC_STATUS))?;
        Ok(match self {
            Self::Lc4 => {
                let s = Lc4Status(raw);
                LinkStatus {
                    up: s.up(),
                    crc_error: s.crc_error(),
                    degraded: false,
                }
            }
            Self::Lc5 => {
                let s = Lc5Status(raw);
                LinkStatus {
                    up: s.up(),
                    crc_error: s.crc_error(),
                    degraded: s.degraded(),
                }
            }
        })
    }

    pub fn is_up(
        self,
        csr: &impl Csr,
        sci: SciId,
        port: Port,
    ) -> Result<bool, ChipError> {
        Ok(self.status(csr, sci, port)?.up)
    }

    /// Starts (or restarts) training on `port`.
    pub fn enable(
        self,
        csr: &impl Csr,
        sci: SciId,
        port: Port,
    ) -> Result<(), ChipError> {
        let mut ctl = LinkControl(0);
        ctl.set_enable(true);
        if self == Self::Lc5 {
            // Second-generation controllers only train on an explicit
            // request.
            ctl.set_retrain(true);
        }
        csr.write32(sci, regs::lc(link_port(port)?, regs::LC_CONTROL), ctl.0);
        Ok(())
    }

    /// Takes `port` down and clears its error counters.
    pub fn clear(
        self,
        csr: &impl Csr,
        sci: SciId,
        port: Port,
    ) -> Result<(), ChipError> {
        let mut ctl = LinkControl(0);
        ctl.set_clear_errors(true);
        csr.write32(sci, regs::lc(link_port(port)?, regs::LC_CONTROL), ctl.0);
        Ok(())
    }

    pub fn errors(
        self,
        csr: &impl Csr,
        sci: SciId,
        port: Port,
    ) -> Result<u32, ChipError> {
        read32(csr, sci, regs::lc(link_port(port)?, regs::LC_ERRORS))
    }

    /// Writes `(ingress, dst, egress)` route entries.
    pub fn commit_routes(
        self,
        csr: &impl Csr,
        sci: SciId,
        routes: impl IntoIterator<Item = (Port, SciId, Port)>,
    ) -> Result<(), ChipError> {
        for (ingress, dst, egress) in routes {
            let mut e = RouteEntry(0);
            e.set_valid(true);
            e.set_egress(egress as u8);
            match self {
                Self::Lc4 => {
                    csr.write32(sci, lc4_index(), route_index(ingress, dst).0);
                    csr.write32(sci, lc4_data(), e.0);
                }
                Self::Lc5 => {
                    let reg = regs::lc5_route(ingress as u8, dst.raw());
                    csr.write32(sci, reg, e.0);
                }
            }
        }
        Ok(())
    }

    /// Reads back the route entry for traffic to `dst` arriving on
    /// `ingress`.
    pub fn route(
        self,
        csr: &impl Csr,
        sci: SciId,
        ingress: Port,
        dst: SciId,
    ) -> Result<Option<Port>, ChipError> {
        let raw = match self {
            Self::Lc4 => {
                csr.write32(sci, lc4_index(), route_index(ingress, dst).0);
                read32(csr, sci, lc4_data())?
            }
            Self::Lc5 => {
                read32(csr, sci, regs::lc5_route(ingress as u8, dst.raw()))?
            }
        };
        let e = RouteEntry(raw);
        if !e.valid() {
            return Ok(None);
        }
        Port::from_index(usize::from(e.egress()))
            .map(Some)
            .ok_or(ChipError::BadRegister { sci, reg: raw })
    }
}

fn link_port(port: Port) -> Result<u8, ChipError> {
    if port == Port::Local {
        Err(ChipError::NoController)
    } else {
        Ok(port as u8)
    }
}

fn lc4_index() -> u32 {
    regs::lc(Port::XA as u8, regs::LC4_ROUTE_INDEX)
}

fn lc4_data() -> u32 {
    regs::lc(Port::XA as u8, regs::LC4_ROUTE_DATA)
}

fn route_index(ingress: Port, dst: SciId) -> RouteIndex {
    let mut ix = RouteIndex(0);
    ix.set_ingress(ingress as u8);
    ix.set_dst(dst.raw());
    ix
}
