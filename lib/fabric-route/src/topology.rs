// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Static cabling between fabric chips.

use drv_fabric_api::{FabricSize, NodeIndex, Port, SciId, MAX_NODES, MAX_PORTS};

use crate::RouteError;

/// Which node, if any, sits at the far end of each port of each node.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Topology {
    len: usize,
    links: [[Option<NodeIndex>; MAX_PORTS]; MAX_NODES],
}

impl Topology {
    /// A fabric of `len` nodes with nothing cabled.
    pub fn new(len: usize) -> Result<Self, RouteError> {
        if len == 0 || len > MAX_NODES {
            return Err(RouteError::BadNodeCount(len));
        }
        Ok(Self {
            len,
            links: [[None; MAX_PORTS]; MAX_NODES],
        })
    }

    /// Builds the topology of a ring or torus of `size` from each node's
    /// coordinate and wiring mask (bit 0 is `XA`, see [`Port::mask_bit`]).
    ///
    /// A port is linked only when the torus neighbour along it is one of the
    /// given nodes and that neighbour has the opposite port wired too.
    pub fn from_wiring(
        size: FabricSize,
        nodes: &[(SciId, u8)],
    ) -> Result<Self, RouteError> {
        let mut topo = Self::new(nodes.len())?;
        for (a, &(sci, mask)) in nodes.iter().enumerate() {
            for port in Port::LINKS {
                if mask & port.mask_bit() == 0 {
                    continue;
                }
                let Some(peer) = size.neighbor(sci, port) else {
                    continue;
                };
                let Some(b) = nodes.iter().position(|&(s, _)| s == peer) else {
                    continue;
                };
                if nodes[b].1 & port.opposite().mask_bit() != 0 {
                    topo.links[a][port.index()] = Some(a_index(b));
                }
            }
        }
        Ok(topo)
    }

    /// Cables `port` of node `a` to the opposite port of node `b`.
    pub fn connect(
        &mut self,
        a: NodeIndex,
        port: Port,
        b: NodeIndex,
    ) -> Result<(), RouteError> {
        self.check(a)?;
        self.check(b)?;
        if port == Port::Local || a == b {
            return Err(RouteError::BadLink(a, port));
        }
        self.links[usize::from(a)][port.index()] = Some(b);
        self.links[usize::from(b)][port.opposite().index()] = Some(a);
        Ok(())
    }

    /// Removes the cable on `port` of `a`, both directions.
    pub fn disconnect(&mut self, a: NodeIndex, port: Port) {
        if let Some(b) = self.neighbor(a, port) {
            self.links[usize::from(b)][port.opposite().index()] = None;
            self.links[usize::from(a)][port.index()] = None;
        }
    }

    pub fn neighbor(&self, node: NodeIndex, port: Port) -> Option<NodeIndex> {
        self.links.get(usize::from(node))?[port.index()]
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn nodes(&self) -> impl Iterator<Item = NodeIndex> {
        (0..self.len).map(a_index)
    }

    /// Link ports of `node` that are cabled.
    pub fn wired_ports(
        &self,
        node: NodeIndex,
    ) -> impl Iterator<Item = Port> + '_ {
        Port::LINKS
            .into_iter()
            .filter(move |&p| self.neighbor(node, p).is_some())
    }

    fn check(&self, node: NodeIndex) -> Result<(), RouteError> {
        if usize::from(node) < self.len {
            Ok(())
        } else {
            Err(RouteError::BadNode(node))
        }
    }
}

// `len` is bounded by `MAX_NODES`, which fits a `NodeIndex`.
pub(crate) fn a_index(i: usize) -> NodeIndex {
    i as NodeIndex
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sci(raw: u16) -> SciId {
        SciId::new(raw).unwrap()
    }

    const X: u8 = 0b11;

    #[test]
    fn ring_from_wiring() {
        let size = FabricSize { x: 4, y: 1, z: 1 };
        let nodes = [(sci(0), X), (sci(1), X), (sci(2), X), (sci(3), X)];
        let t = Topology::from_wiring(size, &nodes).unwrap();
        assert_eq!(t.neighbor(0, Port::XA), Some(1));
        assert_eq!(t.neighbor(0, Port::XB), Some(3));
        assert_eq!(t.neighbor(3, Port::XA), Some(0));
        assert_eq!(t.neighbor(0, Port::YA), None);
        assert_eq!(t.wired_ports(2).collect::<Vec<_>>(), [Port::XA, Port::XB]);
    }

    #[test]
    fn one_sided_wiring_is_no_link() {
        let size = FabricSize { x: 3, y: 1, z: 1 };
        // Node 1 has only XA cabled, so the 0 -> 1 cable is missing.
        let nodes = [(sci(0), X), (sci(1), Port::XA.mask_bit()), (sci(2), X)];
        let t = Topology::from_wiring(size, &nodes).unwrap();
        assert_eq!(t.neighbor(0, Port::XA), None);
        assert_eq!(t.neighbor(1, Port::XB), None);
        assert_eq!(t.neighbor(1, Port::XA), Some(2));
    }

    #[test]
    fn absent_neighbors_are_skipped() {
        let size = FabricSize { x: 4, y: 1, z: 1 };
        let nodes = [(sci(0), X), (sci(1), X)];
        let t = Topology::from_wiring(size, &nodes).unwrap();
        assert_eq!(t.neighbor(0, Port::XA), Some(1));
        assert_eq!(t.neighbor(0, Port::XB), None);
    }

    #[test]
    fn connect_and_disconnect() {
        let mut t = Topology::new(2).unwrap();
        t.connect(0, Port::ZA, 1).unwrap();
        assert_eq!(t.neighbor(1, Port::ZB), Some(0));
        t.disconnect(1, Port::ZB);
        assert_eq!(t.neighbor(0, Port::ZA), None);
        assert_eq!(t.connect(0, Port::XA, 2), Err(RouteError::BadNode(2)));
        assert_eq!(
            t.connect(0, Port::Local, 1),
            Err(RouteError::BadLink(0, Port::Local))
        );
        assert_eq!(Topology::new(0), Err(RouteError::BadNodeCount(0)));
    }
}
