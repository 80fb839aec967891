// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Fabric route planning.
//!
//! For every ordered pair of nodes, in nested index order, we run an
//! exhaustive depth-first search over the cabled ports for the cheapest path,
//! where cost is `hops * hop_cost + usage` and usage is the number of routes
//! already committed to each link we cross. The winning path is committed
//! immediately: its links' usage goes up, its channel dependencies are
//! recorded, and its forwarding entries are written. Later pairs therefore
//! see the choices of earlier ones, and the result depends on the pair order.
//!
//! Two constraints keep the committed routes usable by hardware:
//!
//! - A channel is one direction of one link, named by the egress `(node,
//!   port)`. A route that leaves channel `a` for channel `b` makes `b` a
//!   dependency of `a`. A search may not take a step `a -> b` if some earlier
//!   route already stepped `b -> a`, so no two routes can wait on each other.
//!
//! - Forwarding tables are indexed by `[node][ingress port][destination]`.
//!   Once an entry is written, any later search that reaches the same node
//!   through the same port headed for the same destination has to follow it,
//!   so that each table yields exactly one path for every pair.

#![cfg_attr(not(test), no_std)]

use drv_fabric_api::{NodeIndex, Port, MAX_NODES, MAX_PORTS};
use heapless::Vec;

mod deps;
mod topology;

pub use deps::{Channel, DepTable};
pub use topology::Topology;

use topology::a_index;

/// Weight of one hop relative to one unit of link usage.
pub const HOP_COST: u32 = 5;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RouteError {
    /// There is no admissible path from the first node to the second.
    NoRoute { src: NodeIndex, dst: NodeIndex },
    BadNodeCount(usize),
    BadNode(NodeIndex),
    BadLink(NodeIndex, Port),
    /// Replaying the tables from the first node towards the second did not
    /// arrive (missing entry, dead port or loop).
    BrokenTable { src: NodeIndex, dst: NodeIndex },
}

/// Search bounds. `max_hops` and `max_usage` are strict caps on any
/// candidate path.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct PlannerParams {
    pub hop_cost: u32,
    pub max_hops: u8,
    pub max_usage: u32,
}

impl PlannerParams {
    pub fn for_nodes(len: usize) -> Self {
        Self {
            hop_cost: HOP_COST,
            max_hops: a_index(len.min(MAX_NODES - 1) + 1),
            max_usage: u32::MAX,
        }
    }
}

/// One step of a route: leave `node` through `port`.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Hop {
    pub node: NodeIndex,
    pub port: Port,
}

impl Hop {
    pub fn channel(self) -> Channel {
        Channel::new(self.node, self.port)
    }
}

pub type Path = Vec<Hop, MAX_NODES>;

type Table = [[[Option<Port>; MAX_NODES]; MAX_PORTS]; MAX_NODES];

/// Committed routes for a whole fabric.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RoutePlan {
    len: usize,
    table: Table,
    usage: [[u16; MAX_PORTS]; MAX_NODES],
    deps: DepTable,
}

/// Plans routes for every ordered pair of nodes in `topo`.
pub fn plan(
    topo: &Topology,
    params: &PlannerParams,
) -> Result<RoutePlan, RouteError> {
    let mut rp = RoutePlan {
        len: topo.len(),
        table: [[[None; MAX_NODES]; MAX_PORTS]; MAX_NODES],
        usage: [[0; MAX_PORTS]; MAX_NODES],
        deps: DepTable::new(),
    };

    for src in topo.nodes() {
        // Traffic for ourselves never leaves the chip.
        rp.table[usize::from(src)][Port::Local.index()][usize::from(src)] =
            Some(Port::Local);

        for dst in topo.nodes() {
            if src == dst {
                continue;
            }
            let path = rp.find(topo, params, src, dst)?;
            rp.commit(topo, dst, &path);
        }
    }
    Ok(rp)
}

struct Best {
    hops: u32,
    usage: u32,
    cost: u32,
    path: Path,
}

struct Search<'a> {
    topo: &'a Topology,
    rp: &'a RoutePlan,
    params: &'a PlannerParams,
    dst: NodeIndex,
    path: Path,
    on_path: u32,
    best: Option<Best>,
}

impl Search<'_> {
    fn step(&mut self, cur: NodeIndex, ingress: Port, hops: u32, usage: u32) {
        if cur == self.dst {
            let cost = hops
                .saturating_mul(self.params.hop_cost)
                .saturating_add(usage);
            if self.best.as_ref().map_or(true, |b| cost < b.cost) {
                self.best = Some(Best {
                    hops,
                    usage,
                    cost,
                    path: self.path.clone(),
                });
            }
            return;
        }
        if hops >= u32::from(self.params.max_hops) {
            return;
        }

        let forced = self.rp.next_hop(cur, ingress, self.dst);
        let prev = self.path.last().map(|h| h.channel());

        for port in Port::LINKS {
            if forced.is_some_and(|f| f != port) {
                continue;
            }
            let Some(next) = self.topo.neighbor(cur, port) else {
                continue;
            };
            if self.on_path & (1 << next) != 0 {
                continue;
            }
            let chan = Channel::new(cur, port);
            if prev.is_some_and(|p| self.rp.deps.depends(chan, p)) {
                continue;
            }

            let nhops = hops + 1;
            let nusage =
                usage.saturating_add(u32::from(self.rp.usage_of(chan)));
            if nusage > self.params.max_usage {
                continue;
            }
            if let Some(b) = &self.best {
                if nhops > b.hops || nusage > b.usage {
                    continue;
                }
            }

            if self.path.push(Hop { node: cur, port }).is_err() {
                continue;
            }
            self.on_path |= 1 << next;
            self.step(next, port.opposite(), nhops, nusage);
            self.on_path &= !(1 << next);
            self.path.pop();
        }
    }
}

impl RoutePlan {
    fn find(
        &self,
        topo: &Topology,
        params: &PlannerParams,
        src: NodeIndex,
        dst: NodeIndex,
    ) -> Result<Path, RouteError> {
        let mut search = Search {
            topo,
            rp: self,
            params,
            dst,
            path: Vec::new(),
            on_path: 1 << src,
            best: None,
        };
        search.step(src, Port::Local, 0, 0);
        search
            .best
            .map(|b| b.path)
            .ok_or(RouteError::NoRoute { src, dst })
    }

    fn commit(&mut self, topo: &Topology, dst: NodeIndex, path: &Path) {
        let mut ingress = Port::Local;
        let mut prev: Option<Channel> = None;
        let mut arrive = None;
        for hop in path {
            let chan = hop.channel();
            self.table[usize::from(hop.node)][ingress.index()]
                [usize::from(dst)] = Some(hop.port);
            let u = &mut self.usage[usize::from(hop.node)][hop.port.index()];
            *u = u.saturating_add(1);
            if let Some(p) = prev {
                self.deps.record(p, chan);
            }
            prev = Some(chan);
            ingress = hop.port.opposite();
            arrive = topo.neighbor(hop.node, hop.port);
        }
        if let Some(last) = arrive {
            self.table[usize::from(last)][ingress.index()][usize::from(dst)] =
                Some(Port::Local);
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Where `node` sends traffic for `dst` that arrived on `ingress`.
    pub fn next_hop(
        &self,
        node: NodeIndex,
        ingress: Port,
        dst: NodeIndex,
    ) -> Option<Port> {
        *self
            .table
            .get(usize::from(node))?
            .get(ingress.index())?
            .get(usize::from(dst))?
    }

    /// Committed entries of `node` as `(ingress, dst, egress)`, in table
    /// order.
    pub fn entries(
        &self,
        node: NodeIndex,
    ) -> impl Iterator<Item = (Port, NodeIndex, Port)> + '_ {
        let row = self.table.get(usize::from(node));
        (0..MAX_PORTS).flat_map(move |i| {
            (0..self.len).filter_map(move |d| {
                let egress = (*row?)[i][d]?;
                Some((Port::from_index(i)?, a_index(d), egress))
            })
        })
    }

    /// Routes committed through channel `(node, port)`.
    pub fn usage(&self, node: NodeIndex, port: Port) -> u16 {
        self.usage_of(Channel::new(node, port))
    }

    fn usage_of(&self, c: Channel) -> u16 {
        self.usage[usize::from(c.node())][c.port().index()]
    }

    /// Whether some route steps from channel `from` to channel `to`.
    pub fn depends(&self, from: Channel, to: Channel) -> bool {
        self.deps.depends(from, to)
    }

    pub fn deps(&self) -> &DepTable {
        &self.deps
    }

    /// Replays the forwarding tables from `src` to `dst`.
    pub fn walk(
        &self,
        topo: &Topology,
        src: NodeIndex,
        dst: NodeIndex,
    ) -> Result<Path, RouteError> {
        let broken = RouteError::BrokenTable { src, dst };
        let mut path = Path::new();
        let mut cur = src;
        let mut ingress = Port::Local;
        loop {
            let port = self.next_hop(cur, ingress, dst).ok_or(broken)?;
            if port == Port::Local {
                return if cur == dst { Ok(path) } else { Err(broken) };
            }
            path.push(Hop { node: cur, port }).map_err(|_| broken)?;
            cur = topo.neighbor(cur, port).ok_or(broken)?;
            ingress = port.opposite();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ring(n: u8) -> Topology {
        let mut t = Topology::new(usize::from(n)).unwrap();
        for i in 0..n {
            t.connect(i, Port::XA, (i + 1) % n).unwrap();
        }
        t
    }

    fn ports(p: &Path) -> std::vec::Vec<(NodeIndex, Port)> {
        p.iter().map(|h| (h.node, h.port)).collect()
    }

    #[test]
    fn self_route_is_empty() {
        let t = ring(3);
        let rp = plan(&t, &PlannerParams::for_nodes(3)).unwrap();
        for n in t.nodes() {
            assert!(rp.walk(&t, n, n).unwrap().is_empty());
        }
    }

    #[test]
    fn four_ring_routes() {
        let t = ring(4);
        let rp = plan(&t, &PlannerParams::for_nodes(4)).unwrap();

        // Neighbours are one hop in either direction.
        assert_eq!(ports(&rp.walk(&t, 0, 1).unwrap()), [(0, Port::XA)]);
        assert_eq!(ports(&rp.walk(&t, 0, 3).unwrap()), [(0, Port::XB)]);

        // 0 -> 2 is two hops either way, but 0:XA already carries 0 -> 1.
        assert_eq!(
            ports(&rp.walk(&t, 0, 2).unwrap()),
            [(0, Port::XB), (3, Port::XB)]
        );

        // 1 -> 3 would cross 0:XB a third time going backwards.
        assert_eq!(
            ports(&rp.walk(&t, 1, 3).unwrap()),
            [(1, Port::XA), (2, Port::XA)]
        );
        assert_eq!(rp.usage(0, Port::XB), 2);
        assert!(rp.depends(
            Channel::new(0, Port::XB),
            Channel::new(3, Port::XB)
        ));
    }

    #[test]
    fn usage_counts_every_hop() {
        let t = ring(5);
        let rp = plan(&t, &PlannerParams::for_nodes(5)).unwrap();
        let mut hops = 0;
        for s in t.nodes() {
            for d in t.nodes() {
                hops += rp.walk(&t, s, d).unwrap().len();
            }
        }
        let used: usize = t
            .nodes()
            .flat_map(|n| Port::LINKS.map(|p| usize::from(rp.usage(n, p))))
            .sum();
        assert_eq!(used, hops);
    }

    #[test]
    fn disconnected_is_fatal() {
        let mut t = Topology::new(3).unwrap();
        t.connect(0, Port::XA, 1).unwrap();
        assert_eq!(
            plan(&t, &PlannerParams::for_nodes(3)),
            Err(RouteError::NoRoute { src: 0, dst: 2 })
        );
    }

    #[test]
    fn hop_cap_can_make_routes_impossible() {
        let t = ring(6);
        let mut params = PlannerParams::for_nodes(6);
        params.max_hops = 2;
        assert_eq!(
            plan(&t, &params),
            Err(RouteError::NoRoute { src: 0, dst: 3 })
        );
    }

    #[test]
    fn usage_cap_is_a_strict_bound() {
        // Twelve pairs need sixteen hops between them, but a four-ring only
        // has eight channels.
        let t = ring(4);
        let mut params = PlannerParams::for_nodes(4);
        params.max_usage = 0;
        assert!(matches!(
            plan(&t, &params),
            Err(RouteError::NoRoute { .. })
        ));
    }

    #[test]
    fn entries_end_in_local_delivery() {
        let t = ring(3);
        let rp = plan(&t, &PlannerParams::for_nodes(3)).unwrap();
        for n in t.nodes() {
            assert_eq!(rp.next_hop(n, Port::Local, n), Some(Port::Local));
            assert!(rp
                .entries(n)
                .filter(|&(_, _, e)| e == Port::Local)
                .all(|(_, d, _)| d == n));
        }
    }
}
