// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Cluster configuration.
//!
//! The boot environment parses this from wherever it keeps it and hands it
//! over already deserialized. Every node must be given the same
//! configuration: node indices, the coordinator and the route plan are all
//! derived from it, and nodes never compare notes about it.

use drv_fabric_api::{
    FabricSize, MacAddr, NodeIndex, Port, SciId, MAX_NODES, MAX_PARTITIONS,
};
use fabric_addr::{Hole, DRAM_ATT_SHIFT, MMIO32_ATT_SHIFT};
use fabric_route::{PlannerParams, HOP_COST};
use fabric_sync::SyncParams;
use heapless::{String, Vec};
use serde::Deserialize;

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClusterConfig {
    pub size: FabricSize,
    pub nodes: Vec<NodeConfig, MAX_NODES>,
    pub partitions: Vec<PartitionConfig, MAX_PARTITIONS>,
    #[serde(default)]
    pub tunables: Tunables,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NodeConfig {
    pub sci: SciId,
    pub mac: MacAddr,
    pub partition: String<16>,
    /// Cabled ports, one bit per port (see [`Port::mask_bit`]).
    pub wiring: u8,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PartitionConfig {
    pub name: String<16>,
    pub master: SciId,
    /// Whether the partition's nodes become one machine. Nodes of a
    /// partition that is not unified each boot on their own once the fabric
    /// is up.
    #[serde(default = "yes")]
    pub unified: bool,
    /// What the next boot stage is asked to load.
    pub label: String<32>,
}

fn yes() -> bool {
    true
}

/// A span of physical memory kept from the next boot stage.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Reservation {
    pub base: u64,
    pub len: u64,
}

/// Knobs with sane defaults. Times are in milliseconds, sizes in bytes.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Tunables {
    pub hop_cost: u32,
    /// Cap on the routes any one link may carry; unbounded if absent.
    pub max_usage: Option<u32>,

    pub max_fabric_retries: u32,
    pub backoff_initial_ms: u64,
    pub backoff_max_ms: u64,
    pub warm_reset_broadcasts: u32,
    pub linger_ms: u64,
    /// How long the sync loop sleeps between looking at the transport.
    pub sync_poll_ms: u64,

    pub probe_timeout_ms: u64,
    pub train_timeout_ms: u64,
    pub train_poll_ms: u64,
    /// How long `LoadFabric` waits for each remote chip to answer.
    pub ident_timeout_ms: u64,
    pub check_timeout_ms: u64,
    /// How long a master waits for each slave to park.
    pub claim_timeout_ms: u64,

    /// DRAM per node is trimmed to at most this much.
    pub mem_limit: Option<u64>,
    pub hole_base: u64,
    pub hole_end: u64,
    pub mmio32_base: u64,
    pub mmio32_end: u64,
    pub mmio32_per_node: u64,
    /// Must be a power of two; 64-bit windows are aligned to it.
    pub mmio64_per_node: u64,
    /// First address the processors cannot reach.
    pub phys_limit: u64,
    pub apic_max: u32,

    pub core_wake_timeout_ms: u64,
    pub core_wake_retries: u32,
    pub core_task_timeout_ms: u64,

    pub stress: bool,
    pub stress_bytes_per_core: u64,
    pub stress_seed: u64,

    pub scrub: bool,
    pub scrub_timeout_ms: u64,

    /// Where the firmware leaves its trace buffer for the next stage.
    pub trace_buffer: Option<Reservation>,
    pub reserved: Vec<Reservation, 8>,
}

impl Default for Tunables {
    fn default() -> Self {
        let sync = SyncParams::default();
        Self {
            hop_cost: HOP_COST,
            max_usage: None,
            max_fabric_retries: sync.max_fabric_retries,
            backoff_initial_ms: sync.backoff_initial_ms,
            backoff_max_ms: sync.backoff_max_ms,
            warm_reset_broadcasts: sync.warm_reset_broadcasts,
            linger_ms: sync.linger_ms,
            sync_poll_ms: 1,
            probe_timeout_ms: 1000,
            train_timeout_ms: 500,
            train_poll_ms: 10,
            ident_timeout_ms: 100,
            check_timeout_ms: 1000,
            claim_timeout_ms: 5000,
            mem_limit: None,
            hole_base: Hole::DEFAULT.base,
            hole_end: Hole::DEFAULT.end,
            mmio32_base: 0xc000_0000,
            mmio32_end: 0xfec0_0000,
            mmio32_per_node: 16 << 20,
            mmio64_per_node: 1 << 36,
            phys_limit: 1 << 48,
            apic_max: 0xffff_ffff,
            core_wake_timeout_ms: 100,
            core_wake_retries: 3,
            core_task_timeout_ms: 10_000,
            stress: false,
            stress_bytes_per_core: 64 << 20,
            stress_seed: 0x5eed,
            scrub: true,
            scrub_timeout_ms: 60_000,
            trace_buffer: None,
            reserved: Vec::new(),
        }
    }
}

impl Tunables {
    pub fn sync_params(&self) -> SyncParams {
        SyncParams {
            max_fabric_retries: self.max_fabric_retries,
            backoff_initial_ms: self.backoff_initial_ms,
            backoff_max_ms: self.backoff_max_ms,
            warm_reset_broadcasts: self.warm_reset_broadcasts,
            linger_ms: self.linger_ms,
        }
    }

    pub fn planner_params(&self, nodes: usize) -> PlannerParams {
        PlannerParams {
            hop_cost: self.hop_cost,
            max_usage: self.max_usage.unwrap_or(u32::MAX),
            ..PlannerParams::for_nodes(nodes)
        }
    }

    pub fn hole(&self) -> Hole {
        Hole {
            base: self.hole_base,
            end: self.hole_end,
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let bad = |what| Err(ConfigError::BadTunable(what));
        let mmio32_gran = 1u64 << MMIO32_ATT_SHIFT;
        if self.max_fabric_retries == 0 {
            return bad("max_fabric_retries");
        }
        if self.backoff_initial_ms == 0
            || self.backoff_max_ms < self.backoff_initial_ms
        {
            return bad("backoff");
        }
        if self.hole().validate(1 << DRAM_ATT_SHIFT).is_err() {
            return bad("hole");
        }
        if self.mmio32_base >= self.mmio32_end
            || self.mmio32_end > 1 << 32
            || self.mmio32_base % mmio32_gran != 0
            || self.mmio32_end % mmio32_gran != 0
            || self.mmio32_per_node == 0
        {
            return bad("mmio32");
        }
        if !self.mmio64_per_node.is_power_of_two()
            || self.mmio64_per_node < mmio32_gran
        {
            return bad("mmio64_per_node");
        }
        if self.mem_limit.is_some_and(|l| l < 1 << DRAM_ATT_SHIFT) {
            return bad("mem_limit");
        }
        if self.stress
            && (self.stress_bytes_per_core == 0
                || self.stress_bytes_per_core % 8 != 0)
        {
            return bad("stress_bytes_per_core");
        }
        if self.reserved.iter().chain(&self.trace_buffer).any(|r| {
            r.len == 0 || r.base.checked_add(r.len).is_none()
        }) {
            return bad("reserved");
        }
        Ok(())
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ConfigError {
    NoNodes,
    /// A dimension is zero or longer than a coordinate can count.
    BadSize,
    OutOfBounds(SciId),
    DuplicateSci(SciId),
    DuplicateMac(SciId),
    UnknownPartition(SciId),
    DuplicatePartition(usize),
    /// The partition's master is not a configured node.
    NoMaster(usize),
    /// The partition's master belongs to another partition.
    MasterOutside(usize),
    EmptyPartition(usize),
    /// `port` of the node is wired, but the far end is not wired back (or
    /// there is no far end).
    AsymmetricWiring { sci: SciId, port: Port },
    /// None of the configured nodes has our station address.
    UnknownMac(MacAddr),
    BadTunable(&'static str),
}

impl ClusterConfig {
    /// Checks everything that can be checked without touching hardware.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.nodes.is_empty() {
            return Err(ConfigError::NoNodes);
        }
        let s = self.size;
        if [s.x, s.y, s.z].iter().any(|&d| d == 0 || d > 16) {
            return Err(ConfigError::BadSize);
        }

        for (i, n) in self.nodes.iter().enumerate() {
            if !s.contains(n.sci) {
                return Err(ConfigError::OutOfBounds(n.sci));
            }
            let earlier = &self.nodes[..i];
            if earlier.iter().any(|o| o.sci == n.sci) {
                return Err(ConfigError::DuplicateSci(n.sci));
            }
            if earlier.iter().any(|o| o.mac == n.mac) {
                return Err(ConfigError::DuplicateMac(n.sci));
            }
            if self.partition_named(&n.partition).is_none() {
                return Err(ConfigError::UnknownPartition(n.sci));
            }
        }
        for n in &self.nodes {
            self.check_wiring(n)?;
        }

        for (i, p) in self.partitions.iter().enumerate() {
            if self.partitions[..i].iter().any(|o| o.name == p.name) {
                return Err(ConfigError::DuplicatePartition(i));
            }
            if !self.nodes.iter().any(|n| n.partition == p.name) {
                return Err(ConfigError::EmptyPartition(i));
            }
            let master = self
                .nodes
                .iter()
                .find(|n| n.sci == p.master)
                .ok_or(ConfigError::NoMaster(i))?;
            if master.partition != p.name {
                return Err(ConfigError::MasterOutside(i));
            }
        }

        self.tunables.validate()
    }

    fn check_wiring(&self, n: &NodeConfig) -> Result<(), ConfigError> {
        for port in Port::LINKS {
            if n.wiring & port.mask_bit() == 0 {
                continue;
            }
            let back = self
                .size
                .neighbor(n.sci, port)
                .and_then(|peer| self.nodes.iter().find(|o| o.sci == peer))
                .is_some_and(|o| o.wiring & port.opposite().mask_bit() != 0);
            if !back {
                return Err(ConfigError::AsymmetricWiring { sci: n.sci, port });
            }
        }
        Ok(())
    }

    pub fn node_by_mac(&self, mac: MacAddr) -> Option<NodeIndex> {
        self.nodes
            .iter()
            .position(|n| n.mac == mac)
            .map(|i| i as NodeIndex)
    }

    pub fn node_by_sci(&self, sci: SciId) -> Option<NodeIndex> {
        self.nodes
            .iter()
            .position(|n| n.sci == sci)
            .map(|i| i as NodeIndex)
    }

    pub fn node(&self, n: NodeIndex) -> Option<&NodeConfig> {
        self.nodes.get(usize::from(n))
    }

    pub fn partition_named(&self, name: &str) -> Option<&PartitionConfig> {
        self.partitions.iter().find(|p| p.name == name)
    }

    pub fn partition_of(&self, n: NodeIndex) -> Option<&PartitionConfig> {
        self.partition_named(&self.node(n)?.partition)
    }

    /// Coordinates of every node, by node index.
    pub fn scis(&self) -> Vec<SciId, MAX_NODES> {
        self.nodes.iter().map(|n| n.sci).collect()
    }

    /// Nodes of the partition named `name`, in node order.
    pub fn members_of<'c>(
        &'c self,
        name: &'c str,
    ) -> impl Iterator<Item = NodeIndex> + 'c {
        self.nodes
            .iter()
            .enumerate()
            .filter(move |(_, n)| n.partition == name)
            .map(|(i, _)| i as NodeIndex)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RING: &str = r#"
        size = { x = 4 }

        [[nodes]]
        sci = 0x000
        mac = [2, 0, 0, 0, 0, 0]
        partition = "a"
        wiring = 0x03

        [[nodes]]
        sci = 0x001
        mac = [2, 0, 0, 0, 0, 1]
        partition = "a"
        wiring = 0x03

        [[nodes]]
        sci = 0x002
        mac = [2, 0, 0, 0, 0, 2]
        partition = "b"
        wiring = 0x03

        [[nodes]]
        sci = 0x003
        mac = [2, 0, 0, 0, 0, 3]
        partition = "b"
        wiring = 0x03

        [[partitions]]
        name = "a"
        master = 0x000
        label = "vmlinuz-a"

        [[partitions]]
        name = "b"
        master = 0x002
        unified = false
        label = "vmlinuz-b"

        [tunables]
        linger_ms = 250
        mem_limit = 0x800000000
        reserved = [{ base = 0x100000, len = 0x1000 }]
    "#;

    fn name(s: &str) -> String<16> {
        let mut n = String::new();
        n.push_str(s).unwrap();
        n
    }

    fn ring() -> ClusterConfig {
        toml::from_str(RING).unwrap()
    }

    #[test]
    fn parses_with_defaults() {
        let cfg = ring();
        cfg.validate().unwrap();
        assert_eq!(cfg.size, FabricSize { x: 4, y: 1, z: 1 });
        assert_eq!(cfg.nodes.len(), 4);
        assert_eq!(cfg.nodes[3].mac, MacAddr([2, 0, 0, 0, 0, 3]));
        assert!(cfg.partitions[0].unified);
        assert!(!cfg.partitions[1].unified);

        let t = &cfg.tunables;
        assert_eq!(t.linger_ms, 250);
        assert_eq!(t.mem_limit, Some(32 << 30));
        assert_eq!(t.reserved.len(), 1);
        assert_eq!(t.max_fabric_retries, 8);
        assert_eq!(t.hole(), Hole::DEFAULT);
        assert_eq!(t.sync_params().linger_ms, 250);
        assert_eq!(t.planner_params(4).max_usage, u32::MAX);
    }

    #[test]
    fn lookups() {
        let cfg = ring();
        let mac = MacAddr([2, 0, 0, 0, 0, 2]);
        assert_eq!(cfg.node_by_mac(mac), Some(2));
        assert_eq!(cfg.node_by_sci(SciId::new(3).unwrap()), Some(3));
        assert_eq!(cfg.partition_of(1).map(|p| p.label.as_str()), Some("vmlinuz-a"));
        let b: std::vec::Vec<_> = cfg.members_of("b").collect();
        assert_eq!(b, [2, 3]);
        assert_eq!(cfg.scis()[1].raw(), 1);
    }

    #[test]
    fn unknown_fields_are_refused() {
        // Lands in the `[tunables]` table.
        let doc = std::format!("{RING}\n        colour = 1\n");
        assert!(toml::from_str::<ClusterConfig>(&doc).is_err());
    }

    #[test]
    fn rejects_bad_clusters() {
        let sci = |n| SciId::new(n).unwrap();

        let mut cfg = ring();
        cfg.nodes[1].sci = sci(0);
        assert_eq!(cfg.validate(), Err(ConfigError::DuplicateSci(sci(0))));

        let mut cfg = ring();
        cfg.nodes[2].mac = cfg.nodes[0].mac;
        assert_eq!(cfg.validate(), Err(ConfigError::DuplicateMac(sci(2))));

        let mut cfg = ring();
        cfg.nodes[3].sci = sci(0x010);
        assert_eq!(cfg.validate(), Err(ConfigError::OutOfBounds(sci(0x010))));

        let mut cfg = ring();
        cfg.nodes[0].partition = name("c");
        assert_eq!(cfg.validate(), Err(ConfigError::UnknownPartition(sci(0))));

        let mut cfg = ring();
        cfg.partitions[1].master = sci(0);
        assert_eq!(cfg.validate(), Err(ConfigError::MasterOutside(1)));

        let mut cfg = ring();
        cfg.partitions[1].master = sci(0x00e);
        assert_eq!(cfg.validate(), Err(ConfigError::NoMaster(1)));

        let mut cfg = ring();
        for n in cfg.nodes.iter_mut() {
            n.partition = name("a");
        }
        assert_eq!(cfg.validate(), Err(ConfigError::EmptyPartition(1)));

        let mut cfg = ring();
        cfg.nodes.clear();
        assert_eq!(cfg.validate(), Err(ConfigError::NoNodes));

        let mut cfg = ring();
        cfg.size.y = 0;
        assert_eq!(cfg.validate(), Err(ConfigError::BadSize));
    }

    #[test]
    fn wiring_must_be_symmetric() {
        let mut cfg = ring();
        // Node 1 no longer wires its XB port back to node 0's XA.
        cfg.nodes[1].wiring = Port::XA.mask_bit();
        assert_eq!(
            cfg.validate(),
            Err(ConfigError::AsymmetricWiring {
                sci: SciId::new(0).unwrap(),
                port: Port::XA
            })
        );

        // A port along a dimension of extent one leads nowhere.
        let mut cfg = ring();
        cfg.nodes[0].wiring |= Port::YA.mask_bit();
        assert_eq!(
            cfg.validate(),
            Err(ConfigError::AsymmetricWiring {
                sci: SciId::new(0).unwrap(),
                port: Port::YA
            })
        );
    }

    #[test]
    fn rejects_bad_tunables() {
        let mut cfg = ring();
        cfg.tunables.hole_end = cfg.tunables.hole_base + (1 << 30);
        assert_eq!(cfg.validate(), Err(ConfigError::BadTunable("hole")));

        let mut cfg = ring();
        cfg.tunables.mmio64_per_node = 3 << 30;
        assert_eq!(
            cfg.validate(),
            Err(ConfigError::BadTunable("mmio64_per_node"))
        );

        let mut cfg = ring();
        cfg.tunables.mmio32_end = 0x1_0010_0000;
        assert_eq!(cfg.validate(), Err(ConfigError::BadTunable("mmio32")));

        let mut cfg = ring();
        cfg.tunables.max_fabric_retries = 0;
        assert_eq!(
            cfg.validate(),
            Err(ConfigError::BadTunable("max_fabric_retries"))
        );

        let mut cfg = ring();
        cfg.tunables.stress = true;
        cfg.tunables.stress_bytes_per_core = 12;
        assert_eq!(
            cfg.validate(),
            Err(ConfigError::BadTunable("stress_bytes_per_core"))
        );
    }
}
