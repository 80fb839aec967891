// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Everything one boot attempt knows about the fabric.

use drv_fabric_api::{Clock, Csr, MacAddr, NodeIndex, SciId, MAX_NODES};
use drv_fabric_chip::{FabricChip, InfoState, LinkController, NodeInfo};
use fabric_msgs::SyncState;
use fabric_route::{RoutePlan, Topology};
use fabric_sync::{Coordinator, Engine, Follower, Member, SyncError};
use heapless::Vec;
use ringbuf::{ringbuf_entry, Ringbuf};

use crate::config::{ClusterConfig, ConfigError, NodeConfig};
use crate::Fatal;

/// What a node does once the fabric is up, decided by its partition.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Role {
    /// Owns a unified partition: takes its other nodes over and boots the
    /// lot as one machine.
    Master,
    /// Publishes itself to `master` and parks.
    Slave { master: SciId },
    /// Member of a partition that is not unified; boots on its own.
    Observer,
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub enum Trace {
    Role(Role),
    Probed {
        lc: LinkController,
        sockets: u8,
        cores: u32,
    },
    Command(SyncState),
    Result(SyncState),
    Planned,
    LinksUp {
        want: u8,
        up: u8,
    },
    LinkLost {
        want: u8,
        up: u8,
    },
    NotReady(SciId),
    CheckFailed,
    Published(InfoState),
    RoutesVerified(SciId),
    Claimed(SciId),
    Programmed(SciId),
    CoresWoken(u32),
    WakeRetry(u32),
    Scrubbed {
        sci: SciId,
        socket: u8,
    },
}

pub struct FabricState<'a> {
    config: &'a ClusterConfig,
    me: NodeIndex,
    role: Role,
    scis: Vec<SciId, MAX_NODES>,
    topology: Topology,
    pub(crate) plan: Option<RoutePlan>,
    lc: Option<LinkController>,
    info: NodeInfo,
    pub(crate) trace: Ringbuf<Trace, 64>,
}

impl<'a> FabricState<'a> {
    /// Finds ourselves in `config` by station address and works out our
    /// role. The configuration is validated first.
    pub fn new(
        config: &'a ClusterConfig,
        mac: MacAddr,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let me = config.node_by_mac(mac).ok_or(ConfigError::UnknownMac(mac))?;
        let node = &config.nodes[usize::from(me)];
        let part = config
            .partition_of(me)
            .ok_or(ConfigError::UnknownPartition(node.sci))?;
        let role = if !part.unified {
            Role::Observer
        } else if part.master == node.sci {
            Role::Master
        } else {
            Role::Slave {
                master: part.master,
            }
        };

        let wiring: Vec<(SciId, u8), MAX_NODES> =
            config.nodes.iter().map(|n| (n.sci, n.wiring)).collect();
        let topology = Topology::from_wiring(config.size, &wiring)
            .map_err(|_| ConfigError::NoNodes)?;

        let mut trace = Ringbuf::new();
        ringbuf_entry!(trace, Trace::Role(role));
        Ok(Self {
            config,
            me,
            role,
            scis: config.scis(),
            topology,
            plan: None,
            lc: None,
            info: NodeInfo::default(),
            trace,
        })
    }

    pub fn config(&self) -> &'a ClusterConfig {
        self.config
    }

    pub fn me(&self) -> NodeIndex {
        self.me
    }

    pub fn sci(&self) -> SciId {
        self.scis[usize::from(self.me)]
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// Coordinates by node index.
    pub fn scis(&self) -> &[SciId] {
        &self.scis
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    pub fn plan(&self) -> Option<&RoutePlan> {
        self.plan.as_ref()
    }

    pub fn link_controller(&self) -> Option<LinkController> {
        self.lc
    }

    /// What we last published in our info block.
    pub fn info(&self) -> &NodeInfo {
        &self.info
    }

    pub fn trace(&self) -> &Ringbuf<Trace, 64> {
        &self.trace
    }

    /// Our cabled ports that lead to a configured node.
    pub fn wired(&self) -> u8 {
        self.topology
            .wired_ports(self.me)
            .fold(0, |m, p| m | p.mask_bit())
    }

    pub fn chip<'c, C: Csr>(
        &self,
        csr: &'c C,
    ) -> Result<FabricChip<'c, C>, Fatal> {
        Ok(FabricChip::attach(csr, self.sci())?)
    }

    /// Finds our fabric chip, reads what sits behind it, and publishes that
    /// in the chip's info block.
    pub fn probe<C: Csr>(
        &mut self,
        csr: &C,
        clock: &impl Clock,
    ) -> Result<(), Fatal> {
        let timeout = self.config.tunables.probe_timeout_ms;
        let chip = FabricChip::probe(csr, self.sci(), clock, timeout)?;
        let sockets = chip.socket_count()?;

        let mut info = NodeInfo {
            sci: u32::from(self.sci().raw()),
            sockets: u32::from(sockets),
            ..Default::default()
        };
        for s in 0..sockets {
            let k = chip.socket(s)?;
            info.cores += k.cores;
            info.apic_span = info.apic_span.max(k.apic_base.saturating_add(k.cores));
            info.dram_mib[usize::from(s)] =
                u32::try_from(k.dram >> 20).unwrap_or(u32::MAX);
        }
        info.set_state(InfoState::Probed);
        chip.write_info(&info);

        let lc = chip.link_controller();
        ringbuf_entry!(
            self.trace,
            Trace::Probed {
                lc,
                sockets,
                cores: info.cores
            }
        );
        self.lc = Some(lc);
        self.info = info;
        Ok(())
    }

    /// Moves our info block to `state`.
    pub fn publish<C: Csr>(
        &mut self,
        csr: &C,
        state: InfoState,
    ) -> Result<(), Fatal> {
        let chip = self.chip(csr)?;
        self.info.set_state(state);
        chip.write_info(&self.info);
        ringbuf_entry!(self.trace, Trace::Published(state));
        Ok(())
    }

    /// The synchronization engine for this node. The first configured node
    /// coordinates; everybody else follows it.
    pub fn engine(&self) -> Result<Engine, SyncError> {
        let nodes = &self.config.nodes;
        let params = self.config.tunables.sync_params();
        let me = member(&nodes[usize::from(self.me)]);
        if self.me == 0 {
            let others: Vec<Member, MAX_NODES> =
                nodes.iter().skip(1).map(member).collect();
            Ok(Engine::Coordinator(Coordinator::new(me, &others, params)?))
        } else {
            Ok(Engine::Follower(Follower::new(me, member(&nodes[0]), params)))
        }
    }
}

fn member(n: &NodeConfig) -> Member {
    Member {
        sci: n.sci,
        mac: n.mac,
    }
}
