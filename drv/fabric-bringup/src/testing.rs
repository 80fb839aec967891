// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Fixtures shared by the unit tests.

use core::sync::atomic::{AtomicU64, Ordering};
use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, BTreeSet};

use drv_fabric_api::{Clock, Cpu, FabricSize, MacAddr, Port, SciId};
use drv_fabric_chip::fake::{FakeFabric, FakeSocket};
use drv_fabric_chip::LinkController;
use heapless::String;

use crate::config::{ClusterConfig, NodeConfig, PartitionConfig, Tunables};
use crate::cores::{CoreTask, Cores, Semaphore};
use crate::stress::Memory;

/// Time that only moves when somebody waits.
#[derive(Default)]
pub struct VirtualClock(AtomicU64);

impl VirtualClock {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Clock for VirtualClock {
    fn now(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }

    fn delay(&self, ms: u64) {
        self.0.fetch_add(ms, Ordering::Relaxed);
    }
}

pub fn sci(n: u16) -> SciId {
    SciId::new(n).unwrap()
}

pub fn mac(n: u8) -> MacAddr {
    MacAddr([2, 0, 0, 0, 0, n])
}

pub fn name<const N: usize>(s: &str) -> String<N> {
    let mut out = String::new();
    out.push_str(s).unwrap();
    out
}

/// `n` nodes on a ring along X, all in one unified partition mastered by
/// node 0.
pub fn ring_config(n: u8) -> ClusterConfig {
    let wiring = if n > 1 {
        Port::XA.mask_bit() | Port::XB.mask_bit()
    } else {
        0
    };
    let mut cfg = ClusterConfig {
        size: FabricSize { x: n, y: 1, z: 1 },
        nodes: heapless::Vec::new(),
        partitions: heapless::Vec::new(),
        tunables: Tunables {
            linger_ms: 50,
            claim_timeout_ms: 500,
            ..Tunables::default()
        },
    };
    for i in 0..n {
        cfg.nodes
            .push(NodeConfig {
                sci: sci(u16::from(i)),
                mac: mac(i),
                partition: name("main"),
                wiring,
            })
            .unwrap();
    }
    cfg.partitions
        .push(PartitionConfig {
            name: name("main"),
            master: sci(0),
            unified: true,
            label: name("kernel"),
        })
        .unwrap();
    cfg
}

pub const SOCKET_DRAM: u64 = 16 << 30;

/// Chips for [`ring_config`]: the link controller generation alternates,
/// and each node has two sockets of four cores.
pub fn ring_fabric(n: u8) -> FakeFabric {
    let fab = FakeFabric::new();
    for i in 0..n {
        let lc = if i % 2 == 0 {
            LinkController::Lc5
        } else {
            LinkController::Lc4
        };
        let me = sci(u16::from(i));
        fab.add_chip(me, lc);
        fab.set_sockets(
            me,
            &[
                FakeSocket {
                    dram: SOCKET_DRAM,
                    cores: 4,
                    apic_base: 0,
                },
                FakeSocket {
                    dram: SOCKET_DRAM,
                    cores: 4,
                    apic_base: 8,
                },
            ],
        );
    }
    if n > 1 {
        for i in 0..n {
            fab.cable(sci(u16::from(i)), Port::XA, sci(u16::from((i + 1) % n)));
        }
    }
    fab
}

/// Sparse physical memory.
#[derive(Default)]
pub struct Ram(pub RefCell<BTreeMap<u64, u64>>);

impl Memory for Ram {
    fn read64(&self, addr: u64) -> u64 {
        self.0.borrow().get(&addr).copied().unwrap_or(0)
    }
    fn write64(&self, addr: u64, val: u64) {
        self.0.borrow_mut().insert(addr, val);
    }
}

/// A processor that only remembers its MSRs and port writes.
#[derive(Default)]
pub struct Msrs {
    pub msrs: RefCell<BTreeMap<u32, u64>>,
    pub ports: RefCell<std::vec::Vec<(u16, u8)>>,
}

impl Cpu for Msrs {
    fn rdmsr(&self, msr: u32) -> u64 {
        self.msrs.borrow().get(&msr).copied().unwrap_or(0)
    }
    fn wrmsr(&self, msr: u32, val: u64) {
        self.msrs.borrow_mut().insert(msr, val);
    }
    fn inb(&self, _: u16) -> u8 {
        0
    }
    fn outb(&self, port: u16, val: u8) {
        self.ports.borrow_mut().push((port, val));
    }
}

/// Cores that run their task as soon as it is started. A core in `asleep`
/// ignores that many wake-ups first; a core in `dead` ignores all of them.
/// A core in `late` answers its first start only once it is started again,
/// and then on the barrier it was first given.
#[derive(Default)]
pub struct FakeCores {
    pub me: u32,
    pub ram: Ram,
    pub msrs: Msrs,
    pub asleep: BTreeMap<u32, Cell<u32>>,
    pub dead: BTreeSet<u32>,
    pub late: BTreeSet<u32>,
    pub started: RefCell<std::vec::Vec<(u32, CoreTask)>>,
    pub(crate) pending: BTreeMap<u32, (CoreTask, *const Semaphore)>,
}

impl Cores for FakeCores {
    fn current(&self) -> u32 {
        self.me
    }

    fn start(&mut self, apic: u32, task: CoreTask, done: &Semaphore) {
        self.started.borrow_mut().push((apic, task));
        if self.dead.contains(&apic) {
            return;
        }
        if let Some((first, barrier)) = self.pending.remove(&apic) {
            // Already running; this start is ignored and the first one is
            // answered.
            assert!(
                core::ptr::eq(barrier, done),
                "core {apic:#x} answered on a barrier that is gone"
            );
            done.arrive(first.run(&self.ram, &self.msrs));
            return;
        }
        if self.late.remove(&apic) {
            self.pending.insert(apic, (task, done));
            return;
        }
        if let Some(n) = self.asleep.get(&apic) {
            if n.get() > 0 {
                n.set(n.get() - 1);
                return;
            }
        }
        done.arrive(task.run(&self.ram, &self.msrs));
    }
}
