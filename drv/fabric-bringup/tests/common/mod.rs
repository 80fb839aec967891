// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! A rack of fake nodes: one shared fabric, one shared broadcast segment,
//! and per-node processors that run whatever they are handed at once.

#![allow(dead_code)]

use std::cell::RefCell;
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use drv_fabric_api::{
    Clock, Cpu, Destination, MacAddr, Port, SciId, Transport, TransportError,
};
use drv_fabric_bringup::cores::{CoreTask, Cores, Semaphore};
use drv_fabric_bringup::stress::Memory;
use drv_fabric_bringup::{Board, ClusterConfig, Console, E820_ENTRIES};
use drv_fabric_chip::fake::{FakeFabric, FakeSocket};
use drv_fabric_chip::LinkController;
use fabric_addr::E820Map;

pub const SOCKET_DRAM: u64 = 16 << 30;

pub fn sci(n: u8) -> SciId {
    SciId::from_coords(n, 0, 0).unwrap()
}

pub fn mac(n: u8) -> MacAddr {
    MacAddr([2, 0, 0, 0, 0, n])
}

/// A ring of `partitions.len()` nodes along X. Node `i` belongs to the
/// partition named `partitions[i]`; the first node of a partition is its
/// master, and a partition whose name starts with `solo` is not unified.
pub fn ring_config(partitions: &[&str], extra: &str) -> ClusterConfig {
    let n = partitions.len();
    let wiring = if n > 1 { 0x03 } else { 0 };
    let mut doc = format!("size = {{ x = {n} }}\n");
    for (i, p) in partitions.iter().enumerate() {
        doc += &format!(
            "[[nodes]]\nsci = {i}\nmac = [2, 0, 0, 0, 0, {i}]\n\
             partition = \"{p}\"\nwiring = {wiring}\n"
        );
    }
    let mut seen = Vec::new();
    for (i, p) in partitions.iter().enumerate() {
        if seen.contains(p) {
            continue;
        }
        seen.push(*p);
        doc += &format!(
            "[[partitions]]\nname = \"{p}\"\nmaster = {i}\n\
             unified = {}\nlabel = \"{p}\"\n",
            !p.starts_with("solo")
        );
    }
    doc += "[tunables]\nlinger_ms = 50\ntrain_timeout_ms = 100\n";
    doc += extra;
    toml::from_str(&doc).unwrap()
}

/// Chips for [`ring_config`], each with two sockets of four cores.
pub fn ring_fabric(n: u8) -> FakeFabric {
    let fab = FakeFabric::new();
    let socket = |apic_base| FakeSocket {
        dram: SOCKET_DRAM,
        cores: 4,
        apic_base,
    };
    for i in 0..n {
        let lc = if i % 2 == 0 {
            LinkController::Lc5
        } else {
            LinkController::Lc4
        };
        fab.add_chip(sci(i), lc);
        fab.set_sockets(sci(i), &[socket(0), socket(8)]);
    }
    if n > 1 {
        for i in 0..n {
            fab.cable(sci(i), Port::XA, sci((i + 1) % n));
        }
    }
    fab
}

/// Wall-clock time since the test started.
pub struct SysClock(Instant);

impl SysClock {
    pub fn new() -> Self {
        Self(Instant::now())
    }
}

impl Clock for SysClock {
    fn now(&self) -> u64 {
        self.0.elapsed().as_millis() as u64
    }

    fn delay(&self, ms: u64) {
        std::thread::sleep(Duration::from_millis(ms));
    }
}

type Frame = (Vec<u8>, MacAddr);

/// A broadcast segment every node of the rack is plugged into.
#[derive(Clone, Default)]
pub struct Segment(Arc<Mutex<BTreeMap<MacAddr, VecDeque<Frame>>>>);

impl Segment {
    pub fn plug(&self, me: MacAddr) -> Nic {
        self.0.lock().unwrap().insert(me, VecDeque::new());
        Nic {
            me,
            segment: self.clone(),
        }
    }
}

pub struct Nic {
    me: MacAddr,
    segment: Segment,
}

impl Transport for Nic {
    fn send(
        &mut self,
        buf: &[u8],
        _: Destination,
    ) -> Result<(), TransportError> {
        for (m, q) in self.segment.0.lock().unwrap().iter_mut() {
            if *m != self.me {
                q.push_back((buf.to_vec(), self.me));
            }
        }
        Ok(())
    }

    fn recv(&mut self, buf: &mut [u8]) -> Option<(usize, MacAddr)> {
        let (frame, from) =
            self.segment.0.lock().unwrap().get_mut(&self.me)?.pop_front()?;
        let n = frame.len().min(buf.len());
        buf[..n].copy_from_slice(&frame[..n]);
        Some((n, from))
    }
}

/// MSRs and port writes of one processor.
#[derive(Clone, Default)]
pub struct FakeCpu {
    pub msrs: Arc<Mutex<BTreeMap<u32, u64>>>,
    pub ports: Arc<Mutex<Vec<(u16, u8)>>>,
}

impl Cpu for FakeCpu {
    fn rdmsr(&self, msr: u32) -> u64 {
        self.msrs.lock().unwrap().get(&msr).copied().unwrap_or(0)
    }
    fn wrmsr(&self, msr: u32, val: u64) {
        self.msrs.lock().unwrap().insert(msr, val);
    }
    fn inb(&self, _: u16) -> u8 {
        0
    }
    fn outb(&self, port: u16, val: u8) {
        self.ports.lock().unwrap().push((port, val));
    }
}

/// Every other core of the partition: shares one memory and runs its task
/// as soon as it is started.
#[derive(Default)]
pub struct Rack {
    pub ram: RefCell<BTreeMap<u64, u64>>,
    pub cpu: FakeCpu,
    pub started: RefCell<Vec<(u32, CoreTask)>>,
}

impl Memory for Rack {
    fn read64(&self, addr: u64) -> u64 {
        self.ram.borrow().get(&addr).copied().unwrap_or(0)
    }
    fn write64(&self, addr: u64, val: u64) {
        self.ram.borrow_mut().insert(addr, val);
    }
}

impl Cores for Rack {
    fn current(&self) -> u32 {
        0
    }

    fn start(&mut self, apic: u32, task: CoreTask, done: &Semaphore) {
        self.started.borrow_mut().push((apic, task));
        done.arrive(task.run(&*self, &self.cpu));
    }
}

/// Collects narration, for failure messages.
#[derive(Default)]
pub struct Log(pub String);

impl Console for Log {
    fn say(&mut self, args: std::fmt::Arguments<'_>) {
        self.0 += &format!("{args}\n");
    }
}

pub type TestBoard<'f> = Board<&'f FakeFabric, SysClock, Nic, FakeCpu, Rack, Log>;

/// A range the platform keeps for itself inside each node's own memory.
pub const PLATFORM_RESERVED: u64 = 8 << 30;

pub fn board<'f>(fab: &'f FakeFabric, segment: &Segment, n: u8) -> TestBoard<'f> {
    let mut e820: E820Map<E820_ENTRIES> = E820Map::new();
    // What the platform firmware reports on its own.
    e820.add(0, 0xa_0000, fabric_addr::E820Kind::Ram).unwrap();
    e820.add(1 << 20, (2 << 30) - (1 << 20), fabric_addr::E820Kind::Ram)
        .unwrap();
    e820.add(1 << 32, 28 << 30, fabric_addr::E820Kind::Ram).unwrap();
    e820.add(PLATFORM_RESERVED, 1 << 20, fabric_addr::E820Kind::Reserved)
        .unwrap();
    Board {
        csr: fab,
        clock: SysClock::new(),
        transport: segment.plug(mac(n)),
        cpu: FakeCpu::default(),
        cores: Rack::default(),
        console: Log::default(),
        mac: mac(n),
        e820,
    }
}
