// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Fabric bring-up: turning a set of independent servers into one machine.
//!
//! Every node runs [`bring_up`] with the same configuration. In order, it:
//!
//! 1. finds its own fabric chip and publishes what sits behind it;
//! 2. runs the synchronization protocol with every configured node, which
//!    resets, trains, routes and checks the fabric (restarting or resetting
//!    the platform as the protocol decides);
//! 3. does what its partition role says. A slave parks, waiting to be taken
//!    over. An observer boots on its own. A master takes over its
//!    partition's slaves, lays out and programs the unified address space,
//!    wakes and configures every core, optionally stress-tests the fabric,
//!    scrubs DRAM and boots the result.
//!
//! [`run`] maps the outcome onto the boot environment, and is where a fatal
//! error stops the machine: there is no safe way to continue with a
//! half-programmed coherent fabric, so it is reported and the processor
//! halts.

#![cfg_attr(not(test), no_std)]

use core::fmt;

use drv_fabric_api::{Clock, Cpu, Csr, MacAddr, SciId, Transport};
use drv_fabric_chip::{ChipError, InfoState};
use fabric_addr::{AddrError, E820Map};
use fabric_msgs::{MsgError, SyncState};
use fabric_route::RouteError;
use fabric_sync::SyncError;
use heapless::String;

mod commands;
pub mod config;
mod console;
pub mod cores;
pub mod memory;
pub mod state;
pub mod stress;
pub mod sync;

#[cfg(test)]
mod testing;

pub use commands::{CommandHandler, FabricCommands};
pub use config::{ClusterConfig, ConfigError, Tunables};
pub use console::{Console, Quiet};
pub use cores::{CoreError, CoreTask, Cores, Semaphore};
pub use memory::{MemoryMap, E820_ENTRIES};
pub use state::{FabricState, Role};
pub use sync::{SyncDriver, SyncOutcome};

/// Reset control register.
const RESET_PORT: u16 = 0xcf9;
const SYS_RST: u8 = 1 << 1;
const RST_CPU: u8 = 1 << 2;

/// Anything that stops bring-up for good.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Fatal {
    Config(ConfigError),
    Chip(ChipError),
    Route(RouteError),
    Addr(AddrError),
    Sync(SyncError),
    Msg(MsgError),
    Core(CoreError),
    /// The synchronization engine handed us something that is not a
    /// command.
    UnexpectedCommand(SyncState),
    /// Routes were needed before any were planned.
    NoRoutes,
    /// Our node is not the master of a partition.
    NotMaster,
    /// A slave never parked.
    ClaimTimeout(SciId),
    /// A slave's info block names some other node.
    BadInfo(SciId),
    /// The engine produced more work than one step can hold.
    ActionOverflow,
}

macro_rules! from_error {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(
            impl From<$ty> for Fatal {
                fn from(e: $ty) -> Self {
                    Fatal::$variant(e)
                }
            }
        )*
    };
}

from_error! {
    ConfigError => Config,
    ChipError => Chip,
    RouteError => Route,
    AddrError => Addr,
    SyncError => Sync,
    MsgError => Msg,
    CoreError => Core,
}

impl fmt::Display for Fatal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Fatal::Config(e) => write!(f, "bad configuration: {e:?}"),
            Fatal::Chip(e) => write!(f, "fabric chip: {e:?}"),
            Fatal::Route(e) => write!(f, "route planning: {e:?}"),
            Fatal::Addr(e) => write!(f, "address map: {e:?}"),
            Fatal::Sync(e) => write!(f, "synchronization: {e:?}"),
            Fatal::Msg(e) => write!(f, "message encoding: {e:?}"),
            Fatal::Core(e) => write!(f, "cores: {e}"),
            Fatal::UnexpectedCommand(s) => write!(f, "unexpected command {s:?}"),
            Fatal::NoRoutes => write!(f, "no routes planned"),
            Fatal::NotMaster => write!(f, "not the master of a partition"),
            Fatal::ClaimTimeout(sci) => write!(f, "node {sci} never parked"),
            Fatal::BadInfo(sci) => {
                write!(f, "node {sci} publishes another node's info")
            }
            Fatal::ActionOverflow => write!(f, "too many pending actions"),
        }
    }
}

/// What bring-up leaves the boot environment to do.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Outcome {
    /// Boot `label`.
    Exec(String<32>),
    /// Stay out of the way: our master owns this node now.
    Park,
    /// Reset the platform and start over.
    WarmReset,
}

/// Irreversible hand-offs to the boot environment.
pub trait Boot {
    fn exec(&mut self, label: &str) -> !;
    /// Idles forever without touching memory the master may reprogram.
    fn park(&mut self) -> !;
    fn halt(&mut self) -> !;
}

/// Everything bring-up needs from the platform.
pub struct Board<C, K, T, P, R, W> {
    pub csr: C,
    pub clock: K,
    pub transport: T,
    pub cpu: P,
    pub cores: R,
    pub console: W,
    /// Our station address on the sync network.
    pub mac: MacAddr,
    /// The platform memory map, as the firmware found it.
    pub e820: E820Map<E820_ENTRIES>,
}

/// Brings this node and its fabric up, and says what should happen next.
pub fn bring_up<C, K, T, P, R, W>(
    config: &ClusterConfig,
    board: &mut Board<C, K, T, P, R, W>,
) -> Result<Outcome, Fatal>
where
    C: Csr,
    K: Clock,
    T: Transport,
    P: Cpu,
    R: Cores,
    W: Console,
{
    let mut state = FabricState::new(config, board.mac)?;
    say!(
        board.console,
        "fabric node {} ({}): {:?}",
        state.sci(),
        board.mac,
        state.role()
    );

    state.probe(&board.csr, &board.clock)?;
    let info = *state.info();
    say!(
        board.console,
        "probed {:?}: {} sockets, {} cores",
        state.link_controller(),
        info.sockets,
        info.cores
    );

    let mut driver = SyncDriver::new(state.engine()?, &mut board.transport);
    let mut handler = FabricCommands::new(&mut state, &board.csr, &board.clock);
    let synced =
        driver.run(&mut handler, &board.clock, config.tunables.sync_poll_ms)?;
    if synced == SyncOutcome::WarmReset {
        say!(board.console, "fabric failed its check, resetting");
        return Ok(Outcome::WarmReset);
    }
    say!(board.console, "fabric is up");

    match state.role() {
        Role::Slave { master } => {
            state.publish(&board.csr, InfoState::Waiting)?;
            say!(board.console, "waiting for master {}", master);
            Ok(Outcome::Park)
        }
        Role::Observer => Ok(Outcome::Exec(label(&state)?)),
        Role::Master => unify(&mut state, board),
    }
}

fn label(state: &FabricState<'_>) -> Result<String<32>, Fatal> {
    let part = state
        .config()
        .partition_of(state.me())
        .ok_or(Fatal::NotMaster)?;
    Ok(part.label.clone())
}

/// The master's work once the fabric is up.
fn unify<C, K, T, P, R, W>(
    state: &mut FabricState<'_>,
    board: &mut Board<C, K, T, P, R, W>,
) -> Result<Outcome, Fatal>
where
    C: Csr,
    K: Clock,
    P: Cpu,
    R: Cores,
    W: Console,
{
    let t = &state.config().tunables;

    memory::verify_routes(state, &board.csr)?;
    let members = memory::claim(state, &board.csr, &board.clock)?;
    say!(board.console, "claimed {} nodes", members.len() - 1);

    let map = memory::allocate(&members, t)?;
    memory::program(state, &board.csr, &map)?;
    memory::describe(&map, t, &mut board.e820)?;
    cores::setup_self(&board.cpu, map.dram_top);
    say!(
        board.console,
        "{} MiB of memory on {} nodes, top {:#x}",
        map.total_dram() >> 20,
        map.members.len(),
        map.dram_top
    );

    let list = cores::enumerate(&board.csr, &map)?;
    let woken = cores::wake(state, &mut board.cores, &list, &board.clock)?;
    cores::fan_out(
        &mut board.cores,
        &list,
        &board.clock,
        t.core_task_timeout_ms,
        |_, _| CoreTask::Setup { tom2: map.dram_top },
    )?;
    say!(board.console, "{} cores up", woken + 1);

    if t.stress {
        cores::stress(
            &mut board.cores,
            &list,
            &map,
            &board.clock,
            t.core_task_timeout_ms,
            t.stress_bytes_per_core,
            t.stress_seed,
        )?;
        say!(board.console, "stress test passed");
    }
    if t.scrub {
        memory::scrub(state, &board.csr, &board.clock, &map)?;
        say!(board.console, "memory scrubbed");
    }

    Ok(Outcome::Exec(label(state)?))
}

/// Brings the node up and never comes back.
pub fn run<C, K, T, P, R, W>(
    config: &ClusterConfig,
    mut board: Board<C, K, T, P, R, W>,
    boot: &mut impl Boot,
) -> !
where
    C: Csr,
    K: Clock,
    T: Transport,
    P: Cpu,
    R: Cores,
    W: Console,
{
    match bring_up(config, &mut board) {
        Ok(Outcome::Exec(label)) => {
            say!(board.console, "booting {}", label);
            boot.exec(&label)
        }
        Ok(Outcome::Park) => boot.park(),
        Ok(Outcome::WarmReset) => {
            board.cpu.outb(RESET_PORT, SYS_RST);
            board.cpu.outb(RESET_PORT, SYS_RST | RST_CPU);
            boot.halt()
        }
        Err(e) => {
            say!(board.console, "fatal: {}", e);
            boot.halt()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::TOM2_MSR;
    use crate::testing::{
        mac, name, ring_config, ring_fabric, sci, FakeCores, Msrs,
        VirtualClock,
    };
    use drv_fabric_api::{Destination, TransportError};
    use drv_fabric_chip::fake::FakeFabric;
    use fabric_addr::E820Kind;

    /// Nobody else on the network.
    struct Alone;

    impl Transport for Alone {
        fn send(
            &mut self,
            _: &[u8],
            _: Destination,
        ) -> Result<(), TransportError> {
            Ok(())
        }
        fn recv(&mut self, _: &mut [u8]) -> Option<(usize, MacAddr)> {
            None
        }
    }

    #[derive(Default)]
    struct Transcript(std::string::String);

    impl Console for Transcript {
        fn say(&mut self, args: fmt::Arguments<'_>) {
            self.0.push_str(&args.to_string());
            self.0.push('\n');
        }
    }

    fn board(
        fab: &FakeFabric,
    ) -> Board<&FakeFabric, VirtualClock, Alone, Msrs, FakeCores, Transcript>
    {
        Board {
            csr: fab,
            clock: VirtualClock::new(),
            transport: Alone,
            cpu: Msrs::default(),
            cores: FakeCores::default(),
            console: Transcript::default(),
            mac: mac(0),
            e820: E820Map::new(),
        }
    }

    #[test]
    fn single_node_boots_its_partition() {
        let cfg = ring_config(1);
        let fab = ring_fabric(1);
        let mut b = board(&fab);
        // The platform already reports our memory above 4 GiB.
        b.e820.add(1 << 32, 28 << 30, E820Kind::Ram).unwrap();

        let out = bring_up(&cfg, &mut b).unwrap();
        assert_eq!(out, Outcome::Exec(name("kernel")));

        assert_eq!(b.cpu.rdmsr(TOM2_MSR), 32 << 30);
        assert_eq!(b.e820.total(E820Kind::Ram), 28 << 30);
        // Two sockets of four; we are one of them.
        let started = b.cores.started.borrow();
        let woken = started.iter().filter(|(_, t)| *t == CoreTask::Wake).count();
        assert_eq!(woken, 7);
        assert_eq!(b.cores.msrs.rdmsr(TOM2_MSR), 32 << 30);
        assert_eq!((fab.scrubs(sci(0), 0), fab.scrubs(sci(0), 1)), (1, 1));
        assert!(b.console.0.contains("fabric is up"));
    }

    #[test]
    fn stress_runs_on_every_other_core() {
        let mut cfg = ring_config(1);
        cfg.tunables.stress = true;
        cfg.tunables.stress_bytes_per_core = 256;
        let fab = ring_fabric(1);
        let mut b = board(&fab);

        bring_up(&cfg, &mut b).unwrap();
        let started = b.cores.started.borrow();
        let count = |f: fn(&CoreTask) -> bool| {
            started.iter().filter(|(_, t)| f(t)).count()
        };
        let fills = count(|t| matches!(t, CoreTask::StressFill(_)));
        let checks = count(|t| matches!(t, CoreTask::StressVerify(_)));
        assert_eq!((fills, checks), (7, 7));
        // Seven chunks of 32 words, all written above 4 GiB.
        let ram = b.cores.ram.0.borrow();
        assert_eq!(ram.len(), 7 * 32);
        assert!(ram.keys().all(|&a| a >= 1 << 32));
    }

    #[test]
    fn failed_check_resets_the_platform() {
        let cfg = ring_config(1);
        let fab = ring_fabric(1);
        fab.fail_check(sci(0), true);
        let mut b = board(&fab);

        assert_eq!(bring_up(&cfg, &mut b), Ok(Outcome::WarmReset));
        assert!(b.cores.started.borrow().is_empty());
    }

    #[test]
    fn unknown_station_is_a_configuration_error() {
        let cfg = ring_config(1);
        let fab = ring_fabric(1);
        let mut b = board(&fab);
        b.mac = mac(9);

        assert_eq!(
            bring_up(&cfg, &mut b),
            Err(Fatal::Config(ConfigError::UnknownMac(mac(9))))
        );
    }

    #[test]
    fn observers_boot_alone() {
        let mut cfg = ring_config(1);
        cfg.partitions[0].unified = false;
        let fab = ring_fabric(1);
        let mut b = board(&fab);

        assert_eq!(
            bring_up(&cfg, &mut b),
            Ok(Outcome::Exec(name("kernel")))
        );
        assert!(b.cores.started.borrow().is_empty());
        assert_eq!(fab.scrubs(sci(0), 0), 0);
    }

    #[test]
    fn fatal_errors_read_well() {
        let e = Fatal::ClaimTimeout(sci(3));
        assert_eq!(e.to_string(), "node 003 never parked");
        let e: Fatal = CoreError::NoResponse { apic: 0x21 }.into();
        assert_eq!(e.to_string(), "cores: core 0x21 does not respond");
    }
}
