// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Waking the partition's cores and handing them work.
//!
//! Every hand-off is a scatter/gather: the master counts a [`Semaphore`] up
//! to the number of cores it asked, each core counts it down when its task
//! is finished, and the master polls it until it reaches zero or time runs
//! out. Anything left over is fatal.

use core::fmt;
use core::sync::atomic::{AtomicU32, Ordering};

use drv_fabric_api::{poll_until, Clock, Cpu, Csr};
use drv_fabric_chip::FabricChip;
use heapless::Vec;
use ringbuf::ringbuf_entry;

use crate::memory::{MemoryMap, TOM2_MSR};
use crate::state::{FabricState, Trace};
use crate::stress::{self, Chunk, Memory};
use crate::Fatal;

pub const MAX_CORES: usize = 1024;

/// A core, by the APIC id it answers to once the partition is unified.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Core {
    pub apic: u32,
    /// Position of the core's node in the memory map.
    pub node: u8,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CoreTask {
    /// Answer, and nothing else.
    Wake,
    /// Program the core's view of the unified address space.
    Setup { tom2: u64 },
    StressFill(Chunk),
    StressVerify(Chunk),
}

impl CoreTask {
    /// Runs the task on the calling core and reports whether it succeeded.
    pub fn run(&self, mem: &impl Memory, cpu: &impl Cpu) -> bool {
        match self {
            CoreTask::Wake => true,
            CoreTask::Setup { tom2 } => {
                cpu.wrmsr(TOM2_MSR, *tom2);
                true
            }
            CoreTask::StressFill(c) => {
                stress::fill(mem, c);
                true
            }
            CoreTask::StressVerify(c) => stress::verify(mem, c).is_ok(),
        }
    }
}

/// Starting tasks on other cores.
pub trait Cores {
    /// APIC id of the core running bring-up.
    fn current(&self) -> u32;

    /// Sends `task` to core `apic`, which runs it and then calls
    /// [`Semaphore::arrive`] on `done`. Does not wait.
    ///
    /// The core may arrive after the caller has stopped waiting. `done`
    /// stays alive until the core has arrived or bring-up has given up on
    /// it, and a core that is already running ignores a repeated `Wake`.
    fn start(&mut self, apic: u32, task: CoreTask, done: &Semaphore);
}

impl<T: Cores + ?Sized> Cores for &mut T {
    fn current(&self) -> u32 {
        (**self).current()
    }
    fn start(&mut self, apic: u32, task: CoreTask, done: &Semaphore) {
        (**self).start(apic, task, done)
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CoreError {
    /// The core never answered, however often it was woken.
    NoResponse { apic: u32 },
    /// `missing` cores had not finished when time ran out.
    Timeout { missing: u32 },
    /// `failures` cores reported that their task failed.
    Failed { failures: u32 },
    TooManyCores,
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CoreError::NoResponse { apic } => {
                write!(f, "core {apic:#x} does not respond")
            }
            CoreError::Timeout { missing } => {
                write!(f, "{missing} cores did not finish")
            }
            CoreError::Failed { failures } => write!(f, "{failures} cores failed"),
            CoreError::TooManyCores => write!(f, "too many cores"),
        }
    }
}

/// Counts down to zero as cores finish.
#[derive(Debug, Default)]
pub struct Semaphore {
    remaining: AtomicU32,
    failed: AtomicU32,
}

impl Semaphore {
    pub fn new(count: u32) -> Self {
        Self {
            remaining: AtomicU32::new(count),
            failed: AtomicU32::new(0),
        }
    }

    /// Called by a core when its task is finished.
    pub fn arrive(&self, ok: bool) {
        if !ok {
            self.failed.fetch_add(1, Ordering::Relaxed);
        }
        // A core that arrives twice must not wrap the count.
        let _ = self.remaining.fetch_update(
            Ordering::Release,
            Ordering::Relaxed,
            |n| n.checked_sub(1),
        );
    }

    pub fn remaining(&self) -> u32 {
        self.remaining.load(Ordering::Acquire)
    }

    pub fn failures(&self) -> u32 {
        self.failed.load(Ordering::Relaxed)
    }

    /// Waits for every core to arrive.
    pub fn wait(&self, clock: &impl Clock, timeout: u64) -> Result<(), CoreError> {
        poll_until(clock, timeout, 1, || (self.remaining() == 0).then_some(()))
            .ok_or(CoreError::Timeout {
                missing: self.remaining(),
            })?;
        match self.failures() {
            0 => Ok(()),
            failures => Err(CoreError::Failed { failures }),
        }
    }
}

/// Every core of the partition, with the APIC ids it has once each node's
/// offset is applied.
pub fn enumerate<C: Csr>(
    csr: &C,
    map: &MemoryMap,
) -> Result<Vec<Core, MAX_CORES>, Fatal> {
    let mut out = Vec::new();
    for (i, m) in map.members.iter().enumerate() {
        let chip = FabricChip::attach(csr, m.sci)?;
        let offset = map.apic.get(i).copied().unwrap_or(0);
        for s in 0..chip.socket_count()? {
            let k = chip.socket(s)?;
            for c in 0..k.cores {
                let apic = offset + k.apic_base + c;
                out.push(Core {
                    apic,
                    node: i as u8,
                })
                .map_err(|_| CoreError::TooManyCores)?;
            }
        }
    }
    Ok(out)
}

/// Wakes every core but our own, one at a time, retrying a core that does
/// not answer.
pub fn wake(
    state: &mut FabricState<'_>,
    cores: &mut impl Cores,
    list: &[Core],
    clock: &impl Clock,
) -> Result<u32, Fatal> {
    let t = &state.config().tunables;
    let me = cores.current();
    let mut woken = 0;
    for core in list.iter().filter(|c| c.apic != me) {
        // One barrier for every try: an answer to an earlier wake counts.
        let done = Semaphore::new(1);
        let mut tries = 0;
        loop {
            cores.start(core.apic, CoreTask::Wake, &done);
            if done.wait(clock, t.core_wake_timeout_ms).is_ok() {
                break;
            }
            if tries >= t.core_wake_retries {
                return Err(CoreError::NoResponse { apic: core.apic }.into());
            }
            tries += 1;
            ringbuf_entry!(state.trace, Trace::WakeRetry(core.apic));
        }
        woken += 1;
    }
    ringbuf_entry!(state.trace, Trace::CoresWoken(woken));
    Ok(woken)
}

/// Hands every core but our own a task and waits for all of them.
pub fn fan_out(
    cores: &mut impl Cores,
    list: &[Core],
    clock: &impl Clock,
    timeout: u64,
    mut task: impl FnMut(usize, &Core) -> CoreTask,
) -> Result<(), CoreError> {
    let me = cores.current();
    let count = list.iter().filter(|c| c.apic != me).count();
    let done = Semaphore::new(u32::try_from(count).map_err(|_| CoreError::TooManyCores)?);
    for (i, core) in list.iter().enumerate().filter(|(_, c)| c.apic != me) {
        cores.start(core.apic, task(i, core), &done);
    }
    done.wait(clock, timeout)
}

/// Fills a chunk per core, then has every core check a chunk another core
/// wrote.
pub fn stress(
    cores: &mut impl Cores,
    list: &[Core],
    map: &MemoryMap,
    clock: &impl Clock,
    timeout: u64,
    bytes_per_core: u64,
    seed: u64,
) -> Result<(), CoreError> {
    let me = cores.current();
    let workers: Vec<Core, MAX_CORES> =
        list.iter().filter(|c| c.apic != me).copied().collect();
    let chunks = stress::plan(map, &workers, bytes_per_core, seed);
    fan_out(cores, &workers, clock, timeout, |i, _| {
        CoreTask::StressFill(chunks[i])
    })?;
    fan_out(cores, &workers, clock, timeout, |i, _| {
        match stress::verifier_chunk(&chunks, &workers, i) {
            Some(c) => CoreTask::StressVerify(c),
            None => CoreTask::Wake,
        }
    })
}

/// Configures our own core the way [`CoreTask::Setup`] configures the
/// others.
pub fn setup_self(cpu: &impl Cpu, tom2: u64) {
    cpu.wrmsr(TOM2_MSR, tom2);
}
