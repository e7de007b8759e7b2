//! In-memory platform used to exercise the patching engine without
//! touching live code.

use nix::{errno::Errno, unistd::Pid};
use parking_lot::Mutex;
use std::{
    collections::HashMap,
    sync::atomic::{AtomicUsize, Ordering},
};

use super::{CodeMemory, Platform, Protection, Suspension, ThreadControl};
use crate::{
    arch::x86_64::{HotPatch, PADDING_SIZE},
    diag::{Error, Result},
    procedure::Procedure,
};

/// Entry thunk address used by `Simulated`.
pub const ENTRY_THUNK: usize = 0x10_0000;
/// Exit thunk address used by `Simulated`.
pub const EXIT_THUNK: usize = 0x10_1000;

/// `int3` padding, `xchg %ax, %ax`, `ret`.
pub const HOTPATCHABLE: [u8; 8] = [0xcc, 0xcc, 0xcc, 0xcc, 0xcc, 0x66, 0x90, 0xc3];
/// `int3` padding, `push %rbp`, `mov %rsp, %rbp`, `ret`.
pub const PLAIN: [u8; 10] = [0xcc, 0xcc, 0xcc, 0xcc, 0xcc, 0x55, 0x48, 0x89, 0xe5, 0xc3];

struct Region {
    base: usize,
    bytes: Vec<u8>,
    protection: Protection,
}

impl Region {
    fn overlaps(&self, addr: usize, len: usize) -> bool {
        addr < self.base + self.bytes.len() && self.base < addr + len
    }

    fn contains(&self, addr: usize, len: usize) -> bool {
        addr >= self.base && addr + len <= self.base + self.bytes.len()
    }
}

/// Code memory made of independent regions, each with its own protection.
#[derive(Default)]
pub struct SimulatedMemory {
    regions: Mutex<Vec<Region>>,
    // Address to the number of writes covering it still allowed.
    failing_writes: Mutex<HashMap<usize, usize>>,
    flushes: AtomicUsize,
}

impl SimulatedMemory {
    pub fn map(&self, base: usize, bytes: &[u8], protection: Protection) {
        self.regions.lock().push(Region {
            base,
            bytes: bytes.to_vec(),
            protection,
        });
    }

    /// Copy of `len` bytes at `addr`, if mapped.
    #[must_use]
    pub fn bytes(&self, addr: usize, len: usize) -> Option<Vec<u8>> {
        let regions = self.regions.lock();
        let region = regions.iter().find(|r| r.contains(addr, len))?;
        let offset = addr - region.base;
        Some(region.bytes[offset..offset + len].to_vec())
    }

    #[must_use]
    pub fn protection_at(&self, addr: usize) -> Option<Protection> {
        let regions = self.regions.lock();
        regions
            .iter()
            .find(|r| r.contains(addr, 1))
            .map(|r| r.protection)
    }

    /// Makes every later write touching `addr` fail.
    pub fn fail_writes_at(&self, addr: usize) {
        self.fail_writes_after(addr, 0);
    }

    /// Lets `allowed` more writes covering `addr` through, then fails them.
    pub fn fail_writes_after(&self, addr: usize, allowed: usize) {
        self.failing_writes.lock().insert(addr, allowed);
    }

    #[must_use]
    pub fn flushes(&self) -> usize {
        self.flushes.load(Ordering::SeqCst)
    }
}

impl CodeMemory for SimulatedMemory {
    fn read(&self, addr: usize, buf: &mut [u8]) -> Result<()> {
        let regions = self.regions.lock();
        let region = regions
            .iter()
            .find(|r| r.contains(addr, buf.len()))
            .ok_or_else(|| Error::from(Errno::EFAULT))?;
        if !region.protection.is_readable() {
            return Err(Errno::EACCES.into());
        }

        let offset = addr - region.base;
        buf.copy_from_slice(&region.bytes[offset..offset + buf.len()]);
        Ok(())
    }

    fn protection(&self, addr: usize, len: usize) -> Result<Protection> {
        let regions = self.regions.lock();
        regions
            .iter()
            .find(|r| r.contains(addr, len))
            .map(|r| r.protection)
            .ok_or_else(|| Error::from(Errno::ENOMEM))
    }

    fn set_protection(
        &self,
        addr: usize,
        len: usize,
        protection: Protection,
    ) -> nix::Result<()> {
        let mut regions = self.regions.lock();
        let mut found = false;
        for region in regions.iter_mut().filter(|r| r.overlaps(addr, len)) {
            region.protection = protection;
            found = true;
        }

        if found {
            Ok(())
        } else {
            Err(Errno::ENOMEM)
        }
    }

    fn write(&self, addr: usize, bytes: &[u8]) -> nix::Result<()> {
        for (failing, allowed) in self.failing_writes.lock().iter_mut() {
            if (addr..addr + bytes.len()).contains(failing) {
                *allowed = allowed.checked_sub(1).ok_or(Errno::EIO)?;
            }
        }

        let mut regions = self.regions.lock();
        let region = regions
            .iter_mut()
            .find(|r| r.contains(addr, bytes.len()))
            .ok_or(Errno::EFAULT)?;
        if !region.protection.is_writable() {
            return Err(Errno::EACCES);
        }

        let offset = addr - region.base;
        region.bytes[offset..offset + bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    fn flush_icache(&self, _addr: usize, _len: usize) {
        self.flushes.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Default)]
struct SimulatedThread {
    ip: usize,
    suspended: bool,
    exited: bool,
    fail_suspend: bool,
    fail_set_ip: bool,
}

/// Threads reduced to an instruction pointer and a suspension flag.
#[derive(Default)]
pub struct SimulatedThreads {
    threads: Mutex<HashMap<i32, SimulatedThread>>,
    suspensions: AtomicUsize,
}

impl SimulatedThreads {
    pub fn spawn(&self, tid: i32, ip: usize) -> Pid {
        self.threads.lock().insert(
            tid,
            SimulatedThread {
                ip,
                ..SimulatedThread::default()
            },
        );
        Pid::from_raw(tid)
    }

    /// Terminates `tid` but keeps it enumerable, as a thread that exits
    /// right after the thread list was read.
    pub fn exit(&self, tid: i32) {
        if let Some(thread) = self.threads.lock().get_mut(&tid) {
            thread.exited = true;
        }
    }

    pub fn fail_suspend(&self, tid: i32) {
        if let Some(thread) = self.threads.lock().get_mut(&tid) {
            thread.fail_suspend = true;
        }
    }

    pub fn fail_set_instruction_pointer(&self, tid: i32) {
        if let Some(thread) = self.threads.lock().get_mut(&tid) {
            thread.fail_set_ip = true;
        }
    }

    #[must_use]
    pub fn ip(&self, tid: i32) -> Option<usize> {
        self.threads.lock().get(&tid).map(|t| t.ip)
    }

    #[must_use]
    pub fn is_suspended(&self, tid: i32) -> bool {
        self.threads.lock().get(&tid).is_some_and(|t| t.suspended)
    }

    /// Number of successful suspensions so far.
    #[must_use]
    pub fn suspensions(&self) -> usize {
        self.suspensions.load(Ordering::SeqCst)
    }
}

fn with_suspended<T>(
    threads: &mut HashMap<i32, SimulatedThread>,
    thread: Pid,
    f: impl FnOnce(&mut SimulatedThread) -> nix::Result<T>,
) -> nix::Result<T> {
    match threads.get_mut(&thread.as_raw()) {
        Some(t) if t.suspended => f(t),
        _ => Err(Errno::ESRCH),
    }
}

impl ThreadControl for SimulatedThreads {
    fn enumerate(&self) -> Result<Vec<Pid>> {
        let mut tids: Vec<i32> = self.threads.lock().keys().copied().collect();
        tids.sort_unstable();
        Ok(tids.into_iter().map(Pid::from_raw).collect())
    }

    fn suspend(&self, thread: Pid) -> nix::Result<Suspension> {
        let mut threads = self.threads.lock();
        let t = threads.get_mut(&thread.as_raw()).ok_or(Errno::ESRCH)?;
        if t.exited {
            return Ok(Suspension::Exited);
        }
        if t.fail_suspend {
            return Err(Errno::EPERM);
        }
        if t.suspended {
            return Err(Errno::EBUSY);
        }

        t.suspended = true;
        self.suspensions.fetch_add(1, Ordering::SeqCst);
        Ok(Suspension::Suspended)
    }

    fn instruction_pointer(&self, thread: Pid) -> nix::Result<usize> {
        with_suspended(&mut self.threads.lock(), thread, |t| Ok(t.ip))
    }

    fn set_instruction_pointer(&self, thread: Pid, ip: usize) -> nix::Result<()> {
        with_suspended(&mut self.threads.lock(), thread, |t| {
            if t.fail_set_ip {
                return Err(Errno::EPERM);
            }
            t.ip = ip;
            Ok(())
        })
    }

    fn resume(&self, thread: Pid) -> nix::Result<()> {
        with_suspended(&mut self.threads.lock(), thread, |t| {
            t.suspended = false;
            Ok(())
        })
    }
}

/// Simulated memory and threads combined with the real x86-64 redirect
/// generator, pointed at fake thunk addresses.
pub struct Simulated {
    memory: SimulatedMemory,
    threads: SimulatedThreads,
    arch: HotPatch,
}

impl Simulated {
    #[must_use]
    pub fn new() -> Self {
        Self {
            memory: SimulatedMemory::default(),
            threads: SimulatedThreads::default(),
            arch: HotPatch::new(ENTRY_THUNK, EXIT_THUNK),
        }
    }

    /// Maps a hot-patchable routine starting at `addr`.
    pub fn add_procedure(&self, addr: usize) -> Procedure {
        self.memory
            .map(addr - PADDING_SIZE, &HOTPATCHABLE, Protection::READ_EXECUTE);
        Procedure::new(addr)
    }

    /// Maps a routine with an ordinary frame-pointer prolog at `addr`.
    pub fn add_plain_procedure(&self, addr: usize) -> Procedure {
        self.memory
            .map(addr - PADDING_SIZE, &PLAIN, Protection::READ_EXECUTE);
        Procedure::new(addr)
    }
}

impl Default for Simulated {
    fn default() -> Self {
        Self::new()
    }
}

impl Platform for Simulated {
    type Memory = SimulatedMemory;
    type Threads = SimulatedThreads;
    type Arch = HotPatch;

    fn memory(&self) -> &SimulatedMemory {
        &self.memory
    }

    fn threads(&self) -> &SimulatedThreads {
        &self.threads
    }

    fn arch(&self) -> &HotPatch {
        &self.arch
    }
}
