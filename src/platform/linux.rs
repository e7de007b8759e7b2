//! Native backend: the engine patches the code of its own process.
//!
//! Other threads are stopped by sending them `SIGUSR2`. The handler parks
//! the thread in a spin loop and publishes its signal context, so the
//! interrupted instruction pointer can be read and rewritten before the
//! thread is released. The kernel restores the (possibly modified) context
//! when the handler returns.

use log::debug;
use nix::{
    errno::Errno,
    sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal},
    unistd::{getpid, gettid, Pid},
};
use procfs::process::{MMPermissions, Process};
use std::{
    ffi::c_void,
    ptr,
    sync::{
        atomic::{fence, AtomicI32, AtomicU32, AtomicUsize, Ordering},
        OnceLock,
    },
    thread,
    time::{Duration, Instant},
};

use super::{CodeMemory, Platform, Protection, Suspension, ThreadControl};
use crate::{
    arch::x86_64::HotPatch,
    diag::{Error, Kind, Result},
    thunk,
};

const SUSPEND_SIGNAL: Signal = Signal::SIGUSR2;
const SUSPEND_TIMEOUT: Duration = Duration::from_secs(1);
/// Threads that can be stopped at once; the signal handler finds its slot
/// in a static table.
pub const MAX_SUSPENDED: usize = 1024;

fn page_size() -> usize {
    // SAFETY: sysconf has no memory safety preconditions.
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    usize::try_from(size).unwrap_or(4096)
}

fn to_protection(perms: MMPermissions) -> Protection {
    let mut bits = libc::PROT_NONE;
    if perms.contains(MMPermissions::READ) {
        bits |= libc::PROT_READ;
    }
    if perms.contains(MMPermissions::WRITE) {
        bits |= libc::PROT_WRITE;
    }
    if perms.contains(MMPermissions::EXECUTE) {
        bits |= libc::PROT_EXEC;
    }
    Protection::from_bits(bits)
}

/// Code of the calling process.
pub struct ProcessMemory {
    page_size: usize,
}

impl ProcessMemory {
    fn new() -> Self {
        Self {
            page_size: page_size(),
        }
    }

    fn pages(&self, addr: usize, len: usize) -> (usize, usize) {
        let start = addr & !(self.page_size - 1);
        let end = (addr + len + self.page_size - 1) & !(self.page_size - 1);
        (start, end - start)
    }
}

impl CodeMemory for ProcessMemory {
    fn read(&self, addr: usize, buf: &mut [u8]) -> Result<()> {
        if !self.protection(addr, buf.len())?.is_readable() {
            return Err(Errno::EACCES.into());
        }

        // SAFETY: the whole range is mapped readable.
        unsafe { ptr::copy_nonoverlapping(addr as *const u8, buf.as_mut_ptr(), buf.len()) };
        Ok(())
    }

    fn protection(&self, addr: usize, len: usize) -> Result<Protection> {
        let end = (addr + len) as u64;
        let mut cursor = addr as u64;
        let mut first = None;

        for map in Process::myself()?.maps()? {
            let (low, high) = map.address;
            if (low..high).contains(&cursor) {
                let protection = *first.get_or_insert_with(|| to_protection(map.perms));
                if high >= end {
                    return Ok(protection);
                }
                cursor = high;
            }
        }

        Err(Error::from(Errno::EFAULT))
    }

    fn set_protection(
        &self,
        addr: usize,
        len: usize,
        protection: Protection,
    ) -> nix::Result<()> {
        let (start, len) = self.pages(addr, len);
        // SAFETY: only the protection of already mapped pages changes.
        let ret = unsafe { libc::mprotect(start as *mut c_void, len, protection.bits()) };
        Errno::result(ret).map(drop)
    }

    fn write(&self, addr: usize, bytes: &[u8]) -> nix::Result<()> {
        let dst = addr as *mut u8;
        let head = bytes.len().saturating_sub(2);

        // SAFETY: the caller made the range writable; the engine only hands
        // out addresses of patch regions.
        unsafe {
            ptr::copy_nonoverlapping(bytes.as_ptr(), dst, head);
            if bytes.len() >= 2 {
                // A thread may be about to execute these two bytes, so they
                // flip in one store. The trampoline keeps them within one
                // cache line, which makes the store atomic.
                let tail = u16::from_ne_bytes([bytes[head], bytes[head + 1]]);
                dst.add(head).cast::<u16>().write_unaligned(tail);
            } else {
                ptr::copy_nonoverlapping(bytes.as_ptr(), dst, bytes.len());
            }
        }
        Ok(())
    }

    fn flush_icache(&self, _addr: usize, _len: usize) {
        // x86 keeps instruction fetch coherent with stores.
        fence(Ordering::SeqCst);
    }
}

const IDLE: u32 = 0;
const REQUESTED: u32 = 1;
const PARKED: u32 = 2;
const RESUMING: u32 = 3;

struct Slot {
    tid: AtomicI32,
    state: AtomicU32,
    context: AtomicUsize,
}

#[allow(clippy::declare_interior_mutable_const)]
const FREE_SLOT: Slot = Slot {
    tid: AtomicI32::new(0),
    state: AtomicU32::new(IDLE),
    context: AtomicUsize::new(0),
};

static SLOTS: [Slot; MAX_SUSPENDED] = [FREE_SLOT; MAX_SUSPENDED];

fn slot_of(tid: Pid) -> Option<&'static Slot> {
    SLOTS
        .iter()
        .find(|slot| slot.tid.load(Ordering::Acquire) == tid.as_raw())
}

fn claim(tid: Pid) -> nix::Result<&'static Slot> {
    if slot_of(tid).is_some() {
        return Err(Errno::EBUSY);
    }

    SLOTS
        .iter()
        .find(|slot| {
            slot.tid
                .compare_exchange(0, tid.as_raw(), Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
        })
        .ok_or(Errno::EAGAIN)
}

fn release(slot: &Slot) {
    slot.state.store(IDLE, Ordering::Release);
    slot.tid.store(0, Ordering::Release);
}

extern "C" fn park(_: libc::c_int, _: *mut libc::siginfo_t, context: *mut c_void) {
    let Some(slot) = slot_of(gettid()) else {
        return;
    };

    slot.context.store(context as usize, Ordering::Release);
    if slot
        .state
        .compare_exchange(REQUESTED, PARKED, Ordering::AcqRel, Ordering::Acquire)
        .is_err()
    {
        return;
    }

    while slot.state.load(Ordering::Acquire) == PARKED {
        // SAFETY: sched_yield is async-signal-safe.
        unsafe { libc::sched_yield() };
    }

    slot.context.store(0, Ordering::Release);
    slot.state.store(IDLE, Ordering::Release);
}

fn install_handler() -> Result<()> {
    static INSTALLED: OnceLock<nix::Result<()>> = OnceLock::new();

    let installed = *INSTALLED.get_or_init(|| {
        let action = SigAction::new(
            SigHandler::SigAction(park),
            SaFlags::SA_SIGINFO | SaFlags::SA_RESTART,
            SigSet::empty(),
        );
        // SAFETY: `park` only touches atomics and async-signal-safe calls.
        unsafe { sigaction(SUSPEND_SIGNAL, &action) }.map(drop)
    });
    installed?;
    Ok(())
}

fn check_thread_count(count: usize) -> Result<()> {
    if count > MAX_SUSPENDED {
        return Err(Error::new(Kind::ThreadSuspendFailure).with_detail(format!(
            "{count} threads, at most {MAX_SUSPENDED} can be suspended"
        )));
    }
    Ok(())
}

fn tgkill(tid: Pid, signal: libc::c_int) -> nix::Result<()> {
    // SAFETY: tgkill only takes integers.
    let ret = unsafe {
        libc::syscall(
            libc::SYS_tgkill,
            getpid().as_raw(),
            tid.as_raw(),
            signal,
        )
    };
    Errno::result(ret).map(drop)
}

fn parked(tid: Pid) -> nix::Result<&'static Slot> {
    match slot_of(tid) {
        Some(slot) if slot.state.load(Ordering::Acquire) == PARKED => Ok(slot),
        _ => Err(Errno::ESRCH),
    }
}

fn context_of(slot: &Slot) -> nix::Result<*mut libc::ucontext_t> {
    match slot.context.load(Ordering::Acquire) {
        0 => Err(Errno::EFAULT),
        context => Ok(context as *mut libc::ucontext_t),
    }
}

/// Stops the other threads of the process with `SIGUSR2`.
pub struct SignalSuspender {
    _private: (),
}

impl SignalSuspender {
    fn new() -> Result<Self> {
        install_handler()?;
        Ok(Self { _private: () })
    }
}

impl ThreadControl for SignalSuspender {
    fn enumerate(&self) -> Result<Vec<Pid>> {
        let me = gettid();
        let mut tids = Vec::new();
        for task in Process::myself()?.tasks()? {
            let tid = Pid::from_raw(task?.tid);
            if tid != me {
                tids.push(tid);
            }
        }

        check_thread_count(tids.len())?;
        Ok(tids)
    }

    fn suspend(&self, thread: Pid) -> nix::Result<Suspension> {
        let slot = claim(thread)?;
        slot.state.store(REQUESTED, Ordering::Release);

        match tgkill(thread, SUSPEND_SIGNAL as libc::c_int) {
            Ok(()) => {}
            Err(Errno::ESRCH) => {
                release(slot);
                return Ok(Suspension::Exited);
            }
            Err(e) => {
                release(slot);
                return Err(e);
            }
        }

        let deadline = Instant::now() + SUSPEND_TIMEOUT;
        loop {
            if slot.state.load(Ordering::Acquire) == PARKED {
                return Ok(Suspension::Suspended);
            }
            if Instant::now() >= deadline {
                break;
            }
            thread::yield_now();
        }

        if slot
            .state
            .compare_exchange(REQUESTED, IDLE, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            // Parked right at the deadline.
            return Ok(Suspension::Suspended);
        }
        release(slot);

        match tgkill(thread, 0) {
            Err(Errno::ESRCH) => Ok(Suspension::Exited),
            _ => Err(Errno::ETIMEDOUT),
        }
    }

    fn instruction_pointer(&self, thread: Pid) -> nix::Result<usize> {
        let context = context_of(parked(thread)?)?;
        // SAFETY: the parked handler keeps its context alive until resumed.
        let rip = unsafe { (*context).uc_mcontext.gregs[libc::REG_RIP as usize] };
        #[allow(clippy::cast_sign_loss, clippy::cast_possible_truncation)]
        let ip = rip as usize;
        Ok(ip)
    }

    fn set_instruction_pointer(&self, thread: Pid, ip: usize) -> nix::Result<()> {
        let context = context_of(parked(thread)?)?;
        #[allow(clippy::cast_possible_wrap)]
        let rip = ip as i64;
        // SAFETY: as above; the kernel reloads the context on sigreturn.
        unsafe { (*context).uc_mcontext.gregs[libc::REG_RIP as usize] = rip };
        Ok(())
    }

    fn resume(&self, thread: Pid) -> nix::Result<()> {
        let slot = slot_of(thread).ok_or(Errno::ESRCH)?;
        slot.state
            .compare_exchange(PARKED, RESUMING, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| Errno::ESRCH)?;

        while slot.state.load(Ordering::Acquire) != IDLE {
            thread::yield_now();
        }
        slot.tid.store(0, Ordering::Release);
        Ok(())
    }
}

/// The calling process on x86-64 Linux, patched towards the assembly thunks.
///
/// Removing patches stops every other thread of the process, so it fails
/// with `ThreadSuspendFailure` while more than `MAX_SUSPENDED` of them run.
/// Procedures whose two byte prolog straddles a 64-byte cache line are not
/// instrumentable: the jump over it is installed with a single store that
/// must not be split.
pub struct Native {
    memory: ProcessMemory,
    threads: SignalSuspender,
    arch: HotPatch,
}

impl Native {
    /// # Safety
    ///
    /// Every procedure later handed to an engine built on this platform must
    /// be the entry point of a routine of this process, compiled (or
    /// assembled) with hot-patch padding, whose code nothing else rewrites.
    /// The engine writes to those addresses directly.
    ///
    /// # Errors
    ///
    /// Returns an `Err` if the suspension signal handler cannot be installed.
    pub unsafe fn new() -> Result<Self> {
        let arch = HotPatch::new(thunk::entry_thunk(), thunk::exit_thunk());
        debug!(
            "Native thunks: entry {:#x}, exit {:#x}",
            arch.entry_thunk(),
            thunk::exit_thunk()
        );

        Ok(Self {
            memory: ProcessMemory::new(),
            threads: SignalSuspender::new()?,
            arch,
        })
    }
}

impl Platform for Native {
    type Memory = ProcessMemory;
    type Threads = SignalSuspender;
    type Arch = HotPatch;

    fn memory(&self) -> &ProcessMemory {
        &self.memory
    }

    fn threads(&self) -> &SignalSuspender {
        &self.threads
    }

    fn arch(&self) -> &HotPatch {
        &self.arch
    }

    fn routes_thunks(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{
        atomic::{AtomicBool, AtomicU64},
        Arc,
    };

    #[test]
    fn test_protection_of_own_code() {
        let memory = ProcessMemory::new();
        let protection = memory
            .protection(test_protection_of_own_code as usize, 16)
            .expect("protection");
        assert!(protection.is_readable());
        assert!(!protection.is_writable());
    }

    #[test]
    fn test_read_unmapped_fails() {
        let memory = ProcessMemory::new();
        let mut buf = [0u8; 4];
        assert!(memory.read(8, &mut buf).is_err());
    }

    #[test]
    fn test_pages() {
        let memory = ProcessMemory { page_size: 4096 };
        assert_eq!(memory.pages(0x1ffe, 4), (0x1000, 0x2000));
        assert_eq!(memory.pages(0x1000, 7), (0x1000, 0x1000));
    }

    #[test]
    fn test_thread_count_limit() {
        assert!(check_thread_count(MAX_SUSPENDED).is_ok());
        let err = check_thread_count(MAX_SUSPENDED + 1).unwrap_err();
        assert_eq!(err.kind(), Kind::ThreadSuspendFailure);
    }

    #[test]
    fn test_suspend_and_resume_thread() {
        let suspender = SignalSuspender::new().expect("suspender");
        let stop = Arc::new(AtomicBool::new(false));
        let counter = Arc::new(AtomicU64::new(0));
        let (tid_tx, tid_rx) = crossbeam_channel::bounded(1);

        let worker = {
            let stop = Arc::clone(&stop);
            let counter = Arc::clone(&counter);
            thread::spawn(move || {
                tid_tx.send(gettid()).expect("send tid");
                while !stop.load(Ordering::Relaxed) {
                    counter.fetch_add(1, Ordering::Relaxed);
                }
            })
        };
        let tid = tid_rx.recv().expect("tid");

        assert!(suspender.enumerate().expect("enumerate").contains(&tid));
        assert!(!suspender.enumerate().expect("enumerate").contains(&gettid()));

        assert_eq!(suspender.suspend(tid).expect("suspend"), Suspension::Suspended);
        let ip = suspender.instruction_pointer(tid).expect("ip");
        assert_ne!(ip, 0);
        let before = counter.load(Ordering::Relaxed);
        thread::sleep(Duration::from_millis(20));
        assert_eq!(counter.load(Ordering::Relaxed), before);
        suspender.set_instruction_pointer(tid, ip).expect("set ip");
        suspender.resume(tid).expect("resume");

        stop.store(true, Ordering::Relaxed);
        worker.join().expect("join");
        assert!(suspender.resume(tid).is_err());
    }
}
