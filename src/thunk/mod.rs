//! Entry and exit interception.
//!
//! A patched procedure enters `Dispatcher::enter` with the caller's return
//! slot in hand. The dispatcher remembers the real return address on the
//! thread's thunk stack and swaps it for the exit thunk, so the procedure
//! returns into `Dispatcher::leave`, which hands back the real address.

use log::error;
use nix::unistd::Pid;
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use crate::{
    buffer::{Buffer, Consumer},
    diag::{Error, Kind, Result},
    pool::Pool,
    procedure::Procedure,
    stats::{bump, BufferStatistics, Counters, Statistics},
    thread::{Frame, PerThread, Registry},
};

#[cfg(target_arch = "x86_64")]
mod x86_64;

#[cfg(target_arch = "x86_64")]
pub(crate) use x86_64::{bind, unbind};
#[cfg(target_arch = "x86_64")]
pub use x86_64::{entry_thunk, exit_thunk};

/// Registers saved by the thunks.
///
/// `rip` is the procedure being entered (zero on exit) and `rsp` the address
/// of the slot holding the caller's return address.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Context {
    pub rdi: u64,
    pub rsi: u64,
    pub rdx: u64,
    pub rcx: u64,
    pub r8: u64,
    pub r9: u64,
    pub rax: u64,
    pub r10: u64,
    pub r11: u64,
    pub rbx: u64,
    pub rbp: u64,
    pub rip: u64,
    pub rflags: u64,
    pub rsp: u64,
}

impl Context {
    /// Context of a call to `procedure` whose return address is stored at
    /// `return_slot`.
    #[must_use]
    pub fn new(procedure: Procedure, return_slot: *mut usize) -> Self {
        Self {
            rip: procedure.address() as u64,
            rsp: return_slot as u64,
            ..Self::default()
        }
    }

    /// Integer arguments in System V order.
    #[must_use]
    pub fn arguments(&self) -> [u64; 6] {
        [self.rdi, self.rsi, self.rdx, self.rcx, self.r8, self.r9]
    }

    #[must_use]
    pub fn return_value(&self) -> u64 {
        self.rax
    }

    #[allow(clippy::cast_possible_truncation)]
    fn return_slot(&self) -> usize {
        self.rsp as usize
    }
}

/// Why a hooked call ended without going through its exit.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UnwindReason {
    /// Reported through `Dispatcher::unwind`.
    Exception(u32),
    /// Detected because the thread went on below the call's frame.
    Abandoned,
}

/// One traced event, alive for the duration of a callback.
pub struct Event<'a> {
    procedure: Procedure,
    context: Option<&'a Context>,
    current: &'a mut Option<Box<Buffer>>,
    pool: &'a Pool,
    counters: &'a Counters,
    process: Pid,
    thread: Pid,
}

impl<'a> Event<'a> {
    #[must_use]
    pub fn procedure(&self) -> Procedure {
        self.procedure
    }

    /// Registers at entry or exit; `None` for unwind notifications.
    #[must_use]
    pub fn context(&self) -> Option<&'a Context> {
        self.context
    }

    #[must_use]
    pub fn thread(&self) -> Pid {
        self.thread
    }

    /// Reserves `size` bytes in the thread's current buffer. Returns `None`
    /// if `size` exceeds the buffer size or every buffer is in use; the
    /// event should then be dropped.
    pub fn buffer(&mut self, size: usize) -> Option<&mut [u8]> {
        let counters = self.counters;
        let reserved = self
            .pool
            .reserve(&mut *self.current, size, self.process, self.thread);
        if reserved.is_none() {
            bump(&counters.buffer_requests_failed);
        }
        reserved
    }
}

/// User side of tracing. Callbacks run on the traced thread, inside the
/// instrumented call; instrumented procedures they call are not traced.
pub trait Handler: Send + Sync + 'static {
    fn on_entry(&self, event: &mut Event<'_>);

    fn on_exit(&self, event: &mut Event<'_>);

    fn on_unwind(&self, _event: &mut Event<'_>, _reason: UnwindReason) {}
}

fn fatal(message: &str) -> ! {
    error!("{message}");
    std::process::abort();
}

static NEXT_SESSION: AtomicU64 = AtomicU64::new(1);

/// Data path of one initialized engine.
pub struct Dispatcher {
    handler: Box<dyn Handler>,
    consumer: Arc<Consumer>,
    pool: Arc<Pool>,
    registry: Registry,
    counters: Counters,
    exit_thunk: usize,
}

impl Dispatcher {
    #[must_use]
    pub fn new(
        handler: Box<dyn Handler>,
        consumer: Arc<Consumer>,
        pool: Arc<Pool>,
        preallocations: usize,
        lazy: bool,
        exit_thunk: usize,
    ) -> Self {
        Self {
            handler,
            consumer,
            pool,
            registry: Registry::new(
                NEXT_SESSION.fetch_add(1, Ordering::Relaxed),
                preallocations,
                lazy,
            ),
            counters: Counters::default(),
            exit_thunk,
        }
    }

    #[must_use]
    pub fn pool(&self) -> &Arc<Pool> {
        &self.pool
    }

    #[must_use]
    pub fn consumer(&self) -> &Arc<Consumer> {
        &self.consumer
    }

    #[must_use]
    pub fn exit_thunk(&self) -> usize {
        self.exit_thunk
    }

    fn event<'a>(
        &'a self,
        procedure: Procedure,
        context: Option<&'a Context>,
        current: &'a mut Option<Box<Buffer>>,
        thread: Pid,
    ) -> Event<'a> {
        Event {
            procedure,
            context,
            current,
            pool: &self.pool,
            counters: &self.counters,
            process: self.registry.process(),
            thread,
        }
    }

    fn abandon(&self, state: &mut PerThread, frame: Frame, reason: UnwindReason, thread: Pid) {
        bump(&self.counters.exception_unwindings);
        let mut event = self.event(frame.procedure, None, &mut state.current, thread);
        self.handler.on_unwind(&mut event, reason);
    }

    /// Hooks a call: records the frame, redirects its return through the
    /// exit thunk and runs the entry callback. Events that cannot be traced
    /// are counted and the call proceeds unhooked.
    ///
    /// # Safety
    ///
    /// `context.rsp` must point at the live return slot of the call, which
    /// stays valid until the matching `leave`.
    pub unsafe fn enter(&self, context: &mut Context) {
        let Some(record) = self.registry.get_or_create(&self.counters) else {
            return;
        };
        let Some(mut guard) = record.try_lock() else {
            bump(&self.counters.reentrant_thunk_executions);
            return;
        };
        let state = &mut *guard;
        let thread = record.thread();

        let sp = context.return_slot();
        let slot = sp as *mut usize;
        let return_address = slot.read();
        let tail_call = return_address == self.exit_thunk;

        while let Some(stale) = state
            .stack
            .pop_if(|top| top.sp < sp || (top.sp == sp && !tail_call))
        {
            self.abandon(state, stale, UnwindReason::Abandoned, thread);
        }

        #[allow(clippy::cast_possible_truncation)]
        let procedure = Procedure::new(context.rip as usize);
        let frame = Frame {
            sp,
            procedure,
            return_address,
        };
        if !state.stack.push(frame) {
            bump(&self.counters.thunk_stack_exhaustions);
            return;
        }
        slot.write(self.exit_thunk);

        bump(&self.counters.events_captured);
        let mut event = self.event(procedure, Some(&*context), &mut state.current, thread);
        self.handler.on_entry(&mut event);
    }

    /// Unhooks the call returning through `context` and runs the exit
    /// callback. Returns the address the call really returns to.
    ///
    /// Aborts the process if the thread has no matching frame, since the
    /// real return address is lost.
    ///
    /// # Safety
    ///
    /// Must only be called for a return slot previously redirected by
    /// `enter` on the calling thread.
    pub unsafe fn leave(&self, context: &mut Context) -> usize {
        let sp = context.return_slot();
        let Some(record) = self.registry.get_if_available() else {
            fatal("Exit thunk reached by a thread without thread data");
        };
        let mut guard = record.lock();
        let state = &mut *guard;
        let thread = record.thread();

        while let Some(stale) = state.stack.pop_if(|top| top.sp < sp) {
            self.abandon(state, stale, UnwindReason::Abandoned, thread);
        }
        let Some(frame) = state.stack.pop_if(|top| top.sp == sp) else {
            fatal("Exit thunk reached without a matching thunk stack frame");
        };

        bump(&self.counters.events_captured);
        let mut event =
            self.event(frame.procedure, Some(&*context), &mut state.current, thread);
        self.handler.on_exit(&mut event);
        frame.return_address
    }

    /// Reports that an exception with `code` unwinds the calling thread's
    /// stack up to `sp`, ending every hooked call below it. Returns the
    /// number of calls ended. Never allocates.
    pub fn unwind(&self, sp: usize, code: u32) -> usize {
        let Some(record) = self.registry.get_if_available() else {
            return 0;
        };
        let Some(mut guard) = record.try_lock() else {
            return 0;
        };
        let state = &mut *guard;
        let thread = record.thread();

        let mut count = 0;
        while let Some(frame) = state.stack.pop_if(|top| top.sp < sp) {
            self.abandon(state, frame, UnwindReason::Exception(code), thread);
            count += 1;
        }
        count
    }

    /// Depth of the calling thread's thunk stack.
    #[must_use]
    pub fn depth(&self) -> usize {
        self.registry
            .get_if_available()
            .and_then(|record| record.try_lock().map(|state| state.stack.depth()))
            .unwrap_or(0)
    }

    /// Whether the calling thread is inside one of its callbacks.
    #[must_use]
    pub fn in_callback(&self) -> bool {
        self.registry
            .get_if_available()
            .is_some_and(|record| record.is_busy())
    }

    /// Destroys the calling thread's record.
    ///
    /// # Errors
    ///
    /// Returns `InCallback` when called from one of the thread's callbacks.
    pub fn release_current_thread(&self) -> Result<()> {
        if self.in_callback() {
            return Err(Error::new(Kind::InCallback));
        }
        self.registry.release_current(&self.pool, &self.counters);
        Ok(())
    }

    /// Destroys every thread record and delivers every pending buffer to
    /// the consumer.
    pub fn flush(&self) -> usize {
        self.registry.release_all(&self.pool, &self.counters);
        self.pool.collect_all(&*self.consumer)
    }

    #[must_use]
    pub fn statistics(&self, patch_count: usize) -> Statistics {
        self.counters.snapshot(
            patch_count,
            BufferStatistics {
                free: self.pool.free_count(),
                dirty: self.pool.dirty_count(),
                collected: self.pool.collected(),
            },
            self.registry.spare_count(),
        )
    }
}
