//! Per-thread tracing state.
//!
//! Each traced thread owns one `ThreadData` record holding its thunk stack
//! and its current buffer. The record is only touched by its thread, except
//! at teardown; a busy flag serializes the two and doubles as the marker of
//! a callback in progress.

use log::{debug, warn};
use nix::unistd::{getpid, gettid, Pid};
use parking_lot::Mutex;
use std::{
    cell::{RefCell, UnsafeCell},
    hint,
    ops::{Deref, DerefMut},
    sync::{
        atomic::{AtomicBool, AtomicI32, Ordering},
        Arc,
    },
};

use crate::{
    buffer::Buffer,
    pool::Pool,
    procedure::Procedure,
    stats::{bump, Counters},
};

pub const THUNK_STACK_CAPACITY: usize = 256;

/// One hooked call in progress.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Frame {
    /// Address of the slot holding the caller's return address.
    pub sp: usize,
    pub procedure: Procedure,
    pub return_address: usize,
}

/// Bounded LIFO of hooked calls. Never reallocates.
pub struct ThunkStack {
    frames: Vec<Frame>,
}

impl Default for ThunkStack {
    fn default() -> Self {
        Self {
            frames: Vec::with_capacity(THUNK_STACK_CAPACITY),
        }
    }
}

impl ThunkStack {
    /// Returns `false` and drops `frame` when the stack is full.
    #[must_use]
    pub fn push(&mut self, frame: Frame) -> bool {
        if self.is_full() {
            return false;
        }
        self.frames.push(frame);
        true
    }

    pub fn pop(&mut self) -> Option<Frame> {
        self.frames.pop()
    }

    /// Pops the top frame if `predicate` holds for it.
    pub fn pop_if(&mut self, predicate: impl FnOnce(&Frame) -> bool) -> Option<Frame> {
        match self.frames.last() {
            Some(top) if predicate(top) => self.frames.pop(),
            _ => None,
        }
    }

    #[must_use]
    pub fn top(&self) -> Option<&Frame> {
        self.frames.last()
    }

    #[must_use]
    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    #[must_use]
    pub fn is_full(&self) -> bool {
        self.frames.len() >= THUNK_STACK_CAPACITY
    }

    pub fn clear(&mut self) {
        self.frames.clear();
    }
}

#[derive(Default)]
pub struct PerThread {
    pub stack: ThunkStack,
    pub current: Option<Box<Buffer>>,
}

pub struct ThreadData {
    thread: AtomicI32,
    preallocated: bool,
    busy: AtomicBool,
    retired: AtomicBool,
    state: UnsafeCell<PerThread>,
}

// SAFETY: `state` is only reached through a `Guard`, which holds `busy`.
unsafe impl Sync for ThreadData {}

impl ThreadData {
    fn new(preallocated: bool) -> Self {
        Self {
            thread: AtomicI32::new(0),
            preallocated,
            busy: AtomicBool::new(false),
            retired: AtomicBool::new(false),
            state: UnsafeCell::new(PerThread::default()),
        }
    }

    #[must_use]
    pub fn thread(&self) -> Pid {
        Pid::from_raw(self.thread.load(Ordering::Relaxed))
    }

    /// Whether a callback or a teardown currently owns the record.
    #[must_use]
    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    fn is_retired(&self) -> bool {
        self.retired.load(Ordering::Acquire)
    }

    /// Takes the record unless it is already taken.
    #[must_use]
    pub fn try_lock(&self) -> Option<Guard<'_>> {
        self.busy
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .ok()
            .map(|_| Guard { data: self })
    }

    /// Spins until the record is free. Only contended while a teardown
    /// flushes the record.
    pub fn lock(&self) -> Guard<'_> {
        loop {
            if let Some(guard) = self.try_lock() {
                return guard;
            }
            hint::spin_loop();
        }
    }
}

pub struct Guard<'a> {
    data: &'a ThreadData,
}

impl Deref for Guard<'_> {
    type Target = PerThread;

    fn deref(&self) -> &PerThread {
        // SAFETY: the guard holds the busy flag.
        unsafe { &*self.data.state.get() }
    }
}

impl DerefMut for Guard<'_> {
    fn deref_mut(&mut self) -> &mut PerThread {
        // SAFETY: the guard holds the busy flag.
        unsafe { &mut *self.data.state.get() }
    }
}

impl Drop for Guard<'_> {
    fn drop(&mut self) {
        self.data.busy.store(false, Ordering::Release);
    }
}

thread_local! {
    static RECORDS: RefCell<Vec<(u64, Arc<ThreadData>)>> = const { RefCell::new(Vec::new()) };
}

fn cached(session: u64) -> Option<Arc<ThreadData>> {
    RECORDS
        .try_with(|records| {
            records
                .try_borrow()
                .ok()?
                .iter()
                .find(|(id, _)| *id == session)
                .map(|(_, record)| Arc::clone(record))
        })
        .ok()
        .flatten()
}

fn uncache(session: u64) {
    let _ = RECORDS.try_with(|records| {
        if let Ok(mut records) = records.try_borrow_mut() {
            records.retain(|(id, _)| *id != session);
        }
    });
}

/// Every thread data record of one session.
pub struct Registry {
    session: u64,
    process: Pid,
    lazy: bool,
    live: Mutex<Vec<Arc<ThreadData>>>,
    spare: Mutex<Vec<Arc<ThreadData>>>,
}

impl Registry {
    /// Creates `preallocations` spare records. When `lazy` is false, records
    /// are only ever taken from those.
    #[must_use]
    pub fn new(session: u64, preallocations: usize, lazy: bool) -> Self {
        Self {
            session,
            process: getpid(),
            lazy,
            live: Mutex::new(Vec::new()),
            spare: Mutex::new(
                (0..preallocations)
                    .map(|_| Arc::new(ThreadData::new(true)))
                    .collect(),
            ),
        }
    }

    #[must_use]
    pub fn process(&self) -> Pid {
        self.process
    }

    /// Record of the calling thread, if it has one. Never allocates.
    #[must_use]
    pub fn get_if_available(&self) -> Option<Arc<ThreadData>> {
        cached(self.session)
    }

    /// Record of the calling thread, created on first use. Returns `None`
    /// when neither a spare record nor lazy allocation is available, or
    /// when the thread is exiting.
    pub fn get_or_create(&self, counters: &Counters) -> Option<Arc<ThreadData>> {
        if let Some(record) = cached(self.session) {
            return Some(record);
        }

        let spare = self.spare.lock().pop();
        let record = match spare {
            Some(record) => record,
            None if self.lazy => Arc::new(ThreadData::new(false)),
            None => {
                bump(&counters.failed_preallocation_pool_allocations);
                return None;
            }
        };
        record.thread.store(gettid().as_raw(), Ordering::Relaxed);
        record.retired.store(false, Ordering::Release);

        let registered = RECORDS
            .try_with(|records| {
                let mut records = records.try_borrow_mut().ok()?;
                records.retain(|(_, r)| !r.is_retired());
                records.push((self.session, Arc::clone(&record)));
                Some(())
            })
            .ok()
            .flatten();
        if registered.is_none() {
            self.recycle(record);
            return None;
        }

        self.live.lock().push(Arc::clone(&record));
        Some(record)
    }

    fn recycle(&self, record: Arc<ThreadData>) {
        if record.preallocated {
            self.spare.lock().push(record);
        }
    }

    fn flush(record: &ThreadData, pool: &Pool, counters: &Counters) {
        let mut state = record.lock();
        if let Some(buffer) = state.current.take() {
            pool.retire(buffer);
        }
        if !state.stack.is_empty() {
            warn!(
                "Thread {} released with {} hooked call(s) in progress",
                record.thread(),
                state.stack.depth()
            );
            state.stack.clear();
        }
        bump(&counters.thread_teardowns);
    }

    /// Destroys the calling thread's record. Returns `false` if it had none.
    ///
    /// Must not be called from a callback of the same thread.
    pub fn release_current(&self, pool: &Pool, counters: &Counters) -> bool {
        let Some(record) = cached(self.session) else {
            return false;
        };

        uncache(self.session);
        self.live.lock().retain(|r| !Arc::ptr_eq(r, &record));
        Self::flush(&record, pool, counters);
        debug!("Released thread data of {}", record.thread());
        self.recycle(record);
        true
    }

    /// Destroys every record, handing current buffers to the dirty list.
    pub fn release_all(&self, pool: &Pool, counters: &Counters) {
        let live = std::mem::take(&mut *self.live.lock());
        for record in &live {
            Self::flush(record, pool, counters);
            record.retired.store(true, Ordering::Release);
        }
        for record in self.spare.lock().iter() {
            record.retired.store(true, Ordering::Release);
        }
        uncache(self.session);
        debug!("Released thread data of {} thread(s)", live.len());
    }

    #[must_use]
    pub fn live_count(&self) -> usize {
        self.live.lock().len()
    }

    #[must_use]
    pub fn spare_count(&self) -> usize {
        self.spare.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{sync::atomic::AtomicU64, thread};

    static NEXT: AtomicU64 = AtomicU64::new(1 << 32);

    fn session() -> u64 {
        NEXT.fetch_add(1, Ordering::Relaxed)
    }

    fn frame(sp: usize) -> Frame {
        Frame {
            sp,
            procedure: Procedure::new(0x1000),
            return_address: 0x2000,
        }
    }

    #[test]
    fn test_thunk_stack_capacity() {
        let mut stack = ThunkStack::default();
        for i in 0..THUNK_STACK_CAPACITY {
            assert!(stack.push(frame(i)));
        }
        assert!(stack.is_full());
        assert!(!stack.push(frame(0)));
        assert_eq!(stack.depth(), THUNK_STACK_CAPACITY);

        assert_eq!(stack.pop_if(|f| f.sp == 0), None);
        assert_eq!(stack.pop_if(|f| f.sp == THUNK_STACK_CAPACITY - 1), Some(frame(255)));
    }

    #[test]
    fn test_guard_excludes() {
        let record = ThreadData::new(false);
        let guard = record.try_lock().expect("lock");
        assert!(record.is_busy());
        assert!(record.try_lock().is_none());
        drop(guard);
        assert!(!record.is_busy());
    }

    #[test]
    fn test_get_or_create_is_per_thread() {
        let registry = Arc::new(Registry::new(session(), 0, true));
        let counters = Arc::new(Counters::default());

        let mine = registry.get_or_create(&counters).expect("record");
        let again = registry.get_or_create(&counters).expect("record");
        assert!(Arc::ptr_eq(&mine, &again));
        assert_eq!(mine.thread(), gettid());

        let theirs = {
            let registry = Arc::clone(&registry);
            let counters = Arc::clone(&counters);
            thread::spawn(move || registry.get_or_create(&counters).expect("record").thread())
                .join()
                .expect("join")
        };
        assert_ne!(theirs, gettid());
        assert_eq!(registry.live_count(), 2);
    }

    #[test]
    fn test_preallocation_only() {
        let registry = Registry::new(session(), 1, false);
        let counters = Counters::default();
        let pool = Pool::new(1, 8, None);

        assert!(registry.get_if_available().is_none());
        registry.get_or_create(&counters).expect("spare record");
        assert_eq!(registry.spare_count(), 0);

        assert!(registry.release_current(&pool, &counters));
        assert_eq!(registry.spare_count(), 1);
        assert_eq!(counters.thread_teardowns.load(Ordering::Relaxed), 1);

        let other = thread::scope(|scope| {
            scope
                .spawn(|| {
                    let first = registry.get_or_create(&counters).is_some();
                    let second = thread::scope(|inner| {
                        inner
                            .spawn(|| registry.get_or_create(&counters).is_some())
                            .join()
                            .expect("join")
                    });
                    (first, second)
                })
                .join()
                .expect("join")
        });
        assert_eq!(other, (true, false));
        assert_eq!(
            counters
                .failed_preallocation_pool_allocations
                .load(Ordering::Relaxed),
            1
        );
    }

    #[test]
    fn test_release_hands_buffer_to_dirty_list() {
        let registry = Registry::new(session(), 0, true);
        let counters = Counters::default();
        let pool = Pool::new(2, 8, None);

        let record = registry.get_or_create(&counters).expect("record");
        {
            let mut state = record.lock();
            pool.reserve(&mut state.current, 4, registry.process(), record.thread())
                .expect("reserve");
        }

        registry.release_all(&pool, &counters);
        assert_eq!(pool.dirty_count(), 1);
        assert_eq!(pool.free_count(), 1);
        assert_eq!(registry.live_count(), 0);
        assert!(registry.get_if_available().is_none());
    }
}
