use nix::unistd::Pid;

#[cfg(debug_assertions)]
const SENTINEL: [u8; 4] = [0xef, 0xbe, 0xad, 0xde];
#[cfg(debug_assertions)]
const SENTINEL_SIZE: usize = SENTINEL.len();
#[cfg(not(debug_assertions))]
const SENTINEL_SIZE: usize = 0;

/// Consumer of filled buffers.
pub type Consumer = dyn Fn(&Chunk<'_>) + Send + Sync;

/// Contents of one filled buffer, as handed to a consumer.
#[derive(Debug, Clone, Copy)]
pub struct Chunk<'a> {
    data: &'a [u8],
    process: Pid,
    thread: Pid,
}

impl<'a> Chunk<'a> {
    #[must_use]
    pub fn data(&self) -> &'a [u8] {
        self.data
    }

    #[must_use]
    pub fn process(&self) -> Pid {
        self.process
    }

    /// Thread whose events filled the buffer.
    #[must_use]
    pub fn thread(&self) -> Pid {
        self.thread
    }
}

/// Fixed capacity event storage, owned by exactly one of the free list, the
/// dirty list or a thread's current-buffer slot.
///
/// Debug builds keep a sentinel right past the used bytes and check it
/// whenever the buffer is about to grow or be consumed.
pub struct Buffer {
    data: Box<[u8]>,
    capacity: usize,
    used: usize,
    process: Pid,
    thread: Pid,
}

impl Buffer {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let mut buffer = Self {
            data: vec![0; capacity + SENTINEL_SIZE].into_boxed_slice(),
            capacity,
            used: 0,
            process: Pid::from_raw(0),
            thread: Pid::from_raw(0),
        };
        buffer.write_sentinel();
        buffer
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[must_use]
    pub fn used(&self) -> usize {
        self.used
    }

    #[must_use]
    pub fn remaining(&self) -> usize {
        self.capacity - self.used
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.used == 0
    }

    /// Records the thread that is about to fill the buffer.
    pub fn assign(&mut self, process: Pid, thread: Pid) {
        self.process = process;
        self.thread = thread;
    }

    /// Carves `size` bytes off the free space, or returns `None` if they do
    /// not fit.
    pub fn allocate(&mut self, size: usize) -> Option<&mut [u8]> {
        self.check_sentinel();
        if size > self.remaining() {
            return None;
        }

        let start = self.used;
        self.used += size;
        self.write_sentinel();
        Some(&mut self.data[start..start + size])
    }

    #[must_use]
    pub fn chunk(&self) -> Chunk<'_> {
        self.check_sentinel();
        Chunk {
            data: &self.data[..self.used],
            process: self.process,
            thread: self.thread,
        }
    }

    pub fn reset(&mut self) {
        self.used = 0;
        self.write_sentinel();
    }

    #[cfg(debug_assertions)]
    fn write_sentinel(&mut self) {
        self.data[self.used..self.used + SENTINEL_SIZE].copy_from_slice(&SENTINEL);
    }

    #[cfg(not(debug_assertions))]
    #[allow(clippy::unused_self)]
    fn write_sentinel(&mut self) {}

    #[cfg(debug_assertions)]
    fn check_sentinel(&self) {
        if self.data[self.used..self.used + SENTINEL_SIZE] != SENTINEL {
            log::error!(
                "Buffer of thread {} overrun past {} bytes, memory is corrupted",
                self.thread,
                self.used
            );
            std::process::abort();
        }
    }

    #[cfg(not(debug_assertions))]
    #[allow(clippy::unused_self)]
    fn check_sentinel(&self) {}
}
