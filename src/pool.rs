use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TryRecvError};
use nix::unistd::Pid;
use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

use crate::buffer::{Buffer, Chunk};

/// Free and dirty buffer queues.
///
/// Both queues are bounded by the buffer count and every buffer lives on
/// exactly one of them or in a thread's current-buffer slot, so pushes
/// never block.
pub struct Pool {
    buffer_size: usize,
    buffer_count: usize,
    free: (Sender<Box<Buffer>>, Receiver<Box<Buffer>>),
    dirty: (Sender<Box<Buffer>>, Receiver<Box<Buffer>>),
    wake: Option<Sender<()>>,
    collected: AtomicU64,
}

impl Pool {
    /// Creates `buffer_count` free buffers. A token is posted on `wake`
    /// whenever a buffer turns dirty.
    #[must_use]
    pub fn new(buffer_count: usize, buffer_size: usize, wake: Option<Sender<()>>) -> Self {
        let free = bounded(buffer_count);
        for _ in 0..buffer_count {
            let _ = free.0.try_send(Box::new(Buffer::new(buffer_size)));
        }

        Self {
            buffer_size,
            buffer_count,
            free,
            dirty: bounded(buffer_count),
            wake,
            collected: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    #[must_use]
    pub fn buffer_count(&self) -> usize {
        self.buffer_count
    }

    #[must_use]
    pub fn free_count(&self) -> usize {
        self.free.1.len()
    }

    #[must_use]
    pub fn dirty_count(&self) -> usize {
        self.dirty.1.len()
    }

    /// Buffers handed to a consumer so far.
    #[must_use]
    pub fn collected(&self) -> u64 {
        self.collected.load(Ordering::Relaxed)
    }

    /// Reserves `size` bytes in the thread's current buffer, switching to a
    /// fresh free buffer when the current one is missing or too full.
    ///
    /// Returns `None` when `size` exceeds the buffer size or no free buffer
    /// is left; the caller drops the event.
    pub fn reserve<'a>(
        &self,
        current: &'a mut Option<Box<Buffer>>,
        size: usize,
        process: Pid,
        thread: Pid,
    ) -> Option<&'a mut [u8]> {
        if size > self.buffer_size {
            return None;
        }

        if !current.as_ref().is_some_and(|buffer| buffer.remaining() >= size) {
            if let Some(full) = current.take() {
                self.retire(full);
            }

            let mut fresh = self.free.1.try_recv().ok()?;
            fresh.assign(process, thread);
            *current = Some(fresh);
        }

        current.as_mut()?.allocate(size)
    }

    /// Takes a buffer back from a current-buffer slot.
    pub fn retire(&self, buffer: Box<Buffer>) {
        if buffer.is_empty() {
            let _ = self.free.0.try_send(buffer);
            return;
        }

        let _ = self.dirty.0.try_send(buffer);
        if let Some(wake) = &self.wake {
            let _ = wake.try_send(());
        }
    }

    /// Pops one dirty buffer, waiting up to `timeout`. A zero timeout never
    /// blocks.
    #[must_use]
    pub fn pull(&self, timeout: Duration) -> Option<Box<Buffer>> {
        if timeout.is_zero() {
            return match self.dirty.1.try_recv() {
                Ok(buffer) => Some(buffer),
                Err(TryRecvError::Empty | TryRecvError::Disconnected) => None,
            };
        }

        match self.dirty.1.recv_timeout(timeout) {
            Ok(buffer) => Some(buffer),
            Err(RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected) => None,
        }
    }

    /// Hands `buffer` to `consumer`, then recycles it.
    pub fn consume(&self, mut buffer: Box<Buffer>, consumer: impl FnOnce(&Chunk<'_>)) {
        consumer(&buffer.chunk());
        buffer.reset();
        self.collected.fetch_add(1, Ordering::Relaxed);
        let _ = self.free.0.try_send(buffer);
    }

    /// Consumes dirty buffers until the dirty list is empty.
    pub fn collect_all(&self, consumer: &(impl Fn(&Chunk<'_>) + ?Sized)) -> usize {
        let mut count = 0;
        while let Ok(buffer) = self.dirty.1.try_recv() {
            self.consume(buffer, consumer);
            count += 1;
        }
        count
    }
}
