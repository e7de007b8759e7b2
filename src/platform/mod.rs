use nix::unistd::Pid;

use crate::{arch::Trampoline, diag::Result};

// Methods returning a bare `nix::Result` may run while other threads are
// suspended and must not allocate.

#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
pub mod linux;
pub mod mock;

/// Page protection bits, as understood by `mprotect`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Protection(i32);

impl Protection {
    pub const NONE: Self = Self(libc::PROT_NONE);
    pub const READ_EXECUTE: Self = Self(libc::PROT_READ | libc::PROT_EXEC);
    pub const READ_WRITE_EXECUTE: Self =
        Self(libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC);

    #[must_use]
    pub const fn from_bits(bits: i32) -> Self {
        Self(bits)
    }

    #[must_use]
    pub const fn bits(self) -> i32 {
        self.0
    }

    #[must_use]
    pub const fn is_readable(self) -> bool {
        self.0 & libc::PROT_READ != 0
    }

    #[must_use]
    pub const fn is_writable(self) -> bool {
        self.0 & libc::PROT_WRITE != 0
    }
}

/// Access to the code of the traced process.
pub trait CodeMemory: Send + Sync {
    /// # Errors
    ///
    /// Returns an `Err` if the range is not mapped readable.
    fn read(&self, addr: usize, buf: &mut [u8]) -> Result<()>;

    /// Current protection of the pages spanning `addr..addr + len`.
    ///
    /// # Errors
    ///
    /// Returns an `Err` if the range is not mapped.
    fn protection(&self, addr: usize, len: usize) -> Result<Protection>;

    /// # Errors
    ///
    /// Returns an `Err` if the protection change is refused.
    fn set_protection(
        &self,
        addr: usize,
        len: usize,
        protection: Protection,
    ) -> nix::Result<()>;

    /// Writes `bytes` at `addr`; the range must currently be writable. The
    /// last two bytes are stored with a single store.
    ///
    /// # Errors
    ///
    /// Returns an `Err` if the range is not writable.
    fn write(&self, addr: usize, bytes: &[u8]) -> nix::Result<()>;

    fn flush_icache(&self, addr: usize, len: usize);
}

/// Outcome of a suspension request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Suspension {
    Suspended,
    /// The thread terminated between enumeration and suspension.
    Exited,
}

/// Privileged control over the other threads of the traced process.
pub trait ThreadControl: Send + Sync {
    /// Lists every thread of the process except the calling one.
    ///
    /// # Errors
    ///
    /// Returns an `Err` if the thread list cannot be obtained.
    fn enumerate(&self) -> Result<Vec<Pid>>;

    /// # Errors
    ///
    /// Returns an `Err` if a live thread could not be stopped.
    fn suspend(&self, thread: Pid) -> nix::Result<Suspension>;

    /// # Errors
    ///
    /// Returns an `Err` if `thread` is not suspended.
    fn instruction_pointer(&self, thread: Pid) -> nix::Result<usize>;

    /// # Errors
    ///
    /// Returns an `Err` if `thread` is not suspended or its context cannot
    /// be written.
    fn set_instruction_pointer(&self, thread: Pid, ip: usize) -> nix::Result<()>;

    /// # Errors
    ///
    /// Returns an `Err` if `thread` was not suspended by this object.
    fn resume(&self, thread: Pid) -> nix::Result<()>;
}

/// Everything the engine needs from the machine it runs on.
pub trait Platform: Send + Sync + 'static {
    type Memory: CodeMemory;
    type Threads: ThreadControl;
    type Arch: Trampoline;

    fn memory(&self) -> &Self::Memory;
    fn threads(&self) -> &Self::Threads;
    fn arch(&self) -> &Self::Arch;

    /// Whether patched code enters the process-wide assembly thunks, in
    /// which case an initialized engine claims the dispatch slot.
    fn routes_thunks(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protection_bits() {
        assert!(Protection::READ_EXECUTE.is_readable());
        assert!(!Protection::READ_EXECUTE.is_writable());
        assert!(Protection::READ_WRITE_EXECUTE.is_writable());
        assert!(!Protection::NONE.is_readable());
        assert_eq!(
            Protection::from_bits(Protection::READ_EXECUTE.bits()),
            Protection::READ_EXECUTE
        );
    }
}
