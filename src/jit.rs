//! Executable pages holding hot-patchable x86-64 routines.
//!
//! Every routine is laid out the way hot-patch aware compilers emit them:
//! `int3` padding, an `xchg %ax, %ax` no-op, then the body.

use log::debug;
use nix::errno::Errno;
use std::{ffi::c_void, mem, ptr};

use crate::{
    diag::{Error, Kind, Result},
    procedure::Procedure,
};

const PAGE_SIZE: usize = 4096;
const ALIGNMENT: usize = 16;
const PADDING: [u8; 5] = [0xcc; 5];
const PROLOG: [u8; 2] = [0x66, 0x90];
// Mapping hints tried around the target, in bytes.
const HINT_STEP: usize = 64 << 20;
const HINT_ATTEMPTS: usize = 16;

/// `lea rax, [rdi + rsi]; ret`
pub const ADD: &[u8] = &[0x48, 0x8d, 0x04, 0x37, 0xc3];

/// `mov rax, rdi; ret`
pub const IDENTITY: &[u8] = &[0x48, 0x89, 0xf8, 0xc3];

/// Calls `rdi` twice, first on `rsi`, then on the first result.
pub const CALL_TWICE: &[u8] = &[
    0x53, // push rbx
    0x48, 0x89, 0xfb, // mov rbx, rdi
    0x48, 0x89, 0xf7, // mov rdi, rsi
    0xff, 0xd3, // call rbx
    0x48, 0x89, 0xc7, // mov rdi, rax
    0xff, 0xd3, // call rbx
    0x5b, // pop rbx
    0xc3, // ret
];

/// Tail calls `rdi` on `rsi`.
pub const TAIL_CALL: &[u8] = &[
    0x48, 0x89, 0xf8, // mov rax, rdi
    0x48, 0x89, 0xf7, // mov rdi, rsi
    0xff, 0xe0, // jmp rax
];

/// Counts down `rdi` by calling itself through its own entry point.
pub const RECURSE: &[u8] = &[
    0x48, 0x85, 0xff, // test rdi, rdi
    0x74, 0x10, // jz done
    0x53, // push rbx
    0x48, 0x8d, 0x7f, 0xff, // lea rdi, [rdi - 1]
    0xe8, 0xef, 0xff, 0xff, 0xff, // call <entry>
    0x5b, // pop rbx
    0x48, 0x8d, 0x40, 0x01, // lea rax, [rax + 1]
    0xc3, // ret
    0x31, 0xc0, // done: xor eax, eax
    0xc3, // ret
];

fn distance(a: usize, b: usize) -> usize {
    a.abs_diff(b)
}

/// Anonymous mapping filled with routines, then sealed read-execute.
pub struct CodePage {
    base: *mut u8,
    len: usize,
    used: usize,
    sealed: bool,
}

// SAFETY: the page is plain memory owned by this value.
unsafe impl Send for CodePage {}
// SAFETY: shared access is read-only once sealed.
unsafe impl Sync for CodePage {}

impl CodePage {
    fn map(hint: usize, len: usize) -> Result<*mut u8> {
        // SAFETY: anonymous private mapping, no existing memory is touched.
        let addr = unsafe {
            libc::mmap(
                hint as *mut c_void,
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if addr == libc::MAP_FAILED {
            return Err(Errno::last().into());
        }
        Ok(addr.cast())
    }

    fn unmap(base: *mut u8, len: usize) {
        // SAFETY: `base` was returned by mmap for `len` bytes.
        unsafe { libc::munmap(base.cast(), len) };
    }

    /// Maps `len` bytes within `reach` of `near`, so that rel32 branches
    /// between them can be encoded.
    ///
    /// # Errors
    ///
    /// Returns `ProcTooFar` if no mapping close enough was found.
    pub fn near(near: usize, len: usize, reach: usize) -> Result<Self> {
        let len = len.div_ceil(PAGE_SIZE) * PAGE_SIZE;
        let origin = near & !(PAGE_SIZE - 1);

        for attempt in 1..=HINT_ATTEMPTS {
            for hint in [
                origin.checked_add(attempt * HINT_STEP),
                origin.checked_sub(attempt * HINT_STEP),
            ]
            .into_iter()
            .flatten()
            {
                let base = Self::map(hint, len)?;
                let end = base as usize + len;
                if distance(base as usize, near) < reach && distance(end, near) < reach {
                    debug!("Code page mapped at {base:p}");
                    return Ok(Self {
                        base,
                        len,
                        used: 0,
                        sealed: false,
                    });
                }
                Self::unmap(base, len);
            }
        }

        Err(Error::new(Kind::ProcTooFar).with_detail("no code page near the thunks"))
    }

    /// Appends a routine and returns its entry point.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` once sealed, `OutOfMemory` if the page is
    /// full.
    pub fn emit(&mut self, body: &[u8]) -> Result<Procedure> {
        if self.sealed {
            return Err(Error::new(Kind::InvalidArgument).with_detail("code page is sealed"));
        }

        // Padding ends where the aligned entry point starts.
        let entry = (self.used + PADDING.len()).next_multiple_of(ALIGNMENT);
        let start = entry - PADDING.len();
        let end = entry + PROLOG.len() + body.len();
        if end > self.len {
            return Err(Error::new(Kind::OutOfMemory));
        }

        // SAFETY: `start..end` is inside the writable mapping.
        unsafe {
            let dst = self.base.add(start);
            ptr::write_bytes(self.base.add(self.used), 0xcc, start - self.used);
            ptr::copy_nonoverlapping(PADDING.as_ptr(), dst, PADDING.len());
            ptr::copy_nonoverlapping(PROLOG.as_ptr(), dst.add(PADDING.len()), PROLOG.len());
            ptr::copy_nonoverlapping(body.as_ptr(), self.base.add(entry + PROLOG.len()), body.len());
        }
        self.used = end;

        Ok(Procedure::new(self.base as usize + entry))
    }

    /// Makes the page read-execute.
    ///
    /// # Errors
    ///
    /// Returns an `Err` if `mprotect` fails.
    pub fn seal(&mut self) -> Result<()> {
        // SAFETY: the whole mapping is owned by this value.
        let ret = unsafe {
            libc::mprotect(self.base.cast(), self.len, libc::PROT_READ | libc::PROT_EXEC)
        };
        Errno::result(ret)?;
        self.sealed = true;
        Ok(())
    }

    #[must_use]
    pub fn contains(&self, procedure: Procedure) -> bool {
        (self.base as usize..self.base as usize + self.len).contains(&procedure.address())
    }
}

impl Drop for CodePage {
    fn drop(&mut self) {
        Self::unmap(self.base, self.len);
    }
}

/// A sealed page with one routine of each sample shape.
pub struct Samples {
    page: CodePage,
    pub add: Procedure,
    pub call_twice: Procedure,
    pub tail_call: Procedure,
    pub recurse: Procedure,
    pub identity: Procedure,
}

impl Samples {
    /// # Errors
    ///
    /// Returns an `Err` if the page cannot be mapped near `near` or sealed.
    pub fn assemble(near: usize) -> Result<Self> {
        let mut page = CodePage::near(near, PAGE_SIZE, i32::MAX as usize)?;
        let add = page.emit(ADD)?;
        let call_twice = page.emit(CALL_TWICE)?;
        let tail_call = page.emit(TAIL_CALL)?;
        let recurse = page.emit(RECURSE)?;
        let identity = page.emit(IDENTITY)?;
        page.seal()?;

        Ok(Self {
            page,
            add,
            call_twice,
            tail_call,
            recurse,
            identity,
        })
    }

    #[must_use]
    pub fn procedures(&self) -> [Procedure; 5] {
        [
            self.add,
            self.call_twice,
            self.tail_call,
            self.recurse,
            self.identity,
        ]
    }

    fn function<F: Copy>(&self, procedure: Procedure) -> F {
        debug_assert!(self.page.contains(procedure));
        debug_assert_eq!(mem::size_of::<F>(), mem::size_of::<usize>());
        // SAFETY: `procedure` is a sealed routine of this page whose
        // signature matches `F` at every call site below.
        unsafe { mem::transmute_copy(&procedure.address()) }
    }

    #[must_use]
    pub fn add(&self, a: u64, b: u64) -> u64 {
        self.function::<extern "C" fn(u64, u64) -> u64>(self.add)(a, b)
    }

    /// Calls `f` through the `call_twice` routine.
    #[must_use]
    pub fn call_twice(&self, f: extern "C" fn(u64) -> u64, x: u64) -> u64 {
        self.function::<extern "C" fn(extern "C" fn(u64) -> u64, u64) -> u64>(self.call_twice)(
            f, x,
        )
    }

    /// Calls `f` through the `tail_call` routine.
    #[must_use]
    pub fn tail_call(&self, f: extern "C" fn(u64) -> u64, x: u64) -> u64 {
        self.function::<extern "C" fn(extern "C" fn(u64) -> u64, u64) -> u64>(self.tail_call)(
            f, x,
        )
    }

    #[must_use]
    pub fn recurse(&self, depth: u64) -> u64 {
        self.function::<extern "C" fn(u64) -> u64>(self.recurse)(depth)
    }

    #[must_use]
    pub fn identity(&self, x: u64) -> u64 {
        self.function::<extern "C" fn(u64) -> u64>(self.identity)(x)
    }

    /// Entry point of `recurse` as a callable, for use with `call_twice`.
    #[must_use]
    pub fn recurse_fn(&self) -> extern "C" fn(u64) -> u64 {
        self.function(self.recurse)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asm::Parser;

    fn samples() -> Samples {
        Samples::assemble(samples as usize).expect("samples")
    }

    #[test]
    fn test_samples_run() {
        let samples = samples();
        assert_eq!(samples.add(2, 40), 42);
        assert_eq!(samples.recurse(10), 10);
        assert_eq!(samples.call_twice(samples.recurse_fn(), 7), 7);
        assert_eq!(samples.tail_call(samples.recurse_fn(), 3), 3);
        assert_eq!(samples.identity(0x1_0000_0005), 0x1_0000_0005);
    }

    #[test]
    fn test_emit_layout() {
        let samples = samples();
        let parser = Parser::new().expect("parser");
        for procedure in samples.procedures() {
            assert_eq!(procedure.address() % ALIGNMENT, 0);
            let mut bytes = [0u8; 7];
            // SAFETY: the padding and prolog are inside the sealed page.
            unsafe {
                ptr::copy_nonoverlapping(
                    (procedure.address() - 5) as *const u8,
                    bytes.as_mut_ptr(),
                    7,
                );
            }
            assert_eq!(&bytes[..5], &PADDING);
            let prolog = parser
                .get_instruction_from(&bytes[5..], procedure.address() as u64)
                .expect("prolog");
            assert!(prolog.is_register_nop());
        }
    }

    #[test]
    fn test_emit_after_seal() {
        let mut page = CodePage::near(test_emit_after_seal as usize, PAGE_SIZE, i32::MAX as usize)
            .expect("page");
        page.emit(ADD).expect("emit");
        page.seal().expect("seal");
        assert_eq!(page.emit(ADD).unwrap_err().kind(), Kind::InvalidArgument);
    }

    #[test]
    fn test_emit_full_page() {
        let mut page = CodePage::near(test_emit_full_page as usize, PAGE_SIZE, i32::MAX as usize)
            .expect("page");
        let err = page.emit(&[0x90; PAGE_SIZE]).unwrap_err();
        assert_eq!(err.kind(), Kind::OutOfMemory);
    }
}
