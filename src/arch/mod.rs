use std::{fmt, ops::Range};

use crate::{
    diag::{Error, Kind, Result},
    procedure::Procedure,
};

pub mod x86_64;

/// Upper bound on the number of bytes a single patch may rewrite.
pub const MAX_PATCH_SIZE: usize = 16;

/// Machine code of fixed, small size.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct PatchCode {
    len: usize,
    bytes: [u8; MAX_PATCH_SIZE],
}

impl PatchCode {
    /// # Errors
    ///
    /// Returns `InvalidArgument` if `code` is longer than `MAX_PATCH_SIZE`.
    pub fn new(code: &[u8]) -> Result<Self> {
        if code.len() > MAX_PATCH_SIZE {
            return Err(Error::new(Kind::InvalidArgument).with_detail("patch too large"));
        }

        let mut bytes = [0; MAX_PATCH_SIZE];
        bytes[..code.len()].copy_from_slice(code);
        Ok(Self {
            len: code.len(),
            bytes,
        })
    }

    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.bytes[..self.len]
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl fmt::Debug for PatchCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.as_slice() {
            write!(f, "{byte:02x} ")?;
        }
        Ok(())
    }
}

/// Instruction-set specific half of the patching engine.
///
/// An implementation decides which bytes around a procedure get rewritten,
/// whether the original bytes have a shape that can be patched, what the
/// redirect looks like, and where a thread caught inside a half-executed
/// redirect has to continue once the original bytes are back.
pub trait Trampoline: Send + Sync {
    /// Code range rewritten when `procedure` is patched.
    fn region(&self, procedure: Procedure) -> Option<Range<usize>>;

    /// Checks the original bytes of `region(procedure)`.
    fn is_instrumentable(&self, procedure: Procedure, original: &[u8]) -> bool;

    /// Computes the redirect written over `region(procedure)`.
    ///
    /// # Errors
    ///
    /// Returns `ProcTooFar` if the entry thunk cannot be encoded from the
    /// procedure's location.
    fn compute(&self, procedure: Procedure) -> Result<PatchCode>;

    /// Returns the instruction pointer a thread stopped at `ip` must be
    /// moved to before the original bytes are restored, or `None` if `ip`
    /// is already on a valid instruction boundary.
    fn relocate(&self, procedure: Procedure, ip: usize) -> Option<usize>;

    /// Address written over return addresses of hooked calls.
    fn exit_thunk(&self) -> usize;
}
