use nix::errno::Errno;
use std::{
    backtrace::{Backtrace, BacktraceStatus},
    fmt, io, result,
};

use crate::procedure::Procedure;

/// Failure classes shared by the lifecycle, patching and data paths.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum Kind {
    #[error("invalid argument")]
    InvalidArgument,
    #[error("tracer is not initialized")]
    NotInitialized,
    #[error("tracer is already initialized")]
    AlreadyInitialized,
    #[error("procedures are still patched")]
    StillPatched,
    #[error("operation is illegal from within a callback")]
    InCallback,
    #[error("operation does not match the buffer collection mode")]
    WrongCollectionMode,
    #[error("procedure is not patchable")]
    NotPatchable,
    #[error("procedure is already patched")]
    AlreadyPatched,
    #[error("procedure is not patched")]
    NotPatched,
    #[error("procedure is too far from the thunk")]
    ProcTooFar,
    #[error("failed to suspend thread")]
    ThreadSuspendFailure,
    #[error("failed to update thread context")]
    ContextUpdateFailure,
    #[error("batch was only partially applied")]
    PartiallyApplied,
    #[error("out of memory")]
    OutOfMemory,
    #[error("timeout elapsed")]
    Timeout,
    #[error("system call failed: {0}")]
    System(Errno),
}

pub struct Error {
    kind: Kind,
    procedure: Option<Procedure>,
    detail: Option<String>,
    backtrace: Backtrace,
}

impl Error {
    #[must_use]
    pub fn new(kind: Kind) -> Self {
        Self {
            kind,
            procedure: None,
            detail: None,
            backtrace: Backtrace::capture(),
        }
    }

    /// Attaches the procedure that made a batch operation fail.
    #[must_use]
    pub fn with_procedure(mut self, procedure: Procedure) -> Self {
        self.procedure = Some(procedure);
        self
    }

    #[must_use]
    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    #[must_use]
    pub fn kind(&self) -> Kind {
        self.kind
    }

    /// The offending procedure, if the failure is local to one.
    #[must_use]
    pub fn procedure(&self) -> Option<Procedure> {
        self.procedure
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.kind)?;
        if let Some(procedure) = self.procedure {
            write!(f, " ({procedure})")?;
        }
        if let Some(detail) = &self.detail {
            write!(f, ": {detail}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self}")?;
        if self.backtrace.status() == BacktraceStatus::Captured {
            write!(f, "\nBacktrace:\n{}", self.backtrace)
        } else {
            Ok(())
        }
    }
}

impl std::error::Error for Error {}

impl From<Kind> for Error {
    fn from(kind: Kind) -> Self {
        Self::new(kind)
    }
}

impl From<Errno> for Error {
    fn from(errno: Errno) -> Self {
        Self::new(Kind::System(errno))
    }
}

impl From<io::Error> for Error {
    #[allow(deprecated)]
    fn from(e: io::Error) -> Self {
        let errno = e.raw_os_error().map_or(Errno::EIO, Errno::from_i32);
        Self::new(Kind::System(errno)).with_detail(e.to_string())
    }
}

impl From<procfs::ProcError> for Error {
    fn from(e: procfs::ProcError) -> Self {
        Self::new(Kind::System(Errno::EIO)).with_detail(e.to_string())
    }
}

impl From<capstone::Error> for Error {
    fn from(e: capstone::Error) -> Self {
        Self::new(Kind::NotPatchable).with_detail(e.to_string())
    }
}

pub type Result<T> = result::Result<T, Error>;
