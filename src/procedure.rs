use serde_derive::Serialize;
use std::fmt;

/// Address of an instrumentable routine.
///
/// This is the key of the patch database and the identity reported to
/// entry/exit callbacks.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct Procedure(usize);

impl Procedure {
    #[must_use]
    pub const fn new(address: usize) -> Self {
        Self(address)
    }

    #[must_use]
    pub const fn address(self) -> usize {
        self.0
    }
}

impl From<usize> for Procedure {
    fn from(address: usize) -> Self {
        Self(address)
    }
}

impl fmt::Display for Procedure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}
