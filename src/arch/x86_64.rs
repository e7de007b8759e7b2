//! Hot-patch redirects for x86-64.
//!
//! A patchable procedure is preceded by at least `PADDING_SIZE` bytes of
//! `int3`/`nop` padding and starts with a two byte no-op such as
//! `xchg %ax, %ax`. Patching writes `call <entry thunk>` into the padding
//! and replaces the no-op with `jmp short` back to that call, so the thunk
//! finds the procedure address as its own return address. The thunk
//! resumes past the no-op, which therefore must not change any state.
//!
//! The jump is installed with one 2-byte store while other threads keep
//! running, so the prolog must not straddle a cache line.

use log::debug;
use std::ops::Range;

use super::{PatchCode, Trampoline};
use crate::{
    asm::Parser,
    diag::{Error, Kind, Result},
    procedure::Procedure,
};

pub const PADDING_SIZE: usize = 5;
pub const PROLOG_SIZE: usize = 2;

const CALL_REL32: u8 = 0xe8;
const JMP_SHORT: u8 = 0xeb;
const PADDING_BYTES: [u8; 2] = [0x90, 0xcc];
const CACHE_LINE: usize = 64;

pub struct HotPatch {
    entry_thunk: usize,
    exit_thunk: usize,
}

impl HotPatch {
    #[must_use]
    pub fn new(entry_thunk: usize, exit_thunk: usize) -> Self {
        Self {
            entry_thunk,
            exit_thunk,
        }
    }

    #[must_use]
    pub fn entry_thunk(&self) -> usize {
        self.entry_thunk
    }
}

fn displacement(from: usize, to: usize) -> Option<i32> {
    let from = i64::try_from(from).ok()?;
    let to = i64::try_from(to).ok()?;
    i32::try_from(to.checked_sub(from)?).ok()
}

impl Trampoline for HotPatch {
    fn region(&self, procedure: Procedure) -> Option<Range<usize>> {
        let start = procedure.address().checked_sub(PADDING_SIZE)?;
        let end = procedure.address().checked_add(PROLOG_SIZE)?;
        Some(start..end)
    }

    fn is_instrumentable(&self, procedure: Procedure, original: &[u8]) -> bool {
        if original.len() != PADDING_SIZE + PROLOG_SIZE {
            return false;
        }
        if procedure.address() % CACHE_LINE > CACHE_LINE - PROLOG_SIZE {
            debug!("Prolog of {procedure} straddles a cache line");
            return false;
        }

        let (padding, prolog) = original.split_at(PADDING_SIZE);
        if !padding.iter().all(|byte| PADDING_BYTES.contains(byte)) {
            return false;
        }

        let parser = match Parser::new() {
            Ok(parser) => parser,
            Err(e) => {
                debug!("Cannot check prolog of {procedure}: {e}");
                return false;
            }
        };

        parser
            .get_instruction_from(prolog, procedure.address() as u64)
            .map(|instr| instr.size() == PROLOG_SIZE && instr.is_register_nop())
            .unwrap_or(false)
    }

    fn compute(&self, procedure: Procedure) -> Result<PatchCode> {
        // The call occupies the whole padding, so it returns to the
        // procedure itself.
        let rel = displacement(procedure.address(), self.entry_thunk)
            .ok_or_else(|| Error::new(Kind::ProcTooFar).with_procedure(procedure))?;

        let mut code = [0u8; PADDING_SIZE + PROLOG_SIZE];
        code[0] = CALL_REL32;
        code[1..PADDING_SIZE].copy_from_slice(&rel.to_le_bytes());
        code[PADDING_SIZE] = JMP_SHORT;
        #[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
        let back = -((PADDING_SIZE + PROLOG_SIZE) as i8);
        code[PADDING_SIZE + 1] = back.to_le_bytes()[0];

        PatchCode::new(&code)
    }

    fn relocate(&self, procedure: Procedure, ip: usize) -> Option<usize> {
        let region = self.region(procedure)?;
        (region.contains(&ip) && ip != procedure.address()).then_some(procedure.address())
    }

    fn exit_thunk(&self) -> usize {
        self.exit_thunk
    }
}
