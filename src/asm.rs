use capstone::prelude::*;
use nix::errno::Errno;

use crate::diag::{Error, Result};

pub mod instruction;

pub use instruction::Instruction;

/// Single-instruction x86-64 decoder.
pub struct Parser {
    capstone: Capstone,
}

impl Parser {
    /// Creates a new `Parser` instance.
    ///
    /// # Errors
    ///
    /// Returns an `Err` if there is a failure to build Capstone.
    pub fn new() -> Result<Self> {
        Ok(Self {
            capstone: Capstone::new()
                .x86()
                .mode(arch::x86::ArchMode::Mode64)
                .syntax(arch::x86::ArchSyntax::Att)
                .detail(true)
                .build()?,
        })
    }

    /// Decodes the first instruction of `opcode`, located at `addr`.
    ///
    /// # Errors
    ///
    /// Returns an `Err` if the bytes do not start with a valid instruction.
    pub fn get_instruction_from(&self, opcode: &[u8], addr: u64) -> Result<Instruction> {
        let instructions = self.capstone.disasm_count(opcode, addr, 1)?;
        Ok(Instruction::new(
            instructions
                .iter()
                .next()
                .ok_or_else(|| Error::from(Errno::ENOEXEC))?,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_hotpatch_prologs() {
        let parser = Parser::new().expect("parser");
        // xchg %ax, %ax; mov %al, %al; mov %rdi, %rdi
        for prolog in [&[0x66, 0x90][..], &[0x88, 0xc0], &[0x48, 0x89, 0xff]] {
            let instr = parser.get_instruction_from(prolog, 0x1000).expect("decode");
            assert_eq!(instr.size(), prolog.len(), "{instr}");
            assert!(instr.is_register_nop(), "{instr}");
        }
    }

    #[test]
    fn test_decode_dword_self_moves() {
        let parser = Parser::new().expect("parser");
        // mov %edi, %edi (both encodings); xchg %ecx, %ecx
        for prolog in [[0x8b, 0xff], [0x89, 0xff], [0x87, 0xc9]] {
            let instr = parser.get_instruction_from(&prolog, 0x1000).expect("decode");
            assert_eq!(instr.size(), 2, "{instr}");
            assert!(!instr.is_register_nop(), "{instr}");
        }
    }

    #[test]
    fn test_decode_regular_prolog() {
        let parser = Parser::new().expect("parser");
        // push %rbp
        let instr = parser.get_instruction_from(&[0x55], 0x1000).expect("decode");
        assert_eq!(instr.size(), 1);
        assert!(!instr.is_register_nop());

        // mov %rsp, %rbp
        let instr = parser
            .get_instruction_from(&[0x48, 0x89, 0xe5], 0x1000)
            .expect("decode");
        assert!(!instr.is_register_nop());
    }

    #[test]
    fn test_decode_garbage() {
        let parser = Parser::new().expect("parser");
        assert!(parser.get_instruction_from(&[0x06], 0x1000).is_err());
    }
}
