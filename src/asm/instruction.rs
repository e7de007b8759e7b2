use capstone::Insn;
use std::fmt;

pub struct Instruction {
    addr: u64,
    size: usize,
    mnemonic: String,
    operands: String,
}

impl Instruction {
    #[must_use]
    pub fn new(insn: &Insn) -> Self {
        Self {
            addr: insn.address(),
            size: insn.bytes().len(),
            mnemonic: insn.mnemonic().unwrap_or("").to_string(),
            operands: insn.op_str().unwrap_or("").to_string(),
        }
    }

    #[must_use]
    pub fn addr(&self) -> u64 {
        self.addr
    }

    #[must_use]
    pub fn size(&self) -> usize {
        self.size
    }

    /// True for instructions with no architectural effect: `nop` forms and
    /// moves or exchanges of a register onto itself. 32-bit registers do
    /// not qualify, since writing one clears the upper half of its 64-bit
    /// register (`mov %edi, %edi` truncates `%rdi`).
    #[must_use]
    pub fn is_register_nop(&self) -> bool {
        if self.mnemonic.starts_with("nop") {
            return true;
        }
        if !(self.mnemonic.starts_with("mov") || self.mnemonic.starts_with("xchg")) {
            return false;
        }

        let mut operands = self.operands.split(',').map(str::trim);
        match (operands.next(), operands.next(), operands.next()) {
            (Some(lhs), Some(rhs), None) if lhs == rhs => {
                let register = lhs.trim_start_matches('%');
                register.chars().all(char::is_alphanumeric) && !is_dword_register(register)
            }
            _ => false,
        }
    }
}

fn is_dword_register(register: &str) -> bool {
    const LEGACY: [&str; 8] = ["eax", "ebx", "ecx", "edx", "esi", "edi", "esp", "ebp"];
    LEGACY.contains(&register)
        || register
            .strip_prefix('r')
            .and_then(|rest| rest.strip_suffix('d'))
            .is_some_and(|index| index.parse::<u8>().is_ok())
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:x}: {}\t{}", self.addr, self.mnemonic, self.operands)
    }
}
