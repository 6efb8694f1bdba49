use thiserror::Error;

use crate::state::Address;

/// Errors returned by `Chip8::load`. The VM is left untouched when one occurs.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadError {
    #[error("ROM is {size} bytes but at most {max} bytes fit in memory")]
    RomTooLarge { size: usize, max: usize },
}

/// The ways a running program can fault.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    #[error("illegal opcode")]
    IllegalOpcode,
    #[error("stack overflow")]
    StackOverflow,
    #[error("stack underflow")]
    StackUnderflow,
    #[error("out of bounds memory access at {address:#06X}")]
    OutOfBoundsAccess { address: usize },
}

/// A fault that halted the VM.
///
/// `pc` is the address of the instruction that faulted. `opcode` holds the raw
/// instruction word whenever it could be fetched.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("{kind} at {pc:#05X}")]
pub struct Fault {
    pub kind: FaultKind,
    pub pc: Address,
    pub opcode: Option<u16>,
}

impl Fault {
    pub fn new(kind: FaultKind, pc: Address, opcode: Option<u16>) -> Self {
        Fault { kind, pc, opcode }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fault_message_names_kind_and_address() {
        let fault = Fault::new(FaultKind::IllegalOpcode, 0x2A4, Some(0xFFFF));
        assert_eq!(fault.to_string(), "illegal opcode at 0x2A4");

        let fault = Fault::new(FaultKind::OutOfBoundsAccess { address: 0x1000 }, 0x200, None);
        assert_eq!(
            fault.to_string(),
            "out of bounds memory access at 0x1000 at 0x200"
        );
    }

    #[test]
    fn rom_too_large_message() {
        let err = LoadError::RomTooLarge {
            size: 4000,
            max: 3584,
        };
        assert_eq!(
            err.to_string(),
            "ROM is 4000 bytes but at most 3584 bytes fit in memory"
        );
    }
}
