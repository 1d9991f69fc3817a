use thiserror::Error;

use crate::disassembly::Error as DisassemblyError;
use crate::specification::SpecificationError;

#[derive(Debug, Error)]
pub enum Error {
    #[error("no constructor matches the bytes at {address:#x}")]
    BadData { address: u64 },
    #[error("constructor `{constructor}` of table `{table}` has no semantics")]
    UnimplementedSemantics { constructor: usize, table: usize },
    #[error("delay slots nest deeper than {0} levels")]
    DelaySlotOverflow(usize),
    #[error("address `{:#x}` misaligned; expected alignment is {}", address, alignment)]
    IncorrectAlignment { address: u64, alignment: usize },
    #[error(transparent)]
    Disassembly(DisassemblyError),
    #[error(transparent)]
    Specification(#[from] SpecificationError),
}

impl From<DisassemblyError> for Error {
    fn from(error: DisassemblyError) -> Self {
        match error {
            DisassemblyError::Unimplemented(constructor, table) => {
                Self::UnimplementedSemantics { constructor, table }
            }
            DisassemblyError::IncorrectAlignment { address, alignment } => {
                Self::IncorrectAlignment { address, alignment }
            }
            error => Self::Disassembly(error),
        }
    }
}

impl Error {
    pub fn is_bad_data(&self) -> bool {
        matches!(self, Self::BadData { .. })
    }
}
