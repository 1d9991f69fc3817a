mod bits;

pub mod address;
pub mod disassembly;
pub mod error;
pub mod instruction;
pub mod space;
pub mod space_manager;
pub mod specification;
pub mod translator;

pub use address::{Address, AddressValue};
pub use disassembly::{ContextDatabase, Opcode, PCodeData, PCodeRaw, VarnodeData};
pub use error::Error;
pub use instruction::Instruction;
pub use specification::{Specification, SpecificationBuilder, SpecificationError};
pub use translator::Translator;
