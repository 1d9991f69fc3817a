pub mod sub_table;
pub mod symbol;
pub mod symbol_scope;
pub mod symbol_table;

pub use sub_table::{Constructor, ContextChange, DecisionNode, DecisionPair, PrintPiece};
pub use symbol::{Symbol, SymbolKind};
pub use symbol_scope::SymbolScope;
pub use symbol_table::SymbolTable;

use crate::space::AddressSpace;

use std::sync::Arc;

/// An operand's location once its instruction is fully decoded.
///
/// A static handle names `(space, offset_offset, size)` directly; a dynamic
/// handle holds the pointer `(offset_space, offset_offset, offset_size)`
/// through which the value is loaded, along with the temporary the loaded
/// value is placed in.
#[derive(Debug, Clone)]
pub struct FixedHandle<'b> {
    pub space: &'b Arc<AddressSpace>,
    pub size: usize,
    pub offset_space: Option<&'b Arc<AddressSpace>>,
    pub offset_offset: u64,
    pub offset_size: usize,
    pub temporary_space: Option<&'b Arc<AddressSpace>>,
    pub temporary_offset: u64,
}

impl<'b> FixedHandle<'b> {
    pub fn new(space: &'b Arc<AddressSpace>) -> Self {
        Self {
            space,
            size: 0,
            offset_space: None,
            offset_offset: 0,
            offset_size: 0,
            temporary_space: None,
            temporary_offset: 0,
        }
    }

    pub fn constant(space: &'b Arc<AddressSpace>, value: u64) -> Self {
        Self {
            offset_offset: value,
            ..Self::new(space)
        }
    }

    pub fn is_dynamic(&self) -> bool {
        self.offset_space.is_some()
    }
}
