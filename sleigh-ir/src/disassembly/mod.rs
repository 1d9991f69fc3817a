pub mod context;
pub use context::ContextDatabase;

pub mod construct;

pub mod error;
pub use error::{Error, NoMatch, Resolution};

pub mod lift;
pub use lift::{IRBuilder, PCodeData, PCodeRaw};

pub mod opcode;
pub use opcode::Opcode;

pub mod partmap;

pub mod pattern;
pub use pattern::{DisjointPattern, PatternBlock, PatternExpression};

pub mod symbol;
pub use symbol::{Symbol, SymbolTable};

pub mod varnodedata;
pub use varnodedata::VarnodeData;

pub mod walker;
pub use walker::{Checkpoint, ConstructState, ParserContext, ParserWalker, MAX_PARSER_DEPTH};
