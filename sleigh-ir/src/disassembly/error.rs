use thiserror::Error;

/// Errors raised while walking a matched instruction.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum Error {
    #[error("address `{:#x}` misaligned; expected alignment is {}", address, alignment)]
    IncorrectAlignment {
        address: u64,
        alignment: usize,
    },
    #[error("instruction window exhausted at byte offset {0}")]
    ShortRead(usize),
    #[error("division by zero in pattern expression")]
    DivisionByZero,
    #[error("selected attached entry is marked invalid")]
    InvalidEntry,
    #[error("next address undefined")]
    InvalidNextAddress,
    #[error("constructor invalid")]
    InvalidConstructor,
    #[error("pattern invalid")]
    InvalidPattern,
    #[error("symbol `{0}` invalid")]
    InvalidSymbol(usize),
    #[error("space invalid")]
    InvalidSpace,
    #[error("handle invalid")]
    InvalidHandle,
    #[error("label {0} referenced but never placed")]
    UnplacedLabel(u64),
    #[error("cross-build operations are not supported")]
    CrossBuild,
    #[error("parse tree exceeds maximum depth of {0}")]
    TooDeep(usize),
    #[error("constructor `{0}` of table `{1}` has no semantics")]
    Unimplemented(usize, usize),
    #[error("inconsistent disassembly state")]
    InconsistentState,
}

impl Error {
    /// Evaluation failures that reject the current candidate instead of
    /// aborting the decode.
    pub fn non_match(&self) -> Option<NoMatch> {
        match self {
            Self::ShortRead(_) => Some(NoMatch::ShortRead),
            Self::DivisionByZero => Some(NoMatch::DivisionByZero),
            Self::InvalidEntry => Some(NoMatch::InvalidEntry),
            Self::TooDeep(_) => Some(NoMatch::TooDeep),
            _ => None,
        }
    }
}

/// Why a subtable (or the root table) did not produce a constructor.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum NoMatch {
    Exhausted,
    ShortRead,
    InvalidEntry,
    DivisionByZero,
    TooDeep,
}

/// Outcome of resolving a table at the current walker position.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Resolution {
    Matched,
    NoMatch(NoMatch),
}

impl Resolution {
    pub fn is_match(&self) -> bool {
        matches!(self, Self::Matched)
    }
}
