use thiserror::Error;

use sleigh_arch::ArchDefParseError;
use sleigh_ir::SpecificationError;

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Decode(#[from] sleigh_ir::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("not enough bytes to decode at {0:#x}")]
    NotEnoughBytes(u64),
    #[error("architecture `{0}` is not found in presets")]
    ArchNotFound(String),
    #[error(transparent)]
    Arch(#[from] ArchDefParseError),
    #[error("missing argument: {0}")]
    MissingArg(String),
    #[error("invalid configuration: {0}")]
    Config(#[from] serde_yaml::Error),
    #[error("context variable `{0}` is not defined")]
    UnknownVariable(String),
}

impl From<SpecificationError> for Error {
    fn from(error: SpecificationError) -> Self {
        Self::Decode(error.into())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
