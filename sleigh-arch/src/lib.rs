use sleigh_bytes::endian::Endian;

use std::fmt;
use std::str::FromStr;

use thiserror::Error;
use unicase::UniCase;

pub mod mode;
pub use mode::Mode;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ArchDefParseError {
    #[error("architecture definition `{0}` should have the form `processor:endian:bits:variant`")]
    Format(String),
    #[error("invalid endian `{0}`; expected `BE` or `LE`")]
    Endian(String),
    #[error("invalid bit-width `{0}`")]
    Bits(String),
}

/// An architecture tag such as `toy16:BE:16:default`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[derive(serde::Deserialize, serde::Serialize)]
pub struct ArchitectureDef {
    processor: String,
    endian: Endian,
    bits: usize,
    variant: String,
}

impl ArchitectureDef {
    pub fn new<P, V>(processor: P, endian: Endian, bits: usize, variant: V) -> Self
    where P: Into<String>,
          V: Into<String> {
        Self {
            processor: processor.into(),
            endian,
            bits,
            variant: variant.into(),
        }
    }

    pub fn is_little(&self) -> bool {
        self.endian.is_little()
    }

    pub fn is_big(&self) -> bool {
        self.endian.is_big()
    }

    pub fn endian(&self) -> Endian {
        self.endian
    }

    pub fn bits(&self) -> usize {
        self.bits
    }

    pub fn processor(&self) -> &str {
        &self.processor
    }

    pub fn variant(&self) -> &str {
        &self.variant
    }

    /// Case-insensitive comparison of processor and variant; endian and
    /// bit-width must agree exactly.
    pub fn matches(&self, other: &ArchitectureDef) -> bool {
        UniCase::new(self.processor()) == UniCase::new(other.processor())
            && UniCase::new(self.variant()) == UniCase::new(other.variant())
            && self.endian == other.endian
            && self.bits == other.bits
    }
}

impl fmt::Display for ArchitectureDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}:{}", self.processor, self.endian, self.bits, self.variant)
    }
}

impl FromStr for ArchitectureDef {
    type Err = ArchDefParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts = s.splitn(4, ':').collect::<Vec<_>>();
        if parts.len() != 4 || parts[0].is_empty() {
            return Err(ArchDefParseError::Format(s.to_owned()))
        }

        let endian = parts[1].parse::<Endian>()
            .map_err(|_| ArchDefParseError::Endian(parts[1].to_owned()))?;

        let bits = parts[2].parse::<usize>()
            .ok()
            .filter(|bits| *bits > 0)
            .ok_or_else(|| ArchDefParseError::Bits(parts[2].to_owned()))?;

        Ok(Self::new(parts[0], endian, bits, parts[3]))
    }
}
