use std::fmt::Display;
use std::str::FromStr;

use crate::order::Order;
use crate::{BE, LE};

#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[derive(serde::Deserialize, serde::Serialize)]
pub enum Endian {
    Big,
    Little,
}

impl Default for Endian {
    fn default() -> Self {
        Self::Big
    }
}

impl Display for Endian {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(if self.is_big() { "BE" } else { "LE" })
    }
}

impl FromStr for Endian {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "BE" | "be" | "big" => Ok(Self::Big),
            "LE" | "le" | "little" => Ok(Self::Little),
            _ => Err(()),
        }
    }
}

impl Endian {
    pub fn is_big(&self) -> bool {
        matches!(self, Self::Big)
    }

    pub fn is_little(&self) -> bool {
        matches!(self, Self::Little)
    }

    /// Reads an unsigned value of `buf.len()` bytes (at most 8) in this byte order.
    pub fn read_unsigned(&self, buf: &[u8]) -> u64 {
        match self {
            Self::Big => BE::read_field(buf),
            Self::Little => LE::read_field(buf),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parse_and_display() {
        assert_eq!("LE".parse::<Endian>(), Ok(Endian::Little));
        assert_eq!("big".parse::<Endian>(), Ok(Endian::Big));
        assert!("middle".parse::<Endian>().is_err());
        assert_eq!(Endian::Little.to_string(), "LE");
    }

    #[test]
    fn read_unsigned_respects_order() {
        let bytes = [0x12, 0x34, 0x56];
        assert_eq!(Endian::Big.read_unsigned(&bytes), 0x123456);
        assert_eq!(Endian::Little.read_unsigned(&bytes), 0x563412);
        assert_eq!(Endian::Big.read_unsigned(&[]), 0);
    }
}
