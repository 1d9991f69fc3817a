use std::fmt;

/// Processor mode selecting the default address and operand size context.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[derive(serde::Deserialize, serde::Serialize)]
pub enum Mode {
    Mode16,
    Mode32,
    Mode64,
}

impl Default for Mode {
    fn default() -> Self {
        Self::Mode16
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-bit", self.bits())
    }
}

impl Mode {
    pub const ADDRESS_SIZE_VARIABLE: &'static str = "addrsize";
    pub const OPERAND_SIZE_VARIABLE: &'static str = "opsize";

    pub fn bits(&self) -> usize {
        match self {
            Self::Mode16 => 16,
            Self::Mode32 => 32,
            Self::Mode64 => 64,
        }
    }

    pub fn from_bits(bits: usize) -> Option<Self> {
        match bits {
            16 => Some(Self::Mode16),
            32 => Some(Self::Mode32),
            64 => Some(Self::Mode64),
            _ => None,
        }
    }

    /// Encoded value for the `addrsize`/`opsize` context variables.
    pub fn context_value(&self) -> u32 {
        match self {
            Self::Mode16 => 0,
            Self::Mode32 => 1,
            Self::Mode64 => 2,
        }
    }

    /// Context variable defaults implied by this mode.
    pub fn context_defaults(&self) -> [(&'static str, u32); 2] {
        let value = self.context_value();
        [
            (Self::ADDRESS_SIZE_VARIABLE, value),
            (Self::OPERAND_SIZE_VARIABLE, value),
        ]
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn defaults() {
        assert_eq!(Mode::default(), Mode::Mode16);
        assert_eq!(Mode::Mode64.context_defaults(), [("addrsize", 2), ("opsize", 2)]);
        assert_eq!(Mode::from_bits(32), Some(Mode::Mode32));
        assert_eq!(Mode::from_bits(8), None);
    }
}
