use std::fmt;

use crate::address::AddressValue;

/// The assembly rendering of one decoded instruction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instruction {
    pub address: AddressValue,
    pub mnemonic: String,
    pub body: String,
    pub delay_slots: usize,
    pub length: usize,
}

impl Instruction {
    pub fn address(&self) -> AddressValue {
        self.address.clone()
    }

    pub fn mnemonic(&self) -> &str {
        &self.mnemonic
    }

    pub fn body(&self) -> &str {
        &self.body
    }

    pub fn delay_slots(&self) -> usize {
        self.delay_slots
    }

    pub fn length(&self) -> usize {
        self.length
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter) -> Result<(), fmt::Error> {
        if self.body.is_empty() {
            write!(f, "{} {}", self.address, self.mnemonic)
        } else {
            write!(f, "{} {} {}", self.address, self.mnemonic, self.body)
        }
    }
}
