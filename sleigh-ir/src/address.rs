use std::fmt;
use std::ops::{Add, Sub};
use std::sync::Arc;

use crate::space::{AddressSpace, SpaceKind};

/// An offset bound to the space it lives in.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AddressValue {
    space: Arc<AddressSpace>,
    offset: u64,
}

/// A bare offset, wrapped to some space on construction.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[derive(serde::Deserialize, serde::Serialize)]
pub struct Address(u64);

impl Address {
    pub fn new(space: &AddressSpace, offset: u64) -> Self {
        Self(space.wrap_offset(offset))
    }

    pub fn offset(&self) -> u64 {
        self.0
    }
}

impl From<u64> for Address {
    fn from(offset: u64) -> Self {
        Self(offset)
    }
}

impl From<&'_ AddressValue> for Address {
    fn from(v: &AddressValue) -> Self {
        Self(v.offset())
    }
}

impl From<Address> for u64 {
    fn from(t: Address) -> Self {
        t.0
    }
}

impl From<&'_ AddressValue> for u64 {
    fn from(t: &AddressValue) -> Self {
        t.offset
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter) -> Result<(), fmt::Error> {
        write!(f, "{:#x}", self.0)
    }
}

impl Add<u64> for Address {
    type Output = Self;

    fn add(self, rhs: u64) -> Self {
        Self(self.0.wrapping_add(rhs))
    }
}

impl Sub<u64> for Address {
    type Output = Self;

    fn sub(self, rhs: u64) -> Self {
        Self(self.0.wrapping_sub(rhs))
    }
}

impl fmt::Display for AddressValue {
    fn fmt(&self, f: &mut fmt::Formatter) -> Result<(), fmt::Error> {
        write!(f, "{:#x}", self.offset.wrapping_mul(self.space.word_size() as u64))
    }
}

impl Add<u64> for AddressValue {
    type Output = Self;

    fn add(self, rhs: u64) -> Self {
        Self {
            offset: self.space.wrap_offset(self.offset.wrapping_add(rhs)),
            space: self.space,
        }
    }
}

impl Sub<u64> for AddressValue {
    type Output = Self;

    fn sub(self, rhs: u64) -> Self {
        Self {
            offset: self.space.wrap_offset(self.offset.wrapping_sub(rhs)),
            space: self.space,
        }
    }
}

impl Add<usize> for AddressValue {
    type Output = Self;

    fn add(self, rhs: usize) -> Self {
        self + rhs as u64
    }
}

impl Sub<usize> for AddressValue {
    type Output = Self;

    fn sub(self, rhs: usize) -> Self {
        self - rhs as u64
    }
}

impl Add<&'_ AddressValue> for &'_ AddressValue {
    type Output = AddressValue;

    fn add(self, rhs: &AddressValue) -> AddressValue {
        AddressValue::new(self.space.clone(), self.offset.wrapping_add(rhs.offset))
    }
}

impl AddressValue {
    pub fn new(space: Arc<AddressSpace>, offset: u64) -> Self {
        let offset = space.wrap_offset(offset);
        Self { space, offset }
    }

    pub fn is_big_endian(&self) -> bool {
        self.space.properties().is_big_endian()
    }

    pub fn is_little_endian(&self) -> bool {
        !self.is_big_endian()
    }

    pub fn address_size(&self) -> usize {
        self.space.address_size()
    }

    pub fn space(&self) -> Arc<AddressSpace> {
        self.space.clone()
    }

    pub fn space_ref(&self) -> &AddressSpace {
        &self.space
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn is_constant(&self) -> bool {
        self.space.kind() == SpaceKind::Constant
    }

    /// Offset of `self` relative to `other`, reinterpreted in `self`'s space.
    pub fn difference(&self, other: &AddressValue) -> AddressValue {
        Self::new(self.space.clone(), self.offset.wrapping_sub(self.space.wrap_offset(other.offset())))
    }

    pub fn is_contiguous(&self, size: usize, other: &Self, other_size: usize) -> bool {
        if self.space != other.space {
            false
        } else if self.is_big_endian() {
            self.space.wrap_offset(self.offset.wrapping_add(size as u64)) == other.offset
        } else {
            self.space.wrap_offset(other.offset.wrapping_add(other_size as u64)) == self.offset
        }
    }

    pub fn contains(&self, size: usize, other: &Self, other_size: usize) -> bool {
        self.space == other.space
            && self.offset <= other.offset
            && other.offset.wrapping_add(other_size as u64)
                <= self.offset.wrapping_add(size as u64)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::space::Space;

    fn ram() -> Arc<AddressSpace> {
        Arc::new(AddressSpace::Space(Space::new(SpaceKind::Default, "ram", 2, 1, 1, None, 0)))
    }

    #[test]
    fn wrapping_arithmetic() {
        let space = ram();
        let a = AddressValue::new(space.clone(), 0xfffe);
        assert_eq!((a.clone() + 4u64).offset(), 2);
        assert_eq!((a.clone() - 0xffffu64).offset(), 0xffff);
        assert_eq!(a.to_string(), "0xfffe");

        let b = AddressValue::new(space, 0x10);
        assert!(b < a);
        assert_eq!(a.difference(&b).offset(), 0xffee);
    }

    #[test]
    fn contiguity() {
        let space = ram();
        let lo = AddressValue::new(space.clone(), 0x10);
        let hi = AddressValue::new(space, 0x12);
        assert!(hi.is_contiguous(2, &lo, 2));
        assert!(lo.contains(4, &hi, 2));
        assert!(!hi.contains(2, &lo, 2));
    }
}
