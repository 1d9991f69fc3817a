use crate::bits::{calculate_mask, wrap_offset};

use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::mem;
use std::ops::Deref;

#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[derive(serde::Deserialize, serde::Serialize)]
pub enum SpaceKind {
    Constant,
    Default,
    Processor,
    Internal,
    Register,
}

#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[derive(serde::Deserialize, serde::Serialize)]
#[repr(transparent)]
pub struct SpaceProperty(usize);

pub mod property {
    #![allow(non_upper_case_globals)]

    use super::SpaceProperty;

    pub const BigEndian: SpaceProperty = SpaceProperty(1);
    pub const HasPhysical: SpaceProperty = SpaceProperty(2);
}

impl std::ops::BitOr for SpaceProperty {
    type Output = Self;

    fn bitor(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }
}

impl std::ops::BitAnd for SpaceProperty {
    type Output = Self;

    fn bitand(self, other: Self) -> Self {
        Self(self.0 & other.0)
    }
}

impl fmt::Debug for SpaceProperty {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.is_big_endian(), self.has_physical()) {
            (false, false) => write!(f, "SpaceProperty::default()"),
            (true, false) => write!(f, "SpaceProperty(BigEndian)"),
            (false, true) => write!(f, "SpaceProperty(HasPhysical)"),
            (true, true) => write!(f, "SpaceProperty(BigEndian | HasPhysical)"),
        }
    }
}

impl SpaceProperty {
    pub fn is_set(&self) -> bool {
        self.0 != 0
    }

    pub fn is_big_endian(&self) -> bool {
        (*self & property::BigEndian).is_set()
    }

    pub fn has_physical(&self) -> bool {
        (*self & property::HasPhysical).is_set()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[derive(serde::Deserialize, serde::Serialize)]
pub struct Space {
    index: usize,
    pub(crate) kind: SpaceKind,
    properties: SpaceProperty,
    highest: u64,
    name: String,
    address_size: usize,
    word_size: usize,
    delay: usize,
}

impl Space {
    pub fn new<S: AsRef<str>>(
        kind: SpaceKind,
        name: S,
        address_size: usize,
        word_size: usize,
        index: usize,
        properties: Option<SpaceProperty>,
        delay: usize,
    ) -> Self {
        let word_size = word_size.max(1);
        let highest = calculate_mask(address_size)
            .wrapping_mul(word_size as u64)
            .wrapping_add(word_size as u64 - 1);

        Space {
            kind: if name.as_ref() == "register" { SpaceKind::Register } else { kind },
            properties: properties.unwrap_or_default(),
            highest: if address_size >= 8 { u64::MAX } else { highest },
            name: name.as_ref().to_owned(),
            address_size,
            word_size,
            index,
            delay,
        }
    }
}

#[derive(Debug, Clone)]
#[derive(serde::Deserialize, serde::Serialize)]
pub enum AddressSpace {
    Constant(Space),
    Unique(Space),
    Space(Space),
}

impl PartialEq for AddressSpace {
    fn eq(&self, other: &Self) -> bool {
        self.index() == other.index()
    }
}
impl Eq for AddressSpace { }

impl PartialOrd for AddressSpace {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for AddressSpace {
    fn cmp(&self, other: &Self) -> Ordering {
        self.index().cmp(&other.index())
    }
}

impl Hash for AddressSpace {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.index().hash(state)
    }
}

impl Deref for AddressSpace {
    type Target = Space;

    fn deref(&self) -> &Self::Target {
        match self {
            Self::Constant(space) | Self::Space(space) | Self::Unique(space) => space,
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[derive(serde::Deserialize, serde::Serialize)]
#[repr(transparent)]
pub struct AddressSpaceId(pub(crate) u32);

const ID_CONSTANT_SPACE: u32 = 0x8000_0000;
const ID_DEFAULT_SPACE: u32 = 0x4000_0000;
const ID_REGISTER_SPACE: u32 = 0x2000_0000;
const ID_UNIQUE_SPACE: u32 = 0x1000_0000;

impl AddressSpaceId {
    pub fn index(&self) -> usize {
        (self.0 & 0xffff) as usize
    }

    pub const fn constant_id(index: usize) -> Self {
        Self((index & 0xffff) as u32 | ID_CONSTANT_SPACE)
    }

    pub const fn default_id(index: usize) -> Self {
        Self((index & 0xffff) as u32 | ID_DEFAULT_SPACE)
    }

    pub const fn register_id(index: usize) -> Self {
        Self((index & 0xffff) as u32 | ID_REGISTER_SPACE)
    }

    pub const fn unique_id(index: usize) -> Self {
        Self((index & 0xffff) as u32 | ID_UNIQUE_SPACE)
    }

    pub const fn other_id(index: usize) -> Self {
        Self((index & 0xffff) as u32)
    }

    pub fn is_constant(&self) -> bool {
        (ID_CONSTANT_SPACE & self.0) != 0
    }

    pub fn is_default(&self) -> bool {
        (ID_DEFAULT_SPACE & self.0) != 0
    }

    pub fn is_register(&self) -> bool {
        (ID_REGISTER_SPACE & self.0) != 0
    }

    pub fn is_unique(&self) -> bool {
        (ID_UNIQUE_SPACE & self.0) != 0
    }
}

impl AddressSpace {
    pub fn is_constant(&self) -> bool {
        matches!(self, Self::Constant(..))
    }

    pub fn is_unique(&self) -> bool {
        matches!(self, Self::Unique(..))
    }

    pub fn is_register(&self) -> bool {
        matches!(self.kind(), SpaceKind::Register)
    }

    pub fn is_default(&self) -> bool {
        matches!(self.kind(), SpaceKind::Default)
    }

    pub fn constant<S: AsRef<str>>(name: S, index: usize) -> Self {
        let properties = if cfg!(target_endian = "big") {
            Some(property::BigEndian)
        } else {
            None
        };

        Self::Constant(Space::new(
            SpaceKind::Constant,
            name,
            mem::size_of::<u64>(),
            1,
            index,
            properties,
            0,
        ))
    }

    pub fn unique<S: AsRef<str>>(name: S, index: usize, properties: Option<SpaceProperty>) -> Self {
        Self::Unique(Space::new(
            SpaceKind::Internal,
            name,
            mem::size_of::<u32>(),
            1,
            index,
            properties
                .map(|p| p | property::HasPhysical)
                .or(Some(property::HasPhysical)),
            0,
        ))
    }

    pub fn kind(&self) -> SpaceKind {
        self.kind
    }

    pub fn properties(&self) -> SpaceProperty {
        self.properties
    }

    pub fn is_big_endian(&self) -> bool {
        self.properties.is_big_endian()
    }

    pub fn delay(&self) -> usize {
        self.delay
    }

    pub fn name(&self) -> &str {
        self.name.as_ref()
    }

    pub fn id(&self) -> AddressSpaceId {
        match self {
            Self::Constant(s) => AddressSpaceId::constant_id(s.index),
            Self::Unique(s) => AddressSpaceId::unique_id(s.index),
            Self::Space(s) if s.kind == SpaceKind::Register => AddressSpaceId::register_id(s.index),
            Self::Space(s) if s.kind == SpaceKind::Default => AddressSpaceId::default_id(s.index),
            Self::Space(s) => AddressSpaceId::other_id(s.index),
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn word_size(&self) -> usize {
        self.word_size
    }

    pub fn address_size(&self) -> usize {
        self.address_size
    }

    pub fn highest_offset(&self) -> u64 {
        self.highest
    }

    pub fn wrap_offset(&self, offset: u64) -> u64 {
        wrap_offset(self.highest, offset)
    }
}

impl From<&'_ AddressSpace> for AddressSpaceId {
    fn from(space: &AddressSpace) -> Self {
        space.id()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn space_ids() {
        let constant = AddressSpace::constant("const", 0);
        let register = AddressSpace::Space(Space::new(SpaceKind::Processor, "register", 4, 1, 1, None, 0));
        let ram = AddressSpace::Space(Space::new(SpaceKind::Default, "ram", 2, 1, 2, None, 1));

        assert!(constant.id().is_constant());
        assert!(register.is_register());
        assert!(register.id().is_register());
        assert!(ram.id().is_default());
        assert_eq!(ram.id().index(), 2);
        assert_eq!(ram.highest_offset(), 0xffff);
        assert_eq!(ram.wrap_offset(0x1_0004), 4);
        assert_eq!(constant.highest_offset(), u64::MAX);
    }

    #[test]
    fn word_addressed() {
        let code = AddressSpace::Space(Space::new(SpaceKind::Processor, "code", 2, 2, 1, None, 0));
        assert_eq!(code.highest_offset(), 0x1ffff);
    }
}
