use std::fmt;
use std::sync::Arc;

use crate::address::AddressValue;
use crate::space::AddressSpace;
use crate::Translator;

/// A concrete storage location: `size` bytes at `offset` in `space`.
#[derive(Debug, Clone, PartialEq, Eq, Ord, PartialOrd, Hash)]
#[derive(serde::Deserialize, serde::Serialize)]
pub struct VarnodeData {
    space: Arc<AddressSpace>,
    pub(crate) offset: u64,
    pub(crate) size: usize,
}

pub struct VarnodeDataFormatter<'a> {
    varnode: &'a VarnodeData,
    translator: &'a Translator,
}

impl<'a> fmt::Display for VarnodeDataFormatter<'a> {
    fn fmt(&self, f: &mut fmt::Formatter) -> Result<(), fmt::Error> {
        if self.varnode.space.is_register() {
            if let Some(name) = self
                .translator
                .register_name(self.varnode.offset, self.varnode.size)
            {
                return write!(f, "{}", name)
            }
        } else if self.varnode.space.is_constant() {
            return write!(f, "{:#x}:{}", self.varnode.offset, self.varnode.size)
        }

        write!(f, "{}", self.varnode)
    }
}

impl fmt::Display for VarnodeData {
    fn fmt(&self, f: &mut fmt::Formatter) -> Result<(), fmt::Error> {
        write!(
            f,
            "({}, {:#x}, {})",
            self.space.name(),
            self.offset,
            self.size
        )
    }
}

impl VarnodeData {
    pub fn display<'a>(&'a self, translator: &'a Translator) -> VarnodeDataFormatter<'a> {
        VarnodeDataFormatter {
            varnode: self,
            translator,
        }
    }

    pub fn new(space: Arc<AddressSpace>, offset: u64, size: usize) -> Self {
        Self {
            space,
            offset,
            size,
        }
    }

    pub fn address(&self) -> AddressValue {
        AddressValue::new(self.space.clone(), self.offset)
    }

    pub fn space(&self) -> Arc<AddressSpace> {
        self.space.clone()
    }

    pub fn space_ref(&self) -> &AddressSpace {
        self.space.as_ref()
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn size(&self) -> usize {
        self.size
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn plain_display() {
        let constant = Arc::new(AddressSpace::constant("const", 0));
        let v = VarnodeData::new(constant, 0x10, 4);
        assert_eq!(v.to_string(), "(const, 0x10, 4)");
        assert!(v.space_ref().is_constant());
    }
}
