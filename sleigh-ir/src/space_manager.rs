use std::sync::Arc;

use crate::address::AddressValue;
use crate::space::{AddressSpace, AddressSpaceId, Space, SpaceKind, SpaceProperty};
use crate::specification::SpecificationError;

#[derive(Debug, Clone)]
#[derive(serde::Deserialize, serde::Serialize)]
pub struct SpaceManager {
    spaces: Vec<Arc<AddressSpace>>,
    constant_space: usize,
    default_space: usize,
    register_space: usize,
    unique_space: usize,
}

impl Default for SpaceManager {
    fn default() -> Self {
        Self::new()
    }
}

impl SpaceManager {
    /// A manager holding only the constant space (index 0).
    pub fn new() -> Self {
        Self {
            spaces: vec![Arc::new(AddressSpace::constant("const", 0))],
            constant_space: 0,
            default_space: 0,
            register_space: 0,
            unique_space: 0,
        }
    }

    pub fn address_from<S: AsRef<str>>(&self, space: S, offset: u64) -> Option<AddressValue> {
        let space = self.space_by_name(space)?;
        Some(AddressValue::new(space, offset))
    }

    pub fn address_size(&self) -> usize {
        self.spaces[self.default_space].address_size()
    }

    pub fn spaces(&self) -> &[Arc<AddressSpace>] {
        self.spaces.as_ref()
    }

    pub fn space_by_name<S: AsRef<str>>(&self, name: S) -> Option<Arc<AddressSpace>> {
        let name = name.as_ref();
        self.spaces.iter().find(|space| space.name() == name).cloned()
    }

    pub fn space_by_id(&self, id: AddressSpaceId) -> Option<&Arc<AddressSpace>> {
        self.spaces.get(id.index())
    }

    pub fn constant_space(&self) -> Arc<AddressSpace> {
        self.spaces[self.constant_space].clone()
    }

    pub fn constant_space_ref(&self) -> &Arc<AddressSpace> {
        &self.spaces[self.constant_space]
    }

    pub fn unique_space_ref(&self) -> &Arc<AddressSpace> {
        &self.spaces[self.unique_space]
    }

    pub fn constant_space_id(&self) -> AddressSpaceId {
        AddressSpaceId::constant_id(self.constant_space)
    }

    pub fn default_space(&self) -> Arc<AddressSpace> {
        self.spaces[self.default_space].clone()
    }

    pub fn default_space_id(&self) -> AddressSpaceId {
        self.spaces[self.default_space].id()
    }

    pub fn register_space(&self) -> Arc<AddressSpace> {
        self.spaces[self.register_space].clone()
    }

    pub fn register_space_id(&self) -> AddressSpaceId {
        self.spaces[self.register_space].id()
    }

    pub fn unique_space(&self) -> Arc<AddressSpace> {
        self.spaces[self.unique_space].clone()
    }

    pub fn unique_space_id(&self) -> AddressSpaceId {
        self.spaces[self.unique_space].id()
    }

    pub fn add_space<S: AsRef<str>>(
        &mut self,
        kind: SpaceKind,
        name: S,
        address_size: usize,
        word_size: usize,
        properties: Option<SpaceProperty>,
        delay: usize,
    ) -> Result<Arc<AddressSpace>, SpecificationError> {
        let name = name.as_ref();
        if self.space_by_name(name).is_some() {
            return Err(SpecificationError::DuplicateSymbol(name.to_owned()))
        }

        let index = self.spaces.len();
        let space = if name == "unique" {
            self.unique_space = index;
            AddressSpace::unique(name, index, properties)
        } else {
            AddressSpace::Space(Space::new(
                kind,
                name,
                address_size,
                word_size,
                index,
                properties,
                delay,
            ))
        };

        if space.is_register() {
            self.register_space = index;
        }

        if space.is_default() {
            self.default_space = index;
        }

        let space = Arc::new(space);
        self.spaces.push(space.clone());
        Ok(space)
    }

    /// Checks that the default, register and unique spaces are present and
    /// that every space sits at its own index.
    pub fn validate(&self) -> Result<(), SpecificationError> {
        if self.default_space == 0 {
            return Err(SpecificationError::MissingSpace("default"))
        }

        if self.register_space == 0 {
            return Err(SpecificationError::MissingSpace("register"))
        }

        if self.unique_space == 0 {
            return Err(SpecificationError::MissingSpace("unique"))
        }

        let expect = |index: usize, kind: &'static str, check: fn(&AddressSpace) -> bool| {
            match self.spaces.get(index) {
                Some(space) if check(space) => Ok(()),
                _ => Err(SpecificationError::MissingSpace(kind)),
            }
        };

        expect(self.constant_space, "constant", AddressSpace::is_constant)?;
        expect(self.default_space, "default", AddressSpace::is_default)?;
        expect(self.register_space, "register", AddressSpace::is_register)?;
        expect(self.unique_space, "unique", AddressSpace::is_unique)?;

        if let Some((position, space)) = self
            .spaces
            .iter()
            .enumerate()
            .find(|(position, space)| space.index() != *position)
        {
            return Err(SpecificationError::template(
                format!("space `{}`", space.name()),
                format!("is numbered {} but stored at {}", space.index(), position),
            ))
        }

        Ok(())
    }
}
