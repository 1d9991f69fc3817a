use ahash::AHashMap as Map;
use ustr::Ustr;

/// Names visible in one scope, mapped to symbol ids.
#[derive(Debug, Clone, Default)]
#[derive(serde::Deserialize, serde::Serialize)]
pub struct SymbolScope {
    pub(super) id: usize,
    pub(super) parent: Option<usize>,
    pub(super) tree: Map<Ustr, usize>,
}

impl SymbolScope {
    pub fn new(id: usize, parent: Option<usize>) -> Self {
        Self {
            id,
            parent,
            tree: Map::default(),
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn parent(&self) -> Option<usize> {
        self.parent
    }

    /// Binds `name`; returns the id it was already bound to, if any, and
    /// leaves that binding in place.
    pub fn add_symbol(&mut self, name: Ustr, symbol: usize) -> Option<usize> {
        if let Some(existing) = self.tree.get(&name) {
            return Some(*existing)
        }
        self.tree.insert(name, symbol);
        None
    }

    pub fn find(&self, name: &str) -> Option<usize> {
        self.tree.get(&Ustr::from(name)).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Ustr, &usize)> {
        self.tree.iter()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn first_binding_wins() {
        let mut scope = SymbolScope::new(0, None);
        assert_eq!(scope.add_symbol(Ustr::from("r0"), 4), None);
        assert_eq!(scope.add_symbol(Ustr::from("r0"), 9), Some(4));
        assert_eq!(scope.find("r0"), Some(4));
        assert_eq!(scope.find("r1"), None);
    }
}
