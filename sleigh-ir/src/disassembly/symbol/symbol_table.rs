use crate::disassembly::symbol::{Constructor, Symbol, SymbolScope};
use crate::disassembly::Error;
use crate::space_manager::SpaceManager;
use crate::specification::SpecificationError;

/// Every symbol of a specification, indexed by id, together with the
/// scopes used to resolve names at build time.
#[derive(Debug, Clone, Default)]
#[derive(serde::Deserialize, serde::Serialize)]
pub struct SymbolTable {
    scopes: Vec<SymbolScope>,
    symbols: Vec<Symbol>,
    root: usize,
}

impl SymbolTable {
    pub(crate) fn new(scopes: Vec<SymbolScope>, mut symbols: Vec<Symbol>, root: usize) -> Self {
        symbols.sort_by_key(Symbol::id);
        Self { scopes, symbols, root }
    }

    pub fn global_scope(&self) -> Option<&SymbolScope> {
        self.scopes.first()
    }

    pub fn scope(&self, id: usize) -> Option<&SymbolScope> {
        self.scopes.get(id)
    }

    /// Get the symbol by id
    pub fn symbol(&self, id: usize) -> Result<&Symbol, Error> {
        self.symbols.get(id).ok_or(Error::InvalidSymbol(id))
    }

    pub fn symbols(&self) -> &[Symbol] {
        &self.symbols
    }

    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }

    /// The subtable decoding starts from.
    pub fn root(&self) -> Result<&Symbol, Error> {
        self.symbol(self.root)
    }

    pub fn root_id(&self) -> usize {
        self.root
    }

    /// Resolves `name` starting at `scope` and moving outward.
    pub fn find_in(&self, scope: usize, name: &str) -> Option<&Symbol> {
        let mut current = self.scopes.get(scope);
        while let Some(scope) = current {
            if let Some(id) = scope.find(name) {
                return self.symbols.get(id)
            }
            current = scope.parent().and_then(|parent| self.scopes.get(parent));
        }
        None
    }

    pub fn lookup(&self, name: &str) -> Option<&Symbol> {
        self.find_in(0, name)
    }

    /// Checks that every id, index and space the table refers to resolves,
    /// so that a table deserialized from outside the builder decodes
    /// without tripping over dangling references.
    pub fn validate(&self, manager: &SpaceManager, sections: usize, unique_span: u64) -> Result<(), SpecificationError> {
        for (position, scope) in self.scopes.iter().enumerate() {
            let context = || format!("scope {}", position);
            if scope.id != position || scope.parent.map_or(false, |parent| parent >= position) {
                return Err(SpecificationError::template(context(), "is out of order"))
            }
            if let Some((name, id)) = scope.tree.iter().find(|(_, id)| **id >= self.symbols.len()) {
                return Err(SpecificationError::unresolved(format!("{}#{}", name, id), context()))
            }
        }

        if !matches!(self.symbols.get(self.root), Some(Symbol::Subtable { .. })) {
            return Err(SpecificationError::unresolved(
                format!("#{}", self.root),
                "the root table",
            ))
        }

        let words = self
            .symbols
            .iter()
            .filter_map(|symbol| match symbol {
                Symbol::Context { high, .. } => Some(high / 32 + 1),
                _ => None,
            })
            .max()
            .unwrap_or(0);

        for (position, symbol) in self.symbols.iter().enumerate() {
            let context = || format!("`{}`", symbol.name());
            let fail = |reason: String| SpecificationError::template(context(), reason);

            if symbol.id() != position || self.scopes.get(symbol.scope()).is_none() {
                return Err(fail(format!("is stored at {} in scope {}", position, symbol.scope())))
            }

            match symbol {
                Symbol::Value { pattern_value, .. }
                | Symbol::ValueMap { pattern_value, .. }
                | Symbol::Name { pattern_value, .. }
                | Symbol::Start { pattern_value, .. }
                | Symbol::End { pattern_value, .. } => pattern_value.check(self).map_err(fail)?,
                Symbol::Varnode { space, .. } => {
                    if manager.space_by_id(*space).map(|s| s.id()) != Some(*space) {
                        return Err(SpecificationError::MissingSpace("varnode"))
                    }
                }
                Symbol::Context {
                    pattern_value,
                    varnode_id,
                    low,
                    high,
                    ..
                } => {
                    pattern_value.check(self).map_err(fail)?;
                    if low > high || varnode_id.map_or(false, |id| !self.is_varnode(id)) {
                        return Err(fail(format!("bits {}..={} are out of place", low, high)))
                    }
                }
                Symbol::VarnodeList {
                    pattern_value,
                    varnode_table,
                    ..
                } => {
                    pattern_value.check(self).map_err(fail)?;
                    if let Some(id) = varnode_table.iter().flatten().find(|id| !self.is_varnode(**id)) {
                        return Err(fail(format!("lists #{}, which is not a register", id)))
                    }
                }
                Symbol::Operand {
                    subsym_id,
                    local_expr,
                    def_expr,
                    ..
                } => {
                    local_expr.check(self).map_err(fail)?;
                    if let Some(expr) = def_expr {
                        expr.check(self).map_err(fail)?;
                    }
                    if let Some(id) = subsym_id {
                        if *id >= self.symbols.len() {
                            return Err(SpecificationError::unresolved(format!("#{}", id), context()))
                        }
                    }
                }
                Symbol::Section { index, .. } => {
                    if *index >= sections {
                        return Err(fail(format!("names section {} of {}", index, sections)))
                    }
                }
                Symbol::Subtable {
                    constructors,
                    decision_tree,
                    ..
                } => {
                    for (index, ctor) in constructors.iter().enumerate() {
                        if ctor.id() != index || ctor.table() != position {
                            return Err(fail(format!("constructor {} is out of place", index)))
                        }
                        ctor.check(self, manager, sections, words, unique_span)
                            .map_err(|reason| fail(format!("constructor {} {}", index, reason)))?;
                    }
                    decision_tree.check(constructors.len()).map_err(fail)?;
                }
                Symbol::UserOp { .. }
                | Symbol::Epsilon { .. }
                | Symbol::Token { .. }
                | Symbol::Next { .. } => (),
            }
        }

        Ok(())
    }

    fn is_varnode(&self, id: usize) -> bool {
        matches!(self.symbols.get(id), Some(Symbol::Varnode { .. }))
    }

    pub fn constructor(&self, table: usize, index: usize) -> Result<&Constructor, Error> {
        self.symbol(table)?
            .constructors()?
            .get(index)
            .ok_or(Error::InvalidConstructor)
    }
}
