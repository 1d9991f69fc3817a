use crate::disassembly::pattern::PatternExpression;
use crate::disassembly::symbol::{Constructor, DecisionNode, FixedHandle, SymbolTable};
use crate::disassembly::walker::ParserWalker;
use crate::disassembly::Error;
use crate::space::AddressSpaceId;
use crate::space_manager::SpaceManager;

use sleigh_bytes::Endian;
use ustr::Ustr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[derive(serde::Deserialize, serde::Serialize)]
pub enum SymbolKind {
    UserOp,
    Epsilon,
    Token,
    Value,
    ValueMap,
    Name,
    Varnode,
    Context,
    VarnodeList,
    Operand,
    Start,
    End,
    Next,
    Section,
    Subtable,
}

#[derive(Debug, Clone, PartialEq, Eq)]
#[derive(serde::Deserialize, serde::Serialize)]
pub enum Symbol {
    UserOp {
        id: usize,
        scope: usize,
        name: Ustr,
        index: usize,
    },
    Epsilon {
        id: usize,
        scope: usize,
        name: Ustr,
    },
    Token {
        id: usize,
        scope: usize,
        name: Ustr,
        size: usize,
        endian: Endian,
    },
    Value {
        id: usize,
        scope: usize,
        name: Ustr,
        pattern_value: PatternExpression,
        hex: bool,
    },
    ValueMap {
        id: usize,
        scope: usize,
        name: Ustr,
        pattern_value: PatternExpression,
        value_table: Vec<Option<i64>>,
    },
    Name {
        id: usize,
        scope: usize,
        name: Ustr,
        pattern_value: PatternExpression,
        name_table: Vec<Option<String>>,
    },
    Varnode {
        id: usize,
        scope: usize,
        name: Ustr,
        space: AddressSpaceId,
        offset: u64,
        size: usize,
    },
    Context {
        id: usize,
        scope: usize,
        name: Ustr,
        pattern_value: PatternExpression,
        varnode_id: Option<usize>,
        low: usize,
        high: usize,
        flow: bool,
    },
    VarnodeList {
        id: usize,
        scope: usize,
        name: Ustr,
        pattern_value: PatternExpression,
        varnode_table: Vec<Option<usize>>,
    },
    Operand {
        id: usize,
        scope: usize,
        name: Ustr,
        handle_index: usize,
        offset: usize,
        base: Option<usize>,
        min_length: usize,
        subsym_id: Option<usize>,
        is_code: bool,
        local_expr: PatternExpression,
        def_expr: Option<PatternExpression>,
    },
    Start {
        id: usize,
        scope: usize,
        name: Ustr,
        pattern_value: PatternExpression,
    },
    End {
        id: usize,
        scope: usize,
        name: Ustr,
        pattern_value: PatternExpression,
    },
    Next {
        id: usize,
        scope: usize,
        name: Ustr,
    },
    Section {
        id: usize,
        scope: usize,
        name: Ustr,
        index: usize,
    },
    Subtable {
        id: usize,
        scope: usize,
        name: Ustr,
        constructors: Vec<Constructor>,
        decision_tree: DecisionNode,
    },
}

fn push_value(out: &mut String, value: i64) {
    if value < 0 {
        out.push_str(&format!("-{:#x}", -(value as i128)));
    } else {
        out.push_str(&format!("{:#x}", value));
    }
}

/// Evaluates `pattern_value` as an index into a table of `len` entries.
fn entry<'b, 'c>(
    pattern_value: &'b PatternExpression,
    walker: &ParserWalker<'b, 'c>,
    symbols: &'b SymbolTable,
    len: usize,
) -> Result<usize, Error> {
    let index = pattern_value.value(walker, symbols)?;
    if index < 0 || index as usize >= len {
        Err(Error::InvalidEntry)
    } else {
        Ok(index as usize)
    }
}

impl Symbol {
    pub fn id(&self) -> usize {
        match self {
            Self::UserOp { id, .. }
            | Self::Epsilon { id, .. }
            | Self::Token { id, .. }
            | Self::Value { id, .. }
            | Self::ValueMap { id, .. }
            | Self::Name { id, .. }
            | Self::Varnode { id, .. }
            | Self::Context { id, .. }
            | Self::VarnodeList { id, .. }
            | Self::Operand { id, .. }
            | Self::Start { id, .. }
            | Self::End { id, .. }
            | Self::Next { id, .. }
            | Self::Section { id, .. }
            | Self::Subtable { id, .. } => *id,
        }
    }

    pub fn scope(&self) -> usize {
        match self {
            Self::UserOp { scope, .. }
            | Self::Epsilon { scope, .. }
            | Self::Token { scope, .. }
            | Self::Value { scope, .. }
            | Self::ValueMap { scope, .. }
            | Self::Name { scope, .. }
            | Self::Varnode { scope, .. }
            | Self::Context { scope, .. }
            | Self::VarnodeList { scope, .. }
            | Self::Operand { scope, .. }
            | Self::Start { scope, .. }
            | Self::End { scope, .. }
            | Self::Next { scope, .. }
            | Self::Section { scope, .. }
            | Self::Subtable { scope, .. } => *scope,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Self::UserOp { name, .. }
            | Self::Epsilon { name, .. }
            | Self::Token { name, .. }
            | Self::Value { name, .. }
            | Self::ValueMap { name, .. }
            | Self::Name { name, .. }
            | Self::Varnode { name, .. }
            | Self::Context { name, .. }
            | Self::VarnodeList { name, .. }
            | Self::Operand { name, .. }
            | Self::Start { name, .. }
            | Self::End { name, .. }
            | Self::Next { name, .. }
            | Self::Section { name, .. }
            | Self::Subtable { name, .. } => name,
        }
    }

    pub fn kind(&self) -> SymbolKind {
        match self {
            Self::UserOp { .. } => SymbolKind::UserOp,
            Self::Epsilon { .. } => SymbolKind::Epsilon,
            Self::Token { .. } => SymbolKind::Token,
            Self::Value { .. } => SymbolKind::Value,
            Self::ValueMap { .. } => SymbolKind::ValueMap,
            Self::Name { .. } => SymbolKind::Name,
            Self::Varnode { .. } => SymbolKind::Varnode,
            Self::Context { .. } => SymbolKind::Context,
            Self::VarnodeList { .. } => SymbolKind::VarnodeList,
            Self::Operand { .. } => SymbolKind::Operand,
            Self::Start { .. } => SymbolKind::Start,
            Self::End { .. } => SymbolKind::End,
            Self::Next { .. } => SymbolKind::Next,
            Self::Section { .. } => SymbolKind::Section,
            Self::Subtable { .. } => SymbolKind::Subtable,
        }
    }

    pub fn is_subtable(&self) -> bool {
        matches!(self, Self::Subtable { .. })
    }

    pub fn is_operand(&self) -> bool {
        matches!(self, Self::Operand { .. })
    }

    /// Bytes an operand consumes at minimum; zero for everything else.
    pub fn minimum_length(&self) -> usize {
        if let Self::Operand { min_length, .. } = self {
            *min_length
        } else {
            0
        }
    }

    pub fn defining_expression(&self) -> Option<&PatternExpression> {
        if let Self::Operand { def_expr, .. } = self {
            def_expr.as_ref()
        } else {
            None
        }
    }

    pub fn defining_symbol<'b>(&self, symbols: &'b SymbolTable) -> Result<Option<&'b Symbol>, Error> {
        match self {
            Self::Operand { subsym_id: Some(id), .. } => symbols.symbol(*id).map(Some),
            _ => Ok(None),
        }
    }

    pub fn pattern_value(&self) -> Result<&PatternExpression, Error> {
        match self {
            Self::Value { pattern_value, .. }
            | Self::ValueMap { pattern_value, .. }
            | Self::Name { pattern_value, .. }
            | Self::Context { pattern_value, .. }
            | Self::VarnodeList { pattern_value, .. }
            | Self::Start { pattern_value, .. }
            | Self::End { pattern_value, .. } => Ok(pattern_value),
            Self::Operand { local_expr, .. } => Ok(local_expr),
            _ => Err(Error::InvalidPattern),
        }
    }

    pub fn constructors(&self) -> Result<&[Constructor], Error> {
        if let Self::Subtable { constructors, .. } = self {
            Ok(constructors)
        } else {
            Err(Error::InvalidSymbol(self.id()))
        }
    }

    /// Rejects an attached-table operand whose selected entry is absent.
    pub fn check_entry<'b, 'c>(
        &'b self,
        walker: &ParserWalker<'b, 'c>,
        symbols: &'b SymbolTable,
    ) -> Result<(), Error> {
        match self {
            Self::ValueMap { pattern_value, value_table, .. } => {
                let index = entry(pattern_value, walker, symbols, value_table.len())?;
                value_table[index].map(|_| ()).ok_or(Error::InvalidEntry)
            }
            Self::Name { pattern_value, name_table, .. } => {
                let index = entry(pattern_value, walker, symbols, name_table.len())?;
                name_table[index].as_ref().map(|_| ()).ok_or(Error::InvalidEntry)
            }
            Self::VarnodeList { pattern_value, varnode_table, .. } => {
                let index = entry(pattern_value, walker, symbols, varnode_table.len())?;
                varnode_table[index].map(|_| ()).ok_or(Error::InvalidEntry)
            }
            _ => Ok(()),
        }
    }

    pub fn fixed_handle<'b, 'c>(
        &'b self,
        walker: &ParserWalker<'b, 'c>,
        manager: &'b SpaceManager,
        symbols: &'b SymbolTable,
    ) -> Result<FixedHandle<'b>, Error> {
        Ok(match self {
            Self::Epsilon { .. } => FixedHandle::new(manager.constant_space_ref()),
            Self::Name { pattern_value, .. }
            | Self::Value { pattern_value, .. }
            | Self::Context { pattern_value, .. } => FixedHandle::constant(
                manager.constant_space_ref(),
                pattern_value.value(walker, symbols)? as u64,
            ),
            Self::ValueMap { pattern_value, value_table, .. } => {
                let index = entry(pattern_value, walker, symbols, value_table.len())?;
                let value = value_table[index].ok_or(Error::InvalidEntry)?;
                FixedHandle::constant(manager.constant_space_ref(), value as u64)
            }
            Self::Varnode { space, offset, size, .. } => FixedHandle {
                size: *size,
                offset_offset: *offset,
                ..FixedHandle::new(manager.space_by_id(*space).ok_or(Error::InvalidSpace)?)
            },
            Self::VarnodeList { pattern_value, varnode_table, .. } => {
                let index = entry(pattern_value, walker, symbols, varnode_table.len())?;
                let id = varnode_table[index].ok_or(Error::InvalidEntry)?;
                symbols.symbol(id)?.fixed_handle(walker, manager, symbols)?
            }
            Self::Operand { handle_index, .. } => walker.handle(*handle_index)?.clone(),
            Self::Start { .. } | Self::End { .. } | Self::Next { .. } => {
                let address = match self {
                    Self::Start { .. } => walker.address(),
                    Self::End { .. } => walker.next_address().ok_or(Error::InvalidNextAddress)?,
                    _ => walker.next2_address().ok_or(Error::InvalidNextAddress)?,
                };
                let space = manager
                    .space_by_id(address.space_ref().id())
                    .ok_or(Error::InvalidSpace)?;
                FixedHandle {
                    size: space.address_size(),
                    offset_offset: address.offset(),
                    ..FixedHandle::new(space)
                }
            }
            _ => return Err(Error::InvalidHandle),
        })
    }

    /// Appends this symbol's rendering at the walker's position to `out`.
    pub fn format<'b, 'c>(
        &'b self,
        out: &mut String,
        walker: &mut ParserWalker<'b, 'c>,
        symbols: &'b SymbolTable,
    ) -> Result<(), Error> {
        match self {
            Self::Operand { subsym_id, handle_index, def_expr, .. } => {
                walker.push_operand(*handle_index)?;
                match (subsym_id, def_expr) {
                    (Some(id), _) => {
                        let sym = symbols.symbol(*id)?;
                        if sym.is_subtable() {
                            walker.constructor()?.format(out, walker, symbols)?;
                        } else {
                            sym.format(out, walker, symbols)?;
                        }
                    }
                    (None, Some(expr)) => push_value(out, expr.value(walker, symbols)?),
                    (None, None) => return Err(Error::InvalidSymbol(self.id())),
                }
                walker.pop_operand()?;
            }
            Self::Varnode { name, .. } => out.push_str(name),
            Self::VarnodeList { pattern_value, varnode_table, .. } => {
                let index = entry(pattern_value, walker, symbols, varnode_table.len())?;
                let id = varnode_table[index].ok_or(Error::InvalidEntry)?;
                out.push_str(symbols.symbol(id)?.name());
            }
            Self::Name { pattern_value, name_table, .. } => {
                let index = entry(pattern_value, walker, symbols, name_table.len())?;
                out.push_str(name_table[index].as_deref().ok_or(Error::InvalidEntry)?);
            }
            Self::Epsilon { .. } => out.push('0'),
            Self::Value { pattern_value, hex, .. } => {
                let value = pattern_value.value(walker, symbols)?;
                if *hex {
                    push_value(out, value);
                } else {
                    out.push_str(&value.to_string());
                }
            }
            Self::Context { pattern_value, .. } => {
                push_value(out, pattern_value.value(walker, symbols)?)
            }
            Self::ValueMap { pattern_value, value_table, .. } => {
                let index = entry(pattern_value, walker, symbols, value_table.len())?;
                push_value(out, value_table[index].ok_or(Error::InvalidEntry)?);
            }
            Self::Start { .. } => push_value(out, walker.address().offset() as i64),
            Self::End { .. } => push_value(
                out,
                walker.next_address().ok_or(Error::InvalidNextAddress)?.offset() as i64,
            ),
            Self::Next { .. } => push_value(
                out,
                walker.next2_address().ok_or(Error::InvalidNextAddress)?.offset() as i64,
            ),
            _ => return Err(Error::InvalidSymbol(self.id())),
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn values_render_as_signed_hex() {
        let mut out = String::new();
        push_value(&mut out, 0x1f);
        out.push(' ');
        push_value(&mut out, -16);
        out.push(' ');
        push_value(&mut out, i64::MIN);
        assert_eq!(out, "0x1f -0x10 -0x8000000000000000");
    }

    #[test]
    fn accessors() {
        let sym = Symbol::Operand {
            id: 3,
            scope: 1,
            name: Ustr::from("rd"),
            handle_index: 0,
            offset: 0,
            base: None,
            min_length: 2,
            subsym_id: None,
            is_code: false,
            local_expr: PatternExpression::constant(0),
            def_expr: Some(PatternExpression::constant(7)),
        };

        assert_eq!(sym.id(), 3);
        assert_eq!(sym.scope(), 1);
        assert_eq!(sym.name(), "rd");
        assert_eq!(sym.kind(), SymbolKind::Operand);
        assert_eq!(sym.minimum_length(), 2);
        assert!(sym.defining_expression().is_some());
        assert!(sym.constructors().is_err());
    }
}
