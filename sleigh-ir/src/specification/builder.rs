use crate::disassembly::construct::ConstructTpl;
use crate::disassembly::context::ContextBitRange;
use crate::disassembly::pattern::{DisjointPattern, PatternBlock, PatternExpression};
use crate::disassembly::symbol::{
    Constructor, ContextChange, DecisionPair, PrintPiece, Symbol, SymbolScope, SymbolTable,
};
use crate::space::{property, AddressSpaceId, SpaceKind};
use crate::space_manager::SpaceManager;
use crate::specification::decision;
use crate::specification::equation::{Compiled, Extent, PatternEquation, Resolver};
use crate::specification::template::{self, OperandClass, Statement, TemplateResolver, TemporaryAllocator, Value};
use crate::specification::{Specification, SpecificationError};

use sleigh_arch::ArchitectureDef;
use sleigh_bytes::Endian;

use smallvec::SmallVec;
use ustr::Ustr;

pub const ROOT_TABLE: &str = "instruction";
pub const INST_START: &str = "inst_start";
pub const INST_NEXT: &str = "inst_next";
pub const INST_NEXT2: &str = "inst_next2";

const GLOBAL_SCOPE: usize = 0;

/// How an operand obtains its value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperandSpec {
    /// A field, register, attached table, subtable or other global symbol.
    Symbol(String),
    /// A value computed from fields and earlier operands.
    Expression(PatternExpression),
}

impl OperandSpec {
    pub fn symbol(name: impl Into<String>) -> Self {
        Self::Symbol(name.into())
    }
}

#[derive(Debug, Clone)]
struct PendingConstructor {
    table: usize,
    id: usize,
    description: String,
    operands: SmallVec<[usize; 4]>,
    equation: Option<PatternEquation>,
    print_pieces: Vec<PrintPiece>,
    context: Vec<ContextChange>,
    template: Option<Vec<Statement>>,
    sections: Vec<(usize, Vec<Statement>)>,
}

/// Assembles a [`Specification`] from tokens, fields, registers and
/// constructors.
///
/// Names are resolved as they are declared; constructors are compiled, and
/// their tables' minimum lengths and decision trees computed, by
/// [`SpecificationBuilder::build`].
#[derive(Debug, Clone)]
pub struct SpecificationBuilder {
    name: String,
    architecture: Option<ArchitectureDef>,
    endian: Endian,
    alignment: usize,
    unique_mask: u64,
    manager: SpaceManager,
    scopes: Vec<SymbolScope>,
    symbols: Vec<Symbol>,
    sections: Vec<Ustr>,
    context_defaults: Vec<(Ustr, u32)>,
    program_counter: Option<Ustr>,
    user_ops: usize,
    needs_next2: bool,
    constructors: Vec<PendingConstructor>,
    root: usize,
}

impl SpecificationBuilder {
    pub fn new(name: impl Into<String>, endian: Endian, alignment: usize) -> Self {
        let mut builder = Self {
            name: name.into(),
            architecture: None,
            endian,
            alignment: alignment.max(1),
            unique_mask: 0xff,
            manager: SpaceManager::new(),
            scopes: vec![SymbolScope::new(GLOBAL_SCOPE, None)],
            symbols: Vec::new(),
            sections: Vec::new(),
            context_defaults: Vec::new(),
            program_counter: None,
            user_ops: 0,
            needs_next2: false,
            constructors: Vec::new(),
            root: 0,
        };

        builder.root = builder.push_symbol(ROOT_TABLE.into(), |id, name| Symbol::Subtable {
            id,
            scope: GLOBAL_SCOPE,
            name,
            constructors: Vec::new(),
            decision_tree: Default::default(),
        });
        builder.push_symbol(INST_START.into(), |id, name| Symbol::Start {
            id,
            scope: GLOBAL_SCOPE,
            name,
            pattern_value: PatternExpression::StartInstruction,
        });
        builder.push_symbol(INST_NEXT.into(), |id, name| Symbol::End {
            id,
            scope: GLOBAL_SCOPE,
            name,
            pattern_value: PatternExpression::EndInstruction,
        });
        builder.push_symbol(INST_NEXT2.into(), |id, name| Symbol::Next {
            id,
            scope: GLOBAL_SCOPE,
            name,
        });

        builder
    }

    fn push_symbol(&mut self, name: Ustr, make: impl FnOnce(usize, Ustr) -> Symbol) -> usize {
        let id = self.symbols.len();
        self.scopes[GLOBAL_SCOPE].add_symbol(name, id);
        self.symbols.push(make(id, name));
        id
    }

    fn add_global(
        &mut self,
        name: &str,
        make: impl FnOnce(usize, Ustr) -> Symbol,
    ) -> Result<usize, SpecificationError> {
        let name = Ustr::from(name);
        if self.scopes[GLOBAL_SCOPE].find(&name).is_some() {
            return Err(SpecificationError::DuplicateSymbol(name.to_string()))
        }
        Ok(self.push_symbol(name, make))
    }

    fn global(&self, name: &str) -> Option<&Symbol> {
        self.scopes[GLOBAL_SCOPE]
            .find(name)
            .and_then(|id| self.symbols.get(id))
    }

    fn global_id(&self, name: &str, context: &str) -> Result<usize, SpecificationError> {
        self.scopes[GLOBAL_SCOPE]
            .find(name)
            .ok_or_else(|| SpecificationError::unresolved(name, context))
    }

    pub fn architecture(&mut self, architecture: ArchitectureDef) -> &mut Self {
        self.architecture = Some(architecture);
        self
    }

    /// Bits of the instruction address mixed into temporary offsets.
    pub fn unique_mask(&mut self, mask: u64) -> &mut Self {
        self.unique_mask = mask;
        self
    }

    pub fn space(
        &mut self,
        name: &str,
        kind: SpaceKind,
        address_size: usize,
        word_size: usize,
    ) -> Result<AddressSpaceId, SpecificationError> {
        if self.global(name).is_some() {
            return Err(SpecificationError::DuplicateSymbol(name.to_owned()))
        }

        let properties = if self.endian.is_big() {
            Some(property::BigEndian)
        } else {
            None
        };
        let delay = if kind == SpaceKind::Default { 1 } else { 0 };

        let space = self
            .manager
            .add_space(kind, name, address_size, word_size, properties, delay)?;
        Ok(space.id())
    }

    /// Declares the space instructions are fetched from.
    pub fn default_space(
        &mut self,
        name: &str,
        address_size: usize,
        word_size: usize,
    ) -> Result<AddressSpaceId, SpecificationError> {
        self.space(name, SpaceKind::Default, address_size, word_size)
    }

    pub fn token(&mut self, name: &str, bits: usize, endian: Endian) -> Result<usize, SpecificationError> {
        if bits == 0 || bits % 8 != 0 || bits > 64 {
            return Err(SpecificationError::IllFormedField {
                name: name.to_owned(),
                low: 0,
                high: bits.saturating_sub(1),
                width: 64,
            })
        }

        self.add_global(name, |id, name| Symbol::Token {
            id,
            scope: GLOBAL_SCOPE,
            name,
            size: bits / 8,
            endian,
        })
    }

    /// Declares bits `low..=high` of `token` as a field; bit zero is the
    /// token's least significant bit.
    pub fn field(
        &mut self,
        token: &str,
        name: &str,
        low: usize,
        high: usize,
        signed: bool,
        hex: bool,
    ) -> Result<usize, SpecificationError> {
        let (size, endian) = match self.global(token) {
            Some(Symbol::Token { size, endian, .. }) => (*size, *endian),
            _ => return Err(SpecificationError::unresolved(token, format!("field `{}`", name))),
        };

        if low > high || high >= size * 8 {
            return Err(SpecificationError::IllFormedField {
                name: name.to_owned(),
                low,
                high,
                width: size * 8,
            })
        }

        self.add_global(name, |id, name| Symbol::Value {
            id,
            scope: GLOBAL_SCOPE,
            name,
            pattern_value: PatternExpression::token_field(endian, size, low, high, signed),
            hex,
        })
    }

    /// Declares bits `low..=high` of the context as a variable, numbering
    /// bits from the most significant bit of the first context word. A
    /// flowing variable's committed value persists past the target address.
    pub fn context_field(
        &mut self,
        name: &str,
        low: usize,
        high: usize,
        signed: bool,
        flow: bool,
    ) -> Result<usize, SpecificationError> {
        if low > high || low / 32 != high / 32 {
            return Err(SpecificationError::IllFormedField {
                name: name.to_owned(),
                low,
                high,
                width: 32,
            })
        }

        self.add_global(name, |id, name| Symbol::Context {
            id,
            scope: GLOBAL_SCOPE,
            name,
            pattern_value: PatternExpression::context_field(low, high, signed),
            varnode_id: None,
            low,
            high,
            flow,
        })
    }

    pub fn context_default(&mut self, name: &str, value: u32) -> Result<&mut Self, SpecificationError> {
        match self.global(name) {
            Some(Symbol::Context { .. }) => {
                self.context_defaults.push((Ustr::from(name), value));
                Ok(self)
            }
            _ => Err(SpecificationError::unresolved(name, "context default")),
        }
    }

    pub fn register(
        &mut self,
        name: &str,
        space: &str,
        offset: u64,
        size: usize,
    ) -> Result<usize, SpecificationError> {
        let space = self
            .manager
            .space_by_name(space)
            .ok_or_else(|| SpecificationError::unresolved(space, format!("register `{}`", name)))?
            .id();

        self.add_global(name, |id, name| Symbol::Varnode {
            id,
            scope: GLOBAL_SCOPE,
            name,
            space,
            offset,
            size,
        })
    }

    /// Names the register holding the program counter.
    pub fn program_counter(&mut self, name: &str) -> Result<&mut Self, SpecificationError> {
        match self.global(name) {
            Some(Symbol::Varnode { .. }) => {
                self.program_counter = Some(Ustr::from(name));
                Ok(self)
            }
            _ => Err(SpecificationError::unresolved(name, "program counter")),
        }
    }

    pub fn user_op(&mut self, name: &str) -> Result<usize, SpecificationError> {
        let index = self.user_ops;
        let id = self.add_global(name, |id, name| Symbol::UserOp {
            id,
            scope: GLOBAL_SCOPE,
            name,
            index,
        })?;
        self.user_ops += 1;
        Ok(id)
    }

    pub fn subtable(&mut self, name: &str) -> Result<usize, SpecificationError> {
        self.add_global(name, |id, name| Symbol::Subtable {
            id,
            scope: GLOBAL_SCOPE,
            name,
            constructors: Vec::new(),
            decision_tree: Default::default(),
        })
    }

    /// Replaces the token field `field` by one attached to a table; `f`
    /// builds the new symbol from the field's id, name and expression.
    fn attach(
        &mut self,
        field: &str,
        f: impl FnOnce(usize, Ustr, PatternExpression) -> Symbol,
    ) -> Result<&mut Self, SpecificationError> {
        let id = self.global_id(field, "attach")?;
        let (name, pattern_value) = match &self.symbols[id] {
            Symbol::Value { name, pattern_value, .. } => (*name, pattern_value.clone()),
            _ => {
                return Err(SpecificationError::unresolved(
                    field,
                    "attach (not an unattached token field)",
                ))
            }
        };
        self.symbols[id] = f(id, name, pattern_value);
        Ok(self)
    }

    /// Maps field values to integers; `None` entries are invalid encodings.
    pub fn attach_values(&mut self, field: &str, values: &[Option<i64>]) -> Result<&mut Self, SpecificationError> {
        let value_table = values.to_vec();
        self.attach(field, |id, name, pattern_value| Symbol::ValueMap {
            id,
            scope: GLOBAL_SCOPE,
            name,
            pattern_value,
            value_table,
        })
    }

    pub fn attach_names(&mut self, field: &str, names: &[Option<&str>]) -> Result<&mut Self, SpecificationError> {
        let name_table = names.iter().map(|n| n.map(str::to_owned)).collect();
        self.attach(field, |id, name, pattern_value| Symbol::Name {
            id,
            scope: GLOBAL_SCOPE,
            name,
            pattern_value,
            name_table,
        })
    }

    /// Maps field values to registers.
    pub fn attach_registers(&mut self, field: &str, registers: &[Option<&str>]) -> Result<&mut Self, SpecificationError> {
        let context = format!("registers attached to `{}`", field);
        let varnode_table = registers
            .iter()
            .map(|register| match register {
                Some(register) => match self.global(register) {
                    Some(Symbol::Varnode { id, .. }) => Ok(Some(*id)),
                    _ => Err(SpecificationError::unresolved(*register, context.as_str())),
                },
                None => Ok(None),
            })
            .collect::<Result<Vec<_>, _>>()?;

        self.attach(field, |id, name, pattern_value| Symbol::VarnodeList {
            id,
            scope: GLOBAL_SCOPE,
            name,
            pattern_value,
            varnode_table,
        })
    }

    /// Starts a constructor of `table`; it is added once
    /// [`ConstructorBuilder::finish`] succeeds.
    pub fn constructor(&mut self, table: &str) -> ConstructorBuilder<'_> {
        let (table_id, error) = match self.global(table) {
            Some(Symbol::Subtable { id, .. }) => (*id, None),
            _ => (0, Some(SpecificationError::unresolved(table, "constructor"))),
        };
        let id = self.constructors.iter().filter(|c| c.table == table_id).count();

        ConstructorBuilder {
            description: format!("constructor {} of `{}`", id, table),
            builder: self,
            table: table_id,
            id,
            operands: Vec::new(),
            equation: None,
            display: String::new(),
            context: Vec::new(),
            template: None,
            sections: Vec::new(),
            error,
        }
    }

    fn section_index(&mut self, name: &str) -> usize {
        let name = Ustr::from(name);
        match self.sections.iter().position(|section| *section == name) {
            Some(index) => index,
            None => {
                self.sections.push(name);
                self.sections.len() - 1
            }
        }
    }

    /// Operand symbols of a pending constructor, in operand order.
    fn operand_symbols<'a>(&'a self, ctor: &'a PendingConstructor) -> impl Iterator<Item = &'a Symbol> + 'a {
        ctor.operands.iter().filter_map(move |id| self.symbols.get(*id))
    }

    fn defining_symbol(&self, operand: &Symbol) -> Option<&Symbol> {
        match operand {
            Symbol::Operand { subsym_id: Some(id), .. } => self.symbols.get(*id),
            _ => None,
        }
    }

    fn compile_equation(&self, ctor: &PendingConstructor) -> Result<Compiled, SpecificationError> {
        match &ctor.equation {
            Some(equation) => {
                let resolver = EquationScope { builder: self, ctor };
                equation.compile(&resolver, &ctor.description)
            }
            None => Ok(Compiled {
                patterns: vec![DisjointPattern::new(PatternBlock::new(true), PatternBlock::new(true))],
                length: 0,
                placements: Vec::new(),
            }),
        }
    }

    /// Minimum length of operand `operand` given the current table
    /// minimums.
    fn operand_length(&self, operand: &Symbol, table_lengths: &[usize]) -> usize {
        match self.defining_symbol(operand) {
            Some(Symbol::Subtable { id, .. }) => table_lengths.get(*id).copied().unwrap_or(0),
            Some(sym) => sym.pattern_value().map(field_length).unwrap_or(0),
            None => 0,
        }
    }

    fn constructor_length(
        &self,
        ctor: &PendingConstructor,
        compiled: &Compiled,
        table_lengths: &[usize],
    ) -> Result<usize, SpecificationError> {
        let mut ends: Vec<usize> = Vec::with_capacity(ctor.operands.len());
        let mut length = compiled.length;

        for (index, operand) in self.operand_symbols(ctor).enumerate() {
            let start = match placement(compiled, index) {
                (None, offset) => offset,
                (Some(base), offset) => {
                    let end = ends.get(base).copied().ok_or_else(|| {
                        SpecificationError::pattern(
                            ctor.description.as_str(),
                            format!("operand {} is placed after the later operand {}", index, base),
                        )
                    })?;
                    end + offset
                }
            };
            let end = start + self.operand_length(operand, table_lengths);
            length = length.max(end);
            ends.push(end);
        }

        Ok(length)
    }

    fn table_lengths(&self, compiled: &[Compiled]) -> Result<Vec<usize>, SpecificationError> {
        let mut lengths = vec![0usize; self.symbols.len()];
        let tables = self.symbols.iter().filter(|s| s.is_subtable()).count();

        for _ in 0..(tables + 2) * 8 {
            let mut next = vec![None::<usize>; self.symbols.len()];
            for (ctor, compiled) in self.constructors.iter().zip(compiled.iter()) {
                let length = self.constructor_length(ctor, compiled, &lengths)?;
                let entry = &mut next[ctor.table];
                *entry = Some(entry.map_or(length, |current| current.min(length)));
            }

            let next = next.into_iter().map(|v| v.unwrap_or(0)).collect::<Vec<_>>();
            if next == lengths {
                return Ok(lengths)
            }
            lengths = next;
        }

        Err(SpecificationError::pattern(
            "subtables",
            "recursive subtables have no finite minimum length",
        ))
    }

    fn operand_class(&self, operand: &Symbol) -> OperandClass {
        match self.defining_symbol(operand) {
            Some(Symbol::Subtable { .. }) => OperandClass::Subtable,
            Some(Symbol::Varnode { .. })
            | Some(Symbol::VarnodeList { .. })
            | Some(Symbol::Start { .. })
            | Some(Symbol::End { .. })
            | Some(Symbol::Next { .. }) => OperandClass::Location,
            _ => OperandClass::Constant,
        }
    }

    fn compile_templates(
        &self,
        ctor: &PendingConstructor,
        allocator: &mut TemporaryAllocator,
    ) -> Result<(Option<ConstructTpl>, Vec<Option<ConstructTpl>>), SpecificationError> {
        let resolver = TemplateScope { builder: self, ctor };

        let main = ctor
            .template
            .as_ref()
            .map(|statements| template::compile(statements, &resolver, allocator, &ctor.description))
            .transpose()?;

        let mut named = vec![None; self.sections.len()];
        for (index, statements) in ctor.sections.iter() {
            named[*index] = Some(template::compile(statements, &resolver, allocator, &ctor.description)?);
        }

        Ok((main, named))
    }

    /// Compiles every constructor, sizes the subtables and builds their
    /// decision trees.
    pub fn build(mut self) -> Result<Specification, SpecificationError> {
        if self.manager.space_by_name("unique").is_none() {
            self.manager.add_space(SpaceKind::Internal, "unique", 4, 1, None, 0)?;
        }
        self.manager.validate()?;

        let compiled = self
            .constructors
            .iter()
            .map(|ctor| self.compile_equation(ctor))
            .collect::<Result<Vec<_>, _>>()?;

        let lengths = self.table_lengths(&compiled)?;

        // fix operand placement now that lengths are known
        for (ctor, compiled) in self.constructors.iter().zip(compiled.iter()) {
            for (index, id) in ctor.operands.iter().enumerate() {
                let min = self.operand_length(&self.symbols[*id], &lengths);
                let (new_base, new_offset) = placement(compiled, index);
                if let Some(Symbol::Operand { base, offset, min_length, .. }) = self.symbols.get_mut(*id) {
                    *base = new_base;
                    *offset = new_offset;
                    *min_length = min;
                }
            }
        }

        let mut allocator = TemporaryAllocator::new(self.unique_mask);
        let mut tables: Vec<Vec<Constructor>> = vec![Vec::new(); self.symbols.len()];
        let mut pairs: Vec<Vec<DecisionPair>> = vec![Vec::new(); self.symbols.len()];

        for (ctor, compiled) in self.constructors.iter().zip(compiled.into_iter()) {
            let (template, named) = self.compile_templates(ctor, &mut allocator)?;
            let min_length = self.constructor_length(ctor, &compiled, &lengths)?;

            log::trace!(
                "compiled {} ({} patterns, minimum length {})",
                ctor.description,
                compiled.patterns.len(),
                min_length
            );

            tables[ctor.table].push(Constructor::new(
                ctor.table,
                ctor.id,
                min_length,
                ctor.operands.clone(),
                ctor.print_pieces.clone(),
                ctor.context.clone(),
                template,
                named,
            ));

            pairs[ctor.table].extend(
                compiled
                    .patterns
                    .into_iter()
                    .filter(|pattern| !pattern.always_false())
                    .map(|pattern| DecisionPair::new(ctor.id, pattern)),
            );
        }

        for (symbol, (ctors, pairs)) in self.symbols.iter_mut().zip(tables.into_iter().zip(pairs.into_iter())) {
            if let Symbol::Subtable { constructors, decision_tree, name, .. } = symbol {
                if ctors.is_empty() {
                    log::warn!("subtable `{}` has no constructors", name);
                }
                *constructors = ctors;
                *decision_tree = decision::build(pairs);
            }
        }

        let symbols = SymbolTable::new(self.scopes, self.symbols, self.root);

        Ok(Specification {
            name: self.name,
            architecture: self.architecture,
            endian: self.endian,
            alignment: self.alignment,
            unique_mask: self.unique_mask,
            unique_span: allocator.span(),
            needs_next2: self.needs_next2,
            sections: self.sections,
            context_defaults: self.context_defaults,
            program_counter: self.program_counter,
            manager: self.manager,
            symbols,
        })
    }
}

fn field_length(expr: &PatternExpression) -> usize {
    match expr {
        PatternExpression::TokenField { byte_end, .. } => byte_end + 1,
        _ => 0,
    }
}

fn placement(compiled: &Compiled, index: usize) -> (Option<usize>, usize) {
    compiled
        .placements
        .iter()
        .find(|p| p.operand == index)
        .map(|p| (p.base, p.offset))
        .unwrap_or((None, 0))
}

fn uses_next2(statements: &[Statement]) -> bool {
    fn value(v: &Value) -> bool {
        match v {
            Value::InstNext2 { .. } => true,
            Value::Memory { address, .. } => value(address),
            Value::Deref { pointer, .. } => value(pointer),
            _ => false,
        }
    }

    statements.iter().any(|statement| match statement {
        Statement::Op { output, inputs, .. } => {
            output.as_ref().map(value).unwrap_or(false) || inputs.iter().any(value)
        }
        Statement::Export(v) => value(v),
        _ => false,
    })
}

/// Splits a display string into print pieces: operand names become
/// operand references, runs of whitespace a single space, and `^` joins
/// adjacent pieces without a space.
fn print_pieces(display: &str, operands: &[Ustr]) -> Vec<PrintPiece> {
    let mut pieces = Vec::new();
    let mut text = String::new();
    let mut chars = display.trim().chars().peekable();

    fn flush(text: &mut String, pieces: &mut Vec<PrintPiece>) {
        if !text.is_empty() {
            pieces.push(PrintPiece::Text(std::mem::take(text)));
        }
    }

    while let Some(c) = chars.next() {
        if c.is_whitespace() {
            while chars.peek().map(|c| c.is_whitespace()).unwrap_or(false) {
                chars.next();
            }
            flush(&mut text, &mut pieces);
            pieces.push(PrintPiece::Text(" ".to_owned()));
        } else if c == '^' {
            flush(&mut text, &mut pieces);
        } else if c.is_alphabetic() || c == '_' {
            let mut ident = c.to_string();
            while let Some(n) = chars.peek().copied().filter(|n| n.is_alphanumeric() || *n == '_' || *n == '.') {
                ident.push(n);
                chars.next();
            }
            match operands.iter().position(|o| o.as_str() == ident) {
                Some(index) => {
                    flush(&mut text, &mut pieces);
                    pieces.push(PrintPiece::Operand(index));
                }
                None => text.push_str(&ident),
            }
        } else {
            text.push(c);
        }
    }
    flush(&mut text, &mut pieces);

    pieces
}

struct EquationScope<'a> {
    builder: &'a SpecificationBuilder,
    ctor: &'a PendingConstructor,
}

impl<'a> EquationScope<'a> {
    fn local(&self, name: &str) -> Option<(usize, &'a Symbol)> {
        self.builder
            .operand_symbols(self.ctor)
            .enumerate()
            .find(|(_, operand)| operand.name() == name)
    }
}

impl<'a> Resolver for EquationScope<'a> {
    fn field(&self, name: &str) -> Option<&PatternExpression> {
        let field = |sym: &'a Symbol| match sym {
            Symbol::Value { pattern_value, .. }
            | Symbol::ValueMap { pattern_value, .. }
            | Symbol::Name { pattern_value, .. }
            | Symbol::VarnodeList { pattern_value, .. }
            | Symbol::Context { pattern_value, .. } => Some(pattern_value),
            _ => None,
        };

        self.builder.global(name).and_then(field).or_else(|| {
            self.local(name)
                .and_then(|(_, operand)| self.builder.defining_symbol(operand))
                .and_then(field)
        })
    }

    fn operand(&self, name: &str) -> Option<(usize, Extent)> {
        let (index, operand) = self.local(name)?;
        let extent = match self.builder.defining_symbol(operand) {
            Some(Symbol::Subtable { .. }) => Extent::Variable,
            Some(sym) => Extent::Fixed(sym.pattern_value().map(field_length).unwrap_or(0)),
            None => Extent::Fixed(0),
        };
        Some((index, extent))
    }
}

struct TemplateScope<'a> {
    builder: &'a SpecificationBuilder,
    ctor: &'a PendingConstructor,
}

impl<'a> TemplateResolver for TemplateScope<'a> {
    fn operand(&self, name: &str) -> Option<(usize, OperandClass)> {
        self.builder
            .operand_symbols(self.ctor)
            .enumerate()
            .find(|(_, operand)| operand.name() == name)
            .map(|(index, operand)| (index, self.builder.operand_class(operand)))
    }

    fn register(&self, name: &str) -> Option<(AddressSpaceId, u64, usize)> {
        match self.builder.global(name)? {
            Symbol::Varnode { space, offset, size, .. } => Some((*space, *offset, *size)),
            _ => None,
        }
    }

    fn user_op(&self, name: &str) -> Option<usize> {
        match self.builder.global(name)? {
            Symbol::UserOp { index, .. } => Some(*index),
            _ => None,
        }
    }

    fn space(&self, name: &str) -> Option<(AddressSpaceId, usize)> {
        self.builder
            .manager
            .space_by_name(name)
            .map(|space| (space.id(), space.address_size()))
    }

    fn constant_space(&self) -> AddressSpaceId {
        self.builder.manager.constant_space_id()
    }

    fn unique_space(&self) -> AddressSpaceId {
        self.builder.manager.unique_space_id()
    }
}

#[derive(Debug, Clone)]
enum ContextSpec {
    Set { field: String, value: PatternExpression },
    Commit { target: String, field: String },
}

/// Collects one constructor. Errors are held until [`finish`](Self::finish).
pub struct ConstructorBuilder<'a> {
    builder: &'a mut SpecificationBuilder,
    table: usize,
    id: usize,
    description: String,
    operands: Vec<(Ustr, OperandSpec)>,
    equation: Option<PatternEquation>,
    display: String,
    context: Vec<ContextSpec>,
    template: Option<Vec<Statement>>,
    sections: Vec<(String, Vec<Statement>)>,
    error: Option<SpecificationError>,
}

impl<'a> ConstructorBuilder<'a> {
    pub fn operand(mut self, name: &str, spec: OperandSpec) -> Self {
        let name = Ustr::from(name);
        if self.error.is_none() && self.operands.iter().any(|(n, _)| *n == name) {
            self.error = Some(SpecificationError::DuplicateSymbol(name.to_string()));
        }
        self.operands.push((name, spec));
        self
    }

    /// The value of an operand declared so far, or of a global field.
    pub fn value(&self, name: &str) -> Result<PatternExpression, SpecificationError> {
        if let Some(index) = self.operands.iter().position(|(n, _)| *n == name) {
            return Ok(PatternExpression::Operand {
                index,
                table_id: self.table,
                constructor_id: self.id,
            })
        }

        match self.builder.global(name) {
            Some(Symbol::Value { pattern_value, .. })
            | Some(Symbol::ValueMap { pattern_value, .. })
            | Some(Symbol::Name { pattern_value, .. })
            | Some(Symbol::VarnodeList { pattern_value, .. })
            | Some(Symbol::Context { pattern_value, .. })
            | Some(Symbol::Start { pattern_value, .. })
            | Some(Symbol::End { pattern_value, .. }) => Ok(pattern_value.clone()),
            _ => Err(SpecificationError::unresolved(name, self.description.as_str())),
        }
    }

    pub fn pattern(mut self, equation: PatternEquation) -> Self {
        self.equation = Some(equation);
        self
    }

    /// Display text; words naming operands print the operand, and the
    /// first space separates the mnemonic from the body.
    pub fn print(mut self, display: &str) -> Self {
        self.display = display.to_owned();
        self
    }

    /// Sets a context variable for the rest of this instruction's decode.
    pub fn context_set(mut self, field: &str, value: PatternExpression) -> Self {
        self.context.push(ContextSpec::Set {
            field: field.to_owned(),
            value,
        });
        self
    }

    /// Commits the current value of `field` to the context database at the
    /// address `target` (an operand or `inst_next`-like symbol) resolves to.
    pub fn global_set(mut self, target: &str, field: &str) -> Self {
        self.context.push(ContextSpec::Commit {
            target: target.to_owned(),
            field: field.to_owned(),
        });
        self
    }

    pub fn template(mut self, statements: Vec<Statement>) -> Self {
        self.template = Some(statements);
        self
    }

    pub fn section(mut self, name: &str, statements: Vec<Statement>) -> Self {
        self.sections.push((name.to_owned(), statements));
        self
    }

    /// Appends a splice of the following `bytes` bytes of instructions to
    /// the semantics.
    pub fn delay_slot(mut self, bytes: usize) -> Self {
        self.template
            .get_or_insert_with(Vec::new)
            .push(Statement::DelaySlot(bytes));
        self
    }

    fn context_field(&self, field: &str) -> Result<(ContextBitRange, bool), SpecificationError> {
        match self.builder.global(field) {
            Some(Symbol::Context { low, high, flow, .. }) => Ok((ContextBitRange::new(*low, *high), *flow)),
            _ => Err(SpecificationError::unresolved(field, self.description.as_str())),
        }
    }

    /// Resolves every name and adds the constructor to its table, returning
    /// its index there.
    pub fn finish(mut self) -> Result<usize, SpecificationError> {
        if let Some(error) = self.error.take() {
            return Err(error)
        }

        let mut context = Vec::with_capacity(self.context.len());
        let scope = self.builder.scopes.len();
        let mut local = SymbolScope::new(scope, Some(GLOBAL_SCOPE));
        let mut operands = SmallVec::<[usize; 4]>::new();
        let mut needs_next2 = self
            .template
            .as_deref()
            .map(uses_next2)
            .unwrap_or(false);

        let mut symbols = Vec::with_capacity(self.operands.len());
        for (index, (name, spec)) in self.operands.iter().enumerate() {
            let (subsym_id, def_expr) = match spec {
                OperandSpec::Symbol(target) => {
                    let sym = self
                        .builder
                        .global(target)
                        .ok_or_else(|| SpecificationError::unresolved(target.as_str(), self.description.as_str()))?;
                    needs_next2 |= matches!(sym, Symbol::Next { .. });
                    (Some(sym.id()), None)
                }
                OperandSpec::Expression(expr) => (None, Some(expr.clone())),
            };

            let id = self.builder.symbols.len() + symbols.len();
            local.add_symbol(*name, id);
            operands.push(id);
            symbols.push(Symbol::Operand {
                id,
                scope,
                name: *name,
                handle_index: index,
                offset: 0,
                base: None,
                min_length: 0,
                subsym_id,
                is_code: false,
                local_expr: PatternExpression::Operand {
                    index,
                    table_id: self.table,
                    constructor_id: self.id,
                },
                def_expr,
            });
        }

        for spec in self.context.iter() {
            match spec {
                ContextSpec::Set { field, value } => {
                    let (range, _) = self.context_field(field)?;
                    context.push(ContextChange::Operator {
                        num: range.word(),
                        shift: range.shift(),
                        mask: range.word_mask(),
                        pattern_value: value.clone(),
                    });
                }
                ContextSpec::Commit { target, field } => {
                    let (range, flow) = self.context_field(field)?;
                    let symbol_id = match local.find(target) {
                        Some(id) => id,
                        None => self.builder.global_id(target, &self.description)?,
                    };
                    context.push(ContextChange::Commit {
                        symbol_id,
                        num: range.word(),
                        mask: range.word_mask(),
                        flow,
                    });
                }
            }
        }

        let names = self.operands.iter().map(|(name, _)| *name).collect::<Vec<_>>();
        let print_pieces = print_pieces(&self.display, &names);

        let mut sections = Vec::with_capacity(self.sections.len());
        for (name, statements) in std::mem::take(&mut self.sections) {
            needs_next2 |= uses_next2(&statements);
            sections.push((self.builder.section_index(&name), statements));
        }

        log::debug!("adding {} with {} operands", self.description, operands.len());

        let builder = self.builder;
        builder.scopes.push(local);
        builder.symbols.extend(symbols);
        builder.needs_next2 |= needs_next2;
        builder.constructors.push(PendingConstructor {
            table: self.table,
            id: self.id,
            description: self.description,
            operands,
            equation: self.equation,
            print_pieces,
            context,
            template: self.template,
            sections,
        });

        Ok(self.id)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::disassembly::Opcode;

    fn base() -> Result<SpecificationBuilder, SpecificationError> {
        let mut builder = SpecificationBuilder::new("toy", Endian::Big, 1);
        builder.default_space("ram", 2, 1)?;
        builder.space("register", SpaceKind::Register, 4, 1)?;
        builder.token("instr", 16, Endian::Big)?;
        builder.field("instr", "op", 12, 15, false, false)?;
        builder.field("instr", "rd", 8, 11, false, false)?;
        builder.field("instr", "imm", 0, 7, false, true)?;
        for i in 0..4 {
            builder.register(&format!("r{}", i), "register", i * 2, 2)?;
        }
        builder.attach_registers("rd", &[Some("r0"), Some("r1"), Some("r2"), Some("r3")])?;
        Ok(builder)
    }

    #[test]
    fn print_layout() {
        let operands = [Ustr::from("rd"), Ustr::from("imm")];
        assert_eq!(
            print_pieces("MOV  rd, imm", &operands),
            vec![
                PrintPiece::Text("MOV".into()),
                PrintPiece::Text(" ".into()),
                PrintPiece::Operand(0),
                PrintPiece::Text(",".into()),
                PrintPiece::Text(" ".into()),
                PrintPiece::Operand(1),
            ]
        );
        assert_eq!(
            print_pieces("J^imm", &operands),
            vec![PrintPiece::Text("J".into()), PrintPiece::Operand(1)]
        );
    }

    #[test]
    fn duplicate_names() -> Result<(), SpecificationError> {
        let mut builder = base()?;
        assert!(matches!(builder.token("instr", 8, Endian::Big), Err(SpecificationError::DuplicateSymbol(_))));
        assert!(matches!(
            builder.field("instr", "wide", 0, 16, false, false),
            Err(SpecificationError::IllFormedField { width: 16, .. })
        ));

        let dup = builder
            .constructor("instruction")
            .operand("rd", OperandSpec::symbol("rd"))
            .operand("rd", OperandSpec::symbol("imm"))
            .finish();
        assert!(matches!(dup, Err(SpecificationError::DuplicateSymbol(_))));

        let unknown = builder
            .constructor("instruction")
            .operand("rd", OperandSpec::symbol("nope"))
            .finish();
        assert!(matches!(unknown, Err(SpecificationError::UnresolvedReference { .. })));
        Ok(())
    }

    #[test]
    fn builds_tables() -> Result<(), Box<dyn std::error::Error>> {
        let mut builder = base()?;
        builder.subtable("src")?;

        builder
            .constructor("src")
            .operand("imm", OperandSpec::symbol("imm"))
            .pattern(PatternEquation::bind("imm"))
            .print("#imm")
            .template(vec![Statement::Export(Value::Constant { value: 0, size: 2 })])
            .finish()?;

        builder
            .constructor("instruction")
            .operand("rd", OperandSpec::symbol("rd"))
            .operand("src", OperandSpec::symbol("src"))
            .pattern(
                (PatternEquation::equal("op", 1) & PatternEquation::bind("rd"))
                    .cat(PatternEquation::bind("src")),
            )
            .print("MOV rd, src")
            .template(vec![
                Statement::build("src"),
                Statement::copy(Value::operand("rd"), Value::operand("src")),
            ])
            .finish()?;

        let spec = builder.build()?;
        let symbols = spec.symbols();
        let root = symbols.root()?;
        let ctor = &root.constructors()?[0];

        assert_eq!(ctor.minimum_length(), 4);
        assert_eq!(ctor.template().unwrap().operations()[1].opcode(), Opcode::Copy);

        let src = symbols.symbol(ctor.operand(1)?)?;
        assert!(matches!(src, Symbol::Operand { offset: 2, base: None, min_length: 2, .. }));
        assert!(!spec.needs_next2());
        Ok(())
    }

    #[test]
    fn unbounded_recursion_is_rejected() -> Result<(), SpecificationError> {
        let mut builder = base()?;
        builder
            .constructor("instruction")
            .operand("next", OperandSpec::symbol("instruction"))
            .pattern(PatternEquation::equal("op", 0).cat(PatternEquation::bind("next")))
            .finish()?;

        assert!(matches!(builder.build(), Err(SpecificationError::IllFormedPattern { .. })));
        Ok(())
    }
}
