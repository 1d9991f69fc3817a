use std::borrow::Borrow;
use std::sync::Arc;

use ahash::AHashMap as Map;
use ustr::Ustr;

use crate::address::AddressValue;

use crate::disassembly::construct::ConstructTpl;
use crate::disassembly::symbol::{Constructor, FixedHandle, Symbol, SymbolTable};
use crate::disassembly::ContextDatabase;
use crate::disassembly::Error as DisassemblyError;
use crate::disassembly::{IRBuilder, NoMatch, PCodeRaw, ParserContext, ParserWalker, Resolution};
use crate::disassembly::VarnodeData;

use crate::error::Error;
use crate::instruction::Instruction;
use crate::space_manager::SpaceManager;
use crate::specification::{Specification, SpecificationError};

/// Default bound on delay slots spliced within delay slots.
pub const DEFAULT_MAX_DELAY_DEPTH: usize = 2;

/// Default number of bytes a single instruction may span.
pub const DEFAULT_WINDOW: usize = 16;

/// Decodes and lifts instructions of a single [`Specification`].
///
/// A translator is immutable once configured; per-session state lives in
/// the [`ContextDatabase`] passed to each call.
#[derive(Debug, Clone)]
pub struct Translator {
    specification: Arc<Specification>,
    context_db: ContextDatabase,

    registers: Map<(u64, usize), Ustr>,
    registers_by_name: Map<Ustr, VarnodeData>,
    user_ops: Vec<Ustr>,
    program_counter: Option<VarnodeData>,

    max_delay_depth: usize,
    window: usize,
}

fn non_match(error: DisassemblyError) -> Result<Resolution, DisassemblyError> {
    match error.non_match() {
        Some(reason) => Ok(Resolution::NoMatch(reason)),
        None => Err(error),
    }
}

impl Translator {
    pub fn new(specification: Arc<Specification>) -> Result<Self, Error> {
        let manager = specification.manager();
        let symbols = specification.symbols();

        let mut context_db = ContextDatabase::new();
        let mut registers = Map::default();
        let mut registers_by_name = Map::default();
        let mut user_ops = Vec::new();

        for symbol in symbols.symbols() {
            match symbol {
                Symbol::Context { name, low, high, .. } => {
                    context_db
                        .register_variable(name.as_str(), *low, *high)
                        .ok_or_else(|| SpecificationError::IllFormedField {
                            name: name.to_string(),
                            low: *low,
                            high: *high,
                            width: 32,
                        })?;
                }
                Symbol::Varnode { name, space, offset, size, .. } => {
                    let space = manager
                        .space_by_id(*space)
                        .ok_or(DisassemblyError::InvalidSpace)?;
                    if space.is_register() {
                        registers.insert((*offset, *size), *name);
                    }
                    registers_by_name.insert(*name, VarnodeData::new(space.clone(), *offset, *size));
                }
                Symbol::UserOp { name, index, .. } => {
                    if user_ops.len() <= *index {
                        user_ops.resize(*index + 1, Ustr::from(""));
                    }
                    user_ops[*index] = *name;
                }
                _ => (),
            }
        }

        for (name, value) in specification.context_defaults() {
            context_db
                .set_variable_default(name.as_str(), *value)
                .ok_or_else(|| SpecificationError::unresolved(name.as_str(), "context default"))?;
        }

        let program_counter = specification
            .program_counter()
            .and_then(|name| registers_by_name.get(&Ustr::from(name)).cloned());

        log::debug!(
            "translator for `{}`: {} registers, {} user operations, {} context words",
            specification.name(),
            registers_by_name.len(),
            user_ops.len(),
            context_db.size(),
        );

        Ok(Self {
            specification,
            context_db,
            registers,
            registers_by_name,
            user_ops,
            program_counter,
            max_delay_depth: DEFAULT_MAX_DELAY_DEPTH,
            window: DEFAULT_WINDOW,
        })
    }

    /// A fresh context database seeded with this translator's defaults.
    pub fn context_database(&self) -> ContextDatabase {
        self.context_db.clone()
    }

    pub fn set_variable_default<S: Borrow<str>>(&mut self, name: S, value: u32) -> Option<()> {
        self.context_db.set_variable_default(name, value)
    }

    /// `address` as an offset into the default (instruction) space.
    pub fn address(&self, address: u64) -> AddressValue {
        AddressValue::new(self.manager().default_space(), address)
    }

    pub fn manager(&self) -> &SpaceManager {
        self.specification.manager()
    }

    pub fn symbol_table(&self) -> &SymbolTable {
        self.specification.symbols()
    }

    pub fn specification(&self) -> &Arc<Specification> {
        &self.specification
    }

    pub fn alignment(&self) -> usize {
        self.specification.alignment()
    }

    pub fn unique_mask(&self) -> u64 {
        self.specification.unique_mask()
    }

    pub fn register_name(&self, offset: u64, size: usize) -> Option<&str> {
        self.registers.get(&(offset, size)).map(Ustr::as_str)
    }

    pub fn register_by_name<S: AsRef<str>>(&self, name: S) -> Option<&VarnodeData> {
        self.registers_by_name.get(&Ustr::from(name.as_ref()))
    }

    pub fn user_ops(&self) -> &[Ustr] {
        &self.user_ops
    }

    pub fn program_counter(&self) -> Option<&VarnodeData> {
        self.program_counter.as_ref()
    }

    pub fn max_delay_depth(&self) -> usize {
        self.max_delay_depth
    }

    pub fn set_max_delay_depth(&mut self, depth: usize) {
        self.max_delay_depth = depth;
    }

    pub fn window(&self) -> usize {
        self.window
    }

    pub fn set_window(&mut self, window: usize) {
        self.window = window.max(1);
    }

    fn check_alignment(&self, address: &AddressValue) -> Result<(), Error> {
        let alignment = self.alignment();
        if alignment > 1 && address.offset() % alignment as u64 != 0 {
            return Err(Error::IncorrectAlignment {
                address: address.offset(),
                alignment,
            })
        }
        Ok(())
    }

    /// Decodes the instruction at `address` into its assembly text and
    /// records its context commits in `db`.
    pub fn disassemble(
        &self,
        db: &mut ContextDatabase,
        address: AddressValue,
        bytes: &[u8],
    ) -> Result<Instruction, Error> {
        self.check_alignment(&address)?;

        let symbols = self.symbol_table();
        let mut context = self.parse(db, address.clone(), bytes)?;

        let mut mnemonic = String::new();
        let mut body = String::new();
        {
            let mut walker = ParserWalker::new(&mut context);
            let ctor = walker.constructor()?;
            ctor.format_mnemonic(&mut mnemonic, &mut walker, symbols)?;
            walker.base_state();
            ctor.format_body(&mut body, &mut walker, symbols)?;
        }

        context.apply_commits(db, self.manager(), symbols)?;

        Ok(Instruction {
            address,
            mnemonic,
            body,
            delay_slots: context.delay_slot(),
            length: context.length(),
        })
    }

    /// Decodes the instruction at `address` and instantiates its semantics,
    /// splicing in any delay-slot instructions. The context commits of the
    /// instruction and its delay slots reach `db` only on success.
    pub fn lift_pcode(
        &self,
        db: &mut ContextDatabase,
        address: AddressValue,
        bytes: &[u8],
    ) -> Result<PCodeRaw, Error> {
        self.lift(db, address, bytes, None)
    }

    /// As [`lift_pcode`](Self::lift_pcode), but instantiates the named
    /// section of each constructor instead of its main semantics.
    pub fn lift_section(
        &self,
        db: &mut ContextDatabase,
        address: AddressValue,
        bytes: &[u8],
        section: &str,
    ) -> Result<PCodeRaw, Error> {
        let index = self
            .specification
            .section_index(section)
            .ok_or_else(|| SpecificationError::unresolved(section, "section lookup"))?;
        self.lift(db, address, bytes, Some(index))
    }

    fn lift(
        &self,
        db: &mut ContextDatabase,
        address: AddressValue,
        bytes: &[u8],
        section: Option<usize>,
    ) -> Result<PCodeRaw, Error> {
        self.check_alignment(&address)?;

        let manager = self.manager();
        let symbols = self.symbol_table();

        let mut context = self.parse(db, address.clone(), bytes)?;

        let length = context.length();
        let delay = context.delay_slot();

        // commits of the instruction and of its delay slots go to `staged`
        // and replace `db` only once the whole instruction has lifted
        let mut staged = None;
        let mut delays = Vec::new();
        if delay > 0 {
            let mut scratch = db.clone();
            context.apply_commits(&mut scratch, manager, symbols)?;
            let fall_offset = self.parse_delay_slots(&mut scratch, &address, bytes, length, delay, 1, &mut delays)?;
            context.set_next_address(address.clone() + fall_offset);
            staged = Some(scratch);
        }

        let delay_contexts = delays
            .iter_mut()
            .map(|context| (context.address().offset(), context))
            .collect::<Map<_, _>>();

        let mut builder = IRBuilder::new(
            ParserWalker::new(&mut context),
            delay_contexts,
            manager,
            symbols,
            self.unique_mask(),
        );

        let ctor = builder.walker().constructor()?;
        match section {
            None => {
                let tpl = ctor.template().ok_or(Error::UnimplementedSemantics {
                    constructor: ctor.id(),
                    table: ctor.table(),
                })?;
                builder.build(tpl, None)?;
            }
            Some(section) => match ctor.named_template(section) {
                Some(tpl) => builder.build(tpl, Some(section))?,
                None => builder.build_empty(ctor, section)?,
            },
        }

        let pcode = builder.emit(length)?;

        match staged {
            Some(scratch) => *db = scratch,
            None => context.apply_commits(db, manager, symbols)?,
        }
        Ok(pcode)
    }

    /// Parses the instructions covering `count` bytes from `start`,
    /// recursively including their own delay slots; returns the offset
    /// just past the last of them.
    #[allow(clippy::too_many_arguments)]
    fn parse_delay_slots<'a>(
        &'a self,
        db: &mut ContextDatabase,
        base: &AddressValue,
        bytes: &[u8],
        start: usize,
        count: usize,
        depth: usize,
        out: &mut Vec<ParserContext<'a>>,
    ) -> Result<usize, Error> {
        if depth > self.max_delay_depth {
            return Err(Error::DelaySlotOverflow(self.max_delay_depth))
        }

        let mut offset = start;
        while offset - start < count {
            let address = base.clone() + offset;
            let mut context = self.parse(db, address.clone(), bytes.get(offset..).unwrap_or(&[]))?;
            context.apply_commits(db, self.manager(), self.symbol_table())?;

            let length = context.length();
            if length == 0 {
                return Err(DisassemblyError::InconsistentState.into())
            }

            log::trace!("parsed delay slot instruction at {} ({} bytes)", address, length);

            let nested = context.delay_slot();
            out.push(context);

            offset += length;
            if nested > 0 {
                offset = self.parse_delay_slots(db, base, bytes, offset, nested, depth + 1, out)?;
            }
        }

        Ok(offset)
    }

    /// Matches the instruction at `address` and fixes every operand's
    /// handle; commits are recorded but not yet applied.
    fn parse<'a>(
        &'a self,
        db: &ContextDatabase,
        address: AddressValue,
        bytes: &[u8],
    ) -> Result<ParserContext<'a>, Error> {
        let symbols = self.symbol_table();
        let root = symbols.root()?;

        let mut context = ParserContext::new(db, address.clone(), bytes, self.window);
        context.set_unique_span(self.specification.unique_span());
        {
            let mut walker = ParserWalker::new(&mut context);
            if let Resolution::NoMatch(reason) = self.resolve_table(&mut walker, root)? {
                log::debug!("no instruction matches at {}: {:?}", address, reason);
                return Err(Error::BadData {
                    address: address.offset(),
                })
            }
            walker.base_state();

            let length = walker.length();
            if length == 0 {
                return Err(DisassemblyError::InconsistentState.into())
            }

            let next = address.clone() + length;
            if self.specification.needs_next2() {
                if let Some(next_length) =
                    self.instruction_length(db, next.clone(), bytes.get(length..).unwrap_or(&[]))?
                {
                    walker.context_mut().set_next2_address(next.clone() + next_length);
                }
            }
            walker.context_mut().set_next_address(next);

            self.resolve_handles(&mut walker)?;
            walker.base_state();
        }

        Ok(context)
    }

    /// Length of the instruction at `address`, if one matches.
    fn instruction_length(
        &self,
        db: &ContextDatabase,
        address: AddressValue,
        bytes: &[u8],
    ) -> Result<Option<usize>, Error> {
        let mut context = ParserContext::new(db, address, bytes, self.window);
        let mut walker = ParserWalker::new(&mut context);
        Ok(match self.resolve_table(&mut walker, self.symbol_table().root()?)? {
            Resolution::Matched => Some(walker.length()),
            Resolution::NoMatch(_) => None,
        })
    }

    /// Binds the first constructor of `table` that matches at the walker's
    /// current node, trying candidates in table order and rolling back
    /// every failed attempt.
    fn resolve_table<'a, 'c>(
        &'a self,
        walker: &mut ParserWalker<'a, 'c>,
        table: &'a Symbol,
    ) -> Result<Resolution, DisassemblyError> {
        let (constructors, tree) = match table {
            Symbol::Subtable {
                constructors,
                decision_tree,
                ..
            } => (constructors, decision_tree),
            _ => return Err(DisassemblyError::InvalidSymbol(table.id())),
        };

        let candidates = match tree.candidates(walker) {
            Ok(candidates) => candidates,
            Err(e) => return non_match(e),
        };

        let mut reason = NoMatch::Exhausted;
        for id in candidates {
            let ctor = constructors.get(id).ok_or(DisassemblyError::InvalidConstructor)?;
            let checkpoint = walker.checkpoint();

            match self.resolve_constructor(walker, ctor)? {
                Resolution::Matched => {
                    log::trace!(
                        "selected constructor {} of `{}` at depth {}",
                        id,
                        table.name(),
                        walker.depth()
                    );
                    return Ok(Resolution::Matched)
                }
                Resolution::NoMatch(why) => {
                    log::trace!(
                        "backtracking from constructor {} of `{}`: {:?}",
                        id,
                        table.name(),
                        why
                    );
                    walker.restore(&checkpoint);
                    reason = why;
                }
            }
        }

        Ok(Resolution::NoMatch(reason))
    }

    fn resolve_constructor<'a, 'c>(
        &'a self,
        walker: &mut ParserWalker<'a, 'c>,
        ctor: &'a Constructor,
    ) -> Result<Resolution, DisassemblyError> {
        let symbols = self.symbol_table();

        if walker.offset()? + ctor.minimum_length() > walker.context().available() {
            return Ok(Resolution::NoMatch(NoMatch::ShortRead))
        }

        walker.set_constructor(ctor)?;
        if let Err(e) = ctor.apply_context(walker, symbols) {
            return non_match(e)
        }

        let nops = ctor.operand_count();
        for index in 0..nops {
            let operand = symbols.symbol(ctor.operand(index)?)?;
            let (base, relative) = match operand {
                Symbol::Operand { base, offset, .. } => (*base, *offset),
                _ => return Err(DisassemblyError::InvalidSymbol(operand.id())),
            };

            let start = match base {
                Some(base) => walker.operand_end(base)?,
                None => walker.offset()?,
            } + relative;

            if let Err(e) = walker.allocate_operand(index) {
                return non_match(e)
            }
            walker.set_offset(start)?;

            match operand.defining_symbol(symbols)? {
                Some(table) if table.is_subtable() => {
                    if let Resolution::NoMatch(reason) = self.resolve_table(walker, table)? {
                        return Ok(Resolution::NoMatch(reason))
                    }
                }
                Some(symbol) => {
                    if let Err(e) = symbol.check_entry(walker, symbols) {
                        return non_match(e)
                    }
                    walker.set_current_length(operand.minimum_length())?;
                }
                None => {
                    if let Some(expr) = operand.defining_expression().filter(|expr| expr.is_static()) {
                        if let Err(e) = expr.value(walker, symbols) {
                            return non_match(e)
                        }
                    }
                    walker.set_current_length(operand.minimum_length())?;
                }
            }

            walker.pop_operand()?;
        }

        walker.calculate_length(ctor.minimum_length(), nops)?;

        if let Some(delay) = ctor.template().map(ConstructTpl::delay_slot).filter(|d| *d > 0) {
            walker.set_delay_slot(delay);
        }

        Ok(Resolution::Matched)
    }

    /// Fixes the handle of every operand below the walker's current node,
    /// children before parents, so exports can refer to their operands.
    fn resolve_handles<'a, 'c>(&'a self, walker: &mut ParserWalker<'a, 'c>) -> Result<(), DisassemblyError> {
        let manager = self.manager();
        let symbols = self.symbol_table();
        let ctor = walker.constructor()?;

        for index in 0..ctor.operand_count() {
            let operand = symbols.symbol(ctor.operand(index)?)?;
            walker.push_operand(index)?;

            match operand.defining_symbol(symbols)? {
                Some(table) if table.is_subtable() => self.resolve_handles(walker)?,
                Some(symbol) => {
                    let handle = symbol.fixed_handle(walker, manager, symbols)?;
                    walker.set_parent_handle(handle)?;
                }
                None => {
                    let expr = operand
                        .defining_expression()
                        .ok_or(DisassemblyError::InvalidPattern)?;
                    let value = expr.value(walker, symbols)?;
                    walker.set_parent_handle(FixedHandle::constant(manager.constant_space_ref(), value as u64))?;
                }
            }

            walker.pop_operand()?;
        }

        if let Some(result) = ctor.template().and_then(ConstructTpl::result) {
            let handle = result.fix(walker, manager)?;
            walker.set_parent_handle(handle)?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::disassembly::Opcode;
    use crate::space::SpaceKind;
    use crate::specification::{OperandSpec, PatternEquation, SpecificationBuilder, Statement, Value};

    use sleigh_bytes::Endian;

    fn toy() -> Result<Translator, Error> {
        let mut builder = SpecificationBuilder::new("toy", Endian::Big, 2);
        builder.default_space("ram", 4, 1)?;
        builder.space("register", SpaceKind::Register, 4, 1)?;
        builder.token("instr", 16, Endian::Big)?;
        builder.field("instr", "op", 8, 15, false, true)?;
        builder.field("instr", "rd", 0, 3, false, false)?;
        builder.register("r0", "register", 0, 4)?;
        builder.register("r1", "register", 4, 4)?;
        builder.register("pc", "register", 0x40, 4)?;
        builder.program_counter("pc")?;
        builder.attach_registers("rd", &[Some("r0"), Some("r1"), None])?;
        builder.user_op("halt")?;

        builder
            .constructor("instruction")
            .operand("rd", OperandSpec::symbol("rd"))
            .pattern(PatternEquation::equal("op", 0x01) & PatternEquation::bind("rd"))
            .print("CLR rd")
            .template(vec![Statement::copy(Value::operand("rd"), Value::constant(0, 4))])
            .finish()?;

        builder
            .constructor("instruction")
            .pattern(PatternEquation::equal("op", 0x02))
            .print("HALT")
            .finish()?;

        Ok(Translator::new(Arc::new(builder.build()?))?)
    }

    #[test]
    fn registers_and_user_ops() -> Result<(), Error> {
        let translator = toy()?;
        assert_eq!(translator.register_name(4, 4), Some("r1"));
        assert_eq!(translator.register_name(4, 2), None);
        assert_eq!(translator.register_by_name("r0").map(VarnodeData::offset), Some(0));
        assert_eq!(translator.program_counter().map(VarnodeData::offset), Some(0x40));
        assert_eq!(translator.user_ops(), &[Ustr::from("halt")]);
        Ok(())
    }

    #[test]
    fn decode_and_lift() -> Result<(), Error> {
        let translator = toy()?;
        let mut db = translator.context_database();

        let insn = translator.disassemble(&mut db, translator.address(0x100), &[0x01, 0x01])?;
        assert_eq!(insn.mnemonic(), "CLR");
        assert_eq!(insn.body(), "r1");
        assert_eq!(insn.length(), 2);

        let pcode = translator.lift_pcode(&mut db, translator.address(0x100), &[0x01, 0x01])?;
        assert_eq!(pcode.length(), 2);
        assert_eq!(pcode.operations().len(), 1);
        assert_eq!(pcode.operations()[0].opcode(), Opcode::Copy);
        assert_eq!(pcode.operations()[0].output().map(VarnodeData::offset), Some(4));
        Ok(())
    }

    #[test]
    fn failures() -> Result<(), Error> {
        let translator = toy()?;
        let mut db = translator.context_database();

        let misaligned = translator.disassemble(&mut db, translator.address(0x101), &[0x01, 0x00]);
        assert!(matches!(misaligned, Err(Error::IncorrectAlignment { alignment: 2, .. })));

        let unknown = translator.disassemble(&mut db, translator.address(0x100), &[0x7f, 0x00]);
        assert!(matches!(unknown, Err(Error::BadData { address: 0x100 })));

        // rd = 2 selects an invalid attached register
        let invalid = translator.lift_pcode(&mut db, translator.address(0x100), &[0x01, 0x02]);
        assert!(matches!(invalid, Err(Error::BadData { .. })));

        let short = translator.disassemble(&mut db, translator.address(0x100), &[0x01]);
        assert!(matches!(short, Err(Error::BadData { .. })));

        let halt = translator.disassemble(&mut db, translator.address(0x100), &[0x02, 0x00])?;
        assert_eq!(halt.to_string(), "0x100 HALT");
        assert!(matches!(
            translator.lift_pcode(&mut db, translator.address(0x100), &[0x02, 0x00]),
            Err(Error::UnimplementedSemantics { constructor: 1, .. })
        ));
        Ok(())
    }
}
