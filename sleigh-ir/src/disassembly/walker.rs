use crate::address::{Address, AddressValue};
use crate::disassembly::context::ContextDatabase;
use crate::disassembly::symbol::{Constructor, FixedHandle, Symbol, SymbolTable};
use crate::disassembly::Error;
use crate::space_manager::SpaceManager;

use std::mem::size_of;

use smallvec::SmallVec;

/// Deepest nesting of subtable operands a single instruction may have.
pub const MAX_PARSER_DEPTH: usize = 64;

#[derive(Debug, Clone)]
pub struct ConstructState<'b> {
    parent: Option<usize>,
    constructor: Option<&'b Constructor>,
    handle: Option<FixedHandle<'b>>,
    resolve: SmallVec<[Option<usize>; 8]>,
    length: usize,
    offset: usize,
}

impl<'b> ConstructState<'b> {
    pub fn constructor(&self) -> Option<&'b Constructor> {
        self.constructor
    }

    pub fn length(&self) -> usize {
        self.length
    }

    pub fn offset(&self) -> usize {
        self.offset
    }
}

impl<'b> Default for ConstructState<'b> {
    fn default() -> Self {
        Self {
            parent: None,
            constructor: None,
            handle: None,
            resolve: SmallVec::new(),
            length: 0,
            offset: 0,
        }
    }
}

/// A deferred write to the context database.
#[derive(Debug, Copy, Clone)]
pub struct ContextSet<'b> {
    triple: &'b Symbol,
    number: usize,
    mask: u32,
    value: u32,
    point: usize,
    flow: bool,
}

/// Everything a failed candidate may have touched.
#[derive(Debug, Clone)]
pub struct Checkpoint {
    point: Option<usize>,
    depth: usize,
    crumb: usize,
    context: SmallVec<[u32; 4]>,
    commits: usize,
    alloc: usize,
    delay_slot: usize,
}

#[derive(Debug, Clone)]
pub struct ParserContext<'b> {
    context: SmallVec<[u32; 4]>,
    context_commit: Vec<ContextSet<'b>>,

    backing: SmallVec<[u8; 16]>,

    address: AddressValue,
    next_address: Option<AddressValue>,
    next2_address: Option<AddressValue>,

    delay_slot: usize,
    unique_span: u64,

    alloc: usize,
    state: Vec<ConstructState<'b>>,
}

impl<'b> ParserContext<'b> {
    /// A fresh parse at `address` over (at most `window` bytes of) `buffer`,
    /// seeded with the context in force at `address`.
    pub fn new(
        context_db: &ContextDatabase,
        address: AddressValue,
        buffer: &[u8],
        window: usize,
    ) -> Self {
        let length = buffer.len().min(window);
        let context = context_db.get_context(Address::from(&address));

        Self {
            context: context.iter().copied().collect(),
            context_commit: Vec::new(),
            backing: SmallVec::from_slice(&buffer[..length]),
            address,
            next_address: None,
            next2_address: None,
            delay_slot: 0,
            unique_span: 0,
            alloc: 1,
            state: vec![ConstructState::default(); 16],
        }
    }

    pub fn address(&self) -> &AddressValue {
        &self.address
    }

    pub fn available(&self) -> usize {
        self.backing.len()
    }

    pub fn context(&self) -> &[u32] {
        &self.context
    }

    pub fn length(&self) -> usize {
        self.state[0].length
    }

    pub fn delay_slot(&self) -> usize {
        self.delay_slot
    }

    pub fn constructor(&self, point: usize) -> Result<&'b Constructor, Error> {
        self.point(point)?
            .constructor
            .ok_or(Error::InvalidConstructor)
    }

    pub fn set_unique_span(&mut self, span: u64) {
        self.unique_span = span;
    }

    pub fn set_next_address(&mut self, address: AddressValue) {
        self.next_address = Some(address);
    }

    pub fn set_next2_address(&mut self, address: AddressValue) {
        self.next2_address = Some(address);
    }

    pub(crate) fn point(&self, point: usize) -> Result<&ConstructState<'b>, Error> {
        self.state.get(point).ok_or(Error::InconsistentState)
    }

    pub(crate) fn point_mut(&mut self, point: usize) -> Result<&mut ConstructState<'b>, Error> {
        self.state.get_mut(point).ok_or(Error::InconsistentState)
    }

    fn allocate_operand(&mut self, parent: Option<usize>) -> usize {
        let id = self.alloc;

        if self.state.len() <= id {
            self.state.resize((1 + self.state.len()) * 2, Default::default());
        }

        let op = &mut self.state[id];

        op.parent = parent;
        op.constructor = None;
        op.handle = None;
        op.resolve.clear();
        op.offset = 0;
        op.length = 0;

        self.alloc += 1;

        id
    }

    pub fn instruction_window_at(&self, offset: usize, size: usize) -> Result<&[u8], Error> {
        self.backing
            .get(offset..offset + size)
            .ok_or(Error::ShortRead(offset + size))
    }

    /// Reads `size` (<= 32) bits starting at bit `start` (MSB-first) past
    /// byte `offset`; bytes beyond the window read as zero.
    pub fn instruction_bits(&self, start: usize, size: usize, offset: usize) -> u32 {
        if size == 0 {
            return 0
        }

        let offset = offset + (start / 8);
        let start = start % 8;
        let bytes_size = (start + size - 1) / 8 + 1;

        let value = (0..bytes_size).fold(0u64, |acc, i| {
            (acc << 8) | self.backing.get(offset + i).copied().unwrap_or(0) as u64
        });

        let unused = (8 * bytes_size - start - size) as u32;
        ((value >> unused) & ((1u64 << size) - 1)) as u32
    }

    /// Reads `size` bytes of the context starting at `start`, numbering bytes
    /// from the most significant byte of word zero.
    pub fn context_bytes(&self, start: usize, size: usize) -> u32 {
        (0..size.min(size_of::<u32>())).fold(0u32, |acc, i| {
            let index = start + i;
            let word = self.context.get(index / size_of::<u32>()).copied().unwrap_or(0);
            let byte = (word >> (8 * (size_of::<u32>() - 1 - index % size_of::<u32>()))) & 0xff;
            (acc << 8) | byte
        })
    }

    /// Reads `size` (<= 32) bits of the context starting at bit `start`,
    /// numbering bits from the most significant bit of word zero.
    pub fn context_bits(&self, start: usize, size: usize) -> u32 {
        if size == 0 {
            return 0
        }

        let word_bits = 8 * size_of::<u32>();
        let index = start / word_bits;
        let bits_off = start % word_bits;

        let hi = self.context.get(index).copied().unwrap_or(0) as u64;
        let lo = self.context.get(index + 1).copied().unwrap_or(0) as u64;
        let both = (hi << 32) | lo;

        let unused = (2 * word_bits - bits_off - size) as u32;
        ((both >> unused) & ((1u64 << size) - 1)) as u32
    }

    pub fn set_context_word(&mut self, num: usize, value: u32, mask: u32) {
        if let Some(word) = self.context.get_mut(num) {
            *word = (*word & !mask) | (mask & value);
        }
    }

    pub fn add_commit(&mut self, symbol: &'b Symbol, num: usize, mask: u32, point: usize, flow: bool) {
        let value = self.context.get(num).copied().unwrap_or(0) & mask;
        self.context_commit.push(ContextSet {
            triple: symbol,
            number: num,
            mask,
            value,
            point,
            flow,
        });
    }

    pub fn commit_count(&self) -> usize {
        self.context_commit.len()
    }

    /// Writes every recorded commit into `db`. Every target address is
    /// resolved before the first write, so a failure leaves `db` untouched.
    pub fn apply_commits(
        &mut self,
        db: &mut ContextDatabase,
        manager: &'b SpaceManager,
        symbols: &'b SymbolTable,
    ) -> Result<(), Error> {
        if self.context_commit.is_empty() {
            return Ok(())
        }

        let commits = std::mem::take(&mut self.context_commit);
        let walker = ParserWalker::new(self);

        let targets = commits
            .iter()
            .map(|commit| -> Result<AddressValue, Error> {
                let handle = if let Symbol::Operand { handle_index, .. } = commit.triple {
                    walker.handle_via(commit.point, *handle_index)?.clone()
                } else {
                    commit.triple.fixed_handle(&walker, manager, symbols)?
                };

                let address = AddressValue::new(handle.space.clone(), handle.offset_offset);
                if address.is_constant() {
                    let space = manager
                        .space_by_id(walker.address().space_ref().id())
                        .ok_or(Error::InvalidSpace)?;
                    let offset = address.offset().wrapping_mul(space.word_size() as u64);
                    Ok(AddressValue::new(space.clone(), offset))
                } else {
                    Ok(address)
                }
            })
            .collect::<Result<Vec<_>, _>>()?;

        for (commit, address) in commits.iter().zip(targets) {
            log::trace!(
                "committing context word {} (mask {:#x}, value {:#x}) at {}{}",
                commit.number,
                commit.mask,
                commit.value,
                address,
                if commit.flow { " onward" } else { "" },
            );

            if commit.flow {
                db.set_context_change_point(Address::from(&address), commit.number, commit.mask, commit.value);
            } else {
                let naddress = address.clone() + 1u64;
                if naddress.offset() < address.offset() {
                    db.set_context_change_point(Address::from(&address), commit.number, commit.mask, commit.value);
                } else {
                    db.set_context_region(
                        Address::from(&address),
                        Some(Address::from(&naddress)),
                        commit.number,
                        commit.mask,
                        commit.value,
                    );
                }
            }
        }

        Ok(())
    }
}

pub struct ParserWalker<'b, 'c> {
    ctx: &'c mut ParserContext<'b>,

    point: Option<usize>,
    depth: usize,
    breadcrumb: [usize; MAX_PARSER_DEPTH + 1],
}

impl<'b, 'c> ParserWalker<'b, 'c> {
    pub fn new(ctx: &'c mut ParserContext<'b>) -> Self {
        Self {
            ctx,
            point: Some(0),
            depth: 0,
            breadcrumb: [0; MAX_PARSER_DEPTH + 1],
        }
    }

    pub fn context(&self) -> &ParserContext<'b> {
        self.ctx
    }

    pub fn context_mut(&mut self) -> &mut ParserContext<'b> {
        self.ctx
    }

    pub fn base_state(&mut self) {
        self.point = Some(0);
        self.depth = 0;
        self.breadcrumb[0] = 0;
    }

    pub fn is_state(&self) -> bool {
        self.point.is_some()
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn address(&self) -> &AddressValue {
        &self.ctx.address
    }

    pub fn next_address(&self) -> Option<&AddressValue> {
        self.ctx.next_address.as_ref()
    }

    pub fn next2_address(&self) -> Option<&AddressValue> {
        self.ctx.next2_address.as_ref()
    }

    pub fn length(&self) -> usize {
        self.ctx.length()
    }

    pub fn delay_slot(&self) -> usize {
        self.ctx.delay_slot
    }

    pub fn set_delay_slot(&mut self, delay: usize) {
        self.ctx.delay_slot = delay;
    }

    fn current(&self) -> Result<usize, Error> {
        self.point.ok_or(Error::InconsistentState)
    }

    /// Offset or-ed into the temporaries of the current node, keeping
    /// those of sibling expansions of one constructor apart.
    pub fn unique_salt(&self) -> Result<u64, Error> {
        Ok((self.current()? as u64).wrapping_mul(self.ctx.unique_span))
    }

    pub fn point(&self) -> Result<&ConstructState<'b>, Error> {
        self.ctx.point(self.current()?)
    }

    fn point_mut(&mut self) -> Result<&mut ConstructState<'b>, Error> {
        let point = self.current()?;
        self.ctx.point_mut(point)
    }

    pub fn constructor(&self) -> Result<&'b Constructor, Error> {
        self.ctx.constructor(self.current()?)
    }

    /// Binds `constructor` to the current node and clears its operands.
    pub fn set_constructor(&mut self, constructor: &'b Constructor) -> Result<(), Error> {
        let state = self.point_mut()?;
        state.constructor = Some(constructor);
        state.resolve.clear();
        state.resolve.resize(constructor.operand_count(), None);
        Ok(())
    }

    /// Byte offset of the current node from the instruction start.
    pub fn offset(&self) -> Result<usize, Error> {
        Ok(self.point()?.offset)
    }

    /// Byte offset just past operand `index` of the current node.
    pub fn operand_end(&self, index: usize) -> Result<usize, Error> {
        let child = self.resolved(self.point()?, index)?;
        let op = self.ctx.point(child)?;
        Ok(op.offset + op.length)
    }

    fn resolved(&self, state: &ConstructState<'b>, index: usize) -> Result<usize, Error> {
        state
            .resolve
            .get(index)
            .copied()
            .flatten()
            .ok_or(Error::InconsistentState)
    }

    pub fn set_offset(&mut self, offset: usize) -> Result<(), Error> {
        self.point_mut()?.offset = offset;
        Ok(())
    }

    pub fn set_current_length(&mut self, length: usize) -> Result<(), Error> {
        self.point_mut()?.length = length;
        Ok(())
    }

    /// Sets the current node's length to cover its own `length` bytes and
    /// every one of its first `nops` operands.
    pub fn calculate_length(&mut self, length: usize, nops: usize) -> Result<(), Error> {
        let state = self.point()?;
        let poff = state.offset;

        let mut length = length + poff;
        for id in 0..nops {
            let sub = self.ctx.point(self.resolved(state, id)?)?;
            length = length.max(sub.length + sub.offset);
        }

        self.point_mut()?.length = length - poff;
        Ok(())
    }

    pub fn operand(&self) -> usize {
        self.breadcrumb[self.depth]
    }

    /// Creates a node for operand `id` of the current node and descends
    /// into it.
    pub fn allocate_operand(&mut self, id: usize) -> Result<(), Error> {
        if self.depth >= MAX_PARSER_DEPTH {
            return Err(Error::TooDeep(MAX_PARSER_DEPTH))
        }

        let parent = self.current()?;
        let op = self.ctx.allocate_operand(Some(parent));

        *self
            .ctx
            .point_mut(parent)?
            .resolve
            .get_mut(id)
            .ok_or(Error::InconsistentState)? = Some(op);

        self.breadcrumb[self.depth] += 1;
        self.depth += 1;

        self.point = Some(op);
        self.breadcrumb[self.depth] = 0;

        Ok(())
    }

    pub fn push_operand(&mut self, id: usize) -> Result<(), Error> {
        if self.depth >= MAX_PARSER_DEPTH {
            return Err(Error::TooDeep(MAX_PARSER_DEPTH))
        }

        let child = self.resolved(self.point()?, id)?;

        self.breadcrumb[self.depth] = id + 1;
        self.depth += 1;
        self.point = Some(child);
        self.breadcrumb[self.depth] = 0;

        Ok(())
    }

    pub fn pop_operand(&mut self) -> Result<(), Error> {
        self.point = self.point()?.parent;
        self.depth = self.depth.saturating_sub(1);
        Ok(())
    }

    pub fn handle(&self, index: usize) -> Result<&FixedHandle<'b>, Error> {
        let child = self.resolved(self.point()?, index)?;
        self.ctx.point(child)?.handle.as_ref().ok_or(Error::InvalidHandle)
    }

    pub fn handle_via(&self, point: usize, index: usize) -> Result<&FixedHandle<'b>, Error> {
        let child = self.resolved(self.ctx.point(point)?, index)?;
        self.ctx.point(child)?.handle.as_ref().ok_or(Error::InvalidHandle)
    }

    pub fn set_parent_handle(&mut self, handle: FixedHandle<'b>) -> Result<(), Error> {
        self.point_mut()?.handle = Some(handle);
        Ok(())
    }

    pub fn parent_handle(&self) -> Result<&FixedHandle<'b>, Error> {
        self.point()?.handle.as_ref().ok_or(Error::InvalidHandle)
    }

    pub fn parent_handle_mut(&mut self) -> Result<&mut FixedHandle<'b>, Error> {
        self.point_mut()?.handle.as_mut().ok_or(Error::InvalidHandle)
    }

    /// Bytes `[offset, offset + size)` of the window, relative to the
    /// instruction start.
    pub fn instruction_window_at(&self, offset: usize, size: usize) -> Result<&[u8], Error> {
        self.ctx.instruction_window_at(offset, size)
    }

    /// Bytes `[start, start + size)` relative to the current node.
    pub fn instruction_window(&self, start: usize, size: usize) -> Result<&[u8], Error> {
        self.ctx.instruction_window_at(self.offset()? + start, size)
    }

    pub fn instruction_bytes(&self, start: usize, size: usize) -> Result<u32, Error> {
        let bytes = self.instruction_window(start, size.min(size_of::<u32>()))?;
        Ok(bytes.iter().fold(0u32, |acc, b| (acc << 8) | *b as u32))
    }

    pub fn instruction_bits(&self, start: usize, size: usize) -> Result<u32, Error> {
        Ok(self.ctx.instruction_bits(start, size, self.offset()?))
    }

    pub fn context_bytes(&self, offset: usize, size: usize) -> u32 {
        self.ctx.context_bytes(offset, size)
    }

    pub fn context_bits(&self, offset: usize, size: usize) -> u32 {
        self.ctx.context_bits(offset, size)
    }

    pub fn set_context_word(&mut self, num: usize, value: u32, mask: u32) {
        self.ctx.set_context_word(num, value, mask)
    }

    pub fn add_commit(&mut self, symbol: &'b Symbol, num: usize, mask: u32, flow: bool) -> Result<(), Error> {
        let point = self.current()?;
        self.ctx.add_commit(symbol, num, mask, point, flow);
        Ok(())
    }

    /// Start offset of operand `index` of `ctor`, where `ctor` is bound to
    /// the current node or one of its ancestors. The operand may not have
    /// been resolved yet, in which case its offset is derived from the
    /// operand symbol's placement.
    pub fn operand_offset(
        &self,
        ctor: &Constructor,
        index: usize,
        symbols: &'b SymbolTable,
    ) -> Result<usize, Error> {
        let mut state = self.point()?;

        while state.constructor.map(|ct| ct != ctor).unwrap_or(true) {
            match state.parent {
                Some(parent) => state = self.ctx.point(parent)?,
                None => return Ok(self.ctx.point(0)?.offset),
            }
        }

        if let Ok(child) = self.resolved(state, index) {
            return Ok(self.ctx.point(child)?.offset)
        }

        match symbols.symbol(ctor.operand(index)?)? {
            Symbol::Operand { base: None, offset, .. } => Ok(state.offset + offset),
            Symbol::Operand { base: Some(base), offset, .. } => {
                let prior = self.ctx.point(self.resolved(state, *base)?)?;
                Ok(prior.offset + prior.length + offset)
            }
            _ => Err(Error::InvalidSymbol(ctor.operand(index)?)),
        }
    }

    pub fn checkpoint(&self) -> Checkpoint {
        Checkpoint {
            point: self.point,
            depth: self.depth,
            crumb: self.breadcrumb[self.depth],
            context: self.ctx.context.clone(),
            commits: self.ctx.context_commit.len(),
            alloc: self.ctx.alloc,
            delay_slot: self.ctx.delay_slot,
        }
    }

    /// Rolls back every change made since `checkpoint` was taken.
    pub fn restore(&mut self, checkpoint: &Checkpoint) {
        self.point = checkpoint.point;
        self.depth = checkpoint.depth;
        self.breadcrumb[self.depth] = checkpoint.crumb;
        self.ctx.context.clone_from(&checkpoint.context);
        self.ctx.context_commit.truncate(checkpoint.commits);
        self.ctx.alloc = checkpoint.alloc;
        self.ctx.delay_slot = checkpoint.delay_slot;
    }

    pub fn apply_commits(
        &mut self,
        db: &mut ContextDatabase,
        manager: &'b SpaceManager,
        symbols: &'b SymbolTable,
    ) -> Result<(), Error> {
        self.ctx.apply_commits(db, manager, symbols)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::space::SpaceKind;

    fn context(bytes: &[u8]) -> (SpaceManager, ContextDatabase, Vec<u8>) {
        let mut manager = SpaceManager::new();
        manager
            .add_space(SpaceKind::Default, "ram", 4, 1, None, 1)
            .unwrap();
        let mut db = ContextDatabase::new();
        db.register_variable("mode", 0, 3).unwrap();
        (manager, db, bytes.to_vec())
    }

    #[test]
    fn windows_and_bits() {
        let (manager, db, bytes) = context(&[0x12, 0x34, 0x56]);
        let address = AddressValue::new(manager.default_space(), 0x1000);
        let mut ctx = ParserContext::new(&db, address, &bytes, 16);

        assert_eq!(ctx.available(), 3);
        assert_eq!(ctx.instruction_bits(4, 8, 0), 0x23);
        assert_eq!(ctx.instruction_bits(0, 16, 2), 0x5600);

        let walker = ParserWalker::new(&mut ctx);
        assert_eq!(walker.instruction_bytes(1, 2).unwrap(), 0x3456);
        assert!(matches!(walker.instruction_window(2, 2), Err(Error::ShortRead(4))));
    }

    #[test]
    fn context_spans_words() {
        let (manager, mut db, bytes) = context(&[0]);
        db.set_variable_default("mode", 0xa);
        let address = AddressValue::new(manager.default_space(), 0);
        let mut ctx = ParserContext::new(&db, address, &bytes, 16);

        assert_eq!(ctx.context_bits(0, 4), 0xa);
        assert_eq!(ctx.context_bytes(0, 1), 0xa0);

        ctx.set_context_word(0, 0x3, 0x3);
        assert_eq!(ctx.context_bits(30, 2), 0x3);
    }

    #[test]
    fn checkpoints_roll_back() {
        let (manager, db, bytes) = context(&[0xff]);
        let address = AddressValue::new(manager.default_space(), 0);
        let mut ctx = ParserContext::new(&db, address, &bytes, 16);
        let mut walker = ParserWalker::new(&mut ctx);

        let saved = walker.checkpoint();
        walker.set_context_word(0, 0xf000_0000, 0xf000_0000);
        walker.set_delay_slot(4);
        assert_eq!(walker.context_bits(0, 4), 0xf);

        walker.restore(&saved);
        assert_eq!(walker.context_bits(0, 4), 0);
        assert_eq!(walker.delay_slot(), 0);
    }
}
