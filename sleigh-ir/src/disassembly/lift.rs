use crate::address::AddressValue;
use crate::bits;
use crate::disassembly::construct::{ConstructTpl, OpTpl, VarnodeTpl};
use crate::disassembly::symbol::{Constructor, Symbol, SymbolTable};
use crate::disassembly::Opcode;
use crate::disassembly::VarnodeData;
use crate::disassembly::{Error, ParserContext, ParserWalker};
use crate::space::AddressSpace;
use crate::space_manager::SpaceManager;
use crate::translator::Translator;

use ahash::AHashMap as Map;
use smallvec::{smallvec, SmallVec};
use std::fmt;
use std::mem::swap;
use std::sync::Arc;

/// The p-code of one instruction, including any instructions spliced in
/// through its delay slot.
#[derive(Debug, Clone)]
pub struct PCodeRaw {
    pub address: AddressValue,
    pub operations: SmallVec<[PCodeData; 16]>,
    pub delay_slots: usize,
    pub length: usize,
}

pub struct PCodeRawFormatter<'a> {
    pcode: &'a PCodeRaw,
    translator: &'a Translator,
}

impl<'a> fmt::Display for PCodeRawFormatter<'a> {
    fn fmt(&self, f: &mut fmt::Formatter) -> Result<(), fmt::Error> {
        let len = self.pcode.operations.len();
        if len > 0 {
            for (i, op) in self.pcode.operations.iter().enumerate() {
                write!(
                    f,
                    "{}.{:02}: {}{}",
                    self.pcode.address,
                    i,
                    op.display(self.translator),
                    if i == len - 1 { "" } else { "\n" }
                )?;
            }
            Ok(())
        } else {
            write!(f, "{}.00: NOP", self.pcode.address)
        }
    }
}

impl PCodeRaw {
    pub fn display<'a>(&'a self, translator: &'a Translator) -> PCodeRawFormatter<'a> {
        PCodeRawFormatter {
            pcode: self,
            translator,
        }
    }

    pub fn nop(address: AddressValue, length: usize) -> Self {
        Self {
            address,
            operations: SmallVec::new(),
            delay_slots: 0,
            length,
        }
    }

    pub fn address(&self) -> &AddressValue {
        &self.address
    }

    pub fn operations(&self) -> &[PCodeData] {
        self.operations.as_ref()
    }

    pub fn delay_slots(&self) -> usize {
        self.delay_slots
    }

    pub fn length(&self) -> usize {
        self.length
    }
}

#[derive(Debug)]
struct RelativeRecord {
    instruction: usize,
    index: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PCodeData {
    pub opcode: Opcode,
    pub output: Option<VarnodeData>,
    pub inputs: SmallVec<[VarnodeData; 4]>,
}

pub struct PCodeDataFormatter<'a> {
    pcode: &'a PCodeData,
    translator: &'a Translator,
}

impl<'a> fmt::Display for PCodeDataFormatter<'a> {
    fn fmt(&self, f: &mut fmt::Formatter) -> Result<(), fmt::Error> {
        write!(f, "{}(", self.pcode.opcode)?;
        if let Some(ref output) = self.pcode.output {
            write!(f, "out={}", output.display(self.translator))?;
        }
        if !self.pcode.inputs.is_empty() {
            write!(f, "{}in=[", if self.pcode.output.is_some() { ", " } else { "" })?;
            for (i, input) in self.pcode.inputs.iter().enumerate() {
                write!(f, "{}{}", if i == 0 { "" } else { ", " }, input.display(self.translator))?;
            }
            write!(f, "]")?;
        }
        write!(f, ")")
    }
}

impl PCodeData {
    pub fn display<'a>(&'a self, translator: &'a Translator) -> PCodeDataFormatter<'a> {
        PCodeDataFormatter {
            pcode: self,
            translator,
        }
    }

    pub fn opcode(&self) -> Opcode {
        self.opcode
    }

    pub fn output(&self) -> Option<&VarnodeData> {
        self.output.as_ref()
    }

    pub fn inputs(&self) -> &[VarnodeData] {
        &self.inputs
    }
}

/// Instantiates construct templates over a resolved parse tree.
pub struct IRBuilder<'b, 'c> {
    const_space: &'b Arc<AddressSpace>,
    unique_mask: u64,
    unique_offset: u64,

    issued: SmallVec<[PCodeData; 16]>,

    label_base: usize,
    label_count: usize,
    label_refs: SmallVec<[RelativeRecord; 4]>,
    labels: SmallVec<[Option<u64>; 4]>,

    delay_contexts: Map<u64, &'c mut ParserContext<'b>>,

    manager: &'b SpaceManager,
    symbols: &'b SymbolTable,

    walker: ParserWalker<'b, 'c>,
}

impl<'b, 'c> IRBuilder<'b, 'c> {
    /// `delay_contexts` holds the fully resolved parses of every
    /// instruction that may be spliced in through a delay slot, keyed by
    /// address offset.
    pub fn new(
        walker: ParserWalker<'b, 'c>,
        delay_contexts: Map<u64, &'c mut ParserContext<'b>>,
        manager: &'b SpaceManager,
        symbols: &'b SymbolTable,
        unique_mask: u64,
    ) -> Self {
        let unique_offset = Self::unique_base(walker.address().offset(), unique_mask);
        Self {
            const_space: manager.constant_space_ref(),
            unique_mask,
            unique_offset,
            issued: SmallVec::new(),
            label_base: 0,
            label_count: 0,
            label_refs: SmallVec::new(),
            labels: SmallVec::new(),
            delay_contexts,
            manager,
            symbols,
            walker,
        }
    }

    fn unique_base(offset: u64, mask: u64) -> u64 {
        (offset & mask).checked_shl(4).unwrap_or(0)
    }

    pub fn walker(&self) -> &ParserWalker<'b, 'c> {
        &self.walker
    }

    pub fn walker_mut(&mut self) -> &mut ParserWalker<'b, 'c> {
        &mut self.walker
    }

    pub fn set_unique_offset(&mut self, offset: u64) {
        self.unique_offset = Self::unique_base(offset, self.unique_mask);
    }

    fn is_subtable_operand(&self, ctor: &'b Constructor, index: usize) -> Result<bool, Error> {
        let operand = self.symbols.symbol(ctor.operand(index)?)?;
        Ok(matches!(
            operand.defining_symbol(self.symbols)?,
            Some(Symbol::Subtable { .. })
        ))
    }

    /// Walks a constructor without a template for `section`, building the
    /// section in any subtable operands that do have one.
    pub fn build_empty(&mut self, ctor: &'b Constructor, section: usize) -> Result<(), Error> {
        for i in 0..ctor.operand_count() {
            if !self.is_subtable_operand(ctor, i)? {
                continue
            }

            self.walker.push_operand(i)?;
            let child = self.walker.constructor()?;
            if let Some(tpl) = child.named_template(section) {
                self.build(tpl, Some(section))?;
            } else {
                self.build_empty(child, section)?;
            }
            self.walker.pop_operand()?;
        }
        Ok(())
    }

    fn append_build(&mut self, op: &'b OpTpl, section: Option<usize>) -> Result<(), Error> {
        let index = op.input(0)?.offset().real() as usize;
        let ctor = self.walker.constructor()?;

        if !self.is_subtable_operand(ctor, index)? {
            return Ok(())
        }

        self.walker.push_operand(index)?;
        let child = self.walker.constructor()?;
        if let Some(section) = section {
            if let Some(tpl) = child.named_template(section) {
                self.build(tpl, Some(section))?;
            } else {
                self.build_empty(child, section)?;
            }
        } else {
            let tpl = child
                .template()
                .ok_or_else(|| Error::Unimplemented(child.id(), child.table()))?;
            self.build(tpl, None)?;
        }
        self.walker.pop_operand()
    }

    fn delay_slot(&mut self) -> Result<(), Error> {
        let old_unique_offset = self.unique_offset;
        let base_address = self.walker.address().clone();
        let delay_count = self.walker.delay_slot();
        let mut fall_offset = self.walker.length();
        let mut byte_count = 0;

        while byte_count < delay_count {
            let address = base_address.clone() + fall_offset;
            self.set_unique_offset(address.offset());

            let context = self
                .delay_contexts
                .remove(&address.offset())
                .ok_or(Error::InconsistentState)?;

            let mut nwalker = ParserWalker::new(context);
            let length = nwalker.length();

            log::trace!("splicing delay slot instruction at {} ({} bytes)", address, length);

            swap(&mut self.walker, &mut nwalker);
            self.walker.base_state();

            let built = self.walker.constructor().and_then(|ctor| {
                let tpl = ctor
                    .template()
                    .ok_or_else(|| Error::Unimplemented(ctor.id(), ctor.table()))?;
                self.build(tpl, None)
            });

            swap(&mut self.walker, &mut nwalker);
            built?;

            if length == 0 {
                return Err(Error::InconsistentState)
            }

            fall_offset += length;
            byte_count += length;
        }

        self.unique_offset = old_unique_offset;
        Ok(())
    }

    fn generate_location(&self, varnode: &'b VarnodeTpl) -> Result<VarnodeData, Error> {
        let space = varnode.space().fix_space(&self.walker, self.manager)?;
        let size = varnode.size().fix(&self.walker, self.manager)? as usize;
        let offset = varnode.offset().fix(&self.walker, self.manager)?;

        let offset = if space.is_constant() {
            offset & bits::calculate_mask(size)
        } else if space.is_unique() {
            let salt = if varnode.offset().is_real() {
                self.walker.unique_salt()?
            } else {
                0
            };
            offset | salt | self.unique_offset
        } else {
            space.wrap_offset(offset)
        };

        Ok(VarnodeData::new(space.clone(), offset, size))
    }

    fn generate_pointer(&self, varnode: &'b VarnodeTpl) -> Result<(&'b Arc<AddressSpace>, VarnodeData), Error> {
        let index = varnode
            .offset()
            .handle_index()
            .ok_or(Error::InconsistentState)?;
        let handle = self.walker.handle(index)?;

        let space = handle.offset_space.ok_or(Error::InconsistentState)?;
        let size = handle.offset_size;

        let offset = if space.is_constant() {
            handle.offset_offset & bits::calculate_mask(size)
        } else if space.is_unique() {
            handle.offset_offset | self.unique_offset
        } else {
            space.wrap_offset(handle.offset_offset)
        };

        Ok((handle.space, VarnodeData::new(space.clone(), offset, size)))
    }

    fn space_reference(&self, space: &AddressSpace) -> VarnodeData {
        VarnodeData::new(
            self.const_space.clone(),
            space.index() as u64,
            self.const_space.address_size(),
        )
    }

    fn dump(&mut self, op: &'b OpTpl) -> Result<(), Error> {
        let mut inputs = SmallVec::<[_; 4]>::new();

        for input in op.inputs() {
            let varnode = self.generate_location(input)?;
            if input.is_dynamic(&self.walker)? {
                let (space, pointer) = self.generate_pointer(input)?;
                self.issued.push(PCodeData {
                    opcode: Opcode::Load,
                    inputs: smallvec![self.space_reference(space), pointer],
                    output: Some(varnode.clone()),
                });
            }
            inputs.push(varnode);
        }

        if op.input_count() > 0 && op.input(0)?.is_relative() {
            inputs[0].offset += self.label_base as u64;
            self.label_refs.push(RelativeRecord {
                instruction: self.issued.len(),
                index: 0,
            });
        }

        if let Some(output) = op.output() {
            let varnode = self.generate_location(output)?;
            self.issued.push(PCodeData {
                opcode: op.opcode(),
                inputs,
                output: Some(varnode.clone()),
            });

            if output.is_dynamic(&self.walker)? {
                let (space, pointer) = self.generate_pointer(output)?;
                self.issued.push(PCodeData {
                    opcode: Opcode::Store,
                    inputs: smallvec![self.space_reference(space), pointer, varnode],
                    output: None,
                });
            }
        } else {
            self.issued.push(PCodeData {
                opcode: op.opcode(),
                inputs,
                output: None,
            });
        }

        Ok(())
    }

    fn set_label(&mut self, op: &'b OpTpl) -> Result<(), Error> {
        let index = self.label_base + op.input(0)?.offset().real() as usize;
        let position = self.issued.len() as u64;
        *self.labels.get_mut(index).ok_or(Error::InconsistentState)? = Some(position);
        Ok(())
    }

    /// Expands `tpl` against the current node of the walker.
    pub fn build(&mut self, tpl: &'b ConstructTpl, section: Option<usize>) -> Result<(), Error> {
        let old_base = self.label_base;
        self.label_base = self.label_count;
        self.label_count += tpl.labels();
        self.labels.resize(self.label_count, None);

        for op in tpl.operations() {
            match op.opcode() {
                Opcode::Build => self.append_build(op, section)?,
                Opcode::DelaySlot => self.delay_slot()?,
                Opcode::Label => self.set_label(op)?,
                Opcode::CrossBuild => return Err(Error::CrossBuild),
                _ => self.dump(op)?,
            }
        }

        self.label_base = old_base;
        Ok(())
    }

    /// Rewrites label references into offsets relative to the referencing
    /// operation.
    fn resolve_relatives(&mut self) -> Result<(), Error> {
        for rel in self.label_refs.iter() {
            let varnode = self
                .issued
                .get_mut(rel.instruction)
                .and_then(|op| op.inputs.get_mut(rel.index))
                .ok_or(Error::InconsistentState)?;

            let id = varnode.offset();
            let target = self
                .labels
                .get(id as usize)
                .copied()
                .flatten()
                .ok_or(Error::UnplacedLabel(id))?;

            varnode.offset = target.wrapping_sub(rel.instruction as u64) & bits::calculate_mask(varnode.size());
        }
        Ok(())
    }

    pub fn emit(mut self, length: usize) -> Result<PCodeRaw, Error> {
        self.resolve_relatives()?;
        self.walker.base_state();

        Ok(PCodeRaw {
            address: self.walker.address().clone(),
            delay_slots: self.walker.delay_slot(),
            operations: self.issued,
            length,
        })
    }
}
