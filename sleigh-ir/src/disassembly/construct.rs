use crate::disassembly::symbol::FixedHandle;
use crate::disassembly::Opcode;
use crate::disassembly::{Error, ParserWalker};

use crate::space::{AddressSpace, AddressSpaceId};
use crate::space_manager::SpaceManager;

use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
pub enum HandleKind {
    Space,
    Offset,
    Size,
    /// Offset plus the low 16 bits; for constants, the offset shifted
    /// right by the upper bits (in bytes) instead.
    OffsetPlus(u64),
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
pub enum ConstTpl {
    Real(u64),
    Handle(usize, HandleKind),
    Start,
    Next,
    Next2,
    CurrentSpace,
    CurrentSpaceSize,
    SpaceId(AddressSpaceId),
    Relative(u64),
}

impl ConstTpl {
    pub fn is_handle(&self) -> bool {
        matches!(self, Self::Handle(_, _))
    }

    pub fn is_real(&self) -> bool {
        matches!(self, Self::Real(_))
    }

    pub fn real(&self) -> u64 {
        match self {
            Self::Real(value) => *value,
            _ => 0,
        }
    }

    pub fn handle_index(&self) -> Option<usize> {
        match self {
            Self::Handle(index, _) => Some(*index),
            _ => None,
        }
    }

    pub fn is_relative(&self) -> bool {
        matches!(self, Self::Relative(_))
    }

    fn check(&self, operands: usize, labels: usize, manager: &SpaceManager) -> Result<(), String> {
        match self {
            Self::Handle(index, _) if *index >= operands => {
                Err(format!("refers to operand {} of {}", index, operands))
            }
            Self::SpaceId(id) if manager.space_by_id(*id).map(|space| space.id()) != Some(*id) => {
                Err(format!("refers to undefined space {:#x}", id.index()))
            }
            Self::Relative(label) if *label as usize >= labels => {
                Err(format!("jumps to label {} of {}", label, labels))
            }
            _ => Ok(()),
        }
    }

    pub fn fix<'b, 'c>(
        &'b self,
        walker: &ParserWalker<'b, 'c>,
        manager: &'b SpaceManager,
    ) -> Result<u64, Error> {
        Ok(match self {
            Self::Start => walker.address().offset(),
            Self::Next => walker.next_address().ok_or(Error::InvalidNextAddress)?.offset(),
            Self::Next2 => walker.next2_address().ok_or(Error::InvalidNextAddress)?.offset(),
            Self::CurrentSpaceSize => manager
                .space_by_id(walker.address().space_ref().id())
                .ok_or(Error::InvalidSpace)?
                .address_size() as u64,
            Self::CurrentSpace => walker.address().space_ref().index() as u64,
            Self::Relative(value) | Self::Real(value) => *value,
            Self::SpaceId(space) => space.index() as u64,
            Self::Handle(index, kind) => {
                let handle = walker.handle(*index)?;
                let offset = if handle.is_dynamic() {
                    handle.temporary_offset
                } else {
                    handle.offset_offset
                };
                match kind {
                    HandleKind::Space => if handle.is_dynamic() {
                        handle.temporary_space.ok_or(Error::InvalidSpace)?.index() as u64
                    } else {
                        handle.space.index() as u64
                    },
                    HandleKind::Offset => offset,
                    HandleKind::Size => handle.size as u64,
                    HandleKind::OffsetPlus(value) => {
                        if !handle.space.is_constant() {
                            offset.wrapping_add(*value & 0xffff)
                        } else {
                            offset.checked_shr(8 * (value >> 16) as u32).unwrap_or(0)
                        }
                    }
                }
            }
        })
    }

    /// Copies the offset part of this template into `handle`.
    pub fn offset<'b, 'c>(
        &'b self,
        handle: &mut FixedHandle<'b>,
        walker: &ParserWalker<'b, 'c>,
        manager: &'b SpaceManager,
    ) -> Result<(), Error> {
        match self {
            Self::Handle(index, _) => {
                let h = walker.handle(*index)?;
                handle.offset_space = h.offset_space;
                handle.offset_offset = h.offset_offset;
                handle.offset_size = h.offset_size;
                handle.temporary_space = h.temporary_space;
                handle.temporary_offset = h.temporary_offset;
            }
            _ => {
                handle.offset_space = None;
                handle.offset_offset = handle.space.wrap_offset(self.fix(walker, manager)?);
                if handle.space.is_unique() && self.is_real() {
                    handle.offset_offset |= walker.unique_salt()?;
                }
            }
        }
        Ok(())
    }

    pub fn fix_space<'b, 'c>(
        &'b self,
        walker: &ParserWalker<'b, 'c>,
        manager: &'b SpaceManager,
    ) -> Result<&'b Arc<AddressSpace>, Error> {
        match self {
            Self::CurrentSpace => manager
                .space_by_id(walker.address().space_ref().id())
                .ok_or(Error::InvalidSpace),
            Self::Handle(index, HandleKind::Space) => {
                let h = walker.handle(*index)?;
                if h.is_dynamic() {
                    h.temporary_space.ok_or(Error::InvalidSpace)
                } else {
                    Ok(h.space)
                }
            }
            Self::SpaceId(space) => manager.space_by_id(*space).ok_or(Error::InvalidSpace),
            _ => Err(Error::InconsistentState),
        }
    }
}

/// Fails when `(space, offset)` names a temporary at or above `span`,
/// where it would overlap those of the next parse-tree node.
fn check_temporary(space: &ConstTpl, offset: &ConstTpl, manager: &SpaceManager, span: u64) -> Result<(), String> {
    if let (ConstTpl::SpaceId(id), ConstTpl::Real(offset)) = (space, offset) {
        let unique = manager.space_by_id(*id).map_or(false, |space| space.is_unique());
        if unique && *offset >= span {
            return Err(format!("uses temporary {:#x} outside of {:#x}", offset, span))
        }
    }
    Ok(())
}

/// How a constructor exports its value to the operand that invokes it.
#[derive(Debug, Clone, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
pub struct HandleTpl {
    space: ConstTpl,
    size: ConstTpl,
    ptr_space: ConstTpl,
    ptr_offset: ConstTpl,
    ptr_size: ConstTpl,
    tmp_space: ConstTpl,
    tmp_offset: ConstTpl,
}

impl HandleTpl {
    /// Exports the location `varnode` directly.
    pub fn direct(varnode: &VarnodeTpl) -> Self {
        Self {
            space: varnode.space.clone(),
            size: varnode.size.clone(),
            ptr_space: ConstTpl::Real(0),
            ptr_offset: varnode.offset.clone(),
            ptr_size: ConstTpl::Real(0),
            tmp_space: ConstTpl::Real(0),
            tmp_offset: ConstTpl::Real(0),
        }
    }

    /// Exports `size` bytes of `space` at the address held in `pointer`;
    /// the value is loaded into `temporary` when used.
    pub fn indirect(space: AddressSpaceId, size: u64, pointer: &VarnodeTpl, temporary: &VarnodeTpl) -> Self {
        Self {
            space: ConstTpl::SpaceId(space),
            size: ConstTpl::Real(size),
            ptr_space: pointer.space.clone(),
            ptr_offset: pointer.offset.clone(),
            ptr_size: pointer.size.clone(),
            tmp_space: temporary.space.clone(),
            tmp_offset: temporary.offset.clone(),
        }
    }

    fn check(&self, operands: usize, labels: usize, manager: &SpaceManager, span: u64) -> Result<(), String> {
        for value in [
            &self.space,
            &self.size,
            &self.ptr_space,
            &self.ptr_offset,
            &self.ptr_size,
            &self.tmp_space,
            &self.tmp_offset,
        ] {
            value.check(operands, labels, manager)?;
        }
        check_temporary(&self.space, &self.ptr_offset, manager, span)?;
        check_temporary(&self.ptr_space, &self.ptr_offset, manager, span)?;
        check_temporary(&self.tmp_space, &self.tmp_offset, manager, span)
    }

    pub fn fix<'b, 'c>(
        &'b self,
        walker: &ParserWalker<'b, 'c>,
        manager: &'b SpaceManager,
    ) -> Result<FixedHandle<'b>, Error> {
        if self.ptr_space.is_real() {
            let mut handle = FixedHandle::new(self.space.fix_space(walker, manager)?);
            handle.size = self.size.fix(walker, manager)? as usize;
            self.ptr_offset.offset(&mut handle, walker, manager)?;
            Ok(handle)
        } else {
            let mut handle = FixedHandle::new(self.space.fix_space(walker, manager)?);
            handle.size = self.size.fix(walker, manager)? as usize;
            handle.offset_offset = self.ptr_offset.fix(walker, manager)?;

            let offset_space = self.ptr_space.fix_space(walker, manager)?;
            if offset_space.is_constant() {
                handle.offset_space = None;
                handle.offset_offset = handle
                    .space
                    .wrap_offset(handle.offset_offset.wrapping_mul(handle.space.word_size() as u64));
            } else {
                if offset_space.is_unique() && self.ptr_offset.is_real() {
                    handle.offset_offset |= walker.unique_salt()?;
                }
                handle.offset_space = Some(offset_space);
                handle.offset_size = self.ptr_size.fix(walker, manager)? as usize;

                let temporary_space = self.tmp_space.fix_space(walker, manager)?;
                handle.temporary_offset = self.tmp_offset.fix(walker, manager)?;
                if temporary_space.is_unique() && self.tmp_offset.is_real() {
                    handle.temporary_offset |= walker.unique_salt()?;
                }
                handle.temporary_space = Some(temporary_space);
            }

            Ok(handle)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
pub struct VarnodeTpl {
    space: ConstTpl,
    offset: ConstTpl,
    size: ConstTpl,
}

impl VarnodeTpl {
    pub fn new(space: ConstTpl, offset: ConstTpl, size: ConstTpl) -> Self {
        Self { space, offset, size }
    }

    /// The location bound to operand `index`.
    pub fn operand(index: usize) -> Self {
        Self {
            space: ConstTpl::Handle(index, HandleKind::Space),
            offset: ConstTpl::Handle(index, HandleKind::Offset),
            size: ConstTpl::Handle(index, HandleKind::Size),
        }
    }

    pub fn constant(space: AddressSpaceId, value: u64, size: u64) -> Self {
        Self {
            space: ConstTpl::SpaceId(space),
            offset: ConstTpl::Real(value),
            size: ConstTpl::Real(size),
        }
    }

    pub fn is_dynamic<'b, 'c>(&'b self, walker: &ParserWalker<'b, 'c>) -> Result<bool, Error> {
        if let ConstTpl::Handle(index, _) = self.offset {
            Ok(walker.handle(index)?.is_dynamic())
        } else {
            Ok(false)
        }
    }

    pub fn is_relative(&self) -> bool {
        self.offset.is_relative()
    }

    fn check(&self, operands: usize, labels: usize, manager: &SpaceManager, span: u64) -> Result<(), String> {
        self.space.check(operands, labels, manager)?;
        self.offset.check(operands, labels, manager)?;
        self.size.check(operands, labels, manager)?;
        check_temporary(&self.space, &self.offset, manager, span)
    }

    pub fn space(&self) -> &ConstTpl {
        &self.space
    }

    pub fn offset(&self) -> &ConstTpl {
        &self.offset
    }

    pub fn size(&self) -> &ConstTpl {
        &self.size
    }
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
pub struct OpTpl {
    opcode: Opcode,
    inputs: Vec<VarnodeTpl>,
    output: Option<VarnodeTpl>,
}

impl OpTpl {
    pub fn new(opcode: Opcode, output: Option<VarnodeTpl>, inputs: Vec<VarnodeTpl>) -> Self {
        Self { opcode, inputs, output }
    }

    pub fn opcode(&self) -> Opcode {
        self.opcode
    }

    pub fn input(&self, index: usize) -> Result<&VarnodeTpl, Error> {
        self.inputs.get(index).ok_or(Error::InconsistentState)
    }

    pub fn inputs(&self) -> &[VarnodeTpl] {
        &self.inputs
    }

    pub fn output(&self) -> Option<&VarnodeTpl> {
        self.output.as_ref()
    }

    pub fn input_count(&self) -> usize {
        self.inputs.len()
    }
}

/// A constructor's semantic template: a flat operation list plus the
/// handle it exports.
#[derive(Debug, Clone, PartialEq, Eq, Default, serde::Deserialize, serde::Serialize)]
pub struct ConstructTpl {
    delay_slot: usize,
    labels: usize,
    result: Option<HandleTpl>,
    operations: Vec<OpTpl>,
}

impl ConstructTpl {
    pub fn new(operations: Vec<OpTpl>, result: Option<HandleTpl>, labels: usize, delay_slot: usize) -> Self {
        Self {
            delay_slot,
            labels,
            result,
            operations,
        }
    }

    /// Bytes of following instructions executed in this one's delay slot.
    pub fn delay_slot(&self) -> usize {
        self.delay_slot
    }

    pub fn labels(&self) -> usize {
        self.labels
    }

    pub fn operations(&self) -> &[OpTpl] {
        self.operations.as_ref()
    }

    pub fn result(&self) -> Option<&HandleTpl> {
        self.result.as_ref()
    }

    /// Checks that every operand, label and space the template names exists
    /// for a constructor with `operands` operands, and that its temporaries
    /// lie below `span`.
    pub(crate) fn check(&self, operands: usize, manager: &SpaceManager, span: u64) -> Result<(), String> {
        for op in &self.operations {
            for varnode in op.output.iter().chain(op.inputs.iter()) {
                varnode.check(operands, self.labels, manager, span)?;
            }

            let (limit, what) = match op.opcode {
                Opcode::Build => (operands, "operand"),
                Opcode::Label => (self.labels, "label"),
                _ => continue,
            };
            let index = op
                .inputs
                .first()
                .map(|input| input.offset.real() as usize)
                .ok_or_else(|| format!("{:?} names no {}", op.opcode, what))?;
            if index >= limit {
                return Err(format!("{:?} names {} {} of {}", op.opcode, what, index, limit))
            }
        }

        if let Some(result) = &self.result {
            result.check(operands, self.labels, manager, span)?;
        }
        Ok(())
    }
}
