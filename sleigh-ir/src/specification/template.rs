use ahash::AHashMap as Map;

use crate::disassembly::construct::{ConstTpl, ConstructTpl, HandleKind, HandleTpl, OpTpl, VarnodeTpl};
use crate::disassembly::Opcode;
use crate::space::AddressSpaceId;
use crate::specification::SpecificationError;

/// A value read or written by a semantic statement.
#[derive(Debug, Clone, PartialEq, Eq)]
#[derive(serde::Deserialize, serde::Serialize)]
pub enum Value {
    /// The operand of the enclosing constructor with this name.
    Operand(String),
    Register(String),
    Constant {
        value: u64,
        size: usize,
    },
    /// A scratch location local to the instruction; equal ids within one
    /// constructor refer to the same location.
    Temporary {
        id: usize,
        size: usize,
    },
    InstStart {
        size: usize,
    },
    InstNext {
        size: usize,
    },
    InstNext2 {
        size: usize,
    },
    /// A branch target placed by `Statement::Label`.
    Label(usize),
    /// The index of a user-defined operation, as the first input of
    /// `CALLOTHER`.
    UserOp(String),
    /// `size` bytes of `space` at a constant address.
    Memory {
        space: String,
        address: Box<Value>,
        size: usize,
    },
    /// `size` bytes of `space` at the address held in `pointer`.
    Deref {
        space: String,
        pointer: Box<Value>,
        size: usize,
    },
}

impl Value {
    pub fn operand(name: impl Into<String>) -> Self {
        Self::Operand(name.into())
    }

    pub fn register(name: impl Into<String>) -> Self {
        Self::Register(name.into())
    }

    pub fn constant(value: u64, size: usize) -> Self {
        Self::Constant { value, size }
    }

    pub fn temporary(id: usize, size: usize) -> Self {
        Self::Temporary { id, size }
    }

    pub fn user_op(name: impl Into<String>) -> Self {
        Self::UserOp(name.into())
    }

    pub fn memory(space: impl Into<String>, address: Value, size: usize) -> Self {
        Self::Memory {
            space: space.into(),
            address: Box::new(address),
            size,
        }
    }

    pub fn deref(space: impl Into<String>, pointer: Value, size: usize) -> Self {
        Self::Deref {
            space: space.into(),
            pointer: Box::new(pointer),
            size,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
#[derive(serde::Deserialize, serde::Serialize)]
pub enum Statement {
    Op {
        opcode: Opcode,
        output: Option<Value>,
        inputs: Vec<Value>,
    },
    /// Expands the semantics of the named subtable operand in place.
    Build(String),
    /// Splices in the semantics of the following instructions, covering
    /// at least this many bytes.
    DelaySlot(usize),
    Label(usize),
    Export(Value),
}

impl Statement {
    pub fn op(opcode: Opcode, output: Option<Value>, inputs: Vec<Value>) -> Self {
        Self::Op { opcode, output, inputs }
    }

    pub fn copy(output: Value, input: Value) -> Self {
        Self::op(Opcode::Copy, Some(output), vec![input])
    }

    pub fn build(operand: impl Into<String>) -> Self {
        Self::Build(operand.into())
    }
}

/// What a template needs to know about an operand.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum OperandClass {
    /// Resolves to a constant handle without a size.
    Constant,
    /// Resolves to a sized location (register, memory or subtable export).
    Location,
    Subtable,
}

pub(crate) trait TemplateResolver {
    fn operand(&self, name: &str) -> Option<(usize, OperandClass)>;

    /// `(space, offset, size)` of a register.
    fn register(&self, name: &str) -> Option<(AddressSpaceId, u64, usize)>;

    fn user_op(&self, name: &str) -> Option<usize>;

    /// Id and address size of a space.
    fn space(&self, name: &str) -> Option<(AddressSpaceId, usize)>;

    fn constant_space(&self) -> AddressSpaceId;

    fn unique_space(&self) -> AddressSpaceId;
}

/// Hands out unique-space offsets for temporaries.
///
/// Offsets are multiples of a stride wide enough that or-ing in the
/// per-instruction unique base never overlaps two temporaries.
#[derive(Debug, Clone)]
pub(crate) struct TemporaryAllocator {
    next: u64,
    stride: u64,
}

impl TemporaryAllocator {
    const START: u64 = 0x10000;

    pub fn new(unique_mask: u64) -> Self {
        let stride = unique_mask
            .wrapping_add(1)
            .checked_shl(4)
            .unwrap_or(0)
            .max(0x80)
            .checked_next_power_of_two()
            .unwrap_or(0x80);
        let next = ((Self::START + stride - 1) / stride) * stride;
        Self { next, stride }
    }

    pub fn allocate(&mut self) -> u64 {
        let offset = self.next;
        self.next = self.next.wrapping_add(self.stride);
        offset
    }

    /// Smallest power of two above every offset handed out so far. Each
    /// parse-tree node of an instruction gets its own multiple of it.
    pub fn span(&self) -> u64 {
        self.next.checked_next_power_of_two().unwrap_or(0)
    }
}

struct TemplateCompiler<'a> {
    resolver: &'a dyn TemplateResolver,
    allocator: &'a mut TemporaryAllocator,
    context: &'a str,
    temporaries: Map<usize, u64>,
    operations: Vec<OpTpl>,
    result: Option<HandleTpl>,
    labels: usize,
    delay_slot: usize,
}

impl<'a> TemplateCompiler<'a> {
    fn error(&self, reason: impl Into<String>) -> SpecificationError {
        SpecificationError::template(self.context, reason)
    }

    fn temporary(&mut self, size: usize) -> VarnodeTpl {
        VarnodeTpl::new(
            ConstTpl::SpaceId(self.resolver.unique_space()),
            ConstTpl::Real(self.allocator.allocate()),
            ConstTpl::Real(size as u64),
        )
    }

    fn constant(&self, value: u64, size: usize) -> VarnodeTpl {
        VarnodeTpl::constant(self.resolver.constant_space(), value, size as u64)
    }

    fn space(&self, name: &str) -> Result<(AddressSpaceId, usize), SpecificationError> {
        self.resolver
            .space(name)
            .ok_or_else(|| SpecificationError::unresolved(name, self.context))
    }

    /// The size a value has without context, if it has one.
    fn known_size(&self, value: &Value) -> Option<usize> {
        match value {
            Value::Operand(_) => None,
            Value::Register(name) => self.resolver.register(name).map(|(_, _, size)| size),
            Value::Constant { size, .. }
            | Value::Temporary { size, .. }
            | Value::InstStart { size }
            | Value::InstNext { size }
            | Value::InstNext2 { size }
            | Value::Memory { size, .. }
            | Value::Deref { size, .. } => Some(*size),
            Value::Label(_) | Value::UserOp(_) => None,
        }
    }

    /// Compiles `value` as a plain varnode; dereferences are handled by the
    /// caller. `size_hint` sizes operands that resolve to bare constants.
    fn varnode(&mut self, value: &Value, size_hint: Option<usize>) -> Result<VarnodeTpl, SpecificationError> {
        Ok(match value {
            Value::Operand(name) => {
                let (index, class) = self
                    .resolver
                    .operand(name)
                    .ok_or_else(|| SpecificationError::unresolved(name.as_str(), self.context))?;
                match class {
                    OperandClass::Constant => {
                        let size = size_hint.ok_or_else(|| {
                            self.error(format!("size of constant operand `{}` cannot be inferred", name))
                        })?;
                        VarnodeTpl::new(
                            ConstTpl::SpaceId(self.resolver.constant_space()),
                            ConstTpl::Handle(index, HandleKind::Offset),
                            ConstTpl::Real(size as u64),
                        )
                    }
                    OperandClass::Location | OperandClass::Subtable => VarnodeTpl::operand(index),
                }
            }
            Value::Register(name) => {
                let (space, offset, size) = self
                    .resolver
                    .register(name)
                    .ok_or_else(|| SpecificationError::unresolved(name.as_str(), self.context))?;
                VarnodeTpl::new(
                    ConstTpl::SpaceId(space),
                    ConstTpl::Real(offset),
                    ConstTpl::Real(size as u64),
                )
            }
            Value::Constant { value, size } => self.constant(*value, *size),
            Value::Temporary { id, size } => {
                let offset = match self.temporaries.get(id) {
                    Some(offset) => *offset,
                    None => {
                        let offset = self.allocator.allocate();
                        self.temporaries.insert(*id, offset);
                        offset
                    }
                };
                VarnodeTpl::new(
                    ConstTpl::SpaceId(self.resolver.unique_space()),
                    ConstTpl::Real(offset),
                    ConstTpl::Real(*size as u64),
                )
            }
            Value::InstStart { size } => VarnodeTpl::new(
                ConstTpl::SpaceId(self.resolver.constant_space()),
                ConstTpl::Start,
                ConstTpl::Real(*size as u64),
            ),
            Value::InstNext { size } => VarnodeTpl::new(
                ConstTpl::SpaceId(self.resolver.constant_space()),
                ConstTpl::Next,
                ConstTpl::Real(*size as u64),
            ),
            Value::InstNext2 { size } => VarnodeTpl::new(
                ConstTpl::SpaceId(self.resolver.constant_space()),
                ConstTpl::Next2,
                ConstTpl::Real(*size as u64),
            ),
            Value::Label(label) => {
                if *label >= self.labels {
                    return Err(self.error(format!("label {} is never placed", label)))
                }
                VarnodeTpl::new(
                    ConstTpl::SpaceId(self.resolver.constant_space()),
                    ConstTpl::Relative(*label as u64),
                    ConstTpl::Real(4),
                )
            }
            Value::UserOp(name) => {
                let index = self
                    .resolver
                    .user_op(name)
                    .ok_or_else(|| SpecificationError::unresolved(name.as_str(), self.context))?;
                self.constant(index as u64, 4)
            }
            Value::Memory { space, address, size } => {
                let (space, _) = self.space(space)?;
                let offset = match address.as_ref() {
                    Value::Constant { value, .. } => *value,
                    _ => return Err(self.error("memory address must be a constant")),
                };
                VarnodeTpl::new(
                    ConstTpl::SpaceId(space),
                    ConstTpl::Real(offset),
                    ConstTpl::Real(*size as u64),
                )
            }
            Value::Deref { .. } => return Err(self.error("nested dereference")),
        })
    }

    /// The space reference and pointer varnode of a dereference.
    fn pointer(
        &mut self,
        space: &str,
        pointer: &Value,
    ) -> Result<(AddressSpaceId, VarnodeTpl), SpecificationError> {
        let (space, address_size) = self.space(space)?;
        let pointer = self.varnode(pointer, Some(address_size))?;
        Ok((space, pointer))
    }

    fn space_reference(&self, space: AddressSpaceId) -> VarnodeTpl {
        VarnodeTpl::new(
            ConstTpl::SpaceId(self.resolver.constant_space()),
            ConstTpl::Real(space.index() as u64),
            ConstTpl::Real(8),
        )
    }

    /// Compiles an input, loading dereferences into a fresh temporary.
    fn input(&mut self, value: &Value, size_hint: Option<usize>) -> Result<VarnodeTpl, SpecificationError> {
        if let Value::Deref { space, pointer, size } = value {
            let (space, pointer) = self.pointer(space, pointer)?;
            let temporary = self.temporary(*size);
            self.operations.push(OpTpl::new(
                Opcode::Load,
                Some(temporary.clone()),
                vec![self.space_reference(space), pointer],
            ));
            Ok(temporary)
        } else {
            self.varnode(value, size_hint)
        }
    }

    fn op(&mut self, opcode: Opcode, output: Option<&Value>, inputs: &[Value]) -> Result<(), SpecificationError> {
        let size_hint = inputs
            .iter()
            .find_map(|input| self.known_size(input))
            .or_else(|| output.and_then(|output| self.known_size(output)));

        let inputs = inputs
            .iter()
            .map(|input| self.input(input, size_hint))
            .collect::<Result<Vec<_>, _>>()?;

        match output {
            Some(Value::Deref { space, pointer, size }) => {
                let (space, pointer) = self.pointer(space, pointer)?;
                let temporary = self.temporary(*size);
                self.operations.push(OpTpl::new(opcode, Some(temporary.clone()), inputs));
                self.operations.push(OpTpl::new(
                    Opcode::Store,
                    None,
                    vec![self.space_reference(space), pointer, temporary],
                ));
            }
            Some(output) => {
                let output = self.varnode(output, size_hint)?;
                self.operations.push(OpTpl::new(opcode, Some(output), inputs));
            }
            None => self.operations.push(OpTpl::new(opcode, None, inputs)),
        }
        Ok(())
    }

    fn export(&mut self, value: &Value) -> Result<(), SpecificationError> {
        if self.result.is_some() {
            return Err(self.error("more than one export"))
        }

        let result = match value {
            Value::Deref { space, pointer, size } => {
                let (space, pointer) = self.pointer(space, pointer)?;
                let temporary = self.temporary(*size);
                HandleTpl::indirect(space, *size as u64, &pointer, &temporary)
            }
            Value::Label(_) | Value::UserOp(_) => {
                return Err(self.error("only locations and constants can be exported"))
            }
            value => {
                let hint = self.known_size(value);
                HandleTpl::direct(&self.varnode(value, hint)?)
            }
        };

        self.result = Some(result);
        Ok(())
    }

    fn statement(&mut self, statement: &Statement) -> Result<(), SpecificationError> {
        match statement {
            Statement::Op { opcode, output, inputs } => {
                if opcode.is_directive() {
                    return Err(self.error(format!("{} cannot be used directly", opcode)))
                }
                self.op(*opcode, output.as_ref(), inputs)?
            }
            Statement::Build(name) => {
                let (index, class) = self
                    .resolver
                    .operand(name)
                    .ok_or_else(|| SpecificationError::unresolved(name.as_str(), self.context))?;
                if class != OperandClass::Subtable {
                    return Err(self.error(format!("`{}` is not a subtable operand", name)))
                }
                let index = self.constant(index as u64, 4);
                self.operations.push(OpTpl::new(Opcode::Build, None, vec![index]));
            }
            Statement::DelaySlot(bytes) => {
                self.delay_slot = self.delay_slot.max(*bytes);
                let bytes = self.constant(*bytes as u64, 4);
                self.operations.push(OpTpl::new(Opcode::DelaySlot, None, vec![bytes]));
            }
            Statement::Label(label) => {
                let index = self.constant(*label as u64, 4);
                self.operations.push(OpTpl::new(Opcode::Label, None, vec![index]));
            }
            Statement::Export(value) => self.export(value)?,
        }
        Ok(())
    }
}

/// Compiles one constructor's semantics into a construct template.
pub(crate) fn compile(
    statements: &[Statement],
    resolver: &dyn TemplateResolver,
    allocator: &mut TemporaryAllocator,
    context: &str,
) -> Result<ConstructTpl, SpecificationError> {
    let labels = statements
        .iter()
        .filter_map(|s| match s {
            Statement::Label(label) => Some(*label + 1),
            _ => None,
        })
        .max()
        .unwrap_or(0);

    let mut compiler = TemplateCompiler {
        resolver,
        allocator,
        context,
        temporaries: Map::default(),
        operations: Vec::with_capacity(statements.len()),
        result: None,
        labels,
        delay_slot: 0,
    };

    for statement in statements {
        compiler.statement(statement)?;
    }

    Ok(ConstructTpl::new(
        compiler.operations,
        compiler.result,
        compiler.labels,
        compiler.delay_slot,
    ))
}

#[cfg(test)]
mod test {
    use super::*;

    struct Scope;

    impl TemplateResolver for Scope {
        fn operand(&self, name: &str) -> Option<(usize, OperandClass)> {
            match name {
                "rd" => Some((0, OperandClass::Location)),
                "imm" => Some((1, OperandClass::Constant)),
                "src" => Some((2, OperandClass::Subtable)),
                _ => None,
            }
        }

        fn register(&self, name: &str) -> Option<(AddressSpaceId, u64, usize)> {
            (name == "sp").then(|| (AddressSpaceId::register_id(2), 0x10, 2))
        }

        fn user_op(&self, name: &str) -> Option<usize> {
            (name == "halt").then(|| 0)
        }

        fn space(&self, name: &str) -> Option<(AddressSpaceId, usize)> {
            (name == "ram").then(|| (AddressSpaceId::default_id(1), 2))
        }

        fn constant_space(&self) -> AddressSpaceId {
            AddressSpaceId::constant_id(0)
        }

        fn unique_space(&self) -> AddressSpaceId {
            AddressSpaceId::unique_id(3)
        }
    }

    #[test]
    fn temporaries_avoid_the_unique_base() {
        let mut allocator = TemporaryAllocator::new(0xff);
        let first = allocator.allocate();
        let second = allocator.allocate();
        assert_eq!(first % 0x1000, 0);
        assert_eq!(second - first, 0x1000);
        assert!(first >= 0x10000);

        let mut small = TemporaryAllocator::new(0);
        assert_eq!(small.span(), 0x10000);
        assert_eq!(small.allocate(), 0x10000);
        assert_eq!(small.allocate(), 0x10080);
        assert_eq!(small.span(), 0x20000);
    }

    #[test]
    fn constant_operands_take_their_partner_size() -> Result<(), SpecificationError> {
        let mut allocator = TemporaryAllocator::new(0);
        let tpl = compile(
            &[Statement::copy(Value::operand("rd"), Value::operand("imm"))],
            &Scope,
            &mut allocator,
            "test",
        );
        assert!(matches!(tpl, Err(SpecificationError::IllFormedTemplate { .. })));

        let tpl = compile(
            &[Statement::op(
                Opcode::IntAdd,
                Some(Value::register("sp")),
                vec![Value::register("sp"), Value::operand("imm")],
            )],
            &Scope,
            &mut allocator,
            "test",
        )?;

        let op = &tpl.operations()[0];
        assert_eq!(op.input(1).unwrap().size(), &ConstTpl::Real(2));
        assert_eq!(op.input(1).unwrap().offset(), &ConstTpl::Handle(1, HandleKind::Offset));
        assert_eq!(op.output().unwrap().offset(), &ConstTpl::Real(0x10));
        Ok(())
    }

    #[test]
    fn dereferences_expand_to_load_and_store() -> Result<(), SpecificationError> {
        let mut allocator = TemporaryAllocator::new(0);
        let tpl = compile(
            &[
                Statement::copy(
                    Value::deref("ram", Value::register("sp"), 1),
                    Value::deref("ram", Value::operand("rd"), 1),
                ),
                Statement::build("src"),
                Statement::Export(Value::deref("ram", Value::operand("rd"), 2)),
            ],
            &Scope,
            &mut allocator,
            "test",
        )?;

        let opcodes = tpl.operations().iter().map(OpTpl::opcode).collect::<Vec<_>>();
        assert_eq!(
            opcodes,
            vec![Opcode::Load, Opcode::Copy, Opcode::Store, Opcode::Build]
        );
        assert!(tpl.result().is_some());
        Ok(())
    }

    #[test]
    fn labels_and_directives() -> Result<(), SpecificationError> {
        let mut allocator = TemporaryAllocator::new(0);
        let tpl = compile(
            &[
                Statement::op(Opcode::CBranch, None, vec![Value::Label(0), Value::constant(1, 1)]),
                Statement::op(Opcode::CallOther, None, vec![Value::user_op("halt")]),
                Statement::Label(0),
                Statement::DelaySlot(2),
            ],
            &Scope,
            &mut allocator,
            "test",
        )?;

        assert_eq!(tpl.labels(), 1);
        assert_eq!(tpl.delay_slot(), 2);
        assert!(tpl.operations()[0].input(0).unwrap().is_relative());

        let bad = compile(&[Statement::build("rd")], &Scope, &mut allocator, "test");
        assert!(matches!(bad, Err(SpecificationError::IllFormedTemplate { .. })));

        let bad = compile(
            &[Statement::op(Opcode::Branch, None, vec![Value::Label(3)])],
            &Scope,
            &mut allocator,
            "test",
        );
        assert!(bad.is_err());
        Ok(())
    }
}
