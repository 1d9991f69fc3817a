use crate::bits;
use crate::disassembly::error::Error;
use crate::disassembly::symbol::{Symbol, SymbolTable};
use crate::disassembly::walker::ParserWalker;

use sleigh_bytes::{Endian, Order, BE};

use std::mem::size_of;

#[derive(Debug, Clone, PartialEq, Eq)]
#[derive(serde::Deserialize, serde::Serialize)]
pub enum PatternExpression {
    /// Bits `bit_start..=bit_end` (LSB numbering) of the token occupying
    /// bytes `byte_start..=byte_end` of the operand's window.
    TokenField {
        endian: Endian,
        sign_bit: bool,
        bit_start: usize,
        bit_end: usize,
        byte_start: usize,
        byte_end: usize,
        shift: u32,
    },
    /// Bits `bit_start..=bit_end` of the context words, numbered from the
    /// most significant bit of word zero.
    ContextField {
        sign_bit: bool,
        bit_start: usize,
        bit_end: usize,
    },
    Constant {
        value: i64,
    },
    Operand {
        index: usize,
        table_id: usize,
        constructor_id: usize,
    },
    StartInstruction,
    EndInstruction,
    Plus(Box<Self>, Box<Self>),
    Sub(Box<Self>, Box<Self>),
    Mult(Box<Self>, Box<Self>),
    LeftShift(Box<Self>, Box<Self>),
    RightShift(Box<Self>, Box<Self>),
    And(Box<Self>, Box<Self>),
    Or(Box<Self>, Box<Self>),
    Xor(Box<Self>, Box<Self>),
    Div(Box<Self>, Box<Self>),
    Minus(Box<Self>),
    Not(Box<Self>),
}

impl PatternExpression {
    pub fn constant(value: i64) -> Self {
        Self::Constant { value }
    }

    /// A field of an `size`-byte token, read in `endian` order.
    pub fn token_field(endian: Endian, size: usize, low: usize, high: usize, signed: bool) -> Self {
        Self::TokenField {
            endian,
            sign_bit: signed,
            bit_start: low,
            bit_end: high,
            byte_start: 0,
            byte_end: size.max(1) - 1,
            shift: low as u32,
        }
    }

    pub fn context_field(low: usize, high: usize, signed: bool) -> Self {
        Self::ContextField {
            sign_bit: signed,
            bit_start: low,
            bit_end: high,
        }
    }

    pub fn min_value(&self) -> Option<i64> {
        match self {
            Self::TokenField { sign_bit: false, .. }
            | Self::ContextField { sign_bit: false, .. }
            | Self::StartInstruction
            | Self::EndInstruction => Some(0),
            Self::TokenField { bit_start, bit_end, .. }
            | Self::ContextField { bit_start, bit_end, .. } => {
                Some(bits::shl(-1, (bit_end - bit_start) as u32))
            }
            Self::Constant { value } => Some(*value),
            _ => None,
        }
    }

    pub fn max_value(&self) -> Option<i64> {
        match self {
            Self::TokenField { sign_bit: false, bit_start, bit_end, .. }
            | Self::ContextField { sign_bit: false, bit_start, bit_end, .. } => {
                Some(bits::zero_extend(!0i64, bit_end - bit_start))
            }
            Self::TokenField { bit_start, bit_end, .. }
            | Self::ContextField { bit_start, bit_end, .. } => {
                Some(bits::zero_extend(!0i64, bit_end - bit_start) >> 1)
            }
            Self::StartInstruction | Self::EndInstruction => Some(0),
            Self::Constant { value } => Some(*value),
            _ => None,
        }
    }

    /// Checks field widths and that operand references resolve to an
    /// operand of an existing constructor.
    pub(crate) fn check(&self, symbols: &SymbolTable) -> Result<(), String> {
        match self {
            Self::TokenField {
                bit_start,
                bit_end,
                byte_start,
                byte_end,
                shift,
                ..
            } => {
                if bit_start > bit_end || bit_end - bit_start >= 64 || byte_start > byte_end || *shift >= 64 {
                    return Err(format!(
                        "token field bits {}..={} of bytes {}..={} are out of range",
                        bit_start, bit_end, byte_start, byte_end
                    ))
                }
            }
            Self::ContextField { bit_start, bit_end, .. } => {
                if bit_start > bit_end || bit_end - bit_start >= 32 {
                    return Err(format!("context field bits {}..={} are out of range", bit_start, bit_end))
                }
            }
            Self::Operand {
                index,
                table_id,
                constructor_id,
            } => {
                let operand = symbols
                    .constructor(*table_id, *constructor_id)
                    .and_then(|ctor| ctor.operand(*index))
                    .and_then(|id| symbols.symbol(id))
                    .map_err(|e| format!("operand {} of constructor {}: {}", index, constructor_id, e))?;
                if !matches!(operand, Symbol::Operand { .. }) {
                    return Err(format!("`{}` is not an operand", operand.name()))
                }
            }
            Self::Plus(l, r)
            | Self::Sub(l, r)
            | Self::Mult(l, r)
            | Self::LeftShift(l, r)
            | Self::RightShift(l, r)
            | Self::And(l, r)
            | Self::Or(l, r)
            | Self::Xor(l, r)
            | Self::Div(l, r) => {
                l.check(symbols)?;
                r.check(symbols)?;
            }
            Self::Minus(v) | Self::Not(v) => v.check(symbols)?,
            Self::Constant { .. } | Self::StartInstruction | Self::EndInstruction => (),
        }
        Ok(())
    }

    /// True when the value depends only on the instruction bytes, the
    /// context and the start address.
    pub fn is_static(&self) -> bool {
        match self {
            Self::Operand { .. } | Self::EndInstruction => false,
            Self::TokenField { .. }
            | Self::ContextField { .. }
            | Self::Constant { .. }
            | Self::StartInstruction => true,
            Self::Plus(l, r)
            | Self::Sub(l, r)
            | Self::Mult(l, r)
            | Self::LeftShift(l, r)
            | Self::RightShift(l, r)
            | Self::And(l, r)
            | Self::Or(l, r)
            | Self::Xor(l, r)
            | Self::Div(l, r) => l.is_static() && r.is_static(),
            Self::Minus(v) | Self::Not(v) => v.is_static(),
        }
    }

    /// Evaluates at the walker's current position.
    pub fn value<'b, 'c>(
        &'b self,
        walker: &ParserWalker<'b, 'c>,
        symbols: &'b SymbolTable,
    ) -> Result<i64, Error> {
        self.evaluate(walker, walker.offset()?, symbols)
    }

    /// Evaluates with token fields read relative to `offset`, a byte offset
    /// from the start of the instruction.
    pub fn evaluate<'b, 'c>(
        &'b self,
        walker: &ParserWalker<'b, 'c>,
        offset: usize,
        symbols: &'b SymbolTable,
    ) -> Result<i64, Error> {
        Ok(match self {
            Self::TokenField {
                endian,
                sign_bit,
                bit_start,
                bit_end,
                byte_start,
                byte_end,
                shift,
            } => {
                let size = (byte_end + 1).saturating_sub(*byte_start).min(size_of::<u64>());
                let bytes = walker.instruction_window_at(offset + byte_start, size)?;
                let res = bits::shr_arith(endian.read_unsigned(bytes) as i64, *shift);
                if *sign_bit {
                    bits::sign_extend(res, bit_end - bit_start)
                } else {
                    bits::zero_extend(res, bit_end - bit_start)
                }
            }
            Self::ContextField {
                sign_bit,
                bit_start,
                bit_end,
            } => {
                let size = (bit_end - bit_start + 1).min(8 * size_of::<u32>());
                let res = walker.context_bits(*bit_start, size) as i64;
                if *sign_bit {
                    bits::sign_extend(res, bit_end - bit_start)
                } else {
                    bits::zero_extend(res, bit_end - bit_start)
                }
            }
            Self::Constant { value } => *value,
            Self::Operand {
                index,
                table_id,
                constructor_id,
            } => {
                let ctor = symbols.constructor(*table_id, *constructor_id)?;
                let operand = symbols.symbol(ctor.operand(*index)?)?;
                let offset = walker.operand_offset(ctor, *index, symbols)?;

                match operand {
                    Symbol::Operand { def_expr: Some(expr), .. } => {
                        expr.evaluate(walker, offset, symbols)?
                    }
                    Symbol::Operand { subsym_id: Some(id), .. } => symbols
                        .symbol(*id)?
                        .pattern_value()?
                        .evaluate(walker, offset, symbols)?,
                    _ => return Err(Error::InvalidPattern),
                }
            }
            Self::StartInstruction => walker.address().offset() as i64,
            Self::EndInstruction => walker
                .next_address()
                .map(|a| a.offset() as i64)
                .ok_or(Error::InvalidNextAddress)?,
            Self::Plus(lhs, rhs) => lhs
                .evaluate(walker, offset, symbols)?
                .wrapping_add(rhs.evaluate(walker, offset, symbols)?),
            Self::Sub(lhs, rhs) => lhs
                .evaluate(walker, offset, symbols)?
                .wrapping_sub(rhs.evaluate(walker, offset, symbols)?),
            Self::Mult(lhs, rhs) => lhs
                .evaluate(walker, offset, symbols)?
                .wrapping_mul(rhs.evaluate(walker, offset, symbols)?),
            Self::LeftShift(lhs, rhs) => {
                let l = lhs.evaluate(walker, offset, symbols)?;
                let r = rhs.evaluate(walker, offset, symbols)?;
                if r < 0 { 0 } else { bits::shl(l, r.min(64) as u32) }
            }
            Self::RightShift(lhs, rhs) => {
                let l = lhs.evaluate(walker, offset, symbols)?;
                let r = rhs.evaluate(walker, offset, symbols)?;
                if r < 0 { 0 } else { bits::shr_arith(l, r.min(64) as u32) }
            }
            Self::And(lhs, rhs) => {
                lhs.evaluate(walker, offset, symbols)? & rhs.evaluate(walker, offset, symbols)?
            }
            Self::Or(lhs, rhs) => {
                lhs.evaluate(walker, offset, symbols)? | rhs.evaluate(walker, offset, symbols)?
            }
            Self::Xor(lhs, rhs) => {
                lhs.evaluate(walker, offset, symbols)? ^ rhs.evaluate(walker, offset, symbols)?
            }
            Self::Div(lhs, rhs) => {
                let l = lhs.evaluate(walker, offset, symbols)?;
                let r = rhs.evaluate(walker, offset, symbols)?;
                if r == 0 {
                    return Err(Error::DivisionByZero)
                }
                l.wrapping_div(r)
            }
            Self::Minus(operand) => operand.evaluate(walker, offset, symbols)?.wrapping_neg(),
            Self::Not(operand) => !operand.evaluate(walker, offset, symbols)?,
        })
    }
}

macro_rules! binary_expression {
    ($trait:ident, $method:ident, $variant:ident) => {
        impl std::ops::$trait for PatternExpression {
            type Output = Self;

            fn $method(self, rhs: Self) -> Self {
                Self::$variant(Box::new(self), Box::new(rhs))
            }
        }
    };
}

binary_expression!(Add, add, Plus);
binary_expression!(Sub, sub, Sub);
binary_expression!(Mul, mul, Mult);
binary_expression!(Div, div, Div);
binary_expression!(Shl, shl, LeftShift);
binary_expression!(Shr, shr, RightShift);
binary_expression!(BitAnd, bitand, And);
binary_expression!(BitOr, bitor, Or);
binary_expression!(BitXor, bitxor, Xor);

impl std::ops::Neg for PatternExpression {
    type Output = Self;

    fn neg(self) -> Self {
        Self::Minus(Box::new(self))
    }
}

impl std::ops::Not for PatternExpression {
    type Output = Self;

    fn not(self) -> Self {
        Self::Not(Box::new(self))
    }
}

const WORD: usize = size_of::<u32>();

fn pack(bytes: &[u8]) -> Vec<u32> {
    bytes.chunks(WORD).map(BE::read_word).collect()
}

/// A mask/value pair over a run of bytes starting at `offset`.
#[derive(Debug, Clone, PartialEq, Eq)]
#[derive(serde::Deserialize, serde::Serialize)]
pub struct PatternBlock {
    offset: usize,
    non_zero_size: Option<usize>,
    masks: Vec<u32>,
    values: Vec<u32>,
}

impl PatternBlock {
    const ALWAYS_TRUE: Option<usize> = Some(0);
    const ALWAYS_FALSE: Option<usize> = None;

    pub fn new(always: bool) -> Self {
        Self {
            offset: 0,
            non_zero_size: if always {
                Self::ALWAYS_TRUE
            } else {
                Self::ALWAYS_FALSE
            },
            masks: Vec::new(),
            values: Vec::new(),
        }
    }

    pub fn from_bytes(offset: usize, masks: &[u8], values: &[u8]) -> Self {
        let values = values
            .iter()
            .zip(masks.iter())
            .map(|(v, m)| v & m)
            .collect::<Vec<_>>();

        let mut block = Self {
            offset,
            non_zero_size: Some(masks.len()),
            masks: pack(masks),
            values: pack(&values),
        };
        block.normalise();
        block
    }

    pub fn always_true(&self) -> bool {
        self.non_zero_size == Self::ALWAYS_TRUE
    }

    pub fn always_false(&self) -> bool {
        self.non_zero_size == Self::ALWAYS_FALSE
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Number of bytes from the window start to the last constrained byte.
    pub fn length(&self) -> usize {
        match self.non_zero_size {
            Some(size) if size > 0 => self.offset + size,
            _ => 0,
        }
    }

    pub fn mask_byte(&self, index: usize) -> u8 {
        Self::byte_of(&self.masks, self.offset, index)
    }

    pub fn value_byte(&self, index: usize) -> u8 {
        Self::byte_of(&self.values, self.offset, index)
    }

    fn byte_of(words: &[u32], offset: usize, index: usize) -> u8 {
        if index < offset {
            return 0
        }
        let index = index - offset;
        words
            .get(index / WORD)
            .map(|w| (w >> (8 * (WORD - 1 - index % WORD))) as u8)
            .unwrap_or(0)
    }

    /// The required value of bit `index` (MSB-first across the window), if
    /// the block constrains it.
    pub fn bit(&self, index: usize) -> Option<bool> {
        let byte = index / 8;
        let shift = 7 - (index % 8);
        if (self.mask_byte(byte) >> shift) & 1 == 0 {
            None
        } else {
            Some((self.value_byte(byte) >> shift) & 1 == 1)
        }
    }

    /// The block matching exactly when both `self` and `other` match.
    pub fn intersect(&self, other: &Self) -> Self {
        if self.always_false() || other.always_false() {
            return Self::new(false)
        }

        let end = self.length().max(other.length());
        let mut masks = vec![0u8; end];
        let mut values = vec![0u8; end];

        for i in 0..end {
            let (m1, v1) = (self.mask_byte(i), self.value_byte(i));
            let (m2, v2) = (other.mask_byte(i), other.value_byte(i));
            if (m1 & m2) & (v1 ^ v2) != 0 {
                return Self::new(false)
            }
            masks[i] = m1 | m2;
            values[i] = (v1 & m1) | (v2 & m2);
        }

        Self::from_bytes(0, &masks, &values)
    }

    pub fn shift(&mut self, shift: isize) {
        self.offset = (self.offset as isize + shift).max(0) as usize;
        self.normalise()
    }

    /// Strips unconstrained leading and trailing bytes.
    pub fn normalise(&mut self) {
        if self.always_false() || self.always_true() {
            self.offset = 0;
            self.masks.clear();
            self.values.clear();
            return;
        }

        let size = self.masks.len() * WORD;
        let masks = (0..size)
            .map(|i| Self::byte_of(&self.masks, 0, i))
            .collect::<Vec<_>>();
        let values = (0..size)
            .map(|i| Self::byte_of(&self.values, 0, i))
            .collect::<Vec<_>>();

        let first = masks.iter().position(|m| *m != 0);
        let last = masks.iter().rposition(|m| *m != 0);

        if let (Some(first), Some(last)) = (first, last) {
            self.offset += first;
            self.masks = pack(&masks[first..=last]);
            self.values = pack(&values[first..=last]);
            self.non_zero_size = Some(last - first + 1);
        } else {
            self.offset = 0;
            self.non_zero_size = Self::ALWAYS_TRUE;
            self.masks.clear();
            self.values.clear();
        }
    }

    pub fn is_context_match<'b, 'c>(&'b self, walker: &ParserWalker<'b, 'c>) -> bool {
        match self.non_zero_size {
            Self::ALWAYS_FALSE => false,
            Self::ALWAYS_TRUE => true,
            _ => {
                let mut offset = self.offset;
                for (mask, value) in self.masks.iter().zip(self.values.iter()) {
                    let data = walker.context_bytes(offset, WORD);
                    if mask & data != *value {
                        return false;
                    }
                    offset += WORD;
                }
                true
            }
        }
    }

    /// Bytes beyond the available window never match.
    pub fn is_instruction_match<'b, 'c>(&'b self, walker: &ParserWalker<'b, 'c>) -> bool {
        match self.non_zero_size {
            Self::ALWAYS_FALSE => false,
            Self::ALWAYS_TRUE => true,
            Some(size) => {
                for (i, (mask, value)) in self.masks.iter().zip(self.values.iter()).enumerate() {
                    let start = self.offset + i * WORD;
                    let wanted = (size - i * WORD).min(WORD);
                    let data = match walker.instruction_window(start, wanted) {
                        Ok(bytes) => BE::read_word(bytes),
                        Err(_) => return false,
                    };
                    if mask & data != *value {
                        return false;
                    }
                }
                true
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
#[derive(serde::Deserialize, serde::Serialize)]
pub struct InstructionPattern {
    mask_value: PatternBlock,
}

impl InstructionPattern {
    pub fn new(mask_value: PatternBlock) -> Self {
        Self { mask_value }
    }

    pub fn block(&self) -> &PatternBlock {
        &self.mask_value
    }

    #[inline(always)]
    pub fn is_match<'b, 'c>(&'b self, walker: &ParserWalker<'b, 'c>) -> bool {
        self.mask_value.is_instruction_match(walker)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
#[derive(serde::Deserialize, serde::Serialize)]
pub struct ContextPattern {
    mask_value: PatternBlock,
}

impl ContextPattern {
    pub fn new(mask_value: PatternBlock) -> Self {
        Self { mask_value }
    }

    pub fn block(&self) -> &PatternBlock {
        &self.mask_value
    }

    #[inline(always)]
    pub fn is_match<'b, 'c>(&'b self, walker: &ParserWalker<'b, 'c>) -> bool {
        self.mask_value.is_context_match(walker)
    }
}

/// One alternative of a constructor's pattern: a conjunction of an
/// instruction block and a context block.
#[derive(Debug, Clone, PartialEq, Eq)]
#[derive(serde::Deserialize, serde::Serialize)]
pub enum DisjointPattern {
    Instruction(InstructionPattern),
    Context(ContextPattern),
    Combine {
        context: ContextPattern,
        instruction: InstructionPattern,
    },
}

impl DisjointPattern {
    pub fn new(context: PatternBlock, instruction: PatternBlock) -> Self {
        if context.always_false() || instruction.always_false() {
            Self::Instruction(InstructionPattern::new(PatternBlock::new(false)))
        } else if context.always_true() {
            Self::Instruction(InstructionPattern::new(instruction))
        } else if instruction.always_true() {
            Self::Context(ContextPattern::new(context))
        } else {
            Self::Combine {
                context: ContextPattern::new(context),
                instruction: InstructionPattern::new(instruction),
            }
        }
    }

    pub fn instruction_block(&self) -> Option<&PatternBlock> {
        match self {
            Self::Instruction(pat) | Self::Combine { instruction: pat, .. } => Some(pat.block()),
            Self::Context(_) => None,
        }
    }

    pub fn context_block(&self) -> Option<&PatternBlock> {
        match self {
            Self::Context(pat) | Self::Combine { context: pat, .. } => Some(pat.block()),
            Self::Instruction(_) => None,
        }
    }

    pub fn always_false(&self) -> bool {
        self.instruction_block().map(PatternBlock::always_false).unwrap_or(false)
    }

    /// Bytes of instruction stream the pattern inspects.
    pub fn length(&self) -> usize {
        self.instruction_block().map(PatternBlock::length).unwrap_or(0)
    }

    pub fn bit(&self, context: bool, index: usize) -> Option<bool> {
        if context {
            self.context_block().and_then(|b| b.bit(index))
        } else {
            self.instruction_block().and_then(|b| b.bit(index))
        }
    }

    #[inline(always)]
    pub fn is_match<'b, 'c>(&'b self, walker: &ParserWalker<'b, 'c>) -> bool {
        match self {
            Self::Instruction(pat) => pat.is_match(walker),
            Self::Context(pat) => pat.is_match(walker),
            Self::Combine {
                context,
                instruction,
            } => instruction.is_match(walker) && context.is_match(walker),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn normalise_trims_unconstrained_bytes() {
        let block = PatternBlock::from_bytes(0, &[0x00, 0xf0, 0x00, 0x00, 0x00], &[0xff, 0x10, 0, 0, 0]);
        assert_eq!(block.offset(), 1);
        assert_eq!(block.length(), 2);
        assert_eq!(block.mask_byte(1), 0xf0);
        assert_eq!(block.value_byte(1), 0x10);
        assert_eq!(block.value_byte(0), 0);

        let empty = PatternBlock::from_bytes(3, &[0, 0], &[1, 2]);
        assert!(empty.always_true());
        assert_eq!(empty.length(), 0);
    }

    #[test]
    fn bits_are_msb_first() {
        let block = PatternBlock::from_bytes(0, &[0x80, 0x01], &[0x00, 0x01]);
        assert_eq!(block.bit(0), Some(false));
        assert_eq!(block.bit(1), None);
        assert_eq!(block.bit(15), Some(true));
        assert_eq!(block.bit(16), None);
    }

    #[test]
    fn intersections() {
        let a = PatternBlock::from_bytes(0, &[0xf0], &[0x10]);
        let b = PatternBlock::from_bytes(1, &[0xff], &[0x22]);
        let both = a.intersect(&b);
        assert_eq!(both.length(), 2);
        assert_eq!(both.mask_byte(0), 0xf0);
        assert_eq!(both.value_byte(1), 0x22);

        let c = PatternBlock::from_bytes(0, &[0x30], &[0x20]);
        assert!(a.intersect(&c).always_false());
        assert!(PatternBlock::new(true).intersect(&a) == a);
    }

    #[test]
    fn shifting() {
        let mut block = PatternBlock::from_bytes(0, &[0xff], &[0x01]);
        block.shift(2);
        assert_eq!(block.offset(), 2);
        assert_eq!(block.length(), 3);
    }

    #[test]
    fn disjoint_selection() {
        let insn = PatternBlock::from_bytes(0, &[0xff], &[0x01]);
        let ctx = PatternBlock::new(true);
        assert!(matches!(DisjointPattern::new(ctx, insn.clone()), DisjointPattern::Instruction(_)));

        let ctx = PatternBlock::from_bytes(0, &[0x80], &[0x80]);
        let both = DisjointPattern::new(ctx.clone(), insn);
        assert_eq!(both.bit(true, 0), Some(true));
        assert_eq!(both.bit(false, 7), Some(true));
        assert!(matches!(DisjointPattern::new(ctx, PatternBlock::new(true)), DisjointPattern::Context(_)));
    }

    #[test]
    fn expression_shape() {
        let field = PatternExpression::token_field(Endian::Big, 2, 0, 3, false);
        assert_eq!(field.max_value(), Some(15));
        assert!(field.is_static());

        let next = PatternExpression::EndInstruction + PatternExpression::constant(4);
        assert!(!next.is_static());

        let signed = PatternExpression::context_field(0, 7, true);
        assert_eq!(signed.min_value(), Some(-128));
        assert_eq!(signed.max_value(), Some(127));
    }
}
