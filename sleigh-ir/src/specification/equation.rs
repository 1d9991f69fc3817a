use crate::bits;
use crate::disassembly::pattern::{DisjointPattern, PatternBlock, PatternExpression};
use crate::specification::SpecificationError;

use sleigh_bytes::Endian;

/// Relational constraints enumerate the field's domain; wider fields may
/// only be constrained by equality.
pub const MAX_ENUMERATED_BITS: usize = 16;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
#[derive(serde::Deserialize, serde::Serialize)]
pub enum ConstraintOp {
    Equal,
    NotEqual,
    Less,
    LessEqual,
    Greater,
    GreaterEqual,
}

impl ConstraintOp {
    fn holds(&self, lhs: i64, rhs: i64) -> bool {
        match self {
            Self::Equal => lhs == rhs,
            Self::NotEqual => lhs != rhs,
            Self::Less => lhs < rhs,
            Self::LessEqual => lhs <= rhs,
            Self::Greater => lhs > rhs,
            Self::GreaterEqual => lhs >= rhs,
        }
    }
}

/// A constraint over token and context fields describing which byte
/// sequences a constructor accepts.
///
/// `And` (`&`) requires both sides at the same position, `Or` (`|`) either,
/// and `Cat` (`;`) places the right side after the tokens of the left.
#[derive(Debug, Clone, PartialEq, Eq)]
#[derive(serde::Deserialize, serde::Serialize)]
pub enum PatternEquation {
    Constraint {
        field: String,
        op: ConstraintOp,
        value: i64,
    },
    /// Mentions a field or operand without constraining it, fixing its
    /// position in the instruction.
    Bind(String),
    And(Box<Self>, Box<Self>),
    Or(Box<Self>, Box<Self>),
    Cat(Box<Self>, Box<Self>),
    LeftEllipsis(Box<Self>),
    RightEllipsis(Box<Self>),
}

impl PatternEquation {
    fn constraint(field: impl Into<String>, op: ConstraintOp, value: i64) -> Self {
        Self::Constraint {
            field: field.into(),
            op,
            value,
        }
    }

    pub fn equal(field: impl Into<String>, value: i64) -> Self {
        Self::constraint(field, ConstraintOp::Equal, value)
    }

    pub fn not_equal(field: impl Into<String>, value: i64) -> Self {
        Self::constraint(field, ConstraintOp::NotEqual, value)
    }

    pub fn less(field: impl Into<String>, value: i64) -> Self {
        Self::constraint(field, ConstraintOp::Less, value)
    }

    pub fn less_equal(field: impl Into<String>, value: i64) -> Self {
        Self::constraint(field, ConstraintOp::LessEqual, value)
    }

    pub fn greater(field: impl Into<String>, value: i64) -> Self {
        Self::constraint(field, ConstraintOp::Greater, value)
    }

    pub fn greater_equal(field: impl Into<String>, value: i64) -> Self {
        Self::constraint(field, ConstraintOp::GreaterEqual, value)
    }

    pub fn bind(name: impl Into<String>) -> Self {
        Self::Bind(name.into())
    }

    pub fn cat(self, rhs: Self) -> Self {
        Self::Cat(Box::new(self), Box::new(rhs))
    }

    /// `... self`: aligns this side to the end of a longer partner.
    pub fn ellipsis_left(self) -> Self {
        Self::LeftEllipsis(Box::new(self))
    }

    /// `self ...`
    pub fn ellipsis_right(self) -> Self {
        Self::RightEllipsis(Box::new(self))
    }
}

impl std::ops::BitAnd for PatternEquation {
    type Output = Self;

    fn bitand(self, rhs: Self) -> Self {
        Self::And(Box::new(self), Box::new(rhs))
    }
}

impl std::ops::BitOr for PatternEquation {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self::Or(Box::new(self), Box::new(rhs))
    }
}

/// Bytes an operand spans, as far as is known before decoding.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum Extent {
    Fixed(usize),
    Variable,
}

/// Name lookup for equation compilation.
pub(crate) trait Resolver {
    /// The field expression bound to `name`, if it names a token or
    /// context field.
    fn field(&self, name: &str) -> Option<&PatternExpression>;

    /// The operand index and extent bound to `name`, if it names an
    /// operand of the constructor being compiled.
    fn operand(&self, name: &str) -> Option<(usize, Extent)>;
}

/// Where an operand starts: `offset` bytes after the constructor start,
/// or after the end of operand `base`.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) struct Placement {
    pub operand: usize,
    pub base: Option<usize>,
    pub offset: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Compiled {
    pub patterns: Vec<DisjointPattern>,
    pub length: usize,
    pub placements: Vec<Placement>,
}

#[derive(Debug, Clone)]
struct Alternative {
    context: PatternBlock,
    instruction: PatternBlock,
}

impl Alternative {
    fn always() -> Self {
        Self {
            context: PatternBlock::new(true),
            instruction: PatternBlock::new(true),
        }
    }

    fn intersect(&self, other: &Self) -> Option<Self> {
        let context = self.context.intersect(&other.context);
        let instruction = self.instruction.intersect(&other.instruction);

        if context.always_false() || instruction.always_false() {
            None
        } else {
            Some(Self { context, instruction })
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
struct Position {
    base: Option<usize>,
    offset: usize,
}

impl Position {
    fn fixed(offset: usize) -> Self {
        Self { base: None, offset }
    }
}

#[derive(Debug, Clone)]
struct Fragment {
    alternatives: Vec<Alternative>,
    length: usize,
    end: Position,
    left_ellipsis: bool,
    placements: Vec<Placement>,
}

impl Fragment {
    fn empty() -> Self {
        Self {
            alternatives: vec![Alternative::always()],
            length: 0,
            end: Position::fixed(0),
            left_ellipsis: false,
            placements: Vec::new(),
        }
    }

    fn is_fixed(&self) -> bool {
        self.end.base.is_none()
    }

    fn place(&mut self, operand: usize) {
        if self.placements.iter().all(|p| p.operand != operand) {
            self.placements.push(Placement {
                operand,
                base: None,
                offset: 0,
            });
        }
    }

    fn merge_placements(&mut self, other: Vec<Placement>) {
        for placement in other {
            if self.placements.iter().all(|p| p.operand != placement.operand) {
                self.placements.push(placement);
            }
        }
    }

    /// Moves the fragment so that it starts at `at`.
    fn shift(mut self, at: Position, context: &str) -> Result<Self, SpecificationError> {
        match at.base {
            None => {
                for alt in self.alternatives.iter_mut() {
                    alt.instruction.shift(at.offset as isize);
                }
                for placement in self.placements.iter_mut().filter(|p| p.base.is_none()) {
                    placement.offset += at.offset;
                }
                if self.end.base.is_none() {
                    self.end.offset += at.offset;
                }
                self.length += at.offset;
            }
            Some(base) => {
                if self.alternatives.iter().any(|alt| !alt.instruction.always_true()) {
                    return Err(SpecificationError::pattern(
                        context,
                        "instruction constraint follows a variable-length operand",
                    ))
                }
                for placement in self.placements.iter_mut().filter(|p| p.base.is_none()) {
                    placement.base = Some(base);
                    placement.offset += at.offset;
                }
                if self.end.base.is_none() {
                    self.end = Position {
                        base: Some(base),
                        offset: at.offset + self.end.offset,
                    };
                }
                self.length = 0;
            }
        }
        Ok(self)
    }

    fn cross(lhs: &[Alternative], rhs: &[Alternative]) -> Vec<Alternative> {
        lhs.iter()
            .flat_map(|l| rhs.iter().filter_map(move |r| l.intersect(r)))
            .collect()
    }
}

fn token_block(endian: Endian, size: usize, low: usize, high: usize, raw: u64) -> PatternBlock {
    let mut masks = vec![0u8; size];
    let mut values = vec![0u8; size];

    for bit in low..=high {
        let byte = if endian.is_big() { size - 1 - bit / 8 } else { bit / 8 };
        let flag = 1u8 << (bit % 8);
        masks[byte] |= flag;
        if (raw >> (bit - low)) & 1 == 1 {
            values[byte] |= flag;
        }
    }

    PatternBlock::from_bytes(0, &masks, &values)
}

fn context_block(low: usize, high: usize, raw: u64) -> PatternBlock {
    let size = high / 8 + 1;
    let mut masks = vec![0u8; size];
    let mut values = vec![0u8; size];

    for bit in low..=high {
        let flag = 0x80u8 >> (bit % 8);
        masks[bit / 8] |= flag;
        if (raw >> (high - bit)) & 1 == 1 {
            values[bit / 8] |= flag;
        }
    }

    PatternBlock::from_bytes(0, &masks, &values)
}

/// Values of a `width`-bit field satisfying `op value`.
fn satisfying(
    width: usize,
    signed: bool,
    op: ConstraintOp,
    value: i64,
    name: &str,
    context: &str,
) -> Result<Vec<u64>, SpecificationError> {
    let mask = u64::MAX >> (64 - width.min(64));

    let (min, max) = if signed {
        (bits::shl(-1, width as u32 - 1), bits::zero_extend(!0, width - 1) >> 1)
    } else {
        (0, bits::zero_extend(!0, width - 1))
    };

    // equality compares the raw encoding; `simm8 == 0x80` and
    // `simm8 == -0x80` select the same bits
    if op == ConstraintOp::Equal {
        return Ok(vec![value as u64 & mask])
    }

    if width > MAX_ENUMERATED_BITS {
        return Err(SpecificationError::pattern(
            context,
            format!(
                "relational constraint on {} needs more than {} bits",
                name, MAX_ENUMERATED_BITS
            ),
        ))
    }

    Ok((min..=max)
        .filter(|v| op.holds(*v, value))
        .map(|v| v as u64 & mask)
        .collect())
}

fn constraint(
    expr: &PatternExpression,
    name: &str,
    op: ConstraintOp,
    value: i64,
    context: &str,
) -> Result<Fragment, SpecificationError> {
    match expr {
        PatternExpression::TokenField {
            endian,
            sign_bit,
            bit_start,
            bit_end,
            byte_end,
            ..
        } => {
            let size = byte_end + 1;
            let width = bit_end - bit_start + 1;
            let alternatives = satisfying(width, *sign_bit, op, value, name, context)?
                .into_iter()
                .map(|raw| Alternative {
                    context: PatternBlock::new(true),
                    instruction: token_block(*endian, size, *bit_start, *bit_end, raw),
                })
                .collect();

            Ok(Fragment {
                alternatives,
                length: size,
                end: Position::fixed(size),
                ..Fragment::empty()
            })
        }
        PatternExpression::ContextField {
            sign_bit,
            bit_start,
            bit_end,
        } => {
            let width = bit_end - bit_start + 1;
            let alternatives = satisfying(width, *sign_bit, op, value, name, context)?
                .into_iter()
                .map(|raw| Alternative {
                    context: context_block(*bit_start, *bit_end, raw),
                    instruction: PatternBlock::new(true),
                })
                .collect();

            Ok(Fragment {
                alternatives,
                ..Fragment::empty()
            })
        }
        _ => Err(SpecificationError::pattern(
            context,
            format!("`{}` is not a field", name),
        )),
    }
}

fn field_length(expr: &PatternExpression) -> usize {
    match expr {
        PatternExpression::TokenField { byte_end, .. } => byte_end + 1,
        _ => 0,
    }
}

impl PatternEquation {
    fn fragment(&self, resolver: &dyn Resolver, context: &str) -> Result<Fragment, SpecificationError> {
        match self {
            Self::Constraint { field, op, value } => {
                let expr = resolver
                    .field(field)
                    .ok_or_else(|| SpecificationError::unresolved(field.as_str(), context))?;
                let mut fragment = constraint(expr, field, *op, *value, context)?;
                if let Some((index, _)) = resolver.operand(field) {
                    fragment.place(index);
                }
                Ok(fragment)
            }
            Self::Bind(name) => {
                if let Some((index, extent)) = resolver.operand(name) {
                    let mut fragment = match extent {
                        Extent::Fixed(length) => Fragment {
                            length,
                            end: Position::fixed(length),
                            ..Fragment::empty()
                        },
                        Extent::Variable => Fragment {
                            end: Position {
                                base: Some(index),
                                offset: 0,
                            },
                            ..Fragment::empty()
                        },
                    };
                    fragment.place(index);
                    Ok(fragment)
                } else if let Some(expr) = resolver.field(name) {
                    let length = field_length(expr);
                    Ok(Fragment {
                        length,
                        end: Position::fixed(length),
                        ..Fragment::empty()
                    })
                } else {
                    Err(SpecificationError::unresolved(name.as_str(), context))
                }
            }
            Self::And(lhs, rhs) => {
                let mut lhs = lhs.fragment(resolver, context)?;
                let mut rhs = rhs.fragment(resolver, context)?;

                let end = match (lhs.is_fixed(), rhs.is_fixed()) {
                    (true, true) => {
                        let (ll, rl) = (lhs.end.offset, rhs.end.offset);
                        if ll < rl && lhs.left_ellipsis {
                            lhs = lhs.shift(Position::fixed(rl - ll), context)?;
                        } else if rl < ll && rhs.left_ellipsis {
                            rhs = rhs.shift(Position::fixed(ll - rl), context)?;
                        }
                        Position::fixed(ll.max(rl))
                    }
                    (false, true) => lhs.end,
                    (true, false) => rhs.end,
                    (false, false) => {
                        return Err(SpecificationError::pattern(
                            context,
                            "both sides of `&` have variable length",
                        ))
                    }
                };

                let mut fragment = Fragment {
                    alternatives: Fragment::cross(&lhs.alternatives, &rhs.alternatives),
                    length: lhs.length.max(rhs.length),
                    end,
                    left_ellipsis: lhs.left_ellipsis && rhs.left_ellipsis,
                    placements: lhs.placements,
                };
                fragment.merge_placements(rhs.placements);
                Ok(fragment)
            }
            Self::Or(lhs, rhs) => {
                let mut lhs = lhs.fragment(resolver, context)?;
                let rhs = rhs.fragment(resolver, context)?;

                if lhs.end != rhs.end {
                    return Err(SpecificationError::pattern(
                        context,
                        "alternatives of `|` end at different positions",
                    ))
                }

                lhs.alternatives.extend(rhs.alternatives);
                lhs.length = lhs.length.min(rhs.length);
                lhs.left_ellipsis |= rhs.left_ellipsis;
                lhs.merge_placements(rhs.placements);
                Ok(lhs)
            }
            Self::Cat(lhs, rhs) => {
                let lhs = lhs.fragment(resolver, context)?;
                let rhs = rhs.fragment(resolver, context)?.shift(lhs.end, context)?;

                let length = if lhs.is_fixed() { rhs.length } else { lhs.length };
                let mut fragment = Fragment {
                    alternatives: Fragment::cross(&lhs.alternatives, &rhs.alternatives),
                    length,
                    end: rhs.end,
                    left_ellipsis: lhs.left_ellipsis,
                    placements: lhs.placements,
                };
                fragment.merge_placements(rhs.placements);
                Ok(fragment)
            }
            Self::LeftEllipsis(inner) => {
                let mut fragment = inner.fragment(resolver, context)?;
                fragment.left_ellipsis = true;
                Ok(fragment)
            }
            Self::RightEllipsis(inner) => inner.fragment(resolver, context),
        }
    }

    /// Compiles to the disjoint mask/value patterns the equation accepts,
    /// along with the fixed length it implies and the operand positions it
    /// fixes.
    pub(crate) fn compile(&self, resolver: &dyn Resolver, context: &str) -> Result<Compiled, SpecificationError> {
        let fragment = self.fragment(resolver, context)?;

        if fragment.alternatives.is_empty() {
            log::warn!("pattern of {} can never match", context);
        }

        Ok(Compiled {
            patterns: fragment
                .alternatives
                .into_iter()
                .map(|alt| DisjointPattern::new(alt.context, alt.instruction))
                .collect(),
            length: fragment.length,
            placements: fragment.placements,
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    struct Fields {
        op: PatternExpression,
        rd: PatternExpression,
        imm: PatternExpression,
        disp: PatternExpression,
        mode: PatternExpression,
    }

    impl Fields {
        fn new() -> Self {
            Self {
                op: PatternExpression::token_field(Endian::Big, 1, 4, 7, false),
                rd: PatternExpression::token_field(Endian::Big, 1, 0, 3, false),
                imm: PatternExpression::token_field(Endian::Little, 2, 0, 15, true),
                disp: PatternExpression::token_field(Endian::Little, 4, 0, 31, false),
                mode: PatternExpression::context_field(0, 1, false),
            }
        }
    }

    impl Resolver for Fields {
        fn field(&self, name: &str) -> Option<&PatternExpression> {
            match name {
                "op" => Some(&self.op),
                "rd" => Some(&self.rd),
                "imm" => Some(&self.imm),
                "disp" => Some(&self.disp),
                "mode" => Some(&self.mode),
                _ => None,
            }
        }

        fn operand(&self, name: &str) -> Option<(usize, Extent)> {
            match name {
                "rd" => Some((0, Extent::Fixed(1))),
                "imm" => Some((1, Extent::Fixed(2))),
                "sub" => Some((2, Extent::Variable)),
                _ => None,
            }
        }
    }

    fn block(pattern: &DisjointPattern) -> &PatternBlock {
        pattern.instruction_block().unwrap()
    }

    #[test]
    fn token_constraints() -> Result<(), SpecificationError> {
        let fields = Fields::new();
        let eq = PatternEquation::equal("op", 1) & PatternEquation::bind("rd");
        let compiled = eq.compile(&fields, "test")?;

        assert_eq!(compiled.patterns.len(), 1);
        assert_eq!(compiled.length, 1);
        assert_eq!(block(&compiled.patterns[0]).mask_byte(0), 0xf0);
        assert_eq!(block(&compiled.patterns[0]).value_byte(0), 0x10);
        assert_eq!(compiled.placements, vec![Placement { operand: 0, base: None, offset: 0 }]);
        Ok(())
    }

    #[test]
    fn equality_masks_to_the_field() -> Result<(), SpecificationError> {
        let fields = Fields::new();

        let raw = PatternEquation::equal("imm", 0x8000).compile(&fields, "test")?;
        let signed = PatternEquation::equal("imm", -0x8000).compile(&fields, "test")?;
        assert_eq!(block(&raw.patterns[0]).value_byte(1), 0x80);
        assert_eq!(raw.patterns, signed.patterns);

        let wide = PatternEquation::equal("op", 0x13).compile(&fields, "test")?;
        assert_eq!(block(&wide.patterns[0]).mask_byte(0), 0xf0);
        assert_eq!(block(&wide.patterns[0]).value_byte(0), 0x30);
        Ok(())
    }

    #[test]
    fn concatenation_offsets() -> Result<(), SpecificationError> {
        let fields = Fields::new();
        let eq = PatternEquation::equal("op", 2).cat(PatternEquation::equal("imm", -1));
        let compiled = eq.compile(&fields, "test")?;

        let pattern = block(&compiled.patterns[0]);
        assert_eq!(compiled.length, 3);
        assert_eq!(pattern.value_byte(0), 0x20);
        assert_eq!(pattern.value_byte(1), 0xff);
        assert_eq!(pattern.value_byte(2), 0xff);
        assert_eq!(compiled.placements, vec![Placement { operand: 1, base: None, offset: 1 }]);
        Ok(())
    }

    #[test]
    fn operands_after_subtables() -> Result<(), SpecificationError> {
        let fields = Fields::new();
        let eq = PatternEquation::bind("sub").cat(PatternEquation::bind("imm"));
        let compiled = eq.compile(&fields, "test")?;
        assert_eq!(
            compiled.placements,
            vec![
                Placement { operand: 2, base: None, offset: 0 },
                Placement { operand: 1, base: Some(2), offset: 0 },
            ]
        );

        let bad = PatternEquation::bind("sub").cat(PatternEquation::equal("op", 1));
        assert!(matches!(bad.compile(&fields, "test"), Err(SpecificationError::IllFormedPattern { .. })));
        Ok(())
    }

    #[test]
    fn relational_and_context() -> Result<(), SpecificationError> {
        let fields = Fields::new();
        let compiled = PatternEquation::less("op", 3).compile(&fields, "test")?;
        assert_eq!(compiled.patterns.len(), 3);

        let compiled = (PatternEquation::equal("mode", 2) & PatternEquation::not_equal("rd", 0)).compile(&fields, "test")?;
        assert_eq!(compiled.patterns.len(), 15);
        assert_eq!(compiled.patterns[0].bit(true, 0), Some(true));
        assert_eq!(compiled.patterns[0].bit(true, 1), Some(false));

        let wide = PatternEquation::greater("disp", 0).compile(&fields, "test");
        assert!(matches!(wide, Err(SpecificationError::IllFormedPattern { .. })));
        Ok(())
    }

    #[test]
    fn alternatives_and_ellipsis() -> Result<(), SpecificationError> {
        let fields = Fields::new();
        let either = PatternEquation::equal("op", 1) | PatternEquation::equal("op", 2);
        assert_eq!(either.compile(&fields, "test")?.patterns.len(), 2);

        let aligned = PatternEquation::equal("op", 1).ellipsis_left() & PatternEquation::bind("imm");
        let compiled = aligned.compile(&fields, "test")?;
        assert_eq!(block(&compiled.patterns[0]).offset(), 1);
        assert_eq!(compiled.length, 2);

        let conflict = PatternEquation::equal("op", 1) & PatternEquation::equal("op", 2);
        assert!(conflict.compile(&fields, "test")?.patterns.is_empty());

        let missing = PatternEquation::equal("nope", 1).compile(&fields, "test");
        assert!(matches!(missing, Err(SpecificationError::UnresolvedReference { .. })));
        Ok(())
    }
}
