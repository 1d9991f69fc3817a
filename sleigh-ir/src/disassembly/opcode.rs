use std::fmt;

/// The p-code operation set, numbered from `COPY = 1`.
///
/// `Build`, `DelaySlot`, `Label` and `CrossBuild` only appear in construct
/// templates; they are expanded away before any operation is emitted.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[derive(serde::Deserialize, serde::Serialize)]
#[repr(u8)]
pub enum Opcode {
    Copy = 1,
    Load,
    Store,
    Branch,
    CBranch,
    IBranch,
    Call,
    ICall,
    CallOther,
    Return,
    IntEq,
    IntNotEq,
    IntSLess,
    IntSLessEq,
    IntLess,
    IntLessEq,
    IntZExt,
    IntSExt,
    IntAdd,
    IntSub,
    IntCarry,
    IntSCarry,
    IntSBorrow,
    IntNeg,
    IntNot,
    IntXor,
    IntAnd,
    IntOr,
    IntLShift,
    IntRShift,
    IntSRShift,
    IntMul,
    IntDiv,
    IntSDiv,
    IntRem,
    IntSRem,
    BoolNot,
    BoolXor,
    BoolAnd,
    BoolOr,
    FloatEq,
    FloatNotEq,
    FloatLess,
    FloatLessEq,
    FloatIsNaN = 46,
    FloatAdd,
    FloatDiv,
    FloatMul,
    FloatSub,
    FloatNeg,
    FloatAbs,
    FloatSqrt,
    FloatOfInt,
    FloatOfFloat,
    FloatTruncate,
    FloatCeiling,
    FloatFloor,
    FloatRound,
    MultiEq,
    Indirect,
    Concat,
    Subpiece,
    Cast,
    PtrAdd,
    PtrSub,
    SegmentOp,
    CPoolRef,
    New,
    Insert,
    Extract,
    PopCount,

    Build = 100,
    DelaySlot,
    Label,
    CrossBuild,
}

impl Opcode {
    pub fn is_directive(&self) -> bool {
        matches!(self, Self::Build | Self::DelaySlot | Self::Label | Self::CrossBuild)
    }

    pub fn is_branch(&self) -> bool {
        matches!(
            self,
            Self::Branch | Self::CBranch | Self::IBranch | Self::Call | Self::ICall | Self::Return
        )
    }

    pub fn number(&self) -> u8 {
        *self as u8
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Copy => "COPY",
            Self::Load => "LOAD",
            Self::Store => "STORE",
            Self::Branch => "BRANCH",
            Self::CBranch => "CBRANCH",
            Self::IBranch => "BRANCHIND",
            Self::Call => "CALL",
            Self::ICall => "CALLIND",
            Self::CallOther => "CALLOTHER",
            Self::Return => "RETURN",
            Self::IntEq => "INT_EQUAL",
            Self::IntNotEq => "INT_NOTEQUAL",
            Self::IntSLess => "INT_SLESS",
            Self::IntSLessEq => "INT_SLESSEQUAL",
            Self::IntLess => "INT_LESS",
            Self::IntLessEq => "INT_LESSEQUAL",
            Self::IntZExt => "INT_ZEXT",
            Self::IntSExt => "INT_SEXT",
            Self::IntAdd => "INT_ADD",
            Self::IntSub => "INT_SUB",
            Self::IntCarry => "INT_CARRY",
            Self::IntSCarry => "INT_SCARRY",
            Self::IntSBorrow => "INT_SBORROW",
            Self::IntNeg => "INT_2COMP",
            Self::IntNot => "INT_NEGATE",
            Self::IntXor => "INT_XOR",
            Self::IntAnd => "INT_AND",
            Self::IntOr => "INT_OR",
            Self::IntLShift => "INT_LEFT",
            Self::IntRShift => "INT_RIGHT",
            Self::IntSRShift => "INT_SRIGHT",
            Self::IntMul => "INT_MULT",
            Self::IntDiv => "INT_DIV",
            Self::IntSDiv => "INT_SDIV",
            Self::IntRem => "INT_REM",
            Self::IntSRem => "INT_SREM",
            Self::BoolNot => "BOOL_NEGATE",
            Self::BoolXor => "BOOL_XOR",
            Self::BoolAnd => "BOOL_AND",
            Self::BoolOr => "BOOL_OR",
            Self::FloatEq => "FLOAT_EQUAL",
            Self::FloatNotEq => "FLOAT_NOTEQUAL",
            Self::FloatLess => "FLOAT_LESS",
            Self::FloatLessEq => "FLOAT_LESSEQUAL",
            Self::FloatIsNaN => "FLOAT_NAN",
            Self::FloatAdd => "FLOAT_ADD",
            Self::FloatDiv => "FLOAT_DIV",
            Self::FloatMul => "FLOAT_MULT",
            Self::FloatSub => "FLOAT_SUB",
            Self::FloatNeg => "FLOAT_NEG",
            Self::FloatAbs => "FLOAT_ABS",
            Self::FloatSqrt => "FLOAT_SQRT",
            Self::FloatOfInt => "INT2FLOAT",
            Self::FloatOfFloat => "FLOAT2FLOAT",
            Self::FloatTruncate => "TRUNC",
            Self::FloatCeiling => "CEIL",
            Self::FloatFloor => "FLOOR",
            Self::FloatRound => "ROUND",
            Self::MultiEq => "MULTIEQUAL",
            Self::Indirect => "INDIRECT",
            Self::Concat => "PIECE",
            Self::Subpiece => "SUBPIECE",
            Self::Cast => "CAST",
            Self::PtrAdd => "PTRADD",
            Self::PtrSub => "PTRSUB",
            Self::SegmentOp => "SEGMENTOP",
            Self::CPoolRef => "CPOOLREF",
            Self::New => "NEW",
            Self::Insert => "INSERT",
            Self::Extract => "EXTRACT",
            Self::PopCount => "POPCOUNT",
            Self::Build => "BUILD",
            Self::DelaySlot => "DELAY_SLOT",
            Self::Label => "LABEL",
            Self::CrossBuild => "CROSSBUILD",
        }
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.name())
    }
}
