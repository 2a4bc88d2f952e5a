//! The opcode vocabulary of the data-flow graph.
//!
//! Each opcode tag maps to a descriptor ([`Op::flags`]) describing identity-
//! independent properties: whether the node produces a value, whether it must
//! be generated regardless of uses, whether its operands live in the var-args
//! pool, and its side-effect class. Keeping the flags in a table rather than
//! packed into the tag keeps the tag usable as a plain CSE bucket key.

use std::fmt;

use bitflags::bitflags;

// ─── Op ─────────────────────────────────────────────────────────────────────

/// Opcode tags. The discriminant doubles as the CSE bucket key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Op {
    // ── Constants ───────────────────────────────────────────────────
    JsConstant,
    WeakJsConstant,

    // ── Locals ──────────────────────────────────────────────────────
    GetLocal,
    SetLocal,
    Phi,
    Flush,
    SetArgument,

    // ── Bitwise and conversions ─────────────────────────────────────
    BitAnd,
    BitOr,
    BitXor,
    BitLShift,
    BitRShift,
    BitURShift,
    ValueToInt32,
    UInt32ToNumber,

    // ── Arithmetic ──────────────────────────────────────────────────
    ValueAdd,
    ArithAdd,
    ArithSub,
    ArithMul,
    ArithDiv,
    ArithMod,
    ArithMin,
    ArithMax,
    ArithAbs,
    ArithSqrt,

    // ── Comparisons and logic ───────────────────────────────────────
    CompareLess,
    CompareLessEq,
    CompareGreater,
    CompareGreaterEq,
    CompareEq,
    CompareStrictEq,
    LogicalNot,
    InstanceOf,
    CheckHasInstance,

    // ── Property access ─────────────────────────────────────────────
    GetById,
    GetByIdFlush,
    PutById,
    PutByIdDirect,
    GetByVal,
    PutByVal,
    PutByValAlias,
    GetByOffset,
    PutByOffset,
    GetPropertyStorage,
    GetIndexedPropertyStorage,

    // ── Structure and function guards ───────────────────────────────
    CheckStructure,
    PutStructure,
    CheckFunction,

    // ── Globals, scope, resolves ────────────────────────────────────
    GetGlobalVar,
    PutGlobalVar,
    GetScopedVar,
    PutScopedVar,
    GetScopeChain,
    Resolve,
    ResolveBase,
    ResolveBaseStrictPut,
    ResolveGlobal,

    // ── Allocation ──────────────────────────────────────────────────
    CreateThis,
    NewObject,
    NewArray,
    NewArrayBuffer,
    NewRegexp,

    // ── Arrays and strings ──────────────────────────────────────────
    ArrayPush,
    ArrayPop,
    StringCharAt,
    StringCharCodeAt,
    StrCat,
    ToPrimitive,
    ConvertThis,
    GetCallee,

    // ── Length getters (inserted by fixup, never by construction) ───
    GetArrayLength,
    GetStringLength,
    GetByteArrayLength,
    GetInt8ArrayLength,
    GetInt16ArrayLength,
    GetInt32ArrayLength,
    GetUint8ArrayLength,
    GetUint8ClampedArrayLength,
    GetUint16ArrayLength,
    GetUint32ArrayLength,
    GetFloat32ArrayLength,
    GetFloat64ArrayLength,

    // ── Calls ───────────────────────────────────────────────────────
    Call,
    Construct,

    // ── Control flow ────────────────────────────────────────────────
    Jump,
    Branch,
    Return,
    Throw,
    ThrowReferenceError,
    Breakpoint,
    ForceOsrExit,
    InlineStart,

    // ── Placeholders ────────────────────────────────────────────────
    /// Kept alive for reference integrity; emits no code.
    Phantom,
    /// Fully dead; operands cleared.
    Nop,
}

/// Number of opcode tags, for `lastSeen`-style tables indexed by tag.
pub const OP_COUNT: usize = Op::Nop as usize + 1;

impl Op {
    /// The tag's index into per-opcode tables (the CSE bucket key).
    pub fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

// ─── Descriptor flags ───────────────────────────────────────────────────────

bitflags! {
    /// Per-opcode descriptor bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct OpFlags: u8 {
        /// The node produces a value that uses may consume.
        const HAS_RESULT = 1 << 0;
        /// The node must be generated even with no value uses. Such nodes are
        /// born with a synthetic self-reference.
        const MUST_GENERATE = 1 << 1;
        /// Operands live in the graph's var-args pool rather than the three
        /// fixed child slots.
        const HAS_VAR_ARGS = 1 << 2;
        /// Unconditionally invalidates heap-resident values seen by later
        /// loads.
        const CLOBBERS_WORLD = 1 << 3;
        /// Clobbers the world only for some operand predictions; the CSE
        /// clobber classifier decides per node.
        const MIGHT_CLOBBER = 1 << 4;
    }
}

impl Op {
    /// The descriptor for this tag.
    pub fn flags(self) -> OpFlags {
        use Op::*;
        const R: OpFlags = OpFlags::HAS_RESULT;
        const M: OpFlags = OpFlags::MUST_GENERATE;
        const V: OpFlags = OpFlags::HAS_VAR_ARGS;
        const W: OpFlags = OpFlags::CLOBBERS_WORLD;
        const C: OpFlags = OpFlags::MIGHT_CLOBBER;

        match self {
            JsConstant | WeakJsConstant | GetLocal => R,
            SetLocal | Flush | SetArgument => M,
            Phi => OpFlags::empty(),

            BitAnd | BitOr | BitXor | BitLShift | BitRShift | BitURShift | ValueToInt32
            | UInt32ToNumber => R,

            ValueAdd => R.union(M).union(C),
            ArithAdd | ArithSub | ArithMul | ArithDiv | ArithMod | ArithMin | ArithMax
            | ArithAbs | ArithSqrt => R,

            CompareLess | CompareLessEq | CompareGreater | CompareGreaterEq | CompareEq => {
                R.union(M).union(C)
            }
            CompareStrictEq => R,
            LogicalNot => R.union(C),
            InstanceOf => R.union(M),
            CheckHasInstance => M,

            GetById | GetByIdFlush => R.union(M).union(W),
            PutById | PutByIdDirect => M.union(W),
            GetByVal => R.union(M).union(C),
            PutByVal | PutByValAlias => M.union(W),
            GetByOffset => R,
            PutByOffset => M,
            GetPropertyStorage => R,
            GetIndexedPropertyStorage => R.union(M),

            CheckStructure | PutStructure | CheckFunction => M,

            GetGlobalVar => R.union(M),
            PutGlobalVar => M,
            GetScopedVar => R.union(M),
            PutScopedVar => M,
            GetScopeChain => R,
            Resolve | ResolveBase | ResolveBaseStrictPut | ResolveGlobal => R.union(M).union(W),

            CreateThis => R.union(M).union(W),
            NewObject | NewArrayBuffer | NewRegexp => R.union(M),
            NewArray => R.union(M).union(V),

            ArrayPush | ArrayPop => R.union(M).union(W),
            StringCharAt | StringCharCodeAt => R,
            StrCat => R.union(M).union(W).union(V),
            ToPrimitive => R.union(M).union(W),
            ConvertThis => R.union(M),
            GetCallee => R,

            GetArrayLength | GetStringLength | GetByteArrayLength | GetInt8ArrayLength
            | GetInt16ArrayLength | GetInt32ArrayLength | GetUint8ArrayLength
            | GetUint8ClampedArrayLength | GetUint16ArrayLength | GetUint32ArrayLength
            | GetFloat32ArrayLength | GetFloat64ArrayLength => R,

            Call | Construct => R.union(M).union(W).union(V),

            Jump | Branch | Return | Throw | ThrowReferenceError | Breakpoint | ForceOsrExit
            | InlineStart => M,

            Phantom => M,
            Nop => OpFlags::empty(),
        }
    }

    pub fn has_result(self) -> bool {
        self.flags().contains(OpFlags::HAS_RESULT)
    }

    pub fn must_generate(self) -> bool {
        self.flags().contains(OpFlags::MUST_GENERATE)
    }

    pub fn has_var_args(self) -> bool {
        self.flags().contains(OpFlags::HAS_VAR_ARGS)
    }
}

// ─── Arithmetic use flags ───────────────────────────────────────────────────

bitflags! {
    /// How a numeric node's result is consumed, joined monotonically over all
    /// consumers.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ArithFlags: u8 {
        /// Consumed as a full number; truncation to int32 would be observable.
        const USED_AS_NUMBER = 1 << 0;
        /// Negative zero must stay distinguishable from positive zero.
        const NEEDS_NEG_ZERO = 1 << 1;
        /// Profiling observed an overflow at this node's origin.
        const MAY_OVERFLOW = 1 << 2;
    }
}

impl ArithFlags {
    /// The bits that flow from consumers to producers during flag
    /// propagation. `MAY_OVERFLOW` is profile-seeded and stays node-local.
    pub const USED_AS_MASK: ArithFlags =
        ArithFlags::USED_AS_NUMBER.union(ArithFlags::NEEDS_NEG_ZERO);

    /// Truncating the result to int32 is unobservable.
    pub fn can_truncate_integer(self) -> bool {
        !self.contains(ArithFlags::USED_AS_NUMBER)
    }

    pub fn can_ignore_negative_zero(self) -> bool {
        !self.contains(ArithFlags::NEEDS_NEG_ZERO)
    }

    /// Whether an arithmetic node with these flags may speculate an int32
    /// result. Overflow evidence from the profiled code block forbids it.
    pub fn can_speculate_integer(self) -> bool {
        !self.contains(ArithFlags::MAY_OVERFLOW)
    }
}

impl fmt::Display for ArithFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return write!(f, "-");
        }
        let mut first = true;
        let mut emit = |f: &mut fmt::Formatter<'_>, name: &str| -> fmt::Result {
            if !first {
                write!(f, "|")?;
            }
            first = false;
            write!(f, "{name}")
        };
        if self.contains(ArithFlags::USED_AS_NUMBER) {
            emit(f, "UsedAsNumber")?;
        }
        if self.contains(ArithFlags::NEEDS_NEG_ZERO) {
            emit(f, "NeedsNegZero")?;
        }
        if self.contains(ArithFlags::MAY_OVERFLOW) {
            emit(f, "MayOverflow")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn descriptor_table_structural_properties() {
        assert_eq!(Op::JsConstant.index(), 0);
        assert_eq!(Op::Nop.index(), OP_COUNT - 1);

        assert!(Op::Call.has_var_args());
        assert!(Op::StrCat.has_var_args());
        assert!(Op::NewArray.has_var_args());
        assert!(!Op::ValueAdd.has_var_args());

        // Length getters are pure results; terminals generate despite having
        // no value uses; placeholders differ in exactly the self-reference.
        assert_eq!(Op::GetArrayLength.flags(), OpFlags::HAS_RESULT);
        assert_eq!(Op::GetFloat64ArrayLength.flags(), OpFlags::HAS_RESULT);
        assert_eq!(Op::Return.flags(), OpFlags::MUST_GENERATE);
        assert_eq!(Op::Phantom.flags(), OpFlags::MUST_GENERATE);
        assert_eq!(Op::Nop.flags(), OpFlags::empty());
    }

    #[test]
    fn conditionally_pure_ops_are_exactly_the_classifier_cases() {
        // Every MIGHT_CLOBBER op must be handled by the CSE clobber
        // classifier's switch; anything else would pessimize in release.
        let conditionals = [
            Op::ValueAdd,
            Op::CompareLess,
            Op::CompareLessEq,
            Op::CompareGreater,
            Op::CompareGreaterEq,
            Op::CompareEq,
            Op::LogicalNot,
            Op::GetByVal,
        ];
        for op in conditionals {
            assert!(op.flags().contains(OpFlags::MIGHT_CLOBBER), "{op}");
            assert!(!op.flags().contains(OpFlags::CLOBBERS_WORLD), "{op}");
        }
    }

    #[test]
    fn flag_propagation_mask_excludes_overflow_evidence() {
        let all = ArithFlags::all();
        assert!(ArithFlags::USED_AS_MASK.contains(ArithFlags::USED_AS_NUMBER));
        assert!(ArithFlags::USED_AS_MASK.contains(ArithFlags::NEEDS_NEG_ZERO));
        assert!(!ArithFlags::USED_AS_MASK.contains(ArithFlags::MAY_OVERFLOW));
        assert!(all.intersection(ArithFlags::USED_AS_MASK) != all);
    }
}
