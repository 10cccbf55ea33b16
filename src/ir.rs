//! Internal instruction set executed by the interpreter
//!
//! The transform lowers the stack-based source encoding into this dense,
//! position-addressable form. One instruction is a fixed-layout record:
//! an opcode tag plus three 32-bit fields and one 64-bit immediate. The
//! meaning of the fields is per-opcode, with crate-wide conventions:
//!
//! - `dst` — destination slot index into the frame's 8-byte slot array
//! - `a`   — first source slot, or a branch target (instruction index),
//!   or a resolve-table index, as the opcode dictates
//! - `b`   — second source slot or auxiliary payload (field offset,
//!   clause index)
//! - `imm` — immediate constant or packed auxiliary payload
//!
//! IR offsets are instruction indices, not byte offsets; branch targets
//! index directly into `MethodIr::code`.

use std::sync::Arc;

use crate::abi::AbiClass;
use crate::bridge::{AbiArg, ResolvedCall};
use crate::metadata::{ClauseKind, FieldToken, MethodToken, TypeToken};

/// Internal opcode tag. Operand meaning is described per group; see the
/// module header for the field conventions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IrOp {
    // === Constants: dst <- imm ===
    /// imm holds a sign-extended 32-bit constant.
    LdcI4,
    LdcI8,
    /// imm holds the raw f32 bit pattern in the low 32 bits.
    LdcR4,
    /// imm holds the raw f64 bit pattern.
    LdcR8,
    /// dst <- 0 (null reference).
    LdNull,
    /// dst <- interned string handle; a = resolve index.
    LdStr,

    // === Slot moves ===
    /// dst <- a (one 8-byte slot).
    Mov,
    /// Copy imm bytes from slot run a to slot run dst.
    MovBlk,
    /// dst <- address of slot a (for ldloca/ldarga and aggregate bases).
    SlotAddr,

    // === Arithmetic: dst <- a op b ===
    AddI4,
    AddI8,
    AddR4,
    AddR8,
    SubI4,
    SubI8,
    SubR4,
    SubR8,
    MulI4,
    MulI8,
    MulR4,
    MulR8,
    DivI4,
    DivI8,
    DivR4,
    DivR8,
    DivUnI4,
    DivUnI8,
    RemI4,
    RemI8,
    RemR4,
    RemR8,
    RemUnI4,
    RemUnI8,
    AndI4,
    AndI8,
    OrI4,
    OrI8,
    XorI4,
    XorI8,
    ShlI4,
    ShlI8,
    ShrI4,
    ShrI8,
    ShrUnI4,
    ShrUnI8,
    NegI4,
    NegI8,
    NegR4,
    NegR8,
    NotI4,
    NotI8,

    // === Overflow-checked arithmetic: dst <- a op b, fault on overflow ===
    AddOvfI4,
    AddOvfI8,
    AddOvfUnI4,
    AddOvfUnI8,
    SubOvfI4,
    SubOvfI8,
    SubOvfUnI4,
    SubOvfUnI8,
    MulOvfI4,
    MulOvfI8,
    MulOvfUnI4,
    MulOvfUnI8,

    // === Comparisons: dst <- (a cmp b) as i4 ===
    CeqI4,
    CeqI8,
    CeqR4,
    CeqR8,
    CgtI4,
    CgtI8,
    CgtR4,
    CgtR8,
    CgtUnI4,
    CgtUnI8,
    /// Unordered-or-greater for floats.
    CgtUnR4,
    CgtUnR8,
    CltI4,
    CltI8,
    CltR4,
    CltR8,
    CltUnI4,
    CltUnI8,
    CltUnR4,
    CltUnR8,

    // === Branches: a = target instruction index ===
    Br,
    /// b = condition slot, read as i4.
    BrTrueI4,
    BrFalseI4,
    /// b = condition slot, read as i8 (references included).
    BrTrueI8,
    BrFalseI8,
    /// a = resolve index of the jump table, b = selector slot (i4).
    Switch,

    // === Conversions: dst <- conv(a) ===
    /// Sign-extend the low 8 bits within an i4 slot.
    SxI1,
    SxI2,
    /// i4 -> i8 sign extension.
    SxI4,
    ZxU1,
    ZxU2,
    /// i4 -> i8 zero extension.
    ZxU4,
    /// i8 -> i4 truncation.
    TruncI8,
    I4ToR4,
    I4ToR8,
    I8ToR4,
    I8ToR8,
    R4ToI4,
    R4ToI8,
    R8ToI4,
    R8ToI8,
    R4ToR8,
    R8ToR4,
    /// Overflow-checked narrowing from an i4 source; imm = pack2(target
    /// byte width, target-is-signed flag).
    ConvOvfI4,
    /// Same, from an i8 source.
    ConvOvfI8,
    /// Same, from an r8 source (r4 sources are widened first).
    ConvOvfR8,

    // === Indirect loads: dst <- *(a), faulting on null ===
    LdIndI1,
    LdIndU1,
    LdIndI2,
    LdIndU2,
    LdIndI4,
    LdIndU4,
    LdIndI8,
    LdIndR4,
    LdIndR8,
    // === Indirect stores: *(a) <- b ===
    StIndI1,
    StIndI2,
    StIndI4,
    StIndI8,
    StIndR4,
    StIndR8,
    /// dst <- imm bytes loaded from address a.
    LdBlk,
    /// imm bytes from slot run b stored to address a.
    StBlk,
    /// Zero imm bytes at address a.
    InitBlk,

    // === Instance fields: a = object slot, b = field byte offset ===
    LdFldI1,
    LdFldU1,
    LdFldI2,
    LdFldU2,
    LdFldI4,
    LdFldI8,
    LdFldR4,
    LdFldR8,
    /// imm = field byte size.
    LdFldBlk,
    /// b = value slot, imm = field byte offset.
    StFldI1,
    StFldI2,
    StFldI4,
    StFldI8,
    StFldR4,
    StFldR8,
    /// b = value slot run, imm = pack2(field offset, field size).
    StFldBlk,
    /// dst <- &obj.field; a = object slot, b = field byte offset.
    LdFldAddr,

    // === Thread statics ===
    /// dst <- address of this thread's storage; a = resolve index of the
    /// field token, imm = byte size.
    TlsAddr,

    // === Object model ===
    /// Allocate and construct: the engine allocates the instance, shifts
    /// the constructor arguments up one slot to make room for `this`, and
    /// runs the constructor. a = resolve index of the constructor call,
    /// b = argument base slot, dst = result slot, imm = instance size.
    NewObj,
    /// dst <- new array; a = resolve index of the element type,
    /// b = length slot, imm = element size.
    NewArr,
    /// dst <- length of array in a.
    LdLen,
    // Element loads: a = array slot, b = index slot.
    LdElemI1,
    LdElemU1,
    LdElemI2,
    LdElemU2,
    LdElemI4,
    LdElemU4,
    LdElemI8,
    LdElemR4,
    LdElemR8,
    /// imm = element byte size.
    LdElemBlk,
    // Element stores: a = array, b = index, dst = value slot.
    StElemI1,
    StElemI2,
    StElemI4,
    StElemI8,
    StElemR4,
    StElemR8,
    StElemBlk,
    /// dst <- checked cast of a; b = resolve index of the target type.
    CastClass,
    /// dst <- a if instance-of, else null; b = resolve index.
    IsInst,

    // === Calls ===
    /// Call an interpreted callee; a = resolve index of the call shape,
    /// b = first-argument slot, dst = return slot (unused for void).
    CallIr,
    /// Same, with a null check on the first argument slot.
    CallIrVirt,
    /// Call through a native trampoline; fields as for `CallIr`.
    CallNative,
    CallNativeVirt,
    /// Delegate invoke through a trampoline.
    CallDelegate,
    /// Return a value; a = source slot run, imm = byte size.
    Ret,
    RetVoid,

    // === Exception flow ===
    /// a = exception object slot.
    Throw,
    Rethrow,
    /// Direct leave; a = target instruction index.
    Leave,
    /// Leave running the finally chain; a = target index, b = index of
    /// the first finally clause to run.
    LeaveChain,
    EndFinally,
    /// a = filter result slot (i4).
    EndFilter,

    // === Intrinsics ===
    /// dst <- previous value; a = address slot, b = new-value slot.
    AtomicXchg4,
    AtomicXchg8,
    /// dst <- previous value; a = address slot, b = new-value slot,
    /// imm = comparand slot index.
    AtomicCmpXchg4,
    AtomicCmpXchg8,
    /// Pack consecutive float slots into one aggregate; dst = destination
    /// slot run, b = first element slot, imm = pack2(count, width). The
    /// source and destination runs may overlap.
    VecPack,
    /// dst <- hasValue byte of the nullable at address a.
    NullableHasValue,
    /// dst <- value of the nullable at address a; imm = pack2(value
    /// offset, value size); faults when hasValue is clear.
    NullableValue,
}

impl IrOp {
    /// Mnemonic for disassembly and trace output.
    pub fn mnemonic(self) -> &'static str {
        match self {
            Self::LdcI4 => "ldc.i4",
            Self::LdcI8 => "ldc.i8",
            Self::LdcR4 => "ldc.r4",
            Self::LdcR8 => "ldc.r8",
            Self::LdNull => "ldnull",
            Self::LdStr => "ldstr",
            Self::Mov => "mov",
            Self::MovBlk => "mov.blk",
            Self::SlotAddr => "slotaddr",
            Self::AddI4 => "add.i4",
            Self::AddI8 => "add.i8",
            Self::AddR4 => "add.r4",
            Self::AddR8 => "add.r8",
            Self::SubI4 => "sub.i4",
            Self::SubI8 => "sub.i8",
            Self::SubR4 => "sub.r4",
            Self::SubR8 => "sub.r8",
            Self::MulI4 => "mul.i4",
            Self::MulI8 => "mul.i8",
            Self::MulR4 => "mul.r4",
            Self::MulR8 => "mul.r8",
            Self::DivI4 => "div.i4",
            Self::DivI8 => "div.i8",
            Self::DivR4 => "div.r4",
            Self::DivR8 => "div.r8",
            Self::DivUnI4 => "div.un.i4",
            Self::DivUnI8 => "div.un.i8",
            Self::RemI4 => "rem.i4",
            Self::RemI8 => "rem.i8",
            Self::RemR4 => "rem.r4",
            Self::RemR8 => "rem.r8",
            Self::RemUnI4 => "rem.un.i4",
            Self::RemUnI8 => "rem.un.i8",
            Self::AndI4 => "and.i4",
            Self::AndI8 => "and.i8",
            Self::OrI4 => "or.i4",
            Self::OrI8 => "or.i8",
            Self::XorI4 => "xor.i4",
            Self::XorI8 => "xor.i8",
            Self::ShlI4 => "shl.i4",
            Self::ShlI8 => "shl.i8",
            Self::ShrI4 => "shr.i4",
            Self::ShrI8 => "shr.i8",
            Self::ShrUnI4 => "shr.un.i4",
            Self::ShrUnI8 => "shr.un.i8",
            Self::NegI4 => "neg.i4",
            Self::NegI8 => "neg.i8",
            Self::NegR4 => "neg.r4",
            Self::NegR8 => "neg.r8",
            Self::NotI4 => "not.i4",
            Self::NotI8 => "not.i8",
            Self::AddOvfI4 => "add.ovf.i4",
            Self::AddOvfI8 => "add.ovf.i8",
            Self::AddOvfUnI4 => "add.ovf.un.i4",
            Self::AddOvfUnI8 => "add.ovf.un.i8",
            Self::SubOvfI4 => "sub.ovf.i4",
            Self::SubOvfI8 => "sub.ovf.i8",
            Self::SubOvfUnI4 => "sub.ovf.un.i4",
            Self::SubOvfUnI8 => "sub.ovf.un.i8",
            Self::MulOvfI4 => "mul.ovf.i4",
            Self::MulOvfI8 => "mul.ovf.i8",
            Self::MulOvfUnI4 => "mul.ovf.un.i4",
            Self::MulOvfUnI8 => "mul.ovf.un.i8",
            Self::CeqI4 => "ceq.i4",
            Self::CeqI8 => "ceq.i8",
            Self::CeqR4 => "ceq.r4",
            Self::CeqR8 => "ceq.r8",
            Self::CgtI4 => "cgt.i4",
            Self::CgtI8 => "cgt.i8",
            Self::CgtR4 => "cgt.r4",
            Self::CgtR8 => "cgt.r8",
            Self::CgtUnI4 => "cgt.un.i4",
            Self::CgtUnI8 => "cgt.un.i8",
            Self::CgtUnR4 => "cgt.un.r4",
            Self::CgtUnR8 => "cgt.un.r8",
            Self::CltI4 => "clt.i4",
            Self::CltI8 => "clt.i8",
            Self::CltR4 => "clt.r4",
            Self::CltR8 => "clt.r8",
            Self::CltUnI4 => "clt.un.i4",
            Self::CltUnI8 => "clt.un.i8",
            Self::CltUnR4 => "clt.un.r4",
            Self::CltUnR8 => "clt.un.r8",
            Self::Br => "br",
            Self::BrTrueI4 => "brtrue.i4",
            Self::BrFalseI4 => "brfalse.i4",
            Self::BrTrueI8 => "brtrue.i8",
            Self::BrFalseI8 => "brfalse.i8",
            Self::Switch => "switch",
            Self::SxI1 => "sx.i1",
            Self::SxI2 => "sx.i2",
            Self::SxI4 => "sx.i4",
            Self::ZxU1 => "zx.u1",
            Self::ZxU2 => "zx.u2",
            Self::ZxU4 => "zx.u4",
            Self::TruncI8 => "trunc.i8",
            Self::I4ToR4 => "i4.to.r4",
            Self::I4ToR8 => "i4.to.r8",
            Self::I8ToR4 => "i8.to.r4",
            Self::I8ToR8 => "i8.to.r8",
            Self::R4ToI4 => "r4.to.i4",
            Self::R4ToI8 => "r4.to.i8",
            Self::R8ToI4 => "r8.to.i4",
            Self::R8ToI8 => "r8.to.i8",
            Self::R4ToR8 => "r4.to.r8",
            Self::R8ToR4 => "r8.to.r4",
            Self::ConvOvfI4 => "conv.ovf.i4",
            Self::ConvOvfI8 => "conv.ovf.i8",
            Self::ConvOvfR8 => "conv.ovf.r8",
            Self::LdIndI1 => "ldind.i1",
            Self::LdIndU1 => "ldind.u1",
            Self::LdIndI2 => "ldind.i2",
            Self::LdIndU2 => "ldind.u2",
            Self::LdIndI4 => "ldind.i4",
            Self::LdIndU4 => "ldind.u4",
            Self::LdIndI8 => "ldind.i8",
            Self::LdIndR4 => "ldind.r4",
            Self::LdIndR8 => "ldind.r8",
            Self::StIndI1 => "stind.i1",
            Self::StIndI2 => "stind.i2",
            Self::StIndI4 => "stind.i4",
            Self::StIndI8 => "stind.i8",
            Self::StIndR4 => "stind.r4",
            Self::StIndR8 => "stind.r8",
            Self::LdBlk => "ld.blk",
            Self::StBlk => "st.blk",
            Self::InitBlk => "init.blk",
            Self::LdFldI1 => "ldfld.i1",
            Self::LdFldU1 => "ldfld.u1",
            Self::LdFldI2 => "ldfld.i2",
            Self::LdFldU2 => "ldfld.u2",
            Self::LdFldI4 => "ldfld.i4",
            Self::LdFldI8 => "ldfld.i8",
            Self::LdFldR4 => "ldfld.r4",
            Self::LdFldR8 => "ldfld.r8",
            Self::LdFldBlk => "ldfld.blk",
            Self::StFldI1 => "stfld.i1",
            Self::StFldI2 => "stfld.i2",
            Self::StFldI4 => "stfld.i4",
            Self::StFldI8 => "stfld.i8",
            Self::StFldR4 => "stfld.r4",
            Self::StFldR8 => "stfld.r8",
            Self::StFldBlk => "stfld.blk",
            Self::LdFldAddr => "ldflda",
            Self::TlsAddr => "tlsaddr",
            Self::NewObj => "newobj",
            Self::NewArr => "newarr",
            Self::LdLen => "ldlen",
            Self::LdElemI1 => "ldelem.i1",
            Self::LdElemU1 => "ldelem.u1",
            Self::LdElemI2 => "ldelem.i2",
            Self::LdElemU2 => "ldelem.u2",
            Self::LdElemI4 => "ldelem.i4",
            Self::LdElemU4 => "ldelem.u4",
            Self::LdElemI8 => "ldelem.i8",
            Self::LdElemR4 => "ldelem.r4",
            Self::LdElemR8 => "ldelem.r8",
            Self::LdElemBlk => "ldelem.blk",
            Self::StElemI1 => "stelem.i1",
            Self::StElemI2 => "stelem.i2",
            Self::StElemI4 => "stelem.i4",
            Self::StElemI8 => "stelem.i8",
            Self::StElemR4 => "stelem.r4",
            Self::StElemR8 => "stelem.r8",
            Self::StElemBlk => "stelem.blk",
            Self::CastClass => "castclass",
            Self::IsInst => "isinst",
            Self::CallIr => "call.ir",
            Self::CallIrVirt => "call.ir.virt",
            Self::CallNative => "call.nat",
            Self::CallNativeVirt => "call.nat.virt",
            Self::CallDelegate => "call.del",
            Self::Ret => "ret",
            Self::RetVoid => "ret.void",
            Self::Throw => "throw",
            Self::Rethrow => "rethrow",
            Self::Leave => "leave",
            Self::LeaveChain => "leave.chain",
            Self::EndFinally => "endfinally",
            Self::EndFilter => "endfilter",
            Self::AtomicXchg4 => "atomic.xchg.4",
            Self::AtomicXchg8 => "atomic.xchg.8",
            Self::AtomicCmpXchg4 => "atomic.cmpxchg.4",
            Self::AtomicCmpXchg8 => "atomic.cmpxchg.8",
            Self::VecPack => "vec.pack",
            Self::NullableHasValue => "nullable.hasvalue",
            Self::NullableValue => "nullable.value",
        }
    }

    /// Branch whose `a` field is an instruction index needing relocation.
    #[inline]
    pub fn takes_branch_target(self) -> bool {
        matches!(
            self,
            Self::Br
                | Self::BrTrueI4
                | Self::BrFalseI4
                | Self::BrTrueI8
                | Self::BrFalseI8
                | Self::Leave
                | Self::LeaveChain
        )
    }
}

/// One fixed-layout internal instruction.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IrInstr {
    pub op: IrOp,
    pub dst: u32,
    pub a: u32,
    pub b: u32,
    pub imm: i64,
}

impl IrInstr {
    /// All-zero instruction for the given opcode; the emitter fills the
    /// fields it needs.
    #[inline]
    pub fn new(op: IrOp) -> Self {
        Self { op, dst: 0, a: 0, b: 0, imm: 0 }
    }
}

/// Pack two 32-bit values into one immediate (low word first).
#[inline]
pub fn pack2(lo: u32, hi: u32) -> i64 {
    (lo as i64) | ((hi as i64) << 32)
}

/// Inverse of [`pack2`].
#[inline]
pub fn unpack2(imm: i64) -> (u32, u32) {
    (imm as u32, (imm >> 32) as u32)
}

/// Typed resolve-table entry. Indices into this table are stable for the
/// lifetime of the owning [`MethodIr`].
#[derive(Debug, Clone)]
pub enum ResolveEntry {
    /// Raw 64-bit constant (static-field addresses land here).
    I8(i64),
    /// Interned string literal.
    Str(Arc<str>),
    TypeTok(TypeToken),
    MethodTok(MethodToken),
    FieldTok(FieldToken),
    /// Resolved call shape, including any trampoline binding.
    Call(ResolvedCall),
    /// Switch jump table of instruction indices.
    SwitchTable(Vec<u32>),
}

impl ResolveEntry {
    /// Identity comparison used for interning. Call shapes compare by
    /// callee token and kind; the bound trampoline is derived state.
    pub fn same(&self, other: &ResolveEntry) -> bool {
        match (self, other) {
            (Self::I8(a), Self::I8(b)) => a == b,
            (Self::Str(a), Self::Str(b)) => a == b,
            (Self::TypeTok(a), Self::TypeTok(b)) => a == b,
            (Self::MethodTok(a), Self::MethodTok(b)) => a == b,
            (Self::FieldTok(a), Self::FieldTok(b)) => a == b,
            (Self::Call(a), Self::Call(b)) => a.method == b.method && a.kind == b.kind,
            (Self::SwitchTable(_), Self::SwitchTable(_)) => false,
            _ => false,
        }
    }

    pub fn as_call(&self) -> Option<&ResolvedCall> {
        match self {
            Self::Call(c) => Some(c),
            _ => None,
        }
    }

    pub fn as_switch(&self) -> Option<&[u32]> {
        match self {
            Self::SwitchTable(t) => Some(t),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&Arc<str>> {
        match self {
            Self::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_type(&self) -> Option<TypeToken> {
        match self {
            Self::TypeTok(t) => Some(*t),
            _ => None,
        }
    }

    pub fn as_field(&self) -> Option<FieldToken> {
        match self {
            Self::FieldTok(t) => Some(*t),
            _ => None,
        }
    }

    pub fn as_i8(&self) -> Option<i64> {
        match self {
            Self::I8(v) => Some(*v),
            _ => None,
        }
    }
}

/// Exception clause with ranges relocated into instruction indices.
#[derive(Debug, Clone)]
pub struct IrExceptionClause {
    pub kind: ClauseKind,
    pub try_start: u32,
    pub try_end: u32,
    pub handler_start: u32,
    pub handler_end: u32,
    pub filter_start: Option<u32>,
    pub catch_type: Option<TypeToken>,
}

impl IrExceptionClause {
    /// Whether an instruction index lies in the protected range.
    #[inline]
    pub fn covers(&self, index: u32) -> bool {
        index >= self.try_start && index < self.try_end
    }

    /// Whether an instruction index lies in the handler body (or filter
    /// code, for filter clauses).
    #[inline]
    pub fn in_handler(&self, index: u32) -> bool {
        if index >= self.handler_start && index < self.handler_end {
            return true;
        }
        match self.filter_start {
            Some(fs) => index >= fs && index < self.handler_start,
            None => false,
        }
    }
}

/// Compiled output for one method. Immutable after build; shared between
/// threads as `Arc<MethodIr>`.
#[derive(Debug, Clone)]
pub struct MethodIr {
    pub method: MethodToken,
    pub code: Vec<IrInstr>,
    pub resolve: Vec<ResolveEntry>,
    pub clauses: Vec<IrExceptionClause>,
    /// Per-argument ABI descriptors, in declaration order.
    pub args: Vec<AbiArg>,
    /// Return classification.
    pub ret: AbiClass,
    /// Byte size of the argument region at the frame base.
    pub args_size: u32,
    /// Byte size of the local region following the arguments.
    pub locals_size: u32,
    /// Byte offset of the evaluation-stack region within the frame.
    pub eval_base: u32,
    /// Byte offset of the 8-byte exception reservation slot.
    pub exc_slot: u32,
    /// Maximum evaluation-stack extent in bytes.
    pub max_stack_bytes: u32,
    /// Whether locals are zeroed on frame entry.
    pub init_locals: bool,
}

impl MethodIr {
    /// Total frame footprint in bytes.
    #[inline]
    pub fn frame_bytes(&self) -> u32 {
        self.eval_base + self.max_stack_bytes
    }

    /// Total frame footprint in 8-byte slots.
    #[inline]
    pub fn frame_slots(&self) -> u32 {
        self.frame_bytes().div_ceil(8)
    }

    /// Innermost-first clauses protecting the given instruction index.
    pub fn clauses_covering(
        &self,
        index: u32,
    ) -> impl Iterator<Item = (usize, &IrExceptionClause)> {
        self.clauses
            .iter()
            .enumerate()
            .filter(move |(_, c)| c.covers(index))
    }

    /// Human-readable listing of the instruction stream, for diagnostics
    /// and trace output.
    pub fn disassemble(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!(
            "== {} == ({} instrs, frame {} bytes: args {} locals {} eval@{})\n",
            self.method,
            self.code.len(),
            self.frame_bytes(),
            self.args_size,
            self.locals_size,
            self.eval_base,
        ));
        for (i, instr) in self.code.iter().enumerate() {
            out.push_str(&self.disassemble_at(i, instr));
            out.push('\n');
        }
        for (i, c) in self.clauses.iter().enumerate() {
            out.push_str(&format!(
                "  clause {}: {:?} try [{}, {}) handler [{}, {})",
                i, c.kind, c.try_start, c.try_end, c.handler_start, c.handler_end
            ));
            if let Some(fs) = c.filter_start {
                out.push_str(&format!(" filter @{}", fs));
            }
            if let Some(t) = c.catch_type {
                out.push_str(&format!(" catch {}", t));
            }
            out.push('\n');
        }
        out
    }

    fn disassemble_at(&self, index: usize, instr: &IrInstr) -> String {
        let mut line = format!("{:04}  {:<16}", index, instr.op.mnemonic());
        match instr.op {
            IrOp::LdcI4 | IrOp::LdcI8 => {
                line.push_str(&format!(" s{} <- {}", instr.dst, instr.imm));
            }
            IrOp::LdcR4 => {
                line.push_str(&format!(
                    " s{} <- {}",
                    instr.dst,
                    f32::from_bits(instr.imm as u32)
                ));
            }
            IrOp::LdcR8 => {
                line.push_str(&format!(
                    " s{} <- {}",
                    instr.dst,
                    f64::from_bits(instr.imm as u64)
                ));
            }
            IrOp::LdStr => {
                let text = self
                    .resolve
                    .get(instr.a as usize)
                    .and_then(|e| e.as_str())
                    .map(|s| s.as_ref())
                    .unwrap_or("<bad resolve>");
                line.push_str(&format!(" s{} <- {:?}", instr.dst, text));
            }
            IrOp::Br => line.push_str(&format!(" -> {}", instr.a)),
            IrOp::BrTrueI4 | IrOp::BrFalseI4 | IrOp::BrTrueI8 | IrOp::BrFalseI8 => {
                line.push_str(&format!(" s{} -> {}", instr.b, instr.a));
            }
            IrOp::Leave | IrOp::LeaveChain => {
                line.push_str(&format!(" -> {}", instr.a));
            }
            IrOp::CallIr | IrOp::CallIrVirt | IrOp::CallNative | IrOp::CallNativeVirt
            | IrOp::CallDelegate => {
                let callee = self
                    .resolve
                    .get(instr.a as usize)
                    .and_then(|e| e.as_call())
                    .map(|c| format!("{}", c.method))
                    .unwrap_or_else(|| "<bad resolve>".into());
                line.push_str(&format!(
                    " {} args@s{} ret@s{}",
                    callee, instr.b, instr.dst
                ));
            }
            IrOp::Switch => {
                line.push_str(&format!(" s{} table r{}", instr.b, instr.a));
            }
            _ => {
                line.push_str(&format!(
                    " s{} s{} s{} {}",
                    instr.dst, instr.a, instr.b, instr.imm
                ));
            }
        }
        line
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::ClauseKind;

    fn empty_ir() -> MethodIr {
        MethodIr {
            method: MethodToken(0),
            code: Vec::new(),
            resolve: Vec::new(),
            clauses: Vec::new(),
            args: Vec::new(),
            ret: AbiClass::Void,
            args_size: 0,
            locals_size: 0,
            eval_base: 8,
            exc_slot: 0,
            max_stack_bytes: 0,
            init_locals: false,
        }
    }

    #[test]
    fn test_pack2_roundtrip() {
        for (lo, hi) in [(0u32, 0u32), (12, 4), (u32::MAX, 1), (7, u32::MAX)] {
            assert_eq!(unpack2(pack2(lo, hi)), (lo, hi));
        }
    }

    #[test]
    fn test_resolve_interning_identity() {
        let a = ResolveEntry::I8(42);
        let b = ResolveEntry::I8(42);
        let c = ResolveEntry::I8(43);
        assert!(a.same(&b));
        assert!(!a.same(&c));
        assert!(!a.same(&ResolveEntry::TypeTok(TypeToken(42))));
        // Switch tables are never shared.
        let s1 = ResolveEntry::SwitchTable(vec![1, 2]);
        let s2 = ResolveEntry::SwitchTable(vec![1, 2]);
        assert!(!s1.same(&s2));
    }

    #[test]
    fn test_clause_ranges() {
        let c = IrExceptionClause {
            kind: ClauseKind::Catch,
            try_start: 10,
            try_end: 50,
            handler_start: 50,
            handler_end: 60,
            filter_start: None,
            catch_type: None,
        };
        assert!(c.covers(10));
        assert!(c.covers(49));
        assert!(!c.covers(50));
        assert!(!c.covers(5));
        assert!(c.in_handler(50));
        assert!(c.in_handler(59));
        assert!(!c.in_handler(60));
    }

    #[test]
    fn test_filter_range_counts_as_handler() {
        let c = IrExceptionClause {
            kind: ClauseKind::Filter,
            try_start: 0,
            try_end: 10,
            handler_start: 20,
            handler_end: 30,
            filter_start: Some(14),
            catch_type: None,
        };
        assert!(c.in_handler(14));
        assert!(c.in_handler(19));
        assert!(c.in_handler(25));
        assert!(!c.in_handler(13));
    }

    #[test]
    fn test_frame_metrics() {
        let mut ir = empty_ir();
        ir.args_size = 16;
        ir.locals_size = 8;
        ir.exc_slot = 24;
        ir.eval_base = 32;
        ir.max_stack_bytes = 20;
        assert_eq!(ir.frame_bytes(), 52);
        assert_eq!(ir.frame_slots(), 7);
    }

    #[test]
    fn test_disassembler_mentions_constants_and_targets() {
        let mut ir = empty_ir();
        ir.code.push(IrInstr {
            op: IrOp::LdcI4,
            dst: 1,
            a: 0,
            b: 0,
            imm: 7,
        });
        ir.code.push(IrInstr {
            op: IrOp::Br,
            dst: 0,
            a: 0,
            b: 0,
            imm: 0,
        });
        let text = ir.disassemble();
        assert!(text.contains("ldc.i4"));
        assert!(text.contains("s1 <- 7"));
        assert!(text.contains("br"));
        assert!(text.contains("-> 0"));
    }

    #[test]
    fn test_branch_target_predicate() {
        assert!(IrOp::Br.takes_branch_target());
        assert!(IrOp::LeaveChain.takes_branch_target());
        assert!(!IrOp::Switch.takes_branch_target());
        assert!(!IrOp::AddI4.takes_branch_target());
    }
}
