//! Source (CIL-like) opcode definitions and decoding
//!
//! This module defines the subset of the stack-based source instruction
//! set the transform understands, with O(1) byte-to-opcode tables for the
//! primary page and the `0xFE`-prefixed page, operand size metadata, and a
//! cursor-style reader that never splits a multi-byte operand.

use std::fmt;

/// Prefix byte introducing the second opcode page.
pub const PREFIX: u8 = 0xFE;

/// Source opcode enumeration.
///
/// Discriminants are the wire encoding: primary-page opcodes carry their
/// byte value, prefixed opcodes carry `0xFE00 | byte`.
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IlOp {
    // === Miscellaneous ===
    Nop = 0x00,
    Break = 0x01,

    // === Argument / local access ===
    Ldarg0 = 0x02,
    Ldarg1 = 0x03,
    Ldarg2 = 0x04,
    Ldarg3 = 0x05,
    Ldloc0 = 0x06,
    Ldloc1 = 0x07,
    Ldloc2 = 0x08,
    Ldloc3 = 0x09,
    Stloc0 = 0x0A,
    Stloc1 = 0x0B,
    Stloc2 = 0x0C,
    Stloc3 = 0x0D,
    LdargS = 0x0E,
    LdargaS = 0x0F,
    StargS = 0x10,
    LdlocS = 0x11,
    LdlocaS = 0x12,
    StlocS = 0x13,

    // === Constants ===
    Ldnull = 0x14,
    LdcI4M1 = 0x15,
    LdcI40 = 0x16,
    LdcI41 = 0x17,
    LdcI42 = 0x18,
    LdcI43 = 0x19,
    LdcI44 = 0x1A,
    LdcI45 = 0x1B,
    LdcI46 = 0x1C,
    LdcI47 = 0x1D,
    LdcI48 = 0x1E,
    LdcI4S = 0x1F,
    LdcI4 = 0x20,
    LdcI8 = 0x21,
    LdcR4 = 0x22,
    LdcR8 = 0x23,

    // === Stack shuffling ===
    Dup = 0x25,
    Pop = 0x26,

    // === Calls ===
    Call = 0x28,
    Ret = 0x2A,

    // === Branches (short forms) ===
    BrS = 0x2B,
    BrfalseS = 0x2C,
    BrtrueS = 0x2D,
    BeqS = 0x2E,
    BgeS = 0x2F,
    BgtS = 0x30,
    BleS = 0x31,
    BltS = 0x32,
    BneUnS = 0x33,
    BgeUnS = 0x34,
    BgtUnS = 0x35,
    BleUnS = 0x36,
    BltUnS = 0x37,

    // === Branches (long forms) ===
    Br = 0x38,
    Brfalse = 0x39,
    Brtrue = 0x3A,
    Beq = 0x3B,
    Bge = 0x3C,
    Bgt = 0x3D,
    Ble = 0x3E,
    Blt = 0x3F,
    BneUn = 0x40,
    BgeUn = 0x41,
    BgtUn = 0x42,
    BleUn = 0x43,
    BltUn = 0x44,
    Switch = 0x45,

    // === Indirect loads/stores ===
    LdindI1 = 0x46,
    LdindU1 = 0x47,
    LdindI2 = 0x48,
    LdindU2 = 0x49,
    LdindI4 = 0x4A,
    LdindU4 = 0x4B,
    LdindI8 = 0x4C,
    LdindI = 0x4D,
    LdindR4 = 0x4E,
    LdindR8 = 0x4F,
    LdindRef = 0x50,
    StindRef = 0x51,
    StindI1 = 0x52,
    StindI2 = 0x53,
    StindI4 = 0x54,
    StindI8 = 0x55,
    StindR4 = 0x56,
    StindR8 = 0x57,

    // === Arithmetic ===
    Add = 0x58,
    Sub = 0x59,
    Mul = 0x5A,
    Div = 0x5B,
    DivUn = 0x5C,
    Rem = 0x5D,
    RemUn = 0x5E,
    And = 0x5F,
    Or = 0x60,
    Xor = 0x61,
    Shl = 0x62,
    Shr = 0x63,
    ShrUn = 0x64,
    Neg = 0x65,
    Not = 0x66,

    // === Conversions ===
    ConvI1 = 0x67,
    ConvI2 = 0x68,
    ConvI4 = 0x69,
    ConvI8 = 0x6A,
    ConvR4 = 0x6B,
    ConvR8 = 0x6C,
    ConvU4 = 0x6D,
    ConvU8 = 0x6E,

    // === Object model ===
    Callvirt = 0x6F,
    Ldobj = 0x71,
    Ldstr = 0x72,
    Newobj = 0x73,
    Castclass = 0x74,
    Isinst = 0x75,
    Throw = 0x7A,
    Ldfld = 0x7B,
    Ldflda = 0x7C,
    Stfld = 0x7D,
    Ldsfld = 0x7E,
    Ldsflda = 0x7F,
    Stsfld = 0x80,
    Stobj = 0x81,

    // === Arrays ===
    Newarr = 0x8D,
    Ldlen = 0x8E,
    LdelemI1 = 0x90,
    LdelemU1 = 0x91,
    LdelemI2 = 0x92,
    LdelemU2 = 0x93,
    LdelemI4 = 0x94,
    LdelemU4 = 0x95,
    LdelemI8 = 0x96,
    LdelemI = 0x97,
    LdelemR4 = 0x98,
    LdelemR8 = 0x99,
    LdelemRef = 0x9A,
    StelemI = 0x9B,
    StelemI1 = 0x9C,
    StelemI2 = 0x9D,
    StelemI4 = 0x9E,
    StelemI8 = 0x9F,
    StelemR4 = 0xA0,
    StelemR8 = 0xA1,
    StelemRef = 0xA2,
    Ldelem = 0xA3,
    Stelem = 0xA4,

    // === Overflow conversions ===
    ConvOvfI1 = 0xB3,
    ConvOvfU1 = 0xB4,
    ConvOvfI2 = 0xB5,
    ConvOvfU2 = 0xB6,
    ConvOvfI4 = 0xB7,
    ConvOvfU4 = 0xB8,
    ConvOvfI8 = 0xB9,
    ConvOvfU8 = 0xBA,

    // === Narrow conversions / overflow arithmetic ===
    ConvU2 = 0xD1,
    ConvU1 = 0xD2,
    ConvI = 0xD3,
    AddOvf = 0xD6,
    AddOvfUn = 0xD7,
    MulOvf = 0xD8,
    MulOvfUn = 0xD9,
    SubOvf = 0xDA,
    SubOvfUn = 0xDB,

    // === Exception flow ===
    Endfinally = 0xDC,
    Leave = 0xDD,
    LeaveS = 0xDE,
    StindI = 0xDF,
    ConvU = 0xE0,

    // === Prefixed page (0xFE) ===
    Ceq = 0xFE01,
    Cgt = 0xFE02,
    CgtUn = 0xFE03,
    Clt = 0xFE04,
    CltUn = 0xFE05,
    Ldarg = 0xFE09,
    Ldarga = 0xFE0A,
    Starg = 0xFE0B,
    Ldloc = 0xFE0C,
    Ldloca = 0xFE0D,
    Stloc = 0xFE0E,
    Endfilter = 0xFE11,
    Initobj = 0xFE15,
    Rethrow = 0xFE1A,
    Sizeof = 0xFE1C,
}

/// Shape of the operand bytes following an opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperandKind {
    None,
    /// Unsigned byte (short-form variable index).
    U8,
    /// Signed byte (short branch displacement, small constant).
    I8,
    /// Unsigned 16-bit (wide variable index).
    U16,
    /// Signed 32-bit (branch displacement, constant).
    I32,
    I64,
    F32,
    F64,
    /// Metadata token.
    Token,
    /// `u32` count followed by that many `i32` displacements.
    Switch,
}

impl OperandKind {
    /// Fixed byte size, `None` for the variable-length switch operand.
    #[inline]
    pub fn size(self) -> Option<usize> {
        match self {
            Self::None => Some(0),
            Self::U8 | Self::I8 => Some(1),
            Self::U16 => Some(2),
            Self::I32 | Self::F32 | Self::Token => Some(4),
            Self::I64 | Self::F64 => Some(8),
            Self::Switch => None,
        }
    }
}

impl IlOp {
    /// Decode a primary-page byte.
    #[inline]
    pub fn from_byte(byte: u8) -> Option<Self> {
        PRIMARY_TABLE[byte as usize]
    }

    /// Decode a `0xFE`-prefixed byte.
    #[inline]
    pub fn from_prefixed_byte(byte: u8) -> Option<Self> {
        PREFIXED_TABLE[byte as usize]
    }

    /// Wire encoding: primary byte, or `0xFE00 | byte` for the second page.
    #[inline]
    pub fn encoding(self) -> u16 {
        self as u16
    }

    /// Encoded length of the opcode itself (1 or 2 bytes).
    #[inline]
    pub fn opcode_len(self) -> usize {
        if self.encoding() >= 0x100 {
            2
        } else {
            1
        }
    }

    /// Operand shape following this opcode.
    pub fn operand(self) -> OperandKind {
        use OperandKind as K;
        match self {
            Self::LdargS | Self::LdargaS | Self::StargS | Self::LdlocS | Self::LdlocaS
            | Self::StlocS => K::U8,
            Self::LdcI4S | Self::BrS | Self::BrfalseS | Self::BrtrueS | Self::BeqS
            | Self::BgeS | Self::BgtS | Self::BleS | Self::BltS | Self::BneUnS
            | Self::BgeUnS | Self::BgtUnS | Self::BleUnS | Self::BltUnS | Self::LeaveS => K::I8,
            Self::Ldarg | Self::Ldarga | Self::Starg | Self::Ldloc | Self::Ldloca
            | Self::Stloc => K::U16,
            Self::LdcI4 | Self::Br | Self::Brfalse | Self::Brtrue | Self::Beq | Self::Bge
            | Self::Bgt | Self::Ble | Self::Blt | Self::BneUn | Self::BgeUn | Self::BgtUn
            | Self::BleUn | Self::BltUn | Self::Leave => K::I32,
            Self::LdcI8 => K::I64,
            Self::LdcR4 => K::F32,
            Self::LdcR8 => K::F64,
            Self::Call | Self::Callvirt | Self::Newobj | Self::Ldobj | Self::Stobj
            | Self::Ldstr | Self::Castclass | Self::Isinst | Self::Ldfld | Self::Ldflda
            | Self::Stfld | Self::Ldsfld | Self::Ldsflda | Self::Stsfld | Self::Newarr
            | Self::Ldelem | Self::Stelem | Self::Initobj | Self::Sizeof => K::Token,
            Self::Switch => K::Switch,
            _ => K::None,
        }
    }

    /// Mnemonic for disassembly and diagnostics.
    pub fn mnemonic(self) -> &'static str {
        match self {
            Self::Nop => "nop",
            Self::Break => "break",
            Self::Ldarg0 => "ldarg.0",
            Self::Ldarg1 => "ldarg.1",
            Self::Ldarg2 => "ldarg.2",
            Self::Ldarg3 => "ldarg.3",
            Self::Ldloc0 => "ldloc.0",
            Self::Ldloc1 => "ldloc.1",
            Self::Ldloc2 => "ldloc.2",
            Self::Ldloc3 => "ldloc.3",
            Self::Stloc0 => "stloc.0",
            Self::Stloc1 => "stloc.1",
            Self::Stloc2 => "stloc.2",
            Self::Stloc3 => "stloc.3",
            Self::LdargS => "ldarg.s",
            Self::LdargaS => "ldarga.s",
            Self::StargS => "starg.s",
            Self::LdlocS => "ldloc.s",
            Self::LdlocaS => "ldloca.s",
            Self::StlocS => "stloc.s",
            Self::Ldnull => "ldnull",
            Self::LdcI4M1 => "ldc.i4.m1",
            Self::LdcI40 => "ldc.i4.0",
            Self::LdcI41 => "ldc.i4.1",
            Self::LdcI42 => "ldc.i4.2",
            Self::LdcI43 => "ldc.i4.3",
            Self::LdcI44 => "ldc.i4.4",
            Self::LdcI45 => "ldc.i4.5",
            Self::LdcI46 => "ldc.i4.6",
            Self::LdcI47 => "ldc.i4.7",
            Self::LdcI48 => "ldc.i4.8",
            Self::LdcI4S => "ldc.i4.s",
            Self::LdcI4 => "ldc.i4",
            Self::LdcI8 => "ldc.i8",
            Self::LdcR4 => "ldc.r4",
            Self::LdcR8 => "ldc.r8",
            Self::Dup => "dup",
            Self::Pop => "pop",
            Self::Call => "call",
            Self::Ret => "ret",
            Self::BrS => "br.s",
            Self::BrfalseS => "brfalse.s",
            Self::BrtrueS => "brtrue.s",
            Self::BeqS => "beq.s",
            Self::BgeS => "bge.s",
            Self::BgtS => "bgt.s",
            Self::BleS => "ble.s",
            Self::BltS => "blt.s",
            Self::BneUnS => "bne.un.s",
            Self::BgeUnS => "bge.un.s",
            Self::BgtUnS => "bgt.un.s",
            Self::BleUnS => "ble.un.s",
            Self::BltUnS => "blt.un.s",
            Self::Br => "br",
            Self::Brfalse => "brfalse",
            Self::Brtrue => "brtrue",
            Self::Beq => "beq",
            Self::Bge => "bge",
            Self::Bgt => "bgt",
            Self::Ble => "ble",
            Self::Blt => "blt",
            Self::BneUn => "bne.un",
            Self::BgeUn => "bge.un",
            Self::BgtUn => "bgt.un",
            Self::BleUn => "ble.un",
            Self::BltUn => "blt.un",
            Self::Switch => "switch",
            Self::LdindI1 => "ldind.i1",
            Self::LdindU1 => "ldind.u1",
            Self::LdindI2 => "ldind.i2",
            Self::LdindU2 => "ldind.u2",
            Self::LdindI4 => "ldind.i4",
            Self::LdindU4 => "ldind.u4",
            Self::LdindI8 => "ldind.i8",
            Self::LdindI => "ldind.i",
            Self::LdindR4 => "ldind.r4",
            Self::LdindR8 => "ldind.r8",
            Self::LdindRef => "ldind.ref",
            Self::StindRef => "stind.ref",
            Self::StindI1 => "stind.i1",
            Self::StindI2 => "stind.i2",
            Self::StindI4 => "stind.i4",
            Self::StindI8 => "stind.i8",
            Self::StindR4 => "stind.r4",
            Self::StindR8 => "stind.r8",
            Self::Add => "add",
            Self::Sub => "sub",
            Self::Mul => "mul",
            Self::Div => "div",
            Self::DivUn => "div.un",
            Self::Rem => "rem",
            Self::RemUn => "rem.un",
            Self::And => "and",
            Self::Or => "or",
            Self::Xor => "xor",
            Self::Shl => "shl",
            Self::Shr => "shr",
            Self::ShrUn => "shr.un",
            Self::Neg => "neg",
            Self::Not => "not",
            Self::ConvI1 => "conv.i1",
            Self::ConvI2 => "conv.i2",
            Self::ConvI4 => "conv.i4",
            Self::ConvI8 => "conv.i8",
            Self::ConvR4 => "conv.r4",
            Self::ConvR8 => "conv.r8",
            Self::ConvU4 => "conv.u4",
            Self::ConvU8 => "conv.u8",
            Self::Callvirt => "callvirt",
            Self::Ldobj => "ldobj",
            Self::Ldstr => "ldstr",
            Self::Newobj => "newobj",
            Self::Castclass => "castclass",
            Self::Isinst => "isinst",
            Self::Throw => "throw",
            Self::Ldfld => "ldfld",
            Self::Ldflda => "ldflda",
            Self::Stfld => "stfld",
            Self::Ldsfld => "ldsfld",
            Self::Ldsflda => "ldsflda",
            Self::Stsfld => "stsfld",
            Self::Stobj => "stobj",
            Self::Newarr => "newarr",
            Self::Ldlen => "ldlen",
            Self::LdelemI1 => "ldelem.i1",
            Self::LdelemU1 => "ldelem.u1",
            Self::LdelemI2 => "ldelem.i2",
            Self::LdelemU2 => "ldelem.u2",
            Self::LdelemI4 => "ldelem.i4",
            Self::LdelemU4 => "ldelem.u4",
            Self::LdelemI8 => "ldelem.i8",
            Self::LdelemI => "ldelem.i",
            Self::LdelemR4 => "ldelem.r4",
            Self::LdelemR8 => "ldelem.r8",
            Self::LdelemRef => "ldelem.ref",
            Self::StelemI => "stelem.i",
            Self::StelemI1 => "stelem.i1",
            Self::StelemI2 => "stelem.i2",
            Self::StelemI4 => "stelem.i4",
            Self::StelemI8 => "stelem.i8",
            Self::StelemR4 => "stelem.r4",
            Self::StelemR8 => "stelem.r8",
            Self::StelemRef => "stelem.ref",
            Self::Ldelem => "ldelem",
            Self::Stelem => "stelem",
            Self::ConvOvfI1 => "conv.ovf.i1",
            Self::ConvOvfU1 => "conv.ovf.u1",
            Self::ConvOvfI2 => "conv.ovf.i2",
            Self::ConvOvfU2 => "conv.ovf.u2",
            Self::ConvOvfI4 => "conv.ovf.i4",
            Self::ConvOvfU4 => "conv.ovf.u4",
            Self::ConvOvfI8 => "conv.ovf.i8",
            Self::ConvOvfU8 => "conv.ovf.u8",
            Self::ConvU2 => "conv.u2",
            Self::ConvU1 => "conv.u1",
            Self::ConvI => "conv.i",
            Self::AddOvf => "add.ovf",
            Self::AddOvfUn => "add.ovf.un",
            Self::MulOvf => "mul.ovf",
            Self::MulOvfUn => "mul.ovf.un",
            Self::SubOvf => "sub.ovf",
            Self::SubOvfUn => "sub.ovf.un",
            Self::Endfinally => "endfinally",
            Self::Leave => "leave",
            Self::LeaveS => "leave.s",
            Self::StindI => "stind.i",
            Self::ConvU => "conv.u",
            Self::Ceq => "ceq",
            Self::Cgt => "cgt",
            Self::CgtUn => "cgt.un",
            Self::Clt => "clt",
            Self::CltUn => "clt.un",
            Self::Ldarg => "ldarg",
            Self::Ldarga => "ldarga",
            Self::Starg => "starg",
            Self::Ldloc => "ldloc",
            Self::Ldloca => "ldloca",
            Self::Stloc => "stloc",
            Self::Endfilter => "endfilter",
            Self::Initobj => "initobj",
            Self::Rethrow => "rethrow",
            Self::Sizeof => "sizeof",
        }
    }

    /// Conditional or unconditional branch (not `leave`, not `switch`).
    #[inline]
    pub fn is_branch(self) -> bool {
        matches!(
            self,
            Self::Br | Self::BrS | Self::Brfalse | Self::BrfalseS | Self::Brtrue
                | Self::BrtrueS | Self::Beq | Self::BeqS | Self::Bge | Self::BgeS
                | Self::Bgt | Self::BgtS | Self::Ble | Self::BleS | Self::Blt | Self::BltS
                | Self::BneUn | Self::BneUnS | Self::BgeUn | Self::BgeUnS | Self::BgtUn
                | Self::BgtUnS | Self::BleUn | Self::BleUnS | Self::BltUn | Self::BltUnS
        )
    }

    /// Branch with a fall-through successor.
    #[inline]
    pub fn is_conditional_branch(self) -> bool {
        self.is_branch() && !matches!(self, Self::Br | Self::BrS)
    }

    /// Instruction after which control never falls through.
    #[inline]
    pub fn is_terminator(self) -> bool {
        matches!(
            self,
            Self::Br | Self::BrS | Self::Ret | Self::Throw | Self::Rethrow | Self::Leave
                | Self::LeaveS | Self::Endfinally | Self::Endfilter | Self::Switch
        )
    }

    /// Anything that ends a basic block (branches included).
    #[inline]
    pub fn ends_block(self) -> bool {
        self.is_branch() || self.is_terminator()
    }
}

impl fmt::Display for IlOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.mnemonic())
    }
}

/// Primary-page lookup table for byte -> opcode conversion.
static PRIMARY_TABLE: [Option<IlOp>; 256] = {
    let mut table = [None; 256];
    let mut i = 0u16;
    while i < 256 {
        table[i as usize] = primary_of(i as u8);
        i += 1;
    }
    table
};

/// Prefixed-page lookup table.
static PREFIXED_TABLE: [Option<IlOp>; 256] = {
    let mut table = [None; 256];
    let mut i = 0u16;
    while i < 256 {
        table[i as usize] = prefixed_of(i as u8);
        i += 1;
    }
    table
};

const fn primary_of(byte: u8) -> Option<IlOp> {
    use IlOp::*;
    Some(match byte {
        0x00 => Nop,
        0x01 => Break,
        0x02 => Ldarg0,
        0x03 => Ldarg1,
        0x04 => Ldarg2,
        0x05 => Ldarg3,
        0x06 => Ldloc0,
        0x07 => Ldloc1,
        0x08 => Ldloc2,
        0x09 => Ldloc3,
        0x0A => Stloc0,
        0x0B => Stloc1,
        0x0C => Stloc2,
        0x0D => Stloc3,
        0x0E => LdargS,
        0x0F => LdargaS,
        0x10 => StargS,
        0x11 => LdlocS,
        0x12 => LdlocaS,
        0x13 => StlocS,
        0x14 => Ldnull,
        0x15 => LdcI4M1,
        0x16 => LdcI40,
        0x17 => LdcI41,
        0x18 => LdcI42,
        0x19 => LdcI43,
        0x1A => LdcI44,
        0x1B => LdcI45,
        0x1C => LdcI46,
        0x1D => LdcI47,
        0x1E => LdcI48,
        0x1F => LdcI4S,
        0x20 => LdcI4,
        0x21 => LdcI8,
        0x22 => LdcR4,
        0x23 => LdcR8,
        0x25 => Dup,
        0x26 => Pop,
        0x28 => Call,
        0x2A => Ret,
        0x2B => BrS,
        0x2C => BrfalseS,
        0x2D => BrtrueS,
        0x2E => BeqS,
        0x2F => BgeS,
        0x30 => BgtS,
        0x31 => BleS,
        0x32 => BltS,
        0x33 => BneUnS,
        0x34 => BgeUnS,
        0x35 => BgtUnS,
        0x36 => BleUnS,
        0x37 => BltUnS,
        0x38 => Br,
        0x39 => Brfalse,
        0x3A => Brtrue,
        0x3B => Beq,
        0x3C => Bge,
        0x3D => Bgt,
        0x3E => Ble,
        0x3F => Blt,
        0x40 => BneUn,
        0x41 => BgeUn,
        0x42 => BgtUn,
        0x43 => BleUn,
        0x44 => BltUn,
        0x45 => Switch,
        0x46 => LdindI1,
        0x47 => LdindU1,
        0x48 => LdindI2,
        0x49 => LdindU2,
        0x4A => LdindI4,
        0x4B => LdindU4,
        0x4C => LdindI8,
        0x4D => LdindI,
        0x4E => LdindR4,
        0x4F => LdindR8,
        0x50 => LdindRef,
        0x51 => StindRef,
        0x52 => StindI1,
        0x53 => StindI2,
        0x54 => StindI4,
        0x55 => StindI8,
        0x56 => StindR4,
        0x57 => StindR8,
        0x58 => Add,
        0x59 => Sub,
        0x5A => Mul,
        0x5B => Div,
        0x5C => DivUn,
        0x5D => Rem,
        0x5E => RemUn,
        0x5F => And,
        0x60 => Or,
        0x61 => Xor,
        0x62 => Shl,
        0x63 => Shr,
        0x64 => ShrUn,
        0x65 => Neg,
        0x66 => Not,
        0x67 => ConvI1,
        0x68 => ConvI2,
        0x69 => ConvI4,
        0x6A => ConvI8,
        0x6B => ConvR4,
        0x6C => ConvR8,
        0x6D => ConvU4,
        0x6E => ConvU8,
        0x6F => Callvirt,
        0x71 => Ldobj,
        0x72 => Ldstr,
        0x73 => Newobj,
        0x74 => Castclass,
        0x75 => Isinst,
        0x7A => Throw,
        0x7B => Ldfld,
        0x7C => Ldflda,
        0x7D => Stfld,
        0x7E => Ldsfld,
        0x7F => Ldsflda,
        0x80 => Stsfld,
        0x81 => Stobj,
        0x8D => Newarr,
        0x8E => Ldlen,
        0x90 => LdelemI1,
        0x91 => LdelemU1,
        0x92 => LdelemI2,
        0x93 => LdelemU2,
        0x94 => LdelemI4,
        0x95 => LdelemU4,
        0x96 => LdelemI8,
        0x97 => LdelemI,
        0x98 => LdelemR4,
        0x99 => LdelemR8,
        0x9A => LdelemRef,
        0x9B => StelemI,
        0x9C => StelemI1,
        0x9D => StelemI2,
        0x9E => StelemI4,
        0x9F => StelemI8,
        0xA0 => StelemR4,
        0xA1 => StelemR8,
        0xA2 => StelemRef,
        0xA3 => Ldelem,
        0xA4 => Stelem,
        0xB3 => ConvOvfI1,
        0xB4 => ConvOvfU1,
        0xB5 => ConvOvfI2,
        0xB6 => ConvOvfU2,
        0xB7 => ConvOvfI4,
        0xB8 => ConvOvfU4,
        0xB9 => ConvOvfI8,
        0xBA => ConvOvfU8,
        0xD1 => ConvU2,
        0xD2 => ConvU1,
        0xD3 => ConvI,
        0xD6 => AddOvf,
        0xD7 => AddOvfUn,
        0xD8 => MulOvf,
        0xD9 => MulOvfUn,
        0xDA => SubOvf,
        0xDB => SubOvfUn,
        0xDC => Endfinally,
        0xDD => Leave,
        0xDE => LeaveS,
        0xDF => StindI,
        0xE0 => ConvU,
        _ => return None,
    })
}

const fn prefixed_of(byte: u8) -> Option<IlOp> {
    use IlOp::*;
    Some(match byte {
        0x01 => Ceq,
        0x02 => Cgt,
        0x03 => CgtUn,
        0x04 => Clt,
        0x05 => CltUn,
        0x09 => Ldarg,
        0x0A => Ldarga,
        0x0B => Starg,
        0x0C => Ldloc,
        0x0D => Ldloca,
        0x0E => Stloc,
        0x11 => Endfilter,
        0x15 => Initobj,
        0x1A => Rethrow,
        0x1C => Sizeof,
        _ => return None,
    })
}

/// Decoded operand payload.
#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    None,
    /// Integer immediate (sign-extended where the encoding is signed).
    Imm(i64),
    Float(f64),
    /// Metadata token bits; interpretation depends on the opcode.
    Token(u32),
    /// Absolute IL offsets of switch targets.
    Targets(Vec<u32>),
}

/// One decoded instruction.
#[derive(Debug, Clone)]
pub struct IlInstr {
    pub op: IlOp,
    pub operand: Operand,
    /// IL offset of the opcode byte.
    pub offset: u32,
    /// Total encoded length, opcode plus operand.
    pub len: u32,
}

impl IlInstr {
    /// Offset of the instruction after this one.
    #[inline]
    pub fn next_offset(&self) -> u32 {
        self.offset + self.len
    }

    /// Absolute branch/leave target, when the operand is a displacement.
    pub fn branch_target(&self) -> Option<u32> {
        if !(self.op.is_branch() || matches!(self.op, IlOp::Leave | IlOp::LeaveS)) {
            return None;
        }
        match self.operand {
            Operand::Imm(disp) => {
                Some((self.next_offset() as i64 + disp) as u32)
            }
            _ => None,
        }
    }
}

/// Decode errors for the source instruction stream.
#[derive(Debug, Clone, PartialEq)]
pub enum IlDecodeError {
    /// Byte is not a recognized opcode on its page.
    UnknownOpcode { offset: u32, byte: u8, prefixed: bool },
    /// Operand extends past the end of the stream.
    TruncatedOperand { offset: u32 },
}

impl fmt::Display for IlDecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownOpcode { offset, byte, prefixed } => {
                if *prefixed {
                    write!(f, "unknown opcode 0xfe 0x{:02x} at offset {}", byte, offset)
                } else {
                    write!(f, "unknown opcode 0x{:02x} at offset {}", byte, offset)
                }
            }
            Self::TruncatedOperand { offset } => {
                write!(f, "truncated operand at offset {}", offset)
            }
        }
    }
}

impl std::error::Error for IlDecodeError {}

/// Cursor over a raw instruction stream.
///
/// Every fetch consumes a whole instruction, operand included, so callers
/// can never land inside a multi-byte operand.
#[derive(Debug)]
pub struct IlReader<'a> {
    code: &'a [u8],
    pos: usize,
}

impl<'a> IlReader<'a> {
    pub fn new(code: &'a [u8]) -> Self {
        Self { code, pos: 0 }
    }

    /// Reposition the cursor to an absolute IL offset.
    #[inline]
    pub fn seek(&mut self, offset: u32) {
        self.pos = offset as usize;
    }

    #[inline]
    pub fn offset(&self) -> u32 {
        self.pos as u32
    }

    #[inline]
    pub fn at_end(&self) -> bool {
        self.pos >= self.code.len()
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], IlDecodeError> {
        let rem = self.code.len().saturating_sub(self.pos);
        if n > rem {
            return Err(IlDecodeError::TruncatedOperand { offset: self.pos as u32 });
        }
        let s = &self.code[self.pos..self.pos + n];
        self.pos += n;
        Ok(s)
    }

    /// Decode the instruction at the cursor and advance past it.
    pub fn fetch(&mut self) -> Result<IlInstr, IlDecodeError> {
        let start = self.pos as u32;
        let first = self.take(1)?[0];
        let op = if first == PREFIX {
            let second = self.take(1)?[0];
            IlOp::from_prefixed_byte(second).ok_or(IlDecodeError::UnknownOpcode {
                offset: start,
                byte: second,
                prefixed: true,
            })?
        } else {
            IlOp::from_byte(first).ok_or(IlDecodeError::UnknownOpcode {
                offset: start,
                byte: first,
                prefixed: false,
            })?
        };

        let operand = match op.operand() {
            OperandKind::None => Operand::None,
            OperandKind::U8 => Operand::Imm(self.take(1)?[0] as i64),
            OperandKind::I8 => Operand::Imm(self.take(1)?[0] as i8 as i64),
            OperandKind::U16 => {
                let b = self.take(2)?;
                Operand::Imm(u16::from_le_bytes([b[0], b[1]]) as i64)
            }
            OperandKind::I32 => {
                let b = self.take(4)?;
                Operand::Imm(i32::from_le_bytes([b[0], b[1], b[2], b[3]]) as i64)
            }
            OperandKind::I64 => {
                let b = self.take(8)?;
                let mut a = [0u8; 8];
                a.copy_from_slice(b);
                Operand::Imm(i64::from_le_bytes(a))
            }
            OperandKind::F32 => {
                let b = self.take(4)?;
                Operand::Float(f32::from_le_bytes([b[0], b[1], b[2], b[3]]) as f64)
            }
            OperandKind::F64 => {
                let b = self.take(8)?;
                let mut a = [0u8; 8];
                a.copy_from_slice(b);
                Operand::Float(f64::from_le_bytes(a))
            }
            OperandKind::Token => {
                let b = self.take(4)?;
                Operand::Token(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            }
            OperandKind::Switch => {
                let b = self.take(4)?;
                let count = u32::from_le_bytes([b[0], b[1], b[2], b[3]]) as usize;
                let bytes = count
                    .checked_mul(4)
                    .ok_or(IlDecodeError::TruncatedOperand { offset: self.pos as u32 })?;
                let body = self.take(bytes)?;
                let next = self.pos as u32;
                let targets = body
                    .chunks_exact(4)
                    .map(|c| {
                        let d = i32::from_le_bytes([c[0], c[1], c[2], c[3]]);
                        (next as i64 + d as i64) as u32
                    })
                    .collect();
                Operand::Targets(targets)
            }
        };

        Ok(IlInstr {
            op,
            operand,
            offset: start,
            len: self.pos as u32 - start,
        })
    }
}
