//! Lowering of source bytecode into the internal instruction set
//!
//! The emitter walks basic blocks through a flow worklist: a block is
//! entered with the stack shape its first predecessor recorded, emitted
//! linearly, and every branch out enqueues its target with the shape at
//! the branch point. A block reached again with a different shape is a
//! translation-fatal inconsistency.
//!
//! Branch targets are recorded as source offsets while emitting and
//! relocated to final instruction indices in one pass at the end.

pub mod blocks;
pub mod intrinsics;
pub mod stack;

use std::collections::{HashMap, VecDeque};

use smallvec::SmallVec;
use tracing::debug;

use crate::abi::AbiError;
use crate::bridge::{layout_args, resolve_call, AbiArg, CallKind, NativeError, TrampolineTable};
use crate::il::{IlDecodeError, IlInstr, IlOp, IlReader, Operand};
use crate::ir::{
    pack2, IrExceptionClause, IrInstr, IrOp, MethodIr, ResolveEntry,
};
use crate::metadata::{
    ClauseKind, FieldDesc, FieldToken, MetadataStore, MethodBody, MethodDesc, MethodKind,
    MethodToken, PrimKind, StringToken, TypeToken,
};

use blocks::BlockMap;
use intrinsics::{Intrinsic, IntrinsicTable};
use stack::{EvalStack, EvalStackSlot, FlowInfo, StackKind, StackShape};

/// Translation-time failures. A method that fails here is never cached.
#[derive(Debug)]
pub enum EmitError {
    Decode(IlDecodeError),
    BranchTargetOutOfRange { offset: u32, target: u32 },
    StackUnderflow { offset: u32 },
    /// A join point was reached with two different stack shapes.
    JoinShapeMismatch { target: u32 },
    UnsupportedOpcode { offset: u32, op: IlOp },
    /// Operand categories do not fit the opcode.
    OperandMismatch { offset: u32, op: IlOp },
    UnknownToken { offset: u32, token: u32 },
    /// Callee is not a method the transform can lower.
    NotInterpreted(MethodToken),
    Native(NativeError),
    Abi(AbiError),
}

impl std::fmt::Display for EmitError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Decode(e) => write!(f, "{}", e),
            Self::BranchTargetOutOfRange { offset, target } => {
                write!(f, "branch at offset {} targets {} outside the stream", offset, target)
            }
            Self::StackUnderflow { offset } => {
                write!(f, "evaluation stack underflow at offset {}", offset)
            }
            Self::JoinShapeMismatch { target } => {
                write!(f, "inconsistent stack shape joining block at offset {}", target)
            }
            Self::UnsupportedOpcode { offset, op } => {
                write!(f, "unsupported opcode '{}' at offset {}", op, offset)
            }
            Self::OperandMismatch { offset, op } => {
                write!(f, "operand category mismatch for '{}' at offset {}", op, offset)
            }
            Self::UnknownToken { offset, token } => {
                write!(f, "unresolved token 0x{:08x} at offset {}", token, offset)
            }
            Self::NotInterpreted(m) => {
                write!(f, "method {} has no interpretable body", m)
            }
            Self::Native(e) => write!(f, "{}", e),
            Self::Abi(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for EmitError {}

impl From<IlDecodeError> for EmitError {
    fn from(e: IlDecodeError) -> Self {
        Self::Decode(e)
    }
}

impl From<NativeError> for EmitError {
    fn from(e: NativeError) -> Self {
        Self::Native(e)
    }
}

impl From<AbiError> for EmitError {
    fn from(e: AbiError) -> Self {
        Self::Abi(e)
    }
}

pub type EmitResult<T> = Result<T, EmitError>;

/// Emission-time context injected by the embedder.
#[derive(Debug, Clone, Copy)]
pub struct EmitConfig<'a> {
    pub intrinsics: &'a IntrinsicTable,
    /// Trampoline table for native callees; `None` means any native call
    /// site fails translation.
    pub trampolines: Option<&'a TrampolineTable>,
}

/// Translate one interpreted method into its internal form.
pub fn emit_method(
    store: &MetadataStore,
    cfg: &EmitConfig<'_>,
    method: MethodToken,
) -> EmitResult<MethodIr> {
    let desc = store
        .method_desc(method)
        .ok_or(EmitError::NotInterpreted(method))?;
    let body = match &desc.kind {
        MethodKind::Interpreted(body) => body,
        MethodKind::Native => return Err(EmitError::NotInterpreted(method)),
    };
    debug!(method = %method, name = %desc.name, "translating method");
    let ir = Emitter::new(store, cfg, method, desc, body)?.run()?;
    debug!(
        method = %method,
        instrs = ir.code.len(),
        frame_bytes = ir.frame_bytes(),
        "translation complete"
    );
    Ok(ir)
}

struct LocalSlot {
    /// Byte offset from the frame base.
    offset: u32,
    size: u32,
    kind: StackKind,
}

struct Emitter<'a> {
    store: &'a MetadataStore,
    cfg: &'a EmitConfig<'a>,
    method: MethodToken,
    desc: &'a MethodDesc,
    body: &'a MethodBody,
    blocks: BlockMap,
    stack: EvalStack,
    code: Vec<IrInstr>,
    resolve: Vec<ResolveEntry>,
    /// Recorded entry shape per block start offset.
    shapes: HashMap<u32, StackShape>,
    worklist: VecDeque<FlowInfo>,
    /// (instruction index, source target offset) pairs awaiting relocation.
    pending_branches: Vec<(usize, u32)>,
    /// (resolve index, source target offsets) for switch tables.
    pending_switches: Vec<(usize, Vec<u32>)>,
    args: Vec<AbiArg>,
    args_size: u32,
    locals: Vec<LocalSlot>,
    locals_size: u32,
    exc_slot: u32,
    eval_base: u32,
}

impl<'a> Emitter<'a> {
    fn new(
        store: &'a MetadataStore,
        cfg: &'a EmitConfig<'a>,
        method: MethodToken,
        desc: &'a MethodDesc,
        body: &'a MethodBody,
    ) -> EmitResult<Self> {
        let blocks = BlockMap::build(&body.code, &body.clauses)?;
        let (args, args_size) = layout_args(store, &desc.params)?;

        let mut locals = Vec::with_capacity(body.locals.len());
        let mut locals_size = 0u32;
        for &ty in &body.locals {
            let (kind, size) = StackKind::reduce(store, ty);
            let slots = size.div_ceil(8).max(1);
            locals.push(LocalSlot {
                offset: args_size + locals_size,
                size,
                kind,
            });
            locals_size += slots * 8;
        }

        let exc_slot = args_size + locals_size;
        let eval_base = exc_slot + 8;

        Ok(Self {
            store,
            cfg,
            method,
            desc,
            body,
            blocks,
            stack: EvalStack::new(eval_base),
            code: Vec::new(),
            resolve: Vec::new(),
            shapes: HashMap::new(),
            worklist: VecDeque::new(),
            pending_branches: Vec::new(),
            pending_switches: Vec::new(),
            args,
            args_size,
            locals,
            locals_size,
            exc_slot,
            eval_base,
        })
    }

    fn run(mut self) -> EmitResult<MethodIr> {
        self.record_flow(0, StackShape::default())?;
        self.seed_clause_flows()?;

        while let Some(flow) = self.worklist.pop_front() {
            let Some(mut bidx) = self.blocks.index_at(flow.target_il) else {
                continue;
            };
            if self.blocks.get(bidx).visited {
                continue;
            }
            let shape = self.shapes[&flow.target_il].clone();
            self.stack.restore(&shape);

            loop {
                let start = self.blocks.get(bidx).il_start;
                self.blocks.get_mut(bidx).visited = true;
                self.blocks.get_mut(bidx).ir_offset = self.code.len() as u32;
                let _ = start;

                let fell_through = self.emit_block(bidx)?;
                if !fell_through {
                    break;
                }
                let next_il = self.blocks.get(bidx).il_end;
                if next_il as usize >= self.body.code.len() {
                    break;
                }
                self.record_flow(next_il, self.stack.snapshot())?;
                let Some(nidx) = self.blocks.index_at(next_il) else {
                    break;
                };
                if self.blocks.get(nidx).visited {
                    // Fall-through into already-emitted code needs an
                    // explicit jump.
                    self.emit_pending_branch(IrOp::Br, 0, next_il);
                    break;
                }
                bidx = nidx;
            }
        }

        self.relocate()?;
        let max_stack_bytes = self.stack.max_bytes();
        let clauses = self.relocated_clauses()?;
        let ret = match self.desc.ret {
            None => crate::abi::AbiClass::Void,
            Some(t) => crate::abi::classify_type(self.store, t)?,
        };

        Ok(MethodIr {
            method: self.method,
            code: self.code,
            resolve: self.resolve,
            clauses,
            args: self.args,
            ret,
            args_size: self.args_size,
            locals_size: self.locals_size,
            eval_base: self.eval_base,
            exc_slot: self.exc_slot,
            max_stack_bytes,
            init_locals: self.body.init_locals,
        })
    }

    // === Flow bookkeeping ===

    fn exc_entry_shape(&self) -> StackShape {
        let mut slots = SmallVec::new();
        slots.push(EvalStackSlot {
            kind: StackKind::I8,
            size: 8,
            offset: self.exc_slot,
        });
        StackShape { slots }
    }

    fn seed_clause_flows(&mut self) -> EmitResult<()> {
        let clauses = self.body.clauses.clone();
        for c in &clauses {
            match c.kind {
                ClauseKind::Catch => {
                    self.record_flow(c.handler_start, self.exc_entry_shape())?;
                }
                ClauseKind::Filter => {
                    if let Some(fs) = c.filter_start {
                        self.record_flow(fs, self.exc_entry_shape())?;
                    }
                    self.record_flow(c.handler_start, self.exc_entry_shape())?;
                }
                ClauseKind::Finally | ClauseKind::Fault => {
                    self.record_flow(c.handler_start, StackShape::default())?;
                }
            }
        }
        Ok(())
    }

    /// Record the stack shape flowing into a block, enqueueing it if not
    /// yet emitted. A second, different shape for the same block is fatal.
    fn record_flow(&mut self, target_il: u32, shape: StackShape) -> EmitResult<()> {
        if let Some(existing) = self.shapes.get(&target_il) {
            if *existing != shape {
                return Err(EmitError::JoinShapeMismatch { target: target_il });
            }
        } else {
            self.shapes.insert(target_il, shape.clone());
        }
        if let Some(bidx) = self.blocks.index_at(target_il) {
            let block = self.blocks.get_mut(bidx);
            if !block.visited && !block.in_worklist {
                block.in_worklist = true;
                self.worklist.push_back(FlowInfo { target_il, shape });
            }
        }
        Ok(())
    }

    // === Emission helpers ===

    fn emit(&mut self, instr: IrInstr) -> usize {
        self.code.push(instr);
        self.code.len() - 1
    }

    fn emit_pending_branch(&mut self, op: IrOp, b: u32, target_il: u32) -> usize {
        let idx = self.emit(IrInstr { op, dst: 0, a: 0, b, imm: 0 });
        self.pending_branches.push((idx, target_il));
        idx
    }

    fn intern(&mut self, entry: ResolveEntry) -> u32 {
        for (i, e) in self.resolve.iter().enumerate() {
            if e.same(&entry) {
                return i as u32;
            }
        }
        self.resolve.push(entry);
        (self.resolve.len() - 1) as u32
    }

    fn pop(&mut self, offset: u32) -> EmitResult<EvalStackSlot> {
        self.stack
            .pop()
            .ok_or(EmitError::StackUnderflow { offset })
    }

    fn type_token(&self, instr: &IlInstr) -> EmitResult<TypeToken> {
        match instr.operand {
            Operand::Token(bits) => {
                let t = TypeToken(bits);
                if self.store.type_desc(t).is_some() {
                    Ok(t)
                } else {
                    Err(EmitError::UnknownToken { offset: instr.offset, token: bits })
                }
            }
            _ => Err(EmitError::OperandMismatch { offset: instr.offset, op: instr.op }),
        }
    }

    fn field_token(&self, instr: &IlInstr) -> EmitResult<FieldToken> {
        match instr.operand {
            Operand::Token(bits) => {
                let t = FieldToken(bits);
                if self.store.field_desc(t).is_some() {
                    Ok(t)
                } else {
                    Err(EmitError::UnknownToken { offset: instr.offset, token: bits })
                }
            }
            _ => Err(EmitError::OperandMismatch { offset: instr.offset, op: instr.op }),
        }
    }

    fn method_token(&self, instr: &IlInstr) -> EmitResult<MethodToken> {
        match instr.operand {
            Operand::Token(bits) => {
                let t = MethodToken(bits);
                if self.store.method_desc(t).is_some() {
                    Ok(t)
                } else {
                    Err(EmitError::UnknownToken { offset: instr.offset, token: bits })
                }
            }
            _ => Err(EmitError::OperandMismatch { offset: instr.offset, op: instr.op }),
        }
    }

    fn field_of(&self, instr: &IlInstr) -> EmitResult<(FieldToken, &'a FieldDesc)> {
        let t = self.field_token(instr)?;
        match self.store.field_desc(t) {
            Some(fd) => Ok((t, fd)),
            None => Err(EmitError::UnknownToken { offset: instr.offset, token: t.0 }),
        }
    }

    fn callee_of(&self, instr: &IlInstr) -> EmitResult<(MethodToken, &'a MethodDesc)> {
        let t = self.method_token(instr)?;
        match self.store.method_desc(t) {
            Some(md) => Ok((t, md)),
            None => Err(EmitError::UnknownToken { offset: instr.offset, token: t.0 }),
        }
    }

    fn imm_of(&self, instr: &IlInstr) -> EmitResult<i64> {
        match instr.operand {
            Operand::Imm(v) => Ok(v),
            _ => Err(EmitError::OperandMismatch { offset: instr.offset, op: instr.op }),
        }
    }

    /// Copy a value between slot runs, choosing the scalar or block form.
    fn emit_copy(&mut self, dst_slot: u32, src_slot: u32, size: u32) {
        if size <= 8 {
            self.emit(IrInstr { op: IrOp::Mov, dst: dst_slot, a: src_slot, b: 0, imm: 0 });
        } else {
            self.emit(IrInstr {
                op: IrOp::MovBlk,
                dst: dst_slot,
                a: src_slot,
                b: 0,
                imm: size as i64,
            });
        }
    }

    /// Widen mismatched numeric operands in place, returning the common
    /// category.
    fn unify(
        &mut self,
        a: EvalStackSlot,
        b: EvalStackSlot,
        instr: &IlInstr,
    ) -> EmitResult<StackKind> {
        use StackKind as K;
        match (a.kind, b.kind) {
            (x, y) if x == y && x.is_scalar() => Ok(x),
            (K::I4, K::I8) => {
                self.emit(IrInstr { op: IrOp::SxI4, dst: a.slot(), a: a.slot(), b: 0, imm: 0 });
                Ok(K::I8)
            }
            (K::I8, K::I4) => {
                self.emit(IrInstr { op: IrOp::SxI4, dst: b.slot(), a: b.slot(), b: 0, imm: 0 });
                Ok(K::I8)
            }
            (K::R4, K::R8) => {
                self.emit(IrInstr { op: IrOp::R4ToR8, dst: a.slot(), a: a.slot(), b: 0, imm: 0 });
                Ok(K::R8)
            }
            (K::R8, K::R4) => {
                self.emit(IrInstr { op: IrOp::R4ToR8, dst: b.slot(), a: b.slot(), b: 0, imm: 0 });
                Ok(K::R8)
            }
            _ => Err(EmitError::OperandMismatch { offset: instr.offset, op: instr.op }),
        }
    }

    fn binary_op(
        &mut self,
        instr: &IlInstr,
        select: fn(StackKind) -> Option<IrOp>,
    ) -> EmitResult<()> {
        let b = self.pop(instr.offset)?;
        let a = self.pop(instr.offset)?;
        let kind = self.unify(a, b, instr)?;
        let op = select(kind)
            .ok_or(EmitError::OperandMismatch { offset: instr.offset, op: instr.op })?;
        let size = if matches!(kind, StackKind::I4 | StackKind::R4) { 4 } else { 8 };
        let dst = self.stack.push(kind, size);
        self.emit(IrInstr { op, dst: dst.slot(), a: a.slot(), b: b.slot(), imm: 0 });
        Ok(())
    }

    fn compare_op(
        &mut self,
        instr: &IlInstr,
        select: fn(StackKind) -> Option<IrOp>,
    ) -> EmitResult<()> {
        let b = self.pop(instr.offset)?;
        let a = self.pop(instr.offset)?;
        let kind = self.unify(a, b, instr)?;
        let op = select(kind)
            .ok_or(EmitError::OperandMismatch { offset: instr.offset, op: instr.op })?;
        let dst = self.stack.push(StackKind::I4, 4);
        self.emit(IrInstr { op, dst: dst.slot(), a: a.slot(), b: b.slot(), imm: 0 });
        Ok(())
    }

    fn unary_op(
        &mut self,
        instr: &IlInstr,
        select: fn(StackKind) -> Option<IrOp>,
    ) -> EmitResult<()> {
        let a = self.pop(instr.offset)?;
        let op = select(a.kind)
            .ok_or(EmitError::OperandMismatch { offset: instr.offset, op: instr.op })?;
        let dst = self.stack.push(a.kind, a.size);
        self.emit(IrInstr { op, dst: dst.slot(), a: a.slot(), b: 0, imm: 0 });
        Ok(())
    }

    // === Block emission ===

    /// Emit one block; returns whether control falls through its end.
    fn emit_block(&mut self, bidx: usize) -> EmitResult<bool> {
        let (il_start, il_end) = {
            let b = self.blocks.get(bidx);
            (b.il_start, b.il_end)
        };
        let mut reader = IlReader::new(&self.body.code);
        reader.seek(il_start);

        let mut fell_through = true;
        while reader.offset() < il_end {
            let instr = reader.fetch()?;
            fell_through = self.translate(&instr)?;
        }
        Ok(fell_through)
    }

    /// Translate one source instruction; returns whether control can fall
    /// through to the next instruction.
    fn translate(&mut self, instr: &IlInstr) -> EmitResult<bool> {
        use IlOp as O;
        let off = instr.offset;
        match instr.op {
            O::Nop | O::Break => {}

            // --- constants ---
            O::LdcI4M1 | O::LdcI40 | O::LdcI41 | O::LdcI42 | O::LdcI43 | O::LdcI44
            | O::LdcI45 | O::LdcI46 | O::LdcI47 | O::LdcI48 => {
                let v = instr.op.encoding() as i64 - O::LdcI40.encoding() as i64;
                self.emit_ldc_i4(v);
            }
            O::LdcI4S | O::LdcI4 => {
                let v = self.imm_of(instr)?;
                self.emit_ldc_i4(v);
            }
            O::LdcI8 => {
                let v = self.imm_of(instr)?;
                let dst = self.stack.push(StackKind::I8, 8);
                self.emit(IrInstr { op: IrOp::LdcI8, dst: dst.slot(), a: 0, b: 0, imm: v });
            }
            O::LdcR4 => {
                let v = match instr.operand {
                    Operand::Float(v) => v as f32,
                    _ => return Err(EmitError::OperandMismatch { offset: off, op: instr.op }),
                };
                let dst = self.stack.push(StackKind::R4, 4);
                self.emit(IrInstr {
                    op: IrOp::LdcR4,
                    dst: dst.slot(),
                    a: 0,
                    b: 0,
                    imm: v.to_bits() as i64,
                });
            }
            O::LdcR8 => {
                let v = match instr.operand {
                    Operand::Float(v) => v,
                    _ => return Err(EmitError::OperandMismatch { offset: off, op: instr.op }),
                };
                let dst = self.stack.push(StackKind::R8, 8);
                self.emit(IrInstr {
                    op: IrOp::LdcR8,
                    dst: dst.slot(),
                    a: 0,
                    b: 0,
                    imm: v.to_bits() as i64,
                });
            }
            O::Ldnull => {
                let dst = self.stack.push(StackKind::I8, 8);
                self.emit(IrInstr { op: IrOp::LdNull, dst: dst.slot(), a: 0, b: 0, imm: 0 });
            }
            O::Ldstr => {
                let bits = match instr.operand {
                    Operand::Token(bits) => bits,
                    _ => return Err(EmitError::OperandMismatch { offset: off, op: instr.op }),
                };
                let s = self
                    .store
                    .string(StringToken(bits))
                    .ok_or(EmitError::UnknownToken { offset: off, token: bits })?
                    .clone();
                let ridx = self.intern(ResolveEntry::Str(s));
                let dst = self.stack.push(StackKind::I8, 8);
                self.emit(IrInstr { op: IrOp::LdStr, dst: dst.slot(), a: ridx, b: 0, imm: 0 });
            }

            // --- argument / local access ---
            O::Ldarg0 | O::Ldarg1 | O::Ldarg2 | O::Ldarg3 => {
                let i = (instr.op.encoding() - O::Ldarg0.encoding()) as usize;
                self.emit_ldarg(off, instr, i)?;
            }
            O::LdargS | O::Ldarg => {
                let i = self.imm_of(instr)? as usize;
                self.emit_ldarg(off, instr, i)?;
            }
            O::StargS | O::Starg => {
                let i = self.imm_of(instr)? as usize;
                self.emit_starg(off, instr, i)?;
            }
            O::LdargaS | O::Ldarga => {
                let i = self.imm_of(instr)? as usize;
                let arg = *self
                    .args
                    .get(i)
                    .ok_or(EmitError::OperandMismatch { offset: off, op: instr.op })?;
                let dst = self.stack.push(StackKind::I8, 8);
                self.emit(IrInstr {
                    op: IrOp::SlotAddr,
                    dst: dst.slot(),
                    a: arg.offset / 8,
                    b: 0,
                    imm: 0,
                });
            }
            O::Ldloc0 | O::Ldloc1 | O::Ldloc2 | O::Ldloc3 => {
                let i = (instr.op.encoding() - O::Ldloc0.encoding()) as usize;
                self.emit_ldloc(off, instr, i)?;
            }
            O::LdlocS | O::Ldloc => {
                let i = self.imm_of(instr)? as usize;
                self.emit_ldloc(off, instr, i)?;
            }
            O::Stloc0 | O::Stloc1 | O::Stloc2 | O::Stloc3 => {
                let i = (instr.op.encoding() - O::Stloc0.encoding()) as usize;
                self.emit_stloc(off, instr, i)?;
            }
            O::StlocS | O::Stloc => {
                let i = self.imm_of(instr)? as usize;
                self.emit_stloc(off, instr, i)?;
            }
            O::LdlocaS | O::Ldloca => {
                let i = self.imm_of(instr)? as usize;
                let slot = self
                    .locals
                    .get(i)
                    .map(|l| l.offset / 8)
                    .ok_or(EmitError::OperandMismatch { offset: off, op: instr.op })?;
                let dst = self.stack.push(StackKind::I8, 8);
                self.emit(IrInstr { op: IrOp::SlotAddr, dst: dst.slot(), a: slot, b: 0, imm: 0 });
            }

            // --- stack shuffling ---
            O::Dup => {
                let top = *self
                    .stack
                    .peek(0)
                    .ok_or(EmitError::StackUnderflow { offset: off })?;
                let dst = self.stack.push(top.kind, top.size);
                self.emit_copy(dst.slot(), top.slot(), top.size.max(8));
            }
            O::Pop => {
                self.pop(off)?;
            }

            // --- arithmetic ---
            O::Add => self.binary_op(instr, |k| {
                Some(match k {
                    StackKind::I4 => IrOp::AddI4,
                    StackKind::I8 => IrOp::AddI8,
                    StackKind::R4 => IrOp::AddR4,
                    StackKind::R8 => IrOp::AddR8,
                    StackKind::Vt => return None,
                })
            })?,
            O::Sub => self.binary_op(instr, |k| {
                Some(match k {
                    StackKind::I4 => IrOp::SubI4,
                    StackKind::I8 => IrOp::SubI8,
                    StackKind::R4 => IrOp::SubR4,
                    StackKind::R8 => IrOp::SubR8,
                    StackKind::Vt => return None,
                })
            })?,
            O::Mul => self.binary_op(instr, |k| {
                Some(match k {
                    StackKind::I4 => IrOp::MulI4,
                    StackKind::I8 => IrOp::MulI8,
                    StackKind::R4 => IrOp::MulR4,
                    StackKind::R8 => IrOp::MulR8,
                    StackKind::Vt => return None,
                })
            })?,
            O::Div => self.binary_op(instr, |k| {
                Some(match k {
                    StackKind::I4 => IrOp::DivI4,
                    StackKind::I8 => IrOp::DivI8,
                    StackKind::R4 => IrOp::DivR4,
                    StackKind::R8 => IrOp::DivR8,
                    StackKind::Vt => return None,
                })
            })?,
            O::DivUn => self.binary_op(instr, |k| match k {
                StackKind::I4 => Some(IrOp::DivUnI4),
                StackKind::I8 => Some(IrOp::DivUnI8),
                _ => None,
            })?,
            O::Rem => self.binary_op(instr, |k| {
                Some(match k {
                    StackKind::I4 => IrOp::RemI4,
                    StackKind::I8 => IrOp::RemI8,
                    StackKind::R4 => IrOp::RemR4,
                    StackKind::R8 => IrOp::RemR8,
                    StackKind::Vt => return None,
                })
            })?,
            O::RemUn => self.binary_op(instr, |k| match k {
                StackKind::I4 => Some(IrOp::RemUnI4),
                StackKind::I8 => Some(IrOp::RemUnI8),
                _ => None,
            })?,
            O::And => self.binary_op(instr, |k| match k {
                StackKind::I4 => Some(IrOp::AndI4),
                StackKind::I8 => Some(IrOp::AndI8),
                _ => None,
            })?,
            O::Or => self.binary_op(instr, |k| match k {
                StackKind::I4 => Some(IrOp::OrI4),
                StackKind::I8 => Some(IrOp::OrI8),
                _ => None,
            })?,
            O::Xor => self.binary_op(instr, |k| match k {
                StackKind::I4 => Some(IrOp::XorI4),
                StackKind::I8 => Some(IrOp::XorI8),
                _ => None,
            })?,
            O::Shl | O::Shr | O::ShrUn => {
                // Shift counts stay i4; no widening between the operands.
                let b = self.pop(off)?;
                let a = self.pop(off)?;
                let op = match (instr.op, a.kind) {
                    (O::Shl, StackKind::I4) => IrOp::ShlI4,
                    (O::Shl, StackKind::I8) => IrOp::ShlI8,
                    (O::Shr, StackKind::I4) => IrOp::ShrI4,
                    (O::Shr, StackKind::I8) => IrOp::ShrI8,
                    (O::ShrUn, StackKind::I4) => IrOp::ShrUnI4,
                    (O::ShrUn, StackKind::I8) => IrOp::ShrUnI8,
                    _ => return Err(EmitError::OperandMismatch { offset: off, op: instr.op }),
                };
                let dst = self.stack.push(a.kind, a.size);
                self.emit(IrInstr { op, dst: dst.slot(), a: a.slot(), b: b.slot(), imm: 0 });
            }
            O::Neg => self.unary_op(instr, |k| {
                Some(match k {
                    StackKind::I4 => IrOp::NegI4,
                    StackKind::I8 => IrOp::NegI8,
                    StackKind::R4 => IrOp::NegR4,
                    StackKind::R8 => IrOp::NegR8,
                    StackKind::Vt => return None,
                })
            })?,
            O::Not => self.unary_op(instr, |k| match k {
                StackKind::I4 => Some(IrOp::NotI4),
                StackKind::I8 => Some(IrOp::NotI8),
                _ => None,
            })?,

            // --- overflow arithmetic ---
            O::AddOvf => self.binary_op(instr, |k| match k {
                StackKind::I4 => Some(IrOp::AddOvfI4),
                StackKind::I8 => Some(IrOp::AddOvfI8),
                _ => None,
            })?,
            O::AddOvfUn => self.binary_op(instr, |k| match k {
                StackKind::I4 => Some(IrOp::AddOvfUnI4),
                StackKind::I8 => Some(IrOp::AddOvfUnI8),
                _ => None,
            })?,
            O::SubOvf => self.binary_op(instr, |k| match k {
                StackKind::I4 => Some(IrOp::SubOvfI4),
                StackKind::I8 => Some(IrOp::SubOvfI8),
                _ => None,
            })?,
            O::SubOvfUn => self.binary_op(instr, |k| match k {
                StackKind::I4 => Some(IrOp::SubOvfUnI4),
                StackKind::I8 => Some(IrOp::SubOvfUnI8),
                _ => None,
            })?,
            O::MulOvf => self.binary_op(instr, |k| match k {
                StackKind::I4 => Some(IrOp::MulOvfI4),
                StackKind::I8 => Some(IrOp::MulOvfI8),
                _ => None,
            })?,
            O::MulOvfUn => self.binary_op(instr, |k| match k {
                StackKind::I4 => Some(IrOp::MulOvfUnI4),
                StackKind::I8 => Some(IrOp::MulOvfUnI8),
                _ => None,
            })?,

            // --- comparisons ---
            O::Ceq => self.compare_op(instr, |k| {
                Some(match k {
                    StackKind::I4 => IrOp::CeqI4,
                    StackKind::I8 => IrOp::CeqI8,
                    StackKind::R4 => IrOp::CeqR4,
                    StackKind::R8 => IrOp::CeqR8,
                    StackKind::Vt => return None,
                })
            })?,
            O::Cgt => self.compare_op(instr, |k| {
                Some(match k {
                    StackKind::I4 => IrOp::CgtI4,
                    StackKind::I8 => IrOp::CgtI8,
                    StackKind::R4 => IrOp::CgtR4,
                    StackKind::R8 => IrOp::CgtR8,
                    StackKind::Vt => return None,
                })
            })?,
            O::CgtUn => self.compare_op(instr, |k| {
                Some(match k {
                    StackKind::I4 => IrOp::CgtUnI4,
                    StackKind::I8 => IrOp::CgtUnI8,
                    StackKind::R4 => IrOp::CgtUnR4,
                    StackKind::R8 => IrOp::CgtUnR8,
                    StackKind::Vt => return None,
                })
            })?,
            O::Clt => self.compare_op(instr, |k| {
                Some(match k {
                    StackKind::I4 => IrOp::CltI4,
                    StackKind::I8 => IrOp::CltI8,
                    StackKind::R4 => IrOp::CltR4,
                    StackKind::R8 => IrOp::CltR8,
                    StackKind::Vt => return None,
                })
            })?,
            O::CltUn => self.compare_op(instr, |k| {
                Some(match k {
                    StackKind::I4 => IrOp::CltUnI4,
                    StackKind::I8 => IrOp::CltUnI8,
                    StackKind::R4 => IrOp::CltUnR4,
                    StackKind::R8 => IrOp::CltUnR8,
                    StackKind::Vt => return None,
                })
            })?,

            // --- branches ---
            O::Br | O::BrS => {
                let target = instr
                    .branch_target()
                    .ok_or(EmitError::OperandMismatch { offset: off, op: instr.op })?;
                self.record_flow(target, self.stack.snapshot())?;
                self.emit_pending_branch(IrOp::Br, 0, target);
                return Ok(false);
            }
            O::Brtrue | O::BrtrueS | O::Brfalse | O::BrfalseS => {
                let target = instr
                    .branch_target()
                    .ok_or(EmitError::OperandMismatch { offset: off, op: instr.op })?;
                let cond = self.pop(off)?;
                let true_branch = matches!(instr.op, O::Brtrue | O::BrtrueS);
                let op = match (cond.kind, true_branch) {
                    (StackKind::I4, true) => IrOp::BrTrueI4,
                    (StackKind::I4, false) => IrOp::BrFalseI4,
                    (StackKind::I8, true) => IrOp::BrTrueI8,
                    (StackKind::I8, false) => IrOp::BrFalseI8,
                    _ => return Err(EmitError::OperandMismatch { offset: off, op: instr.op }),
                };
                self.record_flow(target, self.stack.snapshot())?;
                self.emit_pending_branch(op, cond.slot(), target);
            }
            O::Beq | O::BeqS | O::Bge | O::BgeS | O::Bgt | O::BgtS | O::Ble | O::BleS
            | O::Blt | O::BltS | O::BneUn | O::BneUnS | O::BgeUn | O::BgeUnS | O::BgtUn
            | O::BgtUnS | O::BleUn | O::BleUnS | O::BltUn | O::BltUnS => {
                self.emit_compare_branch(instr)?;
            }
            O::Switch => {
                let targets = match &instr.operand {
                    Operand::Targets(t) => t.clone(),
                    _ => return Err(EmitError::OperandMismatch { offset: off, op: instr.op }),
                };
                let sel = self.pop(off)?;
                if sel.kind != StackKind::I4 {
                    return Err(EmitError::OperandMismatch { offset: off, op: instr.op });
                }
                let shape = self.stack.snapshot();
                for &t in &targets {
                    self.record_flow(t, shape.clone())?;
                }
                let ridx = self.intern(ResolveEntry::SwitchTable(Vec::new()));
                self.pending_switches.push((ridx as usize, targets));
                self.emit(IrInstr { op: IrOp::Switch, dst: 0, a: ridx, b: sel.slot(), imm: 0 });
            }

            // --- conversions ---
            O::ConvI1 | O::ConvI2 | O::ConvI4 | O::ConvI8 | O::ConvR4 | O::ConvR8
            | O::ConvU1 | O::ConvU2 | O::ConvU4 | O::ConvU8 | O::ConvI | O::ConvU => {
                self.emit_conv(instr)?;
            }
            O::ConvOvfI1 | O::ConvOvfU1 | O::ConvOvfI2 | O::ConvOvfU2 | O::ConvOvfI4
            | O::ConvOvfU4 | O::ConvOvfI8 | O::ConvOvfU8 => {
                self.emit_conv_ovf(instr)?;
            }

            // --- indirect access ---
            O::LdindI1 | O::LdindU1 | O::LdindI2 | O::LdindU2 | O::LdindI4 | O::LdindU4
            | O::LdindI8 | O::LdindI | O::LdindR4 | O::LdindR8 | O::LdindRef => {
                let addr = self.pop(off)?;
                let (op, kind, size) = match instr.op {
                    O::LdindI1 => (IrOp::LdIndI1, StackKind::I4, 4),
                    O::LdindU1 => (IrOp::LdIndU1, StackKind::I4, 4),
                    O::LdindI2 => (IrOp::LdIndI2, StackKind::I4, 4),
                    O::LdindU2 => (IrOp::LdIndU2, StackKind::I4, 4),
                    O::LdindI4 => (IrOp::LdIndI4, StackKind::I4, 4),
                    O::LdindU4 => (IrOp::LdIndU4, StackKind::I4, 4),
                    O::LdindR4 => (IrOp::LdIndR4, StackKind::R4, 4),
                    O::LdindR8 => (IrOp::LdIndR8, StackKind::R8, 8),
                    _ => (IrOp::LdIndI8, StackKind::I8, 8),
                };
                let dst = self.stack.push(kind, size);
                self.emit(IrInstr { op, dst: dst.slot(), a: addr.slot(), b: 0, imm: 0 });
            }
            O::StindI1 | O::StindI2 | O::StindI4 | O::StindI8 | O::StindI | O::StindR4
            | O::StindR8 | O::StindRef => {
                let val = self.pop(off)?;
                let addr = self.pop(off)?;
                let op = match instr.op {
                    O::StindI1 => IrOp::StIndI1,
                    O::StindI2 => IrOp::StIndI2,
                    O::StindI4 => IrOp::StIndI4,
                    O::StindR4 => IrOp::StIndR4,
                    O::StindR8 => IrOp::StIndR8,
                    _ => IrOp::StIndI8,
                };
                self.emit(IrInstr { op, dst: 0, a: addr.slot(), b: val.slot(), imm: 0 });
            }
            O::Ldobj => {
                let ty = self.type_token(instr)?;
                self.emit_ldobj(off, ty)?;
            }
            O::Stobj => {
                let ty = self.type_token(instr)?;
                self.emit_stobj(off, ty)?;
            }
            O::Initobj => {
                let ty = self.type_token(instr)?;
                let size = self.store.type_desc(ty).map(|d| d.size).unwrap_or(8);
                let addr = self.pop(off)?;
                self.emit(IrInstr {
                    op: IrOp::InitBlk,
                    dst: 0,
                    a: addr.slot(),
                    b: 0,
                    imm: size as i64,
                });
            }
            O::Sizeof => {
                let ty = self.type_token(instr)?;
                let size = self.store.type_desc(ty).map(|d| d.size).unwrap_or(8);
                self.emit_ldc_i4(size as i64);
            }

            // --- fields ---
            O::Ldfld => self.emit_ldfld(instr)?,
            O::Stfld => self.emit_stfld(instr)?,
            O::Ldflda => {
                let (_, fd) = self.field_of(instr)?;
                let offset = fd.offset;
                let obj = self.receiver_slot(off)?;
                let dst = self.stack.push(StackKind::I8, 8);
                self.emit(IrInstr {
                    op: IrOp::LdFldAddr,
                    dst: dst.slot(),
                    a: obj,
                    b: offset,
                    imm: 0,
                });
            }
            O::Ldsfld | O::Ldsflda | O::Stsfld => self.emit_static(instr)?,

            // --- object model ---
            O::Castclass | O::Isinst => {
                let ty = self.type_token(instr)?;
                let ridx = self.intern(ResolveEntry::TypeTok(ty));
                let obj = self.pop(off)?;
                let dst = self.stack.push(StackKind::I8, 8);
                let op = if instr.op == O::Castclass { IrOp::CastClass } else { IrOp::IsInst };
                self.emit(IrInstr { op, dst: dst.slot(), a: obj.slot(), b: ridx, imm: 0 });
            }
            O::Newobj => self.emit_newobj(instr)?,
            O::Call => {
                self.emit_call(instr, false)?;
            }
            O::Callvirt => {
                self.emit_call(instr, true)?;
            }

            // --- arrays ---
            O::Newarr => {
                let ty = self.type_token(instr)?;
                let elem_size = self.store.type_desc(ty).map(|d| d.size).unwrap_or(8);
                let ridx = self.intern(ResolveEntry::TypeTok(ty));
                let len = self.pop(off)?;
                let dst = self.stack.push(StackKind::I8, 8);
                self.emit(IrInstr {
                    op: IrOp::NewArr,
                    dst: dst.slot(),
                    a: ridx,
                    b: len.slot(),
                    imm: elem_size as i64,
                });
            }
            O::Ldlen => {
                let arr = self.pop(off)?;
                let dst = self.stack.push(StackKind::I8, 8);
                self.emit(IrInstr { op: IrOp::LdLen, dst: dst.slot(), a: arr.slot(), b: 0, imm: 0 });
            }
            O::LdelemI1 | O::LdelemU1 | O::LdelemI2 | O::LdelemU2 | O::LdelemI4
            | O::LdelemU4 | O::LdelemI8 | O::LdelemI | O::LdelemR4 | O::LdelemR8
            | O::LdelemRef => {
                let idx = self.pop(off)?;
                let arr = self.pop(off)?;
                let (op, kind, size) = match instr.op {
                    O::LdelemI1 => (IrOp::LdElemI1, StackKind::I4, 4),
                    O::LdelemU1 => (IrOp::LdElemU1, StackKind::I4, 4),
                    O::LdelemI2 => (IrOp::LdElemI2, StackKind::I4, 4),
                    O::LdelemU2 => (IrOp::LdElemU2, StackKind::I4, 4),
                    O::LdelemI4 => (IrOp::LdElemI4, StackKind::I4, 4),
                    O::LdelemU4 => (IrOp::LdElemU4, StackKind::I4, 4),
                    O::LdelemR4 => (IrOp::LdElemR4, StackKind::R4, 4),
                    O::LdelemR8 => (IrOp::LdElemR8, StackKind::R8, 8),
                    _ => (IrOp::LdElemI8, StackKind::I8, 8),
                };
                let dst = self.stack.push(kind, size);
                self.emit(IrInstr { op, dst: dst.slot(), a: arr.slot(), b: idx.slot(), imm: 0 });
            }
            O::Ldelem => {
                let ty = self.type_token(instr)?;
                let idx = self.pop(off)?;
                let arr = self.pop(off)?;
                let (kind, size) = StackKind::reduce(self.store, ty);
                let (op, imm) = self.elem_load_op(ty, size);
                let dst = self.stack.push(kind, size);
                self.emit(IrInstr { op, dst: dst.slot(), a: arr.slot(), b: idx.slot(), imm });
            }
            O::StelemI | O::StelemI1 | O::StelemI2 | O::StelemI4 | O::StelemI8
            | O::StelemR4 | O::StelemR8 | O::StelemRef => {
                let val = self.pop(off)?;
                let idx = self.pop(off)?;
                let arr = self.pop(off)?;
                let op = match instr.op {
                    O::StelemI1 => IrOp::StElemI1,
                    O::StelemI2 => IrOp::StElemI2,
                    O::StelemI4 => IrOp::StElemI4,
                    O::StelemR4 => IrOp::StElemR4,
                    O::StelemR8 => IrOp::StElemR8,
                    _ => IrOp::StElemI8,
                };
                self.emit(IrInstr {
                    op,
                    dst: val.slot(),
                    a: arr.slot(),
                    b: idx.slot(),
                    imm: 0,
                });
            }
            O::Stelem => {
                let ty = self.type_token(instr)?;
                let size = self.store.type_desc(ty).map(|d| d.size).unwrap_or(8);
                let val = self.pop(off)?;
                let idx = self.pop(off)?;
                let arr = self.pop(off)?;
                self.emit(IrInstr {
                    op: IrOp::StElemBlk,
                    dst: val.slot(),
                    a: arr.slot(),
                    b: idx.slot(),
                    imm: size as i64,
                });
            }

            // --- exception flow ---
            O::Throw => {
                let obj = self.pop(off)?;
                self.emit(IrInstr { op: IrOp::Throw, dst: 0, a: obj.slot(), b: 0, imm: 0 });
                self.stack.clear();
                return Ok(false);
            }
            O::Rethrow => {
                self.emit(IrInstr::new(IrOp::Rethrow));
                self.stack.clear();
                return Ok(false);
            }
            O::Leave | O::LeaveS => {
                let target = instr
                    .branch_target()
                    .ok_or(EmitError::OperandMismatch { offset: off, op: instr.op })?;
                self.emit_leave(off, target)?;
                return Ok(false);
            }
            O::Endfinally => {
                self.emit(IrInstr::new(IrOp::EndFinally));
                self.stack.clear();
                return Ok(false);
            }
            O::Endfilter => {
                let result = self.pop(off)?;
                self.emit(IrInstr {
                    op: IrOp::EndFilter,
                    dst: 0,
                    a: result.slot(),
                    b: 0,
                    imm: 0,
                });
                self.stack.clear();
                return Ok(false);
            }

            O::Ret => {
                match self.desc.ret {
                    None => {
                        self.emit(IrInstr::new(IrOp::RetVoid));
                    }
                    Some(t) => {
                        let v = self.pop(off)?;
                        let (_, size) = StackKind::reduce(self.store, t);
                        self.emit(IrInstr {
                            op: IrOp::Ret,
                            dst: 0,
                            a: v.slot(),
                            b: 0,
                            imm: size as i64,
                        });
                    }
                }
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn emit_ldc_i4(&mut self, v: i64) {
        let dst = self.stack.push(StackKind::I4, 4);
        self.emit(IrInstr { op: IrOp::LdcI4, dst: dst.slot(), a: 0, b: 0, imm: v });
    }

    fn emit_ldarg(&mut self, off: u32, instr: &IlInstr, i: usize) -> EmitResult<()> {
        let arg = *self
            .args
            .get(i)
            .ok_or(EmitError::OperandMismatch { offset: off, op: instr.op })?;
        let ty = self.desc.params[i];
        let (kind, size) = StackKind::reduce(self.store, ty);
        let dst = self.stack.push(kind, size);
        self.emit_copy(dst.slot(), arg.offset / 8, size.max(8));
        Ok(())
    }

    fn emit_starg(&mut self, off: u32, instr: &IlInstr, i: usize) -> EmitResult<()> {
        let arg = *self
            .args
            .get(i)
            .ok_or(EmitError::OperandMismatch { offset: off, op: instr.op })?;
        let v = self.pop(off)?;
        self.emit_copy(arg.offset / 8, v.slot(), v.size.max(8));
        Ok(())
    }

    fn emit_ldloc(&mut self, off: u32, instr: &IlInstr, i: usize) -> EmitResult<()> {
        let (slot, size, kind) = self
            .locals
            .get(i)
            .map(|l| (l.offset / 8, l.size, l.kind))
            .ok_or(EmitError::OperandMismatch { offset: off, op: instr.op })?;
        let dst = self.stack.push(kind, size);
        self.emit_copy(dst.slot(), slot, size.max(8));
        Ok(())
    }

    fn emit_stloc(&mut self, off: u32, instr: &IlInstr, i: usize) -> EmitResult<()> {
        let (slot, size) = self
            .locals
            .get(i)
            .map(|l| (l.offset / 8, l.size))
            .ok_or(EmitError::OperandMismatch { offset: off, op: instr.op })?;
        let v = self.pop(off)?;
        self.emit_copy(slot, v.slot(), size.max(8));
        Ok(())
    }

    /// Lower a compare-and-branch pair: emit the comparison, then the
    /// conditional jump on its result.
    fn emit_compare_branch(&mut self, instr: &IlInstr) -> EmitResult<()> {
        use IlOp as O;
        let off = instr.offset;
        let target = instr
            .branch_target()
            .ok_or(EmitError::OperandMismatch { offset: off, op: instr.op })?;
        let b = self.pop(off)?;
        let a = self.pop(off)?;
        let kind = self.unify(a, b, instr)?;
        let float = matches!(kind, StackKind::R4 | StackKind::R8);

        // (comparison, branch on true?) — float ge/le flip the unordered
        // variant so a NaN operand falls through like the source does.
        let (cmp, on_true) = match instr.op {
            O::Beq | O::BeqS => (Cmp::Eq, true),
            O::BneUn | O::BneUnS => (Cmp::Eq, false),
            O::Bgt | O::BgtS => (Cmp::Gt, true),
            O::BgtUn | O::BgtUnS => (Cmp::GtUn, true),
            O::Blt | O::BltS => (Cmp::Lt, true),
            O::BltUn | O::BltUnS => (Cmp::LtUn, true),
            O::Bge | O::BgeS => (if float { Cmp::LtUn } else { Cmp::Lt }, false),
            O::BgeUn | O::BgeUnS => (if float { Cmp::Lt } else { Cmp::LtUn }, false),
            O::Ble | O::BleS => (if float { Cmp::GtUn } else { Cmp::Gt }, false),
            O::BleUn | O::BleUnS => (if float { Cmp::Gt } else { Cmp::GtUn }, false),
            _ => return Err(EmitError::OperandMismatch { offset: off, op: instr.op }),
        };
        let cmp_op = cmp
            .select(kind)
            .ok_or(EmitError::OperandMismatch { offset: off, op: instr.op })?;

        // The comparison result is transient; it lives in the slot just
        // above the current stack top.
        let scratch = self.stack.push(StackKind::I4, 4);
        self.emit(IrInstr {
            op: cmp_op,
            dst: scratch.slot(),
            a: a.slot(),
            b: b.slot(),
            imm: 0,
        });
        self.pop(off)?;

        self.record_flow(target, self.stack.snapshot())?;
        let br = if on_true { IrOp::BrTrueI4 } else { IrOp::BrFalseI4 };
        self.emit_pending_branch(br, scratch.slot(), target);
        Ok(())
    }

    fn emit_conv(&mut self, instr: &IlInstr) -> EmitResult<()> {
        use IlOp as O;
        use StackKind as K;
        let off = instr.offset;
        let a = self.pop(off)?;
        let src = a.slot();

        // (ops to emit, result kind)
        let mut seq: SmallVec<[IrOp; 2]> = SmallVec::new();
        let result: (K, u32) = match (instr.op, a.kind) {
            (O::ConvI1, K::I4) => {
                seq.push(IrOp::SxI1);
                (K::I4, 4)
            }
            (O::ConvI1, K::I8) => {
                seq.push(IrOp::TruncI8);
                seq.push(IrOp::SxI1);
                (K::I4, 4)
            }
            (O::ConvI2, K::I4) => {
                seq.push(IrOp::SxI2);
                (K::I4, 4)
            }
            (O::ConvI2, K::I8) => {
                seq.push(IrOp::TruncI8);
                seq.push(IrOp::SxI2);
                (K::I4, 4)
            }
            (O::ConvU1, K::I4) => {
                seq.push(IrOp::ZxU1);
                (K::I4, 4)
            }
            (O::ConvU1, K::I8) => {
                seq.push(IrOp::TruncI8);
                seq.push(IrOp::ZxU1);
                (K::I4, 4)
            }
            (O::ConvU2, K::I4) => {
                seq.push(IrOp::ZxU2);
                (K::I4, 4)
            }
            (O::ConvU2, K::I8) => {
                seq.push(IrOp::TruncI8);
                seq.push(IrOp::ZxU2);
                (K::I4, 4)
            }
            (O::ConvI4 | O::ConvU4, K::I4) => (K::I4, 4),
            (O::ConvI4 | O::ConvU4, K::I8) => {
                seq.push(IrOp::TruncI8);
                (K::I4, 4)
            }
            (O::ConvI4, K::R4) => {
                seq.push(IrOp::R4ToI4);
                (K::I4, 4)
            }
            (O::ConvI4 | O::ConvU4, K::R8) => {
                seq.push(IrOp::R8ToI4);
                (K::I4, 4)
            }
            (O::ConvU4, K::R4) => {
                seq.push(IrOp::R4ToI4);
                (K::I4, 4)
            }
            (O::ConvI8 | O::ConvI, K::I4) => {
                seq.push(IrOp::SxI4);
                (K::I8, 8)
            }
            (O::ConvU8 | O::ConvU, K::I4) => {
                seq.push(IrOp::ZxU4);
                (K::I8, 8)
            }
            (O::ConvI8 | O::ConvU8 | O::ConvI | O::ConvU, K::I8) => (K::I8, 8),
            (O::ConvI8 | O::ConvI | O::ConvU8 | O::ConvU, K::R4) => {
                seq.push(IrOp::R4ToI8);
                (K::I8, 8)
            }
            (O::ConvI8 | O::ConvI | O::ConvU8 | O::ConvU, K::R8) => {
                seq.push(IrOp::R8ToI8);
                (K::I8, 8)
            }
            (O::ConvI1 | O::ConvI2 | O::ConvU1 | O::ConvU2, K::R4 | K::R8) => {
                seq.push(if a.kind == K::R4 { IrOp::R4ToI4 } else { IrOp::R8ToI4 });
                seq.push(match instr.op {
                    O::ConvI1 => IrOp::SxI1,
                    O::ConvI2 => IrOp::SxI2,
                    O::ConvU1 => IrOp::ZxU1,
                    _ => IrOp::ZxU2,
                });
                (K::I4, 4)
            }
            (O::ConvR4, K::I4) => {
                seq.push(IrOp::I4ToR4);
                (K::R4, 4)
            }
            (O::ConvR4, K::I8) => {
                seq.push(IrOp::I8ToR4);
                (K::R4, 4)
            }
            (O::ConvR4, K::R4) => (K::R4, 4),
            (O::ConvR4, K::R8) => {
                seq.push(IrOp::R8ToR4);
                (K::R4, 4)
            }
            (O::ConvR8, K::I4) => {
                seq.push(IrOp::I4ToR8);
                (K::R8, 8)
            }
            (O::ConvR8, K::I8) => {
                seq.push(IrOp::I8ToR8);
                (K::R8, 8)
            }
            (O::ConvR8, K::R4) => {
                seq.push(IrOp::R4ToR8);
                (K::R8, 8)
            }
            (O::ConvR8, K::R8) => (K::R8, 8),
            _ => return Err(EmitError::OperandMismatch { offset: off, op: instr.op }),
        };

        let dst = self.stack.push(result.0, result.1);
        let mut cur = src;
        for op in seq {
            self.emit(IrInstr { op, dst: dst.slot(), a: cur, b: 0, imm: 0 });
            cur = dst.slot();
        }
        if cur != dst.slot() {
            // Identity conversion: result stays where it was, but the new
            // stack entry owns a fresh slot.
            self.emit(IrInstr { op: IrOp::Mov, dst: dst.slot(), a: src, b: 0, imm: 0 });
        }
        Ok(())
    }

    fn emit_conv_ovf(&mut self, instr: &IlInstr) -> EmitResult<()> {
        use IlOp as O;
        use StackKind as K;
        let off = instr.offset;
        let a = self.pop(off)?;

        let (width, signed) = match instr.op {
            O::ConvOvfI1 => (1u32, true),
            O::ConvOvfU1 => (1, false),
            O::ConvOvfI2 => (2, true),
            O::ConvOvfU2 => (2, false),
            O::ConvOvfI4 => (4, true),
            O::ConvOvfU4 => (4, false),
            O::ConvOvfI8 => (8, true),
            O::ConvOvfU8 => (8, false),
            _ => return Err(EmitError::OperandMismatch { offset: off, op: instr.op }),
        };
        let imm = pack2(width, signed as u32);
        let result_kind = if width == 8 { K::I8 } else { K::I4 };
        let result_size = if width == 8 { 8 } else { 4 };

        let dst = self.stack.push(result_kind, result_size);
        match a.kind {
            K::I4 => {
                self.emit(IrInstr { op: IrOp::ConvOvfI4, dst: dst.slot(), a: a.slot(), b: 0, imm });
            }
            K::I8 => {
                self.emit(IrInstr { op: IrOp::ConvOvfI8, dst: dst.slot(), a: a.slot(), b: 0, imm });
            }
            K::R4 => {
                self.emit(IrInstr {
                    op: IrOp::R4ToR8,
                    dst: a.slot(),
                    a: a.slot(),
                    b: 0,
                    imm: 0,
                });
                self.emit(IrInstr { op: IrOp::ConvOvfR8, dst: dst.slot(), a: a.slot(), b: 0, imm });
            }
            K::R8 => {
                self.emit(IrInstr { op: IrOp::ConvOvfR8, dst: dst.slot(), a: a.slot(), b: 0, imm });
            }
            K::Vt => return Err(EmitError::OperandMismatch { offset: off, op: instr.op }),
        }
        Ok(())
    }

    fn emit_ldobj(&mut self, off: u32, ty: TypeToken) -> EmitResult<()> {
        let desc = self
            .store
            .type_desc(ty)
            .ok_or(EmitError::UnknownToken { offset: off, token: ty.0 })?;
        let addr = self.pop(off)?;
        if let Some(prim) = desc.prim {
            let (op, kind, size) = prim_load(prim);
            let dst = self.stack.push(kind, size);
            self.emit(IrInstr { op, dst: dst.slot(), a: addr.slot(), b: 0, imm: 0 });
        } else {
            let (kind, size) = StackKind::reduce(self.store, ty);
            let dst = self.stack.push(kind, size);
            self.emit(IrInstr {
                op: IrOp::LdBlk,
                dst: dst.slot(),
                a: addr.slot(),
                b: 0,
                imm: desc.size as i64,
            });
        }
        Ok(())
    }

    fn emit_stobj(&mut self, off: u32, ty: TypeToken) -> EmitResult<()> {
        let desc = self
            .store
            .type_desc(ty)
            .ok_or(EmitError::UnknownToken { offset: off, token: ty.0 })?;
        let val = self.pop(off)?;
        let addr = self.pop(off)?;
        if let Some(prim) = desc.prim {
            let op = prim_store(prim);
            self.emit(IrInstr { op, dst: 0, a: addr.slot(), b: val.slot(), imm: 0 });
        } else {
            self.emit(IrInstr {
                op: IrOp::StBlk,
                dst: 0,
                a: addr.slot(),
                b: val.slot(),
                imm: desc.size as i64,
            });
        }
        Ok(())
    }

    /// Pop a field receiver, materializing an address when the receiver
    /// is a by-value aggregate sitting on the stack.
    fn receiver_slot(&mut self, off: u32) -> EmitResult<u32> {
        let top = self.pop(off)?;
        if top.kind == StackKind::Vt {
            let dst = self.stack.push(StackKind::I8, 8);
            self.emit(IrInstr {
                op: IrOp::SlotAddr,
                dst: dst.slot(),
                a: top.slot(),
                b: 0,
                imm: 0,
            });
            let addr = self.pop(off)?;
            Ok(addr.slot())
        } else {
            Ok(top.slot())
        }
    }

    fn emit_ldfld(&mut self, instr: &IlInstr) -> EmitResult<()> {
        let off = instr.offset;
        let (_, fd) = self.field_of(instr)?;
        let (ty, foffset) = (fd.ty, fd.offset);
        let fdesc = self
            .store
            .type_desc(ty)
            .ok_or(EmitError::UnknownToken { offset: off, token: ty.0 })?;
        let prim = if fdesc.is_enum { fdesc.underlying } else { fdesc.prim };
        let size = fdesc.size;
        let obj = self.receiver_slot(off)?;
        let (kind, push_size) = StackKind::reduce(self.store, ty);
        let dst = self.stack.push(kind, push_size);

        match prim {
            Some(p) => {
                let op = match p {
                    PrimKind::I1 => IrOp::LdFldI1,
                    PrimKind::U1 | PrimKind::Bool => IrOp::LdFldU1,
                    PrimKind::I2 => IrOp::LdFldI2,
                    PrimKind::U2 | PrimKind::Char => IrOp::LdFldU2,
                    PrimKind::I4 | PrimKind::U4 => IrOp::LdFldI4,
                    PrimKind::I8 | PrimKind::U8 | PrimKind::IntPtr => IrOp::LdFldI8,
                    PrimKind::R4 => IrOp::LdFldR4,
                    PrimKind::R8 => IrOp::LdFldR8,
                };
                self.emit(IrInstr { op, dst: dst.slot(), a: obj, b: foffset, imm: 0 });
            }
            None if size <= 8 && !fdesc.is_value_type => {
                self.emit(IrInstr {
                    op: IrOp::LdFldI8,
                    dst: dst.slot(),
                    a: obj,
                    b: foffset,
                    imm: 0,
                });
            }
            None => {
                self.emit(IrInstr {
                    op: IrOp::LdFldBlk,
                    dst: dst.slot(),
                    a: obj,
                    b: foffset,
                    imm: size as i64,
                });
            }
        }
        Ok(())
    }

    fn emit_stfld(&mut self, instr: &IlInstr) -> EmitResult<()> {
        let off = instr.offset;
        let (_, fd) = self.field_of(instr)?;
        let (ty, foffset) = (fd.ty, fd.offset);
        let fdesc = self
            .store
            .type_desc(ty)
            .ok_or(EmitError::UnknownToken { offset: off, token: ty.0 })?;
        let prim = if fdesc.is_enum { fdesc.underlying } else { fdesc.prim };
        let size = fdesc.size;

        let val = self.pop(off)?;
        let obj = self.receiver_slot(off)?;

        match prim {
            Some(p) => {
                let op = match p {
                    PrimKind::I1 | PrimKind::U1 | PrimKind::Bool => IrOp::StFldI1,
                    PrimKind::I2 | PrimKind::U2 | PrimKind::Char => IrOp::StFldI2,
                    PrimKind::I4 | PrimKind::U4 => IrOp::StFldI4,
                    PrimKind::I8 | PrimKind::U8 | PrimKind::IntPtr => IrOp::StFldI8,
                    PrimKind::R4 => IrOp::StFldR4,
                    PrimKind::R8 => IrOp::StFldR8,
                };
                self.emit(IrInstr {
                    op,
                    dst: 0,
                    a: obj,
                    b: val.slot(),
                    imm: foffset as i64,
                });
            }
            None if size <= 8 && !fdesc.is_value_type => {
                self.emit(IrInstr {
                    op: IrOp::StFldI8,
                    dst: 0,
                    a: obj,
                    b: val.slot(),
                    imm: foffset as i64,
                });
            }
            None => {
                self.emit(IrInstr {
                    op: IrOp::StFldBlk,
                    dst: 0,
                    a: obj,
                    b: val.slot(),
                    imm: pack2(foffset, size),
                });
            }
        }
        Ok(())
    }

    /// Static field access: regular statics resolve to a pinned address
    /// at translation time, thread statics go through per-thread storage.
    fn emit_static(&mut self, instr: &IlInstr) -> EmitResult<()> {
        use IlOp as O;
        let off = instr.offset;
        let (field, fd) = self.field_of(instr)?;
        let (ty, thread_static) = (fd.ty, fd.is_thread_static);
        let fdesc = self
            .store
            .type_desc(ty)
            .ok_or(EmitError::UnknownToken { offset: off, token: ty.0 })?;
        let prim = if fdesc.is_enum { fdesc.underlying } else { fdesc.prim };
        let size = fdesc.size;

        // Address on the transient top of stack.
        let addr = if thread_static {
            let ridx = self.intern(ResolveEntry::FieldTok(field));
            let dst = self.stack.push(StackKind::I8, 8);
            self.emit(IrInstr {
                op: IrOp::TlsAddr,
                dst: dst.slot(),
                a: ridx,
                b: 0,
                imm: size as i64,
            });
            dst
        } else {
            let raw = self
                .store
                .static_addr(field)
                .ok_or(EmitError::UnknownToken { offset: off, token: field.0 })?;
            let dst = self.stack.push(StackKind::I8, 8);
            self.emit(IrInstr {
                op: IrOp::LdcI8,
                dst: dst.slot(),
                a: 0,
                b: 0,
                imm: raw as i64,
            });
            dst
        };

        match instr.op {
            O::Ldsflda => {
                // The address itself is the result; it is already pushed.
            }
            O::Ldsfld => {
                self.pop(off)?;
                let (kind, push_size) = StackKind::reduce(self.store, ty);
                let dst = self.stack.push(kind, push_size);
                match prim {
                    Some(p) => {
                        let (op, _, _) = prim_load(p);
                        self.emit(IrInstr { op, dst: dst.slot(), a: addr.slot(), b: 0, imm: 0 });
                    }
                    None if size <= 8 => {
                        self.emit(IrInstr {
                            op: IrOp::LdIndI8,
                            dst: dst.slot(),
                            a: addr.slot(),
                            b: 0,
                            imm: 0,
                        });
                    }
                    None => {
                        self.emit(IrInstr {
                            op: IrOp::LdBlk,
                            dst: dst.slot(),
                            a: addr.slot(),
                            b: 0,
                            imm: size as i64,
                        });
                    }
                }
            }
            O::Stsfld => {
                let addr_entry = self.pop(off)?;
                let val = self.pop(off)?;
                // Re-emit the address computation above the value so the
                // store reads both operands from live slots.
                let _ = addr_entry;
                match prim {
                    Some(p) => {
                        let op = prim_store(p);
                        self.emit(IrInstr {
                            op,
                            dst: 0,
                            a: addr.slot(),
                            b: val.slot(),
                            imm: 0,
                        });
                    }
                    None if size <= 8 => {
                        self.emit(IrInstr {
                            op: IrOp::StIndI8,
                            dst: 0,
                            a: addr.slot(),
                            b: val.slot(),
                            imm: 0,
                        });
                    }
                    None => {
                        self.emit(IrInstr {
                            op: IrOp::StBlk,
                            dst: 0,
                            a: addr.slot(),
                            b: val.slot(),
                            imm: size as i64,
                        });
                    }
                }
            }
            _ => unreachable!("emit_static called for a non-static opcode"),
        }
        Ok(())
    }

    fn elem_load_op(&self, ty: TypeToken, size: u32) -> (IrOp, i64) {
        let prim = self
            .store
            .type_desc(ty)
            .and_then(|d| if d.is_enum { d.underlying } else { d.prim });
        match prim {
            Some(PrimKind::I1) => (IrOp::LdElemI1, 0),
            Some(PrimKind::U1) | Some(PrimKind::Bool) => (IrOp::LdElemU1, 0),
            Some(PrimKind::I2) => (IrOp::LdElemI2, 0),
            Some(PrimKind::U2) | Some(PrimKind::Char) => (IrOp::LdElemU2, 0),
            Some(PrimKind::I4) => (IrOp::LdElemI4, 0),
            Some(PrimKind::U4) => (IrOp::LdElemU4, 0),
            Some(PrimKind::I8) | Some(PrimKind::U8) | Some(PrimKind::IntPtr) => {
                (IrOp::LdElemI8, 0)
            }
            Some(PrimKind::R4) => (IrOp::LdElemR4, 0),
            Some(PrimKind::R8) => (IrOp::LdElemR8, 0),
            None if size <= 8 => (IrOp::LdElemI8, 0),
            None => (IrOp::LdElemBlk, size as i64),
        }
    }

    /// `newobj`: allocate-and-construct handled as one instruction; the
    /// engine allocates, shifts the arguments up one slot for `this`, and
    /// runs the constructor.
    fn emit_newobj(&mut self, instr: &IlInstr) -> EmitResult<()> {
        let off = instr.offset;
        let (ctor, cdesc) = self.callee_of(instr)?;

        // Vector constructors collapse to a pack instruction.
        if let Some(Intrinsic::VectorCtor { count, width }) =
            self.cfg.intrinsics.lookup(self.store, cdesc)
        {
            let mut base = None;
            for _ in 0..count {
                base = Some(self.pop(off)?);
            }
            let base =
                base.ok_or(EmitError::OperandMismatch { offset: off, op: instr.op })?;
            let total = count * width;
            let dst = self.stack.push(
                if total <= 8 { StackKind::I8 } else { StackKind::Vt },
                total,
            );
            self.emit(IrInstr {
                op: IrOp::VecPack,
                dst: dst.slot(),
                a: 0,
                b: base.slot(),
                imm: pack2(count, width),
            });
            return Ok(());
        }

        let declaring = cdesc
            .declaring
            .ok_or(EmitError::UnknownToken { offset: off, token: ctor.0 })?;
        let size = self
            .store
            .type_desc(declaring)
            .map(|d| d.size)
            .unwrap_or(8);

        // Constructor params exclude the `this` the engine inserts; the
        // result lands at the base of the consumed argument run.
        let explicit = cdesc.params.len().saturating_sub(1);
        for _ in 0..explicit {
            self.pop(off)?;
        }

        let call = resolve_call(self.store, self.cfg.trampolines, ctor, false)?;
        let ridx = self.intern(ResolveEntry::Call(call));
        let dst = self.stack.push(StackKind::I8, 8);
        self.emit(IrInstr {
            op: IrOp::NewObj,
            dst: dst.slot(),
            a: ridx,
            b: dst.slot(),
            imm: size as i64,
        });
        Ok(())
    }

    fn stack_top_slot(&self) -> u32 {
        match self.stack.peek(0) {
            Some(s) => s.slot() + s.slot_count(),
            None => self.eval_base / 8,
        }
    }

    fn emit_call(&mut self, instr: &IlInstr, virtual_call: bool) -> EmitResult<()> {
        let off = instr.offset;
        let (callee, cdesc) = self.callee_of(instr)?;

        if let Some(intrinsic) = self.cfg.intrinsics.lookup(self.store, cdesc) {
            if self.emit_intrinsic(off, intrinsic)? {
                return Ok(());
            }
        }

        let call = resolve_call(self.store, self.cfg.trampolines, callee, virtual_call)?;
        let nparams = cdesc.params.len();
        let ret_ty = cdesc.ret;

        let mut base_slot = self.stack_top_slot();
        for _ in 0..nparams {
            let s = self.pop(off)?;
            base_slot = s.slot();
        }

        let op = match call.kind {
            CallKind::Interp => IrOp::CallIr,
            CallKind::InterpVirt => IrOp::CallIrVirt,
            CallKind::NativeStatic | CallKind::NativeInstance => IrOp::CallNative,
            CallKind::NativeVirtual => IrOp::CallNativeVirt,
            CallKind::DelegateInvoke => IrOp::CallDelegate,
        };
        let ridx = self.intern(ResolveEntry::Call(call));

        let dst_slot = match ret_ty {
            None => 0,
            Some(t) => {
                let (kind, size) = StackKind::reduce(self.store, t);
                self.stack.push(kind, size).slot()
            }
        };
        self.emit(IrInstr { op, dst: dst_slot, a: ridx, b: base_slot, imm: 0 });
        Ok(())
    }

    /// Emit a recognized intrinsic; returns false when the pattern does
    /// not fit the call site and the generic path should run instead.
    fn emit_intrinsic(&mut self, off: u32, intrinsic: Intrinsic) -> EmitResult<bool> {
        match intrinsic {
            Intrinsic::NullableHasValue => {
                let addr = self.pop(off)?;
                let dst = self.stack.push(StackKind::I4, 4);
                self.emit(IrInstr {
                    op: IrOp::NullableHasValue,
                    dst: dst.slot(),
                    a: addr.slot(),
                    b: 0,
                    imm: 0,
                });
                Ok(true)
            }
            Intrinsic::NullableValue { offset, size } => {
                let addr = self.pop(off)?;
                let kind = if size <= 8 { StackKind::I8 } else { StackKind::Vt };
                let dst = self.stack.push(kind, size);
                self.emit(IrInstr {
                    op: IrOp::NullableValue,
                    dst: dst.slot(),
                    a: addr.slot(),
                    b: 0,
                    imm: pack2(offset, size),
                });
                Ok(true)
            }
            Intrinsic::InterlockedExchange { width } => {
                let val = self.pop(off)?;
                let addr = self.pop(off)?;
                let (op, kind, size) = if width == 4 {
                    (IrOp::AtomicXchg4, StackKind::I4, 4)
                } else {
                    (IrOp::AtomicXchg8, StackKind::I8, 8)
                };
                let dst = self.stack.push(kind, size);
                self.emit(IrInstr {
                    op,
                    dst: dst.slot(),
                    a: addr.slot(),
                    b: val.slot(),
                    imm: 0,
                });
                Ok(true)
            }
            Intrinsic::InterlockedCompareExchange { width } => {
                let comparand = self.pop(off)?;
                let val = self.pop(off)?;
                let addr = self.pop(off)?;
                let (op, kind, size) = if width == 4 {
                    (IrOp::AtomicCmpXchg4, StackKind::I4, 4)
                } else {
                    (IrOp::AtomicCmpXchg8, StackKind::I8, 8)
                };
                let dst = self.stack.push(kind, size);
                self.emit(IrInstr {
                    op,
                    dst: dst.slot(),
                    a: addr.slot(),
                    b: val.slot(),
                    imm: comparand.slot() as i64,
                });
                Ok(true)
            }
            Intrinsic::ArrayGet => {
                let idx = self.pop(off)?;
                let arr = self.pop(off)?;
                let dst = self.stack.push(StackKind::I8, 8);
                // Element size is discovered from the array header.
                self.emit(IrInstr {
                    op: IrOp::LdElemBlk,
                    dst: dst.slot(),
                    a: arr.slot(),
                    b: idx.slot(),
                    imm: 0,
                });
                Ok(true)
            }
            Intrinsic::ArraySet => {
                let val = self.pop(off)?;
                let idx = self.pop(off)?;
                let arr = self.pop(off)?;
                self.emit(IrInstr {
                    op: IrOp::StElemBlk,
                    dst: val.slot(),
                    a: arr.slot(),
                    b: idx.slot(),
                    imm: 0,
                });
                Ok(true)
            }
            // Vector constructors are handled on the newobj path.
            Intrinsic::VectorCtor { .. } => Ok(false),
        }
    }

    /// Classify a `leave` target against the active finally clauses.
    fn emit_leave(&mut self, off: u32, target: u32) -> EmitResult<()> {
        self.stack.clear();
        self.record_flow(target, StackShape::default())?;

        // Innermost-first finally clauses whose try covers the leave but
        // not its target.
        let first_finally = self.body.clauses.iter().position(|c| {
            c.kind == ClauseKind::Finally
                && off >= c.try_start
                && off < c.try_end()
                && !(target >= c.try_start && target < c.try_end())
        });

        match first_finally {
            Some(idx) => {
                self.emit_pending_branch(IrOp::LeaveChain, idx as u32, target);
            }
            None => {
                // No finally to run: a plain branch, unless we are inside
                // a handler whose activation must be unwound.
                let in_handler = self.body.clauses.iter().any(|c| {
                    (off >= c.handler_start && off < c.handler_end())
                        || c.filter_start.map_or(false, |fs| off >= fs && off < c.handler_start)
                });
                if in_handler {
                    self.emit_pending_branch(IrOp::Leave, 0, target);
                } else {
                    self.emit_pending_branch(IrOp::Br, 0, target);
                }
            }
        }
        Ok(())
    }

    // === Relocation ===

    fn ir_of(&self, il: u32) -> EmitResult<u32> {
        if il as usize >= self.body.code.len() {
            return Ok(self.code.len() as u32);
        }
        self.blocks
            .index_at(il)
            .map(|i| self.blocks.get(i).ir_offset)
            .ok_or(EmitError::BranchTargetOutOfRange { offset: 0, target: il })
    }

    fn relocate(&mut self) -> EmitResult<()> {
        let pending = std::mem::take(&mut self.pending_branches);
        for (idx, il) in pending {
            let ir = self.ir_of(il)?;
            self.code[idx].a = ir;
        }
        let switches = std::mem::take(&mut self.pending_switches);
        for (ridx, il_targets) in switches {
            let mut table = Vec::with_capacity(il_targets.len());
            for il in il_targets {
                table.push(self.ir_of(il)?);
            }
            self.resolve[ridx] = ResolveEntry::SwitchTable(table);
        }
        Ok(())
    }

    fn relocated_clauses(&self) -> EmitResult<Vec<IrExceptionClause>> {
        let mut out = Vec::with_capacity(self.body.clauses.len());
        for c in &self.body.clauses {
            out.push(IrExceptionClause {
                kind: c.kind,
                try_start: self.ir_of(c.try_start)?,
                try_end: self.ir_of(c.try_end())?,
                handler_start: self.ir_of(c.handler_start)?,
                handler_end: self.ir_of(c.handler_end())?,
                filter_start: match c.filter_start {
                    Some(fs) => Some(self.ir_of(fs)?),
                    None => None,
                },
                catch_type: c.catch_type,
            });
        }
        Ok(out)
    }
}

/// Comparison selector shared between compare and compare-branch paths.
#[derive(Clone, Copy)]
enum Cmp {
    Eq,
    Gt,
    GtUn,
    Lt,
    LtUn,
}

impl Cmp {
    fn select(self, kind: StackKind) -> Option<IrOp> {
        use StackKind as K;
        Some(match (self, kind) {
            (Cmp::Eq, K::I4) => IrOp::CeqI4,
            (Cmp::Eq, K::I8) => IrOp::CeqI8,
            (Cmp::Eq, K::R4) => IrOp::CeqR4,
            (Cmp::Eq, K::R8) => IrOp::CeqR8,
            (Cmp::Gt, K::I4) => IrOp::CgtI4,
            (Cmp::Gt, K::I8) => IrOp::CgtI8,
            (Cmp::Gt, K::R4) => IrOp::CgtR4,
            (Cmp::Gt, K::R8) => IrOp::CgtR8,
            (Cmp::GtUn, K::I4) => IrOp::CgtUnI4,
            (Cmp::GtUn, K::I8) => IrOp::CgtUnI8,
            (Cmp::GtUn, K::R4) => IrOp::CgtUnR4,
            (Cmp::GtUn, K::R8) => IrOp::CgtUnR8,
            (Cmp::Lt, K::I4) => IrOp::CltI4,
            (Cmp::Lt, K::I8) => IrOp::CltI8,
            (Cmp::Lt, K::R4) => IrOp::CltR4,
            (Cmp::Lt, K::R8) => IrOp::CltR8,
            (Cmp::LtUn, K::I4) => IrOp::CltUnI4,
            (Cmp::LtUn, K::I8) => IrOp::CltUnI8,
            (Cmp::LtUn, K::R4) => IrOp::CltUnR4,
            (Cmp::LtUn, K::R8) => IrOp::CltUnR8,
            _ => return None,
        })
    }
}

fn prim_load(prim: PrimKind) -> (IrOp, StackKind, u32) {
    match prim {
        PrimKind::I1 => (IrOp::LdIndI1, StackKind::I4, 4),
        PrimKind::U1 | PrimKind::Bool => (IrOp::LdIndU1, StackKind::I4, 4),
        PrimKind::I2 => (IrOp::LdIndI2, StackKind::I4, 4),
        PrimKind::U2 | PrimKind::Char => (IrOp::LdIndU2, StackKind::I4, 4),
        PrimKind::I4 => (IrOp::LdIndI4, StackKind::I4, 4),
        PrimKind::U4 => (IrOp::LdIndU4, StackKind::I4, 4),
        PrimKind::I8 | PrimKind::U8 | PrimKind::IntPtr => (IrOp::LdIndI8, StackKind::I8, 8),
        PrimKind::R4 => (IrOp::LdIndR4, StackKind::R4, 4),
        PrimKind::R8 => (IrOp::LdIndR8, StackKind::R8, 8),
    }
}

fn prim_store(prim: PrimKind) -> IrOp {
    match prim {
        PrimKind::I1 | PrimKind::U1 | PrimKind::Bool => IrOp::StIndI1,
        PrimKind::I2 | PrimKind::U2 | PrimKind::Char => IrOp::StIndI2,
        PrimKind::I4 | PrimKind::U4 => IrOp::StIndI4,
        PrimKind::I8 | PrimKind::U8 | PrimKind::IntPtr => IrOp::StIndI8,
        PrimKind::R4 => IrOp::StIndR4,
        PrimKind::R8 => IrOp::StIndR8,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::{MetadataStore, MethodDesc, TypeDesc};

    fn store_with_int() -> (MetadataStore, TypeToken) {
        let mut store = MetadataStore::new();
        let i4 = store.add_type(TypeDesc::primitive("System.Int32", PrimKind::I4));
        (store, i4)
    }

    fn interpreted(
        store: &mut MetadataStore,
        params: Vec<TypeToken>,
        ret: Option<TypeToken>,
        locals: Vec<TypeToken>,
        code: Vec<u8>,
    ) -> MethodToken {
        store.add_method(MethodDesc {
            name: "M".into(),
            declaring: None,
            params,
            ret,
            is_static: true,
            is_virtual: false,
            is_delegate_invoke: false,
            kind: MethodKind::Interpreted(MethodBody {
                code,
                max_stack: 8,
                locals,
                clauses: Vec::new(),
                init_locals: true,
            }),
        })
    }

    fn emit(store: &MetadataStore, m: MethodToken) -> EmitResult<MethodIr> {
        let intrinsics = IntrinsicTable::with_defaults();
        let cfg = EmitConfig { intrinsics: &intrinsics, trampolines: None };
        emit_method(store, &cfg, m)
    }

    #[test]
    fn test_straight_line_add() {
        let (mut store, i4) = store_with_int();
        // ldc.i4.s 40; ldc.i4.2; add; ret
        let m = interpreted(&mut store, vec![], Some(i4), vec![], vec![0x1F, 40, 0x18, 0x58, 0x2A]);
        let ir = emit(&store, m).unwrap();

        let ops: Vec<IrOp> = ir.code.iter().map(|i| i.op).collect();
        assert_eq!(ops, vec![IrOp::LdcI4, IrOp::LdcI4, IrOp::AddI4, IrOp::Ret]);
        // Both constants at consecutive eval slots, result lands back at
        // the first.
        let base = ir.eval_base / 8;
        assert_eq!(ir.code[0].dst, base);
        assert_eq!(ir.code[1].dst, base + 1);
        assert_eq!(ir.code[2].dst, base);
        // Balanced: final extent is the two transient slots.
        assert_eq!(ir.max_stack_bytes, 16);
    }

    #[test]
    fn test_args_and_locals_layout() {
        let (mut store, i4) = store_with_int();
        // ldarg.0; ldarg.1; add; stloc.0; ldloc.0; ret
        let m = interpreted(
            &mut store,
            vec![i4, i4],
            Some(i4),
            vec![i4],
            vec![0x02, 0x03, 0x58, 0x0A, 0x06, 0x2A],
        );
        let ir = emit(&store, m).unwrap();
        assert_eq!(ir.args_size, 16);
        assert_eq!(ir.locals_size, 8);
        assert_eq!(ir.exc_slot, 24);
        assert_eq!(ir.eval_base, 32);
        // ldarg.0 copies slot 0 up to the eval region.
        assert_eq!(ir.code[0].op, IrOp::Mov);
        assert_eq!(ir.code[0].a, 0);
        assert_eq!(ir.code[0].dst, 4);
        // stloc.0 targets slot 2 (locals follow the 2-slot arg region).
        assert_eq!(ir.code[3].op, IrOp::Mov);
        assert_eq!(ir.code[3].dst, 2);
    }

    #[test]
    fn test_widening_on_mixed_ints() {
        let (mut store, i4) = store_with_int();
        let i8t = store.add_type(TypeDesc::primitive("System.Int64", PrimKind::I8));
        // ldc.i4.1; ldc.i8 2; add; ret  (i4 operand widens in place)
        let mut code = vec![0x17, 0x21];
        code.extend_from_slice(&2i64.to_le_bytes());
        code.push(0x58);
        code.push(0x2A);
        let _ = i4;
        let m = interpreted(&mut store, vec![], Some(i8t), vec![], code);
        let ir = emit(&store, m).unwrap();
        let ops: Vec<IrOp> = ir.code.iter().map(|i| i.op).collect();
        assert_eq!(
            ops,
            vec![IrOp::LdcI4, IrOp::LdcI8, IrOp::SxI4, IrOp::AddI8, IrOp::Ret]
        );
        // Widening rewrites the i4 slot in place.
        assert_eq!(ir.code[2].dst, ir.code[0].dst);
        assert_eq!(ir.code[2].a, ir.code[0].dst);
    }

    #[test]
    fn test_forward_branch_relocation() {
        let (mut store, i4) = store_with_int();
        // 0: ldc.i4.0 ; 1: brtrue.s +1 -> 4 ; 3: nop ; 4: ldc.i4.1; 5: ret
        let m = interpreted(
            &mut store,
            vec![],
            Some(i4),
            vec![],
            vec![0x16, 0x2D, 1, 0x00, 0x17, 0x2A],
        );
        let ir = emit(&store, m).unwrap();
        let br = ir
            .code
            .iter()
            .find(|i| i.op == IrOp::BrTrueI4)
            .expect("conditional branch");
        let target = br.a as usize;
        assert!(target < ir.code.len());
        assert_eq!(ir.code[target].op, IrOp::LdcI4);
        assert_eq!(ir.code[target].imm, 1);
    }

    #[test]
    fn test_join_shape_mismatch_is_fatal() {
        let (mut store, i4) = store_with_int();
        // 0: ldc.i4.0
        // 1: brtrue.s +3 -> 6
        // 3: ldc.i4.1
        // 4: br.s +9 -> 15
        // 6: ldc.i8 1          (9 bytes, ends at 15)
        // 15: pop ; 16: ret
        let mut code = vec![0x16, 0x2D, 3, 0x17, 0x2B, 9, 0x21];
        code.extend_from_slice(&1i64.to_le_bytes());
        code.push(0x26);
        code.push(0x2A);
        let m = interpreted(&mut store, vec![], Some(i4), vec![], code);
        let err = emit(&store, m).unwrap_err();
        assert!(matches!(err, EmitError::JoinShapeMismatch { target: 15 }));
    }

    #[test]
    fn test_matching_join_is_accepted() {
        let (mut store, i4) = store_with_int();
        // Same graph with both paths pushing i4.
        // 0: ldc.i4.0 ; 1: brtrue.s +3 -> 6 ; 3: ldc.i4.1 ; 4: br.s +1 -> 7
        // 6: ldc.i4.2 ; 7: ret
        let code = vec![0x16, 0x2D, 3, 0x17, 0x2B, 1, 0x18, 0x2A];
        let m = interpreted(&mut store, vec![], Some(i4), vec![], code);
        let ir = emit(&store, m).unwrap();
        assert!(ir.code.iter().any(|i| i.op == IrOp::Ret));
        assert!(ir.code.iter().any(|i| i.op == IrOp::Br));
    }

    #[test]
    fn test_compare_branch_lowering() {
        let (mut store, i4) = store_with_int();
        // ldarg.0; ldarg.1; bge.s +1 -> 5; nop; 5: ret
        let m = interpreted(
            &mut store,
            vec![i4, i4],
            None,
            vec![],
            vec![0x02, 0x03, 0x2F, 1, 0x00, 0x2A],
        );
        let ir = emit(&store, m).unwrap();
        // bge on ints lowers to clt + brfalse.
        let clt = ir.code.iter().position(|i| i.op == IrOp::CltI4).unwrap();
        assert_eq!(ir.code[clt + 1].op, IrOp::BrFalseI4);
        assert_eq!(ir.code[clt + 1].b, ir.code[clt].dst);
    }

    #[test]
    fn test_call_interpreted_callee() {
        let (mut store, i4) = store_with_int();
        let callee = interpreted(&mut store, vec![i4, i4], Some(i4), vec![], vec![0x02, 0x2A]);
        // ldc.i4.1; ldc.i4.2; call callee; ret
        let mut code = vec![0x17, 0x18, 0x28];
        code.extend_from_slice(&callee.0.to_le_bytes());
        code.push(0x2A);
        let caller = interpreted(&mut store, vec![], Some(i4), vec![], code);
        let ir = emit(&store, caller).unwrap();

        let call = ir.code.iter().find(|i| i.op == IrOp::CallIr).unwrap();
        let base = ir.eval_base / 8;
        assert_eq!(call.b, base);
        assert_eq!(call.dst, base);
        let rc = ir.resolve[call.a as usize].as_call().unwrap();
        assert_eq!(rc.method, callee);
        assert_eq!(rc.arg_slots, 2);
    }

    #[test]
    fn test_switch_table_relocated() {
        let (mut store, i4) = store_with_int();
        // 0: ldc.i4.0 ; 1: switch [2] -> 16, 17 ; 14: br.s +2 -> 18
        // 16: nop ; 17: nop ; 18: ret
        let mut code = vec![0x16, 0x45];
        code.extend_from_slice(&2u32.to_le_bytes());
        code.extend_from_slice(&2i32.to_le_bytes());
        code.extend_from_slice(&3i32.to_le_bytes());
        code.extend_from_slice(&[0x2B, 2, 0x00, 0x00, 0x2A]);
        let m = interpreted(&mut store, vec![], None, vec![], code);
        let ir = emit(&store, m).unwrap();
        let sw = ir.code.iter().find(|i| i.op == IrOp::Switch).unwrap();
        let table = ir.resolve[sw.a as usize].as_switch().unwrap();
        assert_eq!(table.len(), 2);
        for &t in table {
            assert!((t as usize) < ir.code.len());
        }
    }

    #[test]
    fn test_stack_underflow_detected() {
        let (mut store, i4) = store_with_int();
        // add with an empty stack
        let m = interpreted(&mut store, vec![], Some(i4), vec![], vec![0x58, 0x2A]);
        let err = emit(&store, m).unwrap_err();
        assert!(matches!(err, EmitError::StackUnderflow { offset: 0 }));
    }

    #[test]
    fn test_native_call_without_table_fails() {
        let (mut store, i4) = store_with_int();
        let native = store.add_method(MethodDesc {
            name: "N".into(),
            declaring: None,
            params: vec![i4],
            ret: Some(i4),
            is_static: true,
            is_virtual: false,
            is_delegate_invoke: false,
            kind: MethodKind::Native,
        });
        let mut code = vec![0x17, 0x28];
        code.extend_from_slice(&native.0.to_le_bytes());
        code.push(0x2A);
        let m = interpreted(&mut store, vec![], Some(i4), vec![], code);
        assert!(matches!(emit(&store, m), Err(EmitError::Native(_))));
    }

    #[test]
    fn test_finally_leave_chain() {
        let (mut store, _) = store_with_int();
        // try [0,3): nop; nop; leave.s -> 6 | finally [3,6): nop; nop; endfinally
        // 6: ret
        let code = vec![0x00, 0x00, 0xDE, 2, 0x00, 0xDC, 0x2A];
        // leave.s at 2 is 2 bytes (next 4), target 4+2=6. Handler [4,6)?
        // Recompute: bytes: 0 nop, 1 nop, 2-3 leave.s, 4 nop, 5 endfinally, 6 ret.
        let clauses = vec![crate::metadata::IlExceptionClause {
            kind: ClauseKind::Finally,
            try_start: 0,
            try_len: 4,
            handler_start: 4,
            handler_len: 2,
            filter_start: None,
            catch_type: None,
        }];
        let m = store.add_method(MethodDesc {
            name: "F".into(),
            declaring: None,
            params: vec![],
            ret: None,
            is_static: true,
            is_virtual: false,
            is_delegate_invoke: false,
            kind: MethodKind::Interpreted(MethodBody {
                code,
                max_stack: 4,
                locals: vec![],
                clauses,
                init_locals: false,
            }),
        });
        let ir = emit(&store, m).unwrap();
        let leave = ir.code.iter().find(|i| i.op == IrOp::LeaveChain).unwrap();
        assert_eq!(leave.b, 0); // first finally clause index
        assert_eq!(ir.code[leave.a as usize].op, IrOp::RetVoid);
        assert!(ir.code.iter().any(|i| i.op == IrOp::EndFinally));
        // Clause ranges are in instruction indices now.
        assert_eq!(ir.clauses.len(), 1);
        assert!(ir.clauses[0].handler_start < ir.clauses[0].handler_end);
    }

    #[test]
    fn test_interlocked_intrinsic_substitution() {
        let mut store = MetadataStore::new();
        let i4 = store.add_type(TypeDesc::primitive("System.Int32", PrimKind::I4));
        let intptr = store.add_type(TypeDesc::primitive("System.IntPtr", PrimKind::IntPtr));
        let interlocked =
            store.add_type(TypeDesc::reference("System.Threading.Interlocked", None));
        let xchg = store.add_method(MethodDesc {
            name: "Exchange".into(),
            declaring: Some(interlocked),
            params: vec![intptr, i4],
            ret: Some(i4),
            is_static: true,
            is_virtual: false,
            is_delegate_invoke: false,
            kind: MethodKind::Native,
        });
        // ldloca.s 0; ldc.i4.5; call Exchange; ret
        let mut code = vec![0x12, 0, 0x1B, 0x28];
        code.extend_from_slice(&xchg.0.to_le_bytes());
        code.push(0x2A);
        let m = interpreted(&mut store, vec![], Some(i4), vec![i4], code);
        // No trampoline table: only the intrinsic path can succeed.
        let ir = emit(&store, m).unwrap();
        assert!(ir.code.iter().any(|i| i.op == IrOp::AtomicXchg4));
        assert!(!ir.code.iter().any(|i| i.op == IrOp::CallNative));
    }

    #[test]
    fn test_exception_clause_entry_shape() {
        let mut store = MetadataStore::with_runtime_types();
        let wk = *store.well_known().unwrap();
        // try [0,2): nop; leave.s? -- keep it minimal:
        // 0: nop ; 1: leave.s +2 -> 5 ; 3: pop ; 4: br.s? ...
        // layout: 0 nop, 1-2 leave.s(target 5), 3 pop (handler), 4 leave.s? ->
        // simpler: handler: 3: pop ; 4: ret? handlers must leave, but for
        // shape checking ret suffices at 5.
        // bytes: 0 nop | 1-2 leave.s -> 5 | 3 pop, 4-5? pop is 1 byte; use
        // handler [3,5): pop ; leave.s -> ... keep: 3 pop, 4 ret is outside
        // handler-exit rules but emission does not enforce them.
        let code = vec![0x00, 0xDE, 2, 0x26, 0x00, 0x2A];
        let clauses = vec![crate::metadata::IlExceptionClause {
            kind: ClauseKind::Catch,
            try_start: 0,
            try_len: 3,
            handler_start: 3,
            handler_len: 2,
            filter_start: None,
            catch_type: Some(wk.exception),
        }];
        let m = store.add_method(MethodDesc {
            name: "C".into(),
            declaring: None,
            params: vec![],
            ret: None,
            is_static: true,
            is_virtual: false,
            is_delegate_invoke: false,
            kind: MethodKind::Interpreted(MethodBody {
                code,
                max_stack: 4,
                locals: vec![],
                clauses,
                init_locals: false,
            }),
        });
        let ir = emit(&store, m).unwrap();
        assert_eq!(ir.clauses[0].catch_type, Some(wk.exception));
        // The handler's first instruction consumes the exception slot: the
        // pop emits nothing, so the handler body starts at the ret/nop.
        assert!(ir.clauses[0].handler_start <= ir.clauses[0].handler_end);
    }
}
