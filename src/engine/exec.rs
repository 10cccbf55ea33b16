//! The dispatch loop and exception machinery
//!
//! `step` executes exactly one instruction of the top frame and reports
//! anything the orchestrating loop has to act on: a thrown exception, a
//! leave, or a handler exit. Interpreted calls push frames and keep the
//! loop flat; only handler segments (finally, fault, filter bodies) run
//! as nested loops, which is what gives filters their nested-activation
//! semantics.
//!
//! Heap objects are word arrays with a one-word header holding the type
//! token; arrays add a length word and tag the header's top bit. All
//! addresses handed to the code stream are raw, pinned by the machine's
//! arenas, and dereferenced unaligned.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use smallvec::SmallVec;
use tracing::{debug, trace};

use crate::bridge::{call_native, CallKind};
use crate::ir::{unpack2, IrInstr, IrOp, MethodIr};
use crate::metadata::{ClauseKind, MethodKind, MethodToken, TypeToken};

use super::{ExcFlowEntry, ExecContext, ExecError, FaultKind, Machine};

/// Array header tag in the type word.
const ARRAY_FLAG: u64 = 1 << 63;
/// Object payload starts after the type word.
const OBJ_HEADER: u64 = 8;
/// Array payload starts after type and length words.
const ARR_HEADER: u64 = 16;

/// What a single step asks of the orchestrating loop.
enum Control {
    Next,
    Pushed,
    Returned,
    Threw(u64),
    Leave { target: u32, finally_from: Option<u32> },
    EndFinally,
    EndFilter(i32),
}

/// How a nested handler segment ended.
enum SegmentExit {
    /// `endfinally` at segment depth.
    Finished,
    /// `endfilter` with the given verdict.
    Filter(i32),
    /// An exception escaped the segment.
    Threw(u64),
    /// An exception raised inside the segment was caught by a clause
    /// outside it; the segment and whatever scheduled it are abandoned.
    Overtaken,
}

enum Dispatch {
    Handled { frame: usize, clause: usize },
    Escaped(u64),
}

#[inline]
unsafe fn read_mem<T: Copy>(addr: u64) -> T {
    std::ptr::read_unaligned(addr as *const T)
}

#[inline]
unsafe fn write_mem<T>(addr: u64, v: T) {
    std::ptr::write_unaligned(addr as *mut T, v)
}

fn ovf_bounds(width: u32, signed: bool) -> (i128, i128) {
    match (width, signed) {
        (1, true) => (i8::MIN as i128, i8::MAX as i128),
        (1, false) => (0, u8::MAX as i128),
        (2, true) => (i16::MIN as i128, i16::MAX as i128),
        (2, false) => (0, u16::MAX as i128),
        (4, true) => (i32::MIN as i128, i32::MAX as i128),
        (4, false) => (0, u32::MAX as i128),
        (8, true) => (i64::MIN as i128, i64::MAX as i128),
        _ => (0, u64::MAX as i128),
    }
}

impl Machine {
    pub(crate) fn run(&mut self, ctx: &ExecContext<'_>) -> Result<(), ExecError> {
        while !self.frames.is_empty() {
            match self.step(ctx)? {
                Control::Next | Control::Pushed | Control::Returned => {}
                Control::Threw(obj) => match self.dispatch_exception(ctx, obj, 0)? {
                    Dispatch::Handled { .. } => {}
                    Dispatch::Escaped(obj) => return Err(self.unhandled(ctx, obj)),
                },
                Control::Leave { target, finally_from } => {
                    self.run_leave(ctx, target, finally_from)?
                }
                Control::EndFinally | Control::EndFilter(_) => {
                    return Err(self.malformed("handler exit outside a handler segment"));
                }
            }
        }
        Ok(())
    }

    fn malformed(&self, what: &'static str) -> ExecError {
        let (method, ip) = self
            .frames
            .last()
            .map(|f| (f.ir.method, f.ip))
            .unwrap_or((MethodToken(0), 0));
        ExecError::Malformed { method, ip, what }
    }

    fn unhandled(&self, ctx: &ExecContext<'_>, obj: u64) -> ExecError {
        let type_name = if obj == 0 {
            "<null>".to_string()
        } else {
            let header = unsafe { read_mem::<u64>(obj) };
            let token = TypeToken((header & !ARRAY_FLAG) as u32);
            ctx.store
                .type_desc(token)
                .map(|d| d.name.to_string())
                .unwrap_or_else(|| format!("{}", token))
        };
        ExecError::Unhandled { type_name }
    }

    /// Raise a runtime fault: a managed exception when the well-known
    /// types are registered, a hard error otherwise.
    fn raise(&mut self, ctx: &ExecContext<'_>, kind: FaultKind) -> Result<Control, ExecError> {
        match ctx.store.well_known() {
            Some(wk) => {
                let token = kind.token(wk);
                let size = ctx.store.type_desc(token).map(|d| d.size).unwrap_or(8);
                let obj = self.alloc_object(token, size);
                debug!(kind = kind.describe(), "runtime fault raised");
                Ok(Control::Threw(obj))
            }
            None => {
                let (method, ip) = self
                    .frames
                    .last()
                    .map(|f| (f.ir.method, f.ip))
                    .unwrap_or((MethodToken(0), 0));
                Err(ExecError::Fault { kind, method, ip })
            }
        }
    }

    // === Heap ===

    fn alloc_raw(&mut self, words: usize) -> u64 {
        let block: Box<[u64]> = vec![0u64; words.max(1)].into_boxed_slice();
        let addr = block.as_ptr() as u64;
        self.heap.push(block);
        addr
    }

    pub(crate) fn alloc_object(&mut self, ty: TypeToken, size: u32) -> u64 {
        let addr = self.alloc_raw(1 + size.div_ceil(8) as usize);
        unsafe { write_mem::<u64>(addr, ty.0 as u64) };
        addr
    }

    pub(crate) fn alloc_array(&mut self, elem: TypeToken, len: u64, elem_size: u32) -> u64 {
        let payload = (len * elem_size as u64).div_ceil(8) as usize;
        let addr = self.alloc_raw(2 + payload);
        unsafe {
            write_mem::<u64>(addr, elem.0 as u64 | ARRAY_FLAG);
            write_mem::<u64>(addr + 8, len);
        }
        addr
    }

    /// Allocate a delegate object: header, target method token, and an
    /// optional bound receiver. Invoking it dispatches to `target`,
    /// inserting `bound` as the receiver when it is non-null.
    pub fn new_delegate(
        &mut self,
        delegate_type: TypeToken,
        target: MethodToken,
        bound: u64,
    ) -> u64 {
        let addr = self.alloc_raw(3);
        unsafe {
            write_mem::<u64>(addr, delegate_type.0 as u64);
            write_mem::<u64>(addr + 8, target.0 as u64);
            write_mem::<u64>(addr + 16, bound);
        }
        addr
    }

    fn string_object(&mut self, ctx: &ExecContext<'_>, s: &Arc<str>) -> u64 {
        if let Some(&addr) = self.strings.get(s) {
            return addr;
        }
        let bytes = s.as_bytes();
        let token = ctx
            .store
            .well_known()
            .map(|wk| wk.string)
            .unwrap_or(TypeToken(0));
        let addr = self.alloc_raw(2 + bytes.len().div_ceil(8));
        unsafe {
            write_mem::<u64>(addr, token.0 as u64);
            write_mem::<u64>(addr + 8, bytes.len() as u64);
            std::ptr::copy_nonoverlapping(
                bytes.as_ptr(),
                (addr + ARR_HEADER) as *mut u8,
                bytes.len(),
            );
        }
        self.strings.insert(s.clone(), addr);
        addr
    }

    fn elem_addr(&self, arr: u64, idx: i64, elem_size: u64) -> Result<u64, FaultKind> {
        if arr == 0 {
            return Err(FaultKind::NullReference);
        }
        let len = unsafe { read_mem::<u64>(arr + 8) };
        // Negative indexes wrap to huge unsigned values.
        if (idx as u64) >= len {
            return Err(FaultKind::IndexOutOfRange);
        }
        Ok(arr + ARR_HEADER + idx as u64 * elem_size)
    }

    fn cast_ok(&self, ctx: &ExecContext<'_>, obj: u64, target: TypeToken) -> bool {
        let header = unsafe { read_mem::<u64>(obj) };
        if header & ARRAY_FLAG != 0 {
            let elem = TypeToken((header & !ARRAY_FLAG) as u32);
            return ctx
                .store
                .type_desc(target)
                .and_then(|d| d.element)
                .map_or(false, |e| e == elem);
        }
        ctx.store.is_assignable(TypeToken(header as u32), target)
    }

    fn exception_matches(
        &self,
        ctx: &ExecContext<'_>,
        catch_type: Option<TypeToken>,
        obj: u64,
    ) -> bool {
        let Some(target) = catch_type else { return true };
        if obj == 0 {
            return false;
        }
        self.cast_ok(ctx, obj, target)
    }

    // === Dispatch ===

    #[inline]
    fn advance(&mut self) {
        if let Some(f) = self.frames.last_mut() {
            f.ip += 1;
        }
    }

    /// Execute one instruction of the top frame.
    #[allow(clippy::too_many_lines)]
    fn step(&mut self, ctx: &ExecContext<'_>) -> Result<Control, ExecError> {
        let (ir, base, ip) = {
            let Some(f) = self.frames.last() else {
                return Err(self.malformed("step with no frame"));
            };
            (f.ir.clone(), f.base as usize, f.ip)
        };
        let Some(&instr) = ir.code.get(ip as usize) else {
            return Err(self.malformed("instruction pointer past the end of the method"));
        };
        if self.config.trace {
            trace!(method = %ir.method, ip, op = instr.op.mnemonic(), "step");
        }

        let dst = base + instr.dst as usize;
        let sa = base + instr.a as usize;
        let sb = base + instr.b as usize;

        macro_rules! i4 {
            ($s:expr) => {
                self.stack[$s] as u32 as i32
            };
        }
        macro_rules! i8v {
            ($s:expr) => {
                self.stack[$s] as i64
            };
        }
        macro_rules! r4 {
            ($s:expr) => {
                f32::from_bits(self.stack[$s] as u32)
            };
        }
        macro_rules! r8 {
            ($s:expr) => {
                f64::from_bits(self.stack[$s])
            };
        }
        macro_rules! set_i4 {
            ($s:expr, $v:expr) => {
                self.stack[$s] = ($v) as u32 as u64
            };
        }
        macro_rules! set_i8 {
            ($s:expr, $v:expr) => {
                self.stack[$s] = ($v) as u64
            };
        }
        macro_rules! set_r4 {
            ($s:expr, $v:expr) => {
                self.stack[$s] = ($v).to_bits() as u64
            };
        }
        macro_rules! set_r8 {
            ($s:expr, $v:expr) => {
                self.stack[$s] = ($v).to_bits()
            };
        }
        macro_rules! null_check {
            ($addr:expr) => {
                if $addr == 0 {
                    return self.raise(ctx, FaultKind::NullReference);
                }
            };
        }

        match instr.op {
            // --- constants and moves ---
            IrOp::LdcI4 => set_i4!(dst, instr.imm as i32),
            IrOp::LdcI8 => set_i8!(dst, instr.imm),
            IrOp::LdcR4 => self.stack[dst] = instr.imm as u32 as u64,
            IrOp::LdcR8 => self.stack[dst] = instr.imm as u64,
            IrOp::LdNull => self.stack[dst] = 0,
            IrOp::LdStr => {
                let Some(s) = ir.resolve.get(instr.a as usize).and_then(|e| e.as_str()) else {
                    return Err(self.malformed("string load without a string entry"));
                };
                let s = s.clone();
                self.stack[dst] = self.string_object(ctx, &s);
            }
            IrOp::Mov => self.stack[dst] = self.stack[sa],
            IrOp::MovBlk => {
                let slots = (instr.imm as u64).div_ceil(8) as usize;
                self.stack.copy_within(sa..sa + slots, dst);
            }
            IrOp::SlotAddr => {
                self.stack[dst] = &self.stack[sa] as *const u64 as u64;
            }

            // --- i4 arithmetic ---
            IrOp::AddI4 => set_i4!(dst, i4!(sa).wrapping_add(i4!(sb))),
            IrOp::SubI4 => set_i4!(dst, i4!(sa).wrapping_sub(i4!(sb))),
            IrOp::MulI4 => set_i4!(dst, i4!(sa).wrapping_mul(i4!(sb))),
            IrOp::DivI4 => {
                let (x, y) = (i4!(sa), i4!(sb));
                if y == 0 {
                    return self.raise(ctx, FaultKind::DivideByZero);
                }
                if x == i32::MIN && y == -1 {
                    return self.raise(ctx, FaultKind::Overflow);
                }
                set_i4!(dst, x / y);
            }
            IrOp::DivUnI4 => {
                let (x, y) = (i4!(sa) as u32, i4!(sb) as u32);
                if y == 0 {
                    return self.raise(ctx, FaultKind::DivideByZero);
                }
                set_i4!(dst, (x / y) as i32);
            }
            IrOp::RemI4 => {
                let (x, y) = (i4!(sa), i4!(sb));
                if y == 0 {
                    return self.raise(ctx, FaultKind::DivideByZero);
                }
                set_i4!(dst, x.wrapping_rem(y));
            }
            IrOp::RemUnI4 => {
                let (x, y) = (i4!(sa) as u32, i4!(sb) as u32);
                if y == 0 {
                    return self.raise(ctx, FaultKind::DivideByZero);
                }
                set_i4!(dst, (x % y) as i32);
            }
            IrOp::AndI4 => set_i4!(dst, i4!(sa) & i4!(sb)),
            IrOp::OrI4 => set_i4!(dst, i4!(sa) | i4!(sb)),
            IrOp::XorI4 => set_i4!(dst, i4!(sa) ^ i4!(sb)),
            IrOp::ShlI4 => set_i4!(dst, i4!(sa).wrapping_shl(i4!(sb) as u32 & 31)),
            IrOp::ShrI4 => set_i4!(dst, i4!(sa).wrapping_shr(i4!(sb) as u32 & 31)),
            IrOp::ShrUnI4 => set_i4!(dst, ((i4!(sa) as u32) >> (i4!(sb) as u32 & 31)) as i32),
            IrOp::NegI4 => set_i4!(dst, i4!(sa).wrapping_neg()),
            IrOp::NotI4 => set_i4!(dst, !i4!(sa)),

            // --- i8 arithmetic ---
            IrOp::AddI8 => set_i8!(dst, i8v!(sa).wrapping_add(i8v!(sb))),
            IrOp::SubI8 => set_i8!(dst, i8v!(sa).wrapping_sub(i8v!(sb))),
            IrOp::MulI8 => set_i8!(dst, i8v!(sa).wrapping_mul(i8v!(sb))),
            IrOp::DivI8 => {
                let (x, y) = (i8v!(sa), i8v!(sb));
                if y == 0 {
                    return self.raise(ctx, FaultKind::DivideByZero);
                }
                if x == i64::MIN && y == -1 {
                    return self.raise(ctx, FaultKind::Overflow);
                }
                set_i8!(dst, x / y);
            }
            IrOp::DivUnI8 => {
                let (x, y) = (self.stack[sa], self.stack[sb]);
                if y == 0 {
                    return self.raise(ctx, FaultKind::DivideByZero);
                }
                self.stack[dst] = x / y;
            }
            IrOp::RemI8 => {
                let (x, y) = (i8v!(sa), i8v!(sb));
                if y == 0 {
                    return self.raise(ctx, FaultKind::DivideByZero);
                }
                set_i8!(dst, x.wrapping_rem(y));
            }
            IrOp::RemUnI8 => {
                let (x, y) = (self.stack[sa], self.stack[sb]);
                if y == 0 {
                    return self.raise(ctx, FaultKind::DivideByZero);
                }
                self.stack[dst] = x % y;
            }
            IrOp::AndI8 => self.stack[dst] = self.stack[sa] & self.stack[sb],
            IrOp::OrI8 => self.stack[dst] = self.stack[sa] | self.stack[sb],
            IrOp::XorI8 => self.stack[dst] = self.stack[sa] ^ self.stack[sb],
            IrOp::ShlI8 => set_i8!(dst, i8v!(sa).wrapping_shl(i4!(sb) as u32 & 63)),
            IrOp::ShrI8 => set_i8!(dst, i8v!(sa).wrapping_shr(i4!(sb) as u32 & 63)),
            IrOp::ShrUnI8 => self.stack[dst] = self.stack[sa] >> (i4!(sb) as u32 & 63),
            IrOp::NegI8 => set_i8!(dst, i8v!(sa).wrapping_neg()),
            IrOp::NotI8 => set_i8!(dst, !i8v!(sa)),

            // --- float arithmetic ---
            IrOp::AddR4 => set_r4!(dst, r4!(sa) + r4!(sb)),
            IrOp::SubR4 => set_r4!(dst, r4!(sa) - r4!(sb)),
            IrOp::MulR4 => set_r4!(dst, r4!(sa) * r4!(sb)),
            IrOp::DivR4 => set_r4!(dst, r4!(sa) / r4!(sb)),
            IrOp::RemR4 => set_r4!(dst, r4!(sa) % r4!(sb)),
            IrOp::NegR4 => set_r4!(dst, -r4!(sa)),
            IrOp::AddR8 => set_r8!(dst, r8!(sa) + r8!(sb)),
            IrOp::SubR8 => set_r8!(dst, r8!(sa) - r8!(sb)),
            IrOp::MulR8 => set_r8!(dst, r8!(sa) * r8!(sb)),
            IrOp::DivR8 => set_r8!(dst, r8!(sa) / r8!(sb)),
            IrOp::RemR8 => set_r8!(dst, r8!(sa) % r8!(sb)),
            IrOp::NegR8 => set_r8!(dst, -r8!(sa)),

            // --- overflow arithmetic ---
            IrOp::AddOvfI4 => match i4!(sa).checked_add(i4!(sb)) {
                Some(v) => set_i4!(dst, v),
                None => return self.raise(ctx, FaultKind::Overflow),
            },
            IrOp::SubOvfI4 => match i4!(sa).checked_sub(i4!(sb)) {
                Some(v) => set_i4!(dst, v),
                None => return self.raise(ctx, FaultKind::Overflow),
            },
            IrOp::MulOvfI4 => match i4!(sa).checked_mul(i4!(sb)) {
                Some(v) => set_i4!(dst, v),
                None => return self.raise(ctx, FaultKind::Overflow),
            },
            IrOp::AddOvfUnI4 => match (i4!(sa) as u32).checked_add(i4!(sb) as u32) {
                Some(v) => set_i4!(dst, v as i32),
                None => return self.raise(ctx, FaultKind::Overflow),
            },
            IrOp::SubOvfUnI4 => match (i4!(sa) as u32).checked_sub(i4!(sb) as u32) {
                Some(v) => set_i4!(dst, v as i32),
                None => return self.raise(ctx, FaultKind::Overflow),
            },
            IrOp::MulOvfUnI4 => match (i4!(sa) as u32).checked_mul(i4!(sb) as u32) {
                Some(v) => set_i4!(dst, v as i32),
                None => return self.raise(ctx, FaultKind::Overflow),
            },
            IrOp::AddOvfI8 => match i8v!(sa).checked_add(i8v!(sb)) {
                Some(v) => set_i8!(dst, v),
                None => return self.raise(ctx, FaultKind::Overflow),
            },
            IrOp::SubOvfI8 => match i8v!(sa).checked_sub(i8v!(sb)) {
                Some(v) => set_i8!(dst, v),
                None => return self.raise(ctx, FaultKind::Overflow),
            },
            IrOp::MulOvfI8 => match i8v!(sa).checked_mul(i8v!(sb)) {
                Some(v) => set_i8!(dst, v),
                None => return self.raise(ctx, FaultKind::Overflow),
            },
            IrOp::AddOvfUnI8 => match self.stack[sa].checked_add(self.stack[sb]) {
                Some(v) => self.stack[dst] = v,
                None => return self.raise(ctx, FaultKind::Overflow),
            },
            IrOp::SubOvfUnI8 => match self.stack[sa].checked_sub(self.stack[sb]) {
                Some(v) => self.stack[dst] = v,
                None => return self.raise(ctx, FaultKind::Overflow),
            },
            IrOp::MulOvfUnI8 => match self.stack[sa].checked_mul(self.stack[sb]) {
                Some(v) => self.stack[dst] = v,
                None => return self.raise(ctx, FaultKind::Overflow),
            },

            // --- comparisons ---
            IrOp::CeqI4 => set_i4!(dst, (i4!(sa) == i4!(sb)) as i32),
            IrOp::CgtI4 => set_i4!(dst, (i4!(sa) > i4!(sb)) as i32),
            IrOp::CgtUnI4 => set_i4!(dst, ((i4!(sa) as u32) > (i4!(sb) as u32)) as i32),
            IrOp::CltI4 => set_i4!(dst, (i4!(sa) < i4!(sb)) as i32),
            IrOp::CltUnI4 => set_i4!(dst, ((i4!(sa) as u32) < (i4!(sb) as u32)) as i32),
            IrOp::CeqI8 => set_i4!(dst, (i8v!(sa) == i8v!(sb)) as i32),
            IrOp::CgtI8 => set_i4!(dst, (i8v!(sa) > i8v!(sb)) as i32),
            IrOp::CgtUnI8 => set_i4!(dst, (self.stack[sa] > self.stack[sb]) as i32),
            IrOp::CltI8 => set_i4!(dst, (i8v!(sa) < i8v!(sb)) as i32),
            IrOp::CltUnI8 => set_i4!(dst, (self.stack[sa] < self.stack[sb]) as i32),
            IrOp::CeqR4 => set_i4!(dst, (r4!(sa) == r4!(sb)) as i32),
            IrOp::CgtR4 => set_i4!(dst, (r4!(sa) > r4!(sb)) as i32),
            // Unordered variants are true when either operand is NaN.
            IrOp::CgtUnR4 => set_i4!(dst, (!(r4!(sa) <= r4!(sb))) as i32),
            IrOp::CltR4 => set_i4!(dst, (r4!(sa) < r4!(sb)) as i32),
            IrOp::CltUnR4 => set_i4!(dst, (!(r4!(sa) >= r4!(sb))) as i32),
            IrOp::CeqR8 => set_i4!(dst, (r8!(sa) == r8!(sb)) as i32),
            IrOp::CgtR8 => set_i4!(dst, (r8!(sa) > r8!(sb)) as i32),
            IrOp::CgtUnR8 => set_i4!(dst, (!(r8!(sa) <= r8!(sb))) as i32),
            IrOp::CltR8 => set_i4!(dst, (r8!(sa) < r8!(sb)) as i32),
            IrOp::CltUnR8 => set_i4!(dst, (!(r8!(sa) >= r8!(sb))) as i32),

            // --- branches ---
            IrOp::Br => {
                self.set_ip(instr.a);
                return Ok(Control::Next);
            }
            IrOp::BrTrueI4 => {
                if i4!(sb) != 0 {
                    self.set_ip(instr.a);
                } else {
                    self.advance();
                }
                return Ok(Control::Next);
            }
            IrOp::BrFalseI4 => {
                if i4!(sb) == 0 {
                    self.set_ip(instr.a);
                } else {
                    self.advance();
                }
                return Ok(Control::Next);
            }
            IrOp::BrTrueI8 => {
                if self.stack[sb] != 0 {
                    self.set_ip(instr.a);
                } else {
                    self.advance();
                }
                return Ok(Control::Next);
            }
            IrOp::BrFalseI8 => {
                if self.stack[sb] == 0 {
                    self.set_ip(instr.a);
                } else {
                    self.advance();
                }
                return Ok(Control::Next);
            }
            IrOp::Switch => {
                let Some(table) = ir.resolve.get(instr.a as usize).and_then(|e| e.as_switch())
                else {
                    return Err(self.malformed("switch without a target table"));
                };
                let sel = i4!(sb);
                if sel >= 0 && (sel as usize) < table.len() {
                    let t = table[sel as usize];
                    self.set_ip(t);
                } else {
                    self.advance();
                }
                return Ok(Control::Next);
            }

            // --- conversions ---
            IrOp::SxI1 => set_i4!(dst, (self.stack[sa] as u8 as i8) as i32),
            IrOp::SxI2 => set_i4!(dst, (self.stack[sa] as u16 as i16) as i32),
            IrOp::SxI4 => set_i8!(dst, i4!(sa) as i64),
            IrOp::ZxU1 => set_i4!(dst, (self.stack[sa] as u8) as i32),
            IrOp::ZxU2 => set_i4!(dst, (self.stack[sa] as u16) as i32),
            IrOp::ZxU4 => self.stack[dst] = self.stack[sa] as u32 as u64,
            IrOp::TruncI8 => self.stack[dst] = self.stack[sa] as u32 as u64,
            IrOp::I4ToR4 => set_r4!(dst, i4!(sa) as f32),
            IrOp::I4ToR8 => set_r8!(dst, i4!(sa) as f64),
            IrOp::I8ToR4 => set_r4!(dst, i8v!(sa) as f32),
            IrOp::I8ToR8 => set_r8!(dst, i8v!(sa) as f64),
            IrOp::R4ToI4 => set_i4!(dst, r4!(sa) as i32),
            IrOp::R4ToI8 => set_i8!(dst, r4!(sa) as i64),
            IrOp::R8ToI4 => set_i4!(dst, r8!(sa) as i32),
            IrOp::R8ToI8 => set_i8!(dst, r8!(sa) as i64),
            IrOp::R4ToR8 => set_r8!(dst, r4!(sa) as f64),
            IrOp::R8ToR4 => set_r4!(dst, r8!(sa) as f32),
            IrOp::ConvOvfI4 | IrOp::ConvOvfI8 => {
                let v: i128 = if instr.op == IrOp::ConvOvfI4 {
                    i4!(sa) as i128
                } else {
                    i8v!(sa) as i128
                };
                let (width, signed) = unpack2(instr.imm);
                let (lo, hi) = ovf_bounds(width, signed != 0);
                if v < lo || v > hi {
                    return self.raise(ctx, FaultKind::Overflow);
                }
                if width == 8 {
                    self.stack[dst] = v as u64;
                } else {
                    set_i4!(dst, v as i32);
                }
            }
            IrOp::ConvOvfR8 => {
                let f = r8!(sa);
                let (width, signed) = unpack2(instr.imm);
                let (lo, hi) = ovf_bounds(width, signed != 0);
                let t = f.trunc();
                if f.is_nan() || t < lo as f64 || t > hi as f64 {
                    return self.raise(ctx, FaultKind::Overflow);
                }
                if width == 8 {
                    self.stack[dst] = if signed != 0 { t as i64 as u64 } else { t as u64 };
                } else {
                    set_i4!(dst, t as i64 as i32);
                }
            }

            // --- indirect loads/stores ---
            IrOp::LdIndI1 => {
                let addr = self.stack[sa];
                null_check!(addr);
                set_i4!(dst, unsafe { read_mem::<i8>(addr) } as i32);
            }
            IrOp::LdIndU1 => {
                let addr = self.stack[sa];
                null_check!(addr);
                set_i4!(dst, unsafe { read_mem::<u8>(addr) } as i32);
            }
            IrOp::LdIndI2 => {
                let addr = self.stack[sa];
                null_check!(addr);
                set_i4!(dst, unsafe { read_mem::<i16>(addr) } as i32);
            }
            IrOp::LdIndU2 => {
                let addr = self.stack[sa];
                null_check!(addr);
                set_i4!(dst, unsafe { read_mem::<u16>(addr) } as i32);
            }
            IrOp::LdIndI4 => {
                let addr = self.stack[sa];
                null_check!(addr);
                set_i4!(dst, unsafe { read_mem::<i32>(addr) });
            }
            IrOp::LdIndU4 => {
                let addr = self.stack[sa];
                null_check!(addr);
                self.stack[dst] = unsafe { read_mem::<u32>(addr) } as u64;
            }
            IrOp::LdIndI8 => {
                let addr = self.stack[sa];
                null_check!(addr);
                self.stack[dst] = unsafe { read_mem::<u64>(addr) };
            }
            IrOp::LdIndR4 => {
                let addr = self.stack[sa];
                null_check!(addr);
                self.stack[dst] = unsafe { read_mem::<u32>(addr) } as u64;
            }
            IrOp::LdIndR8 => {
                let addr = self.stack[sa];
                null_check!(addr);
                self.stack[dst] = unsafe { read_mem::<u64>(addr) };
            }
            IrOp::StIndI1 => {
                let addr = self.stack[sa];
                null_check!(addr);
                unsafe { write_mem::<u8>(addr, self.stack[sb] as u8) };
            }
            IrOp::StIndI2 => {
                let addr = self.stack[sa];
                null_check!(addr);
                unsafe { write_mem::<u16>(addr, self.stack[sb] as u16) };
            }
            IrOp::StIndI4 | IrOp::StIndR4 => {
                let addr = self.stack[sa];
                null_check!(addr);
                unsafe { write_mem::<u32>(addr, self.stack[sb] as u32) };
            }
            IrOp::StIndI8 | IrOp::StIndR8 => {
                let addr = self.stack[sa];
                null_check!(addr);
                unsafe { write_mem::<u64>(addr, self.stack[sb]) };
            }
            IrOp::LdBlk => {
                let addr = self.stack[sa];
                null_check!(addr);
                let bytes = instr.imm as usize;
                unsafe {
                    std::ptr::copy_nonoverlapping(
                        addr as *const u8,
                        self.stack.as_mut_ptr().add(dst) as *mut u8,
                        bytes,
                    );
                }
            }
            IrOp::StBlk => {
                let addr = self.stack[sa];
                null_check!(addr);
                let bytes = instr.imm as usize;
                unsafe {
                    std::ptr::copy_nonoverlapping(
                        self.stack.as_ptr().add(sb) as *const u8,
                        addr as *mut u8,
                        bytes,
                    );
                }
            }
            IrOp::InitBlk => {
                let addr = self.stack[sa];
                null_check!(addr);
                unsafe { std::ptr::write_bytes(addr as *mut u8, 0, instr.imm as usize) };
            }

            // --- fields ---
            IrOp::LdFldI1 => {
                let obj = self.stack[sa];
                null_check!(obj);
                set_i4!(dst, unsafe { read_mem::<i8>(obj + instr.b as u64) } as i32);
            }
            IrOp::LdFldU1 => {
                let obj = self.stack[sa];
                null_check!(obj);
                set_i4!(dst, unsafe { read_mem::<u8>(obj + instr.b as u64) } as i32);
            }
            IrOp::LdFldI2 => {
                let obj = self.stack[sa];
                null_check!(obj);
                set_i4!(dst, unsafe { read_mem::<i16>(obj + instr.b as u64) } as i32);
            }
            IrOp::LdFldU2 => {
                let obj = self.stack[sa];
                null_check!(obj);
                set_i4!(dst, unsafe { read_mem::<u16>(obj + instr.b as u64) } as i32);
            }
            IrOp::LdFldI4 => {
                let obj = self.stack[sa];
                null_check!(obj);
                set_i4!(dst, unsafe { read_mem::<i32>(obj + instr.b as u64) });
            }
            IrOp::LdFldI8 => {
                let obj = self.stack[sa];
                null_check!(obj);
                self.stack[dst] = unsafe { read_mem::<u64>(obj + instr.b as u64) };
            }
            IrOp::LdFldR4 => {
                let obj = self.stack[sa];
                null_check!(obj);
                self.stack[dst] = unsafe { read_mem::<u32>(obj + instr.b as u64) } as u64;
            }
            IrOp::LdFldR8 => {
                let obj = self.stack[sa];
                null_check!(obj);
                self.stack[dst] = unsafe { read_mem::<u64>(obj + instr.b as u64) };
            }
            IrOp::LdFldBlk => {
                let obj = self.stack[sa];
                null_check!(obj);
                unsafe {
                    std::ptr::copy_nonoverlapping(
                        (obj + instr.b as u64) as *const u8,
                        self.stack.as_mut_ptr().add(dst) as *mut u8,
                        instr.imm as usize,
                    );
                }
            }
            IrOp::StFldI1 => {
                let obj = self.stack[sa];
                null_check!(obj);
                unsafe { write_mem::<u8>(obj + instr.imm as u64, self.stack[sb] as u8) };
            }
            IrOp::StFldI2 => {
                let obj = self.stack[sa];
                null_check!(obj);
                unsafe { write_mem::<u16>(obj + instr.imm as u64, self.stack[sb] as u16) };
            }
            IrOp::StFldI4 | IrOp::StFldR4 => {
                let obj = self.stack[sa];
                null_check!(obj);
                unsafe { write_mem::<u32>(obj + instr.imm as u64, self.stack[sb] as u32) };
            }
            IrOp::StFldI8 | IrOp::StFldR8 => {
                let obj = self.stack[sa];
                null_check!(obj);
                unsafe { write_mem::<u64>(obj + instr.imm as u64, self.stack[sb]) };
            }
            IrOp::StFldBlk => {
                let obj = self.stack[sa];
                null_check!(obj);
                let (offset, size) = unpack2(instr.imm);
                unsafe {
                    std::ptr::copy_nonoverlapping(
                        self.stack.as_ptr().add(sb) as *const u8,
                        (obj + offset as u64) as *mut u8,
                        size as usize,
                    );
                }
            }
            IrOp::LdFldAddr => {
                let obj = self.stack[sa];
                null_check!(obj);
                self.stack[dst] = obj + instr.b as u64;
            }
            IrOp::TlsAddr => {
                let Some(field) = ir.resolve.get(instr.a as usize).and_then(|e| e.as_field())
                else {
                    return Err(self.malformed("thread-static access without a field entry"));
                };
                let size = (instr.imm as usize).max(1);
                let buf = self
                    .tls
                    .entry(field)
                    .or_insert_with(|| vec![0u8; size].into_boxed_slice());
                self.stack[dst] = buf.as_ptr() as u64;
            }

            // --- object model ---
            IrOp::NewObj => return self.do_newobj(ctx, &ir, instr, base),
            IrOp::NewArr => {
                let Some(elem) = ir.resolve.get(instr.a as usize).and_then(|e| e.as_type())
                else {
                    return Err(self.malformed("array allocation without an element type"));
                };
                let len = i4!(sb) as i64;
                if len < 0 {
                    return self.raise(ctx, FaultKind::Overflow);
                }
                self.stack[dst] = self.alloc_array(elem, len as u64, instr.imm as u32);
            }
            IrOp::LdLen => {
                let arr = self.stack[sa];
                null_check!(arr);
                self.stack[dst] = unsafe { read_mem::<u64>(arr + OBJ_HEADER) };
            }
            IrOp::LdElemI1 | IrOp::LdElemU1 | IrOp::LdElemI2 | IrOp::LdElemU2
            | IrOp::LdElemI4 | IrOp::LdElemU4 | IrOp::LdElemI8 | IrOp::LdElemR4
            | IrOp::LdElemR8 => {
                let esize: u64 = match instr.op {
                    IrOp::LdElemI1 | IrOp::LdElemU1 => 1,
                    IrOp::LdElemI2 | IrOp::LdElemU2 => 2,
                    IrOp::LdElemI4 | IrOp::LdElemU4 | IrOp::LdElemR4 => 4,
                    _ => 8,
                };
                let addr = match self.elem_addr(self.stack[sa], i4!(sb) as i64, esize) {
                    Ok(a) => a,
                    Err(k) => return self.raise(ctx, k),
                };
                match instr.op {
                    IrOp::LdElemI1 => set_i4!(dst, unsafe { read_mem::<i8>(addr) } as i32),
                    IrOp::LdElemU1 => set_i4!(dst, unsafe { read_mem::<u8>(addr) } as i32),
                    IrOp::LdElemI2 => set_i4!(dst, unsafe { read_mem::<i16>(addr) } as i32),
                    IrOp::LdElemU2 => set_i4!(dst, unsafe { read_mem::<u16>(addr) } as i32),
                    IrOp::LdElemI4 => set_i4!(dst, unsafe { read_mem::<i32>(addr) }),
                    IrOp::LdElemU4 | IrOp::LdElemR4 => {
                        self.stack[dst] = unsafe { read_mem::<u32>(addr) } as u64
                    }
                    _ => self.stack[dst] = unsafe { read_mem::<u64>(addr) },
                }
            }
            IrOp::LdElemBlk => {
                let esize = self.dynamic_elem_size(ctx, self.stack[sa], instr.imm)?;
                let addr = match self.elem_addr(self.stack[sa], i4!(sb) as i64, esize) {
                    Ok(a) => a,
                    Err(k) => return self.raise(ctx, k),
                };
                unsafe {
                    std::ptr::copy_nonoverlapping(
                        addr as *const u8,
                        self.stack.as_mut_ptr().add(dst) as *mut u8,
                        esize as usize,
                    );
                }
            }
            IrOp::StElemI1 | IrOp::StElemI2 | IrOp::StElemI4 | IrOp::StElemI8
            | IrOp::StElemR4 | IrOp::StElemR8 => {
                let esize: u64 = match instr.op {
                    IrOp::StElemI1 => 1,
                    IrOp::StElemI2 => 2,
                    IrOp::StElemI4 | IrOp::StElemR4 => 4,
                    _ => 8,
                };
                let addr = match self.elem_addr(self.stack[sa], i4!(sb) as i64, esize) {
                    Ok(a) => a,
                    Err(k) => return self.raise(ctx, k),
                };
                let v = self.stack[dst];
                unsafe {
                    match esize {
                        1 => write_mem::<u8>(addr, v as u8),
                        2 => write_mem::<u16>(addr, v as u16),
                        4 => write_mem::<u32>(addr, v as u32),
                        _ => write_mem::<u64>(addr, v),
                    }
                }
            }
            IrOp::StElemBlk => {
                let esize = self.dynamic_elem_size(ctx, self.stack[sa], instr.imm)?;
                let addr = match self.elem_addr(self.stack[sa], i4!(sb) as i64, esize) {
                    Ok(a) => a,
                    Err(k) => return self.raise(ctx, k),
                };
                unsafe {
                    std::ptr::copy_nonoverlapping(
                        self.stack.as_ptr().add(dst) as *const u8,
                        addr as *mut u8,
                        esize as usize,
                    );
                }
            }
            IrOp::CastClass => {
                let Some(target) = ir.resolve.get(instr.b as usize).and_then(|e| e.as_type())
                else {
                    return Err(self.malformed("cast without a target type"));
                };
                let obj = self.stack[sa];
                if obj != 0 && !self.cast_ok(ctx, obj, target) {
                    return self.raise(ctx, FaultKind::InvalidCast);
                }
                self.stack[dst] = obj;
            }
            IrOp::IsInst => {
                let Some(target) = ir.resolve.get(instr.b as usize).and_then(|e| e.as_type())
                else {
                    return Err(self.malformed("type test without a target type"));
                };
                let obj = self.stack[sa];
                self.stack[dst] = if obj != 0 && self.cast_ok(ctx, obj, target) {
                    obj
                } else {
                    0
                };
            }

            // --- calls ---
            IrOp::CallIr | IrOp::CallIrVirt | IrOp::CallNative | IrOp::CallNativeVirt
            | IrOp::CallDelegate => return self.do_call(ctx, &ir, instr, base),
            IrOp::Ret | IrOp::RetVoid => {
                let Some(f) = self.frames.pop() else {
                    return Err(self.malformed("return with no frame"));
                };
                let fi = self.frames.len();
                self.exc_flow.retain(|e| e.frame < fi);
                if instr.op == IrOp::Ret {
                    let slots = (instr.imm as u64).div_ceil(8) as usize;
                    let src = (f.base + instr.a) as usize;
                    self.stack.copy_within(src..src + slots, f.ret_dst as usize);
                }
                if f.is_newobj {
                    self.stack[f.ret_dst as usize] = f.newobj_result;
                }
                return Ok(Control::Returned);
            }

            // --- exception flow ---
            IrOp::Throw => {
                let obj = self.stack[sa];
                null_check!(obj);
                return Ok(Control::Threw(obj));
            }
            IrOp::Rethrow => {
                let fi = self.frames.len() - 1;
                let hit = self
                    .exc_flow
                    .iter()
                    .rev()
                    .find(|e| {
                        e.frame == fi
                            && ir
                                .clauses
                                .get(e.clause)
                                .map_or(false, |c| c.in_handler(ip))
                    })
                    .map(|e| e.exception);
                match hit {
                    Some(obj) => return Ok(Control::Threw(obj)),
                    None => return Err(self.malformed("rethrow outside an active handler")),
                }
            }
            IrOp::Leave => {
                return Ok(Control::Leave { target: instr.a, finally_from: None });
            }
            IrOp::LeaveChain => {
                return Ok(Control::Leave {
                    target: instr.a,
                    finally_from: Some(instr.b),
                });
            }
            IrOp::EndFinally => return Ok(Control::EndFinally),
            IrOp::EndFilter => return Ok(Control::EndFilter(i4!(sa))),

            // --- intrinsics ---
            IrOp::AtomicXchg4 => {
                let addr = self.stack[sa];
                null_check!(addr);
                let atom = unsafe { AtomicU32::from_ptr(addr as *mut u32) };
                let old = atom.swap(self.stack[sb] as u32, Ordering::SeqCst);
                set_i4!(dst, old as i32);
            }
            IrOp::AtomicXchg8 => {
                let addr = self.stack[sa];
                null_check!(addr);
                let atom = unsafe { AtomicU64::from_ptr(addr as *mut u64) };
                self.stack[dst] = atom.swap(self.stack[sb], Ordering::SeqCst);
            }
            IrOp::AtomicCmpXchg4 => {
                let addr = self.stack[sa];
                null_check!(addr);
                let comparand = self.stack[base + instr.imm as usize] as u32;
                let atom = unsafe { AtomicU32::from_ptr(addr as *mut u32) };
                let old = match atom.compare_exchange(
                    comparand,
                    self.stack[sb] as u32,
                    Ordering::SeqCst,
                    Ordering::SeqCst,
                ) {
                    Ok(v) | Err(v) => v,
                };
                set_i4!(dst, old as i32);
            }
            IrOp::AtomicCmpXchg8 => {
                let addr = self.stack[sa];
                null_check!(addr);
                let comparand = self.stack[base + instr.imm as usize];
                let atom = unsafe { AtomicU64::from_ptr(addr as *mut u64) };
                let old = match atom.compare_exchange(
                    comparand,
                    self.stack[sb],
                    Ordering::SeqCst,
                    Ordering::SeqCst,
                ) {
                    Ok(v) | Err(v) => v,
                };
                self.stack[dst] = old;
            }
            IrOp::VecPack => {
                let (count, width) = unpack2(instr.imm);
                let bytes = (count * width) as usize;
                let mut tmp = [0u8; 32];
                unsafe {
                    // Element slots are 8 bytes apart; elements are packed
                    // densely in the result.
                    for k in 0..count as usize {
                        std::ptr::copy_nonoverlapping(
                            self.stack.as_ptr().add(sb + k) as *const u8,
                            tmp.as_mut_ptr().add(k * width as usize),
                            width as usize,
                        );
                    }
                    std::ptr::copy_nonoverlapping(
                        tmp.as_ptr(),
                        self.stack.as_mut_ptr().add(dst) as *mut u8,
                        bytes,
                    );
                }
            }
            IrOp::NullableHasValue => {
                let addr = self.stack[sa];
                null_check!(addr);
                set_i4!(dst, unsafe { read_mem::<u8>(addr) } as i32);
            }
            IrOp::NullableValue => {
                let addr = self.stack[sa];
                null_check!(addr);
                if unsafe { read_mem::<u8>(addr) } == 0 {
                    return self.raise(ctx, FaultKind::NullReference);
                }
                let (offset, size) = unpack2(instr.imm);
                unsafe {
                    std::ptr::copy_nonoverlapping(
                        (addr + offset as u64) as *const u8,
                        self.stack.as_mut_ptr().add(dst) as *mut u8,
                        size as usize,
                    );
                }
            }
        }

        self.advance();
        Ok(Control::Next)
    }

    #[inline]
    fn set_ip(&mut self, ip: u32) {
        if let Some(f) = self.frames.last_mut() {
            f.ip = ip;
        }
    }

    fn dynamic_elem_size(
        &self,
        ctx: &ExecContext<'_>,
        arr: u64,
        imm: i64,
    ) -> Result<u64, ExecError> {
        if imm != 0 {
            return Ok(imm as u64);
        }
        if arr == 0 {
            // The element address check will fault; any size works here.
            return Ok(8);
        }
        let header = unsafe { read_mem::<u64>(arr) };
        let elem = TypeToken((header & !ARRAY_FLAG) as u32);
        Ok(ctx.store.type_desc(elem).map(|d| d.size).unwrap_or(8) as u64)
    }

    fn do_call(
        &mut self,
        ctx: &ExecContext<'_>,
        ir: &MethodIr,
        instr: IrInstr,
        base: usize,
    ) -> Result<Control, ExecError> {
        let Some(rc) = ir.resolve.get(instr.a as usize).and_then(|e| e.as_call()) else {
            return Err(self.malformed("call without a resolved callee"));
        };
        let rc = rc.clone();
        let argbase = base + instr.b as usize;

        if matches!(
            rc.kind,
            CallKind::InterpVirt | CallKind::NativeVirtual | CallKind::DelegateInvoke
        ) && self.stack[argbase] == 0
        {
            return self.raise(ctx, FaultKind::NullReference);
        }

        match rc.kind {
            CallKind::Interp | CallKind::InterpVirt => {
                let callee = ctx
                    .cache
                    .get_or_translate(ctx.store, &ctx.emit_cfg(), rc.method)?;
                self.advance();
                self.push_frame(callee, argbase as u32, (base + instr.dst as usize) as u32, 0, false)?;
                Ok(Control::Pushed)
            }
            CallKind::NativeStatic | CallKind::NativeInstance | CallKind::NativeVirtual => {
                let args = argbase..argbase + rc.arg_slots as usize;
                let mut ret: SmallVec<[u64; 8]> =
                    SmallVec::from_elem(0, rc.ret_slots.max(1) as usize);
                call_native(&rc, &self.stack[args], &mut ret)?;
                let d = base + instr.dst as usize;
                self.stack[d..d + rc.ret_slots as usize]
                    .copy_from_slice(&ret[..rc.ret_slots as usize]);
                self.advance();
                Ok(Control::Next)
            }
            CallKind::DelegateInvoke => {
                let obj = self.stack[argbase];
                let token = MethodToken(unsafe { read_mem::<u64>(obj + 8) } as u32);
                let bound = unsafe { read_mem::<u64>(obj + 16) };
                let Some(desc) = ctx.store.method_desc(token) else {
                    return self.raise(ctx, FaultKind::MissingMethod);
                };
                if !matches!(desc.kind, MethodKind::Interpreted(_)) {
                    return self.raise(ctx, FaultKind::MissingMethod);
                }
                let callee = ctx
                    .cache
                    .get_or_translate(ctx.store, &ctx.emit_cfg(), token)?;
                let callee_base = if bound != 0 {
                    // The bound receiver replaces the delegate reference.
                    self.stack[argbase] = bound;
                    argbase
                } else {
                    argbase + 1
                };
                self.advance();
                self.push_frame(
                    callee,
                    callee_base as u32,
                    (base + instr.dst as usize) as u32,
                    0,
                    false,
                )?;
                Ok(Control::Pushed)
            }
        }
    }

    fn do_newobj(
        &mut self,
        ctx: &ExecContext<'_>,
        ir: &MethodIr,
        instr: IrInstr,
        base: usize,
    ) -> Result<Control, ExecError> {
        let Some(rc) = ir.resolve.get(instr.a as usize).and_then(|e| e.as_call()) else {
            return Err(self.malformed("construction without a resolved constructor"));
        };
        let rc = rc.clone();
        let Some(declaring) = ctx.store.method_desc(rc.method).and_then(|d| d.declaring)
        else {
            return Err(self.malformed("constructor without a declaring type"));
        };

        let obj = self.alloc_object(declaring, instr.imm as u32);
        let argbase = base + instr.b as usize;
        let total = rc.arg_slots as usize;

        // Shift the explicit arguments up one slot and install `this`.
        for k in (0..total.saturating_sub(1)).rev() {
            self.stack[argbase + 1 + k] = self.stack[argbase + k];
        }
        self.stack[argbase] = obj;

        match rc.kind {
            CallKind::NativeStatic | CallKind::NativeInstance | CallKind::NativeVirtual => {
                let mut ret: SmallVec<[u64; 8]> = SmallVec::from_elem(0, 1);
                call_native(&rc, &self.stack[argbase..argbase + total], &mut ret)?;
                self.stack[base + instr.dst as usize] = obj;
                self.advance();
                Ok(Control::Next)
            }
            _ => {
                let callee = ctx
                    .cache
                    .get_or_translate(ctx.store, &ctx.emit_cfg(), rc.method)?;
                self.advance();
                self.push_frame(
                    callee,
                    argbase as u32,
                    (base + instr.dst as usize) as u32,
                    obj,
                    true,
                )?;
                Ok(Control::Pushed)
            }
        }
    }

    // === Exception flow ===

    /// Find and enter a handler for `obj`, unwinding frames as the search
    /// descends. `floor` is the minimum frame count that must survive;
    /// reaching it without a handler escapes.
    fn dispatch_exception(
        &mut self,
        ctx: &ExecContext<'_>,
        obj: u64,
        floor: usize,
    ) -> Result<Dispatch, ExecError> {
        let mut obj = obj;
        loop {
            let Some(f) = self.frames.last() else {
                return Ok(Dispatch::Escaped(obj));
            };
            let fi = self.frames.len() - 1;
            let ir = f.ir.clone();
            let ip = f.ip;
            let fbase = f.base;

            let mut target = None;
            for (ci, c) in ir.clauses.iter().enumerate() {
                if !c.covers(ip) {
                    continue;
                }
                match c.kind {
                    ClauseKind::Catch => {
                        if self.exception_matches(ctx, c.catch_type, obj) {
                            target = Some(ci);
                            break;
                        }
                    }
                    ClauseKind::Filter => {
                        let Some(fs) = c.filter_start else { continue };
                        self.stack[(fbase + ir.exc_slot / 8) as usize] = obj;
                        match self.run_segment(ctx, fs)? {
                            SegmentExit::Filter(v) if v != 0 => {
                                target = Some(ci);
                                break;
                            }
                            // A rejecting filter, and a filter that faults,
                            // both pass the search on.
                            SegmentExit::Filter(_) | SegmentExit::Threw(_) => {}
                            SegmentExit::Finished => {}
                            SegmentExit::Overtaken => {
                                return Ok(Dispatch::Handled { frame: fi, clause: ci })
                            }
                        }
                    }
                    ClauseKind::Finally | ClauseKind::Fault => {}
                }
            }

            if let Some(ci) = target {
                // Finally clauses nested inside the handling one run first.
                for ici in 0..ci {
                    let inner = &ir.clauses[ici];
                    if inner.kind == ClauseKind::Finally && inner.covers(ip) {
                        match self.run_segment(ctx, inner.handler_start)? {
                            SegmentExit::Finished => {}
                            SegmentExit::Threw(o2) => obj = o2,
                            SegmentExit::Overtaken => {
                                return Ok(Dispatch::Handled { frame: fi, clause: ici })
                            }
                            SegmentExit::Filter(_) => {
                                return Err(self.malformed("filter verdict from a finally body"))
                            }
                        }
                    }
                }
                self.stack[(fbase + ir.exc_slot / 8) as usize] = obj;
                self.frames[fi].ip = ir.clauses[ci].handler_start;
                self.exc_flow.push(ExcFlowEntry { exception: obj, frame: fi, clause: ci });
                debug!(method = %ir.method, clause = ci, "exception handled");
                return Ok(Dispatch::Handled { frame: fi, clause: ci });
            }

            if self.frames.len() <= floor {
                return Ok(Dispatch::Escaped(obj));
            }

            // No handler here: run cleanup clauses and unwind the frame.
            for (_, c) in ir.clauses.iter().enumerate() {
                if c.covers(ip) && matches!(c.kind, ClauseKind::Finally | ClauseKind::Fault) {
                    match self.run_segment(ctx, c.handler_start)? {
                        SegmentExit::Finished => {}
                        SegmentExit::Threw(o2) => obj = o2,
                        SegmentExit::Overtaken => {
                            return Ok(Dispatch::Handled { frame: fi, clause: 0 })
                        }
                        SegmentExit::Filter(_) => {
                            return Err(self.malformed("filter verdict from a cleanup body"))
                        }
                    }
                }
            }
            self.exc_flow.retain(|e| e.frame < fi);
            self.frames.pop();
        }
    }

    /// Run a handler body (finally, fault, or filter code) as a nested
    /// activation of the top frame.
    fn run_segment(
        &mut self,
        ctx: &ExecContext<'_>,
        start_ip: u32,
    ) -> Result<SegmentExit, ExecError> {
        let depth = self.frames.len();
        let fi = depth - 1;
        let saved_ip = self.frames[fi].ip;
        self.frames[fi].ip = start_ip;

        loop {
            if self.frames.len() < depth {
                return Err(self.malformed("handler segment returned out of its frame"));
            }
            match self.step(ctx)? {
                Control::Next | Control::Pushed | Control::Returned => {}
                Control::Threw(o) => match self.dispatch_exception(ctx, o, depth)? {
                    Dispatch::Handled { frame, clause } => {
                        // A handler outside the segment body means the
                        // segment (and whatever scheduled it) is dead.
                        if frame == fi {
                            let outside = self.frames[fi]
                                .ir
                                .clauses
                                .get(clause)
                                .map_or(true, |c| c.try_start < start_ip);
                            if outside {
                                return Ok(SegmentExit::Overtaken);
                            }
                        }
                    }
                    Dispatch::Escaped(o) => {
                        self.frames[fi].ip = saved_ip;
                        return Ok(SegmentExit::Threw(o));
                    }
                },
                Control::Leave { target, finally_from } => {
                    self.run_leave(ctx, target, finally_from)?;
                }
                Control::EndFinally => {
                    if self.frames.len() != depth {
                        return Err(self.malformed("stray handler exit in a callee"));
                    }
                    self.frames[fi].ip = saved_ip;
                    return Ok(SegmentExit::Finished);
                }
                Control::EndFilter(v) => {
                    if self.frames.len() != depth {
                        return Err(self.malformed("stray filter verdict in a callee"));
                    }
                    self.frames[fi].ip = saved_ip;
                    return Ok(SegmentExit::Filter(v));
                }
            }
        }
    }

    /// Transfer control out of a protected region, running the finally
    /// chain on the way.
    fn run_leave(
        &mut self,
        ctx: &ExecContext<'_>,
        target: u32,
        finally_from: Option<u32>,
    ) -> Result<(), ExecError> {
        let Some(f) = self.frames.last() else {
            return Err(self.malformed("leave with no frame"));
        };
        let fi = self.frames.len() - 1;
        let ir = f.ir.clone();
        let ip = f.ip;

        // Leaving a handler deactivates its exception record.
        self.exc_flow.retain(|e| {
            !(e.frame == fi
                && ir.clauses.get(e.clause).map_or(false, |c| c.in_handler(ip)))
        });

        if let Some(from) = finally_from {
            for ci in from as usize..ir.clauses.len() {
                let c = &ir.clauses[ci];
                let exits_try = !(target >= c.try_start && target < c.try_end);
                if c.kind == ClauseKind::Finally && c.covers(ip) && exits_try {
                    match self.run_segment(ctx, c.handler_start)? {
                        SegmentExit::Finished => {}
                        SegmentExit::Overtaken => return Ok(()),
                        SegmentExit::Threw(o) => {
                            // The exception replaces the leave.
                            return match self.dispatch_exception(ctx, o, 0)? {
                                Dispatch::Handled { .. } => Ok(()),
                                Dispatch::Escaped(o) => Err(self.unhandled(ctx, o)),
                            };
                        }
                        SegmentExit::Filter(_) => {
                            return Err(self.malformed("filter verdict from a finally body"))
                        }
                    }
                }
            }
        }
        self.frames[fi].ip = target;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MethodIrCache;
    use crate::emit::intrinsics::IntrinsicTable;
    use crate::engine::{Machine, MachineConfig};
    use crate::metadata::{
        ClauseKind, IlExceptionClause, MetadataStore, MethodBody, MethodDesc, PrimKind, TypeDesc,
    };

    struct Fixture {
        store: MetadataStore,
        cache: MethodIrCache,
        intrinsics: IntrinsicTable,
        i4: TypeToken,
    }

    impl Fixture {
        fn new() -> Self {
            let mut store = MetadataStore::with_runtime_types();
            let i4 = store.add_type(TypeDesc::primitive("System.Int32", PrimKind::I4));
            Self {
                store,
                cache: MethodIrCache::new(),
                intrinsics: IntrinsicTable::with_defaults(),
                i4,
            }
        }

        fn ctx(&self) -> ExecContext<'_> {
            ExecContext {
                store: &self.store,
                cache: &self.cache,
                intrinsics: &self.intrinsics,
                trampolines: None,
            }
        }

        fn method(
            &mut self,
            params: Vec<TypeToken>,
            ret: Option<TypeToken>,
            locals: Vec<TypeToken>,
            clauses: Vec<IlExceptionClause>,
            code: Vec<u8>,
        ) -> MethodToken {
            self.store.add_method(MethodDesc {
                name: "M".into(),
                declaring: None,
                params,
                ret,
                is_static: true,
                is_virtual: false,
                is_delegate_invoke: false,
                kind: crate::metadata::MethodKind::Interpreted(MethodBody {
                    code,
                    max_stack: 8,
                    locals,
                    clauses,
                    init_locals: true,
                }),
            })
        }
    }

    #[test]
    fn test_add_two_ints() {
        let mut fx = Fixture::new();
        let i4 = fx.i4;
        // ldarg.0; ldarg.1; add; ret
        let m = fx.method(vec![i4, i4], Some(i4), vec![], vec![], vec![0x02, 0x03, 0x58, 0x2A]);
        let mut machine = Machine::default();
        let ret = machine.execute(&fx.ctx(), m, &[40, 2]).unwrap();
        assert_eq!(ret[0] as u32 as i32, 42);
    }

    #[test]
    fn test_loop_sums_to_ten() {
        let mut fx = Fixture::new();
        let i4 = fx.i4;
        // acc = 0; i = 0; while (i < 5) { acc += i; i += 1 } return acc
        let code = vec![
            0x16, 0x0A, 0x16, 0x0B, // 0..=3: init acc, i
            0x07, 0x1B, 0x2F, 10, // 4..=7: ldloc.1; ldc.i4.5; bge.s -> 18
            0x06, 0x07, 0x58, 0x0A, // 8..=11: acc += i
            0x07, 0x17, 0x58, 0x0B, // 12..=15: i += 1
            0x2B, 0xF2, // 16-17: br.s -> 4
            0x06, 0x2A, // 18-19: ldloc.0; ret
        ];
        let m = fx.method(vec![], Some(i4), vec![i4, i4], vec![], code);
        let mut machine = Machine::default();
        let ret = machine.execute(&fx.ctx(), m, &[]).unwrap();
        assert_eq!(ret[0] as u32 as i32, 10);
    }

    #[test]
    fn test_nested_calls_preserve_frames() {
        let mut fx = Fixture::new();
        let i4 = fx.i4;
        // inner(x) = x + 1
        let inner = fx.method(vec![i4], Some(i4), vec![], vec![], vec![0x02, 0x17, 0x58, 0x2A]);
        // outer(x) = inner(inner(x))
        let mut code = vec![0x02, 0x28];
        code.extend_from_slice(&inner.0.to_le_bytes());
        code.push(0x28);
        code.extend_from_slice(&inner.0.to_le_bytes());
        code.push(0x2A);
        let outer = fx.method(vec![i4], Some(i4), vec![], vec![], code);

        let mut machine = Machine::default();
        let ret = machine.execute(&fx.ctx(), outer, &[40]).unwrap();
        assert_eq!(ret[0] as u32 as i32, 42);
        assert_eq!(machine.depth(), 0);
    }

    #[test]
    fn test_deep_recursion_hits_frame_limit() {
        let mut fx = Fixture::new();
        let i4 = fx.i4;
        // Method tokens are dense indices, so the first method added to a
        // fresh store gets token 0; embed it to make the body call itself.
        let mut code = vec![0x02, 0x28];
        code.extend_from_slice(&0u32.to_le_bytes());
        code.push(0x2A);
        let looper = fx.method(vec![i4], Some(i4), vec![], vec![], code);
        assert_eq!(looper, MethodToken(0));

        let mut machine =
            Machine::new(MachineConfig { max_frames: 64, ..Default::default() });
        let err = machine.execute(&fx.ctx(), looper, &[1]).unwrap_err();
        assert!(matches!(err, ExecError::FrameOverflow { .. }));
    }

    #[test]
    fn test_catch_handles_divide_by_zero() {
        let mut fx = Fixture::new();
        let i4 = fx.i4;
        let exc = fx.store.well_known().unwrap().exception;
        // try { loc0 = 7 / 0 } catch (Exception) { loc0 = -1 }; return loc0
        // 0 ldc.i4.7 | 1 ldc.i4.0 | 2 div | 3 stloc.0 | 4-5 leave.s -> 10
        // 6 ldc.i4.m1 | 7 stloc.0 | 8-9 leave.s -> 10 | 10 ldloc.0 | 11 ret
        let code = vec![
            0x1D, 0x16, 0x5B, 0x0A, 0xDE, 4, // try
            0x15, 0x0A, 0xDE, 0, // handler
            0x06, 0x2A,
        ];
        let clauses = vec![IlExceptionClause {
            kind: ClauseKind::Catch,
            try_start: 0,
            try_len: 6,
            handler_start: 6,
            handler_len: 4,
            filter_start: None,
            catch_type: Some(exc),
        }];
        let m = fx.method(vec![], Some(i4), vec![i4], clauses, code);
        let mut machine = Machine::default();
        let ret = machine.execute(&fx.ctx(), m, &[]).unwrap();
        assert_eq!(ret[0] as u32 as i32, -1);
    }

    #[test]
    fn test_finally_runs_on_normal_leave() {
        let mut fx = Fixture::new();
        let i4 = fx.i4;
        // loc0 = 1; try { leave } finally { loc0 = loc0 + 41 } return loc0
        // 0: ldc.i4.1 ; 1: stloc.0
        // try [2,4): 2-3 leave.s -> 9
        // finally [4,9): 4 ldloc.0 ; 5 ldc.i4.s 41 ; 7 add ; 8?? need
        // stloc + endfinally. Recount: 4 ldloc.0, 5-6 ldc.i4.s 41, 7 add,
        // 8 stloc.0, 9 endfinally => handler [4,10), return at 10.
        let code = vec![
            0x17, 0x0A, // loc0 = 1
            0xDE, 6, // 2-3: leave.s (next 4) -> 10
            0x06, 0x1F, 41, 0x58, 0x0A, 0xDC, // 4..=9: finally
            0x06, 0x2A, // 10-11: ldloc.0; ret
        ];
        let clauses = vec![IlExceptionClause {
            kind: ClauseKind::Finally,
            try_start: 2,
            try_len: 2,
            handler_start: 4,
            handler_len: 6,
            filter_start: None,
            catch_type: None,
        }];
        let m = fx.method(vec![], Some(i4), vec![i4], clauses, code);
        let mut machine = Machine::default();
        let ret = machine.execute(&fx.ctx(), m, &[]).unwrap();
        assert_eq!(ret[0] as u32 as i32, 42);
    }

    #[test]
    fn test_unhandled_fault_reports_type() {
        let mut fx = Fixture::new();
        let i4 = fx.i4;
        // 1 / 0 with no clauses
        let m = fx.method(vec![], Some(i4), vec![], vec![], vec![0x17, 0x16, 0x5B, 0x2A]);
        let mut machine = Machine::default();
        let err = machine.execute(&fx.ctx(), m, &[]).unwrap_err();
        match err {
            ExecError::Unhandled { type_name } => {
                assert!(type_name.contains("DivideByZero"), "{}", type_name);
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn test_exception_unwinds_callee_into_caller_catch() {
        let mut fx = Fixture::new();
        let i4 = fx.i4;
        let exc = fx.store.well_known().unwrap().exception;
        // callee: 1 / 0
        let callee = fx.method(vec![], Some(i4), vec![], vec![], vec![0x17, 0x16, 0x5B, 0x2A]);
        // caller: try { loc0 = callee() } catch { loc0 = -1 } return loc0
        // 0-4: call (5 bytes: 0x28 + token) ; 5: stloc.0 ; 6-7: leave.s -> 12
        // handler [8,12): 8 ldc.i4.m1 ; 9 stloc.0 ; 10-11 leave.s -> 12
        // 12: ldloc.0 ; 13: ret
        let mut code = vec![0x28];
        code.extend_from_slice(&callee.0.to_le_bytes());
        code.extend_from_slice(&[0x0A, 0xDE, 4]);
        code.extend_from_slice(&[0x15, 0x0A, 0xDE, 0]);
        code.extend_from_slice(&[0x06, 0x2A]);
        let clauses = vec![IlExceptionClause {
            kind: ClauseKind::Catch,
            try_start: 0,
            try_len: 8,
            handler_start: 8,
            handler_len: 4,
            filter_start: None,
            catch_type: Some(exc),
        }];
        let caller = fx.method(vec![], Some(i4), vec![i4], clauses, code);
        let mut machine = Machine::default();
        let ret = machine.execute(&fx.ctx(), caller, &[]).unwrap();
        assert_eq!(ret[0] as u32 as i32, -1);
        assert_eq!(machine.depth(), 0);
    }
}
