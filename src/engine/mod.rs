//! The per-thread execution engine
//!
//! A [`Machine`] owns the mutable run state for one thread: a fixed-size
//! value stack of 8-byte slots, the frame stack, the exception-flow
//! stack, per-thread static storage, and the object heap. Translated
//! method bodies and metadata are shared across machines through
//! [`crate::cache::MethodIrCache`] and [`crate::metadata::MetadataStore`].
//!
//! Frames overlap: a callee's frame base is the slot of its first
//! argument inside the caller's evaluation-stack region, so argument
//! passing is free and a return writes back to the base of the consumed
//! argument run.

pub mod exec;

use std::sync::Arc;

use gxhash::HashMap;
use smallvec::SmallVec;
use tracing::debug;

use crate::bridge::{NativeError, TrampolineTable};
use crate::cache::MethodIrCache;
use crate::emit::intrinsics::IntrinsicTable;
use crate::emit::{EmitConfig, EmitError};
use crate::ir::MethodIr;
use crate::metadata::{FieldToken, MetadataStore, MethodToken, WellKnown};

/// Sizing and diagnostics knobs. Arenas are allocated once at machine
/// creation and never grow, so addresses taken into them stay valid.
#[derive(Debug, Clone)]
pub struct MachineConfig {
    /// Capacity of the value stack in 8-byte slots.
    pub value_stack_slots: usize,
    /// Maximum interpreter frame depth.
    pub max_frames: usize,
    /// Emit a trace event per executed instruction.
    pub trace: bool,
}

impl Default for MachineConfig {
    fn default() -> Self {
        Self {
            value_stack_slots: 128 * 1024,
            max_frames: 4096,
            trace: false,
        }
    }
}

/// Shared, immutable context for one execution: metadata, the
/// translation cache, and the emission-time configuration.
#[derive(Clone, Copy)]
pub struct ExecContext<'a> {
    pub store: &'a MetadataStore,
    pub cache: &'a MethodIrCache,
    pub intrinsics: &'a IntrinsicTable,
    pub trampolines: Option<&'a TrampolineTable>,
}

impl<'a> ExecContext<'a> {
    pub(crate) fn emit_cfg(&self) -> EmitConfig<'a> {
        EmitConfig {
            intrinsics: self.intrinsics,
            trampolines: self.trampolines,
        }
    }
}

/// Runtime faults the engine raises as managed exceptions when the
/// well-known types are registered, and as hard errors otherwise.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    NullReference,
    IndexOutOfRange,
    DivideByZero,
    Overflow,
    InvalidCast,
    MissingMethod,
}

impl FaultKind {
    pub(crate) fn token(self, wk: &WellKnown) -> crate::metadata::TypeToken {
        match self {
            Self::NullReference => wk.null_reference,
            Self::IndexOutOfRange => wk.index_out_of_range,
            Self::DivideByZero => wk.divide_by_zero,
            Self::Overflow => wk.overflow,
            Self::InvalidCast => wk.invalid_cast,
            Self::MissingMethod => wk.missing_method,
        }
    }

    pub(crate) fn describe(self) -> &'static str {
        match self {
            Self::NullReference => "null reference",
            Self::IndexOutOfRange => "index out of range",
            Self::DivideByZero => "division by zero",
            Self::Overflow => "arithmetic overflow",
            Self::InvalidCast => "invalid cast",
            Self::MissingMethod => "missing method",
        }
    }
}

/// Execution failures that surface to the embedder.
#[derive(Debug)]
pub enum ExecError {
    /// The value stack cannot hold another frame.
    StackExhausted { needed: u32, capacity: usize },
    /// Frame depth limit reached.
    FrameOverflow { depth: usize },
    /// A managed exception left the outermost frame.
    Unhandled { type_name: String },
    /// A runtime fault with no well-known exception type to throw.
    Fault {
        kind: FaultKind,
        method: MethodToken,
        ip: u32,
    },
    /// The instruction stream referenced something it should not.
    Malformed {
        method: MethodToken,
        ip: u32,
        what: &'static str,
    },
    Emit(EmitError),
    Native(NativeError),
}

impl std::fmt::Display for ExecError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::StackExhausted { needed, capacity } => {
                write!(f, "value stack exhausted: need {} slots of {}", needed, capacity)
            }
            Self::FrameOverflow { depth } => {
                write!(f, "frame depth limit reached at {}", depth)
            }
            Self::Unhandled { type_name } => {
                write!(f, "unhandled exception of type {}", type_name)
            }
            Self::Fault { kind, method, ip } => {
                write!(f, "{} in {} at instruction {}", kind.describe(), method, ip)
            }
            Self::Malformed { method, ip, what } => {
                write!(f, "malformed code in {} at instruction {}: {}", method, ip, what)
            }
            Self::Emit(e) => write!(f, "{}", e),
            Self::Native(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for ExecError {}

impl From<EmitError> for ExecError {
    fn from(e: EmitError) -> Self {
        Self::Emit(e)
    }
}

impl From<NativeError> for ExecError {
    fn from(e: NativeError) -> Self {
        Self::Native(e)
    }
}

/// One interpreter frame. `base` is an absolute slot index into the
/// value stack; everything else in the frame layout is relative to it.
pub(crate) struct Frame {
    pub ir: Arc<MethodIr>,
    pub base: u32,
    /// Instruction index of the next (or currently faulting) instruction.
    pub ip: u32,
    /// Absolute slot index where the return value lands.
    pub ret_dst: u32,
    /// Constructed object reference for allocate-and-construct frames;
    /// written to `ret_dst` when the constructor returns.
    pub newobj_result: u64,
    pub is_newobj: bool,
}

/// An active exception or leave record. Entries are pushed when a catch
/// or filter handler is entered and popped when control leaves it or its
/// frame unwinds.
#[derive(Debug, Clone, Copy)]
pub struct ExcFlowEntry {
    pub exception: u64,
    pub frame: usize,
    pub clause: usize,
}

/// Per-thread interpreter instance.
pub struct Machine {
    pub(crate) config: MachineConfig,
    pub(crate) stack: Box<[u64]>,
    pub(crate) frames: Vec<Frame>,
    pub(crate) exc_flow: Vec<ExcFlowEntry>,
    /// Object allocations; boxed so addresses handed out stay pinned.
    pub(crate) heap: Vec<Box<[u64]>>,
    /// Interned string objects by content.
    pub(crate) strings: HashMap<Arc<str>, u64>,
    /// Per-thread static storage, lazily allocated per field.
    pub(crate) tls: HashMap<FieldToken, Box<[u8]>>,
}

impl Default for Machine {
    fn default() -> Self {
        Self::new(MachineConfig::default())
    }
}

impl Machine {
    pub fn new(config: MachineConfig) -> Self {
        let stack = vec![0u64; config.value_stack_slots].into_boxed_slice();
        Self {
            config,
            stack,
            frames: Vec::new(),
            exc_flow: Vec::new(),
            heap: Vec::new(),
            strings: HashMap::default(),
            tls: HashMap::default(),
        }
    }

    /// Current frame depth, mostly for diagnostics and tests.
    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    /// Method tokens of the live frames, outermost first. Diagnostic
    /// snapshot for fault reporting and tests.
    pub fn executing_methods(&self) -> Vec<MethodToken> {
        self.frames.iter().map(|f| f.ir.method).collect()
    }

    /// Run a method to completion. `args` are the packed argument slots
    /// in frame layout order; the returned slots hold the packed return
    /// value (empty for void).
    pub fn execute(
        &mut self,
        ctx: &ExecContext<'_>,
        method: MethodToken,
        args: &[u64],
    ) -> Result<SmallVec<[u64; 4]>, ExecError> {
        let ir = ctx
            .cache
            .get_or_translate(ctx.store, &ctx.emit_cfg(), method)?;

        self.frames.clear();
        self.exc_flow.clear();

        // The entry frame sits just above a reserved return area at the
        // bottom of the value stack.
        let ret_slots = ir.ret.value_slots();
        let base = ret_slots;
        let arg_slots = (ir.args_size / 8) as usize;
        if args.len() != arg_slots {
            return Err(ExecError::Malformed {
                method,
                ip: 0,
                what: "argument slot count does not match the method signature",
            });
        }
        for s in 0..ret_slots as usize {
            self.stack[s] = 0;
        }
        self.stack[base as usize..base as usize + args.len()].copy_from_slice(args);

        debug!(method = %method, frame_bytes = ir.frame_bytes(), "entering");
        self.push_frame(ir, base, 0, 0, false)?;
        self.run(ctx)?;

        let ret_slots = ret_slots as usize;
        Ok(SmallVec::from_slice(&self.stack[..ret_slots]))
    }

    pub(crate) fn push_frame(
        &mut self,
        ir: Arc<MethodIr>,
        base: u32,
        ret_dst: u32,
        newobj_result: u64,
        is_newobj: bool,
    ) -> Result<(), ExecError> {
        if self.frames.len() >= self.config.max_frames {
            return Err(ExecError::FrameOverflow { depth: self.frames.len() });
        }
        let top = base + ir.frame_slots();
        if top as usize > self.stack.len() {
            return Err(ExecError::StackExhausted {
                needed: top,
                capacity: self.stack.len(),
            });
        }
        // Locals and the exception reservation start zeroed when asked.
        if ir.init_locals {
            let lo = (base + ir.args_size / 8) as usize;
            let hi = (base + ir.eval_base / 8) as usize;
            self.stack[lo..hi].fill(0);
        } else {
            self.stack[(base + ir.exc_slot / 8) as usize] = 0;
        }
        self.frames.push(Frame {
            ir,
            base,
            ip: 0,
            ret_dst,
            newobj_result,
            is_newobj,
        });
        Ok(())
    }
}
