//! Evaluation-stack simulation during emission
//!
//! The tracker mirrors the source stack machine through one linear pass:
//! every pushed value gets a reduced numeric category and a concrete byte
//! offset in the frame's evaluation-stack region. Offsets only grow while
//! a value is live, and every slot starts 8-byte aligned, so a slot index
//! is always `offset / 8`.
//!
//! At branches the full state is frozen into a [`StackShape`] keyed by
//! the target block. A block reached twice with different shapes is a
//! translation-fatal inconsistency, not a recoverable condition.

use smallvec::SmallVec;

use crate::metadata::{MetadataStore, PrimKind, TypeToken};

/// Reduced numeric category of one evaluation-stack slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StackKind {
    I4,
    I8,
    R4,
    R8,
    /// Opaque aggregate tracked by byte size only.
    Vt,
}

impl StackKind {
    /// Reduce a source type to its stack category and logical byte size.
    ///
    /// Enums reduce to their underlying primitive; reference, array,
    /// string, and pointer types reduce to the register width; value
    /// types over 8 bytes stay opaque.
    pub fn reduce(store: &MetadataStore, token: TypeToken) -> (StackKind, u32) {
        let Some(desc) = store.type_desc(token) else {
            return (StackKind::I8, 8);
        };
        if !desc.is_value_type {
            return (StackKind::I8, 8);
        }
        let prim = if desc.is_enum { desc.underlying } else { desc.prim };
        match prim {
            Some(PrimKind::R4) => (StackKind::R4, 4),
            Some(PrimKind::R8) => (StackKind::R8, 8),
            Some(p) if p.size() <= 4 => (StackKind::I4, 4),
            Some(_) => (StackKind::I8, 8),
            None if desc.size <= 8 => (StackKind::I8, 8),
            None => (StackKind::Vt, desc.size),
        }
    }

    /// Whether the category occupies a single register-width slot.
    #[inline]
    pub fn is_scalar(self) -> bool {
        !matches!(self, Self::Vt)
    }
}

/// One simulated stack entry: category, logical byte size, and the byte
/// offset of its first slot within the frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EvalStackSlot {
    pub kind: StackKind,
    pub size: u32,
    pub offset: u32,
}

impl EvalStackSlot {
    /// Frame slot index of the entry's first 8-byte slot.
    #[inline]
    pub fn slot(&self) -> u32 {
        self.offset / 8
    }

    /// 8-byte slots the entry occupies.
    #[inline]
    pub fn slot_count(&self) -> u32 {
        self.size.div_ceil(8).max(1)
    }
}

/// Frozen snapshot of the tracker, stored per forward-branch target.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StackShape {
    pub slots: SmallVec<[EvalStackSlot; 8]>,
}

impl StackShape {
    #[inline]
    pub fn depth(&self) -> usize {
        self.slots.len()
    }
}

/// Flow state queued on the emitter worklist for one branch target.
#[derive(Debug, Clone)]
pub struct FlowInfo {
    /// IL offset of the target block.
    pub target_il: u32,
    pub shape: StackShape,
}

/// The live tracker for the block currently being emitted.
#[derive(Debug)]
pub struct EvalStack {
    slots: SmallVec<[EvalStackSlot; 16]>,
    /// Byte offset where the evaluation-stack region starts.
    base: u32,
    /// Next free byte offset.
    top: u32,
    /// High-water mark relative to `base`.
    max: u32,
}

impl EvalStack {
    pub fn new(base: u32) -> Self {
        Self {
            slots: SmallVec::new(),
            base,
            top: base,
            max: 0,
        }
    }

    #[inline]
    pub fn depth(&self) -> usize {
        self.slots.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Maximum extent in bytes the stack reached, relative to its base.
    #[inline]
    pub fn max_bytes(&self) -> u32 {
        self.max
    }

    /// Push a value of the given category and logical size, returning its
    /// placed entry. Every entry starts on an 8-byte boundary.
    pub fn push(&mut self, kind: StackKind, size: u32) -> EvalStackSlot {
        let entry = EvalStackSlot {
            kind,
            size,
            offset: self.top,
        };
        self.top += entry.slot_count() * 8;
        self.max = self.max.max(self.top - self.base);
        self.slots.push(entry);
        entry
    }

    /// Pop the top entry. Emission never pops an empty stack for
    /// well-formed input; the caller maps `None` to a translation fault.
    pub fn pop(&mut self) -> Option<EvalStackSlot> {
        let entry = self.slots.pop()?;
        self.top = entry.offset;
        Some(entry)
    }

    /// Entry `n` positions below the top without popping (0 = top).
    pub fn peek(&self, n: usize) -> Option<&EvalStackSlot> {
        let len = self.slots.len();
        (n < len).then(|| &self.slots[len - 1 - n])
    }

    /// Drop everything, resetting the top to the region base.
    pub fn clear(&mut self) {
        self.slots.clear();
        self.top = self.base;
    }

    /// Freeze the current state for a branch target.
    pub fn snapshot(&self) -> StackShape {
        StackShape {
            slots: self.slots.iter().copied().collect(),
        }
    }

    /// Replace the current state with a previously frozen shape.
    pub fn restore(&mut self, shape: &StackShape) {
        self.slots = shape.slots.iter().copied().collect();
        self.top = match self.slots.last() {
            Some(s) => s.offset + s.slot_count() * 8,
            None => self.base,
        };
        self.max = self.max.max(self.top - self.base);
    }
}
