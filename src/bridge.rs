//! Bridge between interpreter slots and precompiled native code
//!
//! At emission time, [`resolve_call`] decides the calling shape of a
//! callee (interpreted frame vs. native trampoline, direct vs. virtual
//! vs. delegate invoke) and binds the trampoline by exact signature-string
//! match. At run time, [`call_native`] copies argument slots from the
//! value stack into the trampoline's expected layout and translates the
//! return value back.
//!
//! The [`TrampolineTable`] is built by the embedder during an explicit
//! initialization phase and handed to the emitter by reference; the core
//! never reaches for an ambient global.

use std::sync::Arc;

use dashmap::DashMap;
use smallvec::SmallVec;
use tracing::warn;

use crate::abi::{classify_type, AbiClass, AbiError};
use crate::metadata::{MetadataStore, MethodKind, MethodToken, TypeToken};
use crate::signature::{encode_method, SigError};

/// Argument/return buffer a trampoline operates on. `args` holds packed
/// 8-byte slots in call order; the trampoline writes its result to `ret`.
#[derive(Debug, Default)]
pub struct CallBuffer {
    pub args: SmallVec<[u64; 16]>,
    /// Up to 32 bytes of direct return payload (larger returns go through
    /// a hidden pointer in `args[0]`).
    pub ret: [u64; 4],
}

/// A precompiled native glue function adapting slot layout to one exact
/// signature shape.
pub type Trampoline = Arc<dyn Fn(&mut CallBuffer) -> Result<(), NativeError> + Send + Sync>;

/// Errors crossing the native boundary.
#[derive(Debug, Clone)]
pub enum NativeError {
    /// No trampoline registered under the signature key.
    MissingTrampoline { sig: String },
    /// Token does not resolve to a method descriptor.
    UnknownMethod(MethodToken),
    /// Signature could not be built for the callee.
    Sig(SigError),
    /// The native callee reported a failure.
    Trap(String),
}

impl std::fmt::Display for NativeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MissingTrampoline { sig } => {
                write!(f, "no trampoline registered for signature '{}'", sig)
            }
            Self::UnknownMethod(m) => write!(f, "unresolved method {}", m),
            Self::Sig(e) => write!(f, "{}", e),
            Self::Trap(msg) => write!(f, "native callee failed: {}", msg),
        }
    }
}

impl std::error::Error for NativeError {}

impl From<SigError> for NativeError {
    fn from(e: SigError) -> Self {
        Self::Sig(e)
    }
}

impl From<AbiError> for NativeError {
    fn from(e: AbiError) -> Self {
        Self::Sig(SigError::Abi(e))
    }
}

/// Process-wide table of native trampolines keyed by signature string.
///
/// Populated once during embedder initialization; lookups afterwards are
/// concurrent and lock-free.
#[derive(Default)]
pub struct TrampolineTable {
    entries: DashMap<String, Trampoline>,
}

impl TrampolineTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a trampoline under its exact signature key. A later
    /// registration for the same key replaces the earlier one.
    pub fn register(&self, sig: impl Into<String>, f: Trampoline) {
        let sig = sig.into();
        if self.entries.insert(sig.clone(), f).is_some() {
            warn!(sig = %sig, "trampoline registration shadows an earlier entry");
        }
    }

    pub fn lookup(&self, sig: &str) -> Option<Trampoline> {
        self.entries.get(sig).map(|e| e.value().clone())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl std::fmt::Debug for TrampolineTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrampolineTable")
            .field("entries", &self.entries.len())
            .finish()
    }
}

/// Calling shape of a resolved callee.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallKind {
    /// Direct call into another interpreted frame.
    Interp,
    /// Interpreted call with a null check on the receiver.
    InterpVirt,
    NativeStatic,
    NativeInstance,
    NativeVirtual,
    DelegateInvoke,
}

/// ABI signature of a call: return class plus parameter classes, with the
/// rendered key string retained for diagnostics.
#[derive(Debug, Clone)]
pub struct AbiSig {
    pub ret: AbiClass,
    pub params: SmallVec<[AbiClass; 8]>,
    pub key: String,
}

/// One argument's slot placement in the callee frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AbiArg {
    pub class: AbiClass,
    /// Byte offset of the argument within the frame's argument region.
    pub offset: u32,
    /// 8-byte slots the stored value occupies.
    pub slots: u32,
}

/// Emission-time resolution of one call site.
#[derive(Clone)]
pub struct ResolvedCall {
    pub method: MethodToken,
    pub kind: CallKind,
    pub sig: AbiSig,
    /// Bound glue function, for the native kinds.
    pub trampoline: Option<Trampoline>,
    /// 8-byte slots consumed by the packed arguments on the eval stack.
    pub arg_slots: u32,
    /// 8-byte slots of the returned value (0 for void).
    pub ret_slots: u32,
}

impl std::fmt::Debug for ResolvedCall {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResolvedCall")
            .field("method", &self.method)
            .field("kind", &self.kind)
            .field("sig", &self.sig.key)
            .field("arg_slots", &self.arg_slots)
            .field("ret_slots", &self.ret_slots)
            .finish()
    }
}

/// Compute the argument region layout for a parameter list: one
/// [`AbiArg`] per parameter at 8-byte-aligned offsets, plus the total
/// region size in bytes.
pub fn layout_args(
    store: &MetadataStore,
    params: &[TypeToken],
) -> Result<(Vec<AbiArg>, u32), AbiError> {
    let mut args = Vec::with_capacity(params.len());
    let mut offset = 0u32;
    for &p in params {
        let class = classify_type(store, p)?;
        let slots = class.value_slots();
        args.push(AbiArg { class, offset, slots });
        offset += slots * 8;
    }
    Ok((args, offset))
}

/// Resolve one call site against the callee's descriptor and, for native
/// callees, the trampoline table.
pub fn resolve_call(
    store: &MetadataStore,
    table: Option<&TrampolineTable>,
    method: MethodToken,
    virtual_call: bool,
) -> Result<ResolvedCall, NativeError> {
    let desc = store
        .method_desc(method)
        .ok_or(NativeError::UnknownMethod(method))?;

    let ret = match desc.ret {
        None => AbiClass::Void,
        Some(t) => classify_type(store, t)?,
    };
    let mut params: SmallVec<[AbiClass; 8]> = SmallVec::new();
    let mut arg_slots = 0u32;
    for &p in &desc.params {
        let class = classify_type(store, p)?;
        arg_slots += class.value_slots();
        params.push(class);
    }
    let key = encode_method(store, desc.ret, &desc.params)?;
    let ret_slots = match ret {
        AbiClass::Void => 0,
        other => other.value_slots(),
    };
    let sig = AbiSig { ret, params, key };

    // Delegate invokes resolve their real target from the delegate object
    // at dispatch time, so no trampoline is bound here.
    let (kind, trampoline) = if desc.is_delegate_invoke {
        (CallKind::DelegateInvoke, None)
    } else {
        match &desc.kind {
            MethodKind::Interpreted(_) => {
                let kind = if virtual_call { CallKind::InterpVirt } else { CallKind::Interp };
                (kind, None)
            }
            MethodKind::Native => {
                let kind = if virtual_call && desc.is_virtual {
                    CallKind::NativeVirtual
                } else if desc.is_static {
                    CallKind::NativeStatic
                } else {
                    CallKind::NativeInstance
                };
                let t = bind_trampoline(table, &sig)?;
                (kind, Some(t))
            }
        }
    };

    Ok(ResolvedCall {
        method,
        kind,
        sig,
        trampoline,
        arg_slots,
        ret_slots,
    })
}

fn bind_trampoline(
    table: Option<&TrampolineTable>,
    sig: &AbiSig,
) -> Result<Trampoline, NativeError> {
    table
        .and_then(|t| t.lookup(&sig.key))
        .ok_or_else(|| NativeError::MissingTrampoline { sig: sig.key.clone() })
}

/// Copy a bucketed block between slot runs with a fixed-width copy.
///
/// Buckets match the classifier's aggregate sizes; partial trailing slots
/// are copied whole, which is safe because slot runs are 8-byte units.
#[inline]
pub fn copy_block(dst: &mut [u64], src: &[u64], bytes: u32) {
    let slots = bytes.div_ceil(8) as usize;
    match slots {
        0 => {}
        1 => dst[0] = src[0],
        2 => dst[..2].copy_from_slice(&src[..2]),
        3 => dst[..3].copy_from_slice(&src[..3]),
        4 => dst[..4].copy_from_slice(&src[..4]),
        n => dst[..n].copy_from_slice(&src[..n]),
    }
}

/// Perform a native call: pack arguments from the frame's contiguous
/// argument run, invoke the trampoline, translate the return value into
/// `ret_out`.
///
/// `frame_args` is the slot run holding the packed arguments (the eval
/// stack region the call instruction consumed); `ret_out` must hold at
/// least `call.ret_slots` slots.
pub fn call_native(
    call: &ResolvedCall,
    frame_args: &[u64],
    ret_out: &mut [u64],
) -> Result<(), NativeError> {
    let trampoline = call
        .trampoline
        .as_ref()
        .ok_or_else(|| NativeError::MissingTrampoline { sig: call.sig.key.clone() })?;

    let mut buf = CallBuffer::default();

    // Large returns receive a hidden pointer to the caller's slot run.
    if matches!(call.sig.ret, AbiClass::ByRef(_)) {
        buf.args.push(ret_out.as_mut_ptr() as u64);
    }

    let mut cursor = 0usize;
    for class in &call.sig.params {
        let slots = class.value_slots() as usize;
        match class {
            AbiClass::ByRef(_) => {
                // Pointer pass-through: the aggregate stays in place.
                buf.args.push(frame_args[cursor..cursor + slots].as_ptr() as u64);
            }
            AbiClass::Hfa(_, _) | AbiClass::Agg(_) => {
                for s in &frame_args[cursor..cursor + slots] {
                    buf.args.push(*s);
                }
            }
            _ => buf.args.push(frame_args[cursor]),
        }
        cursor += slots;
    }

    trampoline(&mut buf)?;

    match call.sig.ret {
        AbiClass::Void | AbiClass::ByRef(_) => {}
        AbiClass::Hfa(_, _) | AbiClass::Agg(_) => {
            let slots = call.ret_slots as usize;
            copy_block(ret_out, &buf.ret, slots as u32 * 8);
        }
        _ => ret_out[0] = buf.ret[0],
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::{FloatWidth, MethodDesc, PrimKind, TypeDesc};

    fn native_method(
        store: &mut MetadataStore,
        name: &str,
        ret: Option<TypeToken>,
        params: Vec<TypeToken>,
    ) -> MethodToken {
        store.add_method(MethodDesc {
            name: name.into(),
            declaring: None,
            params,
            ret,
            is_static: true,
            is_virtual: false,
            is_delegate_invoke: false,
            kind: MethodKind::Native,
        })
    }

    #[test]
    fn test_resolve_binds_trampoline_by_signature() {
        let mut store = MetadataStore::new();
        let i4 = store.add_type(TypeDesc::primitive("System.Int32", PrimKind::I4));
        let m = native_method(&mut store, "Add", Some(i4), vec![i4, i4]);

        let table = TrampolineTable::new();
        table.register(
            "i4i4i4",
            Arc::new(|buf: &mut CallBuffer| {
                let x = buf.args[0] as i32;
                let y = buf.args[1] as i32;
                buf.ret[0] = x.wrapping_add(y) as u32 as u64;
                Ok(())
            }),
        );

        let call = resolve_call(&store, Some(&table), m, false).unwrap();
        assert_eq!(call.kind, CallKind::NativeStatic);
        assert_eq!(call.sig.key, "i4i4i4");
        assert_eq!(call.arg_slots, 2);
        assert_eq!(call.ret_slots, 1);

        let args = [40u64, 2u64];
        let mut ret = [0u64; 1];
        call_native(&call, &args, &mut ret).unwrap();
        assert_eq!(ret[0] as i32, 42);
    }

    #[test]
    fn test_resolve_missing_trampoline() {
        let mut store = MetadataStore::new();
        let r8 = store.add_type(TypeDesc::primitive("System.Double", PrimKind::R8));
        let m = native_method(&mut store, "Sqrt", Some(r8), vec![r8]);

        let table = TrampolineTable::new();
        let err = resolve_call(&store, Some(&table), m, false).unwrap_err();
        assert!(matches!(err, NativeError::MissingTrampoline { sig } if sig == "r8r8"));
    }

    #[test]
    fn test_interpreted_callee_needs_no_table() {
        let mut store = MetadataStore::new();
        let i4 = store.add_type(TypeDesc::primitive("System.Int32", PrimKind::I4));
        let m = store.add_method(MethodDesc {
            name: "Managed".into(),
            declaring: None,
            params: vec![i4],
            ret: None,
            is_static: true,
            is_virtual: false,
            is_delegate_invoke: false,
            kind: MethodKind::Interpreted(Default::default()),
        });
        let call = resolve_call(&store, None, m, false).unwrap();
        assert_eq!(call.kind, CallKind::Interp);
        assert!(call.trampoline.is_none());

        let call = resolve_call(&store, None, m, true).unwrap();
        assert_eq!(call.kind, CallKind::InterpVirt);
    }

    #[test]
    fn test_hfa_argument_packing() {
        let mut store = MetadataStore::new();
        let vec2 = store.add_type(TypeDesc::value("Vec2", 8, 4).with_hfa(FloatWidth::F32, 2));
        let r4 = store.add_type(TypeDesc::primitive("System.Single", PrimKind::R4));
        let m = native_method(&mut store, "Len", Some(r4), vec![vec2]);

        let table = TrampolineTable::new();
        table.register(
            "r4vf2",
            Arc::new(|buf: &mut CallBuffer| {
                let bits = buf.args[0];
                let x = f32::from_bits(bits as u32);
                let y = f32::from_bits((bits >> 32) as u32);
                buf.ret[0] = (x * x + y * y).sqrt().to_bits() as u64;
                Ok(())
            }),
        );

        let call = resolve_call(&store, Some(&table), m, false).unwrap();
        assert_eq!(call.sig.key, "r4vf2");

        let packed = (3.0f32.to_bits() as u64) | ((4.0f32.to_bits() as u64) << 32);
        let mut ret = [0u64; 1];
        call_native(&call, &[packed], &mut ret).unwrap();
        assert_eq!(f32::from_bits(ret[0] as u32), 5.0);
    }

    #[test]
    fn test_byref_argument_passes_pointer() {
        let mut store = MetadataStore::new();
        let big = store.add_type(TypeDesc::value("Big", 40, 8)); // 5 slots
        let i8t = store.add_type(TypeDesc::primitive("System.Int64", PrimKind::I8));
        let m = native_method(&mut store, "SumSlots", Some(i8t), vec![big]);

        let table = TrampolineTable::new();
        table.register(
            "i8p5",
            Arc::new(|buf: &mut CallBuffer| {
                let ptr = buf.args[0] as *const u64;
                let mut sum = 0u64;
                for i in 0..5 {
                    sum = sum.wrapping_add(unsafe { *ptr.add(i) });
                }
                buf.ret[0] = sum;
                Ok(())
            }),
        );

        let call = resolve_call(&store, Some(&table), m, false).unwrap();
        assert_eq!(call.arg_slots, 5);
        let args = [1u64, 2, 3, 4, 5];
        let mut ret = [0u64; 1];
        call_native(&call, &args, &mut ret).unwrap();
        assert_eq!(ret[0], 15);
    }

    #[test]
    fn test_byref_return_through_hidden_pointer() {
        let mut store = MetadataStore::new();
        let big = store.add_type(TypeDesc::value("Big", 40, 8));
        let m = native_method(&mut store, "MakeBig", Some(big), vec![]);

        let table = TrampolineTable::new();
        table.register(
            "p5",
            Arc::new(|buf: &mut CallBuffer| {
                let ptr = buf.args[0] as *mut u64;
                for i in 0..5u64 {
                    unsafe { *ptr.add(i as usize) = i + 10 };
                }
                Ok(())
            }),
        );

        let call = resolve_call(&store, Some(&table), m, false).unwrap();
        assert_eq!(call.ret_slots, 5);
        let mut ret = [0u64; 5];
        call_native(&call, &[], &mut ret).unwrap();
        assert_eq!(ret, [10, 11, 12, 13, 14]);
    }

    #[test]
    fn test_layout_args_offsets() {
        let mut store = MetadataStore::new();
        let i4 = store.add_type(TypeDesc::primitive("System.Int32", PrimKind::I4));
        let big = store.add_type(TypeDesc::value("Big", 20, 4));
        let r8 = store.add_type(TypeDesc::primitive("System.Double", PrimKind::R8));

        let (args, size) = layout_args(&store, &[i4, big, r8]).unwrap();
        assert_eq!(args[0].offset, 0);
        assert_eq!(args[0].slots, 1);
        assert_eq!(args[1].offset, 8);
        assert_eq!(args[1].slots, 3);
        assert_eq!(args[2].offset, 32);
        assert_eq!(size, 40);
    }

    #[test]
    fn test_table_shadowing_replaces() {
        let table = TrampolineTable::new();
        table.register("v", Arc::new(|_buf: &mut CallBuffer| Ok(())));
        table.register(
            "v",
            Arc::new(|_buf: &mut CallBuffer| Err(NativeError::Trap("second".into()))),
        );
        assert_eq!(table.len(), 1);
        let t = table.lookup("v").unwrap();
        let mut buf = CallBuffer::default();
        assert!(t(&mut buf).is_err());
    }
}
