//! Recognition of well-known callees as single instructions
//!
//! A small catalog of name/shape patterns is consulted before the generic
//! call path: nullable-wrapper accessors, interlocked exchange and
//! compare-exchange, fixed-size float-vector constructors, and array
//! element accessors. A match replaces the whole call with one internal
//! instruction.
//!
//! The built-in catalog is a default set, not a closed contract: an
//! embedder may register further patterns for equivalent overloads its
//! assemblies carry under other names.

use tracing::warn;

use crate::metadata::{MetadataStore, MethodDesc};

/// A recognized intrinsic operation, with the widths the emitter needs
/// already resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Intrinsic {
    /// Nullable wrapper `hasValue` read.
    NullableHasValue,
    /// Nullable wrapper value read; payload is (value offset, value size).
    NullableValue { offset: u32, size: u32 },
    /// Atomic exchange of a 4- or 8-byte location.
    InterlockedExchange { width: u32 },
    /// Atomic compare-exchange of a 4- or 8-byte location.
    InterlockedCompareExchange { width: u32 },
    /// Construct an N-element float vector from N scalar arguments.
    VectorCtor { count: u32, width: u32 },
    /// Array element read dispatched by element size.
    ArrayGet,
    /// Array element write dispatched by element size.
    ArraySet,
}

/// What a catalog entry matches on. Type names match by prefix so a
/// generic instantiation suffix does not defeat the pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PatternOp {
    NullableHasValue,
    NullableValue,
    InterlockedExchange,
    InterlockedCompareExchange,
    VectorCtor,
    ArrayGet,
    ArraySet,
}

#[derive(Debug, Clone)]
pub struct IntrinsicPattern {
    type_prefix: String,
    method_name: String,
    op: PatternOp,
}

/// The catalog consulted at every call site during emission.
#[derive(Debug, Clone)]
pub struct IntrinsicTable {
    patterns: Vec<IntrinsicPattern>,
}

impl Default for IntrinsicTable {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl IntrinsicTable {
    /// An empty catalog; every call goes through the generic path.
    pub fn empty() -> Self {
        Self { patterns: Vec::new() }
    }

    /// The built-in default catalog.
    pub fn with_defaults() -> Self {
        let mut table = Self::empty();
        table.add("System.Nullable`1", "get_HasValue", PatternOp::NullableHasValue);
        table.add("System.Nullable`1", "get_Value", PatternOp::NullableValue);
        table.add(
            "System.Threading.Interlocked",
            "Exchange",
            PatternOp::InterlockedExchange,
        );
        table.add(
            "System.Threading.Interlocked",
            "CompareExchange",
            PatternOp::InterlockedCompareExchange,
        );
        table.add("System.Numerics.Vector2", ".ctor", PatternOp::VectorCtor);
        table.add("System.Numerics.Vector3", ".ctor", PatternOp::VectorCtor);
        table.add("System.Numerics.Vector4", ".ctor", PatternOp::VectorCtor);
        table.add("System.Array", "GetValue", PatternOp::ArrayGet);
        table.add("System.Array", "SetValue", PatternOp::ArraySet);
        table
    }

    fn add(&mut self, type_prefix: &str, method_name: &str, op: PatternOp) {
        self.patterns.push(IntrinsicPattern {
            type_prefix: type_prefix.to_string(),
            method_name: method_name.to_string(),
            op,
        });
    }

    /// Register an embedder pattern equivalent to one of the built-in
    /// operations. Later registrations take precedence over earlier ones
    /// matching the same callee.
    pub fn register_nullable_has_value(&mut self, type_prefix: &str, method_name: &str) {
        self.register(type_prefix, method_name, PatternOp::NullableHasValue);
    }

    pub fn register_nullable_value(&mut self, type_prefix: &str, method_name: &str) {
        self.register(type_prefix, method_name, PatternOp::NullableValue);
    }

    pub fn register_interlocked_exchange(&mut self, type_prefix: &str, method_name: &str) {
        self.register(type_prefix, method_name, PatternOp::InterlockedExchange);
    }

    pub fn register_interlocked_compare_exchange(&mut self, type_prefix: &str, method_name: &str) {
        self.register(type_prefix, method_name, PatternOp::InterlockedCompareExchange);
    }

    pub fn register_vector_ctor(&mut self, type_prefix: &str, method_name: &str) {
        self.register(type_prefix, method_name, PatternOp::VectorCtor);
    }

    fn register(&mut self, type_prefix: &str, method_name: &str, op: PatternOp) {
        let shadowed = self
            .patterns
            .iter()
            .any(|p| p.type_prefix == type_prefix && p.method_name == method_name);
        if shadowed {
            warn!(
                type_prefix,
                method_name, "intrinsic registration shadows an existing pattern"
            );
        }
        self.patterns.push(IntrinsicPattern {
            type_prefix: type_prefix.to_string(),
            method_name: method_name.to_string(),
            op,
        });
    }

    /// Match a callee against the catalog, resolving widths from the
    /// method's descriptor. Later registrations win.
    pub fn lookup(&self, store: &MetadataStore, desc: &MethodDesc) -> Option<Intrinsic> {
        let declaring = desc
            .declaring
            .and_then(|t| store.type_desc(t))
            .map(|d| d.name.as_ref())?;

        let hit = self
            .patterns
            .iter()
            .rev()
            .find(|p| declaring.starts_with(p.type_prefix.as_str()) && desc.name.as_ref() == p.method_name)?;

        match hit.op {
            PatternOp::NullableHasValue => Some(Intrinsic::NullableHasValue),
            PatternOp::NullableValue => {
                // Nullable layout: hasValue byte, then the value at its
                // natural alignment.
                let value_ty = desc.ret?;
                let value = store.type_desc(value_ty)?;
                let offset = value.align.max(1);
                Some(Intrinsic::NullableValue { offset, size: value.size })
            }
            PatternOp::InterlockedExchange | PatternOp::InterlockedCompareExchange => {
                // Width comes from the exchanged value parameter (the
                // location parameter is an address).
                let value_ty = *desc.params.get(1)?;
                let width = store.type_desc(value_ty)?.size;
                if width != 4 && width != 8 {
                    return None;
                }
                match hit.op {
                    PatternOp::InterlockedExchange => {
                        Some(Intrinsic::InterlockedExchange { width })
                    }
                    _ => Some(Intrinsic::InterlockedCompareExchange { width }),
                }
            }
            PatternOp::VectorCtor => {
                let declaring_ty = desc.declaring?;
                let (fw, count) = store.type_desc(declaring_ty)?.hfa?;
                Some(Intrinsic::VectorCtor {
                    count: count as u32,
                    width: fw.size(),
                })
            }
            PatternOp::ArrayGet => Some(Intrinsic::ArrayGet),
            PatternOp::ArraySet => Some(Intrinsic::ArraySet),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::{FloatWidth, MethodKind, PrimKind, TypeDesc};

    fn method(
        store: &mut MetadataStore,
        declaring: crate::metadata::TypeToken,
        name: &str,
        params: Vec<crate::metadata::TypeToken>,
        ret: Option<crate::metadata::TypeToken>,
    ) -> MethodDesc {
        let _ = store;
        MethodDesc {
            name: name.into(),
            declaring: Some(declaring),
            params,
            ret,
            is_static: true,
            is_virtual: false,
            is_delegate_invoke: false,
            kind: MethodKind::Native,
        }
    }

    #[test]
    fn test_nullable_patterns() {
        let mut store = MetadataStore::new();
        let i4 = store.add_type(TypeDesc::primitive("System.Int32", PrimKind::I4));
        let nullable = store.add_type(TypeDesc::value("System.Nullable`1[System.Int32]", 8, 4));

        let table = IntrinsicTable::with_defaults();
        let has = method(&mut store, nullable, "get_HasValue", vec![], Some(i4));
        assert_eq!(table.lookup(&store, &has), Some(Intrinsic::NullableHasValue));

        let get = method(&mut store, nullable, "get_Value", vec![], Some(i4));
        assert_eq!(
            table.lookup(&store, &get),
            Some(Intrinsic::NullableValue { offset: 4, size: 4 })
        );
    }

    #[test]
    fn test_interlocked_width_from_value_param() {
        let mut store = MetadataStore::new();
        let intptr = store.add_type(TypeDesc::primitive("System.IntPtr", PrimKind::IntPtr));
        let i4 = store.add_type(TypeDesc::primitive("System.Int32", PrimKind::I4));
        let i8t = store.add_type(TypeDesc::primitive("System.Int64", PrimKind::I8));
        let interlocked = store.add_type(TypeDesc::reference("System.Threading.Interlocked", None));

        let table = IntrinsicTable::with_defaults();
        let x4 = method(&mut store, interlocked, "Exchange", vec![intptr, i4], Some(i4));
        assert_eq!(
            table.lookup(&store, &x4),
            Some(Intrinsic::InterlockedExchange { width: 4 })
        );

        let cx8 = method(
            &mut store,
            interlocked,
            "CompareExchange",
            vec![intptr, i8t, i8t],
            Some(i8t),
        );
        assert_eq!(
            table.lookup(&store, &cx8),
            Some(Intrinsic::InterlockedCompareExchange { width: 8 })
        );
    }

    #[test]
    fn test_vector_ctor_uses_hfa_shape() {
        let mut store = MetadataStore::new();
        let r4 = store.add_type(TypeDesc::primitive("System.Single", PrimKind::R4));
        let vec3 = store.add_type(
            TypeDesc::value("System.Numerics.Vector3", 12, 4).with_hfa(FloatWidth::F32, 3),
        );

        let table = IntrinsicTable::with_defaults();
        let ctor = method(&mut store, vec3, ".ctor", vec![r4, r4, r4], None);
        assert_eq!(
            table.lookup(&store, &ctor),
            Some(Intrinsic::VectorCtor { count: 3, width: 4 })
        );
    }

    #[test]
    fn test_unmatched_callee_passes_through() {
        let mut store = MetadataStore::new();
        let i4 = store.add_type(TypeDesc::primitive("System.Int32", PrimKind::I4));
        let math = store.add_type(TypeDesc::reference("System.Math", None));

        let table = IntrinsicTable::with_defaults();
        let abs = method(&mut store, math, "Abs", vec![i4], Some(i4));
        assert_eq!(table.lookup(&store, &abs), None);
    }

    #[test]
    fn test_embedder_registration_wins() {
        let mut store = MetadataStore::new();
        let i4 = store.add_type(TypeDesc::primitive("System.Int32", PrimKind::I4));
        let intptr = store.add_type(TypeDesc::primitive("System.IntPtr", PrimKind::IntPtr));
        let atomics = store.add_type(TypeDesc::reference("MyRuntime.Atomics", None));

        let mut table = IntrinsicTable::with_defaults();
        table.register_interlocked_exchange("MyRuntime.Atomics", "Swap");

        let swap = method(&mut store, atomics, "Swap", vec![intptr, i4], Some(i4));
        assert_eq!(
            table.lookup(&store, &swap),
            Some(Intrinsic::InterlockedExchange { width: 4 })
        );
    }

    #[test]
    fn test_empty_table_matches_nothing() {
        let mut store = MetadataStore::new();
        let i4 = store.add_type(TypeDesc::primitive("System.Int32", PrimKind::I4));
        let nullable = store.add_type(TypeDesc::value("System.Nullable`1[System.Int32]", 8, 4));
        let table = IntrinsicTable::empty();
        let has = method(&mut store, nullable, "get_HasValue", vec![], Some(i4));
        assert_eq!(table.lookup(&store, &has), None);
    }
}
