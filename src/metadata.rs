//! Metadata descriptor surface
//!
//! The engine never parses metadata tables or images itself; it consumes
//! resolved descriptors produced by the loading layer. This module defines
//! the narrow capability surface the core is allowed to see: byte size,
//! alignment, value-type/enum flags, element type, float homogeneity, and
//! a method's raw body. `MetadataStore` is the append-only registry the
//! embedding layer fills in before handing it to the emitter and engine.

use std::collections::HashMap;
use std::sync::Arc;

/// Token identifying a type descriptor in a [`MetadataStore`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TypeToken(pub u32);

/// Token identifying a method descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MethodToken(pub u32);

/// Token identifying a field descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FieldToken(pub u32);

/// Token identifying an interned string literal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StringToken(pub u32);

impl std::fmt::Display for TypeToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "t#{}", self.0)
    }
}

impl std::fmt::Display for MethodToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "m#{}", self.0)
    }
}

impl std::fmt::Display for FieldToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "f#{}", self.0)
    }
}

/// Width of a floating-point field, used for HFA recognition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FloatWidth {
    F32,
    F64,
}

impl FloatWidth {
    /// Byte size of one field of this width.
    #[inline]
    pub fn size(self) -> u32 {
        match self {
            Self::F32 => 4,
            Self::F64 => 8,
        }
    }
}

/// Primitive kind for types the evaluation stack understands directly.
///
/// Everything else (structs) is tracked as an opaque aggregate by size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PrimKind {
    I1,
    U1,
    I2,
    U2,
    I4,
    U4,
    I8,
    U8,
    R4,
    R8,
    Bool,
    Char,
    /// Native-width integer (pointer sized).
    IntPtr,
}

impl PrimKind {
    /// Byte size of the primitive.
    pub fn size(self) -> u32 {
        match self {
            Self::I1 | Self::U1 | Self::Bool => 1,
            Self::I2 | Self::U2 | Self::Char => 2,
            Self::I4 | Self::U4 | Self::R4 => 4,
            Self::I8 | Self::U8 | Self::R8 | Self::IntPtr => 8,
        }
    }

    /// Whether the primitive is signed for widening purposes.
    pub fn is_signed(self) -> bool {
        matches!(self, Self::I1 | Self::I2 | Self::I4 | Self::I8 | Self::IntPtr)
    }
}

/// Resolved type descriptor.
///
/// Produced by the class-layout collaborator; the core reads it, never
/// builds it from raw metadata.
#[derive(Debug, Clone)]
pub struct TypeDesc {
    /// Diagnostic name (also used for intrinsic pattern matching).
    pub name: Arc<str>,
    /// Instance byte size (for reference types, the pointer-target size is
    /// irrelevant to the core; `size` is the pointer width).
    pub size: u32,
    /// Required alignment.
    pub align: u32,
    pub is_value_type: bool,
    pub is_enum: bool,
    /// Underlying primitive for enums.
    pub underlying: Option<PrimKind>,
    /// Primitive kind if this is a primitive value type.
    pub prim: Option<PrimKind>,
    /// Array element type, when this is an array type.
    pub element: Option<TypeToken>,
    /// Base type for subtype checks (catch-clause matching).
    pub base: Option<TypeToken>,
    /// Float homogeneity, precomputed by the layout collaborator:
    /// `Some((width, n))` when the type is composed of exactly `n` fields
    /// of identical float width.
    pub hfa: Option<(FloatWidth, u8)>,
    /// Whether this descriptor came from a generic instantiation.
    pub inflated: bool,
}

impl TypeDesc {
    /// A reference (non-value) type descriptor.
    pub fn reference(name: impl Into<Arc<str>>, base: Option<TypeToken>) -> Self {
        Self {
            name: name.into(),
            size: 8,
            align: 8,
            is_value_type: false,
            is_enum: false,
            underlying: None,
            prim: None,
            element: None,
            base,
            hfa: None,
            inflated: false,
        }
    }

    /// A primitive value type descriptor.
    pub fn primitive(name: impl Into<Arc<str>>, prim: PrimKind) -> Self {
        let hfa = match prim {
            PrimKind::R4 => Some((FloatWidth::F32, 1)),
            PrimKind::R8 => Some((FloatWidth::F64, 1)),
            _ => None,
        };
        Self {
            name: name.into(),
            size: prim.size(),
            align: prim.size(),
            is_value_type: true,
            is_enum: false,
            underlying: None,
            prim: Some(prim),
            element: None,
            base: None,
            hfa,
            inflated: false,
        }
    }

    /// An opaque struct (non-primitive value type) descriptor.
    pub fn value(name: impl Into<Arc<str>>, size: u32, align: u32) -> Self {
        Self {
            name: name.into(),
            size,
            align,
            is_value_type: true,
            is_enum: false,
            underlying: None,
            prim: None,
            element: None,
            base: None,
            hfa: None,
            inflated: false,
        }
    }

    /// Mark this value type as a homogeneous float aggregate.
    pub fn with_hfa(mut self, width: FloatWidth, count: u8) -> Self {
        self.hfa = Some((width, count));
        self
    }

    /// An enum descriptor reducing to `underlying`.
    pub fn enumeration(name: impl Into<Arc<str>>, underlying: PrimKind) -> Self {
        Self {
            name: name.into(),
            size: underlying.size(),
            align: underlying.size(),
            is_value_type: true,
            is_enum: true,
            underlying: Some(underlying),
            prim: None,
            element: None,
            base: None,
            hfa: None,
            inflated: false,
        }
    }

    /// An array-of-`element` reference type.
    pub fn array(name: impl Into<Arc<str>>, element: TypeToken, base: Option<TypeToken>) -> Self {
        let mut d = Self::reference(name, base);
        d.element = Some(element);
        d
    }
}

/// Resolved field descriptor.
#[derive(Debug, Clone)]
pub struct FieldDesc {
    pub name: Arc<str>,
    pub owner: TypeToken,
    pub ty: TypeToken,
    /// Byte offset within the owning instance (for instance fields this
    /// includes whatever header the layout collaborator decided on).
    pub offset: u32,
    pub is_static: bool,
    pub is_thread_static: bool,
}

/// Kind of an exception clause as declared on a method body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClauseKind {
    Catch,
    Filter,
    Finally,
    Fault,
}

/// Exception clause in IL-offset space, as declared by metadata.
#[derive(Debug, Clone)]
pub struct IlExceptionClause {
    pub kind: ClauseKind,
    pub try_start: u32,
    pub try_len: u32,
    pub handler_start: u32,
    pub handler_len: u32,
    /// Filter code start, for [`ClauseKind::Filter`].
    pub filter_start: Option<u32>,
    /// Declared catch type, for [`ClauseKind::Catch`].
    pub catch_type: Option<TypeToken>,
}

impl IlExceptionClause {
    #[inline]
    pub fn try_end(&self) -> u32 {
        self.try_start + self.try_len
    }

    #[inline]
    pub fn handler_end(&self) -> u32 {
        self.handler_start + self.handler_len
    }
}

/// Raw method body handed over by the image loader.
#[derive(Debug, Clone, Default)]
pub struct MethodBody {
    /// Raw instruction bytes.
    pub code: Vec<u8>,
    /// Declared maximum evaluation-stack depth.
    pub max_stack: u16,
    /// Local variable types, in slot order.
    pub locals: Vec<TypeToken>,
    /// Exception clauses, innermost-first as metadata orders them.
    pub clauses: Vec<IlExceptionClause>,
    /// Whether locals must be zero-initialized on entry.
    pub init_locals: bool,
}

/// How a method executes.
#[derive(Debug, Clone)]
pub enum MethodKind {
    /// Body is IL and runs through the transform + interpreter.
    Interpreted(MethodBody),
    /// Body is precompiled native code reached through a trampoline.
    Native,
}

/// Resolved method descriptor.
#[derive(Debug, Clone)]
pub struct MethodDesc {
    pub name: Arc<str>,
    pub declaring: Option<TypeToken>,
    /// Parameter types; for instance methods the `this` parameter is
    /// explicit at index 0.
    pub params: Vec<TypeToken>,
    /// Return type, `None` for void.
    pub ret: Option<TypeToken>,
    pub is_static: bool,
    pub is_virtual: bool,
    /// `Invoke` on a delegate type.
    pub is_delegate_invoke: bool,
    pub kind: MethodKind,
}

/// Well-known type tokens the engine needs for runtime faults and catch
/// matching. Seeded by [`MetadataStore::with_runtime_types`].
#[derive(Debug, Clone, Copy)]
pub struct WellKnown {
    pub object: TypeToken,
    pub string: TypeToken,
    pub exception: TypeToken,
    pub null_reference: TypeToken,
    pub index_out_of_range: TypeToken,
    pub divide_by_zero: TypeToken,
    pub overflow: TypeToken,
    pub invalid_cast: TypeToken,
    pub missing_method: TypeToken,
}

/// Append-only registry of resolved descriptors.
///
/// Tokens are indices into the owning table; once handed out they are
/// stable for the lifetime of the store. Static field storage allocated
/// here stays pinned for the same lifetime, so raw addresses taken from it
/// remain valid while the store is alive.
pub struct MetadataStore {
    types: Vec<TypeDesc>,
    methods: Vec<MethodDesc>,
    fields: Vec<FieldDesc>,
    strings: Vec<Arc<str>>,
    string_index: HashMap<Arc<str>, StringToken>,
    /// Static field backing storage, keyed by field token.
    statics: HashMap<FieldToken, Box<[u8]>>,
    well_known: Option<WellKnown>,
}

impl std::fmt::Debug for MetadataStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetadataStore")
            .field("types", &self.types.len())
            .field("methods", &self.methods.len())
            .field("fields", &self.fields.len())
            .field("strings", &self.strings.len())
            .finish()
    }
}

impl Default for MetadataStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MetadataStore {
    pub fn new() -> Self {
        Self {
            types: Vec::new(),
            methods: Vec::new(),
            fields: Vec::new(),
            strings: Vec::new(),
            string_index: HashMap::new(),
            statics: HashMap::new(),
            well_known: None,
        }
    }

    /// Create a store pre-seeded with the runtime exception hierarchy.
    pub fn with_runtime_types() -> Self {
        let mut store = Self::new();
        let object = store.add_type(TypeDesc::reference("System.Object", None));
        let string = store.add_type(TypeDesc::reference("System.String", Some(object)));
        let exception = store.add_type(TypeDesc::reference("System.Exception", Some(object)));
        let sys = |name: &str| TypeDesc::reference(name, Some(exception));
        let null_reference = store.add_type(sys("System.NullReferenceException"));
        let index_out_of_range = store.add_type(sys("System.IndexOutOfRangeException"));
        let divide_by_zero = store.add_type(sys("System.DivideByZeroException"));
        let overflow = store.add_type(sys("System.OverflowException"));
        let invalid_cast = store.add_type(sys("System.InvalidCastException"));
        let missing_method = store.add_type(sys("System.MissingMethodException"));
        store.well_known = Some(WellKnown {
            object,
            string,
            exception,
            null_reference,
            index_out_of_range,
            divide_by_zero,
            overflow,
            invalid_cast,
            missing_method,
        });
        store
    }

    /// The runtime type hierarchy, if seeded.
    pub fn well_known(&self) -> Option<&WellKnown> {
        self.well_known.as_ref()
    }

    pub fn add_type(&mut self, desc: TypeDesc) -> TypeToken {
        let token = TypeToken(self.types.len() as u32);
        self.types.push(desc);
        token
    }

    pub fn add_method(&mut self, desc: MethodDesc) -> MethodToken {
        let token = MethodToken(self.methods.len() as u32);
        self.methods.push(desc);
        token
    }

    pub fn add_field(&mut self, desc: FieldDesc) -> FieldToken {
        let token = FieldToken(self.fields.len() as u32);
        let desc_static = desc.is_static && !desc.is_thread_static;
        let size = self.type_desc(desc.ty).map(|t| t.size).unwrap_or(8);
        self.fields.push(desc);
        if desc_static {
            // Regular statics get process-lifetime storage here;
            // thread statics are allocated lazily per machine.
            self.statics
                .insert(token, vec![0u8; size.max(1) as usize].into_boxed_slice());
        }
        token
    }

    /// Intern a string literal, returning a stable token.
    pub fn intern_string(&mut self, s: &str) -> StringToken {
        if let Some(tok) = self.string_index.get(s) {
            return *tok;
        }
        let arc: Arc<str> = Arc::from(s);
        let token = StringToken(self.strings.len() as u32);
        self.strings.push(arc.clone());
        self.string_index.insert(arc, token);
        token
    }

    #[inline]
    pub fn type_desc(&self, token: TypeToken) -> Option<&TypeDesc> {
        self.types.get(token.0 as usize)
    }

    #[inline]
    pub fn method_desc(&self, token: MethodToken) -> Option<&MethodDesc> {
        self.methods.get(token.0 as usize)
    }

    #[inline]
    pub fn field_desc(&self, token: FieldToken) -> Option<&FieldDesc> {
        self.fields.get(token.0 as usize)
    }

    #[inline]
    pub fn string(&self, token: StringToken) -> Option<&Arc<str>> {
        self.strings.get(token.0 as usize)
    }

    /// Raw address of a regular static field's backing storage.
    pub fn static_addr(&self, token: FieldToken) -> Option<u64> {
        self.statics.get(&token).map(|b| b.as_ptr() as u64)
    }

    /// Walk the base chain to decide whether `sub` may be handled by a
    /// clause declared to catch `sup`.
    pub fn is_assignable(&self, sub: TypeToken, sup: TypeToken) -> bool {
        let mut cur = Some(sub);
        while let Some(tok) = cur {
            if tok == sup {
                return true;
            }
            cur = self.type_desc(tok).and_then(|d| d.base);
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tokens_are_sequential() {
        let mut store = MetadataStore::new();
        let a = store.add_type(TypeDesc::primitive("System.Int32", PrimKind::I4));
        let b = store.add_type(TypeDesc::primitive("System.Int64", PrimKind::I8));
        assert_eq!(a, TypeToken(0));
        assert_eq!(b, TypeToken(1));
        assert_eq!(store.type_desc(a).unwrap().size, 4);
        assert_eq!(store.type_desc(b).unwrap().size, 8);
    }

    #[test]
    fn test_string_interning() {
        let mut store = MetadataStore::new();
        let a = store.intern_string("hello");
        let b = store.intern_string("world");
        let c = store.intern_string("hello");
        assert_eq!(a, c);
        assert_ne!(a, b);
        assert_eq!(store.string(a).unwrap().as_ref(), "hello");
    }

    #[test]
    fn test_static_storage_allocated() {
        let mut store = MetadataStore::new();
        let int32 = store.add_type(TypeDesc::primitive("System.Int32", PrimKind::I4));
        let owner = store.add_type(TypeDesc::reference("C", None));
        let f = store.add_field(FieldDesc {
            name: "counter".into(),
            owner,
            ty: int32,
            offset: 0,
            is_static: true,
            is_thread_static: false,
        });
        let addr = store.static_addr(f).expect("static storage");
        assert_ne!(addr, 0);
        // Address stays stable across further insertions.
        store.add_type(TypeDesc::primitive("System.Double", PrimKind::R8));
        assert_eq!(store.static_addr(f).unwrap(), addr);
    }

    #[test]
    fn test_assignability_walks_base_chain() {
        let store = MetadataStore::with_runtime_types();
        let wk = *store.well_known().unwrap();
        assert!(store.is_assignable(wk.null_reference, wk.exception));
        assert!(store.is_assignable(wk.null_reference, wk.object));
        assert!(store.is_assignable(wk.object, wk.object));
        assert!(!store.is_assignable(wk.object, wk.exception));
        assert!(!store.is_assignable(wk.string, wk.exception));
    }

    #[test]
    fn test_enum_reduces_to_underlying() {
        let desc = TypeDesc::enumeration("Color", PrimKind::U2);
        assert!(desc.is_enum);
        assert_eq!(desc.size, 2);
        assert_eq!(desc.underlying, Some(PrimKind::U2));
    }
}
