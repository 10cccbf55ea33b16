//! Shared fixture for end-to-end interpreter tests
//!
//! `Host` bundles a metadata store seeded with the runtime types and the
//! common primitives, a translation cache, and a trampoline table, and
//! hands out execution contexts over them. `Asm` is a minimal byte
//! builder for method bodies; offsets in the tests are still tracked by
//! hand, the builder only splices multi-byte tokens.

#![allow(dead_code)]

use ilrun::bridge::TrampolineTable;
use ilrun::cache::MethodIrCache;
use ilrun::emit::intrinsics::IntrinsicTable;
use ilrun::engine::{ExecContext, ExecError, Machine};
use ilrun::metadata::{
    FieldDesc, FieldToken, IlExceptionClause, MetadataStore, MethodBody, MethodDesc, MethodKind,
    MethodToken, PrimKind, TypeDesc, TypeToken,
};

pub struct Host {
    pub store: MetadataStore,
    pub cache: MethodIrCache,
    pub intrinsics: IntrinsicTable,
    pub trampolines: TrampolineTable,
    pub i4: TypeToken,
    pub i8: TypeToken,
    pub r4: TypeToken,
    pub r8: TypeToken,
}

impl Host {
    pub fn new() -> Self {
        let mut store = MetadataStore::with_runtime_types();
        let i4 = store.add_type(TypeDesc::primitive("System.Int32", PrimKind::I4));
        let i8 = store.add_type(TypeDesc::primitive("System.Int64", PrimKind::I8));
        let r4 = store.add_type(TypeDesc::primitive("System.Single", PrimKind::R4));
        let r8 = store.add_type(TypeDesc::primitive("System.Double", PrimKind::R8));
        Self {
            store,
            cache: MethodIrCache::new(),
            intrinsics: IntrinsicTable::with_defaults(),
            trampolines: TrampolineTable::new(),
            i4,
            i8,
            r4,
            r8,
        }
    }

    pub fn ctx(&self) -> ExecContext<'_> {
        ExecContext {
            store: &self.store,
            cache: &self.cache,
            intrinsics: &self.intrinsics,
            trampolines: Some(&self.trampolines),
        }
    }

    pub fn interp(
        &mut self,
        name: &str,
        params: Vec<TypeToken>,
        ret: Option<TypeToken>,
        locals: Vec<TypeToken>,
        clauses: Vec<IlExceptionClause>,
        code: Vec<u8>,
    ) -> MethodToken {
        self.store.add_method(MethodDesc {
            name: name.into(),
            declaring: None,
            params,
            ret,
            is_static: true,
            is_virtual: false,
            is_delegate_invoke: false,
            kind: MethodKind::Interpreted(MethodBody {
                code,
                max_stack: 16,
                locals,
                clauses,
                init_locals: true,
            }),
        })
    }

    pub fn native(
        &mut self,
        name: &str,
        params: Vec<TypeToken>,
        ret: Option<TypeToken>,
    ) -> MethodToken {
        self.store.add_method(MethodDesc {
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

    /// Register a static field backed by process-wide storage.
    pub fn static_field(&mut self, name: &str, ty: TypeToken) -> FieldToken {
        let owner = self.store.well_known().unwrap().object;
        self.store.add_field(FieldDesc {
            name: name.into(),
            owner,
            ty,
            offset: 0,
            is_static: true,
            is_thread_static: false,
        })
    }

    /// Run a method on a fresh machine and return the packed result slots.
    pub fn run(&self, method: MethodToken, args: &[u64]) -> Result<Vec<u64>, ExecError> {
        let mut machine = Machine::default();
        machine.execute(&self.ctx(), method, args).map(|s| s.to_vec())
    }

    /// Run a method expected to return an `int32`.
    pub fn run_i4(&self, method: MethodToken, args: &[u64]) -> Result<i32, ExecError> {
        self.run(method, args).map(|s| s[0] as u32 as i32)
    }
}

/// Byte builder for IL method bodies.
pub struct Asm {
    bytes: Vec<u8>,
}

impl Asm {
    pub fn new() -> Self {
        Self { bytes: Vec::new() }
    }

    pub fn op(mut self, b: u8) -> Self {
        self.bytes.push(b);
        self
    }

    pub fn ops(mut self, bs: &[u8]) -> Self {
        self.bytes.extend_from_slice(bs);
        self
    }

    pub fn token(mut self, t: u32) -> Self {
        self.bytes.extend_from_slice(&t.to_le_bytes());
        self
    }

    pub fn call(self, m: MethodToken) -> Self {
        self.op(0x28).token(m.0)
    }

    pub fn callvirt(self, m: MethodToken) -> Self {
        self.op(0x6F).token(m.0)
    }

    pub fn newobj(self, ctor: MethodToken) -> Self {
        self.op(0x73).token(ctor.0)
    }

    pub fn ldsfld(self, f: FieldToken) -> Self {
        self.op(0x7E).token(f.0)
    }

    pub fn stsfld(self, f: FieldToken) -> Self {
        self.op(0x80).token(f.0)
    }

    pub fn ldfld(self, f: FieldToken) -> Self {
        self.op(0x7B).token(f.0)
    }

    pub fn stfld(self, f: FieldToken) -> Self {
        self.op(0x7D).token(f.0)
    }

    pub fn ldc_r8(self, v: f64) -> Self {
        let mut s = self.op(0x23);
        s.bytes.extend_from_slice(&v.to_bits().to_le_bytes());
        s
    }

    pub fn done(self) -> Vec<u8> {
        self.bytes
    }
}

/// `field = field * 10 + k` as a 15-byte IL sequence, for ordering
/// assertions on side effects. `k` must be 8 or less.
pub fn bump_static(f: FieldToken, k: u8) -> Vec<u8> {
    assert!(k <= 8);
    Asm::new()
        .ldsfld(f)
        .ops(&[0x1F, 10, 0x5A]) // ldc.i4.s 10; mul
        .op(0x16 + k) // ldc.i4.<k>
        .op(0x58) // add
        .stsfld(f)
        .done()
}

pub fn catch_clause(
    catch_type: Option<TypeToken>,
    try_start: u32,
    try_len: u32,
    handler_start: u32,
    handler_len: u32,
) -> IlExceptionClause {
    IlExceptionClause {
        kind: ilrun::metadata::ClauseKind::Catch,
        try_start,
        try_len,
        handler_start,
        handler_len,
        filter_start: None,
        catch_type,
    }
}

pub fn finally_clause(
    try_start: u32,
    try_len: u32,
    handler_start: u32,
    handler_len: u32,
) -> IlExceptionClause {
    IlExceptionClause {
        kind: ilrun::metadata::ClauseKind::Finally,
        try_start,
        try_len,
        handler_start,
        handler_len,
        filter_start: None,
        catch_type: None,
    }
}
