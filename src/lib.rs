//! ilrun - Managed Bytecode Interpreter
//!
//! An execution engine for a CIL-like stack bytecode. The pipeline has
//! two stages:
//!
//! 1. **IL-to-IR transform** (`emit` module)
//!    - Splits method bodies into basic blocks
//!    - Simulates the evaluation stack, assigning every pushed value a
//!      concrete frame slot at translation time
//!    - Linearizes blocks through a worklist, validating that every
//!      control-flow join sees one stack shape
//!    - Recognizes intrinsics (interlocked, nullable, vector
//!      construction) and substitutes dedicated instructions
//!
//! 2. **Interpretation** (`engine` module)
//!    - A per-thread [`engine::Machine`] with a fixed value stack of
//!      8-byte slots and overlapping call frames
//!    - Structured exception handling: catch, filter, finally, and
//!      fault clauses with nested handler activations
//!    - Calls out to precompiled native code through signature-keyed
//!      trampolines with platform-ABI argument classification
//!
//! Translated bodies are shared across threads through
//! [`cache::MethodIrCache`]; metadata lives in a
//! [`metadata::MetadataStore`] that the embedder populates up front.
//!
//! # Example
//!
//! ```rust
//! use ilrun::cache::MethodIrCache;
//! use ilrun::emit::intrinsics::IntrinsicTable;
//! use ilrun::engine::{ExecContext, Machine};
//! use ilrun::metadata::{
//!     MetadataStore, MethodBody, MethodDesc, MethodKind, PrimKind, TypeDesc,
//! };
//!
//! let mut store = MetadataStore::with_runtime_types();
//! let i4 = store.add_type(TypeDesc::primitive("System.Int32", PrimKind::I4));
//!
//! // static int Add(int a, int b) => a + b;
//! let add = store.add_method(MethodDesc {
//!     name: "Add".into(),
//!     declaring: None,
//!     params: vec![i4, i4],
//!     ret: Some(i4),
//!     is_static: true,
//!     is_virtual: false,
//!     is_delegate_invoke: false,
//!     kind: MethodKind::Interpreted(MethodBody {
//!         code: vec![0x02, 0x03, 0x58, 0x2A], // ldarg.0; ldarg.1; add; ret
//!         max_stack: 2,
//!         locals: vec![],
//!         clauses: vec![],
//!         init_locals: false,
//!     }),
//! });
//!
//! let cache = MethodIrCache::new();
//! let intrinsics = IntrinsicTable::with_defaults();
//! let ctx = ExecContext { store: &store, cache: &cache, intrinsics: &intrinsics, trampolines: None };
//!
//! let mut machine = Machine::default();
//! let ret = machine.execute(&ctx, add, &[40, 2]).unwrap();
//! assert_eq!(ret[0] as u32 as i32, 42);
//! ```

pub mod abi;
pub mod bridge;
pub mod cache;
pub mod emit;
pub mod engine;
pub mod il;
pub mod ir;
pub mod metadata;
pub mod signature;

pub use bridge::{CallBuffer, NativeError, Trampoline, TrampolineTable};
pub use cache::MethodIrCache;
pub use emit::{emit_method, EmitConfig, EmitError};
pub use engine::{ExecContext, ExecError, Machine, MachineConfig};
pub use ir::MethodIr;
pub use metadata::{FieldToken, MetadataStore, MethodToken, TypeToken};
