//! Shared cache of translated methods
//!
//! Translation is deterministic, so the cache only has to guarantee that
//! one published `MethodIr` per method is ever observed. Lookups go
//! through the sharded map lock-free; translation itself is serialized by
//! a single compile lock with a second lookup inside it, so concurrent
//! requests for the same cold method produce one translation and every
//! caller gets the same `Arc`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use gxhash::GxBuildHasher;
use parking_lot::Mutex;
use tracing::debug;

use crate::emit::{emit_method, EmitConfig, EmitResult};
use crate::ir::MethodIr;
use crate::metadata::{MetadataStore, MethodToken};

/// Counters exposed for diagnostics. All monotonic.
#[derive(Debug, Default)]
pub struct CacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
    translations: AtomicU64,
}

impl CacheStats {
    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    /// Translations actually performed; stays below `misses` when threads
    /// race on the same cold method.
    pub fn translations(&self) -> u64 {
        self.translations.load(Ordering::Relaxed)
    }
}

#[derive(Default)]
pub struct MethodIrCache {
    map: DashMap<MethodToken, Arc<MethodIr>, GxBuildHasher>,
    compile_lock: Mutex<()>,
    stats: CacheStats,
}

impl MethodIrCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Cached translation if present, without compiling.
    pub fn get(&self, method: MethodToken) -> Option<Arc<MethodIr>> {
        self.map.get(&method).map(|e| e.value().clone())
    }

    /// Look up a method, translating and publishing it on first use.
    pub fn get_or_translate(
        &self,
        store: &MetadataStore,
        cfg: &EmitConfig<'_>,
        method: MethodToken,
    ) -> EmitResult<Arc<MethodIr>> {
        if let Some(hit) = self.map.get(&method) {
            self.stats.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(hit.value().clone());
        }
        self.stats.misses.fetch_add(1, Ordering::Relaxed);

        let _guard = self.compile_lock.lock();
        // A racing thread may have published while we waited.
        if let Some(hit) = self.map.get(&method) {
            return Ok(hit.value().clone());
        }

        let ir = Arc::new(emit_method(store, cfg, method)?);
        self.stats.translations.fetch_add(1, Ordering::Relaxed);
        debug!(method = %method, instrs = ir.code.len(), "published translation");
        self.map.insert(method, ir.clone());
        Ok(ir)
    }

    /// Drop a published translation, forcing retranslation on next use.
    pub fn invalidate(&self, method: MethodToken) {
        self.map.remove(&method);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::emit::intrinsics::IntrinsicTable;
    use crate::metadata::{MethodBody, MethodDesc, MethodKind, PrimKind, TypeDesc};

    fn fixture() -> (MetadataStore, MethodToken) {
        let mut store = MetadataStore::new();
        let i4 = store.add_type(TypeDesc::primitive("System.Int32", PrimKind::I4));
        let m = store.add_method(MethodDesc {
            name: "Forty".into(),
            declaring: None,
            params: vec![],
            ret: Some(i4),
            is_static: true,
            is_virtual: false,
            is_delegate_invoke: false,
            kind: MethodKind::Interpreted(MethodBody {
                code: vec![0x1F, 40, 0x2A],
                max_stack: 4,
                locals: vec![],
                clauses: vec![],
                init_locals: false,
            }),
        });
        (store, m)
    }

    #[test]
    fn test_second_lookup_returns_same_arc() {
        let (store, m) = fixture();
        let intrinsics = IntrinsicTable::with_defaults();
        let cfg = EmitConfig { intrinsics: &intrinsics, trampolines: None };
        let cache = MethodIrCache::new();

        let a = cache.get_or_translate(&store, &cfg, m).unwrap();
        let b = cache.get_or_translate(&store, &cfg, m).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(cache.stats().translations(), 1);
        assert_eq!(cache.stats().hits(), 1);
        assert_eq!(cache.stats().misses(), 1);
    }

    #[test]
    fn test_concurrent_cold_lookups_translate_once() {
        let (store, m) = fixture();
        let intrinsics = IntrinsicTable::with_defaults();
        let cache = MethodIrCache::new();

        std::thread::scope(|s| {
            for _ in 0..8 {
                let store = &store;
                let intrinsics = &intrinsics;
                let cache = &cache;
                s.spawn(move || {
                    let cfg = EmitConfig { intrinsics, trampolines: None };
                    cache.get_or_translate(store, &cfg, m).unwrap()
                });
            }
        });
        assert_eq!(cache.stats().translations(), 1);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_failed_translation_is_not_published() {
        let mut store = MetadataStore::new();
        let i4 = store.add_type(TypeDesc::primitive("System.Int32", PrimKind::I4));
        // Underflowing body: add on an empty stack.
        let bad = store.add_method(MethodDesc {
            name: "Bad".into(),
            declaring: None,
            params: vec![],
            ret: Some(i4),
            is_static: true,
            is_virtual: false,
            is_delegate_invoke: false,
            kind: MethodKind::Interpreted(MethodBody {
                code: vec![0x58, 0x2A],
                max_stack: 4,
                locals: vec![],
                clauses: vec![],
                init_locals: false,
            }),
        });
        let intrinsics = IntrinsicTable::with_defaults();
        let cfg = EmitConfig { intrinsics: &intrinsics, trampolines: None };
        let cache = MethodIrCache::new();
        assert!(cache.get_or_translate(&store, &cfg, bad).is_err());
        assert!(cache.is_empty());
        // The failure repeats rather than caching a broken translation.
        assert!(cache.get_or_translate(&store, &cfg, bad).is_err());
    }

    #[test]
    fn test_invalidate_forces_retranslation() {
        let (store, m) = fixture();
        let intrinsics = IntrinsicTable::with_defaults();
        let cfg = EmitConfig { intrinsics: &intrinsics, trampolines: None };
        let cache = MethodIrCache::new();

        cache.get_or_translate(&store, &cfg, m).unwrap();
        cache.invalidate(m);
        cache.get_or_translate(&store, &cfg, m).unwrap();
        assert_eq!(cache.stats().translations(), 2);
    }
}
