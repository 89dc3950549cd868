//! The `Alloc` header every managed heap block is prefixed by, and the
//! kinds the collector dispatches on.
//!
//! This module only describes the header; the allocation list, sweep, and
//! `gc_alloc` entry point live in `loom-runtime::gc` because they need the
//! per-interpreter `Ty` context this crate doesn't know about.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

/// What kind of managed object an `Alloc` header is attached to.
///
/// Mirrors `original_source/include/gc.h`'s `GC_*` enum: the collector's
/// `collect()` dispatch switches on this to run the right finalization
/// step (see `loom_runtime::gc::collect`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AllocKind {
    Array,
    Blob,
    Dict,
    Object,
    Regex,
    String,
    Generator,
    Thread,
    FfiAuto,
    FunInfo,
    Arena,
    Value,
    Any,
}

/// Header prefixing every managed heap block.
///
/// `ALLOC_OF(p)` in the original is pointer arithmetic (`p - sizeof(header)`);
/// here the header instead owns the payload directly (`Alloc<T>` is not
/// generic over the header/body split because Rust's allocator API does not
/// hand back a stable pointer to walk backwards from — the allocation list
/// in `loom-runtime::gc` stores `Box<Alloc>` with the payload behind an
/// internal `AllocBody` enum instead of raw pointer arithmetic).
#[derive(Debug)]
pub struct Alloc {
    pub kind: AllocKind,
    pub size: usize,
    mark: AtomicBool,
    hard: AtomicU32,
}

impl Alloc {
    pub fn new(kind: AllocKind, size: usize) -> Self {
        Self {
            kind,
            size,
            mark: AtomicBool::new(false),
            hard: AtomicU32::new(0),
        }
    }

    #[inline]
    pub fn is_marked(&self) -> bool {
        self.mark.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn mark(&self) {
        self.mark.store(true, Ordering::Relaxed);
    }

    #[inline]
    pub fn unmark(&self) {
        self.mark.store(false, Ordering::Relaxed);
    }

    /// Is this allocation immune to sweep because of a nonzero hard-pin
    /// counter? Reentrant: `NOGC`/`OKGC` increment/decrement the same
    /// counter, so nested pins compose correctly.
    #[inline]
    pub fn is_hard_pinned(&self) -> bool {
        self.hard.load(Ordering::Relaxed) != 0
    }

    /// `NOGC(p)`: pin this allocation so sweep will not collect it.
    #[inline]
    pub fn pin(&self) {
        self.hard.fetch_add(1, Ordering::Relaxed);
    }

    /// `OKGC(p)`: release one hard-pin. Saturates at zero rather than
    /// underflowing, so a stray extra unpin can't wrap the counter around
    /// and silently un-hard-pin a block something else still depends on.
    #[inline]
    pub fn unpin(&self) {
        let _ = self
            .hard
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |h| {
                Some(h.saturating_sub(1))
            });
    }
}

/// RAII guard for the `NOGC`/`OKGC` hard-pin idiom: pins on construction,
/// unpins on drop. Used while building a composite value (array-push of a
/// new array, dict-put of a new dict) so a GC triggered by a sibling
/// allocation can't sweep the half-built graph (§5, "Scoped acquisition").
pub struct HardPinGuard<'a> {
    alloc: &'a Alloc,
}

impl<'a> HardPinGuard<'a> {
    pub fn new(alloc: &'a Alloc) -> Self {
        alloc.pin();
        Self { alloc }
    }
}

impl Drop for HardPinGuard<'_> {
    fn drop(&mut self) {
        self.alloc.unpin();
    }
}
