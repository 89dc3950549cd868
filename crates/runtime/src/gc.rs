//! Mark-sweep collector over one interpreter's allocation list.
//!
//! `Value`'s heap variants are `Arc`-shared, so normal Rust drop already
//! reclaims everything acyclic. The collector here exists for what `Arc`
//! alone cannot: cycles (an array that contains itself, directly or
//! through a dict), plus generator/thread/ffi-auto-pointer records that
//! need their own cleanup run when nothing reaches them anymore. Sweep
//! does not free memory the allocator's way; instead, for any tracked
//! allocation unreached by the mark phase, it either clears the
//! payload's own contents (empties the array, clears the dict) so the
//! cycle's `Arc` edges drop and the normal refcount path finishes the
//! reclamation, or runs its kind-specific collection hook (drop-stack,
//! finalizer). Three phases: seed roots, mark workset, sweep-and-collect.

use crate::ffi::AutoPointer;
use loom_core::{AllocKind, DictData, GeneratorHandle, ObjectData, ThreadHandle, TupleData, Value, ValueKind};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// One entry in an interpreter's allocation list: a GC header plus enough
/// of the payload to trace its children and, on collection, break it.
struct AllocRecord {
    kind: AllocKind,
    mark: AtomicBool,
    hard: AtomicUsize,
    addr: usize,
    body: AllocBody,
}

enum AllocBody {
    Array(Arc<Mutex<Vec<Value>>>),
    Dict(Arc<Mutex<DictData>>),
    Blob(Arc<Mutex<Vec<u8>>>),
    Tuple(Arc<TupleData>),
    Object(Arc<ObjectData>, Option<Value>), // (data, finalizer)
    Generator(Arc<dyn GeneratorHandle>),
    Thread(Arc<dyn ThreadHandle>),
    FfiAuto(Arc<Mutex<AutoPointer>>),
}

impl AllocRecord {
    fn children(&self) -> Vec<Value> {
        match &self.body {
            AllocBody::Array(a) => a.lock().expect("array lock poisoned").clone(),
            AllocBody::Dict(d) => {
                let d = d.lock().expect("dict lock poisoned");
                let mut out: Vec<Value> = d.entries.iter().flat_map(|(k, v)| [k.clone(), v.clone()]).collect();
                if let Some(dflt) = &d.default {
                    out.push(dflt.clone());
                }
                out
            }
            AllocBody::Blob(_) => Vec::new(),
            AllocBody::Tuple(t) => t.items.clone(),
            AllocBody::Object(o, _) => o
                .itable
                .lock()
                .expect("itable lock poisoned")
                .values()
                .filter_map(|slot| match slot {
                    loom_core::ItableSlot::Direct(v) => Some(v.clone()),
                    loom_core::ItableSlot::Ref(cell) => cell.lock().expect("ref cell lock poisoned").clone(),
                })
                .collect(),
            // A suspended generator's captured Values live inside its
            // coroutine closure, a thread's mailbox holds in-flight
            // messages rather than a rooted graph, and an auto-pointer's
            // finalizer is an opaque Rust closure — none of the three
            // expose Values this mark phase can trace into. They are
            // still tracked allocations: unreachable ones still get
            // `collect()`'s cleanup below, just with no children to mark.
            AllocBody::Generator(_) | AllocBody::Thread(_) | AllocBody::FfiAuto(_) => Vec::new(),
        }
    }

    /// Sweep-time cleanup: break the cycle by clearing owned contents.
    /// An object's finalizer, if any, is invoked by the caller (the
    /// interpreter surface owns the VM call mechanism `collect` would
    /// otherwise need); `finalizer_of` exposes it for that purpose.
    fn collect(&self) {
        match &self.body {
            AllocBody::Array(a) => a.lock().expect("array lock poisoned").clear(),
            AllocBody::Dict(d) => {
                let mut d = d.lock().expect("dict lock poisoned");
                d.entries.clear();
                d.default = None;
            }
            AllocBody::Blob(b) => b.lock().expect("blob lock poisoned").clear(),
            AllocBody::Tuple(_) => {}
            AllocBody::Object(o, _) => {
                o.itable.lock().expect("itable lock poisoned").clear();
            }
            AllocBody::Generator(g) => g.on_collected(),
            AllocBody::Thread(_) => {}
            AllocBody::FfiAuto(ap) => ap.lock().expect("auto-pointer lock poisoned").run_once(),
        }
    }

    fn finalizer(&self) -> Option<(Arc<ObjectData>, Value)> {
        match &self.body {
            AllocBody::Object(o, Some(f)) => Some((o.clone(), f.clone())),
            _ => None,
        }
    }
}

/// Live counters surfaced through `GCStats`: plain atomics updated on the
/// hot path, read only by diagnostics.
#[derive(Debug, Default)]
pub struct GCCounters {
    pub memory_used: AtomicUsize,
    pub sweeps_run: AtomicU64,
    pub objects_collected: AtomicU64,
}

#[derive(Debug, Clone, Copy)]
pub struct GCStats {
    pub allocations_live: usize,
    pub bytes_used: usize,
    pub sweeps_run: u64,
    pub last_sweep_collected: u64,
}

/// One interpreter's allocation list and GC bookkeeping (§3.2, §4.C).
pub struct AllocList {
    records: Vec<AllocRecord>,
    index: HashMap<usize, usize>,
    counters: GCCounters,
    gc_prevent: AtomicUsize,
    threshold: usize,
    last_sweep_collected: AtomicU64,
}

impl AllocList {
    pub fn new(threshold: usize) -> Self {
        Self {
            records: Vec::new(),
            index: HashMap::new(),
            counters: GCCounters::default(),
            gc_prevent: AtomicUsize::new(0),
            threshold,
            last_sweep_collected: AtomicU64::new(0),
        }
    }

    fn push(&mut self, kind: AllocKind, size: usize, addr: usize, body: AllocBody) {
        let idx = self.records.len();
        self.records.push(AllocRecord {
            kind,
            mark: AtomicBool::new(false),
            hard: AtomicUsize::new(0),
            addr,
            body,
        });
        self.index.insert(addr, idx);
        self.counters.memory_used.fetch_add(size, Ordering::Relaxed);
    }

    pub fn track_array(&mut self, handle: &Arc<Mutex<Vec<Value>>>) {
        let addr = Arc::as_ptr(handle) as usize;
        let size = handle.lock().expect("array lock poisoned").len() * std::mem::size_of::<Value>();
        self.push(AllocKind::Array, size, addr, AllocBody::Array(handle.clone()));
    }

    pub fn track_dict(&mut self, handle: &Arc<Mutex<DictData>>) {
        let addr = Arc::as_ptr(handle) as usize;
        self.push(AllocKind::Dict, std::mem::size_of::<DictData>(), addr, AllocBody::Dict(handle.clone()));
    }

    pub fn track_blob(&mut self, handle: &Arc<Mutex<Vec<u8>>>) {
        let addr = Arc::as_ptr(handle) as usize;
        let size = handle.lock().expect("blob lock poisoned").len();
        self.push(AllocKind::Blob, size, addr, AllocBody::Blob(handle.clone()));
    }

    pub fn track_tuple(&mut self, handle: &Arc<TupleData>) {
        let addr = Arc::as_ptr(handle) as usize;
        let size = handle.items.len() * std::mem::size_of::<Value>();
        self.push(AllocKind::Value, size, addr, AllocBody::Tuple(handle.clone()));
    }

    pub fn track_object(&mut self, handle: &Arc<ObjectData>, finalizer: Option<Value>) {
        let addr = Arc::as_ptr(handle) as usize;
        self.push(AllocKind::Object, std::mem::size_of::<ObjectData>(), addr, AllocBody::Object(handle.clone(), finalizer));
    }

    pub fn track_generator(&mut self, handle: &Arc<dyn GeneratorHandle>) {
        let addr = Arc::as_ptr(handle) as *const () as usize;
        self.push(AllocKind::Generator, 0, addr, AllocBody::Generator(handle.clone()));
    }

    pub fn track_thread(&mut self, handle: &Arc<dyn ThreadHandle>) {
        let addr = Arc::as_ptr(handle) as *const () as usize;
        self.push(AllocKind::Thread, 0, addr, AllocBody::Thread(handle.clone()));
    }

    /// Tracks an auto-free pointer under the raw address it finalizes
    /// (not `handle`'s own allocation), so a `Value::Ptr` carrying that
    /// same address is what the mark phase finds it through.
    pub fn track_ffi_auto(&mut self, handle: &Arc<Mutex<AutoPointer>>) {
        let addr = handle.lock().expect("auto-pointer lock poisoned").addr;
        self.push(AllocKind::FfiAuto, 0, addr, AllocBody::FfiAuto(handle.clone()));
    }

    /// `NOGC(p)` / `OKGC(p)` by allocation address (see `loom_core::alloc::HardPinGuard`
    /// for the single-object RAII form; this is the list-indexed equivalent
    /// used once an allocation is already tracked).
    pub fn pin(&self, addr: usize) {
        if let Some(&idx) = self.index.get(&addr) {
            self.records[idx].hard.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn unpin(&self, addr: usize) {
        if let Some(&idx) = self.index.get(&addr) {
            let _ = self.records[idx].hard.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |h| Some(h.saturating_sub(1)));
        }
    }

    /// `GC_STOP` / `GC_RESUME`: any increment defers collection.
    pub fn gc_stop(&self) {
        self.gc_prevent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn gc_resume(&self) {
        let _ = self.gc_prevent.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |p| Some(p.saturating_sub(1)));
    }

    /// Should a safe point schedule a sweep? True once live bytes exceed
    /// the soft threshold and nothing holds `gc_prevent` up.
    pub fn should_collect(&self) -> bool {
        self.gc_prevent.load(Ordering::Relaxed) == 0
            && self.counters.memory_used.load(Ordering::Relaxed) > self.threshold
    }

    pub fn stats(&self) -> GCStats {
        GCStats {
            allocations_live: self.records.len(),
            bytes_used: self.counters.memory_used.load(Ordering::Relaxed),
            sweeps_run: self.counters.sweeps_run.load(Ordering::Relaxed),
            last_sweep_collected: self.last_sweep_collected.load(Ordering::Relaxed),
        }
    }

    /// Run one mark-sweep cycle. `roots` is every `Value` directly
    /// reachable from the interpreter's stacks, frames, and root-set
    /// (§4.D step 2); the caller is expected to have already taken the
    /// cooperative lock.
    pub fn collect(&mut self, roots: &[Value], mut call_finalizer: impl FnMut(&Value, &Value)) {
        for r in &self.records {
            r.mark.store(false, Ordering::Relaxed);
        }

        let mut worklist: Vec<Value> = roots.to_vec();
        while let Some(v) = worklist.pop() {
            if let Some(addr) = heap_addr(&v) {
                if let Some(&idx) = self.index.get(&addr) {
                    let rec = &self.records[idx];
                    if !rec.mark.swap(true, Ordering::Relaxed) {
                        worklist.extend(rec.children());
                    }
                }
            }
        }

        let mut collected = 0u64;
        let mut i = 0;
        while i < self.records.len() {
            let unreachable = !self.records[i].mark.load(Ordering::Relaxed) && self.records[i].hard.load(Ordering::Relaxed) == 0;
            if unreachable {
                if let Some((obj, finalizer)) = self.records[i].finalizer() {
                    let receiver = Value::new(ValueKind::Object(obj));
                    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                        call_finalizer(&receiver, &finalizer)
                    }));
                    if let Err(payload) = result {
                        loom_core::set_runtime_error(loom_core::error::format_panic_payload(&*payload));
                    }
                }
                self.records[i].collect();
                let removed = self.records.swap_remove(i);
                self.index.remove(&removed.addr);
                if i < self.records.len() {
                    // swap_remove moved the last element into position i; fix its index.
                    self.index.insert(self.records[i].addr, i);
                }
                collected += 1;
            } else {
                i += 1;
            }
        }

        self.counters.sweeps_run.fetch_add(1, Ordering::Relaxed);
        self.counters.objects_collected.fetch_add(collected, Ordering::Relaxed);
        self.last_sweep_collected.store(collected, Ordering::Relaxed);
    }
}

fn heap_addr(v: &Value) -> Option<usize> {
    match &v.kind {
        ValueKind::Array(a) => Some(Arc::as_ptr(a) as usize),
        ValueKind::Dict(d) => Some(Arc::as_ptr(d) as usize),
        ValueKind::Blob(b) => Some(Arc::as_ptr(b) as usize),
        ValueKind::Tuple(t) => Some(Arc::as_ptr(t) as usize),
        ValueKind::Object(o) => Some(Arc::as_ptr(o) as usize),
        ValueKind::Generator(g) => Some(Arc::as_ptr(g) as *const () as usize),
        ValueKind::Thread(t) => Some(Arc::as_ptr(t) as *const () as usize),
        // A raw pointer Value shares the address namespace with
        // `track_ffi_auto`: a reachable `Ptr` pointing at an auto-freed
        // address keeps that finalizer's record marked, the same way a
        // reachable `Array` keeps its backing allocation marked.
        ValueKind::Ptr(p) => Some(p.addr),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use loom_core::Value;

    fn array(items: Vec<Value>) -> (Value, Arc<Mutex<Vec<Value>>>) {
        let handle = Arc::new(Mutex::new(items));
        (Value::new(ValueKind::Array(handle.clone())), handle)
    }

    #[test]
    fn acyclic_array_is_collected_when_unreachable() {
        let mut allocs = AllocList::new(1);
        let (_v, handle) = array(vec![Value::int(1)]);
        allocs.track_array(&handle);
        allocs.collect(&[], |_, _| {});
        assert_eq!(allocs.stats().allocations_live, 0);
        assert_eq!(allocs.stats().last_sweep_collected, 1);
    }

    #[test]
    fn reachable_array_survives_sweep() {
        let mut allocs = AllocList::new(1);
        let (v, handle) = array(vec![Value::int(1)]);
        allocs.track_array(&handle);
        allocs.collect(&[v], |_, _| {});
        assert_eq!(allocs.stats().allocations_live, 1);
    }

    #[test]
    fn self_referential_array_is_cleared_and_dropped() {
        let mut allocs = AllocList::new(1);
        let handle = Arc::new(Mutex::new(Vec::new()));
        let v = Value::new(ValueKind::Array(handle.clone()));
        handle.lock().expect("array lock poisoned").push(v.clone());
        allocs.track_array(&handle);
        drop(v);
        allocs.collect(&[], |_, _| {});
        assert_eq!(allocs.stats().allocations_live, 0);
        assert!(handle.lock().expect("array lock poisoned").is_empty());
    }

    #[test]
    fn hard_pin_survives_an_unreachable_sweep() {
        let mut allocs = AllocList::new(1);
        let (_v, handle) = array(vec![]);
        allocs.track_array(&handle);
        let addr = Arc::as_ptr(&handle) as usize;
        allocs.pin(addr);
        allocs.collect(&[], |_, _| {});
        assert_eq!(allocs.stats().allocations_live, 1);
        allocs.unpin(addr);
        allocs.collect(&[], |_, _| {});
        assert_eq!(allocs.stats().allocations_live, 0);
    }

    #[test]
    fn unreachable_generator_runs_its_drop_stack() {
        use crate::generator::Generator;
        let order = Arc::new(Mutex::new(Vec::new()));
        let o = order.clone();
        let gen = Generator::spawn(|_first, _yielder| Value::nil());
        gen.push_drop_action(Box::new(move || o.lock().unwrap().push(1)));
        let handle: Arc<dyn GeneratorHandle> = gen;
        let mut allocs = AllocList::new(1);
        allocs.track_generator(&handle);
        allocs.collect(&[], |_, _| {});
        assert_eq!(allocs.stats().allocations_live, 0);
        assert_eq!(*order.lock().unwrap(), vec![1]);
    }

    #[test]
    fn reachable_generator_survives_sweep() {
        use crate::generator::Generator;
        let gen = Generator::spawn(|_first, _yielder| Value::nil());
        let handle: Arc<dyn GeneratorHandle> = gen;
        let v = Value::new(ValueKind::Generator(handle.clone()));
        let mut allocs = AllocList::new(1);
        allocs.track_generator(&handle);
        allocs.collect(&[v], |_, _| {});
        assert_eq!(allocs.stats().allocations_live, 1);
    }

    #[test]
    fn unreachable_thread_is_swept_without_special_action() {
        use crate::thread::VmThread;
        let spawned = VmThread::spawn("gc-test-thread", |_mailbox| {}).unwrap();
        let handle: Arc<dyn ThreadHandle> = spawned;
        let mut allocs = AllocList::new(1);
        allocs.track_thread(&handle);
        allocs.collect(&[], |_, _| {});
        assert_eq!(allocs.stats().allocations_live, 0);
    }

    #[test]
    fn unreachable_ffi_auto_runs_its_finalizer_through_collect() {
        let ran = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let r = ran.clone();
        let ap = Arc::new(Mutex::new(AutoPointer::new(0x4000, Some(Box::new(move |_| {
            r.fetch_add(1, Ordering::Relaxed);
        })))));
        let mut allocs = AllocList::new(1);
        allocs.track_ffi_auto(&ap);
        allocs.collect(&[], |_, _| {});
        assert_eq!(allocs.stats().allocations_live, 0);
        assert_eq!(ran.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn reachable_ptr_to_the_same_address_keeps_the_auto_pointer_alive() {
        let ran = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let r = ran.clone();
        let ap = Arc::new(Mutex::new(AutoPointer::new(0x5000, Some(Box::new(move |_| {
            r.fetch_add(1, Ordering::Relaxed);
        })))));
        let v = Value::new(ValueKind::Ptr(loom_core::PtrData { addr: 0x5000, extra: None }));
        let mut allocs = AllocList::new(1);
        allocs.track_ffi_auto(&ap);
        allocs.collect(&[v], |_, _| {});
        assert_eq!(allocs.stats().allocations_live, 1);
        assert_eq!(ran.load(Ordering::Relaxed), 0);
    }

    /// GC liveness (a root stays intact across repeated collections
    /// interleaved with unrelated allocation/collection churn): pins one
    /// array, then runs 1000 collections each preceded by a fresh unrooted
    /// scratch allocation, checking the pinned array's contents and
    /// backing `Arc` identity are unchanged after every single cycle, not
    /// just the last.
    #[test]
    fn pinned_array_survives_a_thousand_collections_with_interleaved_allocations() {
        let mut allocs = AllocList::new(1);
        let (_v, handle) = array(vec![Value::int(1), Value::int(2), Value::int(3)]);
        allocs.track_array(&handle);
        let pinned_addr = Arc::as_ptr(&handle) as usize;
        allocs.pin(pinned_addr);

        for i in 0..1000u32 {
            let (_scratch_v, scratch_handle) = array(vec![Value::int(i as i64); (i % 7) as usize]);
            allocs.track_array(&scratch_handle);
            allocs.collect(&[], |_, _| {});
            assert_eq!(Arc::as_ptr(&handle) as usize, pinned_addr);
            assert_eq!(
                *handle.lock().expect("array lock poisoned"),
                vec![Value::int(1), Value::int(2), Value::int(3)]
            );
        }
        allocs.unpin(pinned_addr);
        allocs.collect(&[], |_, _| {});
        assert_eq!(allocs.stats().allocations_live, 0);
    }

    #[test]
    fn gc_stop_defers_collection_decision() {
        let allocs = AllocList::new(0);
        allocs.gc_stop();
        assert!(!allocs.should_collect());
        allocs.gc_resume();
    }
}
