//! Concurrency substrate: OS-thread primitives and the global cooperative
//! lock any VM thread must hold to execute bytecode or touch another
//! thread's Values (§4.G).

use crate::config::config;
use crate::queue::MessageQueue;
use loom_core::ThreadHandle;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, OnceLock, RwLock};
use std::thread::ThreadId;
use std::time::Duration;

/// Thin wrapper over `std::thread::JoinHandle`, presenting the same
/// uniform `TyThread*` naming over pthread/WinAPI so call sites don't
/// depend on platform specifics.
pub struct TyThread<T> {
    handle: Option<std::thread::JoinHandle<T>>,
}

impl<T: Send + 'static> TyThread<T> {
    pub fn spawn(name: impl Into<String>, f: impl FnOnce() -> T + Send + 'static) -> std::io::Result<Self> {
        let stack_size = config().stack_size;
        let handle = std::thread::Builder::new().name(name.into()).stack_size(stack_size).spawn(f)?;
        Ok(Self { handle: Some(handle) })
    }

    pub fn join(mut self) -> std::thread::Result<T> {
        self.handle.take().expect("thread already joined").join()
    }

    /// Best-effort kill is not offered: Rust has no safe thread-termination
    /// primitive. Graceful shutdown goes through a sentinel message on the
    /// thread's queue instead (see `queue.rs`).
    pub fn id(&self) -> Option<ThreadId> {
        self.handle.as_ref().map(|h| h.thread().id())
    }
}

/// Concrete `Value::Thread(Arc<dyn ThreadHandle>)` implementor: an OS
/// thread spawned to run a caller-supplied body, reachable through its
/// mailbox and `is_alive` rather than by joining (joining would require
/// consuming the one `Arc` every other thread also holds a clone of).
#[derive(Debug)]
pub struct VmThread {
    alive: AtomicBool,
    pub mailbox: Arc<MessageQueue>,
    registry_id: Mutex<Option<u64>>,
}

impl VmThread {
    /// Spawns `body` on a new OS thread, registering it with the global
    /// `ThreadRegistry` for the watchdog and unregistering on exit whether
    /// `body` panics or returns normally.
    pub fn spawn(name: impl Into<String>, body: impl FnOnce(Arc<MessageQueue>) + Send + 'static) -> std::io::Result<Arc<Self>> {
        let mailbox = Arc::new(MessageQueue::new());
        let handle = Arc::new(Self {
            alive: AtomicBool::new(true),
            mailbox: mailbox.clone(),
            registry_id: Mutex::new(thread_registry().register()),
        });
        let spawned = handle.clone();
        TyThread::spawn(name, move || {
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| body(mailbox)));
            spawned.alive.store(false, Ordering::Release);
            if let Some(id) = spawned.registry_id.lock().expect("registry id lock poisoned").take() {
                thread_registry().unregister(id);
            }
            if let Err(payload) = result {
                std::panic::resume_unwind(payload);
            }
        })?;
        Ok(handle)
    }
}

impl ThreadHandle for VmThread {
    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }
}

pub struct TyMutex<T> {
    inner: Mutex<T>,
}

impl<T> TyMutex<T> {
    pub fn new(value: T) -> Self {
        Self { inner: Mutex::new(value) }
    }

    pub fn lock(&self) -> std::sync::MutexGuard<'_, T> {
        self.inner.lock().expect("mutex poisoned")
    }
}

pub struct TyCondVar {
    inner: Condvar,
}

impl Default for TyCondVar {
    fn default() -> Self {
        Self::new()
    }
}

impl TyCondVar {
    pub fn new() -> Self {
        Self { inner: Condvar::new() }
    }

    pub fn wait<'a, T>(&self, guard: std::sync::MutexGuard<'a, T>) -> std::sync::MutexGuard<'a, T> {
        self.inner.wait(guard).expect("condvar wait on poisoned mutex")
    }

    /// Relative-nanosecond timeout wait, per §5's cancellation/timeout model.
    pub fn wait_timeout<'a, T>(
        &self,
        guard: std::sync::MutexGuard<'a, T>,
        timeout: Duration,
    ) -> (std::sync::MutexGuard<'a, T>, bool) {
        let (guard, result) = self.inner.wait_timeout(guard, timeout).expect("condvar wait on poisoned mutex");
        (guard, result.timed_out())
    }

    pub fn notify_one(&self) {
        self.inner.notify_one();
    }

    pub fn notify_all(&self) {
        self.inner.notify_all();
    }
}

pub struct TyRwLock<T> {
    inner: RwLock<T>,
}

impl<T> TyRwLock<T> {
    pub fn new(value: T) -> Self {
        Self { inner: RwLock::new(value) }
    }

    pub fn read(&self) -> std::sync::RwLockReadGuard<'_, T> {
        self.inner.read().expect("rwlock poisoned")
    }

    pub fn write(&self) -> std::sync::RwLockWriteGuard<'_, T> {
        self.inner.write().expect("rwlock poisoned")
    }
}

/// Reimplemented rather than relying on a platform barrier, matching the
/// spec's note that macOS lacks a native one: a counting barrier built on a
/// mutex + condvar, usable uniformly across targets.
pub struct TyBarrier {
    state: Mutex<BarrierState>,
    cv: Condvar,
    count: usize,
}

struct BarrierState {
    waiting: usize,
    generation: u64,
}

impl TyBarrier {
    pub fn new(count: usize) -> Self {
        Self { state: Mutex::new(BarrierState { waiting: 0, generation: 0 }), cv: Condvar::new(), count }
    }

    /// Blocks until `count` callers have arrived; returns true to exactly
    /// one caller per generation (the "leader"), matching the
    /// `std::sync::Barrier` convention.
    pub fn wait(&self) -> bool {
        let mut state = self.state.lock().expect("barrier mutex poisoned");
        let gen = state.generation;
        state.waiting += 1;
        if state.waiting == self.count {
            state.waiting = 0;
            state.generation = state.generation.wrapping_add(1);
            self.cv.notify_all();
            true
        } else {
            while state.generation == gen {
                state = self.cv.wait(state).expect("barrier condvar wait on poisoned mutex");
            }
            false
        }
    }
}

/// Spinlock for short critical sections where parking via a full mutex
/// would cost more than busy-waiting.
pub struct TySpinLock<T> {
    locked: AtomicUsize,
    value: std::cell::UnsafeCell<T>,
}

unsafe impl<T: Send> Sync for TySpinLock<T> {}

pub struct TySpinLockGuard<'a, T> {
    lock: &'a TySpinLock<T>,
}

impl<T> std::ops::Deref for TySpinLockGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        unsafe { &*self.lock.value.get() }
    }
}

impl<T> std::ops::DerefMut for TySpinLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.value.get() }
    }
}

impl<T> Drop for TySpinLockGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.locked.store(0, Ordering::Release);
    }
}

impl<T> TySpinLock<T> {
    pub fn new(value: T) -> Self {
        Self { locked: AtomicUsize::new(0), value: std::cell::UnsafeCell::new(value) }
    }

    pub fn lock(&self) -> TySpinLockGuard<'_, T> {
        while self.locked.compare_exchange_weak(0, 1, Ordering::Acquire, Ordering::Relaxed).is_err() {
            std::hint::spin_loop();
        }
        TySpinLockGuard { lock: self }
    }
}

/// Lock-free registry of live VM threads, used by diagnostics and the
/// watchdog to enumerate strands without a shared mutex on the hot path.
/// CAS-claimed slots, scan-to-register/scan-to-unregister, matches the
/// teacher's strand registry in `scheduler.rs` generalized from strand ids
/// to `std::thread::ThreadId`-keyed entries plus a spawn timestamp.
pub struct ThreadRegistry {
    slots: Box<[ThreadSlot]>,
    pub overflow_count: AtomicU64,
}

struct ThreadSlot {
    thread_id: AtomicU64,
    spawn_time: AtomicU64,
}

impl ThreadSlot {
    const fn new() -> Self {
        Self { thread_id: AtomicU64::new(0), spawn_time: AtomicU64::new(0) }
    }
}

static NEXT_REGISTRY_ID: AtomicU64 = AtomicU64::new(1);

impl ThreadRegistry {
    pub fn new(capacity: usize) -> Self {
        let mut slots = Vec::with_capacity(capacity);
        for _ in 0..capacity {
            slots.push(ThreadSlot::new());
        }
        Self { slots: slots.into_boxed_slice(), overflow_count: AtomicU64::new(0) }
    }

    /// Returns an opaque registry id (not a `ThreadId`, which can't be cast
    /// to an integer) to the caller so it can later unregister.
    pub fn register(&self) -> Option<u64> {
        let id = NEXT_REGISTRY_ID.fetch_add(1, Ordering::Relaxed);
        let spawn_time =
            std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0);
        for slot in self.slots.iter() {
            if slot.thread_id.compare_exchange(0, id, Ordering::AcqRel, Ordering::Relaxed).is_ok() {
                slot.spawn_time.store(spawn_time, Ordering::Relaxed);
                return Some(id);
            }
        }
        self.overflow_count.fetch_add(1, Ordering::Relaxed);
        None
    }

    pub fn unregister(&self, id: u64) -> bool {
        for slot in self.slots.iter() {
            if slot.thread_id.compare_exchange(id, 0, Ordering::AcqRel, Ordering::Relaxed).is_ok() {
                slot.spawn_time.store(0, Ordering::Release);
                return true;
            }
        }
        false
    }

    pub fn active(&self) -> impl Iterator<Item = (u64, u64)> + '_ {
        self.slots.iter().filter_map(|slot| {
            let id = slot.thread_id.load(Ordering::Acquire);
            (id > 0).then(|| (id, slot.spawn_time.load(Ordering::Relaxed)))
        })
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }
}

static THREAD_REGISTRY: OnceLock<ThreadRegistry> = OnceLock::new();

pub fn thread_registry() -> &'static ThreadRegistry {
    THREAD_REGISTRY.get_or_init(|| ThreadRegistry::new(config().strand_registry_size))
}

/// The global cooperative lock ("the GC lock"): a VM thread holds it
/// continuously while executing bytecode and releases it only around
/// blocking work (`ffi.call`, condvar/barrier waits, message-queue reads) or
/// while a collection it initiated (§4.D) is in progress. Other threads
/// entering VM code block here; this is the only stop-the-world protocol.
pub struct GlobalLock {
    holder: Mutex<Option<ThreadId>>,
    cv: Condvar,
    /// How many times the current holder has reentrantly taken the lock
    /// (nested `TakeLock` calls on the same thread are a no-op past the
    /// first).
    depth: RwLock<HashMap<ThreadId, usize>>,
}

impl Default for GlobalLock {
    fn default() -> Self {
        Self::new()
    }
}

impl GlobalLock {
    pub fn new() -> Self {
        Self { holder: Mutex::new(None), cv: Condvar::new(), depth: RwLock::new(HashMap::new()) }
    }

    /// `TakeLock`: blocks until no other thread holds the lock, then takes
    /// it. Reentrant: a thread that already holds it just bumps its depth.
    pub fn take(&self) {
        let me = std::thread::current().id();
        {
            let depths = self.depth.read().expect("lock depth map poisoned");
            if let Some(&d) = depths.get(&me) {
                if d > 0 {
                    drop(depths);
                    *self.depth.write().expect("lock depth map poisoned").get_mut(&me).unwrap() += 1;
                    return;
                }
            }
        }
        let mut holder = self.holder.lock().expect("global lock mutex poisoned");
        while holder.is_some() {
            holder = self.cv.wait(holder).expect("global lock condvar wait on poisoned mutex");
        }
        *holder = Some(me);
        self.depth.write().expect("lock depth map poisoned").insert(me, 1);
    }

    /// `ReleaseLock`: decrements this thread's depth; only actually
    /// releases the lock (and wakes a waiter) when depth reaches zero.
    pub fn release(&self) {
        let me = std::thread::current().id();
        let should_release = {
            let mut depths = self.depth.write().expect("lock depth map poisoned");
            match depths.get_mut(&me) {
                Some(d) if *d > 1 => {
                    *d -= 1;
                    false
                }
                Some(_) => {
                    depths.remove(&me);
                    true
                }
                None => panic!("ReleaseLock called by a thread that does not hold the global lock"),
            }
        };
        if should_release {
            let mut holder = self.holder.lock().expect("global lock mutex poisoned");
            *holder = None;
            self.cv.notify_one();
        }
    }

    /// `MaybeTakeLock`: non-blocking attempt, used around opportunistic
    /// fast paths that can fall back to the slow, blocking `take`.
    pub fn maybe_take(&self) -> bool {
        let me = std::thread::current().id();
        if self.holding() {
            *self.depth.write().expect("lock depth map poisoned").get_mut(&me).unwrap() += 1;
            return true;
        }
        let mut holder = match self.holder.try_lock() {
            Ok(h) => h,
            Err(_) => return false,
        };
        if holder.is_some() {
            return false;
        }
        *holder = Some(me);
        self.depth.write().expect("lock depth map poisoned").insert(me, 1);
        true
    }

    /// `HoldingLock`: does the current thread hold the lock (at any
    /// reentrancy depth)?
    pub fn holding(&self) -> bool {
        let me = std::thread::current().id();
        self.depth.read().expect("lock depth map poisoned").get(&me).is_some_and(|&d| d > 0)
    }

    /// Releases the lock for the duration of `f`, re-taking it afterward
    /// regardless of whether `f` panics. Matches the suspension points
    /// named in §5: blocking I/O, condvar/barrier waits, FFI calls.
    pub fn release_around<R>(&self, f: impl FnOnce() -> R) -> R {
        self.release();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(f));
        self.take();
        match result {
            Ok(r) => r,
            Err(payload) => std::panic::resume_unwind(payload),
        }
    }
}

static GLOBAL_LOCK: OnceLock<GlobalLock> = OnceLock::new();

pub fn global_lock() -> &'static GlobalLock {
    GLOBAL_LOCK.get_or_init(GlobalLock::new)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn thread_registry_register_unregister_round_trip() {
        let reg = ThreadRegistry::new(4);
        let id = reg.register().unwrap();
        assert_eq!(reg.active().count(), 1);
        assert!(reg.unregister(id));
        assert_eq!(reg.active().count(), 0);
    }

    #[test]
    fn registering_past_an_occupied_slot_does_not_touch_its_spawn_time() {
        let reg = ThreadRegistry::new(4);
        let first = reg.register().unwrap();
        let before: Vec<(u64, u64)> = reg.active().collect();
        let first_spawn_time = before.iter().find(|(id, _)| *id == first).unwrap().1;

        std::thread::sleep(std::time::Duration::from_secs(2));
        reg.register().unwrap();

        let after: Vec<(u64, u64)> = reg.active().collect();
        let first_spawn_time_after = after.iter().find(|(id, _)| *id == first).unwrap().1;
        assert_eq!(first_spawn_time, first_spawn_time_after);
    }

    #[test]
    fn thread_registry_overflows_past_capacity() {
        let reg = ThreadRegistry::new(1);
        reg.register().unwrap();
        assert!(reg.register().is_none());
        assert_eq!(reg.overflow_count.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn vm_thread_round_trips_a_message_and_goes_dead_on_exit() {
        use crate::queue::Message;
        let handle = VmThread::spawn("vm-thread-test", |mailbox| {
            mailbox.send(Message::Result(loom_core::Value::int(7)));
        })
        .unwrap();
        let Message::Result(v) = handle.mailbox.recv() else { panic!("expected a Result message") };
        assert_eq!(v.as_int(), Some(7));
        // give the spawned thread a moment to flip `alive` and unregister.
        for _ in 0..100 {
            if !handle.is_alive() {
                break;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        assert!(!handle.is_alive());
    }

    #[test]
    fn global_lock_is_reentrant_on_same_thread() {
        let lock = GlobalLock::new();
        lock.take();
        lock.take();
        assert!(lock.holding());
        lock.release();
        assert!(lock.holding());
        lock.release();
        assert!(!lock.holding());
    }

    #[test]
    #[should_panic(expected = "does not hold")]
    fn release_without_take_panics() {
        let lock = GlobalLock::new();
        lock.release();
    }

    #[test]
    fn barrier_releases_all_waiters() {
        use std::sync::Arc;
        let barrier = Arc::new(TyBarrier::new(2));
        let b2 = barrier.clone();
        let handle = std::thread::spawn(move || b2.wait());
        let leader_here = barrier.wait();
        let leader_there = handle.join().unwrap();
        assert!(leader_here != leader_there);
    }

    #[test]
    fn spinlock_mutates_under_lock() {
        let lock = TySpinLock::new(0);
        *lock.lock() += 1;
        assert_eq!(*lock.lock(), 1);
    }
}
