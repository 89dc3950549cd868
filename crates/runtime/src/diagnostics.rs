//! Runtime diagnostics for production debugging (§6.7).
//!
//! Provides a SIGQUIT (kill -3) handler that dumps runtime statistics to
//! stderr, similar to a JVM thread dump. Reports this workspace's own
//! counters (`thread::thread_registry()`, queue depths, GC stats)
//! instead of the strand/channel counters a sibling runtime tracks.
//!
//! ## Usage
//!
//! Send SIGQUIT to a running process:
//! ```bash
//! kill -3 <pid>
//! ```
//!
//! The process dumps diagnostics to stderr and continues running.

use crate::gc::GCStats;
use crate::thread::thread_registry;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, Once, OnceLock};

static SIGNAL_HANDLER_INIT: Once = Once::new();

/// `gc::AllocList` is owned per-interpreter, so there is no single
/// global collector to read from directly; an embedder registers a
/// stats callback here (typically `AllocList::stats`) to have it
/// included in future dumps.
static GC_SOURCES: OnceLock<Mutex<Vec<Box<dyn Fn() -> GCStats + Send + Sync>>>> = OnceLock::new();

/// Total pending-message count across every mailbox an embedder wants
/// reflected in the dump, tracked as a plain counter since queues come
/// and go far more often than interpreters do.
static QUEUED_MESSAGES: AtomicUsize = AtomicUsize::new(0);

/// Registers a source of GC stats to be read on every future dump.
pub fn register_gc_source(source: impl Fn() -> GCStats + Send + Sync + 'static) {
    GC_SOURCES.get_or_init(|| Mutex::new(Vec::new())).lock().expect("gc source registry lock poisoned").push(Box::new(source));
}

/// Called by queue owners to keep the dump's `[Queues]` section
/// current: positive on send, negative on successful recv.
pub fn adjust_queued_messages(delta: i64) {
    if delta >= 0 {
        QUEUED_MESSAGES.fetch_add(delta as usize, Ordering::Relaxed);
    } else {
        QUEUED_MESSAGES.fetch_sub((-delta) as usize, Ordering::Relaxed);
    }
}

/// Install the SIGQUIT signal handler for diagnostics.
///
/// Safe to call multiple times (idempotent).
pub fn install_signal_handler() {
    SIGNAL_HANDLER_INIT.call_once(|| {
        #[cfg(unix)]
        {
            unsafe {
                let _ = signal_hook::low_level::register(signal_hook::consts::SIGQUIT, || {
                    dump_diagnostics();
                });
            }
        }

        #[cfg(not(unix))]
        {
            // signal handling not supported on non-Unix platforms; dump_diagnostics()
            // can still be called directly.
        }
    });
}

/// Dump runtime diagnostics to stderr.
///
/// Can be called directly from code or triggered via SIGQUIT. Never
/// panics: every field read is either an atomic or a lock taken with
/// `expect`, and an empty GC-source registry just yields no GC lines.
pub fn dump_diagnostics() {
    use std::io::Write;

    let mut out = std::io::stderr().lock();

    let _ = writeln!(out, "\n=== Loom Runtime Diagnostics ===");
    let _ = writeln!(out, "Timestamp: {:?}", std::time::SystemTime::now());

    let registry = thread_registry();
    let _ = writeln!(out, "\n[Threads]");
    let _ = writeln!(out, "  Active: {}/{}", registry.active().count(), registry.capacity());
    for (id, spawned) in registry.active() {
        let _ = writeln!(out, "    #{id} spawned at {spawned}");
    }

    let _ = writeln!(out, "\n[Queues]");
    let _ = writeln!(out, "  Pending messages: {}", QUEUED_MESSAGES.load(Ordering::Relaxed));

    let _ = writeln!(out, "\n[GC]");
    match GC_SOURCES.get() {
        Some(sources) => {
            let sources = sources.lock().expect("gc source registry lock poisoned");
            if sources.is_empty() {
                let _ = writeln!(out, "  (no interpreter registered)");
            }
            for (i, source) in sources.iter().enumerate() {
                let stats = source();
                let _ = writeln!(
                    out,
                    "  interpreter #{i}: {} live, {} bytes, {} sweeps, {} collected last sweep",
                    stats.allocations_live, stats.bytes_used, stats.sweeps_run, stats.last_sweep_collected
                );
            }
        }
        None => {
            let _ = writeln!(out, "  (no interpreter registered)");
        }
    }

    let _ = writeln!(out, "\n=== End Diagnostics ===\n");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dump_diagnostics_runs_without_a_registered_gc_source() {
        dump_diagnostics();
    }

    #[test]
    fn install_signal_handler_is_idempotent() {
        install_signal_handler();
        install_signal_handler();
        install_signal_handler();
    }

    #[test]
    fn queued_message_counter_tracks_deltas_without_panicking() {
        adjust_queued_messages(3);
        adjust_queued_messages(-1);
        dump_diagnostics();
    }

    #[test]
    fn registered_gc_source_is_reflected_in_a_dump() {
        register_gc_source(|| GCStats { allocations_live: 5, bytes_used: 100, sweeps_run: 1, last_sweep_collected: 2 });
        dump_diagnostics();
    }
}
