//! Watchdog timer for detecting stuck threads (§6.7).
//!
//! Monitors thread registration time and triggers alerts when a thread
//! has been registered too long without unregistering. Piggybacks on
//! `thread::ThreadRegistry`, which already tracks spawn times for every
//! registered thread, so detection costs nothing on the hot path.
//!
//! ## Configuration (Environment Variables)
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `LOOM_WATCHDOG_SECS` | `0` (disabled) | Threshold in seconds for "stuck" |
//! | `LOOM_WATCHDOG_INTERVAL` | `5` | Check frequency in seconds |
//! | `LOOM_WATCHDOG_ACTION` | `warn` | Action: `warn` (dump diagnostics) or `exit` |

use crate::diagnostics::dump_diagnostics;
use crate::thread::thread_registry;
use std::sync::Once;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

static WATCHDOG_INIT: Once = Once::new();
static WATCHDOG_TRIGGERED_THREAD: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone)]
pub struct WatchdogConfig {
    pub threshold_secs: u64,
    pub interval_secs: u64,
    pub action: WatchdogAction,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchdogAction {
    Warn,
    Exit,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self { threshold_secs: 0, interval_secs: 5, action: WatchdogAction::Warn }
    }
}

impl WatchdogConfig {
    pub fn from_env() -> Self {
        let threshold_secs = crate::config::config().watchdog_secs;

        let interval_secs = std::env::var("LOOM_WATCHDOG_INTERVAL")
            .ok()
            .and_then(|s| s.parse().ok())
            .filter(|&v| v > 0)
            .unwrap_or(5);

        let action = std::env::var("LOOM_WATCHDOG_ACTION")
            .ok()
            .map(|s| match s.to_lowercase().as_str() {
                "exit" => WatchdogAction::Exit,
                _ => WatchdogAction::Warn,
            })
            .unwrap_or(WatchdogAction::Warn);

        Self { threshold_secs, interval_secs, action }
    }

    pub fn is_enabled(&self) -> bool {
        self.threshold_secs > 0
    }
}

/// Spawns a dedicated thread that periodically scans the thread
/// registry. Only starts if `LOOM_WATCHDOG_SECS` is a positive value.
/// Safe to call multiple times (idempotent via `Once`).
pub fn install_watchdog() {
    WATCHDOG_INIT.call_once(|| {
        let config = WatchdogConfig::from_env();

        if !config.is_enabled() {
            return;
        }

        eprintln!(
            "[watchdog] enabled: threshold={}s, interval={}s, action={:?}",
            config.threshold_secs, config.interval_secs, config.action
        );

        if let Err(e) = std::thread::Builder::new().name("loom-watchdog".to_string()).spawn(move || watchdog_loop(config)) {
            eprintln!("[watchdog] warning: failed to start watchdog thread: {e}");
        }
    });
}

fn watchdog_loop(config: WatchdogConfig) {
    let interval = Duration::from_secs(config.interval_secs);

    loop {
        std::thread::sleep(interval);

        if let Some((thread_id, running_secs)) = check_for_stuck_threads(config.threshold_secs) {
            handle_stuck_thread(thread_id, running_secs, &config);
        }
    }
}

/// Scans the thread registry for any thread exceeding the threshold,
/// returning the longest-running one. `None` if all are within
/// threshold or the system clock is unreadable.
fn check_for_stuck_threads(threshold_secs: u64) -> Option<(u64, u64)> {
    let now = SystemTime::now().duration_since(UNIX_EPOCH).ok().map(|d| d.as_secs())?;

    let registry = thread_registry();
    let mut worst: Option<(u64, u64)> = None;

    for (thread_id, spawn_time) in registry.active() {
        if spawn_time == 0 {
            continue;
        }

        let running_secs = now.saturating_sub(spawn_time);

        if running_secs > threshold_secs {
            match worst {
                None => worst = Some((thread_id, running_secs)),
                Some((_, prev)) if running_secs > prev => worst = Some((thread_id, running_secs)),
                _ => {}
            }
        }
    }

    worst
}

fn handle_stuck_thread(thread_id: u64, running_secs: u64, config: &WatchdogConfig) {
    let prev = WATCHDOG_TRIGGERED_THREAD.swap(thread_id, Ordering::Relaxed);
    let is_new = prev != thread_id;

    use std::io::Write;
    let mut stderr = std::io::stderr().lock();

    let _ = writeln!(stderr);
    let _ = writeln!(stderr, "WATCHDOG: thread #{thread_id} running for {running_secs}s (threshold: {}s)", config.threshold_secs);

    if prev == 0 || is_new {
        dump_diagnostics();
    }

    match config.action {
        WatchdogAction::Warn => {
            if prev != 0 && !is_new {
                let _ = writeln!(stderr, "    (thread still stuck, diagnostics suppressed)");
            }
        }
        WatchdogAction::Exit => {
            let _ = writeln!(stderr, "    exiting due to LOOM_WATCHDOG_ACTION=exit");
            std::process::exit(1);
        }
    }
}

#[cfg(test)]
pub fn reset_triggered() {
    WATCHDOG_TRIGGERED_THREAD.store(0, Ordering::Relaxed);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_defaults_to_disabled() {
        let config = WatchdogConfig::default();
        assert_eq!(config.threshold_secs, 0);
        assert_eq!(config.interval_secs, 5);
        assert_eq!(config.action, WatchdogAction::Warn);
        assert!(!config.is_enabled());
    }

    #[test]
    fn explicit_threshold_enables_it() {
        let config = WatchdogConfig { threshold_secs: 30, interval_secs: 10, action: WatchdogAction::Exit };
        assert!(config.is_enabled());
    }

    #[test]
    fn check_with_no_threads_registered_is_none_or_harmless() {
        reset_triggered();
        let result = check_for_stuck_threads(30);
        let _ = result;
    }

    #[test]
    fn a_thread_past_threshold_is_detected() {
        let registry = thread_registry();
        let id = registry.register().expect("registry has room");
        let found = check_for_stuck_threads(0);
        assert!(found.is_some());
        registry.unregister(id);
    }
}
