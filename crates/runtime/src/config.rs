//! Runtime configuration read from environment variables.
//!
//! Every knob is read once behind a `OnceLock` and cached, matching the
//! teacher crate's `SEQ_STACK_SIZE`/`SEQ_STRAND_REGISTRY_SIZE` env-var
//! pattern (see `scheduler.rs`'s `parse_stack_size`) generalized into one
//! place instead of scattered per-module parsing.

use std::sync::OnceLock;

/// Default coroutine stack size: 1MB.
const DEFAULT_STACK_SIZE: usize = 0x100000;
/// Default soft GC threshold: 8MB of live allocation before scheduling a sweep.
const DEFAULT_GC_THRESHOLD: usize = 8 * 1024 * 1024;
/// Default strand/thread registry capacity for diagnostics.
const DEFAULT_REGISTRY_SIZE: usize = 1024;

#[derive(Debug, Clone, Copy)]
pub struct Config {
    pub stack_size: usize,
    pub gc_threshold: usize,
    pub watchdog_secs: u64,
    pub strand_registry_size: usize,
}

impl Config {
    fn from_env() -> Self {
        Self {
            stack_size: parse_env_usize("LOOM_STACK_SIZE", DEFAULT_STACK_SIZE),
            gc_threshold: parse_env_usize("LOOM_GC_THRESHOLD", DEFAULT_GC_THRESHOLD),
            watchdog_secs: parse_env_u64("LOOM_WATCHDOG_SECS", 0),
            strand_registry_size: parse_env_usize("LOOM_STRAND_REGISTRY_SIZE", DEFAULT_REGISTRY_SIZE),
        }
    }
}

fn parse_env_usize(name: &str, default: usize) -> usize {
    match std::env::var(name) {
        Ok(val) => match val.parse::<usize>() {
            Ok(0) => {
                eprintln!("warning: {name}=0 is invalid, using default {default}");
                default
            }
            Ok(size) => size,
            Err(_) => {
                eprintln!("warning: {name}='{val}' is not a valid number, using default {default}");
                default
            }
        },
        Err(_) => default,
    }
}

fn parse_env_u64(name: &str, default: u64) -> u64 {
    std::env::var(name).ok().and_then(|s| s.parse().ok()).unwrap_or(default)
}

static CONFIG: OnceLock<Config> = OnceLock::new();

/// The process-wide configuration, read from the environment on first use.
pub fn config() -> &'static Config {
    CONFIG.get_or_init(Config::from_env)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_env_usize_falls_back_on_zero() {
        assert_eq!(parse_env_usize("LOOM_TEST_DOES_NOT_EXIST_XYZ", 42), 42);
    }

    #[test]
    fn config_is_stable_across_calls() {
        let a = config() as *const Config;
        let b = config() as *const Config;
        assert_eq!(a, b);
    }
}
