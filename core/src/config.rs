//! Worker configuration (ambient, §4.L). Loaded from environment variables,
//! with `dotenv` optionally sourcing a `.env` file, matching the reference
//! workspace's `KORADAR_*`-prefixed convention.

use std::env;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Bound on retry attempts for a disassembly/extern lookup.
    pub lookup_retry_attempts: u32,
    /// Inter-attempt sleep while an address is not yet known.
    pub address_not_found_sleep: Duration,
    /// Minimum period between deferred-work resolution passes.
    pub deferred_work_period: Duration,
    /// Poll granularity while a save is in progress.
    pub save_pause_poll: Duration,
    /// Per-node bound on buffered argument lists.
    pub arg_storage_capacity: usize,
    /// Passes to run when draining deferred work at shutdown.
    pub shutdown_drain_passes: u32,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            lookup_retry_attempts: 10,
            address_not_found_sleep: Duration::from_millis(60),
            deferred_work_period: Duration::from_millis(500),
            save_pause_poll: Duration::from_millis(20),
            arg_storage_capacity: 32,
            shutdown_drain_passes: 10,
        }
    }
}

impl WorkerConfig {
    /// Loads overrides from the environment, sourcing `.env` first if
    /// present. Unset variables fall back to the constants named in the
    /// component designs (§4.C/§5/§8).
    pub fn from_env() -> Self {
        dotenv::dotenv().ok();
        let defaults = Self::default();

        Self {
            lookup_retry_attempts: env_u32("TRACEGRAPH_LOOKUP_RETRY_ATTEMPTS", defaults.lookup_retry_attempts),
            address_not_found_sleep: env_millis(
                "TRACEGRAPH_ADDRESS_NOT_FOUND_SLEEP_MS",
                defaults.address_not_found_sleep,
            ),
            deferred_work_period: env_millis(
                "TRACEGRAPH_DEFERRED_WORK_PERIOD_MS",
                defaults.deferred_work_period,
            ),
            save_pause_poll: env_millis("TRACEGRAPH_SAVE_PAUSE_POLL_MS", defaults.save_pause_poll),
            arg_storage_capacity: env_u32(
                "TRACEGRAPH_ARG_STORAGE_CAPACITY",
                defaults.arg_storage_capacity as u32,
            ) as usize,
            shutdown_drain_passes: env_u32(
                "TRACEGRAPH_SHUTDOWN_DRAIN_PASSES",
                defaults.shutdown_drain_passes,
            ),
        }
    }
}

fn env_u32(key: &str, default: u32) -> u32 {
    env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_millis(key: &str, default: Duration) -> Duration {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .map(Duration::from_millis)
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec_constants() {
        let config = WorkerConfig::default();
        assert_eq!(config.address_not_found_sleep, Duration::from_millis(60));
        assert!(config.deferred_work_period >= Duration::from_millis(500));
        assert_eq!(config.save_pause_poll, Duration::from_millis(20));
    }
}
