//! Environment-driven tunables for the worker runtime and periodic sweeps.
//!
//! Mirrors [`flow_db::config::DbConfig`]'s resolution style: a `FLOW_*`
//! environment variable, falling back to the compile-time default on parse
//! failure or absence.

use std::env;

use crate::sweep::SweepConfig;
use crate::worker::WorkerConfig;

fn env_u64(key: &str, default: u64) -> u64 {
    env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_i64(key: &str, default: i64) -> i64 {
    env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_usize(key: &str, default: usize) -> usize {
    env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

impl WorkerConfig {
    /// Build from the environment, falling back to [`WorkerConfig::default`]
    /// field-by-field.
    pub fn from_env() -> Self {
        let default = Self::default();
        Self {
            concurrency: env_usize("FLOW_WORKER_CONCURRENCY", default.concurrency),
            poll_interval_ms: env_u64("FLOW_WORKER_POLL_INTERVAL_MS", default.poll_interval_ms),
            batch_size: env_i64("FLOW_WORKER_BATCH_SIZE", default.batch_size),
            lock_timeout_ms: env_i64("FLOW_WORKER_LOCK_TIMEOUT_MS", default.lock_timeout_ms),
            drain_timeout_ms: env_u64("FLOW_WORKER_DRAIN_TIMEOUT_MS", default.drain_timeout_ms),
            stale_threshold_secs: env_i64("FLOW_WORKER_STALE_THRESHOLD_SECS", default.stale_threshold_secs),
            heartbeat_interval_ms: env_u64("FLOW_WORKER_HEARTBEAT_INTERVAL_MS", default.heartbeat_interval_ms),
            notifier_debounce_ms: env_u64("FLOW_WORKER_NOTIFIER_DEBOUNCE_MS", default.notifier_debounce_ms),
        }
    }
}

impl SweepConfig {
    pub fn from_env() -> Self {
        let default = Self::default();
        let retain_days = env_i64(
            "FLOW_RETENTION_DAYS",
            default.retain_completed_for.num_days(),
        );
        Self {
            timeout_check_interval_ms: env_u64(
                "FLOW_TIMEOUT_CHECK_INTERVAL_MS",
                default.timeout_check_interval_ms,
            ),
            orphan_check_interval_ms: env_u64(
                "FLOW_ORPHAN_CHECK_INTERVAL_MS",
                default.orphan_check_interval_ms,
            ),
            stale_worker_check_interval_ms: env_u64(
                "FLOW_STALE_WORKER_CHECK_INTERVAL_MS",
                default.stale_worker_check_interval_ms,
            ),
            stale_worker_threshold_secs: env_i64(
                "FLOW_STALE_WORKER_THRESHOLD_SECS",
                default.stale_worker_threshold_secs,
            ),
            retention_check_interval_ms: env_u64(
                "FLOW_RETENTION_CHECK_INTERVAL_MS",
                default.retention_check_interval_ms,
            ),
            retain_completed_for: chrono::Duration::days(retain_days),
        }
    }
}
