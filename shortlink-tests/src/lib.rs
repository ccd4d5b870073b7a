/// Test utilities and helpers for shortlink testing
///
/// Aggregator counters converge asynchronously, so tests poll for the
/// expected value instead of asserting right after the triggering call.

use anyhow::bail;
use shortlink_api::{Shortener, StatisticsScope, StatisticsSnapshot};
use shortlink_core::{RetryPolicy, RuntimeConfig};
use std::path::{Path, PathBuf};
use std::sync::Once;
use std::thread;
use std::time::{Duration, Instant};
use tempfile::TempDir;
use tracing_subscriber::EnvFilter;

/// How long tests wait for counters to converge
pub const CONVERGENCE_TIMEOUT: Duration = Duration::from_secs(5);

/// Runtime settings tuned for tests: short linger and quick reminder retries
pub fn test_config() -> RuntimeConfig {
    RuntimeConfig::new()
        .with_expired_linger(Duration::from_millis(50))
        .with_reminder_retry(RetryPolicy::new(
            0,
            Duration::from_millis(20),
            Duration::from_millis(200),
            2.0,
        ))
}

/// Install a tracing subscriber once per test binary. Honours `RUST_LOG`.
pub fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .with_thread_names(true)
            .try_init();
    });
}

/// Shortener wrapper that manages temporary directory lifecycle
pub struct TestShortener {
    pub shortener: Shortener,
    pub config: RuntimeConfig,
    path: Option<PathBuf>,
    _temp_dir: Option<TempDir>,
}

impl TestShortener {
    /// Shortener with disk storage in a fresh temporary directory
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let path = temp_dir.path().to_path_buf();
        let mut test = Self::with_config(test_config().with_disk_storage(&path));
        test.path = Some(path);
        test._temp_dir = Some(temp_dir);
        test
    }

    /// Shortener with in-memory storage
    pub fn in_memory() -> Self {
        Self::with_config(test_config())
    }

    pub fn with_config(config: RuntimeConfig) -> Self {
        init_tracing();
        let shortener = Shortener::open(config.clone()).expect("Failed to open shortener");
        Self {
            shortener,
            config,
            path: None,
            _temp_dir: None,
        }
    }

    /// Storage directory, if disk-backed
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Shut down and open again on the same storage (for testing persistence)
    pub fn reopen(self) -> Self {
        let Self {
            shortener,
            config,
            path,
            _temp_dir,
        } = self;
        shortener.shutdown();
        drop(shortener);

        let shortener = Shortener::open(config.clone()).expect("Failed to reopen shortener");
        Self {
            shortener,
            config,
            path,
            _temp_dir,
        }
    }
}

impl Default for TestShortener {
    fn default() -> Self {
        Self::new()
    }
}

/// Poll `condition` every 10ms until it holds or `timeout` elapses
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(Duration::from_millis(10));
    }
}

/// Wait until the counters of `scope` equal `expected`
pub fn wait_for_statistics(
    shortener: &Shortener,
    scope: &StatisticsScope,
    expected: StatisticsSnapshot,
) -> anyhow::Result<()> {
    let mut last = None;
    let converged = wait_until(CONVERGENCE_TIMEOUT, || {
        shortener.settle(Duration::from_millis(100));
        match shortener.statistics().snapshot(scope) {
            Ok(snapshot) => {
                last = Some(snapshot);
                snapshot == expected
            }
            Err(_) => false,
        }
    });
    if !converged {
        bail!("{:?} did not converge to {:?}, last seen {:?}", scope, expected, last);
    }
    Ok(())
}

/// Snapshot literal
pub fn counts(total: u64, active: u64) -> StatisticsSnapshot {
    StatisticsSnapshot { total, active }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shortener_helper() {
        let test = TestShortener::new();
        assert!(test.path().is_some());

        let segment = test.shortener.shorten("https://example.com/", false, 60).unwrap();
        assert_eq!(test.shortener.get_url(&segment).unwrap(), "https://example.com/");
        wait_for_statistics(&test.shortener, &StatisticsScope::Global, counts(1, 1)).unwrap();
    }

    #[test]
    fn test_reopen_keeps_storage() {
        let test = TestShortener::new();
        let segment = test.shortener.shorten("https://example.com/", false, 60).unwrap();
        let test = test.reopen();
        assert_eq!(test.shortener.get_url(&segment).unwrap(), "https://example.com/");
    }

    #[test]
    fn test_wait_until_times_out() {
        let started = Instant::now();
        assert!(!wait_until(Duration::from_millis(50), || false));
        assert!(started.elapsed() >= Duration::from_millis(50));
        assert!(wait_until(Duration::from_millis(50), || true));
    }
}
