/// Background idle collection
///
/// A worker thread that periodically deactivates activations unused for
/// longer than the idle timeout, across every registered directory.

use crate::runtime::EntityRegistry;
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Shutdown flag the worker sleeps on, so shutdown does not wait out an interval
struct Signal {
    stopped: Mutex<bool>,
    wakeup: Condvar,
}

/// Background worker for idle collection
pub struct Collector {
    /// Worker thread handle
    handle: Option<JoinHandle<()>>,

    signal: Arc<Signal>,

    /// How often to look for idle activations
    interval: Duration,

    /// Activations unused for this long are deactivated
    idle_timeout: Duration,
}

impl Collector {
    pub fn new(interval: Duration, idle_timeout: Duration) -> Self {
        Self {
            handle: None,
            signal: Arc::new(Signal {
                stopped: Mutex::new(false),
                wakeup: Condvar::new(),
            }),
            interval,
            idle_timeout,
        }
    }

    /// Start the collector thread over the directories in `registry`
    pub fn start(&mut self, registry: Arc<EntityRegistry>) {
        if self.handle.is_some() {
            warn!("Idle collector already running");
            return;
        }

        let signal = Arc::clone(&self.signal);
        let interval = self.interval;
        let idle_timeout = self.idle_timeout;

        info!(
            "Starting idle collector (interval {:?}, idle timeout {:?})",
            interval, idle_timeout
        );

        let spawned = thread::Builder::new()
            .name("shortlink-collector".to_string())
            .spawn(move || Self::worker_loop(signal, registry, interval, idle_timeout));

        match spawned {
            Ok(handle) => self.handle = Some(handle),
            Err(e) => warn!("Failed to spawn idle collector: {}", e),
        }
    }

    fn worker_loop(
        signal: Arc<Signal>,
        registry: Arc<EntityRegistry>,
        interval: Duration,
        idle_timeout: Duration,
    ) {
        debug!("Idle collector loop started");

        let mut stopped = signal.stopped.lock();
        while !*stopped {
            let deadline = Instant::now() + interval;
            if !signal.wakeup.wait_until(&mut stopped, deadline).timed_out() {
                continue;
            }

            // Directories take their own locks; don't hold ours meanwhile
            let collected = parking_lot::MutexGuard::unlocked(&mut stopped, || {
                registry.collect_idle(idle_timeout)
            });
            if collected > 0 {
                debug!("Idle collection pass deactivated {} activations", collected);
            }
        }

        info!("Idle collector loop exited");
    }

    /// Signal the worker thread to stop and wait for it to finish
    pub fn shutdown(&mut self) {
        {
            let mut stopped = self.signal.stopped.lock();
            *stopped = true;
            self.signal.wakeup.notify_all();
        }

        if let Some(handle) = self.handle.take() {
            debug!("Waiting for idle collector thread to exit");
            if handle.thread().id() != thread::current().id() {
                if let Err(e) = handle.join() {
                    warn!("Error joining idle collector thread: {:?}", e);
                }
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.handle.is_some() && !*self.signal.stopped.lock()
    }
}

impl Drop for Collector {
    fn drop(&mut self) {
        if self.is_running() {
            self.shutdown();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_collector_start_stop() {
        let mut collector = Collector::new(Duration::from_secs(3600), Duration::from_secs(60));
        assert!(!collector.is_running());

        collector.start(Arc::new(EntityRegistry::new()));
        assert!(collector.is_running());

        // Must not wait out the hour-long interval
        let started = Instant::now();
        collector.shutdown();
        assert!(!collector.is_running());
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_collector_shutdown_on_drop() {
        let mut collector = Collector::new(Duration::from_millis(10), Duration::from_secs(60));
        collector.start(Arc::new(EntityRegistry::new()));
        thread::sleep(Duration::from_millis(30));
        drop(collector);
    }
}
