use crate::retry::RetryPolicy;
use std::path::PathBuf;
use std::time::Duration;

/// Where entity state and reminders are kept
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Storage {
    /// In-memory stores; nothing survives the runtime
    Memory,
    /// Journals under the given directory (`state.log`, `reminders.log`)
    Disk(PathBuf),
}

/// Runtime configuration for activation, scheduling and delivery
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Backing storage for entity state and reminders
    pub storage: Storage,

    /// Number of dispatcher worker threads delivering one-way messages
    pub dispatcher_workers: usize,

    /// Activations unused for this long are deactivated by the collector
    pub idle_timeout: Duration,

    /// How often the collector looks for idle activations
    pub collection_interval: Duration,

    /// How long an expired entity stays active before it is deactivated
    pub expired_linger: Duration,

    /// Backoff for failed reminder deliveries (retried forever, capped at max backoff)
    pub reminder_retry: RetryPolicy,

    /// Backoff for failed one-way message deliveries
    pub delivery_retry: RetryPolicy,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            storage: Storage::Memory,
            dispatcher_workers: 4,
            idle_timeout: Duration::from_secs(300),
            collection_interval: Duration::from_secs(30),
            expired_linger: Duration::from_secs(1),
            reminder_retry: RetryPolicy::standard(),
            delivery_retry: RetryPolicy::fast(),
        }
    }
}

impl RuntimeConfig {
    /// Create a new configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Keep state and reminders in journals under `dir`
    pub fn with_disk_storage(mut self, dir: impl Into<PathBuf>) -> Self {
        self.storage = Storage::Disk(dir.into());
        self
    }

    pub fn with_memory_storage(mut self) -> Self {
        self.storage = Storage::Memory;
        self
    }

    pub fn with_dispatcher_workers(mut self, workers: usize) -> Self {
        self.dispatcher_workers = workers;
        self
    }

    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    pub fn with_collection_interval(mut self, interval: Duration) -> Self {
        self.collection_interval = interval;
        self
    }

    pub fn with_expired_linger(mut self, linger: Duration) -> Self {
        self.expired_linger = linger;
        self
    }

    pub fn with_reminder_retry(mut self, policy: RetryPolicy) -> Self {
        self.reminder_retry = policy;
        self
    }

    pub fn with_delivery_retry(mut self, policy: RetryPolicy) -> Self {
        self.delivery_retry = policy;
        self
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), String> {
        if self.dispatcher_workers == 0 {
            return Err("dispatcher_workers must be greater than 0".to_string());
        }

        if self.idle_timeout.is_zero() {
            return Err("idle_timeout must be greater than 0".to_string());
        }

        if self.collection_interval.is_zero() {
            return Err("collection_interval must be greater than 0".to_string());
        }

        if self.reminder_retry.max_backoff.is_zero() {
            return Err("reminder_retry.max_backoff must be greater than 0".to_string());
        }

        if let Storage::Disk(dir) = &self.storage {
            if dir.as_os_str().is_empty() {
                return Err("disk storage directory must not be empty".to_string());
            }
        }

        Ok(())
    }
}
