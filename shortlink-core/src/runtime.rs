/// The entity runtime: storage, dispatcher, scheduler and idle collector,
/// plus the registry of entity directories they serve.

use crate::background::Collector;
use crate::config::{RuntimeConfig, Storage};
use crate::directory::Directory;
use crate::dispatcher::Dispatcher;
use crate::entity::Entity;
use crate::reminder::{JournalReminderStore, MemoryReminderStore, Reminder, ReminderStore};
use crate::scheduler::{ReminderSink, Scheduler};
use crate::state::{JournalStateStore, MemoryStateStore, StateStore};
use crate::{EntityId, EntityKey, EntityKind, Error, Result};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::fs;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Journal holding entity state under a disk storage directory
pub const STATE_FILE: &str = "state.log";

/// Journal holding armed reminders under a disk storage directory
pub const REMINDER_FILE: &str = "reminders.log";

/// A directory as seen by the runtime's background machinery
pub trait EntityHost: Send + Sync {
    /// Activate `key` if needed and run its reminder handler
    fn deliver_reminder(&self, key: &EntityKey, name: &str) -> Result<()>;

    fn collect_idle(&self, idle_timeout: Duration) -> usize;

    /// False once the directory has been dropped
    fn is_alive(&self) -> bool;
}

/// Directories by entity kind
#[derive(Default)]
pub struct EntityRegistry {
    hosts: RwLock<HashMap<EntityKind, Box<dyn EntityHost>>>,
}

impl EntityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the directory for `kind`. A kind has at most one live directory.
    pub fn register(&self, kind: EntityKind, host: Box<dyn EntityHost>) -> Result<()> {
        let mut hosts = self.hosts.write();
        if hosts.get(&kind).is_some_and(|h| h.is_alive()) {
            return Err(Error::AlreadyExists(format!("a {} directory is already registered", kind)));
        }
        hosts.insert(kind, host);
        debug!("Registered {} directory", kind);
        Ok(())
    }

    pub fn kinds(&self) -> Vec<EntityKind> {
        let mut kinds: Vec<_> = self.hosts.read().keys().copied().collect();
        kinds.sort();
        kinds
    }

    /// Deactivate idle activations in every directory
    pub fn collect_idle(&self, idle_timeout: Duration) -> usize {
        self.hosts
            .read()
            .values()
            .map(|host| host.collect_idle(idle_timeout))
            .sum()
    }
}

impl ReminderSink for EntityRegistry {
    fn deliver(&self, reminder: &Reminder) -> Result<()> {
        let hosts = self.hosts.read();
        // Reminders restored at startup may arrive before their directory
        // registers; the error is retryable so the scheduler tries again
        let host = hosts.get(&reminder.owner.kind).ok_or_else(|| {
            Error::ActivationFailed(format!("no {} directory registered", reminder.owner.kind))
        })?;
        host.deliver_reminder(&reminder.owner.key, &reminder.name)
    }
}

struct RuntimeInner {
    config: RuntimeConfig,
    states: Arc<dyn StateStore>,
    dispatcher: Dispatcher,
    scheduler: Scheduler,
    registry: Arc<EntityRegistry>,
    collector: Mutex<Collector>,
}

/// Handle to a running runtime. Cheap to clone; every directory holds one.
#[derive(Clone)]
pub struct Runtime {
    inner: Arc<RuntimeInner>,
}

impl Runtime {
    /// Open storage and start the background threads. Reminders found in
    /// storage are re-armed immediately.
    pub fn open(config: RuntimeConfig) -> Result<Self> {
        config.validate().map_err(Error::InvalidArgument)?;

        let (states, reminders): (Arc<dyn StateStore>, Arc<dyn ReminderStore>) = match &config.storage {
            Storage::Memory => (
                Arc::new(MemoryStateStore::new()),
                Arc::new(MemoryReminderStore::new()),
            ),
            Storage::Disk(dir) => {
                fs::create_dir_all(dir)
                    .map_err(|e| Error::Io(e).with_context(&format!("creating {}", dir.display())))?;
                (
                    Arc::new(JournalStateStore::open(dir.join(STATE_FILE))?),
                    Arc::new(JournalReminderStore::open(dir.join(REMINDER_FILE))?),
                )
            }
        };

        let registry = Arc::new(EntityRegistry::new());
        let dispatcher = Dispatcher::start(config.dispatcher_workers);
        let scheduler = match Scheduler::start(
            reminders,
            dispatcher.clone(),
            Arc::clone(&registry) as Arc<dyn ReminderSink>,
            config.reminder_retry.clone(),
        ) {
            Ok(scheduler) => scheduler,
            Err(e) => {
                dispatcher.shutdown();
                return Err(e);
            }
        };

        let mut collector = Collector::new(config.collection_interval, config.idle_timeout);
        collector.start(Arc::clone(&registry));

        info!(
            "Runtime started ({:?}, {} dispatcher workers, {} entities stored)",
            config.storage,
            config.dispatcher_workers,
            states.len()
        );

        Ok(Self {
            inner: Arc::new(RuntimeInner {
                config,
                states,
                dispatcher,
                scheduler,
                registry,
                collector: Mutex::new(collector),
            }),
        })
    }

    /// Create the directory for entity type `E`. `activator` builds an
    /// entity from its persisted state, or from nothing on first use.
    pub fn directory<E, A>(&self, activator: A) -> Result<Directory<E>>
    where
        E: Entity,
        A: Fn(&EntityId, Option<E::State>) -> E + Send + Sync + 'static,
    {
        let directory = Directory::new(self.clone(), activator);
        self.inner.registry.register(E::KIND, directory.host())?;
        Ok(directory)
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.inner.config
    }

    pub fn state_store(&self) -> &Arc<dyn StateStore> {
        &self.inner.states
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.inner.dispatcher
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.inner.scheduler
    }

    pub fn registry(&self) -> &Arc<EntityRegistry> {
        &self.inner.registry
    }

    /// Block until every queued one-way message and due callback has run.
    /// Returns false if `timeout` elapsed first.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        self.inner.dispatcher.wait_idle(timeout)
    }

    /// Run an idle collection pass now
    pub fn collect_idle(&self) -> usize {
        self.inner.registry.collect_idle(self.inner.config.idle_timeout)
    }

    /// Stop the collector, the scheduler and the dispatcher, in that order.
    /// Queued one-way messages are drained first; state and armed reminders
    /// stay in storage.
    pub fn shutdown(&self) {
        self.inner.shutdown();
    }

    pub fn is_running(&self) -> bool {
        self.inner.dispatcher.is_running()
    }
}

impl RuntimeInner {
    fn shutdown(&self) {
        if !self.dispatcher.is_running() {
            return;
        }
        info!("Shutting down runtime");
        self.collector.lock().shutdown();
        self.scheduler.shutdown();
        self.dispatcher.shutdown();
    }
}

impl Drop for RuntimeInner {
    fn drop(&mut self) {
        self.shutdown();
    }
}
