/// Durable reminder records
///
/// A reminder is armed only once its record is in the store, so it
/// survives deactivation of its owner and, with the journal store, a
/// process restart. Records are removed after a successful delivery or an
/// explicit cancel.

use crate::journal::{Journal, COMPACT_MIN_RECORDS};
use crate::{EntityId, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{debug, info, warn};

/// A durable delayed callback owned by an entity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reminder {
    pub owner: EntityId,
    pub name: String,
    /// Wall-clock due time, milliseconds since the unix epoch
    pub due_at_ms: u64,
}

impl Reminder {
    pub fn new(owner: EntityId, name: impl Into<String>, due_at_ms: u64) -> Self {
        Self {
            owner,
            name: name.into(),
            due_at_ms,
        }
    }

    pub fn slot(&self) -> (EntityId, String) {
        (self.owner.clone(), self.name.clone())
    }
}

/// Storage for armed reminders. One reminder per (owner, name).
pub trait ReminderStore: Send + Sync {
    /// Insert or replace the reminder for `(owner, name)`
    fn upsert(&self, reminder: &Reminder) -> Result<()>;

    /// Remove the reminder for `(owner, name)`. Returns false if none was armed.
    fn remove(&self, owner: &EntityId, name: &str) -> Result<bool>;

    /// All armed reminders
    fn load_all(&self) -> Result<Vec<Reminder>>;
}

/// In-memory reminder store
#[derive(Default)]
pub struct MemoryReminderStore {
    reminders: Mutex<BTreeMap<(EntityId, String), Reminder>>,
}

impl MemoryReminderStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ReminderStore for MemoryReminderStore {
    fn upsert(&self, reminder: &Reminder) -> Result<()> {
        self.reminders.lock().insert(reminder.slot(), reminder.clone());
        Ok(())
    }

    fn remove(&self, owner: &EntityId, name: &str) -> Result<bool> {
        Ok(self
            .reminders
            .lock()
            .remove(&(owner.clone(), name.to_string()))
            .is_some())
    }

    fn load_all(&self) -> Result<Vec<Reminder>> {
        Ok(self.reminders.lock().values().cloned().collect())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
enum ReminderRecord {
    Upsert(Reminder),
    Remove { owner: EntityId, name: String },
}

/// Journal-backed reminder store, compacted to the armed set on open and
/// whenever superseded records outnumber armed ones
pub struct JournalReminderStore {
    journal: Journal<ReminderRecord>,
    reminders: Mutex<BTreeMap<(EntityId, String), Reminder>>,
    compact_at: usize,
}

impl JournalReminderStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let journal: Journal<ReminderRecord> = Journal::open_or_create(path)?;

        let mut reminders = BTreeMap::new();
        let records = journal.read_all()?;
        let replayed = records.len();
        for (_, record) in records {
            match record {
                ReminderRecord::Upsert(reminder) => {
                    reminders.insert(reminder.slot(), reminder);
                }
                ReminderRecord::Remove { owner, name } => {
                    reminders.remove(&(owner, name));
                }
            }
        }

        if reminders.len() < replayed {
            journal.rewrite(&armed_records(&reminders))?;
        }

        info!(
            "Opened reminder journal {:?}: {} records, {} armed",
            journal.path(),
            replayed,
            reminders.len()
        );

        Ok(Self {
            journal,
            reminders: Mutex::new(reminders),
            compact_at: COMPACT_MIN_RECORDS,
        })
    }

    fn maybe_compact(&self, reminders: &BTreeMap<(EntityId, String), Reminder>) {
        if !self.journal.needs_compaction(reminders.len(), self.compact_at) {
            return;
        }
        match self.journal.rewrite(&armed_records(reminders)) {
            Ok(()) => debug!("Compacted reminder journal to {} reminders", reminders.len()),
            Err(e) => warn!("Reminder journal compaction failed: {}", e),
        }
    }
}

fn armed_records(reminders: &BTreeMap<(EntityId, String), Reminder>) -> Vec<ReminderRecord> {
    reminders.values().cloned().map(ReminderRecord::Upsert).collect()
}

impl ReminderStore for JournalReminderStore {
    fn upsert(&self, reminder: &Reminder) -> Result<()> {
        let mut reminders = self.reminders.lock();
        self.journal.write(ReminderRecord::Upsert(reminder.clone()))?;
        reminders.insert(reminder.slot(), reminder.clone());
        self.maybe_compact(&reminders);
        Ok(())
    }

    fn remove(&self, owner: &EntityId, name: &str) -> Result<bool> {
        let mut reminders = self.reminders.lock();
        let slot = (owner.clone(), name.to_string());
        if !reminders.contains_key(&slot) {
            return Ok(false);
        }
        self.journal.write(ReminderRecord::Remove {
            owner: owner.clone(),
            name: name.to_string(),
        })?;
        reminders.remove(&slot);
        self.maybe_compact(&reminders);
        Ok(true)
    }

    fn load_all(&self) -> Result<Vec<Reminder>> {
        Ok(self.reminders.lock().values().cloned().collect())
    }
}
