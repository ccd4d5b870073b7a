/// Entity state persistence
///
/// Activations load their last persisted state when they are created and
/// write it back whenever an operation changes it. Two stores exist: an
/// in-memory map for tests and ephemeral runtimes, and a journal-backed
/// store that survives process restart.

use crate::journal::{Journal, COMPACT_MIN_RECORDS};
use crate::{EntityId, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use tracing::{debug, info, warn};

/// Storage for serialized entity state, keyed by entity id
pub trait StateStore: Send + Sync {
    /// Load the last saved state of an entity
    fn load(&self, id: &EntityId) -> Result<Option<Vec<u8>>>;

    /// Save the state of an entity, replacing any previous state
    fn save(&self, id: &EntityId, state: &[u8]) -> Result<()>;

    /// Number of entities with saved state
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// In-memory state store. All state is lost when the store is dropped.
#[derive(Default)]
pub struct MemoryStateStore {
    states: Mutex<HashMap<EntityId, Vec<u8>>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StateStore for MemoryStateStore {
    fn load(&self, id: &EntityId) -> Result<Option<Vec<u8>>> {
        Ok(self.states.lock().get(id).cloned())
    }

    fn save(&self, id: &EntityId, state: &[u8]) -> Result<()> {
        self.states.lock().insert(id.clone(), state.to_vec());
        Ok(())
    }

    fn len(&self) -> usize {
        self.states.lock().len()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StateRecord {
    id: EntityId,
    state: Vec<u8>,
}

/// Journal-backed state store
///
/// Every save appends a full snapshot; the latest snapshot per entity wins
/// on replay. The journal is compacted to one record per entity on open,
/// and again whenever superseded snapshots outnumber live ones.
pub struct JournalStateStore {
    journal: Journal<StateRecord>,
    states: Mutex<HashMap<EntityId, Vec<u8>>>,
    compact_at: usize,
}

impl JournalStateStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let journal: Journal<StateRecord> = Journal::open_or_create(path)?;

        let mut states = HashMap::new();
        let records = journal.read_all()?;
        let replayed = records.len();
        for (_, record) in records {
            states.insert(record.id, record.state);
        }

        if states.len() < replayed {
            journal.rewrite(&snapshot_records(&states))?;
        }

        info!(
            "Opened state journal {:?}: {} records, {} entities",
            journal.path(),
            replayed,
            states.len()
        );

        Ok(Self {
            journal,
            states: Mutex::new(states),
            compact_at: COMPACT_MIN_RECORDS,
        })
    }
}

fn snapshot_records(states: &HashMap<EntityId, Vec<u8>>) -> Vec<StateRecord> {
    states
        .iter()
        .map(|(id, state)| StateRecord {
            id: id.clone(),
            state: state.clone(),
        })
        .collect()
}

impl StateStore for JournalStateStore {
    fn load(&self, id: &EntityId) -> Result<Option<Vec<u8>>> {
        Ok(self.states.lock().get(id).cloned())
    }

    fn save(&self, id: &EntityId, state: &[u8]) -> Result<()> {
        // Hold the index lock across the write so the journal order matches
        // the in-memory order for a given entity
        let mut states = self.states.lock();
        self.journal.write(StateRecord {
            id: id.clone(),
            state: state.to_vec(),
        })?;
        states.insert(id.clone(), state.to_vec());

        if self.journal.needs_compaction(states.len(), self.compact_at) {
            // The save above is durable either way
            match self.journal.rewrite(&snapshot_records(&states)) {
                Ok(()) => debug!("Compacted state journal to {} entities", states.len()),
                Err(e) => warn!("State journal compaction failed: {}", e),
            }
        }
        Ok(())
    }

    fn len(&self) -> usize {
        self.states.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::EntityKind;
    use tempfile::TempDir;

    fn id(key: &str) -> EntityId {
        EntityId::new(EntityKind::ShortUrl, key)
    }

    #[test]
    fn test_memory_store_roundtrip() {
        let store = MemoryStateStore::new();
        assert!(store.load(&id("a")).unwrap().is_none());

        store.save(&id("a"), b"one").unwrap();
        store.save(&id("a"), b"two").unwrap();

        assert_eq!(store.load(&id("a")).unwrap(), Some(b"two".to_vec()));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_journal_store_survives_reopen() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("state.log");

        {
            let store = JournalStateStore::open(&path).unwrap();
            store.save(&id("a"), b"one").unwrap();
            store.save(&id("b"), b"bee").unwrap();
            store.save(&id("a"), b"two").unwrap();
        }

        let store = JournalStateStore::open(&path).unwrap();
        assert_eq!(store.load(&id("a")).unwrap(), Some(b"two".to_vec()));
        assert_eq!(store.load(&id("b")).unwrap(), Some(b"bee".to_vec()));
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_journal_store_compacts_on_open() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("state.log");

        {
            let store = JournalStateStore::open(&path).unwrap();
            for i in 0..20u8 {
                store.save(&id("counter"), &[i]).unwrap();
            }
        }

        let store = JournalStateStore::open(&path).unwrap();
        assert_eq!(store.journal.read_all().unwrap().len(), 1);
        assert_eq!(store.load(&id("counter")).unwrap(), Some(vec![19]));
    }

    #[test]
    fn test_journal_store_compacts_while_running() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("state.log");

        let mut store = JournalStateStore::open(&path).unwrap();
        store.compact_at = 16;
        for i in 0..100u8 {
            store.save(&id("counter"), &[i]).unwrap();
            store.save(&id("other"), &[i]).unwrap();
        }

        assert!(store.journal.record_count() < 16);
        drop(store);

        let store = JournalStateStore::open(&path).unwrap();
        assert_eq!(store.load(&id("counter")).unwrap(), Some(vec![99]));
        assert_eq!(store.load(&id("other")).unwrap(), Some(vec![99]));
    }
}
