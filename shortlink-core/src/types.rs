use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Logical Sequence Number - monotonic journal record order
pub type Lsn = u64;

/// Identifies one in-memory incarnation of an entity
pub type ActivationId = u64;

/// The entity kinds hosted by the runtime
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EntityKind {
    /// A shortened route segment and its target URL
    ShortUrl,
    /// The application-wide statistics aggregator
    Statistics,
    /// A per-domain statistics aggregator, keyed by hostname
    Domain,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::ShortUrl => "short_url",
            EntityKind::Statistics => "statistics",
            EntityKind::Domain => "domain",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Opaque key selecting an entity within its kind
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityKey(String);

impl EntityKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for EntityKey {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for EntityKey {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Stable address of an entity: its kind plus its key
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityId {
    pub kind: EntityKind,
    pub key: EntityKey,
}

impl EntityId {
    pub fn new(kind: EntityKind, key: impl Into<EntityKey>) -> Self {
        Self {
            kind,
            key: key.into(),
        }
    }

    /// Stable string form, used for routing and logging
    pub fn route_key(&self) -> String {
        format!("{}/{}", self.kind, self.key)
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.kind, self.key)
    }
}

/// Milliseconds since the unix epoch
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Remaining time until a wall-clock deadline, zero if already past
pub fn until_millis(deadline_ms: u64) -> Duration {
    Duration::from_millis(deadline_ms.saturating_sub(now_millis()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entity_id_display() {
        let id = EntityId::new(EntityKind::Domain, "capitalecultura2023.it");
        assert_eq!(id.to_string(), "domain/capitalecultura2023.it");
        assert_eq!(id.route_key(), id.to_string());
    }

    #[test]
    fn test_kinds_keep_keys_apart() {
        let global = EntityId::new(EntityKind::Statistics, "global");
        let domain = EntityId::new(EntityKind::Domain, "global");
        assert_ne!(global, domain);
    }

    #[test]
    fn test_until_millis_saturates() {
        assert_eq!(until_millis(0), Duration::ZERO);
        assert!(until_millis(now_millis() + 10_000) > Duration::from_secs(5));
    }
}
