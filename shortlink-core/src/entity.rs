/// Entity contract and the per-operation context
///
/// An operation runs against a working copy of the entity. Everything it
/// asks the runtime to do (one-way messages, timers, reminder changes,
/// deactivation) is recorded in the `EntityContext` and applied only after
/// the new state has been persisted. An operation that returns `Err` leaves
/// no trace.

use crate::config::RuntimeConfig;
use crate::directory::Directory;
use crate::{ActivationId, EntityId, EntityKey, EntityKind};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::cell::RefCell;
use std::time::Duration;

/// An addressable unit of state hosted by a `Directory`
pub trait Entity: Clone + Send + 'static {
    /// Persisted form of the entity
    type State: Serialize + DeserializeOwned;

    /// Namespace this entity's keys live in
    const KIND: EntityKind;

    /// Current state to persist
    fn snapshot(&self) -> Self::State;

    /// Handle a due reminder. May run on a freshly activated instance.
    fn receive_reminder(&mut self, ctx: &EntityContext<'_, Self>, name: &str) -> crate::Result<()>;
}

/// Callback run on the activation that armed a timer
pub type EntityTimer<E> =
    Box<dyn FnOnce(&mut E, &EntityContext<'_, E>) -> crate::Result<()> + Send + 'static>;

pub(crate) enum Effect<E: Entity> {
    Send {
        route: String,
        job: crate::dispatcher::Job,
    },
    Timer {
        delay: Duration,
        callback: EntityTimer<E>,
    },
    RegisterReminder {
        name: String,
        delay: Duration,
    },
    UnregisterReminder {
        name: String,
    },
    Deactivate,
}

/// Handle given to an entity operation
pub struct EntityContext<'a, E: Entity> {
    id: &'a EntityId,
    activation: ActivationId,
    directory: &'a Directory<E>,
    effects: RefCell<Vec<Effect<E>>>,
}

impl<'a, E: Entity> EntityContext<'a, E> {
    pub(crate) fn new(id: &'a EntityId, activation: ActivationId, directory: &'a Directory<E>) -> Self {
        Self {
            id,
            activation,
            directory,
            effects: RefCell::new(Vec::new()),
        }
    }

    pub fn id(&self) -> &EntityId {
        self.id
    }

    pub fn key(&self) -> &EntityKey {
        &self.id.key
    }

    pub fn activation_id(&self) -> ActivationId {
        self.activation
    }

    pub fn config(&self) -> &RuntimeConfig {
        self.directory.runtime().config()
    }

    /// Fire-and-forget `op` to entity `key` of `target` once this operation commits.
    /// Retried on transient faults; the sender never sees the outcome.
    pub fn tell<T, F>(&self, target: &Directory<T>, key: impl Into<EntityKey>, op: F)
    where
        T: Entity,
        F: Fn(&mut T, &EntityContext<'_, T>) -> crate::Result<()> + Send + 'static,
    {
        let key = key.into();
        let route = EntityId::new(T::KIND, key.clone()).route_key();
        let target = target.clone();
        self.effects.borrow_mut().push(Effect::Send {
            route,
            job: Box::new(move || target.deliver_one_way(&key, &op)),
        });
    }

    /// Run `callback` on this activation after `delay`. Dropped if the
    /// activation is gone by then.
    pub fn register_timer<F>(&self, delay: Duration, callback: F)
    where
        F: FnOnce(&mut E, &EntityContext<'_, E>) -> crate::Result<()> + Send + 'static,
    {
        self.effects.borrow_mut().push(Effect::Timer {
            delay,
            callback: Box::new(callback),
        });
    }

    /// Durably arm reminder `name` to fire after `delay`, replacing any
    /// reminder of the same name
    pub fn register_reminder(&self, name: impl Into<String>, delay: Duration) {
        self.effects.borrow_mut().push(Effect::RegisterReminder {
            name: name.into(),
            delay,
        });
    }

    pub fn unregister_reminder(&self, name: impl Into<String>) {
        self.effects
            .borrow_mut()
            .push(Effect::UnregisterReminder { name: name.into() });
    }

    /// Deactivate this activation once the operation commits
    pub fn deactivate_on_idle(&self) {
        self.effects.borrow_mut().push(Effect::Deactivate);
    }

    pub(crate) fn into_effects(self) -> Vec<Effect<E>> {
        self.effects.into_inner()
    }
}
