/// Entity directory: maps keys of one kind to their live activation
///
/// The key map is split into stripes; a stripe lock is held only long
/// enough to find or insert the slot for a key. Activation and every
/// operation then run under that slot's own lock, which is the per-key
/// gate: at most one activation per key, one operation at a time per key,
/// and no contention between different keys.
///
/// Operations are transactional. They run on a clone of the entity; the
/// clone replaces the live entity only after its state is persisted, and
/// only then are the side effects recorded in the `EntityContext` applied.

use crate::entity::{Effect, Entity, EntityContext, EntityTimer};
use crate::reminder::Reminder;
use crate::retry::retry_with_policy;
use crate::runtime::{EntityHost, Runtime};
use crate::{now_millis, ActivationId, EntityId, EntityKey, EntityKind, Error, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::collections::hash_map::DefaultHasher;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

const NUM_STRIPES: usize = 64;

/// Builds an entity from its persisted state, or a fresh one if there is none
pub type Activator<E> = dyn Fn(&EntityId, Option<<E as Entity>::State>) -> E + Send + Sync;

struct Loaded<E> {
    entity: E,
    /// Last state bytes written to (or read from) the state store
    persisted: Vec<u8>,
}

struct Activation<E> {
    id: ActivationId,
    slot: Mutex<Option<Loaded<E>>>,
    retired: AtomicBool,
    last_used: Mutex<Instant>,
}

impl<E> Activation<E> {
    fn new(id: ActivationId) -> Self {
        Self {
            id,
            slot: Mutex::new(None),
            retired: AtomicBool::new(false),
            last_used: Mutex::new(Instant::now()),
        }
    }
}

/// Activation counters for one directory
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DirectoryStats {
    /// Activations currently held in memory
    pub active: usize,
    /// Activations ever created
    pub activations: u64,
    /// Activations ever retired (explicitly, after expiry, or for idleness)
    pub deactivations: u64,
}

struct DirectoryInner<E: Entity> {
    runtime: Runtime,
    stripes: Vec<Mutex<HashMap<EntityKey, Arc<Activation<E>>>>>,
    activator: Box<Activator<E>>,
    next_activation: AtomicU64,
    activations: AtomicU64,
    deactivations: AtomicU64,
}

/// Handle to the directory of one entity kind. Cheap to clone.
pub struct Directory<E: Entity> {
    inner: Arc<DirectoryInner<E>>,
}

impl<E: Entity> Clone for Directory<E> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<E: Entity> Directory<E> {
    pub(crate) fn new<A>(runtime: Runtime, activator: A) -> Self
    where
        A: Fn(&EntityId, Option<E::State>) -> E + Send + Sync + 'static,
    {
        let stripes = (0..NUM_STRIPES).map(|_| Mutex::new(HashMap::new())).collect();
        Self {
            inner: Arc::new(DirectoryInner {
                runtime,
                stripes,
                activator: Box::new(activator),
                next_activation: AtomicU64::new(1),
                activations: AtomicU64::new(0),
                deactivations: AtomicU64::new(0),
            }),
        }
    }

    pub(crate) fn host(&self) -> Box<dyn EntityHost> {
        Box::new(HostRef(Arc::downgrade(&self.inner)))
    }

    pub fn kind(&self) -> EntityKind {
        E::KIND
    }

    pub fn runtime(&self) -> &Runtime {
        &self.inner.runtime
    }

    /// Run `op` on the entity at `key`, activating it first if needed.
    ///
    /// Waits for any operation already running on the same key.
    pub fn call<R, F>(&self, key: impl Into<EntityKey>, op: F) -> Result<R>
    where
        F: FnOnce(&mut E, &EntityContext<'_, E>) -> Result<R>,
    {
        let id = EntityId::new(E::KIND, key.into());

        loop {
            let activation = self.slot(&id.key);
            let mut guard = activation.slot.lock();

            // Deactivated while we waited; the next slot is a fresh activation
            if activation.retired.load(Ordering::Acquire) {
                continue;
            }

            if guard.is_none() {
                *guard = Some(self.activate(&id)?);
            }
            let Some(loaded) = guard.as_mut() else {
                return Err(Error::ActivationFailed(format!("{} has no activation", id)));
            };

            let (value, deactivate) = self.execute(&id, &activation, loaded, op)?;
            if deactivate {
                self.retire(&id.key, &activation);
            }
            return Ok(value);
        }
    }

    /// Fire-and-forget `op` to `key`. Returns once the message is queued.
    pub fn tell<F>(&self, key: impl Into<EntityKey>, op: F) -> Result<()>
    where
        F: Fn(&mut E, &EntityContext<'_, E>) -> Result<()> + Send + 'static,
    {
        let key = key.into();
        let route = EntityId::new(E::KIND, key.clone()).route_key();
        let directory = self.clone();
        self.inner
            .runtime
            .dispatcher()
            .dispatch(&route, Box::new(move || directory.deliver_one_way(&key, &op)))
    }

    /// Runs on a dispatcher worker; failures are logged, never returned
    pub(crate) fn deliver_one_way<F>(&self, key: &EntityKey, op: &F)
    where
        F: Fn(&mut E, &EntityContext<'_, E>) -> Result<()>,
    {
        let policy = &self.inner.runtime.config().delivery_retry;
        let result = retry_with_policy(policy, || self.call(key.clone(), |entity, ctx| op(entity, ctx)));
        if let Err(e) = result {
            warn!("One-way message to {}/{} failed: {}", E::KIND, key, e);
        }
    }

    /// True if `key` currently has an activation in memory
    pub fn is_active(&self, key: &EntityKey) -> bool {
        let map = self.stripe(key).lock();
        match map.get(key) {
            // A busy activation is certainly live
            Some(activation) => activation.slot.try_lock().map(|g| g.is_some()).unwrap_or(true),
            None => false,
        }
    }

    /// Deactivate `key` now, after any in-flight operation. State is
    /// already persisted; durable reminders stay armed.
    pub fn deactivate(&self, key: &EntityKey) -> bool {
        let Some(activation) = self.stripe(key).lock().get(key).cloned() else {
            return false;
        };
        let _guard = activation.slot.lock();
        if activation.retired.load(Ordering::Acquire) {
            return false;
        }
        self.retire(key, &activation);
        true
    }

    /// Deactivate every activation unused for `idle_timeout`. Busy
    /// activations are skipped.
    pub fn collect_idle(&self, idle_timeout: Duration) -> usize {
        let now = Instant::now();
        let mut collected = 0;

        for stripe in &self.inner.stripes {
            let mut map = stripe.lock();
            map.retain(|_, activation| {
                if now.duration_since(*activation.last_used.lock()) < idle_timeout {
                    return true;
                }
                let Some(_guard) = activation.slot.try_lock() else {
                    return true;
                };
                activation.retired.store(true, Ordering::Release);
                collected += 1;
                false
            });
        }

        if collected > 0 {
            self.inner.deactivations.fetch_add(collected as u64, Ordering::Relaxed);
            info!("Collected {} idle {} activations", collected, E::KIND);
        }
        collected
    }

    /// Activations currently held in memory
    pub fn active_count(&self) -> usize {
        self.inner.stripes.iter().map(|s| s.lock().len()).sum()
    }

    pub fn stats(&self) -> DirectoryStats {
        DirectoryStats {
            active: self.active_count(),
            activations: self.inner.activations.load(Ordering::Relaxed),
            deactivations: self.inner.deactivations.load(Ordering::Relaxed),
        }
    }

    fn stripe(&self, key: &EntityKey) -> &Mutex<HashMap<EntityKey, Arc<Activation<E>>>> {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        &self.inner.stripes[(hasher.finish() as usize) % NUM_STRIPES]
    }

    fn slot(&self, key: &EntityKey) -> Arc<Activation<E>> {
        let mut map = self.stripe(key).lock();
        let activation = map.entry(key.clone()).or_insert_with(|| {
            Arc::new(Activation::new(
                self.inner.next_activation.fetch_add(1, Ordering::Relaxed),
            ))
        });
        Arc::clone(activation)
    }

    fn activate(&self, id: &EntityId) -> Result<Loaded<E>> {
        let stored = self
            .inner
            .runtime
            .state_store()
            .load(id)
            .map_err(|e| Error::ActivationFailed(format!("loading state of {}: {}", id, e)))?;

        let state = match &stored {
            Some(bytes) => Some(
                bincode::deserialize::<E::State>(bytes)
                    .map_err(|e| Error::Corruption(format!("state of {}: {}", id, e)))?,
            ),
            None => None,
        };

        let entity = (self.inner.activator)(id, state);
        let persisted = match stored {
            Some(bytes) => bytes,
            None => encode_state(&entity)?,
        };

        self.inner.activations.fetch_add(1, Ordering::Relaxed);
        debug!("Activated {}", id);
        Ok(Loaded { entity, persisted })
    }

    /// Run `op` against a working copy and commit it. Returns the op's
    /// value and whether the op asked for deactivation.
    fn execute<R, F>(
        &self,
        id: &EntityId,
        activation: &Activation<E>,
        loaded: &mut Loaded<E>,
        op: F,
    ) -> Result<(R, bool)>
    where
        F: FnOnce(&mut E, &EntityContext<'_, E>) -> Result<R>,
    {
        let mut working = loaded.entity.clone();
        let ctx = EntityContext::new(id, activation.id, self);
        let value = op(&mut working, &ctx)?;
        let effects = ctx.into_effects();

        let runtime = &self.inner.runtime;
        let scheduler = runtime.scheduler();

        // New reminders are armed before the state that relies on them is
        // written; a reminder for state that never committed finds nothing to do
        for effect in &effects {
            if let Effect::RegisterReminder { name, delay } = effect {
                let delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
                let due_at_ms = now_millis().saturating_add(delay_ms);
                scheduler.register_reminder(Reminder::new(id.clone(), name.clone(), due_at_ms))?;
            }
        }

        // Messages are part of the commit: if they cannot be sent, nothing is written
        let sends = effects.iter().any(|e| matches!(e, Effect::Send { .. }));
        let permit = if sends {
            Some(runtime.dispatcher().reserve()?)
        } else {
            None
        };

        let bytes = encode_state(&working)?;
        if bytes != loaded.persisted {
            runtime.state_store().save(id, &bytes)?;
            loaded.persisted = bytes;
        }
        loaded.entity = working;
        *activation.last_used.lock() = Instant::now();

        let mut rest = Vec::with_capacity(effects.len());
        for effect in effects {
            match (effect, &permit) {
                (Effect::Send { route, job }, Some(permit)) => {
                    if let Err(e) = permit.dispatch(&route, job) {
                        warn!("{} could not send to {}: {}", id, route, e);
                    }
                }
                (effect, _) => rest.push(effect),
            }
        }
        drop(permit);

        let mut deactivate = false;
        for effect in rest {
            match effect {
                Effect::Timer { delay, callback } => {
                    let directory = self.clone();
                    let key = id.key.clone();
                    let activation_id = activation.id;
                    scheduler.register_timer(
                        id.route_key(),
                        delay,
                        Box::new(move || directory.run_timer(&key, activation_id, callback)),
                    );
                }
                // Cancelled after the commit; a reminder that still fires
                // meets state that already says it is done
                Effect::UnregisterReminder { name } => {
                    if let Err(e) = scheduler.unregister_reminder(id, &name) {
                        warn!("{} could not cancel reminder {}: {}", id, name, e);
                    }
                }
                Effect::Deactivate => deactivate = true,
                Effect::Send { .. } | Effect::RegisterReminder { .. } => {}
            }
        }

        Ok((value, deactivate))
    }

    fn run_timer(&self, key: &EntityKey, activation_id: ActivationId, callback: EntityTimer<E>) {
        let current = self.stripe(key).lock().get(key).cloned();
        let activation = match current {
            Some(activation) if activation.id == activation_id => activation,
            _ => {
                debug!("Dropping timer for {}/{}: activation {} is gone", E::KIND, key, activation_id);
                return;
            }
        };

        let mut guard = activation.slot.lock();
        if activation.retired.load(Ordering::Acquire) {
            debug!("Dropping timer for {}/{}: activation retired", E::KIND, key);
            return;
        }
        let Some(loaded) = guard.as_mut() else {
            return;
        };

        let id = EntityId::new(E::KIND, key.clone());
        match self.execute(&id, &activation, loaded, callback) {
            Ok(((), deactivate)) => {
                if deactivate {
                    self.retire(key, &activation);
                }
            }
            Err(e) => warn!("Timer on {} failed: {}", id, e),
        }
    }

    /// Caller holds the activation's slot lock
    fn retire(&self, key: &EntityKey, activation: &Arc<Activation<E>>) {
        activation.retired.store(true, Ordering::Release);
        let mut map = self.stripe(key).lock();
        if map.get(key).is_some_and(|current| Arc::ptr_eq(current, activation)) {
            map.remove(key);
        }
        self.inner.deactivations.fetch_add(1, Ordering::Relaxed);
        debug!("Deactivated {}/{}", E::KIND, key);
    }
}

fn encode_state<E: Entity>(entity: &E) -> Result<Vec<u8>> {
    bincode::serialize(&entity.snapshot())
        .map_err(|e| Error::Serialization(format!("entity state: {}", e)))
}

/// Registry entry for a directory; does not keep it alive
struct HostRef<E: Entity>(Weak<DirectoryInner<E>>);

impl<E: Entity> HostRef<E> {
    fn directory(&self) -> Option<Directory<E>> {
        self.0.upgrade().map(|inner| Directory { inner })
    }
}

impl<E: Entity> EntityHost for HostRef<E> {
    fn deliver_reminder(&self, key: &EntityKey, name: &str) -> Result<()> {
        let directory = self
            .directory()
            .ok_or_else(|| Error::ActivationFailed(format!("{} directory was dropped", E::KIND)))?;
        directory.call(key.clone(), |entity, ctx| entity.receive_reminder(ctx, name))
    }

    fn collect_idle(&self, idle_timeout: Duration) -> usize {
        self.directory().map(|d| d.collect_idle(idle_timeout)).unwrap_or(0)
    }

    fn is_alive(&self) -> bool {
        self.0.strong_count() > 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeConfig;
    use serde::{Deserialize, Serialize};
    use std::sync::atomic::AtomicUsize;
    use std::thread;

    #[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
    struct CounterState {
        value: u64,
        reminders: u64,
    }

    #[derive(Clone)]
    struct Counter {
        state: CounterState,
    }

    impl Entity for Counter {
        type State = CounterState;
        const KIND: EntityKind = EntityKind::Statistics;

        fn snapshot(&self) -> CounterState {
            self.state.clone()
        }

        fn receive_reminder(&mut self, _ctx: &EntityContext<'_, Self>, _name: &str) -> Result<()> {
            self.state.reminders += 1;
            Ok(())
        }
    }

    fn counters(runtime: &Runtime) -> Directory<Counter> {
        runtime
            .directory(|_, state: Option<CounterState>| Counter {
                state: state.unwrap_or_default(),
            })
            .unwrap()
    }

    fn get(dir: &Directory<Counter>, key: &str) -> CounterState {
        dir.call(key, |c, _| Ok(c.state.clone())).unwrap()
    }

    #[test]
    fn test_call_activates_once_per_key() {
        let runtime = Runtime::open(RuntimeConfig::new()).unwrap();
        let dir = counters(&runtime);

        dir.call("a", |c, _| {
            c.state.value += 1;
            Ok(())
        })
        .unwrap();
        dir.call("a", |c, _| {
            c.state.value += 1;
            Ok(())
        })
        .unwrap();

        assert_eq!(get(&dir, "a").value, 2);
        assert_eq!(dir.stats().activations, 1);
        assert!(dir.is_active(&EntityKey::from("a")));
        assert!(!dir.is_active(&EntityKey::from("b")));
        runtime.shutdown();
    }

    #[test]
    fn test_concurrent_calls_are_serialized() {
        let runtime = Runtime::open(RuntimeConfig::new()).unwrap();
        let dir = counters(&runtime);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let dir = dir.clone();
                thread::spawn(move || {
                    for _ in 0..100 {
                        dir.call("shared", |c, _| {
                            let seen = c.state.value;
                            thread::yield_now();
                            c.state.value = seen + 1;
                            Ok(())
                        })
                        .unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(get(&dir, "shared").value, 800);
        assert_eq!(dir.stats().activations, 1);
        runtime.shutdown();
    }

    #[test]
    fn test_failed_operation_leaves_no_trace() {
        let runtime = Runtime::open(RuntimeConfig::new()).unwrap();
        let dir = counters(&runtime);
        let sent = Arc::new(AtomicUsize::new(0));

        let other = dir.clone();
        let result: Result<()> = dir.call("a", |c, ctx| {
            c.state.value = 99;
            let sent = Arc::clone(&sent);
            ctx.tell(&other, "b", move |_, _| {
                sent.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });
            ctx.register_reminder("r", Duration::from_millis(1));
            Err(Error::InvalidArgument("rejected".to_string()))
        });

        assert!(result.is_err());
        assert!(runtime.wait_idle(Duration::from_secs(1)));
        assert_eq!(get(&dir, "a").value, 0);
        assert_eq!(sent.load(Ordering::SeqCst), 0);
        assert_eq!(runtime.scheduler().armed_reminders(), 0);
        runtime.shutdown();
    }

    #[test]
    fn test_tell_is_delivered_in_order() {
        let runtime = Runtime::open(RuntimeConfig::new()).unwrap();
        let dir = counters(&runtime);

        for i in 0..20 {
            dir.tell("log", move |c, _| {
                assert_eq!(c.state.value, i);
                c.state.value += 1;
                Ok(())
            })
            .unwrap();
        }

        assert!(runtime.wait_idle(Duration::from_secs(2)));
        assert_eq!(get(&dir, "log").value, 20);
        runtime.shutdown();
    }

    #[test]
    fn test_state_survives_deactivation() {
        let runtime = Runtime::open(RuntimeConfig::new()).unwrap();
        let dir = counters(&runtime);
        let key = EntityKey::from("a");

        dir.call("a", |c, _| {
            c.state.value = 5;
            Ok(())
        })
        .unwrap();
        assert!(dir.deactivate(&key));
        assert!(!dir.is_active(&key));
        assert!(!dir.deactivate(&key));

        assert_eq!(get(&dir, "a").value, 5);
        assert_eq!(dir.stats().activations, 2);
        assert_eq!(dir.stats().deactivations, 1);
        runtime.shutdown();
    }

    #[test]
    fn test_untouched_entity_is_not_persisted() {
        let runtime = Runtime::open(RuntimeConfig::new()).unwrap();
        let dir = counters(&runtime);

        get(&dir, "never-written");
        assert!(runtime.state_store().is_empty());
        runtime.shutdown();
    }

    #[test]
    fn test_collect_idle() {
        let runtime = Runtime::open(RuntimeConfig::new()).unwrap();
        let dir = counters(&runtime);

        get(&dir, "a");
        get(&dir, "b");
        assert_eq!(dir.collect_idle(Duration::from_secs(60)), 0);

        thread::sleep(Duration::from_millis(30));
        assert_eq!(dir.collect_idle(Duration::from_millis(10)), 2);
        assert_eq!(dir.stats().active, 0);
        runtime.shutdown();
    }

    #[test]
    fn test_timer_runs_on_live_activation() {
        let runtime = Runtime::open(RuntimeConfig::new()).unwrap();
        let dir = counters(&runtime);

        dir.call("a", |_, ctx| {
            ctx.register_timer(Duration::from_millis(20), |c, _| {
                c.state.value += 10;
                Ok(())
            });
            Ok(())
        })
        .unwrap();

        thread::sleep(Duration::from_millis(80));
        assert!(runtime.wait_idle(Duration::from_secs(1)));
        assert_eq!(get(&dir, "a").value, 10);
        runtime.shutdown();
    }

    #[test]
    fn test_timer_dropped_after_deactivation() {
        let runtime = Runtime::open(RuntimeConfig::new()).unwrap();
        let dir = counters(&runtime);

        dir.call("a", |_, ctx| {
            ctx.register_timer(Duration::from_millis(30), |c, _| {
                c.state.value += 10;
                Ok(())
            });
            Ok(())
        })
        .unwrap();
        dir.deactivate(&EntityKey::from("a"));

        thread::sleep(Duration::from_millis(80));
        assert!(runtime.wait_idle(Duration::from_secs(1)));
        assert_eq!(get(&dir, "a").value, 0);
        runtime.shutdown();
    }

    #[test]
    fn test_reminder_reactivates_entity() {
        let runtime = Runtime::open(RuntimeConfig::new()).unwrap();
        let dir = counters(&runtime);
        let key = EntityKey::from("a");

        dir.call("a", |_, ctx| {
            ctx.register_reminder("tick", Duration::from_millis(30));
            Ok(())
        })
        .unwrap();
        dir.deactivate(&key);
        assert!(!dir.is_active(&key));

        thread::sleep(Duration::from_millis(100));
        assert!(runtime.wait_idle(Duration::from_secs(1)));

        assert!(dir.is_active(&key));
        assert_eq!(get(&dir, "a").reminders, 1);
        assert_eq!(runtime.scheduler().armed_reminders(), 0);
        runtime.shutdown();
    }

    #[test]
    fn test_deactivate_on_idle_effect() {
        let runtime = Runtime::open(RuntimeConfig::new()).unwrap();
        let dir = counters(&runtime);
        let key = EntityKey::from("a");

        dir.call("a", |c, ctx| {
            c.state.value = 1;
            ctx.deactivate_on_idle();
            Ok(())
        })
        .unwrap();

        assert!(!dir.is_active(&key));
        assert_eq!(get(&dir, "a").value, 1);
        runtime.shutdown();
    }
}
