/// Scheduled callbacks: timers and reminders
///
/// A single scheduler thread keeps a deadline heap. Due work is never run
/// on the scheduler thread itself; it is handed to the dispatcher, routed by
/// the owning entity, so a callback runs in line with the other messages
/// for that entity.
///
/// - Timers live only in memory. The callback decides whether the owning
///   activation is still live (see `Directory`).
/// - Reminders are written to the `ReminderStore` before they count as
///   armed and are removed only after a successful delivery. Failed
///   deliveries are retried with backoff until they succeed or are cancelled.

use crate::dispatcher::Dispatcher;
use crate::reminder::{Reminder, ReminderStore};
use crate::retry::RetryPolicy;
use crate::{until_millis, EntityId, Error, Result};
use parking_lot::{Condvar, Mutex};
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Callback run when a timer fires
pub type TimerCallback = Box<dyn FnOnce() + Send + 'static>;

/// Deadlines further out than this are clamped; `Instant` cannot represent
/// arbitrary offsets
const MAX_HORIZON: Duration = Duration::from_secs(200 * 365 * 24 * 60 * 60);

fn deadline_after(delay: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(delay.min(MAX_HORIZON))
        .or_else(|| now.checked_add(Duration::from_secs(u32::MAX as u64)))
        .unwrap_or(now)
}

/// Receives due reminders. Implemented by the runtime's entity registry,
/// which activates the owner if needed and runs its reminder handler.
pub trait ReminderSink: Send + Sync {
    fn deliver(&self, reminder: &Reminder) -> Result<()>;
}

enum Task {
    Timer {
        route: String,
        callback: TimerCallback,
    },
    Reminder {
        reminder: Reminder,
        attempt: u32,
    },
}

struct SchedulerState {
    queue: BinaryHeap<Reverse<(Instant, u64)>>,
    tasks: HashMap<u64, Task>,
    /// Armed reminder slots and the sequence number of their current task
    armed: HashMap<(EntityId, String), u64>,
    next_seq: u64,
    shutdown: bool,
}

impl SchedulerState {
    fn push(&mut self, deadline: Instant, task: Task) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.tasks.insert(seq, task);
        self.queue.push(Reverse((deadline, seq)));
        seq
    }
}

struct SchedulerInner {
    state: Mutex<SchedulerState>,
    wakeup: Condvar,
    store: Arc<dyn ReminderStore>,
    dispatcher: Dispatcher,
    sink: Arc<dyn ReminderSink>,
    retry: RetryPolicy,
    handle: Mutex<Option<JoinHandle<()>>>,
}

#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
}

impl Scheduler {
    /// Start the scheduler thread, re-arming every reminder found in `store`.
    /// Overdue reminders fire immediately.
    pub fn start(
        store: Arc<dyn ReminderStore>,
        dispatcher: Dispatcher,
        sink: Arc<dyn ReminderSink>,
        retry: RetryPolicy,
    ) -> Result<Self> {
        let mut state = SchedulerState {
            queue: BinaryHeap::new(),
            tasks: HashMap::new(),
            armed: HashMap::new(),
            next_seq: 1,
            shutdown: false,
        };

        let persisted = store.load_all()?;
        let restored = persisted.len();
        for reminder in persisted {
            let deadline = deadline_after(until_millis(reminder.due_at_ms));
            let slot = reminder.slot();
            let seq = state.push(deadline, Task::Reminder { reminder, attempt: 0 });
            state.armed.insert(slot, seq);
        }

        let inner = Arc::new(SchedulerInner {
            state: Mutex::new(state),
            wakeup: Condvar::new(),
            store,
            dispatcher,
            sink,
            retry,
            handle: Mutex::new(None),
        });

        let loop_inner = Arc::clone(&inner);
        let handle = thread::Builder::new()
            .name("shortlink-scheduler".to_string())
            .spawn(move || loop_inner.run())
            .map_err(|e| Error::SchedulerUnavailable(format!("failed to spawn scheduler: {}", e)))?;
        *inner.handle.lock() = Some(handle);

        info!("Scheduler started, {} reminders restored", restored);
        Ok(Self { inner })
    }

    /// Run `callback` on the dispatcher route `route` once `delay` has elapsed.
    /// Timers registered after shutdown never fire.
    pub fn register_timer(&self, route: impl Into<String>, delay: Duration, callback: TimerCallback) {
        let mut state = self.inner.state.lock();
        if state.shutdown {
            return;
        }
        state.push(
            deadline_after(delay),
            Task::Timer {
                route: route.into(),
                callback,
            },
        );
        self.inner.wakeup.notify_one();
    }

    /// Durably arm `reminder`, replacing any reminder with the same owner and name
    pub fn register_reminder(&self, reminder: Reminder) -> Result<()> {
        let mut state = self.inner.state.lock();
        if state.shutdown {
            return Err(Error::SchedulerUnavailable("scheduler is stopped".to_string()));
        }

        self.inner.store.upsert(&reminder)?;

        let slot = reminder.slot();
        let deadline = deadline_after(until_millis(reminder.due_at_ms));
        debug!(
            "Arming reminder {}:{} in {:?}",
            reminder.owner,
            reminder.name,
            until_millis(reminder.due_at_ms)
        );
        let seq = state.push(deadline, Task::Reminder { reminder, attempt: 0 });
        if let Some(previous) = state.armed.insert(slot, seq) {
            state.tasks.remove(&previous);
        }
        self.inner.wakeup.notify_one();
        Ok(())
    }

    /// Cancel the reminder `(owner, name)`. Returns false if none was armed.
    pub fn unregister_reminder(&self, owner: &EntityId, name: &str) -> Result<bool> {
        let mut state = self.inner.state.lock();
        let removed = self.inner.store.remove(owner, name)?;
        if let Some(seq) = state.armed.remove(&(owner.clone(), name.to_string())) {
            state.tasks.remove(&seq);
        }
        Ok(removed)
    }

    /// Number of armed reminders, including ones being delivered
    pub fn armed_reminders(&self) -> usize {
        self.inner.state.lock().armed.len()
    }

    /// Number of timers that have not fired or been cancelled
    pub fn pending_timers(&self) -> usize {
        self.inner
            .state
            .lock()
            .tasks
            .values()
            .filter(|t| matches!(t, Task::Timer { .. }))
            .count()
    }

    /// Stop the scheduler thread. Armed reminders stay in the store.
    pub fn shutdown(&self) {
        {
            let mut state = self.inner.state.lock();
            if state.shutdown {
                return;
            }
            state.shutdown = true;
            self.inner.wakeup.notify_all();
        }

        info!("Initiating scheduler shutdown");
        if let Some(handle) = self.inner.handle.lock().take() {
            if handle.thread().id() != thread::current().id() {
                if let Err(e) = handle.join() {
                    warn!("Error joining scheduler thread: {:?}", e);
                }
            }
        }

        // Timer callbacks hold directory handles; release them with the thread
        let mut state = self.inner.state.lock();
        state.queue.clear();
        state.tasks.clear();
        state.armed.clear();
    }

    pub fn is_running(&self) -> bool {
        !self.inner.state.lock().shutdown
    }
}

impl SchedulerInner {
    fn run(self: Arc<Self>) {
        debug!("Scheduler loop started");
        let mut state = self.state.lock();

        while !state.shutdown {
            let next = state.queue.peek().map(|Reverse(entry)| *entry);
            let (deadline, seq) = match next {
                Some(entry) => entry,
                None => {
                    self.wakeup.wait(&mut state);
                    continue;
                }
            };

            if deadline > Instant::now() {
                self.wakeup.wait_until(&mut state, deadline);
                continue;
            }

            state.queue.pop();
            // Cancelled or replaced entries have no task left
            let Some(task) = state.tasks.remove(&seq) else {
                continue;
            };

            match task {
                Task::Timer { route, callback } => {
                    if let Err(e) = self.dispatcher.dispatch(&route, callback) {
                        warn!("Dropping timer for {}: {}", route, e);
                    }
                }
                Task::Reminder { reminder, attempt } => {
                    let route = reminder.owner.route_key();
                    let job_inner = Arc::clone(&self);
                    let job = Box::new(move || job_inner.deliver(reminder, seq, attempt));
                    if let Err(e) = self.dispatcher.dispatch(&route, job) {
                        // Stays in the store; re-armed on next start
                        warn!("Could not dispatch reminder for {}: {}", route, e);
                    }
                }
            }
        }

        debug!("Scheduler loop exited");
    }

    /// Runs on a dispatcher worker
    fn deliver(self: Arc<Self>, reminder: Reminder, seq: u64, attempt: u32) {
        let result = self.sink.deliver(&reminder);

        let mut state = self.state.lock();
        let slot = reminder.slot();
        // Re-armed or cancelled while in flight: the newer state wins
        if state.armed.get(&slot) != Some(&seq) {
            return;
        }

        match result {
            Ok(()) => {
                debug!("Delivered reminder {}:{}", reminder.owner, reminder.name);
                match self.store.remove(&reminder.owner, &reminder.name) {
                    Ok(_) => {
                        state.armed.remove(&slot);
                    }
                    Err(e) => {
                        // Leaving it armed is safe; reminder handlers tolerate redelivery
                        warn!("Failed to retire reminder {}:{}: {}", reminder.owner, reminder.name, e);
                    }
                }
            }
            Err(e) => {
                let backoff = self.retry.backoff_duration(attempt);
                warn!(
                    "Reminder {}:{} delivery failed (attempt {}), retrying in {:?}: {}",
                    reminder.owner,
                    reminder.name,
                    attempt + 1,
                    backoff,
                    e
                );
                if state.shutdown {
                    return;
                }
                let retry_seq = state.push(
                    deadline_after(backoff),
                    Task::Reminder {
                        reminder,
                        attempt: attempt.saturating_add(1),
                    },
                );
                state.armed.insert(slot, retry_seq);
                self.wakeup.notify_one();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reminder::MemoryReminderStore;
    use crate::{now_millis, EntityKind};
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Records deliveries; fails the first `failures` of them
    struct CountingSink {
        delivered: Mutex<Vec<Reminder>>,
        failures: AtomicUsize,
    }

    impl CountingSink {
        fn new(failures: usize) -> Arc<Self> {
            Arc::new(Self {
                delivered: Mutex::new(Vec::new()),
                failures: AtomicUsize::new(failures),
            })
        }
    }

    impl ReminderSink for CountingSink {
        fn deliver(&self, reminder: &Reminder) -> Result<()> {
            if self
                .failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(Error::ActivationFailed("injected".to_string()));
            }
            self.delivered.lock().push(reminder.clone());
            Ok(())
        }
    }

    fn owner(key: &str) -> EntityId {
        EntityId::new(EntityKind::ShortUrl, key)
    }

    fn fast_retry() -> RetryPolicy {
        RetryPolicy::new(0, Duration::from_millis(10), Duration::from_millis(20), 2.0)
    }

    fn start(store: Arc<MemoryReminderStore>, sink: Arc<CountingSink>) -> (Scheduler, Dispatcher) {
        let dispatcher = Dispatcher::start(2);
        let scheduler = Scheduler::start(store, dispatcher.clone(), sink, fast_retry()).unwrap();
        (scheduler, dispatcher)
    }

    #[test]
    fn test_timer_fires_after_delay() {
        let (scheduler, dispatcher) = start(Arc::new(MemoryReminderStore::new()), CountingSink::new(0));
        let fired = Arc::new(AtomicUsize::new(0));
        let started = Instant::now();

        let f = Arc::clone(&fired);
        scheduler.register_timer("t", Duration::from_millis(50), Box::new(move || {
            f.fetch_add(1, Ordering::SeqCst);
        }));

        thread::sleep(Duration::from_millis(150));
        assert!(dispatcher.wait_idle(Duration::from_secs(1)));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(started.elapsed() >= Duration::from_millis(50));
        assert_eq!(scheduler.pending_timers(), 0);
        scheduler.shutdown();
    }

    #[test]
    fn test_far_future_reminder_stays_armed() {
        let store = Arc::new(MemoryReminderStore::new());
        let sink = CountingSink::new(0);
        let (scheduler, dispatcher) = start(Arc::clone(&store), Arc::clone(&sink));

        scheduler
            .register_reminder(Reminder::new(owner("far"), "expire", u64::MAX))
            .unwrap();

        thread::sleep(Duration::from_millis(100));
        assert!(dispatcher.wait_idle(Duration::from_secs(1)));
        assert!(sink.delivered.lock().is_empty());
        assert_eq!(scheduler.armed_reminders(), 1);
        scheduler.shutdown();
    }

    #[test]
    fn test_reminder_delivered_and_retired() {
        let store = Arc::new(MemoryReminderStore::new());
        let sink = CountingSink::new(0);
        let (scheduler, dispatcher) = start(Arc::clone(&store), Arc::clone(&sink));

        scheduler
            .register_reminder(Reminder::new(owner("a"), "expire", now_millis() + 50))
            .unwrap();
        assert_eq!(store.load_all().unwrap().len(), 1);

        thread::sleep(Duration::from_millis(150));
        assert!(dispatcher.wait_idle(Duration::from_secs(1)));

        assert_eq!(sink.delivered.lock().len(), 1);
        assert!(store.load_all().unwrap().is_empty());
        assert_eq!(scheduler.armed_reminders(), 0);
        scheduler.shutdown();
    }

    #[test]
    fn test_failed_reminder_is_retried() {
        let store = Arc::new(MemoryReminderStore::new());
        let sink = CountingSink::new(2);
        let (scheduler, dispatcher) = start(Arc::clone(&store), Arc::clone(&sink));

        scheduler
            .register_reminder(Reminder::new(owner("a"), "expire", now_millis()))
            .unwrap();

        thread::sleep(Duration::from_millis(200));
        assert!(dispatcher.wait_idle(Duration::from_secs(1)));

        assert_eq!(sink.delivered.lock().len(), 1);
        assert!(store.load_all().unwrap().is_empty());
        scheduler.shutdown();
    }

    #[test]
    fn test_reregister_replaces_reminder() {
        let store = Arc::new(MemoryReminderStore::new());
        let sink = CountingSink::new(0);
        let (scheduler, dispatcher) = start(Arc::clone(&store), Arc::clone(&sink));

        scheduler
            .register_reminder(Reminder::new(owner("a"), "expire", now_millis() + 30))
            .unwrap();
        scheduler
            .register_reminder(Reminder::new(owner("a"), "expire", now_millis() + 60_000))
            .unwrap();

        thread::sleep(Duration::from_millis(120));
        assert!(dispatcher.wait_idle(Duration::from_secs(1)));

        assert!(sink.delivered.lock().is_empty());
        assert_eq!(scheduler.armed_reminders(), 1);
        scheduler.shutdown();
    }

    #[test]
    fn test_unregister_reminder() {
        let store = Arc::new(MemoryReminderStore::new());
        let sink = CountingSink::new(0);
        let (scheduler, dispatcher) = start(Arc::clone(&store), Arc::clone(&sink));

        scheduler
            .register_reminder(Reminder::new(owner("a"), "expire", now_millis() + 50))
            .unwrap();
        assert!(scheduler.unregister_reminder(&owner("a"), "expire").unwrap());
        assert!(!scheduler.unregister_reminder(&owner("a"), "expire").unwrap());

        thread::sleep(Duration::from_millis(120));
        assert!(dispatcher.wait_idle(Duration::from_secs(1)));
        assert!(sink.delivered.lock().is_empty());
        scheduler.shutdown();
    }

    #[test]
    fn test_persisted_reminders_rearmed_on_start() {
        let store = Arc::new(MemoryReminderStore::new());
        store
            .upsert(&Reminder::new(owner("overdue"), "expire", now_millis() - 1_000))
            .unwrap();

        let sink = CountingSink::new(0);
        let (scheduler, dispatcher) = start(Arc::clone(&store), Arc::clone(&sink));

        thread::sleep(Duration::from_millis(50));
        assert!(dispatcher.wait_idle(Duration::from_secs(1)));
        assert_eq!(sink.delivered.lock()[0].owner, owner("overdue"));
        scheduler.shutdown();
    }

    #[test]
    fn test_register_after_shutdown_fails() {
        let (scheduler, _dispatcher) = start(Arc::new(MemoryReminderStore::new()), CountingSink::new(0));
        scheduler.shutdown();
        assert!(!scheduler.is_running());

        let result = scheduler.register_reminder(Reminder::new(owner("a"), "expire", now_millis()));
        assert!(matches!(result, Err(Error::SchedulerUnavailable(_))));
    }
}
