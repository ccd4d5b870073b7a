/// One-way message delivery
///
/// A fixed pool of worker threads, each fed by its own crossbeam channel.
/// Jobs are routed to a worker by a route key (the target entity), so jobs
/// for one target run in the order they were dispatched while different
/// targets proceed in parallel. Senders never wait for the job to run.

use crate::{Error, Result};
use crossbeam::channel::{unbounded, Sender};
use parking_lot::{Condvar, Mutex, RwLock, RwLockReadGuard};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info};

/// A unit of work delivered by the dispatcher
pub type Job = Box<dyn FnOnce() + Send + 'static>;

#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

struct DispatcherInner {
    senders: RwLock<Vec<Sender<Job>>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    /// Jobs dispatched but not yet finished
    pending: Mutex<usize>,
    idle: Condvar,
}

impl Dispatcher {
    /// Start `workers` delivery threads
    pub fn start(workers: usize) -> Self {
        let inner = Arc::new(DispatcherInner {
            senders: RwLock::new(Vec::with_capacity(workers)),
            handles: Mutex::new(Vec::with_capacity(workers)),
            pending: Mutex::new(0),
            idle: Condvar::new(),
        });

        for worker_id in 0..workers.max(1) {
            let (tx, rx) = unbounded::<Job>();
            let worker_inner = Arc::clone(&inner);
            let handle = thread::Builder::new()
                .name(format!("shortlink-dispatch-{}", worker_id))
                .spawn(move || {
                    debug!("Dispatcher worker {} started", worker_id);
                    for job in rx.iter() {
                        if catch_unwind(AssertUnwindSafe(job)).is_err() {
                            error!("Dispatcher worker {} caught a panicking job", worker_id);
                        }
                        worker_inner.finish_one();
                    }
                    debug!("Dispatcher worker {} exited", worker_id);
                });

            match handle {
                Ok(handle) => {
                    inner.senders.write().push(tx);
                    inner.handles.lock().push(handle);
                }
                Err(e) => error!("Failed to spawn dispatcher worker {}: {}", worker_id, e),
            }
        }

        info!("Dispatcher started with {} workers", inner.senders.read().len());
        Self { inner }
    }

    /// Queue `job` on the worker owning `route`. Returns immediately.
    pub fn dispatch(&self, route: &str, job: Job) -> Result<()> {
        self.reserve()?.dispatch(route, job)
    }

    /// Hold the dispatcher open. `shutdown` waits until the permit is
    /// dropped, so work committed under a permit can always send its jobs.
    ///
    /// Do not block on other locks while holding a permit.
    pub fn reserve(&self) -> Result<DispatchPermit<'_>> {
        let senders = self.inner.senders.read();
        if senders.is_empty() {
            return Err(Error::SchedulerUnavailable("dispatcher is stopped".to_string()));
        }
        Ok(DispatchPermit {
            inner: &self.inner,
            senders,
        })
    }

    /// Jobs dispatched and not yet finished
    pub fn pending(&self) -> usize {
        *self.inner.pending.lock()
    }

    /// Block until every dispatched job has finished, including jobs those
    /// jobs dispatched. Returns false if `timeout` elapsed first.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut pending = self.inner.pending.lock();
        while *pending > 0 {
            if self.inner.idle.wait_until(&mut pending, deadline).timed_out() {
                return *pending == 0;
            }
        }
        true
    }

    /// Stop accepting jobs, drain the queues and join the workers
    pub fn shutdown(&self) {
        let senders: Vec<Sender<Job>> = self.inner.senders.write().drain(..).collect();
        if senders.is_empty() {
            return;
        }
        info!("Shutting down dispatcher");
        drop(senders);

        let handles: Vec<JoinHandle<()>> = self.inner.handles.lock().drain(..).collect();
        for handle in handles {
            if handle.thread().id() == thread::current().id() {
                continue;
            }
            if let Err(e) = handle.join() {
                error!("Error joining dispatcher worker: {:?}", e);
            }
        }
    }

    pub fn is_running(&self) -> bool {
        !self.inner.senders.read().is_empty()
    }
}

/// A running dispatcher, held open. See `Dispatcher::reserve`.
pub struct DispatchPermit<'a> {
    inner: &'a DispatcherInner,
    senders: RwLockReadGuard<'a, Vec<Sender<Job>>>,
}

impl DispatchPermit<'_> {
    pub fn dispatch(&self, route: &str, job: Job) -> Result<()> {
        let mut hasher = DefaultHasher::new();
        route.hash(&mut hasher);
        let worker = (hasher.finish() % self.senders.len() as u64) as usize;

        *self.inner.pending.lock() += 1;
        if self.senders[worker].send(job).is_err() {
            self.inner.finish_one();
            return Err(Error::SchedulerUnavailable(format!(
                "dispatcher worker {} is gone",
                worker
            )));
        }
        Ok(())
    }
}

impl DispatcherInner {
    fn finish_one(&self) {
        let mut pending = self.pending.lock();
        *pending = pending.saturating_sub(1);
        if *pending == 0 {
            self.idle.notify_all();
        }
    }
}
