use std::collections::VecDeque;
use std::fmt;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{error, trace};

static NEXT_WORK_ID: AtomicU64 = AtomicU64::new(1);

type Job = Arc<dyn Fn() + Send + Sync>;

/// A named unit of deferred work with a stable identity.
///
/// Clones share the identity, so the same item can be scheduled from one
/// place and cancelled from another. An item is queued at most once.
#[derive(Clone)]
pub struct WorkItem {
    id: u64,
    name: &'static str,
    job: Job,
}

impl WorkItem {
    pub fn new(name: &'static str, job: impl Fn() + Send + Sync + 'static) -> Self {
        Self {
            id: NEXT_WORK_ID.fetch_add(1, Ordering::Relaxed),
            name,
            job: Arc::new(job),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    fn run(&self) {
        trace!("running {}", self.name);
        (self.job)()
    }
}

impl fmt::Debug for WorkItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkItem")
            .field("id", &self.id)
            .field("name", &self.name)
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Priority {
    Normal,
    /// Runs ahead of already queued normal work
    High,
}

/// Deferred execution of work items.
pub trait Scheduler: Send + Sync {
    /// Queue `work` to run on the background context. Returns false if it
    /// was already pending.
    fn schedule(&self, work: &WorkItem, priority: Priority) -> bool;

    /// Run `work` once `delay` has elapsed. Returns false if it was already
    /// pending.
    fn schedule_after(&self, work: &WorkItem, delay: Duration) -> bool;

    /// Drop a pending instance of `work` and wait for a running one to
    /// finish. Returns true if a pending instance was dropped before it ran.
    ///
    /// A work item must never cancel itself.
    fn cancel_and_wait(&self, work: &WorkItem) -> bool;
}

#[derive(Default)]
struct Pending<T> {
    ready: VecDeque<WorkItem>,
    // sorted by deadline
    delayed: Vec<(T, WorkItem)>,
}

impl<T: Ord + Copy> Pending<T> {
    fn contains(&self, work: &WorkItem) -> bool {
        self.ready.iter().any(|w| w.id == work.id)
            || self.delayed.iter().any(|(_, w)| w.id == work.id)
    }

    fn push(&mut self, work: &WorkItem, priority: Priority) -> bool {
        if self.contains(work) {
            return false;
        }
        match priority {
            Priority::High => self.ready.push_front(work.clone()),
            Priority::Normal => self.ready.push_back(work.clone()),
        }
        true
    }

    fn push_delayed(&mut self, work: &WorkItem, deadline: T) -> bool {
        if self.contains(work) {
            return false;
        }
        let at = self.delayed.partition_point(|(d, _)| *d <= deadline);
        self.delayed.insert(at, (deadline, work.clone()));
        true
    }

    fn remove(&mut self, work: &WorkItem) -> bool {
        let before = self.ready.len() + self.delayed.len();
        self.ready.retain(|w| w.id != work.id);
        self.delayed.retain(|(_, w)| w.id != work.id);
        before != self.ready.len() + self.delayed.len()
    }

    /// Move every delayed item due at `now` to the ready queue.
    fn promote(&mut self, now: T) {
        let due = self.delayed.partition_point(|(d, _)| *d <= now);
        self.ready
            .extend(self.delayed.drain(..due).map(|(_, work)| work));
    }

    fn next_deadline(&self) -> Option<T> {
        self.delayed.first().map(|(d, _)| *d)
    }
}

struct QueueState {
    pending: Pending<Instant>,
    running: Option<u64>,
    shutdown: bool,
}

struct QueueShared {
    state: Mutex<QueueState>,
    cond: Condvar,
}

impl QueueShared {
    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Single background thread running work items in queue order.
pub struct WorkQueue {
    shared: Arc<QueueShared>,
    worker: Option<JoinHandle<()>>,
}

impl WorkQueue {
    pub fn new(name: &str) -> io::Result<Self> {
        let shared = Arc::new(QueueShared {
            state: Mutex::new(QueueState {
                pending: Pending {
                    ready: VecDeque::new(),
                    delayed: Vec::new(),
                },
                running: None,
                shutdown: false,
            }),
            cond: Condvar::new(),
        });
        let worker = thread::Builder::new().name(name.to_string()).spawn({
            let shared = shared.clone();
            move || worker_loop(&shared)
        })?;

        Ok(Self {
            shared,
            worker: Some(worker),
        })
    }
}

fn worker_loop(shared: &QueueShared) {
    let mut state = shared.lock();
    loop {
        if state.shutdown {
            return;
        }

        let now = Instant::now();
        state.pending.promote(now);

        if let Some(work) = state.pending.ready.pop_front() {
            state.running = Some(work.id);
            drop(state);

            if panic::catch_unwind(AssertUnwindSafe(|| work.run())).is_err() {
                error!("{} panicked", work.name);
            }

            state = shared.lock();
            state.running = None;
            shared.cond.notify_all();
            continue;
        }

        state = match state.pending.next_deadline() {
            Some(deadline) => {
                let timeout = deadline.saturating_duration_since(now);
                shared
                    .cond
                    .wait_timeout(state, timeout)
                    .map(|(guard, _)| guard)
                    .unwrap_or_else(|e| e.into_inner().0)
            }
            None => shared
                .cond
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner),
        };
    }
}

impl Scheduler for WorkQueue {
    fn schedule(&self, work: &WorkItem, priority: Priority) -> bool {
        let queued = self.shared.lock().pending.push(work, priority);
        if queued {
            self.shared.cond.notify_all();
        }
        queued
    }

    fn schedule_after(&self, work: &WorkItem, delay: Duration) -> bool {
        let queued = self
            .shared
            .lock()
            .pending
            .push_delayed(work, Instant::now() + delay);
        if queued {
            self.shared.cond.notify_all();
        }
        queued
    }

    fn cancel_and_wait(&self, work: &WorkItem) -> bool {
        let mut state = self.shared.lock();
        let cancelled = state.pending.remove(work);
        while state.running == Some(work.id) {
            state = self
                .shared
                .cond
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
        cancelled
    }
}

impl Drop for WorkQueue {
    fn drop(&mut self) {
        self.shared.lock().shutdown = true;
        self.shared.cond.notify_all();
        if let Some(worker) = self.worker.take() {
            // The last owner can be a job running on the worker itself
            if worker.thread().id() != thread::current().id() {
                let _ = worker.join();
            }
        }
    }
}

/// Scheduler driven by a virtual clock instead of a thread.
///
/// Nothing runs until [`VirtualQueue::run_pending`] or
/// [`VirtualQueue::advance`] is called, which makes timing behaviour of the
/// boost controller reproducible.
#[derive(Default)]
pub struct VirtualQueue {
    state: Mutex<VirtualState>,
}

#[derive(Default)]
struct VirtualState {
    now: Duration,
    pending: Pending<Duration>,
}

impl VirtualQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, VirtualState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Time elapsed on the virtual clock.
    pub fn now(&self) -> Duration {
        self.lock().now
    }

    pub fn is_pending(&self, work: &WorkItem) -> bool {
        self.lock().pending.contains(work)
    }

    /// Number of ready and delayed items.
    pub fn pending(&self) -> usize {
        let state = self.lock();
        state.pending.ready.len() + state.pending.delayed.len()
    }

    /// Run ready items, including the ones they queue, until none is left.
    pub fn run_pending(&self) -> usize {
        let mut ran = 0;
        loop {
            let next = self.lock().pending.ready.pop_front();
            match next {
                Some(work) => {
                    work.run();
                    ran += 1;
                }
                None => return ran,
            }
        }
    }

    /// Move the clock forward, firing delayed items in deadline order.
    pub fn advance(&self, by: Duration) {
        let target = self.lock().now + by;
        loop {
            self.run_pending();
            let mut state = self.lock();
            match state.pending.next_deadline() {
                Some(deadline) if deadline <= target => {
                    state.now = state.now.max(deadline);
                    let now = state.now;
                    state.pending.promote(now);
                }
                _ => {
                    state.now = target;
                    break;
                }
            }
        }
        self.run_pending();
    }
}

impl Scheduler for VirtualQueue {
    fn schedule(&self, work: &WorkItem, priority: Priority) -> bool {
        self.lock().pending.push(work, priority)
    }

    fn schedule_after(&self, work: &WorkItem, delay: Duration) -> bool {
        let mut state = self.lock();
        let deadline = state.now + delay;
        state.pending.push_delayed(work, deadline)
    }

    fn cancel_and_wait(&self, work: &WorkItem) -> bool {
        self.lock().pending.remove(work)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    fn recorder(name: &'static str, log: &Arc<Mutex<Vec<&'static str>>>) -> WorkItem {
        let log = log.clone();
        WorkItem::new(name, move || log.lock().unwrap().push(name))
    }

    #[test]
    fn test_pending_item_is_not_queued_twice() {
        let queue = VirtualQueue::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let work = recorder("a", &log);

        assert!(queue.schedule(&work, Priority::Normal));
        assert!(!queue.schedule(&work, Priority::High));
        assert!(!queue.schedule_after(&work, Duration::from_millis(5)));
        assert_eq!(queue.run_pending(), 1);
        assert_eq!(*log.lock().unwrap(), vec!["a"]);
    }

    #[test]
    fn test_high_priority_jumps_the_queue() {
        let queue = VirtualQueue::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        queue.schedule(&recorder("normal", &log), Priority::Normal);
        queue.schedule(&recorder("high", &log), Priority::High);

        queue.run_pending();
        assert_eq!(*log.lock().unwrap(), vec!["high", "normal"]);
    }

    #[test]
    fn test_virtual_clock_fires_in_deadline_order() {
        let queue = VirtualQueue::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        queue.schedule_after(&recorder("late", &log), Duration::from_millis(30));
        queue.schedule_after(&recorder("early", &log), Duration::from_millis(10));

        queue.advance(Duration::from_millis(9));
        assert!(log.lock().unwrap().is_empty());

        queue.advance(Duration::from_millis(25));
        assert_eq!(*log.lock().unwrap(), vec!["early", "late"]);
        assert_eq!(queue.now(), Duration::from_millis(34));
    }

    #[test]
    fn test_cancel_reports_whether_work_was_pending() {
        let queue = VirtualQueue::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let work = recorder("timer", &log);

        queue.schedule_after(&work, Duration::from_millis(10));
        assert!(queue.is_pending(&work));
        assert!(queue.cancel_and_wait(&work));
        assert!(!queue.is_pending(&work));
        assert!(!queue.cancel_and_wait(&work));

        queue.advance(Duration::from_millis(20));
        assert!(log.lock().unwrap().is_empty());
    }

    #[test]
    fn test_work_queue_runs_delayed_work() {
        let queue = WorkQueue::new("test-wq").unwrap();
        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);
        let work = WorkItem::new("delayed", move || {
            tx.lock().unwrap().send(Instant::now()).unwrap();
        });

        let armed = Instant::now();
        assert!(queue.schedule_after(&work, Duration::from_millis(20)));
        let fired = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert!(fired.duration_since(armed) >= Duration::from_millis(20));
    }

    #[test]
    fn test_cancel_and_wait_blocks_until_running_work_finishes() {
        let queue = WorkQueue::new("test-wq").unwrap();
        let (started_tx, started_rx) = mpsc::channel();
        let started_tx = Mutex::new(started_tx);
        let finished = Arc::new(Mutex::new(false));
        let work = WorkItem::new("slow", {
            let finished = finished.clone();
            move || {
                started_tx.lock().unwrap().send(()).unwrap();
                thread::sleep(Duration::from_millis(50));
                *finished.lock().unwrap() = true;
            }
        });

        queue.schedule(&work, Priority::Normal);
        started_rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert!(!queue.cancel_and_wait(&work));
        assert!(*finished.lock().unwrap());
    }
}
