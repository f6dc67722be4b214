//! The worker pool: N OS threads, one work-stealing deque each.
//!
//! A worker runs tasks to completion without yielding; there is no event
//! loop underneath. On an empty deque it drains its submission inbox,
//! consults the global priority queue, then tries to steal from a random
//! victim, backing off exponentially (capped at a few milliseconds) after
//! consecutive misses. The cancel flag is polled between deque
//! operations. Shutdown drains everything and joins every thread.
//!
//! Only the owning worker ever pushes to a deque's bottom; external
//! submissions go through per-worker inboxes (least-loaded policy) or
//! the global multi-level queue (priority policy), both drained by the
//! owner itself.

use crate::deque::{Steal, WorkStealingDeque};
use crate::policy::{MultiLevelQueue, Priority};
use parking_lot::Mutex;
use rand::Rng;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

/// Steal misses before the first sleep.
const SPIN_MISSES: u32 = 8;
/// Backoff ceiling.
const MAX_BACKOFF: Duration = Duration::from_millis(2);

struct PoolShared<T> {
    deques: Vec<Arc<WorkStealingDeque<T>>>,
    inboxes: Vec<Mutex<VecDeque<T>>>,
    global: MultiLevelQueue<T>,
    shutdown: AtomicBool,
    cancel: Arc<AtomicBool>,
    /// Workers currently inside a task; they may still produce work.
    active: AtomicUsize,
}

impl<T> PoolShared<T> {
    fn anything_queued(&self) -> bool {
        !self.global.is_empty()
            || self.deques.iter().any(|d| !d.is_empty())
            || self.inboxes.iter().any(|i| !i.lock().is_empty())
    }
}

/// Handed to every task so it can schedule follow-up work.
pub struct WorkerContext<'a, T> {
    worker_id: usize,
    shared: &'a PoolShared<T>,
}

impl<'a, T> WorkerContext<'a, T> {
    pub fn worker_id(&self) -> usize {
        self.worker_id
    }

    /// Owner-push: enqueue on this worker's own deque (locality; the
    /// task will be popped LIFO, depth-first).
    pub fn submit_local(&self, task: T) {
        self.shared.deques[self.worker_id].push(task);
    }

    /// Route through the global priority queue.
    pub fn submit(&self, priority: Priority, task: T) {
        self.shared.global.push(priority, task);
    }

    pub fn is_cancelled(&self) -> bool {
        self.shared.cancel.load(Ordering::Acquire)
    }
}

/// Fixed-size pool of work-stealing workers.
pub struct WorkerPool<T> {
    shared: Arc<PoolShared<T>>,
    handles: Vec<JoinHandle<()>>,
}

impl<T: Send + 'static> WorkerPool<T> {
    /// `workers = 0` means one per logical CPU.
    pub fn new(workers: usize, cancel: Arc<AtomicBool>) -> Self {
        let workers = if workers == 0 {
            num_cpus::get()
        } else {
            workers
        };
        let shared = Arc::new(PoolShared {
            deques: (0..workers)
                .map(|_| Arc::new(WorkStealingDeque::new()))
                .collect(),
            inboxes: (0..workers).map(|_| Mutex::new(VecDeque::new())).collect(),
            global: MultiLevelQueue::new(),
            shutdown: AtomicBool::new(false),
            cancel,
            active: AtomicUsize::new(0),
        });
        Self {
            shared,
            handles: Vec::new(),
        }
    }

    pub fn worker_count(&self) -> usize {
        self.shared.deques.len()
    }

    /// Spawn the workers. `job` runs every task; it receives a context
    /// for owner-push scheduling.
    pub fn start<F>(&mut self, job: F)
    where
        F: Fn(T, &WorkerContext<'_, T>) + Send + Sync + 'static,
    {
        let job = Arc::new(job);
        for worker_id in 0..self.shared.deques.len() {
            let shared = self.shared.clone();
            let job = job.clone();
            self.handles.push(
                std::thread::Builder::new()
                    .name(format!("mason-worker-{worker_id}"))
                    .spawn(move || worker_loop(worker_id, &shared, &*job))
                    .expect("spawn worker thread"),
            );
        }
    }

    /// External submission, least-loaded policy: the inbox of the worker
    /// with the fewest queued tasks.
    pub fn submit_least_loaded(&self, task: T) {
        let (index, _) = self
            .shared
            .deques
            .iter()
            .enumerate()
            .map(|(i, d)| (i, d.len() + self.shared.inboxes[i].lock().len()))
            .min_by_key(|(_, len)| *len)
            .expect("pool has workers");
        self.shared.inboxes[index].lock().push_back(task);
    }

    /// External submission, priority policy.
    pub fn submit(&self, priority: Priority, task: T) {
        self.shared.global.push(priority, task);
    }

    pub fn queued(&self) -> usize {
        self.shared.global.len()
            + self
                .shared
                .deques
                .iter()
                .enumerate()
                .map(|(i, d)| d.len() + self.shared.inboxes[i].lock().len())
                .sum::<usize>()
    }

    /// Signal shutdown and wait for every worker to drain and exit.
    pub fn shutdown(mut self) {
        self.shared.shutdown.store(true, Ordering::Release);
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
    }
}

fn worker_loop<T, F>(worker_id: usize, shared: &PoolShared<T>, job: &F)
where
    F: Fn(T, &WorkerContext<'_, T>),
{
    let deque = shared.deques[worker_id].clone();
    let ctx = WorkerContext { worker_id, shared };
    let mut misses: u32 = 0;

    loop {
        if shared.cancel.load(Ordering::Acquire) {
            break;
        }

        // Adopt externally submitted tasks through the owner's own push.
        {
            let mut inbox = shared.inboxes[worker_id].lock();
            while let Some(task) = inbox.pop_front() {
                deque.push(task);
            }
        }

        let task = deque
            .pop()
            .or_else(|| shared.global.pop().map(|(_, task)| task))
            .or_else(|| steal_once(worker_id, shared));

        match task {
            Some(task) => {
                misses = 0;
                shared.active.fetch_add(1, Ordering::AcqRel);
                job(task, &ctx);
                shared.active.fetch_sub(1, Ordering::AcqRel);
            }
            None => {
                if shared.shutdown.load(Ordering::Acquire)
                    && shared.active.load(Ordering::Acquire) == 0
                    && !shared.anything_queued()
                {
                    // Re-check after a beat: a peer may be between its
                    // pop and the active-count bump.
                    std::thread::sleep(Duration::from_millis(1));
                    if shared.active.load(Ordering::Acquire) == 0
                        && !shared.anything_queued()
                    {
                        break;
                    }
                    continue;
                }
                misses = misses.saturating_add(1);
                if misses <= SPIN_MISSES {
                    std::hint::spin_loop();
                } else {
                    let exp = (misses - SPIN_MISSES).min(11);
                    let backoff =
                        Duration::from_micros(1u64 << exp).min(MAX_BACKOFF);
                    std::thread::sleep(backoff);
                }
            }
        }
    }
}

/// One steal attempt against a random victim.
fn steal_once<T>(worker_id: usize, shared: &PoolShared<T>) -> Option<T> {
    let workers = shared.deques.len();
    if workers <= 1 {
        return None;
    }
    let victim = {
        let mut rng = rand::thread_rng();
        let mut v = rng.gen_range(0..workers);
        if v == worker_id {
            v = (v + 1) % workers;
        }
        v
    };
    match shared.deques[victim].steal() {
        Steal::Success(task) => Some(task),
        Steal::Empty | Steal::Retry => None,
    }
}
