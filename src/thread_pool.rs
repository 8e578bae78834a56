use std::{
    any::Any,
    collections::VecDeque,
    panic::{self, AssertUnwindSafe},
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex,
    },
    thread::{Builder, JoinHandle},
};

use serde::Deserialize;

use crate::{
    error::{Error, Result},
    sync::{lock, Semaphore},
};

pub const DEFAULT_POOL_CAPACITY: usize = 8;
pub const DEFAULT_QUEUE_CAPACITY: usize = 10_000;

/// Unit of work executed by a worker thread.
///
/// The server submits one task per readable dispatch; each task services one
/// connection. An `Err` is logged and counted, it never stops the worker.
pub type Task = Box<dyn FnOnce() -> Result<()> + Send + 'static>;

/// What [`WorkerPool::submit`] does when the queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubmitPolicy {
    /// Wait for a free slot. Under sustained overload the submitting thread
    /// (the main loop) stalls, pushing backpressure onto the listen backlog.
    #[default]
    Block,
    /// Fail immediately with [`Error::QueueFull`].
    Reject,
}

struct Shared {
    queue: Mutex<VecDeque<Task>>,
    /// One permit per queued task.
    pending: Semaphore,
    /// One permit per free queue slot.
    vacancies: Semaphore,
    shutdown: AtomicBool,
    completed: AtomicU64,
    failed: AtomicU64,
}

/// Fixed set of worker threads consuming a bounded FIFO queue.
pub struct WorkerPool {
    workers: Vec<JoinHandle<()>>,
    shared: Arc<Shared>,
    policy: SubmitPolicy,
    capacity: usize,
}

impl WorkerPool {
    pub fn new(workers: usize, capacity: usize, policy: SubmitPolicy) -> Result<Self> {
        if workers == 0 {
            return Err(Error::Config("worker pool needs at least one thread".into()));
        }
        if capacity == 0 {
            return Err(Error::Config("worker queue capacity must be non-zero".into()));
        }

        let shared = Arc::new(Shared {
            queue: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            pending: Semaphore::new(0),
            vacancies: Semaphore::new(capacity),
            shutdown: AtomicBool::new(false),
            completed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        });

        let mut pool = Self {
            workers: Vec::with_capacity(workers),
            shared,
            policy,
            capacity,
        };

        for id in 0..workers {
            let shared = Arc::clone(&pool.shared);
            let thread = Builder::new()
                .name(format!("mill-worker-{id}"))
                .spawn(move || Self::work(id, &shared))?;
            pool.workers.push(thread);
        }

        tracing::debug!(workers, capacity, ?policy, "worker pool started");

        Ok(pool)
    }

    /// Queue a task. FIFO: tasks are popped in submission order.
    pub fn submit(&self, task: Task) -> Result<()> {
        if self.shared.shutdown.load(Ordering::Acquire) {
            return Err(Error::PoolShutdown);
        }

        let reserved = match self.policy {
            SubmitPolicy::Block => self.shared.vacancies.acquire(),
            SubmitPolicy::Reject => {
                if !self.shared.vacancies.try_acquire() {
                    return Err(Error::QueueFull);
                }
                true
            }
        };
        if !reserved || self.shared.shutdown.load(Ordering::Acquire) {
            return Err(Error::PoolShutdown);
        }

        lock(&self.shared.queue).push_back(task);
        self.shared.pending.release();
        Ok(())
    }

    pub fn exec<F>(&self, task: F) -> Result<()>
    where
        F: FnOnce() -> Result<()> + Send + 'static,
    {
        self.submit(Box::new(task))
    }

    pub fn workers_len(&self) -> usize {
        self.workers.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn policy(&self) -> SubmitPolicy {
        self.policy
    }

    /// Tasks waiting for a worker.
    pub fn queued(&self) -> usize {
        lock(&self.shared.queue).len()
    }

    /// Tasks that returned `Ok`.
    pub fn completed(&self) -> u64 {
        self.shared.completed.load(Ordering::Relaxed)
    }

    /// Tasks that returned `Err` or panicked.
    pub fn failed(&self) -> u64 {
        self.shared.failed.load(Ordering::Relaxed)
    }

    /// Stop accepting work, let the workers drain the queue, join them.
    pub fn shutdown(&mut self) {
        if self.workers.is_empty() {
            return;
        }
        self.shared.shutdown.store(true, Ordering::Release);
        self.shared.pending.close();
        self.shared.vacancies.close();

        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
        tracing::debug!(
            completed = self.completed(),
            failed = self.failed(),
            "worker pool stopped"
        );
    }

    fn work(id: usize, shared: &Shared) {
        while shared.pending.acquire() {
            let Some(task) = lock(&shared.queue).pop_front() else {
                continue;
            };
            shared.vacancies.release();

            match panic::catch_unwind(AssertUnwindSafe(task)) {
                Ok(Ok(())) => {
                    shared.completed.fetch_add(1, Ordering::Relaxed);
                }
                Ok(Err(e)) => {
                    shared.failed.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(worker = id, error = %e, "task failed");
                }
                Err(payload) => {
                    shared.failed.fetch_add(1, Ordering::Relaxed);
                    tracing::error!(
                        worker = id,
                        panic = panic_message(payload.as_ref()),
                        "task panicked"
                    );
                }
            }
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "<non-string panic payload>"
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{
            atomic::{AtomicUsize, Ordering},
            mpsc, Arc, Mutex,
        },
        thread,
        time::Duration,
    };

    use super::*;

    fn wait_for(counter: &AtomicUsize, expected: usize) {
        for _ in 0..200 {
            if counter.load(Ordering::SeqCst) == expected {
                return;
            }
            thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(counter.load(Ordering::SeqCst), expected);
    }

    #[test]
    fn test_thread_pool_creation() {
        let pool = WorkerPool::new(4, 16, SubmitPolicy::Block).unwrap();
        assert_eq!(pool.workers_len(), 4);
        assert_eq!(pool.capacity(), 16);
    }

    #[test]
    fn test_rejects_empty_configuration() {
        assert!(matches!(
            WorkerPool::new(0, 16, SubmitPolicy::Block),
            Err(Error::Config(_))
        ));
        assert!(matches!(
            WorkerPool::new(2, 0, SubmitPolicy::Block),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_task_execution() {
        let pool = WorkerPool::new(2, 8, SubmitPolicy::Block).unwrap();
        let counter = Arc::new(AtomicUsize::new(0));
        let counter_clone = counter.clone();

        pool.exec(move || {
            counter_clone.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .unwrap();

        wait_for(&counter, 1);
    }

    #[test]
    fn test_fifo_order_single_worker() {
        let pool = WorkerPool::new(1, 64, SubmitPolicy::Block).unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));

        for i in 0..50 {
            let seen = seen.clone();
            pool.exec(move || {
                seen.lock().unwrap().push(i);
                Ok(())
            })
            .unwrap();
        }
        drop(pool);

        assert_eq!(*seen.lock().unwrap(), (0..50).collect::<Vec<_>>());
    }

    #[test]
    fn test_concurrent_submit_runs_each_task_once() {
        const CAPACITY: usize = 8;
        const TASKS: usize = CAPACITY * 2;

        let pool = Arc::new(WorkerPool::new(4, CAPACITY, SubmitPolicy::Block).unwrap());
        let runs: Arc<Vec<AtomicUsize>> = Arc::new((0..TASKS).map(|_| AtomicUsize::new(0)).collect());

        let submitters: Vec<_> = (0..4)
            .map(|s| {
                let pool = pool.clone();
                let runs = runs.clone();
                thread::spawn(move || {
                    for i in (s..TASKS).step_by(4) {
                        let runs = runs.clone();
                        pool.exec(move || {
                            thread::sleep(Duration::from_millis(2));
                            runs[i].fetch_add(1, Ordering::SeqCst);
                            Ok(())
                        })
                        .unwrap();
                    }
                })
            })
            .collect();

        for s in submitters {
            s.join().unwrap();
        }
        let mut pool = Arc::try_unwrap(pool).ok().unwrap();
        pool.shutdown();

        assert!(runs.iter().all(|r| r.load(Ordering::SeqCst) == 1));
        assert_eq!(pool.completed(), TASKS as u64);
    }

    #[test]
    fn test_reject_policy_reports_queue_full() {
        let pool = WorkerPool::new(1, 2, SubmitPolicy::Reject).unwrap();
        let (started_tx, started_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel::<()>();

        pool.exec(move || {
            started_tx.send(()).unwrap();
            release_rx.recv().unwrap();
            Ok(())
        })
        .unwrap();
        started_rx.recv().unwrap();

        pool.exec(|| Ok(())).unwrap();
        pool.exec(|| Ok(())).unwrap();
        assert!(matches!(pool.exec(|| Ok(())), Err(Error::QueueFull)));
        assert_eq!(pool.queued(), 2);

        release_tx.send(()).unwrap();
        drop(pool);
    }

    #[test]
    fn test_block_policy_waits_for_space() {
        let pool = Arc::new(WorkerPool::new(1, 1, SubmitPolicy::Block).unwrap());
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let (started_tx, started_rx) = mpsc::channel();

        pool.exec(move || {
            started_tx.send(()).unwrap();
            release_rx.recv().unwrap();
            Ok(())
        })
        .unwrap();
        started_rx.recv().unwrap();
        pool.exec(|| Ok(())).unwrap();

        let submitted = Arc::new(AtomicUsize::new(0));
        let blocked = {
            let pool = pool.clone();
            let submitted = submitted.clone();
            thread::spawn(move || {
                pool.exec(|| Ok(())).unwrap();
                submitted.store(1, Ordering::SeqCst);
            })
        };

        thread::sleep(Duration::from_millis(50));
        assert_eq!(submitted.load(Ordering::SeqCst), 0);

        release_tx.send(()).unwrap();
        blocked.join().unwrap();
        assert_eq!(submitted.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_failures_do_not_kill_workers() {
        let pool = WorkerPool::new(1, 8, SubmitPolicy::Block).unwrap();
        let counter = Arc::new(AtomicUsize::new(0));

        pool.exec(|| Err(Error::handler("bad request"))).unwrap();
        pool.exec(|| panic!("handler blew up")).unwrap();

        let counter_clone = counter.clone();
        pool.exec(move || {
            counter_clone.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .unwrap();

        wait_for(&counter, 1);
        drop(pool);
    }

    #[test]
    fn test_pool_cleanup_drains_queue() {
        let counter = Arc::new(AtomicUsize::new(0));
        {
            let pool = WorkerPool::new(2, 8, SubmitPolicy::Block).unwrap();
            for _ in 0..6 {
                let counter_clone = counter.clone();
                pool.exec(move || {
                    thread::sleep(Duration::from_millis(10));
                    counter_clone.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
                .unwrap();
            }
        }

        assert_eq!(counter.load(Ordering::SeqCst), 6);
    }

    #[test]
    fn test_submit_after_shutdown() {
        let mut pool = WorkerPool::new(1, 4, SubmitPolicy::Block).unwrap();
        pool.shutdown();
        assert!(matches!(pool.exec(|| Ok(())), Err(Error::PoolShutdown)));
    }
}
