//! Elastic worker-thread pool.
//!
//! One mutex guards a FIFO task queue and two counters (`num_workers`,
//! `num_idle_workers`); two condition variables signal "queue has work"
//! and "a worker may be reclaimed". A cleaner thread wakes every ~10s and
//! asks one idle worker to exit if the pool is above `min_workers`,
//! sleeping on `cleanable` with no timeout when there's nothing to
//! reclaim -- it relies entirely on a worker's `notify` to wake it early.
//!
//! Grounded directly in `original_source/fastcgi/wsgi.py`'s
//! `ThreadPoolExecutor`.

use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::Duration;

use log::{debug, warn};

type Task = Box<dyn FnOnce() + Send + 'static>;

struct PoolState {
    queue: VecDeque<Option<Task>>,
    num_workers: usize,
    num_idle_workers: usize,
}

struct PoolInner {
    min_workers: usize,
    max_workers: usize,
    lock: Mutex<PoolState>,
    queue_nonempty: Condvar,
    cleanable: Condvar,
}

/// A pool of worker threads that grows on demand up to `max_workers` and
/// shrinks back toward `min_workers` when idle.
#[derive(Clone)]
pub struct WorkerPool {
    inner: Arc<PoolInner>,
}

impl WorkerPool {
    /// `min_workers` defaults to [`std::thread::available_parallelism`]
    /// (falling back to 1), matching `os.cpu_count()` in the original.
    /// `max_workers` is coerced to be at least `min_workers`.
    pub fn new(min_workers: Option<usize>, max_workers: usize) -> Self {
        let min_workers = min_workers.unwrap_or_else(|| {
            thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        });
        let max_workers = max_workers.max(min_workers);

        let inner = Arc::new(PoolInner {
            min_workers,
            max_workers,
            lock: Mutex::new(PoolState {
                queue: VecDeque::new(),
                num_workers: 0,
                num_idle_workers: 0,
            }),
            queue_nonempty: Condvar::new(),
            cleanable: Condvar::new(),
        });

        let cleaner_inner = inner.clone();
        thread::spawn(move || cleaner_loop(cleaner_inner));

        WorkerPool { inner }
    }

    /// Enqueue a task. Wakes an idle worker if one exists, else spawns a
    /// new worker (up to `max_workers`); beyond that, the task waits in
    /// the queue for the next worker to free up.
    pub fn submit<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let mut state = self.inner.lock.lock().unwrap();
        state.queue.push_back(Some(Box::new(task)));
        if state.num_idle_workers > 0 {
            self.inner.queue_nonempty.notify_one();
        } else if state.num_workers < self.inner.max_workers {
            state.num_workers += 1;
            let inner = self.inner.clone();
            thread::spawn(move || worker_loop(inner));
        }
    }
}

fn worker_loop(inner: Arc<PoolInner>) {
    loop {
        let item = {
            let mut state = inner.lock.lock().unwrap();
            state.num_idle_workers += 1;
            if state.num_workers > inner.min_workers {
                inner.cleanable.notify_one();
            }
            let mut state = inner
                .queue_nonempty
                .wait_while(state, |s| s.queue.is_empty())
                .unwrap();
            let item = state.queue.pop_front().unwrap();
            state.num_idle_workers -= 1;
            item
        };

        match item {
            None => break,
            Some(task) => {
                if let Err(payload) = catch_unwind(AssertUnwindSafe(task)) {
                    warn!("worker task panicked: {}", panic_message(&payload));
                }
            }
        }
    }

    let mut state = inner.lock.lock().unwrap();
    state.num_workers -= 1;
}

fn cleaner_loop(inner: Arc<PoolInner>) {
    loop {
        thread::sleep(Duration::from_secs(10));
        let mut state = inner.lock.lock().unwrap();
        if state.num_workers > inner.min_workers && state.num_idle_workers > 0 {
            state.queue.push_back(None);
            inner.queue_nonempty.notify_one();
        } else {
            debug!(
                "cleaner idle: {} workers, {} idle",
                state.num_workers, state.num_idle_workers
            );
            let _unused = inner.cleanable.wait(state).unwrap();
            // falls through back to the top of the loop (sleep again)
        }
    }
}

fn panic_message(payload: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::time::Duration as StdDuration;

    #[test]
    fn submit_runs_task() {
        let pool = WorkerPool::new(Some(1), 2);
        let (tx, rx) = mpsc::channel();
        pool.submit(move || {
            tx.send(42).unwrap();
        });
        let got = rx.recv_timeout(StdDuration::from_secs(2)).unwrap();
        assert_eq!(got, 42);
    }

    #[test]
    fn submit_many_tasks_all_run() {
        let pool = WorkerPool::new(Some(2), 4);
        let (tx, rx) = mpsc::channel();
        for i in 0..20 {
            let tx = tx.clone();
            pool.submit(move || {
                tx.send(i).unwrap();
            });
        }
        drop(tx);
        let mut results: Vec<i32> = rx.iter().collect();
        results.sort();
        assert_eq!(results, (0..20).collect::<Vec<_>>());
    }

    #[test]
    fn min_workers_defaults_to_available_parallelism() {
        let pool = WorkerPool::new(None, 10);
        assert!(pool.inner.min_workers >= 1);
        assert!(pool.inner.max_workers >= pool.inner.min_workers);
    }

    #[test]
    fn max_workers_coerced_to_at_least_min_workers() {
        let pool = WorkerPool::new(Some(5), 1);
        assert_eq!(pool.inner.max_workers, 5);
    }

    #[test]
    fn panicking_task_does_not_kill_the_pool() {
        let pool = WorkerPool::new(Some(1), 1);
        pool.submit(|| panic!("boom"));
        let (tx, rx) = mpsc::channel();
        pool.submit(move || {
            tx.send(()).unwrap();
        });
        rx.recv_timeout(StdDuration::from_secs(2))
            .expect("pool should keep serving tasks after a panic");
    }
}
