//! A small worker pool for short, non-blocking tasks.
//!
//! Tasks are boxed closures pushed onto one shared queue and executed by a
//! fixed set of worker threads. Waiting on a task never idles the caller
//! while there is queued work: [`TaskSystem::wait`] keeps pulling tasks off
//! the queue and running them inline until the awaited task completes.
//!
//! # Example
//!
//! ```
//! use inflight_core::tasks::TaskSystem;
//!
//! let tasks = TaskSystem::new(2);
//! let handles: Vec<_> = (0..4u32).map(|i| tasks.spawn(move || i * 10)).collect();
//! let results: Vec<u32> = handles.into_iter().map(|h| tasks.wait(h)).collect();
//! assert_eq!(results, vec![0, 10, 20, 30]);
//! ```

use std::any::Any;
use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;

use parking_lot::{Condvar, Mutex};

type Job = Box<dyn FnOnce() + Send + 'static>;

struct Queue {
    jobs: Mutex<VecDeque<Job>>,
    available: Condvar,
    shutdown: AtomicBool,
}

impl Queue {
    fn pop(&self) -> Option<Job> {
        self.jobs.lock().pop_front()
    }
}

enum Outcome<T> {
    Running,
    Finished(T),
    Panicked(Box<dyn Any + Send + 'static>),
}

struct TaskState<T> {
    outcome: Mutex<Outcome<T>>,
    finished: Condvar,
}

/// Handle to a spawned task.
///
/// Pass it to [`TaskSystem::wait`] to obtain the task's result.
pub struct TaskHandle<T> {
    state: Arc<TaskState<T>>,
}

impl<T> TaskHandle<T> {
    /// Returns true once the task has run to completion (or panicked).
    pub fn is_finished(&self) -> bool {
        !matches!(*self.state.outcome.lock(), Outcome::Running)
    }
}

impl<T> std::fmt::Debug for TaskHandle<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskHandle")
            .field("finished", &self.is_finished())
            .finish()
    }
}

/// Fixed-size pool of worker threads with a work-stealing wait.
///
/// A pool created with zero workers is valid: tasks then only run when some
/// thread waits on them, which makes execution fully deterministic.
pub struct TaskSystem {
    queue: Arc<Queue>,
    workers: Vec<JoinHandle<()>>,
}

impl TaskSystem {
    /// Creates a pool with `num_threads` worker threads.
    pub fn new(num_threads: usize) -> Self {
        let queue = Arc::new(Queue {
            jobs: Mutex::new(VecDeque::new()),
            available: Condvar::new(),
            shutdown: AtomicBool::new(false),
        });

        let workers = (0..num_threads)
            .filter_map(|index| {
                let queue = Arc::clone(&queue);
                std::thread::Builder::new()
                    .name(format!("inflight-worker-{index}"))
                    .spawn(move || worker_loop(&queue))
                    .map_err(|e| log::warn!("Failed to spawn worker thread {index}: {e}"))
                    .ok()
            })
            .collect::<Vec<_>>();

        log::debug!("Task system started with {} workers", workers.len());
        Self { queue, workers }
    }

    /// Creates a pool leaving one core for the orchestrating thread.
    pub fn default_threads() -> Self {
        let cores = std::thread::available_parallelism().map_or(1, |n| n.get());
        Self::new(cores.saturating_sub(1).max(1))
    }

    /// Number of worker threads (excluding threads that help while waiting).
    pub fn num_threads(&self) -> usize {
        self.workers.len()
    }

    /// Number of tasks queued but not yet picked up.
    pub fn queued(&self) -> usize {
        self.queue.jobs.lock().len()
    }

    /// Queue a task for execution.
    pub fn spawn<T, F>(&self, f: F) -> TaskHandle<T>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let state = Arc::new(TaskState {
            outcome: Mutex::new(Outcome::Running),
            finished: Condvar::new(),
        });

        let task_state = Arc::clone(&state);
        let job: Job = Box::new(move || {
            let outcome = match panic::catch_unwind(AssertUnwindSafe(f)) {
                Ok(value) => Outcome::Finished(value),
                Err(payload) => Outcome::Panicked(payload),
            };
            *task_state.outcome.lock() = outcome;
            task_state.finished.notify_all();
        });

        self.queue.jobs.lock().push_back(job);
        self.queue.available.notify_one();

        TaskHandle { state }
    }

    /// Run one queued task on the calling thread.
    ///
    /// Returns false if the queue was empty.
    pub fn try_run_one(&self) -> bool {
        match self.queue.pop() {
            Some(job) => {
                job();
                true
            }
            None => false,
        }
    }

    /// Wait for a task and return its result.
    ///
    /// While the task is incomplete the caller executes other queued tasks.
    /// A panic inside the task is resumed on the caller.
    pub fn wait<T>(&self, handle: TaskHandle<T>) -> T {
        loop {
            if handle.is_finished() {
                break;
            }
            if self.try_run_one() {
                continue;
            }
            // Nothing left to help with: the task is running on a worker.
            let mut outcome = handle.state.outcome.lock();
            if matches!(*outcome, Outcome::Running) {
                handle.state.finished.wait(&mut outcome);
            }
        }

        let outcome = std::mem::replace(&mut *handle.state.outcome.lock(), Outcome::Running);
        match outcome {
            Outcome::Finished(value) => value,
            Outcome::Panicked(payload) => panic::resume_unwind(payload),
            Outcome::Running => unreachable!("task reported finished without an outcome"),
        }
    }

    /// Wait for every handle, returning results in order.
    pub fn wait_all<T>(&self, handles: impl IntoIterator<Item = TaskHandle<T>>) -> Vec<T> {
        handles.into_iter().map(|handle| self.wait(handle)).collect()
    }
}

impl Default for TaskSystem {
    fn default() -> Self {
        Self::default_threads()
    }
}

impl std::fmt::Debug for TaskSystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskSystem")
            .field("workers", &self.workers.len())
            .field("queued", &self.queued())
            .finish()
    }
}

impl Drop for TaskSystem {
    fn drop(&mut self) {
        self.queue.shutdown.store(true, Ordering::Release);
        {
            // Take the lock so no worker misses the wakeup between its check and its wait.
            let _jobs = self.queue.jobs.lock();
            self.queue.available.notify_all();
        }
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
        // Anything still queued runs here so no handle is left pending forever.
        while self.try_run_one() {}
    }
}

fn worker_loop(queue: &Queue) {
    crate::set_thread_name!("inflight worker");
    loop {
        let job = {
            let mut jobs = queue.jobs.lock();
            loop {
                if let Some(job) = jobs.pop_front() {
                    break Some(job);
                }
                if queue.shutdown.load(Ordering::Acquire) {
                    break None;
                }
                queue.available.wait(&mut jobs);
            }
        };

        match job {
            Some(job) => {
                crate::profile_scope!("worker_task");
                job();
            }
            None => return,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    #[test]
    fn test_spawn_and_wait() {
        let tasks = TaskSystem::new(2);
        let handle = tasks.spawn(|| 21 * 2);
        assert_eq!(tasks.wait(handle), 42);
    }

    #[test]
    fn test_zero_workers_runs_on_wait() {
        let tasks = TaskSystem::new(0);
        let counter = Arc::new(AtomicU32::new(0));

        let c = Arc::clone(&counter);
        let handle = tasks.spawn(move || c.fetch_add(1, Ordering::SeqCst));
        assert_eq!(counter.load(Ordering::SeqCst), 0);
        assert!(!handle.is_finished());

        tasks.wait(handle);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_wait_helps_with_other_tasks() {
        let tasks = TaskSystem::new(0);
        let counter = Arc::new(AtomicU32::new(0));

        let mut handles = Vec::new();
        for _ in 0..5 {
            let c = Arc::clone(&counter);
            handles.push(tasks.spawn(move || {
                c.fetch_add(1, Ordering::SeqCst);
            }));
        }

        // Waiting on the last task drains every task queued ahead of it.
        let last = handles.pop().unwrap();
        tasks.wait(last);
        assert_eq!(counter.load(Ordering::SeqCst), 5);
        assert!(handles.iter().all(|h| h.is_finished()));
    }

    #[test]
    fn test_wait_all_preserves_order() {
        let tasks = TaskSystem::new(4);
        let handles: Vec<_> = (0..32u32).map(|i| tasks.spawn(move || i * i)).collect();
        let results = tasks.wait_all(handles);
        assert_eq!(results, (0..32u32).map(|i| i * i).collect::<Vec<_>>());
    }

    #[test]
    #[should_panic(expected = "task failed")]
    fn test_panic_is_resumed_on_waiter() {
        let tasks = TaskSystem::new(1);
        let handle = tasks.spawn(|| -> u32 { panic!("task failed") });
        tasks.wait(handle);
    }

    #[test]
    fn test_drop_runs_remaining_tasks() {
        let counter = Arc::new(AtomicU32::new(0));
        {
            let tasks = TaskSystem::new(0);
            for _ in 0..3 {
                let c = Arc::clone(&counter);
                tasks.spawn(move || c.fetch_add(1, Ordering::SeqCst));
            }
        }
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }
}
