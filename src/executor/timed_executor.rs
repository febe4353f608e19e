use super::timed_queue::{Task, TaskId, TimedQueue};
use crate::core::{CacheError, Result};
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{Level, event};

/// What happens to tasks that are still queued when the executor shuts down
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PendingTasks {
    /// Drop them without running
    #[default]
    Cancel,
    /// Run them right away, ignoring their remaining delay
    Drain,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShutdownPolicy {
    pub pending: PendingTasks,
    /// Block until every worker thread has exited
    pub wait: bool,
}

impl ShutdownPolicy {
    pub fn cancel() -> Self {
        Self {
            pending: PendingTasks::Cancel,
            wait: true,
        }
    }

    pub fn drain() -> Self {
        Self {
            pending: PendingTasks::Drain,
            wait: true,
        }
    }

    pub fn no_wait(mut self) -> Self {
        self.wait = false;
        self
    }
}

struct ExecutorState {
    queue: TimedQueue,
    shutdown: Option<PendingTasks>,
    running: usize,
}

struct Shared {
    state: Mutex<ExecutorState>,
    wakeup: Condvar,
}

/// Handle to a task submitted to a [`TimedExecutor`]
#[derive(Clone)]
pub struct ScheduledTask {
    id: TaskId,
    due: Instant,
    shared: Weak<Shared>,
}

impl ScheduledTask {
    pub fn due(&self) -> Instant {
        self.due
    }

    /// Removes the task from the queue. Returns `false` if it already started or was cancelled.
    pub fn cancel(&self) -> bool {
        let Some(shared) = self.shared.upgrade() else {
            return false;
        };
        let task = shared.state.lock().queue.cancel(self.id);
        task.is_some()
    }

    /// True while the task is still queued
    pub fn is_pending(&self) -> bool {
        self.shared
            .upgrade()
            .is_some_and(|shared| shared.state.lock().queue.contains(self.id))
    }
}

impl std::fmt::Debug for ScheduledTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScheduledTask")
            .field("id", &self.id)
            .field("due", &self.due)
            .finish()
    }
}

/// Fixed pool of worker threads running callbacks at (or after) their due time.
///
/// Whichever worker polls next always takes the globally earliest task; ties run in
/// submission order.
pub struct TimedExecutor {
    shared: Arc<Shared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl TimedExecutor {
    pub fn new(workers: usize) -> Result<Self> {
        Self::with_name("timed-executor", workers)
    }

    pub fn with_name(name: &str, workers: usize) -> Result<Self> {
        if workers == 0 {
            return Err(CacheError::InvalidConfig(
                "timed executor needs at least one worker".to_string(),
            ));
        }

        let shared = Arc::new(Shared {
            state: Mutex::new(ExecutorState {
                queue: TimedQueue::new(),
                shutdown: None,
                running: 0,
            }),
            wakeup: Condvar::new(),
        });

        let mut handles = Vec::with_capacity(workers);
        for index in 0..workers {
            let worker_shared = Arc::clone(&shared);
            let handle = thread::Builder::new()
                .name(format!("{}-{}", name, index))
                .spawn(move || worker_loop(worker_shared))
                .map_err(|e| CacheError::IoError(format!("Failed to spawn worker: {}", e)))?;
            handles.push(handle);
        }

        Ok(Self {
            shared,
            workers: Mutex::new(handles),
        })
    }

    pub fn execute_after<F>(&self, delay: Duration, task: F) -> Result<ScheduledTask>
    where
        F: FnOnce() + Send + 'static,
    {
        self.execute_at(Instant::now() + delay, task)
    }

    pub fn execute_at<F>(&self, due: Instant, task: F) -> Result<ScheduledTask>
    where
        F: FnOnce() + Send + 'static,
    {
        let mut state = self.shared.state.lock();
        if state.shutdown.is_some() {
            return Err(CacheError::ExecutorShutdown);
        }
        let id = state.queue.push(due, Box::new(task));
        drop(state);
        self.shared.wakeup.notify_one();

        Ok(ScheduledTask {
            id,
            due,
            shared: Arc::downgrade(&self.shared),
        })
    }

    /// Tasks still waiting in the queue
    pub fn pending_count(&self) -> usize {
        self.shared.state.lock().queue.len()
    }

    /// Tasks currently executing on a worker
    pub fn running_count(&self) -> usize {
        self.shared.state.lock().running
    }

    pub fn is_shutdown(&self) -> bool {
        self.shared.state.lock().shutdown.is_some()
    }

    pub fn shutdown(&self, policy: ShutdownPolicy) {
        let cancelled = {
            let mut state = self.shared.state.lock();
            match (state.shutdown, policy.pending) {
                (None, pending) => state.shutdown = Some(pending),
                (Some(PendingTasks::Drain), PendingTasks::Cancel) => {
                    state.shutdown = Some(PendingTasks::Cancel)
                }
                _ => {}
            }
            if state.shutdown == Some(PendingTasks::Cancel) {
                state.queue.drain_all()
            } else {
                Vec::new()
            }
        };
        self.shared.wakeup.notify_all();

        if !cancelled.is_empty() {
            event!(Level::DEBUG, cancelled = cancelled.len(), "timed executor dropped pending tasks");
        }
        drop(cancelled);

        if policy.wait {
            self.join_workers();
        }
    }

    fn join_workers(&self) {
        let handles: Vec<JoinHandle<()>> = self.workers.lock().drain(..).collect();
        let current = thread::current().id();
        for handle in handles {
            // A task may shut down its own executor; a worker cannot join itself.
            if handle.thread().id() == current {
                continue;
            }
            if handle.join().is_err() {
                event!(Level::ERROR, "timed executor worker exited with a panic");
            }
        }
    }
}

impl Drop for TimedExecutor {
    fn drop(&mut self) {
        self.shutdown(ShutdownPolicy::cancel());
    }
}

fn worker_loop(shared: Arc<Shared>) {
    let mut state = shared.state.lock();
    loop {
        let shutdown = state.shutdown;
        match shutdown {
            Some(PendingTasks::Cancel) => break,
            Some(PendingTasks::Drain) => match state.queue.pop_next() {
                Some(task) => run_unlocked(&mut state, task),
                None => break,
            },
            None => match state.queue.next_due() {
                None => shared.wakeup.wait(&mut state),
                Some(due) if due > Instant::now() => {
                    shared.wakeup.wait_until(&mut state, due);
                }
                Some(_) => {
                    if let Some(task) = state.queue.pop_due(Instant::now()) {
                        run_unlocked(&mut state, task);
                    }
                }
            },
        }
    }
}

fn run_unlocked(state: &mut MutexGuard<'_, ExecutorState>, task: Task) {
    state.running += 1;
    MutexGuard::unlocked(state, || {
        if catch_unwind(AssertUnwindSafe(task)).is_err() {
            event!(Level::ERROR, "timed task panicked");
        }
    });
    state.running -= 1;
}
