use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::Duration;

use crate::core::cancel::CancelToken;
use crate::core::error::TaskError;

/// A queued unit of fan-out work. Tasks receive a cancellation token derived
/// from the executor root (and cancelled on task timeout) and must check it
/// at their own blocking points.
pub type Task = Box<dyn FnOnce(&CancelToken) -> anyhow::Result<()> + Send + 'static>;

#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    pub min_workers: usize,
    pub max_workers: usize,
    pub queue_capacity: usize,
    /// Idle workers above `min_workers` exit after this long without work.
    pub idle_timeout: Duration,
    /// Per-task budget; the task's token is cancelled when it elapses.
    /// None disables the watchdog.
    pub task_timeout: Option<Duration>,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            min_workers: 1,
            max_workers: 8,
            queue_capacity: 64,
            idle_timeout: Duration::from_secs(30),
            task_timeout: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutorStats {
    pub workers: usize,
    pub busy: usize,
    pub queued: usize,
    pub completed: u64,
    pub failed: u64,
}

struct ExecState {
    queue: VecDeque<Task>,
    workers: usize,
    busy: usize,
    shutting_down: bool,
    completed: u64,
    failed: u64,
}

struct Inner {
    config: ExecutorConfig,
    state: Mutex<ExecState>,
    // Workers park here waiting for tasks; submitters park on `space_cv`
    // when the queue is at capacity.
    work_cv: Condvar,
    space_cv: Condvar,
    root: CancelToken,
}

/// Capacity-bounded elastic executor for fan-out sub-tasks (parallel decode,
/// upload). Worker threads scale between `min_workers` and `max_workers`
/// based on queue pressure and idle out on their own; panics inside tasks
/// are caught and counted as failures.
pub struct Executor {
    inner: Arc<Inner>,
    handles: Mutex<Vec<thread::JoinHandle<()>>>,
}

impl Executor {
    pub fn new(config: ExecutorConfig, parent: &CancelToken) -> Arc<Self> {
        let min = config.min_workers.min(config.max_workers);
        let inner = Arc::new(Inner {
            config: config.clone(),
            state: Mutex::new(ExecState {
                queue: VecDeque::new(),
                workers: 0,
                busy: 0,
                shutting_down: false,
                completed: 0,
                failed: 0,
            }),
            work_cv: Condvar::new(),
            space_cv: Condvar::new(),
            root: parent.child(),
        });
        let executor = Arc::new(Self {
            inner,
            handles: Mutex::new(Vec::new()),
        });
        for _ in 0..min {
            executor.spawn_worker();
        }
        executor
    }

    /// Enqueue a task. Blocks while the queue is at capacity and fails with
    /// `Shutdown` once the executor is stopping.
    pub fn submit(&self, task: Task) -> Result<(), TaskError> {
        let should_spawn = {
            let mut state = self.inner.state.lock().expect("executor state poisoned");
            loop {
                if state.shutting_down {
                    return Err(TaskError::Shutdown);
                }
                if state.queue.len() < self.inner.config.queue_capacity {
                    break;
                }
                state = self
                    .inner
                    .space_cv
                    .wait(state)
                    .expect("executor state poisoned");
            }
            state.queue.push_back(task);
            self.inner.work_cv.notify_one();

            // Scale up while queue depth outstrips the busy set. The count
            // is bumped here, under the lock, so racing submitters cannot
            // overshoot `max_workers`.
            if state.queue.len() > state.busy && state.workers < self.inner.config.max_workers {
                state.workers += 1;
                true
            } else {
                false
            }
        };
        if should_spawn {
            self.spawn_thread();
        }
        Ok(())
    }

    fn spawn_worker(&self) {
        {
            let mut state = self.inner.state.lock().expect("executor state poisoned");
            state.workers += 1;
        }
        self.spawn_thread();
    }

    fn spawn_thread(&self) {
        let inner = self.inner.clone();
        let handle = thread::Builder::new()
            .name("clipforge-exec".to_string())
            .spawn(move || worker_loop(&inner))
            .expect("failed to spawn executor worker thread");
        self.handles
            .lock()
            .expect("executor handles lock poisoned")
            .push(handle);
    }

    pub fn stats(&self) -> ExecutorStats {
        let state = self.inner.state.lock().expect("executor state poisoned");
        ExecutorStats {
            workers: state.workers,
            busy: state.busy,
            queued: state.queue.len(),
            completed: state.completed,
            failed: state.failed,
        }
    }

    /// Stop accepting work, cancel the root token, let in-flight tasks
    /// finish, and join every worker. Queued-but-unstarted tasks are
    /// dropped and counted as failed.
    pub fn shutdown(&self) {
        {
            let mut state = self.inner.state.lock().expect("executor state poisoned");
            if state.shutting_down {
                return;
            }
            state.shutting_down = true;
            state.failed += state.queue.len() as u64;
            state.queue.clear();
        }
        self.inner.root.cancel();
        self.inner.work_cv.notify_all();
        self.inner.space_cv.notify_all();

        let handles: Vec<_> = self
            .handles
            .lock()
            .expect("executor handles lock poisoned")
            .drain(..)
            .collect();
        for handle in handles {
            let _ = handle.join();
        }
    }
}

fn worker_loop(inner: &Arc<Inner>) {
    loop {
        let task = {
            let mut state = inner.state.lock().expect("executor state poisoned");
            loop {
                if let Some(task) = state.queue.pop_front() {
                    state.busy += 1;
                    inner.space_cv.notify_one();
                    break Some(task);
                }
                if state.shutting_down {
                    state.workers -= 1;
                    break None;
                }
                let (guard, timeout) = inner
                    .work_cv
                    .wait_timeout(state, inner.config.idle_timeout)
                    .expect("executor state poisoned");
                state = guard;
                if timeout.timed_out()
                    && state.queue.is_empty()
                    && state.workers > inner.config.min_workers
                {
                    state.workers -= 1;
                    break None;
                }
            }
        };
        let Some(task) = task else {
            return;
        };

        let token = inner.root.child();
        let watchdog = inner
            .config
            .task_timeout
            .map(|timeout| spawn_watchdog(token.clone(), timeout));

        let result = catch_unwind(AssertUnwindSafe(|| task(&token)));

        if let Some(watchdog) = watchdog {
            watchdog.disarm();
        }

        let mut state = inner.state.lock().expect("executor state poisoned");
        state.busy -= 1;
        match result {
            Ok(Ok(())) => state.completed += 1,
            Ok(Err(_)) | Err(_) => state.failed += 1,
        }
    }
}

struct Watchdog {
    done: Arc<(Mutex<bool>, Condvar)>,
}

impl Watchdog {
    fn disarm(self) {
        let (lock, cv) = &*self.done;
        *lock.lock().expect("watchdog lock poisoned") = true;
        cv.notify_all();
    }
}

/// Cancel `token` after `timeout` unless disarmed first. The watchdog
/// thread exits as soon as either side resolves.
fn spawn_watchdog(token: CancelToken, timeout: Duration) -> Watchdog {
    let done = Arc::new((Mutex::new(false), Condvar::new()));
    let done_for_thread = done.clone();
    thread::Builder::new()
        .name("clipforge-exec-watchdog".to_string())
        .spawn(move || {
            let (lock, cv) = &*done_for_thread;
            let guard = lock.lock().expect("watchdog lock poisoned");
            let (guard, _timeout) = cv
                .wait_timeout_while(guard, timeout, |finished| !*finished)
                .expect("watchdog lock poisoned");
            if !*guard {
                token.cancel();
            }
        })
        .expect("failed to spawn executor watchdog thread");
    Watchdog { done }
}
