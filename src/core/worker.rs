use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use crate::core::cancel::CancelToken;
use crate::core::executor::Executor;
use crate::core::processor::JobProcessor;
use crate::core::queue::JobQueue;

/// Idle workers poll the queue on this interval.
const IDLE_POLL: Duration = Duration::from_millis(100);

struct WorkerHandle {
    // Cancelling this token retires the worker after its current job; the
    // job itself keeps running because attempts derive from the pool root,
    // not from the worker loop.
    token: CancelToken,
    handle: thread::JoinHandle<()>,
}

struct PoolState {
    workers: Vec<WorkerHandle>,
    retired: Vec<thread::JoinHandle<()>>,
    next_worker_id: u64,
}

/// Fixed-to-elastic set of long-running workers, each looping over the
/// queue and handing claimed jobs to the shared processor. `stop` cancels
/// the pool root (terminating in-flight attempts and their subprocesses),
/// joins every worker, then stops the fan-out executor.
pub struct WorkerPool {
    queue: JobQueue,
    processor: Arc<JobProcessor>,
    executor: Arc<Executor>,
    root: CancelToken,
    state: Mutex<PoolState>,
    active: Arc<AtomicUsize>,
}

impl WorkerPool {
    pub fn new(
        queue: JobQueue,
        processor: Arc<JobProcessor>,
        executor: Arc<Executor>,
        root: CancelToken,
    ) -> Self {
        Self {
            queue,
            processor,
            executor,
            root,
            state: Mutex::new(PoolState {
                workers: Vec::new(),
                retired: Vec::new(),
                next_worker_id: 0,
            }),
            active: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn start(&self, count: usize) {
        let mut state = self.state.lock().expect("worker pool lock poisoned");
        for _ in 0..count {
            self.spawn_locked(&mut state);
        }
    }

    /// Grow or shrink the worker set. Shrinking retires individual workers
    /// cooperatively: each finishes its current job before exiting.
    pub fn resize(&self, target: usize) {
        let mut state = self.state.lock().expect("worker pool lock poisoned");
        while state.workers.len() < target {
            self.spawn_locked(&mut state);
        }
        while state.workers.len() > target {
            let worker = state.workers.pop().expect("non-empty worker set");
            worker.token.cancel();
            state.retired.push(worker.handle);
        }
    }

    pub fn worker_count(&self) -> usize {
        self.state
            .lock()
            .expect("worker pool lock poisoned")
            .workers
            .len()
    }

    /// Workers currently inside `process(job)`.
    pub fn active_worker_count(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Cancel everything, wait for every worker (current and retired) to
    /// return, then stop the generic executor.
    pub fn stop(&self) {
        self.root.cancel();
        let (workers, retired) = {
            let mut state = self.state.lock().expect("worker pool lock poisoned");
            (
                std::mem::take(&mut state.workers),
                std::mem::take(&mut state.retired),
            )
        };
        for worker in workers {
            worker.token.cancel();
            let _ = worker.handle.join();
        }
        for handle in retired {
            let _ = handle.join();
        }
        self.executor.shutdown();
    }

    fn spawn_locked(&self, state: &mut PoolState) {
        let id = state.next_worker_id;
        state.next_worker_id += 1;

        let token = self.root.child();
        let queue = self.queue.clone();
        let processor = self.processor.clone();
        let job_parent = self.root.clone();
        let active = self.active.clone();
        let loop_token = token.clone();

        let handle = thread::Builder::new()
            .name(format!("clipforge-worker-{id}"))
            .spawn(move || worker_loop(&queue, &processor, &job_parent, &loop_token, &active))
            .expect("failed to spawn worker thread");

        state.workers.push(WorkerHandle { token, handle });
    }
}

fn worker_loop(
    queue: &JobQueue,
    processor: &Arc<JobProcessor>,
    job_parent: &CancelToken,
    loop_token: &CancelToken,
    active: &AtomicUsize,
) {
    loop {
        if loop_token.is_cancelled() {
            return;
        }
        match queue.dequeue() {
            Some(job) => {
                let job_id = job.id.clone();
                active.fetch_add(1, Ordering::SeqCst);
                let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                    processor.process(job, job_parent)
                }));
                active.fetch_sub(1, Ordering::SeqCst);
                if outcome.is_err() {
                    // The processor classifies attempt panics itself; this
                    // only trips on bugs outside the attempt path.
                    tracing::error!(job_id = %job_id, "job processing panicked");
                }
            }
            None => thread::sleep(IDLE_POLL),
        }
    }
}
