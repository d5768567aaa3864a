use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use serde::Serialize;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::core::buffer_pool::BufferPool;
use crate::core::cache::ResultCache;
use crate::core::cancel::CancelToken;
use crate::core::config::ServiceConfig;
use crate::core::domain::{
    EditParams, ExecutionRecord, Job, JobPriority, JobState, TaskStatus, CANCELLED_MESSAGE,
};
use crate::core::download::download_to_file;
use crate::core::encoder::EncoderAdapter;
use crate::core::error::TaskError;
use crate::core::executor::{Executor, ExecutorConfig, ExecutorStats};
use crate::core::joblog::JobLogger;
use crate::core::monitor::{sample_cpu_usage, sample_memory_usage, CpuUsageSnapshot, MemoryUsageSnapshot};
use crate::core::object_store::ObjectStore;
use crate::core::processor::JobProcessor;
use crate::core::queue::JobQueue;
use crate::core::store::TaskStore;
use crate::core::worker::WorkerPool;

/// Bytes of per-job log returned by the tail-style monitor call.
const LOG_TAIL_BYTES: u64 = 64 * 1024;

/// Per-state job counts for the monitoring surface.
#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TaskStats {
    pub total: usize,
    pub pending: usize,
    pub processing: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub discarded: usize,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceStats {
    pub workers: usize,
    pub active_workers: usize,
    pub pending_jobs: usize,
    pub cache_entries: usize,
    pub executor: ExecutorStats,
    pub cpu: CpuUsageSnapshot,
    pub memory: MemoryUsageSnapshot,
}

/// The service facade: owns the store, queue, cache, pools, processor and
/// workers, and exposes the operations the external HTTP layer calls. One
/// instance per process; everything inside is shared by reference.
pub struct VideoService {
    config: ServiceConfig,
    store: Arc<TaskStore>,
    queue: JobQueue,
    cache: Arc<ResultCache>,
    pool: Arc<BufferPool>,
    executor: Arc<Executor>,
    processor: Arc<JobProcessor>,
    workers: WorkerPool,
    logger: Arc<JobLogger>,
    stopped: AtomicBool,
}

impl VideoService {
    /// Wire every component, run startup recovery, and spawn the worker
    /// pool. Jobs recovered from an unclean shutdown are Pending again and
    /// will be re-claimed as soon as the workers come up.
    pub fn start(config: ServiceConfig) -> Result<Self> {
        Self::start_with_object_store(config, None)
    }

    pub fn start_with_object_store(
        config: ServiceConfig,
        object_store: Option<Arc<dyn ObjectStore>>,
    ) -> Result<Self> {
        let store = Arc::new(
            TaskStore::open(&config.data_dir)
                .with_context(|| format!("open task store in {}", config.data_dir.display()))?,
        );
        let logger = Arc::new(JobLogger::new(&config.log_dir));

        for job_id in store.recovered_at_startup() {
            tracing::warn!(job_id = %job_id, "job recovered after unclean shutdown, re-queued");
            logger.warn(
                job_id,
                "recovered after unclean shutdown; previous attempt was interrupted",
                None,
            );
        }

        let root = CancelToken::new();
        let cache = Arc::new(ResultCache::new(config.cache_capacity));
        let pool = Arc::new(BufferPool::new());
        let executor = Executor::new(
            ExecutorConfig {
                max_workers: config.executor.max_workers.max(config.max_workers),
                ..config.executor.clone()
            },
            &root,
        );
        let encoder = EncoderAdapter::new(config.encoder_bin.clone());
        let processor = Arc::new(JobProcessor::new(
            store.clone(),
            cache.clone(),
            pool.clone(),
            executor.clone(),
            encoder,
            logger.clone(),
            object_store,
            config.clone(),
        ));
        let queue = JobQueue::new(store.clone());
        let workers = WorkerPool::new(queue.clone(), processor.clone(), executor.clone(), root);
        workers.start(config.max_workers);

        tracing::info!(
            workers = config.max_workers,
            data_dir = %config.data_dir.display(),
            encoder = %config.encoder_bin,
            "video service started"
        );

        Ok(Self {
            config,
            store,
            queue,
            cache,
            pool,
            executor,
            processor,
            workers,
            logger,
            stopped: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    /// Accept a `videoEdit` job. The spec tree is stored verbatim; the
    /// explicit output/upload/priority arguments override their spec keys.
    /// Shape problems are rejected here so the HTTP layer can 400 before
    /// anything is enqueued.
    pub fn submit_edit(
        &self,
        mut spec: Value,
        output_path: Option<String>,
        oss_output: Option<String>,
        priority: Option<JobPriority>,
    ) -> Result<String, TaskError> {
        let id = Uuid::new_v4().to_string();
        let obj = spec
            .as_object_mut()
            .ok_or_else(|| TaskError::BadSpec("spec must be a JSON object".into()))?;
        if let Some(out) = output_path {
            obj.insert("outPath".to_string(), Value::String(out));
        }
        if !obj.contains_key("outPath") {
            // Pin the configured output directory into the spec so the
            // worker does not depend on the daemon's working directory.
            let default_out = self.config.output_dir.join(format!("{id}.mp4"));
            obj.insert(
                "outPath".to_string(),
                Value::String(default_out.to_string_lossy().into_owned()),
            );
        }
        if let Some(key) = oss_output {
            obj.insert("OSSOutput".to_string(), Value::String(key));
        }

        EditParams::from_spec(&id, &spec)?;

        let verbose = spec.get("verbose").and_then(Value::as_bool).unwrap_or(false);
        let mut job = Job::new(id, spec, priority.unwrap_or_default());
        job.verbose = verbose;
        let id = self.queue.enqueue(job)?;
        self.logger
            .info(&id, "edit job accepted", Some(json!({"priority": priority})));
        Ok(id)
    }

    /// Accept a `materialPreprocess` job for a local source file.
    pub fn submit_preprocess(
        &self,
        source: String,
        callback: Option<String>,
        priority: Option<JobPriority>,
    ) -> Result<String, TaskError> {
        if source.trim().is_empty() {
            return Err(TaskError::BadSpec("source is required".into()));
        }
        let mut spec = json!({
            "taskType": "materialPreprocess",
            "source": source,
        });
        if let Some(url) = callback {
            spec["callback"] = Value::String(url);
        }
        let job = Job::new(
            Uuid::new_v4().to_string(),
            spec,
            priority.unwrap_or_default(),
        );
        let id = self.queue.enqueue(job)?;
        self.logger.info(&id, "preprocess job accepted", None);
        Ok(id)
    }

    /// Download a remote material into the temp area, then enqueue a
    /// preprocess job for it.
    pub fn download_and_enqueue(
        &self,
        url: &str,
        callback: Option<String>,
    ) -> Result<String, TaskError> {
        let name = url
            .rsplit('/')
            .next()
            .filter(|s| !s.is_empty())
            .unwrap_or("material");
        let target = self.material_path(name);
        let bytes = download_to_file(url, &target, &self.pool, self.config.download_timeout)?;
        tracing::info!(url, bytes, target = %target.display(), "material downloaded");
        self.submit_preprocess(target.to_string_lossy().into_owned(), callback, None)
    }

    /// Store uploaded material bytes in the temp area and enqueue a
    /// preprocess job. This is the multipart-upload equivalent.
    pub fn import_material(
        &self,
        filename: &str,
        data: &[u8],
        callback: Option<String>,
    ) -> Result<String, TaskError> {
        if data.is_empty() {
            return Err(TaskError::BadSpec("uploaded material is empty".into()));
        }
        let target = self.material_path(filename);
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create {}", parent.display()))
                .map_err(TaskError::Internal)?;
        }
        std::fs::write(&target, data)
            .with_context(|| format!("write {}", target.display()))
            .map_err(TaskError::Internal)?;
        self.submit_preprocess(target.to_string_lossy().into_owned(), callback, None)
    }

    fn material_path(&self, filename: &str) -> PathBuf {
        // Keep only the final path component of caller-provided names.
        let base = filename
            .rsplit(['/', '\\'])
            .next()
            .filter(|s| !s.is_empty())
            .unwrap_or("material");
        self.config
            .temp_dir
            .join(format!("material_{}_{base}", nanos_now()))
    }

    pub fn status(&self, id: &str) -> Option<TaskStatus> {
        self.store.get(id).map(|job| TaskStatus::from(&job))
    }

    pub fn list_tasks(&self) -> Vec<TaskStatus> {
        self.store
            .list()
            .iter()
            .map(TaskStatus::from)
            .collect()
    }

    pub fn executions(&self, id: &str) -> Result<Vec<ExecutionRecord>, TaskError> {
        if self.store.get(id).is_none() {
            return Err(TaskError::NotFound(id.to_string()));
        }
        Ok(self.store.executions(id))
    }

    pub fn job_log(&self, id: &str) -> Result<String, TaskError> {
        if self.store.get(id).is_none() {
            return Err(TaskError::NotFound(id.to_string()));
        }
        Ok(self.logger.tail(id, LOG_TAIL_BYTES))
    }

    /// Cancel a job. Pending jobs are cancelled in the store; a running
    /// attempt is cancelled cooperatively and terminates at its next
    /// sub-step boundary (killing any live encoder subprocess). Terminal
    /// jobs refuse with `InvalidState`.
    pub fn cancel(&self, id: &str) -> Result<(), TaskError> {
        let Some(job) = self.store.get(id) else {
            return Err(TaskError::NotFound(id.to_string()));
        };
        if job.state.is_terminal() {
            return Err(TaskError::InvalidState(job.state));
        }

        if self.processor.cancel_active(id) {
            self.logger.warn(id, "cancellation requested", None);
            return Ok(());
        }

        // Not running in this process: flip Pending straight to Cancelled.
        let mut cancelled = false;
        self.store
            .with_job(id, |job| {
                if job.state == JobState::Pending {
                    job.state = JobState::Cancelled;
                    job.finished = Some(chrono::Utc::now());
                    job.message = Some(CANCELLED_MESSAGE.to_string());
                    cancelled = true;
                }
            })
            .map_err(TaskError::Internal)?;
        if cancelled {
            self.logger.warn(id, "cancelled before start", None);
            return Ok(());
        }

        // The job was claimed between our check and the store write; the
        // attempt token is registered by now.
        if self.processor.cancel_active(id) {
            self.logger.warn(id, "cancellation requested", None);
            return Ok(());
        }
        let state = self.store.get(id).map(|j| j.state).unwrap_or(job.state);
        Err(TaskError::InvalidState(state))
    }

    /// Reset a terminal job to Pending for re-execution.
    pub fn retry(&self, id: &str) -> Result<(), TaskError> {
        let job = self.store.reset_for_retry(id)?;
        self.logger.info(
            id,
            "retry requested",
            Some(json!({"executionCount": job.execution_count})),
        );
        Ok(())
    }

    /// Drop a job from scheduling while keeping its history queryable.
    pub fn discard(&self, id: &str) -> Result<(), TaskError> {
        self.store.discard(id)?;
        self.logger.info(id, "job discarded", None);
        Ok(())
    }

    pub fn task_stats(&self) -> TaskStats {
        let mut stats = TaskStats::default();
        for job in self.store.list() {
            stats.total += 1;
            match job.state {
                JobState::Pending => stats.pending += 1,
                JobState::Processing => stats.processing += 1,
                JobState::Completed => stats.completed += 1,
                JobState::Failed => stats.failed += 1,
                JobState::Cancelled => stats.cancelled += 1,
                JobState::Discarded => stats.discarded += 1,
            }
        }
        stats
    }

    pub fn stats(&self) -> ServiceStats {
        ServiceStats {
            workers: self.workers.worker_count(),
            active_workers: self.workers.active_worker_count(),
            pending_jobs: self.queue.pending_len(),
            cache_entries: self.cache.len(),
            executor: self.executor.stats(),
            cpu: sample_cpu_usage(),
            memory: sample_memory_usage(),
        }
    }

    pub fn resize_workers(&self, target: usize) {
        tracing::info!(workers = target, "resizing worker pool");
        self.workers.resize(target);
    }

    /// Graceful shutdown: stop the workers (cancelling in-flight attempts
    /// and their subprocesses) and the fan-out executor. The store has
    /// already persisted every acknowledged mutation, so there is nothing
    /// else to flush.
    pub fn shutdown(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::info!("video service shutting down");
        self.workers.stop();
    }
}

impl Drop for VideoService {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn nanos_now() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos()
}
