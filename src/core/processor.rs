use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::Context;
use chrono::Utc;
use serde_json::json;

use crate::core::buffer_pool::BufferPool;
use crate::core::cache::{CacheEntry, ResultCache};
use crate::core::cancel::CancelToken;
use crate::core::config::ServiceConfig;
use crate::core::domain::{
    callback_url, AttemptStatus, CallbackPayload, EditParams, Job, JobState, PreprocessParams,
    TaskType, CANCELLED_MESSAGE,
};
use crate::core::download::{download_to_file, is_remote, post_callback};
use crate::core::encoder::EncoderAdapter;
use crate::core::error::TaskError;
use crate::core::executor::Executor;
use crate::core::ffprobe::probe_media;
use crate::core::fingerprint::fingerprint;
use crate::core::joblog::JobLogger;
use crate::core::object_store::ObjectStore;
use crate::core::store::TaskStore;

/// Drives one claimed job through its state machine: sub-steps, the retry
/// loop, cancellation, execution records, and the completion callback. One
/// processor instance is shared by every worker.
pub struct JobProcessor {
    store: Arc<TaskStore>,
    cache: Arc<ResultCache>,
    pool: Arc<BufferPool>,
    executor: Arc<Executor>,
    encoder: EncoderAdapter,
    logger: Arc<JobLogger>,
    object_store: Option<Arc<dyn ObjectStore>>,
    config: ServiceConfig,
    // Guard against a second claim of the same id while the first is in
    // flight. The store's Pop already guarantees single assignment; this
    // set catches store-layer bugs before they reach the encoder.
    in_flight: Mutex<HashSet<String>>,
    // Attempt tokens of currently running jobs, for admin cancellation.
    active: Mutex<HashMap<String, CancelToken>>,
}

impl JobProcessor {
    pub fn new(
        store: Arc<TaskStore>,
        cache: Arc<ResultCache>,
        pool: Arc<BufferPool>,
        executor: Arc<Executor>,
        encoder: EncoderAdapter,
        logger: Arc<JobLogger>,
        object_store: Option<Arc<dyn ObjectStore>>,
        config: ServiceConfig,
    ) -> Self {
        Self {
            store,
            cache,
            pool,
            executor,
            encoder,
            logger,
            object_store,
            config,
            in_flight: Mutex::new(HashSet::new()),
            active: Mutex::new(HashMap::new()),
        }
    }

    /// Request cancellation of a job's running attempt. Returns false when
    /// the job is not currently executing in this process.
    pub fn cancel_active(&self, job_id: &str) -> bool {
        let active = self.active.lock().expect("active set poisoned");
        match active.get(job_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.lock().expect("in-flight set poisoned").len()
    }

    /// Process a job that was just removed from the queue. The job arrives
    /// in Processing with attempt `execution_count` already opened by the
    /// claim; this method owns it until a terminal transition.
    pub fn process(&self, claimed: Job, worker_token: &CancelToken) {
        let job_id = claimed.id.clone();

        let Some(_guard) = InFlightGuard::acquire(&self.in_flight, &job_id) else {
            tracing::error!(job_id = %job_id, "duplicate claim rejected by in-flight set");
            self.logger
                .error(&job_id, "duplicate claim rejected", None);
            return;
        };

        let token = worker_token.child();
        self.active
            .lock()
            .expect("active set poisoned")
            .insert(job_id.clone(), token.clone());
        let _active_guard = ActiveGuard {
            active: &self.active,
            job_id: &job_id,
        };

        let mut attempt_job = claimed;
        let max_attempts = self.config.max_attempts.max(1);
        for session_attempt in 1..=max_attempts {
            self.logger.info(
                &attempt_job.id,
                "attempt started",
                Some(json!({
                    "attempt": attempt_job.execution_count,
                    "priority": attempt_job.priority,
                })),
            );

            // Panics inside an attempt are recovered and classified like an
            // encoder failure, so one poisoned input cannot take the worker
            // down with it.
            let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                self.run_attempt(&attempt_job, &token)
            }))
            .unwrap_or_else(|_| {
                tracing::error!(job_id = %job_id, "attempt panicked");
                Err(TaskError::EncoderFailure("attempt panicked".into()))
            });
            let progress = self
                .store
                .get(&job_id)
                .map(|job| job.progress)
                .unwrap_or(0.0);

            match outcome {
                Ok(result) => {
                    self.finish(
                        &job_id,
                        AttemptStatus::Completed,
                        JobState::Completed,
                        1.0,
                        Some(result),
                        None,
                    );
                    return;
                }
                Err(TaskError::Cancelled) => {
                    self.finish(
                        &job_id,
                        AttemptStatus::Cancelled,
                        JobState::Cancelled,
                        progress,
                        None,
                        None,
                    );
                    return;
                }
                Err(err) if err.is_recoverable() && session_attempt < max_attempts => {
                    let diagnostic = err.to_string();
                    self.logger.warn(
                        &job_id,
                        "attempt failed, will retry",
                        Some(json!({
                            "attempt": attempt_job.execution_count,
                            "error": diagnostic,
                        })),
                    );
                    if let Err(err) = self.store.finalize_execution(
                        &job_id,
                        AttemptStatus::Failed,
                        progress,
                        None,
                        Some(diagnostic),
                    ) {
                        tracing::error!(job_id = %job_id, error = %format!("{err:#}"), "record finalize failed");
                    }

                    // Linear backoff, interruptible by cancellation.
                    let delay = self.config.retry_backoff * session_attempt;
                    if !sleep_cancellable(delay, &token) {
                        self.finish(
                            &job_id,
                            AttemptStatus::Cancelled,
                            JobState::Cancelled,
                            0.0,
                            None,
                            None,
                        );
                        return;
                    }

                    match self.store.begin_attempt(&job_id) {
                        Ok(Some(job)) => attempt_job = job,
                        Ok(None) => {
                            // The job left Processing behind our back (for
                            // example an admin cancel written directly).
                            tracing::warn!(job_id = %job_id, "retry abandoned, job no longer processing");
                            return;
                        }
                        Err(err) => {
                            tracing::error!(job_id = %job_id, error = %format!("{err:#}"), "could not open retry attempt");
                            self.finish(
                                &job_id,
                                AttemptStatus::Failed,
                                JobState::Failed,
                                0.0,
                                None,
                                Some("internal error opening retry attempt".into()),
                            );
                            return;
                        }
                    }
                }
                Err(err) => {
                    self.finish(
                        &job_id,
                        AttemptStatus::Failed,
                        JobState::Failed,
                        progress,
                        None,
                        Some(err.to_string()),
                    );
                    return;
                }
            }
        }
    }

    /// Finalize the in-flight record and the job itself, then fire the
    /// best-effort callback when the spec carries one.
    fn finish(
        &self,
        job_id: &str,
        attempt_status: AttemptStatus,
        job_state: JobState,
        progress: f64,
        result: Option<String>,
        error: Option<String>,
    ) {
        if let Err(err) = self.store.finalize_execution(
            job_id,
            attempt_status,
            progress,
            result.clone(),
            error.clone(),
        ) {
            tracing::error!(job_id = %job_id, error = %format!("{err:#}"), "record finalize failed");
        }

        let updated = self.store.with_job(job_id, |job| {
            job.state = job_state;
            job.finished = Some(Utc::now());
            job.progress = if job_state == JobState::Completed {
                1.0
            } else {
                progress
            };
            if let Some(ref result) = result {
                job.result = Some(result.clone());
            }
            match job_state {
                JobState::Failed => job.error = error.clone(),
                JobState::Cancelled => job.message = Some(CANCELLED_MESSAGE.to_string()),
                _ => {}
            }
        });

        let log_ctx = json!({"state": job_state, "result": result, "error": error});
        match job_state {
            JobState::Completed => self.logger.info(job_id, "job completed", Some(log_ctx)),
            JobState::Cancelled => self.logger.warn(job_id, "job cancelled", Some(log_ctx)),
            _ => self.logger.error(job_id, "job failed", Some(log_ctx)),
        }

        match updated {
            Ok(Some(job)) => {
                if let Some(url) = callback_url(&job.spec) {
                    post_callback(
                        &url,
                        &CallbackPayload {
                            task_id: job.id.clone(),
                            status: job.state,
                            result: job.result.clone(),
                            error: job.error.clone(),
                        },
                    );
                }
            }
            Ok(None) => tracing::warn!(job_id = %job_id, "job vanished during finalize"),
            Err(err) => {
                tracing::error!(job_id = %job_id, error = %format!("{err:#}"), "job finalize failed")
            }
        }
    }

    fn run_attempt(&self, job: &Job, token: &CancelToken) -> Result<String, TaskError> {
        if token.is_cancelled() {
            return Err(TaskError::Cancelled);
        }
        match job.task_type() {
            TaskType::MaterialPreprocess => self.run_preprocess(job, token),
            TaskType::VideoEdit => self.run_edit(job, token),
        }
    }

    /// Transcode a single source into MPEG-TS by stream copy.
    fn run_preprocess(&self, job: &Job, token: &CancelToken) -> Result<String, TaskError> {
        let params = PreprocessParams::from_spec(&job.spec)?;
        let source = PathBuf::from(&params.source);
        if !source.is_file() {
            return Err(TaskError::SourceMissing(params.source));
        }
        self.set_progress(&job.id, 0.1);

        match probe_media(&self.config.probe_bin, &source) {
            Ok(info) => self.logger.info(
                &job.id,
                "source probed",
                Some(json!({"source": params.source, "media": info})),
            ),
            Err(err) => self.logger.warn(
                &job.id,
                "source probe failed",
                Some(json!({"source": params.source, "error": format!("{err:#}")})),
            ),
        }

        let output = source.with_extension("ts");
        let args = EncoderAdapter::preprocess_args(&source, &output);
        if job.verbose {
            self.logger.info(
                &job.id,
                "encoder invocation",
                Some(json!({"bin": self.encoder.encoder_bin(), "args": args})),
            );
        }
        self.encoder.run(&args, token)?;
        self.set_progress(&job.id, 0.9);

        match probe_media(&self.config.probe_bin, &output) {
            Ok(info) => self.logger.info(
                &job.id,
                "output probed",
                Some(json!({"output": output.to_string_lossy(), "media": info})),
            ),
            Err(err) => self.logger.warn(
                &job.id,
                "output probe failed",
                Some(json!({"error": format!("{err:#}")})),
            ),
        }

        Ok(output.to_string_lossy().into_owned())
    }

    /// The concat-and-encode pipeline: cache consult, parallel decode,
    /// manifest, encode with fallback, cache insert, optional upload.
    fn run_edit(&self, job: &Job, token: &CancelToken) -> Result<String, TaskError> {
        let params = EditParams::from_spec(&job.id, &job.spec)?;
        let out_path = PathBuf::from(&params.out_path);
        let print = fingerprint(&params);

        if let Some(entry) = self.cache.lookup(&print) {
            match self.deliver_cached(&entry, &out_path) {
                Ok(()) => {
                    self.logger.info(
                        &job.id,
                        "cache hit, artifact copied",
                        Some(json!({"fingerprint": print, "artifact": entry.artifact_path})),
                    );
                    self.set_progress(&job.id, 1.0);
                    return Ok(params.out_path.clone());
                }
                Err(err) => {
                    // The artifact vanished between lookup and read; fall
                    // through to a full encode.
                    self.logger.warn(
                        &job.id,
                        "cached artifact unreadable, re-encoding",
                        Some(json!({"fingerprint": print, "error": format!("{err:#}")})),
                    );
                }
            }
        }
        self.set_progress(&job.id, 0.05);

        let attempt_dir = self.config.temp_dir.join(format!("decode_{}", nanos_now()));
        fs::create_dir_all(&attempt_dir)
            .with_context(|| format!("create temp dir {}", attempt_dir.display()))
            .map_err(TaskError::Internal)?;
        let _cleanup = TempDirGuard(&attempt_dir);

        let local_inputs = self.resolve_inputs(job, &params.inputs, &attempt_dir, token)?;
        self.set_progress(&job.id, 0.15);

        let intermediates = self.decode_inputs(job, &local_inputs, &attempt_dir, token)?;
        self.set_progress(&job.id, 0.7);

        // Per-job manifest name: concurrent jobs share temp space.
        let manifest = attempt_dir.join(format!("concat_{}.txt", job.id));
        let mut listing = String::new();
        for path in &intermediates {
            listing.push_str(&format!("file '{}'\n", path.display()));
        }
        fs::write(&manifest, listing)
            .with_context(|| format!("write manifest {}", manifest.display()))
            .map_err(TaskError::Internal)?;

        if let Some(parent) = out_path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("create output dir {}", parent.display()))
                    .map_err(TaskError::Internal)?;
            }
        }
        if token.is_cancelled() {
            return Err(TaskError::Cancelled);
        }
        let used = self.encoder.run_concat(
            &manifest,
            params.width,
            params.height,
            params.fps,
            &params.preset,
            &out_path,
            token,
        )?;
        self.logger.info(
            &job.id,
            "concat encode finished",
            Some(json!({"encoder": used.cli_name(), "output": params.out_path})),
        );
        self.set_progress(&job.id, 0.9);

        // Cache insert happens before the Completed transition so an
        // identical follow-up job observes the entry.
        match CacheEntry::for_artifact(&out_path) {
            Ok(entry) => self.cache.insert(print, entry),
            Err(err) => self.logger.warn(
                &job.id,
                "artifact not cacheable",
                Some(json!({"error": err.to_string()})),
            ),
        }

        let mut result = params.out_path.clone();
        if let Some(key) = params.oss_output.as_deref() {
            match self.upload_artifact(&out_path, key) {
                Ok(url) => {
                    self.logger
                        .info(&job.id, "artifact uploaded", Some(json!({"url": url})));
                    result = url;
                }
                Err(err) => {
                    // Upload is best-effort after a successful encode: the
                    // job completes with the local artifact and a warning.
                    let warning = format!("upload failed: {err}");
                    self.logger.warn(&job.id, &warning, None);
                    let _ = self.store.with_job(&job.id, |job| {
                        job.message = Some(warning.clone());
                    });
                }
            }
        }
        Ok(result)
    }

    fn deliver_cached(&self, entry: &CacheEntry, out_path: &Path) -> anyhow::Result<()> {
        if same_file(&entry.artifact_path, out_path) {
            return Ok(());
        }
        self.pool.copy_file(&entry.artifact_path, out_path)?;
        Ok(())
    }

    /// Make every input locator local: remote URLs are downloaded into the
    /// attempt directory, local paths must exist.
    fn resolve_inputs(
        &self,
        job: &Job,
        inputs: &[String],
        attempt_dir: &Path,
        token: &CancelToken,
    ) -> Result<Vec<PathBuf>, TaskError> {
        let mut local = Vec::with_capacity(inputs.len());
        for (idx, input) in inputs.iter().enumerate() {
            if token.is_cancelled() {
                return Err(TaskError::Cancelled);
            }
            if is_remote(input) {
                let target = attempt_dir.join(format!("download_{idx}"));
                let bytes =
                    download_to_file(input, &target, &self.pool, self.config.download_timeout)?;
                self.logger.info(
                    &job.id,
                    "input downloaded",
                    Some(json!({"url": input, "bytes": bytes})),
                );
                local.push(target);
            } else {
                let path = PathBuf::from(input);
                if !path.is_file() {
                    return Err(TaskError::SourceMissing(input.clone()));
                }
                local.push(path);
            }
        }
        Ok(local)
    }

    /// Fan out one normalize-decode per input through the shared executor.
    /// The first failure cancels the remaining decodes; all sub-tasks are
    /// awaited before returning either way.
    fn decode_inputs(
        &self,
        job: &Job,
        inputs: &[PathBuf],
        attempt_dir: &Path,
        token: &CancelToken,
    ) -> Result<Vec<PathBuf>, TaskError> {
        let decode_token = token.child();
        let join = Arc::new(DecodeJoin::new(inputs.len()));
        let mut outputs = Vec::with_capacity(inputs.len());

        for (idx, input) in inputs.iter().enumerate() {
            let output = attempt_dir.join(format!("decoded_{idx}.mp4"));
            outputs.push(output.clone());

            let encoder = self.encoder.clone();
            let input = input.clone();
            let join_handle = join.clone();
            let task_decode_token = decode_token.clone();
            let verbose = job.verbose;
            let job_id = job.id.clone();

            let submitted = self.executor.submit(Box::new(move |_task_token| {
                let mut slot = DecodeSlot::new(&join_handle, &task_decode_token);
                if task_decode_token.is_cancelled() {
                    slot.record(Err(TaskError::Cancelled));
                    return Ok(());
                }
                let args = EncoderAdapter::decode_args(&input, &output);
                if verbose {
                    tracing::debug!(job_id = %job_id, ?args, "decode invocation");
                }
                let result = encoder.run(&args, &task_decode_token);
                let failed = result.is_err();
                slot.record(result);
                if failed {
                    anyhow::bail!("decode failed for {}", input.display());
                }
                Ok(())
            }));

            if let Err(err) = submitted {
                decode_token.cancel();
                // This task and everything after it never got submitted.
                join.abandon(inputs.len() - idx);
                join.wait();
                return Err(if token.is_cancelled() {
                    TaskError::Cancelled
                } else {
                    err
                });
            }
        }

        join.wait();

        if let Some(err) = join.first_error() {
            return Err(if token.is_cancelled() {
                TaskError::Cancelled
            } else {
                err
            });
        }
        self.logger.info(
            &job.id,
            "parallel decode finished",
            Some(json!({"inputs": inputs.len()})),
        );
        Ok(outputs)
    }

    fn upload_artifact(&self, artifact: &Path, key: &str) -> Result<String, TaskError> {
        let Some(store) = self.object_store.as_ref() else {
            return Err(TaskError::UploadFailure(
                "no object store configured".to_string(),
            ));
        };
        store
            .upload_file(artifact, key)
            .map_err(|err| TaskError::UploadFailure(format!("{err:#}")))
    }

    /// Monotonic progress within the current attempt; regressions are
    /// dropped rather than clamped so a racing reset keeps its zero.
    fn set_progress(&self, job_id: &str, progress: f64) {
        let _ = self.store.with_job(job_id, |job| {
            if progress > job.progress {
                job.progress = progress.min(1.0);
            }
        });
    }
}

/// Synchronization point for one decode fan-out.
struct DecodeJoin {
    state: Mutex<DecodeJoinState>,
    cv: Condvar,
}

struct DecodeJoinState {
    remaining: usize,
    errors: Vec<TaskError>,
}

impl DecodeJoin {
    fn new(count: usize) -> Self {
        Self {
            state: Mutex::new(DecodeJoinState {
                remaining: count,
                errors: Vec::new(),
            }),
            cv: Condvar::new(),
        }
    }

    fn record(&self, result: Result<(), TaskError>) {
        let mut state = self.state.lock().expect("decode join poisoned");
        state.remaining -= 1;
        if let Err(err) = result {
            state.errors.push(err);
        }
        self.cv.notify_all();
    }

    /// Discount sub-tasks that were never submitted.
    fn abandon(&self, count: usize) {
        let mut state = self.state.lock().expect("decode join poisoned");
        state.remaining = state.remaining.saturating_sub(count);
        self.cv.notify_all();
    }

    fn wait(&self) {
        let mut state = self.state.lock().expect("decode join poisoned");
        while state.remaining > 0 {
            state = self.cv.wait(state).expect("decode join poisoned");
        }
    }

    fn first_error(&self) -> Option<TaskError> {
        let mut state = self.state.lock().expect("decode join poisoned");
        if state.errors.is_empty() {
            None
        } else {
            Some(state.errors.remove(0))
        }
    }
}

/// Records exactly one result into the join, even if the task panics after
/// construction: the drop path counts an unrecorded slot as a panic failure
/// and cancels the siblings.
struct DecodeSlot<'a> {
    join: &'a DecodeJoin,
    token: &'a CancelToken,
    recorded: bool,
}

impl<'a> DecodeSlot<'a> {
    fn new(join: &'a DecodeJoin, token: &'a CancelToken) -> Self {
        Self {
            join,
            token,
            recorded: false,
        }
    }

    fn record(&mut self, result: Result<(), TaskError>) {
        if result.is_err() {
            self.token.cancel();
        }
        self.join.record(result);
        self.recorded = true;
    }
}

impl Drop for DecodeSlot<'_> {
    fn drop(&mut self) {
        if !self.recorded {
            self.token.cancel();
            self.join
                .record(Err(TaskError::EncoderFailure("decode task panicked".into())));
        }
    }
}

struct InFlightGuard<'a> {
    set: &'a Mutex<HashSet<String>>,
    id: String,
}

impl<'a> InFlightGuard<'a> {
    fn acquire(set: &'a Mutex<HashSet<String>>, id: &str) -> Option<Self> {
        let mut guard = set.lock().expect("in-flight set poisoned");
        if !guard.insert(id.to_string()) {
            return None;
        }
        Some(Self {
            set,
            id: id.to_string(),
        })
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.set
            .lock()
            .expect("in-flight set poisoned")
            .remove(&self.id);
    }
}

struct ActiveGuard<'a> {
    active: &'a Mutex<HashMap<String, CancelToken>>,
    job_id: &'a str,
}

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.active
            .lock()
            .expect("active set poisoned")
            .remove(self.job_id);
    }
}

struct TempDirGuard<'a>(&'a Path);

impl Drop for TempDirGuard<'_> {
    fn drop(&mut self) {
        let _ = fs::remove_dir_all(self.0);
    }
}

fn same_file(a: &Path, b: &Path) -> bool {
    match (a.canonicalize(), b.canonicalize()) {
        (Ok(a), Ok(b)) => a == b,
        _ => a == b,
    }
}

fn nanos_now() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos()
}

/// Sleep in short slices, returning false as soon as the token cancels.
fn sleep_cancellable(total: Duration, token: &CancelToken) -> bool {
    let slice = Duration::from_millis(50);
    let mut remaining = total;
    while remaining > Duration::ZERO {
        if token.is_cancelled() {
            return false;
        }
        let step = remaining.min(slice);
        thread::sleep(step);
        remaining = remaining.saturating_sub(step);
    }
    !token.is_cancelled()
}
