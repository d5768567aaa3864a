use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use chrono::Utc;
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::core::domain::{AttemptStatus, ExecutionRecord, Job, JobState};
use crate::core::error::TaskError;

/// On-disk shape of the store: the whole job table plus every execution
/// record, rewritten atomically on each acknowledged mutation. The open set
/// is bounded (thousands, not millions), so one document per mutation is the
/// simple durable option.
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PersistedState {
    jobs: Vec<Job>,
    #[serde(default)]
    executions: Vec<ExecutionRecord>,
}

struct StoreState {
    jobs: HashMap<String, Job>,
    // Per-job records in append order.
    executions: HashMap<String, Vec<ExecutionRecord>>,
}

/// Durable owner of the Job and ExecutionRecord tables. Every mutation is
/// persisted to `tasks.json` before it is acknowledged, and `pop` performs
/// selection and the Pending -> Processing transition inside one mutex
/// section so no two callers can claim the same job.
pub struct TaskStore {
    state: Mutex<StoreState>,
    data_path: PathBuf,
    recovered_at_startup: Vec<String>,
    // Advisory lock held for the store's lifetime so two daemons cannot
    // share a data directory. Kept separate from tasks.json because the
    // atomic-rename persist would swap the locked inode away.
    _dir_lock: File,
}

impl TaskStore {
    /// Open (or create) the store under `data_dir`, then run crash recovery:
    /// jobs left in Processing by an unclean shutdown become Pending again,
    /// their `recoveredCount` is bumped, and the interrupted attempt's
    /// record is finalized as `interrupted`.
    pub fn open(data_dir: &Path) -> Result<Self> {
        fs::create_dir_all(data_dir)
            .with_context(|| format!("create data directory {}", data_dir.display()))?;

        let lock_path = data_dir.join(".lock");
        let dir_lock = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&lock_path)
            .with_context(|| format!("open lock file {}", lock_path.display()))?;
        dir_lock.try_lock_exclusive().with_context(|| {
            format!(
                "data directory {} is already in use by another process",
                data_dir.display()
            )
        })?;

        let data_path = data_dir.join("tasks.json");
        let persisted = load_persisted(&data_path)?;

        let mut jobs = HashMap::with_capacity(persisted.jobs.len());
        for job in persisted.jobs {
            jobs.insert(job.id.clone(), job);
        }
        let mut executions: HashMap<String, Vec<ExecutionRecord>> = HashMap::new();
        for record in persisted.executions {
            executions.entry(record.job_id.clone()).or_default().push(record);
        }

        let mut store = Self {
            state: Mutex::new(StoreState { jobs, executions }),
            data_path,
            recovered_at_startup: Vec::new(),
            _dir_lock: dir_lock,
        };
        store.recover_interrupted()?;
        Ok(store)
    }

    /// Jobs rewritten Processing -> Pending by this process's startup.
    pub fn recovered_at_startup(&self) -> &[String] {
        &self.recovered_at_startup
    }

    fn recover_interrupted(&mut self) -> Result<()> {
        let mut recovered = Vec::new();
        {
            let mut state = self.state.lock().expect("task store lock poisoned");
            let now = Utc::now();
            let ids: Vec<String> = state
                .jobs
                .values()
                .filter(|job| job.state == JobState::Processing)
                .map(|job| job.id.clone())
                .collect();

            for id in ids {
                if let Some(job) = state.jobs.get_mut(&id) {
                    job.state = JobState::Pending;
                    job.started = None;
                    job.finished = None;
                    job.progress = 0.0;
                    job.recovered_count += 1;
                }
                if let Some(records) = state.executions.get_mut(&id) {
                    if let Some(record) = records
                        .iter_mut()
                        .rev()
                        .find(|r| r.status == AttemptStatus::Running)
                    {
                        record.status = AttemptStatus::Interrupted;
                        record.finished = Some(now);
                        record.duration_ms = Some(duration_ms(record.started, now));
                        record.error = Some("attempt interrupted by process restart".to_string());
                    }
                }
                recovered.push(id);
            }

            if !recovered.is_empty() {
                persist(&self.data_path, &state)?;
            }
        }
        self.recovered_at_startup = recovered;
        Ok(())
    }

    /// Insert or overwrite a job. Identity, priority and creation time are
    /// assigned when missing. A Pending job with the same id is never
    /// silently replaced: that is a rejected duplicate enqueue.
    pub fn push(&self, mut job: Job) -> Result<String, TaskError> {
        if job.id.trim().is_empty() {
            job.id = Uuid::new_v4().to_string();
        }
        if job.created.is_none() {
            job.created = Some(Utc::now());
        }

        let mut state = self.state.lock().expect("task store lock poisoned");
        if let Some(existing) = state.jobs.get(&job.id) {
            if existing.state == JobState::Pending && job.state == JobState::Pending {
                return Err(TaskError::DuplicatePending(job.id));
            }
        }
        let id = job.id.clone();
        state.jobs.insert(id.clone(), job);
        persist(&self.data_path, &state).map_err(TaskError::Internal)?;
        Ok(id)
    }

    /// Atomically claim the best Pending job: highest priority first, ties
    /// broken by earliest creation time (then id, for determinism). The
    /// claimed job transitions to Processing, gets `started` stamped, its
    /// attempt counter bumped, and a Running execution record appended,
    /// all before the snapshot is returned.
    pub fn pop(&self) -> Result<Option<Job>> {
        let mut state = self.state.lock().expect("task store lock poisoned");

        let best_id = state
            .jobs
            .values()
            .filter(|job| job.state == JobState::Pending)
            .max_by(|a, b| {
                a.priority
                    .cmp(&b.priority)
                    .then_with(|| b.created.cmp(&a.created))
                    .then_with(|| b.id.cmp(&a.id))
            })
            .map(|job| job.id.clone());

        let Some(id) = best_id else {
            return Ok(None);
        };

        let now = Utc::now();
        let record = {
            let job = state.jobs.get_mut(&id).expect("selected job exists");
            job.state = JobState::Processing;
            job.started = Some(now);
            job.finished = None;
            job.progress = 0.0;
            job.execution_count += 1;
            job.last_execution = Some(now);
            ExecutionRecord {
                id: Uuid::new_v4().to_string(),
                job_id: job.id.clone(),
                attempt: job.execution_count,
                status: AttemptStatus::Running,
                started: now,
                finished: None,
                duration_ms: None,
                progress: 0.0,
                result: None,
                error: None,
                priority: job.priority,
                spec: job.spec.clone(),
            }
        };
        state.executions.entry(id.clone()).or_default().push(record);

        persist(&self.data_path, &state)?;
        Ok(state.jobs.get(&id).cloned())
    }

    /// Open a follow-up attempt for a job that is already Processing: the
    /// retry loop stays inside one claim, so selection is skipped but the
    /// attempt counter, progress reset and Running record match `pop`.
    pub fn begin_attempt(&self, job_id: &str) -> Result<Option<Job>> {
        let mut state = self.state.lock().expect("task store lock poisoned");
        let Some(job) = state.jobs.get_mut(job_id) else {
            return Ok(None);
        };
        if job.state != JobState::Processing {
            return Ok(None);
        }
        let now = Utc::now();
        job.progress = 0.0;
        job.execution_count += 1;
        job.last_execution = Some(now);
        let record = ExecutionRecord {
            id: Uuid::new_v4().to_string(),
            job_id: job.id.clone(),
            attempt: job.execution_count,
            status: AttemptStatus::Running,
            started: now,
            finished: None,
            duration_ms: None,
            progress: 0.0,
            result: None,
            error: None,
            priority: job.priority,
            spec: job.spec.clone(),
        };
        let snapshot = job.clone();
        state
            .executions
            .entry(job_id.to_string())
            .or_default()
            .push(record);
        persist(&self.data_path, &state)?;
        Ok(Some(snapshot))
    }

    pub fn get(&self, id: &str) -> Option<Job> {
        let state = self.state.lock().expect("task store lock poisoned");
        state.jobs.get(id).cloned()
    }

    /// Overwrite a job's fields. Persisted before returning.
    pub fn update(&self, job: Job) -> Result<()> {
        let mut state = self.state.lock().expect("task store lock poisoned");
        state.jobs.insert(job.id.clone(), job);
        persist(&self.data_path, &state)
    }

    /// Apply a closure to one job under the store lock, then persist.
    /// Returns None when the job does not exist.
    pub fn with_job<F>(&self, id: &str, mutate: F) -> Result<Option<Job>>
    where
        F: FnOnce(&mut Job),
    {
        let mut state = self.state.lock().expect("task store lock poisoned");
        let Some(job) = state.jobs.get_mut(id) else {
            return Ok(None);
        };
        mutate(job);
        let snapshot = job.clone();
        persist(&self.data_path, &state)?;
        Ok(Some(snapshot))
    }

    pub fn list(&self) -> Vec<Job> {
        let state = self.state.lock().expect("task store lock poisoned");
        let mut jobs: Vec<Job> = state.jobs.values().cloned().collect();
        jobs.sort_by(|a, b| a.created.cmp(&b.created).then_with(|| a.id.cmp(&b.id)));
        jobs
    }

    pub fn pending_count(&self) -> usize {
        let state = self.state.lock().expect("task store lock poisoned");
        state
            .jobs
            .values()
            .filter(|job| job.state == JobState::Pending)
            .count()
    }

    pub fn executions(&self, job_id: &str) -> Vec<ExecutionRecord> {
        let state = self.state.lock().expect("task store lock poisoned");
        state.executions.get(job_id).cloned().unwrap_or_default()
    }

    /// Finalize the in-flight execution record of `job_id`. No-op when no
    /// Running record exists (defensively tolerated; records are never
    /// mutated twice).
    pub fn finalize_execution(
        &self,
        job_id: &str,
        status: AttemptStatus,
        progress: f64,
        result: Option<String>,
        error: Option<String>,
    ) -> Result<()> {
        let mut state = self.state.lock().expect("task store lock poisoned");
        let Some(records) = state.executions.get_mut(job_id) else {
            return Ok(());
        };
        let Some(record) = records
            .iter_mut()
            .rev()
            .find(|r| r.status == AttemptStatus::Running)
        else {
            return Ok(());
        };
        let now = Utc::now();
        record.status = status;
        record.finished = Some(now);
        record.duration_ms = Some(duration_ms(record.started, now));
        record.progress = progress;
        record.result = result;
        record.error = error;
        persist(&self.data_path, &state)
    }

    /// Explicit retry: resets a terminal job back to Pending, clearing the
    /// previous outcome. Discarded jobs stay discarded, and a live job
    /// cannot be "retried" out from under its worker.
    pub fn reset_for_retry(&self, id: &str) -> Result<Job, TaskError> {
        let mut state = self.state.lock().expect("task store lock poisoned");
        let Some(job) = state.jobs.get_mut(id) else {
            return Err(TaskError::NotFound(id.to_string()));
        };
        match job.state {
            JobState::Failed | JobState::Cancelled | JobState::Completed => {
                job.state = JobState::Pending;
                job.started = None;
                job.finished = None;
                job.progress = 0.0;
                job.result = None;
                job.error = None;
                job.message = None;
                let snapshot = job.clone();
                persist(&self.data_path, &state).map_err(TaskError::Internal)?;
                Ok(snapshot)
            }
            state => Err(TaskError::InvalidState(state)),
        }
    }

    /// Drop a job from scheduling without deleting its history.
    pub fn discard(&self, id: &str) -> Result<Job, TaskError> {
        let mut state = self.state.lock().expect("task store lock poisoned");
        let Some(job) = state.jobs.get_mut(id) else {
            return Err(TaskError::NotFound(id.to_string()));
        };
        match job.state {
            JobState::Processing => Err(TaskError::InvalidState(JobState::Processing)),
            _ => {
                job.state = JobState::Discarded;
                job.finished = Some(Utc::now());
                let snapshot = job.clone();
                persist(&self.data_path, &state).map_err(TaskError::Internal)?;
                Ok(snapshot)
            }
        }
    }

}

fn duration_ms(started: chrono::DateTime<Utc>, finished: chrono::DateTime<Utc>) -> u64 {
    (finished - started).num_milliseconds().max(0) as u64
}

fn load_persisted(path: &Path) -> Result<PersistedState> {
    if !path.exists() {
        return Ok(PersistedState::default());
    }
    let file = File::open(path).with_context(|| format!("open {}", path.display()))?;
    serde_json::from_reader(std::io::BufReader::new(file))
        .with_context(|| format!("parse {}", path.display()))
}

/// Serialize the whole table to a sibling temp file, then rename it into
/// place so readers never observe a torn document.
fn persist(path: &Path, state: &StoreState) -> Result<()> {
    let doc = PersistedState {
        jobs: {
            let mut jobs: Vec<Job> = state.jobs.values().cloned().collect();
            jobs.sort_by(|a, b| a.created.cmp(&b.created).then_with(|| a.id.cmp(&b.id)));
            jobs
        },
        executions: {
            let mut records: Vec<ExecutionRecord> =
                state.executions.values().flatten().cloned().collect();
            records.sort_by(|a, b| a.started.cmp(&b.started).then_with(|| a.id.cmp(&b.id)));
            records
        },
    };

    let tmp_path = path.with_extension("json.tmp");
    let file = File::create(&tmp_path)
        .with_context(|| format!("create temp store file {}", tmp_path.display()))?;
    serde_json::to_writer_pretty(&file, &doc)
        .with_context(|| format!("write {}", tmp_path.display()))?;
    file.sync_all()
        .with_context(|| format!("sync {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path)
        .with_context(|| format!("rename {} -> {}", tmp_path.display(), path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::domain::JobPriority;
    use serde_json::json;
    use std::collections::HashSet;
    use std::sync::Arc;

    fn job(id: &str, priority: JobPriority) -> Job {
        Job::new(id.to_string(), json!({"inputs": ["a.ts"]}), priority)
    }

    #[test]
    fn push_assigns_identity_and_rejects_pending_duplicates() {
        let dir = tempfile::tempdir().unwrap();
        let store = TaskStore::open(dir.path()).unwrap();

        let id = store
            .push(Job::new(String::new(), json!({"inputs": ["a.ts"]}), JobPriority::Normal))
            .unwrap();
        assert!(!id.is_empty());
        assert!(store.get(&id).unwrap().created.is_some());

        store.push(job("x", JobPriority::Normal)).unwrap();
        let err = store.push(job("x", JobPriority::High)).unwrap_err();
        assert!(matches!(err, TaskError::DuplicatePending(ref dup) if dup == "x"));
        // Store keeps exactly one record for the id.
        assert_eq!(store.list().iter().filter(|j| j.id == "x").count(), 1);
    }

    #[test]
    fn pop_honors_priority_then_creation_order() {
        let dir = tempfile::tempdir().unwrap();
        let store = TaskStore::open(dir.path()).unwrap();
        for (id, priority) in [
            ("low", JobPriority::Low),
            ("critical", JobPriority::Critical),
            ("normal-1", JobPriority::Normal),
            ("normal-2", JobPriority::Normal),
            ("high", JobPriority::High),
        ] {
            store.push(job(id, priority)).unwrap();
        }

        let order: Vec<String> = std::iter::from_fn(|| store.pop().unwrap())
            .map(|j| j.id)
            .collect();
        assert_eq!(order, ["critical", "high", "normal-1", "normal-2", "low"]);
        assert!(store.pop().unwrap().is_none());
    }

    #[test]
    fn pop_stamps_claim_metadata_and_opens_a_record() {
        let dir = tempfile::tempdir().unwrap();
        let store = TaskStore::open(dir.path()).unwrap();
        store.push(job("x", JobPriority::Normal)).unwrap();

        let claimed = store.pop().unwrap().unwrap();
        assert_eq!(claimed.state, JobState::Processing);
        assert_eq!(claimed.execution_count, 1);
        assert!(claimed.started.is_some());
        assert!(claimed.last_execution.is_some());

        let records = store.executions("x");
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].attempt, 1);
        assert_eq!(records[0].status, AttemptStatus::Running);
        assert_eq!(records[0].priority, JobPriority::Normal);
    }

    #[test]
    fn concurrent_pops_assign_each_job_exactly_once() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(TaskStore::open(dir.path()).unwrap());
        for i in 0..40 {
            store.push(job(&format!("job-{i}"), JobPriority::Normal)).unwrap();
        }

        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = store.clone();
            handles.push(std::thread::spawn(move || {
                let mut claimed = Vec::new();
                while let Some(job) = store.pop().unwrap() {
                    claimed.push(job.id);
                }
                claimed
            }));
        }

        let mut all: Vec<String> = Vec::new();
        for handle in handles {
            all.extend(handle.join().unwrap());
        }
        assert_eq!(all.len(), 40, "every job claimed");
        let unique: HashSet<&String> = all.iter().collect();
        assert_eq!(unique.len(), 40, "no job claimed twice");
    }

    #[test]
    fn state_survives_reopen_with_unknown_spec_fields_intact() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = TaskStore::open(dir.path()).unwrap();
            let mut j = job("x", JobPriority::High);
            j.spec = json!({"inputs": ["a.ts"], "futureKey": {"deep": [1, 2, 3]}});
            store.push(j).unwrap();
            store
                .with_job("x", |job| {
                    job.state = JobState::Completed;
                    job.result = Some("./output/x.mp4".into());
                })
                .unwrap();
        }

        let store = TaskStore::open(dir.path()).unwrap();
        let loaded = store.get("x").unwrap();
        assert_eq!(loaded.state, JobState::Completed);
        assert_eq!(loaded.result.as_deref(), Some("./output/x.mp4"));
        assert_eq!(
            loaded.spec.pointer("/futureKey/deep/2").and_then(|v| v.as_i64()),
            Some(3)
        );
    }

    #[test]
    fn processing_jobs_recover_to_pending_on_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = TaskStore::open(dir.path()).unwrap();
            store.push(job("x", JobPriority::Normal)).unwrap();
            let claimed = store.pop().unwrap().unwrap();
            assert_eq!(claimed.state, JobState::Processing);
            // Simulated crash: the store is dropped without finalizing.
        }

        let store = TaskStore::open(dir.path()).unwrap();
        assert_eq!(store.recovered_at_startup(), ["x".to_string()]);

        let recovered = store.get("x").unwrap();
        assert_eq!(recovered.state, JobState::Pending);
        assert_eq!(recovered.recovered_count, 1);
        assert_eq!(recovered.execution_count, 1, "interrupted attempt still counts");
        assert!(recovered.started.is_none());

        let records = store.executions("x");
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].status, AttemptStatus::Interrupted);
        assert!(records[0].finished.is_some());

        // The recovered job is claimable again and opens attempt 2.
        let reclaimed = store.pop().unwrap().unwrap();
        assert_eq!(reclaimed.execution_count, 2);
        assert_eq!(store.executions("x").len(), 2);
    }

    #[test]
    fn terminal_jobs_keep_their_state_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = TaskStore::open(dir.path()).unwrap();
            for (id, state) in [
                ("done", JobState::Completed),
                ("bad", JobState::Failed),
                ("gone", JobState::Cancelled),
            ] {
                store.push(job(id, JobPriority::Normal)).unwrap();
                store.with_job(id, |j| j.state = state).unwrap();
            }
        }

        let store = TaskStore::open(dir.path()).unwrap();
        assert!(store.recovered_at_startup().is_empty());
        assert_eq!(store.get("done").unwrap().state, JobState::Completed);
        assert_eq!(store.get("bad").unwrap().state, JobState::Failed);
        assert_eq!(store.get("gone").unwrap().state, JobState::Cancelled);
    }

    #[test]
    fn finalize_execution_is_idempotent_per_attempt() {
        let dir = tempfile::tempdir().unwrap();
        let store = TaskStore::open(dir.path()).unwrap();
        store.push(job("x", JobPriority::Normal)).unwrap();
        store.pop().unwrap().unwrap();

        store
            .finalize_execution("x", AttemptStatus::Failed, 0.4, None, Some("exit 1".into()))
            .unwrap();
        // Second finalize finds no Running record and must not clobber.
        store
            .finalize_execution("x", AttemptStatus::Completed, 1.0, Some("out".into()), None)
            .unwrap();

        let records = store.executions("x");
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].status, AttemptStatus::Failed);
        assert_eq!(records[0].error.as_deref(), Some("exit 1"));
        assert!(records[0].duration_ms.is_some());
    }

    #[test]
    fn retry_resets_terminal_jobs_only() {
        let dir = tempfile::tempdir().unwrap();
        let store = TaskStore::open(dir.path()).unwrap();
        store.push(job("x", JobPriority::Normal)).unwrap();
        store.pop().unwrap().unwrap();

        let err = store.reset_for_retry("x").unwrap_err();
        assert!(matches!(err, TaskError::InvalidState(JobState::Processing)));

        store
            .with_job("x", |j| {
                j.state = JobState::Failed;
                j.error = Some("encoder exit 1".into());
                j.finished = Some(Utc::now());
            })
            .unwrap();

        let reset = store.reset_for_retry("x").unwrap();
        assert_eq!(reset.state, JobState::Pending);
        assert!(reset.error.is_none());
        assert!(reset.started.is_none());
        assert!(reset.finished.is_none());
        assert_eq!(reset.execution_count, 1, "attempts increment on next claim");

        let reclaimed = store.pop().unwrap().unwrap();
        assert_eq!(reclaimed.execution_count, 2);
    }

    #[test]
    fn discard_refuses_processing_jobs() {
        let dir = tempfile::tempdir().unwrap();
        let store = TaskStore::open(dir.path()).unwrap();
        store.push(job("x", JobPriority::Normal)).unwrap();
        store.pop().unwrap().unwrap();
        assert!(matches!(
            store.discard("x").unwrap_err(),
            TaskError::InvalidState(JobState::Processing)
        ));

        store.push(job("y", JobPriority::Normal)).unwrap();
        let discarded = store.discard("y").unwrap();
        assert_eq!(discarded.state, JobState::Discarded);
    }

    #[test]
    fn second_store_on_same_directory_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let _first = TaskStore::open(dir.path()).unwrap();
        assert!(TaskStore::open(dir.path()).is_err());
    }

    #[test]
    fn persisted_document_is_valid_json_with_camel_case_keys() {
        let dir = tempfile::tempdir().unwrap();
        let store = TaskStore::open(dir.path()).unwrap();
        store.push(job("x", JobPriority::Critical)).unwrap();
        store.pop().unwrap().unwrap();

        let raw = fs::read_to_string(dir.path().join("tasks.json")).unwrap();
        let doc: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(
            doc.pointer("/jobs/0/priority").and_then(|v| v.as_str()),
            Some("critical")
        );
        assert_eq!(
            doc.pointer("/executions/0/jobId").and_then(|v| v.as_str()),
            Some("x")
        );
    }
}
