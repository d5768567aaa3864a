//! End-to-end scenarios against the service facade with the mock encoder.

#![cfg(unix)]

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use serde_json::json;

use clipforge::core::domain::{AttemptStatus, Job};
use clipforge::core::store::TaskStore;
use clipforge::{JobPriority, JobState, ServiceConfig, VideoService};

const MOCK_ENCODER_ENV_KEYS: [&str; 7] = [
    "CLIPFORGE_MOCK_ENCODER_CAPTURE_PATH",
    "CLIPFORGE_MOCK_ENCODER_AVAILABLE_ENCODERS",
    "CLIPFORGE_MOCK_ENCODER_STDOUT",
    "CLIPFORGE_MOCK_ENCODER_STDERR",
    "CLIPFORGE_MOCK_ENCODER_FAIL_IF_ARG",
    "CLIPFORGE_MOCK_ENCODER_SLEEP_MS",
    "CLIPFORGE_MOCK_ENCODER_EXIT_CODE",
];

static ENV_MUTEX: Mutex<()> = Mutex::new(());

/// Holds the env lock for the test's lifetime, applies the given mock
/// settings on a cleared slate, and restores the previous values on drop.
struct MockEncoderEnv {
    prev: Vec<(&'static str, Option<OsString>)>,
    _lock: MutexGuard<'static, ()>,
}

impl MockEncoderEnv {
    fn with(vars: &[(&str, &str)]) -> Self {
        let lock = ENV_MUTEX.lock().unwrap_or_else(|err| err.into_inner());
        let prev = MOCK_ENCODER_ENV_KEYS
            .iter()
            .map(|key| (*key, std::env::var_os(key)))
            .collect();
        for key in MOCK_ENCODER_ENV_KEYS {
            std::env::remove_var(key);
        }
        for (key, value) in vars {
            std::env::set_var(key, value);
        }
        Self { prev, _lock: lock }
    }
}

impl Drop for MockEncoderEnv {
    fn drop(&mut self) {
        for (key, value) in self.prev.drain(..) {
            match value {
                Some(v) => std::env::set_var(key, v),
                None => std::env::remove_var(key),
            }
        }
    }
}

/// Locate the compiled `mock_encoder` test binary: the harness-less target
/// is built into the same deps directory as this test executable.
fn locate_mock_encoder_exe() -> PathBuf {
    fn find_in_dir(dir: &Path) -> Option<PathBuf> {
        let prefixes = ["mock_encoder", "mock-encoder"];
        let mut matches: Vec<PathBuf> = std::fs::read_dir(dir)
            .ok()?
            .flatten()
            .map(|entry| entry.path())
            .filter(|path| {
                path.file_name()
                    .and_then(|name| name.to_str())
                    .is_some_and(|name| prefixes.iter().any(|prefix| name.starts_with(prefix)))
            })
            .filter(|path| path.is_file() && path.extension().is_none())
            .collect();
        matches.sort();
        matches.into_iter().next()
    }

    for key in ["CARGO_BIN_EXE_mock_encoder", "CARGO_BIN_EXE_mock-encoder"] {
        if let Ok(path) = std::env::var(key) {
            if !path.trim().is_empty() && Path::new(&path).exists() {
                return PathBuf::from(path);
            }
        }
    }

    if let Ok(current) = std::env::current_exe() {
        if let Some(dir) = current.parent() {
            if let Some(found) = find_in_dir(dir) {
                return found;
            }
        }
    }

    panic!("unable to locate the mock encoder executable (mock_encoder test target)");
}

fn config_for(dir: &Path, workers: usize) -> ServiceConfig {
    let mut config = ServiceConfig::rooted_at(dir);
    config.max_workers = workers;
    config.encoder_bin = locate_mock_encoder_exe().to_string_lossy().into_owned();
    config.probe_bin = "/nonexistent/probe".to_string();
    config
}

fn write_input(dir: &Path, name: &str) -> String {
    let path = dir.join(name);
    std::fs::write(&path, b"media").unwrap();
    path.to_string_lossy().into_owned()
}

fn wait_state(service: &VideoService, id: &str, state: JobState, timeout: Duration) {
    let deadline = Instant::now() + timeout;
    loop {
        let current = service.status(id).expect("job exists").status;
        if current == state {
            return;
        }
        assert!(
            Instant::now() < deadline,
            "job {id} stuck in {current:?} waiting for {state:?}"
        );
        std::thread::sleep(Duration::from_millis(25));
    }
}

#[test]
fn retries_are_spaced_by_the_linear_backoff() {
    let _env = MockEncoderEnv::with(&[
        ("CLIPFORGE_MOCK_ENCODER_STDERR", "rigged failure"),
        ("CLIPFORGE_MOCK_ENCODER_EXIT_CODE", "1"),
    ]);
    let dir = tempfile::tempdir().unwrap();
    // Default backoff: 2 s after attempt 1, 4 s after attempt 2.
    let service = VideoService::start(config_for(dir.path(), 1)).unwrap();

    let input = write_input(dir.path(), "a.ts");
    let id = service
        .submit_edit(json!({"inputs": [input]}), None, None, None)
        .unwrap();
    wait_state(&service, &id, JobState::Failed, Duration::from_secs(30));

    let records = service.executions(&id).unwrap();
    assert_eq!(records.len(), 3);
    assert!(records
        .iter()
        .all(|r| r.status == AttemptStatus::Failed));

    let gap_1 = (records[1].started - records[0].started)
        .to_std()
        .unwrap();
    let gap_2 = (records[2].started - records[1].started)
        .to_std()
        .unwrap();
    assert!(gap_1 >= Duration::from_secs(2), "first gap was {gap_1:?}");
    assert!(gap_2 >= Duration::from_secs(4), "second gap was {gap_2:?}");

    let status = service.status(&id).unwrap();
    assert!(status.message.as_deref().unwrap().contains("rigged failure"));
    service.shutdown();
}

#[test]
fn interrupted_jobs_recover_and_complete_after_restart() {
    let _env = MockEncoderEnv::with(&[]);
    let dir = tempfile::tempdir().unwrap();
    let config = config_for(dir.path(), 1);
    let input = write_input(dir.path(), "a.ts");
    let out = dir.path().join("out/final.mp4");

    // Simulate a crash: claim the job through a bare store, then drop it
    // without ever finalizing the attempt.
    let job_id = {
        let store = TaskStore::open(&config.data_dir).unwrap();
        let id = store
            .push(Job::new(
                String::new(),
                json!({"inputs": [input], "outPath": out.to_string_lossy()}),
                JobPriority::Normal,
            ))
            .unwrap();
        let claimed = store.pop().unwrap().unwrap();
        assert_eq!(claimed.state, JobState::Processing);
        id
    };

    let service = VideoService::start(config).unwrap();
    wait_state(&service, &job_id, JobState::Completed, Duration::from_secs(10));
    assert!(out.exists());

    let records = service.executions(&job_id).unwrap();
    assert_eq!(records.len(), 2);
    assert_eq!(records[0].status, AttemptStatus::Interrupted);
    assert_eq!(records[1].status, AttemptStatus::Completed);
    assert_eq!(records[1].attempt, 2);
    service.shutdown();
}

#[test]
fn stopped_pool_preserves_priority_order_when_started() {
    let _env = MockEncoderEnv::with(&[]);
    let dir = tempfile::tempdir().unwrap();
    let service = VideoService::start(config_for(dir.path(), 0)).unwrap();

    let mut ids = Vec::new();
    for (name, priority) in [
        ("low", JobPriority::Low),
        ("critical", JobPriority::Critical),
        ("normal", JobPriority::Normal),
        ("high", JobPriority::High),
    ] {
        let input = write_input(dir.path(), &format!("{name}.ts"));
        let id = service
            .submit_edit(json!({"inputs": [input]}), None, None, Some(priority))
            .unwrap();
        ids.push((priority, id));
    }
    assert_eq!(service.task_stats().pending, 4);

    service.resize_workers(1);
    for (_, id) in &ids {
        wait_state(&service, id, JobState::Completed, Duration::from_secs(20));
    }

    let mut processed: Vec<(chrono::DateTime<chrono::Utc>, JobPriority)> = ids
        .iter()
        .map(|(priority, id)| {
            let records = service.executions(id).unwrap();
            (records[0].started, *priority)
        })
        .collect();
    processed.sort();
    let order: Vec<JobPriority> = processed.into_iter().map(|(_, p)| p).collect();
    assert_eq!(
        order,
        [
            JobPriority::Critical,
            JobPriority::High,
            JobPriority::Normal,
            JobPriority::Low
        ]
    );
    service.shutdown();
}

#[test]
fn duplicate_pending_ids_are_rejected_at_the_store() {
    let dir = tempfile::tempdir().unwrap();
    let store = TaskStore::open(&dir.path().join("data")).unwrap();

    store
        .push(Job::new(
            "X".into(),
            json!({"inputs": ["a.ts"]}),
            JobPriority::Normal,
        ))
        .unwrap();
    let err = store
        .push(Job::new(
            "X".into(),
            json!({"inputs": ["b.ts"]}),
            JobPriority::Critical,
        ))
        .unwrap_err();
    assert!(matches!(
        err,
        clipforge::TaskError::DuplicatePending(ref id) if id == "X"
    ));
    assert_eq!(store.list().len(), 1);
}
