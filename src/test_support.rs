//! Shared helpers for tests that drive the env-var-controlled mock encoder.

use std::ffi::{OsStr, OsString};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use once_cell::sync::Lazy;

/// Every environment key the mock encoder binary understands.
pub const MOCK_ENCODER_ENV_KEYS: [&str; 7] = [
    "CLIPFORGE_MOCK_ENCODER_CAPTURE_PATH",
    "CLIPFORGE_MOCK_ENCODER_AVAILABLE_ENCODERS",
    "CLIPFORGE_MOCK_ENCODER_STDOUT",
    "CLIPFORGE_MOCK_ENCODER_STDERR",
    "CLIPFORGE_MOCK_ENCODER_FAIL_IF_ARG",
    "CLIPFORGE_MOCK_ENCODER_SLEEP_MS",
    "CLIPFORGE_MOCK_ENCODER_EXIT_CODE",
];

static ENV_MUTEX: Lazy<Mutex<()>> = Lazy::new(|| Mutex::new(()));

/// Serializes tests that configure the mock encoder: spawned encoders
/// inherit whatever the process environment holds at spawn time, so tests
/// must not interleave their settings.
pub fn env_lock() -> MutexGuard<'static, ()> {
    ENV_MUTEX.lock().unwrap_or_else(|err| err.into_inner())
}

pub fn set_env<K: AsRef<OsStr>, V: AsRef<OsStr>>(key: K, value: V) {
    std::env::set_var(key, value);
}

pub fn remove_env<K: AsRef<OsStr>>(key: K) {
    std::env::remove_var(key);
}

/// Start from a clean slate so settings from an aborted test never leak in.
pub fn clear_mock_encoder_env() {
    for key in MOCK_ENCODER_ENV_KEYS {
        remove_env(key);
    }
}

/// Restores the captured variables to their original values on drop.
pub struct EnvVarGuard {
    prev: Vec<(String, Option<OsString>)>,
}

impl EnvVarGuard {
    pub fn capture<I, S>(keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let prev = keys
            .into_iter()
            .map(|key| {
                let key = key.as_ref().to_string();
                let value = std::env::var_os(&key);
                (key, value)
            })
            .collect();
        Self { prev }
    }
}

impl Drop for EnvVarGuard {
    fn drop(&mut self) {
        for (key, value) in self.prev.drain(..) {
            match value {
                Some(v) => set_env(&key, v),
                None => remove_env(&key),
            }
        }
    }
}

/// Locate the compiled `mock_encoder` test binary. Cargo only exports
/// `CARGO_BIN_EXE_*` for bin targets, so the reliable path is scanning the
/// directory the current test executable lives in (`target/<profile>/deps`),
/// where the harness-less mock target is compiled alongside it.
pub fn locate_mock_encoder_exe() -> PathBuf {
    fn is_executable_candidate(path: &Path) -> bool {
        if !path.is_file() {
            return false;
        }
        if cfg!(windows) {
            return path
                .extension()
                .and_then(|e| e.to_str())
                .is_some_and(|e| e.eq_ignore_ascii_case("exe"));
        }
        path.extension().is_none()
    }

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
            .filter(|path| is_executable_candidate(path))
            .collect();
        matches.sort();
        matches.into_iter().next()
    }

    for key in ["CARGO_BIN_EXE_mock_encoder", "CARGO_BIN_EXE_mock-encoder"] {
        if let Ok(path) = std::env::var(key) {
            if !path.trim().is_empty() {
                let p = PathBuf::from(path);
                if p.exists() {
                    return p;
                }
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

    let crate_root = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
    let target_root = crate_root.join("target");
    for profile in ["debug", "release"] {
        let deps_dir = target_root.join(profile).join("deps");
        if deps_dir.exists() {
            if let Some(found) = find_in_dir(&deps_dir) {
                return found;
            }
        }
    }

    panic!("unable to locate the mock encoder executable (mock_encoder test target)");
}

/// The locator result as the string form used by `ServiceConfig` fields.
pub fn mock_encoder_bin() -> String {
    locate_mock_encoder_exe().to_string_lossy().into_owned()
}
