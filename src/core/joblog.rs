use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde_json::{json, Value};

/// Writer for per-job log files: one JSON object per line under
/// `<root>/tasks/<job id>.log`, keys `ts`/`level`/`msg`/`ctx`. Logging is
/// best-effort; a failed append must never fail the job it describes.
pub struct JobLogger {
    root: PathBuf,
}

impl JobLogger {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn path_for(&self, job_id: &str) -> PathBuf {
        self.root.join("tasks").join(format!("{job_id}.log"))
    }

    pub fn info(&self, job_id: &str, msg: &str, ctx: Option<Value>) {
        self.append(job_id, "info", msg, ctx);
    }

    pub fn warn(&self, job_id: &str, msg: &str, ctx: Option<Value>) {
        self.append(job_id, "warn", msg, ctx);
    }

    pub fn error(&self, job_id: &str, msg: &str, ctx: Option<Value>) {
        self.append(job_id, "error", msg, ctx);
    }

    fn append(&self, job_id: &str, level: &str, msg: &str, ctx: Option<Value>) {
        let entry = json!({
            "ts": Utc::now().to_rfc3339(),
            "level": level,
            "msg": msg,
            "ctx": ctx.unwrap_or(Value::Null),
        });
        if let Err(err) = self.append_line(job_id, &entry) {
            tracing::warn!(job_id, %err, "failed to append job log line");
        }
    }

    fn append_line(&self, job_id: &str, entry: &Value) -> std::io::Result<()> {
        let path = self.path_for(job_id);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
        let mut line = serde_json::to_string(entry).unwrap_or_else(|_| "{}".to_string());
        line.push('\n');
        file.write_all(line.as_bytes())
    }

    /// Full log content for a job, empty when nothing was logged yet.
    pub fn read(&self, job_id: &str) -> String {
        fs::read_to_string(self.path_for(job_id)).unwrap_or_default()
    }

    /// Last `max_bytes` of a job's log as lossy UTF-8, trimmed to whole
    /// lines. Bounded so the monitor surface never streams unbounded files.
    pub fn tail(&self, job_id: &str, max_bytes: u64) -> String {
        tail_file(&self.path_for(job_id), max_bytes)
    }
}

fn tail_file(path: &Path, max_bytes: u64) -> String {
    let Ok(data) = fs::read(path) else {
        return String::new();
    };
    let start = if data.len() as u64 > max_bytes {
        (data.len() as u64 - max_bytes) as usize
    } else {
        0
    };
    let text = String::from_utf8_lossy(&data[start..]);
    if start == 0 {
        return text.into_owned();
    }
    // Drop the possibly-truncated first line.
    match text.find('\n') {
        Some(idx) => text[idx + 1..].to_string(),
        None => text.into_owned(),
    }
}
