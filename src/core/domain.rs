use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::error::TaskError;

/// Scheduling priority of a job. Higher variants are always dequeued before
/// lower ones; within one priority the earliest-created job wins.
#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash, Default,
)]
#[serde(rename_all = "lowercase")]
pub enum JobPriority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

impl JobPriority {
    /// Numeric rank used for ordering and monitor output (Low=0 .. Critical=3).
    pub fn rank(self) -> u8 {
        match self {
            JobPriority::Low => 0,
            JobPriority::Normal => 1,
            JobPriority::High => 2,
            JobPriority::Critical => 3,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Pending,
    Processing,
    Completed,
    Failed,
    Cancelled,
    Discarded,
}

impl JobState {
    /// Terminal states are absorbing; only an explicit retry leaves them.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobState::Completed | JobState::Failed | JobState::Cancelled | JobState::Discarded
        )
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            JobState::Pending => "pending",
            JobState::Processing => "processing",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
            JobState::Cancelled => "cancelled",
            JobState::Discarded => "discarded",
        };
        f.write_str(s)
    }
}

/// One unit of video work. The `spec` tree is caller-provided and preserved
/// verbatim across persistence; the service itself only reads the small set
/// of recognized keys exposed through [`EditParams`] and [`PreprocessParams`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: String,
    pub spec: Value,
    pub priority: JobPriority,
    pub state: JobState,
    pub created: Option<DateTime<Utc>>,
    pub started: Option<DateTime<Utc>>,
    pub finished: Option<DateTime<Utc>>,
    /// Fraction in [0, 1]; monotonic within one attempt, reset on retry.
    pub progress: f64,
    /// Locator of the produced artifact once Completed: a local path, or the
    /// uploaded URL when an object-store target was configured.
    pub result: Option<String>,
    /// Last error diagnostic once Failed.
    pub error: Option<String>,
    /// Non-fatal notices surfaced to the caller (upload warnings, recovery
    /// notes). Never clears the Completed state.
    pub message: Option<String>,
    /// Number of attempts started so far. Becomes 1 when the first attempt
    /// is claimed and grows by one per retry claim.
    pub execution_count: u32,
    pub last_execution: Option<DateTime<Utc>>,
    /// Times this job was rewritten Processing -> Pending by startup
    /// recovery after an unclean shutdown.
    pub recovered_count: u32,
    /// Enables per-job detailed logging for this job only.
    pub verbose: bool,
}

impl Job {
    /// Fresh Pending job around a caller-provided spec tree. Identity,
    /// priority and creation time fall back to defaults when absent.
    pub fn new(id: String, spec: Value, priority: JobPriority) -> Self {
        Self {
            id,
            spec,
            priority,
            state: JobState::Pending,
            created: Some(Utc::now()),
            started: None,
            finished: None,
            progress: 0.0,
            result: None,
            error: None,
            message: None,
            execution_count: 0,
            last_execution: None,
            recovered_count: 0,
            verbose: false,
        }
    }

    /// Recognized `taskType` key, defaulting to `videoEdit`.
    pub fn task_type(&self) -> TaskType {
        match self.spec.get("taskType").and_then(Value::as_str) {
            Some("materialPreprocess") => TaskType::MaterialPreprocess,
            _ => TaskType::VideoEdit,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskType {
    VideoEdit,
    MaterialPreprocess,
}

/// Status an attempt ended in. `Running` only ever appears on the in-flight
/// record of a live attempt; recovery rewrites it to `Interrupted`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AttemptStatus {
    Running,
    Completed,
    Failed,
    Cancelled,
    Interrupted,
}

/// Append-only snapshot of one attempt. Created at claim, finalized exactly
/// once at the attempt's terminal transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionRecord {
    pub id: String,
    pub job_id: String,
    /// 1-based attempt number.
    pub attempt: u32,
    pub status: AttemptStatus,
    pub started: DateTime<Utc>,
    pub finished: Option<DateTime<Utc>>,
    pub duration_ms: Option<u64>,
    /// Progress fraction reached when the attempt ended.
    pub progress: f64,
    pub result: Option<String>,
    pub error: Option<String>,
    /// Priority observed at claim time; retries may run under a different
    /// priority than earlier attempts if the job was updated in between.
    pub priority: JobPriority,
    pub spec: Value,
}

/// Caller-facing task status, shaped for the HTTP layer. Timestamps are
/// RFC 3339 via chrono's serde impls.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskStatus {
    pub task_id: String,
    pub status: JobState,
    pub progress: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub created: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_url: Option<String>,
    pub priority: JobPriority,
}

impl From<&Job> for TaskStatus {
    fn from(job: &Job) -> Self {
        let message = match job.state {
            JobState::Failed => job.error.clone().or_else(|| job.message.clone()),
            JobState::Cancelled => Some(CANCELLED_MESSAGE.to_string()),
            _ => job.message.clone(),
        };
        Self {
            task_id: job.id.clone(),
            status: job.state,
            progress: job.progress,
            message,
            created: job.created,
            started: job.started,
            finished: job.finished,
            output_url: job.result.clone(),
            priority: job.priority,
        }
    }
}

/// Fixed phrase surfaced for cancelled jobs.
pub const CANCELLED_MESSAGE: &str = "task cancelled by request";

/// Payload POSTed to a job's `callback` URL when a preprocess task ends.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallbackPayload {
    pub task_id: String,
    pub status: JobState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Recognized keys of a `videoEdit` spec, with defaults applied.
#[derive(Debug, Clone, PartialEq)]
pub struct EditParams {
    pub out_path: String,
    pub width: i64,
    pub height: i64,
    pub fps: i64,
    pub preset: String,
    pub inputs: Vec<String>,
    pub oss_output: Option<String>,
}

impl EditParams {
    /// Parse the recognized keys out of a job's spec tree. Missing keys get
    /// the documented defaults; present-but-wrong-shaped keys are a
    /// [`TaskError::BadSpec`].
    pub fn from_spec(job_id: &str, spec: &Value) -> Result<Self, TaskError> {
        let obj = spec
            .as_object()
            .ok_or_else(|| TaskError::BadSpec("spec must be a JSON object".into()))?;

        let out_path = match obj.get("outPath") {
            None | Some(Value::Null) => format!("./output/{job_id}.mp4"),
            Some(Value::String(s)) if !s.trim().is_empty() => s.clone(),
            Some(other) => {
                return Err(TaskError::BadSpec(format!(
                    "outPath must be a non-empty string, got {other}"
                )))
            }
        };

        let width = int_key(obj, "width", 1920)?;
        let height = int_key(obj, "height", 1080)?;
        let fps = int_key(obj, "fps", 30)?;
        if width <= 0 || height <= 0 || fps <= 0 {
            return Err(TaskError::BadSpec(format!(
                "width/height/fps must be positive, got {width}x{height}@{fps}"
            )));
        }

        let preset = match obj.get("preset") {
            None | Some(Value::Null) => default_preset(width, height).to_string(),
            Some(Value::String(s)) if !s.trim().is_empty() => s.clone(),
            Some(other) => {
                return Err(TaskError::BadSpec(format!(
                    "preset must be a string, got {other}"
                )))
            }
        };

        let inputs = match obj.get("inputs") {
            Some(Value::Array(items)) if !items.is_empty() => {
                let mut inputs = Vec::with_capacity(items.len());
                for item in items {
                    match item.as_str() {
                        Some(s) if !s.trim().is_empty() => inputs.push(s.to_string()),
                        _ => {
                            return Err(TaskError::BadSpec(format!(
                                "inputs entries must be non-empty strings, got {item}"
                            )))
                        }
                    }
                }
                inputs
            }
            Some(Value::Array(_)) => {
                return Err(TaskError::BadSpec("inputs must not be empty".into()))
            }
            Some(other) => {
                return Err(TaskError::BadSpec(format!(
                    "inputs must be a list of locators, got {other}"
                )))
            }
            None => return Err(TaskError::BadSpec("inputs is required".into())),
        };

        let oss_output = match obj.get("OSSOutput").or_else(|| obj.get("ossOutput")) {
            None | Some(Value::Null) => None,
            Some(Value::String(s)) if !s.trim().is_empty() => Some(s.clone()),
            Some(other) => {
                return Err(TaskError::BadSpec(format!(
                    "OSSOutput must be a string key, got {other}"
                )))
            }
        };

        Ok(Self {
            out_path,
            width,
            height,
            fps,
            preset,
            inputs,
            oss_output,
        })
    }
}

/// Recognized keys of a `materialPreprocess` spec.
#[derive(Debug, Clone, PartialEq)]
pub struct PreprocessParams {
    pub source: String,
    pub callback: Option<String>,
}

impl PreprocessParams {
    pub fn from_spec(spec: &Value) -> Result<Self, TaskError> {
        let obj = spec
            .as_object()
            .ok_or_else(|| TaskError::BadSpec("spec must be a JSON object".into()))?;
        let source = match obj.get("source") {
            Some(Value::String(s)) if !s.trim().is_empty() => s.clone(),
            _ => return Err(TaskError::BadSpec("source is required".into())),
        };
        Ok(Self {
            source,
            callback: callback_url(spec),
        })
    }
}

/// Optional `callback` URL shared by both task types.
pub fn callback_url(spec: &Value) -> Option<String> {
    match spec.get("callback") {
        Some(Value::String(s)) if !s.trim().is_empty() => Some(s.clone()),
        _ => None,
    }
}

fn int_key(
    obj: &serde_json::Map<String, Value>,
    key: &str,
    default: i64,
) -> Result<i64, TaskError> {
    match obj.get(key) {
        None | Some(Value::Null) => Ok(default),
        Some(value) => value
            .as_i64()
            .ok_or_else(|| TaskError::BadSpec(format!("{key} must be an integer, got {value}"))),
    }
}

/// Encoder preset derived from the target resolution when the spec does not
/// pin one: small targets favour speed, full-HD and above favour quality.
pub fn default_preset(width: i64, height: i64) -> &'static str {
    if width <= 640 && height <= 480 {
        "fast"
    } else if width >= 1920 && height >= 1080 {
        "slow"
    } else {
        "medium"
    }
}
