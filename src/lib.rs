//! clipforge: asynchronous video-edit job service.
//!
//! Jobs arrive as declarative JSON specs, land in a durable priority queue,
//! and are executed by a pool of worker threads that orchestrate an external
//! ffmpeg-compatible encoder: parallel pre-decode of the inputs, concat and
//! encode with hardware detection and software fallback, fingerprint-based
//! result caching, and optional post-success upload.
//!
//! [`VideoService`] is the facade the HTTP layer talks to; everything under
//! [`core`] is the job-execution substrate behind it.

pub mod core;

#[cfg(test)]
pub mod test_support;

pub use crate::core::{
    CancelToken, ExecutionRecord, Job, JobPriority, JobState, ServiceConfig, ServiceStats,
    TaskError, TaskStats, TaskStatus, VideoService,
};
