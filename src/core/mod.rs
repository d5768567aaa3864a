pub mod buffer_pool;
pub mod cache;
pub mod cancel;
pub mod config;
pub mod domain;
pub mod download;
pub mod encoder;
pub mod error;
pub mod executor;
pub mod ffprobe;
pub mod fingerprint;
pub mod joblog;
pub mod monitor;
pub mod object_store;
pub mod processor;
pub mod queue;
pub mod service;
pub mod store;
pub mod worker;

pub use cancel::CancelToken;
pub use config::ServiceConfig;
pub use domain::{
    ExecutionRecord, Job, JobPriority, JobState, TaskStatus, CANCELLED_MESSAGE,
};
pub use error::TaskError;
pub use service::{ServiceStats, TaskStats, VideoService};
