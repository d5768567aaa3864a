use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;
use std::time::Duration;

use anyhow::Context;

use crate::core::buffer_pool::{BufferPool, DEFAULT_COPY_CHUNK};
use crate::core::domain::CallbackPayload;
use crate::core::error::TaskError;

/// Whether an input locator names a remote source that must be fetched
/// before the encoder can see it.
pub fn is_remote(locator: &str) -> bool {
    locator.starts_with("http://") || locator.starts_with("https://")
}

/// Fetch `url` into `dst`, streaming through a pooled buffer. Timeouts are
/// recoverable (`IoTimeout`); an unreachable or non-2xx source is
/// `SourceMissing` like any other absent input.
pub fn download_to_file(
    url: &str,
    dst: &Path,
    pool: &BufferPool,
    timeout: Duration,
) -> Result<u64, TaskError> {
    let client = reqwest::blocking::Client::builder()
        .timeout(timeout)
        .build()
        .context("build download client")
        .map_err(TaskError::Internal)?;

    let response = client.get(url).send().map_err(|err| {
        if err.is_timeout() {
            TaskError::IoTimeout(format!("download {url}: {err}"))
        } else {
            TaskError::SourceMissing(format!("{url}: {err}"))
        }
    })?;

    if !response.status().is_success() {
        return Err(TaskError::SourceMissing(format!(
            "{url}: server returned {}",
            response.status()
        )));
    }

    if let Some(parent) = dst.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("create directory {}", parent.display()))
            .map_err(TaskError::Internal)?;
    }
    let mut file = File::create(dst)
        .with_context(|| format!("create {}", dst.display()))
        .map_err(TaskError::Internal)?;

    let mut reader = response;
    let mut buf = pool.get(DEFAULT_COPY_CHUNK);
    let mut total: u64 = 0;
    loop {
        // Mid-stream failures are worth retrying regardless of their exact
        // kind; the connection was already good enough to start the body.
        let read = reader
            .read(&mut buf)
            .map_err(|err| TaskError::IoTimeout(format!("download {url} interrupted: {err}")))?;
        if read == 0 {
            break;
        }
        file.write_all(&buf[..read])
            .with_context(|| format!("write {}", dst.display()))
            .map_err(TaskError::Internal)?;
        total += read as u64;
    }
    pool.put(buf);
    Ok(total)
}

/// Best-effort completion callback: one POST, short timeout, response
/// ignored. Failures are logged and swallowed; a callback must never
/// change a job's outcome.
pub fn post_callback(url: &str, payload: &CallbackPayload) {
    let client = match reqwest::blocking::Client::builder()
        .timeout(Duration::from_secs(10))
        .build()
    {
        Ok(client) => client,
        Err(err) => {
            tracing::warn!(url, %err, "callback client could not be built");
            return;
        }
    };
    match client.post(url).json(payload).send() {
        Ok(response) => {
            tracing::debug!(url, status = %response.status(), "callback delivered");
        }
        Err(err) => {
            tracing::warn!(url, %err, task_id = %payload.task_id, "callback delivery failed");
        }
    }
}
