use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::core::executor::ExecutorConfig;

pub const DEFAULT_PORT: u16 = 8082;
pub const DEFAULT_MAX_WORKERS: usize = 12;
pub const DEFAULT_CACHE_CAPACITY: usize = 128;
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Service configuration, resolved from the environment at startup and
/// passed by reference into every component that needs it. The HTTP port is
/// not consumed here; it is resolved and exposed for the external HTTP
/// facade that fronts the service.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub port: u16,
    pub max_workers: usize,
    pub data_dir: PathBuf,
    pub log_dir: PathBuf,
    pub temp_dir: PathBuf,
    pub output_dir: PathBuf,
    pub encoder_bin: String,
    pub probe_bin: String,
    pub cache_capacity: usize,
    pub max_attempts: u32,
    /// Base of the linear retry backoff: attempt `k` waits `k * base`.
    pub retry_backoff: Duration,
    pub download_timeout: Duration,
    pub executor: ExecutorConfig,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            max_workers: DEFAULT_MAX_WORKERS,
            data_dir: PathBuf::from("./data"),
            log_dir: PathBuf::from("./log"),
            temp_dir: PathBuf::from("./temp"),
            output_dir: PathBuf::from("./output"),
            encoder_bin: "ffmpeg".to_string(),
            probe_bin: "ffprobe".to_string(),
            cache_capacity: DEFAULT_CACHE_CAPACITY,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            retry_backoff: Duration::from_secs(2),
            download_timeout: Duration::from_secs(60),
            executor: ExecutorConfig::default(),
        }
    }
}

impl ServiceConfig {
    /// Resolve configuration from the environment, falling back to the
    /// documented defaults for anything unset or unparseable.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(port) = env_parse::<u16>("PORT") {
            config.port = port;
        }
        if let Some(workers) = env_parse::<usize>("MAX_WORKERS") {
            config.max_workers = workers.max(1);
        }
        if let Some(dir) = env_path("CLIPFORGE_DATA_DIR") {
            config.data_dir = dir;
        }
        if let Some(dir) = env_path("CLIPFORGE_LOG_DIR") {
            config.log_dir = dir;
        }
        if let Some(dir) = env_path("CLIPFORGE_TEMP_DIR") {
            config.temp_dir = dir;
        }
        if let Some(dir) = env_path("CLIPFORGE_OUTPUT_DIR") {
            config.output_dir = dir;
        }
        if let Ok(bin) = std::env::var("CLIPFORGE_ENCODER") {
            if !bin.trim().is_empty() {
                config.encoder_bin = bin;
            }
        }
        if let Ok(bin) = std::env::var("CLIPFORGE_PROBE") {
            if !bin.trim().is_empty() {
                config.probe_bin = bin;
            }
        }
        if let Some(capacity) = env_parse::<usize>("CLIPFORGE_CACHE_CAPACITY") {
            config.cache_capacity = capacity.max(1);
        }
        config
    }

    /// Root every service directory under one base path. The layout below
    /// the root matches production (`data/`, `log/`, `temp/`, `output/`),
    /// which keeps tests honest about relative-path handling.
    pub fn rooted_at(root: &Path) -> Self {
        Self {
            data_dir: root.join("data"),
            log_dir: root.join("log"),
            temp_dir: root.join("temp"),
            output_dir: root.join("output"),
            ..Self::default()
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    let raw = std::env::var(key).ok()?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(key, raw = %raw, "ignoring unparseable environment override");
            None
        }
    }
}

fn env_path(key: &str) -> Option<PathBuf> {
    let raw = std::env::var(key).ok()?;
    if raw.trim().is_empty() {
        return None;
    }
    Some(PathBuf::from(raw))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_documented_contract() {
        let config = ServiceConfig::default();
        assert_eq!(config.port, 8082);
        assert_eq!(config.max_workers, 12);
        assert_eq!(config.max_attempts, 3);
        assert_eq!(config.retry_backoff, Duration::from_secs(2));
        assert_eq!(config.encoder_bin, "ffmpeg");
        assert_eq!(config.probe_bin, "ffprobe");
    }

    #[test]
    fn rooted_config_keeps_the_production_layout() {
        let config = ServiceConfig::rooted_at(Path::new("/srv/clipforge"));
        assert_eq!(config.data_dir, Path::new("/srv/clipforge/data"));
        assert_eq!(config.log_dir, Path::new("/srv/clipforge/log"));
        assert_eq!(config.temp_dir, Path::new("/srv/clipforge/temp"));
        assert_eq!(config.output_dir, Path::new("/srv/clipforge/output"));
    }
}
