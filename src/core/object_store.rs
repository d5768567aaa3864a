use std::path::Path;

use anyhow::Result;

/// Summary of one stored object, as returned by listings.
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectSummary {
    pub key: String,
    pub byte_size: u64,
}

/// Collaborator seam for the object store. The real SDK wrapper lives
/// outside this crate; the pipeline only needs these five operations and
/// treats every one of them as fallible network I/O.
pub trait ObjectStore: Send + Sync {
    /// Upload a local file under `key`, returning the public URL.
    fn upload_file(&self, local_path: &Path, key: &str) -> Result<String>;

    /// Fetch `key` into `local_path`.
    fn download_file(&self, key: &str, local_path: &Path) -> Result<()>;

    fn list_objects(&self, prefix: &str, max_keys: usize) -> Result<Vec<ObjectSummary>>;

    fn delete_object(&self, key: &str) -> Result<()>;

    /// Pre-signed GET URL valid for `ttl_secs`.
    fn signed_url(&self, key: &str, ttl_secs: u64) -> Result<String>;
}
