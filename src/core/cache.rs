use std::collections::{HashMap, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use chrono::{DateTime, Utc};

/// One memoized encode output. `created_at` is stamped from the artifact's
/// mtime at insert time, so a later lookup can detect the file being swapped
/// for an older one without tracking content hashes.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub artifact_path: PathBuf,
    pub created_at: DateTime<Utc>,
    pub byte_size: u64,
}

impl CacheEntry {
    /// Build an entry for an artifact that exists on disk.
    pub fn for_artifact(path: &Path) -> std::io::Result<Self> {
        let meta = fs::metadata(path)?;
        let created_at = meta
            .modified()
            .map(DateTime::<Utc>::from)
            .unwrap_or_else(|_| Utc::now());
        Ok(Self {
            artifact_path: path.to_path_buf(),
            created_at,
            byte_size: meta.len(),
        })
    }
}

struct CacheMap {
    entries: HashMap<String, CacheEntry>,
    // LRU order, oldest at the front. Lookups move keys to the back.
    order: VecDeque<String>,
}

/// Fingerprint-addressed result cache. The map holds weak references (paths)
/// into the filesystem; the filesystem owns the artifacts, and entries whose
/// artifact disappeared or aged out are evicted lazily on lookup. Filesystem
/// checks run outside the lock.
pub struct ResultCache {
    capacity: usize,
    inner: RwLock<CacheMap>,
}

impl ResultCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            inner: RwLock::new(CacheMap {
                entries: HashMap::new(),
                order: VecDeque::new(),
            }),
        }
    }

    /// Hit only when the entry exists AND its artifact is still on disk AND
    /// the artifact's mtime has not moved earlier than `created_at`.
    pub fn lookup(&self, fingerprint: &str) -> Option<CacheEntry> {
        let entry = {
            let inner = self.inner.read().expect("result cache lock poisoned");
            inner.entries.get(fingerprint).cloned()
        }?;

        // Freshness validation happens with no lock held.
        let fresh = fs::metadata(&entry.artifact_path)
            .ok()
            .and_then(|meta| meta.modified().ok())
            .map(|mtime| DateTime::<Utc>::from(mtime) >= entry.created_at)
            .unwrap_or(false);

        let mut inner = self.inner.write().expect("result cache lock poisoned");
        if !fresh {
            // Only drop the entry if nobody replaced it while we probed disk.
            if inner.entries.get(fingerprint) == Some(&entry) {
                inner.entries.remove(fingerprint);
                inner.order.retain(|key| key != fingerprint);
            }
            return None;
        }
        touch(&mut inner, fingerprint);
        Some(entry)
    }

    pub fn exists(&self, fingerprint: &str) -> bool {
        self.lookup(fingerprint).is_some()
    }

    /// Insert an entry, evicting the least-recently-used one at capacity.
    /// Eviction only forgets the mapping; artifacts on disk are never
    /// deleted by the cache.
    pub fn insert(&self, fingerprint: String, entry: CacheEntry) {
        let mut inner = self.inner.write().expect("result cache lock poisoned");
        if inner.entries.insert(fingerprint.clone(), entry).is_some() {
            touch(&mut inner, &fingerprint);
            return;
        }
        inner.order.push_back(fingerprint);
        while inner.entries.len() > self.capacity {
            let Some(oldest) = inner.order.pop_front() else {
                break;
            };
            inner.entries.remove(&oldest);
        }
    }

    pub fn len(&self) -> usize {
        self.inner
            .read()
            .expect("result cache lock poisoned")
            .entries
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn touch(inner: &mut CacheMap, fingerprint: &str) {
    inner.order.retain(|key| key != fingerprint);
    inner.order.push_back(fingerprint.to_string());
}

#[cfg(test)]
mod tests {
    use super::*;
    use filetime::FileTime;

    fn artifact(dir: &Path, name: &str) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, b"encoded output").unwrap();
        path
    }

    #[test]
    fn insert_then_lookup_returns_a_readable_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let path = artifact(dir.path(), "a.mp4");
        let cache = ResultCache::new(4);

        let entry = CacheEntry::for_artifact(&path).unwrap();
        cache.insert("fp-a".into(), entry.clone());

        let hit = cache.lookup("fp-a").expect("hit");
        assert_eq!(hit, entry);
        assert!(hit.artifact_path.exists());
        assert!(cache.exists("fp-a"));
    }

    #[test]
    fn missing_artifact_is_evicted_on_lookup() {
        let dir = tempfile::tempdir().unwrap();
        let path = artifact(dir.path(), "a.mp4");
        let cache = ResultCache::new(4);
        cache.insert("fp-a".into(), CacheEntry::for_artifact(&path).unwrap());

        fs::remove_file(&path).unwrap();
        assert!(cache.lookup("fp-a").is_none());
        assert_eq!(cache.len(), 0, "stale entry must be gone");
    }

    #[test]
    fn mtime_earlier_than_created_at_invalidates() {
        let dir = tempfile::tempdir().unwrap();
        let path = artifact(dir.path(), "a.mp4");
        let cache = ResultCache::new(4);
        cache.insert("fp-a".into(), CacheEntry::for_artifact(&path).unwrap());

        // Age the artifact well behind the recorded creation time.
        let old = FileTime::from_unix_time(1_000_000, 0);
        filetime::set_file_mtime(&path, old).unwrap();

        assert!(cache.lookup("fp-a").is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn eviction_prefers_the_least_recently_used_entry() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ResultCache::new(2);
        for name in ["a", "b"] {
            let path = artifact(dir.path(), &format!("{name}.mp4"));
            cache.insert(format!("fp-{name}"), CacheEntry::for_artifact(&path).unwrap());
        }

        // Touch `a` so `b` becomes the eviction candidate.
        assert!(cache.lookup("fp-a").is_some());

        let path = artifact(dir.path(), "c.mp4");
        cache.insert("fp-c".into(), CacheEntry::for_artifact(&path).unwrap());

        assert!(cache.lookup("fp-a").is_some());
        assert!(cache.lookup("fp-c").is_some());
        assert!(cache.lookup("fp-b").is_none());
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn reinsert_updates_in_place_without_eviction() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ResultCache::new(2);
        let a = artifact(dir.path(), "a.mp4");
        let b = artifact(dir.path(), "b.mp4");
        cache.insert("fp-a".into(), CacheEntry::for_artifact(&a).unwrap());
        cache.insert("fp-b".into(), CacheEntry::for_artifact(&b).unwrap());
        cache.insert("fp-a".into(), CacheEntry::for_artifact(&a).unwrap());

        assert_eq!(cache.len(), 2);
        assert!(cache.lookup("fp-b").is_some());
    }
}
