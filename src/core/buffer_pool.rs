use std::collections::HashMap;
use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;
use std::sync::Mutex;

use anyhow::{Context, Result};

/// Default chunk size for pooled file copies.
pub const DEFAULT_COPY_CHUNK: usize = 64 * 1024;

const MAX_BUFFERS_PER_CLASS: usize = 8;

/// Pool of reusable byte buffers, shelved by power-of-two capacity class.
/// `get(n)` hands out a buffer of length exactly `n`; `put` recycles it.
/// Purely a performance aid for large file copies: nothing is allowed to
/// depend on a buffer surviving a `put`.
pub struct BufferPool {
    shelves: Mutex<HashMap<usize, Vec<Vec<u8>>>>,
}

impl BufferPool {
    pub fn new() -> Self {
        Self {
            shelves: Mutex::new(HashMap::new()),
        }
    }

    pub fn get(&self, n: usize) -> Vec<u8> {
        let class = size_class(n);
        let mut shelves = self.shelves.lock().expect("buffer pool lock poisoned");
        let mut buf = shelves
            .get_mut(&class)
            .and_then(Vec::pop)
            .unwrap_or_else(|| Vec::with_capacity(class));
        buf.resize(n, 0);
        buf
    }

    pub fn put(&self, mut buf: Vec<u8>) {
        let class = size_class(buf.capacity().max(1));
        if buf.capacity() < class {
            // Undersized for its class (capacity between classes); let it drop.
            return;
        }
        buf.clear();
        let mut shelves = self.shelves.lock().expect("buffer pool lock poisoned");
        let shelf = shelves.entry(class).or_default();
        if shelf.len() < MAX_BUFFERS_PER_CLASS {
            shelf.push(buf);
        }
    }

    /// Copy `src` to `dst` through a pooled chunk buffer, creating parent
    /// directories as needed. Returns the number of bytes copied.
    pub fn copy_file(&self, src: &Path, dst: &Path) -> Result<u64> {
        if let Some(parent) = dst.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create directory {}", parent.display()))?;
        }
        let mut reader =
            File::open(src).with_context(|| format!("open source {}", src.display()))?;
        let mut writer =
            File::create(dst).with_context(|| format!("create target {}", dst.display()))?;

        let mut buf = self.get(DEFAULT_COPY_CHUNK);
        let mut total: u64 = 0;
        loop {
            let read = reader
                .read(&mut buf)
                .with_context(|| format!("read {}", src.display()))?;
            if read == 0 {
                break;
            }
            writer
                .write_all(&buf[..read])
                .with_context(|| format!("write {}", dst.display()))?;
            total += read as u64;
        }
        writer
            .flush()
            .with_context(|| format!("flush {}", dst.display()))?;
        self.put(buf);
        Ok(total)
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new()
    }
}

fn size_class(n: usize) -> usize {
    n.max(1).next_power_of_two()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_returns_exact_length_and_put_recycles() {
        let pool = BufferPool::new();
        let mut buf = pool.get(1000);
        assert_eq!(buf.len(), 1000);
        assert!(buf.capacity() >= 1000);

        buf[0] = 0xAB;
        let capacity = buf.capacity();
        pool.put(buf);

        // Same size class comes back from the shelf, zeroed to length.
        let again = pool.get(900);
        assert_eq!(again.len(), 900);
        assert_eq!(again.capacity(), capacity);
        assert_eq!(again[0], 0);
    }

    #[test]
    fn shelf_is_bounded() {
        let pool = BufferPool::new();
        let bufs: Vec<Vec<u8>> = (0..32).map(|_| pool.get(64)).collect();
        for buf in bufs {
            pool.put(buf);
        }
        let shelves = pool.shelves.lock().unwrap();
        assert!(shelves.values().all(|s| s.len() <= MAX_BUFFERS_PER_CLASS));
    }

    #[test]
    fn copy_file_round_trips_content() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src.bin");
        let dst = dir.path().join("nested/dst.bin");
        let payload: Vec<u8> = (0..200_000).map(|i| (i % 251) as u8).collect();
        std::fs::write(&src, &payload).unwrap();

        let pool = BufferPool::new();
        let copied = pool.copy_file(&src, &dst).unwrap();
        assert_eq!(copied, payload.len() as u64);
        assert_eq!(std::fs::read(&dst).unwrap(), payload);
    }
}
