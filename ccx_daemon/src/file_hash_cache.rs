#![deny(clippy::unwrap_used)]

use std::{collections::HashMap, path::PathBuf, time::Duration};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileStat {
    pub mtime_nanos: i128,
    pub size: u64,
}

impl FileStat {
    pub async fn read(path: &std::path::Path) -> std::io::Result<Self> {
        let metadata = tokio::fs::metadata(path).await?;
        let mtime = metadata.modified()?;
        let mtime_nanos = mtime
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_nanos() as i128)
            .unwrap_or(0);
        Ok(Self {
            mtime_nanos,
            size: metadata.len(),
        })
    }
}

#[derive(Debug, Clone)]
pub struct FileHashCacheEntry {
    pub hash_key: String,
    pub file_stat: FileStat,
    pub upload_timestamp: Option<DateTime<Utc>>,
}

pub struct FileHashCache {
    entries: Mutex<HashMap<PathBuf, FileHashCacheEntry>>,
    last_missing: Mutex<HashMap<PathBuf, DateTime<Utc>>>,
}

impl FileHashCache {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            last_missing: Mutex::new(HashMap::new()),
        }
    }

    pub fn lookup(
        &self,
        path: &std::path::Path,
        current_stat: FileStat,
        new_file_threshold: Duration,
        now: DateTime<Utc>,
    ) -> Option<String> {
        let entries = self.entries.lock();
        let entry = entries.get(path)?;
        if entry.file_stat != current_stat {
            return None;
        }
        let last_missing = self.last_missing.lock().get(path).copied();
        let uploaded_after_missing = match (entry.upload_timestamp, last_missing) {
            (Some(uploaded), Some(missing)) => uploaded > missing,
            (Some(_), None) => true,
            (None, _) => false,
        };
        if uploaded_after_missing {
            return Some(entry.hash_key.clone());
        }
        let age = now.signed_duration_since(
            entry
                .upload_timestamp
                .unwrap_or(now - chrono::Duration::seconds(i64::MAX / 2)),
        );
        if age
            > chrono::Duration::from_std(new_file_threshold).unwrap_or(chrono::Duration::zero())
        {
            return Some(entry.hash_key.clone());
        }
        None
    }

    pub fn record_uploaded(
        &self,
        path: &std::path::Path,
        hash_key: String,
        file_stat: FileStat,
        upload_timestamp: DateTime<Utc>,
    ) {
        self.entries.lock().insert(
            path.to_path_buf(),
            FileHashCacheEntry {
                hash_key,
                file_stat,
                upload_timestamp: Some(upload_timestamp),
            },
        );
    }

    // Deliberately not recorded as cache-known: a retry may land on a
    // cluster without the blob.
    pub fn record_embedded_only(&self, _path: &std::path::Path) {}

    pub fn record_missing(&self, path: &std::path::Path, at: DateTime<Utc>) {
        self.last_missing.lock().insert(path.to_path_buf(), at);
    }
}

impl Default for FileHashCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    fn stat(mtime: i128, size: u64) -> FileStat {
        FileStat {
            mtime_nanos: mtime,
            size,
        }
    }

    #[test]
    fn lookup_misses_when_stat_changed() {
        let cache = FileHashCache::new();
        let now = Utc::now();
        cache.record_uploaded(Path::new("/a.c"), "hash1".into(), stat(1, 10), now);
        let result = cache.lookup(
            Path::new("/a.c"),
            stat(2, 10),
            Duration::from_secs(3600),
            now,
        );
        assert!(result.is_none());
    }

    #[test]
    fn lookup_hits_when_uploaded_after_last_missing() {
        let cache = FileHashCache::new();
        let now = Utc::now();
        cache.record_missing(Path::new("/a.c"), now - chrono::Duration::seconds(10));
        cache.record_uploaded(Path::new("/a.c"), "hash1".into(), stat(1, 10), now);
        let result = cache.lookup(Path::new("/a.c"), stat(1, 10), Duration::from_secs(1), now);
        assert_eq!(result.as_deref(), Some("hash1"));
    }

    #[test]
    fn lookup_misses_when_missing_is_more_recent_than_upload_and_file_is_young() {
        let cache = FileHashCache::new();
        let now = Utc::now();
        let upload_time = now - chrono::Duration::seconds(20);
        cache.record_uploaded(Path::new("/a.c"), "hash1".into(), stat(1, 10), upload_time);
        cache.record_missing(Path::new("/a.c"), now - chrono::Duration::seconds(5));
        let result = cache.lookup(
            Path::new("/a.c"),
            stat(1, 10),
            Duration::from_secs(3600),
            now,
        );
        assert!(result.is_none());
    }

    #[test]
    fn lookup_hits_for_old_enough_file_even_without_recent_upload() {
        let cache = FileHashCache::new();
        let now = Utc::now();
        let old_upload = now - chrono::Duration::seconds(7200);
        cache.record_uploaded(Path::new("/a.c"), "hash1".into(), stat(1, 10), old_upload);
        let result = cache.lookup(
            Path::new("/a.c"),
            stat(1, 10),
            Duration::from_secs(3600),
            now,
        );
        assert_eq!(result.as_deref(), Some("hash1"));
    }
}
