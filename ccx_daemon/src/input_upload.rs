#![deny(clippy::unwrap_used)]

use std::{collections::HashMap, path::Path, path::PathBuf, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::watch;

use crate::{
    collaborators::Uploader,
    file_hash_cache::{FileHashCache, FileStat},
};

const EMBED_ABOVE_BYTES: u64 = 2 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct InputJobResult {
    pub success: bool,
    pub hash_key: Option<String>,
    pub embed_bytes: Option<Vec<u8>>,
}

#[derive(Debug, Clone, Copy)]
pub struct UploadPolicy {
    pub is_missing_on_server: bool,
    pub caller_only_needs_hash: bool,
    // Forces embedding even for files that would otherwise be skipped as
    // already server-known.
    pub need_to_send_content: bool,
}

struct JobEntry {
    receiver: watch::Receiver<Option<Arc<InputJobResult>>>,
}

// At most one job per absolute filename across all in-flight tasks; a
// request arriving after the first job has started tearing down its results
// begins a fresh job rather than subscribing to a dying one.
pub struct InputUploadCoordinator {
    jobs: Mutex<HashMap<PathBuf, Arc<JobEntry>>>,
}

impl InputUploadCoordinator {
    pub fn new() -> Self {
        Self {
            jobs: Mutex::new(HashMap::new()),
        }
    }

    pub async fn request(
        &self,
        hash_cache: &FileHashCache,
        uploader: &dyn Uploader,
        path: &Path,
        file_stat: FileStat,
        policy: UploadPolicy,
        new_file_threshold: Duration,
        now: DateTime<Utc>,
    ) -> anyhow::Result<Arc<InputJobResult>> {
        let (sender, entry) = {
            let mut jobs = self.jobs.lock();
            if let Some(entry) = jobs.get(path) {
                (None, entry.clone())
            } else {
                let (tx, rx) = watch::channel(None);
                let entry = Arc::new(JobEntry { receiver: rx });
                jobs.insert(path.to_path_buf(), entry.clone());
                (Some(tx), entry)
            }
        };

        match sender {
            Some(tx) => {
                let result = self
                    .run_job(hash_cache, uploader, path, file_stat, policy, new_file_threshold, now)
                    .await;
                let result = Arc::new(result);
                // Remove before fanout: a request for the same filename that
                // arrives once subscribers are already being woken starts a
                // fresh job rather than joining this one's teardown.
                self.jobs.lock().remove(path);
                let _ = tx.send(Some(result.clone()));
                Ok(result)
            }
            None => {
                let mut receiver = entry.receiver.clone();
                let result = receiver
                    .wait_for(|v| v.is_some())
                    .await
                    .map_err(|_| anyhow::anyhow!("input job sender dropped for {path:?}"))?
                    .clone()
                    .ok_or_else(|| anyhow::anyhow!("input job result missing after wait_for"))?;
                Ok(result)
            }
        }
    }

    async fn run_job(
        &self,
        hash_cache: &FileHashCache,
        uploader: &dyn Uploader,
        path: &Path,
        file_stat: FileStat,
        policy: UploadPolicy,
        new_file_threshold: Duration,
        now: DateTime<Utc>,
    ) -> InputJobResult {
        // Step 1: a trusted cache entry with no pending "need old content"
        // override means the server already has this blob.
        if !policy.need_to_send_content && !policy.is_missing_on_server {
            if let Some(hash_key) = hash_cache.lookup(path, file_stat, new_file_threshold, now) {
                return InputJobResult {
                    success: true,
                    hash_key: Some(hash_key),
                    embed_bytes: None,
                };
            }
        }

        // Step 2: compute the content hash (and read bytes, since most
        // branches of the decision matrix need them regardless).
        let bytes = match tokio::fs::read(path).await {
            Ok(bytes) => bytes,
            Err(_) => {
                return InputJobResult {
                    success: false,
                    hash_key: None,
                    embed_bytes: None,
                };
            }
        };
        let hash_key = uploader.compute_key(&bytes).await;

        // Step 3: decision matrix. The last two rows both resolve to embed
        // regardless of exact size, so the only true branch is "forced
        // out-of-band" vs. everything else.
        let is_rsp = path.extension().is_some_and(|ext| ext == "rsp");
        let forced_out_of_band = policy.is_missing_on_server
            || is_rsp
            || file_stat.size > EMBED_ABOVE_BYTES
            || policy.caller_only_needs_hash;
        let should_embed = !forced_out_of_band;

        if should_embed {
            let embed_bytes = match uploader.embed(&bytes).await {
                Ok(bytes) => bytes,
                Err(_) => {
                    return InputJobResult {
                        success: false,
                        hash_key: None,
                        embed_bytes: None,
                    };
                }
            };
            // Step 4: embedded content is deliberately not recorded as
            // cache-known yet; a retry may land on a cluster without it.
            hash_cache.record_embedded_only(path);
            InputJobResult {
                success: true,
                hash_key: Some(hash_key),
                embed_bytes: Some(embed_bytes),
            }
        } else {
            match uploader.upload(&hash_key, &bytes).await {
                Ok(status) if (200..300).contains(&status) => {
                    hash_cache.record_uploaded(path, hash_key.clone(), file_stat, now);
                    InputJobResult {
                        success: true,
                        hash_key: Some(hash_key),
                        embed_bytes: None,
                    }
                }
                _ => InputJobResult {
                    success: false,
                    hash_key: None,
                    embed_bytes: None,
                },
            }
        }
    }
}

impl Default for InputUploadCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::mock::MockBlobStore;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn stat() -> FileStat {
        FileStat {
            mtime_nanos: 1,
            size: 10,
        }
    }

    fn policy() -> UploadPolicy {
        UploadPolicy {
            is_missing_on_server: false,
            caller_only_needs_hash: false,
            need_to_send_content: false,
        }
    }

    #[tokio::test]
    async fn concurrent_requests_for_same_filename_share_one_job() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("a.c");
        tokio::fs::write(&path, b"int main(){}").await.expect("write");

        let coordinator = Arc::new(InputUploadCoordinator::new());
        let hash_cache = Arc::new(FileHashCache::new());
        let uploader = Arc::new(MockBlobStore::new());
        let file_stat = FileStat::read(&path).await.expect("stat");

        let mut handles = vec![];
        for _ in 0..8 {
            let coordinator = coordinator.clone();
            let hash_cache = hash_cache.clone();
            let uploader = uploader.clone();
            let path = path.clone();
            handles.push(tokio::spawn(async move {
                coordinator
                    .request(
                        &hash_cache,
                        uploader.as_ref(),
                        &path,
                        file_stat,
                        policy(),
                        Duration::from_secs(3600),
                        Utc::now(),
                    )
                    .await
                    .expect("request succeeds")
            }));
        }

        let mut results = vec![];
        for handle in handles {
            results.push(handle.await.expect("task completes"));
        }
        let first_key = results[0].hash_key.clone();
        assert!(first_key.is_some());
        for result in &results {
            assert_eq!(result.hash_key, first_key);
            assert!(result.success);
        }
    }

    #[tokio::test]
    async fn cached_hit_skips_upload_entirely() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("a.c");
        tokio::fs::write(&path, b"content").await.expect("write");
        let file_stat = FileStat::read(&path).await.expect("stat");

        let hash_cache = FileHashCache::new();
        hash_cache.record_uploaded(&path, "already-known".into(), file_stat, Utc::now());

        let coordinator = InputUploadCoordinator::new();

        struct PanicsOnUse(AtomicUsize);
        #[async_trait::async_trait]
        impl Uploader for PanicsOnUse {
            async fn compute_key(&self, _bytes: &[u8]) -> String {
                self.0.fetch_add(1, Ordering::SeqCst);
                panic!("should not be called on a cache hit")
            }
            async fn upload(&self, _hash_key: &str, _bytes: &[u8]) -> anyhow::Result<u16> {
                panic!("should not be called on a cache hit")
            }
            async fn embed(&self, _bytes: &[u8]) -> anyhow::Result<Vec<u8>> {
                panic!("should not be called on a cache hit")
            }
        }
        let uploader = PanicsOnUse(AtomicUsize::new(0));

        let result = coordinator
            .request(
                &hash_cache,
                &uploader,
                &path,
                file_stat,
                policy(),
                Duration::from_secs(3600),
                Utc::now(),
            )
            .await
            .expect("request succeeds");
        assert_eq!(result.hash_key.as_deref(), Some("already-known"));
        assert_eq!(uploader.0.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn small_file_is_embedded_not_uploaded_out_of_band() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("tiny.c");
        tokio::fs::write(&path, b"x").await.expect("write");
        let file_stat = FileStat::read(&path).await.expect("stat");

        let coordinator = InputUploadCoordinator::new();
        let hash_cache = FileHashCache::new();
        let uploader = MockBlobStore::new();

        let result = coordinator
            .request(
                &hash_cache,
                &uploader,
                &path,
                file_stat,
                policy(),
                Duration::from_secs(3600),
                Utc::now(),
            )
            .await
            .expect("request succeeds");
        assert!(result.embed_bytes.is_some());
        // Embedded-only results must not be recorded as cache-known.
        assert!(hash_cache
            .lookup(&path, file_stat, Duration::from_secs(3600), Utc::now())
            .is_none());
    }

    #[tokio::test]
    async fn missing_on_server_forces_out_of_band_upload_even_when_small() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("tiny.c");
        tokio::fs::write(&path, b"x").await.expect("write");
        let file_stat = FileStat::read(&path).await.expect("stat");

        let coordinator = InputUploadCoordinator::new();
        let hash_cache = FileHashCache::new();
        let uploader = MockBlobStore::new();
        let mut policy = policy();
        policy.is_missing_on_server = true;

        let result = coordinator
            .request(
                &hash_cache,
                &uploader,
                &path,
                file_stat,
                policy,
                Duration::from_secs(3600),
                Utc::now(),
            )
            .await
            .expect("request succeeds");
        assert!(result.embed_bytes.is_none());
        assert!(hash_cache
            .lookup(&path, file_stat, Duration::from_secs(3600), Utc::now())
            .is_some());
    }
}
