#![deny(clippy::unwrap_used)]

use std::{
    path::{Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};

use chrono::Utc;

use crate::{
    buffer_pool::OutputBufferPool,
    collaborators::Downloader,
    errors::EngineError,
    file_hash_cache::{FileHashCache, FileStat},
    path_utils::{atomic_rename_with_retry, ensure_directory_for_file},
    task_registry::TaskId,
};

// ANON_OBJECT_HEADER_BIGOBJ magic: 0x0000/0xFFFF sentinel words, a version
// word, then the class UUID below at offsets 12-27.
const BIGOBJ_MAGIC: [u8; 4] = [0x00, 0x00, 0xFF, 0xFF];
const BIGOBJ_CLASS_UUID: [u8; 16] = [
    0xc7, 0xa1, 0xba, 0xd1, 0xee, 0xba, 0xa9, 0x4b, 0xaf, 0x20, 0xfa, 0xf6, 0x6a, 0xa4, 0xdc, 0xb8,
];
const COFF_TIMESTAMP_OFFSET: usize = 4;
const BIGOBJ_TIMESTAMP_OFFSET: usize = 8;

pub struct CommitRequest<'a> {
    pub hash_key: String,
    pub final_path: PathBuf,
    pub mode: u32,
    pub size_hint: u64,
    pub want_in_memory_output: bool,
    // True while a racing local subprocess is still running, or under
    // verify_output: both force temp-then-rename staging.
    pub local_subprocess_racing: bool,
    pub verify_output: bool,
    pub local_run_bytes: Option<&'a [u8]>,
    pub from_remote_cache: bool,
    pub is_coff_producing: bool,
    pub reproducible_build: bool,
}

pub async fn commit_output(
    downloader: &dyn Downloader,
    pool: &OutputBufferPool,
    hash_cache: &FileHashCache,
    task_id: TaskId,
    request: CommitRequest<'_>,
) -> Result<(), EngineError> {
    ensure_directory_for_file(&request.final_path)
        .await
        .map_err(|source| EngineError::OutputCommitError {
            path: request.final_path.clone(),
            source,
        })?;

    if request.want_in_memory_output {
        if let Some(reservation) = pool.try_reserve(request.size_hint) {
            let mut bytes = downloader
                .download_in_buffer(&request.hash_key)
                .await
                .map_err(|source| EngineError::OutputDownloadError {
                    path: request.final_path.clone(),
                    source,
                })?;
            maybe_rewrite_coff_timestamp(&mut bytes, &request);
            if request.verify_output {
                verify_bytes(&bytes, request.local_run_bytes.unwrap_or(&[]))?;
            }
            let _ = tokio::fs::remove_file(&request.final_path).await;
            write_with_mode(&request.final_path, &bytes, request.mode)
                .await
                .map_err(|source| EngineError::OutputCommitError {
                    path: request.final_path.clone(),
                    source,
                })?;
            drop(reservation);
            record_committed(hash_cache, &request).await;
            return Ok(());
        }
        // Budget exhausted: fall through to tmpfile staging.
    }

    let staged_via_tmp = request.local_subprocess_racing || request.verify_output;
    let target = if staged_via_tmp {
        request
            .final_path
            .with_extension(format!("tmp.{}", task_id.0))
    } else {
        request.final_path.clone()
    };
    // Removes the staged tmpfile on any early return below; a no-op once
    // `atomic_rename_with_retry` has already moved it to `final_path`.
    let _tmp_cleanup = staged_via_tmp.then(|| {
        scopeguard::guard(target.clone(), |path| {
            let _ = std::fs::remove_file(path);
        })
    });

    let status = downloader
        .download(&request.hash_key, &target, request.mode)
        .await
        .map_err(|source| EngineError::OutputDownloadError {
            path: request.final_path.clone(),
            source,
        })?;
    if !(200..300).contains(&status) {
        return Err(EngineError::OutputDownloadError {
            path: request.final_path.clone(),
            source: anyhow::anyhow!("download returned HTTP {status}"),
        });
    }

    if request.is_coff_producing && request.from_remote_cache && !request.reproducible_build {
        rewrite_coff_file_in_place(&target, &request).await?;
    }

    if request.verify_output {
        let remote_bytes = tokio::fs::read(&target)
            .await
            .map_err(|source| EngineError::OutputCommitError {
                path: request.final_path.clone(),
                source: source.into(),
            })?;
        verify_bytes(&remote_bytes, request.local_run_bytes.unwrap_or(&[]))?;
    }

    if staged_via_tmp {
        atomic_rename_with_retry(&target, &request.final_path)
            .await
            .map_err(|source| EngineError::OutputCommitError {
                path: request.final_path.clone(),
                source,
            })?;
    }

    record_committed(hash_cache, &request).await;
    Ok(())
}

async fn record_committed(hash_cache: &FileHashCache, request: &CommitRequest<'_>) {
    if let Ok(file_stat) = FileStat::read(&request.final_path).await {
        hash_cache.record_uploaded(&request.final_path, request.hash_key.clone(), file_stat, Utc::now());
    }
}

#[cfg(unix)]
async fn write_with_mode(path: &Path, bytes: &[u8], mode: u32) -> anyhow::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    tokio::fs::write(path, bytes).await?;
    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(mode)).await?;
    Ok(())
}

#[cfg(not(unix))]
async fn write_with_mode(path: &Path, bytes: &[u8], _mode: u32) -> anyhow::Result<()> {
    tokio::fs::write(path, bytes).await?;
    Ok(())
}

fn verify_bytes(remote: &[u8], local: &[u8]) -> Result<(), EngineError> {
    const CHUNK: usize = 1024;
    if remote.len() != local.len() {
        let offset = remote.len().min(local.len()) as u64;
        return Err(EngineError::VerifyOutputMismatch { offset });
    }
    for (chunk_start, (remote_chunk, local_chunk)) in remote
        .chunks(CHUNK)
        .zip(local.chunks(CHUNK))
        .enumerate()
        .map(|(i, chunks)| (i * CHUNK, chunks))
    {
        if remote_chunk != local_chunk {
            let within = remote_chunk
                .iter()
                .zip(local_chunk.iter())
                .position(|(a, b)| a != b)
                .unwrap_or(0);
            return Err(EngineError::VerifyOutputMismatch {
                offset: (chunk_start + within) as u64,
            });
        }
    }
    Ok(())
}

fn maybe_rewrite_coff_timestamp(bytes: &mut [u8], request: &CommitRequest<'_>) {
    if !(request.is_coff_producing && request.from_remote_cache && !request.reproducible_build) {
        return;
    }
    if let Some(offset) = coff_timestamp_offset(bytes) {
        write_current_timestamp(bytes, offset);
    }
}

async fn rewrite_coff_file_in_place(
    path: &Path,
    _request: &CommitRequest<'_>,
) -> Result<(), EngineError> {
    let mut bytes = tokio::fs::read(path)
        .await
        .map_err(|source| EngineError::OutputCommitError {
            path: path.to_path_buf(),
            source: source.into(),
        })?;
    if let Some(offset) = coff_timestamp_offset(&bytes) {
        write_current_timestamp(&mut bytes, offset);
        tokio::fs::write(path, &bytes)
            .await
            .map_err(|source| EngineError::OutputCommitError {
                path: path.to_path_buf(),
                source: source.into(),
            })?;
    }
    Ok(())
}

fn coff_timestamp_offset(bytes: &[u8]) -> Option<usize> {
    if bytes.len() >= 28
        && bytes.starts_with(&BIGOBJ_MAGIC)
        && &bytes[4..6] == &[0x01u8, 0x00][..]
        && &bytes[12..28] == &BIGOBJ_CLASS_UUID[..]
    {
        return Some(BIGOBJ_TIMESTAMP_OFFSET);
    }
    if bytes.len() >= COFF_TIMESTAMP_OFFSET + 4 {
        return Some(COFF_TIMESTAMP_OFFSET);
    }
    None
}

fn write_current_timestamp(bytes: &mut [u8], offset: usize) {
    let now_secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or(0);
    bytes[offset..offset + 4].copy_from_slice(&now_secs.to_le_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::mock::MockBlobStore;

    fn standard_coff_bytes() -> Vec<u8> {
        let mut bytes = vec![0u8; 64];
        bytes[0..2].copy_from_slice(&[0x4c, 0x01]); // IMAGE_FILE_MACHINE_I386
        bytes[COFF_TIMESTAMP_OFFSET..COFF_TIMESTAMP_OFFSET + 4].copy_from_slice(&1u32.to_le_bytes());
        bytes
    }

    fn bigobj_bytes() -> Vec<u8> {
        let mut bytes = vec![0u8; 64];
        bytes[0..4].copy_from_slice(&BIGOBJ_MAGIC);
        bytes[4..6].copy_from_slice(&[0x01, 0x00]);
        bytes[12..28].copy_from_slice(&BIGOBJ_CLASS_UUID);
        bytes[BIGOBJ_TIMESTAMP_OFFSET..BIGOBJ_TIMESTAMP_OFFSET + 4]
            .copy_from_slice(&1u32.to_le_bytes());
        bytes
    }

    #[test]
    fn standard_coff_detection_targets_offset_four() {
        assert_eq!(coff_timestamp_offset(&standard_coff_bytes()), Some(4));
    }

    #[test]
    fn bigobj_detection_targets_offset_eight_not_four() {
        assert_eq!(coff_timestamp_offset(&bigobj_bytes()), Some(8));
    }

    #[test]
    fn verify_bytes_reports_first_differing_offset() {
        let local = vec![0u8; 2048];
        let mut remote = local.clone();
        remote[1500] = 1;
        let err = verify_bytes(&remote, &local).expect_err("mismatch");
        match err {
            EngineError::VerifyOutputMismatch { offset } => assert_eq!(offset, 1500),
            other => panic!("wrong error variant: {other:?}"),
        }
    }

    #[tokio::test]
    async fn commit_installs_output_atomically_via_rename_when_racing_local() {
        let dir = tempfile::tempdir().expect("tempdir");
        let final_path = dir.path().join("out.o");
        let downloader = MockBlobStore::new();
        downloader
            .upload("hash1", b"object bytes")
            .await
            .expect("seed blob");
        let pool = OutputBufferPool::new(0);
        let hash_cache = FileHashCache::new();

        let request = CommitRequest {
            hash_key: "hash1".to_string(),
            final_path: final_path.clone(),
            mode: 0o644,
            size_hint: 12,
            want_in_memory_output: false,
            local_subprocess_racing: true,
            verify_output: false,
            local_run_bytes: None,
            from_remote_cache: false,
            is_coff_producing: false,
            reproducible_build: false,
        };
        commit_output(&downloader, &pool, &hash_cache, TaskId(1), request)
            .await
            .expect("commit succeeds");

        let content = tokio::fs::read(&final_path).await.expect("read final");
        assert_eq!(content, b"object bytes");
        assert!(!dir.path().join("out.o.tmp.1").exists());
    }

    #[tokio::test]
    async fn commit_rewrites_coff_timestamp_on_cache_hit_without_brepro() {
        let dir = tempfile::tempdir().expect("tempdir");
        let final_path = dir.path().join("out.obj");
        let downloader = MockBlobStore::new();
        let original = standard_coff_bytes();
        downloader
            .upload("hash1", &original)
            .await
            .expect("seed blob");
        let pool = OutputBufferPool::new(0);
        let hash_cache = FileHashCache::new();

        let request = CommitRequest {
            hash_key: "hash1".to_string(),
            final_path: final_path.clone(),
            mode: 0o644,
            size_hint: original.len() as u64,
            want_in_memory_output: false,
            local_subprocess_racing: false,
            verify_output: false,
            local_run_bytes: None,
            from_remote_cache: true,
            is_coff_producing: true,
            reproducible_build: false,
        };
        commit_output(&downloader, &pool, &hash_cache, TaskId(2), request)
            .await
            .expect("commit succeeds");

        let content = tokio::fs::read(&final_path).await.expect("read final");
        assert_eq!(content.len(), original.len());
        assert_ne!(
            content[COFF_TIMESTAMP_OFFSET..COFF_TIMESTAMP_OFFSET + 4],
            original[COFF_TIMESTAMP_OFFSET..COFF_TIMESTAMP_OFFSET + 4]
        );
        assert_eq!(
            content[COFF_TIMESTAMP_OFFSET + 4..],
            original[COFF_TIMESTAMP_OFFSET + 4..]
        );
    }

    #[tokio::test]
    async fn commit_fails_with_offset_on_verify_output_mismatch() {
        let dir = tempfile::tempdir().expect("tempdir");
        let final_path = dir.path().join("out.o");
        let downloader = MockBlobStore::new();
        downloader
            .upload("hash1", b"remote-bytes")
            .await
            .expect("seed blob");
        let pool = OutputBufferPool::new(0);
        let hash_cache = FileHashCache::new();

        let request = CommitRequest {
            hash_key: "hash1".to_string(),
            final_path: final_path.clone(),
            mode: 0o644,
            size_hint: 12,
            want_in_memory_output: false,
            local_subprocess_racing: false,
            verify_output: true,
            local_run_bytes: Some(b"local--bytes"),
            from_remote_cache: false,
            is_coff_producing: false,
            reproducible_build: false,
        };
        let err = commit_output(&downloader, &pool, &hash_cache, TaskId(3), request)
            .await
            .expect_err("mismatch should fail");
        assert!(matches!(err, EngineError::VerifyOutputMismatch { .. }));
        assert!(!final_path.exists());
    }
}
