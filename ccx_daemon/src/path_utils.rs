#![deny(clippy::unwrap_used)]

use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{Context, Result};

pub fn make_absolute(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        return path.to_path_buf();
    }
    base.join(path)
}

pub fn shorten_path(path: &Path) -> String {
    if let Some(path_name) = path.file_name() {
        path_name.to_string_lossy().to_string()
    } else {
        path.to_string_lossy().to_string()
    }
}

pub async fn ensure_directory_for_file(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("failed to create directory {}", parent.display()))?;
    }
    Ok(())
}

// Windows rename can fail while an antivirus scanner transiently holds the
// destination open; retry with backoff. POSIX rename is atomic and needs none
// of this.
pub async fn atomic_rename_with_retry(tmp_path: &Path, final_path: &Path) -> Result<()> {
    const MAX_ATTEMPTS: u32 = 5;
    const INITIAL_BACKOFF: Duration = Duration::from_millis(100);

    if cfg!(not(windows)) {
        tokio::fs::rename(tmp_path, final_path)
            .await
            .with_context(|| format!("failed to rename into {}", final_path.display()))?;
        return Ok(());
    }

    let mut backoff = INITIAL_BACKOFF;
    let mut last_err = None;
    for attempt in 0..MAX_ATTEMPTS {
        if attempt > 0 {
            let _ = tokio::fs::remove_file(final_path).await;
        }
        match tokio::fs::rename(tmp_path, final_path).await {
            Ok(()) => return Ok(()),
            Err(err) => {
                last_err = Some(err);
                tokio::time::sleep(backoff).await;
                backoff *= 2;
            }
        }
    }
    Err(anyhow::anyhow!(
        "failed to rename {} into {} after {} attempts: {}",
        tmp_path.display(),
        final_path.display(),
        MAX_ATTEMPTS,
        last_err
            .map(|e| e.to_string())
            .unwrap_or_else(|| "no attempt ran".to_string())
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn make_absolute_keeps_absolute_paths() {
        let base = Path::new("/base");
        let abs = Path::new("/other/file");
        assert_eq!(make_absolute(base, abs), abs);
    }

    #[test]
    fn make_absolute_joins_relative_paths() {
        let base = Path::new("/base");
        let rel = Path::new("file.o");
        assert_eq!(make_absolute(base, rel), Path::new("/base/file.o"));
    }

    #[tokio::test]
    async fn atomic_rename_moves_content_into_place() {
        let dir = tempfile::tempdir().expect("tempdir");
        let tmp_path = dir.path().join("out.tmp");
        let final_path = dir.path().join("out.o");
        tokio::fs::write(&tmp_path, b"object bytes")
            .await
            .expect("write tmp");
        atomic_rename_with_retry(&tmp_path, &final_path)
            .await
            .expect("rename");
        let content = tokio::fs::read(&final_path).await.expect("read final");
        assert_eq!(content, b"object bytes");
        assert!(!tmp_path.exists());
    }
}
