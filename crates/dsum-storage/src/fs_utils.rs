//! Filesystem helpers for run artifacts.

use std::path::Path;
use std::time::Duration;

use tokio::fs;

use crate::error::StorageResult;

/// Copy `src` to `dst`, creating parent directories.
pub async fn copy_file(src: impl AsRef<Path>, dst: impl AsRef<Path>) -> StorageResult<u64> {
    let dst = dst.as_ref();
    if let Some(parent) = dst.parent() {
        fs::create_dir_all(parent).await?;
    }
    Ok(fs::copy(src.as_ref(), dst).await?)
}

/// Replace `dst` with a copy of `src` atomically.
///
/// The copy goes to a temp file next to `dst` and is renamed over it, so a
/// reader of `dst` sees either the previous content or the new one.
pub async fn mirror_file(src: impl AsRef<Path>, dst: impl AsRef<Path>) -> StorageResult<()> {
    let src = src.as_ref();
    let dst = dst.as_ref();
    if let Some(parent) = dst.parent() {
        fs::create_dir_all(parent).await?;
    }

    let tmp_dst = tmp_sibling(dst);
    if let Err(e) = fs::copy(src, &tmp_dst).await {
        tracing::error!(
            "Failed to stage mirror copy: {} -> {}: {}",
            src.display(),
            tmp_dst.display(),
            e
        );
        let _ = fs::remove_file(&tmp_dst).await;
        return Err(e.into());
    }

    if let Err(e) = fs::rename(&tmp_dst, dst).await {
        let _ = fs::remove_file(&tmp_dst).await;
        return Err(e.into());
    }
    Ok(())
}

/// Write `bytes` to `dst` via a temp file and rename.
pub async fn write_atomic(dst: impl AsRef<Path>, bytes: &[u8]) -> StorageResult<()> {
    let dst = dst.as_ref();
    if let Some(parent) = dst.parent() {
        fs::create_dir_all(parent).await?;
    }
    let tmp_dst = tmp_sibling(dst);
    fs::write(&tmp_dst, bytes).await?;
    if let Err(e) = fs::rename(&tmp_dst, dst).await {
        let _ = fs::remove_file(&tmp_dst).await;
        return Err(e.into());
    }
    Ok(())
}

/// Poll until `path` exists or `timeout` passes.
///
/// Snapshots land on a shared mount and can take a moment to appear.
pub async fn wait_for_file(path: impl AsRef<Path>, timeout: Duration) -> bool {
    let path = path.as_ref();
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if fs::try_exists(path).await.unwrap_or(false) {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

fn tmp_sibling(dst: &Path) -> std::path::PathBuf {
    let mut name = dst
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".tmp");
    dst.with_file_name(name)
}
