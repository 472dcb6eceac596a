//! Where a zone's run artifacts live.
//!
//! Paths handed to the home-automation platform ("platform paths") are
//! rooted at `/media`; this process reaches the same files through
//! `media_fs_root`. Every artifact is addressable both ways.

use std::path::PathBuf;

use dsum_models::{Frame, RunId};

const PLATFORM_MEDIA_ROOT: &str = "/media";

/// Path layout for one zone.
#[derive(Debug, Clone)]
pub struct StorageLayout {
    /// Platform path of the zone's snapshot directory
    pub snapshot_dir: String,
    /// Local mount of the platform's `/media`
    pub media_fs_root: PathBuf,
    pub runs_subdir: String,
    pub captured_subdir: String,
    pub best_filename: String,
    pub generated_filename: String,
    pub published_generated_filename: String,
}

impl StorageLayout {
    pub fn new(snapshot_dir: impl Into<String>, media_fs_root: impl Into<PathBuf>) -> Self {
        Self {
            snapshot_dir: snapshot_dir.into().trim_end_matches('/').to_string(),
            media_fs_root: media_fs_root.into(),
            runs_subdir: "runs".to_string(),
            captured_subdir: "captured".to_string(),
            best_filename: "best.jpg".to_string(),
            generated_filename: "generated.png".to_string(),
            published_generated_filename: "detection_summary_generated.png".to_string(),
        }
    }

    /// Map a platform path to the local filesystem.
    ///
    /// Paths under `/media` are re-rooted at `media_fs_root`; anything else
    /// is used as-is.
    pub fn to_local(&self, platform_path: &str) -> PathBuf {
        match strip_prefix(platform_path, PLATFORM_MEDIA_ROOT) {
            Some("") => self.media_fs_root.clone(),
            Some(rest) => self.media_fs_root.join(rest),
            None => PathBuf::from(platform_path),
        }
    }

    pub fn run_dir(&self, run_id: &RunId) -> String {
        format!("{}/{}/{}", self.snapshot_dir, self.runs_subdir, run_id)
    }

    pub fn captured_dir(&self, run_id: &RunId) -> String {
        format!("{}/{}", self.run_dir(run_id), self.captured_subdir)
    }

    pub fn frame_path(&self, run_id: &RunId, index: usize) -> String {
        format!("{}/{}", self.captured_dir(run_id), Frame::file_name(index))
    }

    pub fn best_path(&self, run_id: &RunId) -> String {
        format!("{}/{}", self.run_dir(run_id), self.best_filename)
    }

    pub fn generated_path(&self, run_id: &RunId) -> String {
        format!("{}/{}", self.run_dir(run_id), self.generated_filename)
    }

    /// Bundle-key-scoped illustration path, overwritten by every publish.
    pub fn stable_generated_path(&self) -> String {
        format!("{}/{}", self.snapshot_dir, self.published_generated_filename)
    }

    pub fn local_run_dir(&self, run_id: &RunId) -> PathBuf {
        self.to_local(&self.run_dir(run_id))
    }

    pub fn local_frame_path(&self, run_id: &RunId, index: usize) -> PathBuf {
        self.to_local(&self.frame_path(run_id, index))
    }

    /// Create the snapshot and runs directories.
    pub async fn ensure_dirs(&self) -> std::io::Result<()> {
        let runs = self.to_local(&format!("{}/{}", self.snapshot_dir, self.runs_subdir));
        tokio::fs::create_dir_all(&runs).await
    }
}

fn strip_prefix<'a>(path: &'a str, prefix: &str) -> Option<&'a str> {
    let path = path.trim_end_matches('/');
    if path == prefix {
        return Some("");
    }
    path.strip_prefix(prefix)?.strip_prefix('/')
}
