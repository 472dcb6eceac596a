//! Captured frames and the append-only per-run frame store.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// One captured snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Frame {
    /// Capture order, 0-based and contiguous within a run
    pub index: usize,
    /// Local path of the image content
    pub path: PathBuf,
    /// Epoch seconds
    pub captured_ts: f64,
}

impl Frame {
    /// Canonical file name for the frame at `index`.
    pub fn file_name(index: usize) -> String {
        format!("frame_{:03}.jpg", index)
    }
}

/// Append-only record of the frames captured for one run.
///
/// Indices are assigned on append, so they are always contiguous from 0
/// and ordered by capture time.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct FrameStore {
    frames: Vec<Frame>,
}

impl FrameStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Index the next appended frame will receive.
    pub fn next_index(&self) -> usize {
        self.frames.len()
    }

    /// Append a frame and return it.
    ///
    /// A timestamp earlier than the previous frame is clamped so capture
    /// order and timestamp order never disagree.
    pub fn append(&mut self, path: impl Into<PathBuf>, captured_ts: f64) -> &Frame {
        let captured_ts = match self.frames.last() {
            Some(prev) if captured_ts < prev.captured_ts => prev.captured_ts,
            _ => captured_ts,
        };
        let index = self.frames.len();
        self.frames.push(Frame {
            index,
            path: path.into(),
            captured_ts,
        });
        &self.frames[index]
    }

    pub fn get(&self, index: usize) -> Option<&Frame> {
        self.frames.get(index)
    }

    pub fn path_of(&self, index: usize) -> Option<&Path> {
        self.frames.get(index).map(|f| f.path.as_path())
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Frame> {
        self.frames.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_indices_contiguous() {
        let mut store = FrameStore::new();
        for i in 0..5 {
            let frame = store.append(format!("/tmp/{}", Frame::file_name(i)), 10.0 + i as f64);
            assert_eq!(frame.index, i);
        }
        let indices: Vec<usize> = store.iter().map(|f| f.index).collect();
        assert_eq!(indices, vec![0, 1, 2, 3, 4]);
        assert_eq!(store.next_index(), 5);
    }

    #[test]
    fn test_timestamps_never_go_backwards() {
        let mut store = FrameStore::new();
        store.append("/tmp/a.jpg", 20.0);
        let second = store.append("/tmp/b.jpg", 19.5).captured_ts;
        assert_eq!(second, 20.0);
    }

    #[test]
    fn test_file_name_padding() {
        assert_eq!(Frame::file_name(7), "frame_007.jpg");
        assert_eq!(Frame::file_name(123), "frame_123.jpg");
    }
}
