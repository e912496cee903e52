//! Segment watcher — turns filesystem appearance of encoder output into
//! buffer arrivals, in wall-time order.
//!
//! The encoder names segments by UTC second, so processing new files in
//! filename-sorted order keeps arrivals monotonic. A short settle delay per
//! file lets the encoder finish writing before the size is read. The watcher
//! never deletes anything; eviction belongs to the buffer.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::buffer::CircularBuffer;
use crate::capture::CaptureState;
use crate::config::CameraConfig;
use crate::error::ReplayError;

/// Pause between directory scans.
const SCAN_INTERVAL: Duration = Duration::from_secs(1);
/// Wait after first sighting of a file so the encoder finishes the write.
const SETTLE_DELAY: Duration = Duration::from_millis(500);
/// Files below this are encoder droppings, not playable segments.
const MIN_SEGMENT_BYTES: u64 = 1024;

/// Watches one camera's scratch directory and feeds its buffer.
pub struct SegmentWatcher {
    camera_id: String,
    scratch_dir: PathBuf,
    prefix: String,
    buffer: Arc<CircularBuffer>,
    capture_state: Arc<Mutex<CaptureState>>,
}

impl SegmentWatcher {
    pub fn new(
        camera: &CameraConfig,
        buffer: Arc<CircularBuffer>,
        capture_state: Arc<Mutex<CaptureState>>,
    ) -> Self {
        SegmentWatcher {
            camera_id: camera.id.clone(),
            scratch_dir: camera.scratch_dir.clone(),
            prefix: format!("{}_", camera.id),
            buffer,
            capture_state,
        }
    }

    /// Scan loop. The known-file set is seeded with whatever is already on
    /// disk — those files were ingested by the buffer's recovery pass and
    /// must not be re-added.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut known = list_segment_files(&self.scratch_dir, &self.prefix);
        info!(
            camera = self.camera_id,
            preexisting = known.len(),
            "Segment watcher started"
        );

        loop {
            tokio::select! {
                _ = tokio::time::sleep(SCAN_INTERVAL) => {}
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }

            let new = self.scan(&mut known);
            if !new.is_empty() {
                self.process_new_files(new).await;
            }
        }

        info!(camera = self.camera_id, "Segment watcher stopped");
    }

    /// One scan: set-difference against the known names, sorted. The known
    /// set is replaced with the current directory contents, so skipped or
    /// vanished files are not retried.
    fn scan(&self, known: &mut BTreeSet<String>) -> Vec<PathBuf> {
        let current = list_segment_files(&self.scratch_dir, &self.prefix);
        let new: Vec<PathBuf> = current
            .difference(known)
            .map(|name| self.scratch_dir.join(name))
            .collect();
        *known = current;
        new
    }

    async fn process_new_files(&self, new: Vec<PathBuf>) {
        for path in new {
            tokio::time::sleep(SETTLE_DELAY).await;

            let size = match std::fs::metadata(&path) {
                Ok(meta) => meta.len(),
                Err(_) => {
                    // Vanished between scan and settle (emergency eviction
                    // races are expected).
                    debug!(camera = self.camera_id, path = %path.display(),
                        "New segment vanished before settle");
                    continue;
                }
            };

            if size < MIN_SEGMENT_BYTES {
                warn!(
                    camera = self.camera_id,
                    path = %path.display(),
                    size_bytes = size,
                    "Skipping implausibly small segment"
                );
                continue;
            }

            match self.buffer.add(&path, size) {
                Ok(()) => {
                    self.capture_state.lock().record_segment();
                    debug!(
                        camera = self.camera_id,
                        path = %path.display(),
                        size_bytes = size,
                        "Segment accepted"
                    );
                }
                Err(ReplayError::SegmentNotFound(_)) => {
                    warn!(camera = self.camera_id, path = %path.display(),
                        "Segment vanished before add");
                }
                Err(e) => {
                    warn!(camera = self.camera_id, error = %e, "Buffer rejected segment");
                }
            }
        }
    }
}

/// Names of files in `dir` matching `<prefix>*.mp4`, sorted.
pub fn list_segment_files(dir: &Path, prefix: &str) -> BTreeSet<String> {
    let mut out = BTreeSet::new();
    let Ok(entries) = std::fs::read_dir(dir) else {
        return out;
    };
    for entry in entries.flatten() {
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if name.starts_with(prefix)
            && name.ends_with(".mp4")
            && entry.file_type().map(|t| t.is_file()).unwrap_or(false)
        {
            out.insert(name.to_string());
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CameraConfig;

    fn camera(dir: &Path) -> CameraConfig {
        CameraConfig {
            id: "camera_1".into(),
            url: "rtsp://10.0.0.10/stream".into(),
            scratch_dir: dir.to_path_buf(),
        }
    }

    fn watcher_parts(dir: &Path) -> (SegmentWatcher, Arc<CircularBuffer>) {
        let buffer = Arc::new(CircularBuffer::new("camera_1", dir, 30, 5));
        let state = Arc::new(Mutex::new(crate::capture::CaptureState {
            camera_id: "camera_1".into(),
            phase: crate::capture::SupervisorPhase::Running,
            running: true,
            child_pid: Some(1234),
            started_at: None,
            last_segment_at: None,
            total_segments: 0,
            reconnect_attempts: 3,
        }));
        let cam = camera(dir);
        (SegmentWatcher::new(&cam, buffer.clone(), state), buffer)
    }

    #[test]
    fn listing_filters_prefix_and_extension() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("camera_1_20260801_120000.mp4"), [0; 10]).unwrap();
        std::fs::write(dir.path().join("camera_1_20260801_115955.mp4"), [0; 10]).unwrap();
        std::fs::write(dir.path().join("camera_2_20260801_120000.mp4"), [0; 10]).unwrap();
        std::fs::write(dir.path().join("camera_1_notes.txt"), [0; 10]).unwrap();

        let names = list_segment_files(dir.path(), "camera_1_");
        assert_eq!(names.len(), 2);
        // BTreeSet iteration is sorted: earlier timestamp first.
        let ordered: Vec<_> = names.iter().collect();
        assert_eq!(ordered[0], "camera_1_20260801_115955.mp4");
    }

    #[test]
    fn scan_reports_only_new_files() {
        let dir = tempfile::tempdir().unwrap();
        let (watcher, _buffer) = watcher_parts(dir.path());
        let mut known = BTreeSet::new();

        std::fs::write(dir.path().join("camera_1_a.mp4"), vec![0u8; 2048]).unwrap();
        let first = watcher.scan(&mut known);
        assert_eq!(first.len(), 1);

        // Unchanged directory: nothing new.
        assert!(watcher.scan(&mut known).is_empty());

        std::fs::write(dir.path().join("camera_1_b.mp4"), vec![0u8; 2048]).unwrap();
        let second = watcher.scan(&mut known);
        assert_eq!(second.len(), 1);
        assert!(second[0].ends_with("camera_1_b.mp4"));
    }

    #[tokio::test]
    async fn accepted_segments_update_buffer_and_state() {
        let dir = tempfile::tempdir().unwrap();
        let (watcher, buffer) = watcher_parts(dir.path());
        let mut known = BTreeSet::new();

        std::fs::write(dir.path().join("camera_1_a.mp4"), vec![0u8; 4096]).unwrap();
        std::fs::write(dir.path().join("camera_1_tiny.mp4"), vec![0u8; 100]).unwrap();

        let new = watcher.scan(&mut known);
        watcher.process_new_files(new).await;

        // The plausible file landed, the 100-byte one was skipped.
        assert_eq!(buffer.info().segments_count, 1);
        let st = watcher.capture_state.lock();
        assert_eq!(st.total_segments, 1);
        assert_eq!(st.reconnect_attempts, 0, "fresh segment resets attempts");
        assert!(st.last_segment_at.is_some());
    }

    #[tokio::test]
    async fn vanished_file_is_tolerated() {
        let dir = tempfile::tempdir().unwrap();
        let (watcher, buffer) = watcher_parts(dir.path());
        let mut known = BTreeSet::new();

        let path = dir.path().join("camera_1_gone.mp4");
        std::fs::write(&path, vec![0u8; 4096]).unwrap();
        let new = watcher.scan(&mut known);
        std::fs::remove_file(&path).unwrap();

        watcher.process_new_files(new).await;
        assert_eq!(buffer.info().segments_count, 0);
    }
}
