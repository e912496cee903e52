// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! Rolling segment buffer — one per camera.
//!
//! ```text
//! encoder ──→ scratch dir ──→ watcher ──→ CircularBuffer
//!                                              │ evicts oldest-first
//!                                              ▼
//!                                        unlink + drop
//! ```
//!
//! The buffer owns eviction: the watcher only reports arrivals, and the clip
//! composer freezes the buffer while it reads segment files so nothing it
//! selected is unlinked mid-concat. Emergency eviction (scratch exhaustion)
//! is the one path that ignores the frozen flag.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::{ReplayError, Result};

/// One completed encoder output file, as observed by the watcher.
#[derive(Debug, Clone)]
pub struct Segment {
    pub camera_id: String,
    pub path: PathBuf,
    /// UTC instant the segment was observed complete (not encoder PTS).
    pub wall_time: DateTime<Utc>,
    /// Configured chunk length in seconds.
    pub nominal_duration: u64,
    pub size_bytes: u64,
}

impl Segment {
    /// End of the interval this segment nominally covers.
    pub fn wall_end(&self) -> DateTime<Utc> {
        self.wall_time + chrono::Duration::seconds(self.nominal_duration as i64)
    }
}

/// Snapshot of buffer state for status surfaces.
#[derive(Debug, Clone, Serialize)]
pub struct BufferInfo {
    pub camera_id: String,
    pub segments_count: usize,
    pub total_duration_seconds: u64,
    pub total_size_bytes: u64,
    pub max_window_seconds: u64,
    pub chunk_seconds: u64,
    pub buffer_usage_percent: f64,
    pub frozen: bool,
    pub oldest_wall_time: Option<DateTime<Utc>>,
    pub newest_wall_time: Option<DateTime<Utc>>,
    pub total_segments_added: u64,
    pub total_segments_evicted: u64,
    pub total_bytes_processed: u64,
}

struct Inner {
    /// Oldest first; monotonic by `wall_time` modulo clock quantisation,
    /// insertion order breaking ties.
    segments: VecDeque<Segment>,
    frozen: bool,
    /// Shallow copy taken at freeze time; readers see this while frozen.
    snapshot: Vec<Segment>,
    total_added: u64,
    total_evicted: u64,
    total_bytes: u64,
}

/// Rolling window of the most recent segments for one camera.
pub struct CircularBuffer {
    camera_id: String,
    scratch_dir: PathBuf,
    max_window_seconds: u64,
    chunk_seconds: u64,
    inner: Mutex<Inner>,
}

impl CircularBuffer {
    pub fn new(
        camera_id: impl Into<String>,
        scratch_dir: impl Into<PathBuf>,
        max_window_seconds: u64,
        chunk_seconds: u64,
    ) -> Self {
        CircularBuffer {
            camera_id: camera_id.into(),
            scratch_dir: scratch_dir.into(),
            max_window_seconds,
            chunk_seconds,
            inner: Mutex::new(Inner {
                segments: VecDeque::new(),
                frozen: false,
                snapshot: Vec::new(),
                total_added: 0,
                total_evicted: 0,
                total_bytes: 0,
            }),
        }
    }

    pub fn camera_id(&self) -> &str {
        &self.camera_id
    }

    pub fn scratch_dir(&self) -> &Path {
        &self.scratch_dir
    }

    /// Repopulate from segment files already on scratch storage.
    ///
    /// Called once at startup; file mtime stands in for the observation
    /// time. Anything beyond the window is evicted immediately.
    pub fn recover_existing(&self) -> usize {
        let prefix = format!("{}_", self.camera_id);
        let mut found: Vec<Segment> = Vec::new();

        let entries = match std::fs::read_dir(&self.scratch_dir) {
            Ok(e) => e,
            Err(e) => {
                warn!(camera = self.camera_id, error = %e, "Cannot scan scratch dir for recovery");
                return 0;
            }
        };

        for entry in entries.flatten() {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if !name.starts_with(&prefix) || !name.ends_with(".mp4") {
                continue;
            }
            let Ok(meta) = entry.metadata() else { continue };
            if !meta.is_file() {
                continue;
            }
            let wall_time = meta
                .modified()
                .map(DateTime::<Utc>::from)
                .unwrap_or_else(|_| Utc::now());
            found.push(Segment {
                camera_id: self.camera_id.clone(),
                path: entry.path(),
                wall_time,
                nominal_duration: self.chunk_seconds,
                size_bytes: meta.len(),
            });
        }

        found.sort_by(|a, b| a.wall_time.cmp(&b.wall_time).then(a.path.cmp(&b.path)));
        let recovered = found.len();

        let mut inner = self.inner.lock();
        for seg in found {
            inner.total_added += 1;
            inner.total_bytes += seg.size_bytes;
            inner.segments.push_back(seg);
        }
        self.evict_excess(&mut inner);

        if recovered > 0 {
            info!(
                camera = self.camera_id,
                recovered,
                kept = inner.segments.len(),
                "Recovered segments from scratch storage"
            );
        }
        recovered
    }

    /// Append a newly observed segment, then evict past the window unless
    /// frozen. Rejects files that vanished between observation and add.
    pub fn add(&self, path: &Path, size_bytes: u64) -> Result<()> {
        if !path.exists() {
            return Err(ReplayError::SegmentNotFound(path.to_path_buf()));
        }

        let segment = Segment {
            camera_id: self.camera_id.clone(),
            path: path.to_path_buf(),
            wall_time: Utc::now(),
            nominal_duration: self.chunk_seconds,
            size_bytes,
        };

        let mut inner = self.inner.lock();
        inner.total_added += 1;
        inner.total_bytes += size_bytes;
        inner.segments.push_back(segment);
        debug!(
            camera = self.camera_id,
            buffered = inner.segments.len(),
            bytes = size_bytes,
            "Segment added"
        );

        if !inner.frozen {
            self.evict_excess(&mut inner);
        }
        Ok(())
    }

    /// Evict oldest-first until the nominal total fits the window.
    /// Unlinks each file before dropping its record.
    fn evict_excess(&self, inner: &mut Inner) {
        while inner.segments.len() as u64 * self.chunk_seconds > self.max_window_seconds {
            let Some(old) = inner.segments.pop_front() else { break };
            if let Err(e) = std::fs::remove_file(&old.path) {
                if old.path.exists() {
                    warn!(camera = self.camera_id, path = %old.path.display(), error = %e,
                        "Failed to unlink evicted segment");
                }
            }
            inner.total_evicted += 1;
            debug!(
                camera = self.camera_id,
                path = %old.path.display(),
                remaining = inner.segments.len(),
                "Segment evicted"
            );
        }
    }

    /// The suffix of the sequence covering at least `duration` seconds
    /// (`ceil(duration / chunk)` segments, minimum one). Reads the frozen
    /// snapshot while frozen.
    pub fn recent(&self, duration: f64) -> Vec<Segment> {
        let inner = self.inner.lock();
        let needed = chunks_for(duration, self.chunk_seconds);
        let source: Vec<&Segment> = if inner.frozen {
            inner.snapshot.iter().collect()
        } else {
            inner.segments.iter().collect()
        };
        let skip = source.len().saturating_sub(needed);
        source.into_iter().skip(skip).cloned().collect()
    }

    /// Segments whose nominal interval `[wall_time, wall_time + chunk)`
    /// intersects `[start, end]`. Reads the frozen snapshot while frozen.
    pub fn range(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Vec<Segment> {
        let overlaps = |s: &Segment| s.wall_time <= end && s.wall_end() > start;
        let inner = self.inner.lock();
        if inner.frozen {
            inner.snapshot.iter().filter(|s| overlaps(s)).cloned().collect()
        } else {
            inner.segments.iter().filter(|s| overlaps(s)).cloned().collect()
        }
    }

    /// Suspend eviction and expose a snapshot of the current sequence.
    /// Idempotent: re-freezing while frozen keeps the existing snapshot.
    pub fn freeze(&self) {
        let mut inner = self.inner.lock();
        if inner.frozen {
            return;
        }
        inner.frozen = true;
        inner.snapshot = inner.segments.iter().cloned().collect();
        info!(
            camera = self.camera_id,
            frozen_segments = inner.snapshot.len(),
            "Buffer frozen for clip composition"
        );
    }

    /// Drop the snapshot, resume eviction, and run the deferred pass for
    /// anything that accumulated past the window while frozen.
    pub fn unfreeze(&self) {
        let mut inner = self.inner.lock();
        if !inner.frozen {
            return;
        }
        inner.frozen = false;
        inner.snapshot.clear();
        self.evict_excess(&mut inner);
        info!(camera = self.camera_id, buffered = inner.segments.len(), "Buffer unfrozen");
    }

    pub fn is_frozen(&self) -> bool {
        self.inner.lock().frozen
    }

    /// Unlink and drop every segment. Emergency/debug path only.
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        while let Some(seg) = inner.segments.pop_front() {
            let _ = std::fs::remove_file(&seg.path);
            inner.total_evicted += 1;
        }
        info!(camera = self.camera_id, "Buffer cleared");
    }

    /// Drop the oldest half of the buffer, unlinking files. Runs even while
    /// frozen: scratch exhaustion dominates clip fidelity, and the composer
    /// treats vanished snapshot files as soft errors.
    pub fn emergency_evict(&self) -> usize {
        let mut inner = self.inner.lock();
        let to_drop = inner.segments.len() / 2;
        for _ in 0..to_drop {
            let Some(seg) = inner.segments.pop_front() else { break };
            let _ = std::fs::remove_file(&seg.path);
            inner.total_evicted += 1;
        }
        if to_drop > 0 {
            warn!(
                camera = self.camera_id,
                dropped = to_drop,
                remaining = inner.segments.len(),
                "Emergency eviction"
            );
        }
        to_drop
    }

    pub fn info(&self) -> BufferInfo {
        let inner = self.inner.lock();
        let total_duration = inner.segments.len() as u64 * self.chunk_seconds;
        BufferInfo {
            camera_id: self.camera_id.clone(),
            segments_count: inner.segments.len(),
            total_duration_seconds: total_duration,
            total_size_bytes: inner.segments.iter().map(|s| s.size_bytes).sum(),
            max_window_seconds: self.max_window_seconds,
            chunk_seconds: self.chunk_seconds,
            buffer_usage_percent: if self.max_window_seconds > 0 {
                (total_duration as f64 / self.max_window_seconds as f64) * 100.0
            } else {
                0.0
            },
            frozen: inner.frozen,
            oldest_wall_time: inner.segments.front().map(|s| s.wall_time),
            newest_wall_time: inner.segments.back().map(|s| s.wall_time),
            total_segments_added: inner.total_added,
            total_segments_evicted: inner.total_evicted,
            total_bytes_processed: inner.total_bytes,
        }
    }
}

/// Number of chunks needed to cover `duration` seconds, minimum one.
pub fn chunks_for(duration: f64, chunk_seconds: u64) -> usize {
    ((duration / chunk_seconds.max(1) as f64).ceil() as usize).max(1)
}

/// All per-camera buffers, created once at startup and never destroyed.
pub struct BufferManager {
    buffers: HashMap<String, Arc<CircularBuffer>>,
}

impl BufferManager {
    pub fn new(config: &Config) -> Self {
        let buffers = config
            .cameras
            .iter()
            .map(|cam| {
                let buf = Arc::new(CircularBuffer::new(
                    cam.id.clone(),
                    cam.scratch_dir.clone(),
                    config.buffer_seconds,
                    config.chunk_seconds,
                ));
                (cam.id.clone(), buf)
            })
            .collect::<HashMap<_, _>>();
        info!(cameras = buffers.len(), "Buffer manager initialised");
        BufferManager { buffers }
    }

    /// Opportunistic recovery of whatever segment files remain on scratch.
    pub fn recover_all(&self) -> usize {
        self.buffers.values().map(|b| b.recover_existing()).sum()
    }

    pub fn get(&self, camera_id: &str) -> Option<Arc<CircularBuffer>> {
        self.buffers.get(camera_id).cloned()
    }

    pub fn all(&self) -> impl Iterator<Item = &Arc<CircularBuffer>> {
        self.buffers.values()
    }

    pub fn all_info(&self) -> HashMap<String, BufferInfo> {
        self.buffers.iter().map(|(id, b)| (id.clone(), b.info())).collect()
    }

    /// Halve every buffer. Returns total segments dropped.
    pub fn emergency_evict_all(&self) -> usize {
        self.buffers.values().map(|b| b.emergency_evict()).sum()
    }

    pub fn clear_all(&self) {
        for buf in self.buffers.values() {
            buf.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn make_buffer(dir: &TempDir, window: u64, chunk: u64) -> CircularBuffer {
        CircularBuffer::new("camera_1", dir.path(), window, chunk)
    }

    fn fake_segment(dir: &TempDir, name: &str, bytes: usize) -> PathBuf {
        let path = dir.path().join(name);
        std::fs::write(&path, vec![0u8; bytes]).unwrap();
        path
    }

    #[test]
    fn add_evicts_past_window() {
        let dir = tempfile::tempdir().unwrap();
        let buf = make_buffer(&dir, 30, 5); // window holds 6 chunks

        let mut paths = Vec::new();
        for i in 0..8 {
            let p = fake_segment(&dir, &format!("camera_1_2026_{i:02}.mp4"), 2048);
            buf.add(&p, 2048).unwrap();
            paths.push(p);
        }

        let info = buf.info();
        assert_eq!(info.segments_count, 6);
        assert_eq!(info.total_duration_seconds, 30);
        assert_eq!(info.total_segments_evicted, 2);
        // The two oldest files were unlinked, the rest remain.
        assert!(!paths[0].exists());
        assert!(!paths[1].exists());
        assert!(paths[2].exists());
    }

    #[test]
    fn add_rejects_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let buf = make_buffer(&dir, 30, 5);
        let ghost = dir.path().join("camera_1_ghost.mp4");
        assert!(matches!(
            buf.add(&ghost, 1000),
            Err(ReplayError::SegmentNotFound(_))
        ));
        assert_eq!(buf.info().segments_count, 0);
    }

    #[test]
    fn freeze_defers_eviction_until_unfreeze() {
        let dir = tempfile::tempdir().unwrap();
        let buf = make_buffer(&dir, 30, 5);

        for i in 0..6 {
            let p = fake_segment(&dir, &format!("camera_1_a{i}.mp4"), 2048);
            buf.add(&p, 2048).unwrap();
        }
        buf.freeze();
        assert!(buf.is_frozen());

        // Ten more adds while frozen: sequence grows without eviction.
        for i in 0..10 {
            let p = fake_segment(&dir, &format!("camera_1_b{i}.mp4"), 2048);
            buf.add(&p, 2048).unwrap();
        }
        assert_eq!(buf.info().segments_count, 16);
        assert_eq!(buf.info().total_segments_evicted, 0);

        // One deferred pass brings it back inside the window.
        buf.unfreeze();
        let info = buf.info();
        assert_eq!(info.segments_count, 6);
        assert_eq!(info.total_segments_evicted, 10);
    }

    #[test]
    fn frozen_snapshot_is_stable_under_adds() {
        let dir = tempfile::tempdir().unwrap();
        let buf = make_buffer(&dir, 30, 5);
        for i in 0..4 {
            let p = fake_segment(&dir, &format!("camera_1_a{i}.mp4"), 2048);
            buf.add(&p, 2048).unwrap();
        }
        buf.freeze();
        let before = buf.recent(30.0);
        assert_eq!(before.len(), 4);

        let p = fake_segment(&dir, "camera_1_late.mp4", 2048);
        buf.add(&p, 2048).unwrap();

        // Readers still see only what was present at freeze time.
        let after = buf.recent(30.0);
        assert_eq!(after.len(), 4);
        assert_eq!(
            after.iter().map(|s| &s.path).collect::<Vec<_>>(),
            before.iter().map(|s| &s.path).collect::<Vec<_>>()
        );
        buf.unfreeze();
        assert_eq!(buf.recent(30.0).len(), 5);
    }

    #[test]
    fn freeze_unfreeze_round_trip_preserves_sequence() {
        let dir = tempfile::tempdir().unwrap();
        let buf = make_buffer(&dir, 30, 5);
        for i in 0..5 {
            let p = fake_segment(&dir, &format!("camera_1_{i}.mp4"), 2048);
            buf.add(&p, 2048).unwrap();
        }
        let before: Vec<_> = buf.recent(30.0).iter().map(|s| s.path.clone()).collect();
        buf.freeze();
        buf.unfreeze();
        let after: Vec<_> = buf.recent(30.0).iter().map(|s| s.path.clone()).collect();
        assert_eq!(before, after);
    }

    #[test]
    fn recent_returns_ceil_of_duration() {
        let dir = tempfile::tempdir().unwrap();
        let buf = make_buffer(&dir, 30, 5);
        for i in 0..6 {
            let p = fake_segment(&dir, &format!("camera_1_{i}.mp4"), 2048);
            buf.add(&p, 2048).unwrap();
        }
        assert_eq!(buf.recent(25.0).len(), 5);
        // 12 s at 5 s chunks needs 3 segments.
        assert_eq!(buf.recent(12.0).len(), 3);
        // Asking past the window caps at what is buffered.
        assert_eq!(buf.recent(300.0).len(), 6);
        // Sub-chunk request still yields one segment.
        assert_eq!(buf.recent(0.5).len(), 1);
    }

    #[test]
    fn range_intersects_nominal_intervals() {
        let dir = tempfile::tempdir().unwrap();
        let buf = make_buffer(&dir, 60, 5);
        for i in 0..3 {
            let p = fake_segment(&dir, &format!("camera_1_{i}.mp4"), 2048);
            buf.add(&p, 2048).unwrap();
        }
        let segs = buf.recent(60.0);
        let first = segs.first().unwrap().wall_time;

        // A range ending before the first segment starts matches nothing.
        let none = buf.range(
            first - chrono::Duration::seconds(20),
            first - chrono::Duration::seconds(10),
        );
        assert!(none.is_empty());

        // A range covering now matches everything added in this test.
        let all = buf.range(first - chrono::Duration::seconds(1), Utc::now());
        assert_eq!(all.len(), 3);
    }

    #[test]
    fn emergency_evict_halves_even_while_frozen() {
        let dir = tempfile::tempdir().unwrap();
        let buf = make_buffer(&dir, 40, 5);
        let mut paths = Vec::new();
        for i in 0..8 {
            let p = fake_segment(&dir, &format!("camera_1_{i}.mp4"), 2048);
            buf.add(&p, 2048).unwrap();
            paths.push(p);
        }
        buf.freeze();
        let dropped = buf.emergency_evict();
        assert_eq!(dropped, 4);
        assert_eq!(buf.info().segments_count, 4);
        assert!(buf.is_frozen());
        assert!(!paths[0].exists());
        assert!(paths[4].exists());
        buf.unfreeze();
    }

    #[test]
    fn monotonic_wall_times() {
        let dir = tempfile::tempdir().unwrap();
        let buf = make_buffer(&dir, 60, 5);
        for i in 0..6 {
            let p = fake_segment(&dir, &format!("camera_1_{i}.mp4"), 2048);
            buf.add(&p, 2048).unwrap();
        }
        let segs = buf.recent(60.0);
        for pair in segs.windows(2) {
            assert!(pair[0].wall_time <= pair[1].wall_time);
        }
    }

    #[test]
    fn recover_existing_sorts_and_trims() {
        let dir = tempfile::tempdir().unwrap();
        for i in 0..9 {
            fake_segment(&dir, &format!("camera_1_2026_{i:02}.mp4"), 4096);
        }
        // Alien and undersized files are other cameras' business or noise,
        // but recovery only filters on prefix/extension.
        fake_segment(&dir, "camera_2_2026_00.mp4", 4096);
        fake_segment(&dir, "notes.txt", 10);

        let buf = make_buffer(&dir, 30, 5);
        let recovered = buf.recover_existing();
        assert_eq!(recovered, 9);
        // Trimmed to the window straight away.
        assert_eq!(buf.info().segments_count, 6);
    }

    #[test]
    fn clear_unlinks_everything() {
        let dir = tempfile::tempdir().unwrap();
        let buf = make_buffer(&dir, 30, 5);
        let p = fake_segment(&dir, "camera_1_x.mp4", 2048);
        buf.add(&p, 2048).unwrap();
        buf.clear();
        assert_eq!(buf.info().segments_count, 0);
        assert!(!p.exists());
    }

    #[test]
    fn chunks_for_rounds_up() {
        assert_eq!(chunks_for(25.0, 5), 5);
        assert_eq!(chunks_for(26.0, 5), 6);
        assert_eq!(chunks_for(0.5, 5), 1);
        assert_eq!(chunks_for(10.0, 3), 4);
    }
}
