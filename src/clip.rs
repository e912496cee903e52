// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! Clip materialiser — turns a trigger into one durable MP4 per camera.
//!
//! The composer freezes the camera's buffer, picks the covering segment set,
//! and hands the files to ffmpeg in one of two modes:
//!
//!   fast copy    concat demuxer, streams copied verbatim. Only valid when
//!                the cut points land on chunk boundaries.
//!   precise cut  concat to a temp intermediate, then trim at exact offsets
//!                with a re-encode (libx264 preset=fast, crf=23 + AAC).
//!
//! The output is written next to its final name and renamed only after the
//! tool reports success; partial files are unlinked. The buffer is unfrozen
//! on every exit path, including failures.

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Timelike, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tempfile::NamedTempFile;
use tracing::{error, info, warn};

use crate::buffer::{chunks_for, BufferManager, CircularBuffer, Segment};
use crate::config::Config;
use crate::error::{ReplayError, Result};
use crate::trigger::ClipSelector;

/// Upper bound on the concat-copy child.
const FAST_COPY_TIMEOUT: Duration = Duration::from_secs(60);
/// Upper bound on the re-encoding cut child.
const PRECISE_CUT_TIMEOUT: Duration = Duration::from_secs(120);
/// How close (seconds) the trigger must be to a chunk boundary for fast copy.
const BOUNDARY_TOLERANCE: f64 = 0.5;
/// Extra coverage concatenated before a precise cut, so the trim window is
/// always inside the intermediate.
const PRECISE_COVER_EXTRA: f64 = 10.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ClipMode {
    FastCopy,
    PreciseCut,
}

/// Per-camera result of one trigger.
#[derive(Debug, Clone, Serialize)]
pub struct ClipOutcome {
    pub camera_id: String,
    pub success: bool,
    pub output_path: Option<PathBuf>,
    pub mode: Option<ClipMode>,
    pub segments_used: usize,
    pub error: Option<String>,
}

/// Lifetime composer statistics, exposed via the status surface.
#[derive(Debug, Clone, Serialize)]
pub struct ClipStats {
    pub clips_generated: u64,
    pub total_processing_seconds: f64,
    pub average_processing_seconds: f64,
}

#[derive(Default)]
struct StatsInner {
    clips_generated: u64,
    total_processing_seconds: f64,
}

/// Unfreezes the buffer when dropped, whatever path the job took.
struct FreezeGuard(Arc<CircularBuffer>);

impl FreezeGuard {
    fn freeze(buffer: Arc<CircularBuffer>) -> Self {
        buffer.freeze();
        FreezeGuard(buffer)
    }
}

impl Drop for FreezeGuard {
    fn drop(&mut self) {
        self.0.unfreeze();
    }
}

pub struct ClipComposer {
    config: Arc<Config>,
    buffers: Arc<BufferManager>,
    stats: Mutex<StatsInner>,
}

impl ClipComposer {
    pub fn new(config: Arc<Config>, buffers: Arc<BufferManager>) -> Self {
        ClipComposer { config, buffers, stats: Mutex::new(StatsInner::default()) }
    }

    /// Materialise clips for every camera the selector names. Cameras are
    /// processed sequentially; one camera's failure never blocks the rest.
    pub async fn generate_for(
        &self,
        selector: &ClipSelector,
        request_time: DateTime<Utc>,
        duration: f64,
    ) -> HashMap<String, ClipOutcome> {
        let camera_ids: Vec<String> = match selector {
            ClipSelector::All => self.config.cameras.iter().map(|c| c.id.clone()).collect(),
            ClipSelector::Camera(id) => vec![id.clone()],
        };

        let mut results = HashMap::new();
        for camera_id in camera_ids {
            let outcome = match self.generate_clip(&camera_id, request_time, duration).await {
                Ok((path, mode, used)) => ClipOutcome {
                    camera_id: camera_id.clone(),
                    success: true,
                    output_path: Some(path),
                    mode: Some(mode),
                    segments_used: used,
                    error: None,
                },
                Err(e) => {
                    error!(camera = camera_id, error = %e, "Clip generation failed");
                    ClipOutcome {
                        camera_id: camera_id.clone(),
                        success: false,
                        output_path: None,
                        mode: None,
                        segments_used: 0,
                        error: Some(e.to_string()),
                    }
                }
            };
            results.insert(camera_id, outcome);
        }
        results
    }

    /// Produce one clip of ≈`duration` seconds ending at `request_time`.
    pub async fn generate_clip(
        &self,
        camera_id: &str,
        request_time: DateTime<Utc>,
        duration: f64,
    ) -> Result<(PathBuf, ClipMode, usize)> {
        let started = Instant::now();
        let buffer = self
            .buffers
            .get(camera_id)
            .ok_or_else(|| ReplayError::CameraNotFound { id: camera_id.to_string() })?;

        info!(
            camera = camera_id,
            duration,
            request_time = %request_time,
            "Clip generation started"
        );

        let _guard = FreezeGuard::freeze(buffer.clone());

        let segments = self.select_segments(&buffer, camera_id, request_time, duration);
        if segments.is_empty() {
            return Err(ReplayError::Composition {
                id: camera_id.to_string(),
                reason: "no segments available in buffer".into(),
            });
        }

        let mode = choose_mode(request_time, duration, self.config.chunk_seconds);
        let filename = clip_filename(camera_id, request_time);
        let final_path = self.config.clips_dir.join(&filename);
        let tmp_path = self.config.clips_dir.join(format!(
            "{}.tmp.mp4",
            filename.trim_end_matches(".mp4")
        ));

        let used = match mode {
            ClipMode::FastCopy => {
                self.compose_fast(camera_id, &segments, &tmp_path, duration).await
            }
            ClipMode::PreciseCut => {
                self.compose_precise(camera_id, &segments, &tmp_path, request_time, duration)
                    .await
            }
        };

        let used = match used {
            Ok(n) => n,
            Err(e) => {
                let _ = std::fs::remove_file(&tmp_path);
                return Err(e);
            }
        };

        std::fs::rename(&tmp_path, &final_path).map_err(|e| ReplayError::Composition {
            id: camera_id.to_string(),
            reason: format!("rename into place: {e}"),
        })?;

        let elapsed = started.elapsed().as_secs_f64();
        {
            let mut stats = self.stats.lock();
            stats.clips_generated += 1;
            stats.total_processing_seconds += elapsed;
        }

        info!(
            camera = camera_id,
            clip = %final_path.display(),
            mode = ?mode,
            segments_used = used,
            processing_seconds = elapsed,
            "Clip generation completed"
        );
        Ok((final_path, mode, used))
    }

    /// Pick the covering segment set: the exact time range first, the recent
    /// suffix as fallback, and a widened sweep of the whole window when the
    /// survivors fall short. A short result is a soft failure — the clip
    /// just comes out shorter than requested.
    fn select_segments(
        &self,
        buffer: &CircularBuffer,
        camera_id: &str,
        request_time: DateTime<Utc>,
        duration: f64,
    ) -> Vec<Segment> {
        let clip_start = request_time
            - chrono::Duration::milliseconds((duration * 1000.0) as i64);

        let mut segments = buffer.range(clip_start, request_time);
        if segments.is_empty() {
            segments = buffer.recent(duration);
        }
        segments.retain(|s| s.path.exists());

        let minimum = chunks_for(duration, self.config.chunk_seconds);
        if segments.len() < minimum {
            warn!(
                camera = camera_id,
                available = segments.len(),
                required = minimum,
                duration,
                "Insufficient segments for requested duration"
            );
            let mut widened = buffer.recent(self.config.buffer_seconds as f64);
            widened.retain(|s| s.path.exists());
            if widened.len() > segments.len() {
                segments = widened;
            }
            if segments.len() < minimum {
                warn!(
                    camera = camera_id,
                    available = segments.len(),
                    required = minimum,
                    "Proceeding with a shorter clip"
                );
            }
        }
        segments
    }

    /// Concat-copy the last `ceil(duration / chunk)` segments, timestamps
    /// rebased to zero. No re-encoding.
    async fn compose_fast(
        &self,
        camera_id: &str,
        segments: &[Segment],
        output: &Path,
        duration: f64,
    ) -> Result<usize> {
        let needed = chunks_for(duration, self.config.chunk_seconds);
        let chosen = tail(segments, needed);

        let list = write_concat_list(chosen).map_err(|e| ReplayError::Composition {
            id: camera_id.to_string(),
            reason: format!("write concat list: {e}"),
        })?;

        let args = fast_copy_args(list.path(), output);
        self.run_ffmpeg(camera_id, &args, FAST_COPY_TIMEOUT).await?;
        Ok(chosen.len())
    }

    /// Concat enough segments to cover the window with margin, then cut at
    /// exact offsets with a re-encode.
    async fn compose_precise(
        &self,
        camera_id: &str,
        segments: &[Segment],
        output: &Path,
        request_time: DateTime<Utc>,
        duration: f64,
    ) -> Result<usize> {
        let needed = chunks_for(duration + PRECISE_COVER_EXTRA, self.config.chunk_seconds);
        let chosen = tail(segments, needed);

        let list = write_concat_list(chosen).map_err(|e| ReplayError::Composition {
            id: camera_id.to_string(),
            reason: format!("write concat list: {e}"),
        })?;

        let intermediate = NamedTempFile::with_suffix(".mp4")
            .map_err(|e| ReplayError::Composition {
                id: camera_id.to_string(),
                reason: format!("create intermediate: {e}"),
            })?;

        let concat = concat_copy_args(list.path(), intermediate.path());
        self.run_ffmpeg(camera_id, &concat, FAST_COPY_TIMEOUT).await?;

        let clip_start = request_time
            - chrono::Duration::milliseconds((duration * 1000.0) as i64);
        let offset = start_offset(clip_start, chosen[0].wall_time);

        let cut = precise_cut_args(intermediate.path(), offset, duration, output);
        self.run_ffmpeg(camera_id, &cut, PRECISE_CUT_TIMEOUT).await?;
        Ok(chosen.len())
    }

    /// Run one ffmpeg invocation with a hard deadline. A timeout kills the
    /// child and is a failure, never a partial success.
    async fn run_ffmpeg(&self, camera_id: &str, args: &[String], limit: Duration) -> Result<()> {
        let mut cmd = tokio::process::Command::new("ffmpeg");
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = cmd.spawn().map_err(|e| ReplayError::Composition {
            id: camera_id.to_string(),
            reason: format!("spawn ffmpeg: {e}"),
        })?;

        let output = match tokio::time::timeout(limit, child.wait_with_output()).await {
            Ok(Ok(out)) => out,
            Ok(Err(e)) => {
                return Err(ReplayError::Composition {
                    id: camera_id.to_string(),
                    reason: format!("wait on ffmpeg: {e}"),
                });
            }
            Err(_) => {
                // Dropping the future killed the child (kill_on_drop).
                return Err(ReplayError::Composition {
                    id: camera_id.to_string(),
                    reason: format!("ffmpeg timed out after {}s", limit.as_secs()),
                });
            }
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let tail: String = stderr
                .chars()
                .rev()
                .take(500)
                .collect::<Vec<_>>()
                .into_iter()
                .rev()
                .collect();
            return Err(ReplayError::Composition {
                id: camera_id.to_string(),
                reason: format!("ffmpeg exited {:?}: {tail}", output.status.code()),
            });
        }
        Ok(())
    }

    pub fn stats(&self) -> ClipStats {
        let stats = self.stats.lock();
        ClipStats {
            clips_generated: stats.clips_generated,
            total_processing_seconds: stats.total_processing_seconds,
            average_processing_seconds: if stats.clips_generated > 0 {
                stats.total_processing_seconds / stats.clips_generated as f64
            } else {
                0.0
            },
        }
    }

    /// Remove finished clips older than `max_age_days` from the clips
    /// directory. Returns the number removed.
    pub fn cleanup_old_clips(&self, max_age_days: u64) -> usize {
        let cutoff = Utc::now() - chrono::Duration::days(max_age_days as i64);
        let mut removed = 0usize;

        let Ok(entries) = std::fs::read_dir(&self.config.clips_dir) else {
            return 0;
        };
        for entry in entries.flatten() {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if !name.contains("_clip_") || !name.ends_with(".mp4") {
                continue;
            }
            let Ok(meta) = entry.metadata() else { continue };
            let Ok(modified) = meta.modified() else { continue };
            if DateTime::<Utc>::from(modified) < cutoff {
                if std::fs::remove_file(entry.path()).is_ok() {
                    removed += 1;
                    info!(clip = name, "Old clip removed");
                }
            }
        }
        if removed > 0 {
            info!(removed, max_age_days, "Clip retention sweep completed");
        }
        removed
    }
}

/// Fast copy is only sound when both the duration is whole chunks and the
/// trigger instant sits (±0.5 s) on a chunk boundary — otherwise the copied
/// stream would start mid-GOP somewhere the viewer didn't ask for.
pub fn choose_mode(request_time: DateTime<Utc>, duration: f64, chunk_seconds: u64) -> ClipMode {
    let chunk = chunk_seconds.max(1) as f64;

    let rem = duration.rem_euclid(chunk);
    let duration_aligned = rem < 1e-6 || (chunk - rem) < 1e-6;

    let in_minute =
        request_time.second() as f64 + request_time.nanosecond() as f64 / 1_000_000_000.0;
    let boundary = (in_minute / chunk).round() * chunk;
    let near_boundary = (in_minute - boundary).abs() <= BOUNDARY_TOLERANCE;

    if duration_aligned && near_boundary {
        ClipMode::FastCopy
    } else {
        ClipMode::PreciseCut
    }
}

/// `<camera_id>_clip_<YYYYMMDD_HHMMSS>Z.mp4`, request time in UTC.
pub fn clip_filename(camera_id: &str, request_time: DateTime<Utc>) -> String {
    format!("{}_clip_{}Z.mp4", camera_id, request_time.format("%Y%m%d_%H%M%S"))
}

/// Offset of the requested start inside the concatenated intermediate.
fn start_offset(clip_start: DateTime<Utc>, first_segment: DateTime<Utc>) -> f64 {
    ((clip_start - first_segment).num_milliseconds() as f64 / 1000.0).max(0.0)
}

fn tail(segments: &[Segment], n: usize) -> &[Segment] {
    &segments[segments.len().saturating_sub(n)..]
}

/// Write an ffmpeg concat-demuxer listing. Paths are absolute with forward
/// slashes so the same listing works on Windows.
fn write_concat_list(segments: &[Segment]) -> std::io::Result<NamedTempFile> {
    let mut file = tempfile::Builder::new().suffix(".txt").tempfile()?;
    for seg in segments {
        let abs = seg
            .path
            .canonicalize()
            .unwrap_or_else(|_| seg.path.clone());
        writeln!(file, "file '{}'", abs.display().to_string().replace('\\', "/"))?;
    }
    file.flush()?;
    Ok(file)
}

fn fast_copy_args(list: &Path, output: &Path) -> Vec<String> {
    vec![
        "-y".into(),
        "-f".into(),
        "concat".into(),
        "-safe".into(),
        "0".into(),
        "-i".into(),
        list.to_string_lossy().into_owned(),
        "-c".into(),
        "copy".into(),
        "-avoid_negative_ts".into(),
        "make_zero".into(),
        output.to_string_lossy().into_owned(),
    ]
}

fn concat_copy_args(list: &Path, output: &Path) -> Vec<String> {
    vec![
        "-y".into(),
        "-f".into(),
        "concat".into(),
        "-safe".into(),
        "0".into(),
        "-i".into(),
        list.to_string_lossy().into_owned(),
        "-c".into(),
        "copy".into(),
        output.to_string_lossy().into_owned(),
    ]
}

fn precise_cut_args(input: &Path, offset: f64, duration: f64, output: &Path) -> Vec<String> {
    vec![
        "-y".into(),
        "-i".into(),
        input.to_string_lossy().into_owned(),
        "-ss".into(),
        format!("{offset:.3}"),
        "-t".into(),
        format!("{duration:.3}"),
        "-c:v".into(),
        "libx264".into(),
        "-preset".into(),
        "fast".into(),
        "-crf".into(),
        "23".into(),
        "-c:a".into(),
        "aac".into(),
        "-avoid_negative_ts".into(),
        "make_zero".into(),
        output.to_string_lossy().into_owned(),
    ]
}
