use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::Serialize;

use crate::error::{ReplayError, Result};

/// Top-level configuration, resolved from the process environment.
///
/// `CAMERA_1_URL`, `CAMERA_2_URL`, … are read consecutively until the first
/// missing index; every other key has a default. An optional env file
/// (`config.env`) is loaded by the CLI before this runs.
#[derive(Debug, Clone)]
pub struct Config {
    /// Cameras in index order (`camera_1`, `camera_2`, …).
    pub cameras: Vec<CameraConfig>,
    /// Seconds per encoder segment.
    pub chunk_seconds: u64,
    /// Rolling window bound per camera, in seconds.
    pub buffer_seconds: u64,
    /// Default clip length in seconds; must be ≤ `buffer_seconds`.
    pub clip_seconds: u64,
    /// RTSP transport handed to the encoder (`tcp` or `udp`).
    pub rtsp_transport: String,
    /// Scratch root on RAM-backed storage; per-camera subdirectories below.
    pub temp_dir: PathBuf,
    /// Durable output root for finished clips.
    pub clips_dir: PathBuf,
    /// Encoder reconnect policy.
    pub reconnect: ReconnectConfig,
    /// Which trigger front-ends to start.
    pub trigger_mode: TriggerMode,
    /// HTTP trigger port (only used in `http` mode).
    pub http_port: u16,
    /// Log filter (`info`, `debug`, …) unless `RUST_LOG` overrides it.
    pub log_level: String,
    /// Console log format.
    pub log_format: LogFormat,
    /// Encoder codec parameters, passed through to the child.
    pub encoder: EncoderConfig,
}

/// Per-camera configuration derived from `CAMERA_<n>_URL`.
#[derive(Debug, Clone, Serialize)]
pub struct CameraConfig {
    /// Stable identifier: `camera_<n>`. Used for directory and file naming.
    pub id: String,
    /// RTSP URL of the camera stream.
    pub url: String,
    /// Scratch directory this camera's encoder writes segments into.
    pub scratch_dir: PathBuf,
}

/// Exponential back-off policy for encoder restarts.
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    /// 0 = unbounded.
    pub max_attempts: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerMode {
    Keyboard,
    Http,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Text,
}

/// H.264 parameters passed to the encoder child.
#[derive(Debug, Clone)]
pub struct EncoderConfig {
    /// Forced keyframe interval in seconds (segment cuts land on these).
    pub keyframe_interval: u32,
    pub preset: String,
    pub crf: u32,
}

impl Config {
    /// Resolve configuration from the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(&|key| std::env::var(key).ok())
    }

    /// Resolve configuration through an arbitrary key lookup.
    pub fn from_lookup(lookup: &dyn Fn(&str) -> Option<String>) -> Result<Self> {
        let mut urls = Vec::new();
        let mut n = 1;
        while let Some(url) = lookup(&format!("CAMERA_{n}_URL")) {
            urls.push(url);
            n += 1;
        }

        let chunk_seconds = parse_u64(lookup, "CHUNK_DURATION", 5)?;
        let buffer_seconds = parse_u64(lookup, "BUFFER_SECONDS", 30)?;
        let clip_seconds = parse_u64(lookup, "FINAL_CLIP_DURATION", 25)?;

        let temp_dir = resolve_temp_dir(lookup);
        let clips_dir = PathBuf::from(
            lookup("CLIPS_DIR").unwrap_or_else(|| "./clips".to_string()),
        );

        let cameras = urls
            .iter()
            .enumerate()
            .map(|(i, url)| {
                let id = format!("camera_{}", i + 1);
                let scratch_dir = temp_dir.join(&id);
                CameraConfig { id, url: url.clone(), scratch_dir }
            })
            .collect();

        let trigger_mode = match lookup("TRIGGER_MODE").as_deref() {
            None | Some("keyboard") => TriggerMode::Keyboard,
            Some("http") => TriggerMode::Http,
            Some(other) => {
                return Err(ReplayError::Config(format!(
                    "TRIGGER_MODE must be 'keyboard' or 'http', got '{other}'"
                )));
            }
        };

        let log_format = match lookup("LOG_FORMAT").as_deref() {
            None | Some("json") => LogFormat::Json,
            Some("text") => LogFormat::Text,
            Some(other) => {
                return Err(ReplayError::Config(format!(
                    "LOG_FORMAT must be 'json' or 'text', got '{other}'"
                )));
            }
        };

        let config = Config {
            cameras,
            chunk_seconds,
            buffer_seconds,
            clip_seconds,
            rtsp_transport: lookup("RTSP_TRANSPORT").unwrap_or_else(|| "tcp".to_string()),
            temp_dir,
            clips_dir,
            reconnect: ReconnectConfig {
                initial_delay: Duration::from_secs(parse_u64(
                    lookup,
                    "RECONNECT_INITIAL_DELAY",
                    2,
                )?),
                max_delay: Duration::from_secs(parse_u64(lookup, "RECONNECT_MAX_DELAY", 30)?),
                max_attempts: parse_u64(lookup, "RECONNECT_MAX_ATTEMPTS", 0)? as u32,
            },
            trigger_mode,
            http_port: parse_u64(lookup, "HTTP_PORT", 8080)? as u16,
            log_level: lookup("LOG_LEVEL").unwrap_or_else(|| "info".to_string()),
            log_format,
            encoder: EncoderConfig {
                keyframe_interval: parse_u64(lookup, "FFMPEG_KEYFRAME_INTERVAL", 1)? as u32,
                preset: lookup("FFMPEG_PRESET").unwrap_or_else(|| "ultrafast".to_string()),
                crf: parse_u64(lookup, "FFMPEG_CRF", 23)? as u32,
            },
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.cameras.is_empty() {
            return Err(ReplayError::Config(
                "No cameras configured. Set at least CAMERA_1_URL.".into(),
            ));
        }
        for cam in &self.cameras {
            if !cam.url.starts_with("rtsp://") {
                return Err(ReplayError::Config(format!(
                    "URL for {} must start with 'rtsp://'",
                    cam.id
                )));
            }
        }
        if self.chunk_seconds == 0 {
            return Err(ReplayError::Config("CHUNK_DURATION must be > 0".into()));
        }
        if self.buffer_seconds == 0 {
            return Err(ReplayError::Config("BUFFER_SECONDS must be > 0".into()));
        }
        if self.clip_seconds == 0 {
            return Err(ReplayError::Config("FINAL_CLIP_DURATION must be > 0".into()));
        }
        if self.clip_seconds > self.buffer_seconds {
            return Err(ReplayError::Config(
                "FINAL_CLIP_DURATION cannot exceed BUFFER_SECONDS".into(),
            ));
        }
        Ok(())
    }

    /// Create the scratch root, clips directory and per-camera scratch
    /// subdirectories. Called once at startup, after validation.
    pub fn ensure_directories(&self) -> Result<()> {
        std::fs::create_dir_all(&self.temp_dir)
            .map_err(|e| ReplayError::Config(format!("Cannot create temp dir: {e}")))?;
        std::fs::create_dir_all(&self.clips_dir)
            .map_err(|e| ReplayError::Config(format!("Cannot create clips dir: {e}")))?;
        for cam in &self.cameras {
            std::fs::create_dir_all(&cam.scratch_dir).map_err(|e| {
                ReplayError::Config(format!("Cannot create scratch dir for {}: {e}", cam.id))
            })?;
        }
        Ok(())
    }

    /// Number of whole chunks the rolling window holds.
    pub fn window_chunks(&self) -> u64 {
        self.buffer_seconds / self.chunk_seconds.max(1)
    }

    pub fn camera(&self, camera_id: &str) -> Option<&CameraConfig> {
        self.cameras.iter().find(|c| c.id == camera_id)
    }
}

fn parse_u64(lookup: &dyn Fn(&str) -> Option<String>, key: &str, default: u64) -> Result<u64> {
    match lookup(key) {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse::<u64>()
            .map_err(|_| ReplayError::Config(format!("{key} must be an integer, got '{raw}'"))),
    }
}

/// Pick the scratch root: explicit `TEMP_DIR`, else tmpfs on Linux
/// (`/dev/shm` when present), a RAM disk or `%TEMP%` on Windows, `/tmp`
/// elsewhere.
fn resolve_temp_dir(lookup: &dyn Fn(&str) -> Option<String>) -> PathBuf {
    if let Some(dir) = lookup("TEMP_DIR") {
        return PathBuf::from(dir);
    }

    #[cfg(target_os = "linux")]
    {
        if std::path::Path::new("/dev/shm").exists() {
            return PathBuf::from("/dev/shm/video_buffer");
        }
        PathBuf::from("/tmp/video_buffer")
    }

    #[cfg(target_os = "windows")]
    {
        let use_ramdisk = lookup("USE_WINDOWS_RAMDISK")
            .map(|v| v.eq_ignore_ascii_case("true"))
            .unwrap_or(false);
        if use_ramdisk {
            return PathBuf::from("R:/video_buffer");
        }
        let base = lookup("TEMP").unwrap_or_else(|| "C:/temp".to_string());
        PathBuf::from(base).join("video_buffer")
    }

    #[cfg(not(any(target_os = "linux", target_os = "windows")))]
    {
        PathBuf::from("/tmp/video_buffer")
    }
}

/// Lookup over a fixed map; the test-suite counterpart of `from_env`.
pub fn lookup_from_map(map: HashMap<String, String>) -> impl Fn(&str) -> Option<String> {
    move |key| map.get(key).cloned()
}
