// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! Pipeline integration tests: buffers + clip selection + health mapping.
//!
//! Run with: `cargo test`

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use chrono::{TimeZone, Utc};
use tempfile::TempDir;

use replaycam::buffer::BufferManager;
use replaycam::capture::{CaptureState, SupervisorPhase};
use replaycam::clip::{choose_mode, clip_filename, ClipComposer, ClipMode};
use replaycam::config::{lookup_from_map, Config};
use replaycam::monitor::{buffer_health, camera_health, HealthRegistry, HealthReport, HealthStatus};
use replaycam::trigger::ClipSelector;

fn two_camera_config(root: &Path) -> Arc<Config> {
    let env = HashMap::from([
        ("CAMERA_1_URL".to_string(), "rtsp://10.0.0.10:554/main".to_string()),
        ("CAMERA_2_URL".to_string(), "rtsp://10.0.0.11:554/main".to_string()),
        ("TEMP_DIR".to_string(), root.join("scratch").to_string_lossy().into_owned()),
        ("CLIPS_DIR".to_string(), root.join("clips").to_string_lossy().into_owned()),
        ("CHUNK_DURATION".to_string(), "5".to_string()),
        ("BUFFER_SECONDS".to_string(), "30".to_string()),
        ("FINAL_CLIP_DURATION".to_string(), "25".to_string()),
    ]);
    let cfg = Config::from_lookup(&lookup_from_map(env)).expect("config");
    cfg.ensure_directories().expect("dirs");
    Arc::new(cfg)
}

fn write_segments(cfg: &Config, camera_id: &str, count: usize) {
    let cam = cfg.camera(camera_id).unwrap();
    let buffers_dir = &cam.scratch_dir;
    for i in 0..count {
        let path = buffers_dir.join(format!("{camera_id}_20260801_1200{i:02}.mp4"));
        std::fs::write(&path, vec![0u8; 4096]).unwrap();
    }
}

#[test]
fn buffers_are_per_camera_and_windowed() {
    let root = TempDir::new().unwrap();
    let cfg = two_camera_config(root.path());
    let buffers = BufferManager::new(&cfg);

    let b1 = buffers.get("camera_1").unwrap();
    let b2 = buffers.get("camera_2").unwrap();

    // Nine adds on camera_1: window holds six, three evicted.
    for i in 0..9 {
        let p = b1.scratch_dir().join(format!("camera_1_a{i}.mp4"));
        std::fs::write(&p, vec![0u8; 4096]).unwrap();
        b1.add(&p, 4096).unwrap();
    }
    // Two adds on camera_2: untouched by camera_1 traffic.
    for i in 0..2 {
        let p = b2.scratch_dir().join(format!("camera_2_a{i}.mp4"));
        std::fs::write(&p, vec![0u8; 4096]).unwrap();
        b2.add(&p, 4096).unwrap();
    }

    assert_eq!(b1.info().segments_count, 6);
    assert_eq!(b1.info().total_segments_evicted, 3);
    assert_eq!(b2.info().segments_count, 2);
    assert_eq!(b2.info().total_segments_evicted, 0);
}

#[test]
fn startup_recovery_ingests_leftover_segments() {
    let root = TempDir::new().unwrap();
    let cfg = two_camera_config(root.path());

    // Segments left behind by a previous run, more than one window's worth.
    write_segments(&cfg, "camera_1", 8);
    write_segments(&cfg, "camera_2", 3);

    let buffers = BufferManager::new(&cfg);
    let recovered = buffers.recover_all();
    assert_eq!(recovered, 11);

    // camera_1 trimmed to the window, camera_2 kept whole.
    assert_eq!(buffers.get("camera_1").unwrap().info().segments_count, 6);
    assert_eq!(buffers.get("camera_2").unwrap().info().segments_count, 3);
}

#[test]
fn emergency_eviction_halves_every_buffer() {
    let root = TempDir::new().unwrap();
    let cfg = two_camera_config(root.path());
    let buffers = BufferManager::new(&cfg);

    for camera_id in ["camera_1", "camera_2"] {
        let buf = buffers.get(camera_id).unwrap();
        for i in 0..6 {
            let p = buf.scratch_dir().join(format!("{camera_id}_b{i}.mp4"));
            std::fs::write(&p, vec![0u8; 4096]).unwrap();
            buf.add(&p, 4096).unwrap();
        }
    }

    let dropped = buffers.emergency_evict_all();
    assert_eq!(dropped, 6);
    assert_eq!(buffers.get("camera_1").unwrap().info().segments_count, 3);
    assert_eq!(buffers.get("camera_2").unwrap().info().segments_count, 3);
}

#[test]
fn frozen_buffer_grows_then_one_eviction_pass() {
    let root = TempDir::new().unwrap();
    let cfg = two_camera_config(root.path());
    let buffers = BufferManager::new(&cfg);
    let buf = buffers.get("camera_1").unwrap();

    for i in 0..6 {
        let p = buf.scratch_dir().join(format!("camera_1_c{i}.mp4"));
        std::fs::write(&p, vec![0u8; 4096]).unwrap();
        buf.add(&p, 4096).unwrap();
    }

    buf.freeze();
    for i in 0..10 {
        let p = buf.scratch_dir().join(format!("camera_1_d{i}.mp4"));
        std::fs::write(&p, vec![0u8; 4096]).unwrap();
        buf.add(&p, 4096).unwrap();
    }
    // Sequence grew past the window with zero evictions while frozen.
    assert_eq!(buf.info().segments_count, 16);
    assert_eq!(buf.info().total_segments_evicted, 0);

    buf.unfreeze();
    assert_eq!(buf.info().segments_count, 6);
    assert_eq!(buf.info().total_segments_evicted, 10);
}

#[tokio::test]
async fn trigger_before_any_segments_fails_per_camera_without_wedging() {
    let root = TempDir::new().unwrap();
    let cfg = two_camera_config(root.path());
    let buffers = Arc::new(BufferManager::new(&cfg));
    let composer = ClipComposer::new(cfg.clone(), buffers.clone());

    let results = composer.generate_for(&ClipSelector::All, Utc::now(), 25.0).await;

    assert_eq!(results.len(), 2);
    for outcome in results.values() {
        assert!(!outcome.success);
        assert!(outcome.error.is_some());
    }
    // Failure paths must leave both buffers unfrozen and usable.
    for camera_id in ["camera_1", "camera_2"] {
        let buf = buffers.get(camera_id).unwrap();
        assert!(!buf.is_frozen());
        let p = buf.scratch_dir().join(format!("{camera_id}_post.mp4"));
        std::fs::write(&p, vec![0u8; 4096]).unwrap();
        buf.add(&p, 4096).unwrap();
    }
    assert_eq!(composer.stats().clips_generated, 0);
}

#[test]
fn full_window_trigger_selects_entire_buffer() {
    let root = TempDir::new().unwrap();
    let cfg = two_camera_config(root.path());
    let buffers = BufferManager::new(&cfg);
    let buf = buffers.get("camera_1").unwrap();

    for i in 0..6 {
        let p = buf.scratch_dir().join(format!("camera_1_e{i}.mp4"));
        std::fs::write(&p, vec![0u8; 4096]).unwrap();
        buf.add(&p, 4096).unwrap();
    }

    // duration == buffer_seconds: the whole current window is used.
    let segs = buf.recent(cfg.buffer_seconds as f64);
    assert_eq!(segs.len(), 6);
}

#[test]
fn mode_choice_matches_trigger_alignment() {
    // 12:00:30 is a 5 s boundary; 25 s is five whole chunks → fast copy.
    let aligned = Utc.with_ymd_and_hms(2026, 8, 1, 12, 0, 30).unwrap();
    assert_eq!(choose_mode(aligned, 25.0, 5), ClipMode::FastCopy);

    // 12:00:33 is 2 s off the boundary → precise cut.
    let off = Utc.with_ymd_and_hms(2026, 8, 1, 12, 0, 33).unwrap();
    assert_eq!(choose_mode(off, 25.0, 5), ClipMode::PreciseCut);

    // A duration that is not whole chunks always re-encodes.
    assert_eq!(choose_mode(aligned, 12.0, 5), ClipMode::PreciseCut);

    assert_eq!(clip_filename("camera_1", aligned), "camera_1_clip_20260801_120030Z.mp4");
}

#[test]
fn stalled_camera_escalates_to_failed() {
    let mut state = CaptureState {
        camera_id: "camera_1".into(),
        phase: SupervisorPhase::Running,
        running: true,
        child_pid: Some(4242),
        started_at: Some(Utc::now() - chrono::Duration::seconds(600)),
        last_segment_at: Some(Utc::now()),
        total_segments: 100,
        reconnect_attempts: 0,
    };
    assert_eq!(camera_health(&state).status(), HealthStatus::Healthy);

    // Segment production stalls: warning, critical, failed in order.
    state.last_segment_at = Some(Utc::now() - chrono::Duration::seconds(40));
    assert_eq!(camera_health(&state).status(), HealthStatus::Warning);
    state.last_segment_at = Some(Utc::now() - chrono::Duration::seconds(70));
    assert_eq!(camera_health(&state).status(), HealthStatus::Critical);
    state.last_segment_at = Some(Utc::now() - chrono::Duration::seconds(130));
    assert_eq!(camera_health(&state).status(), HealthStatus::Failed);

    // The registry records the escalation as one transition per change.
    let registry = HealthRegistry::new();
    assert!(registry.apply("camera_1", HealthReport::Healthy { metrics: Default::default() }).is_none());
    let change = registry.apply("camera_1", camera_health(&state));
    assert_eq!(change, Some((HealthStatus::Healthy, HealthStatus::Failed)));
    assert_eq!(registry.summary().summary.failed_components, 1);
}

#[test]
fn scratch_pressure_reports_through_buffer_probe() {
    let root = TempDir::new().unwrap();
    let cfg = two_camera_config(root.path());
    let buffers = BufferManager::new(&cfg);

    // Healthy scratch, empty buffers: starvation warning only.
    let infos = buffers.all_info();
    assert_eq!(buffer_health(&infos, Some(40.0)).status(), HealthStatus::Warning);

    // Scratch near full dominates as critical.
    assert_eq!(buffer_health(&infos, Some(95.0)).status(), HealthStatus::Critical);
}

#[test]
fn successive_triggers_produce_distinct_filenames() {
    let t1 = Utc.with_ymd_and_hms(2026, 8, 1, 12, 0, 30).unwrap();
    let t2 = Utc.with_ymd_and_hms(2026, 8, 1, 12, 0, 31).unwrap();
    assert_ne!(clip_filename("camera_1", t1), clip_filename("camera_1", t2));
}
