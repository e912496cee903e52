// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! Resilience monitor — periodic health assessment with corrective actions.
//!
//! One task per monitored component (host, each camera, the buffer tier).
//! Probes return a [`HealthReport`]; status transitions into CRITICAL or
//! FAILED emit typed [`RecoveryCommand`]s over a channel that the
//! orchestrator drains. The monitor holds no references back into the
//! components it supervises — commands are the only control edge.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{json, Map, Value};
use sysinfo::{Components, Disks, System};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::buffer::{BufferInfo, BufferManager};
use crate::capture::CaptureState;
use crate::config::Config;

const SYSTEM_PERIOD: Duration = Duration::from_secs(30);
const CAMERA_PERIOD: Duration = Duration::from_secs(10);
const BUFFER_PERIOD: Duration = Duration::from_secs(15);
/// CPU usage is a delta between two refreshes this far apart.
const CPU_SAMPLE_WINDOW: Duration = Duration::from_secs(1);

const CPU_WARN: f64 = 70.0;
const CPU_CRIT: f64 = 90.0;
const MEM_WARN: f64 = 85.0;
const MEM_CRIT: f64 = 95.0;
const DISK_WARN: f64 = 85.0;
const DISK_CRIT: f64 = 95.0;
const TEMP_WARN: f64 = 70.0;
const TEMP_CRIT: f64 = 80.0;
const SCRATCH_WARN: f64 = 75.0;
const SCRATCH_CRIT: f64 = 90.0;
/// A buffer this empty means the producer is starving it.
const BUFFER_STARVATION_PCT: f64 = 20.0;

const SEGMENT_AGE_WARN: f64 = 30.0;
const SEGMENT_AGE_CRIT: f64 = 60.0;
const SEGMENT_AGE_FAILED: f64 = 120.0;
const RECONNECTS_WARN: u32 = 5;
const RECONNECTS_CRIT: u32 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Warning,
    Critical,
    Failed,
    Recovering,
}

impl HealthStatus {
    fn severity(self) -> u8 {
        match self {
            HealthStatus::Healthy => 0,
            HealthStatus::Recovering => 1,
            HealthStatus::Warning => 2,
            HealthStatus::Critical => 3,
            HealthStatus::Failed => 4,
        }
    }

    pub fn worst(self, other: HealthStatus) -> HealthStatus {
        if other.severity() > self.severity() {
            other
        } else {
            self
        }
    }

    pub fn is_bad(self) -> bool {
        matches!(self, HealthStatus::Critical | HealthStatus::Failed)
    }
}

/// What a health probe reports. Probes return this directly instead of
/// loosely shaped result maps.
#[derive(Debug, Clone)]
pub enum HealthReport {
    Healthy { metrics: Map<String, Value> },
    Warning { metrics: Map<String, Value> },
    Critical { metrics: Map<String, Value>, error: Option<String> },
    Failed { error: String },
}

impl HealthReport {
    pub fn status(&self) -> HealthStatus {
        match self {
            HealthReport::Healthy { .. } => HealthStatus::Healthy,
            HealthReport::Warning { .. } => HealthStatus::Warning,
            HealthReport::Critical { .. } => HealthStatus::Critical,
            HealthReport::Failed { .. } => HealthStatus::Failed,
        }
    }

    fn error(&self) -> Option<String> {
        match self {
            HealthReport::Critical { error, .. } => error.clone(),
            HealthReport::Failed { error } => Some(error.clone()),
            _ => None,
        }
    }

    fn into_metrics(self) -> Map<String, Value> {
        match self {
            HealthReport::Healthy { metrics }
            | HealthReport::Warning { metrics }
            | HealthReport::Critical { metrics, .. } => metrics,
            HealthReport::Failed { .. } => Map::new(),
        }
    }

    /// Build a report from a worst-of status plus collected metrics.
    fn from_parts(status: HealthStatus, metrics: Map<String, Value>, error: Option<String>) -> Self {
        match status {
            HealthStatus::Healthy | HealthStatus::Recovering => HealthReport::Healthy { metrics },
            HealthStatus::Warning => HealthReport::Warning { metrics },
            HealthStatus::Critical => HealthReport::Critical { metrics, error },
            HealthStatus::Failed => HealthReport::Failed {
                error: error.unwrap_or_else(|| "component failed".into()),
            },
        }
    }
}

/// Last known state of one monitored component.
#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    pub component: String,
    pub status: HealthStatus,
    pub last_check: DateTime<Utc>,
    pub error_count: u64,
    pub warning_count: u64,
    pub last_error: Option<String>,
    pub last_error_time: Option<DateTime<Utc>>,
    pub custom_metrics: Map<String, Value>,
}

/// Corrective actions the monitor may request from component owners.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryCommand {
    RestartCamera(String),
    EmergencyEvict,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthCounts {
    pub healthy_components: usize,
    pub warning_components: usize,
    pub critical_components: usize,
    pub failed_components: usize,
    pub total_components: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthSummary {
    pub overall_status: HealthStatus,
    pub system_uptime_seconds: i64,
    pub recovery_actions_taken: u64,
    pub components: HashMap<String, HealthSnapshot>,
    pub summary: HealthCounts,
}

/// Shared store of component snapshots plus lifetime recovery counters.
pub struct HealthRegistry {
    snapshots: Mutex<HashMap<String, HealthSnapshot>>,
    started_at: DateTime<Utc>,
    recovery_actions: AtomicU64,
}

impl HealthRegistry {
    pub fn new() -> Self {
        HealthRegistry {
            snapshots: Mutex::new(HashMap::new()),
            started_at: Utc::now(),
            recovery_actions: AtomicU64::new(0),
        }
    }

    /// Fold a probe result into the snapshot for `component`. Returns the
    /// `(old, new)` pair when the status changed.
    pub fn apply(
        &self,
        component: &str,
        report: HealthReport,
    ) -> Option<(HealthStatus, HealthStatus)> {
        let new_status = report.status();
        let error = report.error();

        let mut snapshots = self.snapshots.lock();
        let snapshot = snapshots.entry(component.to_string()).or_insert_with(|| HealthSnapshot {
            component: component.to_string(),
            status: HealthStatus::Healthy,
            last_check: Utc::now(),
            error_count: 0,
            warning_count: 0,
            last_error: None,
            last_error_time: None,
            custom_metrics: Map::new(),
        });

        let old_status = snapshot.status;
        snapshot.status = new_status;
        snapshot.last_check = Utc::now();
        if let Some(err) = error {
            snapshot.error_count += 1;
            snapshot.last_error = Some(err);
            snapshot.last_error_time = Some(Utc::now());
        }
        if new_status == HealthStatus::Warning {
            snapshot.warning_count += 1;
        }
        snapshot.custom_metrics = report.into_metrics();

        if old_status != new_status {
            info!(
                component,
                old = ?old_status,
                new = ?new_status,
                "Component status changed"
            );
            Some((old_status, new_status))
        } else {
            None
        }
    }

    pub fn record_recovery_action(&self) {
        self.recovery_actions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn summary(&self) -> HealthSummary {
        let snapshots = self.snapshots.lock().clone();
        let mut overall = HealthStatus::Healthy;
        let mut counts = HealthCounts {
            healthy_components: 0,
            warning_components: 0,
            critical_components: 0,
            failed_components: 0,
            total_components: snapshots.len(),
        };
        for snap in snapshots.values() {
            overall = overall.worst(snap.status);
            match snap.status {
                HealthStatus::Healthy | HealthStatus::Recovering => counts.healthy_components += 1,
                HealthStatus::Warning => counts.warning_components += 1,
                HealthStatus::Critical => counts.critical_components += 1,
                HealthStatus::Failed => counts.failed_components += 1,
            }
        }
        HealthSummary {
            overall_status: overall,
            system_uptime_seconds: (Utc::now() - self.started_at).num_seconds(),
            recovery_actions_taken: self.recovery_actions.load(Ordering::Relaxed),
            components: snapshots,
            summary: counts,
        }
    }
}

impl Default for HealthRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Spawns and owns the monitor tasks.
pub struct ResilienceMonitor {
    config: Arc<Config>,
    buffers: Arc<BufferManager>,
    captures: HashMap<String, Arc<Mutex<CaptureState>>>,
    registry: Arc<HealthRegistry>,
    command_tx: mpsc::Sender<RecoveryCommand>,
}

impl ResilienceMonitor {
    pub fn new(
        config: Arc<Config>,
        buffers: Arc<BufferManager>,
        captures: HashMap<String, Arc<Mutex<CaptureState>>>,
    ) -> (Self, mpsc::Receiver<RecoveryCommand>) {
        let (command_tx, command_rx) = mpsc::channel(32);
        (
            ResilienceMonitor {
                config,
                buffers,
                captures,
                registry: Arc::new(HealthRegistry::new()),
                command_tx,
            },
            command_rx,
        )
    }

    pub fn registry(&self) -> Arc<HealthRegistry> {
        self.registry.clone()
    }

    /// Spawn one task per component: host system, each camera, buffer tier.
    pub fn spawn_all(&self, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();

        handles.push(self.spawn_system_monitor(shutdown.clone()));
        for (camera_id, state) in &self.captures {
            handles.push(self.spawn_camera_monitor(camera_id.clone(), state.clone(), shutdown.clone()));
        }
        handles.push(self.spawn_buffer_monitor(shutdown));

        info!(components = handles.len(), "Resilience monitoring started");
        handles
    }

    fn spawn_system_monitor(&self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let registry = self.registry.clone();
        let command_tx = self.command_tx.clone();
        let clips_dir = self.config.clips_dir.clone();

        tokio::spawn(async move {
            let mut sys = System::new();
            loop {
                let report = sample_system_health(&mut sys, &clips_dir).await;
                let memory_critical = report_metric(&report, "memory_percent")
                    .map(|v| v >= MEM_CRIT)
                    .unwrap_or(false);

                if let Some((_, new)) = registry.apply("system", report) {
                    if new == HealthStatus::Critical && memory_critical {
                        warn!("Host RAM critical, requesting emergency eviction");
                        let _ = command_tx.send(RecoveryCommand::EmergencyEvict).await;
                    }
                }

                tokio::select! {
                    _ = tokio::time::sleep(SYSTEM_PERIOD) => {}
                    _ = shutdown.changed() => if *shutdown.borrow() { break },
                }
            }
        })
    }

    fn spawn_camera_monitor(
        &self,
        camera_id: String,
        state: Arc<Mutex<CaptureState>>,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let registry = self.registry.clone();
        let command_tx = self.command_tx.clone();

        tokio::spawn(async move {
            loop {
                let report = camera_health(&state.lock());
                if let Some((_, new)) = registry.apply(&camera_id, report) {
                    if new.is_bad() {
                        let _ = command_tx
                            .send(RecoveryCommand::RestartCamera(camera_id.clone()))
                            .await;
                    }
                }

                tokio::select! {
                    _ = tokio::time::sleep(CAMERA_PERIOD) => {}
                    _ = shutdown.changed() => if *shutdown.borrow() { break },
                }
            }
        })
    }

    fn spawn_buffer_monitor(&self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let registry = self.registry.clone();
        let command_tx = self.command_tx.clone();
        let buffers = self.buffers.clone();
        let temp_dir = self.config.temp_dir.clone();

        tokio::spawn(async move {
            loop {
                let scratch_usage = disk_usage_percent(&temp_dir);
                let report = buffer_health(&buffers.all_info(), scratch_usage);
                if let Some((_, new)) = registry.apply("buffer", report) {
                    if new == HealthStatus::Critical {
                        warn!("Scratch storage critical, requesting emergency eviction");
                        let _ = command_tx.send(RecoveryCommand::EmergencyEvict).await;
                    }
                }

                tokio::select! {
                    _ = tokio::time::sleep(BUFFER_PERIOD) => {}
                    _ = shutdown.changed() => if *shutdown.borrow() { break },
                }
            }
        })
    }

    /// Re-issue recovery commands for every component currently in a bad
    /// state. Called by the orchestrator when the aggregate looks degraded.
    pub async fn force_recovery_all(&self) -> usize {
        let summary = self.registry.summary();
        let mut issued = 0usize;
        for (name, snap) in &summary.components {
            if !snap.status.is_bad() {
                continue;
            }
            let cmd = if name == "buffer" {
                RecoveryCommand::EmergencyEvict
            } else if name == "system" {
                // Only RAM pressure is actionable from here.
                let ram_critical = snap
                    .custom_metrics
                    .get("memory_percent")
                    .and_then(Value::as_f64)
                    .map(|v| v >= MEM_CRIT)
                    .unwrap_or(false);
                if !ram_critical {
                    continue;
                }
                RecoveryCommand::EmergencyEvict
            } else if self.captures.contains_key(name) {
                RecoveryCommand::RestartCamera(name.clone())
            } else {
                continue;
            };
            if self.command_tx.send(cmd).await.is_ok() {
                issued += 1;
            }
        }
        if issued > 0 {
            info!(issued, "Forced recovery commands issued");
        }
        issued
    }
}

fn report_metric(report: &HealthReport, key: &str) -> Option<f64> {
    match report {
        HealthReport::Healthy { metrics }
        | HealthReport::Warning { metrics }
        | HealthReport::Critical { metrics, .. } => metrics.get(key).and_then(Value::as_f64),
        HealthReport::Failed { .. } => None,
    }
}

// ──────────────────────────── health probes ──────────────────────────────

/// Host probe: CPU (sampled over a second), RAM, clip-disk usage, thermals.
async fn sample_system_health(sys: &mut System, clips_dir: &Path) -> HealthReport {
    sys.refresh_cpu_usage();
    tokio::time::sleep(CPU_SAMPLE_WINDOW).await;
    sys.refresh_cpu_usage();
    sys.refresh_memory();

    let cpu_percent = sys.global_cpu_info().cpu_usage() as f64;
    let memory_percent = if sys.total_memory() > 0 {
        (sys.used_memory() as f64 / sys.total_memory() as f64) * 100.0
    } else {
        0.0
    };
    let disk_percent = disk_usage_percent(clips_dir);

    let components = Components::new_with_refreshed_list();
    let temps: Vec<(String, f64)> = components
        .iter()
        .map(|c| (c.label().to_string(), c.temperature() as f64))
        .filter(|(_, t)| t.is_finite() && *t > 0.0)
        .collect();

    classify_system(cpu_percent, memory_percent, disk_percent, &temps)
}

/// Threshold logic, separated from the sampling for testability.
fn classify_system(
    cpu_percent: f64,
    memory_percent: f64,
    disk_percent: Option<f64>,
    temps: &[(String, f64)],
) -> HealthReport {
    let mut status = HealthStatus::Healthy;
    let mut metrics = Map::new();
    let mut error = None;

    metrics.insert("cpu_percent".into(), json!(cpu_percent));
    if cpu_percent > CPU_CRIT {
        status = status.worst(HealthStatus::Critical);
        error = Some(format!("CPU at {cpu_percent:.0}%"));
    } else if cpu_percent > CPU_WARN {
        status = status.worst(HealthStatus::Warning);
    }

    metrics.insert("memory_percent".into(), json!(memory_percent));
    if memory_percent > MEM_CRIT {
        status = status.worst(HealthStatus::Critical);
        error = Some(format!("RAM at {memory_percent:.0}%"));
    } else if memory_percent > MEM_WARN {
        status = status.worst(HealthStatus::Warning);
    }

    if let Some(disk) = disk_percent {
        metrics.insert("disk_percent".into(), json!(disk));
        if disk > DISK_CRIT {
            status = status.worst(HealthStatus::Critical);
            error = Some(format!("clip disk at {disk:.0}%"));
        } else if disk > DISK_WARN {
            status = status.worst(HealthStatus::Warning);
        }
    }

    for (label, temp) in temps {
        metrics.insert(format!("temp_{label}"), json!(temp));
        if *temp > TEMP_CRIT {
            status = status.worst(HealthStatus::Critical);
            error = Some(format!("{label} at {temp:.0}°C"));
        } else if *temp > TEMP_WARN {
            status = status.worst(HealthStatus::Warning);
        }
    }

    HealthReport::from_parts(status, metrics, error)
}

/// Map supervisor state onto a health report.
pub fn camera_health(state: &CaptureState) -> HealthReport {
    let mut metrics = Map::new();
    metrics.insert("total_segments".into(), json!(state.total_segments));
    metrics.insert("reconnect_attempts".into(), json!(state.reconnect_attempts));

    if !state.running {
        return HealthReport::Failed { error: "capture is not running".into() };
    }

    let mut status = HealthStatus::Healthy;
    let mut error = None;

    if let Some(age) = state.last_segment_age_seconds() {
        metrics.insert("last_segment_age_seconds".into(), json!(age));
        if age > SEGMENT_AGE_FAILED {
            return HealthReport::Failed {
                error: format!("no segment for {age:.0}s"),
            };
        }
        if age > SEGMENT_AGE_CRIT {
            status = status.worst(HealthStatus::Critical);
            error = Some(format!("no segment for {age:.0}s"));
        } else if age > SEGMENT_AGE_WARN {
            status = status.worst(HealthStatus::Warning);
        }
    }

    if state.reconnect_attempts > RECONNECTS_CRIT {
        status = status.worst(HealthStatus::Critical);
        error = Some(format!("{} reconnect attempts", state.reconnect_attempts));
    } else if state.reconnect_attempts > RECONNECTS_WARN {
        status = status.worst(HealthStatus::Warning);
    }

    HealthReport::from_parts(status, metrics, error)
}

/// Buffer-tier probe: starvation per camera, scratch utilisation overall.
pub fn buffer_health(
    infos: &HashMap<String, BufferInfo>,
    scratch_usage_percent: Option<f64>,
) -> HealthReport {
    let mut status = HealthStatus::Healthy;
    let mut metrics = Map::new();
    let mut error = None;

    let mut total_segments = 0usize;
    let mut total_bytes = 0u64;
    for (camera_id, info) in infos {
        total_segments += info.segments_count;
        total_bytes += info.total_size_bytes;
        metrics.insert(format!("{camera_id}_segments"), json!(info.segments_count));
        metrics.insert(
            format!("{camera_id}_usage_percent"),
            json!(info.buffer_usage_percent),
        );
        if info.buffer_usage_percent < BUFFER_STARVATION_PCT {
            status = status.worst(HealthStatus::Warning);
        }
    }
    metrics.insert("total_segments".into(), json!(total_segments));
    metrics.insert("total_size_bytes".into(), json!(total_bytes));

    if let Some(usage) = scratch_usage_percent {
        metrics.insert("scratch_usage_percent".into(), json!(usage));
        if usage > SCRATCH_CRIT {
            status = status.worst(HealthStatus::Critical);
            error = Some(format!("scratch storage at {usage:.0}%"));
        } else if usage > SCRATCH_WARN {
            status = status.worst(HealthStatus::Warning);
        }
    }

    HealthReport::from_parts(status, metrics, error)
}

/// Used percentage of the filesystem holding `path` (longest mount-point
/// prefix wins). `None` when no mount matches.
pub fn disk_usage_percent(path: &Path) -> Option<f64> {
    let disks = Disks::new_with_refreshed_list();
    let target = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());

    disks
        .iter()
        .filter(|d| target.starts_with(d.mount_point()))
        .max_by_key(|d| d.mount_point().as_os_str().len())
        .map(|d| {
            let total = d.total_space();
            if total == 0 {
                return 0.0;
            }
            let used = total.saturating_sub(d.available_space());
            (used as f64 / total as f64) * 100.0
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::SupervisorPhase;

    fn running_state() -> CaptureState {
        CaptureState {
            camera_id: "camera_1".into(),
            phase: SupervisorPhase::Running,
            running: true,
            child_pid: Some(99),
            started_at: Some(Utc::now()),
            last_segment_at: Some(Utc::now()),
            total_segments: 12,
            reconnect_attempts: 0,
        }
    }

    #[test]
    fn camera_failed_when_not_running() {
        let mut st = running_state();
        st.running = false;
        assert_eq!(camera_health(&st).status(), HealthStatus::Failed);
    }

    #[test]
    fn camera_degrades_with_segment_age() {
        let mut st = running_state();
        st.last_segment_at = Some(Utc::now() - chrono::Duration::seconds(45));
        assert_eq!(camera_health(&st).status(), HealthStatus::Warning);

        st.last_segment_at = Some(Utc::now() - chrono::Duration::seconds(90));
        assert_eq!(camera_health(&st).status(), HealthStatus::Critical);

        st.last_segment_at = Some(Utc::now() - chrono::Duration::seconds(150));
        assert_eq!(camera_health(&st).status(), HealthStatus::Failed);
    }

    #[test]
    fn camera_degrades_with_reconnect_churn() {
        let mut st = running_state();
        st.reconnect_attempts = 6;
        assert_eq!(camera_health(&st).status(), HealthStatus::Warning);
        st.reconnect_attempts = 11;
        assert_eq!(camera_health(&st).status(), HealthStatus::Critical);
    }

    #[test]
    fn camera_healthy_before_first_segment() {
        let mut st = running_state();
        st.last_segment_at = None;
        st.total_segments = 0;
        assert_eq!(camera_health(&st).status(), HealthStatus::Healthy);
    }

    #[test]
    fn system_thresholds() {
        let ok = classify_system(10.0, 40.0, Some(50.0), &[]);
        assert_eq!(ok.status(), HealthStatus::Healthy);

        let hot_cpu = classify_system(75.0, 40.0, Some(50.0), &[]);
        assert_eq!(hot_cpu.status(), HealthStatus::Warning);

        let full_ram = classify_system(10.0, 96.0, Some(50.0), &[]);
        assert_eq!(full_ram.status(), HealthStatus::Critical);

        let cooked = classify_system(10.0, 40.0, None, &[("cpu_thermal".into(), 85.0)]);
        assert_eq!(cooked.status(), HealthStatus::Critical);
    }

    fn buffer_info(usage: f64) -> BufferInfo {
        BufferInfo {
            camera_id: "camera_1".into(),
            segments_count: 3,
            total_duration_seconds: 15,
            total_size_bytes: 3 * 1024 * 1024,
            max_window_seconds: 30,
            chunk_seconds: 5,
            buffer_usage_percent: usage,
            frozen: false,
            oldest_wall_time: None,
            newest_wall_time: None,
            total_segments_added: 3,
            total_segments_evicted: 0,
            total_bytes_processed: 3 * 1024 * 1024,
        }
    }

    #[test]
    fn buffer_starvation_is_warning() {
        let infos = HashMap::from([("camera_1".to_string(), buffer_info(10.0))]);
        assert_eq!(buffer_health(&infos, Some(30.0)).status(), HealthStatus::Warning);
    }

    #[test]
    fn scratch_exhaustion_is_critical() {
        let infos = HashMap::from([("camera_1".to_string(), buffer_info(80.0))]);
        assert_eq!(buffer_health(&infos, Some(95.0)).status(), HealthStatus::Critical);
        assert_eq!(buffer_health(&infos, Some(80.0)).status(), HealthStatus::Warning);
        assert_eq!(buffer_health(&infos, Some(40.0)).status(), HealthStatus::Healthy);
    }

    #[test]
    fn registry_tracks_transitions_and_counters() {
        let registry = HealthRegistry::new();

        let first = registry.apply("camera_1", HealthReport::Healthy { metrics: Map::new() });
        assert!(first.is_none(), "initial healthy report is not a transition");

        let degraded = registry.apply(
            "camera_1",
            HealthReport::Critical { metrics: Map::new(), error: Some("stalled".into()) },
        );
        assert_eq!(degraded, Some((HealthStatus::Healthy, HealthStatus::Critical)));

        // Same status again: no transition, but the error still counts.
        let again = registry.apply(
            "camera_1",
            HealthReport::Critical { metrics: Map::new(), error: Some("stalled".into()) },
        );
        assert!(again.is_none());

        let summary = registry.summary();
        assert_eq!(summary.overall_status, HealthStatus::Critical);
        assert_eq!(summary.summary.critical_components, 1);
        assert_eq!(summary.components["camera_1"].error_count, 2);
    }

    #[test]
    fn summary_aggregates_worst_status() {
        let registry = HealthRegistry::new();
        registry.apply("system", HealthReport::Healthy { metrics: Map::new() });
        registry.apply("camera_1", HealthReport::Warning { metrics: Map::new() });
        registry.apply("camera_2", HealthReport::Failed { error: "gone".into() });

        let summary = registry.summary();
        assert_eq!(summary.overall_status, HealthStatus::Failed);
        assert_eq!(summary.summary.total_components, 3);
        assert_eq!(summary.summary.failed_components, 1);
        assert_eq!(summary.summary.warning_components, 1);
        assert_eq!(summary.summary.healthy_components, 1);
    }
}
