//! Encoder supervision — one external ffmpeg child per camera.
//!
//! The child pulls the RTSP stream and writes fixed-duration MP4 segments
//! into the camera's scratch directory, named by UTC strftime so arrivals
//! sort by wall time. The supervisor keeps the child alive: it polls for
//! exit every 2 s, restarts with bounded exponential back-off on unexpected
//! death, and gives up into a terminal `Failed` state once a finite attempt
//! limit is exceeded. On Unix the whole process group is signalled so the
//! encoder cannot leave orphans behind.

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tokio::sync::{watch, Notify};
use tracing::{error, info, warn};

use crate::config::{CameraConfig, Config, ReconnectConfig};
use crate::error::{ReplayError, Result};

/// How often the supervisor polls the child for exit. Kept short so `stop`
/// stays responsive.
const CHILD_POLL_INTERVAL: Duration = Duration::from_secs(2);
/// Grace window between group-TERM and group-KILL.
const STOP_GRACE: Duration = Duration::from_secs(5);
/// Fixed pause between an externally requested stop and the restart.
const RESTART_DELAY: Duration = Duration::from_secs(2);
/// Bytes of encoder stderr retained for failure logs.
const STDERR_TAIL_BYTES: usize = 500;

/// Supervisor lifecycle. `Failed` is terminal and not self-healing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SupervisorPhase {
    Idle,
    Starting,
    Running,
    Degraded,
    Stopping,
    Stopped,
    Failed,
}

/// Shared per-camera supervisor state, read by the monitor and the status
/// surfaces, written by the supervisor and the watcher.
#[derive(Debug, Clone, Serialize)]
pub struct CaptureState {
    pub camera_id: String,
    pub phase: SupervisorPhase,
    pub running: bool,
    pub child_pid: Option<u32>,
    pub started_at: Option<DateTime<Utc>>,
    pub last_segment_at: Option<DateTime<Utc>>,
    pub total_segments: u64,
    pub reconnect_attempts: u32,
}

impl CaptureState {
    fn new(camera_id: &str) -> Self {
        CaptureState {
            camera_id: camera_id.to_string(),
            phase: SupervisorPhase::Idle,
            running: false,
            child_pid: None,
            started_at: None,
            last_segment_at: None,
            total_segments: 0,
            reconnect_attempts: 0,
        }
    }

    /// Record a fresh segment observation. Any new segment after a restart
    /// proves the encoder recovered, so the attempt counter resets.
    pub fn record_segment(&mut self) {
        self.last_segment_at = Some(Utc::now());
        self.total_segments += 1;
        self.reconnect_attempts = 0;
        if self.phase == SupervisorPhase::Degraded {
            self.phase = SupervisorPhase::Running;
        }
    }

    /// Seconds since the last observed segment, if any.
    pub fn last_segment_age_seconds(&self) -> Option<f64> {
        self.last_segment_at
            .map(|t| (Utc::now() - t).num_milliseconds() as f64 / 1000.0)
    }
}

enum ExitReason {
    Shutdown,
    RestartRequested,
    ChildExited(Option<i32>),
}

enum BackoffOutcome {
    /// Delay elapsed, try again.
    Retry,
    /// Shutdown arrived mid-delay.
    ShuttingDown,
    /// Attempt limit exceeded — terminal.
    Exhausted,
}

/// Owns exactly one encoder child for one camera.
pub struct CaptureSupervisor {
    camera: CameraConfig,
    config: Arc<Config>,
    state: Arc<Mutex<CaptureState>>,
    restart_requested: Notify,
    stderr_tail: Arc<Mutex<Vec<u8>>>,
}

impl CaptureSupervisor {
    pub fn new(camera: CameraConfig, config: Arc<Config>) -> Arc<Self> {
        let state = Arc::new(Mutex::new(CaptureState::new(&camera.id)));
        Arc::new(CaptureSupervisor {
            camera,
            config,
            state,
            restart_requested: Notify::new(),
            stderr_tail: Arc::new(Mutex::new(Vec::new())),
        })
    }

    pub fn camera_id(&self) -> &str {
        &self.camera.id
    }

    /// Shared state handle for the watcher and the monitor.
    pub fn state_handle(&self) -> Arc<Mutex<CaptureState>> {
        self.state.clone()
    }

    pub fn info(&self) -> CaptureState {
        self.state.lock().clone()
    }

    /// Ask the supervise loop to stop-and-respawn the child. The reconnect
    /// counter is preserved across externally requested restarts.
    pub fn request_restart(&self) {
        info!(camera = self.camera.id, "Restart requested");
        self.restart_requested.notify_one();
    }

    /// Supervise loop: spawn → watch → back off → respawn, until shutdown
    /// or terminal failure.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!(camera = self.camera.id, url = self.camera.url, "Capture supervisor started");

        loop {
            if *shutdown.borrow() {
                break;
            }

            self.set_phase(SupervisorPhase::Starting);
            match self.spawn_encoder() {
                Ok(mut child) => {
                    {
                        let mut st = self.state.lock();
                        st.phase = SupervisorPhase::Running;
                        st.running = true;
                        st.child_pid = child.id();
                        st.started_at = Some(Utc::now());
                    }
                    info!(camera = self.camera.id, pid = ?child.id(), "Encoder running");

                    match self.watch_child(&mut child, &mut shutdown).await {
                        ExitReason::Shutdown => {
                            self.set_phase(SupervisorPhase::Stopping);
                            self.terminate_child(&mut child).await;
                            break;
                        }
                        ExitReason::RestartRequested => {
                            self.set_phase(SupervisorPhase::Stopping);
                            self.terminate_child(&mut child).await;
                            self.mark_not_running();
                            tokio::time::sleep(RESTART_DELAY).await;
                            continue;
                        }
                        ExitReason::ChildExited(code) => {
                            let tail = self.take_stderr_tail();
                            error!(
                                camera = self.camera.id,
                                exit_code = ?code,
                                stderr_tail = %tail,
                                "Encoder exited unexpectedly"
                            );
                            self.mark_not_running();
                            match self.backoff_or_fail(&mut shutdown).await {
                                BackoffOutcome::Retry => continue,
                                BackoffOutcome::ShuttingDown => break,
                                BackoffOutcome::Exhausted => return,
                            }
                        }
                    }
                }
                Err(e) => {
                    error!(camera = self.camera.id, error = %e, "Failed to spawn encoder");
                    self.mark_not_running();
                    match self.backoff_or_fail(&mut shutdown).await {
                        BackoffOutcome::Retry => continue,
                        BackoffOutcome::ShuttingDown => break,
                        BackoffOutcome::Exhausted => return,
                    }
                }
            }
        }

        self.mark_not_running();
        self.set_phase(SupervisorPhase::Stopped);
        info!(
            camera = self.camera.id,
            total_segments = self.state.lock().total_segments,
            "Capture supervisor stopped"
        );
    }

    fn set_phase(&self, phase: SupervisorPhase) {
        self.state.lock().phase = phase;
    }

    fn mark_not_running(&self) {
        let mut st = self.state.lock();
        st.running = false;
        st.child_pid = None;
    }

    fn spawn_encoder(&self) -> Result<Child> {
        let args = encoder_args(&self.camera, &self.config);
        let mut cmd = Command::new("ffmpeg");
        cmd.args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd.spawn().map_err(|e| ReplayError::Capture {
            id: self.camera.id.clone(),
            reason: format!("spawn ffmpeg: {e}"),
        })?;

        // Drain stderr into a bounded tail. Never parsed, only logged.
        if let Some(mut stderr) = child.stderr.take() {
            let tail = self.stderr_tail.clone();
            tail.lock().clear();
            tokio::spawn(async move {
                let mut buf = [0u8; 1024];
                loop {
                    match stderr.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            let mut t = tail.lock();
                            t.extend_from_slice(&buf[..n]);
                            let excess = t.len().saturating_sub(STDERR_TAIL_BYTES);
                            if excess > 0 {
                                t.drain(..excess);
                            }
                        }
                    }
                }
            });
        }

        Ok(child)
    }

    fn take_stderr_tail(&self) -> String {
        let tail = std::mem::take(&mut *self.stderr_tail.lock());
        String::from_utf8_lossy(&tail).into_owned()
    }

    async fn watch_child(
        &self,
        child: &mut Child,
        shutdown: &mut watch::Receiver<bool>,
    ) -> ExitReason {
        let mut tick = tokio::time::interval(CHILD_POLL_INTERVAL);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = tick.tick() => {
                    match child.try_wait() {
                        Ok(Some(status)) => return ExitReason::ChildExited(status.code()),
                        Ok(None) => {}
                        Err(e) => {
                            warn!(camera = self.camera.id, error = %e, "try_wait on encoder failed");
                            return ExitReason::ChildExited(None);
                        }
                    }
                }
                _ = self.restart_requested.notified() => return ExitReason::RestartRequested,
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return ExitReason::Shutdown;
                    }
                }
            }
        }
    }

    /// Graceful stop: TERM the process group, wait out the grace window,
    /// then KILL. The child is reaped before returning.
    async fn terminate_child(&self, child: &mut Child) {
        #[cfg(unix)]
        signal_group(child, nix::sys::signal::Signal::SIGTERM);
        #[cfg(not(unix))]
        {
            let _ = child.start_kill();
        }

        match tokio::time::timeout(STOP_GRACE, child.wait()).await {
            Ok(_) => {}
            Err(_) => {
                warn!(camera = self.camera.id, "Encoder ignored TERM, killing");
                #[cfg(unix)]
                signal_group(child, nix::sys::signal::Signal::SIGKILL);
                let _ = child.start_kill();
                let _ = child.wait().await;
            }
        }
    }

    /// Bump the attempt counter and sleep out the back-off delay. Once a
    /// finite attempt limit is exceeded the supervisor parks in `Failed`
    /// and stops trying.
    async fn backoff_or_fail(&self, shutdown: &mut watch::Receiver<bool>) -> BackoffOutcome {
        let attempts = {
            let mut st = self.state.lock();
            st.reconnect_attempts += 1;
            st.phase = SupervisorPhase::Degraded;
            st.reconnect_attempts
        };

        let policy = &self.config.reconnect;
        if policy.max_attempts > 0 && attempts > policy.max_attempts {
            error!(
                camera = self.camera.id,
                attempts,
                max_attempts = policy.max_attempts,
                "Reconnect attempts exhausted, giving up"
            );
            self.set_phase(SupervisorPhase::Failed);
            self.mark_not_running();
            return BackoffOutcome::Exhausted;
        }

        let delay = backoff_delay(attempts, policy);
        warn!(
            camera = self.camera.id,
            attempt = attempts,
            delay_secs = delay.as_secs(),
            "Encoder reconnect scheduled"
        );

        tokio::select! {
            _ = tokio::time::sleep(delay) => BackoffOutcome::Retry,
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    BackoffOutcome::ShuttingDown
                } else {
                    BackoffOutcome::Retry
                }
            }
        }
    }
}

/// Exponential back-off: `min(initial · 2^(attempts−1), max)`.
pub fn backoff_delay(attempts: u32, policy: &ReconnectConfig) -> Duration {
    let shift = attempts.saturating_sub(1).min(32);
    let factor = 2u64.saturating_pow(shift);
    let secs = policy.initial_delay.as_secs().saturating_mul(factor);
    Duration::from_secs(secs.min(policy.max_delay.as_secs()))
}

/// Build the encoder invocation: RTSP in, H.264/AAC re-encode, wall-clock
/// aligned segmenting out. Segment cuts land on forced keyframes, which is
/// what makes the fast-copy clip path possible.
pub fn encoder_args(camera: &CameraConfig, config: &Config) -> Vec<String> {
    let gop = config.encoder.keyframe_interval * 30; // nominal 30 fps
    let pattern = camera
        .scratch_dir
        .join(format!("{}_%Y%m%d_%H%M%S.mp4", camera.id));

    let mut args: Vec<String> = vec![
        "-y".into(),
        "-loglevel".into(),
        "warning".into(),
        "-rtsp_transport".into(),
        config.rtsp_transport.clone(),
        "-i".into(),
        camera.url.clone(),
        "-c:v".into(),
        "libx264".into(),
        "-preset".into(),
        config.encoder.preset.clone(),
        "-crf".into(),
        config.encoder.crf.to_string(),
        "-g".into(),
        gop.to_string(),
        "-keyint_min".into(),
        gop.to_string(),
        "-force_key_frames".into(),
        format!("expr:gte(t,n_forced*{})", config.encoder.keyframe_interval),
        "-c:a".into(),
        "aac".into(),
        "-b:a".into(),
        "128k".into(),
        "-f".into(),
        "segment".into(),
        "-segment_time".into(),
        config.chunk_seconds.to_string(),
        "-segment_format".into(),
        "mp4".into(),
        "-segment_atclocktime".into(),
        "1".into(),
        "-strftime".into(),
        "1".into(),
    ];
    args.push(pattern.to_string_lossy().into_owned());
    args
}

#[cfg(unix)]
fn signal_group(child: &Child, sig: nix::sys::signal::Signal) {
    use nix::sys::signal::killpg;
    use nix::unistd::Pid;
    if let Some(pid) = child.id() {
        // The child was spawned as its own group leader, so pgid == pid.
        if let Err(e) = killpg(Pid::from_raw(pid as i32), sig) {
            warn!(pid, signal = %sig, error = %e, "killpg failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::lookup_from_map;
    use std::collections::HashMap;

    fn test_config() -> Config {
        let env = HashMap::from([
            ("CAMERA_1_URL".to_string(), "rtsp://10.0.0.10/stream".to_string()),
            ("TEMP_DIR".to_string(), "/tmp/vbuf-test".to_string()),
        ]);
        Config::from_lookup(&lookup_from_map(env)).expect("config")
    }

    #[test]
    fn encoder_args_shape() {
        let cfg = test_config();
        let cam = cfg.cameras[0].clone();
        let args = encoder_args(&cam, &cfg);

        let find = |flag: &str| -> &str {
            let i = args.iter().position(|a| a == flag).expect(flag);
            &args[i + 1]
        };

        assert_eq!(find("-rtsp_transport"), "tcp");
        assert_eq!(find("-i"), "rtsp://10.0.0.10/stream");
        assert_eq!(find("-c:v"), "libx264");
        assert_eq!(find("-preset"), "ultrafast");
        assert_eq!(find("-crf"), "23");
        // 1 s keyframe interval at nominal 30 fps.
        assert_eq!(find("-g"), "30");
        assert_eq!(find("-keyint_min"), "30");
        assert_eq!(find("-force_key_frames"), "expr:gte(t,n_forced*1)");
        assert_eq!(find("-segment_time"), "5");
        assert_eq!(find("-segment_atclocktime"), "1");
        assert_eq!(find("-strftime"), "1");

        let pattern = args.last().unwrap();
        assert!(pattern.ends_with("camera_1_%Y%m%d_%H%M%S.mp4"));
        assert!(pattern.contains("camera_1"));
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = ReconnectConfig {
            initial_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(30),
            max_attempts: 0,
        };
        assert_eq!(backoff_delay(1, &policy), Duration::from_secs(2));
        assert_eq!(backoff_delay(2, &policy), Duration::from_secs(4));
        assert_eq!(backoff_delay(3, &policy), Duration::from_secs(8));
        assert_eq!(backoff_delay(4, &policy), Duration::from_secs(16));
        assert_eq!(backoff_delay(5, &policy), Duration::from_secs(30));
        assert_eq!(backoff_delay(40, &policy), Duration::from_secs(30));
    }

    #[test]
    fn record_segment_resets_attempts() {
        let mut st = CaptureState::new("camera_1");
        st.reconnect_attempts = 4;
        st.phase = SupervisorPhase::Degraded;
        st.record_segment();
        assert_eq!(st.reconnect_attempts, 0);
        assert_eq!(st.total_segments, 1);
        assert_eq!(st.phase, SupervisorPhase::Running);
        assert!(st.last_segment_at.is_some());
    }
}
