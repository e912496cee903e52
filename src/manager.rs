// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! Orchestrator: wires buffers, supervisors, watchers, the clip composer,
//! the trigger front-ends and the resilience monitor together, then runs
//! the top-level loop until shutdown.
//!
//! Control flow is message-passing: the monitor emits
//! [`RecoveryCommand`]s which this loop applies to the owning component.
//! Shutdown is cooperative — a watch flag every task observes at its next
//! suspension point, with bounded joins afterwards.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::buffer::BufferManager;
use crate::capture::CaptureSupervisor;
use crate::clip::ClipComposer;
use crate::config::{Config, TriggerMode};
use crate::error::Result;
use crate::monitor::{HealthRegistry, RecoveryCommand, ResilienceMonitor};
use crate::trigger::{ApiState, TriggerSystem};
use crate::watcher::SegmentWatcher;

/// Cadence of the top-level degradation check.
const HEALTH_POLL_INTERVAL: Duration = Duration::from_secs(30);
/// Bounded wait per task at shutdown; stragglers are abandoned.
const JOIN_TIMEOUT: Duration = Duration::from_secs(5);
/// Pause after starting captures so the first segments land before the
/// trigger surfaces accept requests.
const CAPTURE_SETTLE: Duration = Duration::from_secs(5);
/// Finished clips older than this are swept at startup.
const CLIP_RETENTION_DAYS: u64 = 30;

pub struct Orchestrator {
    config: Arc<Config>,
    buffers: Arc<BufferManager>,
    composer: Arc<ClipComposer>,
    supervisors: HashMap<String, Arc<CaptureSupervisor>>,
    monitor: ResilienceMonitor,
    command_rx: Option<mpsc::Receiver<RecoveryCommand>>,
    triggers: Arc<TriggerSystem>,
    registry: Arc<HealthRegistry>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    quit_tx: mpsc::Sender<()>,
    quit_rx: Option<mpsc::Receiver<()>>,
    handles: Vec<(String, JoinHandle<()>)>,
}

impl Orchestrator {
    /// Build the full component graph from a validated config. Nothing is
    /// spawned yet; `run` does that.
    pub fn new(config: Config) -> Result<Self> {
        config.ensure_directories()?;
        let config = Arc::new(config);

        let buffers = Arc::new(BufferManager::new(&config));
        let recovered = buffers.recover_all();
        if recovered > 0 {
            info!(recovered, "Pre-existing segments recovered into buffers");
        }

        let supervisors: HashMap<String, Arc<CaptureSupervisor>> = config
            .cameras
            .iter()
            .map(|cam| {
                (cam.id.clone(), CaptureSupervisor::new(cam.clone(), config.clone()))
            })
            .collect();

        let captures = supervisors
            .iter()
            .map(|(id, sup)| (id.clone(), sup.state_handle()))
            .collect::<HashMap<_, _>>();

        let (monitor, command_rx) =
            ResilienceMonitor::new(config.clone(), buffers.clone(), captures);
        let registry = monitor.registry();

        let composer = Arc::new(ClipComposer::new(config.clone(), buffers.clone()));
        let triggers = Arc::new(TriggerSystem::new(config.clone(), composer.clone()));

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (quit_tx, quit_rx) = mpsc::channel(1);

        Ok(Orchestrator {
            config,
            buffers,
            composer,
            supervisors,
            monitor,
            command_rx: Some(command_rx),
            triggers,
            registry,
            shutdown_tx,
            shutdown_rx,
            quit_tx,
            quit_rx: Some(quit_rx),
            handles: Vec::new(),
        })
    }

    /// Start every component, then run the supervision loop until Ctrl+C,
    /// a keyboard quit, or a fatal error.
    pub async fn run(&mut self) -> Result<()> {
        self.composer.cleanup_old_clips(CLIP_RETENTION_DAYS);

        // Monitors first, so degradation during startup is visible.
        for handle in self.monitor.spawn_all(self.shutdown_rx.clone()) {
            self.handles.push(("monitor".into(), handle));
        }

        // One supervisor + one watcher per camera.
        let supervisors: Vec<(String, Arc<CaptureSupervisor>)> = self
            .supervisors
            .iter()
            .map(|(id, sup)| (id.clone(), sup.clone()))
            .collect();
        for (camera_id, supervisor) in supervisors {
            let cam = self
                .config
                .camera(&camera_id)
                .expect("supervisor exists only for configured cameras")
                .clone();
            let buffer = self
                .buffers
                .get(&camera_id)
                .expect("buffer exists for every configured camera");

            let sup_handle =
                tokio::spawn(supervisor.clone().run(self.shutdown_rx.clone()));
            self.handles.push((format!("supervisor:{camera_id}"), sup_handle));

            let watcher = SegmentWatcher::new(&cam, buffer, supervisor.state_handle());
            let watch_handle = tokio::spawn(watcher.run(self.shutdown_rx.clone()));
            self.handles.push((format!("watcher:{camera_id}"), watch_handle));
        }

        let worker = self.triggers.spawn_worker(self.shutdown_rx.clone());
        self.handles.push(("clip-worker".into(), worker));

        tokio::time::sleep(CAPTURE_SETTLE).await;

        match self.config.trigger_mode {
            TriggerMode::Keyboard => {
                let kb = self
                    .triggers
                    .spawn_keyboard(self.quit_tx.clone(), self.shutdown_rx.clone());
                self.handles.push(("keyboard".into(), kb));
            }
            TriggerMode::Http => {
                let state = Arc::new(ApiState {
                    config: self.config.clone(),
                    triggers: self.triggers.clone(),
                    registry: self.registry.clone(),
                    buffers: self.buffers.clone(),
                    captures: self
                        .supervisors
                        .iter()
                        .map(|(id, s)| (id.clone(), s.state_handle()))
                        .collect(),
                    composer: self.composer.clone(),
                });
                let http = self.triggers.spawn_http(state, self.shutdown_rx.clone());
                self.handles.push(("http".into(), http));

                // Local keyboard control stays available in HTTP mode.
                let kb = self
                    .triggers
                    .spawn_keyboard(self.quit_tx.clone(), self.shutdown_rx.clone());
                self.handles.push(("keyboard".into(), kb));
            }
        }

        self.log_startup_banner();

        let mut command_rx = self.command_rx.take().expect("run called twice");
        let mut quit_rx = self.quit_rx.take().expect("run called twice");

        let mut health_tick = tokio::time::interval(HEALTH_POLL_INTERVAL);
        health_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        health_tick.tick().await; // immediate first tick

        loop {
            tokio::select! {
                signal = tokio::signal::ctrl_c() => {
                    match signal {
                        Ok(()) => info!("Ctrl+C received, shutting down"),
                        Err(e) => error!(error = %e, "Signal handler error"),
                    }
                    break;
                }
                Some(()) = quit_rx.recv() => {
                    info!("Shutdown requested via keyboard");
                    break;
                }
                Some(cmd) = command_rx.recv() => {
                    self.apply_recovery(cmd);
                }
                _ = health_tick.tick() => {
                    self.check_degradation().await;
                }
            }
        }

        self.shutdown().await;
        Ok(())
    }

    fn apply_recovery(&self, cmd: RecoveryCommand) {
        match cmd {
            RecoveryCommand::RestartCamera(camera_id) => {
                match self.supervisors.get(&camera_id) {
                    Some(supervisor) => {
                        info!(camera = camera_id, "Applying recovery: restart capture");
                        supervisor.request_restart();
                        self.registry.record_recovery_action();
                    }
                    None => warn!(camera = camera_id, "Recovery for unknown camera ignored"),
                }
            }
            RecoveryCommand::EmergencyEvict => {
                let dropped = self.buffers.emergency_evict_all();
                info!(dropped, "Applying recovery: emergency eviction");
                self.registry.record_recovery_action();
            }
        }
    }

    /// Aggregate health; on failed components, push recovery for everything
    /// currently in a bad state.
    async fn check_degradation(&self) {
        let summary = self.registry.summary();
        let failed = summary.summary.failed_components;
        let critical = summary.summary.critical_components;

        if failed > 0 || critical > 1 {
            warn!(
                failed,
                critical,
                total = summary.summary.total_components,
                "System degraded"
            );
            if failed > 0 {
                self.monitor.force_recovery_all().await;
            }
        }
    }

    fn log_startup_banner(&self) {
        for cam in &self.config.cameras {
            let state = self
                .supervisors
                .get(&cam.id)
                .map(|s| s.info());
            info!(
                camera = cam.id,
                url = cam.url,
                running = state.as_ref().map(|s| s.running).unwrap_or(false),
                scratch = %cam.scratch_dir.display(),
                "Camera registered"
            );
        }
        let buffered: usize = self
            .buffers
            .all()
            .map(|b| b.info().segments_count)
            .sum();
        info!(
            cameras = self.config.cameras.len(),
            buffered_segments = buffered,
            chunk_seconds = self.config.chunk_seconds,
            window_seconds = self.config.buffer_seconds,
            clip_seconds = self.config.clip_seconds,
            trigger_mode = ?self.config.trigger_mode,
            scratch = %self.config.temp_dir.display(),
            clips = %self.config.clips_dir.display(),
            "System started"
        );
    }

    /// Cooperative shutdown: flip the flag, join every task with a bounded
    /// wait, abandon stragglers, log final statistics.
    async fn shutdown(&mut self) {
        info!("Shutdown started");
        let _ = self.shutdown_tx.send(true);

        for (name, handle) in self.handles.drain(..) {
            match tokio::time::timeout(JOIN_TIMEOUT, handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) if e.is_panic() => {
                    error!(task = name, "Task panicked during shutdown");
                }
                Ok(Err(_)) => {}
                Err(_) => {
                    warn!(task = name, "Task did not stop in time, abandoning");
                }
            }
        }

        let stats = self.composer.stats();
        info!(
            clips_generated = stats.clips_generated,
            total_processing_seconds = stats.total_processing_seconds,
            "Final statistics"
        );
        info!("Shutdown completed");
    }
}
