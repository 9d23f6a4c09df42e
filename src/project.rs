//! Running simulation project
//!
//! Owns the device simulators launched for one project: their join handles,
//! the shared cancellation token and the project's log hub. Stopping cancels
//! every simulator, waits for all of them to drain and collects (but never
//! propagates) task failures.

use crate::log_stream::LogHub;
use crate::simulator::{DeviceHandle, DeviceSimulator};
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// A project whose simulators are currently running
pub struct SimulationProject {
    pub project_id: String,
    handles: Vec<Arc<DeviceHandle>>,
    tasks: tokio::sync::Mutex<Vec<JoinHandle<()>>>,
    token: CancellationToken,
    started_at: DateTime<Utc>,
    running: AtomicBool,
    hub: Arc<LogHub>,
}

impl SimulationProject {
    /// Launch every simulator as an independent task
    pub fn start(
        project_id: String,
        simulators: Vec<DeviceSimulator>,
        hub: Arc<LogHub>,
    ) -> Arc<Self> {
        let token = CancellationToken::new();
        let handles: Vec<_> = simulators.iter().map(|s| s.handle()).collect();
        let tasks: Vec<_> = simulators
            .into_iter()
            .map(|simulator| {
                let child = token.child_token();
                tokio::spawn(simulator.run(child))
            })
            .collect();

        info!(
            "Project {} started with {} device simulators",
            project_id,
            handles.len()
        );

        Arc::new(Self {
            project_id,
            handles,
            tasks: tokio::sync::Mutex::new(tasks),
            token,
            started_at: Utc::now(),
            running: AtomicBool::new(true),
            hub,
        })
    }

    /// Cancel all simulators and wait for them to finish
    pub async fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.token.cancel();

        let tasks = std::mem::take(&mut *self.tasks.lock().await);
        for task in tasks {
            if let Err(e) = task.await {
                warn!("Simulator task for project {} ended abnormally: {}", self.project_id, e);
            }
        }

        info!("Project {} stopped", self.project_id);
    }

    pub fn hub(&self) -> Arc<LogHub> {
        self.hub.clone()
    }

    pub fn device_handles(&self) -> &[Arc<DeviceHandle>] {
        &self.handles
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn active_devices(&self) -> usize {
        self.handles.iter().filter(|h| h.is_running()).count()
    }

    pub fn total_messages_sent(&self) -> u64 {
        self.handles.iter().map(|h| h.stats().messages_sent).sum()
    }
}
