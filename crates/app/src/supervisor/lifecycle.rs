//! The `Supervisor` facade: one state machine over either detector handle.

use std::sync::{Arc, Mutex, Weak};

use anyhow::Result;
use process_monitor::{LifecycleEvent, ProcessMonitor};
use tokio::{runtime::Handle, sync::broadcast, task::JoinHandle};
use tracing::{Instrument, debug, error, info, warn};

use crate::{
    emulator::EmulatorAssets,
    lock,
    supervisor::{
        config::{DeploymentConfig, ProcessConfig, SupervisorSettings},
        handle::{DetectorHandle, SimulationHandle},
        state::{Status, SupervisorState},
    },
};

/// Cloneable facade controlling the detector in real or simulation mode.
#[derive(Clone)]
pub struct Supervisor {
    inner: Arc<Shared>,
}

struct Shared {
    settings: SupervisorSettings,
    /// Runtime that owns every task the supervisor spawns, whichever thread calls in.
    runtime: Handle,
    state: Mutex<SupervisorState>,
    handle: Mutex<Option<DetectorHandle>>,
    video_params: Mutex<Option<Vec<String>>>,
    pending_launch: Mutex<Option<JoinHandle<()>>>,
    event_pump: Mutex<Option<JoinHandle<()>>>,
    /// Held for the whole of `stop` and `restart`.
    teardown: tokio::sync::Mutex<()>,
}

impl Supervisor {
    pub fn new(settings: SupervisorSettings, runtime: Handle) -> Self {
        metrics::gauge!("detector_state").set(SupervisorState::Uninitialized.gauge_value());
        Self {
            inner: Arc::new(Shared {
                settings,
                runtime,
                state: Mutex::new(SupervisorState::Uninitialized),
                handle: Mutex::new(None),
                video_params: Mutex::new(None),
                pending_launch: Mutex::new(None),
                event_pump: Mutex::new(None),
                teardown: tokio::sync::Mutex::new(()),
            }),
        }
    }

    /// Choose the mode and build its handle. The detector is not started.
    pub fn initialize(&self, simulation: bool, video_params: Option<Vec<String>>) -> Result<()> {
        let mode = if simulation { "simulation" } else { "real" };
        let _span = tracing::info_span!("supervisor.initialize", mode).entered();
        let settings = &self.inner.settings;

        if simulation {
            let assets = EmulatorAssets::load(&settings.emulator)?;
            let simulation = SimulationHandle::new(settings.emulator.clone(), assets);
            self.install(DetectorHandle::Simulation(Arc::new(simulation)), video_params);
        } else {
            let deployment = DeploymentConfig::from_path(&settings.config_path)?;
            let process = ProcessConfig::select(&deployment, video_params)?;
            let monitor = ProcessMonitor::new(process.monitor_config(settings.restart)?);
            info!(
                command = %process.command_line().join(" "),
                cwd = %process.working_dir.display(),
                "Detector command configured"
            );
            self.install(DetectorHandle::Real(monitor), Some(process.extra_args));
        }
        Ok(())
    }

    /// Replace the current handle and reset to Idle.
    fn install(&self, handle: DetectorHandle, video_params: Option<Vec<String>>) {
        let previous = *lock(&self.inner.state);
        if matches!(
            previous,
            SupervisorState::Starting | SupervisorState::Started
        ) {
            warn!(
                state = previous.label(),
                "Re-initializing while the detector is still running"
            );
        }
        if let Some(pending) = lock(&self.inner.pending_launch).take() {
            pending.abort();
        }

        let mode = handle.mode();
        let events = handle.subscribe();
        let pump = self
            .inner
            .runtime
            .spawn(pump_events(Arc::downgrade(&self.inner), events));
        if let Some(previous_pump) = lock(&self.inner.event_pump).replace(pump) {
            previous_pump.abort();
        }

        *lock(&self.inner.handle) = Some(handle);
        *lock(&self.inner.video_params) = video_params;
        self.inner.set_state(SupervisorState::Idle);
        info!(mode, "Detector supervisor initialized");
    }

    pub fn status(&self) -> Status {
        lock(&self.inner.state).status()
    }

    pub fn state(&self) -> SupervisorState {
        *lock(&self.inner.state)
    }

    /// Video input arguments the detector was configured with.
    pub fn video_params(&self) -> Option<Vec<String>> {
        lock(&self.inner.video_params).clone()
    }

    /// Launch the detector. A no-op while it is already starting or started.
    pub fn start(&self) {
        let _span = tracing::info_span!("supervisor.start").entered();
        {
            let mut state = lock(&self.inner.state);
            match *state {
                SupervisorState::Uninitialized => {
                    warn!("Start requested before initialization; ignoring");
                    return;
                }
                SupervisorState::Starting | SupervisorState::Started => {
                    info!(state = state.label(), "Detector already started");
                    return;
                }
                SupervisorState::Idle => {
                    *state = SupervisorState::Starting;
                    metrics::gauge!("detector_state").set(state.gauge_value());
                }
            }
        }

        let Some(handle) = self.handle() else {
            return;
        };
        match handle {
            DetectorHandle::Real(monitor) => {
                let _runtime = self.inner.runtime.enter();
                if let Err(err) = monitor.start() {
                    error!("Failed to start detector: {err}");
                    self.inner.set_state(SupervisorState::Idle);
                }
            }
            DetectorHandle::Simulation(simulation) => self.schedule_launch(simulation),
        }
    }

    /// Stop the detector and resolve once teardown is confirmed.
    ///
    /// Concurrent `stop`/`restart` calls run one after another.
    pub async fn stop(&self) {
        let span = tracing::info_span!("supervisor.stop");
        async {
            let _teardown = self.inner.teardown.lock().await;
            self.stop_exclusive().await;
        }
        .instrument(span)
        .await
    }

    /// Stop then start again.
    pub async fn restart(&self) {
        let span = tracing::info_span!("supervisor.restart");
        async {
            let _teardown = self.inner.teardown.lock().await;
            match self.handle() {
                Some(DetectorHandle::Real(_)) => {
                    self.stop_exclusive().await;
                    self.start();
                }
                Some(DetectorHandle::Simulation(simulation)) => {
                    self.cancel_pending_launch().await;
                    simulation.kill_now();
                    self.inner.set_state(SupervisorState::Starting);
                    self.schedule_launch(simulation);
                }
                None => warn!("Restart requested before initialization; ignoring"),
            }
        }
        .instrument(span)
        .await
    }

    /// Body of `stop`; the caller holds the teardown lock.
    async fn stop_exclusive(&self) {
        let Some(handle) = self.handle() else {
            debug!("Stop requested before initialization; ignoring");
            return;
        };
        match handle {
            DetectorHandle::Simulation(simulation) => {
                self.cancel_pending_launch().await;
                if simulation.kill().await {
                    info!("Stream emulator stopped");
                }
                self.inner.set_state(SupervisorState::Idle);
            }
            DetectorHandle::Real(monitor) => {
                if self.state() != SupervisorState::Started {
                    debug!("Detector not started; nothing to stop");
                    return;
                }
                let mut events = monitor.subscribe();
                if monitor.stop().await {
                    wait_for_stop(&mut events).await;
                }
                self.inner.set_state(SupervisorState::Idle);
                info!("Detector stopped");
            }
        }
    }

    /// Detector launches since initialization.
    pub fn launches(&self) -> u64 {
        match self.handle() {
            Some(DetectorHandle::Real(monitor)) => monitor.launches(),
            Some(DetectorHandle::Simulation(simulation)) => simulation.launches(),
            None => 0,
        }
    }

    /// Bound `(image, metadata)` emulator addresses while simulation is running.
    #[cfg(test)]
    pub fn emulator_addresses(&self) -> Option<(std::net::SocketAddr, std::net::SocketAddr)> {
        match self.handle() {
            Some(DetectorHandle::Simulation(simulation)) => simulation.addresses(),
            _ => None,
        }
    }

    fn handle(&self) -> Option<DetectorHandle> {
        lock(&self.inner.handle).clone()
    }

    fn schedule_launch(&self, simulation: Arc<SimulationHandle>) {
        let delay = simulation.settings().startup_delay;
        let shared = Arc::downgrade(&self.inner);
        info!(delay_ms = delay.as_millis() as u64, "Scheduling stream emulator launch");
        let task = self.inner.runtime.spawn(
            async move {
                tokio::time::sleep(delay).await;
                if let Err(err) = simulation.launch().await {
                    error!("Failed to launch stream emulator: {err:#}");
                    if let Some(shared) = shared.upgrade() {
                        shared.set_state(SupervisorState::Idle);
                    }
                }
            }
            .instrument(tracing::info_span!("emulator.launch")),
        );
        if let Some(previous) = lock(&self.inner.pending_launch).replace(task) {
            previous.abort();
        }
    }

    /// Abort a delayed launch and wait for it, so a launch that was mid-bind
    /// has either installed its listeners or dropped them before teardown.
    async fn cancel_pending_launch(&self) {
        let Some(pending) = lock(&self.inner.pending_launch).take() else {
            return;
        };
        if !pending.is_finished() {
            debug!("Cancelling pending stream emulator launch");
        }
        pending.abort();
        let _ = pending.await;
    }
}

impl Shared {
    fn set_state(&self, next: SupervisorState) {
        let mut state = lock(&self.state);
        if *state != next {
            debug!(from = state.label(), to = next.label(), "Supervisor state change");
        }
        *state = next;
        metrics::gauge!("detector_state").set(next.gauge_value());
    }

    /// Apply `next` only when the current state is `from`.
    fn transition(&self, from: SupervisorState, next: SupervisorState) -> bool {
        let mut state = lock(&self.state);
        if *state != from {
            return false;
        }
        debug!(from = from.label(), to = next.label(), "Supervisor state change");
        *state = next;
        metrics::gauge!("detector_state").set(next.gauge_value());
        true
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        if let Some(pending) = lock(&self.pending_launch).take() {
            pending.abort();
        }
        if let Some(pump) = lock(&self.event_pump).take() {
            pump.abort();
        }
    }
}

/// Map lifecycle events onto the supervisor state until the handle goes away.
async fn pump_events(shared: Weak<Shared>, mut events: broadcast::Receiver<LifecycleEvent>) {
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "Lifecycle event pump lagged");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };
        let Some(shared) = shared.upgrade() else {
            break;
        };

        match event {
            LifecycleEvent::Start { pid } => {
                if shared.transition(SupervisorState::Starting, SupervisorState::Started) {
                    info!(?pid, "Detector started");
                }
            }
            LifecycleEvent::Restart { pid, attempt } => {
                metrics::counter!("detector_restarts_total").increment(1);
                warn!(?pid, attempt, "Detector restarted");
                shared.transition(SupervisorState::Starting, SupervisorState::Started);
            }
            LifecycleEvent::Error { message } => error!("Detector error: {message}"),
            LifecycleEvent::Exit { code } => info!(?code, "Detector exited"),
            LifecycleEvent::Stop => {
                if shared.transition(SupervisorState::Started, SupervisorState::Idle) {
                    info!("Detector stopped");
                }
            }
            LifecycleEvent::GaveUp { restarts } => {
                error!(restarts, "Detector gave up after repeated failures");
                shared.set_state(SupervisorState::Idle);
            }
        }
    }
}

async fn wait_for_stop(events: &mut broadcast::Receiver<LifecycleEvent>) {
    loop {
        match events.recv().await {
            Ok(LifecycleEvent::Stop) | Err(broadcast::error::RecvError::Closed) => return,
            Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
        }
    }
}
