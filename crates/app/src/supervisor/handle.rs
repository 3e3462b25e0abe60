use std::sync::{
    Arc, Mutex,
    atomic::{AtomicU64, Ordering},
};

use anyhow::Result;
use process_monitor::{LifecycleEvent, ProcessMonitor};
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::{
    emulator::{EmulatorAssets, EmulatorCore, EmulatorServers, spawn_emulator_servers},
    lock,
    supervisor::EmulatorSettings,
};

const EVENT_CAPACITY: usize = 16;

/// What the supervisor drives: the real detector or the stream emulator.
#[derive(Clone)]
pub(crate) enum DetectorHandle {
    Real(ProcessMonitor),
    Simulation(Arc<SimulationHandle>),
}

impl DetectorHandle {
    pub(crate) fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        match self {
            DetectorHandle::Real(monitor) => monitor.subscribe(),
            DetectorHandle::Simulation(simulation) => simulation.events.subscribe(),
        }
    }

    pub(crate) fn mode(&self) -> &'static str {
        match self {
            DetectorHandle::Real(_) => "real",
            DetectorHandle::Simulation(_) => "simulation",
        }
    }
}

/// Emulator lifecycle with the same event vocabulary as the process monitor.
pub(crate) struct SimulationHandle {
    settings: EmulatorSettings,
    assets: Arc<EmulatorAssets>,
    servers: Mutex<Option<EmulatorServers>>,
    events: broadcast::Sender<LifecycleEvent>,
    launches: AtomicU64,
}

impl SimulationHandle {
    pub(crate) fn new(settings: EmulatorSettings, assets: EmulatorAssets) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            settings,
            assets: Arc::new(assets),
            servers: Mutex::new(None),
            events,
            launches: AtomicU64::new(0),
        }
    }

    pub(crate) fn settings(&self) -> &EmulatorSettings {
        &self.settings
    }

    /// Bind both emulator endpoints with a fresh cursor and broadcast `Start`.
    pub(crate) async fn launch(&self) -> Result<()> {
        if lock(&self.servers).is_some() {
            info!("Stream emulator already running");
            return Ok(());
        }

        let core = EmulatorCore::new(self.assets.clone(), &self.settings);
        match spawn_emulator_servers(&self.settings, core).await {
            Ok(servers) => {
                let (image_addr, metadata_addr) = servers.addresses();
                info!(%image_addr, %metadata_addr, "Stream emulator started");
                if let Some(stale) = lock(&self.servers).replace(servers) {
                    stale.kill_now();
                }
                self.launches.fetch_add(1, Ordering::SeqCst);
                let _ = self.events.send(LifecycleEvent::Start { pid: None });
                Ok(())
            }
            Err(err) => {
                let _ = self.events.send(LifecycleEvent::Error {
                    message: format!("{err:#}"),
                });
                Err(err)
            }
        }
    }

    /// Close both endpoints and wait for the server thread. Returns `false` when nothing was running.
    pub(crate) async fn kill(&self) -> bool {
        let Some(servers) = lock(&self.servers).take() else {
            return false;
        };
        servers.kill().await;
        let _ = self.events.send(LifecycleEvent::Stop);
        true
    }

    /// Signal both endpoints to close without waiting for confirmation.
    pub(crate) fn kill_now(&self) -> bool {
        let Some(servers) = lock(&self.servers).take() else {
            return false;
        };
        servers.kill_now();
        let _ = self.events.send(LifecycleEvent::Stop);
        true
    }

    #[cfg(test)]
    pub(crate) fn addresses(&self) -> Option<(std::net::SocketAddr, std::net::SocketAddr)> {
        lock(&self.servers).as_ref().map(EmulatorServers::addresses)
    }

    pub(crate) fn launches(&self) -> u64 {
        self.launches.load(Ordering::SeqCst)
    }
}

impl Drop for SimulationHandle {
    fn drop(&mut self) {
        if self.kill_now() {
            warn!("Stream emulator dropped while running; closing listeners");
        }
    }
}
