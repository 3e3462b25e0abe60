//! Supervision of a single long-running child process.
//!
//! A [`ProcessMonitor`] spawns the configured command on a background task,
//! respawns it according to its [`RestartPolicy`] when it exits on its own,
//! and tears down the whole process group when asked to stop. Every
//! transition is broadcast as a [`LifecycleEvent`].

use std::{
    error::Error as StdError,
    sync::{
        Arc, Mutex, MutexGuard,
        atomic::{AtomicU64, Ordering},
    },
};

use tokio::sync::{broadcast, oneshot, watch};
use tracing::{debug, error, info, warn};

mod spawn;
mod types;

pub use types::{LifecycleEvent, MonitorConfig, MonitorError, RestartPolicy};

const EVENT_CAPACITY: usize = 64;

/// Cloneable handle to one supervised command.
#[derive(Clone)]
pub struct ProcessMonitor {
    inner: Arc<Inner>,
}

struct Inner {
    config: MonitorConfig,
    events: broadcast::Sender<LifecycleEvent>,
    run: Mutex<Option<RunControl>>,
    launches: AtomicU64,
}

/// One supervised run. Stays in the slot until its task has returned.
struct RunControl {
    /// Taken by the first `stop` caller.
    stop: Option<oneshot::Sender<()>>,
    /// Closed when the supervise task returns or is dropped.
    finished: watch::Receiver<()>,
}

impl RunControl {
    fn is_finished(&self) -> bool {
        self.finished.has_changed().is_err()
    }
}

impl ProcessMonitor {
    pub fn new(config: MonitorConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                config,
                events,
                run: Mutex::new(None),
                launches: AtomicU64::new(0),
            }),
        }
    }

    /// Receive every event emitted after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.inner.events.subscribe()
    }

    /// Number of successful spawns since construction.
    pub fn launches(&self) -> u64 {
        self.inner.launches.load(Ordering::SeqCst)
    }

    #[cfg(test)]
    fn is_running(&self) -> bool {
        lock(&self.inner.run)
            .as_ref()
            .is_some_and(|run| !run.is_finished())
    }

    /// Begin supervising. Must be called from within a Tokio runtime.
    pub fn start(&self) -> Result<(), MonitorError> {
        let mut run = lock(&self.inner.run);
        if run.as_ref().is_some_and(|run| !run.is_finished()) {
            return Err(MonitorError::AlreadyRunning);
        }

        let (stop_tx, stop_rx) = oneshot::channel();
        let (finished_tx, finished_rx) = watch::channel(());
        let inner = self.inner.clone();
        tokio::spawn(async move {
            supervise(inner, stop_rx).await;
            drop(finished_tx);
        });
        *run = Some(RunControl {
            stop: Some(stop_tx),
            finished: finished_rx,
        });
        Ok(())
    }

    /// Stop the process tree and wait until the supervising task has finished.
    ///
    /// Concurrent callers all wait for the same teardown. Returns `false` when
    /// nothing was running.
    pub async fn stop(&self) -> bool {
        let (stop, mut finished) = {
            let mut slot = lock(&self.inner.run);
            let Some(run) = slot.as_mut() else {
                return false;
            };
            if run.is_finished() {
                *slot = None;
                return false;
            }
            (run.stop.take(), run.finished.clone())
        };

        if let Some(stop) = stop {
            if stop.send(()).is_err() {
                debug!("Process monitor task already returning");
            }
        }
        while finished.changed().await.is_ok() {}

        let mut slot = lock(&self.inner.run);
        if slot.as_ref().is_some_and(RunControl::is_finished) {
            *slot = None;
        }
        true
    }
}

async fn supervise(inner: Arc<Inner>, mut stop_rx: oneshot::Receiver<()>) {
    let config = &inner.config;
    let policy = config.restart;
    let mut restarts: u32 = 0;
    let mut started = false;

    loop {
        match spawn::spawn_child(config) {
            Ok(mut child) => {
                inner.launches.fetch_add(1, Ordering::SeqCst);
                let pid = child.id();
                if started {
                    info!(?pid, attempt = restarts, "Detector process restarted");
                    emit(&inner, LifecycleEvent::Restart {
                        pid,
                        attempt: restarts,
                    });
                } else {
                    started = true;
                    info!(?pid, "Detector process started");
                    emit(&inner, LifecycleEvent::Start { pid });
                }

                tokio::select! {
                    status = child.wait() => {
                        let code = match status {
                            Ok(status) => status.code(),
                            Err(err) => {
                                emit(&inner, LifecycleEvent::Error { message: err.to_string() });
                                None
                            }
                        };
                        warn!(?code, "Detector process exited");
                        emit(&inner, LifecycleEvent::Exit { code });
                    }
                    _ = &mut stop_rx => {
                        let code = spawn::terminate(&mut child, config).await;
                        info!(?code, "Detector process stopped");
                        emit(&inner, LifecycleEvent::Exit { code });
                        emit(&inner, LifecycleEvent::Stop);
                        return;
                    }
                }
            }
            Err(err) => {
                let message = error_chain(&err);
                error!("Detector process error: {message}");
                emit(&inner, LifecycleEvent::Error { message });
            }
        }

        if !policy.allows(restarts) {
            error!(restarts, "Detector restart budget exhausted; giving up");
            emit(&inner, LifecycleEvent::GaveUp { restarts });
            return;
        }
        restarts = restarts.saturating_add(1);

        tokio::select! {
            _ = tokio::time::sleep(policy.backoff) => {}
            _ = &mut stop_rx => {
                emit(&inner, LifecycleEvent::Stop);
                return;
            }
        }
    }
}

fn emit(inner: &Inner, event: LifecycleEvent) {
    // No subscribers is fine.
    let _ = inner.events.send(event);
}

fn error_chain(err: &dyn StdError) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::{sync::broadcast::Receiver, time::timeout};

    use super::*;

    async fn next_event(rx: &mut Receiver<LifecycleEvent>) -> LifecycleEvent {
        timeout(Duration::from_secs(10), rx.recv())
            .await
            .expect("event within timeout")
            .expect("event channel open")
    }

    fn sleeper() -> MonitorConfig {
        MonitorConfig::new(["sleep", "30"])
            .expect("non-empty command")
            .with_stop_grace(Duration::from_secs(2))
    }

    #[tokio::test]
    async fn start_then_stop_emits_lifecycle_in_order() {
        let monitor = ProcessMonitor::new(sleeper());
        let mut events = monitor.subscribe();

        monitor.start().expect("monitor starts");
        assert!(matches!(
            next_event(&mut events).await,
            LifecycleEvent::Start { pid: Some(_) }
        ));
        assert!(monitor.is_running());

        assert!(monitor.stop().await);
        assert!(matches!(
            next_event(&mut events).await,
            LifecycleEvent::Exit { .. }
        ));
        assert_eq!(next_event(&mut events).await, LifecycleEvent::Stop);
        assert!(!monitor.is_running());
        assert_eq!(monitor.launches(), 1);
    }

    #[tokio::test]
    async fn second_start_is_rejected_while_running() {
        let monitor = ProcessMonitor::new(sleeper());
        monitor.start().expect("monitor starts");
        assert!(matches!(
            monitor.start(),
            Err(MonitorError::AlreadyRunning)
        ));
        monitor.stop().await;
    }

    #[tokio::test]
    async fn stop_without_start_reports_nothing_running() {
        let monitor = ProcessMonitor::new(sleeper());
        assert!(!monitor.stop().await);
    }

    #[tokio::test]
    async fn crashing_process_is_restarted_until_budget_runs_out() {
        let config = MonitorConfig::new(["sh", "-c", "exit 3"])
            .expect("non-empty command")
            .with_restart_policy(RestartPolicy {
                max_restarts: Some(2),
                backoff: Duration::from_millis(10),
            });
        let monitor = ProcessMonitor::new(config);
        let mut events = monitor.subscribe();
        monitor.start().expect("monitor starts");

        assert!(matches!(
            next_event(&mut events).await,
            LifecycleEvent::Start { .. }
        ));
        assert_eq!(next_event(&mut events).await, LifecycleEvent::Exit {
            code: Some(3)
        });
        for attempt in 1..=2 {
            match next_event(&mut events).await {
                LifecycleEvent::Restart { attempt: seen, .. } => assert_eq!(seen, attempt),
                other => panic!("expected restart, got {other:?}"),
            }
            assert_eq!(next_event(&mut events).await, LifecycleEvent::Exit {
                code: Some(3)
            });
        }
        assert_eq!(next_event(&mut events).await, LifecycleEvent::GaveUp {
            restarts: 2
        });
        assert_eq!(monitor.launches(), 3);
    }

    #[tokio::test]
    async fn spawn_failures_are_reported_and_retried() {
        let config = MonitorConfig::new(["/nonexistent/detector-binary"])
            .expect("non-empty command")
            .with_restart_policy(RestartPolicy {
                max_restarts: Some(1),
                backoff: Duration::from_millis(10),
            });
        let monitor = ProcessMonitor::new(config);
        let mut events = monitor.subscribe();
        monitor.start().expect("monitor starts");

        for _ in 0..2 {
            match next_event(&mut events).await {
                LifecycleEvent::Error { message } => {
                    assert!(message.contains("failed to spawn"), "{message}")
                }
                other => panic!("expected error, got {other:?}"),
            }
        }
        assert_eq!(next_event(&mut events).await, LifecycleEvent::GaveUp {
            restarts: 1
        });
        assert_eq!(monitor.launches(), 0);
    }

    #[tokio::test]
    async fn stop_tears_down_children_of_the_process() {
        let config = MonitorConfig::new(["sh", "-c", "sleep 30 & wait"])
            .expect("non-empty command")
            .with_stop_grace(Duration::from_secs(2));
        let monitor = ProcessMonitor::new(config);
        let mut events = monitor.subscribe();
        monitor.start().expect("monitor starts");
        next_event(&mut events).await;

        timeout(Duration::from_secs(5), monitor.stop())
            .await
            .expect("group stop completes within the grace period");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn concurrent_stops_wait_for_the_same_teardown() {
        let config = MonitorConfig::new([
            "sh",
            "-c",
            "trap '' TERM; while true; do sleep 0.1; done",
        ])
        .expect("non-empty command")
        .with_stop_grace(Duration::from_secs(1));
        let monitor = ProcessMonitor::new(config);
        let mut events = monitor.subscribe();
        monitor.start().expect("monitor starts");
        next_event(&mut events).await;

        let first = tokio::spawn({
            let monitor = monitor.clone();
            async move { monitor.stop().await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(monitor.stop().await, "second caller waits for the teardown");
        assert!(!monitor.is_running());
        assert!(matches!(
            events.try_recv(),
            Ok(LifecycleEvent::Exit { .. })
        ));
        assert_eq!(events.try_recv().ok(), Some(LifecycleEvent::Stop));
        assert!(matches!(
            monitor.start(),
            Ok(())
        ));
        assert!(first.await.expect("first stop completes"));
        monitor.stop().await;
    }

    #[test]
    fn empty_command_line_is_rejected() {
        let empty: [&str; 0] = [];
        assert!(matches!(
            MonitorConfig::new(empty),
            Err(MonitorError::EmptyCommand)
        ));
    }

    #[test]
    fn bounded_policy_counts_restarts() {
        let policy = RestartPolicy {
            max_restarts: Some(1),
            backoff: Duration::ZERO,
        };
        assert!(policy.allows(0));
        assert!(!policy.allows(1));
        assert!(RestartPolicy::default().allows(u32::MAX));
    }
}
