//! Telemetry helpers for tracing spans, Prometheus metrics, and Chrome trace capture.

use std::{fs::File, path::Path, sync::OnceLock, thread, time::Duration};

use anyhow::{Context, Result, anyhow};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tracing::{Dispatch, Subscriber};
use tracing_chrome::{ChromeLayer, ChromeLayerBuilder, FlushGuard, TraceStyle};
use tracing_subscriber::{
    Registry,
    filter::{EnvFilter, filter_fn},
    fmt,
    layer::SubscriberExt,
    prelude::*,
    registry::LookupSpan,
};

use crate::supervisor::TelemetryOptions;

static PROM_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();
static PROM_UPKEEP_THREAD: OnceLock<thread::JoinHandle<()>> = OnceLock::new();

/// Keeps the Chrome trace writer alive; flushes on drop.
pub(crate) struct TelemetryGuard {
    _chrome_guard: Option<FlushGuard>,
}

/// Install the global metrics recorder once and return the Prometheus handle.
pub(crate) fn init_metrics_recorder() -> Result<&'static PrometheusHandle> {
    if let Some(handle) = PROM_HANDLE.get() {
        return Ok(handle);
    }

    let recorder = PrometheusBuilder::new().build_recorder();
    let handle = recorder.handle();
    metrics::set_global_recorder(recorder)
        .map_err(|err| anyhow!("metrics recorder already installed: {err}"))?;

    let upkeep_handle = handle.clone();
    let upkeep = spawn_thread("prometheus-upkeep", move || {
        loop {
            thread::sleep(Duration::from_secs(5));
            upkeep_handle.run_upkeep();
        }
    })?;
    let _ = PROM_UPKEEP_THREAD.set(upkeep);

    Ok(PROM_HANDLE.get_or_init(|| handle))
}

/// Access the Prometheus handle when already initialised.
pub(crate) fn prometheus_handle() -> Option<&'static PrometheusHandle> {
    PROM_HANDLE.get()
}

/// Install the process-wide tracing subscriber.
///
/// An unwritable Chrome trace path is reported once logging is up and does not
/// prevent startup.
pub(crate) fn init(opts: &TelemetryOptions) -> Result<TelemetryGuard> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let chrome = opts.chrome_trace_path.as_deref().map(chrome_trace_layer::<Registry>);
    let (chrome_layer, chrome_guard, chrome_error) = match chrome {
        Some(Ok((layer, guard))) => (Some(layer), Some(guard), None),
        Some(Err(err)) => (None, None, Some(err)),
        None => (None, None, None),
    };

    tracing_subscriber::registry()
        .with(chrome_layer.map(|layer| layer.with_filter(filter_fn(|meta| meta.is_span()))))
        .with(
            fmt::layer()
                .with_target(false)
                .with_timer(fmt::time::uptime())
                .with_filter(env_filter),
        )
        .with(tracing_error::ErrorLayer::default())
        .try_init()
        .map_err(|err| anyhow!("tracing subscriber already installed: {err}"))?;

    if let Some(err) = chrome_error {
        tracing::warn!("Chrome trace disabled: {err:#}");
    }

    Ok(TelemetryGuard {
        _chrome_guard: chrome_guard,
    })
}

/// Run `body` on a named OS thread under the caller's dispatcher, inside a
/// `thread` span carrying the name. Actix systems for the control API and the
/// stream emulator live on these threads.
pub(crate) fn spawn_thread<F, T>(name: &'static str, body: F) -> Result<thread::JoinHandle<T>>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    let dispatch = tracing::dispatcher::get_default(Dispatch::clone);
    thread::Builder::new()
        .name(name.to_owned())
        .spawn(move || {
            tracing::dispatcher::with_default(&dispatch, || {
                tracing::info_span!("thread", name).in_scope(body)
            })
        })
        .with_context(|| format!("Failed to spawn {name} thread"))
}

/// Chrome trace writer for `path`. Supervisor operations and emulator sessions
/// are async, so spans are laid out per task rather than per thread.
fn chrome_trace_layer<S>(path: &Path) -> Result<(ChromeLayer<S>, FlushGuard)>
where
    S: Subscriber + for<'span> LookupSpan<'span> + Send + Sync,
{
    let file = File::create(path)
        .with_context(|| format!("cannot create Chrome trace file {}", path.display()))?;
    Ok(ChromeLayerBuilder::new()
        .writer(file)
        .include_args(true)
        .trace_style(TraceStyle::Async)
        .build())
}
