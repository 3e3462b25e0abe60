//! HTTP endpoints of the stream emulator.
//!
//! Both listeners run on one dedicated thread with its own Actix system, the
//! same way the control API does. Any path on the image port returns the
//! MJPEG stream; any path on the metadata port returns newline-delimited JSON.

use std::{net::SocketAddr, sync::Arc};

use actix_web::{
    App, HttpResponse, HttpServer,
    http::header,
    web::{self, Bytes},
};
use anyhow::{Context, Result, anyhow};
use async_stream::stream;
use tokio::sync::oneshot;
use tracing::{error, info, warn};

use crate::{
    emulator::stream::{EmulatorCore, MJPEG_BOUNDARY},
    supervisor::EmulatorSettings,
    telemetry::spawn_thread,
};

/// Running emulator listeners.
pub(crate) struct EmulatorServers {
    shutdown: oneshot::Sender<()>,
    stopped: oneshot::Receiver<()>,
    image_addr: SocketAddr,
    metadata_addr: SocketAddr,
}

impl EmulatorServers {
    /// Bound `(image, metadata)` addresses.
    pub(crate) fn addresses(&self) -> (SocketAddr, SocketAddr) {
        (self.image_addr, self.metadata_addr)
    }

    /// Close both listeners and wait for the server thread to finish.
    pub(crate) async fn kill(self) {
        let _ = self.shutdown.send(());
        if self.stopped.await.is_err() {
            warn!("Emulator server thread exited without confirming shutdown");
        }
    }

    /// Signal shutdown without waiting.
    pub(crate) fn kill_now(self) {
        let _ = self.shutdown.send(());
    }
}

/// Bind both endpoints and start serving `core`.
///
/// Resolves once the listeners are bound. Dropping the returned handle, or the
/// future before it resolves, shuts the listeners down.
pub(crate) async fn spawn_emulator_servers(
    settings: &EmulatorSettings,
    core: Arc<EmulatorCore>,
) -> Result<EmulatorServers> {
    let image_bind = SocketAddr::new(settings.bind_host, settings.image_port);
    let metadata_bind = SocketAddr::new(settings.bind_host, settings.metadata_port);
    let (ready_tx, ready_rx) = oneshot::channel::<Result<(SocketAddr, SocketAddr)>>();
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let (stopped_tx, stopped_rx) = oneshot::channel::<()>();

    spawn_thread("stream-emulator", move || {
        let result = actix_web::rt::System::new().block_on(async move {
            let bound = bind_servers(image_bind, metadata_bind, core.clone());
            let (image, image_addr, metadata, metadata_addr) = match bound {
                Ok(bound) => bound,
                Err(err) => {
                    let _ = ready_tx.send(Err(err));
                    return Ok(());
                }
            };

            let image_handle = image.handle();
            let metadata_handle = metadata.handle();
            actix_web::rt::spawn(async move {
                let _ = shutdown_rx.await;
                core.close_sessions();
                tokio::join!(image_handle.stop(false), metadata_handle.stop(false));
            });

            let _ = ready_tx.send(Ok((image_addr, metadata_addr)));
            info!(%image_addr, %metadata_addr, "Stream emulator listening");
            tokio::try_join!(image, metadata).map(|_| ())
        });
        if let Err(err) = result {
            error!("Stream emulator server error: {err}");
        }
        let _ = stopped_tx.send(());
    })?;

    let (image_addr, metadata_addr) = ready_rx
        .await
        .map_err(|_| anyhow!("Stream emulator thread exited before binding"))??;

    Ok(EmulatorServers {
        shutdown: shutdown_tx,
        stopped: stopped_rx,
        image_addr,
        metadata_addr,
    })
}

fn bind_servers(
    image_bind: SocketAddr,
    metadata_bind: SocketAddr,
    core: Arc<EmulatorCore>,
) -> Result<(
    actix_web::dev::Server,
    SocketAddr,
    actix_web::dev::Server,
    SocketAddr,
)> {
    let image_core = web::Data::from(core.clone());
    let image = HttpServer::new(move || {
        App::new()
            .app_data(image_core.clone())
            .default_service(web::to(image_stream_handler))
    })
    .workers(1)
    .disable_signals()
    .bind(image_bind)
    .with_context(|| format!("Failed to bind image stream on {image_bind}"))?;
    let image_addr = first_addr(image.addrs(), image_bind);

    let metadata_core = web::Data::from(core);
    let metadata = HttpServer::new(move || {
        App::new()
            .app_data(metadata_core.clone())
            .default_service(web::to(metadata_stream_handler))
    })
    .workers(1)
    .disable_signals()
    .bind(metadata_bind)
    .with_context(|| format!("Failed to bind metadata stream on {metadata_bind}"))?;
    let metadata_addr = first_addr(metadata.addrs(), metadata_bind);

    Ok((image.run(), image_addr, metadata.run(), metadata_addr))
}

fn first_addr(addrs: Vec<SocketAddr>, requested: SocketAddr) -> SocketAddr {
    addrs.into_iter().next().unwrap_or(requested)
}

/// Stream MJPEG parts for as long as this client holds the image session.
async fn image_stream_handler(core: web::Data<EmulatorCore>) -> HttpResponse {
    let mut parts = core.into_inner().attach_image_client();
    let stream = stream! {
        while let Some(part) = parts.recv().await {
            yield Ok::<Bytes, actix_web::Error>(part);
        }
    };

    HttpResponse::Ok()
        .insert_header((header::ACCESS_CONTROL_ALLOW_ORIGIN, "*"))
        .insert_header((header::ACCESS_CONTROL_ALLOW_HEADERS, "*"))
        .insert_header((header::ACCESS_CONTROL_ALLOW_METHODS, "GET"))
        .insert_header((header::ACCESS_CONTROL_EXPOSE_HEADERS, "Content-Type"))
        .append_header(("Cache-Control", "no-cache"))
        .append_header((
            "Content-Type",
            format!("multipart/x-mixed-replace; boundary={MJPEG_BOUNDARY}"),
        ))
        .append_header(("Connection", "keep-alive"))
        .streaming(stream)
}

/// Stream one JSON record per emitted frame.
async fn metadata_stream_handler(core: web::Data<EmulatorCore>) -> HttpResponse {
    let mut lines = core.attach_metadata_client();
    let stream = stream! {
        while let Some(line) = lines.recv().await {
            yield Ok::<Bytes, actix_web::Error>(line);
        }
    };

    HttpResponse::Ok()
        .insert_header((header::ACCESS_CONTROL_ALLOW_ORIGIN, "*"))
        .insert_header((header::ACCESS_CONTROL_ALLOW_HEADERS, "*"))
        .insert_header((header::ACCESS_CONTROL_ALLOW_METHODS, "GET"))
        .insert_header((header::ACCESS_CONTROL_EXPOSE_HEADERS, "Content-Type"))
        .append_header(("Cache-Control", "no-cache"))
        .append_header(("Content-Type", "application/x-ndjson"))
        .append_header(("Connection", "keep-alive"))
        .streaming(stream)
}
