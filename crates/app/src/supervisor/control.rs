//! HTTP control surface for the supervisor.
//!
//! Runs on a dedicated thread with its own Actix system so request handling
//! never competes with the supervisor's runtime.

use std::net::{SocketAddr, TcpListener};

use actix_web::{App, HttpResponse, HttpServer, http::header, web};
use anyhow::{Context, Result};
use serde::Serialize;
use tokio::sync::oneshot;
use tracing::{error, info};

use crate::{supervisor::Supervisor, telemetry};

/// Handle for the control server thread.
pub(crate) struct ControlServer {
    addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    handle: Option<std::thread::JoinHandle<()>>,
}

impl ControlServer {
    pub(crate) fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Signal the server to stop and block until the thread exits.
    pub(crate) fn stop(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct VideoParamsResponse {
    video_params: Option<Vec<String>>,
}

/// Bind `addr` and serve the control API for `supervisor`.
pub(crate) fn spawn_control_server(addr: SocketAddr, supervisor: Supervisor) -> Result<ControlServer> {
    let listener = TcpListener::bind(addr)
        .with_context(|| format!("Failed to bind control API on {addr}"))?;
    let local_addr = listener.local_addr().context("Control API has no local address")?;
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

    let handle = telemetry::spawn_thread("control-api", move || {
        if let Err(err) = actix_web::rt::System::new().block_on(async move {
            let server = HttpServer::new(move || {
                App::new()
                    .app_data(web::Data::new(supervisor.clone()))
                    .route("/status", web::get().to(status_handler))
                    .route("/video-params", web::get().to(video_params_handler))
                    .route("/start", web::post().to(start_handler))
                    .route("/stop", web::post().to(stop_handler))
                    .route("/restart", web::post().to(restart_handler))
                    .route("/metrics", web::get().to(metrics_handler))
            })
            .workers(1)
            .disable_signals()
            .listen(listener)?
            .run();

            let srv_handle = server.handle();
            actix_web::rt::spawn(async move {
                let _ = shutdown_rx.await;
                srv_handle.stop(true).await;
            });

            info!(%local_addr, "Control API listening");
            server.await
        }) {
            error!("Control API server error: {err}");
        }
    })?;

    Ok(ControlServer {
        addr: local_addr,
        shutdown: Some(shutdown_tx),
        handle: Some(handle),
    })
}

async fn status_handler(supervisor: web::Data<Supervisor>) -> HttpResponse {
    HttpResponse::Ok().json(supervisor.status())
}

async fn video_params_handler(supervisor: web::Data<Supervisor>) -> HttpResponse {
    HttpResponse::Ok().json(VideoParamsResponse {
        video_params: supervisor.video_params(),
    })
}

async fn start_handler(supervisor: web::Data<Supervisor>) -> HttpResponse {
    supervisor.start();
    HttpResponse::Accepted().json(supervisor.status())
}

async fn stop_handler(supervisor: web::Data<Supervisor>) -> HttpResponse {
    supervisor.stop().await;
    HttpResponse::Ok().json(supervisor.status())
}

async fn restart_handler(supervisor: web::Data<Supervisor>) -> HttpResponse {
    supervisor.restart().await;
    HttpResponse::Accepted().json(supervisor.status())
}

/// Prometheus text exposition of the process metrics.
async fn metrics_handler() -> HttpResponse {
    match telemetry::prometheus_handle() {
        Some(handle) => HttpResponse::Ok()
            .insert_header((header::CONTENT_TYPE, "text/plain; version=0.0.4"))
            .body(handle.render()),
        None => HttpResponse::ServiceUnavailable().body("metrics recorder not installed"),
    }
}
