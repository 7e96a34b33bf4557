use std::sync::Arc;

use anyhow::Result;
use axum::http::{header::HeaderName, HeaderMap, HeaderValue, StatusCode};
use axum::{extract::Extension, routing::get, AddExtensionLayer, Router};
use futures::prelude::*;
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::config::Config;

/// The HTTP server used for healthchecks and metrics scraping.
pub struct AppServer {
    config: Arc<Config>,
    /// Renders the scrape output of the global metrics recorder.
    metrics: PrometheusHandle,
    /// Triggers graceful shutdown of the whole application.
    shutdown: broadcast::Sender<()>,
}

impl AppServer {
    /// Create a new instance.
    pub fn new(config: Arc<Config>, metrics: PrometheusHandle, shutdown: broadcast::Sender<()>) -> Self {
        Self { config, metrics, shutdown }
    }

    /// Spawn the server, which stops once shutdown is triggered.
    ///
    /// A server which fails triggers shutdown of the whole application.
    pub fn spawn(self) -> JoinHandle<()> {
        let app = Router::new()
            .route("/health", get(|| async { StatusCode::OK }))
            .route("/metrics", get(prometheus_scrape))
            .layer(AddExtensionLayer::new(self.metrics));

        let mut shutdown_rx = self.shutdown.subscribe();
        let server = axum::Server::bind(&([0, 0, 0, 0], self.config.http_port).into())
            .serve(app.into_make_service())
            .with_graceful_shutdown(async move {
                let _res = shutdown_rx.recv().await;
            })
            .map_err(anyhow::Error::from);
        tracing::info!("http server is listening at 0.0.0.0:{}", self.config.http_port);

        let shutdown = self.shutdown;
        tokio::spawn(async move {
            let res: Result<()> = server.await;
            if let Err(err) = res {
                tracing::error!(error = ?err, "error from http server, shutting down");
                let _res = shutdown.send(());
            }
        })
    }
}

/// Handle Prometheus metrics scraping.
async fn prometheus_scrape(Extension(state): Extension<PrometheusHandle>) -> (StatusCode, HeaderMap, String) {
    let mut headers = HeaderMap::new();
    headers.insert(HeaderName::from_static("content-type"), HeaderValue::from_static("text/plain; version=0.0.4"));
    (StatusCode::OK, headers, state.render())
}
