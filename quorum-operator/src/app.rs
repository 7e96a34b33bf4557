use std::sync::Arc;

use anyhow::{Context, Result};
use futures::stream::StreamExt;
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::{BroadcastStream, SignalStream};
use tokio_stream::StreamMap;

use crate::config::Config;
use crate::k8s::Controller;
use crate::server::AppServer;

/// The operator process: its HTTP server, its controller, and the shutdown signal between them.
pub struct App {
    shutdown_tx: broadcast::Sender<()>,
    /// Fires when any component triggers shutdown.
    shutdown_rx: BroadcastStream<()>,

    server: JoinHandle<()>,
    controller: JoinHandle<Result<()>>,
}

impl App {
    /// Connect to K8s and start the server and the controller.
    pub async fn new(config: Arc<Config>, metrics: PrometheusHandle) -> Result<Self> {
        let (shutdown_tx, shutdown_rx) = broadcast::channel(10);
        let client = kube::Client::try_default().await.context("error building K8s client from environment")?;

        let server = AppServer::new(config.clone(), metrics, shutdown_tx.clone()).spawn();
        let controller = Controller::new(client, config, shutdown_tx.clone())?.spawn();
        Ok(Self {
            shutdown_rx: BroadcastStream::new(shutdown_rx),
            shutdown_tx,
            server,
            controller,
        })
    }

    pub fn spawn(self) -> JoinHandle<Result<()>> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) -> Result<()> {
        let mut signals = StreamMap::new();
        for (name, kind) in [("sigterm", SignalKind::terminate()), ("sigint", SignalKind::interrupt())] {
            let stream = signal(kind).with_context(|| format!("error listening for {}", name))?;
            signals.insert(name, SignalStream::new(stream));
        }

        tokio::select! {
            Some((name, _)) = signals.next() => {
                tracing::info!(signal = name, "stopping operator");
                let _ = self.shutdown_tx.send(());
            }
            _ = self.shutdown_rx.next() => tracing::info!("stopping operator after internal shutdown"),
        }

        // The server drains its connections, the controller cancels its passes and steps down.
        if let Err(err) = self.server.await {
            tracing::error!(error = ?err, "http server task panicked");
        }
        match self.controller.await {
            Ok(Ok(())) => (),
            Ok(Err(err)) => tracing::error!(error = ?err, "controller stopped with an error"),
            Err(err) => tracing::error!(error = ?err, "controller task panicked"),
        }
        tracing::info!("operator stopped");
        Ok(())
    }
}
