//! The Quorum database cluster operator.

mod app;
mod config;
#[cfg(test)]
mod fixtures;
mod k8s;
mod pipeline;
mod recorder;
mod server;
mod units;

use std::io::Write;
use std::sync::Arc;

use anyhow::{Context, Result};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tracing_subscriber::prelude::*;

use crate::app::App;
use crate::config::Config;

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing()?;
    let cfg = Arc::new(Config::new()?);
    let metrics = install_metrics_recorder(&cfg)?;

    tracing::info!(
        http_port = %cfg.http_port,
        namespace = %cfg.namespace,
        workers = cfg.workers,
        pass_timeout = ?cfg.pass_timeout(),
        "operator starting",
    );
    let res = App::new(cfg, metrics).await?.spawn().await;
    match res {
        Ok(Ok(())) => (),
        Ok(Err(err)) => tracing::error!(error = ?err, "operator stopped with an error"),
        Err(err) => tracing::error!(error = ?err, "error joining operator task"),
    }

    let _ = std::io::stdout().flush();
    let _ = std::io::stderr().flush();
    Ok(())
}

/// Install the global tracing subscriber, filtered by `RUST_LOG`.
fn init_tracing() -> Result<()> {
    let fmt_layer = tracing_subscriber::fmt::layer().with_target(true).with_level(true).with_ansi(true);
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(fmt_layer)
        .try_init()
        .context("error initializing tracing subscriber")
}

/// Install the Prometheus recorder as the global metrics recorder.
///
/// All series carry the namespace and pod of this instance. The returned handle renders the
/// scrape output.
fn install_metrics_recorder(config: &Config) -> Result<PrometheusHandle> {
    let recorder = PrometheusBuilder::new()
        .add_global_label("namespace", config.namespace.clone())
        .add_global_label("pod", config.pod_name.clone())
        .build();
    let handle = recorder.handle();
    metrics::set_boxed_recorder(Box::new(recorder)).context("error installing metrics recorder")?;
    Ok(handle)
}
