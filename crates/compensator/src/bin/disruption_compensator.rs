/*
 * 5D Labs Agent Platform - Disruption Compensator
 * Copyright (C) 2025 5D Labs
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Affero General Public License as published
 * by the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
 * GNU Affero General Public License for more details.
 *
 * You should have received a copy of the GNU Affero General Public License
 * along with this program. If not, see <https://www.gnu.org/licenses/>.
 */

//! Disruption Compensator Service
//!
//! - Watches cluster Events for nodes whose drain is blocked by a disruption budget
//! - Scales eligible Deployments on those nodes up and marks them compensated
//! - Periodically restores every marked Deployment to its original replica count
//! - Serves `/health` and `/ready`

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, Result};
use axum::{extract::State, http::StatusCode, response::Json, routing::get, Router};
use clap::{Parser, ValueEnum};
use compensator::cluster::{PipelineStore, WorkloadStore};
use compensator::kube_store::{ArgoPipelineStore, KubeWorkloadStore};
use compensator::watcher::event_stream;
use compensator::{run_compensator, CompensatorConfig, DEFAULT_CONFIG_PATH};
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::Event;
use kube::api::{Api, ListParams};
use serde_json::{json, Value};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tower::ServiceBuilder;
use tower_http::{
    timeout::TimeoutLayer,
    trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer},
};
use tracing::{error, info, warn, Level};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

/// Scale workloads up while a node drain is blocked, then restore them
#[derive(Parser, Debug)]
#[command(name = "disruption-compensator")]
#[command(version)]
struct Args {
    /// Path to the YAML configuration file
    #[arg(long, env = "COMPENSATOR_CONFIG_PATH", default_value = DEFAULT_CONFIG_PATH)]
    config: String,

    /// Log output format
    #[arg(long, env = "COMPENSATOR_LOG_FORMAT", value_enum, default_value = "text")]
    log_format: LogFormat,

    /// Overrides `server.bindAddress` from the configuration file
    #[arg(long, env = "COMPENSATOR_BIND_ADDRESS")]
    bind_address: Option<String>,
}

#[derive(Clone)]
struct AppState {
    shutdown: CancellationToken,
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Text => registry.with(fmt::layer()).init(),
        LogFormat::Json => registry.with(fmt::layer().json()).init(),
    }
}

/// Missing or unreadable file means defaults; a file that does not parse is fatal.
fn load_config(config_path: &str) -> Result<CompensatorConfig> {
    if !Path::new(config_path).exists() {
        warn!(path = %config_path, "Configuration file not found, using defaults");
        return Ok(CompensatorConfig::default());
    }

    match CompensatorConfig::from_mounted_file(config_path) {
        Ok(config) => {
            info!(path = %config_path, "Loaded compensator configuration");
            Ok(config)
        }
        Err(err) if err.downcast_ref::<std::io::Error>().is_some() => {
            warn!(
                path = %config_path,
                error = %err,
                "Failed to read configuration, using defaults"
            );
            Ok(CompensatorConfig::default())
        }
        Err(err) => Err(err.context(format!("invalid configuration in {config_path}"))),
    }
}

/// Fail fast if the watch or the workload queries cannot work at all
async fn probe_cluster(client: &kube::Client) -> Result<()> {
    let probe = ListParams::default().limit(1);

    Api::<Event>::all(client.clone())
        .list(&probe)
        .await
        .context("cannot list Events cluster-wide")?;
    Api::<Deployment>::all(client.clone())
        .list(&probe)
        .await
        .context("cannot list Deployments cluster-wide")?;

    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.log_format);

    info!(
        "Starting 5D Labs Disruption Compensator v{}",
        env!("CARGO_PKG_VERSION")
    );

    let mut config = load_config(&args.config)?;
    if let Some(bind_address) = args.bind_address {
        config.server.bind_address = bind_address;
    }
    config
        .validate()
        .context("compensator configuration is invalid")?;

    let client = kube::Client::try_default()
        .await
        .context("failed to create Kubernetes client")?;
    info!("Connected to Kubernetes cluster");

    probe_cluster(&client).await?;
    info!("Cluster access verified");

    let shutdown = CancellationToken::new();
    tokio::spawn(shutdown_signal(shutdown.clone()));

    let app = Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .layer(
            ServiceBuilder::new()
                .layer(
                    TraceLayer::new_for_http()
                        .make_span_with(DefaultMakeSpan::new().level(Level::DEBUG))
                        .on_response(DefaultOnResponse::new().level(Level::DEBUG)),
                )
                .layer(TimeoutLayer::new(Duration::from_secs(10))),
        )
        .with_state(AppState {
            shutdown: shutdown.clone(),
        });

    let listener = tokio::net::TcpListener::bind(&config.server.bind_address)
        .await
        .with_context(|| format!("failed to bind {}", config.server.bind_address))?;
    info!(address = %config.server.bind_address, "Health server listening");

    let server = tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move { shutdown.cancelled().await })
                .await
        }
    });

    let workloads: Arc<dyn WorkloadStore> = Arc::new(KubeWorkloadStore::new(client.clone()));
    let pipelines: Arc<dyn PipelineStore> = Arc::new(ArgoPipelineStore::new(client.clone()));

    let result = run_compensator(
        &config,
        workloads,
        pipelines,
        event_stream(client, &config.watch.reason),
        shutdown.clone(),
    )
    .await;

    shutdown.cancel();
    match server.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!(error = %e, "Health server failed"),
        Err(e) => error!(error = %e, "Health server task failed"),
    }

    result.context("compensator stopped with an error")?;
    info!("Disruption compensator stopped");
    Ok(())
}

async fn health_check() -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "service": "disruption-compensator",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

async fn readiness_check(State(state): State<AppState>) -> Result<Json<Value>, StatusCode> {
    if state.shutdown.is_cancelled() {
        return Err(StatusCode::SERVICE_UNAVAILABLE);
    }
    Ok(Json(json!({
        "status": "ready",
        "service": "disruption-compensator",
        "version": env!("CARGO_PKG_VERSION")
    })))
}

async fn shutdown_signal(shutdown: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            info!("Received Ctrl+C, shutting down gracefully");
        },
        () = terminate => {
            info!("Received SIGTERM, shutting down gracefully");
        },
        () = shutdown.cancelled() => return,
    }

    shutdown.cancel();
}
