/*
Copyright 2024 The Kubernetes Authors.

Licensed under the Apache License, Version 2.0 (the "License");
you may not use this file except in compliance with the License.
You may obtain a copy of the License at

    http://www.apache.org/licenses/LICENSE-2.0

Unless required by applicable law or agreed to in writing, software
distributed under the License is distributed on an "AS IS" BASIS,
WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
See the License for the specific language governing permissions and
limitations under the License.
*/

use controlplane::*;

use std::net::SocketAddr;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use kube::Client;
use prometheus_client::registry::Registry;
use tokio::try_join;
use tracing::*;
use tracing_subscriber::EnvFilter;

#[derive(Clone, Copy, Debug, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

/// Kubernetes Gateway API controller for the Pingora proxy. Watches
/// Gateways, HTTPRoutes and GRPCRoutes and programs the proxy's route table
/// over its gRPC control channel.
#[derive(Debug, Parser)]
#[command(name = "controller", version)]
struct Options {
    /// Name of the GatewayClass this instance manages.
    #[clap(
        long,
        env = "PINGORA_GATEWAY_CLASS_NAME",
        default_value = consts::DEFAULT_GATEWAY_CLASS_NAME
    )]
    gateway_class_name: String,

    /// Controller identifier recorded on managed GatewayClasses.
    #[clap(
        long,
        env = "PINGORA_CONTROLLER_NAME",
        default_value = consts::GATEWAY_CLASS_CONTROLLER_NAME
    )]
    controller_name: String,

    /// Cluster DNS suffix used for backend addresses.
    #[clap(
        long,
        env = "PINGORA_CLUSTER_DOMAIN",
        default_value = consts::DEFAULT_CLUSTER_DOMAIN
    )]
    cluster_domain: String,

    /// Bind address of the Prometheus metrics endpoint.
    #[clap(long, env = "PINGORA_METRICS_ADDR", default_value = "0.0.0.0:9090")]
    metrics_addr: SocketAddr,

    /// Bind address of the /healthz and /readyz endpoints.
    #[clap(long, env = "PINGORA_HEALTH_ADDR", default_value = "0.0.0.0:8081")]
    health_addr: SocketAddr,

    /// Log filter, e.g. "info" or "controlplane=debug,kube=warn".
    #[clap(long, env = "PINGORA_LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Log output format.
    #[clap(long, env = "PINGORA_LOG_FORMAT", value_enum, default_value = "text")]
    log_format: LogFormat,

    /// Run with leader election enabled.
    #[clap(long, env = "PINGORA_LEADER_ELECT")]
    leader_elect: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let opts = Options::parse();
    init_telemetry(&opts);
    run(opts).await;
    Ok(())
}

fn init_telemetry(opts: &Options) {
    let filter = EnvFilter::try_new(&opts.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    match opts.log_format {
        LogFormat::Json => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init(),
        LogFormat::Text => tracing_subscriber::fmt().with_env_filter(filter).init(),
    }
}

async fn run(opts: Options) {
    let client = Client::try_default()
        .await
        .expect("failed to create kube Client");

    let settings = Arc::new(Settings {
        gateway_class_name: opts.gateway_class_name.clone(),
        controller_name: opts.controller_name.clone(),
        cluster_domain: opts.cluster_domain.clone(),
    });
    info!(
        class = %settings.gateway_class_name,
        controller = %settings.controller_name,
        "starting pingora gateway controller"
    );

    if opts.leader_elect {
        // Election is delegated to the deployment; see the Helm chart notes.
        warn!("leader election is not handled in-process; run a single replica");
    }

    let mut registry = Registry::default();
    let metrics = Arc::new(metrics::ControllerMetrics::new(&mut registry));
    let registry = Arc::new(registry);

    let syncer = Arc::new(syncer::RouteSyncer::new(
        client.clone(),
        settings.clone(),
        metrics.clone(),
    ));
    let barrier = Arc::new(StartupBarrier::default());

    let ctx = Context {
        client,
        settings,
        metrics,
        syncer,
        barrier: barrier.clone(),
    };

    if let Err(error) = try_join!(
        gateway_controller(ctx.clone()),
        gatewayclass_controller(ctx.clone()),
        httproute_controller(ctx.clone()),
        grpcroute_controller(ctx.clone()),
        admin::serve_metrics(opts.metrics_addr, registry),
        admin::serve_health(opts.health_addr, barrier),
    ) {
        error!("failed to start controllers: {error:?}");
        std::process::exit(1);
    }
}
