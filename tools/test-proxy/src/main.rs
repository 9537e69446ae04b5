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

// A stand-in for the Pingora proxy's control channel: stores the last pushed
// route table in memory and echoes the applied version, so the controller
// can be exercised without a live proxy.

use std::net::SocketAddr;
use std::sync::Arc;

use clap::Parser;
use tokio::sync::RwLock;
use tonic::transport::Server;
use tonic::{Request, Response, Status};
use tracing::{info, warn};

use routes::routes::routes_server::{Routes, RoutesServer};
use routes::routes::{
    GetRoutesRequest, GetRoutesResponse, GrpcRoute, HealthRequest, HealthResponse, HttpRoute,
    UpdateRoutesRequest, UpdateRoutesResponse,
};

#[derive(Debug, Parser)]
struct Options {
    /// Address to serve the route control channel on.
    #[clap(long, default_value = "0.0.0.0:9090")]
    listen: SocketAddr,
    /// Reply success=false to every UpdateRoutes call.
    #[clap(long)]
    fail_updates: bool,
}

#[derive(Default)]
struct RouteTable {
    http_routes: Vec<HttpRoute>,
    grpc_routes: Vec<GrpcRoute>,
    version: u64,
}

struct RouteService {
    table: Arc<RwLock<RouteTable>>,
    fail_updates: bool,
}

#[tonic::async_trait]
impl Routes for RouteService {
    async fn update_routes(
        &self,
        request: Request<UpdateRoutesRequest>,
    ) -> Result<Response<UpdateRoutesResponse>, Status> {
        let request = request.into_inner();

        if self.fail_updates {
            warn!(version = request.version, "rejecting route table update");
            return Ok(Response::new(UpdateRoutesResponse {
                success: false,
                error: "updates disabled by --fail-updates".to_string(),
                http_route_count: 0,
                grpc_route_count: 0,
                applied_version: 0,
            }));
        }

        let http_route_count = request.http_routes.len() as u32;
        let grpc_route_count = request.grpc_routes.len() as u32;

        // full replacement: swap the whole table at once
        let mut table = self.table.write().await;
        table.http_routes = request.http_routes;
        table.grpc_routes = request.grpc_routes;
        table.version = request.version;

        info!(
            version = request.version,
            http = http_route_count,
            grpc = grpc_route_count,
            "applied route table"
        );
        Ok(Response::new(UpdateRoutesResponse {
            success: true,
            error: String::new(),
            http_route_count,
            grpc_route_count,
            applied_version: request.version,
        }))
    }

    async fn get_routes(
        &self,
        _request: Request<GetRoutesRequest>,
    ) -> Result<Response<GetRoutesResponse>, Status> {
        let table = self.table.read().await;
        Ok(Response::new(GetRoutesResponse {
            http_routes: table.http_routes.clone(),
            grpc_routes: table.grpc_routes.clone(),
        }))
    }

    async fn health(
        &self,
        _request: Request<HealthRequest>,
    ) -> Result<Response<HealthResponse>, Status> {
        Ok(Response::new(HealthResponse { healthy: true }))
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let subscriber = tracing_subscriber::FmtSubscriber::new();
    tracing::subscriber::set_global_default(subscriber)?;

    let opts = Options::parse();
    let service = RouteService {
        table: Arc::new(RwLock::new(RouteTable::default())),
        fail_updates: opts.fail_updates,
    };

    let (_, health_service) = tonic_health::server::health_reporter();

    info!(listen = %opts.listen, "test proxy listening");
    Server::builder()
        .add_service(health_service)
        .add_service(RoutesServer::new(service))
        .serve(opts.listen)
        .await?;

    Ok(())
}
