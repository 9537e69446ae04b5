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

// Exercises the push discipline against a real in-process gRPC server: one
// serialized push sequence, strictly increasing versions, and the proxy
// echoing the version it applied.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tonic::transport::Server;
use tonic::{Request, Response, Status};

use routes::routes::routes_client::RoutesClient;
use routes::routes::routes_server::{Routes, RoutesServer};
use routes::routes::{
    GetRoutesRequest, GetRoutesResponse, HealthRequest, HealthResponse, HttpRoute,
    UpdateRoutesRequest, UpdateRoutesResponse,
};

#[derive(Default)]
struct EchoProxy {
    applied: Mutex<Vec<u64>>,
    table: Mutex<(Vec<HttpRoute>, Vec<routes::routes::GrpcRoute>)>,
    fail_updates: bool,
}

#[tonic::async_trait]
impl Routes for EchoProxy {
    async fn update_routes(
        &self,
        request: Request<UpdateRoutesRequest>,
    ) -> Result<Response<UpdateRoutesResponse>, Status> {
        let request = request.into_inner();

        if self.fail_updates {
            return Ok(Response::new(UpdateRoutesResponse {
                success: false,
                error: "route table locked".to_string(),
                http_route_count: 0,
                grpc_route_count: 0,
                applied_version: 0,
            }));
        }

        let http_route_count = request.http_routes.len() as u32;
        let grpc_route_count = request.grpc_routes.len() as u32;

        self.applied.lock().await.push(request.version);
        *self.table.lock().await = (request.http_routes, request.grpc_routes);

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
        let table = self.table.lock().await;
        Ok(Response::new(GetRoutesResponse {
            http_routes: table.0.clone(),
            grpc_routes: table.1.clone(),
        }))
    }

    async fn health(
        &self,
        _request: Request<HealthRequest>,
    ) -> Result<Response<HealthResponse>, Status> {
        Ok(Response::new(HealthResponse { healthy: true }))
    }
}

async fn spawn_proxy(proxy: Arc<EchoProxy>) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("listener should bind");
    let addr = listener.local_addr().expect("listener has an address");

    let incoming = futures::stream::unfold(listener, |listener| async move {
        let accepted = listener.accept().await.map(|(stream, _)| stream);
        Some((accepted, listener))
    });

    tokio::spawn(async move {
        Server::builder()
            .add_service(RoutesServer::from_arc(proxy))
            .serve_with_incoming(incoming)
            .await
            .expect("server should run");
    });

    addr
}

#[tokio::test]
async fn concurrent_pushes_observe_strictly_increasing_versions() {
    let proxy = Arc::new(EchoProxy::default());
    let addr = spawn_proxy(proxy.clone()).await;

    let client = RoutesClient::connect(format!("http://{addr}"))
        .await
        .expect("client should connect");

    // the syncer's discipline: one outer mutex, one atomic version counter
    let sync_lock = Arc::new(Mutex::new(client));
    let version = Arc::new(AtomicU64::new(0));

    let mut tasks = Vec::new();
    for _ in 0..100 {
        let sync_lock = sync_lock.clone();
        let version = version.clone();
        tasks.push(tokio::spawn(async move {
            let mut client = sync_lock.lock().await;
            let version = version.fetch_add(1, Ordering::SeqCst) + 1;
            let reply = client
                .update_routes(UpdateRoutesRequest {
                    http_routes: vec![],
                    grpc_routes: vec![],
                    version,
                })
                .await
                .expect("push should succeed")
                .into_inner();
            assert!(reply.success);
            assert_eq!(reply.applied_version, version);
        }));
    }
    for task in tasks {
        task.await.expect("task should not panic");
    }

    let applied = proxy.applied.lock().await;
    assert_eq!(applied.len(), 100);
    for window in applied.windows(2) {
        assert!(window[0] < window[1], "versions must strictly increase");
    }
}

#[tokio::test]
async fn pushed_tables_replace_each_other() {
    let proxy = Arc::new(EchoProxy::default());
    let addr = spawn_proxy(proxy.clone()).await;

    let mut client = RoutesClient::connect(format!("http://{addr}"))
        .await
        .expect("client should connect");

    let route = HttpRoute {
        id: "ns/r1".to_string(),
        hostnames: vec!["example.com".to_string()],
        rules: vec![],
    };
    let reply = client
        .update_routes(UpdateRoutesRequest {
            http_routes: vec![route.clone()],
            grpc_routes: vec![],
            version: 1,
        })
        .await
        .expect("push should succeed")
        .into_inner();
    assert_eq!(reply.http_route_count, 1);

    let table = client
        .get_routes(GetRoutesRequest {})
        .await
        .expect("get should succeed")
        .into_inner();
    assert_eq!(table.http_routes, vec![route]);

    // an empty push wipes the table
    client
        .update_routes(UpdateRoutesRequest {
            http_routes: vec![],
            grpc_routes: vec![],
            version: 2,
        })
        .await
        .expect("push should succeed");
    let table = client
        .get_routes(GetRoutesRequest {})
        .await
        .expect("get should succeed")
        .into_inner();
    assert!(table.http_routes.is_empty());
}

#[tokio::test]
async fn rejected_pushes_surface_the_remote_error() {
    let proxy = Arc::new(EchoProxy {
        fail_updates: true,
        ..EchoProxy::default()
    });
    let addr = spawn_proxy(proxy).await;

    let mut client = RoutesClient::connect(format!("http://{addr}"))
        .await
        .expect("client should connect");

    let reply = client
        .update_routes(UpdateRoutesRequest {
            http_routes: vec![],
            grpc_routes: vec![],
            version: 7,
        })
        .await
        .expect("transport should succeed")
        .into_inner();
    assert!(!reply.success);
    assert_eq!(reply.error, "route table locked");
    assert_ne!(reply.applied_version, 7);
}
