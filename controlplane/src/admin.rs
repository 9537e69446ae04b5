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

use std::net::SocketAddr;
use std::sync::Arc;

use futures::future;
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Response, StatusCode};
use prometheus_client::encoding::text::encode;
use prometheus_client::registry::Registry;
use tracing::info;

use crate::{Error, Result, StartupBarrier};

// Serves the text exposition format on /metrics.
pub async fn serve_metrics(addr: SocketAddr, registry: Arc<Registry>) -> Result<()> {
    let server = hyper::server::Server::try_bind(&addr)
        .map_err(|err| Error::AdminServerError(format!("failed to bind {addr}: {err}")))?
        .serve(make_service_fn(move |_conn| {
            let registry = registry.clone();
            future::ok::<_, hyper::Error>(service_fn(move |req| {
                let registry = registry.clone();
                async move {
                    let response = match req.uri().path() {
                        "/metrics" => {
                            let mut output = String::new();
                            match encode(&mut output, &registry) {
                                Ok(()) => Response::builder()
                                    .status(StatusCode::OK)
                                    .header(
                                        hyper::header::CONTENT_TYPE,
                                        "application/openmetrics-text; version=1.0.0; charset=utf-8",
                                    )
                                    .body(Body::from(output))
                                    .unwrap(),
                                Err(_) => Response::builder()
                                    .status(StatusCode::INTERNAL_SERVER_ERROR)
                                    .body(Body::default())
                                    .unwrap(),
                            }
                        }
                        _ => Response::builder()
                            .status(StatusCode::NOT_FOUND)
                            .body(Body::default())
                            .unwrap(),
                    };
                    Ok::<_, hyper::Error>(response)
                }
            }))
        }));
    info!(%addr, "metrics server listening");
    server
        .await
        .map_err(|err| Error::AdminServerError(err.to_string()))
}

// Serves /healthz (process liveness) and /readyz (true once both route
// reconcilers have completed their startup sync).
pub async fn serve_health(addr: SocketAddr, barrier: Arc<StartupBarrier>) -> Result<()> {
    let server = hyper::server::Server::try_bind(&addr)
        .map_err(|err| Error::AdminServerError(format!("failed to bind {addr}: {err}")))?
        .serve(make_service_fn(move |_conn| {
            let barrier = barrier.clone();
            future::ok::<_, hyper::Error>(service_fn(move |req| {
                let barrier = barrier.clone();
                async move {
                    let response = match req.uri().path() {
                        "/healthz" => plain_text(StatusCode::OK, "ok\n"),
                        "/readyz" => {
                            if barrier.ready() {
                                plain_text(StatusCode::OK, "ready\n")
                            } else {
                                plain_text(StatusCode::SERVICE_UNAVAILABLE, "not ready\n")
                            }
                        }
                        _ => Response::builder()
                            .status(StatusCode::NOT_FOUND)
                            .body(Body::default())
                            .unwrap(),
                    };
                    Ok::<_, hyper::Error>(response)
                }
            }))
        }));
    info!(%addr, "health server listening");
    server
        .await
        .map_err(|err| Error::AdminServerError(err.to_string()))
}

fn plain_text(status: StatusCode, body: &'static str) -> Response<Body> {
    Response::builder()
        .status(status)
        .header(hyper::header::CONTENT_TYPE, "text/plain")
        .body(Body::from(body))
        .unwrap()
}
