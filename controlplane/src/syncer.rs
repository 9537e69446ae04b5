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

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use gateway_api::apis::experimental::grpcroutes::GRPCRoute;
use gateway_api::apis::standard::gateways::Gateway;
use gateway_api::apis::experimental::httproutes::HTTPRoute;
use k8s_openapi::api::core::v1::{Namespace, Secret};
use k8s_openapi::ByteString;
use kube::api::{Api, ListParams};
use kube::{Client, ResourceExt};
use tokio::sync::{Mutex, RwLock};
use tonic::transport::{Certificate, Channel, ClientTlsConfig, Endpoint, Identity};
use tonic::Request;
use tracing::{debug, info, warn};

use routes::routes as proto;
use routes::routes::routes_client::RoutesClient;

use crate::consts::{TLS_CA_KEY, TLS_CERT_KEY, TLS_PRIVATE_KEY_KEY};
use crate::metrics::ControllerMetrics;
use crate::proxyconfig::{self, ProxyConfig, ProxyConfigTls};
use crate::route_binding::{evaluate_route_parents, BindingResult};
use crate::route_builder::{build_grpc_route, build_http_route};
use crate::{Error, NamespaceName, NamespacedName, Result, Settings};

// Everything one sync reads from the cluster before deciding what to push.
pub(crate) struct ClusterState {
    pub gateways: Vec<Gateway>,
    pub http_routes: Vec<HTTPRoute>,
    pub grpc_routes: Vec<GRPCRoute>,
    pub namespace_labels: HashMap<String, BTreeMap<String, String>>,
}

// The outcome of one SyncAll: the accepted routes that reached the proxy and
// the per-route, per-parent binding results the status writers consume. Held
// only for the duration of the caller's status-write pass.
#[derive(Default)]
pub struct SyncSnapshot {
    pub http_routes: Vec<HTTPRoute>,
    pub grpc_routes: Vec<GRPCRoute>,
    pub http_results: HashMap<NamespacedName, BTreeMap<usize, BindingResult>>,
    pub grpc_results: HashMap<NamespacedName, BTreeMap<usize, BindingResult>>,
    pub version: Option<u64>,
    pub push_error: Option<String>,
}

// Evaluates bindings for every route cluster-wide. A route enters the pushed
// set iff at least one parent accepts it; it gets a results entry iff at
// least one parent-ref resolves to a Gateway of the configured class.
pub(crate) fn build_snapshot(state: &ClusterState, settings: &Settings) -> Result<SyncSnapshot> {
    let gateways: HashMap<NamespacedName, Gateway> = state
        .gateways
        .iter()
        .filter_map(|gateway| {
            gateway
                .metadata
                .namespaced_name()
                .ok()
                .map(|key| (key, gateway.clone()))
        })
        .collect();

    let mut snapshot = SyncSnapshot::default();

    for route in &state.http_routes {
        let key = match route.metadata.namespaced_name() {
            Ok(key) => key,
            Err(_) => continue,
        };
        let results = evaluate_route_parents(
            route,
            &gateways,
            &settings.gateway_class_name,
            &state.namespace_labels,
        )?;
        if results.is_empty() {
            continue;
        }
        if results.values().any(|result| result.accepted) {
            snapshot.http_routes.push(route.clone());
        }
        snapshot.http_results.insert(key, results);
    }

    for route in &state.grpc_routes {
        let key = match route.metadata.namespaced_name() {
            Ok(key) => key,
            Err(_) => continue,
        };
        let results = evaluate_route_parents(
            route,
            &gateways,
            &settings.gateway_class_name,
            &state.namespace_labels,
        )?;
        if results.is_empty() {
            continue;
        }
        if results.values().any(|result| result.accepted) {
            snapshot.grpc_routes.push(route.clone());
        }
        snapshot.grpc_results.insert(key, results);
    }

    // identical cluster state must serialize to an identical payload
    snapshot.http_routes.sort_by_key(route_sort_key);
    snapshot.grpc_routes.sort_by_key(route_sort_key);

    Ok(snapshot)
}

fn route_sort_key<R: kube::Resource>(route: &R) -> String {
    format!(
        "{}/{}",
        route.meta().namespace.as_deref().unwrap_or_default(),
        route.meta().name.as_deref().unwrap_or_default()
    )
}

struct ProxyChannel {
    client: RoutesClient<Channel>,
    config_name: String,
}

// Owns the one connection to the proxy and the version clock. Both route
// reconcilers push through the same instance; sync_all is serialized by
// `sync_lock`, which is strictly coarser than the connection lock and held
// across snapshot, push and result materialization.
pub struct RouteSyncer {
    client: Client,
    settings: Arc<Settings>,
    metrics: Arc<ControllerMetrics>,
    sync_lock: Mutex<()>,
    proxy: RwLock<Option<ProxyChannel>>,
    version: AtomicU64,
    credential_secret: std::sync::RwLock<Option<NamespacedName>>,
}

impl RouteSyncer {
    pub fn new(client: Client, settings: Arc<Settings>, metrics: Arc<ControllerMetrics>) -> Self {
        RouteSyncer {
            client,
            settings,
            metrics,
            sync_lock: Mutex::new(()),
            proxy: RwLock::new(None),
            version: AtomicU64::new(0),
            credential_secret: std::sync::RwLock::new(None),
        }
    }

    // Resolves the ProxyConfig bound to the configured class and opens a
    // client to the proxy, replacing any previous handle.
    pub async fn connect(&self) -> Result<()> {
        let config = proxyconfig::resolve_proxy_config(self.client.clone(), &self.settings).await?;
        let channel = self.dial(&config).await?;
        let config_name = config.name_any();
        info!(address = %config.spec.address, config = %config_name, "connected to proxy");

        let mut proxy = self.proxy.write().await;
        *proxy = Some(ProxyChannel {
            client: RoutesClient::new(channel),
            config_name,
        });
        Ok(())
    }

    pub async fn close(&self) {
        let mut proxy = self.proxy.write().await;
        if proxy.take().is_some() {
            debug!("dropped proxy connection");
        }
    }

    pub async fn is_connected(&self) -> bool {
        self.proxy.read().await.is_some()
    }

    // True when the given Secret is the credential secret of the ProxyConfig
    // we are currently connected with. Used to filter Secret watch events.
    pub fn is_credential_secret(&self, secret: &Secret) -> bool {
        let key = match secret.metadata.namespaced_name() {
            Ok(key) => key,
            Err(_) => return false,
        };
        self.credential_secret
            .read()
            .map(|guard| guard.as_ref() == Some(&key))
            .unwrap_or(false)
    }

    // One full reconcile of the proxy's route table: snapshot the cluster,
    // push the complete table under a fresh version, and hand the binding
    // results back for status writing. Connection and push failures are
    // reported in the snapshot so callers can surface them on route statuses
    // and requeue.
    pub async fn sync_all(&self) -> Result<SyncSnapshot> {
        let _sync = self.sync_lock.lock().await;
        let start = Instant::now();

        let state = match self.gather_state().await {
            Ok(state) => state,
            Err(err) => {
                self.metrics.record_sync_duration("error", start.elapsed());
                return Err(err);
            }
        };
        let mut snapshot = build_snapshot(&state, &self.settings)?;

        let wire_http = snapshot
            .http_routes
            .iter()
            .map(|route| build_http_route(route, &self.settings.cluster_domain))
            .collect::<Result<Vec<_>>>()?;
        let wire_grpc = snapshot
            .grpc_routes
            .iter()
            .map(|route| build_grpc_route(route, &self.settings.cluster_domain))
            .collect::<Result<Vec<_>>>()?;

        if !self.is_connected().await {
            if let Err(err) = self.connect().await {
                self.metrics.record_sync_error("connection_failed");
                self.metrics.record_sync_duration("error", start.elapsed());
                warn!(error = %err, "cannot reach proxy; sync deferred");
                snapshot.push_error = Some(err.to_string());
                return Ok(snapshot);
            }
        }
        let config_name = self.config_name().await;

        // The version is bumped once per attempted push and never given
        // back; the proxy is free to ignore versions that never applied.
        let version = self.version.fetch_add(1, Ordering::SeqCst) + 1;
        snapshot.version = Some(version);
        let http_count = wire_http.len();
        let grpc_count = wire_grpc.len();

        match self.push(wire_http, wire_grpc, version).await {
            Ok(()) => {
                self.metrics.set_synced_routes("http", http_count as i64);
                self.metrics.set_synced_routes("grpc", grpc_count as i64);
                self.metrics.record_sync_duration("success", start.elapsed());
                info!(version, http = http_count, grpc = grpc_count, "route table pushed");
                if let Some(name) = &config_name {
                    proxyconfig::record_sync_status(
                        self.client.clone(),
                        name,
                        true,
                        Some(version),
                        "route table applied",
                    )
                    .await;
                }
            }
            Err(err) => {
                self.close().await;
                self.metrics.record_sync_duration("error", start.elapsed());
                warn!(error = %err, version, "route table push failed");
                if let Some(name) = &config_name {
                    proxyconfig::record_sync_status(
                        self.client.clone(),
                        name,
                        false,
                        None,
                        &err.to_string(),
                    )
                    .await;
                }
                snapshot.push_error = Some(err.to_string());
            }
        }

        Ok(snapshot)
    }

    async fn config_name(&self) -> Option<String> {
        self.proxy
            .read()
            .await
            .as_ref()
            .map(|channel| channel.config_name.clone())
    }

    async fn push(
        &self,
        http_routes: Vec<proto::HttpRoute>,
        grpc_routes: Vec<proto::GrpcRoute>,
        version: u64,
    ) -> Result<()> {
        // hold the read side for the duration of the call
        let proxy = self.proxy.read().await;
        let channel = match proxy.as_ref() {
            Some(channel) => channel,
            None => {
                self.metrics.record_sync_error("not_connected");
                return Err(Error::ConnectionError(
                    "not connected to the proxy".to_string(),
                ));
            }
        };
        let mut client = channel.client.clone();

        let request = proto::UpdateRoutesRequest {
            http_routes,
            grpc_routes,
            version,
        };
        let started = Instant::now();
        match client.update_routes(Request::new(request)).await {
            Ok(response) => {
                self.metrics
                    .record_grpc_call("UpdateRoutes", "ok", started.elapsed());
                let reply = response.into_inner();
                if !reply.success {
                    self.metrics.record_sync_error("update_failed");
                    let message = if reply.error.is_empty() {
                        "proxy reported failure".to_string()
                    } else {
                        reply.error
                    };
                    return Err(Error::PushRejectedError(message));
                }
                if reply.applied_version != version {
                    self.metrics.record_sync_error("update_failed");
                    return Err(Error::PushRejectedError(format!(
                        "proxy applied version {} for push {version}",
                        reply.applied_version
                    )));
                }
                debug!(
                    http = reply.http_route_count,
                    grpc = reply.grpc_route_count,
                    "proxy confirmed route table"
                );
                Ok(())
            }
            Err(status) => {
                self.metrics
                    .record_grpc_call("UpdateRoutes", "error", started.elapsed());
                self.metrics.record_sync_error("grpc_error");
                Err(Error::ConnectionError(format!(
                    "UpdateRoutes failed: {status}"
                )))
            }
        }
    }

    async fn gather_state(&self) -> Result<ClusterState> {
        let gateway_api = Api::<Gateway>::all(self.client.clone());
        let gateways: Vec<Gateway> = gateway_api
            .list(&ListParams::default())
            .await
            .map_err(Error::KubeError)?
            .items
            .into_iter()
            .filter(|gateway| {
                gateway.spec.gateway_class_name == self.settings.gateway_class_name
            })
            .collect();

        let http_routes = Api::<HTTPRoute>::all(self.client.clone())
            .list(&ListParams::default())
            .await
            .map_err(Error::KubeError)?
            .items;
        let grpc_routes = Api::<GRPCRoute>::all(self.client.clone())
            .list(&ListParams::default())
            .await
            .map_err(Error::KubeError)?
            .items;

        // namespace labels back the Selector namespace policy
        let mut namespaces: HashSet<String> = HashSet::new();
        for route in &http_routes {
            if let Some(namespace) = &route.metadata.namespace {
                namespaces.insert(namespace.clone());
            }
        }
        for route in &grpc_routes {
            if let Some(namespace) = &route.metadata.namespace {
                namespaces.insert(namespace.clone());
            }
        }

        let namespace_api = Api::<Namespace>::all(self.client.clone());
        let mut namespace_labels = HashMap::new();
        for namespace in namespaces {
            match namespace_api.get(&namespace).await {
                Ok(object) => {
                    namespace_labels
                        .insert(namespace, object.metadata.labels.unwrap_or_default());
                }
                Err(kube::Error::Api(err)) if err.code == 404 => {}
                Err(err) => return Err(Error::KubeError(err)),
            }
        }

        Ok(ClusterState {
            gateways,
            http_routes,
            grpc_routes,
            namespace_labels,
        })
    }

    async fn dial(&self, config: &ProxyConfig) -> Result<Channel> {
        let address = config.spec.address.trim();
        let tls = config.spec.tls.as_ref().filter(|tls| tls.enabled);
        let scheme = if tls.is_some() { "https" } else { "http" };

        let mut endpoint = Endpoint::from_shared(format!("{scheme}://{address}"))
            .map_err(|err| {
                Error::ConnectionError(format!("invalid proxy address {address:?}: {err}"))
            })?
            .connect_timeout(config.connect_timeout())
            .timeout(config.request_timeout())
            .http2_keep_alive_interval(config.keepalive_time());

        if let Some(tls) = tls {
            endpoint = endpoint
                .tls_config(self.build_tls_config(tls).await?)
                .map_err(|err| {
                    Error::ConnectionError(format!("invalid TLS configuration: {err}"))
                })?;
        } else if let Ok(mut guard) = self.credential_secret.write() {
            *guard = None;
        }

        let mut attempt = 0;
        loop {
            match endpoint.connect().await {
                Ok(channel) => return Ok(channel),
                Err(err) if attempt < config.max_retries() => {
                    attempt += 1;
                    warn!(error = %err, attempt, "proxy dial failed; retrying");
                    tokio::time::sleep(config.retry_backoff()).await;
                }
                Err(err) => {
                    return Err(Error::ConnectionError(format!(
                        "failed to dial proxy at {address}: {err}"
                    )));
                }
            }
        }
    }

    async fn build_tls_config(&self, tls: &ProxyConfigTls) -> Result<ClientTlsConfig> {
        let secret_data = match &tls.secret_ref {
            Some(secret_ref) => {
                let namespace = secret_ref
                    .namespace
                    .clone()
                    .unwrap_or_else(|| "default".to_string());
                let secret_api: Api<Secret> = Api::namespaced(self.client.clone(), &namespace);
                let secret = secret_api.get(&secret_ref.name).await.map_err(|err| {
                    Error::ConnectionError(format!(
                        "failed to read credential secret {namespace}/{}: {err}",
                        secret_ref.name
                    ))
                })?;
                if let Ok(mut guard) = self.credential_secret.write() {
                    *guard = Some(NamespacedName {
                        name: secret_ref.name.clone(),
                        namespace,
                    });
                }
                Some(secret.data.unwrap_or_default())
            }
            None => None,
        };
        tls_config_from_secret(tls, secret_data.as_ref())
    }
}

// Assembles the tonic client TLS settings from the ProxyConfig TLS block and
// the credential secret's entries.
pub fn tls_config_from_secret(
    tls: &ProxyConfigTls,
    secret_data: Option<&BTreeMap<String, ByteString>>,
) -> Result<ClientTlsConfig> {
    let mut tls_config = ClientTlsConfig::new();

    if tls.insecure_skip_verify {
        // rustls offers no verification bypass through tonic's transport
        warn!("insecureSkipVerify is not supported; the proxy certificate will be verified");
    }

    if let Some(server_name) = &tls.server_name {
        tls_config = tls_config.domain_name(server_name.clone());
    }

    if let Some(data) = secret_data {
        let certificate = data.get(TLS_CERT_KEY).ok_or_else(|| {
            Error::ConnectionError(format!("credential secret is missing {TLS_CERT_KEY:?}"))
        })?;
        let private_key = data.get(TLS_PRIVATE_KEY_KEY).ok_or_else(|| {
            Error::ConnectionError(format!(
                "credential secret is missing {TLS_PRIVATE_KEY_KEY:?}"
            ))
        })?;
        tls_config = tls_config.identity(Identity::from_pem(&certificate.0, &private_key.0));

        if let Some(ca_certificate) = data.get(TLS_CA_KEY) {
            tls_config = tls_config.ca_certificate(Certificate::from_pem(&ca_certificate.0));
        }
    }

    Ok(tls_config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn gateway(name: &str, namespace: &str, class: &str, listeners: serde_json::Value) -> Gateway {
        serde_json::from_value(json!({
            "apiVersion": "gateway.networking.k8s.io/v1",
            "kind": "Gateway",
            "metadata": { "name": name, "namespace": namespace },
            "spec": { "gatewayClassName": class, "listeners": listeners },
        }))
        .expect("gateway should deserialize")
    }

    fn http_route(
        name: &str,
        namespace: &str,
        hostnames: serde_json::Value,
        parent_refs: serde_json::Value,
    ) -> HTTPRoute {
        serde_json::from_value(json!({
            "apiVersion": "gateway.networking.k8s.io/v1",
            "kind": "HTTPRoute",
            "metadata": { "name": name, "namespace": namespace },
            "spec": {
                "hostnames": hostnames,
                "parentRefs": parent_refs,
                "rules": [{ "backendRefs": [{ "name": "svc", "port": 80 }] }],
            },
        }))
        .expect("route should deserialize")
    }

    fn settings() -> Settings {
        Settings {
            gateway_class_name: "pingora".to_string(),
            ..Settings::default()
        }
    }

    fn listener() -> serde_json::Value {
        json!([{ "name": "http", "port": 80, "protocol": "HTTP" }])
    }

    #[test]
    fn routes_without_managed_parents_are_invisible() {
        let state = ClusterState {
            gateways: vec![gateway("gw", "ns", "other-class", listener())],
            http_routes: vec![http_route(
                "r1",
                "ns",
                json!(["example.com"]),
                json!([{ "name": "gw" }]),
            )],
            grpc_routes: Vec::new(),
            namespace_labels: HashMap::new(),
        };

        let snapshot = build_snapshot(&state, &settings()).unwrap();
        assert!(snapshot.http_routes.is_empty());
        assert!(snapshot.http_results.is_empty());
    }

    #[test]
    fn an_accepted_route_appears_exactly_once() {
        // two listeners match, the route still ships once
        let state = ClusterState {
            gateways: vec![gateway(
                "gw",
                "ns",
                "pingora",
                json!([
                    { "name": "a", "port": 80, "protocol": "HTTP" },
                    { "name": "b", "port": 8080, "protocol": "HTTP" }
                ]),
            )],
            http_routes: vec![http_route(
                "r1",
                "ns",
                json!(["example.com"]),
                json!([{ "name": "gw" }]),
            )],
            grpc_routes: Vec::new(),
            namespace_labels: HashMap::new(),
        };

        let snapshot = build_snapshot(&state, &settings()).unwrap();
        assert_eq!(snapshot.http_routes.len(), 1);

        let key = NamespacedName {
            name: "r1".to_string(),
            namespace: "ns".to_string(),
        };
        let results = &snapshot.http_results[&key];
        assert_eq!(results.len(), 1);
        let result = &results[&0];
        assert!(result.accepted);
        assert_eq!(result.matched_listeners, vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn rejected_routes_keep_their_results_but_are_not_pushed() {
        let state = ClusterState {
            gateways: vec![gateway(
                "gw",
                "ns",
                "pingora",
                json!([{ "name": "http", "port": 80, "protocol": "HTTP", "hostname": "*.example.com" }]),
            )],
            http_routes: vec![http_route(
                "r1",
                "ns",
                json!(["other.com"]),
                json!([{ "name": "gw" }]),
            )],
            grpc_routes: Vec::new(),
            namespace_labels: HashMap::new(),
        };

        let snapshot = build_snapshot(&state, &settings()).unwrap();
        assert!(snapshot.http_routes.is_empty());
        let key = NamespacedName {
            name: "r1".to_string(),
            namespace: "ns".to_string(),
        };
        assert!(!snapshot.http_results[&key][&0].accepted);
    }

    #[test]
    fn per_parent_results_stay_independent() {
        let state = ClusterState {
            gateways: vec![
                gateway("gw-a", "ns", "pingora", listener()),
                gateway(
                    "gw-b",
                    "ns",
                    "pingora",
                    json!([{ "name": "http", "port": 80, "protocol": "HTTP", "hostname": "*.b.com" }]),
                ),
            ],
            http_routes: vec![http_route(
                "r1",
                "ns",
                json!(["example.com"]),
                json!([{ "name": "gw-a" }, { "name": "gw-b" }]),
            )],
            grpc_routes: Vec::new(),
            namespace_labels: HashMap::new(),
        };

        let snapshot = build_snapshot(&state, &settings()).unwrap();
        let key = NamespacedName {
            name: "r1".to_string(),
            namespace: "ns".to_string(),
        };
        let results = &snapshot.http_results[&key];
        assert!(results[&0].accepted);
        assert!(!results[&1].accepted);
        // accepted somewhere, so it ships
        assert_eq!(snapshot.http_routes.len(), 1);
    }

    #[test]
    fn snapshot_ordering_is_stable() {
        let routes = vec![
            http_route("zeta", "ns", json!([]), json!([{ "name": "gw" }])),
            http_route("alpha", "ns", json!([]), json!([{ "name": "gw" }])),
            http_route("mid", "a-ns", json!([]), json!([{ "name": "gw", "namespace": "ns" }])),
        ];
        let state = ClusterState {
            gateways: vec![gateway(
                "gw",
                "ns",
                "pingora",
                json!([{ "name": "http", "port": 80, "protocol": "HTTP",
                         "allowedRoutes": { "namespaces": { "from": "All" } } }]),
            )],
            http_routes: routes,
            grpc_routes: Vec::new(),
            namespace_labels: HashMap::new(),
        };

        let first = build_snapshot(&state, &settings()).unwrap();
        let second = build_snapshot(&state, &settings()).unwrap();

        let ids = |snapshot: &SyncSnapshot| {
            snapshot
                .http_routes
                .iter()
                .map(|route| route_sort_key(route))
                .collect::<Vec<_>>()
        };
        assert_eq!(ids(&first), ids(&second));
        assert_eq!(
            ids(&first),
            vec!["a-ns/mid".to_string(), "ns/alpha".to_string(), "ns/zeta".to_string()]
        );
    }

    #[test]
    fn tls_config_requires_cert_and_key_entries() {
        let tls = ProxyConfigTls {
            enabled: true,
            secret_ref: None,
            insecure_skip_verify: false,
            server_name: Some("proxy.internal".to_string()),
        };
        // no secret at all is fine: server-side TLS only
        assert!(tls_config_from_secret(&tls, None).is_ok());

        let mut data = BTreeMap::new();
        data.insert(
            TLS_CERT_KEY.to_string(),
            ByteString(b"not-really-a-cert".to_vec()),
        );
        // key missing
        assert!(matches!(
            tls_config_from_secret(&tls, Some(&data)),
            Err(Error::ConnectionError(_))
        ));

        data.insert(
            TLS_PRIVATE_KEY_KEY.to_string(),
            ByteString(b"not-really-a-key".to_vec()),
        );
        assert!(tls_config_from_secret(&tls, Some(&data)).is_ok());
    }
}
