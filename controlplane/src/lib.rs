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

pub mod admin;
pub mod consts;
mod gateway_controller;
mod gatewayclass_controller;
mod grpcroute_controller;
mod httproute_controller;
mod listener_utils;
pub mod metrics;
pub mod proxyconfig;
mod reference_grants;
mod route_binding;
mod route_builder;
mod route_utils;
pub mod syncer;
mod traits;

use std::fmt::{Debug, Display, Formatter};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::Client;
use thiserror::Error;

pub use gateway_controller::controller as gateway_controller;
pub use gatewayclass_controller::controller as gatewayclass_controller;
pub use grpcroute_controller::controller as grpcroute_controller;
pub use httproute_controller::controller as httproute_controller;

// Context for our reconcilers.
#[derive(Clone)]
pub struct Context {
    /// Kubernetes client
    pub client: Client,
    /// Process-startup parameters shared by every controller.
    pub settings: Arc<Settings>,
    /// Metric families registered with the process registry.
    pub metrics: Arc<metrics::ControllerMetrics>,
    /// The one syncer both route reconcilers push through.
    pub syncer: Arc<syncer::RouteSyncer>,
    /// Startup gates for the route reconcilers.
    pub barrier: Arc<StartupBarrier>,
}

/// Runtime identity of this controller instance.
#[derive(Clone, Debug)]
pub struct Settings {
    pub gateway_class_name: String,
    pub controller_name: String,
    pub cluster_domain: String,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            gateway_class_name: consts::DEFAULT_GATEWAY_CLASS_NAME.to_string(),
            controller_name: consts::GATEWAY_CLASS_CONTROLLER_NAME.to_string(),
            cluster_domain: consts::DEFAULT_CLUSTER_DOMAIN.to_string(),
        }
    }
}

// One flag per route reconciler; set exactly once when the initial full sync
// has run (successfully or not) and never cleared. Reconciles requeue until
// their flag is up so incremental events cannot race the first push.
#[derive(Default)]
pub struct StartupBarrier {
    http_synced: AtomicBool,
    grpc_synced: AtomicBool,
}

impl StartupBarrier {
    pub fn mark_http_synced(&self) {
        self.http_synced.store(true, Ordering::SeqCst);
    }

    pub fn mark_grpc_synced(&self) {
        self.grpc_synced.store(true, Ordering::SeqCst);
    }

    pub fn http_synced(&self) -> bool {
        self.http_synced.load(Ordering::SeqCst)
    }

    pub fn grpc_synced(&self) -> bool {
        self.grpc_synced.load(Ordering::SeqCst)
    }

    pub fn ready(&self) -> bool {
        self.http_synced() && self.grpc_synced()
    }
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("kube error: {0}")]
    KubeError(#[from] kube::Error),
    #[error("invalid configuration: `{0}`")]
    InvalidConfigError(String),
    #[error("invalid proxy configuration: {0}")]
    ProxyConfigError(String),
    #[error("proxy connection error: {0}")]
    ConnectionError(String),
    #[error("proxy rejected route update: {0}")]
    PushRejectedError(String),
    #[error("invalid namespace selector: {0}")]
    InvalidSelectorError(String),
    #[error("error querying Gateway API CRDs: `{0}`; are the CRDs installed?")]
    CRDNotFoundError(#[source] kube::Error),
    #[error("serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
    #[error("admin server error: {0}")]
    AdminServerError(String),
    #[error("missing resource namespace")]
    MissingResourceNamespace,
    #[error("missing resource name")]
    MissingResourceName,
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Clone, Hash, Eq, PartialEq, PartialOrd, Ord)]
pub struct NamespacedName {
    pub name: String,
    pub namespace: String,
}

impl Display for NamespacedName {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.namespace.as_str())?;
        f.write_str("/")?;
        f.write_str(self.name.as_str())
    }
}

impl Debug for NamespacedName {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        Display::fmt(self, f)
    }
}

pub trait NamespaceName {
    fn namespace(&self) -> std::result::Result<&str, Error>;
    fn name(&self) -> std::result::Result<&str, Error>;
    fn namespaced_name(&self) -> std::result::Result<NamespacedName, Error>;
}

impl NamespaceName for ObjectMeta {
    fn namespace(&self) -> std::result::Result<&str, Error> {
        self.namespace
            .as_deref()
            .ok_or(Error::MissingResourceNamespace)
    }

    fn name(&self) -> std::result::Result<&str, Error> {
        self.name.as_deref().ok_or(Error::MissingResourceName)
    }

    fn namespaced_name(&self) -> std::result::Result<NamespacedName, Error> {
        Ok(NamespacedName {
            name: self.name()?.to_string(),
            namespace: self.namespace()?.to_string(),
        })
    }
}
