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

use std::time::Duration;

use chrono::Utc;
use gateway_api::apis::standard::gatewayclasses::GatewayClass;
use k8s_openapi::apimachinery::pkg::apis::meta::v1 as metav1;
use kube::api::{Api, Patch, PatchParams};
use kube::{Client, CustomResource};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::warn;

use crate::consts::{PINGORA_FIELD_MANAGER, PROXY_CONFIG_GROUP, PROXY_CONFIG_KIND};
use crate::{Error, Result, Settings};

/// ProxyConfig tells the controller how to reach the Pingora proxy's route
/// control channel. It is cluster-scoped and referenced from a GatewayClass
/// via parametersRef.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[kube(
    group = "pingora.dev",
    version = "v1alpha1",
    kind = "ProxyConfig",
    status = "ProxyConfigStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct ProxyConfigSpec {
    /// "host:port" of the proxy's gRPC control channel.
    pub address: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls: Option<ProxyConfigTls>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection: Option<ProxyConfigConnection>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ProxyConfigTls {
    #[serde(default)]
    pub enabled: bool,
    /// Secret holding "tls.crt" and "tls.key" for mutual auth, and
    /// optionally "ca.crt" for server verification.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_ref: Option<ProxyConfigSecretRef>,
    #[serde(default)]
    pub insecure_skip_verify: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_name: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ProxyConfigSecretRef {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ProxyConfigConnection {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connect_timeout_seconds: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_timeout_seconds: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keepalive_time_seconds: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_backoff_ms: Option<u64>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ProxyConfigStatus {
    #[serde(default)]
    pub connected: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_sync_time: Option<metav1::Time>,
    #[serde(default)]
    pub config_version: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conditions: Option<Vec<metav1::Condition>>,
}

impl ProxyConfig {
    pub fn connect_timeout(&self) -> Duration {
        let seconds = self
            .connection()
            .and_then(|connection| connection.connect_timeout_seconds)
            .unwrap_or(5)
            .max(1);
        Duration::from_secs(seconds.into())
    }

    pub fn request_timeout(&self) -> Duration {
        let seconds = self
            .connection()
            .and_then(|connection| connection.request_timeout_seconds)
            .unwrap_or(30)
            .max(1);
        Duration::from_secs(seconds.into())
    }

    pub fn keepalive_time(&self) -> Duration {
        let seconds = self
            .connection()
            .and_then(|connection| connection.keepalive_time_seconds)
            .unwrap_or(30)
            .max(10);
        Duration::from_secs(seconds.into())
    }

    pub fn max_retries(&self) -> u32 {
        self.connection()
            .and_then(|connection| connection.max_retries)
            .unwrap_or(3)
    }

    pub fn retry_backoff(&self) -> Duration {
        let millis = self
            .connection()
            .and_then(|connection| connection.retry_backoff_ms)
            .unwrap_or(1000)
            .max(100);
        Duration::from_millis(millis)
    }

    fn connection(&self) -> Option<&ProxyConfigConnection> {
        self.spec.connection.as_ref()
    }
}

// Resolves the ProxyConfig bound to the configured GatewayClass: the class
// must exist, carry our controller name, and its parametersRef must point at
// a ProxyConfig with a non-empty address.
pub async fn resolve_proxy_config(client: Client, settings: &Settings) -> Result<ProxyConfig> {
    let gatewayclass_api = Api::<GatewayClass>::all(client.clone());
    let gateway_class = gatewayclass_api
        .get(&settings.gateway_class_name)
        .await
        .map_err(|err| {
            Error::ProxyConfigError(format!(
                "GatewayClass {:?} not found: {err}",
                settings.gateway_class_name
            ))
        })?;

    if gateway_class.spec.controller_name != settings.controller_name {
        return Err(Error::ProxyConfigError(format!(
            "GatewayClass {:?} belongs to controller {:?}",
            settings.gateway_class_name, gateway_class.spec.controller_name
        )));
    }

    let parameters_ref = gateway_class.spec.parameters_ref.as_ref().ok_or_else(|| {
        Error::ProxyConfigError(format!(
            "GatewayClass {:?} has no parametersRef",
            settings.gateway_class_name
        ))
    })?;

    if parameters_ref.group != PROXY_CONFIG_GROUP || parameters_ref.kind != PROXY_CONFIG_KIND {
        return Err(Error::ProxyConfigError(format!(
            "parametersRef must point at {PROXY_CONFIG_GROUP}/{PROXY_CONFIG_KIND}, found {}/{}",
            parameters_ref.group, parameters_ref.kind
        )));
    }

    let config_api = Api::<ProxyConfig>::all(client);
    let config = config_api.get(&parameters_ref.name).await.map_err(|err| {
        Error::ProxyConfigError(format!(
            "ProxyConfig {:?} not found: {err}",
            parameters_ref.name
        ))
    })?;

    if config.spec.address.trim().is_empty() {
        return Err(Error::ProxyConfigError(format!(
            "ProxyConfig {:?} has an empty address",
            parameters_ref.name
        )));
    }

    Ok(config)
}

// Records the outcome of a push attempt on the ProxyConfig status. Failures
// here are logged and swallowed; route syncing must not depend on it.
pub async fn record_sync_status(
    client: Client,
    config_name: &str,
    connected: bool,
    applied_version: Option<u64>,
    message: &str,
) {
    let config_api = Api::<ProxyConfig>::all(client);

    let condition = metav1::Condition {
        type_: "Ready".to_string(),
        status: if connected { "True" } else { "False" }.to_string(),
        reason: if connected { "Synced" } else { "SyncFailed" }.to_string(),
        message: message.to_string(),
        observed_generation: None,
        last_transition_time: metav1::Time(Utc::now()),
    };

    let mut status = json!({
        "connected": connected,
        "lastSyncTime": metav1::Time(Utc::now()),
        "conditions": [condition],
    });
    if let Some(version) = applied_version {
        status["configVersion"] = json!(version);
    }

    let patch = Patch::Apply(json!({
        "apiVersion": "pingora.dev/v1alpha1",
        "kind": "ProxyConfig",
        "status": status,
    }));
    let params = PatchParams::apply(PINGORA_FIELD_MANAGER).force();
    if let Err(error) = config_api
        .patch_status(config_name, &params, &patch)
        .await
    {
        warn!(%error, config = config_name, "failed to update ProxyConfig status");
    }
}
