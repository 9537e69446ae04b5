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

use std::collections::HashMap;
use std::{
    ops::Sub,
    sync::Arc,
    time::{Duration, Instant},
};

use crate::consts::{GATEWAY_API_GROUP, STATUS_UPDATE_MAX_RETRIES, SYNC_RETRY_SECONDS};
use crate::proxyconfig::{resolve_proxy_config, ProxyConfig};
use crate::route_utils::{
    condition, count_attached_routes, gateway_trigger_stream, preserve_transition_times,
};
use crate::*;

use futures::StreamExt;
use gateway_api::apis::standard::constants::{
    GatewayConditionReason, GatewayConditionType, ListenerConditionReason, ListenerConditionType,
};
use gateway_api::apis::standard::gateways::{
    Gateway, GatewayStatus, GatewayStatusAddresses, GatewayStatusListeners,
    GatewayStatusListenersSupportedKinds,
};
use kube::{
    api::{Api, ListParams, PostParams},
    runtime::{controller::Action, watcher::Config, Controller},
};
use tracing::{debug, info, warn};

pub async fn reconcile(gateway: Arc<Gateway>, ctx: Arc<Context>) -> Result<Action> {
    let start = Instant::now();

    // Only reconcile Gateways of the class this instance was started for.
    if gateway.spec.gateway_class_name != ctx.settings.gateway_class_name {
        return Ok(Action::await_change());
    }

    // No finalizer: the proxy keeps its last table until the route
    // reconcilers observe the deletion cascade and push a smaller one.
    if gateway.metadata.deletion_timestamp.is_some() {
        debug!("gateway is being deleted; nothing to do");
        return Ok(Action::await_change());
    }

    let key = gateway.metadata.namespaced_name()?;
    let gateway_api: Api<Gateway> = Api::namespaced(ctx.client.clone(), &key.namespace);

    let config = match resolve_proxy_config(ctx.client.clone(), &ctx.settings).await {
        Ok(config) => config,
        Err(Error::ProxyConfigError(message)) => {
            warn!(gateway = %key, %message, "cannot resolve proxy configuration");
            write_unresolved_status(&gateway_api, &key, &message).await?;
            return Ok(Action::requeue(Duration::from_secs(SYNC_RETRY_SECONDS)));
        }
        Err(err) => return Err(err),
    };

    let attached = count_attached_routes(&ctx, &gateway).await?;
    update_gateway_status(&gateway_api, &key, &config, &attached).await?;

    let duration = Instant::now().sub(start);
    info!(gateway = %key, "finished reconciling in {:?} ms", duration.as_millis());
    Ok(Action::requeue(Duration::from_secs(60)))
}

// The ProxyConfig could not be resolved: surface InvalidParameters on the
// Gateway without touching the proxy.
async fn write_unresolved_status(
    gateway_api: &Api<Gateway>,
    key: &NamespacedName,
    message: &str,
) -> Result<()> {
    let mut attempt = 0;
    loop {
        let mut gateway = match gateway_api.get(&key.name).await {
            Ok(gateway) => gateway,
            Err(kube::Error::Api(err)) if err.code == 404 => return Ok(()),
            Err(err) => return Err(Error::KubeError(err)),
        };

        let generation = gateway.metadata.generation;
        let previous = gateway.status.take();
        let mut conditions = vec![
            condition(
                &GatewayConditionType::Accepted.to_string(),
                "False",
                "InvalidParameters",
                message,
                generation,
            ),
            condition(
                &GatewayConditionType::Programmed.to_string(),
                "False",
                "Pending",
                message,
                generation,
            ),
        ];
        preserve_transition_times(
            &mut conditions,
            previous.as_ref().and_then(|status| status.conditions.as_ref()),
        );

        let mut status = previous.unwrap_or_default();
        status.conditions = Some(conditions);
        gateway.status = Some(status);

        match gateway_api
            .replace_status(
                &key.name,
                &PostParams::default(),
                serde_json::to_vec(&gateway)?,
            )
            .await
        {
            Ok(_) => return Ok(()),
            Err(kube::Error::Api(err)) if err.code == 409 && attempt < STATUS_UPDATE_MAX_RETRIES => {
                attempt += 1;
                debug!(gateway = %key, attempt, "status write conflicted; retrying");
            }
            Err(err) => return Err(Error::KubeError(err)),
        }
    }
}

// Publishes the programmed state: the proxy address, Accepted/Programmed on
// the Gateway, and a ListenerStatus with attached-route counts per listener.
async fn update_gateway_status(
    gateway_api: &Api<Gateway>,
    key: &NamespacedName,
    config: &ProxyConfig,
    attached: &HashMap<String, i32>,
) -> Result<()> {
    let mut attempt = 0;
    loop {
        let mut gateway = match gateway_api.get(&key.name).await {
            Ok(gateway) => gateway,
            Err(kube::Error::Api(err)) if err.code == 404 => return Ok(()),
            Err(err) => return Err(Error::KubeError(err)),
        };

        let generation = gateway.metadata.generation;
        let previous = gateway.status.take();

        let mut conditions = vec![
            condition(
                &GatewayConditionType::Accepted.to_string(),
                "True",
                &GatewayConditionReason::Accepted.to_string(),
                "Gateway accepted by the Pingora gateway controller",
                generation,
            ),
            condition(
                &GatewayConditionType::Programmed.to_string(),
                "True",
                &GatewayConditionReason::Programmed.to_string(),
                "Pingora proxy configured for this Gateway",
                generation,
            ),
        ];
        preserve_transition_times(
            &mut conditions,
            previous.as_ref().and_then(|status| status.conditions.as_ref()),
        );

        let mut listeners = Vec::new();
        for listener in &gateway.spec.listeners {
            let mut listener_conditions = vec![
                condition(
                    &ListenerConditionType::Accepted.to_string(),
                    "True",
                    &ListenerConditionReason::Accepted.to_string(),
                    "Listener is valid",
                    generation,
                ),
                condition(
                    &ListenerConditionType::Programmed.to_string(),
                    "True",
                    &ListenerConditionType::Programmed.to_string(),
                    "Listener is valid",
                    generation,
                ),
                condition(
                    &ListenerConditionType::ResolvedRefs.to_string(),
                    "True",
                    &ListenerConditionReason::ResolvedRefs.to_string(),
                    "All references resolved",
                    generation,
                ),
            ];
            let prior_conditions = previous
                .as_ref()
                .and_then(|status| status.listeners.as_ref())
                .and_then(|statuses| {
                    statuses
                        .iter()
                        .find(|status| status.name == listener.name)
                        .map(|status| &status.conditions)
                });
            preserve_transition_times(&mut listener_conditions, prior_conditions);

            listeners.push(GatewayStatusListeners {
                name: listener.name.clone(),
                attached_routes: attached.get(&listener.name).copied().unwrap_or(0),
                supported_kinds: vec![
                    GatewayStatusListenersSupportedKinds {
                        group: Some(GATEWAY_API_GROUP.to_string()),
                        kind: "HTTPRoute".to_string(),
                    },
                    GatewayStatusListenersSupportedKinds {
                        group: Some(GATEWAY_API_GROUP.to_string()),
                        kind: "GRPCRoute".to_string(),
                    },
                ],
                conditions: listener_conditions,
            });
        }

        gateway.status = Some(GatewayStatus {
            addresses: Some(vec![GatewayStatusAddresses {
                r#type: Some("Hostname".to_string()),
                value: config.spec.address.clone(),
            }]),
            conditions: Some(conditions),
            listeners: Some(listeners),
        });

        match gateway_api
            .replace_status(
                &key.name,
                &PostParams::default(),
                serde_json::to_vec(&gateway)?,
            )
            .await
        {
            Ok(_) => return Ok(()),
            Err(kube::Error::Api(err)) if err.code == 409 && attempt < STATUS_UPDATE_MAX_RETRIES => {
                attempt += 1;
                debug!(gateway = %key, attempt, "status write conflicted; retrying");
            }
            Err(err) => return Err(Error::KubeError(err)),
        }
    }
}

pub async fn controller(ctx: Context) -> Result<()> {
    let gateway_api = Api::<Gateway>::all(ctx.client.clone());
    gateway_api
        .list(&ListParams::default().limit(1))
        .await
        .map_err(Error::CRDNotFoundError)?;

    let triggers = gateway_trigger_stream(&ctx);

    Controller::new(gateway_api, Config::default().any_semantic())
        .reconcile_all_on(triggers)
        .shutdown_on_signal()
        .run(reconcile, error_policy, Arc::new(ctx))
        .filter_map(|x| async move { std::result::Result::ok(x) })
        .for_each(|_| futures::future::ready(()))
        .await;

    Ok(())
}

fn error_policy(_: Arc<Gateway>, error: &Error, _: Arc<Context>) -> Action {
    warn!("reconcile failed: {:?}", error);
    Action::requeue(Duration::from_secs(5))
}
