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

use futures::StreamExt;
use std::{
    ops::Sub,
    sync::Arc,
    time::{Duration, Instant},
};

use crate::consts::{PINGORA_FIELD_MANAGER, PROXY_CONFIG_GROUP, PROXY_CONFIG_KIND};
use crate::route_utils::set_condition;
use crate::*;

use chrono::Utc;
use gateway_api::apis::standard::constants::{GatewayConditionReason, GatewayConditionType};
use gateway_api::apis::standard::gatewayclasses::{GatewayClass, GatewayClassStatus};
use k8s_openapi::apimachinery::pkg::apis::meta::v1 as metav1;
use kube::api::{Api, ListParams, Patch, PatchParams};
use kube::runtime::{controller::Action, watcher::Config, Controller};
use serde_json::json;
use tracing::*;

pub async fn reconcile(gateway_class: Arc<GatewayClass>, ctx: Arc<Context>) -> Result<Action> {
    let start = Instant::now();
    let client = ctx.client.clone();
    let name = gateway_class
        .metadata
        .name
        .clone()
        .ok_or(Error::InvalidConfigError("invalid name".to_string()))?;

    let gatewayclass_api = Api::<GatewayClass>::all(client);
    let mut gwc = GatewayClass {
        metadata: gateway_class.metadata.clone(),
        spec: gateway_class.spec.clone(),
        status: gateway_class.status.clone(),
    };

    if gateway_class.spec.controller_name != ctx.settings.controller_name {
        // Skip reconciling because we don't manage this resource
        return Ok(Action::requeue(Duration::from_secs(3600 / 2)));
    }

    // The class must hand us a ProxyConfig; anything else is a
    // configuration error the user has to see.
    let accepted = accepted_condition(&gateway_class);
    if current_condition_status(&gateway_class) != Some(accepted.status.clone()) {
        info!(class = %name, status = %accepted.status, "updating GatewayClass acceptance");
        set_condition(&mut gwc, accepted);
        patch_status(&gatewayclass_api, name.clone(), &gwc.status.unwrap_or_default()).await?;
    }

    let duration = Instant::now().sub(start);
    info!("finished reconciling in {:?} ms", duration.as_millis());
    Ok(Action::await_change())
}

fn current_condition_status(gateway_class: &GatewayClass) -> Option<String> {
    let conditions = gateway_class.status.as_ref()?.conditions.as_ref()?;
    conditions
        .iter()
        .find(|condition| condition.type_ == GatewayConditionType::Accepted.to_string())
        .map(|condition| condition.status.clone())
}

// Accepts the class when its parametersRef points at one of our
// ProxyConfigs; otherwise reports InvalidParameters.
fn accepted_condition(gateway_class: &GatewayClass) -> metav1::Condition {
    let now = metav1::Time(Utc::now());
    let mut accepted = metav1::Condition {
        type_: GatewayConditionType::Accepted.to_string(),
        status: String::from("True"),
        reason: GatewayConditionReason::Accepted.to_string(),
        observed_generation: gateway_class.metadata.generation,
        last_transition_time: now,
        message: String::from("GatewayClass accepted by the Pingora gateway controller"),
    };

    match &gateway_class.spec.parameters_ref {
        Some(parameters_ref) => {
            if parameters_ref.group != PROXY_CONFIG_GROUP
                || parameters_ref.kind != PROXY_CONFIG_KIND
            {
                accepted.status = String::from("False");
                accepted.reason = String::from("InvalidParameters");
                accepted.message = format!(
                    "parametersRef must point at {PROXY_CONFIG_GROUP}/{PROXY_CONFIG_KIND}, found {}/{}",
                    parameters_ref.group, parameters_ref.kind
                );
            }
        }
        None => {
            accepted.status = String::from("False");
            accepted.reason = String::from("InvalidParameters");
            accepted.message = String::from("parametersRef naming a ProxyConfig is required");
        }
    }
    accepted
}

pub async fn patch_status(
    gatewayclass_api: &Api<GatewayClass>,
    name: String,
    status: &GatewayClassStatus,
) -> Result<()> {
    let mut conditions = &vec![];
    if let Some(c) = status.conditions.as_ref() {
        conditions = c;
    }
    let patch = Patch::Apply(json!({
        "apiVersion": "gateway.networking.k8s.io/v1",
        "kind": "GatewayClass",
        "status": {
            "conditions": conditions
        }
    }));
    let params = PatchParams::apply(PINGORA_FIELD_MANAGER).force();
    gatewayclass_api
        .patch_status(name.as_str(), &params, &patch)
        .await
        .map_err(Error::KubeError)?;
    Ok(())
}

pub async fn controller(ctx: Context) -> Result<()> {
    let gwc_api = Api::<GatewayClass>::all(ctx.client.clone());
    gwc_api
        .list(&ListParams::default().limit(1))
        .await
        .map_err(Error::CRDNotFoundError)?;

    Controller::new(gwc_api, Config::default().any_semantic())
        .shutdown_on_signal()
        .run(reconcile, error_policy, Arc::new(ctx))
        .filter_map(|x| async move { std::result::Result::ok(x) })
        .for_each(|_| futures::future::ready(()))
        .await;

    Ok(())
}

fn error_policy(_: Arc<GatewayClass>, error: &Error, _: Arc<Context>) -> Action {
    warn!("reconcile failed: {:?}", error);
    Action::requeue(Duration::from_secs(5))
}
