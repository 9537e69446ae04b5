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
use std::fmt::Debug;

use chrono::Utc;
use futures::channel::mpsc;
use futures::StreamExt;
use gateway_api::apis::experimental::grpcroutes::{
    GRPCRoute, GRPCRouteStatus, GRPCRouteStatusParents, GRPCRouteStatusParentsParentRef,
};
use gateway_api::apis::standard::gatewayclasses::GatewayClass;
use gateway_api::apis::standard::gateways::Gateway;
use gateway_api::apis::experimental::httproutes::{
    HTTPRoute, HTTPRouteStatus, HTTPRouteStatusParents, HTTPRouteStatusParentsParentRef,
};
use gateway_api::apis::standard::referencegrants::ReferenceGrant;
use k8s_openapi::api::core::v1::{Namespace, Secret};
use k8s_openapi::apimachinery::pkg::apis::meta::v1 as metav1;
use kube::api::{Api, ListParams, PostParams};
use kube::runtime::watcher;
use kube::Client;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::consts::STATUS_UPDATE_MAX_RETRIES;
use crate::proxyconfig::ProxyConfig;
use crate::route_binding::{evaluate_binding, BindingResult, RouteInfo};
use crate::traits::{HasConditions, RouteResource};
use crate::{Context, Error, NamespaceName, NamespacedName, Result};

// Sets the provided condition on any Gateway API object so long as it
// implements the HasConditions trait.
//
// The condition on the object is only updated if the new condition has a
// different status (except for the observed generation which is always
// updated).
pub fn set_condition<T: HasConditions>(obj: &mut T, new_cond: metav1::Condition) {
    if let Some(conditions) = obj.get_conditions_mut() {
        for condition in conditions.iter_mut() {
            if condition.type_ == new_cond.type_ {
                if condition.status == new_cond.status {
                    // always update the observed generation
                    condition.observed_generation = new_cond.observed_generation;
                    return;
                }
                *condition = new_cond;
                return;
            }
        }
        conditions.push(new_cond);
    } else {
        obj.get_conditions_mut().replace(vec![new_cond]);
    }
}

// Builds a condition stamped now; the status writers roll the transition
// time back when the condition's status did not actually change.
pub(crate) fn condition(
    type_: &str,
    status: &str,
    reason: &str,
    message: &str,
    observed_generation: Option<i64>,
) -> metav1::Condition {
    metav1::Condition {
        type_: type_.to_string(),
        status: status.to_string(),
        reason: reason.to_string(),
        message: message.to_string(),
        observed_generation,
        last_transition_time: metav1::Time(Utc::now()),
    }
}

// Re-reconciling unchanged state must not touch LastTransitionTime, so a
// condition whose status survived keeps the previous timestamp.
pub(crate) fn preserve_transition_times(
    conditions: &mut [metav1::Condition],
    previous: Option<&Vec<metav1::Condition>>,
) {
    let previous = match previous {
        Some(previous) => previous,
        None => return,
    };
    for cond in conditions.iter_mut() {
        if let Some(prior) = previous.iter().find(|prior| prior.type_ == cond.type_) {
            if prior.status == cond.status {
                cond.last_transition_time = prior.last_transition_time.clone();
            }
        }
    }
}

fn accepted_condition(
    result: &BindingResult,
    push_error: Option<&str>,
    observed_generation: Option<i64>,
) -> metav1::Condition {
    if let Some(error) = push_error {
        condition("Accepted", "False", "Pending", error, observed_generation)
    } else if result.accepted {
        condition(
            "Accepted",
            "True",
            "Accepted",
            "Route accepted and programmed in Pingora proxy",
            observed_generation,
        )
    } else {
        condition(
            "Accepted",
            "False",
            result.reason.as_str(),
            &result.message,
            observed_generation,
        )
    }
}

fn resolved_refs_condition(observed_generation: Option<i64>) -> metav1::Condition {
    condition(
        "ResolvedRefs",
        "True",
        "ResolvedRefs",
        "References resolved",
        observed_generation,
    )
}

// Rebuilds an HTTPRoute's status.parents from its spec.parentRefs and the
// binding results of the last sync, then PUTs it under a retry-on-conflict
// loop. Refs that did not resolve to a managed Gateway produce no entry.
pub(crate) async fn update_http_route_status(
    ctx: &Context,
    key: &NamespacedName,
    results: &BTreeMap<usize, BindingResult>,
    push_error: Option<&str>,
) -> Result<()> {
    let route_api: Api<HTTPRoute> = Api::namespaced(ctx.client.clone(), &key.namespace);
    let mut attempt = 0;
    loop {
        let mut route = match route_api.get(&key.name).await {
            Ok(route) => route,
            Err(kube::Error::Api(err)) if err.code == 404 => return Ok(()),
            Err(err) => return Err(Error::KubeError(err)),
        };

        let generation = route.metadata.generation;
        let previous = route.status.take();
        let mut parents = Vec::new();
        for (index, parent) in route.spec.parent_refs.iter().flatten().enumerate() {
            let result = match results.get(&index) {
                Some(result) => result,
                None => continue,
            };

            let mut conditions = vec![
                accepted_condition(result, push_error, generation),
                resolved_refs_condition(generation),
            ];
            let prior = previous.as_ref().and_then(|status| {
                status
                    .parents
                    .iter()
                    .find(|prior| {
                        prior.controller_name == ctx.settings.controller_name
                            && prior.parent_ref.name == parent.name
                            && prior.parent_ref.namespace == parent.namespace
                            && prior.parent_ref.section_name == parent.section_name
                    })
                    .and_then(|prior| prior.conditions.as_ref())
            });
            preserve_transition_times(&mut conditions, prior);

            parents.push(HTTPRouteStatusParents {
                parent_ref: HTTPRouteStatusParentsParentRef {
                    group: parent.group.clone(),
                    kind: parent.kind.clone(),
                    name: parent.name.clone(),
                    namespace: parent.namespace.clone(),
                    port: parent.port,
                    section_name: parent.section_name.clone(),
                },
                controller_name: ctx.settings.controller_name.clone(),
                conditions: Some(conditions),
            });
        }

        route.status = Some(HTTPRouteStatus { parents });
        match route_api
            .replace_status(
                &key.name,
                &PostParams::default(),
                serde_json::to_vec(&route)?,
            )
            .await
        {
            Ok(_) => return Ok(()),
            Err(kube::Error::Api(err)) if err.code == 409 && attempt < STATUS_UPDATE_MAX_RETRIES => {
                attempt += 1;
                debug!(route = %key, attempt, "HTTPRoute status write conflicted; retrying");
            }
            Err(err) => return Err(Error::KubeError(err)),
        }
    }
}

// GRPCRoute counterpart of update_http_route_status.
pub(crate) async fn update_grpc_route_status(
    ctx: &Context,
    key: &NamespacedName,
    results: &BTreeMap<usize, BindingResult>,
    push_error: Option<&str>,
) -> Result<()> {
    let route_api: Api<GRPCRoute> = Api::namespaced(ctx.client.clone(), &key.namespace);
    let mut attempt = 0;
    loop {
        let mut route = match route_api.get(&key.name).await {
            Ok(route) => route,
            Err(kube::Error::Api(err)) if err.code == 404 => return Ok(()),
            Err(err) => return Err(Error::KubeError(err)),
        };

        let generation = route.metadata.generation;
        let previous = route.status.take();
        let mut parents = Vec::new();
        for (index, parent) in route.spec.parent_refs.iter().flatten().enumerate() {
            let result = match results.get(&index) {
                Some(result) => result,
                None => continue,
            };

            let mut conditions = vec![
                accepted_condition(result, push_error, generation),
                resolved_refs_condition(generation),
            ];
            let prior = previous.as_ref().and_then(|status| {
                status
                    .parents
                    .iter()
                    .find(|prior| {
                        prior.controller_name == ctx.settings.controller_name
                            && prior.parent_ref.name == parent.name
                            && prior.parent_ref.namespace == parent.namespace
                            && prior.parent_ref.section_name == parent.section_name
                    })
                    .and_then(|prior| prior.conditions.as_ref())
            });
            preserve_transition_times(&mut conditions, prior);

            parents.push(GRPCRouteStatusParents {
                parent_ref: GRPCRouteStatusParentsParentRef {
                    group: parent.group.clone(),
                    kind: parent.kind.clone(),
                    name: parent.name.clone(),
                    namespace: parent.namespace.clone(),
                    port: parent.port,
                    section_name: parent.section_name.clone(),
                },
                controller_name: ctx.settings.controller_name.clone(),
                conditions: Some(conditions),
            });
        }

        route.status = Some(GRPCRouteStatus { parents });
        match route_api
            .replace_status(
                &key.name,
                &PostParams::default(),
                serde_json::to_vec(&route)?,
            )
            .await
        {
            Ok(_) => return Ok(()),
            Err(kube::Error::Api(err)) if err.code == 409 && attempt < STATUS_UPDATE_MAX_RETRIES => {
                attempt += 1;
                debug!(route = %key, attempt, "GRPCRoute status write conflicted; retrying");
            }
            Err(err) => return Err(Error::KubeError(err)),
        }
    }
}

// A route is worth a sync if any parent-ref resolves to a Gateway of the
// configured class. Used by the route reconcilers to skip unrelated objects
// cheaply.
pub(crate) async fn attached_to_managed_gateway<R: RouteResource>(
    ctx: &Context,
    route: &R,
) -> Result<bool> {
    let route_namespace = route.metadata().namespace()?.to_string();
    for parent in route.parent_refs() {
        if !parent.is_gateway() {
            continue;
        }
        let key = parent.gateway_key(&route_namespace);
        let gateway_api: Api<Gateway> = Api::namespaced(ctx.client.clone(), &key.namespace);
        let gateway = match gateway_api.get(&key.name).await {
            Ok(gateway) => gateway,
            Err(kube::Error::Api(err)) if err.code == 404 => continue,
            Err(err) => return Err(Error::KubeError(err)),
        };
        if gateway.spec.gateway_class_name == ctx.settings.gateway_class_name {
            return Ok(true);
        }
    }
    Ok(false)
}

// Labels of the given namespaces; namespaces that do not exist are absent
// from the result rather than an error.
pub(crate) async fn namespace_labels(
    client: &Client,
    namespaces: HashSet<String>,
) -> Result<HashMap<String, BTreeMap<String, String>>> {
    let namespace_api = Api::<Namespace>::all(client.clone());
    let mut labels = HashMap::new();
    for namespace in namespaces {
        match namespace_api.get(&namespace).await {
            Ok(object) => {
                labels.insert(namespace, object.metadata.labels.unwrap_or_default());
            }
            Err(kube::Error::Api(err)) if err.code == 404 => {}
            Err(err) => return Err(Error::KubeError(err)),
        }
    }
    Ok(labels)
}

// Per-listener attached-route counts for one Gateway: every accepted
// (route, parent-ref) pair contributes one count to each listener it
// matched.
pub(crate) async fn count_attached_routes(
    ctx: &Context,
    gateway: &Gateway,
) -> Result<HashMap<String, i32>> {
    let gateway_key = gateway.metadata.namespaced_name()?;

    let http_routes = Api::<HTTPRoute>::all(ctx.client.clone())
        .list(&ListParams::default())
        .await
        .map_err(Error::KubeError)?
        .items;
    let grpc_routes = Api::<GRPCRoute>::all(ctx.client.clone())
        .list(&ListParams::default())
        .await
        .map_err(Error::KubeError)?
        .items;

    let mut namespaces = HashSet::new();
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
    let labels = namespace_labels(&ctx.client, namespaces).await?;

    let mut counts: HashMap<String, i32> = HashMap::new();
    count_routes_for_gateway(&mut counts, gateway, &gateway_key, &http_routes, &labels)?;
    count_routes_for_gateway(&mut counts, gateway, &gateway_key, &grpc_routes, &labels)?;
    Ok(counts)
}

fn count_routes_for_gateway<R: RouteResource>(
    counts: &mut HashMap<String, i32>,
    gateway: &Gateway,
    gateway_key: &NamespacedName,
    routes: &[R],
    namespace_labels: &HashMap<String, BTreeMap<String, String>>,
) -> Result<()> {
    for route in routes {
        let route_namespace = match route.metadata().namespace() {
            Ok(namespace) => namespace.to_string(),
            Err(_) => continue,
        };
        for parent in route.parent_refs() {
            if !parent.is_gateway() || &parent.gateway_key(&route_namespace) != gateway_key {
                continue;
            }
            let info = RouteInfo::for_parent(route, &parent)?;
            let result = evaluate_binding(gateway, &info, namespace_labels.get(&route_namespace))?;
            if result.accepted {
                for listener in result.matched_listeners {
                    *counts.entry(listener).or_default() += 1;
                }
            }
        }
    }
    Ok(())
}

// Watch-stream plumbing: changes on related resources are funneled into a
// bounded channel that a Controller consumes via reconcile_all_on. Bursts
// coalesce; a dropped send only means a trigger is already pending.

fn object_key(meta: &metav1::ObjectMeta) -> String {
    format!(
        "{}/{}",
        meta.namespace.as_deref().unwrap_or_default(),
        meta.name.as_deref().unwrap_or_default()
    )
}

// Forwards one trigger per spec change (generation bump) of K. Status-only
// writes, our own included, never fire.
fn spawn_generation_watch<K>(api: Api<K>, tx: mpsc::Sender<()>)
where
    K: kube::Resource + Clone + DeserializeOwned + Debug + Send + 'static,
{
    tokio::spawn(async move {
        let mut seen: HashMap<String, i64> = HashMap::new();
        let mut events = watcher(api, watcher::Config::default()).boxed();
        let mut tx = tx;
        while let Some(event) = events.next().await {
            let fire = match event {
                Ok(watcher::Event::Applied(object)) => {
                    let key = object_key(object.meta());
                    let generation = object.meta().generation.unwrap_or_default();
                    seen.insert(key, generation) != Some(generation)
                }
                Ok(watcher::Event::Deleted(object)) => {
                    seen.remove(&object_key(object.meta()));
                    true
                }
                Ok(watcher::Event::Restarted(objects)) => {
                    for object in &objects {
                        seen.insert(
                            object_key(object.meta()),
                            object.meta().generation.unwrap_or_default(),
                        );
                    }
                    true
                }
                Err(_) => false,
            };
            if fire {
                let _ = tx.try_send(());
            }
        }
    });
}

// Forwards Secret events, but only for the credential secret the syncer is
// currently using.
fn spawn_credential_secret_watch(ctx: &Context, tx: mpsc::Sender<()>) {
    let api = Api::<Secret>::all(ctx.client.clone());
    let syncer = ctx.syncer.clone();
    tokio::spawn(async move {
        let mut events = watcher(api, watcher::Config::default()).boxed();
        let mut tx = tx;
        while let Some(event) = events.next().await {
            let fire = match event {
                Ok(watcher::Event::Applied(secret)) | Ok(watcher::Event::Deleted(secret)) => {
                    syncer.is_credential_secret(&secret)
                }
                _ => false,
            };
            if fire {
                let _ = tx.try_send(());
            }
        }
    });
}

// Everything that should re-run the route reconcilers besides their own
// objects: Gateways, the ProxyConfig, ReferenceGrants, and the active
// credential secret.
pub(crate) fn route_trigger_stream(ctx: &Context) -> mpsc::Receiver<()> {
    let (tx, rx) = mpsc::channel(16);
    spawn_generation_watch(Api::<Gateway>::all(ctx.client.clone()), tx.clone());
    spawn_generation_watch(Api::<ProxyConfig>::all(ctx.client.clone()), tx.clone());
    spawn_generation_watch(Api::<ReferenceGrant>::all(ctx.client.clone()), tx.clone());
    spawn_credential_secret_watch(ctx, tx);
    rx
}

// The gateway reconciler additionally re-runs on GatewayClass and
// ProxyConfig changes.
pub(crate) fn gateway_trigger_stream(ctx: &Context) -> mpsc::Receiver<()> {
    let (tx, rx) = mpsc::channel(16);
    spawn_generation_watch(Api::<GatewayClass>::all(ctx.client.clone()), tx.clone());
    spawn_generation_watch(Api::<ProxyConfig>::all(ctx.client.clone()), tx);
    rx
}
