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
use std::{sync::Arc, time::Duration};

use crate::consts::{STARTUP_REQUEUE_SECONDS, SYNC_RETRY_SECONDS};
use crate::route_utils::{attached_to_managed_gateway, route_trigger_stream, update_http_route_status};
use crate::traits::RouteResource;
use crate::{Context, Error, NamespaceName, Result};

use gateway_api::apis::experimental::httproutes::HTTPRoute;
use kube::{
    api::{Api, ListParams},
    runtime::{controller::Action, watcher::Config, Controller},
};
use tracing::{debug, info, warn};

pub async fn reconcile(httproute: Arc<HTTPRoute>, ctx: Arc<Context>) -> Result<Action> {
    let key = httproute.metadata.namespaced_name()?;

    // Hold incremental events back until the initial full sync has run.
    if !ctx.barrier.http_synced() {
        debug!(route = %key, "startup sync pending; requeueing");
        return Ok(Action::requeue(Duration::from_secs(STARTUP_REQUEUE_SECONDS)));
    }

    let route_api: Api<HTTPRoute> = Api::namespaced(ctx.client.clone(), &key.namespace);
    let route = match route_api.get(&key.name).await {
        Ok(route) => Some(route),
        Err(kube::Error::Api(err)) if err.code == 404 => None,
        Err(err) => return Err(Error::KubeError(err)),
    };

    let route = match route {
        Some(route) => route,
        None => {
            // Deletion: push the shrunken table; there is no object left to
            // carry status.
            info!(route = %key, "HTTPRoute deleted; resyncing routes");
            ctx.syncer.sync_all().await?;
            return Ok(Action::await_change());
        }
    };

    if !attached_to_managed_gateway(&ctx, &route).await? {
        debug!(route = %key, "not attached to a managed Gateway");
        return Ok(Action::await_change());
    }

    let foreign_namespaces: Vec<String> = route
        .backend_namespaces()
        .into_iter()
        .filter(|namespace| namespace != &key.namespace)
        .collect();
    if !foreign_namespaces.is_empty() {
        debug!(route = %key, namespaces = ?foreign_namespaces, "route references backends in other namespaces");
    }

    debug!(route = %key, "syncing HTTPRoutes");
    let snapshot = ctx.syncer.sync_all().await?;

    let push_error = snapshot.push_error.clone();
    for (route_key, results) in &snapshot.http_results {
        update_http_route_status(&ctx, route_key, results, push_error.as_deref()).await?;
    }

    if let Some(error) = push_error {
        warn!(route = %key, %error, "push failed; requeueing");
        return Ok(Action::requeue(Duration::from_secs(SYNC_RETRY_SECONDS)));
    }
    Ok(Action::await_change())
}

pub async fn controller(ctx: Context) -> Result<()> {
    let httproute_api = Api::<HTTPRoute>::all(ctx.client.clone());
    httproute_api
        .list(&ListParams::default().limit(1))
        .await
        .map_err(Error::CRDNotFoundError)?;

    // The startup sync runs to completion before the reconcile loop starts,
    // so per-object events cannot race the first full push.
    match ctx.syncer.sync_all().await {
        Ok(snapshot) => {
            if let Some(error) = &snapshot.push_error {
                warn!(%error, "initial HTTPRoute sync did not reach the proxy");
            }
        }
        Err(error) => warn!(%error, "initial HTTPRoute sync failed"),
    }
    ctx.barrier.mark_http_synced();

    let triggers = route_trigger_stream(&ctx);

    Controller::new(httproute_api, Config::default().any_semantic())
        .reconcile_all_on(triggers)
        .shutdown_on_signal()
        .run(reconcile, error_policy, Arc::new(ctx))
        .filter_map(|x| async move { std::result::Result::ok(x) })
        .for_each(|_| futures::future::ready(()))
        .await;

    Ok(())
}

fn error_policy(_: Arc<HTTPRoute>, error: &Error, _: Arc<Context>) -> Action {
    warn!("reconcile failed: {:?}", error);
    Action::requeue(Duration::from_secs(5))
}
