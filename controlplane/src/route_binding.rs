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

use std::collections::{BTreeMap, HashMap};

use gateway_api::apis::standard::gateways::Gateway;

use crate::consts::GATEWAY_API_GROUP;
use crate::listener_utils::{hostnames_intersect, kind_allowed, namespace_allowed};
use crate::traits::RouteResource;
use crate::{NamespaceName, NamespacedName, Result};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RouteKind {
    Http,
    Grpc,
}

impl RouteKind {
    pub fn kind_name(&self) -> &'static str {
        match self {
            RouteKind::Http => "HTTPRoute",
            RouteKind::Grpc => "GRPCRoute",
        }
    }
}

// A parent reference as both route kinds express it.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ParentRef {
    pub group: Option<String>,
    pub kind: Option<String>,
    pub name: String,
    pub namespace: Option<String>,
    pub section_name: Option<String>,
}

impl ParentRef {
    // True when the reference names a Gateway API Gateway. An absent kind or
    // group resolves to the Gateway defaults.
    pub fn is_gateway(&self) -> bool {
        let kind_matches = self.kind.as_deref().map_or(true, |kind| kind == "Gateway");
        let group_matches = self
            .group
            .as_deref()
            .map_or(true, |group| group.is_empty() || group == GATEWAY_API_GROUP);
        kind_matches && group_matches
    }

    // The referenced Gateway's key; the namespace defaults to the route's own.
    pub fn gateway_key(&self, route_namespace: &str) -> NamespacedName {
        NamespacedName {
            name: self.name.clone(),
            namespace: self
                .namespace
                .clone()
                .unwrap_or_else(|| route_namespace.to_string()),
        }
    }
}

// The slice of a route the binding evaluator needs.
#[derive(Clone, Debug)]
pub struct RouteInfo {
    pub name: String,
    pub namespace: String,
    pub hostnames: Vec<String>,
    pub kind: RouteKind,
    pub section_name: Option<String>,
}

impl RouteInfo {
    pub fn for_parent<R: RouteResource>(route: &R, parent: &ParentRef) -> Result<Self> {
        let key = route.metadata().namespaced_name()?;
        Ok(RouteInfo {
            name: key.name,
            namespace: key.namespace,
            hostnames: route.hostnames(),
            kind: route.kind(),
            section_name: parent.section_name.clone(),
        })
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum BindingReason {
    Accepted,
    NoMatchingListenerHostname,
    NotAllowedByListeners,
    NoMatchingParent,
}

impl BindingReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            BindingReason::Accepted => "Accepted",
            BindingReason::NoMatchingListenerHostname => "NoMatchingListenerHostname",
            BindingReason::NotAllowedByListeners => "NotAllowedByListeners",
            BindingReason::NoMatchingParent => "NoMatchingParent",
        }
    }

    pub fn message(&self) -> &'static str {
        match self {
            BindingReason::Accepted => "Route accepted",
            BindingReason::NoMatchingListenerHostname => {
                "no listener hostname intersects the route hostnames"
            }
            BindingReason::NotAllowedByListeners => {
                "route is not allowed by the Gateway listeners"
            }
            BindingReason::NoMatchingParent => "no listener matches the parent reference",
        }
    }
}

// The outcome of binding one parent reference of one route against one
// Gateway. Computed per reconcile, never stored.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BindingResult {
    pub accepted: bool,
    pub reason: BindingReason,
    pub message: String,
    pub matched_listeners: Vec<String>,
}

impl BindingResult {
    fn accepted(matched_listeners: Vec<String>) -> Self {
        BindingResult {
            accepted: true,
            reason: BindingReason::Accepted,
            message: BindingReason::Accepted.message().to_string(),
            matched_listeners,
        }
    }

    fn rejected(reason: BindingReason) -> Self {
        BindingResult {
            accepted: false,
            reason,
            message: reason.message().to_string(),
            matched_listeners: Vec::new(),
        }
    }
}

// Walks the Gateway's listeners in declaration order and decides whether the
// route may attach. Listeners are filtered by the parent's sectionName first;
// the remaining ones are checked hostname, then namespace, then kind. The
// most recent rejection reason wins when nothing matches.
pub fn evaluate_binding(
    gateway: &Gateway,
    route: &RouteInfo,
    route_namespace_labels: Option<&BTreeMap<String, String>>,
) -> Result<BindingResult> {
    let gateway_namespace = gateway.metadata.namespace()?;

    let mut matched_listeners = Vec::new();
    let mut rejection: Option<BindingReason> = None;

    for listener in &gateway.spec.listeners {
        if let Some(section_name) = &route.section_name {
            if &listener.name != section_name {
                continue;
            }
        }

        if !hostnames_intersect(listener.hostname.as_deref(), &route.hostnames) {
            rejection = Some(BindingReason::NoMatchingListenerHostname);
            continue;
        }

        if !namespace_allowed(
            listener.allowed_routes.as_ref(),
            gateway_namespace,
            &route.namespace,
            route_namespace_labels,
        )? {
            rejection = Some(BindingReason::NotAllowedByListeners);
            continue;
        }

        if !kind_allowed(listener, route.kind) {
            rejection = Some(BindingReason::NotAllowedByListeners);
            continue;
        }

        matched_listeners.push(listener.name.clone());
    }

    if !matched_listeners.is_empty() {
        return Ok(BindingResult::accepted(matched_listeners));
    }

    if route.section_name.is_some() {
        return Ok(BindingResult::rejected(BindingReason::NoMatchingParent));
    }

    Ok(BindingResult::rejected(
        rejection.unwrap_or(BindingReason::NoMatchingParent),
    ))
}

// Evaluates every qualifying parent reference of a route against the
// Gateways of the configured class. The result is keyed by the parent's
// index in spec.parentRefs; refs that do not resolve to a managed Gateway
// are absent.
pub fn evaluate_route_parents<R: RouteResource>(
    route: &R,
    gateways: &HashMap<NamespacedName, Gateway>,
    gateway_class_name: &str,
    namespace_labels: &HashMap<String, BTreeMap<String, String>>,
) -> Result<BTreeMap<usize, BindingResult>> {
    let route_namespace = route.metadata().namespace()?.to_string();
    let mut results = BTreeMap::new();

    for (index, parent) in route.parent_refs().iter().enumerate() {
        if !parent.is_gateway() {
            continue;
        }
        let gateway = match gateways.get(&parent.gateway_key(&route_namespace)) {
            Some(gateway) => gateway,
            None => continue,
        };
        if gateway.spec.gateway_class_name != gateway_class_name {
            continue;
        }

        let info = RouteInfo::for_parent(route, parent)?;
        let labels = namespace_labels.get(&route_namespace);
        results.insert(index, evaluate_binding(gateway, &info, labels)?);
    }

    Ok(results)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn gateway(listeners: serde_json::Value) -> Gateway {
        serde_json::from_value(json!({
            "apiVersion": "gateway.networking.k8s.io/v1",
            "kind": "Gateway",
            "metadata": { "name": "gw", "namespace": "ns" },
            "spec": {
                "gatewayClassName": "pingora",
                "listeners": listeners,
            }
        }))
        .expect("gateway should deserialize")
    }

    fn route(hostnames: &[&str], section_name: Option<&str>) -> RouteInfo {
        RouteInfo {
            name: "r1".to_string(),
            namespace: "ns".to_string(),
            hostnames: hostnames.iter().map(|h| h.to_string()).collect(),
            kind: RouteKind::Http,
            section_name: section_name.map(|s| s.to_string()),
        }
    }

    #[test]
    fn same_namespace_route_binds_to_plain_http_listener() {
        let gateway = gateway(json!([
            { "name": "http", "port": 80, "protocol": "HTTP" }
        ]));
        let result = evaluate_binding(&gateway, &route(&["example.com"], None), None).unwrap();
        assert!(result.accepted);
        assert_eq!(result.matched_listeners, vec!["http".to_string()]);
        assert_eq!(result.message, "Route accepted");
    }

    #[test]
    fn hostname_mismatch_is_reported() {
        let gateway = gateway(json!([
            { "name": "http", "port": 80, "protocol": "HTTP", "hostname": "*.example.com" }
        ]));
        let result = evaluate_binding(&gateway, &route(&["other.com"], None), None).unwrap();
        assert!(!result.accepted);
        assert_eq!(result.reason, BindingReason::NoMatchingListenerHostname);
        assert!(result.matched_listeners.is_empty());
    }

    #[test]
    fn wildcard_listener_rejects_the_apex() {
        let gateway = gateway(json!([
            { "name": "http", "port": 80, "protocol": "HTTP", "hostname": "*.example.com" }
        ]));
        let result = evaluate_binding(&gateway, &route(&["example.com"], None), None).unwrap();
        assert!(!result.accepted);
        assert_eq!(result.reason, BindingReason::NoMatchingListenerHostname);
    }

    #[test]
    fn section_name_restricts_the_listener_walk() {
        let gateway = gateway(json!([
            { "name": "http", "port": 80, "protocol": "HTTP", "hostname": "*.a.com" },
            { "name": "https", "port": 443, "protocol": "HTTPS", "hostname": "*.b.com" }
        ]));
        let result =
            evaluate_binding(&gateway, &route(&["x.b.com"], Some("https")), None).unwrap();
        assert!(result.accepted);
        assert_eq!(result.matched_listeners, vec!["https".to_string()]);

        // the same hostnames without the section filter would still match,
        // but an unknown section never does
        let result =
            evaluate_binding(&gateway, &route(&["x.b.com"], Some("missing")), None).unwrap();
        assert!(!result.accepted);
        assert_eq!(result.reason, BindingReason::NoMatchingParent);
    }

    #[test]
    fn gateway_without_listeners_never_matches() {
        let gateway = gateway(json!([]));
        let result = evaluate_binding(&gateway, &route(&["example.com"], None), None).unwrap();
        assert!(!result.accepted);
        assert_eq!(result.reason, BindingReason::NoMatchingParent);
    }

    #[test]
    fn foreign_namespace_is_rejected_by_default_policy() {
        let gateway = gateway(json!([
            { "name": "http", "port": 80, "protocol": "HTTP" }
        ]));
        let mut info = route(&[], None);
        info.namespace = "elsewhere".to_string();
        let result = evaluate_binding(&gateway, &info, None).unwrap();
        assert!(!result.accepted);
        assert_eq!(result.reason, BindingReason::NotAllowedByListeners);
    }

    #[test]
    fn route_kind_outside_the_allow_list_is_rejected() {
        let gateway = gateway(json!([
            {
                "name": "http",
                "port": 80,
                "protocol": "HTTP",
                "allowedRoutes": { "kinds": [{ "kind": "GRPCRoute" }] }
            }
        ]));
        let result = evaluate_binding(&gateway, &route(&[], None), None).unwrap();
        assert!(!result.accepted);
        assert_eq!(result.reason, BindingReason::NotAllowedByListeners);
    }

    #[test]
    fn later_listener_can_still_accept() {
        let gateway = gateway(json!([
            { "name": "a", "port": 80, "protocol": "HTTP", "hostname": "*.a.com" },
            { "name": "b", "port": 8080, "protocol": "HTTP" }
        ]));
        let result = evaluate_binding(&gateway, &route(&["x.b.com"], None), None).unwrap();
        assert!(result.accepted);
        assert_eq!(result.matched_listeners, vec!["b".to_string()]);
    }
}
