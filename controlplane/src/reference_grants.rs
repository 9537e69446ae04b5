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

use gateway_api::apis::standard::referencegrants::ReferenceGrant;
use kube::api::{Api, ListParams};
use kube::Client;

use crate::{Error, Result};

// One side of a cross-namespace reference: the referring object or the
// referent.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Reference {
    pub group: String,
    pub kind: String,
    pub namespace: String,
    pub name: String,
}

impl Reference {
    pub fn new(group: &str, kind: &str, namespace: &str, name: &str) -> Self {
        Reference {
            group: group.to_string(),
            kind: kind.to_string(),
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }
}

// The core API group is the empty string, but grants may spell it "core".
fn normalize_group(group: &str) -> &str {
    if group == "core" {
        ""
    } else {
        group
    }
}

// Whether one grant permits the reference. The grant must live in the target
// namespace; it allows the reference iff a `from` entry matches the source
// exactly and a `to` entry matches the target (an unset `to` name matches any
// target name).
pub fn grant_allows(grant: &ReferenceGrant, from: &Reference, to: &Reference) -> bool {
    let from_matches = grant.spec.from.iter().any(|entry| {
        normalize_group(&entry.group) == normalize_group(&from.group)
            && entry.kind == from.kind
            && entry.namespace == from.namespace
    });
    if !from_matches {
        return false;
    }

    grant.spec.to.iter().any(|entry| {
        normalize_group(&entry.group) == normalize_group(&to.group)
            && entry.kind == to.kind
            && entry.name.as_deref().map_or(true, |name| name == to.name)
    })
}

// Decides whether `from` may reference `to`. References within one namespace
// are always permitted; everything else needs a ReferenceGrant in the target
// namespace.
pub async fn reference_allowed(client: Client, from: &Reference, to: &Reference) -> Result<bool> {
    if from.namespace == to.namespace {
        return Ok(true);
    }

    let grant_api: Api<ReferenceGrant> = Api::namespaced(client, &to.namespace);
    let grants = grant_api
        .list(&ListParams::default())
        .await
        .map_err(Error::KubeError)?;

    Ok(grants
        .items
        .iter()
        .any(|grant| grant_allows(grant, from, to)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn grant(from: serde_json::Value, to: serde_json::Value) -> ReferenceGrant {
        serde_json::from_value(json!({
            "apiVersion": "gateway.networking.k8s.io/v1beta1",
            "kind": "ReferenceGrant",
            "metadata": { "name": "grant", "namespace": "ns-b" },
            "spec": { "from": from, "to": to },
        }))
        .expect("grant should deserialize")
    }

    fn http_route_from(namespace: &str) -> Reference {
        Reference::new("gateway.networking.k8s.io", "HTTPRoute", namespace, "r1")
    }

    fn service_to(namespace: &str, name: &str) -> Reference {
        Reference::new("", "Service", namespace, name)
    }

    #[test]
    fn wildcard_to_allows_any_target_name() {
        let grant = grant(
            json!([{ "group": "gateway.networking.k8s.io", "kind": "HTTPRoute", "namespace": "ns-a" }]),
            json!([{ "group": "", "kind": "Service" }]),
        );
        assert!(grant_allows(
            &grant,
            &http_route_from("ns-a"),
            &service_to("ns-b", "svc")
        ));
    }

    #[test]
    fn named_to_must_match_the_target() {
        let grant = grant(
            json!([{ "group": "gateway.networking.k8s.io", "kind": "HTTPRoute", "namespace": "ns-a" }]),
            json!([{ "group": "", "kind": "Service", "name": "allowed" }]),
        );
        assert!(grant_allows(
            &grant,
            &http_route_from("ns-a"),
            &service_to("ns-b", "allowed")
        ));
        assert!(!grant_allows(
            &grant,
            &http_route_from("ns-a"),
            &service_to("ns-b", "other")
        ));
    }

    #[test]
    fn from_must_match_group_kind_and_namespace() {
        let grant = grant(
            json!([{ "group": "gateway.networking.k8s.io", "kind": "HTTPRoute", "namespace": "ns-a" }]),
            json!([{ "group": "", "kind": "Service" }]),
        );
        assert!(!grant_allows(
            &grant,
            &http_route_from("ns-c"),
            &service_to("ns-b", "svc")
        ));
        assert!(!grant_allows(
            &grant,
            &Reference::new("gateway.networking.k8s.io", "GRPCRoute", "ns-a", "r1"),
            &service_to("ns-b", "svc")
        ));
    }

    #[test]
    fn core_group_alias_is_accepted() {
        let grant = grant(
            json!([{ "group": "gateway.networking.k8s.io", "kind": "HTTPRoute", "namespace": "ns-a" }]),
            json!([{ "group": "core", "kind": "Service" }]),
        );
        assert!(grant_allows(
            &grant,
            &http_route_from("ns-a"),
            &service_to("ns-b", "svc")
        ));
    }
}
