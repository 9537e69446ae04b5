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

use gateway_api::apis::experimental::grpcroutes::{
    GRPCRoute, GRPCRouteRules, GRPCRouteRulesMatches, GRPCRouteRulesMatchesHeadersType,
    GRPCRouteRulesMatchesMethodType,
};
use gateway_api::apis::experimental::httproutes::{
    HTTPRoute, HTTPRouteRules, HTTPRouteRulesMatches, HTTPRouteRulesMatchesHeadersType,
    HTTPRouteRulesMatchesMethod, HTTPRouteRulesMatchesPathType,
    HTTPRouteRulesMatchesQueryParamsType,
};
use routes::routes as proto;

use crate::traits::BackendRef;
use crate::{NamespaceName, Result};

// Translates one HTTPRoute into the proxy's wire model. Rule identity within
// the route is positional.
pub fn build_http_route(route: &HTTPRoute, cluster_domain: &str) -> Result<proto::HttpRoute> {
    let key = route.metadata.namespaced_name()?;

    let rules = route
        .spec
        .rules
        .iter()
        .flatten()
        .map(|rule| build_http_rule(rule, &key.namespace, cluster_domain))
        .collect();

    Ok(proto::HttpRoute {
        id: key.to_string(),
        hostnames: route.spec.hostnames.clone().unwrap_or_default(),
        rules,
    })
}

fn build_http_rule(
    rule: &HTTPRouteRules,
    route_namespace: &str,
    cluster_domain: &str,
) -> proto::HttpRouteRule {
    let mut matches: Vec<proto::HttpRouteMatch> = rule
        .matches
        .iter()
        .flatten()
        .map(build_http_match)
        .collect();
    if matches.is_empty() {
        // a rule without matches matches every request
        matches.push(proto::HttpRouteMatch {
            path: Some(proto::PathMatch {
                match_type: proto::MatchType::Prefix as i32,
                value: "/".to_string(),
            }),
            method: None,
            headers: Vec::new(),
            query_params: Vec::new(),
        });
    }

    proto::HttpRouteRule {
        matches,
        backends: build_backends(
            rule.backend_refs.as_deref().unwrap_or_default(),
            route_namespace,
            cluster_domain,
        ),
        timeout_ms: rule
            .timeouts
            .as_ref()
            .and_then(|timeouts| timeouts.request.as_deref())
            .and_then(parse_timeout_ms),
    }
}

fn build_http_match(source: &HTTPRouteRulesMatches) -> proto::HttpRouteMatch {
    let path = source.path.as_ref().map(|path| {
        let match_type = match path.r#type {
            Some(HTTPRouteRulesMatchesPathType::Exact) => proto::MatchType::Exact,
            Some(HTTPRouteRulesMatchesPathType::RegularExpression) => proto::MatchType::Regex,
            Some(HTTPRouteRulesMatchesPathType::PathPrefix) | None => proto::MatchType::Prefix,
        };
        proto::PathMatch {
            match_type: match_type as i32,
            value: path.value.clone().unwrap_or_else(|| "/".to_string()),
        }
    });

    let headers = source
        .headers
        .iter()
        .flatten()
        .map(|header| proto::HeaderMatch {
            match_type: match header.r#type {
                Some(HTTPRouteRulesMatchesHeadersType::RegularExpression) => {
                    proto::MatchType::Regex as i32
                }
                Some(HTTPRouteRulesMatchesHeadersType::Exact) | None => {
                    proto::MatchType::Exact as i32
                }
            },
            name: header.name.clone(),
            value: header.value.clone(),
        })
        .collect();

    let query_params = source
        .query_params
        .iter()
        .flatten()
        .map(|param| proto::QueryParamMatch {
            match_type: match param.r#type {
                Some(HTTPRouteRulesMatchesQueryParamsType::RegularExpression) => {
                    proto::MatchType::Regex as i32
                }
                Some(HTTPRouteRulesMatchesQueryParamsType::Exact) | None => {
                    proto::MatchType::Exact as i32
                }
            },
            name: param.name.clone(),
            value: param.value.clone(),
        })
        .collect();

    proto::HttpRouteMatch {
        path,
        method: source.method.as_ref().map(|method| method_name(method).to_string()),
        headers,
        query_params,
    }
}

fn method_name(method: &HTTPRouteRulesMatchesMethod) -> &'static str {
    match method {
        HTTPRouteRulesMatchesMethod::Get => "GET",
        HTTPRouteRulesMatchesMethod::Head => "HEAD",
        HTTPRouteRulesMatchesMethod::Post => "POST",
        HTTPRouteRulesMatchesMethod::Put => "PUT",
        HTTPRouteRulesMatchesMethod::Delete => "DELETE",
        HTTPRouteRulesMatchesMethod::Connect => "CONNECT",
        HTTPRouteRulesMatchesMethod::Options => "OPTIONS",
        HTTPRouteRulesMatchesMethod::Trace => "TRACE",
        HTTPRouteRulesMatchesMethod::Patch => "PATCH",
    }
}

// Translates one GRPCRoute into the proxy's wire model.
pub fn build_grpc_route(route: &GRPCRoute, cluster_domain: &str) -> Result<proto::GrpcRoute> {
    let key = route.metadata.namespaced_name()?;

    let rules = route
        .spec
        .rules
        .iter()
        .flatten()
        .map(|rule| build_grpc_rule(rule, &key.namespace, cluster_domain))
        .collect();

    Ok(proto::GrpcRoute {
        id: key.to_string(),
        hostnames: route.spec.hostnames.clone().unwrap_or_default(),
        rules,
    })
}

fn build_grpc_rule(
    rule: &GRPCRouteRules,
    route_namespace: &str,
    cluster_domain: &str,
) -> proto::GrpcRouteRule {
    proto::GrpcRouteRule {
        matches: rule
            .matches
            .iter()
            .flatten()
            .map(build_grpc_match)
            .collect(),
        backends: build_backends(
            rule.backend_refs.as_deref().unwrap_or_default(),
            route_namespace,
            cluster_domain,
        ),
        timeout_ms: None,
    }
}

fn build_grpc_match(source: &GRPCRouteRulesMatches) -> proto::GrpcRouteMatch {
    let method = source.method.as_ref().map(|method| proto::GrpcMethodMatch {
        match_type: match method.r#type {
            Some(GRPCRouteRulesMatchesMethodType::RegularExpression) => {
                proto::MatchType::Regex as i32
            }
            Some(GRPCRouteRulesMatchesMethodType::Exact) | None => proto::MatchType::Exact as i32,
        },
        service: method.service.clone().unwrap_or_default(),
        method: method.method.clone().unwrap_or_default(),
    });

    let headers = source
        .headers
        .iter()
        .flatten()
        .map(|header| proto::HeaderMatch {
            match_type: match header.r#type {
                Some(GRPCRouteRulesMatchesHeadersType::RegularExpression) => {
                    proto::MatchType::Regex as i32
                }
                Some(GRPCRouteRulesMatchesHeadersType::Exact) | None => {
                    proto::MatchType::Exact as i32
                }
            },
            name: header.name.clone(),
            value: header.value.clone(),
        })
        .collect();

    proto::GrpcRouteMatch { method, headers }
}

// Resolves backend references to addresses inside the cluster DNS zone.
// References to kinds other than Service are skipped, as are refs without a
// port. The namespace defaults to the route's own.
pub fn build_backends<B: BackendRef>(
    backend_refs: &[B],
    route_namespace: &str,
    cluster_domain: &str,
) -> Vec<proto::Backend> {
    backend_refs
        .iter()
        .filter(|backend| backend.kind().map_or(true, |kind| kind == "Service"))
        .filter_map(|backend| {
            let port = backend.port()?;
            let namespace = backend.namespace().unwrap_or(route_namespace);
            Some(proto::Backend {
                address: format!(
                    "{}.{}.svc.{}:{}",
                    backend.name(),
                    namespace,
                    cluster_domain,
                    port
                ),
                weight: backend.weight().map_or(1, |weight| weight.max(0) as u32),
            })
        })
        .collect()
}

// Picks the single backend for consumers that do not take a weighted set:
// the highest strictly-positive weight wins and ties break toward the
// earliest-listed backend. An all-zero (or empty) set yields no backend.
pub fn select_backend(backends: &[proto::Backend]) -> Option<&proto::Backend> {
    let mut best: Option<&proto::Backend> = None;
    for backend in backends {
        if backend.weight == 0 {
            continue;
        }
        match best {
            Some(current) if backend.weight <= current.weight => {}
            _ => best = Some(backend),
        }
    }
    best
}

// Parses a Gateway API duration string ("10s", "500ms", "1m30s") into whole
// milliseconds. Zero and unparsable values yield None.
pub fn parse_timeout_ms(value: &str) -> Option<u64> {
    let duration = humantime::parse_duration(value).ok()?;
    let millis = duration.as_millis();
    if millis == 0 {
        None
    } else {
        Some(millis as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn http_route(value: serde_json::Value) -> HTTPRoute {
        serde_json::from_value(value).expect("route should deserialize")
    }

    #[test]
    fn basic_http_route_translates_to_one_rule() {
        let route = http_route(json!({
            "apiVersion": "gateway.networking.k8s.io/v1",
            "kind": "HTTPRoute",
            "metadata": { "name": "r1", "namespace": "ns" },
            "spec": {
                "hostnames": ["example.com"],
                "rules": [{
                    "matches": [{ "path": { "type": "PathPrefix", "value": "/" } }],
                    "backendRefs": [{ "name": "svc", "port": 80 }],
                }],
            },
        }));

        let wire = build_http_route(&route, "cluster.local").unwrap();
        assert_eq!(wire.id, "ns/r1");
        assert_eq!(wire.hostnames, vec!["example.com".to_string()]);
        assert_eq!(wire.rules.len(), 1);

        let rule = &wire.rules[0];
        let path = rule.matches[0].path.as_ref().unwrap();
        assert_eq!(path.match_type, proto::MatchType::Prefix as i32);
        assert_eq!(path.value, "/");
        assert_eq!(rule.backends.len(), 1);
        assert_eq!(rule.backends[0].address, "svc.ns.svc.cluster.local:80");
        assert_eq!(rule.backends[0].weight, 1);
        assert_eq!(rule.timeout_ms, None);
    }

    #[test]
    fn rule_without_matches_gets_a_catch_all_prefix() {
        let route = http_route(json!({
            "apiVersion": "gateway.networking.k8s.io/v1",
            "kind": "HTTPRoute",
            "metadata": { "name": "r1", "namespace": "ns" },
            "spec": { "rules": [{ "backendRefs": [{ "name": "svc", "port": 80 }] }] },
        }));

        let wire = build_http_route(&route, "cluster.local").unwrap();
        let rule = &wire.rules[0];
        assert_eq!(rule.matches.len(), 1);
        let path = rule.matches[0].path.as_ref().unwrap();
        assert_eq!(path.match_type, proto::MatchType::Prefix as i32);
        assert_eq!(path.value, "/");
    }

    #[test]
    fn match_translation_covers_method_headers_and_query_params() {
        let route = http_route(json!({
            "apiVersion": "gateway.networking.k8s.io/v1",
            "kind": "HTTPRoute",
            "metadata": { "name": "r1", "namespace": "ns" },
            "spec": {
                "rules": [{
                    "matches": [{
                        "path": { "type": "RegularExpression", "value": "/v[0-9]+" },
                        "method": "POST",
                        "headers": [
                            { "name": "x-env", "value": "prod" },
                            { "type": "RegularExpression", "name": "x-ver", "value": "v.*" }
                        ],
                        "queryParams": [{ "name": "debug", "value": "1" }],
                    }],
                }],
            },
        }));

        let wire = build_http_route(&route, "cluster.local").unwrap();
        let matched = &wire.rules[0].matches[0];
        assert_eq!(
            matched.path.as_ref().unwrap().match_type,
            proto::MatchType::Regex as i32
        );
        assert_eq!(matched.method.as_deref(), Some("POST"));
        assert_eq!(matched.headers[0].match_type, proto::MatchType::Exact as i32);
        assert_eq!(matched.headers[1].match_type, proto::MatchType::Regex as i32);
        assert_eq!(
            matched.query_params[0].match_type,
            proto::MatchType::Exact as i32
        );
    }

    #[test]
    fn request_timeout_is_recorded_in_milliseconds() {
        let route = http_route(json!({
            "apiVersion": "gateway.networking.k8s.io/v1",
            "kind": "HTTPRoute",
            "metadata": { "name": "r1", "namespace": "ns" },
            "spec": {
                "rules": [
                    { "timeouts": { "request": "10s" } },
                    { "timeouts": { "request": "500ms" } },
                    { "timeouts": { "request": "0s" } },
                    { "timeouts": { "request": "not-a-duration" } },
                ],
            },
        }));

        let wire = build_http_route(&route, "cluster.local").unwrap();
        assert_eq!(wire.rules[0].timeout_ms, Some(10_000));
        assert_eq!(wire.rules[1].timeout_ms, Some(500));
        assert_eq!(wire.rules[2].timeout_ms, None);
        assert_eq!(wire.rules[3].timeout_ms, None);
    }

    #[test]
    fn backend_namespace_defaults_to_the_route_namespace() {
        let route = http_route(json!({
            "apiVersion": "gateway.networking.k8s.io/v1",
            "kind": "HTTPRoute",
            "metadata": { "name": "r1", "namespace": "ns-a" },
            "spec": {
                "rules": [{
                    "backendRefs": [
                        { "name": "local", "port": 80 },
                        { "name": "remote", "namespace": "ns-b", "port": 8080, "weight": 5 },
                        { "kind": "Bucket", "name": "skipped", "port": 80 },
                    ],
                }],
            },
        }));

        let wire = build_http_route(&route, "cluster.local").unwrap();
        let backends = &wire.rules[0].backends;
        assert_eq!(backends.len(), 2);
        assert_eq!(backends[0].address, "local.ns-a.svc.cluster.local:80");
        assert_eq!(backends[1].address, "remote.ns-b.svc.cluster.local:8080");
        assert_eq!(backends[1].weight, 5);
    }

    #[test]
    fn grpc_method_match_defaults_to_exact() {
        let route: GRPCRoute = serde_json::from_value(json!({
            "apiVersion": "gateway.networking.k8s.io/v1",
            "kind": "GRPCRoute",
            "metadata": { "name": "g1", "namespace": "ns" },
            "spec": {
                "hostnames": ["grpc.example.com"],
                "rules": [{
                    "matches": [{
                        "method": { "service": "billing.Accounts", "method": "Charge" },
                        "headers": [{ "name": "x-tenant", "value": "acme" }],
                    }],
                    "backendRefs": [{ "name": "billing", "port": 9000 }],
                }],
            },
        }))
        .expect("route should deserialize");

        let wire = build_grpc_route(&route, "cluster.local").unwrap();
        assert_eq!(wire.id, "ns/g1");
        let method = wire.rules[0].matches[0].method.as_ref().unwrap();
        assert_eq!(method.match_type, proto::MatchType::Exact as i32);
        assert_eq!(method.service, "billing.Accounts");
        assert_eq!(method.method, "Charge");
        assert_eq!(
            wire.rules[0].backends[0].address,
            "billing.ns.svc.cluster.local:9000"
        );
    }

    fn backend(address: &str, weight: u32) -> proto::Backend {
        proto::Backend {
            address: address.to_string(),
            weight,
        }
    }

    #[test]
    fn select_backend_prefers_the_highest_positive_weight() {
        let backends = vec![
            backend("a:80", 1),
            backend("b:80", 7),
            backend("c:80", 7),
            backend("d:80", 3),
        ];
        assert_eq!(select_backend(&backends).unwrap().address, "b:80");
    }

    #[test]
    fn zero_weight_backends_are_never_selected() {
        let backends = vec![backend("a:80", 0), backend("b:80", 0)];
        assert!(select_backend(&backends).is_none());
        assert!(select_backend(&[]).is_none());

        let backends = vec![backend("a:80", 0), backend("b:80", 1)];
        assert_eq!(select_backend(&backends).unwrap().address, "b:80");
    }

    #[test]
    fn builder_output_is_deterministic() {
        let route = http_route(json!({
            "apiVersion": "gateway.networking.k8s.io/v1",
            "kind": "HTTPRoute",
            "metadata": { "name": "r1", "namespace": "ns" },
            "spec": {
                "hostnames": ["a.example.com", "b.example.com"],
                "rules": [{
                    "matches": [{ "path": { "type": "Exact", "value": "/x" } }],
                    "backendRefs": [{ "name": "svc", "port": 80 }],
                }],
            },
        }));
        assert_eq!(
            build_http_route(&route, "cluster.local").unwrap(),
            build_http_route(&route, "cluster.local").unwrap()
        );
    }
}
