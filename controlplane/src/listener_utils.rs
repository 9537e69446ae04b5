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

use std::collections::BTreeMap;

use gateway_api::apis::standard::gateways::{
    GatewayListeners, GatewayListenersAllowedRoutes, GatewayListenersAllowedRoutesNamespacesFrom,
    GatewayListenersAllowedRoutesNamespacesSelector,
};

use crate::consts::GATEWAY_API_GROUP;
use crate::route_binding::RouteKind;
use crate::{Error, Result};

// Returns true if the listener hostname and the route hostname set intersect.
// An absent listener hostname matches everything; an empty route hostname
// list matches any listener.
pub fn hostnames_intersect(listener_hostname: Option<&str>, route_hostnames: &[String]) -> bool {
    let listener_hostname = match listener_hostname {
        Some(hostname) if !hostname.is_empty() => hostname,
        _ => return true,
    };

    if route_hostnames.is_empty() {
        return true;
    }

    route_hostnames
        .iter()
        .any(|hostname| hostname_matches(listener_hostname, hostname))
}

// Compares two hostnames, either of which may carry a leading wildcard label.
// DNS names are case-insensitive. A wildcard never matches the bare suffix
// (the apex), but does match any depth of subdomains under it. A `*` anywhere
// other than as the whole leftmost label is not a wildcard.
pub fn hostname_matches(a: &str, b: &str) -> bool {
    let a = a.to_ascii_lowercase();
    let b = b.to_ascii_lowercase();

    match (a.strip_prefix("*."), b.strip_prefix("*.")) {
        (Some(suffix_a), Some(suffix_b)) => suffix_a == suffix_b,
        (Some(suffix), None) => is_subdomain_of(&b, suffix),
        (None, Some(suffix)) => is_subdomain_of(&a, suffix),
        (None, None) => a == b,
    }
}

// True iff `hostname` is a strict subdomain of `suffix`, i.e. it ends with
// ".{suffix}". The suffix itself does not qualify.
fn is_subdomain_of(hostname: &str, suffix: &str) -> bool {
    hostname
        .strip_suffix(suffix)
        .and_then(|head| head.strip_suffix('.'))
        .map(|head| !head.is_empty())
        .unwrap_or(false)
}

// Resolves whether the listener permits routes of the given kind. An explicit
// non-empty allowedRoutes.kinds list is taken verbatim; otherwise the
// permitted kinds follow from the listener protocol.
pub fn kind_allowed(listener: &GatewayListeners, kind: RouteKind) -> bool {
    if let Some(kinds) = listener
        .allowed_routes
        .as_ref()
        .and_then(|allowed| allowed.kinds.as_ref())
    {
        if !kinds.is_empty() {
            return kinds.iter().any(|allowed_kind| {
                allowed_kind.kind == kind.kind_name()
                    && allowed_kind
                        .group
                        .as_deref()
                        .map_or(true, |group| group.is_empty() || group == GATEWAY_API_GROUP)
            });
        }
    }

    default_kinds_for_protocol(&listener.protocol).contains(&kind.kind_name())
}

// Protocols we don't recognize fall back to the HTTP kind set rather than
// rejecting, so routes keep flowing when new protocol values appear.
fn default_kinds_for_protocol(protocol: &str) -> &'static [&'static str] {
    match protocol {
        "HTTP" | "HTTPS" => &["HTTPRoute", "GRPCRoute"],
        "TLS" => &["TLSRoute"],
        "TCP" => &["TCPRoute"],
        "UDP" => &["UDPRoute"],
        _ => &["HTTPRoute", "GRPCRoute"],
    }
}

// Applies the listener's namespace policy to a route namespace. The caller
// supplies the route namespace's labels (None when the namespace does not
// exist in the cluster), so this stays free of API round-trips.
pub fn namespace_allowed(
    allowed_routes: Option<&GatewayListenersAllowedRoutes>,
    gateway_namespace: &str,
    route_namespace: &str,
    route_namespace_labels: Option<&BTreeMap<String, String>>,
) -> Result<bool> {
    let namespaces = match allowed_routes.and_then(|allowed| allowed.namespaces.as_ref()) {
        Some(namespaces) => namespaces,
        None => return Ok(route_namespace == gateway_namespace),
    };

    match &namespaces.from {
        None | Some(GatewayListenersAllowedRoutesNamespacesFrom::Same) => {
            Ok(route_namespace == gateway_namespace)
        }
        Some(GatewayListenersAllowedRoutesNamespacesFrom::All) => Ok(true),
        Some(GatewayListenersAllowedRoutesNamespacesFrom::Selector) => {
            let selector = namespaces.selector.as_ref().ok_or_else(|| {
                Error::InvalidSelectorError(
                    "allowedRoutes.namespaces.from is Selector but no selector is set".to_string(),
                )
            })?;
            match route_namespace_labels {
                Some(labels) => selector_matches(selector, labels),
                // a namespace we can't see never matches
                None => Ok(false),
            }
        }
        // Any other policy value refuses every namespace, the Gateway's own
        // included.
        #[allow(unreachable_patterns)]
        Some(_) => Ok(false),
    }
}

// Standard label-selector semantics over a namespace's labels. Unknown
// operators and malformed requirements are hard errors, not mismatches.
pub fn selector_matches(
    selector: &GatewayListenersAllowedRoutesNamespacesSelector,
    labels: &BTreeMap<String, String>,
) -> Result<bool> {
    if let Some(match_labels) = &selector.match_labels {
        for (key, value) in match_labels {
            if labels.get(key) != Some(value) {
                return Ok(false);
            }
        }
    }

    if let Some(expressions) = &selector.match_expressions {
        for expression in expressions {
            let values = expression.values.as_deref().unwrap_or_default();
            let matched = match expression.operator.as_str() {
                "In" => {
                    if values.is_empty() {
                        return Err(Error::InvalidSelectorError(format!(
                            "operator In on key {:?} requires values",
                            expression.key
                        )));
                    }
                    labels
                        .get(&expression.key)
                        .map_or(false, |value| values.contains(value))
                }
                "NotIn" => {
                    if values.is_empty() {
                        return Err(Error::InvalidSelectorError(format!(
                            "operator NotIn on key {:?} requires values",
                            expression.key
                        )));
                    }
                    labels
                        .get(&expression.key)
                        .map_or(true, |value| !values.contains(value))
                }
                "Exists" => labels.contains_key(&expression.key),
                "DoesNotExist" => !labels.contains_key(&expression.key),
                operator => {
                    return Err(Error::InvalidSelectorError(format!(
                        "unknown selector operator {operator:?}"
                    )));
                }
            };
            if !matched {
                return Ok(false);
            }
        }
    }

    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use gateway_api::apis::standard::gateways::GatewayListenersAllowedRoutesNamespacesSelectorMatchExpressions as MatchExpression;

    fn hostnames(names: &[&str]) -> Vec<String> {
        names.iter().map(|name| name.to_string()).collect()
    }

    #[test]
    fn empty_listener_hostname_matches_everything() {
        assert!(hostnames_intersect(None, &hostnames(&["example.com"])));
        assert!(hostnames_intersect(Some(""), &hostnames(&["example.com"])));
        assert!(hostnames_intersect(None, &[]));
    }

    #[test]
    fn empty_route_hostnames_match_any_listener() {
        assert!(hostnames_intersect(Some("example.com"), &[]));
        assert!(hostnames_intersect(Some("*.example.com"), &[]));
    }

    #[test]
    fn exact_hostnames_compare_case_insensitively() {
        assert!(hostnames_intersect(
            Some("Example.COM"),
            &hostnames(&["example.com"])
        ));
        assert!(!hostnames_intersect(
            Some("example.com"),
            &hostnames(&["example.org"])
        ));
    }

    #[test]
    fn wildcard_matches_subdomains_at_any_depth() {
        assert!(hostnames_intersect(
            Some("*.example.com"),
            &hostnames(&["foo.example.com"])
        ));
        assert!(hostnames_intersect(
            Some("*.example.com"),
            &hostnames(&["bar.foo.example.com"])
        ));
        assert!(!hostnames_intersect(
            Some("*.example.com"),
            &hostnames(&["other.com"])
        ));
        assert!(!hostnames_intersect(
            Some("*.example.com"),
            &hostnames(&["notexample.com"])
        ));
    }

    #[test]
    fn wildcard_never_matches_the_apex() {
        assert!(!hostnames_intersect(
            Some("*.example.com"),
            &hostnames(&["example.com"])
        ));
        assert!(!hostnames_intersect(
            Some("example.com"),
            &hostnames(&["*.example.com"]) // symmetric case
        ));
    }

    #[test]
    fn wildcard_against_wildcard_requires_equal_suffixes() {
        assert!(hostname_matches("*.example.com", "*.example.com"));
        assert!(hostname_matches("*.Example.Com", "*.example.com"));
        assert!(!hostname_matches("*.example.com", "*.foo.example.com"));
    }

    #[test]
    fn wildcard_must_be_the_leftmost_label() {
        assert!(!hostname_matches("foo.*.com", "foo.bar.com"));
        assert!(hostname_matches("foo.*.com", "foo.*.com"));
    }

    #[test]
    fn matcher_is_symmetric_and_idempotent() {
        let pairs = [
            ("*.example.com", "foo.example.com"),
            ("example.com", "example.com"),
            ("*.a.com", "*.b.com"),
            ("a.com", "*.a.com"),
        ];
        for (a, b) in pairs {
            assert_eq!(hostname_matches(a, b), hostname_matches(b, a));
            assert_eq!(hostname_matches(a, b), hostname_matches(a, b));
        }
    }

    fn listener_with_protocol(protocol: &str) -> GatewayListeners {
        serde_json::from_value(serde_json::json!({
            "name": "test",
            "port": 80,
            "protocol": protocol,
        }))
        .expect("listener should deserialize")
    }

    fn listener_with_kinds(kinds: serde_json::Value) -> GatewayListeners {
        serde_json::from_value(serde_json::json!({
            "name": "test",
            "port": 80,
            "protocol": "HTTP",
            "allowedRoutes": { "kinds": kinds },
        }))
        .expect("listener should deserialize")
    }

    #[test]
    fn http_listeners_default_to_http_and_grpc_routes() {
        for protocol in ["HTTP", "HTTPS", "SOMETHING-NEW"] {
            let listener = listener_with_protocol(protocol);
            assert!(kind_allowed(&listener, RouteKind::Http), "{protocol}");
            assert!(kind_allowed(&listener, RouteKind::Grpc), "{protocol}");
        }
    }

    #[test]
    fn l4_listeners_do_not_accept_l7_routes() {
        for protocol in ["TCP", "UDP", "TLS"] {
            let listener = listener_with_protocol(protocol);
            assert!(!kind_allowed(&listener, RouteKind::Http), "{protocol}");
            assert!(!kind_allowed(&listener, RouteKind::Grpc), "{protocol}");
        }
    }

    #[test]
    fn explicit_kind_list_is_taken_verbatim() {
        let listener = listener_with_kinds(serde_json::json!([{ "kind": "GRPCRoute" }]));
        assert!(!kind_allowed(&listener, RouteKind::Http));
        assert!(kind_allowed(&listener, RouteKind::Grpc));
    }

    #[test]
    fn kind_gate_rejects_foreign_groups() {
        let listener = listener_with_kinds(serde_json::json!([
            { "group": "example.com", "kind": "HTTPRoute" }
        ]));
        assert!(!kind_allowed(&listener, RouteKind::Http));

        let listener = listener_with_kinds(serde_json::json!([
            { "group": "gateway.networking.k8s.io", "kind": "HTTPRoute" }
        ]));
        assert!(kind_allowed(&listener, RouteKind::Http));
    }

    fn allowed_routes(value: serde_json::Value) -> GatewayListenersAllowedRoutes {
        serde_json::from_value(value).expect("allowedRoutes should deserialize")
    }

    #[test]
    fn missing_namespace_policy_means_same_namespace() {
        assert!(namespace_allowed(None, "ns", "ns", None).unwrap());
        assert!(!namespace_allowed(None, "ns", "other", None).unwrap());

        let allowed = allowed_routes(serde_json::json!({}));
        assert!(namespace_allowed(Some(&allowed), "ns", "ns", None).unwrap());
        assert!(!namespace_allowed(Some(&allowed), "ns", "other", None).unwrap());
    }

    #[test]
    fn from_all_admits_any_namespace() {
        let allowed = allowed_routes(serde_json::json!({ "namespaces": { "from": "All" } }));
        assert!(namespace_allowed(Some(&allowed), "ns", "other", None).unwrap());
    }

    #[test]
    fn from_selector_consults_namespace_labels() {
        let allowed = allowed_routes(serde_json::json!({
            "namespaces": {
                "from": "Selector",
                "selector": { "matchLabels": { "team": "edge" } },
            }
        }));

        let mut labels = BTreeMap::new();
        labels.insert("team".to_string(), "edge".to_string());
        assert!(namespace_allowed(Some(&allowed), "ns", "other", Some(&labels)).unwrap());

        labels.insert("team".to_string(), "core".to_string());
        assert!(!namespace_allowed(Some(&allowed), "ns", "other", Some(&labels)).unwrap());

        // unknown namespaces are denied, not an error
        assert!(!namespace_allowed(Some(&allowed), "ns", "other", None).unwrap());
    }

    #[test]
    fn selector_match_expressions() {
        let selector = GatewayListenersAllowedRoutesNamespacesSelector {
            match_labels: None,
            match_expressions: Some(vec![
                MatchExpression {
                    key: "env".to_string(),
                    operator: "In".to_string(),
                    values: Some(vec!["prod".to_string(), "staging".to_string()]),
                },
                MatchExpression {
                    key: "legacy".to_string(),
                    operator: "DoesNotExist".to_string(),
                    values: None,
                },
            ]),
        };

        let mut labels = BTreeMap::new();
        labels.insert("env".to_string(), "prod".to_string());
        assert!(selector_matches(&selector, &labels).unwrap());

        labels.insert("legacy".to_string(), "true".to_string());
        assert!(!selector_matches(&selector, &labels).unwrap());
    }

    #[test]
    fn invalid_selector_operator_is_an_error() {
        let selector = GatewayListenersAllowedRoutesNamespacesSelector {
            match_labels: None,
            match_expressions: Some(vec![MatchExpression {
                key: "env".to_string(),
                operator: "Near".to_string(),
                values: None,
            }]),
        };
        assert!(matches!(
            selector_matches(&selector, &BTreeMap::new()),
            Err(Error::InvalidSelectorError(_))
        ));
    }
}
