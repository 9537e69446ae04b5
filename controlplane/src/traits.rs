use gateway_api::apis::experimental::grpcroutes::{GRPCRoute, GRPCRouteRulesBackendRefs};
use gateway_api::apis::experimental::httproutes::{HTTPRoute, HTTPRouteRulesBackendRefs};
use gateway_api::apis::standard::{gatewayclasses::GatewayClass, gateways::Gateway};
use k8s_openapi::apimachinery::pkg::apis::meta::v1 as metav1;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

use crate::proxyconfig::ProxyConfig;
use crate::route_binding::{ParentRef, RouteKind};

pub trait HasConditions {
    fn get_conditions_mut(&mut self) -> &mut Option<Vec<metav1::Condition>>;
}

impl HasConditions for Gateway {
    fn get_conditions_mut(&mut self) -> &mut Option<Vec<metav1::Condition>> {
        &mut self.status.get_or_insert_with(Default::default).conditions
    }
}

impl HasConditions for GatewayClass {
    fn get_conditions_mut(&mut self) -> &mut Option<Vec<metav1::Condition>> {
        &mut self.status.get_or_insert_with(Default::default).conditions
    }
}

impl HasConditions for ProxyConfig {
    fn get_conditions_mut(&mut self) -> &mut Option<Vec<metav1::Condition>> {
        &mut self.status.get_or_insert_with(Default::default).conditions
    }
}

// The two route kinds share one binding model. This trait is the common
// surface the binding evaluator, the syncer's relevance selector and the
// event mappers operate over.
pub trait RouteResource {
    fn kind(&self) -> RouteKind;
    fn metadata(&self) -> &ObjectMeta;
    fn hostnames(&self) -> Vec<String>;
    fn parent_refs(&self) -> Vec<ParentRef>;
    /// Namespaces named explicitly by backend references; used to decide
    /// which routes a ReferenceGrant change may affect.
    fn backend_namespaces(&self) -> Vec<String>;
}

impl RouteResource for HTTPRoute {
    fn kind(&self) -> RouteKind {
        RouteKind::Http
    }

    fn metadata(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn hostnames(&self) -> Vec<String> {
        self.spec.hostnames.clone().unwrap_or_default()
    }

    fn parent_refs(&self) -> Vec<ParentRef> {
        self.spec
            .parent_refs
            .iter()
            .flatten()
            .map(|parent| ParentRef {
                group: parent.group.clone(),
                kind: parent.kind.clone(),
                name: parent.name.clone(),
                namespace: parent.namespace.clone(),
                section_name: parent.section_name.clone(),
            })
            .collect()
    }

    fn backend_namespaces(&self) -> Vec<String> {
        self.spec
            .rules
            .iter()
            .flatten()
            .flat_map(|rule| rule.backend_refs.iter().flatten())
            .filter_map(|backend| backend.namespace.clone())
            .collect()
    }
}

impl RouteResource for GRPCRoute {
    fn kind(&self) -> RouteKind {
        RouteKind::Grpc
    }

    fn metadata(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn hostnames(&self) -> Vec<String> {
        self.spec.hostnames.clone().unwrap_or_default()
    }

    fn parent_refs(&self) -> Vec<ParentRef> {
        self.spec
            .parent_refs
            .iter()
            .flatten()
            .map(|parent| ParentRef {
                group: parent.group.clone(),
                kind: parent.kind.clone(),
                name: parent.name.clone(),
                namespace: parent.namespace.clone(),
                section_name: parent.section_name.clone(),
            })
            .collect()
    }

    fn backend_namespaces(&self) -> Vec<String> {
        self.spec
            .rules
            .iter()
            .flatten()
            .flat_map(|rule| rule.backend_refs.iter().flatten())
            .filter_map(|backend| backend.namespace.clone())
            .collect()
    }
}

// Backend references carry the same shape on both route kinds but are
// distinct generated types; the builder goes through this trait.
pub trait BackendRef {
    fn name(&self) -> &str;
    fn namespace(&self) -> Option<&str>;
    fn port(&self) -> Option<i32>;
    fn weight(&self) -> Option<i32>;
    fn kind(&self) -> Option<&str>;
}

impl BackendRef for HTTPRouteRulesBackendRefs {
    fn name(&self) -> &str {
        &self.name
    }

    fn namespace(&self) -> Option<&str> {
        self.namespace.as_deref()
    }

    fn port(&self) -> Option<i32> {
        self.port
    }

    fn weight(&self) -> Option<i32> {
        self.weight
    }

    fn kind(&self) -> Option<&str> {
        self.kind.as_deref()
    }
}

impl BackendRef for GRPCRouteRulesBackendRefs {
    fn name(&self) -> &str {
        &self.name
    }

    fn namespace(&self) -> Option<&str> {
        self.namespace.as_deref()
    }

    fn port(&self) -> Option<i32> {
        self.port
    }

    fn weight(&self) -> Option<i32> {
        self.weight
    }

    fn kind(&self) -> Option<&str> {
        self.kind.as_deref()
    }
}
