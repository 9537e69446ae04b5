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

use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{exponential_buckets, Histogram};
use prometheus_client::registry::Registry;

type Labels = Vec<(String, String)>;

// The metric families alerting depends on. Names and label keys are part of
// the controller's contract with its dashboards.
pub struct ControllerMetrics {
    sync_duration: Family<Labels, Histogram>,
    synced_routes: Family<Labels, Gauge>,
    grpc_duration: Family<Labels, Histogram>,
    grpc_calls: Family<Labels, Counter>,
    sync_errors: Family<Labels, Counter>,
}

impl ControllerMetrics {
    pub fn new(registry: &mut Registry) -> Self {
        let sync_duration = Family::<Labels, Histogram>::new_with_constructor(|| {
            Histogram::new(exponential_buckets(0.001, 2.0, 14))
        });
        registry.register(
            "sync_duration_seconds",
            "Duration of full route-table syncs",
            sync_duration.clone(),
        );

        let synced_routes = Family::<Labels, Gauge>::default();
        registry.register(
            "synced_routes",
            "Routes included in the last successful push, per route type",
            synced_routes.clone(),
        );

        let grpc_duration = Family::<Labels, Histogram>::new_with_constructor(|| {
            Histogram::new(exponential_buckets(0.001, 2.0, 14))
        });
        registry.register(
            "grpc_duration_seconds",
            "Duration of proxy control-channel calls",
            grpc_duration.clone(),
        );

        let grpc_calls = Family::<Labels, Counter>::default();
        registry.register(
            "grpc_calls",
            "Proxy control-channel calls, per method and status",
            grpc_calls.clone(),
        );

        let sync_errors = Family::<Labels, Counter>::default();
        registry.register(
            "sync_errors",
            "Route-table sync failures, per error type",
            sync_errors.clone(),
        );

        ControllerMetrics {
            sync_duration,
            synced_routes,
            grpc_duration,
            grpc_calls,
            sync_errors,
        }
    }

    pub fn record_sync_duration(&self, status: &str, elapsed: Duration) {
        self.sync_duration
            .get_or_create(&vec![("status".to_string(), status.to_string())])
            .observe(elapsed.as_secs_f64());
    }

    pub fn set_synced_routes(&self, route_type: &str, count: i64) {
        self.synced_routes
            .get_or_create(&vec![("type".to_string(), route_type.to_string())])
            .set(count);
    }

    pub fn record_grpc_call(&self, method: &str, status: &str, elapsed: Duration) {
        let method_label = ("method".to_string(), method.to_string());
        self.grpc_duration
            .get_or_create(&vec![method_label.clone()])
            .observe(elapsed.as_secs_f64());
        self.grpc_calls
            .get_or_create(&vec![
                method_label,
                ("status".to_string(), status.to_string()),
            ])
            .inc();
    }

    pub fn record_sync_error(&self, error_type: &str) {
        self.sync_errors
            .get_or_create(&vec![(
                "error_type".to_string(),
                error_type.to_string(),
            )])
            .inc();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prometheus_client::encoding::text::encode;

    #[test]
    fn families_expose_the_contract_names() {
        let mut registry = Registry::default();
        let metrics = ControllerMetrics::new(&mut registry);

        metrics.record_sync_duration("success", Duration::from_millis(12));
        metrics.set_synced_routes("http", 3);
        metrics.set_synced_routes("grpc", 1);
        metrics.record_grpc_call("UpdateRoutes", "ok", Duration::from_millis(4));
        metrics.record_sync_error("connection_failed");

        let mut output = String::new();
        encode(&mut output, &registry).expect("encoding should succeed");

        assert!(output.contains("sync_duration_seconds"));
        assert!(output.contains("synced_routes{type=\"http\"} 3"));
        assert!(output.contains("grpc_duration_seconds"));
        assert!(output.contains("grpc_calls_total"));
        assert!(output.contains("sync_errors_total{error_type=\"connection_failed\"} 1"));
    }
}
