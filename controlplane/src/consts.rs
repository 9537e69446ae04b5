// Default controller identifier recorded on GatewayClasses we manage.
pub const GATEWAY_CLASS_CONTROLLER_NAME: &str = "pingora.dev/gateway-controller";

// Default name of the GatewayClass this controller instance watches.
pub const DEFAULT_GATEWAY_CLASS_NAME: &str = "pingora";

// Default cluster DNS suffix used when assembling backend addresses.
pub const DEFAULT_CLUSTER_DOMAIN: &str = "cluster.local";

// Field manager for the Pingora gateway controller.
pub const PINGORA_FIELD_MANAGER: &str = "pingora-gateway-controller";

// API group of the upstream Gateway API resources.
pub const GATEWAY_API_GROUP: &str = "gateway.networking.k8s.io";

// Group and kind a GatewayClass parametersRef must carry to bind a ProxyConfig.
pub const PROXY_CONFIG_GROUP: &str = "pingora.dev";
pub const PROXY_CONFIG_KIND: &str = "ProxyConfig";

// Entries expected in the TLS credential Secret.
pub const TLS_CERT_KEY: &str = "tls.crt";
pub const TLS_PRIVATE_KEY_KEY: &str = "tls.key";
pub const TLS_CA_KEY: &str = "ca.crt";

// Requeue interval after a failed resolve, dial or push.
pub const SYNC_RETRY_SECONDS: u64 = 30;

// Requeue interval while the startup sync has not completed yet.
pub const STARTUP_REQUEUE_SECONDS: u64 = 1;

// Attempts for optimistic-concurrency status updates before giving up.
pub const STATUS_UPDATE_MAX_RETRIES: u32 = 5;
