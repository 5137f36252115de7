//! Provider operation metrics, injected into the provider at construction.

use std::time::Instant;

use metrics::{counter, histogram};
use symk8s_core::State;

pub const PROVIDER: &str = "k8s";

/// Operation labels.
pub mod ops {
    pub const APPLY: &str = "Apply";
    pub const GET: &str = "Get";
    pub const VALIDATE_RULE: &str = "ValidateRule";
    pub const PROJECTOR: &str = "K8sProjector";
    pub const DEPLOYMENT: &str = "K8sDeployment";
    pub const REMOVE_SERVICE: &str = "K8sRemoveService";
    pub const REMOVE_DEPLOYMENT: &str = "K8sRemoveDeployment";
}

/// Operation type labels.
pub mod types {
    pub const APPLY: &str = "apply";
    pub const UPDATE: &str = "update";
    pub const DELETE: &str = "delete";
    pub const GET: &str = "get";
}

pub trait ProviderMetrics: Send + Sync {
    fn operation_latency(&self, start: Instant, operation: &'static str, op_type: &'static str, function: &'static str);
    fn operation_errors(&self, operation: &'static str, op_type: &'static str, error_code: State);
}

/// Emits through the `metrics` facade (Prometheus when the exporter is installed).
#[derive(Debug, Clone, Copy, Default)]
pub struct FacadeMetrics;

impl ProviderMetrics for FacadeMetrics {
    fn operation_latency(&self, start: Instant, operation: &'static str, op_type: &'static str, function: &'static str) {
        histogram!(
            "symk8s_provider_operation_latency_ms",
            start.elapsed().as_secs_f64() * 1000.0,
            "provider" => PROVIDER,
            "operation" => operation,
            "type" => op_type,
            "function" => function
        );
    }

    fn operation_errors(&self, operation: &'static str, op_type: &'static str, error_code: State) {
        counter!(
            "symk8s_provider_operation_errors_total",
            1u64,
            "provider" => PROVIDER,
            "operation" => operation,
            "type" => op_type,
            "code" => error_code.as_str()
        );
    }
}
