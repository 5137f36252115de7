//! Symk8s apply: turns abstract components into Deployments and Services, reconciles
//! them against a cluster and reads them back.
//!
//! The entry point is [`K8sTargetProvider`]; the building blocks are public so callers
//! can render objects without touching a cluster.

#![forbid(unsafe_code)]

pub mod builders;
pub mod codec;
pub mod namespace;
pub mod projector;
pub mod provider;
pub mod readiness;
pub mod retry;
pub mod telemetry;

pub use builders::{
    components_to_deployment, deployment_to_components, fill_service_meta, metadata_to_service, render, strategy_namespace, Rendered,
};
pub use codec::CodecError;
pub use projector::{create_projector, K8sProjector, NoOpProjector, ProjectorKind};
pub use provider::{ApplyFailure, K8sTargetProvider};
pub use retry::{RetryPolicy, Waiter};
pub use telemetry::{FacadeMetrics, ProviderMetrics};
