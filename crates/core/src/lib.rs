//! Symk8s core types: the abstract component model handed to the k8s target,
//! provider configuration, validation rules and error kinds.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub mod config;
pub mod error;
pub mod state;
pub mod validation;

pub use config::{ConfigType, DeploymentStrategy, ProviderConfig};
pub use error::TargetError;
pub use state::State;
pub use validation::{ComponentValidationRule, PropertyDesc, ValidationError, ValidationRule};

/// Flat string metadata attached to instances and components.
pub type Metadata = BTreeMap<String, String>;
/// Schema-less component properties; values are usually strings holding JSON.
pub type Properties = BTreeMap<String, Value>;
/// Per-component outcome of an apply, keyed by component name.
pub type ResultMap = BTreeMap<String, ComponentResultSpec>;

/// Well-known property and metadata keys.
pub mod keys {
    pub const CONTAINER_IMAGE: &str = "container.image";
    pub const CONTAINER_IMAGE_PULL_POLICY: &str = "container.imagePullPolicy";
    pub const CONTAINER_PORTS: &str = "container.ports";
    pub const CONTAINER_ARGS: &str = "container.args";
    pub const CONTAINER_COMMANDS: &str = "container.commands";
    pub const CONTAINER_RESOURCES: &str = "container.resources";
    pub const CONTAINER_VOLUME_MOUNTS: &str = "container.volumeMounts";
    pub const ENV_PREFIX: &str = "env.";

    pub const SERVICE_PORTS: &str = "service.ports";
    pub const SERVICE_TYPE: &str = "service.type";
    pub const SERVICE_NAME: &str = "service.name";
    pub const SERVICE_LOAD_BALANCER_IP: &str = "service.loadBalancerIP";
    pub const SERVICE_ANNOTATION_PREFIX: &str = "service.annotation.";

    pub const DEPLOYMENT_REPLICAS: &str = "deployment.replicas";
    pub const DEPLOYMENT_IMAGE_PULL_SECRETS: &str = "deployment.imagePullSecrets";
    pub const DEPLOYMENT_NODE_SELECTOR: &str = "deployment.nodeSelector";
    pub const POD_VOLUMES: &str = "pod.volumes";

    /// Metadata key naming the agent; also the env var injected into containers.
    pub const AGENT_ADDRESS: &str = "SYMPHONY_AGENT_ADDRESS";
}

/// Render a property value the way the legacy string map carried it:
/// strings verbatim, `null` as empty, anything else as JSON text.
pub fn render_value(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SidecarSpec {
    pub name: String,
    #[serde(rename = "type", default, skip_serializing_if = "String::is_empty")]
    pub component_type: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub properties: Properties,
}

/// Abstract unit of deployable work; maps to one container plus optional sidecars.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComponentSpec {
    pub name: String,
    #[serde(rename = "type", default, skip_serializing_if = "String::is_empty")]
    pub component_type: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: Metadata,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub properties: Properties,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sidecars: Vec<SidecarSpec>,
}

impl ComponentSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), ..Default::default() }
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn with_sidecar(mut self, sidecar: SidecarSpec) -> Self {
        self.sidecars.push(sidecar);
        self
    }

    /// Property rendered as a string; empty when absent.
    pub fn property_str(&self, key: &str) -> String {
        self.properties.get(key).map(render_value).unwrap_or_default()
    }
}

impl From<ComponentSpec> for SidecarSpec {
    fn from(c: ComponentSpec) -> Self {
        Self { name: c.name, component_type: c.component_type, properties: c.properties }
    }
}

/// Instance-level view of what should run on the target.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentSpec {
    /// Target namespace; empty means `default`.
    #[serde(default)]
    pub scope: String,
    pub instance_name: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: Metadata,
    #[serde(default)]
    pub components: Vec<ComponentSpec>,
}

impl DeploymentSpec {
    pub fn get_component_slice(&self) -> &[ComponentSpec] {
        &self.components
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComponentAction {
    Update,
    Delete,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentStep {
    pub action: ComponentAction,
    pub component: ComponentSpec,
}

/// The delta to apply on one target: components partitioned into updates and deletions.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentStep {
    #[serde(default)]
    pub target: String,
    #[serde(default)]
    pub components: Vec<ComponentStep>,
}

impl DeploymentStep {
    pub fn new(components: Vec<ComponentStep>) -> Self {
        Self { target: String::new(), components }
    }

    /// Every component in the step starts as `Untouched`.
    pub fn prepare_result_map(&self) -> ResultMap {
        self.components
            .iter()
            .map(|c| (c.component.name.clone(), ComponentResultSpec::new(State::Untouched, "")))
            .collect()
    }

    pub fn get_components(&self) -> Vec<ComponentSpec> {
        self.components.iter().map(|c| c.component.clone()).collect()
    }

    pub fn get_updated_components(&self) -> Vec<ComponentSpec> {
        self.by_action(ComponentAction::Update)
    }

    pub fn get_deleted_components(&self) -> Vec<ComponentSpec> {
        self.by_action(ComponentAction::Delete)
    }

    fn by_action(&self, action: ComponentAction) -> Vec<ComponentSpec> {
        self.components.iter().filter(|c| c.action == action).map(|c| c.component.clone()).collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComponentResultSpec {
    pub status: State,
    #[serde(default)]
    pub message: String,
}

impl ComponentResultSpec {
    pub fn new(status: State, message: impl Into<String>) -> Self {
        Self { status, message: message.into() }
    }
}
