//! Typed views over the dot-keyed property and metadata maps.
//!
//! Values arrive either as strings holding JSON (`"[{\"containerPort\":80}]"`) or as
//! structured JSON; both decode the same way. Encoding always produces strings.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{
    Container, ContainerPort, EnvVar, LocalObjectReference, ResourceRequirements, Service, ServicePort, Volume, VolumeMount,
};
use serde::de::DeserializeOwned;
use serde_json::Value;
use symk8s_core::{keys, render_value, Metadata, Properties};
use thiserror::Error;

pub const DEFAULT_PULL_POLICY: &str = "Always";
pub const DEFAULT_SERVICE_TYPE: &str = "ClusterIP";
/// Namespace the agent service lives in.
const AGENT_DOMAIN_SUFFIX: &str = ".default.svc.cluster.local";

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("invalid JSON in '{key}': {source}")]
    InvalidJson {
        key: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid number '{value}' in '{key}'")]
    InvalidNumber { key: String, value: String },
}

fn json_value(key: &str, v: Option<&Value>) -> Result<Option<Value>, CodecError> {
    match v {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) if s.trim().is_empty() => Ok(None),
        Some(Value::String(s)) => serde_json::from_str(s)
            .map(Some)
            .map_err(|source| CodecError::InvalidJson { key: key.to_string(), source }),
        Some(other) => Ok(Some(other.clone())),
    }
}

fn decode<T: DeserializeOwned>(key: &str, v: Value) -> Result<T, CodecError> {
    serde_json::from_value(v).map_err(|source| CodecError::InvalidJson { key: key.to_string(), source })
}

fn decode_prop<T: DeserializeOwned>(props: &Properties, key: &str) -> Result<Option<T>, CodecError> {
    json_value(key, props.get(key))?.map(|v| decode(key, v)).transpose()
}

fn decode_meta<T: DeserializeOwned>(metadata: &Metadata, key: &str) -> Result<Option<T>, CodecError> {
    let v = metadata.get(key).map(|s| Value::String(s.clone()));
    json_value(key, v.as_ref())?.map(|v| decode(key, v)).transpose()
}

/// Quantities only deserialize from strings; `{"cpu": 1}` is accepted as `{"cpu": "1"}`.
fn normalize_quantities(v: &mut Value) {
    for section in ["limits", "requests"] {
        if let Some(Value::Object(m)) = v.get_mut(section) {
            for q in m.values_mut() {
                if let Value::Number(n) = q {
                    *q = Value::String(n.to_string());
                }
            }
        }
    }
}

fn to_json_string<T: serde::Serialize>(v: &T) -> String {
    serde_json::to_string(v).unwrap_or_default()
}

/// Per-container settings carried in a component's (or sidecar's) properties.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ContainerProperties {
    pub image: String,
    pub image_pull_policy: String,
    pub ports: Vec<ContainerPort>,
    pub args: Vec<String>,
    pub commands: Vec<String>,
    pub resources: Option<ResourceRequirements>,
    pub volume_mounts: Vec<VolumeMount>,
    pub env: BTreeMap<String, String>,
}

impl ContainerProperties {
    pub fn decode(props: &Properties) -> Result<Self, CodecError> {
        let pull = props.get(keys::CONTAINER_IMAGE_PULL_POLICY).map(render_value).unwrap_or_default();
        let resources = match json_value(keys::CONTAINER_RESOURCES, props.get(keys::CONTAINER_RESOURCES))? {
            Some(mut v) => {
                normalize_quantities(&mut v);
                Some(decode::<ResourceRequirements>(keys::CONTAINER_RESOURCES, v)?)
            }
            None => None,
        };
        let env = props
            .iter()
            .filter_map(|(k, v)| k.strip_prefix(keys::ENV_PREFIX).map(|name| (name.to_string(), render_value(v))))
            .collect();
        Ok(Self {
            image: props.get(keys::CONTAINER_IMAGE).map(render_value).unwrap_or_default(),
            image_pull_policy: if pull.is_empty() { DEFAULT_PULL_POLICY.to_string() } else { pull },
            ports: decode_prop(props, keys::CONTAINER_PORTS)?.unwrap_or_default(),
            args: decode_prop(props, keys::CONTAINER_ARGS)?.unwrap_or_default(),
            commands: decode_prop(props, keys::CONTAINER_COMMANDS)?.unwrap_or_default(),
            resources,
            volume_mounts: decode_prop(props, keys::CONTAINER_VOLUME_MOUNTS)?.unwrap_or_default(),
            env,
        })
    }

    pub fn encode(&self) -> Properties {
        let mut p = Properties::new();
        let mut put = |k: &str, v: String| {
            p.insert(k.to_string(), Value::String(v));
        };
        put(keys::CONTAINER_IMAGE, self.image.clone());
        if !self.image_pull_policy.is_empty() {
            put(keys::CONTAINER_IMAGE_PULL_POLICY, self.image_pull_policy.clone());
        }
        if !self.ports.is_empty() {
            put(keys::CONTAINER_PORTS, to_json_string(&self.ports));
        }
        if !self.args.is_empty() {
            put(keys::CONTAINER_ARGS, to_json_string(&self.args));
        }
        if !self.commands.is_empty() {
            put(keys::CONTAINER_COMMANDS, to_json_string(&self.commands));
        }
        if let Some(r) = self.resources.as_ref().filter(|r| **r != ResourceRequirements::default()) {
            put(keys::CONTAINER_RESOURCES, to_json_string(r));
        }
        if !self.volume_mounts.is_empty() {
            put(keys::CONTAINER_VOLUME_MOUNTS, to_json_string(&self.volume_mounts));
        }
        for (name, value) in &self.env {
            put(&format!("{}{}", keys::ENV_PREFIX, name), value.clone());
        }
        p
    }

    /// `agent` adds the agent address variable pointing at `<agent>.default.svc.cluster.local`.
    pub fn into_container(self, name: &str, agent: Option<&str>) -> Container {
        let mut env: Vec<EnvVar> = self
            .env
            .into_iter()
            .map(|(name, value)| EnvVar { name, value: Some(value), ..Default::default() })
            .collect();
        if let Some(agent) = agent.filter(|a| !a.is_empty()) {
            env.push(EnvVar {
                name: keys::AGENT_ADDRESS.to_string(),
                value: Some(format!("{}{}", agent, AGENT_DOMAIN_SUFFIX)),
                ..Default::default()
            });
        }
        Container {
            name: name.to_string(),
            image: Some(self.image),
            image_pull_policy: Some(self.image_pull_policy),
            ports: (!self.ports.is_empty()).then_some(self.ports),
            args: (!self.args.is_empty()).then_some(self.args),
            command: (!self.commands.is_empty()).then_some(self.commands),
            resources: self.resources,
            volume_mounts: (!self.volume_mounts.is_empty()).then_some(self.volume_mounts),
            env: (!env.is_empty()).then_some(env),
            ..Default::default()
        }
    }

    /// Inverse of [`into_container`](Self::into_container); the injected agent variable is dropped.
    pub fn from_container(c: &Container) -> Self {
        let env = c
            .env
            .iter()
            .flatten()
            .filter(|e| e.name != keys::AGENT_ADDRESS)
            .map(|e| (e.name.clone(), e.value.clone().unwrap_or_default()))
            .collect();
        Self {
            image: c.image.clone().unwrap_or_default(),
            image_pull_policy: c.image_pull_policy.clone().unwrap_or_default(),
            ports: c.ports.clone().unwrap_or_default(),
            args: c.args.clone().unwrap_or_default(),
            commands: c.command.clone().unwrap_or_default(),
            resources: c.resources.clone(),
            volume_mounts: c.volume_mounts.clone().unwrap_or_default(),
            env,
        }
    }
}

/// Service settings carried in deployment (single-pod) or component (services) metadata.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ServiceProperties {
    pub name: Option<String>,
    pub service_type: String,
    pub ports: Vec<ServicePort>,
    pub load_balancer_ip: Option<String>,
    pub annotations: BTreeMap<String, String>,
}

impl ServiceProperties {
    /// `None` when no `service.ports` are declared.
    pub fn decode(metadata: &Metadata) -> Result<Option<Self>, CodecError> {
        let Some(ports) = decode_meta::<Vec<ServicePort>>(metadata, keys::SERVICE_PORTS)? else {
            return Ok(None);
        };
        let service_type = metadata.get(keys::SERVICE_TYPE).filter(|s| !s.is_empty()).cloned();
        let annotations = metadata
            .iter()
            .filter_map(|(k, v)| k.strip_prefix(keys::SERVICE_ANNOTATION_PREFIX).map(|a| (a.to_string(), v.clone())))
            .collect();
        Ok(Some(Self {
            name: metadata.get(keys::SERVICE_NAME).filter(|s| !s.is_empty()).cloned(),
            service_type: service_type.unwrap_or_else(|| DEFAULT_SERVICE_TYPE.to_string()),
            ports,
            load_balancer_ip: metadata.get(keys::SERVICE_LOAD_BALANCER_IP).cloned(),
            annotations,
        }))
    }

    /// Read back from a live service; `name` is kept only when it differs from `default_name`.
    pub fn from_service(svc: &Service, default_name: &str) -> Self {
        let spec = svc.spec.clone().unwrap_or_default();
        let service_type = spec.type_.unwrap_or_else(|| DEFAULT_SERVICE_TYPE.to_string());
        let live_name = svc.metadata.name.clone().unwrap_or_default();
        Self {
            name: (live_name != default_name).then_some(live_name),
            load_balancer_ip: (service_type == "LoadBalancer").then(|| spec.load_balancer_ip.unwrap_or_default()),
            service_type,
            ports: spec.ports.unwrap_or_default(),
            annotations: svc.metadata.annotations.clone().unwrap_or_default(),
        }
    }

    pub fn encode_into(&self, metadata: &mut Metadata) {
        metadata.insert(keys::SERVICE_PORTS.to_string(), to_json_string(&self.ports));
        metadata.insert(keys::SERVICE_TYPE.to_string(), self.service_type.clone());
        if let Some(name) = &self.name {
            metadata.insert(keys::SERVICE_NAME.to_string(), name.clone());
        }
        if let Some(ip) = &self.load_balancer_ip {
            metadata.insert(keys::SERVICE_LOAD_BALANCER_IP.to_string(), ip.clone());
        }
        for (k, v) in &self.annotations {
            metadata.insert(format!("{}{}", keys::SERVICE_ANNOTATION_PREFIX, k), v.clone());
        }
    }
}

/// Pod-level overrides carried in deployment metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct DeploymentProperties {
    pub replicas: i32,
    pub image_pull_secrets: Vec<LocalObjectReference>,
    pub volumes: Vec<Volume>,
    pub node_selector: BTreeMap<String, String>,
}

impl Default for DeploymentProperties {
    fn default() -> Self {
        Self { replicas: 1, image_pull_secrets: Vec::new(), volumes: Vec::new(), node_selector: BTreeMap::new() }
    }
}

impl DeploymentProperties {
    pub fn decode(metadata: &Metadata) -> Result<Self, CodecError> {
        Ok(Self {
            replicas: parse_replicas(metadata)?,
            image_pull_secrets: decode_meta(metadata, keys::DEPLOYMENT_IMAGE_PULL_SECRETS)?.unwrap_or_default(),
            volumes: decode_meta(metadata, keys::POD_VOLUMES)?.unwrap_or_default(),
            node_selector: decode_meta(metadata, keys::DEPLOYMENT_NODE_SELECTOR)?.unwrap_or_default(),
        })
    }
}

/// Accepts `3` as well as the legacy `#3` notation.
fn parse_replicas(metadata: &Metadata) -> Result<i32, CodecError> {
    let Some(raw) = metadata.get(keys::DEPLOYMENT_REPLICAS).map(|s| s.trim()).filter(|s| !s.is_empty()) else {
        return Ok(1);
    };
    let digits = raw.strip_prefix('#').unwrap_or(raw);
    digits
        .parse::<i32>()
        .ok()
        .filter(|n| *n >= 0)
        .ok_or_else(|| CodecError::InvalidNumber { key: keys::DEPLOYMENT_REPLICAS.to_string(), value: raw.to_string() })
}
