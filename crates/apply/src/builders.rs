//! Pure conversions between abstract components and Deployment/Service objects.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{PodSpec, PodTemplateSpec, Service, ServiceSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use symk8s_core::{keys, ComponentSpec, DeploymentStrategy, Metadata, SidecarSpec};
use tracing::debug;

use crate::codec::{CodecError, ContainerProperties, DeploymentProperties, ServiceProperties};

pub const APP_LABEL: &str = "app";
const SIDECAR_LABEL_SUFFIX: &str = ".sidecar_of";

/// Pod-template label marking `container` as a sidecar; the value is the owning component.
pub fn sidecar_label(container: &str) -> String {
    format!("{}{}", container, SIDECAR_LABEL_SUFFIX)
}

pub fn namespace_or_default(scope: &str) -> &str {
    if scope.is_empty() {
        "default"
    } else {
        scope
    }
}

fn app_labels(name: &str) -> BTreeMap<String, String> {
    BTreeMap::from([(APP_LABEL.to_string(), name.to_string())])
}

/// One container per component plus one per sidecar, in declaration order.
/// Any malformed property or metadata value fails the whole build.
pub fn components_to_deployment(
    scope: &str,
    name: &str,
    metadata: &Metadata,
    components: &[ComponentSpec],
    instance_name: &str,
) -> Result<Deployment, CodecError> {
    let pod = DeploymentProperties::decode(metadata)?;
    let agent = metadata.get(keys::AGENT_ADDRESS).map(|s| s.as_str());
    let mut template_labels = app_labels(name);
    let mut containers = Vec::new();
    for c in components {
        containers.push(ContainerProperties::decode(&c.properties)?.into_container(&c.name, agent));
        for sidecar in &c.sidecars {
            containers.push(ContainerProperties::decode(&sidecar.properties)?.into_container(&sidecar.name, agent));
            template_labels.insert(sidecar_label(&sidecar.name), c.name.clone());
        }
    }
    debug!(name = %name, instance = %instance_name, containers = containers.len(), "built deployment");
    Ok(Deployment {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace_or_default(scope).to_string()),
            ..Default::default()
        },
        spec: Some(DeploymentSpec {
            replicas: Some(pod.replicas),
            selector: LabelSelector { match_labels: Some(app_labels(name)), ..Default::default() },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta { labels: Some(template_labels), ..Default::default() }),
                spec: Some(PodSpec {
                    containers,
                    image_pull_secrets: (!pod.image_pull_secrets.is_empty()).then_some(pod.image_pull_secrets),
                    volumes: (!pod.volumes.is_empty()).then_some(pod.volumes),
                    node_selector: (!pod.node_selector.is_empty()).then_some(pod.node_selector),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    })
}

/// Inverse of [`components_to_deployment`]: sidecar containers are folded back into their owner.
pub fn deployment_to_components(deployment: &Deployment) -> Vec<ComponentSpec> {
    let Some(template) = deployment.spec.as_ref().map(|s| &s.template) else {
        return Vec::new();
    };
    let labels = template.metadata.as_ref().and_then(|m| m.labels.clone()).unwrap_or_default();
    let containers = template.spec.as_ref().map(|s| s.containers.as_slice()).unwrap_or_default();
    let owner_of = |container: &str| labels.get(&sidecar_label(container)).filter(|o| !o.is_empty());

    let mut components: Vec<ComponentSpec> = containers
        .iter()
        .filter(|c| owner_of(&c.name).is_none())
        .map(|c| ComponentSpec {
            name: c.name.clone(),
            properties: ContainerProperties::from_container(c).encode(),
            ..Default::default()
        })
        .collect();
    for c in containers {
        let Some(owner) = owner_of(&c.name) else { continue };
        if let Some(component) = components.iter_mut().find(|comp| &comp.name == owner) {
            component.sidecars.push(SidecarSpec {
                name: c.name.clone(),
                properties: ContainerProperties::from_container(c).encode(),
                ..Default::default()
            });
        }
    }
    debug!(components = components.len(), "read components from deployment");
    components
}

/// `None` when the metadata declares no service ports.
pub fn metadata_to_service(scope: &str, name: &str, metadata: &Metadata) -> Result<Option<Service>, CodecError> {
    let Some(props) = ServiceProperties::decode(metadata)? else {
        return Ok(None);
    };
    Ok(Some(Service {
        metadata: ObjectMeta {
            name: Some(props.name.unwrap_or_else(|| name.to_string())),
            namespace: Some(namespace_or_default(scope).to_string()),
            labels: Some(app_labels(name)),
            annotations: (!props.annotations.is_empty()).then_some(props.annotations),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            type_: Some(props.service_type),
            ports: Some(props.ports),
            selector: Some(app_labels(name)),
            load_balancer_ip: props.load_balancer_ip,
            ..Default::default()
        }),
        ..Default::default()
    }))
}

/// Copy live service settings into `metadata`; `service.name` only when it differs from `name`.
pub fn fill_service_meta(service: &Service, name: &str, metadata: &mut Metadata) {
    ServiceProperties::from_service(service, name).encode_into(metadata);
}

/// Namespace the objects of `instance` live in: the instance name under `services-ns`, else the scope.
pub fn strategy_namespace(strategy: DeploymentStrategy, instance: &symk8s_core::DeploymentSpec) -> &str {
    match strategy {
        DeploymentStrategy::ServicesNs => &instance.instance_name,
        DeploymentStrategy::SinglePod | DeploymentStrategy::Services => namespace_or_default(&instance.scope),
    }
}

/// Copy of `component` carrying the instance-level agent address, when there is one.
pub fn with_agent(component: &ComponentSpec, instance_metadata: &Metadata) -> ComponentSpec {
    let mut c = component.clone();
    if let Some(agent) = instance_metadata.get(keys::AGENT_ADDRESS).filter(|v| !v.is_empty()) {
        c.metadata.insert(keys::AGENT_ADDRESS.to_string(), agent.clone());
    }
    c
}

/// Objects submitted for one deployment unit.
#[derive(Debug, Clone, PartialEq)]
pub struct Rendered {
    pub deployment: Deployment,
    pub service: Option<Service>,
}

/// Build every object `components` map to under `strategy`, without projecting or submitting.
pub fn render(
    strategy: DeploymentStrategy,
    instance: &symk8s_core::DeploymentSpec,
    components: &[ComponentSpec],
) -> Result<Vec<Rendered>, CodecError> {
    let namespace = strategy_namespace(strategy, instance);
    match strategy {
        DeploymentStrategy::SinglePod => {
            let name = &instance.instance_name;
            Ok(vec![Rendered {
                deployment: components_to_deployment(namespace, name, &instance.metadata, components, name)?,
                service: metadata_to_service(namespace, name, &instance.metadata)?,
            }])
        }
        DeploymentStrategy::Services | DeploymentStrategy::ServicesNs => components
            .iter()
            .map(|c| {
                let c = with_agent(c, &instance.metadata);
                Ok::<_, CodecError>(Rendered {
                    deployment: components_to_deployment(
                        namespace,
                        &c.name,
                        &c.metadata,
                        std::slice::from_ref(&c),
                        &instance.instance_name,
                    )?,
                    service: metadata_to_service(namespace, &c.name, &c.metadata)?,
                })
            })
            .collect(),
    }
}
