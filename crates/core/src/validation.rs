//! Structural requirements a component set must satisfy before a provider applies it,
//! plus the change-detection descriptors used upstream to decide whether a component drifted.

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::{keys, render_value, ComponentSpec, DeploymentStrategy, Metadata, Properties};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("provider requires component type '{expected}', but '{found}' is found instead")]
    ComponentType { expected: String, found: String },
    #[error("required property '{property}' is missing in component {component}")]
    MissingProperty { component: String, property: String },
    #[error("required metadata '{key}' is missing in component {component}")]
    MissingMetadata { component: String, key: String },
    #[error("required sidecar property '{property}' is missing in sidecar {sidecar}")]
    MissingSidecarProperty { sidecar: String, property: String },
}

/// Describes one property (or glob of properties) participating in change detection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PropertyDesc {
    pub name: String,
    #[serde(default)]
    pub ignore_case: bool,
    #[serde(default)]
    pub skip_if_missing: bool,
    #[serde(default)]
    pub prefix_match: bool,
    #[serde(default)]
    pub is_component_name: bool,
}

impl PropertyDesc {
    pub fn new(name: &str, ignore_case: bool, skip_if_missing: bool) -> Self {
        Self { name: name.to_string(), ignore_case, skip_if_missing, ..Default::default() }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComponentValidationRule {
    #[serde(rename = "requiredType", default)]
    pub required_component_type: String,
    #[serde(rename = "changeDetection", default)]
    pub change_detection_properties: Vec<PropertyDesc>,
    #[serde(default)]
    pub change_detection_metadata: Vec<PropertyDesc>,
    #[serde(default)]
    pub required_properties: Vec<String>,
    #[serde(default)]
    pub optional_properties: Vec<String>,
    #[serde(default)]
    pub required_metadata: Vec<String>,
    #[serde(default)]
    pub optional_metadata: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationRule {
    #[serde(rename = "requiredType", default)]
    pub required_component_type: String,
    pub component_validation_rule: ComponentValidationRule,
    pub sidecar_validation_rule: ComponentValidationRule,
    #[serde(default)]
    pub allow_sidecar: bool,
}

impl ValidationRule {
    /// Rule of the k8s target: every container needs an image; sidecars only with `services`.
    pub fn for_k8s(strategy: DeploymentStrategy) -> Self {
        let change_detection = vec![
            PropertyDesc::new("container.*", true, false),
            PropertyDesc::new("env.*", true, true),
        ];
        ValidationRule {
            required_component_type: String::new(),
            allow_sidecar: strategy == DeploymentStrategy::Services,
            component_validation_rule: ComponentValidationRule {
                required_properties: vec![keys::CONTAINER_IMAGE.to_string()],
                change_detection_properties: change_detection.clone(),
                ..Default::default()
            },
            sidecar_validation_rule: ComponentValidationRule {
                required_properties: vec![keys::CONTAINER_IMAGE.to_string()],
                change_detection_properties: change_detection,
                ..Default::default()
            },
        }
    }

    /// First violation wins; components are checked in order.
    pub fn validate(&self, components: &[ComponentSpec]) -> Result<(), ValidationError> {
        components.iter().try_for_each(|c| self.validate_component(c))
    }

    fn validate_component(&self, c: &ComponentSpec) -> Result<(), ValidationError> {
        let required_type = if self.required_component_type.is_empty() {
            &self.component_validation_rule.required_component_type
        } else {
            &self.required_component_type
        };
        if !required_type.is_empty() && *required_type != c.component_type {
            return Err(ValidationError::ComponentType { expected: required_type.clone(), found: c.component_type.clone() });
        }
        for p in &self.component_validation_rule.required_properties {
            if !has_property(&c.properties, p) {
                return Err(ValidationError::MissingProperty { component: c.name.clone(), property: p.clone() });
            }
        }
        for k in &self.component_validation_rule.required_metadata {
            if c.metadata.get(k).map_or(true, |v| v.is_empty()) {
                return Err(ValidationError::MissingMetadata { component: c.name.clone(), key: k.clone() });
            }
        }
        // Sidecars become containers whatever the strategy, so they always need their required properties.
        for sidecar in &c.sidecars {
            for p in &self.sidecar_validation_rule.required_properties {
                if !has_property(&sidecar.properties, p) {
                    return Err(ValidationError::MissingSidecarProperty { sidecar: sidecar.name.clone(), property: p.clone() });
                }
            }
        }
        Ok(())
    }

    /// Whether `new` differs from `old` in anything the rule tracks.
    pub fn is_component_changed(&self, old: &ComponentSpec, new: &ComponentSpec) -> bool {
        let cv = &self.component_validation_rule;
        if detect_changes(&cv.change_detection_properties, &old.name, &new.name, &old.properties, &new.properties) {
            return true;
        }
        if detect_changes(
            &cv.change_detection_metadata,
            &old.name,
            &new.name,
            &metadata_as_properties(&old.metadata),
            &metadata_as_properties(&new.metadata),
        ) {
            return true;
        }
        if self.allow_sidecar {
            if new.sidecars.len() != old.sidecars.len() {
                return true;
            }
            for sidecar in &new.sidecars {
                match old.sidecars.iter().find(|o| o.name == sidecar.name) {
                    Some(o) => {
                        let props = &self.sidecar_validation_rule.change_detection_properties;
                        if detect_changes(props, &o.name, &sidecar.name, &o.properties, &sidecar.properties) {
                            return true;
                        }
                    }
                    None => return true,
                }
            }
        }
        false
    }
}

fn has_property(props: &Properties, key: &str) -> bool {
    props.get(key).map_or(false, |v| !render_value(v).is_empty())
}

fn metadata_as_properties(m: &Metadata) -> Properties {
    m.iter().map(|(k, v)| (k.clone(), Value::String(v.clone()))).collect()
}

fn glob_regex(glob: &str) -> Option<Regex> {
    let pattern = format!("^{}$", regex::escape(glob).replace(r"\*", ".*"));
    Regex::new(&pattern).ok()
}

/// Glob descriptors look at keys on both sides, so a key that only appears in `new`
/// is a change unless the descriptor skips missing values.
fn detect_changes(descs: &[PropertyDesc], old_name: &str, new_name: &str, old: &Properties, new: &Properties) -> bool {
    for d in descs {
        if d.name.contains('*') {
            let Some(re) = glob_regex(&d.name) else { continue };
            let changed = old
                .keys()
                .chain(new.keys())
                .filter(|k| re.is_match(k))
                .any(|k| property_changed(d, old, new, k));
            if changed {
                return true;
            }
        } else if d.is_component_name {
            if !strings_match(old_name, new_name, d.ignore_case, d.prefix_match) {
                return true;
            }
        } else if property_changed(d, old, new, &d.name) {
            return true;
        }
    }
    false
}

fn property_changed(d: &PropertyDesc, old: &Properties, new: &Properties, key: &str) -> bool {
    match (old.get(key), new.get(key)) {
        (Some(o), Some(n)) => !strings_match(&render_value(o), &render_value(n), d.ignore_case, d.prefix_match),
        (None, None) => false,
        _ => !d.skip_if_missing,
    }
}

fn strings_match(a: &str, b: &str, ignore_case: bool, prefix_match: bool) -> bool {
    let (a, b) = if ignore_case { (a.to_lowercase(), b.to_lowercase()) } else { (a.to_string(), b.to_string()) };
    if prefix_match {
        a.starts_with(&b) || b.starts_with(&a)
    } else {
        a == b
    }
}
