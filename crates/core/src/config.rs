//! K8s target provider configuration.

use std::collections::BTreeMap;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::TargetError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DeploymentStrategy {
    /// All components of an instance share one Deployment (one pod).
    #[default]
    #[serde(rename = "single-pod")]
    SinglePod,
    /// One Deployment + Service per component, in the instance scope.
    #[serde(rename = "services")]
    Services,
    /// One Deployment + Service per component, in a namespace named after the instance.
    #[serde(rename = "services-ns", alias = "ns-services")]
    ServicesNs,
}

impl DeploymentStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeploymentStrategy::SinglePod => "single-pod",
            DeploymentStrategy::Services => "services",
            DeploymentStrategy::ServicesNs => "services-ns",
        }
    }
}

impl FromStr for DeploymentStrategy {
    type Err = TargetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "" | "single-pod" => Ok(DeploymentStrategy::SinglePod),
            "services" => Ok(DeploymentStrategy::Services),
            "services-ns" | "ns-services" => Ok(DeploymentStrategy::ServicesNs),
            other => Err(TargetError::BadConfig(format!(
                "invalid deployment strategy '{}'. Expected: single-pod (default), services or services-ns",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfigType {
    /// `config_data` is a kubeconfig file path (default `~/.kube/config`).
    #[default]
    Path,
    /// `config_data` is the kubeconfig content itself.
    Bytes,
}

impl FromStr for ConfigType {
    type Err = TargetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "" | "path" => Ok(ConfigType::Path),
            "bytes" => Ok(ConfigType::Bytes),
            other => Err(TargetError::BadConfig(format!(
                "unrecognized config type '{}', accepted values are: path and bytes",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProviderConfig {
    pub name: String,
    pub config_type: ConfigType,
    pub config_data: String,
    pub context: String,
    pub in_cluster: bool,
    pub projector: String,
    pub deployment_strategy: DeploymentStrategy,
    pub delete_empty_namespace: bool,
    pub retry_count: u32,
    pub retry_interval_in_sec: u64,
    pub no_wait: bool,
    /// Readiness/deletion wait ceiling, written like `5m`, `90s` or `1h 30m`.
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
}

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            config_type: ConfigType::Path,
            config_data: String::new(),
            context: String::new(),
            in_cluster: false,
            projector: String::new(),
            deployment_strategy: DeploymentStrategy::SinglePod,
            delete_empty_namespace: false,
            retry_count: 3,
            retry_interval_in_sec: 2,
            no_wait: false,
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

impl ProviderConfig {
    /// Build from the generic string property map used by provider factories.
    /// Missing or empty entries keep their defaults; malformed ones are `BadConfig`.
    pub fn from_map(props: &BTreeMap<String, String>) -> Result<Self, TargetError> {
        let mut c = ProviderConfig::default();
        let get = |k: &str| props.get(k).map(|s| s.as_str()).filter(|s| !s.is_empty());
        if let Some(v) = get("name") { c.name = v.to_string(); }
        if let Some(v) = get("configType") { c.config_type = v.parse()?; }
        if let Some(v) = get("configData") { c.config_data = v.to_string(); }
        if let Some(v) = get("context") { c.context = v.to_string(); }
        if let Some(v) = get("inCluster") { c.in_cluster = parse_bool("inCluster", v)?; }
        if let Some(v) = get("projector") { c.projector = v.to_string(); }
        if let Some(v) = get("deploymentStrategy") { c.deployment_strategy = v.parse()?; }
        if let Some(v) = get("deleteEmptyNamespace") { c.delete_empty_namespace = parse_bool("deleteEmptyNamespace", v)?; }
        if let Some(v) = get("retryCount") { c.retry_count = parse_num("retryCount", v)?; }
        if let Some(v) = get("retryIntervalInSec") { c.retry_interval_in_sec = parse_num("retryIntervalInSec", v)?; }
        if let Some(v) = get("noWait") { c.no_wait = parse_bool("noWait", v)?; }
        if let Some(v) = get("timeout") { c.timeout = parse_timeout(v)?; }
        c.validate()?;
        Ok(c)
    }

    /// Checks that need more than one field; per-field syntax is enforced while parsing.
    pub fn validate(&self) -> Result<(), TargetError> {
        if !self.in_cluster && self.config_type == ConfigType::Bytes && self.config_data.is_empty() {
            return Err(TargetError::BadConfig("config data is not supplied".into()));
        }
        Ok(())
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_secs(self.retry_interval_in_sec)
    }
}

fn parse_bool(key: &str, v: &str) -> Result<bool, TargetError> {
    match v.to_ascii_lowercase().as_str() {
        "true" | "1" | "t" => Ok(true),
        "false" | "0" | "f" => Ok(false),
        _ => Err(TargetError::BadConfig(format!("invalid bool value '{}' in the '{}' setting", v, key))),
    }
}

fn parse_num<T: FromStr>(key: &str, v: &str) -> Result<T, TargetError> {
    v.trim()
        .parse::<T>()
        .map_err(|_| TargetError::BadConfig(format!("invalid int value '{}' in the '{}' setting", v, key)))
}

/// `0` is accepted without a unit; anything else goes through `humantime`.
pub fn parse_timeout(v: &str) -> Result<Duration, TargetError> {
    let v = v.trim();
    if v == "0" {
        return Ok(Duration::ZERO);
    }
    humantime::parse_duration(v).map_err(|e| TargetError::BadConfig(format!("invalid 'timeout' setting '{}': {}", v, e)))
}
