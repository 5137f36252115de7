//! Provider configuration to kube client configuration.

use std::path::PathBuf;

use kube::config::{InClusterError, KubeConfigOptions, Kubeconfig, KubeconfigError};
use kube::{Client, Config};
use symk8s_core::{ConfigType, ProviderConfig};
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("bad config: {0}")]
    BadConfig(String),
    #[error("kubeconfig: {0}")]
    Kubeconfig(#[from] KubeconfigError),
    #[error("in-cluster config: {0}")]
    InCluster(#[from] InClusterError),
    #[error("building kube client: {0}")]
    Client(#[from] kube::Error),
}

fn default_kubeconfig_path() -> Result<PathBuf, ConnectError> {
    dirs::home_dir()
        .map(|home| home.join(".kube").join("config"))
        .ok_or_else(|| ConnectError::BadConfig("can't locate home directory to read default kubernetes config file".into()))
}

/// Resolve the cluster endpoint and credentials described by `cfg`.
pub async fn resolve_config(cfg: &ProviderConfig) -> Result<Config, ConnectError> {
    if cfg.in_cluster {
        info!("using in-cluster service account config");
        return Ok(Config::incluster()?);
    }
    let kubeconfig = match cfg.config_type {
        ConfigType::Path => {
            let path = if cfg.config_data.is_empty() { default_kubeconfig_path()? } else { PathBuf::from(&cfg.config_data) };
            debug!(path = %path.display(), "reading kubeconfig");
            Kubeconfig::read_from(&path)?
        }
        ConfigType::Bytes => {
            if cfg.config_data.is_empty() {
                return Err(ConnectError::BadConfig("config data is not supplied".into()));
            }
            Kubeconfig::from_yaml(&cfg.config_data)?
        }
    };
    let options = KubeConfigOptions {
        context: (!cfg.context.is_empty()).then(|| cfg.context.clone()),
        ..Default::default()
    };
    let config = Config::from_custom_kubeconfig(kubeconfig, &options).await?;
    info!(cluster = %config.cluster_url, context = %cfg.context, "resolved kubeconfig");
    Ok(config)
}

pub async fn connect(cfg: &ProviderConfig) -> Result<Client, ConnectError> {
    let config = resolve_config(cfg).await?;
    Ok(Client::try_from(config)?)
}
