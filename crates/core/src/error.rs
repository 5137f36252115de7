use thiserror::Error;

use crate::{State, ValidationError};

/// Categorized failures surfaced by the k8s target provider.
#[derive(Debug, Error)]
pub enum TargetError {
    #[error("bad config: {0}")]
    BadConfig(String),
    #[error("failed to init: {0:#}")]
    InitFailed(#[source] anyhow::Error),
    #[error("the rule validation failed: {0}")]
    ValidateFailed(#[from] ValidationError),
    #[error("failed to get components from deployment spec: {0:#}")]
    GetComponentSpecFailed(#[source] anyhow::Error),
    #[error("failed to create projector: {0}")]
    CreateProjectorFailed(String),
    #[error("failed to deploy components: {0:#}")]
    K8sDeploymentFailed(#[source] anyhow::Error),
    #[error("failed to remove k8s deployment: {0:#}")]
    K8sRemoveDeploymentFailed(#[source] anyhow::Error),
    #[error("failed to remove k8s service: {0:#}")]
    K8sRemoveServiceFailed(#[source] anyhow::Error),
}

impl TargetError {
    pub fn state(&self) -> State {
        match self {
            TargetError::BadConfig(_) => State::BadConfig,
            TargetError::InitFailed(_) => State::InitFailed,
            TargetError::ValidateFailed(_) => State::ValidateFailed,
            TargetError::GetComponentSpecFailed(_) => State::GetComponentSpecFailed,
            TargetError::CreateProjectorFailed(_) => State::CreateProjectorFailed,
            TargetError::K8sDeploymentFailed(_) => State::K8sDeploymentFailed,
            TargetError::K8sRemoveDeploymentFailed(_) => State::K8sRemoveDeploymentFailed,
            TargetError::K8sRemoveServiceFailed(_) => State::K8sRemoveServiceFailed,
        }
    }
}
