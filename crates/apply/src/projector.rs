//! Post-build hooks that may reshape generated objects before they are submitted.

use anyhow::Result;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::Service;
use symk8s_core::{ComponentSpec, Metadata, TargetError};

pub trait K8sProjector: Send + Sync {
    fn project_deployment(
        &self,
        scope: &str,
        name: &str,
        metadata: &Metadata,
        components: &[ComponentSpec],
        deployment: &mut Deployment,
    ) -> Result<()>;

    fn project_service(&self, scope: &str, name: &str, metadata: &Metadata, service: &mut Service) -> Result<()>;
}

/// Leaves objects untouched.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpProjector;

impl K8sProjector for NoOpProjector {
    fn project_deployment(&self, _: &str, _: &str, _: &Metadata, _: &[ComponentSpec], _: &mut Deployment) -> Result<()> {
        Ok(())
    }

    fn project_service(&self, _: &str, _: &str, _: &Metadata, _: &mut Service) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProjectorKind {
    NoOp,
}

impl ProjectorKind {
    /// `""` selects no projector.
    pub fn parse(name: &str) -> Result<Option<Self>, TargetError> {
        match name {
            "" => Ok(None),
            "noop" => Ok(Some(ProjectorKind::NoOp)),
            other => Err(TargetError::CreateProjectorFailed(format!("project type '{}' is unsupported", other))),
        }
    }

    pub fn build(self) -> Box<dyn K8sProjector> {
        match self {
            ProjectorKind::NoOp => Box::new(NoOpProjector),
        }
    }
}

pub fn create_projector(name: &str) -> Result<Option<Box<dyn K8sProjector>>, TargetError> {
    Ok(ProjectorKind::parse(name)?.map(ProjectorKind::build))
}
