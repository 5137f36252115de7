//! The k8s target provider: reconciles a deployment step against the cluster and reads it back.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{anyhow, Context};
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::Service;
use symk8s_core::{
    keys, ComponentResultSpec, ComponentSpec, ComponentStep, DeploymentSpec, DeploymentStep, DeploymentStrategy,
    Metadata, ProviderConfig, ResultMap, State, TargetError, ValidationRule,
};
use symk8s_kubehub::{ClusterClient, ConnectError, KubeCluster};
use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};

use crate::builders::{
    components_to_deployment, deployment_to_components, fill_service_meta, metadata_to_service, namespace_or_default,
    strategy_namespace, with_agent,
};
use crate::namespace::{create_namespace, remove_namespace};
use crate::projector::{create_projector, K8sProjector};
use crate::readiness::{deployment_ready, service_ready};
use crate::retry::{RetryPolicy, Waiter};
use crate::telemetry::{ops, types, FacadeMetrics, ProviderMetrics};

/// A failed apply together with whatever per-component results were recorded before it stopped.
#[derive(Debug, Error)]
#[error("{error}")]
pub struct ApplyFailure {
    pub results: ResultMap,
    #[source]
    pub error: TargetError,
}

impl ApplyFailure {
    pub fn state(&self) -> State {
        self.error.state()
    }
}

pub struct K8sTargetProvider {
    config: ProviderConfig,
    client: Arc<dyn ClusterClient>,
    metrics: Arc<dyn ProviderMetrics>,
    waiter: Waiter,
}

impl std::fmt::Debug for K8sTargetProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("K8sTargetProvider").field("config", &self.config).field("waiter", &self.waiter).finish()
    }
}

fn set_results(results: &mut ResultMap, components: &[ComponentSpec], status: State, message: &str) {
    for c in components {
        results.insert(c.name.clone(), ComponentResultSpec::new(status, message));
    }
}

impl K8sTargetProvider {
    /// Connect using `config`; nothing is constructed when the connection can't be resolved.
    #[instrument(skip_all, fields(name = %config.name, strategy = config.deployment_strategy.as_str()))]
    pub async fn init(config: ProviderConfig) -> Result<Self, TargetError> {
        config.validate()?;
        let client = symk8s_kubehub::connect(&config).await.map_err(|e| match e {
            ConnectError::BadConfig(msg) => TargetError::BadConfig(msg),
            other => TargetError::InitFailed(anyhow::Error::new(other)),
        })?;
        info!("k8s target provider initialized");
        Self::with_client(config, Arc::new(KubeCluster::new(client)))
    }

    pub async fn init_with_map(props: &BTreeMap<String, String>) -> Result<Self, TargetError> {
        Self::init(ProviderConfig::from_map(props)?).await
    }

    /// Build over an existing cluster client (in-memory clusters, shared connections).
    pub fn with_client(config: ProviderConfig, client: Arc<dyn ClusterClient>) -> Result<Self, TargetError> {
        config.validate()?;
        let waiter = Waiter::from_config(&config);
        Ok(Self { config, client, metrics: Arc::new(FacadeMetrics), waiter })
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn ProviderMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn config(&self) -> &ProviderConfig {
        &self.config
    }

    pub fn validation_rule(&self) -> ValidationRule {
        ValidationRule::for_k8s(self.config.deployment_strategy)
    }

    fn strategy_namespace<'a>(&self, deployment: &'a DeploymentSpec) -> &'a str {
        strategy_namespace(self.config.deployment_strategy, deployment)
    }

    /// Read the components currently running for `deployment`.
    #[instrument(skip_all, fields(scope = %deployment.scope, instance = %deployment.instance_name))]
    pub async fn get(&self, deployment: &DeploymentSpec, references: &[ComponentStep]) -> Result<Vec<ComponentSpec>, TargetError> {
        let start = Instant::now();
        debug!(references = references.len(), "getting artifacts");
        let res = self.get_components(deployment).await;
        self.metrics.operation_latency(start, ops::GET, types::GET, "get");
        if let Err(e) = &res {
            error!(error = %e, "get failed");
            self.metrics.operation_errors(ops::GET, types::GET, e.state());
        }
        res
    }

    async fn get_components(&self, deployment: &DeploymentSpec) -> Result<Vec<ComponentSpec>, TargetError> {
        match self.config.deployment_strategy {
            DeploymentStrategy::SinglePod => self
                .read_deployment(namespace_or_default(&deployment.scope), &deployment.instance_name)
                .await
                .map_err(TargetError::GetComponentSpecFailed),
            DeploymentStrategy::Services | DeploymentStrategy::ServicesNs => {
                let namespace = self.strategy_namespace(deployment);
                let mut out = Vec::new();
                for declared in deployment.get_component_slice() {
                    let mut found = self
                        .read_deployment(namespace, &declared.name)
                        .await
                        .map_err(TargetError::GetComponentSpecFailed)?;
                    if found.len() > 1 {
                        return Err(TargetError::GetComponentSpecFailed(anyhow!(
                            "can't read multiple components when {} strategy or {} strategy is used",
                            DeploymentStrategy::Services.as_str(),
                            DeploymentStrategy::ServicesNs.as_str()
                        )));
                    }
                    let Some(mut component) = found.pop() else { continue };
                    let service_name = declared
                        .metadata
                        .get(keys::SERVICE_NAME)
                        .filter(|s| !s.is_empty())
                        .cloned()
                        .unwrap_or_else(|| component.name.clone());
                    let live = self
                        .client
                        .get_service(namespace, &service_name)
                        .await
                        .context("failed to fill service meta data")
                        .map_err(TargetError::GetComponentSpecFailed)?;
                    if let Some(svc) = live {
                        fill_service_meta(&svc, &component.name, &mut component.metadata);
                    }
                    out.push(component);
                }
                Ok(out)
            }
        }
    }

    #[instrument(skip(self))]
    async fn read_deployment(&self, namespace: &str, name: &str) -> anyhow::Result<Vec<ComponentSpec>> {
        let Some(d) = self.client.get_deployment(namespace, name).await? else {
            return Ok(Vec::new());
        };
        if d.metadata.deletion_timestamp.is_some() {
            info!("deployment is being deleted, not included");
            return Ok(Vec::new());
        }
        Ok(deployment_to_components(&d))
    }

    /// Validate, then (unless `is_dry_run`) create, update or remove the step's components.
    ///
    /// On success every updated component is `Updated` and every deleted one `Deleted`.
    /// On failure the loop stops; the components of the failing operation carry
    /// `UpdateFailed`/`DeleteFailed` and the rest keep whatever was recorded so far.
    #[instrument(skip_all, fields(scope = %deployment.scope, instance = %deployment.instance_name, dry_run = is_dry_run))]
    pub async fn apply(&self, deployment: &DeploymentSpec, step: &DeploymentStep, is_dry_run: bool) -> Result<ResultMap, ApplyFailure> {
        let start = Instant::now();
        info!(strategy = self.config.deployment_strategy.as_str(), "applying artifacts");
        let res = self.apply_step(deployment, step, is_dry_run).await;
        self.metrics.operation_latency(start, ops::APPLY, types::APPLY, "apply");
        res
    }

    async fn apply_step(&self, deployment: &DeploymentSpec, step: &DeploymentStep, is_dry_run: bool) -> Result<ResultMap, ApplyFailure> {
        if let Err(e) = self.validation_rule().validate(&step.get_components()) {
            error!(error = %e, "failed to validate components");
            self.metrics.operation_errors(ops::VALIDATE_RULE, types::APPLY, State::ValidateFailed);
            return Err(ApplyFailure { results: ResultMap::new(), error: e.into() });
        }
        if is_dry_run {
            debug!("dry run, skipping apply");
            return Ok(ResultMap::new());
        }
        let mut results = step.prepare_result_map();
        let projector = match create_projector(&self.config.projector) {
            Ok(p) => p,
            Err(error) => {
                error!(error = %error, "failed to create projector");
                self.metrics.operation_errors(ops::PROJECTOR, types::APPLY, error.state());
                return Err(ApplyFailure { results, error });
            }
        };
        let projector = projector.as_deref();
        let updated = step.get_updated_components();
        let deleted = step.get_deleted_components();

        let outcome = match self.config.deployment_strategy {
            DeploymentStrategy::SinglePod => self.apply_single_pod(deployment, &updated, &deleted, projector, &mut results).await,
            DeploymentStrategy::Services | DeploymentStrategy::ServicesNs => {
                self.apply_services(deployment, &updated, &deleted, projector, &mut results).await
            }
        };
        match outcome {
            Ok(()) => Ok(results),
            Err(error) => Err(ApplyFailure { results, error }),
        }
    }

    async fn apply_single_pod(
        &self,
        deployment: &DeploymentSpec,
        updated: &[ComponentSpec],
        deleted: &[ComponentSpec],
        projector: Option<&dyn K8sProjector>,
        results: &mut ResultMap,
    ) -> Result<(), TargetError> {
        let namespace = namespace_or_default(&deployment.scope);
        let name = deployment.instance_name.as_str();
        if !updated.is_empty() {
            let start = Instant::now();
            let res = self.deploy_components(namespace, name, &deployment.metadata, updated, projector, name).await;
            self.metrics.operation_latency(start, ops::DEPLOYMENT, types::UPDATE, "deploy_components");
            if let Err(e) = res {
                let error = TargetError::K8sDeploymentFailed(e);
                set_results(results, updated, State::UpdateFailed, &error.to_string());
                return Err(self.fail(ops::DEPLOYMENT, types::UPDATE, error));
            }
            set_results(results, updated, State::Updated, "");
        }
        if deleted.is_empty() {
            return Ok(());
        }
        if !updated.is_empty() {
            // The redeployed pod no longer carries the deleted containers.
            set_results(results, deleted, State::Deleted, "");
            return Ok(());
        }
        let service_name = deployment
            .metadata
            .get(keys::SERVICE_NAME)
            .filter(|s| !s.is_empty())
            .map(String::as_str)
            .unwrap_or(name);
        self.remove_objects(namespace, service_name, name, deleted, results).await?;
        set_results(results, deleted, State::Deleted, "");
        self.cleanup_namespace(namespace).await;
        Ok(())
    }

    async fn apply_services(
        &self,
        deployment: &DeploymentSpec,
        updated: &[ComponentSpec],
        deleted: &[ComponentSpec],
        projector: Option<&dyn K8sProjector>,
        results: &mut ResultMap,
    ) -> Result<(), TargetError> {
        let namespace = self.strategy_namespace(deployment);
        for component in updated {
            let component = with_agent(component, &deployment.metadata);
            let start = Instant::now();
            let res = self
                .deploy_components(
                    namespace,
                    &component.name,
                    &component.metadata,
                    std::slice::from_ref(&component),
                    projector,
                    &deployment.instance_name,
                )
                .await;
            self.metrics.operation_latency(start, ops::DEPLOYMENT, types::UPDATE, "deploy_components");
            if let Err(e) = res {
                let error = TargetError::K8sDeploymentFailed(e);
                set_results(results, std::slice::from_ref(&component), State::UpdateFailed, &error.to_string());
                return Err(self.fail(ops::DEPLOYMENT, types::UPDATE, error));
            }
            set_results(results, std::slice::from_ref(&component), State::Updated, "");
        }
        for component in deleted {
            let service_name = component
                .metadata
                .get(keys::SERVICE_NAME)
                .filter(|s| !s.is_empty())
                .map(String::as_str)
                .unwrap_or(component.name.as_str());
            self.remove_objects(namespace, service_name, &component.name, std::slice::from_ref(component), results).await?;
            set_results(results, std::slice::from_ref(component), State::Deleted, "");
        }
        if !deleted.is_empty() {
            self.cleanup_namespace(namespace).await;
        }
        Ok(())
    }

    fn fail(&self, operation: &'static str, op_type: &'static str, error: TargetError) -> TargetError {
        error!(error = %error, operation, "apply failed");
        self.metrics.operation_errors(operation, op_type, error.state());
        error
    }

    /// Service first, then the deployment; failures mark `affected` as `DeleteFailed`.
    async fn remove_objects(
        &self,
        namespace: &str,
        service_name: &str,
        deployment_name: &str,
        affected: &[ComponentSpec],
        results: &mut ResultMap,
    ) -> Result<(), TargetError> {
        let start = Instant::now();
        let res = self.remove_service(namespace, service_name).await;
        self.metrics.operation_latency(start, ops::REMOVE_SERVICE, types::DELETE, "remove_service");
        if let Err(e) = res {
            let error = TargetError::K8sRemoveServiceFailed(e);
            set_results(results, affected, State::DeleteFailed, &error.to_string());
            return Err(self.fail(ops::REMOVE_SERVICE, types::DELETE, error));
        }
        let start = Instant::now();
        let res = self.remove_deployment(namespace, deployment_name).await;
        self.metrics.operation_latency(start, ops::REMOVE_DEPLOYMENT, types::DELETE, "remove_deployment");
        if let Err(e) = res {
            let error = TargetError::K8sRemoveDeploymentFailed(e);
            set_results(results, affected, State::DeleteFailed, &error.to_string());
            return Err(self.fail(ops::REMOVE_DEPLOYMENT, types::DELETE, error));
        }
        Ok(())
    }

    /// Best effort; failures are logged only.
    async fn cleanup_namespace(&self, namespace: &str) {
        if !self.config.delete_empty_namespace {
            return;
        }
        let policy = RetryPolicy::from_config(&self.config);
        if let Err(e) = remove_namespace(self.client.as_ref(), namespace, &policy).await {
            warn!(namespace = %namespace, error = %e, "failed to remove namespace");
        }
    }

    /// Build, project and upsert the deployment (and service, when declared) for `components`.
    #[instrument(skip(self, metadata, components, projector), fields(components = components.len()))]
    async fn deploy_components(
        &self,
        namespace: &str,
        name: &str,
        metadata: &Metadata,
        components: &[ComponentSpec],
        projector: Option<&dyn K8sProjector>,
        instance_name: &str,
    ) -> anyhow::Result<()> {
        let mut deployment = components_to_deployment(namespace, name, metadata, components, instance_name)?;
        let mut service = metadata_to_service(namespace, name, metadata)?;
        if let Some(p) = projector {
            p.project_deployment(namespace, name, metadata, components, &mut deployment)
                .context("failed to project deployment")?;
            if let Some(svc) = service.as_mut() {
                p.project_service(namespace, name, metadata, svc).context("failed to project service")?;
            }
        }
        create_namespace(self.client.as_ref(), namespace).await?;
        self.upsert_deployment(namespace, name, deployment).await?;
        if let Some(svc) = service {
            let service_name = svc.metadata.name.clone().unwrap_or_else(|| name.to_string());
            self.upsert_service(namespace, &service_name, svc).await?;
        }
        Ok(())
    }

    #[instrument(skip(self, deployment))]
    async fn upsert_deployment(&self, namespace: &str, name: &str, mut deployment: Deployment) -> anyhow::Result<()> {
        let client = self.client.as_ref();
        let existing = client.get_deployment(namespace, name).await.context("looking up deployment")?;
        match existing.filter(|d| d.metadata.deletion_timestamp.is_none()) {
            None => {
                info!("creating deployment");
                client.create_deployment(namespace, &deployment).await?;
            }
            Some(live) => {
                info!("updating deployment");
                deployment.metadata.resource_version = live.metadata.resource_version;
                client.replace_deployment(namespace, &deployment).await?;
            }
        }
        self.waiter
            .until(&format!("deployment {}/{} to be ready", namespace, name), || async move {
                Ok::<_, anyhow::Error>(client.get_deployment(namespace, name).await?.map_or(false, |d| deployment_ready(&d)))
            })
            .await
    }

    #[instrument(skip(self, service))]
    async fn upsert_service(&self, namespace: &str, name: &str, mut service: Service) -> anyhow::Result<()> {
        let client = self.client.as_ref();
        let existing = client.get_service(namespace, name).await.context("looking up service")?;
        match existing.filter(|s| s.metadata.deletion_timestamp.is_none()) {
            None => {
                info!("creating service");
                client.create_service(namespace, &service).await?;
            }
            Some(live) => {
                info!("updating service");
                service.metadata.resource_version = live.metadata.resource_version;
                if let (Some(spec), Some(live_spec)) = (service.spec.as_mut(), live.spec.as_ref()) {
                    if spec.cluster_ip.is_none() {
                        spec.cluster_ip = live_spec.cluster_ip.clone();
                    }
                }
                client.replace_service(namespace, &service).await?;
            }
        }
        self.waiter
            .until(&format!("service {}/{} to be ready", namespace, name), || async move {
                Ok::<_, anyhow::Error>(client.get_service(namespace, name).await?.map_or(false, |s| service_ready(&s)))
            })
            .await
    }

    #[instrument(skip(self))]
    async fn remove_service(&self, namespace: &str, name: &str) -> anyhow::Result<()> {
        let client = self.client.as_ref();
        if client.get_service(namespace, name).await?.is_some() {
            info!("removing service");
            client.delete_service(namespace, name).await?;
        }
        self.waiter
            .until(&format!("service {}/{} to be deleted", namespace, name), || async move {
                Ok::<_, anyhow::Error>(client.get_service(namespace, name).await?.is_none())
            })
            .await
    }

    #[instrument(skip(self))]
    async fn remove_deployment(&self, namespace: &str, name: &str) -> anyhow::Result<()> {
        let client = self.client.as_ref();
        info!("removing deployment");
        client.delete_deployment(namespace, name).await?;
        self.waiter
            .until(&format!("deployment {}/{} to be deleted", namespace, name), || async move {
                Ok::<_, anyhow::Error>(client.get_deployment(namespace, name).await?.is_none())
            })
            .await
    }
}
