//! In-memory [`ClusterClient`] that behaves like a small, instantly-converging API server.
//!
//! Objects get a uid, a bumped `resourceVersion` on every write and a `generation`;
//! deployments report as rolled out and services get a cluster IP right away.
//! Every call is counted per verb and any verb can be made to fail.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Mutex, MutexGuard};

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{Deployment, DeploymentStatus};
use k8s_openapi::api::core::v1::{LoadBalancerIngress, LoadBalancerStatus, Namespace, Service, ServiceStatus};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};

use crate::{object_name, ClusterClient, ResourceKind};

type Key = (String, String);

#[derive(Default)]
struct Inner {
    namespaces: BTreeSet<String>,
    deployments: BTreeMap<Key, Deployment>,
    services: BTreeMap<Key, Service>,
    seeded: BTreeMap<(String, ResourceKind), usize>,
    draining_pods: BTreeSet<String>,
    calls: BTreeMap<&'static str, usize>,
    failures: BTreeMap<&'static str, String>,
    revision: u64,
}

impl Inner {
    fn record(&mut self, verb: &'static str) -> Result<()> {
        *self.calls.entry(verb).or_default() += 1;
        match self.failures.get(verb) {
            Some(msg) => Err(anyhow!("{}", msg)),
            None => Ok(()),
        }
    }

    fn next_revision(&mut self) -> String {
        self.revision += 1;
        self.revision.to_string()
    }

    fn ensure_namespace(&self, namespace: &str) -> Result<()> {
        if !self.namespaces.contains(namespace) {
            bail!("namespaces \"{}\" not found", namespace);
        }
        Ok(())
    }

    fn stamp(&mut self, meta: &mut ObjectMeta, namespace: &str, generation: i64) {
        meta.namespace = Some(namespace.to_string());
        meta.resource_version = Some(self.next_revision());
        meta.generation = Some(generation);
        if meta.uid.is_none() {
            meta.uid = Some(uuid::Uuid::new_v4().to_string());
        }
    }

    fn service_ip(&self) -> String {
        format!("10.96.0.{}", self.revision % 250 + 1)
    }
}

/// Verbs that write. Calls are counted under the trait method name (`get_deployment`, `count`, ...).
pub const MUTATING_VERBS: [&str; 8] = [
    "create_deployment",
    "replace_deployment",
    "delete_deployment",
    "create_service",
    "replace_service",
    "delete_service",
    "create_namespace",
    "delete_namespace",
];

pub struct InMemoryCluster {
    inner: Mutex<Inner>,
}

impl Default for InMemoryCluster {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryCluster {
    /// A cluster that only has the `default` namespace.
    pub fn new() -> Self {
        let mut inner = Inner::default();
        inner.namespaces.insert("default".to_string());
        Self { inner: Mutex::new(inner) }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Make every later call of `verb` fail with `message`.
    pub fn fail_on(&self, verb: &'static str, message: &str) {
        self.lock().failures.insert(verb, message.to_string());
    }

    pub fn clear_failures(&self) {
        self.lock().failures.clear();
    }

    pub fn calls(&self, verb: &str) -> usize {
        self.lock().calls.get(verb).copied().unwrap_or(0)
    }

    pub fn total_calls(&self) -> usize {
        self.lock().calls.values().sum()
    }

    pub fn mutations(&self) -> usize {
        let inner = self.lock();
        MUTATING_VERBS.iter().map(|v| inner.calls.get(v).copied().unwrap_or(0)).sum()
    }

    pub fn reset_calls(&self) {
        self.lock().calls.clear();
    }

    pub fn add_namespace(&self, name: &str) {
        self.lock().namespaces.insert(name.to_string());
    }

    pub fn has_namespace(&self, name: &str) -> bool {
        self.lock().namespaces.contains(name)
    }

    pub fn deployment(&self, namespace: &str, name: &str) -> Option<Deployment> {
        self.lock().deployments.get(&(namespace.to_string(), name.to_string())).cloned()
    }

    pub fn service(&self, namespace: &str, name: &str) -> Option<Service> {
        self.lock().services.get(&(namespace.to_string(), name.to_string())).cloned()
    }

    pub fn deployment_names(&self, namespace: &str) -> Vec<String> {
        self.lock().deployments.keys().filter(|(ns, _)| ns == namespace).map(|(_, n)| n.clone()).collect()
    }

    pub fn service_names(&self, namespace: &str) -> Vec<String> {
        self.lock().services.keys().filter(|(ns, _)| ns == namespace).map(|(_, n)| n.clone()).collect()
    }

    /// Pretend `count` objects of `kind` live in `namespace` (besides stored deployments/services).
    pub fn seed(&self, namespace: &str, kind: ResourceKind, count: usize) {
        self.lock().seeded.insert((namespace.to_string(), kind), count);
    }

    /// Seeded pods in `namespace` terminate one per listing.
    pub fn drain_pods(&self, namespace: &str) {
        self.lock().draining_pods.insert(namespace.to_string());
    }

    /// Set a deletion timestamp, as the API server does while finalizers run.
    pub fn mark_deleting(&self, namespace: &str, name: &str) {
        let mut inner = self.lock();
        if let Some(d) = inner.deployments.get_mut(&(namespace.to_string(), name.to_string())) {
            d.metadata.deletion_timestamp = Some(Time(chrono::Utc::now()));
        }
    }

    fn roll_out(d: &mut Deployment) {
        let generation = d.metadata.generation;
        let replicas = d.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1);
        d.status = Some(DeploymentStatus {
            observed_generation: generation,
            replicas: Some(replicas),
            updated_replicas: Some(replicas),
            ready_replicas: Some(replicas),
            available_replicas: Some(replicas),
            ..Default::default()
        });
    }

    fn expose(ip: String, s: &mut Service) {
        let spec = s.spec.get_or_insert_with(Default::default);
        let ty = spec.type_.clone().unwrap_or_else(|| "ClusterIP".to_string());
        if ty == "ExternalName" {
            return;
        }
        spec.cluster_ip = Some(ip);
        if ty == "LoadBalancer" {
            s.status = Some(ServiceStatus {
                load_balancer: Some(LoadBalancerStatus {
                    ingress: Some(vec![LoadBalancerIngress { ip: Some("203.0.113.10".to_string()), ..Default::default() }]),
                }),
                ..Default::default()
            });
        }
    }
}

#[async_trait]
impl ClusterClient for InMemoryCluster {
    async fn get_deployment(&self, namespace: &str, name: &str) -> Result<Option<Deployment>> {
        let mut inner = self.lock();
        inner.record("get_deployment")?;
        Ok(inner.deployments.get(&(namespace.to_string(), name.to_string())).cloned())
    }

    async fn create_deployment(&self, namespace: &str, deployment: &Deployment) -> Result<Deployment> {
        let mut inner = self.lock();
        inner.record("create_deployment")?;
        inner.ensure_namespace(namespace)?;
        let key = (namespace.to_string(), object_name(&deployment.metadata).to_string());
        // A deployment under deletion is treated as already gone by the time the create lands.
        if inner.deployments.get(&key).map_or(false, |d| d.metadata.deletion_timestamp.is_none()) {
            bail!("deployments.apps \"{}\" already exists", key.1);
        }
        let mut d = deployment.clone();
        inner.stamp(&mut d.metadata, namespace, 1);
        Self::roll_out(&mut d);
        inner.deployments.insert(key, d.clone());
        Ok(d)
    }

    async fn replace_deployment(&self, namespace: &str, deployment: &Deployment) -> Result<Deployment> {
        let mut inner = self.lock();
        inner.record("replace_deployment")?;
        let key = (namespace.to_string(), object_name(&deployment.metadata).to_string());
        let Some(live) = inner.deployments.get(&key) else {
            bail!("deployments.apps \"{}\" not found", key.1);
        };
        if deployment.metadata.resource_version != live.metadata.resource_version {
            bail!("Operation cannot be fulfilled on deployments.apps \"{}\": the object has been modified", key.1);
        }
        let generation = live.metadata.generation.unwrap_or(0) + 1;
        let uid = live.metadata.uid.clone();
        let mut d = deployment.clone();
        d.metadata.uid = uid;
        inner.stamp(&mut d.metadata, namespace, generation);
        Self::roll_out(&mut d);
        inner.deployments.insert(key, d.clone());
        Ok(d)
    }

    async fn delete_deployment(&self, namespace: &str, name: &str) -> Result<()> {
        let mut inner = self.lock();
        inner.record("delete_deployment")?;
        inner.deployments.remove(&(namespace.to_string(), name.to_string()));
        Ok(())
    }

    async fn get_service(&self, namespace: &str, name: &str) -> Result<Option<Service>> {
        let mut inner = self.lock();
        inner.record("get_service")?;
        Ok(inner.services.get(&(namespace.to_string(), name.to_string())).cloned())
    }

    async fn create_service(&self, namespace: &str, service: &Service) -> Result<Service> {
        let mut inner = self.lock();
        inner.record("create_service")?;
        inner.ensure_namespace(namespace)?;
        let key = (namespace.to_string(), object_name(&service.metadata).to_string());
        if inner.services.contains_key(&key) {
            bail!("services \"{}\" already exists", key.1);
        }
        let mut s = service.clone();
        inner.stamp(&mut s.metadata, namespace, 1);
        s.metadata.generation = None;
        let ip = inner.service_ip();
        Self::expose(ip, &mut s);
        inner.services.insert(key, s.clone());
        Ok(s)
    }

    async fn replace_service(&self, namespace: &str, service: &Service) -> Result<Service> {
        let mut inner = self.lock();
        inner.record("replace_service")?;
        let key = (namespace.to_string(), object_name(&service.metadata).to_string());
        let Some(live) = inner.services.get(&key) else {
            bail!("services \"{}\" not found", key.1);
        };
        if service.metadata.resource_version != live.metadata.resource_version {
            bail!("Operation cannot be fulfilled on services \"{}\": the object has been modified", key.1);
        }
        let ip = live.spec.as_ref().and_then(|s| s.cluster_ip.clone());
        let uid = live.metadata.uid.clone();
        let mut s = service.clone();
        s.metadata.uid = uid;
        inner.stamp(&mut s.metadata, namespace, 1);
        s.metadata.generation = None;
        let ip = ip.unwrap_or_else(|| inner.service_ip());
        Self::expose(ip, &mut s);
        inner.services.insert(key, s.clone());
        Ok(s)
    }

    async fn delete_service(&self, namespace: &str, name: &str) -> Result<()> {
        let mut inner = self.lock();
        inner.record("delete_service")?;
        inner.services.remove(&(namespace.to_string(), name.to_string()));
        Ok(())
    }

    async fn get_namespace(&self, name: &str) -> Result<Option<Namespace>> {
        let mut inner = self.lock();
        inner.record("get_namespace")?;
        Ok(inner.namespaces.get(name).map(|n| Namespace {
            metadata: ObjectMeta { name: Some(n.clone()), ..Default::default() },
            ..Default::default()
        }))
    }

    async fn create_namespace(&self, name: &str) -> Result<()> {
        let mut inner = self.lock();
        inner.record("create_namespace")?;
        if !inner.namespaces.insert(name.to_string()) {
            bail!("namespaces \"{}\" already exists", name);
        }
        Ok(())
    }

    async fn delete_namespace(&self, name: &str) -> Result<()> {
        let mut inner = self.lock();
        inner.record("delete_namespace")?;
        inner.namespaces.remove(name);
        inner.deployments.retain(|(ns, _), _| ns != name);
        inner.services.retain(|(ns, _), _| ns != name);
        inner.seeded.retain(|(ns, _), _| ns != name);
        Ok(())
    }

    async fn count(&self, namespace: &str, kind: ResourceKind) -> Result<usize> {
        let mut inner = self.lock();
        inner.record("count")?;
        let stored = match kind {
            ResourceKind::Deployment => inner.deployments.keys().filter(|(ns, _)| ns == namespace).count(),
            ResourceKind::Service => inner.services.keys().filter(|(ns, _)| ns == namespace).count(),
            _ => 0,
        };
        let key = (namespace.to_string(), kind);
        let seeded = inner.seeded.get(&key).copied().unwrap_or(0);
        if kind == ResourceKind::Pod && seeded > 0 && inner.draining_pods.contains(namespace) {
            inner.seeded.insert(key, seeded - 1);
        }
        Ok(stored + seeded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn deployment(name: &str) -> Deployment {
        Deployment { metadata: ObjectMeta { name: Some(name.into()), ..Default::default() }, ..Default::default() }
    }

    #[tokio::test]
    async fn replace_requires_current_revision() {
        let c = InMemoryCluster::new();
        let created = c.create_deployment("default", &deployment("web")).await.unwrap();
        assert!(c.replace_deployment("default", &deployment("web")).await.is_err());
        let replaced = c.replace_deployment("default", &created).await.unwrap();
        assert_eq!(replaced.metadata.generation, Some(2));
        assert_eq!(replaced.metadata.uid, created.metadata.uid);
        assert_ne!(replaced.metadata.resource_version, created.metadata.resource_version);
    }

    #[tokio::test]
    async fn create_needs_namespace() {
        let c = InMemoryCluster::new();
        assert!(c.create_deployment("missing", &deployment("web")).await.is_err());
        c.create_namespace("missing").await.unwrap();
        assert!(c.create_deployment("missing", &deployment("web")).await.is_ok());
    }

    #[tokio::test]
    async fn injected_failures_are_counted() {
        let c = InMemoryCluster::new();
        c.fail_on("get_deployment", "boom");
        let err = c.get_deployment("default", "x").await.unwrap_err();
        assert_eq!(err.to_string(), "boom");
        assert_eq!(c.calls("get_deployment"), 1);
        assert_eq!(c.mutations(), 0);
    }

    #[tokio::test]
    async fn draining_pods_drop_per_listing() {
        let c = InMemoryCluster::new();
        c.seed("ns", ResourceKind::Pod, 2);
        c.drain_pods("ns");
        assert_eq!(c.count("ns", ResourceKind::Pod).await.unwrap(), 2);
        assert_eq!(c.count("ns", ResourceKind::Pod).await.unwrap(), 1);
        assert_eq!(c.count("ns", ResourceKind::Pod).await.unwrap(), 0);
    }
}
