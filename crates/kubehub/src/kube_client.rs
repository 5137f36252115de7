//! [`ClusterClient`] over a live kube [`Client`].

use std::fmt::Debug;

use anyhow::{Context, Result};
use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment, ReplicaSet, StatefulSet};
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{Namespace, Pod, Service};
use k8s_openapi::NamespaceResourceScope;
use kube::api::{Api, DeleteParams, ListParams, PostParams};
use kube::{Client, Resource};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use crate::{object_name, ClusterClient, ResourceKind};

#[derive(Clone)]
pub struct KubeCluster {
    client: Client,
}

impl KubeCluster {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn namespaced<K>(&self, namespace: &str) -> Api<K>
    where
        K: Resource<Scope = NamespaceResourceScope>,
        K::DynamicType: Default,
    {
        Api::namespaced(self.client.clone(), namespace)
    }
}

fn is_not_found(e: &kube::Error) -> bool {
    matches!(e, kube::Error::Api(ae) if ae.code == 404)
}

async fn get_opt<K>(api: &Api<K>, name: &str) -> Result<Option<K>>
where
    K: Resource + Clone + DeserializeOwned + Debug,
{
    match api.get(name).await {
        Ok(o) => Ok(Some(o)),
        Err(e) if is_not_found(&e) => Ok(None),
        Err(e) => Err(e).with_context(|| format!("getting {}", name)),
    }
}

async fn delete_foreground<K>(api: &Api<K>, name: &str) -> Result<()>
where
    K: Resource + Clone + DeserializeOwned + Debug,
{
    match api.delete(name, &DeleteParams::foreground()).await {
        Ok(_) => Ok(()),
        Err(e) if is_not_found(&e) => {
            debug!(name = %name, "already gone");
            Ok(())
        }
        Err(e) => Err(e).with_context(|| format!("deleting {}", name)),
    }
}

async fn replace<K>(api: &Api<K>, obj: &K) -> Result<K>
where
    K: Resource + Clone + DeserializeOwned + Serialize + Debug,
{
    let name = object_name(obj.meta()).to_string();
    api.replace(&name, &PostParams::default(), obj)
        .await
        .with_context(|| format!("replacing {}", name))
}

async fn create<K>(api: &Api<K>, obj: &K) -> Result<K>
where
    K: Resource + Clone + DeserializeOwned + Serialize + Debug,
{
    api.create(&PostParams::default(), obj)
        .await
        .with_context(|| format!("creating {}", object_name(obj.meta())))
}

async fn list_len<K>(api: Api<K>) -> Result<usize>
where
    K: Resource + Clone + DeserializeOwned + Debug,
{
    Ok(api.list(&ListParams::default()).await?.items.len())
}

#[async_trait]
impl ClusterClient for KubeCluster {
    async fn get_deployment(&self, namespace: &str, name: &str) -> Result<Option<Deployment>> {
        get_opt(&self.namespaced::<Deployment>(namespace), name).await
    }

    async fn create_deployment(&self, namespace: &str, deployment: &Deployment) -> Result<Deployment> {
        create(&self.namespaced(namespace), deployment).await
    }

    async fn replace_deployment(&self, namespace: &str, deployment: &Deployment) -> Result<Deployment> {
        replace(&self.namespaced(namespace), deployment).await
    }

    async fn delete_deployment(&self, namespace: &str, name: &str) -> Result<()> {
        delete_foreground(&self.namespaced::<Deployment>(namespace), name).await
    }

    async fn get_service(&self, namespace: &str, name: &str) -> Result<Option<Service>> {
        get_opt(&self.namespaced::<Service>(namespace), name).await
    }

    async fn create_service(&self, namespace: &str, service: &Service) -> Result<Service> {
        create(&self.namespaced(namespace), service).await
    }

    async fn replace_service(&self, namespace: &str, service: &Service) -> Result<Service> {
        replace(&self.namespaced(namespace), service).await
    }

    async fn delete_service(&self, namespace: &str, name: &str) -> Result<()> {
        delete_foreground(&self.namespaced::<Service>(namespace), name).await
    }

    async fn get_namespace(&self, name: &str) -> Result<Option<Namespace>> {
        get_opt(&Api::<Namespace>::all(self.client.clone()), name).await
    }

    async fn create_namespace(&self, name: &str) -> Result<()> {
        let ns = Namespace {
            metadata: kube::core::ObjectMeta { name: Some(name.to_string()), ..Default::default() },
            ..Default::default()
        };
        create(&Api::<Namespace>::all(self.client.clone()), &ns).await.map(|_| ())
    }

    async fn delete_namespace(&self, name: &str) -> Result<()> {
        let api = Api::<Namespace>::all(self.client.clone());
        match api.delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(e).with_context(|| format!("deleting namespace {}", name)),
        }
    }

    async fn count(&self, namespace: &str, kind: ResourceKind) -> Result<usize> {
        let n = match kind {
            ResourceKind::Pod => list_len(self.namespaced::<Pod>(namespace)).await,
            ResourceKind::Deployment => list_len(self.namespaced::<Deployment>(namespace)).await,
            ResourceKind::Service => list_len(self.namespaced::<Service>(namespace)).await,
            ResourceKind::ReplicaSet => list_len(self.namespaced::<ReplicaSet>(namespace)).await,
            ResourceKind::StatefulSet => list_len(self.namespaced::<StatefulSet>(namespace)).await,
            ResourceKind::DaemonSet => list_len(self.namespaced::<DaemonSet>(namespace)).await,
            ResourceKind::Job => list_len(self.namespaced::<Job>(namespace)).await,
        };
        n.with_context(|| format!("listing {} in {}", kind, namespace))
    }
}
