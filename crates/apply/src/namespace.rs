//! Namespace lifecycle: create on demand, delete only once nothing lives in it.

use anyhow::{Context, Result};
use symk8s_kubehub::{ClusterClient, ResourceKind};
use tracing::{debug, info, instrument};

use crate::retry::RetryPolicy;

fn is_shared(namespace: &str) -> bool {
    namespace.is_empty() || namespace == "default"
}

#[instrument(skip(client))]
pub async fn create_namespace(client: &dyn ClusterClient, namespace: &str) -> Result<()> {
    if is_shared(namespace) {
        return Ok(());
    }
    if client.get_namespace(namespace).await?.is_none() {
        info!("creating namespace");
        client.create_namespace(namespace).await.context("creating namespace")?;
    }
    Ok(())
}

/// Delete `namespace` if, after waiting up to `policy` for pods to terminate, none of the
/// tracked kinds has any object left. Returns whether the namespace was deleted.
#[instrument(skip(client, policy))]
pub async fn remove_namespace(client: &dyn ClusterClient, namespace: &str, policy: &RetryPolicy) -> Result<bool> {
    if is_shared(namespace) {
        return Ok(false);
    }
    if client.get_namespace(namespace).await?.is_none() {
        debug!("namespace already gone");
        return Ok(false);
    }
    policy
        .poll(|attempt| async move {
            let pods = client.count(namespace, ResourceKind::Pod).await?;
            debug!(attempt, pods, "waiting for pods to terminate");
            Ok::<_, anyhow::Error>(pods == 0)
        })
        .await?;
    for kind in ResourceKind::ALL {
        let n = client.count(namespace, kind).await?;
        if n != 0 {
            info!(resource = %kind, count = n, "namespace not empty, keeping it");
            return Ok(false);
        }
    }
    info!("removing empty namespace");
    client.delete_namespace(namespace).await?;
    Ok(true)
}
