//! Rollout checks used when waiting after an upsert.

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::Service;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;

/// API-server default for `maxUnavailable` and `maxSurge`.
const DEFAULT_ROLLING_PERCENT: &str = "25%";

fn scaled(v: Option<&IntOrString>, desired: i32, round_up: bool) -> i32 {
    match v {
        Some(IntOrString::Int(n)) => (*n).max(0),
        Some(IntOrString::String(s)) => scaled_percent(s, desired, round_up),
        None => scaled_percent(DEFAULT_ROLLING_PERCENT, desired, round_up),
    }
}

fn scaled_percent(s: &str, desired: i32, round_up: bool) -> i32 {
    let Some(pct) = s.strip_suffix('%').and_then(|p| p.trim().parse::<i64>().ok()) else {
        return 0;
    };
    let num = pct.saturating_mul(i64::from(desired));
    let v = if round_up { num.saturating_add(99) / 100 } else { num / 100 };
    v.clamp(0, i64::from(i32::MAX)) as i32
}

/// Pods a rolling deployment may have unavailable; zero for `Recreate` or no replicas.
pub fn max_unavailable(d: &Deployment) -> i32 {
    let Some(spec) = d.spec.as_ref() else { return 0 };
    let desired = spec.replicas.unwrap_or(1);
    let strategy = spec.strategy.as_ref();
    let rolling = strategy.and_then(|s| s.type_.as_deref()).map_or(true, |t| t == "RollingUpdate");
    if !rolling || desired <= 0 {
        return 0;
    }
    let ru = strategy.and_then(|s| s.rolling_update.as_ref());
    let surge = scaled(ru.and_then(|r| r.max_surge.as_ref()), desired, true);
    let mut unavailable = scaled(ru.and_then(|r| r.max_unavailable.as_ref()), desired, false);
    if surge == 0 && unavailable == 0 {
        unavailable = 1;
    }
    unavailable.min(desired)
}

/// Rolled out: not paused, the controller has seen the latest generation and
/// enough updated pods are ready.
pub fn deployment_ready(d: &Deployment) -> bool {
    let Some(spec) = d.spec.as_ref() else { return false };
    if spec.paused.unwrap_or(false) {
        return false;
    }
    let Some(status) = d.status.as_ref() else { return false };
    if status.observed_generation != d.metadata.generation {
        return false;
    }
    let expected = spec.replicas.unwrap_or(1) - max_unavailable(d);
    status.updated_replicas.unwrap_or(0) >= expected && status.ready_replicas.unwrap_or(0) >= expected
}

/// Has a cluster IP (ExternalName never does); a LoadBalancer also needs external IPs or ingress.
pub fn service_ready(s: &Service) -> bool {
    let Some(spec) = s.spec.as_ref() else { return false };
    let ty = spec.type_.as_deref().unwrap_or("ClusterIP");
    if ty == "ExternalName" {
        return true;
    }
    if spec.cluster_ip.as_deref().unwrap_or("").is_empty() {
        return false;
    }
    if ty == "LoadBalancer" {
        if spec.external_ips.as_ref().map_or(false, |ips| !ips.is_empty()) {
            return true;
        }
        return s
            .status
            .as_ref()
            .and_then(|st| st.load_balancer.as_ref())
            .and_then(|lb| lb.ingress.as_ref())
            .is_some();
    }
    true
}
