use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use symk8s_apply::{K8sTargetProvider, ProviderMetrics};
use symk8s_core::{
    keys, ComponentAction, ComponentSpec, ComponentStep, ConfigType, DeploymentSpec, DeploymentStep, DeploymentStrategy, ProviderConfig,
    SidecarSpec, State,
};
use symk8s_kubehub::fake::InMemoryCluster;
use symk8s_kubehub::ResourceKind;

fn config(strategy: DeploymentStrategy) -> ProviderConfig {
    ProviderConfig { name: "k8s".into(), deployment_strategy: strategy, ..Default::default() }
}

fn provider(cluster: &Arc<InMemoryCluster>, cfg: ProviderConfig) -> K8sTargetProvider {
    K8sTargetProvider::with_client(cfg, cluster.clone()).unwrap()
}

fn image(name: &str, img: &str) -> ComponentSpec {
    ComponentSpec::new(name)
        .with_property(keys::CONTAINER_IMAGE, img)
        .with_property(keys::CONTAINER_IMAGE_PULL_POLICY, "Always")
}

fn spec(scope: &str, instance: &str, components: Vec<ComponentSpec>) -> DeploymentSpec {
    DeploymentSpec { scope: scope.into(), instance_name: instance.into(), components, ..Default::default() }
}

fn step(action: ComponentAction, components: &[ComponentSpec]) -> DeploymentStep {
    DeploymentStep::new(components.iter().map(|c| ComponentStep { action, component: c.clone() }).collect())
}

fn update(components: &[ComponentSpec]) -> DeploymentStep {
    step(ComponentAction::Update, components)
}

fn delete(components: &[ComponentSpec]) -> DeploymentStep {
    step(ComponentAction::Delete, components)
}

#[tokio::test]
async fn evs_scenario() {
    let cluster = Arc::new(InMemoryCluster::new());
    let p = provider(&cluster, config(DeploymentStrategy::SinglePod));
    let evs = image("evs", "img:latest").with_property(keys::CONTAINER_PORTS, r#"[{"containerPort":8888,"protocol":"TCP"}]"#);
    let mut d = spec("", "evs", vec![evs.clone()]);
    d.metadata.insert(keys::DEPLOYMENT_REPLICAS.into(), "3".into());
    d.metadata.insert(keys::SERVICE_PORTS.into(), r#"[{"name":"port8888","port":8888}]"#.into());
    d.metadata.insert(keys::SERVICE_TYPE.into(), "LoadBalancer".into());

    let results = p.apply(&d, &update(&[evs]), false).await.unwrap();
    assert_eq!(results["evs"].status, State::Updated);

    let dep = cluster.deployment("default", "evs").unwrap();
    let dspec = dep.spec.unwrap();
    assert_eq!(dspec.replicas, Some(3));
    let containers = dspec.template.spec.unwrap().containers;
    assert_eq!(containers.len(), 1);
    assert_eq!(containers[0].name, "evs");
    assert_eq!(containers[0].image.as_deref(), Some("img:latest"));
    let ports = containers[0].ports.clone().unwrap();
    assert_eq!(ports.len(), 1);
    assert_eq!(ports[0].container_port, 8888);

    let svc = cluster.service("default", "evs").unwrap().spec.unwrap();
    assert_eq!(svc.type_.as_deref(), Some("LoadBalancer"));
    assert_eq!(svc.ports.unwrap()[0].port, 8888);
}

#[tokio::test]
async fn get_reads_back_what_apply_wrote() {
    let cluster = Arc::new(InMemoryCluster::new());
    let p = provider(&cluster, config(DeploymentStrategy::SinglePod));
    let web = image("web", "nginx:1.25").with_property("env.MODE", "prod");
    let db = image("db", "postgres:16");
    let d = spec("apps", "shop", vec![web.clone(), db.clone()]);
    p.apply(&d, &update(&[web.clone(), db.clone()]), false).await.unwrap();
    assert!(cluster.has_namespace("apps"));

    let read = p.get(&d, &[]).await.unwrap();
    assert_eq!(read.len(), 2);
    let rule = p.validation_rule();
    for (declared, live) in [&web, &db].into_iter().zip(&read) {
        assert_eq!(declared.name, live.name);
        assert!(!rule.is_component_changed(declared, live), "{} changed: {:?}", declared.name, live.properties);
    }
}

#[tokio::test]
async fn get_of_unknown_instance_is_empty() {
    let cluster = Arc::new(InMemoryCluster::new());
    let p = provider(&cluster, config(DeploymentStrategy::SinglePod));
    assert!(p.get(&spec("", "nothing", vec![]), &[]).await.unwrap().is_empty());
}

#[tokio::test]
async fn second_apply_takes_the_update_path() {
    let cluster = Arc::new(InMemoryCluster::new());
    let p = provider(&cluster, config(DeploymentStrategy::SinglePod));
    let web = image("web", "nginx:1.25");
    let mut d = spec("", "web", vec![web.clone()]);
    d.metadata.insert(keys::SERVICE_PORTS.into(), r#"[{"port":80}]"#.into());

    p.apply(&d, &update(&[web.clone()]), false).await.unwrap();
    let first = cluster.deployment("default", "web").unwrap();
    let first_ip = cluster.service("default", "web").unwrap().spec.unwrap().cluster_ip;

    let web2 = image("web", "nginx:1.26");
    p.apply(&d, &update(&[web2]), false).await.unwrap();
    assert_eq!(cluster.calls("create_deployment"), 1);
    assert_eq!(cluster.calls("replace_deployment"), 1);
    assert_eq!(cluster.calls("create_service"), 1);
    assert_eq!(cluster.calls("replace_service"), 1);

    let second = cluster.deployment("default", "web").unwrap();
    assert_eq!(first.metadata.uid, second.metadata.uid);
    assert_eq!(second.metadata.generation, Some(2));
    let containers = second.spec.unwrap().template.spec.unwrap().containers;
    assert_eq!(containers[0].image.as_deref(), Some("nginx:1.26"));
    assert_eq!(cluster.service("default", "web").unwrap().spec.unwrap().cluster_ip, first_ip);
}

#[tokio::test]
async fn sidecars_come_back_attached_to_their_owner() {
    let cluster = Arc::new(InMemoryCluster::new());
    let p = provider(&cluster, config(DeploymentStrategy::Services));
    let proxy: SidecarSpec = image("proxy", "envoy:1.29").into();
    let api = image("api", "api:2").with_sidecar(proxy);
    let d = spec("team", "inst", vec![api.clone()]);
    p.apply(&d, &update(&[api.clone()]), false).await.unwrap();

    let dep = cluster.deployment("team", "api").unwrap();
    assert_eq!(dep.spec.unwrap().template.spec.unwrap().containers.len(), 2);

    let read = p.get(&d, &[]).await.unwrap();
    assert_eq!(read.len(), 1);
    assert_eq!(read[0].name, "api");
    assert_eq!(read[0].sidecars.len(), 1);
    assert_eq!(read[0].sidecars[0].name, "proxy");
    assert!(!p.validation_rule().is_component_changed(&api, &read[0]));
}

#[tokio::test]
async fn services_strategies_place_one_deployment_per_component() {
    for (strategy, namespace) in [(DeploymentStrategy::Services, "team"), (DeploymentStrategy::ServicesNs, "inst")] {
        let cluster = Arc::new(InMemoryCluster::new());
        let p = provider(&cluster, config(strategy));
        let a = image("a", "a:1").with_metadata(keys::SERVICE_PORTS, r#"[{"port":8080}]"#);
        let b = image("b", "b:1");
        let mut d = spec("team", "inst", vec![a.clone(), b.clone()]);
        d.metadata.insert(keys::AGENT_ADDRESS.into(), "agent".into());

        let results = p.apply(&d, &update(&[a, b]), false).await.unwrap();
        assert!(results.values().all(|r| r.status == State::Updated));
        assert_eq!(cluster.deployment_names(namespace), vec!["a", "b"], "{}", strategy.as_str());
        assert_eq!(cluster.service_names(namespace), vec!["a"]);

        let env = cluster.deployment(namespace, "b").unwrap().spec.unwrap().template.spec.unwrap().containers[0]
            .env
            .clone()
            .unwrap();
        assert!(env.iter().any(|e| e.name == keys::AGENT_ADDRESS && e.value.as_deref() == Some("agent.default.svc.cluster.local")));

        let read = p.get(&d, &[]).await.unwrap();
        assert_eq!(read.len(), 2);
        assert_eq!(read[0].metadata.get(keys::SERVICE_TYPE).map(String::as_str), Some("ClusterIP"));
        assert!(read[1].metadata.is_empty());
    }
}

#[tokio::test]
async fn services_get_refuses_a_shared_pod() {
    let cluster = Arc::new(InMemoryCluster::new());
    let single = provider(&cluster, config(DeploymentStrategy::SinglePod));
    let web = image("web", "nginx");
    let db = image("db", "postgres");
    let d = spec("", "web", vec![web.clone(), db.clone()]);
    single.apply(&d, &update(&[web.clone(), db]), false).await.unwrap();

    let services = provider(&cluster, config(DeploymentStrategy::Services));
    let err = services.get(&spec("", "web", vec![web]), &[]).await.unwrap_err();
    assert_eq!(err.state(), State::GetComponentSpecFailed);
    assert!(err.to_string().contains("can't read multiple components"), "{}", err);
}

#[tokio::test]
async fn invalid_components_never_reach_the_cluster() {
    let cluster = Arc::new(InMemoryCluster::new());
    let p = provider(&cluster, config(DeploymentStrategy::SinglePod));
    let broken = ComponentSpec::new("broken");
    let d = spec("", "x", vec![broken.clone()]);

    let failure = p.apply(&d, &update(&[broken]), false).await.unwrap_err();
    assert_eq!(failure.state(), State::ValidateFailed);
    assert!(failure.to_string().contains("container.image"), "{}", failure);
    assert!(failure.results.is_empty());
    assert_eq!(cluster.total_calls(), 0);
}

#[tokio::test]
async fn dry_run_validates_only() {
    let cluster = Arc::new(InMemoryCluster::new());
    let p = provider(&cluster, config(DeploymentStrategy::SinglePod));
    let web = image("web", "nginx");
    let results = p.apply(&spec("", "web", vec![web.clone()]), &update(&[web]), true).await.unwrap();
    assert!(results.is_empty());
    assert_eq!(cluster.total_calls(), 0);
}

#[tokio::test]
async fn unknown_projector_fails_before_any_write() {
    let cluster = Arc::new(InMemoryCluster::new());
    let mut cfg = config(DeploymentStrategy::SinglePod);
    cfg.projector = "fancy".into();
    let p = provider(&cluster, cfg);
    let web = image("web", "nginx");
    let failure = p.apply(&spec("", "web", vec![web.clone()]), &update(&[web]), false).await.unwrap_err();
    assert_eq!(failure.state(), State::CreateProjectorFailed);
    assert_eq!(failure.results["web"].status, State::Untouched);
    assert_eq!(cluster.mutations(), 0);
}

#[tokio::test]
async fn noop_projector_is_accepted() {
    let cluster = Arc::new(InMemoryCluster::new());
    let mut cfg = config(DeploymentStrategy::SinglePod);
    cfg.projector = "noop".into();
    let p = provider(&cluster, cfg);
    let web = image("web", "nginx");
    p.apply(&spec("", "web", vec![web.clone()]), &update(&[web]), false).await.unwrap();
    assert!(cluster.deployment("default", "web").is_some());
}

#[tokio::test]
async fn failure_halts_the_loop_and_marks_the_component() {
    let cluster = Arc::new(InMemoryCluster::new());
    let p = provider(&cluster, config(DeploymentStrategy::Services));
    cluster.fail_on("create_service", "quota exceeded");
    let a = image("a", "a:1");
    let b = image("b", "b:1").with_metadata(keys::SERVICE_PORTS, r#"[{"port":80}]"#);
    let c = image("c", "c:1");
    let d = spec("", "inst", vec![a.clone(), b.clone(), c.clone()]);

    let failure = p.apply(&d, &update(&[a, b, c]), false).await.unwrap_err();
    assert_eq!(failure.state(), State::K8sDeploymentFailed);
    assert_eq!(failure.results["a"].status, State::Updated);
    assert_eq!(failure.results["b"].status, State::UpdateFailed);
    assert!(failure.results["b"].message.contains("quota exceeded"), "{}", failure.results["b"].message);
    assert_eq!(failure.results["c"].status, State::Untouched);
    assert!(cluster.deployment("default", "c").is_none());
}

#[tokio::test]
async fn malformed_property_is_a_deployment_failure() {
    let cluster = Arc::new(InMemoryCluster::new());
    let p = provider(&cluster, config(DeploymentStrategy::SinglePod));
    let web = image("web", "nginx").with_property(keys::CONTAINER_PORTS, "[not json");
    let failure = p.apply(&spec("", "web", vec![web.clone()]), &update(&[web]), false).await.unwrap_err();
    assert_eq!(failure.state(), State::K8sDeploymentFailed);
    assert!(failure.to_string().contains("container.ports"), "{}", failure);
    assert_eq!(failure.results["web"].status, State::UpdateFailed);
    assert_eq!(cluster.mutations(), 0);
}

#[tokio::test]
async fn deployment_being_deleted_is_invisible_and_recreated() {
    let cluster = Arc::new(InMemoryCluster::new());
    let p = provider(&cluster, config(DeploymentStrategy::SinglePod));
    let web = image("web", "nginx");
    let d = spec("", "web", vec![web.clone()]);
    p.apply(&d, &update(&[web.clone()]), false).await.unwrap();
    cluster.mark_deleting("default", "web");

    assert!(p.get(&d, &[]).await.unwrap().is_empty());
    p.apply(&d, &update(&[web]), false).await.unwrap();
    assert_eq!(cluster.calls("create_deployment"), 2);
    assert_eq!(cluster.calls("replace_deployment"), 0);
    assert!(cluster.deployment("default", "web").unwrap().metadata.deletion_timestamp.is_none());
}

#[tokio::test]
async fn single_pod_delete_removes_deployment_and_service() {
    let cluster = Arc::new(InMemoryCluster::new());
    let p = provider(&cluster, config(DeploymentStrategy::SinglePod));
    let web = image("web", "nginx");
    let mut d = spec("", "web", vec![web.clone()]);
    d.metadata.insert(keys::SERVICE_PORTS.into(), r#"[{"port":80}]"#.into());
    p.apply(&d, &update(&[web.clone()]), false).await.unwrap();

    let results = p.apply(&d, &delete(&[web]), false).await.unwrap();
    assert_eq!(results["web"].status, State::Deleted);
    assert!(cluster.deployment("default", "web").is_none());
    assert!(cluster.service("default", "web").is_none());
    assert!(cluster.has_namespace("default"));
}

#[tokio::test]
async fn mixed_single_pod_step_redeploys_without_the_deleted_containers() {
    let cluster = Arc::new(InMemoryCluster::new());
    let p = provider(&cluster, config(DeploymentStrategy::SinglePod));
    let web = image("web", "nginx");
    let old = image("old", "legacy");
    let d = spec("", "shop", vec![web.clone(), old.clone()]);
    p.apply(&d, &update(&[web.clone(), old.clone()]), false).await.unwrap();

    let mut mixed = update(&[web]);
    mixed.components.push(ComponentStep { action: ComponentAction::Delete, component: old });
    let results = p.apply(&d, &mixed, false).await.unwrap();
    assert_eq!(results["web"].status, State::Updated);
    assert_eq!(results["old"].status, State::Deleted);
    let containers = cluster.deployment("default", "shop").unwrap().spec.unwrap().template.spec.unwrap().containers;
    assert_eq!(containers.len(), 1);
    assert_eq!(cluster.calls("delete_deployment"), 0);
}

#[tokio::test]
async fn remove_service_failure_is_reported_per_component() {
    let cluster = Arc::new(InMemoryCluster::new());
    let p = provider(&cluster, config(DeploymentStrategy::Services));
    let a = image("a", "a:1").with_metadata(keys::SERVICE_PORTS, r#"[{"port":80}]"#);
    let d = spec("", "inst", vec![a.clone()]);
    p.apply(&d, &update(&[a.clone()]), false).await.unwrap();
    cluster.fail_on("delete_service", "forbidden");

    let failure = p.apply(&d, &delete(&[a]), false).await.unwrap_err();
    assert_eq!(failure.state(), State::K8sRemoveServiceFailed);
    assert_eq!(failure.results["a"].status, State::DeleteFailed);
    assert!(cluster.deployment("default", "a").is_some());
}

#[tokio::test]
async fn emptied_namespace_is_removed_only_when_asked() {
    for delete_empty in [false, true] {
        let cluster = Arc::new(InMemoryCluster::new());
        let mut cfg = config(DeploymentStrategy::ServicesNs);
        cfg.delete_empty_namespace = delete_empty;
        let p = provider(&cluster, cfg);
        let a = image("a", "a:1");
        let d = spec("", "tenant", vec![a.clone()]);
        p.apply(&d, &update(&[a.clone()]), false).await.unwrap();
        assert!(cluster.has_namespace("tenant"));

        let results = p.apply(&d, &delete(&[a]), false).await.unwrap();
        assert_eq!(results["a"].status, State::Deleted);
        assert_eq!(cluster.has_namespace("tenant"), !delete_empty);
    }
}

#[tokio::test(start_paused = true)]
async fn namespace_with_leftovers_survives_and_apply_still_succeeds() {
    let cluster = Arc::new(InMemoryCluster::new());
    let mut cfg = config(DeploymentStrategy::ServicesNs);
    cfg.delete_empty_namespace = true;
    let p = provider(&cluster, cfg);
    let a = image("a", "a:1");
    let d = spec("", "tenant", vec![a.clone()]);
    p.apply(&d, &update(&[a.clone()]), false).await.unwrap();
    cluster.seed("tenant", ResourceKind::Job, 1);

    let results = p.apply(&d, &delete(&[a]), false).await.unwrap();
    assert_eq!(results["a"].status, State::Deleted);
    assert!(cluster.has_namespace("tenant"));
    assert_eq!(cluster.calls("delete_namespace"), 0);
}

#[tokio::test]
async fn namespace_delete_errors_are_swallowed() {
    let cluster = Arc::new(InMemoryCluster::new());
    let mut cfg = config(DeploymentStrategy::ServicesNs);
    cfg.delete_empty_namespace = true;
    let p = provider(&cluster, cfg);
    let a = image("a", "a:1");
    let d = spec("", "tenant", vec![a.clone()]);
    p.apply(&d, &update(&[a.clone()]), false).await.unwrap();
    cluster.fail_on("delete_namespace", "forbidden");

    let results = p.apply(&d, &delete(&[a]), false).await.unwrap();
    assert_eq!(results["a"].status, State::Deleted);
    assert!(cluster.has_namespace("tenant"));
}

#[derive(Default)]
struct Recorder {
    latencies: Mutex<Vec<&'static str>>,
    errors: Mutex<Vec<(&'static str, State)>>,
}

impl ProviderMetrics for Recorder {
    fn operation_latency(&self, _: Instant, operation: &'static str, _: &'static str, _: &'static str) {
        self.latencies.lock().unwrap().push(operation);
    }

    fn operation_errors(&self, operation: &'static str, _: &'static str, error_code: State) {
        self.errors.lock().unwrap().push((operation, error_code));
    }
}

#[tokio::test]
async fn metrics_go_to_the_injected_sink() {
    let cluster = Arc::new(InMemoryCluster::new());
    let recorder = Arc::new(Recorder::default());
    let p = provider(&cluster, config(DeploymentStrategy::SinglePod)).with_metrics(recorder.clone());

    let web = image("web", "nginx");
    p.apply(&spec("", "web", vec![web.clone()]), &update(&[web]), false).await.unwrap();
    let broken = ComponentSpec::new("broken");
    p.apply(&spec("", "x", vec![broken.clone()]), &update(&[broken]), false).await.unwrap_err();

    let latencies = recorder.latencies.lock().unwrap().clone();
    assert!(latencies.contains(&"K8sDeployment"));
    assert_eq!(latencies.iter().filter(|op| **op == "Apply").count(), 2);
    assert_eq!(*recorder.errors.lock().unwrap(), vec![("ValidateRule", State::ValidateFailed)]);
}

#[tokio::test]
async fn failed_removal_still_reports_its_latency() {
    let cluster = Arc::new(InMemoryCluster::new());
    let recorder = Arc::new(Recorder::default());
    let p = provider(&cluster, config(DeploymentStrategy::Services)).with_metrics(recorder.clone());
    let a = image("a", "a:1").with_metadata(keys::SERVICE_PORTS, r#"[{"port":80}]"#);
    let d = spec("", "inst", vec![a.clone()]);
    p.apply(&d, &update(&[a.clone()]), false).await.unwrap();
    cluster.fail_on("delete_service", "forbidden");

    p.apply(&d, &delete(&[a]), false).await.unwrap_err();
    let latencies = recorder.latencies.lock().unwrap().clone();
    assert!(latencies.contains(&"K8sRemoveService"), "{:?}", latencies);
    assert!(!latencies.contains(&"K8sRemoveDeployment"));
    assert_eq!(*recorder.errors.lock().unwrap(), vec![("K8sRemoveService", State::K8sRemoveServiceFailed)]);
}

#[tokio::test]
async fn bad_timeout_is_rejected_before_connecting() {
    let props: BTreeMap<String, String> = [("timeout", "soon")].iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
    let err = K8sTargetProvider::init_with_map(&props).await.err().unwrap();
    assert_eq!(err.state(), State::BadConfig);
}

#[tokio::test]
async fn inline_config_without_data_is_rejected_at_construction() {
    let cluster = Arc::new(InMemoryCluster::new());
    let cfg = ProviderConfig { config_type: ConfigType::Bytes, ..config(DeploymentStrategy::SinglePod) };
    let err = K8sTargetProvider::with_client(cfg, cluster).err().unwrap();
    assert_eq!(err.state(), State::BadConfig);
}

#[tokio::test(start_paused = true)]
async fn huge_timeout_waits_without_a_deadline() {
    let cluster = Arc::new(InMemoryCluster::new());
    let props: BTreeMap<String, String> = [("timeout", "4000000000000000h")].iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
    let cfg = ProviderConfig { name: "k8s".into(), ..ProviderConfig::from_map(&props).unwrap() };
    let p = provider(&cluster, cfg);
    let a = image("a", "a:1");
    let results = p.apply(&spec("", "big", vec![a.clone()]), &update(&[a]), false).await.unwrap();
    assert_eq!(results["a"].status, State::Updated);
}
