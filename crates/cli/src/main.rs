use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::{bail, Context, Result};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use symk8s_apply::K8sTargetProvider;
use symk8s_core::{ComponentAction, ComponentStep, DeploymentSpec, DeploymentStep, DeploymentStrategy, ProviderConfig, ResultMap};
use tokio::signal;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "symk8sctl", version, about = "Symk8s k8s target CLI")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Provider configuration file (YAML or JSON); defaults apply when omitted
    #[arg(short = 'c', long = "config", global = true, env = "SYMK8S_CONFIG")]
    config: Option<PathBuf>,

    /// Override the configured deployment strategy (single-pod, services, services-ns)
    #[arg(long = "strategy", global = true)]
    strategy: Option<String>,

    /// Log filter directives, e.g. `info` or `symk8s_apply=debug`
    #[arg(long = "log", global = true, env = "SYMK8S_LOG", default_value = "info")]
    log: String,

    /// Serve Prometheus metrics on this address while the command runs
    #[arg(long = "metrics-addr", global = true, env = "SYMK8S_METRICS_ADDR")]
    metrics_addr: Option<SocketAddr>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Subcommand, Debug)]
enum Commands {
    /// Build the Deployments and Services offline and print them
    Render {
        /// Deployment manifest
        file: PathBuf,
    },
    /// Check the manifest's components against the target's validation rule
    Validate {
        file: PathBuf,
    },
    /// Read back the components currently running for the manifest's instance
    Get {
        file: PathBuf,
    },
    /// Reconcile the manifest's step against the cluster
    Apply {
        file: PathBuf,
        /// Validate only; nothing is written
        #[arg(long = "dry-run", action = ArgAction::SetTrue)]
        dry_run: bool,
        /// Treat every component as a deletion (ignored when the manifest carries a step)
        #[arg(long = "delete", action = ArgAction::SetTrue)]
        delete: bool,
    },
}

/// What a manifest file holds: the instance and, optionally, an explicit step.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Manifest {
    deployment: DeploymentSpec,
    #[serde(default)]
    step: Option<DeploymentStep>,
}

impl Manifest {
    /// The explicit step, or every declared component with one action.
    fn step(&self, delete: bool) -> DeploymentStep {
        if let Some(step) = &self.step {
            return step.clone();
        }
        let action = if delete { ComponentAction::Delete } else { ComponentAction::Update };
        DeploymentStep::new(
            self.deployment
                .components
                .iter()
                .map(|c| ComponentStep { action, component: c.clone() })
                .collect(),
        )
    }
}

/// Logs go to stderr so `-o json` output stays parseable.
fn init_tracing(directives: &str) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_new(directives).with_context(|| format!("invalid log filter '{}'", directives))?;
    tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).init();
    Ok(())
}

fn init_metrics(addr: Option<SocketAddr>) -> Result<()> {
    let Some(addr) = addr else { return Ok(()) };
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .with_context(|| format!("starting metrics exporter on {}", addr))?;
    info!(%addr, "serving metrics");
    Ok(())
}

fn load_yaml<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let raw = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_yaml::from_str(&raw).with_context(|| format!("parsing {}", path.display()))
}

fn load_config(path: Option<&Path>, strategy: Option<&str>) -> Result<ProviderConfig> {
    let mut cfg = match path {
        Some(p) => load_yaml::<ProviderConfig>(p)?,
        None => ProviderConfig::default(),
    };
    if let Some(s) = strategy {
        cfg.deployment_strategy = DeploymentStrategy::from_str(s)?;
    }
    cfg.validate()?;
    Ok(cfg)
}

fn print_results(output: Output, results: &ResultMap) -> Result<()> {
    match output {
        Output::Human => {
            println!("{:<24} {:<16} MESSAGE", "COMPONENT", "STATUS");
            for (name, r) in results {
                println!("{:<24} {:<16} {}", name, r.status.as_str(), r.message);
            }
        }
        Output::Json => println!("{}", serde_json::to_string_pretty(results)?),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log)?;
    init_metrics(cli.metrics_addr)?;
    let cfg = load_config(cli.config.as_deref(), cli.strategy.as_deref())?;

    match cli.command {
        Commands::Render { file } => {
            let manifest: Manifest = load_yaml(&file)?;
            let components = manifest.step(false).get_updated_components();
            let rendered = symk8s_apply::render(cfg.deployment_strategy, &manifest.deployment, &components)?;
            info!(strategy = cfg.deployment_strategy.as_str(), units = rendered.len(), "rendered");
            match cli.output {
                Output::Human => {
                    for r in &rendered {
                        print!("---\n{}", serde_yaml::to_string(&r.deployment)?);
                        if let Some(svc) = &r.service {
                            print!("---\n{}", serde_yaml::to_string(svc)?);
                        }
                    }
                }
                Output::Json => {
                    let mut objects = Vec::new();
                    for r in &rendered {
                        objects.push(serde_json::to_value(&r.deployment)?);
                        if let Some(svc) = &r.service {
                            objects.push(serde_json::to_value(svc)?);
                        }
                    }
                    println!("{}", serde_json::to_string_pretty(&objects)?);
                }
            }
        }
        Commands::Validate { file } => {
            let manifest: Manifest = load_yaml(&file)?;
            let rule = symk8s_core::ValidationRule::for_k8s(cfg.deployment_strategy);
            rule.validate(&manifest.step(false).get_components())?;
            match cli.output {
                Output::Human => println!("ok: {} component(s) valid", manifest.deployment.components.len()),
                Output::Json => println!("{}", serde_json::to_string_pretty(&rule)?),
            }
        }
        Commands::Get { file } => {
            let manifest: Manifest = load_yaml(&file)?;
            let provider = K8sTargetProvider::init(cfg).await?;
            let components = provider.get(&manifest.deployment, &manifest.step(false).components).await?;
            match cli.output {
                Output::Human => print!("{}", serde_yaml::to_string(&components)?),
                Output::Json => println!("{}", serde_json::to_string_pretty(&components)?),
            }
        }
        Commands::Apply { file, dry_run, delete } => {
            let manifest: Manifest = load_yaml(&file)?;
            let step = manifest.step(delete);
            let provider = K8sTargetProvider::init(cfg).await?;
            let outcome = tokio::select! {
                r = provider.apply(&manifest.deployment, &step, dry_run) => r,
                _ = signal::ctrl_c() => bail!("interrupted"),
            };
            match outcome {
                Ok(results) => {
                    if dry_run {
                        println!("dry run: {} component(s) valid", step.components.len());
                    } else {
                        print_results(cli.output, &results)?;
                    }
                }
                Err(failure) => {
                    error!(code = u16::from(failure.state()), error = %failure, "apply failed");
                    print_results(cli.output, &failure.results)?;
                    return Err(failure.into());
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const MANIFEST: &str = r#"
deployment:
  scope: apps
  instanceName: shop
  metadata:
    service.ports: '[{"port":80}]'
  components:
    - name: web
      properties:
        container.image: nginx
    - name: db
      properties:
        container.image: postgres
"#;

    fn write(content: &str) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(content.as_bytes()).unwrap();
        f
    }

    #[test]
    fn manifest_without_step_updates_everything() {
        let f = write(MANIFEST);
        let m: Manifest = load_yaml(f.path()).unwrap();
        assert_eq!(m.deployment.instance_name, "shop");
        assert_eq!(m.step(false).get_updated_components().len(), 2);
        let del = m.step(true);
        assert_eq!(del.get_deleted_components().len(), 2);
        assert!(del.get_updated_components().is_empty());
    }

    #[test]
    fn explicit_step_wins_over_delete_flag() {
        let with_step = format!(
            "{}step:\n  components:\n    - action: delete\n      component:\n        name: db\n",
            MANIFEST
        );
        let f = write(&with_step);
        let m: Manifest = load_yaml(f.path()).unwrap();
        let step = m.step(false);
        assert_eq!(step.components.len(), 1);
        assert_eq!(step.get_deleted_components()[0].name, "db");
    }

    #[test]
    fn config_file_and_strategy_override() {
        let f = write("deploymentStrategy: services\nnoWait: true\ntimeout: 90s\n");
        let cfg = load_config(Some(f.path()), None).unwrap();
        assert_eq!(cfg.deployment_strategy, DeploymentStrategy::Services);
        assert!(cfg.no_wait);
        assert_eq!(cfg.timeout, std::time::Duration::from_secs(90));
        let cfg = load_config(Some(f.path()), Some("ns-services")).unwrap();
        assert_eq!(cfg.deployment_strategy, DeploymentStrategy::ServicesNs);
        assert!(load_config(None, Some("sideways")).is_err());
        let huge = write("timeout: 99999999999999999999h\n");
        assert!(load_config(Some(huge.path()), None).is_err());
    }

    #[test]
    fn render_of_the_sample_manifest() {
        let f = write(MANIFEST);
        let m: Manifest = load_yaml(f.path()).unwrap();
        let rendered = symk8s_apply::render(DeploymentStrategy::SinglePod, &m.deployment, &m.deployment.components).unwrap();
        assert_eq!(rendered.len(), 1);
        let yaml = serde_yaml::to_string(&rendered[0].deployment).unwrap();
        assert!(yaml.contains("image: nginx"), "{}", yaml);
        assert!(rendered[0].service.is_some());
    }

    #[test]
    fn cli_parses_apply_flags() {
        let cli = Cli::try_parse_from(["symk8sctl", "-o", "json", "apply", "m.yaml", "--dry-run"]).unwrap();
        assert_eq!(cli.output, Output::Json);
        match cli.command {
            Commands::Apply { dry_run, delete, .. } => {
                assert!(dry_run);
                assert!(!delete);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn cli_parses_logging_and_metrics_flags() {
        let cli = Cli::try_parse_from(["symk8sctl", "validate", "m.yaml", "--log", "symk8s_apply=debug", "--metrics-addr", "127.0.0.1:9100"])
            .unwrap();
        assert_eq!(cli.log, "symk8s_apply=debug");
        assert_eq!(cli.metrics_addr, Some("127.0.0.1:9100".parse().unwrap()));
        assert!(Cli::try_parse_from(["symk8sctl", "--metrics-addr", "nowhere", "validate", "m.yaml"]).is_err());
        assert!(init_metrics(None).is_ok());
    }
}
