use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use lantern_core::{cluster_scoped, find_by_kind, namespace_scoped, ChangeEvent, EventKind, ListOptions, Object, ResourceId, ResourceMeta};
use lantern_informer::{Informer, InformerConfig};
use lantern_kubehub::{KubeTransport, TransportConfig};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "lanternctl", version, about = "List and watch cluster resources through a lantern informer")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Namespace scope (default: all namespaces)
    #[arg(long = "ns", global = true)]
    namespace: Option<String>,

    /// Kubeconfig file (default: in-cluster, $KUBECONFIG or ~/.kube/config)
    #[arg(long = "kubeconfig", global = true)]
    kubeconfig: Option<PathBuf>,

    /// Kubeconfig context
    #[arg(long = "context", global = true)]
    context: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output {
    Human,
    Json,
    Yaml,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Scope {
    Namespaced,
    Cluster,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Discover served resources
    Resources {
        /// Only namespaced or only cluster-scoped resources
        #[arg(long, value_enum)]
        scope: Option<Scope>,
    },
    /// List objects of a resource: "v1/pods", "apps/v1/deployments" or a kind such as "Pod"
    Ls {
        resource: String,
        /// Query the server directly instead of syncing the informer first
        #[arg(long = "no-sync", action = ArgAction::SetTrue)]
        no_sync: bool,
    },
    /// Watch a resource (key or kind) and print one line per change
    Watch {
        resource: String,
        /// Serve from the upstream watch only; never hand over to the store
        #[arg(long = "no-sync", action = ArgAction::SetTrue)]
        no_sync: bool,
    },
}

fn init_tracing() {
    let env = std::env::var("LANTERN_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("LANTERN_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            match metrics_exporter_prometheus::PrometheusBuilder::new().with_http_listener(sock).install() {
                Ok(()) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "invalid LANTERN_METRICS_ADDR; expected host:port");
        }
    }
}

async fn connect(cli: &Cli) -> Result<Informer> {
    let mut cfg = TransportConfig::from_env();
    if cli.kubeconfig.is_some() {
        cfg.kubeconfig = cli.kubeconfig.clone();
    }
    if cli.context.is_some() {
        cfg.context = cli.context.clone();
    }
    let transport = KubeTransport::connect(cfg).await?;
    Ok(Informer::new(Arc::new(transport), InformerConfig::from_env()))
}

/// Run `Informer::start` until it finishes or Ctrl-C cancels it.
async fn sync(informer: &Informer, ctx: &CancellationToken) -> Result<()> {
    let t0 = Instant::now();
    tokio::select! {
        r = informer.start(ctx) => r.context("informer start")?,
        _ = signal::ctrl_c() => {
            ctx.cancel();
            anyhow::bail!("interrupted while syncing");
        }
    }
    info!(synced = informer.synced_resources().len(), took_ms = %t0.elapsed().as_millis(), "informer synced");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();
    let ctx = CancellationToken::new();
    let informer = connect(&cli).await?;
    let opts = ListOptions::in_namespace(cli.namespace.clone().unwrap_or_default());

    match &cli.command {
        Commands::Resources { scope } => {
            let catalog = informer.resources().await?;
            let mut resources: Vec<ResourceMeta> = match scope {
                Some(Scope::Namespaced) => namespace_scoped(&catalog).into_iter().cloned().collect(),
                Some(Scope::Cluster) => cluster_scoped(&catalog).into_iter().cloned().collect(),
                None => catalog,
            };
            resources.sort_by(|a, b| a.id.cmp(&b.id));
            match cli.output {
                Output::Human => print_resources(&resources),
                Output::Json => println!("{}", serde_json::to_string_pretty(&resources)?),
                Output::Yaml => print!("{}", serde_yaml::to_string(&resources)?),
            }
        }
        Commands::Ls { resource, no_sync } => {
            let res = resolve(&informer, resource).await?;
            info!(resource = %res, ns = %opts.namespace, "ls invoked");
            if !no_sync {
                sync(&informer, &ctx).await?;
            }
            let mut objects = informer.list(&ctx, &res, &opts).await?;
            objects.sort_by(|a, b| a.key().cmp(&b.key()));
            match cli.output {
                Output::Human => print_objects(&objects, Utc::now()),
                Output::Json => println!("{}", serde_json::to_string_pretty(&objects)?),
                Output::Yaml => print!("{}", serde_yaml::to_string(&objects)?),
            }
        }
        Commands::Watch { resource, no_sync } => {
            let res = resolve(&informer, resource).await?;
            info!(resource = %res, ns = %opts.namespace, "watch invoked");
            let mut stream = informer.watch(&ctx, &res, opts).await?;
            let primer = (!no_sync).then(|| {
                let informer = informer.clone();
                let ctx = ctx.clone();
                tokio::spawn(async move {
                    if let Err(e) = informer.start(&ctx).await {
                        warn!(error = %e, "informer start failed; staying on the upstream watch");
                    }
                })
            });
            loop {
                tokio::select! {
                    ev = stream.recv() => match ev {
                        Some(ev) => print_event(&ev, cli.output)?,
                        None => {
                            warn!("watch stream ended");
                            break;
                        }
                    },
                    _ = signal::ctrl_c() => {
                        info!("Ctrl-C received; shutting down watch");
                        break;
                    }
                }
            }
            stream.stop();
            ctx.cancel();
            if let Some(task) = primer {
                task.abort();
            }
        }
    }

    informer.stop()?;
    Ok(())
}

/// A resource key is used as given; a bare kind is looked up in the discovered catalog.
async fn resolve(informer: &Informer, arg: &str) -> Result<ResourceId> {
    if arg.contains('/') {
        return Ok(arg.parse()?);
    }
    let catalog = informer.resources().await?;
    let meta = resource_for_kind(&catalog, arg).with_context(|| format!("no served resource of kind {arg}"))?;
    Ok(meta.id.clone())
}

/// Core `v1` wins; otherwise the first match in key order.
fn resource_for_kind<'a>(catalog: &'a [ResourceMeta], kind: &str) -> Option<&'a ResourceMeta> {
    find_by_kind(catalog, "", "v1", kind).or_else(|| catalog.iter().filter(|m| m.kind == kind).min_by(|a, b| a.id.cmp(&b.id)))
}

fn print_resources(resources: &[ResourceMeta]) {
    println!("{:<48} {:<32} {:<10} WATCH", "RESOURCE", "KIND", "SCOPE");
    for m in resources {
        let scope = if m.namespaced { "namespaced" } else { "cluster" };
        let watch = if m.is_watchable() { "yes" } else { "no" };
        println!("{:<48} {:<32} {:<10} {}", m.id.key(), m.kind, scope, watch);
    }
}

fn print_objects(objects: &[Object], now: DateTime<Utc>) {
    println!("{:<20} {:<40} AGE", "NAMESPACE", "NAME");
    for o in objects {
        let ns = if o.namespace().is_empty() { "-" } else { o.namespace() };
        println!("{:<20} {:<40} {}", ns, o.name().unwrap_or("-"), render_age(o, now));
    }
}

fn print_event(ev: &ChangeEvent, output: Output) -> Result<()> {
    match output {
        Output::Human => {
            let mark = match ev.kind {
                EventKind::Added => "+",
                EventKind::Modified => "~",
                EventKind::Deleted => "-",
                EventKind::Bookmark | EventKind::Error => "!",
            };
            let key = ev.object.key().map(|k| k.to_string()).unwrap_or_default();
            println!("{mark} {key} {}", ev.object.resource_version().unwrap_or(""));
        }
        Output::Json => println!("{}", serde_json::to_string(ev)?),
        Output::Yaml => print!("---\n{}", serde_yaml::to_string(ev)?),
    }
    Ok(())
}

fn render_age(o: &Object, now: DateTime<Utc>) -> String {
    let created = o
        .raw()
        .get("metadata")
        .and_then(|m| m.get("creationTimestamp"))
        .and_then(|v| v.as_str())
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok());
    let Some(created) = created else { return "-".to_string() };
    let mut secs = now.signed_duration_since(created.with_timezone(&Utc)).num_seconds().max(0) as u64;
    let days = secs / 86_400;
    secs %= 86_400;
    let hours = secs / 3600;
    secs %= 3600;
    let mins = secs / 60;
    secs %= 60;
    if days > 0 {
        format!("{}d{}h", days, hours)
    } else if hours > 0 {
        format!("{}h{}m", hours, mins)
    } else if mins > 0 {
        format!("{}m", mins)
    } else {
        format!("{}s", secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn created(ts: &str) -> Object { Object::new(json!({"metadata": {"name": "a", "creationTimestamp": ts}})) }

    #[test]
    fn age_rendering() {
        let now = DateTime::parse_from_rfc3339("2024-01-02T03:04:05Z").unwrap().with_timezone(&Utc);
        assert_eq!(render_age(&created("2024-01-02T03:04:00Z"), now), "5s");
        assert_eq!(render_age(&created("2024-01-02T02:54:05Z"), now), "10m");
        assert_eq!(render_age(&created("2024-01-02T00:00:05Z"), now), "3h4m");
        assert_eq!(render_age(&created("2023-12-30T01:04:05Z"), now), "3d2h");
        assert_eq!(render_age(&created("2030-01-01T00:00:00Z"), now), "0s");
        assert_eq!(render_age(&Object::new(json!({"metadata": {"name": "a"}})), now), "-");
    }

    #[test]
    fn global_flags_parse_after_subcommand() {
        let cli = Cli::try_parse_from(["lanternctl", "ls", "apps/v1/deployments", "--ns", "web", "-o", "yaml", "--no-sync"]).unwrap();
        assert_eq!(cli.output, Output::Yaml);
        assert_eq!(cli.namespace.as_deref(), Some("web"));
        match cli.command {
            Commands::Ls { resource, no_sync } => {
                assert_eq!(resource, "apps/v1/deployments");
                assert!(no_sync);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn kinds_resolve_through_the_catalog() {
        let catalog = vec![
            ResourceMeta::new(ResourceId::new("metrics.k8s.io", "v1beta1", "pods"), "PodMetrics", ["get", "list"], true),
            ResourceMeta::new(ResourceId::new("", "v1", "pods"), "Pod", ["list", "watch"], true),
            ResourceMeta::new(ResourceId::new("extensions", "v1beta1", "ingresses"), "Ingress", ["list"], true),
            ResourceMeta::new(ResourceId::new("networking.k8s.io", "v1", "ingresses"), "Ingress", ["list", "watch"], true),
        ];
        assert_eq!(resource_for_kind(&catalog, "Pod").map(|m| m.id.key()).as_deref(), Some("v1/pods"));
        assert_eq!(resource_for_kind(&catalog, "Ingress").map(|m| m.id.key()).as_deref(), Some("extensions/v1beta1/ingresses"));
        assert!(resource_for_kind(&catalog, "Widget").is_none());
    }

    #[test]
    fn resources_takes_a_scope_filter() {
        let cli = Cli::try_parse_from(["lanternctl", "resources", "--scope", "cluster"]).unwrap();
        assert!(matches!(cli.command, Commands::Resources { scope: Some(Scope::Cluster) }));
    }
}
