use std::str::FromStr;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use kestrel_api::{ClusterPreferences, ClusterSession, SyncConfig};
use kestrel_core::{Gvk, ObjectRef};
use kestrel_kubehub::Delta;
use kestrel_schema::ClusterObject;
use kestrel_store::Property;
use kube::api::ListParams;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "kestrelctl", version, about = "Kestrel CLI")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Only show objects in this namespace
    #[arg(long = "ns", global = true)]
    namespace: Option<String>,

    /// API server URL
    #[arg(long, global = true, env = "KESTREL_HOST")]
    host: Option<String>,

    /// Bearer token
    #[arg(long, global = true, env = "KESTREL_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// Skip TLS verification
    #[arg(long, global = true)]
    insecure: bool,

    /// JSON cluster preferences file (overrides --host/--token)
    #[arg(long, global = true)]
    prefs: Option<std::path::PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output {
    Human,
    Json,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Discover served, listable resources (incl. CRDs)
    Discover,
    /// One-shot list for a GVK key, e.g. "v1/ConfigMap" or "cert-manager.io/v1/Certificate"
    Ls { gvk: String },
    /// Fetch one object by GVK key and name
    Get { gvk: String, name: String },
    /// Follow a GVK through its watch cache and print each published collection
    Watch { gvk: String },
    /// Show recent events for one object
    Events { gvk: String, name: String },
}

fn init_tracing() {
    let env = std::env::var("KESTREL_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("KESTREL_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "invalid KESTREL_METRICS_ADDR; expected host:port");
        }
    }
}

fn load_prefs(cli: &Cli) -> Result<ClusterPreferences> {
    if let Some(path) = &cli.prefs {
        let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        return ClusterPreferences::from_json(&text).with_context(|| format!("parsing {}", path.display()));
    }
    let host = cli.host.clone().ok_or_else(|| anyhow!("no cluster: pass --host (or KESTREL_HOST) or --prefs"))?;
    let mut prefs = ClusterPreferences::new(host);
    prefs.bearer_token = cli.token.clone();
    prefs.tls.insecure = cli.insecure;
    prefs.namespace = cli.namespace.clone();
    Ok(prefs)
}

fn wait_secs() -> u64 { std::env::var("KESTREL_WAIT_SECS").ok().and_then(|s| s.parse::<u64>().ok()).unwrap_or(8) }

fn render_age(obj: &ClusterObject) -> String {
    let Some(created) = obj.meta().creation_timestamp.as_ref() else { return "-".to_string() };
    let mut secs = (chrono::Utc::now() - created.0).num_seconds().max(0) as u64;
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

fn in_namespace(obj: &ClusterObject, ns: Option<&str>) -> bool { ns.map(|n| obj.namespace() == Some(n)).unwrap_or(true) }

fn print_objects(output: Output, items: &[&ClusterObject]) -> Result<()> {
    match output {
        Output::Human => {
            println!("{:<20} {:<40} AGE", "NAMESPACE", "NAME");
            for item in items {
                println!("{:<20} {:<40} {}", item.namespace().unwrap_or("-"), item.name(), render_age(item));
            }
        }
        Output::Json => {
            let values = items.iter().map(|o| o.to_value()).collect::<Result<Vec<_>, _>>()?;
            println!("{}", serde_json::to_string_pretty(&values)?);
        }
    }
    Ok(())
}

fn delta_line(delta: &Delta) -> String {
    let (sign, obj) = match delta {
        Delta::Added(o) => ('+', o),
        Delta::Updated { new, .. } => ('~', new),
        Delta::Deleted(o) => ('-', o),
    };
    match obj.namespace() {
        Some(ns) => format!("{} {}/{}", sign, ns, obj.name()),
        None => format!("{} {}", sign, obj.name()),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();
    let prefs = Property::new(load_prefs(&cli)?);
    let ctx = CancellationToken::new();
    let session = ClusterSession::connect(ctx.clone(), prefs, SyncConfig::from_env()).await?;
    let ns = cli.namespace.as_deref();

    match &cli.command {
        Commands::Discover => match cli.output {
            Output::Human => {
                for r in session.resources() {
                    let scope = if r.namespaced { "namespaced" } else { "cluster" };
                    println!("{} • {} • {} • {}", r.api_version(), r.kind, r.plural, scope);
                }
                for (gv, err) in session.mapper().catalog().failed_groups() {
                    eprintln!("unavailable: {} ({})", gv, err);
                }
            }
            Output::Json => println!("{}", serde_json::to_string_pretty(session.resources())?),
        },
        Commands::Ls { gvk } => {
            let gvk = Gvk::from_str(gvk)?;
            info!(gvk = %gvk, ns = ?ns, "ls invoked");
            let resource = session.api_resource(&gvk).ok_or_else(|| anyhow!("{} is not served", gvk))?.clone();
            let items = session.list_dynamic(&resource, &ListParams::default()).await?;
            let shown: Vec<_> = items.iter().filter(|o| in_namespace(o, ns)).collect();
            print_objects(cli.output, &shown)?;
        }
        Commands::Get { gvk, name } => {
            let gvk = Gvk::from_str(gvk)?;
            let reference = ObjectRef::new(gvk.api_version(), gvk.kind.clone(), ns, name.clone());
            let obj = session.get_reference(&reference).await?;
            println!("{}", serde_json::to_string_pretty(&obj.to_value()?)?);
        }
        Commands::Watch { gvk } => {
            let gvk = Gvk::from_str(gvk)?;
            let gvr = session.mapper().kind_to_resource(&gvk).ok_or_else(|| anyhow!("no resource serves {}", gvk))?;
            info!(gvk = %gvk, gvr = %gvr, "watch invoked");
            let prop: Property<Vec<ClusterObject>> = Property::default();
            let binding = session.bind(ctx.child_token(), &gvr, prop.clone());
            let mut versions = prop.subscribe();
            let mut deltas = session.subscribe(ctx.child_token(), &gvr);
            loop {
                tokio::select! {
                    changed = versions.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let items = prop.get();
                        let shown: Vec<_> = items.iter().filter(|o| in_namespace(o, ns)).collect();
                        match cli.output {
                            Output::Human => println!("[v{}] {} objects", prop.version(), shown.len()),
                            Output::Json => print_objects(cli.output, &shown)?,
                        }
                    }
                    delta = deltas.recv() => match delta {
                        Some(d) if cli.output == Output::Human && in_namespace(d.object(), ns) => println!("{}", delta_line(&d)),
                        Some(_) => {}
                        None => {
                            warn!("watch subscription ended");
                            break;
                        }
                    },
                    _ = signal::ctrl_c() => {
                        info!("Ctrl-C received; shutting down watch loop");
                        break;
                    }
                }
            }
            ctx.cancel();
            let _ = binding.await;
        }
        Commands::Events { gvk, name } => {
            let gvk = Gvk::from_str(gvk)?;
            let reference = ObjectRef::new(gvk.api_version(), gvk.kind.clone(), ns, name.clone());
            let obj = session.get_reference(&reference).await?;
            let uid = obj.uid().ok_or_else(|| anyhow!("{} has no uid", name))?.to_string();
            if !session.events().is_active() {
                return Err(anyhow!("events.k8s.io/v1 is not served by this cluster"));
            }
            if tokio::time::timeout(Duration::from_secs(wait_secs()), session.events().wait_ready()).await.is_err() {
                warn!("event feed not ready yet; output may be partial");
            }
            for ev in session.events().for_object(&uid) {
                let reason = ev.reason.as_deref().unwrap_or("-");
                let note = ev.note.as_deref().unwrap_or("");
                let kind = ev.type_.as_deref().unwrap_or("Normal");
                println!("{:<8} {:<24} {}", kind, reason, note);
            }
        }
    }
    session.shutdown();
    Ok(())
}
