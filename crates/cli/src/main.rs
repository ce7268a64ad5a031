use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use gantry_core::dynamic_object_kind;
use gantry_events::EventLoop;
use gantry_kubehub::{single_resource_filter, start_watcher, KubeFirstBatchPreparer};
use gantry_store::{ChangeProcessor, GraphReader, ProcessorConfig};
use kube::Client;
use tokio::signal;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

mod graph;
mod handler;
mod kinds;

#[derive(Parser, Debug)]
#[command(name = "gantry", version, about = "Gantry gateway controller")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Name of the GatewayClass this controller reconciles
    #[arg(long = "gateway-class", global = true, env = "GANTRY_GATEWAY_CLASS", default_value = "gantry")]
    gateway_class: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Subcommand, Debug)]
enum Commands {
    /// Watch the cluster and rebuild the gateway graph on relevant changes
    Controller(ControllerArgs),
    /// Print the watched kinds and their change policies
    Kinds,
}

#[derive(Args, Debug)]
struct ControllerArgs {
    /// Controller name a GatewayClass must carry in spec.controllerName
    #[arg(long = "controller-name", env = "GANTRY_CONTROLLER_NAME", default_value = "gantry.dev/gateway-controller")]
    controller_name: String,

    /// Restrict watches of namespaced kinds to one namespace (default: all)
    #[arg(long = "ns", env = "GANTRY_NAMESPACE")]
    namespace: Option<String>,

    /// Capacity of the channel between watchers and the event loop
    #[arg(long = "event-buffer", env = "GANTRY_EVENT_BUFFER", default_value_t = 1)]
    event_buffer: usize,
}

fn init_tracing() {
    let env = std::env::var("GANTRY_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("GANTRY_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "invalid GANTRY_METRICS_ADDR; expected host:port");
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    match &cli.command {
        Commands::Controller(args) => run_controller(&cli, args).await,
        Commands::Kinds => print_kinds(&cli),
    }
}

fn print_kinds(cli: &Cli) -> Result<()> {
    let registry = kinds::registry(&GraphReader::new())?;
    let watched = kinds::watched(&cli.gateway_class);
    match cli.output {
        Output::Human => {
            println!("{:<58} {:<10} {:<11} {}", "KIND", "STORED", "POLICY", "NOTES");
            for s in registry.summaries() {
                let mut notes = Vec::new();
                if s.endpoints {
                    notes.push("endpoints".to_string());
                }
                if let Some(key) = watched.iter().find(|w| w.kind == s.kind).and_then(|w| w.singleton.as_ref()) {
                    notes.push(format!("only {}", key));
                }
                let stored = if s.persisted { "yes" } else { "no" };
                println!("{:<58} {:<10} {:<11} {}", s.kind, stored, s.policy, notes.join(", "));
            }
        }
        Output::Json => println!("{}", serde_json::to_string_pretty(&registry.summaries())?),
    }
    Ok(())
}

async fn run_controller(cli: &Cli, args: &ControllerArgs) -> Result<()> {
    info!(controller = %args.controller_name, class = %cli.gateway_class, ns = ?args.namespace, "starting controller");
    let client = Client::try_default().await.context("building kube client")?;

    let processor = Arc::new(ChangeProcessor::new(
        ProcessorConfig {
            extract_kind: Arc::new(dynamic_object_kind),
            builder: Arc::new(graph::GatewayGraphBuilder::new(&args.controller_name, &cli.gateway_class)),
            validator: Some(Arc::new(kinds::validate_upsert)),
        },
        kinds::registry,
    )?);

    let cancel = CancellationToken::new();
    let (tx, rx) = mpsc::channel(args.event_buffer.max(1));
    let mut preparer = KubeFirstBatchPreparer::new(client.clone(), args.namespace.clone());
    let watched = kinds::watched(&cli.gateway_class);
    for w in &watched {
        preparer = match &w.singleton {
            Some(key) => preparer.singleton(w.kind.clone(), key.clone()),
            None => preparer.list(w.kind.clone()),
        };
    }
    let mut watchers = Vec::new();
    for w in watched {
        let filter = w.singleton.map(single_resource_filter);
        let first_batch = Some(preparer.first_batch_keys());
        let (client, ns, tx, cancel) = (client.clone(), args.namespace.clone(), tx.clone(), cancel.clone());
        let kind = w.kind;
        watchers.push(tokio::spawn(async move {
            if let Err(e) = start_watcher(client, kind.clone(), ns, filter, first_batch, tx, cancel).await {
                error!(kind = %kind, error = ?e, "watcher failed");
            }
        }));
    }
    // The loop sees end of input once every watcher has stopped.
    drop(tx);

    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            match signal::ctrl_c().await {
                Ok(()) => {
                    info!("Ctrl-C received; shutting down");
                    cancel.cancel();
                }
                Err(e) => warn!(error = %e, "failed to listen for Ctrl-C"),
            }
        }
    });

    let event_loop = EventLoop::new(rx, Arc::new(handler::BatchHandler::new(processor)), Arc::new(preparer));
    let res = event_loop.start(cancel.clone()).await;
    cancel.cancel();
    for w in watchers {
        let _ = w.await;
    }
    res.context("event loop failed")?;
    warn!("controller stopped (graceful shutdown)");
    Ok(())
}
