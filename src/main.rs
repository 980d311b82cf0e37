//! Process entry point: CLI parsing, logging, startup sequencing.
//!
//! Exit codes: 0 on clean shutdown (ctrl-c), 1 on missing/invalid
//! configuration, 2 on a fatal runtime error (a non-optional block with
//! no candidate node, or consensus startup failure).

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::sync::mpsc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use blockflow::block::BlockRegistry;
use blockflow::config::{resolve_node_name, Config};
use blockflow::dispatch::{self, Event, LocalBlocks};
use blockflow::resource::ResourceRegistry;
use blockflow::store::ReplicatedStore;
use blockflow::supervisor::{BlockRuntime, Supervisor};
use blockflow::{grpc, raft, rpc};

#[derive(Parser, Debug)]
#[command(name = "blockflow", about = "Distributed home-automation block runtime")]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short = 'c', long = "config")]
    config: PathBuf,

    /// Debug-level logging.
    #[arg(short, long)]
    verbose: bool,

    /// Warnings only.
    #[arg(short, long, conflicts_with = "verbose")]
    quiet: bool,

    /// This node's name. Defaults to the HOSTNAME environment variable.
    node: Option<String>,
}

fn init_logging(cli: &Cli) {
    let default_level = if cli.verbose {
        "debug"
    } else if cli.quiet {
        "warn"
    } else {
        "info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(&cli);

    let config = match Config::load(&cli.config) {
        Ok(config) => Arc::new(config),
        Err(e) => {
            error!(path = %cli.config.display(), error = %e, "Invalid configuration");
            return ExitCode::from(1);
        }
    };

    let self_node = resolve_node_name(cli.node.as_deref());

    let client = match reqwest::Client::builder()
        .timeout(Duration::from_secs(5))
        .build()
    {
        Ok(client) => client,
        Err(e) => {
            error!(error = %e, "Could not build HTTP client");
            return ExitCode::from(2);
        }
    };

    // Construct every block up front — unknown types and malformed
    // require entries are configuration errors.
    let (out_tx, out_rx) = mpsc::unbounded_channel::<Event>();
    let blocks = BlockRegistry::with_builtins();
    let resources = ResourceRegistry::new(&self_node, client.clone());
    let runtimes = match BlockRuntime::build_all(&config, &blocks, &resources, &out_tx) {
        Ok(runtimes) => runtimes,
        Err(e) => {
            error!(error = %e, "Invalid configuration");
            return ExitCode::from(1);
        }
    };

    match serve(config, self_node, client, runtimes, out_tx, out_rx).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "Fatal error");
            ExitCode::from(2)
        }
    }
}

async fn serve(
    config: Arc<Config>,
    self_node: String,
    client: reqwest::Client,
    runtimes: std::collections::BTreeMap<String, Arc<BlockRuntime>>,
    out_tx: mpsc::UnboundedSender<Event>,
    out_rx: mpsc::UnboundedReceiver<Event>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    info!(node = %self_node, blocks = runtimes.len(), "Starting");

    let store = if config.single_node() {
        info!("Single-node cluster, replication disabled");
        ReplicatedStore::single_node()
    } else {
        let peers: Vec<(String, String)> = config
            .node_names()
            .iter()
            .map(|name| (name.clone(), config.cluster_addr(name)))
            .collect();
        let runtime = raft::start_raft_node(&self_node, &peers).await?;
        tokio::spawn(grpc::start_grpc_server(
            config.cluster_listen_addr(),
            runtime.handle.clone(),
        ));
        ReplicatedStore::replicated(&runtime)
    };

    let locals: LocalBlocks = dispatch::local_blocks();
    let (in_tx, in_rx) = mpsc::unbounded_channel::<Event>();

    tokio::spawn(rpc::start_rpc_server(
        config.rpc_listen_addr(&self_node),
        in_tx.clone(),
        store.clone(),
        config.clone(),
    ));
    tokio::spawn(dispatch::run_dispatch(
        out_rx,
        out_tx,
        in_tx,
        config.clone(),
        self_node.clone(),
        client,
    ));
    tokio::spawn(dispatch::run_delivery(in_rx, locals.clone()));

    let supervisor = Supervisor::new(&config, self_node, store, runtimes, locals);

    tokio::select! {
        result = supervisor.run() => {
            result?;
            Ok(())
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down");
            Ok(())
        }
    }
}
