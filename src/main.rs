use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::sync::oneshot;
use tracing::{error, info};

use agglomerator::cluster::LoopbackTransport;
use agglomerator::config::NodeConfig;
use agglomerator::module::{AgglomeratorModule, Module};
use agglomerator::server;

#[derive(Parser, Clone, Debug)]
#[clap(author, version, about, long_about = None)]
struct Args {
    /// JSON node configuration. Defaults apply when omitted.
    #[clap(long)]
    config: Option<PathBuf>,

    #[clap(long)]
    node_name: Option<String>,

    #[clap(long)]
    api_port: Option<u16>,

    #[clap(long)]
    p2p_port: Option<u16>,

    #[clap(long)]
    worker_threads: Option<usize>,
}

fn load_config(args: &Args) -> agglomerator::Result<NodeConfig> {
    let mut config = match &args.config {
        Some(path) => NodeConfig::load(path)?,
        None => NodeConfig::default(),
    };
    if let Some(name) = &args.node_name {
        config.node_name = name.clone();
    }
    if let Some(port) = args.api_port {
        config.api.port = port;
    }
    if let Some(port) = args.p2p_port {
        config.p2p.port = port;
    }
    if args.worker_threads.is_some() {
        config.worker_threads = args.worker_threads;
    }
    config.validate()?;
    Ok(config)
}

fn main() {
    let args = Args::parse();
    let config = load_config(&args).expect("Invalid node configuration");

    let worker_threads = config.worker_threads.unwrap_or_else(|| {
        std::thread::available_parallelism().map(|n| n.get()).unwrap_or(2)
    });

    tokio::runtime::Builder::new_multi_thread()
    .worker_threads(worker_threads.max(1))
    .enable_all()
    .build()
    .expect("Failed to build tokio runtime")
    .block_on(async_main(config));
}

async fn async_main(config: NodeConfig) {
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info,agglomerator=info");
    }
    tracing_subscriber::fmt()
    .with_target(false)
    .with_level(true)
    .init();

    info!(node = %config.node_name, chains = config.enabled_chains.len(), "starting agglomerator node");

    let api_port = config.api.port;
    let module = Arc::new(
        AgglomeratorModule::new(config, Arc::new(LoopbackTransport))
        .expect("Failed to create agglomerator module"),
    );
    module.initialize().await.expect("Failed to initialize module");
    module.start().await.expect("Failed to start module");

    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let mut api = tokio::spawn(server::serve(module.clone(), api_port, async {
        let _ = stop_rx.await;
    }));

    info!(node_id = %module.status().node_id, "node is ready");

    tokio::select! {
        res = &mut api => report_api(res),
        signal = tokio::signal::ctrl_c() => {
            if let Err(e) = signal {
                error!(error = %e, "failed to listen for shutdown signal");
            }
            info!("shutting down");
            let _ = stop_tx.send(());
            report_api(api.await);
        }
    }

    if let Err(e) = module.terminate().await {
        error!(error = %e, "module shutdown failed");
    }
}

fn report_api(res: Result<agglomerator::Result<()>, tokio::task::JoinError>) {
    match res {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!(error = %e, "http api failed"),
        Err(e) => error!(error = %e, "http api task panicked"),
    }
}
