use anyhow::Context;
use clap::Parser;
use hs_engine::{ControllerManager, ControllerMetrics, DefaultManifestGenerator, SandboxRuntime};
use hs_store::Store;
use hs_suggestion::{AlgorithmConnector, HttpConnector, LocalConnector};
use hs_types::{ControllerConfig, Experiment};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Hyperparameter search controller
#[derive(Parser)]
#[command(name = "hypersearch-controller")]
#[command(about = "Runs the Experiment and Suggestion controllers")]
struct Args {
    /// Controller configuration (JSON); built-in defaults when omitted
    #[arg(long, env = "HYPERSEARCH_CONFIG")]
    config: Option<PathBuf>,

    /// Worker tasks per controller, overriding the configuration
    #[arg(long)]
    workers: Option<usize>,

    /// Health endpoint bind address
    #[arg(long, default_value = "0.0.0.0:8080")]
    health_addr: String,

    /// Serve algorithms in-process and simulate Trials instead of calling
    /// remote algorithm services
    #[arg(long)]
    sandbox: bool,

    /// Sandbox step interval
    #[arg(long, default_value = "200")]
    sandbox_tick_millis: u64,

    /// Experiment manifests (JSON) to submit at startup
    manifests: Vec<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let mut config = match &args.config {
        Some(path) => ControllerConfig::load(path)
            .with_context(|| format!("loading configuration from {}", path.display()))?,
        None => ControllerConfig::default(),
    };
    if let Some(workers) = args.workers {
        config.runtime.workers = workers;
    }
    let runtime = config.runtime.clone();

    let store = Arc::new(Store::new());
    let metrics = Arc::new(ControllerMetrics::new());
    let connector: Arc<dyn AlgorithmConnector> = if args.sandbox {
        Arc::new(LocalConnector::new())
    } else {
        Arc::new(HttpConnector::new(runtime.rpc_timeout()))
    };
    let manifests = Arc::new(DefaultManifestGenerator::new(Arc::new(config)));

    let mut manager = ControllerManager::new(
        Arc::clone(&store),
        connector,
        manifests,
        Arc::clone(&metrics),
        &runtime,
    );
    manager.start();

    let sandbox = args.sandbox.then(|| {
        let runtime = SandboxRuntime::new(Arc::clone(&store));
        tokio::spawn(runtime.run(
            Duration::from_millis(args.sandbox_tick_millis),
            manager.shutdown_signal(),
        ))
    });

    for path in &args.manifests {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let experiment: Experiment = serde_json::from_str(&raw)
            .with_context(|| format!("parsing {}", path.display()))?;
        let created = store.create(experiment)?;
        info!(experiment = %created.meta.key(), "submitted experiment");
    }

    let listener = TcpListener::bind(&args.health_addr)
        .await
        .with_context(|| format!("binding {}", args.health_addr))?;
    info!(addr = %args.health_addr, sandbox = args.sandbox, "hypersearch controller listening");

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (mut socket, _) = match accepted {
                    Ok(conn) => conn,
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                        continue;
                    }
                };
                let body = serde_json::json!({
                    "status": "ok",
                    "service": "hypersearch-controller",
                    "metrics": metrics.snapshot(),
                    "store": store.stats(),
                })
                .to_string();

                tokio::spawn(async move {
                    let mut buffer = [0u8; 1024];
                    let _ = socket.read(&mut buffer).await;
                    let response = format!(
                        "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\n\r\n{}",
                        body.len(),
                        body
                    );
                    let _ = socket.write_all(response.as_bytes()).await;
                    let _ = socket.shutdown().await;
                });
            }
            _ = tokio::signal::ctrl_c() => {
                info!("shutdown requested");
                break;
            }
        }
    }

    manager.shutdown().await;
    if let Some(task) = sandbox {
        task.await?;
    }
    Ok(())
}
