use clap::Parser;
use portcullis_proxy::{Config, ProxyServer};
use std::future::Future;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "portcullis", version, about = "API gateway forwarding engine")]
struct Args {
    /// Path to the YAML configuration file
    #[arg(short, long, env = "PORTCULLIS_CONFIG", default_value = "portcullis.yaml")]
    config: String,

    /// Override the configured listen port
    #[arg(short, long)]
    port: Option<u16>,

    /// Emit logs as JSON lines
    #[arg(long, env = "PORTCULLIS_LOG_JSON")]
    log_json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if args.log_json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    let mut config = Config::from_file(&args.config)?;
    if let Some(port) = args.port {
        config.listen.port = port;
    }

    let shutdown = CancellationToken::new();
    tokio::spawn(cancel_on_signal(tokio::signal::ctrl_c(), shutdown.clone()));

    ProxyServer::new(config)?.run(shutdown).await
}

/// Cancel `shutdown` once `signal` fires. A signal listener that fails to
/// install leaves the server running.
async fn cancel_on_signal<F>(signal: F, shutdown: CancellationToken)
where
    F: Future<Output = std::io::Result<()>>,
{
    match signal.await {
        Ok(()) => {
            info!("Received shutdown signal");
            shutdown.cancel();
        }
        Err(e) => error!("Unable to listen for shutdown signal: {}", e),
    }
}
