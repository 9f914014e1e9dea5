use std::sync::Arc;

use anyhow::Context;
use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use replog::raft::Applicator;
use replog::{Config, FrontEnd, RaftNode, Worker};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "replog=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "config.toml".to_string());
    let config =
        Config::load(&config_path).with_context(|| format!("loading {config_path}"))?;

    let worker = Arc::new(Worker::new(
        config.storage.dir.clone(),
        config.storage.train_epochs,
    )?);
    let applicator: Arc<dyn Applicator> = worker.clone();
    let node = RaftNode::new(&config, Some(applicator)).await?;
    node.start().await?;

    let client_listener =
        TcpListener::bind((config.node.host.as_str(), config.node.client_port)).await?;
    info!(addr = %client_listener.local_addr()?, "client listener up");
    let frontend = FrontEnd::new(node.clone(), worker);
    tokio::spawn(async move { frontend.serve(client_listener).await });

    if let Some(port) = config.node.monitor_port {
        let monitor_listener = TcpListener::bind((config.node.host.as_str(), port)).await?;
        info!(addr = %monitor_listener.local_addr()?, "monitor listener up");
        let monitor_node = node.clone();
        tokio::spawn(async move {
            if let Err(err) = replog::monitor::serve(monitor_node, monitor_listener).await {
                error!(%err, "monitor server failed");
            }
        });
    }

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    node.stop();
    Ok(())
}
