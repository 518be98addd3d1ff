//! CrystalFlow server binary.

use clap::Parser;
use crystalflow_tasks::{Config, Server};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::parse();

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| config.log_level.clone().into());

    if config.log_json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }

    tracing::info!(
        gpu_concurrency = config.gpu_concurrency.get(),
        cpu_concurrency = config.cpu_concurrency.get(),
        model_root = %config.model_root.display(),
        output_root = %config.output_root.display(),
        "Starting CrystalFlow"
    );

    Server::new(config)?.run().await
}
