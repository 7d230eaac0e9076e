use clap::Parser;
use tracing_subscriber::EnvFilter;

use canopy::config::Config;
use canopy::server::CanopyServer;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .compact()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = Config::parse();
    let server = CanopyServer::new(config)
        .await
        .expect("failed to build the canopy server");
    server.serve().await.expect("server exited with an error");
}
