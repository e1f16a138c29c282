use anyhow::Context;
use tracing::info;
use tracing_subscriber::EnvFilter;

use netmesh_server::config::ServerConfig;
use netmesh_server::server::MeshServer;

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,netmesh_server=debug")),
        )
        .init();

    info!("starting netmesh server v{}", env!("CARGO_PKG_VERSION"));

    let config = ServerConfig::from_env();
    info!(?config, "loaded configuration");

    let mut builder = tokio::runtime::Builder::new_multi_thread();
    if config.worker_threads > 0 {
        builder.worker_threads(config.worker_threads);
    }
    let runtime = builder.enable_all().build().context("build runtime")?;

    runtime.block_on(async move {
        let server = MeshServer::bind(config).await?;
        let shutdown = server.shutdown_token();

        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.ok();
            info!("received ctrl-c, shutting down");
            shutdown.cancel();
        });

        server.run().await
    })
}
