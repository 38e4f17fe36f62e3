use anyhow::Context;

use vaultgate_infra::AppConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    vaultgate_observability::init();

    let config = AppConfig::from_env().context("invalid configuration")?;
    let services = vaultgate_api::app::services::start(&config).await?;
    let app = vaultgate_api::app::build_app(services.state());

    let listener = tokio::net::TcpListener::bind(config.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.bind_addr))?;

    tracing::info!("listening on {}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    services.shutdown().await;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown requested");
}
