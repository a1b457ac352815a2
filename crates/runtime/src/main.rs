use anyhow::Context;

use backline_runtime::{BacklineConfig, Runtime};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = BacklineConfig::load().context("loading configuration")?;
    backline_observability::init_with(&config.log);

    let runtime = Runtime::builder(config)
        .build()
        .context("building background runtime")?;
    runtime.register_maintenance_tasks()?;
    runtime.start().await?;

    tracing::info!("backline worker running; press ctrl-c to stop");
    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;

    tracing::info!("shutdown requested");
    runtime.shutdown().await;
    Ok(())
}
