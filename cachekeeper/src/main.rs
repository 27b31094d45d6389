use std::path::Path;

use cachekeeper::config::AppConfig;
use cachekeeper::services::ServiceContainer;
use cachekeeper::{database, logging};
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();
    let config = AppConfig::from_env()?;

    let (logging, _guard) = logging::init_logging(Path::new(&config.log_dir))?;

    let pool = database::init_pool(&config.database_url).await?;
    database::run_migrations(&pool).await?;

    let container = ServiceContainer::from_pool(config, pool);
    logging.apply_persisted_filter(container.settings().as_ref()).await;
    logging.start_retention_cleanup(container.cancellation_token());

    let report = container.initialize().await?;
    info!(
        restored = report.restored,
        interrupted = report.interrupted,
        "cachekeeper started"
    );

    tokio::signal::ctrl_c().await?;
    info!("Shutdown requested");
    container.shutdown().await?;

    Ok(())
}
