use anyhow::Result;
use colored::Colorize;
use sessionizer::app;
use sessionizer::config::Config;
use tracing::info;

/// Execute the migrate command
///
/// Connecting runs every pending migration.
pub async fn execute(cfg: &Config) -> Result<()> {
    println!("{}", "Running database migrations...".yellow());
    info!(database_url = %cfg.storage.database_url, "Running migrations");

    let pool = app::open_database(cfg).await?;
    pool.close().await;

    println!("{}", "✓ Database schema is up to date".green());
    Ok(())
}
