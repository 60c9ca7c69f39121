use anyhow::Result;
use colored::Colorize;
use sessionizer::app::{self, Mode};
use sessionizer::config::Config;
use tracing::info;

/// Execute the server, receiver or worker command
///
/// Blocks until SIGINT/SIGTERM.
pub async fn execute(cfg: Config, mode: Mode) -> Result<()> {
    println!("{}", format!("Starting sessionizer in {} mode...", mode.name()).green());
    info!(
        mode = mode.name(),
        host = %cfg.server.host,
        port = cfg.server.port,
        "Starting sessionizer"
    );

    app::run(cfg, mode).await
}
