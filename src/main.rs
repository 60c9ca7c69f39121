use anyhow::Result;
use clap::Parser;

mod cli;
mod commands;

use sessionizer::app::Mode;
use sessionizer::{config, init_tracing};

#[tokio::main]
async fn main() -> Result<()> {
    let args = cli::Cli::parse();
    let command = args.get_command();

    if matches!(command, cli::Commands::Version) {
        println!("sessionizer v{}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    // Logging settings come from the config, so load it before tracing is up
    let cfg = config::load_config(&args.config)?;
    init_tracing(&cfg.logging.level, &cfg.logging.format);

    match command {
        cli::Commands::Server => commands::run::execute(cfg, Mode::Server).await?,
        cli::Commands::Receiver => commands::run::execute(cfg, Mode::Receiver).await?,
        cli::Commands::Worker => commands::run::execute(cfg, Mode::Worker).await?,
        cli::Commands::Migrate => commands::migrate::execute(&cfg).await?,
        cli::Commands::Columns => commands::columns::execute(&cfg)?,
        cli::Commands::Config { action } => match action {
            cli::ConfigCommands::Show => commands::config::show(&cfg)?,
            cli::ConfigCommands::Validate => commands::config::validate(&cfg)?,
            cli::ConfigCommands::Docs => commands::config::docs()?,
        },
        cli::Commands::Version => {}
    }

    Ok(())
}
