use anyhow::Result;
use colored::Colorize;
use sessionizer::config::{BucketType, Config, PingMode, QueueBackend};
use tracing::info;

/// Execute the config show command
///
/// Displays the effective configuration after environment overrides
pub fn show(cfg: &Config) -> Result<()> {
    info!("Displaying configuration");

    println!("{}", "Current Configuration:".green().bold());
    println!();

    let toml_string = toml::to_string_pretty(cfg)?;
    println!("{}", toml_string);

    Ok(())
}

/// Execute the config validate command
///
/// Loading already validated the file, so this only prints a summary
pub fn validate(cfg: &Config) -> Result<()> {
    println!("{}", "✓ Configuration is valid".green());
    println!();
    println!("{}", "Summary:".bold());
    for line in summary(cfg) {
        println!("  {}", line);
    }

    info!("Configuration validation successful");
    Ok(())
}

/// Execute the config docs command
///
/// One line per setting: environment variable, then the default
pub fn docs() -> Result<()> {
    let defaults = toml::Value::try_from(Config::default())?;
    for (variable, default) in setting_docs(&defaults) {
        println!("{} = {}", variable.bold(), default);
    }
    Ok(())
}

fn setting_docs(defaults: &toml::Value) -> Vec<(String, String)> {
    let mut out = Vec::new();
    collect_settings("SESSIONIZER", defaults, &mut out);
    out
}

fn collect_settings(prefix: &str, value: &toml::Value, out: &mut Vec<(String, String)>) {
    match value {
        toml::Value::Table(table) => {
            for (key, child) in table {
                collect_settings(&format!("{}__{}", prefix, key.to_uppercase()), child, out);
            }
        }
        leaf => out.push((prefix.to_string(), leaf.to_string())),
    }
}

fn summary(cfg: &Config) -> Vec<String> {
    let queue = match cfg.queue.backend {
        QueueBackend::Filesystem => format!("filesystem ({})", cfg.queue.filesystem.directory),
        QueueBackend::Objectstorage => {
            let section = &cfg.queue.objectstorage;
            let root = match section.bucket_type {
                BucketType::Local => section.bucket_directory.clone(),
                BucketType::S3 => format!("s3://{}", section.bucket),
                BucketType::Gcs => format!("gs://{}", section.bucket),
            };
            format!("objectstorage ({}/{})", root, section.prefix)
        }
    };
    let ping = match cfg.receiver.ping.mode {
        PingMode::Periodic => format!("every {}ms", cfg.receiver.ping.interval_ms),
        PingMode::Backoff => format!(
            "backoff {}..{}ms",
            cfg.receiver.ping.min_interval_ms, cfg.receiver.ping.max_interval_ms
        ),
        PingMode::Disabled => "disabled".to_string(),
    };

    vec![
        format!("Queue: {}", queue),
        format!("Pings: {}", ping),
        format!("Session Timeout: {}s", cfg.sessions.timeout_secs),
        format!("Database: {}", cfg.storage.database_url),
        format!("Warehouse Table: {}", cfg.warehouse.table),
    ]
}
