use std::io::Write;
use std::path::PathBuf;

use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use revlens_core::config_file::{self, ConfigFile};
use revlens_core::{Config, DurableStore, StoreLocation, TieredCache};
use tracing_subscriber::EnvFilter;

mod output;

use output::ColorMode;

/// Inspect and maintain the revlens review-analysis cache
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to the durable cache database (overrides REVLENS_DB and config)
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    /// Disable colored output
    #[arg(long, global = true)]
    no_color: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Show store location, row counts and disk usage
    Info,

    /// Show the archived review set summary for an app
    Show {
        app_id: String,
    },

    /// Remove durable data older than the given number of days
    Cleanup {
        #[arg(long, default_value_t = 30)]
        days: u32,
    },

    /// Remove every cached record for one app
    ClearApp {
        app_id: String,
    },

    /// Wipe the whole durable cache
    ClearAll {
        /// Confirm the wipe
        #[arg(long)]
        yes: bool,
    },

    /// Print the resolved configuration as TOML
    Config {
        /// Also write it to the platform config file
        #[arg(long)]
        save: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let color = ColorMode(!cli.no_color && std::env::var_os("NO_COLOR").is_none());

    let file = config_file::load_config();
    let mut config = Config::from_file(&file);
    if let Some(location) = store_override(cli.db.clone()) {
        config.cache.store = Some(location);
    }

    match cli.command {
        Command::Info => info(&config, color).await,
        Command::Show { app_id } => show(&config, &app_id, color).await,
        Command::Cleanup { days } => cleanup(&config, days, color).await,
        Command::ClearApp { app_id } => clear_app(&config, &app_id, color).await,
        Command::ClearAll { yes } => clear_all(&config, yes, color).await,
        Command::Config { save } => print_config(&file, &config, save),
    }
}

/// `--db` wins over `REVLENS_DB`; neither means "use the config file".
fn store_override(flag: Option<PathBuf>) -> Option<StoreLocation> {
    flag.or_else(|| {
        std::env::var_os("REVLENS_DB")
            .filter(|v| !v.is_empty())
            .map(PathBuf::from)
    })
    .map(StoreLocation::File)
}

fn store_location(config: &Config) -> anyhow::Result<StoreLocation> {
    config
        .cache
        .store
        .clone()
        .context("durable storage is disabled; pass --db or set REVLENS_DB")
}

async fn open_store(config: &Config) -> anyhow::Result<DurableStore> {
    let location = store_location(config)?;
    DurableStore::open(location.clone())
        .await
        .with_context(|| format!("failed to open durable cache at {:?}", location))
}

async fn open_cache(config: &Config) -> anyhow::Result<TieredCache> {
    store_location(config)?;
    let cache = TieredCache::open(config.cache.clone()).await;
    if !cache.has_persistence() {
        bail!("durable cache could not be opened; see log for details");
    }
    Ok(cache)
}

async fn info(config: &Config, color: ColorMode) -> anyhow::Result<()> {
    let store = open_store(config).await?;
    let counts = store.counts().await?;
    let storage = store.storage_info().await;

    let mut out = std::io::stdout().lock();
    output::print_storage_report(&mut out, store.location(), &counts, &storage, color)?;
    Ok(())
}

async fn show(config: &Config, app_id: &str, color: ColorMode) -> anyhow::Result<()> {
    let store = open_store(config).await?;
    let Some(meta) = store.get_metadata(app_id).await? else {
        bail!("no review set archived for app {app_id}");
    };
    let mut out = std::io::stdout().lock();
    output::print_metadata(&mut out, &meta, color)?;
    Ok(())
}

async fn cleanup(config: &Config, days: u32, color: ColorMode) -> anyhow::Result<()> {
    let cache = open_cache(config).await?;
    let report = cache.run_janitor(days).await;
    let mut out = std::io::stdout().lock();
    output::print_cleanup(&mut out, days, &report, color)?;
    if report.durable.is_none() {
        bail!("cleanup did not complete");
    }
    Ok(())
}

async fn clear_app(config: &Config, app_id: &str, color: ColorMode) -> anyhow::Result<()> {
    let store = open_store(config).await?;
    let analyses = store.clear_app_data(app_id).await?;
    let mut out = std::io::stdout().lock();
    output::print_done(
        &mut out,
        &format!("Cleared app {app_id} ({analyses} analyses removed)"),
        color,
    )?;
    Ok(())
}

async fn clear_all(config: &Config, yes: bool, color: ColorMode) -> anyhow::Result<()> {
    if !yes {
        bail!("refusing to wipe the cache without --yes");
    }
    let cache = open_cache(config).await?;
    cache.clear_all().await;
    let mut out = std::io::stdout().lock();
    output::print_done(&mut out, "Cleared durable cache", color)?;
    Ok(())
}

fn print_config(file: &ConfigFile, config: &Config, save: bool) -> anyhow::Result<()> {
    let mut resolved = file.clone();
    let storage = resolved.storage.get_or_insert_with(Default::default);
    match &config.cache.store {
        Some(StoreLocation::File(path)) => storage.path = Some(path.display().to_string()),
        Some(StoreLocation::Memory) | None => storage.disabled = Some(true),
    }

    let text = toml::to_string_pretty(&resolved).context("failed to render config")?;
    let mut out = std::io::stdout().lock();
    write!(out, "{text}")?;

    if save {
        let path = config_file::save_config(&resolved)?;
        tracing::info!(path = %path.display(), "saved config");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flag_overrides_env() {
        // The only test in this binary that touches REVLENS_DB.
        unsafe { std::env::set_var("REVLENS_DB", "/tmp/env.db") };
        let flagged = store_override(Some(PathBuf::from("/tmp/flag.db")));
        let from_env = store_override(None);
        unsafe { std::env::remove_var("REVLENS_DB") };

        assert_eq!(flagged, Some(StoreLocation::File("/tmp/flag.db".into())));
        assert_eq!(from_env, Some(StoreLocation::File("/tmp/env.db".into())));
        assert_eq!(store_override(None), None);
    }

    #[test]
    fn cli_parses_global_flags_after_subcommand() {
        let cli = Cli::parse_from(["revlens", "cleanup", "--days", "7", "--no-color"]);
        assert!(cli.no_color);
        assert!(matches!(cli.command, Command::Cleanup { days: 7 }));
    }

    #[test]
    fn clear_all_requires_confirmation_flag() {
        let cli = Cli::parse_from(["revlens", "clear-all"]);
        assert!(matches!(cli.command, Command::ClearAll { yes: false }));
    }
}
