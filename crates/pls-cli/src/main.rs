use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use pls_storage::{MemoryCollectionRepository, PgCollectionRepository};
use pls_sync::{is_valid_survey_year, Collector, CollectorConfig, UpdateOutcome};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "pls-cli")]
#[command(about = "Public Libraries Survey data collector")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Collect one survey year.
    Collect {
        #[arg(long)]
        year: i32,
        /// Re-open a year that is already complete.
        #[arg(long)]
        force: bool,
    },
    /// Collect every year the portal publishes, oldest first.
    CollectAll,
    /// Collect the newest published year if it is not loaded yet.
    Update,
    /// List the survey years the portal publishes.
    Discover,
    /// Print the status of every known year.
    Status,
    /// Apply database migrations.
    Migrate,
    /// Import the tracked library config from a YAML file.
    ImportConfig { path: PathBuf },
    /// Serve the collection API.
    Serve {
        #[arg(long)]
        port: Option<u16>,
    },
}

fn env_flag(name: &str) -> bool {
    std::env::var(name)
        .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "yes" | "YES"))
        .unwrap_or(false)
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if env_flag("PLS_LOG_JSON") {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Update) {
        Commands::Collect { year, force } => {
            if !is_valid_survey_year(year) {
                bail!("{year} is not a valid survey year");
            }
            let outcome = pls_sync::run_collect_year_from_env(year, force).await?;
            println!("{}", serde_json::to_string_pretty(&outcome)?);
            if !outcome.is_success() {
                bail!("collection for {year} did not complete");
            }
        }
        Commands::CollectAll => {
            let collector = pls_sync::collector_from_env().await?;
            let results = collector.collect_all_available_data().await;
            for (year, ok) in &results {
                println!("{year}: {}", if *ok { "complete" } else { "failed" });
            }
            let failed = results.values().filter(|ok| !**ok).count();
            if failed > 0 {
                bail!("{failed} of {} years failed", results.len());
            }
        }
        Commands::Update => {
            let outcome = pls_sync::run_update_from_env().await?;
            println!("{}", serde_json::to_string_pretty(&outcome)?);
            if let UpdateOutcome::Failed(year) = outcome {
                bail!("update for {year} failed");
            }
        }
        Commands::Discover => {
            let collector = Collector::new(
                CollectorConfig::from_env(),
                Arc::new(MemoryCollectionRepository::new()),
            )?;
            let years = collector.discover_available_years().await;
            if years.is_empty() {
                println!("no survey years discovered");
            }
            for year in years {
                println!("{year}");
            }
        }
        Commands::Status => {
            let collector = pls_sync::collector_from_env().await?;
            let status = collector.get_collection_status().await?;
            if status.is_empty() {
                println!("no datasets recorded");
            }
            for (year, row) in &status {
                println!(
                    "{year} {:<10} records={} updated={} {}",
                    row.status.as_str(),
                    row.record_count.map_or_else(|| "-".to_string(), |n| n.to_string()),
                    row.updated_at.to_rfc3339(),
                    row.notes.as_deref().unwrap_or(""),
                );
            }
        }
        Commands::Migrate => {
            let config = CollectorConfig::from_env();
            let repo = PgCollectionRepository::connect(&config.database_url).await?;
            repo.migrate().await?;
            info!("migrations applied");
        }
        Commands::ImportConfig { path } => {
            let collector = pls_sync::collector_from_env().await?;
            let config = collector
                .import_library_config(&path)
                .await
                .with_context(|| format!("importing {}", path.display()))?;
            println!(
                "library config imported: library_id={} auto_update={}",
                config.library_id, config.auto_update_enabled
            );
        }
        Commands::Serve { port } => pls_web::serve_from_env(port).await?,
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn collect_parses_year_and_force() {
        let cli = Cli::try_parse_from(["pls-cli", "collect", "--year", "2022", "--force"]).unwrap();
        match cli.command {
            Some(Commands::Collect { year, force }) => {
                assert_eq!(year, 2022);
                assert!(force);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn import_config_takes_a_path() {
        let cli = Cli::try_parse_from(["pls-cli", "import-config", "library.yaml"]).unwrap();
        assert!(matches!(
            cli.command,
            Some(Commands::ImportConfig { path }) if path == PathBuf::from("library.yaml")
        ));
    }

    #[test]
    fn collect_requires_a_year() {
        assert!(Cli::try_parse_from(["pls-cli", "collect"]).is_err());
    }
}
