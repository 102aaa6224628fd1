use anyhow::Result;
use clap::{Parser, Subcommand};
use dealflow_sync::{RunFailure, ScrapeRequest, SyncConfig};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "dealflow")]
#[command(about = "Business-for-sale listings ingest")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Scrape one vertical and upsert the matching listings.
    Scrape {
        #[arg(long)]
        vertical: String,
        #[arg(long, default_value_t = 100, value_parser = clap::value_parser!(u32).range(1..))]
        max_pages: u32,
        #[arg(long, default_value_t = 10, value_parser = clap::value_parser!(u16).range(1..))]
        workers: u16,
        /// Keep listings in memory instead of writing to Postgres.
        #[arg(long)]
        dry_run: bool,
    },
    /// Apply database migrations.
    Migrate,
    /// List the configured verticals.
    Verticals,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("dealflow=info".parse()?))
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Scrape {
            vertical,
            max_pages,
            workers,
            dry_run,
        } => {
            let request = ScrapeRequest {
                vertical,
                max_pages,
                workers: usize::from(workers),
                dry_run,
            };
            match dealflow_sync::run_scrape_from_env(&request).await {
                Ok(summary) => {
                    let s = summary.stats;
                    println!(
                        "scrape complete: run_id={} vertical={} found={} matched={} filtered_out={} persisted={} new={} updated={} errors={} pages_failed={}",
                        summary.run_id,
                        summary.vertical_slug,
                        s.total_found,
                        s.matched,
                        s.filtered_out,
                        s.persisted,
                        s.new_listings,
                        s.updated_listings,
                        s.errors,
                        summary.pages_failed
                    );
                }
                Err(err) => {
                    if let Some(failure) = err.downcast_ref::<RunFailure>() {
                        let s = failure.stats;
                        eprintln!(
                            "scrape failed: run_id={} state={} found={} matched={} persisted={} errors={}",
                            failure.run_id, failure.failed_in, s.total_found, s.matched, s.persisted, s.errors
                        );
                    }
                    return Err(err);
                }
            }
        }
        Commands::Migrate => {
            dealflow_sync::migrate_from_env().await?;
            println!("migrations applied");
        }
        Commands::Verticals => {
            let catalog = SyncConfig::from_env().load_catalog()?;
            info!(count = catalog.len(), "verticals loaded");
            for vertical in catalog.iter() {
                println!("{:<12} {:<22} {}", vertical.slug, vertical.name, vertical.domain);
            }
        }
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
    fn scrape_defaults_match_the_documented_contract() {
        let cli = Cli::try_parse_from(["dealflow", "scrape", "--vertical", "cleaning"]).expect("parse");
        match cli.command {
            Commands::Scrape {
                vertical,
                max_pages,
                workers,
                dry_run,
            } => {
                assert_eq!(vertical, "cleaning");
                assert_eq!(max_pages, 100);
                assert_eq!(workers, 10);
                assert!(!dry_run);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn zero_workers_is_rejected() {
        assert!(Cli::try_parse_from(["dealflow", "scrape", "--vertical", "hvac", "--workers", "0"]).is_err());
        assert!(Cli::try_parse_from(["dealflow", "scrape"]).is_err());
    }
}
