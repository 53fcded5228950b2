use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use grantflow_core::OrgProfile;
use grantflow_discovery::{build_pipeline_from_env, get_schedule, maybe_build_scheduler};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

#[derive(Debug, Parser)]
#[command(name = "grantflow")]
#[command(about = "Nonprofit grant discovery pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one discovery pass over the configured sources.
    Discover {
        /// Comma-separated source names; omit to run all active sources.
        #[arg(long, value_delimiter = ',')]
        sources: Option<Vec<String>>,
        /// Use the in-memory store; nothing is persisted.
        #[arg(long)]
        dry_run: bool,
        /// Skip configured search keywords and issue one baseline fetch
        /// per source.
        #[arg(long)]
        no_keywords: bool,
    },
    /// Score stored grants against an organization profile.
    Score {
        /// JSON file holding the organization profile.
        #[arg(long)]
        org_file: PathBuf,
        /// Score a single grant by id.
        #[arg(long, conflicts_with = "batch")]
        grant_id: Option<i64>,
        /// Score up to N unscored grants.
        #[arg(long, default_value_t = 25)]
        batch: u32,
    },
    /// Show the discovery schedule derived from run history.
    Schedule,
    /// List active scraper sources.
    Sources,
    /// Run the periodic scheduler until interrupted.
    Watch,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Discover {
            sources,
            dry_run,
            no_keywords,
        } => {
            let result =
                grantflow_discovery::run_discovery(sources, !no_keywords, dry_run).await?;
            println!(
                "run {} {}: {} sources, {} found, {} added",
                result.run_id,
                result.status.as_str(),
                result.sources_scraped,
                result.grants_found,
                result.grants_added
            );
            for grant in &result.new_grants {
                println!("  + [{}] {} — {}", grant.id, grant.title, grant.funder);
            }
            if let Some(message) = &result.error_message {
                anyhow::bail!("run failed: {message}");
            }
        }
        Commands::Score {
            org_file,
            grant_id,
            batch,
        } => {
            let text = tokio::fs::read_to_string(&org_file)
                .await
                .with_context(|| format!("reading {}", org_file.display()))?;
            let org: OrgProfile = serde_json::from_str(&text)
                .with_context(|| format!("parsing {}", org_file.display()))?;

            let pipeline = build_pipeline_from_env(false).await?;
            let store = Arc::clone(pipeline.store());
            match grant_id {
                Some(id) => {
                    match pipeline.scoring().score_grant(store.as_ref(), &org, id).await? {
                        Some((score, reason)) => println!("grant {id}: {score} ({reason})"),
                        None => anyhow::bail!("no grant with id {id}"),
                    }
                }
                None => {
                    let outcome = pipeline
                        .scoring()
                        .score_batch(store.as_ref(), &org, batch)
                        .await?;
                    println!(
                        "scored {} grants, {} strong matches",
                        outcome.updated_count,
                        outcome.matches.len()
                    );
                    for grant in &outcome.matches {
                        println!(
                            "  * [{}] {} — {} ({:.1})",
                            grant.id,
                            grant.title,
                            grant.funder,
                            grant.score.unwrap_or_default()
                        );
                    }
                }
            }
        }
        Commands::Schedule => {
            let pipeline = build_pipeline_from_env(false).await?;
            let status = get_schedule(pipeline.store().as_ref(), pipeline.config()).await?;
            println!("frequency: every {} hours", status.frequency_hours);
            match status.last_run {
                Some(at) => println!("last run:  {at}"),
                None => println!("last run:  never"),
            }
            match status.next_run {
                Some(at) => println!("next run:  {at}"),
                None => println!("next run:  scheduler disabled"),
            }
        }
        Commands::Sources => {
            let pipeline = build_pipeline_from_env(false).await?;
            let sources = pipeline.store().active_sources().await?;
            if sources.is_empty() {
                println!("no active sources configured");
            }
            for source in sources {
                println!(
                    "{:<24} {} (limit {}/h, last scraped {})",
                    source.name,
                    source.url,
                    source.rate_limit_per_hour,
                    source
                        .last_scraped
                        .map(|at| at.to_string())
                        .unwrap_or_else(|| "never".to_string())
                );
            }
        }
        Commands::Watch => {
            let pipeline = Arc::new(build_pipeline_from_env(false).await?);
            let Some(mut scheduler) = maybe_build_scheduler(Arc::clone(&pipeline)).await? else {
                anyhow::bail!("scheduler disabled; set GRANTFLOW_SCHEDULER_ENABLED=1");
            };
            scheduler.start().await.context("starting scheduler")?;
            info!(
                interval_hours = pipeline.config().interval_hours,
                "scheduler running, press ctrl-c to stop"
            );
            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
            scheduler.shutdown().await.context("stopping scheduler")?;
        }
    }

    Ok(())
}
