//! Administrative CLI for seriesvault buckets
//!
//! Usage:
//!   seriesvault --config ~/.config/seriesvault/config.toml search site=tac species=ch4
//!   seriesvault set-rank user <uuid> 1 2016-01-01T00:00:00Z_2018-01-01T00:00:00Z site=tac species=ch4

use anyhow::Context;
use clap::{Parser, Subcommand};
use seriesvault::bucket::BucketRegistry;
use seriesvault::config::UserConfig;
use seriesvault::daterange::DateRange;
use seriesvault::metadata::Filters;
use seriesvault::ranking::{GroupKey, Rank};
use seriesvault::telemetry::Telemetry;
use std::path::{Path, PathBuf};
use tracing::info;
use uuid::Uuid;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file (defaults to $SERIESVAULT_CONFIG, then the user config dir)
    #[arg(short, long, env = "SERIESVAULT_CONFIG")]
    config: Option<PathBuf>,

    /// Log level
    #[arg(long, default_value = "warn")]
    log_level: String,

    /// Write the run's counters here in Prometheus text format on exit
    #[arg(long, env = "SERIESVAULT_METRICS_FILE")]
    metrics_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List configured buckets and their permissions
    Buckets,
    /// Search every bucket with key=value filters (key=a,b matches either)
    Search { filters: Vec<String> },
    /// Show one Datasource record
    Info { bucket: String, uuid: Uuid },
    /// Show the rank entries of a group
    Ranks { bucket: String, group: Vec<String> },
    /// Rank a Datasource within a group over <start>_<end>
    SetRank {
        bucket: String,
        uuid: Uuid,
        rank: Rank,
        range: DateRange,
        group: Vec<String>,
    },
    /// Show which Datasource of a group supplies each part of <start>_<end>
    Resolve {
        bucket: String,
        range: DateRange,
        group: Vec<String>,
    },
    /// Rebuild a bucket's metadata index from its Datasource records
    RebuildIndex { bucket: String },
    /// Delete a Datasource with its payloads and rank entries
    Delete { bucket: String, uuid: Uuid },
}

fn group_key(terms: &[String]) -> anyhow::Result<GroupKey> {
    let filters = Filters::parse_terms(terms)?;
    Ok(GroupKey::from_filters(&filters)?)
}

fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let telemetry = Telemetry::init_for_component("seriesvault", &args.log_level)
        .map_err(|e| anyhow::anyhow!(e.to_string()))?;

    let outcome = run(args.config.as_deref(), args.command).await;

    if let Some(path) = &args.metrics_file {
        std::fs::write(path, telemetry.render_metrics())
            .with_context(|| format!("writing metrics to {}", path.display()))?;
    }
    outcome
}

async fn run(config: Option<&Path>, command: Command) -> anyhow::Result<()> {
    let config = UserConfig::load(config).context("loading configuration")?;
    let registry = BucketRegistry::from_config(&config).context("opening buckets")?;

    match command {
        Command::Buckets => {
            for bucket in registry.buckets() {
                println!("{}\t{}", bucket.name(), bucket.permission());
            }
        }
        Command::Search { filters } => {
            let filters = Filters::parse_terms(&filters)?;
            let hits = registry.search(&filters).await?;
            info!(hits = hits.len(), "Search finished");
            print_json(&hits)?;
        }
        Command::Info { bucket, uuid } => {
            let datasource = registry.get_bucket(&bucket)?.datasource(&uuid).await?;
            print_json(&datasource)?;
        }
        Command::Ranks { bucket, group } => {
            let group = group_key(&group)?;
            let entries = registry.get_bucket(&bucket)?.get_ranks(&group).await?;
            print_json(&entries)?;
        }
        Command::SetRank {
            bucket,
            uuid,
            rank,
            range,
            group,
        } => {
            let group = group_key(&group)?;
            registry
                .write_bucket(Some(&bucket))?
                .set_rank(&group, &uuid, rank, range)
                .await?;
            println!("Ranked {} as {} over {} in {}", uuid, rank, range, group);
        }
        Command::Resolve {
            bucket,
            range,
            group,
        } => {
            let group = group_key(&group)?;
            let spans = registry
                .get_bucket(&bucket)?
                .resolve_rank(&group, &range)
                .await?;
            print_json(&spans)?;
        }
        Command::RebuildIndex { bucket } => {
            let count = registry
                .write_bucket(Some(&bucket))?
                .rebuild_index()
                .await?;
            println!("Rebuilt index of '{}' over {} datasources", bucket, count);
        }
        Command::Delete { bucket, uuid } => {
            let removed = registry
                .write_bucket(Some(&bucket))?
                .delete_datasource(&uuid)
                .await?;
            println!(
                "Deleted {} ({} versions)",
                removed.uuid(),
                removed.versions().count()
            );
        }
    }
    Ok(())
}
