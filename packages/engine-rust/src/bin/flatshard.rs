//! flatshard CLI - query and modify a directory of partition files.
//!
//! Every `*.json` / `*.jsonl` file in the data directory is one partition,
//! identified by its file stem.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use flatshard_core::{PartitionId, Predicate, Query, Record, SortDirection};
use flatshard_engine::storage::{JsonFileStorage, MemoryManifest};
use flatshard_engine::{EngineConfig, QueryPipeline, StoragePort};
use serde::Serialize;
use serde_json::Value;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "flatshard")]
#[command(about = "Query and modify partitioned JSON data files")]
#[command(version)]
struct Args {
    /// Directory holding the partition files
    #[arg(short, long, env = "FLATSHARD_DATA_DIR", default_value = ".")]
    data_dir: PathBuf,

    /// Engine configuration file (JSON)
    #[arg(short, long, env = "FLATSHARD_CONFIG")]
    config: Option<PathBuf>,

    /// Log level, overridden by RUST_LOG
    #[arg(long, env = "FLATSHARD_LOG_LEVEL", default_value = "warn")]
    log_level: String,

    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Human)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Human,
    Json,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print matching records
    Query {
        /// Filter document, e.g. '{"age": {"$gte": 18}}'
        #[arg(short, long)]
        filter: Option<String>,
        /// Field to sort by
        #[arg(short, long)]
        sort: Option<String>,
        /// Sort descending
        #[arg(long, requires = "sort")]
        desc: bool,
        #[arg(short, long)]
        limit: Option<usize>,
        #[arg(short, long)]
        offset: Option<usize>,
        /// Restrict to these partitions (repeatable)
        #[arg(short, long = "partition")]
        partitions: Vec<PartitionId>,
    },
    /// Count matching records
    Count {
        #[arg(short, long)]
        filter: Option<String>,
        #[arg(short, long = "partition")]
        partitions: Vec<PartitionId>,
    },
    /// Show per-partition record counts and sizes
    Stats,
    /// Insert records given as a JSON object or array
    Insert {
        records: String,
        /// Target partition (defaults to the configured default partition)
        #[arg(short, long)]
        partition: Option<String>,
    },
    /// Delete matching records
    Delete {
        /// Filter document selecting the records to delete
        #[arg(short, long)]
        filter: String,
        #[arg(short, long)]
        partition: Option<String>,
    },
}

fn parse_filter(raw: &str) -> Result<Predicate> {
    let doc: Value = serde_json::from_str(raw).context("filter is not valid JSON")?;
    Ok(Predicate::from_json(&doc)?)
}

fn partition_filter(partitions: &[PartitionId]) -> Option<&[PartitionId]> {
    (!partitions.is_empty()).then_some(partitions)
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| args.log_level.clone().into());
    let json = matches!(args.log_format, LogFormat::Json);
    tracing_subscriber::registry()
        .with(filter)
        .with(json.then(|| tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr)))
        .with((!json).then(|| tracing_subscriber::fmt::layer().with_writer(std::io::stderr)))
        .init();

    let config = match &args.config {
        Some(path) => EngineConfig::from_json_file(path)?,
        None => EngineConfig::default(),
    };

    let storage = Arc::new(JsonFileStorage::new(&args.data_dir));
    storage.connect().await?;
    let manifest = Arc::new(MemoryManifest::from_directory(&args.data_dir).await?);
    let pipeline = QueryPipeline::new(Arc::clone(&storage) as Arc<dyn StoragePort>, manifest, config);

    match args.command {
        Commands::Query {
            filter,
            sort,
            desc,
            limit,
            offset,
            partitions,
        } => {
            let mut query = Query::new();
            if let Some(raw) = filter {
                query = query.filter(parse_filter(&raw)?);
            }
            if let Some(field) = sort {
                let direction = if desc { SortDirection::Desc } else { SortDirection::Asc };
                query = query.sort_by(field, direction);
            }
            if let Some(limit) = limit {
                query = query.limit(limit);
            }
            if let Some(offset) = offset {
                query = query.offset(offset);
            }
            if !partitions.is_empty() {
                query = query.in_partitions(partitions);
            }
            print_json(&pipeline.query(&query).await?)?;
        }
        Commands::Count { filter, partitions } => {
            let filter = filter.as_deref().map(parse_filter).transpose()?;
            let count = pipeline
                .count(filter.as_ref(), partition_filter(&partitions))
                .await?;
            println!("{count}");
        }
        Commands::Stats => {
            print_json(&pipeline.partition_stats(None).await?)?;
        }
        Commands::Insert { records, partition } => {
            let parsed: Value = serde_json::from_str(&records).context("records are not valid JSON")?;
            let batch: Vec<Record> = match parsed {
                Value::Array(items) => items,
                single => vec![single],
            };
            let stored = pipeline.insert(batch, partition.as_deref()).await?;
            print_json(&stored)?;
        }
        Commands::Delete { filter, partition } => {
            let removed = pipeline
                .delete(&parse_filter(&filter)?, partition.as_deref())
                .await?;
            println!("{removed}");
        }
    }

    storage.disconnect().await?;
    Ok(())
}
