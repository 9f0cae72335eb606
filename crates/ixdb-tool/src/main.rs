//! ixdb - command line front end for an index directory
//!
//! ```bash
//! # Write a default ixdb.yml
//! ixdb generate-config
//!
//! # Register 1000 hosts x 6 metric groups, with samples on the last 3 days
//! ixdb load --hosts 1000 --days 3
//!
//! # Search; every positional argument is one OR-ed filter set
//! ixdb search '__name__="cpu_usage",region=~"us-.*"' 'host="host-7"' --explain
//!
//! # List label names and values
//! ixdb keys
//! ixdb values region
//! ```

mod config;
mod filters;
mod load;

use anyhow::Result;
use clap::{Parser, Subcommand};
use config::ToolConfig;
use filters::{build_tag_filters, parse_scope};
use ixdb_core::{now_millis, Scope, TimeRange, MSECS_PER_DAY};
use ixdb_index::{IndexCaches, IndexDb, SearchOptions};
use ixdb_storage::IndexTable;
use load::LoadSpec;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::info;
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "ixdb")]
#[command(author, version, about = "Series identity index tool")]
struct Cli {
    /// Path to the config file
    #[arg(short, long, global = true, default_value = "ixdb.yml")]
    config: PathBuf,

    /// Data directory (overrides config)
    #[arg(short, long, global = true)]
    data_dir: Option<PathBuf>,

    /// Tenant as account:project
    #[arg(short, long, global = true, default_value = "0:0", value_parser = parse_scope)]
    scope: Scope,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write the default configuration to the config path
    GenerateConfig,

    /// Register a synthetic dataset
    Load {
        /// Number of hosts
        #[arg(long, default_value = "1000")]
        hosts: usize,

        /// Days with samples, ending today
        #[arg(long, default_value = "1")]
        days: u64,

        /// Random seed
        #[arg(long, default_value = "42")]
        seed: u64,
    },

    /// Search series ids
    Search {
        /// Filter sets such as 'n="1",j!~"foo.*"'
        #[arg(required = true)]
        filters: Vec<String>,

        /// Look back this many days from now; 0 searches all time
        #[arg(long, default_value = "1")]
        days: u64,

        /// Fail above this many matches
        #[arg(long, default_value = "1000000")]
        max_metrics: usize,

        /// Search deadline in milliseconds
        #[arg(long)]
        timeout_ms: Option<u64>,

        /// Print the identity of every match
        #[arg(long)]
        names: bool,

        /// Print the executed plan
        #[arg(long)]
        explain: bool,

        /// Print the executed plan as JSON
        #[arg(long, conflicts_with = "explain")]
        explain_json: bool,
    },

    /// List label names
    Keys {
        #[arg(long, default_value = "1000")]
        limit: usize,
    },

    /// List values of one label
    Values {
        key: String,

        #[arg(long, default_value = "1000")]
        limit: usize,
    },

    /// Print table, registration and cache statistics
    Stats,

    /// Snapshot the table and drop covered WAL files
    Checkpoint,
}

fn init_logging(config: &ToolConfig) -> Result<()> {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(config.log_level())
        .with_target(config.logging.show_target)
        .with_thread_ids(config.logging.show_thread_ids)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Commands::GenerateConfig = cli.command {
        ToolConfig::write_default(&cli.config)?;
        println!("Generated default configuration: {}", cli.config.display());
        return Ok(());
    }

    let mut config = ToolConfig::load_or_default(&cli.config)?;
    if let Some(data_dir) = cli.data_dir {
        config.table.data_dir = data_dir;
    }
    init_logging(&config)?;

    info!("Starting ixdb v{}", env!("CARGO_PKG_VERSION"));
    info!("Data directory: {:?}", config.table.data_dir);
    info!("WAL durability: {}", config.table.wal_durability);

    let table = Arc::new(IndexTable::open(config.to_table_config())?);
    let caches = IndexCaches::new(&config.index);
    let db = IndexDb::open(table.clone(), caches, config.index.clone())?;
    let scope = cli.scope;

    match cli.command {
        Commands::GenerateConfig => {}
        Commands::Load { hosts, days, seed } => {
            let spec = LoadSpec {
                scope,
                hosts,
                days: days.max(1),
                end: now_millis(),
                seed,
            };
            let report = load::load(&db, &spec)?;
            println!(
                "{} new series, {} resolves in scope {}",
                report.series, report.resolves, scope
            );
        }
        Commands::Search {
            filters,
            days,
            max_metrics,
            timeout_ms,
            names,
            explain,
            explain_json,
        } => {
            let tfss = filters
                .iter()
                .map(|expr| build_tag_filters(scope, expr, config.index.regex_match_cache_size))
                .collect::<Result<Vec<_>>>()?;
            let tr = if days == 0 {
                TimeRange::default()
            } else {
                let now = now_millis();
                TimeRange::new(now - days as i64 * MSECS_PER_DAY, now + 1)
            };
            let mut opts = SearchOptions::default().with_max_metrics(max_metrics);
            if let Some(ms) = timeout_ms {
                opts = opts.with_timeout(Duration::from_millis(ms));
            }

            let started = Instant::now();
            let (ids, plan) = db.search_with_plan(&tfss, tr, &opts)?;
            let elapsed = started.elapsed();

            if explain {
                println!("{}", plan);
            } else if explain_json {
                println!("{}", serde_json::to_string_pretty(&plan)?);
            }
            for id in &ids {
                if names {
                    println!("{}\t{}", id, db.search_metric_name(scope, *id)?);
                } else {
                    println!("{}", id);
                }
            }
            println!("{} series in {:?}", ids.len(), elapsed);
        }
        Commands::Keys { limit } => {
            for key in db.search_tag_keys(scope, limit)? {
                println!("{}", String::from_utf8_lossy(&key));
            }
        }
        Commands::Values { key, limit } => {
            for value in db.search_tag_values(scope, key.as_bytes(), limit)? {
                println!("{}", String::from_utf8_lossy(&value));
            }
        }
        Commands::Stats => {
            let table_stats = table.stats();
            let index_stats = db.stats();
            let tsid_cache = db.caches().tsid.stats();
            let name_cache = db.caches().metric_name.stats();
            let hours = db.caches().hours.stats();
            println!("rows: {}", table_stats.row_count);
            println!("batches replayed: {}", table_stats.batches_replayed);
            println!("wal file: {}", table_stats.wal_file_num);
            println!("series in scope {}: {}", scope, db.series_count(scope)?);
            println!("next metric id: {}", index_stats.next_metric_id);
            println!(
                "tsid cache: {} entries, {} hits, {} misses",
                tsid_cache.entries, tsid_cache.hits, tsid_cache.misses
            );
            println!(
                "metric name cache: {} entries, {} hits, {} misses",
                name_cache.entries, name_cache.hits, name_cache.misses
            );
            println!(
                "active series: {} this hour, {} previous hour",
                hours.current_len, hours.previous_len
            );
        }
        Commands::Checkpoint => {
            db.flush()?;
            table.checkpoint()?;
            println!("Checkpoint written to {}", config.table.data_dir.display());
        }
    }

    db.flush()?;
    table.close()?;
    Ok(())
}
