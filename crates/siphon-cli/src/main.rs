//! Siphon - batch ingestion over a document store

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;

use siphon_common::logging::{init_logging, LogConfig, LogLevel};
use siphon_engine::store::postgres::JsonbStore;
use siphon_engine::{DocumentStore, IngestSpec, Ingester, RunOptions, SourceId};

mod config;

use config::CliConfig;

#[derive(Parser, Debug)]
#[command(name = "siphon")]
#[command(author, version, about = "Batch ingestion over a document store")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Parser, Debug)]
enum Command {
    /// Run a bulk ingest from one collection into another
    Run {
        /// Source collection
        #[arg(long)]
        input: String,

        /// Destination collection
        #[arg(long)]
        output: String,

        /// Logical source identifier recorded on the batch run
        #[arg(long, default_value = "cli")]
        source: String,

        /// Replace the destination with this run's result set
        #[arg(long)]
        replace: bool,

        /// JSON filter merged over the spec's static filter
        #[arg(long)]
        query: Option<String>,

        /// Records to skip after filtering
        #[arg(long)]
        skip: Option<u64>,

        /// Maximum records to deliver
        #[arg(long)]
        limit: Option<u64>,

        /// Diagnostic sampling interval, in records
        #[arg(long)]
        thresh: Option<u64>,

        /// Cursor batch size
        #[arg(long)]
        batch_size: Option<usize>,

        /// Abort the whole run on the first record failure
        #[arg(long)]
        fail_on_error: bool,

        /// Whole-cursor deadline in milliseconds
        #[arg(long)]
        cursor_timeout_ms: Option<u64>,

        /// Reference date for stage generators and hooks, RFC 3339
        #[arg(long)]
        date: Option<String>,
    },

    /// Load newline-delimited JSON records into a collection
    Load {
        /// Destination collection
        #[arg(long)]
        collection: String,

        /// Path to a file of one JSON document per line
        #[arg(long)]
        file: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Environment configures logging; the verbose flag overrides the level.
    let mut log_config = LogConfig::from_env()?;
    if cli.verbose {
        log_config.level = LogLevel::Debug;
    }
    let log_config = log_config.with_file_prefix("siphon");
    init_logging(&log_config)?;

    let config = CliConfig::load()?;

    match cli.command {
        Command::Run {
            input,
            output,
            source,
            replace,
            query,
            skip,
            limit,
            thresh,
            batch_size,
            fail_on_error,
            cursor_timeout_ms,
            date,
        } => {
            let store = Arc::new(
                JsonbStore::connect(&config.database.url, config.database.max_connections)
                    .await
                    .context("connecting to database")?,
            );

            let spec = IngestSpec::builder("siphon-cli", SourceId::fixed(source))
                .input(input)
                .output(output)
                .replace(replace)
                .build();

            let mut options = RunOptions {
                skip,
                limit,
                fail_on_error,
                ..Default::default()
            };
            if let Some(query) = query {
                options.query =
                    Some(serde_json::from_str(&query).context("parsing --query as JSON")?);
            }
            if let Some(thresh) = thresh {
                options.thresh = thresh;
            }
            if let Some(batch_size) = batch_size {
                options.batch_size = batch_size;
            }
            if let Some(timeout) = cursor_timeout_ms {
                options.cursor_timeout_ms = timeout;
            }
            if let Some(date) = date {
                options.date = date
                    .parse()
                    .context("parsing --date as an RFC 3339 timestamp")?;
            }

            let metrics = Ingester::new(store).execute(&spec, options).await?;
            info!(
                inserted = metrics.inserted,
                updated = metrics.updated,
                scanned = metrics.scanned,
                failed = metrics.failed,
                "run complete"
            );
        },
        Command::Load { collection, file } => {
            let store = Arc::new(
                JsonbStore::connect(&config.database.url, config.database.max_connections)
                    .await
                    .context("connecting to database")?,
            );

            let loaded = load_records(&*store, &collection, &file).await;
            let closed = store.close().await;
            let loaded = loaded?;
            closed.context("releasing store")?;

            info!(loaded, %collection, "load complete");
        },
    }

    Ok(())
}

/// Insert one document per non-empty line of `file` into `collection`.
async fn load_records(
    store: &dyn DocumentStore,
    collection: &str,
    file: &PathBuf,
) -> Result<u64> {
    let contents = std::fs::read_to_string(file)
        .with_context(|| format!("reading {}", file.display()))?;
    let target = store.collection(collection);

    let mut loaded = 0u64;
    for (number, line) in contents.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let doc = serde_json::from_str(line)
            .with_context(|| format!("parsing line {} of {}", number + 1, file.display()))?;
        target.insert_one(doc).await?;
        loaded += 1;
    }

    Ok(loaded)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_flags_parse() {
        let cli = Cli::try_parse_from([
            "siphon",
            "run",
            "--input",
            "raw",
            "--output",
            "cooked",
            "--limit",
            "5",
            "--date",
            "2026-03-01T00:00:00Z",
        ])
        .unwrap();

        let Command::Run {
            input,
            output,
            limit,
            date,
            ..
        } = cli.command
        else {
            panic!("expected the run subcommand");
        };
        assert_eq!(input, "raw");
        assert_eq!(output, "cooked");
        assert_eq!(limit, Some(5));

        let mut options = RunOptions::default();
        options.date = date.unwrap().parse().unwrap();
        assert_eq!(options.date.to_rfc3339(), "2026-03-01T00:00:00+00:00");
    }
}
