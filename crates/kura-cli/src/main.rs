use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use kura_core::IngestOutcome;
use kura_pipeline::{IngestPipeline, PipelineConfig};
use kura_storage::SalesStore;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "kura")]
#[command(about = "Kura sales ingestion and ledger bridge")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the web API.
    Serve,
    /// Apply pending schema migrations and exit.
    Migrate,
    /// Ingest a single CSV file.
    Ingest {
        path: PathBuf,
        /// Reprocess immediately if the content was ingested before.
        #[arg(long)]
        confirm: bool,
    },
    /// Export all persisted records to a spreadsheet.
    Export { out: PathBuf },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    let config = PipelineConfig::from_env();

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => {
            let pipeline = IngestPipeline::from_config(config).await?;
            kura_web::serve(Arc::new(pipeline)).await?;
        }
        Commands::Migrate => {
            let store = SalesStore::connect(&config.database_url).await?;
            store.migrate().await?;
            println!("migrations applied: {}", config.database_url);
        }
        Commands::Ingest { path, confirm } => {
            let pipeline = IngestPipeline::from_config(config).await?;
            let filename = path
                .file_name()
                .and_then(|name| name.to_str())
                .context("ingest path has no usable filename")?
                .to_string();
            let bytes = std::fs::read(&path)
                .with_context(|| format!("reading {}", path.display()))?;

            let mut outcome = pipeline.ingest(&filename, &bytes).await?;
            if let IngestOutcome::ConfirmationRequired { content_hash, .. } = &outcome {
                if confirm {
                    outcome = pipeline.confirm(&filename, content_hash).await?;
                }
            }
            print_outcome(&filename, &outcome);
        }
        Commands::Export { out } => {
            let pipeline = IngestPipeline::from_config(config).await?;
            let bytes = pipeline.export_xlsx().await?;
            std::fs::write(&out, bytes)
                .with_context(|| format!("writing {}", out.display()))?;
            println!("exported to {}", out.display());
        }
    }

    Ok(())
}

fn print_outcome(filename: &str, outcome: &IngestOutcome) {
    match outcome {
        IngestOutcome::Ingested {
            inserted,
            dropped_unmapped,
            mirror,
        } => println!(
            "{filename}: inserted {inserted} rows ({dropped_unmapped} unmapped dropped), mirror: {mirror:?}"
        ),
        IngestOutcome::NoMatchingRows => {
            println!("{filename}: accepted, no rows in the target category")
        }
        IngestOutcome::ConfirmationRequired { content_hash, .. } => println!(
            "{filename}: identical content already ingested (hash {content_hash}); re-run with --confirm to replace"
        ),
    }
}
