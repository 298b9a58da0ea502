use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::{DateTime, Days, Utc};
use clap::{Parser, Subcommand};
use ecal_adapters::{BundleProducer, CandidateProducer, ProducerContext, QuarterlyProjectionProducer};
use ecal_cache::{CacheConfig, CacheService, SubmitReport};
use ecal_storage::SnapshotArchive;
use ecal_web::ServerVariant;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "ecal-cli")]
#[command(about = "Earnings calendar cache command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the HTTP API.
    Serve {
        /// Serve seeded sample data from an in-memory store.
        #[arg(long)]
        mock: bool,
    },
    /// Merge one or more candidate bundle files into the cache.
    Ingest {
        #[arg(required = true)]
        bundles: Vec<PathBuf>,
    },
    /// Project upcoming report dates from reported history.
    Project {
        #[arg(long, default_value_t = 120)]
        horizon_days: u64,
    },
    /// Remove records past their retention horizon.
    Sweep {
        /// RFC 3339 timestamp; defaults to now.
        #[arg(long)]
        as_of: Option<DateTime<Utc>>,
    },
    /// Write a snapshot to a file, or to the content-addressed export dir.
    Export {
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Load a snapshot file produced by `export`.
    Import { path: PathBuf },
    Stats,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn print_submit(label: &str, report: &SubmitReport) {
    println!(
        "{label}: created={} updated={} rejected={} needs_review={}",
        report.created(),
        report.updated(),
        report.rejected(),
        report.review_keys.len()
    );
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = CacheConfig::from_env();

    match cli.command.unwrap_or(Commands::Stats) {
        Commands::Serve { mock: true } => ecal_web::serve_from_env(ServerVariant::Mock).await,
        Commands::Serve { mock: false } => ecal_web::serve_from_env(ServerVariant::Cached).await,
        command => {
            let service = CacheService::from_config(&config).await?;
            let result = run(command, &config, &service).await;
            service.close().await;
            result
        }
    }
}

async fn run(command: Commands, config: &CacheConfig, service: &CacheService) -> Result<()> {
    match command {
        Commands::Serve { .. } => anyhow::bail!("serve owns its own store handle"),
        Commands::Ingest { bundles } => {
            let ctx = ProducerContext::now();
            for path in bundles {
                let producer = BundleProducer::open(&path)?;
                let candidates = producer
                    .produce(&ctx)
                    .await
                    .with_context(|| format!("reading bundle {}", path.display()))?;
                let report = service.submit(candidates).await?;
                print_submit(&path.display().to_string(), &report);
            }
        }
        Commands::Project { horizon_days } => {
            let ctx = ProducerContext::now();
            let history = service.export().await?.earnings;
            let through = ctx.retrieved_at.date_naive() + Days::new(horizon_days);
            let candidates = QuarterlyProjectionProducer::new(history, through)
                .produce(&ctx)
                .await?;
            info!(count = candidates.len(), %through, "projected candidates");
            let report = service.submit(candidates).await?;
            print_submit("projection", &report);
        }
        Commands::Sweep { as_of } => {
            let report = service.sweep_expired(as_of.unwrap_or_else(Utc::now)).await?;
            println!(
                "sweep complete: as_of={} earnings_removed={} analysts_removed={}",
                report.as_of, report.earnings_removed, report.analysts_removed
            );
        }
        Commands::Export { out: Some(out) } => {
            let snapshot = service.export().await?;
            let bytes = serde_json::to_vec_pretty(&snapshot)?;
            tokio::fs::write(&out, &bytes)
                .await
                .with_context(|| format!("writing {}", out.display()))?;
            println!(
                "export complete: earnings={} analysts={} path={}",
                snapshot.earnings.len(),
                snapshot.analysts.len(),
                out.display()
            );
        }
        Commands::Export { out: None } => {
            let archive = SnapshotArchive::new(config.export_dir.clone());
            let archived = service.export_to_archive(&archive).await?;
            println!(
                "export complete: hash={} bytes={} deduplicated={} path={}",
                archived.content_hash,
                archived.byte_size,
                archived.deduplicated,
                archived.absolute_path.display()
            );
        }
        Commands::Import { path } => {
            let bytes = SnapshotArchive::read_bytes(&path).await?;
            let summary = service.import_json(&bytes).await?;
            println!(
                "import complete: earnings_created={} earnings_updated={} analysts_created={} analysts_updated={}",
                summary.earnings_created,
                summary.earnings_updated,
                summary.analysts_created,
                summary.analysts_updated
            );
        }
        Commands::Stats => {
            let stats = service.stats().await?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }
    }
    Ok(())
}
