use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::Parser;
use indicatif::MultiProgress;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use sleuth::{types::SearchInput, Listing, SearchCriteria, SearchPipeline, SleuthConfig};

/// Aggregate real estate listings from several platforms, flag new ones and
/// filter them against your criteria.
#[derive(Debug, Parser)]
#[command(name = "listing-sleuth", version, about)]
struct Cli {
    /// Search input in the actor input format.
    #[arg(default_value = "INPUT.json", env = "SLEUTH_INPUT")]
    input: PathBuf,

    /// Configuration file. Defaults to `sleuth.toml` when it exists.
    #[arg(short, long, env = "SLEUTH_CONFIG")]
    config: Option<PathBuf>,

    /// Log filter used when `RUST_LOG` is not set.
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Cancel the run after this many seconds.
    #[arg(long)]
    deadline_secs: Option<u64>,

    /// Print detail records as JSON lines instead of overview rows.
    #[arg(long)]
    json: bool,
}

/// The main entry point of the application.
///
/// This function initializes logging, loads the configuration and the search
/// input, runs the search pipeline and prints the reported listings followed
/// by the run summary.
#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    // Load configuration
    let mut config = SleuthConfig::load(cli.config.as_deref()).context("failed to load configuration")?;
    if cli.deadline_secs.is_some() {
        config.run_deadline_secs = cli.deadline_secs;
    }

    let raw = tokio::fs::read_to_string(&cli.input)
        .await
        .with_context(|| format!("failed to read search input {}", cli.input.display()))?;
    let input = SearchInput::from_json(&raw)
        .with_context(|| format!("failed to parse search input {}", cli.input.display()))?;
    config.apply_input(&input);
    let criteria = SearchCriteria::try_from(input)?;

    info!(location = %criteria.location, search_type = %criteria.search_type, "Loaded search criteria");

    let cancel = CancellationToken::new();
    spawn_cancellation(cancel.clone(), config.run_deadline());

    let start_time = Instant::now();
    let pipeline = SearchPipeline::from_config(&config).with_progress(MultiProgress::new());

    let report = match pipeline.run(&criteria, cancel).await {
        Ok(report) => report,
        Err(e) => {
            error!("Search failed: {}", e);
            return Err(e.into());
        }
    };

    if report.listings.is_empty() {
        warn!("No listings matched the search criteria");
    }

    if cli.json {
        for record in &report.records {
            println!("{}", serde_json::to_string(record)?);
        }
    } else {
        for listing in &report.listings {
            println!("{}", overview_row(listing));
        }
    }

    println!("\n{}", report.summary);
    println!("Processing time: {:.2?}", start_time.elapsed());

    Ok(())
}

/// Cancels the run on Ctrl-C or once `deadline` has passed.
fn spawn_cancellation(cancel: CancellationToken, deadline: Option<Duration>) {
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, finishing with the results gathered so far");
            on_signal.cancel();
        }
    });

    if let Some(deadline) = deadline {
        tokio::spawn(async move {
            tokio::time::sleep(deadline).await;
            warn!(?deadline, "Run deadline reached, cancelling");
            cancel.cancel();
        });
    }
}

fn overview_row(listing: &Listing) -> String {
    let overview = listing.overview();
    let count = |v: Option<f64>| v.map_or_else(|| "?".to_string(), |n| n.to_string());
    format!(
        "{} {} | {} | {} bd / {} ba | {} | {} | {}",
        if overview.is_new { "[NEW]" } else { "     " },
        overview.title,
        overview.price.map_or_else(|| "price n/a".to_string(), |p| format!("${:.0}", p)),
        count(overview.bedrooms),
        count(overview.bathrooms),
        overview.property_type,
        overview.address,
        overview.url,
    )
}
