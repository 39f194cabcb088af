use bucketsync_core::{ConfigSources, ReplicationConfig};
use bucketsync_replication::{
    CancellationToken, ObserverSet, ReplicationEngine, ReplicationError, ReplicationResult,
    RunSummary, TracingObserver,
};
use clap::Parser;
use futures::{Stream, StreamExt};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

mod progress;
mod report;

use progress::ProgressBarObserver;
use report::{render_summary, write_json};

/// Enumeration completed; object failures are in the summary.
const EXIT_OK: u8 = 0;
/// Configuration, client or enumeration failure.
const EXIT_FAILURE: u8 = 1;
/// Interrupted by Ctrl-C.
const EXIT_CANCELLED: u8 = 130;

const DEFAULT_ENV_FILE: &str = ".env";

#[derive(Parser, Debug)]
#[command(name = "bucketsync")]
#[command(about = "Replicate every object of one bucket into another", long_about = None)]
#[command(version)]
struct Cli {
    /// dotenv-style file with SOURCE_* / DESTINATION_* keys (default: .env if present)
    #[arg(long, env = "BUCKETSYNC_ENV_FILE")]
    env_file: Option<PathBuf>,

    /// YAML or TOML settings file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Source bucket name
    #[arg(long)]
    source_bucket: Option<String>,

    /// Source endpoint (e.g., https://minio.example.com or file:///srv/buckets)
    #[arg(long)]
    source_endpoint_url: Option<String>,

    /// Destination bucket name
    #[arg(long)]
    destination_bucket: Option<String>,

    /// Destination endpoint
    #[arg(long)]
    destination_endpoint_url: Option<String>,

    /// Prefix prepended to every destination key
    #[arg(long)]
    destination_prefix: Option<String>,

    /// Only replicate source keys starting with this prefix
    #[arg(long)]
    source_prefix: Option<String>,

    /// Objects transferred in parallel
    #[arg(long)]
    concurrency: Option<usize>,

    /// Never use server-side copy
    #[arg(long)]
    force_streamed: bool,

    /// Show per-object progress bars (implies streamed transfers)
    #[arg(long)]
    progress: bool,

    /// List and plan, but write nothing
    #[arg(long)]
    dry_run: bool,

    /// Skip TLS certificate verification for the source endpoint
    #[arg(long)]
    source_insecure: bool,

    /// Skip TLS certificate verification for the destination endpoint
    #[arg(long)]
    destination_insecure: bool,

    /// Write the run summary as JSON to this file
    #[arg(long, env = "BUCKETSYNC_SUMMARY_JSON")]
    summary_json: Option<PathBuf>,
}

impl Cli {
    /// Configuration sources, with flags taking precedence over everything.
    fn config_sources(&self) -> ConfigSources {
        let mut sources = match &self.env_file {
            Some(path) => ConfigSources::new().with_env_file(path, true),
            None => ConfigSources::new().with_env_file(DEFAULT_ENV_FILE, false),
        };
        if let Some(path) = &self.config {
            sources = sources.with_settings_file(path);
        }

        let flag = |set: bool, value: &'static str| set.then_some(value);
        sources
            .with_override_opt("SOURCE_BUCKET", self.source_bucket.clone())
            .with_override_opt("SOURCE_ENDPOINT_URL", self.source_endpoint_url.clone())
            .with_override_opt("DESTINATION_BUCKET", self.destination_bucket.clone())
            .with_override_opt(
                "DESTINATION_ENDPOINT_URL",
                self.destination_endpoint_url.clone(),
            )
            .with_override_opt("DESTINATION_PREFIX", self.destination_prefix.clone())
            .with_override_opt("BUCKETSYNC_SOURCE_PREFIX", self.source_prefix.clone())
            .with_override_opt(
                "BUCKETSYNC_CONCURRENCY",
                self.concurrency.map(|n| n.to_string()),
            )
            .with_override_opt("BUCKETSYNC_FORCE_STREAMED", flag(self.force_streamed, "true"))
            .with_override_opt("BUCKETSYNC_PROGRESS", flag(self.progress, "true"))
            .with_override_opt("BUCKETSYNC_DRY_RUN", flag(self.dry_run, "true"))
            .with_override_opt("SOURCE_VERIFY_TLS", flag(self.source_insecure, "false"))
            .with_override_opt(
                "DESTINATION_VERIFY_TLS",
                flag(self.destination_insecure, "false"),
            )
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    init_logging();

    let cli = Cli::parse();
    ExitCode::from(run(cli).await)
}

async fn run(cli: Cli) -> u8 {
    let result = replicate(&cli).await;
    match &result {
        Ok(summary) => finish(summary, cli.summary_json.as_deref()),
        Err(e) => {
            error!("{}", e);
            eprintln!("❌ {}", e);
            if let ReplicationError::Enumeration { partial, .. } = e {
                finish(partial, cli.summary_json.as_deref());
            }
        }
    }
    exit_code(&result)
}

async fn replicate(cli: &Cli) -> ReplicationResult<RunSummary> {
    let config = ReplicationConfig::resolve(&cli.config_sources())?;

    info!(
        source = %config.source.bucket,
        source_endpoint = config.source.display_endpoint(),
        destination = %config.destination.bucket,
        destination_endpoint = config.destination.display_endpoint(),
        prefix = %config.destination_prefix,
        concurrency = config.transfer.concurrency,
        "Starting bucketsync"
    );

    let mut observers = ObserverSet::new().with(Arc::new(TracingObserver));
    if config.transfer.progress {
        observers = observers.with(Arc::new(ProgressBarObserver::new()));
    }

    let engine = ReplicationEngine::connect(&config, Arc::new(observers)).await?;
    tokio::spawn(cancel_on_ctrl_c(engine.cancellation_token()));

    engine.run().await
}

/// Failed objects alone never fail the process.
fn exit_code(result: &ReplicationResult<RunSummary>) -> u8 {
    match result {
        Ok(summary) if summary.cancelled => EXIT_CANCELLED,
        Ok(_) => EXIT_OK,
        Err(_) => EXIT_FAILURE,
    }
}

fn finish(summary: &RunSummary, json_path: Option<&Path>) {
    println!("\n{}", render_summary(summary));
    if let Some(path) = json_path {
        match write_json(summary, path) {
            Ok(()) => info!(path = %path.display(), "Wrote run summary"),
            Err(e) => error!(path = %path.display(), error = %e, "Failed to write run summary"),
        }
    }
}

/// First interrupt cancels `token`; returns true on a second one.
async fn watch_interrupts<S>(mut interrupts: S, token: CancellationToken) -> bool
where
    S: Stream<Item = ()> + Unpin,
{
    if interrupts.next().await.is_none() {
        return false;
    }
    warn!("Interrupt received; finishing in-flight transfers (Ctrl-C again to exit now)");
    token.cancel();

    if interrupts.next().await.is_none() {
        return false;
    }
    warn!("Second interrupt received; exiting without waiting for in-flight transfers");
    true
}

async fn cancel_on_ctrl_c(token: CancellationToken) {
    let interrupts = futures::stream::unfold((), |()| async {
        tokio::signal::ctrl_c().await.ok().map(|()| ((), ()))
    });
    if watch_interrupts(Box::pin(interrupts), token).await {
        std::process::exit(i32::from(EXIT_CANCELLED));
    }
}

fn init_logging() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(env_filter).with_target(false).init();
}
