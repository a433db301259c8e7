use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use std::io::Read;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

use reviewsync_core::{
    extract_work_item_link, CoordinationGate, LeaseStore, PullRequestRef, SyncEngine, SyncOutcome,
};
use reviewsync_server::config::Config;
use reviewsync_server::http::create_http_client;
use reviewsync_server::{CorrelationId, GitHubClient, SqliteLeaseStore, TrackerClient};

/// reviewsync: keep tracker review records in line with pull request reviews
#[derive(Parser, Debug)]
#[command(name = "reviewsync")]
#[command(about = "Reconcile tracker review records with pull request reviews", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Reconcile one work item now
    Sync(SyncArgs),
    /// Print the work item id linked from TEXT (or stdin)
    ExtractLink(ExtractLinkArgs),
    /// Inspect or clear the lease of a work item
    Lease {
        #[command(subcommand)]
        command: LeaseCommands,
    },
}

#[derive(Parser, Debug)]
struct SyncArgs {
    /// Work item identifier
    work_item_id: String,

    /// Pull request that triggered the run, as owner/repo#number
    #[arg(long)]
    initiator: Option<PullRequestRef>,

    /// If set, do not make any changes, just print what would be done
    #[arg(long)]
    dry_run: bool,
}

#[derive(Parser, Debug)]
struct ExtractLinkArgs {
    /// Text to scan; read from stdin when omitted
    text: Option<String>,
}

#[derive(Subcommand, Debug)]
enum LeaseCommands {
    /// Show who holds the lease and since when
    Status { work_item_id: String },
    /// Delete the lease regardless of holder
    Release { work_item_id: String },
}

fn open_lease_store(config: &Config) -> Result<SqliteLeaseStore> {
    let path = config.state_db_path();
    SqliteLeaseStore::new(&path)
        .with_context(|| format!("Failed to open lease database {}", path.display()))
}

fn build_engine(config: &Config) -> Result<SyncEngine> {
    let http_client = create_http_client()?;
    let correlation_id = CorrelationId::new();

    let github = GitHubClient::new(
        http_client.clone(),
        config.github_api_url.clone(),
        config.github_auth.clone(),
    )
    .scoped(None, Some(correlation_id.clone()));
    let tracker = TrackerClient::new(
        http_client,
        config.tracker_api_url.clone(),
        config.tracker_api_token.clone(),
    )
    .with_correlation_id(correlation_id);

    let gate = CoordinationGate::new(Arc::new(open_lease_store(config)?), config.gate);

    Ok(SyncEngine::new(
        Arc::new(github),
        Arc::new(tracker),
        gate,
        config.engine.clone(),
    ))
}

async fn run_sync(args: SyncArgs) -> Result<()> {
    let config = Config::from_env_for_cli()?;
    let engine = build_engine(&config)?;

    if args.dry_run {
        let planned = engine
            .plan(&args.work_item_id, args.initiator.as_ref())
            .await?;
        println!("{}", serde_json::to_string_pretty(&planned)?);
        return Ok(());
    }

    match engine
        .sync(&args.work_item_id, args.initiator.as_ref())
        .await?
    {
        SyncOutcome::Applied(report) => {
            println!("{}", serde_json::to_string_pretty(&report)?);
            if let Some(e) = report.transition_error {
                eprintln!("Warning: lifecycle state was not updated: {}", e);
            }
        }
        SyncOutcome::Superseded | SyncOutcome::Contended => {
            println!("Another run for {} is in progress, nothing done", args.work_item_id);
        }
        SyncOutcome::NoLink => {
            println!("No work item linked");
        }
    }
    Ok(())
}

/// Prints the linked id, if any. A missing link is not an error.
fn run_extract_link(args: ExtractLinkArgs) -> Result<Option<String>> {
    let text = match args.text {
        Some(text) => text,
        None => {
            let mut buffer = String::new();
            std::io::stdin()
                .read_to_string(&mut buffer)
                .context("Failed to read stdin")?;
            buffer
        }
    };

    match extract_work_item_link(&text) {
        Some(link) => {
            println!("{}", link.id);
            Ok(Some(link.id))
        }
        None => {
            eprintln!("No work item link found");
            Ok(None)
        }
    }
}

async fn run_lease(command: LeaseCommands) -> Result<()> {
    let config = Config::from_env_for_cli()?;
    let store = open_lease_store(&config)?;

    match command {
        LeaseCommands::Status { work_item_id } => match store.read(&work_item_id).await? {
            Some(lease) => println!(
                "{} held by {} since {} ({}s ago)",
                lease.key,
                lease.holder,
                lease.acquired_at.to_rfc3339(),
                lease.age(Utc::now()).as_secs()
            ),
            None => println!("{} is free", work_item_id),
        },
        LeaseCommands::Release { work_item_id } => {
            store.delete(&work_item_id).await?;
            info!("Released lease on {}", work_item_id);
            println!("Released {}", work_item_id);
        }
    }
    Ok(())
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Sync(args) => run_sync(args).await,
        Commands::ExtractLink(args) => run_extract_link(args).map(|_| ()),
        Commands::Lease { command } => run_lease(command).await,
    }
}
