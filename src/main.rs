use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use log::{error, info};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use mailfeed::config::ServiceConfig;
use mailfeed::mail::ImapMailClient;
use mailfeed::retention::RetentionManager;
use mailfeed::storage::{PgRepository, Repository};
use mailfeed::{AccountWorker, Supervisor};

#[derive(Parser)]
#[command(name = "mailfeed")]
#[command(about = "Turns mailing-list email into syndication feeds")]
#[command(version = "0.1.0")]
struct Args {
    /// Configuration file (defaults to ./mailfeed.toml when present)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Runs the background service until Ctrl+C
    Run,
    /// Processes a single account once and exits
    Process {
        #[arg(long)]
        account: Uuid,
    },
    /// Prints the effective configuration without connecting anywhere
    CheckConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env if present
    dotenv::dotenv().ok();

    let args = Args::parse();
    env_logger::init();

    let config = ServiceConfig::load(args.config.as_deref())?;

    match args.command {
        Command::CheckConfig => check_config(&config),
        Command::Run => run_service(config).await,
        Command::Process { account } => process_once(config, account).await,
    }
}

fn check_config(config: &ServiceConfig) -> Result<()> {
    println!("✅ Configuration valid");
    println!("{}", serde_json::to_string_pretty(config)?);
    match &config.database {
        Some(db) => println!("🗄️  Database: {}@{}:{}/{}", db.username, db.host, db.port, db.database),
        None => println!("⚠️  No database section configured"),
    }
    Ok(())
}

async fn connect_repository(config: &ServiceConfig) -> Result<Arc<PgRepository>> {
    let Some(db) = &config.database else {
        bail!("A [database] section is required (or MAILFEED__DATABASE__* variables)");
    };
    let repo = PgRepository::connect(db)
        .await
        .context("Unable to open the repository")?;
    Ok(Arc::new(repo))
}

async fn run_service(config: ServiceConfig) -> Result<()> {
    info!("🚀 Starting mailfeed daemon");
    let repo = connect_repository(&config).await?;
    let supervisor = Supervisor::new(config, repo.clone(), Arc::new(ImapMailClient::new()));

    let started = supervisor.start(false).await;
    if !started.success {
        error!("❌ {}", started.message);
        repo.close().await;
        bail!("Service did not start: {}", started.message);
    }
    info!("⏸️  Press Ctrl+C to stop the daemon");

    let mut heartbeat = tokio::time::interval(std::time::Duration::from_secs(3600));
    heartbeat.tick().await;
    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                signal.context("Unable to listen for Ctrl+C")?;
                break;
            }
            _ = heartbeat.tick() => {
                let status = supervisor.status();
                info!(
                    "💓 {} - {} account(s), {} active, {} email(s) processed, {} error(s)",
                    status.state,
                    status.accounts_count,
                    status.active_processing_count,
                    status.total_emails_processed,
                    status.total_errors
                );
            }
        }
    }

    let stopped = supervisor.stop().await;
    info!("{}", stopped.message);
    println!("{}", serde_json::to_string_pretty(&supervisor.status())?);
    repo.close().await;
    Ok(())
}

async fn process_once(config: ServiceConfig, account_id: Uuid) -> Result<()> {
    let repo = connect_repository(&config).await?;
    let account = repo
        .get_account(account_id)
        .await?
        .with_context(|| format!("Unknown account {}", account_id))?;

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            on_signal.cancel();
        }
    });

    let mail = ImapMailClient::new();
    let retention = RetentionManager::new();
    let report = AccountWorker::new(&config, repo.as_ref(), &mail, &retention)
        .run(&account, &cancel)
        .await;
    repo.close().await;

    for e in &report.errors {
        error!("❌ {}", e);
    }
    match report.failure {
        None => {
            info!(
                "✅ Processed {} email(s) for '{}': {} new item(s), {} action(s)",
                report.messages_seen, account.name, report.items_created, report.actions_applied
            );
            Ok(())
        }
        Some(e) => {
            error!("❌ Processing failed for '{}': {}", account.name, e);
            Err(e.into())
        }
    }
}
