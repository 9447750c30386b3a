use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use conveyor::ai::HttpAiClient;
use conveyor::codegen::CodeGenerator;
use conveyor::config::Config;
use conveyor::deploy::DeploymentScheduler;
use conveyor::host::GitHubClient;
use conveyor::notify::Notifier;
use conveyor::pipeline::Orchestrator;
use conveyor::planner::Planner;
use conveyor::review::ReviewOrchestrator;
use conveyor::store::{DbHandle, NewEnhancement, PipelineDb};
use conveyor::workspace::WorkspaceManager;

#[derive(Parser)]
#[command(name = "conveyor", about = "Autonomous enhancement delivery pipeline", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the enhancement orchestrator poll loop
    Run,
    /// Process deployments due now, then exit
    Deploy,
    /// Queue a new enhancement request
    Enqueue {
        /// Short title for the enhancement
        #[arg(short, long)]
        title: String,
        /// What should be built, in natural language
        #[arg(short, long, default_value = "")]
        description: String,
        /// Queue priority, higher runs first (1-10)
        #[arg(short, long, default_value_t = 5)]
        priority: i64,
        /// Who asked for it
        #[arg(long, default_value = "cli")]
        requested_by: String,
    },
    /// Show the enhancement queue and deployment schedule
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    let config = Config::from_env().context("Configuration error")?;
    let db = DbHandle::new(
        PipelineDb::new(Path::new(&config.database_path)).context("Failed to open database")?,
    );

    match cli.command {
        Command::Run => run_orchestrator(db, config).await,
        Command::Deploy => run_deploy(db, config).await,
        Command::Enqueue {
            title,
            description,
            priority,
            requested_by,
        } => enqueue(db, title, description, priority, requested_by).await,
        Command::Status => status(db).await,
    }
}

async fn run_orchestrator(db: DbHandle, config: Config) -> Result<()> {
    let ai: Arc<dyn conveyor::ai::AiClient> = Arc::new(HttpAiClient::new(
        &config.ai_service_url,
        config.ai_service_key.as_deref(),
    ));
    let host: Arc<dyn conveyor::host::HostClient> =
        Arc::new(GitHubClient::new(&config.github_repo, &config.github_token));
    let workspace = WorkspaceManager::new(
        Path::new(&config.workspace_path),
        &config.base_branch,
        Some(&config.github_token),
    )
    .context("Workspace is not usable")?;

    let review = ReviewOrchestrator::new(
        ai.clone(),
        host.clone(),
        &config.copilot_reviewer,
        config.copilot_poll_attempts,
        config.copilot_poll_interval,
    );
    let notifier = Arc::new(Notifier::new(
        config.notify_webhook_url.as_deref(),
        config.notify_email_url.as_deref(),
        &config.notify_email_from,
    ));
    let orchestrator = Orchestrator::new(
        db,
        config,
        Planner::new(ai.clone()),
        CodeGenerator::new(ai),
        review,
        host,
        Arc::new(tokio::sync::Mutex::new(workspace)),
        notifier,
    );
    orchestrator.run_loop().await
}

async fn run_deploy(db: DbHandle, config: Config) -> Result<()> {
    let host: Arc<dyn conveyor::host::HostClient> =
        Arc::new(GitHubClient::new(&config.github_repo, &config.github_token));
    let notifier = Arc::new(Notifier::new(
        config.notify_webhook_url.as_deref(),
        config.notify_email_url.as_deref(),
        &config.notify_email_from,
    ));
    let scheduler = DeploymentScheduler::new(db, host, notifier);
    let summary = scheduler.run_once(chrono::Utc::now()).await?;
    println!(
        "Deployments: {} processed, {} succeeded, {} failed",
        summary.processed, summary.succeeded, summary.failed
    );
    if summary.failed > 0 {
        std::process::exit(1);
    }
    Ok(())
}

async fn enqueue(
    db: DbHandle,
    title: String,
    description: String,
    priority: i64,
    requested_by: String,
) -> Result<()> {
    let request = NewEnhancement {
        title,
        description,
        priority,
        requested_by,
    };
    let enhancement = db.call(move |db| db.create_enhancement(&request)).await?;
    info!(id = enhancement.id, "enhancement queued");
    println!(
        "Queued enhancement #{}: {} (priority {})",
        enhancement.id, enhancement.title, enhancement.priority
    );
    Ok(())
}

async fn status(db: DbHandle) -> Result<()> {
    let enhancements = db.call(|db| db.list_enhancements()).await?;
    let active = enhancements.iter().filter(|e| e.status.is_active()).count();
    println!("Enhancements ({} total, {} active):", enhancements.len(), active);
    for e in &enhancements {
        println!(
            "  #{:<4} [{:^18}] p{} {}{}",
            e.id,
            e.status.as_str(),
            e.priority,
            e.title,
            e.pr_url
                .as_deref()
                .map(|u| format!(" -> {}", u))
                .unwrap_or_default()
        );
    }

    let queue = db.call(|db| db.deployment_queue()).await?;
    println!("\nDeployment queue ({}):", queue.len());
    for item in &queue {
        println!(
            "  deployment {:<4} enhancement #{:<4} [{:^11}] scheduled {}",
            item.id,
            item.enhancement_id,
            item.status.as_str(),
            item.scheduled_date
        );
    }
    Ok(())
}
