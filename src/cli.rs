//! Command-line interface
//!
//! Human-facing commands for running the service pieces and managing
//! webhook subscriptions. All output is plain lines with status glyphs;
//! exit code 0 on success, non-zero on failure.

use crate::config::Config;
use crate::db::Database;
use crate::discovery::poller::MeetingPoller;
use crate::graph::GraphClient;
use crate::jobs::processors::{distribution, summary, transcript, ProcessorRegistry};
use crate::jobs::queue::JobQueue;
use crate::jobs::worker::JobWorker;
use crate::prefs::PreferenceManager;
use crate::summarizer::HttpSummarizer;
use crate::webhooks::backfill::Backfill;
use crate::webhooks::handler::NotificationHandler;
use crate::webhooks::relay::RelayListener;
use crate::webhooks::subscriptions::SubscriptionManager;
use clap::{Parser, Subcommand};
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "scribe", about = "Meeting transcript summarizer service", version)]
pub struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Webhook subscription and listener management
    Webhooks {
        #[command(subcommand)]
        command: WebhooksCommand,
    },
    /// Job worker
    Worker {
        #[command(subcommand)]
        command: WorkerCommand,
    },
    /// Calendar discovery poller
    Poller {
        #[command(subcommand)]
        command: PollerCommand,
    },
    /// Catch-up ingestion over recent call records
    Backfill {
        /// How far back to look
        #[arg(long, default_value_t = 24)]
        lookback_hours: i64,
    },
    /// Job queue inspection
    Queue {
        #[command(subcommand)]
        command: QueueCommand,
    },
}

#[derive(Subcommand)]
enum WebhooksCommand {
    /// Run the relay listener and notification handler
    Listen {
        /// Skip the startup backfill
        #[arg(long)]
        no_backfill: bool,
    },
    /// Create a call-records subscription
    Subscribe {
        /// Requested lifetime in days (capped at the provider maximum)
        #[arg(long, default_value_t = 3)]
        expiration_days: i64,
    },
    /// Create a transcripts subscription
    SubscribeTranscripts {
        /// Requested lifetime in minutes
        #[arg(long, default_value_t = 60)]
        expiration_minutes: i64,
    },
    /// Renew subscriptions expiring soon
    RenewAll {
        #[arg(long, default_value_t = 24)]
        min_hours_remaining: i64,
    },
    /// List all subscriptions
    List,
    /// Delete a subscription by id
    Delete { id: String },
    /// Verify the relay endpoint answers a validation handshake
    Test,
}

#[derive(Subcommand)]
enum WorkerCommand {
    /// Run the worker pool until interrupted
    Run,
}

#[derive(Subcommand)]
enum PollerCommand {
    /// Run discovery
    Run {
        /// Run one cycle and exit
        #[arg(long)]
        once: bool,
        /// Discover without persisting or queueing
        #[arg(long)]
        dry_run: bool,
    },
}

#[derive(Subcommand)]
enum QueueCommand {
    /// Print queue statistics
    Stats,
    /// Delete terminal jobs older than the given age
    Cleanup {
        #[arg(long, default_value_t = 90)]
        days: i64,
    },
}

struct Services {
    config: Arc<Config>,
    db: Database,
    graph: GraphClient,
    queue: JobQueue,
}

fn build_services() -> Result<Services, Box<dyn std::error::Error>> {
    let config = Arc::new(Config::from_env()?);

    if let Some(parent) = std::path::Path::new(&config.db_path).parent() {
        std::fs::create_dir_all(parent)?;
    }
    tracing::info!(path = config.db_path, "Opening database");
    let db = Database::open(&config.db_path)?;

    let graph = GraphClient::new(config.graph.clone())?;
    let queue = JobQueue::new(db.clone());

    Ok(Services {
        config,
        db,
        graph,
        queue,
    })
}

fn build_registry(services: &Services) -> ProcessorRegistry {
    let mut registry = ProcessorRegistry::new();
    registry.register(
        crate::db::JobType::FetchTranscript,
        Arc::new(transcript::TranscriptProcessor::new(
            services.db.clone(),
            services.queue.clone(),
            services.graph.clone(),
        )),
    );
    match HttpSummarizer::new(&services.config.summarizer) {
        Ok(summarizer) => registry.register(
            crate::db::JobType::GenerateSummary,
            Arc::new(summary::SummaryProcessor::new(
                services.db.clone(),
                Arc::new(summarizer),
            )),
        ),
        Err(e) => tracing::warn!(error = %e, "Summarizer unavailable, summary jobs will fail"),
    }
    registry.register(
        crate::db::JobType::Distribute,
        Arc::new(distribution::DistributionProcessor::new(
            services.db.clone(),
            services.graph.clone(),
            PreferenceManager::new(services.db.clone()),
            services.config.clone(),
        )),
    );
    registry
}

/// Parse arguments and run the selected command.
pub async fn run() -> i32 {
    let cli = Cli::parse();
    match dispatch(cli).await {
        Ok(()) => 0,
        Err(e) => {
            eprintln!("✗ {e}");
            1
        }
    }
}

async fn dispatch(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    match cli.command {
        Command::Webhooks { command } => webhooks_command(command).await,
        Command::Worker {
            command: WorkerCommand::Run,
        } => worker_run().await,
        Command::Poller {
            command: PollerCommand::Run { once, dry_run },
        } => poller_run(once, dry_run).await,
        Command::Backfill { lookback_hours } => backfill_run(lookback_hours).await,
        Command::Queue {
            command: QueueCommand::Stats,
        } => queue_stats(),
        Command::Queue {
            command: QueueCommand::Cleanup { days },
        } => {
            let services = build_services()?;
            let deleted = services.queue.cleanup_old_jobs(days)?;
            println!("✓ Deleted {deleted} old job(s)");
            Ok(())
        }
    }
}

async fn webhooks_command(command: WebhooksCommand) -> Result<(), Box<dyn std::error::Error>> {
    let services = build_services()?;
    let manager = SubscriptionManager::new(
        services.db.clone(),
        services.graph.clone(),
        services.config.clone(),
    );

    match command {
        WebhooksCommand::Listen { no_backfill } => {
            let handler = NotificationHandler::new(
                services.db.clone(),
                services.queue.clone(),
                services.graph.clone(),
            );

            if !no_backfill {
                let lookback = services.config.settings().lookback_hours;
                let backfill = Backfill::new(
                    services.db.clone(),
                    services.graph.clone(),
                    handler.clone(),
                );
                match backfill
                    .run_with_source(lookback, crate::db::IngestSource::SafetyNet)
                    .await
                {
                    Ok(stats) => println!(
                        "✓ Startup backfill: {} records, {} meetings, {} jobs",
                        stats.call_records_found, stats.meetings_created, stats.jobs_created
                    ),
                    Err(e) => eprintln!("✗ Startup backfill failed: {e}"),
                }
            }

            let manager = Arc::new(manager);
            let manager_task = {
                let manager = manager.clone();
                tokio::spawn(async move { manager.run().await })
            };

            let listener = Arc::new(RelayListener::new(
                services.config.relay.clone(),
                handler,
            ));
            let listener_task = {
                let listener = listener.clone();
                tokio::spawn(async move { listener.run().await })
            };

            println!("✓ Listening for notifications (ctrl-c to stop)");
            tokio::signal::ctrl_c().await?;
            println!("Stopping...");
            listener.stop();
            manager.stop();
            manager_task.abort();
            listener_task.abort();
            Ok(())
        }
        WebhooksCommand::Subscribe { expiration_days } => {
            match manager
                .create_subscription_with_minutes(expiration_days * 24 * 60, "manual")
                .await
            {
                Some(id) => {
                    println!("✓ Subscription created: {id}");
                    Ok(())
                }
                None => Err("Subscription creation failed".into()),
            }
        }
        WebhooksCommand::SubscribeTranscripts { expiration_minutes } => {
            match manager
                .create_transcripts_subscription(expiration_minutes, "manual")
                .await
            {
                Some(id) => {
                    println!("✓ Transcripts subscription created: {id}");
                    Ok(())
                }
                None => Err("Transcripts subscription creation failed".into()),
            }
        }
        WebhooksCommand::RenewAll { min_hours_remaining } => {
            let renewed = manager.renew_all(min_hours_remaining).await?;
            println!("✓ Renewed {renewed} subscription(s)");
            Ok(())
        }
        WebhooksCommand::List => {
            let listing = manager.list_all_subscriptions().await?;
            let subs = listing
                .get("value")
                .and_then(|v| v.as_array())
                .cloned()
                .unwrap_or_default();
            if subs.is_empty() {
                println!("No subscriptions");
                return Ok(());
            }
            for sub in subs {
                println!(
                    "{}  {}  expires {}",
                    sub.get("id").and_then(|v| v.as_str()).unwrap_or("?"),
                    sub.get("resource").and_then(|v| v.as_str()).unwrap_or("?"),
                    sub.get("expirationDateTime")
                        .and_then(|v| v.as_str())
                        .unwrap_or("?"),
                );
            }
            Ok(())
        }
        WebhooksCommand::Delete { id } => {
            if manager.delete_subscription(&id).await {
                println!("✓ Deleted {id}");
                Ok(())
            } else {
                Err(format!("Failed to delete {id}").into())
            }
        }
        WebhooksCommand::Test => {
            let token = format!("probe-{}", uuid::Uuid::new_v4().simple());
            let url = format!(
                "{}?validationToken={token}",
                services.config.relay.webhook_url()
            );
            println!("Probing {url}");
            let response = reqwest::Client::new()
                .post(&url)
                .timeout(std::time::Duration::from_secs(10))
                .send()
                .await?;
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            if status.is_success() && body == token {
                println!("✓ Listener echoed the validation token");
                Ok(())
            } else {
                Err(format!("Unexpected response (status {status}, body {body:?})").into())
            }
        }
    }
}

async fn worker_run() -> Result<(), Box<dyn std::error::Error>> {
    let services = build_services()?;
    let registry = Arc::new(build_registry(&services));
    let settings = services.config.settings();
    let worker = Arc::new(JobWorker::new(services.queue.clone(), registry, &settings));

    let runner = worker.clone();
    let task = tokio::spawn(async move { runner.run().await });

    println!("✓ Worker running (ctrl-c to stop)");
    tokio::signal::ctrl_c().await?;
    println!("Stopping...");
    worker.stop();
    task.await?;
    Ok(())
}

async fn poller_run(once: bool, dry_run: bool) -> Result<(), Box<dyn std::error::Error>> {
    let services = build_services()?;
    let poller = Arc::new(MeetingPoller::new(
        services.db.clone(),
        services.graph.clone(),
        services.queue.clone(),
        services.config.clone(),
    ));

    if once {
        let stats = poller.run_discovery(dry_run).await;
        println!(
            "✓ Discovery: {} discovered, {} queued, {} skipped, {} errors",
            stats.discovered, stats.queued, stats.skipped, stats.errors
        );
        if stats.errors > 0 {
            return Err("discovery finished with errors".into());
        }
        return Ok(());
    }

    let runner = poller.clone();
    let task = tokio::spawn(async move { runner.run().await });
    println!("✓ Poller running (ctrl-c to stop)");
    tokio::signal::ctrl_c().await?;
    poller.stop();
    task.abort();
    Ok(())
}

async fn backfill_run(lookback_hours: i64) -> Result<(), Box<dyn std::error::Error>> {
    let services = build_services()?;
    let handler = NotificationHandler::new(
        services.db.clone(),
        services.queue.clone(),
        services.graph.clone(),
    );
    let backfill = Backfill::new(services.db.clone(), services.graph.clone(), handler);

    let stats = backfill.run(lookback_hours).await?;
    println!(
        "✓ Backfill: {} records found, {} meetings created, {} skipped (no opt-in), {} jobs, {} errors",
        stats.call_records_found,
        stats.meetings_created,
        stats.skipped_no_optin,
        stats.jobs_created,
        stats.errors
    );
    Ok(())
}

fn queue_stats() -> Result<(), Box<dyn std::error::Error>> {
    let services = build_services()?;
    let stats = services.queue.stats()?;

    println!("Total jobs: {}", stats.total_jobs);
    println!("By status:");
    let mut statuses: Vec<_> = stats.by_status.iter().collect();
    statuses.sort();
    for (status, count) in statuses {
        println!("  {status}: {count}");
    }
    println!("By type:");
    let mut types: Vec<_> = stats.by_type.iter().collect();
    types.sort();
    for (job_type, count) in types {
        println!("  {job_type}: {count}");
    }
    if let Some(minutes) = stats.oldest_pending_minutes {
        println!("Oldest pending: {minutes} min");
    }
    if let Some(seconds) = stats.avg_processing_seconds {
        println!("Avg processing: {seconds:.1}s");
    }
    Ok(())
}
