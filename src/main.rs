use anyhow::Result;
use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(name = "mailsync", version, about = "Multi-tenant mailbox sync service")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the sync service: workers, scheduler, and HTTP API
    Serve,
    /// Apply store migrations and exit
    Migrate,
    /// Show worker registry and recent sync jobs
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    commands::dispatch(cli).await
}

mod commands {
    use std::sync::Arc;

    use anyhow::{Context, Result};
    use tracing::{error, info};

    use mailsync::api::{self, AppState};
    use mailsync::config::Config;
    use mailsync::db::models::fmt_ts;
    use mailsync::db::Database;
    use mailsync::jobs::JobQueue;
    use mailsync::providers::{GmailClient, OutlookClient, ProviderRegistry};
    use mailsync::scheduler::Scheduler;
    use mailsync::sync::SyncEngine;
    use mailsync::token::TokenManager;
    use mailsync::watch::WatchManager;
    use mailsync::worker::{Worker, WorkerConfig};

    use super::{Cli, Commands};

    pub async fn dispatch(cli: Cli) -> Result<()> {
        match cli.command {
            Commands::Serve => handle_serve().await,
            Commands::Migrate => handle_migrate(),
            Commands::Status => handle_status(),
        }
    }

    async fn handle_serve() -> Result<()> {
        let config = Config::from_env().context("load configuration")?;
        config.validate_for_serve()?;

        let db = Database::open(&config.database_path).with_context(|| {
            format!("open store at {}", config.database_path.display())
        })?;

        let mut registry = ProviderRegistry::new();
        registry.register(Arc::new(GmailClient::new(
            config
                .google_client_id
                .clone()
                .unwrap_or_default(),
            config
                .google_client_secret
                .clone()
                .unwrap_or_default(),
        )));
        registry.register(Arc::new(OutlookClient::new()));
        let providers = Arc::new(registry);

        let queue = JobQueue::new(db.clone());
        let tokens = TokenManager::new(db.clone(), providers.clone());
        let engine = SyncEngine::new(
            db.clone(),
            providers.clone(),
            tokens.clone(),
            queue.clone(),
        );
        let watches = WatchManager::new(
            db.clone(),
            providers.clone(),
            tokens.clone(),
            queue.clone(),
            config.pubsub_topic.clone().unwrap_or_default(),
        );

        let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

        let scheduler = Scheduler::new(db.clone(), queue.clone(), watches.clone());
        let scheduler_handle = tokio::spawn(scheduler.run(shutdown_rx.clone()));

        let mut worker_handles = Vec::with_capacity(config.worker_count);
        for _ in 0..config.worker_count {
            let worker = Worker::new(
                db.clone(),
                queue.clone(),
                engine.clone(),
                WorkerConfig::default(),
            );
            info!(worker = worker.id(), "starting worker");
            worker_handles.push(tokio::spawn(worker.run(shutdown_rx.clone())));
        }

        let state = AppState {
            db,
            queue,
            engine,
            watches,
            providers,
        };
        let api_handle = tokio::spawn(api::serve(state, config.listen_port, shutdown_rx));

        tokio::signal::ctrl_c()
            .await
            .context("listen for shutdown signal")?;
        info!("shutdown signal received, draining");
        let _ = shutdown_tx.send(true);

        for handle in worker_handles {
            match handle.await {
                Ok(Ok(())) => {}
                Ok(Err(worker_error)) => error!(%worker_error, "worker exited with error"),
                Err(join_error) => error!(%join_error, "worker task panicked"),
            }
        }
        let _ = scheduler_handle.await;
        let _ = api_handle.await;

        info!("shutdown complete");
        Ok(())
    }

    fn handle_migrate() -> Result<()> {
        let config = Config::from_env().context("load configuration")?;
        let db = Database::open(&config.database_path).with_context(|| {
            format!("open store at {}", config.database_path.display())
        })?;
        println!("migrations applied: {}", db.path().display());
        Ok(())
    }

    fn handle_status() -> Result<()> {
        let config = Config::from_env().context("load configuration")?;
        let db = Database::open(&config.database_path).with_context(|| {
            format!("open store at {}", config.database_path.display())
        })?;

        let workers = db.list_workers()?;
        if workers.is_empty() {
            println!("No workers registered.");
        } else {
            println!("Workers");
            println!("=======");
            for worker in workers {
                println!(
                    "{}  {}  last_heartbeat={}  jobs={}",
                    worker.worker_id,
                    worker.status,
                    fmt_ts(worker.last_heartbeat),
                    worker.jobs_processed_count
                );
            }
        }

        let jobs = db.list_all_recent_jobs(20)?;
        if jobs.is_empty() {
            println!("No sync jobs recorded.");
        } else {
            println!();
            println!("Recent sync jobs");
            println!("================");
            for job in jobs {
                println!(
                    "{}  {}  {}  progress={}%  messages={}  {}",
                    job.id,
                    job.sync_type,
                    job.status,
                    job.progress,
                    job.messages_synced,
                    job.status_message.as_deref().unwrap_or("-")
                );
            }
        }

        Ok(())
    }
}
