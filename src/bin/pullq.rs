//! pullq CLI: operator interface to the tagged pull queue.

use clap::{Parser, Subcommand};
use pullq::config::{Config, QueueSettings};
use pullq::db::Db;
use pullq::engine::population::parse_worker_count;
use pullq::engine::{
    Dispatcher, LeaseWorker, Populator, QueueScheduler, RandomTagChooser, TagFanout,
    WorkerPopulation,
};
use pullq::store::TaggedQueueStore;
use pullq::telemetry::{TelemetryConfig, init_telemetry};
use secrecy::ExposeSecret;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "pullq", about = "Lease-based tagged work queue")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the dispatcher that executes populator and worker invocations
    Serve {
        /// Maximum invocations running at once (overrides settings)
        #[arg(long)]
        max_concurrent: Option<usize>,
    },
    /// Schedule one populator run per tag variant
    Populate {
        /// Tag prefix; tags are PREFIX_0 .. PREFIX_{N-1}
        #[arg(long, default_value = "")]
        prefix: String,
        /// Number of tag variants (defaults to settings)
        #[arg(long)]
        tags: Option<usize>,
    },
    /// Worker population operations
    Workers {
        #[command(subcommand)]
        action: WorkersAction,
    },
    /// Show queue sizes
    Stats,
}

#[derive(Subcommand)]
enum WorkersAction {
    /// Purge the worker queue and start a fresh population
    Start {
        /// Tag prefix workers filter on; omit to lease any tag
        #[arg(long)]
        prefix: Option<String>,
        /// Number of workers (1-100); unparsable values use the default
        #[arg(long)]
        count: Option<String>,
    },
    /// Purge the worker queue
    Purge,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let config = Config::from_env()?;
    let mut settings = config.queue_settings()?;

    let _guard = init_telemetry(TelemetryConfig {
        endpoint: config.otel_endpoint.clone(),
        service_name: "pullq".to_string(),
        default_level: config.log_level.clone(),
    })?;

    let db = Db::connect(config.database_url.expose_secret()).await?;
    db.migrate().await?;
    db.ensure_queues(&settings).await?;
    let store: Arc<dyn TaggedQueueStore> = Arc::new(db);
    let scheduler = Arc::new(QueueScheduler::new(Arc::clone(&store)));

    match cli.command {
        Command::Serve { max_concurrent } => {
            if let Some(n) = max_concurrent {
                settings.max_concurrent = n;
            }
            cmd_serve(store, scheduler, &settings).await
        }
        Command::Populate { prefix, tags } => {
            let fanout = TagFanout::new(scheduler, &settings);
            let tags = fanout
                .fan_out(&prefix, tags.unwrap_or(settings.num_tags))
                .await?;
            println!("Populator tasks started for tags: {}", tags.join(", "));
            Ok(())
        }
        Command::Workers { action } => {
            let population = WorkerPopulation::new(scheduler, &settings);
            match action {
                WorkersAction::Start { prefix, count } => {
                    let count = parse_worker_count(count.as_deref(), settings.default_workers);
                    let ids = population.start(prefix.as_deref(), count).await?;
                    println!("Started {} worker(s).", ids.len());
                }
                WorkersAction::Purge => {
                    population.purge().await?;
                    println!("Purged the {} queue.", settings.worker_queue);
                }
            }
            Ok(())
        }
        Command::Stats => cmd_stats(store.as_ref(), &settings).await,
    }
}

async fn cmd_serve(
    store: Arc<dyn TaggedQueueStore>,
    scheduler: Arc<QueueScheduler>,
    settings: &QueueSettings,
) -> anyhow::Result<()> {
    let populator = Populator::new(Arc::clone(&store), settings.jobs_queue.clone());
    let worker = LeaseWorker::new(
        Arc::clone(&store),
        scheduler,
        Arc::new(RandomTagChooser),
        settings,
    );
    let dispatcher = Dispatcher::new(store, populator, worker, settings);

    let ctrl = dispatcher.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        ctrl.shutdown();
    });

    dispatcher.run().await?;
    Ok(())
}

async fn cmd_stats(store: &dyn TaggedQueueStore, settings: &QueueSettings) -> anyhow::Result<()> {
    println!("{:<12}  {:>8}  {:>8}", "QUEUE", "TOTAL", "LEASED");
    println!("{}", "-".repeat(32));
    for queue in [
        &settings.jobs_queue,
        &settings.worker_queue,
        &settings.populator_queue,
    ] {
        let stats = store.stats(queue).await?;
        println!("{:<12}  {:>8}  {:>8}", queue, stats.total, stats.leased);
    }
    Ok(())
}
