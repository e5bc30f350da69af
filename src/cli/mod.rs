//! Command-line interface for presswork.
//!
//! Provides the long-running worker, operator commands that write to the
//! document store, and broker tools for requesting publication and
//! watching lifecycle events.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use uuid::Uuid;

use crate::adapters;
use crate::broker::{Broker, SqliteBroker};
use crate::config::ResolvedConfig;
use crate::core::{
    ChangeFeedProcessor, CursorStore, FeedStream, FeedbackChanges, ItemChanges,
    KeyedLockRegistry, PipelineOrchestrator,
};
use crate::domain::{EventData, PublishRequest};
use crate::events::{
    BroadcastSink, BrokerPublisher, CommandConsumer, EventConsumer, EventPublisher,
};
use crate::store::{
    CheckpointRepository, DocumentStore, EditionRepository, ItemRepository, RunRepository,
    SqliteStore, FEEDBACK, ITEMS,
};

/// presswork - Event-driven content pipeline orchestrator
#[derive(Parser, Debug)]
#[command(name = "presswork")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run a pipeline worker until interrupted
    Worker,

    /// Submit a link to an edition
    Submit {
        /// URL to process
        url: String,

        /// Edition to draft into (created if missing)
        #[arg(short, long)]
        edition: String,
    },

    /// Leave editor feedback on an edition
    Feedback {
        /// Edition ID
        edition: String,

        /// Feedback text
        text: String,
    },

    /// Request publication of an edition
    Publish {
        /// Edition ID
        edition: String,

        /// Deduplication key (generated if not specified)
        #[arg(long)]
        request_id: Option<String>,
    },

    /// Resubmit a failed item
    Resubmit {
        /// Item ID
        item_id: String,
    },

    /// Delete an item and remove it from its edition
    Delete {
        /// Item ID
        item_id: String,
    },

    /// Detach an item from its edition
    Detach {
        /// Item ID
        item_id: String,
    },

    /// Show an item and its run history
    Status {
        /// Item ID (or edition ID with --edition)
        id: String,

        /// Treat the ID as an edition
        #[arg(short, long)]
        edition: bool,
    },

    /// Print lifecycle events as they arrive
    Tail {
        /// Subscription name for this watcher (default: broker.event_subscription)
        #[arg(long)]
        subscription: Option<String>,
    },

    /// Show resolved configuration (debug)
    Config,
}

impl Cli {
    /// Execute the CLI command
    pub async fn execute(self) -> Result<()> {
        let cfg = ResolvedConfig::load()?;

        match self.command {
            Commands::Worker => run_worker(&cfg).await,
            Commands::Submit { url, edition } => {
                let item = operator(&cfg).await?.submit(&url, &edition).await?;
                println!("{}", item.id);
                Ok(())
            }
            Commands::Feedback { edition, text } => {
                let feedback = operator(&cfg).await?.add_feedback(&edition, &text).await?;
                println!("{}", feedback.id);
                Ok(())
            }
            Commands::Publish {
                edition,
                request_id,
            } => request_publish(&cfg, edition, request_id).await,
            Commands::Resubmit { item_id } => {
                let item = operator(&cfg).await?.resubmit(&item_id).await?;
                println!("Item {} is {}", item.id, item.status);
                Ok(())
            }
            Commands::Delete { item_id } => {
                operator(&cfg).await?.delete_item(&item_id).await?;
                println!("Deleted {}", item_id);
                Ok(())
            }
            Commands::Detach { item_id } => {
                let item = operator(&cfg).await?.detach(&item_id).await?;
                println!("Detached {}", item.id);
                Ok(())
            }
            Commands::Status { id, edition } => {
                if edition {
                    show_edition(&cfg, &id).await
                } else {
                    show_item(&cfg, &id).await
                }
            }
            Commands::Tail { subscription } => tail_events(&cfg, subscription).await,
            Commands::Config => show_config(&cfg),
        }
    }
}

async fn open_store(cfg: &ResolvedConfig) -> Result<Arc<dyn DocumentStore>> {
    let store = SqliteStore::open(&cfg.store_path)
        .with_context(|| format!("Failed to open store at {}", cfg.store_path.display()))?;
    store
        .health_check()
        .await
        .context("Document store failed its health check")?;
    Ok(Arc::new(store))
}

/// Open the configured broker, if any, registering the command subscription
async fn open_broker(cfg: &ResolvedConfig) -> Result<Option<Arc<SqliteBroker>>> {
    let Some(ref path) = cfg.broker.path else {
        return Ok(None);
    };

    let broker = SqliteBroker::open(
        path,
        cfg.broker.max_delivery_count,
        Duration::from_secs(cfg.broker.lock_duration_seconds),
    )
    .with_context(|| format!("Failed to open broker at {}", path.display()))?;

    // Messages sent before a subscription exists are not delivered to it
    broker
        .ensure_subscription(&cfg.broker.command_topic, &cfg.broker.command_subscription)
        .await?;

    Ok(Some(Arc::new(broker)))
}

fn publisher_for(cfg: &ResolvedConfig, broker: Option<Arc<SqliteBroker>>) -> BrokerPublisher {
    match broker {
        Some(broker) => BrokerPublisher::new(broker, cfg.broker.event_topic.clone()),
        None => BrokerPublisher::disabled(cfg.broker.event_topic.clone()),
    }
}

async fn build_orchestrator(
    cfg: &ResolvedConfig,
    store: Arc<dyn DocumentStore>,
    broker: Option<Arc<SqliteBroker>>,
) -> Result<Arc<PipelineOrchestrator>> {
    let stages = adapters::default_registry(&cfg.stages, &cfg.output_dir)?;
    let events: Arc<dyn EventPublisher> = Arc::new(publisher_for(cfg, broker));

    Ok(Arc::new(PipelineOrchestrator::new(
        store,
        Arc::new(KeyedLockRegistry::new()),
        stages,
        events,
        cfg.orchestrator_config(),
    )))
}

/// Orchestrator for one-shot operator commands
async fn operator(cfg: &ResolvedConfig) -> Result<Arc<PipelineOrchestrator>> {
    let store = open_store(cfg).await?;
    let broker = open_broker(cfg).await?;
    build_orchestrator(cfg, store, broker).await
}

/// Run the change feed and command consumer until Ctrl-C
async fn run_worker(cfg: &ResolvedConfig) -> Result<()> {
    let store = open_store(cfg).await?;
    let broker = open_broker(cfg).await?;
    let orchestrator = build_orchestrator(cfg, Arc::clone(&store), broker.clone()).await?;

    if let Some(ref broker) = broker {
        let ttl = Duration::from_secs(cfg.broker.message_ttl_hours * 3600);
        match broker.purge_older_than(ttl).await {
            Ok(0) => {}
            Ok(removed) => info!(removed, "Purged expired broker deliveries"),
            Err(e) => warn!(error = %e, "Broker purge failed"),
        }
    }

    let cursors = if cfg.feed.checkpoint {
        CursorStore::durable(CheckpointRepository::new(Arc::clone(&store)))
    } else {
        CursorStore::in_memory()
    };
    let feed = ChangeFeedProcessor::new(
        Arc::clone(&store),
        vec![
            FeedStream::new("items", ITEMS, Arc::new(ItemChanges(Arc::clone(&orchestrator)))),
            FeedStream::new(
                "feedback",
                FEEDBACK,
                Arc::new(FeedbackChanges(Arc::clone(&orchestrator))),
            ),
        ],
        cursors,
        cfg.feed_config(),
    );

    let commands = broker.map(|broker| {
        CommandConsumer::new(
            broker,
            cfg.consumer_config(&cfg.broker.command_topic, &cfg.broker.command_subscription),
            orchestrator.clone(),
            cfg.consumer.dedupe_capacity,
        )
    });
    if commands.is_none() {
        warn!("No broker configured, publish requests will not be received");
    }

    feed.start().await;
    if let Some(ref commands) = commands {
        commands.start().await;
    }
    info!(store = %cfg.store_path.display(), "Worker running, press Ctrl-C to stop");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Shutting down");

    // Interrupted stages are recorded as failed before the loops are stopped
    orchestrator.cancel_in_flight();
    if let Some(ref commands) = commands {
        commands.stop().await;
    }
    feed.stop().await;

    Ok(())
}

/// Send a publish-request command
async fn request_publish(
    cfg: &ResolvedConfig,
    edition_id: String,
    request_id: Option<String>,
) -> Result<()> {
    let broker = open_broker(cfg)
        .await?
        .context("Publishing needs a broker (set broker.path or PRESSWORK_BROKER)")?;

    let request = PublishRequest {
        edition_id,
        request_id: Some(request_id.unwrap_or_else(|| Uuid::new_v4().to_string())),
    };
    let request_id = request.request_id.clone().unwrap_or_default();

    let publisher = BrokerPublisher::new(broker, cfg.broker.command_topic.clone());
    publisher
        .try_send(&request.into_envelope())
        .await
        .context("Failed to send publish request")?;

    println!("Publish requested (request id {})", request_id);
    Ok(())
}

/// Print lifecycle events until Ctrl-C
async fn tail_events(cfg: &ResolvedConfig, subscription: Option<String>) -> Result<()> {
    let subscription = subscription.unwrap_or_else(|| cfg.broker.event_subscription.clone());
    let path = cfg
        .broker
        .path
        .as_ref()
        .context("Tailing needs a broker (set broker.path or PRESSWORK_BROKER)")?;
    let broker: Arc<dyn Broker> = Arc::new(
        SqliteBroker::open(
            path,
            cfg.broker.max_delivery_count,
            Duration::from_secs(cfg.broker.lock_duration_seconds),
        )
        .with_context(|| format!("Failed to open broker at {}", path.display()))?,
    );

    let sink = Arc::new(BroadcastSink::new(256));
    let mut events = sink.subscribe();
    let consumer = EventConsumer::new(
        broker,
        cfg.consumer_config(&cfg.broker.event_topic, &subscription),
        sink,
    );
    consumer.start().await;

    loop {
        tokio::select! {
            received = events.recv() => match received {
                Ok(envelope) => {
                    let data = match envelope.data {
                        EventData::Object(map) => serde_json::Value::Object(map).to_string(),
                        EventData::Text(text) => text,
                    };
                    println!("{:<14} {}", envelope.event, data);
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    eprintln!("[skipped {} events]", n);
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    consumer.stop().await;
    Ok(())
}

async fn show_item(cfg: &ResolvedConfig, item_id: &str) -> Result<()> {
    let store = open_store(cfg).await?;
    let item = ItemRepository::new(Arc::clone(&store))
        .get(item_id)
        .await?
        .with_context(|| format!("Item not found: {}", item_id))?;
    let runs = RunRepository::new(store).by_trigger(item_id).await?;

    println!("Item ID:  {}", item.id);
    println!("URL:      {}", item.url);
    println!("Status:   {}", item.status);
    println!("Edition:  {}", item.aggregate_id.as_deref().unwrap_or("(none)"));
    if let Some(ref title) = item.title {
        println!("Title:    {}", title);
    }
    if item.is_deleted() {
        println!("Deleted:  yes");
    }

    if runs.is_empty() {
        println!("\nNo runs recorded");
        return Ok(());
    }

    println!("\n{:<38} {:<10} {:<10} {:<9} {}", "RUN ID", "STAGE", "STATUS", "ATTEMPTS", "ERROR");
    println!("{}", "-".repeat(90));
    for run in runs {
        println!(
            "{:<38} {:<10} {:<10} {:<9} {}",
            run.id,
            run.stage.as_str(),
            run.status.as_str(),
            run.attempts,
            run.error.as_deref().unwrap_or("")
        );
    }

    Ok(())
}

async fn show_edition(cfg: &ResolvedConfig, edition_id: &str) -> Result<()> {
    let store = open_store(cfg).await?;
    let edition = EditionRepository::new(Arc::clone(&store))
        .get(edition_id)
        .await?
        .with_context(|| format!("Edition not found: {}", edition_id))?;
    let items = ItemRepository::new(store).by_edition(edition_id).await?;

    println!("Edition ID: {}", edition.id);
    println!("Status:     {:?}", edition.status);
    println!("Members:    {}", edition.member_ids.len());
    if let Some(ref location) = edition.published_location {
        println!("Published:  {}", location);
    }

    if !items.is_empty() {
        println!("\n{:<38} {:<12} {}", "ITEM ID", "STATUS", "URL");
        println!("{}", "-".repeat(90));
        for item in items {
            println!("{:<38} {:<12} {}", item.id, item.status.as_str(), item.url);
        }
    }

    Ok(())
}

/// Show resolved configuration
fn show_config(cfg: &ResolvedConfig) -> Result<()> {
    let display = |p: Option<&std::path::Path>| {
        p.map(|p| p.display().to_string())
            .unwrap_or_else(|| "(none)".to_string())
    };

    println!("presswork configuration");
    println!();
    println!(
        "Config file: {}",
        cfg.config_file
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "(none - using defaults)".to_string())
    );
    println!();
    println!("Paths:");
    println!("  Home:       {}", cfg.home.display());
    println!("  Store:      {}", cfg.store_path.display());
    println!("  Broker:     {}", display(cfg.broker.path.as_deref()));
    println!("  Published:  {}", cfg.output_dir.display());
    println!();
    println!("Broker:");
    println!("  Events:     {} / {}", cfg.broker.event_topic, cfg.broker.event_subscription);
    println!("  Commands:   {} / {}", cfg.broker.command_topic, cfg.broker.command_subscription);
    println!("  Max deliveries: {}", cfg.broker.max_delivery_count);
    println!();
    println!("Pipeline:");
    println!("  Claim TTL:      {}s", cfg.claim.ttl_seconds);
    println!("  Max attempts:   {}", cfg.retry.max_attempts);
    println!("  Poll interval:  {}ms", cfg.feed.poll_interval_ms);
    println!("  Checkpointing:  {}", cfg.feed.checkpoint);
    println!();
    println!("Stages:");
    println!("  Fabric binary:  {}", cfg.stages.fabric_binary.as_deref().unwrap_or("(auto)"));
    println!("  Review pattern: {}", cfg.stages.review_pattern);
    println!("  Draft pattern:  {}", cfg.stages.draft_pattern);
    println!("  Edit pattern:   {}", cfg.stages.edit_pattern);
    println!("  Timeout:        {}s", cfg.stages.timeout_seconds);

    Ok(())
}
