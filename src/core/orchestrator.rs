//! Pipeline orchestrator.
//!
//! Turns change notifications and commands into stage executions:
//! claim the item, lock its edition, run each stage through the retry
//! executor, record a Run per stage and publish lifecycle events. All edition
//! mutation, and every Run write, happens while the edition lock is held.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::watch;
use tracing::{debug, error, info, instrument, warn};

use crate::domain::{
    item_update_payload, run_complete_payload, run_start_payload, Edition, Feedback, ItemStatus,
    PublishRequest, Run, Stage, WorkItem, ITEM_UPDATE, RUN_COMPLETE, RUN_START,
};
use crate::events::{CommandHandler, EventPublisher};
use crate::store::{
    DocumentStore, EditionRepository, FeedbackRepository, ItemRepository, RunRepository,
};

use super::change_feed::ChangeHandler;
use super::claim::{Claim, ClaimCoordinator, DEFAULT_CLAIM_TTL};
use super::locks::KeyedLockRegistry;
use super::retry::{RetryExecutor, RetryOutcome, RetryPolicy};
use super::stages::{StageInput, StageOutput, StageRegistry};

/// Orchestrator tuning
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub claim_ttl: Duration,
    pub retry: RetryPolicy,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            claim_ttl: DEFAULT_CLAIM_TTL,
            retry: RetryPolicy::default(),
        }
    }
}

/// Main pipeline orchestrator
pub struct PipelineOrchestrator {
    items: ItemRepository,
    editions: EditionRepository,
    feedback: FeedbackRepository,
    runs: RunRepository,
    claims: ClaimCoordinator,
    locks: Arc<KeyedLockRegistry>,
    retry: RetryExecutor,
    stages: StageRegistry,
    events: Arc<dyn EventPublisher>,
    cancel: watch::Sender<bool>,
}

impl PipelineOrchestrator {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        locks: Arc<KeyedLockRegistry>,
        stages: StageRegistry,
        events: Arc<dyn EventPublisher>,
        config: OrchestratorConfig,
    ) -> Self {
        let items = ItemRepository::new(Arc::clone(&store));
        Self {
            claims: ClaimCoordinator::new(items.clone(), config.claim_ttl),
            items,
            editions: EditionRepository::new(Arc::clone(&store)),
            feedback: FeedbackRepository::new(Arc::clone(&store)),
            runs: RunRepository::new(store),
            locks,
            retry: RetryExecutor::new(config.retry),
            stages,
            events,
            cancel: watch::channel(false).0,
        }
    }

    /// Interrupt in-flight stage attempts and refuse new work.
    ///
    /// Interrupted Runs are recorded as failed and their items are failed
    /// with the claim released, so they can be resubmitted after restart.
    pub fn cancel_in_flight(&self) {
        self.cancel.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.cancel.borrow()
    }

    pub fn items(&self) -> &ItemRepository {
        &self.items
    }

    pub fn editions(&self) -> &EditionRepository {
        &self.editions
    }

    pub fn runs(&self) -> &RunRepository {
        &self.runs
    }

    /// React to a changed work item document
    #[instrument(skip(self, doc), fields(item_id = tracing::field::Empty))]
    pub async fn handle_item_change(&self, doc: Value) -> Result<()> {
        let Some(item_id) = doc.get("id").and_then(Value::as_str) else {
            debug!("Change without an id, skipping");
            return Ok(());
        };
        tracing::Span::current().record("item_id", item_id);

        // Most changes are our own status writes; skip them without a read
        let status = doc.get("status").and_then(Value::as_str);
        if status != Some(ItemStatus::Submitted.as_str()) {
            return Ok(());
        }

        self.process_item(item_id).await
    }

    /// Claim an item and run the item pipeline on it
    pub async fn process_item(&self, item_id: &str) -> Result<()> {
        if self.is_cancelled() {
            debug!(item_id, "Shutting down, not claiming");
            return Ok(());
        }
        let item = match self.claims.claim(item_id).await.context("Claim failed")? {
            Claim::Acquired(claimed) => claimed.doc,
            Claim::Rejected(reason) => {
                debug!(item_id, %reason, "Not processing item");
                return Ok(());
            }
        };
        let Some(edition_id) = item.aggregate_id.clone() else {
            return Ok(());
        };

        info!(item_id, edition_id = %edition_id, "Claimed item");
        let _guard = self.locks.acquire(&edition_id).await;

        if let Err(e) = self.run_item_pipeline(item, &edition_id).await {
            error!(item_id, error = %e, "Item pipeline bookkeeping failed");
            self.mark_failed_best_effort(item_id).await;
            return Err(e);
        }
        Ok(())
    }

    async fn run_item_pipeline(&self, mut item: WorkItem, edition_id: &str) -> Result<()> {
        let mut edition = match self.editions.get(edition_id).await? {
            Some(edition) if !edition.is_published() => edition,
            Some(_) => {
                warn!(item_id = %item.id, edition_id, "Edition already published, failing item");
                return self.fail_item(&mut item).await;
            }
            None => {
                warn!(item_id = %item.id, edition_id, "Edition not found, failing item");
                return self.fail_item(&mut item).await;
            }
        };

        item.advance(ItemStatus::Processing);
        self.save_item(&item).await?;

        for stage in Stage::ITEM_PIPELINE {
            if self.is_cancelled() {
                warn!(item_id = %item.id, %stage, "Shutdown before stage, failing item");
                return self.fail_item(&mut item).await;
            }
            if stage == Stage::Fetch {
                item.advance(ItemStatus::Fetching);
                self.save_item(&item).await?;
            }

            let input = StageInput::for_item(item.clone(), edition.clone());
            let Some(output) = self.run_stage(stage, &item.id, edition_id, &input).await? else {
                return self.fail_item(&mut item).await;
            };

            match stage {
                Stage::Fetch => {
                    if output.title.is_some() {
                        item.title = output.title;
                    }
                    item.content = Some(output.text);
                    item.updated_at = chrono::Utc::now();
                }
                Stage::Review => {
                    item.review = Some(output.text);
                    item.advance(ItemStatus::Reviewed);
                }
                Stage::Draft => {
                    edition.put_section(&item.id, output.text)?;
                    edition.associate(&item.id)?;
                    self.editions
                        .save(&edition)
                        .await
                        .context("Failed to save edition")?;
                    item.claim_marker = None;
                    item.advance(ItemStatus::Drafted);
                }
                Stage::Edit | Stage::Publish => {}
            }
            self.save_item(&item).await?;
        }

        info!(item_id = %item.id, edition_id, "Item drafted into edition");
        Ok(())
    }

    /// React to a changed feedback document
    #[instrument(skip(self, doc))]
    pub async fn handle_feedback_change(&self, doc: Value) -> Result<()> {
        let feedback: Feedback =
            serde_json::from_value(doc).context("Unreadable feedback document")?;
        if !feedback.is_actionable() {
            return Ok(());
        }
        let Some(edition_id) = feedback.aggregate_id.clone() else {
            return Ok(());
        };
        if self.is_cancelled() {
            return Ok(());
        }

        let _guard = self.locks.acquire(&edition_id).await;

        // Re-read under the lock: an earlier edit may have resolved it
        let Some(mut feedback) = self
            .feedback
            .get(&feedback.id)
            .await?
            .filter(Feedback::is_actionable)
        else {
            return Ok(());
        };

        let mut edition = match self.editions.get(&edition_id).await? {
            Some(edition) if !edition.is_published() => edition,
            Some(_) => {
                warn!(feedback_id = %feedback.id, edition_id = %edition_id, "Feedback for published edition ignored");
                return Ok(());
            }
            None => {
                warn!(feedback_id = %feedback.id, edition_id = %edition_id, "Feedback for unknown edition ignored");
                return Ok(());
            }
        };

        let input = StageInput::for_feedback(feedback.clone(), edition.clone());
        let Some(output) = self
            .run_stage(Stage::Edit, &feedback.id, &edition_id, &input)
            .await?
        else {
            return Ok(());
        };

        edition.apply_edit(output.text)?;
        self.editions
            .save(&edition)
            .await
            .context("Failed to save edition")?;

        for mut member in self.items.by_edition(&edition_id).await? {
            if member.status == ItemStatus::Drafted {
                member.advance(ItemStatus::Edited);
                self.save_item(&member).await?;
            }
        }

        feedback.resolved = true;
        self.feedback
            .save(&feedback)
            .await
            .context("Failed to resolve feedback")?;

        info!(feedback_id = %feedback.id, edition_id = %edition_id, "Applied feedback");
        Ok(())
    }

    /// Publish an edition. Publishing an already-published edition is a no-op.
    pub async fn handle_publish(&self, edition_id: &str) -> Result<()> {
        self.publish_edition(edition_id, edition_id).await
    }

    /// Publish an edition, recording `trigger_id` as the cause of the Run
    #[instrument(skip(self))]
    async fn publish_edition(&self, edition_id: &str, trigger_id: &str) -> Result<()> {
        if self.is_cancelled() {
            anyhow::bail!("Shutting down, publish of {} deferred", edition_id);
        }
        let _guard = self.locks.acquire(edition_id).await;

        let mut edition = match self.editions.get(edition_id).await? {
            Some(edition) if edition.is_published() => {
                info!(edition_id, "Edition already published");
                return Ok(());
            }
            Some(edition) => edition,
            None => {
                warn!(edition_id, "Publish requested for unknown edition");
                return Ok(());
            }
        };

        let input = StageInput::for_edition(edition.clone());
        let Some(output) = self
            .run_stage(Stage::Publish, trigger_id, edition_id, &input)
            .await?
        else {
            if self.is_cancelled() {
                // Leave the command unsettled so it is redelivered
                anyhow::bail!("Publish of {} interrupted by shutdown", edition_id);
            }
            return Ok(());
        };

        edition.mark_published(output.text);
        self.editions
            .save(&edition)
            .await
            .context("Failed to save edition")?;

        for member_id in &edition.member_ids {
            let Some(mut member) = self.items.get(member_id).await? else {
                continue;
            };
            if member.is_deleted() {
                continue;
            }
            member.advance(ItemStatus::Published);
            self.save_item(&member).await?;
        }

        info!(edition_id, location = ?edition.published_location, "Edition published");
        Ok(())
    }

    /// Record a Run around one retry-wrapped stage execution.
    ///
    /// Returns `None` when every attempt failed; the failure is on the Run.
    async fn run_stage(
        &self,
        stage: Stage,
        trigger_id: &str,
        aggregate_id: &str,
        input: &StageInput,
    ) -> Result<Option<StageOutput>> {
        let executor = self.stages.get(stage)?.as_ref();

        let mut run = Run::start(stage, trigger_id, aggregate_id);
        self.runs
            .save(&run)
            .await
            .context("Failed to record run start")?;
        self.events
            .publish(RUN_START, run_start_payload(&run).into())
            .await;

        let attempted = AtomicU32::new(0);
        let attempts_so_far = &attempted;
        let mut cancel = self.cancel.subscribe();
        let outcome = tokio::select! {
            biased;
            _ = cancel.wait_for(|cancelled| *cancelled) => {
                RetryOutcome::Exhausted {
                    error: anyhow::anyhow!("Interrupted by shutdown"),
                    attempts: attempted.load(Ordering::SeqCst),
                }
            }
            outcome = self.retry.execute(stage.as_str(), move |attempt| {
                attempts_so_far.store(attempt, Ordering::SeqCst);
                executor.execute(input)
            }) => outcome,
        };

        let output = match outcome {
            RetryOutcome::Succeeded { value, attempts } => {
                run.complete(Value::String(value.text.clone()), value.usage, attempts);
                info!(%stage, trigger_id, attempts, "Stage completed");
                Some(value)
            }
            RetryOutcome::Exhausted { error, attempts } => {
                run.fail(format!("{:#}", error), attempts);
                warn!(%stage, trigger_id, attempts, "Stage failed");
                None
            }
        };

        self.runs
            .save(&run)
            .await
            .context("Failed to record run completion")?;
        self.events
            .publish(RUN_COMPLETE, run_complete_payload(&run).into())
            .await;

        Ok(output)
    }

    async fn fail_item(&self, item: &mut WorkItem) -> Result<()> {
        item.mark_failed();
        self.save_item(item).await
    }

    /// Save an item and publish its summary
    async fn save_item(&self, item: &WorkItem) -> Result<()> {
        self.items
            .save(item)
            .await
            .with_context(|| format!("Failed to save item {}", item.id))?;
        self.publish_item_update(item).await;
        Ok(())
    }

    async fn publish_item_update(&self, item: &WorkItem) {
        let runs = match self.runs.by_trigger(&item.id).await {
            Ok(runs) => runs,
            Err(e) => {
                warn!(item_id = %item.id, error = %e, "Failed to load run history");
                Vec::new()
            }
        };
        self.events
            .publish(ITEM_UPDATE, item_update_payload(item, &runs).into())
            .await;
    }

    async fn mark_failed_best_effort(&self, item_id: &str) {
        let result: Result<()> = async {
            if let Some(mut item) = self.items.get(item_id).await? {
                if item.status.is_in_flight() {
                    self.fail_item(&mut item).await?;
                }
            }
            Ok(())
        }
        .await;
        if let Err(e) = result {
            error!(item_id, error = %e, "Could not mark item failed");
        }
    }

    // Operator commands

    /// Create a submitted item, creating its edition when missing
    pub async fn submit(&self, url: &str, edition_id: &str) -> Result<WorkItem> {
        {
            let _guard = self.locks.acquire(edition_id).await;
            match self.editions.get(edition_id).await? {
                Some(edition) if edition.is_published() => {
                    anyhow::bail!("Edition {} is already published", edition_id)
                }
                Some(_) => {}
                None => {
                    self.editions.save(&Edition::new(edition_id)).await?;
                    info!(edition_id, "Created edition");
                }
            }
        }

        let item = WorkItem::new(url, Some(edition_id.to_string()));
        self.items.save(&item).await?;
        info!(item_id = %item.id, edition_id, "Submitted item");
        Ok(item)
    }

    /// Record editor feedback against an edition
    pub async fn add_feedback(&self, edition_id: &str, text: &str) -> Result<Feedback> {
        let edition = self
            .editions
            .get(edition_id)
            .await?
            .with_context(|| format!("Edition not found: {}", edition_id))?;
        if edition.is_published() {
            anyhow::bail!("Edition {} is already published", edition_id);
        }

        let feedback = Feedback::new(edition_id, text);
        self.feedback.save(&feedback).await?;
        Ok(feedback)
    }

    /// Put a failed item back into the queue
    pub async fn resubmit(&self, item_id: &str) -> Result<WorkItem> {
        let mut item = self
            .items
            .get(item_id)
            .await?
            .with_context(|| format!("Item not found: {}", item_id))?;
        if !item.resubmit() {
            anyhow::bail!("Item {} is {} and cannot be resubmitted", item_id, item.status);
        }
        self.save_item(&item).await?;
        Ok(item)
    }

    /// Tombstone an item and remove it from its edition
    pub async fn delete_item(&self, item_id: &str) -> Result<()> {
        let mut item = self
            .items
            .get(item_id)
            .await?
            .with_context(|| format!("Item not found: {}", item_id))?;

        if let Some(edition_id) = item.aggregate_id.clone() {
            self.remove_from_edition(&edition_id, item_id).await?;
        }
        item.soft_delete();
        self.save_item(&item).await
    }

    /// Detach an item from its edition, keeping the item
    pub async fn detach(&self, item_id: &str) -> Result<WorkItem> {
        let mut item = self
            .items
            .get(item_id)
            .await?
            .with_context(|| format!("Item not found: {}", item_id))?;
        let Some(edition_id) = item.aggregate_id.take() else {
            anyhow::bail!("Item {} is not part of an edition", item_id);
        };

        self.remove_from_edition(&edition_id, item_id).await?;
        item.updated_at = chrono::Utc::now();
        self.save_item(&item).await?;
        Ok(item)
    }

    async fn remove_from_edition(&self, edition_id: &str, item_id: &str) -> Result<()> {
        let _guard = self.locks.acquire(edition_id).await;
        if let Some(mut edition) = self.editions.get(edition_id).await? {
            edition.disassociate(item_id)?;
            self.editions.save(&edition).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl CommandHandler for PipelineOrchestrator {
    async fn publish(&self, request: &PublishRequest) -> Result<()> {
        let trigger_id = request.request_id.as_deref().unwrap_or(&request.edition_id);
        self.publish_edition(&request.edition_id, trigger_id).await
    }
}

/// Feeds item changes into the orchestrator
pub struct ItemChanges(pub Arc<PipelineOrchestrator>);

#[async_trait]
impl ChangeHandler for ItemChanges {
    async fn handle(&self, doc: Value) -> Result<()> {
        self.0.handle_item_change(doc).await
    }
}

/// Feeds feedback changes into the orchestrator
pub struct FeedbackChanges(pub Arc<PipelineOrchestrator>);

#[async_trait]
impl ChangeHandler for FeedbackChanges {
    async fn handle(&self, doc: Value) -> Result<()> {
        self.0.handle_feedback_change(doc).await
    }
}
