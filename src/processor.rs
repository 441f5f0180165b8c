use crate::config::QueueConfig;
use crate::db::{self, DbKind, InboundRow};
use crate::error::{RelayError, Result};
use crate::router;
use crate::store::{Collaborators, NewComment, PlatformRef, StoredAttachment};
use crate::telegram::{BotClient, REACTION_FAIL, REACTION_OK};
use crate::types::{extract_media, infer_filename};
use sqlx::AnyPool;
use tracing::{debug, warn};
use uuid::Uuid;

const INBOUND_LOCK: &str = "inbound-processor";

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BatchReport {
    pub claimed: usize,
    pub done: usize,
    pub retried: usize,
    pub degraded: usize,
    pub dead_lettered: usize,
}

/// Consumes claimed inbound rows and turns them into comment records:
/// downloads attachments, upserts the comment (merging media-group
/// siblings), and decides approval once a message or its whole group has
/// landed.
pub struct Processor {
    pool: AnyPool,
    db_kind: DbKind,
    bot: BotClient,
    stores: Collaborators,
    queue: QueueConfig,
}

impl Processor {
    pub fn new(
        pool: AnyPool,
        db_kind: DbKind,
        bot: BotClient,
        stores: Collaborators,
        queue: QueueConfig,
    ) -> Self {
        Self {
            pool,
            db_kind,
            bot,
            stores,
            queue,
        }
    }

    /// One externally-triggered batch run. A second overlapping call is a
    /// no-op while the run lock is held.
    pub async fn run_batch(&self) -> anyhow::Result<BatchReport> {
        let holder = Uuid::new_v4().to_string();
        if !db::acquire_run_lock(
            &self.pool,
            self.db_kind,
            INBOUND_LOCK,
            &holder,
            self.queue.run_lock_seconds,
        )
        .await?
        {
            debug!("inbound batch already running, skipping");
            return Ok(BatchReport::default());
        }

        let result = self.run_locked().await;
        db::release_run_lock(&self.pool, self.db_kind, INBOUND_LOCK, &holder).await?;
        result
    }

    async fn run_locked(&self) -> anyhow::Result<BatchReport> {
        let rows = db::claim_inbound_batch(
            &self.pool,
            self.db_kind,
            self.queue.max_retries,
            self.queue.batch_size,
            self.queue.row_lease_seconds,
        )
        .await?;

        let mut report = BatchReport {
            claimed: rows.len(),
            ..BatchReport::default()
        };

        for row in &rows {
            match self.process_row(row).await {
                Ok(()) => report.done += 1,
                Err(err) => self.handle_failure(row, err, &mut report).await,
            }
        }

        Ok(report)
    }

    async fn process_row(&self, row: &InboundRow) -> Result<()> {
        if !row.payload.is_object() {
            return Err(RelayError::validation("inbound payload is not an object"));
        }

        let downloaded = self.download_attachments(row).await;

        match self.upsert_comment(row, downloaded).await {
            Ok(comment_id) => self.complete(row, &comment_id).await,
            Err((downloaded, err)) => {
                // Orphaned media from this attempt must not survive a retry.
                for attachment in &downloaded {
                    if let Err(del_err) = self.stores.media.delete(&attachment.id).await {
                        warn!("cleanup of attachment {} failed: {del_err}", attachment.id);
                    }
                }
                Err(err)
            }
        }
    }

    /// Per-file failures are isolated: the file is skipped, a failure
    /// reaction lands on the source message, and the rest of the batch item
    /// proceeds.
    async fn download_attachments(&self, row: &InboundRow) -> Vec<StoredAttachment> {
        let mut stored = Vec::new();
        for item in extract_media(&row.payload) {
            match self.fetch_and_store(row, &item).await {
                Ok(attachment) => stored.push(attachment),
                Err(err) => {
                    warn!(
                        "attachment {} on message {}/{} failed: {err}",
                        item.file_id, row.chat_id, row.platform_message_id
                    );
                    self.bot
                        .set_reaction(row.chat_id, row.platform_message_id, REACTION_FAIL)
                        .await;
                }
            }
        }
        stored
    }

    async fn fetch_and_store(
        &self,
        row: &InboundRow,
        item: &crate::types::MediaItem,
    ) -> Result<StoredAttachment> {
        let url = self.bot.get_file_url(&item.file_id).await?;
        let bytes = self.bot.download(&url).await?;
        let filename = infer_filename(item);
        self.stores
            .media
            .create(&row.record_id, &filename, item.mime_type.as_deref(), bytes)
            .await
    }

    /// Create or extend the comment for this row. Reprocessing a row whose
    /// comment already exists (crash between upsert and retire) is detected
    /// through the inbound linkage and collapses to a no-op that discards
    /// this attempt's duplicate downloads.
    async fn upsert_comment(
        &self,
        row: &InboundRow,
        downloaded: Vec<StoredAttachment>,
    ) -> std::result::Result<String, (Vec<StoredAttachment>, RelayError)> {
        let inbound_ref = PlatformRef {
            chat_id: row.chat_id,
            message_id: row.platform_message_id,
        };
        let text = message_text(row);

        let existing = self
            .stores
            .comments
            .find_by_inbound_ref(row.chat_id, row.platform_message_id)
            .await
            .map_err(|e| (downloaded.clone(), e))?;
        if let Some(comment) = existing {
            debug!(
                "message {}/{} already mapped to comment {}, discarding re-download",
                row.chat_id, row.platform_message_id, comment.id
            );
            for attachment in &downloaded {
                if let Err(err) = self.stores.media.delete(&attachment.id).await {
                    warn!("cleanup of attachment {} failed: {err}", attachment.id);
                }
            }
            return Ok(comment.id);
        }

        let attachment_ids: Vec<String> = downloaded.iter().map(|a| a.id.clone()).collect();

        if let Some(group) = row.media_group_id.as_deref() {
            let sibling = self
                .stores
                .comments
                .find_pending_group_comment(&row.record_id, &row.owner_user_id, group)
                .await
                .map_err(|e| (downloaded.clone(), e))?;
            if let Some(comment) = sibling {
                let merge = async {
                    self.stores
                        .comments
                        .append_attachments(&comment.id, &attachment_ids)
                        .await?;
                    self.stores
                        .comments
                        .add_inbound_ref(&comment.id, inbound_ref)
                        .await?;
                    if !text.is_empty() {
                        self.stores.comments.set_content(&comment.id, &text).await?;
                    }
                    Ok::<_, RelayError>(())
                };
                return match merge.await {
                    Ok(()) => Ok(comment.id),
                    Err(err) => Err((downloaded, err)),
                };
            }
        }

        let created = self
            .stores
            .comments
            .create(NewComment {
                author_id: row.owner_user_id.clone(),
                record_id: row.record_id.clone(),
                content: text,
                media_group_id: row.media_group_id.clone(),
                inbound_ref,
                attachment_ids,
            })
            .await;
        match created {
            Ok(comment) => Ok(comment.id),
            Err(err) => Err((downloaded, err)),
        }
    }

    /// Retire the row, acknowledge the source message, and approve the
    /// comment once it is complete: immediately for a standalone message,
    /// or when the last sibling of its media group has been consumed.
    async fn complete(&self, row: &InboundRow, comment_id: &str) -> Result<()> {
        db::retire_inbound(
            &self.pool,
            self.db_kind,
            self.queue.debug_keep_rows,
            &row.id,
        )
        .await?;
        self.bot
            .set_reaction(row.chat_id, row.platform_message_id, REACTION_OK)
            .await;

        let group_closed = match row.media_group_id.as_deref() {
            None => true,
            Some(group) => {
                db::count_group_siblings(&self.pool, self.db_kind, group).await? == 0
            }
        };
        if !group_closed {
            return Ok(());
        }

        // approve_pending is conditional, so a racing run flips it at most
        // once and only the winner routes the notification.
        if self.stores.comments.approve_pending(comment_id).await? {
            if let Err(err) =
                router::route_approved_comment(&self.pool, self.db_kind, &self.stores, comment_id)
                    .await
            {
                warn!("routing approved comment {comment_id} failed: {err}");
            }
        }
        Ok(())
    }

    async fn handle_failure(&self, row: &InboundRow, err: RelayError, report: &mut BatchReport) {
        if !err.is_retryable() {
            warn!(
                "dead-lettering inbound {}/{}: {err}",
                row.chat_id, row.platform_message_id
            );
            let _ = db::retire_inbound(
                &self.pool,
                self.db_kind,
                self.queue.debug_keep_rows,
                &row.id,
            )
            .await;
            self.bot
                .set_reaction(row.chat_id, row.platform_message_id, REACTION_FAIL)
                .await;
            report.dead_lettered += 1;
            return;
        }

        let next_retry = row.retry_count + 1;
        if next_retry < self.queue.max_retries {
            warn!(
                "inbound {}/{} attempt {} failed, will retry: {err}",
                row.chat_id, row.platform_message_id, next_retry
            );
            if let Err(db_err) =
                db::mark_inbound_failed(&self.pool, self.db_kind, &row.id, next_retry).await
            {
                warn!("recording retry for {} failed: {db_err}", row.id);
            }
            report.retried += 1;
            return;
        }

        // Retries exhausted: degrade to an attachment-less comment rather
        // than lose the message, and only drop the row if even that fails.
        warn!(
            "inbound {}/{} exhausted retries: {err}",
            row.chat_id, row.platform_message_id
        );
        match self.upsert_comment(row, Vec::new()).await {
            Ok(comment_id) => {
                if let Err(err) = self.complete(row, &comment_id).await {
                    warn!("completing degraded comment {comment_id} failed: {err}");
                }
                report.degraded += 1;
            }
            Err((_, final_err)) => {
                warn!(
                    "degraded attempt for {}/{} failed, dropping: {final_err}",
                    row.chat_id, row.platform_message_id
                );
                let _ = db::retire_inbound(
                    &self.pool,
                    self.db_kind,
                    self.queue.debug_keep_rows,
                    &row.id,
                )
                .await;
                self.bot
                    .set_reaction(row.chat_id, row.platform_message_id, REACTION_FAIL)
                    .await;
                report.dead_lettered += 1;
            }
        }
    }
}

fn message_text(row: &InboundRow) -> String {
    row.payload
        .get("text")
        .or_else(|| row.payload.get("caption"))
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string()
}
