use crate::config::QueueConfig;
use crate::db::{self, DbKind, OutboundRow};
use crate::error::{RelayError, Result};
use crate::sanitize::{escape, sanitize_html, strip_tags};
use crate::store::Collaborators;
use crate::telegram::{BotClient, MediaPart};
use crate::types::{media_kind, MediaKind};
use sqlx::AnyPool;
use tracing::{debug, error, warn};
use uuid::Uuid;

const OUTBOUND_LOCK: &str = "outbound-notifier";

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct NotifierReport {
    pub claimed: usize,
    pub sent: usize,
    pub retried: usize,
    pub dropped: usize,
    pub undeliverable: usize,
    /// Recipients whose chat rejected the bot; upstream should stop
    /// scheduling sends to them.
    pub unreachable_recipients: Vec<String>,
}

/// Drains the outbound queue: renders each approved comment for its
/// counterpart recipient and fans the attachments back out to the platform.
pub struct Notifier {
    pool: AnyPool,
    db_kind: DbKind,
    bot: BotClient,
    stores: Collaborators,
    queue: QueueConfig,
    direct_upload: bool,
}

impl Notifier {
    pub fn new(
        pool: AnyPool,
        db_kind: DbKind,
        bot: BotClient,
        stores: Collaborators,
        queue: QueueConfig,
        direct_upload: bool,
    ) -> Self {
        Self {
            pool,
            db_kind,
            bot,
            stores,
            queue,
            direct_upload,
        }
    }

    pub async fn run_batch(&self) -> anyhow::Result<NotifierReport> {
        let holder = Uuid::new_v4().to_string();
        if !db::acquire_run_lock(
            &self.pool,
            self.db_kind,
            OUTBOUND_LOCK,
            &holder,
            self.queue.run_lock_seconds,
        )
        .await?
        {
            debug!("outbound batch already running, skipping");
            return Ok(NotifierReport::default());
        }

        let result = self.run_locked().await;
        db::release_run_lock(&self.pool, self.db_kind, OUTBOUND_LOCK, &holder).await?;
        result
    }

    async fn run_locked(&self) -> anyhow::Result<NotifierReport> {
        let rows = db::claim_outbound_batch(
            &self.pool,
            self.db_kind,
            self.queue.max_retries,
            self.queue.batch_size,
            self.queue.row_lease_seconds,
        )
        .await?;

        let mut report = NotifierReport {
            claimed: rows.len(),
            ..NotifierReport::default()
        };

        for row in &rows {
            match self.dispatch(row).await {
                Ok(()) => {
                    if let Err(err) = db::retire_outbound(
                        &self.pool,
                        self.db_kind,
                        self.queue.debug_keep_rows,
                        &row.id,
                    )
                    .await
                    {
                        warn!("retiring delivered notification {} failed: {err}", row.id);
                    }
                    report.sent += 1;
                }
                Err(err) => self.handle_failure(row, err, &mut report).await,
            }
        }

        Ok(report)
    }

    async fn dispatch(&self, row: &OutboundRow) -> Result<()> {
        let comment = self
            .stores
            .comments
            .get(&row.comment_id)
            .await?
            .ok_or_else(|| RelayError::not_found(format!("comment {}", row.comment_id)))?;
        let recipient = self
            .stores
            .users
            .profile(&row.recipient_user_id)
            .await?
            .ok_or_else(|| RelayError::not_found(format!("user {}", row.recipient_user_id)))?;
        let chat_id = recipient.chat_id.ok_or_else(|| {
            RelayError::not_found(format!("user {} has no linked chat", recipient.id))
        })?;

        let author_name = self
            .stores
            .users
            .profile(&comment.author_id)
            .await?
            .map(|p| p.display_name)
            .unwrap_or_else(|| comment.author_id.clone());
        let title = self
            .stores
            .records
            .consultation(&comment.record_id)
            .await?
            .map(|c| c.title)
            .unwrap_or_default();
        let text = render_notification(&author_name, &title, &comment.content);

        let mut parts = Vec::new();
        for attachment_id in &comment.attachment_ids {
            let Some(attachment) = self.stores.media.get(attachment_id).await? else {
                warn!(
                    "attachment {attachment_id} on comment {} vanished, sending without it",
                    comment.id
                );
                continue;
            };
            let bytes = if self.direct_upload {
                Some(self.stores.media.read(attachment_id).await?)
            } else {
                None
            };
            parts.push(MediaPart {
                kind: media_kind(attachment.mime_type.as_deref(), &attachment.filename),
                url: attachment.url,
                filename: attachment.filename,
                bytes,
            });
        }

        if parts.is_empty() {
            let message_id = self.send_text_with_fallback(chat_id, &text).await?;
            self.stores
                .comments
                .add_outbound_refs(&comment.id, chat_id, &[message_id])
                .await?;
            return Ok(());
        }

        // The caption rides on the first item of the first non-empty bucket
        // only; any bucket failure fails the whole notification and the
        // retry resends everything.
        let mut caption = Some(text.as_str());
        for bucket in partition_buckets(parts).iter().filter(|b| !b.is_empty()) {
            let message_ids = self
                .send_group_with_fallback(chat_id, bucket, caption.take())
                .await?;
            self.stores
                .comments
                .add_outbound_refs(&comment.id, chat_id, &message_ids)
                .await?;
        }
        Ok(())
    }

    async fn send_text_with_fallback(&self, chat_id: i64, text: &str) -> Result<i64> {
        match self.bot.send_text(chat_id, text, true).await {
            Ok(message_id) => Ok(message_id),
            Err(err) if is_parse_rejection(&err) => {
                debug!("formatted send rejected, falling back to plain text: {err}");
                self.bot.send_text(chat_id, &strip_tags(text), false).await
            }
            Err(err) => Err(err),
        }
    }

    async fn send_group_with_fallback(
        &self,
        chat_id: i64,
        parts: &[MediaPart],
        caption: Option<&str>,
    ) -> Result<Vec<i64>> {
        match self.bot.send_media_group(chat_id, parts, caption, true).await {
            Ok(message_ids) => Ok(message_ids),
            Err(err) if is_parse_rejection(&err) => {
                debug!("formatted caption rejected, falling back to plain text: {err}");
                let plain = caption.map(strip_tags);
                self.bot
                    .send_media_group(chat_id, parts, plain.as_deref(), false)
                    .await
            }
            Err(err) => Err(err),
        }
    }

    async fn handle_failure(&self, row: &OutboundRow, err: RelayError, report: &mut NotifierReport) {
        if !err.is_retryable() {
            if err.is_recipient_unreachable() {
                error!(
                    "recipient {} is unreachable, dropping notification {}: {err}",
                    row.recipient_user_id, row.id
                );
                report
                    .unreachable_recipients
                    .push(row.recipient_user_id.clone());
            } else {
                warn!(
                    "notification {} for comment {} is undeliverable, dropping: {err}",
                    row.id, row.comment_id
                );
            }
            let _ = db::retire_outbound(
                &self.pool,
                self.db_kind,
                self.queue.debug_keep_rows,
                &row.id,
            )
            .await;
            report.undeliverable += 1;
            return;
        }

        let next_retry = row.retry_count + 1;
        if next_retry < self.queue.max_retries {
            warn!(
                "notification {} attempt {} failed, will retry: {err}",
                row.id, next_retry
            );
            if let Err(db_err) =
                db::mark_outbound_failed(&self.pool, self.db_kind, &row.id, next_retry).await
            {
                warn!("recording retry for {} failed: {db_err}", row.id);
            }
            report.retried += 1;
        } else {
            warn!(
                "notification {} exhausted retries, giving up: {err}",
                row.id
            );
            let _ = db::retire_outbound(
                &self.pool,
                self.db_kind,
                self.queue.debug_keep_rows,
                &row.id,
            )
            .await;
            report.dropped += 1;
        }
    }
}

/// Compose the recipient-facing message: author, record title, then the
/// sanitized comment body.
pub fn render_notification(author: &str, title: &str, content: &str) -> String {
    let mut out = format!("<b>{}</b>", escape(author));
    if !title.is_empty() {
        out.push_str(&format!("\n<i>{}</i>", escape(title)));
    }
    let body = sanitize_html(content);
    if !body.is_empty() {
        out.push_str("\n\n");
        out.push_str(&body);
    }
    out
}

/// Split attachments into the three send groups the platform allows: photos
/// and videos may share one grouped call, audio goes alone, documents and
/// anything unclassified go alone.
pub fn partition_buckets(parts: Vec<MediaPart>) -> [Vec<MediaPart>; 3] {
    let mut gallery = Vec::new();
    let mut audio = Vec::new();
    let mut documents = Vec::new();
    for part in parts {
        match part.kind {
            MediaKind::Photo | MediaKind::Video => gallery.push(part),
            MediaKind::Audio => audio.push(part),
            MediaKind::Document => documents.push(part),
        }
    }
    [gallery, audio, documents]
}

fn is_parse_rejection(err: &RelayError) -> bool {
    matches!(
        err,
        RelayError::Api { code: 400, description } if description.contains("parse")
    )
}
