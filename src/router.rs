use crate::db::{self, DbKind};
use crate::error::{RelayError, Result};
use crate::store::Collaborators;
use sqlx::AnyPool;
use tracing::debug;

/// React to a comment turning approved: if it belongs to an active two-party
/// consultation and was written by one of the two participants, queue a
/// notification for the counterpart. Everything else (third-party comments,
/// half-assigned records, recipients without a platform link) is silently
/// skipped. Duplicate enqueues collapse on the (comment, recipient) key.
///
/// Returns the queued row id, or `None` when the comment produced nothing.
pub async fn route_approved_comment(
    pool: &AnyPool,
    db_kind: DbKind,
    stores: &Collaborators,
    comment_id: &str,
) -> Result<Option<String>> {
    let comment = stores
        .comments
        .get(comment_id)
        .await?
        .ok_or_else(|| RelayError::not_found(format!("comment {comment_id}")))?;

    let Some(consultation) = stores.records.consultation(&comment.record_id).await? else {
        debug!("comment {comment_id} is not attached to a consultation, skipping");
        return Ok(None);
    };

    let Some(recipient_id) = consultation.counterpart_of(&comment.author_id) else {
        debug!(
            "comment {comment_id} author {} is not a participant of {}, skipping",
            comment.author_id, consultation.id
        );
        return Ok(None);
    };

    let Some(recipient) = stores.users.profile(recipient_id).await? else {
        debug!("recipient {recipient_id} unknown, skipping comment {comment_id}");
        return Ok(None);
    };
    if recipient.chat_id.is_none() {
        debug!(
            "recipient {recipient_id} has no linked platform chat, skipping comment {comment_id}"
        );
        return Ok(None);
    }

    let queued = db::enqueue_outbound(pool, db_kind, comment_id, recipient_id).await?;
    Ok(queued)
}
