use crate::db::{self, DbKind};
use crate::error::Result;
use crate::store::Collaborators;
use sqlx::AnyPool;

/// Everything known about the message being replied to, plus the identity of
/// the user replying.
#[derive(Debug, Clone)]
pub struct ReplyLookup<'a> {
    pub replying_user_id: &'a str,
    pub replying_platform_id: i64,
    pub chat_id: i64,
    pub replied_message_id: i64,
    pub replied_author_platform_id: i64,
}

/// Locate the record a reply should land on.
///
/// Replying to your own earlier message matches the comment's inbound
/// linkage (falling back to the still-unprocessed inbound queue); replying
/// to someone else's message matches outbound linkage, covering replies to
/// notifications this system sent. Matches outside consultations the
/// replying user participates in are discarded, and `None` lets the caller
/// fall back to the user's active record.
pub async fn resolve_reply_target(
    pool: &AnyPool,
    db_kind: DbKind,
    stores: &Collaborators,
    lookup: ReplyLookup<'_>,
) -> Result<Option<String>> {
    if lookup.replied_author_platform_id == lookup.replying_platform_id {
        let comment = stores
            .comments
            .find_by_inbound_ref(lookup.chat_id, lookup.replied_message_id)
            .await?;
        if let Some(comment) = comment {
            if comment.author_id == lookup.replying_user_id
                && in_scope(stores, &comment.record_id, lookup.replying_user_id).await?
            {
                return Ok(Some(comment.record_id));
            }
            return Ok(None);
        }

        // The referenced message may not have become a comment yet.
        let queued = db::find_inbound_by_message(
            pool,
            db_kind,
            lookup.chat_id,
            lookup.replied_message_id,
            lookup.replying_user_id,
        )
        .await?;
        return Ok(queued.map(|row| row.record_id));
    }

    let comment = stores
        .comments
        .find_by_outbound_ref(lookup.chat_id, lookup.replied_message_id)
        .await?;
    if let Some(comment) = comment {
        if comment.author_id != lookup.replying_user_id
            && in_scope(stores, &comment.record_id, lookup.replying_user_id).await?
        {
            return Ok(Some(comment.record_id));
        }
    }
    Ok(None)
}

async fn in_scope(stores: &Collaborators, record_id: &str, user_id: &str) -> Result<bool> {
    let consultation = stores.records.consultation(record_id).await?;
    Ok(consultation
        .map(|c| c.involves(user_id))
        .unwrap_or(false))
}
