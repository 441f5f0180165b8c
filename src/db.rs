use anyhow::Result;
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{AnyPool, Row, TypeInfo, ValueRef};
use std::borrow::Cow;
use std::sync::Once;
use uuid::Uuid;

static INSTALL_DRIVERS: Once = Once::new();

/// Register the compiled-in drivers for the `Any` pool, exactly once per
/// process.
pub fn install_drivers() {
    INSTALL_DRIVERS.call_once(sqlx::any::install_default_drivers);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DbKind {
    Sqlite,
    Postgres,
}

pub fn db_kind_from_url(url: &str) -> DbKind {
    let lower = url.to_lowercase();
    if lower.starts_with("postgres://") || lower.starts_with("postgresql://") {
        DbKind::Postgres
    } else {
        DbKind::Sqlite
    }
}

pub fn rewrite_sql<'a>(sql: &'a str, kind: DbKind) -> Cow<'a, str> {
    match kind {
        DbKind::Sqlite => Cow::Borrowed(sql),
        DbKind::Postgres => {
            let mut out = String::with_capacity(sql.len() + 8);
            let mut idx = 1;
            for ch in sql.chars() {
                if ch == '?' {
                    out.push('$');
                    out.push_str(&idx.to_string());
                    idx += 1;
                } else {
                    out.push(ch);
                }
            }
            Cow::Owned(out)
        }
    }
}

fn i64_to_datetime(ts: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(ts, 0).single().unwrap_or_else(Utc::now)
}

fn datetime_to_i64(dt: DateTime<Utc>) -> i64 {
    dt.timestamp()
}

/// One persisted inbound platform message, waiting to become a comment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundRow {
    pub id: String,
    pub owner_user_id: String,
    pub platform_user_id: i64,
    pub chat_id: i64,
    pub platform_message_id: i64,
    pub record_id: String,
    pub payload: serde_json::Value,
    pub media_group_id: Option<String>,
    #[serde(skip)]
    pub created_at: DateTime<Utc>,
    #[serde(skip)]
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub retry_count: i32,
}

/// One pending notification for the counterpart of an approved comment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboundRow {
    pub id: String,
    pub comment_id: String,
    pub recipient_user_id: String,
    #[serde(skip)]
    pub created_at: DateTime<Utc>,
    #[serde(skip)]
    pub updated_at: DateTime<Utc>,
    pub retry_count: i32,
}

pub async fn init_db(pool: &AnyPool, kind: DbKind) -> Result<()> {
    let stmts = vec![
        r#"CREATE TABLE IF NOT EXISTS inbound_queue (
            id TEXT PRIMARY KEY,
            owner_user_id TEXT NOT NULL,
            platform_user_id BIGINT NOT NULL,
            chat_id BIGINT NOT NULL,
            platform_message_id BIGINT NOT NULL,
            record_id TEXT NOT NULL,
            payload TEXT NOT NULL,
            media_group_id TEXT,
            created_at INTEGER NOT NULL,
            last_attempt_at INTEGER,
            retry_count INTEGER NOT NULL DEFAULT 0,
            deleted INTEGER NOT NULL DEFAULT 0,
            lease_until INTEGER,
            UNIQUE(chat_id, platform_message_id)
        )"#,
        r#"CREATE INDEX IF NOT EXISTS idx_inbound_claim
           ON inbound_queue(deleted, retry_count, last_attempt_at, created_at)"#,
        r#"CREATE INDEX IF NOT EXISTS idx_inbound_group ON inbound_queue(media_group_id)"#,
        r#"CREATE TABLE IF NOT EXISTS outbound_queue (
            id TEXT PRIMARY KEY,
            comment_id TEXT NOT NULL,
            recipient_user_id TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            retry_count INTEGER NOT NULL DEFAULT 0,
            deleted INTEGER NOT NULL DEFAULT 0,
            lease_until INTEGER,
            UNIQUE(comment_id, recipient_user_id)
        )"#,
        r#"CREATE INDEX IF NOT EXISTS idx_outbound_claim
           ON outbound_queue(deleted, retry_count, updated_at, created_at)"#,
        r#"CREATE TABLE IF NOT EXISTS run_locks (
            name TEXT PRIMARY KEY,
            holder TEXT NOT NULL,
            expires_at INTEGER NOT NULL
        )"#,
    ];

    for stmt in stmts {
        let sql = rewrite_sql(stmt, kind);
        sqlx::query(sql.as_ref()).execute(pool).await?;
    }

    Ok(())
}

pub struct NewInbound<'a> {
    pub owner_user_id: &'a str,
    pub platform_user_id: i64,
    pub chat_id: i64,
    pub platform_message_id: i64,
    pub record_id: &'a str,
    pub payload: &'a serde_json::Value,
    pub media_group_id: Option<&'a str>,
}

/// Insert an inbound message. Redelivery of an already-seen
/// (chat, platform message) pair is a silent no-op, not an error; `None`
/// signals the duplicate.
pub async fn enqueue_inbound(
    pool: &AnyPool,
    kind: DbKind,
    new: NewInbound<'_>,
) -> Result<Option<String>> {
    let id = Uuid::new_v4().to_string();
    let sql = rewrite_sql(
        r#"INSERT INTO inbound_queue (
            id, owner_user_id, platform_user_id, chat_id, platform_message_id,
            record_id, payload, media_group_id, created_at, retry_count, deleted
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, 0, 0)
        ON CONFLICT(chat_id, platform_message_id) DO NOTHING"#,
        kind,
    );
    let result = sqlx::query(sql.as_ref())
        .bind(&id)
        .bind(new.owner_user_id)
        .bind(new.platform_user_id)
        .bind(new.chat_id)
        .bind(new.platform_message_id)
        .bind(new.record_id)
        .bind(new.payload.to_string())
        .bind(new.media_group_id)
        .bind(datetime_to_i64(Utc::now()))
        .execute(pool)
        .await?;

    if result.rows_affected() == 0 {
        return Ok(None);
    }
    Ok(Some(id))
}

fn inbound_from_row(row: &sqlx::any::AnyRow) -> Result<InboundRow> {
    let payload: String = row.try_get("payload")?;
    let created_at: i64 = row.try_get("created_at")?;
    let last_attempt_at: Option<i64> = if row.try_get_raw("last_attempt_at")?.type_info().name()
        == "NULL"
    {
        None
    } else {
        Some(row.try_get_unchecked("last_attempt_at")?)
    };
    Ok(InboundRow {
        id: row.try_get("id")?,
        owner_user_id: row.try_get("owner_user_id")?,
        platform_user_id: row.try_get("platform_user_id")?,
        chat_id: row.try_get("chat_id")?,
        platform_message_id: row.try_get("platform_message_id")?,
        record_id: row.try_get("record_id")?,
        payload: serde_json::from_str(&payload).unwrap_or(serde_json::Value::Null),
        media_group_id: if row.try_get_raw("media_group_id")?.type_info().name() == "NULL" {
            None
        } else {
            Some(row.try_get_unchecked("media_group_id")?)
        },
        created_at: i64_to_datetime(created_at),
        last_attempt_at: last_attempt_at.map(i64_to_datetime),
        retry_count: row.try_get::<i64, _>("retry_count")? as i32,
    })
}

const INBOUND_COLUMNS: &str = "id, owner_user_id, platform_user_id, chat_id, \
    platform_message_id, record_id, payload, media_group_id, created_at, \
    last_attempt_at, retry_count";

/// Select claimable rows oldest-attempt-first (never-attempted first), then
/// take a per-row lease with a conditional update. Only rows whose lease was
/// confirmed are returned; a row another run grabbed in between is skipped.
pub async fn claim_inbound_batch(
    pool: &AnyPool,
    kind: DbKind,
    max_retries: i32,
    batch_size: i64,
    lease_seconds: i64,
) -> Result<Vec<InboundRow>> {
    let now = Utc::now();
    let now_i64 = datetime_to_i64(now);
    let select = format!(
        r#"SELECT {INBOUND_COLUMNS} FROM inbound_queue
           WHERE deleted = 0 AND retry_count < ?
             AND (lease_until IS NULL OR lease_until < ?)
           ORDER BY CASE WHEN last_attempt_at IS NULL THEN 0 ELSE 1 END,
                    last_attempt_at ASC, created_at ASC
           LIMIT ?"#
    );
    let sql = rewrite_sql(&select, kind);
    let rows = sqlx::query(sql.as_ref())
        .bind(max_retries)
        .bind(now_i64)
        .bind(batch_size)
        .fetch_all(pool)
        .await?;

    let lease_until = now_i64 + lease_seconds;
    let lease_sql = rewrite_sql(
        r#"UPDATE inbound_queue SET last_attempt_at = ?, lease_until = ?
           WHERE id = ? AND deleted = 0
             AND (lease_until IS NULL OR lease_until < ?)"#,
        kind,
    );

    let mut claimed = Vec::new();
    for row in &rows {
        let mut parsed = inbound_from_row(row)?;
        let result = sqlx::query(lease_sql.as_ref())
            .bind(now_i64)
            .bind(lease_until)
            .bind(&parsed.id)
            .bind(now_i64)
            .execute(pool)
            .await?;
        if result.rows_affected() == 1 {
            parsed.last_attempt_at = Some(now);
            claimed.push(parsed);
        }
    }
    Ok(claimed)
}

/// Remove a finished row. Debug retention keeps it as a tombstone instead.
pub async fn retire_inbound(pool: &AnyPool, kind: DbKind, keep: bool, id: &str) -> Result<()> {
    let sql = if keep {
        rewrite_sql(
            "UPDATE inbound_queue SET deleted = 1, lease_until = NULL WHERE id = ?",
            kind,
        )
    } else {
        rewrite_sql("DELETE FROM inbound_queue WHERE id = ?", kind)
    };
    sqlx::query(sql.as_ref()).bind(id).execute(pool).await?;
    Ok(())
}

/// Record a failed attempt and release the lease so a later run can retry.
pub async fn mark_inbound_failed(
    pool: &AnyPool,
    kind: DbKind,
    id: &str,
    retry_count: i32,
) -> Result<()> {
    let sql = rewrite_sql(
        "UPDATE inbound_queue SET retry_count = ?, lease_until = NULL WHERE id = ?",
        kind,
    );
    sqlx::query(sql.as_ref())
        .bind(retry_count)
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Non-retired rows still carrying this media-group id. Zero means the group
/// is complete and the comment may become visible.
pub async fn count_group_siblings(
    pool: &AnyPool,
    kind: DbKind,
    media_group_id: &str,
) -> Result<i64> {
    let sql = rewrite_sql(
        "SELECT COUNT(1) FROM inbound_queue WHERE media_group_id = ? AND deleted = 0",
        kind,
    );
    let count = sqlx::query_scalar::<_, i64>(sql.as_ref())
        .bind(media_group_id)
        .fetch_one(pool)
        .await?;
    Ok(count)
}

/// Reply-context fallback: the referenced message may still be sitting in
/// the queue, not yet turned into a comment.
pub async fn find_inbound_by_message(
    pool: &AnyPool,
    kind: DbKind,
    chat_id: i64,
    platform_message_id: i64,
    owner_user_id: &str,
) -> Result<Option<InboundRow>> {
    let select = format!(
        r#"SELECT {INBOUND_COLUMNS} FROM inbound_queue
           WHERE chat_id = ? AND platform_message_id = ? AND owner_user_id = ?
             AND deleted = 0
           LIMIT 1"#
    );
    let sql = rewrite_sql(&select, kind);
    let row = sqlx::query(sql.as_ref())
        .bind(chat_id)
        .bind(platform_message_id)
        .bind(owner_user_id)
        .fetch_optional(pool)
        .await?;
    row.as_ref().map(inbound_from_row).transpose()
}

/// Insert a pending notification. Duplicate (comment, recipient) pairs are a
/// silent no-op, mirroring the inbound dedup contract.
pub async fn enqueue_outbound(
    pool: &AnyPool,
    kind: DbKind,
    comment_id: &str,
    recipient_user_id: &str,
) -> Result<Option<String>> {
    let id = Uuid::new_v4().to_string();
    let now = datetime_to_i64(Utc::now());
    let sql = rewrite_sql(
        r#"INSERT INTO outbound_queue (
            id, comment_id, recipient_user_id, created_at, updated_at, retry_count, deleted
        ) VALUES (?, ?, ?, ?, ?, 0, 0)
        ON CONFLICT(comment_id, recipient_user_id) DO NOTHING"#,
        kind,
    );
    let result = sqlx::query(sql.as_ref())
        .bind(&id)
        .bind(comment_id)
        .bind(recipient_user_id)
        .bind(now)
        .bind(now)
        .execute(pool)
        .await?;

    if result.rows_affected() == 0 {
        return Ok(None);
    }
    Ok(Some(id))
}

fn outbound_from_row(row: &sqlx::any::AnyRow) -> Result<OutboundRow> {
    let created_at: i64 = row.try_get("created_at")?;
    let updated_at: i64 = row.try_get("updated_at")?;
    Ok(OutboundRow {
        id: row.try_get("id")?,
        comment_id: row.try_get("comment_id")?,
        recipient_user_id: row.try_get("recipient_user_id")?,
        created_at: i64_to_datetime(created_at),
        updated_at: i64_to_datetime(updated_at),
        retry_count: row.try_get::<i64, _>("retry_count")? as i32,
    })
}

pub async fn claim_outbound_batch(
    pool: &AnyPool,
    kind: DbKind,
    max_retries: i32,
    batch_size: i64,
    lease_seconds: i64,
) -> Result<Vec<OutboundRow>> {
    let now_i64 = datetime_to_i64(Utc::now());
    let sql = rewrite_sql(
        r#"SELECT id, comment_id, recipient_user_id, created_at, updated_at, retry_count
           FROM outbound_queue
           WHERE deleted = 0 AND retry_count < ?
             AND (lease_until IS NULL OR lease_until < ?)
           ORDER BY updated_at ASC, created_at ASC
           LIMIT ?"#,
        kind,
    );
    let rows = sqlx::query(sql.as_ref())
        .bind(max_retries)
        .bind(now_i64)
        .bind(batch_size)
        .fetch_all(pool)
        .await?;

    let lease_until = now_i64 + lease_seconds;
    let lease_sql = rewrite_sql(
        r#"UPDATE outbound_queue SET updated_at = ?, lease_until = ?
           WHERE id = ? AND deleted = 0
             AND (lease_until IS NULL OR lease_until < ?)"#,
        kind,
    );

    let mut claimed = Vec::new();
    for row in &rows {
        let parsed = outbound_from_row(row)?;
        let result = sqlx::query(lease_sql.as_ref())
            .bind(now_i64)
            .bind(lease_until)
            .bind(&parsed.id)
            .bind(now_i64)
            .execute(pool)
            .await?;
        if result.rows_affected() == 1 {
            claimed.push(parsed);
        }
    }
    Ok(claimed)
}

pub async fn retire_outbound(pool: &AnyPool, kind: DbKind, keep: bool, id: &str) -> Result<()> {
    let sql = if keep {
        rewrite_sql(
            "UPDATE outbound_queue SET deleted = 1, lease_until = NULL WHERE id = ?",
            kind,
        )
    } else {
        rewrite_sql("DELETE FROM outbound_queue WHERE id = ?", kind)
    };
    sqlx::query(sql.as_ref()).bind(id).execute(pool).await?;
    Ok(())
}

pub async fn mark_outbound_failed(
    pool: &AnyPool,
    kind: DbKind,
    id: &str,
    retry_count: i32,
) -> Result<()> {
    let now = datetime_to_i64(Utc::now());
    let sql = rewrite_sql(
        "UPDATE outbound_queue SET retry_count = ?, updated_at = ?, lease_until = NULL WHERE id = ?",
        kind,
    );
    sqlx::query(sql.as_ref())
        .bind(retry_count)
        .bind(now)
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Take the coarse per-pipeline lock. Expired locks are purged first, then a
/// plain conflict-guarded insert decides the winner.
pub async fn acquire_run_lock(
    pool: &AnyPool,
    kind: DbKind,
    name: &str,
    holder: &str,
    lease_seconds: i64,
) -> Result<bool> {
    let now = datetime_to_i64(Utc::now());

    let purge = rewrite_sql(
        "DELETE FROM run_locks WHERE name = ? AND expires_at < ?",
        kind,
    );
    sqlx::query(purge.as_ref())
        .bind(name)
        .bind(now)
        .execute(pool)
        .await?;

    let insert = rewrite_sql(
        r#"INSERT INTO run_locks (name, holder, expires_at) VALUES (?, ?, ?)
           ON CONFLICT(name) DO NOTHING"#,
        kind,
    );
    let result = sqlx::query(insert.as_ref())
        .bind(name)
        .bind(holder)
        .bind(now + lease_seconds)
        .execute(pool)
        .await?;

    Ok(result.rows_affected() == 1)
}

pub async fn release_run_lock(pool: &AnyPool, kind: DbKind, name: &str, holder: &str) -> Result<()> {
    let sql = rewrite_sql(
        "DELETE FROM run_locks WHERE name = ? AND holder = ?",
        kind,
    );
    sqlx::query(sql.as_ref())
        .bind(name)
        .bind(holder)
        .execute(pool)
        .await?;
    Ok(())
}
