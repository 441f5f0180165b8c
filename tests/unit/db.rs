use consult_relay::db::{
    acquire_run_lock, claim_inbound_batch, claim_outbound_batch, count_group_siblings,
    db_kind_from_url, enqueue_inbound, enqueue_outbound, find_inbound_by_message, init_db,
    install_drivers, mark_inbound_failed, release_run_lock, retire_inbound, retire_outbound,
    rewrite_sql, DbKind, NewInbound,
};
use serde_json::json;
use sqlx::any::AnyPoolOptions;
use sqlx::AnyPool;

async fn test_pool() -> AnyPool {
    install_drivers();
    let pool = AnyPoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .expect("connect sqlite memory");
    init_db(&pool, DbKind::Sqlite).await.expect("init schema");
    pool
}

fn new_inbound<'a>(
    chat_id: i64,
    message_id: i64,
    payload: &'a serde_json::Value,
    media_group_id: Option<&'a str>,
) -> NewInbound<'a> {
    NewInbound {
        owner_user_id: "u1",
        platform_user_id: 77,
        chat_id,
        platform_message_id: message_id,
        record_id: "r42",
        payload,
        media_group_id,
    }
}

#[test]
fn test_db_kind_detection() {
    assert_eq!(db_kind_from_url("sqlite::memory:"), DbKind::Sqlite);
    assert_eq!(db_kind_from_url("postgres://h/db"), DbKind::Postgres);
}

#[test]
fn test_rewrite_sql_placeholders() {
    assert_eq!(
        rewrite_sql("INSERT INTO t VALUES (?, ?, ?)", DbKind::Postgres).as_ref(),
        "INSERT INTO t VALUES ($1, $2, $3)"
    );
}

#[tokio::test]
async fn test_enqueue_inbound_dedupes_on_chat_and_message() {
    let pool = test_pool().await;
    let payload = json!({"text": "hi"});

    let first = enqueue_inbound(&pool, DbKind::Sqlite, new_inbound(555, 10, &payload, None))
        .await
        .unwrap();
    assert!(first.is_some());

    let second = enqueue_inbound(&pool, DbKind::Sqlite, new_inbound(555, 10, &payload, None))
        .await
        .unwrap();
    assert!(second.is_none(), "redelivery must be a silent no-op");

    let batch = claim_inbound_batch(&pool, DbKind::Sqlite, 5, 10, 300)
        .await
        .unwrap();
    assert_eq!(batch.len(), 1);
}

#[tokio::test]
async fn test_same_message_id_different_chats_both_stored() {
    let pool = test_pool().await;
    let payload = json!({"text": "hi"});
    assert!(enqueue_inbound(&pool, DbKind::Sqlite, new_inbound(555, 10, &payload, None))
        .await
        .unwrap()
        .is_some());
    assert!(enqueue_inbound(&pool, DbKind::Sqlite, new_inbound(556, 10, &payload, None))
        .await
        .unwrap()
        .is_some());
}

#[tokio::test]
async fn test_claim_respects_lease() {
    let pool = test_pool().await;
    let payload = json!({"text": "hi"});
    enqueue_inbound(&pool, DbKind::Sqlite, new_inbound(555, 10, &payload, None))
        .await
        .unwrap();

    let first = claim_inbound_batch(&pool, DbKind::Sqlite, 5, 10, 300)
        .await
        .unwrap();
    assert_eq!(first.len(), 1);

    // Leased row is invisible to an overlapping run.
    let second = claim_inbound_batch(&pool, DbKind::Sqlite, 5, 10, 300)
        .await
        .unwrap();
    assert!(second.is_empty());
}

#[tokio::test]
async fn test_expired_lease_is_reclaimable() {
    let pool = test_pool().await;
    let payload = json!({"text": "hi"});
    enqueue_inbound(&pool, DbKind::Sqlite, new_inbound(555, 10, &payload, None))
        .await
        .unwrap();

    // Zero-length lease expires immediately.
    let first = claim_inbound_batch(&pool, DbKind::Sqlite, 5, 10, -1)
        .await
        .unwrap();
    assert_eq!(first.len(), 1);

    let second = claim_inbound_batch(&pool, DbKind::Sqlite, 5, 10, 300)
        .await
        .unwrap();
    assert_eq!(second.len(), 1);
}

#[tokio::test]
async fn test_claim_skips_exhausted_rows() {
    let pool = test_pool().await;
    let payload = json!({"text": "hi"});
    enqueue_inbound(&pool, DbKind::Sqlite, new_inbound(555, 10, &payload, None))
        .await
        .unwrap();

    let batch = claim_inbound_batch(&pool, DbKind::Sqlite, 3, 10, -1)
        .await
        .unwrap();
    mark_inbound_failed(&pool, DbKind::Sqlite, &batch[0].id, 3)
        .await
        .unwrap();

    let after = claim_inbound_batch(&pool, DbKind::Sqlite, 3, 10, 300)
        .await
        .unwrap();
    assert!(after.is_empty(), "row at max retries must never be claimed");
}

#[tokio::test]
async fn test_never_attempted_rows_claimed_first() {
    let pool = test_pool().await;
    let payload = json!({"text": "hi"});
    enqueue_inbound(&pool, DbKind::Sqlite, new_inbound(555, 1, &payload, None))
        .await
        .unwrap();
    enqueue_inbound(&pool, DbKind::Sqlite, new_inbound(555, 2, &payload, None))
        .await
        .unwrap();

    // First claim stamps an attempt on one row; the next single-row claim
    // must pick the still-unattempted sibling.
    let first = claim_inbound_batch(&pool, DbKind::Sqlite, 5, 1, -1)
        .await
        .unwrap();
    assert_eq!(first.len(), 1);
    mark_inbound_failed(&pool, DbKind::Sqlite, &first[0].id, 1)
        .await
        .unwrap();

    let second = claim_inbound_batch(&pool, DbKind::Sqlite, 5, 1, -1)
        .await
        .unwrap();
    assert_eq!(second.len(), 1);
    assert_ne!(
        second[0].platform_message_id, first[0].platform_message_id,
        "unattempted row should be preferred over a retried one"
    );
}

#[tokio::test]
async fn test_retire_inbound_soft_and_hard() {
    let pool = test_pool().await;
    let payload = json!({"text": "hi"});
    let id1 = enqueue_inbound(&pool, DbKind::Sqlite, new_inbound(555, 1, &payload, None))
        .await
        .unwrap()
        .unwrap();
    let id2 = enqueue_inbound(&pool, DbKind::Sqlite, new_inbound(555, 2, &payload, None))
        .await
        .unwrap()
        .unwrap();

    retire_inbound(&pool, DbKind::Sqlite, true, &id1).await.unwrap();
    retire_inbound(&pool, DbKind::Sqlite, false, &id2).await.unwrap();

    let batch = claim_inbound_batch(&pool, DbKind::Sqlite, 5, 10, 300)
        .await
        .unwrap();
    assert!(batch.is_empty(), "both retire flavors hide the row");

    // Soft-deleted row still exists for forensics, hard-deleted does not.
    let count = sqlx::query_scalar::<_, i64>("SELECT COUNT(1) FROM inbound_queue")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(count, 1);
}

#[tokio::test]
async fn test_group_sibling_count_ignores_retired() {
    let pool = test_pool().await;
    let payload = json!({"caption": "g"});
    let id1 = enqueue_inbound(&pool, DbKind::Sqlite, new_inbound(555, 1, &payload, Some("g7")))
        .await
        .unwrap()
        .unwrap();
    enqueue_inbound(&pool, DbKind::Sqlite, new_inbound(555, 2, &payload, Some("g7")))
        .await
        .unwrap();

    assert_eq!(count_group_siblings(&pool, DbKind::Sqlite, "g7").await.unwrap(), 2);
    retire_inbound(&pool, DbKind::Sqlite, true, &id1).await.unwrap();
    assert_eq!(count_group_siblings(&pool, DbKind::Sqlite, "g7").await.unwrap(), 1);
}

#[tokio::test]
async fn test_find_inbound_by_message_scoped_to_owner() {
    let pool = test_pool().await;
    let payload = json!({"text": "hi"});
    enqueue_inbound(&pool, DbKind::Sqlite, new_inbound(555, 10, &payload, None))
        .await
        .unwrap();

    let found = find_inbound_by_message(&pool, DbKind::Sqlite, 555, 10, "u1")
        .await
        .unwrap();
    assert_eq!(found.unwrap().record_id, "r42");

    let other_owner = find_inbound_by_message(&pool, DbKind::Sqlite, 555, 10, "u2")
        .await
        .unwrap();
    assert!(other_owner.is_none());
}

#[tokio::test]
async fn test_enqueue_outbound_dedupes_on_comment_and_recipient() {
    let pool = test_pool().await;
    assert!(enqueue_outbound(&pool, DbKind::Sqlite, "c1", "u2")
        .await
        .unwrap()
        .is_some());
    assert!(enqueue_outbound(&pool, DbKind::Sqlite, "c1", "u2")
        .await
        .unwrap()
        .is_none());
    assert!(enqueue_outbound(&pool, DbKind::Sqlite, "c1", "u3")
        .await
        .unwrap()
        .is_some());

    let batch = claim_outbound_batch(&pool, DbKind::Sqlite, 5, 10, 300)
        .await
        .unwrap();
    assert_eq!(batch.len(), 2);
}

#[tokio::test]
async fn test_retire_outbound_removes_from_claims() {
    let pool = test_pool().await;
    let id = enqueue_outbound(&pool, DbKind::Sqlite, "c1", "u2")
        .await
        .unwrap()
        .unwrap();
    retire_outbound(&pool, DbKind::Sqlite, false, &id).await.unwrap();
    let batch = claim_outbound_batch(&pool, DbKind::Sqlite, 5, 10, 300)
        .await
        .unwrap();
    assert!(batch.is_empty());
}

#[tokio::test]
async fn test_run_lock_exclusive_until_released() {
    let pool = test_pool().await;
    assert!(acquire_run_lock(&pool, DbKind::Sqlite, "stage", "holder-a", 120)
        .await
        .unwrap());
    assert!(!acquire_run_lock(&pool, DbKind::Sqlite, "stage", "holder-b", 120)
        .await
        .unwrap());

    release_run_lock(&pool, DbKind::Sqlite, "stage", "holder-a")
        .await
        .unwrap();
    assert!(acquire_run_lock(&pool, DbKind::Sqlite, "stage", "holder-b", 120)
        .await
        .unwrap());
}

#[tokio::test]
async fn test_run_lock_expired_is_stealable() {
    let pool = test_pool().await;
    assert!(acquire_run_lock(&pool, DbKind::Sqlite, "stage", "crashed", -1)
        .await
        .unwrap());
    assert!(acquire_run_lock(&pool, DbKind::Sqlite, "stage", "fresh", 120)
        .await
        .unwrap());
}

#[tokio::test]
async fn test_independent_lock_names() {
    let pool = test_pool().await;
    assert!(acquire_run_lock(&pool, DbKind::Sqlite, "inbound", "a", 120)
        .await
        .unwrap());
    assert!(acquire_run_lock(&pool, DbKind::Sqlite, "outbound", "b", 120)
        .await
        .unwrap());
}
