use async_trait::async_trait;
use consult_relay::config::Config;
use consult_relay::db::{self, DbKind, NewInbound};
use consult_relay::error::RelayError;
use consult_relay::store::memory::MemoryStore;
use consult_relay::store::{
    Collaborators, Comment, CommentStatus, CommentStore, Consultation, NewComment, PlatformRef,
    UserProfile,
};
use consult_relay::{IngestOutcome, RelayCore};
use serde_json::json;
use sqlx::any::AnyPoolOptions;
use sqlx::AnyPool;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

async fn test_pool() -> AnyPool {
    db::install_drivers();
    let pool = AnyPoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .expect("connect sqlite memory");
    db::init_db(&pool, DbKind::Sqlite).await.expect("init schema");
    pool
}

fn test_config(api_base: &str) -> Config {
    let mut cfg = Config::default();
    cfg.bot.token = "testtoken".to_string();
    cfg.bot.api_base = api_base.to_string();
    cfg
}

fn seed_two_party(store: &Arc<MemoryStore>) {
    store.insert_user(
        UserProfile {
            id: "u-doc".into(),
            display_name: "Dr. Ana".into(),
            chat_id: Some(900),
        },
        Some(77),
    );
    store.insert_user(
        UserProfile {
            id: "u-pat".into(),
            display_name: "Pavel".into(),
            chat_id: Some(901),
        },
        Some(78),
    );
    store.insert_consultation(Consultation {
        id: "r42".into(),
        title: "Knee pain".into(),
        doctor_id: Some("u-doc".into()),
        client_id: Some("u-pat".into()),
        active: true,
    });
}

async fn mock_platform(server: &MockServer) {
    Mock::given(method("POST"))
        .and(path("/bottesttoken/setMessageReaction"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"ok": true, "result": true})))
        .mount(server)
        .await;
    Mock::given(method("POST"))
        .and(path("/bottesttoken/getFile"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "ok": true,
            "result": {"file_path": "photos/file.jpg"}
        })))
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path("/file/bottesttoken/photos/file.jpg"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"jpegbytes".to_vec()))
        .mount(server)
        .await;
}

fn text_update(message_id: i64, text: &str) -> serde_json::Value {
    json!({
        "update_id": message_id,
        "message": {
            "message_id": message_id,
            "from": {"id": 77, "is_bot": false, "first_name": "Ana"},
            "chat": {"id": 555, "type": "private"},
            "date": 1700000000,
            "text": text
        }
    })
}

fn photo_update(message_id: i64, group: &str, caption: Option<&str>) -> serde_json::Value {
    let mut msg = json!({
        "message_id": message_id,
        "from": {"id": 77, "is_bot": false, "first_name": "Ana"},
        "chat": {"id": 555, "type": "private"},
        "date": 1700000000,
        "media_group_id": group,
        "photo": [
            {"file_id": format!("small-{message_id}"), "file_unique_id": format!("us-{message_id}"),
             "width": 90, "height": 90},
            {"file_id": format!("large-{message_id}"), "file_unique_id": format!("ul-{message_id}"),
             "width": 800, "height": 800}
        ]
    });
    if let Some(caption) = caption {
        msg["caption"] = json!(caption);
    }
    json!({"update_id": message_id, "message": msg})
}

#[tokio::test]
async fn test_text_only_message_becomes_approved_comment() {
    let server = MockServer::start().await;
    mock_platform(&server).await;
    let pool = test_pool().await;
    let store = MemoryStore::new();
    seed_two_party(&store);
    let core = RelayCore::with_pool(
        test_config(&server.uri()),
        pool.clone(),
        DbKind::Sqlite,
        store.collaborators(),
    )
    .unwrap();

    let outcome = core
        .process_single_update(&text_update(10, "hello doctor"))
        .await
        .unwrap();
    assert!(matches!(outcome, IngestOutcome::Enqueued(_)));

    let report = core.run_inbound_batch().await.unwrap();
    assert_eq!(report.claimed, 1);
    assert_eq!(report.done, 1);

    let comments = store.comments_for("r42");
    assert_eq!(comments.len(), 1);
    assert_eq!(comments[0].content, "hello doctor");
    assert_eq!(comments[0].status, CommentStatus::Approved);
    assert!(comments[0].attachment_ids.is_empty());
    assert_eq!(
        comments[0].inbound_refs,
        vec![PlatformRef {
            chat_id: 555,
            message_id: 10
        }]
    );

    // The router queued a notification for the counterpart.
    let outbound = db::claim_outbound_batch(&pool, DbKind::Sqlite, 5, 10, 300)
        .await
        .unwrap();
    assert_eq!(outbound.len(), 1);
    assert_eq!(outbound[0].recipient_user_id, "u-pat");

    // The inbound queue is drained.
    let inbound = db::claim_inbound_batch(&pool, DbKind::Sqlite, 5, 10, 300)
        .await
        .unwrap();
    assert!(inbound.is_empty());
}

#[tokio::test]
async fn test_redelivered_update_is_duplicate() {
    let server = MockServer::start().await;
    mock_platform(&server).await;
    let pool = test_pool().await;
    let store = MemoryStore::new();
    seed_two_party(&store);
    let core = RelayCore::with_pool(
        test_config(&server.uri()),
        pool,
        DbKind::Sqlite,
        store.collaborators(),
    )
    .unwrap();

    let update = text_update(10, "hello");
    assert!(matches!(
        core.process_single_update(&update).await.unwrap(),
        IngestOutcome::Enqueued(_)
    ));
    assert_eq!(
        core.process_single_update(&update).await.unwrap(),
        IngestOutcome::Duplicate
    );
}

#[tokio::test]
async fn test_reprocessing_does_not_create_second_comment() {
    let server = MockServer::start().await;
    mock_platform(&server).await;
    let pool = test_pool().await;
    let store = MemoryStore::new();
    seed_two_party(&store);
    let core = RelayCore::with_pool(
        test_config(&server.uri()),
        pool.clone(),
        DbKind::Sqlite,
        store.collaborators(),
    )
    .unwrap();

    // Simulate a crash after the comment upsert but before the queue row was
    // retired: the comment exists, the row is still claimable.
    CommentStore::create(
        store.as_ref(),
        NewComment {
            author_id: "u-doc".into(),
            record_id: "r42".into(),
            content: "hello".into(),
            media_group_id: None,
            inbound_ref: PlatformRef {
                chat_id: 555,
                message_id: 10,
            },
            attachment_ids: vec![],
        },
    )
    .await
    .unwrap();
    db::enqueue_inbound(
        &pool,
        DbKind::Sqlite,
        NewInbound {
            owner_user_id: "u-doc",
            platform_user_id: 77,
            chat_id: 555,
            platform_message_id: 10,
            record_id: "r42",
            payload: &json!({"text": "hello"}),
            media_group_id: None,
        },
    )
    .await
    .unwrap();

    let report = core.run_inbound_batch().await.unwrap();
    assert_eq!(report.done, 1);
    assert_eq!(store.comments_for("r42").len(), 1, "no duplicate comment");
}

#[tokio::test]
async fn test_media_group_closes_only_after_all_siblings() {
    let server = MockServer::start().await;
    mock_platform(&server).await;
    let pool = test_pool().await;
    let store = MemoryStore::new();
    seed_two_party(&store);

    let mut cfg = test_config(&server.uri());
    cfg.queue.batch_size = 2;
    let core = RelayCore::with_pool(cfg, pool, DbKind::Sqlite, store.collaborators()).unwrap();

    for message_id in [21, 22, 23] {
        let caption = (message_id == 21).then_some("the whole set");
        let outcome = core
            .process_single_update(&photo_update(message_id, "g1", caption))
            .await
            .unwrap();
        assert!(matches!(outcome, IngestOutcome::Enqueued(_)));
    }

    // First run consumes two of three siblings: the comment must exist but
    // stay pending.
    let report = core.run_inbound_batch().await.unwrap();
    assert_eq!(report.done, 2);
    let comments = store.comments_for("r42");
    assert_eq!(comments.len(), 1);
    assert_eq!(comments[0].status, CommentStatus::Pending);
    assert_eq!(comments[0].attachment_ids.len(), 2);

    // Second run consumes the last sibling and closes the group.
    let report = core.run_inbound_batch().await.unwrap();
    assert_eq!(report.done, 1);
    let comments = store.comments_for("r42");
    assert_eq!(comments.len(), 1, "siblings merged into one comment");
    assert_eq!(comments[0].status, CommentStatus::Approved);
    assert_eq!(comments[0].attachment_ids.len(), 3);
    assert_eq!(comments[0].inbound_refs.len(), 3);
}

/// Delegating comment store whose `create` fails a configured number of
/// times, for exercising the retry path.
struct FlakyComments {
    inner: Arc<MemoryStore>,
    failures_left: AtomicUsize,
}

#[async_trait]
impl CommentStore for FlakyComments {
    async fn create(&self, new: NewComment) -> consult_relay::error::Result<Comment> {
        if self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(RelayError::Internal("comment store unavailable".into()));
        }
        self.inner.create(new).await
    }

    async fn get(&self, id: &str) -> consult_relay::error::Result<Option<Comment>> {
        self.inner.get(id).await
    }

    async fn find_pending_group_comment(
        &self,
        record_id: &str,
        author_id: &str,
        media_group_id: &str,
    ) -> consult_relay::error::Result<Option<Comment>> {
        self.inner
            .find_pending_group_comment(record_id, author_id, media_group_id)
            .await
    }

    async fn append_attachments(
        &self,
        id: &str,
        attachment_ids: &[String],
    ) -> consult_relay::error::Result<()> {
        self.inner.append_attachments(id, attachment_ids).await
    }

    async fn set_content(&self, id: &str, content: &str) -> consult_relay::error::Result<()> {
        self.inner.set_content(id, content).await
    }

    async fn add_inbound_ref(
        &self,
        id: &str,
        platform_ref: PlatformRef,
    ) -> consult_relay::error::Result<()> {
        self.inner.add_inbound_ref(id, platform_ref).await
    }

    async fn add_outbound_refs(
        &self,
        id: &str,
        chat_id: i64,
        message_ids: &[i64],
    ) -> consult_relay::error::Result<()> {
        self.inner.add_outbound_refs(id, chat_id, message_ids).await
    }

    async fn approve_pending(&self, id: &str) -> consult_relay::error::Result<bool> {
        self.inner.approve_pending(id).await
    }

    async fn find_by_inbound_ref(
        &self,
        chat_id: i64,
        message_id: i64,
    ) -> consult_relay::error::Result<Option<Comment>> {
        self.inner.find_by_inbound_ref(chat_id, message_id).await
    }

    async fn find_by_outbound_ref(
        &self,
        chat_id: i64,
        message_id: i64,
    ) -> consult_relay::error::Result<Option<Comment>> {
        self.inner.find_by_outbound_ref(chat_id, message_id).await
    }
}

#[tokio::test]
async fn test_retry_exhaustion_degrades_to_attachmentless_comment() {
    let server = MockServer::start().await;
    mock_platform(&server).await;
    let pool = test_pool().await;
    let store = MemoryStore::new();
    seed_two_party(&store);

    let flaky = Arc::new(FlakyComments {
        inner: store.clone(),
        failures_left: AtomicUsize::new(1),
    });
    let stores = Collaborators {
        comments: flaky,
        records: store.clone(),
        users: store.clone(),
        media: store.clone(),
    };

    let mut cfg = test_config(&server.uri());
    cfg.queue.max_retries = 1;
    let core = RelayCore::with_pool(cfg, pool.clone(), DbKind::Sqlite, stores).unwrap();

    let outcome = core
        .process_single_update(&photo_update(30, "g9", Some("with a photo")))
        .await
        .unwrap();
    assert!(matches!(outcome, IngestOutcome::Enqueued(_)));

    let report = core.run_inbound_batch().await.unwrap();
    assert_eq!(report.degraded, 1);

    let comments = store.comments_for("r42");
    assert_eq!(comments.len(), 1);
    assert_eq!(comments[0].content, "with a photo");
    assert!(
        comments[0].attachment_ids.is_empty(),
        "degraded comment carries no attachments"
    );
    assert_eq!(comments[0].status, CommentStatus::Approved);
    assert_eq!(
        store.attachment_count(),
        0,
        "media from the failed attempt was cleaned up"
    );

    // The row is gone: nothing left to claim.
    let inbound = db::claim_inbound_batch(&pool, DbKind::Sqlite, 5, 10, 300)
        .await
        .unwrap();
    assert!(inbound.is_empty());
}

#[tokio::test]
async fn test_malformed_payload_is_dead_lettered() {
    let server = MockServer::start().await;
    mock_platform(&server).await;
    let pool = test_pool().await;
    let store = MemoryStore::new();
    seed_two_party(&store);
    let core = RelayCore::with_pool(
        test_config(&server.uri()),
        pool.clone(),
        DbKind::Sqlite,
        store.collaborators(),
    )
    .unwrap();

    db::enqueue_inbound(
        &pool,
        DbKind::Sqlite,
        NewInbound {
            owner_user_id: "u-doc",
            platform_user_id: 77,
            chat_id: 555,
            platform_message_id: 40,
            record_id: "r42",
            payload: &json!("not an object"),
            media_group_id: None,
        },
    )
    .await
    .unwrap();

    let report = core.run_inbound_batch().await.unwrap();
    assert_eq!(report.dead_lettered, 1);
    assert!(store.comments_for("r42").is_empty());

    let inbound = db::claim_inbound_batch(&pool, DbKind::Sqlite, 5, 10, 300)
        .await
        .unwrap();
    assert!(inbound.is_empty(), "dead-lettered row is not retried");
}

#[tokio::test]
async fn test_unknown_platform_user_ignored() {
    let server = MockServer::start().await;
    mock_platform(&server).await;
    let pool = test_pool().await;
    let store = MemoryStore::new();
    seed_two_party(&store);
    let core = RelayCore::with_pool(
        test_config(&server.uri()),
        pool,
        DbKind::Sqlite,
        store.collaborators(),
    )
    .unwrap();

    let update = json!({
        "update_id": 1,
        "message": {
            "message_id": 50,
            "from": {"id": 999999, "is_bot": false, "first_name": "Stranger"},
            "chat": {"id": 777, "type": "private"},
            "date": 1700000000,
            "text": "who am i"
        }
    });
    assert_eq!(
        core.process_single_update(&update).await.unwrap(),
        IngestOutcome::UnknownUser
    );
}

#[tokio::test]
async fn test_no_active_consultation_rejected() {
    let server = MockServer::start().await;
    mock_platform(&server).await;
    let pool = test_pool().await;
    let store = MemoryStore::new();
    store.insert_user(
        UserProfile {
            id: "u-doc".into(),
            display_name: "Dr. Ana".into(),
            chat_id: Some(900),
        },
        Some(77),
    );
    // No consultation at all.
    let core = RelayCore::with_pool(
        test_config(&server.uri()),
        pool,
        DbKind::Sqlite,
        store.collaborators(),
    )
    .unwrap();

    assert_eq!(
        core.process_single_update(&text_update(60, "hi")).await.unwrap(),
        IngestOutcome::NoTargetRecord
    );
}

#[tokio::test]
async fn test_edited_message_and_callback_pass_through() {
    let server = MockServer::start().await;
    let pool = test_pool().await;
    let store = MemoryStore::new();
    let core = RelayCore::with_pool(
        test_config(&server.uri()),
        pool,
        DbKind::Sqlite,
        store.collaborators(),
    )
    .unwrap();

    let edited = json!({
        "update_id": 1,
        "edited_message": {
            "message_id": 10,
            "from": {"id": 77},
            "chat": {"id": 555, "type": "private"},
            "date": 1700000000,
            "text": "edited"
        }
    });
    assert_eq!(
        core.process_single_update(&edited).await.unwrap(),
        IngestOutcome::Ignored
    );

    let callback = json!({
        "update_id": 2,
        "callback_query": {"id": "cb", "from": {"id": 77}, "data": "x"}
    });
    assert_eq!(
        core.process_single_update(&callback).await.unwrap(),
        IngestOutcome::Ignored
    );
}
