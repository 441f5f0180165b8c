pub mod config;
pub mod db;
pub mod error;
pub mod notifier;
pub mod processor;
pub mod reply;
pub mod router;
pub mod sanitize;
pub mod store;
pub mod telegram;
pub mod types;

pub use config::Config;

use crate::config::{load_config, resolve_database_url};
use crate::db::{db_kind_from_url, DbKind, NewInbound};
use crate::error::Result;
use crate::notifier::{Notifier, NotifierReport};
use crate::processor::{BatchReport, Processor};
use crate::reply::{resolve_reply_target, ReplyLookup};
use crate::store::Collaborators;
use crate::telegram::{BotClient, REACTION_FAIL};
use crate::types::{parse_update, IncomingMessage, Update};

use serde_json::Value;
use sqlx::AnyPool;
use tracing::{debug, error};

const POLL_LIMIT: i64 = 100;
const POLL_TIMEOUT_SECONDS: u64 = 20;

/// What happened to one ingested update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestOutcome {
    /// Stored for the processor; carries the queue row id.
    Enqueued(String),
    /// Redelivery of an already-stored (chat, message) pair.
    Duplicate,
    /// The sender has no linked account.
    UnknownUser,
    /// No reply context and no active consultation to attach to.
    NoTargetRecord,
    /// Edited messages, callbacks, and unrecognized update kinds.
    Ignored,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    /// getUpdates answered 409: an active webhook owns the stream, stop
    /// polling.
    Conflict,
    Processed { count: usize, next_offset: Option<i64> },
}

/// The relay core: owns the two queue tables and drives the pipeline
/// between the platform and the external comment/record/user/media
/// collaborators. The external caller invokes the entry points on webhook
/// delivery or on a timer; configuration is supplied at construction and
/// refreshed by rebuilding.
#[derive(Clone)]
pub struct RelayCore {
    pub config: Config,
    pub pool: AnyPool,
    pub db_kind: DbKind,
    pub bot: BotClient,
    pub stores: Collaborators,
}

impl RelayCore {
    /// Connect using the file/env configuration.
    pub async fn connect(stores: Collaborators) -> anyhow::Result<Self> {
        let config = load_config();
        Self::connect_with(config, stores).await
    }

    pub async fn connect_with(config: Config, stores: Collaborators) -> anyhow::Result<Self> {
        db::install_drivers();
        let db_url = resolve_database_url(&config);
        let db_kind = db_kind_from_url(&db_url);
        let pool = AnyPool::connect(&db_url).await?;
        db::init_db(&pool, db_kind).await?;
        let bot = BotClient::new(&config.bot)?;
        Ok(Self {
            config,
            pool,
            db_kind,
            bot,
            stores,
        })
    }

    /// Build on an already-connected pool. Used by tests.
    pub fn with_pool(
        config: Config,
        pool: AnyPool,
        db_kind: DbKind,
        stores: Collaborators,
    ) -> Result<Self> {
        let bot = BotClient::new(&config.bot)?;
        Ok(Self {
            config,
            pool,
            db_kind,
            bot,
            stores,
        })
    }

    pub fn processor(&self) -> Processor {
        Processor::new(
            self.pool.clone(),
            self.db_kind,
            self.bot.clone(),
            self.stores.clone(),
            self.config.queue.clone(),
        )
    }

    pub fn notifier(&self) -> Notifier {
        Notifier::new(
            self.pool.clone(),
            self.db_kind,
            self.bot.clone(),
            self.stores.clone(),
            self.config.queue.clone(),
            self.config.bot.direct_upload,
        )
    }

    /// Timer entry point: drain one inbound batch.
    pub async fn run_inbound_batch(&self) -> anyhow::Result<BatchReport> {
        self.processor().run_batch().await
    }

    /// Timer entry point: drain one outbound batch.
    pub async fn run_outbound_batch(&self) -> anyhow::Result<NotifierReport> {
        self.notifier().run_batch().await
    }

    /// External approval hook: the comment store flipped a comment to
    /// approved outside the processor (e.g. a moderator in the CMS).
    pub async fn comment_approved(&self, comment_id: &str) -> Result<Option<String>> {
        router::route_approved_comment(&self.pool, self.db_kind, &self.stores, comment_id).await
    }

    /// Webhook/poller entry point: dispatch one raw update by kind.
    pub async fn process_single_update(&self, update: &Value) -> Result<IngestOutcome> {
        match parse_update(update) {
            Update::Message(message) => self.ingest_message(message).await,
            Update::EditedMessage { chat_id, message_id } => {
                debug!("ignoring edit of message {chat_id}/{message_id}");
                Ok(IngestOutcome::Ignored)
            }
            Update::Callback { callback_id, .. } => {
                debug!("ignoring callback {callback_id}");
                Ok(IngestOutcome::Ignored)
            }
            Update::Unknown => Ok(IngestOutcome::Ignored),
        }
    }

    async fn ingest_message(&self, message: IncomingMessage) -> Result<IngestOutcome> {
        let Some(user) = self.stores.users.by_platform_id(message.from_user_id).await? else {
            debug!(
                "message {}/{} from unlinked platform user {}, ignoring",
                message.chat_id, message.message_id, message.from_user_id
            );
            return Ok(IngestOutcome::UnknownUser);
        };

        let mut record_id = None;
        if let Some(reply) = message.reply_to {
            record_id = resolve_reply_target(
                &self.pool,
                self.db_kind,
                &self.stores,
                ReplyLookup {
                    replying_user_id: &user.id,
                    replying_platform_id: message.from_user_id,
                    chat_id: message.chat_id,
                    replied_message_id: reply.message_id,
                    replied_author_platform_id: reply.from_user_id,
                },
            )
            .await?;
        }

        let record_id = match record_id {
            Some(id) => id,
            None => match self.stores.records.active_consultation_for(&user.id).await? {
                Some(consultation) => consultation.id,
                None => {
                    debug!(
                        "no active consultation for user {}, rejecting message {}/{}",
                        user.id, message.chat_id, message.message_id
                    );
                    self.bot
                        .set_reaction(message.chat_id, message.message_id, REACTION_FAIL)
                        .await;
                    return Ok(IngestOutcome::NoTargetRecord);
                }
            },
        };

        let queued = db::enqueue_inbound(
            &self.pool,
            self.db_kind,
            NewInbound {
                owner_user_id: &user.id,
                platform_user_id: message.from_user_id,
                chat_id: message.chat_id,
                platform_message_id: message.message_id,
                record_id: &record_id,
                payload: &message.raw,
                media_group_id: message.media_group_id.as_deref(),
            },
        )
        .await?;

        Ok(match queued {
            Some(id) => IngestOutcome::Enqueued(id),
            None => IngestOutcome::Duplicate,
        })
    }

    /// Poll one getUpdates page and feed every update through the
    /// dispatcher. A 409 means an active webhook owns the stream; the caller
    /// must stop polling instead of retrying.
    pub async fn poll_updates_once(&self, offset: Option<i64>) -> anyhow::Result<PollOutcome> {
        let updates = match self
            .bot
            .get_updates(offset, POLL_LIMIT, POLL_TIMEOUT_SECONDS)
            .await
        {
            Ok(updates) => updates,
            Err(err) if err.is_poll_conflict() => {
                error!("getUpdates conflict, polling disabled: {err}");
                return Ok(PollOutcome::Conflict);
            }
            Err(err) => return Err(err.into()),
        };

        let mut next_offset = offset;
        let count = updates.len();
        for update in &updates {
            if let Some(update_id) = update.get("update_id").and_then(|v| v.as_i64()) {
                next_offset = Some(update_id + 1);
            }
            if let Err(err) = self.process_single_update(update).await {
                error!("processing update failed: {err}");
            }
        }

        Ok(PollOutcome::Processed { count, next_offset })
    }
}
