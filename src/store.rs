use crate::error::{RelayError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;

/// Comment visibility in the external store. The only legal transition is
/// pending to approved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommentStatus {
    Pending,
    Approved,
}

/// A platform chat/message pair linked to a comment, in either direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlatformRef {
    pub chat_id: i64,
    pub message_id: i64,
}

#[derive(Debug, Clone)]
pub struct Comment {
    pub id: String,
    pub author_id: String,
    pub record_id: String,
    pub content: String,
    pub status: CommentStatus,
    pub attachment_ids: Vec<String>,
    pub media_group_id: Option<String>,
    /// Platform messages this comment was created from.
    pub inbound_refs: Vec<PlatformRef>,
    /// Platform messages the notifier produced for this comment.
    pub outbound_refs: Vec<PlatformRef>,
}

#[derive(Debug, Clone)]
pub struct NewComment {
    pub author_id: String,
    pub record_id: String,
    pub content: String,
    pub media_group_id: Option<String>,
    pub inbound_ref: PlatformRef,
    pub attachment_ids: Vec<String>,
}

#[async_trait]
pub trait CommentStore: Send + Sync {
    async fn create(&self, new: NewComment) -> Result<Comment>;
    async fn get(&self, id: &str) -> Result<Option<Comment>>;
    /// A pending comment on the same record by the same author carrying this
    /// media-group tag, if one exists.
    async fn find_pending_group_comment(
        &self,
        record_id: &str,
        author_id: &str,
        media_group_id: &str,
    ) -> Result<Option<Comment>>;
    async fn append_attachments(&self, id: &str, attachment_ids: &[String]) -> Result<()>;
    async fn set_content(&self, id: &str, content: &str) -> Result<()>;
    async fn add_inbound_ref(&self, id: &str, platform_ref: PlatformRef) -> Result<()>;
    async fn add_outbound_refs(&self, id: &str, chat_id: i64, message_ids: &[i64]) -> Result<()>;
    /// Conditional pending-to-approved transition. Returns whether this call
    /// performed the flip; racing callers observe false.
    async fn approve_pending(&self, id: &str) -> Result<bool>;
    async fn find_by_inbound_ref(&self, chat_id: i64, message_id: i64)
        -> Result<Option<Comment>>;
    async fn find_by_outbound_ref(&self, chat_id: i64, message_id: i64)
        -> Result<Option<Comment>>;
}

/// A two-party consultation record. Read-only from the relay's perspective.
#[derive(Debug, Clone)]
pub struct Consultation {
    pub id: String,
    pub title: String,
    pub doctor_id: Option<String>,
    pub client_id: Option<String>,
    pub active: bool,
}

impl Consultation {
    /// The other participant, when `user_id` is one of the two.
    pub fn counterpart_of(&self, user_id: &str) -> Option<&str> {
        let doctor = self.doctor_id.as_deref()?;
        let client = self.client_id.as_deref()?;
        if user_id == doctor {
            Some(client)
        } else if user_id == client {
            Some(doctor)
        } else {
            None
        }
    }

    pub fn involves(&self, user_id: &str) -> bool {
        self.doctor_id.as_deref() == Some(user_id) || self.client_id.as_deref() == Some(user_id)
    }
}

#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn consultation(&self, id: &str) -> Result<Option<Consultation>>;
    async fn active_consultation_for(&self, user_id: &str) -> Result<Option<Consultation>>;
}

#[derive(Debug, Clone)]
pub struct UserProfile {
    pub id: String,
    pub display_name: String,
    /// The linked platform chat, when the user connected the bot.
    pub chat_id: Option<i64>,
}

#[async_trait]
pub trait UserDirectory: Send + Sync {
    async fn by_platform_id(&self, platform_user_id: i64) -> Result<Option<UserProfile>>;
    async fn profile(&self, user_id: &str) -> Result<Option<UserProfile>>;
}

#[derive(Debug, Clone)]
pub struct StoredAttachment {
    pub id: String,
    pub filename: String,
    pub mime_type: Option<String>,
    pub url: String,
}

#[async_trait]
pub trait MediaStore: Send + Sync {
    async fn create(
        &self,
        record_id: &str,
        filename: &str,
        mime_type: Option<&str>,
        bytes: Bytes,
    ) -> Result<StoredAttachment>;
    async fn delete(&self, id: &str) -> Result<()>;
    async fn get(&self, id: &str) -> Result<Option<StoredAttachment>>;
    async fn read(&self, id: &str) -> Result<Bytes>;
}

/// The external collaborators, bundled for handing to pipeline stages.
#[derive(Clone)]
pub struct Collaborators {
    pub comments: Arc<dyn CommentStore>,
    pub records: Arc<dyn RecordStore>,
    pub users: Arc<dyn UserDirectory>,
    pub media: Arc<dyn MediaStore>,
}

pub mod memory {
    //! In-memory collaborator backend, used by tests and local development.

    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Inner {
        comments: Vec<Comment>,
        comment_seq: u64,
        users: HashMap<String, UserProfile>,
        platform_links: HashMap<i64, String>,
        consultations: HashMap<String, Consultation>,
        attachments: HashMap<String, (StoredAttachment, Bytes)>,
        attachment_seq: u64,
    }

    #[derive(Default)]
    pub struct MemoryStore {
        inner: Mutex<Inner>,
    }

    impl MemoryStore {
        pub fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        pub fn collaborators(self: &Arc<Self>) -> Collaborators {
            Collaborators {
                comments: self.clone(),
                records: self.clone(),
                users: self.clone(),
                media: self.clone(),
            }
        }

        pub fn insert_user(&self, profile: UserProfile, platform_user_id: Option<i64>) {
            let mut inner = self.inner.lock().unwrap();
            if let Some(pid) = platform_user_id {
                inner.platform_links.insert(pid, profile.id.clone());
            }
            inner.users.insert(profile.id.clone(), profile);
        }

        pub fn insert_consultation(&self, consultation: Consultation) {
            let mut inner = self.inner.lock().unwrap();
            inner
                .consultations
                .insert(consultation.id.clone(), consultation);
        }

        pub fn comments_for(&self, record_id: &str) -> Vec<Comment> {
            let inner = self.inner.lock().unwrap();
            inner
                .comments
                .iter()
                .filter(|c| c.record_id == record_id)
                .cloned()
                .collect()
        }

        pub fn attachment_count(&self) -> usize {
            self.inner.lock().unwrap().attachments.len()
        }

        /// Drop a comment, simulating external deletion mid-flight.
        pub fn remove_comment(&self, id: &str) {
            let mut inner = self.inner.lock().unwrap();
            inner.comments.retain(|c| c.id != id);
        }
    }

    #[async_trait]
    impl CommentStore for MemoryStore {
        async fn create(&self, new: NewComment) -> Result<Comment> {
            let mut inner = self.inner.lock().unwrap();
            inner.comment_seq += 1;
            let comment = Comment {
                id: format!("c{}", inner.comment_seq),
                author_id: new.author_id,
                record_id: new.record_id,
                content: new.content,
                status: CommentStatus::Pending,
                attachment_ids: new.attachment_ids,
                media_group_id: new.media_group_id,
                inbound_refs: vec![new.inbound_ref],
                outbound_refs: Vec::new(),
            };
            inner.comments.push(comment.clone());
            Ok(comment)
        }

        async fn get(&self, id: &str) -> Result<Option<Comment>> {
            let inner = self.inner.lock().unwrap();
            Ok(inner.comments.iter().find(|c| c.id == id).cloned())
        }

        async fn find_pending_group_comment(
            &self,
            record_id: &str,
            author_id: &str,
            media_group_id: &str,
        ) -> Result<Option<Comment>> {
            let inner = self.inner.lock().unwrap();
            Ok(inner
                .comments
                .iter()
                .find(|c| {
                    c.record_id == record_id
                        && c.author_id == author_id
                        && c.status == CommentStatus::Pending
                        && c.media_group_id.as_deref() == Some(media_group_id)
                })
                .cloned())
        }

        async fn append_attachments(&self, id: &str, attachment_ids: &[String]) -> Result<()> {
            let mut inner = self.inner.lock().unwrap();
            let comment = inner
                .comments
                .iter_mut()
                .find(|c| c.id == id)
                .ok_or_else(|| RelayError::not_found(format!("comment {id}")))?;
            comment.attachment_ids.extend_from_slice(attachment_ids);
            Ok(())
        }

        async fn set_content(&self, id: &str, content: &str) -> Result<()> {
            let mut inner = self.inner.lock().unwrap();
            let comment = inner
                .comments
                .iter_mut()
                .find(|c| c.id == id)
                .ok_or_else(|| RelayError::not_found(format!("comment {id}")))?;
            comment.content = content.to_string();
            Ok(())
        }

        async fn add_inbound_ref(&self, id: &str, platform_ref: PlatformRef) -> Result<()> {
            let mut inner = self.inner.lock().unwrap();
            let comment = inner
                .comments
                .iter_mut()
                .find(|c| c.id == id)
                .ok_or_else(|| RelayError::not_found(format!("comment {id}")))?;
            if !comment.inbound_refs.contains(&platform_ref) {
                comment.inbound_refs.push(platform_ref);
            }
            Ok(())
        }

        async fn add_outbound_refs(
            &self,
            id: &str,
            chat_id: i64,
            message_ids: &[i64],
        ) -> Result<()> {
            let mut inner = self.inner.lock().unwrap();
            let comment = inner
                .comments
                .iter_mut()
                .find(|c| c.id == id)
                .ok_or_else(|| RelayError::not_found(format!("comment {id}")))?;
            for message_id in message_ids {
                let platform_ref = PlatformRef {
                    chat_id,
                    message_id: *message_id,
                };
                if !comment.outbound_refs.contains(&platform_ref) {
                    comment.outbound_refs.push(platform_ref);
                }
            }
            Ok(())
        }

        async fn approve_pending(&self, id: &str) -> Result<bool> {
            let mut inner = self.inner.lock().unwrap();
            let comment = inner
                .comments
                .iter_mut()
                .find(|c| c.id == id)
                .ok_or_else(|| RelayError::not_found(format!("comment {id}")))?;
            if comment.status == CommentStatus::Pending {
                comment.status = CommentStatus::Approved;
                Ok(true)
            } else {
                Ok(false)
            }
        }

        async fn find_by_inbound_ref(
            &self,
            chat_id: i64,
            message_id: i64,
        ) -> Result<Option<Comment>> {
            let wanted = PlatformRef {
                chat_id,
                message_id,
            };
            let inner = self.inner.lock().unwrap();
            Ok(inner
                .comments
                .iter()
                .find(|c| c.inbound_refs.contains(&wanted))
                .cloned())
        }

        async fn find_by_outbound_ref(
            &self,
            chat_id: i64,
            message_id: i64,
        ) -> Result<Option<Comment>> {
            let wanted = PlatformRef {
                chat_id,
                message_id,
            };
            let inner = self.inner.lock().unwrap();
            Ok(inner
                .comments
                .iter()
                .find(|c| c.outbound_refs.contains(&wanted))
                .cloned())
        }
    }

    #[async_trait]
    impl RecordStore for MemoryStore {
        async fn consultation(&self, id: &str) -> Result<Option<Consultation>> {
            let inner = self.inner.lock().unwrap();
            Ok(inner.consultations.get(id).cloned())
        }

        async fn active_consultation_for(&self, user_id: &str) -> Result<Option<Consultation>> {
            let inner = self.inner.lock().unwrap();
            Ok(inner
                .consultations
                .values()
                .find(|c| c.active && c.involves(user_id))
                .cloned())
        }
    }

    #[async_trait]
    impl UserDirectory for MemoryStore {
        async fn by_platform_id(&self, platform_user_id: i64) -> Result<Option<UserProfile>> {
            let inner = self.inner.lock().unwrap();
            let user_id = match inner.platform_links.get(&platform_user_id) {
                Some(id) => id.clone(),
                None => return Ok(None),
            };
            Ok(inner.users.get(&user_id).cloned())
        }

        async fn profile(&self, user_id: &str) -> Result<Option<UserProfile>> {
            let inner = self.inner.lock().unwrap();
            Ok(inner.users.get(user_id).cloned())
        }
    }

    #[async_trait]
    impl MediaStore for MemoryStore {
        async fn create(
            &self,
            record_id: &str,
            filename: &str,
            mime_type: Option<&str>,
            bytes: Bytes,
        ) -> Result<StoredAttachment> {
            let mut inner = self.inner.lock().unwrap();
            inner.attachment_seq += 1;
            let id = format!("a{}", inner.attachment_seq);
            let attachment = StoredAttachment {
                id: id.clone(),
                filename: filename.to_string(),
                mime_type: mime_type.map(|s| s.to_string()),
                url: format!("memory://{record_id}/{id}/{filename}"),
            };
            inner.attachments.insert(id, (attachment.clone(), bytes));
            Ok(attachment)
        }

        async fn delete(&self, id: &str) -> Result<()> {
            let mut inner = self.inner.lock().unwrap();
            inner.attachments.remove(id);
            Ok(())
        }

        async fn get(&self, id: &str) -> Result<Option<StoredAttachment>> {
            let inner = self.inner.lock().unwrap();
            Ok(inner.attachments.get(id).map(|(a, _)| a.clone()))
        }

        async fn read(&self, id: &str) -> Result<Bytes> {
            let inner = self.inner.lock().unwrap();
            inner
                .attachments
                .get(id)
                .map(|(_, b)| b.clone())
                .ok_or_else(|| RelayError::not_found(format!("attachment {id}")))
        }
    }
}
