use thiserror::Error;

/// Failure taxonomy for the relay core.
///
/// Retryability drives queue behavior: transient failures leave the row in
/// place with an incremented retry count, permanent failures dead-letter it.
#[derive(Debug, Error)]
pub enum RelayError {
    /// Network-level failure (DNS, TLS, timeout) before a platform response
    /// was obtained.
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// The platform returned a structured failure (`ok: false`, non-2xx, or
    /// a body that failed to parse).
    #[error("platform api error {code}: {description}")]
    Api { code: i64, description: String },

    /// A stored payload or request is malformed beyond repair.
    #[error("validation error: {0}")]
    Validation(String),

    /// A referenced comment, user, or record no longer exists.
    #[error("not found: {0}")]
    NotFound(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Collaborator or queue failure outside the taxonomy above.
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<anyhow::Error> for RelayError {
    fn from(err: anyhow::Error) -> Self {
        match err.downcast::<sqlx::Error>() {
            Ok(db_err) => Self::Database(db_err),
            Err(err) => Self::Internal(err.to_string()),
        }
    }
}

impl RelayError {
    pub fn api(code: i64, description: impl Into<String>) -> Self {
        Self::Api {
            code,
            description: description.into(),
        }
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    /// getUpdates returned 409: another consumer (an active webhook) owns the
    /// update stream. The caller must stop polling rather than retry.
    pub fn is_poll_conflict(&self) -> bool {
        matches!(self, Self::Api { code: 409, .. })
    }

    /// The recipient blocked the bot. Permanent for this chat; surfaced so
    /// the caller can stop scheduling sends to it.
    pub fn is_recipient_unreachable(&self) -> bool {
        matches!(self, Self::Api { code: 403, .. })
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport(_) | Self::Database(_) | Self::Internal(_) => true,
            Self::Api { code, .. } => *code != 409 && *code != 403,
            Self::Validation(_) | Self::NotFound(_) => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, RelayError>;
