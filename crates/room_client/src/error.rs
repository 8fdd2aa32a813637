use std::{path::PathBuf, time::Duration};

use shared::{domain::MessageId, error::ApiError};
use thiserror::Error;

use crate::session::SessionState;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PushFailure {
    #[error("server rejected {event}: {error}")]
    Rejected { event: &'static str, error: ApiError },
    #[error("{event} acknowledgement timed out after {after:?}")]
    TimedOut { event: &'static str, after: Duration },
    #[error("transport failed: {0}")]
    Transport(String),
    #[error("invalid acknowledgement payload: {0}")]
    InvalidReply(String),
    #[error("session left before acknowledgement")]
    Cancelled,
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session is not joined (state: {0:?})")]
    NotJoined(SessionState),
    #[error("a join is already in progress")]
    JoinInProgress,
    #[error("session is already joined")]
    AlreadyJoined,
    #[error("message is empty")]
    EmptyMessage,
    #[error("join failed: {0}")]
    JoinFailed(PushFailure),
    #[error("no local message {0}")]
    UnknownLocalRef(crate::types::LocalRef),
    #[error("local message {0} has not failed")]
    NotFailed(crate::types::LocalRef),
    #[error(transparent)]
    Attachment(#[from] AttachmentError),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeleteRejected {
    #[error("cannot delete {0}: session is not joined")]
    NotJoined(MessageId),
    #[error("cannot delete {0}: no such message")]
    NotFound(MessageId),
    #[error("cannot delete {0}: not the author")]
    NotAuthor(MessageId),
    #[error("cannot delete {0}: message is not confirmed yet")]
    NotConfirmed(MessageId),
    #[error("delete of {message_id} failed: {failure}")]
    Failed {
        message_id: MessageId,
        failure: PushFailure,
    },
}

impl DeleteRejected {
    pub fn message_id(&self) -> &MessageId {
        match self {
            Self::NotJoined(id)
            | Self::NotFound(id)
            | Self::NotAuthor(id)
            | Self::NotConfirmed(id) => id,
            Self::Failed { message_id, .. } => message_id,
        }
    }
}

#[derive(Debug, Error)]
pub enum AttachmentError {
    #[error("unreadable file {path}: {source}")]
    UnreadableFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("attachment {file_name} is {size} bytes, limit is {limit}")]
    TooLarge {
        file_name: String,
        size: u64,
        limit: u64,
    },
    #[error("invalid attachment encoding: {0}")]
    InvalidEncoding(String),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}
